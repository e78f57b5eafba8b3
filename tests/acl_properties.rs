//! The compiled form of an ACL agrees with concrete first-match evaluation.

use std::collections::BTreeMap;

use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use netbdd::acl::{AclLine, AclLineMatchExpr, IpAccessList, LineAction};
use netbdd::compiler::{AclCompiler, SourceManager};
use netbdd::header_space::{HeaderSpace, SubRange};
use netbdd::ip::{Ip, Prefix};
use netbdd::packet::BddPacket;
use netbdd::reference::Ref;
use netbdd::Flow;

const PREFIXES: [&str; 4] = ["10.0.0.0/8", "10.1.0.0/16", "192.168.0.0/16", "0.0.0.0/1"];

fn leaf() -> impl Strategy<Value = AclLineMatchExpr> {
    prop_oneof![
        Just(AclLineMatchExpr::True),
        Just(AclLineMatchExpr::False),
        (0..PREFIXES.len()).prop_map(|i| {
            let prefix = Prefix::parse(PREFIXES[i]).unwrap();
            AclLineMatchExpr::header_space(HeaderSpace::builder().dst_ips(prefix).build())
        }),
        prop::sample::select(vec![1u8, 6, 17])
            .prop_map(|p| AclLineMatchExpr::header_space(HeaderSpace::builder().ip_protocols([p]).build())),
        (0u32..100, 0u32..100).prop_map(|(a, b)| {
            let range = SubRange::new(a.min(b), a.max(b));
            AclLineMatchExpr::header_space(HeaderSpace::builder().dst_ports([range]).build())
        }),
        prop::sample::select(vec!["eth0", "eth1"]).prop_map(|i| AclLineMatchExpr::src_interfaces([i])),
        Just(AclLineMatchExpr::permitted_by("WEB")),
    ]
}

fn expr() -> impl Strategy<Value = AclLineMatchExpr> {
    leaf().prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            inner.clone().prop_map(AclLineMatchExpr::negate),
            vec(inner.clone(), 1..3).prop_map(AclLineMatchExpr::And),
            vec(inner, 1..3).prop_map(AclLineMatchExpr::Or),
        ]
    })
}

fn acl() -> impl Strategy<Value = IpAccessList> {
    vec((expr(), any::<bool>()), 0..6).prop_map(|lines| {
        let lines = lines
            .into_iter()
            .enumerate()
            .map(|(i, (e, permit))| {
                let action = if permit { LineAction::Permit } else { LineAction::Deny };
                AclLine::new(format!("line-{}", i), e, action)
            })
            .collect();
        IpAccessList::new("A", lines)
    })
}

fn flow() -> impl Strategy<Value = (Flow, &'static str)> {
    let dst = prop::sample::select(vec![
        Ip::from_octets(10, 0, 0, 1),
        Ip::from_octets(10, 1, 2, 3),
        Ip::from_octets(192, 168, 5, 5),
        Ip::from_octets(200, 0, 0, 1),
    ]);
    let interface = prop::sample::select(vec!["eth0", "eth1"]);
    (dst, prop::sample::select(vec![1u8, 6, 17]), 0u16..120, interface).prop_map(|(dst, proto, port, i)| {
        let flow = Flow {
            ingress_node: "r1".to_string(),
            src_ip: Ip::from_octets(1, 1, 1, 1),
            dst_ip: dst,
            ip_protocol: proto,
            dst_port: port,
            ..Flow::default()
        };
        (flow, i)
    })
}

fn web() -> IpAccessList {
    IpAccessList::new(
        "WEB",
        vec![AclLine::permit(
            "http",
            AclLineMatchExpr::header_space(
                HeaderSpace::builder()
                    .ip_protocols([6])
                    .dst_ports([SubRange::singleton(80)])
                    .build(),
            ),
        )],
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_acl_matches_first_match(acl in acl(), flows in vec(flow(), 1..8)) {
        let acls = BTreeMap::from([("A".to_string(), acl.clone()), ("WEB".to_string(), web())]);
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let sources = SourceManager::new("r1", ["eth0", "eth1"]).unwrap();
        let mut compiler = AclCompiler::new(&packet, "r1", &acls, &sources).unwrap();
        let compiled = compiler.compile("A").unwrap();

        // First-match lines partition the permit and deny sets.
        prop_assert_eq!(bdd.apply_and(compiled.permit, compiled.deny), Ref::ZERO);
        prop_assert_eq!(bdd.apply_or(compiled.permit, compiled.deny), Ref::ONE);

        for (flow, interface) in flows {
            let point = bdd.apply_and(
                packet.flow_predicate(&flow),
                sources.entered_through(&packet, interface).unwrap(),
            );
            let expected = acl.filter("r1", &flow, Some(interface), &acls).unwrap();

            let first = compiled.lines.iter().position(|line| bdd.and_sat(line.reached, point));
            prop_assert_eq!(first, expected.line);
            prop_assert_eq!(bdd.and_sat(compiled.permit, point), expected.action == LineAction::Permit);
        }
    }
}
