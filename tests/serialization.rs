use std::collections::BTreeSet;
use std::time::Duration;

use test_log::test;

use netbdd::header_space::HeaderSpace;
use netbdd::ip::{Ip, Prefix};
use netbdd::params::{NodeSpecifier, ReachabilityParameters};
use netbdd::settings::Settings;
use netbdd::{Flow, FlowDisposition};

#[test]
fn test_settings_round_trip() {
    let settings = Settings::default()
        .with_workers(4)
        .with_timeout(Duration::from_millis(1500))
        .with_halt_on_first_failure(true);
    let json = serde_json::to_string(&settings).unwrap();
    assert!(json.contains("\"haltOnFirstFailure\":true"));
    let back: Settings = serde_json::from_str(&json).unwrap();
    assert_eq!(back, settings);
}

#[test]
fn test_settings_defaults_fill_in() {
    let settings: Settings = serde_json::from_str(r#"{"workers": 2, "timeout": 250}"#).unwrap();
    assert_eq!(settings.workers, 2);
    assert_eq!(settings.timeout(), Some(Duration::from_millis(250)));
    assert_eq!(settings.max_chunk_size, Settings::default().max_chunk_size);
    assert!(settings.specialize);
}

#[test]
fn test_flow_round_trip() {
    let flow = Flow {
        ingress_node: "r1".to_string(),
        ingress_interface: Some("eth0".to_string()),
        src_ip: Ip::from_octets(10, 0, 0, 1),
        dst_ip: Ip::from_octets(10, 0, 0, 5),
        ip_protocol: 6,
        dst_port: 443,
        ..Flow::default()
    }
    .with_tag("BASE");
    let json = serde_json::to_string(&flow).unwrap();
    assert!(json.contains("\"dstIp\":\"10.0.0.5\""));
    let back: Flow = serde_json::from_str(&json).unwrap();
    assert_eq!(back, flow);
}

#[test]
fn test_parameters_from_json() {
    let raw: ReachabilityParameters = serde_json::from_str(
        r#"{
            "actions": ["ACCEPTED", "NO_ROUTE"],
            "finalNodes": {"Names": ["core"]},
            "requiredTransit": ["border"],
            "specialize": false
        }"#,
    )
    .unwrap();
    assert_eq!(
        raw.actions,
        BTreeSet::from([FlowDisposition::Accepted, FlowDisposition::NoRoute])
    );
    assert_eq!(raw.final_nodes, NodeSpecifier::names(["core"]));
    assert_eq!(raw.required_transit, BTreeSet::from(["border".to_string()]));
    assert_eq!(raw.specialize, Some(false));
    assert_eq!(raw.header_space, HeaderSpace::Any);

    let raw = ReachabilityParameters {
        header_space: HeaderSpace::builder()
            .dst_ips(Prefix::parse("10.0.0.0/8").unwrap())
            .build(),
        ..raw
    };
    let json = serde_json::to_string(&raw).unwrap();
    let back: ReachabilityParameters = serde_json::from_str(&json).unwrap();
    assert_eq!(back, raw);
}
