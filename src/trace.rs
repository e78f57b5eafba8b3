//! Concrete replay of flows through the network model.
//!
//! The tracer follows a single packet hop by hop, taking every equal-cost
//! branch, and reports the disposition of each path. It shares no code with
//! the symbolic encoding and is used to confirm witnesses.
//!
//! Source NAT may pick any pool address, so each address is a separate branch
//! (at most [`MAX_NAT_BRANCHES`] per rule).

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::acl::LineAction;
use crate::compiler::check_references;
use crate::error::Result;
use crate::flow::{Flow, FlowDisposition};
use crate::ip::Ip;
use crate::model::{Configuration, DataPlane, Edge, ForwardingAnalysis, Interface, Topology};

/// One device on a path.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Hop {
    pub node: String,
    /// Interface the packet entered through, `None` if originated here.
    pub ingress: Option<String>,
    /// Interface the packet left through, if any.
    pub egress: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Trace {
    pub hops: Vec<Hop>,
    pub disposition: FlowDisposition,
}

impl Trace {
    /// Node where the packet met its fate.
    pub fn final_node(&self) -> Option<&str> {
        self.hops.last().map(|h| h.node.as_str())
    }
}

pub const MAX_NAT_BRANCHES: u32 = 64;

pub struct FlowTracer<'a> {
    configs: &'a BTreeMap<String, Configuration>,
    fa: &'a dyn ForwardingAnalysis,
    edges: BTreeSet<Edge>,
}

impl<'a> FlowTracer<'a> {
    /// Fails if some device has undefined or cyclic ACL references.
    pub fn new(
        configs: &'a BTreeMap<String, Configuration>,
        data_plane: &'a dyn DataPlane,
        topology: &Topology,
    ) -> Result<Self> {
        for (hostname, config) in configs {
            check_references(hostname, &config.acls)?;
        }
        let active = |node: &str, interface: &str| {
            configs
                .get(node)
                .and_then(|c| c.interfaces.get(interface))
                .is_some_and(|i| i.active)
        };
        let edges = topology
            .edges()
            .filter(|e| active(&e.tail.node, &e.tail.interface) && active(&e.head.node, &e.head.interface))
            .cloned()
            .collect();
        Ok(Self {
            configs,
            fa: data_plane.forwarding_analysis(),
            edges,
        })
    }

    /// Every distinct path the flow can take from its ingress point.
    pub fn trace(&self, flow: &Flow) -> Vec<Trace> {
        let mut traces = Vec::new();
        let node = flow.ingress_node.as_str();
        match (&flow.ingress_interface, &flow.ingress_vrf) {
            (Some(interface), _) => self.enter(node, interface, flow.clone(), Vec::new(), &mut traces),
            (None, Some(vrf)) => {
                let hop = Hop {
                    node: node.to_string(),
                    ingress: None,
                    egress: None,
                };
                self.forward(node, vrf, None, flow.clone(), vec![hop], &mut traces);
            }
            (None, None) => debug!("Flow {} has no ingress point", flow),
        }
        let mut unique: Vec<Trace> = Vec::with_capacity(traces.len());
        for trace in traces {
            if !unique.contains(&trace) {
                unique.push(trace);
            }
        }
        unique
    }

    fn permits(&self, config: &Configuration, acl: &Option<String>, flow: &Flow, src: Option<&str>) -> bool {
        match acl.as_ref().and_then(|name| config.acls.get(name)) {
            // References were checked in `new`.
            Some(acl) => acl
                .filter(&config.hostname, flow, src, &config.acls)
                .is_ok_and(|r| r.action == LineAction::Permit),
            None => true,
        }
    }

    fn enter(&self, node: &str, interface: &str, flow: Flow, mut hops: Vec<Hop>, out: &mut Vec<Trace>) {
        let Some(config) = self.configs.get(node) else {
            return;
        };
        let Some(iface) = config.interfaces.get(interface) else {
            return;
        };

        let hop = Hop {
            node: node.to_string(),
            ingress: Some(interface.to_string()),
            egress: None,
        };
        let looped = hops.iter().any(|h| h.node == hop.node && h.ingress == hop.ingress);
        hops.push(hop);
        if looped {
            out.push(Trace {
                hops,
                disposition: FlowDisposition::Loop,
            });
            return;
        }

        if !self.permits(config, &iface.incoming_filter, &flow, Some(interface)) {
            out.push(Trace {
                hops,
                disposition: FlowDisposition::DeniedIn,
            });
            return;
        }
        self.forward(node, &iface.vrf, Some(interface), flow, hops, out);
    }

    fn forward(&self, node: &str, vrf: &str, src: Option<&str>, flow: Flow, hops: Vec<Hop>, out: &mut Vec<Trace>) {
        let Some(config) = self.configs.get(node) else {
            return;
        };
        let dst = flow.dst_ip;
        let done = |disposition, hops: Vec<Hop>, out: &mut Vec<Trace>| out.push(Trace { hops, disposition });

        if self.fa.accepted_ips(node, vrf).contains(dst) {
            return done(FlowDisposition::Accepted, hops, out);
        }
        if self.fa.null_routed_ips(node, vrf).contains(dst) {
            return done(FlowDisposition::NullRouted, hops, out);
        }
        if !self.fa.routable_ips(node, vrf).contains(dst) {
            return done(FlowDisposition::NoRoute, hops, out);
        }

        for iface in config.interfaces_in_vrf(vrf).filter(|i| i.active) {
            let dispositions = [
                (
                    self.fa.neighbor_unreachable(node, vrf, &iface.name),
                    FlowDisposition::NeighborUnreachable,
                ),
                (
                    self.fa.delivered_to_subnet(node, vrf, &iface.name),
                    FlowDisposition::DeliveredToSubnet,
                ),
                (self.fa.exits_network(node, vrf, &iface.name), FlowDisposition::ExitsNetwork),
            ];
            for (space, disposition) in dispositions {
                if !space.contains(dst) {
                    continue;
                }
                let mut hops = hops.clone();
                if let Some(last) = hops.last_mut() {
                    last.egress = Some(iface.name.clone());
                }
                if self.permits(config, &iface.outgoing_filter, &flow, src) {
                    done(disposition, hops, out);
                } else {
                    done(FlowDisposition::DeniedOut, hops, out);
                }
            }
        }

        for edge in self.edges.iter().filter(|e| e.tail.node == node) {
            let Some(iface) = config.interfaces.get(&edge.tail.interface) else {
                continue;
            };
            if iface.vrf != vrf || !self.fa.arp_true_edge(edge).contains(dst) {
                continue;
            }
            let mut hops = hops.clone();
            if let Some(last) = hops.last_mut() {
                last.egress = Some(iface.name.clone());
            }
            for translated in self.source_nat(config, iface, &flow, src) {
                if !self.permits(config, &iface.outgoing_filter, &translated, src) {
                    done(FlowDisposition::DeniedOut, hops.clone(), out);
                    continue;
                }
                self.enter(&edge.head.node, &edge.head.interface, translated, hops.clone(), out);
            }
        }
    }

    /// The first matching rule wins and yields one flow per pool address.
    fn source_nat(&self, config: &Configuration, iface: &Interface, flow: &Flow, src: Option<&str>) -> Vec<Flow> {
        let Some(rule) = iface.source_nats.iter().find(|r| self.permits(config, &r.acl, flow, src)) else {
            return vec![flow.clone()];
        };
        let start = rule.pool_start.as_u32();
        let end = rule.pool_end.as_u32().min(start.saturating_add(MAX_NAT_BRANCHES - 1));
        (start..=end)
            .map(|bits| Flow {
                src_ip: Ip::new(bits),
                ..flow.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::acl::{AclLine, AclLineMatchExpr, IpAccessList};
    use crate::error::Error;
    use crate::header_space::HeaderSpace;
    use crate::ip::Prefix;
    use crate::model::{NodeInterfacePair, SourceNat, StaticDataPlane, DEFAULT_VRF};

    fn flow(dst: Ip) -> Flow {
        Flow {
            ingress_node: "a".to_string(),
            ingress_interface: Some("lan".to_string()),
            src_ip: Ip::from_octets(10, 0, 0, 1),
            dst_ip: dst,
            ..Flow::default()
        }
    }

    #[test]
    fn test_trace_across_nat_and_filter() {
        let pool_only = IpAccessList::new(
            "pool-only",
            vec![AclLine::permit(
                "p",
                AclLineMatchExpr::header_space(HeaderSpace::builder().src_ips(Ip::from_octets(1, 1, 1, 1)).build()),
            )],
        );
        let a = Configuration::new("a")
            .with_interface(Interface::new("lan"))
            .with_interface(Interface::new("e0").with_source_nat(SourceNat {
                acl: None,
                pool_start: Ip::from_octets(1, 1, 1, 1),
                pool_end: Ip::from_octets(1, 1, 1, 1),
            }));
        let b = Configuration::new("b")
            .with_interface(Interface::new("e0").with_incoming_filter("pool-only"))
            .with_acl(pool_only);
        let configs = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);

        let mut topology = Topology::default();
        topology.connect(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let ab = Edge::new(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let dp = StaticDataPlane::new()
            .with_route(DEFAULT_VRF, &ab, Prefix::parse("2.0.0.0/8").unwrap())
            .with_accepted("b", DEFAULT_VRF, Prefix::parse("2.0.0.0/8").unwrap());

        let tracer = FlowTracer::new(&configs, &dp, &topology).unwrap();
        let traces = tracer.trace(&flow(Ip::from_octets(2, 0, 0, 1)));
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].disposition, FlowDisposition::Accepted);
        assert_eq!(traces[0].final_node(), Some("b"));
        assert_eq!(traces[0].hops[0].egress.as_deref(), Some("e0"));

        let traces = tracer.trace(&flow(Ip::from_octets(3, 0, 0, 1)));
        assert_eq!(traces[0].disposition, FlowDisposition::NoRoute);
    }

    #[test]
    fn test_loop_detection() {
        let a = Configuration::new("a").with_interface(Interface::new("lan")).with_interface(Interface::new("e0"));
        let b = Configuration::new("b").with_interface(Interface::new("e0"));
        let configs = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);
        let mut topology = Topology::default();
        topology.connect(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let ab = Edge::new(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let dp = StaticDataPlane::new()
            .with_route(DEFAULT_VRF, &ab, Prefix::parse("2.0.0.0/8").unwrap())
            .with_route(DEFAULT_VRF, &ab.reverse(), Prefix::parse("2.0.0.0/8").unwrap());

        let tracer = FlowTracer::new(&configs, &dp, &topology).unwrap();
        let traces = tracer.trace(&flow(Ip::from_octets(2, 0, 0, 1)));
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].disposition, FlowDisposition::Loop);
    }

    #[test]
    fn test_nat_pool_branches() {
        let second_only = IpAccessList::new(
            "second-only",
            vec![AclLine::permit(
                "p",
                AclLineMatchExpr::header_space(HeaderSpace::builder().src_ips(Ip::from_octets(1, 1, 1, 2)).build()),
            )],
        );
        let a = Configuration::new("a")
            .with_interface(Interface::new("lan"))
            .with_interface(Interface::new("e0").with_source_nat(SourceNat {
                acl: None,
                pool_start: Ip::from_octets(1, 1, 1, 1),
                pool_end: Ip::from_octets(1, 1, 1, 3),
            }));
        let b = Configuration::new("b")
            .with_interface(Interface::new("e0").with_incoming_filter("second-only"))
            .with_acl(second_only);
        let configs = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);

        let mut topology = Topology::default();
        topology.connect(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let ab = Edge::new(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let dp = StaticDataPlane::new()
            .with_route(DEFAULT_VRF, &ab, Prefix::parse("2.0.0.0/8").unwrap())
            .with_accepted("b", DEFAULT_VRF, Prefix::parse("2.0.0.0/8").unwrap());

        let tracer = FlowTracer::new(&configs, &dp, &topology).unwrap();
        let traces = tracer.trace(&flow(Ip::from_octets(2, 0, 0, 1)));
        let dispositions: Vec<FlowDisposition> = traces.iter().map(|t| t.disposition).collect();
        assert_eq!(dispositions, vec![FlowDisposition::DeniedIn, FlowDisposition::Accepted]);
    }

    #[test]
    fn test_cyclic_acls_rejected() {
        let x = IpAccessList::new("X", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("Y"))]);
        let y = IpAccessList::new("Y", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("X"))]);
        let a = Configuration::new("a")
            .with_interface(Interface::new("lan").with_incoming_filter("X"))
            .with_acl(x)
            .with_acl(y);
        let configs = BTreeMap::from([("a".to_string(), a)]);
        let dp = StaticDataPlane::new();
        let topology = Topology::default();

        let err = FlowTracer::new(&configs, &dp, &topology).err();
        assert!(matches!(err, Some(Error::CyclicAclReference { hostname, .. }) if hostname == "a"));
    }
}
