//! Vendor-independent network model consumed by the encoder.
//!
//! Configurations, topology and the [`ForwardingAnalysis`] collaborator are
//! inputs: this crate never computes routes. [`StaticDataPlane`] is an
//! in-memory forwarding analysis for callers that compute forwarding elsewhere.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::acl::IpAccessList;
use crate::ip::{Ip, IpSpace, Prefix};

pub const DEFAULT_VRF: &str = "default";

/// Source NAT rule: packets matching `acl` (all packets if `None`) get their
/// source address rewritten into `pool_start..=pool_end`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceNat {
    pub acl: Option<String>,
    pub pool_start: Ip,
    pub pool_end: Ip,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub vrf: String,
    pub active: bool,
    pub prefixes: Vec<Prefix>,
    pub incoming_filter: Option<String>,
    pub outgoing_filter: Option<String>,
    /// Applied in order, the first matching rule wins.
    pub source_nats: Vec<SourceNat>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vrf: DEFAULT_VRF.to_string(),
            active: true,
            prefixes: Vec::new(),
            incoming_filter: None,
            outgoing_filter: None,
            source_nats: Vec::new(),
        }
    }

    pub fn with_vrf(mut self, vrf: impl Into<String>) -> Self {
        self.vrf = vrf.into();
        self
    }

    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefixes.push(prefix);
        self
    }

    pub fn with_incoming_filter(mut self, acl: impl Into<String>) -> Self {
        self.incoming_filter = Some(acl.into());
        self
    }

    pub fn with_outgoing_filter(mut self, acl: impl Into<String>) -> Self {
        self.outgoing_filter = Some(acl.into());
        self
    }

    pub fn with_source_nat(mut self, nat: SourceNat) -> Self {
        self.source_nats.push(nat);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// One device.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub hostname: String,
    pub interfaces: BTreeMap<String, Interface>,
    pub acls: BTreeMap<String, IpAccessList>,
    /// Named IP spaces, usable in location and IP specifiers.
    pub ip_spaces: BTreeMap<String, IpSpace>,
    /// VRFs without interfaces still exist as origination points.
    pub vrfs: BTreeSet<String>,
}

impl Configuration {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            interfaces: BTreeMap::new(),
            acls: BTreeMap::new(),
            ip_spaces: BTreeMap::new(),
            vrfs: BTreeSet::from([DEFAULT_VRF.to_string()]),
        }
    }

    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.vrfs.insert(interface.vrf.clone());
        self.interfaces.insert(interface.name.clone(), interface);
        self
    }

    pub fn with_acl(mut self, acl: IpAccessList) -> Self {
        self.acls.insert(acl.name.clone(), acl);
        self
    }

    pub fn with_ip_space(mut self, name: impl Into<String>, space: IpSpace) -> Self {
        self.ip_spaces.insert(name.into(), space);
        self
    }

    pub fn with_vrf(mut self, vrf: impl Into<String>) -> Self {
        self.vrfs.insert(vrf.into());
        self
    }

    pub fn interfaces_in_vrf<'a>(&'a self, vrf: &'a str) -> impl Iterator<Item = &'a Interface> + 'a {
        self.interfaces.values().filter(move |i| i.vrf == vrf)
    }

    pub fn active_interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values().filter(|i| i.active)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeInterfacePair {
    pub node: String,
    pub interface: String,
}

impl NodeInterfacePair {
    pub fn new(node: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            interface: interface.into(),
        }
    }
}

impl Display for NodeInterfacePair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.node, self.interface)
    }
}

/// Directed layer-3 adjacency: packets leave `tail` and enter `head`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub tail: NodeInterfacePair,
    pub head: NodeInterfacePair,
}

impl Edge {
    pub fn new(tail: NodeInterfacePair, head: NodeInterfacePair) -> Self {
        Self { tail, head }
    }

    pub fn reverse(&self) -> Self {
        Self::new(self.head.clone(), self.tail.clone())
    }
}

impl Display for Edge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.tail, self.head)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    edges: BTreeSet<Edge>,
}

impl Topology {
    pub fn new(edges: impl IntoIterator<Item = Edge>) -> Self {
        Self {
            edges: edges.into_iter().collect(),
        }
    }

    pub fn add(&mut self, edge: Edge) {
        self.edges.insert(edge);
    }

    /// Add the edge in both directions.
    pub fn connect(&mut self, a: NodeInterfacePair, b: NodeInterfacePair) {
        let edge = Edge::new(a, b);
        self.edges.insert(edge.reverse());
        self.edges.insert(edge);
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Destination-IP view of a computed data plane.
///
/// Every method returns the destination addresses for which the named
/// behavior happens; unknown keys yield [`IpSpace::Empty`].
pub trait ForwardingAnalysis: Send + Sync {
    /// Destinations the VRF accepts (its own addresses).
    fn accepted_ips(&self, node: &str, vrf: &str) -> IpSpace;
    /// Destinations with a route, null routes included.
    fn routable_ips(&self, node: &str, vrf: &str) -> IpSpace;
    fn null_routed_ips(&self, node: &str, vrf: &str) -> IpSpace;
    /// Destinations forwarded out of `edge.tail` for which the neighbor at
    /// `edge.head` answers ARP.
    fn arp_true_edge(&self, edge: &Edge) -> IpSpace;
    fn neighbor_unreachable(&self, node: &str, vrf: &str, interface: &str) -> IpSpace;
    fn delivered_to_subnet(&self, node: &str, vrf: &str, interface: &str) -> IpSpace;
    fn exits_network(&self, node: &str, vrf: &str, interface: &str) -> IpSpace;
}

pub trait DataPlane {
    fn forwarding_analysis(&self) -> &dyn ForwardingAnalysis;
}

type VrfKey = (String, String);
type InterfaceKey = (String, String, String);

/// Forwarding analysis backed by explicit IP spaces.
#[derive(Debug, Clone, Default)]
pub struct StaticDataPlane {
    accepted: BTreeMap<VrfKey, IpSpace>,
    routable: BTreeMap<VrfKey, IpSpace>,
    null_routed: BTreeMap<VrfKey, IpSpace>,
    arp_true: BTreeMap<Edge, IpSpace>,
    neighbor_unreachable: BTreeMap<InterfaceKey, IpSpace>,
    delivered_to_subnet: BTreeMap<InterfaceKey, IpSpace>,
    exits_network: BTreeMap<InterfaceKey, IpSpace>,
}

fn vrf_key(node: &str, vrf: &str) -> VrfKey {
    (node.to_string(), vrf.to_string())
}

fn interface_key(node: &str, vrf: &str, interface: &str) -> InterfaceKey {
    (node.to_string(), vrf.to_string(), interface.to_string())
}

fn add_space<K: Ord>(map: &mut BTreeMap<K, IpSpace>, key: K, space: IpSpace) {
    let merged = match map.remove(&key) {
        Some(existing) => IpSpace::union([existing, space]),
        None => space,
    };
    map.insert(key, merged);
}

impl StaticDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accepted(mut self, node: &str, vrf: &str, space: impl Into<IpSpace>) -> Self {
        add_space(&mut self.accepted, vrf_key(node, vrf), space.into());
        self
    }

    /// A route for `space` out of `edge`; the destinations also become routable.
    pub fn with_route(mut self, vrf: &str, edge: &Edge, space: impl Into<IpSpace>) -> Self {
        let space = space.into();
        add_space(&mut self.routable, vrf_key(&edge.tail.node, vrf), space.clone());
        add_space(&mut self.arp_true, edge.clone(), space);
        self
    }

    pub fn with_null_route(mut self, node: &str, vrf: &str, space: impl Into<IpSpace>) -> Self {
        let space = space.into();
        add_space(&mut self.routable, vrf_key(node, vrf), space.clone());
        add_space(&mut self.null_routed, vrf_key(node, vrf), space);
        self
    }

    pub fn with_neighbor_unreachable(
        mut self,
        node: &str,
        vrf: &str,
        interface: &str,
        space: impl Into<IpSpace>,
    ) -> Self {
        let space = space.into();
        add_space(&mut self.routable, vrf_key(node, vrf), space.clone());
        add_space(&mut self.neighbor_unreachable, interface_key(node, vrf, interface), space);
        self
    }

    pub fn with_delivered_to_subnet(
        mut self,
        node: &str,
        vrf: &str,
        interface: &str,
        space: impl Into<IpSpace>,
    ) -> Self {
        let space = space.into();
        add_space(&mut self.routable, vrf_key(node, vrf), space.clone());
        add_space(&mut self.delivered_to_subnet, interface_key(node, vrf, interface), space);
        self
    }

    pub fn with_exits_network(mut self, node: &str, vrf: &str, interface: &str, space: impl Into<IpSpace>) -> Self {
        let space = space.into();
        add_space(&mut self.routable, vrf_key(node, vrf), space.clone());
        add_space(&mut self.exits_network, interface_key(node, vrf, interface), space);
        self
    }
}

fn lookup<K: Ord>(map: &BTreeMap<K, IpSpace>, key: &K) -> IpSpace {
    map.get(key).cloned().unwrap_or(IpSpace::Empty)
}

impl ForwardingAnalysis for StaticDataPlane {
    fn accepted_ips(&self, node: &str, vrf: &str) -> IpSpace {
        lookup(&self.accepted, &vrf_key(node, vrf))
    }

    fn routable_ips(&self, node: &str, vrf: &str) -> IpSpace {
        lookup(&self.routable, &vrf_key(node, vrf))
    }

    fn null_routed_ips(&self, node: &str, vrf: &str) -> IpSpace {
        lookup(&self.null_routed, &vrf_key(node, vrf))
    }

    fn arp_true_edge(&self, edge: &Edge) -> IpSpace {
        lookup(&self.arp_true, edge)
    }

    fn neighbor_unreachable(&self, node: &str, vrf: &str, interface: &str) -> IpSpace {
        lookup(&self.neighbor_unreachable, &interface_key(node, vrf, interface))
    }

    fn delivered_to_subnet(&self, node: &str, vrf: &str, interface: &str) -> IpSpace {
        lookup(&self.delivered_to_subnet, &interface_key(node, vrf, interface))
    }

    fn exits_network(&self, node: &str, vrf: &str, interface: &str) -> IpSpace {
        lookup(&self.exits_network, &interface_key(node, vrf, interface))
    }
}

impl DataPlane for StaticDataPlane {
    fn forwarding_analysis(&self) -> &dyn ForwardingAnalysis {
        self
    }
}
