//! Network encoder: turns configurations, forwarding state and topology into
//! a [`SynthesizerInput`].
//!
//! Every map is iterated in key order, so two encodings of the same inputs
//! with the same packet produce identical predicates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::compiler::{AclCompiler, CompiledAcl, SourceManager};
use crate::error::{Error, Result};
use crate::flow::FlowDisposition;
use crate::header_space::{HeaderField, HeaderSpace};
use crate::ip::IpSpace;
use crate::location::IngressLocation;
use crate::model::{Configuration, DataPlane, Edge, Topology};
use crate::packet::BddPacket;
use crate::reachability::{self, NatRule, ReachabilityGraph, State, TransitConstraints, Transition};
use crate::reference::Ref;

/// Destination predicates of one VRF.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VrfForwarding {
    pub accepted: Ref,
    pub routable: Ref,
    pub null_routed: Ref,
}

/// Frozen, per-snapshot view of a network. Shared through [`Arc`] and never
/// mutated after [`NetworkEncoder::encode`].
#[derive(Debug)]
pub struct SynthesizerInput {
    packet: Arc<BddPacket>,
    configs: Arc<BTreeMap<String, Configuration>>,
    acls: BTreeMap<String, BTreeMap<String, CompiledAcl>>,
    source_managers: BTreeMap<String, SourceManager>,
    forwarding: BTreeMap<(String, String), VrfForwarding>,
    enabled_edges: BTreeSet<Edge>,
    graph: ReachabilityGraph,
    header_space: Ref,
    sources: BTreeMap<IngressLocation, Ref>,
    transit: TransitConstraints,
    tag: String,
}

impl SynthesizerInput {
    pub fn packet(&self) -> &Arc<BddPacket> {
        &self.packet
    }

    pub fn configs(&self) -> &BTreeMap<String, Configuration> {
        &self.configs
    }

    pub fn compiled_acl(&self, node: &str, acl: &str) -> Option<&CompiledAcl> {
        self.acls.get(node)?.get(acl)
    }

    pub fn source_manager(&self, node: &str) -> Option<&SourceManager> {
        self.source_managers.get(node)
    }

    pub fn forwarding(&self, node: &str, vrf: &str) -> Option<&VrfForwarding> {
        self.forwarding.get(&(node.to_string(), vrf.to_string()))
    }

    pub fn enabled_edges(&self) -> &BTreeSet<Edge> {
        &self.enabled_edges
    }

    pub fn graph(&self) -> &ReachabilityGraph {
        &self.graph
    }

    pub fn header_space(&self) -> Ref {
        self.header_space
    }

    pub fn sources(&self) -> &BTreeMap<IngressLocation, Ref> {
        &self.sources
    }

    pub fn source_predicate(&self, location: &IngressLocation) -> Option<Ref> {
        self.sources.get(location).copied()
    }

    pub fn locations(&self) -> impl Iterator<Item = &IngressLocation> {
        self.sources.keys()
    }

    pub fn transit(&self) -> &TransitConstraints {
        &self.transit
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    /// Graph state where flows from `location` start.
    pub fn origin_state(location: &IngressLocation) -> State {
        match location {
            IngressLocation::Vrf { node, vrf } => State::OriginateVrf {
                node: node.clone(),
                vrf: vrf.clone(),
            },
            IngressLocation::InterfaceLink { node, interface } => State::OriginateInterfaceLink {
                node: node.clone(),
                interface: interface.clone(),
            },
        }
    }

    /// Sink states for the given dispositions at the given nodes.
    pub fn sink_states(
        &self,
        actions: &BTreeSet<FlowDisposition>,
        final_nodes: &BTreeSet<String>,
    ) -> BTreeMap<State, Ref> {
        let mut sinks = BTreeMap::new();
        for node in final_nodes {
            for &action in actions {
                if let Some(state) = disposition_state(action, node) {
                    sinks.insert(state, Ref::ONE);
                }
            }
        }
        sinks
    }

    /// Packets injected at `location` and where they can get to.
    pub fn forward_from(&self, location: &IngressLocation, transit: &TransitConstraints) -> BTreeMap<State, Ref> {
        let bdd = self.packet.bdd();
        let start = match self.source_predicate(location) {
            Some(src) => bdd.apply_and(src, self.header_space),
            None => Ref::ZERO,
        };
        let origins = BTreeMap::from([(Self::origin_state(location), start)]);
        reachability::forward(&self.packet, &self.graph, &origins, transit)
    }
}

/// Graph state recording a disposition at a node.
pub fn disposition_state(disposition: FlowDisposition, node: &str) -> Option<State> {
    let node = node.to_string();
    Some(match disposition {
        FlowDisposition::Accepted => State::NodeAccept(node),
        FlowDisposition::DeniedIn => State::NodeDropAclIn(node),
        FlowDisposition::DeniedOut => State::NodeDropAclOut(node),
        FlowDisposition::NoRoute => State::NodeDropNoRoute(node),
        FlowDisposition::NullRouted => State::NodeDropNullRoute(node),
        FlowDisposition::NeighborUnreachable => State::NodeNeighborUnreachable(node),
        FlowDisposition::DeliveredToSubnet => State::NodeDeliveredToSubnet(node),
        FlowDisposition::ExitsNetwork => State::NodeExitsNetwork(node),
        FlowDisposition::Loop => return None,
    })
}

/// Builder for [`SynthesizerInput`].
pub struct NetworkEncoder<'a> {
    packet: Arc<BddPacket>,
    configs: Arc<BTreeMap<String, Configuration>>,
    data_plane: &'a dyn DataPlane,
    topology: &'a Topology,
    header_space: HeaderSpace,
    transit: TransitConstraints,
    sources: BTreeMap<IngressLocation, IpSpace>,
    tag: String,
}

impl<'a> NetworkEncoder<'a> {
    pub fn new(
        packet: Arc<BddPacket>,
        configs: Arc<BTreeMap<String, Configuration>>,
        data_plane: &'a dyn DataPlane,
        topology: &'a Topology,
    ) -> Self {
        Self {
            packet,
            configs,
            data_plane,
            topology,
            header_space: HeaderSpace::Any,
            transit: TransitConstraints::default(),
            sources: BTreeMap::new(),
            tag: String::new(),
        }
    }

    pub fn header_space(mut self, header_space: HeaderSpace) -> Self {
        self.header_space = header_space;
        self
    }

    pub fn transit(mut self, transit: TransitConstraints) -> Self {
        self.transit = transit;
        self
    }

    /// Source IPs per ingress location.
    pub fn sources(mut self, sources: BTreeMap<IngressLocation, IpSpace>) -> Self {
        self.sources = sources;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn encode(self) -> Result<SynthesizerInput> {
        info!("Encoding {} nodes, {} topology edges", self.configs.len(), self.topology.len());

        let enabled_edges = self.enabled_edges()?;
        let (acls, source_managers) = self.compile_acls()?;
        let forwarding = self.forwarding();
        let graph = self.build_graph(&enabled_edges, &acls, &source_managers, &forwarding)?;
        let sources = self.source_predicates()?;
        let header_space = self.packet.header_space(&self.header_space);

        info!(
            "Encoded reachability graph with {} edges and {} source locations",
            graph.num_edges(),
            sources.len()
        );

        Ok(SynthesizerInput {
            packet: self.packet,
            configs: self.configs,
            acls,
            source_managers,
            forwarding,
            enabled_edges,
            graph,
            header_space,
            sources,
            transit: self.transit,
            tag: self.tag,
        })
    }

    fn enabled_edges(&self) -> Result<BTreeSet<Edge>> {
        let mut enabled = BTreeSet::new();
        for edge in self.topology.edges() {
            let mut active = true;
            for end in [&edge.tail, &edge.head] {
                let interface = self
                    .configs
                    .get(&end.node)
                    .and_then(|c| c.interfaces.get(&end.interface))
                    .ok_or_else(|| Error::InconsistentTopology {
                        node: end.node.clone(),
                        interface: end.interface.clone(),
                    })?;
                active &= interface.active;
            }
            if active {
                enabled.insert(edge.clone());
            } else {
                warn!("Disabling edge {}: interface is inactive", edge);
            }
        }
        Ok(enabled)
    }

    #[allow(clippy::type_complexity)]
    fn compile_acls(
        &self,
    ) -> Result<(
        BTreeMap<String, BTreeMap<String, CompiledAcl>>,
        BTreeMap<String, SourceManager>,
    )> {
        let mut acls = BTreeMap::new();
        let mut managers = BTreeMap::new();
        for (hostname, config) in self.configs.iter() {
            let manager = SourceManager::new(hostname, config.interfaces.keys())?;
            let mut compiler = AclCompiler::new(&self.packet, hostname, &config.acls, &manager)?;

            for interface in config.interfaces.values() {
                let nat_acls = interface.source_nats.iter().filter_map(|n| n.acl.as_ref());
                for acl in interface.incoming_filter.iter().chain(&interface.outgoing_filter).chain(nat_acls) {
                    if !config.acls.contains_key(acl) {
                        return Err(Error::UndefinedAclReference {
                            hostname: hostname.clone(),
                            acl: interface.name.clone(),
                            reference: acl.clone(),
                        });
                    }
                }
            }

            let mut compiled = BTreeMap::new();
            for name in config.acls.keys() {
                compiled.insert(name.clone(), compiler.compile(name)?);
            }
            debug!("Compiled {} ACLs on {}", compiled.len(), hostname);
            acls.insert(hostname.clone(), compiled);
            managers.insert(hostname.clone(), manager);
        }
        Ok((acls, managers))
    }

    fn forwarding(&self) -> BTreeMap<(String, String), VrfForwarding> {
        let fa = self.data_plane.forwarding_analysis();
        let mut forwarding = BTreeMap::new();
        for (hostname, config) in self.configs.iter() {
            for vrf in &config.vrfs {
                let predicates = VrfForwarding {
                    accepted: self.packet.ip_space(HeaderField::DstIp, &fa.accepted_ips(hostname, vrf)),
                    routable: self.packet.ip_space(HeaderField::DstIp, &fa.routable_ips(hostname, vrf)),
                    null_routed: self.packet.ip_space(HeaderField::DstIp, &fa.null_routed_ips(hostname, vrf)),
                };
                forwarding.insert((hostname.clone(), vrf.clone()), predicates);
            }
        }
        forwarding
    }

    fn build_graph(
        &self,
        enabled_edges: &BTreeSet<Edge>,
        acls: &BTreeMap<String, BTreeMap<String, CompiledAcl>>,
        managers: &BTreeMap<String, SourceManager>,
        forwarding: &BTreeMap<(String, String), VrfForwarding>,
    ) -> Result<ReachabilityGraph> {
        let packet = &*self.packet;
        let bdd = packet.bdd();
        let fa = self.data_plane.forwarding_analysis();
        let source_vars = packet.source().vars();
        let mut graph = ReachabilityGraph::new();

        let permit_of = |node: &str, acl: &Option<String>| -> Ref {
            acl.as_ref()
                .and_then(|name| acls.get(node)?.get(name))
                .map_or(Ref::ONE, |c| c.permit)
        };

        for (hostname, config) in self.configs.iter() {
            let Some(manager) = managers.get(hostname) else {
                continue;
            };

            for vrf in &config.vrfs {
                let Some(fwd) = forwarding.get(&(hostname.clone(), vrf.clone())) else {
                    continue;
                };
                let post_in = State::PostInVrf {
                    node: hostname.clone(),
                    vrf: vrf.clone(),
                };
                let not_accepted = -fwd.accepted;

                graph.add(
                    State::OriginateVrf {
                        node: hostname.clone(),
                        vrf: vrf.clone(),
                    },
                    post_in.clone(),
                    Transition::EraseAndSet {
                        vars: source_vars.clone(),
                        value: manager.originating(packet),
                    },
                );
                graph.add(post_in.clone(), State::NodeAccept(hostname.clone()), Transition::Constraint(fwd.accepted));
                graph.add(
                    post_in.clone(),
                    State::NodeDropNullRoute(hostname.clone()),
                    Transition::Constraint(bdd.apply_and(not_accepted, fwd.null_routed)),
                );
                graph.add(
                    post_in.clone(),
                    State::NodeDropNoRoute(hostname.clone()),
                    Transition::Constraint(bdd.apply_and(not_accepted, -fwd.routable)),
                );

                for interface in config.interfaces_in_vrf(vrf).filter(|i| i.active) {
                    let out_permit = permit_of(hostname, &interface.outgoing_filter);
                    let dispositions = [
                        (
                            fa.neighbor_unreachable(hostname, vrf, &interface.name),
                            State::NodeNeighborUnreachable(hostname.clone()),
                        ),
                        (
                            fa.delivered_to_subnet(hostname, vrf, &interface.name),
                            State::NodeDeliveredToSubnet(hostname.clone()),
                        ),
                        (
                            fa.exits_network(hostname, vrf, &interface.name),
                            State::NodeExitsNetwork(hostname.clone()),
                        ),
                    ];
                    for (space, sink) in dispositions {
                        let dst = bdd.apply_and(not_accepted, packet.ip_space(HeaderField::DstIp, &space));
                        graph.add(post_in.clone(), sink, Transition::Constraint(bdd.apply_and(dst, out_permit)));
                        graph.add(
                            post_in.clone(),
                            State::NodeDropAclOut(hostname.clone()),
                            Transition::Constraint(bdd.apply_diff(dst, out_permit)),
                        );
                    }
                }

                for edge in enabled_edges.iter().filter(|e| &e.tail.node == hostname) {
                    let in_vrf = config
                        .interfaces
                        .get(&edge.tail.interface)
                        .is_some_and(|i| &i.vrf == vrf);
                    if !in_vrf {
                        continue;
                    }
                    let arp = packet.ip_space(HeaderField::DstIp, &fa.arp_true_edge(edge));
                    graph.add(
                        post_in.clone(),
                        State::PreOutEdge(edge.clone()),
                        Transition::Constraint(bdd.apply_and(not_accepted, arp)),
                    );
                }
            }

            for interface in config.active_interfaces() {
                let pre_in = State::PreInInterface {
                    node: hostname.clone(),
                    interface: interface.name.clone(),
                };
                let set_source = Transition::EraseAndSet {
                    vars: source_vars.clone(),
                    value: manager.entered_through(packet, &interface.name)?,
                };
                let in_permit = permit_of(hostname, &interface.incoming_filter);

                graph.add(
                    State::OriginateInterfaceLink {
                        node: hostname.clone(),
                        interface: interface.name.clone(),
                    },
                    pre_in.clone(),
                    Transition::Identity,
                );
                graph.add(
                    pre_in.clone(),
                    State::PostInVrf {
                        node: hostname.clone(),
                        vrf: interface.vrf.clone(),
                    },
                    Transition::compose([set_source.clone(), Transition::Constraint(in_permit)]),
                );
                if interface.incoming_filter.is_some() {
                    graph.add(
                        pre_in,
                        State::NodeDropAclIn(hostname.clone()),
                        Transition::compose([set_source, Transition::Constraint(-in_permit)]),
                    );
                }
            }
        }

        for edge in enabled_edges {
            let node = &edge.tail.node;
            let Some(interface) = self.configs.get(node).and_then(|c| c.interfaces.get(&edge.tail.interface)) else {
                continue;
            };

            let nat = if interface.source_nats.is_empty() {
                Transition::Identity
            } else {
                let mut earlier = Ref::ZERO;
                let mut rules = Vec::new();
                for rule in &interface.source_nats {
                    let matched = permit_of(node, &rule.acl);
                    let pool = packet.src_ip().range(
                        bdd,
                        rule.pool_start.as_u32() as u64,
                        rule.pool_end.as_u32() as u64,
                    );
                    rules.push(NatRule {
                        guard: bdd.apply_diff(matched, earlier),
                        pool,
                    });
                    earlier = bdd.apply_or(earlier, matched);
                }
                Transition::SourceNat(rules)
            };
            graph.add(State::PreOutEdge(edge.clone()), State::PreOutEdgePostNat(edge.clone()), nat);

            let out_permit = permit_of(node, &interface.outgoing_filter);
            graph.add(
                State::PreOutEdgePostNat(edge.clone()),
                State::PreInInterface {
                    node: edge.head.node.clone(),
                    interface: edge.head.interface.clone(),
                },
                Transition::Constraint(out_permit),
            );
            if interface.outgoing_filter.is_some() {
                graph.add(
                    State::PreOutEdgePostNat(edge.clone()),
                    State::NodeDropAclOut(node.clone()),
                    Transition::Constraint(-out_permit),
                );
            }
        }

        Ok(graph)
    }

    fn source_predicates(&self) -> Result<BTreeMap<IngressLocation, Ref>> {
        let mut sources = BTreeMap::new();
        for (location, space) in &self.sources {
            let config = self
                .configs
                .get(location.node())
                .ok_or_else(|| Error::InvalidParameters(format!("Unknown node '{}'", location.node())))?;
            match location {
                IngressLocation::InterfaceLink { node, interface } => {
                    if !config.interfaces.contains_key(interface) {
                        return Err(Error::UndefinedInterface {
                            node: node.clone(),
                            interface: interface.clone(),
                        });
                    }
                }
                IngressLocation::Vrf { vrf, .. } => {
                    if !config.vrfs.contains(vrf) {
                        return Err(Error::InvalidParameters(format!(
                            "Unknown VRF '{}' on node '{}'",
                            vrf,
                            location.node()
                        )));
                    }
                }
            }
            sources.insert(location.clone(), self.packet.ip_space(HeaderField::SrcIp, space));
        }
        Ok(sources)
    }
}

/// Encode a snapshot in one call.
pub fn encode(
    packet: Arc<BddPacket>,
    configs: Arc<BTreeMap<String, Configuration>>,
    data_plane: &dyn DataPlane,
    topology: &Topology,
    header_space: HeaderSpace,
    transit: TransitConstraints,
    sources: BTreeMap<IngressLocation, IpSpace>,
) -> Result<SynthesizerInput> {
    NetworkEncoder::new(packet, configs, data_plane, topology)
        .header_space(header_space)
        .transit(transit)
        .sources(sources)
        .encode()
}
