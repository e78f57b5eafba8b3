//! Reachability graph and its fixpoint analyses.
//!
//! States are points in the network a packet can be at; edges carry a
//! [`Transition`] describing how the packet set changes when moving along the
//! edge. [`backward`] computes, for every state, the packets that can get
//! from it to one of the sinks, and [`forward`] computes the packets that can
//! get to every state from the given origins.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::model::Edge;
use crate::packet::BddPacket;
use crate::reference::Ref;

/// Node of the reachability graph.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum State {
    OriginateVrf { node: String, vrf: String },
    OriginateInterfaceLink { node: String, interface: String },
    PreInInterface { node: String, interface: String },
    PostInVrf { node: String, vrf: String },
    PreOutEdge(Edge),
    PreOutEdgePostNat(Edge),
    NodeAccept(String),
    NodeDropAclIn(String),
    NodeDropAclOut(String),
    NodeDropNoRoute(String),
    NodeDropNullRoute(String),
    NodeNeighborUnreachable(String),
    NodeDeliveredToSubnet(String),
    NodeExitsNetwork(String),
}

impl State {
    pub fn node(&self) -> &str {
        match self {
            State::OriginateVrf { node, .. }
            | State::OriginateInterfaceLink { node, .. }
            | State::PreInInterface { node, .. }
            | State::PostInVrf { node, .. } => node,
            State::PreOutEdge(edge) | State::PreOutEdgePostNat(edge) => &edge.tail.node,
            State::NodeAccept(node)
            | State::NodeDropAclIn(node)
            | State::NodeDropAclOut(node)
            | State::NodeDropNoRoute(node)
            | State::NodeDropNullRoute(node)
            | State::NodeNeighborUnreachable(node)
            | State::NodeDeliveredToSubnet(node)
            | State::NodeExitsNetwork(node) => node,
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            State::OriginateVrf { node, vrf } => write!(f, "OriginateVrf({}, {})", node, vrf),
            State::OriginateInterfaceLink { node, interface } => {
                write!(f, "OriginateInterfaceLink({}, {})", node, interface)
            }
            State::PreInInterface { node, interface } => write!(f, "PreInInterface({}, {})", node, interface),
            State::PostInVrf { node, vrf } => write!(f, "PostInVrf({}, {})", node, vrf),
            State::PreOutEdge(edge) => write!(f, "PreOutEdge({})", edge),
            State::PreOutEdgePostNat(edge) => write!(f, "PreOutEdgePostNat({})", edge),
            State::NodeAccept(node) => write!(f, "NodeAccept({})", node),
            State::NodeDropAclIn(node) => write!(f, "NodeDropAclIn({})", node),
            State::NodeDropAclOut(node) => write!(f, "NodeDropAclOut({})", node),
            State::NodeDropNoRoute(node) => write!(f, "NodeDropNoRoute({})", node),
            State::NodeDropNullRoute(node) => write!(f, "NodeDropNullRoute({})", node),
            State::NodeNeighborUnreachable(node) => write!(f, "NodeNeighborUnreachable({})", node),
            State::NodeDeliveredToSubnet(node) => write!(f, "NodeDeliveredToSubnet({})", node),
            State::NodeExitsNetwork(node) => write!(f, "NodeExitsNetwork({})", node),
        }
    }
}

/// One source NAT rule. `guard` already excludes packets matched by earlier rules.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NatRule {
    pub guard: Ref,
    pub pool: Ref,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Transition {
    Identity,
    Constraint(Ref),
    /// Forget `vars`, then constrain them to `value`.
    EraseAndSet { vars: Vec<u32>, value: Ref },
    /// Rewrite the source IP of packets matching a rule into its pool.
    SourceNat(Vec<NatRule>),
    Compose(Vec<Transition>),
}

impl Transition {
    /// Simplifying constructor for sequential composition.
    pub fn compose(transitions: impl IntoIterator<Item = Transition>) -> Transition {
        let mut out: Vec<Transition> = transitions
            .into_iter()
            .filter(|t| !matches!(t, Transition::Identity | Transition::Constraint(Ref::ONE)))
            .collect();
        match out.len() {
            0 => Transition::Identity,
            1 => out.swap_remove(0),
            _ => Transition::Compose(out),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Transition::Constraint(c) => *c == Ref::ZERO,
            Transition::Compose(ts) => ts.iter().any(Transition::is_zero),
            _ => false,
        }
    }

    /// Image of `f` under the transition.
    pub fn forward(&self, packet: &BddPacket, f: Ref) -> Ref {
        let bdd = packet.bdd();
        match self {
            Transition::Identity => f,
            Transition::Constraint(c) => bdd.apply_and(f, *c),
            Transition::EraseAndSet { vars, value } => bdd.apply_and(bdd.exists(f, vars), *value),
            Transition::SourceNat(rules) => {
                let src = packet.src_ip().vars();
                let matched = bdd.apply_or_many(rules.iter().map(|r| r.guard));
                let mut res = bdd.apply_diff(f, matched);
                for rule in rules {
                    let rewritten = bdd.apply_and(bdd.exists(bdd.apply_and(f, rule.guard), &src), rule.pool);
                    res = bdd.apply_or(res, rewritten);
                }
                res
            }
            Transition::Compose(ts) => ts.iter().fold(f, |acc, t| t.forward(packet, acc)),
        }
    }

    /// Pre-image of `f` under the transition.
    pub fn backward(&self, packet: &BddPacket, f: Ref) -> Ref {
        let bdd = packet.bdd();
        match self {
            Transition::Identity => f,
            Transition::Constraint(c) => bdd.apply_and(f, *c),
            Transition::EraseAndSet { vars, value } => bdd.exists(bdd.apply_and(f, *value), vars),
            Transition::SourceNat(rules) => {
                let src = packet.src_ip().vars();
                let matched = bdd.apply_or_many(rules.iter().map(|r| r.guard));
                let mut res = bdd.apply_diff(f, matched);
                for rule in rules {
                    let origins = bdd.apply_and(rule.guard, bdd.exists(bdd.apply_and(f, rule.pool), &src));
                    res = bdd.apply_or(res, origins);
                }
                res
            }
            Transition::Compose(ts) => ts.iter().rev().fold(f, |acc, t| t.backward(packet, acc)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: State,
    pub to: State,
    pub transition: Transition,
}

impl GraphEdge {
    /// Node a packet leaves when it crosses a topology edge.
    fn transit_node(&self) -> Option<&str> {
        match (&self.from, &self.to) {
            (State::PreOutEdgePostNat(edge), State::PreInInterface { .. }) => Some(&edge.tail.node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReachabilityGraph {
    edges: Vec<GraphEdge>,
    incoming: BTreeMap<State, Vec<usize>>,
    outgoing: BTreeMap<State, Vec<usize>>,
}

impl ReachabilityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge; edges whose transition drops every packet are skipped.
    pub fn add(&mut self, from: State, to: State, transition: Transition) {
        if transition.is_zero() {
            return;
        }
        let i = self.edges.len();
        self.incoming.entry(to.clone()).or_default().push(i);
        self.outgoing.entry(from.clone()).or_default().push(i);
        self.edges.push(GraphEdge { from, to, transition });
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn incoming(&self, state: &State) -> impl Iterator<Item = &GraphEdge> {
        self.incoming
            .get(state)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn outgoing(&self, state: &State) -> impl Iterator<Item = &GraphEdge> {
        self.outgoing
            .get(state)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn edge(&self, from: &State, to: &State) -> Option<&GraphEdge> {
        self.outgoing(from).find(|e| &e.to == to)
    }

    pub fn states(&self) -> BTreeSet<&State> {
        self.incoming.keys().chain(self.outgoing.keys()).collect()
    }
}

/// Nodes a flow must (or must not) pass through.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransitConstraints {
    pub required: BTreeSet<String>,
    pub forbidden: BTreeSet<String>,
}

impl TransitConstraints {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.forbidden.is_empty()
    }

    /// `None` if the edge is removed, `Some(true)` if crossing it marks the
    /// packet as having transited a required node.
    fn instrument(&self, edge: &GraphEdge) -> Option<bool> {
        match edge.transit_node() {
            Some(node) if self.forbidden.contains(node) => None,
            Some(node) => Some(self.required.contains(node)),
            None => Some(false),
        }
    }
}

/// Backward reachability: for each state, the packets that reach a sink.
///
/// With required transit nodes, sink predicates additionally require the
/// transited bit, which is set on edges leaving a required node.
pub fn backward(
    packet: &BddPacket,
    graph: &ReachabilityGraph,
    sinks: &BTreeMap<State, Ref>,
    transit: &TransitConstraints,
) -> BTreeMap<State, Ref> {
    let bdd = packet.bdd();
    let t = packet.transited();
    let t_var = [packet.transited_var()];
    let with_required = !transit.required.is_empty();

    let mut reach: BTreeMap<State, Ref> = BTreeMap::new();
    let mut dirty: BTreeSet<State> = BTreeSet::new();
    for (state, &pred) in sinks {
        let pred = if with_required { bdd.apply_and(pred, t) } else { pred };
        if pred != Ref::ZERO {
            reach.insert(state.clone(), pred);
            dirty.insert(state.clone());
        }
    }

    let mut iterations = 0usize;
    while let Some(state) = dirty.pop_first() {
        iterations += 1;
        let q = reach[&state];
        for edge in graph.incoming(&state) {
            let Some(sets_transited) = transit.instrument(edge) else {
                continue;
            };
            let q = if sets_transited {
                bdd.exists(bdd.apply_and(q, t), &t_var)
            } else {
                q
            };
            let pre = edge.transition.backward(packet, q);
            if pre == Ref::ZERO {
                continue;
            }
            let old = reach.get(&edge.from).copied().unwrap_or(Ref::ZERO);
            let new = bdd.apply_or(old, pre);
            if new != old {
                reach.insert(edge.from.clone(), new);
                dirty.insert(edge.from.clone());
            }
        }
    }
    debug!("Backward fixpoint: {} states after {} iterations", reach.len(), iterations);

    reach
}

/// Forward reachability: for each state, the packets that get there from the origins.
pub fn forward(
    packet: &BddPacket,
    graph: &ReachabilityGraph,
    origins: &BTreeMap<State, Ref>,
    transit: &TransitConstraints,
) -> BTreeMap<State, Ref> {
    let bdd = packet.bdd();
    let t = packet.transited();
    let t_var = [packet.transited_var()];
    let with_required = !transit.required.is_empty();

    let mut reach: BTreeMap<State, Ref> = BTreeMap::new();
    let mut dirty: BTreeSet<State> = BTreeSet::new();
    for (state, &pred) in origins {
        let pred = if with_required { bdd.apply_diff(pred, t) } else { pred };
        if pred != Ref::ZERO {
            reach.insert(state.clone(), pred);
            dirty.insert(state.clone());
        }
    }

    while let Some(state) = dirty.pop_first() {
        let p = reach[&state];
        for edge in graph.outgoing(&state) {
            let Some(sets_transited) = transit.instrument(edge) else {
                continue;
            };
            let mut post = edge.transition.forward(packet, p);
            if sets_transited {
                post = bdd.apply_and(bdd.exists(post, &t_var), t);
            }
            if post == Ref::ZERO {
                continue;
            }
            let old = reach.get(&edge.to).copied().unwrap_or(Ref::ZERO);
            let new = bdd.apply_or(old, post);
            if new != old {
                reach.insert(edge.to.clone(), new);
                dirty.insert(edge.to.clone());
            }
        }
    }

    reach
}

/// Header predicate of packets at an origin state that reach the sinks.
pub fn origin_predicate(
    packet: &BddPacket,
    reach: &BTreeMap<State, Ref>,
    origin: &State,
    transit: &TransitConstraints,
) -> Ref {
    let bdd = packet.bdd();
    let Some(&pred) = reach.get(origin) else {
        return Ref::ZERO;
    };
    let pred = if transit.required.is_empty() {
        pred
    } else {
        bdd.apply_diff(pred, packet.transited())
    };
    packet.erase_state(pred)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::header_space::HeaderField;
    use crate::ip::{Ip, Prefix};
    use crate::model::NodeInterfacePair;

    fn edge(a: &str, b: &str) -> Edge {
        Edge::new(NodeInterfacePair::new(a, "out"), NodeInterfacePair::new(b, "in"))
    }

    fn chain(packet: &BddPacket) -> ReachabilityGraph {
        // a -> b -> c, c accepts 10.0.0.0/8, b forwards everything.
        let dst = packet.prefix(HeaderField::DstIp, Prefix::parse("10.0.0.0/8").unwrap());
        let mut graph = ReachabilityGraph::new();
        for (x, y) in [("a", "b"), ("b", "c")] {
            let e = edge(x, y);
            graph.add(
                State::PostInVrf { node: x.into(), vrf: "default".into() },
                State::PreOutEdge(e.clone()),
                Transition::Identity,
            );
            graph.add(State::PreOutEdge(e.clone()), State::PreOutEdgePostNat(e.clone()), Transition::Identity);
            graph.add(
                State::PreOutEdgePostNat(e.clone()),
                State::PreInInterface { node: y.into(), interface: "in".into() },
                Transition::Identity,
            );
            graph.add(
                State::PreInInterface { node: y.into(), interface: "in".into() },
                State::PostInVrf { node: y.into(), vrf: "default".into() },
                Transition::Identity,
            );
        }
        graph.add(
            State::PostInVrf { node: "c".into(), vrf: "default".into() },
            State::NodeAccept("c".into()),
            Transition::Constraint(dst),
        );
        graph
    }

    fn origin() -> State {
        State::PostInVrf { node: "a".into(), vrf: "default".into() }
    }

    #[test]
    fn test_backward_chain() {
        let packet = BddPacket::default();
        let graph = chain(&packet);
        let sinks = BTreeMap::from([(State::NodeAccept("c".into()), Ref::ONE)]);

        let reach = backward(&packet, &graph, &sinks, &TransitConstraints::default());
        let dst = packet.prefix(HeaderField::DstIp, Prefix::parse("10.0.0.0/8").unwrap());
        assert_eq!(origin_predicate(&packet, &reach, &origin(), &TransitConstraints::default()), dst);
    }

    #[test]
    fn test_forbidden_and_required_transit() {
        let packet = BddPacket::default();
        let graph = chain(&packet);
        let sinks = BTreeMap::from([(State::NodeAccept("c".into()), Ref::ONE)]);
        let dst = packet.prefix(HeaderField::DstIp, Prefix::parse("10.0.0.0/8").unwrap());

        let forbidden = TransitConstraints {
            forbidden: BTreeSet::from(["b".to_string()]),
            ..TransitConstraints::default()
        };
        let reach = backward(&packet, &graph, &sinks, &forbidden);
        assert_eq!(origin_predicate(&packet, &reach, &origin(), &forbidden), Ref::ZERO);

        let required = TransitConstraints {
            required: BTreeSet::from(["b".to_string()]),
            ..TransitConstraints::default()
        };
        let reach = backward(&packet, &graph, &sinks, &required);
        assert_eq!(origin_predicate(&packet, &reach, &origin(), &required), dst);

        let required_elsewhere = TransitConstraints {
            required: BTreeSet::from(["z".to_string()]),
            ..TransitConstraints::default()
        };
        let reach = backward(&packet, &graph, &sinks, &required_elsewhere);
        assert_eq!(origin_predicate(&packet, &reach, &origin(), &required_elsewhere), Ref::ZERO);
    }

    #[test]
    fn test_forward_matches_backward() {
        let packet = BddPacket::default();
        let graph = chain(&packet);
        let origins = BTreeMap::from([(origin(), Ref::ONE)]);

        let reach = forward(&packet, &graph, &origins, &TransitConstraints::default());
        let dst = packet.prefix(HeaderField::DstIp, Prefix::parse("10.0.0.0/8").unwrap());
        assert_eq!(reach[&State::NodeAccept("c".into())], dst);
    }

    #[test]
    fn test_loops_terminate() {
        let packet = BddPacket::default();
        let a = State::NodeAccept("x".into());
        let p = State::PostInVrf { node: "x".into(), vrf: "default".into() };
        let q = State::PostInVrf { node: "y".into(), vrf: "default".into() };
        let mut graph = ReachabilityGraph::new();
        graph.add(p.clone(), q.clone(), Transition::Identity);
        graph.add(q.clone(), p.clone(), Transition::Identity);
        graph.add(p.clone(), a.clone(), Transition::Identity);

        let reach = backward(&packet, &graph, &BTreeMap::from([(a, Ref::ONE)]), &TransitConstraints::default());
        assert_eq!(reach[&q], Ref::ONE);
    }

    #[test]
    fn test_source_nat_transition() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let inside = packet.prefix(HeaderField::SrcIp, Prefix::parse("10.0.0.0/8").unwrap());
        let pool = packet.ip(HeaderField::SrcIp, Ip::from_octets(1, 1, 1, 1));
        let nat = Transition::SourceNat(vec![NatRule { guard: inside, pool }]);

        // Forward: inside sources become the pool address, others are untouched.
        let outside = packet.ip(HeaderField::SrcIp, Ip::from_octets(8, 8, 8, 8));
        let img = nat.forward(&packet, bdd.apply_or(inside, outside));
        assert_eq!(img, bdd.apply_or(pool, outside));

        // Backward: packets arriving with the pool address came from inside,
        // or had it already and were not translated.
        let pre = nat.backward(&packet, pool);
        assert_eq!(pre, bdd.apply_or(inside, pool));
        let pre = nat.backward(&packet, outside);
        assert_eq!(pre, outside);
    }

    #[test]
    fn test_erase_and_set() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let source = packet.source();
        let set_3 = Transition::EraseAndSet {
            vars: source.vars(),
            value: source.value(bdd, 3),
        };

        assert_eq!(set_3.forward(&packet, source.value(bdd, 7)), source.value(bdd, 3));
        assert_eq!(set_3.backward(&packet, source.value(bdd, 3)), Ref::ONE);
        assert_eq!(set_3.backward(&packet, source.value(bdd, 4)), Ref::ZERO);
    }

    #[test]
    fn test_compose_simplifies() {
        assert_eq!(Transition::compose([Transition::Identity]), Transition::Identity);
        assert_eq!(
            Transition::compose([Transition::Identity, Transition::Constraint(Ref::ZERO)]),
            Transition::Constraint(Ref::ZERO)
        );
        assert!(Transition::compose([Transition::Constraint(Ref::ZERO), Transition::Identity]).is_zero());
    }
}
