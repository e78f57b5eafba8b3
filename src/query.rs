//! Query synthesizers.
//!
//! A synthesizer turns one or two [`SynthesizerInput`]s and query parameters
//! into a [`Query`]: a [`Formula`] over header predicates and reachability
//! facts, evaluated separately at every ingress location of the query.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;
use num_bigint::BigUint;

use crate::compiler::{AclCompiler, AclSpecializer, CompiledAcl};
use crate::encoder::SynthesizerInput;
use crate::error::{Error, Result};
use crate::flow::FlowDisposition;
use crate::location::IngressLocation;
use crate::model::Edge;
use crate::packet::BddPacket;
use crate::reachability::{self, State, TransitConstraints};
use crate::reference::Ref;

pub const BASE_TAG: &str = "BASE";
pub const DELTA_TAG: &str = "DELTA";

/// Where a reachability fact ends.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Sinks {
    /// Any of `actions` at any of `final_nodes`.
    Dispositions {
        actions: BTreeSet<FlowDisposition>,
        final_nodes: BTreeSet<String>,
    },
    /// Crossing the topology edge, i.e. leaving the tail after NAT and the
    /// outgoing filter, towards the head.
    EdgeTraversal(Edge),
}

/// Packets from a location that reach the sinks in one snapshot.
#[derive(Debug, Clone)]
pub struct ReachQuery {
    pub input: Arc<SynthesizerInput>,
    pub sinks: Sinks,
    pub transit: TransitConstraints,
}

impl ReachQuery {
    pub fn new(input: Arc<SynthesizerInput>, sinks: Sinks) -> Self {
        let transit = input.transit().clone();
        Self { input, sinks, transit }
    }

    fn same_as(&self, other: &ReachQuery) -> bool {
        Arc::ptr_eq(&self.input, &other.input) && self.sinks == other.sinks && self.transit == other.transit
    }
}

/// Boolean combination of header predicates and reachability facts.
#[derive(Debug, Clone)]
pub enum Formula {
    True,
    False,
    Predicate(Ref),
    /// Source-IP predicate of the location in the given snapshot.
    Source(Arc<SynthesizerInput>),
    Reaches(ReachQuery),
    And(Vec<Formula>),
    Or(Vec<Formula>),
    Not(Box<Formula>),
}

impl Formula {
    pub fn and(self, other: Formula) -> Formula {
        match (self, other) {
            (Formula::True, f) | (f, Formula::True) => f,
            (Formula::False, _) | (_, Formula::False) => Formula::False,
            (Formula::And(mut xs), Formula::And(ys)) => {
                xs.extend(ys);
                Formula::And(xs)
            }
            (Formula::And(mut xs), f) | (f, Formula::And(mut xs)) => {
                xs.push(f);
                Formula::And(xs)
            }
            (a, b) => Formula::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Formula) -> Formula {
        match (self, other) {
            (Formula::False, f) | (f, Formula::False) => f,
            (Formula::True, _) | (_, Formula::True) => Formula::True,
            (a, b) => Formula::Or(vec![a, b]),
        }
    }

    pub fn negate(self) -> Formula {
        match self {
            Formula::True => Formula::False,
            Formula::False => Formula::True,
            Formula::Not(f) => *f,
            f => Formula::Not(Box::new(f)),
        }
    }

    /// `(self ∧ ¬other) ∨ (¬self ∧ other)`.
    pub fn xor(self, other: Formula) -> Formula {
        let left = self.clone().and(other.clone().negate());
        let right = self.negate().and(other);
        left.or(right)
    }
}

/// Evaluates formulas to BDDs, sharing fixpoints between the sub-formulas
/// of one job.
pub struct Evaluator<'a> {
    packet: &'a BddPacket,
    cache: Vec<(ReachQuery, BTreeMap<State, Ref>)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(packet: &'a BddPacket) -> Self {
        Self {
            packet,
            cache: Vec::new(),
        }
    }

    /// Header predicate of `formula` at `location`.
    ///
    /// Without a location, `Source` and `Reaches` stand for the union over
    /// every source location of their snapshot.
    pub fn eval(&mut self, formula: &Formula, location: Option<&IngressLocation>) -> Result<Ref> {
        let packet = self.packet;
        let bdd = packet.bdd();
        Ok(match formula {
            Formula::True => Ref::ONE,
            Formula::False => Ref::ZERO,
            Formula::Predicate(f) => *f,
            Formula::Source(input) => {
                packet.check_compatible(input.packet())?;
                match location {
                    Some(location) => input.source_predicate(location).unwrap_or(Ref::ZERO),
                    None => bdd.apply_or_many(input.sources().values().copied()),
                }
            }
            Formula::Reaches(query) => {
                packet.check_compatible(query.input.packet())?;
                match location {
                    Some(location) => self.reaches(query, location),
                    None => {
                        let locations: Vec<IngressLocation> = query.input.locations().cloned().collect();
                        let mut res = Ref::ZERO;
                        for location in &locations {
                            let r = self.reaches(query, location);
                            res = bdd.apply_or(res, r);
                        }
                        res
                    }
                }
            }
            Formula::And(fs) => {
                let mut res = Ref::ONE;
                for f in fs {
                    res = bdd.apply_and(res, self.eval(f, location)?);
                    if res == Ref::ZERO {
                        break;
                    }
                }
                res
            }
            Formula::Or(fs) => {
                let mut res = Ref::ZERO;
                for f in fs {
                    res = bdd.apply_or(res, self.eval(f, location)?);
                    if res == Ref::ONE {
                        break;
                    }
                }
                res
            }
            Formula::Not(f) => -self.eval(f, location)?,
        })
    }

    fn reaches(&mut self, query: &ReachQuery, location: &IngressLocation) -> Ref {
        let packet = self.packet;
        let origin = SynthesizerInput::origin_state(location);
        let transit = effective_transit(query);
        if let Some((_, reach)) = self.cache.iter().find(|(q, _)| q.same_as(query)) {
            return reachability::origin_predicate(packet, reach, &origin, &transit);
        }

        let sinks = sink_predicates(packet, query);
        let reach = reachability::backward(packet, query.input.graph(), &sinks, &transit);
        let res = reachability::origin_predicate(packet, &reach, &origin, &transit);
        self.cache.push((query.clone(), reach));
        res
    }
}

/// Crossing an edge out of a required node already satisfies the requirement.
fn effective_transit(query: &ReachQuery) -> TransitConstraints {
    match &query.sinks {
        Sinks::EdgeTraversal(edge) if query.transit.required.contains(&edge.tail.node) => TransitConstraints {
            required: BTreeSet::new(),
            forbidden: query.transit.forbidden.clone(),
        },
        _ => query.transit.clone(),
    }
}

fn sink_predicates(packet: &BddPacket, query: &ReachQuery) -> BTreeMap<State, Ref> {
    match &query.sinks {
        Sinks::Dispositions { actions, final_nodes } => query.input.sink_states(actions, final_nodes),
        Sinks::EdgeTraversal(edge) => {
            if query.transit.forbidden.contains(&edge.tail.node) {
                return BTreeMap::new();
            }
            let post_nat = State::PreOutEdgePostNat(edge.clone());
            let pre_in = State::PreInInterface {
                node: edge.head.node.clone(),
                interface: edge.head.interface.clone(),
            };
            match query.input.graph().edge(&post_nat, &pre_in) {
                Some(e) => BTreeMap::from([(post_nat, e.transition.backward(packet, Ref::ONE))]),
                None => BTreeMap::new(),
            }
        }
    }
}

/// A formula together with the locations to evaluate it at.
#[derive(Debug, Clone)]
pub struct Query {
    pub packet: Arc<BddPacket>,
    /// Source and header restrictions.
    pub constraint: Formula,
    /// The property witnesses must satisfy.
    pub property: Formula,
    pub locations: Vec<IngressLocation>,
    /// Witness tags, the first entry whose formula holds for the witness wins.
    pub tags: Vec<(Formula, String)>,
    pub default_tag: String,
}

impl Query {
    fn new(input: &Arc<SynthesizerInput>, property: Formula) -> Self {
        Self {
            packet: input.packet().clone(),
            constraint: Formula::Source(input.clone()).and(Formula::Predicate(input.header_space())),
            property,
            locations: input.locations().cloned().collect(),
            tags: Vec::new(),
            default_tag: input.tag().to_string(),
        }
    }

    pub fn formula(&self) -> Formula {
        self.constraint.clone().and(self.property.clone())
    }
}

/// Packets from each location that end with one of `actions` at one of `final_nodes`.
pub fn standard(
    input: &Arc<SynthesizerInput>,
    actions: &BTreeSet<FlowDisposition>,
    final_nodes: &BTreeSet<String>,
) -> Query {
    let sinks = Sinks::Dispositions {
        actions: actions.clone(),
        final_nodes: final_nodes.clone(),
    };
    Query::new(input, Formula::Reaches(ReachQuery::new(input.clone(), sinks)))
}

/// Packets that both succeed and fail along different paths.
pub fn multipath(input: &Arc<SynthesizerInput>, final_nodes: &BTreeSet<String>) -> Query {
    let (success, failure): (BTreeSet<_>, BTreeSet<_>) =
        FlowDisposition::ALL.into_iter().partition(|d| d.is_success());
    let reaches = |actions: BTreeSet<FlowDisposition>| {
        Formula::Reaches(ReachQuery::new(
            input.clone(),
            Sinks::Dispositions {
                actions,
                final_nodes: final_nodes.clone(),
            },
        ))
    };
    Query::new(input, reaches(success).and(reaches(failure)))
}

/// Packets silently dropped at one of `nodes`: no route, null route or an
/// unreachable neighbor.
pub fn black_hole(input: &Arc<SynthesizerInput>, nodes: &BTreeSet<String>) -> Query {
    let actions = FlowDisposition::ALL.into_iter().filter(|d| d.is_black_hole()).collect();
    standard(input, &actions, nodes)
}

/// Packets that cross `edge`.
pub fn edge_reachability(input: &Arc<SynthesizerInput>, edge: &Edge) -> Result<Query> {
    if !input.enabled_edges().contains(edge) {
        return Err(Error::InvalidParameters(format!("Edge {} is not an enabled topology edge", edge)));
    }
    let reaches = ReachQuery::new(input.clone(), Sinks::EdgeTraversal(edge.clone()));
    Ok(Query::new(input, Formula::Reaches(reaches)))
}

/// Packets whose outcome differs between two snapshots.
///
/// Both queries must come from the same packet. Locations are restricted to
/// those of both snapshots, and per-location constraints are joined.
pub fn differential(base: &Query, delta: &Query) -> Result<Query> {
    base.packet.check_compatible(&delta.packet)?;

    let delta_locations: BTreeSet<&IngressLocation> = delta.locations.iter().collect();
    let locations: Vec<IngressLocation> = base
        .locations
        .iter()
        .filter(|l| delta_locations.contains(l))
        .cloned()
        .collect();
    debug!(
        "Differential query over {} of {}/{} locations",
        locations.len(),
        base.locations.len(),
        delta.locations.len()
    );

    let only_base = base.property.clone().and(delta.property.clone().negate());
    let only_delta = base.property.clone().negate().and(delta.property.clone());
    Ok(Query {
        packet: base.packet.clone(),
        constraint: base.constraint.clone().or(delta.constraint.clone()),
        property: base.property.clone().xor(delta.property.clone()),
        locations,
        tags: vec![(only_base, BASE_TAG.to_string()), (only_delta, DELTA_TAG.to_string())],
        default_tag: String::new(),
    })
}

/// One line of one ACL.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AclLineKey {
    pub node: String,
    pub acl: String,
    pub line: usize,
}

/// Per-line existence queries: `matchable` ignores earlier lines,
/// `reachable` excludes packets matched by them.
#[derive(Debug, Clone)]
pub struct AclLineQueries {
    pub packet: Arc<BddPacket>,
    pub matchable: BTreeMap<AclLineKey, Formula>,
    pub reachable: BTreeMap<AclLineKey, Formula>,
}

/// Line reachability queries for the given `(node, acl)` pairs.
///
/// With `specialize`, every line is checked against a copy of the ACL
/// truncated after it and simplified with respect to the header space.
pub fn acl_lines(
    input: &SynthesizerInput,
    acls: &BTreeSet<(String, String)>,
    specialize: bool,
) -> Result<AclLineQueries> {
    let packet = input.packet();
    let bdd = packet.bdd();
    let header = input.header_space();
    let mut matchable = BTreeMap::new();
    let mut reachable = BTreeMap::new();

    for (node, name) in acls {
        let compiled = compiled_acl(input, node, name)?;
        let node_acls = input.configs().get(node).map(|c| &c.acls).ok_or_else(|| {
            Error::InvalidParameters(format!("Unknown node '{}'", node))
        })?;

        for (line, compiled_line) in compiled.lines.iter().enumerate() {
            let key = AclLineKey {
                node: node.clone(),
                acl: name.clone(),
                line,
            };
            let reached = if specialize {
                let sources = input.source_manager(node).ok_or_else(|| {
                    Error::InvalidParameters(format!("No source manager for node '{}'", node))
                })?;
                let specialized = AclSpecializer::new(packet, header).specialize_upto(node_acls, name, line);
                let mut compiler = AclCompiler::new(packet, node, &specialized, sources)?;
                compiler.compile(name)?.lines[line].reached
            } else {
                compiled_line.reached
            };
            matchable.insert(key.clone(), Formula::Predicate(bdd.apply_and(compiled_line.matched, header)));
            reachable.insert(key, Formula::Predicate(bdd.apply_and(reached, header)));
        }
    }

    Ok(AclLineQueries {
        packet: packet.clone(),
        matchable,
        reachable,
    })
}

fn compiled_acl<'a>(input: &'a SynthesizerInput, node: &str, acl: &str) -> Result<&'a CompiledAcl> {
    input
        .compiled_acl(node, acl)
        .ok_or_else(|| Error::InvalidParameters(format!("No ACL '{}' on node '{}'", acl, node)))
}

/// Why an ACL line never matches first.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockingLines {
    /// Earlier lines that together cover the line, in line order.
    pub lines: Vec<usize>,
    /// Some blocking line takes the opposite action.
    pub different_action: bool,
}

/// Minimal set of earlier lines covering line `k` of a compiled ACL.
///
/// Lines are picked greedily by decreasing overlap with line `k`, then
/// lines made redundant by later picks are dropped. Returns `None` if line
/// `k` is reachable or unmatchable.
pub fn blocking_lines(packet: &BddPacket, acl: &CompiledAcl, k: usize) -> Option<BlockingLines> {
    let bdd = packet.bdd();
    let target = acl.lines.get(k)?;
    if target.matched == Ref::ZERO || target.reached != Ref::ZERO {
        return None;
    }

    let num_vars = packet.num_vars() as usize;
    let mut candidates: Vec<(BigUint, usize)> = acl.lines[..k]
        .iter()
        .enumerate()
        .filter_map(|(j, line)| {
            let overlap = bdd.apply_and(line.matched, target.matched);
            (overlap != Ref::ZERO).then(|| (bdd.sat_count(overlap, num_vars), j))
        })
        .collect();
    candidates.sort_by(|(a, i), (b, j)| b.cmp(a).then(i.cmp(j)));

    let mut picked = Vec::new();
    let mut remaining = target.matched;
    for (_, j) in candidates {
        if remaining == Ref::ZERO {
            break;
        }
        let next = bdd.apply_diff(remaining, acl.lines[j].matched);
        if next != remaining {
            picked.push(j);
            remaining = next;
        }
    }

    // Drop picks covered by the others.
    let mut i = 0;
    while i < picked.len() {
        let others = bdd.apply_or_many(
            picked
                .iter()
                .enumerate()
                .filter(|&(p, _)| p != i)
                .map(|(_, &j)| acl.lines[j].matched),
        );
        if bdd.is_implies(target.matched, others) {
            picked.remove(i);
        } else {
            i += 1;
        }
    }
    picked.sort_unstable();

    let different_action = picked.iter().any(|&j| acl.lines[j].action != target.action);
    Some(BlockingLines {
        lines: picked,
        different_action,
    })
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::acl::{AclLine, AclLineMatchExpr, IpAccessList};
    use crate::header_space::{HeaderField, HeaderSpace};
    use crate::ip::{IpSpace, Prefix};
    use crate::model::{Configuration, Interface, NodeInterfacePair, StaticDataPlane, Topology, DEFAULT_VRF};
    use crate::encoder::NetworkEncoder;

    fn src(prefix: &str) -> AclLineMatchExpr {
        AclLineMatchExpr::header_space(HeaderSpace::builder().src_ips(Prefix::parse(prefix).unwrap()).build())
    }

    fn single_node(acl: IpAccessList, accepted: &str) -> Arc<SynthesizerInput> {
        let config = Configuration::new("r1")
            .with_interface(Interface::new("eth0").with_incoming_filter(acl.name.clone()))
            .with_acl(acl);
        let dp = StaticDataPlane::new().with_accepted("r1", DEFAULT_VRF, Prefix::parse(accepted).unwrap());
        let configs = BTreeMap::from([("r1".to_string(), config)]);
        let input = NetworkEncoder::new(Arc::new(BddPacket::default()), Arc::new(configs), &dp, &Topology::default())
            .sources(BTreeMap::from([(IngressLocation::interface_link("r1", "eth0"), IpSpace::Universe)]))
            .encode()
            .unwrap();
        Arc::new(input)
    }

    #[test]
    fn test_standard_reachability() {
        let input = single_node(
            IpAccessList::new("A", vec![AclLine::permit("p", src("10.0.0.0/8"))]),
            "1.1.1.0/24",
        );
        let packet = input.packet().clone();
        let query = standard(
            &input,
            &BTreeSet::from([FlowDisposition::Accepted]),
            &BTreeSet::from(["r1".to_string()]),
        );
        let mut evaluator = Evaluator::new(&packet);
        let res = evaluator.eval(&query.formula(), Some(&query.locations[0])).unwrap();

        let bdd = packet.bdd();
        let expected = bdd.apply_and(
            packet.prefix(HeaderField::SrcIp, Prefix::parse("10.0.0.0/8").unwrap()),
            packet.prefix(HeaderField::DstIp, Prefix::parse("1.1.1.0/24").unwrap()),
        );
        assert_eq!(res, expected);
    }

    #[test]
    fn test_formula_combinators() {
        let p = Formula::Predicate(Ref::new(5));
        assert!(matches!(Formula::True.and(p.clone()), Formula::Predicate(_)));
        assert!(matches!(Formula::False.and(p.clone()), Formula::False));
        assert!(matches!(p.clone().negate().negate(), Formula::Predicate(_)));
        assert!(matches!(p.or(Formula::True), Formula::True));
    }

    #[test]
    fn test_xor_formula() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let a = bdd.mk_var(1);
        let b = bdd.mk_var(2);
        let f = Formula::Predicate(a).xor(Formula::Predicate(b));
        let res = Evaluator::new(&packet).eval(&f, None).unwrap();
        assert_eq!(res, bdd.apply_xor(a, b));
    }

    #[test]
    fn test_incompatible_packets() {
        let acl = IpAccessList::new("A", vec![AclLine::permit("p", AclLineMatchExpr::True)]);
        let base = single_node(acl.clone(), "1.1.1.0/24");
        let delta = single_node(acl, "1.1.1.0/24");
        let actions = BTreeSet::from([FlowDisposition::Accepted]);
        let nodes = BTreeSet::from(["r1".to_string()]);

        let err = differential(&standard(&base, &actions, &nodes), &standard(&delta, &actions, &nodes)).unwrap_err();
        assert_eq!(err, Error::IncompatiblePacket);
    }

    #[test]
    fn test_shadowed_and_unmatchable_lines() {
        let acl = IpAccessList::new(
            "A",
            vec![
                AclLine::permit("any", AclLineMatchExpr::True),
                AclLine::deny("deny-any", AclLineMatchExpr::True),
                AclLine::deny("never", AclLineMatchExpr::False),
            ],
        );
        let input = single_node(acl, "1.1.1.0/24");
        let packet = input.packet().clone();
        let acls = BTreeSet::from([("r1".to_string(), "A".to_string())]);

        for specialize in [false, true] {
            let queries = acl_lines(&input, &acls, specialize).unwrap();
            let mut evaluator = Evaluator::new(&packet);
            let key = |line| AclLineKey {
                node: "r1".to_string(),
                acl: "A".to_string(),
                line,
            };
            let sat = |ev: &mut Evaluator, f: &Formula| ev.eval(f, None).unwrap() != Ref::ZERO;

            assert!(sat(&mut evaluator, &queries.reachable[&key(0)]));
            assert!(sat(&mut evaluator, &queries.matchable[&key(1)]));
            assert!(!sat(&mut evaluator, &queries.reachable[&key(1)]));
            assert!(!sat(&mut evaluator, &queries.matchable[&key(2)]));
        }

        let compiled = input.compiled_acl("r1", "A").unwrap();
        let blocking = blocking_lines(&packet, compiled, 1).unwrap();
        assert_eq!(blocking.lines, vec![0]);
        assert!(blocking.different_action);
        assert_eq!(blocking_lines(&packet, compiled, 2), None);
    }

    #[test]
    fn test_blocking_lines_are_minimal() {
        let acl = IpAccessList::new(
            "B",
            vec![
                AclLine::deny("small", src("10.0.0.0/24")),
                AclLine::deny("low", src("10.0.0.0/9")),
                AclLine::deny("high", src("10.128.0.0/9")),
                AclLine::deny("all-10", src("10.0.0.0/8")),
            ],
        );
        let input = single_node(acl, "1.1.1.0/24");
        let packet = input.packet().clone();
        let compiled = input.compiled_acl("r1", "B").unwrap();

        let blocking = blocking_lines(&packet, compiled, 3).unwrap();
        assert_eq!(blocking.lines, vec![1, 2]);
        assert!(!blocking.different_action);
    }

    #[test]
    fn test_edge_reachability() {
        let a = Configuration::new("a").with_interface(Interface::new("e0")).with_interface(Interface::new("lan"));
        let b = Configuration::new("b").with_interface(Interface::new("e0"));
        let mut topology = Topology::default();
        topology.connect(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let ab = Edge::new(NodeInterfacePair::new("a", "e0"), NodeInterfacePair::new("b", "e0"));
        let dp = StaticDataPlane::new().with_route(DEFAULT_VRF, &ab, Prefix::parse("2.0.0.0/8").unwrap());
        let configs = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);
        let location = IngressLocation::interface_link("a", "lan");
        let input = Arc::new(
            NetworkEncoder::new(Arc::new(BddPacket::default()), Arc::new(configs), &dp, &topology)
                .sources(BTreeMap::from([(location.clone(), IpSpace::Universe)]))
                .encode()
                .unwrap(),
        );
        let packet = input.packet().clone();

        let query = edge_reachability(&input, &ab).unwrap();
        let res = Evaluator::new(&packet).eval(&query.formula(), Some(&location)).unwrap();
        assert_eq!(res, packet.prefix(HeaderField::DstIp, Prefix::parse("2.0.0.0/8").unwrap()));

        let missing = Edge::new(NodeInterfacePair::new("a", "lan"), NodeInterfacePair::new("b", "e0"));
        assert!(matches!(edge_reachability(&input, &missing), Err(Error::InvalidParameters(_))));
    }
}
