//! Solver jobs: evaluate formulas and extract witness flows.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::executor::Job;
use crate::flow::Flow;
use crate::location::IngressLocation;
use crate::packet::BddPacket;
use crate::query::{Evaluator, Formula, Query};
use crate::reference::Ref;

/// Fill in the ingress point of a witness.
fn located(mut flow: Flow, location: &IngressLocation) -> Flow {
    match location {
        IngressLocation::Vrf { node, vrf } => {
            flow.ingress_node = node.clone();
            flow.ingress_vrf = Some(vrf.clone());
        }
        IngressLocation::InterfaceLink { node, interface } => {
            flow.ingress_node = node.clone();
            flow.ingress_interface = Some(interface.clone());
        }
    }
    flow
}

/// Witnesses for `formula` at each location of the batch, tagged with the
/// first tag whose formula holds for the witness.
fn witnesses(
    packet: &BddPacket,
    formula: &Formula,
    tags: &[(Formula, String)],
    default_tag: &str,
    locations: &[IngressLocation],
    cancel: &AtomicBool,
) -> Result<BTreeMap<IngressLocation, Flow>> {
    let bdd = packet.bdd();
    let mut evaluator = Evaluator::new(packet);
    let mut out = BTreeMap::new();

    for location in locations {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let f = evaluator.eval(formula, Some(location))?;
        let Some(flow) = packet.witness(f) else {
            debug!("No witness at {}", location);
            continue;
        };

        let point = packet.flow_predicate(&flow);
        let mut tag = default_tag;
        for (tag_formula, name) in tags {
            let t = evaluator.eval(tag_formula, Some(location))?;
            if bdd.and_sat(t, point) {
                tag = name;
                break;
            }
        }
        out.insert(location.clone(), located(flow, location).with_tag(tag));
    }
    Ok(out)
}

/// One witness per location for a single query.
pub struct NodJob {
    query: Arc<Query>,
    locations: Vec<IngressLocation>,
}

impl NodJob {
    pub fn new(query: Arc<Query>, locations: Vec<IngressLocation>) -> Self {
        Self { query, locations }
    }

    /// One job per batch of the query's locations.
    pub fn batched(query: &Arc<Query>, batches: Vec<Vec<IngressLocation>>) -> Vec<Self> {
        batches.into_iter().map(|b| Self::new(Arc::clone(query), b)).collect()
    }
}

impl Job for NodJob {
    type Output = BTreeMap<IngressLocation, Flow>;

    fn id(&self) -> String {
        match (self.locations.first(), self.locations.last()) {
            (Some(first), Some(last)) => format!("nod[{}..{}]", first, last),
            _ => "nod[]".to_string(),
        }
    }

    fn run(&self, cancel: &AtomicBool) -> Result<Self::Output> {
        let q = &self.query;
        witnesses(&q.packet, &q.formula(), &q.tags, &q.default_tag, &self.locations, cancel)
    }
}

/// Satisfiability of one formula per key, evaluated without a location.
pub struct NodSatJob<K> {
    name: String,
    packet: Arc<BddPacket>,
    formulas: BTreeMap<K, Formula>,
}

impl<K> NodSatJob<K> {
    pub fn new(name: impl Into<String>, packet: Arc<BddPacket>, formulas: BTreeMap<K, Formula>) -> Self {
        Self {
            name: name.into(),
            packet,
            formulas,
        }
    }
}

impl<K> Job for NodSatJob<K>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
{
    type Output = BTreeMap<K, bool>;

    fn id(&self) -> String {
        self.name.clone()
    }

    fn run(&self, cancel: &AtomicBool) -> Result<Self::Output> {
        let mut evaluator = Evaluator::new(&self.packet);
        let mut out = BTreeMap::new();
        for (key, formula) in &self.formulas {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let sat = evaluator.eval(formula, None)? != Ref::ZERO;
            debug!("{:?}: {}", key, if sat { "SAT" } else { "UNSAT" });
            out.insert(key.clone(), sat);
        }
        Ok(out)
    }
}

/// Conjunction of several queries, solved as one formula per location.
///
/// Locations are those of the batch that every query covers. Tags of all
/// queries are tried in order.
pub struct CompositeNodJob {
    packet: Arc<BddPacket>,
    queries: Vec<Arc<Query>>,
    locations: Vec<IngressLocation>,
}

impl CompositeNodJob {
    /// Fails with `IncompatiblePacket` if the queries do not share a packet.
    pub fn new(queries: Vec<Arc<Query>>, batch: Vec<IngressLocation>) -> Result<Self> {
        let Some(first) = queries.first() else {
            return Err(Error::InvalidParameters("Composite job without queries".to_string()));
        };
        let packet = Arc::clone(&first.packet);
        for query in &queries[1..] {
            packet.check_compatible(&query.packet)?;
        }
        let locations = batch
            .into_iter()
            .filter(|l| queries.iter().all(|q| q.locations.contains(l)))
            .collect();
        Ok(Self {
            packet,
            queries,
            locations,
        })
    }

    pub fn locations(&self) -> &[IngressLocation] {
        &self.locations
    }
}

impl Job for CompositeNodJob {
    type Output = BTreeMap<IngressLocation, Flow>;

    fn id(&self) -> String {
        match (self.locations.first(), self.locations.last()) {
            (Some(first), Some(last)) => format!("composite[{}..{}]", first, last),
            _ => "composite[]".to_string(),
        }
    }

    fn run(&self, cancel: &AtomicBool) -> Result<Self::Output> {
        let formula = self
            .queries
            .iter()
            .fold(Formula::True, |acc, q| acc.and(q.formula()));
        let tags: Vec<(Formula, String)> = self.queries.iter().flat_map(|q| q.tags.iter().cloned()).collect();
        let default_tag = self.queries.first().map_or("", |q| q.default_tag.as_str());
        witnesses(&self.packet, &formula, &tags, default_tag, &self.locations, cancel)
    }
}
