//! End-to-end analyses: resolve parameters, encode snapshots, synthesize
//! queries and solve them on the worker pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::acl::LineAction;
use crate::compiler::{CompiledAcl, CompiledLine};
use crate::encoder::{NetworkEncoder, SynthesizerInput};
use crate::error::{Error, Result};
use crate::executor::{batches, ExecutionReport, JobExecutor};
use crate::flow::Flow;
use crate::ip::IpSpace;
use crate::job::{CompositeNodJob, NodJob, NodSatJob};
use crate::location::IngressLocation;
use crate::model::{Configuration, DataPlane, Edge, Topology};
use crate::packet::BddPacket;
use crate::params::{
    resolve, resolve_acl_lines, resolve_sources, AclLineParameters, ReachabilityParameters, ResolvedParameters,
    ResolverContext,
};
use crate::query::{self, AclLineKey, BlockingLines, Formula, Query, BASE_TAG, DELTA_TAG};
use crate::reference::Ref;
use crate::settings::Settings;

/// Everything known about the network at one point in time.
#[derive(Clone)]
pub struct Snapshot<'a> {
    pub configs: Arc<BTreeMap<String, Configuration>>,
    pub data_plane: &'a dyn DataPlane,
    pub topology: &'a Topology,
}

impl<'a> Snapshot<'a> {
    pub fn new(
        configs: BTreeMap<String, Configuration>,
        data_plane: &'a dyn DataPlane,
        topology: &'a Topology,
    ) -> Self {
        Self {
            configs: Arc::new(configs),
            data_plane,
            topology,
        }
    }
}

/// Which property a reachability analysis looks for.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Question {
    /// Flows ending with one of the requested actions at a final node.
    Standard,
    /// Flows that both succeed and fail along different paths.
    Multipath,
    /// Flows silently dropped at a final node.
    BlackHole,
    /// Flows crossing the edge.
    Edge(Edge),
}

impl Question {
    fn synthesize(&self, input: &Arc<SynthesizerInput>, params: &ResolvedParameters) -> Result<Query> {
        Ok(match self {
            Question::Standard => query::standard(input, &params.actions, &params.final_nodes),
            Question::Multipath => query::multipath(input, &params.final_nodes),
            Question::BlackHole => query::black_hole(input, &params.final_nodes),
            Question::Edge(edge) => query::edge_reachability(input, edge)?,
        })
    }
}

/// Witness flows, at most one per source location.
#[derive(Debug, Default)]
pub struct FlowAnswer {
    pub flows: BTreeMap<IngressLocation, Flow>,
    pub failures: BTreeMap<String, Error>,
    /// Some jobs did not finish in time.
    pub partial: bool,
}

impl FlowAnswer {
    fn from_report(report: ExecutionReport<BTreeMap<IngressLocation, Flow>>) -> Self {
        let mut flows = BTreeMap::new();
        for (_, batch) in report.results {
            flows.extend(batch);
        }
        Self {
            flows,
            failures: report.failures,
            partial: report.partial,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Distinct witness flows.
    pub fn flow_set(&self) -> BTreeSet<Flow> {
        self.flows.values().cloned().collect()
    }
}

/// Verdict for one ACL line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AclLineReport {
    pub key: AclLineKey,
    pub name: String,
    pub action: LineAction,
    /// No packet in the header space matches the line.
    pub unmatchable: bool,
    /// No packet in the header space reaches the line first.
    pub unreachable: bool,
    /// Earlier lines shadowing a matchable but unreachable line.
    pub blocking: Option<BlockingLines>,
}

impl AclLineReport {
    pub fn is_shadowed(&self) -> bool {
        self.unreachable && !self.unmatchable
    }
}

#[derive(Debug, Default)]
pub struct AclLineAnswer {
    /// Lines that are unmatchable or unreachable, in ACL order.
    pub lines: Vec<AclLineReport>,
    pub failures: BTreeMap<String, Error>,
    pub partial: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
enum LineCheck {
    Matchable,
    Reachable,
}

/// Entry point for all analyses of one session.
///
/// Every snapshot encoded by the same analyzer shares its [`BddPacket`],
/// so their artifacts can be combined.
pub struct Analyzer {
    settings: Settings,
    packet: Arc<BddPacket>,
    executor: JobExecutor,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Analyzer {
    pub fn new(settings: Settings) -> Self {
        let packet = Arc::new(BddPacket::new(settings.bdd_table_bits));
        let executor = JobExecutor::new(&settings);
        Self {
            settings,
            packet,
            executor,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn packet(&self) -> &Arc<BddPacket> {
        &self.packet
    }

    fn context<'b>(&'b self, configs: &'b BTreeMap<String, Configuration>) -> ResolverContext<'b> {
        ResolverContext {
            packet: &self.packet,
            configs,
            settings: &self.settings,
        }
    }

    /// Encode a snapshot for already resolved parameters.
    pub fn encode(
        &self,
        snapshot: &Snapshot,
        params: &ResolvedParameters,
        sources: BTreeMap<IngressLocation, IpSpace>,
        tag: &str,
    ) -> Result<Arc<SynthesizerInput>> {
        let input = NetworkEncoder::new(
            Arc::clone(&self.packet),
            Arc::clone(&snapshot.configs),
            snapshot.data_plane,
            snapshot.topology,
        )
        .header_space(params.header_space.clone())
        .transit(params.transit.clone())
        .sources(sources)
        .tag(tag)
        .encode()?;
        debug!("BDD holds {} nodes after encoding", self.packet.bdd().num_nodes());
        Ok(Arc::new(input))
    }

    pub fn reachability(&self, snapshot: &Snapshot, raw: &ReachabilityParameters) -> Result<FlowAnswer> {
        self.run(snapshot, raw, &Question::Standard)
    }

    pub fn multipath(&self, snapshot: &Snapshot, raw: &ReachabilityParameters) -> Result<FlowAnswer> {
        self.run(snapshot, raw, &Question::Multipath)
    }

    pub fn black_hole(&self, snapshot: &Snapshot, raw: &ReachabilityParameters) -> Result<FlowAnswer> {
        self.run(snapshot, raw, &Question::BlackHole)
    }

    pub fn edge_reachability(
        &self,
        snapshot: &Snapshot,
        raw: &ReachabilityParameters,
        edge: &Edge,
    ) -> Result<FlowAnswer> {
        self.run(snapshot, raw, &Question::Edge(edge.clone()))
    }

    /// Answer `question` on a single snapshot.
    pub fn run(&self, snapshot: &Snapshot, raw: &ReachabilityParameters, question: &Question) -> Result<FlowAnswer> {
        let params = resolve(raw, &self.context(&snapshot.configs))?;
        if params.differential {
            return Err(Error::InvalidParameters(
                "Differential parameters need a base and a delta snapshot".to_string(),
            ));
        }
        info!("{:?} analysis from {} locations", question, params.sources.len());

        let input = self.encode(snapshot, &params, params.sources.clone(), "")?;
        let query = Arc::new(question.synthesize(&input, &params)?);
        let batches = batches(&query.locations, self.executor.workers(), params.max_chunk_size);
        let report = self.executor.execute(NodJob::batched(&query, batches))?;
        Ok(FlowAnswer::from_report(report))
    }

    /// Flows whose outcome for `question` differs between two snapshots.
    ///
    /// Sources are resolved against each snapshot separately; only locations
    /// present in both are analyzed. Witnesses are tagged [`BASE_TAG`] or
    /// [`DELTA_TAG`] by the snapshot in which the property holds.
    pub fn differential(
        &self,
        base: &Snapshot,
        delta: &Snapshot,
        raw: &ReachabilityParameters,
        question: &Question,
    ) -> Result<FlowAnswer> {
        let params = resolve(raw, &self.context(&base.configs))?;
        let delta_sources = resolve_sources(&raw.sources, &raw.source_ips, &delta.configs)?;
        if delta_sources.is_empty() {
            return Err(Error::NoMatchingSourceLocations);
        }

        let base_input = self.encode(base, &params, params.sources.clone(), BASE_TAG)?;
        let delta_input = self.encode(delta, &params, delta_sources, DELTA_TAG)?;
        let query = Arc::new(query::differential(
            &question.synthesize(&base_input, &params)?,
            &question.synthesize(&delta_input, &params)?,
        )?);
        if query.locations.is_empty() {
            warn!("Base and delta snapshots share no source locations");
            return Ok(FlowAnswer::default());
        }
        info!("Differential {:?} analysis from {} locations", question, query.locations.len());

        let jobs = batches(&query.locations, self.executor.workers(), params.max_chunk_size)
            .into_iter()
            .map(|batch| CompositeNodJob::new(vec![Arc::clone(&query)], batch))
            .collect::<Result<Vec<_>>>()?;
        let report = self.executor.execute(jobs)?;
        Ok(FlowAnswer::from_report(report))
    }

    /// Unmatchable and shadowed lines of the selected ACLs.
    pub fn acl_lines(&self, snapshot: &Snapshot, raw: &AclLineParameters) -> Result<AclLineAnswer> {
        let params = resolve_acl_lines(raw, &self.context(&snapshot.configs))?;
        info!("Checking lines of {} ACLs", params.acls.len());

        let input = NetworkEncoder::new(
            Arc::clone(&self.packet),
            Arc::clone(&snapshot.configs),
            snapshot.data_plane,
            snapshot.topology,
        )
        .header_space(params.header_space.clone())
        .encode()?;
        let queries = query::acl_lines(&input, &params.acls, params.specialize)?;

        // One job per ACL.
        let mut per_acl: BTreeMap<(String, String), BTreeMap<(AclLineKey, LineCheck), Formula>> = BTreeMap::new();
        let checks = [
            (LineCheck::Matchable, &queries.matchable),
            (LineCheck::Reachable, &queries.reachable),
        ];
        for (check, formulas) in checks {
            for (key, formula) in formulas {
                per_acl
                    .entry((key.node.clone(), key.acl.clone()))
                    .or_default()
                    .insert((key.clone(), check), formula.clone());
            }
        }
        let jobs = per_acl
            .into_iter()
            .map(|((node, acl), formulas)| {
                NodSatJob::new(format!("acl-lines[{}/{}]", node, acl), Arc::clone(&queries.packet), formulas)
            })
            .collect();
        let report = self.executor.execute(jobs)?;

        let mut sat = BTreeMap::new();
        for (_, results) in report.results {
            sat.extend(results);
        }

        let header = input.header_space();
        let mut restricted: BTreeMap<(String, String), CompiledAcl> = BTreeMap::new();
        let mut lines = Vec::new();
        for key in queries.matchable.keys() {
            let (Some(&matchable), Some(&reachable)) = (
                sat.get(&(key.clone(), LineCheck::Matchable)),
                sat.get(&(key.clone(), LineCheck::Reachable)),
            ) else {
                debug!("No verdict for {:?}", key);
                continue;
            };
            if reachable {
                continue;
            }
            let Some(line) = snapshot
                .configs
                .get(&key.node)
                .and_then(|c| c.acls.get(&key.acl))
                .and_then(|acl| acl.lines.get(key.line))
            else {
                continue;
            };

            let blocking = if matchable {
                let acl_key = (key.node.clone(), key.acl.clone());
                if !restricted.contains_key(&acl_key) {
                    let Some(compiled) = input.compiled_acl(&key.node, &key.acl) else {
                        continue;
                    };
                    restricted.insert(acl_key.clone(), restrict(&self.packet, compiled, header));
                }
                restricted
                    .get(&acl_key)
                    .and_then(|acl| query::blocking_lines(&self.packet, acl, key.line))
            } else {
                None
            };

            lines.push(AclLineReport {
                key: key.clone(),
                name: line.name.clone(),
                action: line.action,
                unmatchable: !matchable,
                unreachable: true,
                blocking,
            });
        }

        info!("Found {} unreachable ACL lines", lines.len());
        Ok(AclLineAnswer {
            lines,
            failures: report.failures,
            partial: report.partial,
        })
    }
}

/// Restrict every line of a compiled ACL to `header`.
fn restrict(packet: &BddPacket, acl: &CompiledAcl, header: Ref) -> CompiledAcl {
    let bdd = packet.bdd();
    CompiledAcl {
        name: acl.name.clone(),
        lines: acl
            .lines
            .iter()
            .map(|line| CompiledLine {
                action: line.action,
                matched: bdd.apply_and(line.matched, header),
                reached: bdd.apply_and(line.reached, header),
            })
            .collect(),
        permit: bdd.apply_and(acl.permit, header),
        deny: bdd.apply_and(acl.deny, header),
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::acl::{AclLine, AclLineMatchExpr, IpAccessList};
    use crate::header_space::HeaderSpace;
    use crate::ip::{Ip, Prefix};
    use crate::model::{Interface, NodeInterfacePair, StaticDataPlane, DEFAULT_VRF};
    use crate::params::{LocationSpecifier, NodeSpecifier, SourceIps};

    fn filtered(permit: &str) -> BTreeMap<String, Configuration> {
        let acl = IpAccessList::new(
            "A",
            vec![AclLine::permit(
                "p",
                AclLineMatchExpr::header_space(HeaderSpace::builder().src_ips(Prefix::parse(permit).unwrap()).build()),
            )],
        );
        let config = Configuration::new("r1")
            .with_interface(Interface::new("eth0").with_incoming_filter("A"))
            .with_acl(acl);
        BTreeMap::from([("r1".to_string(), config)])
    }

    fn params() -> ReachabilityParameters {
        ReachabilityParameters {
            sources: LocationSpecifier::Interfaces(BTreeSet::from([NodeInterfacePair::new("r1", "eth0")])),
            source_ips: SourceIps::Space(IpSpace::Universe),
            ..ReachabilityParameters::default()
        }
    }

    #[test]
    fn test_reachability() {
        let dp = StaticDataPlane::new().with_accepted("r1", DEFAULT_VRF, Prefix::parse("10.0.0.0/8").unwrap());
        let topology = Topology::default();
        let snapshot = Snapshot::new(filtered("1.0.0.0/8"), &dp, &topology);
        let analyzer = Analyzer::new(Settings::default().with_workers(2));

        let answer = analyzer.reachability(&snapshot, &params()).unwrap();
        assert!(!answer.partial);
        let flow = &answer.flows[&IngressLocation::interface_link("r1", "eth0")];
        assert!(Prefix::parse("1.0.0.0/8").unwrap().contains(flow.src_ip));
        assert!(Prefix::parse("10.0.0.0/8").unwrap().contains(flow.dst_ip));

        let raw = ReachabilityParameters {
            differential: true,
            ..params()
        };
        assert!(matches!(
            analyzer.reachability(&snapshot, &raw),
            Err(Error::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_black_hole() {
        let dp = StaticDataPlane::new().with_accepted("r1", DEFAULT_VRF, Prefix::parse("10.0.0.0/8").unwrap());
        let topology = Topology::default();
        let snapshot = Snapshot::new(filtered("1.0.0.0/8"), &dp, &topology);
        let analyzer = Analyzer::default();

        let answer = analyzer.black_hole(&snapshot, &params()).unwrap();
        let flow = &answer.flows[&IngressLocation::interface_link("r1", "eth0")];
        // Nothing is routable, so everything outside 10/8 has no route.
        assert!(!Prefix::parse("10.0.0.0/8").unwrap().contains(flow.dst_ip));
    }

    #[test]
    fn test_differential() {
        let dp = StaticDataPlane::new().with_accepted("r1", DEFAULT_VRF, Prefix::parse("10.0.0.0/8").unwrap());
        let topology = Topology::default();
        let base = Snapshot::new(filtered("1.0.0.0/8"), &dp, &topology);
        let delta = Snapshot::new(filtered("2.0.0.0/8"), &dp, &topology);
        let analyzer = Analyzer::default();

        let answer = analyzer.differential(&base, &delta, &params(), &Question::Standard).unwrap();
        let flow = &answer.flows[&IngressLocation::interface_link("r1", "eth0")];
        let in_base = Prefix::parse("1.0.0.0/8").unwrap().contains(flow.src_ip);
        assert_eq!(flow.tag, if in_base { BASE_TAG } else { DELTA_TAG });

        let same = analyzer.differential(&base, &base, &params(), &Question::Standard).unwrap();
        assert!(same.is_empty());
    }

    #[test]
    fn test_acl_lines() {
        let acl = IpAccessList::new(
            "A",
            vec![
                AclLine::deny(
                    "deny-10",
                    AclLineMatchExpr::header_space(
                        HeaderSpace::builder()
                            .dst_ips(Prefix::parse("10.0.0.0/8").unwrap())
                            .build(),
                    ),
                ),
                AclLine::permit(
                    "permit-10-1",
                    AclLineMatchExpr::header_space(
                        HeaderSpace::builder()
                            .dst_ips(Prefix::parse("10.1.0.0/16").unwrap())
                            .build(),
                    ),
                ),
                AclLine::permit(
                    "never",
                    AclLineMatchExpr::header_space(HeaderSpace::builder().dst_ips(Ip::from_octets(1, 1, 1, 1)).build()),
                ),
            ],
        );
        let configs = BTreeMap::from([(
            "r1".to_string(),
            Configuration::new("r1").with_interface(Interface::new("eth0")).with_acl(acl),
        )]);
        let dp = StaticDataPlane::new();
        let topology = Topology::default();
        let snapshot = Snapshot::new(configs, &dp, &topology);
        let analyzer = Analyzer::default();

        let raw = AclLineParameters {
            nodes: NodeSpecifier::names(["r1"]),
            header_space: HeaderSpace::builder().dst_ips(Prefix::parse("10.0.0.0/8").unwrap()).build(),
            ..AclLineParameters::default()
        };
        let answer = analyzer.acl_lines(&snapshot, &raw).unwrap();
        assert_eq!(answer.lines.len(), 2);

        let shadowed = &answer.lines[0];
        assert_eq!(shadowed.name, "permit-10-1");
        assert!(shadowed.is_shadowed());
        assert_eq!(
            shadowed.blocking,
            Some(BlockingLines {
                lines: vec![0],
                different_action: true,
            })
        );

        let never = &answer.lines[1];
        assert_eq!(never.name, "never");
        assert!(never.unmatchable);
        assert_eq!(never.blocking, None);
        assert_eq!(never.action, LineAction::Permit);
    }
}
