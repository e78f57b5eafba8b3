use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use netbdd::acl::{AclLine, AclLineMatchExpr, IpAccessList};
use netbdd::analysis::{Analyzer, Question, Snapshot};
use netbdd::header_space::{HeaderSpace, SubRange};
use netbdd::ip::Prefix;
use netbdd::model::{
    Configuration, Edge, Interface, NodeInterfacePair, SourceNat, StaticDataPlane, Topology, DEFAULT_VRF,
};
use netbdd::params::{NodeSpecifier, ReachabilityParameters};
use netbdd::settings::Settings;
use netbdd::trace::FlowTracer;

#[derive(Debug, Copy, Clone, ValueEnum)]
enum Kind {
    Standard,
    Multipath,
    BlackHole,
    Edge,
}

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Destination prefix to ask about.
    #[arg(value_name = "PREFIX", default_value = "10.2.0.0/16")]
    dst: String,

    /// Kind of question.
    #[clap(long, value_enum, default_value = "standard")]
    kind: Kind,

    /// Compare against a snapshot where the border filter also blocks SSH.
    #[clap(long)]
    differential: bool,

    /// Number of worker threads (0 = all cores).
    #[clap(long, value_name = "INT", default_value = "0")]
    workers: usize,

    /// Time budget in milliseconds.
    #[clap(long, value_name = "INT")]
    timeout: Option<u64>,

    /// BDD size (in bits, so the actual size is `2^size` nodes).
    #[clap(long, value_name = "INT", default_value = "16")]
    size: usize,
}

fn prefix(s: &str) -> Prefix {
    s.parse().unwrap()
}

/// `edge -- border -- core`, with source NAT out of the edge router.
fn network(block_ssh: bool) -> (BTreeMap<String, Configuration>, StaticDataPlane, Topology) {
    let mut lines = vec![AclLine::deny(
        "deny-telnet",
        AclLineMatchExpr::header_space(
            HeaderSpace::builder()
                .ip_protocols([6])
                .dst_ports([SubRange::singleton(23)])
                .build(),
        ),
    )];
    if block_ssh {
        lines.push(AclLine::deny(
            "deny-ssh",
            AclLineMatchExpr::header_space(
                HeaderSpace::builder()
                    .ip_protocols([6])
                    .dst_ports([SubRange::singleton(22)])
                    .build(),
            ),
        ));
    }
    lines.push(AclLine::permit("permit-any", AclLineMatchExpr::True));

    let edge = Configuration::new("edge")
        .with_interface(Interface::new("lan").with_prefix(prefix("192.168.1.0/24")))
        .with_interface(Interface::new("up").with_prefix(prefix("172.16.0.0/31")).with_source_nat(SourceNat {
            acl: None,
            pool_start: "100.64.0.1".parse().unwrap(),
            pool_end: "100.64.0.10".parse().unwrap(),
        }));
    let border = Configuration::new("border")
        .with_interface(
            Interface::new("down")
                .with_prefix(prefix("172.16.0.0/31"))
                .with_incoming_filter("BORDER-IN"),
        )
        .with_interface(Interface::new("up").with_prefix(prefix("172.16.1.0/31")))
        .with_acl(IpAccessList::new("BORDER-IN", lines));
    let core = Configuration::new("core")
        .with_interface(Interface::new("down").with_prefix(prefix("172.16.1.0/31")))
        .with_interface(Interface::new("servers").with_prefix(prefix("10.2.0.0/16")));

    let mut topology = Topology::default();
    topology.connect(NodeInterfacePair::new("edge", "up"), NodeInterfacePair::new("border", "down"));
    topology.connect(NodeInterfacePair::new("border", "up"), NodeInterfacePair::new("core", "down"));

    let edge_border = Edge::new(NodeInterfacePair::new("edge", "up"), NodeInterfacePair::new("border", "down"));
    let border_core = Edge::new(NodeInterfacePair::new("border", "up"), NodeInterfacePair::new("core", "down"));
    let dp = StaticDataPlane::new()
        .with_route(DEFAULT_VRF, &edge_border, prefix("10.0.0.0/8"))
        .with_route(DEFAULT_VRF, &border_core, prefix("10.2.0.0/16"))
        .with_null_route("border", DEFAULT_VRF, prefix("10.66.0.0/16"))
        .with_accepted("core", DEFAULT_VRF, prefix("10.2.0.0/16"));

    let configs = [edge, border, core].into_iter().map(|c| (c.hostname.clone(), c)).collect();
    (configs, dp, topology)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let mut settings = Settings::default().with_workers(args.workers).with_bdd_table_bits(args.size);
    if let Some(ms) = args.timeout {
        settings = settings.with_timeout(Duration::from_millis(ms));
    }
    let analyzer = Analyzer::new(settings);

    let (configs, dp, topology) = network(false);
    let snapshot = Snapshot::new(configs.clone(), &dp, &topology);
    let params = ReachabilityParameters {
        header_space: HeaderSpace::builder().dst_ips(args.dst.parse::<Prefix>()?).build(),
        final_nodes: match args.kind {
            Kind::BlackHole => NodeSpecifier::names(["border", "core", "edge"]),
            _ => NodeSpecifier::All,
        },
        ..ReachabilityParameters::default()
    };
    let question = match args.kind {
        Kind::Standard => Question::Standard,
        Kind::Multipath => Question::Multipath,
        Kind::BlackHole => Question::BlackHole,
        Kind::Edge => Question::Edge(Edge::new(
            NodeInterfacePair::new("border", "up"),
            NodeInterfacePair::new("core", "down"),
        )),
    };

    let answer = if args.differential {
        let (delta_configs, delta_dp, delta_topology) = network(true);
        let delta = Snapshot::new(delta_configs, &delta_dp, &delta_topology);
        analyzer.differential(&snapshot, &delta, &params, &question)?
    } else {
        analyzer.run(&snapshot, &params, &question)?
    };

    println!("Found {} witness flows", answer.flows.len());
    let tracer = FlowTracer::new(&configs, &dp, &topology)?;
    for (location, flow) in &answer.flows {
        println!("{}: {}", location, flow);
        if !args.differential {
            for trace in tracer.trace(flow) {
                let path: Vec<&str> = trace.hops.iter().map(|h| h.node.as_str()).collect();
                println!("    {} via {}", trace.disposition, path.join(" -> "));
            }
        }
    }
    if answer.partial {
        println!("Results are partial: the time budget ran out");
    }
    for (job, error) in &answer.failures {
        println!("Job {} failed: {}", job, error);
    }

    let (hits, misses) = analyzer.packet().bdd().cache_stats();
    println!("BDD nodes: {}, cache hits: {}, misses: {}", analyzer.packet().bdd().num_nodes(), hits, misses);

    let time_total = time_total.elapsed();
    println!("Done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
