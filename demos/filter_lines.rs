use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;

use netbdd::acl::{AclLine, AclLineMatchExpr, IpAccessList};
use netbdd::analysis::{Analyzer, Snapshot};
use netbdd::compiler::{AclCompiler, SourceManager};
use netbdd::header_space::{HeaderSpace, SubRange};
use netbdd::ip::Prefix;
use netbdd::model::{Configuration, Interface, StaticDataPlane, Topology};
use netbdd::params::{AclLineParameters, NodeSpecifier};
use netbdd::settings::Settings;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// ACL in JSON form; a built-in sample is used if omitted.
    #[arg(value_name = "FILE")]
    acl: Option<PathBuf>,

    /// Restrict the analysis to this destination prefix.
    #[clap(long, value_name = "PREFIX")]
    dst: Option<String>,

    /// Check lines against the full ACL instead of a specialized copy.
    #[clap(long)]
    no_specialize: bool,

    /// Print the BDD of the packets matched by each shadowed line.
    #[clap(long)]
    dot: bool,
}

fn sample() -> IpAccessList {
    let dst = |s: &str| HeaderSpace::builder().dst_ips(s.parse::<Prefix>().unwrap()).build();
    let tcp = |port: u32| {
        HeaderSpace::builder()
            .ip_protocols([6])
            .dst_ports([SubRange::singleton(port)])
            .build()
    };
    IpAccessList::new(
        "EDGE-IN",
        vec![
            AclLine::deny("deny-mgmt", AclLineMatchExpr::header_space(dst("10.255.0.0/16"))),
            AclLine::permit("permit-web", AclLineMatchExpr::header_space(tcp(80))),
            AclLine::deny("deny-mgmt-web", AclLineMatchExpr::header_space(dst("10.255.1.0/24").and(tcp(80)))),
            AclLine::permit("permit-ssh-mgmt", AclLineMatchExpr::header_space(dst("10.255.2.0/24").and(tcp(22)))),
            AclLine::permit("permit-dns", AclLineMatchExpr::header_space(dst("10.0.0.53/32"))),
            AclLine::deny("deny-rest", AclLineMatchExpr::True),
            AclLine::permit("permit-never", AclLineMatchExpr::header_space(dst("10.1.0.0/16"))),
        ],
    )
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let args = Cli::parse();
    println!("args = {:?}", args);

    let acl: IpAccessList = match &args.acl {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => sample(),
    };
    println!("ACL {} with {} lines", acl.name, acl.lines.len());

    let config = Configuration::new("r1")
        .with_interface(Interface::new("eth0").with_incoming_filter(acl.name.clone()))
        .with_acl(acl.clone());
    let configs = BTreeMap::from([("r1".to_string(), config)]);
    let dp = StaticDataPlane::new();
    let topology = Topology::default();
    let snapshot = Snapshot::new(configs.clone(), &dp, &topology);

    let header_space = match &args.dst {
        Some(dst) => HeaderSpace::builder().dst_ips(dst.parse::<Prefix>()?).build(),
        None => HeaderSpace::Any,
    };
    let params = AclLineParameters {
        nodes: NodeSpecifier::names(["r1"]),
        header_space,
        specialize: Some(!args.no_specialize),
        ..AclLineParameters::default()
    };

    let analyzer = Analyzer::new(Settings::default());
    let answer = analyzer.acl_lines(&snapshot, &params)?;

    if answer.lines.is_empty() {
        println!("Every line is reachable");
    }
    for report in &answer.lines {
        let line = report.key.line;
        if report.unmatchable {
            println!("[{}] {} ({}): matches no packet", line, report.name, report.action);
            continue;
        }
        match &report.blocking {
            Some(blocking) => {
                let names: Vec<String> = blocking
                    .lines
                    .iter()
                    .map(|&j| format!("[{}] {}", j, acl.lines[j].name))
                    .collect();
                println!(
                    "[{}] {} ({}): shadowed by {}{}",
                    line,
                    report.name,
                    report.action,
                    names.join(", "),
                    if blocking.different_action { " with a different action" } else { "" }
                );
            }
            None => println!("[{}] {} ({}): unreachable", line, report.name, report.action),
        }
    }

    if args.dot {
        let packet = analyzer.packet();
        let sources = SourceManager::new("r1", ["eth0"])?;
        let mut compiler = AclCompiler::new(packet, "r1", &configs["r1"].acls, &sources)?;
        let compiled = compiler.compile(&acl.name)?;
        for report in answer.lines.iter().filter(|r| r.is_shadowed()) {
            let matched = compiled.lines[report.key.line].matched;
            println!("// {}", report.name);
            println!("{}", packet.bdd().to_dot(&[matched], |v| packet.var_name(v))?);
        }
    }

    Ok(())
}
