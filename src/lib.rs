//! # netbdd: symbolic network reachability on BDDs
//!
//! **`netbdd`** answers questions about which packets can get where in a network, without
//! enumerating packets. Packet headers are encoded as boolean variables of a single shared
//! [`Bdd`][crate::bdd::Bdd] manager, device behavior (filters, forwarding, source NAT) is
//! compiled into transitions of a reachability graph, and questions become formulas whose
//! satisfying assignments decode to concrete witness [`Flow`][crate::flow::Flow]s.
//!
//! ## Pipeline
//!
//! 1. **Resolve** raw [`ReachabilityParameters`][crate::params::ReachabilityParameters]
//!    against the snapshot. All validation happens here.
//! 2. **Encode** the snapshot with a [`NetworkEncoder`][crate::encoder::NetworkEncoder] into a
//!    [`SynthesizerInput`][crate::encoder::SynthesizerInput]: compiled ACLs, forwarding
//!    predicates and the reachability graph.
//! 3. **Synthesize** a [`Query`][crate::query::Query] (standard, multipath, black hole, edge,
//!    ACL line, or the differential of two queries).
//! 4. **Solve** the query with [`NodJob`][crate::job::NodJob]s on the bounded
//!    [`JobExecutor`][crate::executor::JobExecutor], one witness per source location.
//!
//! The [`Analyzer`][crate::analysis::Analyzer] wires these steps together.
//!
//! ## Quick Start
//!
//! ```rust
//! use netbdd::analysis::{Analyzer, Snapshot};
//! use netbdd::ip::Prefix;
//! use netbdd::model::{Configuration, Interface, StaticDataPlane, Topology, DEFAULT_VRF};
//! use netbdd::params::ReachabilityParameters;
//!
//! let lan = Prefix::parse("192.168.0.0/24")?;
//! let r1 = Configuration::new("r1").with_interface(Interface::new("eth0").with_prefix(lan));
//! let dp = StaticDataPlane::new().with_accepted("r1", DEFAULT_VRF, Prefix::parse("10.0.0.0/8")?);
//! let topology = Topology::default();
//! let snapshot = Snapshot::new([("r1".to_string(), r1)].into(), &dp, &topology);
//!
//! let answer = Analyzer::default().reachability(&snapshot, &ReachabilityParameters::default())?;
//! for flow in answer.flows.values() {
//!     assert!(lan.contains(flow.src_ip));
//! }
//! assert!(!answer.is_empty());
//! # Ok::<(), netbdd::error::Error>(())
//! ```
//!
//! ## Core Components
//!
//! - **[`bdd`]**: the BDD manager with complement edges and a computed-table cache.
//! - **[`packet`]**: the fixed variable layout of packet headers and transient state.
//! - **[`compiler`]**: first-match ACL compilation, reference checking and specialization.
//! - **[`encoder`]**, **[`reachability`]**: the per-snapshot reachability graph.
//! - **[`query`]**, **[`job`]**, **[`executor`]**: formulas, solver jobs and the worker pool.
//! - **[`params`]**, **[`settings`]**: what callers configure.
//! - **[`trace`]**: concrete replay of flows, independent of the symbolic encoding.

pub mod acl;
pub mod analysis;
pub mod bdd;
pub mod cache;
pub mod compiler;
pub mod dot;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod flow;
pub mod header_space;
pub mod ip;
pub mod job;
pub mod location;
pub mod model;
pub mod packet;
pub mod params;
pub mod query;
pub mod reachability;
pub mod reference;
pub mod sat;
pub mod settings;
pub mod structure;
pub mod table;
pub mod trace;
pub mod utils;

pub use analysis::{Analyzer, Snapshot};
pub use error::{Error, Result};
pub use flow::{Flow, FlowDisposition};
pub use packet::BddPacket;
pub use settings::Settings;
