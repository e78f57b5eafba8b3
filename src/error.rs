use thiserror::Error;

/// Errors raised while resolving, encoding or solving a reachability query.
///
/// "No witness" and timeouts are not errors: the former is an absent entry,
/// the latter is reported through
/// [`ExecutionReport::partial`](crate::executor::ExecutionReport::partial).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum Error {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Destination header space is empty")]
    EmptyDestinationIpSpace,
    #[error("No matching source locations")]
    NoMatchingSourceLocations,

    #[error("Topology references unknown interface '{interface}' on node '{node}'")]
    InconsistentTopology { node: String, interface: String },
    #[error("Cyclic ACL reference on '{hostname}': {}", cycle.join(" -> "))]
    CyclicAclReference { hostname: String, cycle: Vec<String> },
    #[error("ACL '{acl}' on '{hostname}' references undefined ACL '{reference}'")]
    UndefinedAclReference {
        hostname: String,
        acl: String,
        reference: String,
    },
    #[error("Undefined interface '{interface}' on node '{node}'")]
    UndefinedInterface { node: String, interface: String },
    #[error("Node '{node}' has {count} interfaces, at most {max} are supported")]
    TooManyInterfaces { node: String, count: usize, max: usize },
    #[error("Artifacts built from different packet encodings cannot be combined")]
    IncompatiblePacket,

    #[error("Solver job '{job}' failed: {message}")]
    Solver { job: String, message: String },
    #[error("Worker thread panicked")]
    WorkerPanicked,

    #[error("Invalid IP address '{0}'")]
    InvalidIp(String),
    #[error("Invalid prefix '{0}'")]
    InvalidPrefix(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
