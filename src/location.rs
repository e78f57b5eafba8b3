use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Where a symbolic flow is assumed to originate.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum IngressLocation {
    /// Originated inside a VRF of the node.
    Vrf { node: String, vrf: String },
    /// Arrives over the link attached to an interface.
    InterfaceLink { node: String, interface: String },
}

impl IngressLocation {
    pub fn vrf(node: impl Into<String>, vrf: impl Into<String>) -> Self {
        IngressLocation::Vrf {
            node: node.into(),
            vrf: vrf.into(),
        }
    }

    pub fn interface_link(node: impl Into<String>, interface: impl Into<String>) -> Self {
        IngressLocation::InterfaceLink {
            node: node.into(),
            interface: interface.into(),
        }
    }

    pub fn node(&self) -> &str {
        match self {
            IngressLocation::Vrf { node, .. } | IngressLocation::InterfaceLink { node, .. } => node,
        }
    }
}

impl Display for IngressLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IngressLocation::Vrf { node, vrf } => write!(f, "{}@vrf({})", node, vrf),
            IngressLocation::InterfaceLink { node, interface } => write!(f, "{}@enter({})", node, interface),
        }
    }
}
