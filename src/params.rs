//! Resolution and validation of user-facing query parameters.
//!
//! Every check happens here, before anything is encoded.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flow::FlowDisposition;
use crate::header_space::HeaderSpace;
use crate::ip::IpSpace;
use crate::location::IngressLocation;
use crate::model::{Configuration, NodeInterfacePair};
use crate::packet::BddPacket;
use crate::reachability::TransitConstraints;
use crate::reference::Ref;
use crate::settings::Settings;
use crate::structure::StructureType;

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeSpecifier {
    #[default]
    All,
    Names(BTreeSet<String>),
}

impl NodeSpecifier {
    pub fn names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        NodeSpecifier::Names(names.into_iter().map(Into::into).collect())
    }

    /// Nodes of `configs` selected by the specifier; unknown names are ignored.
    pub fn resolve(&self, configs: &BTreeMap<String, Configuration>) -> BTreeSet<String> {
        match self {
            NodeSpecifier::All => configs.keys().cloned().collect(),
            NodeSpecifier::Names(names) => names.iter().filter(|n| configs.contains_key(*n)).cloned().collect(),
        }
    }
}

/// Where flows start.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum LocationSpecifier {
    /// Every active interface link and every VRF.
    #[default]
    All,
    /// Every location of the named nodes.
    Nodes(BTreeSet<String>),
    Interfaces(BTreeSet<NodeInterfacePair>),
    /// `(node, vrf)` pairs.
    Vrfs(BTreeSet<(String, String)>),
    Explicit(BTreeSet<IngressLocation>),
}

/// Source addresses of flows starting at a location.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SourceIps {
    /// Subnets of the interface, or of every interface in the VRF.
    #[default]
    Inferred,
    Space(IpSpace),
    /// A named IP space of the location's node.
    Named(String),
}

/// Parameters of a reachability question, as the caller states them.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReachabilityParameters {
    pub header_space: HeaderSpace,
    pub actions: BTreeSet<FlowDisposition>,
    pub sources: LocationSpecifier,
    pub source_ips: SourceIps,
    pub final_nodes: NodeSpecifier,
    pub required_transit: BTreeSet<String>,
    pub forbidden_transit: BTreeSet<String>,
    pub differential: bool,
    /// Overrides [`Settings::specialize`].
    pub specialize: Option<bool>,
    /// Overrides [`Settings::max_chunk_size`].
    pub max_chunk_size: Option<usize>,
}

impl Default for ReachabilityParameters {
    fn default() -> Self {
        Self {
            header_space: HeaderSpace::Any,
            actions: BTreeSet::from([FlowDisposition::Accepted]),
            sources: LocationSpecifier::All,
            source_ips: SourceIps::Inferred,
            final_nodes: NodeSpecifier::All,
            required_transit: BTreeSet::new(),
            forbidden_transit: BTreeSet::new(),
            differential: false,
            specialize: None,
            max_chunk_size: None,
        }
    }
}

/// Validated parameters, ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParameters {
    pub header_space: HeaderSpace,
    pub actions: BTreeSet<FlowDisposition>,
    pub sources: BTreeMap<IngressLocation, IpSpace>,
    pub final_nodes: BTreeSet<String>,
    pub transit: TransitConstraints,
    pub differential: bool,
    pub specialize: bool,
    pub max_chunk_size: usize,
}

/// What parameters are resolved against.
pub struct ResolverContext<'a> {
    pub packet: &'a BddPacket,
    pub configs: &'a BTreeMap<String, Configuration>,
    pub settings: &'a Settings,
}

pub fn resolve(raw: &ReachabilityParameters, ctx: &ResolverContext) -> Result<ResolvedParameters> {
    if raw.actions.is_empty() {
        return Err(Error::InvalidParameters("Action set is empty".to_string()));
    }

    let both: Vec<&str> = raw
        .required_transit
        .intersection(&raw.forbidden_transit)
        .map(String::as_str)
        .collect();
    if !both.is_empty() {
        return Err(Error::InvalidParameters(format!(
            "Nodes both required and forbidden for transit: {}",
            both.join(", ")
        )));
    }

    let final_nodes = raw.final_nodes.resolve(ctx.configs);
    if final_nodes.is_empty() {
        return Err(Error::InvalidParameters("No final nodes match".to_string()));
    }

    let sources = resolve_sources(&raw.sources, &raw.source_ips, ctx.configs)?;
    if sources.is_empty() {
        return Err(Error::NoMatchingSourceLocations);
    }

    if ctx.packet.header_space(&raw.header_space) == Ref::ZERO {
        return Err(Error::EmptyDestinationIpSpace);
    }

    debug!(
        "Resolved {} source locations and {} final nodes",
        sources.len(),
        final_nodes.len()
    );

    Ok(ResolvedParameters {
        header_space: raw.header_space.clone(),
        actions: raw.actions.clone(),
        sources,
        final_nodes,
        transit: TransitConstraints {
            required: raw.required_transit.clone(),
            forbidden: raw.forbidden_transit.clone(),
        },
        differential: raw.differential,
        specialize: raw.specialize.unwrap_or(ctx.settings.specialize),
        max_chunk_size: raw.max_chunk_size.unwrap_or(ctx.settings.max_chunk_size),
    })
}

/// Locations selected by `specifier` together with their source IPs.
///
/// Locations whose source IPs resolve to the empty space are dropped.
pub fn resolve_sources(
    specifier: &LocationSpecifier,
    source_ips: &SourceIps,
    configs: &BTreeMap<String, Configuration>,
) -> Result<BTreeMap<IngressLocation, IpSpace>> {
    let locations = resolve_locations(specifier, configs);
    let mut out = BTreeMap::new();
    for location in locations {
        let Some(config) = configs.get(location.node()) else {
            continue;
        };
        let space = match source_ips {
            SourceIps::Space(space) => space.clone(),
            SourceIps::Inferred => inferred_sources(config, &location),
            SourceIps::Named(name) => {
                if !StructureType::IpSpace.is_defined(config, name) {
                    debug!("{} has no {} named {}", config.hostname, StructureType::IpSpace, name);
                    continue;
                }
                config.ip_spaces.get(name).cloned().unwrap_or(IpSpace::Empty)
            }
        };
        if space == IpSpace::Empty {
            debug!("Dropping {}: no source IPs", location);
            continue;
        }
        out.insert(location, space);
    }
    Ok(out)
}

fn resolve_locations(
    specifier: &LocationSpecifier,
    configs: &BTreeMap<String, Configuration>,
) -> BTreeSet<IngressLocation> {
    let of_node = |config: &Configuration| {
        let links = config
            .active_interfaces()
            .map(|i| IngressLocation::interface_link(&config.hostname, &i.name));
        let vrfs = StructureType::Vrf
            .names(config)
            .into_iter()
            .map(|v| IngressLocation::vrf(&config.hostname, v));
        links.chain(vrfs).collect::<Vec<_>>()
    };

    match specifier {
        LocationSpecifier::All => configs.values().flat_map(of_node).collect(),
        LocationSpecifier::Nodes(nodes) => nodes.iter().filter_map(|n| configs.get(n)).flat_map(of_node).collect(),
        LocationSpecifier::Interfaces(pairs) => pairs
            .iter()
            .filter(|p| {
                configs
                    .get(&p.node)
                    .is_some_and(|c| StructureType::Interface.is_defined(c, &p.interface))
            })
            .map(|p| IngressLocation::interface_link(&p.node, &p.interface))
            .collect(),
        LocationSpecifier::Vrfs(vrfs) => vrfs
            .iter()
            .filter(|(node, vrf)| configs.get(node).is_some_and(|c| StructureType::Vrf.is_defined(c, vrf)))
            .map(|(node, vrf)| IngressLocation::vrf(node, vrf))
            .collect(),
        LocationSpecifier::Explicit(locations) => locations
            .iter()
            .filter(|l| {
                configs.get(l.node()).is_some_and(|c| match l {
                    IngressLocation::Vrf { vrf, .. } => StructureType::Vrf.is_defined(c, vrf),
                    IngressLocation::InterfaceLink { interface, .. } => {
                        StructureType::Interface.is_defined(c, interface)
                    }
                })
            })
            .cloned()
            .collect(),
    }
}

fn inferred_sources(config: &Configuration, location: &IngressLocation) -> IpSpace {
    let prefixes: Vec<IpSpace> = match location {
        IngressLocation::InterfaceLink { interface, .. } => config
            .interfaces
            .get(interface)
            .map(|i| i.prefixes.iter().map(|&p| IpSpace::prefix(p)).collect())
            .unwrap_or_default(),
        IngressLocation::Vrf { vrf, .. } => config
            .interfaces_in_vrf(vrf)
            .flat_map(|i| i.prefixes.iter().map(|&p| IpSpace::prefix(p)))
            .collect(),
    };
    IpSpace::union(prefixes)
}

/// Parameters of an ACL line reachability question.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AclLineParameters {
    pub nodes: NodeSpecifier,
    /// All ACLs of the nodes if `None`.
    pub acls: Option<BTreeSet<String>>,
    /// Only packets in this space are considered.
    pub header_space: HeaderSpace,
    /// Overrides [`Settings::specialize`].
    pub specialize: Option<bool>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedAclLineParameters {
    /// `(node, acl)` pairs.
    pub acls: BTreeSet<(String, String)>,
    pub header_space: HeaderSpace,
    pub specialize: bool,
}

pub fn resolve_acl_lines(raw: &AclLineParameters, ctx: &ResolverContext) -> Result<ResolvedAclLineParameters> {
    let acls = resolve_acls(&raw.nodes, raw.acls.as_ref(), ctx.configs)?;
    if ctx.packet.header_space(&raw.header_space) == Ref::ZERO {
        return Err(Error::EmptyDestinationIpSpace);
    }
    Ok(ResolvedAclLineParameters {
        acls,
        header_space: raw.header_space.clone(),
        specialize: raw.specialize.unwrap_or(ctx.settings.specialize),
    })
}

/// ACLs selected by node and name; all ACLs of the nodes if `names` is `None`.
pub fn resolve_acls(
    nodes: &NodeSpecifier,
    names: Option<&BTreeSet<String>>,
    configs: &BTreeMap<String, Configuration>,
) -> Result<BTreeSet<(String, String)>> {
    let mut out = BTreeSet::new();
    for node in nodes.resolve(configs) {
        let Some(config) = configs.get(&node) else {
            continue;
        };
        for acl in StructureType::IpAccessList.names(config) {
            if names.map_or(true, |n| n.contains(acl)) {
                out.insert((node.clone(), acl.to_string()));
            }
        }
    }
    if out.is_empty() {
        return Err(Error::InvalidParameters("No ACLs match".to_string()));
    }
    Ok(out)
}
