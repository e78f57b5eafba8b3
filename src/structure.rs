//! Named configuration structures that parameters can refer to.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::Configuration;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum StructureType {
    IpAccessList,
    IpSpace,
    Interface,
    Vrf,
}

/// What a structure of a given type stands for in a query.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValueKind {
    /// A packet filter.
    Filter,
    /// A set of IP addresses.
    Addresses,
    /// A place flows can start at.
    Location,
}

pub struct StructureInfo {
    pub structure: StructureType,
    pub name: &'static str,
    pub names: fn(&Configuration) -> Vec<&str>,
    pub kind: ValueKind,
}

static STRUCTURES: [StructureInfo; 4] = [
    StructureInfo {
        structure: StructureType::IpAccessList,
        name: "ip-access-list",
        names: |c| c.acls.keys().map(String::as_str).collect(),
        kind: ValueKind::Filter,
    },
    StructureInfo {
        structure: StructureType::IpSpace,
        name: "ip-space",
        names: |c| c.ip_spaces.keys().map(String::as_str).collect(),
        kind: ValueKind::Addresses,
    },
    StructureInfo {
        structure: StructureType::Interface,
        name: "interface",
        names: |c| c.interfaces.keys().map(String::as_str).collect(),
        kind: ValueKind::Location,
    },
    StructureInfo {
        structure: StructureType::Vrf,
        name: "vrf",
        names: |c| c.vrfs.iter().map(String::as_str).collect(),
        kind: ValueKind::Location,
    },
];

impl StructureType {
    pub const ALL: [StructureType; 4] = [
        StructureType::IpAccessList,
        StructureType::IpSpace,
        StructureType::Interface,
        StructureType::Vrf,
    ];

    pub fn info(self) -> &'static StructureInfo {
        &STRUCTURES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn kind(self) -> ValueKind {
        self.info().kind
    }

    pub fn from_name(name: &str) -> Option<StructureType> {
        STRUCTURES.iter().find(|s| s.name == name).map(|s| s.structure)
    }

    /// Names of the structures of this type defined by `config`, sorted.
    pub fn names(self, config: &Configuration) -> Vec<&str> {
        (self.info().names)(config)
    }

    pub fn is_defined(self, config: &Configuration, name: &str) -> bool {
        self.names(config).contains(&name)
    }
}

impl Display for StructureType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
