//! Concrete witness packets.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::header_space::{HeaderField, TcpFlag};
use crate::ip::Ip;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TcpFlags {
    pub ack: bool,
    pub cwr: bool,
    pub ece: bool,
    pub fin: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn get(&self, flag: TcpFlag) -> bool {
        match flag {
            TcpFlag::Ack => self.ack,
            TcpFlag::Cwr => self.cwr,
            TcpFlag::Ece => self.ece,
            TcpFlag::Fin => self.fin,
            TcpFlag::Psh => self.psh,
            TcpFlag::Rst => self.rst,
            TcpFlag::Syn => self.syn,
            TcpFlag::Urg => self.urg,
        }
    }

    pub fn set(&mut self, flag: TcpFlag, value: bool) {
        let slot = match flag {
            TcpFlag::Ack => &mut self.ack,
            TcpFlag::Cwr => &mut self.cwr,
            TcpFlag::Ece => &mut self.ece,
            TcpFlag::Fin => &mut self.fin,
            TcpFlag::Psh => &mut self.psh,
            TcpFlag::Rst => &mut self.rst,
            TcpFlag::Syn => &mut self.syn,
            TcpFlag::Urg => &mut self.urg,
        };
        *slot = value;
    }
}

/// A fully assigned packet header together with its ingress point.
///
/// `ingress_interface` is set for flows entering over an interface link,
/// `ingress_vrf` for flows originating inside a VRF.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub ingress_node: String,
    pub ingress_interface: Option<String>,
    pub ingress_vrf: Option<String>,
    pub src_ip: Ip,
    pub dst_ip: Ip,
    pub ip_protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub tcp_flags: TcpFlags,
    pub dscp: u8,
    pub ecn: u8,
    pub fragment_offset: u16,
    pub packet_length: u16,
    pub tag: String,
}

impl Flow {
    /// Integer value of a header field.
    pub fn field(&self, field: HeaderField) -> u32 {
        match field {
            HeaderField::IpProtocol => self.ip_protocol as u32,
            HeaderField::DstIp => self.dst_ip.as_u32(),
            HeaderField::SrcIp => self.src_ip.as_u32(),
            HeaderField::DstPort => self.dst_port as u32,
            HeaderField::SrcPort => self.src_port as u32,
            HeaderField::IcmpCode => self.icmp_code as u32,
            HeaderField::IcmpType => self.icmp_type as u32,
            HeaderField::Dscp => self.dscp as u32,
            HeaderField::Ecn => self.ecn as u32,
            HeaderField::FragmentOffset => self.fragment_offset as u32,
            HeaderField::PacketLength => self.packet_length as u32,
        }
    }

    /// Set a header field, truncating the value to the field width.
    pub fn set_field(&mut self, field: HeaderField, value: u32) {
        match field {
            HeaderField::IpProtocol => self.ip_protocol = value as u8,
            HeaderField::DstIp => self.dst_ip = Ip::new(value),
            HeaderField::SrcIp => self.src_ip = Ip::new(value),
            HeaderField::DstPort => self.dst_port = value as u16,
            HeaderField::SrcPort => self.src_port = value as u16,
            HeaderField::IcmpCode => self.icmp_code = value as u8,
            HeaderField::IcmpType => self.icmp_type = value as u8,
            HeaderField::Dscp => self.dscp = (value & 0x3f) as u8,
            HeaderField::Ecn => self.ecn = (value & 0x3) as u8,
            HeaderField::FragmentOffset => self.fragment_offset = (value & 0x1fff) as u16,
            HeaderField::PacketLength => self.packet_length = value as u16,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
}

impl Display for Flow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "start={}", self.ingress_node)?;
        if let Some(interface) = &self.ingress_interface {
            write!(f, " interface={}", interface)?;
        }
        if let Some(vrf) = &self.ingress_vrf {
            write!(f, " vrf={}", vrf)?;
        }
        write!(
            f,
            " [{}:{} -> {}:{} proto={}]",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.ip_protocol
        )?;
        if !self.tag.is_empty() {
            write!(f, " tag={}", self.tag)?;
        }
        Ok(())
    }
}

/// Final fate of a flow.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowDisposition {
    Accepted,
    DeniedIn,
    DeniedOut,
    NoRoute,
    NullRouted,
    NeighborUnreachable,
    DeliveredToSubnet,
    ExitsNetwork,
    Loop,
}

impl FlowDisposition {
    pub const ALL: [FlowDisposition; 8] = [
        FlowDisposition::Accepted,
        FlowDisposition::DeniedIn,
        FlowDisposition::DeniedOut,
        FlowDisposition::NoRoute,
        FlowDisposition::NullRouted,
        FlowDisposition::NeighborUnreachable,
        FlowDisposition::DeliveredToSubnet,
        FlowDisposition::ExitsNetwork,
    ];

    pub fn is_success(self) -> bool {
        matches!(
            self,
            FlowDisposition::Accepted | FlowDisposition::DeliveredToSubnet | FlowDisposition::ExitsNetwork
        )
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }

    /// Failures that are not caused by an explicit filter.
    pub fn is_black_hole(self) -> bool {
        matches!(
            self,
            FlowDisposition::NoRoute | FlowDisposition::NullRouted | FlowDisposition::NeighborUnreachable
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FlowDisposition::Accepted => "ACCEPTED",
            FlowDisposition::DeniedIn => "DENIED_IN",
            FlowDisposition::DeniedOut => "DENIED_OUT",
            FlowDisposition::NoRoute => "NO_ROUTE",
            FlowDisposition::NullRouted => "NULL_ROUTED",
            FlowDisposition::NeighborUnreachable => "NEIGHBOR_UNREACHABLE",
            FlowDisposition::DeliveredToSubnet => "DELIVERED_TO_SUBNET",
            FlowDisposition::ExitsNetwork => "EXITS_NETWORK",
            FlowDisposition::Loop => "LOOP",
        }
    }
}

impl Display for FlowDisposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
