//! Attribute type registry.
//!
//! Every attribute this crate can encode, decode or filter on is described
//! by one row of a static table: where it lives in the ctnetlink attribute
//! tree, how wide its payload is and whether the filter compiler can load
//! it. The table is immutable and shared by every caller.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::constants::*;
use crate::nla::NLA_HDRLEN;
use crate::Error;

/// Deepest nest (counted in parent attributes) any registry entry lives in.
pub const MAX_NESTING: usize = 2;

/// How the payload of an attribute is written as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Ipv4,
    Ipv6,
    /// Unsigned big endian integer.
    Uint,
}

#[derive(Debug)]
pub struct AttributeInfo {
    pub kind: AttributeKind,
    pub name: &'static str,
    /// Parent nest numbers, outermost first. Empty for top level attributes.
    pub path: &'static [u16],
    pub attr: u16,
    pub width: usize,
    pub format: ValueFormat,
    /// Offset of the value from the start of the located attribute, `None`
    /// when the filter compiler cannot load it.
    pub filter_offset: Option<u32>,
}

const fn filter_offset(width: usize) -> Option<u32> {
    match width {
        1 | 2 | 4 | 16 => Some(NLA_HDRLEN as u32),
        _ => None,
    }
}

macro_rules! registry {
    ($($kind:ident => $name:literal, [$($path:expr),*], $attr:expr, $width:expr, $format:ident;)*) => {
        /// Attributes known to the registry.
        ///
        /// The declaration order is the order attributes are encoded in.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum AttributeKind {
            $($kind,)*
        }

        static REGISTRY: &[AttributeInfo] = &[
            $(AttributeInfo {
                kind: AttributeKind::$kind,
                name: $name,
                path: &[$($path),*],
                attr: $attr,
                width: $width,
                format: ValueFormat::$format,
                filter_offset: filter_offset($width),
            },)*
        ];
    };
}

registry! {
    OrigIpv4Src => "orig_ipv4_src", [CTA_TUPLE_ORIG, CTA_TUPLE_IP], CTA_IP_V4_SRC, 4, Ipv4;
    OrigIpv4Dst => "orig_ipv4_dst", [CTA_TUPLE_ORIG, CTA_TUPLE_IP], CTA_IP_V4_DST, 4, Ipv4;
    ReplIpv4Src => "repl_ipv4_src", [CTA_TUPLE_REPLY, CTA_TUPLE_IP], CTA_IP_V4_SRC, 4, Ipv4;
    ReplIpv4Dst => "repl_ipv4_dst", [CTA_TUPLE_REPLY, CTA_TUPLE_IP], CTA_IP_V4_DST, 4, Ipv4;
    OrigIpv6Src => "orig_ipv6_src", [CTA_TUPLE_ORIG, CTA_TUPLE_IP], CTA_IP_V6_SRC, 16, Ipv6;
    OrigIpv6Dst => "orig_ipv6_dst", [CTA_TUPLE_ORIG, CTA_TUPLE_IP], CTA_IP_V6_DST, 16, Ipv6;
    ReplIpv6Src => "repl_ipv6_src", [CTA_TUPLE_REPLY, CTA_TUPLE_IP], CTA_IP_V6_SRC, 16, Ipv6;
    ReplIpv6Dst => "repl_ipv6_dst", [CTA_TUPLE_REPLY, CTA_TUPLE_IP], CTA_IP_V6_DST, 16, Ipv6;
    OrigPortSrc => "orig_port_src", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_SRC_PORT, 2, Uint;
    OrigPortDst => "orig_port_dst", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_DST_PORT, 2, Uint;
    ReplPortSrc => "repl_port_src", [CTA_TUPLE_REPLY, CTA_TUPLE_PROTO], CTA_PROTO_SRC_PORT, 2, Uint;
    ReplPortDst => "repl_port_dst", [CTA_TUPLE_REPLY, CTA_TUPLE_PROTO], CTA_PROTO_DST_PORT, 2, Uint;
    IcmpType => "icmp_type", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_ICMP_TYPE, 1, Uint;
    IcmpCode => "icmp_code", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_ICMP_CODE, 1, Uint;
    IcmpId => "icmp_id", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_ICMP_ID, 2, Uint;
    Icmpv6Type => "icmpv6_type", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_ICMPV6_TYPE, 1, Uint;
    Icmpv6Code => "icmpv6_code", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_ICMPV6_CODE, 1, Uint;
    Icmpv6Id => "icmpv6_id", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_ICMPV6_ID, 2, Uint;
    OrigL4Proto => "orig_l4_proto", [CTA_TUPLE_ORIG, CTA_TUPLE_PROTO], CTA_PROTO_NUM, 1, Uint;
    ReplL4Proto => "repl_l4_proto", [CTA_TUPLE_REPLY, CTA_TUPLE_PROTO], CTA_PROTO_NUM, 1, Uint;
    TcpState => "tcp_state", [CTA_PROTOINFO, CTA_PROTOINFO_TCP], CTA_PROTOINFO_TCP_STATE, 1, Uint;
    SnatIpv4 => "snat_ipv4", [CTA_NAT_SRC], CTA_NAT_V4_MINIP, 4, Ipv4;
    DnatIpv4 => "dnat_ipv4", [CTA_NAT_DST], CTA_NAT_V4_MINIP, 4, Ipv4;
    SnatPort => "snat_port", [CTA_NAT_SRC, CTA_NAT_PROTO], CTA_PROTONAT_PORT_MIN, 2, Uint;
    DnatPort => "dnat_port", [CTA_NAT_DST, CTA_NAT_PROTO], CTA_PROTONAT_PORT_MIN, 2, Uint;
    Timeout => "timeout", [], CTA_TIMEOUT, 4, Uint;
    Mark => "mark", [], CTA_MARK, 4, Uint;
    OrigCounterPackets => "orig_counter_packets", [CTA_COUNTERS_ORIG], CTA_COUNTERS_PACKETS, 8, Uint;
    ReplCounterPackets => "repl_counter_packets", [CTA_COUNTERS_REPLY], CTA_COUNTERS_PACKETS, 8, Uint;
    OrigCounterBytes => "orig_counter_bytes", [CTA_COUNTERS_ORIG], CTA_COUNTERS_BYTES, 8, Uint;
    ReplCounterBytes => "repl_counter_bytes", [CTA_COUNTERS_REPLY], CTA_COUNTERS_BYTES, 8, Uint;
    Use => "use", [], CTA_USE, 4, Uint;
    Id => "id", [], CTA_ID, 4, Uint;
    Status => "status", [], CTA_STATUS, 4, Uint;
    TcpFlagsOrig => "tcp_flags_orig", [CTA_PROTOINFO, CTA_PROTOINFO_TCP], CTA_PROTOINFO_TCP_FLAGS_ORIGINAL, 2, Uint;
    TcpFlagsRepl => "tcp_flags_repl", [CTA_PROTOINFO, CTA_PROTOINFO_TCP], CTA_PROTOINFO_TCP_FLAGS_REPLY, 2, Uint;
    MasterIpv4Src => "master_ipv4_src", [CTA_TUPLE_MASTER, CTA_TUPLE_IP], CTA_IP_V4_SRC, 4, Ipv4;
    MasterIpv4Dst => "master_ipv4_dst", [CTA_TUPLE_MASTER, CTA_TUPLE_IP], CTA_IP_V4_DST, 4, Ipv4;
    MasterIpv6Src => "master_ipv6_src", [CTA_TUPLE_MASTER, CTA_TUPLE_IP], CTA_IP_V6_SRC, 16, Ipv6;
    MasterIpv6Dst => "master_ipv6_dst", [CTA_TUPLE_MASTER, CTA_TUPLE_IP], CTA_IP_V6_DST, 16, Ipv6;
    MasterPortSrc => "master_port_src", [CTA_TUPLE_MASTER, CTA_TUPLE_PROTO], CTA_PROTO_SRC_PORT, 2, Uint;
    MasterPortDst => "master_port_dst", [CTA_TUPLE_MASTER, CTA_TUPLE_PROTO], CTA_PROTO_DST_PORT, 2, Uint;
    MasterL4Proto => "master_l4_proto", [CTA_TUPLE_MASTER, CTA_TUPLE_PROTO], CTA_PROTO_NUM, 1, Uint;
    Secmark => "secmark", [], CTA_SECMARK, 4, Uint;
    OrigNatSeqCorrectionPos => "orig_nat_seq_correction_pos", [CTA_SEQ_ADJ_ORIG], CTA_SEQADJ_CORRECTION_POS, 4, Uint;
    OrigNatSeqOffsetBefore => "orig_nat_seq_offset_before", [CTA_SEQ_ADJ_ORIG], CTA_SEQADJ_OFFSET_BEFORE, 4, Uint;
    OrigNatSeqOffsetAfter => "orig_nat_seq_offset_after", [CTA_SEQ_ADJ_ORIG], CTA_SEQADJ_OFFSET_AFTER, 4, Uint;
    ReplNatSeqCorrectionPos => "repl_nat_seq_correction_pos", [CTA_SEQ_ADJ_REPLY], CTA_SEQADJ_CORRECTION_POS, 4, Uint;
    ReplNatSeqOffsetBefore => "repl_nat_seq_offset_before", [CTA_SEQ_ADJ_REPLY], CTA_SEQADJ_OFFSET_BEFORE, 4, Uint;
    ReplNatSeqOffsetAfter => "repl_nat_seq_offset_after", [CTA_SEQ_ADJ_REPLY], CTA_SEQADJ_OFFSET_AFTER, 4, Uint;
    SctpState => "sctp_state", [CTA_PROTOINFO, CTA_PROTOINFO_SCTP], CTA_PROTOINFO_SCTP_STATE, 1, Uint;
    SctpVtagOrig => "sctp_vtag_orig", [CTA_PROTOINFO, CTA_PROTOINFO_SCTP], CTA_PROTOINFO_SCTP_VTAG_ORIGINAL, 4, Uint;
    SctpVtagRepl => "sctp_vtag_repl", [CTA_PROTOINFO, CTA_PROTOINFO_SCTP], CTA_PROTOINFO_SCTP_VTAG_REPLY, 4, Uint;
    DccpState => "dccp_state", [CTA_PROTOINFO, CTA_PROTOINFO_DCCP], CTA_PROTOINFO_DCCP_STATE, 1, Uint;
    DccpRole => "dccp_role", [CTA_PROTOINFO, CTA_PROTOINFO_DCCP], CTA_PROTOINFO_DCCP_ROLE, 1, Uint;
    DccpHandshakeSeq => "dccp_handshake_seq", [CTA_PROTOINFO, CTA_PROTOINFO_DCCP], CTA_PROTOINFO_DCCP_HANDSHAKE_SEQ, 8, Uint;
    TcpWscaleOrig => "tcp_wscale_orig", [CTA_PROTOINFO, CTA_PROTOINFO_TCP], CTA_PROTOINFO_TCP_WSCALE_ORIGINAL, 1, Uint;
    TcpWscaleRepl => "tcp_wscale_repl", [CTA_PROTOINFO, CTA_PROTOINFO_TCP], CTA_PROTOINFO_TCP_WSCALE_REPLY, 1, Uint;
    Zone => "zone", [], CTA_ZONE, 2, Uint;
    TimestampStart => "timestamp_start", [CTA_TIMESTAMP], CTA_TIMESTAMP_START, 8, Uint;
    TimestampStop => "timestamp_stop", [CTA_TIMESTAMP], CTA_TIMESTAMP_STOP, 8, Uint;
    OrigZone => "orig_zone", [CTA_TUPLE_ORIG], CTA_TUPLE_ZONE, 2, Uint;
    ReplZone => "repl_zone", [CTA_TUPLE_REPLY], CTA_TUPLE_ZONE, 2, Uint;
    SnatIpv6 => "snat_ipv6", [CTA_NAT_SRC], CTA_NAT_V6_MINIP, 16, Ipv6;
    DnatIpv6 => "dnat_ipv6", [CTA_NAT_DST], CTA_NAT_V6_MINIP, 16, Ipv6;
}

impl AttributeKind {
    #[inline]
    pub fn info(self) -> &'static AttributeInfo {
        &REGISTRY[self as usize]
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    #[inline]
    pub fn width(self) -> usize {
        self.info().width
    }

    /// All registered kinds, in encoding order.
    pub fn all() -> impl Iterator<Item = AttributeKind> {
        REGISTRY.iter().map(|info| info.kind)
    }

    /// Convert human readable text into the wire representation of this
    /// attribute, e.g. `127.0.0.1` for an IPv4 address or `6` / `0x11` for
    /// an integer.
    pub fn parse_value(self, text: &str) -> Result<Vec<u8>, Error> {
        let info = self.info();
        let text = text.trim();

        match info.format {
            ValueFormat::Ipv4 => text
                .parse::<Ipv4Addr>()
                .map(|addr| addr.octets().to_vec())
                .map_err(|err| Error::InvalidValue(format!("{self}: {text:?} {err}"))),
            ValueFormat::Ipv6 => text
                .parse::<Ipv6Addr>()
                .map(|addr| addr.octets().to_vec())
                .map_err(|err| Error::InvalidValue(format!("{self}: {text:?} {err}"))),
            ValueFormat::Uint => {
                let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => text.parse::<u64>(),
                }
                .map_err(|err| Error::InvalidValue(format!("{self}: {text:?} {err}")))?;

                let bytes = value.to_be_bytes();
                let (high, low) = bytes.split_at(8 - info.width);
                if high.iter().any(|b| *b != 0) {
                    return Err(Error::InvalidValue(format!(
                        "{self}: {value} does not fit in {} bytes",
                        info.width
                    )));
                }

                Ok(low.to_vec())
            }
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttributeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REGISTRY
            .iter()
            .find(|info| info.name == s)
            .map(|info| info.kind)
            .ok_or_else(|| Error::InvalidValue(format!("unknown attribute {s:?}")))
    }
}

/// Find the kind registered for attribute `attr` under `path`.
pub fn lookup(path: &[u16], attr: u16) -> Option<AttributeKind> {
    REGISTRY
        .iter()
        .find(|info| info.attr == attr && info.path == path)
        .map(|info| info.kind)
}

/// Whether `path` names a nest some registered attribute lives in.
pub fn is_nest(path: &[u16]) -> bool {
    !path.is_empty() && REGISTRY.iter().any(|info| info.path.starts_with(path))
}
