//! Connection records reconstructed from dump replies.

use std::fmt;
use std::net::IpAddr;

use crate::attribute::AttributeKind;
use crate::message::{ConntrackRequest, NFGENMSG_LEN};
use crate::nla::{self, get, ConnAttr};
use crate::Error;

bitflags! {
    /// `enum ip_conntrack_status`
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Status: u32 {
        const EXPECTED = 1;
        const SEEN_REPLY = 1 << 1;
        const ASSURED = 1 << 2;
        const CONFIRMED = 1 << 3;
        const SRC_NAT = 1 << 4;
        const DST_NAT = 1 << 5;
        const SEQ_ADJUST = 1 << 6;
        const SRC_NAT_DONE = 1 << 7;
        const DST_NAT_DONE = 1 << 8;
        const DYING = 1 << 9;
        const FIXED_TIMEOUT = 1 << 10;
        const TEMPLATE = 1 << 11;
        const UNTRACKED = 1 << 12;
        const HELPER = 1 << 13;
        const OFFLOAD = 1 << 14;
        const HW_OFFLOAD = 1 << 15;
    }
}

/// `enum tcp_conntrack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    None,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
    Listen,
    SynSent2,
    Unknown(u8),
}

impl From<u8> for TcpState {
    fn from(value: u8) -> Self {
        match value {
            0 => TcpState::None,
            1 => TcpState::SynSent,
            2 => TcpState::SynRecv,
            3 => TcpState::Established,
            4 => TcpState::FinWait,
            5 => TcpState::CloseWait,
            6 => TcpState::LastAck,
            7 => TcpState::TimeWait,
            8 => TcpState::Close,
            9 => TcpState::Listen,
            10 => TcpState::SynSent2,
            other => TcpState::Unknown(other),
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::None => "NONE",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent2 => "SYN_SENT2",
            TcpState::Unknown(value) => return write!(f, "UNKNOWN({value})"),
        };

        f.write_str(name)
    }
}

/// One direction of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub proto: Option<u8>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub icmp_id: Option<u16>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub zone: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nat {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqAdjust {
    pub correction_pos: u32,
    pub offset_before: u32,
    pub offset_after: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub state: Option<TcpState>,
    pub wscale_orig: Option<u8>,
    pub wscale_repl: Option<u8>,
    pub flags_orig: Option<u16>,
    pub flags_repl: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SctpInfo {
    pub state: Option<u8>,
    pub vtag_orig: Option<u32>,
    pub vtag_repl: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DccpInfo {
    pub state: Option<u8>,
    pub role: Option<u8>,
    pub handshake_seq: Option<u64>,
}

/// A conntrack entry as reported by a dump or get reply.
///
/// Integers are converted to host order. Groups the kernel did not send
/// stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub family: u8,
    pub orig: Tuple,
    pub reply: Tuple,
    pub master: Option<Tuple>,
    pub status: Option<Status>,
    /// Seconds until the entry expires.
    pub timeout: Option<u32>,
    pub mark: Option<u32>,
    pub secmark: Option<u32>,
    pub refcnt: Option<u32>,
    pub id: Option<u32>,
    pub zone: Option<u16>,
    pub counters_orig: Option<Counters>,
    pub counters_reply: Option<Counters>,
    /// Nanoseconds since the epoch.
    pub timestamp_start: Option<u64>,
    pub timestamp_stop: Option<u64>,
    pub tcp: Option<TcpInfo>,
    pub sctp: Option<SctpInfo>,
    pub dccp: Option<DccpInfo>,
    pub snat: Option<Nat>,
    pub dnat: Option<Nat>,
    pub seq_adjust_orig: Option<SeqAdjust>,
    pub seq_adjust_repl: Option<SeqAdjust>,

    attributes: Vec<ConnAttr>,
}

impl ConnectionRecord {
    /// Parse the payload of a single conntrack message, nfgenmsg included.
    ///
    /// Any malformed attribute fails the whole record.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let header = ConntrackRequest::parse(payload)?;
        let attributes = nla::decode(&payload[NFGENMSG_LEN..])?;

        Self::from_attributes(header.family, attributes)
    }

    /// Build the typed view out of decoded attributes.
    pub fn from_attributes(family: u8, attributes: Vec<ConnAttr>) -> Result<Self, Error> {
        let mut record = ConnectionRecord {
            family,
            ..Default::default()
        };

        for attr in &attributes {
            record.apply(attr)?;
        }
        record.attributes = attributes;

        Ok(record)
    }

    /// The decoded attributes in wire order.
    pub fn attributes(&self) -> &[ConnAttr] {
        &self.attributes
    }

    pub fn get(&self, kind: AttributeKind) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|attr| attr.kind == kind)
            .map(|attr| attr.data.as_slice())
    }

    fn apply(&mut self, attr: &ConnAttr) -> Result<(), Error> {
        use AttributeKind::*;

        let data = attr.data.as_slice();
        match attr.kind {
            OrigIpv4Src => self.orig.src = Some(get::ipv4(data)?.into()),
            OrigIpv4Dst => self.orig.dst = Some(get::ipv4(data)?.into()),
            ReplIpv4Src => self.reply.src = Some(get::ipv4(data)?.into()),
            ReplIpv4Dst => self.reply.dst = Some(get::ipv4(data)?.into()),
            OrigIpv6Src => self.orig.src = Some(get::ipv6(data)?.into()),
            OrigIpv6Dst => self.orig.dst = Some(get::ipv6(data)?.into()),
            ReplIpv6Src => self.reply.src = Some(get::ipv6(data)?.into()),
            ReplIpv6Dst => self.reply.dst = Some(get::ipv6(data)?.into()),
            OrigPortSrc => self.orig.src_port = Some(get::be_u16(data)?),
            OrigPortDst => self.orig.dst_port = Some(get::be_u16(data)?),
            ReplPortSrc => self.reply.src_port = Some(get::be_u16(data)?),
            ReplPortDst => self.reply.dst_port = Some(get::be_u16(data)?),
            IcmpType | Icmpv6Type => self.orig.icmp_type = Some(get::u8(data)?),
            IcmpCode | Icmpv6Code => self.orig.icmp_code = Some(get::u8(data)?),
            IcmpId | Icmpv6Id => self.orig.icmp_id = Some(get::be_u16(data)?),
            OrigL4Proto => self.orig.proto = Some(get::u8(data)?),
            ReplL4Proto => self.reply.proto = Some(get::u8(data)?),
            OrigZone => self.orig.zone = Some(get::be_u16(data)?),
            ReplZone => self.reply.zone = Some(get::be_u16(data)?),

            MasterIpv4Src => self.master().src = Some(get::ipv4(data)?.into()),
            MasterIpv4Dst => self.master().dst = Some(get::ipv4(data)?.into()),
            MasterIpv6Src => self.master().src = Some(get::ipv6(data)?.into()),
            MasterIpv6Dst => self.master().dst = Some(get::ipv6(data)?.into()),
            MasterPortSrc => self.master().src_port = Some(get::be_u16(data)?),
            MasterPortDst => self.master().dst_port = Some(get::be_u16(data)?),
            MasterL4Proto => self.master().proto = Some(get::u8(data)?),

            TcpState => self.tcp().state = Some(get::u8(data)?.into()),
            TcpWscaleOrig => self.tcp().wscale_orig = Some(get::u8(data)?),
            TcpWscaleRepl => self.tcp().wscale_repl = Some(get::u8(data)?),
            TcpFlagsOrig => self.tcp().flags_orig = Some(get::be_u16(data)?),
            TcpFlagsRepl => self.tcp().flags_repl = Some(get::be_u16(data)?),
            SctpState => self.sctp().state = Some(get::u8(data)?),
            SctpVtagOrig => self.sctp().vtag_orig = Some(get::be_u32(data)?),
            SctpVtagRepl => self.sctp().vtag_repl = Some(get::be_u32(data)?),
            DccpState => self.dccp().state = Some(get::u8(data)?),
            DccpRole => self.dccp().role = Some(get::u8(data)?),
            DccpHandshakeSeq => self.dccp().handshake_seq = Some(get::be_u64(data)?),

            SnatIpv4 => nat(&mut self.snat).addr = Some(get::ipv4(data)?.into()),
            SnatIpv6 => nat(&mut self.snat).addr = Some(get::ipv6(data)?.into()),
            SnatPort => nat(&mut self.snat).port = Some(get::be_u16(data)?),
            DnatIpv4 => nat(&mut self.dnat).addr = Some(get::ipv4(data)?.into()),
            DnatIpv6 => nat(&mut self.dnat).addr = Some(get::ipv6(data)?.into()),
            DnatPort => nat(&mut self.dnat).port = Some(get::be_u16(data)?),

            OrigCounterPackets => counters(&mut self.counters_orig).packets = get::be_u64(data)?,
            OrigCounterBytes => counters(&mut self.counters_orig).bytes = get::be_u64(data)?,
            ReplCounterPackets => counters(&mut self.counters_reply).packets = get::be_u64(data)?,
            ReplCounterBytes => counters(&mut self.counters_reply).bytes = get::be_u64(data)?,

            OrigNatSeqCorrectionPos => {
                seq_adjust(&mut self.seq_adjust_orig).correction_pos = get::be_u32(data)?
            }
            OrigNatSeqOffsetBefore => {
                seq_adjust(&mut self.seq_adjust_orig).offset_before = get::be_u32(data)?
            }
            OrigNatSeqOffsetAfter => {
                seq_adjust(&mut self.seq_adjust_orig).offset_after = get::be_u32(data)?
            }
            ReplNatSeqCorrectionPos => {
                seq_adjust(&mut self.seq_adjust_repl).correction_pos = get::be_u32(data)?
            }
            ReplNatSeqOffsetBefore => {
                seq_adjust(&mut self.seq_adjust_repl).offset_before = get::be_u32(data)?
            }
            ReplNatSeqOffsetAfter => {
                seq_adjust(&mut self.seq_adjust_repl).offset_after = get::be_u32(data)?
            }

            Status => self.status = Some(self::Status::from_bits_retain(get::be_u32(data)?)),
            Timeout => self.timeout = Some(get::be_u32(data)?),
            Mark => self.mark = Some(get::be_u32(data)?),
            Secmark => self.secmark = Some(get::be_u32(data)?),
            Use => self.refcnt = Some(get::be_u32(data)?),
            Id => self.id = Some(get::be_u32(data)?),
            Zone => self.zone = Some(get::be_u16(data)?),
            TimestampStart => self.timestamp_start = Some(get::be_u64(data)?),
            TimestampStop => self.timestamp_stop = Some(get::be_u64(data)?),
        }

        Ok(())
    }

    fn master(&mut self) -> &mut Tuple {
        self.master.get_or_insert_with(Tuple::default)
    }

    fn tcp(&mut self) -> &mut TcpInfo {
        self.tcp.get_or_insert_with(TcpInfo::default)
    }

    fn sctp(&mut self) -> &mut SctpInfo {
        self.sctp.get_or_insert_with(SctpInfo::default)
    }

    fn dccp(&mut self) -> &mut DccpInfo {
        self.dccp.get_or_insert_with(DccpInfo::default)
    }

    /// Layer 4 protocol number of the original direction.
    pub fn l4_proto(&self) -> Option<u8> {
        self.orig.proto
    }
}

fn nat(slot: &mut Option<Nat>) -> &mut Nat {
    slot.get_or_insert_with(Nat::default)
}

fn counters(slot: &mut Option<Counters>) -> &mut Counters {
    slot.get_or_insert_with(Counters::default)
}

fn seq_adjust(slot: &mut Option<SeqAdjust>) -> &mut SeqAdjust {
    slot.get_or_insert_with(SeqAdjust::default)
}

fn proto_name(proto: u8) -> &'static str {
    match proto {
        1 => "icmp",
        2 => "igmp",
        6 => "tcp",
        17 => "udp",
        33 => "dccp",
        47 => "gre",
        58 => "icmpv6",
        132 => "sctp",
        136 => "udplite",
        _ => "unknown",
    }
}

fn write_tuple(f: &mut fmt::Formatter<'_>, tuple: &Tuple) -> fmt::Result {
    if let Some(src) = tuple.src {
        write!(f, " src={src}")?;
    }
    if let Some(dst) = tuple.dst {
        write!(f, " dst={dst}")?;
    }
    if let Some(port) = tuple.src_port {
        write!(f, " sport={port}")?;
    }
    if let Some(port) = tuple.dst_port {
        write!(f, " dport={port}")?;
    }
    if let Some(typ) = tuple.icmp_type {
        write!(f, " type={typ}")?;
    }
    if let Some(code) = tuple.icmp_code {
        write!(f, " code={code}")?;
    }
    if let Some(id) = tuple.icmp_id {
        write!(f, " id={id}")?;
    }
    if let Some(zone) = tuple.zone {
        write!(f, " zone={zone}")?;
    }

    Ok(())
}

fn write_counters(f: &mut fmt::Formatter<'_>, counters: Option<&Counters>) -> fmt::Result {
    match counters {
        Some(counters) => write!(f, " packets={} bytes={}", counters.packets, counters.bytes),
        None => Ok(()),
    }
}

/// One line, in the layout of `conntrack -L`.
impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = self.orig.proto.unwrap_or_default();
        write!(f, "{:<8} {:<2}", proto_name(proto), proto)?;

        if let Some(timeout) = self.timeout {
            write!(f, " {timeout}")?;
        }
        if let Some(state) = self.tcp.and_then(|tcp| tcp.state) {
            write!(f, " {state}")?;
        }

        write_tuple(f, &self.orig)?;
        write_counters(f, self.counters_orig.as_ref())?;

        let status = self.status.unwrap_or_default();
        if self.status.is_some() && !status.contains(Status::SEEN_REPLY) {
            f.write_str(" [UNREPLIED]")?;
        }

        write_tuple(f, &self.reply)?;
        write_counters(f, self.counters_reply.as_ref())?;

        if status.contains(Status::ASSURED) {
            f.write_str(" [ASSURED]")?;
        }
        if let Some(mark) = self.mark {
            write!(f, " mark={mark}")?;
        }
        if let Some(zone) = self.zone {
            write!(f, " zone={zone}")?;
        }
        if let Some(refcnt) = self.refcnt {
            write!(f, " use={refcnt}")?;
        }

        Ok(())
    }
}
