//! Classic BPF filter compiler for conntrack dumps.
//!
//! A compiled program runs in the kernel against every message of a dump
//! before it is queued to the socket. Entries of the same attribute kind
//! are OR-ed, distinct kinds are AND-ed, and a record that lacks an
//! attribute altogether passes that kind's check.
//!
//! Jumps are forward only, so the program is built back to front: the two
//! return instructions first, then the groups from last to first. Every
//! jump target is already emitted when the jump is, which makes each
//! offset a plain distance and removes the need for any patching.
//!
//! ```text
//!         ldx  #4
//!         ldb  [x + 1]              ; nfnetlink subsystem
//!         jeq  #table, group1, 0
//!         ja   accept
//! group1: ld   #20                  ; first attribute
//!         ldx  #CTA_TUPLE_ORIG
//!         ld   #nlattr              ; A = nla_find(A, X)
//!         jeq  #0, group2, 0
//!         add  #4
//!         ...
//!         tax
//!         ldb  [x + 4]
//!         jeq  #value, group2, 0
//!         ...
//!         ja   reject
//! group2: ...
//! accept: ret  #0xffffffff
//! reject: ret  #0
//! ```

use std::fmt;
use std::iter;
use std::str::FromStr;

use crate::attribute::AttributeKind;
use crate::constants::Table;
use crate::message::{NETLINK_HEADER_LEN, NFGENMSG_LEN};
use crate::nla::NLA_HDRLEN;
use crate::Error;

// instruction classes
const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_MISC: u16 = 0x07;

// sizes
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;

// modes
const BPF_IMM: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;

// alu and jump operations
const BPF_ADD: u16 = 0x00;
const BPF_AND: u16 = 0x50;
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_TAX: u16 = 0x00;

/// Ancillary load, `A = nla_find(skb->data + A, skb->len - A, X)`.
const SKF_AD_OFF: u32 = 0xffff_f000;
const SKF_AD_NLATTR: u32 = 12;

/// Largest program the kernel accepts.
pub const BPF_MAXINSNS: usize = 4096;

pub const ACCEPT: u32 = 0xffff_ffff;
pub const REJECT: u32 = 0;

/// Offset of the nfnetlink subsystem inside the host order `nlmsg_type`.
const SUBSYS_OFFSET: u32 = if cfg!(target_endian = "little") { 1 } else { 0 };
const NLMSG_TYPE_OFFSET: u32 = 4;

/// One classic BPF instruction, laid out like the kernel's `sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<Instruction>() == 8);

impl Instruction {
    #[inline]
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    /// The host order wire form handed to `SO_ATTACH_FILTER`.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&self.code.to_ne_bytes());
        buf[2] = self.jt;
        buf[3] = self.jf;
        buf[4..8].copy_from_slice(&self.k.to_ne_bytes());
        buf
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ 0x{:02x}, {}, {}, 0x{:08x} }}",
            self.code, self.jt, self.jf, self.k
        )
    }
}

/// One filter criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterEntry {
    pub kind: AttributeKind,
    /// Value in wire order, exactly as wide as the attribute.
    pub data: Vec<u8>,
    /// Applied to the loaded value before comparing, same width as `data`.
    pub mask: Option<Vec<u8>>,
    pub negate: bool,
}

impl FilterEntry {
    pub fn new(kind: AttributeKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
            mask: None,
            negate: false,
        }
    }

    pub fn with_mask(mut self, mask: impl Into<Vec<u8>>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    /// Build an entry from textual value and mask, see
    /// [`AttributeKind::parse_value`].
    pub fn parse(
        kind: AttributeKind,
        value: &str,
        mask: Option<&str>,
        negate: bool,
    ) -> Result<Self, Error> {
        Ok(Self {
            kind,
            data: kind.parse_value(value)?,
            mask: mask.map(|mask| kind.parse_value(mask)).transpose()?,
            negate,
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        let info = self.kind.info();
        if info.filter_offset.is_none() {
            return Err(Error::UnsupportedFilterAttribute(self.kind));
        }

        if self.data.len() != info.width {
            return Err(Error::InvalidFilterEntry {
                kind: self.kind,
                reason: format!("value must be {} bytes, got {}", info.width, self.data.len()),
            });
        }

        if let Some(mask) = &self.mask {
            if mask.len() != self.data.len() {
                return Err(Error::InvalidFilterEntry {
                    kind: self.kind,
                    reason: format!("mask must be {} bytes, got {}", info.width, mask.len()),
                });
            }
        }

        Ok(())
    }

    /// Split the value into the loads the program performs.
    fn words(&self) -> Vec<Word> {
        let size = match self.data.len() {
            1 => BPF_B,
            2 => BPF_H,
            _ => BPF_W,
        };

        let chunk = self.data.len().min(4);
        let masks = self
            .mask
            .as_ref()
            .map(|mask| mask.chunks(chunk).map(be_word).collect::<Vec<_>>());

        self.data
            .chunks(chunk)
            .enumerate()
            .map(|(index, value)| Word {
                size,
                offset: (index * 4) as u32,
                value: be_word(value),
                mask: masks.as_ref().map(|masks| masks[index]),
            })
            .collect()
    }
}

/// Parses `kind=value`, `kind!=value`, optionally followed by `/mask`.
impl FromStr for FilterEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest, negate) = match s.split_once("!=") {
            Some((kind, rest)) => (kind, rest, true),
            None => match s.split_once('=') {
                Some((kind, rest)) => (kind, rest, false),
                None => {
                    return Err(Error::InvalidValue(format!(
                        "filter {s:?} must look like kind=value or kind!=value"
                    )))
                }
            },
        };

        let kind = kind.trim().parse::<AttributeKind>()?;
        let (value, mask) = match rest.split_once('/') {
            Some((value, mask)) => (value, Some(mask)),
            None => (rest, None),
        };

        Self::parse(kind, value, mask, negate)
    }
}

fn be_word(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | *b as u32)
}

struct Word {
    size: u16,
    offset: u32,
    value: u32,
    mask: Option<u32>,
}

/// Position of an emitted instruction, counted from the end of the program.
type Label = usize;

#[derive(Default)]
struct Builder {
    rev: Vec<Instruction>,
}

impl Builder {
    fn push(&mut self, ins: Instruction) -> Result<Label, Error> {
        if self.rev.len() >= BPF_MAXINSNS {
            return Err(Error::ProgramTooLarge(self.rev.len() + 1));
        }

        self.rev.push(ins);
        Ok(self.rev.len() - 1)
    }

    /// The instruction executed right after the one about to be pushed.
    #[inline]
    fn next(&self) -> Label {
        self.rev.len() - 1
    }

    #[inline]
    fn distance(&self, target: Label) -> usize {
        self.rev.len() - target - 1
    }

    fn branch(&self, target: Label) -> Result<u8, Error> {
        let distance = self.distance(target);
        u8::try_from(distance).map_err(|_| Error::JumpOutOfRange(distance))
    }

    fn stmt(&mut self, code: u16, k: u32) -> Result<Label, Error> {
        self.push(Instruction::new(code, 0, 0, k))
    }

    fn ja(&mut self, target: Label) -> Result<Label, Error> {
        let k = self.distance(target) as u32;
        self.stmt(BPF_JMP | BPF_JA, k)
    }

    fn jeq(&mut self, k: u32, jt: Label, jf: Label) -> Result<Label, Error> {
        let jt = self.branch(jt)?;
        let jf = self.branch(jf)?;
        self.push(Instruction::new(BPF_JMP | BPF_JEQ | BPF_K, jt, jf, k))
    }

    /// Emit one AND-group and return its first instruction.
    fn group(
        &mut self,
        kind: AttributeKind,
        members: &[&FilterEntry],
        next_group: Label,
        reject: Label,
    ) -> Result<Label, Error> {
        let info = kind.info();
        let offset = info
            .filter_offset
            .ok_or(Error::UnsupportedFilterAttribute(kind))?;

        let mut next_member = self.ja(reject)?;
        for entry in members.iter().rev() {
            next_member = self.member(entry, offset, next_group, next_member)?;
        }

        // walk down the nests, X ends up at the attribute header
        self.stmt(BPF_MISC | BPF_TAX, 0)?;
        for (depth, attr) in iter::once(info.attr)
            .chain(info.path.iter().rev().copied())
            .enumerate()
        {
            if depth > 0 {
                self.stmt(BPF_ALU | BPF_ADD | BPF_K, NLA_HDRLEN as u32)?;
            }
            let fall = self.next();
            self.jeq(0, next_group, fall)?;
            self.stmt(BPF_LD | BPF_B | BPF_ABS, SKF_AD_OFF + SKF_AD_NLATTR)?;
            self.stmt(BPF_LDX | BPF_W | BPF_IMM, attr as u32)?;
        }

        self.stmt(BPF_LD | BPF_IMM, (NETLINK_HEADER_LEN + NFGENMSG_LEN) as u32)
    }

    /// Emit one OR-member and return its first instruction.
    fn member(
        &mut self,
        entry: &FilterEntry,
        offset: u32,
        next_group: Label,
        next_member: Label,
    ) -> Result<Label, Error> {
        let words = entry.words();
        let last = words.len() - 1;

        // a negated member passes the group as soon as one word differs
        let differ = if entry.negate {
            self.ja(next_group)?
        } else {
            next_member
        };

        for (index, word) in words.iter().enumerate().rev() {
            let fall = self.next();
            let (jt, jf) = match (entry.negate, index == last) {
                (false, true) => (next_group, next_member),
                (false, false) => (fall, next_member),
                (true, true) => (next_member, differ),
                (true, false) => (fall, differ),
            };

            self.jeq(word.value, jt, jf)?;
            if let Some(mask) = word.mask {
                self.stmt(BPF_ALU | BPF_AND | BPF_K, mask)?;
            }
            self.stmt(BPF_LD | word.size | BPF_IND, offset + word.offset)?;
        }

        Ok(self.next())
    }

    fn finish(mut self) -> Vec<Instruction> {
        self.rev.reverse();
        self.rev
    }
}

/// Compile `entries` into a program for dumps of `table`.
///
/// Every entry is validated before anything is emitted. An empty list
/// compiles to a single accepting return.
pub fn compile(table: Table, entries: &[FilterEntry]) -> Result<Vec<Instruction>, Error> {
    for entry in entries {
        entry.validate()?;
    }

    if entries.is_empty() {
        return Ok(vec![Instruction::new(BPF_RET | BPF_K, 0, 0, ACCEPT)]);
    }

    let mut groups: Vec<(AttributeKind, Vec<&FilterEntry>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(kind, _)| *kind == entry.kind) {
            Some((_, members)) => members.push(entry),
            None => groups.push((entry.kind, vec![entry])),
        }
    }

    let mut builder = Builder::default();
    let reject = builder.stmt(BPF_RET | BPF_K, REJECT)?;
    let accept = builder.stmt(BPF_RET | BPF_K, ACCEPT)?;

    let mut next_group = accept;
    for (kind, members) in groups.iter().rev() {
        next_group = builder.group(*kind, members, next_group, reject)?;
    }

    // messages of other subsystems are not ours to judge
    let foreign = builder.ja(accept)?;
    builder.jeq(table.subsystem() as u32, next_group, foreign)?;
    builder.stmt(BPF_LD | BPF_B | BPF_IND, SUBSYS_OFFSET)?;
    builder.stmt(BPF_LDX | BPF_W | BPF_IMM, NLMSG_TYPE_OFFSET)?;

    let program = builder.finish();
    debug!(
        message = "compiled conntrack filter",
        %table,
        groups = groups.len(),
        instructions = program.len()
    );

    Ok(program)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::constants::*;
    use crate::nla::{align, encode, ConnAttr};
    use crate::AttributeKind::*;

    const NLATTR: u32 = SKF_AD_OFF + SKF_AD_NLATTR;

    fn insn(code: u16, jt: u8, jf: u8, k: u32) -> Instruction {
        Instruction::new(code, jt, jf, k)
    }

    fn nla_find(packet: &[u8], mut offset: usize, attr: u32) -> u32 {
        while offset + NLA_HDRLEN <= packet.len() {
            let len = u16::from_ne_bytes([packet[offset], packet[offset + 1]]) as usize;
            let typ = u16::from_ne_bytes([packet[offset + 2], packet[offset + 3]]);
            if len < NLA_HDRLEN || offset + len > packet.len() {
                break;
            }
            if (typ & NLA_TYPE_MASK) as u32 == attr {
                return offset as u32;
            }
            offset += align(len);
        }

        0
    }

    /// Runs the subset of classic BPF the compiler emits.
    fn run(program: &[Instruction], packet: &[u8]) -> u32 {
        let (mut a, mut x, mut pc) = (0u32, 0u32, 0usize);

        loop {
            let ins = program[pc];
            pc += 1;

            match ins.code {
                0x00 => a = ins.k,
                0x01 => x = ins.k,
                0x04 => a = a.wrapping_add(ins.k),
                0x54 => a &= ins.k,
                0x07 => x = a,
                0x30 if ins.k == NLATTR => a = nla_find(packet, a as usize, x),
                0x40 | 0x48 | 0x50 => {
                    let size = match ins.code {
                        0x50 => 1,
                        0x48 => 2,
                        _ => 4,
                    };
                    let start = (x + ins.k) as usize;
                    match packet.get(start..start + size) {
                        Some(bytes) => a = be_word(bytes),
                        None => return REJECT,
                    }
                }
                0x15 => {
                    let skip = if a == ins.k { ins.jt } else { ins.jf };
                    pc += skip as usize;
                }
                0x05 => pc += ins.k as usize,
                0x06 => return ins.k,
                code => panic!("unexpected opcode {code:#04x}"),
            }
        }
    }

    fn message(table: Table, attrs: &[ConnAttr]) -> Vec<u8> {
        let payload = encode(attrs).unwrap();
        let mut buf = Vec::new();
        buf.extend(((20 + payload.len()) as u32).to_ne_bytes());
        buf.extend(table.message_type(IPCTNL_MSG_CT_NEW).to_ne_bytes());
        buf.extend(NLM_F_MULTI.to_ne_bytes());
        buf.extend([0u8; 8]);
        buf.extend([libc::AF_INET as u8, 0, 0, 0]);
        buf.extend(payload);
        buf
    }

    fn tcp(src: Ipv4Addr, proto: u8, state: Option<u8>) -> Vec<u8> {
        let mut attrs = vec![
            ConnAttr::ipv4(OrigIpv4Src, src),
            ConnAttr::ipv4(OrigIpv4Dst, Ipv4Addr::new(10, 0, 0, 2)),
            ConnAttr::u8(OrigL4Proto, proto),
            ConnAttr::u16(OrigPortSrc, 40000),
            ConnAttr::u16(OrigPortDst, 443),
            ConnAttr::ipv4(ReplIpv4Src, Ipv4Addr::new(10, 0, 0, 2)),
            ConnAttr::ipv4(ReplIpv4Dst, src),
            ConnAttr::u8(ReplL4Proto, proto),
            ConnAttr::u32(Timeout, 120),
        ];
        if let Some(state) = state {
            attrs.push(ConnAttr::u8(TcpState, state));
        }

        message(Table::Conntrack, &attrs)
    }

    fn scenario() -> Vec<FilterEntry> {
        vec![
            FilterEntry::new(OrigL4Proto, [0x11]),
            FilterEntry::new(OrigL4Proto, [0x06]),
            FilterEntry::new(TcpState, [0x03]),
            FilterEntry::new(OrigIpv4Src, [127, 0, 0, 1])
                .with_mask([0xff; 4])
                .negated(),
            FilterEntry::new(OrigIpv6Src, Ipv6Addr::LOCALHOST.octets())
                .with_mask([0xff; 16])
                .negated(),
        ]
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn reference_program() {
        let ldx = |k| insn(0x01, 0, 0, k);
        let nlattr = insn(0x30, 0, 0, NLATTR);
        let missing = |jt| insn(0x15, jt, 0, 0);
        let add4 = insn(0x04, 0, 0, 4);
        let tax = insn(0x07, 0, 0, 0);
        let first = insn(0x00, 0, 0, 0x14);
        let and = insn(0x54, 0, 0, 0xffff_ffff);

        #[rustfmt::skip]
        let want = vec![
            // subsystem check
            ldx(4), insn(0x50, 0, 0, 1), insn(0x15, 1, 0, 1), insn(0x05, 0, 0, 79),
            // orig_l4_proto == 17 || orig_l4_proto == 6
            first,
            ldx(1), nlattr, missing(14), add4,
            ldx(2), nlattr, missing(10), add4,
            ldx(1), nlattr, missing(6), tax,
            insn(0x50, 0, 0, 4), insn(0x15, 3, 0, 0x11),
            insn(0x50, 0, 0, 4), insn(0x15, 1, 0, 0x06),
            insn(0x05, 0, 0, 62),
            // tcp_state == 3
            first,
            ldx(4), nlattr, missing(12), add4,
            ldx(1), nlattr, missing(8), add4,
            ldx(1), nlattr, missing(4), tax,
            insn(0x50, 0, 0, 4), insn(0x15, 1, 0, 3),
            insn(0x05, 0, 0, 46),
            // orig_ipv4_src != 127.0.0.1
            first,
            ldx(1), nlattr, missing(14), add4,
            ldx(1), nlattr, missing(10), add4,
            ldx(1), nlattr, missing(6), tax,
            insn(0x40, 0, 0, 4), and, insn(0x15, 1, 0, 0x7f00_0001), insn(0x05, 0, 0, 1),
            insn(0x05, 0, 0, 28),
            // orig_ipv6_src != ::1
            first,
            ldx(1), nlattr, missing(23), add4,
            ldx(1), nlattr, missing(19), add4,
            ldx(3), nlattr, missing(15), tax,
            insn(0x40, 0, 0, 4), and, insn(0x15, 0, 9, 0),
            insn(0x40, 0, 0, 8), and, insn(0x15, 0, 6, 0),
            insn(0x40, 0, 0, 12), and, insn(0x15, 0, 3, 0),
            insn(0x40, 0, 0, 16), and, insn(0x15, 1, 0, 1),
            insn(0x05, 0, 0, 1),
            insn(0x05, 0, 0, 1),
            // accept, reject
            insn(0x06, 0, 0, 0xffff_ffff), insn(0x06, 0, 0, 0),
        ];

        let got = compile(Table::Conntrack, &scenario()).unwrap();
        assert_eq!(got.len(), 85);
        assert_eq!(got, want);
    }

    #[test]
    fn scenario_behaviour() {
        let program = compile(Table::Conntrack, &scenario()).unwrap();
        assert_eq!(program, compile(Table::Conntrack, &scenario()).unwrap());

        let remote = Ipv4Addr::new(10, 0, 0, 1);
        let tests = [
            ("established tcp", tcp(remote, 6, Some(3)), ACCEPT),
            ("loopback", tcp(Ipv4Addr::LOCALHOST, 6, Some(3)), REJECT),
            ("other state", tcp(remote, 6, Some(2)), REJECT),
            ("icmp", tcp(remote, 1, None), REJECT),
            ("udp without protoinfo", tcp(remote, 17, None), ACCEPT),
            ("expectation", message(Table::Expected, &[]), ACCEPT),
        ];

        for (name, packet, want) in tests {
            assert_eq!(run(&program, &packet), want, "{name}");
        }
    }

    #[test]
    fn empty_accepts_everything() {
        let program = compile(Table::Conntrack, &[]).unwrap();
        assert_eq!(program, vec![insn(0x06, 0, 0, ACCEPT)]);
        assert_eq!(run(&program, &tcp(Ipv4Addr::LOCALHOST, 6, None)), ACCEPT);
    }

    #[test]
    fn or_group() {
        let program = compile(
            Table::Conntrack,
            &[
                "orig_l4_proto=6".parse().unwrap(),
                "orig_l4_proto=17".parse().unwrap(),
            ],
        )
        .unwrap();

        let remote = Ipv4Addr::new(10, 0, 0, 1);
        for (proto, want) in [(6, ACCEPT), (17, ACCEPT), (1, REJECT), (132, REJECT)] {
            assert_eq!(run(&program, &tcp(remote, proto, None)), want, "proto {proto}");
        }

        // a match on the first member jumps straight to accept
        let (index, first) = program
            .iter()
            .enumerate()
            .find(|(_, ins)| ins.code == 0x15 && ins.k == 6)
            .unwrap();
        assert_eq!(index + 1 + first.jt as usize, program.len() - 2);
    }

    #[test]
    fn negation_inverts() {
        let probes = [
            Ipv4Addr::new(127, 0, 0, 0),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 2),
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 255),
        ];

        for mask in [None, Some("255.255.255.255"), Some("255.255.255.0")] {
            let plain = FilterEntry::parse(OrigIpv4Src, "127.0.0.1", mask, false).unwrap();
            let negated = FilterEntry::parse(OrigIpv4Src, "127.0.0.1", mask, true).unwrap();
            let plain = compile(Table::Conntrack, &[plain]).unwrap();
            let negated = compile(Table::Conntrack, &[negated]).unwrap();

            for probe in probes {
                let packet = tcp(probe, 6, None);
                let want = if run(&plain, &packet) == ACCEPT {
                    REJECT
                } else {
                    ACCEPT
                };
                assert_eq!(run(&negated, &packet), want, "{probe} mask {mask:?}");
            }
        }
    }

    #[test]
    fn ipv6_decomposition() {
        let entry: FilterEntry = "orig_ipv6_src!=::1".parse().unwrap();
        let program = compile(Table::Conntrack, &[entry]).unwrap();

        let loads = program
            .iter()
            .filter(|ins| ins.code == 0x40)
            .map(|ins| ins.k)
            .collect::<Vec<_>>();
        assert_eq!(loads, vec![4, 8, 12, 16]);

        let record = |src: Ipv6Addr| {
            message(
                Table::Conntrack,
                &[
                    ConnAttr::ipv6(OrigIpv6Src, src),
                    ConnAttr::ipv6(OrigIpv6Dst, "2001:db8::2".parse().unwrap()),
                    ConnAttr::u8(OrigL4Proto, 6),
                ],
            )
        };

        for probe in ["::1", "::2", "1::1", "::", "::1:0:0:1"] {
            let addr = probe.parse::<Ipv6Addr>().unwrap();
            let want = if addr == Ipv6Addr::LOCALHOST {
                REJECT
            } else {
                ACCEPT
            };
            assert_eq!(run(&program, &record(addr)), want, "{probe}");
        }
    }

    #[test]
    fn masked_compare() {
        let entry: FilterEntry = "orig_ipv4_src=10.0.0.0/255.0.0.0".parse().unwrap();
        let program = compile(Table::Conntrack, &[entry]).unwrap();

        assert_eq!(run(&program, &tcp(Ipv4Addr::new(10, 9, 8, 7), 6, None)), ACCEPT);
        assert_eq!(run(&program, &tcp(Ipv4Addr::new(11, 0, 0, 0), 6, None)), REJECT);
    }

    #[test]
    fn invalid_entries() {
        let err = compile(
            Table::Conntrack,
            &[
                FilterEntry::new(OrigL4Proto, [6]),
                FilterEntry::new(OrigCounterBytes, [0; 8]),
            ],
        )
        .unwrap_err();
        assert_eq!(err, Error::UnsupportedFilterAttribute(OrigCounterBytes));

        let err = compile(Table::Conntrack, &[FilterEntry::new(OrigPortSrc, [0x50])]).unwrap_err();
        assert!(matches!(err, Error::InvalidFilterEntry { kind: OrigPortSrc, .. }));

        let err = compile(
            Table::Conntrack,
            &[FilterEntry::new(OrigIpv4Src, [1, 2, 3, 4]).with_mask([0xff; 2])],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidFilterEntry { kind: OrigIpv4Src, .. }));
    }

    #[test]
    fn limits() {
        // each member jumps past all later ones, which soon exceeds a u8
        let entries = (0..200u16)
            .map(|port| FilterEntry::new(OrigPortDst, port.to_be_bytes()))
            .collect::<Vec<_>>();
        let err = compile(Table::Conntrack, &entries).unwrap_err();
        assert!(matches!(err, Error::JumpOutOfRange(_)), "{err:?}");

        // negated members only branch locally, so only the size limit hits
        let entries = (0..1500u16)
            .map(|port| FilterEntry::new(OrigPortDst, port.to_be_bytes()).negated())
            .collect::<Vec<_>>();
        let err = compile(Table::Conntrack, &entries).unwrap_err();
        assert_eq!(err, Error::ProgramTooLarge(BPF_MAXINSNS + 1));
    }

    #[test]
    fn parse_expressions() {
        let tests = [
            ("orig_l4_proto=6", Ok(FilterEntry::new(OrigL4Proto, [6]))),
            (
                "orig_ipv4_src!=127.0.0.1",
                Ok(FilterEntry::new(OrigIpv4Src, [127, 0, 0, 1]).negated()),
            ),
            (
                " mark=0x10/0xf0",
                Ok(FilterEntry::new(Mark, [0, 0, 0, 0x10]).with_mask([0, 0, 0, 0xf0])),
            ),
            ("orig_l4_proto", Err(())),
            ("nope=1", Err(())),
            ("orig_port_dst=70000", Err(())),
        ];

        for (input, want) in tests {
            let got = input.parse::<FilterEntry>().map_err(|_| ());
            assert_eq!(got, want, "{input}");
        }
    }

    #[test]
    fn wire_form() {
        let ins = insn(0x15, 1, 2, 0x0102_0304);
        let bytes = ins.to_bytes();

        assert_eq!(&bytes[0..2], &0x15u16.to_ne_bytes());
        assert_eq!(bytes[2..4], [1, 2]);
        assert_eq!(&bytes[4..8], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(ins.to_string(), "{ 0x15, 1, 2, 0x01020304 }");
    }
}
