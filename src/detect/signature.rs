//! Compiled signatures
//!
//! A [`Signature`] is a parsed [`Rule`] after it has been added to a detection
//! context: its patterns carry the context's pattern ids and its priority has
//! been resolved against the classification table.

use crate::core::packet::{NorxPacket, Protocol};
use crate::detect::keyword::{KeywordThreadCtx, ThreadKeyword};
use crate::rules::{ByteExtract, ContentBuffer, RuleAction, RuleDirection, RuleHeader, RuleProtocol, RulePcre};
use regex::bytes::CaptureLocations;
use std::collections::HashMap;

/// Transport a packet is inspected under; keys the per-protocol indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Transport {
    pub const ALL: [Transport; 4] = [Transport::Tcp, Transport::Udp, Transport::Icmp, Transport::Other];
}

impl From<Protocol> for Transport {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::TCP => Transport::Tcp,
            Protocol::UDP => Transport::Udp,
            Protocol::ICMP | Protocol::ICMPv6 => Transport::Icmp,
            Protocol::Unknown(_) => Transport::Other,
        }
    }
}

/// Content pattern bound to a context pattern id
#[derive(Debug, Clone)]
pub struct SigContent {
    pub pattern_id: u32,
    pub pattern: Vec<u8>,
    pub nocase: bool,
    pub buffer: ContentBuffer,
}

#[derive(Debug, Clone)]
pub struct Signature {
    /// Internal number, dense once the context is built
    pub num: u32,
    pub gid: u32,
    pub sid: u32,
    pub rev: u32,
    pub msg: String,
    pub action: RuleAction,
    pub priority: u32,
    pub class: Option<String>,
    /// Resolved reference urls, or `system,id` when the system is unknown
    pub references: Vec<String>,
    pub header: RuleHeader,
    pub contents: Vec<SigContent>,
    pub pcres: Vec<RulePcre>,
    /// Local id of each extraction is its index
    pub byte_extracts: Vec<ByteExtract>,
    pub flowbit_ids: Vec<u32>,
}

impl Signature {
    /// Signatures decided by header fields alone
    pub fn is_ip_only(&self) -> bool {
        self.contents.is_empty() && self.pcres.is_empty() && self.byte_extracts.is_empty()
    }

    /// Transports whose traffic this signature can match
    pub fn transports(&self) -> &'static [Transport] {
        match self.header.protocol {
            RuleProtocol::TCP | RuleProtocol::HTTP | RuleProtocol::TLS => &[Transport::Tcp],
            RuleProtocol::UDP => &[Transport::Udp],
            RuleProtocol::DNS => &[Transport::Tcp, Transport::Udp],
            RuleProtocol::ICMP => &[Transport::Icmp],
            RuleProtocol::IP | RuleProtocol::Any => &Transport::ALL,
        }
    }

    /// The single destination port this signature is grouped under, if any
    pub fn group_port(&self) -> Option<u16> {
        match self.header.direction {
            RuleDirection::Unidirectional => self.header.dst_port.single(),
            RuleDirection::Bidirectional => None,
        }
    }

    /// Protocol, address and port checks
    pub fn header_matches(&self, packet: &NorxPacket) -> bool {
        if !self.transports().contains(&Transport::from(packet.protocol)) {
            return false;
        }

        let h: &RuleHeader = &self.header;
        let forward: bool = h.src_ip.matches(&packet.src_ip)
            && h.src_port.matches(packet.src_port)
            && h.dst_ip.matches(&packet.dst_ip)
            && h.dst_port.matches(packet.dst_port);

        forward
            || (h.direction == RuleDirection::Bidirectional
                && h.src_ip.matches(&packet.dst_ip)
                && h.src_port.matches(packet.dst_port)
                && h.dst_ip.matches(&packet.src_ip)
                && h.dst_port.matches(packet.src_port))
    }
}

/// Exact, case-sensitive substring search
pub fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Per-worker capture scratch for `pcre`, keyed by signature number
#[derive(Default)]
pub struct PcreThreadCtx {
    locations: HashMap<(u32, usize), CaptureLocations>,
}

impl PcreThreadCtx {
    /// Run `pcre` (the `index`th of signature `num`) reusing this worker's
    /// capture buffers
    pub fn is_match(&mut self, num: u32, index: usize, pcre: &RulePcre, haystack: &[u8]) -> bool {
        let locs: &mut CaptureLocations = self
            .locations
            .entry((num, index))
            .or_insert_with(|| pcre.regex.capture_locations());
        pcre.regex.captures_read(locs, haystack).is_some()
    }

    pub fn cached(&self) -> usize {
        self.locations.len()
    }
}

/// Thread keyword backing `pcre`
pub struct PcreKeyword;

impl ThreadKeyword for PcreKeyword {
    fn init_thread_ctx(&self) -> Option<KeywordThreadCtx> {
        Some(Box::new(PcreThreadCtx::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;

    fn signature(rule: &str) -> Signature {
        let rule: Rule = Rule::new(rule).unwrap();
        Signature {
            num: 0,
            gid: rule.gid(),
            sid: rule.sid().unwrap(),
            rev: rule.rev(),
            msg: rule.msg().unwrap_or_default().to_string(),
            action: rule.header.action,
            priority: 3,
            class: None,
            references: Vec::new(),
            header: rule.header.clone(),
            contents: Vec::new(),
            pcres: Vec::new(),
            byte_extracts: Vec::new(),
            flowbit_ids: Vec::new(),
        }
    }

    #[test]
    fn test_header_matching_both_directions() {
        let uni: Signature = signature("alert tcp 10.0.0.1 any -> any 80 (sid:1;)");
        let bi: Signature = signature("alert tcp 10.0.0.1 any <> any 80 (sid:2;)");

        let forward: NorxPacket = NorxPacket::builder(Protocol::TCP)
            .src("10.0.0.1".parse().unwrap(), 40000)
            .dst("10.0.0.2".parse().unwrap(), 80)
            .build();
        let reverse: NorxPacket = NorxPacket::builder(Protocol::TCP)
            .src("10.0.0.2".parse().unwrap(), 80)
            .dst("10.0.0.1".parse().unwrap(), 40000)
            .build();
        let udp: NorxPacket = NorxPacket::builder(Protocol::UDP)
            .src("10.0.0.1".parse().unwrap(), 40000)
            .dst("10.0.0.2".parse().unwrap(), 80)
            .build();

        assert!(uni.header_matches(&forward));
        assert!(!uni.header_matches(&reverse));
        assert!(bi.header_matches(&reverse));
        assert!(!uni.header_matches(&udp));
        assert_eq!(uni.group_port(), Some(80));
        assert_eq!(bi.group_port(), None);
        assert!(uni.is_ip_only());
    }

    #[test]
    fn test_pcre_thread_ctx_reuses_locations() {
        let rule: Rule = Rule::new("alert tcp any any -> any any (pcre:\"/id=(\\d+)/\"; sid:3;)").unwrap();
        let pcre: RulePcre = rule
            .options
            .iter()
            .find_map(|opt| match opt {
                crate::rules::RuleOption::Pcre(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap();

        let mut ctx: PcreThreadCtx = PcreThreadCtx::default();
        assert!(ctx.is_match(0, 0, &pcre, b"GET /?id=42"));
        assert!(!ctx.is_match(0, 0, &pcre, b"GET /?id=x"));
        assert_eq!(ctx.cached(), 1);
        assert!(contains_subslice(b"abcdef", b"cde"));
        assert!(!contains_subslice(b"abcdef", b"CDE"));
    }
}
