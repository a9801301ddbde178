//! Rules module for Norx
//!
//! This module handles rule parsing and the loaders that feed parsed rules and
//! their support tables into a detection context.

pub mod loader;
pub mod support;

use regex::bytes::{Regex, RegexBuilder};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

pub use loader::{LoadSummary, RuleFileLoader, RulesetLoader, StaticRuleset};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Failed to parse rule: {0}")]
    ParseError(String),

    #[error("Invalid rule format: {0}")]
    FormatError(String),

    #[error("Failed to load rule file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid pcre: {0}")]
    RegexError(#[from] regex::Error),

    #[error(transparent)]
    Detect(#[from] crate::detect::DetectError),
}

/// Rule action to take when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Alert on match
    Alert,
    /// Log the match
    Log,
    /// Drop the packet (in inline mode)
    Drop,
    /// Reject the packet (in inline mode)
    Reject,
    /// Pass the packet without further inspection
    Pass,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Alert => write!(f, "alert"),
            RuleAction::Log => write!(f, "log"),
            RuleAction::Drop => write!(f, "drop"),
            RuleAction::Reject => write!(f, "reject"),
            RuleAction::Pass => write!(f, "pass"),
        }
    }
}

impl TryFrom<&str> for RuleAction {
    type Error = RuleError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "alert" => Ok(RuleAction::Alert),
            "log" => Ok(RuleAction::Log),
            "drop" => Ok(RuleAction::Drop),
            "reject" => Ok(RuleAction::Reject),
            "pass" => Ok(RuleAction::Pass),
            _ => Err(RuleError::ParseError(format!("Invalid rule action: {}", s))),
        }
    }
}

/// Rule protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleProtocol {
    /// IP protocol
    IP,
    /// TCP protocol
    TCP,
    /// UDP protocol
    UDP,
    /// ICMP protocol
    ICMP,
    /// HTTP protocol
    HTTP,
    /// DNS protocol
    DNS,
    /// TLS/SSL protocol
    TLS,
    /// Any protocol
    Any,
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleProtocol::IP => write!(f, "ip"),
            RuleProtocol::TCP => write!(f, "tcp"),
            RuleProtocol::UDP => write!(f, "udp"),
            RuleProtocol::ICMP => write!(f, "icmp"),
            RuleProtocol::HTTP => write!(f, "http"),
            RuleProtocol::DNS => write!(f, "dns"),
            RuleProtocol::TLS => write!(f, "tls"),
            RuleProtocol::Any => write!(f, "any"),
        }
    }
}

impl TryFrom<&str> for RuleProtocol {
    type Error = RuleError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "ip" => Ok(RuleProtocol::IP),
            "tcp" => Ok(RuleProtocol::TCP),
            "udp" => Ok(RuleProtocol::UDP),
            "icmp" => Ok(RuleProtocol::ICMP),
            "http" => Ok(RuleProtocol::HTTP),
            "dns" => Ok(RuleProtocol::DNS),
            "tls" | "ssl" => Ok(RuleProtocol::TLS),
            "any" => Ok(RuleProtocol::Any),
            _ => Err(RuleError::ParseError(format!("Invalid rule protocol: {}", s))),
        }
    }
}

/// Rule direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    /// Unidirectional (source -> destination)
    Unidirectional,
    /// Bidirectional (source <-> destination)
    Bidirectional,
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleDirection::Unidirectional => write!(f, "->"),
            RuleDirection::Bidirectional => write!(f, "<>"),
        }
    }
}

impl TryFrom<&str> for RuleDirection {
    type Error = RuleError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "->" => Ok(RuleDirection::Unidirectional),
            "<>" => Ok(RuleDirection::Bidirectional),
            _ => Err(RuleError::ParseError(format!("Invalid rule direction: {}", s))),
        }
    }
}

/// Address part of a rule header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec {
    /// `any` or a variable such as `$HOME_NET`
    Any,
    /// Single address or CIDR block
    Cidr { network: IpAddr, prefix: u8 },
    /// `!spec`
    Not(Box<AddressSpec>),
}

impl AddressSpec {
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let s: &str = s.trim();
        if let Some(inner) = s.strip_prefix('!') {
            return Ok(AddressSpec::Not(Box::new(Self::parse(inner)?)));
        }
        if s.eq_ignore_ascii_case("any") || s.starts_with('$') {
            return Ok(AddressSpec::Any);
        }

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| RuleError::ParseError(format!("Invalid address: {}", s)))?;
        let max_prefix: u8 = if network.is_ipv4() { 32 } else { 128 };
        let prefix: u8 = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| RuleError::ParseError(format!("Invalid prefix length: {}", s)))?,
            None => max_prefix,
        };

        Ok(AddressSpec::Cidr { network, prefix })
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            AddressSpec::Any => true,
            AddressSpec::Not(inner) => !inner.matches(ip),
            AddressSpec::Cidr { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask: u32 = u32::MAX.checked_shl(32 - u32::from(*prefix)).unwrap_or(0);
                    (u32::from(*net) & mask) == (u32::from(*ip) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask: u128 = u128::MAX.checked_shl(128 - u32::from(*prefix)).unwrap_or(0);
                    (u128::from(*net) & mask) == (u128::from(*ip) & mask)
                }
                _ => false,
            },
        }
    }
}

/// Port part of a rule header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Any,
    /// Inclusive range; a single port is `Range(p, p)`
    Range(u16, u16),
    Not(Box<PortSpec>),
}

impl PortSpec {
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let s: &str = s.trim();
        if let Some(inner) = s.strip_prefix('!') {
            return Ok(PortSpec::Not(Box::new(Self::parse(inner)?)));
        }
        if s.eq_ignore_ascii_case("any") || s.starts_with('$') {
            return Ok(PortSpec::Any);
        }

        let port = |p: &str, default: u16| -> Result<u16, RuleError> {
            if p.is_empty() {
                return Ok(default);
            }
            p.parse::<u16>()
                .map_err(|_| RuleError::ParseError(format!("Invalid port: {}", s)))
        };

        match s.split_once(':') {
            Some((lo, hi)) => {
                let (lo, hi) = (port(lo, 0)?, port(hi, u16::MAX)?);
                if lo > hi {
                    return Err(RuleError::ParseError(format!("Invalid port range: {}", s)));
                }
                Ok(PortSpec::Range(lo, hi))
            }
            None => {
                let p: u16 = port(s, 0)?;
                Ok(PortSpec::Range(p, p))
            }
        }
    }

    /// Missing ports (ICMP, raw IP) only match `any`
    pub fn matches(&self, port: Option<u16>) -> bool {
        match (self, port) {
            (PortSpec::Any, _) => true,
            (PortSpec::Range(lo, hi), Some(p)) => (*lo..=*hi).contains(&p),
            (PortSpec::Not(inner), Some(_)) => !inner.matches(port),
            (_, None) => false,
        }
    }

    /// The port when the spec names exactly one
    pub fn single(&self) -> Option<u16> {
        match self {
            PortSpec::Range(lo, hi) if lo == hi => Some(*lo),
            _ => None,
        }
    }
}

/// Buffer a content pattern is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentBuffer {
    Payload,
    Uri,
}

/// Rule content match
#[derive(Debug, Clone)]
pub struct RuleContent {
    /// Content pattern to match
    pub pattern: Vec<u8>,
    /// Case insensitive flag
    pub nocase: bool,
    /// Buffer the pattern applies to
    pub buffer: ContentBuffer,
}

/// Compiled `pcre` option
#[derive(Debug, Clone)]
pub struct RulePcre {
    pub regex: Regex,
    pub buffer: ContentBuffer,
}

/// `byte_extract:<bytes>,<offset>,<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteExtract {
    pub nbytes: usize,
    pub offset: usize,
    pub name: String,
}

/// Rule option
#[derive(Debug, Clone)]
pub enum RuleOption {
    /// Content match
    Content(RuleContent),
    /// PCRE regular expression
    Pcre(RulePcre),
    /// Flowbit command and variable name
    Flowbits(String, Option<String>),
    /// Value extraction into a signature-local variable
    ByteExtract(ByteExtract),
    /// Reference
    Reference(String, String),
    /// Message
    Msg(String),
    /// Revision
    Rev(u32),
    /// Signature ID
    Sid(u32),
    /// Generator ID
    Gid(u32),
    /// Classification
    Classtype(String),
    /// Priority
    Priority(u32),
    /// Other option
    Other(String, Option<String>),
}

/// Rule header
#[derive(Debug, Clone)]
pub struct RuleHeader {
    /// Rule action
    pub action: RuleAction,
    /// Rule protocol
    pub protocol: RuleProtocol,
    /// Source IP address
    pub src_ip: AddressSpec,
    /// Source port
    pub src_port: PortSpec,
    /// Rule direction
    pub direction: RuleDirection,
    /// Destination IP address
    pub dst_ip: AddressSpec,
    /// Destination port
    pub dst_port: PortSpec,
}

/// Rule definition
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule header
    pub header: RuleHeader,
    /// Rule options
    pub options: Vec<RuleOption>,
    /// Raw rule string
    pub raw: String,
}

impl Rule {
    /// Create a new rule from a rule string
    pub fn new(rule_str: &str) -> Result<Self, RuleError> {
        let raw: &str = rule_str.trim();
        let open: usize = raw
            .find('(')
            .ok_or_else(|| RuleError::FormatError("missing option block".to_string()))?;
        let close: usize = raw
            .rfind(')')
            .filter(|close| *close > open)
            .ok_or_else(|| RuleError::FormatError("unterminated option block".to_string()))?;

        let header: RuleHeader = parse_header(&raw[..open])?;
        let options: Vec<RuleOption> = parse_options(&raw[open + 1..close])?;

        let rule: Rule = Self {
            header,
            options,
            raw: raw.to_string(),
        };
        if rule.sid().is_none() {
            return Err(RuleError::ParseError("rule has no sid".to_string()));
        }

        Ok(rule)
    }

    pub fn sid(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            RuleOption::Sid(sid) => Some(*sid),
            _ => None,
        })
    }

    pub fn gid(&self) -> u32 {
        self.options
            .iter()
            .find_map(|opt| match opt {
                RuleOption::Gid(gid) => Some(*gid),
                _ => None,
            })
            .unwrap_or(1)
    }

    pub fn rev(&self) -> u32 {
        self.options
            .iter()
            .find_map(|opt| match opt {
                RuleOption::Rev(rev) => Some(*rev),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn msg(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            RuleOption::Msg(msg) => Some(msg.as_str()),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            RuleOption::Priority(prio) => Some(*prio),
            _ => None,
        })
    }

    pub fn classtype(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            RuleOption::Classtype(class) => Some(class.as_str()),
            _ => None,
        })
    }

    pub fn contents(&self) -> impl Iterator<Item = &RuleContent> {
        self.options.iter().filter_map(|opt| match opt {
            RuleOption::Content(content) => Some(content),
            _ => None,
        })
    }
}

fn parse_header(header: &str) -> Result<RuleHeader, RuleError> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() != 7 {
        return Err(RuleError::FormatError(format!(
            "expected 7 header fields, found {}",
            parts.len()
        )));
    }

    Ok(RuleHeader {
        action: RuleAction::try_from(parts[0])?,
        protocol: RuleProtocol::try_from(parts[1])?,
        src_ip: AddressSpec::parse(parts[2])?,
        src_port: PortSpec::parse(parts[3])?,
        direction: RuleDirection::try_from(parts[4])?,
        dst_ip: AddressSpec::parse(parts[5])?,
        dst_port: PortSpec::parse(parts[6])?,
    })
}

/// Split the option block on `;`, honouring quotes and backslash escapes
fn split_options(body: &str) -> Vec<String> {
    let mut options: Vec<String> = Vec::new();
    let mut current: String = String::new();
    let mut in_quotes: bool = false;
    let mut escaped: bool = false;

    for c in body.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ';' if !in_quotes => {
                if !current.trim().is_empty() {
                    options.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        options.push(current.trim().to_string());
    }

    options
}

fn strip_quotes(value: &str) -> &str {
    let value: &str = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn unquote(value: &str) -> String {
    let inner: &str = strip_quotes(value);
    let mut out: String = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decode a content string: text with `|hex bytes|` sections
fn parse_content(value: &str) -> Result<Vec<u8>, RuleError> {
    let text: String = unquote(value);
    let mut pattern: Vec<u8> = Vec::with_capacity(text.len());

    for (i, segment) in text.split('|').enumerate() {
        if i % 2 == 0 {
            pattern.extend_from_slice(segment.as_bytes());
            continue;
        }
        for byte in segment.split_whitespace() {
            let byte: u8 = u8::from_str_radix(byte, 16)
                .map_err(|_| RuleError::ParseError(format!("Invalid hex byte in content: {}", byte)))?;
            pattern.push(byte);
        }
    }

    if text.matches('|').count() % 2 != 0 {
        return Err(RuleError::ParseError(format!("Unbalanced '|' in content: {}", value)));
    }
    if pattern.is_empty() {
        return Err(RuleError::ParseError("Empty content pattern".to_string()));
    }

    Ok(pattern)
}

/// Compile `"/pattern/flags"`
fn parse_pcre(value: &str) -> Result<RulePcre, RuleError> {
    let text: &str = strip_quotes(value);
    let body: &str = text
        .strip_prefix('/')
        .ok_or_else(|| RuleError::ParseError(format!("pcre must start with '/': {}", value)))?;
    let end: usize = body
        .rfind('/')
        .ok_or_else(|| RuleError::ParseError(format!("pcre is not terminated: {}", value)))?;
    let (pattern, flags) = (&body[..end], &body[end + 1..]);

    let mut builder: RegexBuilder = RegexBuilder::new(pattern);
    let mut buffer: ContentBuffer = ContentBuffer::Payload;
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'U' => buffer = ContentBuffer::Uri,
            other => {
                return Err(RuleError::ParseError(format!("Unsupported pcre flag: {}", other)));
            }
        }
    }

    Ok(RulePcre {
        regex: builder.build()?,
        buffer,
    })
}

fn parse_number(key: &str, value: Option<&str>) -> Result<u32, RuleError> {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| RuleError::ParseError(format!("Invalid {} value: {:?}", key, value)))
}

fn parse_options(body: &str) -> Result<Vec<RuleOption>, RuleError> {
    let mut options: Vec<RuleOption> = Vec::new();

    for option in split_options(body) {
        let (key, value) = match option.split_once(':') {
            Some((key, value)) => (key.trim().to_lowercase(), Some(value.trim())),
            None => (option.trim().to_lowercase(), None),
        };

        let parsed: RuleOption = match key.as_str() {
            "msg" => RuleOption::Msg(unquote(value.unwrap_or_default())),
            "content" | "uricontent" => {
                let value: &str = value
                    .ok_or_else(|| RuleError::ParseError(format!("{} needs a value", key)))?;
                RuleOption::Content(RuleContent {
                    pattern: parse_content(value)?,
                    nocase: false,
                    buffer: if key == "uricontent" {
                        ContentBuffer::Uri
                    } else {
                        ContentBuffer::Payload
                    },
                })
            }
            "nocase" | "http_uri" => {
                let last: &mut RuleContent = options
                    .iter_mut()
                    .rev()
                    .find_map(|opt| match opt {
                        RuleOption::Content(content) => Some(content),
                        _ => None,
                    })
                    .ok_or_else(|| RuleError::ParseError(format!("{} without a preceding content", key)))?;
                if key == "nocase" {
                    last.nocase = true;
                } else {
                    last.buffer = ContentBuffer::Uri;
                }
                continue;
            }
            "pcre" => RuleOption::Pcre(parse_pcre(value.unwrap_or_default())?),
            "sid" => RuleOption::Sid(parse_number(&key, value)?),
            "rev" => RuleOption::Rev(parse_number(&key, value)?),
            "gid" => RuleOption::Gid(parse_number(&key, value)?),
            "priority" => RuleOption::Priority(parse_number(&key, value)?),
            "classtype" => RuleOption::Classtype(value.unwrap_or_default().to_string()),
            "reference" => {
                let (kind, id) = value
                    .and_then(|v| v.split_once(','))
                    .ok_or_else(|| RuleError::ParseError(format!("Invalid reference: {:?}", value)))?;
                RuleOption::Reference(kind.trim().to_string(), id.trim().to_string())
            }
            "flowbits" => {
                let value: &str = value.unwrap_or_default();
                let (cmd, name) = match value.split_once(',') {
                    Some((cmd, name)) => (cmd.trim(), Some(name.trim().to_string())),
                    None => (value.trim(), None),
                };
                RuleOption::Flowbits(cmd.to_string(), name)
            }
            "byte_extract" => {
                let fields: Vec<&str> = value.unwrap_or_default().split(',').map(str::trim).collect();
                let parsed = match fields.as_slice() {
                    [nbytes, offset, name, ..] => nbytes
                        .parse::<usize>()
                        .ok()
                        .filter(|n| (1..=8).contains(n))
                        .zip(offset.parse::<usize>().ok())
                        .map(|(nbytes, offset)| ByteExtract {
                            nbytes,
                            offset,
                            name: name.to_string(),
                        }),
                    _ => None,
                };
                RuleOption::ByteExtract(parsed.ok_or_else(|| {
                    RuleError::ParseError(format!("Invalid byte_extract: {:?}", value))
                })?)
            }
            _ => RuleOption::Other(key, value.map(str::to_string)),
        };

        options.push(parsed);
    }

    Ok(options)
}
