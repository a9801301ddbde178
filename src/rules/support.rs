//! Classification, reference and threshold tables
//!
//! These are loaded into a detection context next to the signatures. The
//! threshold table only holds configuration; hit counting lives in each
//! worker's scratch.

use crate::rules::RuleError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Default priority for signatures without classtype or priority
pub const DEFAULT_PRIORITY: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub name: String,
    pub description: String,
    pub priority: u32,
}

/// `config classification: name,description,priority`
#[derive(Debug, Default)]
pub struct ClassificationTable {
    entries: HashMap<String, Classification>,
}

impl ClassificationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse classification lines, returning how many entries were added
    pub fn load_str(&mut self, source: &str) -> Result<usize, RuleError> {
        let mut count: usize = 0;

        for line in config_lines(source, "classification") {
            let fields: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
            let [name, description, priority] = fields.as_slice() else {
                return Err(RuleError::FormatError(format!("Invalid classification: {}", line)));
            };
            let priority: u32 = priority
                .parse()
                .map_err(|_| RuleError::ParseError(format!("Invalid classification priority: {}", line)))?;

            self.entries.insert(
                name.to_string(),
                Classification {
                    name: name.to_string(),
                    description: description.to_string(),
                    priority,
                },
            );
            count += 1;
        }

        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&Classification> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `config reference: name url-prefix`
#[derive(Debug, Default)]
pub struct ReferenceTable {
    entries: HashMap<String, String>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_str(&mut self, source: &str) -> Result<usize, RuleError> {
        let mut count: usize = 0;

        for line in config_lines(source, "reference") {
            let (name, url) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| RuleError::FormatError(format!("Invalid reference: {}", line)))?;
            self.entries
                .insert(name.trim().to_lowercase(), url.trim().to_string());
            count += 1;
        }

        Ok(count)
    }

    /// Expand a rule reference into a full url when the system is known
    pub fn resolve(&self, system: &str, id: &str) -> Option<String> {
        let prefix: &String = self.entries.get(&system.to_lowercase())?;
        if prefix.starts_with("http") {
            Some(format!("{}{}", prefix, id))
        } else {
            Some(format!("http://{}{}", prefix, id))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Non-empty, non-comment lines carrying `config <kind>:`
fn config_lines<'a>(source: &'a str, kind: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    source.lines().filter_map(move |line| {
        let line: &str = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let rest: &str = line.strip_prefix("config")?.trim_start();
        let rest: &str = rest.strip_prefix(kind)?.trim_start();
        Some(rest.strip_prefix(':')?.trim())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    /// Alert on the first `count` hits per window
    Limit,
    /// Alert on every `count`th hit per window
    Threshold,
    /// Alert once per window, after `count` hits
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackBy {
    Src,
    Dst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdRule {
    Rate {
        kind: ThresholdKind,
        track: TrackBy,
        count: u32,
        seconds: u64,
    },
    Suppress {
        track: Option<(TrackBy, IpAddr)>,
    },
}

/// Per-signature threshold and suppress configuration, keyed by (gid, sid)
#[derive(Debug, Default)]
pub struct ThresholdTable {
    entries: HashMap<(u32, u32), Vec<ThresholdRule>>,
}

impl ThresholdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `threshold ...` and `suppress ...` lines
    pub fn load_str(&mut self, source: &str) -> Result<usize, RuleError> {
        let mut count: usize = 0;

        for line in source.lines() {
            let line: &str = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, rest) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| RuleError::FormatError(format!("Invalid threshold line: {}", line)))?;

            let fields: HashMap<&str, &str> = rest
                .split(',')
                .filter_map(|f| f.trim().split_once(char::is_whitespace))
                .map(|(k, v)| (k.trim(), v.trim()))
                .collect();
            let number = |key: &str| -> Result<u64, RuleError> {
                fields
                    .get(key)
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| RuleError::ParseError(format!("Missing or invalid {} in: {}", key, line)))
            };
            let track = || -> Result<Option<TrackBy>, RuleError> {
                match fields.get("track").copied() {
                    Some("by_src") => Ok(Some(TrackBy::Src)),
                    Some("by_dst") => Ok(Some(TrackBy::Dst)),
                    Some(other) => Err(RuleError::ParseError(format!("Invalid track: {}", other))),
                    None => Ok(None),
                }
            };

            let id = |key: &str| -> Result<u32, RuleError> {
                u32::try_from(number(key)?)
                    .map_err(|_| RuleError::ParseError(format!("{} out of range in: {}", key, line)))
            };
            let gid: u32 = id("gen_id")?;
            let sid: u32 = id("sig_id")?;

            let rule: ThresholdRule = match directive {
                "threshold" | "event_filter" => {
                    let kind: ThresholdKind = match fields.get("type").copied() {
                        Some("limit") => ThresholdKind::Limit,
                        Some("threshold") => ThresholdKind::Threshold,
                        Some("both") => ThresholdKind::Both,
                        other => {
                            return Err(RuleError::ParseError(format!("Invalid threshold type: {:?}", other)));
                        }
                    };
                    ThresholdRule::Rate {
                        kind,
                        track: track()?.unwrap_or(TrackBy::Src),
                        count: id("count")?,
                        seconds: number("seconds")?,
                    }
                }
                "suppress" => {
                    let track: Option<(TrackBy, IpAddr)> = match (track()?, fields.get("ip")) {
                        (Some(by), Some(ip)) => Some((
                            by,
                            ip.parse()
                                .map_err(|_| RuleError::ParseError(format!("Invalid suppress ip: {}", ip)))?,
                        )),
                        _ => None,
                    };
                    ThresholdRule::Suppress { track }
                }
                other => {
                    return Err(RuleError::FormatError(format!("Unknown directive: {}", other)));
                }
            };

            self.entries.entry((gid, sid)).or_default().push(rule);
            count += 1;
        }

        Ok(count)
    }

    pub fn get(&self, gid: u32, sid: u32) -> Option<&[ThresholdRule]> {
        self.entries.get(&(gid, sid)).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Minimum time between sweeps of expired buckets
const BUCKET_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct ThresholdBucket {
    window_start: Instant,
    window: Duration,
    hits: u32,
}

impl ThresholdBucket {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }
}

/// Hit counters for threshold evaluation, owned by one worker
#[derive(Debug, Default)]
pub struct ThresholdState {
    buckets: HashMap<(u32, u32, IpAddr), ThresholdBucket>,
    last_prune: Option<Instant>,
}

impl ThresholdState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked (gid, sid, address) windows
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    fn prune(&mut self, now: Instant) {
        if self
            .last_prune
            .is_some_and(|last| now.saturating_duration_since(last) < BUCKET_PRUNE_INTERVAL)
        {
            return;
        }
        self.last_prune = Some(now);
        self.buckets.retain(|_, bucket| !bucket.expired(now));
    }

    /// Decide whether a match of (gid, sid) between `src` and `dst` should alert
    pub fn allow(
        &mut self,
        rules: &[ThresholdRule],
        gid: u32,
        sid: u32,
        src: IpAddr,
        dst: IpAddr,
        now: Instant,
    ) -> bool {
        for rule in rules {
            match rule {
                ThresholdRule::Suppress { track: None } => return false,
                ThresholdRule::Suppress {
                    track: Some((by, ip)),
                } => {
                    let tracked: IpAddr = if *by == TrackBy::Src { src } else { dst };
                    if tracked == *ip {
                        return false;
                    }
                }
                ThresholdRule::Rate {
                    kind,
                    track,
                    count,
                    seconds,
                } => {
                    let tracked: IpAddr = if *track == TrackBy::Src { src } else { dst };
                    let key: (u32, u32, IpAddr) = (gid, sid, tracked);
                    if !self.buckets.contains_key(&key) {
                        self.prune(now);
                    }
                    let window: Duration = Duration::from_secs(*seconds);
                    let bucket: &mut ThresholdBucket = self.buckets.entry(key).or_insert(ThresholdBucket {
                        window_start: now,
                        window,
                        hits: 0,
                    });
                    if bucket.expired(now) {
                        bucket.window_start = now;
                        bucket.hits = 0;
                    }
                    bucket.hits = bucket.hits.saturating_add(1);

                    let count: u32 = (*count).max(1);
                    let alert: bool = match kind {
                        ThresholdKind::Limit => bucket.hits <= count,
                        ThresholdKind::Threshold => bucket.hits % count == 0,
                        ThresholdKind::Both => bucket.hits == count,
                    };
                    if !alert {
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_classification_and_reference_tables() {
        let mut classes: ClassificationTable = ClassificationTable::new();
        let added: usize = classes
            .load_str(
                "# comment\nconfig classification: trojan-activity,A Network Trojan was detected, 1\n\
                 config classification: misc-activity,Misc activity,3\n",
            )
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(classes.get("trojan-activity").map(|c| c.priority), Some(1));
        assert!(classes.load_str("config classification: broken\n").is_err());

        let mut refs: ReferenceTable = ReferenceTable::new();
        refs.load_str("config reference: cve http://cve.mitre.org/cgi-bin/cvename.cgi?name=\nconfig reference: url \n")
            .unwrap_err();
        refs.load_str("config reference: bugtraq www.securityfocus.com/bid/\n")
            .unwrap();
        assert_eq!(
            refs.resolve("BUGTRAQ", "42").as_deref(),
            Some("http://www.securityfocus.com/bid/42")
        );
        assert_eq!(refs.resolve("nessus", "1"), None);
    }

    #[test]
    fn test_threshold_limit_and_suppress() {
        let mut table: ThresholdTable = ThresholdTable::new();
        table
            .load_str(
                "threshold gen_id 1, sig_id 10, type limit, track by_src, count 2, seconds 60\n\
                 suppress gen_id 1, sig_id 11\n\
                 suppress gen_id 1, sig_id 12, track by_dst, ip 10.0.0.9\n",
            )
            .unwrap();
        assert_eq!(table.len(), 3);

        let src: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let now: Instant = Instant::now();
        let mut state: ThresholdState = ThresholdState::new();

        let limit: &[ThresholdRule] = table.get(1, 10).unwrap();
        assert!(state.allow(limit, 1, 10, src, dst, now));
        assert!(state.allow(limit, 1, 10, src, dst, now));
        assert!(!state.allow(limit, 1, 10, src, dst, now));
        assert!(state.allow(limit, 1, 10, src, dst, now + Duration::from_secs(61)));

        assert!(!state.allow(table.get(1, 11).unwrap(), 1, 11, src, dst, now));
        assert!(!state.allow(table.get(1, 12).unwrap(), 1, 12, src, dst, now));
        assert!(state.allow(table.get(1, 12).unwrap(), 1, 12, dst, src, now));
    }

    #[test]
    fn test_threshold_every_nth() {
        let mut table: ThresholdTable = ThresholdTable::new();
        table
            .load_str("threshold gen_id 1, sig_id 5, type threshold, track by_dst, count 3, seconds 10\n")
            .unwrap();
        let rules: &[ThresholdRule] = table.get(1, 5).unwrap();

        let ip: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let now: Instant = Instant::now();
        let mut state: ThresholdState = ThresholdState::new();
        let alerts: Vec<bool> = (0..6).map(|_| state.allow(rules, 1, 5, ip, ip, now)).collect();
        assert_eq!(alerts, vec![false, false, true, false, false, true]);
        assert!(table.load_str("threshold gen_id 1, sig_id 5, type sometimes, count 1, seconds 1\n").is_err());
    }

    #[test]
    fn test_expired_threshold_windows_are_dropped() {
        let mut table: ThresholdTable = ThresholdTable::new();
        table
            .load_str("threshold gen_id 1, sig_id 20, type limit, track by_src, count 1, seconds 10\n")
            .unwrap();
        let rules: &[ThresholdRule] = table.get(1, 20).unwrap();
        let dst: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let now: Instant = Instant::now();
        let mut state: ThresholdState = ThresholdState::new();

        for host in 1..=50u8 {
            let src: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, host));
            assert!(state.allow(rules, 1, 20, src, dst, now));
        }
        assert_eq!(state.tracked(), 50);

        // A new source after the windows ran out sweeps the stale ones
        let late: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert!(state.allow(rules, 1, 20, late, dst, now + Duration::from_secs(11)));
        assert_eq!(state.tracked(), 1);
    }

    #[test]
    fn test_threshold_ids_out_of_range_rejected() {
        let mut table: ThresholdTable = ThresholdTable::new();
        assert!(table.load_str("suppress gen_id 1, sig_id 4294967297\n").is_err());
        assert!(table.load_str("suppress gen_id 4294967296, sig_id 1\n").is_err());
        assert!(table.get(1, 1).is_none());
        table.load_str("suppress gen_id 1, sig_id 4294967295\n").unwrap();
        assert!(table.get(1, u32::MAX).is_some());
    }
}
