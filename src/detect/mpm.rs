//! Multi-pattern matcher plumbing
//!
//! The search itself is delegated to `aho-corasick`; this module owns the
//! algorithm ids the configuration speaks in, the dense pattern-id store, and the
//! per-thread scratch the matchers write into.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use std::collections::HashMap;
use std::fmt;

/// Pattern matcher algorithms known to the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpmAlgo {
    WuManber,
    B2g,
    B3g,
    B2gc,
    B2gm,
    Ac,
    AcGfbs,
    AcBs,
    Acc,
}

/// Algorithms whose contexts are cheap enough to share one instance across all
/// signature groups. `sgh-mpm-context: auto` resolves to `single` for these.
pub const SINGLE_CONTEXT_MATCHERS: &[MpmAlgo] =
    &[MpmAlgo::Ac, MpmAlgo::Acc, MpmAlgo::AcGfbs, MpmAlgo::AcBs];

impl MpmAlgo {
    pub const DEFAULT: MpmAlgo = MpmAlgo::Ac;

    pub fn name(&self) -> &'static str {
        match self {
            MpmAlgo::WuManber => "wumanber",
            MpmAlgo::B2g => "b2g",
            MpmAlgo::B3g => "b3g",
            MpmAlgo::B2gc => "b2gc",
            MpmAlgo::B2gm => "b2gm",
            MpmAlgo::Ac => "ac",
            MpmAlgo::AcGfbs => "ac-gfbs",
            MpmAlgo::AcBs => "ac-bs",
            MpmAlgo::Acc => "acc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "wumanber" => Some(MpmAlgo::WuManber),
            "b2g" => Some(MpmAlgo::B2g),
            "b3g" => Some(MpmAlgo::B3g),
            "b2gc" => Some(MpmAlgo::B2gc),
            "b2gm" => Some(MpmAlgo::B2gm),
            "ac" => Some(MpmAlgo::Ac),
            "ac-gfbs" => Some(MpmAlgo::AcGfbs),
            "ac-bs" => Some(MpmAlgo::AcBs),
            "acc" => Some(MpmAlgo::Acc),
            _ => None,
        }
    }

    /// Whether one matcher context may be shared by every signature group
    pub fn supports_single_context(&self) -> bool {
        SINGLE_CONTEXT_MATCHERS.contains(self)
    }
}

impl fmt::Display for MpmAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Dense id assignment for content patterns. Content and uri patterns live in
/// separate id ranges, each starting at 0.
#[derive(Debug, Default)]
pub struct PatternIdStore {
    content: HashMap<Vec<u8>, u32>,
    uri: HashMap<Vec<u8>, u32>,
}

impl PatternIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a payload content pattern. Patterns are keyed case-folded since the
    /// prefilter runs case-insensitively; exact case is verified per signature.
    pub fn content_id(&mut self, pattern: &[u8]) -> u32 {
        Self::assign(&mut self.content, pattern)
    }

    /// Id for a uri content pattern
    pub fn uri_id(&mut self, pattern: &[u8]) -> u32 {
        Self::assign(&mut self.uri, pattern)
    }

    fn assign(map: &mut HashMap<Vec<u8>, u32>, pattern: &[u8]) -> u32 {
        let key: Vec<u8> = pattern.to_ascii_lowercase();
        let next: u32 = map.len() as u32;
        *map.entry(key).or_insert(next)
    }

    /// Number of distinct content pattern ids
    pub fn max_content_id(&self) -> u32 {
        self.content.len() as u32
    }

    /// Number of distinct uri pattern ids
    pub fn max_uri_id(&self) -> u32 {
        self.uri.len() as u32
    }

    pub fn reserve(&mut self, additional: usize) -> Result<(), std::collections::TryReserveError> {
        self.content.try_reserve(additional)?;
        self.uri.try_reserve(additional)
    }
}

/// A compiled prefilter over a set of pattern ids
#[derive(Debug)]
pub struct MpmIndex {
    matcher: AhoCorasick,
    /// Automaton pattern index to store pattern id
    pattern_ids: Vec<u32>,
}

impl MpmIndex {
    /// Build a prefilter. Returns `None` when there is nothing to search for.
    pub fn build(patterns: Vec<(u32, Vec<u8>)>) -> Result<Option<Self>, aho_corasick::BuildError> {
        if patterns.is_empty() {
            return Ok(None);
        }

        let (pattern_ids, bytes): (Vec<u32>, Vec<Vec<u8>>) = patterns.into_iter().unzip();
        let matcher: AhoCorasick = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(bytes)?;

        Ok(Some(Self { matcher, pattern_ids }))
    }

    /// Run the prefilter, reporting every pattern id that occurs in `haystack`
    pub fn scan<F: FnMut(u32)>(&self, haystack: &[u8], mut on_match: F) {
        for mat in self.matcher.find_overlapping_iter(haystack) {
            on_match(self.pattern_ids[mat.pattern().as_usize()]);
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_ids.len()
    }
}

/// Per-thread matcher scratch: a hit counter per pattern id
#[derive(Debug)]
pub struct MpmThreadCtx {
    algo: MpmAlgo,
    hits: Vec<u32>,
    total_matches: u64,
}

impl MpmThreadCtx {
    /// Size the scratch for pattern ids `0..max_id`
    pub fn prepare(algo: MpmAlgo, max_id: u32) -> Result<Self, std::collections::TryReserveError> {
        let mut hits: Vec<u32> = Vec::new();
        hits.try_reserve_exact(max_id as usize)?;
        hits.resize(max_id as usize, 0);

        Ok(Self {
            algo,
            hits,
            total_matches: 0,
        })
    }

    pub fn record(&mut self, pattern_id: u32) {
        if let Some(slot) = self.hits.get_mut(pattern_id as usize) {
            *slot = slot.saturating_add(1);
            self.total_matches += 1;
        }
    }

    pub fn hit(&self, pattern_id: u32) -> bool {
        self.hits.get(pattern_id as usize).is_some_and(|&h| h > 0)
    }

    pub fn reset(&mut self) {
        self.hits.iter_mut().for_each(|h| *h = 0);
    }

    pub fn capacity(&self) -> usize {
        self.hits.len()
    }

    pub fn total_matches(&self) -> u64 {
        self.total_matches
    }

    pub fn algo(&self) -> MpmAlgo {
        self.algo
    }
}

/// Deduplicated queue of pattern ids hit while inspecting one unit of work
#[derive(Debug)]
pub struct PatternMatchQueue {
    ids: Vec<u32>,
    seen: Vec<bool>,
}

impl PatternMatchQueue {
    pub fn setup(max_pattern_id: u32) -> Result<Self, std::collections::TryReserveError> {
        let mut seen: Vec<bool> = Vec::new();
        seen.try_reserve_exact(max_pattern_id as usize)?;
        seen.resize(max_pattern_id as usize, false);

        Ok(Self {
            ids: Vec::new(),
            seen,
        })
    }

    pub fn append(&mut self, pattern_id: u32) {
        if let Some(seen) = self.seen.get_mut(pattern_id as usize) {
            if !*seen {
                *seen = true;
                self.ids.push(pattern_id);
            }
        }
    }

    pub fn contains(&self, pattern_id: u32) -> bool {
        self.seen.get(pattern_id as usize).copied().unwrap_or(false)
    }

    pub fn reset(&mut self) {
        for id in self.ids.drain(..) {
            self.seen[id as usize] = false;
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
