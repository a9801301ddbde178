//! Detection context: the compiled, versioned ruleset
//!
//! A context is filled through `&mut` while it is being built, then shared as
//! `Arc<DetectionContext>` by every worker context bound to it. Once shared it
//! is never mutated; a reload always builds a new one.

use crate::config::{DetectConfig, SghMpmContext};
use crate::detect::keyword::{KeywordList, ThreadKeyword};
use crate::detect::mpm::{MpmIndex, PatternIdStore};
use crate::detect::signature::{PcreKeyword, SigContent, Signature, Transport};
use crate::detect::DetectError;
use crate::rules::support::{ClassificationTable, ReferenceTable, ThresholdTable, DEFAULT_PRIORITY};
use crate::rules::{ContentBuffer, Rule, RuleOption};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Initial capacity reserved for each index
const INITIAL_INDEX_CAPACITY: usize = 64;

/// Signature group key: transport and the destination port, `None` for the
/// catch-all group
pub type GroupKey = (Transport, Option<u16>);

/// What happened to a rule handed to [`DetectionContext::add_rule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A signature with the same gid/sid and a lower revision was replaced
    Replaced,
    /// Dropped in favour of an existing signature with an equal or higher revision
    Duplicate,
}

#[derive(Debug, Default)]
struct MpmIndices {
    shared: Option<MpmIndex>,
    per_transport: HashMap<Transport, MpmIndex>,
    uri: Option<MpmIndex>,
}

#[derive(Debug)]
pub struct DetectionContext {
    id: u32,
    config: DetectConfig,
    signatures: Vec<Signature>,
    /// (gid, sid) to index in `signatures`
    sig_hash: HashMap<(u32, u32), usize>,
    groups: HashMap<GroupKey, Vec<u32>>,
    ip_only: Vec<u32>,
    mpm: MpmIndices,
    port_counts: HashMap<u16, u32>,
    thresholds: ThresholdTable,
    classifications: ClassificationTable,
    references: ReferenceTable,
    variable_names: HashMap<String, u32>,
    pattern_ids: PatternIdStore,
    keywords: KeywordList,
    pcre_slot: Option<usize>,
    byte_extract_max_local_id: usize,
    max_sig_id: u32,
    built: bool,
}

impl DetectionContext {
    /// Create an empty context for `config`
    pub fn new(config: DetectConfig) -> Result<Self, DetectError> {
        let mut sig_hash: HashMap<(u32, u32), usize> = HashMap::new();
        sig_hash.try_reserve(INITIAL_INDEX_CAPACITY)?;
        let mut groups: HashMap<GroupKey, Vec<u32>> = HashMap::new();
        groups.try_reserve(INITIAL_INDEX_CAPACITY)?;
        let mut port_counts: HashMap<u16, u32> = HashMap::new();
        port_counts.try_reserve(INITIAL_INDEX_CAPACITY)?;
        let mut variable_names: HashMap<String, u32> = HashMap::new();
        variable_names.try_reserve(INITIAL_INDEX_CAPACITY)?;
        let mut pattern_ids: PatternIdStore = PatternIdStore::new();
        pattern_ids.reserve(INITIAL_INDEX_CAPACITY)?;
        let mut per_transport: HashMap<Transport, MpmIndex> = HashMap::new();
        per_transport.try_reserve(Transport::ALL.len())?;

        let id: u32 = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            profile = %config.profile,
            mpm = %config.mpm_matcher,
            "Detection context created"
        );

        Ok(Self {
            id,
            config,
            signatures: Vec::new(),
            sig_hash,
            groups,
            ip_only: Vec::new(),
            mpm: MpmIndices {
                shared: None,
                per_transport,
                uri: None,
            },
            port_counts,
            thresholds: ThresholdTable::new(),
            classifications: ClassificationTable::new(),
            references: ReferenceTable::new(),
            variable_names,
            pattern_ids,
            keywords: KeywordList::new(),
            pcre_slot: None,
            byte_extract_max_local_id: 0,
            max_sig_id: 0,
            built: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Register a thread-local keyword context and return its slot id
    pub fn register_keyword(&mut self, name: &str, keyword: Arc<dyn ThreadKeyword>) -> Result<usize, DetectError> {
        let slot: usize = self.keywords.register(name, keyword)?;
        debug!(ctx = self.id, slot, "Registered thread keyword {}", name);
        Ok(slot)
    }

    pub fn keywords(&self) -> &KeywordList {
        &self.keywords
    }

    /// Slot of the `pcre` keyword, once a signature needed it
    pub fn pcre_slot(&self) -> Option<usize> {
        self.pcre_slot
    }

    pub fn classifications_mut(&mut self) -> &mut ClassificationTable {
        &mut self.classifications
    }

    pub fn references_mut(&mut self) -> &mut ReferenceTable {
        &mut self.references
    }

    pub fn thresholds_mut(&mut self) -> &mut ThresholdTable {
        &mut self.thresholds
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// Compile a parsed rule into a signature
    pub fn add_rule(&mut self, rule: Rule) -> Result<AddOutcome, DetectError> {
        let gid: u32 = rule.gid();
        let sid: u32 = rule.sid().unwrap_or_default();
        let rev: u32 = rule.rev();

        let existing: Option<usize> = self.sig_hash.get(&(gid, sid)).copied();
        if let Some(idx) = existing {
            let old_rev: u32 = self.signatures[idx].rev;
            if rev <= old_rev {
                warn!(
                    "Duplicate signature {}:{} (rev {} <= loaded rev {}), dropping",
                    gid, sid, rev, old_rev
                );
                return Ok(AddOutcome::Duplicate);
            }
            info!("Signature {}:{} rev {} replaces rev {}", gid, sid, rev, old_rev);
        }

        let signature: Signature = self.compile(rule, gid, sid, rev)?;

        match existing {
            Some(idx) => {
                self.signatures[idx] = signature;
                Ok(AddOutcome::Replaced)
            }
            None => {
                self.signatures.try_reserve(1)?;
                self.sig_hash.try_reserve(1)?;
                self.sig_hash.insert((gid, sid), self.signatures.len());
                self.signatures.push(signature);
                Ok(AddOutcome::Added)
            }
        }
    }

    fn compile(&mut self, rule: Rule, gid: u32, sid: u32, rev: u32) -> Result<Signature, DetectError> {
        let class: Option<String> = rule.classtype().map(str::to_string);
        let class_priority: Option<u32> = match class.as_deref() {
            Some(name) => match self.classifications.get(name) {
                Some(classification) => Some(classification.priority),
                None => {
                    warn!("Signature {}:{} uses unknown classtype \"{}\"", gid, sid, name);
                    None
                }
            },
            None => None,
        };
        let priority: u32 = rule.priority().or(class_priority).unwrap_or(DEFAULT_PRIORITY);

        let mut signature: Signature = Signature {
            num: self.signatures.len() as u32,
            gid,
            sid,
            rev,
            msg: rule.msg().unwrap_or_default().to_string(),
            action: rule.header.action,
            priority,
            class,
            references: Vec::new(),
            header: rule.header,
            contents: Vec::new(),
            pcres: Vec::new(),
            byte_extracts: Vec::new(),
            flowbit_ids: Vec::new(),
        };

        for option in rule.options {
            match option {
                RuleOption::Content(content) => {
                    let pattern_id: u32 = match content.buffer {
                        ContentBuffer::Payload => self.pattern_ids.content_id(&content.pattern),
                        ContentBuffer::Uri => self.pattern_ids.uri_id(&content.pattern),
                    };
                    signature.contents.push(SigContent {
                        pattern_id,
                        pattern: content.pattern,
                        nocase: content.nocase,
                        buffer: content.buffer,
                    });
                }
                RuleOption::Pcre(pcre) => {
                    if self.pcre_slot.is_none() {
                        self.pcre_slot = Some(self.register_keyword("pcre", Arc::new(PcreKeyword))?);
                    }
                    signature.pcres.push(pcre);
                }
                RuleOption::ByteExtract(extract) => signature.byte_extracts.push(extract),
                RuleOption::Flowbits(_, Some(name)) => {
                    let next: u32 = self.variable_names.len() as u32;
                    let id: u32 = *self.variable_names.entry(name).or_insert(next);
                    signature.flowbit_ids.push(id);
                }
                RuleOption::Reference(system, id) => {
                    let reference: String = self
                        .references
                        .resolve(&system, &id)
                        .unwrap_or_else(|| format!("{},{}", system, id));
                    signature.references.push(reference);
                }
                _ => {}
            }
        }

        if let Some(last) = signature.byte_extracts.len().checked_sub(1) {
            self.byte_extract_max_local_id = self.byte_extract_max_local_id.max(last);
        }

        Ok(signature)
    }

    /// Reset internal signature numbering
    pub fn reset_max_sig_id(&mut self) {
        self.max_sig_id = 0;
    }

    /// Order signatures, number them densely and build the group and
    /// pattern-matcher indices
    pub fn build_signature_groups(&mut self) -> Result<(), DetectError> {
        self.signatures
            .sort_by_key(|s: &Signature| (s.priority, s.gid, s.sid));

        self.reset_max_sig_id();
        self.sig_hash.clear();
        for (idx, signature) in self.signatures.iter_mut().enumerate() {
            signature.num = self.max_sig_id;
            self.max_sig_id += 1;
            self.sig_hash.insert((signature.gid, signature.sid), idx);
        }

        self.groups.clear();
        self.port_counts.clear();
        self.ip_only.clear();

        for signature in &self.signatures {
            if let Some(port) = signature.group_port() {
                *self.port_counts.entry(port).or_insert(0) += 1;
            }
        }

        // Busiest ports get their own group, up to the configured ceiling;
        // everything else folds into the catch-all group of its transport.
        let mut ranked: Vec<(u16, u32)> = self.port_counts.iter().map(|(p, c)| (*p, *c)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let ceiling: usize = usize::from(self.config.limits.toserver_dp);
        let grouped_ports: Vec<u16> = ranked.into_iter().take(ceiling).map(|(p, _)| p).collect();

        for signature in &self.signatures {
            if signature.is_ip_only() {
                self.ip_only.push(signature.num);
                continue;
            }
            let port: Option<u16> = signature.group_port().filter(|p| grouped_ports.contains(p));
            for transport in signature.transports() {
                self.groups.entry((*transport, port)).or_default().push(signature.num);
            }
        }

        self.build_mpm_indices()?;
        self.built = true;

        info!(
            ctx = self.id,
            signatures = self.signatures.len(),
            groups = self.groups.len(),
            ip_only = self.ip_only.len(),
            port_groups = grouped_ports.len(),
            "Signature groups built"
        );
        Ok(())
    }

    fn build_mpm_indices(&mut self) -> Result<(), DetectError> {
        let mut shared: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut per_transport: HashMap<Transport, BTreeMap<u32, Vec<u8>>> = HashMap::new();
        let mut uri: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        for signature in &self.signatures {
            for content in &signature.contents {
                match content.buffer {
                    ContentBuffer::Uri => {
                        uri.entry(content.pattern_id).or_insert_with(|| content.pattern.clone());
                    }
                    ContentBuffer::Payload => match self.config.sgh_mpm_context {
                        SghMpmContext::Single => {
                            shared.entry(content.pattern_id).or_insert_with(|| content.pattern.clone());
                        }
                        SghMpmContext::Full => {
                            for transport in signature.transports() {
                                per_transport
                                    .entry(*transport)
                                    .or_default()
                                    .entry(content.pattern_id)
                                    .or_insert_with(|| content.pattern.clone());
                            }
                        }
                    },
                }
            }
        }

        self.mpm.shared = MpmIndex::build(shared.into_iter().collect())?;
        self.mpm.per_transport.clear();
        for (transport, patterns) in per_transport {
            if let Some(index) = MpmIndex::build(patterns.into_iter().collect())? {
                self.mpm.per_transport.insert(transport, index);
            }
        }
        self.mpm.uri = MpmIndex::build(uri.into_iter().collect())?;

        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Live signature count
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn signature(&self, num: u32) -> Option<&Signature> {
        self.signatures.get(num as usize)
    }

    pub fn signature_by_sid(&self, gid: u32, sid: u32) -> Option<&Signature> {
        self.sig_hash.get(&(gid, sid)).and_then(|idx| self.signatures.get(*idx))
    }

    /// Candidate signatures for a packet: its port group, then the catch-all group
    pub fn candidates(&self, transport: Transport, dst_port: Option<u16>) -> impl Iterator<Item = u32> + '_ {
        let port_group: &[u32] = dst_port
            .and_then(|p| self.groups.get(&(transport, Some(p))))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let catch_all: &[u32] = self
            .groups
            .get(&(transport, None))
            .map(Vec::as_slice)
            .unwrap_or_default();
        port_group.iter().chain(catch_all.iter()).copied()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn ip_only_signatures(&self) -> &[u32] {
        &self.ip_only
    }

    /// Payload prefilter for a transport
    pub fn payload_mpm(&self, transport: Transport) -> Option<&MpmIndex> {
        match self.config.sgh_mpm_context {
            SghMpmContext::Single => self.mpm.shared.as_ref(),
            SghMpmContext::Full => self.mpm.per_transport.get(&transport),
        }
    }

    pub fn uri_mpm(&self) -> Option<&MpmIndex> {
        self.mpm.uri.as_ref()
    }

    /// Number of payload matcher contexts built
    pub fn mpm_context_count(&self) -> usize {
        usize::from(self.mpm.shared.is_some()) + self.mpm.per_transport.len()
    }

    pub fn max_content_id(&self) -> u32 {
        self.pattern_ids.max_content_id()
    }

    pub fn max_uri_id(&self) -> u32 {
        self.pattern_ids.max_uri_id()
    }

    pub fn byte_extract_max_local_id(&self) -> usize {
        self.byte_extract_max_local_id
    }

    pub fn variable_id(&self, name: &str) -> Option<u32> {
        self.variable_names.get(name).copied()
    }

    pub fn classifications(&self) -> &ClassificationTable {
        &self.classifications
    }

    pub fn references(&self) -> &ReferenceTable {
        &self.references
    }

    /// Release a context. Returns `true` when this call dropped the last
    /// reference; `None` is a no-op.
    pub fn release(ctx: Option<Arc<Self>>) -> bool {
        let Some(ctx) = ctx else {
            return false;
        };
        let id: u32 = ctx.id;

        match Arc::try_unwrap(ctx) {
            Ok(ctx) => {
                drop(ctx);
                true
            }
            Err(shared) => {
                warn!(
                    ctx = id,
                    refs = Arc::strong_count(&shared) - 1,
                    "Detection context still referenced at release"
                );
                false
            }
        }
    }
}

impl Drop for DetectionContext {
    fn drop(&mut self) {
        debug!(ctx = self.id, signatures = self.signatures.len(), "Freeing detection context");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupLimits;

    fn ctx_with(config: DetectConfig, rules: &[&str]) -> DetectionContext {
        let mut ctx: DetectionContext = DetectionContext::new(config).unwrap();
        for rule in rules {
            ctx.add_rule(Rule::new(rule).unwrap()).unwrap();
        }
        ctx.build_signature_groups().unwrap();
        ctx
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        let b: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        assert!(a.id() >= 1);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_duplicate_sid_keeps_highest_rev() {
        let mut ctx: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        let r1 = Rule::new("alert tcp any any -> any any (msg:\"v2\"; sid:10; rev:2;)").unwrap();
        let r2 = Rule::new("alert tcp any any -> any any (msg:\"v1\"; sid:10; rev:1;)").unwrap();
        let r3 = Rule::new("alert tcp any any -> any any (msg:\"v3\"; sid:10; rev:3;)").unwrap();

        assert_eq!(ctx.add_rule(r1).unwrap(), AddOutcome::Added);
        assert_eq!(ctx.add_rule(r2).unwrap(), AddOutcome::Duplicate);
        assert_eq!(ctx.add_rule(r3).unwrap(), AddOutcome::Replaced);
        assert_eq!(ctx.signature_count(), 1);
        assert_eq!(ctx.signature_by_sid(1, 10).map(|s| s.msg.as_str()), Some("v3"));
    }

    #[test]
    fn test_groups_fold_ports_beyond_ceiling() {
        let mut config: DetectConfig = DetectConfig::default();
        config.limits = GroupLimits {
            toserver_dp: 1,
            ..GroupLimits::LOW
        };
        let ctx: DetectionContext = ctx_with(
            config,
            &[
                "alert tcp any any -> any 80 (content:\"a\"; sid:1;)",
                "alert tcp any any -> any 80 (content:\"b\"; sid:2;)",
                "alert tcp any any -> any 443 (content:\"c\"; sid:3;)",
                "alert ip any any -> any any (sid:4;)",
            ],
        );

        let port80: Vec<u32> = ctx.candidates(Transport::Tcp, Some(80)).collect();
        assert_eq!(port80.len(), 3);
        let port443: Vec<u32> = ctx.candidates(Transport::Tcp, Some(443)).collect();
        assert_eq!(port443.len(), 1);
        assert_eq!(ctx.ip_only_signatures().len(), 1);
        assert_eq!(ctx.candidates(Transport::Udp, Some(80)).count(), 0);
    }

    #[test]
    fn test_build_orders_and_numbers_signatures() {
        let mut ctx: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        ctx.classifications_mut()
            .load_str("config classification: trojan-activity,Trojan,1\n")
            .unwrap();
        for rule in [
            "alert tcp any any -> any any (content:\"x\"; sid:30;)",
            "alert tcp any any -> any any (content:\"y\"; classtype:trojan-activity; sid:20;)",
            "alert tcp any any -> any any (content:\"z\"; priority:2; sid:10;)",
        ] {
            ctx.add_rule(Rule::new(rule).unwrap()).unwrap();
        }
        ctx.build_signature_groups().unwrap();

        let order: Vec<(u32, u32)> = ctx.signatures().iter().map(|s| (s.num, s.sid)).collect();
        assert_eq!(order, vec![(0, 20), (1, 10), (2, 30)]);
        assert_eq!(ctx.signature_by_sid(1, 30).map(|s| s.num), Some(2));
        assert!(ctx.is_built());
    }

    #[test]
    fn test_mpm_sharing_modes() {
        let rules: [&str; 3] = [
            "alert tcp any any -> any any (content:\"GET\"; sid:1;)",
            "alert udp any any -> any any (content:\"dns\"; sid:2;)",
            "alert http any any -> any any (uricontent:\"/admin\"; pcre:\"/adm/i\"; byte_extract:2,0,len; sid:3;)",
        ];

        let mut single_cfg: DetectConfig = DetectConfig::default();
        single_cfg.sgh_mpm_context = SghMpmContext::Single;
        let single: DetectionContext = ctx_with(single_cfg, &rules);
        assert_eq!(single.mpm_context_count(), 1);
        assert!(single.payload_mpm(Transport::Icmp).is_some());

        let mut full_cfg: DetectConfig = DetectConfig::default();
        full_cfg.sgh_mpm_context = SghMpmContext::Full;
        let full: DetectionContext = ctx_with(full_cfg, &rules);
        assert_eq!(full.mpm_context_count(), 2);
        assert!(full.payload_mpm(Transport::Icmp).is_none());
        assert_eq!(full.uri_mpm().map(MpmIndex::pattern_count), Some(1));

        assert_eq!(full.max_content_id(), 2);
        assert_eq!(full.max_uri_id(), 1);
        assert_eq!(full.pcre_slot(), Some(0));
        assert_eq!(full.keywords().len(), 1);
        assert_eq!(full.byte_extract_max_local_id(), 0);
    }

    #[test]
    fn test_release_is_idempotent_and_respects_sharing() {
        assert!(!DetectionContext::release(None));

        let ctx: Arc<DetectionContext> = Arc::new(DetectionContext::new(DetectConfig::default()).unwrap());
        let held: Arc<DetectionContext> = Arc::clone(&ctx);
        assert!(!DetectionContext::release(Some(ctx)));
        assert!(DetectionContext::release(Some(held)));
    }
}
