//! Worker contexts: per-thread inspection scratch bound to one detection context
//!
//! Exactly one worker uses a given [`WorkerContext`]. The scratch sits behind a
//! mutex only so the context can be shared through the registry's publish
//! slot; the owning worker is the only one that ever takes it.

use crate::config::resolver::INSPECTION_RECURSION_UNLIMITED;
use crate::core::packet::NorxPacket;
use crate::detect::keyword::KeywordThreadCtx;
use crate::detect::mpm::{MpmThreadCtx, PatternMatchQueue};
use crate::detect::signature::{contains_subslice, PcreThreadCtx, Signature, Transport};
use crate::detect::{DetectError, DetectionContext};
use crate::rules::support::ThresholdState;
use crate::rules::{ContentBuffer, RuleAction};
use crate::utils::metrics::{CounterHandle, CounterKind, CounterRegistry};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Scratch for signatures decided by header fields alone
#[derive(Debug)]
pub struct IpOnlyThreadCtx {
    matched: Vec<bool>,
}

impl IpOnlyThreadCtx {
    fn new(sig_count: usize) -> Result<Self, DetectError> {
        let mut matched: Vec<bool> = Vec::new();
        matched.try_reserve_exact(sig_count)?;
        matched.resize(sig_count, false);
        Ok(Self { matched })
    }

    fn reset(&mut self) {
        self.matched.iter_mut().for_each(|m| *m = false);
    }

    pub fn matched(&self) -> usize {
        self.matched.iter().filter(|m| **m).count()
    }
}

/// Alert produced by one inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub gid: u32,
    pub sid: u32,
    pub rev: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub msg: String,
}

impl From<&Signature> for Alert {
    fn from(sig: &Signature) -> Self {
        Self {
            gid: sig.gid,
            sid: sig.sid,
            rev: sig.rev,
            priority: sig.priority,
            action: sig.action,
            msg: sig.msg.clone(),
        }
    }
}

struct WorkerScratch {
    /// Payload content matcher scratch
    mtc: MpmThreadCtx,
    /// Stream segment matcher scratch
    mtcs: MpmThreadCtx,
    /// Uri matcher scratch
    mtcu: MpmThreadCtx,
    pmq: PatternMatchQueue,
    uri_pmq: PatternMatchQueue,
    /// Staged match queues, one per stream segment slot
    smsg_pmq: Vec<PatternMatchQueue>,
    io_ctx: IpOnlyThreadCtx,
    /// Signatures already evaluated for the current packet
    sig_evaluated: Vec<bool>,
    match_array: Vec<bool>,
    /// Values extracted by `byte_extract`, indexed by local id
    bj_values: Vec<u64>,
    keyword_ctxs: Vec<Option<KeywordThreadCtx>>,
    threshold_state: ThresholdState,
}

fn zeroed<T: Clone>(len: usize, value: T) -> Result<Vec<T>, DetectError> {
    let mut v: Vec<T> = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);
    Ok(v)
}

pub struct WorkerContext {
    detect_ctx: Arc<DetectionContext>,
    scratch: Mutex<WorkerScratch>,
    counter_alerts: CounterHandle,
    so_far_used: AtomicBool,
    owner: String,
}

impl WorkerContext {
    /// Build a worker context bound to `detect_ctx`. Keyword contexts are set
    /// up in slot order; the first failure aborts and tears down the slots
    /// already set up.
    pub fn new(detect_ctx: Arc<DetectionContext>, counters: &CounterRegistry, owner: &str) -> Result<Self, DetectError> {
        let algo = detect_ctx.config().mpm_matcher;
        let max_content_id: u32 = detect_ctx.max_content_id();
        let max_uri_id: u32 = detect_ctx.max_uri_id();

        let slots: usize = detect_ctx.config().staged_queue_slots;
        let mut smsg_pmq: Vec<PatternMatchQueue> = Vec::new();
        smsg_pmq.try_reserve_exact(slots)?;
        for _ in 0..slots {
            smsg_pmq.push(PatternMatchQueue::setup(max_content_id)?);
        }

        let signum: usize = detect_ctx.signature_count();
        let (sig_evaluated, match_array) = if signum > 0 {
            (zeroed(signum, false)?, zeroed(signum, false)?)
        } else {
            (Vec::new(), Vec::new())
        };

        let mut keyword_ctxs: Vec<Option<KeywordThreadCtx>> = Vec::new();
        keyword_ctxs.try_reserve_exact(detect_ctx.keywords().len())?;
        keyword_ctxs.resize_with(detect_ctx.keywords().len(), || None);

        let scratch: WorkerScratch = WorkerScratch {
            mtc: MpmThreadCtx::prepare(algo, max_content_id)?,
            mtcs: MpmThreadCtx::prepare(algo, max_content_id)?,
            mtcu: MpmThreadCtx::prepare(algo, max_uri_id)?,
            pmq: PatternMatchQueue::setup(max_content_id)?,
            uri_pmq: PatternMatchQueue::setup(max_uri_id)?,
            smsg_pmq,
            io_ctx: IpOnlyThreadCtx::new(detect_ctx.ip_only_signatures().len())?,
            sig_evaluated,
            match_array,
            bj_values: zeroed(detect_ctx.byte_extract_max_local_id() + 1, 0u64)?,
            keyword_ctxs,
            threshold_state: ThresholdState::new(),
        };

        let counter_alerts: CounterHandle = counters.register_counter("detect.alert", CounterKind::Plain, owner);

        let mut worker_ctx: WorkerContext = Self {
            detect_ctx,
            scratch: Mutex::new(scratch),
            counter_alerts,
            so_far_used: AtomicBool::new(false),
            owner: owner.to_string(),
        };
        worker_ctx.init_keywords()?;

        debug!("{}", worker_ctx.describe());
        Ok(worker_ctx)
    }

    fn init_keywords(&mut self) -> Result<(), DetectError> {
        let scratch: &mut WorkerScratch = self.scratch.get_mut();

        for registration in self.detect_ctx.keywords().iter() {
            match registration.keyword.init_thread_ctx() {
                Some(ctx) => scratch.keyword_ctxs[registration.slot] = Some(ctx),
                None => {
                    warn!(
                        owner = %self.owner,
                        slot = registration.slot,
                        "Keyword \"{}\" failed to set up its thread context",
                        registration.name
                    );
                    return Err(DetectError::KeywordInit {
                        name: registration.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Detection context this worker context is bound to
    pub fn detect_ctx(&self) -> &Arc<DetectionContext> {
        &self.detect_ctx
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether a worker has inspected at least one packet with this context
    pub fn is_used(&self) -> bool {
        self.so_far_used.load(Ordering::Acquire)
    }

    /// Run `f` on the keyword context in `slot`. `None` when the slot is out of
    /// range or was never set up.
    pub fn with_keyword_ctx<R>(&self, slot: usize, f: impl FnOnce(&mut (dyn Any + Send)) -> R) -> Option<R> {
        let mut scratch = self.scratch.lock();
        let ctx: &mut KeywordThreadCtx = scratch.keyword_ctxs.get_mut(slot)?.as_mut()?;
        Some(f(&mut **ctx))
    }

    /// Number of keyword slots held
    pub fn keyword_slots(&self) -> usize {
        self.scratch.lock().keyword_ctxs.len()
    }

    /// Length of the evaluated-signature bitmap
    pub fn sig_bitmap_len(&self) -> usize {
        self.scratch.lock().sig_evaluated.len()
    }

    /// Last value extracted for a `byte_extract` local id
    pub fn byte_extract_value(&self, local_id: usize) -> Option<u64> {
        self.scratch.lock().bj_values.get(local_id).copied()
    }

    /// One-line summary of the scratch sizes
    pub fn describe(&self) -> String {
        let scratch = self.scratch.lock();
        format!(
            "Worker context for {} on detection context {}: mpm {} content ids {} (stream {}), uri ids {}, \
             staged queues {}, signatures {}, ip-only {}, keyword slots {}",
            self.owner,
            self.detect_ctx.id(),
            scratch.mtc.algo(),
            scratch.mtc.capacity(),
            scratch.mtcs.capacity(),
            scratch.mtcu.capacity(),
            scratch.smsg_pmq.len(),
            scratch.sig_evaluated.len(),
            scratch.io_ctx.matched.len(),
            scratch.keyword_ctxs.len(),
        )
    }

    /// Inspect one packet and return the alerts it raised
    pub fn inspect(&self, packet: &NorxPacket) -> Vec<Alert> {
        self.so_far_used.store(true, Ordering::Release);

        let ctx: &DetectionContext = &self.detect_ctx;
        let mut guard = self.scratch.lock();
        let WorkerScratch {
            mtc,
            mtcs,
            mtcu,
            pmq,
            uri_pmq,
            smsg_pmq,
            io_ctx,
            sig_evaluated,
            match_array,
            bj_values,
            keyword_ctxs,
            threshold_state,
        } = &mut *guard;

        if packet.pseudo {
            return Vec::new();
        }

        pmq.reset();
        uri_pmq.reset();
        mtc.reset();
        mtcs.reset();
        mtcu.reset();
        io_ctx.reset();
        sig_evaluated.iter_mut().for_each(|e| *e = false);
        match_array.iter_mut().for_each(|m| *m = false);

        let transport: Transport = Transport::from(packet.protocol);

        // Prefilter
        let (payload_queue, payload_mtc): (&mut PatternMatchQueue, &mut MpmThreadCtx) = match packet.stream_slot {
            Some(slot) if !smsg_pmq.is_empty() => {
                let idx: usize = slot % smsg_pmq.len();
                smsg_pmq[idx].reset();
                (&mut smsg_pmq[idx], mtcs)
            }
            _ => (pmq, mtc),
        };
        if let Some(index) = ctx.payload_mpm(transport) {
            index.scan(&packet.payload, |id: u32| {
                payload_mtc.record(id);
                payload_queue.append(id);
            });
        }
        if let (Some(index), Some(uri)) = (ctx.uri_mpm(), packet.uri.as_deref()) {
            index.scan(uri, |id: u32| {
                mtcu.record(id);
                uri_pmq.append(id);
            });
        }

        // IP-only signatures
        for (i, num) in ctx.ip_only_signatures().iter().enumerate() {
            if let Some(sig) = ctx.signature(*num) {
                if sig.header_matches(packet) {
                    io_ctx.matched[i] = true;
                    match_array[*num as usize] = true;
                }
                sig_evaluated[*num as usize] = true;
            }
        }

        let mut pcre_ctx: Option<&mut PcreThreadCtx> = ctx
            .pcre_slot()
            .and_then(|slot| keyword_ctxs.get_mut(slot))
            .and_then(Option::as_mut)
            .and_then(|c| (**c).downcast_mut::<PcreThreadCtx>());

        let limit: i32 = ctx.config().inspection_recursion_limit;
        let within_limit = |steps: i64| -> bool { limit == INSPECTION_RECURSION_UNLIMITED || steps <= i64::from(limit) };

        'sigs: for num in ctx.candidates(transport, packet.dst_port) {
            let idx: usize = num as usize;
            if sig_evaluated[idx] {
                continue;
            }
            sig_evaluated[idx] = true;

            let Some(sig) = ctx.signature(num) else {
                continue;
            };
            if !sig.header_matches(packet) {
                continue;
            }

            // The limit bounds the checks made for one signature
            let mut steps: i64 = 0;
            for content in &sig.contents {
                steps += 1;
                if !within_limit(steps) {
                    trace!(sid = sig.sid, "Inspection recursion limit reached");
                    continue 'sigs;
                }
                let (buffer, queue): (Option<&[u8]>, &PatternMatchQueue) = match content.buffer {
                    ContentBuffer::Payload => (Some(packet.payload.as_slice()), &*payload_queue),
                    ContentBuffer::Uri => (packet.uri.as_deref(), &*uri_pmq),
                };
                let Some(buffer) = buffer else {
                    continue 'sigs;
                };
                if !queue.contains(content.pattern_id) {
                    continue 'sigs;
                }
                if !content.nocase && !contains_subslice(buffer, &content.pattern) {
                    continue 'sigs;
                }
            }

            for (i, pcre) in sig.pcres.iter().enumerate() {
                steps += 1;
                if !within_limit(steps) {
                    trace!(sid = sig.sid, "Inspection recursion limit reached");
                    continue 'sigs;
                }
                let Some(buffer) = (match pcre.buffer {
                    ContentBuffer::Payload => Some(packet.payload.as_slice()),
                    ContentBuffer::Uri => packet.uri.as_deref(),
                }) else {
                    continue 'sigs;
                };
                let matched: bool = match pcre_ctx.as_deref_mut() {
                    Some(scratch) => scratch.is_match(num, i, pcre, buffer),
                    None => pcre.regex.is_match(buffer),
                };
                if !matched {
                    continue 'sigs;
                }
            }

            for (local_id, extract) in sig.byte_extracts.iter().enumerate() {
                let Some(bytes) = extract
                    .offset
                    .checked_add(extract.nbytes)
                    .and_then(|end| packet.payload.get(extract.offset..end))
                else {
                    continue 'sigs;
                };
                bj_values[local_id] = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            }

            match_array[idx] = true;
        }

        // Signatures are numbered in priority order, so alerts come out sorted
        let now: Instant = Instant::now();
        let mut alerts: Vec<Alert> = Vec::new();
        for (idx, matched) in match_array.iter().enumerate() {
            if !*matched {
                continue;
            }
            let Some(sig) = ctx.signature(idx as u32) else {
                continue;
            };
            if let Some(rules) = ctx.thresholds().get(sig.gid, sig.sid) {
                if !threshold_state.allow(rules, sig.gid, sig.sid, packet.src_ip, packet.dst_ip, now) {
                    continue;
                }
            }
            self.counter_alerts.increment();
            alerts.push(Alert::from(sig));
        }

        alerts
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("owner", &self.owner)
            .field("detect_ctx", &self.detect_ctx.id())
            .field("used", &self.is_used())
            .finish()
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        let scratch: &mut WorkerScratch = self.scratch.get_mut();
        let mut freed: usize = 0;

        for (slot, ctx) in scratch.keyword_ctxs.iter_mut().enumerate() {
            let Some(ctx) = ctx.take() else {
                continue;
            };
            if let Some(registration) = self.detect_ctx.keywords().get(slot) {
                registration.keyword.free_thread_ctx(ctx);
                freed += 1;
            }
        }

        debug!(
            owner = %self.owner,
            ctx = self.detect_ctx.id(),
            keywords_freed = freed,
            "Freeing worker context"
        );
    }
}
