//! Worker registry
//!
//! The set of packet-processing workers, each with an atomic publish slot for
//! its current [`WorkerContext`], plus the currently published detection
//! context that new detect workers bind to.
//!
//! Lock order: the registry lock is always taken before any per-slot
//! operation. Workers never take the registry lock on the packet path; they
//! only do a lock-free load of their own slot.

use crate::detect::{DetectError, DetectionContext, WorkerContext};
use crate::utils::metrics::CounterRegistry;
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Stage capability: the worker runs detection and owns a worker context
pub const CAP_DETECT: u8 = 0x01;

/// Worker finished its setup
pub const THREAD_INIT_DONE: u8 = 0x01;
/// Worker left its packet loop and will not touch its context again
pub const THREAD_RUNNING_DONE: u8 = 0x02;
/// Worker thread is about to exit
pub const THREAD_CLOSED: u8 = 0x04;

/// One registered worker
#[derive(Debug)]
pub struct WorkerSlot {
    id: usize,
    name: String,
    caps: u8,
    ctx: ArcSwapOption<WorkerContext>,
    flags: AtomicU8,
}

impl WorkerSlot {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_detect(&self) -> bool {
        self.caps & CAP_DETECT != 0
    }

    /// Lock-free load of the current worker context
    pub fn current(&self) -> Option<Arc<WorkerContext>> {
        self.ctx.load_full()
    }

    /// Atomically replace the current worker context, returning the old one
    pub fn publish(&self, ctx: Arc<WorkerContext>) -> Option<Arc<WorkerContext>> {
        self.ctx.swap(Some(ctx))
    }

    /// Atomically empty the slot
    pub fn take(&self) -> Option<Arc<WorkerContext>> {
        self.ctx.swap(None)
    }

    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Arc<WorkerSlot>>,
    /// Currently published detection context
    master: Option<Arc<DetectionContext>>,
    next_id: usize,
}

/// Registry of active workers
#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
}

/// Held registry lock
pub struct RegistryGuard<'a> {
    inner: MutexGuard<'a, RegistryInner>,
}

impl RegistryGuard<'_> {
    /// Registered workers, in registration order
    pub fn slots(&self) -> &[Arc<WorkerSlot>] {
        &self.inner.slots
    }

    pub fn master(&self) -> Option<&Arc<DetectionContext>> {
        self.inner.master.as_ref()
    }

    /// Publish a new detection context for workers registered from now on
    pub fn replace_master(&mut self, ctx: Arc<DetectionContext>) -> Option<Arc<DetectionContext>> {
        self.inner.master.replace(ctx)
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            inner: self.inner.lock(),
        }
    }

    fn push_slot(inner: &mut RegistryInner, name: &str, caps: u8, ctx: Option<Arc<WorkerContext>>) -> Arc<WorkerSlot> {
        let slot: Arc<WorkerSlot> = Arc::new(WorkerSlot {
            id: inner.next_id,
            name: name.to_string(),
            caps,
            ctx: ArcSwapOption::new(ctx),
            flags: AtomicU8::new(0),
        });
        inner.next_id += 1;
        inner.slots.push(Arc::clone(&slot));
        slot
    }

    /// Register a worker without a worker context
    pub fn register_slot(&self, name: &str, caps: u8) -> Arc<WorkerSlot> {
        let mut inner = self.inner.lock();
        Self::push_slot(&mut inner, name, caps, None)
    }

    /// Register a detect worker, binding a fresh worker context to the
    /// currently published detection context
    pub fn register_detect_worker(&self, name: &str, counters: &CounterRegistry) -> Result<Arc<WorkerSlot>, DetectError> {
        let mut inner = self.inner.lock();
        let master: Arc<DetectionContext> = inner.master.clone().ok_or(DetectError::NoContext)?;
        let worker_ctx: WorkerContext = WorkerContext::new(master, counters, name)?;

        let slot: Arc<WorkerSlot> = Self::push_slot(&mut inner, name, CAP_DETECT, Some(Arc::new(worker_ctx)));
        debug!(worker = name, id = slot.id, "Registered detect worker");
        Ok(slot)
    }

    /// Publish a detection context outside of a swap (startup)
    pub fn publish_detection_context(&self, ctx: Arc<DetectionContext>) -> Option<Arc<DetectionContext>> {
        info!(ctx = ctx.id(), "Publishing detection context");
        self.lock().replace_master(ctx)
    }

    /// The currently published detection context generation
    pub fn current_detection_context(&self) -> Option<Arc<DetectionContext>> {
        self.inner.lock().master.clone()
    }

    /// Remove and return the published detection context
    pub fn take_detection_context(&self) -> Option<Arc<DetectionContext>> {
        self.inner.lock().master.take()
    }

    /// Remove a worker from the registry
    pub fn deregister(&self, id: usize) -> Option<Arc<WorkerSlot>> {
        let mut inner = self.inner.lock();
        let pos: usize = inner.slots.iter().position(|s| s.id == id)?;
        Some(inner.slots.remove(pos))
    }

    /// Snapshot of the registered workers
    pub fn slots(&self) -> Vec<Arc<WorkerSlot>> {
        self.inner.lock().slots.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn detect_worker_count(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_detect()).count()
    }
}
