//! Live rule swap
//!
//! Replaces the detection context of every detect worker without stopping
//! packet processing. A swap runs in phases:
//!
//! 1. rebuild a complete detection context from freshly loaded configuration
//! 2. enumerate the detect workers under the registry lock
//! 3. build one replacement worker context per worker, all before publishing
//! 4. publish every replacement and the new detection context
//! 5. wait for each worker to confirm it has used its replacement
//! 6. on shutdown, wait instead for unconfirmed workers to leave their loop
//! 7. reclaim the old worker contexts and the old detection context
//!
//! If any replacement fails to build, nothing is published and workers keep
//! running on the old generation.

pub mod rebuild;
pub mod service;

use crate::config::{ConfigError, ConfigSource, ConfTree, LiveSwapConfig};
use crate::core::control::EngineControl;
use crate::core::registry::{WorkerRegistry, WorkerSlot, THREAD_RUNNING_DONE};
use crate::detect::{DetectError, DetectionContext, WorkerContext};
use crate::rules::RulesetLoader;
use crate::utils::metrics::CounterRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use rebuild::{build_generation, Generation};
pub use service::{LiveSwapService, ReloadTrigger, ServiceMessage, SwapStatus};

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("A live rule swap is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Rule loading failed: {0}")]
    RuleLoad(String),

    #[error("Failed to build detection state: {0}")]
    Build(#[from] DetectError),

    #[error("Live rule swap task failed: {0}")]
    Interrupted(String),
}

impl SwapError {
    /// Fatal errors terminate the process; the rest leave the current
    /// generation in place.
    pub fn is_fatal(&self) -> bool {
        match self {
            SwapError::Config(_) | SwapError::RuleLoad(_) | SwapError::Interrupted(_) => true,
            SwapError::Build(e) => e.is_fatal(),
            SwapError::AlreadyRunning => false,
        }
    }
}

/// What one completed swap did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapReport {
    /// Id of the detection context published by this swap
    pub new_ctx: u32,
    /// Id of the detection context it replaced
    pub old_ctx: Option<u32>,
    /// Worker contexts replaced
    pub workers: usize,
    /// Workers that confirmed use of their replacement
    pub confirmed: usize,
    /// Workers waited out through the shutdown fallback
    pub drained_on_shutdown: usize,
    /// Old worker contexts reclaimed here
    pub reclaimed: usize,
    /// Old worker contexts still referenced elsewhere at reclaim time
    pub late_references: usize,
    /// The old detection context was freed by this swap
    pub old_ctx_freed: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Completed(SwapReport),
    /// Shutdown was observed before any worker was touched
    Aborted,
}

/// One worker whose context was replaced
struct Swapped {
    slot: Arc<WorkerSlot>,
    old: Option<Arc<WorkerContext>>,
    new: Arc<WorkerContext>,
}

/// Marks a swap as running and keeps the reload trigger disarmed until dropped
struct SwapGuard<'a> {
    in_progress: &'a AtomicBool,
    trigger: &'a ReloadTrigger,
}

impl<'a> SwapGuard<'a> {
    fn enter(in_progress: &'a AtomicBool, trigger: &'a ReloadTrigger) -> Result<Self, SwapError> {
        if in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SwapError::AlreadyRunning);
        }
        trigger.disarm();
        Ok(Self { in_progress, trigger })
    }
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::Release);
        self.trigger.rearm();
    }
}

/// Runs live rule swaps against a worker registry
pub struct SwapCoordinator {
    source: Arc<dyn ConfigSource>,
    loader: Arc<dyn RulesetLoader>,
    registry: Arc<WorkerRegistry>,
    control: Arc<EngineControl>,
    counters: Arc<CounterRegistry>,
    trigger: Arc<ReloadTrigger>,
    polling: Mutex<Polling>,
    in_progress: AtomicBool,
}

/// Poll intervals of the confirmation and drain phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polling {
    pub interval: Duration,
    pub fallback_interval: Duration,
}

impl From<&LiveSwapConfig> for Polling {
    fn from(settings: &LiveSwapConfig) -> Self {
        Self {
            interval: settings.poll_interval(),
            fallback_interval: settings.fallback_poll_interval(),
        }
    }
}

impl SwapCoordinator {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        loader: Arc<dyn RulesetLoader>,
        registry: Arc<WorkerRegistry>,
        control: Arc<EngineControl>,
        counters: Arc<CounterRegistry>,
        trigger: Arc<ReloadTrigger>,
    ) -> Self {
        Self {
            source,
            loader,
            registry,
            control,
            counters,
            trigger,
            polling: Mutex::new(Polling::from(&LiveSwapConfig::default())),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_polling(self, settings: &LiveSwapConfig) -> Self {
        *self.polling.lock() = Polling::from(settings);
        self
    }

    /// Poll intervals in effect, as set by the last loaded configuration
    pub fn polling(&self) -> Polling {
        *self.polling.lock()
    }

    pub fn trigger(&self) -> &Arc<ReloadTrigger> {
        &self.trigger
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Perform one live rule swap. Blocks until the old generation has been
    /// reclaimed.
    pub fn run(&self) -> Result<SwapOutcome, SwapError> {
        let _guard: SwapGuard<'_> = SwapGuard::enter(&self.in_progress, &self.trigger)?;
        let started: Instant = Instant::now();
        info!("Live rule swap has started");

        let tree: ConfTree = self.source.load()?;
        let generation: Generation = build_generation(&tree, self.loader.as_ref())?;
        let polling: Polling = Polling::from(&generation.settings.live_swap);
        *self.polling.lock() = polling;
        let new_ctx: Arc<DetectionContext> = Arc::new(generation.ctx);

        let Some((swapped, old_master)) = self.publish(&new_ctx)? else {
            return Ok(SwapOutcome::Aborted);
        };

        let (confirmed, unconfirmed): (usize, Vec<&Swapped>) = self.wait_for_confirmation(&swapped, polling.interval);
        let drained_on_shutdown: usize = unconfirmed.len();
        if !unconfirmed.is_empty() {
            info!(
                "Shutdown during live rule swap, waiting for {} unconfirmed workers to finish",
                unconfirmed.len()
            );
            self.drain_unconfirmed(&unconfirmed, polling.fallback_interval);
        }

        let mut report: SwapReport = SwapReport {
            new_ctx: new_ctx.id(),
            old_ctx: old_master.as_ref().map(|ctx| ctx.id()),
            workers: swapped.len(),
            confirmed,
            drained_on_shutdown,
            ..SwapReport::default()
        };
        drop(new_ctx);

        self.reclaim(swapped, &mut report);
        report.old_ctx_freed = DetectionContext::release(old_master);
        report.elapsed = started.elapsed();

        info!(
            "Live rule swap has swapped {} old worker contexts with new ones, along with the new detection context {}",
            report.workers, report.new_ctx
        );
        Ok(SwapOutcome::Completed(report))
    }

    /// Enumerate, build and publish under the registry lock. `None` when
    /// shutdown was observed during enumeration.
    #[allow(clippy::type_complexity)]
    fn publish(
        &self,
        new_ctx: &Arc<DetectionContext>,
    ) -> Result<Option<(Vec<Swapped>, Option<Arc<DetectionContext>>)>, SwapError> {
        let mut registry = self.registry.lock();
        if self.control.is_shutdown() {
            info!("Shutdown observed, abandoning live rule swap");
            return Ok(None);
        }

        let mut targets: Vec<Arc<WorkerSlot>> = Vec::new();
        for slot in registry.slots() {
            if self.control.is_shutdown() {
                info!("Shutdown observed, abandoning live rule swap");
                return Ok(None);
            }
            if slot.is_detect() {
                targets.push(Arc::clone(slot));
            }
        }
        debug!("Live rule swap to replace {} worker contexts", targets.len());

        // All or nothing: a failure here drops the replacements built so far
        let mut replacements: Vec<Arc<WorkerContext>> = Vec::with_capacity(targets.len());
        for slot in &targets {
            let worker_ctx: WorkerContext = WorkerContext::new(Arc::clone(new_ctx), &self.counters, slot.name())
                .map_err(|e| {
                    warn!(worker = slot.name(), "Failed to build worker context, keeping the current ruleset: {}", e);
                    e
                })?;
            replacements.push(Arc::new(worker_ctx));
        }

        let swapped: Vec<Swapped> = targets
            .into_iter()
            .zip(replacements)
            .map(|(slot, new)| {
                let old: Option<Arc<WorkerContext>> = slot.publish(Arc::clone(&new));
                Swapped { slot, old, new }
            })
            .collect();
        let old_master: Option<Arc<DetectionContext>> = registry.replace_master(Arc::clone(new_ctx));

        Ok(Some((swapped, old_master)))
    }

    /// Poll each replacement until its worker has used it. Stops early on
    /// shutdown and returns the workers that never confirmed.
    fn wait_for_confirmation<'s>(&self, swapped: &'s [Swapped], interval: Duration) -> (usize, Vec<&'s Swapped>) {
        let mut confirmed: usize = 0;

        for (i, entry) in swapped.iter().enumerate() {
            loop {
                if entry.new.is_used() {
                    confirmed += 1;
                    break;
                }
                if self.control.is_shutdown() {
                    let unconfirmed: Vec<&Swapped> = swapped[i..].iter().filter(|s| !s.new.is_used()).collect();
                    confirmed += (swapped.len() - i) - unconfirmed.len();
                    return (confirmed, unconfirmed);
                }
                std::thread::sleep(interval);
            }
        }

        (confirmed, Vec::new())
    }

    /// Wait until each worker has left its packet loop. There is no timeout:
    /// a worker that never gets there blocks the swap.
    fn drain_unconfirmed(&self, unconfirmed: &[&Swapped], interval: Duration) {
        for entry in unconfirmed {
            while !entry.slot.has_flag(THREAD_RUNNING_DONE) {
                std::thread::sleep(interval);
            }
            debug!(worker = entry.slot.name(), "Worker finished without confirming");
        }
    }

    fn reclaim(&self, swapped: Vec<Swapped>, report: &mut SwapReport) {
        for Swapped { slot, old, new } in swapped {
            drop(new);
            let Some(old) = old else {
                continue;
            };
            match Arc::try_unwrap(old) {
                Ok(worker_ctx) => {
                    drop(worker_ctx);
                    report.reclaimed += 1;
                }
                Err(still_shared) => {
                    warn!(
                        worker = slot.name(),
                        refs = Arc::strong_count(&still_shared) - 1,
                        "Old worker context still referenced after the swap"
                    );
                    report.late_references += 1;
                }
            }
        }
    }
}
