//! Core engine module for Norx
//!
//! This module ties the pieces together: it builds the first detection
//! context, starts the detect workers, feeds them packets and runs the live
//! rule swap service.

pub mod control;
pub mod packet;
pub mod registry;
pub mod worker;

use crate::config::{ConfTree, ConfigSource, NorxConfig};
use crate::core::control::EngineControl;
use crate::core::packet::NorxPacket;
use crate::core::registry::{WorkerRegistry, WorkerSlot};
use crate::core::worker::{spawn_worker, WorkerHandle};
use crate::detect::DetectionContext;
use crate::rules::RulesetLoader;
use crate::swap::{build_generation, Generation, LiveSwapService, ReloadTrigger, ServiceMessage, SwapCoordinator, SwapError, SwapStatus};
use crate::utils::format_duration;
use crate::utils::metrics::CounterRegistry;
use anyhow::{anyhow, bail, Context};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc as async_mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Packets queued per worker before dispatch blocks
const WORKER_QUEUE_DEPTH: usize = 1024;

/// Round-robin packet feed into the detect workers
#[derive(Clone)]
pub struct PacketDispatcher {
    senders: Arc<[SyncSender<NorxPacket>]>,
    next: Arc<AtomicUsize>,
}

impl PacketDispatcher {
    /// Hand a packet to the next worker, blocking while its queue is full
    pub fn dispatch(&self, packet: NorxPacket) -> anyhow::Result<()> {
        if self.senders.is_empty() {
            bail!("No workers are running");
        }
        let idx: usize = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[idx]
            .send(packet)
            .map_err(|_| anyhow!("Worker {} has stopped", idx + 1))
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }
}

/// The main Norx engine that coordinates all components
pub struct NorxEngine {
    source: Arc<dyn ConfigSource>,
    loader: Arc<dyn RulesetLoader>,
    settings: NorxConfig,
    registry: Arc<WorkerRegistry>,
    control: Arc<EngineControl>,
    counters: Arc<CounterRegistry>,
    trigger: Arc<ReloadTrigger>,
    trigger_rx: Option<async_mpsc::UnboundedReceiver<ServiceMessage>>,
    coordinator: Option<Arc<SwapCoordinator>>,
    service: Option<JoinHandle<Result<u64, SwapError>>>,
    status: Option<watch::Receiver<SwapStatus>>,
    workers: Vec<WorkerHandle>,
    dispatcher: Option<PacketDispatcher>,
    started: Instant,
}

impl NorxEngine {
    /// Create a new Norx engine reading its configuration and rules from the
    /// given sources
    pub fn new(source: Arc<dyn ConfigSource>, loader: Arc<dyn RulesetLoader>) -> Self {
        let (trigger, trigger_rx) = ReloadTrigger::new();

        Self {
            source,
            loader,
            settings: NorxConfig::default(),
            registry: Arc::new(WorkerRegistry::new()),
            control: Arc::new(EngineControl::new()),
            counters: Arc::new(CounterRegistry::new()),
            trigger,
            trigger_rx: Some(trigger_rx),
            coordinator: None,
            service: None,
            status: None,
            workers: Vec::new(),
            dispatcher: None,
            started: Instant::now(),
        }
    }

    /// Build the first detection context and start the detect workers
    pub async fn init(&mut self) -> anyhow::Result<()> {
        let source: Arc<dyn ConfigSource> = Arc::clone(&self.source);
        let loader: Arc<dyn RulesetLoader> = Arc::clone(&self.loader);
        let generation: Generation = tokio::task::spawn_blocking(move || -> Result<Generation, SwapError> {
            let tree: ConfTree = source.load()?;
            build_generation(&tree, loader.as_ref())
        })
        .await??;

        self.settings = generation.settings;
        info!(
            "Loaded {} rules ({} failed, {} duplicates)",
            generation.summary.loaded, generation.summary.failed, generation.summary.duplicates
        );
        self.registry.publish_detection_context(Arc::new(generation.ctx));

        self.coordinator = Some(Arc::new(
            SwapCoordinator::new(
                Arc::clone(&self.source),
                Arc::clone(&self.loader),
                Arc::clone(&self.registry),
                Arc::clone(&self.control),
                Arc::clone(&self.counters),
                Arc::clone(&self.trigger),
            )
            .with_polling(&self.settings.live_swap),
        ));

        let threads: usize = self.settings.general.threads;
        let mut senders: Vec<SyncSender<NorxPacket>> = Vec::with_capacity(threads);
        for i in 0..threads {
            let name: String = format!("W#{:02}", i + 1);
            let slot: Arc<WorkerSlot> = self
                .registry
                .register_detect_worker(&name, &self.counters)
                .with_context(|| format!("Failed to set up worker {}", name))?;

            let (tx, rx) = mpsc::sync_channel::<NorxPacket>(WORKER_QUEUE_DEPTH);
            let handle: WorkerHandle = spawn_worker(
                slot,
                Arc::clone(&self.control),
                rx,
                self.settings.live_swap.worker_idle(),
                &self.counters,
            )
            .with_context(|| format!("Failed to spawn worker {}", name))?;

            senders.push(tx);
            self.workers.push(handle);
        }
        self.dispatcher = Some(PacketDispatcher {
            senders: senders.into(),
            next: Arc::new(AtomicUsize::new(0)),
        });

        info!("Started {} detect workers", threads);
        Ok(())
    }

    /// Start the live rule swap service
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let coordinator: Arc<SwapCoordinator> = self
            .coordinator
            .clone()
            .ok_or_else(|| anyhow!("Engine must be initialized before it is started"))?;
        let rx: async_mpsc::UnboundedReceiver<ServiceMessage> = self
            .trigger_rx
            .take()
            .ok_or_else(|| anyhow!("Live rule swap service already started"))?;

        let service: LiveSwapService = LiveSwapService::new(coordinator, rx);
        self.status = Some(service.subscribe());
        self.service = Some(tokio::spawn(service.run()));
        Ok(())
    }

    /// Request a live rule swap. Returns `false` when the request was
    /// deferred behind a swap already in progress.
    pub fn reload_rules(&self) -> bool {
        self.trigger.request()
    }

    /// Feed for packets into the workers
    pub fn dispatcher(&self) -> Option<PacketDispatcher> {
        self.dispatcher.clone()
    }

    pub fn dispatch(&self, packet: NorxPacket) -> anyhow::Result<()> {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(packet),
            None => bail!("Engine is not initialized"),
        }
    }

    /// Watch completed swaps
    pub fn swap_status(&self) -> Option<watch::Receiver<SwapStatus>> {
        self.status.clone()
    }

    /// Wait for the swap service to exit. Only returns when it stops on its own,
    /// which happens on a fatal swap error.
    pub async fn wait_service(&mut self) -> anyhow::Result<u64> {
        let Some(handle) = self.service.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.service = None;
        Ok(result.context("Live rule swap service panicked")??)
    }

    /// The currently published detection context
    pub fn current_detection_context(&self) -> Option<Arc<DetectionContext>> {
        self.registry.current_detection_context()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    pub fn control(&self) -> &Arc<EngineControl> {
        &self.control
    }

    /// Handle for requesting swaps from outside the engine
    pub fn reload_trigger(&self) -> Arc<ReloadTrigger> {
        Arc::clone(&self.trigger)
    }

    pub fn settings(&self) -> &NorxConfig {
        &self.settings
    }

    /// Stop the workers and the swap service, then free every context
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.control.stop();
        self.trigger.shutdown();
        self.dispatcher = None;

        let workers: Vec<WorkerHandle> = std::mem::take(&mut self.workers);
        let inspected: u64 = tokio::task::spawn_blocking(move || workers.into_iter().map(WorkerHandle::join).sum())
            .await
            .context("Failed to join worker threads")?;

        if let Some(service) = self.service.take() {
            match service.await {
                Ok(Ok(swaps)) => info!("{} live rule swaps performed", swaps),
                Ok(Err(e)) => warn!("Live rule swap service ended with an error: {}", e),
                Err(e) => warn!("Live rule swap service panicked: {}", e),
            }
        }

        for slot in self.registry.slots() {
            self.registry.deregister(slot.id());
            drop(slot.take());
        }
        if !DetectionContext::release(self.registry.take_detection_context()) {
            warn!("Detection context was not freed at shutdown");
        }

        info!("Inspected {} packets in {}", inspected, format_duration(self.started.elapsed()));
        let stats: String = self.counters.format();
        if !stats.is_empty() {
            info!("Counters:\n{}", stats);
        }
        Ok(())
    }
}
