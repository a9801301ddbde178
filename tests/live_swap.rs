//! Live rule swap scenarios against real worker threads

use norx::config::{ConfTree, GeneralConfig, StaticConfigSource};
use norx::core::control::EngineControl;
use norx::core::packet::{NorxPacket, Protocol};
use norx::core::registry::{WorkerRegistry, WorkerSlot, THREAD_RUNNING_DONE};
use norx::core::worker::{spawn_worker, WorkerHandle};
use norx::core::NorxEngine;
use norx::detect::context::AddOutcome;
use norx::detect::{DetectError, DetectionContext};
use norx::rules::{LoadSummary, RuleError, RulesetLoader, StaticRuleset};
use norx::swap::{LiveSwapService, ReloadTrigger, SwapCoordinator, SwapOutcome, SwapReport, SwapStatus};
use norx::utils::metrics::CounterRegistry;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RULES_V1: &str = "alert tcp any any -> any 80 (msg:\"v1\"; content:\"attack\"; sid:100; rev:1;)";
const RULES_V2: &str = "alert tcp any any -> any 80 (msg:\"v2\"; content:\"attack\"; sid:200; rev:1;)\n\
                        alert udp any any -> any 53 (msg:\"dns\"; content:\"evil\"; sid:201; rev:1;)";

struct Harness {
    registry: Arc<WorkerRegistry>,
    control: Arc<EngineControl>,
    counters: Arc<CounterRegistry>,
    loader: Arc<StaticRuleset>,
    coordinator: SwapCoordinator,
}

impl Harness {
    fn new(rules: &str) -> Self {
        let registry: Arc<WorkerRegistry> = Arc::new(WorkerRegistry::new());
        let control: Arc<EngineControl> = Arc::new(EngineControl::new());
        let counters: Arc<CounterRegistry> = Arc::new(CounterRegistry::new());
        let loader: Arc<StaticRuleset> = Arc::new(StaticRuleset::new(rules));
        let (trigger, _rx) = ReloadTrigger::new();

        let coordinator: SwapCoordinator = SwapCoordinator::new(
            Arc::new(StaticConfigSource::default()),
            Arc::clone(&loader) as Arc<dyn RulesetLoader>,
            Arc::clone(&registry),
            Arc::clone(&control),
            Arc::clone(&counters),
            trigger,
        );

        // First generation, published the way startup does it
        match coordinator.run() {
            Ok(SwapOutcome::Completed(report)) => assert_eq!(report.workers, 0),
            other => panic!("initial publish failed: {:?}", other),
        }

        Self {
            registry,
            control,
            counters,
            loader,
            coordinator,
        }
    }

    fn spawn_workers(&self, count: usize) -> (Vec<WorkerHandle>, Vec<SyncSender<NorxPacket>>) {
        let mut handles: Vec<WorkerHandle> = Vec::new();
        let mut senders: Vec<SyncSender<NorxPacket>> = Vec::new();
        for i in 0..count {
            let name: String = format!("W#{:02}", i + 1);
            let slot: Arc<WorkerSlot> = self.registry.register_detect_worker(&name, &self.counters).unwrap();
            let (tx, rx) = mpsc::sync_channel::<NorxPacket>(64);
            handles.push(
                spawn_worker(slot, Arc::clone(&self.control), rx, Duration::from_millis(1), &self.counters).unwrap(),
            );
            senders.push(tx);
        }
        (handles, senders)
    }

    fn swap(&self) -> SwapReport {
        match self.coordinator.run() {
            Ok(SwapOutcome::Completed(report)) => report,
            other => panic!("swap did not complete: {:?}", other),
        }
    }

    fn current_id(&self) -> u32 {
        self.registry.current_detection_context().unwrap().id()
    }
}

fn http_packet(payload: &str) -> NorxPacket {
    NorxPacket::builder(Protocol::TCP)
        .src("192.168.0.5".parse().unwrap(), 40000)
        .dst("10.1.1.1".parse().unwrap(), 80)
        .payload(payload.as_bytes().to_vec())
        .build()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline: Instant = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_all_workers_confirm_and_old_generation_is_freed() {
    let harness: Harness = Harness::new(RULES_V1);
    let (handles, senders) = harness.spawn_workers(4);
    let old_id: u32 = harness.current_id();

    harness.loader.set_rules(RULES_V2);
    let report: SwapReport = harness.swap();

    assert_eq!(report.workers, 4);
    assert_eq!(report.confirmed, 4);
    assert_eq!(report.drained_on_shutdown, 0);
    assert_eq!(report.reclaimed, 4);
    assert_eq!(report.late_references, 0);
    assert_eq!(report.old_ctx, Some(old_id));
    assert!(report.old_ctx_freed);

    let new_id: u32 = harness.current_id();
    assert_eq!(new_id, report.new_ctx);
    for slot in harness.registry.slots() {
        assert_eq!(slot.current().unwrap().detect_ctx().id(), new_id);
    }
    let current: Arc<DetectionContext> = harness.registry.current_detection_context().unwrap();
    assert!(current.signature_by_sid(1, 200).is_some());
    assert!(current.signature_by_sid(1, 100).is_none());
    drop(current);

    harness.control.stop();
    drop(senders);
    for handle in handles {
        handle.join();
    }
}

#[test]
fn test_swap_with_no_workers() {
    let harness: Harness = Harness::new(RULES_V1);
    let old_id: u32 = harness.current_id();

    let report: SwapReport = harness.swap();
    assert_eq!(report.workers, 0);
    assert_eq!(report.confirmed, 0);
    assert_eq!(report.old_ctx, Some(old_id));
    assert!(report.old_ctx_freed);
    assert_ne!(harness.current_id(), old_id);
}

#[test]
fn test_shutdown_during_drain_waits_for_unconfirmed_workers() {
    let harness: Arc<Harness> = Arc::new(Harness::new(RULES_V1));
    let slots: Vec<Arc<WorkerSlot>> = (0..4)
        .map(|i| {
            harness
                .registry
                .register_detect_worker(&format!("W#{:02}", i + 1), &harness.counters)
                .unwrap()
        })
        .collect();
    let old_id: u32 = harness.current_id();

    let runner: Arc<Harness> = Arc::clone(&harness);
    let swap = thread::spawn(move || runner.swap());

    assert!(wait_until(Duration::from_secs(10), || harness.current_id() != old_id));

    // Two workers pick up their replacement, the other two never do
    for slot in &slots[..2] {
        assert!(slot.current().unwrap().inspect(&NorxPacket::pseudo()).is_empty());
    }
    harness.control.stop();
    thread::sleep(Duration::from_millis(20));
    assert!(!swap.is_finished());

    for slot in &slots[2..] {
        slot.set_flag(THREAD_RUNNING_DONE);
    }
    let report: SwapReport = swap.join().unwrap();

    assert_eq!(report.workers, 4);
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.drained_on_shutdown, 2);
    assert_eq!(report.reclaimed, 4);
    assert_eq!(report.late_references, 0);
    assert!(report.old_ctx_freed);
}

#[test]
fn test_repeated_swaps_under_traffic() {
    const WORKERS: usize = 4;
    const SWAPS: usize = 25;

    let harness: Harness = Harness::new(RULES_V1);
    let (handles, senders) = harness.spawn_workers(WORKERS);

    let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = mpsc::channel();
    let feeder = thread::spawn(move || {
        let mut sent: u64 = 0;
        while stop_rx.try_recv().is_err() {
            let tx: &SyncSender<NorxPacket> = &senders[(sent as usize) % senders.len()];
            if tx.send(http_packet("GET /attack HTTP/1.1")).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    });

    let mut seen: Vec<u32> = vec![harness.current_id()];
    for i in 0..SWAPS {
        harness.loader.set_rules(if i % 2 == 0 { RULES_V2 } else { RULES_V1 });
        let report: SwapReport = harness.swap();
        assert_eq!(report.workers, WORKERS);
        assert_eq!(report.confirmed, WORKERS);
        assert_eq!(report.late_references, 0);
        assert!(report.old_ctx_freed);
        assert_eq!(report.old_ctx, seen.last().copied());
        seen.push(report.new_ctx);
    }

    // Only the last generation is still alive: the registry plus one worker
    // context per worker hold it
    let current: Arc<DetectionContext> = harness.registry.current_detection_context().unwrap();
    assert_eq!(current.id(), *seen.last().unwrap());
    assert_eq!(Arc::strong_count(&current), WORKERS + 2);
    drop(current);

    stop_tx.send(()).unwrap();
    harness.control.stop();
    let sent: u64 = feeder.join().unwrap();
    let inspected: u64 = handles.into_iter().map(WorkerHandle::join).sum();
    assert!(inspected <= sent);
    assert!(harness.counters.total("detect.alert") <= inspected);
}

/// Ruleset that blocks signature loading until released
struct GatedRuleset {
    inner: StaticRuleset,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl RulesetLoader for GatedRuleset {
    fn load_classifications(&self, s: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        self.inner.load_classifications(s, ctx)
    }

    fn load_references(&self, s: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        self.inner.load_references(s, ctx)
    }

    fn load_signatures(&self, s: &GeneralConfig, ctx: &mut DetectionContext) -> Result<LoadSummary, RuleError> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv_timeout(Duration::from_secs(10));
        self.inner.load_signatures(s, ctx)
    }

    fn load_thresholds(&self, s: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        self.inner.load_thresholds(s, ctx)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_during_swap_is_deferred_not_dropped() {
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let loader: Arc<GatedRuleset> = Arc::new(GatedRuleset {
        inner: StaticRuleset::new(RULES_V1),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });

    let (trigger, rx) = ReloadTrigger::new();
    let coordinator: Arc<SwapCoordinator> = Arc::new(SwapCoordinator::new(
        Arc::new(StaticConfigSource::default()),
        loader,
        Arc::new(WorkerRegistry::new()),
        Arc::new(EngineControl::new()),
        Arc::new(CounterRegistry::new()),
        Arc::clone(&trigger),
    ));
    let service: LiveSwapService = LiveSwapService::new(coordinator, rx);
    let mut status: tokio::sync::watch::Receiver<SwapStatus> = service.subscribe();
    let task = tokio::spawn(service.run());

    assert!(trigger.request());
    tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();

    // The first swap is blocked inside signature loading
    assert!(!trigger.request());
    assert!(trigger.has_pending());

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while status.borrow().completed < 2 {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(!trigger.has_pending());
    assert!(trigger.is_armed());

    trigger.shutdown();
    assert_eq!(task.await.unwrap().unwrap(), 2);
}

#[test]
fn test_keyword_failure_leaves_workers_on_old_generation() {
    use norx::detect::{KeywordFns, KeywordThreadCtx, ThreadKeyword};
    use std::sync::atomic::{AtomicBool, Ordering};

    let fail: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let fail_flag: Arc<AtomicBool> = Arc::clone(&fail);
    let keyword: Arc<dyn ThreadKeyword> = Arc::new(KeywordFns::new(
        move || {
            if fail_flag.load(Ordering::SeqCst) {
                None
            } else {
                Some(Box::new(0u8) as KeywordThreadCtx)
            }
        },
        |_ctx: KeywordThreadCtx| {},
    ));

    let registry: Arc<WorkerRegistry> = Arc::new(WorkerRegistry::new());
    let counters: Arc<CounterRegistry> = Arc::new(CounterRegistry::new());
    let (trigger, _rx) = ReloadTrigger::new();
    let coordinator: SwapCoordinator = SwapCoordinator::new(
        Arc::new(StaticConfigSource::default()),
        Arc::new(StaticRuleset::new(RULES_V1).with_keyword("probe", keyword)),
        Arc::clone(&registry),
        Arc::new(EngineControl::new()),
        Arc::clone(&counters),
        trigger,
    );
    assert!(matches!(coordinator.run(), Ok(SwapOutcome::Completed(_))));

    let slots: Vec<Arc<WorkerSlot>> = (0..3)
        .map(|i| registry.register_detect_worker(&format!("W#{:02}", i + 1), &counters).unwrap())
        .collect();
    let before: Vec<u32> = slots.iter().map(|s| s.current().unwrap().detect_ctx().id()).collect();
    let master: u32 = registry.current_detection_context().unwrap().id();

    fail.store(true, Ordering::SeqCst);
    let err = coordinator.run().unwrap_err();
    assert!(matches!(err, norx::swap::SwapError::Build(DetectError::KeywordInit { .. })));
    assert!(!err.is_fatal());

    let after: Vec<u32> = slots.iter().map(|s| s.current().unwrap().detect_ctx().id()).collect();
    assert_eq!(before, after);
    assert_eq!(registry.current_detection_context().unwrap().id(), master);
    assert!(!coordinator.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_reload_end_to_end() {
    let tree: ConfTree = ConfTree::from_toml_str("[general]\nthreads = 2\n\n[live-swap]\nworker-idle-ms = 5\n").unwrap();
    let ruleset: Arc<StaticRuleset> = Arc::new(StaticRuleset::new(RULES_V1));
    let mut engine: NorxEngine = NorxEngine::new(Arc::new(StaticConfigSource::new(tree)), Arc::clone(&ruleset) as Arc<dyn RulesetLoader>);

    engine.init().await.unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.registry().detect_worker_count(), 2);

    let first: u32 = engine.current_detection_context().unwrap().id();
    for _ in 0..10 {
        engine.dispatch(http_packet("POST /attack")).unwrap();
    }

    ruleset.set_rules(RULES_V2);
    let mut status: tokio::sync::watch::Receiver<SwapStatus> = engine.swap_status().unwrap();
    assert!(engine.reload_rules());
    tokio::time::timeout(Duration::from_secs(10), async {
        while status.borrow().completed < 1 {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let current: Arc<DetectionContext> = engine.current_detection_context().unwrap();
    assert_ne!(current.id(), first);
    assert!(current.signature_by_sid(1, 201).is_some());
    drop(current);

    engine.stop().await.unwrap();
    assert_eq!(engine.registry().worker_count(), 0);
    assert!(engine.current_detection_context().is_none());
}

#[test]
fn test_duplicate_sids_keep_highest_revision() {
    let mut ctx: DetectionContext = DetectionContext::new(Default::default()).unwrap();
    let older = norx::rules::Rule::new("alert tcp any any -> any any (msg:\"old\"; content:\"a\"; sid:9; rev:1;)").unwrap();
    let newer = norx::rules::Rule::new("alert tcp any any -> any any (msg:\"new\"; content:\"a\"; sid:9; rev:3;)").unwrap();
    assert_eq!(ctx.add_rule(older).unwrap(), AddOutcome::Added);
    assert_eq!(ctx.add_rule(newer).unwrap(), AddOutcome::Replaced);
    ctx.build_signature_groups().unwrap();
    assert_eq!(ctx.signature_by_sid(1, 9).unwrap().msg, "new");
}
