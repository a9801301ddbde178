//! Packet-processing worker threads
//!
//! Each worker owns one registry slot. Before every unit of work it loads the
//! slot's current worker context, so a published replacement is picked up at
//! the next packet. When no packet arrives within the idle interval the worker
//! runs a pseudo packet through detection instead.

use crate::core::control::EngineControl;
use crate::core::packet::NorxPacket;
use crate::core::registry::{WorkerSlot, THREAD_CLOSED, THREAD_INIT_DONE, THREAD_RUNNING_DONE};
use crate::detect::thread_ctx::Alert;
use crate::utils::metrics::{CounterHandle, CounterKind, CounterRegistry, MetricTimer};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Handle to a spawned worker thread
pub struct WorkerHandle {
    slot: Arc<WorkerSlot>,
    thread: Option<JoinHandle<u64>>,
}

impl WorkerHandle {
    pub fn slot(&self) -> &Arc<WorkerSlot> {
        &self.slot
    }

    /// Wait for the thread to exit. Returns the number of packets it inspected.
    pub fn join(mut self) -> u64 {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(packets)) => packets,
            Some(Err(_)) => {
                tracing::error!(worker = self.slot.name(), "Worker thread panicked");
                0
            }
            None => 0,
        }
    }
}

fn log_alert(worker: &str, alert: &Alert) {
    info!(
        worker,
        action = %alert.action,
        gid = alert.gid,
        sid = alert.sid,
        rev = alert.rev,
        priority = alert.priority,
        "[ALERT] {}",
        alert.msg
    );
}

/// Marks the slot as done with its packet loop when dropped, including when
/// the thread unwinds
struct ExitFlags<'a> {
    slot: &'a WorkerSlot,
}

impl Drop for ExitFlags<'_> {
    fn drop(&mut self) {
        self.slot.set_flag(THREAD_RUNNING_DONE);
        if std::thread::panicking() {
            tracing::error!(worker = self.slot.name(), "Worker left its packet loop while panicking");
        }
        self.slot.set_flag(THREAD_CLOSED);
    }
}

struct WorkerLoop {
    slot: Arc<WorkerSlot>,
    control: Arc<EngineControl>,
    packets: Receiver<NorxPacket>,
    idle: Duration,
    counter_packets: CounterHandle,
    counter_ticks: CounterHandle,
}

impl WorkerLoop {
    fn run(self) -> u64 {
        let name: String = self.slot.name().to_string();
        self.slot.set_flag(THREAD_INIT_DONE);
        let _exit: ExitFlags<'_> = ExitFlags { slot: &self.slot };
        debug!("Worker {} started", name);

        let mut inspected: u64 = 0;
        while !self.control.is_shutdown() {
            let packet: NorxPacket = match self.packets.recv_timeout(self.idle) {
                Ok(packet) => packet,
                Err(RecvTimeoutError::Timeout) => NorxPacket::pseudo(),
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if !self.slot.is_detect() {
                continue;
            }
            let Some(worker_ctx) = self.slot.current() else {
                continue;
            };

            if !packet.pseudo {
                self.counter_packets.increment();
                inspected += 1;
            }
            let alerts: Vec<Alert> = {
                let _timer: MetricTimer = MetricTimer::new(self.counter_ticks.clone());
                worker_ctx.inspect(&packet)
            };
            // Never hold a context across the wait for the next packet
            drop(worker_ctx);

            for alert in &alerts {
                log_alert(&name, alert);
            }
        }

        debug!("Worker {} left its packet loop after {} packets", name, inspected);
        inspected
    }
}

/// Spawn a worker thread serving `slot`
pub fn spawn_worker(
    slot: Arc<WorkerSlot>,
    control: Arc<EngineControl>,
    packets: Receiver<NorxPacket>,
    idle: Duration,
    counters: &CounterRegistry,
) -> std::io::Result<WorkerHandle> {
    let worker: WorkerLoop = WorkerLoop {
        counter_packets: counters.register_counter("decoder.pkts", CounterKind::Plain, slot.name()),
        counter_ticks: counters.register_counter("detect.ticks_us", CounterKind::Average, slot.name()),
        slot: Arc::clone(&slot),
        control,
        packets,
        idle,
    };

    let thread: JoinHandle<u64> = std::thread::Builder::new()
        .name(slot.name().to_string())
        .spawn(move || worker.run())?;

    Ok(WorkerHandle {
        slot,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectConfig;
    use crate::core::packet::Protocol;
    use crate::core::registry::WorkerRegistry;
    use crate::detect::DetectionContext;
    use crate::rules::Rule;
    use std::sync::mpsc;

    #[test]
    fn test_worker_inspects_and_stops() {
        let registry: WorkerRegistry = WorkerRegistry::new();
        let counters: CounterRegistry = CounterRegistry::new();
        let mut ctx: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        ctx.add_rule(Rule::new("alert tcp any any -> any any (content:\"evil\"; sid:7;)").unwrap())
            .unwrap();
        ctx.build_signature_groups().unwrap();
        registry.publish_detection_context(Arc::new(ctx));

        let slot: Arc<WorkerSlot> = registry.register_detect_worker("W#01", &counters).unwrap();
        let control: Arc<EngineControl> = Arc::new(EngineControl::new());
        let (tx, rx) = mpsc::channel::<NorxPacket>();
        let handle: WorkerHandle =
            spawn_worker(Arc::clone(&slot), Arc::clone(&control), rx, Duration::from_millis(5), &counters).unwrap();

        let packet: NorxPacket = NorxPacket::builder(Protocol::TCP)
            .src("10.0.0.1".parse().unwrap(), 4000)
            .dst("10.0.0.2".parse().unwrap(), 80)
            .payload(b"some evil bytes".to_vec())
            .build();
        tx.send(packet).unwrap();
        drop(tx);

        assert_eq!(handle.join(), 1);
        assert!(slot.has_flag(THREAD_RUNNING_DONE));
        assert!(slot.has_flag(THREAD_CLOSED));
        assert_eq!(counters.value("detect.alert", "W#01"), Some(1));
        assert!(slot.current().unwrap().is_used());
    }

    #[test]
    fn test_idle_worker_confirms_with_pseudo_packet() {
        let registry: WorkerRegistry = WorkerRegistry::new();
        let counters: CounterRegistry = CounterRegistry::new();
        let mut ctx: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        ctx.build_signature_groups().unwrap();
        registry.publish_detection_context(Arc::new(ctx));

        let slot: Arc<WorkerSlot> = registry.register_detect_worker("W#01", &counters).unwrap();
        let control: Arc<EngineControl> = Arc::new(EngineControl::new());
        let (tx, rx) = mpsc::channel::<NorxPacket>();
        let handle: WorkerHandle =
            spawn_worker(Arc::clone(&slot), Arc::clone(&control), rx, Duration::from_millis(1), &counters).unwrap();

        let deadline: std::time::Instant = std::time::Instant::now() + Duration::from_secs(5);
        while !slot.current().unwrap().is_used() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(slot.current().unwrap().is_used());

        control.stop();
        assert_eq!(handle.join(), 0);
        drop(tx);
    }

    #[test]
    fn test_exit_flags_set_when_thread_panics() {
        let registry: WorkerRegistry = WorkerRegistry::new();
        let slot: Arc<WorkerSlot> = registry.register_slot("W#01", 0);
        let thread_slot: Arc<WorkerSlot> = Arc::clone(&slot);

        let result = std::thread::spawn(move || {
            let _exit: ExitFlags<'_> = ExitFlags { slot: &thread_slot };
            panic!("inspection failed");
        })
        .join();

        assert!(result.is_err());
        assert!(slot.has_flag(THREAD_RUNNING_DONE));
        assert!(slot.has_flag(THREAD_CLOSED));
    }
}
