//! Live rule swap service
//!
//! A single tokio task receives reload requests and runs one swap at a time on
//! the blocking pool. Requests that arrive while a swap is running are held as
//! pending and re-sent once it finishes, so they are deferred rather than
//! dropped or run concurrently.

use crate::swap::{SwapCoordinator, SwapError, SwapOutcome, SwapReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMessage {
    Reload,
    Shutdown,
}

/// Entry point for reload requests (signal handler, API, tests)
#[derive(Debug)]
pub struct ReloadTrigger {
    tx: mpsc::UnboundedSender<ServiceMessage>,
    armed: AtomicBool,
    pending: AtomicBool,
}

impl ReloadTrigger {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let trigger: Arc<ReloadTrigger> = Arc::new(Self {
            tx,
            armed: AtomicBool::new(true),
            pending: AtomicBool::new(false),
        });
        (trigger, rx)
    }

    /// Request a swap. Returns `false` when a swap is running and the request
    /// was deferred until it completes.
    pub fn request(&self) -> bool {
        if self.armed.load(Ordering::Acquire) {
            let _ = self.tx.send(ServiceMessage::Reload);
            return true;
        }

        self.pending.store(true, Ordering::Release);
        // Re-armed in the meantime: nobody else will pick up the pending flag
        if self.armed.load(Ordering::Acquire) && self.pending.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(ServiceMessage::Reload);
            return true;
        }
        info!("Live rule swap already running, reload deferred");
        false
    }

    /// Ask the service to exit after any swap in progress
    pub fn shutdown(&self) {
        let _ = self.tx.send(ServiceMessage::Shutdown);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub(crate) fn rearm(&self) {
        self.armed.store(true, Ordering::Release);
        if self.pending.swap(false, Ordering::AcqRel) {
            info!("Running deferred live rule swap");
            let _ = self.tx.send(ServiceMessage::Reload);
        }
    }
}

/// Progress published after every swap
#[derive(Debug, Clone, Default)]
pub struct SwapStatus {
    pub completed: u64,
    pub failed: u64,
    pub last: Option<SwapReport>,
}

pub struct LiveSwapService {
    coordinator: Arc<SwapCoordinator>,
    rx: mpsc::UnboundedReceiver<ServiceMessage>,
    status: watch::Sender<SwapStatus>,
}

impl LiveSwapService {
    pub fn new(coordinator: Arc<SwapCoordinator>, rx: mpsc::UnboundedReceiver<ServiceMessage>) -> Self {
        let (status, _) = watch::channel(SwapStatus::default());
        Self { coordinator, rx, status }
    }

    pub fn subscribe(&self) -> watch::Receiver<SwapStatus> {
        self.status.subscribe()
    }

    /// Serve reload requests until shutdown. Returns the number of completed
    /// swaps, or the first fatal error.
    pub async fn run(mut self) -> Result<u64, SwapError> {
        info!("Live rule swap service started");

        while let Some(message) = self.rx.recv().await {
            if message == ServiceMessage::Shutdown {
                break;
            }

            // Collapse queued duplicates into this swap
            let mut shutdown: bool = false;
            while let Ok(next) = self.rx.try_recv() {
                shutdown |= next == ServiceMessage::Shutdown;
            }

            let coordinator: Arc<SwapCoordinator> = Arc::clone(&self.coordinator);
            let result: Result<SwapOutcome, SwapError> = tokio::task::spawn_blocking(move || coordinator.run())
                .await
                .unwrap_or_else(|e| Err(SwapError::Interrupted(e.to_string())));

            match result {
                Ok(SwapOutcome::Completed(report)) => {
                    info!(
                        new_ctx = report.new_ctx,
                        confirmed = report.confirmed,
                        late_references = report.late_references,
                        "Live rule swap completed in {:?}",
                        report.elapsed
                    );
                    self.status.send_modify(|status| {
                        status.completed += 1;
                        status.last = Some(report);
                    });
                }
                Ok(SwapOutcome::Aborted) => info!("Live rule swap abandoned for shutdown"),
                Err(e) if e.is_fatal() => {
                    error!("Live rule swap failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Live rule swap failed, keeping the current ruleset: {}", e);
                    self.status.send_modify(|status| status.failed += 1);
                }
            }

            if shutdown {
                break;
            }
        }

        let completed: u64 = self.status.borrow().completed;
        info!("Live rule swap service stopped after {} swaps", completed);
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_while_disarmed_is_deferred() {
        let (trigger, mut rx) = ReloadTrigger::new();
        assert!(trigger.request());
        assert_eq!(rx.try_recv().unwrap(), ServiceMessage::Reload);

        trigger.disarm();
        assert!(!trigger.request());
        assert!(!trigger.request());
        assert!(trigger.has_pending());
        assert!(rx.try_recv().is_err());

        trigger.rearm();
        assert_eq!(rx.try_recv().unwrap(), ServiceMessage::Reload);
        assert!(rx.try_recv().is_err());
        assert!(!trigger.has_pending());
    }
}
