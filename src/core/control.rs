//! Engine-wide control flags

use std::sync::atomic::{AtomicU8, Ordering};

/// Graceful stop: finish in-flight work, then exit
pub const STOP: u8 = 0x01;
/// Exit as soon as possible
pub const KILL: u8 = 0x02;

/// Global shutdown flags, checked by workers and at every swap polling point
#[derive(Debug, Default)]
pub struct EngineControl {
    flags: AtomicU8,
}

impl EngineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flags.fetch_or(STOP, Ordering::SeqCst);
    }

    pub fn kill(&self) {
        self.flags.fetch_or(KILL, Ordering::SeqCst);
    }

    /// Any shutdown bit is set
    pub fn is_shutdown(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & (STOP | KILL) != 0
    }

    pub fn is_killed(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & KILL != 0
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_and_kill() {
        let control: EngineControl = EngineControl::new();
        assert!(!control.is_shutdown());

        control.stop();
        assert!(control.is_shutdown());
        assert!(!control.is_killed());

        control.kill();
        assert_eq!(control.flags(), STOP | KILL);
    }
}
