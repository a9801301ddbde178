//! Metrics collection utilities for Norx
//!
//! Counters are registered by name and owner (usually a worker thread name).
//! Registering the same pair twice hands back the same handle, so a worker
//! context rebuilt by a live swap keeps counting where the old one stopped.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a counter's samples are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Monotonic sum
    Plain,
    /// Running sum with a sample count, reported as an average
    Average,
    /// Largest sample seen
    Maximum,
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKind::Plain => write!(f, "plain"),
            CounterKind::Average => write!(f, "avg"),
            CounterKind::Maximum => write!(f, "max"),
        }
    }
}

#[derive(Debug, Default)]
struct CounterValue {
    value: AtomicU64,
    samples: AtomicU64,
}

/// Cheap, cloneable handle to one registered counter
#[derive(Debug, Clone)]
pub struct CounterHandle {
    kind: CounterKind,
    inner: Arc<CounterValue>,
}

impl CounterHandle {
    /// Add one
    pub fn increment(&self) {
        self.record(1);
    }

    /// Record a sample according to the counter kind
    pub fn record(&self, sample: u64) {
        match self.kind {
            CounterKind::Plain => {
                self.inner.value.fetch_add(sample, Ordering::Relaxed);
            }
            CounterKind::Average => {
                self.inner.value.fetch_add(sample, Ordering::Relaxed);
                self.inner.samples.fetch_add(1, Ordering::Relaxed);
            }
            CounterKind::Maximum => {
                self.inner.value.fetch_max(sample, Ordering::Relaxed);
            }
        }
    }

    /// Current value; averages are rounded down
    pub fn get(&self) -> u64 {
        let value: u64 = self.inner.value.load(Ordering::Relaxed);
        match self.kind {
            CounterKind::Average => {
                let samples: u64 = self.inner.samples.load(Ordering::Relaxed);
                if samples == 0 {
                    0
                } else {
                    value / samples
                }
            }
            _ => value,
        }
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }
}

#[derive(Debug)]
struct CounterEntry {
    name: String,
    owner: String,
    handle: CounterHandle,
}

/// Registry of named counters
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: Mutex<Vec<CounterEntry>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) the counter `name` owned by `owner`
    pub fn register_counter(&self, name: &str, kind: CounterKind, owner: &str) -> CounterHandle {
        let mut counters = self.counters.lock();
        if let Some(entry) = counters.iter().find(|e| e.name == name && e.owner == owner) {
            return entry.handle.clone();
        }

        let handle: CounterHandle = CounterHandle {
            kind,
            inner: Arc::new(CounterValue::default()),
        };
        counters.push(CounterEntry {
            name: name.to_string(),
            owner: owner.to_string(),
            handle: handle.clone(),
        });
        handle
    }

    /// Value of one owner's counter
    pub fn value(&self, name: &str, owner: &str) -> Option<u64> {
        self.counters
            .lock()
            .iter()
            .find(|e| e.name == name && e.owner == owner)
            .map(|e| e.handle.get())
    }

    /// Sum of a counter across all owners
    pub fn total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.handle.get())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }

    /// Format all counters, one `owner name (kind): value` line each
    pub fn format(&self) -> String {
        self.counters
            .lock()
            .iter()
            .map(|e| format!("{} {} ({}): {}", e.owner, e.name, e.handle.kind, e.handle.get()))
            .collect::<Vec<String>>()
            .join("\n")
    }
}

/// Metric timer for measuring execution time
pub struct MetricTimer {
    /// Start time
    start: Instant,
    /// Counter receiving the elapsed microseconds
    counter: CounterHandle,
}

impl MetricTimer {
    /// Create a new metric timer
    pub fn new(counter: CounterHandle) -> Self {
        Self {
            start: Instant::now(),
            counter,
        }
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration: Duration = self.start.elapsed();
        self.counter.record(duration.as_micros() as u64);
    }
}
