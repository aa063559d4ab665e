use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
///
/// Metrics must be registered before use; updates to unknown names are ignored.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
}

/// Monotonically increasing counter.
struct Counter {
    value: AtomicU64,
    help: String,
}

/// Value that can go up or down.
struct Gauge {
    value: AtomicI64,
    help: String,
}

// A panic while holding the lock cannot leave an atomic half-written.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        write(&self.counters)
            .entry(name.to_string())
            .or_insert_with(|| Counter {
                value: AtomicU64::new(0),
                help: help.to_string(),
            });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| Gauge {
                value: AtomicI64::new(0),
                help: help.to_string(),
            });
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        if let Some(c) = read(&self.counters).get(name) {
            c.value.fetch_add(val, Ordering::Relaxed);
        }
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    /// Current value of a counter, `None` if it was never registered.
    pub fn counter_value(&self, name: &str) -> Option<u64> {
        read(&self.counters)
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
    }

    /// Current value of a gauge, `None` if it was never registered.
    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        read(&self.gauges)
            .get(name)
            .map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        for (name, counter) in read(&self.counters).iter() {
            output.push_str(&format!("# HELP {} {}\n", name, counter.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                counter.value.load(Ordering::Relaxed)
            ));
        }

        for (name, gauge) in read(&self.gauges).iter() {
            output.push_str(&format!("# HELP {} {}\n", name, gauge.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                gauge.value.load(Ordering::Relaxed)
            ));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
