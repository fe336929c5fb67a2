//! Operation Statistics
//!
//! Lock-free counters behind `_stats`. Each operation kind keeps a total
//! plus per-second and per-minute rings; writers only touch atomics, so the
//! request path never takes a stats lock. Ring slots are stamped with their
//! window so stale slots reset lazily on the next write or read.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Index,
    Search,
    Delete,
    Patch,
}

struct Slot {
    window: AtomicU64,
    count: AtomicU64,
    time_ns: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            window: AtomicU64::new(u64::MAX),
            count: AtomicU64::new(0),
            time_ns: AtomicU64::new(0),
        }
    }

    fn record(&self, window: u64, elapsed_ns: u64) {
        if self.window.swap(window, Ordering::Relaxed) != window {
            self.count.store(0, Ordering::Relaxed);
            self.time_ns.store(0, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.time_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    fn read(&self, window: u64) -> (u64, u64) {
        if self.window.load(Ordering::Relaxed) == window {
            (
                self.count.load(Ordering::Relaxed),
                self.time_ns.load(Ordering::Relaxed),
            )
        } else {
            (0, 0)
        }
    }
}

pub struct OpCounter {
    total: AtomicU64,
    total_time_ns: AtomicU64,
    seconds: [Slot; 60],
    minutes: [Slot; 60],
}

impl OpCounter {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            total_time_ns: AtomicU64::new(0),
            seconds: std::array::from_fn(|_| Slot::new()),
            minutes: std::array::from_fn(|_| Slot::new()),
        }
    }

    fn record(&self, now_secs: u64, elapsed: Duration) {
        let elapsed_ns = elapsed.as_nanos() as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_time_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.seconds[(now_secs % 60) as usize].record(now_secs, elapsed_ns);
        let minute = now_secs / 60;
        self.minutes[(minute % 60) as usize].record(minute, elapsed_ns);
    }

    /// Count and time over the trailing `window_secs` seconds (max 60).
    fn window(&self, now_secs: u64, window_secs: u64) -> (u64, u64) {
        let mut count = 0;
        let mut time_ns = 0;
        for i in 0..window_secs.min(60) {
            let Some(second) = now_secs.checked_sub(i) else {
                break;
            };
            let (c, t) = self.seconds[(second % 60) as usize].read(second);
            count += c;
            time_ns += t;
        }
        (count, time_ns)
    }

    fn totals(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.total_time_ns.load(Ordering::Relaxed),
        )
    }
}

pub struct Stats {
    pub index: OpCounter,
    pub search: OpCounter,
    pub delete: OpCounter,
    pub patch: OpCounter,
    pub http_clients: AtomicUsize,
    pub binary_clients: AtomicUsize,
    pub total_clients_served: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Stats {
    pub fn new() -> Self {
        Self {
            index: OpCounter::new(),
            search: OpCounter::new(),
            delete: OpCounter::new(),
            patch: OpCounter::new(),
            http_clients: AtomicUsize::new(0),
            binary_clients: AtomicUsize::new(0),
            total_clients_served: AtomicU64::new(0),
        }
    }

    fn counter(&self, kind: OpKind) -> &OpCounter {
        match kind {
            OpKind::Index => &self.index,
            OpKind::Search => &self.search,
            OpKind::Delete => &self.delete,
            OpKind::Patch => &self.patch,
        }
    }

    pub fn record(&self, kind: OpKind, elapsed: Duration) {
        self.counter(kind).record(now_secs(), elapsed);
    }

    /// Totals since boot, per operation kind.
    pub fn totals_json(&self) -> Value {
        let op = |counter: &OpCounter| {
            let (count, time_ns) = counter.totals();
            json!({"count": count, "time_ns": time_ns})
        };
        json!({
            "index": op(&self.index),
            "search": op(&self.search),
            "delete": op(&self.delete),
            "patch": op(&self.patch),
        })
    }

    /// Counts over a trailing window, `window_secs` clamped to the ring.
    pub fn window_json(&self, window_secs: u64) -> Value {
        let now = now_secs();
        let op = |counter: &OpCounter| {
            let (count, time_ns) = counter.window(now, window_secs);
            json!({"count": count, "time_ns": time_ns})
        };
        json!({
            "window_secs": window_secs.min(60),
            "index": op(&self.index),
            "search": op(&self.search),
            "delete": op(&self.delete),
            "patch": op(&self.patch),
        })
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
