//! Engine Statistics
//!
//! Lock-free counters updated from both the main flow and the progress
//! task. Everything uses relaxed atomics; a snapshot is a best-effort view,
//! not a consistent cut.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters for one engine instance.
#[derive(Default)]
pub struct EngineStats {
    pub init_time_ns: AtomicU64,
    pub contexts_created: AtomicU64,
    pub ops_posted: AtomicU64,
    pub ops_triggered: AtomicU64,
    pub trigger_calls: AtomicU64,
    pub progress_calls: AtomicU64,
    pub progress_timeouts: AtomicU64,
    pub progress_time_ns: AtomicU64,
    pub addresses_resolved: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_init(&self, duration: Duration) {
        self.init_time_ns
            .store(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_context_created(&self) {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_post(&self) {
        self.ops_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger(&self, triggered: u32) {
        self.trigger_calls.fetch_add(1, Ordering::Relaxed);
        self.ops_triggered
            .fetch_add(u64::from(triggered), Ordering::Relaxed);
    }

    pub fn record_progress(&self, duration: Duration, timed_out: bool) {
        self.progress_calls.fetch_add(1, Ordering::Relaxed);
        self.progress_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        if timed_out {
            self.progress_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_address_resolved(&self) {
        self.addresses_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let progress_calls = self.progress_calls.load(Ordering::Relaxed);
        let progress_time_ns = self.progress_time_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            init_ms: self.init_time_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            ops_posted: self.ops_posted.load(Ordering::Relaxed),
            ops_triggered: self.ops_triggered.load(Ordering::Relaxed),
            trigger_calls: self.trigger_calls.load(Ordering::Relaxed),
            progress_calls,
            progress_timeouts: self.progress_timeouts.load(Ordering::Relaxed),
            avg_progress_ms: if progress_calls == 0 {
                0.0
            } else {
                progress_time_ns as f64 / progress_calls as f64 / 1_000_000.0
            },
            addresses_resolved: self.addresses_resolved.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub init_ms: f64,
    pub contexts_created: u64,
    pub ops_posted: u64,
    pub ops_triggered: u64,
    pub trigger_calls: u64,
    pub progress_calls: u64,
    pub progress_timeouts: u64,
    pub avg_progress_ms: f64,
    pub addresses_resolved: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "engine stats:")?;
        writeln!(f, "\tinit time        = {:.3} ms", self.init_ms)?;
        writeln!(f, "\tcontexts created = {}", self.contexts_created)?;
        writeln!(f, "\tops posted       = {}", self.ops_posted)?;
        writeln!(
            f,
            "\tops triggered    = {} ({} trigger calls)",
            self.ops_triggered, self.trigger_calls
        )?;
        writeln!(
            f,
            "\tprogress calls   = {} ({} timeouts, avg {:.3} ms)",
            self.progress_calls, self.progress_timeouts, self.avg_progress_ms
        )?;
        write!(f, "\taddrs resolved   = {}", self.addresses_resolved)
    }
}

/// Records elapsed time into the init counter when dropped.
pub struct InitTimer<'a> {
    start: Instant,
    stats: &'a EngineStats,
}

impl<'a> InitTimer<'a> {
    pub fn new(stats: &'a EngineStats) -> Self {
        Self {
            start: Instant::now(),
            stats,
        }
    }
}

impl Drop for InitTimer<'_> {
    fn drop(&mut self) {
        self.stats.record_init(self.start.elapsed());
    }
}
