//! Orderly teardown.
//!
//! Shutdown always runs in this order:
//!
//! 1. signal the progress loop to stop,
//! 2. wait for its task to exit (up to one progress quantum plus a drain),
//! 3. destroy the context the loop hands back,
//! 4. finalize the engine.
//!
//! Steps 3 and 4 cannot move ahead of step 2: the context only comes back
//! out of [`ProgressLoop::stop`], and [`Engine::finalize`] refuses while any
//! context is alive.

use std::time::{Duration, Instant};
use tracing::info;

use crate::engine::Engine;
use crate::error::Result;
use crate::output::OutputSink;
use crate::progress::{LoopReport, ProgressLoop};
use crate::stats::StatsSnapshot;

/// What a completed shutdown observed.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub loop_report: LoopReport,
    /// Time from the stop signal until the progress task had exited.
    pub stop_latency: Duration,
    pub stats: StatsSnapshot,
}

pub struct ShutdownSequencer {
    sink: OutputSink,
}

impl ShutdownSequencer {
    pub fn new(sink: OutputSink) -> Self {
        Self { sink }
    }

    /// Tear down `progress` and `engine` in the fixed order. Any failure
    /// aborts the sequence at that step.
    pub async fn run(&self, engine: Engine, progress: ProgressLoop) -> Result<ShutdownReport> {
        info!("Stopping progress loop");
        let started = Instant::now();
        let (context, loop_report) = progress.stop().await?;
        let stop_latency = started.elapsed();
        info!(?stop_latency, "Progress loop joined");

        self.sink.line("destroy context and finalize engine");
        context.destroy()?;

        let print_stats = engine.options().stats;
        let stats = engine.finalize()?;
        if print_stats {
            self.sink.line(&stats);
        }

        Ok(ShutdownReport {
            loop_report,
            stop_latency,
            stats,
        })
    }
}
