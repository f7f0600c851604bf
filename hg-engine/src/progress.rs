//! Progress Loop - Background Completion Driver
//!
//! The progress loop owns a [`Context`] on a blocking task and alternates
//! between two steps until asked to stop:
//!
//! 1. **Drain**: trigger completed operations one at a time, without
//!    waiting, for as long as each call finds something.
//! 2. **Block**: if no stop was requested, call progress with a bounded
//!    timeout so the task sleeps until network events arrive or the quantum
//!    elapses.
//!
//! The stop request is checked only after a drain pass, and one more drain
//! runs once it is seen. Anything completed before [`ProgressLoop::stop`] was
//! called is therefore triggered before the task exits. A blocking progress
//! call is never interrupted; stop latency is bounded by the quantum.
//!
//! Because the loop takes the context by value and only hands it back from
//! [`ProgressLoop::stop`], a context cannot be destroyed while its loop is
//! still running:
//!
//! ```compile_fail
//! use hg_engine::{Engine, InitOptions, OutputSink, ProgressLoop, DEFAULT_PROGRESS_TIMEOUT};
//!
//! # async fn demo() -> hg_engine::Result<()> {
//! let engine = Engine::init("mock+loopback", true, InitOptions::default())?;
//! let context = engine.create_context()?;
//! let progress = ProgressLoop::spawn(context, DEFAULT_PROGRESS_TIMEOUT, OutputSink::discard());
//! context.destroy()?; // the loop owns it
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Context;
use crate::error::{EngineError, Result};
use crate::output::OutputSink;

/// Bounded wait for one progress call.
pub const DEFAULT_PROGRESS_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle of a progress loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Running,
            1 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

/// What the loop did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// Progress calls made.
    pub iterations: u64,
    /// Operations triggered in total.
    pub triggered: u64,
    /// Operations triggered by the drain passes after stop was observed.
    pub final_drain: u64,
}

/// Handle to a running progress loop.
///
/// Dropping the handle without calling [`ProgressLoop::stop`] still cancels
/// the loop; the task then exits on its own and drops the context.
pub struct ProgressLoop {
    token: CancellationToken,
    state: Arc<AtomicU8>,
    task: Option<JoinHandle<Result<(Context, LoopReport)>>>,
}

impl ProgressLoop {
    /// Start driving `context` on a blocking task. Must be called from
    /// within a tokio runtime.
    pub fn spawn(context: Context, timeout: Duration, sink: OutputSink) -> Self {
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(LoopState::Running as u8));
        let task = {
            let token = token.clone();
            let state = state.clone();
            tokio::task::spawn_blocking(move || {
                let result = run(context, &token, &state, timeout, &sink);
                state.store(LoopState::Stopped as u8, Ordering::Release);
                result
            })
        };
        Self {
            token,
            state,
            task: Some(task),
        }
    }

    /// Token that stops the loop when cancelled. Completion callbacks may
    /// use it to end the loop from inside a trigger.
    pub fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request a stop and wait for the task to exit, then hand the context
    /// back for teardown.
    pub async fn stop(mut self) -> Result<(Context, LoopReport)> {
        self.token.cancel();
        debug!("Progress loop stop requested");
        let task = self
            .task
            .take()
            .ok_or_else(|| EngineError::Loop("progress task already joined".into()))?;
        match task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Loop(format!("progress task did not complete: {e}"))),
        }
    }
}

impl Drop for ProgressLoop {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn drain(context: &Context) -> Result<u64> {
    let mut total = 0;
    loop {
        let n = context.trigger(Duration::ZERO, 1)?;
        if n == 0 {
            return Ok(total);
        }
        total += u64::from(n);
    }
}

fn run(
    mut context: Context,
    token: &CancellationToken,
    state: &AtomicU8,
    timeout: Duration,
    sink: &OutputSink,
) -> Result<(Context, LoopReport)> {
    sink.line("network thread running");
    info!(context = context.id(), ?timeout, "Progress loop running");

    let mut report = LoopReport::default();
    let outcome = loop {
        match drain(&context) {
            Ok(n) => report.triggered += n,
            Err(e) => break Err(e),
        }

        // Callbacks may have requested the stop.
        if token.is_cancelled() {
            state.store(LoopState::Stopping as u8, Ordering::Release);
            match drain(&context) {
                Ok(n) => {
                    report.triggered += n;
                    report.final_drain += n;
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        }

        report.iterations += 1;
        if let Err(e) = context.progress(timeout) {
            break Err(e);
        }
    };

    match outcome {
        Ok(()) => {
            sink.line("network thread complete");
            info!(
                iterations = report.iterations,
                triggered = report.triggered,
                "Progress loop stopped"
            );
            Ok((context, report))
        }
        Err(e) => {
            error!("Progress loop aborted: {}", e);
            sink.line(format_args!("network thread failed: {e}"));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Operation;
    use crate::error::ErrorKind;
    use crate::options::InitOptions;
    use crate::plugin::{MockBehavior, MockPlugin, PluginRegistry};
    use crate::Engine;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counting_op(hits: &Arc<AtomicUsize>) -> Operation {
        let hits = hits.clone();
        Operation::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_stop_without_work() {
        let engine = Engine::init("mock+loopback", true, InitOptions::default()).unwrap();
        let context = engine.create_context().unwrap();
        let sink = OutputSink::memory();
        let progress = ProgressLoop::spawn(context, Duration::from_millis(20), sink.clone());

        let (context, report) = progress.stop().await.unwrap();
        assert_eq!(report.triggered, 0);
        context.destroy().unwrap();
        engine.finalize().unwrap();
        assert_eq!(
            sink.contents(),
            "network thread running\nnetwork thread complete\n"
        );
    }

    #[tokio::test]
    async fn test_ops_posted_before_spawn_are_triggered() {
        let engine = Engine::init("mock+loopback", true, InitOptions::default()).unwrap();
        let mut context = engine.create_context().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            context.post(counting_op(&hits)).unwrap();
        }

        let progress = ProgressLoop::spawn(context, Duration::from_millis(20), OutputSink::discard());
        let (context, report) = progress.stop().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(report.triggered, 10);
        assert_eq!(context.pending(), 0);
    }

    #[tokio::test]
    async fn test_callback_can_stop_loop() {
        let engine = Engine::init("mock+loopback", true, InitOptions::default()).unwrap();
        let context = engine.create_context().unwrap();
        let completer = context.completer();
        let progress = ProgressLoop::spawn(context, Duration::from_millis(20), OutputSink::discard());
        assert_eq!(progress.state(), LoopState::Running);

        let token = progress.stop_token();
        completer.complete(Operation::new(move |_| token.cancel()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !progress.is_finished() {
            assert!(Instant::now() < deadline, "loop did not exit");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(progress.state(), LoopState::Stopped);
        let (_, report) = progress.stop().await.unwrap();
        assert_eq!(report.triggered, 1);
    }

    #[tokio::test]
    async fn test_progress_failure_surfaces_loop_error() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(MockPlugin::with_behavior(MockBehavior {
            fail_progress_after: Some(1),
            ..Default::default()
        })));
        let engine =
            Engine::init_with_registry("mock+loopback", true, InitOptions::default(), &registry)
                .unwrap();
        let context = engine.create_context().unwrap();
        let sink = OutputSink::memory();
        let progress = ProgressLoop::spawn(context, Duration::from_millis(5), sink.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !progress.is_finished() {
            assert!(Instant::now() < deadline, "failing loop kept spinning");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = progress.stop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Loop);
        assert!(sink.contents().contains("network thread failed"));
    }
}
