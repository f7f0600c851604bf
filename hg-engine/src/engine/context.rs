//! Contexts and the completion queue.
//!
//! A [`Context`] is one stream of asynchronous operations bound to an
//! engine. Operations are handed to the NA layer with [`Context::post`];
//! once the network finishes them they sit in the context's
//! [`CompletionQueue`] until [`Context::trigger`] runs their callbacks.
//! [`Context::progress`] is the blocking half: it waits, up to a timeout,
//! for the NA layer to produce new completions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::EngineShared;
use crate::error::{EngineError, Result};
use crate::options::ProgressMode;
use crate::plugin::NaContext;

/// Information handed to an operation's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub id: u64,
}

type Callback = Box<dyn FnOnce(OpInfo) + Send + 'static>;

/// An asynchronous operation with its completion callback.
pub struct Operation {
    id: u64,
    callback: Callback,
}

impl Operation {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(OpInfo) + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn run(self) {
        (self.callback)(OpInfo { id: self.id })
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("id", &self.id).finish()
    }
}

/// Operations that have completed at the NA layer and await trigger.
pub struct CompletionQueue {
    ready: Mutex<VecDeque<Operation>>,
    signal: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    /// Mark an operation complete and wake any waiter.
    pub fn complete(&self, op: Operation) {
        self.ready
            .lock()
            .expect("completion queue lock poisoned")
            .push_back(op);
        self.signal.notify_all();
    }

    fn pop(&self) -> Option<Operation> {
        self.ready
            .lock()
            .expect("completion queue lock poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.ready
            .lock()
            .expect("completion queue lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block up to `timeout` until the queue is non-empty. Returns whether
    /// anything is ready.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.ready.lock().expect("completion queue lock poisoned");
        if !guard.is_empty() || timeout.is_zero() {
            return !guard.is_empty();
        }
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .expect("completion queue lock poisoned");
        !guard.is_empty()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle for completing operations from any thread, including
/// from inside a completion callback.
#[derive(Clone)]
pub struct Completer {
    queue: Arc<CompletionQueue>,
}

impl Completer {
    pub fn complete(&self, op: Operation) {
        self.queue.complete(op);
    }
}

/// Outcome of one [`Context::progress`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Completions are ready to trigger.
    Progressed,
    /// Nothing arrived before the timeout. This is normal.
    TimedOut,
}

/// One stream of asynchronous operations on an engine.
///
/// Dropping a context releases its slot on the engine; [`Context::destroy`]
/// does the same but first refuses if completions are still waiting.
pub struct Context {
    id: u32,
    engine: Arc<EngineShared>,
    na: Box<dyn NaContext>,
    queue: Arc<CompletionQueue>,
}

impl Context {
    pub(crate) fn new(id: u32, engine: Arc<EngineShared>, na: Box<dyn NaContext>) -> Self {
        Self {
            id,
            engine,
            na,
            queue: Arc::new(CompletionQueue::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hand an operation to the NA layer.
    pub fn post(&mut self, op: Operation) -> Result<()> {
        debug!(context = self.id, op = op.id(), "Posting operation");
        self.na
            .post(op, &self.queue)
            .map_err(|e| EngineError::Loop(format!("post failed on context {}: {e}", self.id)))?;
        self.engine.stats.record_post();
        Ok(())
    }

    pub fn completer(&self) -> Completer {
        Completer {
            queue: self.queue.clone(),
        }
    }

    /// Completed operations not yet triggered.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run the callbacks of up to `max_count` completed operations, waiting
    /// up to `timeout` for the first one. Returns how many were triggered;
    /// zero means there was no work, which is not an error.
    pub fn trigger(&self, timeout: Duration, max_count: u32) -> Result<u32> {
        let mut count = 0;
        while count < max_count {
            match self.queue.pop() {
                Some(op) => {
                    op.run();
                    count += 1;
                }
                None if count == 0 && !timeout.is_zero() => {
                    if !self.queue.wait(timeout) {
                        break;
                    }
                }
                None => break,
            }
        }
        self.engine.stats.record_trigger(count);
        Ok(count)
    }

    /// Wait up to `timeout` for network events. Returns immediately if
    /// completions are already waiting, and never blocks in
    /// [`ProgressMode::NoBlock`].
    pub fn progress(&mut self, timeout: Duration) -> Result<ProgressStatus> {
        let start = Instant::now();
        if !self.queue.is_empty() {
            self.engine.stats.record_progress(start.elapsed(), false);
            return Ok(ProgressStatus::Progressed);
        }

        let timeout = match self.engine.options.na.progress_mode {
            ProgressMode::Block => timeout,
            ProgressMode::NoBlock => Duration::ZERO,
        };
        self.na.poll(&self.queue, timeout).map_err(|e| {
            EngineError::Loop(format!("progress failed on context {}: {e}", self.id))
        })?;

        let status = if self.queue.is_empty() {
            ProgressStatus::TimedOut
        } else {
            ProgressStatus::Progressed
        };
        self.engine
            .stats
            .record_progress(start.elapsed(), status == ProgressStatus::TimedOut);
        Ok(status)
    }

    /// Destroy the context. Fails with [`EngineError::Busy`] if completed
    /// operations have not been triggered yet.
    pub fn destroy(self) -> Result<()> {
        let pending = self.pending();
        if pending > 0 {
            return Err(EngineError::Busy {
                contexts: 0,
                addresses: 0,
                pending,
            });
        }
        info!(context = self.id, "Context destroyed");
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.engine.live_contexts.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .finish()
    }
}
