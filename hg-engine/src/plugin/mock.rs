//! In-process loopback plugin.
//!
//! `mock+loopback` needs no network at all: posted operations complete
//! locally and progress just waits on the completion queue. The plugin can
//! be told to fail at specific points, which is how the engine's error paths
//! are exercised.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{NaAddr, NaClass, NaContext, NaInitInfo, NaPlugin};
use crate::engine::CompletionQueue;
use crate::error::NaError;

const PROTOCOLS: &[&str] = &["loopback"];

/// Failure points the mock plugin can be asked to trip.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub fail_init: bool,
    pub fail_self_addr: bool,
    pub fail_context: bool,
    /// Make `poll` fail once this many polls have succeeded.
    pub fail_progress_after: Option<u64>,
    /// Render addresses with an embedded NUL byte.
    pub corrupt_addr_text: bool,
}

pub struct MockPlugin {
    behavior: MockBehavior,
}

impl MockPlugin {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self { behavior }
    }
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl NaPlugin for MockPlugin {
    fn name(&self) -> &str {
        "mock"
    }

    fn protocols(&self) -> &[&str] {
        PROTOCOLS
    }

    fn initialize(&self, info: &NaInitInfo<'_>) -> Result<Box<dyn NaClass>, NaError> {
        if self.behavior.fail_init {
            return Err(NaError::Fault("mock init failure".into()));
        }
        let instance = next_instance_id();
        let host = info.spec.host.clone().unwrap_or_else(|| "localhost".into());
        debug!(instance, host = %host, listen = info.listen, "mock NA class up");
        Ok(Box::new(MockClass {
            protocol: info.spec.protocol.clone(),
            host,
            port: info.spec.port.map(u64::from).unwrap_or(instance),
            behavior: self.behavior.clone(),
        }))
    }
}

fn next_instance_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

struct MockClass {
    protocol: String,
    host: String,
    port: u64,
    behavior: MockBehavior,
}

impl NaClass for MockClass {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn addr_self(&self) -> Result<NaAddr, NaError> {
        if self.behavior.fail_self_addr {
            return Err(NaError::AddrNotAvailable("mock has no self address".into()));
        }
        Ok(NaAddr::new(format!(
            "mock+{}://{}:{}",
            self.protocol, self.host, self.port
        )))
    }

    fn addr_to_string(&self, addr: &NaAddr) -> Result<String, NaError> {
        if self.behavior.corrupt_addr_text {
            return Ok(format!("{}\0garbage", addr.uri()));
        }
        Ok(addr.uri().to_string())
    }

    fn context_create(&self) -> Result<Box<dyn NaContext>, NaError> {
        if self.behavior.fail_context {
            return Err(NaError::NoMemory("mock context allocation".into()));
        }
        Ok(Box::new(MockContext {
            polls: 0,
            fail_after: self.behavior.fail_progress_after,
        }))
    }
}

struct MockContext {
    polls: u64,
    fail_after: Option<u64>,
}

impl NaContext for MockContext {
    fn poll(&mut self, queue: &CompletionQueue, timeout: Duration) -> Result<(), NaError> {
        if self.fail_after.is_some_and(|n| self.polls >= n) {
            return Err(NaError::Fault(format!("mock poll failed after {} polls", self.polls)));
        }
        self.polls += 1;
        queue.wait(timeout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::NaInitOptions;
    use crate::plugin::TransportSpec;

    fn init(plugin: &MockPlugin, raw: &str) -> Result<Box<dyn NaClass>, NaError> {
        let spec = TransportSpec::parse(raw).unwrap();
        let options = NaInitOptions::default();
        plugin.initialize(&NaInitInfo {
            spec: &spec,
            listen: true,
            options: &options,
        })
    }

    #[test]
    fn test_self_address_uses_spec_host() {
        let class = init(&MockPlugin::new(), "mock+loopback://node7:99").unwrap();
        let addr = class.addr_self().unwrap();
        assert_eq!(addr.uri(), "mock+loopback://node7:99");
    }

    #[test]
    fn test_instances_differ() {
        let plugin = MockPlugin::new();
        let a = init(&plugin, "mock+loopback").unwrap().addr_self().unwrap();
        let b = init(&plugin, "mock+loopback").unwrap().addr_self().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fail_init() {
        let plugin = MockPlugin::with_behavior(MockBehavior {
            fail_init: true,
            ..Default::default()
        });
        assert!(matches!(init(&plugin, "mock+loopback"), Err(NaError::Fault(_))));
    }

    #[test]
    fn test_poll_failure_after_n() {
        let plugin = MockPlugin::with_behavior(MockBehavior {
            fail_progress_after: Some(2),
            ..Default::default()
        });
        let class = init(&plugin, "mock+loopback").unwrap();
        let mut ctx = class.context_create().unwrap();
        let queue = CompletionQueue::new();
        assert!(ctx.poll(&queue, Duration::ZERO).is_ok());
        assert!(ctx.poll(&queue, Duration::ZERO).is_ok());
        assert!(ctx.poll(&queue, Duration::ZERO).is_err());
    }
}
