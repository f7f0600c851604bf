//! Engine module - the process-wide transport handle
//!
//! An [`Engine`] is created from a transport spec, a listen flag and an
//! [`InitOptions`] record. It owns the NA class (plus the shared-memory
//! class when `auto_sm` is on), the unexpected-request pool, and the
//! statistics. Contexts and addresses derived from it keep it alive and are
//! counted, so [`Engine::finalize`] can refuse to tear down while any of
//! them remain.
//!
//! Acquisition order is Engine → Context → Address; teardown runs in
//! reverse.

pub mod address;
pub mod context;
pub mod request_pool;

pub use address::{resolve_self, Address, ResolvedAddress};
pub use context::{CompletionQueue, Completer, Context, OpInfo, Operation, ProgressStatus};
pub use request_pool::{RequestBuffer, RequestPool, RequestPoolStats};

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::options::InitOptions;
use crate::plugin::{NaClass, NaInitInfo, PluginRegistry, TransportSpec};
use crate::stats::{EngineStats, InitTimer, StatsSnapshot};

/// State shared between an engine and every handle derived from it.
pub(crate) struct EngineShared {
    pub(crate) id: u64,
    pub(crate) spec: TransportSpec,
    pub(crate) listen: bool,
    pub(crate) options: InitOptions,
    pub(crate) na: Box<dyn NaClass>,
    pub(crate) sm: Option<Box<dyn NaClass>>,
    pub(crate) host_id: Option<i64>,
    pub(crate) request_pool: Mutex<RequestPool>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) live_contexts: AtomicUsize,
    pub(crate) live_addresses: AtomicUsize,
    next_context_id: AtomicU32,
}

/// Handle to an initialized transport engine.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Initialize an engine using the built-in plugins.
    pub fn init(spec: &str, listen: bool, options: InitOptions) -> Result<Self> {
        Self::init_with_registry(spec, listen, options, &PluginRegistry::with_builtins())
    }

    /// Initialize an engine, looking plugins up in `registry`.
    ///
    /// Fails with [`EngineError::Init`] if the transport spec is malformed, the plugin
    /// is unavailable, the plugin cannot come up, or the initial request
    /// buffers cannot be posted.
    pub fn init_with_registry(
        spec: &str,
        listen: bool,
        options: InitOptions,
        registry: &PluginRegistry,
    ) -> Result<Self> {
        static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

        let stats = EngineStats::new();
        let timer = InitTimer::new(&stats);

        let parsed = TransportSpec::parse(spec).map_err(|e| EngineError::init(spec, e))?;
        let plugin = registry.resolve(&parsed).map_err(|e| EngineError::init(spec, e))?;
        info!(spec, listen, plugin = plugin.name(), "Initializing engine");

        let na = plugin
            .initialize(&NaInitInfo {
                spec: &parsed,
                listen,
                options: &options.na,
            })
            .map_err(|e| EngineError::init(spec, e))?;

        let (sm, host_id) = if options.auto_sm {
            let sm_spec = match &options.sm_info_string {
                Some(info) => format!("na+sm://{info}"),
                None => "na+sm".to_string(),
            };
            let sm_parsed =
                TransportSpec::parse(&sm_spec).map_err(|e| EngineError::init(spec, e))?;
            let sm_plugin = registry
                .resolve(&sm_parsed)
                .map_err(|e| EngineError::init(spec, format!("auto_sm: {e}")))?;
            let sm = sm_plugin
                .initialize(&NaInitInfo {
                    spec: &sm_parsed,
                    listen,
                    options: &options.na,
                })
                .map_err(|e| EngineError::init(spec, format!("auto_sm: {e}")))?;
            // SAFETY: gethostid has no preconditions and only reads host state.
            let host_id = unsafe { libc::gethostid() } as i64;
            debug!(sm_spec = %sm_spec, host_id, "auto_sm class up");
            (Some(sm), Some(host_id))
        } else {
            (None, None)
        };

        let mut pool = RequestPool::new(
            options.effective_max_unexpected_size(),
            options.effective_request_post_incr(),
        );
        if listen {
            pool.post(options.effective_request_post_init())
                .map_err(|e| EngineError::init(spec, e))?;
        }

        drop(timer);
        let shared = EngineShared {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            spec: parsed,
            listen,
            options,
            na,
            sm,
            host_id,
            request_pool: Mutex::new(pool),
            stats,
            live_contexts: AtomicUsize::new(0),
            live_addresses: AtomicUsize::new(0),
            next_context_id: AtomicU32::new(0),
        };
        info!(engine = shared.id, "Engine initialized");
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn spec(&self) -> &TransportSpec {
        &self.shared.spec
    }

    pub fn listening(&self) -> bool {
        self.shared.listen
    }

    pub fn options(&self) -> &InitOptions {
        &self.shared.options
    }

    /// Host id recorded for shared-memory routing, when `auto_sm` is on.
    pub fn host_id(&self) -> Option<i64> {
        self.shared.host_id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn request_pool_stats(&self) -> RequestPoolStats {
        self.pool().get_stats()
    }

    /// Take a posted unexpected-request buffer. `None` means the pool is
    /// exhausted and cannot grow.
    pub fn take_request_buffer(&self) -> Option<RequestBuffer> {
        self.pool().take()
    }

    pub fn repost_request_buffer(&self, buf: RequestBuffer) {
        self.pool().repost(buf)
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, RequestPool> {
        self.shared
            .request_pool
            .lock()
            .expect("request pool lock poisoned")
    }

    /// Create a new context. Fails with [`EngineError::Context`] past
    /// `max_contexts` or if the plugin cannot create one.
    pub fn create_context(&self) -> Result<Context> {
        let max = self.shared.options.effective_max_contexts();
        let live = self.shared.live_contexts.fetch_add(1, Ordering::AcqRel);
        if live >= max {
            self.shared.live_contexts.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::Context(format!(
                "max_contexts ({max}) already in use"
            )));
        }

        let na = match self.shared.na.context_create() {
            Ok(na) => na,
            Err(e) => {
                self.shared.live_contexts.fetch_sub(1, Ordering::AcqRel);
                return Err(EngineError::Context(e.to_string()));
            }
        };

        let id = self.shared.next_context_id.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.record_context_created();
        info!(engine = self.shared.id, context = id, "Context created");
        Ok(Context::new(id, self.shared.clone(), na))
    }

    /// Finalize the engine, releasing all plugin resources.
    ///
    /// Every context must have been destroyed and every address released
    /// first; otherwise this fails with [`EngineError::Busy`] and the
    /// resources stay alive until the stragglers drop.
    pub fn finalize(self) -> Result<StatsSnapshot> {
        let contexts = self.shared.live_contexts.load(Ordering::Acquire);
        let addresses = self.shared.live_addresses.load(Ordering::Acquire);
        if contexts > 0 || addresses > 0 {
            return Err(EngineError::Busy {
                contexts,
                addresses,
                pending: 0,
            });
        }

        let id = self.shared.id;
        let shared = Arc::try_unwrap(self.shared).map_err(|_| {
            EngineError::Consistency("engine still referenced after all handles released".into())
        })?;
        let stats = shared.stats.snapshot();
        drop(shared);
        info!(engine = id, "Engine finalized");
        Ok(stats)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("spec", &self.shared.spec.to_string())
            .field("listen", &self.shared.listen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::plugin::{MockBehavior, MockPlugin};

    #[test]
    fn test_init_mock() {
        let engine = Engine::init("mock+loopback", true, InitOptions::default()).unwrap();
        assert!(engine.listening());
        assert_eq!(engine.spec().protocol, "loopback");
        assert!(engine.host_id().is_none());
        engine.finalize().unwrap();
    }

    #[test]
    fn test_listen_posts_default_pool() {
        let engine = Engine::init("mock+loopback", true, InitOptions::default()).unwrap();
        let stats = engine.request_pool_stats();
        assert_eq!(stats.posted, 512);
        assert_eq!(stats.total_allocations, 512);
    }

    #[test]
    fn test_no_listen_posts_nothing() {
        let engine = Engine::init("mock+loopback", false, InitOptions::default()).unwrap();
        assert_eq!(engine.request_pool_stats().posted, 0);
    }

    #[test]
    fn test_pool_growth_disabled_by_negative_increment() {
        let options = InitOptions::new()
            .with_request_post_init(1)
            .with_request_post_incr(-1);
        let engine = Engine::init("mock+loopback", true, options).unwrap();
        let buf = engine.take_request_buffer().unwrap();
        assert!(engine.take_request_buffer().is_none());
        engine.repost_request_buffer(buf);
        assert!(engine.take_request_buffer().is_some());
    }

    #[test]
    fn test_unpostable_request_count_is_init_error() {
        let options = InitOptions::new().with_request_post_init(u32::MAX);
        let err = Engine::init("mock+loopback", true, options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Init);
        assert!(err.to_string().contains("request buffers"));
    }

    #[test]
    fn test_unexpected_size_sets_buffer_capacity() {
        let options = InitOptions::new()
            .with_request_post_init(1)
            .with_max_unexpected_size(256);
        let engine = Engine::init("mock+loopback", true, options).unwrap();
        let buf = engine.take_request_buffer().unwrap();
        assert!(buf.capacity() >= 256);
        assert!(buf.capacity() < 4096);
    }

    #[test]
    fn test_unknown_plugin() {
        let err = Engine::init("bogus+proto", true, InitOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Init);
    }

    #[test]
    fn test_malformed_spec() {
        let err = Engine::init("a+b+c", true, InitOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Init);
    }

    #[test]
    fn test_plugin_init_failure() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(MockPlugin::with_behavior(MockBehavior {
            fail_init: true,
            ..Default::default()
        })));
        let err = Engine::init_with_registry("mock+loopback", true, InitOptions::default(), &registry)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Init);
    }

    #[test]
    fn test_auto_sm_needs_sm_plugin() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(MockPlugin::new()));
        let options = InitOptions::new().with_auto_sm(true);
        let err = Engine::init_with_registry("mock+loopback", false, options, &registry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Init);
        assert!(err.to_string().contains("auto_sm"));
    }

    #[test]
    fn test_auto_sm_records_host_id() {
        let options = InitOptions::new().with_auto_sm(true);
        let engine = Engine::init("mock+loopback", false, options).unwrap();
        assert!(engine.host_id().is_some());
        engine.finalize().unwrap();
    }

    #[test]
    fn test_max_contexts() {
        let engine = Engine::init("mock+loopback", false, InitOptions::default()).unwrap();
        let ctx = engine.create_context().unwrap();
        let err = engine.create_context().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Context);

        ctx.destroy().unwrap();
        let again = engine.create_context().unwrap();
        assert_eq!(again.id(), 1);
    }

    #[test]
    fn test_context_create_failure() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(MockPlugin::with_behavior(MockBehavior {
            fail_context: true,
            ..Default::default()
        })));
        let engine =
            Engine::init_with_registry("mock+loopback", false, InitOptions::default(), &registry)
                .unwrap();
        let err = engine.create_context().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Context);
        // The failed attempt must not leak a context slot.
        engine.finalize().unwrap();
    }

    #[test]
    fn test_finalize_with_live_context_is_busy() {
        let engine = Engine::init("mock+loopback", false, InitOptions::default()).unwrap();
        let _ctx = engine.create_context().unwrap();
        let err = engine.finalize().unwrap_err();
        assert!(matches!(err, EngineError::Busy { contexts: 1, .. }));
    }

    #[test]
    fn test_finalize_reports_stats() {
        let engine = Engine::init("mock+loopback", false, InitOptions::default()).unwrap();
        let ctx = engine.create_context().unwrap();
        ctx.destroy().unwrap();
        let stats = engine.finalize().unwrap();
        assert_eq!(stats.contexts_created, 1);
    }
}
