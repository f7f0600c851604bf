//! hg-engine - RPC Transport Engine Bootstrap
//!
//! Brings a network abstraction (NA) plugin up behind an [`Engine`], creates
//! a [`Context`] for asynchronous operations, drives completions from a
//! background [`ProgressLoop`], resolves the engine's own listening address,
//! and tears everything down in reverse order through the
//! [`ShutdownSequencer`].
//!
//! # Lifecycle
//! ```text
//! InitOptions ─► Engine ─► Context ─► ProgressLoop (background)
//!                  │
//!                  └─► self address ─► text (size, then fill)
//!
//! stop loop ─► join ─► destroy Context ─► finalize Engine
//! ```

pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod options;
pub mod output;
pub mod plugin;
pub mod progress;
pub mod shutdown;
pub mod stats;

pub use bootstrap::{run, RunConfig, RunOutcome};
pub use engine::{
    resolve_self, Address, Completer, Context, Engine, OpInfo, Operation, ProgressStatus,
    ResolvedAddress,
};
pub use error::{EngineError, ErrorKind, NaError, Result};
pub use options::{AddrFormat, ChecksumLevel, InitOptions, ProgressMode, TrafficClass};
pub use output::OutputSink;
pub use plugin::{NaPlugin, PluginRegistry, TransportSpec};
pub use progress::{LoopReport, LoopState, ProgressLoop, DEFAULT_PROGRESS_TIMEOUT};
pub use shutdown::{ShutdownReport, ShutdownSequencer};
pub use stats::StatsSnapshot;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the stderr tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Calling it again is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    if installed {
        info!("hg-engine v{}", env!("CARGO_PKG_VERSION"));
    }
}
