//! Bootstrap driver: bring an engine up, report its address, shut down.
//!
//! This is the full lifecycle in one call: print the parameters, init the
//! engine, create a context, start the progress loop, give it a moment to
//! settle, resolve the self address, then run the shutdown sequence.
//! The first failing step ends the run.

use std::time::Duration;
use tracing::info;

use crate::engine::{resolve_self, Engine};
use crate::error::Result;
use crate::options::InitOptions;
use crate::output::OutputSink;
use crate::plugin::PluginRegistry;
use crate::progress::{ProgressLoop, DEFAULT_PROGRESS_TIMEOUT};
use crate::shutdown::{ShutdownReport, ShutdownSequencer};

/// Delay between starting the progress loop and resolving the address.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

/// Inputs for one bootstrap run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub spec: String,
    pub listen: bool,
    pub options: InitOptions,
    pub settle: Duration,
    pub progress_timeout: Duration,
}

impl RunConfig {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            listen: true,
            options: InitOptions::default(),
            settle: DEFAULT_SETTLE,
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT,
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub address: String,
    pub shutdown: ShutdownReport,
}

/// Run the lifecycle with the built-in plugins.
pub async fn run(config: &RunConfig, sink: &OutputSink) -> Result<RunOutcome> {
    run_with_registry(config, sink, &PluginRegistry::with_builtins()).await
}

pub async fn run_with_registry(
    config: &RunConfig,
    sink: &OutputSink,
    registry: &PluginRegistry,
) -> Result<RunOutcome> {
    sink.line(format_args!("hg-init on {}", config.spec));
    sink.line(format_args!("\tauto_sm mode = {}", config.options.auto_sm));
    sink.line(format_args!("\tlisten mode = {}", config.listen));
    sink.line(format_args!(
        "\tsubnet: {}",
        config.options.na.ip_subnet.as_deref().unwrap_or("<none>")
    ));
    sink.line(format_args!(
        "\tmax message size: unexpected = {}, expected = {}",
        config.options.effective_max_unexpected_size(),
        config.options.effective_max_expected_size()
    ));

    let engine = Engine::init_with_registry(
        &config.spec,
        config.listen,
        config.options.clone(),
        registry,
    )?;
    if config.listen {
        let pool = engine.request_pool_stats();
        sink.line(format_args!("\tposted request buffers = {}", pool.posted));
    }

    let context = engine.create_context()?;
    let progress = ProgressLoop::spawn(context, config.progress_timeout, sink.clone());
    if !config.settle.is_zero() {
        tokio::time::sleep(config.settle).await;
    }

    let resolved = resolve_self(&engine)?;
    sink.line("");
    sink.line(format_args!("requested addr buf size: {}", resolved.buf_size));
    sink.line(format_args!("listening at: {}", resolved.text));
    sink.line("");

    let shutdown = ShutdownSequencer::new(sink.clone())
        .run(engine, progress)
        .await?;
    info!(address = %resolved.text, "Bootstrap run complete");

    Ok(RunOutcome {
        address: resolved.text,
        shutdown,
    })
}
