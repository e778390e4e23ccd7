// agentd — local control-plane server multiplexing AI-CLI agent processes.
// See src/lib.rs for the module map; this binary only wires CLI parsing,
// logging initialization, and graceful shutdown around `agentd::build_runtime`.

use anyhow::{Context, Result};
use agentd::cli::{self, CliOutcome};
use agentd::config::Config;
use agentd::{http, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let overrides = match cli::parse() {
        CliOutcome::Handled => return Ok(()),
        CliOutcome::Serve(overrides) => overrides,
    };

    Config::ensure_config_exists();
    let config = overrides.apply(Config::from_env());

    let _logging_guard = logging::init(&config.logging.level, config.logging.file, &config.data_dir);

    tracing::info!(version = agentd::config::VERSION, "starting agentd");
    tracing::debug!(
        bind_addr = %config.bind_addr,
        projects_dir = %config.projects_dir.display(),
        data_dir = %config.data_dir.display(),
        relay_url = ?config.relay_url,
        "effective configuration"
    );

    let bind_addr = config.bind_addr;
    let runtime = agentd::build_runtime(config).await?;
    let supervisor = runtime.supervisor.clone();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut serve_handle = tokio::spawn(http::serve(bind_addr, runtime.state, shutdown_rx));

    // Bind failure is the one exit code that matters (spec.md §6); if the
    // server task finishes before we ever get a Ctrl-C, that's a bind
    // failure (or an early crash), so propagate it as a hard error.
    tokio::select! {
        result = &mut serve_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("local transport failed to start"),
                Err(e) => Err(e).context("local transport task panicked"),
            };
        }
        ctrl_c = tokio::signal::ctrl_c() => {
            ctrl_c?;
        }
    }

    tracing::info!("shutdown requested, draining agent processes");
    supervisor.drain().await;
    let _ = shutdown_tx.send(());

    match serve_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "local transport exited with error"),
        Err(e) => tracing::error!(error = %e, "local transport task panicked"),
    }

    tracing::info!("shutdown complete");
    Ok(())
}
