use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use realtime_hub::{
    CleanupCoordinator, CoordinatorConfig, HostEvent, HostSignals, HubConfig, Multiplexer,
    WriteTracker,
};
use realtime_transport::LocalTransport;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod script;
mod session;
mod telemetry;

use script::{parse_line, Command};
use session::Session;

#[derive(Debug, Parser)]
#[command(
    name = "realtime-sim",
    author,
    version,
    about = "Drive the realtime subscription hub against an in-memory transport"
)]
struct Cli {
    /// Tracing filter directive.
    #[arg(long, env = "REALTIME_SIM_LOG", default_value = "info")]
    log_filter: String,

    /// Read commands from this file instead of stdin.
    #[arg(long, env = "REALTIME_SIM_SCRIPT")]
    script: Option<PathBuf>,

    /// Start with the host focused.
    #[arg(long)]
    focused: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let hub_config = HubConfig::from_env();
    let coordinator_config = CoordinatorConfig::from_env();
    info!(
        deferred_teardown_ms = hub_config.deferred_teardown.as_millis() as u64,
        retry_base_ms = hub_config.backoff.base.as_millis() as u64,
        retry_max_ms = hub_config.backoff.max.as_millis() as u64,
        backoff = ?hub_config.backoff.policy,
        stale_after_ms = hub_config.stale_after.as_millis() as u64,
        stale_policy = ?hub_config.stale_policy,
        hidden_grace_ms = coordinator_config.hidden_grace.as_millis() as u64,
        "starting realtime-sim"
    );

    let transport = LocalTransport::new();
    let writes = WriteTracker::new();
    let host = HostSignals::new(cli.focused);
    let hub = Multiplexer::new(Arc::new(transport.clone()), writes.clone(), hub_config)?;
    let coordinator = CleanupCoordinator::new(
        hub,
        Arc::new(host.clone()),
        Arc::new(writes),
        coordinator_config,
    )?;

    let (host_tx, host_rx) = mpsc::channel(16);
    let listener = coordinator.spawn_host_listener(host_rx);
    let mut session = Session::new(transport, host, coordinator);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &cli.script {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening script {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading commands")? else {
                    break;
                };
                match parse_line(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = session.apply(command).await {
                            warn!(error = %err, line = %line, "command failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, line = %line, "ignoring malformed command"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    // leaving the session is an unload from the hub's point of view
    host_tx
        .send(HostEvent::Unload)
        .await
        .context("host listener stopped early")?;
    drop(host_tx);
    listener.await.context("host listener panicked")?;
    info!("realtime-sim stopped");
    Ok(())
}
