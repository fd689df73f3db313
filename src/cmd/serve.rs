//! API server command: `dockyard serve`.

use std::sync::Arc;

use anyhow::Result;
use dockyard::config::DockyardConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Buffer between the runtime event stream and the orchestrator.
const RUNTIME_EVENT_BUFFER: usize = 256;

pub async fn cmd_serve(
    mut config: DockyardConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    for problem in config.validate() {
        warn!(%problem, "configuration problem");
    }

    let (orchestrator, runtime) = super::connect(&config)?;
    if let Err(e) = orchestrator.runtime().ping().await {
        warn!(error = %e, "container runtime is not reachable yet");
    }

    let (tx, rx) = mpsc::channel(RUNTIME_EVENT_BUFFER);
    let _event_stream = runtime.spawn_event_stream(tx);
    let orchestrator = Arc::new(orchestrator.with_runtime_events(rx));

    match orchestrator.reconcile().await {
        Ok(report) if report.is_noop() => info!("startup reconciliation found no drift"),
        Ok(report) => info!(
            recovered = report.recovered,
            updated = report.updated,
            removed = report.removed,
            "startup reconciliation"
        ),
        Err(e) => warn!(error = %e, "startup reconciliation failed"),
    }

    let _loops = orchestrator.start_background();
    dockyard::server::start_server(&config, orchestrator).await
}
