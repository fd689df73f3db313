//! One-shot reconciliation: `dockyard reconcile`.

use anyhow::{Context, Result};
use dockyard::config::DockyardConfig;

pub async fn cmd_reconcile(config: DockyardConfig, json: bool) -> Result<()> {
    let (orchestrator, _runtime) = super::connect(&config)?;
    let report = orchestrator
        .reconcile()
        .await
        .context("Reconciliation failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if report.is_noop() {
        println!("Store and runtime agree. Nothing to do.");
    } else {
        println!("Reconciled:");
        println!("  recovered: {}", report.recovered);
        println!("  updated:   {}", report.updated);
        println!("  removed:   {}", report.removed);
    }
    Ok(())
}
