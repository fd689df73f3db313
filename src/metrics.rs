//! Periodic resource sampling of running containers.
//!
//! The runtime hands back its raw stats document; `parse_stats` turns it
//! into a `MetricsSample` the same way `docker stats` computes its columns.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dockyard_common::{ContainerStatus, Event, MetricsSample};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::orchestrator::Orchestrator;

fn u64_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

/// Derive cpu percent, memory and network counters from one raw snapshot.
pub fn parse_stats(container_id: &str, raw: &Value, timestamp: DateTime<Utc>) -> MetricsSample {
    let cpu_total = u64_at(raw, "/cpu_stats/cpu_usage/total_usage").unwrap_or(0);
    let cpu_prev = u64_at(raw, "/precpu_stats/cpu_usage/total_usage").unwrap_or(0);
    let system = u64_at(raw, "/cpu_stats/system_cpu_usage").unwrap_or(0);
    let system_prev = u64_at(raw, "/precpu_stats/system_cpu_usage").unwrap_or(0);
    let online_cpus = u64_at(raw, "/cpu_stats/online_cpus")
        .or_else(|| {
            raw.pointer("/cpu_stats/cpu_usage/percpu_usage")
                .and_then(Value::as_array)
                .map(|a| a.len() as u64)
        })
        .unwrap_or(1)
        .max(1);

    let cpu_delta = cpu_total.saturating_sub(cpu_prev);
    let system_delta = system.saturating_sub(system_prev);
    let cpu_percent = if system_delta > 0 && cpu_delta > 0 {
        (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
    } else {
        0.0
    };

    // Page cache is reclaimable; cgroup v1 reports it as `cache`, v2 as `inactive_file`.
    let usage = u64_at(raw, "/memory_stats/usage").unwrap_or(0);
    let cache = u64_at(raw, "/memory_stats/stats/inactive_file")
        .or_else(|| u64_at(raw, "/memory_stats/stats/cache"))
        .unwrap_or(0);
    let memory_limit_bytes = u64_at(raw, "/memory_stats/limit").unwrap_or(0);

    let (network_rx_bytes, network_tx_bytes) = raw
        .get("networks")
        .and_then(Value::as_object)
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), iface| {
                (
                    rx + u64_at(iface, "/rx_bytes").unwrap_or(0),
                    tx + u64_at(iface, "/tx_bytes").unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    MetricsSample {
        container_id: container_id.to_string(),
        timestamp,
        cpu_percent,
        memory_bytes: usage.saturating_sub(cache),
        memory_limit_bytes,
        network_rx_bytes,
        network_tx_bytes,
    }
}

/// Sample every running container once and prune old samples. Returns the
/// number of samples recorded. Per-container failures are logged and skipped.
pub async fn collect_once(orchestrator: &Orchestrator, retention: Duration) -> Result<usize> {
    let records = orchestrator
        .store()
        .call(|store| store.list_containers())
        .await?;

    let mut recorded = 0;
    for record in records
        .into_iter()
        .filter(|r| r.status == ContainerStatus::Running && !r.has_placeholder_runtime_id())
    {
        let raw = match orchestrator.runtime().stats(&record.runtime_id).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(container_id = %record.id, error = %e, "stats unavailable");
                continue;
            }
        };
        let sample = parse_stats(&record.id, &raw, Utc::now());
        let stored = sample.clone();
        orchestrator
            .store()
            .call(move |store| store.record_metrics(&stored))
            .await?;
        orchestrator.events().publish(Event::Metrics(sample));
        recorded += 1;
    }

    let cutoff = Utc::now() - chrono::Duration::from_std(retention)?;
    let pruned = orchestrator
        .store()
        .call(move |store| store.prune_metrics(cutoff))
        .await?;
    if pruned > 0 {
        debug!(pruned, "pruned old metrics samples");
    }
    Ok(recorded)
}

pub fn spawn_collector(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = collect_once(&orchestrator, retention).await {
                warn!(error = %e, "metrics collection failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::{harness, request};
    use dockyard_common::Topic;
    use serde_json::json;

    fn raw_stats() -> Value {
        json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 400_000_000u64 },
                "system_cpu_usage": 2_000_000_000u64,
                "online_cpus": 2
            },
            "precpu_stats": {
                "cpu_usage": { "total_usage": 200_000_000u64 },
                "system_cpu_usage": 1_000_000_000u64
            },
            "memory_stats": {
                "usage": 300 * 1024 * 1024,
                "limit": 2048u64 * 1024 * 1024,
                "stats": { "inactive_file": 100 * 1024 * 1024 }
            },
            "networks": {
                "eth0": { "rx_bytes": 1000, "tx_bytes": 500 },
                "eth1": { "rx_bytes": 24, "tx_bytes": 12 }
            }
        })
    }

    #[test]
    fn test_parse_stats() {
        let sample = parse_stats("c1", &raw_stats(), Utc::now());
        assert!((sample.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(sample.memory_bytes, 200 * 1024 * 1024);
        assert_eq!(sample.memory_limit_bytes, 2048 * 1024 * 1024);
        assert_eq!(sample.network_rx_bytes, 1024);
        assert_eq!(sample.network_tx_bytes, 512);
    }

    #[test]
    fn test_parse_empty_stats_is_zeroed() {
        let sample = parse_stats("c1", &json!({}), Utc::now());
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_bytes, 0);
        assert_eq!(sample.network_rx_bytes, 0);
    }

    #[tokio::test]
    async fn test_collect_samples_running_only() {
        let h = harness();
        h.runtime.set_stats(raw_stats());
        let running = h.orchestrator.create(request("hot"), None).await.unwrap();
        h.orchestrator.start(&running.id).await.unwrap();
        h.orchestrator.create(request("idle"), None).await.unwrap();
        let mut rx = h.events.subscribe(Topic::Container(running.id.clone()));

        let recorded = collect_once(&h.orchestrator, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(recorded, 1);
        assert!(matches!(rx.try_recv().unwrap(), Event::Metrics(_)));

        let history = h.orchestrator.metrics_history(&running.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        let items = h.orchestrator.get_all(true).await.unwrap();
        let hot = items.iter().find(|i| i.container.id == running.id).unwrap();
        assert!(hot.metrics.is_some());
    }

    #[tokio::test]
    async fn test_stats_failure_is_skipped() {
        let h = harness();
        let record = h.orchestrator.create(request("broken"), None).await.unwrap();
        h.orchestrator.start(&record.id).await.unwrap();
        h.runtime.fail_on("stats");
        assert_eq!(
            collect_once(&h.orchestrator, Duration::from_secs(60)).await.unwrap(),
            0
        );
    }
}
