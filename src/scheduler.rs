// Scheduler module - runs one polling loop per configured metric kind
//
// This module implements the core scheduling logic using Tokio tasks.
// Each metric kind runs on its own independent interval as specified in the
// settings file.
//
// # Architecture
// - Each poll task runs in its own async task
// - A cycle visits every connection sequentially, then sleeps the interval
// - Failures for one connection or one batch never stop the loop
// - Shutdown is cooperative: checked after each cycle and while sleeping

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, Settings};
use crate::metrics::{create_collector, MetricCollector, MetricKind};
use crate::source::Connection;
use crate::storage::{write_batch_safe, PointSink};

/// One configured metric kind bound to its collector
pub struct PollTask {
    pub kind: MetricKind,

    /// Base measurement the collector writes under
    pub measurement: String,

    pub interval: Duration,

    pub collector: Arc<dyn MetricCollector>,
}

impl PollTask {
    /// Builds one poll task per metric kind listed in the settings
    pub fn from_settings(settings: &Settings) -> Result<Vec<PollTask>, ConfigError> {
        Ok(settings
            .metric_kinds()?
            .into_iter()
            .map(|(kind, metric)| {
                let measurement = metric.measurement.as_deref().unwrap_or(kind.name());
                PollTask {
                    kind,
                    measurement: measurement.to_string(),
                    interval: Duration::from_secs(metric.interval),
                    collector: create_collector(kind, measurement, &settings.temp_dir),
                }
            })
            .collect())
    }
}

/// Outcome of one cycle of one poll task
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Connections that returned data
    pub connections_ok: usize,

    /// Connections skipped because collection failed
    pub connections_failed: usize,

    pub points_written: usize,

    /// Batches dropped after the sink retry
    pub batches_dropped: usize,
}

/// Metric scheduler that manages the polling tasks
///
/// Holds the shared connections (and with them each connection's session),
/// the sink and the process-wide shutdown token.
pub struct MetricScheduler {
    connections: Vec<Arc<Connection>>,

    sink: Arc<dyn PointSink>,

    shutdown: CancellationToken,
}

impl MetricScheduler {
    /// Creates a new MetricScheduler instance
    ///
    /// # Arguments
    /// * `connections` - Every configured ECS endpoint
    /// * `sink` - Destination for point batches
    /// * `shutdown` - Cancelled when the process should stop
    pub fn new(
        connections: Vec<Connection>,
        sink: Arc<dyn PointSink>,
        shutdown: CancellationToken,
    ) -> Self {
        MetricScheduler {
            connections: connections.into_iter().map(Arc::new).collect(),
            sink,
            shutdown,
        }
    }

    /// Starts one task per poll task and waits until all of them stop
    ///
    /// Tasks only stop once the shutdown token is cancelled.
    pub async fn start(&self, tasks: Vec<PollTask>) {
        info!(
            "Starting metric scheduler for {} connection(s)",
            self.connections.len()
        );

        let mut handles = Vec::new();

        for task in tasks {
            info!(
                "Scheduling metric '{}' with interval of {}s, measurement: '{}'",
                task.kind,
                task.interval.as_secs(),
                task.measurement
            );

            let connections = self.connections.clone();
            let sink = Arc::clone(&self.sink);
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                Self::run_poll_task(task, connections, sink, shutdown).await;
            });

            handles.push(handle);
        }

        info!("Successfully started {} polling task(s)", handles.len());

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Polling task panicked: {}", e);
            }
        }

        info!("All polling tasks have stopped");
    }

    /// Runs a single poll task until shutdown
    ///
    /// This is the core loop for each metric kind. It:
    /// 1. Runs one full cycle over every connection
    /// 2. Stops if shutdown was requested during the cycle
    /// 3. Sleeps the configured interval, waking early only on shutdown
    /// 4. Repeats
    async fn run_poll_task(
        task: PollTask,
        connections: Vec<Arc<Connection>>,
        sink: Arc<dyn PointSink>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Starting polling loop for metric '{}' (every {}s)",
            task.kind,
            task.interval.as_secs()
        );

        loop {
            let report = Self::run_cycle(&task, &connections, sink.as_ref()).await;
            info!(
                "Metric '{}' cycle: {} connection(s) ok, {} failed, {} point(s) written, {} batch(es) dropped",
                task.kind,
                report.connections_ok,
                report.connections_failed,
                report.points_written,
                report.batches_dropped
            );

            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(task.interval) => {}
            }
        }

        info!("Polling loop for metric '{}' stopped", task.kind);
    }

    /// Runs one cycle of a poll task over every connection in turn
    ///
    /// Collection errors skip the connection for this cycle; sink errors drop
    /// the batch. Neither is returned.
    pub async fn run_cycle(
        task: &PollTask,
        connections: &[Arc<Connection>],
        sink: &dyn PointSink,
    ) -> CycleReport {
        let mut report = CycleReport::default();

        for connection in connections {
            let batches = match task.collector.collect(connection, Utc::now()).await {
                Ok(batches) => batches,
                Err(e) => {
                    error!(
                        "Failed to collect metric '{}' from host {}: {}",
                        task.kind,
                        connection.host(),
                        e
                    );
                    report.connections_failed += 1;
                    continue;
                }
            };

            report.connections_ok += 1;

            if batches.is_empty() {
                warn!(
                    "Metric '{}' returned no points for host {}",
                    task.kind,
                    connection.host()
                );
            }

            for batch in &batches {
                if write_batch_safe(sink, batch).await {
                    report.points_written += batch.len();
                } else {
                    report.batches_dropped += 1;
                }
            }
        }

        report
    }

    /// Performs a one-time cycle of every poll task (useful for testing)
    ///
    /// # Returns
    /// Number of poll tasks whose cycle collected from every connection
    pub async fn collect_once(&self, tasks: &[PollTask]) -> usize {
        info!("Running one-time metric collection");

        let mut success_count = 0;

        for task in tasks {
            info!("Collecting metric '{}'", task.kind);

            let report = Self::run_cycle(task, &self.connections, self.sink.as_ref()).await;
            if report.connections_failed == 0 {
                success_count += 1;
            }
        }

        info!(
            "One-time collection complete: {}/{} metrics succeeded",
            success_count,
            tasks.len()
        );

        success_count
    }
}
