// Dashboard collector - one parameterized collector for every single-endpoint kind
//
// Fetches the kind's endpoint through the authenticated adapter and hands the
// response to the normalizer with the kind's layout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::normalize::normalize;
use super::point::PointBatch;
use super::{zone_tags, CollectError, MetricCollector, MetricKind};
use crate::source::{self, Connection, SourceRequest};

/// Collector for a metric kind served by a single endpoint
pub struct DashboardCollector {
    kind: MetricKind,
    measurement: String,
}

impl DashboardCollector {
    pub fn new(kind: MetricKind, measurement: &str) -> Self {
        DashboardCollector {
            kind,
            measurement: measurement.to_string(),
        }
    }
}

#[async_trait]
impl MetricCollector for DashboardCollector {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn measurement(&self) -> &str {
        &self.measurement
    }

    async fn collect(
        &self,
        connection: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>, CollectError> {
        let request = SourceRequest::new(self.kind.path());
        let tree = source::fetch(connection, &request).await?;

        let normalized = normalize(
            &tree,
            &self.kind.layout(),
            &self.measurement,
            &zone_tags(connection),
            now,
        )?;

        debug!(
            "{} on host {} normalized into {} point(s)",
            self.kind,
            connection.host(),
            normalized.point_count()
        );

        Ok(normalized.into_batches(&self.measurement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::adapter::tests::{connection_with, ScriptedSource};
    use crate::source::FetchOutcome;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_capacity_batches() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1")],
            vec![FetchOutcome::Data(json!({
                "usedCapacity": "12345",
                "history": [{"t": "100", "bytes": "5"}, {"t": "100", "errors": "0"}, {"t": "200", "bytes": "7"}]
            }))],
        ));
        let connection = connection_with(source);
        let collector = DashboardCollector::new(MetricKind::Capacity, "Capacity");

        let batches = collector.collect(&connection, now()).await.unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].measurement, "Capacity");
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].measurement, "CapacityMetrics");
        assert_eq!(batches[1].len(), 2);
        assert!(batches
            .iter()
            .flat_map(|b| &b.points)
            .all(|p| p.tags()["VDC"] == "ecs1.example.com"));
    }

    #[tokio::test]
    async fn test_local_zone_drops_transaction_errors() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1")],
            vec![FetchOutcome::Data(json!({
                "numNodes": "4",
                "transactionErrors": {"all": "3"},
                "transactionErrorsCurrent": "9",
                "_links": {"self": {"href": "/x"}}
            }))],
        ));
        let connection = connection_with(source);
        let collector = DashboardCollector::new(MetricKind::LocalZone, "Zone");

        let batches = collector.collect(&connection, now()).await.unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].measurement, "Zone");
        let fields = batches[0].points[0].fields();
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["numNodes"]);
    }

    #[tokio::test]
    async fn test_missing_instances_is_malformed() {
        let source = Arc::new(ScriptedSource::new(
            vec![Some("t1")],
            vec![FetchOutcome::Data(json!({"_embedded": {}}))],
        ));
        let connection = connection_with(source);
        let collector = DashboardCollector::new(MetricKind::LocalZoneDisks, "LocalZoneDisks");

        let result = collector.collect(&connection, now()).await;

        assert!(matches!(result, Err(CollectError::MalformedResponse(_))));
    }
}
