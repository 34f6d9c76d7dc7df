// Metrics module - defines the architecture for ECS metric collection
//
// Every metric kind is described by a static descriptor (endpoint path and
// response layout). One parameterized collector serves all dashboard kinds;
// namespace billing has its own collector because it walks namespaces and
// buckets. The scheduler only ever sees the `MetricCollector` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::source::Connection;

pub mod billing;
pub mod dashboard;
pub mod normalize;
pub mod point;

use normalize::{EntityLayout, Layout};
use point::{PointBatch, Tags};

/// Tag key carrying the zone identity on every point
pub const ZONE_TAG: &str = "VDC";

/// Errors that can occur while collecting one metric kind from one connection
///
/// None of these are fatal: the poller logs them and moves on to the next
/// connection.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Authentication failed for host {host}")]
    AuthenticationFailed { host: String },

    #[error("Source unavailable on host {host}: {reason}")]
    SourceUnavailable { host: String, reason: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Failed to stage payload: {0}")]
    Staging(#[from] std::io::Error),
}

/// Returned when a configured metric kind name is not known
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown metric kind '{0}'")]
pub struct UnknownMetricKind(pub String);

/// The closed set of metric kinds this collector can poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    LocalZone,
    Capacity,
    LocalZoneReplication,
    LocalZoneReplicationFailure,
    LocalZoneReplicationBootstrap,
    LocalZoneDisks,
    LocalZoneNodes,
    Billing,
}

const LINKS: &[&str] = &["_links"];

const LINKS_AND_TRANSACTION_ERRORS: &[&str] = &[
    "_links",
    "transactionErrors",
    "transactionErrorsSummary",
    "transactionErrorsCurrent",
];

const INSTANCES: &[&str] = &["_embedded", "_instances"];

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::LocalZone,
        MetricKind::Capacity,
        MetricKind::LocalZoneReplication,
        MetricKind::LocalZoneReplicationFailure,
        MetricKind::LocalZoneReplicationBootstrap,
        MetricKind::LocalZoneDisks,
        MetricKind::LocalZoneNodes,
        MetricKind::Billing,
    ];

    /// Identifier used in configuration and as the default measurement name
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::LocalZone => "LocalZone",
            MetricKind::Capacity => "Capacity",
            MetricKind::LocalZoneReplication => "LocalZoneReplication",
            MetricKind::LocalZoneReplicationFailure => "LocalZoneReplicationFailure",
            MetricKind::LocalZoneReplicationBootstrap => "LocalZoneReplicationBootstrap",
            MetricKind::LocalZoneDisks => "LocalZoneDisks",
            MetricKind::LocalZoneNodes => "LocalZoneNodes",
            MetricKind::Billing => "Billing",
        }
    }

    /// Endpoint path polled for this kind
    ///
    /// For `Billing` this is the namespace listing the walk starts from.
    pub fn path(self) -> &'static str {
        match self {
            MetricKind::LocalZone => "/dashboard/zones/localzone",
            MetricKind::Capacity => "/object/capacity.json",
            MetricKind::LocalZoneReplication => "/dashboard/zones/localzone/replicationgroups",
            MetricKind::LocalZoneReplicationFailure => "/dashboard/zones/localzone/rglinksFailed",
            MetricKind::LocalZoneReplicationBootstrap => {
                "/dashboard/zones/localzone/rglinksBootstrap"
            }
            MetricKind::LocalZoneDisks => "/dashboard/zones/localzone/disks",
            MetricKind::LocalZoneNodes => "/dashboard/zones/localzone/nodes",
            MetricKind::Billing => billing::NAMESPACES_PATH,
        }
    }

    /// Response layout used by the normalizer
    pub fn layout(self) -> Layout {
        let entities = |id_field, tag_key| {
            Some(EntityLayout {
                path: INSTANCES,
                id_field,
                tag_key,
            })
        };

        match self {
            MetricKind::LocalZone => Layout {
                dropped_fields: LINKS_AND_TRANSACTION_ERRORS,
                ..Layout::FLAT
            },
            MetricKind::Capacity => Layout::FLAT,
            MetricKind::LocalZoneReplication => Layout {
                entities: entities("name", "ReplicationGroupID"),
                dropped_fields: LINKS,
                text_fields: &[],
            },
            MetricKind::LocalZoneReplicationFailure | MetricKind::LocalZoneReplicationBootstrap => {
                Layout {
                    entities: entities("rgName", "ReplicationGroupID"),
                    dropped_fields: LINKS,
                    text_fields: &[],
                }
            }
            MetricKind::LocalZoneDisks => Layout {
                entities: entities("displayName", "DiskID"),
                dropped_fields: LINKS,
                text_fields: &[],
            },
            MetricKind::LocalZoneNodes => Layout {
                entities: entities("displayName", "NodeID"),
                dropped_fields: LINKS_AND_TRANSACTION_ERRORS,
                text_fields: &[],
            },
            MetricKind::Billing => Layout {
                entities: None,
                dropped_fields: LINKS,
                text_fields: billing::TEXT_FIELDS,
            },
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = UnknownMetricKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownMetricKind(s.to_string()))
    }
}

/// Core trait that all metric collectors must implement.
///
/// A collector knows how to fetch one metric kind from one connection and turn
/// the response into point batches. Collectors are stateless between cycles;
/// all mutable state lives in the connection's session.
#[async_trait]
pub trait MetricCollector: Send + Sync {
    /// Returns the metric kind name. Used for logging and identification.
    fn name(&self) -> &str;

    /// Base measurement the batches are written under
    fn measurement(&self) -> &str;

    /// Collects one cycle of data from a connection.
    ///
    /// # Arguments
    /// * `connection` - Endpoint to fetch from, with its shared session
    /// * `now` - Wall-clock time of this cycle, used for scalar points
    ///
    /// # Returns
    /// * `Ok(Vec<PointBatch>)` - One batch per non-empty measurement family
    /// * `Err(CollectError)` - This connection produced no data this cycle
    async fn collect(
        &self,
        connection: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>, CollectError>;
}

/// Base tags for every point collected from a connection
pub fn zone_tags(connection: &Connection) -> Tags {
    let mut tags = Tags::new();
    tags.insert(ZONE_TAG.to_string(), connection.zone().to_string());
    tags
}

/// Creates the collector bound to a metric kind.
///
/// # Arguments
/// * `kind` - Metric kind to collect
/// * `measurement` - Base measurement name
/// * `temp_dir` - Staging directory for billing payloads
pub fn create_collector(
    kind: MetricKind,
    measurement: &str,
    temp_dir: &Path,
) -> Arc<dyn MetricCollector> {
    match kind {
        MetricKind::Billing => Arc::new(billing::BillingCollector::new(measurement, temp_dir)),
        _ => Arc::new(dashboard::DashboardCollector::new(kind, measurement)),
    }
}
