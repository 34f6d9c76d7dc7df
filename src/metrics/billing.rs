// Billing collector - per-bucket usage for every namespace
//
// Each cycle walks namespaces -> buckets -> bucket billing info. Every billing
// body is staged to a uniquely named file under the temp directory, read back
// and normalized, and the file is removed afterwards. A failure on one bucket
// or namespace skips only that bucket or namespace; an authentication failure
// ends the walk for the connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::normalize::{normalize, Normalized};
use super::point::PointBatch;
use super::{zone_tags, CollectError, MetricCollector, MetricKind};
use crate::source::{self, Connection, SourceRequest};

pub const NAMESPACES_PATH: &str = "/object/namespaces";

pub const BUCKETS_PATH: &str = "/object/bucket";

/// Billing scalars that stay text even when they look numeric
pub const TEXT_FIELDS: &[&str] = &["namespace", "name", "vpool_id"];

pub const NAMESPACE_TAG: &str = "Namespace";

pub const BUCKET_TAG: &str = "Bucket";

/// Size unit requested for billing totals
const SIZE_UNIT: &str = "KB";

pub struct BillingCollector {
    measurement: String,
    temp_dir: PathBuf,
}

impl BillingCollector {
    pub fn new(measurement: &str, temp_dir: &Path) -> Self {
        BillingCollector {
            measurement: measurement.to_string(),
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    async fn list_namespaces(&self, connection: &Connection) -> Result<Vec<String>, CollectError> {
        let tree = source::fetch(connection, &SourceRequest::new(NAMESPACES_PATH)).await?;
        names(&tree, "namespace", &["name", "id"])
    }

    async fn list_buckets(
        &self,
        connection: &Connection,
        namespace: &str,
    ) -> Result<Vec<String>, CollectError> {
        let request = SourceRequest::new(BUCKETS_PATH).with_query("namespace", namespace);
        let tree = source::fetch(connection, &request).await?;
        names(&tree, "object_bucket", &["name"])
    }

    async fn bucket_billing(
        &self,
        connection: &Connection,
        namespace: &str,
        bucket: &str,
        now: DateTime<Utc>,
    ) -> Result<Normalized, CollectError> {
        let request = SourceRequest::new(format!(
            "/object/billing/buckets/{}/{}/info",
            namespace, bucket
        ))
        .with_query("sizeunit", SIZE_UNIT);

        let body = source::fetch(connection, &request).await?;
        let staged = self.stage(&body).await?;

        let mut tags = zone_tags(connection);
        tags.insert(NAMESPACE_TAG.to_string(), namespace.to_string());
        tags.insert(BUCKET_TAG.to_string(), bucket.to_string());

        normalize(
            &staged,
            &MetricKind::Billing.layout(),
            &self.measurement,
            &tags,
            now,
        )
    }

    /// Writes a payload to a unique file, reads it back and removes the file
    async fn stage(&self, body: &Value) -> Result<Value, CollectError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let path = self.temp_dir.join(format!("{}.json", Uuid::new_v4()));
        let bytes = serde_json::to_vec(body)
            .map_err(|e| CollectError::MalformedResponse(format!("billing payload: {}", e)))?;
        tokio::fs::write(&path, bytes).await?;
        debug!("Staged billing payload to {}", path.display());

        let read_back = tokio::fs::read(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove staged file {}: {}", path.display(), e);
        }

        serde_json::from_slice(&read_back?)
            .map_err(|e| CollectError::MalformedResponse(format!("staged billing payload: {}", e)))
    }
}

#[async_trait]
impl MetricCollector for BillingCollector {
    fn name(&self) -> &str {
        MetricKind::Billing.name()
    }

    fn measurement(&self) -> &str {
        &self.measurement
    }

    async fn collect(
        &self,
        connection: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>, CollectError> {
        let mut out = Normalized::default();

        for namespace in self.list_namespaces(connection).await? {
            let buckets = match self.list_buckets(connection, &namespace).await {
                Ok(buckets) => buckets,
                Err(e @ CollectError::AuthenticationFailed { .. }) => return Err(e),
                Err(e) => {
                    warn!("Skipping namespace '{}' on host {}: {}", namespace, connection.host(), e);
                    continue;
                }
            };

            for bucket in buckets {
                match self.bucket_billing(connection, &namespace, &bucket, now).await {
                    Ok(normalized) => out.extend(normalized),
                    Err(e @ CollectError::AuthenticationFailed { .. }) => return Err(e),
                    Err(e) => warn!(
                        "Skipping bucket '{}/{}' on host {}: {}",
                        namespace,
                        bucket,
                        connection.host(),
                        e
                    ),
                }
            }
        }

        debug!(
            "Billing on host {} produced {} point(s)",
            connection.host(),
            out.point_count()
        );

        Ok(out.into_batches(&self.measurement))
    }
}

/// Reads `tree[list_key][*]` and takes the first present identity key of each item
fn names(tree: &Value, list_key: &str, id_keys: &[&str]) -> Result<Vec<String>, CollectError> {
    let items = tree
        .get(list_key)
        .and_then(Value::as_array)
        .ok_or_else(|| CollectError::MalformedResponse(format!("response has no '{}' list", list_key)))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            id_keys
                .iter()
                .find_map(|key| item.get(*key).and_then(Value::as_str))
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect())
}
