// Storage module - hands point batches to the configured metrics database
//
// This module is responsible for:
// 1. Defining the write-only `PointSink` capability the pollers depend on
// 2. Retrying a failed write once before dropping the batch
// 3. Providing the InfluxDB and MongoDB backends

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::metrics::point::PointBatch;

pub mod influx;
pub mod mongo;

pub use influx::InfluxSink;
pub use mongo::MongoSink;

/// Errors that can occur during a sink write
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("MongoDB operation failed: {0}")]
    MongoError(#[from] mongodb::error::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Write-only destination for point batches
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Writes every point of one batch
    async fn write(&self, batch: &PointBatch) -> Result<(), StorageError>;
}

/// Writes a batch with a single retry on failure
///
/// This method never returns an error - it logs failures and continues, so a
/// failing sink never stops a poller. The batch is dropped after the retry.
///
/// # Returns
/// `true` when the batch was written
pub async fn write_batch_safe(sink: &dyn PointSink, batch: &PointBatch) -> bool {
    const MAX_RETRIES: u32 = 1;

    if batch.is_empty() {
        return true;
    }

    for attempt in 0..=MAX_RETRIES {
        match sink.write(batch).await {
            Ok(()) => {
                if attempt > 0 {
                    info!(
                        "Successfully wrote {} batch after {} retry(ies)",
                        batch.measurement, attempt
                    );
                } else {
                    debug!(
                        "Wrote {} point(s) to {} measurement '{}'",
                        batch.len(),
                        sink.name(),
                        batch.measurement
                    );
                }
                return true;
            }
            Err(e) => {
                if attempt < MAX_RETRIES {
                    error!(
                        "Failed to write {} batch (attempt {}): {}. Retrying...",
                        batch.measurement,
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                } else {
                    error!(
                        "Failed to write {} batch after {} attempts: {}. Dropping {} point(s).",
                        batch.measurement,
                        attempt + 1,
                        e,
                        batch.len()
                    );
                }
            }
        }
    }

    false
}
