// MongoDB sink - stores points as documents, one collection per measurement
//
// Document layout:
//   { measurement, tags: { VDC, ... }, fields: { ... }, timestamp }

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, error, info, warn};

use super::{PointSink, StorageError};
use crate::metrics::point::{FieldValue, Point, PointBatch};

/// MongoDB sink
pub struct MongoSink {
    /// MongoDB client for database operations
    client: Client,

    /// Database name where points are stored
    database_name: String,
}

impl MongoSink {
    /// Connects to MongoDB and verifies the connection
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI (e.g., "mongodb://localhost:27017")
    /// * `database_name` - Database holding the measurement collections
    pub async fn connect(connection_string: &str, database_name: &str) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(connection_string).await?;

        // Verify connection by listing databases (lightweight operation)
        match client.list_database_names(None, None).await {
            Ok(_) => info!("Successfully connected to MongoDB"),
            Err(e) => {
                warn!("MongoDB connection verification failed: {}", e);
                return Err(StorageError::MongoError(e));
            }
        }

        Ok(MongoSink::new(&client, database_name))
    }

    pub fn new(client: &Client, database_name: &str) -> Self {
        MongoSink {
            client: client.clone(),
            database_name: database_name.to_string(),
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.database_name).collection(name)
    }

    /// Creates the time-series index on a measurement collection
    ///
    /// Compound `tags.VDC` + `timestamp` (descending) index for querying one
    /// zone over time. Optional; run with `--create-indexes`.
    pub async fn create_indexes(&self, collection_name: &str) -> Result<(), StorageError> {
        info!("Creating indexes for collection '{}'", collection_name);

        let index = IndexModel::builder()
            .keys(doc! {
                "tags.VDC": 1,
                "timestamp": -1
            })
            .options(IndexOptions::builder().name("vdc_timestamp_idx".to_string()).build())
            .build();

        match self.collection(collection_name).create_index(index, None).await {
            Ok(_) => {
                info!(
                    "Successfully created indexes for collection '{}'",
                    collection_name
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to create indexes for collection '{}': {}",
                    collection_name, e
                );
                Err(StorageError::MongoError(e))
            }
        }
    }
}

#[async_trait]
impl PointSink for MongoSink {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn write(&self, batch: &PointBatch) -> Result<(), StorageError> {
        let documents: Vec<Document> = batch.points.iter().map(to_document).collect();
        if documents.is_empty() {
            return Ok(());
        }

        let result = self
            .collection(&batch.measurement)
            .insert_many(documents, None)
            .await?;

        debug!(
            "Inserted {} document(s) into collection '{}'",
            result.inserted_ids.len(),
            batch.measurement
        );
        Ok(())
    }
}

/// Converts a point into its stored document
pub fn to_document(point: &Point) -> Document {
    let tags: Document = point
        .tags()
        .iter()
        .map(|(key, value)| (key.clone(), Bson::String(value.clone())))
        .collect();

    let fields: Document = point
        .fields()
        .iter()
        .map(|(key, value)| {
            let value = match value {
                FieldValue::Float(number) => Bson::Double(*number),
                FieldValue::Text(text) => Bson::String(text.clone()),
            };
            (key.clone(), value)
        })
        .collect();

    doc! {
        "measurement": point.measurement(),
        "tags": tags,
        "fields": fields,
        "timestamp": bson::DateTime::from_chrono(point.timestamp()),
    }
}
