// InfluxDB sink - writes point batches through the 1.x HTTP API
//
// Points are encoded as line protocol with second precision:
//   measurement,tag=value field=1.5,status="Good" 1700000000

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

use super::{PointSink, StorageError};
use crate::metrics::point::{FieldValue, Point, PointBatch};

/// InfluxDB 1.x sink
pub struct InfluxSink {
    client: Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl InfluxSink {
    /// Creates a sink writing to `database` at `url` (e.g. `http://localhost:8086`)
    pub fn new(
        url: &str,
        database: &str,
        user: Option<String>,
        password: Option<String>,
    ) -> Result<Self, StorageError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(InfluxSink {
            client,
            url: url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            user,
            password,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    /// Creates the target database if it does not exist yet
    ///
    /// `CREATE DATABASE` is a no-op for an existing database, so this is safe
    /// to run on every start.
    pub async fn ensure_database(&self) -> Result<(), StorageError> {
        info!("Ensuring InfluxDB database '{}' exists", self.database);

        let statement = format!("CREATE DATABASE \"{}\"", self.database.replace('"', "\\\""));
        let request = self
            .client
            .post(format!("{}/query", self.url))
            .query(&[("q", statement.as_str())]);

        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    fn name(&self) -> &str {
        "influx"
    }

    async fn write(&self, batch: &PointBatch) -> Result<(), StorageError> {
        let body = encode_batch(batch);
        if body.is_empty() {
            debug!("Batch '{}' has no encodable points", batch.measurement);
            return Ok(());
        }

        let request = self
            .client
            .post(format!("{}/write", self.url))
            .query(&[("db", self.database.as_str()), ("precision", "s")])
            .body(body);

        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Encodes every encodable point of a batch, one line each
pub fn encode_batch(batch: &PointBatch) -> String {
    batch
        .points
        .iter()
        .filter_map(encode_point)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Encodes one point; `None` when no field survives encoding
pub fn encode_point(point: &Point) -> Option<String> {
    let mut fields = Vec::with_capacity(point.fields().len());
    for (key, value) in point.fields() {
        let encoded = match value {
            FieldValue::Float(number) if number.is_finite() => number.to_string(),
            FieldValue::Float(_) => continue,
            FieldValue::Text(text) => format!("\"{}\"", escape_string(text)),
        };
        fields.push(format!("{}={}", escape_key(key), encoded));
    }

    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(point.measurement());
    for (key, value) in point.tags() {
        // Empty tag values are rejected by the server
        if value.is_empty() {
            continue;
        }
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }
    let _ = write!(line, " {} {}", fields.join(","), point.timestamp().timestamp());

    Some(line)
}

fn escape_measurement(name: &str) -> String {
    escape(name, &[',', ' '])
}

fn escape_key(key: &str) -> String {
    escape(key, &[',', '=', ' '])
}

fn escape_string(text: &str) -> String {
    escape(text, &['"', '\\'])
}

fn escape(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        // Line protocol has no escape for line breaks
        let c = if c == '\n' || c == '\r' { ' ' } else { c };
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
