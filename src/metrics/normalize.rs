// Normalizer - turns a raw ECS JSON tree into time-indexed point batches
//
// Every top-level field of a response (or of each entity in a collection) is
// classified once into a `RawValue` and then folded uniformly:
// - Scalar        -> one point per entity at the current timestamp
// - DetailSeries  -> one `<base>Metrics` point per distinct sample timestamp
// - SummaryStat   -> one `<base>Summary` point per distinct min/max timestamp,
//                    plus the current timestamp for `avg`
// - Unrecognized  -> skipped

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::point::{from_epoch_seconds, parse_number, FieldValue, Fields, Point, PointBatch, Tags};
use super::CollectError;

/// Suffix of the measurement holding detail-series points
pub const METRICS_SUFFIX: &str = "Metrics";

/// Suffix of the measurement holding summary-statistic points
pub const SUMMARY_SUFFIX: &str = "Summary";

/// How a response is laid out for one metric kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Present when the response is a collection of entities
    pub entities: Option<EntityLayout>,

    /// Fields removed from each object before classification
    pub dropped_fields: &'static [&'static str],

    /// Scalar fields kept as text without numeric coercion
    pub text_fields: &'static [&'static str],
}

impl Layout {
    /// Layout for a single flat object with no overrides
    pub const FLAT: Layout = Layout {
        entities: None,
        dropped_fields: &[],
        text_fields: &[],
    };
}

/// Where the entities of a collection response live and how they are identified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLayout {
    /// Object keys leading to the entity array, e.g. `["_embedded", "_instances"]`
    pub path: &'static [&'static str],

    /// Entity field holding its identity, e.g. `displayName`
    pub id_field: &'static str,

    /// Tag key the identity is written under, e.g. `NodeID`
    pub tag_key: &'static str,
}

/// A timestamped numeric sample from a detail series
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub unit: String,
    pub epoch: i64,
    pub value: f64,
}

/// A min/max entry; `epoch` is absent when the source did not report one
/// (an unparsable one drops the entry instead)
#[derive(Debug, Clone, PartialEq)]
pub struct TimedValue {
    pub epoch: Option<i64>,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub min: Option<TimedValue>,
    pub max: Option<TimedValue>,
    pub avg: Option<f64>,
}

/// Shape of one raw JSON field
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Scalar(FieldValue),
    DetailSeries(Vec<Sample>),
    SummaryStat(Summary),
    Unrecognized(&'static str),
}

/// Classifies a raw JSON value.
///
/// `text_only` disables numeric coercion for scalar strings.
pub fn classify(value: &Value, text_only: bool) -> RawValue {
    match value {
        Value::String(text) if text_only => RawValue::Scalar(FieldValue::Text(text.clone())),
        Value::String(text) => RawValue::Scalar(FieldValue::coerce(text)),
        Value::Number(number) => match number.as_f64() {
            Some(n) if n.is_finite() => RawValue::Scalar(FieldValue::Float(n)),
            _ => RawValue::Unrecognized("number out of range"),
        },
        Value::Bool(flag) => RawValue::Scalar(FieldValue::Text(flag.to_string())),
        Value::Array(entries) => classify_series(entries),
        Value::Object(object) => classify_summary(object),
        Value::Null => RawValue::Unrecognized("null value"),
    }
}

fn classify_series(entries: &[Value]) -> RawValue {
    let is_series = entries
        .first()
        .and_then(Value::as_object)
        .map_or(false, |first| first.contains_key("t"));

    if !is_series {
        return RawValue::Unrecognized("list is not a timestamped series");
    }

    let mut samples = Vec::new();
    for entry in entries {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let Some(epoch) = entry.get("t").and_then(parse_epoch) else {
            continue;
        };
        for (unit, raw) in entry.iter().filter(|(key, _)| key.as_str() != "t") {
            if let Some(value) = numeric(raw) {
                samples.push(Sample {
                    unit: unit.clone(),
                    epoch,
                    value,
                });
            }
        }
    }

    if samples.is_empty() {
        RawValue::Unrecognized("series has no usable samples")
    } else {
        RawValue::DetailSeries(samples)
    }
}

fn classify_summary(object: &Map<String, Value>) -> RawValue {
    let mut summary = Summary::default();
    let mut recognized = false;

    for (key, raw) in object {
        match key.to_ascii_lowercase().as_str() {
            "min" => {
                recognized = true;
                summary.min = timed_value(raw);
            }
            "max" => {
                recognized = true;
                summary.max = timed_value(raw);
            }
            "avg" => {
                recognized = true;
                summary.avg = numeric(raw);
            }
            _ => {}
        }
    }

    if !recognized {
        return RawValue::Unrecognized("object has no min/max/avg");
    }
    if summary == Summary::default() {
        return RawValue::Unrecognized("summary has no usable values");
    }
    RawValue::SummaryStat(summary)
}

/// Reads `{t, unit: value}` either directly or as the first element of a list
fn timed_value(raw: &Value) -> Option<TimedValue> {
    let entry = match raw {
        Value::Array(items) => items.first()?.as_object()?,
        Value::Object(object) => object,
        _ => return None,
    };

    let value = entry
        .iter()
        .filter(|(key, _)| key.as_str() != "t")
        .find_map(|(_, v)| numeric(v))?;

    // An unparsable `t` drops the entry; only an absent one falls back to now
    let epoch = match entry.get("t") {
        Some(raw) => Some(parse_epoch(raw)?),
        None => None,
    };

    Some(TimedValue { epoch, value })
}

fn numeric(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(number) => number.as_f64().filter(|n| n.is_finite()),
        Value::String(text) => parse_number(text),
        _ => None,
    }
}

fn parse_epoch(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|secs| secs.trunc() as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| parse_number(text).map(|secs| secs.trunc() as i64))
        }
        _ => None,
    }
}

/// Output of one normalization, split by measurement family
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub base: Vec<Point>,
    pub metrics: Vec<Point>,
    pub summary: Vec<Point>,
}

impl Normalized {
    pub fn point_count(&self) -> usize {
        self.base.len() + self.metrics.len() + self.summary.len()
    }

    /// Appends another normalization's points family by family
    pub fn extend(&mut self, other: Normalized) {
        self.base.extend(other.base);
        self.metrics.extend(other.metrics);
        self.summary.extend(other.summary);
    }

    /// Splits into one batch per non-empty family: base, Metrics, Summary
    pub fn into_batches(self, measurement: &str) -> Vec<PointBatch> {
        [
            (measurement.to_string(), self.base),
            (format!("{}{}", measurement, METRICS_SUFFIX), self.metrics),
            (format!("{}{}", measurement, SUMMARY_SUFFIX), self.summary),
        ]
        .into_iter()
        .filter(|(_, points)| !points.is_empty())
        .map(|(name, points)| PointBatch::new(name, points))
        .collect()
    }
}

/// Per-entity accumulators; timestamps are bucketed in ascending order
#[derive(Default)]
struct Accumulator {
    scalars: Fields,
    metrics: BTreeMap<i64, Fields>,
    summary: BTreeMap<i64, Fields>,
}

impl Accumulator {
    fn fold(&mut self, field: &str, raw: RawValue, now_epoch: i64) {
        match raw {
            RawValue::Scalar(value) => {
                self.scalars.insert(field.to_string(), value);
            }
            RawValue::DetailSeries(samples) => {
                for sample in samples {
                    self.metrics
                        .entry(sample.epoch)
                        .or_default()
                        .insert(format!("{}_{}", field, sample.unit), FieldValue::Float(sample.value));
                }
            }
            RawValue::SummaryStat(summary) => {
                let entries = [
                    ("Min", summary.min.map(|m| (m.epoch.unwrap_or(now_epoch), m.value))),
                    ("Max", summary.max.map(|m| (m.epoch.unwrap_or(now_epoch), m.value))),
                    ("Avg", summary.avg.map(|avg| (now_epoch, avg))),
                ];
                for (suffix, entry) in entries {
                    if let Some((epoch, value)) = entry {
                        self.summary
                            .entry(epoch)
                            .or_default()
                            .insert(format!("{}{}", field, suffix), FieldValue::Float(value));
                    }
                }
            }
            RawValue::Unrecognized(reason) => {
                debug!("Skipping malformed field '{}': {}", field, reason);
            }
        }
    }

    fn into_points(
        self,
        measurement: &str,
        tags: &Tags,
        now: DateTime<Utc>,
        out: &mut Normalized,
    ) {
        if !self.scalars.is_empty() {
            out.base
                .push(Point::new(measurement, tags.clone(), self.scalars, now));
        }

        let metrics_name = format!("{}{}", measurement, METRICS_SUFFIX);
        let summary_name = format!("{}{}", measurement, SUMMARY_SUFFIX);

        for (target, name, buckets) in [
            (&mut out.metrics, metrics_name, self.metrics),
            (&mut out.summary, summary_name, self.summary),
        ] {
            for (epoch, fields) in buckets {
                match from_epoch_seconds(epoch) {
                    Some(timestamp) => {
                        target.push(Point::new(name.as_str(), tags.clone(), fields, timestamp))
                    }
                    None => warn!("Dropping {} sample with invalid timestamp {}", name, epoch),
                }
            }
        }
    }
}

/// Normalizes one response into point batches.
///
/// # Arguments
/// * `tree` - Raw JSON returned by the source
/// * `layout` - Entity and field layout of the metric kind
/// * `measurement` - Base measurement name (`Metrics`/`Summary` are derived)
/// * `tags` - Tags applied to every point (zone identity and the like)
/// * `now` - Current wall-clock time for scalars and `avg` values
///
/// # Errors
/// `MalformedResponse` when the tree is not an object or the entity
/// collection cannot be found. Field-level problems never fail the call.
pub fn normalize(
    tree: &Value,
    layout: &Layout,
    measurement: &str,
    tags: &Tags,
    now: DateTime<Utc>,
) -> Result<Normalized, CollectError> {
    let root = tree.as_object().ok_or_else(|| {
        CollectError::MalformedResponse(format!("{} response is not a JSON object", measurement))
    })?;

    let mut out = Normalized::default();

    match &layout.entities {
        None => normalize_object(root, layout, measurement, tags, now, &mut out),
        Some(entity_layout) => {
            let entities = lookup(root, entity_layout.path).ok_or_else(|| {
                CollectError::MalformedResponse(format!(
                    "{} response has no entity list at '{}'",
                    measurement,
                    entity_layout.path.join(".")
                ))
            })?;

            for entity in entities {
                let Some(entity) = entity.as_object() else {
                    warn!("Skipping non-object entity in {} response", measurement);
                    continue;
                };
                let Some(identity) = entity.get(entity_layout.id_field).and_then(identity_of) else {
                    warn!(
                        "Skipping {} entity without '{}'",
                        measurement, entity_layout.id_field
                    );
                    continue;
                };

                let mut entity_tags = tags.clone();
                entity_tags.insert(entity_layout.tag_key.to_string(), identity);
                normalize_object(entity, layout, measurement, &entity_tags, now, &mut out);
            }
        }
    }

    Ok(out)
}

fn normalize_object(
    object: &Map<String, Value>,
    layout: &Layout,
    measurement: &str,
    tags: &Tags,
    now: DateTime<Utc>,
    out: &mut Normalized,
) {
    let now_epoch = now.timestamp();
    let mut acc = Accumulator::default();

    for (field, raw) in object {
        if layout.dropped_fields.contains(&field.as_str()) {
            continue;
        }
        let text_only = layout.text_fields.contains(&field.as_str());
        acc.fold(field, classify(raw, text_only), now_epoch);
    }

    acc.into_points(measurement, tags, now, out);
}

fn lookup<'a>(root: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Vec<Value>> {
    let (last, parents) = path.split_last()?;
    let mut current = root;
    for key in parents {
        current = current.get(*key)?.as_object()?;
    }
    current.get(*last)?.as_array()
}

fn identity_of(raw: &Value) -> Option<String> {
    match raw {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    fn vdc_tags() -> Tags {
        let mut tags = Tags::new();
        tags.insert("VDC".to_string(), "vdc1".to_string());
        tags
    }

    const NODES: Layout = Layout {
        entities: Some(EntityLayout {
            path: &["_embedded", "_instances"],
            id_field: "displayName",
            tag_key: "NodeID",
        }),
        dropped_fields: &["_links"],
        text_fields: &[],
    };

    #[test]
    fn test_capacity_scenario() {
        let tree = json!({
            "usedCapacity": "12345",
            "history": [
                {"t": "100", "bytes": "5"},
                {"t": "100", "errors": "0"},
                {"t": "200", "bytes": "7"}
            ]
        });

        let out = normalize(&tree, &Layout::FLAT, "Capacity", &vdc_tags(), now()).unwrap();

        assert_eq!(out.base.len(), 1);
        assert_eq!(out.base[0].measurement(), "Capacity");
        assert_eq!(out.base[0].timestamp(), now());
        assert_eq!(out.base[0].fields().len(), 1);
        assert_eq!(out.base[0].field("usedCapacity"), Some(&FieldValue::Float(12345.0)));

        assert_eq!(out.metrics.len(), 2);
        let first = &out.metrics[0];
        assert_eq!(first.measurement(), "CapacityMetrics");
        assert_eq!(first.timestamp().timestamp(), 100);
        assert_eq!(first.fields().len(), 2);
        assert_eq!(first.field("history_bytes"), Some(&FieldValue::Float(5.0)));
        assert_eq!(first.field("history_errors"), Some(&FieldValue::Float(0.0)));

        let second = &out.metrics[1];
        assert_eq!(second.timestamp().timestamp(), 200);
        assert_eq!(second.fields().len(), 1);
        assert_eq!(second.field("history_bytes"), Some(&FieldValue::Float(7.0)));

        assert!(out.summary.is_empty());
        assert!(out.base.iter().all(|p| p.tags() == &vdc_tags()));
    }

    #[test]
    fn test_detail_fields_sharing_timestamp_merge_across_fields() {
        let tree = json!({
            "diskReadBandwidth": [{"t": 10, "Bandwidth": 1.5}, {"t": 20, "Bandwidth": 2.5}],
            "diskWriteBandwidth": [{"t": 10, "Bandwidth": 3.5}]
        });

        let out = normalize(&tree, &Layout::FLAT, "LocalZone", &Tags::new(), now()).unwrap();

        assert_eq!(out.metrics.len(), 2);
        let at_ten = &out.metrics[0];
        assert_eq!(at_ten.timestamp().timestamp(), 10);
        assert_eq!(at_ten.field("diskReadBandwidth_Bandwidth"), Some(&FieldValue::Float(1.5)));
        assert_eq!(at_ten.field("diskWriteBandwidth_Bandwidth"), Some(&FieldValue::Float(3.5)));
        assert_eq!(out.metrics[1].fields().len(), 1);
    }

    #[test]
    fn test_summary_avg_uses_current_timestamp() {
        let tree = json!({
            "latency": {
                "min": [{"t": "5", "ms": "1.0"}],
                "max": [{"t": "5", "ms": "9.0"}],
                "avg": 5.0
            }
        });

        let out = normalize(&tree, &Layout::FLAT, "LocalZone", &Tags::new(), now()).unwrap();

        assert!(out.base.is_empty());
        assert_eq!(out.summary.len(), 2);

        let at_five = &out.summary[0];
        assert_eq!(at_five.measurement(), "LocalZoneSummary");
        assert_eq!(at_five.timestamp().timestamp(), 5);
        assert_eq!(at_five.fields().len(), 2);
        assert_eq!(at_five.field("latencyMin"), Some(&FieldValue::Float(1.0)));
        assert_eq!(at_five.field("latencyMax"), Some(&FieldValue::Float(9.0)));

        let at_now = &out.summary[1];
        assert_eq!(at_now.timestamp(), now());
        assert_eq!(at_now.fields().len(), 1);
        assert_eq!(at_now.field("latencyAvg"), Some(&FieldValue::Float(5.0)));
    }

    #[test]
    fn test_summary_keys_match_case_insensitively() {
        let tree = json!({
            "chunksEcRateSummary": {
                "Min": [{"t": "30", "Rate": "0.1"}],
                "Max": {"t": "40", "Rate": "0.9"},
                "Avg": "0.5"
            }
        });

        let out = normalize(&tree, &Layout::FLAT, "LocalZone", &Tags::new(), now()).unwrap();

        let fields: Vec<&String> = out.summary.iter().flat_map(|p| p.fields().keys()).collect();
        assert_eq!(
            fields,
            vec!["chunksEcRateSummaryMin", "chunksEcRateSummaryMax", "chunksEcRateSummaryAvg"]
        );
    }

    #[test]
    fn test_summary_entry_with_bad_timestamp_is_skipped() {
        let tree = json!({
            "latency": {
                "min": [{"t": "yesterday", "ms": "1.0"}],
                "max": {"ms": "9.0"}
            }
        });

        let out = normalize(&tree, &Layout::FLAT, "LocalZone", &Tags::new(), now()).unwrap();

        assert_eq!(out.summary.len(), 1);
        assert_eq!(out.summary[0].timestamp(), now());
        assert!(out.summary[0].field("latencyMin").is_none());
        assert_eq!(out.summary[0].field("latencyMax"), Some(&FieldValue::Float(9.0)));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let tree = json!({
            "status": "Good",
            "numNodes": 4,
            "history": [{"t": "1", "v": "2"}, {"t": "3", "v": "4"}],
            "rate": {"min": [{"t": "1", "r": "1"}], "avg": "2"}
        });

        let first = normalize(&tree, &Layout::FLAT, "LocalZone", &vdc_tags(), now()).unwrap();
        let second = normalize(&tree, &Layout::FLAT, "LocalZone", &vdc_tags(), now()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.base).unwrap(),
            serde_json::to_string(&second.base).unwrap()
        );
    }

    #[test]
    fn test_entities_are_tagged_without_field_leakage() {
        let tree = json!({
            "_embedded": {"_instances": [
                {"displayName": "node-1", "_links": {"self": "x"}, "cpu": "10", "history": [{"t": "1", "v": "1"}]},
                {"displayName": "node-2", "mem": "20"},
                {"displayName": "node-3", "cpu": "30", "status": "Good"}
            ]}
        });

        let out = normalize(&tree, &NODES, "LocalZoneNodes", &vdc_tags(), now()).unwrap();

        assert_eq!(out.base.len(), 3);
        let ids: Vec<&str> = out.base.iter().map(|p| p.tags()["NodeID"].as_str()).collect();
        assert_eq!(ids, vec!["node-1", "node-2", "node-3"]);
        assert!(out.base.iter().all(|p| p.tags()["VDC"] == "vdc1"));

        assert!(out.base[0].field("mem").is_none());
        assert!(out.base[0].field("_links").is_none());
        assert!(out.base[1].field("cpu").is_none());
        assert_eq!(out.base[2].field("status"), Some(&FieldValue::Text("Good".to_string())));

        assert_eq!(out.metrics.len(), 1);
        assert_eq!(out.metrics[0].tags()["NodeID"], "node-1");
        assert_eq!(out.metrics[0].measurement(), "LocalZoneNodesMetrics");
    }

    #[test]
    fn test_entity_without_identity_is_skipped() {
        let tree = json!({"_embedded": {"_instances": [{"cpu": "1"}, {"displayName": "n", "cpu": "2"}]}});

        let out = normalize(&tree, &NODES, "LocalZoneNodes", &Tags::new(), now()).unwrap();

        assert_eq!(out.base.len(), 1);
        assert_eq!(out.base[0].field("cpu"), Some(&FieldValue::Float(2.0)));
    }

    #[test]
    fn test_missing_entity_collection_is_malformed() {
        let tree = json!({"unexpected": true});
        let result = normalize(&tree, &NODES, "LocalZoneNodes", &Tags::new(), now());

        assert!(matches!(result, Err(CollectError::MalformedResponse(_))));
    }

    #[test]
    fn test_unrecognized_fields_are_skipped() {
        let tree = json!({
            "nothing": null,
            "empty": [],
            "plainList": ["a", "b"],
            "nested": {"foo": "bar"},
            "kept": "1"
        });

        let out = normalize(&tree, &Layout::FLAT, "LocalZone", &Tags::new(), now()).unwrap();

        assert_eq!(out.point_count(), 1);
        assert_eq!(out.base[0].fields().len(), 1);
    }

    #[test]
    fn test_text_fields_skip_numeric_coercion() {
        const LAYOUT: Layout = Layout {
            entities: None,
            dropped_fields: &[],
            text_fields: &["id"],
        };
        let tree = json!({"id": "0042", "count": "0042"});

        let out = normalize(&tree, &LAYOUT, "Billing", &Tags::new(), now()).unwrap();

        assert_eq!(out.base[0].field("id"), Some(&FieldValue::Text("0042".to_string())));
        assert_eq!(out.base[0].field("count"), Some(&FieldValue::Float(42.0)));
    }

    #[test]
    fn test_into_batches_skips_empty_families() {
        let tree = json!({"a": "1", "s": {"avg": 2}});
        let batches = normalize(&tree, &Layout::FLAT, "Capacity", &Tags::new(), now())
            .unwrap()
            .into_batches("Capacity");

        let names: Vec<&str> = batches.iter().map(|b| b.measurement.as_str()).collect();
        assert_eq!(names, vec!["Capacity", "CapacitySummary"]);
    }
}
