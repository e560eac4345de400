//! Inbound event envelopes.
//!
//! The event runtime hands the dispatcher raw JSON in one of three shapes:
//!
//! | Shape | Example |
//! |-------|---------|
//! | Storage notification | `{"Records":[{"eventTime":..,"s3":{"bucket":{"name":..},"object":{"key":..}}}]}` |
//! | Event bus | `{"time":..,"detail":{"bucket":{"name":..},"object":{"key":..}}}` |
//! | Queue delivery | `{"Records":[{"eventSource":"aws:sqs","body":"<json>"}]}` |
//!
//! A queue body is either a serialized [`RetryTicket`], a plain
//! `{bucket, key}` notification, or a nested storage notification.
//! Records in any other shape are skipped with a warning.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use sluice_core::ObjectCreated;

use crate::error::{Error, Result};
use crate::retry::RetryTicket;

/// Event source marker of queue deliveries.
pub const QUEUE_EVENT_SOURCE: &str = "aws:sqs";

/// One unit of work extracted from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A fresh object-creation notification.
    Created(ObjectCreated),
    /// A retry ticket redelivered by the queue.
    Retry(RetryTicket),
}

#[derive(Debug, Deserialize)]
struct NamedBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectKey {
    key: String,
}

#[derive(Debug, Deserialize)]
struct StorageEntity {
    bucket: NamedBucket,
    object: ObjectKey,
}

#[derive(Debug, Deserialize)]
struct PlainNotification {
    bucket: String,
    key: String,
    #[serde(default, alias = "eventTime")]
    event_time: Option<DateTime<Utc>>,
}

/// Parses a raw envelope.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] if the payload is not JSON. Unknown
/// record shapes inside valid JSON are skipped rather than rejected.
pub fn parse_envelope(raw: &[u8]) -> Result<Vec<InboundEvent>> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| Error::MalformedEvent {
        message: format!("envelope is not JSON: {e}"),
    })?;
    Ok(extract_events(&value))
}

/// Extracts events from an already-parsed envelope.
#[must_use]
pub fn extract_events(envelope: &Value) -> Vec<InboundEvent> {
    let records: Vec<&Value> = match envelope.get("Records").and_then(Value::as_array) {
        Some(records) => records.iter().collect(),
        None if envelope.get("detail").is_some() => vec![envelope],
        None => Vec::new(),
    };

    let mut events = Vec::with_capacity(records.len());
    for record in records {
        match extract_record(record) {
            Some(mut extracted) => events.append(&mut extracted),
            None => tracing::warn!("skipping unrecognised record"),
        }
    }
    events
}

fn extract_record(record: &Value) -> Option<Vec<InboundEvent>> {
    if record.get("eventSource").and_then(Value::as_str) == Some(QUEUE_EVENT_SOURCE) {
        let body = record.get("body").and_then(Value::as_str)?;
        return extract_queue_body(body);
    }

    if let Some(detail) = record.get("detail") {
        let entity = StorageEntity::deserialize(detail).ok()?;
        let event_time = timestamp(record.get("time"));
        return Some(vec![created(entity, event_time)]);
    }

    let entity = StorageEntity::deserialize(record.get("s3")?).ok()?;
    let event_time = timestamp(record.get("eventTime"));
    Some(vec![created(entity, event_time)])
}

fn extract_queue_body(body: &str) -> Option<Vec<InboundEvent>> {
    let value: Value = serde_json::from_str(body).ok()?;
    if value.get("Records").is_some() || value.get("detail").is_some() {
        return Some(extract_events(&value));
    }
    if value.get("tableId").is_some() {
        let ticket = RetryTicket::deserialize(&value).ok()?;
        return Some(vec![InboundEvent::Retry(ticket)]);
    }
    let plain = PlainNotification::deserialize(&value).ok()?;
    let mut notification = ObjectCreated::new(plain.bucket, plain.key);
    notification.event_time = plain.event_time;
    Some(vec![InboundEvent::Created(notification)])
}

fn created(entity: StorageEntity, event_time: Option<DateTime<Utc>>) -> InboundEvent {
    let mut notification = ObjectCreated::new(entity.bucket.name, entity.object.key);
    notification.event_time = event_time;
    InboundEvent::Created(notification)
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use sluice_core::WarehouseRoot;

    fn only_created(events: &[InboundEvent]) -> &ObjectCreated {
        match events {
            [InboundEvent::Created(n)] => n,
            other => panic!("expected one notification, got {other:?}"),
        }
    }

    #[test]
    fn storage_notification() {
        let raw = json!({
            "Records": [{
                "eventTime": "2024-05-01T12:00:00.000Z",
                "s3": {
                    "bucket": {"name": "wh"},
                    "object": {"key": "sales/orders/data/1-deletes.parquet"}
                }
            }]
        });
        let events = parse_envelope(raw.to_string().as_bytes()).expect("parse");
        let n = only_created(&events);
        assert_eq!(n.bucket, "wh");
        assert_eq!(n.key, "sales/orders/data/1-deletes.parquet");
        assert!(n.event_time.is_some());
    }

    #[test]
    fn event_bus_detail() {
        let raw = json!({
            "time": "2024-05-01T12:00:00Z",
            "detail": {"bucket": {"name": "wh"}, "object": {"key": "a/b/data/x-deletes.parquet"}}
        });
        let events = extract_events(&raw);
        assert_eq!(only_created(&events).key, "a/b/data/x-deletes.parquet");
    }

    #[test]
    fn queue_body_with_plain_notification() {
        let body = json!({"bucket": "wh", "key": "a/b/data/x-deletes.parquet"}).to_string();
        let raw = json!({"Records": [{"eventSource": "aws:sqs", "body": body}]});
        let events = extract_events(&raw);
        assert_eq!(only_created(&events).bucket, "wh");
    }

    #[test]
    fn queue_body_with_retry_ticket() {
        let ticket = RetryTicket::new(
            "catalog.a.b".parse().expect("table"),
            WarehouseRoot::new("s3", "wh", ""),
            ObjectCreated::new("wh", "a/b/data/x-deletes.parquet"),
            Duration::from_secs(1),
        );
        let body = serde_json::to_string(&ticket).expect("serialize");
        let raw = json!({"Records": [{"eventSource": "aws:sqs", "body": body}]});
        assert_eq!(extract_events(&raw), vec![InboundEvent::Retry(ticket)]);
    }

    #[test]
    fn queue_body_wrapping_storage_notification() {
        let inner = json!({
            "Records": [{
                "s3": {"bucket": {"name": "wh"}, "object": {"key": "a/b/c-deletes.parquet"}}
            }]
        })
        .to_string();
        let raw = json!({"Records": [{"eventSource": "aws:sqs", "body": inner}]});
        assert_eq!(only_created(&extract_events(&raw)).key, "a/b/c-deletes.parquet");
    }

    #[test]
    fn unknown_records_are_skipped() {
        let raw = json!({
            "Records": [{"something": "else"}, {"eventSource": "aws:sqs", "body": "{not json"}]
        });
        assert!(extract_events(&raw).is_empty());
        assert!(extract_events(&json!({"hello": "world"})).is_empty());
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(
            parse_envelope(b"<xml/>"),
            Err(Error::MalformedEvent { .. })
        ));
    }
}
