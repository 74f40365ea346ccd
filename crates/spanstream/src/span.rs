use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A finished trace span, ready for serialization.
///
/// The recorder treats spans as opaque once serialized; this record is the
/// shape application-facing tracers hand over when a span finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Unique span identifier (64-bit). Used for drop diagnostics.
    pub span_id: u64,
    /// Trace this span belongs to.
    pub trace_id: u64,
    /// Parent span, absent for root spans.
    #[serde(default)]
    pub parent_span_id: Option<u64>,
    /// Operation name.
    pub operation_name: String,
    /// Start time, microseconds since the Unix epoch.
    pub start_timestamp_micros: u64,
    /// Wall-clock duration in microseconds.
    pub duration_micros: u64,
    /// Span tags.
    #[serde(default)]
    pub tags: BTreeMap<String, TagValue>,
    /// Timestamped log entries recorded during the span.
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    /// Baggage propagated along the trace.
    #[serde(default)]
    pub baggage: BTreeMap<String, String>,
    /// Causal references to other spans.
    #[serde(default)]
    pub references: Vec<SpanReference>,
}

/// Typed tag values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
}

/// One log entry attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_micros: u64,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Causal reference kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    ChildOf,
    FollowsFrom,
}

/// Reference to another span in this or another trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanReference {
    pub kind: ReferenceKind,
    pub trace_id: u64,
    pub span_id: u64,
}

impl SpanRecord {
    /// Creates a minimal finished span.
    pub fn new(trace_id: u64, span_id: u64, operation_name: impl Into<String>) -> Self {
        Self {
            span_id,
            trace_id,
            parent_span_id: None,
            operation_name: operation_name.into(),
            start_timestamp_micros: 0,
            duration_micros: 0,
            tags: BTreeMap::new(),
            logs: Vec::new(),
            baggage: BTreeMap::new(),
            references: Vec::new(),
        }
    }

    /// Sets a tag, replacing any previous value under the same key.
    pub fn set_tag(&mut self, key: impl Into<String>, value: TagValue) {
        self.tags.insert(key.into(), value);
    }

    /// Appends a log entry.
    pub fn log(&mut self, timestamp_micros: u64, fields: BTreeMap<String, String>) {
        self.logs.push(LogRecord {
            timestamp_micros,
            fields,
        });
    }

    /// Sets a baggage item.
    pub fn set_baggage_item(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(key.into(), value.into());
    }

    /// Adds a causal reference.
    pub fn add_reference(&mut self, kind: ReferenceKind, trace_id: u64, span_id: u64) {
        self.references.push(SpanReference {
            kind,
            trace_id,
            span_id,
        });
    }
}
