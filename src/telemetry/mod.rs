//! Minimal tracing surface for backfilled spans.
//!
//! Spans are created with explicit start and end timestamps taken from the CI
//! provider's records. Ending a span hands it to a [`SpanExporter`]; after
//! that it cannot be touched again.

mod otlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

pub use otlp::{OtlpExporter, OtlpSettings};

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StringArray(Vec<String>),
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringArray(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error { message: String },
}

/// Identity of a span, used to parent child spans under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpanContext {
    /// 32 lowercase hex characters
    pub trace_id: String,
    /// 16 lowercase hex characters
    pub span_id: String,
}

impl SpanContext {
    fn root() -> Self {
        Self {
            trace_id: format!("{:016x}{:016x}", random_u64(), random_u64()),
            span_id: span_id(),
        }
    }

    fn child_of(parent: &SpanContext) -> Self {
        Self {
            trace_id: parent.trace_id.clone(),
            span_id: span_id(),
        }
    }
}

fn span_id() -> String {
    format!("{:016x}", random_u64())
}

/// 64 uniformly random bits.
///
/// The fixed version bits of a v4 uuid sit in the high half and the fixed
/// variant bits in the low half, so xoring the halves leaves no fixed bit.
fn random_u64() -> u64 {
    let (high, low) = Uuid::new_v4().as_u64_pair();
    high ^ low
}

/// A finished span as handed to the exporter.
#[derive(Debug, Clone)]
pub struct SpanData {
    pub name: String,
    pub context: SpanContext,
    pub parent_span_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SpanStatus,
    pub attributes: IndexMap<String, AttributeValue>,
}

#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Queues a finished span. Must not block.
    fn export(&self, span: SpanData);

    /// Sends everything still queued and stops accepting spans.
    async fn shutdown(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct Tracer {
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }

    /// Starts a span at `start_time`, as a root span or as a child of `parent`.
    pub fn start(
        &self,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        parent: Option<&SpanContext>,
    ) -> ActiveSpan {
        let context = parent.map_or_else(SpanContext::root, SpanContext::child_of);

        ActiveSpan {
            data: SpanData {
                name: name.into(),
                context,
                parent_span_id: parent.map(|p| p.span_id.clone()),
                start_time,
                end_time: start_time,
                status: SpanStatus::Unset,
                attributes: IndexMap::new(),
            },
            exporter: Arc::clone(&self.exporter),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.exporter.shutdown().await
    }
}

/// A span that has been started but not yet ended.
///
/// Dropping it without calling [`ActiveSpan::end`] discards it.
pub struct ActiveSpan {
    data: SpanData,
    exporter: Arc<dyn SpanExporter>,
}

impl ActiveSpan {
    pub fn context(&self) -> &SpanContext {
        &self.data.context
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.data.attributes.insert(key.to_string(), value.into());
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.data.status = status;
    }

    pub fn end(mut self, end_time: DateTime<Utc>) {
        self.data.end_time = end_time;
        self.exporter.export(self.data);
    }
}
