use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::{AttributeValue, SpanData, SpanExporter, SpanStatus};
use crate::error::{CITraceError, Result};

const TRACES_PATH: &str = "v1/traces";
const SCOPE_NAME: &str = "citrace";

/// Where and how to ship spans over OTLP/HTTP.
#[derive(Debug, Clone)]
pub struct OtlpSettings {
    /// Collector base URL, e.g. `https://api.honeycomb.io`
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub service_name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Batching OTLP/HTTP JSON exporter.
///
/// Spans are queued on an unbounded channel and shipped by a background task
/// whenever `batch_size` spans are waiting or `flush_interval` elapses.
/// Delivery is best-effort: a failed batch is logged and dropped.
pub struct OtlpExporter {
    tx: Mutex<Option<mpsc::UnboundedSender<SpanData>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OtlpExporter {
    /// Spawns the export task. Must be called from within a tokio runtime.
    pub fn start(settings: OtlpSettings) -> Result<Self> {
        let url = traces_url(&settings.endpoint)?;
        let headers = header_map(&settings.headers)?;

        let client = Client::builder()
            .user_agent(concat!("citrace/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CITraceError::Config(format!("Failed to create HTTP client: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = BatchWorker {
            client,
            url,
            service_name: settings.service_name,
            batch_size: settings.batch_size.max(1),
            flush_interval: settings.flush_interval,
            rx,
        };

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(tokio::spawn(worker.run()))),
        })
    }
}

#[async_trait]
impl SpanExporter for OtlpExporter {
    fn export(&self, span: SpanData) {
        let guard = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let sent = match guard.as_ref() {
            Some(tx) => tx.send(span).is_ok(),
            None => false,
        };
        if !sent {
            debug!("exporter already shut down, dropping span");
        }
    }

    async fn shutdown(&self) -> Result<()> {
        // Closing the channel makes the worker flush and exit
        drop(
            self.tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take(),
        );

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| CITraceError::Export(format!("export task failed: {e}")))?;
        }

        Ok(())
    }
}

struct BatchWorker {
    client: Client,
    url: Url,
    service_name: String,
    batch_size: usize,
    flush_interval: Duration,
    rx: mpsc::UnboundedReceiver<SpanData>,
}

impl BatchWorker {
    async fn run(mut self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(span) => {
                        batch.push(span);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        debug!("span export task stopped");
    }

    async fn flush(&self, batch: &mut Vec<SpanData>) {
        let spans = std::mem::take(batch);
        let count = spans.len();
        let body = encode_request(&self.service_name, &spans);

        match self.client.post(self.url.clone()).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("exported spans count={count}");
            }
            Ok(response) => {
                let status = response.status();
                let message = response.text().await.unwrap_or_default();
                warn!("span export rejected status={status} count={count}: {message}");
            }
            Err(e) => warn!("span export failed count={count}: {e}"),
        }
    }
}

fn traces_url(endpoint: &str) -> Result<Url> {
    let endpoint = endpoint.trim_end_matches('/');
    let full = if endpoint.ends_with(TRACES_PATH) {
        endpoint.to_string()
    } else {
        format!("{endpoint}/{TRACES_PATH}")
    };

    Url::parse(&full).map_err(|e| CITraceError::Config(format!("Invalid exporter endpoint: {e}")))
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CITraceError::Config(format!("Invalid exporter header {name}: {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| CITraceError::Config(format!("Invalid value for header {name}: {e}")))?;
        value.set_sensitive(true);
        map.insert(name, value);
    }
    Ok(map)
}

// OTLP/HTTP JSON payload (opentelemetry-proto, trace/v1)

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportTraceRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: Resource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Serialize)]
struct Resource {
    attributes: Vec<KeyValue>,
}

#[derive(Serialize)]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<OtlpSpan>,
}

#[derive(Serialize)]
struct Scope {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<KeyValue>,
    status: OtlpStatus,
}

#[derive(Serialize)]
struct OtlpStatus {
    code: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    message: String,
}

#[derive(Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum AnyValue {
    StringValue(String),
    BoolValue(bool),
    // int64 is a string in proto3 JSON
    IntValue(String),
    DoubleValue(f64),
    ArrayValue(ArrayValue),
}

#[derive(Serialize)]
struct ArrayValue {
    values: Vec<AnyValue>,
}

const SPAN_KIND_INTERNAL: u8 = 1;
const STATUS_UNSET: u8 = 0;
const STATUS_OK: u8 = 1;
const STATUS_ERROR: u8 = 2;

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(b) => Self::BoolValue(*b),
            AttributeValue::Int(i) => Self::IntValue(i.to_string()),
            AttributeValue::Double(d) => Self::DoubleValue(*d),
            AttributeValue::String(s) => Self::StringValue(s.clone()),
            AttributeValue::StringArray(values) => Self::ArrayValue(ArrayValue {
                values: values.iter().cloned().map(Self::StringValue).collect(),
            }),
        }
    }
}

impl From<&SpanData> for OtlpSpan {
    fn from(span: &SpanData) -> Self {
        let (code, message) = match &span.status {
            SpanStatus::Unset => (STATUS_UNSET, String::new()),
            SpanStatus::Ok => (STATUS_OK, String::new()),
            SpanStatus::Error { message } => (STATUS_ERROR, message.clone()),
        };

        Self {
            trace_id: span.context.trace_id.clone(),
            span_id: span.context.span_id.clone(),
            parent_span_id: span.parent_span_id.clone(),
            name: span.name.clone(),
            kind: SPAN_KIND_INTERNAL,
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: unix_nanos(span.end_time),
            attributes: span
                .attributes
                .iter()
                .map(|(key, value)| KeyValue {
                    key: key.clone(),
                    value: value.into(),
                })
                .collect(),
            status: OtlpStatus { code, message },
        }
    }
}

fn unix_nanos(time: chrono::DateTime<chrono::Utc>) -> String {
    time.timestamp_nanos_opt().unwrap_or_default().to_string()
}

fn encode_request(service_name: &str, spans: &[SpanData]) -> ExportTraceRequest {
    let resource = Resource {
        attributes: vec![
            KeyValue {
                key: "service.name".to_string(),
                value: AnyValue::StringValue(service_name.to_string()),
            },
            KeyValue {
                key: "service.version".to_string(),
                value: AnyValue::StringValue(env!("CARGO_PKG_VERSION").to_string()),
            },
        ],
    };

    ExportTraceRequest {
        resource_spans: vec![ResourceSpans {
            resource,
            scope_spans: vec![ScopeSpans {
                scope: Scope {
                    name: SCOPE_NAME,
                    version: env!("CARGO_PKG_VERSION"),
                },
                spans: spans.iter().map(OtlpSpan::from).collect(),
            }],
        }],
    }
}
