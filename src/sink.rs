//! Output boundary: the core emits typed records through a `Sink` trait
//! instead of owning any particular output format or persistence layer
//! (spec §6.1). A JSON-lines sink implementing the canonical wire
//! schema is provided as the default.

use crate::models::{CrawlError, CrawlResult, EndpointRecord, FormRecord, WebSocketRecord};
use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Write(String),
}

/// Writes may be called concurrently; implementations serialize
/// internally (lock or channel) so the sink appears single-writer.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_endpoint(&self, record: &EndpointRecord) -> Result<(), SinkError>;
    async fn write_form(&self, record: &FormRecord) -> Result<(), SinkError>;
    async fn write_websocket(&self, record: &WebSocketRecord) -> Result<(), SinkError>;
    async fn write_error(&self, record: &CrawlError) -> Result<(), SinkError>;
    async fn write_result(&self, record: &CrawlResult) -> Result<(), SinkError>;
    async fn flush(&self) -> Result<(), SinkError>;
    async fn close(&self) -> Result<(), SinkError>;
}

#[derive(serde::Serialize)]
struct Envelope<'a, T: serde::Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

/// Writes each record as one `{"type": "<kind>", "data": <record>}` JSON
/// object per line to an async writer (stdout, a file, a socket).
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
        }
    }

    async fn write_line<T: serde::Serialize>(&self, kind: &str, data: &T) -> Result<(), SinkError> {
        let envelope = Envelope { kind, data };
        let mut line =
            serde_json::to_vec(&envelope).map_err(|e| SinkError::Write(e.to_string()))?;
        line.push(b'\n');
        // tokio::sync::Mutex would require an async-capable guard across
        // the await below; a std Mutex works here because each write is
        // a single uninterrupted `write_all` with no other await inside
        // the critical section.
        let mut writer = self.writer.lock().unwrap();
        writer
            .write_all(&line)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sink for JsonLinesSink<W> {
    async fn write_endpoint(&self, record: &EndpointRecord) -> Result<(), SinkError> {
        self.write_line("endpoint", record).await
    }

    async fn write_form(&self, record: &FormRecord) -> Result<(), SinkError> {
        self.write_line("form", record).await
    }

    async fn write_websocket(&self, record: &WebSocketRecord) -> Result<(), SinkError> {
        self.write_line("websocket", record).await
    }

    async fn write_error(&self, record: &CrawlError) -> Result<(), SinkError> {
        self.write_line("error", record).await
    }

    async fn write_result(&self, record: &CrawlResult) -> Result<(), SinkError> {
        self.write_line("result", record).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer
            .lock()
            .unwrap()
            .flush()
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.flush().await
    }
}

/// Wraps an arbitrary [`Sink`] and additionally retains every record
/// written through it, so the engine can assemble a final `CrawlResult`
/// and a `CrawlerState` snapshot without requiring the sink itself to
/// support reads back out. Writes are forwarded to the inner sink
/// unconditionally — accumulation failure is not possible, only the
/// inner sink's write can fail.
pub struct AccumulatingSink<S: Sink> {
    inner: S,
    endpoints: Mutex<Vec<EndpointRecord>>,
    forms: Mutex<Vec<FormRecord>>,
    websockets: Mutex<Vec<WebSocketRecord>>,
    errors: Mutex<Vec<CrawlError>>,
}

impl<S: Sink> AccumulatingSink<S> {
    pub fn new(inner: S) -> Self {
        AccumulatingSink {
            inner,
            endpoints: Mutex::new(Vec::new()),
            forms: Mutex::new(Vec::new()),
            websockets: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointRecord> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn forms(&self) -> Vec<FormRecord> {
        self.forms.lock().unwrap().clone()
    }

    pub fn websockets(&self) -> Vec<WebSocketRecord> {
        self.websockets.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<CrawlError> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl<S: Sink> Sink for AccumulatingSink<S> {
    async fn write_endpoint(&self, record: &EndpointRecord) -> Result<(), SinkError> {
        self.endpoints.lock().unwrap().push(record.clone());
        self.inner.write_endpoint(record).await
    }

    async fn write_form(&self, record: &FormRecord) -> Result<(), SinkError> {
        self.forms.lock().unwrap().push(record.clone());
        self.inner.write_form(record).await
    }

    async fn write_websocket(&self, record: &WebSocketRecord) -> Result<(), SinkError> {
        self.websockets.lock().unwrap().push(record.clone());
        self.inner.write_websocket(record).await
    }

    async fn write_error(&self, record: &CrawlError) -> Result<(), SinkError> {
        self.errors.lock().unwrap().push(record.clone());
        self.inner.write_error(record).await
    }

    async fn write_result(&self, record: &CrawlResult) -> Result<(), SinkError> {
        self.inner.write_result(record).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointSource, ParamLocation, Parameter};

    #[tokio::test]
    async fn test_write_endpoint_emits_json_line_envelope() {
        let buffer: Vec<u8> = Vec::new();
        let sink = JsonLinesSink::new(buffer);
        let record = EndpointRecord {
            url: "https://a.test/api/x".to_string(),
            method: "GET".to_string(),
            source: EndpointSource::Passive,
            depth: 1,
            parameters: vec![Parameter {
                name: "id".to_string(),
                location: ParamLocation::Query,
                example: Some("1".to_string()),
            }],
            headers: Default::default(),
            discovered_from: None,
            status_code: Some(200),
            content_type: None,
            response_size: None,
            timestamp: 1000,
        };
        sink.write_endpoint(&record).await.unwrap();
        sink.flush().await.unwrap();

        let written = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with(r#"{"type":"endpoint","data":"#));
        assert!(text.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["type"], "endpoint");
        assert_eq!(parsed["data"]["url"], "https://a.test/api/x");
    }

    #[tokio::test]
    async fn test_accumulating_sink_retains_and_forwards() {
        let buffer: Vec<u8> = Vec::new();
        let inner = JsonLinesSink::new(buffer);
        let sink = AccumulatingSink::new(inner);

        let record = EndpointRecord {
            url: "https://a.test/api/x".to_string(),
            method: "GET".to_string(),
            source: EndpointSource::Passive,
            depth: 0,
            parameters: vec![],
            headers: Default::default(),
            discovered_from: None,
            status_code: None,
            content_type: None,
            response_size: None,
            timestamp: 1000,
        };
        sink.write_endpoint(&record).await.unwrap();

        assert_eq!(sink.endpoints().len(), 1);
        assert_eq!(sink.forms().len(), 0);
    }
}
