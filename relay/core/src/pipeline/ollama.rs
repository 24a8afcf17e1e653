//! Ollama Pipeline
//!
//! Single-stage pipeline backed by Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/generate` - streaming completions, one JSON object per line
//! - `/api/tags` - list models (used as the health probe)
//!
//! The HTTP request is made inside the spawned producer task, so connection
//! failures surface as `Failed` events after `stage-started(generation)`
//! rather than as start errors.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::envelope::StageName;
use crate::frame::FrameDecoder;
use crate::source::{PipelineEvent, PipelineRequest, StagePipeline};
use crate::supervisor::CancelSignal;

/// Default Ollama host
pub const DEFAULT_OLLAMA_HOST: &str = "localhost";

/// Default Ollama port
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// One line of a streaming `/api/generate` response
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Ollama-backed generation pipeline
#[derive(Clone, Debug)]
pub struct OllamaPipeline {
    host: String,
    port: u16,
    model: String,
    channel_capacity: usize,
    http_client: reqwest::Client,
}

impl OllamaPipeline {
    /// Create a pipeline talking to `host:port` with `model`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            host: host.into(),
            port,
            model: model.into(),
            channel_capacity: 1,
            http_client,
        })
    }

    /// Channel capacity between the HTTP reader and the consumer (default: 1)
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Model used for generation
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }
}

#[async_trait]
impl StagePipeline for OllamaPipeline {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn start(
        &self,
        request: &PipelineRequest,
        cancel: CancelSignal,
    ) -> anyhow::Result<mpsc::Receiver<PipelineEvent>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let call = self.http_client.post(self.generate_url()).json(&serde_json::json!({
            "model": self.model,
            "prompt": request.content,
            "stream": true,
        }));

        tracing::debug!(
            stream_id = %request.stream_id,
            model = %self.model,
            "Starting Ollama generation"
        );

        tokio::spawn(generate(call, tx, cancel));
        Ok(rx)
    }
}

/// Producer task: drives one HTTP response to completion or cancellation
async fn generate(
    call: reqwest::RequestBuilder,
    tx: mpsc::Sender<PipelineEvent>,
    mut cancel: CancelSignal,
) {
    let started = PipelineEvent::StageStarted {
        stage: StageName::Generation,
        detail: 0,
    };
    if tx.send(started).await.is_err() {
        return;
    }

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        response = call.send() => response,
    };

    let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            let status = r.status();
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                body = r.text() => body.unwrap_or_default(),
            };
            let _ = tx
                .send(PipelineEvent::Failed(format!("Ollama returned {status}: {body}")))
                .await;
            return;
        }
        Err(e) => {
            let _ = tx.send(PipelineEvent::Failed(e.to_string())).await;
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut decoder = FrameDecoder::new();
    let mut fragments: u64 = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            // Dropping `stream` here closes the HTTP response
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx.send(PipelineEvent::Failed(e.to_string())).await;
                return;
            }
            None => {
                let _ = tx
                    .send(PipelineEvent::Failed(
                        "Ollama stream ended without a done marker".to_string(),
                    ))
                    .await;
                return;
            }
        };
        decoder.push(&bytes);

        loop {
            let line = match decoder.decode::<GenerateChunk>() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(PipelineEvent::Failed(e.to_string())).await;
                    return;
                }
            };

            if let Some(error) = line.error {
                let _ = tx.send(PipelineEvent::Failed(error)).await;
                return;
            }

            if !line.response.is_empty() {
                fragments += 1;
                if tx.send(PipelineEvent::Fragment(line.response)).await.is_err() {
                    return;
                }
            }

            if line.done {
                let completed = PipelineEvent::StageCompleted {
                    stage: StageName::Generation,
                    detail: fragments,
                };
                if tx.send(completed).await.is_ok() {
                    let _ = tx.send(PipelineEvent::Finished).await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::cancel_pair;

    #[test]
    fn test_pipeline_urls() {
        let pipeline = OllamaPipeline::new("example.com", 8080, "llama3.2").unwrap();
        assert_eq!(pipeline.base_url(), "http://example.com:8080");
        assert_eq!(pipeline.generate_url(), "http://example.com:8080/api/generate");
        assert_eq!(pipeline.tags_url(), "http://example.com:8080/api/tags");
        assert_eq!(pipeline.model(), "llama3.2");
        assert_eq!(pipeline.name(), "ollama");
    }

    #[test]
    fn test_generate_chunk_parsing() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"model":"m","response":"Hel","done":false}"#).unwrap();
        assert_eq!(chunk.response, "Hel");
        assert!(!chunk.done);

        let last: GenerateChunk =
            serde_json::from_str(r#"{"model":"m","done":true,"eval_count":12}"#).unwrap();
        assert!(last.done);
        assert!(last.response.is_empty());

        let error: GenerateChunk = serde_json::from_str(r#"{"error":"model not found"}"#).unwrap();
        assert_eq!(error.error.as_deref(), Some("model not found"));
    }

    fn request() -> PipelineRequest {
        PipelineRequest {
            content: "hi".to_string(),
            session_id: "s1".to_string(),
            stream_id: "stream-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_reading_error_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Error status whose body never finishes arriving
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (responded_tx, responded_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 1000\r\n\r\npartial")
                .await
                .unwrap();
            let _ = responded_tx.send(());
            // Hold the connection open
            std::future::pending::<()>().await;
        });

        let pipeline = OllamaPipeline::new("127.0.0.1", port, "m").unwrap();
        let (handle, signal) = cancel_pair();
        let mut rx = pipeline.start(&request(), signal).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(PipelineEvent::StageStarted { .. })
        ));

        responded_rx.await.unwrap();
        // Let the producer get past the headers and into the body read
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel(crate::supervisor::CancelReason::Requested);

        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("producer kept waiting on the body after cancel");
        assert!(next.is_none());
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_failure_event() {
        // Port 9 (discard) is almost never served over HTTP
        let pipeline = OllamaPipeline::new("127.0.0.1", 9, "m")
            .unwrap()
            .with_channel_capacity(4);
        let (_handle, signal) = cancel_pair();

        let mut rx = pipeline.start(&request(), signal).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(PipelineEvent::StageStarted {
                stage: StageName::Generation,
                ..
            })
        ));
        assert!(matches!(rx.recv().await, Some(PipelineEvent::Failed(_))));
    }
}
