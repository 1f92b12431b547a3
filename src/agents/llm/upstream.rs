//! HTTP upstream with streaming support

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::parser::{parse_line, LineBuffer, LineOutcome};
use super::{
    FailureKind, GenerationBackend, GenerationRequest, GenerationSender, GenerationStream,
    StreamEventKind,
};
use crate::adapters::metrics_handler::MetricsCollector;
use crate::agents::error::UpstreamError;
use crate::config::UpstreamSettings;

const PREVIEW_LEN: usize = 120;

/// Streaming client for the upstream text-generation service
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: String,
    event_buffer: usize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl HttpUpstream {
    pub fn new(settings: &UpstreamSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: settings.endpoint(),
            event_buffer: settings.event_buffer,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl GenerationBackend for HttpUpstream {
    fn open(&self, request: GenerationRequest, cancel: CancellationToken) -> GenerationStream {
        let (sender, stream) = GenerationStream::channel(self.event_buffer);

        let reader = StreamReader {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            metrics: self.metrics.clone(),
            cancel,
            sender,
        };

        tokio::spawn(async move {
            reader.run(request).await;
        });

        stream
    }
}

/// State of one spawned read loop
struct StreamReader {
    client: reqwest::Client,
    endpoint: String,
    metrics: Option<Arc<MetricsCollector>>,
    cancel: CancellationToken,
    sender: GenerationSender,
}

/// Whether the read loop should keep going after handling a line
enum Flow {
    Continue,
    Stop,
}

impl StreamReader {
    async fn run(mut self, request: GenerationRequest) {
        let send = self.client.post(&self.endpoint).json(&request).send();

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(endpoint = %self.endpoint, "Generation cancelled before the upstream answered");
                return;
            }
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let err = UpstreamError::from(e);
                warn!(endpoint = %self.endpoint, error = %err, "Upstream request failed");
                let kind = match err {
                    UpstreamError::Connection(_) => FailureKind::Connection,
                    _ => FailureKind::Stream,
                };
                self.fail(kind, err.to_string()).await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = UpstreamError::Status {
                status: status.as_u16(),
                message: preview(&body),
            };
            warn!(endpoint = %self.endpoint, error = %err, "Upstream rejected generation request");
            self.fail(FailureKind::Upstream, err.to_string()).await;
            return;
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();

        loop {
            // Dropping `body` on return closes the upstream connection
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(emitted = self.sender.emitted(), "Generation cancelled mid-stream");
                    return;
                }
                chunk = body.next() => chunk,
            };

            match next {
                Some(Ok(chunk)) => {
                    lines.push(&chunk);
                    while let Some(line) = lines.next_line() {
                        if let Flow::Stop = self.handle_line(&line).await {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let err = UpstreamError::Stream(e.to_string());
                    warn!(error = %err, "Upstream body interrupted");
                    self.fail(FailureKind::Stream, err.to_string()).await;
                    return;
                }
                None => break,
            }
        }

        if let Some(line) = lines.take_remainder() {
            if let Flow::Stop = self.handle_line(&line).await {
                return;
            }
        }

        // Body ended without a completion flag
        if !self.cancel.is_cancelled() {
            debug!("Upstream closed without a completion flag, synthesizing done");
            self.sender.emit(StreamEventKind::Done { usage: None }).await;
        }
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        if self.cancel.is_cancelled() {
            return Flow::Stop;
        }

        match parse_line(line) {
            LineOutcome::Ignored => Flow::Continue,
            LineOutcome::Malformed { reason } => {
                warn!(reason = %reason, line = %preview(line), "Skipping malformed upstream line");
                if let Some(metrics) = &self.metrics {
                    metrics.upstream_parse_errors.inc();
                }
                Flow::Continue
            }
            LineOutcome::Parsed { events, finished } => {
                for event in events {
                    let terminal = event.is_terminal();
                    if self.cancel.is_cancelled() || !self.sender.emit(event).await || terminal {
                        return Flow::Stop;
                    }
                }
                if finished {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        }
    }

    async fn fail(&mut self, kind: FailureKind, message: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.sender
            .emit(StreamEventKind::Error { kind, message })
            .await;
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_LEN).collect();
    if text.chars().count() > PREVIEW_LEN {
        out.push_str("...");
    }
    out
}
