//! Scripted stand-in for the upstream text-generation service

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What the upstream answers to one generation request
#[derive(Debug, Clone)]
pub struct Script {
    lines: Vec<String>,
    hang: bool,
    status: StatusCode,
}

impl Script {
    /// One `data: <json>` line per event
    pub fn events(events: impl IntoIterator<Item = Value>) -> Self {
        Self {
            lines: events
                .into_iter()
                .map(|event| format!("data: {}\n", event))
                .collect(),
            hang: false,
            status: StatusCode::OK,
        }
    }

    /// Body chunks sent verbatim, one chunk per entry
    pub fn raw(chunks: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            lines: chunks.into_iter().map(str::to_string).collect(),
            hang: false,
            status: StatusCode::OK,
        }
    }

    /// Keep the body open after the scripted lines
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn failing(status: StatusCode) -> Self {
        Self {
            lines: Vec::new(),
            hang: false,
            status,
        }
    }

    pub fn reply(content: &str) -> Self {
        Self::events([
            json!({"type": "content", "content": content}),
            json!({"type": "done", "usage": {"prompt_tokens": 10, "completion_tokens": 5}}),
        ])
    }
}

#[derive(Clone, Default)]
pub struct ScriptedUpstream {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedUpstream {
    /// Serves on a random port and returns the base URL
    pub async fn start() -> (Self, String) {
        let upstream = Self::default();
        let app = Router::new()
            .route("/api/generate", post(generate))
            .with_state(upstream.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (upstream, format!("http://{}", addr))
    }

    /// Queue the answer for the next request; unscripted requests get a short reply
    pub async fn push(&self, script: Script) {
        self.scripts.lock().await.push_back(script);
    }

    pub async fn requests(&self) -> Vec<Value> {
        self.requests.lock().await.clone()
    }
}

async fn generate(State(upstream): State<ScriptedUpstream>, Json(body): Json<Value>) -> Response {
    upstream.requests.lock().await.push(body);
    let script = upstream
        .scripts
        .lock()
        .await
        .pop_front()
        .unwrap_or_else(|| Script::reply("ok"));

    if !script.status.is_success() {
        return (script.status, "scripted failure").into_response();
    }

    let lines = stream::iter(script.lines.into_iter().map(Ok::<_, Infallible>));
    let body = if script.hang {
        Body::from_stream(lines.chain(stream::pending()))
    } else {
        Body::from_stream(lines)
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}
