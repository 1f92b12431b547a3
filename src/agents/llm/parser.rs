//! Line parser for the upstream `data: <json>` event stream
//!
//! The upstream format is loosely typed. Every line is classified on its own
//! and a bad line never poisons the ones after it.

use serde_json::{Map, Value};

use super::stream::{FailureKind, StreamEventKind, TokenUsage};

const DATA_PREFIX: &str = "data:";
const END_SENTINEL: &str = "[DONE]";

/// Accumulates raw body chunks and yields complete lines.
///
/// Splitting happens on bytes so a multi-byte character that straddles two
/// chunks is decoded only once both halves have arrived.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left after the body ended without a trailing newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Blank line, non-data line, end sentinel or an event type we do not map
    Ignored,
    /// Data line whose payload could not be understood
    Malformed { reason: String },
    /// Events to forward, in order. `finished` ends the stream after them.
    Parsed {
        events: Vec<StreamEventKind>,
        finished: bool,
    },
}

/// Classifies one line of the upstream stream.
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Ignored;
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Ignored;
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == END_SENTINEL {
        return LineOutcome::Ignored;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return LineOutcome::Malformed {
                reason: e.to_string(),
            }
        }
    };
    let Value::Object(obj) = value else {
        return LineOutcome::Malformed {
            reason: "payload is not a JSON object".to_string(),
        };
    };

    parse_object(&obj)
}

fn parse_object(obj: &Map<String, Value>) -> LineOutcome {
    let mut finished = flag(obj, "done") || flag(obj, "finished");
    let mut events = Vec::new();

    match obj.get("type").and_then(Value::as_str) {
        Some("thinking_start") => events.push(StreamEventKind::ThinkingStart),
        Some("thinking") => {
            if let Some(text) = text_field(obj) {
                events.push(StreamEventKind::ThinkingDelta { content: text });
            }
        }
        Some("thinking_end") => events.push(StreamEventKind::ThinkingEnd),
        Some("content") => {
            if let Some(text) = text_field(obj) {
                events.push(StreamEventKind::ContentDelta { content: text });
            }
        }
        Some("tool_call") => match tool_call(obj) {
            Ok(event) => events.push(event),
            Err(reason) => return LineOutcome::Malformed { reason },
        },
        Some("error") => {
            events.push(StreamEventKind::Error {
                kind: FailureKind::Upstream,
                message: error_message(obj),
            });
            return LineOutcome::Parsed {
                events,
                finished: true,
            };
        }
        Some("done") => finished = true,
        Some(other) => {
            tracing::debug!(event_type = other, "Skipping unmapped upstream event type");
        }
        // Type-less objects carrying content are treated as content
        None => {
            if let Some(text) = text_field(obj) {
                events.push(StreamEventKind::ContentDelta { content: text });
            }
        }
    }

    if finished {
        events.push(StreamEventKind::Done {
            usage: extract_usage(obj),
        });
    }

    if events.is_empty() {
        LineOutcome::Ignored
    } else {
        LineOutcome::Parsed { events, finished }
    }
}

fn flag(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn text_field(obj: &Map<String, Value>) -> Option<String> {
    obj.get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn tool_call(obj: &Map<String, Value>) -> Result<StreamEventKind, String> {
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "tool_call without a name".to_string())?;

    let arguments = match obj.get("arguments") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        // Some upstreams send arguments as an encoded JSON string
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
    };

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));

    Ok(StreamEventKind::ToolCall {
        id,
        name: name.to_string(),
        arguments,
    })
}

fn error_message(obj: &Map<String, Value>) -> String {
    match obj.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(inner)) => inner
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string(),
        _ => obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string(),
    }
}

/// Reads usage from a `usage` object or from ollama-style eval counts.
pub fn extract_usage(obj: &Map<String, Value>) -> Option<TokenUsage> {
    if let Some(usage) = obj.get("usage").and_then(Value::as_object) {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let total = usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(prompt + completion);
        return Some(TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        });
    }

    let prompt = obj.get("prompt_eval_count").and_then(Value::as_u64);
    let completion = obj.get("eval_count").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(TokenUsage::new(prompt.unwrap_or(0), completion.unwrap_or(0)))
}
