use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How the client presents its token
pub enum Credentials<'a> {
    None,
    Query(&'a str),
    Header(&'a str),
    Subprotocol(&'a str),
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    last_seq: u64,
}

impl WsClient {
    pub async fn connect(url: &str, credentials: Credentials<'_>) -> Self {
        let url = match credentials {
            Credentials::Query(token) => format!("{}?token={}", url, token),
            _ => url.to_string(),
        };
        let mut request = url.as_str().into_client_request().unwrap();
        match credentials {
            Credentials::Header(token) => {
                request.headers_mut().insert(
                    header::AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
                );
            }
            Credentials::Subprotocol(token) => {
                request.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_str(&format!("bearer, {}", token)).unwrap(),
                );
            }
            _ => {}
        }

        let (stream, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        Self { stream, last_seq: 0 }
    }

    pub async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Next event; asserts `seq` keeps increasing across the connection
    pub async fn next_event(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for an event")
                .expect("connection ended")
                .unwrap();
            match message {
                Message::Text(text) => {
                    let event: Value = serde_json::from_str(&text).unwrap();
                    let seq = event["seq"].as_u64().unwrap();
                    assert!(seq > self.last_seq, "seq went from {} to {}", self.last_seq, seq);
                    self.last_seq = seq;
                    return event;
                }
                Message::Close(frame) => panic!("unexpected close: {:?}", frame),
                _ => continue,
            }
        }
    }

    /// Skips events until one of the given type arrives
    pub async fn next_of_type(&mut self, event_type: &str) -> Value {
        loop {
            let event = self.next_event().await;
            if event["type"] == event_type {
                return event;
            }
        }
    }

    /// Waits for the server's close frame
    pub async fn expect_close(&mut self) -> (u16, String) {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for close")
                .expect("connection ended without a close frame")
                .unwrap();
            match message {
                Message::Close(Some(frame)) => return (frame.code.into(), frame.reason.to_string()),
                Message::Close(None) => panic!("close frame without a code"),
                Message::Text(text) => panic!("expected close, got {}", text),
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
