use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;

use crate::session::transport::WsTransport;
use crate::session::{serve, ConnectionGate, SessionServices};

/// Subprotocol a browser client offers to pass its token as the second entry
pub const BEARER_SUBPROTOCOL: &str = "bearer";

#[derive(Clone)]
pub struct WsState {
    pub gate: ConnectionGate,
    pub services: SessionServices,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Where a connection's bearer token came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Header(String),
    Query(String),
    Subprotocol(String),
}

impl TokenSource {
    pub fn into_token(self) -> String {
        match self {
            TokenSource::Header(t) | TokenSource::Query(t) | TokenSource::Subprotocol(t) => t,
        }
    }
}

/// Authorization header, then `?token=`, then `Sec-WebSocket-Protocol: bearer, <token>`
pub fn extract_token(headers: &HeaderMap, query: &TokenQuery) -> Option<TokenSource> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(TokenSource::Header(token.to_string()));
    }

    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(TokenSource::Query(token.to_string()));
    }

    let protocols = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())?;
    let mut entries = protocols.split(',').map(str::trim);
    match (entries.next(), entries.next()) {
        (Some(BEARER_SUBPROTOCOL), Some(token)) if !token.is_empty() => {
            Some(TokenSource::Subprotocol(token.to_string()))
        }
        _ => None,
    }
}

/// Upgrades unconditionally; admission runs on the socket so a rejection
/// reaches the client as a close code rather than an HTTP status.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> Response {
    let source = extract_token(&headers, &query);
    let ws = match source {
        Some(TokenSource::Subprotocol(_)) => ws.protocols([BEARER_SUBPROTOCOL]),
        _ => ws,
    };
    let token = source.map(TokenSource::into_token);

    tracing::debug!(project_id = %project_id, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| {
        serve(
            WsTransport::new(socket),
            state.gate,
            state.services,
            token,
            project_id,
        )
    })
}
