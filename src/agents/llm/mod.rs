//! Upstream generation backend
//!
//! One streaming request per turn. The backend reads the upstream's
//! line-oriented event stream on its own task and forwards normalized
//! [`StreamEvent`]s through a [`GenerationStream`].

pub mod parser;
mod stream;
mod upstream;

pub use stream::*;
pub use upstream::HttpUpstream;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Body of the upstream generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub think: bool,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Opens streaming generations.
///
/// Implementations must stop producing events within one read cycle of
/// `cancel` firing and must end every stream they open with exactly one
/// terminal event unless cancelled.
pub trait GenerationBackend: Send + Sync {
    fn open(&self, request: GenerationRequest, cancel: CancellationToken) -> GenerationStream;
}
