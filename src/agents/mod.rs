//! Agent runtime
//!
//! ## Architecture
//!
//! - `domain/` - Core types (AgentInstance, AgentMessage, AgentAction)
//! - `catalog` - Agent types by role
//! - `hierarchy/` - Routing of inbound messages and delegation
//! - `llm/` - Streaming upstream generation
//! - `prompt` - Per-turn prompt rendering
//! - `token` - Token estimation

pub mod catalog;
pub mod domain;
pub mod error;
pub mod hierarchy;
pub mod llm;
pub mod prompt;
pub mod token;

pub use catalog::AgentCatalog;
pub use domain::*;
pub use error::*;
