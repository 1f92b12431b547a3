//! Domain types for the agent hierarchy
//!
//! Roles and catalog entries, live instances and the records they produce.

mod action;
mod agent;
mod message;

pub use action::*;
pub use agent::*;
pub use message::*;
