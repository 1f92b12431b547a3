//! Token accounting

mod counter;

pub use counter::TokenCounter;
