pub mod health_handler;
pub mod jwks;
pub mod jwt_verifier;
pub mod memory_store;
pub mod metrics_handler;
pub mod rate_limit;
pub mod ws_handler;
