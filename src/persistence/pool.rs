//! Database connection pool management

use crate::persistence::error::PersistenceError;
use sqlx::{any::AnyPoolOptions, AnyPool};
use std::borrow::Cow;
use std::time::Duration;

/// Database backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    /// SQLite database
    Sqlite,
    /// PostgreSQL database
    Postgres,
}

impl DatabaseBackend {
    /// Detect the database backend from a connection URL
    pub fn from_url(url: &str) -> Result<Self, PersistenceError> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Self::Postgres)
        } else {
            Err(PersistenceError::Connection(format!(
                "Unsupported database URL format. Expected sqlite:// or postgres://. Got: {}",
                url.split(':').next().unwrap_or("unknown")
            )))
        }
    }

    /// Get the backend name for display
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::Postgres => "PostgreSQL",
        }
    }
}

/// Connection pool wrapper with backend information
pub struct ConnectionPool {
    pool: AnyPool,
    backend: DatabaseBackend,
}

impl ConnectionPool {
    /// Create a new connection pool from a database URL
    ///
    /// # Arguments
    ///
    /// * `url` - Database connection URL (sqlite://, postgres://)
    /// * `max_connections` - Maximum number of connections in the pool
    /// * `connect_timeout_secs` - Connection timeout in seconds
    pub async fn new(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> Result<Self, PersistenceError> {
        // Install default drivers for sqlx::any
        sqlx::any::install_default_drivers();

        let backend = DatabaseBackend::from_url(url)?;

        // Every connection to an in-memory SQLite URL opens a fresh database
        let max_connections = if backend == DatabaseBackend::Sqlite && url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        tracing::info!(
            "Connecting to {} database with max {} connections",
            backend.name(),
            max_connections
        );

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| PersistenceError::Connection(e.to_string()))?;

        tracing::info!("Successfully connected to {} database", backend.name());

        Ok(Self { pool, backend })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Get the database backend type
    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    /// Adapts `?` placeholders to the backend's bind syntax
    pub fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self.backend {
            DatabaseBackend::Sqlite => Cow::Borrowed(query),
            DatabaseBackend::Postgres => Cow::Owned(numbered_placeholders(query)),
        }
    }

    /// Check if the database connection is healthy
    pub async fn health_check(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::Connection(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            backend: self.backend,
        }
    }
}

/// `?` -> `$1, $2, ...`, leaving quoted literals alone
fn numbered_placeholders(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 8);
    let mut index = 0;
    let mut in_literal = false;
    for ch in query.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}
