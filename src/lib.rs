//! # Stratum - Real-time multi-agent execution server
//!
//! Stratum accepts one WebSocket connection per client and project, routes
//! each inbound message to an agent in the project's hierarchy, streams the
//! agent's generation from an upstream text-generation service back to the
//! client, and enforces per-user daily quotas.
//!
//! ## Features
//!
//! - **Connection Gate**: bearer token verification and project ownership
//! - **Sessions**: ordered event stream with one in-flight execution per connection
//! - **Agent Hierarchy**: role-based routing, delegation and task completion
//! - **Quotas**: atomic, idempotent daily action counting plus token accounting
//! - **Persistence**: SQLite or PostgreSQL, or fully in memory
//! - **Metrics**: Prometheus metrics for monitoring
//! - **Health Checks**: Kubernetes-ready health endpoints
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratum::config::Settings;
//! use stratum::{create_app, AppContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new()?;
//!     let ctx = AppContext::from_settings(&settings).await?;
//!     let app = create_app(&ctx);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Stratum follows Hexagonal Architecture:
//! - **Domain**: Core types and the storage/verification ports
//! - **Session / Quota / Agents**: the execution core
//! - **Adapters**: HTTP, WebSocket, auth and in-memory implementations
//! - **Persistence**: SQL implementations of the ports
//! - **Config**: Configuration management

pub mod adapters;
pub mod agents;
pub mod cli;
pub mod config;
pub mod domain;
pub mod persistence;
pub mod quota;
pub mod session;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::adapters::health_handler::HealthHandler;
use crate::adapters::jwt_verifier::JwtVerifier;
use crate::adapters::memory_store::{
    InMemoryInstanceStore, InMemoryProjectDirectory, InMemoryRecordSink,
};
use crate::adapters::metrics_handler::{MetricsCollector, MetricsHandler};
use crate::adapters::ws_handler::{ws_handler, WsState};
use crate::agents::hierarchy::HierarchyRouter;
use crate::agents::llm::{GenerationBackend, HttpUpstream};
use crate::agents::prompt::PromptRenderer;
use crate::agents::token::TokenCounter;
use crate::config::Settings;
use crate::domain::{InstancePort, ProjectPort, RecordPort, TokenPort, UsagePort};
use crate::persistence::DataStore;
use crate::quota::{InMemoryUsageStore, QuotaGate};
use crate::session::{ConnectionGate, SessionServices};

/// Everything a running server is wired from
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub gate: ConnectionGate,
    pub services: SessionServices,
    pub metrics: Arc<MetricsCollector>,
    /// Absent when every store is in memory
    pub store: Option<DataStore>,
}

/// Port implementations, either all SQL or all in memory
struct Stores {
    projects: Arc<dyn ProjectPort>,
    usage: Arc<dyn UsagePort>,
    instances: Arc<dyn InstancePort>,
    records: Arc<dyn RecordPort>,
    store: Option<DataStore>,
}

impl AppContext {
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);
        let upstream: Arc<dyn GenerationBackend> =
            Arc::new(HttpUpstream::new(&settings.upstream)?.with_metrics(metrics.clone()));
        Self::with_backend(settings, upstream, metrics).await
    }

    /// Wires the context around a caller-supplied generation backend.
    pub async fn with_backend(
        settings: &Settings,
        backend: Arc<dyn GenerationBackend>,
        metrics: Arc<MetricsCollector>,
    ) -> anyhow::Result<Self> {
        let stores = Self::open_stores(settings).await?;
        let tokens: Arc<dyn TokenPort> = Arc::new(JwtVerifier::from_config(&settings.auth)?);

        let quota = QuotaGate::new(stores.usage, settings.quota.limits()).with_metrics(metrics.clone());
        let router = HierarchyRouter::new(Arc::new(settings.catalog()), stores.instances);

        let services = SessionServices {
            quota: Arc::new(quota),
            router: Arc::new(router),
            backend,
            records: stores.records,
            prompts: Arc::new(PromptRenderer::new()?),
            metrics: metrics.clone(),
            tokens: TokenCounter::new(),
            upstream: settings.upstream.clone(),
            session: settings.session.clone(),
        };

        Ok(Self {
            settings: settings.clone(),
            gate: ConnectionGate::new(tokens, stores.projects),
            services,
            metrics,
            store: stores.store,
        })
    }

    async fn open_stores(settings: &Settings) -> anyhow::Result<Stores> {
        let Some(database) = &settings.database else {
            tracing::info!("No database configured, keeping all state in memory");
            let usage = settings
                .subscriptions
                .iter()
                .fold(InMemoryUsageStore::new(), |store, sub| {
                    store.with_limits(&sub.user_id, sub.limits())
                });
            return Ok(Stores {
                projects: Arc::new(InMemoryProjectDirectory::from_config(&settings.projects)),
                usage: Arc::new(usage),
                instances: Arc::new(InMemoryInstanceStore::new()),
                records: Arc::new(InMemoryRecordSink::new()),
                store: None,
            });
        };

        let store = DataStore::new(database).await?;
        tracing::info!(backend = store.backend().name(), "Connected to database");

        if database.auto_migrate {
            let result = store.migrate().await?;
            tracing::info!(
                applied = result.applied,
                skipped = result.skipped,
                "Database migrations complete"
            );
        }
        store.seed_from_settings(settings).await?;

        Ok(Stores {
            projects: store.projects().clone(),
            usage: store.usage().clone(),
            instances: store.instances().clone(),
            records: store.records().clone(),
            store: Some(store),
        })
    }
}

/// Creates the Axum application router with all endpoints configured.
pub fn create_app(ctx: &AppContext) -> Router {
    let health_handler = Arc::new(HealthHandler::new(ctx.store.clone()));
    let metrics_handler = Arc::new(MetricsHandler::new(ctx.metrics.clone()));

    let ws_state = WsState {
        gate: ctx.gate.clone(),
        services: ctx.services.clone(),
    };

    // Public routes (never throttled)
    let public_router = Router::new()
        // Health check endpoints
        .route("/health", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.health().await }
            }
        }))
        .route("/health/ready", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.ready().await }
            }
        }))
        .route("/health/live", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.live().await }
            }
        }));

    let mut limited_router = Router::new()
        // Metrics endpoint
        .route("/metrics", get({
            let handler = metrics_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.metrics().await }
            }
        }))
        // Execution sessions
        .route("/ws/projects/:project_id", get(ws_handler))
        .with_state(ws_state);

    if let Some(rate_limit) = &ctx.settings.rate_limit {
        if rate_limit.enabled {
            let limiter = crate::adapters::rate_limit::create_limiter(
                rate_limit.requests_per_second,
                rate_limit.burst_size,
            );

            limited_router = limited_router.layer(axum::middleware::from_fn_with_state(
                limiter,
                crate::adapters::rate_limit::rate_limit_middleware,
            ));
        }
    }

    let router = public_router.merge(limited_router);

    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.auth.jwt_secret = Some("secret".to_string());
        settings
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_metrics_routes() {
        let ctx = AppContext::from_settings(&settings()).await.unwrap();
        let app = create_app(&ctx);

        let response = app.clone().oneshot(get_request("/health/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("stratum_sessions_active"));

        let response = app.oneshot(get_request("/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_route_requires_websocket_upgrade() {
        let ctx = AppContext::from_settings(&settings()).await.unwrap();
        let app = create_app(&ctx);

        let response = app.oneshot(get_request("/ws/projects/p1")).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_rate_limit_spares_health_routes() {
        let mut settings = settings();
        settings.rate_limit = Some(RateLimitConfig {
            enabled: true,
            requests_per_second: 1,
            burst_size: 1,
        });
        let ctx = AppContext::from_settings(&settings).await.unwrap();
        let app = create_app(&ctx);

        let first = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_context_requires_signing_secret() {
        assert!(AppContext::from_settings(&Settings::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_context_with_database_seeds_projects() {
        let mut settings = settings();
        settings.database = Some(crate::persistence::PersistenceConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        });
        settings.projects = vec![crate::config::ProjectConfig {
            id: "p1".to_string(),
            owner_id: "alice".to_string(),
            name: None,
        }];

        let ctx = AppContext::from_settings(&settings).await.unwrap();
        let store = ctx.store.as_ref().unwrap();
        let access = crate::domain::ProjectPort::access(store.projects().as_ref(), "p1", "alice")
            .await
            .unwrap();
        assert_eq!(access, crate::domain::ProjectAccess::Owned);
    }
}
