use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::net::SocketAddr;
use stratum::config::{ProjectConfig, Settings, SubscriptionConfig};
use stratum::persistence::PersistenceConfig;
use stratum::{create_app, AppContext};

use super::upstream::ScriptedUpstream;

pub const SECRET: &str = "integration-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub upstream: ScriptedUpstream,
    pub ctx: AppContext,
}

fn project(id: &str, owner_id: &str) -> ProjectConfig {
    ProjectConfig {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        name: None,
    }
}

impl TestServer {
    /// In-memory stores. alice owns p1, bob owns p2, carol owns p3 and may
    /// send one message per day.
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    /// Same accounts, persisted in an in-memory SQLite database
    pub async fn with_database() -> Self {
        Self::with_settings(|settings| {
            settings.database = Some(PersistenceConfig {
                url: "sqlite::memory:".to_string(),
                ..PersistenceConfig::default()
            });
        })
        .await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let (upstream, upstream_url) = ScriptedUpstream::start().await;

        let mut settings = Settings::default();
        settings.server.port = 0; // Random port
        settings.auth.jwt_secret = Some(SECRET.to_string());
        settings.upstream.base_url = upstream_url;
        settings.upstream.request_timeout_secs = 30;
        settings.projects = vec![project("p1", "alice"), project("p2", "bob"), project("p3", "carol")];
        settings.subscriptions = vec![SubscriptionConfig {
            user_id: "carol".to_string(),
            max_actions_per_day: 1,
            max_tokens_per_day: -1,
        }];
        configure(&mut settings);

        let ctx = AppContext::from_settings(&settings).await.unwrap();
        let app = create_app(&ctx);

        // Start server on random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            addr,
            base_url,
            upstream,
            ctx,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ws_url(&self, project_id: &str) -> String {
        format!("ws://{}/ws/projects/{}", self.addr, project_id)
    }
}

fn token_expiring_in(user_id: &str, secs: i64) -> String {
    let claims = json!({
        "sub": user_id,
        "exp": chrono::Utc::now().timestamp() + secs,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn token_for(user_id: &str) -> String {
    token_expiring_in(user_id, 3600)
}

pub fn expired_token_for(user_id: &str) -> String {
    token_expiring_in(user_id, -3600)
}
