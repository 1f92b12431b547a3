use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

pub mod validator;

use crate::agents::catalog::{default_specs, AgentCatalog};
use crate::agents::domain::AgentTypeSpec;
use crate::cli::Cli;
use crate::domain::auth::AuthConfig;
use crate::domain::UsageLimits;
use crate::persistence::PersistenceConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub session: SessionSettings,
    /// Absent means every store is kept in memory
    #[serde(default)]
    pub database: Option<PersistenceConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Projects seeded at startup; the whole registry when no database is configured
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    /// Subscription limits seeded at startup
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub agent_types: Vec<AgentTypeSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Upstream text-generation service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub generate_path: String,
    /// Bound on establishing the connection
    pub connect_timeout_secs: u64,
    /// Overall ceiling for one generation, body included
    pub request_timeout_secs: u64,
    /// Thinking mode when neither the message nor the agent type sets it
    pub default_think: bool,
    /// Capacity of the channel between the read loop and the session
    pub event_buffer: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            generate_path: "/api/generate".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 600,
            default_think: false,
            event_buffer: 64,
        }
    }
}

impl UpstreamSettings {
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.generate_path.trim_start_matches('/')
        )
    }
}

/// Limits for users without a subscription row. `-1` means unlimited.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub default_max_actions_per_day: i64,
    pub default_max_tokens_per_day: i64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            default_max_actions_per_day: 100,
            default_max_tokens_per_day: UsageLimits::UNLIMITED,
        }
    }
}

impl QuotaSettings {
    pub fn limits(&self) -> UsageLimits {
        UsageLimits {
            max_actions_per_day: self.default_max_actions_per_day,
            max_tokens_per_day: self.default_max_tokens_per_day,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    /// User/assistant turns kept per instance and fed into the next prompt
    pub max_history_turns: usize,
    /// How long a cancelled read loop may take to wind down before the
    /// session stops waiting for it
    pub cancel_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_history_turns: 20,
            cancel_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub user_id: String,
    #[serde(default = "unlimited")]
    pub max_actions_per_day: i64,
    #[serde(default = "unlimited")]
    pub max_tokens_per_day: i64,
}

fn unlimited() -> i64 {
    UsageLimits::UNLIMITED
}

impl SubscriptionConfig {
    pub fn limits(&self) -> UsageLimits {
        UsageLimits {
            max_actions_per_day: self.max_actions_per_day,
            max_tokens_per_day: self.max_tokens_per_day,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, anyhow::Error> {
        Self::from_root(".")
    }

    /// Create settings from CLI arguments (includes config file and CLI overrides)
    pub fn new_with_cli(cli: &Cli) -> Result<Self, anyhow::Error> {
        let root = cli
            .config
            .parent()
            .and_then(|p| p.to_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(".")
            .to_string();

        let mut settings = Self::build(File::from(cli.config.clone()).required(false))?;

        // CLI > env vars > config file
        settings.apply_cli_overrides(cli);
        settings.load_external_configs(&root)?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn from_root(root: &str) -> Result<Self, anyhow::Error> {
        let config_path = std::path::Path::new(root).join("stratum");
        let mut settings = Self::build(File::from(config_path).required(false))?;

        settings.load_external_configs(root)?;
        settings.validate()?;

        Ok(settings)
    }

    fn build<S>(file: S) -> Result<Self, anyhow::Error>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("STRATUM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .build()?;

        Ok(s.try_deserialize()?)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        validator::ConfigValidator::validate(self).map_err(|errors| {
            let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow::anyhow!(
                "Configuration validation failed:\n{}",
                error_messages.join("\n")
            )
        })
    }

    /// Apply CLI argument overrides to settings
    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(url) = &cli.upstream_url {
            self.upstream.base_url = url.clone();
        }
        if let Some(url) = &cli.database_url {
            let database = self.database.get_or_insert_with(PersistenceConfig::default);
            database.url = url.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
    }

    fn load_external_configs(&mut self, root: &str) -> Result<(), anyhow::Error> {
        self.load_agent_types_from_dir(&format!("{}/config/agent_types", root))
    }

    /// Agent types from individual files. A file entry replaces an inline
    /// `[[agent_types]]` entry for the same role.
    fn load_agent_types_from_dir(&mut self, path: &str) -> Result<(), anyhow::Error> {
        let pattern = format!("{}/*", path);
        let mut paths: Vec<_> = glob::glob(&pattern)?.filter_map(Result::ok).collect();
        paths.sort();

        for path in paths {
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !matches!(ext, "json" | "yaml" | "yml" | "toml") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let spec: AgentTypeSpec = match ext {
                "json" => serde_json::from_str(&content)?,
                "toml" => toml::from_str(&content)?,
                _ => serde_yaml::from_str(&content)?,
            };
            tracing::debug!(role = %spec.role, path = %path.display(), "Loaded agent type");
            self.agent_types.retain(|existing| existing.role != spec.role);
            self.agent_types.push(spec);
        }
        Ok(())
    }

    /// The configured agent catalog, or the built-in one when none is configured.
    pub fn catalog(&self) -> AgentCatalog {
        if self.agent_types.is_empty() {
            AgentCatalog::from_specs(default_specs())
        } else {
            AgentCatalog::from_specs(self.agent_types.clone())
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            auth: AuthConfig::default(),
            upstream: UpstreamSettings::default(),
            quota: QuotaSettings::default(),
            session: SessionSettings::default(),
            database: None,
            rate_limit: None,
            logging: LoggingSettings::default(),
            projects: Vec::new(),
            subscriptions: Vec::new(),
            agent_types: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::domain::AgentRole;

    #[test]
    fn test_upstream_endpoint_joins_slashes() {
        let mut upstream = UpstreamSettings::default();
        assert_eq!(upstream.endpoint(), "http://localhost:11434/api/generate");

        upstream.base_url = "http://gen:8000/".to_string();
        upstream.generate_path = "v1/stream".to_string();
        assert_eq!(upstream.endpoint(), "http://gen:8000/v1/stream");
    }

    #[test]
    fn test_catalog_falls_back_to_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.catalog().len(), AgentRole::ALL.len());
    }

    #[test]
    fn test_configured_catalog_replaces_defaults() {
        let settings = Settings {
            agent_types: vec![AgentTypeSpec::new(AgentRole::Orchestrator, 0)],
            ..Settings::default()
        };
        let catalog = settings.catalog();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(AgentRole::Architect).is_none());
    }

    #[test]
    fn test_quota_defaults() {
        let limits = QuotaSettings::default().limits();
        assert_eq!(limits.max_actions_per_day, 100);
        assert_eq!(limits.max_tokens_per_day, UsageLimits::UNLIMITED);
    }
}
