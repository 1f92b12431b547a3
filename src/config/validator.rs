use std::collections::HashMap;
use thiserror::Error;

use crate::agents::domain::AgentTypeSpec;
use crate::config::{
    ProjectConfig, QuotaSettings, RateLimitConfig, ServerSettings, Settings, SubscriptionConfig,
    UpstreamSettings,
};
use crate::domain::auth::{AuthConfig, AuthMode};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Cross-reference error: {0}")]
    CrossReference(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Collects every problem instead of stopping at the first one.
    pub fn validate(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        Self::validate_server(&settings.server, &mut errors);
        Self::validate_auth(&settings.auth, &mut errors);
        Self::validate_upstream(&settings.upstream, &mut errors);
        Self::validate_quota(&settings.quota, &mut errors);
        Self::validate_subscriptions(&settings.subscriptions, &mut errors);
        Self::validate_projects(&settings.projects, &mut errors);
        Self::validate_agent_types(&settings.agent_types, &mut errors);

        if let Some(rate_limit) = &settings.rate_limit {
            Self::validate_rate_limit(rate_limit, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_server(server: &ServerSettings, errors: &mut Vec<ValidationError>) {
        if server.host.is_empty() {
            errors.push(ValidationError::MissingField("server.host".to_string()));
        }

        if server.port == 0 {
            errors.push(invalid("server.port", "Port must be greater than 0"));
        }
    }

    fn validate_auth(auth: &AuthConfig, errors: &mut Vec<ValidationError>) {
        match auth.mode {
            AuthMode::BearerToken => {
                if auth.jwt_secret.as_deref().map_or(true, str::is_empty) {
                    errors.push(ValidationError::MissingField("auth.jwt_secret".to_string()));
                }
                if let Some(algorithm) = &auth.jwt_algorithm {
                    if !matches!(algorithm.as_str(), "HS256" | "HS384" | "HS512") {
                        errors.push(invalid(
                            "auth.jwt_algorithm",
                            format!("'{}' is not an HMAC algorithm", algorithm),
                        ));
                    }
                }
            }
            AuthMode::Jwks => match auth.jwks_url.as_deref() {
                None | Some("") => {
                    errors.push(ValidationError::MissingField("auth.jwks_url".to_string()));
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    errors.push(invalid("auth.jwks_url", "Must be an http(s) URL"));
                }
                Some(_) => {}
            },
        }
    }

    fn validate_upstream(upstream: &UpstreamSettings, errors: &mut Vec<ValidationError>) {
        if !upstream.base_url.starts_with("http://") && !upstream.base_url.starts_with("https://") {
            errors.push(invalid("upstream.base_url", "Must be an http(s) URL"));
        }
        if upstream.connect_timeout_secs == 0 {
            errors.push(invalid("upstream.connect_timeout_secs", "Must be greater than 0"));
        }
        if upstream.request_timeout_secs < upstream.connect_timeout_secs {
            errors.push(invalid(
                "upstream.request_timeout_secs",
                "Must not be shorter than connect_timeout_secs",
            ));
        }
        if upstream.event_buffer == 0 {
            errors.push(invalid("upstream.event_buffer", "Must be greater than 0"));
        }
    }

    fn validate_limit(field: &str, value: i64, errors: &mut Vec<ValidationError>) {
        if value < -1 {
            errors.push(invalid(field, "Must be -1 (unlimited) or a non-negative count"));
        }
    }

    fn validate_quota(quota: &QuotaSettings, errors: &mut Vec<ValidationError>) {
        Self::validate_limit(
            "quota.default_max_actions_per_day",
            quota.default_max_actions_per_day,
            errors,
        );
        Self::validate_limit(
            "quota.default_max_tokens_per_day",
            quota.default_max_tokens_per_day,
            errors,
        );
    }

    fn validate_subscriptions(
        subscriptions: &[SubscriptionConfig],
        errors: &mut Vec<ValidationError>,
    ) {
        let mut seen = HashMap::new();
        for (idx, subscription) in subscriptions.iter().enumerate() {
            if let Some(prev_idx) = seen.insert(&subscription.user_id, idx) {
                errors.push(ValidationError::Duplicate(format!(
                    "Subscription for '{}' appears at indices {} and {}",
                    subscription.user_id, prev_idx, idx
                )));
            }
            Self::validate_limit(
                &format!("subscriptions[{}].max_actions_per_day", idx),
                subscription.max_actions_per_day,
                errors,
            );
            Self::validate_limit(
                &format!("subscriptions[{}].max_tokens_per_day", idx),
                subscription.max_tokens_per_day,
                errors,
            );
        }
    }

    fn validate_projects(projects: &[ProjectConfig], errors: &mut Vec<ValidationError>) {
        let mut seen = HashMap::new();
        for (idx, project) in projects.iter().enumerate() {
            if project.id.is_empty() {
                errors.push(ValidationError::MissingField(format!("projects[{}].id", idx)));
            }
            if project.owner_id.is_empty() {
                errors.push(ValidationError::MissingField(format!(
                    "projects[{}].owner_id",
                    idx
                )));
            }
            if let Some(prev_idx) = seen.insert(&project.id, idx) {
                errors.push(ValidationError::Duplicate(format!(
                    "Project '{}' appears at indices {} and {}",
                    project.id, prev_idx, idx
                )));
            }
        }
    }

    fn validate_agent_types(specs: &[AgentTypeSpec], errors: &mut Vec<ValidationError>) {
        let mut levels = HashMap::new();
        for (idx, spec) in specs.iter().enumerate() {
            if levels.insert(spec.role, spec.hierarchy_level).is_some() {
                errors.push(ValidationError::Duplicate(format!(
                    "Agent type '{}' is defined more than once",
                    spec.role
                )));
            }
            if spec.generation.max_iterations == 0 {
                errors.push(invalid(
                    format!("agent_types[{}].generation.max_iterations", idx),
                    "Must be greater than 0",
                ));
            }
        }

        for spec in specs {
            for hire in &spec.can_hire {
                match levels.get(hire) {
                    None => errors.push(ValidationError::CrossReference(format!(
                        "Agent type '{}' can hire undefined type '{}'",
                        spec.role, hire
                    ))),
                    Some(level) if *level <= spec.hierarchy_level => {
                        errors.push(ValidationError::CrossReference(format!(
                            "Agent type '{}' (level {}) can hire '{}' (level {}) which does not sit below it",
                            spec.role, spec.hierarchy_level, hire, level
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
    }

    fn validate_rate_limit(rate_limit: &RateLimitConfig, errors: &mut Vec<ValidationError>) {
        if rate_limit.enabled && rate_limit.requests_per_second == 0 {
            errors.push(invalid(
                "rate_limit.requests_per_second",
                "Must be greater than 0 when rate limiting is enabled",
            ));
        }
        if rate_limit.enabled && rate_limit.burst_size == 0 {
            errors.push(invalid(
                "rate_limit.burst_size",
                "Must be greater than 0 when rate limiting is enabled",
            ));
        }
    }
}
