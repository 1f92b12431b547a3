use clap::Parser;
use std::path::PathBuf;

use crate::config::LogFormat;

/// Stratum - real-time multi-agent execution server
#[derive(Parser, Debug, Clone)]
#[command(name = "stratum", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "STRATUM_CONFIG", default_value = "stratum.toml")]
    pub config: PathBuf,

    /// Server host address
    #[arg(long, env = "STRATUM_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "STRATUM_PORT")]
    pub port: Option<u16>,

    /// Database URL (sqlite://... or postgres://...); in-memory stores when unset
    #[arg(long, env = "STRATUM_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Base URL of the upstream text-generation service
    #[arg(long, env = "STRATUM_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Log output format
    #[arg(long, env = "STRATUM_LOG_FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format '{}' (expected pretty or json)", other)),
    }
}
