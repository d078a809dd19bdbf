//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Web authorization gateway for the community bot dashboard
#[derive(Parser, Debug)]
#[command(name = "guild-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GUILD_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GUILD_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "GUILD_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GUILD_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GUILD_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
