use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::store::StoreBackend;

/// Command-line flags. Only flags that were actually given are layered over
/// the file and environment, so a TOML value is not clobbered by a CLI default.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "presence-server", version, about = "Presence and single-session server")]
pub struct Cli {
    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./presence.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Data directory for persistent state (session key, SQLite store)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Identity store backend
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreBackend>,

    /// Shared secret for the admin endpoints
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Print a session token for the given user identity and exit
    #[arg(long, value_name = "USER_IDENTITY")]
    #[serde(skip)]
    pub issue_token: Option<String>,
}

/// Effective server configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub data_dir: String,
    pub store: StoreBackend,
    /// Generated at boot and logged when left empty.
    pub admin_secret: String,
    /// Lifetime of tokens printed by --issue-token.
    pub session_ttl_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            data_dir: "./data".to_string(),
            store: StoreBackend::Memory,
            admin_secret: String::new(),
            session_ttl_secs: 86400,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PRESENCE_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Self::figment(cli).extract()
    }

    fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("PRESENCE_"))
            .merge(Serialized::defaults(cli.clone()))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Presence Server Configuration
# Place this file at ./presence.toml or specify with --config <path>
# All settings can be overridden via environment variables (PRESENCE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3000)
# port = 3000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the session signing key and the SQLite store
# data_dir = "./data"

# Identity store backend: "memory" (single process) or "sqlite"
# (shared file under data_dir, usable by several processes on one host)
# store = "memory"

# Shared secret for POST /api/notify and POST /api/presence.
# Generated and printed at boot when empty.
# admin_secret = ""

# Lifetime in seconds of tokens printed by --issue-token (default: 86400)
# session_ttl_secs = 86400
"#
    .to_string()
}
