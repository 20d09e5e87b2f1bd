//! Configuration for Sesame
//!
//! Command line arguments and environment variables are handled with clap,
//! the deployment settings live in a TOML file.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{Result, SesameError};

/// Sesame - door buzzer gateway
///
/// "Open sesame" for members, as long as the space is open.
#[derive(Parser, Debug, Clone)]
#[command(name = "sesame")]
#[command(about = "Relays door buzzer requests of authenticated members to the message bus")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "SESAME_CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also emit debug output of the bus client libraries
    #[arg(long, env = "BUS_DEBUG", default_value = "false")]
    pub debug_bus: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print an `enc_password` line for a local wiki user file
    HashPassword {
        /// Password to hash
        password: String,
    },
}

/// Complete file configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Lower the default filter to debug
    #[serde(default)]
    pub debug: bool,

    /// Append log output to this file instead of stdout
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Key store file, created on first start
    #[serde(default = "default_keys_file")]
    pub keys_file: PathBuf,

    /// Minimum duration of a login request, slows down password guessing
    #[serde(default = "default_login_delay_ms")]
    pub login_delay_ms: u64,

    /// Session lifetime without "remember me"
    #[serde(default = "default_session_hours")]
    pub session_hours: u64,

    /// Session lifetime with "remember me"
    #[serde(default = "default_remember_days")]
    pub remember_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            keys_file: default_keys_file(),
            login_delay_ms: default_login_delay_ms(),
            session_hours: default_session_hours(),
            remember_days: default_remember_days(),
        }
    }
}

impl ServerConfig {
    /// Session lifetime without "remember me"
    pub fn session_ttl(&self) -> Result<Duration> {
        hours_to_duration(self.session_hours, "server.session_hours")
    }

    /// Session lifetime with "remember me"
    pub fn remember_ttl(&self) -> Result<Duration> {
        let hours = self.remember_days.checked_mul(24).ok_or_else(|| {
            SesameError::Config("server.remember_days is out of range".into())
        })?;
        hours_to_duration(hours, "server.remember_days")
    }
}

fn hours_to_duration(hours: u64, key: &str) -> Result<Duration> {
    match hours.checked_mul(60 * 60) {
        Some(0) => Err(SesameError::Config(format!("{key} must be positive"))),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Err(SesameError::Config(format!("{key} is out of range"))),
    }
}

/// Message bus connection and topics
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Broker URL: mqtt://, mqtts://, tcp://, ssl://, nats:// or tls://
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// CA certificate (PEM). The system trust store is used when unset.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic carrying the space status
    pub status_topic: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_max_reconnect_interval_secs")]
    pub max_reconnect_interval_secs: u64,

    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    pub buzzer: BuzzerConfig,
}

impl BusConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// How buzz commands are addressed on the bus
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BuzzerConfig {
    /// One topic per door, the payload is the buzz duration in ms
    PerDoor {
        outer_topic: String,
        inner_glass_topic: String,
        inner_metal_topic: String,
    },
    /// One shared topic, the payload is "<door code> <user name>"
    Tagged { topic: String },
}

/// Which authenticator checks member credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    Online(OnlineAuthConfig),
    Local(LocalAuthConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnlineAuthConfig {
    /// Wiki base URL, the auth service action is appended
    pub wiki_base_url: String,

    pub auth_token: String,

    /// Freshness window of the email -> user name cache
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalAuthConfig {
    /// Directory with one wiki user file per account
    pub user_directory: PathBuf,

    /// Wiki page listing the members, one "* name" line each
    pub group_page_file: PathBuf,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_keys_file() -> PathBuf {
    PathBuf::from("keys.bin")
}
fn default_login_delay_ms() -> u64 { 1000 }
fn default_session_hours() -> u64 { 24 }
fn default_remember_days() -> u64 { 180 }
fn default_client_id() -> String {
    "sesam".to_string()
}
fn default_keep_alive_secs() -> u64 { 10 }
fn default_max_reconnect_interval_secs() -> u64 { 5 * 60 }
fn default_publish_timeout_secs() -> u64 { 10 }
fn default_cache_max_age_secs() -> u64 { 24 * 60 * 60 }
fn default_request_timeout_secs() -> u64 { 10 }

impl Config {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SesameError::Config(format!("Could not read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bus.url.trim().is_empty() {
            return Err(SesameError::Config("bus.url must not be empty".into()));
        }
        if self.bus.status_topic.trim().is_empty() {
            return Err(SesameError::Config("bus.status_topic must not be empty".into()));
        }
        let topics: Vec<&str> = match &self.bus.buzzer {
            BuzzerConfig::PerDoor {
                outer_topic,
                inner_glass_topic,
                inner_metal_topic,
            } => vec![outer_topic, inner_glass_topic, inner_metal_topic],
            BuzzerConfig::Tagged { topic } => vec![topic],
        };
        if topics.iter().any(|t| t.trim().is_empty()) {
            return Err(SesameError::Config("buzzer topics must not be empty".into()));
        }
        if self.bus.max_reconnect_interval_secs == 0 {
            return Err(SesameError::Config(
                "bus.max_reconnect_interval_secs must be positive".into(),
            ));
        }
        if self.bus.publish_timeout_secs == 0 {
            return Err(SesameError::Config("bus.publish_timeout_secs must be positive".into()));
        }

        self.server.session_ttl()?;
        self.server.remember_ttl()?;

        if let AuthConfig::Online(online) = &self.auth {
            if online.wiki_base_url.trim().is_empty() {
                return Err(SesameError::Config("auth.wiki_base_url must not be empty".into()));
            }
        }

        Ok(())
    }
}
