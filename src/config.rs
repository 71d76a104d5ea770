use std::collections::HashMap;
use std::net::IpAddr;

use config::{Config, Environment, File};
use ipnet::IpNet;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_address: String,
    pub base_path: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub trusted_reverse_proxy_ranges: Vec<IpNet>,
    #[serde(default)]
    pub require_jwt_account: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: String,
    #[serde(default = "default_shard_layers")]
    pub shard_layers: usize,
    #[serde(default = "default_max_upload_size")]
    pub maximum_upload_size: u64,
}

fn default_shard_layers() -> usize {
    6
}

fn default_max_upload_size() -> u64 {
    // 10 GiB
    10 * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpirationConfig {
    #[serde(default = "default_anonymous_ttl")]
    pub anonymous_ttl_seconds: i64,
    #[serde(default = "default_identified_ttl")]
    pub identified_ttl_seconds: i64,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_grace")]
    pub grace_seconds: i64,
}

fn default_anonymous_ttl() -> i64 {
    60 * 60 * 24
}
fn default_identified_ttl() -> i64 {
    60 * 60 * 24 * 30
}
fn default_check_interval() -> u64 {
    60
}
fn default_grace() -> i64 {
    60 * 60 * 24
}

/// An external command invoked before a scratch blob is finalized, matched
/// against the sniffed MIME type via a glob pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct PreFinishCommand {
    pub pattern: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reject_on_nonzero_exit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub expiration: ExpirationConfig,
    #[serde(default)]
    pub pre_finish_commands: Vec<PreFinishCommand>,
    /// HMAC secret per JWT issuer; `*` is the fallback used when the issuer
    /// has no dedicated entry.
    #[serde(default)]
    pub jwt_secrets_by_issuer: HashMap<String, String>,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Settings {
    pub fn load(config_path: &str) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("TUSISTOR").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    pub fn trusted_ip(&self, ip: IpAddr) -> bool {
        self.server.trusted_reverse_proxy_ranges.iter().any(|net| net.contains(&ip))
    }
}
