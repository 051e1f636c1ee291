use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub jwt: JwtSettings,
    pub wechat: WeChatSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub bind: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    /// Connection used only for running migrations
    pub admin_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    pub secret: String,
    pub expiration_seconds: i64,
    pub issuer: String,
}

/// Static external-identity provider settings; persisted rows take precedence
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeChatSettings {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    pub account_type: String,
    pub scope: String,
    #[serde(default)]
    pub callback_domain: String,
    pub ticket_ttl_seconds: u64,
}

impl Settings {
    /// Layer `config/default.toml` (optional) under `PM__`-prefixed environment variables
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .set_default("server.bind", "0.0.0.0:8080")?
            .set_default("database.max_connections", 5)?
            .set_default("jwt.expiration_seconds", 86400)?
            .set_default("jwt.issuer", "pmcore")?
            .set_default("wechat.account_type", "open_platform")?
            .set_default("wechat.scope", "snsapi_userinfo")?
            .set_default("wechat.ticket_ttl_seconds", 600)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::with_prefix("PM").separator("__"))
            .build()
            .context("Failed to assemble configuration")?;

        let settings: Settings = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        if settings.jwt.secret.trim().is_empty() {
            anyhow::bail!("jwt.secret must be set");
        }

        info!("Configuration loaded, binding to {}", settings.server.bind);
        Ok(settings)
    }
}
