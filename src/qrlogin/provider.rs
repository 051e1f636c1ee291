use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

use crate::config::WeChatSettings;
use crate::error::{AppError, AppResult};
use crate::sysconfig::{self, WECHAT_ACCOUNT_TYPE, WECHAT_APP_ID, WECHAT_APP_SECRET, WECHAT_SCOPE};

const OPEN_BASE: &str = "https://open.weixin.qq.com";
const API_BASE: &str = "https://api.weixin.qq.com";
/// Lifetime of a provider QR authorization
pub const QR_EXPIRE_SECONDS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    /// Website QR login through the open platform
    OpenPlatform,
    /// In-app authorization through an official account
    OfficialAccount,
}

impl AccountType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "official_account" => Self::OfficialAccount,
            _ => Self::OpenPlatform,
        }
    }
}

/// Client credentials and mode for one provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub app_id: String,
    pub app_secret: String,
    pub account_type: AccountType,
    pub scope: String,
}

impl Credentials {
    /// Secret with only its first and last four characters visible
    pub fn masked_secret(&self) -> String {
        let chars: Vec<char> = self.app_secret.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}****{tail}")
        } else {
            "****".to_string()
        }
    }
}

/// Persisted rows win over static settings; blank values count as missing
pub fn resolve_credentials(stored: &HashMap<String, String>, fallback: &WeChatSettings) -> AppResult<Credentials> {
    let pick = |key: &str, static_value: &str| {
        stored
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| static_value.trim())
            .to_string()
    };

    let app_id = pick(WECHAT_APP_ID, &fallback.app_id);
    let app_secret = pick(WECHAT_APP_SECRET, &fallback.app_secret);
    if app_id.is_empty() || app_secret.is_empty() {
        return Err(AppError::InvalidArgument(
            "WeChat AppID and AppSecret are not configured".to_string(),
        ));
    }

    let mut scope = pick(WECHAT_SCOPE, &fallback.scope);
    if scope.is_empty() {
        scope = "snsapi_userinfo".to_string();
    }

    Ok(Credentials {
        app_id,
        app_secret,
        account_type: AccountType::parse(&pick(WECHAT_ACCOUNT_TYPE, &fallback.account_type)),
        scope,
    })
}

/// Where provider credentials come from at callback time
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load(&self) -> AppResult<Credentials>;
}

/// Reads `system_configs`, falling back to static settings
pub struct StoredCredentials {
    pool: PgPool,
    fallback: WeChatSettings,
}

impl StoredCredentials {
    pub fn new(pool: PgPool, fallback: WeChatSettings) -> Self {
        Self { pool, fallback }
    }
}

#[async_trait]
impl CredentialSource for StoredCredentials {
    async fn load(&self) -> AppResult<Credentials> {
        let mut conn = self.pool.acquire().await?;
        let stored = sysconfig::get_values(
            &mut conn,
            &[WECHAT_APP_ID, WECHAT_APP_SECRET, WECHAT_ACCOUNT_TYPE, WECHAT_SCOPE],
        )
        .await?;
        resolve_credentials(&stored, &self.fallback)
    }
}

/// Result of exchanging an authorization code
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessGrant {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(rename = "openid")]
    pub open_id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default, rename = "unionid")]
    pub union_id: String,
}

/// The scanning person as the provider describes them
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExternalProfile {
    #[serde(rename = "openid")]
    pub open_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default, rename = "headimgurl")]
    pub avatar: String,
    #[serde(default, rename = "unionid")]
    pub union_id: String,
}

impl ExternalProfile {
    pub const MAX_NICKNAME_CHARS: usize = 50;
    pub const MAX_AVATAR_CHARS: usize = 255;

    /// Trim to what the users table can hold. A cut URL is useless, so an
    /// over-long avatar is dropped and the stored one is kept.
    pub fn fitted(mut self) -> Self {
        self.nickname = self.nickname.trim().chars().take(Self::MAX_NICKNAME_CHARS).collect();
        if self.avatar.chars().count() > Self::MAX_AVATAR_CHARS {
            self.avatar.clear();
        }
        self
    }
}

/// What the browser needs to render a QR code
#[derive(Debug, Clone, Serialize)]
pub struct QrPayload {
    pub auth_url: String,
    pub expire_seconds: u64,
}

/// An external OAuth identity provider
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn authorization_url(&self, creds: &Credentials, redirect_uri: &str, state: &str) -> AppResult<String>;

    async fn exchange_code(&self, creds: &Credentials, code: &str) -> AppResult<AccessGrant>;

    async fn fetch_profile(&self, grant: &AccessGrant) -> AppResult<ExternalProfile>;

    fn qr_payload(&self, creds: &Credentials, redirect_uri: &str, state: &str) -> AppResult<QrPayload> {
        Ok(QrPayload {
            auth_url: self.authorization_url(creds, redirect_uri, state)?,
            expire_seconds: QR_EXPIRE_SECONDS,
        })
    }
}

/// Error body the provider returns in place of a payload
#[derive(Debug, Default, Deserialize)]
struct ProviderStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

fn provider_error(code: i64, message: &str) -> AppError {
    let explained = match code {
        40013 => "invalid AppID or AppSecret".to_string(),
        40029 => "authorization code is invalid or expired, please scan again".to_string(),
        40163 => "authorization code has already been used, please scan again".to_string(),
        40125 => "scope is not permitted for this AppID".to_string(),
        _ => format!("errcode {code}"),
    };
    AppError::Upstream(format!("{explained} ({message})"))
}

/// WeChat open-platform and official-account OAuth client
#[derive(Clone)]
pub struct WeChatClient {
    http: reqwest::Client,
}

impl Default for WeChatClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WeChatClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> AppResult<T> {
        // The provider answers with text/plain, so decode by hand.
        let body = self.http.get(url).send().await?.error_for_status()?.text().await?;

        let status: ProviderStatus = serde_json::from_str(&body).unwrap_or_default();
        if status.errcode != 0 {
            return Err(provider_error(status.errcode, &status.errmsg));
        }

        serde_json::from_str(&body)
            .map_err(|e| AppError::Upstream(format!("unexpected provider response: {e}")))
    }
}

fn parse_url(base: &str, path: &str, params: &[(&str, &str)]) -> AppResult<Url> {
    Url::parse_with_params(&format!("{base}{path}"), params)
        .map_err(|e| AppError::Internal(format!("invalid provider url: {e}")))
}

#[async_trait]
impl OAuthProvider for WeChatClient {
    fn authorization_url(&self, creds: &Credentials, redirect_uri: &str, state: &str) -> AppResult<String> {
        let (path, scope) = match creds.account_type {
            AccountType::OpenPlatform => ("/connect/qrconnect", "snsapi_login"),
            AccountType::OfficialAccount => ("/connect/oauth2/authorize", creds.scope.as_str()),
        };

        let mut url = parse_url(
            OPEN_BASE,
            path,
            &[
                ("appid", creds.app_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope),
                ("state", state),
            ],
        )?;
        url.set_fragment(Some("wechat_redirect"));
        Ok(url.into())
    }

    async fn exchange_code(&self, creds: &Credentials, code: &str) -> AppResult<AccessGrant> {
        let url = parse_url(
            API_BASE,
            "/sns/oauth2/access_token",
            &[
                ("appid", creds.app_id.as_str()),
                ("secret", creds.app_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
            ],
        )?;

        let grant: AccessGrant = self.get_json(url).await?;
        debug!("Exchanged authorization code for openid {}", grant.open_id);
        Ok(grant)
    }

    async fn fetch_profile(&self, grant: &AccessGrant) -> AppResult<ExternalProfile> {
        let url = parse_url(
            API_BASE,
            "/sns/userinfo",
            &[
                ("access_token", grant.access_token.as_str()),
                ("openid", grant.open_id.as_str()),
            ],
        )?;

        let profile: ExternalProfile = self.get_json(url).await?;
        if profile.open_id.is_empty() {
            return Err(AppError::Upstream("profile response carried no openid".to_string()));
        }
        Ok(profile)
    }
}
