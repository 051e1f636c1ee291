use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::{PgConnection, PgPool};
use tracing::info;

use super::Purpose;
use super::provider::ExternalProfile;
use crate::auth::{AuthService, role_codes};
use crate::error::{AppError, AppResult};
use crate::model::{AuthContext, User, UserProfile};
use crate::sysconfig;

const MAX_USERNAME_ATTEMPTS: u32 = 5;
const MAX_USERNAME_CHARS: usize = 40;

/// The ticket a callback resolved to
#[derive(Debug, Clone)]
pub struct TicketContext {
    pub ticket: String,
    pub purpose: Purpose,
    pub bind_user: Option<i32>,
}

/// Per-purpose work done once the provider has identified the scanner
#[async_trait]
pub trait PurposeHandler: Send + Sync {
    fn purpose(&self) -> Purpose;

    /// Preconditions checked before talking to the provider
    async fn validate(&self, _ctx: &TicketContext) -> AppResult<()> {
        Ok(())
    }

    /// Apply the platform-side effects; the value becomes the success payload
    async fn process(&self, ctx: &TicketContext, profile: &ExternalProfile) -> AppResult<Value>;

    /// Title and subtitle of the page shown on the phone afterwards
    fn success_text(&self) -> (&'static str, &'static str);

    fn failure_title(&self) -> &'static str;
}

/// Username to try on the `attempt`-th insert (1-based)
pub fn username_candidate(nickname: &str, open_id: &str, attempt: u32) -> String {
    let base: String = match nickname.trim() {
        "" => {
            let chars: Vec<char> = open_id.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(8)..].iter().collect();
            format!("user_{tail}")
        }
        name => name.chars().take(MAX_USERNAME_CHARS).collect(),
    };

    if attempt <= 1 {
        base
    } else {
        format!("{base}_{attempt}")
    }
}

async fn live_holder(conn: &mut PgConnection, open_id: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE wechat_open_id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(open_id)
    .fetch_optional(conn)
    .await?;
    Ok(user)
}

async fn deleted_holder(conn: &mut PgConnection, open_id: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE wechat_open_id = $1 AND deleted_at IS NOT NULL
         ORDER BY deleted_at DESC, id DESC LIMIT 1 FOR UPDATE",
    )
    .bind(open_id)
    .fetch_optional(conn)
    .await?;
    Ok(user)
}

/// Create a user for `profile`, suffixing the username until a free one is found
async fn insert_external_user(conn: &mut PgConnection, profile: &ExternalProfile) -> AppResult<User> {
    for attempt in 1..=MAX_USERNAME_ATTEMPTS {
        let username = username_candidate(&profile.nickname, &profile.open_id, attempt);
        let nickname = if profile.nickname.trim().is_empty() {
            username.clone()
        } else {
            profile.nickname.clone()
        };

        let inserted = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, nickname, avatar, wechat_open_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (username) WHERE deleted_at IS NULL DO NOTHING
             RETURNING *",
        )
        .bind(&username)
        .bind(&nickname)
        .bind(&profile.avatar)
        .bind(&profile.open_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(user) = inserted {
            info!("Created user {} for external identity", user.username);
            return Ok(user);
        }
    }

    Err(AppError::Conflict("could not find a free username, please retry".to_string()))
}

/// Refresh avatar and, when the provider sent one, the nickname
async fn refresh_profile(conn: &mut PgConnection, user_id: i32, profile: &ExternalProfile) -> AppResult<User> {
    let user = sqlx::query_as::<_, User>(
        "UPDATE users SET
             avatar = CASE WHEN $2 <> '' THEN $2 ELSE avatar END,
             nickname = CASE WHEN $3 <> '' THEN $3 ELSE nickname END,
             updated_at = now()
         WHERE id = $1
         RETURNING *",
    )
    .bind(user_id)
    .bind(&profile.avatar)
    .bind(profile.nickname.trim())
    .fetch_one(conn)
    .await?;
    Ok(user)
}

async fn profile_payload(conn: &mut PgConnection, user: &User) -> AppResult<Value> {
    let roles = role_codes(conn, user.id).await?;
    Ok(json!({ "user": UserProfile::from_user(user, roles) }))
}

/// Sign in by external identity, creating the account on first scan
pub struct LoginHandler {
    pool: PgPool,
    auth: AuthService,
}

impl LoginHandler {
    pub fn new(pool: PgPool, auth: AuthService) -> Self {
        Self { pool, auth }
    }
}

#[async_trait]
impl PurposeHandler for LoginHandler {
    fn purpose(&self) -> Purpose {
        Purpose::Login
    }

    async fn process(&self, _ctx: &TicketContext, profile: &ExternalProfile) -> AppResult<Value> {
        let mut tx = self.pool.begin().await?;

        let user = match live_holder(&mut tx, &profile.open_id).await? {
            Some(user) => user,
            None => {
                if deleted_holder(&mut tx, &profile.open_id).await?.is_some() {
                    return Err(AppError::Forbidden("this account has been deleted".to_string()));
                }
                insert_external_user(&mut tx, profile).await?
            }
        };

        if !user.is_enabled() {
            return Err(AppError::Forbidden("account is disabled".to_string()));
        }

        let user = refresh_profile(&mut tx, user.id, profile).await?;
        let session = self.auth.issue_session(&mut tx, &user).await?;
        tx.commit().await?;

        info!("User {} signed in by QR", user.username);
        serde_json::to_value(session).map_err(|e| AppError::Internal(e.to_string()))
    }

    fn success_text(&self) -> (&'static str, &'static str) {
        ("登录成功", "请返回 PC 端查看")
    }

    fn failure_title(&self) -> &'static str {
        "登录失败"
    }
}

/// First-run setup: the scanner becomes the administrator
pub struct InitializeHandler {
    pool: PgPool,
    auth: AuthService,
}

impl InitializeHandler {
    pub fn new(pool: PgPool, auth: AuthService) -> Self {
        Self { pool, auth }
    }
}

#[async_trait]
impl PurposeHandler for InitializeHandler {
    fn purpose(&self) -> Purpose {
        Purpose::Initialize
    }

    async fn validate(&self, _ctx: &TicketContext) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        if sysconfig::is_initialized(&mut conn).await? {
            return Err(AppError::Conflict("system is already initialized".to_string()));
        }
        Ok(())
    }

    async fn process(&self, _ctx: &TicketContext, profile: &ExternalProfile) -> AppResult<Value> {
        let mut tx = self.pool.begin().await?;

        if !sysconfig::mark_initialized(&mut tx).await? {
            return Err(AppError::Conflict("system is already initialized".to_string()));
        }

        let role_id: i32 = sqlx::query_scalar(
            "INSERT INTO roles (name, code, description) VALUES ('管理员', $1, 'System administrator')
             ON CONFLICT (code) DO UPDATE SET status = 1, deleted_at = NULL, updated_at = now()
             RETURNING id",
        )
        .bind(AuthContext::ADMIN_ROLE)
        .fetch_one(&mut *tx)
        .await?;

        let user = match live_holder(&mut tx, &profile.open_id).await? {
            Some(user) => refresh_profile(&mut tx, user.id, profile).await?,
            None => insert_external_user(&mut tx, profile).await?,
        };

        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(user.id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;

        let session = self.auth.issue_session(&mut tx, &user).await?;
        tx.commit().await?;

        info!("System initialized with administrator {}", user.username);
        serde_json::to_value(session).map_err(|e| AppError::Internal(e.to_string()))
    }

    fn success_text(&self) -> (&'static str, &'static str) {
        ("系统初始化成功", "请返回 PC 端查看")
    }

    fn failure_title(&self) -> &'static str {
        "初始化失败"
    }
}

/// Create an account for whoever scans, reviving a deleted one if it exists
pub struct AddUserHandler {
    pool: PgPool,
}

impl AddUserHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Bring a soft-deleted user back, renaming it if its old username was taken meanwhile
async fn revive_user(conn: &mut PgConnection, dormant: &User, profile: &ExternalProfile) -> AppResult<User> {
    for attempt in 0..=MAX_USERNAME_ATTEMPTS {
        let username = match attempt {
            0 => dormant.username.clone(),
            n => username_candidate(&profile.nickname, &profile.open_id, n),
        };

        let revived = sqlx::query_as::<_, User>(
            "UPDATE users SET
                 username = $2,
                 deleted_at = NULL,
                 avatar = CASE WHEN $3 <> '' THEN $3 ELSE avatar END,
                 nickname = CASE WHEN $4 <> '' THEN $4 ELSE nickname END,
                 updated_at = now()
             WHERE id = $1
               AND NOT EXISTS (SELECT 1 FROM users o WHERE o.username = $2 AND o.deleted_at IS NULL)
             RETURNING *",
        )
        .bind(dormant.id)
        .bind(&username)
        .bind(&profile.avatar)
        .bind(profile.nickname.trim())
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(user) = revived {
            info!("Revived user {} (id {})", user.username, user.id);
            return Ok(user);
        }
    }

    Err(AppError::Conflict("could not find a free username, please retry".to_string()))
}

#[async_trait]
impl PurposeHandler for AddUserHandler {
    fn purpose(&self) -> Purpose {
        Purpose::AddUser
    }

    async fn process(&self, _ctx: &TicketContext, profile: &ExternalProfile) -> AppResult<Value> {
        let mut tx = self.pool.begin().await?;

        if let Some(holder) = live_holder(&mut tx, &profile.open_id).await? {
            return Err(AppError::Conflict(format!(
                "this WeChat account is already bound to user '{}'",
                holder.username
            )));
        }

        let user = match deleted_holder(&mut tx, &profile.open_id).await? {
            Some(dormant) => revive_user(&mut tx, &dormant, profile).await?,
            None => insert_external_user(&mut tx, profile).await?,
        };

        let payload = profile_payload(&mut tx, &user).await?;
        tx.commit().await?;
        Ok(payload)
    }

    fn success_text(&self) -> (&'static str, &'static str) {
        ("添加用户成功", "请返回 PC 端查看")
    }

    fn failure_title(&self) -> &'static str {
        "添加用户失败"
    }
}

/// Attach the scanned identity to the user named in the ticket
pub struct BindHandler {
    pool: PgPool,
}

impl BindHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurposeHandler for BindHandler {
    fn purpose(&self) -> Purpose {
        Purpose::Bind
    }

    async fn validate(&self, ctx: &TicketContext) -> AppResult<()> {
        if ctx.bind_user.is_none() {
            return Err(AppError::InvalidArgument("bind ticket names no user".to_string()));
        }
        Ok(())
    }

    async fn process(&self, ctx: &TicketContext, profile: &ExternalProfile) -> AppResult<Value> {
        let user_id = ctx
            .bind_user
            .ok_or_else(|| AppError::InvalidArgument("bind ticket names no user".to_string()))?;
        let mut tx = self.pool.begin().await?;

        let target = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("user"))?;

        match target.wechat_open_id.as_deref() {
            Some(bound) if !bound.is_empty() && bound != profile.open_id => {
                return Err(AppError::Conflict("user is already bound to another WeChat account".to_string()));
            }
            _ => {}
        }

        if let Some(holder) = live_holder(&mut tx, &profile.open_id).await? {
            if holder.id != target.id {
                return Err(AppError::Conflict(format!(
                    "this WeChat account is already bound to user '{}'",
                    holder.username
                )));
            }
        }

        sqlx::query("UPDATE users SET wechat_open_id = NULL, updated_at = now() WHERE wechat_open_id = $1 AND deleted_at IS NOT NULL")
            .bind(&profile.open_id)
            .execute(&mut *tx)
            .await?;

        let user = sqlx::query_as::<_, User>(
            "UPDATE users SET
                 wechat_open_id = $2,
                 avatar = CASE WHEN $3 <> '' THEN $3 ELSE avatar END,
                 updated_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(target.id)
        .bind(&profile.open_id)
        .bind(&profile.avatar)
        .fetch_one(&mut *tx)
        .await?;

        let payload = profile_payload(&mut tx, &user).await?;
        tx.commit().await?;

        info!("Bound external identity to user {}", user.username);
        Ok(payload)
    }

    fn success_text(&self) -> (&'static str, &'static str) {
        ("绑定成功", "请返回 PC 端查看")
    }

    fn failure_title(&self) -> &'static str {
        "绑定失败"
    }
}
