use axum::{
    Json,
    extract::{Path, State},
    http::header::CONTENT_TYPE,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use super::{AppState, perm};
use crate::auth::RequestContext;
use crate::error::{AppError, AppResult, Envelope};
use crate::sysconfig::{self, ConfigEntry};

pub async fn get_config(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(key): Path<String>,
) -> AppResult<Json<Envelope<ConfigEntry>>> {
    ctx.require(perm::SYSTEM_SETTINGS)?;
    let mut conn = state.db_pool.acquire().await?;
    let entry = sysconfig::get_config(&mut conn, &key)
        .await?
        .ok_or_else(|| AppError::not_found("config"))?;
    Ok(Json(Envelope::ok(entry)))
}

fn default_kind() -> String {
    "string".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub value: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

pub async fn set_config(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(key): Path<String>,
    Json(req): Json<SetConfigRequest>,
) -> AppResult<Json<Envelope<ConfigEntry>>> {
    ctx.require(perm::SYSTEM_SETTINGS)?;
    let mut conn = state.db_pool.acquire().await?;
    let entry = sysconfig::set_config(&mut conn, &key, &req.value, &req.kind).await?;
    Ok(Json(Envelope::ok(entry)))
}

#[derive(Debug, Deserialize)]
pub struct WeChatConfigRequest {
    pub app_id: String,
    pub app_secret: String,
    pub account_type: Option<String>,
    pub scope: Option<String>,
}

/// Persist provider credentials; stored values override the static settings
pub async fn save_wechat_config(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<WeChatConfigRequest>,
) -> AppResult<Json<Envelope<()>>> {
    ctx.require(perm::WECHAT_SETTINGS)?;

    let app_id = req.app_id.trim();
    let app_secret = req.app_secret.trim();
    if app_id.is_empty() || app_secret.is_empty() {
        return Err(AppError::InvalidArgument("app_id and app_secret are required".to_string()));
    }
    let account_type = req.account_type.as_deref().unwrap_or(&state.settings.wechat.account_type);
    let scope = req.scope.as_deref().unwrap_or(&state.settings.wechat.scope);

    let mut tx = state.db_pool.begin().await?;
    for (key, value) in [
        (sysconfig::WECHAT_APP_ID, app_id),
        (sysconfig::WECHAT_APP_SECRET, app_secret),
        (sysconfig::WECHAT_ACCOUNT_TYPE, account_type),
        (sysconfig::WECHAT_SCOPE, scope),
    ] {
        sysconfig::set_config(&mut tx, key, value, "string").await?;
    }
    tx.commit().await?;

    info!("WeChat credentials updated by user_id: {} (app_id {})", ctx.user_id(), app_id);
    Ok(Json(Envelope::ok(())))
}

#[derive(Debug, Deserialize)]
pub struct VerifyFileRequest {
    pub file_name: String,
    pub content: String,
}

pub async fn save_verify_file(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<VerifyFileRequest>,
) -> AppResult<Json<Envelope<()>>> {
    ctx.require(perm::WECHAT_SETTINGS)?;
    let key = sysconfig::verify_file_key(req.file_name.trim())?;
    let mut conn = state.db_pool.acquire().await?;
    sysconfig::set_config(&mut conn, &key, req.content.trim(), "string").await?;
    Ok(Json(Envelope::ok(())))
}

/// Serve a stored domain-verification file from the site root
pub async fn verify_file(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !file_name.starts_with("MP_verify_") {
        return Err(AppError::not_found("file"));
    }
    let key = sysconfig::verify_file_key(&file_name).map_err(|_| AppError::not_found("file"))?;

    let mut conn = state.db_pool.acquire().await?;
    let entry = sysconfig::get_config(&mut conn, &key)
        .await?
        .ok_or_else(|| AppError::not_found("file"))?;

    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], entry.value))
}
