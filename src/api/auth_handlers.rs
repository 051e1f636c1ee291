use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::access::PermissionSet;
use crate::access::menu::{MenuNode, load_menu_tree};
use crate::auth::RequestContext;
use crate::error::{AppResult, Envelope};
use crate::model::{Session, UserProfile};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Password login
pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> AppResult<Json<Envelope<Session>>> {
    let session = state.auth.authenticate(req.username.trim(), &req.password).await?;
    Ok(Json(Envelope::ok(session)))
}

#[derive(Debug, Serialize)]
pub struct CurrentUser {
    pub user: UserProfile,
    pub permissions: PermissionSet,
}

pub async fn me(State(state): State<AppState>, ctx: RequestContext) -> AppResult<Json<Envelope<CurrentUser>>> {
    let user = state.auth.profile(ctx.user_id()).await?;
    Ok(Json(Envelope::ok(CurrentUser {
        user,
        permissions: ctx.permissions,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ChangePasswordRequest>,
) -> AppResult<Json<Envelope<()>>> {
    state
        .auth
        .change_password(ctx.user_id(), &req.old_password, &req.new_password)
        .await?;
    info!("user_id: {} changed their password", ctx.user_id());
    Ok(Json(Envelope::ok(())))
}

/// Menu forest for the caller; empty when they hold no menu permissions
pub async fn menus(State(state): State<AppState>, ctx: RequestContext) -> AppResult<Json<Envelope<Vec<MenuNode>>>> {
    let mut conn = state.db_pool.acquire().await?;
    let tree = load_menu_tree(&mut conn, &ctx.permissions).await?;
    Ok(Json(Envelope::ok(tree)))
}
