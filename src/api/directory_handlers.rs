use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use super::{AppState, perm};
use crate::access::menu;
use crate::auth::RequestContext;
use crate::directory::{self, Guarded, MEMBER_ROLE, NewProject, ProjectFilter};
use crate::error::{AppResult, Envelope};
use crate::model::{Page, Project, ProjectMember, QueryPairs};

pub async fn list_projects(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(pairs): Query<QueryPairs>,
) -> AppResult<Json<Envelope<Page<Project>>>> {
    ctx.require(perm::PROJECT_READ)?;
    let filter = ProjectFilter::from_pairs(&pairs)?;
    let page = directory::list_projects(&state.db_pool, ctx.viewer(), &filter).await?;
    Ok(Json(Envelope::ok(page)))
}

pub async fn create_project(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(new): Json<NewProject>,
) -> AppResult<Json<Envelope<Project>>> {
    ctx.require(perm::PROJECT_CREATE)?;
    let project = directory::create_project(&state.db_pool, ctx.user_id(), &new).await?;
    Ok(Json(Envelope::ok(project)))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i32,
    pub role: Option<String>,
}

pub async fn add_member(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(project_id): Path<i32>,
    Json(req): Json<AddMemberRequest>,
) -> AppResult<Json<Envelope<ProjectMember>>> {
    ctx.require(perm::PROJECT_UPDATE)?;
    let role = req.role.as_deref().map(str::trim).filter(|r| !r.is_empty());
    let member = directory::add_member(
        &state.db_pool,
        ctx.viewer(),
        project_id,
        req.user_id,
        role.unwrap_or(MEMBER_ROLE),
    )
    .await?;
    Ok(Json(Envelope::ok(member)))
}

async fn guarded(state: &AppState, ctx: &RequestContext, code: &str, kind: Guarded, id: i32) -> AppResult<Json<Envelope<()>>> {
    ctx.require(code)?;
    directory::delete_guarded(&state.db_pool, kind, id).await?;
    Ok(Json(Envelope::ok(())))
}

pub async fn delete_project(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    guarded(&state, &ctx, perm::PROJECT_DELETE, Guarded::Project, id).await
}

pub async fn delete_department(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    guarded(&state, &ctx, perm::DEPARTMENT_DELETE, Guarded::Department, id).await
}

pub async fn delete_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    guarded(&state, &ctx, perm::PERMISSION_MANAGE, Guarded::Role, id).await
}

pub async fn delete_permission(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    guarded(&state, &ctx, perm::PERMISSION_MANAGE, Guarded::Permission, id).await
}

// Tags and modules hang off projects and share their delete permission
pub async fn delete_tag(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    guarded(&state, &ctx, perm::PROJECT_DELETE, Guarded::Tag, id).await
}

pub async fn delete_module(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    guarded(&state, &ctx, perm::PROJECT_DELETE, Guarded::Module, id).await
}

#[derive(Debug, Deserialize)]
pub struct MenuParentRequest {
    pub parent_id: Option<i32>,
}

pub async fn set_menu_parent(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
    Json(req): Json<MenuParentRequest>,
) -> AppResult<Json<Envelope<()>>> {
    ctx.require(perm::PERMISSION_MANAGE)?;
    menu::set_menu_parent(&state.db_pool, id, req.parent_id).await?;
    Ok(Json(Envelope::ok(())))
}

pub async fn delete_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    ctx.require(perm::USER_DELETE)?;
    directory::delete_user(&state.db_pool, ctx.viewer(), id).await?;
    Ok(Json(Envelope::ok(())))
}
