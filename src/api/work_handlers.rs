use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use super::{AppState, perm};
use crate::auth::RequestContext;
use crate::error::{AppResult, Envelope};
use crate::ledger::{self, AllocationFilter, NewAllocation, ensure_resource_access, load_allocation};
use crate::model::{Allocation, Bug, Page, QueryPairs, Requirement, Task};
use crate::work::{self, BugFilter, BugView, RequirementFilter, TaskFilter, UpdateBug, UpdateTask};

pub async fn list_tasks(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(pairs): Query<QueryPairs>,
) -> AppResult<Json<Envelope<Page<Task>>>> {
    ctx.require(perm::TASK_READ)?;
    let filter = TaskFilter::from_pairs(&pairs)?;
    let page = work::list_tasks(&state.db_pool, ctx.viewer(), &filter).await?;
    Ok(Json(Envelope::ok(page)))
}

pub async fn update_task(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
    Json(cmd): Json<UpdateTask>,
) -> AppResult<Json<Envelope<Task>>> {
    ctx.require(perm::TASK_UPDATE)?;
    let task = work::update_task(&state.db_pool, ctx.viewer(), id, &cmd).await?;
    Ok(Json(Envelope::ok(task)))
}

pub async fn delete_task(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    ctx.require(perm::TASK_DELETE)?;
    work::delete_task(&state.db_pool, ctx.viewer(), id).await?;
    Ok(Json(Envelope::ok(())))
}

#[derive(Debug, Deserialize)]
pub struct DependencyRequest {
    #[serde(default)]
    pub dependency_ids: Vec<i32>,
}

pub async fn set_dependencies(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
    Json(req): Json<DependencyRequest>,
) -> AppResult<Json<Envelope<Vec<i32>>>> {
    ctx.require(perm::TASK_UPDATE)?;
    let edges = work::set_task_dependencies(&state.db_pool, ctx.viewer(), id, &req.dependency_ids).await?;
    Ok(Json(Envelope::ok(edges)))
}

pub async fn list_bugs(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(pairs): Query<QueryPairs>,
) -> AppResult<Json<Envelope<Page<Bug>>>> {
    ctx.require(perm::BUG_READ)?;
    let filter = BugFilter::from_pairs(&pairs)?;
    let page = work::list_bugs(&state.db_pool, ctx.viewer(), &filter).await?;
    Ok(Json(Envelope::ok(page)))
}

pub async fn update_bug(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
    Json(cmd): Json<UpdateBug>,
) -> AppResult<Json<Envelope<BugView>>> {
    ctx.require(perm::BUG_UPDATE)?;
    let bug = work::update_bug(&state.db_pool, ctx.viewer(), id, &cmd).await?;
    Ok(Json(Envelope::ok(bug)))
}

pub async fn list_requirements(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(pairs): Query<QueryPairs>,
) -> AppResult<Json<Envelope<Page<Requirement>>>> {
    ctx.require(perm::REQUIREMENT_READ)?;
    let filter = RequirementFilter::from_pairs(&pairs)?;
    let page = work::list_requirements(&state.db_pool, ctx.viewer(), &filter).await?;
    Ok(Json(Envelope::ok(page)))
}

pub async fn list_allocations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(filter): Query<AllocationFilter>,
) -> AppResult<Json<Envelope<Page<Allocation>>>> {
    ctx.require(perm::RESOURCE_READ)?;
    let page = ledger::list_allocations(&state.db_pool, ctx.viewer(), &filter).await?;
    Ok(Json(Envelope::ok(page)))
}

pub async fn create_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(new): Json<NewAllocation>,
) -> AppResult<Json<Envelope<Allocation>>> {
    ctx.require(perm::RESOURCE_MANAGE)?;

    let mut tx = state.db_pool.begin().await?;
    ensure_resource_access(&mut tx, ctx.viewer(), new.resource_id).await?;
    let allocation = ledger::append_allocation(&mut tx, &new).await?;
    tx.commit().await?;

    Ok(Json(Envelope::ok(allocation)))
}

pub async fn update_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
    Json(update): Json<NewAllocation>,
) -> AppResult<Json<Envelope<Allocation>>> {
    ctx.require(perm::RESOURCE_MANAGE)?;

    let mut tx = state.db_pool.begin().await?;
    let before = load_allocation(&mut tx, id).await?;
    ensure_resource_access(&mut tx, ctx.viewer(), before.resource_id).await?;
    if update.resource_id != before.resource_id {
        ensure_resource_access(&mut tx, ctx.viewer(), update.resource_id).await?;
    }
    let allocation = ledger::update_allocation(&mut tx, id, &update).await?;
    tx.commit().await?;

    Ok(Json(Envelope::ok(allocation)))
}

pub async fn delete_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i32>,
) -> AppResult<Json<Envelope<()>>> {
    ctx.require(perm::RESOURCE_MANAGE)?;

    let mut tx = state.db_pool.begin().await?;
    let before = load_allocation(&mut tx, id).await?;
    ensure_resource_access(&mut tx, ctx.viewer(), before.resource_id).await?;
    ledger::delete_allocation(&mut tx, id).await?;
    tx.commit().await?;

    Ok(Json(Envelope::ok(())))
}
