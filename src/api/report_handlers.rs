use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use time::Date;

use super::AppState;
use crate::auth::RequestContext;
use crate::error::{AppResult, Envelope};
use crate::ledger::summary::{WorkSummary, summarize_user_work};
use crate::model::{DailyReport, WeeklyReport, ymd};
use crate::report::{self, CreateDailyReport, CreateWeeklyReport, ReportKind, ReportState};

pub async fn create_daily(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateDailyReport>,
) -> AppResult<Json<Envelope<DailyReport>>> {
    let report = report::create_daily_report(&state.db_pool, ctx.user_id(), req).await?;
    Ok(Json(Envelope::ok(report)))
}

pub async fn create_weekly(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateWeeklyReport>,
) -> AppResult<Json<Envelope<WeeklyReport>>> {
    let report = report::create_weekly_report(&state.db_pool, ctx.user_id(), req).await?;
    Ok(Json(Envelope::ok(report)))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    #[serde(with = "ymd")]
    pub start_date: Date,
    #[serde(with = "ymd")]
    pub end_date: Date,
}

/// Markdown digest of the caller's own booked hours
pub async fn work_summary(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<SummaryQuery>,
) -> AppResult<Json<Envelope<WorkSummary>>> {
    let mut conn = state.db_pool.acquire().await?;
    let summary = summarize_user_work(&mut conn, ctx.user_id(), query.start_date, query.end_date).await?;
    Ok(Json(Envelope::ok(summary)))
}

pub async fn get_report(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((kind, id)): Path<(ReportKind, i32)>,
) -> AppResult<Json<Envelope<ReportState>>> {
    let report = report::report_state(&state.db_pool, kind, id, ctx.viewer()).await?;
    Ok(Json(Envelope::ok(report)))
}

#[derive(Debug, Deserialize)]
pub struct ApproversRequest {
    #[serde(default)]
    pub approver_ids: Vec<i32>,
}

pub async fn replace_approvers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((kind, id)): Path<(ReportKind, i32)>,
    Json(req): Json<ApproversRequest>,
) -> AppResult<Json<Envelope<ReportState>>> {
    let report = report::replace_approvers(&state.db_pool, kind, id, ctx.viewer(), &req.approver_ids).await?;
    Ok(Json(Envelope::ok(report)))
}

pub async fn submit(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((kind, id)): Path<(ReportKind, i32)>,
) -> AppResult<Json<Envelope<ReportState>>> {
    let report = report::submit(&state.db_pool, kind, id, ctx.user_id()).await?;
    Ok(Json(Envelope::ok(report)))
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub status: String,
    #[serde(default)]
    pub comment: String,
}

pub async fn decide(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((kind, id)): Path<(ReportKind, i32)>,
    Json(req): Json<DecisionRequest>,
) -> AppResult<Json<Envelope<ReportState>>> {
    let report = report::decide(&state.db_pool, kind, id, ctx.viewer(), &req.status, &req.comment).await?;
    Ok(Json(Envelope::ok(report)))
}
