//! Task and bug edits that keep `actual_hours`, progress and the ledger in step

mod bug;
mod task;

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use time::{Date, OffsetDateTime};

use crate::access::{ScopeKind, Viewer, scope_list};
use crate::error::{AppError, AppResult};
use crate::model::{Page, PageQuery, QueryPairs, Requirement, TaskStatus};

pub use bug::{BugFilter, BugView, UpdateBug, list_bugs, update_bug};
pub use task::{TaskFilter, UpdateTask, delete_task, list_tasks, set_task_dependencies, update_task, would_create_cycle};

/// Day hours are booked against: explicit, else start, else end, else today
pub fn resolve_work_date(explicit: Option<Date>, start: Option<Date>, end: Option<Date>) -> Date {
    explicit
        .or(start)
        .or(end)
        .unwrap_or_else(|| OffsetDateTime::now_utc().date())
}

/// `min(100, actual / estimated · 100)`; `None` without a positive estimate
pub fn derive_progress(actual_hours: f64, estimated_hours: Option<f64>) -> Option<i32> {
    let estimated = estimated_hours.filter(|e| *e > 0.0)?;
    let percent = (actual_hours / estimated * 100.0).floor();
    Some(percent.clamp(0.0, 100.0) as i32)
}

/// Status implied by progress when the caller did not choose one
pub fn advance_status(status: TaskStatus, progress: i32) -> TaskStatus {
    match status {
        _ if progress >= 100 => TaskStatus::Done,
        TaskStatus::Todo if progress > 0 => TaskStatus::InProgress,
        other => other,
    }
}

fn check_hours(field: &str, value: Option<f64>) -> AppResult<()> {
    match value {
        Some(v) if v < 0.0 || !v.is_finite() => {
            Err(AppError::InvalidArgument(format!("{field} must not be negative")))
        }
        _ => Ok(()),
    }
}

fn check_title(title: Option<&str>) -> AppResult<()> {
    match title {
        Some(t) if t.trim().is_empty() => Err(AppError::InvalidArgument("title must not be empty".to_string())),
        _ => Ok(()),
    }
}

async fn ensure_users_exist(conn: &mut PgConnection, user_ids: &[i32]) -> AppResult<()> {
    if user_ids.is_empty() {
        return Ok(());
    }
    let found: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT id) FROM users WHERE id = ANY($1) AND deleted_at IS NULL",
    )
    .bind(user_ids)
    .fetch_one(conn)
    .await?;

    let mut wanted = user_ids.to_vec();
    wanted.sort_unstable();
    wanted.dedup();
    if found as usize != wanted.len() {
        return Err(AppError::not_found("assignee"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct RequirementFilter {
    pub project_ids: Vec<i32>,
    pub statuses: Vec<String>,
    pub keyword: Option<String>,
    pub window: PageQuery,
}

impl RequirementFilter {
    pub fn from_pairs(pairs: &QueryPairs) -> AppResult<Self> {
        Ok(Self {
            project_ids: pairs.parse_all("project_id")?,
            statuses: pairs.all("status").into_iter().map(str::to_string).collect(),
            keyword: pairs.first("keyword").map(str::to_string),
            window: pairs.page()?,
        })
    }

    fn push(&self, builder: &mut QueryBuilder<'_, Postgres>, viewer: Viewer) {
        builder.push(" AND rq.deleted_at IS NULL");
        if !self.project_ids.is_empty() {
            builder.push(" AND rq.project_id = ANY(").push_bind(self.project_ids.clone()).push(")");
        }
        if !self.statuses.is_empty() {
            builder.push(" AND rq.status = ANY(").push_bind(self.statuses.clone()).push(")");
        }
        if let Some(keyword) = &self.keyword {
            builder.push(" AND rq.title ILIKE ").push_bind(format!("%{keyword}%"));
        }
        scope_list(builder, ScopeKind::Requirement, "rq", viewer);
    }
}

pub async fn list_requirements(pool: &PgPool, viewer: Viewer, filter: &RequirementFilter) -> AppResult<Page<Requirement>> {
    let window = filter.window;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM requirements rq WHERE TRUE");
    filter.push(&mut count, viewer);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT rq.* FROM requirements rq WHERE TRUE");
    filter.push(&mut query, viewer);
    query
        .push(" ORDER BY rq.id DESC LIMIT ")
        .push_bind(window.page_size())
        .push(" OFFSET ")
        .push_bind(window.offset());
    let items = query.build_query_as::<Requirement>().fetch_all(pool).await?;

    Ok(Page {
        items,
        total,
        page: window.page(),
        page_size: window.page_size(),
    })
}
