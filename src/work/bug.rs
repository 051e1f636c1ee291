use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use time::{Date, OffsetDateTime};
use tracing::info;

use super::{check_hours, check_title, ensure_users_exist};
use crate::access::{ScopeKind, Subject, Viewer, ensure_visible, scope_list};
use crate::error::{AppError, AppResult};
use crate::ledger::{SyncTarget, recompute_actual_hours, sync_actual_hours};
use crate::model::{Bug, BugStatus, Page, PageQuery, Priority, QueryPairs, Severity, ymd};

/// Partial edit of a bug; absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBug {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub severity: Option<String>,
    pub estimated_hours: Option<f64>,
    /// Ordered; the first assignee owns hours synced from `actual_hours`
    pub assignee_ids: Option<Vec<i32>>,
    pub actual_hours: Option<f64>,
    #[serde(default, with = "ymd::option")]
    pub work_date: Option<Date>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BugView {
    #[serde(flatten)]
    pub bug: Bug,
    pub assignee_ids: Vec<i32>,
}

async fn assignees(conn: &mut PgConnection, bug_id: i32) -> AppResult<Vec<i32>> {
    let ids = sqlx::query_scalar::<_, i32>(
        "SELECT user_id FROM bug_assignees WHERE bug_id = $1 ORDER BY position, user_id",
    )
    .bind(bug_id)
    .fetch_all(conn)
    .await?;
    Ok(ids)
}

async fn replace_assignees(conn: &mut PgConnection, bug_id: i32, user_ids: &[i32]) -> AppResult<()> {
    let mut ordered: Vec<i32> = Vec::with_capacity(user_ids.len());
    for id in user_ids {
        if !ordered.contains(id) {
            ordered.push(*id);
        }
    }
    ensure_users_exist(conn, &ordered).await?;

    sqlx::query("DELETE FROM bug_assignees WHERE bug_id = $1")
        .bind(bug_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO bug_assignees (bug_id, user_id, position)
         SELECT $1, u.user_id, (u.ord - 1)::INTEGER FROM unnest($2::INTEGER[]) WITH ORDINALITY AS u(user_id, ord)",
    )
    .bind(bug_id)
    .bind(&ordered)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Apply `cmd` to bug `id` in one transaction. Hours are synced to the first assignee.
pub async fn update_bug(pool: &PgPool, viewer: Viewer, id: i32, cmd: &UpdateBug) -> AppResult<BugView> {
    let status = cmd.status.as_deref().map(str::parse::<BugStatus>).transpose()?;
    let priority = cmd.priority.as_deref().map(str::parse::<Priority>).transpose()?;
    let severity = cmd.severity.as_deref().map(str::parse::<Severity>).transpose()?;
    check_title(cmd.title.as_deref())?;
    check_hours("estimated_hours", cmd.estimated_hours)?;
    check_hours("actual_hours", cmd.actual_hours)?;

    let mut tx = pool.begin().await?;
    sqlx::query_scalar::<_, i32>("SELECT id FROM bugs WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("bug"))?;
    ensure_visible(&mut tx, viewer, Subject::Bug, id).await?;

    sqlx::query(
        "UPDATE bugs SET
             title = COALESCE($2, title),
             description = COALESCE($3, description),
             status = COALESCE($4, status),
             priority = COALESCE($5, priority),
             severity = COALESCE($6, severity),
             estimated_hours = COALESCE($7, estimated_hours),
             updated_at = now()
         WHERE id = $1",
    )
    .bind(id)
    .bind(cmd.title.as_deref().map(str::trim))
    .bind(cmd.description.as_deref())
    .bind(status.map(|s| s.as_str()))
    .bind(priority.map(|p| p.as_str()))
    .bind(severity.map(|s| s.as_str()))
    .bind(cmd.estimated_hours)
    .execute(&mut *tx)
    .await?;

    if let Some(user_ids) = &cmd.assignee_ids {
        replace_assignees(&mut tx, id, user_ids).await?;
    }

    if let Some(hours) = cmd.actual_hours {
        let owner = assignees(&mut tx, id).await?.first().copied();
        let work_date = cmd.work_date.unwrap_or_else(|| OffsetDateTime::now_utc().date());
        sync_actual_hours(&mut tx, SyncTarget::Bug, id, owner, hours, work_date).await?;
    }
    recompute_actual_hours(&mut tx, SyncTarget::Bug, id).await?;

    let bug = sqlx::query_as::<_, Bug>("SELECT * FROM bugs WHERE id = $1")
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    let assignee_ids = assignees(&mut tx, id).await?;

    tx.commit().await?;
    info!("Bug {} updated by user {}", id, viewer.user_id);
    Ok(BugView { bug, assignee_ids })
}

#[derive(Debug, Clone, Default)]
pub struct BugFilter {
    pub project_ids: Vec<i32>,
    pub statuses: Vec<BugStatus>,
    pub severities: Vec<Severity>,
    pub assignee_id: Option<i32>,
    pub keyword: Option<String>,
    pub window: PageQuery,
}

impl BugFilter {
    pub fn from_pairs(pairs: &QueryPairs) -> AppResult<Self> {
        Ok(Self {
            project_ids: pairs.parse_all("project_id")?,
            statuses: pairs.parse_all("status")?,
            severities: pairs.parse_all("severity")?,
            assignee_id: pairs.parse_first("assignee_id")?,
            keyword: pairs.first("keyword").map(str::to_string),
            window: pairs.page()?,
        })
    }

    fn push(&self, builder: &mut QueryBuilder<'_, Postgres>, viewer: Viewer) {
        builder.push(" AND b.deleted_at IS NULL");
        if !self.project_ids.is_empty() {
            builder.push(" AND b.project_id = ANY(").push_bind(self.project_ids.clone()).push(")");
        }
        if !self.statuses.is_empty() {
            let statuses: Vec<&'static str> = self.statuses.iter().map(|s| s.as_str()).collect();
            builder.push(" AND b.status = ANY(").push_bind(statuses).push(")");
        }
        if !self.severities.is_empty() {
            let severities: Vec<&'static str> = self.severities.iter().map(|s| s.as_str()).collect();
            builder.push(" AND b.severity = ANY(").push_bind(severities).push(")");
        }
        if let Some(assignee) = self.assignee_id {
            builder
                .push(" AND EXISTS (SELECT 1 FROM bug_assignees fa WHERE fa.bug_id = b.id AND fa.user_id = ")
                .push_bind(assignee)
                .push(")");
        }
        if let Some(keyword) = &self.keyword {
            builder.push(" AND b.title ILIKE ").push_bind(format!("%{keyword}%"));
        }
        scope_list(builder, ScopeKind::Bug, "b", viewer);
    }
}

pub async fn list_bugs(pool: &PgPool, viewer: Viewer, filter: &BugFilter) -> AppResult<Page<Bug>> {
    let window = filter.window;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM bugs b WHERE TRUE");
    filter.push(&mut count, viewer);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT b.* FROM bugs b WHERE TRUE");
    filter.push(&mut query, viewer);
    query
        .push(" ORDER BY b.id DESC LIMIT ")
        .push_bind(window.page_size())
        .push(" OFFSET ")
        .push_bind(window.offset());
    let items = query.build_query_as::<Bug>().fetch_all(pool).await?;

    Ok(Page {
        items,
        total,
        page: window.page(),
        page_size: window.page_size(),
    })
}
