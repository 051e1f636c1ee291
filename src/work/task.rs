use serde::Deserialize;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use time::Date;
use tracing::info;

use super::{advance_status, check_hours, check_title, derive_progress, ensure_users_exist, resolve_work_date};
use crate::access::{ScopeKind, Subject, Viewer, ensure_visible, scope_list};
use crate::error::{AppError, AppResult};
use crate::ledger::{SyncTarget, recompute_actual_hours, sync_actual_hours};
use crate::model::{Page, PageQuery, Priority, QueryPairs, Task, TaskStatus, ymd};

/// Partial edit of a task; absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<i32>,
    #[serde(default, with = "ymd::option")]
    pub start_date: Option<Date>,
    #[serde(default, with = "ymd::option")]
    pub end_date: Option<Date>,
    pub progress: Option<i32>,
    pub estimated_hours: Option<f64>,
    /// Total hours the assignee has spent; booked on `work_date`
    pub actual_hours: Option<f64>,
    #[serde(default, with = "ymd::option")]
    pub work_date: Option<Date>,
    pub dependency_ids: Option<Vec<i32>>,
}

async fn lock_task(conn: &mut PgConnection, id: i32) -> AppResult<Task> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| AppError::not_found("task"))
}

/// Apply `cmd` to task `id` in one transaction: scalar fields, dependencies,
/// the ledger entry behind `actual_hours`, then progress derived from the
/// hours unless the caller set it explicitly.
pub async fn update_task(pool: &PgPool, viewer: Viewer, id: i32, cmd: &UpdateTask) -> AppResult<Task> {
    let status = cmd.status.as_deref().map(str::parse::<TaskStatus>).transpose()?;
    let priority = cmd.priority.as_deref().map(str::parse::<Priority>).transpose()?;
    check_title(cmd.title.as_deref())?;
    check_hours("estimated_hours", cmd.estimated_hours)?;
    check_hours("actual_hours", cmd.actual_hours)?;
    if let Some(progress) = cmd.progress {
        if !(0..=100).contains(&progress) {
            return Err(AppError::InvalidArgument("progress must be between 0 and 100".to_string()));
        }
    }

    let mut tx = pool.begin().await?;
    let current = lock_task(&mut tx, id).await?;
    ensure_visible(&mut tx, viewer, Subject::Task, id).await?;

    if let Some(assignee) = cmd.assignee_id {
        ensure_users_exist(&mut tx, &[assignee]).await?;
    }
    let start = cmd.start_date.or(current.start_date);
    let end = cmd.end_date.or(current.end_date);
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(AppError::InvalidArgument("end date precedes start date".to_string()));
        }
    }

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET
             title = COALESCE($2, title),
             description = COALESCE($3, description),
             status = COALESCE($4, status),
             priority = COALESCE($5, priority),
             assignee_id = COALESCE($6, assignee_id),
             start_date = COALESCE($7, start_date),
             end_date = COALESCE($8, end_date),
             progress = COALESCE($9, progress),
             estimated_hours = COALESCE($10, estimated_hours),
             updated_at = now()
         WHERE id = $1
         RETURNING *",
    )
    .bind(id)
    .bind(cmd.title.as_deref().map(str::trim))
    .bind(cmd.description.as_deref())
    .bind(status.map(|s| s.as_str()))
    .bind(priority.map(|p| p.as_str()))
    .bind(cmd.assignee_id)
    .bind(cmd.start_date)
    .bind(cmd.end_date)
    .bind(cmd.progress)
    .bind(cmd.estimated_hours)
    .fetch_one(&mut *tx)
    .await?;

    if let Some(dependency_ids) = &cmd.dependency_ids {
        replace_dependencies(&mut tx, id, dependency_ids).await?;
    }

    if let Some(hours) = cmd.actual_hours {
        let work_date = resolve_work_date(cmd.work_date, task.start_date, task.end_date);
        sync_actual_hours(&mut tx, SyncTarget::Task, id, task.assignee_id, hours, work_date).await?;
    }
    let actual = recompute_actual_hours(&mut tx, SyncTarget::Task, id).await?;

    // An explicit progress in the same request wins over the derived one
    let progress = match cmd.progress {
        Some(_) => task.progress,
        None => derive_progress(actual, task.estimated_hours).unwrap_or(task.progress),
    };
    let next_status = match status {
        Some(chosen) => chosen,
        None => advance_status(task.status.parse()?, progress),
    };

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET progress = $2, status = $3 WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(progress)
    .bind(next_status.as_str())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("Task {} updated by user {}", id, viewer.user_id);
    Ok(task)
}

/// Whether making `task_id` depend on `new_dependencies` closes a loop.
///
/// `edges` maps a task to the tasks it depends on. The task's own current
/// edges are ignored since they are being replaced.
pub fn would_create_cycle(edges: &HashMap<i32, Vec<i32>>, task_id: i32, new_dependencies: &[i32]) -> bool {
    let mut stack: Vec<i32> = new_dependencies.to_vec();
    let mut seen = HashSet::new();

    while let Some(node) = stack.pop() {
        if node == task_id {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

async fn replace_dependencies(conn: &mut PgConnection, task_id: i32, dependency_ids: &[i32]) -> AppResult<()> {
    let mut wanted = dependency_ids.to_vec();
    wanted.sort_unstable();
    wanted.dedup();

    if wanted.contains(&task_id) {
        return Err(AppError::InvalidArgument("a task cannot depend on itself".to_string()));
    }

    let found: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE id = ANY($1) AND deleted_at IS NULL")
        .bind(&wanted)
        .fetch_one(&mut *conn)
        .await?;
    if found as usize != wanted.len() {
        return Err(AppError::not_found("dependency task"));
    }

    // Serialize graph edits so two concurrent edits cannot each miss the other's edge.
    sqlx::query("LOCK TABLE task_dependencies IN SHARE ROW EXCLUSIVE MODE")
        .execute(&mut *conn)
        .await?;

    let rows: Vec<(i32, i32)> = sqlx::query_as("SELECT task_id, dependency_id FROM task_dependencies")
        .fetch_all(&mut *conn)
        .await?;
    let mut edges: HashMap<i32, Vec<i32>> = HashMap::new();
    for (from, to) in rows {
        edges.entry(from).or_default().push(to);
    }

    if would_create_cycle(&edges, task_id, &wanted) {
        return Err(AppError::InvalidArgument("dependencies would form a cycle".to_string()));
    }

    sqlx::query("DELETE FROM task_dependencies WHERE task_id = $1")
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO task_dependencies (task_id, dependency_id) SELECT $1, unnest($2::INTEGER[])")
        .bind(task_id)
        .bind(&wanted)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Replace the set of tasks `task_id` depends on
pub async fn set_task_dependencies(pool: &PgPool, viewer: Viewer, task_id: i32, dependency_ids: &[i32]) -> AppResult<Vec<i32>> {
    let mut tx = pool.begin().await?;
    lock_task(&mut tx, task_id).await?;
    ensure_visible(&mut tx, viewer, Subject::Task, task_id).await?;

    replace_dependencies(&mut tx, task_id, dependency_ids).await?;

    let stored: Vec<i32> = sqlx::query_scalar(
        "SELECT dependency_id FROM task_dependencies WHERE task_id = $1 ORDER BY dependency_id",
    )
    .bind(task_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(stored)
}

/// Soft-delete a task nothing else depends on
pub async fn delete_task(pool: &PgPool, viewer: Viewer, id: i32) -> AppResult<()> {
    let mut tx = pool.begin().await?;
    lock_task(&mut tx, id).await?;
    ensure_visible(&mut tx, viewer, Subject::Task, id).await?;

    let dependents: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM task_dependencies d JOIN tasks t ON t.id = d.task_id
         WHERE d.dependency_id = $1 AND t.deleted_at IS NULL",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    if dependents > 0 {
        return Err(AppError::Dependency(format!("{dependents} task(s) still depend on this task")));
    }

    sqlx::query("DELETE FROM task_dependencies WHERE task_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE tasks SET deleted_at = now() WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!("Task {} deleted", id);
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub project_ids: Vec<i32>,
    pub statuses: Vec<TaskStatus>,
    pub assignee_id: Option<i32>,
    pub keyword: Option<String>,
    pub window: PageQuery,
}

impl TaskFilter {
    pub fn from_pairs(pairs: &QueryPairs) -> AppResult<Self> {
        Ok(Self {
            project_ids: pairs.parse_all("project_id")?,
            statuses: pairs.parse_all("status")?,
            assignee_id: pairs.parse_first("assignee_id")?,
            keyword: pairs.first("keyword").map(str::to_string),
            window: pairs.page()?,
        })
    }

    fn push(&self, builder: &mut QueryBuilder<'_, Postgres>, viewer: Viewer) {
        builder.push(" AND t.deleted_at IS NULL");
        if !self.project_ids.is_empty() {
            builder.push(" AND t.project_id = ANY(").push_bind(self.project_ids.clone()).push(")");
        }
        if !self.statuses.is_empty() {
            let statuses: Vec<&'static str> = self.statuses.iter().map(|s| s.as_str()).collect();
            builder.push(" AND t.status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(assignee) = self.assignee_id {
            builder.push(" AND t.assignee_id = ").push_bind(assignee);
        }
        if let Some(keyword) = &self.keyword {
            builder.push(" AND t.title ILIKE ").push_bind(format!("%{keyword}%"));
        }
        scope_list(builder, ScopeKind::Task, "t", viewer);
    }
}

pub async fn list_tasks(pool: &PgPool, viewer: Viewer, filter: &TaskFilter) -> AppResult<Page<Task>> {
    let window = filter.window;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tasks t WHERE TRUE");
    filter.push(&mut count, viewer);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT t.* FROM tasks t WHERE TRUE");
    filter.push(&mut query, viewer);
    query
        .push(" ORDER BY t.id DESC LIMIT ")
        .push_bind(window.page_size())
        .push(" OFFSET ")
        .push_bind(window.offset());
    let items = query.build_query_as::<Task>().fetch_all(pool).await?;

    Ok(Page {
        items,
        total,
        page: window.page(),
        page_size: window.page_size(),
    })
}
