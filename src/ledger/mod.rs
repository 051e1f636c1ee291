//! Per-(resource, day) effort ledger and the denormalized `actual_hours` it feeds.

pub mod summary;

use serde::Deserialize;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use time::Date;
use tracing::{debug, info};

use crate::access::{ScopeKind, Viewer, is_project_member, scope_list};
use crate::error::{AppError, AppResult};
use crate::model::{Allocation, Page, PageQuery, Resource, ymd};

/// Σ hours a resource may book on one day
pub const DAILY_HOURS_CEILING: f64 = 24.0;

const EPSILON: f64 = 1e-9;

/// What an allocation is booked against; at most one per row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Task(i32),
    Bug(i32),
    Requirement(i32),
    Project(i32),
}

impl Dimension {
    /// Build from the four optional foreign keys, rejecting more than one
    pub fn from_columns(
        task_id: Option<i32>,
        bug_id: Option<i32>,
        requirement_id: Option<i32>,
        project_id: Option<i32>,
    ) -> AppResult<Option<Self>> {
        let set: Vec<Self> = [
            task_id.map(Self::Task),
            bug_id.map(Self::Bug),
            requirement_id.map(Self::Requirement),
            project_id.map(Self::Project),
        ]
        .into_iter()
        .flatten()
        .collect();

        match set.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            _ => Err(AppError::InvalidArgument(
                "an allocation may reference at most one of task, bug, requirement or project".to_string(),
            )),
        }
    }

    /// (task_id, bug_id, requirement_id, project_id)
    pub fn columns(dimension: Option<Self>) -> (Option<i32>, Option<i32>, Option<i32>, Option<i32>) {
        match dimension {
            None => (None, None, None, None),
            Some(Self::Task(id)) => (Some(id), None, None, None),
            Some(Self::Bug(id)) => (None, Some(id), None, None),
            Some(Self::Requirement(id)) => (None, None, Some(id), None),
            Some(Self::Project(id)) => (None, None, None, Some(id)),
        }
    }

    fn table(self) -> (&'static str, &'static str) {
        match self {
            Self::Task(_) => ("tasks", "task"),
            Self::Bug(_) => ("bugs", "bug"),
            Self::Requirement(_) => ("requirements", "requirement"),
            Self::Project(_) => ("projects", "project"),
        }
    }

    fn id(self) -> i32 {
        match self {
            Self::Task(id) | Self::Bug(id) | Self::Requirement(id) | Self::Project(id) => id,
        }
    }
}

/// Reject non-positive hours and totals above the daily ceiling
pub fn check_ceiling(already_booked: f64, hours: f64) -> AppResult<()> {
    if !(hours > 0.0) {
        return Err(AppError::InvalidArgument("hours must be greater than 0".to_string()));
    }
    let total = already_booked + hours;
    if total > DAILY_HOURS_CEILING + EPSILON {
        return Err(AppError::QuotaExceeded(format!(
            "daily hours would reach {total:.2}, above the {DAILY_HOURS_CEILING} hour ceiling"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAllocation {
    pub resource_id: i32,
    #[serde(with = "ymd")]
    pub date: Date,
    pub hours: f64,
    pub task_id: Option<i32>,
    pub bug_id: Option<i32>,
    pub requirement_id: Option<i32>,
    pub project_id: Option<i32>,
    #[serde(default)]
    pub description: String,
}

impl NewAllocation {
    pub fn dimension(&self) -> AppResult<Option<Dimension>> {
        Dimension::from_columns(self.task_id, self.bug_id, self.requirement_id, self.project_id)
    }
}

/// Lock a live resource row; concurrent bookings on it serialize here
async fn lock_resource(conn: &mut PgConnection, resource_id: i32) -> AppResult<Resource> {
    sqlx::query_as::<_, Resource>(
        "SELECT id, user_id, project_id FROM resources WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(resource_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("resource"))
}

/// The resource owner and members of its project may book against it
pub async fn ensure_resource_access(conn: &mut PgConnection, viewer: Viewer, resource_id: i32) -> AppResult<()> {
    let resource = sqlx::query_as::<_, Resource>(
        "SELECT id, user_id, project_id FROM resources WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(resource_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("resource"))?;

    if resource.user_id == viewer.user_id || is_project_member(conn, viewer, resource.project_id).await? {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

async fn booked_hours(conn: &mut PgConnection, resource_id: i32, date: Date, excluding: Option<i32>) -> AppResult<f64> {
    let sum: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(hours), 0)::DOUBLE PRECISION FROM resource_allocations
         WHERE resource_id = $1 AND date = $2 AND ($3::INTEGER IS NULL OR id <> $3)",
    )
    .bind(resource_id)
    .bind(date)
    .bind(excluding)
    .fetch_one(conn)
    .await?;
    Ok(sum)
}

async fn ensure_dimension_exists(conn: &mut PgConnection, dimension: Option<Dimension>) -> AppResult<()> {
    let Some(dimension) = dimension else {
        return Ok(());
    };
    let (table, label) = dimension.table();
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1 AND deleted_at IS NULL)"
    ))
    .bind(dimension.id())
    .fetch_one(conn)
    .await?;

    if exists { Ok(()) } else { Err(AppError::not_found(label)) }
}

/// Recompute the denormalized `actual_hours` of the task or bug an entry is booked against
async fn refresh_dimension(conn: &mut PgConnection, dimension: Option<Dimension>) -> AppResult<()> {
    match dimension {
        Some(Dimension::Task(id)) => {
            recompute_actual_hours(conn, SyncTarget::Task, id).await?;
        }
        Some(Dimension::Bug(id)) => {
            recompute_actual_hours(conn, SyncTarget::Bug, id).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Book hours against a resource. Must run inside a transaction.
pub async fn append_allocation(conn: &mut PgConnection, new: &NewAllocation) -> AppResult<Allocation> {
    let dimension = new.dimension()?;
    if !(new.hours > 0.0) {
        return Err(AppError::InvalidArgument("hours must be greater than 0".to_string()));
    }

    let resource = lock_resource(conn, new.resource_id).await?;
    ensure_dimension_exists(conn, dimension).await?;

    let booked = booked_hours(conn, resource.id, new.date, None).await?;
    check_ceiling(booked, new.hours)?;

    let (task_id, bug_id, requirement_id, project_id) = Dimension::columns(dimension);
    let allocation = sqlx::query_as::<_, Allocation>(
        "INSERT INTO resource_allocations
            (resource_id, date, hours, task_id, bug_id, requirement_id, project_id, description)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id, resource_id, date, hours, task_id, bug_id, requirement_id, project_id, description",
    )
    .bind(resource.id)
    .bind(new.date)
    .bind(new.hours)
    .bind(task_id)
    .bind(bug_id)
    .bind(requirement_id)
    .bind(project_id)
    .bind(&new.description)
    .fetch_one(&mut *conn)
    .await?;

    refresh_dimension(conn, dimension).await?;

    info!(
        "Allocation {} booked: resource {} on {} for {}h",
        allocation.id, resource.id, new.date, new.hours
    );
    Ok(allocation)
}

pub async fn load_allocation(conn: &mut PgConnection, id: i32) -> AppResult<Allocation> {
    sqlx::query_as::<_, Allocation>(
        "SELECT id, resource_id, date, hours, task_id, bug_id, requirement_id, project_id, description
         FROM resource_allocations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("allocation"))
}

/// Replace an entry's date, hours, dimension and description.
/// The ceiling is re-checked without counting the entry itself.
pub async fn update_allocation(conn: &mut PgConnection, id: i32, update: &NewAllocation) -> AppResult<Allocation> {
    let dimension = update.dimension()?;
    let before = load_allocation(conn, id).await?;
    let old_dimension = Dimension::from_columns(before.task_id, before.bug_id, before.requirement_id, before.project_id)?;

    // Lock in id order when an entry moves between resources
    let (first, second) = if before.resource_id <= update.resource_id {
        (before.resource_id, update.resource_id)
    } else {
        (update.resource_id, before.resource_id)
    };
    lock_resource(conn, first).await?;
    if second != first {
        lock_resource(conn, second).await?;
    }
    ensure_dimension_exists(conn, dimension).await?;

    let booked = booked_hours(conn, update.resource_id, update.date, Some(id)).await?;
    check_ceiling(booked, update.hours)?;

    let (task_id, bug_id, requirement_id, project_id) = Dimension::columns(dimension);
    let allocation = sqlx::query_as::<_, Allocation>(
        "UPDATE resource_allocations
         SET resource_id = $1, date = $2, hours = $3, task_id = $4, bug_id = $5,
             requirement_id = $6, project_id = $7, description = $8, updated_at = now()
         WHERE id = $9
         RETURNING id, resource_id, date, hours, task_id, bug_id, requirement_id, project_id, description",
    )
    .bind(update.resource_id)
    .bind(update.date)
    .bind(update.hours)
    .bind(task_id)
    .bind(bug_id)
    .bind(requirement_id)
    .bind(project_id)
    .bind(&update.description)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    refresh_dimension(conn, old_dimension).await?;
    if dimension != old_dimension {
        refresh_dimension(conn, dimension).await?;
    }

    info!("Allocation {} updated to {}h on {}", id, update.hours, update.date);
    Ok(allocation)
}

pub async fn delete_allocation(conn: &mut PgConnection, id: i32) -> AppResult<()> {
    let before = load_allocation(conn, id).await?;
    lock_resource(conn, before.resource_id).await?;

    sqlx::query("DELETE FROM resource_allocations WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let dimension = Dimension::from_columns(before.task_id, before.bug_id, before.requirement_id, before.project_id)?;
    refresh_dimension(conn, dimension).await?;

    info!("Allocation {} deleted", id);
    Ok(())
}

/// Remove every resource and entry owned by `user_id`, then recompute the
/// tasks and bugs those entries fed. Must run inside a transaction.
pub async fn release_user_ledger(conn: &mut PgConnection, user_id: i32) -> AppResult<usize> {
    let touched: Vec<(Option<i32>, Option<i32>)> = sqlx::query_as(
        "SELECT DISTINCT a.task_id, a.bug_id FROM resource_allocations a
         JOIN resources r ON r.id = a.resource_id
         WHERE r.user_id = $1 AND (a.task_id IS NOT NULL OR a.bug_id IS NOT NULL)",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    let removed = sqlx::query(
        "DELETE FROM resource_allocations WHERE resource_id IN (SELECT id FROM resources WHERE user_id = $1)",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query("DELETE FROM resources WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    for (task_id, bug_id) in touched {
        if let Some(id) = task_id {
            recompute_actual_hours(conn, SyncTarget::Task, id).await?;
        }
        if let Some(id) = bug_id {
            recompute_actual_hours(conn, SyncTarget::Bug, id).await?;
        }
    }

    debug!("Released {} ledger entries of user_id: {}", removed, user_id);
    Ok(removed as usize)
}

/// Work items whose `actual_hours` mirror the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Task,
    Bug,
}

impl SyncTarget {
    const fn table(self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Bug => "bugs",
        }
    }

    const fn column(self) -> &'static str {
        match self {
            Self::Task => "task_id",
            Self::Bug => "bug_id",
        }
    }

    const fn description_prefix(self) -> &'static str {
        match self {
            Self::Task => "任务",
            Self::Bug => "Bug",
        }
    }
}

/// `actual_hours := Σ hours` of every entry booked against the item
pub async fn recompute_actual_hours(conn: &mut PgConnection, target: SyncTarget, id: i32) -> AppResult<f64> {
    let sql = format!(
        "UPDATE {table} SET actual_hours = (
             SELECT COALESCE(SUM(hours), 0)::DOUBLE PRECISION FROM resource_allocations WHERE {column} = $1
         ), updated_at = now()
         WHERE id = $1
         RETURNING actual_hours",
        table = target.table(),
        column = target.column(),
    );
    let actual: Option<f64> = sqlx::query_scalar(&sql).bind(id).fetch_one(conn).await?;
    Ok(actual.unwrap_or(0.0))
}

/// Find the (user, project) resource, creating it on first use
pub async fn find_or_create_resource(conn: &mut PgConnection, user_id: i32, project_id: i32) -> AppResult<Resource> {
    sqlx::query(
        "INSERT INTO resources (user_id, project_id) VALUES ($1, $2)
         ON CONFLICT (user_id, project_id) WHERE deleted_at IS NULL DO NOTHING",
    )
    .bind(user_id)
    .bind(project_id)
    .execute(&mut *conn)
    .await?;

    let resource = sqlx::query_as::<_, Resource>(
        "SELECT id, user_id, project_id FROM resources
         WHERE user_id = $1 AND project_id = $2 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(user_id)
    .bind(project_id)
    .fetch_one(conn)
    .await?;

    Ok(resource)
}

/// Result of mirroring an item's `actual_hours` into the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub actual_hours: f64,
    pub resource_id: i32,
    /// The keyed entry after the sync; `None` when it was removed
    pub allocation_id: Option<i32>,
}

/// Make Σ(ledger hours for the item) equal `hours` by adjusting the single
/// entry keyed by (assignee's resource, `work_date`, item).
///
/// Items without an owner are left untouched and yield `None`.
/// Must run inside a transaction.
pub async fn sync_actual_hours(
    conn: &mut PgConnection,
    target: SyncTarget,
    id: i32,
    owner: Option<i32>,
    hours: f64,
    work_date: Date,
) -> AppResult<Option<SyncOutcome>> {
    if hours < 0.0 || !hours.is_finite() {
        return Err(AppError::InvalidArgument("actual hours must not be negative".to_string()));
    }

    let (title, project_id): (String, i32) = sqlx::query_as(&format!(
        "SELECT title, project_id FROM {} WHERE id = $1 AND deleted_at IS NULL",
        target.table()
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(target.column().trim_end_matches("_id")))?;

    let Some(owner) = owner else {
        debug!("{} {} has no assignee, ledger left untouched", target.table(), id);
        return Ok(None);
    };

    let resource = find_or_create_resource(conn, owner, project_id).await?;
    let column = target.column();

    let keyed: Option<(i32, f64)> = sqlx::query_as(&format!(
        "SELECT id, hours FROM resource_allocations
         WHERE resource_id = $1 AND date = $2 AND {column} = $3
         ORDER BY id LIMIT 1"
    ))
    .bind(resource.id)
    .bind(work_date)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let elsewhere: f64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(SUM(hours), 0)::DOUBLE PRECISION FROM resource_allocations
         WHERE {column} = $1 AND ($2::INTEGER IS NULL OR id <> $2)"
    ))
    .bind(id)
    .bind(keyed.map(|(entry, _)| entry))
    .fetch_one(&mut *conn)
    .await?;

    let entry_hours = hours - elsewhere;
    if entry_hours < -EPSILON {
        return Err(AppError::InvalidArgument(format!(
            "{elsewhere:.2} hours are already booked on other days, cannot set actual hours to {hours:.2}"
        )));
    }

    let allocation_id = if entry_hours <= EPSILON {
        if let Some((entry, _)) = keyed {
            sqlx::query("DELETE FROM resource_allocations WHERE id = $1")
                .bind(entry)
                .execute(&mut *conn)
                .await?;
        }
        None
    } else {
        let booked = booked_hours(conn, resource.id, work_date, keyed.map(|(entry, _)| entry)).await?;
        check_ceiling(booked, entry_hours)?;

        let description = format!("{}: {}", target.description_prefix(), title);
        let entry = match keyed {
            Some((entry, _)) => {
                sqlx::query("UPDATE resource_allocations SET hours = $1, description = $2, updated_at = now() WHERE id = $3")
                    .bind(entry_hours)
                    .bind(&description)
                    .bind(entry)
                    .execute(&mut *conn)
                    .await?;
                entry
            }
            None => {
                sqlx::query_scalar(&format!(
                    "INSERT INTO resource_allocations (resource_id, date, hours, {column}, description)
                     VALUES ($1, $2, $3, $4, $5) RETURNING id"
                ))
                .bind(resource.id)
                .bind(work_date)
                .bind(entry_hours)
                .bind(id)
                .bind(&description)
                .fetch_one(&mut *conn)
                .await?
            }
        };
        Some(entry)
    };

    let actual_hours = recompute_actual_hours(conn, target, id).await?;

    info!(
        "Synced {} {} actual hours to {:.2} via resource {} on {}",
        target.table(),
        id,
        actual_hours,
        resource.id,
        work_date
    );
    Ok(Some(SyncOutcome {
        actual_hours,
        resource_id: resource.id,
        allocation_id,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocationFilter {
    pub resource_id: Option<i32>,
    pub user_id: Option<i32>,
    pub project_id: Option<i32>,
    pub task_id: Option<i32>,
    pub bug_id: Option<i32>,
    #[serde(default, with = "ymd::option")]
    pub start_date: Option<Date>,
    #[serde(default, with = "ymd::option")]
    pub end_date: Option<Date>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &AllocationFilter, viewer: Viewer) {
    if let Some(v) = filter.resource_id {
        builder.push(" AND a.resource_id = ").push_bind(v);
    }
    if let Some(v) = filter.user_id {
        builder.push(" AND r.user_id = ").push_bind(v);
    }
    if let Some(v) = filter.project_id {
        builder.push(" AND r.project_id = ").push_bind(v);
    }
    if let Some(v) = filter.task_id {
        builder.push(" AND a.task_id = ").push_bind(v);
    }
    if let Some(v) = filter.bug_id {
        builder.push(" AND a.bug_id = ").push_bind(v);
    }
    if let Some(v) = filter.start_date {
        builder.push(" AND a.date >= ").push_bind(v);
    }
    if let Some(v) = filter.end_date {
        builder.push(" AND a.date <= ").push_bind(v);
    }
    scope_list(builder, ScopeKind::Allocation, "a", viewer);
}

pub async fn list_allocations(pool: &PgPool, viewer: Viewer, filter: &AllocationFilter) -> AppResult<Page<Allocation>> {
    let window = PageQuery {
        page: filter.page,
        page_size: filter.page_size,
    };

    let mut count = QueryBuilder::<Postgres>::new(
        "SELECT COUNT(*) FROM resource_allocations a JOIN resources r ON r.id = a.resource_id WHERE TRUE",
    );
    push_filters(&mut count, filter, viewer);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::<Postgres>::new(
        "SELECT a.id, a.resource_id, a.date, a.hours, a.task_id, a.bug_id, a.requirement_id, a.project_id, a.description
         FROM resource_allocations a JOIN resources r ON r.id = a.resource_id WHERE TRUE",
    );
    push_filters(&mut query, filter, viewer);
    query
        .push(" ORDER BY a.date DESC, a.id DESC LIMIT ")
        .push_bind(window.page_size())
        .push(" OFFSET ")
        .push_bind(window.offset());

    let items = query.build_query_as::<Allocation>().fetch_all(pool).await?;

    Ok(Page {
        items,
        total,
        page: window.page(),
        page_size: window.page_size(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{
        create_bug, create_project, create_requirement, create_resource, create_task, create_user, setup_test_db,
        unique,
    };
    use time::macros::date;

    fn booking(resource_id: i32, hours: f64, dimension: Option<Dimension>) -> NewAllocation {
        let (task_id, bug_id, requirement_id, project_id) = Dimension::columns(dimension);
        NewAllocation {
            resource_id,
            date: date!(2024 - 03 - 15),
            hours,
            task_id,
            bug_id,
            requirement_id,
            project_id,
            description: String::new(),
        }
    }

    async fn actual_hours(pool: &PgPool, table: &str, id: i32) -> Option<f64> {
        sqlx::query_scalar(&format!("SELECT actual_hours FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn test_dimension_accepts_at_most_one_target() {
        assert_eq!(Dimension::from_columns(None, None, None, None).unwrap(), None);
        assert_eq!(
            Dimension::from_columns(None, Some(4), None, None).unwrap(),
            Some(Dimension::Bug(4))
        );
        let err = Dimension::from_columns(Some(1), None, None, Some(2)).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn test_ceiling_arithmetic() {
        assert!(check_ceiling(0.0, 8.0).is_ok());
        assert!(check_ceiling(18.0, 6.0).is_ok());
        assert!(matches!(check_ceiling(18.0, 7.0), Err(AppError::QuotaExceeded(_))));
        assert!(matches!(check_ceiling(0.0, 0.0), Err(AppError::InvalidArgument(_))));
        assert!(matches!(check_ceiling(0.0, -2.0), Err(AppError::InvalidArgument(_))));
        assert!(matches!(check_ceiling(0.0, f64::NAN), Err(AppError::InvalidArgument(_))));
        // Accumulated binary fractions must not trip the ceiling
        assert!(check_ceiling(0.1 + 0.2 + 23.7 - 0.3, 0.3).is_ok());
    }

    #[tokio::test]
    async fn test_quota_scenario() {
        let pool = setup_test_db().await;
        let user = create_user(&pool, &unique("quota")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let resource = create_resource(&pool, user, project).await;
        let t1 = create_task(&pool, project, user, Some(user), "T1").await;
        let t2 = create_task(&pool, project, user, Some(user), "T2").await;
        let b1 = create_bug(&pool, project, user, &[user], "B1").await;

        let mut tx = pool.begin().await.unwrap();
        append_allocation(&mut tx, &booking(resource, 8.0, Some(Dimension::Task(t1)))).await.unwrap();
        append_allocation(&mut tx, &booking(resource, 10.0, Some(Dimension::Bug(b1)))).await.unwrap();
        let err = append_allocation(&mut tx, &booking(resource, 7.0, Some(Dimension::Task(t2))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
        tx.commit().await.unwrap();

        assert_eq!(actual_hours(&pool, "tasks", t1).await, Some(8.0));
        assert_eq!(actual_hours(&pool, "bugs", b1).await, Some(10.0));
    }

    #[tokio::test]
    async fn test_update_excludes_current_row_and_delete_recomputes() {
        let pool = setup_test_db().await;
        let user = create_user(&pool, &unique("upd")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let resource = create_resource(&pool, user, project).await;
        let task = create_task(&pool, project, user, Some(user), "T").await;

        let mut tx = pool.begin().await.unwrap();
        let entry = append_allocation(&mut tx, &booking(resource, 20.0, Some(Dimension::Task(task)))).await.unwrap();
        append_allocation(&mut tx, &booking(resource, 2.0, None)).await.unwrap();

        update_allocation(&mut tx, entry.id, &booking(resource, 22.0, Some(Dimension::Task(task)))).await.unwrap();
        let err = update_allocation(&mut tx, entry.id, &booking(resource, 22.5, Some(Dimension::Task(task))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));

        delete_allocation(&mut tx, entry.id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(actual_hours(&pool, "tasks", task).await, Some(0.0));
    }

    #[tokio::test]
    async fn test_missing_dimension_is_not_found() {
        let pool = setup_test_db().await;
        let user = create_user(&pool, &unique("nf")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let resource = create_resource(&pool, user, project).await;
        let requirement = create_requirement(&pool, project, user, "R").await;

        let mut tx = pool.begin().await.unwrap();
        append_allocation(&mut tx, &booking(resource, 1.0, Some(Dimension::Requirement(requirement))))
            .await
            .unwrap();
        let err = append_allocation(&mut tx, &booking(resource, 1.0, Some(Dimension::Task(i32::MAX))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = append_allocation(&mut tx, &booking(i32::MAX, 1.0, None)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sync_makes_ledger_sum_equal_requested_hours() {
        let pool = setup_test_db().await;
        let user = create_user(&pool, &unique("sync")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let task = create_task(&pool, project, user, Some(user), "Write docs").await;

        let mut tx = pool.begin().await.unwrap();
        let first = sync_actual_hours(&mut tx, SyncTarget::Task, task, Some(user), 5.0, date!(2024 - 03 - 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.actual_hours, 5.0);

        // A later date holds only the difference
        let second = sync_actual_hours(&mut tx, SyncTarget::Task, task, Some(user), 7.5, date!(2024 - 03 - 11))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.actual_hours, 7.5);
        assert_eq!(second.resource_id, first.resource_id);

        let hours: f64 = sqlx::query_scalar("SELECT hours FROM resource_allocations WHERE id = $1")
            .bind(second.allocation_id.unwrap())
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(hours, 2.5);

        // Same key updates in place
        let third = sync_actual_hours(&mut tx, SyncTarget::Task, task, Some(user), 6.0, date!(2024 - 03 - 11))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.allocation_id, second.allocation_id);
        assert_eq!(third.actual_hours, 6.0);

        let err = sync_actual_hours(&mut tx, SyncTarget::Task, task, Some(user), 3.0, date!(2024 - 03 - 11))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let description: String = sqlx::query_scalar("SELECT description FROM resource_allocations WHERE id = $1")
            .bind(third.allocation_id.unwrap())
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(description, "任务: Write docs");
    }

    #[tokio::test]
    async fn test_sync_without_owner_is_a_noop() {
        let pool = setup_test_db().await;
        let user = create_user(&pool, &unique("noop")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let task = create_task(&pool, project, user, None, "Unassigned").await;

        let mut tx = pool.begin().await.unwrap();
        let outcome = sync_actual_hours(&mut tx, SyncTarget::Task, task, None, 4.0, date!(2024 - 03 - 10))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_list_hides_foreign_projects() {
        let pool = setup_test_db().await;
        let owner = create_user(&pool, &unique("owner")).await;
        let stranger = create_user(&pool, &unique("stranger")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let resource = create_resource(&pool, owner, project).await;

        let mut tx = pool.begin().await.unwrap();
        append_allocation(&mut tx, &booking(resource, 3.0, None)).await.unwrap();
        tx.commit().await.unwrap();

        let filter = AllocationFilter {
            resource_id: Some(resource),
            ..Default::default()
        };
        let hidden = list_allocations(&pool, Viewer { user_id: stranger, is_admin: false }, &filter)
            .await
            .unwrap();
        assert_eq!(hidden.total, 0);

        let all = list_allocations(&pool, Viewer { user_id: stranger, is_admin: true }, &filter)
            .await
            .unwrap();
        assert_eq!(all.total, 1);
        assert_eq!(all.items[0].hours, 3.0);
    }
}
