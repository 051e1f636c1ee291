//! Projects, membership and the guarded deletion of directory entities

mod project;

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

use crate::access::Viewer;
use crate::error::{AppError, AppResult};
use crate::{ledger, report};

pub use project::{MEMBER_ROLE, NewProject, ProjectFilter, add_member, create_project, list_projects};

/// Entities whose deletion is refused while live rows still point at them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guarded {
    Project,
    Department,
    Role,
    Permission,
    Tag,
    Module,
}

/// A table pointing at a guarded entity
struct Referrer {
    table: &'static str,
    column: &'static str,
    /// Referrer rows carry their own `deleted_at`
    soft_deleted: bool,
    label: &'static str,
}

const fn referrer(table: &'static str, column: &'static str, soft_deleted: bool, label: &'static str) -> Referrer {
    Referrer {
        table,
        column,
        soft_deleted,
        label,
    }
}

impl Guarded {
    const fn table(self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Department => "departments",
            Self::Role => "roles",
            Self::Permission => "permissions",
            Self::Tag => "tags",
            Self::Module => "modules",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Department => "department",
            Self::Role => "role",
            Self::Permission => "permission",
            Self::Tag => "tag",
            Self::Module => "module",
        }
    }

    fn referrers(self) -> &'static [Referrer] {
        const PROJECT: &[Referrer] = &[
            referrer("requirements", "project_id", true, "requirements"),
            referrer("tasks", "project_id", true, "tasks"),
            referrer("bugs", "project_id", true, "bugs"),
        ];
        const DEPARTMENT: &[Referrer] = &[
            referrer("departments", "parent_id", true, "child departments"),
            referrer("users", "department_id", true, "users"),
        ];
        const ROLE: &[Referrer] = &[referrer("user_roles", "role_id", false, "users")];
        const PERMISSION: &[Referrer] = &[
            referrer("role_permissions", "permission_id", false, "roles"),
            referrer("permissions", "parent_menu_id", true, "child menus"),
        ];
        const TAG: &[Referrer] = &[referrer("entity_tags", "tag_id", false, "tagged items")];
        const MODULE: &[Referrer] = &[
            referrer("modules", "parent_id", true, "child modules"),
            referrer("requirements", "module_id", true, "requirements"),
            referrer("bugs", "module_id", true, "bugs"),
        ];

        match self {
            Self::Project => PROJECT,
            Self::Department => DEPARTMENT,
            Self::Role => ROLE,
            Self::Permission => PERMISSION,
            Self::Tag => TAG,
            Self::Module => MODULE,
        }
    }
}

/// Label of the first referrer table still holding live rows for `id`
async fn first_live_referrer(conn: &mut PgConnection, kind: Guarded, id: i32) -> AppResult<Option<(&'static str, i64)>> {
    for r in kind.referrers() {
        let live = if r.soft_deleted { " AND deleted_at IS NULL" } else { "" };
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1{live}",
            r.table, r.column
        ))
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        if count > 0 {
            return Ok(Some((r.label, count)));
        }
    }
    Ok(None)
}

/// Soft-delete `id` unless live rows still reference it
pub async fn delete_guarded(pool: &PgPool, kind: Guarded, id: i32) -> AppResult<()> {
    let mut tx = pool.begin().await?;

    let locked: Option<i32> = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        kind.table()
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    if locked.is_none() {
        return Err(AppError::not_found(kind.label()));
    }

    if let Some((label, count)) = first_live_referrer(&mut tx, kind, id).await? {
        warn!("Refusing to delete {} {}: {} {} still reference it", kind.label(), id, count, label);
        return Err(AppError::Dependency(format!(
            "{} is still referenced by {count} {label}",
            kind.label()
        )));
    }

    sqlx::query(&format!(
        "UPDATE {} SET deleted_at = now(), updated_at = now() WHERE id = $1",
        kind.table()
    ))
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("{} {} deleted", kind.label(), id);
    Ok(())
}

/// Hard-delete a user after detaching roles, approver links and assignments.
/// Their ledger entries and own reports go with the account and the hours they
/// fed are recomputed. Work items the user created still block the delete.
pub async fn delete_user(pool: &PgPool, caller: Viewer, user_id: i32) -> AppResult<()> {
    if caller.user_id == user_id {
        return Err(AppError::InvalidArgument("you cannot delete your own account".to_string()));
    }

    let mut tx = pool.begin().await?;

    let exists: Option<i32> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(AppError::not_found("user"));
    }

    report::detach_approver(&mut tx, user_id).await?;
    ledger::release_user_ledger(&mut tx, user_id).await?;

    for sql in [
        "DELETE FROM user_roles WHERE user_id = $1",
        "UPDATE tasks SET assignee_id = NULL WHERE assignee_id = $1",
        "UPDATE requirements SET assignee_id = NULL WHERE assignee_id = $1",
    ] {
        sqlx::query(sql).bind(user_id).execute(&mut *tx).await?;
    }

    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!("User {} deleted by user_id: {}", user_id, caller.user_id);
    Ok(())
}
