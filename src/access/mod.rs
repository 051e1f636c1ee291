//! Permission resolution, project-scoped visibility and list narrowing.

pub mod menu;

use serde::Serialize;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::model::AuthContext;

/// Effective permission codes of a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "codes", rename_all = "snake_case")]
pub enum PermissionSet {
    /// Holder of the `admin` role
    All,
    Codes(BTreeSet<String>),
}

impl PermissionSet {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn contains(&self, code: &str) -> bool {
        match self {
            Self::All => true,
            Self::Codes(codes) => codes.contains(code),
        }
    }
}

/// The slice of caller identity the visibility rules need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: i32,
    pub is_admin: bool,
}

/// Resolve the permission set for `user_id` from live, enabled roles
pub async fn effective_permissions(conn: &mut PgConnection, user_id: i32) -> AppResult<PermissionSet> {
    let user: Option<(i16, bool)> = sqlx::query_as(
        "SELECT status, deleted_at IS NOT NULL FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    match user {
        None => return Err(AppError::Unauthenticated("user no longer exists".to_string())),
        Some((_, true)) => return Err(AppError::Forbidden("user has been deleted".to_string())),
        Some((status, false)) if status != 1 => {
            return Err(AppError::Forbidden("account is disabled".to_string()));
        }
        Some(_) => {}
    }

    let is_admin: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM user_roles ur JOIN roles r ON r.id = ur.role_id
            WHERE ur.user_id = $1 AND r.code = $2 AND r.status = 1 AND r.deleted_at IS NULL
        )",
    )
    .bind(user_id)
    .bind(AuthContext::ADMIN_ROLE)
    .fetch_one(&mut *conn)
    .await?;

    if is_admin {
        return Ok(PermissionSet::All);
    }

    let codes: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT p.code FROM permissions p
         JOIN role_permissions rp ON rp.permission_id = p.id
         JOIN roles r ON r.id = rp.role_id
         JOIN user_roles ur ON ur.role_id = r.id
         WHERE ur.user_id = $1
           AND r.status = 1 AND r.deleted_at IS NULL
           AND p.status = 1 AND p.deleted_at IS NULL",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    debug!("Resolved {} permission codes for user_id: {}", codes.len(), user_id);
    Ok(PermissionSet::Codes(codes.into_iter().collect()))
}

pub fn has_permission(set: &PermissionSet, code: &str) -> bool {
    set.contains(code)
}

/// Membership check with the admin bypass
pub async fn is_project_member(conn: &mut PgConnection, viewer: Viewer, project_id: i32) -> AppResult<bool> {
    if viewer.is_admin {
        return Ok(true);
    }

    let member: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM project_members
            WHERE project_id = $1 AND user_id = $2 AND deleted_at IS NULL
        )",
    )
    .bind(project_id)
    .bind(viewer.user_id)
    .fetch_one(conn)
    .await?;

    Ok(member)
}

/// Work items whose visibility follows creator / assignee / membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Requirement,
    Task,
    Bug,
}

impl Subject {
    const fn label(self) -> &'static str {
        match self {
            Self::Requirement => "requirement",
            Self::Task => "task",
            Self::Bug => "bug",
        }
    }

    /// Yields (project_id, creator_id, is_assignee) for a live row
    const fn lookup_sql(self) -> &'static str {
        match self {
            Self::Requirement => {
                "SELECT project_id, creator_id, COALESCE(assignee_id = $2, FALSE)
                 FROM requirements WHERE id = $1 AND deleted_at IS NULL"
            }
            Self::Task => {
                "SELECT project_id, creator_id, COALESCE(assignee_id = $2, FALSE)
                 FROM tasks WHERE id = $1 AND deleted_at IS NULL"
            }
            Self::Bug => {
                "SELECT b.project_id, b.creator_id,
                        EXISTS(SELECT 1 FROM bug_assignees ba WHERE ba.bug_id = b.id AND ba.user_id = $2)
                 FROM bugs b WHERE b.id = $1 AND b.deleted_at IS NULL"
            }
        }
    }
}

/// Visible iff admin, creator, assignee, or member of the owning project.
/// A missing row is `NotFound` regardless of who asks.
pub async fn is_visible(conn: &mut PgConnection, viewer: Viewer, subject: Subject, id: i32) -> AppResult<bool> {
    let row: Option<(i32, i32, bool)> = sqlx::query_as(subject.lookup_sql())
        .bind(id)
        .bind(viewer.user_id)
        .fetch_optional(&mut *conn)
        .await?;

    let (project_id, creator_id, is_assignee) = row.ok_or_else(|| AppError::not_found(subject.label()))?;

    if viewer.is_admin || creator_id == viewer.user_id || is_assignee {
        return Ok(true);
    }

    is_project_member(conn, viewer, project_id).await
}

pub async fn ensure_visible(conn: &mut PgConnection, viewer: Viewer, subject: Subject, id: i32) -> AppResult<()> {
    if is_visible(conn, viewer, subject, id).await? {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

pub async fn ensure_project_member(conn: &mut PgConnection, viewer: Viewer, project_id: i32) -> AppResult<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM projects WHERE id = $1 AND deleted_at IS NULL)")
        .bind(project_id)
        .fetch_one(&mut *conn)
        .await?;
    if !exists {
        return Err(AppError::not_found("project"));
    }

    if is_project_member(conn, viewer, project_id).await? {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

/// Listing families that can be narrowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Project,
    Requirement,
    Task,
    Bug,
    Allocation,
}

/// Append an `AND (...)` clause restricting `alias` rows to what `viewer` may see.
/// Admins are left unrestricted.
pub fn scope_list(builder: &mut QueryBuilder<'_, Postgres>, kind: ScopeKind, alias: &str, viewer: Viewer) {
    if viewer.is_admin {
        return;
    }

    let uid = viewer.user_id;
    match kind {
        ScopeKind::Project => {
            builder
                .push(" AND EXISTS (SELECT 1 FROM project_members pm WHERE pm.project_id = ")
                .push(alias)
                .push(".id AND pm.deleted_at IS NULL AND pm.user_id = ")
                .push_bind(uid)
                .push(")");
        }
        ScopeKind::Requirement | ScopeKind::Task => {
            builder
                .push(" AND (")
                .push(alias)
                .push(".creator_id = ")
                .push_bind(uid)
                .push(" OR ")
                .push(alias)
                .push(".assignee_id = ")
                .push_bind(uid)
                .push(" OR ")
                .push(alias);
            push_member_projects(builder, uid);
            builder.push(")");
        }
        ScopeKind::Bug => {
            builder
                .push(" AND (")
                .push(alias)
                .push(".creator_id = ")
                .push_bind(uid)
                .push(" OR ")
                .push(alias);
            push_member_projects(builder, uid);
            builder
                .push(" OR EXISTS (SELECT 1 FROM bug_assignees ba WHERE ba.bug_id = ")
                .push(alias)
                .push(".id AND ba.user_id = ")
                .push_bind(uid)
                .push("))");
        }
        ScopeKind::Allocation => {
            builder
                .push(" AND EXISTS (SELECT 1 FROM resources sr JOIN project_members pm ON pm.project_id = sr.project_id AND pm.deleted_at IS NULL WHERE sr.id = ")
                .push(alias)
                .push(".resource_id AND pm.user_id = ")
                .push_bind(uid)
                .push(")");
        }
    }
}

fn push_member_projects(builder: &mut QueryBuilder<'_, Postgres>, uid: i32) {
    builder
        .push(".project_id IN (SELECT project_id FROM project_members WHERE deleted_at IS NULL AND user_id = ")
        .push_bind(uid)
        .push(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{add_member, create_bug, create_project, create_task, create_user, setup_test_db, unique};

    fn member(user_id: i32) -> Viewer {
        Viewer { user_id, is_admin: false }
    }

    #[test]
    fn test_permission_set_membership() {
        let set = PermissionSet::Codes(["task:view".to_string()].into_iter().collect());
        assert!(has_permission(&set, "task:view"));
        assert!(!has_permission(&set, "task:delete"));
        assert!(has_permission(&PermissionSet::All, "anything"));
    }

    #[test]
    fn test_admin_scope_adds_nothing() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM tasks t WHERE t.deleted_at IS NULL");
        scope_list(&mut builder, ScopeKind::Task, "t", Viewer { user_id: 1, is_admin: true });
        assert_eq!(builder.sql(), "SELECT * FROM tasks t WHERE t.deleted_at IS NULL");
    }

    #[test]
    fn test_task_scope_covers_creator_assignee_and_membership() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM tasks t WHERE t.deleted_at IS NULL");
        scope_list(&mut builder, ScopeKind::Task, "t", member(7));
        let sql = builder.sql();
        assert!(sql.contains("t.creator_id = $1"));
        assert!(sql.contains("t.assignee_id = $2"));
        assert!(sql.contains("t.project_id IN (SELECT project_id FROM project_members"));
        assert!(sql.ends_with("user_id = $3))"));
    }

    #[test]
    fn test_bug_scope_checks_assignee_table() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM bugs b WHERE TRUE");
        scope_list(&mut builder, ScopeKind::Bug, "b", member(7));
        let sql = builder.sql();
        assert!(sql.contains("b.creator_id = $1"));
        assert!(sql.contains("bug_assignees ba WHERE ba.bug_id = b.id AND ba.user_id = $3"));
    }

    #[test]
    fn test_project_scope_is_membership_only() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM projects p WHERE TRUE");
        scope_list(&mut builder, ScopeKind::Project, "p", member(3));
        let sql = builder.sql();
        assert!(sql.contains("pm.project_id = p.id"));
        assert!(!sql.contains("creator_id"));
    }

    #[tokio::test]
    async fn test_task_visibility_rules() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        let creator = create_user(&pool, &unique("creator")).await;
        let outsider = create_user(&pool, &unique("outsider")).await;
        let teammate = create_user(&pool, &unique("teammate")).await;
        let project = create_project(&pool, &unique("proj")).await;
        add_member(&pool, project, teammate).await;
        let task = create_task(&pool, project, creator, None, "visible?").await;

        assert!(is_visible(&mut conn, member(creator), Subject::Task, task).await.unwrap());
        assert!(is_visible(&mut conn, member(teammate), Subject::Task, task).await.unwrap());
        assert!(!is_visible(&mut conn, member(outsider), Subject::Task, task).await.unwrap());
        assert!(
            is_visible(&mut conn, Viewer { user_id: outsider, is_admin: true }, Subject::Task, task)
                .await
                .unwrap()
        );

        let err = ensure_visible(&mut conn, member(outsider), Subject::Task, i32::MAX).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bug_assignee_sees_bug_outside_project() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        let creator = create_user(&pool, &unique("creator")).await;
        let fixer = create_user(&pool, &unique("fixer")).await;
        let project = create_project(&pool, &unique("proj")).await;
        let bug = create_bug(&pool, project, creator, &[fixer], "crash").await;

        assert!(is_visible(&mut conn, member(fixer), Subject::Bug, bug).await.unwrap());
        assert!(!is_project_member(&mut conn, member(fixer), project).await.unwrap());
    }

    #[tokio::test]
    async fn test_effective_permissions() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        let user = create_user(&pool, &unique("perm")).await;
        let role: i32 = sqlx::query_scalar("INSERT INTO roles (name, code) VALUES ($1, $1) RETURNING id")
            .bind(unique("role"))
            .fetch_one(&pool)
            .await
            .unwrap();
        let code = unique("task:view");
        let permission: i32 = sqlx::query_scalar("INSERT INTO permissions (code, name) VALUES ($1, $1) RETURNING id")
            .bind(&code)
            .fetch_one(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)")
            .bind(role)
            .bind(permission)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2)")
            .bind(user)
            .bind(role)
            .execute(&pool)
            .await
            .unwrap();

        let set = effective_permissions(&mut conn, user).await.unwrap();
        assert!(set.contains(&code));
        assert!(!set.is_all());

        sqlx::query("UPDATE roles SET status = 0 WHERE id = $1")
            .bind(role)
            .execute(&pool)
            .await
            .unwrap();
        let set = effective_permissions(&mut conn, user).await.unwrap();
        assert!(!set.contains(&code));

        sqlx::query("UPDATE users SET deleted_at = now() WHERE id = $1")
            .bind(user)
            .execute(&pool)
            .await
            .unwrap();
        let err = effective_permissions(&mut conn, user).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
