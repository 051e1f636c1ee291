use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::Date;
use tracing::info;

use crate::access::{ScopeKind, Viewer, ensure_project_member, scope_list};
use crate::error::{AppError, AppResult};
use crate::model::{Page, PageQuery, Project, ProjectMember, ProjectStatus, QueryPairs, ymd};

/// Label given to a project's creator in its member list
pub const CREATOR_ROLE: &str = "project manager";
pub const MEMBER_ROLE: &str = "member";

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub status: Option<String>,
    #[serde(default, with = "ymd::option")]
    pub start_date: Option<Date>,
    #[serde(default, with = "ymd::option")]
    pub end_date: Option<Date>,
}

const PROJECT_COLUMNS: &str = "id, name, code, description, status, start_date, end_date, created_at, updated_at";

/// Create a project and enrol its creator as project manager
pub async fn create_project(pool: &PgPool, creator_id: i32, new: &NewProject) -> AppResult<Project> {
    let name = new.name.trim();
    let code = new.code.trim();
    if name.is_empty() || code.is_empty() {
        return Err(AppError::InvalidArgument("project name and code are required".to_string()));
    }
    let status = new
        .status
        .as_deref()
        .map(str::parse::<ProjectStatus>)
        .transpose()?
        .unwrap_or(ProjectStatus::Wait);
    if let (Some(start), Some(end)) = (new.start_date, new.end_date) {
        if end < start {
            return Err(AppError::InvalidArgument("end_date precedes start_date".to_string()));
        }
    }

    let mut tx = pool.begin().await?;

    let project = sqlx::query_as::<_, Project>(&format!(
        "INSERT INTO projects (name, code, description, status, start_date, end_date)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING {PROJECT_COLUMNS}"
    ))
    .bind(name)
    .bind(code)
    .bind(&new.description)
    .bind(status.as_str())
    .bind(new.start_date)
    .bind(new.end_date)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3)")
        .bind(project.id)
        .bind(creator_id)
        .bind(CREATOR_ROLE)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!("Project {} ({}) created by user_id: {}", project.id, project.code, creator_id);
    Ok(project)
}

/// Enrol `user_id` in a project the caller belongs to
pub async fn add_member(pool: &PgPool, viewer: Viewer, project_id: i32, user_id: i32, role: &str) -> AppResult<ProjectMember> {
    let mut tx = pool.begin().await?;
    ensure_project_member(&mut tx, viewer, project_id).await?;

    let user_live: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND deleted_at IS NULL)")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
    if !user_live {
        return Err(AppError::not_found("user"));
    }

    let member = sqlx::query_as::<_, ProjectMember>(
        "INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3)
         ON CONFLICT (project_id, user_id) WHERE deleted_at IS NULL DO NOTHING
         RETURNING id, project_id, user_id, role",
    )
    .bind(project_id)
    .bind(user_id)
    .bind(role.trim())
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::Conflict(format!("user {user_id} is already a member of project {project_id}")))?;

    tx.commit().await?;
    info!("User {} joined project {} as '{}'", user_id, project_id, member.role);
    Ok(member)
}

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub statuses: Vec<ProjectStatus>,
    pub keyword: Option<String>,
    pub window: PageQuery,
}

impl ProjectFilter {
    pub fn from_pairs(pairs: &QueryPairs) -> AppResult<Self> {
        Ok(Self {
            statuses: pairs.parse_all("status")?,
            keyword: pairs.first("keyword").map(str::to_string),
            window: pairs.page()?,
        })
    }

    fn push(&self, builder: &mut QueryBuilder<'_, Postgres>, viewer: Viewer) {
        builder.push(" AND p.deleted_at IS NULL");
        if !self.statuses.is_empty() {
            let statuses: Vec<&'static str> = self.statuses.iter().map(|s| s.as_str()).collect();
            builder.push(" AND p.status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(keyword) = &self.keyword {
            let pattern = format!("%{keyword}%");
            builder
                .push(" AND (p.name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR p.code ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        scope_list(builder, ScopeKind::Project, "p", viewer);
    }
}

/// Projects the caller is a member of, or all of them for admins
pub async fn list_projects(pool: &PgPool, viewer: Viewer, filter: &ProjectFilter) -> AppResult<Page<Project>> {
    let window = filter.window;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM projects p WHERE TRUE");
    filter.push(&mut count, viewer);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::<Postgres>::new(
        "SELECT p.id, p.name, p.code, p.description, p.status, p.start_date, p.end_date, p.created_at, p.updated_at
         FROM projects p WHERE TRUE",
    );
    filter.push(&mut query, viewer);
    query
        .push(" ORDER BY p.id DESC LIMIT ")
        .push_bind(window.page_size())
        .push(" OFFSET ")
        .push_bind(window.offset());
    let items = query.build_query_as::<Project>().fetch_all(pool).await?;

    Ok(Page {
        items,
        total,
        page: window.page(),
        page_size: window.page_size(),
    })
}
