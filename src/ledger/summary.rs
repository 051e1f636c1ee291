use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use std::collections::HashSet;
use std::fmt::Write;
use time::{Date, Duration};

use crate::error::{AppError, AppResult};

/// Returned when a window holds neither bookings nor authored bugs
pub const NO_RECORDS: &str = "暂无工作记录";
const UNKNOWN_PROJECT: &str = "未知项目";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkSummary {
    pub content: String,
    pub total_hours: f64,
}

/// One ledger entry joined to whatever it was booked against
#[derive(Debug, Clone, Default, FromRow)]
pub struct LedgerLine {
    pub hours: f64,
    pub requirement_id: Option<i32>,
    pub requirement_title: Option<String>,
    pub task_id: Option<i32>,
    pub task_title: Option<String>,
    pub bug_id: Option<i32>,
    pub bug_title: Option<String>,
    pub project_name: Option<String>,
}

/// A bug the user filed inside the window
#[derive(Debug, Clone, FromRow)]
pub struct AuthoredBug {
    pub id: i32,
    pub title: String,
    pub project_name: Option<String>,
}

#[derive(Debug, Default)]
struct Section {
    items: Vec<(String, String, f64)>,
}

impl Section {
    fn push(&mut self, title: &str, project: &Option<String>, hours: f64) {
        let project = project.clone().unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
        self.items.push((title.to_string(), project, hours));
    }

    fn render(&self, out: &mut String, heading: &str, subtotal_label: &str) {
        if self.items.is_empty() {
            return;
        }
        let _ = write!(out, "## {heading}\n\n");
        let mut subtotal = 0.0;
        for (title, project, hours) in &self.items {
            let _ = writeln!(out, "- **{title}** (项目: {project}) - {hours:.2}小时");
            subtotal += hours;
        }
        let _ = write!(out, "\n**{subtotal_label}**: {subtotal:.2}小时\n\n");
    }
}

/// Group ledger lines into requirement, task and bug sections.
///
/// Lines are classified by the first of requirement, task, bug they reference.
/// Authored bugs already covered by a booking are skipped; the rest are listed at 0 hours.
/// The total counts every line, including ones booked against a bare project.
pub fn render_summary(lines: &[LedgerLine], authored_bugs: &[AuthoredBug]) -> WorkSummary {
    if lines.is_empty() && authored_bugs.is_empty() {
        return WorkSummary {
            content: NO_RECORDS.to_string(),
            total_hours: 0.0,
        };
    }

    let mut requirements = Section::default();
    let mut tasks = Section::default();
    let mut bugs = Section::default();
    let mut booked_bugs = HashSet::new();
    let mut total_hours = 0.0;

    for line in lines {
        total_hours += line.hours;

        if let (Some(_), Some(title)) = (line.requirement_id, &line.requirement_title) {
            requirements.push(title, &line.project_name, line.hours);
        } else if let (Some(_), Some(title)) = (line.task_id, &line.task_title) {
            tasks.push(title, &line.project_name, line.hours);
        } else if let (Some(id), Some(title)) = (line.bug_id, &line.bug_title) {
            booked_bugs.insert(id);
            bugs.push(title, &line.project_name, line.hours);
        }
    }

    for bug in authored_bugs {
        if booked_bugs.insert(bug.id) {
            bugs.push(&bug.title, &bug.project_name, 0.0);
        }
    }

    let mut content = String::new();
    requirements.render(&mut content, "需求", "需求总工时");
    tasks.render(&mut content, "任务", "任务总工时");
    bugs.render(&mut content, "Bug", "Bug总工时");
    let _ = write!(content, "**总工时**: {total_hours:.2}小时");

    WorkSummary { content, total_hours }
}

/// Summarize a user's ledger over the inclusive day range `[start, end]`
pub async fn summarize_user_work(conn: &mut PgConnection, user_id: i32, start: Date, end: Date) -> AppResult<WorkSummary> {
    if end < start {
        return Err(AppError::InvalidArgument("end date precedes start date".to_string()));
    }
    let end_exclusive = end + Duration::days(1);

    let lines = sqlx::query_as::<_, LedgerLine>(
        "SELECT a.hours,
                rq.id AS requirement_id, rq.title AS requirement_title,
                t.id AS task_id, t.title AS task_title,
                b.id AS bug_id, b.title AS bug_title,
                COALESCE(pi.name, pa.name, pr.name) AS project_name
         FROM resource_allocations a
         JOIN resources r ON r.id = a.resource_id
         LEFT JOIN requirements rq ON rq.id = a.requirement_id AND rq.deleted_at IS NULL
         LEFT JOIN tasks t ON t.id = a.task_id AND t.deleted_at IS NULL
         LEFT JOIN bugs b ON b.id = a.bug_id AND b.deleted_at IS NULL
         LEFT JOIN projects pi ON pi.id = COALESCE(rq.project_id, t.project_id, b.project_id)
         LEFT JOIN projects pa ON pa.id = a.project_id
         LEFT JOIN projects pr ON pr.id = r.project_id
         WHERE r.user_id = $1 AND a.date >= $2 AND a.date < $3
         ORDER BY a.date, a.id",
    )
    .bind(user_id)
    .bind(start)
    .bind(end_exclusive)
    .fetch_all(&mut *conn)
    .await?;

    let authored_bugs = sqlx::query_as::<_, AuthoredBug>(
        "SELECT b.id, b.title, p.name AS project_name
         FROM bugs b LEFT JOIN projects p ON p.id = b.project_id
         WHERE b.creator_id = $1 AND b.deleted_at IS NULL
           AND b.created_at >= $2::DATE AND b.created_at < $3::DATE
         ORDER BY b.created_at, b.id",
    )
    .bind(user_id)
    .bind(start)
    .bind(end_exclusive)
    .fetch_all(conn)
    .await?;

    Ok(render_summary(&lines, &authored_bugs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{create_bug, create_project, create_requirement, create_resource, create_task, create_user, setup_test_db, unique};
    use crate::ledger::{Dimension, NewAllocation, append_allocation};
    use pretty_assertions::assert_eq;
    use time::macros::date;

    fn alpha() -> Option<String> {
        Some("Alpha".to_string())
    }

    #[test]
    fn test_empty_window_yields_sentinel() {
        let summary = render_summary(&[], &[]);
        assert_eq!(summary.content, NO_RECORDS);
        assert_eq!(summary.total_hours, 0.0);
    }

    #[test]
    fn test_sections_subtotals_and_authored_bugs() {
        let lines = vec![
            LedgerLine {
                hours: 2.0,
                requirement_id: Some(1),
                requirement_title: Some("R1".into()),
                project_name: alpha(),
                ..Default::default()
            },
            LedgerLine {
                hours: 3.0,
                task_id: Some(1),
                task_title: Some("T1".into()),
                project_name: alpha(),
                ..Default::default()
            },
            LedgerLine {
                hours: 1.0,
                bug_id: Some(1),
                bug_title: Some("B1".into()),
                project_name: alpha(),
                ..Default::default()
            },
        ];
        let authored = vec![
            AuthoredBug { id: 1, title: "B1".into(), project_name: alpha() },
            AuthoredBug { id: 2, title: "B2".into(), project_name: alpha() },
        ];

        let summary = render_summary(&lines, &authored);
        let expected = "## 需求\n\n\
            - **R1** (项目: Alpha) - 2.00小时\n\
            \n**需求总工时**: 2.00小时\n\n\
            ## 任务\n\n\
            - **T1** (项目: Alpha) - 3.00小时\n\
            \n**任务总工时**: 3.00小时\n\n\
            ## Bug\n\n\
            - **B1** (项目: Alpha) - 1.00小时\n\
            - **B2** (项目: Alpha) - 0.00小时\n\
            \n**Bug总工时**: 1.00小时\n\n\
            **总工时**: 6.00小时";
        assert_eq!(summary.content, expected);
        assert_eq!(summary.total_hours, 6.0);
    }

    #[test]
    fn test_project_only_lines_count_toward_total_only() {
        let lines = vec![LedgerLine {
            hours: 1.5,
            project_name: alpha(),
            ..Default::default()
        }];
        let summary = render_summary(&lines, &[]);
        assert_eq!(summary.content, "**总工时**: 1.50小时");
        assert_eq!(summary.total_hours, 1.5);
    }

    #[test]
    fn test_missing_project_name_falls_back() {
        let authored = vec![AuthoredBug { id: 9, title: "Orphan".into(), project_name: None }];
        let summary = render_summary(&[], &authored);
        assert!(summary.content.contains("- **Orphan** (项目: 未知项目) - 0.00小时"));
    }

    #[tokio::test]
    async fn test_summarize_user_work_over_a_day() {
        let pool = setup_test_db().await;
        let user = create_user(&pool, &unique("sum")).await;
        let project_name = unique("Alpha");
        let project = create_project(&pool, &project_name).await;
        let resource = create_resource(&pool, user, project).await;
        let requirement = create_requirement(&pool, project, user, "R1").await;
        let task = create_task(&pool, project, user, Some(user), "T1").await;
        let bug = create_bug(&pool, project, user, &[user], "B1").await;
        let authored = create_bug(&pool, project, user, &[], "B2").await;

        let day = date!(2024 - 03 - 10);
        sqlx::query("UPDATE bugs SET created_at = '2024-03-10 09:00:00+00' WHERE id = ANY($1)")
            .bind(vec![bug, authored])
            .execute(&pool)
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        for (hours, dimension) in [
            (2.0, Dimension::Requirement(requirement)),
            (3.0, Dimension::Task(task)),
            (1.0, Dimension::Bug(bug)),
        ] {
            let (task_id, bug_id, requirement_id, project_id) = Dimension::columns(Some(dimension));
            append_allocation(
                &mut tx,
                &NewAllocation {
                    resource_id: resource,
                    date: day,
                    hours,
                    task_id,
                    bug_id,
                    requirement_id,
                    project_id,
                    description: String::new(),
                },
            )
            .await
            .unwrap();
        }

        let summary = summarize_user_work(&mut tx, user, day, day).await.unwrap();
        assert_eq!(summary.total_hours, 6.0);
        assert!(summary.content.contains("## 需求"));
        assert!(summary.content.contains(&format!("- **B2** (项目: {project_name}) - 0.00小时")));
        assert!(summary.content.ends_with("**总工时**: 6.00小时"));

        let next_day = summarize_user_work(&mut tx, user, date!(2024 - 03 - 11), date!(2024 - 03 - 11))
            .await
            .unwrap();
        assert_eq!(next_day.content, NO_RECORDS);
    }
}
