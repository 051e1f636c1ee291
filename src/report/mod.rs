//! Daily and weekly reports with multi-approver decisions.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeSet;
use time::Date;
use tracing::{info, warn};

use crate::access::Viewer;
use crate::error::{AppError, AppResult};
use crate::ledger::summary::summarize_user_work;
use crate::model::{ApprovalDecision, DailyReport, DecisionStatus, ReportStatus, Verdict, WeeklyReport, ymd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Daily,
    Weekly,
}

impl ReportKind {
    const fn table(self) -> &'static str {
        match self {
            Self::Daily => "daily_reports",
            Self::Weekly => "weekly_reports",
        }
    }

    const fn approvers_table(self) -> &'static str {
        match self {
            Self::Daily => "daily_report_approvers",
            Self::Weekly => "weekly_report_approvers",
        }
    }

    const fn approvals_table(self) -> &'static str {
        match self {
            Self::Daily => "daily_report_approvals",
            Self::Weekly => "weekly_report_approvals",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Daily => "daily report",
            Self::Weekly => "weekly report",
        }
    }
}

/// Roll decisions up into a report status.
///
/// `None` when there is nothing to roll up. Any pending decision keeps the
/// report `submitted`; otherwise one rejection rejects it, else it is approved.
pub fn aggregate(decisions: &[DecisionStatus]) -> Option<ReportStatus> {
    if decisions.is_empty() {
        return None;
    }
    if decisions.contains(&DecisionStatus::Pending) {
        Some(ReportStatus::Submitted)
    } else if decisions.contains(&DecisionStatus::Rejected) {
        Some(ReportStatus::Rejected)
    } else {
        Some(ReportStatus::Approved)
    }
}

/// Status, owner and decisions of a report after a workflow step
#[derive(Debug, Clone, Serialize)]
pub struct ReportState {
    pub id: i32,
    pub kind: ReportKind,
    pub user_id: i32,
    pub status: ReportStatus,
    pub approver_ids: Vec<i32>,
    pub decisions: Vec<ApprovalDecision>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDailyReport {
    #[serde(with = "ymd")]
    pub date: Date,
    #[serde(default)]
    pub content: String,
    pub hours: Option<f64>,
    pub status: Option<ReportStatus>,
    #[serde(default)]
    pub approver_ids: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWeeklyReport {
    #[serde(with = "ymd")]
    pub week_start: Date,
    #[serde(with = "ymd")]
    pub week_end: Date,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub next_week_plan: String,
    pub status: Option<ReportStatus>,
    #[serde(default)]
    pub approver_ids: Vec<i32>,
}

fn initial_status(requested: Option<ReportStatus>) -> AppResult<ReportStatus> {
    match requested.unwrap_or(ReportStatus::Draft) {
        status @ (ReportStatus::Draft | ReportStatus::Submitted) => Ok(status),
        other => Err(AppError::InvalidArgument(format!("a new report cannot start as '{other}'"))),
    }
}

/// Deduplicate and confirm every approver is a live user
async fn validate_approvers(conn: &mut PgConnection, approver_ids: &[i32]) -> AppResult<Vec<i32>> {
    let wanted: BTreeSet<i32> = approver_ids.iter().copied().collect();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let wanted: Vec<i32> = wanted.into_iter().collect();

    let found: Vec<i32> = sqlx::query_scalar("SELECT id FROM users WHERE id = ANY($1) AND deleted_at IS NULL")
        .bind(&wanted)
        .fetch_all(conn)
        .await?;

    let found: BTreeSet<i32> = found.into_iter().collect();
    let missing: Vec<String> = wanted
        .iter()
        .filter(|id| !found.contains(id))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(AppError::InvalidArgument(format!("unknown approvers: {}", missing.join(", "))));
    }
    Ok(wanted)
}

async fn attach_approvers(conn: &mut PgConnection, kind: ReportKind, report_id: i32, approver_ids: &[i32]) -> AppResult<()> {
    if approver_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(&format!(
        "INSERT INTO {} (report_id, user_id) SELECT $1, UNNEST($2::INTEGER[]) ON CONFLICT DO NOTHING",
        kind.approvers_table()
    ))
    .bind(report_id)
    .bind(approver_ids)
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {} (report_id, approver_id, status) SELECT $1, UNNEST($2::INTEGER[]), 'pending'
         ON CONFLICT (report_id, approver_id) DO NOTHING",
        kind.approvals_table()
    ))
    .bind(report_id)
    .bind(approver_ids)
    .execute(conn)
    .await?;

    Ok(())
}

/// Lock a live report row and return (owner, status)
async fn lock_report(conn: &mut PgConnection, kind: ReportKind, report_id: i32) -> AppResult<(i32, ReportStatus)> {
    let row: Option<(i32, String)> = sqlx::query_as(&format!(
        "SELECT user_id, status FROM {} WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        kind.table()
    ))
    .bind(report_id)
    .fetch_optional(conn)
    .await?;

    let (owner, status) = row.ok_or_else(|| AppError::not_found(kind.label()))?;
    Ok((owner, status.parse()?))
}

async fn set_status(conn: &mut PgConnection, kind: ReportKind, report_id: i32, status: ReportStatus) -> AppResult<()> {
    sqlx::query(&format!(
        "UPDATE {} SET status = $1, updated_at = now() WHERE id = $2",
        kind.table()
    ))
    .bind(status.as_str())
    .bind(report_id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn decision_statuses(conn: &mut PgConnection, kind: ReportKind, report_id: i32) -> AppResult<Vec<DecisionStatus>> {
    let raw: Vec<String> = sqlx::query_scalar(&format!(
        "SELECT status FROM {} WHERE report_id = $1",
        kind.approvals_table()
    ))
    .bind(report_id)
    .fetch_all(conn)
    .await?;

    raw.iter().map(|s| s.parse()).collect()
}

/// Re-derive a non-draft report's status from its decisions
async fn roll_up(conn: &mut PgConnection, kind: ReportKind, report_id: i32, current: ReportStatus) -> AppResult<ReportStatus> {
    if current == ReportStatus::Draft {
        return Ok(current);
    }
    let decisions = decision_statuses(conn, kind, report_id).await?;
    match aggregate(&decisions) {
        Some(next) if next != current => {
            set_status(conn, kind, report_id, next).await?;
            info!("{} {} moved from {} to {}", kind.label(), report_id, current, next);
            Ok(next)
        }
        _ => Ok(current),
    }
}

/// Drop `user_id` from every approver list and re-derive the status of each
/// report they were listed on. Must run inside a transaction.
pub async fn detach_approver(conn: &mut PgConnection, user_id: i32) -> AppResult<usize> {
    let mut touched = 0;

    for kind in [ReportKind::Daily, ReportKind::Weekly] {
        let reports: Vec<(i32, String)> = sqlx::query_as(&format!(
            "SELECT r.id, r.status FROM {table} r
             WHERE r.deleted_at IS NULL
               AND (EXISTS (SELECT 1 FROM {approvers} ap WHERE ap.report_id = r.id AND ap.user_id = $1)
                 OR EXISTS (SELECT 1 FROM {approvals} ad WHERE ad.report_id = r.id AND ad.approver_id = $1))
             ORDER BY r.id
             FOR UPDATE",
            table = kind.table(),
            approvers = kind.approvers_table(),
            approvals = kind.approvals_table(),
        ))
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

        sqlx::query(&format!("DELETE FROM {} WHERE approver_id = $1", kind.approvals_table()))
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("DELETE FROM {} WHERE user_id = $1", kind.approvers_table()))
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

        for (report_id, status) in &reports {
            roll_up(conn, kind, *report_id, status.parse()?).await?;
        }
        touched += reports.len();
    }

    Ok(touched)
}

async fn load_state(conn: &mut PgConnection, kind: ReportKind, report_id: i32) -> AppResult<ReportState> {
    let (user_id, status): (i32, String) = sqlx::query_as(&format!(
        "SELECT user_id, status FROM {} WHERE id = $1 AND deleted_at IS NULL",
        kind.table()
    ))
    .bind(report_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(kind.label()))?;

    let approver_ids: Vec<i32> = sqlx::query_scalar(&format!(
        "SELECT user_id FROM {} WHERE report_id = $1 ORDER BY user_id",
        kind.approvers_table()
    ))
    .bind(report_id)
    .fetch_all(&mut *conn)
    .await?;

    let decisions = sqlx::query_as::<_, ApprovalDecision>(&format!(
        "SELECT id, report_id, approver_id, status, comment, updated_at FROM {} WHERE report_id = $1 ORDER BY approver_id",
        kind.approvals_table()
    ))
    .bind(report_id)
    .fetch_all(conn)
    .await?;

    Ok(ReportState {
        id: report_id,
        kind,
        user_id,
        status: status.parse()?,
        approver_ids,
        decisions,
    })
}

/// Report state visible to its owner, its approvers and admins
pub async fn report_state(pool: &PgPool, kind: ReportKind, report_id: i32, viewer: Viewer) -> AppResult<ReportState> {
    let mut conn = pool.acquire().await?;
    let state = load_state(&mut conn, kind, report_id).await?;

    if viewer.is_admin || state.user_id == viewer.user_id || state.approver_ids.contains(&viewer.user_id) {
        Ok(state)
    } else {
        Err(AppError::forbidden())
    }
}

pub async fn create_daily_report(pool: &PgPool, user_id: i32, req: CreateDailyReport) -> AppResult<DailyReport> {
    let status = initial_status(req.status)?;
    let mut tx = pool.begin().await?;

    let approvers = validate_approvers(&mut tx, &req.approver_ids).await?;

    let taken: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM daily_reports WHERE user_id = $1 AND date = $2 AND deleted_at IS NULL)",
    )
    .bind(user_id)
    .bind(req.date)
    .fetch_one(&mut *tx)
    .await?;
    if taken {
        return Err(AppError::Conflict(format!("a daily report for {} already exists", req.date)));
    }

    let (content, hours) = if req.content.trim().is_empty() {
        let summary = summarize_user_work(&mut tx, user_id, req.date, req.date).await?;
        (summary.content, summary.total_hours)
    } else {
        (req.content, req.hours.unwrap_or(0.0))
    };

    let report = sqlx::query_as::<_, DailyReport>(
        "INSERT INTO daily_reports (user_id, date, content, hours, status)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id, user_id, date, content, hours, status, created_at, updated_at",
    )
    .bind(user_id)
    .bind(req.date)
    .bind(&content)
    .bind(hours)
    .bind(status.as_str())
    .fetch_one(&mut *tx)
    .await?;

    attach_approvers(&mut tx, ReportKind::Daily, report.id, &approvers).await?;
    tx.commit().await?;

    info!(
        "Daily report {} created for user_id: {} with {} approvers",
        report.id,
        user_id,
        approvers.len()
    );
    Ok(report)
}

pub async fn create_weekly_report(pool: &PgPool, user_id: i32, req: CreateWeeklyReport) -> AppResult<WeeklyReport> {
    if req.week_end < req.week_start {
        return Err(AppError::InvalidArgument("week_end precedes week_start".to_string()));
    }
    let status = initial_status(req.status)?;
    let mut tx = pool.begin().await?;

    let approvers = validate_approvers(&mut tx, &req.approver_ids).await?;

    let summary = if req.summary.trim().is_empty() {
        summarize_user_work(&mut tx, user_id, req.week_start, req.week_end).await?.content
    } else {
        req.summary
    };

    let report = sqlx::query_as::<_, WeeklyReport>(
        "INSERT INTO weekly_reports (user_id, week_start, week_end, summary, next_week_plan, status)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, user_id, week_start, week_end, summary, next_week_plan, status, created_at, updated_at",
    )
    .bind(user_id)
    .bind(req.week_start)
    .bind(req.week_end)
    .bind(&summary)
    .bind(&req.next_week_plan)
    .bind(status.as_str())
    .fetch_one(&mut *tx)
    .await?;

    attach_approvers(&mut tx, ReportKind::Weekly, report.id, &approvers).await?;
    tx.commit().await?;

    info!(
        "Weekly report {} created for user_id: {} covering {}..{}",
        report.id, user_id, req.week_start, req.week_end
    );
    Ok(report)
}

/// Set the approver list. Kept approvers keep their decisions untouched,
/// removed ones lose theirs, new ones start `pending`.
pub async fn replace_approvers(
    pool: &PgPool,
    kind: ReportKind,
    report_id: i32,
    caller: Viewer,
    approver_ids: &[i32],
) -> AppResult<ReportState> {
    let mut tx = pool.begin().await?;

    let (owner, status) = lock_report(&mut tx, kind, report_id).await?;
    if owner != caller.user_id && !caller.is_admin {
        return Err(AppError::forbidden());
    }

    let approvers = validate_approvers(&mut tx, approver_ids).await?;

    sqlx::query(&format!(
        "DELETE FROM {} WHERE report_id = $1 AND user_id <> ALL($2::INTEGER[])",
        kind.approvers_table()
    ))
    .bind(report_id)
    .bind(&approvers)
    .execute(&mut *tx)
    .await?;

    sqlx::query(&format!(
        "DELETE FROM {} WHERE report_id = $1 AND approver_id <> ALL($2::INTEGER[])",
        kind.approvals_table()
    ))
    .bind(report_id)
    .bind(&approvers)
    .execute(&mut *tx)
    .await?;

    attach_approvers(&mut tx, kind, report_id, &approvers).await?;
    roll_up(&mut tx, kind, report_id, status).await?;

    let state = load_state(&mut tx, kind, report_id).await?;
    tx.commit().await?;

    info!("{} {} now has {} approvers", kind.label(), report_id, approvers.len());
    Ok(state)
}

/// Owner submits a draft, or resubmits a rejected report with every decision reset
pub async fn submit(pool: &PgPool, kind: ReportKind, report_id: i32, caller_id: i32) -> AppResult<ReportState> {
    let mut tx = pool.begin().await?;

    let (owner, status) = lock_report(&mut tx, kind, report_id).await?;
    if owner != caller_id {
        return Err(AppError::Forbidden("only the owner may submit a report".to_string()));
    }

    match status {
        ReportStatus::Draft => {}
        ReportStatus::Rejected => {
            sqlx::query(&format!(
                "UPDATE {} SET status = 'pending', comment = '', updated_at = now() WHERE report_id = $1",
                kind.approvals_table()
            ))
            .bind(report_id)
            .execute(&mut *tx)
            .await?;
        }
        other => {
            return Err(AppError::InvalidArgument(format!("a report in '{other}' cannot be submitted")));
        }
    }

    set_status(&mut tx, kind, report_id, ReportStatus::Submitted).await?;
    let state = load_state(&mut tx, kind, report_id).await?;
    tx.commit().await?;

    info!("{} {} submitted by user_id: {}", kind.label(), report_id, caller_id);
    Ok(state)
}

/// Record one approver's verdict and roll the report status up
pub async fn decide(
    pool: &PgPool,
    kind: ReportKind,
    report_id: i32,
    caller: Viewer,
    verdict: &str,
    comment: &str,
) -> AppResult<ReportState> {
    let verdict: Verdict = verdict.parse()?;
    let mut tx = pool.begin().await?;

    let (_, status) = lock_report(&mut tx, kind, report_id).await?;

    let listed: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE report_id = $1 AND user_id = $2)",
        kind.approvers_table()
    ))
    .bind(report_id)
    .bind(caller.user_id)
    .fetch_one(&mut *tx)
    .await?;

    if !listed && !caller.is_admin {
        warn!(
            "user_id: {} tried to decide {} {} without being an approver",
            caller.user_id,
            kind.label(),
            report_id
        );
        return Err(AppError::Forbidden("only listed approvers may decide".to_string()));
    }

    if status == ReportStatus::Draft {
        return Err(AppError::InvalidArgument("a draft report cannot be decided".to_string()));
    }

    let decision = DecisionStatus::from(verdict);
    sqlx::query(&format!(
        "INSERT INTO {} (report_id, approver_id, status, comment) VALUES ($1, $2, $3, $4)
         ON CONFLICT (report_id, approver_id)
         DO UPDATE SET status = EXCLUDED.status, comment = EXCLUDED.comment, updated_at = now()",
        kind.approvals_table()
    ))
    .bind(report_id)
    .bind(caller.user_id)
    .bind(decision.as_str())
    .bind(comment)
    .execute(&mut *tx)
    .await?;

    roll_up(&mut tx, kind, report_id, status).await?;
    let state = load_state(&mut tx, kind, report_id).await?;
    tx.commit().await?;

    info!(
        "user_id: {} marked {} {} as {}; report is {}",
        caller.user_id,
        kind.label(),
        report_id,
        decision,
        state.status
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{create_user, setup_test_db, unique};
    use time::macros::date;

    use crate::model::DecisionStatus::{Approved as A, Pending as P, Rejected as R};

    fn approver(user_id: i32) -> Viewer {
        Viewer { user_id, is_admin: false }
    }

    #[test]
    fn test_aggregate_is_a_pure_function_of_decisions() {
        assert_eq!(aggregate(&[]), None);
        assert_eq!(aggregate(&[P, P, P]), Some(ReportStatus::Submitted));
        assert_eq!(aggregate(&[A, P, P]), Some(ReportStatus::Submitted));
        assert_eq!(aggregate(&[A, R, P]), Some(ReportStatus::Submitted));
        assert_eq!(aggregate(&[A, R, A]), Some(ReportStatus::Rejected));
        assert_eq!(aggregate(&[A, A, A]), Some(ReportStatus::Approved));
        assert_eq!(aggregate(&[R]), Some(ReportStatus::Rejected));
    }

    #[test]
    fn test_aggregate_exhaustive_over_three_approvers() {
        let all = [P, A, R];
        for a in all {
            for b in all {
                for c in all {
                    let decisions = [a, b, c];
                    let status = aggregate(&decisions).unwrap();
                    let settled = !decisions.contains(&P);
                    let any_rejected = decisions.contains(&R);
                    assert_eq!(status == ReportStatus::Approved, settled && !any_rejected);
                    assert_eq!(status == ReportStatus::Rejected, settled && any_rejected);
                }
            }
        }
    }

    #[test]
    fn test_new_reports_start_as_draft_or_submitted() {
        assert_eq!(initial_status(None).unwrap(), ReportStatus::Draft);
        assert_eq!(initial_status(Some(ReportStatus::Submitted)).unwrap(), ReportStatus::Submitted);
        assert!(initial_status(Some(ReportStatus::Approved)).is_err());
    }

    async fn daily_with_approvers(pool: &PgPool, owner: i32, approvers: Vec<i32>) -> i32 {
        create_daily_report(
            pool,
            owner,
            CreateDailyReport {
                date: date!(2024 - 03 - 15),
                content: "did things".to_string(),
                hours: Some(8.0),
                status: None,
                approver_ids: approvers,
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_aggregation_scenario() {
        let pool = setup_test_db().await;
        let owner = create_user(&pool, &unique("owner")).await;
        let x = create_user(&pool, &unique("x")).await;
        let y = create_user(&pool, &unique("y")).await;
        let z = create_user(&pool, &unique("z")).await;
        let report = daily_with_approvers(&pool, owner, vec![x, y, z]).await;

        let err = decide(&pool, ReportKind::Daily, report, approver(x), "approved", "").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let state = submit(&pool, ReportKind::Daily, report, owner).await.unwrap();
        assert_eq!(state.status, ReportStatus::Submitted);
        assert_eq!(state.decisions.len(), 3);

        let state = decide(&pool, ReportKind::Daily, report, approver(x), "approved", "ok").await.unwrap();
        assert_eq!(state.status, ReportStatus::Submitted);
        let state = decide(&pool, ReportKind::Daily, report, approver(y), "rejected", "redo").await.unwrap();
        assert_eq!(state.status, ReportStatus::Submitted);
        let state = decide(&pool, ReportKind::Daily, report, approver(z), "approved", "").await.unwrap();
        assert_eq!(state.status, ReportStatus::Rejected);

        let err = decide(&pool, ReportKind::Daily, report, approver(owner), "approved", "").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let err = decide(&pool, ReportKind::Daily, report, approver(x), "pending", "").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        // Resubmission resets every decision
        let state = submit(&pool, ReportKind::Daily, report, owner).await.unwrap();
        assert_eq!(state.status, ReportStatus::Submitted);
        assert!(state.decisions.iter().all(|d| d.status == "pending"));
    }

    #[tokio::test]
    async fn test_replace_approvers_keeps_existing_decisions() {
        let pool = setup_test_db().await;
        let owner = create_user(&pool, &unique("owner")).await;
        let x = create_user(&pool, &unique("x")).await;
        let y = create_user(&pool, &unique("y")).await;
        let z = create_user(&pool, &unique("z")).await;
        let report = daily_with_approvers(&pool, owner, vec![x, y]).await;
        submit(&pool, ReportKind::Daily, report, owner).await.unwrap();
        decide(&pool, ReportKind::Daily, report, approver(x), "approved", "looks good").await.unwrap();

        let state = replace_approvers(&pool, ReportKind::Daily, report, approver(owner), &[x, y])
            .await
            .unwrap();
        let kept = state.decisions.iter().find(|d| d.approver_id == x).unwrap();
        assert_eq!(kept.status, "approved");
        assert_eq!(kept.comment, "looks good");

        // Dropping the only pending approver settles the report
        let state = replace_approvers(&pool, ReportKind::Daily, report, approver(owner), &[x])
            .await
            .unwrap();
        assert_eq!(state.approver_ids, vec![x]);
        assert_eq!(state.status, ReportStatus::Approved);

        let state = replace_approvers(&pool, ReportKind::Daily, report, approver(owner), &[x, z])
            .await
            .unwrap();
        assert_eq!(state.status, ReportStatus::Submitted);

        let err = replace_approvers(&pool, ReportKind::Daily, report, approver(z), &[z]).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let err = replace_approvers(&pool, ReportKind::Daily, report, approver(owner), &[i32::MAX])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_one_daily_report_per_day() {
        let pool = setup_test_db().await;
        let owner = create_user(&pool, &unique("owner")).await;
        daily_with_approvers(&pool, owner, vec![]).await;

        let err = create_daily_report(
            &pool,
            owner,
            CreateDailyReport {
                date: date!(2024 - 03 - 15),
                content: String::new(),
                hours: None,
                status: None,
                approver_ids: vec![],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_empty_content_is_auto_summarized() {
        let pool = setup_test_db().await;
        let owner = create_user(&pool, &unique("owner")).await;

        let report = create_weekly_report(
            &pool,
            owner,
            CreateWeeklyReport {
                week_start: date!(2024 - 03 - 11),
                week_end: date!(2024 - 03 - 17),
                summary: String::new(),
                next_week_plan: "more".to_string(),
                status: None,
                approver_ids: vec![],
            },
        )
        .await
        .unwrap();
        assert_eq!(report.summary, crate::ledger::summary::NO_RECORDS);
        assert_eq!(report.status, "draft");
    }
}
