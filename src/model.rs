use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use time::{Date, OffsetDateTime};

use crate::error::AppError;

/// Serde adapter for pure dates on the wire (`YYYY-MM-DD`)
pub mod ymd {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::{Date, format_description::FormatItem, macros::format_description};

    pub const FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let text = date.format(FORMAT).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Date::parse(&raw, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::FORMAT;
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        pub fn serialize<S: Serializer>(date: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error> {
            match date {
                Some(date) => super::serialize(date, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Date>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) if !raw.is_empty() => Date::parse(&raw, FORMAT)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                _ => Ok(None),
            }
        }
    }
}

/// Text-backed enumerations stored as VARCHAR and validated on the way in
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(AppError::InvalidArgument(format!(
                        concat!("invalid ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ProjectStatus {
    Wait => "wait",
    Doing => "doing",
    Suspended => "suspended",
    Closed => "closed",
    Done => "done",
});

text_enum!(TaskStatus {
    Todo => "todo",
    InProgress => "in_progress",
    Done => "done",
    Cancelled => "cancelled",
});

text_enum!(BugStatus {
    Active => "active",
    Resolved => "resolved",
    Closed => "closed",
});

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

text_enum!(
    /// Lifecycle of a daily or weekly report
    ReportStatus {
        Draft => "draft",
        Submitted => "submitted",
        Approved => "approved",
        Rejected => "rejected",
    }
);

text_enum!(
    /// One approver's decision on a report
    DecisionStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
);

text_enum!(
    /// What an approver may submit; `pending` is not a verdict
    Verdict {
        Approved => "approved",
        Rejected => "rejected",
    }
);

impl From<Verdict> for DecisionStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approved => DecisionStatus::Approved,
            Verdict::Rejected => DecisionStatus::Rejected,
        }
    }
}

/// 1-based pagination window shared by list operations
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl PageQuery {
    pub const DEFAULT_SIZE: i64 = 20;
    pub const MAX_SIZE: i64 = 100;
    pub const MAX_PAGE: i64 = 1_000_000;

    pub fn page(&self) -> i64 {
        self.page.filter(|p| *p >= 1).map(|p| p.min(Self::MAX_PAGE)).unwrap_or(1)
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
            .filter(|s| *s >= 1)
            .map(|s| s.min(Self::MAX_SIZE))
            .unwrap_or(Self::DEFAULT_SIZE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.page_size())
    }
}

/// Raw query pairs, so repeated keys can carry multi-valued filters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct QueryPairs(pub Vec<(String, String)>);

impl QueryPairs {
    /// Every non-empty value given for `key`, in order
    pub fn all(&self, key: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.all(key).into_iter().next()
    }

    pub fn parse_all<T>(&self, key: &str) -> Result<Vec<T>, AppError>
    where
        T: FromStr,
    {
        self.all(key)
            .into_iter()
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|_| AppError::InvalidArgument(format!("invalid value '{raw}' for '{key}'")))
            })
            .collect()
    }

    pub fn parse_first<T: FromStr>(&self, key: &str) -> Result<Option<T>, AppError> {
        Ok(self.parse_all(key)?.into_iter().next())
    }

    pub fn page(&self) -> Result<PageQuery, AppError> {
        Ok(PageQuery {
            page: self.parse_first("page")?,
            page_size: self.parse_first("page_size")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub nickname: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: String,
    pub avatar: String,
    #[serde(skip_serializing)]
    pub wechat_open_id: Option<String>,
    pub status: i16,
    pub login_count: i32,
    pub department_id: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip_serializing)]
    pub deleted_at: Option<OffsetDateTime>,
}

impl User {
    pub const STATUS_ENABLED: i16 = 1;

    pub fn is_enabled(&self) -> bool {
        self.status == Self::STATUS_ENABLED
    }
}

/// The user shape carried in session responses and push frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i32,
    pub username: String,
    pub nickname: String,
    pub email: String,
    pub avatar: String,
    pub roles: Vec<String>,
}

impl UserProfile {
    pub fn from_user(user: &User, roles: Vec<String>) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            nickname: user.nickname.clone(),
            email: user.email.clone(),
            avatar: user.avatar.clone(),
            roles,
        }
    }
}

/// Token plus the profile it was minted for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: UserProfile,
}

/// Identity carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: i32,
    pub username: String,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub const ADMIN_ROLE: &'static str = "admin";
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Permission {
    pub id: i32,
    pub code: String,
    pub name: String,
    pub status: i16,
    pub menu_path: String,
    pub menu_icon: String,
    pub menu_title: String,
    pub parent_menu_id: Option<i32>,
    pub menu_order: i32,
    pub is_menu: bool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Project {
    pub id: i32,
    pub name: String,
    pub code: String,
    pub description: String,
    pub status: String,
    #[serde(with = "ymd::option")]
    pub start_date: Option<Date>,
    #[serde(with = "ymd::option")]
    pub end_date: Option<Date>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProjectMember {
    pub id: i32,
    pub project_id: i32,
    pub user_id: i32,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Requirement {
    pub id: i32,
    pub title: String,
    pub status: String,
    pub priority: String,
    pub project_id: i32,
    pub creator_id: i32,
    pub assignee_id: Option<i32>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Task {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub project_id: i32,
    pub requirement_id: Option<i32>,
    pub creator_id: i32,
    pub assignee_id: Option<i32>,
    #[serde(with = "ymd::option")]
    pub start_date: Option<Date>,
    #[serde(with = "ymd::option")]
    pub end_date: Option<Date>,
    pub progress: i32,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Bug {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub severity: String,
    pub project_id: i32,
    pub creator_id: i32,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A (user, project) pair owning ledger entries
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Resource {
    pub id: i32,
    pub user_id: i32,
    pub project_id: i32,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Allocation {
    pub id: i32,
    pub resource_id: i32,
    #[serde(with = "ymd")]
    pub date: Date,
    pub hours: f64,
    pub task_id: Option<i32>,
    pub bug_id: Option<i32>,
    pub requirement_id: Option<i32>,
    pub project_id: Option<i32>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DailyReport {
    pub id: i32,
    pub user_id: i32,
    #[serde(with = "ymd")]
    pub date: Date,
    pub content: String,
    pub hours: f64,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WeeklyReport {
    pub id: i32,
    pub user_id: i32,
    #[serde(with = "ymd")]
    pub week_start: Date,
    #[serde(with = "ymd")]
    pub week_end: Date,
    pub summary: String,
    pub next_week_plan: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApprovalDecision {
    pub id: i32,
    pub report_id: i32,
    pub approver_id: i32,
    pub status: String,
    pub comment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[derive(Debug, Deserialize)]
    struct Window {
        #[serde(with = "ymd")]
        start: Date,
        #[serde(default, with = "ymd::option")]
        end: Option<Date>,
    }

    #[test]
    fn test_ymd_dates_on_the_wire() {
        let w: Window = serde_json::from_str(r#"{"start":"2024-03-15","end":""}"#).unwrap();
        assert_eq!(w.start, date!(2024 - 03 - 15));
        assert_eq!(w.end, None);

        assert!(serde_json::from_str::<Window>(r#"{"start":"2024/03/15"}"#).is_err());
        assert!(serde_json::from_str::<Window>(r#"{"start":"2024-02-30"}"#).is_err());
    }

    #[test]
    fn test_text_enum_round_trips_through_str() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!(TaskStatus::InProgress.as_str(), "in_progress");
        assert_eq!(Severity::Critical.to_string(), "critical");
    }

    #[test]
    fn test_text_enum_rejects_unknown_values() {
        let err = "pending".parse::<Verdict>().unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let err = "urgent".parse::<Severity>().unwrap_err();
        assert!(err.to_string().contains("Severity"));
    }

    #[test]
    fn test_page_query_normalizes_window() {
        let q = PageQuery { page: Some(3), page_size: Some(500) };
        assert_eq!(q.page_size(), PageQuery::MAX_SIZE);
        assert_eq!(q.offset(), 200);

        let q = PageQuery { page: Some(0), page_size: None };
        assert_eq!((q.page(), q.page_size(), q.offset()), (1, 20, 0));
    }

    #[test]
    fn test_huge_page_number_is_clamped() {
        let pairs = QueryPairs(vec![
            ("page".into(), i64::MAX.to_string()),
            ("page_size".into(), "100".into()),
        ]);
        let q = pairs.page().unwrap();
        assert_eq!(q.page(), PageQuery::MAX_PAGE);
        assert_eq!(q.offset(), (PageQuery::MAX_PAGE - 1) * PageQuery::MAX_SIZE);
    }

    #[test]
    fn test_query_pairs_repeated_keys() {
        let pairs = QueryPairs(vec![
            ("status".into(), "todo".into()),
            ("status".into(), "done".into()),
            ("status".into(), "".into()),
            ("page".into(), "2".into()),
        ]);
        assert_eq!(pairs.all("status"), vec!["todo", "done"]);
        let statuses: Vec<TaskStatus> = pairs.parse_all("status").unwrap();
        assert_eq!(statuses, vec![TaskStatus::Todo, TaskStatus::Done]);
        assert_eq!(pairs.page().unwrap().page(), 2);

        let bad = QueryPairs(vec![("project_id".into(), "x".into())]);
        assert!(matches!(bad.parse_first::<i32>("project_id"), Err(AppError::InvalidArgument(_))));
    }
}
