use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{AppError, AppResult};

pub const INITIALIZED: &str = "initialized";
pub const WECHAT_APP_ID: &str = "wechat_app_id";
pub const WECHAT_APP_SECRET: &str = "wechat_app_secret";
pub const WECHAT_ACCOUNT_TYPE: &str = "wechat_account_type";
pub const WECHAT_SCOPE: &str = "wechat_scope";

/// Prefix for provider domain-verification files, keyed by file name
const VERIFY_FILE_PREFIX: &str = "wechat_verify_file:";

const VALUE_TYPES: [&str; 4] = ["string", "number", "boolean", "json"];

/// A persisted key/value row with its type tag
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

pub async fn get_config(conn: &mut PgConnection, key: &str) -> AppResult<Option<ConfigEntry>> {
    let entry = sqlx::query_as::<_, ConfigEntry>(
        "SELECT key, value, type, updated_at FROM system_configs WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(conn)
    .await?;

    Ok(entry)
}

/// Values for whichever of `keys` are present
pub async fn get_values(conn: &mut PgConnection, keys: &[&str]) -> AppResult<HashMap<String, String>> {
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT key, value FROM system_configs WHERE key = ANY($1)",
    )
    .bind(keys)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Insert or overwrite `key`, tagging the value with `kind`
pub async fn set_config(conn: &mut PgConnection, key: &str, value: &str, kind: &str) -> AppResult<ConfigEntry> {
    let key = key.trim();
    if key.is_empty() {
        return Err(AppError::InvalidArgument("config key must not be empty".to_string()));
    }
    if !VALUE_TYPES.contains(&kind) {
        return Err(AppError::InvalidArgument(format!("invalid config type '{kind}'")));
    }

    let entry = sqlx::query_as::<_, ConfigEntry>(
        "INSERT INTO system_configs (key, value, type) VALUES ($1, $2, $3)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, type = EXCLUDED.type, updated_at = now()
         RETURNING key, value, type, updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(kind)
    .fetch_one(conn)
    .await?;

    info!("System config '{}' updated", key);
    Ok(entry)
}

pub async fn is_initialized(conn: &mut PgConnection) -> AppResult<bool> {
    let value = get_config(conn, INITIALIZED).await?;
    Ok(value.is_some_and(|entry| entry.value == "true"))
}

/// Flip the initialized flag. Returns false when another caller already did.
pub async fn mark_initialized(conn: &mut PgConnection) -> AppResult<bool> {
    let flipped = sqlx::query_scalar::<_, String>(
        "INSERT INTO system_configs (key, value, type) VALUES ($1, 'true', 'boolean')
         ON CONFLICT (key) DO UPDATE SET value = 'true', updated_at = now()
         WHERE system_configs.value <> 'true'
         RETURNING key",
    )
    .bind(INITIALIZED)
    .fetch_optional(conn)
    .await?;

    Ok(flipped.is_some())
}

/// Verification files are named `MP_verify_<code>.txt`
pub fn verify_file_key(file_name: &str) -> AppResult<String> {
    let valid = file_name.starts_with("MP_verify_")
        && file_name.ends_with(".txt")
        && file_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(AppError::InvalidArgument(format!("invalid verification file name '{file_name}'")));
    }
    Ok(format!("{VERIFY_FILE_PREFIX}{file_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{setup_test_db, unique};

    #[test]
    fn test_verify_file_key() {
        assert_eq!(
            verify_file_key("MP_verify_abc123.txt").unwrap(),
            "wechat_verify_file:MP_verify_abc123.txt"
        );
        for bad in ["verify.txt", "MP_verify_../x.txt", "MP_verify_abc.html"] {
            assert!(verify_file_key(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_set_then_get_overwrites_type() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let key = unique("cfg");

        set_config(&mut conn, &key, "1", "number").await.unwrap();
        let entry = set_config(&mut conn, &key, "on", "string").await.unwrap();
        assert_eq!(entry.kind, "string");

        let loaded = get_config(&mut conn, &key).await.unwrap().unwrap();
        assert_eq!(loaded.value, "on");

        let values = get_values(&mut conn, &[&key, "missing_key"]).await.unwrap();
        assert_eq!(values.len(), 1);

        let err = set_config(&mut conn, &key, "x", "blob").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }
}
