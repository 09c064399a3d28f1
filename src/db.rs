use std::{path::Path, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS learner_progress (
    user_id TEXT PRIMARY KEY,
    email TEXT,
    name TEXT,
    frontier INTEGER NOT NULL DEFAULT 0,
    final_test_completed INTEGER NOT NULL DEFAULT 0,
    final_test_score INTEGER,
    final_test_total INTEGER,
    payment_completed INTEGER NOT NULL DEFAULT 0,
    payment_method TEXT,
    certificate_unlocked INTEGER NOT NULL DEFAULT 0,
    coupon_code TEXT,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chapter_quiz_score (
    user_id TEXT NOT NULL,
    chapter INTEGER NOT NULL,
    score INTEGER NOT NULL,
    total INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, chapter)
);

CREATE TABLE IF NOT EXISTS answer_key (
    quiz_id TEXT NOT NULL,
    question_id TEXT NOT NULL,
    answer TEXT NOT NULL,
    PRIMARY KEY (quiz_id, question_id)
);

CREATE TABLE IF NOT EXISTS quiz_attempt (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quiz_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    score INTEGER NOT NULL,
    total_attempted INTEGER NOT NULL,
    submitted_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS quiz_attempt_user ON quiz_attempt (user_id, submitted_at);

CREATE TABLE IF NOT EXISTS coupon (
    id TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE COLLATE NOCASE,
    discount_percentage INTEGER NOT NULL CHECK (discount_percentage BETWEEN 0 AND 100),
    max_uses INTEGER NOT NULL DEFAULT 0,
    used_count INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    CHECK (max_uses = 0 OR used_count <= max_uses)
);

CREATE TABLE IF NOT EXISTS coupon_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coupon_id TEXT NOT NULL REFERENCES coupon (id),
    user_id TEXT NOT NULL,
    used_at TEXT NOT NULL,
    discount_percentage INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_order (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    original_amount INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    coupon_id TEXT,
    coupon_code TEXT,
    discount_percentage INTEGER NOT NULL DEFAULT 0,
    full_name TEXT,
    payment_id TEXT,
    created_at TEXT NOT NULL,
    paid_at TEXT
);

CREATE TABLE IF NOT EXISTS certificate (
    certificate_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    issue_date TEXT NOT NULL,
    expiry_date TEXT NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    final_test_score INTEGER,
    final_test_total INTEGER,
    percent INTEGER NOT NULL,
    grade TEXT NOT NULL,
    ciphertext_hex TEXT,
    iv_hex TEXT,
    tag_hex TEXT,
    fallback_issued INTEGER NOT NULL DEFAULT 0,
    revoked_at TEXT
);
"#;

/// Open (creating if missing) the SQLite database and make sure the schema exists.
pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let database = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    init_schema(&database).await?;
    info!("database {} ready", path.display());
    Ok(database)
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub async fn init_schema(database: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(database).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A fresh file-backed database; keep the `TempDir` alive for the test's duration.
    pub(crate) async fn test_database() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let database = open(dir.path().join("test.db")).await.unwrap();
        (dir, database)
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let (_dir, database) = test_database().await;
        init_schema(&database).await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&database)
                .await
                .unwrap();
        for table in ["certificate", "coupon", "coupon_usage", "learner_progress"] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }
}
