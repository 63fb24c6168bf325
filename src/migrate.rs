use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Discovered endpoints; (host, path) is the identity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS apis (
            id TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            last_build_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(host, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sample_requests (
            id TEXT PRIMARY KEY,
            api_id TEXT NOT NULL,
            parameters_json TEXT NOT NULL DEFAULT '[]',
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (api_id) REFERENCES apis(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sample_responses (
            id TEXT PRIMARY KEY,
            api_id TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (api_id) REFERENCES apis(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_structures (
            id TEXT PRIMARY KEY,
            api_id TEXT NOT NULL UNIQUE,
            parameters_json TEXT NOT NULL DEFAULT '[]',
            body_schema_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (api_id) REFERENCES apis(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS response_structures (
            id TEXT PRIMARY KEY,
            api_id TEXT NOT NULL UNIQUE,
            body_schema_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (api_id) REFERENCES apis(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_apis_created_at ON apis(created_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sample_requests_api_created ON sample_requests(api_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sample_responses_api_created ON sample_responses(api_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
