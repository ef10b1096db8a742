//! Database initialization
//!
//! One SQLite database holds every offset-series version and the
//! discrimination records for all channels. Tables are append-only by
//! convention: no code path issues UPDATE or DELETE against measurement or
//! record rows. The only mutable column is `series_versions.sealed`.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the pipeline database and ensure the schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers with one writer
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests and dry runs
///
/// Limited to one connection: every SQLite `:memory:` connection is a
/// separate database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_series_versions_table(pool).await?;
    create_offset_measurements_table(pool).await?;
    create_discrimination_records_table(pool).await?;
    Ok(())
}

async fn create_series_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series_versions (
            channel TEXT NOT NULL,
            version TEXT NOT NULL,
            owner TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            sealed INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (channel, version)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_offset_measurements_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS offset_measurements (
            channel TEXT NOT NULL,
            version TEXT NOT NULL,
            system_time REAL NOT NULL,
            utc_time REAL NOT NULL,
            clock_offset_ms REAL NOT NULL,
            station TEXT,
            propagation_mode TEXT,
            confidence TEXT NOT NULL,
            uncertainty_ms REAL,
            quality_grade TEXT NOT NULL,
            snr_db REAL,
            verified INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (channel, version, utc_time),
            FOREIGN KEY (channel, version) REFERENCES series_versions(channel, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_offset_measurements_system_time
         ON offset_measurements(channel, version, system_time)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_discrimination_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discrimination_records (
            channel TEXT NOT NULL,
            version TEXT NOT NULL,
            minute_utc INTEGER NOT NULL,
            dominant_station TEXT NOT NULL,
            confidence TEXT NOT NULL,
            margin_db REAL NOT NULL,
            evidence TEXT NOT NULL,
            PRIMARY KEY (channel, version, minute_utc)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
