//! Database initialization
//!
//! Creates the database on first run and applies the idempotent schema.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the message database and apply the schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL lets the live-feed readers proceed while the socket handlers write
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Private in-memory database, one connection so every query sees the same data
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Apply all tables and indexes (safe to call repeatedly)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_messages_table(pool).await?;
    create_session_merges_table(pool).await?;
    Ok(())
}

async fn create_messages_table(pool: &SqlitePool) -> Result<()> {
    // owner is a tagged pair so a row can never carry both owners or neither
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            owner_kind TEXT NOT NULL CHECK (owner_kind IN ('anonymous', 'user')),
            owner_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'error')),
            correlation_handle TEXT,
            created_at TEXT NOT NULL,
            CHECK (status != 'pending' OR correlation_handle IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_owner ON messages(owner_kind, owner_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_handle ON messages(correlation_handle)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_session_merges_table(pool: &SqlitePool) -> Result<()> {
    // PRIMARY KEY on anonymous_id makes the merge record write-once
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_merges (
            anonymous_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            merged_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
