//! Catalog persistence (SQLite via SeaORM).
//!
//! Holds artifact metadata and target bindings. Firmware bytes themselves
//! live in the storage backend.

pub mod entities;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::path::Path;

/// Open (creating if needed) the catalog database and its tables
pub async fn init_database(db_path: &Path) -> Result<DatabaseConnection, DbErr> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DbErr::Custom(format!("failed to create {:?}: {}", parent, e)))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::info!("Connecting to catalog: {}", db_url);

    let db = Database::connect(&db_url).await?;
    create_tables(&db).await?;

    Ok(db)
}

/// Create all tables if they don't exist
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();

    // WAL keeps status polls from blocking behind an in-progress rebind
    db.execute(Statement::from_string(
        backend,
        "PRAGMA journal_mode=WAL".to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            size INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            uploaded_at INTEGER NOT NULL,
            uploaded_by TEXT
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"
        CREATE TABLE IF NOT EXISTS target_bindings (
            scope TEXT PRIMARY KEY,
            artifact_id TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            bound_by TEXT,
            FOREIGN KEY (artifact_id) REFERENCES artifacts(id)
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        backend,
        r#"CREATE INDEX IF NOT EXISTS idx_target_bindings_artifact ON target_bindings(artifact_id)"#
            .to_string(),
    ))
    .await?;

    tracing::info!("Catalog tables initialized");
    Ok(())
}
