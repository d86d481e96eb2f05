//! Database bootstrap
//!
//! Pool creation, schema initialization, and the single supported
//! migration (adding `impact_degree` to pre-existing stores).

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Create the SQLite pool, creating the file and parent directory on
/// first start, then initialize the schema.
pub async fn create_pool(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Io(e))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;

    Ok(pool)
}

/// Create tables and indexes. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS news_items (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT,
            source TEXT,
            publish_time TEXT,
            url TEXT,
            category TEXT,
            keywords TEXT,
            importance_score INTEGER NOT NULL DEFAULT 0,
            importance_reasoning TEXT,
            importance_factors TEXT,
            impact_degree TEXT,
            created_at TEXT,
            updated_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            news_id TEXT NOT NULL,
            impact_score REAL NOT NULL DEFAULT 0,
            summary TEXT,
            analysis_time TEXT,
            FOREIGN KEY (news_id) REFERENCES news_items (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_news_publish_time ON news_items(publish_time)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_news_source ON news_items(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_news_category ON news_items(category)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_news_id ON analysis_results(news_id)",
    )
    .execute(pool)
    .await?;

    migrate_impact_degree(pool).await?;

    tracing::info!("Database schema initialized");
    Ok(())
}

/// Probe for the `impact_degree` column and add it when opening a store
/// created before the column existed. This is the only supported
/// migration; any other schema drift is a fatal error surfaced by the
/// queries that hit it.
async fn migrate_impact_degree(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let columns = sqlx::query("PRAGMA table_info(news_items)")
        .fetch_all(pool)
        .await?;

    let has_impact_degree = columns
        .iter()
        .any(|row| row.get::<String, _>("name") == "impact_degree");

    if !has_impact_degree {
        tracing::info!("Migrating news_items: adding impact_degree column");
        sqlx::query("ALTER TABLE news_items ADD COLUMN impact_degree TEXT")
            .execute(pool)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn impact_degree_is_added_to_legacy_schema() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        // Legacy table without impact_degree
        sqlx::query(
            r#"
            CREATE TABLE news_items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT,
                source TEXT,
                publish_time TEXT,
                url TEXT,
                category TEXT,
                keywords TEXT,
                importance_score INTEGER NOT NULL DEFAULT 0,
                importance_reasoning TEXT,
                importance_factors TEXT,
                created_at TEXT,
                updated_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        init_schema(&pool).await.unwrap();

        let columns = sqlx::query("PRAGMA table_info(news_items)")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(
            columns
                .iter()
                .any(|row| row.get::<String, _>("name") == "impact_degree")
        );
    }
}
