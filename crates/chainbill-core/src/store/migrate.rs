//! Database migration runner
//!
//! Runs embedded SQL migrations on startup and tracks the applied set in a
//! `_migrations` table.

use sqlx::{PgPool, Row};
use tracing::{error, info};

use crate::store::{StorageError, StoreResult};

/// Database migration manager
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn applied_versions(&self) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("version")).collect())
    }

    async fn record_migration(&self, version: i64, name: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(version)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Run all pending migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        self.init_migration_table().await?;

        let applied = self.applied_versions().await?;
        info!("Found {} applied migrations", applied.len());

        let migrations: &[(i64, &str, &str)] = &[(
            1,
            "initial_schema",
            include_str!("../../migrations/001_initial_schema.sql"),
        )];

        for (version, name, sql) in migrations {
            if applied.contains(version) {
                continue;
            }

            info!("Applying migration {} ({})...", version, name);

            // Executed as a single batch; splitting on semicolons breaks
            // dollar-quoted bodies.
            sqlx::raw_sql(sql).execute(&self.pool).await.map_err(|e| {
                error!("Failed to execute migration {}: {}", version, e);
                StorageError::from(e)
            })?;

            self.record_migration(*version, name).await?;
            info!("Migration {} ({}) applied", version, name);
        }

        Ok(())
    }
}
