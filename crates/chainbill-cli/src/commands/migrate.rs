//! `chainbill migrate` — apply pending schema migrations.

use anyhow::Context;
use tracing::info;

use chainbill_core::store::{create_pool, Migrator};
use chainbill_core::Config;

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let pool = create_pool(&config.database.url, config.database.pool_size)
        .await
        .context("failed to connect to database")?;

    Migrator::new(pool)
        .migrate()
        .await
        .context("migration failed")?;

    info!("database is up to date");
    Ok(())
}
