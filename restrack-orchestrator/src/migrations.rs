use restrack_common::TrackerResult;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};

pub static MIGRATOR: Migrator = sqlx::migrate!("../sqlx-migrations");

pub async fn run_migrations(pool: &Pool<Postgres>) -> TrackerResult<()> {
    tracing::info!("📦 applying inventory migrations");
    MIGRATOR.run(pool).await?;
    Ok(())
}
