use restrack_common::TrackerResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;

use crate::settings::Settings;

pub async fn create_pool(settings: &Settings) -> TrackerResult<Pool<Postgres>> {
    let options = settings.database.connect_options()?;
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;
    Ok(pool)
}
