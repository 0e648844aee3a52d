use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::config::Config;

pub type Db = Pool<Postgres>;

pub async fn connect(config: &Config) -> Result<Db> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}
