use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::Config;
use crate::error::Result;

pub async fn make_pool(cfg: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .acquire_timeout(cfg.db_acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&cfg.database_url)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Deletes every job row. Operator/test use only.
pub async fn truncate_jobs(pool: &PgPool) -> Result<()> {
    sqlx::query("TRUNCATE jobs").execute(pool).await?;
    Ok(())
}
