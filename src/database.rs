use sqlx::{PgPool, Pool, Postgres};

use crate::config::DatabaseSettings;

pub type DatabasePool = Pool<Postgres>;

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(settings: &DatabaseSettings) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.connection_timeout)
            .connect(&settings.url)
            .await?;

        Ok(Database { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> DatabasePool {
        self.pool.clone()
    }
}

/// Lightweight liveness probe used by the health endpoint
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
