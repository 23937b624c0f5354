use crate::error::Result;
use crate::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStats {
    pub compressions: u64,
    /// Source bytes of all finished encodes.
    pub bytes: u64,
}

/// Per-user compression counters.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Counts one finished encode of `bytes` source bytes.
    async fn increment(&self, user_id: UserId, bytes: u64) -> Result<()>;

    async fn totals(&self, user_id: UserId) -> Result<UserStats>;
}

/// Counters kept for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStats {
    users: DashMap<UserId, UserStats>,
}

#[async_trait]
impl StatsStore for MemoryStats {
    async fn increment(&self, user_id: UserId, bytes: u64) -> Result<()> {
        let mut stats = self.users.entry(user_id).or_default();
        stats.compressions += 1;
        stats.bytes = stats.bytes.saturating_add(bytes);
        Ok(())
    }

    async fn totals(&self, user_id: UserId) -> Result<UserStats> {
        Ok(self.users.get(&user_id).map(|s| *s).unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl StatsStore for DbHandle {
    #[instrument(name = "db.increment", skip(self))]
    async fn increment(&self, user_id: UserId, bytes: u64) -> Result<()> {
        debug!("Recording compression");
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO vidq_user_stats (user_id, total_compressions, total_bytes, updated_at) \
            VALUES ($1, 1, $2, now()) \
            ON CONFLICT (user_id) DO UPDATE \
                SET total_compressions = vidq_user_stats.total_compressions + 1, \
                total_bytes = vidq_user_stats.total_bytes + EXCLUDED.total_bytes, \
                updated_at = now()",
        )
        .bind(user_id)
        .bind(bytes)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.totals", skip(self))]
    async fn totals(&self, user_id: UserId) -> Result<UserStats> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT total_compressions, total_bytes \
            FROM vidq_user_stats \
            WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await?;

        let (compressions, bytes) = row.unwrap_or_default();
        Ok(UserStats {
            compressions: u64::try_from(compressions).unwrap_or_default(),
            bytes: u64::try_from(bytes).unwrap_or_default(),
        })
    }
}
