//! Durable session store with a write-through-invalidate cache.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use tracing::warn;

use super::models::{Session, SessionStatus};

/// Cached session rows live this long unless a write invalidates them first.
const SESSION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str =
    "id, project_id, user_id, container_id, node_ip, session_status, strategy, created_at";

fn session_cache_key(id: &str) -> String {
    format!("session:cache:{id}")
}

/// Authoritative record of sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>>;

    async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()>;

    async fn update_container_info(
        &self,
        id: &str,
        container_id: &str,
        node_ip: &str,
    ) -> Result<()>;

    async fn list_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>>;

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<Session>>;
}

/// Postgres-backed store with a redis read-through cache. Every write
/// invalidates the cache entry unconditionally; reads tolerate a brief stale
/// window.
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
    cache: Option<ConnectionManager>,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool, cache: Option<ConnectionManager>) -> Self {
        Self { pool, cache }
    }

    /// Create the sessions table if it does not exist yet.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                container_id TEXT,
                node_ip TEXT,
                session_status TEXT NOT NULL,
                strategy TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .context("creating sessions table")?;
        Ok(())
    }

    async fn cache_get(&self, id: &str) -> Option<Session> {
        let cache = self.cache.as_ref()?;
        let mut conn = cache.clone();
        let cached: Option<String> = conn.get(session_cache_key(id)).await.ok()?;
        serde_json::from_str(&cached?).ok()
    }

    async fn cache_put(&self, session: &Session) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let Ok(data) = serde_json::to_string(session) else {
            return;
        };
        let mut conn = cache.clone();
        let outcome: Result<(), redis::RedisError> = conn
            .set_ex(
                session_cache_key(&session.id),
                data,
                SESSION_CACHE_TTL.as_secs(),
            )
            .await;
        if let Err(err) = outcome {
            warn!(%err, "failed to cache session");
        }
    }

    async fn cache_invalidate(&self, id: &str) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let mut conn = cache.clone();
        let outcome: Result<i64, redis::RedisError> = conn.del(session_cache_key(id)).await;
        if let Err(err) = outcome {
            warn!(%err, "failed to invalidate session cache");
        }
    }
}

#[async_trait]
impl SessionStore for PgSessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, project_id, user_id, container_id, node_ip,
                                  session_status, strategy, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.user_id)
        .bind(&session.container_id)
        .bind(&session.node_ip)
        .bind(session.status.to_string())
        .bind(session.strategy.to_string())
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.cache_get(id).await {
            return Ok(Some(session));
        }

        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        if let Some(session) = &session {
            self.cache_put(session).await;
        }
        Ok(session)
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET session_status = $1 WHERE id = $2")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        self.cache_invalidate(id).await;
        Ok(())
    }

    async fn update_container_info(
        &self,
        id: &str,
        container_id: &str,
        node_ip: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET container_id = $1, node_ip = $2 WHERE id = $3")
            .bind(container_id)
            .bind(node_ip)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session container info")?;

        self.cache_invalidate(id).await;
        Ok(())
    }

    async fn list_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE session_status = ANY($1) ORDER BY created_at DESC"
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by status")?;
        Ok(sessions)
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE project_id = $1 ORDER BY created_at DESC LIMIT 50"
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by project")?;
        Ok(sessions)
    }
}
