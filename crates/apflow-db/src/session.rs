//! Bounded pool of database sessions, one per concurrent tree execution.
//!
//! Acquisition that would exceed the limit fails fast with
//! [`SessionPoolError::LimitExceeded`] instead of blocking: a blocked caller
//! holding work that running sessions wait on would deadlock. Sessions idle
//! past the timeout are reaped opportunistically on the next acquire.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the session pool.
#[derive(Debug, Error)]
pub enum SessionPoolError {
    #[error("session limit exceeded: {active} active sessions (max {max}); retry later")]
    LimitExceeded { active: usize, max: usize },
}

/// Limits for a [`SessionPool`].
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Maximum number of concurrently held sessions.
    pub max_sessions: usize,
    /// Sessions idle longer than this are evicted on the next acquire.
    pub idle_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    acquired_at: Instant,
}

#[derive(Debug)]
struct PoolInner {
    pool: SqlitePool,
    config: SessionPoolConfig,
    active: Mutex<HashMap<String, SessionEntry>>,
}

/// Pool of database sessions backed by a shared [`SqlitePool`].
///
/// Cheap to clone; all clones share the same slot accounting.
#[derive(Debug, Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(pool: SqlitePool, config: SessionPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                pool,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_defaults(pool: SqlitePool) -> Self {
        Self::new(pool, SessionPoolConfig::default())
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.config.max_sessions
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .expect("session pool lock poisoned")
            .len()
    }

    /// The shared connection pool backing every session.
    pub fn database(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Acquire a session, reaping expired sessions first. Fails fast when
    /// the limit is reached.
    pub fn acquire(&self) -> Result<Session, SessionPoolError> {
        let id = Uuid::new_v4().to_string();
        {
            let mut active = self
                .inner
                .active
                .lock()
                .expect("session pool lock poisoned");

            let now = Instant::now();
            let expired: Vec<String> = active
                .iter()
                .filter(|(_, e)| now.duration_since(e.acquired_at) > self.inner.config.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for stale in expired {
                active.remove(&stale);
                tracing::warn!(session_id = %stale, "evicted expired session");
            }

            if active.len() >= self.inner.config.max_sessions {
                return Err(SessionPoolError::LimitExceeded {
                    active: active.len(),
                    max: self.inner.config.max_sessions,
                });
            }
            active.insert(id.clone(), SessionEntry { acquired_at: now });
        }

        tracing::debug!(session_id = %id, "acquired session");
        Ok(Session {
            id,
            db: self.inner.pool.clone(),
            owner: Arc::clone(&self.inner),
        })
    }

    /// Run `f` with a session; the session is released on every exit path.
    pub async fn with_session<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let session = self.acquire()?;
        f(session).await
    }
}

impl PoolInner {
    fn release(&self, id: &str) {
        let mut active = self.active.lock().expect("session pool lock poisoned");
        if active.remove(id).is_some() {
            tracing::debug!(session_id = %id, "released session");
        }
    }
}

/// A held session. Dropping it releases its pool slot, including on panic.
#[derive(Debug)]
pub struct Session {
    id: String,
    db: SqlitePool,
    owner: Arc<PoolInner>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.owner.release(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Process-wide pool
// ---------------------------------------------------------------------------

static GLOBAL: RwLock<Option<SessionPool>> = RwLock::new(None);

/// Install the process-wide session pool, replacing any previous one.
pub fn set_global_pool(pool: SessionPool) {
    *GLOBAL.write().expect("global session pool lock poisoned") = Some(pool);
}

/// The process-wide session pool, if one has been installed.
pub fn global_pool() -> Option<SessionPool> {
    GLOBAL
        .read()
        .expect("global session pool lock poisoned")
        .clone()
}

/// Remove the process-wide session pool (test setup).
pub fn reset_global_pool() {
    *GLOBAL.write().expect("global session pool lock poisoned") = None;
}
