//! Allow-list of active sessions, one per (user, application).
//!
//! A token is only usable while its fingerprint matches the recorded
//! session, so logout is a delete and a missing entry means revoked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::context::RequestContext;
use crate::error::CoreResult;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session record corrupt: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for SessionError {
    fn from(value: redis::RedisError) -> Self {
        SessionError::Unavailable(value.to_string())
    }
}

/// Key/value backend with per-key expiry. Writes to one key are atomic
/// upserts, so concurrent logins resolve to the last writer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), SessionError>;
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    async fn delete(&self, key: &str) -> Result<(), SessionError>;
}

// ---------------- Redis ----------------

#[derive(Clone)]
pub struct RedisSessionStore {
    manager: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str) -> Result<Self, SessionError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), SessionError> {
        let mut conn = self.manager.clone();
        // EX 0 is rejected by redis
        let seconds = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let mut conn = self.manager.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}

// ---------------- In-memory ----------------

/// Process-local store for tests and single-node development. Expiry uses
/// tokio time so paused-clock tests can advance past a TTL.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().await;
        guard.values().filter(|(_, expires)| *expires > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), SessionError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        // sessions that are never read again would otherwise linger
        guard.retain(|_, (_, expires)| *expires > now);
        guard.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let mut guard = self.inner.lock().await;
        match guard.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}

/// Cache value for one (user, application) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token_id: Uuid,
    pub access_fingerprint: String,
    pub refresh_fingerprint: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn matches_access(&self, fingerprint: &str) -> bool {
        self.access_fingerprint == fingerprint
    }

    /// Either token of the pair; used by the refresh flow.
    pub fn matches_any(&self, fingerprint: &str) -> bool {
        self.access_fingerprint == fingerprint || self.refresh_fingerprint == fingerprint
    }
}

/// Session operations in domain terms, on top of a [`SessionStore`].
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn SessionStore>,
    prefix: String,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            prefix: config.key_prefix.clone(),
        }
    }

    pub fn key(&self, user_id: Uuid, application: &str) -> String {
        format!("{}:{}:{}", self.prefix, user_id, application)
    }

    /// Records the session, replacing any earlier one for the pair.
    pub async fn put(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        application: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> CoreResult<()> {
        let key = self.key(user_id, application);
        let value = serde_json::to_string(record)
            .map_err(|err| SessionError::Corrupt(err.to_string()))?;
        ctx.run("session write", self.store.put(&key, value, ttl))
            .await?
            .inspect_err(|err| warn!(%user_id, application, error = %err, "session write failed"))?;
        debug!(%user_id, application, token_id = %record.token_id, "session recorded");
        Ok(())
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        application: &str,
    ) -> CoreResult<Option<SessionRecord>> {
        let key = self.key(user_id, application);
        let raw = ctx
            .run("session read", self.store.get(&key))
            .await?
            .inspect_err(|err| warn!(%user_id, application, error = %err, "session read failed"))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw).map_err(|err| {
            warn!(%user_id, application, error = %err, "unreadable session record");
            SessionError::Corrupt(err.to_string())
        })?;
        Ok(Some(record))
    }

    /// True unless a live session exists whose access fingerprint matches.
    pub async fn is_revoked(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        application: &str,
        fingerprint: &str,
    ) -> CoreResult<bool> {
        let record = self.get(ctx, user_id, application).await?;
        Ok(!record.is_some_and(|record| record.matches_access(fingerprint)))
    }

    /// Deleting a missing session is not an error.
    pub async fn remove(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        application: &str,
    ) -> CoreResult<()> {
        let key = self.key(user_id, application);
        ctx.run("session delete", self.store.delete(&key))
            .await?
            .inspect_err(|err| warn!(%user_id, application, error = %err, "session delete failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;

    fn record(access: &str) -> SessionRecord {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        SessionRecord {
            token_id: Uuid::new_v4(),
            access_fingerprint: access.into(),
            refresh_fingerprint: format!("{access}-refresh"),
            expires_at: at,
            refresh_expires_at: at,
        }
    }

    fn cache() -> (SessionCache, InMemorySessionStore) {
        let store = InMemorySessionStore::new();
        let cache = SessionCache::new(Arc::new(store.clone()), &SessionConfig::default());
        (cache, store)
    }

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn put(&self, _: &str, _: String, _: Duration) -> Result<(), SessionError> {
            Err(SessionError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, SessionError> {
            Err(SessionError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), SessionError> {
            Err(SessionError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn key_layout() {
        let (cache, _) = cache();
        let user = Uuid::nil();
        assert_eq!(
            cache.key(user, "app1"),
            "session:00000000-0000-0000-0000-000000000000:app1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn writes_drop_expired_entries() {
        let store = InMemorySessionStore::new();
        store.put("stale", "a".into(), Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.put("fresh", "b".into(), Duration::from_secs(5)).await.unwrap();

        let guard = store.inner.lock().await;
        assert_eq!(guard.len(), 1);
        assert!(guard.contains_key("fresh"));
    }

    #[tokio::test]
    async fn missing_entry_is_revoked() {
        let (cache, _) = cache();
        let ctx = RequestContext::new();
        assert!(cache.is_revoked(&ctx, Uuid::new_v4(), "app1", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn matching_fingerprint_is_live_until_removed() {
        let (cache, _) = cache();
        let ctx = RequestContext::new();
        let user = Uuid::new_v4();
        cache
            .put(&ctx, user, "app1", &record("abc"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!cache.is_revoked(&ctx, user, "app1", "abc").await.unwrap());
        assert!(cache.is_revoked(&ctx, user, "app1", "other").await.unwrap());
        assert!(cache.is_revoked(&ctx, user, "app2", "abc").await.unwrap());

        cache.remove(&ctx, user, "app1").await.unwrap();
        assert!(cache.is_revoked(&ctx, user, "app1", "abc").await.unwrap());
        // idempotent
        cache.remove(&ctx, user, "app1").await.unwrap();
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let (cache, _) = cache();
        let ctx = RequestContext::new();
        let user = Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        cache.put(&ctx, user, "app1", &record("first"), ttl).await.unwrap();
        cache.put(&ctx, user, "app1", &record("second"), ttl).await.unwrap();

        assert!(cache.is_revoked(&ctx, user, "app1", "first").await.unwrap());
        assert!(!cache.is_revoked(&ctx, user, "app1", "second").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let (cache, store) = cache();
        let ctx = RequestContext::new();
        let user = Uuid::new_v4();
        cache
            .put(&ctx, user, "app1", &record("abc"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.is_revoked(&ctx, user, "app1", "abc").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn store_outage_denies_with_internal_error() {
        let cache = SessionCache::new(Arc::new(FailingStore), &SessionConfig::default());
        let ctx = RequestContext::new();
        let err = cache
            .is_revoked(&ctx, Uuid::new_v4(), "app1", "abc")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn corrupt_record_is_internal_error() {
        let (cache, store) = cache();
        let ctx = RequestContext::new();
        let user = Uuid::new_v4();
        store
            .put(&cache.key(user, "app1"), "not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let err = cache.get(&ctx, user, "app1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }
}
