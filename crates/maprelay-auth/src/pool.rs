//! Session pool for in-flight sign-ins
//!
//! Maps an external session key (one per browser session) to a
//! [`SessionRecord`] owning a [`ProxySession`]. Each record has a bounded
//! lifetime:
//! 1. `create_session()` allocates a record with a fresh UUID
//! 2. The browser drives the sign-in through `get_by_id()`
//! 3. The record is removed on completion, on `remove_by_key()`, or once it
//!    expires (lazily on lookup, or by `sweep_expired()`)
//!
//! Removed records have their HTTP client closed after the pool lock is
//! released.

use chrono::{DateTime, Duration, Utc};
use maprelay_core::Marketplace;
use maprelay_proxy::{ProxyError, ProxyOptions, ProxySession};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Default sign-in lifetime in seconds
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 300;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("A login session already exists for {0}")]
    SessionAlreadyExists(String),
    #[error("Login session not found or expired: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Whether the session was simply absent or expired
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::SessionNotFound(_))
    }
}

/// Derived status of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Complete,
    Expired,
}

/// A sign-in owned by the pool
pub struct SessionRecord {
    external_key: String,
    id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    logged_in: Arc<AtomicBool>,
    session: Mutex<ProxySession>,
}

impl SessionRecord {
    fn new(external_key: String, session: ProxySession, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            external_key,
            id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + ttl,
            logged_in: session.login_flag(),
            session: Mutex::new(session),
        }
    }

    pub fn external_key(&self) -> &str {
        &self.external_key
    }

    /// Id used as the proxy path component
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Seconds until expiry, never negative
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// The owned proxy session; lock it to drive the sign-in
    pub fn session(&self) -> &Mutex<ProxySession> {
        &self.session
    }

    /// Derived status; does not wait for an in-flight forward
    pub fn status(&self) -> SessionStatus {
        if self.is_logged_in() {
            SessionStatus::Complete
        } else if self.is_expired() {
            SessionStatus::Expired
        } else {
            SessionStatus::InProgress
        }
    }

    /// Fetch the first sign-in page, serving it under `proxy_base`
    pub async fn start(&self, proxy_base: Url) -> PoolResult<()> {
        self.session.lock().await.start(proxy_base).await?;
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.session.lock().await.close();
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct PoolInner {
    by_key: HashMap<String, Arc<SessionRecord>>,
    by_id: HashMap<Uuid, String>,
}

impl PoolInner {
    fn evict(&mut self, key: &str) -> Option<Arc<SessionRecord>> {
        let record = self.by_key.remove(key)?;
        self.by_id.remove(&record.id);
        Some(record)
    }

    fn evict_if_expired(&mut self, key: &str) -> Option<Arc<SessionRecord>> {
        let expired = self.by_key.get(key).is_some_and(|r| r.is_expired());
        if expired {
            self.evict(key)
        } else {
            None
        }
    }
}

/// Concurrent registry of sign-in sessions
pub struct SessionPool {
    inner: RwLock<PoolInner>,
    options: ProxyOptions,
}

impl SessionPool {
    /// Create an empty pool whose sessions use `options`
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            options,
        }
    }

    /// Create a sign-in for `external_key`
    ///
    /// Fails if a live record already exists for the key. An expired one is
    /// evicted first.
    pub async fn create_session(
        &self,
        external_key: &str,
        country_code: &str,
        with_username: bool,
        ttl: Duration,
    ) -> PoolResult<Arc<SessionRecord>> {
        let marketplace = Marketplace::lookup(country_code).map_err(ProxyError::from)?;
        let session = ProxySession::new(marketplace, None, with_username, &self.options)?;
        let record = Arc::new(SessionRecord::new(external_key.to_string(), session, ttl));

        let stale = {
            let mut inner = self.inner.write().await;
            let stale = match inner.by_key.get(external_key).map(|r| r.is_expired()) {
                Some(false) => {
                    return Err(PoolError::SessionAlreadyExists(external_key.to_string()))
                }
                Some(true) => inner.evict(external_key),
                None => None,
            };
            inner.by_id.insert(record.id, external_key.to_string());
            inner.by_key.insert(external_key.to_string(), record.clone());
            stale
        };

        if let Some(stale) = stale {
            stale.close().await;
        }

        info!(
            "Created login session {} for {}",
            record.id, marketplace.country_code
        );
        Ok(record)
    }

    /// Look up the live record for an external key
    pub async fn get_by_key(&self, external_key: &str) -> Option<Arc<SessionRecord>> {
        let record = self.inner.read().await.by_key.get(external_key).cloned()?;
        if record.is_expired() {
            self.evict_expired(external_key).await;
            return None;
        }
        Some(record)
    }

    /// Look up the live record by its id
    pub async fn get_by_id(&self, id: &Uuid) -> Option<Arc<SessionRecord>> {
        let record = {
            let inner = self.inner.read().await;
            let key = inner.by_id.get(id)?;
            inner.by_key.get(key).cloned()?
        };
        if record.is_expired() {
            self.evict_expired(&record.external_key).await;
            return None;
        }
        Some(record)
    }

    /// Id of the live record for an external key
    pub async fn id_for_key(&self, external_key: &str) -> Option<Uuid> {
        self.get_by_key(external_key).await.map(|r| r.id)
    }

    pub async fn contains_key(&self, external_key: &str) -> bool {
        self.get_by_key(external_key).await.is_some()
    }

    /// Number of records, including expired ones not yet swept
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_key.is_empty()
    }

    /// Remove and close the record for an external key
    pub async fn remove_by_key(&self, external_key: &str) -> bool {
        let removed = self.inner.write().await.evict(external_key);
        match removed {
            Some(record) => {
                record.close().await;
                info!("Removed login session {}", record.id);
                true
            }
            None => false,
        }
    }

    /// Remove and close every expired record
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<Arc<SessionRecord>> = {
            let mut inner = self.inner.write().await;
            let keys: Vec<String> = inner
                .by_key
                .iter()
                .filter(|(_, r)| r.is_expired())
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| inner.evict(k)).collect()
        };

        for record in &expired {
            record.close().await;
        }
        if !expired.is_empty() {
            debug!("Swept {} expired login sessions", expired.len());
        }
        expired.len()
    }

    async fn evict_expired(&self, external_key: &str) {
        let evicted = self.inner.write().await.evict_if_expired(external_key);
        if let Some(record) = evicted {
            record.close().await;
            debug!("Evicted expired login session {}", record.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SessionPool {
        SessionPool::new(ProxyOptions::default())
    }

    fn ttl() -> Duration {
        Duration::seconds(DEFAULT_SESSION_TTL_SECONDS)
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let pool = pool();
        let record = pool.create_session("browser-1", "us", false, ttl()).await.unwrap();

        assert_eq!(record.external_key(), "browser-1");
        assert!(record.expires_in() > 0);
        assert_eq!(record.status(), SessionStatus::InProgress);

        let by_key = pool.get_by_key("browser-1").await.unwrap();
        let by_id = pool.get_by_id(&record.id()).await.unwrap();
        assert_eq!(by_key.id(), record.id());
        assert_eq!(by_id.id(), record.id());
        assert_eq!(pool.id_for_key("browser-1").await, Some(record.id()));
        assert!(pool.contains_key("browser-1").await);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let pool = pool();
        pool.create_session("k", "de", false, ttl()).await.unwrap();

        let result = pool.create_session("k", "de", false, ttl()).await;
        assert!(matches!(result, Err(PoolError::SessionAlreadyExists(_))));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_marketplace_and_mode() {
        let pool = pool();

        let result = pool.create_session("k", "xx", false, ttl()).await;
        assert!(matches!(
            result,
            Err(PoolError::Proxy(ProxyError::Core(
                maprelay_core::Error::UnknownMarketplace(_)
            )))
        ));

        let result = pool.create_session("k", "jp", true, ttl()).await;
        assert!(matches!(
            result,
            Err(PoolError::Proxy(ProxyError::Core(
                maprelay_core::Error::UnsupportedLoginMode(_)
            )))
        ));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_closes_session_and_allows_recreate() {
        let pool = pool();
        let record = pool.create_session("k", "uk", true, ttl()).await.unwrap();

        assert!(pool.remove_by_key("k").await);
        assert!(!pool.remove_by_key("k").await);
        assert!(record.session().lock().await.is_closed());
        assert!(pool.get_by_id(&record.id()).await.is_none());

        let again = pool.create_session("k", "uk", true, ttl()).await.unwrap();
        assert_ne!(again.id(), record.id());
    }

    #[tokio::test]
    async fn test_expired_records_vanish() {
        let pool = pool();
        let record = pool
            .create_session("k", "us", false, Duration::zero())
            .await
            .unwrap();

        assert!(record.is_expired());
        assert_eq!(record.status(), SessionStatus::Expired);
        assert!(pool.get_by_id(&record.id()).await.is_none());
        assert!(pool.is_empty().await);
        assert!(record.session().lock().await.is_closed());
    }

    #[tokio::test]
    async fn test_expired_record_replaced_on_create() {
        let pool = pool();
        let old = pool
            .create_session("k", "us", false, Duration::zero())
            .await
            .unwrap();
        let new = pool.create_session("k", "us", false, ttl()).await.unwrap();

        assert_ne!(old.id(), new.id());
        assert!(old.session().lock().await.is_closed());
        assert!(pool.get_by_id(&old.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let pool = pool();
        pool.create_session("a", "us", false, Duration::zero()).await.unwrap();
        pool.create_session("b", "us", false, Duration::zero()).await.unwrap();
        pool.create_session("c", "us", false, ttl()).await.unwrap();

        assert_eq!(pool.sweep_expired().await, 2);
        assert_eq!(pool.len().await, 1);
        assert!(pool.get_by_key("a").await.is_none());
        assert!(pool.get_by_key("b").await.is_none());
        assert!(pool.contains_key("c").await);
        assert_eq!(pool.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn test_status_does_not_wait_for_session_lock() {
        let pool = pool();
        let record = pool.create_session("k", "us", false, ttl()).await.unwrap();

        let _guard = record.session().lock().await;
        assert_eq!(record.status(), SessionStatus::InProgress);
        assert!(!record.is_logged_in());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_single_winner() {
        let pool = Arc::new(pool());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.create_session("k", "us", false, ttl()).await })
            })
            .collect();

        let mut created = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(PoolError::SessionAlreadyExists(_)) => duplicates += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(pool.len().await, 1);
    }
}
