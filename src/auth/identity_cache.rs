//! Email -> user name cache in front of the remote directory
//!
//! The whole mapping is one immutable snapshot. A stale read takes the
//! refresh lock, checks again (someone else may have refreshed meanwhile) and
//! only then fetches the member list and swaps in a new snapshot, so at most
//! one fetch is in flight. Readers of a fresh snapshot never touch the lock.
//!
//! A failed refresh leaves the old snapshot and its timestamp in place; the
//! next lookup tries again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::info;

use super::directory::{Directory, DirectoryError};

/// Default freshness window
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Snapshot {
    /// lowercased email -> canonical user name
    by_email: HashMap<String, String>,
    /// `None` until the first successful refresh
    refreshed_at: Option<Instant>,
}

impl Snapshot {
    fn is_fresh(&self, max_age: Duration) -> bool {
        self.refreshed_at
            .is_some_and(|at| at.elapsed() < max_age)
    }
}

pub struct IdentityCache {
    directory: Arc<dyn Directory>,
    max_age: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_lock: Mutex<()>,
}

impl IdentityCache {
    pub fn new(directory: Arc<dyn Directory>, max_age: Duration) -> Self {
        Self {
            directory,
            max_age,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_lock: Mutex::new(()),
        }
    }

    /// User name for an email address (case-insensitive)
    ///
    /// Refreshes the mapping first if it is older than the freshness window.
    pub async fn get(&self, email: &str) -> Result<Option<String>, DirectoryError> {
        let mut snapshot = self.current().await;
        if !snapshot.is_fresh(self.max_age) {
            snapshot = self.refresh().await?;
        }
        Ok(snapshot.by_email.get(&email.to_lowercase()).cloned())
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.current().await.by_email.len()
    }

    #[cfg(test)]
    async fn last_refresh(&self) -> Option<Instant> {
        self.current().await.refreshed_at
    }

    async fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    async fn refresh(&self) -> Result<Arc<Snapshot>, DirectoryError> {
        let _guard = self.refresh_lock.lock().await;

        // check again, another caller might have refreshed while we waited
        let current = self.current().await;
        if current.is_fresh(self.max_age) {
            return Ok(current);
        }

        info!("Updating user list");
        let users = self.directory.list_users().await?;

        let by_email = users
            .into_iter()
            .filter(|user| !user.email.is_empty())
            .map(|user| (user.email.to_lowercase(), user.login))
            .collect();
        let fresh = Arc::new(Snapshot {
            by_email,
            refreshed_at: Some(Instant::now()),
        });

        *self.snapshot.write().await = Arc::clone(&fresh);
        info!(users = fresh.by_email.len(), "User list updated");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::directory::{DirectoryUser, LoginCheck};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed list, counts fetches and can fail the first ones
    struct CountingDirectory {
        users: std::sync::Mutex<Vec<DirectoryUser>>,
        fetches: AtomicUsize,
        failures_left: AtomicUsize,
        latency: Duration,
    }

    impl CountingDirectory {
        fn new(users: &[(&str, &str)]) -> Self {
            Self {
                users: std::sync::Mutex::new(to_users(users)),
                fetches: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                latency: Duration::from_millis(50),
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn replace_users(&self, users: &[(&str, &str)]) {
            *self.users.lock().unwrap() = to_users(users);
        }
    }

    fn to_users(users: &[(&str, &str)]) -> Vec<DirectoryUser> {
        users
            .iter()
            .map(|(login, email)| DirectoryUser {
                login: login.to_string(),
                email: email.to_string(),
            })
            .collect()
    }

    #[async_trait]
    impl Directory for CountingDirectory {
        async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DirectoryError::Status(502));
            }
            Ok(self.users.lock().unwrap().clone())
        }

        async fn login_check(&self, _: &str, _: &str) -> Result<LoginCheck, DirectoryError> {
            unreachable!("the cache never checks passwords")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_is_case_insensitive() {
        let directory = Arc::new(CountingDirectory::new(&[("Alice", "Alice@Example.org")]));
        let cache = IdentityCache::new(directory.clone(), DEFAULT_MAX_AGE);

        assert_eq!(cache.get("alice@example.org").await.unwrap().as_deref(), Some("Alice"));
        assert_eq!(cache.get("ALICE@EXAMPLE.ORG").await.unwrap().as_deref(), Some("Alice"));
        assert_eq!(cache.get("mallory@example.org").await.unwrap(), None);
        assert_eq!(directory.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_makes_no_remote_call() {
        let directory = Arc::new(CountingDirectory::new(&[("alice", "alice@example.org")]));
        let cache = IdentityCache::new(directory.clone(), DEFAULT_MAX_AGE);

        cache.get("alice@example.org").await.unwrap();
        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        cache.get("alice@example.org").await.unwrap();
        cache.get("nobody@example.org").await.unwrap();

        assert_eq!(directory.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_is_rebuilt_from_scratch() {
        let directory = Arc::new(CountingDirectory::new(&[("alice", "alice@example.org")]));
        let cache = IdentityCache::new(directory.clone(), DEFAULT_MAX_AGE);

        assert!(cache.get("alice@example.org").await.unwrap().is_some());

        directory.replace_users(&[("bob", "bob@example.org")]);
        tokio::time::advance(DEFAULT_MAX_AGE + Duration::from_secs(1)).await;

        assert_eq!(cache.get("bob@example.org").await.unwrap().as_deref(), Some("bob"));
        assert_eq!(cache.get("alice@example.org").await.unwrap(), None);
        assert_eq!(directory.fetches(), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stale_readers_fetch_once() {
        let directory = Arc::new(CountingDirectory::new(&[
            ("alice", "alice@example.org"),
            ("bob", "bob@example.org"),
        ]));
        let cache = Arc::new(IdentityCache::new(directory.clone(), DEFAULT_MAX_AGE));

        let lookups = (0..16).map(|i| {
            let cache = Arc::clone(&cache);
            let email = if i % 2 == 0 { "alice@example.org" } else { "bob@example.org" };
            tokio::spawn(async move { cache.get(email).await })
        });
        let results = futures_util::future::join_all(lookups).await;

        for (i, result) in results.into_iter().enumerate() {
            let name = result.unwrap().unwrap();
            let expected = if i % 2 == 0 { "alice" } else { "bob" };
            assert_eq!(name.as_deref(), Some(expected));
        }
        assert_eq!(directory.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_is_retried() {
        let directory = Arc::new(CountingDirectory::new(&[("alice", "alice@example.org")]));
        directory.failures_left.store(1, Ordering::SeqCst);
        let cache = IdentityCache::new(directory.clone(), DEFAULT_MAX_AGE);

        assert!(matches!(
            cache.get("alice@example.org").await,
            Err(DirectoryError::Status(502))
        ));
        assert!(cache.last_refresh().await.is_none());

        assert_eq!(
            cache.get("alice@example.org").await.unwrap().as_deref(),
            Some("alice")
        );
        assert_eq!(directory.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let directory = Arc::new(CountingDirectory::new(&[("alice", "alice@example.org")]));
        let cache = IdentityCache::new(directory.clone(), DEFAULT_MAX_AGE);
        cache.get("alice@example.org").await.unwrap();
        let first_refresh = cache.last_refresh().await;

        tokio::time::advance(DEFAULT_MAX_AGE).await;
        directory.failures_left.store(1, Ordering::SeqCst);

        assert!(cache.get("alice@example.org").await.is_err());
        assert_eq!(cache.last_refresh().await, first_refresh);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_without_email_are_skipped() {
        let directory = Arc::new(CountingDirectory::new(&[("alice", ""), ("bob", "bob@example.org")]));
        let cache = IdentityCache::new(directory, DEFAULT_MAX_AGE);

        assert!(cache.get("bob@example.org").await.unwrap().is_some());
        assert_eq!(cache.len().await, 1);
    }
}
