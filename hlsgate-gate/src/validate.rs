//! Validation coordinator: parallel fan-out of the whitelist and
//! session checks, plus request deduplication of in-flight identical
//! validations.
//!
//! Each branch degrades independently — a store failure in one check
//! never fails the other; the failing branch falls back to its
//! conservative default and the outcome is marked `fallback`.

use dashmap::DashMap;
use hlsgate_core::cidr;
use hlsgate_core::config::GatewayConfig;
use hlsgate_store::session::{SessionRecord, SessionStore};
use hlsgate_store::whitelist::WhitelistStore;
use md5::{Digest, Md5};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// The tuple every waiter of one validation receives.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub allowed: bool,
    pub whitelist_uid: Option<String>,
    pub session_id: Option<String>,
    pub session_uid: Option<String>,
    pub new_session: bool,
    pub session_data: Option<SessionRecord>,
    /// A branch could not consult the store and degraded
    pub fallback: bool,
}

/// Coalesce concurrent calls with the same key onto one execution;
/// every waiter receives a clone of the single result.
pub struct Singleflight<T> {
    in_flight: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self { in_flight: DashMap::new() }
    }

    pub async fn run<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let value = cell.get_or_init(make).await.clone();

        // Only drop the entry if it is still ours; a later request may
        // have already replaced it
        self.in_flight.remove_if(key, |_, v| Arc::ptr_eq(v, &cell));

        value
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ValidationCoordinator {
    whitelist: WhitelistStore,
    sessions: SessionStore,
    dedup: Singleflight<ValidationOutcome>,
}

impl ValidationCoordinator {
    pub fn new(whitelist: WhitelistStore, sessions: SessionStore) -> Self {
        Self {
            whitelist,
            sessions,
            dedup: Singleflight::new(),
        }
    }

    fn request_key(client_ip: &str, path: &str, user_agent: &str, uid: Option<&str>) -> String {
        let mut joined = format!("{}|{}|{}", client_ip, path, user_agent);
        if let Some(uid) = uid {
            joined.push('|');
            joined.push_str(uid);
        }
        let mut hasher = Md5::new();
        hasher.update(joined.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Run the admission fan-out for a request.
    pub async fn validate(
        &self,
        config: &GatewayConfig,
        client_ip: &str,
        path: &str,
        user_agent: &str,
        uid: Option<&str>,
    ) -> ValidationOutcome {
        // Fixed-IP whitelist short-circuits everything
        let (fixed, pattern) = cidr::match_patterns(client_ip, &config.whitelist.fixed_ip_whitelist);
        if fixed {
            info!(ip = client_ip, pattern = %pattern, path, "Fixed whitelist admission");
            return ValidationOutcome {
                allowed: true,
                whitelist_uid: Some("fixed_whitelist".to_string()),
                session_uid: Some("fixed_whitelist".to_string()),
                ..Default::default()
            };
        }

        if !config.perf.enable_request_deduplication {
            return self.run_validation(config, client_ip, path, user_agent, uid).await;
        }

        let key = Self::request_key(client_ip, path, user_agent, uid);
        self.dedup
            .run(&key, || self.run_validation(config, client_ip, path, user_agent, uid))
            .await
    }

    async fn run_validation(
        &self,
        config: &GatewayConfig,
        client_ip: &str,
        path: &str,
        user_agent: &str,
        uid: Option<&str>,
    ) -> ValidationOutcome {
        let skip_ip = config.testing.disable_ip_whitelist || config.testing.disable_path_protection;
        let skip_session = config.testing.disable_session_validation;

        let whitelist_branch = async {
            if skip_ip {
                info!("Test mode: IP whitelist check skipped");
                return ((true, Some("test_user".to_string())), false);
            }
            match self.whitelist.check(config, client_ip, path, user_agent).await {
                Ok(result) => (result, false),
                Err(e) => {
                    warn!(error = %e, ip = client_ip, "Whitelist check degraded");
                    ((false, None), true)
                }
            }
        };

        let session_branch = async {
            if skip_session {
                info!("Test mode: session validation skipped");
                let uid = uid.map(str::to_string).or_else(|| Some("test_user".to_string()));
                return ((None, false, uid), false);
            }
            match self
                .sessions
                .get_or_create(config, uid, client_ip, user_agent, path)
                .await
            {
                Ok(result) => (result, false),
                Err(e) => {
                    warn!(error = %e, ip = client_ip, "Session check degraded");
                    ((None, false, None), true)
                }
            }
        };

        let (((allowed, whitelist_uid), wl_fallback), ((session_id, new_session, session_uid), sess_fallback)) =
            if config.perf.enable_parallel_validation {
                tokio::join!(whitelist_branch, session_branch)
            } else {
                (whitelist_branch.await, session_branch.await)
            };

        // Re-validate the session record for the caller
        let session_data = match &session_id {
            Some(sid) => self
                .sessions
                .validate(sid, client_ip, user_agent)
                .await
                .unwrap_or(None),
            None => None,
        };

        debug!(
            allowed,
            whitelist_uid = whitelist_uid.as_deref().unwrap_or("-"),
            session = session_id.as_deref().unwrap_or("-"),
            "Validation fan-out complete"
        );

        ValidationOutcome {
            allowed,
            whitelist_uid,
            session_id,
            session_uid,
            new_session,
            session_data,
            fallback: wl_fallback || sess_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn request_key_is_stable_and_uid_sensitive() {
        let a = ValidationCoordinator::request_key("1.2.3.4", "/p", "ua", Some("u1"));
        let b = ValidationCoordinator::request_key("1.2.3.4", "/p", "ua", Some("u1"));
        let c = ValidationCoordinator::request_key("1.2.3.4", "/p", "ua", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    // ── Singleflight ─────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_identical_validations_execute_once() {
        let flight = Arc::new(Singleflight::<u64>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run("same-key", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        42u64
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        // All waiters observe byte-identical results from one run
        assert!(results.iter().all(|&r| r == 42));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let flight = Singleflight::<u32>::new();
        let a = flight.run("a", || async { 1 }).await;
        let b = flight.run("b", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn entries_are_cleaned_up_after_completion() {
        let flight = Singleflight::<u32>::new();
        flight.run("k", || async { 7 }).await;
        assert_eq!(flight.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn sequential_runs_re_execute() {
        let flight = Singleflight::<u32>::new();
        let first = flight.run("k", || async { 1 }).await;
        let second = flight.run("k", || async { 2 }).await;
        // The coalescing window is the lifetime of the first run only
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
