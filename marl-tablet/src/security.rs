//! Row access control: a per-node expiring cache of table permission
//! checks, with coalescing of concurrent checks for the same key.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{FutureExt, Shared};
use futures::Future;
use marl_client::ObjectId;
use marl_errors::{MarlError, MarlResult};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::SecurityManagerConfig;

/// A permission being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Read access.
    Read,
    /// Write access.
    Write,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Read => write!(f, "read"),
            Permission::Write => write!(f, "write"),
        }
    }
}

/// The master-side permission oracle; injected by the host.
#[async_trait::async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Checks one `(table, user, permission)` triple against the
    /// catalog.
    async fn check_permission(
        &self,
        table_id: ObjectId,
        user: &str,
        permission: Permission,
    ) -> MarlResult<()>;
}

type PermissionKey = (ObjectId, String, Permission);
type SharedCheck = Shared<Pin<Box<dyn Future<Output = Result<(), MarlError>> + Send>>>;

enum CacheEntry {
    InFlight(SharedCheck),
    Ready {
        result: Result<(), MarlError>,
        expires_at: Instant,
    },
}

/// The security manager of one node.
pub struct SecurityManager {
    config: SecurityManagerConfig,
    checker: Arc<dyn PermissionChecker>,
    cache: Mutex<HashMap<PermissionKey, CacheEntry>>,
}

impl SecurityManager {
    /// Creates the manager.
    pub fn new(
        config: SecurityManagerConfig,
        checker: Arc<dyn PermissionChecker>,
    ) -> Arc<SecurityManager> {
        Arc::new(SecurityManager {
            config,
            checker,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Validates that `user` holds `permission` on `table_id`, serving
    /// from the cache when possible. Concurrent checks for the same key
    /// coalesce onto one in-flight request. An anonymous caller (`None`)
    /// passes trivially — internal traffic carries no user.
    pub async fn validate_permission(
        &self,
        table_id: ObjectId,
        user: Option<&str>,
        permission: Permission,
    ) -> MarlResult<()> {
        let Some(user) = user else {
            return Ok(());
        };
        let key: PermissionKey = (table_id, user.to_string(), permission);

        let check = {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(CacheEntry::Ready { result, expires_at }) if *expires_at > Instant::now() => {
                    return result.clone();
                }
                Some(CacheEntry::InFlight(shared)) => shared.clone(),
                _ => {
                    debug!(
                        table_id = %table_id,
                        user,
                        %permission,
                        "table permission check started"
                    );
                    let checker = Arc::clone(&self.checker);
                    let owned_user = user.to_string();
                    let future: Pin<Box<dyn Future<Output = Result<(), MarlError>> + Send>> =
                        Box::pin(async move {
                            checker
                                .check_permission(table_id, &owned_user, permission)
                                .await
                        });
                    let shared = future.shared();
                    cache.insert(key.clone(), CacheEntry::InFlight(shared.clone()));
                    shared
                }
            }
        };

        let result = check.await;

        {
            let mut cache = self.cache.lock();
            let ttl = if result.is_ok() {
                self.config.table_permission_cache_ttl
            } else {
                self.config.table_permission_cache_error_ttl
            };
            cache.insert(
                key,
                CacheEntry::Ready {
                    result: result.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }

        debug!(
            table_id = %table_id,
            user,
            %permission,
            ok = result.is_ok(),
            "table permission check complete"
        );
        result
    }

    /// Drops every cached entry; used on remount and in tests.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct CountingChecker {
        calls: AtomicUsize,
        denied_user: &'static str,
    }

    #[async_trait::async_trait]
    impl PermissionChecker for CountingChecker {
        async fn check_permission(
            &self,
            table_id: ObjectId,
            user: &str,
            permission: Permission,
        ) -> MarlResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if user == self.denied_user {
                return Err(MarlError::AuthorizationError {
                    table_id: table_id.to_string(),
                    user: user.to_string(),
                    permission: permission.to_string(),
                });
            }
            Ok(())
        }
    }

    fn manager(checker: Arc<CountingChecker>) -> Arc<SecurityManager> {
        SecurityManager::new(
            SecurityManagerConfig {
                table_permission_cache_ttl: Duration::from_secs(60),
                table_permission_cache_error_ttl: Duration::from_secs(60),
            },
            checker,
        )
    }

    #[tokio::test]
    async fn positive_results_are_cached() {
        let checker = Arc::new(CountingChecker {
            calls: AtomicUsize::new(0),
            denied_user: "mallory",
        });
        let manager = manager(Arc::clone(&checker));
        let table = ObjectId::generate();

        manager
            .validate_permission(table, Some("alice"), Permission::Read)
            .await
            .unwrap();
        manager
            .validate_permission(table, Some("alice"), Permission::Read)
            .await
            .unwrap();
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);

        // A different permission misses the cache.
        manager
            .validate_permission(table, Some("alice"), Permission::Write)
            .await
            .unwrap();
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denials_are_cached_and_surfaced() {
        let checker = Arc::new(CountingChecker {
            calls: AtomicUsize::new(0),
            denied_user: "mallory",
        });
        let manager = manager(Arc::clone(&checker));
        let table = ObjectId::generate();

        for _ in 0..2 {
            let error = manager
                .validate_permission(table, Some("mallory"), Permission::Write)
                .await
                .unwrap_err();
            assert!(matches!(error, MarlError::AuthorizationError { .. }));
        }
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn anonymous_callers_pass() {
        let checker = Arc::new(CountingChecker {
            calls: AtomicUsize::new(0),
            denied_user: "mallory",
        });
        let manager = manager(Arc::clone(&checker));
        manager
            .validate_permission(ObjectId::generate(), None, Permission::Write)
            .await
            .unwrap();
        assert_eq!(checker.calls.load(Ordering::SeqCst), 0);
    }
}
