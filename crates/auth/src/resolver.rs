//! Credential resolution: `(login, password, store) -> Identity`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use jobgate_core::{StoreName, UserId};

use crate::{Identity, LoginCredentials, SuperSecret};

/// Outcome of a successful identity-store lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: UserId,
    pub active: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityStoreError {
    #[error("store not found: {0}")]
    StoreNotFound(StoreName),

    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of users inside a target store (external collaborator).
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when the login/password pair does not match.
    fn verify(
        &self,
        store: &StoreName,
        login: &str,
        password: &str,
    ) -> Result<Option<VerifiedUser>, IdentityStoreError>;
}

impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    fn verify(
        &self,
        store: &StoreName,
        login: &str,
        password: &str,
    ) -> Result<Option<VerifiedUser>, IdentityStoreError> {
        (**self).verify(store, login, password)
    }
}

/// Authentication failure.
///
/// Single variant: callers never learn which factor was wrong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed")]
    AuthenticationFailed,
}

/// How long a successful resolution is trusted without asking the identity store.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Most `(store, login)` pairs kept in the resolution cache.
const DEFAULT_CACHE_CAPACITY: usize = 1024;

struct CachedLogin {
    password: String,
    user_id: UserId,
    cached_at: Instant,
    /// Insertion order, for eviction.
    sequence: u64,
}

/// Resolves raw credentials into [`Identity`] values and checks the super secret.
///
/// Successful resolutions are cached per `(store, login)` so repeated calls
/// from one session do not hit the identity store. An entry holds the last
/// password that resolved, expires after the cache TTL, and is replaced when
/// the same login resolves with a different password. The cache holds at most
/// [`DEFAULT_CACHE_CAPACITY`] entries; the oldest goes first.
pub struct CredentialResolver {
    identities: Arc<dyn IdentityStore>,
    super_secret: SuperSecret,
    cache: Mutex<HashMap<(String, String), CachedLogin>>,
    cache_ttl: Duration,
    cache_capacity: usize,
    next_sequence: AtomicU64,
}

impl CredentialResolver {
    pub fn new(identities: Arc<dyn IdentityStore>, super_secret: SuperSecret) -> Self {
        Self {
            identities,
            super_secret,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Trust cached resolutions for `ttl`; `Duration::ZERO` disables caching.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Validate `login`/`password` against `target_store`.
    ///
    /// Bad login, bad password, unknown store, malformed store name and
    /// inactive account all fail with the same [`AuthError`].
    pub fn resolve(&self, login: &str, password: &str, target_store: &str) -> Result<Identity, AuthError> {
        let creds = LoginCredentials::new(target_store, login, password);

        let Ok(store) = StoreName::parse(target_store) else {
            warn!(login, store = target_store, "login against malformed store name");
            return Err(AuthError::AuthenticationFailed);
        };

        if let Some(user_id) = self.cached(&store, login, password) {
            debug!(login, store = %store, "credentials resolved from cache");
            return Ok(Identity::new(store, user_id, creds));
        }

        match self.identities.verify(&store, login, password) {
            Ok(Some(VerifiedUser { user_id, active: true })) => {
                info!(login, store = %store, "successful login");
                self.remember(&store, login, password, user_id);
                Ok(Identity::new(store, user_id, creds))
            }
            Ok(_) => {
                warn!(login, store = %store, "bad login or password");
                Err(AuthError::AuthenticationFailed)
            }
            Err(e) => {
                warn!(login, store = %store, error = %e, "identity lookup failed");
                Err(AuthError::AuthenticationFailed)
            }
        }
    }

    fn cached(&self, store: &StoreName, login: &str, password: &str) -> Option<UserId> {
        let mut cache = self.cache.lock();
        let key = (store.as_str().to_string(), login.to_string());
        let entry = cache.get(&key)?;
        if entry.cached_at.elapsed() >= self.cache_ttl {
            cache.remove(&key);
            return None;
        }
        let same: bool = entry.password.as_bytes().ct_eq(password.as_bytes()).into();
        same.then_some(entry.user_id)
    }

    fn remember(&self, store: &StoreName, login: &str, password: &str, user_id: UserId) {
        if self.cache_ttl.is_zero() || self.cache_capacity == 0 {
            return;
        }
        let mut cache = self.cache.lock();
        let key = (store.as_str().to_string(), login.to_string());
        if !cache.contains_key(&key) && cache.len() >= self.cache_capacity {
            let ttl = self.cache_ttl;
            cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
            if cache.len() >= self.cache_capacity {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.sequence)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            key,
            CachedLogin {
                password: password.to_string(),
                user_id,
                cached_at: Instant::now(),
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    /// Convenience wrapper over [`Self::resolve`].
    pub fn resolve_credentials(&self, creds: &LoginCredentials) -> Result<Identity, AuthError> {
        self.resolve(&creds.login, &creds.password, &creds.store)
    }

    /// Compare a caller-supplied secret against the configured super secret.
    pub fn check_super(&self, secret: &str) -> bool {
        let ok = self.super_secret.matches(secret);
        if !ok {
            warn!("super secret rejected");
        }
        ok
    }

    pub fn change_super_secret(&self, secret: impl Into<String>) {
        self.super_secret.rotate(secret);
        info!("super secret changed");
    }

    /// Forget cached identities bound to `store` (after drop/rename).
    pub fn invalidate_store(&self, store: &StoreName) {
        self.cache.lock().retain(|(cached_store, _), _| cached_store != store.as_str());
    }
}

impl core::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeIdentities {
        lookups: AtomicUsize,
        admin_password: Mutex<String>,
    }

    impl Default for FakeIdentities {
        fn default() -> Self {
            Self {
                lookups: AtomicUsize::new(0),
                admin_password: Mutex::new("admin".to_string()),
            }
        }
    }

    impl IdentityStore for FakeIdentities {
        fn verify(
            &self,
            store: &StoreName,
            login: &str,
            password: &str,
        ) -> Result<Option<VerifiedUser>, IdentityStoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let admin_password = self.admin_password.lock().clone();
            match (store.as_str(), login, password) {
                ("demo1", "admin", pw) if pw == admin_password => Ok(Some(VerifiedUser {
                    user_id: UserId::new(1),
                    active: true,
                })),
                ("demo1", "clerk", "clerk") => Ok(Some(VerifiedUser {
                    user_id: UserId::new(2),
                    active: true,
                })),
                ("demo1", "auditor", "auditor") => Ok(Some(VerifiedUser {
                    user_id: UserId::new(3),
                    active: true,
                })),
                ("demo1", "former", "pw") => Ok(Some(VerifiedUser {
                    user_id: UserId::new(7),
                    active: false,
                })),
                ("demo1", _, _) => Ok(None),
                _ => Err(IdentityStoreError::StoreNotFound(store.clone())),
            }
        }
    }

    fn resolver() -> (Arc<FakeIdentities>, CredentialResolver) {
        let identities = Arc::new(FakeIdentities::default());
        let resolver = CredentialResolver::new(identities.clone(), SuperSecret::new("root-pw"));
        (identities, resolver)
    }

    #[test]
    fn resolves_valid_credentials() {
        let (_, resolver) = resolver();
        let identity = resolver.resolve("admin", "admin", "demo1").unwrap();

        assert_eq!(identity.store().as_str(), "demo1");
        assert_eq!(identity.user_id(), UserId::new(1));
        assert_eq!(identity.login(), "admin");
    }

    #[test]
    fn every_failure_cause_is_the_same_error() {
        let (_, resolver) = resolver();

        let causes = [
            ("nobody", "admin", "demo1"),
            ("admin", "wrong", "demo1"),
            ("admin", "admin", "missing"),
            ("former", "pw", "demo1"),
            ("admin", "admin", "bad\"store"),
        ];
        for (login, password, store) in causes {
            assert_eq!(
                resolver.resolve(login, password, store),
                Err(AuthError::AuthenticationFailed),
                "{login}/{store}"
            );
        }
    }

    #[test]
    fn successful_resolutions_are_cached_until_invalidated() {
        let (identities, resolver) = resolver();

        resolver.resolve("admin", "admin", "demo1").unwrap();
        resolver.resolve("admin", "admin", "demo1").unwrap();
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 1);

        resolver.invalidate_store(&StoreName::parse("demo1").unwrap());
        resolver.resolve("admin", "admin", "demo1").unwrap();
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_resolutions_are_not_cached() {
        let (identities, resolver) = resolver();

        let _ = resolver.resolve("admin", "wrong", "demo1");
        let _ = resolver.resolve("admin", "wrong", "demo1");
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn super_secret_can_be_checked_and_changed() {
        let (_, resolver) = resolver();

        assert!(resolver.check_super("root-pw"));
        assert!(!resolver.check_super("admin"));

        resolver.change_super_secret("rotated");
        assert!(!resolver.check_super("root-pw"));
        assert!(resolver.check_super("rotated"));
    }

    #[test]
    fn new_password_replaces_the_cached_one() {
        let (identities, resolver) = resolver();
        resolver.resolve("admin", "admin", "demo1").unwrap();

        *identities.admin_password.lock() = "changed".to_string();
        resolver.resolve("admin", "changed", "demo1").unwrap();

        assert_eq!(
            resolver.resolve("admin", "admin", "demo1"),
            Err(AuthError::AuthenticationFailed)
        );
        assert_eq!(resolver.cache.lock().len(), 1);
    }

    #[test]
    fn expired_entries_go_back_to_the_identity_store() {
        let identities = Arc::new(FakeIdentities::default());
        let resolver = CredentialResolver::new(identities.clone(), SuperSecret::new("root-pw"))
            .with_cache_ttl(Duration::ZERO);

        resolver.resolve("admin", "admin", "demo1").unwrap();
        *identities.admin_password.lock() = "changed".to_string();

        assert_eq!(
            resolver.resolve("admin", "admin", "demo1"),
            Err(AuthError::AuthenticationFailed)
        );
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 2);
        assert!(resolver.cache.lock().is_empty());
    }

    #[test]
    fn cache_is_bounded_and_evicts_the_oldest() {
        let (identities, mut resolver) = resolver();
        resolver.cache_capacity = 2;

        resolver.resolve("admin", "admin", "demo1").unwrap();
        resolver.resolve("clerk", "clerk", "demo1").unwrap();
        resolver.resolve("auditor", "auditor", "demo1").unwrap();
        assert_eq!(resolver.cache.lock().len(), 2);
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 3);

        // admin was the oldest entry and was evicted
        resolver.resolve("admin", "admin", "demo1").unwrap();
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 4);
        resolver.resolve("auditor", "auditor", "demo1").unwrap();
        assert_eq!(identities.lookups.load(Ordering::SeqCst), 4);
    }
}
