use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use jobgate_auth::{IdentityStore, IdentityStoreError, VerifiedUser};
use jobgate_core::{StoreName, UserId};

use super::r#trait::{
    Account, Datastore, DocumentRenderer, RenderError, RenderOutput, RenderRequest, StoreError,
    StoreProvisioner, TransactionScope,
};

/// Render function registered for one document kind.
pub type RenderFn =
    Arc<dyn Fn(&StoreName, UserId, &RenderRequest) -> Result<RenderOutput, RenderError> + Send + Sync>;

/// Kind rendered by the backend itself: a CSV of the store's accounts.
pub const ACCOUNTS_REPORT: &str = "store.accounts";

const ADMIN_LOGIN: &str = "admin";

#[derive(Debug, Clone)]
struct UserRecord {
    id: UserId,
    password: String,
    name: String,
    active: bool,
    lang: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct StoreData {
    initialized: bool,
    demo: bool,
    languages: Vec<String>,
    users: BTreeMap<String, UserRecord>,
}

impl StoreData {
    fn add_user(&mut self, login: &str, password: &str, name: &str, active: bool) {
        let id = UserId::new(self.users.len() as i64 + 1);
        self.users.insert(
            login.to_string(),
            UserRecord {
                id,
                password: password.to_string(),
                name: name.to_string(),
                active,
                lang: None,
            },
        );
    }
}

/// Counts of transactional scope operations, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScopeStats {
    pub opened: usize,
    pub committed: usize,
    pub closed: usize,
}

#[derive(Debug, Default)]
struct ScopeCounters {
    opened: AtomicUsize,
    committed: AtomicUsize,
    closed: AtomicUsize,
}

/// In-memory implementation of every store collaborator.
///
/// Intended for tests/dev. Scopes apply writes immediately; commit and close
/// are only accounted.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    stores: Arc<RwLock<HashMap<StoreName, StoreData>>>,
    renderers: Arc<RwLock<HashMap<String, RenderFn>>>,
    counters: Arc<ScopeCounters>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a render function for `kind`, replacing any previous one.
    pub fn register_renderer<F>(&self, kind: impl Into<String>, render: F)
    where
        F: Fn(&StoreName, UserId, &RenderRequest) -> Result<RenderOutput, RenderError> + Send + Sync + 'static,
    {
        self.renderers.write().insert(kind.into(), Arc::new(render));
    }

    /// Create an initialized store holding an active `admin` user, bypassing provisioning.
    pub fn seed_store(&self, name: &StoreName, admin_password: &str) {
        let mut data = StoreData {
            initialized: true,
            ..StoreData::default()
        };
        data.add_user(ADMIN_LOGIN, admin_password, "Administrator", true);
        self.stores.write().insert(name.clone(), data);
    }

    /// Add a user to an existing store; returns its id.
    pub fn add_user(&self, store: &StoreName, login: &str, password: &str, active: bool) -> Result<UserId, StoreError> {
        let mut stores = self.stores.write();
        let data = stores.get_mut(store).ok_or_else(|| StoreError::NotFound(store.clone()))?;
        data.add_user(login, password, login, active);
        data.users
            .get(login)
            .map(|u| u.id)
            .ok_or_else(|| StoreError::Backend(format!("user {login} vanished")))
    }

    pub fn installed_languages(&self, store: &StoreName) -> Vec<String> {
        self.stores
            .read()
            .get(store)
            .map(|d| d.languages.clone())
            .unwrap_or_default()
    }

    pub fn scope_stats(&self) -> ScopeStats {
        ScopeStats {
            opened: self.counters.opened.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            closed: self.counters.closed.load(Ordering::SeqCst),
        }
    }

    fn with_store<T>(
        &self,
        name: &StoreName,
        f: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut stores = self.stores.write();
        let data = stores.get_mut(name).ok_or_else(|| StoreError::NotFound(name.clone()))?;
        f(data)
    }

    fn render_accounts(&self, store: &StoreName) -> Result<RenderOutput, RenderError> {
        let stores = self.stores.read();
        let data = stores.get(store).ok_or_else(|| StoreError::NotFound(store.clone()))?;
        if data.users.is_empty() {
            return Ok(RenderOutput {
                artifact: None,
                format: "csv".to_string(),
            });
        }
        let mut csv = String::from("id,login,name,active\n");
        for (login, user) in &data.users {
            csv.push_str(&format!("{},{},{},{}\n", user.id, login, user.name, user.active));
        }
        Ok(RenderOutput {
            artifact: Some(csv.into_bytes()),
            format: "csv".to_string(),
        })
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("stores", &self.stores.read().len())
            .field("renderers", &self.renderers.read().len())
            .field("scopes", &self.scope_stats())
            .finish()
    }
}

struct InMemoryScope {
    store: StoreName,
    counters: Arc<ScopeCounters>,
    closed: bool,
}

impl TransactionScope for InMemoryScope {
    fn store(&self) -> &StoreName {
        &self.store
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::ScopeClosed);
        }
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Datastore for InMemoryBackend {
    fn open(&self, store: &StoreName) -> Result<Box<dyn TransactionScope>, StoreError> {
        if !self.stores.read().contains_key(store) {
            return Err(StoreError::NotFound(store.clone()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryScope {
            store: store.clone(),
            counters: Arc::clone(&self.counters),
            closed: false,
        }))
    }
}

fn valid_language(lang: &str) -> bool {
    let bytes = lang.as_bytes();
    match bytes.len() {
        2 => bytes.iter().all(u8::is_ascii_lowercase),
        5 => {
            bytes[..2].iter().all(u8::is_ascii_lowercase)
                && bytes[2] == b'_'
                && bytes[3..].iter().all(u8::is_ascii_uppercase)
        }
        _ => false,
    }
}

impl StoreProvisioner for InMemoryBackend {
    fn create_empty_store(&self, name: &StoreName) -> Result<(), StoreError> {
        let mut stores = self.stores.write();
        if stores.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.clone()));
        }
        stores.insert(name.clone(), StoreData::default());
        info!(store = %name, "store created");
        Ok(())
    }

    fn drop_store(&self, name: &StoreName) -> Result<(), StoreError> {
        self.stores
            .write()
            .remove(name)
            .map(|_| info!(store = %name, "store dropped"))
            .ok_or_else(|| StoreError::NotFound(name.clone()))
    }

    fn rename_store(&self, old: &StoreName, new: &StoreName) -> Result<(), StoreError> {
        let mut stores = self.stores.write();
        if stores.contains_key(new) {
            return Err(StoreError::AlreadyExists(new.clone()));
        }
        let data = stores.remove(old).ok_or_else(|| StoreError::NotFound(old.clone()))?;
        stores.insert(new.clone(), data);
        info!(from = %old, to = %new, "store renamed");
        Ok(())
    }

    fn store_exists(&self, name: &StoreName) -> Result<bool, StoreError> {
        Ok(self.stores.read().contains_key(name))
    }

    fn list_stores(&self) -> Result<Vec<StoreName>, StoreError> {
        let mut names: Vec<StoreName> = self.stores.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn initialize_schema(&self, scope: &mut dyn TransactionScope, demo: bool) -> Result<(), StoreError> {
        self.with_store(scope.store(), |data| {
            if data.initialized {
                return Err(StoreError::Backend("schema already initialized".to_string()));
            }
            data.initialized = true;
            data.demo = demo;
            data.add_user(ADMIN_LOGIN, ADMIN_LOGIN, "Administrator", false);
            if demo {
                data.add_user("demo", "demo", "Demo User", true);
            }
            debug!(store = %scope.store(), demo, "baseline schema loaded");
            Ok(())
        })
    }

    fn install_language(&self, scope: &mut dyn TransactionScope, lang: &str) -> Result<(), StoreError> {
        if !valid_language(lang) {
            return Err(StoreError::Backend(format!("unknown language: {lang}")));
        }
        self.with_store(scope.store(), |data| {
            if !data.languages.iter().any(|l| l == lang) {
                data.languages.push(lang.to_string());
            }
            Ok(())
        })
    }

    fn set_admin_credential(
        &self,
        scope: &mut dyn TransactionScope,
        password: &str,
        lang: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_store(scope.store(), |data| {
            let admin = data
                .users
                .get_mut(ADMIN_LOGIN)
                .ok_or_else(|| StoreError::Backend("administrator account missing".to_string()))?;
            admin.password = password.to_string();
            admin.lang = lang.map(str::to_string);
            admin.active = true;
            Ok(())
        })
    }

    fn list_accounts(&self, scope: &mut dyn TransactionScope) -> Result<Vec<Account>, StoreError> {
        self.with_store(scope.store(), |data| {
            Ok(data
                .users
                .iter()
                .map(|(login, user)| Account {
                    login: login.clone(),
                    name: user.name.clone(),
                })
                .collect())
        })
    }
}

impl IdentityStore for InMemoryBackend {
    fn verify(
        &self,
        store: &StoreName,
        login: &str,
        password: &str,
    ) -> Result<Option<VerifiedUser>, IdentityStoreError> {
        let stores = self.stores.read();
        let data = stores
            .get(store)
            .ok_or_else(|| IdentityStoreError::StoreNotFound(store.clone()))?;
        Ok(data
            .users
            .get(login)
            .filter(|u| u.password == password)
            .map(|u| VerifiedUser {
                user_id: u.id,
                active: u.active,
            }))
    }
}

impl DocumentRenderer for InMemoryBackend {
    fn render(
        &self,
        scope: &mut dyn TransactionScope,
        user_id: UserId,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        if request.object_kind == ACCOUNTS_REPORT {
            return self.render_accounts(scope.store());
        }
        let render = self
            .renderers
            .read()
            .get(&request.object_kind)
            .cloned()
            .ok_or_else(|| RenderError::UnknownKind(request.object_kind.clone()))?;
        render(scope.store(), user_id, request)
    }
}
