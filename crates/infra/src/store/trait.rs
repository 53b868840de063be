use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobgate_core::{StoreName, UserId};

/// Store-system error.
///
/// Surfaced unchanged to the caller that triggered the operation (or, inside a
/// background job, captured into the job's failure).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store not found: {0}")]
    NotFound(StoreName),

    #[error("store already exists: {0}")]
    AlreadyExists(StoreName),

    #[error("transaction scope already closed")]
    ScopeClosed,

    #[error("{0}")]
    Backend(String),
}

/// One transactional scope against one store.
///
/// `close` is idempotent and safe after `commit` or after a failure; work not
/// committed before `close` is discarded.
pub trait TransactionScope: Send {
    fn store(&self) -> &StoreName;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn close(&mut self);
}

/// Opens transactional scopes.
pub trait Datastore: Send + Sync {
    fn open(&self, store: &StoreName) -> Result<Box<dyn TransactionScope>, StoreError>;
}

impl<T: Datastore + ?Sized> Datastore for Arc<T> {
    fn open(&self, store: &StoreName) -> Result<Box<dyn TransactionScope>, StoreError> {
        (**self).open(store)
    }
}

/// Owns a scope and closes it when dropped, whatever the exit path.
pub struct ScopeGuard {
    scope: Box<dyn TransactionScope>,
}

impl ScopeGuard {
    pub fn new(scope: Box<dyn TransactionScope>) -> Self {
        Self { scope }
    }

    pub fn open(datastore: &dyn Datastore, store: &StoreName) -> Result<Self, StoreError> {
        datastore.open(store).map(Self::new)
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.scope.commit()
    }

    pub fn scope(&mut self) -> &mut dyn TransactionScope {
        self.scope.as_mut()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.close();
    }
}

/// A user account of a provisioned store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
    pub name: String,
}

/// Physical store lifecycle and initialization steps.
pub trait StoreProvisioner: Send + Sync {
    fn create_empty_store(&self, name: &StoreName) -> Result<(), StoreError>;

    fn drop_store(&self, name: &StoreName) -> Result<(), StoreError>;

    fn rename_store(&self, old: &StoreName, new: &StoreName) -> Result<(), StoreError>;

    fn store_exists(&self, name: &StoreName) -> Result<bool, StoreError>;

    fn list_stores(&self) -> Result<Vec<StoreName>, StoreError>;

    /// Load the baseline schema and data, optionally with demo records.
    fn initialize_schema(&self, scope: &mut dyn TransactionScope, demo: bool) -> Result<(), StoreError>;

    fn install_language(&self, scope: &mut dyn TransactionScope, lang: &str) -> Result<(), StoreError>;

    /// Set the administrator's password and preferred language, activating the account.
    fn set_admin_credential(
        &self,
        scope: &mut dyn TransactionScope,
        password: &str,
        lang: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Accounts of the store, ordered by login.
    fn list_accounts(&self, scope: &mut dyn TransactionScope) -> Result<Vec<Account>, StoreError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown document kind: {0}")]
    UnknownKind(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Input of one rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub object_kind: String,
    pub ids: Vec<i64>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Raw renderer output. `artifact` is `None` when nothing was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub artifact: Option<Vec<u8>>,
    pub format: String,
}

/// Produces document artifacts.
pub trait DocumentRenderer: Send + Sync {
    fn render(
        &self,
        scope: &mut dyn TransactionScope,
        user_id: UserId,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError>;
}

impl<T: DocumentRenderer + ?Sized> DocumentRenderer for Arc<T> {
    fn render(
        &self,
        scope: &mut dyn TransactionScope,
        user_id: UserId,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        (**self).render(scope, user_id, request)
    }
}
