//! Data-store collaborator boundary.
//!
//! Transactional scopes, physical store lifecycle and document rendering are
//! reached only through the traits in this module; `in_memory` implements all
//! of them for tests and the development server.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::{InMemoryBackend, RenderFn, ScopeStats, ACCOUNTS_REPORT};
pub use r#trait::{
    Account, Datastore, DocumentRenderer, RenderError, RenderOutput, RenderRequest, ScopeGuard,
    StoreError, StoreProvisioner, TransactionScope,
};
