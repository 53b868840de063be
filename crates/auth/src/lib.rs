//! `jobgate-auth`: caller classification and method gating.
//!
//! No transport or storage code lives here; the identity store is reached
//! through the [`IdentityStore`] trait only.

pub mod capability;
pub mod domain;
pub mod identity;
pub mod resolver;
pub mod secret;

pub use capability::CapabilityTable;
pub use domain::AuthDomain;
pub use identity::{Identity, LoginCredentials};
pub use resolver::{AuthError, CredentialResolver, IdentityStore, IdentityStoreError, VerifiedUser};
pub use secret::SuperSecret;
