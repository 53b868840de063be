use serde::Deserialize;

use jobgate_core::{StoreName, UserId};

/// Raw login material as presented by the caller.
///
/// `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct LoginCredentials {
    pub store: String,
    pub login: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(store: impl Into<String>, login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            login: login.into(),
            password: password.into(),
        }
    }
}

impl core::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("store", &self.store)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A validated caller bound to one store and one user.
///
/// Produced only by [`crate::CredentialResolver`]; immutable once attached to
/// a request. Long-running jobs keep their own clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    store: StoreName,
    user_id: UserId,
    raw_credentials: LoginCredentials,
}

impl Identity {
    pub(crate) fn new(store: StoreName, user_id: UserId, raw_credentials: LoginCredentials) -> Self {
        Self {
            store,
            user_id,
            raw_credentials,
        }
    }

    pub fn store(&self) -> &StoreName {
        &self.store
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn login(&self) -> &str {
        &self.raw_credentials.login
    }

    pub fn raw_credentials(&self) -> &LoginCredentials {
        &self.raw_credentials
    }
}
