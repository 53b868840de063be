//! The process-wide super secret.

use parking_lot::RwLock;
use subtle::ConstantTimeEq;

/// Shared secret gating the `Super` domain.
///
/// Comparison is constant-time. The secret can be rotated at runtime
/// (`db.change_admin_password`); `Debug` never prints it.
pub struct SuperSecret {
    current: RwLock<String>,
}

impl SuperSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(secret.into()),
        }
    }

    /// Constant-time comparison against the configured secret.
    pub fn matches(&self, candidate: &str) -> bool {
        let current = self.current.read();
        current.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    pub fn rotate(&self, secret: impl Into<String>) {
        *self.current.write() = secret.into();
    }
}

impl core::fmt::Debug for SuperSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SuperSecret").finish_non_exhaustive()
    }
}
