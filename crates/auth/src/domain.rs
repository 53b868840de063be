use serde::{Deserialize, Serialize};

/// Authorization class of an incoming call.
///
/// Exactly one domain is attributed to every request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthDomain {
    /// No credentials: public methods only.
    Anonymous,
    /// Identity resolved against one target store.
    Authenticated,
    /// Store-independent privileged access gated by the shared super secret.
    Super,
}

impl AuthDomain {
    pub const ALL: [AuthDomain; 3] = [AuthDomain::Anonymous, AuthDomain::Authenticated, AuthDomain::Super];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthDomain::Anonymous => "anonymous",
            AuthDomain::Authenticated => "authenticated",
            AuthDomain::Super => "super",
        }
    }
}

impl core::fmt::Display for AuthDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
