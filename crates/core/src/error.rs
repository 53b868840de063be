//! Value-level errors shared by every crate.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A caller-supplied value was rejected before reaching any collaborator.
///
/// Store, job and transport failures have their own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier (store name, user id, job id) did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
