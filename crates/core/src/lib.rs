//! `jobgate-core`: shared identifiers and the domain error model.
//!
//! Every other crate in the workspace speaks these types.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{StoreName, UserId};
