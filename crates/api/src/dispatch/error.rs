use thiserror::Error;

use jobgate_auth::AuthError;
use jobgate_core::DomainError;
use jobgate_infra::jobs::{JobError, JobFailure, JobId};
use jobgate_infra::store::StoreError;
use jobgate_infra::ProvisioningError;

/// Every failure a caller can observe.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Bad credentials; never says which factor was wrong.
    #[error("authentication failed")]
    Authentication,

    /// Unknown method, or a method the caller's domain may not call.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Valid job id, wrong owner (or a refused operation).
    #[error("access denied")]
    AccessDenied,

    /// Unknown or already consumed job id.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A background job failed; carries its original message and diagnostic.
    #[error(transparent)]
    JobExecution(JobFailure),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Error raised by the target operation or a collaborator.
    #[error("{0}")]
    Service(String),
}

impl From<AuthError> for DispatchError {
    fn from(_: AuthError) -> Self {
        DispatchError::Authentication
    }
}

impl From<JobError> for DispatchError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotFound(id) => DispatchError::JobNotFound(id),
            JobError::AccessDenied(_) => DispatchError::AccessDenied,
            JobError::Execution(failure) => DispatchError::JobExecution(failure),
            JobError::Spawn(msg) => DispatchError::Service(msg),
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        DispatchError::Service(value.to_string())
    }
}

impl From<ProvisioningError> for DispatchError {
    fn from(value: ProvisioningError) -> Self {
        match value {
            ProvisioningError::Store(e) => e.into(),
            ProvisioningError::Job(e) => e.into(),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        DispatchError::InvalidParams(value.to_string())
    }
}
