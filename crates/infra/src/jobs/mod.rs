//! Background job registry with poll-until-done retrieval.
//!
//! ## Design
//!
//! - A triggering call allocates a job id and returns it immediately
//! - The work unit runs on an independent execution context (`JobSpawner`)
//! - Only the work unit mutates its own entry (progress, result, failure)
//! - The owner polls; the first poll that observes a terminal state consumes
//!   and removes the job
//!
//! ## Components
//!
//! - `Job`: one tracked unit of work and its lifecycle state
//! - `JobRegistry`: id allocation, mutation and atomic consumption
//! - `JobSpawner`: thread-per-job or bounded worker pool

pub mod executor;
pub mod registry;
pub mod types;

pub use executor::{JobSpawner, PoolStats, SpawnError, Task, ThreadSpawner, WorkerPool};
pub use registry::{IdStrategy, JobContext, JobRegistry, JobStats, RandomIds, SequentialIds};
pub use types::{
    Job, JobError, JobFailure, JobId, JobOwner, JobState, JobStatus, MAX_RUNNING_PROGRESS,
};
