//! Core job types.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobgate_auth::Identity;
use jobgate_core::{DomainError, StoreName, UserId};

/// Highest progress value a running job may expose.
///
/// Only the terminal `Succeeded` transition reaches completion.
pub const MAX_RUNNING_PROGRESS: f64 = 0.95;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Who may poll (and consume) a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobOwner {
    /// Started from the `Super` domain; any super-secret holder may poll it.
    Superuser,
    /// Started by one user of one store.
    User { store: StoreName, user_id: UserId },
}

impl JobOwner {
    pub fn user(identity: &Identity) -> Self {
        Self::User {
            store: identity.store().clone(),
            user_id: identity.user_id(),
        }
    }
}

impl From<&Identity> for JobOwner {
    fn from(identity: &Identity) -> Self {
        Self::user(identity)
    }
}

impl std::fmt::Display for JobOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOwner::Superuser => f.write_str("superuser"),
            JobOwner::User { store, user_id } => write!(f, "{user_id}@{store}"),
        }
    }
}

/// Lifecycle state. `Succeeded` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// A work unit's failure, captured at the failure site.
///
/// `message` is what the caller sees; `diagnostic` is the full context (cause
/// chain and backtrace text) so the failure can be re-signalled faithfully
/// long after the background context is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct JobFailure {
    message: String,
    diagnostic: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// Capture an `anyhow` error: `Display` for the message; the cause chain
    /// and a backtrace for the diagnostic.
    ///
    /// The error's own backtrace is used when one was captured; otherwise the
    /// current thread's stack is recorded, so call this on the thread that
    /// ran the work unit.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let mut diagnostic = format!("error: {err}");
        for (depth, cause) in err.chain().skip(1).enumerate() {
            if depth == 0 {
                diagnostic.push_str("\n\ncaused by:");
            }
            let _ = write!(diagnostic, "\n  {depth}: {cause}");
        }

        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            let _ = write!(diagnostic, "\n\nstack backtrace:\n{backtrace}");
        } else {
            let _ = write!(
                diagnostic,
                "\n\nstack backtrace (at capture):\n{}",
                Backtrace::force_capture()
            );
        }
        Self::new(err.to_string(), diagnostic)
    }

    /// Capture a panic payload caught around a work unit.
    ///
    /// `site` is the trace recorded by the panic hook before unwinding; see
    /// [`catch_work_panic`].
    pub fn from_panic(payload: Box<dyn Any + Send>, site: Option<String>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "work unit panicked".to_string()
        };
        let site = site.unwrap_or_else(|| format!("stack backtrace (after unwind):\n{}", Backtrace::force_capture()));
        let diagnostic = format!("panic: {message}\n\n{site}");
        Self::new(message, diagnostic)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }
}

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static PANIC_SITE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that records the panic location and stack while the
/// panicking frames still exist. Only threads inside [`catch_work_panic`]
/// record anything.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                    .unwrap_or_else(|| "<unknown>".to_string());
                let site = format!(
                    "panicked at {location}\n\nstack backtrace:\n{}",
                    Backtrace::force_capture()
                );
                PANIC_SITE.with(|slot| *slot.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

/// Run `f`, turning a panic into a [`JobFailure`] whose diagnostic carries
/// the stack of the panic site.
pub(crate) fn catch_work_panic<T>(f: impl FnOnce() -> T) -> Result<T, JobFailure> {
    install_panic_hook();
    PANIC_SITE.with(|slot| slot.borrow_mut().take());
    let was_capturing = CAPTURING.with(|c| c.replace(true));

    let outcome = panic::catch_unwind(AssertUnwindSafe(f));

    CAPTURING.with(|c| c.set(was_capturing));
    outcome.map_err(|payload| {
        let site = PANIC_SITE.with(|slot| slot.borrow_mut().take());
        JobFailure::from_panic(payload, site)
    })
}

/// Terminal payload of a job, if any.
#[derive(Debug, Clone)]
pub(crate) enum Outcome<R> {
    Pending,
    Succeeded(R),
    Failed(JobFailure),
}

/// A tracked unit of asynchronous work.
///
/// Mutated only by its own background context through the registry; read by
/// the owner's polls; removed on first terminal retrieval.
#[derive(Debug, Clone)]
pub struct Job<R> {
    pub id: JobId,
    pub owner: JobOwner,
    pub state: JobState,
    /// `Some` only for job kinds that model incremental progress.
    pub progress: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub(crate) outcome: Outcome<R>,
}

impl<R> Job<R> {
    pub(crate) fn new(id: JobId, owner: JobOwner, tracks_progress: bool) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            state: JobState::Running,
            progress: tracks_progress.then_some(0.0),
            created_at: now,
            updated_at: now,
            outcome: Outcome::Pending,
        }
    }

    /// Raise progress to `fraction`, clamped to `[0, MAX_RUNNING_PROGRESS]`.
    ///
    /// Progress never decreases and is ignored once terminal or when the job
    /// kind does not track progress.
    pub(crate) fn advance(&mut self, fraction: f64) -> bool {
        if self.state.is_terminal() || !fraction.is_finite() {
            return false;
        }
        let Some(current) = self.progress else {
            return false;
        };
        let next = fraction.clamp(0.0, MAX_RUNNING_PROGRESS).max(current);
        self.progress = Some(next);
        self.updated_at = Utc::now();
        true
    }

    pub(crate) fn mark_succeeded(&mut self, result: R) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Succeeded;
        self.progress = self.progress.map(|_| 1.0);
        self.outcome = Outcome::Succeeded(result);
        self.updated_at = Utc::now();
        true
    }

    pub(crate) fn mark_failed(&mut self, failure: JobFailure) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Failed;
        self.outcome = Outcome::Failed(failure);
        self.updated_at = Utc::now();
        true
    }
}

/// What a poll returns when the job has not failed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus<R> {
    /// Still running; `progress` is `None` for binary-completion job kinds.
    Running { progress: Option<f64> },
    /// Finished; the job has been consumed and removed.
    Succeeded(R),
}

/// Job registry errors.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Unknown id, or already consumed.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job exists but belongs to someone else.
    #[error("access denied")]
    AccessDenied(JobId),

    /// The work unit failed; surfaced on the poll that consumed the job.
    #[error(transparent)]
    Execution(JobFailure),

    /// No execution context could be started for the job.
    #[error("failed to start job: {0}")]
    Spawn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> JobOwner {
        JobOwner::User {
            store: StoreName::parse("demo1").unwrap(),
            user_id: UserId::new(1),
        }
    }

    #[test]
    fn job_lifecycle() {
        let mut job: Job<u32> = Job::new(JobId::new(1), owner(), true);

        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.progress, Some(0.0));

        assert!(job.advance(0.5));
        assert!(job.mark_succeeded(7));
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.progress, Some(1.0));
        assert!(matches!(job.outcome, Outcome::Succeeded(7)));
    }

    #[test]
    fn progress_is_capped_and_monotonic() {
        let mut job: Job<()> = Job::new(JobId::new(1), owner(), true);

        job.advance(0.4);
        job.advance(0.2);
        assert_eq!(job.progress, Some(0.4));

        job.advance(1.0);
        assert_eq!(job.progress, Some(MAX_RUNNING_PROGRESS));

        assert!(!job.advance(f64::NAN));
        assert_eq!(job.progress, Some(MAX_RUNNING_PROGRESS));
    }

    #[test]
    fn binary_jobs_ignore_progress() {
        let mut job: Job<()> = Job::new(JobId::new(1), owner(), false);
        assert!(!job.advance(0.5));
        assert_eq!(job.progress, None);
    }

    #[test]
    fn terminal_transitions_happen_once() {
        let mut job: Job<&str> = Job::new(JobId::new(1), owner(), false);

        assert!(job.mark_failed(JobFailure::new("boom", "ctx")));
        assert!(!job.mark_succeeded("late"));
        assert!(!job.mark_failed(JobFailure::new("again", "ctx")));

        assert_eq!(job.state, JobState::Failed);
        match &job.outcome {
            Outcome::Failed(f) => assert_eq!(f.message(), "boom"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn failure_from_error_keeps_message_and_context() {
        let err = anyhow::anyhow!("disk full").context("loading baseline data");
        let failure = JobFailure::from_error(&err);

        assert_eq!(failure.message(), "loading baseline data");
        assert!(failure.diagnostic().contains("caused by:"));
        assert!(failure.diagnostic().contains("0: disk full"));
        assert!(failure.diagnostic().contains("stack backtrace"));
    }

    #[test]
    fn failure_from_error_without_causes_still_has_a_stack() {
        let failure = JobFailure::from_error(&anyhow::anyhow!("relation does not exist"));

        assert_eq!(failure.message(), "relation does not exist");
        assert_ne!(failure.diagnostic(), failure.message());
        assert!(failure.diagnostic().contains("stack backtrace"));
    }

    #[test]
    fn caught_panic_records_the_panic_site() {
        let failure = catch_work_panic(|| -> u8 { panic!("index out of bounds") }).unwrap_err();

        assert_eq!(failure.message(), "index out of bounds");
        assert!(failure.diagnostic().contains("panicked at"));
        assert!(failure.diagnostic().contains("types.rs"));
    }

    #[test]
    fn catch_work_panic_passes_values_through() {
        assert_eq!(catch_work_panic(|| 7).unwrap(), 7);
    }

    #[test]
    fn panic_without_recorded_site_falls_back_to_current_stack() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("boom"));
        let failure = JobFailure::from_panic(payload, None);

        assert_eq!(failure.message(), "boom");
        assert!(failure.diagnostic().contains("after unwind"));
    }
}
