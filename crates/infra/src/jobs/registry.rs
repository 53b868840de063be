//! The job registry: id allocation, background execution, atomic consumption.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::JobSpawner;
use super::types::{catch_work_panic, Job, JobError, JobFailure, JobId, JobOwner, JobState, JobStatus, Outcome};

/// Strategy for drawing fresh job ids.
///
/// Called with the registry lock held; the registry re-draws on collision.
pub trait IdStrategy: Send + Sync {
    fn next_id(&self) -> JobId;
}

/// Monotonic counter starting at 1.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdStrategy for SequentialIds {
    fn next_id(&self) -> JobId {
        JobId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Random ids derived from UUIDv4, kept within 53 bits so they survive
/// JSON clients that store numbers as doubles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

const JSON_SAFE_MASK: u64 = (1 << 53) - 1;

impl IdStrategy for RandomIds {
    fn next_id(&self) -> JobId {
        loop {
            let (high, low) = Uuid::new_v4().as_u64_pair();
            let candidate = (high ^ low) & JSON_SAFE_MASK;
            if candidate != 0 {
                return JobId::new(candidate);
            }
        }
    }
}

/// Counts of jobs currently held by a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Registry of asynchronously executed jobs producing results of type `R`.
///
/// All shared mutable state (the id strategy and the id→job map) sits behind
/// one mutex. Jobs are removed by the first poll that observes a terminal
/// state; there is no eviction of jobs that are never polled.
pub struct JobRegistry<R> {
    name: &'static str,
    ids: Box<dyn IdStrategy>,
    tracks_progress: bool,
    jobs: Mutex<HashMap<JobId, Job<R>>>,
}

impl<R: Send + 'static> JobRegistry<R> {
    /// Registry with sequential ids and binary (no progress) completion.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ids: Box::new(SequentialIds::new()),
            tracks_progress: false,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ids(mut self, ids: impl IdStrategy + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn with_boxed_ids(mut self, ids: Box<dyn IdStrategy>) -> Self {
        self.ids = ids;
        self
    }

    /// Jobs of this registry expose fractional progress while running.
    pub fn with_progress(mut self) -> Self {
        self.tracks_progress = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reserve a fresh id and insert a `Running` job owned by `owner`.
    pub fn allocate(&self, owner: JobOwner) -> JobId {
        let mut jobs = self.jobs.lock();
        let id = loop {
            let candidate = self.ids.next_id();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
            warn!(registry = self.name, job_id = %candidate, "job id collision, drawing again");
        };
        jobs.insert(id, Job::new(id, owner.clone(), self.tracks_progress));
        debug!(registry = self.name, job_id = %id, owner = %owner, "job allocated");
        id
    }

    /// Run `work` for `job_id` on an execution context from `spawner`.
    ///
    /// Returns as soon as the context is started. Whatever `work` returns, and
    /// any panic inside it, becomes the job's terminal state. If no context
    /// can be started the job is discarded and the error is returned.
    pub fn run_in_background<F>(
        self: &Arc<Self>,
        job_id: JobId,
        spawner: &dyn JobSpawner,
        work: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(&JobContext<R>) -> anyhow::Result<R> + Send + 'static,
    {
        let registry = Arc::clone(self);
        let task = Box::new(move || {
            let ctx = JobContext {
                job_id,
                registry: Arc::clone(&registry),
            };
            match catch_work_panic(|| work(&ctx)) {
                Ok(Ok(result)) => {
                    registry.complete(job_id, result);
                }
                Ok(Err(err)) => {
                    let failure = JobFailure::from_error(&err);
                    error!(
                        registry = registry.name,
                        job_id = %job_id,
                        error = %failure.message(),
                        diagnostic = %failure.diagnostic(),
                        "job failed"
                    );
                    registry.fail(job_id, failure);
                }
                Err(failure) => {
                    error!(
                        registry = registry.name,
                        job_id = %job_id,
                        error = %failure.message(),
                        diagnostic = %failure.diagnostic(),
                        "job panicked"
                    );
                    registry.fail(job_id, failure);
                }
            }
        });

        let thread_name = format!("{}-{}", self.name, job_id);
        if let Err(e) = spawner.spawn(thread_name, task) {
            self.jobs.lock().remove(&job_id);
            error!(registry = self.name, job_id = %job_id, error = %e, "failed to start job");
            return Err(JobError::Spawn(e.to_string()));
        }
        Ok(())
    }

    /// `allocate` followed by `run_in_background`.
    pub fn start<F>(self: &Arc<Self>, owner: JobOwner, spawner: &dyn JobSpawner, work: F) -> Result<JobId, JobError>
    where
        F: FnOnce(&JobContext<R>) -> anyhow::Result<R> + Send + 'static,
    {
        let job_id = self.allocate(owner);
        self.run_in_background(job_id, spawner, work)?;
        Ok(job_id)
    }

    pub(crate) fn report_progress(&self, job_id: JobId, fraction: f64) -> bool {
        self.jobs
            .lock()
            .get_mut(&job_id)
            .is_some_and(|job| job.advance(fraction))
    }

    /// Terminal success. A second terminal transition is ignored.
    pub(crate) fn complete(&self, job_id: JobId, result: R) -> bool {
        let done = self
            .jobs
            .lock()
            .get_mut(&job_id)
            .is_some_and(|job| job.mark_succeeded(result));
        if done {
            info!(registry = self.name, job_id = %job_id, "job succeeded");
        } else {
            warn!(registry = self.name, job_id = %job_id, "ignoring completion of finished or unknown job");
        }
        done
    }

    /// Terminal failure. A second terminal transition is ignored.
    pub(crate) fn fail(&self, job_id: JobId, failure: JobFailure) -> bool {
        let done = self
            .jobs
            .lock()
            .get_mut(&job_id)
            .is_some_and(|job| job.mark_failed(failure));
        if !done {
            warn!(registry = self.name, job_id = %job_id, "ignoring failure of finished or unknown job");
        }
        done
    }

    /// Poll `job_id` on behalf of `requester`.
    ///
    /// Running jobs yield a snapshot without side effects. A terminal job is
    /// removed in the same critical section that reads it, so exactly one
    /// concurrent poll consumes it and the others see `NotFound`.
    pub fn poll(&self, job_id: JobId, requester: &JobOwner) -> Result<JobStatus<R>, JobError> {
        let mut jobs = self.jobs.lock();
        let Entry::Occupied(entry) = jobs.entry(job_id) else {
            return Err(JobError::NotFound(job_id));
        };

        let job = entry.get();
        if &job.owner != requester {
            warn!(registry = self.name, job_id = %job_id, requester = %requester, "job polled by non-owner");
            return Err(JobError::AccessDenied(job_id));
        }
        if job.state == JobState::Running {
            return Ok(JobStatus::Running {
                progress: job.progress,
            });
        }

        let job = entry.remove();
        drop(jobs);

        let elapsed_ms = (job.updated_at - job.created_at).num_milliseconds().max(0);
        debug!(registry = self.name, job_id = %job_id, state = ?job.state, elapsed_ms, "job consumed");
        match job.outcome {
            Outcome::Succeeded(result) => Ok(JobStatus::Succeeded(result)),
            Outcome::Failed(failure) => Err(JobError::Execution(failure)),
            Outcome::Pending => Err(JobError::NotFound(job_id)),
        }
    }

    /// Snapshot of the state of `job_id` without consuming it (owner only).
    pub fn state(&self, job_id: JobId, requester: &JobOwner) -> Result<JobState, JobError> {
        let jobs = self.jobs.lock();
        let job = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        if &job.owner != requester {
            return Err(JobError::AccessDenied(job_id));
        }
        Ok(job.state)
    }

    pub fn stats(&self) -> JobStats {
        let jobs = self.jobs.lock();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.state {
                JobState::Running => stats.running += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> std::fmt::Debug for JobRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("name", &self.name)
            .field("tracks_progress", &self.tracks_progress)
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

/// Handle given to a running work unit, scoped to its own job.
pub struct JobContext<R> {
    job_id: JobId,
    registry: Arc<JobRegistry<R>>,
}

impl<R: Send + 'static> JobContext<R> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report fractional progress; see [`MAX_RUNNING_PROGRESS`](super::MAX_RUNNING_PROGRESS).
    pub fn report_progress(&self, fraction: f64) {
        self.registry.report_progress(self.job_id, fraction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use jobgate_core::{StoreName, UserId};
    use proptest::prelude::*;

    use crate::jobs::executor::{SpawnError, Task, ThreadSpawner};

    fn user(id: i64) -> JobOwner {
        JobOwner::User {
            store: StoreName::parse("demo1").unwrap(),
            user_id: UserId::new(id),
        }
    }

    fn wait_terminal<R: Send + 'static>(registry: &JobRegistry<R>, job_id: JobId, owner: &JobOwner) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.state(job_id, owner).unwrap() == JobState::Running {
            assert!(Instant::now() < deadline, "job did not finish in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn sequential_ids_start_at_one() {
        let registry: JobRegistry<()> = JobRegistry::new("test");
        assert_eq!(registry.allocate(user(1)), JobId::new(1));
        assert_eq!(registry.allocate(user(1)), JobId::new(2));
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let registry: Arc<JobRegistry<()>> = Arc::new(JobRegistry::new("test"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || (0..250).map(|_| registry.allocate(user(1))).collect::<Vec<_>>())
            })
            .collect();

        let ids: Vec<JobId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 2000);
        assert_eq!(unique.len(), ids.len());
    }

    struct Colliding {
        draws: Mutex<Vec<u64>>,
    }

    impl IdStrategy for Colliding {
        fn next_id(&self) -> JobId {
            JobId::new(self.draws.lock().pop().unwrap_or(99))
        }
    }

    #[test]
    fn colliding_draws_are_redrawn() {
        let registry: JobRegistry<()> = JobRegistry::new("test").with_ids(Colliding {
            draws: Mutex::new(vec![5, 3, 3]),
        });

        assert_eq!(registry.allocate(user(1)), JobId::new(3));
        assert_eq!(registry.allocate(user(1)), JobId::new(5));
    }

    #[test]
    fn random_ids_are_json_safe_and_non_zero() {
        for _ in 0..1000 {
            let id = RandomIds.next_id().get();
            assert!(id != 0 && id <= JSON_SAFE_MASK);
        }
    }

    #[test]
    fn poll_running_job_has_no_side_effects() {
        let registry: JobRegistry<u32> = JobRegistry::new("test").with_progress();
        let owner = user(1);
        let id = registry.allocate(owner.clone());

        registry.report_progress(id, 0.3);
        for _ in 0..3 {
            assert_eq!(
                registry.poll(id, &owner).unwrap(),
                JobStatus::Running { progress: Some(0.3) }
            );
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn terminal_job_is_consumed_exactly_once() {
        let registry: JobRegistry<&str> = JobRegistry::new("test");
        let owner = user(1);
        let id = registry.allocate(owner.clone());

        assert!(registry.complete(id, "done"));
        assert_eq!(registry.poll(id, &owner).unwrap(), JobStatus::Succeeded("done"));
        assert!(matches!(registry.poll(id, &owner), Err(JobError::NotFound(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn second_terminal_transition_is_a_no_op() {
        let registry: JobRegistry<&str> = JobRegistry::new("test");
        let owner = user(1);
        let id = registry.allocate(owner.clone());

        assert!(registry.complete(id, "first"));
        assert!(!registry.complete(id, "second"));
        assert!(!registry.fail(id, JobFailure::new("late", "ctx")));
        assert!(!registry.report_progress(id, 0.5));

        assert_eq!(registry.poll(id, &owner).unwrap(), JobStatus::Succeeded("first"));
    }

    #[test]
    fn non_owner_is_denied_regardless_of_state() {
        let registry: JobRegistry<u8> = JobRegistry::new("test");
        let owner = user(1);
        let intruder = user(2);

        let running = registry.allocate(owner.clone());
        assert!(matches!(registry.poll(running, &intruder), Err(JobError::AccessDenied(_))));
        assert!(matches!(
            registry.poll(running, &JobOwner::Superuser),
            Err(JobError::AccessDenied(_))
        ));

        let finished = registry.allocate(owner.clone());
        registry.complete(finished, 1);
        assert!(matches!(registry.poll(finished, &intruder), Err(JobError::AccessDenied(_))));

        // the denied poll did not consume it
        assert_eq!(registry.poll(finished, &owner).unwrap(), JobStatus::Succeeded(1));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let registry: JobRegistry<()> = JobRegistry::new("test");
        assert!(matches!(
            registry.poll(JobId::new(404), &user(1)),
            Err(JobError::NotFound(id)) if id == JobId::new(404)
        ));
    }

    #[test]
    fn concurrent_polls_consume_once() {
        for _ in 0..20 {
            let registry: Arc<JobRegistry<u32>> = Arc::new(JobRegistry::new("test"));
            let owner = user(1);
            let id = registry.allocate(owner.clone());
            registry.complete(id, 42);

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    let owner = owner.clone();
                    thread::spawn(move || registry.poll(id, &owner))
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners = results.iter().filter(|r| matches!(r, Ok(JobStatus::Succeeded(42)))).count();
            let not_found = results.iter().filter(|r| matches!(r, Err(JobError::NotFound(_)))).count();
            assert_eq!(winners, 1);
            assert_eq!(not_found, 7);
        }
    }

    #[test]
    fn background_work_completes_and_is_retrievable() {
        let registry: Arc<JobRegistry<u32>> = Arc::new(JobRegistry::new("test").with_progress());
        let owner = user(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let id = registry
            .start(owner.clone(), &ThreadSpawner, move |ctx| {
                ctx.report_progress(0.5);
                release_rx.recv()?;
                Ok(7)
            })
            .unwrap();

        // the triggering call returned while the work is blocked
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match registry.poll(id, &owner).unwrap() {
                JobStatus::Running { progress: Some(p) } if p >= 0.5 => break,
                JobStatus::Running { .. } => {
                    assert!(Instant::now() < deadline);
                    thread::sleep(Duration::from_millis(5));
                }
                other => panic!("unexpected status {other:?}"),
            }
        }

        release_tx.send(()).unwrap();
        wait_terminal(&registry, id, &owner);
        assert_eq!(registry.poll(id, &owner).unwrap(), JobStatus::Succeeded(7));
    }

    #[test]
    fn work_error_is_captured_and_reraised_on_poll() {
        let registry: Arc<JobRegistry<()>> = Arc::new(JobRegistry::new("test"));
        let owner = user(1);

        let id = registry
            .start(owner.clone(), &ThreadSpawner, |_ctx| Err(anyhow::anyhow!("relation does not exist")))
            .unwrap();
        wait_terminal(&registry, id, &owner);

        match registry.poll(id, &owner) {
            Err(JobError::Execution(failure)) => {
                assert_eq!(failure.message(), "relation does not exist");
                assert_ne!(failure.diagnostic(), failure.message());
                assert!(failure.diagnostic().starts_with("error: relation does not exist"));
                assert!(failure.diagnostic().contains("stack backtrace"));
            }
            other => panic!("unexpected poll result {other:?}"),
        }
        assert!(matches!(registry.poll(id, &owner), Err(JobError::NotFound(_))));
    }

    #[test]
    fn panicking_work_becomes_a_failed_job() {
        let registry: Arc<JobRegistry<()>> = Arc::new(JobRegistry::new("test"));
        let owner = user(1);

        let id = registry
            .start(owner.clone(), &ThreadSpawner, |_ctx| panic!("renderer exploded"))
            .unwrap();
        wait_terminal(&registry, id, &owner);

        match registry.poll(id, &owner) {
            Err(JobError::Execution(failure)) => {
                assert_eq!(failure.message(), "renderer exploded");
                assert!(failure.diagnostic().contains("panicked at"));
                assert!(failure.diagnostic().contains("registry.rs"));
            }
            other => panic!("unexpected poll result {other:?}"),
        }
    }

    struct RefusingSpawner;

    impl JobSpawner for RefusingSpawner {
        fn spawn(&self, _name: String, _task: Task) -> Result<(), SpawnError> {
            Err(SpawnError::Closed)
        }
    }

    #[test]
    fn spawn_failure_discards_the_job() {
        let registry: Arc<JobRegistry<()>> = Arc::new(JobRegistry::new("test"));
        let result = registry.start(user(1), &RefusingSpawner, |_ctx| Ok(()));

        assert!(matches!(result, Err(JobError::Spawn(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn stats_count_states() {
        let registry: JobRegistry<()> = JobRegistry::new("test");
        let a = registry.allocate(user(1));
        let b = registry.allocate(user(1));
        registry.allocate(user(1));
        registry.complete(a, ());
        registry.fail(b, JobFailure::new("x", "y"));

        assert_eq!(
            registry.stats(),
            JobStats {
                running: 1,
                succeeded: 1,
                failed: 1
            }
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn reported_progress_is_monotonic_and_below_one(steps in proptest::collection::vec(-1.0f64..2.0, 1..20)) {
            let registry: JobRegistry<()> = JobRegistry::new("test").with_progress();
            let owner = user(1);
            let id = registry.allocate(owner.clone());

            let mut last = 0.0;
            for step in steps {
                registry.report_progress(id, step);
                let JobStatus::Running { progress: Some(p) } = registry.poll(id, &owner).unwrap() else {
                    panic!("job should still be running");
                };
                prop_assert!(p >= last);
                prop_assert!(p < 1.0);
                last = p;
            }
        }
    }
}
