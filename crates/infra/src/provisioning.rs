//! Provisioning job: create and initialize a new store in the background.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use jobgate_core::StoreName;

use crate::jobs::{JobContext, JobError, JobId, JobOwner, JobRegistry, JobSpawner, JobStats, JobStatus};
use crate::store::{Account, Datastore, ScopeGuard, StoreError, StoreProvisioner};

/// Progress published after each completed step.
const AFTER_CREATE: f64 = 0.1;
const AFTER_SCHEMA: f64 = 0.5;
const AFTER_LANGUAGE: f64 = 0.75;
const AFTER_ADMIN: f64 = 0.9;

pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

/// Parameters of one provisioning run.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub name: StoreName,
    pub demo: bool,
    pub lang: Option<String>,
    pub admin_password: String,
}

impl ProvisioningRequest {
    pub fn new(name: StoreName) -> Self {
        Self {
            name,
            demo: false,
            lang: None,
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
        }
    }

    pub fn with_demo(mut self, demo: bool) -> Self {
        self.demo = demo;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into()).filter(|l: &String| !l.is_empty());
        self
    }

    pub fn with_admin_password(mut self, password: impl Into<String>) -> Self {
        self.admin_password = password.into();
        self
    }
}

impl std::fmt::Debug for ProvisioningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningRequest")
            .field("name", &self.name)
            .field("demo", &self.demo)
            .field("lang", &self.lang)
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

/// Snapshot returned by [`ProvisioningService::poll`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisioningStatus {
    Running { progress: f64 },
    Succeeded { accounts: Vec<Account> },
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Starts provisioning jobs and serves their progress.
///
/// Jobs are owned by [`JobOwner::Superuser`]: any holder of the super secret
/// may poll them.
pub struct ProvisioningService {
    registry: Arc<JobRegistry<Vec<Account>>>,
    provisioner: Arc<dyn StoreProvisioner>,
    datastore: Arc<dyn Datastore>,
    spawner: Arc<dyn JobSpawner>,
}

impl ProvisioningService {
    pub fn new(
        registry: JobRegistry<Vec<Account>>,
        provisioner: Arc<dyn StoreProvisioner>,
        datastore: Arc<dyn Datastore>,
        spawner: Arc<dyn JobSpawner>,
    ) -> Self {
        Self {
            registry: Arc::new(registry.with_progress()),
            provisioner,
            datastore,
            spawner,
        }
    }

    /// Start provisioning `request.name` and return the job id immediately.
    ///
    /// An existing store with the same name is refused synchronously; every
    /// later failure is captured into the job.
    pub fn start(&self, request: ProvisioningRequest) -> Result<JobId, ProvisioningError> {
        if self.provisioner.store_exists(&request.name)? {
            return Err(StoreError::AlreadyExists(request.name).into());
        }

        info!(store = %request.name, demo = request.demo, lang = ?request.lang, "provisioning store");
        let provisioner = Arc::clone(&self.provisioner);
        let datastore = Arc::clone(&self.datastore);
        let job_id = self.registry.start(JobOwner::Superuser, self.spawner.as_ref(), move |ctx| {
            provision(ctx, provisioner.as_ref(), datastore.as_ref(), &request)
        })?;
        Ok(job_id)
    }

    pub fn poll(&self, job_id: JobId) -> Result<ProvisioningStatus, JobError> {
        match self.registry.poll(job_id, &JobOwner::Superuser)? {
            JobStatus::Running { progress } => Ok(ProvisioningStatus::Running {
                progress: progress.unwrap_or(0.0),
            }),
            JobStatus::Succeeded(accounts) => Ok(ProvisioningStatus::Succeeded { accounts }),
        }
    }

    pub fn stats(&self) -> JobStats {
        self.registry.stats()
    }
}

fn provision(
    ctx: &JobContext<Vec<Account>>,
    provisioner: &dyn StoreProvisioner,
    datastore: &dyn Datastore,
    request: &ProvisioningRequest,
) -> anyhow::Result<Vec<Account>> {
    provisioner.create_empty_store(&request.name)?;
    ctx.report_progress(AFTER_CREATE);

    let mut guard = ScopeGuard::open(datastore, &request.name)?;
    provisioner.initialize_schema(guard.scope(), request.demo)?;
    guard.commit()?;
    ctx.report_progress(AFTER_SCHEMA);

    if let Some(lang) = &request.lang {
        provisioner.install_language(guard.scope(), lang)?;
        ctx.report_progress(AFTER_LANGUAGE);
    }

    provisioner.set_admin_credential(guard.scope(), &request.admin_password, request.lang.as_deref())?;
    ctx.report_progress(AFTER_ADMIN);

    let accounts = provisioner.list_accounts(guard.scope())?;
    guard.commit()?;
    info!(store = %request.name, job_id = %ctx.job_id(), accounts = accounts.len(), "store provisioned");
    Ok(accounts)
}
