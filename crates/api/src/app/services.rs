//! Infrastructure wiring: backend, job services, dispatch router.

use std::sync::Arc;

use tracing::info;

use jobgate_auth::{CredentialResolver, SuperSecret};
use jobgate_infra::jobs::{JobRegistry, SpawnError};
use jobgate_infra::store::InMemoryBackend;
use jobgate_infra::{ProvisioningService, RenderingService, ServerConfig};

use crate::dispatch::DispatchRouter;
use crate::services::{CommonService, DbService, DbSettings, ReportService};

/// Wire every service over `backend` and register them with a router.
pub fn build_dispatch_router(config: &ServerConfig, backend: InMemoryBackend) -> Result<DispatchRouter, SpawnError> {
    let backend = Arc::new(backend);
    let spawner = config.spawner()?;

    let resolver = Arc::new(
        CredentialResolver::new(backend.clone(), SuperSecret::new(config.admin_passwd.clone()))
            .with_cache_ttl(config.login_cache_ttl),
    );

    let provisioning = Arc::new(ProvisioningService::new(
        JobRegistry::new("db").with_boxed_ids(config.id_strategy()),
        backend.clone(),
        backend.clone(),
        spawner.clone(),
    ));
    let rendering = Arc::new(
        RenderingService::new(
            JobRegistry::new("report").with_boxed_ids(config.id_strategy()),
            backend.clone(),
            backend.clone(),
            spawner.clone(),
        )
        .with_compression(config.report_gz),
    );

    info!(
        max_jobs = config.max_jobs,
        job_ids = ?config.job_ids,
        report_gz = config.report_gz,
        "services wired"
    );

    Ok(DispatchRouter::new(resolver.clone(), backend.clone())
        .register(DbService::new(
            provisioning.clone(),
            backend,
            resolver.clone(),
            DbSettings::from(config),
        ))
        .register(CommonService::new(resolver, provisioning, rendering.clone(), spawner))
        .register(ReportService::new(rendering)))
}
