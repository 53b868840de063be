//! `db` service: store lifecycle.

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use jobgate_auth::{AuthDomain, CapabilityTable, CredentialResolver};
use jobgate_core::StoreName;
use jobgate_infra::jobs::JobId;
use jobgate_infra::store::StoreProvisioner;
use jobgate_infra::{ProvisioningRequest, ProvisioningService, ProvisioningStatus, ServerConfig};

use crate::dispatch::{DispatchError, Dispatchable, HandlerResult, MethodTable, Params};

/// Policy knobs of the `db` service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbSettings {
    pub list_db: bool,
    pub db_filter: Vec<String>,
    pub drop_guard: bool,
}

impl From<&ServerConfig> for DbSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            list_db: config.list_db,
            db_filter: config.db_filter.clone(),
            drop_guard: config.drop_guard,
        }
    }
}

impl DbSettings {
    fn visible(&self, name: &StoreName) -> bool {
        self.db_filter.is_empty() || self.db_filter.iter().any(|allowed| allowed == name.as_str())
    }
}

pub struct DbService {
    capabilities: CapabilityTable,
    methods: MethodTable<Self>,
    provisioning: Arc<ProvisioningService>,
    provisioner: Arc<dyn StoreProvisioner>,
    resolver: Arc<CredentialResolver>,
    settings: DbSettings,
}

impl DbService {
    pub fn new(
        provisioning: Arc<ProvisioningService>,
        provisioner: Arc<dyn StoreProvisioner>,
        resolver: Arc<CredentialResolver>,
        settings: DbSettings,
    ) -> Self {
        Self {
            capabilities: CapabilityTable::new()
                .allow(
                    AuthDomain::Super,
                    ["create", "get_progress", "drop", "rename", "change_admin_password"],
                )
                .allow(AuthDomain::Anonymous, ["db_exist", "list", "server_version"]),
            methods: MethodTable::new()
                .plain("create", Self::create)
                .plain("get_progress", Self::get_progress)
                .plain("drop", Self::drop_store)
                .plain("rename", Self::rename)
                .plain("change_admin_password", Self::change_admin_password)
                .plain("db_exist", Self::db_exist)
                .plain("list", Self::list)
                .plain("server_version", Self::server_version),
            provisioning,
            provisioner,
            resolver,
            settings,
        }
    }

    /// `create(name, demo, lang, admin_password?) -> job_id`
    fn create(&self, params: Params) -> HandlerResult {
        let name: StoreName = params.get(0, "name")?;
        let demo: bool = params.get_opt(1, "demo")?.unwrap_or(false);
        let lang: Option<String> = params.get_opt(2, "lang")?;

        let mut request = ProvisioningRequest::new(name).with_demo(demo);
        if let Some(lang) = lang {
            request = request.with_lang(lang);
        }
        if let Some(password) = params.get_opt::<String>(3, "admin_password")? {
            request = request.with_admin_password(password);
        }

        let job_id = self.provisioning.start(request)?;
        Ok(json!(job_id))
    }

    /// `get_progress(job_id) -> [progress, []] | [1.0, accounts]`
    fn get_progress(&self, params: Params) -> HandlerResult {
        let job_id: JobId = params.get(0, "job_id")?;
        match self.provisioning.poll(job_id)? {
            ProvisioningStatus::Running { progress } => Ok(json!([progress, []])),
            ProvisioningStatus::Succeeded { accounts } => Ok(json!([1.0, accounts])),
        }
    }

    fn drop_store(&self, params: Params) -> HandlerResult {
        let name: StoreName = params.get(0, "name")?;
        if self.settings.drop_guard {
            warn!(store = %name, "drop refused by guard");
            return Err(DispatchError::Service(format!(
                "not dropping store {name} because the drop guard is set"
            )));
        }

        self.provisioner.drop_store(&name).map_err(|e| {
            warn!(store = %name, error = %e, "drop failed");
            DispatchError::Service(format!("couldn't drop store {name}: {e}"))
        })?;
        self.resolver.invalidate_store(&name);
        info!(store = %name, "store dropped");
        Ok(JsonValue::Bool(true))
    }

    fn rename(&self, params: Params) -> HandlerResult {
        let old: StoreName = params.get(0, "old_name")?;
        let new: StoreName = params.get(1, "new_name")?;

        self.provisioner.rename_store(&old, &new)?;
        self.resolver.invalidate_store(&old);
        info!(from = %old, to = %new, "store renamed");
        Ok(JsonValue::Bool(true))
    }

    fn change_admin_password(&self, params: Params) -> HandlerResult {
        let secret: String = params.get(0, "new_password")?;
        if secret.is_empty() {
            return Err(DispatchError::InvalidParams("new_password must not be empty".into()));
        }
        self.resolver.change_super_secret(secret);
        Ok(JsonValue::Bool(true))
    }

    fn db_exist(&self, params: Params) -> HandlerResult {
        let raw: String = params.get(0, "name")?;
        let Ok(name) = StoreName::parse(raw) else {
            return Ok(JsonValue::Bool(false));
        };
        Ok(JsonValue::Bool(self.provisioner.store_exists(&name)?))
    }

    fn list(&self, _params: Params) -> HandlerResult {
        if !self.settings.list_db {
            return Err(DispatchError::AccessDenied);
        }
        let mut names: Vec<String> = self
            .provisioner
            .list_stores()?
            .into_iter()
            .filter(|name| self.settings.visible(name))
            .map(|name| name.as_str().to_string())
            .collect();
        names.sort();
        Ok(json!(names))
    }

    fn server_version(&self, _params: Params) -> HandlerResult {
        Ok(json!(super::SERVER_VERSION))
    }
}

impl Dispatchable for DbService {
    fn name(&self) -> &'static str {
        "db"
    }

    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn methods(&self) -> &MethodTable<Self> {
        &self.methods
    }
}
