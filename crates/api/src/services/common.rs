//! `common` service: login, version information, job statistics.

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use jobgate_auth::{AuthDomain, CapabilityTable, CredentialResolver};
use jobgate_infra::jobs::JobSpawner;
use jobgate_infra::{ProvisioningService, RenderingService};

use crate::dispatch::{Dispatchable, HandlerResult, MethodTable, Params};

const ABOUT: &str = "jobgate: background job registry behind a capability-gated RPC dispatcher";

pub struct CommonService {
    capabilities: CapabilityTable,
    methods: MethodTable<Self>,
    resolver: Arc<CredentialResolver>,
    provisioning: Arc<ProvisioningService>,
    rendering: Arc<RenderingService>,
    spawner: Arc<dyn JobSpawner>,
}

impl CommonService {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        provisioning: Arc<ProvisioningService>,
        rendering: Arc<RenderingService>,
        spawner: Arc<dyn JobSpawner>,
    ) -> Self {
        Self {
            capabilities: CapabilityTable::new()
                .allow(AuthDomain::Anonymous, ["login", "about", "version"])
                .allow(AuthDomain::Super, ["get_stats"]),
            methods: MethodTable::new()
                .plain("login", Self::login)
                .plain("about", Self::about)
                .plain("version", Self::version)
                .plain("get_stats", Self::get_stats),
            resolver,
            provisioning,
            rendering,
            spawner,
        }
    }

    /// `login(store, login, password) -> user_id | false`
    fn login(&self, params: Params) -> HandlerResult {
        let store: String = params.get(0, "store")?;
        let login: String = params.get(1, "login")?;
        let password: String = params.get(2, "password")?;

        match self.resolver.resolve(&login, &password, &store) {
            Ok(identity) => Ok(json!(identity.user_id())),
            Err(_) => Ok(JsonValue::Bool(false)),
        }
    }

    fn about(&self, _params: Params) -> HandlerResult {
        Ok(json!(ABOUT))
    }

    fn version(&self, _params: Params) -> HandlerResult {
        Ok(json!({
            "server_version": super::SERVER_VERSION,
            "protocol_version": super::PROTOCOL_VERSION,
        }))
    }

    fn get_stats(&self, _params: Params) -> HandlerResult {
        Ok(json!({
            "db": self.provisioning.stats(),
            "report": self.rendering.stats(),
            "workers": self.spawner.pool_stats(),
        }))
    }
}

impl Dispatchable for CommonService {
    fn name(&self) -> &'static str {
        "common"
    }

    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn methods(&self) -> &MethodTable<Self> {
        &self.methods
    }
}
