//! `report` service: document rendering for authenticated users.

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use jobgate_auth::{AuthDomain, CapabilityTable, Identity};
use jobgate_infra::jobs::JobId;
use jobgate_infra::store::{RenderRequest, TransactionScope};
use jobgate_infra::RenderingService;

use crate::dispatch::{DispatchError, Dispatchable, HandlerResult, MethodTable, Params};

pub struct ReportService {
    capabilities: CapabilityTable,
    methods: MethodTable<Self>,
    rendering: Arc<RenderingService>,
}

impl ReportService {
    pub fn new(rendering: Arc<RenderingService>) -> Self {
        Self {
            capabilities: CapabilityTable::new()
                .allow(AuthDomain::Authenticated, ["report", "report_get", "render_report"]),
            methods: MethodTable::new()
                .session("report", Self::report)
                .session("report_get", Self::report_get)
                .transactional("render_report", Self::render_report),
            rendering,
        }
    }

    /// `report(object_kind, ids, parameters?) -> job_id`
    fn report(&self, identity: &Identity, params: Params) -> HandlerResult {
        let job_id = self.rendering.start(identity, render_request(&params)?)?;
        Ok(json!(job_id))
    }

    /// `report_get(job_id) -> {state: false} | {state: true, result, format, code?}`
    fn report_get(&self, identity: &Identity, params: Params) -> HandlerResult {
        let job_id: JobId = params.get(0, "job_id")?;
        match self.rendering.poll(job_id, identity)? {
            None => Ok(json!({ "state": false })),
            Some(document) => {
                let mut body = serde_json::to_value(document.encode())
                    .map_err(|e| DispatchError::Service(e.to_string()))?;
                if let JsonValue::Object(map) = &mut body {
                    map.insert("state".to_string(), JsonValue::Bool(true));
                }
                Ok(body)
            }
        }
    }

    /// `render_report(object_kind, ids, parameters?) -> {result, format, code?}`
    ///
    /// Synchronous rendering inside the request's own scope.
    fn render_report(&self, identity: &Identity, scope: &mut dyn TransactionScope, params: Params) -> HandlerResult {
        let request = render_request(&params)?;
        let document = self
            .rendering
            .render_in_scope(scope, identity, &request)
            .map_err(|e| DispatchError::Service(e.to_string()))?;
        serde_json::to_value(document.encode()).map_err(|e| DispatchError::Service(e.to_string()))
    }
}

fn render_request(params: &Params) -> Result<RenderRequest, DispatchError> {
    Ok(RenderRequest {
        object_kind: params.get(0, "object_kind")?,
        ids: params.get(1, "ids")?,
        parameters: params.get_opt(2, "parameters")?.unwrap_or(JsonValue::Null),
    })
}

impl Dispatchable for ReportService {
    fn name(&self) -> &'static str {
        "report"
    }

    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn methods(&self) -> &MethodTable<Self> {
        &self.methods
    }
}
