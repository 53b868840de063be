//! RPC dispatch: caller classification, capability gating, handler invocation.
//!
//! ```text
//! (service, method, credentials, params)
//!   ↓
//! 1. Resolve credentials → AuthDomain (+ Identity for sessions)
//!   ↓
//! 2. CapabilityTable::is_allowed(domain, method), else MethodNotFound
//!   ↓
//! 3. Look up the handler in the service's MethodTable
//!   ↓
//! 4. Invoke; transactional handlers get a scope opened here, committed on
//!    success and closed on every exit path
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use jobgate_auth::{AuthDomain, CapabilityTable, CredentialResolver, Identity, LoginCredentials};
use jobgate_infra::store::{Datastore, ScopeGuard, TransactionScope};

mod error;
mod params;

pub use error::DispatchError;
pub use params::Params;

pub type HandlerResult = Result<JsonValue, DispatchError>;

/// Operation bound to a method name.
pub enum Handler<S> {
    /// Receives the params only (anonymous and super methods).
    Plain(fn(&S, Params) -> HandlerResult),
    /// Receives the caller's identity; no data-store scope.
    Session(fn(&S, &Identity, Params) -> HandlerResult),
    /// Receives the identity and a scope on the identity's store, owned by the router.
    Transactional(fn(&S, &Identity, &mut dyn TransactionScope, Params) -> HandlerResult),
}

impl<S> Clone for Handler<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Handler<S> {}

/// Method name → handler, built once per service.
pub struct MethodTable<S> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S> Default for MethodTable<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> MethodTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain(mut self, method: &'static str, f: fn(&S, Params) -> HandlerResult) -> Self {
        self.handlers.insert(method, Handler::Plain(f));
        self
    }

    pub fn session(mut self, method: &'static str, f: fn(&S, &Identity, Params) -> HandlerResult) -> Self {
        self.handlers.insert(method, Handler::Session(f));
        self
    }

    pub fn transactional(
        mut self,
        method: &'static str,
        f: fn(&S, &Identity, &mut dyn TransactionScope, Params) -> HandlerResult,
    ) -> Self {
        self.handlers.insert(method, Handler::Transactional(f));
        self
    }

    pub fn get(&self, method: &str) -> Option<Handler<S>> {
        self.handlers.get(method).copied()
    }
}

/// A named service exposing methods through the router.
pub trait Dispatchable: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &CapabilityTable;

    fn methods(&self) -> &MethodTable<Self>
    where
        Self: Sized;
}

/// Credentials presented with a call.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Super { secret: String },
    Session(LoginCredentials),
}

impl Credentials {
    /// Classify a raw request.
    ///
    /// When `method` is in the `Super` allow-list of `capabilities` and the
    /// first param is a string that `is_super_secret` accepts, that param is
    /// removed from `params` and the call is a super call. Any other leading
    /// string stays an ordinary param, so a wrong secret ends up in the
    /// caller's real domain and fails the capability check like an unknown
    /// method. Otherwise session credentials make a session call, and
    /// anything else is anonymous.
    pub fn from_request(
        capabilities: &CapabilityTable,
        method: &str,
        params: &mut Params,
        session: Option<LoginCredentials>,
        is_super_secret: impl FnOnce(&str) -> bool,
    ) -> Self {
        if capabilities.is_allowed(AuthDomain::Super, method) {
            if let Some(secret) = params.take_leading_string_if(is_super_secret) {
                return Credentials::Super { secret };
            }
        }
        match session {
            Some(creds) => Credentials::Session(creds),
            None => Credentials::Anonymous,
        }
    }

    pub fn domain(&self) -> AuthDomain {
        match self {
            Credentials::Anonymous => AuthDomain::Anonymous,
            Credentials::Super { .. } => AuthDomain::Super,
            Credentials::Session(_) => AuthDomain::Authenticated,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Super { .. } => f.write_str("Super { secret: <redacted> }"),
            Credentials::Session(creds) => f.debug_tuple("Session").field(creds).finish(),
        }
    }
}

/// The caller as seen by a handler.
enum Caller {
    Anonymous,
    Super,
    Session(Identity),
}

/// Object-safe view of a [`Dispatchable`] service.
trait Route: Send + Sync {
    fn capabilities(&self) -> &CapabilityTable;

    fn invoke(
        &self,
        method: &str,
        caller: &Caller,
        datastore: &dyn Datastore,
        params: Params,
    ) -> Result<JsonValue, DispatchError>;
}

impl<S: Dispatchable> Route for S {
    fn capabilities(&self) -> &CapabilityTable {
        Dispatchable::capabilities(self)
    }

    fn invoke(
        &self,
        method: &str,
        caller: &Caller,
        datastore: &dyn Datastore,
        params: Params,
    ) -> Result<JsonValue, DispatchError> {
        let handler = self
            .methods()
            .get(method)
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_string()))?;

        match (handler, caller) {
            (Handler::Plain(f), _) => f(self, params),
            (Handler::Session(f), Caller::Session(identity)) => f(self, identity, params),
            (Handler::Transactional(f), Caller::Session(identity)) => {
                let mut guard = ScopeGuard::open(datastore, identity.store())?;
                let result = f(self, identity, guard.scope(), params)?;
                guard.commit()?;
                Ok(result)
            }
            (Handler::Session(_) | Handler::Transactional(_), Caller::Anonymous | Caller::Super) => {
                warn!(service = self.name(), method, "method needs a session but was allowed without one");
                Err(DispatchError::MethodNotFound(method.to_string()))
            }
        }
    }
}

/// Routes calls to registered services.
pub struct DispatchRouter {
    resolver: Arc<CredentialResolver>,
    datastore: Arc<dyn Datastore>,
    services: HashMap<&'static str, Arc<dyn Route>>,
}

impl DispatchRouter {
    pub fn new(resolver: Arc<CredentialResolver>, datastore: Arc<dyn Datastore>) -> Self {
        Self {
            resolver,
            datastore,
            services: HashMap::new(),
        }
    }

    pub fn register<S: Dispatchable>(mut self, service: S) -> Self {
        self.services.insert(service.name(), Arc::new(service));
        self
    }

    pub fn resolver(&self) -> &Arc<CredentialResolver> {
        &self.resolver
    }

    /// Classify a raw request and route it.
    pub fn call(
        &self,
        service: &str,
        method: &str,
        params: Vec<JsonValue>,
        session: Option<LoginCredentials>,
    ) -> Result<JsonValue, DispatchError> {
        let route = self.service(service, method)?;
        let mut params = Params::new(params);
        let credentials = Credentials::from_request(route.capabilities(), method, &mut params, session, |candidate| {
            self.resolver.check_super(candidate)
        });
        self.dispatch(route.as_ref(), service, method, credentials, params)
    }

    /// Route one call with already-classified credentials.
    pub fn route(
        &self,
        service: &str,
        method: &str,
        credentials: Credentials,
        params: Params,
    ) -> Result<JsonValue, DispatchError> {
        let route = self.service(service, method)?;
        self.dispatch(route.as_ref(), service, method, credentials, params)
    }

    fn service(&self, service: &str, method: &str) -> Result<Arc<dyn Route>, DispatchError> {
        self.services.get(service).cloned().ok_or_else(|| {
            warn!(service, method, "call to unknown service");
            DispatchError::MethodNotFound(method.to_string())
        })
    }

    fn dispatch(
        &self,
        route: &dyn Route,
        service: &str,
        method: &str,
        credentials: Credentials,
        params: Params,
    ) -> Result<JsonValue, DispatchError> {
        let domain = credentials.domain();
        let caller = self.authenticate(credentials)?;

        if !route.capabilities().is_allowed(domain, method) {
            warn!(service, method, domain = %domain, "method rejected for domain");
            return Err(DispatchError::MethodNotFound(method.to_string()));
        }

        debug!(service, method, domain = %domain, "dispatching");
        route.invoke(method, &caller, self.datastore.as_ref(), params)
    }

    fn authenticate(&self, credentials: Credentials) -> Result<Caller, DispatchError> {
        match credentials {
            Credentials::Anonymous => Ok(Caller::Anonymous),
            Credentials::Super { secret } => {
                if self.resolver.check_super(&secret) {
                    Ok(Caller::Super)
                } else {
                    Err(DispatchError::Authentication)
                }
            }
            Credentials::Session(creds) => Ok(Caller::Session(self.resolver.resolve_credentials(&creds)?)),
        }
    }
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.services.keys().collect();
        services.sort();
        f.debug_struct("DispatchRouter").field("services", &services).finish_non_exhaustive()
    }
}
