//! Rendering job: produce a document artifact in the background.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context as _;
use base64::Engine as _;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, info};

use jobgate_auth::Identity;
use jobgate_core::{StoreName, UserId};

use crate::jobs::{JobError, JobId, JobOwner, JobRegistry, JobSpawner, JobStats, JobStatus};
use crate::store::{Datastore, DocumentRenderer, RenderRequest, ScopeGuard, TransactionScope};

/// Failure message of a rendering that completed without an artifact.
pub const NO_ARTIFACT: &str = "document produced no artifact";

/// Artifact produced by a successful rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub format: String,
    /// `bytes` is zlib-compressed.
    pub compressed: bool,
}

impl RenderedDocument {
    /// Base64 form handed to callers.
    pub fn encode(&self) -> EncodedDocument {
        EncodedDocument {
            result: base64::engine::general_purpose::STANDARD.encode(&self.bytes),
            format: self.format.clone(),
            code: self.compressed.then_some("zlib"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedDocument {
    pub result: String,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

/// Starts rendering jobs and hands their artifacts to the owner once.
pub struct RenderingService {
    registry: Arc<JobRegistry<RenderedDocument>>,
    renderer: Arc<dyn DocumentRenderer>,
    datastore: Arc<dyn Datastore>,
    spawner: Arc<dyn JobSpawner>,
    compress: bool,
}

impl RenderingService {
    pub fn new(
        registry: JobRegistry<RenderedDocument>,
        renderer: Arc<dyn DocumentRenderer>,
        datastore: Arc<dyn Datastore>,
        spawner: Arc<dyn JobSpawner>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            renderer,
            datastore,
            spawner,
            compress: false,
        }
    }

    /// zlib-compress artifacts before storing them.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Start rendering on behalf of `identity`; the job opens its own scope
    /// on the identity's store.
    pub fn start(&self, identity: &Identity, request: RenderRequest) -> Result<JobId, JobError> {
        let store = identity.store().clone();
        let user_id = identity.user_id();
        let renderer = Arc::clone(&self.renderer);
        let datastore = Arc::clone(&self.datastore);
        let compress = self.compress;

        debug!(store = %store, user_id = %user_id, kind = %request.object_kind, "rendering requested");
        self.registry.start(JobOwner::user(identity), self.spawner.as_ref(), move |_ctx| {
            render(renderer.as_ref(), datastore.as_ref(), &store, user_id, &request, compress)
        })
    }

    /// `None` while running; the document on the single successful retrieval.
    pub fn poll(&self, job_id: JobId, identity: &Identity) -> Result<Option<RenderedDocument>, JobError> {
        match self.registry.poll(job_id, &JobOwner::user(identity))? {
            JobStatus::Running { .. } => Ok(None),
            JobStatus::Succeeded(document) => Ok(Some(document)),
        }
    }

    /// Render synchronously inside a scope owned by the caller.
    pub fn render_in_scope(
        &self,
        scope: &mut dyn TransactionScope,
        identity: &Identity,
        request: &RenderRequest,
    ) -> anyhow::Result<RenderedDocument> {
        produce(self.renderer.as_ref(), scope, identity.user_id(), request, self.compress)
    }

    pub fn stats(&self) -> JobStats {
        self.registry.stats()
    }
}

fn render(
    renderer: &dyn DocumentRenderer,
    datastore: &dyn Datastore,
    store: &StoreName,
    user_id: UserId,
    request: &RenderRequest,
    compress: bool,
) -> anyhow::Result<RenderedDocument> {
    let mut guard = ScopeGuard::open(datastore, store)?;
    let document = produce(renderer, guard.scope(), user_id, request, compress)?;
    guard.commit()?;
    Ok(document)
}

fn produce(
    renderer: &dyn DocumentRenderer,
    scope: &mut dyn TransactionScope,
    user_id: UserId,
    request: &RenderRequest,
    compress: bool,
) -> anyhow::Result<RenderedDocument> {
    let store = scope.store().clone();
    let output = renderer.render(scope, user_id, request)?;

    let Some(bytes) = output.artifact.filter(|a| !a.is_empty()) else {
        anyhow::bail!(NO_ARTIFACT);
    };
    let bytes = if compress { zlib(&bytes)? } else { bytes };

    info!(store = %store, kind = %request.object_kind, format = %output.format, size = bytes.len(), "document rendered");
    Ok(RenderedDocument {
        bytes,
        format: output.format,
        compressed: compress,
    })
}

fn zlib(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).context("compressing artifact")?;
    encoder.finish().context("compressing artifact")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use flate2::read::ZlibDecoder;
    use jobgate_auth::{CredentialResolver, SuperSecret};
    use parking_lot::Mutex;

    use crate::jobs::ThreadSpawner;
    use crate::store::{InMemoryBackend, RenderError, RenderOutput, ACCOUNTS_REPORT};

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        resolver: CredentialResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(InMemoryBackend::new());
            backend.seed_store(&StoreName::parse("demo1").unwrap(), "admin");
            let resolver = CredentialResolver::new(backend.clone(), SuperSecret::new("root"));
            Self { backend, resolver }
        }

        fn service(&self) -> RenderingService {
            RenderingService::new(
                JobRegistry::new("report"),
                self.backend.clone(),
                self.backend.clone(),
                Arc::new(ThreadSpawner),
            )
        }

        fn admin(&self) -> Identity {
            self.resolver.resolve("admin", "admin", "demo1").unwrap()
        }
    }

    fn request(kind: &str, ids: Vec<i64>) -> RenderRequest {
        RenderRequest {
            object_kind: kind.into(),
            ids,
            parameters: serde_json::Value::Null,
        }
    }

    fn wait(service: &RenderingService, job_id: JobId, who: &Identity) -> Result<RenderedDocument, JobError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(doc) = service.poll(job_id, who)? {
                return Ok(doc);
            }
            assert!(Instant::now() < deadline, "rendering did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn renders_once_and_closes_its_scope() {
        let fx = Fixture::new();
        let service = fx.service();
        let admin = fx.admin();

        let job_id = service.start(&admin, request(ACCOUNTS_REPORT, vec![])).unwrap();
        let doc = wait(&service, job_id, &admin).unwrap();

        assert_eq!(doc.format, "csv");
        assert!(!doc.compressed);
        assert!(String::from_utf8(doc.bytes).unwrap().starts_with("id,login"));
        assert!(matches!(service.poll(job_id, &admin), Err(JobError::NotFound(_))));

        let scopes = fx.backend.scope_stats();
        assert_eq!((scopes.opened, scopes.committed, scopes.closed), (1, 1, 1));
    }

    #[test]
    fn missing_artifact_is_a_failure() {
        let fx = Fixture::new();
        fx.backend.register_renderer("empty", |_, _, _| {
            Ok(RenderOutput {
                artifact: None,
                format: "pdf".into(),
            })
        });
        let service = fx.service();
        let admin = fx.admin();

        let job_id = service.start(&admin, request("empty", vec![1])).unwrap();
        match wait(&service, job_id, &admin) {
            Err(JobError::Execution(failure)) => assert_eq!(failure.message(), NO_ARTIFACT),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn renderer_error_is_reraised_verbatim() {
        let fx = Fixture::new();
        fx.backend
            .register_renderer("broken", |_, _, _| Err(RenderError::Failed("template missing".into())));
        let service = fx.service();
        let admin = fx.admin();

        let job_id = service.start(&admin, request("broken", vec![])).unwrap();
        match wait(&service, job_id, &admin) {
            Err(JobError::Execution(failure)) => {
                assert_eq!(failure.message(), "template missing");
                assert!(failure.diagnostic().contains("stack backtrace"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let scopes = fx.backend.scope_stats();
        assert_eq!(scopes.opened, scopes.closed);
        assert_eq!(scopes.committed, 0);
    }

    #[test]
    fn compressed_artifacts_inflate_to_the_original() {
        let fx = Fixture::new();
        let service = fx.service().with_compression(true);
        let admin = fx.admin();

        let job_id = service.start(&admin, request(ACCOUNTS_REPORT, vec![])).unwrap();
        let doc = wait(&service, job_id, &admin).unwrap();
        assert!(doc.compressed);
        assert_eq!(doc.encode().code, Some("zlib"));

        let mut inflated = String::new();
        ZlibDecoder::new(doc.bytes.as_slice()).read_to_string(&mut inflated).unwrap();
        assert!(inflated.contains(",admin,"));
    }

    #[test]
    fn other_users_cannot_poll() {
        let fx = Fixture::new();
        fx.backend
            .add_user(&StoreName::parse("demo1").unwrap(), "bob", "pw", true)
            .unwrap();
        let service = fx.service();
        let admin = fx.admin();
        let bob = fx.resolver.resolve("bob", "pw", "demo1").unwrap();

        let job_id = service.start(&admin, request(ACCOUNTS_REPORT, vec![])).unwrap();
        assert!(matches!(service.poll(job_id, &bob), Err(JobError::AccessDenied(_))));
        assert!(wait(&service, job_id, &admin).is_ok());
    }

    #[test]
    fn concurrent_jobs_keep_their_own_results() {
        let fx = Fixture::new();
        let gate = Arc::new(Mutex::new(()));
        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let held = gate.clone();
        fx.backend.register_renderer("echo", move |_, _, req| {
            let _ = started_tx.lock().send(());
            let _wait = held.lock();
            Ok(RenderOutput {
                artifact: Some(format!("{:?}", req.ids).into_bytes()),
                format: "txt".into(),
            })
        });
        let service = fx.service();
        let admin = fx.admin();

        let lock = gate.lock();
        let a = service.start(&admin, request("echo", vec![1])).unwrap();
        let b = service.start(&admin, request("echo", vec![2])).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(service.poll(a, &admin).unwrap(), None);
        drop(lock);

        assert_eq!(wait(&service, b, &admin).unwrap().bytes, b"[2]".to_vec());
        assert_eq!(wait(&service, a, &admin).unwrap().bytes, b"[1]".to_vec());
    }

    #[test]
    fn renders_inside_a_caller_scope() {
        let fx = Fixture::new();
        let service = fx.service();
        let admin = fx.admin();

        let mut guard = ScopeGuard::open(fx.backend.as_ref(), admin.store()).unwrap();
        let doc = service
            .render_in_scope(guard.scope(), &admin, &request(ACCOUNTS_REPORT, vec![]))
            .unwrap();
        assert_eq!(doc.format, "csv");
        assert_eq!(service.stats(), JobStats::default());
    }

    #[test]
    fn encoded_document_is_base64() {
        let doc = RenderedDocument {
            bytes: b"hello".to_vec(),
            format: "txt".into(),
            compressed: false,
        };
        let encoded = doc.encode();
        assert_eq!(encoded.result, "aGVsbG8=");
        assert_eq!(encoded.code, None);
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({"result": "aGVsbG8=", "format": "txt"})
        );
    }
}
