//! Shared engine handle
//!
//! [`Engine`] owns one native session and the registry of operations running
//! against it. Clones share the same session. Every operation checks the
//! disposed flag first, so a disposed engine fails fast instead of touching
//! freed native state.

use crate::config::{ChunkConfig, EngineConfig};
use crate::error::{BridgeError, Result};
use crate::native::{ComputeDevice, NativeApi, NativeSession};
use crate::ownership::c_string;
use crate::records::Embedding;
use crate::registry::{AsyncOperationHandle, OperationId, OperationRegistry, OperationSlot};
use crate::runtime::worker_handle;
use crate::streaming::{self, DirectoryRequest, EmbeddingStream};
use crate::sync_bridge::{self, Request, Response};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

struct EngineInner {
    api: NativeApi,
    model_id: String,
    chunk: ChunkConfig,
    session: RwLock<Option<Arc<NativeSession>>>,
    registry: Arc<OperationRegistry>,
    disposed: AtomicBool,
}

impl EngineInner {
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let cancelled = self.registry.drain();
        let session = self
            .session
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        // Workers still inside a native call keep the session alive until they return
        let in_flight = session.as_ref().map_or(0, |s| Arc::strong_count(s) - 1);
        drop(session);
        tracing::debug!(
            model_id = %self.model_id,
            cancelled,
            in_flight,
            "engine disposed"
        );
        true
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Handle to a loaded native model
///
/// Cheap to clone. The session is released when the engine is disposed and
/// the last in-flight worker has returned; dropping the last clone disposes.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Load a model through `api`. Blocks for the duration of the load.
    pub fn open(api: NativeApi, config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let model = c_string("model_id", &config.model_id)?;
        let revision = config
            .revision
            .as_deref()
            .map(|revision| c_string("revision", revision))
            .transpose()?;
        let revision_ptr = revision.as_ref().map_or(std::ptr::null(), |r| r.as_ptr());

        let raw = unsafe { (api.load_model)(model.as_ptr(), revision_ptr, config.dtype.as_raw()) };
        let Some(raw) = NonNull::new(raw) else {
            let err = api.take_error("load_model");
            tracing::debug!(model_id = %config.model_id, error = %err, "model load failed");
            return Err(err);
        };

        tracing::debug!(
            model_id = %config.model_id,
            dtype = ?config.dtype,
            "engine opened"
        );
        let session = NativeSession::new(api, raw, config.model_id.clone());
        Ok(Self {
            inner: Arc::new(EngineInner {
                api,
                model_id: config.model_id.clone(),
                chunk: config.chunk,
                session: RwLock::new(Some(Arc::new(session))),
                registry: Arc::new(OperationRegistry::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Load a model on the blocking worker pool
    pub async fn open_async(api: NativeApi, config: EngineConfig) -> Result<Self> {
        worker_handle()?
            .spawn_blocking(move || Self::open(api, &config))
            .await
            .map_err(|e| BridgeError::engine_call_failed("load_model", e.to_string()))?
    }

    pub fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    /// Chunking parameters used by the typed helpers
    pub fn chunk_config(&self) -> &ChunkConfig {
        &self.inner.chunk
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Number of registered async operations and streams
    pub fn pending_operations(&self) -> usize {
        self.inner.registry.len()
    }

    fn session(&self, operation: &str) -> Result<Arc<NativeSession>> {
        if self.is_disposed() {
            return Err(BridgeError::disposed(operation));
        }
        self.inner
            .session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BridgeError::disposed(operation))
    }

    /// Run one request on the calling thread
    pub fn call_sync(&self, request: &Request, config: &ChunkConfig) -> Result<Response> {
        let session = self.session(request.operation())?;
        config.validate()?;
        sync_bridge::call(&session, request, config).map_err(|err| {
            log_fatal(request.operation(), &err);
            err
        })
    }

    /// Embed one text with the engine's chunk configuration
    pub fn embed_text(&self, text: &str) -> Result<Embedding> {
        match self.call_sync(&Request::Text(text.to_string()), &self.inner.chunk)? {
            Response::Single(embedding) => Ok(embedding),
            Response::Batch(_) => Err(BridgeError::contract_violation(
                "embed_text produced a batch",
            )),
        }
    }

    /// Embed several texts in one native call
    pub fn embed_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Embedding>> {
        let texts = texts.iter().map(|t| t.as_ref().to_string()).collect();
        self.call_sync(&Request::Batch(texts), &self.inner.chunk)
            .map(Response::into_embeddings)
    }

    /// Chunk and embed one file
    pub fn embed_file(&self, path: impl AsRef<Path>) -> Result<Vec<Embedding>> {
        let request = Request::File(path.as_ref().to_path_buf());
        self.call_sync(&request, &self.inner.chunk)
            .map(Response::into_embeddings)
    }

    /// Start a request on the blocking worker pool.
    ///
    /// The returned handle resolves with the response, or with
    /// [`BridgeError::OperationCancelled`] if it is cancelled first.
    pub fn start_async(&self, request: Request, config: &ChunkConfig) -> Result<AsyncOperationHandle> {
        let operation = request.operation();
        let session = self.session(operation)?;
        config.validate()?;
        let handle = worker_handle()?;

        let registry = self.inner.registry.clone();
        let id = registry.allocate_id();
        let (slot, receiver) = OperationSlot::new(operation);
        registry.register(id, slot.clone());
        tracing::debug!(operation_id = id, operation, "async operation registered");

        let config = *config;
        let worker_slot = slot.clone();
        let _worker = handle.spawn_blocking(move || {
            if worker_slot.is_cancel_requested() {
                tracing::debug!(operation_id = id, operation, "skipping cancelled operation");
                return;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                sync_bridge::call(&session, &request, &config)
            }))
            .unwrap_or_else(|_| Err(BridgeError::engine_call_failed(operation, "native call panicked")));

            if let Err(err) = &outcome {
                log_fatal(operation, err);
            }
            if !worker_slot.resolve(outcome) {
                tracing::warn!(operation_id = id, operation, "discarding result of cancelled operation");
            }
        });

        Ok(AsyncOperationHandle::new(id, slot, receiver, registry))
    }

    /// Cancel a registered async operation or stream by id.
    ///
    /// Returns true if the operation was still pending. Unknown or finished
    /// ids are ignored.
    pub fn cancel(&self, id: OperationId) -> bool {
        self.inner.registry.cancel(id)
    }

    /// Start a streaming directory request
    pub fn start_streaming(
        &self,
        request: DirectoryRequest,
        config: &ChunkConfig,
    ) -> Result<EmbeddingStream> {
        let session = self.session("embed_directory")?;
        config.validate()?;
        let handle = worker_handle()?;
        streaming::start(session, self.inner.registry.clone(), request, config, &handle)
    }

    /// Device the engine computes on
    pub fn active_device(&self) -> Result<ComputeDevice> {
        self.session("active_device")?;
        let code = unsafe { (self.inner.api.active_device)() };
        ComputeDevice::from_raw(code).map_err(|err| {
            log_fatal("active_device", &err);
            err
        })
    }

    pub fn is_device_available(&self, device: ComputeDevice) -> Result<bool> {
        self.session("device_available")?;
        Ok(unsafe { (self.inner.api.device_available)(device as i32) })
    }

    /// Release the engine. Idempotent.
    ///
    /// Cancels and deregisters every operation and stream, then drops this
    /// engine's reference to the native session.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("model_id", &self.inner.model_id)
            .field("disposed", &self.is_disposed())
            .field("pending_operations", &self.pending_operations())
            .finish()
    }
}

fn log_fatal(operation: &str, err: &BridgeError) {
    if err.is_fatal() {
        tracing::error!(operation, error = %err, "engine contract violation");
    }
}

#[cfg(all(test, feature = "loopback-engine"))]
mod tests {
    use super::*;
    use crate::loopback;
    use crate::registry::OperationState;
    use crate::streaming::StreamState;
    use crate::ErrorKind;
    use futures::StreamExt;
    use std::time::Duration;

    fn open(model: &str) -> Engine {
        Engine::open(loopback::api(), &EngineConfig::for_model(model)).unwrap()
    }

    #[test]
    fn test_open_unknown_model() {
        let err = Engine::open(loopback::api(), &EngineConfig::for_model("nowhere/model")).unwrap_err();
        assert_eq!(
            err,
            BridgeError::ModelNotFound {
                model_id: "nowhere/model".to_string()
            }
        );
    }

    #[test]
    fn test_open_rejects_invalid_config_before_loading() {
        let mut config = EngineConfig::for_model("loopback/invalid-config");
        config.chunk.batch_size = 0;
        let err = Engine::open(loopback::api(), &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(loopback::allocation_stats("loopback/invalid-config").sessions_opened, 0);
    }

    #[test]
    fn test_sync_helpers() {
        let engine = open("loopback/engine-sync@16");
        let embedding = engine.embed_text("hello").unwrap();
        assert_eq!(embedding.dimension(), 16);

        let batch = engine.embed_batch(&["a", "b", "c"]).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].text.as_deref(), Some("a"));
    }

    #[test]
    fn test_failed_call_leaves_engine_usable() {
        let engine = open("loopback/engine-recover");
        let err = engine.embed_text("[[multi]]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOutputShape);
        assert!(engine.embed_text("still works").is_ok());
    }

    #[test]
    fn test_device_queries() {
        let engine = open("loopback/engine-device");
        assert_eq!(engine.active_device().unwrap(), ComputeDevice::Cpu);
        assert!(engine.is_device_available(ComputeDevice::Cpu).unwrap());
        assert!(!engine.is_device_available(ComputeDevice::Cuda).unwrap());
    }

    #[test]
    fn test_disposed_engine_rejects_every_operation() {
        let model = "loopback/engine-disposed";
        let engine = open(model);
        let clone = engine.clone();
        engine.dispose();
        engine.dispose();

        assert!(clone.is_disposed());
        assert_eq!(clone.embed_text("x").unwrap_err(), BridgeError::disposed("embed_text"));
        assert_eq!(
            clone
                .start_async(Request::Text("x".into()), &ChunkConfig::default())
                .unwrap_err(),
            BridgeError::disposed("embed_text")
        );
        assert_eq!(
            clone
                .start_streaming(DirectoryRequest::new("."), &ChunkConfig::default())
                .unwrap_err(),
            BridgeError::disposed("embed_directory")
        );
        assert_eq!(clone.active_device().unwrap_err(), BridgeError::disposed("active_device"));

        let stats = loopback::allocation_stats(model);
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let engine = open("loopback/engine-async");
        let handle = engine
            .start_async(Request::Text("async".into()), &ChunkConfig::default())
            .unwrap();
        assert_eq!(engine.pending_operations(), 1);

        let response = handle.wait().await.unwrap();
        assert_eq!(response.into_embeddings().len(), 1);
        assert_eq!(engine.pending_operations(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_cancels_pending_operations() {
        let model = "loopback/engine-dispose-pending";
        let engine = open(model);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "[[slow]] one").unwrap();
        std::fs::write(dir.path().join("b.txt"), "[[slow]] two").unwrap();

        let handle = engine
            .start_async(Request::Text("[[slow]] text".into()), &ChunkConfig::default())
            .unwrap();
        let mut stream = engine
            .start_streaming(DirectoryRequest::new(dir.path()), &ChunkConfig::default())
            .unwrap();
        let clone = engine.clone();
        assert_eq!(clone.pending_operations(), 2);

        engine.dispose();
        assert_eq!(clone.pending_operations(), 0);
        assert_eq!(handle.state(), OperationState::Cancelled);
        assert!(handle.wait().await.unwrap_err().is_cancelled());

        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item);
        }
        assert!(last.unwrap().unwrap_err().is_cancelled());
        assert_eq!(stream.state(), StreamState::Cancelled);
        drop(stream);
        drop(clone);

        // The worker finishes its native call, then the session is released
        let stats = tokio::task::spawn_blocking(move || {
            loopback::wait_for_quiescence(model, Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(stats.is_quiescent());
    }
}
