//! Streaming callback bridge
//!
//! A directory request makes the engine call back once per produced batch,
//! from a thread the engine owns. The callback ([`deliver_batch`]) does as
//! little as possible: it adopts the batch, copies a borrowed error string,
//! and pushes an event into a bounded channel of capacity 1. A batch callback
//! returns only once the consumer has received its batch, so the host never
//! holds more than the batch being read plus one queued behind it.
//!
//! The consumer side is [`EmbeddingStream`], a `futures::Stream` that
//! materializes one record at a time on the consumer's task.
//!
//! ## Teardown
//!
//! Closing (explicitly or by drop) deregisters the trampoline, cancels its
//! token so a blocked callback wakes up, closes the channel and frees every
//! batch still buffered. Callbacks arriving afterwards free their batch and
//! return `false` so the engine stops producing.

use crate::config::ChunkConfig;
use crate::error::{parse_signal, BridgeError, Result};
use crate::native::NativeSession;
use crate::ownership::{CStringArray, FreeFn, Transferred};
use crate::records::{allocate_config, read_batch_item, read_c_string, Embedding, EmbeddingBatchRecord};
use crate::registry::{Cancellable, OperationId, OperationRegistry, OperationState};
use crate::sync_bridge::path_c_string;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OPERATION: &str = "embed_directory";

/// One batch may be queued while the consumer works through another
const CHANNEL_CAPACITY: usize = 1;

/// Input of a streaming directory call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRequest {
    /// Directory walked by the engine
    pub root: PathBuf,
    /// Only files with these extensions are processed (`None` = engine default)
    pub extensions: Option<Vec<String>>,
}

impl DirectoryRequest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: None,
        }
    }

    /// Restrict the walk to the given extensions (without the leading dot)
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }
}

/// Lifecycle of a streaming sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Registered,
    Emitting,
    Completed,
    Cancelled,
    FailedFatal,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Cancelled | StreamState::FailedFatal
        )
    }
}

/// What the engine side hands to the consumer
enum StreamEvent {
    Batch(Transferred<EmbeddingBatchRecord>),
    ItemFailed(BridgeError),
    Finished,
    Failed(BridgeError),
}

/// Engine-side state of one streaming call, reached through `user_data`
struct Trampoline {
    id: OperationId,
    registered: AtomicBool,
    externally_cancelled: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    token: CancellationToken,
    free_batch: FreeFn<EmbeddingBatchRecord>,
}

impl Trampoline {
    fn sender(&self) -> Option<mpsc::Sender<StreamEvent>> {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    fn is_externally_cancelled(&self) -> bool {
        self.externally_cancelled.load(Ordering::Acquire)
    }

    /// Hand an event to the consumer, blocking the engine thread until the
    /// consumer has taken it. Returns false if the consumer is gone; an event
    /// that was never queued is then dropped, which frees any batch it carries.
    fn push(&self, event: StreamEvent) -> bool {
        if !self.is_registered() {
            return false;
        }
        let Some(sender) = self.sender() else {
            return false;
        };
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => false,
                taken = hand_off(&sender, event) => taken,
            }
        })
    }

    /// Deliver the terminal event and drop the engine's end of the channel
    fn finish(&self, event: StreamEvent) {
        self.push(event);
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    /// Consumer-initiated teardown
    fn deregister(&self) {
        self.registered.store(false, Ordering::Release);
        self.token.cancel();
    }
}

/// Queue `event`; for a batch, hold the callback until the consumer has
/// received it.
///
/// The engine cannot transfer the next batch while this callback is running,
/// so the host holds at most the batch under the consumer's cursor plus one
/// queued batch.
async fn hand_off(sender: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    let Ok(permit) = sender.reserve().await else {
        return false;
    };
    let holds_batch = matches!(event, StreamEvent::Batch(_));
    permit.send(event);
    !holds_batch || sender.reserve().await.is_ok()
}

impl Cancellable for Trampoline {
    fn cancel(&self) -> bool {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.externally_cancelled.store(true, Ordering::Release);
        self.token.cancel();
        true
    }

    fn state(&self) -> OperationState {
        if self.is_externally_cancelled() {
            OperationState::Cancelled
        } else if self.is_registered() {
            OperationState::Pending
        } else {
            OperationState::Completed
        }
    }
}

/// Callback handed to `embed_directory`.
///
/// # Safety
///
/// `user_data` must be the `Trampoline` pointer passed by [`start`], kept
/// alive by the worker for the duration of the native call.
unsafe extern "C" fn deliver_batch(
    user_data: *mut c_void,
    batch: *mut EmbeddingBatchRecord,
    error: *const c_char,
) -> bool {
    if user_data.is_null() {
        return false;
    }
    let trampoline = &*(user_data as *const Trampoline);

    // Adopt before anything else so the batch is freed on every path below
    let adopted = Transferred::adopt(batch, trampoline.free_batch);

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let event = match (adopted, error.is_null()) {
            (Some(batch), true) => StreamEvent::Batch(batch),
            (None, false) => match read_c_string(error) {
                Ok(signal) => StreamEvent::ItemFailed(parse_signal(&signal)),
                Err(err) => StreamEvent::Failed(err),
            },
            (Some(_both), false) => StreamEvent::Failed(BridgeError::contract_violation(
                "callback received both a batch and an error",
            )),
            (None, true) => StreamEvent::Failed(BridgeError::contract_violation(
                "callback received neither a batch nor an error",
            )),
        };
        let stop = matches!(event, StreamEvent::Failed(_));
        trampoline.push(event) && !stop
    }));

    outcome.unwrap_or_else(|_| {
        tracing::error!(operation_id = trampoline.id, "streaming callback panicked");
        false
    })
}

/// Register a streaming call and start it on a blocking worker
pub(crate) fn start(
    session: Arc<NativeSession>,
    registry: Arc<OperationRegistry>,
    request: DirectoryRequest,
    config: &ChunkConfig,
    handle: &Handle,
) -> Result<EmbeddingStream> {
    // Marshal up front so bad input fails before anything is registered
    let root = path_c_string(&request.root)?;
    let extensions = match &request.extensions {
        Some(extensions) => CStringArray::from_strs("extensions", extensions.as_slice())?,
        None => Vec::new(),
    };

    let id = registry.allocate_id();
    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let token = CancellationToken::new();
    let trampoline = Arc::new(Trampoline {
        id,
        registered: AtomicBool::new(true),
        externally_cancelled: AtomicBool::new(false),
        sender: Mutex::new(Some(sender)),
        token: token.clone(),
        free_batch: session.api().free_batch,
    });

    let mut stream = EmbeddingStream::new(id, trampoline.clone(), receiver, registry.clone());
    registry.register(id, trampoline.clone());
    stream.state = StreamState::Registered;
    tracing::debug!(
        operation_id = id,
        root = %request.root.display(),
        model_id = %session.model_id(),
        "streaming request registered"
    );

    let config = *config;
    let _worker = handle.spawn_blocking(move || run_directory(session, trampoline, root, extensions, config));

    Ok(stream)
}

fn run_directory(
    session: Arc<NativeSession>,
    trampoline: Arc<Trampoline>,
    root: CString,
    extensions: Vec<CString>,
    config: ChunkConfig,
) {
    let api = *session.api();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let config = allocate_config(&config);
        let extensions = CStringArray::new(extensions);
        let status = unsafe {
            (api.embed_directory)(
                session.as_ptr(),
                config.as_ptr(),
                root.as_ptr(),
                extensions.as_ptr(),
                extensions.len(),
                deliver_batch,
                Arc::as_ptr(&trampoline) as *mut c_void,
            )
        };
        drop(config);

        if status == 0 {
            StreamEvent::Finished
        } else {
            StreamEvent::Failed(api.take_error(OPERATION))
        }
    }));

    let terminal = outcome.unwrap_or_else(|_| {
        StreamEvent::Failed(BridgeError::engine_call_failed(OPERATION, "native call panicked"))
    });
    if let StreamEvent::Failed(err) = &terminal {
        if !trampoline.is_registered() {
            tracing::debug!(operation_id = trampoline.id, error = %err, "stream already closed");
        }
    }
    trampoline.finish(terminal);
}

/// Materialization cursor over the batch currently being emitted
struct Cursor {
    batch: Transferred<EmbeddingBatchRecord>,
    next: usize,
}

/// Stream of embeddings produced by a directory request
///
/// Yields `Ok` per record and `Err` per failed file; the sequence continues
/// after per-item errors. A request-level failure yields exactly one `Err`
/// and ends the sequence. Dropping the stream closes it.
pub struct EmbeddingStream {
    id: OperationId,
    state: StreamState,
    trampoline: Arc<Trampoline>,
    receiver: mpsc::Receiver<StreamEvent>,
    cursor: Option<Cursor>,
    cancelled: Option<BoxFuture<'static, ()>>,
    registry: Arc<OperationRegistry>,
}

impl EmbeddingStream {
    fn new(
        id: OperationId,
        trampoline: Arc<Trampoline>,
        receiver: mpsc::Receiver<StreamEvent>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        let token = trampoline.token.clone();
        Self {
            id,
            state: StreamState::Idle,
            trampoline,
            receiver,
            cursor: None,
            cancelled: Some(Box::pin(async move { token.cancelled().await })),
            registry,
        }
    }

    /// Registry id; pass to `Engine::cancel` to cancel from elsewhere
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Stop the stream and free everything still buffered. Idempotent.
    pub fn close(&mut self) {
        self.terminate(StreamState::Cancelled);
    }

    /// Teardown; runs once, whatever the terminal state
    fn terminate(&mut self, state: StreamState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        self.trampoline.deregister();
        self.cursor = None;
        self.receiver.close();
        let mut drained = 0usize;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        self.registry.deregister(self.id);
        tracing::debug!(
            operation_id = self.id,
            state = ?state,
            drained,
            "stream terminated"
        );
    }

    fn cancelled_outcome(&mut self) -> Poll<Option<Result<Embedding>>> {
        self.terminate(StreamState::Cancelled);
        Poll::Ready(Some(Err(BridgeError::cancelled(OPERATION))))
    }

    /// Next record of the current batch, freeing the batch once exhausted
    fn next_from_cursor(&mut self) -> Option<Result<Embedding>> {
        let cursor = self.cursor.as_mut()?;
        let count = cursor.batch.record().count;
        if cursor.next >= count {
            self.cursor = None;
            return None;
        }
        let item = unsafe { read_batch_item(cursor.batch.record(), cursor.next) };
        cursor.next += 1;
        if cursor.next >= count {
            self.cursor = None;
        }
        if let Err(err) = &item {
            tracing::error!(operation_id = self.id, error = %err, "malformed record in stream");
            self.terminate(StreamState::FailedFatal);
        }
        Some(item)
    }
}

impl Stream for EmbeddingStream {
    type Item = Result<Embedding>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.state.is_terminal() {
                return Poll::Ready(None);
            }
            if this.trampoline.is_externally_cancelled() {
                return this.cancelled_outcome();
            }
            if let Some(item) = this.next_from_cursor() {
                return Poll::Ready(Some(item));
            }
            if let Some(cancelled) = this.cancelled.as_mut() {
                if cancelled.poll_unpin(cx).is_ready() {
                    this.cancelled = None;
                    if this.trampoline.is_externally_cancelled() {
                        return this.cancelled_outcome();
                    }
                }
            }

            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Batch(batch))) => {
                    this.state = StreamState::Emitting;
                    this.cursor = Some(Cursor { batch, next: 0 });
                }
                Poll::Ready(Some(StreamEvent::ItemFailed(err))) => {
                    this.state = StreamState::Emitting;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(StreamEvent::Finished)) => {
                    this.terminate(StreamState::Completed);
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(StreamEvent::Failed(err))) => {
                    if err.is_fatal() {
                        tracing::error!(operation_id = this.id, error = %err, "stream aborted");
                    }
                    this.terminate(StreamState::FailedFatal);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    if this.trampoline.is_externally_cancelled() {
                        return this.cancelled_outcome();
                    }
                    this.terminate(StreamState::FailedFatal);
                    return Poll::Ready(Some(Err(BridgeError::engine_call_failed(
                        OPERATION,
                        "worker exited without a terminal event",
                    ))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for EmbeddingStream {
    fn drop(&mut self) {
        self.terminate(StreamState::Cancelled);
    }
}

impl std::fmt::Debug for EmbeddingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "loopback-engine"))]
mod tests {
    use super::*;
    use crate::loopback;
    use crate::native::Dtype;
    use futures::StreamExt;
    use std::ptr::NonNull;
    use std::time::Duration;

    fn open_session(model_id: &str) -> Arc<NativeSession> {
        let api = loopback::api();
        let model = CString::new(model_id).unwrap();
        let raw = unsafe { (api.load_model)(model.as_ptr(), std::ptr::null(), Dtype::Default.as_raw()) };
        Arc::new(NativeSession::new(api, NonNull::new(raw).unwrap(), model_id.to_string()))
    }

    fn write_words(dir: &std::path::Path, name: &str, words: usize) {
        let text = (0..words).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        std::fs::write(dir.join(name), text).unwrap();
    }

    fn small_chunks() -> ChunkConfig {
        ChunkConfig {
            chunk_size: 4,
            batch_size: 2,
            ..ChunkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_stream_emits_items_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        write_words(dir.path(), "a.txt", 8);
        let registry = Arc::new(OperationRegistry::new());

        let mut stream = start(
            open_session("loopback/stream-basic"),
            registry.clone(),
            DirectoryRequest::new(dir.path()),
            &small_chunks(),
            &Handle::current(),
        )
        .unwrap();
        assert_eq!(stream.state(), StreamState::Registered);
        assert_eq!(registry.len(), 1);

        let items: Vec<_> = (&mut stream).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.is_ok()));
        assert_eq!(stream.state(), StreamState::Completed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_yields_single_error() {
        let registry = Arc::new(OperationRegistry::new());
        let stream = start(
            open_session("loopback/stream-missing"),
            registry,
            DirectoryRequest::new("/definitely/not/here"),
            &ChunkConfig::default(),
            &Handle::current(),
        )
        .unwrap();

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap_err().kind(),
            crate::ErrorKind::FileNotFound
        );
    }

    #[tokio::test]
    async fn test_external_cancel_ends_with_one_cancelled_error() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            write_words(dir.path(), &format!("f{i}.txt"), 8);
        }
        let registry = Arc::new(OperationRegistry::new());
        let mut stream = start(
            open_session("loopback/stream-cancel"),
            registry.clone(),
            DirectoryRequest::new(dir.path()),
            &small_chunks(),
            &Handle::current(),
        )
        .unwrap();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(registry.cancel(stream.id()));

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), StreamState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_host_holds_at_most_two_batches() {
        let model = "loopback/stream-read-ahead";
        let dir = tempfile::tempdir().unwrap();
        write_words(dir.path(), "a.txt", 12);
        let registry = Arc::new(OperationRegistry::new());
        let config = ChunkConfig {
            chunk_size: 1,
            batch_size: 2,
            ..ChunkConfig::default()
        };
        let mut stream = start(
            open_session(model),
            registry,
            DirectoryRequest::new(dir.path()),
            &config,
            &Handle::current(),
        )
        .unwrap();

        // The first batch stays under the cursor with one record unread
        assert!(stream.next().await.unwrap().is_ok());
        // Give the engine thread time to run ahead as far as it can
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = loopback::allocation_stats(model);
        assert_eq!(stats.live(), 2, "cursor batch plus one queued batch");

        let mut rest = 0;
        while let Some(item) = stream.next().await {
            assert!(item.is_ok());
            rest += 1;
        }
        assert_eq!(rest, 11);
        assert_eq!(stream.state(), StreamState::Completed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_frees_buffered_batches() {
        let model = "loopback/stream-close";
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_words(dir.path(), &format!("f{i}.txt"), 8);
        }
        let registry = Arc::new(OperationRegistry::new());
        let mut stream = start(
            open_session(model),
            registry.clone(),
            DirectoryRequest::new(dir.path()),
            &small_chunks(),
            &Handle::current(),
        )
        .unwrap();

        assert!(stream.next().await.unwrap().is_ok());
        stream.close();
        stream.close();
        assert!(stream.next().await.is_none());
        assert!(registry.is_empty());

        // The engine thread notices the closed stream and stops
        let stats = loopback::wait_for_quiescence(model, Duration::from_secs(5));
        assert_eq!(stats.allocated, stats.freed);
        assert_eq!(stats.invalid_frees, 0);
    }
}
