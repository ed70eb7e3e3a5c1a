//! In-process reference engine implementing the native ABI
//!
//! Serves models named `loopback/<name>[@<dimension>]` and produces
//! deterministic, L2-normalized vectors from a hash of the input. Marker texts
//! inject failures so callers can exercise every error path:
//!
//! - `[[fail]]` fails the call with `EMBEDDING_FAILED`
//! - `[[multi]]` fails the call with `MULTI_VECTOR`
//! - `[[malformed]]` produces a record with a null vector and nonzero length
//! - `[[slow]]` delays the call, which leaves room to cancel it
//!
//! Every allocation handed out is recorded in a ledger keyed by model id, so
//! tests can check that each one comes back exactly once. Frees of unknown
//! pointers are counted and ignored rather than performed.

use crate::native::{BatchCallback, NativeApi, RawSession};
use crate::records::{ChunkConfigRecord, EmbeddingBatchRecord, EmbeddingRecord};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::hash::{Hash, Hasher};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Prefix of every model id this engine serves
pub const MODEL_PREFIX: &str = "loopback/";

/// Vector dimension when the model id does not specify one
pub const DEFAULT_DIMENSION: usize = 8;

/// File extensions the engine can chunk
pub const SUPPORTED_EXTENSIONS: [&str; 2] = ["txt", "md"];

const FAIL_MARKER: &str = "[[fail]]";
const MULTI_MARKER: &str = "[[multi]]";
const MALFORMED_MARKER: &str = "[[malformed]]";
const SLOW_MARKER: &str = "[[slow]]";
const SLOW_DELAY: Duration = Duration::from_millis(200);

/// Function table of the loopback engine
pub fn api() -> NativeApi {
    NativeApi {
        load_model: lb_load_model,
        free_session: lb_free_session,
        embed_text: lb_embed_text,
        embed_batch: lb_embed_batch,
        embed_file: lb_embed_file,
        embed_directory: lb_embed_directory,
        free_embedding: lb_free_embedding,
        free_batch: lb_free_batch,
        last_error: lb_last_error,
        free_error: lb_free_error,
        active_device: lb_active_device,
        device_available: lb_device_available,
    }
}

/// Per-model allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Records and batches handed to the host
    pub allocated: usize,
    /// Records and batches returned through their free function
    pub freed: usize,
    /// Frees of pointers that were not live allocations of the expected kind
    pub invalid_frees: usize,
    pub signals_allocated: usize,
    pub signals_freed: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    /// Embed calls that reached the engine
    pub calls: usize,
}

impl AllocationStats {
    /// Allocations (records, batches and error signals) not yet freed
    pub fn live(&self) -> usize {
        self.allocated.saturating_sub(self.freed)
            + self.signals_allocated.saturating_sub(self.signals_freed)
    }

    /// No live allocation and no open session
    pub fn is_quiescent(&self) -> bool {
        self.live() == 0 && self.sessions_opened == self.sessions_closed
    }
}

/// Snapshot of the counters for one model id
pub fn allocation_stats(model_id: &str) -> AllocationStats {
    ledger().stats.get(model_id).copied().unwrap_or_default()
}

/// Frees of pointers the engine never handed out, across all models
pub fn unknown_frees() -> usize {
    ledger().unknown_frees
}

/// Poll the counters of `model_id` until every session is closed and every
/// allocation is freed, or `timeout` elapses. Returns the last snapshot.
pub fn wait_for_quiescence(model_id: &str, timeout: Duration) -> AllocationStats {
    let deadline = Instant::now() + timeout;
    loop {
        let stats = allocation_stats(model_id);
        if stats.is_quiescent() || Instant::now() >= deadline {
            return stats;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    Record,
    Batch,
    Signal,
    Session,
}

#[derive(Default)]
struct Ledger {
    owners: HashMap<usize, (String, Allocation)>,
    stats: HashMap<String, AllocationStats>,
    unknown_frees: usize,
}

static LEDGER: OnceLock<Mutex<Ledger>> = OnceLock::new();

fn ledger() -> MutexGuard<'static, Ledger> {
    LEDGER
        .get_or_init(|| Mutex::new(Ledger::default()))
        .lock()
        .unwrap_or_else(|p| p.into_inner())
}

fn track(address: usize, model: &str, kind: Allocation) {
    let mut ledger = ledger();
    ledger.owners.insert(address, (model.to_string(), kind));
    let stats = ledger.stats.entry(model.to_string()).or_default();
    match kind {
        Allocation::Record | Allocation::Batch => stats.allocated += 1,
        Allocation::Signal => stats.signals_allocated += 1,
        Allocation::Session => stats.sessions_opened += 1,
    }
}

/// Remove a live allocation. Returns false (and counts the attempt) if
/// `address` is not a live allocation of `kind`, in which case nothing may
/// be freed.
fn untrack(address: usize, kind: Allocation) -> bool {
    let mut ledger = ledger();
    match ledger.owners.get(&address).cloned() {
        Some((model, owned_kind)) if owned_kind == kind => {
            ledger.owners.remove(&address);
            let stats = ledger.stats.entry(model).or_default();
            match kind {
                Allocation::Record | Allocation::Batch => stats.freed += 1,
                Allocation::Signal => stats.signals_freed += 1,
                Allocation::Session => stats.sessions_closed += 1,
            }
            true
        }
        Some((model, _)) => {
            ledger.stats.entry(model).or_default().invalid_frees += 1;
            false
        }
        None => {
            ledger.unknown_frees += 1;
            false
        }
    }
}

fn count_call(model: &str) {
    ledger().stats.entry(model.to_string()).or_default().calls += 1;
}

thread_local! {
    /// Pending error signal of the last failed call on this thread
    static LAST_ERROR: RefCell<Option<(String, String)>> = const { RefCell::new(None) };
}

fn set_error(model: &str, signal: impl Into<String>) {
    let signal = signal.into();
    tracing::debug!(model_id = model, signal = %signal, "loopback call failed");
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some((model.to_string(), signal)));
}

struct LoopbackSession {
    model_id: String,
    dimension: usize,
}

/// Parse `loopback/<name>[@<dimension>]`
fn parse_model_id(model_id: &str) -> Option<usize> {
    let name = model_id.strip_prefix(MODEL_PREFIX)?;
    match name.rsplit_once('@') {
        Some((base, dimension)) if !base.is_empty() => {
            dimension.parse().ok().filter(|d: &usize| *d > 0)
        }
        Some(_) => None,
        None if !name.is_empty() => Some(DEFAULT_DIMENSION),
        None => None,
    }
}

unsafe fn session_ref<'a>(session: *const RawSession) -> Option<&'a LoopbackSession> {
    (session as *const LoopbackSession).as_ref()
}

unsafe fn config_ref<'a>(
    model: &str,
    operation: &str,
    config: *const ChunkConfigRecord,
) -> Option<&'a ChunkConfigRecord> {
    let Some(config) = config.as_ref() else {
        set_error(model, format!("FFI_ERROR: {operation}: config pointer is null"));
        return None;
    };
    if config.chunk_size == 0 {
        set_error(model, "INVALID_CONFIG: chunk_size: must be greater than 0");
        return None;
    }
    if config.batch_size == 0 {
        set_error(model, "INVALID_CONFIG: batch_size: must be greater than 0");
        return None;
    }
    Some(config)
}

unsafe fn borrowed_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Deterministic unit vector for `text`
fn embed_words(text: &str, dimension: usize) -> Vec<f32> {
    let raw: Vec<f32> = (0..dimension)
        .map(|component| {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            component.hash(&mut hasher);
            // Map the hash onto [-1.0, 1.0]
            (hasher.finish() % 20_001) as f32 / 10_000.0 - 1.0
        })
        .collect();
    normalize(&raw)
}

fn normalize(input: &[f32]) -> Vec<f32> {
    let magnitude = input
        .iter()
        .fold(0.0f32, |acc, &val| val.mul_add(val, acc))
        .sqrt();

    if magnitude > 0.0 {
        input.iter().map(|&val| val / magnitude).collect()
    } else {
        input.to_vec()
    }
}

/// Owned description of one record before it is laid out for the host
#[derive(Debug)]
struct Chunk {
    text: Option<String>,
    /// `None` lays out a malformed record
    vector: Option<Vec<f32>>,
    metadata: Option<String>,
}

impl Chunk {
    fn for_text(text: &str, dimension: usize) -> Self {
        Self {
            text: Some(text.to_string()),
            vector: (!text.contains(MALFORMED_MARKER)).then(|| embed_words(text, dimension)),
            metadata: None,
        }
    }

    fn into_record(self, dimension: usize) -> EmbeddingRecord {
        let (vector_ptr, vector_len) = match self.vector {
            Some(vector) => {
                let len = vector.len();
                (Box::into_raw(vector.into_boxed_slice()) as *mut f32, len)
            }
            None => (std::ptr::null_mut(), dimension),
        };
        EmbeddingRecord {
            vector_ptr,
            vector_len,
            text_ptr: self.text.map_or(std::ptr::null_mut(), owned_c_string),
            metadata_ptr: self.metadata.map_or(std::ptr::null_mut(), owned_c_string),
        }
    }
}

fn owned_c_string(value: String) -> *mut c_char {
    let value = if value.contains('\0') {
        value.replace('\0', "")
    } else {
        value
    };
    CString::new(value).map_or(std::ptr::null_mut(), CString::into_raw)
}

/// Release the buffers a record points to (not the record itself)
unsafe fn free_record_fields(record: &EmbeddingRecord) {
    if !record.vector_ptr.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            record.vector_ptr,
            record.vector_len,
        )));
    }
    if !record.text_ptr.is_null() {
        drop(CString::from_raw(record.text_ptr));
    }
    if !record.metadata_ptr.is_null() {
        drop(CString::from_raw(record.metadata_ptr));
    }
}

fn allocate_record(model: &str, chunk: Chunk, dimension: usize) -> *mut EmbeddingRecord {
    let record = Box::into_raw(Box::new(chunk.into_record(dimension)));
    track(record as usize, model, Allocation::Record);
    record
}

fn allocate_batch(model: &str, chunks: Vec<Chunk>, dimension: usize) -> *mut EmbeddingBatchRecord {
    let items: Vec<EmbeddingRecord> = chunks
        .into_iter()
        .map(|chunk| chunk.into_record(dimension))
        .collect();
    let count = items.len();
    let items_ptr = if count == 0 {
        std::ptr::null_mut()
    } else {
        Box::into_raw(items.into_boxed_slice()) as *mut EmbeddingRecord
    };
    let batch = Box::into_raw(Box::new(EmbeddingBatchRecord { items_ptr, count }));
    track(batch as usize, model, Allocation::Batch);
    batch
}

/// Shared failure markers; returns the signal to raise, if any
fn injected_failure(text: &str) -> Option<&'static str> {
    if text.contains(FAIL_MARKER) {
        Some("EMBEDDING_FAILED")
    } else if text.contains(MULTI_MARKER) {
        Some("MULTI_VECTOR")
    } else {
        None
    }
}

fn maybe_slow(text: &str) {
    if text.contains(SLOW_MARKER) {
        std::thread::sleep(SLOW_DELAY);
    }
}

/// Split a document into word chunks with `overlap_ratio` overlap
fn chunk_words(content: &str, config: &ChunkConfigRecord) -> Vec<String> {
    let words: Vec<&str> = content.split_whitespace().collect();
    let size = config.chunk_size as usize;
    let overlap = ((size as f32) * config.overlap_ratio.clamp(0.0, 0.99)) as usize;
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Read and chunk one file; `Err` carries the signal for the failure
fn chunk_file(
    session: &LoopbackSession,
    config: &ChunkConfigRecord,
    path: &Path,
) -> Result<Vec<Chunk>, String> {
    let display = path.display();
    if !path.exists() {
        return Err(format!("FILE_NOT_FOUND: {display}"));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(if extension.is_empty() {
            format!("UNSUPPORTED_FORMAT: {display}")
        } else {
            format!("UNSUPPORTED_FORMAT: {extension} for {display}")
        });
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| format!("FILE_READ_ERROR: {display}: {e}"))?;
    if let Some(tag) = injected_failure(&content) {
        return Err(format!("{tag}: {display}: injected failure"));
    }
    maybe_slow(&content);

    let file = path.to_string_lossy().into_owned();
    Ok(chunk_words(&content, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let mut chunk = Chunk::for_text(&text, session.dimension);
            chunk.metadata = Some(
                serde_json::json!({ "file": file, "chunk_index": index }).to_string(),
            );
            chunk
        })
        .collect())
}

/// Sorted recursive listing of the files under `root`
fn walk(root: &Path, extensions: Option<&[String]>) -> std::io::Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    let mut files = Vec::new();
    for path in entries {
        if path.is_dir() {
            files.extend(walk(&path, extensions)?);
            continue;
        }
        let keep = match extensions {
            None => true,
            Some(filter) => path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| filter.iter().any(|f| f.eq_ignore_ascii_case(ext))),
        };
        if keep {
            files.push(path);
        }
    }
    Ok(files)
}

unsafe extern "C" fn lb_load_model(
    model_id: *const c_char,
    revision: *const c_char,
    dtype: i32,
) -> *mut RawSession {
    let Some(model_id) = borrowed_str(model_id) else {
        set_error("", "INVALID_CONFIG: model_id: must be a UTF-8 string");
        return std::ptr::null_mut();
    };
    if !(-1..=1).contains(&dtype) {
        set_error(model_id, format!("INVALID_CONFIG: dtype: invalid value {dtype}"));
        return std::ptr::null_mut();
    }
    let Some(dimension) = parse_model_id(model_id) else {
        set_error(model_id, format!("MODEL_NOT_FOUND: {model_id}"));
        return std::ptr::null_mut();
    };

    let session = Box::into_raw(Box::new(LoopbackSession {
        model_id: model_id.to_string(),
        dimension,
    }));
    track(session as usize, model_id, Allocation::Session);
    tracing::debug!(
        model_id,
        dimension,
        revision = borrowed_str(revision).unwrap_or("default"),
        "loopback model loaded"
    );
    session as *mut RawSession
}

unsafe extern "C" fn lb_free_session(session: *mut RawSession) {
    if session.is_null() {
        return;
    }
    if untrack(session as usize, Allocation::Session) {
        drop(Box::from_raw(session as *mut LoopbackSession));
    }
}

unsafe extern "C" fn lb_embed_text(
    session: *const RawSession,
    config: *const ChunkConfigRecord,
    text: *const c_char,
) -> *mut EmbeddingRecord {
    let Some(session) = session_ref(session) else {
        set_error("", "FFI_ERROR: embed_text: session pointer is null");
        return std::ptr::null_mut();
    };
    let model = session.model_id.as_str();
    count_call(model);
    if config_ref(model, "embed_text", config).is_none() {
        return std::ptr::null_mut();
    }
    let Some(text) = borrowed_str(text) else {
        set_error(model, "FFI_ERROR: embed_text: text pointer is null or not UTF-8");
        return std::ptr::null_mut();
    };

    maybe_slow(text);
    if let Some(tag) = injected_failure(text) {
        set_error(model, format!("{tag}: injected failure for text"));
        return std::ptr::null_mut();
    }
    allocate_record(model, Chunk::for_text(text, session.dimension), session.dimension)
}

unsafe extern "C" fn lb_embed_batch(
    session: *const RawSession,
    config: *const ChunkConfigRecord,
    texts: *const *const c_char,
    count: usize,
) -> *mut EmbeddingBatchRecord {
    let Some(session) = session_ref(session) else {
        set_error("", "FFI_ERROR: embed_batch: session pointer is null");
        return std::ptr::null_mut();
    };
    let model = session.model_id.as_str();
    count_call(model);
    if config_ref(model, "embed_batch", config).is_none() {
        return std::ptr::null_mut();
    }
    if texts.is_null() && count > 0 {
        set_error(model, "FFI_ERROR: embed_batch: texts pointer is null");
        return std::ptr::null_mut();
    }

    let mut inputs = Vec::with_capacity(count);
    for index in 0..count {
        let Some(text) = borrowed_str(*texts.add(index)) else {
            set_error(model, format!("FFI_ERROR: embed_batch: text {index} is null or not UTF-8"));
            return std::ptr::null_mut();
        };
        inputs.push(text);
    }

    if let Some(tag) = inputs.iter().find_map(|text| injected_failure(text)) {
        set_error(
            model,
            format!("{tag}: Batch embedding generation failed for {count} texts: injected failure"),
        );
        return std::ptr::null_mut();
    }
    inputs.iter().for_each(|text| maybe_slow(text));

    let chunks = inputs
        .iter()
        .map(|text| Chunk::for_text(text, session.dimension))
        .collect();
    allocate_batch(model, chunks, session.dimension)
}

unsafe extern "C" fn lb_embed_file(
    session: *const RawSession,
    config: *const ChunkConfigRecord,
    path: *const c_char,
) -> *mut EmbeddingBatchRecord {
    let Some(session) = session_ref(session) else {
        set_error("", "FFI_ERROR: embed_file: session pointer is null");
        return std::ptr::null_mut();
    };
    let model = session.model_id.as_str();
    count_call(model);
    let Some(config) = config_ref(model, "embed_file", config) else {
        return std::ptr::null_mut();
    };
    let Some(path) = borrowed_str(path) else {
        set_error(model, "FFI_ERROR: embed_file: path pointer is null or not UTF-8");
        return std::ptr::null_mut();
    };

    match chunk_file(session, config, Path::new(path)) {
        Ok(chunks) => allocate_batch(model, chunks, session.dimension),
        Err(signal) => {
            set_error(model, signal);
            std::ptr::null_mut()
        }
    }
}

/// `user_data` crosses onto the engine thread untouched
struct UserData(*mut c_void);

// SAFETY: the host guarantees user_data stays valid for the whole call
unsafe impl Send for UserData {}

enum WalkOutcome {
    Completed,
    Stopped,
    Failed(String),
}

unsafe extern "C" fn lb_embed_directory(
    session: *const RawSession,
    config: *const ChunkConfigRecord,
    root: *const c_char,
    extensions: *const *const c_char,
    extension_count: usize,
    callback: BatchCallback,
    user_data: *mut c_void,
) -> i32 {
    let Some(session) = session_ref(session) else {
        set_error("", "FFI_ERROR: embed_directory: session pointer is null");
        return 1;
    };
    let model = session.model_id.as_str();
    count_call(model);
    let Some(config) = config_ref(model, "embed_directory", config).copied() else {
        return 1;
    };
    let Some(root) = borrowed_str(root).map(PathBuf::from) else {
        set_error(model, "FFI_ERROR: embed_directory: root pointer is null or not UTF-8");
        return 1;
    };
    if !root.is_dir() {
        set_error(model, format!("FILE_NOT_FOUND: {}", root.display()));
        return 1;
    }

    let filter = if extensions.is_null() || extension_count == 0 {
        None
    } else {
        let mut filter = Vec::with_capacity(extension_count);
        for index in 0..extension_count {
            if let Some(ext) = borrowed_str(*extensions.add(index)) {
                filter.push(ext.trim_start_matches('.').to_string());
            }
        }
        Some(filter)
    };

    let user_data = UserData(user_data);
    // Batches are produced on an engine-owned thread, like a real engine would
    let joined = std::thread::scope(|scope| {
        scope
            .spawn(move || {
                let user_data = user_data;
                let files = match walk(&root, filter.as_deref()) {
                    Ok(files) => files,
                    Err(e) => {
                        return WalkOutcome::Failed(format!(
                            "FILE_READ_ERROR: {}: {e}",
                            root.display()
                        ))
                    }
                };

                for file in files {
                    match chunk_file(session, &config, &file) {
                        Ok(chunks) => {
                            let mut chunks = chunks.into_iter().peekable();
                            while chunks.peek().is_some() {
                                let group: Vec<Chunk> =
                                    chunks.by_ref().take(config.batch_size as usize).collect();
                                let batch = allocate_batch(model, group, session.dimension);
                                if !callback(user_data.0, batch, std::ptr::null()) {
                                    return WalkOutcome::Stopped;
                                }
                            }
                        }
                        Err(signal) => {
                            let signal = CString::new(signal).unwrap_or_default();
                            if !callback(user_data.0, std::ptr::null_mut(), signal.as_ptr()) {
                                return WalkOutcome::Stopped;
                            }
                        }
                    }
                }
                WalkOutcome::Completed
            })
            .join()
    });

    match joined {
        Ok(WalkOutcome::Completed) => 0,
        Ok(WalkOutcome::Stopped) => {
            set_error(model, "OPERATION_CANCELLED: embed_directory");
            2
        }
        Ok(WalkOutcome::Failed(signal)) => {
            set_error(model, signal);
            1
        }
        Err(_) => {
            set_error(model, "FFI_ERROR: embed_directory: engine thread panicked");
            3
        }
    }
}

unsafe extern "C" fn lb_free_embedding(record: *mut EmbeddingRecord) {
    if record.is_null() {
        return;
    }
    if untrack(record as usize, Allocation::Record) {
        let record = Box::from_raw(record);
        free_record_fields(&record);
    }
}

unsafe extern "C" fn lb_free_batch(batch: *mut EmbeddingBatchRecord) {
    if batch.is_null() {
        return;
    }
    if !untrack(batch as usize, Allocation::Batch) {
        return;
    }
    let batch = Box::from_raw(batch);
    if !batch.items_ptr.is_null() {
        let items = Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            batch.items_ptr,
            batch.count,
        ));
        items.iter().for_each(|record| free_record_fields(record));
    }
}

unsafe extern "C" fn lb_last_error() -> *mut c_char {
    let Some((model, signal)) = LAST_ERROR.with(|slot| slot.borrow_mut().take()) else {
        return std::ptr::null_mut();
    };
    let signal = owned_c_string(signal);
    if !signal.is_null() {
        track(signal as usize, &model, Allocation::Signal);
    }
    signal
}

unsafe extern "C" fn lb_free_error(signal: *mut c_char) {
    if signal.is_null() {
        return;
    }
    if untrack(signal as usize, Allocation::Signal) {
        drop(CString::from_raw(signal));
    }
}

unsafe extern "C" fn lb_active_device() -> i32 {
    0
}

unsafe extern "C" fn lb_device_available(device: i32) -> bool {
    device == 0
}
