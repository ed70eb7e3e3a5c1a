//! Boundary contract with the native engine
//!
//! The engine is reached only through a [`NativeApi`] function table. Every
//! function follows one of two shapes:
//!
//! - `(session, config, input) -> pointer`, where null means failure and a
//!   tagged error signal is waiting in [`NativeApi::last_error`] on the same thread
//! - `(session, config, input, callback, user_data) -> status`, where the
//!   callback runs zero or more times before the call returns and a nonzero
//!   status is paired with an error signal the same way
//!
//! Pointers returned by the engine are owned by the bridge from that moment
//! on and go back through the paired `free_*` function.

use crate::error::{parse_signal, BridgeError, Result};
use crate::ownership::Transferred;
use crate::records::{read_c_string, ChunkConfigRecord, EmbeddingBatchRecord, EmbeddingRecord};
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::str::FromStr;

/// Opaque engine session, only ever handled by pointer
#[repr(C)]
pub struct RawSession {
    _private: [u8; 0],
}

/// Callback the engine invokes once per produced batch during a streaming call.
///
/// Exactly one of `batch`/`error` is non-null. `batch` is transferred to the
/// callee; `error` is borrowed for the duration of the call. Returning `false`
/// asks the engine to stop producing.
pub type BatchCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    batch: *mut EmbeddingBatchRecord,
    error: *const c_char,
) -> bool;

/// Function table of a native embedding engine
#[derive(Clone, Copy)]
pub struct NativeApi {
    pub load_model:
        unsafe extern "C" fn(model_id: *const c_char, revision: *const c_char, dtype: i32) -> *mut RawSession,
    pub free_session: unsafe extern "C" fn(session: *mut RawSession),
    pub embed_text: unsafe extern "C" fn(
        session: *const RawSession,
        config: *const ChunkConfigRecord,
        text: *const c_char,
    ) -> *mut EmbeddingRecord,
    pub embed_batch: unsafe extern "C" fn(
        session: *const RawSession,
        config: *const ChunkConfigRecord,
        texts: *const *const c_char,
        count: usize,
    ) -> *mut EmbeddingBatchRecord,
    pub embed_file: unsafe extern "C" fn(
        session: *const RawSession,
        config: *const ChunkConfigRecord,
        path: *const c_char,
    ) -> *mut EmbeddingBatchRecord,
    pub embed_directory: unsafe extern "C" fn(
        session: *const RawSession,
        config: *const ChunkConfigRecord,
        root: *const c_char,
        extensions: *const *const c_char,
        extension_count: usize,
        callback: BatchCallback,
        user_data: *mut c_void,
    ) -> i32,
    pub free_embedding: unsafe extern "C" fn(record: *mut EmbeddingRecord),
    pub free_batch: unsafe extern "C" fn(batch: *mut EmbeddingBatchRecord),
    pub last_error: unsafe extern "C" fn() -> *mut c_char,
    pub free_error: unsafe extern "C" fn(signal: *mut c_char),
    pub active_device: unsafe extern "C" fn() -> i32,
    pub device_available: unsafe extern "C" fn(device: i32) -> bool,
}

impl std::fmt::Debug for NativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeApi")
            .field("load_model", &(self.load_model as *const c_void))
            .finish_non_exhaustive()
    }
}

impl NativeApi {
    /// Fetch and parse the pending error signal after a failed call.
    ///
    /// Must run on the thread that made the failed call. A failure without a
    /// signal breaks the contract and is reported as such.
    pub(crate) fn take_error(&self, operation: &str) -> BridgeError {
        let raw = unsafe { (self.last_error)() };
        // SAFETY: last_error hands over a NUL-terminated string freed by free_error
        let Some(signal) = (unsafe { Transferred::adopt(raw, self.free_error) }) else {
            return BridgeError::contract_violation(format!(
                "{operation} failed without an error signal"
            ));
        };
        match unsafe { read_c_string(signal.as_ptr()) } {
            Ok(text) => parse_signal(&text),
            Err(err) => err,
        }
    }
}

/// Owned handle to an open native session.
///
/// Freed exactly once when the last reference drops, which can be after
/// the engine is disposed if a worker is still inside a native call.
pub(crate) struct NativeSession {
    api: NativeApi,
    raw: NonNull<RawSession>,
    model_id: String,
}

// SAFETY: the engine contract allows one session to serve concurrent calls
// from any thread; the bridge never mutates the session itself.
unsafe impl Send for NativeSession {}
unsafe impl Sync for NativeSession {}

impl NativeSession {
    pub(crate) fn new(api: NativeApi, raw: NonNull<RawSession>, model_id: String) -> Self {
        Self { api, raw, model_id }
    }

    pub(crate) fn api(&self) -> &NativeApi {
        &self.api
    }

    pub(crate) fn as_ptr(&self) -> *const RawSession {
        self.raw.as_ptr()
    }

    pub(crate) fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for NativeSession {
    fn drop(&mut self) {
        unsafe { (self.api.free_session)(self.raw.as_ptr()) };
        tracing::debug!(model_id = %self.model_id, "native session released");
    }
}

/// Data type for model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F32,
    F16,
    /// Let the engine pick
    #[default]
    Default,
}

impl Dtype {
    /// Wire value: 0 = F32, 1 = F16, -1 = engine default
    pub fn as_raw(self) -> i32 {
        match self {
            Dtype::F32 => 0,
            Dtype::F16 => 1,
            Dtype::Default => -1,
        }
    }
}

impl FromStr for Dtype {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" => Ok(Dtype::F32),
            "f16" => Ok(Dtype::F16),
            "default" | "" => Ok(Dtype::Default),
            other => Err(BridgeError::invalid_configuration(
                "dtype",
                format!("unknown dtype '{other}'"),
            )),
        }
    }
}

/// Compute device reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ComputeDevice {
    /// CPU computation (always available)
    Cpu = 0,
    /// NVIDIA CUDA GPU
    Cuda = 1,
    /// Apple Metal GPU
    Metal = 2,
}

impl ComputeDevice {
    pub fn from_raw(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ComputeDevice::Cpu),
            1 => Ok(ComputeDevice::Cuda),
            2 => Ok(ComputeDevice::Metal),
            other => Err(BridgeError::contract_violation(format!(
                "unknown compute device code {other}"
            ))),
        }
    }
}
