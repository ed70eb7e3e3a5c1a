//! Synchronous call bridge
//!
//! One request, one blocking native call, one response. The calling thread is
//! blocked for the duration of the call; async callers go through
//! [`crate::registry`] instead.

use crate::config::ChunkConfig;
use crate::error::{BridgeError, Result};
use crate::native::NativeSession;
use crate::ownership::{c_string, CStringArray, ConfigHandle, Transferred};
use crate::records::{allocate_config, read_batch, read_result, Embedding};
use std::path::PathBuf;

/// Input of a one-shot native call
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Embed a single query text
    Text(String),
    /// Embed several texts in one call
    Batch(Vec<String>),
    /// Chunk and embed one file
    File(PathBuf),
}

impl Request {
    /// Name of the native operation serving this request
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Text(_) => "embed_text",
            Request::Batch(_) => "embed_batch",
            Request::File(_) => "embed_file",
        }
    }
}

/// Output of a one-shot native call
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Single(Embedding),
    Batch(Vec<Embedding>),
}

impl Response {
    /// Flatten into a list of embeddings
    pub fn into_embeddings(self) -> Vec<Embedding> {
        match self {
            Response::Single(embedding) => vec![embedding],
            Response::Batch(embeddings) => embeddings,
        }
    }
}

/// Config and result of one call, released in declaration order
struct CallScope<T> {
    config: ConfigHandle,
    result: Transferred<T>,
}

impl<T> CallScope<T> {
    /// Release the config record, then the result record
    fn release(self) {
        let CallScope { config, result } = self;
        drop(config);
        result.release();
    }
}

/// Perform one blocking native call.
///
/// Never retries. On failure the tagged error signal is fetched on this
/// thread, right after the call, and parsed into a [`BridgeError`].
pub(crate) fn call(
    session: &NativeSession,
    request: &Request,
    config: &ChunkConfig,
) -> Result<Response> {
    let api = session.api();
    let config = allocate_config(config);

    match request {
        Request::Text(text) => {
            let text = c_string("text", text)?;
            let raw = unsafe { (api.embed_text)(session.as_ptr(), config.as_ptr(), text.as_ptr()) };
            // SAFETY: non-null results of embed_text are released by free_embedding
            let Some(result) = (unsafe { Transferred::adopt(raw, api.free_embedding) }) else {
                return Err(api.take_error(request.operation()));
            };
            let scope = CallScope { config, result };
            let embedding = unsafe { read_result(scope.result.record()) };
            scope.release();
            Ok(Response::Single(embedding?))
        }
        Request::Batch(texts) => {
            let texts = CStringArray::new(CStringArray::from_strs("texts", texts.as_slice())?);
            let raw = unsafe {
                (api.embed_batch)(session.as_ptr(), config.as_ptr(), texts.as_ptr(), texts.len())
            };
            let embeddings = read_owned_batch(session, config, raw, request.operation())?;
            Ok(Response::Batch(embeddings))
        }
        Request::File(path) => {
            let path = path_c_string(path)?;
            let raw = unsafe { (api.embed_file)(session.as_ptr(), config.as_ptr(), path.as_ptr()) };
            let embeddings = read_owned_batch(session, config, raw, request.operation())?;
            Ok(Response::Batch(embeddings))
        }
    }
}

fn read_owned_batch(
    session: &NativeSession,
    config: ConfigHandle,
    raw: *mut crate::records::EmbeddingBatchRecord,
    operation: &str,
) -> Result<Vec<Embedding>> {
    let api = session.api();
    // SAFETY: non-null batch results are released by free_batch
    let Some(result) = (unsafe { Transferred::adopt(raw, api.free_batch) }) else {
        return Err(api.take_error(operation));
    };
    let scope = CallScope { config, result };
    let embeddings = unsafe { read_batch(scope.result.record()) };
    scope.release();
    embeddings
}

pub(crate) fn path_c_string(path: &std::path::Path) -> Result<std::ffi::CString> {
    let Some(path_str) = path.to_str() else {
        return Err(BridgeError::invalid_configuration(
            "path",
            format!("{} is not valid UTF-8", path.display()),
        ));
    };
    c_string("path", path_str)
}
