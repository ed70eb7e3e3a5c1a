//! Worker context for blocking native calls
//!
//! Async wrappers push native calls onto tokio's blocking pool. Inside a tokio
//! context the caller's runtime is used; otherwise a single process-wide
//! worker runtime is built on first use and shared by every engine.

use crate::error::{BridgeError, Result};
use std::sync::OnceLock;
use tokio::runtime::{Builder, Handle, Runtime};

/// Process-wide fallback runtime for callers outside a tokio context
static WORKER_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Handle of the runtime that should host blocking native calls
pub(crate) fn worker_handle() -> Result<Handle> {
    if let Ok(handle) = Handle::try_current() {
        return Ok(handle);
    }

    // Try to get existing runtime first
    if let Some(runtime) = WORKER_RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("embed-bridge-worker")
        .enable_all()
        .build()
        .map_err(|e| BridgeError::engine_call_failed("worker_runtime", e.to_string()))?;

    // Another thread may have won the race; its runtime is kept and ours dropped
    let runtime = WORKER_RUNTIME.get_or_init(|| {
        tracing::debug!("started process-wide worker runtime");
        runtime
    });
    Ok(runtime.handle().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::RuntimeFlavor;

    #[test]
    fn test_fallback_runtime_is_shared() {
        let first = worker_handle().unwrap();
        let second = worker_handle().unwrap();
        assert_eq!(first.runtime_flavor(), RuntimeFlavor::MultiThread);

        let value = first.block_on(async { second.spawn_blocking(|| 21 * 2).await.unwrap() });
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_current_runtime_is_preferred() {
        // #[tokio::test] runs on a current-thread runtime
        let handle = worker_handle().unwrap();
        assert_eq!(handle.runtime_flavor(), RuntimeFlavor::CurrentThread);
        assert_eq!(handle.spawn_blocking(|| 7).await.unwrap(), 7);
    }
}
