//! Embed Bridge - host-side bridge to a native text-embedding engine
//!
//! The engine is any library exposing the C ABI described in [`native`]; it is
//! handed to the bridge as a [`NativeApi`] function table. The bridge moves
//! requests and results across that boundary:
//!
//! - **Records**: fixed-layout `#[repr(C)]` records, copied into owned values
//! - **Ownership**: every engine allocation is freed exactly once, on every path
//! - **Calls**: blocking one-shot calls, async calls on a worker pool with
//!   cooperative cancellation, and streaming directory calls as a `Stream`
//! - **Errors**: tagged engine signals parsed into one closed [`BridgeError`]
//!
//! # Example
//!
//! ```ignore
//! use embed_bridge::{loopback, DirectoryRequest, Engine, EngineConfig};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open(loopback::api(), &EngineConfig::for_model("loopback/demo"))?;
//!
//!     let query = engine.embed_text("greeting")?;
//!     println!("Embedding dimension: {}", query.dimension());
//!
//!     let mut stream = engine.start_streaming(DirectoryRequest::new("./notes"), engine.chunk_config())?;
//!     while let Some(item) = stream.next().await {
//!         match item {
//!             Ok(embedding) => println!("{:?}", embedding.metadata),
//!             Err(err) => eprintln!("skipped: {err}"),
//!         }
//!     }
//!
//!     engine.dispose();
//!     Ok(())
//! }
//! ```
pub mod config;
pub mod engine;
pub mod error;
pub mod native;
pub mod ownership;
pub mod records;
pub mod registry;
mod runtime;
pub mod streaming;
pub mod sync_bridge;

#[cfg(feature = "loopback-engine")]
pub mod loopback;

// Re-export main types
pub use config::{ChunkConfig, EngineConfig};
pub use engine::Engine;
pub use error::{parse_signal, BridgeError, ErrorKind, Result};
pub use native::{BatchCallback, ComputeDevice, Dtype, NativeApi, RawSession};
pub use records::{ChunkConfigRecord, Embedding, EmbeddingBatchRecord, EmbeddingRecord};
pub use registry::{AsyncOperationHandle, OperationId, OperationRegistry, OperationState};
pub use streaming::{DirectoryRequest, EmbeddingStream, StreamState};
pub use sync_bridge::{Request, Response};
