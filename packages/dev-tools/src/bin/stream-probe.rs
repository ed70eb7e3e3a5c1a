//! Streaming probe for the loopback engine
//!
//! Opens a loopback model, streams a directory through the bridge and prints
//! one line per item, then reports the engine's allocation ledger. Useful for
//! watching the bridge's lifecycle logs end to end.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-probe -- ./notes
//!
//! # Stop after 5 items to exercise early close
//! PROBE_LIMIT=5 RUST_LOG=embed_bridge=debug cargo run --bin stream-probe -- ./notes
//! ```
//!
//! The model defaults to `loopback/probe` and can be overridden with
//! `EMBED_BRIDGE_MODEL`. `PROBE_EXTENSIONS` takes a comma-separated filter.

use embed_bridge::{loopback, DirectoryRequest, Engine, EngineConfig};
use futures::StreamExt;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let root = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: stream-probe <directory>"))?;
    let limit = match std::env::var("PROBE_LIMIT") {
        Ok(value) => Some(value.parse::<usize>()?),
        Err(_) => None,
    };

    let config = EngineConfig::for_model("loopback/probe").with_env()?;
    let model_id = config.model_id.clone();
    let engine = Engine::open_async(loopback::api(), config).await?;
    tracing::info!(model_id = %model_id, device = ?engine.active_device()?, "engine ready");

    let mut request = DirectoryRequest::new(&root);
    if let Ok(extensions) = std::env::var("PROBE_EXTENSIONS") {
        request = request.with_extensions(extensions.split(',').map(str::trim));
    }

    let mut stream = engine.start_streaming(request, engine.chunk_config())?;
    let (mut items, mut errors) = (0usize, 0usize);
    while let Some(item) = stream.next().await {
        match item {
            Ok(embedding) => {
                items += 1;
                let metadata = serde_json::to_string(&embedding.metadata)?;
                println!("✅ {} dims {}", embedding.dimension(), metadata);
            }
            Err(err) => {
                errors += 1;
                println!("❌ {err}");
            }
        }
        if limit.is_some_and(|limit| items + errors >= limit) {
            println!("⏹️  closing stream after {} events", items + errors);
            stream.close();
        }
    }
    drop(stream);
    engine.dispose();

    let stats = tokio::task::spawn_blocking(move || {
        loopback::wait_for_quiescence(&model_id, Duration::from_secs(5))
    })
    .await?;
    println!("📊 {items} items, {errors} errors");
    println!(
        "📊 allocated {} / freed {}, signals {} / {}, invalid frees {}",
        stats.allocated,
        stats.freed,
        stats.signals_allocated,
        stats.signals_freed,
        stats.invalid_frees
    );

    if !stats.is_quiescent() {
        anyhow::bail!("engine still holds {} live allocations", stats.live());
    }
    Ok(())
}
