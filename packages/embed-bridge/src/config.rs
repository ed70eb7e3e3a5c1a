//! Configuration for the native engine session and per-call chunking
use crate::error::{BridgeError, Result};
use crate::native::Dtype;
use serde::{Deserialize, Serialize};

/// Environment variable overriding [`EngineConfig::model_id`]
pub const MODEL_ENV: &str = "EMBED_BRIDGE_MODEL";
/// Environment variable overriding [`EngineConfig::revision`]
pub const REVISION_ENV: &str = "EMBED_BRIDGE_REVISION";
/// Environment variable overriding [`EngineConfig::dtype`] (`f32`, `f16`, `default`)
pub const DTYPE_ENV: &str = "EMBED_BRIDGE_DTYPE";

/// Chunking parameters sent to the engine with every call
///
/// Converted into a fresh `ChunkConfigRecord` for each native invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Target chunk length, in the engine's units (words for most engines)
    pub chunk_size: u32,

    /// Fraction of each chunk repeated at the start of the next one
    pub overlap_ratio: f32,

    /// Number of chunks embedded together
    pub batch_size: u32,

    /// Number of chunks the engine may hold before flushing a batch
    pub buffer_size: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap_ratio: 0.0,
            batch_size: 32,
            buffer_size: 100,
        }
    }
}

impl ChunkConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(BridgeError::invalid_configuration(
                "chunk_size",
                "must be greater than 0",
            ));
        }

        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return Err(BridgeError::invalid_configuration(
                "overlap_ratio",
                format!("must be in [0.0, 1.0), got {}", self.overlap_ratio),
            ));
        }

        if self.batch_size == 0 {
            return Err(BridgeError::invalid_configuration(
                "batch_size",
                "must be greater than 0",
            ));
        }

        if self.buffer_size == 0 {
            return Err(BridgeError::invalid_configuration(
                "buffer_size",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Configuration for opening an engine session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model identifier understood by the engine (e.g. a HuggingFace repo id)
    pub model_id: String,

    /// Model revision, or `None` for the engine's default
    pub revision: Option<String>,

    /// Weight data type
    pub dtype: Dtype,

    /// Default chunking parameters for calls made through this session
    pub chunk: ChunkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            revision: None,
            dtype: Dtype::Default,
            chunk: ChunkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration for the given model with default settings
    pub fn for_model(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    /// Default configuration with `EMBED_BRIDGE_*` environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay `EMBED_BRIDGE_*` environment variables onto this configuration
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(model_id) = std::env::var(MODEL_ENV) {
            self.model_id = model_id;
        }
        if let Ok(revision) = std::env::var(REVISION_ENV) {
            self.revision = (!revision.is_empty()).then_some(revision);
        }
        if let Ok(dtype) = std::env::var(DTYPE_ENV) {
            self.dtype = dtype.parse()?;
        }
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(BridgeError::invalid_configuration(
                "model_id",
                "cannot be empty",
            ));
        }

        if matches!(&self.revision, Some(revision) if revision.trim().is_empty()) {
            return Err(BridgeError::invalid_configuration(
                "revision",
                "cannot be blank when set",
            ));
        }

        self.chunk.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.model_id, "sentence-transformers/all-MiniLM-L6-v2");
        assert_eq!(config.revision, None);
        assert_eq!(config.dtype, Dtype::Default);
        assert_eq!(config.chunk.chunk_size, 1000);
        assert_eq!(config.chunk.batch_size, 32);
        assert_eq!(config.chunk.buffer_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_config_validation() {
        let mut chunk = ChunkConfig::default();

        // Valid config
        assert!(chunk.validate().is_ok());

        // Invalid: zero chunk size
        chunk.chunk_size = 0;
        let err = chunk.validate().unwrap_err();
        assert_eq!(
            err,
            BridgeError::invalid_configuration("chunk_size", "must be greater than 0")
        );

        // Invalid: zero batch size
        chunk.chunk_size = 200;
        chunk.batch_size = 0;
        assert!(chunk.validate().is_err());

        // Invalid: overlap of a whole chunk
        chunk.batch_size = 8;
        chunk.overlap_ratio = 1.0;
        assert!(chunk.validate().is_err());

        // Invalid: negative overlap
        chunk.overlap_ratio = -0.1;
        assert!(chunk.validate().is_err());

        // Invalid: zero buffer
        chunk.overlap_ratio = 0.25;
        chunk.buffer_size = 0;
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_engine_config_validation() {
        let mut config = EngineConfig::for_model("loopback/test");
        assert!(config.validate().is_ok());

        config.model_id = "   ".to_string();
        assert!(config.validate().is_err());

        config.model_id = "loopback/test".to_string();
        config.revision = Some(String::new());
        assert!(config.validate().is_err());
    }

    // Only test touching the process environment
    #[test]
    fn test_env_overrides() {
        std::env::set_var(MODEL_ENV, "loopback/from-env");
        std::env::set_var(REVISION_ENV, "");
        std::env::set_var(DTYPE_ENV, "F32");
        let config = EngineConfig::for_model("loopback/base").with_env().unwrap();
        assert_eq!(config.model_id, "loopback/from-env");
        assert_eq!(config.revision, None);
        assert_eq!(config.dtype, Dtype::F32);

        std::env::set_var(DTYPE_ENV, "int8");
        let err = EngineConfig::from_env().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidConfiguration);

        std::env::remove_var(MODEL_ENV);
        std::env::remove_var(REVISION_ENV);
        std::env::remove_var(DTYPE_ENV);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"model_id": "loopback/json", "dtype": "f16", "chunk": {"chunk_size": 64}}"#,
        )
        .unwrap();
        assert_eq!(config.model_id, "loopback/json");
        assert_eq!(config.dtype, Dtype::F16);
        assert_eq!(config.chunk.chunk_size, 64);
        assert_eq!(config.chunk.batch_size, 32);
    }
}
