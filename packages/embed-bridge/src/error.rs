//! Error taxonomy for the native bridge
//!
//! The native engine reports failures as tagged signal strings
//! (`TAG: context`). They are parsed here, once, into [`BridgeError`], a closed
//! set of kinds that every call site can match exhaustively.

use std::path::PathBuf;
use thiserror::Error;

/// Operation name recorded for signals that carry no recognizable tag
pub const UNRECOGNIZED_SIGNAL: &str = "unrecognized_signal";

/// Field-less discriminant of [`BridgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ModelNotFound,
    InvalidConfiguration,
    EmbeddingFailed,
    UnsupportedOutputShape,
    EngineCallFailed,
    FileNotFound,
    UnsupportedFileFormat,
    FileReadFailed,
    OperationCancelled,
    EngineContractViolation,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ModelNotFound,
        ErrorKind::InvalidConfiguration,
        ErrorKind::EmbeddingFailed,
        ErrorKind::UnsupportedOutputShape,
        ErrorKind::EngineCallFailed,
        ErrorKind::FileNotFound,
        ErrorKind::UnsupportedFileFormat,
        ErrorKind::FileReadFailed,
        ErrorKind::OperationCancelled,
        ErrorKind::EngineContractViolation,
    ];

    /// Signal prefix the engine uses for this kind
    pub fn tag(self) -> &'static str {
        match self {
            ErrorKind::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorKind::InvalidConfiguration => "INVALID_CONFIG",
            ErrorKind::EmbeddingFailed => "EMBEDDING_FAILED",
            ErrorKind::UnsupportedOutputShape => "MULTI_VECTOR",
            ErrorKind::EngineCallFailed => "FFI_ERROR",
            ErrorKind::FileNotFound => "FILE_NOT_FOUND",
            ErrorKind::UnsupportedFileFormat => "UNSUPPORTED_FORMAT",
            ErrorKind::FileReadFailed => "FILE_READ_ERROR",
            ErrorKind::OperationCancelled => "OPERATION_CANCELLED",
            ErrorKind::EngineContractViolation => "CONTRACT_VIOLATION",
        }
    }

    /// Resolve a signal prefix, including legacy aliases
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "MODEL_NOT_FOUND" => ErrorKind::ModelNotFound,
            "INVALID_CONFIG" => ErrorKind::InvalidConfiguration,
            "EMBEDDING_FAILED" => ErrorKind::EmbeddingFailed,
            "MULTI_VECTOR" | "MULTI_VECTOR_NOT_SUPPORTED" => ErrorKind::UnsupportedOutputShape,
            "FFI_ERROR" => ErrorKind::EngineCallFailed,
            "FILE_NOT_FOUND" => ErrorKind::FileNotFound,
            "UNSUPPORTED_FORMAT" => ErrorKind::UnsupportedFileFormat,
            "FILE_READ_ERROR" => ErrorKind::FileReadFailed,
            "OPERATION_CANCELLED" => ErrorKind::OperationCancelled,
            "CONTRACT_VIOLATION" => ErrorKind::EngineContractViolation,
            _ => return None,
        };
        Some(kind)
    }
}

/// Typed envelope for every failure that crosses the bridge
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The requested model does not exist
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    /// A configuration field or input was rejected
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// The engine failed while computing embeddings
    #[error("Embedding failed: {reason}")]
    EmbeddingFailed { reason: String },

    /// The engine produced an output shape the bridge cannot carry (multi-vector)
    #[error("Unsupported output shape: {reason}")]
    UnsupportedOutputShape { reason: String },

    /// The native call itself failed, or the engine sent an unrecognized signal
    #[error("Engine call {operation} failed: {reason}")]
    EngineCallFailed { operation: String, reason: String },

    /// Input file or directory does not exist
    #[error("File not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    /// Input file has an extension the engine cannot parse
    #[error("Unsupported file format '{extension}' for {}", .path.display())]
    UnsupportedFileFormat { extension: String, path: PathBuf },

    /// Input file exists but could not be read
    #[error("Failed to read {}: {reason}", .path.display())]
    FileReadFailed { path: PathBuf, reason: String },

    /// The operation was cancelled before its result was delivered
    #[error("Operation cancelled: {operation}")]
    OperationCancelled { operation: String },

    /// The engine broke the boundary contract (malformed record, missing signal)
    #[error("Engine contract violation: {reason}")]
    EngineContractViolation { reason: String },
}

impl BridgeError {
    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an engine call failure
    pub fn engine_call_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EngineCallFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a cancellation outcome
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::OperationCancelled {
            operation: operation.into(),
        }
    }

    /// Create a contract violation error
    pub fn contract_violation(reason: impl Into<String>) -> Self {
        Self::EngineContractViolation {
            reason: reason.into(),
        }
    }

    /// Create the error returned by any call against a disposed engine
    pub fn disposed(operation: impl Into<String>) -> Self {
        Self::engine_call_failed(operation, "engine handle is disposed")
    }

    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::ModelNotFound { .. } => ErrorKind::ModelNotFound,
            BridgeError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            BridgeError::EmbeddingFailed { .. } => ErrorKind::EmbeddingFailed,
            BridgeError::UnsupportedOutputShape { .. } => ErrorKind::UnsupportedOutputShape,
            BridgeError::EngineCallFailed { .. } => ErrorKind::EngineCallFailed,
            BridgeError::FileNotFound { .. } => ErrorKind::FileNotFound,
            BridgeError::UnsupportedFileFormat { .. } => ErrorKind::UnsupportedFileFormat,
            BridgeError::FileReadFailed { .. } => ErrorKind::FileReadFailed,
            BridgeError::OperationCancelled { .. } => ErrorKind::OperationCancelled,
            BridgeError::EngineContractViolation { .. } => ErrorKind::EngineContractViolation,
        }
    }

    /// Contract violations indicate a bridge or engine bug and abort the operation
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::EngineContractViolation { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::OperationCancelled { .. })
    }

    /// Render this error in the engine's tagged signal format.
    ///
    /// `parse_signal(&e.to_signal())` reproduces `e`.
    pub fn to_signal(&self) -> String {
        let context = match self {
            BridgeError::ModelNotFound { model_id } => model_id.clone(),
            BridgeError::InvalidConfiguration { field, reason } => format!("{field}: {reason}"),
            BridgeError::EmbeddingFailed { reason }
            | BridgeError::UnsupportedOutputShape { reason }
            | BridgeError::EngineContractViolation { reason } => reason.clone(),
            BridgeError::EngineCallFailed { operation, reason } => {
                if operation == UNRECOGNIZED_SIGNAL {
                    // Raw text is preserved verbatim, so the signal is the text itself
                    return reason.clone();
                }
                format!("{operation}: {reason}")
            }
            BridgeError::FileNotFound { path } => path.display().to_string(),
            BridgeError::UnsupportedFileFormat { extension, path } => {
                if extension.is_empty() {
                    path.display().to_string()
                } else {
                    format!("{extension} for {}", path.display())
                }
            }
            BridgeError::FileReadFailed { path, reason } => {
                format!("{}: {reason}", path.display())
            }
            BridgeError::OperationCancelled { operation } => operation.clone(),
        };
        format!("{}: {}", self.kind().tag(), context)
    }
}

/// Parse a tagged signal emitted by the native engine.
///
/// Never fails: a signal without a known tag is kept verbatim inside an
/// [`BridgeError::EngineCallFailed`] so no information is lost.
pub fn parse_signal(signal: &str) -> BridgeError {
    let Some((tag, context)) = signal.split_once(':') else {
        return unrecognized(signal);
    };
    let Some(kind) = ErrorKind::from_tag(tag.trim()) else {
        return unrecognized(signal);
    };
    let context = context.trim();

    match kind {
        ErrorKind::ModelNotFound => BridgeError::ModelNotFound {
            model_id: context.to_string(),
        },
        ErrorKind::InvalidConfiguration => match context.split_once(": ") {
            Some((field, reason)) => BridgeError::invalid_configuration(field, reason),
            None => BridgeError::invalid_configuration("config", context),
        },
        ErrorKind::EmbeddingFailed => BridgeError::EmbeddingFailed {
            reason: context.to_string(),
        },
        ErrorKind::UnsupportedOutputShape => BridgeError::UnsupportedOutputShape {
            reason: context.to_string(),
        },
        ErrorKind::EngineCallFailed => match context.split_once(": ") {
            Some((operation, reason)) if is_operation_name(operation) => {
                BridgeError::engine_call_failed(operation, reason)
            }
            _ => BridgeError::engine_call_failed("native", context),
        },
        ErrorKind::FileNotFound => BridgeError::FileNotFound {
            path: PathBuf::from(context),
        },
        ErrorKind::UnsupportedFileFormat => match context.split_once(" for ") {
            Some((extension, path)) if is_extension(extension) => {
                BridgeError::UnsupportedFileFormat {
                    extension: extension.trim_start_matches('.').to_string(),
                    path: PathBuf::from(path),
                }
            }
            _ => BridgeError::UnsupportedFileFormat {
                extension: String::new(),
                path: PathBuf::from(context),
            },
        },
        ErrorKind::FileReadFailed => match context.split_once(": ") {
            Some((path, reason)) => BridgeError::FileReadFailed {
                path: PathBuf::from(path),
                reason: reason.to_string(),
            },
            None => BridgeError::FileReadFailed {
                path: PathBuf::new(),
                reason: context.to_string(),
            },
        },
        ErrorKind::OperationCancelled => BridgeError::cancelled(context),
        ErrorKind::EngineContractViolation => BridgeError::contract_violation(context),
    }
}

fn unrecognized(signal: &str) -> BridgeError {
    BridgeError::engine_call_failed(UNRECOGNIZED_SIGNAL, signal)
}

/// Operation names are identifiers (`embed_text`), not free text
fn is_operation_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `xlsx` or `.xlsx`; anything else is taken as part of a path
fn is_extension(candidate: &str) -> bool {
    let bare = candidate.strip_prefix('.').unwrap_or(candidate);
    !bare.is_empty() && bare.chars().all(|c| c.is_ascii_alphanumeric())
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_not_found() {
        let err = parse_signal("MODEL_NOT_FOUND: sentence-transformers/missing");
        assert_eq!(
            err,
            BridgeError::ModelNotFound {
                model_id: "sentence-transformers/missing".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_config_extracts_field_and_reason() {
        let err = parse_signal("INVALID_CONFIG: dtype: invalid value 7");
        assert_eq!(err, BridgeError::invalid_configuration("dtype", "invalid value 7"));
    }

    #[test]
    fn test_invalid_config_without_field() {
        let err = parse_signal("INVALID_CONFIG: nonsense");
        assert_eq!(err, BridgeError::invalid_configuration("config", "nonsense"));
    }

    #[test]
    fn test_embedding_failed_keeps_nested_colons() {
        let err = parse_signal("EMBEDDING_FAILED: Batch embedding generation failed for 3 texts: oom");
        assert_eq!(
            err,
            BridgeError::EmbeddingFailed {
                reason: "Batch embedding generation failed for 3 texts: oom".to_string()
            }
        );
    }

    #[test]
    fn test_multi_vector_aliases() {
        for signal in [
            "MULTI_VECTOR: Multi-vector embeddings are not supported",
            "MULTI_VECTOR_NOT_SUPPORTED: Multi-vector embeddings are not supported",
        ] {
            assert_eq!(parse_signal(signal).kind(), ErrorKind::UnsupportedOutputShape);
        }
    }

    #[test]
    fn test_ffi_error_with_and_without_operation() {
        assert_eq!(
            parse_signal("FFI_ERROR: embed_text: embedder pointer is null"),
            BridgeError::engine_call_failed("embed_text", "embedder pointer is null")
        );
        assert_eq!(
            parse_signal("FFI_ERROR: Failed to initialize Tokio runtime"),
            BridgeError::engine_call_failed("native", "Failed to initialize Tokio runtime")
        );
    }

    #[test]
    fn test_file_errors() {
        assert_eq!(
            parse_signal("FILE_NOT_FOUND: /data/missing"),
            BridgeError::FileNotFound {
                path: PathBuf::from("/data/missing")
            }
        );
        assert_eq!(
            parse_signal("UNSUPPORTED_FORMAT: xlsx for /data/sheet.xlsx"),
            BridgeError::UnsupportedFileFormat {
                extension: "xlsx".to_string(),
                path: PathBuf::from("/data/sheet.xlsx")
            }
        );
        assert_eq!(
            parse_signal("UNSUPPORTED_FORMAT: /data/sheet.xlsx"),
            BridgeError::UnsupportedFileFormat {
                extension: String::new(),
                path: PathBuf::from("/data/sheet.xlsx")
            }
        );
        assert_eq!(
            parse_signal("UNSUPPORTED_FORMAT: /data/notes for q1/report.xlsx"),
            BridgeError::UnsupportedFileFormat {
                extension: String::new(),
                path: PathBuf::from("/data/notes for q1/report.xlsx")
            }
        );
        assert_eq!(
            parse_signal("UNSUPPORTED_FORMAT: .pdf for /data/notes for q1/a.pdf"),
            BridgeError::UnsupportedFileFormat {
                extension: "pdf".to_string(),
                path: PathBuf::from("/data/notes for q1/a.pdf")
            }
        );
        assert_eq!(
            parse_signal("FILE_READ_ERROR: /data/locked.txt: permission denied"),
            BridgeError::FileReadFailed {
                path: PathBuf::from("/data/locked.txt"),
                reason: "permission denied".to_string()
            }
        );
    }

    #[test]
    fn test_cancelled_and_contract_violation() {
        let cancelled = parse_signal("OPERATION_CANCELLED: embed_directory");
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_fatal());

        let violation = parse_signal("CONTRACT_VIOLATION: null vector pointer with length 4");
        assert!(violation.is_fatal());
    }

    #[test]
    fn test_unknown_prefix_preserves_raw_text() {
        let raw = "SEGFAULT_ISH: something exploded: badly";
        let err = parse_signal(raw);
        assert_eq!(err, BridgeError::engine_call_failed(UNRECOGNIZED_SIGNAL, raw));
        assert_eq!(err.to_signal(), raw);
    }

    #[test]
    fn test_untagged_text_preserves_raw_text() {
        let raw = "Invalid operation ID: 42";
        // "Invalid operation ID" is not a tag even though it precedes a colon
        assert_eq!(
            parse_signal(raw),
            BridgeError::engine_call_failed(UNRECOGNIZED_SIGNAL, raw)
        );
        assert_eq!(
            parse_signal("no colon at all"),
            BridgeError::engine_call_failed(UNRECOGNIZED_SIGNAL, "no colon at all")
        );
    }

    #[test]
    fn test_every_tag_maps_back_to_its_kind() {
        for kind in ErrorKind::ALL {
            let signal = format!("{}: context", kind.tag());
            assert_eq!(parse_signal(&signal).kind(), kind, "signal {signal}");
        }
    }

    #[test]
    fn test_signal_rendering_is_parseable() {
        let errors = [
            BridgeError::invalid_configuration("chunk_size", "must be greater than 0"),
            BridgeError::UnsupportedFileFormat {
                extension: "bin".to_string(),
                path: PathBuf::from("/tmp/blob.bin"),
            },
            BridgeError::FileReadFailed {
                path: PathBuf::from("/tmp/a.txt"),
                reason: "Is a directory".to_string(),
            },
        ];
        for err in errors {
            assert_eq!(parse_signal(&err.to_signal()), err);
        }
    }
}
