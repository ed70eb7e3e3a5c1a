//! Fixed-layout records shared with the native engine
//!
//! Field order and widths mirror the engine's memory layout exactly. Reading a
//! record copies everything into host-owned values; no pointer survives the
//! read.

use crate::config::ChunkConfig;
use crate::error::{BridgeError, Result};
use crate::ownership::ConfigHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;

/// Chunking parameters as laid out for the engine (16 bytes, no padding)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkConfigRecord {
    pub chunk_size: u32,
    pub overlap_ratio: f32,
    pub batch_size: u32,
    pub buffer_size: u32,
}

impl From<&ChunkConfig> for ChunkConfigRecord {
    fn from(config: &ChunkConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            overlap_ratio: config.overlap_ratio,
            batch_size: config.batch_size,
            buffer_size: config.buffer_size,
        }
    }
}

/// One embedding produced by the engine
///
/// `metadata_ptr` points to a JSON object with string values.
#[repr(C)]
#[derive(Debug)]
pub struct EmbeddingRecord {
    pub vector_ptr: *mut f32,
    pub vector_len: usize,
    pub text_ptr: *mut c_char,
    pub metadata_ptr: *mut c_char,
}

/// Array of [`EmbeddingRecord`]s produced by one engine call or callback
#[repr(C)]
#[derive(Debug)]
pub struct EmbeddingBatchRecord {
    pub items_ptr: *mut EmbeddingRecord,
    pub count: usize,
}

/// Host-owned copy of an [`EmbeddingRecord`]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// Source text of the chunk, when the engine reports it
    pub text: Option<String>,
    /// Engine-supplied metadata (file name, chunk index, ...)
    pub metadata: Option<HashMap<String, String>>,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Build a fresh configuration record for one native call
pub fn allocate_config(config: &ChunkConfig) -> ConfigHandle {
    ConfigHandle::from(config)
}

/// Copy an engine record into host containers.
///
/// # Safety
///
/// Every non-null pointer in `record` must be valid for reads as described by
/// the record layout (a `vector_len`-element `f32` array and NUL-terminated
/// strings) for the duration of the call.
pub unsafe fn read_result(record: &EmbeddingRecord) -> Result<Embedding> {
    let vector = if record.vector_ptr.is_null() {
        if record.vector_len != 0 {
            return Err(BridgeError::contract_violation(format!(
                "null vector pointer with length {}",
                record.vector_len
            )));
        }
        Vec::new()
    } else {
        std::slice::from_raw_parts(record.vector_ptr, record.vector_len).to_vec()
    };

    let text = if record.text_ptr.is_null() {
        None
    } else {
        Some(read_c_string(record.text_ptr)?)
    };

    let metadata = if record.metadata_ptr.is_null() {
        None
    } else {
        Some(parse_metadata(&read_c_string(record.metadata_ptr)?)?)
    };

    Ok(Embedding {
        vector,
        text,
        metadata,
    })
}

/// Copy every record of a batch.
///
/// # Safety
///
/// `batch.items_ptr` must be null or point to `batch.count` records that each
/// satisfy the contract of [`read_result`].
pub unsafe fn read_batch(batch: &EmbeddingBatchRecord) -> Result<Vec<Embedding>> {
    (0..batch.count)
        .map(|index| read_batch_item(batch, index))
        .collect()
}

/// Copy a single record out of a batch.
///
/// # Safety
///
/// Same contract as [`read_batch`].
pub unsafe fn read_batch_item(batch: &EmbeddingBatchRecord, index: usize) -> Result<Embedding> {
    if index >= batch.count {
        return Err(BridgeError::contract_violation(format!(
            "batch index {index} out of range for {} items",
            batch.count
        )));
    }
    if batch.items_ptr.is_null() {
        return Err(BridgeError::contract_violation(format!(
            "null items pointer with count {}",
            batch.count
        )));
    }
    read_result(&*batch.items_ptr.add(index))
}

/// Copy a NUL-terminated engine string.
///
/// # Safety
///
/// `ptr` must be non-null and point to a NUL-terminated string.
pub(crate) unsafe fn read_c_string(ptr: *const c_char) -> Result<String> {
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|e| BridgeError::contract_violation(format!("engine string is not UTF-8: {e}")))
}

fn parse_metadata(json: &str) -> Result<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| BridgeError::contract_violation(format!("metadata is not valid JSON: {e}")))?;

    let serde_json::Value::Object(map) = value else {
        return Err(BridgeError::contract_violation(
            "metadata is not a JSON object",
        ));
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => (key, s),
            other => (key, other.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_config_record_layout() {
        assert_eq!(size_of::<ChunkConfigRecord>(), 16);
        assert_eq!(align_of::<ChunkConfigRecord>(), 4);
        assert_eq!(offset_of!(ChunkConfigRecord, chunk_size), 0);
        assert_eq!(offset_of!(ChunkConfigRecord, overlap_ratio), 4);
        assert_eq!(offset_of!(ChunkConfigRecord, batch_size), 8);
        assert_eq!(offset_of!(ChunkConfigRecord, buffer_size), 12);
    }

    #[test]
    fn test_embedding_record_layout() {
        let word = size_of::<usize>();
        assert_eq!(size_of::<EmbeddingRecord>(), 4 * word);
        assert_eq!(offset_of!(EmbeddingRecord, vector_ptr), 0);
        assert_eq!(offset_of!(EmbeddingRecord, vector_len), word);
        assert_eq!(offset_of!(EmbeddingRecord, text_ptr), 2 * word);
        assert_eq!(offset_of!(EmbeddingRecord, metadata_ptr), 3 * word);

        assert_eq!(size_of::<EmbeddingBatchRecord>(), 2 * word);
        assert_eq!(offset_of!(EmbeddingBatchRecord, items_ptr), 0);
        assert_eq!(offset_of!(EmbeddingBatchRecord, count), word);
    }

    #[test]
    fn test_allocate_config_copies_fields() {
        let config = ChunkConfig {
            chunk_size: 12,
            overlap_ratio: 0.25,
            batch_size: 3,
            buffer_size: 9,
        };
        let handle = allocate_config(&config);
        assert_eq!(
            *handle.record(),
            ChunkConfigRecord {
                chunk_size: 12,
                overlap_ratio: 0.25,
                batch_size: 3,
                buffer_size: 9
            }
        );
    }

    #[test]
    fn test_read_result_copies_all_fields() {
        let mut values = vec![0.5f32, -0.25, 1.0];
        let text = CString::new("hello world").unwrap();
        let metadata = CString::new(r#"{"file": "a.txt", "chunk_index": 2}"#).unwrap();
        let record = EmbeddingRecord {
            vector_ptr: values.as_mut_ptr(),
            vector_len: values.len(),
            text_ptr: text.as_ptr() as *mut c_char,
            metadata_ptr: metadata.as_ptr() as *mut c_char,
        };

        let embedding = unsafe { read_result(&record) }.unwrap();
        // Mutating the source after the read must not affect the copy
        values[0] = 9.0;

        assert_eq!(embedding.vector, vec![0.5, -0.25, 1.0]);
        assert_eq!(embedding.text.as_deref(), Some("hello world"));
        let metadata = embedding.metadata.unwrap();
        assert_eq!(metadata["file"], "a.txt");
        assert_eq!(metadata["chunk_index"], "2");
    }

    #[test]
    fn test_read_result_optional_fields() {
        let mut values = vec![1.0f32];
        let record = EmbeddingRecord {
            vector_ptr: values.as_mut_ptr(),
            vector_len: 1,
            text_ptr: std::ptr::null_mut(),
            metadata_ptr: std::ptr::null_mut(),
        };
        let embedding = unsafe { read_result(&record) }.unwrap();
        assert_eq!(embedding.dimension(), 1);
        assert!(embedding.text.is_none());
        assert!(embedding.metadata.is_none());
    }

    #[test]
    fn test_null_vector_with_length_is_contract_violation() {
        let record = EmbeddingRecord {
            vector_ptr: std::ptr::null_mut(),
            vector_len: 4,
            text_ptr: std::ptr::null_mut(),
            metadata_ptr: std::ptr::null_mut(),
        };
        let err = unsafe { read_result(&record) }.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err,
            BridgeError::contract_violation("null vector pointer with length 4")
        );
    }

    #[test]
    fn test_malformed_metadata_is_contract_violation() {
        let metadata = CString::new("[1, 2]").unwrap();
        let record = EmbeddingRecord {
            vector_ptr: std::ptr::null_mut(),
            vector_len: 0,
            text_ptr: std::ptr::null_mut(),
            metadata_ptr: metadata.as_ptr() as *mut c_char,
        };
        assert!(unsafe { read_result(&record) }.unwrap_err().is_fatal());
    }

    #[test]
    fn test_batch_reads() {
        let mut a = vec![1.0f32, 2.0];
        let mut b = vec![3.0f32, 4.0];
        let mut items = vec![
            EmbeddingRecord {
                vector_ptr: a.as_mut_ptr(),
                vector_len: 2,
                text_ptr: std::ptr::null_mut(),
                metadata_ptr: std::ptr::null_mut(),
            },
            EmbeddingRecord {
                vector_ptr: b.as_mut_ptr(),
                vector_len: 2,
                text_ptr: std::ptr::null_mut(),
                metadata_ptr: std::ptr::null_mut(),
            },
        ];
        let batch = EmbeddingBatchRecord {
            items_ptr: items.as_mut_ptr(),
            count: items.len(),
        };

        let all = unsafe { read_batch(&batch) }.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].vector, vec![3.0, 4.0]);

        let second = unsafe { read_batch_item(&batch, 1) }.unwrap();
        assert_eq!(second, all[1]);
        assert!(unsafe { read_batch_item(&batch, 2) }.unwrap_err().is_fatal());
    }

    #[test]
    fn test_null_items_with_count_is_contract_violation() {
        let batch = EmbeddingBatchRecord {
            items_ptr: std::ptr::null_mut(),
            count: 3,
        };
        assert!(unsafe { read_batch(&batch) }.unwrap_err().is_fatal());

        let empty = EmbeddingBatchRecord {
            items_ptr: std::ptr::null_mut(),
            count: 0,
        };
        assert!(unsafe { read_batch(&empty) }.unwrap().is_empty());
    }
}
