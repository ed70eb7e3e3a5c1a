//! Ownership transfer across the engine boundary
//!
//! The side that allocates a buffer relinquishes it explicitly; the side that
//! receives it frees it through the paired free function, exactly once, on
//! every exit path. Engine allocations are adopted into [`Transferred`] the
//! moment they arrive, so early returns, `?`, panics and dropped futures all
//! release them. Bridge allocations ([`ConfigHandle`], [`CStringArray`]) are
//! plain owned values that outlive the native call they are lent to.

use crate::config::ChunkConfig;
use crate::error::{BridgeError, Result};
use crate::records::ChunkConfigRecord;
use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr::NonNull;

/// Paired free function for an engine-allocated buffer
pub type FreeFn<T> = unsafe extern "C" fn(*mut T);

/// Engine-allocated buffer whose ownership has moved to the bridge
pub struct Transferred<T> {
    ptr: NonNull<T>,
    free: FreeFn<T>,
}

// SAFETY: after the transfer the engine no longer reads or writes the buffer,
// so the guard may move to whichever thread ends up releasing it.
unsafe impl<T> Send for Transferred<T> {}

impl<T> Transferred<T> {
    /// Take ownership of `ptr`. Returns `None` for null, which is never freed.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation that the engine has handed
    /// over and that `free` releases. Nothing else may free it afterwards.
    pub unsafe fn adopt(ptr: *mut T, free: FreeFn<T>) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, free })
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Borrow the record. Valid until the guard is released.
    pub fn record(&self) -> &T {
        // SAFETY: adopt() requires a live allocation, freed only in drop()
        unsafe { self.ptr.as_ref() }
    }

    /// Free the buffer now
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Drop for Transferred<T> {
    fn drop(&mut self) {
        unsafe { (self.free)(self.ptr.as_ptr()) }
    }
}

impl<T> std::fmt::Debug for Transferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Transferred").field(&self.ptr).finish()
    }
}

/// Bridge-owned configuration record, built fresh for one native call
#[derive(Debug)]
pub struct ConfigHandle {
    record: Box<ChunkConfigRecord>,
}

impl ConfigHandle {
    pub(crate) fn new(record: ChunkConfigRecord) -> Self {
        Self {
            record: Box::new(record),
        }
    }

    pub fn record(&self) -> &ChunkConfigRecord {
        &self.record
    }

    /// Pointer lent to the engine for the duration of one call
    pub fn as_ptr(&self) -> *const ChunkConfigRecord {
        &*self.record
    }
}

impl From<&ChunkConfig> for ConfigHandle {
    fn from(config: &ChunkConfig) -> Self {
        Self::new(ChunkConfigRecord::from(config))
    }
}

/// Convert a host string into a C string, rejecting interior NUL bytes
pub(crate) fn c_string(field: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| {
        BridgeError::invalid_configuration(
            field,
            format!("contains a NUL byte at position {}", e.nul_position()),
        )
    })
}

/// Array of C strings lent to the engine as `*const *const c_char`
pub(crate) struct CStringArray {
    // Owns the bytes every pointer in `ptrs` refers to
    _strings: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    pub(crate) fn new(strings: Vec<CString>) -> Self {
        let ptrs = strings.iter().map(|s| s.as_ptr()).collect();
        Self {
            _strings: strings,
            ptrs,
        }
    }

    pub(crate) fn from_strs<S: AsRef<str>>(field: &str, values: &[S]) -> Result<Vec<CString>> {
        values.iter().map(|v| c_string(field, v.as_ref())).collect()
    }

    /// Pointer to the first element, or null when empty
    pub(crate) fn as_ptr(&self) -> *const *const c_char {
        if self.ptrs.is_empty() {
            std::ptr::null()
        } else {
            self.ptrs.as_ptr()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ptrs.len()
    }
}
