//! Process-wide keyed scratch pool
//!
//! Kernels that need transient storage beyond the context's scratch buffers
//! allocate it here, keyed by a purpose string (`"scoreBuf"`,
//! `"shardedOutput"`, `"flashKVBuf"`, `"threadBuffers"`, `"mlp_silu"`).
//! Each keyed slot only ever grows and is retained for the life of the
//! process. Allocation is thread-safe; a returned buffer is used by a single
//! forward call at a time.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::matrix::{bytes_as_slice_mut, SharedPtr};

static POOL: Lazy<ScratchPool> = Lazy::new(ScratchPool::new);

/// Grow-only keyed allocator. See module docs.
pub struct ScratchPool {
    // u64 backing words keep every slot 8-byte aligned.
    slots: Mutex<HashMap<String, Vec<u64>>>,
}

/// A checked-out pool buffer. Valid until the next `get_buffer` call with the
/// same key requests a larger size (growth reallocates the slot).
pub struct PoolBuffer {
    ptr: SharedPtr<u8>,
    bytes: usize,
}

impl PoolBuffer {
    /// Size of the checkout request in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes
    }

    /// Whether the checkout was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// View as `n` elements of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `n * size_of::<T>()` exceeds the checked-out size.
    #[must_use]
    pub fn as_slice_mut<T>(&mut self, n: usize) -> &mut [T] {
        assert!(n * std::mem::size_of::<T>() <= self.bytes);
        unsafe { bytes_as_slice_mut(self.ptr.get(), n) }
    }

    /// Raw base pointer, for kernels that partition the buffer per thread.
    pub(crate) fn shared_ptr<T>(&self) -> SharedPtr<T> {
        SharedPtr(self.ptr.get().cast::<T>())
    }
}

impl ScratchPool {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide pool.
    #[must_use]
    pub fn instance() -> &'static ScratchPool {
        &POOL
    }

    /// Check out at least `bytes` bytes for `name`. Idempotent on size
    /// increase: a smaller request after a larger one returns the larger
    /// slot unchanged.
    pub fn get_buffer(&self, name: &str, bytes: usize) -> PoolBuffer {
        let mut slots = self.slots.lock().expect("scratch pool poisoned");
        let words = bytes.div_ceil(8);
        let slot = slots.entry(name.to_string()).or_default();
        if slot.len() < words {
            slot.resize(words, 0);
        }
        PoolBuffer {
            ptr: SharedPtr(slot.as_mut_ptr().cast::<u8>()),
            bytes,
        }
    }
}
