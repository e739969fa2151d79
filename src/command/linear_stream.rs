//! Bump-pointer writer over a graphics allocation
//!
//! A [`LinearStream`] hands out raw space inside a command buffer. The
//! cursor only moves forward; rebinding to a new allocation resets it.
//! Overflow is a programming error and panics, there is no bounds-check
//! bypass.

use std::sync::Arc;

use crate::memory::GraphicsAllocation;

/// Forward-only space allocator over a backing buffer
///
/// The stream may be smaller than its allocation: command buffers keep a
/// reserved tail past `max_size` for the end marker and command-streamer
/// overfetch.
#[derive(Debug, Default)]
pub struct LinearStream {
    graphics_allocation: Option<Arc<GraphicsAllocation>>,
    base: *mut u8,
    used: usize,
    max_size: usize,
}

// The base pointer aliases the allocation's backing, which is Send/Sync
// under container-level serialization.
unsafe impl Send for LinearStream {}
unsafe impl Sync for LinearStream {}

impl LinearStream {
    /// Create an unbound stream; it has no space until a buffer is bound
    pub fn new() -> Self {
        Self {
            graphics_allocation: None,
            base: std::ptr::null_mut(),
            used: 0,
            max_size: 0,
        }
    }

    /// Create a stream bound to `allocation`, exposing `max_size` bytes
    ///
    /// # Panics
    /// Panics if `max_size` exceeds the allocation size.
    pub fn from_allocation(allocation: Arc<GraphicsAllocation>, max_size: usize) -> Self {
        let mut stream = Self::new();
        stream.replace_buffer(allocation, max_size);
        stream
    }

    /// Rebind the stream to a new backing, resetting the cursor to zero
    ///
    /// # Panics
    /// Panics if `max_size` exceeds the allocation size.
    pub fn replace_buffer(&mut self, allocation: Arc<GraphicsAllocation>, max_size: usize) {
        assert!(
            max_size <= allocation.size(),
            "stream size {} exceeds allocation size {}",
            max_size,
            allocation.size()
        );
        self.base = allocation.cpu_base();
        self.graphics_allocation = Some(allocation);
        self.used = 0;
        self.max_size = max_size;
    }

    /// Whether a backing buffer is currently bound
    pub fn is_bound(&self) -> bool {
        self.graphics_allocation.is_some()
    }

    /// Reserve `size` bytes and return a pointer to their start
    ///
    /// A zero-byte request returns the current cursor position without
    /// advancing it.
    ///
    /// # Panics
    /// Panics if the stream is unbound or has fewer than `size` bytes
    /// available.
    pub fn get_space(&mut self, size: usize) -> *mut u8 {
        assert!(!self.base.is_null(), "stream has no buffer bound");
        assert!(
            size <= self.available_space(),
            "stream overflow: requested {} with {} available",
            size,
            self.available_space()
        );
        // Cursor stays within max_size, which replace_buffer bounded by
        // the allocation size.
        let ptr = unsafe { self.base.add(self.used) };
        self.used += size;
        ptr
    }

    /// Advance the cursor to the next multiple of `alignment`
    ///
    /// Zero and one are treated as "no alignment".
    ///
    /// # Panics
    /// Panics if aligning would exceed the stream size.
    pub fn align(&mut self, alignment: usize) {
        let aligned = crate::memory::align_up(self.used, alignment);
        if aligned != self.used {
            self.get_space(aligned - self.used);
        }
    }

    /// Bytes consumed so far
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available before the stream is full
    pub fn available_space(&self) -> usize {
        self.max_size - self.used
    }

    /// Total writable size of the stream
    pub fn max_available_space(&self) -> usize {
        self.max_size
    }

    /// Host-visible base of the bound buffer; null when unbound
    pub fn cpu_base(&self) -> *mut u8 {
        self.base
    }

    /// GPU address of the current cursor position
    pub fn current_gpu_address(&self) -> u64 {
        self.graphics_allocation
            .as_ref()
            .map(|allocation| allocation.gpu_address() + self.used as u64)
            .unwrap_or(0)
    }

    pub fn graphics_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.graphics_allocation.as_ref()
    }

    /// Move the cursor back to the start, keeping the binding
    pub fn reset(&mut self) {
        self.used = 0;
    }
}
