//! Indirect heaps and reserved heap windows
//!
//! An [`IndirectHeap`] is a typed linear stream for GPU state: dynamic
//! state, indirect objects or surface state. [`ReservedIndirectHeap`] is
//! a bounds-checked window carved out of a shared heap by the dispatch
//! reservation protocol; several immediate command lists can interleave
//! windows on one backing without stepping on each other.

use std::sync::Arc;

use super::linear_stream::LinearStream;
use crate::memory::{align_up, constants::PAGE_SIZE, GraphicsAllocation};

/// Number of indirect heap types
pub const NUM_HEAP_TYPES: usize = 3;

/// Indirect heap classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Samplers and other dynamic state
    DynamicState,
    /// Kernel payloads, addressed relative to the internal heap base
    IndirectObject,
    /// Surface state (binding tables)
    SurfaceState,
}

impl HeapType {
    /// Stable index for per-type arrays
    pub const fn index(self) -> usize {
        match self {
            HeapType::DynamicState => 0,
            HeapType::IndirectObject => 1,
            HeapType::SurfaceState => 2,
        }
    }

    /// Bit used in the container's dirty mask
    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    /// All heap types in index order
    pub const fn all() -> [HeapType; NUM_HEAP_TYPES] {
        [
            HeapType::DynamicState,
            HeapType::IndirectObject,
            HeapType::SurfaceState,
        ]
    }
}

/// A typed heap over a graphics allocation
///
/// Thin wrapper around [`LinearStream`] that remembers its type and the
/// GPU offset its contents are programmed at.
#[derive(Debug)]
pub struct IndirectHeap {
    stream: LinearStream,
    heap_type: HeapType,
    gpu_start_offset: u64,
}

impl IndirectHeap {
    /// Bind a heap of `heap_type` over the whole of `allocation`
    pub fn new(
        allocation: Arc<GraphicsAllocation>,
        heap_type: HeapType,
        gpu_start_offset: u64,
    ) -> Self {
        let max_size = allocation.size();
        Self {
            stream: LinearStream::from_allocation(allocation, max_size),
            heap_type,
            gpu_start_offset,
        }
    }

    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    /// Offset of this heap's contents relative to its base address
    /// programmed in state base address
    pub fn gpu_start_offset(&self) -> u64 {
        self.gpu_start_offset
    }

    /// Reserve `size` bytes; panics on overflow
    pub fn get_space(&mut self, size: usize) -> *mut u8 {
        self.stream.get_space(size)
    }

    /// Advance the cursor to an `alignment` boundary
    pub fn align(&mut self, alignment: usize) {
        self.stream.align(alignment);
    }

    pub fn used(&self) -> usize {
        self.stream.used()
    }

    pub fn available_space(&self) -> usize {
        self.stream.available_space()
    }

    pub fn max_available_space(&self) -> usize {
        self.stream.max_available_space()
    }

    pub fn cpu_base(&self) -> *mut u8 {
        self.stream.cpu_base()
    }

    pub fn graphics_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.stream.graphics_allocation()
    }

    /// Heap size rounded up to whole small pages
    pub fn heap_size_in_pages(&self) -> usize {
        align_up(self.stream.max_available_space(), PAGE_SIZE) / PAGE_SIZE
    }

    /// Swap in a new backing, resetting the cursor; returns the old one
    pub fn replace_graphics_allocation(
        &mut self,
        allocation: Arc<GraphicsAllocation>,
        gpu_start_offset: u64,
    ) -> Option<Arc<GraphicsAllocation>> {
        let old = self.stream.graphics_allocation().cloned();
        let max_size = allocation.size();
        self.stream.replace_buffer(allocation, max_size);
        self.gpu_start_offset = gpu_start_offset;
        old
    }

    /// Move the cursor back to the start of the heap
    pub fn reset(&mut self) {
        self.stream.reset();
    }

    /// Consume the heap, yielding its backing allocation
    pub fn into_graphics_allocation(self) -> Option<Arc<GraphicsAllocation>> {
        self.stream.graphics_allocation().cloned()
    }
}

/// A bounds-checked window over a shared indirect heap
///
/// Produced by the dispatch reservation protocol. Offsets are absolute
/// against the parent heap's base so surface-state addresses computed
/// from the window match the heap's own addressing.
#[derive(Debug, Default)]
pub struct ReservedIndirectHeap {
    base: *mut u8,
    parent_allocation: Option<Arc<GraphicsAllocation>>,
    window_start: usize,
    cursor: usize,
    window_end: usize,
}

unsafe impl Send for ReservedIndirectHeap {}
unsafe impl Sync for ReservedIndirectHeap {}

impl ReservedIndirectHeap {
    /// Create an unbound window
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the window is bound to a parent heap
    pub fn is_bound(&self) -> bool {
        self.parent_allocation.is_some()
    }

    /// Whether the window is bound to exactly this parent backing
    pub fn is_bound_to(&self, allocation: Option<&Arc<GraphicsAllocation>>) -> bool {
        match (&self.parent_allocation, allocation) {
            (Some(parent), Some(other)) => Arc::ptr_eq(parent, other),
            _ => false,
        }
    }

    /// Bind the window to `[window_start, window_end)` of a parent heap
    pub fn rebind(
        &mut self,
        base: *mut u8,
        window_start: usize,
        window_end: usize,
        parent_allocation: Arc<GraphicsAllocation>,
    ) {
        debug_assert!(window_start <= window_end);
        self.base = base;
        self.window_start = window_start;
        self.cursor = window_start;
        self.window_end = window_end;
        self.parent_allocation = Some(parent_allocation);
    }

    /// Base of the parent heap; null while unbound
    pub fn cpu_base(&self) -> *mut u8 {
        self.base
    }

    /// Absolute cursor offset within the parent heap
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Absolute start of the window
    pub fn window_start(&self) -> usize {
        self.window_start
    }

    /// Bytes remaining in the window
    pub fn available_space(&self) -> usize {
        self.window_end.saturating_sub(self.cursor)
    }

    /// Total window capacity
    pub fn max_available_space(&self) -> usize {
        self.window_end - self.window_start
    }

    /// Reserve `size` bytes inside the window
    ///
    /// # Panics
    /// Panics if the window is unbound or exhausted.
    pub fn get_space(&mut self, size: usize) -> *mut u8 {
        assert!(!self.base.is_null(), "reserved heap is not bound");
        assert!(
            size <= self.available_space(),
            "reserved heap overflow: requested {} with {} available",
            size,
            self.available_space()
        );
        let ptr = unsafe { self.base.add(self.cursor) };
        self.cursor += size;
        ptr
    }

    /// Advance the cursor to an `alignment` boundary within the window
    ///
    /// # Panics
    /// Panics if aligning would leave the window.
    pub fn align(&mut self, alignment: usize) {
        let aligned = align_up(self.cursor, alignment);
        if aligned != self.cursor {
            self.get_space(aligned - self.cursor);
        }
    }

    pub fn graphics_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.parent_allocation.as_ref()
    }

    /// Parent heap size rounded up to whole small pages
    pub fn heap_size_in_pages(&self) -> usize {
        self.parent_allocation
            .as_ref()
            .map(|allocation| align_up(allocation.size(), PAGE_SIZE) / PAGE_SIZE)
            .unwrap_or(0)
    }
}
