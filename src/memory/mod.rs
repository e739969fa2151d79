//! Device memory primitives for command buffers and indirect heaps
//!
//! This module owns the allocation model the container layer is built on:
//! a [`GraphicsAllocation`] is a host-visible backing buffer with a GPU
//! virtual address and submission bookkeeping, handed out by a
//! [`MemoryManager`]. Allocations are shared through `Arc` handles so that
//! residency containers, reuse pools and streams can all reference the
//! same backing without lifetime gymnastics.
//!
//! # Background
//!
//! Command buffers and heap backings churn rapidly under an immediate
//! command list. Allocating fresh device memory for each of them is the
//! enemy; the reuse machinery in [`allocations_list`] and [`heap_helper`]
//! exists to keep retired backings circulating instead.

pub mod allocations_list;
pub mod heap_helper;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CmdResult;
use crate::oom_error;

pub use allocations_list::AllocationsList;
pub use heap_helper::HeapHelper;

/// Sizing constants shared across the command layer
pub mod constants {
    /// One kilobyte
    pub const KILOBYTE: usize = 1024;
    /// Small page size
    pub const PAGE_SIZE: usize = 4 * KILOBYTE;
    /// Large page size; command-buffer backings are rounded to this
    pub const PAGE_SIZE_64K: usize = 64 * KILOBYTE;
    /// Cache line size
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Default command-buffer payload size
    pub const DEFAULT_CMD_BUFFER_SIZE: usize = 256 * KILOBYTE;
    /// Tail reserved past the payload: one cache line for the end marker
    /// plus a page of command-streamer overfetch
    pub const CMD_BUFFER_RESERVED_SIZE: usize = CACHE_LINE_SIZE + PAGE_SIZE;

    /// Default indirect-heap backing size
    pub const DEFAULT_HEAP_SIZE: usize = 64 * KILOBYTE;
}

/// Round `value` up to a multiple of `alignment`
///
/// `alignment` must be a power of two; zero and one are treated as
/// "no alignment".
pub const fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Task count carried by allocations that were never submitted
///
/// Such allocations were never observed by the GPU, so reuse gating
/// treats them as always safe to recycle.
pub const OBJECT_NOT_USED: u32 = u32::MAX;

/// What an allocation backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Primary or secondary command buffer
    CommandBuffer,
    /// Surface-state or dynamic-state heap backing
    LinearStream,
    /// Indirect-object heap backing, placed in the internal heap window
    InternalHeap,
}

/// Which physical pool an allocation landed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPool {
    /// Host-visible system memory
    System,
    /// Device-local memory
    LocalMemory,
}

/// Request description consumed by [`MemoryManager::allocate_graphics_memory`]
#[derive(Debug, Clone)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
    pub use_local_memory: bool,
}

impl AllocationProperties {
    pub fn new(root_device_index: u32, size: usize, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            use_local_memory: false,
        }
    }

    pub fn with_local_memory(mut self, use_local_memory: bool) -> Self {
        self.use_local_memory = use_local_memory;
        self
    }
}

/// A device allocation with host-visible backing
///
/// Carries the GPU virtual address assigned by the memory manager and two
/// atomic counters: the task count of the last submission referencing it
/// and the task count at which it was last made resident. A fresh
/// allocation starts at [`OBJECT_NOT_USED`].
///
/// The backing buffer is owned through a raw pointer so that streams and
/// heaps can write through shared handles; callers serialize access per
/// container, matching how real command memory is used.
#[derive(Debug)]
pub struct GraphicsAllocation {
    cpu_base: *mut u8,
    size: usize,
    gpu_address: u64,
    root_device_index: u32,
    allocation_type: AllocationType,
    memory_pool: MemoryPool,
    task_count: AtomicU32,
    residency_task_count: AtomicU32,
}

// The backing is only reached through cpu_base under container-level
// serialization; the counters are atomic.
unsafe impl Send for GraphicsAllocation {}
unsafe impl Sync for GraphicsAllocation {}

impl GraphicsAllocation {
    fn new(
        size: usize,
        gpu_address: u64,
        root_device_index: u32,
        allocation_type: AllocationType,
        memory_pool: MemoryPool,
    ) -> Self {
        // Command memory is page-aligned; a plain byte vector would not be.
        let layout = Self::backing_layout(size);
        let cpu_base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!cpu_base.is_null(), "host backing allocation failed");
        Self {
            cpu_base,
            size,
            gpu_address,
            root_device_index,
            allocation_type,
            memory_pool,
            task_count: AtomicU32::new(OBJECT_NOT_USED),
            residency_task_count: AtomicU32::new(OBJECT_NOT_USED),
        }
    }

    fn backing_layout(size: usize) -> std::alloc::Layout {
        // The memory manager page-rounds every size before reaching here
        match std::alloc::Layout::from_size_align(size, constants::PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid backing size {}", size),
        }
    }

    /// Host-visible base of the backing buffer
    pub fn cpu_base(&self) -> *mut u8 {
        self.cpu_base
    }

    /// Size of the backing buffer in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// GPU virtual address of the allocation
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    pub fn memory_pool(&self) -> MemoryPool {
        self.memory_pool
    }

    pub fn is_allocated_in_local_memory_pool(&self) -> bool {
        self.memory_pool == MemoryPool::LocalMemory
    }

    /// Task count of the last submission referencing this allocation,
    /// or [`OBJECT_NOT_USED`] if it was never submitted
    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn update_task_count(&self, task_count: u32) {
        self.task_count.store(task_count, Ordering::Release);
    }

    /// Task count at which this allocation was last made resident
    pub fn residency_task_count(&self) -> u32 {
        self.residency_task_count.load(Ordering::Acquire)
    }

    pub fn update_residency_task_count(&self, task_count: u32) {
        self.residency_task_count.store(task_count, Ordering::Release);
    }

    /// Whether reuse machinery may hand this allocation out again,
    /// given the task count the GPU has completed
    pub fn is_safe_to_reuse(&self, completed_task_count: u32) -> bool {
        let task_count = self.task_count();
        task_count == OBJECT_NOT_USED || task_count <= completed_task_count
    }
}

impl Drop for GraphicsAllocation {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.cpu_base, Self::backing_layout(self.size)) };
    }
}

/// Allocation backend seam
///
/// The container layer only ever talks to this trait; tests substitute
/// counting and failing implementations behind it.
pub trait MemoryManager: Send + Sync {
    /// Allocate a backing buffer described by `properties`
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> CmdResult<Arc<GraphicsAllocation>>;

    /// Return an allocation to the backend
    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>);

    /// Base GPU address of the internal heap window for a device
    ///
    /// Indirect-object heaps are programmed relative to this base.
    fn internal_heap_base_address(&self, root_device_index: u32, use_local_memory: bool) -> u64;

    /// Wait for any user fence signaled against `allocation`
    fn handle_fence_completion(&self, allocation: &Arc<GraphicsAllocation>);
}

/// GPU base of the internal heap window in system memory
pub const INTERNAL_HEAP_BASE_SYSTEM: u64 = 0x8000_0000;
/// GPU base of the internal heap window in local memory
pub const INTERNAL_HEAP_BASE_LOCAL: u64 = 0x1_8000_0000;

// GPU virtual addresses are handed out above both heap windows so that
// heap offsets against either base stay positive.
const GPU_VA_ARENA_BASE: u64 = 0x2_0000_0000;

/// Host-backed memory manager
///
/// Emulates device memory with page-aligned host buffers and a bump
/// allocator for GPU virtual addresses. Keeps allocation, free and
/// fence-completion statistics; the counters double as the observability
/// surface the tests lean on.
pub struct SystemMemoryManager {
    next_gpu_address: AtomicU64,
    allocation_count: AtomicU32,
    free_count: AtomicU32,
    fence_completion_count: AtomicU32,
}

impl Default for SystemMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryManager {
    pub fn new() -> Self {
        Self {
            next_gpu_address: AtomicU64::new(GPU_VA_ARENA_BASE),
            allocation_count: AtomicU32::new(0),
            free_count: AtomicU32::new(0),
            fence_completion_count: AtomicU32::new(0),
        }
    }

    /// Number of successful allocations served
    pub fn allocation_count(&self) -> u32 {
        self.allocation_count.load(Ordering::Acquire)
    }

    /// Number of allocations returned
    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    /// Number of fence completions handled
    pub fn fence_completion_count(&self) -> u32 {
        self.fence_completion_count.load(Ordering::Acquire)
    }
}

impl MemoryManager for SystemMemoryManager {
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> CmdResult<Arc<GraphicsAllocation>> {
        if properties.size == 0 {
            return Err(oom_error!("zero-sized allocation request"));
        }
        let size = align_up(properties.size, constants::PAGE_SIZE);
        let gpu_address = self
            .next_gpu_address
            .fetch_add(size as u64, Ordering::AcqRel);
        let pool = if properties.use_local_memory {
            MemoryPool::LocalMemory
        } else {
            MemoryPool::System
        };

        self.allocation_count.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(
            size,
            gpu_address,
            allocation_type = ?properties.allocation_type,
            pool = ?pool,
            "allocated graphics memory"
        );

        Ok(Arc::new(GraphicsAllocation::new(
            size,
            gpu_address,
            properties.root_device_index,
            properties.allocation_type,
            pool,
        )))
    }

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        self.free_count.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(
            gpu_address = allocation.gpu_address(),
            size = allocation.size(),
            "freed graphics memory"
        );
        drop(allocation);
    }

    fn internal_heap_base_address(&self, _root_device_index: u32, use_local_memory: bool) -> u64 {
        if use_local_memory {
            INTERNAL_HEAP_BASE_LOCAL
        } else {
            INTERNAL_HEAP_BASE_SYSTEM
        }
    }

    fn handle_fence_completion(&self, allocation: &Arc<GraphicsAllocation>) {
        self.fence_completion_count.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(
            gpu_address = allocation.gpu_address(),
            "fence completion handled"
        );
    }
}
