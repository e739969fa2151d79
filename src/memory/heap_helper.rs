//! Cross-container reuse pool for indirect-heap backings
//!
//! Containers on the same device share one pool of retired heap
//! backings. A helper is cheap to clone into each container; all of them
//! funnel through the same mutex-guarded [`AllocationsList`].

use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    AllocationProperties, AllocationType, AllocationsList, GraphicsAllocation, MemoryManager,
};
use crate::command::indirect_heap::HeapType;
use crate::error::CmdResult;

/// Hands out heap backings, preferring the shared reuse pool
#[derive(Clone)]
pub struct HeapHelper {
    memory_manager: Arc<dyn MemoryManager>,
    storage_for_reuse: Arc<Mutex<AllocationsList>>,
    root_device_index: u32,
    use_local_memory: bool,
}

impl HeapHelper {
    pub fn new(
        memory_manager: Arc<dyn MemoryManager>,
        storage_for_reuse: Arc<Mutex<AllocationsList>>,
        root_device_index: u32,
        use_local_memory: bool,
    ) -> Self {
        Self {
            memory_manager,
            storage_for_reuse,
            root_device_index,
            use_local_memory,
        }
    }

    /// Allocation type used for a heap's backing
    ///
    /// Indirect-object heaps live in the internal heap window; state
    /// heaps are plain linear streams in system memory.
    pub fn allocation_type_for(heap_type: HeapType) -> AllocationType {
        match heap_type {
            HeapType::IndirectObject => AllocationType::InternalHeap,
            HeapType::DynamicState | HeapType::SurfaceState => AllocationType::LinearStream,
        }
    }

    /// Obtain a backing of at least `required_size` for `heap_type`
    ///
    /// The shared pool is consulted first, gated on `completed_task_count`;
    /// only on a miss is fresh memory allocated.
    pub fn get_heap_allocation(
        &self,
        heap_type: HeapType,
        required_size: usize,
        completed_task_count: u32,
    ) -> CmdResult<Arc<GraphicsAllocation>> {
        let allocation_type = Self::allocation_type_for(heap_type);

        if let Some(reused) = self.storage_for_reuse.lock().detach_allocation(
            required_size,
            allocation_type,
            completed_task_count,
        ) {
            tracing::debug!(
                heap_type = ?heap_type,
                gpu_address = reused.gpu_address(),
                "reusing pooled heap backing"
            );
            return Ok(reused);
        }

        let use_local = self.use_local_memory && allocation_type == AllocationType::InternalHeap;
        let properties =
            AllocationProperties::new(self.root_device_index, required_size, allocation_type)
                .with_local_memory(use_local);
        self.memory_manager.allocate_graphics_memory(&properties)
    }

    /// Park a retired heap backing in the shared pool
    pub fn store_heap_allocation(&self, allocation: Arc<GraphicsAllocation>) {
        self.storage_for_reuse.lock().push_tail(allocation);
    }

    /// Shared pool handle, mainly for inspection in tests
    pub fn storage_for_reuse(&self) -> Arc<Mutex<AllocationsList>> {
        Arc::clone(&self.storage_for_reuse)
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }
}
