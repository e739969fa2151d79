//! Shared fixtures for the integration tests

// Each test binary pulls in the subset of fixtures it needs
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cmdforge::memory::{AllocationProperties, SystemMemoryManager};
use cmdforge::{
    CapabilityTable, CmdForgeError, CmdResult, DebugFlags, Device, GraphicsAllocation,
    MemoryManager,
};

/// Memory manager that starts failing after a fixed number of
/// successful allocations, for out-of-memory paths
pub struct FailingMemoryManager {
    inner: SystemMemoryManager,
    successes_allowed: AtomicU32,
}

impl FailingMemoryManager {
    pub fn failing_after(successes: u32) -> Self {
        Self {
            inner: SystemMemoryManager::new(),
            successes_allowed: AtomicU32::new(successes),
        }
    }
}

impl MemoryManager for FailingMemoryManager {
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> CmdResult<Arc<GraphicsAllocation>> {
        if self.successes_allowed.load(Ordering::Acquire) == 0 {
            return Err(CmdForgeError::OutOfDeviceMemory(
                "allocation budget exhausted".to_string(),
            ));
        }
        self.successes_allowed.fetch_sub(1, Ordering::AcqRel);
        self.inner.allocate_graphics_memory(properties)
    }

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        self.inner.free_graphics_memory(allocation);
    }

    fn internal_heap_base_address(&self, root_device_index: u32, use_local_memory: bool) -> u64 {
        self.inner
            .internal_heap_base_address(root_device_index, use_local_memory)
    }

    fn handle_fence_completion(&self, allocation: &Arc<GraphicsAllocation>) {
        self.inner.handle_fence_completion(allocation);
    }
}

/// Device over a counting system memory manager, returned alongside the
/// manager so tests can inspect its statistics
pub fn device_with_counters() -> (Arc<Device>, Arc<SystemMemoryManager>) {
    let memory_manager = Arc::new(SystemMemoryManager::new());
    let device = Arc::new(Device::new(
        Arc::clone(&memory_manager) as Arc<dyn MemoryManager>
    ));
    (device, memory_manager)
}

pub fn device_with_flags(flags: DebugFlags) -> (Arc<Device>, Arc<SystemMemoryManager>) {
    let memory_manager = Arc::new(SystemMemoryManager::new());
    let device = Arc::new(
        Device::new(Arc::clone(&memory_manager) as Arc<dyn MemoryManager>)
            .with_debug_flags(flags),
    );
    (device, memory_manager)
}

pub fn device_without_images() -> (Arc<Device>, Arc<SystemMemoryManager>) {
    let memory_manager = Arc::new(SystemMemoryManager::new());
    let device = Arc::new(
        Device::new(Arc::clone(&memory_manager) as Arc<dyn MemoryManager>).with_capability_table(
            CapabilityTable {
                supports_images: false,
                local_memory_supported: false,
            },
        ),
    );
    (device, memory_manager)
}

pub fn device_failing_after(successes: u32) -> Arc<Device> {
    Arc::new(Device::new(Arc::new(FailingMemoryManager::failing_after(
        successes,
    ))))
}
