//! Device abstraction
//!
//! A [`Device`] bundles the capability bits the container layer cares
//! about with the memory manager serving it and the heap-backing reuse
//! pool shared by every container created on the device.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DebugFlags;
use crate::memory::{AllocationsList, MemoryManager};

/// Hardware capabilities relevant to heap management
#[derive(Debug, Clone, Copy)]
pub struct CapabilityTable {
    /// Device supports images; without them no dynamic-state heap is kept
    pub supports_images: bool,
    /// Device has local memory for internal heap placement
    pub local_memory_supported: bool,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self {
            supports_images: true,
            local_memory_supported: false,
        }
    }
}

/// A root device as seen by the command layer
pub struct Device {
    root_device_index: u32,
    capability_table: CapabilityTable,
    debug_flags: DebugFlags,
    memory_manager: Arc<dyn MemoryManager>,
    heap_reuse_storage: Arc<Mutex<AllocationsList>>,
}

impl Device {
    pub fn new(memory_manager: Arc<dyn MemoryManager>) -> Self {
        Self {
            root_device_index: 0,
            capability_table: CapabilityTable::default(),
            debug_flags: DebugFlags::default(),
            memory_manager,
            heap_reuse_storage: Arc::new(Mutex::new(AllocationsList::new())),
        }
    }

    pub fn with_root_device_index(mut self, root_device_index: u32) -> Self {
        self.root_device_index = root_device_index;
        self
    }

    pub fn with_capability_table(mut self, capability_table: CapabilityTable) -> Self {
        self.capability_table = capability_table;
        self
    }

    pub fn with_debug_flags(mut self, debug_flags: DebugFlags) -> Self {
        self.debug_flags = debug_flags;
        self
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn capability_table(&self) -> &CapabilityTable {
        &self.capability_table
    }

    pub fn debug_flags(&self) -> &DebugFlags {
        &self.debug_flags
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    /// Pool of retired heap backings shared by this device's containers
    pub fn heap_reuse_storage(&self) -> Arc<Mutex<AllocationsList>> {
        Arc::clone(&self.heap_reuse_storage)
    }

    /// Whether internal heaps should be placed in local memory
    pub fn use_local_memory_for_heaps(&self) -> bool {
        self.capability_table.local_memory_supported
    }
}
