//! FIFO reuse list for retired graphics allocations
//!
//! Retired command buffers and heap backings are parked here instead of
//! being freed. Detaching checks size, allocation type and the completed
//! task count so an allocation still referenced by in-flight work is
//! never handed out again.

use std::collections::VecDeque;
use std::sync::Arc;

use super::{AllocationType, GraphicsAllocation, MemoryManager};

/// Ordered list of allocations awaiting reuse
///
/// Insertion order is preserved; [`detach_allocation`] returns the oldest
/// compatible entry.
///
/// [`detach_allocation`]: AllocationsList::detach_allocation
#[derive(Default)]
pub struct AllocationsList {
    allocations: VecDeque<Arc<GraphicsAllocation>>,
}

impl AllocationsList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an allocation to the tail of the list
    pub fn push_tail(&mut self, allocation: Arc<GraphicsAllocation>) {
        tracing::trace!(
            gpu_address = allocation.gpu_address(),
            size = allocation.size(),
            "allocation parked for reuse"
        );
        self.allocations.push_back(allocation);
    }

    pub fn peek_is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Oldest entry without detaching it
    pub fn peek_head(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.allocations.front()
    }

    /// Whether this exact allocation (pointer identity) is parked here
    pub fn peek_contains(&self, allocation: &Arc<GraphicsAllocation>) -> bool {
        self.allocations
            .iter()
            .any(|entry| Arc::ptr_eq(entry, allocation))
    }

    /// Detach the oldest allocation compatible with the request
    ///
    /// An entry qualifies when it is large enough, of the requested type,
    /// and its last submission has completed (never-submitted entries
    /// always qualify). Returns `None` when nothing fits.
    pub fn detach_allocation(
        &mut self,
        required_size: usize,
        allocation_type: AllocationType,
        completed_task_count: u32,
    ) -> Option<Arc<GraphicsAllocation>> {
        let position = self.allocations.iter().position(|entry| {
            entry.size() >= required_size
                && entry.allocation_type() == allocation_type
                && entry.is_safe_to_reuse(completed_task_count)
        })?;
        let allocation = self.allocations.remove(position)?;
        tracing::trace!(
            gpu_address = allocation.gpu_address(),
            required_size,
            "allocation detached for reuse"
        );
        Some(allocation)
    }

    /// Drain every entry into another list, preserving order
    pub fn drain_into(&mut self, other: &mut AllocationsList) {
        other.allocations.extend(self.allocations.drain(..));
    }

    /// Release every entry back to the memory manager
    pub fn free_all_graphics_allocations(&mut self, memory_manager: &dyn MemoryManager) {
        for allocation in self.allocations.drain(..) {
            memory_manager.free_graphics_memory(allocation);
        }
    }
}
