//! Command stream receiver
//!
//! Tracks what the GPU has completed (the tag), what has been submitted
//! (the task count) and owns the recursive ownership lock the shared-heap
//! reservation protocol synchronizes on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::memory::GraphicsAllocation;

/// Submission-side bookkeeping for one engine context
pub struct CommandStreamReceiver {
    /// Task count the GPU has retired
    tag: AtomicU32,
    /// Latest submitted task count
    task_count: AtomicU32,
    ownership_acquire_count: AtomicU32,
    ownership: ReentrantMutex<()>,
}

impl Default for CommandStreamReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStreamReceiver {
    pub fn new() -> Self {
        Self {
            tag: AtomicU32::new(0),
            task_count: AtomicU32::new(0),
            ownership_acquire_count: AtomicU32::new(0),
            ownership: ReentrantMutex::new(()),
        }
    }

    /// Task count the GPU has retired
    pub fn completed_task_count(&self) -> u32 {
        self.tag.load(Ordering::Acquire)
    }

    /// Raise the completed task count; the tag never moves backwards
    pub fn set_completed_task_count(&self, task_count: u32) {
        self.tag.fetch_max(task_count, Ordering::AcqRel);
    }

    /// Latest submitted task count
    pub fn peek_task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn set_task_count(&self, task_count: u32) {
        self.task_count.store(task_count, Ordering::Release);
    }

    /// Record a submission; returns the new task count
    pub fn submit(&self) -> u32 {
        self.task_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stamp an allocation as resident for the next submission
    pub fn make_resident(&self, allocation: &Arc<GraphicsAllocation>) {
        allocation.update_residency_task_count(self.peek_task_count() + 1);
    }

    /// Take the ownership lock; reentrant from the same thread
    ///
    /// Every acquisition, nested ones included, bumps the observable
    /// acquire count.
    pub fn obtain_unique_ownership(&self) -> ReentrantMutexGuard<'_, ()> {
        self.ownership_acquire_count.fetch_add(1, Ordering::AcqRel);
        self.ownership.lock()
    }

    /// How many times the ownership lock has been acquired
    pub fn ownership_acquire_count(&self) -> u32 {
        self.ownership_acquire_count.load(Ordering::Acquire)
    }
}
