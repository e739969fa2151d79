//! CmdForge - GPU command memory management
//!
//! Building blocks for recording GPU command buffers: linear command
//! streams, indirect state heaps and the [`CommandContainer`] that ties
//! them together with residency tracking and allocation reuse.

#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow
#![allow(clippy::bool_comparison)] // Sometimes clearer for intent

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod memory;

pub use command::{
    CommandContainer, CommandStreamReceiver, HeapAddressModel, HeapReserveArguments, HeapType,
    IndirectHeap, LinearStream, ReservedIndirectHeap, NUM_HEAP_TYPES,
};
pub use config::DebugFlags;
pub use device::{CapabilityTable, Device};
pub use error::{CmdForgeError, CmdResult, ErrorCategory};
pub use memory::{
    AllocationProperties, AllocationType, AllocationsList, GraphicsAllocation, HeapHelper,
    MemoryManager, MemoryPool, SystemMemoryManager, OBJECT_NOT_USED,
};
