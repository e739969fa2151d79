//! Command-buffer and indirect-heap management
//!
//! The centerpiece is [`CommandContainer`]: it owns the primary (and
//! optional secondary) [`LinearStream`], the per-type [`IndirectHeap`]s,
//! residency bookkeeping and the reuse plumbing that keeps command
//! memory circulating between submissions.

pub mod container;
pub mod csr;
pub mod indirect_heap;
pub mod linear_stream;

pub use container::{CommandContainer, HeapAddressModel, HeapReserveArguments};
pub use csr::CommandStreamReceiver;
pub use indirect_heap::{HeapType, IndirectHeap, ReservedIndirectHeap, NUM_HEAP_TYPES};
pub use linear_stream::LinearStream;
