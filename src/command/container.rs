//! Command container
//!
//! Owns everything one command list records into: the primary and
//! optional secondary command streams, the per-type indirect heaps, the
//! residency and deferred-deallocation containers, and the reuse lists
//! that recycle retired command buffers and heap backings.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::csr::CommandStreamReceiver;
use super::indirect_heap::{HeapType, IndirectHeap, ReservedIndirectHeap, NUM_HEAP_TYPES};
use super::linear_stream::LinearStream;
use crate::config::DebugFlags;
use crate::device::Device;
use crate::error::{CmdForgeError, CmdResult};
use crate::internal_error;
use crate::memory::constants::{
    CMD_BUFFER_RESERVED_SIZE, DEFAULT_CMD_BUFFER_SIZE, DEFAULT_HEAP_SIZE, KILOBYTE, PAGE_SIZE,
    PAGE_SIZE_64K,
};
use crate::memory::heap_helper::HeapHelper;
use crate::memory::{
    align_up, AllocationProperties, AllocationType, AllocationsList, GraphicsAllocation,
};

/// Marker closing a command buffer before chaining to the next one
pub const BATCH_BUFFER_END: u32 = 0x0500_0000;

/// How state heaps are addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapAddressModel {
    /// Each container owns private surface/dynamic/indirect heaps
    #[default]
    PrivateHeaps,
    /// Stateless access through a global base; no private state heaps
    GlobalStateless,
    /// Bindless access through a global heap; no private state heaps
    GlobalBindless,
}

impl HeapAddressModel {
    /// Whether containers create their own state heaps under this model
    pub fn uses_private_heaps(self) -> bool {
        self == HeapAddressModel::PrivateHeaps
    }
}

/// In/out arguments for one heap in the dispatch reservation protocol
///
/// `reservation` doubles as the output channel: after a successful
/// reserve it is `Some` when the window was rebound and `None` when the
/// existing window (or no window at all) should keep being used.
pub struct HeapReserveArguments<'a> {
    pub reservation: Option<&'a mut ReservedIndirectHeap>,
    pub size: usize,
    pub alignment: usize,
}

impl<'a> HeapReserveArguments<'a> {
    pub fn new(
        reservation: Option<&'a mut ReservedIndirectHeap>,
        size: usize,
        alignment: usize,
    ) -> Self {
        Self {
            reservation,
            size,
            alignment,
        }
    }
}

/// Container for the command memory of one command list
///
/// Created empty, then bound to a device with [`initialize`]. All heaps
/// start dirty: the mask is all-ones until a consumer explicitly lowers
/// it after programming base addresses.
///
/// [`initialize`]: CommandContainer::initialize
pub struct CommandContainer {
    device: Option<Arc<Device>>,
    heap_helper: Option<HeapHelper>,
    command_stream: Option<LinearStream>,
    secondary_command_stream: Option<LinearStream>,
    secondary_cmd_buffer_allocation: Option<Arc<GraphicsAllocation>>,
    indirect_heaps: [Option<IndirectHeap>; NUM_HEAP_TYPES],
    dirty_heaps: u32,
    cmd_buffer_allocations: Vec<Arc<GraphicsAllocation>>,
    residency_container: Vec<Arc<GraphicsAllocation>>,
    deallocation_container: Vec<Arc<GraphicsAllocation>>,
    allocations_list: Option<Arc<Mutex<AllocationsList>>>,
    immediate_reusable_allocation_list: Option<AllocationsList>,
    immediate_cmd_list_csr: Option<Arc<CommandStreamReceiver>>,
    surface_state_heap_reserve: ReservedIndirectHeap,
    dynamic_state_heap_reserve: ReservedIndirectHeap,
    heap_address_model: HeapAddressModel,
    use_shared_heaps: bool,
    keep_current_state_heaps: bool,
    reserved_ssh_size: usize,
    default_heap_size: usize,
    instruction_heap_base_address: u64,
}

impl Default for CommandContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandContainer {
    pub fn new() -> Self {
        Self {
            device: None,
            heap_helper: None,
            command_stream: None,
            secondary_command_stream: None,
            secondary_cmd_buffer_allocation: None,
            indirect_heaps: [None, None, None],
            dirty_heaps: u32::MAX,
            cmd_buffer_allocations: Vec::new(),
            residency_container: Vec::new(),
            deallocation_container: Vec::new(),
            allocations_list: None,
            immediate_reusable_allocation_list: None,
            immediate_cmd_list_csr: None,
            surface_state_heap_reserve: ReservedIndirectHeap::new(),
            dynamic_state_heap_reserve: ReservedIndirectHeap::new(),
            heap_address_model: HeapAddressModel::PrivateHeaps,
            use_shared_heaps: false,
            keep_current_state_heaps: false,
            reserved_ssh_size: 0,
            default_heap_size: DEFAULT_HEAP_SIZE,
            instruction_heap_base_address: 0,
        }
    }

    // ===== configuration before initialize =====

    pub fn set_heap_address_model(&mut self, model: HeapAddressModel) {
        self.heap_address_model = model;
    }

    pub fn heap_address_model(&self) -> HeapAddressModel {
        self.heap_address_model
    }

    /// Share surface/dynamic state heaps across immediate command lists;
    /// they are then bound lazily by [`reserve_space_for_dispatch`]
    ///
    /// [`reserve_space_for_dispatch`]: CommandContainer::reserve_space_for_dispatch
    pub fn enable_heap_sharing(&mut self) {
        self.use_shared_heaps = true;
    }

    pub fn uses_shared_heaps(&self) -> bool {
        self.use_shared_heaps
    }

    /// Whether this heap type is served by the shared-heap protocol
    pub fn is_shared_heap(&self, heap_type: HeapType) -> bool {
        self.use_shared_heaps && heap_type != HeapType::IndirectObject
    }

    pub fn set_immediate_cmd_list_csr(&mut self, csr: Arc<CommandStreamReceiver>) {
        self.immediate_cmd_list_csr = Some(csr);
    }

    pub fn immediate_cmd_list_csr(&self) -> Option<&Arc<CommandStreamReceiver>> {
        self.immediate_cmd_list_csr.as_ref()
    }

    /// Reserve a prefix at the start of every surface-state heap binding
    pub fn set_reserved_ssh_size(&mut self, size: usize) {
        self.reserved_ssh_size = size;
    }

    pub fn reserved_ssh_size(&self) -> usize {
        self.reserved_ssh_size
    }

    /// Keep surface/dynamic state heap cursors across [`reset`]
    ///
    /// [`reset`]: CommandContainer::reset
    pub fn set_keep_current_state_heaps(&mut self, keep: bool) {
        self.keep_current_state_heaps = keep;
    }

    // ===== lifecycle =====

    /// Bind the container to a device and allocate its first command
    /// buffer, plus indirect heaps when `require_heaps` is set
    ///
    /// `allocations_list` is the cross-container reuse list retired
    /// command buffers return to; without one they are freed instead.
    /// Fails with [`CmdForgeError::OutOfDeviceMemory`] when any backing
    /// cannot be allocated.
    pub fn initialize(
        &mut self,
        device: &Arc<Device>,
        allocations_list: Option<Arc<Mutex<AllocationsList>>>,
        default_heap_size: usize,
        require_heaps: bool,
        create_secondary_stream: bool,
    ) -> CmdResult<()> {
        self.device = Some(Arc::clone(device));
        self.allocations_list = allocations_list;
        self.default_heap_size = default_heap_size;

        let capacity = self.cmd_buffer_capacity();
        let buffer = self.allocate_command_buffer_allocation()?;
        self.cmd_buffer_allocations.push(Arc::clone(&buffer));
        self.residency_container.push(Arc::clone(&buffer));
        self.command_stream = Some(LinearStream::from_allocation(buffer, capacity));

        if create_secondary_stream {
            let host_buffer = self.allocate_command_buffer_allocation()?;
            self.secondary_cmd_buffer_allocation = Some(Arc::clone(&host_buffer));
            self.residency_container.push(Arc::clone(&host_buffer));
            self.secondary_command_stream =
                Some(LinearStream::from_allocation(host_buffer, capacity));
        }

        if !require_heaps {
            return Ok(());
        }

        let heap_helper = HeapHelper::new(
            Arc::clone(device.memory_manager()),
            device.heap_reuse_storage(),
            device.root_device_index(),
            device.use_local_memory_for_heaps(),
        );
        self.instruction_heap_base_address = device.memory_manager().internal_heap_base_address(
            device.root_device_index(),
            device.use_local_memory_for_heaps(),
        );

        if self.heap_address_model.uses_private_heaps() {
            let heap_size = self.heap_size_with_flags();
            let completed = self.completed_task_count_for_reuse();
            for heap_type in HeapType::all() {
                if heap_type == HeapType::DynamicState
                    && !device.capability_table().supports_images
                {
                    continue;
                }
                if self.is_shared_heap(heap_type) {
                    continue;
                }
                let allocation =
                    heap_helper.get_heap_allocation(heap_type, heap_size, completed)?;
                self.residency_container.push(Arc::clone(&allocation));
                let gpu_offset = self.heap_gpu_start_offset(&allocation, heap_type);
                let mut heap = IndirectHeap::new(allocation, heap_type, gpu_offset);
                if heap_type == HeapType::SurfaceState && self.reserved_ssh_size > 0 {
                    heap.get_space(self.reserved_ssh_size);
                }
                self.indirect_heaps[heap_type.index()] = Some(heap);
            }
        }

        self.heap_helper = Some(heap_helper);
        tracing::debug!(
            root_device_index = device.root_device_index(),
            heap_address_model = ?self.heap_address_model,
            shared_heaps = self.use_shared_heaps,
            "command container initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn heap_helper(&self) -> Option<&HeapHelper> {
        self.heap_helper.as_ref()
    }

    // ===== sizing =====

    fn debug_flags(&self) -> DebugFlags {
        self.device
            .as_ref()
            .map(|device| device.debug_flags().clone())
            .unwrap_or_default()
    }

    fn cmd_buffer_payload_size(&self) -> usize {
        match self.debug_flags().override_cmd_buffer_size_kb {
            Some(kb) if kb > 0 => kb * KILOBYTE,
            _ => DEFAULT_CMD_BUFFER_SIZE,
        }
    }

    /// Allocation size of one command buffer, 64K-page aligned
    pub fn aligned_cmd_buffer_size(&self) -> usize {
        align_up(
            self.cmd_buffer_payload_size() + CMD_BUFFER_RESERVED_SIZE,
            PAGE_SIZE_64K,
        )
    }

    /// Writable size of the command stream: the aligned allocation minus
    /// the reserved tail
    pub fn cmd_buffer_capacity(&self) -> usize {
        self.aligned_cmd_buffer_size() - CMD_BUFFER_RESERVED_SIZE
    }

    fn heap_size_with_flags(&self) -> usize {
        match self.debug_flags().force_default_heap_size_kb {
            Some(kb) if kb > 0 => kb * KILOBYTE,
            _ if self.default_heap_size > 0 => self.default_heap_size,
            _ => DEFAULT_HEAP_SIZE,
        }
    }

    fn completed_task_count_for_reuse(&self) -> u32 {
        self.immediate_cmd_list_csr
            .as_ref()
            .map(|csr| csr.completed_task_count())
            .unwrap_or(0)
    }

    fn heap_gpu_start_offset(
        &self,
        allocation: &Arc<GraphicsAllocation>,
        heap_type: HeapType,
    ) -> u64 {
        if heap_type == HeapType::IndirectObject {
            allocation.gpu_address() - self.instruction_heap_base_address
        } else {
            0
        }
    }

    fn allocate_command_buffer_allocation(&self) -> CmdResult<Arc<GraphicsAllocation>> {
        let Some(device) = self.device.as_ref() else {
            return Err(CmdForgeError::NotInitialized);
        };
        let size = self.aligned_cmd_buffer_size();
        let properties = AllocationProperties::new(
            device.root_device_index(),
            size,
            AllocationType::CommandBuffer,
        );
        device.memory_manager().allocate_graphics_memory(&properties)
    }

    // ===== streams =====

    pub fn command_stream(&self) -> Option<&LinearStream> {
        self.command_stream.as_ref()
    }

    pub fn command_stream_mut(&mut self) -> Option<&mut LinearStream> {
        self.command_stream.as_mut()
    }

    pub fn secondary_command_stream(&self) -> Option<&LinearStream> {
        self.secondary_command_stream.as_ref()
    }

    /// Swap the primary and secondary streams; false without a secondary
    pub fn swap_streams(&mut self) -> bool {
        match (
            self.command_stream.as_mut(),
            self.secondary_command_stream.as_mut(),
        ) {
            (Some(primary), Some(secondary)) => {
                std::mem::swap(primary, secondary);
                true
            }
            _ => false,
        }
    }

    /// Point the primary stream at an externally owned command buffer
    ///
    /// The allocation is made resident but the container does not take
    /// over freeing it. The reserved tail stays outside the stream
    /// capacity so the end-of-buffer marker always has room.
    pub fn set_cmd_buffer(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.residency_container.push(Arc::clone(&allocation));
        let capacity = allocation.size().saturating_sub(CMD_BUFFER_RESERVED_SIZE);
        if let Some(stream) = self.command_stream.as_mut() {
            stream.replace_buffer(allocation, capacity);
        }
    }

    // ===== dirty-heap tracking =====

    pub fn is_heap_dirty(&self, heap_type: HeapType) -> bool {
        self.dirty_heaps & heap_type.bit() != 0
    }

    pub fn is_any_heap_dirty(&self) -> bool {
        self.dirty_heaps != 0
    }

    /// Raw dirty mask; all-ones on a fresh container
    pub fn dirty_heaps(&self) -> u32 {
        self.dirty_heaps
    }

    pub fn set_heap_dirty(&mut self, heap_type: HeapType) {
        self.dirty_heaps |= heap_type.bit();
    }

    pub fn set_dirty_state_for_all_heaps(&mut self, dirty: bool) {
        self.dirty_heaps = if dirty { u32::MAX } else { 0 };
    }

    // ===== heaps =====

    pub fn indirect_heap(&self, heap_type: HeapType) -> Option<&IndirectHeap> {
        self.indirect_heaps[heap_type.index()].as_ref()
    }

    pub fn indirect_heap_mut(&mut self, heap_type: HeapType) -> Option<&mut IndirectHeap> {
        self.indirect_heaps[heap_type.index()].as_mut()
    }

    pub fn indirect_heap_allocation(
        &self,
        heap_type: HeapType,
    ) -> Option<&Arc<GraphicsAllocation>> {
        self.indirect_heaps[heap_type.index()]
            .as_ref()
            .and_then(|heap| heap.graphics_allocation())
    }

    /// Bind a heap of `heap_type` directly over a caller-managed backing
    ///
    /// Raw setter: no residency or deallocation bookkeeping happens; the
    /// caller owns the lifecycle of both the old and new backing.
    pub fn set_indirect_heap_allocation(
        &mut self,
        heap_type: HeapType,
        allocation: Arc<GraphicsAllocation>,
    ) {
        let gpu_offset = self.heap_gpu_start_offset(&allocation, heap_type);
        self.indirect_heaps[heap_type.index()] =
            Some(IndirectHeap::new(allocation, heap_type, gpu_offset));
    }

    /// GPU base the indirect-object heap contents are offset against
    pub fn instruction_heap_base_address(&self) -> u64 {
        self.instruction_heap_base_address
    }

    /// Whether the indirect-object heap backing sits in local memory
    pub fn is_indirect_heap_in_local_memory(&self) -> bool {
        self.indirect_heap_allocation(HeapType::IndirectObject)
            .map(|allocation| allocation.is_allocated_in_local_memory_pool())
            .unwrap_or(false)
    }

    /// Return the heap aligned and with `size_required` bytes available,
    /// growing its backing from the reuse pool when needed
    ///
    /// Growth rebinds the heap to a fresh backing, pushes the old one
    /// onto the deallocation container and raises the heap's dirty bit.
    ///
    /// # Panics
    /// Panics when the heap does not exist (shared heaps must be bound
    /// through [`reserve_space_for_dispatch`] first) or when a shared
    /// heap would have to grow.
    ///
    /// [`reserve_space_for_dispatch`]: CommandContainer::reserve_space_for_dispatch
    pub fn get_heap_with_required_size_and_alignment(
        &mut self,
        heap_type: HeapType,
        size_required: usize,
        alignment: usize,
    ) -> CmdResult<&mut IndirectHeap> {
        let index = heap_type.index();
        let (needs_growth, current_used) = match &self.indirect_heaps[index] {
            Some(heap) => (
                heap.available_space() < size_required + alignment,
                heap.used(),
            ),
            None => panic!(
                "{:?} heap not available; shared heaps must be reserved before use",
                heap_type
            ),
        };

        if needs_growth {
            assert!(
                !self.is_shared_heap(heap_type),
                "shared {:?} heap exhausted; a new reservation is required",
                heap_type
            );
            let grown_size = align_up(
                (current_used + size_required + alignment).max(self.heap_size_with_flags()),
                PAGE_SIZE,
            );
            let completed = self.completed_task_count_for_reuse();
            let allocation = {
                let Some(helper) = self.heap_helper.as_ref() else {
                    return Err(CmdForgeError::NotInitialized);
                };
                helper.get_heap_allocation(heap_type, grown_size, completed)?
            };
            self.residency_container.push(Arc::clone(&allocation));
            let gpu_offset = self.heap_gpu_start_offset(&allocation, heap_type);
            let reserved_prefix = if heap_type == HeapType::SurfaceState {
                self.reserved_ssh_size
            } else {
                0
            };
            let Some(heap) = self.indirect_heaps[index].as_mut() else {
                return Err(internal_error!("heap disappeared during growth"));
            };
            let old_allocation = heap.replace_graphics_allocation(allocation, gpu_offset);
            if reserved_prefix > 0 {
                heap.get_space(reserved_prefix);
            }
            if let Some(old_allocation) = old_allocation {
                self.deallocation_container.push(old_allocation);
            }
            self.dirty_heaps |= heap_type.bit();
            tracing::debug!(heap_type = ?heap_type, grown_size, "indirect heap grown");
        }

        let Some(heap) = self.indirect_heaps[index].as_mut() else {
            return Err(internal_error!("heap disappeared"));
        };
        heap.align(alignment);
        Ok(heap)
    }

    /// Reserve `size` bytes in the heap, growing it when needed
    pub fn get_heap_space_allow_grow(
        &mut self,
        heap_type: HeapType,
        size: usize,
    ) -> CmdResult<*mut u8> {
        let heap = self.get_heap_with_required_size_and_alignment(heap_type, size, 0)?;
        Ok(heap.get_space(size))
    }

    // ===== dispatch reservation protocol =====

    /// Carve (or confirm) heap windows for one dispatch
    ///
    /// With shared heaps this runs under the receiver's ownership lock,
    /// binds the shared surface/dynamic heaps on first use and rebinds
    /// the caller's reservation windows when they cannot absorb the
    /// request; a kept window is signaled by clearing the reservation
    /// output. With private heaps it only ensures space and clears both
    /// outputs.
    pub fn reserve_space_for_dispatch(
        &mut self,
        ssh_args: &mut HeapReserveArguments<'_>,
        dsh_args: &mut HeapReserveArguments<'_>,
        dsh_required: bool,
    ) -> CmdResult<()> {
        if self.use_shared_heaps {
            let csr = self.immediate_cmd_list_csr.clone().ok_or_else(|| {
                CmdForgeError::NoCommandStreamReceiver(
                    "shared heaps require an immediate command list receiver".to_string(),
                )
            })?;
            let _ownership = csr.obtain_unique_ownership();
            self.reserve_heap(HeapType::SurfaceState, ssh_args, &csr)?;
            if dsh_required {
                self.reserve_heap(HeapType::DynamicState, dsh_args, &csr)?;
            }
            return Ok(());
        }

        if ssh_args.size > 0 && self.indirect_heaps[HeapType::SurfaceState.index()].is_some() {
            self.get_heap_with_required_size_and_alignment(
                HeapType::SurfaceState,
                ssh_args.size,
                ssh_args.alignment,
            )?;
        }
        ssh_args.reservation = None;

        if dsh_required
            && dsh_args.size > 0
            && self.indirect_heaps[HeapType::DynamicState.index()].is_some()
        {
            self.get_heap_with_required_size_and_alignment(
                HeapType::DynamicState,
                dsh_args.size,
                dsh_args.alignment,
            )?;
        }
        dsh_args.reservation = None;
        Ok(())
    }

    fn reserve_heap(
        &mut self,
        heap_type: HeapType,
        args: &mut HeapReserveArguments<'_>,
        csr: &Arc<CommandStreamReceiver>,
    ) -> CmdResult<()> {
        let index = heap_type.index();
        if self.indirect_heaps[index].is_none() {
            let heap_size = self.heap_size_with_flags();
            let allocation = {
                let Some(helper) = self.heap_helper.as_ref() else {
                    return Err(CmdForgeError::NotInitialized);
                };
                helper.get_heap_allocation(heap_type, heap_size, csr.completed_task_count())?
            };
            self.residency_container.push(Arc::clone(&allocation));
            let gpu_offset = self.heap_gpu_start_offset(&allocation, heap_type);
            let mut heap = IndirectHeap::new(allocation, heap_type, gpu_offset);
            if heap_type == HeapType::SurfaceState && self.reserved_ssh_size > 0 {
                heap.get_space(self.reserved_ssh_size);
            }
            self.indirect_heaps[index] = Some(heap);
            self.dirty_heaps |= heap_type.bit();
        }

        let Some(reservation) = args.reservation.take() else {
            return Err(CmdForgeError::InvalidConfiguration(
                "shared-heap reservation requires a reservation target".to_string(),
            ));
        };
        let Some(heap) = self.indirect_heaps[index].as_mut() else {
            return Err(internal_error!("shared heap missing after binding"));
        };

        // The current window absorbs the request: leave the output empty.
        if reservation.is_bound_to(heap.graphics_allocation())
            && align_up(reservation.used(), args.alignment) + args.size
                <= reservation.window_start() + reservation.max_available_space()
        {
            return Ok(());
        }

        let window_start = heap.used();
        let window_end = align_up(window_start, args.alignment) + args.size;
        heap.get_space(window_end - window_start);
        let Some(parent) = heap.graphics_allocation().cloned() else {
            return Err(internal_error!("shared heap has no backing"));
        };
        reservation.rebind(heap.cpu_base(), window_start, window_end, parent);
        args.reservation = Some(reservation);
        Ok(())
    }

    /// [`reserve_space_for_dispatch`] against the container-owned
    /// reservation slots
    ///
    /// Immediate command lists without their own wrappers dispatch from
    /// these; the windows persist across calls so consecutive dispatches
    /// keep filling the same carve until it runs out.
    ///
    /// [`reserve_space_for_dispatch`]: CommandContainer::reserve_space_for_dispatch
    pub fn reserve_space_for_dispatch_in_owned_reserves(
        &mut self,
        ssh_size: usize,
        ssh_alignment: usize,
        dsh_size: usize,
        dsh_alignment: usize,
        dsh_required: bool,
    ) -> CmdResult<()> {
        let mut ssh = std::mem::take(&mut self.surface_state_heap_reserve);
        let mut dsh = std::mem::take(&mut self.dynamic_state_heap_reserve);
        let result = {
            let mut ssh_args =
                HeapReserveArguments::new(Some(&mut ssh), ssh_size, ssh_alignment);
            let mut dsh_args =
                HeapReserveArguments::new(Some(&mut dsh), dsh_size, dsh_alignment);
            self.reserve_space_for_dispatch(&mut ssh_args, &mut dsh_args, dsh_required)
        };
        self.surface_state_heap_reserve = ssh;
        self.dynamic_state_heap_reserve = dsh;
        result
    }

    pub fn surface_state_heap_reserve(&self) -> &ReservedIndirectHeap {
        &self.surface_state_heap_reserve
    }

    pub fn surface_state_heap_reserve_mut(&mut self) -> &mut ReservedIndirectHeap {
        &mut self.surface_state_heap_reserve
    }

    pub fn dynamic_state_heap_reserve(&self) -> &ReservedIndirectHeap {
        &self.dynamic_state_heap_reserve
    }

    pub fn dynamic_state_heap_reserve_mut(&mut self) -> &mut ReservedIndirectHeap {
        &mut self.dynamic_state_heap_reserve
    }

    /// The container-level heap a shared type is currently bound to
    pub fn immediate_cmd_list_shared_heap(&self, heap_type: HeapType) -> Option<&IndirectHeap> {
        if self.is_shared_heap(heap_type) {
            self.indirect_heaps[heap_type.index()].as_ref()
        } else {
            None
        }
    }

    // ===== command buffer chaining and reuse =====

    /// Write the end marker at the stream cursor and chain to a fresh
    /// command buffer
    pub fn close_and_allocate_next_command_buffer(&mut self) -> CmdResult<()> {
        {
            let Some(stream) = self.command_stream.as_mut() else {
                return Err(CmdForgeError::NotInitialized);
            };
            if !stream.is_bound() {
                return Err(CmdForgeError::NotInitialized);
            }
            let marker = BATCH_BUFFER_END.to_le_bytes();
            // The reserved tail past the stream capacity guarantees room
            // for the marker.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    marker.as_ptr(),
                    stream.cpu_base().add(stream.used()),
                    marker.len(),
                );
            }
        }
        self.allocate_next_command_buffer()
    }

    /// Bind the primary stream to the next command buffer, preferring
    /// the reuse lists over fresh memory
    pub fn allocate_next_command_buffer(&mut self) -> CmdResult<()> {
        let allocation = self.obtain_next_command_buffer_allocation()?;
        self.cmd_buffer_allocations.push(Arc::clone(&allocation));
        self.residency_container.push(Arc::clone(&allocation));
        let capacity = self.cmd_buffer_capacity();
        let Some(stream) = self.command_stream.as_mut() else {
            return Err(CmdForgeError::NotInitialized);
        };
        stream.replace_buffer(allocation, capacity);
        Ok(())
    }

    fn obtain_next_command_buffer_allocation(&mut self) -> CmdResult<Arc<GraphicsAllocation>> {
        let size = self.aligned_cmd_buffer_size();
        let completed = self.completed_task_count_for_reuse();
        if let Some(list) = self.immediate_reusable_allocation_list.as_mut() {
            if let Some(allocation) =
                list.detach_allocation(size, AllocationType::CommandBuffer, completed)
            {
                return Ok(allocation);
            }
        }
        if let Some(list) = &self.allocations_list {
            if let Some(allocation) =
                list.lock()
                    .detach_allocation(size, AllocationType::CommandBuffer, completed)
            {
                return Ok(allocation);
            }
        }
        self.allocate_command_buffer_allocation()
    }

    /// Detach a completed command buffer from the immediate reuse list
    /// and make it the current one
    ///
    /// Returns `None` without a receiver, without a list, or when every
    /// pooled buffer is still in flight.
    pub fn reuse_existing_cmd_buffer(&mut self) -> Option<Arc<GraphicsAllocation>> {
        let completed = self
            .immediate_cmd_list_csr
            .as_ref()?
            .completed_task_count();
        let size = self.aligned_cmd_buffer_size();
        let capacity = self.cmd_buffer_capacity();
        let allocation = self
            .immediate_reusable_allocation_list
            .as_mut()?
            .detach_allocation(size, AllocationType::CommandBuffer, completed)?;

        self.cmd_buffer_allocations.push(Arc::clone(&allocation));
        self.residency_container.push(Arc::clone(&allocation));
        if let Some(stream) = self.command_stream.as_mut() {
            stream.replace_buffer(Arc::clone(&allocation), capacity);
        }
        Some(allocation)
    }

    /// Move the most recent command buffer onto the immediate reuse list
    pub fn add_current_command_buffer_to_reusable_allocation_list(&mut self) {
        let Some(list) = self.immediate_reusable_allocation_list.as_mut() else {
            return;
        };
        let Some(buffer) = self.cmd_buffer_allocations.pop() else {
            return;
        };
        list.push_tail(buffer);
    }

    /// Prefill the immediate reuse list with command buffers and park
    /// heap spares in the device pool
    ///
    /// The amount comes from the `reusable_allocation_count` debug flag;
    /// zero still creates the (empty) list. Heap spares are stamped
    /// resident through the immediate receiver. With shared heaps or
    /// bindless mode a single surface-state spare stands in for all
    /// state heaps.
    pub fn fill_reusable_allocation_lists(&mut self) -> CmdResult<()> {
        if self.immediate_reusable_allocation_list.is_some() {
            return Ok(());
        }
        let Some(device) = self.device.clone() else {
            return Err(CmdForgeError::NotInitialized);
        };
        self.immediate_reusable_allocation_list = Some(AllocationsList::new());
        let amount = device.debug_flags().reusable_allocation_count;
        if amount == 0 {
            return Ok(());
        }

        let has_secondary = self.secondary_command_stream.is_some();
        for _ in 0..amount {
            let buffer = self.allocate_command_buffer_allocation()?;
            self.residency_container.push(Arc::clone(&buffer));
            if let Some(list) = self.immediate_reusable_allocation_list.as_mut() {
                list.push_tail(buffer);
            }
            if has_secondary {
                let host_buffer = self.allocate_command_buffer_allocation()?;
                self.residency_container.push(Arc::clone(&host_buffer));
                if let Some(list) = self.immediate_reusable_allocation_list.as_mut() {
                    list.push_tail(host_buffer);
                }
            }
        }

        let (Some(heap_helper), Some(csr)) = (
            self.heap_helper.clone(),
            self.immediate_cmd_list_csr.clone(),
        ) else {
            return Ok(());
        };
        let heap_size = self.heap_size_with_flags();
        let single_spare = self.use_shared_heaps || device.debug_flags().use_bindless_mode;
        for _ in 0..amount {
            if single_spare {
                self.store_heap_spare(&device, &heap_helper, &csr, HeapType::SurfaceState, heap_size)?;
            } else {
                for heap_type in HeapType::all() {
                    if heap_type == HeapType::DynamicState
                        && !device.capability_table().supports_images
                    {
                        continue;
                    }
                    self.store_heap_spare(&device, &heap_helper, &csr, heap_type, heap_size)?;
                }
            }
        }
        Ok(())
    }

    fn store_heap_spare(
        &self,
        device: &Arc<Device>,
        heap_helper: &HeapHelper,
        csr: &Arc<CommandStreamReceiver>,
        heap_type: HeapType,
        heap_size: usize,
    ) -> CmdResult<()> {
        // Allocate directly so each spare is net-new instead of cycling
        // through the pool being filled.
        let allocation_type = HeapHelper::allocation_type_for(heap_type);
        let use_local = device.use_local_memory_for_heaps()
            && allocation_type == AllocationType::InternalHeap;
        let properties =
            AllocationProperties::new(device.root_device_index(), heap_size, allocation_type)
                .with_local_memory(use_local);
        let spare = device.memory_manager().allocate_graphics_memory(&properties)?;
        csr.make_resident(&spare);
        heap_helper.store_heap_allocation(spare);
        Ok(())
    }

    pub fn immediate_reusable_allocation_list(&self) -> Option<&AllocationsList> {
        self.immediate_reusable_allocation_list.as_ref()
    }

    pub fn allocations_list(&self) -> Option<&Arc<Mutex<AllocationsList>>> {
        self.allocations_list.as_ref()
    }

    pub fn cmd_buffer_allocations(&self) -> &[Arc<GraphicsAllocation>] {
        &self.cmd_buffer_allocations
    }

    // ===== residency and deallocation =====

    pub fn residency_container(&self) -> &[Arc<GraphicsAllocation>] {
        &self.residency_container
    }

    pub fn residency_container_mut(&mut self) -> &mut Vec<Arc<GraphicsAllocation>> {
        &mut self.residency_container
    }

    /// Record an allocation for residency; `None` is ignored
    pub fn add_to_residency_container(&mut self, allocation: Option<&Arc<GraphicsAllocation>>) {
        if let Some(allocation) = allocation {
            self.residency_container.push(Arc::clone(allocation));
        }
    }

    /// Drop duplicate residency entries, keeping first-seen order
    pub fn remove_duplicates_from_residency_container(&mut self) {
        let mut seen = HashSet::new();
        self.residency_container
            .retain(|allocation| seen.insert(Arc::as_ptr(allocation)));
    }

    pub fn deallocation_container(&self) -> &[Arc<GraphicsAllocation>] {
        &self.deallocation_container
    }

    pub fn deallocation_container_mut(&mut self) -> &mut Vec<Arc<GraphicsAllocation>> {
        &mut self.deallocation_container
    }

    /// Defer freeing an allocation until reset or destruction
    pub fn defer_deallocation(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.deallocation_container.push(allocation);
    }

    // ===== reset and teardown =====

    /// Release retired command buffers, keeping `start_index` of them
    ///
    /// Released buffers go to the cross-container allocations list when
    /// one is attached, otherwise back to the memory manager. User-fence
    /// completion runs first unless disabled by debug flag.
    pub fn handle_cmd_buffer_allocations(&mut self, start_index: usize) {
        let Some(device) = self.device.clone() else {
            return;
        };
        if start_index >= self.cmd_buffer_allocations.len() {
            return;
        }
        let fence = !device.debug_flags().remove_user_fence_on_reset_and_destroy;
        for allocation in self.cmd_buffer_allocations.split_off(start_index) {
            if fence {
                device.memory_manager().handle_fence_completion(&allocation);
            }
            match &self.allocations_list {
                Some(list) => list.lock().push_tail(allocation),
                None => device.memory_manager().free_graphics_memory(allocation),
            }
        }
    }

    /// Return the container to its post-initialize shape
    ///
    /// Keeps the first command buffer and rebinds the stream to it,
    /// releases the rest, frees deferred deallocations, rebuilds the
    /// residency container from live allocations and rewinds the heaps
    /// (to the reserved prefix for surface state). Reset heaps are
    /// marked dirty. With `keep_current_state_heaps` the surface and
    /// dynamic state cursors survive; the indirect-object heap always
    /// rewinds.
    pub fn reset(&mut self) {
        self.handle_cmd_buffer_allocations(1);

        if let Some(device) = self.device.clone() {
            for allocation in self.deallocation_container.drain(..) {
                device.memory_manager().free_graphics_memory(allocation);
            }
        }

        self.residency_container.clear();

        let capacity = self.cmd_buffer_capacity();
        if let Some(buffer) = self.cmd_buffer_allocations.first().cloned() {
            self.residency_container.push(Arc::clone(&buffer));
            if let Some(stream) = self.command_stream.as_mut() {
                stream.replace_buffer(buffer, capacity);
            }
        }
        if let Some(secondary) = self.secondary_cmd_buffer_allocation.clone() {
            self.residency_container.push(Arc::clone(&secondary));
            if let Some(stream) = self.secondary_command_stream.as_mut() {
                stream.replace_buffer(secondary, capacity);
            }
        }

        for heap_type in HeapType::all() {
            if let Some(heap) = self.indirect_heaps[heap_type.index()].as_mut() {
                if let Some(allocation) = heap.graphics_allocation().cloned() {
                    self.residency_container.push(allocation);
                }
                let is_state_heap =
                    matches!(heap_type, HeapType::SurfaceState | HeapType::DynamicState);
                if self.keep_current_state_heaps && is_state_heap {
                    continue;
                }
                heap.reset();
                if heap_type == HeapType::SurfaceState && self.reserved_ssh_size > 0 {
                    heap.get_space(self.reserved_ssh_size);
                }
                self.dirty_heaps |= heap_type.bit();
            }
        }
    }
}

impl Drop for CommandContainer {
    fn drop(&mut self) {
        let Some(device) = self.device.clone() else {
            return;
        };
        let fence = !device.debug_flags().remove_user_fence_on_reset_and_destroy;

        self.handle_cmd_buffer_allocations(0);

        if let Some(secondary) = self.secondary_cmd_buffer_allocation.take() {
            if fence {
                device.memory_manager().handle_fence_completion(&secondary);
            }
            match &self.allocations_list {
                Some(list) => list.lock().push_tail(secondary),
                None => device.memory_manager().free_graphics_memory(secondary),
            }
        }

        // Retired heap backings return to the device pool.
        if let Some(helper) = self.heap_helper.take() {
            for slot in self.indirect_heaps.iter_mut() {
                if let Some(heap) = slot.take() {
                    if let Some(allocation) = heap.into_graphics_allocation() {
                        helper.store_heap_allocation(allocation);
                    }
                }
            }
        }

        for allocation in self.deallocation_container.drain(..) {
            device.memory_manager().free_graphics_memory(allocation);
        }

        if let Some(mut list) = self.immediate_reusable_allocation_list.take() {
            match &self.allocations_list {
                Some(global) => list.drain_into(&mut global.lock()),
                None => list.free_all_graphics_allocations(device.memory_manager().as_ref()),
            }
        }
    }
}
