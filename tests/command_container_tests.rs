//! Command container lifecycle tests: initialization, heap growth,
//! buffer chaining, reuse lists and reset behavior

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use cmdforge::memory::constants::{
    CMD_BUFFER_RESERVED_SIZE, DEFAULT_CMD_BUFFER_SIZE, DEFAULT_HEAP_SIZE, KILOBYTE, PAGE_SIZE_64K,
};
use cmdforge::memory::{align_up, AllocationProperties, AllocationType};
use cmdforge::{
    AllocationsList, CmdForgeError, CommandContainer, CommandStreamReceiver, DebugFlags,
    HeapAddressModel, HeapType, MemoryManager, OBJECT_NOT_USED,
};

use common::{device_failing_after, device_with_counters, device_with_flags, device_without_images};

fn expected_aligned_size() -> usize {
    align_up(
        DEFAULT_CMD_BUFFER_SIZE + CMD_BUFFER_RESERVED_SIZE,
        PAGE_SIZE_64K,
    )
}

#[test]
fn test_initialize_with_heaps() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    assert!(container.is_initialized());
    // One command buffer plus one backing per heap type
    assert_eq!(mm.allocation_count(), 4);
    assert_eq!(container.residency_container().len(), 4);
    assert_eq!(container.cmd_buffer_allocations().len(), 1);
    assert_eq!(container.dirty_heaps(), u32::MAX);

    for heap_type in HeapType::all() {
        let heap = container.indirect_heap(heap_type).unwrap();
        assert!(heap.graphics_allocation().is_some());
        assert_eq!(heap.max_available_space(), DEFAULT_HEAP_SIZE);
    }
}

#[test]
fn test_initialize_without_heaps() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    assert_eq!(mm.allocation_count(), 1);
    for heap_type in HeapType::all() {
        assert!(container.indirect_heap(heap_type).is_none());
    }
    assert!(container.heap_helper().is_none());
}

#[test]
fn test_command_stream_sizing() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let aligned = expected_aligned_size();
    let stream = container.command_stream().unwrap();
    assert_eq!(stream.max_available_space(), aligned - CMD_BUFFER_RESERVED_SIZE);
    assert_eq!(
        container.cmd_buffer_allocations()[0].size(),
        aligned
    );
}

#[test]
fn test_cmd_buffer_size_override_flag() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_cmd_buffer_size_kb(64));
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let aligned = align_up(64 * KILOBYTE + CMD_BUFFER_RESERVED_SIZE, PAGE_SIZE_64K);
    assert_eq!(container.cmd_buffer_allocations()[0].size(), aligned);
    assert_eq!(
        container.command_stream().unwrap().max_available_space(),
        aligned - CMD_BUFFER_RESERVED_SIZE
    );
}

#[test]
fn test_forced_heap_size_flag() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_default_heap_size_kb(128));
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    for heap_type in HeapType::all() {
        let heap = container.indirect_heap(heap_type).unwrap();
        assert_eq!(heap.max_available_space(), 128 * KILOBYTE);
    }
}

#[test]
fn test_secondary_stream_initialization() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, true)
        .unwrap();

    assert_eq!(mm.allocation_count(), 2);
    assert_eq!(container.residency_container().len(), 2);
    assert!(container.secondary_command_stream().is_some());
    // The secondary buffer is not part of the retirement chain
    assert_eq!(container.cmd_buffer_allocations().len(), 1);
}

#[test]
fn test_swap_streams() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, true)
        .unwrap();

    let primary_base = container.command_stream().unwrap().cpu_base();
    let secondary_base = container.secondary_command_stream().unwrap().cpu_base();
    assert_ne!(primary_base, secondary_base);

    assert!(container.swap_streams());
    assert_eq!(container.command_stream().unwrap().cpu_base(), secondary_base);
    assert_eq!(
        container.secondary_command_stream().unwrap().cpu_base(),
        primary_base
    );
}

#[test]
fn test_initialize_out_of_memory() {
    let device = device_failing_after(0);
    let mut container = CommandContainer::new();
    let result = container.initialize(&device, None, DEFAULT_HEAP_SIZE, true, false);
    assert!(matches!(result, Err(CmdForgeError::OutOfDeviceMemory(_))));
}

#[test]
fn test_initialize_secondary_out_of_memory() {
    // First allocation (primary buffer) succeeds, secondary fails
    let device = device_failing_after(1);
    let mut container = CommandContainer::new();
    let result = container.initialize(&device, None, DEFAULT_HEAP_SIZE, false, true);
    assert!(matches!(result, Err(CmdForgeError::OutOfDeviceMemory(_))));
}

#[test]
fn test_initialize_heap_out_of_memory() {
    // Primary buffer succeeds, first heap backing fails
    let device = device_failing_after(1);
    let mut container = CommandContainer::new();
    let result = container.initialize(&device, None, DEFAULT_HEAP_SIZE, true, false);
    assert!(matches!(result, Err(CmdForgeError::OutOfDeviceMemory(_))));
}

#[test]
fn test_no_dynamic_state_heap_without_images() {
    let (device, mm) = device_without_images();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    assert!(container.indirect_heap(HeapType::DynamicState).is_none());
    assert!(container.indirect_heap(HeapType::SurfaceState).is_some());
    assert!(container.indirect_heap(HeapType::IndirectObject).is_some());
    assert_eq!(mm.allocation_count(), 3);
}

#[test]
fn test_global_addressing_models_skip_private_heaps() {
    for model in [HeapAddressModel::GlobalStateless, HeapAddressModel::GlobalBindless] {
        let (device, mm) = device_with_counters();
        let mut container = CommandContainer::new();
        container.set_heap_address_model(model);
        container
            .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
            .unwrap();

        assert_eq!(mm.allocation_count(), 1);
        for heap_type in HeapType::all() {
            assert!(container.indirect_heap(heap_type).is_none());
        }
        // Heap infrastructure still comes up for later stateless use
        assert!(container.heap_helper().is_some());
        assert_ne!(container.instruction_heap_base_address(), 0);
    }
}

#[test]
fn test_surface_state_reserved_prefix() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container.set_reserved_ssh_size(64);
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    let ssh = container.indirect_heap(HeapType::SurfaceState).unwrap();
    assert_eq!(ssh.used(), 64);
    // Other heaps are untouched
    assert_eq!(container.indirect_heap(HeapType::IndirectObject).unwrap().used(), 0);
}

#[test]
fn test_indirect_object_heap_gpu_offset() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    let ioh = container.indirect_heap(HeapType::IndirectObject).unwrap();
    let allocation = ioh.graphics_allocation().unwrap();
    assert_eq!(
        ioh.gpu_start_offset(),
        allocation.gpu_address() - container.instruction_heap_base_address()
    );
    // State heaps are addressed from their own base
    let ssh = container.indirect_heap(HeapType::SurfaceState).unwrap();
    assert_eq!(ssh.gpu_start_offset(), 0);
}

#[test]
fn test_heap_growth_defers_old_backing_and_marks_dirty() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();
    container.set_dirty_state_for_all_heaps(false);

    let old_allocation = container
        .indirect_heap_allocation(HeapType::SurfaceState)
        .cloned()
        .unwrap();
    let residency_before = container.residency_container().len();

    // Larger than the whole heap: must grow
    let heap = container
        .get_heap_with_required_size_and_alignment(
            HeapType::SurfaceState,
            DEFAULT_HEAP_SIZE + 1,
            0,
        )
        .unwrap();
    assert!(heap.available_space() >= DEFAULT_HEAP_SIZE + 1);

    let new_allocation = container
        .indirect_heap_allocation(HeapType::SurfaceState)
        .cloned()
        .unwrap();
    assert!(!Arc::ptr_eq(&old_allocation, &new_allocation));

    // Old backing is deferred, not freed, and the heap went dirty
    assert_eq!(container.deallocation_container().len(), 1);
    assert!(Arc::ptr_eq(&container.deallocation_container()[0], &old_allocation));
    assert!(container.is_heap_dirty(HeapType::SurfaceState));
    assert!(!container.is_heap_dirty(HeapType::DynamicState));
    assert_eq!(container.residency_container().len(), residency_before + 1);
}

#[test]
fn test_heap_growth_applies_to_indirect_object_heap() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();
    container.set_dirty_state_for_all_heaps(false);

    container
        .get_heap_space_allow_grow(HeapType::IndirectObject, DEFAULT_HEAP_SIZE + 512)
        .unwrap();
    assert!(container.is_heap_dirty(HeapType::IndirectObject));
    assert_eq!(container.deallocation_container().len(), 1);
}

#[test]
fn test_heap_growth_keeps_surface_state_prefix() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container.set_reserved_ssh_size(64);
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    container
        .get_heap_space_allow_grow(HeapType::SurfaceState, DEFAULT_HEAP_SIZE)
        .unwrap();
    // New backing starts with the reserved prefix consumed again
    let ssh = container.indirect_heap(HeapType::SurfaceState).unwrap();
    assert_eq!(ssh.used(), 64 + DEFAULT_HEAP_SIZE);
}

#[test]
fn test_heap_space_without_growth_keeps_backing() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();
    container.set_dirty_state_for_all_heaps(false);

    container
        .get_heap_space_allow_grow(HeapType::SurfaceState, 256)
        .unwrap();
    assert!(container.deallocation_container().is_empty());
    assert!(!container.is_heap_dirty(HeapType::SurfaceState));
    assert_eq!(
        container.indirect_heap(HeapType::SurfaceState).unwrap().used(),
        256
    );
}

#[test]
fn test_grown_heap_backing_comes_from_device_pool() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    // Park a big enough spare in the device pool
    let spare = device
        .memory_manager()
        .allocate_graphics_memory(&AllocationProperties::new(
            0,
            4 * DEFAULT_HEAP_SIZE,
            AllocationType::LinearStream,
        ))
        .unwrap();
    device.heap_reuse_storage().lock().push_tail(Arc::clone(&spare));
    let allocations_before = mm.allocation_count();

    container
        .get_heap_space_allow_grow(HeapType::SurfaceState, 2 * DEFAULT_HEAP_SIZE)
        .unwrap();

    assert_eq!(mm.allocation_count(), allocations_before);
    assert!(Arc::ptr_eq(
        container.indirect_heap_allocation(HeapType::SurfaceState).unwrap(),
        &spare
    ));
}

#[test]
fn test_close_and_allocate_next_writes_end_marker() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let first_buffer = container.cmd_buffer_allocations()[0].clone();
    container.command_stream_mut().unwrap().get_space(8);

    container.close_and_allocate_next_command_buffer().unwrap();

    // Marker sits at the old cursor position in the old buffer
    let marker = unsafe { std::slice::from_raw_parts(first_buffer.cpu_base().add(8), 4) };
    assert_eq!(marker, &[0x00, 0x00, 0x00, 0x05]);

    assert_eq!(container.cmd_buffer_allocations().len(), 2);
    let stream = container.command_stream().unwrap();
    assert_eq!(stream.used(), 0);
    assert!(!Arc::ptr_eq(
        stream.graphics_allocation().unwrap(),
        &first_buffer
    ));
}

#[test]
fn test_end_marker_fits_past_a_full_stream() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let capacity = container.command_stream().unwrap().max_available_space();
    container.command_stream_mut().unwrap().get_space(capacity);
    // The reserved tail absorbs the marker even at full capacity
    container.close_and_allocate_next_command_buffer().unwrap();
    assert_eq!(container.cmd_buffer_allocations().len(), 2);
}

#[test]
fn test_end_marker_fits_past_a_full_external_cmd_buffer() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let external = device
        .memory_manager()
        .allocate_graphics_memory(&AllocationProperties::new(
            0,
            8 * KILOBYTE,
            AllocationType::CommandBuffer,
        ))
        .unwrap();
    container.set_cmd_buffer(Arc::clone(&external));

    let capacity = container.command_stream().unwrap().max_available_space();
    // The marker still fits inside the backing once the stream is full
    assert!(capacity + 4 <= external.size());
    container.command_stream_mut().unwrap().get_space(capacity);
    container.close_and_allocate_next_command_buffer().unwrap();

    let marker = unsafe { std::slice::from_raw_parts(external.cpu_base().add(capacity), 4) };
    assert_eq!(marker, &[0x00, 0x00, 0x00, 0x05]);
}

#[test]
fn test_allocate_next_prefers_global_list() {
    let global = Arc::new(Mutex::new(AllocationsList::new()));
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, Some(Arc::clone(&global)), DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    container.allocate_next_command_buffer().unwrap();
    let retired = container.cmd_buffer_allocations()[1].clone();
    assert_eq!(mm.allocation_count(), 2);

    // Reset retires the second buffer into the global list
    container.reset();
    assert_eq!(global.lock().len(), 1);
    assert!(global.lock().peek_contains(&retired));

    // The next chain reuses it instead of allocating
    container.allocate_next_command_buffer().unwrap();
    assert_eq!(mm.allocation_count(), 2);
    assert!(global.lock().is_empty());
    assert!(Arc::ptr_eq(&container.cmd_buffer_allocations()[1], &retired));
}

#[test]
fn test_reset_keeps_first_buffer_and_rewinds_heaps() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container.set_reserved_ssh_size(64);
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    let first_buffer = container.cmd_buffer_allocations()[0].clone();
    container.command_stream_mut().unwrap().get_space(128);
    container.allocate_next_command_buffer().unwrap();
    container
        .get_heap_space_allow_grow(HeapType::IndirectObject, 512)
        .unwrap();
    container.set_dirty_state_for_all_heaps(false);

    let frees_before = mm.free_count();
    container.reset();

    // Buffer zero survives and the stream rewinds onto it; the second
    // buffer was freed (no reuse list attached)
    assert_eq!(container.cmd_buffer_allocations().len(), 1);
    assert!(Arc::ptr_eq(&container.cmd_buffer_allocations()[0], &first_buffer));
    let stream = container.command_stream().unwrap();
    assert_eq!(stream.used(), 0);
    assert!(Arc::ptr_eq(stream.graphics_allocation().unwrap(), &first_buffer));
    assert_eq!(mm.free_count(), frees_before + 1);

    // Heaps rewound (surface state back to its prefix) and marked dirty
    assert_eq!(
        container.indirect_heap(HeapType::SurfaceState).unwrap().used(),
        64
    );
    assert_eq!(
        container.indirect_heap(HeapType::IndirectObject).unwrap().used(),
        0
    );
    for heap_type in HeapType::all() {
        assert!(container.is_heap_dirty(heap_type));
    }

    // Residency rebuilt: buffer zero plus three heap backings
    assert_eq!(container.residency_container().len(), 4);
}

#[test]
fn test_reset_frees_deferred_deallocations() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    container
        .get_heap_space_allow_grow(HeapType::SurfaceState, DEFAULT_HEAP_SIZE + 1)
        .unwrap();
    assert_eq!(container.deallocation_container().len(), 1);

    let frees_before = mm.free_count();
    container.reset();
    assert!(container.deallocation_container().is_empty());
    assert_eq!(mm.free_count(), frees_before + 1);
}

#[test]
fn test_reset_can_keep_state_heap_cursors() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    container
        .get_heap_space_allow_grow(HeapType::SurfaceState, 256)
        .unwrap();
    container
        .get_heap_space_allow_grow(HeapType::DynamicState, 128)
        .unwrap();
    container
        .get_heap_space_allow_grow(HeapType::IndirectObject, 512)
        .unwrap();
    container.set_dirty_state_for_all_heaps(false);

    container.set_keep_current_state_heaps(true);
    container.reset();

    // State heap cursors survive, the indirect-object heap rewinds
    assert_eq!(
        container.indirect_heap(HeapType::SurfaceState).unwrap().used(),
        256
    );
    assert_eq!(
        container.indirect_heap(HeapType::DynamicState).unwrap().used(),
        128
    );
    assert_eq!(
        container.indirect_heap(HeapType::IndirectObject).unwrap().used(),
        0
    );
    assert!(container.is_heap_dirty(HeapType::IndirectObject));
    assert!(!container.is_heap_dirty(HeapType::SurfaceState));
    assert!(!container.is_heap_dirty(HeapType::DynamicState));

    // Kept heaps stay resident
    assert_eq!(container.residency_container().len(), 4);
}

#[test]
fn test_reset_rebinds_secondary_stream() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, true)
        .unwrap();

    let secondary_base = container.secondary_command_stream().unwrap().cpu_base();
    container.swap_streams();
    container.command_stream_mut().unwrap().get_space(32);
    container.swap_streams();

    container.reset();
    let secondary = container.secondary_command_stream().unwrap();
    assert_eq!(secondary.used(), 0);
    assert_eq!(secondary.cpu_base(), secondary_base);
    assert_eq!(container.residency_container().len(), 2);
}

#[test]
fn test_fence_completion_on_reset_and_destroy() {
    let global = Arc::new(Mutex::new(AllocationsList::new()));
    let (device, mm) =
        device_with_flags(DebugFlags::new().with_remove_user_fence(false));

    {
        let mut container = CommandContainer::new();
        container
            .initialize(&device, Some(Arc::clone(&global)), DEFAULT_HEAP_SIZE, false, true)
            .unwrap();
        container.allocate_next_command_buffer().unwrap();

        container.reset();
        assert_eq!(mm.fence_completion_count(), 1);
        assert_eq!(global.lock().len(), 1);
    }

    // Destruction fences the remaining primary and secondary buffers
    assert_eq!(mm.fence_completion_count(), 3);
    assert_eq!(global.lock().len(), 3);
}

#[test]
fn test_fence_completion_suppressed_by_default() {
    let global = Arc::new(Mutex::new(AllocationsList::new()));
    let (device, mm) = device_with_counters();

    {
        let mut container = CommandContainer::new();
        container
            .initialize(&device, Some(Arc::clone(&global)), DEFAULT_HEAP_SIZE, false, true)
            .unwrap();
        container.allocate_next_command_buffer().unwrap();
        container.reset();
    }

    assert_eq!(mm.fence_completion_count(), 0);
    assert_eq!(global.lock().len(), 3);
}

#[test]
fn test_destroy_returns_heap_backings_to_pool_without_fencing() {
    let (device, mm) =
        device_with_flags(DebugFlags::new().with_remove_user_fence(false));
    let pool = device.heap_reuse_storage();

    {
        let mut container = CommandContainer::new();
        container
            .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
            .unwrap();
    }

    // Three heap backings parked, one command buffer fenced and freed
    assert_eq!(pool.lock().len(), 3);
    assert_eq!(mm.fence_completion_count(), 1);
    assert_eq!(mm.free_count(), 1);
}

#[test]
fn test_next_container_reuses_pooled_heap_backings() {
    let (device, mm) = device_with_counters();

    {
        let mut container = CommandContainer::new();
        container
            .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
            .unwrap();
    }
    assert_eq!(device.heap_reuse_storage().lock().len(), 3);
    let allocations_before = mm.allocation_count();

    // Only the command buffer is fresh; every heap comes from the pool
    let mut next = CommandContainer::new();
    next.initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();
    assert_eq!(mm.allocation_count(), allocations_before + 1);
    assert!(device.heap_reuse_storage().lock().is_empty());
}

#[test]
fn test_fill_reusable_allocation_lists_zero_amount() {
    let (device, mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();
    let allocations_before = mm.allocation_count();

    container.fill_reusable_allocation_lists().unwrap();

    // The list is created but stays empty
    assert!(container.immediate_reusable_allocation_list().unwrap().is_empty());
    assert_eq!(mm.allocation_count(), allocations_before);
}

#[test]
fn test_fill_reusable_allocation_lists_with_heap_spares() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(1));
    let csr = Arc::new(CommandStreamReceiver::new());
    let mut container = CommandContainer::new();
    container.set_immediate_cmd_list_csr(Arc::clone(&csr));
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();
    let residency_before = container.residency_container().len();

    container.fill_reusable_allocation_lists().unwrap();

    // One command buffer pooled and resident
    assert_eq!(container.immediate_reusable_allocation_list().unwrap().len(), 1);
    assert_eq!(container.residency_container().len(), residency_before + 1);

    // One spare per heap type parked in the device pool, stamped for
    // the next submission
    let pool = device.heap_reuse_storage();
    assert_eq!(pool.lock().len(), 3);
    assert_eq!(pool.lock().peek_head().unwrap().residency_task_count(), 1);
}

#[test]
fn test_fill_reusable_allocation_lists_runs_once() {
    let (device, mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(1));
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    container.fill_reusable_allocation_lists().unwrap();
    let allocations_after_first = mm.allocation_count();

    // The list already exists: a second fill is a no-op
    container.fill_reusable_allocation_lists().unwrap();
    assert_eq!(mm.allocation_count(), allocations_after_first);
    assert_eq!(container.immediate_reusable_allocation_list().unwrap().len(), 1);
}

#[test]
fn test_fill_reusable_allocation_lists_with_secondary_stream() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(1));
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, true)
        .unwrap();
    let residency_before = container.residency_container().len();

    container.fill_reusable_allocation_lists().unwrap();

    // A buffer pair per slot: primary plus secondary
    assert_eq!(container.immediate_reusable_allocation_list().unwrap().len(), 2);
    assert_eq!(container.residency_container().len(), residency_before + 2);
}

#[test]
fn test_fill_reusable_allocation_lists_single_spare_in_bindless_mode() {
    let (device, _mm) = device_with_flags(
        DebugFlags::new()
            .with_reusable_allocation_count(1)
            .with_bindless_mode(true),
    );
    let csr = Arc::new(CommandStreamReceiver::new());
    let mut container = CommandContainer::new();
    container.set_immediate_cmd_list_csr(csr);
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    container.fill_reusable_allocation_lists().unwrap();

    let pool = device.heap_reuse_storage();
    assert_eq!(pool.lock().len(), 1);
    assert_eq!(
        pool.lock().peek_head().unwrap().allocation_type(),
        AllocationType::LinearStream
    );
}

#[test]
fn test_fill_reusable_allocation_lists_skips_spares_without_csr() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(2));
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, true, false)
        .unwrap();

    container.fill_reusable_allocation_lists().unwrap();

    assert_eq!(container.immediate_reusable_allocation_list().unwrap().len(), 2);
    assert!(device.heap_reuse_storage().lock().is_empty());
}

#[test]
fn test_reuse_existing_cmd_buffer_requires_csr() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(1));
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();
    container.fill_reusable_allocation_lists().unwrap();

    assert!(container.reuse_existing_cmd_buffer().is_none());
}

#[test]
fn test_reuse_existing_cmd_buffer_gated_by_completed_task_count() {
    let (device, _mm) = device_with_counters();
    let csr = Arc::new(CommandStreamReceiver::new());
    let mut container = CommandContainer::new();
    container.set_immediate_cmd_list_csr(Arc::clone(&csr));
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();
    container.fill_reusable_allocation_lists().unwrap();

    // Retire the current buffer as if submitted with task count 10
    let in_flight = container.cmd_buffer_allocations()[0].clone();
    in_flight.update_task_count(10);
    container.add_current_command_buffer_to_reusable_allocation_list();
    assert!(container.cmd_buffer_allocations().is_empty());

    // Still in flight: tag is at zero
    assert!(container.reuse_existing_cmd_buffer().is_none());

    csr.set_completed_task_count(10);
    let reused = container.reuse_existing_cmd_buffer().unwrap();
    assert!(Arc::ptr_eq(&reused, &in_flight));
    assert_eq!(container.cmd_buffer_allocations().len(), 1);
    let stream = container.command_stream().unwrap();
    assert!(Arc::ptr_eq(stream.graphics_allocation().unwrap(), &in_flight));
    assert_eq!(stream.used(), 0);
}

#[test]
fn test_never_submitted_buffer_always_reusable() {
    let (device, _mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(1));
    let csr = Arc::new(CommandStreamReceiver::new());
    let mut container = CommandContainer::new();
    container.set_immediate_cmd_list_csr(csr);
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();
    container.fill_reusable_allocation_lists().unwrap();

    let pooled = container
        .immediate_reusable_allocation_list()
        .unwrap()
        .peek_head()
        .cloned()
        .unwrap();
    assert_eq!(pooled.task_count(), OBJECT_NOT_USED);

    // Tag still at zero, but a never-submitted buffer passes the gate
    let reused = container.reuse_existing_cmd_buffer().unwrap();
    assert!(Arc::ptr_eq(&reused, &pooled));
}

#[test]
fn test_destroy_drains_immediate_list_into_global_list() {
    let global = Arc::new(Mutex::new(AllocationsList::new()));
    let (device, mm) =
        device_with_flags(DebugFlags::new().with_reusable_allocation_count(2));

    {
        let mut container = CommandContainer::new();
        container
            .initialize(&device, Some(Arc::clone(&global)), DEFAULT_HEAP_SIZE, false, false)
            .unwrap();
        container.fill_reusable_allocation_lists().unwrap();
    }

    // Two pooled buffers plus the retired primary
    assert_eq!(global.lock().len(), 3);
    assert_eq!(mm.free_count(), 0);
}

#[test]
fn test_set_cmd_buffer_binds_external_allocation() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let external = device
        .memory_manager()
        .allocate_graphics_memory(&AllocationProperties::new(
            0,
            8 * KILOBYTE,
            AllocationType::CommandBuffer,
        ))
        .unwrap();
    let buffers_before = container.cmd_buffer_allocations().len();

    container.set_cmd_buffer(Arc::clone(&external));

    let stream = container.command_stream().unwrap();
    assert!(Arc::ptr_eq(stream.graphics_allocation().unwrap(), &external));
    assert_eq!(
        stream.max_available_space(),
        external.size() - CMD_BUFFER_RESERVED_SIZE
    );
    assert_eq!(stream.used(), 0);
    // Resident, but not owned for retirement
    assert!(container.residency_container().iter().any(|a| Arc::ptr_eq(a, &external)));
    assert_eq!(container.cmd_buffer_allocations().len(), buffers_before);
}

#[test]
fn test_residency_deduplication_keeps_first_seen_order() {
    let (device, _mm) = device_with_counters();
    let mut container = CommandContainer::new();
    container
        .initialize(&device, None, DEFAULT_HEAP_SIZE, false, false)
        .unwrap();

    let buffer = container.cmd_buffer_allocations()[0].clone();
    let extra = device
        .memory_manager()
        .allocate_graphics_memory(&AllocationProperties::new(
            0,
            4 * KILOBYTE,
            AllocationType::LinearStream,
        ))
        .unwrap();

    container.add_to_residency_container(Some(&buffer));
    container.add_to_residency_container(Some(&extra));
    container.add_to_residency_container(Some(&buffer));
    assert_eq!(container.residency_container().len(), 4);

    container.remove_duplicates_from_residency_container();
    let residency = container.residency_container();
    assert_eq!(residency.len(), 2);
    assert!(Arc::ptr_eq(&residency[0], &buffer));
    assert!(Arc::ptr_eq(&residency[1], &extra));
}
