mod common;

use common::{load, manager, manager_with, store, user_rw, va};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use kernel_vmm::{
    Access, FaultError, FaultKind, FaultOutcome, FaultReport, KernelFaultPolicy,
    MemoryManagerConfig, MemoryObject, ObjectKind, Placement, TerminationHandler, VmError,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder(Mutex<Vec<FaultReport>>);

impl TerminationHandler for Recorder {
    fn terminate(&self, report: &FaultReport) {
        self.0.lock().unwrap().push(*report);
    }
}

#[test]
fn destroy_returns_every_exclusive_frame() {
    let mm = manager(512);
    let free = mm.frames().stats().free;

    let a = mm.create_user_space().unwrap();
    let start = a
        .allocate_region(Placement::Anywhere, 4 * FRAME_SIZE, user_rw(), "heap")
        .unwrap();
    for page in 0..4 {
        store(&mm, &a, start + page * FRAME_SIZE, 1).unwrap();
    }
    let with_parent = mm.frames().stats().free;

    let b = mm.clone_user_space(&a).unwrap();
    store(&mm, &b, start, 2).unwrap();
    assert!(mm.frames().stats().free < with_parent);
    b.destroy();
    assert_eq!(mm.frames().stats().free, with_parent);
    assert_eq!(load(&mm, &a, start).unwrap(), 1);

    a.destroy();
    assert_eq!(mm.frames().stats().free, free);
}

#[test]
fn fresh_pages_read_as_zero() {
    let mm = manager(512);
    let a = mm.create_user_space().unwrap();
    let start = a
        .allocate_region(Placement::Anywhere, 2 * FRAME_SIZE, user_rw(), "dirty")
        .unwrap();
    for offset in (0..2 * FRAME_SIZE).step_by(512) {
        store(&mm, &a, start + offset, 0xff).unwrap();
    }
    a.destroy();

    let b = mm.create_user_space().unwrap();
    let start = b
        .allocate_region(Placement::Anywhere, 2 * FRAME_SIZE, user_rw(), "fresh")
        .unwrap();
    for offset in (0..2 * FRAME_SIZE).step_by(512) {
        assert_eq!(load(&mm, &b, start + offset).unwrap(), 0);
    }
}

#[test]
fn unrecoverable_user_faults_reach_the_handler() {
    let recorder = Arc::new(Recorder::default());
    let mm = manager(512).with_termination_handler(recorder.clone());
    let space = mm.create_user_space().unwrap();
    let ro = space
        .allocate_region(Placement::Anywhere, FRAME_SIZE, Access::read_only().with_user(true), "text")
        .unwrap();

    assert_eq!(load(&mm, &space, ro).unwrap(), 0);
    assert_eq!(
        store(&mm, &space, ro, 1),
        Err(FaultOutcome::Unrecoverable(FaultError::AccessViolation))
    );
    assert_eq!(
        load(&mm, &space, va(0x7fff_0000)),
        Err(FaultOutcome::Unrecoverable(FaultError::NoRegion))
    );

    let reports = recorder.0.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].address_space, space.id());
    assert_eq!(reports[0].address, ro);
    assert_eq!(reports[0].error, FaultError::AccessViolation);
    assert!(reports[0].kind.write());
    assert_eq!(reports[1].error, FaultError::NoRegion);
}

#[test]
fn out_of_memory_fault_terminates_the_process_only() {
    let recorder = Arc::new(Recorder::default());
    let mm = manager(512).with_termination_handler(recorder.clone());
    let space = mm.create_user_space().unwrap();
    let start = space
        .allocate_region(Placement::Anywhere, FRAME_SIZE, user_rw(), "heap")
        .unwrap();

    let hoard: Vec<_> = std::iter::from_fn(|| mm.frames().allocate().ok()).collect();
    assert!(!hoard.is_empty());
    assert_eq!(
        store(&mm, &space, start, 1),
        Err(FaultOutcome::Unrecoverable(FaultError::OutOfMemory))
    );
    assert_eq!(recorder.0.lock().unwrap().len(), 1);
    assert!(space.translate(start).is_none());

    drop(hoard);
    assert_eq!(store(&mm, &space, start, 1), Ok(Some(FaultOutcome::Resolved)));
}

#[test]
#[should_panic(expected = "kernel page fault")]
fn kernel_fault_without_recovery_panics() {
    let mm = manager(512);
    let space = mm.create_user_space().unwrap();
    let _ = mm.handle_page_fault(&space, va(0x4000), FaultKind::read_access());
}

#[test]
fn kernel_fault_under_terminate_policy_is_reported() {
    let recorder = Arc::new(Recorder::default());
    let config = MemoryManagerConfig {
        kernel_fault_policy: KernelFaultPolicy::Terminate,
        ..MemoryManagerConfig::default()
    };
    let mm = manager_with(512, config).with_termination_handler(recorder.clone());
    let space = mm.create_user_space().unwrap();
    let outcome = mm.handle_page_fault(&space, va(0x4000), FaultKind::read_access());
    assert_eq!(outcome, FaultOutcome::Unrecoverable(FaultError::NoRegion));
    assert_eq!(recorder.0.lock().unwrap().len(), 1);
}

#[test]
fn temporary_mapping_is_released_on_panic() {
    let mm = manager(256);
    let frame = mm.frames().allocate_zeroed().unwrap();

    let result = catch_unwind(AssertUnwindSafe(|| {
        mm.with_temporary_mapping(&frame, |bytes| {
            bytes[0] = 1;
            panic!("inside the mapping");
        })
    }));
    assert!(result.is_err());
    assert_eq!(mm.active_temporary_mappings(), 0);
    assert_eq!(frame.ref_count(), 1);

    let early = mm.with_temporary_mapping(&frame, |bytes| {
        if bytes[0] == 1 {
            return Some(bytes[0]);
        }
        None
    });
    assert_eq!(early, Some(1));
    assert_eq!(mm.active_temporary_mappings(), 0);
}

#[test]
fn device_mappings_are_uncached_and_shared_on_fork() {
    let mm = manager(512);
    let space = mm.create_user_space().unwrap();
    let mmio = PhysicalAddress::new(0xfee0_0000);
    let free = mm.frames().stats().free;
    let tables = space.table_frames();

    let at = mm
        .map_device(&space, mmio, 2 * FRAME_SIZE, user_rw(), "lapic")
        .unwrap();
    // One PDPT, one PD and one PT for the first low mapping.
    assert_eq!(space.table_frames() - tables, 3);
    let t = space.translate(at + FRAME_SIZE).unwrap();
    assert_eq!(t.address, mmio + FRAME_SIZE);
    assert!(t.flags.cache_disabled() && t.flags.writable());

    let region = space.find_region_containing(at).unwrap();
    assert_eq!(region.object().kind(), ObjectKind::Device);
    assert!(!region.object().is_owned());

    let child = mm.clone_user_space(&space).unwrap();
    assert!(!child.find_region_containing(at).unwrap().is_copy_on_write());
    assert_eq!(child.translate(at).unwrap().address, mmio);
    child.destroy();
    space.unmap_region(at).unwrap();
    // Only page tables were ever taken from RAM; they stay until the space dies.
    assert_eq!(mm.frames().stats().free, free - 3);
    drop(space);
    assert_eq!(mm.frames().stats().free, free + 1);
}

#[test]
fn physical_range_views_are_cacheable() {
    let mm = manager(512);
    let space = mm.create_user_space().unwrap();
    let fb = MemoryObject::create_for_physical_range(PhysicalAddress::new(0x8000_0000), 4 * FRAME_SIZE)
        .unwrap();
    let at = space
        .allocate_region_with_object(Placement::Anywhere, fb, 2 * FRAME_SIZE, 2 * FRAME_SIZE, user_rw(), "fb")
        .unwrap();
    let t = space.translate(at).unwrap();
    assert_eq!(t.address, PhysicalAddress::new(0x8000_2000));
    assert!(!t.flags.cache_disabled());
}

#[test]
fn mapping_errors_leave_the_space_unchanged() {
    let mm = manager(512);
    let space = mm.create_user_space().unwrap();
    space
        .allocate_region(Placement::Fixed(va(0x10_0000)), 2 * FRAME_SIZE, user_rw(), "a")
        .unwrap();
    let before = (space.amount_virtual(), space.regions().len());

    assert!(matches!(
        space.allocate_region(Placement::Fixed(va(0x10_1000)), FRAME_SIZE, user_rw(), "b"),
        Err(VmError::InvalidRange(_))
    ));
    assert_eq!(
        space.allocate_region(Placement::Anywhere, 100, user_rw(), "c"),
        Err(VmError::InvalidLength(100))
    );
    let small = MemoryObject::create_anonymous(mm.frames(), FRAME_SIZE).unwrap();
    assert_eq!(
        space.allocate_region_with_object(Placement::Anywhere, small, FRAME_SIZE, FRAME_SIZE, user_rw(), "d"),
        Err(VmError::InvalidOffset(FRAME_SIZE))
    );
    assert!(matches!(
        space.allocate_region(Placement::Fixed(va(0xffff_c000_0000_0000)), FRAME_SIZE, user_rw(), "e"),
        Err(VmError::InvalidRange(_))
    ));
    assert_eq!((space.amount_virtual(), space.regions().len()), before);
    space.verify();
}

#[test]
fn protect_then_write_faults() {
    let mm = manager(512);
    let space = mm.create_user_space().unwrap();
    let at = space
        .allocate_region(Placement::Anywhere, FRAME_SIZE, user_rw(), "data")
        .unwrap();
    store(&mm, &space, at, 5).unwrap();

    space.protect_region(at, Access::read_only().with_user(true)).unwrap();
    assert_eq!(
        store(&mm, &space, at, 6),
        Err(FaultOutcome::Unrecoverable(FaultError::AccessViolation))
    );
    assert_eq!(load(&mm, &space, at).unwrap(), 5);

    space.protect_region(at, user_rw()).unwrap();
    assert_eq!(store(&mm, &space, at, 6), Ok(None));
}
