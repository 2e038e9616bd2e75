//! Frame accounting, fork sharing and swap behaviour through the public
//! kernel interface.

mod common;

use common::*;
use std::collections::BTreeSet;
use vmcore::memory::{FaultError, FrameId, FrameTable, MemoryError, PageState};
use vmcore::process::{WaitOptions, WaitStatus};
use vmcore::{KernelConfig, Pid, SharingPolicy};

fn refcount_at(kernel: &vmcore::Kernel, pid: Pid, addr: u32) -> u16 {
    match kernel.page_state(pid, addr) {
        Some(PageState::Resident { refcount, .. }) => refcount,
        other => panic!("page {:#x} of task {} not resident: {:?}", addr, pid, other),
    }
}

/// Free plus used frames always add up to the pool, whatever sequence of
/// allocate, share and free runs against it.
#[test]
fn frame_conservation_under_random_operations() {
    let mut frames = FrameTable::new(32);
    let mut held: Vec<FrameId> = Vec::new();
    let mut seed = 0x2545_f491_u32;

    for _ in 0..5000 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let pick = (seed >> 8) as usize;
        match (seed >> 16) % 3 {
            0 => {
                if let Some(frame) = frames.allocate() {
                    held.push(frame);
                }
            }
            1 if !held.is_empty() => {
                let frame = held[pick % held.len()];
                frames.share(frame);
                held.push(frame);
            }
            _ if !held.is_empty() => {
                let frame = held.swap_remove(pick % held.len());
                frames.free(frame);
            }
            _ => {}
        }

        let distinct: BTreeSet<FrameId> = held.iter().copied().collect();
        assert_eq!(frames.free_frames() + frames.used_frames(), frames.total());
        assert_eq!(frames.used_frames(), distinct.len());
        for frame in distinct {
            let refs = held.iter().filter(|&&h| h == frame).count();
            assert_eq!(frames.refcount(frame) as usize, refs);
        }
    }
}

#[test]
fn kernel_frames_are_conserved_across_lifecycles() {
    let mut kernel = kernel(KernelConfig::default().with_frames(16));
    let mut pids = Vec::new();
    for i in 0..4 {
        let pid = spawn(&mut kernel, &patterned_image("worker", i));
        kernel.write_user(pid, 4096 - 8, b"tail").unwrap();
        pids.push(pid);
        pids.push(kernel.fork(pid).unwrap());
        assert_consistent(&kernel);
    }
    for pid in pids {
        kernel.exit(pid, 0).unwrap();
        assert_consistent(&kernel);
    }
    while let Ok(WaitStatus::Exited { .. }) = kernel.wait(Pid::ROOT, None, WaitOptions::default()) {}
    assert_eq!(kernel.frames().free_frames(), 16);
    assert_eq!(kernel.tasks().len(), 1);
}

/// Two forks of a one-page task leave one frame mapped three times.
#[test]
fn forking_twice_shares_one_frame() {
    let mut kernel = kernel(KernelConfig::default());
    let parent = spawn(&mut kernel, &one_page_image("parent"));
    let used = kernel.frames().used_frames();

    let first = kernel.fork(parent).unwrap();
    let second = kernel.fork(parent).unwrap();

    for pid in [parent, first, second] {
        assert_eq!(refcount_at(&kernel, pid, 0), 3);
    }
    assert_eq!(kernel.frames().used_frames(), used);
    assert_eq!(kernel.stats().page_copies, 0);
    assert_eq!(kernel.stats().forks, 3, "spawn forks from the root too");
    assert_consistent(&kernel);
}

#[test]
fn copy_on_write_separates_writers() {
    let mut kernel = kernel(KernelConfig::default().with_sharing(SharingPolicy::CopyOnWrite));
    let parent = spawn(&mut kernel, &patterned_image("parent", 1));
    let before = kernel.read_user(parent, 0, 64).unwrap();
    let child = kernel.fork(parent).unwrap();
    assert_eq!(refcount_at(&kernel, child, 0), 2);

    kernel.write_user(child, 0, b"child was here").unwrap();
    assert_eq!(kernel.read_user(parent, 0, 64).unwrap(), before);
    assert_eq!(refcount_at(&kernel, parent, 0), 1);
    assert_eq!(refcount_at(&kernel, child, 0), 1);
    assert_eq!(kernel.stats().page_copies, 1);
    assert_consistent(&kernel);
}

#[test]
fn shared_pages_see_each_others_writes_by_default() {
    let mut kernel = kernel(KernelConfig::default());
    let parent = spawn(&mut kernel, &one_page_image("parent"));
    let child = kernel.fork(parent).unwrap();
    kernel.write_user(parent, 8, b"shared").unwrap();
    assert_eq!(kernel.read_user(child, 8, 6).unwrap(), b"shared");
}

/// A page written to swap and faulted back in is byte-identical.
#[test]
fn swapped_page_comes_back_identical() {
    let (mut kernel, disk) = kernel_with_swap(KernelConfig::default().with_frames(2));
    let image = patterned_image("victim", 7);
    let pid = spawn(&mut kernel, &image);

    let spare = kernel.allocate_frame().unwrap();
    let forced = kernel.allocate_frame().unwrap();
    let slot = match kernel.page_state(pid, 0) {
        Some(PageState::Swapped { slot }) => slot,
        other => panic!("page was not evicted: {:?}", other),
    };
    for (i, chunk) in image.code.chunks(1024).enumerate() {
        assert_eq!(disk.peek(slot.first_block() + i as u64), chunk);
    }
    kernel.free_frame(spare);
    kernel.free_frame(forced);

    assert_eq!(kernel.read_user(pid, 0, 4096).unwrap(), image.code);
    assert_eq!(kernel.stats().swap_ins, 1);
    assert!(!kernel.swap().unwrap().is_used(kernel.cache(), slot));
    assert_consistent(&kernel);
}

/// With every frame mapped by a one-page task, one more allocation evicts
/// exactly one page and succeeds.
#[test]
fn exhausted_pool_evicts_one_page() {
    let (mut kernel, _disk) = kernel_with_swap(KernelConfig::default().with_frames(4));
    let pids: Vec<Pid> = (0..4)
        .map(|i| spawn(&mut kernel, &patterned_image("task", i)))
        .collect();
    assert_eq!(kernel.frames().free_frames(), 0);

    let frame = kernel.allocate_frame().expect("reclaim makes room");
    let swapped: Vec<Pid> = pids
        .iter()
        .copied()
        .filter(|&pid| matches!(kernel.page_state(pid, 0), Some(PageState::Swapped { .. })))
        .collect();
    assert_eq!(swapped, vec![pids[0]]);
    assert_eq!(kernel.stats().evictions, 1);
    assert_eq!(kernel.swap().unwrap().free_slots(kernel.cache()), 14);

    kernel.free_frame(frame);
    assert_consistent(&kernel);
}

#[test]
fn exhausted_pool_without_swap_is_out_of_memory() {
    let mut kernel = kernel(KernelConfig::default().with_frames(2));
    spawn(&mut kernel, &one_page_image("a"));
    spawn(&mut kernel, &one_page_image("b"));
    assert_eq!(kernel.allocate_frame(), Err(MemoryError::OutOfMemory));
}

#[test]
fn shared_pages_are_not_evicted() {
    let (mut kernel, _disk) = kernel_with_swap(KernelConfig::default().with_frames(1));
    let parent = spawn(&mut kernel, &one_page_image("parent"));
    kernel.fork(parent).unwrap();
    assert_eq!(kernel.allocate_frame(), Err(MemoryError::OutOfMemory));
    assert_eq!(kernel.stats().evictions, 0);
}

/// Forking a task with a page in swap reads it back for the parent and
/// gives the slot to the child.
#[test]
fn fork_hands_swap_slot_to_child() {
    let (mut kernel, _disk) = kernel_with_swap(KernelConfig::default().with_frames(3));
    let image = patterned_image("parent", 3);
    let parent = spawn(&mut kernel, &image);
    let spare = kernel.allocate_frame().unwrap();
    let other = kernel.allocate_frame().unwrap();
    let forced = kernel.allocate_frame().unwrap();
    let slot = match kernel.page_state(parent, 0) {
        Some(PageState::Swapped { slot }) => slot,
        other => panic!("page was not evicted: {:?}", other),
    };
    kernel.free_frame(spare);
    kernel.free_frame(other);
    kernel.free_frame(forced);

    let child = kernel.fork(parent).unwrap();
    assert!(matches!(kernel.page_state(parent, 0), Some(PageState::Resident { refcount: 1, .. })));
    assert_eq!(kernel.page_state(child, 0), Some(PageState::Swapped { slot }));
    assert_consistent(&kernel);

    assert_eq!(kernel.read_user(child, 0, 4096).unwrap(), image.code);
    assert_eq!(kernel.read_user(parent, 0, 4096).unwrap(), image.code);
    assert_consistent(&kernel);
}

#[test]
fn exit_returns_frames_and_swap_slots() {
    let (mut kernel, _disk) = kernel_with_swap(KernelConfig::default().with_frames(2));
    let pid = spawn(&mut kernel, &one_page_image("short"));
    kernel.write_user(pid, 0x0300_0000 + 4096, b"stack").unwrap_err();
    kernel.write_user(pid, vmcore::config::TASK_SIZE - 8, b"stack").unwrap();
    let spare = kernel.allocate_frame().unwrap();
    assert_eq!(kernel.tasks().get(pid).unwrap().space().swapped_pages(), 1);
    kernel.free_frame(spare);

    kernel.exit(pid, 0).unwrap();
    assert_eq!(kernel.frames().free_frames(), 2);
    assert_eq!(kernel.swap().unwrap().free_slots(kernel.cache()), 15);
    assert_consistent(&kernel);
}

#[test]
fn bad_address_is_reported_to_the_faulting_task_only() {
    let mut kernel = kernel(KernelConfig::default());
    let pid = spawn(&mut kernel, &one_page_image("bad"));
    let other = spawn(&mut kernel, &one_page_image("good"));
    let addr = 0x0100_0000;
    assert_eq!(kernel.read_user(pid, addr, 1), Err(FaultError::Segv { addr }));
    let sigsegv = vmcore::signal::constants::SIGSEGV;
    assert!(kernel.tasks().get(pid).unwrap().signals().is_pending(sigsegv));
    assert!(!kernel.tasks().get(other).unwrap().signals().is_pending(sigsegv));
}
