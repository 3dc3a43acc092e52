#![cfg(feature = "ram")]

use hv_phys::{FrameAlloc, PhysAccess, PhysAttr, SparseRam};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn atomic_cas_increments_are_exact() {
    let threads = 8;
    let iters = 2_000;

    let ram = Arc::new(SparseRam::new());
    let slot = ram.alloc_4k().expect("frame") + 0x18;
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ram = Arc::clone(&ram);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let phys = PhysAccess::new(&*ram);
                start.wait();
                for _ in 0..iters {
                    let mut seen = phys.read_q(slot, PhysAttr::ATOMIC);
                    while let Err(actual) = phys.cmpxchg_q(slot, seen, seen + 1, PhysAttr::ATOMIC) {
                        seen = actual;
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    let phys = PhysAccess::new(&*ram);
    assert_eq!(phys.read_q(slot, PhysAttr::WRITEBACK), (threads * iters) as u64);
}

#[test]
fn losing_cas_leaves_winner_value_untorn() {
    let ram = Arc::new(SparseRam::new());
    let slot = ram.alloc_4k().expect("frame");
    let start = Arc::new(Barrier::new(2));

    let contenders: Vec<_> = [0x1111_1111_1111_1111_u64, 0x2222_2222_2222_2222]
        .into_iter()
        .map(|value| {
            let ram = Arc::clone(&ram);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                PhysAccess::new(&*ram).cmpxchg_q(slot, 0, value, PhysAttr::ATOMIC).is_ok()
            })
        })
        .collect();

    let wins: Vec<bool> = contenders.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(wins.iter().filter(|w| **w).count(), 1);

    let now = PhysAccess::new(&*ram).read_q(slot, PhysAttr::WRITEBACK);
    let winner = if wins[0] { 0x1111_1111_1111_1111 } else { 0x2222_2222_2222_2222 };
    assert_eq!(now, winner);
}
