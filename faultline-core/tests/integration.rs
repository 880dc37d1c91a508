//! End-to-end tests against the real fault machinery.
//!
//! These run on the default host stack: `mmap`-backed pages, SIGSEGV for
//! access interception, SIGTRAP for the single-step relock. Every read and
//! write of the region below goes through an actual hardware fault.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use faultline_core::{Engine, Mode, Region};

/// The engine is process-wide; tests hold this guard to run one at a time.
fn serial() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Fresh engine and region, tearing down anything a failed test left over.
fn setup(mode: Mode, size: usize) -> Region {
    Engine::shutdown();
    Engine::init(mode).expect("engine init");
    Engine::alloc(size).expect("region alloc")
}

/// A store that straddles a page boundary, as a single instruction. The
/// volatile helpers require alignment, so the two-pages-at-once case is
/// written out by hand.
unsafe fn store_u16(ptr: *mut u8, value: u16) {
    std::arch::asm!(
        "mov word ptr [{ptr}], {val:x}",
        ptr = in(reg) ptr,
        val = in(reg) value,
    );
}

/// Layout used by the chain tests.
const OFF_A: usize = 0; // u32 ref
const OFF_B: usize = 8; // u64 computed: 2 * a
const OFF_C: usize = 16; // u32 computed: a + (b as u32)

fn register_chain(region: Region) {
    Engine::ref_cell(region.at(OFF_A), 4).expect("ref a");
    Engine::computed(region.at(OFF_B), 8, move |out, region| {
        let a = unsafe { region.read::<u32>(OFF_A) } as u64;
        out.copy_from_slice(&(a * 2).to_le_bytes());
    })
    .expect("computed b");
    Engine::computed(region.at(OFF_C), 4, move |out, region| {
        let a = unsafe { region.read::<u32>(OFF_A) };
        let b = unsafe { region.read::<u64>(OFF_B) } as u32;
        out.copy_from_slice(&a.wrapping_add(b).to_le_bytes());
    })
    .expect("computed c");
}

/// Plain stores to a ref rewrite the computed cells derived from it, and
/// triggers observe each change with its pre-change bytes.
#[test]
fn writes_propagate_through_the_computed_chain() {
    let _g = serial();
    let region = setup(Mode::NonLazy, 64);
    register_chain(region);

    let b_log: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let c_log: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let log = Arc::clone(&b_log);
        Engine::watch(region.at(OFF_B), move |new, old, _| {
            // `new` is live region memory; reading it faults and is served
            // like any other access. `old` is an engine-owned snapshot.
            let new = unsafe { std::ptr::read_volatile(new as *const u64) };
            let old = unsafe { std::ptr::read(old as *const u64) };
            log.lock().unwrap().push((new, old));
        })
        .expect("watch b");
    }
    {
        let log = Arc::clone(&c_log);
        Engine::watch(region.at(OFF_C), move |new, old, _| {
            let new = unsafe { std::ptr::read_volatile(new as *const u32) };
            let old = unsafe { std::ptr::read(old as *const u32) };
            log.lock().unwrap().push((new, old));
        })
        .expect("watch c");
    }

    // Freshly mapped pages read as zero, through a fault each.
    assert_eq!(unsafe { region.read::<u32>(OFF_A) }, 0);
    assert_eq!(unsafe { region.read::<u64>(OFF_B) }, 0);
    assert_eq!(unsafe { region.read::<u32>(OFF_C) }, 0);

    unsafe { region.write::<u32>(OFF_A, 77) };
    assert_eq!(unsafe { region.read::<u64>(OFF_B) }, 154);
    assert_eq!(unsafe { region.read::<u32>(OFF_C) }, 231);

    // Second write exercises the rebuilt edges; old values are the results
    // of the first round.
    unsafe { region.write::<u32>(OFF_A, 79) };
    assert_eq!(unsafe { region.read::<u64>(OFF_B) }, 158);
    assert_eq!(unsafe { region.read::<u32>(OFF_C) }, 237);

    assert_eq!(*b_log.lock().unwrap(), vec![(154, 0), (158, 154)]);
    assert_eq!(*c_log.lock().unwrap(), vec![(231, 0), (237, 231)]);

    Engine::free(region).expect("free");
    Engine::shutdown();
}

/// A trigger on a ref fires once per store, including stores of the value
/// already present.
#[test]
fn ref_triggers_see_every_store() {
    let _g = serial();
    let region = setup(Mode::NonLazy, 64);
    Engine::ref_cell(region.at(OFF_A), 4).expect("ref a");

    let seen: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        Engine::watch(region.at(OFF_A), move |new, old, _| {
            let new = unsafe { std::ptr::read_volatile(new as *const u32) };
            let old = unsafe { std::ptr::read(old as *const u32) };
            seen.lock().unwrap().push((new, old));
        })
        .expect("watch a");
    }

    unsafe { region.write::<u32>(OFF_A, 5) };
    unsafe { region.write::<u32>(OFF_A, 7) };
    unsafe { region.write::<u32>(OFF_A, 7) };

    assert_eq!(*seen.lock().unwrap(), vec![(5, 0), (7, 5), (7, 7)]);

    Engine::free(region).expect("free");
    Engine::shutdown();
}

/// In lazy mode every read of a computed cell re-runs its callback; in
/// non-lazy mode reads return the propagated bytes without running it.
#[test]
fn lazy_reads_refresh_computed_cells() {
    let _g = serial();
    let region = setup(Mode::Lazy, 64);
    Engine::ref_cell(region.at(OFF_A), 4).expect("ref a");

    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        Engine::computed(region.at(OFF_B), 8, move |out, region| {
            runs.fetch_add(1, Ordering::SeqCst);
            let a = unsafe { region.read::<u32>(OFF_A) } as u64;
            out.copy_from_slice(&(a * 2).to_le_bytes());
        })
        .expect("computed b");
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1); // seeding run

    unsafe { region.write::<u32>(OFF_A, 4) };
    assert_eq!(runs.load(Ordering::SeqCst), 2); // propagation run

    assert_eq!(unsafe { region.read::<u64>(OFF_B) }, 8);
    assert_eq!(unsafe { region.read::<u64>(OFF_B) }, 8);
    assert_eq!(runs.load(Ordering::SeqCst), 4); // one refresh per read

    Engine::free(region).expect("free");
    Engine::shutdown();
}

/// A cell larger than a page straddles a boundary; a two-byte store across
/// that boundary is one instruction, one fault, one trigger.
#[test]
fn straddling_store_is_a_single_change() {
    let _g = serial();
    let region = setup(Mode::NonLazy, 3 * 4096);

    // 4097 bytes: all of page zero plus the first byte of page one.
    Engine::ref_cell(region.at(0), 4097).expect("ref pages");
    // Derived from the last byte of page zero, placed well clear on page 2.
    Engine::computed(region.at(8192), 1, move |out, region| {
        out[0] = unsafe { region.read::<u8>(4095) };
    })
    .expect("computed low");

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        Engine::watch(region.at(0), move |_, _, _| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .expect("watch pages");
    }

    unsafe { store_u16(region.at(4095), 0xABCD) };

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(unsafe { region.read::<u8>(4095) }, 0xCD);
    assert_eq!(unsafe { region.read::<u8>(4096) }, 0xAB);
    assert_eq!(unsafe { region.read::<u8>(8192) }, 0xCD);

    Engine::free(region).expect("free");
    Engine::shutdown();
}

/// The dependency set follows the callback's control flow: after the flag
/// flips, the branch not taken can change freely without recomputes.
#[test]
fn branch_flip_migrates_dependencies() {
    let _g = serial();
    let region = setup(Mode::NonLazy, 64);
    const FLAG: usize = 0;
    const X: usize = 4;
    const Y: usize = 8;
    const OUT: usize = 12;
    for off in [FLAG, X, Y] {
        Engine::ref_cell(region.at(off), 4).expect("ref");
    }
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        Engine::computed(region.at(OUT), 4, move |out, region| {
            runs.fetch_add(1, Ordering::SeqCst);
            let flag = unsafe { region.read::<u32>(FLAG) };
            let v = if flag != 0 {
                unsafe { region.read::<u32>(X) }
            } else {
                unsafe { region.read::<u32>(Y) }
            };
            out.copy_from_slice(&v.to_le_bytes());
        })
        .expect("computed out");
    }

    unsafe { region.write::<u32>(Y, 5) };
    assert_eq!(unsafe { region.read::<u32>(OUT) }, 5);

    unsafe { region.write::<u32>(FLAG, 1) };
    assert_eq!(unsafe { region.read::<u32>(OUT) }, 0); // x is still zero
    let after_flip = runs.load(Ordering::SeqCst);

    // y left the dependency set with the flip; writing it is inert.
    unsafe { region.write::<u32>(Y, 9) };
    assert_eq!(runs.load(Ordering::SeqCst), after_flip);
    assert_eq!(unsafe { region.read::<u32>(OUT) }, 0);

    unsafe { region.write::<u32>(X, 3) };
    assert_eq!(unsafe { region.read::<u32>(OUT) }, 3);

    Engine::free(region).expect("free");
    Engine::shutdown();
}

/// Pointer-valued refs: a computed cell that chases `next` pointers stored
/// in the region re-counts whenever the links it followed are rewritten.
#[test]
fn pointer_chase_follows_relinked_list() {
    let _g = serial();
    let region = setup(Mode::NonLazy, 128);

    // Three nodes of { value: u64, next: u64 holding an absolute address },
    // and a count cell derived by walking from the first node.
    const E1: usize = 0;
    const E2: usize = 16;
    const E3: usize = 32;
    const NEXT: usize = 8;
    const COUNT: usize = 48;
    for off in [E1, E2, E3] {
        Engine::ref_cell(region.at(off), 16).expect("ref node");
    }
    Engine::computed(region.at(COUNT), 8, move |out, region| {
        let mut n = 0u64;
        let mut cur = unsafe { region.read::<u64>(E1 + NEXT) };
        while cur != 0 {
            n += 1;
            // The links hold absolute addresses; follow them directly.
            cur = unsafe { std::ptr::read_volatile((cur as usize + NEXT) as *const u64) };
        }
        out.copy_from_slice(&n.to_le_bytes());
    })
    .expect("computed count");

    assert_eq!(unsafe { region.read::<u64>(COUNT) }, 0);

    unsafe { region.write::<u64>(E1 + NEXT, region.at(E2) as u64) };
    assert_eq!(unsafe { region.read::<u64>(COUNT) }, 1);

    // Linking e3 rewrites e2, which the last chase visited.
    unsafe { region.write::<u64>(E2 + NEXT, region.at(E3) as u64) };
    assert_eq!(unsafe { region.read::<u64>(COUNT) }, 2);

    // Unlinking everything after e1 shrinks the count again.
    unsafe { region.write::<u64>(E1 + NEXT, 0) };
    assert_eq!(unsafe { region.read::<u64>(COUNT) }, 0);

    Engine::free(region).expect("free");
    Engine::shutdown();
}

/// Freeing the region drops its cells; a new region starts zeroed and
/// empty while the engine keeps running.
#[test]
fn free_then_realloc_yields_a_clean_region() {
    let _g = serial();
    let region = setup(Mode::NonLazy, 64);
    Engine::ref_cell(region.at(0), 4).expect("ref");
    unsafe { region.write::<u32>(0, 9) };
    assert_eq!(Engine::cell_count(), 1);
    Engine::free(region).expect("free");

    let region = Engine::alloc(64).expect("realloc");
    assert_eq!(Engine::cell_count(), 0);
    assert_eq!(unsafe { region.read::<u32>(0) }, 0);
    Engine::ref_cell(region.at(0), 4).expect("ref again");
    unsafe { region.write::<u32>(0, 11) };
    assert_eq!(unsafe { region.read::<u32>(0) }, 11);

    Engine::free(region).expect("free again");
    Engine::shutdown();
}
