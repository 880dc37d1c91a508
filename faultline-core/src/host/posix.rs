//! POSIX exception delivery for Linux x86_64.
//!
//! Installs process-wide SIGSEGV and SIGTRAP handlers that forward faults
//! to the engine and re-raise everything the engine does not claim, so an
//! ordinary crash still crashes with its original signal.
//!
//! # Handler configuration
//!
//! Both handlers use `SA_SIGINFO | SA_NODEFER` and run on the faulting
//! thread's regular stack:
//!
//! - `SA_NODEFER` because propagation deliberately faults from inside the
//!   handlers (compute callbacks read locked pages, triggers read their
//!   cells). A synchronous signal that arrives while its own signal is
//!   blocked is fatal, no handler runs, so nesting must stay deliverable.
//! - No `SA_ONSTACK`: an alternate stack does not nest. The second level
//!   of a nested fault would start at the same alternate-stack top and
//!   overwrite the frame below it.
//!
//! The write/read distinction comes from bit 1 of the page-fault error
//! code the kernel saves in `REG_ERR`. Single-stepping is the x86 trap
//! flag: set on the saved context by `enable_trap`, cleared here when the
//! step trap arrives.
//!
//! Handlers run engine code, including `tracing` events. With no
//! subscriber installed those are cheap no-ops; installing a subscriber
//! means accepting that its writer runs in signal context.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem;
use std::ptr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::mem::mmap::TRAP_FLAG;
use crate::mem::TrapToken;
use crate::reactive::Engine;

/// Bit 1 of the x86 page-fault error code: set when the access was a write.
const PF_WRITE: i64 = 0x2;

type SigActionFn = unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void);

struct ActionSlot(UnsafeCell<Option<libc::sigaction>>);

// SAFETY: written on the engine's owning thread during install/uninstall,
// read from handlers on that same thread.
unsafe impl Sync for ActionSlot {}

static PREV_SEGV: ActionSlot = ActionSlot(UnsafeCell::new(None));
static PREV_TRAP: ActionSlot = ActionSlot(UnsafeCell::new(None));

/// Installs the SIGSEGV and SIGTRAP handlers, saving whatever was there
/// for chaining and restore.
pub(crate) fn install() -> Result<()> {
    // SAFETY: sigaction with valid, fully initialized arguments.
    unsafe {
        let mut prev_segv: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &new_action(segv_handler), &mut prev_segv) != 0 {
            return Err(Error::HostInstall { errno: errno() });
        }
        let mut prev_trap: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGTRAP, &new_action(trap_handler), &mut prev_trap) != 0 {
            let errno = errno();
            libc::sigaction(libc::SIGSEGV, &prev_segv, ptr::null_mut());
            return Err(Error::HostInstall { errno });
        }
        *PREV_SEGV.0.get() = Some(prev_segv);
        *PREV_TRAP.0.get() = Some(prev_trap);
    }
    debug!("signal handlers installed");
    Ok(())
}

/// Restores the handlers saved at install time.
pub(crate) fn uninstall() {
    // SAFETY: restoring actions captured by install.
    unsafe {
        if let Some(prev) = (*PREV_SEGV.0.get()).take() {
            libc::sigaction(libc::SIGSEGV, &prev, ptr::null_mut());
        }
        if let Some(prev) = (*PREV_TRAP.0.get()).take() {
            libc::sigaction(libc::SIGTRAP, &prev, ptr::null_mut());
        }
    }
    debug!("signal handlers restored");
}

unsafe fn new_action(handler: SigActionFn) -> libc::sigaction {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    libc::sigemptyset(&mut action.sa_mask);
    action
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

unsafe extern "C" fn segv_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut c_void,
) {
    let addr = (*info).si_addr() as usize;
    let uc = ctx as *const libc::ucontext_t;
    let is_write = ((*uc).uc_mcontext.gregs[libc::REG_ERR as usize] & PF_WRITE) != 0;

    if Engine::on_page_fault(TrapToken::from_raw(ctx), is_write, addr) {
        // Claimed: the saved context now has the trap flag set and the
        // region is open; returning retries the instruction.
        return;
    }
    chain(&PREV_SEGV, sig, info, ctx);
}

unsafe extern "C" fn trap_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut c_void,
) {
    let uc = ctx as *mut libc::ucontext_t;
    // Clear the flag first or the resumed code keeps single-stepping.
    (*uc).uc_mcontext.gregs[libc::REG_EFL as usize] &= !TRAP_FLAG;

    if Engine::on_trap(TrapToken::from_raw(ctx)) {
        return;
    }
    chain(&PREV_TRAP, sig, info, ctx);
}

/// Hands an unclaimed signal to whoever owned it before us.
unsafe fn chain(
    slot: &ActionSlot,
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut c_void,
) {
    let Some(prev) = *slot.0.get() else {
        reset_to_default(sig);
        return;
    };
    let handler = prev.sa_sigaction;
    if handler == libc::SIG_DFL {
        // Reinstate the default disposition and return; the instruction
        // retries, faults again, and the process dies with this signal the
        // way it would have without us.
        libc::sigaction(sig, &prev, ptr::null_mut());
        return;
    }
    if handler == libc::SIG_IGN {
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        let f: SigActionFn = mem::transmute(handler);
        f(sig, info, ctx);
    } else {
        let f: unsafe extern "C" fn(libc::c_int) = mem::transmute(handler);
        f(sig);
    }
}

unsafe fn reset_to_default(sig: libc::c_int) {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(sig, &action, ptr::null_mut());
}
