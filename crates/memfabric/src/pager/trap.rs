//! Process-wide page-fault trap.
//!
//! One SIGSEGV/SIGBUS handler is installed for the whole process. Each
//! arena that wants demand paging registers its host address range together
//! with a [`FaultResolver`]; the handler finds the slot covering the faulting
//! address and lets its resolver pull the page in. Faults outside every slot
//! are handed back to the disposition that was active before installation.
//!
//! The resolver runs on the faulting thread, inside the signal handler.

use crate::error::{FabricError, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Arenas that may be registered at the same time.
pub const MAX_TRAP_SLOTS: usize = 32;

/// What the handler should do after a resolver ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapVerdict {
    /// The page is accessible now; retry the faulting instruction
    Resolved,
    /// Not ours after all; chain to the previous disposition
    NotMine,
    /// Unrecoverable; log and abort
    Fatal(String),
}

/// Resolves faults inside one registered range.
pub trait FaultResolver: Send + Sync {
    fn resolve(&self, host_addr: usize) -> TrapVerdict;
}

struct Slot {
    start: usize,
    end: usize,
    resolver: Arc<dyn FaultResolver>,
}

static SLOTS: [AtomicPtr<Slot>; MAX_TRAP_SLOTS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_TRAP_SLOTS];
static ACTIVE_HANDLERS: AtomicUsize = AtomicUsize::new(0);
static INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PREVIOUS: OnceLock<(SigAction, SigAction)> = OnceLock::new();

/// Keeps a range registered; unregisters on drop.
pub struct TrapRegistration {
    index: usize,
}

impl Drop for TrapRegistration {
    fn drop(&mut self) {
        let slot = SLOTS[self.index].swap(ptr::null_mut(), Ordering::AcqRel);
        while ACTIVE_HANDLERS.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
        if !slot.is_null() {
            // SAFETY: the pointer came from Box::into_raw in `register` and
            // no handler can still be reading it.
            drop(unsafe { Box::from_raw(slot) });
        }
    }
}

impl std::fmt::Debug for TrapRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapRegistration")
            .field("slot", &self.index)
            .finish()
    }
}

/// Route faults in host range `[start, end)` to `resolver`.
pub fn register(
    start: usize,
    end: usize,
    resolver: Arc<dyn FaultResolver>,
) -> Result<TrapRegistration> {
    install()?;

    let slot = Box::into_raw(Box::new(Slot {
        start,
        end,
        resolver,
    }));
    for (index, entry) in SLOTS.iter().enumerate() {
        if entry
            .compare_exchange(ptr::null_mut(), slot, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(
                index,
                start = format_args!("{start:#x}"),
                end = format_args!("{end:#x}"),
                "fault trap range registered"
            );
            return Ok(TrapRegistration { index });
        }
    }

    // SAFETY: never published.
    drop(unsafe { Box::from_raw(slot) });
    Err(FabricError::TrapUnavailable(format!(
        "all {MAX_TRAP_SLOTS} trap slots are in use"
    )))
}

fn install() -> Result<()> {
    let _guard = INSTALL_LOCK.lock();
    if PREVIOUS.get().is_some() {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::SigAction(handle_fault),
        SaFlags::SA_SIGINFO | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and the registered resolvers.
    let segv = unsafe { sigaction(Signal::SIGSEGV, &action) }?;
    let bus = unsafe { sigaction(Signal::SIGBUS, &action) }?;
    let _ = PREVIOUS.set((segv, bus));
    tracing::info!("fault trap installed");
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

extern "C" fn handle_fault(signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    ACTIVE_HANDLERS.fetch_add(1, Ordering::AcqRel);
    // SAFETY: the kernel passes a valid siginfo with SA_SIGINFO.
    let addr = unsafe { fault_address(info) };

    let verdict = SLOTS
        .iter()
        .map(|entry| entry.load(Ordering::Acquire))
        .filter(|slot| !slot.is_null())
        // SAFETY: slots are freed only once ACTIVE_HANDLERS drops to zero.
        .map(|slot| unsafe { &*slot })
        .find(|slot| addr >= slot.start && addr < slot.end)
        .map(|slot| slot.resolver.resolve(addr))
        .unwrap_or(TrapVerdict::NotMine);
    ACTIVE_HANDLERS.fetch_sub(1, Ordering::AcqRel);

    match verdict {
        TrapVerdict::Resolved => {}
        TrapVerdict::NotMine => restore_previous(signo),
        TrapVerdict::Fatal(reason) => {
            tracing::error!(addr = format_args!("{addr:#x}"), %reason, "unrecoverable page fault");
            std::process::abort();
        }
    }
}

/// Reinstate the pre-trap disposition for `signo`; the faulting instruction
/// then re-executes under it.
fn restore_previous(signo: libc::c_int) {
    let Some((segv, bus)) = PREVIOUS.get() else {
        return;
    };
    let (signal, previous) = match Signal::try_from(signo) {
        Ok(Signal::SIGBUS) => (Signal::SIGBUS, bus),
        _ => (Signal::SIGSEGV, segv),
    };
    // SAFETY: sigaction is async-signal-safe.
    let _ = unsafe { sigaction(signal, previous) };
}
