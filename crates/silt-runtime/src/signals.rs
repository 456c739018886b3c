//! Signal discipline for the thread pool.
//!
//! Workers run with every signal but SIGSEGV blocked; the handlers below are
//! installed on the main thread while the pool runs. The interrupt path may
//! only swap a pre-armed message and write to an eventfd-style waker -
//! nothing here allocates or takes a parking lock.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::thread_pool::PoolShared;

/// The pool the process-wide handlers talk to. Published for the duration
/// of `ThreadPool::run` via a leaked Arc reference, reclaimed on uninstall.
static ACTIVE_POOL: AtomicPtr<PoolShared> = AtomicPtr::new(std::ptr::null_mut());

/// Block every signal except SIGSEGV on the calling thread. The event-queue
/// multiplexer may unblock a subset during `ppoll`-style waits; handlers
/// never observe that.
pub(crate) fn mask_worker_signals() {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        let res = libc::sigfillset(&mut mask);
        assert_eq!(res, 0, "could not build a full signal mask");
        let res = libc::sigdelset(&mut mask, libc::SIGSEGV);
        assert_eq!(res, 0, "could not remove SIGSEGV from the signal mask");
        let res = libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
        assert_eq!(res, 0, "could not apply the worker signal mask");
    }
}

unsafe fn install_handler(signal: libc::c_int, handler: usize, flags: libc::c_int) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler;
    action.sa_flags = flags;
    libc::sigemptyset(&mut action.sa_mask);
    let res = libc::sigaction(signal, &action, std::ptr::null_mut());
    assert_eq!(res, 0, "could not install handler for signal {signal}");
}

unsafe fn ignore_signal(signal: libc::c_int) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_IGN;
    libc::sigemptyset(&mut action.sa_mask);
    let res = libc::sigaction(signal, &action, std::ptr::null_mut());
    assert_eq!(res, 0, "could not ignore signal {signal}");
}

/// Uninstalls the SIGINT/SIGTERM handlers and releases the pool reference
/// when dropped.
pub(crate) struct InterruptGuard {
    raw: *const PoolShared,
}

pub(crate) fn install_interrupt_handlers(pool: &Arc<PoolShared>) -> InterruptGuard {
    let raw = Arc::into_raw(Arc::clone(pool));
    ACTIVE_POOL.store(raw as *mut PoolShared, Ordering::SeqCst);
    unsafe {
        install_handler(libc::SIGINT, interrupt_handler as usize, 0);
        install_handler(libc::SIGTERM, interrupt_handler as usize, 0);
    }
    InterruptGuard { raw }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe {
            ignore_signal(libc::SIGINT);
            ignore_signal(libc::SIGTERM);
        }
        ACTIVE_POOL.store(std::ptr::null_mut(), Ordering::SeqCst);
        unsafe {
            drop(Arc::from_raw(self.raw));
        }
    }
}

extern "C" fn interrupt_handler(_signal: libc::c_int) {
    let pool = ACTIVE_POOL.load(Ordering::SeqCst);
    if pool.is_null() {
        return;
    }
    // Swapping the message out of its slot means a second signal arriving
    // before anyone re-arms finds the slot empty: the same message object
    // can never be enqueued twice.
    unsafe { (*pool).deliver_interrupt() };
}

// --- SIGSEGV classification ----------------------------------------------

/// Fixed-capacity registry of stack guard regions, written with atomics so
/// the fault handler can scan it without taking a lock.
const MAX_GUARD_REGIONS: usize = crate::config::MAX_WORKERS;

static GUARD_STARTS: [AtomicUsize; MAX_GUARD_REGIONS] =
    [const { AtomicUsize::new(0) }; MAX_GUARD_REGIONS];
static GUARD_ENDS: [AtomicUsize; MAX_GUARD_REGIONS] =
    [const { AtomicUsize::new(0) }; MAX_GUARD_REGIONS];

fn register_guard_region(start: usize, end: usize) -> Option<usize> {
    if start == 0 || end <= start {
        return None;
    }
    for (index, slot) in GUARD_STARTS.iter().enumerate() {
        if slot
            .compare_exchange(0, start, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            GUARD_ENDS[index].store(end, Ordering::SeqCst);
            return Some(index);
        }
    }
    None
}

fn unregister_guard_region(index: usize) {
    GUARD_ENDS[index].store(0, Ordering::SeqCst);
    GUARD_STARTS[index].store(0, Ordering::SeqCst);
}

fn fault_in_guard_region(addr: usize) -> bool {
    for (index, slot) in GUARD_STARTS.iter().enumerate() {
        let start = slot.load(Ordering::SeqCst);
        if start != 0 && addr >= start && addr < GUARD_ENDS[index].load(Ordering::SeqCst) {
            return true;
        }
    }
    false
}

/// Per-worker fault handling: an alternate signal stack (a fault while the
/// regular stack is blown needs somewhere to run), the process-wide SIGSEGV
/// handler, and this thread's stack guard region in the registry.
pub(crate) struct WorkerFaultSetup {
    stack: Vec<u8>,
    guard_slot: Option<usize>,
}

impl WorkerFaultSetup {
    pub(crate) fn install() -> Self {
        let mut stack = vec![0u8; libc::SIGSTKSZ.max(64 * 1024)];
        unsafe {
            let ss = libc::stack_t {
                ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
                ss_flags: 0,
                ss_size: stack.len(),
            };
            let res = libc::sigaltstack(&ss, std::ptr::null_mut());
            assert_eq!(res, 0, "sigaltstack failed");
            install_handler(
                libc::SIGSEGV,
                segv_handler as usize,
                libc::SA_SIGINFO | libc::SA_ONSTACK,
            );
        }
        Self {
            stack,
            guard_slot: register_worker_stack_guard(),
        }
    }
}

impl Drop for WorkerFaultSetup {
    fn drop(&mut self) {
        if let Some(slot) = self.guard_slot {
            unregister_guard_region(slot);
        }
        unsafe {
            let ss = libc::stack_t {
                ss_sp: std::ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: self.stack.len(),
            };
            let _ = libc::sigaltstack(&ss, std::ptr::null_mut());
        }
    }
}

#[cfg(target_os = "linux")]
fn register_worker_stack_guard() -> Option<usize> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let mut guard_size: libc::size_t = 0;
        let ok = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size) == 0
            && libc::pthread_attr_getguardsize(&attr, &mut guard_size) == 0;
        libc::pthread_attr_destroy(&mut attr);
        if !ok || guard_size == 0 {
            return None;
        }
        // The guard pages sit immediately below the usable stack range.
        let end = stack_addr as usize;
        register_guard_region(end.saturating_sub(guard_size), end)
    }
}

#[cfg(not(target_os = "linux"))]
fn register_worker_stack_guard() -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        0
    } else {
        (*info).si_addr() as usize
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        0
    } else {
        (*info).si_addr as usize
    }
}

/// Async-signal-safe stderr write; formatting happens into stack buffers.
fn write_stderr(bytes: &[u8]) {
    unsafe {
        let _ = libc::write(2, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

fn write_hex(value: usize) {
    let mut digits = [0u8; 2 * std::mem::size_of::<usize>()];
    let len = digits.len();
    for (index, digit) in digits.iter_mut().enumerate() {
        let nibble = (value >> ((len - 1 - index) * 4)) & 0xf;
        *digit = match nibble {
            0..=9 => b'0' + nibble as u8,
            _ => b'a' + (nibble as u8 - 10),
        };
    }
    write_stderr(&digits);
}

extern "C" fn segv_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if signal == libc::SIGSEGV {
        let addr = unsafe { fault_address(info) };
        if fault_in_guard_region(addr) {
            write_stderr(b"fatal: worker stack overflow (fault in a stack guard region)\n");
        } else {
            write_stderr(b"fatal: segmentation fault reading address 0x");
            write_hex(addr);
            write_stderr(b"\n");
        }
    } else {
        write_stderr(b"fatal: unexpected signal in fault handler\n");
    }
    unsafe { libc::abort() }
}

// --- macOS timer fallback -------------------------------------------------
//
// kqueue cannot deliver sub-millisecond timeouts reliably, so a periodic
// SIGALRM fans a pre-armed tick message out to every worker instead.

#[cfg(target_os = "macos")]
const ITIMER_TICK_USEC: libc::suseconds_t = 5000;

#[cfg(target_os = "macos")]
pub(crate) struct ItimerGuard;

#[cfg(target_os = "macos")]
pub(crate) fn install_timer_signal() -> ItimerGuard {
    unsafe {
        install_handler(libc::SIGALRM, alrm_handler as usize, 0);
        let value = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: ITIMER_TICK_USEC,
            },
            it_value: libc::timeval {
                tv_sec: 0,
                tv_usec: ITIMER_TICK_USEC,
            },
        };
        let res = libc::setitimer(libc::ITIMER_REAL, &value, std::ptr::null_mut());
        assert_eq!(res, 0, "setitimer call failed");
    }
    ItimerGuard
}

#[cfg(target_os = "macos")]
impl Drop for ItimerGuard {
    fn drop(&mut self) {
        unsafe {
            let value = libc::itimerval {
                it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
                it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
            };
            let _ = libc::setitimer(libc::ITIMER_REAL, &value, std::ptr::null_mut());
            ignore_signal(libc::SIGALRM);
        }
    }
}

#[cfg(target_os = "macos")]
extern "C" fn alrm_handler(_signal: libc::c_int) {
    let pool = ACTIVE_POOL.load(Ordering::SeqCst);
    if pool.is_null() {
        return;
    }
    unsafe { (*pool).deliver_timer_tick() };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_registry_classifies_addresses() {
        let slot = register_guard_region(0x4000, 0x5000).expect("free slot");
        assert!(fault_in_guard_region(0x4000));
        assert!(fault_in_guard_region(0x4fff));
        assert!(!fault_in_guard_region(0x5000));
        assert!(!fault_in_guard_region(0x3fff));
        unregister_guard_region(slot);
        assert!(!fault_in_guard_region(0x4800));
    }

    #[test]
    fn degenerate_guard_regions_are_rejected() {
        assert!(register_guard_region(0, 0x1000).is_none());
        assert!(register_guard_region(0x2000, 0x2000).is_none());
    }
}
