//! Global termination flag and UNIX signal handling. SIGINT/SIGABRT/SIGTERM
//! are caught only by the watcher thread; every other thread blocks them
//! during setup so the kernel delivers the signal to the one thread that
//! can act on it (its blocking `poll` returns EINTR).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Process-wide shutdown flag. Set either by the signal handler (in the
/// watcher thread) or by a fatal internal error in any thread.
pub static TERMINATE: AtomicBool = AtomicBool::new(false);

/// The watcher thread's id, recorded so a fatal error on another thread
/// can target it directly. 0 means "not yet registered".
static WATCHER_THREAD: AtomicU64 = AtomicU64::new(0);

pub fn is_terminating() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// Called once by the watcher thread at startup so [`request_termination`]
/// can wake it even when it is parked in a blocking `poll()` with no
/// filesystem activity to interrupt it.
pub fn register_current_thread_as_watcher() {
    let tid = unsafe { libc::pthread_self() } as u64;
    WATCHER_THREAD.store(tid, Ordering::SeqCst);
}

/// Sets the termination flag and, if the watcher thread has registered
/// itself, sends it SIGTERM directly so its blocking `poll()` returns
/// `EINTR` even with no pending filesystem events.
pub fn request_termination() {
    TERMINATE.store(true, Ordering::SeqCst);
    let tid = WATCHER_THREAD.load(Ordering::SeqCst);
    if tid != 0 {
        unsafe {
            libc::pthread_kill(tid as libc::pthread_t, libc::SIGTERM);
        }
    }
}

extern "C" fn handle_termination_signal(_sig: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

const TERMINATION_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGABRT, libc::SIGTERM];

fn signal_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in TERMINATION_SIGNALS {
            libc::sigaddset(&mut set, sig);
        }
        set
    }
}

/// Blocks SIGINT/SIGABRT/SIGTERM in the calling thread. Called by the
/// parser and writer threads at startup so only the watcher ever receives
/// these signals.
pub fn block_termination_signals_in_current_thread() -> Result<()> {
    let set = signal_set();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}

/// Installs the process-wide handler and unblocks SIGINT/SIGABRT/SIGTERM
/// in the calling thread. Called by the watcher thread at startup.
///
/// The handler is installed without `SA_RESTART`, so a blocking syscall
/// (here, `poll`) is interrupted with `EINTR` rather than silently
/// resumed — that interruption is how the watcher notices shutdown.
pub fn install_termination_handler_in_current_thread() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_termination_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for sig in TERMINATION_SIGNALS {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
    }
    let set = signal_set();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}
