//! Chained signal handlers
//!
//! The runtime may be embedded in a process that already installed its own
//! handlers for the signals it takes over. Those handlers are saved at install
//! time and get a chance at every fault the classifier does not recognize.

use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_void, siginfo_t};

use crate::fault::CanonicalFaultRecord;

/// Highest signal number (exclusive) whose handler can be saved
const MAX_SIGNAL: usize = 65;

/// The raw arguments of a signal handler invocation
#[derive(Debug, Clone, Copy)]
pub struct RawSignal {
    pub signo: c_int,
    pub info: *mut siginfo_t,
    pub context: *mut c_void,
}

impl RawSignal {
    /// A signal with no OS metadata attached
    pub fn detached(signo: c_int) -> Self {
        Self {
            signo,
            info: std::ptr::null_mut(),
            context: std::ptr::null_mut(),
        }
    }
}

/// Last-resort handling for faults the classifier deferred
pub trait FallbackHandler {
    /// Try to handle the fault; returns whether it was handled
    ///
    /// Called from signal context.
    fn offer(&self, record: &CanonicalFaultRecord, raw: &RawSignal) -> bool;
}

/// Handlers that were installed before the trap runtime
pub struct ChainedHandlers {
    saved: [Option<libc::sigaction>; MAX_SIGNAL],
    reset: [AtomicBool; MAX_SIGNAL],
    owner: Option<libc::sigaction>,
}

impl Default for ChainedHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChainedHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let saved: Vec<_> = (0..MAX_SIGNAL as c_int)
            .filter(|&signo| self.saved(signo).is_some())
            .collect();
        f.debug_struct("ChainedHandlers")
            .field("signals", &saved)
            .field("owner", &self.owner.map(|action| action.sa_sigaction))
            .finish()
    }
}

impl ChainedHandlers {
    pub fn new() -> Self {
        Self {
            saved: [None; MAX_SIGNAL],
            reset: std::array::from_fn(|_| AtomicBool::new(false)),
            owner: None,
        }
    }

    /// Action to put back if a chained handler replaces it
    ///
    /// Some handlers (the Rust standard library's stack overflow handler
    /// among them) reset their signal to `SIG_DFL` and return, expecting the
    /// fault to recur and kill the process. After such a call the owner
    /// action is reinstalled and the fault counts as not handled.
    pub fn set_owner(&mut self, action: libc::sigaction) {
        self.owner = Some(action);
    }

    /// Remember `action` as the previous handler of `signo`
    pub fn save(&mut self, signo: c_int, action: libc::sigaction) {
        if let Some(slot) = usize::try_from(signo).ok().and_then(|i| self.saved.get_mut(i)) {
            *slot = Some(action);
        }
    }

    /// The saved handler of `signo`, if any
    pub fn saved(&self, signo: c_int) -> Option<&libc::sigaction> {
        usize::try_from(signo)
            .ok()
            .and_then(|i| self.saved.get(i))
            .and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.saved.iter().all(Option::is_none)
    }

    /// Invoke the saved handler for `raw.signo`
    ///
    /// `SIG_DFL` (or no saved handler) is not handled, `SIG_IGN` is. Anything
    /// else is called with its own signal mask installed and counts as handled.
    /// A handler installed with `SA_RESETHAND` is treated as `SIG_DFL` after
    /// its first invocation. A handler that replaced the owner action (see
    /// [`ChainedHandlers::set_owner`]) did not handle the fault.
    ///
    /// # Safety
    /// `raw` must carry the arguments of the current handler invocation, and
    /// the saved handler must be safe to call with them.
    pub unsafe fn call(&self, raw: &RawSignal) -> bool {
        let Some(action) = self.saved(raw.signo) else {
            return false;
        };
        let index = raw.signo as usize;
        if self.reset[index].load(Ordering::SeqCst) {
            return false;
        }

        let handler = action.sa_sigaction;
        if handler == libc::SIG_DFL {
            return false;
        }
        if handler == libc::SIG_IGN {
            return true;
        }

        if action.sa_flags & libc::SA_RESETHAND != 0 {
            self.reset[index].store(true, Ordering::SeqCst);
        }

        let mut mask = action.sa_mask;
        if action.sa_flags & libc::SA_NODEFER == 0 {
            libc::sigaddset(&mut mask, raw.signo);
        }
        let mut previous: libc::sigset_t = std::mem::zeroed();
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, &mut previous);

        if action.sa_flags & libc::SA_SIGINFO != 0 {
            let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = std::mem::transmute(handler);
            f(raw.signo, raw.info, raw.context);
        } else {
            let f: extern "C" fn(c_int) = std::mem::transmute(handler);
            f(raw.signo);
        }

        libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut());
        !self.reclaim_displaced(raw.signo)
    }

    /// Reinstall the owner action if a chained handler replaced it
    ///
    /// Returns whether it had been replaced. Async-signal-safe.
    unsafe fn reclaim_displaced(&self, signo: c_int) -> bool {
        let Some(owner) = &self.owner else {
            return false;
        };
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signo, std::ptr::null(), &mut current) != 0 {
            return false;
        }
        if current.sa_sigaction == owner.sa_sigaction {
            return false;
        }
        libc::sigaction(signo, owner, std::ptr::null_mut());
        true
    }
}

impl FallbackHandler for ChainedHandlers {
    fn offer(&self, _record: &CanonicalFaultRecord, raw: &RawSignal) -> bool {
        // Safety: `raw` is the live invocation the dispatcher was handed
        unsafe { self.call(raw) }
    }
}
