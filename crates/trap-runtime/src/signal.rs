//! Process-wide signal handler installation and the handler entry point
//!
//! [`install`] takes over the synchronous fault signals (plus `SIGPIPE` and
//! `SIGXFSZ`, which are acknowledged and ignored) once per process. The
//! handler adapts the raw context, dispatches, and applies the result:
//! a redirect rewrites the saved pc, a fatal disposition reports and aborts.

use std::{
    io, ptr,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Mutex, PoisonError,
    },
};

use libc::{c_int, c_void, siginfo_t};

use crate::{
    adapter::{FaultContextAdapter, NativeAdapter},
    chain::{ChainedHandlers, RawSignal},
    classify::{Classifier, Disposition},
    config::TrapConfig,
    diagnostic::{report_and_abort, FatalDiagnostic},
    dispatch::TrapDispatcher,
    error::{RuntimeError, RuntimeResult},
    fault::CanonicalFaultRecord,
    os::SavedErrno,
    resolver::ContinuationResolver,
    serialize::SerializationPage,
    thread::{self, ManagedThread, ThreadState},
};

/// Signals the trap runtime handles
pub const HANDLED_SIGNALS: [c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGPIPE,
    libc::SIGXFSZ,
];

/// Signals that stay deliverable while the handler runs
const SYNCHRONOUS_SIGNALS: [c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
];

/// Flag bits that matter when checking an installed action; the C library
/// adds `SA_RESTORER` (0x04000000) on its own
const SIGNIFICANT_FLAGS: c_int = !0x0400_0000;

static RUNTIME: AtomicPtr<TrapRuntime> = AtomicPtr::new(ptr::null_mut());
static INSTALL: Mutex<()> = Mutex::new(());

/// Process-wide trap handling state
pub struct TrapRuntime {
    config: TrapConfig,
    resolver: Box<dyn ContinuationResolver + Send + Sync>,
    chain: ChainedHandlers,
    serialization: Option<SerializationPage>,
    owned: Vec<c_int>,
    previous: Vec<(c_int, libc::sigaction)>,
}

impl TrapRuntime {
    pub fn config(&self) -> &TrapConfig {
        &self.config
    }

    pub fn resolver(&self) -> &dyn ContinuationResolver {
        &*self.resolver
    }

    pub fn chained_handlers(&self) -> &ChainedHandlers {
        &self.chain
    }

    pub fn serialization_page(&self) -> Option<&SerializationPage> {
        self.serialization.as_ref()
    }

    /// Signals whose handler the runtime installed
    pub fn owned_signals(&self) -> &[c_int] {
        &self.owned
    }

    /// Dispatcher wired to this runtime's resolver, serialization page and
    /// chained handlers
    pub fn dispatcher(&self) -> TrapDispatcher<'_> {
        let mut classifier = Classifier::new(&*self.resolver);
        if let Some(page) = &self.serialization {
            classifier = classifier.with_serialization_page(page);
        }
        let dispatcher = TrapDispatcher::new(classifier);
        if self.chain.is_empty() {
            dispatcher
        } else {
            dispatcher.with_fallback(&self.chain)
        }
    }

    /// Decide a fault on a thread attached as `state`
    ///
    /// A fault raised while the same thread is already handling one is fatal.
    pub fn handle(
        &self,
        record: &CanonicalFaultRecord,
        raw: &RawSignal,
        state: Option<&ThreadState>,
    ) -> Disposition {
        let _scope = match state {
            Some(state) => match state.begin_fault_handling() {
                Some(scope) => Some(scope),
                None => {
                    return Disposition::Fatal(FatalDiagnostic::capture(
                        "recursive fault while handling a fault",
                        record,
                    ))
                }
            },
            None => None,
        };
        let thread = state.map(|state| state as &dyn ManagedThread);
        self.dispatcher().dispatch(record, raw, thread)
    }
}

impl std::fmt::Debug for TrapRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapRuntime")
            .field("config", &self.config)
            .field("chain", &self.chain)
            .field("serialization", &self.serialization)
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}

/// The installed runtime, if any
pub fn installed() -> Option<&'static TrapRuntime> {
    // Safety: only ever set to a leaked, never freed runtime
    unsafe { RUNTIME.load(Ordering::Acquire).as_ref() }
}

/// Install the trap handlers for this process
///
/// Pre-existing foreign handlers are left alone when
/// `allow_user_signal_handlers` is set, saved for chaining when
/// `use_signal_chaining` is set, and rejected with
/// [`RuntimeError::ConflictingHandler`] otherwise. Installing twice returns
/// [`RuntimeError::AlreadyInstalled`].
pub fn install(
    config: TrapConfig,
    resolver: impl ContinuationResolver + Send + Sync + 'static,
) -> RuntimeResult<&'static TrapRuntime> {
    config.validate()?;
    let _installing = INSTALL.lock().unwrap_or_else(PoisonError::into_inner);
    if installed().is_some() {
        return Err(RuntimeError::AlreadyInstalled);
    }

    let action = handler_action();
    let mut chain = ChainedHandlers::new();
    chain.set_owner(action);
    let mut previous_actions = Vec::with_capacity(HANDLED_SIGNALS.len());
    for signo in HANDLED_SIGNALS {
        let previous = current_action(signo)?;
        if !is_foreign(&previous) {
            previous_actions.push((signo, previous));
            continue;
        }
        if config.allow_user_signal_handlers {
            tracing::info!(signal = signo, "leaving pre-existing handler in place");
        } else if config.use_signal_chaining {
            chain.save(signo, previous);
            previous_actions.push((signo, previous));
        } else {
            return Err(RuntimeError::ConflictingHandler {
                signal: signo,
                handler: previous.sa_sigaction,
            });
        }
    }

    let serialization = if config.use_serialization_page {
        Some(SerializationPage::new()?)
    } else {
        None
    };

    let runtime: &'static TrapRuntime = Box::leak(Box::new(TrapRuntime {
        config,
        resolver: Box::new(resolver),
        chain,
        serialization,
        owned: previous_actions.iter().map(|&(signo, _)| signo).collect(),
        previous: previous_actions,
    }));
    // Published first so the handler never runs without it
    RUNTIME.store(runtime as *const TrapRuntime as *mut TrapRuntime, Ordering::Release);

    if let Err(err) = set_actions(&runtime.previous, &action) {
        // Left leaked: a handler may still be running on it
        RUNTIME.store(ptr::null_mut(), Ordering::Release);
        tracing::warn!(error = %err, "trap handler installation rolled back");
        return Err(err);
    }

    tracing::info!(
        signals = ?runtime.owned,
        chained = !runtime.chain.is_empty(),
        serialization_page = runtime.serialization.is_some(),
        "trap handlers installed"
    );
    Ok(runtime)
}

/// Install `action` for every signal in `signals`
///
/// On failure the signals already changed get their saved action back.
fn set_actions(
    signals: &[(c_int, libc::sigaction)],
    action: &libc::sigaction,
) -> RuntimeResult<()> {
    for (done, &(signo, _)) in signals.iter().enumerate() {
        if unsafe { libc::sigaction(signo, action, ptr::null_mut()) } == 0 {
            continue;
        }
        let err = RuntimeError::SignalSetupError {
            reason: format!("sigaction({signo}) failed: {}", io::Error::last_os_error()),
        };
        for (signo, previous) in &signals[..done] {
            unsafe { libc::sigaction(*signo, previous, ptr::null_mut()) };
        }
        return Err(err);
    }
    Ok(())
}

/// Signals whose handler was replaced after [`install`]
///
/// Returns an empty list if the runtime is not installed.
pub fn check_signal_handlers() -> RuntimeResult<Vec<c_int>> {
    let Some(runtime) = installed() else {
        return Ok(Vec::new());
    };
    let mut replaced = Vec::new();
    for &signo in &runtime.owned {
        let action = current_action(signo)?;
        if is_displaced(&action) {
            tracing::warn!(
                signal = signo,
                handler = action.sa_sigaction,
                flags = action.sa_flags,
                "trap handler was replaced"
            );
            replaced.push(signo);
        }
    }
    Ok(replaced)
}

fn current_action(signo: c_int) -> RuntimeResult<libc::sigaction> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signo, std::ptr::null(), &mut action) != 0 {
            return Err(RuntimeError::SignalSetupError {
                reason: format!("sigaction({signo}) query failed: {}", io::Error::last_os_error()),
            });
        }
        Ok(action)
    }
}

/// A handler that is neither a default disposition nor ours
fn is_foreign(action: &libc::sigaction) -> bool {
    let handler = action.sa_sigaction;
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != trap_handler_address()
}

/// Whether `action` is no longer exactly the one [`install`] set
fn is_displaced(action: &libc::sigaction) -> bool {
    let expected = handler_action();
    action.sa_sigaction != expected.sa_sigaction
        || action.sa_flags & SIGNIFICANT_FLAGS != expected.sa_flags & SIGNIFICANT_FLAGS
}

fn trap_handler_address() -> libc::sighandler_t {
    trap_signal_handler as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t
}

fn handler_action() -> libc::sigaction {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = trap_handler_address();
        action.sa_flags =
            libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_NODEFER | libc::SA_ONSTACK;
        libc::sigfillset(&mut action.sa_mask);
        for signo in SYNCHRONOUS_SIGNALS {
            libc::sigdelset(&mut action.sa_mask, signo);
        }
        action
    }
}

/// Signal entry point
extern "C" fn trap_signal_handler(signo: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let errno = SavedErrno::save();
    // Safety: the kernel passes valid (or null) info and context pointers
    let record = unsafe { NativeAdapter::adapt(signo, info, context) };
    let raw = RawSignal {
        signo,
        info,
        context,
    };

    let disposition = match installed() {
        Some(runtime) => thread::with_current(|state| runtime.handle(&record, &raw, state)),
        None => Disposition::Fatal(FatalDiagnostic::capture(
            "trap handler invoked before installation",
            &record,
        )),
    };

    match disposition {
        Disposition::Retry | Disposition::Defer => {}
        Disposition::Redirect(pc) => unsafe { NativeAdapter::set_program_counter(context, pc) },
        Disposition::Fatal(diagnostic) => report_and_abort(&diagnostic),
    }
    errno.restore();
}
