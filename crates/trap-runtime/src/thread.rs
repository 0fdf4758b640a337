//! Managed thread state as seen by the fault path
//!
//! The classifier only needs a handful of facts about the faulting thread,
//! expressed by [`ManagedThread`]. [`ThreadState`] is the runtime's own
//! implementation; embedders with their own thread objects can implement the
//! trait directly.
//!
//! # Thread Safety
//!
//! A `ThreadState` is owned by exactly one OS thread and is `!Send`. The fault
//! handler reaches it through a `thread_local!` pointer installed by
//! [`ThreadState::attach`]. Synchronous signals are delivered to the thread that
//! caused them, so the handler only ever sees its own thread's state, and plain
//! `Cell`s are enough.

use std::{cell::Cell, io, marker::PhantomData, ops::Deref, ptr};

use crate::{
    config::TrapConfig,
    error::{RuntimeError, RuntimeResult},
    guard::GuardZones,
    os,
};

/// What a thread is executing when it faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// JIT-compiled managed code
    Compiled,
    /// Managed code in the interpreter
    Interpreted,
    /// Runtime-internal service code called from managed code
    RuntimeService,
    /// Blocked in, or running, foreign native code
    BlockedNative,
}

impl ExecutionMode {
    /// Whether the thread is running managed code
    #[inline]
    pub fn is_managed(self) -> bool {
        matches!(self, ExecutionMode::Compiled | ExecutionMode::Interpreted)
    }
}

/// Bounds of a downward-growing thread stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    base: usize,
    size: usize,
}

impl StackBounds {
    /// `base` is the highest address (exclusive), the stack spans `size` bytes below it
    pub fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Lowest usable address
    pub fn limit(&self) -> usize {
        self.base.saturating_sub(self.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.limit() && addr < self.base
    }
}

/// Per-thread facts and mutators the classifier relies on
///
/// Implementations are called from signal context and must not allocate or
/// lock.
pub trait ManagedThread {
    fn execution_mode(&self) -> ExecutionMode;

    fn stack_bounds(&self) -> StackBounds;

    fn guard_zones(&self) -> &GuardZones;

    /// Whether the thread is inside a runtime service flagged as doing
    /// speculative (unsafe) memory reads
    fn is_doing_unsafe_access(&self) -> bool;

    /// Record that a speculative read faulted; the error is raised later at a
    /// safe point
    fn set_pending_unsafe_access(&self);
}

/// Reference [`ManagedThread`] implementation
#[derive(Debug)]
pub struct ThreadState {
    mode: Cell<ExecutionMode>,
    bounds: StackBounds,
    guard: GuardZones,
    doing_unsafe_access: Cell<bool>,
    pending_unsafe_access: Cell<bool>,
    handling_fault: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadState {
    /// Create state for a thread with the given stack and guard zones
    ///
    /// New threads start in [`ExecutionMode::BlockedNative`].
    pub fn new(bounds: StackBounds, guard: GuardZones) -> Self {
        Self {
            mode: Cell::new(ExecutionMode::BlockedNative),
            bounds,
            guard,
            doing_unsafe_access: Cell::new(false),
            pending_unsafe_access: Cell::new(false),
            handling_fault: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    /// Create state for the calling thread, laying out guard zones per `config`
    pub fn for_current_thread(config: &TrapConfig) -> RuntimeResult<Self> {
        let bounds = os::current_thread_stack()?;
        let guard = GuardZones::from_config(bounds, config);
        Ok(Self::new(bounds, guard))
    }

    /// Switch execution mode, returning the previous one
    pub fn set_execution_mode(&self, mode: ExecutionMode) -> ExecutionMode {
        self.mode.replace(mode)
    }

    /// Run `f` flagged as a speculative-read runtime service
    pub fn unsafe_access<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous_mode = self.mode.replace(ExecutionMode::RuntimeService);
        let previous_flag = self.doing_unsafe_access.replace(true);
        let result = f();
        self.doing_unsafe_access.set(previous_flag);
        self.mode.set(previous_mode);
        result
    }

    /// Check and clear the pending-unsafe-access flag
    pub fn take_pending_unsafe_access(&self) -> bool {
        self.pending_unsafe_access.replace(false)
    }

    pub fn is_handling_fault(&self) -> bool {
        self.handling_fault.get()
    }

    /// Mark the thread as inside the fault handler
    ///
    /// Returns `None` if it already is, which means the handler itself faulted.
    pub fn begin_fault_handling(&self) -> Option<FaultHandlingScope<'_>> {
        if self.handling_fault.replace(true) {
            return None;
        }
        Some(FaultHandlingScope { state: self })
    }

    /// Re-arm the guard zones once the stack has unwound to `sp`
    ///
    /// Returns whether the zones were re-armed.
    pub fn reguard_stack(&self, sp: usize) -> RuntimeResult<bool> {
        if self.handling_fault.get() {
            return Err(RuntimeError::ReguardInsideHandler);
        }
        Ok(self.guard.reenable(sp))
    }

    /// Publish `state` as the calling thread's state for the fault handler
    ///
    /// Also gives the thread its own alternate signal stack for as long as it
    /// stays attached.
    pub fn attach(state: ThreadState) -> RuntimeResult<AttachedThread> {
        if !current_ptr().is_null() {
            return Err(RuntimeError::ThreadAlreadyAttached);
        }
        if let Err(err) = state.guard.protect_initial() {
            tracing::warn!(error = %err, "stack guard zones left unprotected");
        }
        let alt_stack = match AltStack::install() {
            Ok(alt_stack) => Some(alt_stack),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "no alternate signal stack, stack overflows will be fatal"
                );
                None
            }
        };
        let state = Box::new(state);
        let raw: *const ThreadState = &*state;
        let _ = CURRENT.try_with(|current| current.set(raw));
        tracing::debug!(
            stack_base = state.bounds.base(),
            stack_size = state.bounds.size(),
            "attached thread to trap runtime"
        );
        Ok(AttachedThread { state, alt_stack })
    }

    /// Build state for the calling thread and attach it
    pub fn attach_current(config: &TrapConfig) -> RuntimeResult<AttachedThread> {
        if !current_ptr().is_null() {
            return Err(RuntimeError::ThreadAlreadyAttached);
        }
        Self::attach(Self::for_current_thread(config)?)
    }
}

impl ManagedThread for ThreadState {
    fn execution_mode(&self) -> ExecutionMode {
        self.mode.get()
    }

    fn stack_bounds(&self) -> StackBounds {
        self.bounds
    }

    fn guard_zones(&self) -> &GuardZones {
        &self.guard
    }

    fn is_doing_unsafe_access(&self) -> bool {
        self.doing_unsafe_access.get()
    }

    fn set_pending_unsafe_access(&self) {
        self.pending_unsafe_access.set(true);
    }
}

/// Clears the in-handler flag on drop
pub struct FaultHandlingScope<'a> {
    state: &'a ThreadState,
}

impl Drop for FaultHandlingScope<'_> {
    fn drop(&mut self) {
        self.state.handling_fault.set(false);
    }
}

thread_local! {
    static CURRENT: Cell<*const ThreadState> = const { Cell::new(ptr::null()) };
}

fn current_ptr() -> *const ThreadState {
    CURRENT.try_with(Cell::get).unwrap_or(ptr::null())
}

/// Run `f` with the calling thread's attached state, if any
///
/// Async-signal-safe: the thread-local has a constant initializer and no
/// destructor, so access is a plain TLS load.
pub fn with_current<R>(f: impl FnOnce(Option<&ThreadState>) -> R) -> R {
    let raw = current_ptr();
    // Safety: the pointer is set only while the owning AttachedThread is alive
    // on this same thread, and cleared when it drops.
    let state = unsafe { raw.as_ref() };
    f(state)
}

/// Size of the per-thread alternate signal stack
const ALT_STACK_SIZE: usize = 64 * 1024;

/// Alternate signal stack of an attached thread
///
/// The fault handler runs on it, so it still has room when the thread's own
/// stack is exhausted. Dropping it puts the thread's previous alternate stack
/// back.
struct AltStack {
    base: *mut libc::c_void,
    len: usize,
    previous: libc::stack_t,
}

impl AltStack {
    fn install() -> RuntimeResult<Self> {
        let len = os::align_up(ALT_STACK_SIZE.max(libc::SIGSTKSZ), os::page_size());
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::MapError {
                what: "alternate signal stack",
                reason: io::Error::last_os_error().to_string(),
            });
        }

        let stack = libc::stack_t {
            ss_sp: base,
            ss_flags: 0,
            ss_size: len,
        };
        let mut previous: libc::stack_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaltstack(&stack, &mut previous) } != 0 {
            let reason = io::Error::last_os_error().to_string();
            unsafe { libc::munmap(base, len) };
            return Err(RuntimeError::MapError {
                what: "alternate signal stack",
                reason,
            });
        }
        Ok(Self {
            base,
            len,
            previous,
        })
    }
}

impl std::fmt::Debug for AltStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AltStack")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let mut previous = self.previous;
        previous.ss_flags &= !libc::SS_ONSTACK;
        if unsafe { libc::sigaltstack(&previous, ptr::null_mut()) } != 0 {
            // Still the active alternate stack: leak it
            tracing::warn!(
                error = %io::Error::last_os_error(),
                "failed to restore the previous alternate signal stack"
            );
            return;
        }
        unsafe { libc::munmap(self.base, self.len) };
    }
}

/// Guard keeping a [`ThreadState`] attached to the calling thread
#[derive(Debug)]
pub struct AttachedThread {
    state: Box<ThreadState>,
    alt_stack: Option<AltStack>,
}

impl Deref for AttachedThread {
    type Target = ThreadState;

    fn deref(&self) -> &ThreadState {
        &self.state
    }
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        let raw: *const ThreadState = &*self.state;
        let _ = CURRENT.try_with(|current| {
            if current.get() == raw {
                current.set(ptr::null());
            }
        });
        self.state.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TrapConfig {
        TrapConfig::default().with_protected_guard_pages(false)
    }

    fn detached_state() -> ThreadState {
        let page = os::page_size();
        let bounds = StackBounds::new(0x2000_0000, 32 * page);
        ThreadState::new(bounds, GuardZones::new(bounds, 2 * page, page, false))
    }

    #[test]
    fn test_stack_bounds() {
        let bounds = StackBounds::new(0x10_000, 0x4_000);
        assert_eq!(bounds.limit(), 0xC_000);
        assert!(bounds.contains(0xC_000));
        assert!(bounds.contains(0xF_FFF));
        assert!(!bounds.contains(0x10_000));
        assert!(!bounds.contains(0xB_FFF));
    }

    #[test]
    fn test_managed_modes() {
        assert!(ExecutionMode::Compiled.is_managed());
        assert!(ExecutionMode::Interpreted.is_managed());
        assert!(!ExecutionMode::RuntimeService.is_managed());
        assert!(!ExecutionMode::BlockedNative.is_managed());
    }

    #[test]
    fn test_unsafe_access_scope_restores_state() {
        let state = detached_state();
        state.set_execution_mode(ExecutionMode::Compiled);

        let seen = state.unsafe_access(|| (state.execution_mode(), state.is_doing_unsafe_access()));
        assert_eq!(seen, (ExecutionMode::RuntimeService, true));
        assert_eq!(state.execution_mode(), ExecutionMode::Compiled);
        assert!(!state.is_doing_unsafe_access());
    }

    #[test]
    fn test_pending_unsafe_access_is_taken_once() {
        let state = detached_state();
        assert!(!state.take_pending_unsafe_access());
        state.set_pending_unsafe_access();
        assert!(state.take_pending_unsafe_access());
        assert!(!state.take_pending_unsafe_access());
    }

    #[test]
    fn test_nested_fault_handling_detected() {
        let state = detached_state();
        let outer = state.begin_fault_handling().expect("first entry should succeed");
        assert!(state.is_handling_fault());
        assert!(state.begin_fault_handling().is_none());
        drop(outer);
        assert!(!state.is_handling_fault());
    }

    #[test]
    fn test_reguard_refused_inside_handler() {
        let state = detached_state();
        state.guard_zones().disable_yellow();
        let unwound = state.guard_zones().yellow_zone().end + 64;

        let scope = state.begin_fault_handling();
        assert!(matches!(
            state.reguard_stack(unwound),
            Err(RuntimeError::ReguardInsideHandler)
        ));
        drop(scope);

        assert!(state.reguard_stack(unwound).expect("reguard outside handler"));
    }

    #[test]
    fn test_attach_and_detach() {
        std::thread::spawn(|| {
            with_current(|state| assert!(state.is_none()));

            let attached = ThreadState::attach_current(&test_config()).expect("attach should succeed");
            attached.set_execution_mode(ExecutionMode::Interpreted);
            with_current(|state| {
                let state = state.expect("thread should be attached");
                assert_eq!(state.execution_mode(), ExecutionMode::Interpreted);
            });

            assert!(matches!(
                ThreadState::attach_current(&test_config()),
                Err(RuntimeError::ThreadAlreadyAttached)
            ));

            drop(attached);
            with_current(|state| assert!(state.is_none()));
        })
        .join()
        .expect("test thread panicked");
    }

    fn current_alt_stack() -> libc::stack_t {
        unsafe {
            let mut current: libc::stack_t = std::mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            current
        }
    }

    #[test]
    fn test_attach_switches_alternate_signal_stack() {
        std::thread::spawn(|| {
            let before = current_alt_stack();

            let attached = ThreadState::attach_current(&test_config()).expect("attach should succeed");
            let alt_stack = attached.alt_stack.as_ref().expect("alternate stack should map");
            let during = current_alt_stack();
            assert_eq!(during.ss_sp, alt_stack.base);
            assert!(during.ss_size >= ALT_STACK_SIZE);
            assert_eq!(during.ss_flags & libc::SS_DISABLE, 0);

            drop(attached);
            let after = current_alt_stack();
            assert_eq!(after.ss_sp, before.ss_sp);
            assert_eq!(after.ss_size, before.ss_size);
            assert_eq!(after.ss_flags & libc::SS_DISABLE, before.ss_flags & libc::SS_DISABLE);
        })
        .join()
        .expect("test thread panicked");
    }
}
