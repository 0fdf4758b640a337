//! Trap classification
//!
//! One decision procedure for every platform. Given a
//! [`CanonicalFaultRecord`] and the faulting thread's state, [`Classifier`]
//! decides what the fault means and where the thread should resume.
//!
//! # Priority
//!
//! Rules are tried in a fixed order and the first one that claims the fault
//! wins:
//!
//! 1. Broken pipe and file-size-limit signals are ignored. Faults on threads
//!    that are not attached to the runtime are deferred.
//! 2. A pc inside a guarded access region resumes at the region's fallback.
//! 3. A memory fault in the yellow zone opens the zone and either raises the
//!    managed stack-overflow error or retries. A fault in the red zone is fatal.
//! 4. In managed code only: safepoint polls, zombie entries, divide by zero,
//!    unsafe-access bus errors in compiled code, and implicit null checks.
//! 5. A bus error in a speculative-read runtime service skips the instruction
//!    and leaves an error pending.
//! 6. A segfault in a fast field accessor resumes at its slow path.
//! 7. A memory fault on the serialization page waits for the page and retries.
//! 8. Anything else is deferred to the chained handler.
//!
//! A resolver answering `None` does not claim the fault, and the next rule is
//! tried.
//!
//! # Safety
//!
//! `classify` runs in signal context. It allocates nothing and takes no locks;
//! its only side effects are guard-zone transitions and the
//! pending-unsafe-access flag of the faulting thread.

use crate::{
    diagnostic::FatalDiagnostic,
    fault::{CanonicalFaultRecord, FaultCode, SignalKind},
    resolver::ContinuationResolver,
    serialize::SerializationPage,
    thread::{ExecutionMode, ManagedThread},
};

/// x86 divide-error exception vector
const X86_DIVIDE_ERROR: u32 = 0;

/// Outcome of classifying a fault
#[derive(Debug, Clone, Copy)]
pub enum Disposition {
    /// Resume at the faulting instruction
    Retry,
    /// Resume at the given address
    Redirect(usize),
    /// Report and terminate the process
    Fatal(FatalDiagnostic),
    /// Not recognized; offer it to the chained handler
    Defer,
}

impl Disposition {
    pub fn is_retry(&self) -> bool {
        matches!(self, Disposition::Retry)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Disposition::Fatal(_))
    }

    pub fn is_defer(&self) -> bool {
        matches!(self, Disposition::Defer)
    }

    /// The resume address of a `Redirect`
    pub fn redirect_target(&self) -> Option<usize> {
        match self {
            Disposition::Redirect(target) => Some(*target),
            _ => None,
        }
    }
}

/// The shared trap decision procedure
#[derive(Clone, Copy)]
pub struct Classifier<'a> {
    resolver: &'a dyn ContinuationResolver,
    serialization: Option<&'a SerializationPage>,
}

impl<'a> Classifier<'a> {
    pub fn new(resolver: &'a dyn ContinuationResolver) -> Self {
        Self {
            resolver,
            serialization: None,
        }
    }

    /// Also recognize faults on the memory serialization page
    pub fn with_serialization_page(mut self, page: &'a SerializationPage) -> Self {
        self.serialization = Some(page);
        self
    }

    /// Decide what `record` means for `thread`
    ///
    /// `thread` is `None` when the faulting thread is not attached to the
    /// runtime.
    pub fn classify(
        &self,
        record: &CanonicalFaultRecord,
        thread: Option<&dyn ManagedThread>,
    ) -> Disposition {
        if record.kind.is_ignorable() {
            return Disposition::Retry;
        }
        let Some(thread) = thread else {
            return Disposition::Defer;
        };
        let pc = record.pc;
        let mode = thread.execution_mode();

        if let Some(fallback) = self.resolver.guarded_access_continuation(pc) {
            return Disposition::Redirect(fallback);
        }

        if let Some(disposition) = self.stack_overflow(record, thread, mode) {
            return disposition;
        }

        if mode.is_managed() {
            if let Some(disposition) = self.managed_fault(record, thread, mode) {
                return disposition;
            }
        }

        if mode == ExecutionMode::RuntimeService
            && record.kind == SignalKind::Bus
            && thread.is_doing_unsafe_access()
        {
            if let Some(next) = self.next_pc(record) {
                thread.set_pending_unsafe_access();
                return Disposition::Redirect(next);
            }
        }

        if record.kind == SignalKind::Segv {
            if let Some(slow_case) = self.resolver.fast_accessor_slow_case(pc) {
                return Disposition::Redirect(slow_case);
            }
        }

        if let (Some(page), Some(addr)) = (self.serialization, record.memory_fault_address()) {
            if page.contains(addr) {
                page.block_while_serializing();
                return Disposition::Retry;
            }
        }

        Disposition::Defer
    }

    fn stack_overflow(
        &self,
        record: &CanonicalFaultRecord,
        thread: &dyn ManagedThread,
        mode: ExecutionMode,
    ) -> Option<Disposition> {
        let addr = record.memory_fault_address()?;
        let zones = thread.guard_zones();
        if zones.in_yellow_zone(addr) {
            zones.disable_yellow();
            if mode.is_managed() {
                if let Some(entry) = self.resolver.continuation_for_stack_overflow(thread, record.pc) {
                    return Some(Disposition::Redirect(entry));
                }
            }
            return Some(Disposition::Retry);
        }
        if zones.in_red_zone(addr) {
            zones.disable_red();
            return Some(Disposition::Fatal(FatalDiagnostic::capture(
                "stack overflow into the red zone",
                record,
            )));
        }
        None
    }

    fn managed_fault(
        &self,
        record: &CanonicalFaultRecord,
        thread: &dyn ManagedThread,
        mode: ExecutionMode,
    ) -> Option<Disposition> {
        let pc = record.pc;
        let resolver = self.resolver;

        if let Some(addr) = record.memory_fault_address() {
            if resolver.is_safepoint_poll_address(addr) {
                if let Some(entry) = resolver.safepoint_poll_continuation(pc) {
                    return Some(Disposition::Redirect(entry));
                }
            }
        }

        if record.kind == SignalKind::IllegalInstruction && resolver.is_zombie_entry(pc) {
            return Some(Disposition::Redirect(resolver.re_resolve_call_continuation()));
        }

        if is_divide_by_zero(record) {
            if let Some(entry) = resolver.continuation_for_arithmetic_fault(thread, pc) {
                return Some(Disposition::Redirect(entry));
            }
        }

        if record.kind == SignalKind::Bus
            && mode == ExecutionMode::Compiled
            && resolver.has_unsafe_access(pc)
        {
            if let Some(next) = self.next_pc(record) {
                thread.set_pending_unsafe_access();
                return Some(Disposition::Redirect(next));
            }
        }

        if let Some(addr) = record.memory_fault_address() {
            if resolver.looks_like_intentional_null_check(addr) {
                if let Some(entry) = resolver.continuation_for_null_check(thread, pc) {
                    return Some(Disposition::Redirect(entry));
                }
            }
        }

        None
    }

    /// Address of the instruction after the faulting one
    fn next_pc(&self, record: &CanonicalFaultRecord) -> Option<usize> {
        match record.instruction_width {
            Some(width) => Some(record.pc + usize::from(width)),
            None => self.resolver.next_instruction(record.pc),
        }
    }
}

/// Whether a floating-point exception is really an integer or float divide by zero
///
/// Trusts the fault code when it is specific. Otherwise falls back on the x86
/// trap number and, last, on decoding the instruction bytes at pc (see
/// [`CodeWindow::looks_like_integer_divide`](crate::fault::CodeWindow::looks_like_integer_divide)).
fn is_divide_by_zero(record: &CanonicalFaultRecord) -> bool {
    if record.kind != SignalKind::FloatingPoint {
        return false;
    }
    match record.code {
        FaultCode::IntegerDivide | FaultCode::FloatDivide => true,
        FaultCode::UserSent => false,
        _ => {
            record.trap_number == Some(X86_DIVIDE_ERROR)
                || record.instruction.looks_like_integer_divide()
        }
    }
}
