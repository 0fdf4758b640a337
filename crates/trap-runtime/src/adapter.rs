//! Fault context adapters
//!
//! An adapter turns the opaque `(signo, siginfo_t, ucontext_t)` triple the
//! kernel hands a `SA_SIGINFO` handler into a [`CanonicalFaultRecord`]. One
//! adapter exists per supported OS/CPU pairing and they share no decision
//! logic: each only knows where its platform keeps the registers.
//!
//! # Safety
//!
//! Adapters run in signal context. They read the context structures and, for
//! floating-point and illegal-instruction faults, the instruction bytes at pc
//! through [`os::read_memory`], which cannot fault. They never allocate.

use libc::{c_int, c_void, siginfo_t};

use crate::{
    fault::{CanonicalFaultRecord, CodeWindow, FaultCode, SignalKind},
    os,
};

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod linux_aarch64;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux_x86_64;
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod macos_aarch64;
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
mod macos_x86_64;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub use linux_aarch64::LinuxAarch64;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux_x86_64::LinuxX86_64;
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub use macos_aarch64::MacosAarch64;
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub use macos_x86_64::MacosX86_64;

/// Adapter for the compilation target
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub type NativeAdapter = LinuxAarch64;
/// Adapter for the compilation target
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub type NativeAdapter = LinuxX86_64;
/// Adapter for the compilation target
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub type NativeAdapter = MacosAarch64;
/// Adapter for the compilation target
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub type NativeAdapter = MacosX86_64;

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
compile_error!("trap-runtime supports Linux and macOS on x86_64 and aarch64 only");

/// Platform mapping from raw signal state to a canonical record
pub trait FaultContextAdapter {
    /// Build the canonical record for a delivered signal
    ///
    /// # Safety
    /// `info` and `context` must be null or point to the structures the kernel
    /// passed to a `SA_SIGINFO` handler for `signo`.
    unsafe fn adapt(signo: c_int, info: *const siginfo_t, context: *const c_void) -> CanonicalFaultRecord;

    /// Make the interrupted thread resume at `pc`
    ///
    /// # Safety
    /// `context` must be null or the live `ucontext_t` of the current handler
    /// invocation.
    unsafe fn set_program_counter(context: *mut c_void, pc: usize);
}

#[cfg(target_os = "linux")]
mod codes {
    pub const FPE_INTDIV: i32 = 1;
    pub const FPE_INTOVF: i32 = 2;
    pub const FPE_FLTDIV: i32 = 3;
    pub const SEGV_MAPERR: i32 = 1;
    pub const SEGV_ACCERR: i32 = 2;
    pub const SI_KERNEL: Option<i32> = Some(0x80);

    /// `SI_USER`, `SI_QUEUE`, `SI_TKILL` and friends are all `<= 0`
    pub fn is_user_sent(code: i32) -> bool {
        code <= 0
    }
}

#[cfg(target_os = "macos")]
mod codes {
    pub const FPE_FLTDIV: i32 = 1;
    pub const FPE_INTDIV: i32 = 7;
    pub const FPE_INTOVF: i32 = 8;
    pub const SEGV_MAPERR: i32 = 1;
    pub const SEGV_ACCERR: i32 = 2;
    pub const SI_KERNEL: Option<i32> = None;

    /// `SI_USER` through `SI_MESGQ`
    pub fn is_user_sent(code: i32) -> bool {
        (0x10001..=0x10006).contains(&code)
    }
}

/// Map a raw `si_code` for `kind` to a [`FaultCode`]
pub fn decode_code(kind: SignalKind, si_code: i32) -> FaultCode {
    if codes::is_user_sent(si_code) {
        return FaultCode::UserSent;
    }
    if codes::SI_KERNEL == Some(si_code) {
        return FaultCode::KernelGenerated;
    }
    match (kind, si_code) {
        (SignalKind::FloatingPoint, codes::FPE_INTDIV) => FaultCode::IntegerDivide,
        (SignalKind::FloatingPoint, codes::FPE_INTOVF) => FaultCode::IntegerOverflow,
        (SignalKind::FloatingPoint, codes::FPE_FLTDIV) => FaultCode::FloatDivide,
        (SignalKind::Segv, codes::SEGV_MAPERR) => FaultCode::UnmappedAddress,
        (SignalKind::Segv, codes::SEGV_ACCERR) => FaultCode::AccessDenied,
        (_, raw) => FaultCode::Other(raw),
    }
}

#[cfg(target_os = "linux")]
unsafe fn raw_fault_address(info: &siginfo_t) -> usize {
    info.si_addr() as usize
}

#[cfg(target_os = "macos")]
unsafe fn raw_fault_address(info: &siginfo_t) -> usize {
    info.si_addr as usize
}

/// Fill in everything that does not depend on the register layout
///
/// # Safety
/// `info` must be null or point to a valid `siginfo_t`.
pub(crate) unsafe fn base_record(
    signo: c_int,
    info: *const siginfo_t,
    pc: usize,
    sp: usize,
) -> CanonicalFaultRecord {
    let kind = SignalKind::from_signo(signo);
    let Some(info) = info.as_ref() else {
        return CanonicalFaultRecord::new(kind, FaultCode::Other(0), pc, sp);
    };

    let code = decode_code(kind, info.si_code);
    let mut record = CanonicalFaultRecord::new(kind, code, pc, sp);

    let carries_address = matches!(
        kind,
        SignalKind::Segv
            | SignalKind::Bus
            | SignalKind::IllegalInstruction
            | SignalKind::FloatingPoint
            | SignalKind::Breakpoint
    );
    let trustworthy = !matches!(code, FaultCode::UserSent | FaultCode::KernelGenerated);
    if carries_address && trustworthy {
        record.fault_address = Some(raw_fault_address(info));
    }

    if matches!(kind, SignalKind::FloatingPoint | SignalKind::IllegalInstruction) {
        record.instruction = read_code_window(pc);
    }
    record
}

fn read_code_window(pc: usize) -> CodeWindow {
    let mut buf = [0u8; CodeWindow::CAPACITY];
    let copied = os::read_memory(pc, &mut buf);
    CodeWindow::from_bytes(&buf[..copied])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_arithmetic_codes() {
        assert_eq!(
            decode_code(SignalKind::FloatingPoint, codes::FPE_INTDIV),
            FaultCode::IntegerDivide
        );
        assert_eq!(
            decode_code(SignalKind::FloatingPoint, codes::FPE_INTOVF),
            FaultCode::IntegerOverflow
        );
        assert_eq!(
            decode_code(SignalKind::FloatingPoint, codes::FPE_FLTDIV),
            FaultCode::FloatDivide
        );
    }

    #[test]
    fn test_decode_codes_depend_on_signal() {
        assert_eq!(
            decode_code(SignalKind::Segv, codes::SEGV_MAPERR),
            FaultCode::UnmappedAddress
        );
        assert_eq!(
            decode_code(SignalKind::Segv, codes::SEGV_ACCERR),
            FaultCode::AccessDenied
        );
        assert_eq!(
            decode_code(SignalKind::Bus, codes::SEGV_MAPERR),
            FaultCode::Other(codes::SEGV_MAPERR)
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_decode_user_and_kernel_codes() {
        assert_eq!(decode_code(SignalKind::Segv, 0), FaultCode::UserSent);
        assert_eq!(decode_code(SignalKind::Segv, -6), FaultCode::UserSent);
        assert_eq!(decode_code(SignalKind::Segv, 0x80), FaultCode::KernelGenerated);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_decode_user_codes() {
        assert_eq!(decode_code(SignalKind::Segv, 0x10001), FaultCode::UserSent);
        assert_eq!(decode_code(SignalKind::Segv, 0x10006), FaultCode::UserSent);
    }

    #[test]
    fn test_null_info_has_no_fault_address() {
        let record = unsafe { base_record(libc::SIGSEGV, std::ptr::null(), 0x1000, 0x2000) };
        assert_eq!(record.kind, SignalKind::Segv);
        assert_eq!(record.fault_address, None);
        assert_eq!(record.pc, 0x1000);
    }

    #[test]
    fn test_user_sent_signal_has_no_fault_address() {
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGSEGV;
        #[cfg(target_os = "macos")]
        {
            info.si_code = 0x10001;
        }
        let record = unsafe { base_record(libc::SIGSEGV, &info, 0x1000, 0x2000) };
        assert_eq!(record.code, FaultCode::UserSent);
        assert_eq!(record.fault_address, None);
    }

    #[test]
    fn test_code_window_captured_for_fpe() {
        static CODE: [u8; 16] = [
            0x48, 0xF7, 0xF9, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
            0x90,
        ];
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGFPE;
        info.si_code = codes::FPE_INTDIV;
        let record = unsafe { base_record(libc::SIGFPE, &info, CODE.as_ptr() as usize, 0) };
        assert_eq!(record.code, FaultCode::IntegerDivide);
        // The window may be empty where the fault-free read is unavailable
        if !record.instruction.is_empty() {
            assert!(record.instruction.looks_like_integer_divide());
        }
    }
}
