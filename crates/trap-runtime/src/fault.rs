//! Canonical, platform-neutral description of a hardware fault
//!
//! A [`CanonicalFaultRecord`] is built by a
//! [`FaultContextAdapter`](crate::adapter::FaultContextAdapter) on entry to the
//! signal handler and consumed by the classifier within the same call. It is
//! `Copy`, fixed-size and lives on the faulting thread's stack, so building one
//! never allocates.

use std::fmt;

/// Signal vocabulary understood by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Segv,
    Bus,
    IllegalInstruction,
    Breakpoint,
    FloatingPoint,
    BrokenPipe,
    FileSizeLimit,
    Other(i32),
}

impl SignalKind {
    pub fn from_signo(signo: i32) -> Self {
        match signo {
            libc::SIGSEGV => SignalKind::Segv,
            libc::SIGBUS => SignalKind::Bus,
            libc::SIGILL => SignalKind::IllegalInstruction,
            libc::SIGTRAP => SignalKind::Breakpoint,
            libc::SIGFPE => SignalKind::FloatingPoint,
            libc::SIGPIPE => SignalKind::BrokenPipe,
            libc::SIGXFSZ => SignalKind::FileSizeLimit,
            other => SignalKind::Other(other),
        }
    }

    pub fn signo(self) -> i32 {
        match self {
            SignalKind::Segv => libc::SIGSEGV,
            SignalKind::Bus => libc::SIGBUS,
            SignalKind::IllegalInstruction => libc::SIGILL,
            SignalKind::Breakpoint => libc::SIGTRAP,
            SignalKind::FloatingPoint => libc::SIGFPE,
            SignalKind::BrokenPipe => libc::SIGPIPE,
            SignalKind::FileSizeLimit => libc::SIGXFSZ,
            SignalKind::Other(signo) => signo,
        }
    }

    /// Signals that are acknowledged and otherwise ignored
    #[inline]
    pub fn is_ignorable(self) -> bool {
        matches!(self, SignalKind::BrokenPipe | SignalKind::FileSizeLimit)
    }

    /// Signals raised by a bad memory access
    #[inline]
    pub fn is_memory_fault(self) -> bool {
        matches!(self, SignalKind::Segv | SignalKind::Bus)
    }

    pub fn name(self) -> &'static str {
        match self {
            SignalKind::Segv => "SIGSEGV",
            SignalKind::Bus => "SIGBUS",
            SignalKind::IllegalInstruction => "SIGILL",
            SignalKind::Breakpoint => "SIGTRAP",
            SignalKind::FloatingPoint => "SIGFPE",
            SignalKind::BrokenPipe => "SIGPIPE",
            SignalKind::FileSizeLimit => "SIGXFSZ",
            SignalKind::Other(_) => "signal",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.signo())
    }
}

/// Platform-neutral `si_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    IntegerDivide,
    IntegerOverflow,
    FloatDivide,
    UnmappedAddress,
    AccessDenied,
    /// Sent by `kill`, `raise` or `sigqueue` rather than by the CPU
    UserSent,
    /// Generated by the kernel without a meaningful address (x86 GP fault)
    KernelGenerated,
    Other(i32),
}

/// Up to 16 instruction bytes at the faulting pc
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeWindow {
    bytes: [u8; CodeWindow::CAPACITY],
    len: u8,
}

impl CodeWindow {
    pub const CAPACITY: usize = 16;

    pub fn empty() -> Self {
        Self::default()
    }

    /// Copy up to [`CodeWindow::CAPACITY`] bytes from `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut window = Self::default();
        let len = bytes.len().min(Self::CAPACITY);
        window.bytes[..len].copy_from_slice(&bytes[..len]);
        window.len = len as u8;
        window
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Match an x86 `div`/`idiv` instruction at the start of the window
    ///
    /// Some platforms report an integer divide fault with an overflow or
    /// meaningless `si_code`, so the only evidence left is the instruction
    /// itself. This skips legacy and REX prefixes and then looks for opcode
    /// `F6`/`F7` with a ModRM reg field of 6 (`div`) or 7 (`idiv`). It is a
    /// heuristic: it cannot see through every encoding and a corrupted window
    /// can match by accident.
    pub fn looks_like_integer_divide(&self) -> bool {
        let bytes = self.as_bytes();
        let mut i = 0;
        while i < bytes.len() && matches!(bytes[i], 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3 | 0x2E) {
            i += 1;
        }
        if i < bytes.len() && (0x40..=0x4F).contains(&bytes[i]) {
            i += 1;
        }
        match (bytes.get(i), bytes.get(i + 1)) {
            (Some(0xF6 | 0xF7), Some(modrm)) => matches!((modrm >> 3) & 0b111, 6 | 7),
            _ => false,
        }
    }
}

impl fmt::Debug for CodeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeWindow(")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Named general-purpose register values at the fault
#[derive(Clone, Copy)]
pub struct RegisterSnapshot {
    names: &'static [&'static str],
    values: [u64; RegisterSnapshot::CAPACITY],
    len: u8,
}

impl RegisterSnapshot {
    pub const CAPACITY: usize = 34;

    pub fn empty() -> Self {
        Self {
            names: &[],
            values: [0; Self::CAPACITY],
            len: 0,
        }
    }

    /// Snapshot `values`, labelled pairwise by `names`
    pub fn new(names: &'static [&'static str], values: &[u64]) -> Self {
        let mut snapshot = Self::empty();
        let len = names.len().min(values.len()).min(Self::CAPACITY);
        snapshot.names = names;
        snapshot.values[..len].copy_from_slice(&values[..len]);
        snapshot.len = len as u8;
        snapshot
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.names
            .iter()
            .copied()
            .zip(self.values[..self.len()].iter().copied())
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

impl fmt::Debug for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Everything the classifier knows about one fault
#[derive(Debug, Clone, Copy)]
pub struct CanonicalFaultRecord {
    pub kind: SignalKind,
    pub code: FaultCode,
    pub pc: usize,
    pub sp: usize,
    pub fp: Option<usize>,
    /// Faulting data address, `None` when the OS metadata is not trustworthy
    pub fault_address: Option<usize>,
    /// x86 trap number, where the platform reports one
    pub trap_number: Option<u32>,
    /// Instruction length on fixed-width ISAs
    pub instruction_width: Option<u8>,
    pub instruction: CodeWindow,
    pub registers: RegisterSnapshot,
}

impl CanonicalFaultRecord {
    /// A record with only the signal and pc filled in
    pub fn new(kind: SignalKind, code: FaultCode, pc: usize, sp: usize) -> Self {
        Self {
            kind,
            code,
            pc,
            sp,
            fp: None,
            fault_address: None,
            trap_number: None,
            instruction_width: None,
            instruction: CodeWindow::empty(),
            registers: RegisterSnapshot::empty(),
        }
    }

    pub fn with_fault_address(mut self, addr: usize) -> Self {
        self.fault_address = Some(addr);
        self
    }

    pub fn with_trap_number(mut self, trap: u32) -> Self {
        self.trap_number = Some(trap);
        self
    }

    pub fn with_instruction_width(mut self, width: u8) -> Self {
        self.instruction_width = Some(width);
        self
    }

    pub fn with_instruction(mut self, window: CodeWindow) -> Self {
        self.instruction = window;
        self
    }

    /// Fault address of a memory fault, if known
    #[inline]
    pub fn memory_fault_address(&self) -> Option<usize> {
        if self.kind.is_memory_fault() {
            self.fault_address
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_kind_round_trips_signo() {
        for signo in [
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGILL,
            libc::SIGTRAP,
            libc::SIGFPE,
            libc::SIGPIPE,
            libc::SIGXFSZ,
            libc::SIGUSR1,
        ] {
            assert_eq!(SignalKind::from_signo(signo).signo(), signo);
        }
        assert_eq!(SignalKind::from_signo(libc::SIGUSR1), SignalKind::Other(libc::SIGUSR1));
    }

    #[test]
    fn test_ignorable_and_memory_kinds() {
        assert!(SignalKind::BrokenPipe.is_ignorable());
        assert!(SignalKind::FileSizeLimit.is_ignorable());
        assert!(!SignalKind::Segv.is_ignorable());
        assert!(SignalKind::Segv.is_memory_fault());
        assert!(SignalKind::Bus.is_memory_fault());
        assert!(!SignalKind::FloatingPoint.is_memory_fault());
    }

    #[test]
    fn test_integer_divide_heuristic() {
        // idiv ecx
        assert!(CodeWindow::from_bytes(&[0xF7, 0xF9]).looks_like_integer_divide());
        // div rcx (REX.W)
        assert!(CodeWindow::from_bytes(&[0x48, 0xF7, 0xF1]).looks_like_integer_divide());
        // idiv word ptr with operand-size prefix
        assert!(CodeWindow::from_bytes(&[0x66, 0xF7, 0x3B]).looks_like_integer_divide());
        // neg ecx shares the opcode but has reg field 3
        assert!(!CodeWindow::from_bytes(&[0xF7, 0xD9]).looks_like_integer_divide());
        // truncated window
        assert!(!CodeWindow::from_bytes(&[0x48, 0xF7]).looks_like_integer_divide());
        assert!(!CodeWindow::empty().looks_like_integer_divide());
    }

    #[test]
    fn test_code_window_truncates() {
        let window = CodeWindow::from_bytes(&[0x90; 40]);
        assert_eq!(window.as_bytes().len(), CodeWindow::CAPACITY);
    }

    #[test]
    fn test_register_snapshot_lookup() {
        static NAMES: [&str; 3] = ["pc", "sp", "fp"];
        let snapshot = RegisterSnapshot::new(&NAMES, &[0x1000, 0x2000]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("sp"), Some(0x2000));
        assert_eq!(snapshot.get("fp"), None);
    }

    #[test]
    fn test_memory_fault_address_only_for_memory_faults() {
        let segv = CanonicalFaultRecord::new(SignalKind::Segv, FaultCode::UnmappedAddress, 0x10, 0x20)
            .with_fault_address(0x30);
        assert_eq!(segv.memory_fault_address(), Some(0x30));

        let fpe = CanonicalFaultRecord::new(SignalKind::FloatingPoint, FaultCode::IntegerDivide, 0x10, 0x20)
            .with_fault_address(0x10);
        assert_eq!(fpe.memory_fault_address(), None);
    }
}
