//! Fatal fault diagnostics
//!
//! When a fault cannot be recovered from, the handler captures enough state to
//! reconstruct the faulting frame and then terminates the process. Capture and
//! reporting both run in signal context: memory is read with
//! [`os::read_memory`](crate::os::read_memory), the report is formatted into a
//! fixed stack buffer and written with raw `write(2)`.

use std::fmt::{self, Write};

use crate::{fault::CanonicalFaultRecord, os};

const CODE_WINDOW: usize = 32;
const STACK_WORDS: usize = 8;
const WORD: usize = std::mem::size_of::<usize>();

/// Snapshot of a fault the runtime gave up on
#[derive(Debug, Clone, Copy)]
pub struct FatalDiagnostic {
    reason: &'static str,
    record: CanonicalFaultRecord,
    code_start: usize,
    code: [u8; CODE_WINDOW],
    code_len: u8,
    stack: [usize; STACK_WORDS],
    stack_len: u8,
}

impl FatalDiagnostic {
    /// Capture the instruction window around pc and the top of the stack
    pub fn capture(reason: &'static str, record: &CanonicalFaultRecord) -> Self {
        let code_start = record.pc.saturating_sub(CODE_WINDOW / 2);
        let mut code = [0u8; CODE_WINDOW];
        let code_len = os::read_memory(code_start, &mut code);

        let mut raw_stack = [0u8; STACK_WORDS * WORD];
        let stack_bytes = os::read_memory(record.sp, &mut raw_stack);
        let mut stack = [0usize; STACK_WORDS];
        let stack_len = stack_bytes / WORD;
        for (word, chunk) in stack.iter_mut().zip(raw_stack.chunks_exact(WORD)).take(stack_len) {
            let mut bytes = [0u8; WORD];
            bytes.copy_from_slice(chunk);
            *word = usize::from_ne_bytes(bytes);
        }

        Self {
            reason,
            record: *record,
            code_start,
            code,
            code_len: code_len as u8,
            stack,
            stack_len: stack_len as u8,
        }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }

    pub fn record(&self) -> &CanonicalFaultRecord {
        &self.record
    }

    /// Start address and bytes of the captured instruction window
    pub fn code_window(&self) -> (usize, &[u8]) {
        (self.code_start, &self.code[..self.code_len as usize])
    }

    /// Words read from the top of the stack
    pub fn stack_words(&self) -> &[usize] {
        &self.stack[..self.stack_len as usize]
    }
}

impl fmt::Display for FatalDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = &self.record;
        writeln!(f, "#")?;
        writeln!(f, "# A fatal fault has been detected by the trap runtime: {}", self.reason)?;
        writeln!(f, "#")?;
        writeln!(
            f,
            "#  {} ({:?}) at pc={:#018x}, sp={:#018x}",
            record.kind, record.code, record.pc, record.sp
        )?;
        if let Some(fp) = record.fp {
            writeln!(f, "#  fp={fp:#018x}")?;
        }
        match record.fault_address {
            Some(addr) => writeln!(f, "#  fault address={addr:#018x}")?,
            None => writeln!(f, "#  fault address unknown")?,
        }
        if let Some(trap) = record.trap_number {
            writeln!(f, "#  trap number={trap}")?;
        }

        if !record.registers.is_empty() {
            writeln!(f, "\nRegisters:")?;
            for (i, (name, value)) in record.registers.iter().enumerate() {
                write!(f, "{name:>6}={value:#018x}")?;
                if i % 4 == 3 {
                    writeln!(f)?;
                }
            }
            if record.registers.len() % 4 != 0 {
                writeln!(f)?;
            }
        }

        let (start, code) = self.code_window();
        writeln!(f, "\nInstructions: (pc={:#018x})", record.pc)?;
        if code.is_empty() {
            writeln!(f, "  <unreadable>")?;
        }
        for (row, chunk) in code.chunks(16).enumerate() {
            write!(f, "{:#018x}:", start + row * 16)?;
            for byte in chunk {
                write!(f, " {byte:02x}")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "\nTop of stack: (sp={:#018x})", record.sp)?;
        if self.stack_words().is_empty() {
            writeln!(f, "  <unreadable>")?;
        }
        for (i, word) in self.stack_words().iter().enumerate() {
            writeln!(f, "{:#018x}: {word:#018x}", record.sp + i * WORD)?;
        }
        Ok(())
    }
}

/// Fixed-size formatting buffer that drains to stderr when full
struct StderrBuffer {
    buf: [u8; 1024],
    len: usize,
}

impl StderrBuffer {
    fn new() -> Self {
        Self {
            buf: [0; 1024],
            len: 0,
        }
    }

    fn flush(&mut self) {
        os::write_stderr(&self.buf[..self.len]);
        self.len = 0;
    }
}

impl Write for StderrBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            if self.len == self.buf.len() {
                self.flush();
            }
            let n = bytes.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

/// Write `diagnostic` to stderr and abort the process. Async-signal-safe.
pub fn report_and_abort(diagnostic: &FatalDiagnostic) -> ! {
    let mut out = StderrBuffer::new();
    let _ = write!(out, "{diagnostic}");
    out.flush();
    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultCode, RegisterSnapshot, SignalKind};

    static NAMES: [&str; 2] = ["pc", "sp"];

    #[test]
    fn test_capture_reads_stack_words() {
        let stack: [usize; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let record = CanonicalFaultRecord::new(
            SignalKind::Segv,
            FaultCode::UnmappedAddress,
            0,
            stack.as_ptr() as usize,
        );
        let diagnostic = FatalDiagnostic::capture("test", &record);
        // Empty when the platform has no fault-free read
        if !diagnostic.stack_words().is_empty() {
            assert_eq!(diagnostic.stack_words(), &stack);
        }
        assert_eq!(diagnostic.reason(), "test");
    }

    #[test]
    fn test_unreadable_memory_is_reported() {
        let record = CanonicalFaultRecord::new(SignalKind::Other(libc::SIGUSR2), FaultCode::UserSent, 0, 0);
        let diagnostic = FatalDiagnostic::capture("unrecognized fault", &record);
        assert!(diagnostic.code_window().1.is_empty());
        assert!(diagnostic.stack_words().is_empty());

        let report = diagnostic.to_string();
        assert!(report.contains("unrecognized fault"));
        assert!(report.contains("fault address unknown"));
        assert!(report.contains("<unreadable>"));
    }

    #[test]
    fn test_report_includes_registers() {
        let mut record = CanonicalFaultRecord::new(SignalKind::Bus, FaultCode::Other(2), 0x1000, 0x2000)
            .with_fault_address(0xdead);
        record.registers = RegisterSnapshot::new(&NAMES, &[0x1000, 0x2000]);
        let report = FatalDiagnostic::capture("bus error", &record).to_string();
        assert!(report.contains("SIGBUS"));
        assert!(report.contains("pc=0x0000000000001000"));
        assert!(report.contains("fault address=0x000000000000dead"));
        assert!(report.contains("Registers:"));
    }

    #[test]
    fn test_stderr_buffer_handles_long_output() {
        let mut buffer = StderrBuffer::new();
        let long = "x".repeat(3000);
        // Only exercises the wrap-around; the bytes go to the test's stderr
        writeln!(buffer, "{long}").expect("formatting into the buffer cannot fail");
        assert!(buffer.len < 1024);
        buffer.flush();
        assert_eq!(buffer.len, 0);
    }
}
