//! macOS on Apple Silicon
//!
//! `uc_mcontext` points to a `__darwin_mcontext64`: the exception state
//! (`__far`, `__esr`) followed by the thread state (`__x[29]`, `__fp`, `__lr`,
//! `__sp`, `__pc`, `__cpsr`).

use libc::{c_int, c_void, siginfo_t, ucontext_t};

use super::{base_record, FaultContextAdapter};
use crate::fault::{CanonicalFaultRecord, RegisterSnapshot};

static REGISTER_NAMES: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc", "cpsr",
];

pub struct MacosAarch64;

impl FaultContextAdapter for MacosAarch64 {
    unsafe fn adapt(signo: c_int, info: *const siginfo_t, context: *const c_void) -> CanonicalFaultRecord {
        let mcontext = (context as *const ucontext_t)
            .as_ref()
            .and_then(|uc| uc.uc_mcontext.as_ref());
        let Some(mc) = mcontext else {
            let mut record = base_record(signo, info, 0, 0);
            record.instruction_width = Some(4);
            return record;
        };
        let ss = &mc.__ss;

        let mut record = base_record(signo, info, ss.__pc as usize, ss.__sp as usize);
        record.fp = Some(ss.__fp as usize);
        record.instruction_width = Some(4);

        let mut values = [0u64; 34];
        values[..29].copy_from_slice(&ss.__x);
        values[29] = ss.__fp;
        values[30] = ss.__lr;
        values[31] = ss.__sp;
        values[32] = ss.__pc;
        values[33] = u64::from(ss.__cpsr);
        record.registers = RegisterSnapshot::new(&REGISTER_NAMES, &values);
        record
    }

    unsafe fn set_program_counter(context: *mut c_void, pc: usize) {
        let mcontext = (context as *mut ucontext_t)
            .as_mut()
            .and_then(|uc| uc.uc_mcontext.as_mut());
        if let Some(mc) = mcontext {
            mc.__ss.__pc = pc as u64;
        }
    }
}
