use libc::{c_int, c_void, siginfo_t, ucontext_t};

use super::{base_record, FaultContextAdapter};
use crate::fault::{CanonicalFaultRecord, RegisterSnapshot};

static REGISTER_NAMES: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc", "pstate",
];

/// Linux on aarch64: `uc_mcontext` carries `regs`, `sp`, `pc` directly
pub struct LinuxAarch64;

impl FaultContextAdapter for LinuxAarch64 {
    unsafe fn adapt(signo: c_int, info: *const siginfo_t, context: *const c_void) -> CanonicalFaultRecord {
        let Some(uc) = (context as *const ucontext_t).as_ref() else {
            let mut record = base_record(signo, info, 0, 0);
            record.instruction_width = Some(4);
            return record;
        };
        let mc = &uc.uc_mcontext;

        let mut record = base_record(signo, info, mc.pc as usize, mc.sp as usize);
        record.fp = Some(mc.regs[29] as usize);
        record.instruction_width = Some(4);

        let mut values = [0u64; 34];
        values[..31].copy_from_slice(&mc.regs);
        values[31] = mc.sp;
        values[32] = mc.pc;
        values[33] = mc.pstate;
        record.registers = RegisterSnapshot::new(&REGISTER_NAMES, &values);
        record
    }

    unsafe fn set_program_counter(context: *mut c_void, pc: usize) {
        if let Some(uc) = (context as *mut ucontext_t).as_mut() {
            uc.uc_mcontext.pc = pc as u64;
        }
    }
}
