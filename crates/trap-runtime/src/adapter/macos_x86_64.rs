use libc::{c_int, c_void, siginfo_t, ucontext_t};

use super::{base_record, FaultContextAdapter};
use crate::fault::{CanonicalFaultRecord, RegisterSnapshot};

static REGISTER_NAMES: [&str; 18] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "rflags",
];

/// macOS on x86_64: thread state in `(*uc_mcontext).__ss`, trap number in `__es`
pub struct MacosX86_64;

impl FaultContextAdapter for MacosX86_64 {
    unsafe fn adapt(signo: c_int, info: *const siginfo_t, context: *const c_void) -> CanonicalFaultRecord {
        let mcontext = (context as *const ucontext_t)
            .as_ref()
            .and_then(|uc| uc.uc_mcontext.as_ref());
        let Some(mc) = mcontext else {
            return base_record(signo, info, 0, 0);
        };
        let ss = &mc.__ss;

        let mut record = base_record(signo, info, ss.__rip as usize, ss.__rsp as usize);
        record.fp = Some(ss.__rbp as usize);
        record.trap_number = Some(u32::from(mc.__es.__trapno));

        let values = [
            ss.__rax, ss.__rbx, ss.__rcx, ss.__rdx, ss.__rsi, ss.__rdi, ss.__rbp, ss.__rsp, ss.__r8,
            ss.__r9, ss.__r10, ss.__r11, ss.__r12, ss.__r13, ss.__r14, ss.__r15, ss.__rip,
            ss.__rflags,
        ];
        record.registers = RegisterSnapshot::new(&REGISTER_NAMES, &values);
        record
    }

    unsafe fn set_program_counter(context: *mut c_void, pc: usize) {
        let mcontext = (context as *mut ucontext_t)
            .as_mut()
            .and_then(|uc| uc.uc_mcontext.as_mut());
        if let Some(mc) = mcontext {
            mc.__ss.__rip = pc as u64;
        }
    }
}
