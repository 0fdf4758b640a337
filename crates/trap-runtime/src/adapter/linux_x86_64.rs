use libc::{c_int, c_void, siginfo_t, ucontext_t};

use super::{base_record, FaultContextAdapter};
use crate::fault::{CanonicalFaultRecord, RegisterSnapshot};

static REGISTER_NAMES: [&str; 18] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "eflags",
];

static REGISTER_SLOTS: [c_int; 18] = [
    libc::REG_RAX,
    libc::REG_RBX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_RBP,
    libc::REG_RSP,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
    libc::REG_RIP,
    libc::REG_EFL,
];

/// Linux on x86_64: registers live in `uc_mcontext.gregs`
pub struct LinuxX86_64;

impl FaultContextAdapter for LinuxX86_64 {
    unsafe fn adapt(signo: c_int, info: *const siginfo_t, context: *const c_void) -> CanonicalFaultRecord {
        let Some(uc) = (context as *const ucontext_t).as_ref() else {
            return base_record(signo, info, 0, 0);
        };
        let gregs = &uc.uc_mcontext.gregs;
        let reg = |slot: c_int| gregs[slot as usize] as u64;

        let mut record = base_record(signo, info, reg(libc::REG_RIP) as usize, reg(libc::REG_RSP) as usize);
        record.fp = Some(reg(libc::REG_RBP) as usize);
        record.trap_number = Some(reg(libc::REG_TRAPNO) as u32);

        let mut values = [0u64; 18];
        for (value, slot) in values.iter_mut().zip(REGISTER_SLOTS) {
            *value = reg(slot);
        }
        record.registers = RegisterSnapshot::new(&REGISTER_NAMES, &values);
        record
    }

    unsafe fn set_program_counter(context: *mut c_void, pc: usize) {
        if let Some(uc) = (context as *mut ucontext_t).as_mut() {
            uc.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultCode, SignalKind};

    /// Linux x86_64 keeps `si_addr` right after the three leading ints and padding
    const SI_ADDR_OFFSET: usize = 16;

    fn segv_info(addr: usize) -> siginfo_t {
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGSEGV;
        info.si_code = 1; // SEGV_MAPERR
        unsafe {
            let raw = (&mut info as *mut siginfo_t as *mut u8).add(SI_ADDR_OFFSET) as *mut usize;
            raw.write(addr);
        }
        info
    }

    #[test]
    fn test_adapt_reads_gregs() {
        let mut uc: ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x4000_1000;
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7fff_0000;
        uc.uc_mcontext.gregs[libc::REG_RBP as usize] = 0x7fff_0040;
        uc.uc_mcontext.gregs[libc::REG_TRAPNO as usize] = 14;
        let info = segv_info(0x10);

        let record = unsafe {
            LinuxX86_64::adapt(libc::SIGSEGV, &info, &uc as *const ucontext_t as *const c_void)
        };
        assert_eq!(record.kind, SignalKind::Segv);
        assert_eq!(record.code, FaultCode::UnmappedAddress);
        assert_eq!(record.pc, 0x4000_1000);
        assert_eq!(record.sp, 0x7fff_0000);
        assert_eq!(record.fp, Some(0x7fff_0040));
        assert_eq!(record.fault_address, Some(0x10));
        assert_eq!(record.trap_number, Some(14));
        assert_eq!(record.instruction_width, None);
        assert_eq!(record.registers.get("rip"), Some(0x4000_1000));
    }

    #[test]
    fn test_set_program_counter() {
        let mut uc: ucontext_t = unsafe { std::mem::zeroed() };
        unsafe {
            LinuxX86_64::set_program_counter(&mut uc as *mut ucontext_t as *mut c_void, 0xdead_0000);
        }
        assert_eq!(uc.uc_mcontext.gregs[libc::REG_RIP as usize], 0xdead_0000);
    }

    #[test]
    fn test_null_context_is_tolerated() {
        let record = unsafe { LinuxX86_64::adapt(libc::SIGBUS, std::ptr::null(), std::ptr::null()) };
        assert_eq!(record.kind, SignalKind::Bus);
        assert_eq!(record.pc, 0);
        assert_eq!(record.fault_address, None);
    }
}
