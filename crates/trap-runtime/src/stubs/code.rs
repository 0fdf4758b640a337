//! Machine code of a transition stub
//!
//! A stub loads the cached value into the register the callee expects it in
//! and jumps to the destination:
//!
//! ```text
//! x86_64                       aarch64
//!  0: mov rax, <cached>         0: ldr x9,  [pc + 16]
//! 10: mov r11, <destination>    4: ldr x16, [pc + 20]
//! 20: jmp r11                   8: br  x16
//! 23: int3 padding             12: brk #0
//!                              16: <cached>
//!                              24: <destination>
//! ```

/// Size of one stub slot in bytes
pub const STUB_SIZE: usize = 32;

/// Register that receives the cached value
#[cfg(target_arch = "x86_64")]
pub const CACHED_VALUE_REGISTER: &str = "rax";
/// Register that receives the cached value
#[cfg(target_arch = "aarch64")]
pub const CACHED_VALUE_REGISTER: &str = "x9";

#[cfg(target_arch = "x86_64")]
mod encoding {
    use super::STUB_SIZE;

    const MOV_RAX_IMM64: [u8; 2] = [0x48, 0xB8];
    const MOV_R11_IMM64: [u8; 2] = [0x49, 0xBB];
    const JMP_R11: [u8; 3] = [0x41, 0xFF, 0xE3];
    const INT3: u8 = 0xCC;

    pub fn emit(destination: usize, cached: usize) -> [u8; STUB_SIZE] {
        let mut code = [INT3; STUB_SIZE];
        code[0..2].copy_from_slice(&MOV_RAX_IMM64);
        code[2..10].copy_from_slice(&(cached as u64).to_le_bytes());
        code[10..12].copy_from_slice(&MOV_R11_IMM64);
        code[12..20].copy_from_slice(&(destination as u64).to_le_bytes());
        code[20..23].copy_from_slice(&JMP_R11);
        code
    }

    pub fn poison() -> [u8; STUB_SIZE] {
        [INT3; STUB_SIZE]
    }

    pub fn decode(code: &[u8]) -> Option<(usize, usize)> {
        let code = code.get(..STUB_SIZE)?;
        if code[0..2] != MOV_RAX_IMM64 || code[10..12] != MOV_R11_IMM64 || code[20..23] != JMP_R11 {
            return None;
        }
        let cached = u64::from_le_bytes(code[2..10].try_into().ok()?);
        let destination = u64::from_le_bytes(code[12..20].try_into().ok()?);
        Some((destination as usize, cached as usize))
    }
}

#[cfg(target_arch = "aarch64")]
mod encoding {
    use super::STUB_SIZE;

    const LDR_X9_LITERAL: u32 = 0x5800_0089;
    const LDR_X16_LITERAL: u32 = 0x5800_00B0;
    const BR_X16: u32 = 0xD61F_0200;
    const BRK_0: u32 = 0xD420_0000;

    pub fn emit(destination: usize, cached: usize) -> [u8; STUB_SIZE] {
        let mut code = [0u8; STUB_SIZE];
        code[0..4].copy_from_slice(&LDR_X9_LITERAL.to_le_bytes());
        code[4..8].copy_from_slice(&LDR_X16_LITERAL.to_le_bytes());
        code[8..12].copy_from_slice(&BR_X16.to_le_bytes());
        code[12..16].copy_from_slice(&BRK_0.to_le_bytes());
        code[16..24].copy_from_slice(&(cached as u64).to_le_bytes());
        code[24..32].copy_from_slice(&(destination as u64).to_le_bytes());
        code
    }

    pub fn poison() -> [u8; STUB_SIZE] {
        let mut code = [0u8; STUB_SIZE];
        for word in code.chunks_exact_mut(4) {
            word.copy_from_slice(&BRK_0.to_le_bytes());
        }
        code
    }

    pub fn decode(code: &[u8]) -> Option<(usize, usize)> {
        let code = code.get(..STUB_SIZE)?;
        let word = |at: usize| u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
        if word(0) != LDR_X9_LITERAL || word(4) != LDR_X16_LITERAL || word(8) != BR_X16 {
            return None;
        }
        let cached = u64::from_le_bytes(code[16..24].try_into().ok()?);
        let destination = u64::from_le_bytes(code[24..32].try_into().ok()?);
        Some((destination as usize, cached as usize))
    }
}

/// Encode a stub jumping to `destination` with `cached` in [`CACHED_VALUE_REGISTER`]
pub fn emit(destination: usize, cached: usize) -> [u8; STUB_SIZE] {
    encoding::emit(destination, cached)
}

/// Trap instructions filling a reclaimed slot
pub fn poison() -> [u8; STUB_SIZE] {
    encoding::poison()
}

/// Read `(destination, cached)` back out of stub code
///
/// Returns `None` for anything that is not a complete stub, including a
/// poisoned slot.
pub fn decode(code: &[u8]) -> Option<(usize, usize)> {
    encoding::decode(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitted_stub_decodes() {
        let code = emit(0x7f00_1234_5678, 0xdead_beef);
        assert_eq!(decode(&code), Some((0x7f00_1234_5678, 0xdead_beef)));
    }

    #[test]
    fn test_poison_does_not_decode() {
        assert_eq!(decode(&poison()), None);
        assert_eq!(decode(&[0u8; 8]), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_layout() {
        let code = emit(0x1122_3344_5566_7788, 0x99);
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(code[2], 0x99);
        assert_eq!(&code[10..12], &[0x49, 0xBB]);
        assert_eq!(code[12], 0x88);
        assert_eq!(&code[20..23], &[0x41, 0xFF, 0xE3]);
        assert!(code[23..].iter().all(|&b| b == 0xCC));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_aarch64_layout() {
        let code = emit(0x1122_3344_5566_7788, 0x99);
        assert_eq!(&code[..4], &0x5800_0089u32.to_le_bytes());
        assert_eq!(&code[4..8], &0x5800_00B0u32.to_le_bytes());
        assert_eq!(&code[8..12], &0xD61F_0200u32.to_le_bytes());
        assert_eq!(code[16], 0x99);
        assert_eq!(code[24], 0x88);
    }
}
