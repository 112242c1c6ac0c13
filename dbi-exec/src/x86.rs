//! Hand-assembled x86-64 encoding helpers shared between `ExecBlock`'s
//! sequence prologue/epilogue and `ExecBroker`'s launch/resume stubs.
//! Every helper takes raw register ids in ModR/M order (RAX=0 .. R15=15),
//! the same numbering `dbi_core::context::GPRState` uses, so a `Context`
//! field offset from `dbi_core::context::field_offset` can be passed
//! straight through with no translation step.

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;
pub const RBP: u8 = 5;

/// `push rbp`.
pub fn push_rbp() -> Vec<u8> {
    vec![0x55]
}

/// `pop rbp`.
pub fn pop_rbp() -> Vec<u8> {
    vec![0x5d]
}

/// `ret`.
pub fn ret() -> Vec<u8> {
    vec![0xc3]
}

/// `mov rbp, rdi` — loads the incoming `Context*` (RDI, first integer arg
/// under SysV) into RBP, the environment-pointer register every
/// `[rbp+disp32]`-relative access in this engine assumes is live.
pub fn mov_rbp_rdi() -> Vec<u8> {
    vec![0x48, 0x89, 0xfd]
}

/// `mov reg, [rbp + offset]`.
pub fn load_rbp_offset(reg: u8, offset: i32) -> Vec<u8> {
    encode_modrm_rbp(0x8b, reg, offset)
}

/// `mov [rbp + offset], reg`.
pub fn store_rbp_offset(reg: u8, offset: i32) -> Vec<u8> {
    encode_modrm_rbp(0x89, reg, offset)
}

/// `mov qword [rbp + offset], 0`.
pub fn store_rbp_offset_zero(offset: i32) -> Vec<u8> {
    let mut out = vec![0x48, 0xc7, 0x85];
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out
}

/// `fxrstor64 [rbp + offset]`.
pub fn fxrstor_rbp(offset: i32) -> Vec<u8> {
    let mut out = vec![0x48, 0x0f, 0xae, 0x8d];
    out.extend_from_slice(&offset.to_le_bytes());
    out
}

/// `fxsave64 [rbp + offset]`.
pub fn fxsave_rbp(offset: i32) -> Vec<u8> {
    let mut out = vec![0x48, 0x0f, 0xae, 0x85];
    out.extend_from_slice(&offset.to_le_bytes());
    out
}

/// `movabs reg, imm64`.
pub fn movabs_reg_imm64(reg: u8, imm: u64) -> Vec<u8> {
    let rex = 0x48 | if reg >= 8 { 0x01 } else { 0 }; // REX.B
    let mut out = vec![rex, 0xb8 + (reg & 0x7)];
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

/// `jmp reg` (near indirect).
pub fn jmp_reg(reg: u8) -> Vec<u8> {
    let mut out = Vec::new();
    if reg >= 8 {
        out.push(0x41); // REX.B
    }
    out.push(0xff);
    out.push(0xe0 | (reg & 0x7));
    out
}

fn encode_modrm_rbp(opcode: u8, reg: u8, offset: i32) -> Vec<u8> {
    let rex = 0x48 | if reg >= 8 { 0x04 } else { 0 }; // REX.R
    let modrm = 0x85 | ((reg & 0x7) << 3); // mod=disp32, rm=101 ([rbp]+disp32)
    let mut out = vec![rex, opcode, modrm];
    out.extend_from_slice(&offset.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jmp_r11_needs_rex_b() {
        assert_eq!(jmp_reg(R11), vec![0x41, 0xff, 0xe3]);
    }

    #[test]
    fn jmp_rax_has_no_rex() {
        assert_eq!(jmp_reg(RAX), vec![0xff, 0xe0]);
    }

    #[test]
    fn load_rbp_offset_encodes_disp32() {
        let bytes = load_rbp_offset(RAX, 0x10);
        assert_eq!(bytes, vec![0x48, 0x8b, 0x85, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn prologue_then_epilogue_is_stack_neutral() {
        let prologue = [push_rbp(), mov_rbp_rdi()].concat();
        let epilogue = [pop_rbp(), ret()].concat();
        assert_eq!(prologue[0], 0x55);
        assert_eq!(epilogue[0], 0x5d);
        assert_eq!(*epilogue.last().unwrap(), 0xc3);
    }
}
