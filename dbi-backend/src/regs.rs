//! C2: register read/write classification for x86-64.
//!
//! `classify_gpr` answers, per GPR id, whether an instruction leaves it
//! `Unused`, `Read`, `Written`, or both (`ReadWrite`) — the distinction a
//! rule needs to decide whether a register has to be spilled before it's
//! clobbered versus only restored afterward. `used_gpr` is the coarser
//! bitset (`classify_gpr`'s result collapsed to "touched at all")
//! `TempManager::new` is seeded with, so a scratch register is never one
//! the patched instruction itself needs. Grounded in the implicit-operand
//! handling a decoder's `InstructionInfoFactory` exposes
//! (`iced_x86::InstructionInfoFactory`), special-casing the instructions
//! whose implicit register use that API does not surface as a plain
//! register operand (stack pointer for `push`/`pop`/`call`/`ret`).

use dbi_core::temp::GprId;
use iced_x86::{Instruction, InstructionInfoFactory, Mnemonic, OpAccess, Register};

/// Registers never available to a `TempManager`: the stack pointer and
/// the environment pointer (RBP, following the host backend's `TCG_AREG0`
/// convention — the same choice the code-generation backend makes for
/// its own prologue, carried over here so one register file serves both
/// the JIT codegen layer and the instrumentation patch layer).
pub const RESERVED_REGS: u32 = (1 << 4) | (1 << 5); // RSP, RBP

fn gpr_id_of(reg: Register) -> Option<u8> {
    if reg == Register::None {
        return None;
    }
    let full = reg.full_register();
    let idx = match full {
        Register::RAX => 0,
        Register::RCX => 1,
        Register::RDX => 2,
        Register::RBX => 3,
        Register::RSP => 4,
        Register::RBP => 5,
        Register::RSI => 6,
        Register::RDI => 7,
        Register::R8 => 8,
        Register::R9 => 9,
        Register::R10 => 10,
        Register::R11 => 11,
        Register::R12 => 12,
        Register::R13 => 13,
        Register::R14 => 14,
        Register::R15 => 15,
        _ => return None,
    };
    Some(idx)
}

/// How an instruction touches one GPR: not at all, read-only,
/// write-only, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAccess {
    Unused,
    Read,
    Written,
    ReadWrite,
}

impl RegAccess {
    fn merge(self, other: RegAccess) -> RegAccess {
        use RegAccess::*;
        match (self, other) {
            (Unused, x) | (x, Unused) => x,
            (Read, Read) => Read,
            (Written, Written) => Written,
            _ => ReadWrite,
        }
    }

    fn from_op_access(access: OpAccess) -> RegAccess {
        match (op_access_is_read(access), op_access_is_write(access)) {
            (true, true) => RegAccess::ReadWrite,
            (true, false) => RegAccess::Read,
            (false, true) => RegAccess::Written,
            (false, false) => RegAccess::Unused,
        }
    }
}

/// Per-GPR read/write classification, indexed by `GprId`.
pub fn classify_gpr(inst: &Instruction) -> [RegAccess; 16] {
    let mut class = [RegAccess::Unused; 16];
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(inst);

    for used in info.used_registers() {
        if let Some(id) = gpr_id_of(used.register()) {
            class[id as usize] = class[id as usize].merge(RegAccess::from_op_access(used.access()));
        }
    }

    // InstructionInfoFactory's implicit-register coverage for stack ops
    // varies by iced-x86 version; be explicit for the families the patch
    // rules actually special-case so a scratch register never collides
    // with RSP across a push/pop/call/ret/leave.
    match inst.mnemonic() {
        Mnemonic::Push | Mnemonic::Pop | Mnemonic::Call | Mnemonic::Ret => {
            class[4] = class[4].merge(RegAccess::ReadWrite); // RSP
        }
        Mnemonic::Leave => {
            class[4] = class[4].merge(RegAccess::ReadWrite); // RSP
            class[5] = class[5].merge(RegAccess::Read); // RBP
        }
        _ => {}
    }

    class
}

/// Bitset of GPR ids this instruction reads, writes, or uses implicitly —
/// `classify_gpr`'s result collapsed to "touched at all".
pub fn used_gpr(inst: &Instruction) -> u32 {
    let class = classify_gpr(inst);
    let mut set: u32 = 0;
    for (id, access) in class.iter().enumerate() {
        if *access != RegAccess::Unused {
            set |= 1 << id;
        }
    }
    set
}

/// Whether `access` includes a read (used to decide whether `GetOperand`
/// needs to materialize a value before an operand is clobbered by
/// `ModifyInstruction`).
pub fn op_access_is_read(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Whether `access` includes a write.
pub fn op_access_is_write(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Maps an engine `GprId` to the `iced_x86::Register` it corresponds to,
/// for generators that need to write a concrete register back into a
/// decoded `Instruction` before re-encoding it (`ModifyInstruction`).
pub fn iced_register(id: GprId) -> Register {
    const REGS: [Register; 16] = [
        Register::RAX,
        Register::RCX,
        Register::RDX,
        Register::RBX,
        Register::RSP,
        Register::RBP,
        Register::RSI,
        Register::RDI,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];
    REGS[id.0 as usize]
}

pub fn gpr_name(id: GprId) -> &'static str {
    const NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    NAMES[id.0 as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode(bytes: &[u8]) -> Instruction {
        let mut dec = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
        dec.decode()
    }

    #[test]
    fn push_uses_rsp_implicitly() {
        // push rax
        let inst = decode(&[0x50]);
        let set = used_gpr(&inst);
        assert_ne!(set & (1 << 4), 0);
        assert_ne!(set & (1 << 0), 0);
    }

    #[test]
    fn mov_reg_reg_uses_both_operands() {
        // mov rbx, rcx
        let inst = decode(&[0x48, 0x89, 0xcb]);
        let set = used_gpr(&inst);
        assert_ne!(set & (1 << 3), 0); // rbx
        assert_ne!(set & (1 << 1), 0); // rcx
    }
}
