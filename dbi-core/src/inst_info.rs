//! C3: a static table describing, per mnemonic, what kind of memory
//! access (if any) an instruction family performs, independent of the
//! specific operands of a given decoded instance. `PatchCondition`s in
//! `dbi-backend` consult this to decide whether a rule family applies
//! (e.g. "does this instruction read memory implicitly, such as string
//! instructions or stack ops, beyond what its explicit operands show").

use std::collections::HashMap;
use std::sync::OnceLock;

use iced_x86::{Code, Instruction, Mnemonic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    None,
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccessInfo {
    pub access: MemoryAccess,
    /// True if this mnemonic can have an implicit memory operand not
    /// reflected in `Instruction::op_count` (e.g. `PUSH`/`POP`/`CALL`/
    /// `RET`/string instructions using RSI/RDI/RCX implicitly).
    pub implicit: bool,
    /// Size in bytes of the implicit memory read, if any. Only
    /// meaningful for `implicit` entries: explicit-operand instructions
    /// (`mov`, `add`, ...) get their size from the decoded instance's own
    /// operands, not from this mnemonic-level table.
    pub read_size: Option<u32>,
    /// Size in bytes of the implicit memory write, if any. Same caveat
    /// as `read_size`.
    pub write_size: Option<u32>,
}

impl MemAccessInfo {
    const NONE: MemAccessInfo = MemAccessInfo {
        access: MemoryAccess::None,
        implicit: false,
        read_size: None,
        write_size: None,
    };

    pub fn unsupported_read(&self) -> bool {
        matches!(self.access, MemoryAccess::Read | MemoryAccess::ReadWrite) && self.implicit
    }

    pub fn unsupported_write(&self) -> bool {
        matches!(self.access, MemoryAccess::Write | MemoryAccess::ReadWrite) && self.implicit
    }
}

/// The x86-64 string-move mnemonic collides textually with the SSE2
/// scalar-double `movsd`: `iced_x86::Mnemonic::Movsd` names both, so the
/// mnemonic-keyed table below can't carry an entry for it without also
/// misclassifying `movsd xmm0, xmm1`. Disambiguated by `Instruction::code`
/// instead, which iced-x86 keeps distinct per encoding.
const STRING_MOVSD: MemAccessInfo = MemAccessInfo {
    access: MemoryAccess::ReadWrite,
    implicit: true,
    read_size: Some(4),
    write_size: Some(4),
};

fn table() -> &'static HashMap<Mnemonic, MemAccessInfo> {
    static TABLE: OnceLock<HashMap<Mnemonic, MemAccessInfo>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use MemoryAccess::*;
        let mut m = HashMap::new();
        let mut add = |mnemonic: Mnemonic, access: MemoryAccess, implicit: bool, sizes: (Option<u32>, Option<u32>)| {
            m.insert(
                mnemonic,
                MemAccessInfo {
                    access,
                    implicit,
                    read_size: sizes.0,
                    write_size: sizes.1,
                },
            );
        };

        // Explicit-operand memory access: reflected fully by the decoded
        // instruction's operand list, nothing implicit to worry about, so
        // no static size can be given here.
        add(Mnemonic::Mov, ReadWrite, false, (Option::None, Option::None));
        add(Mnemonic::Lea, None, false, (Option::None, Option::None));
        add(Mnemonic::Add, ReadWrite, false, (Option::None, Option::None));
        add(Mnemonic::Sub, ReadWrite, false, (Option::None, Option::None));
        add(Mnemonic::Cmp, Read, false, (Option::None, Option::None));
        add(Mnemonic::Test, Read, false, (Option::None, Option::None));

        // Implicit stack memory access: RSP is read and written but no
        // explicit memory operand appears in the decoded instruction.
        // Sized for the 64-bit default operand size this engine targets.
        add(Mnemonic::Push, Write, true, (Option::None, Some(8)));
        add(Mnemonic::Pop, Read, true, (Some(8), Option::None));
        add(Mnemonic::Call, ReadWrite, true, (Some(8), Some(8)));
        add(Mnemonic::Ret, Read, true, (Some(8), Option::None));
        add(Mnemonic::Leave, ReadWrite, true, (Some(8), Option::None));
        add(Mnemonic::Enter, ReadWrite, true, (Some(8), Some(8)));

        // String instructions: implicit memory access through RSI/RDI,
        // repeated by RCX under a REP prefix. `Movsd` deliberately absent
        // here; see `STRING_MOVSD`/`lookup`.
        add(Mnemonic::Movsb, ReadWrite, true, (Some(1), Some(1)));
        add(Mnemonic::Movsw, ReadWrite, true, (Some(2), Some(2)));
        add(Mnemonic::Movsq, ReadWrite, true, (Some(8), Some(8)));
        add(Mnemonic::Stosb, Write, true, (Option::None, Some(1)));
        add(Mnemonic::Stosw, Write, true, (Option::None, Some(2)));
        add(Mnemonic::Stosd, Write, true, (Option::None, Some(4)));
        add(Mnemonic::Stosq, Write, true, (Option::None, Some(8)));
        add(Mnemonic::Cmpsb, Read, true, (Some(1), Option::None));
        add(Mnemonic::Scasb, Read, true, (Some(1), Option::None));

        m
    })
}

/// Look up the memory-access profile for a decoded instruction; unknown
/// mnemonics default to "no memory access" rather than erroring, since
/// the vast majority of x86-64 opcodes genuinely have none.
pub fn lookup(inst: &Instruction) -> MemAccessInfo {
    if inst.code() == Code::Movsd_m32_m32 {
        return STRING_MOVSD;
    }
    table()
        .get(&inst.mnemonic())
        .copied()
        .unwrap_or(MemAccessInfo::NONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, InstructionInfoFactory, OpAccess};

    fn decode(bytes: &[u8]) -> Instruction {
        let mut dec = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
        dec.decode()
    }

    fn mem_access_is_read(access: OpAccess) -> bool {
        matches!(
            access,
            OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
        )
    }

    fn mem_access_is_write(access: OpAccess) -> bool {
        matches!(
            access,
            OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
        )
    }

    #[test]
    fn push_is_implicit_write() {
        let info = lookup(&decode(&[0x50])); // push rax
        assert!(info.unsupported_write());
        assert!(!info.unsupported_read());
        assert_eq!(info.write_size, Some(8));
    }

    #[test]
    fn mov_is_explicit_not_implicit() {
        // mov eax, ecx
        let info = lookup(&decode(&[0x89, 0xc8]));
        assert!(!info.unsupported_read());
        assert!(!info.unsupported_write());
        assert_eq!(info.read_size, None);
    }

    #[test]
    fn unknown_mnemonic_defaults_to_none() {
        let info = lookup(&decode(&[0x90])); // nop
        assert_eq!(info.access, MemoryAccess::None);
    }

    #[test]
    fn movsd_string_form_is_distinguished_from_sse_movsd() {
        let string_form = lookup(&decode(&[0xa5])); // movsd (string, 32-bit)
        assert!(string_form.unsupported_read());
        assert!(string_form.unsupported_write());

        // movsd xmm0, xmm1 (SSE2 scalar double move) -- same mnemonic
        // text, must not be reported as an implicit memory access.
        let sse_form = lookup(&decode(&[0xf2, 0x0f, 0x10, 0xc1]));
        assert_eq!(sse_form.access, MemoryAccess::None);
        assert!(!sse_form.implicit);
    }

    #[test]
    fn every_table_entry_is_consistent_with_its_access_kind() {
        // A Read-only entry must never report unsupported_write, and
        // vice versa -- catches copy/paste mistakes in the table.
        for (&_mnemonic, info) in table().iter() {
            match info.access {
                MemoryAccess::Read => assert!(!info.unsupported_write()),
                MemoryAccess::Write => assert!(!info.unsupported_read()),
                _ => {}
            }
        }
    }

    /// Cross-checks every `implicit` table entry against what the decoder
    /// itself reports for a concrete sample of that mnemonic: the access
    /// direction and, where this table claims a size, the byte width of
    /// the memory operand `InstructionInfoFactory` actually sees. Catches
    /// a table entry silently drifting out of sync with the decoder it's
    /// meant to summarize.
    #[test]
    fn implicit_entries_match_decoder_reported_memory_access() {
        let samples: &[(Mnemonic, &[u8])] = &[
            (Mnemonic::Push, &[0x50]),             // push rax
            (Mnemonic::Pop, &[0x58]),               // pop rax
            (Mnemonic::Call, &[0xe8, 0, 0, 0, 0]),  // call rel32
            (Mnemonic::Ret, &[0xc3]),               // ret
            (Mnemonic::Leave, &[0xc9]),              // leave
            (Mnemonic::Movsb, &[0xa4]),              // movsb
            (Mnemonic::Movsw, &[0x66, 0xa5]),        // movsw
            (Mnemonic::Movsq, &[0x48, 0xa5]),        // movsq
            (Mnemonic::Stosb, &[0xaa]),              // stosb
            (Mnemonic::Stosd, &[0xab]),               // stosd
            (Mnemonic::Cmpsb, &[0xa6]),               // cmpsb
            (Mnemonic::Scasb, &[0xae]),               // scasb
        ];

        let mut factory = InstructionInfoFactory::new();
        for (mnemonic, bytes) in samples {
            let inst = decode(bytes);
            assert_eq!(inst.mnemonic(), *mnemonic, "sample bytes decoded to an unexpected mnemonic");
            let info = lookup(&inst);
            assert!(info.implicit, "{mnemonic:?} must be marked implicit");

            let used = factory.info(&inst);
            let mem = used.used_memory();
            assert!(
                !mem.is_empty(),
                "{mnemonic:?} sample has no decoder-reported memory access to cross-check against"
            );

            let reads_mem = mem.iter().any(|m| mem_access_is_read(m.access()));
            let writes_mem = mem.iter().any(|m| mem_access_is_write(m.access()));
            match info.access {
                MemoryAccess::Read => assert!(reads_mem && !writes_mem, "{mnemonic:?}"),
                MemoryAccess::Write => assert!(writes_mem && !reads_mem, "{mnemonic:?}"),
                MemoryAccess::ReadWrite => assert!(reads_mem && writes_mem, "{mnemonic:?}"),
                MemoryAccess::None => panic!("{mnemonic:?} marked implicit but table says no access"),
            }

            if let Some(size) = info.read_size.or(info.write_size) {
                let reported = mem[0].memory_size().size() as u32;
                assert_eq!(reported, size, "{mnemonic:?} size mismatch");
            }
        }
    }
}
