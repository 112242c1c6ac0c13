//! `RelocatableInst`: the output of applying one `Generator` to one guest
//! instruction, before it has been placed at a fixed address in the code
//! arena.
//!
//! The reference design expresses this as a tree of `RelocatableInst`
//! subclasses (one per host-instruction shape) with a virtual `reloc()`
//! that writes bytes at a given address. Rust prefers a closed sum type
//! dispatched with `match` over a small trait-object hierarchy when the
//! variant set is fixed and known up front, so this is an enum: each
//! variant is either already-final bytes plus a list of fixups to apply
//! once the write address is known (`Baked`), or one of a handful of
//! parametric host-instruction templates the x86-64 backend emits
//! (register move, memory load/store relative to the env pointer, label
//! branch). `dbi-backend::patch` is the only place that constructs these;
//! `dbi-exec::block` is the only place that calls `relocate`.

use iced_x86::Instruction;

use crate::label::RelocKind;
use crate::temp::GprId;

/// A single byte-offset fixup to apply inside a `Baked` instruction once
/// its final address is known (e.g. a RIP-relative displacement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub offset: usize,
    pub kind: RelocKind,
    /// Absolute target address the fixup resolves to.
    pub target: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocatableInst {
    /// Already-encoded bytes (e.g. the patched original instruction, or a
    /// prebuilt instrumentation call), plus any fixups that must be
    /// applied once this sequence's write address is known.
    Baked { bytes: Vec<u8>, fixups: Vec<Fixup> },
    /// A decoded instruction to re-encode at its final arena address.
    /// Unlike `Baked`, the bytes aren't fixed up front: `dbi-asm`'s block
    /// encoder recomputes any RIP-relative displacement the instruction
    /// carries from the real write address, which `Baked`'s offset-based
    /// `Fixup` list has no way to express for an instruction whose byte
    /// layout (not just one displacement field) iced-x86 controls.
    Relocate { inst: Instruction },
    /// `mov reg, imm64` with `imm` resolved to an absolute address or
    /// constant at generation time.
    MovImm { reg: GprId, imm: u64 },
    /// `mov reg, [rbp + offset]` — load from a `Context` field.
    LoadOffset { reg: GprId, offset: i32 },
    /// `mov [rbp + offset], reg` — store into a `Context` field.
    StoreOffset { reg: GprId, offset: i32 },
    /// An unconditional jump to a label, resolved by the arena writer once
    /// the label's final offset is known.
    JmpLabel { label_id: u32 },
}

impl RelocatableInst {
    /// Upper bound on the encoded size in bytes; used by `ExecBlock` to
    /// decide whether a sequence fits the remaining arena space before
    /// committing to write it.
    pub fn max_size(&self) -> usize {
        match self {
            RelocatableInst::Baked { bytes, .. } => bytes.len(),
            RelocatableInst::Relocate { .. } => 15, // iced-x86 MAX_INSTRUCTION_LENGTH
            RelocatableInst::MovImm { .. } => 10,
            RelocatableInst::LoadOffset { .. } | RelocatableInst::StoreOffset { .. } => 7,
            RelocatableInst::JmpLabel { .. } => 5,
        }
    }
}
