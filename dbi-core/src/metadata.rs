//! Per-instruction metadata that survives from decode through patching
//! into the final `Patch`, mirroring the field set of the reference
//! design's `InstMetadata` (`inst`, `address`, `instSize`, `patchSize`,
//! `modifyPC`, `merge`).

use iced_x86::Instruction;

/// Decoded instruction plus the bookkeeping a `PatchRule` needs to finish
/// generating its replacement.
#[derive(Debug, Clone)]
pub struct InstMetadata {
    pub inst: Instruction,
    pub address: u64,
    pub inst_size: u32,
    /// Filled in once the patch's relocatable instructions are
    /// concretized; 0 until then.
    pub patch_size: u32,
    /// Set by a generator whose effect changes the program counter beyond
    /// normal fallthrough (a simulated call/ret, an instrumented indirect
    /// branch).
    pub modify_pc: bool,
    /// Set when this instruction's patch should be merged into the
    /// previous one's sequence rather than starting a new sequence
    /// boundary (used by multi-instruction rule families, e.g. a
    /// load-pair the backend always patches together).
    pub merge: bool,
}

impl InstMetadata {
    pub fn new(inst: Instruction, address: u64, inst_size: u32) -> Self {
        Self {
            inst,
            address,
            inst_size,
            patch_size: 0,
            modify_pc: false,
            merge: false,
        }
    }

    pub fn end_address(&self) -> u64 {
        self.address + self.inst_size as u64
    }
}
