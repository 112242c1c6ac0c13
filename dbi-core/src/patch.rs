//! `Patch`: the full set of relocatable instructions standing in for one
//! guest instruction, plus the metadata needed to place it in a sequence.

use iced_x86::Instruction;

use crate::context::field_offset;
use crate::generator::{ContextField, Generator};
use crate::metadata::InstMetadata;
use crate::reloc::RelocatableInst;
use crate::temp::TempManager;

#[derive(Debug, Clone)]
pub struct Patch {
    pub metadata: InstMetadata,
    pub insts: Vec<RelocatableInst>,
}

impl Patch {
    /// Build a patch from an ordered generator list, wrapping the whole
    /// sequence in `SaveReg`/`LoadReg` for every register the generators'
    /// shared `TempManager` borrowed. This wrapping is mandatory and
    /// always happens here rather than per-generator: a generator that
    /// asks for a scratch register has no way to know which other
    /// generators in the same rule also borrowed one, so only the rule
    /// as a whole can compute the full save/restore set.
    ///
    /// `emit` lowers one `Generator` into zero or more `RelocatableInst`s,
    /// given the original decoded instruction (needed by `CopyOriginal`
    /// and `ModifyInstruction` to re-encode); it is supplied by the caller
    /// (`dbi-backend`) because only the architecture backend knows how to
    /// encode e.g. `SimulateCall` on x86-64.
    pub fn build(
        metadata: InstMetadata,
        generators: &[Generator],
        temps: &TempManager,
        mut emit: impl FnMut(&Generator, &Instruction) -> Vec<RelocatableInst>,
    ) -> Patch {
        let mut insts = Vec::new();

        for reg in temps.used_registers() {
            insts.push(RelocatableInst::StoreOffset {
                reg: *reg,
                offset: field_offset(ContextField::Gpr(reg.0)),
            });
        }

        let mut modify_pc = metadata.modify_pc;
        for g in generators {
            if g.do_not_instrument() {
                continue;
            }
            modify_pc |= g.modifies_pc();
            insts.extend(emit(g, &metadata.inst));
        }

        for reg in temps.used_registers().iter().rev() {
            insts.push(RelocatableInst::LoadOffset {
                reg: *reg,
                offset: field_offset(ContextField::Gpr(reg.0)),
            });
        }

        let mut metadata = metadata;
        metadata.modify_pc = modify_pc;
        Patch { metadata, insts }
    }

    pub fn total_size(&self) -> usize {
        self.insts.iter().map(RelocatableInst::max_size).sum()
    }
}
