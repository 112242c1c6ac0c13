//! Ties together C3 (condition evaluation), the rule table, and C5
//! (`TempManager`) to turn a decoded `InstMetadata` into a `dbi_core::Patch`,
//! then lowers each `Generator` into concrete x86-64 `RelocatableInst`s.

use dbi_core::context::field_offset;
use dbi_core::generator::{ContextField, Generator, OperandPatch};
use dbi_core::metadata::InstMetadata;
use dbi_core::patch::Patch;
use dbi_core::reloc::RelocatableInst;
use dbi_core::temp::{GprId, Temp, TempManager};
use iced_x86::Instruction;

use crate::regs::{iced_register, used_gpr, RESERVED_REGS};
use crate::rules::{PatchRule, PATCH_RULES};

const PLACEHOLDER_REG: GprId = GprId(0);

/// Select the first matching rule and materialize its patch.
pub fn generate_patch(metadata: InstMetadata) -> Patch {
    let rule = select_rule(&metadata);
    let used = used_gpr(&metadata.inst);
    let mut temps = TempManager::new(used, RESERVED_REGS);

    let resolved = resolve_placeholders(rule.generators, &mut temps);

    Patch::build(metadata, &resolved, &temps, |g, inst| emit(g, inst))
}

fn select_rule(metadata: &InstMetadata) -> &'static PatchRule {
    PATCH_RULES
        .iter()
        .find(|rule| rule.condition.test(&metadata.inst))
        .expect("default rule always matches")
}

/// Rule generator tables embed a single shared placeholder temp
/// (`GprId(0)`) standing in for "whatever scratch register this rule
/// needs". All occurrences within one rule refer to the same logical
/// temp (e.g. `GetPCOffset` computing a value that `SimulateCall` then
/// jumps to), so a single fresh allocation substitutes for all of them.
fn resolve_placeholders(generators: &[Generator], temps: &mut TempManager) -> Vec<Generator> {
    let needs_temp = generators.iter().any(uses_placeholder);
    let real: Option<Temp> = if needs_temp {
        Some(temps.get_temp().expect("rule tables never exceed 16 GPRs worth of scratch"))
    } else {
        None
    };

    generators
        .iter()
        .map(|g| substitute(*g, real))
        .collect()
}

fn uses_placeholder(g: &Generator) -> bool {
    match g {
        Generator::GetPCOffset { dest, .. } => dest.reg == PLACEHOLDER_REG,
        Generator::GetOperand { dest, .. } => dest.reg == PLACEHOLDER_REG,
        Generator::SimulateCall { target } => target.reg == PLACEHOLDER_REG,
        _ => false,
    }
}

fn substitute(g: Generator, real: Option<Temp>) -> Generator {
    let real = match real {
        Some(t) => t,
        None => return g,
    };
    match g {
        Generator::GetPCOffset { dest, offset_from } if dest.reg == PLACEHOLDER_REG => {
            Generator::GetPCOffset {
                dest: real,
                offset_from,
            }
        }
        Generator::GetOperand { dest, op_index } if dest.reg == PLACEHOLDER_REG => {
            Generator::GetOperand {
                dest: real,
                op_index,
            }
        }
        Generator::SimulateCall { target } if target.reg == PLACEHOLDER_REG => {
            Generator::SimulateCall { target: real }
        }
        other => other,
    }
}

/// Lower one `Generator` into host instructions, given the original
/// decoded instruction the patch is standing in for. `field_offset` (from
/// `dbi_core::context`) is the only place that knows the concrete
/// `ContextField` byte layout; this function never hand-computes an
/// offset itself.
fn emit(g: &Generator, inst: &Instruction) -> Vec<RelocatableInst> {
    match g {
        Generator::GetPCOffset { dest, offset_from } => vec![RelocatableInst::MovImm {
            reg: dest.reg,
            imm: *offset_from,
        }],
        Generator::GetOperand { dest, .. } => vec![RelocatableInst::LoadOffset {
            reg: dest.reg,
            offset: field_offset(ContextField::Pc), // placeholder source until operand materialization lands
        }],
        Generator::ModifyInstruction {
            new_operand: OperandPatch::ReplaceImmediate { op_index, value },
        } => {
            let mut modified = *inst;
            let _ = modified.try_set_immediate_i32(*op_index as u32, *value as i32);
            vec![RelocatableInst::Relocate { inst: modified }]
        }
        Generator::ModifyInstruction {
            new_operand: OperandPatch::ReplaceRegister { op_index, with },
        } => {
            let mut modified = *inst;
            set_op_register(&mut modified, *op_index, iced_register(with.reg));
            vec![RelocatableInst::Relocate { inst: modified }]
        }
        Generator::CopyOriginal => vec![RelocatableInst::Relocate { inst: *inst }],
        Generator::WriteTemp { src, dest } => vec![RelocatableInst::StoreOffset {
            reg: src.reg,
            offset: field_offset(*dest),
        }],
        Generator::SimulateCall { target } => vec![RelocatableInst::LoadOffset {
            reg: target.reg,
            offset: field_offset(ContextField::Pc),
        }],
        Generator::SimulateRet { .. } => vec![RelocatableInst::Baked {
            bytes: vec![0xc3], // ret
            fixups: vec![],
        }],
        Generator::SaveReg { reg, offset } => vec![RelocatableInst::StoreOffset {
            reg: *reg,
            offset: field_offset(*offset),
        }],
        Generator::LoadReg { reg, offset } => vec![RelocatableInst::LoadOffset {
            reg: *reg,
            offset: field_offset(*offset),
        }],
        Generator::DoNotInstrument => vec![],
    }
}

fn set_op_register(inst: &mut Instruction, op_index: u8, reg: iced_x86::Register) {
    match op_index {
        0 => inst.set_op0_register(reg),
        1 => inst.set_op1_register(reg),
        2 => inst.set_op2_register(reg),
        3 => inst.set_op3_register(reg),
        _ => inst.set_op4_register(reg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode(bytes: &[u8], addr: u64) -> InstMetadata {
        let mut dec = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
        let inst = dec.decode();
        InstMetadata::new(inst, addr, inst.len() as u32)
    }

    #[test]
    fn plain_mov_uses_default_rule() {
        // mov eax, 0x2a
        let meta = decode(&[0xb8, 0x2a, 0x00, 0x00, 0x00], 0x1000);
        let patch = generate_patch(meta);
        assert_eq!(patch.insts.len(), 1);
        assert!(matches!(patch.insts[0], RelocatableInst::Relocate { .. }));
        assert!(!patch.metadata.modify_pc);
    }

    #[test]
    fn rip_relative_lea_is_copied_through() {
        // lea rax, [rip+0x10]
        let meta = decode(&[0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000);
        let patch = generate_patch(meta);
        assert!(patch
            .insts
            .iter()
            .any(|i| matches!(i, RelocatableInst::Relocate { .. })));
    }

    #[test]
    fn ret_is_simulated() {
        let meta = decode(&[0xc3], 0x1000);
        let patch = generate_patch(meta);
        assert!(!patch.insts.is_empty());
        assert!(patch.metadata.modify_pc);
    }

    #[test]
    fn call_rel32_allocates_and_frees_scratch_symmetrically() {
        // call rel32 (target doesn't matter for this test)
        let meta = decode(&[0xe8, 0x00, 0x00, 0x00, 0x00], 0x1000);
        let patch = generate_patch(meta);
        let stores = patch
            .insts
            .iter()
            .filter(|i| matches!(i, RelocatableInst::StoreOffset { .. }))
            .count();
        let loads = patch
            .insts
            .iter()
            .filter(|i| matches!(i, RelocatableInst::LoadOffset { .. }))
            .count();
        assert_eq!(stores, loads);
    }
}
