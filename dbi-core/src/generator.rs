//! The `Generator` sum type: a closed set of "produce some relocatable
//! host instructions for this patched instruction" actions.
//!
//! The original design this engine is modeled on expresses generators as
//! a class hierarchy (`PatchGenerator` base class, one subclass per
//! generator kind, dispatched through a vtable). That doesn't translate
//! well into Rust: there is a small, fixed, closed set of generator kinds
//! known at compile time, so an enum dispatched with a single `match` in
//! `dbi-backend::patch::apply_generator` replaces the vtable, and rule
//! tables become `&'static [Generator]` instead of
//! `Vec<Box<dyn PatchGenerator>>`.

use crate::temp::Temp;

/// A byte offset into `Context` that a generator reads from or writes to.
/// Kept symbolic here (not a raw `usize`) so `dbi-backend` can resolve it
/// with `memoffset::offset_of!` against the concrete `Context` layout
/// without `dbi-core` needing to depend on the `memoffset` crate itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    Gpr(u8),
    Pc,
    RFlags,
    HostSp,
    Selector,
}

/// Describes how `ModifyInstruction` rewrites one operand of the
/// instruction being patched before it is re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandPatch {
    /// Replace a register operand with a scratch temp.
    ReplaceRegister { op_index: u8, with: Temp },
    /// Replace an immediate/displacement operand with a resolved absolute
    /// value computed at patch-generation time.
    ReplaceImmediate { op_index: u8, value: i64 },
}

/// One step of a patch. A `PatchRule` evaluates to an ordered list of
/// these; `Patch::generate` concatenates them (prefixed/suffixed with the
/// `SaveReg`/`LoadReg` pairs for every temp the rule's `TempManager`
/// handed out) into the final `RelocatableInst` sequence for one guest
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    /// Load `offset_from` relative to the instruction's own address
    /// (RIP-relative PC materialization) into `dest`.
    GetPCOffset { dest: Temp, offset_from: u64 },
    /// Copy one of the instruction's existing operands (already a
    /// register after decode) into `dest`.
    GetOperand { dest: Temp, op_index: u8 },
    /// Rewrite an operand of the instruction in place.
    ModifyInstruction { new_operand: OperandPatch },
    /// Copy the instruction being patched through unmodified, re-encoded
    /// (not byte-cloned) at its eventual arena address so any RIP-relative
    /// operand it carries still resolves to the same absolute target it
    /// had before relocation.
    CopyOriginal,
    /// Store `src` into a `Context` field.
    WriteTemp { src: Temp, dest: ContextField },
    /// Emit a call-simulation sequence: push a synthetic return address,
    /// jump to `target`.
    SimulateCall { target: Temp },
    /// Emit a return-simulation sequence: pop a return address and jump
    /// to it, adjusting the stack by `imm` extra bytes (the `ret imm16`
    /// form).
    SimulateRet { imm: u16 },
    /// Spill a guest GPR into its `Context` slot so a temp can borrow it.
    SaveReg { reg: crate::temp::GprId, offset: ContextField },
    /// Reload a guest GPR from its `Context` slot after a temp is done
    /// borrowing it.
    LoadReg { reg: crate::temp::GprId, offset: ContextField },
    /// Suppress instrumentation callbacks for this instruction (used by
    /// rules that only need to keep control-flow semantics correct, e.g.
    /// inside a just-emitted `SaveReg`/`LoadReg` pair).
    DoNotInstrument,
}

impl Generator {
    /// Whether this generator can change control flow such that the
    /// natural "fall through to the next instruction" path no longer
    /// holds — mirrors `PatchGenerator::modifyPC()` in the design this is
    /// modeled on. `PatchRule::generate` uses this to decide whether the
    /// synthesized epilogue jump to the next sequence is still needed.
    pub fn modifies_pc(&self) -> bool {
        matches!(
            self,
            Generator::SimulateCall { .. } | Generator::SimulateRet { .. }
        )
    }

    pub fn do_not_instrument(&self) -> bool {
        matches!(self, Generator::DoNotInstrument)
    }
}
