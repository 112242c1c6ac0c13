//! Canonical x86-64 `PatchRule` table, evaluated in order; the first rule
//! whose `condition` matches a decoded instruction wins (no further rules
//! are tried). Mirrors the ordered rule-list / first-match-wins dispatch
//! of the reference design's `PatchRules_X86_64.cpp`, generalized from a
//! `vector<PatchRule>` built at startup into a `'static` array.

use dbi_core::generator::Generator;
use dbi_core::temp::Temp;
use iced_x86::Mnemonic;

use crate::condition::Condition;

pub struct PatchRule {
    pub name: &'static str,
    pub condition: Condition,
    pub generators: &'static [Generator],
}

// Placeholder temp used only to describe the *shape* of a rule's
// generator list; `patch::generate_patch` substitutes freshly allocated
// temps from the instruction's own `TempManager` before emission, so the
// register id baked in here is never actually used.
const PLACEHOLDER: Temp = Temp {
    reg: dbi_core::temp::GprId(0),
};

/// Family 1: direct call — simulate with an explicit push of the return
/// address and a jump to the call target, so the broker can intercept
/// calls into uninstrumented code at the point of transfer.
static CALL_GENERATORS: &[Generator] = &[
    Generator::GetPCOffset {
        dest: PLACEHOLDER,
        offset_from: 0,
    },
    Generator::SimulateCall { target: PLACEHOLDER },
];

/// Family 2: return — simulate with a pop-and-jump so the engine sees the
/// return address before control actually leaves instrumented code.
static RET_GENERATORS: &[Generator] = &[Generator::SimulateRet { imm: 0 }];

/// Family 3: indirect branch (jmp/call through a register or memory) —
/// materialize the target into a temp before handing control to the
/// selector, since the target is not known until this instruction runs.
static INDIRECT_BRANCH_GENERATORS: &[Generator] = &[Generator::GetOperand {
    dest: PLACEHOLDER,
    op_index: 0,
}];

/// Family 4: conditional branch — both the taken and fallthrough
/// addresses must be recorded so `ExecBlockManager::writeBasicBlock` can
/// end the current sequence and materialize both successor targets as
/// selector entries.
static COND_BRANCH_GENERATORS: &[Generator] = &[Generator::GetOperand {
    dest: PLACEHOLDER,
    op_index: 0,
}];

/// Family 5: RIP-relative memory operand — x86-64 addressing computed
/// relative to the *original* instruction address must be rewritten once
/// the instruction has been relocated into the code arena at a different
/// address, or the effective address it computes would be wrong.
/// `CopyOriginal` re-encodes the instruction at its new address rather
/// than copying its bytes verbatim, which is what makes iced-x86's block
/// encoder recompute the displacement for us.
static RIP_RELATIVE_GENERATORS: &[Generator] = &[Generator::CopyOriginal];

/// Family 6 (default/fallthrough): plain instructions with no control-flow
/// or addressing-mode implications are copied through unmodified.
static DEFAULT_GENERATORS: &[Generator] = &[Generator::CopyOriginal];

pub static PATCH_RULES: &[PatchRule] = &[
    PatchRule {
        name: "call",
        condition: Condition::IsCall,
        generators: CALL_GENERATORS,
    },
    PatchRule {
        name: "return",
        condition: Condition::IsReturn,
        generators: RET_GENERATORS,
    },
    PatchRule {
        name: "indirect-branch",
        condition: Condition::IsIndirectBranch,
        generators: INDIRECT_BRANCH_GENERATORS,
    },
    PatchRule {
        name: "conditional-branch",
        condition: Condition::OpcodeIn(&[
            Mnemonic::Jo,
            Mnemonic::Jno,
            Mnemonic::Jb,
            Mnemonic::Jae,
            Mnemonic::Je,
            Mnemonic::Jne,
            Mnemonic::Jbe,
            Mnemonic::Ja,
            Mnemonic::Js,
            Mnemonic::Jns,
            Mnemonic::Jp,
            Mnemonic::Jnp,
            Mnemonic::Jl,
            Mnemonic::Jge,
            Mnemonic::Jle,
            Mnemonic::Jg,
            Mnemonic::Jcxz,
            Mnemonic::Jecxz,
            Mnemonic::Jrcxz,
        ]),
        generators: COND_BRANCH_GENERATORS,
    },
    PatchRule {
        name: "rip-relative",
        condition: Condition::ReadsPc,
        generators: RIP_RELATIVE_GENERATORS,
    },
    PatchRule {
        name: "default",
        condition: Condition::Always,
        generators: DEFAULT_GENERATORS,
    },
];
