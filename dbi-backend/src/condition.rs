//! C4: `PatchCondition` predicates, composed with `And`/`Or` the same way
//! the reference design's `PatchCondition` objects compose, but as a
//! value type evaluated by a `match` instead of a class hierarchy.

use iced_x86::{FlowControl, Instruction, Mnemonic};

#[derive(Debug, Clone, Copy)]
pub enum Condition {
    Always,
    OpcodeIn(&'static [Mnemonic]),
    IsCall,
    IsReturn,
    IsIndirectBranch,
    ReadsPc,
    And(&'static Condition, &'static Condition),
    Or(&'static Condition, &'static Condition),
}

impl Condition {
    pub fn test(&self, inst: &Instruction) -> bool {
        match self {
            Condition::Always => true,
            Condition::OpcodeIn(list) => list.contains(&inst.mnemonic()),
            Condition::IsCall => matches!(
                inst.flow_control(),
                FlowControl::Call | FlowControl::IndirectCall
            ),
            Condition::IsReturn => matches!(inst.flow_control(), FlowControl::Return),
            Condition::IsIndirectBranch => matches!(
                inst.flow_control(),
                FlowControl::IndirectBranch | FlowControl::IndirectCall
            ),
            Condition::ReadsPc => instruction_reads_rip(inst),
            Condition::And(a, b) => a.test(inst) && b.test(inst),
            Condition::Or(a, b) => a.test(inst) || b.test(inst),
        }
    }
}

fn instruction_reads_rip(inst: &Instruction) -> bool {
    inst.is_ip_rel_memory_operand()
}
