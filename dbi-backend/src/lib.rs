//! x86-64 architecture backend: C2 (register model), C4 (PatchRule
//! engine, canonical rule families, host-instruction emission).

pub mod condition;
pub mod patch;
pub mod regs;
pub mod rules;

pub use condition::Condition;
pub use patch::generate_patch;
pub use regs::{used_gpr, RESERVED_REGS};
pub use rules::{PatchRule, PATCH_RULES};
