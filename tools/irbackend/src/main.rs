//! regtable — dumps the register model and patch rule table for the
//! x86-64 backend, for debugging rule selection without running anything.

use dbi_backend::rules::PATCH_RULES;
use dbi_core::temp::GprId;

fn main() {
    println!("general-purpose registers:");
    for id in GprId::iter_all() {
        let reserved = dbi_backend::RESERVED_REGS & (1 << id.0) != 0;
        println!(
            "  {:>3}  id={:<2}  reserved={}",
            dbi_backend::regs::gpr_name(id),
            id.0,
            reserved
        );
    }

    println!("\npatch rules (evaluated in order, first match wins):");
    for rule in PATCH_RULES {
        println!("  {:<20} {} generator(s)", rule.name, rule.generators.len());
    }
}
