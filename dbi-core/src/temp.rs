//! Scratch-register allocation for a single patch (C5: TempManager).
//!
//! Unlike a compiler's temp allocator, there is no virtual-register
//! renaming happening here: a `Temp` is always backed by a real guest GPR
//! id, chosen to be disjoint from whatever the instruction being patched
//! already reads, writes, or implicitly touches. The generator that wants
//! a scratch register gets one of these; `PatchRule::generate` is
//! responsible for wrapping the whole patch in `SaveReg`/`LoadReg` pairs
//! for every id a `TempManager` actually handed out, so guest-visible
//! state is never corrupted by borrowing one of its registers.

use crate::error::Error;

/// A guest general-purpose register id, x86-64 ModR/M numbering (0=RAX..15=R15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GprId(pub u8);

impl GprId {
    pub const COUNT: u8 = 16;

    pub fn iter_all() -> impl Iterator<Item = GprId> {
        (0..Self::COUNT).map(GprId)
    }
}

/// A scratch register handed out by a `TempManager`. Cheap to copy;
/// `Generator`s reference it by value and the final `Patch::generate`
/// resolves it to a `GprId` when done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temp {
    pub reg: GprId,
}

/// Allocates scratch GPRs for a single instruction's patch, scanning from
/// a fixed "first free register" convention and skipping anything the
/// instruction reads, writes, or uses implicitly (stack pointer, flags
/// producers/consumers that alias a GPR, etc.) — mirrors the
/// required/forbidden/preferred register-set model of a JIT register
/// allocator's per-op allocation step, simplified because every `Temp`
/// here wants exactly one GPR and never shares it with another live value.
pub struct TempManager {
    used_by_inst: u32,
    handed_out: Vec<GprId>,
    first_free: u8,
}

impl TempManager {
    /// `used_by_inst` is the bitset of GPR ids the instruction being
    /// patched already reads/writes/uses implicitly (C2's `used_gpr`).
    pub fn new(used_by_inst: u32, reserved: u32) -> Self {
        Self {
            used_by_inst: used_by_inst | reserved,
            handed_out: Vec::new(),
            first_free: 0,
        }
    }

    /// Allocate a scratch register not already used by the instruction and
    /// not already handed out by this manager for the same patch.
    pub fn get_temp(&mut self) -> Result<Temp, Error> {
        for id in self.first_free..GprId::COUNT {
            let bit = 1u32 << id;
            if self.used_by_inst & bit != 0 {
                continue;
            }
            if self.handed_out.iter().any(|g| g.0 == id) {
                continue;
            }
            let reg = GprId(id);
            self.handed_out.push(reg);
            self.first_free = id + 1;
            return Ok(Temp { reg });
        }
        Err(Error::NoFreeRegister)
    }

    /// All registers this manager handed out over its lifetime — the set
    /// `PatchRule::generate` must wrap in `SaveReg`/`LoadReg`.
    pub fn used_registers(&self) -> &[GprId] {
        &self.handed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_used_registers() {
        // RAX (0) and RCX (1) are used by the instruction.
        let mut mgr = TempManager::new(0b11, 0);
        let t = mgr.get_temp().unwrap();
        assert_eq!(t.reg, GprId(2));
    }

    #[test]
    fn does_not_reuse_handed_out_temp() {
        let mut mgr = TempManager::new(0, 0);
        let a = mgr.get_temp().unwrap();
        let b = mgr.get_temp().unwrap();
        assert_ne!(a.reg, b.reg);
    }

    #[test]
    fn exhaustion_reports_error() {
        let mut mgr = TempManager::new(0, 0);
        for _ in 0..16 {
            mgr.get_temp().unwrap();
        }
        assert!(matches!(mgr.get_temp(), Err(Error::NoFreeRegister)));
    }

    #[test]
    fn reserved_registers_are_never_handed_out() {
        // Reserve RSP (4) and RBP (5) as the backend does.
        let reserved = (1 << 4) | (1 << 5);
        let mut mgr = TempManager::new(0, reserved);
        for _ in 0..14 {
            let t = mgr.get_temp().unwrap();
            assert_ne!(t.reg.0, 4);
            assert_ne!(t.reg.0, 5);
        }
    }
}
