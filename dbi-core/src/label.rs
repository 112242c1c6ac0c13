//! Branch-target labels within a sequence, supporting forward references:
//! a conditional-branch patch can reference a label before its target
//! instruction has been patched, and the label is back-patched once the
//! target offset in the code arena is known. Mirrors the role of a JIT
//! assembler's label type (e.g. QEMU TCG's `TCGLabel`).

#[derive(Debug, Clone)]
pub struct Label {
    pub id: u32,
    pub present: bool,
    pub has_value: bool,
    pub value: usize,
    pub uses: Vec<LabelUse>,
}

#[derive(Debug, Clone, Copy)]
pub struct LabelUse {
    pub offset: usize,
    pub kind: RelocKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// x86-64 RIP-relative 32-bit displacement.
    Rel32,
    /// x86-64 RIP-relative 8-bit displacement (short jump).
    Rel8,
}

impl Label {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            present: false,
            has_value: false,
            value: 0,
            uses: Vec::new(),
        }
    }

    pub fn add_use(&mut self, offset: usize, kind: RelocKind) {
        self.uses.push(LabelUse { offset, kind });
    }

    pub fn set_value(&mut self, offset: usize) {
        self.present = true;
        self.has_value = true;
        self.value = offset;
    }

    pub fn has_pending_uses(&self) -> bool {
        !self.uses.is_empty() && !self.has_value
    }
}
