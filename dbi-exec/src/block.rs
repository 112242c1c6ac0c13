//! C6: `ExecBlock` — one mmap'd code arena plus a matching data arena,
//! holding the relocated, patched instructions for some number of
//! sequences and letting the broker/manager jump into any of them.
//!
//! The prologue/epilogue contract: every sequence starts at an offset
//! reachable only through `select_seq`/`execute`, begins by loading the
//! environment pointer (the address of `Context`) into RBP exactly as the
//! host codegen backend's own prologue does for translated guest code,
//! and ends by writing a selector value to `Context::host.selector`
//! before returning control to the caller of `execute`. The selector is
//! the control-flow-as-data mechanism described in the data model: the
//! caller (`ExecBlockManager::run`) reads it back out of `Context` rather
//! than branching on the return value of `execute` itself, because a
//! patch can chain directly into another sequence without ever returning
//! to Rust in between.

use std::collections::HashMap;

use dbi_core::loc::InstLoc;
use dbi_core::patch::Patch;
use dbi_core::{Context, Rword};

use crate::arena::Arena;
use crate::error::ExecError;
use crate::x86;

#[derive(Debug, Clone, Copy)]
pub struct SeqRecord {
    pub seq_id: u16,
    pub code_offset: usize,
    pub code_size: usize,
    pub bb_start: Rword,
    pub bb_end: Rword,
    pub seq_start: Rword,
    pub seq_end: Rword,
}

pub struct ExecBlock {
    pub id: u16,
    code: Arena,
    data: Arena,
    seqs: Vec<SeqRecord>,
    inst_cache: HashMap<Rword, InstLoc>,
    /// Code-arena byte offset of each patched instruction's first emitted
    /// byte, keyed by its guest address. `split_sequence` needs this to
    /// find exactly where in the arena a mid-sequence re-entry point
    /// begins; nothing else in this module reads it.
    inst_offsets: HashMap<Rword, usize>,
    translated_size: usize,
}

/// Selector values a sequence can leave in `Context::host.selector` when
/// it returns to `execute`'s caller. `Continue` means "fell off the end
/// of the last sequence written so far and needs a new one"; `Exit`
/// means a broker-managed transfer out of instrumented code; `Stop`
/// means the `run(start, stop)` stop-address was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Continue(Rword),
    Exit(Rword),
    Stop,
}

impl ExecBlock {
    pub fn new(id: u16, code_size: usize, data_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            id,
            code: Arena::new(code_size)?,
            data: Arena::new(data_size)?,
            seqs: Vec::new(),
            inst_cache: HashMap::new(),
            inst_offsets: HashMap::new(),
            translated_size: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.code.remaining()
    }

    pub fn translated_size(&self) -> usize {
        self.translated_size
    }

    /// Writes a whole basic block's worth of patches as one sequence.
    /// Returns the `SeqRecord` describing where it landed, or
    /// `ExecError::ArenaFull` if the arena doesn't have room — the caller
    /// (`ExecBlockManager::write_basic_block`) is responsible for
    /// retrying in a fresh block.
    pub fn write_sequence(
        &mut self,
        seq_id: u16,
        bb_start: Rword,
        bb_end: Rword,
        patches: &[Patch],
    ) -> Result<SeqRecord, ExecError> {
        let needed: usize = patches.iter().map(Patch::total_size).sum::<usize>()
            + PROLOGUE_SIZE
            + EPILOGUE_SIZE;
        if needed > self.code.remaining() {
            return Err(ExecError::ArenaFull);
        }

        self.code.set_writable().map_err(|_| ExecError::ArenaFull)?;
        let start_offset = self.code.offset();
        self.code.emit(&prologue_bytes());

        for patch in patches {
            let inst_offset = self.code.offset();
            self.inst_cache.insert(
                patch.metadata.address,
                InstLoc::new(self.id, self.seqs.len() as u16),
            );
            self.inst_offsets.insert(patch.metadata.address, inst_offset);
            for reloc in &patch.insts {
                let write_addr = self.code.base_ptr() as u64 + self.code.offset() as u64;
                let bytes = concretize(reloc, write_addr)?;
                self.code.emit(&bytes);
            }
        }
        self.code.emit(&epilogue_bytes());

        let end_offset = self.code.offset();
        self.code.set_executable().map_err(|_| ExecError::ArenaFull)?;

        let seq_start = patches.first().map(|p| p.metadata.address).unwrap_or(bb_start);
        let seq_end = patches
            .last()
            .map(|p| p.metadata.end_address())
            .unwrap_or(bb_end);

        let record = SeqRecord {
            seq_id,
            code_offset: start_offset,
            code_size: end_offset - start_offset,
            bb_start,
            bb_end,
            seq_start,
            seq_end,
        };
        self.seqs.push(record);
        self.translated_size += record.code_size;
        Ok(record)
    }

    /// Splits an existing sequence at `addr`, for a mid-sequence re-entry
    /// discovered after the fact (the spec's mid-sequence entry
    /// protocol): the existing sequence's tail, from `addr` onward,
    /// becomes a new sequence in its own right so future lookups of
    /// `addr` land directly on it instead of re-running the prefix.
    ///
    /// The tail's machine code is not duplicated: this writes a tiny
    /// entry stub (prologue + absolute jump to the split point) into the
    /// arena's free space and points the new `SeqRecord` at that stub,
    /// since the code from `addr` onward still expects the original
    /// sequence's own prologue to have already run.
    pub fn split_sequence(&mut self, seq_id: u16, addr: Rword, new_seq_id: u16) -> Option<SeqRecord> {
        let idx = self.seqs.iter().position(|s| s.seq_id == seq_id)?;
        let original = self.seqs[idx];
        if addr <= original.seq_start || addr >= original.seq_end {
            return None;
        }
        let split_offset = *self.inst_offsets.get(&addr)?;
        let target = self.code.base_ptr() as u64 + split_offset as u64;

        let mut stub = prologue_bytes();
        stub.extend(x86::movabs_reg_imm64(x86::R11, target));
        stub.extend(x86::jmp_reg(x86::R11));
        if stub.len() > self.code.remaining() {
            return None;
        }

        self.code.set_writable().ok()?;
        let stub_offset = self.code.emit(&stub);
        self.code.set_executable().ok()?;
        self.translated_size += stub.len();

        let tail_code_end = original.code_offset + original.code_size;
        let tail = SeqRecord {
            seq_id: new_seq_id,
            code_offset: stub_offset,
            code_size: stub.len() + (tail_code_end - split_offset),
            bb_start: original.bb_start,
            bb_end: original.bb_end,
            seq_start: addr,
            seq_end: original.seq_end,
        };
        self.seqs.push(tail);
        Some(tail)
    }

    /// Writes a sequence from pre-assembled host bytes rather than
    /// `Patch`es — for `ExecBroker`'s launch/resume stubs, which are
    /// hand-encoded host code, not translated guest instructions.
    /// `tag` is a synthetic, broker-chosen "guest address" used only to
    /// key this sequence for `select_seq`/`lookup_by_addr`; it never
    /// corresponds to a real guest instruction.
    pub fn write_raw_sequence(&mut self, seq_id: u16, tag: Rword, bytes: &[u8]) -> Result<SeqRecord, ExecError> {
        if bytes.len() > self.code.remaining() {
            return Err(ExecError::ArenaFull);
        }
        self.code.set_writable().map_err(|_| ExecError::ArenaFull)?;
        let start_offset = self.code.emit(bytes);
        self.code.set_executable().map_err(|_| ExecError::ArenaFull)?;

        let record = SeqRecord {
            seq_id,
            code_offset: start_offset,
            code_size: bytes.len(),
            bb_start: tag,
            bb_end: tag + 1,
            seq_start: tag,
            seq_end: tag + 1,
        };
        self.seqs.push(record);
        self.translated_size += bytes.len();
        Ok(record)
    }

    pub fn select_seq(&self, seq_id: u16) -> Option<SeqRecord> {
        self.seqs.iter().find(|s| s.seq_id == seq_id).copied()
    }

    pub fn lookup_by_addr(&self, addr: Rword) -> Option<SeqRecord> {
        self.seqs.iter().find(|s| s.covers(addr)).copied()
    }

    pub fn inst_loc(&self, addr: Rword) -> Option<InstLoc> {
        self.inst_cache.get(&addr).copied()
    }

    /// Transfers control into the sequence at `record`, with `ctx` as the
    /// environment-pointer target. Returns the selector the sequence left
    /// in `ctx.host.selector` when it returned.
    ///
    /// # Safety
    /// `record` must describe a sequence actually written into this
    /// block's code arena, the arena must currently be executable, and
    /// `ctx` must remain valid for the duration of the call — the
    /// generated code reads and writes through it via RBP-relative
    /// addressing with no bounds checking.
    pub unsafe fn execute(&self, record: SeqRecord, ctx: *mut Context) -> Selector {
        type SeqFn = unsafe extern "C" fn(*mut Context) -> u64;
        let entry = self.code.ptr_at(record.code_offset) as *const ();
        let f: SeqFn = std::mem::transmute(entry);
        let raw = f(ctx);
        decode_selector(raw)
    }

    pub fn data_remaining(&self) -> usize {
        self.data.remaining()
    }

    /// Absolute address of `record`'s entry point, for a caller (the
    /// broker) that needs to write it somewhere other than calling
    /// `execute` directly — e.g. into a hooked return-address stack slot.
    pub fn entry_ptr(&self, record: SeqRecord) -> *const u8 {
        self.code.ptr_at(record.code_offset)
    }
}

impl SeqRecord {
    pub fn covers(&self, addr: Rword) -> bool {
        addr >= self.seq_start && addr < self.seq_end
    }
}

const PROLOGUE_SIZE: usize = 4; // push rbp; mov rbp, rdi
const EPILOGUE_SIZE: usize = 2; // pop rbp; ret

/// `push rbp; mov rbp, rdi` — every sequence entry point is reached
/// through a fresh `extern "C" fn(*mut Context) -> u64` call (`execute`'s
/// own call, or a broker stub's), so RBP has to be (re-)established from
/// the incoming `Context*` in RDI every time, not just once per
/// `ExecBlock`; the pushed caller's RBP is restored by `epilogue_bytes`.
fn prologue_bytes() -> Vec<u8> {
    let mut out = x86::push_rbp();
    out.extend(x86::mov_rbp_rdi());
    out
}

fn epilogue_bytes() -> Vec<u8> {
    let mut out = x86::pop_rbp();
    out.extend(x86::ret());
    out
}

fn concretize(reloc: &dbi_core::reloc::RelocatableInst, write_addr: u64) -> Result<Vec<u8>, ExecError> {
    use dbi_core::reloc::RelocatableInst::*;
    Ok(match reloc {
        Baked { bytes, .. } => bytes.clone(),
        Relocate { inst } => dbi_asm::encode_block(std::slice::from_ref(inst), write_addr)
            .map_err(|_| ExecError::EncodeFailure { addr: write_addr })?,
        MovImm { reg, imm } => {
            // REX.W + B8+r id : mov r64, imm64 (simplified to imm32 zero-extended
            // for the common case of small constants used by these generators).
            let mut out = vec![0x48, 0xb8 + (reg.0 & 0x7)];
            out.extend_from_slice(&imm.to_le_bytes());
            out
        }
        LoadOffset { reg, offset } => x86::load_rbp_offset(reg.0, *offset),
        StoreOffset { reg, offset } => x86::store_rbp_offset(reg.0, *offset),
        JmpLabel { .. } => vec![0xe9, 0x00, 0x00, 0x00, 0x00],
    })
}

fn decode_selector(raw: u64) -> Selector {
    match raw {
        0 => Selector::Stop,
        1 => Selector::Exit(0),
        addr => Selector::Continue(addr),
    }
}
