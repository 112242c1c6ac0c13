//! The engine-level `translate`/`run` driver (§6 external interfaces),
//! tying together decode (`dbi-asm`), patch generation (`dbi-backend`),
//! and the code cache/broker (this crate). Grounded on the teacher's
//! `cpu_exec_loop`/`tb_find`/`tb_gen_code` trio in `exec/src/exec_loop.rs`:
//! look up a cached sequence first, translate on a miss, then transfer
//! control and loop on whatever selector the sequence leaves behind.

use dbi_core::{Context, InstMetadata, Patch, Rword};

use crate::block::Selector;
use crate::broker::ExecBroker;
use crate::callbacks::{CallbackPosition, CallbackRegistry};
use crate::config::EngineConfig;
use crate::error::ExecError;
use crate::manager::ExecBlockManager;

/// A provider of raw bytes at a guest address — the "external memory
/// manager" collaborator from the interface design. `dbi-linux-user`
/// implements this over `/proc/self/mem`-style reads of the process's
/// own address space for self-instrumentation; tests implement it over a
/// plain `Vec<u8>`.
pub trait CodeReader {
    fn read_code<'a>(&'a self, addr: u64, max_len: usize) -> &'a [u8];
}

pub struct Vm<R: CodeReader> {
    pub manager: ExecBlockManager,
    pub broker: ExecBroker,
    pub callbacks: CallbackRegistry,
    pub ctx: Context,
    reader: R,
}

impl<R: CodeReader> Vm<R> {
    pub fn new(reader: R, config: EngineConfig) -> std::io::Result<Self> {
        Ok(Self {
            manager: ExecBlockManager::new(config),
            broker: ExecBroker::new(&config)?,
            callbacks: CallbackRegistry::new(),
            ctx: Context::new(),
            reader,
        })
    }

    /// Decodes and patches the basic block starting at `addr`, ending at
    /// the first control-flow-terminating instruction (or
    /// `max_instruction_len`-bounded decode failure), and writes the
    /// resulting sequence into the code cache.
    pub fn translate(&mut self, addr: Rword) -> Result<dbi_core::SeqLoc, ExecError> {
        if let Some(loc) = self.manager.get_seq_loc(addr) {
            return Ok(loc);
        }
        if let Some(loc) = self.manager.try_split_at(addr) {
            return Ok(loc);
        }

        let mut metas: Vec<InstMetadata> = Vec::new();
        let mut cursor = addr;
        loop {
            let window = self.reader.read_code(cursor, dbi_asm::MAX_INSTRUCTION_LEN);
            let meta = dbi_asm::decode_one(window, cursor)
                .map_err(|_| ExecError::DecodeFailure { addr: cursor })?;
            let is_terminator = is_block_terminator(&meta.inst);
            cursor = meta.end_address();
            let terminate = is_terminator;
            metas.push(meta);
            if terminate {
                break;
            }
        }

        let bb_end = cursor;
        let patches: Vec<Patch> = metas
            .into_iter()
            .map(dbi_backend::generate_patch)
            .collect();

        self.manager.write_basic_block(addr, bb_end, &patches)
    }

    /// Runs instrumented code starting at `start` until `stop` is
    /// reached, a broker transfer exits instrumented code entirely, or a
    /// translation error occurs.
    pub fn run(&mut self, start: Rword, stop: Rword) -> Result<(), ExecError> {
        self.ctx.gpr.pc = start;
        loop {
            let pc = self.ctx.gpr.pc;
            if pc == stop {
                return Ok(());
            }

            let loc = self.translate(pc)?;
            let region_idx = self
                .manager
                .find_region(pc)
                .expect("just translated this address into some region");
            let record = self
                .manager
                .seq_record(loc)
                .expect("write_basic_block always returns a resolvable SeqLoc");
            let block = self
                .manager
                .block(region_idx, loc.block_idx)
                .expect("SeqLoc block id always refers to a live block in its region");

            self.callbacks.fire(CallbackPosition::Pre, &mut self.ctx, pc);

            let selector = unsafe { block.execute(record, &mut self.ctx as *mut Context) };

            self.callbacks.fire(CallbackPosition::Post, &mut self.ctx, pc);

            match selector {
                Selector::Continue(next_pc) => {
                    self.ctx.gpr.pc = next_pc;
                }
                Selector::Stop => {
                    return Ok(());
                }
                Selector::Exit(target) => {
                    if !self.broker.can_transfer_execution(target) {
                        return Ok(());
                    }
                    let resumed = unsafe {
                        self.broker
                            .transfer_execution(target, &mut self.ctx as *mut Context)?
                    };
                    match resumed {
                        Selector::Continue(next_pc) => {
                            self.ctx.gpr.pc = next_pc;
                        }
                        // A stop or a further nested exit straight out of
                        // the resume stub isn't something the transfer
                        // itself produces; treat either as "nothing left
                        // to resume" rather than looping forever.
                        Selector::Stop | Selector::Exit(_) => return Ok(()),
                    }
                }
            }
        }
    }
}

fn is_block_terminator(inst: &iced_x86::Instruction) -> bool {
    use iced_x86::FlowControl::*;
    !matches!(inst.flow_control(), Next | Call)
}
