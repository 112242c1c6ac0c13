//! C8: `ExecBroker` — tracks which address ranges are instrumented and
//! handles transfers of control into and back out of native
//! (uninstrumented) code, using a stack-scan heuristic to hook the return
//! address so execution re-enters instrumented code afterward. Grounded
//! directly on the original design's `ExecBroker` (range set +
//! dedicated transfer block + page size), generalized from its
//! architecture-specific `getReturnPoint` into an x86-64 implementation.

use std::ops::Range;

use dbi_core::context::{
    field_offset, offset_of_fpr, offset_of_shadow_sp, offset_of_shadow_stack0,
    offset_of_transfer_target,
};
use dbi_core::generator::ContextField::Gpr;
use dbi_core::Context;

use crate::block::{ExecBlock, Selector};
use crate::config::EngineConfig;
use crate::error::ExecError;
use crate::x86;

/// Synthetic "guest addresses" tagging the transfer block's two fixed
/// sequences; never real guest addresses, just `write_raw_sequence` keys.
const LAUNCH_SEQ: u16 = 0;
const RESUME_SEQ: u16 = 1;
const LAUNCH_TAG: u64 = 0;
const RESUME_TAG: u64 = 1;

pub struct ExecBroker {
    instrumented: Vec<Range<u64>>,
    transfer_block: ExecBlock,
    page_size: usize,
    stack_scan_window: usize,
}

impl ExecBroker {
    pub fn new(config: &EngineConfig) -> std::io::Result<Self> {
        let mut transfer_block = ExecBlock::new(u16::MAX, 4096, 4096)?;
        transfer_block
            .write_raw_sequence(LAUNCH_SEQ, LAUNCH_TAG, &launch_stub_bytes())
            .expect("transfer block is sized for its two fixed stubs");
        transfer_block
            .write_raw_sequence(RESUME_SEQ, RESUME_TAG, &resume_stub_bytes())
            .expect("transfer block is sized for its two fixed stubs");
        Ok(Self {
            instrumented: Vec::new(),
            transfer_block,
            page_size: unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize },
            stack_scan_window: config.stack_scan_window,
        })
    }

    pub fn is_instrumented(&self, addr: u64) -> bool {
        self.instrumented
            .binary_search_by(|r| {
                if addr < r.start {
                    std::cmp::Ordering::Greater
                } else if addr >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn add_instrumented_range(&mut self, range: Range<u64>) {
        let pos = self
            .instrumented
            .binary_search_by(|r| r.start.cmp(&range.start))
            .unwrap_or_else(|e| e);
        self.instrumented.insert(pos, range);
        self.coalesce();
    }

    pub fn add_instrumented_module(&mut self, ranges: &[Range<u64>]) {
        for r in ranges {
            self.add_instrumented_range(r.clone());
        }
    }

    /// Adds every executable range of the module containing `addr`, as
    /// reported by the process map collaborator. `map` is the sorted
    /// list of (range, executable) pairs `dbi-linux-user::procmap`
    /// produces; kept generic over the caller's representation rather
    /// than depending on that crate here (would be a dependency cycle:
    /// `dbi-linux-user` depends on `dbi-exec`, not the reverse).
    pub fn add_instrumented_module_from_addr(
        &mut self,
        addr: u64,
        map: &[(Range<u64>, bool)],
    ) -> bool {
        let Some((module_range, _)) = map.iter().find(|(r, exec)| *exec && r.contains(&addr))
        else {
            return false;
        };
        self.add_instrumented_range(module_range.clone());
        true
    }

    pub fn remove_instrumented_range(&mut self, range: Range<u64>) {
        let mut result = Vec::new();
        for r in self.instrumented.drain(..) {
            if r.end <= range.start || r.start >= range.end {
                result.push(r);
                continue;
            }
            if r.start < range.start {
                result.push(r.start..range.start);
            }
            if r.end > range.end {
                result.push(range.end..r.end);
            }
        }
        self.instrumented = result;
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.instrumented.clear();
    }

    fn coalesce(&mut self) {
        if self.instrumented.is_empty() {
            return;
        }
        let mut merged: Vec<Range<u64>> = Vec::with_capacity(self.instrumented.len());
        for r in self.instrumented.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        self.instrumented = merged;
    }

    /// Pre-check mirroring the original design's `canTransferExecution`:
    /// a transfer is only meaningful when the target is *not* already
    /// instrumented (there'd be nothing to transfer to — the engine
    /// would just translate and run it like anything else).
    pub fn can_transfer_execution(&self, target: u64) -> bool {
        !self.is_instrumented(target)
    }

    /// Transfers execution to native code at `target` and runs it to
    /// completion, returning the selector the resume stub left behind —
    /// ordinarily `Selector::Continue(original_return)`, the guest
    /// address instrumented execution should pick back up at.
    ///
    /// Scans the guest stack (via `ctx.gpr.get(GPRState::RSP)`) for a
    /// return address that falls inside instrumented code within
    /// `stack_scan_window` slots; if found, that slot is overwritten with
    /// the address of this broker's resume stub so control re-enters
    /// instrumented code when the native callee eventually returns. If no
    /// such slot is found within the window, the transfer is refused
    /// rather than silently losing track of the guest — matching
    /// `TransferRefused` in the error design.
    ///
    /// The actual hand-off happens by calling the launch stub exactly
    /// like any other sequence (`ExecBlock::execute`): it restores GPRs
    /// and the FPR state from `ctx` and tail-jumps to `target`, so this
    /// call does not return until `target`'s call tree eventually `ret`s
    /// through the hooked stack slot into the resume stub, which saves
    /// the native call's results back into `ctx` and returns to here —
    /// relying on RBP surviving as the `Context*` across that whole
    /// native call tree, since it is callee-saved under the ABI and the
    /// launch stub never hands the real caller's RBP back to native code.
    ///
    /// # Safety
    /// `ctx` must point to a valid, fully-populated `Context`; this
    /// function reads the guest stack through raw pointers derived from
    /// `ctx.gpr`, and passes `ctx` into JIT'd code that dereferences it
    /// through RBP-relative addressing with no bounds checking.
    pub unsafe fn transfer_execution(
        &mut self,
        target: u64,
        ctx: *mut Context,
    ) -> Result<Selector, ExecError> {
        if !self.can_transfer_execution(target) {
            return Err(ExecError::TransferRefused {
                addr: target,
                reason: "target is already instrumented",
            });
        }

        let sp = (*ctx).gpr.get(dbi_core::context::GPRState::RSP);
        let hook_slot = self.find_return_slot(sp)?;

        let stack_ptr = hook_slot as *mut u64;
        let original_return = std::ptr::read(stack_ptr);
        if !self.is_instrumented(original_return) {
            return Err(ExecError::TransferRefused {
                addr: target,
                reason: "no instrumented return address found within scan window",
            });
        }

        (*ctx).host.shadow_stack[(*ctx).host.shadow_sp] = original_return;
        (*ctx).host.shadow_sp += 1;

        let resume_record = self
            .transfer_block
            .select_seq(RESUME_SEQ)
            .expect("resume stub written by ExecBroker::new");
        std::ptr::write(stack_ptr, self.transfer_block.entry_ptr(resume_record) as u64);

        (*ctx).host.transfer_target = target;
        let launch_record = self
            .transfer_block
            .select_seq(LAUNCH_SEQ)
            .expect("launch stub written by ExecBroker::new");
        Ok(self.transfer_block.execute(launch_record, ctx))
    }

    /// Stack-scan implementation of `getReturnPoint`: walk upward from
    /// the current stack pointer looking for a value that lands inside
    /// an instrumented range, within the configured window. x86-64's
    /// calling convention puts the return address at `[rsp]` immediately
    /// after a `call`, so the common case resolves on the first slot;
    /// the window exists for the case where `target` itself pushed
    /// additional frame data before the broker gets a chance to inspect
    /// the stack (see the Open Question on window size in `DESIGN.md`).
    fn find_return_slot(&self, sp: u64) -> Result<u64, ExecError> {
        for i in 0..self.stack_scan_window {
            let slot_addr = sp + (i as u64) * 8;
            let value = unsafe { std::ptr::read(slot_addr as *const u64) };
            if self.is_instrumented(value) {
                return Ok(slot_addr);
            }
        }
        Err(ExecError::TransferRefused {
            addr: sp,
            reason: "stack scan window exhausted",
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

/// GPR ids restored/saved by the transfer stubs, paired with the `x86`
/// register they're loaded into/stored from. RSP is never touched: it is
/// the real host stack pointer throughout, continuously live across the
/// transfer rather than shadowed in `Context` like the other GPRs. RBP is
/// restored last in the launch stub (everything before it still needs
/// `Context*` in RBP to address its own load) and never touched by the
/// resume stub at all — its `Context`-shadowed value is simply whatever
/// the launch stub last read, since guest code never observes the real
/// RBP register directly in this engine's addressing scheme. R11 is the
/// launch stub's dedicated scratch for the jump target and so is skipped
/// on restore (sacrificed as a reserved register during the transfer) but
/// is saved back to `Context` by the resume stub like any other GPR.
const LAUNCH_RESTORE_GPRS: &[(u8, u8)] = &[
    (x86::RAX, 0),
    (x86::RCX, 1),
    (x86::RDX, 2),
    (x86::RBX, 3),
    (x86::RSI, 6),
    (x86::RDI, 7),
    (x86::R8, 8),
    (x86::R9, 9),
    (x86::R10, 10),
    (x86::R12, 12),
    (x86::R13, 13),
    (x86::R14, 14),
    (x86::R15, 15),
];

const RESUME_SAVE_GPRS: &[(u8, u8)] = &[
    (x86::RAX, 0),
    (x86::RCX, 1),
    (x86::RDX, 2),
    (x86::RBX, 3),
    (x86::RSI, 6),
    (x86::RDI, 7),
    (x86::R8, 8),
    (x86::R9, 9),
    (x86::R10, 10),
    (x86::R11, 11),
    (x86::R12, 12),
    (x86::R13, 13),
    (x86::R14, 14),
    (x86::R15, 15),
];

/// Restores GPRs and FPR state from `ctx`, then tail-jumps to
/// `ctx.host.transfer_target`. Entered exactly like any other sequence
/// (`extern "C" fn(*mut Context) -> u64`), so it opens with the same
/// prologue every sequence does.
fn launch_stub_bytes() -> Vec<u8> {
    let mut out = x86::push_rbp();
    out.extend(x86::mov_rbp_rdi());
    out.extend(x86::load_rbp_offset(x86::R11, offset_of_transfer_target()));
    out.extend(x86::fxrstor_rbp(offset_of_fpr()));
    for &(reg, id) in LAUNCH_RESTORE_GPRS {
        out.extend(x86::load_rbp_offset(reg, field_offset(Gpr(id))));
    }
    // RBP last: every load above still needs it as the Context* base.
    out.extend(x86::load_rbp_offset(x86::RBP, field_offset(Gpr(5))));
    out.extend(x86::jmp_reg(x86::R11));
    out
}

/// Saves GPRs and FPR state back into `ctx`, consumes the one pending
/// shadow-stack slot, and returns — via the same `push rbp` the launch
/// stub left on the host stack, which this `pop rbp; ret` unwinds —
/// straight back to whichever Rust frame called
/// `ExecBlock::execute(launch_record, ctx)`, with `rax` set to the guest
/// address execution should resume at so `decode_selector` reports
/// `Selector::Continue`.
fn resume_stub_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    for &(reg, id) in RESUME_SAVE_GPRS {
        out.extend(x86::store_rbp_offset(reg, field_offset(Gpr(id))));
    }
    out.extend(x86::fxsave_rbp(offset_of_fpr()));
    out.extend(x86::load_rbp_offset(x86::RAX, offset_of_shadow_stack0()));
    out.extend(x86::store_rbp_offset_zero(offset_of_shadow_sp()));
    out.extend(x86::pop_rbp());
    out.extend(x86::ret());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> ExecBroker {
        ExecBroker::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn fresh_broker_has_nothing_instrumented() {
        let b = broker();
        assert!(!b.is_instrumented(0x1000));
    }

    #[test]
    fn added_range_is_instrumented() {
        let mut b = broker();
        b.add_instrumented_range(0x1000..0x2000);
        assert!(b.is_instrumented(0x1500));
        assert!(!b.is_instrumented(0x2000));
    }

    #[test]
    fn adjacent_ranges_coalesce() {
        let mut b = broker();
        b.add_instrumented_range(0x1000..0x2000);
        b.add_instrumented_range(0x2000..0x3000);
        assert!(b.is_instrumented(0x1fff));
        assert!(b.is_instrumented(0x2001));
    }

    #[test]
    fn removing_a_range_splits_around_the_hole() {
        let mut b = broker();
        b.add_instrumented_range(0x1000..0x3000);
        b.remove_instrumented_range(0x1800..0x2000);
        assert!(b.is_instrumented(0x1000));
        assert!(!b.is_instrumented(0x1900));
        assert!(b.is_instrumented(0x2500));
    }

    #[test]
    fn cannot_transfer_into_already_instrumented_code() {
        let mut b = broker();
        b.add_instrumented_range(0x1000..0x2000);
        assert!(!b.can_transfer_execution(0x1500));
        assert!(b.can_transfer_execution(0x9000));
    }

    #[test]
    fn launch_stub_opens_with_prologue_and_ends_with_jmp_r11() {
        let bytes = launch_stub_bytes();
        assert_eq!(&bytes[..1], &[0x55]); // push rbp
        assert_eq!(&bytes[bytes.len() - 3..], &[0x41, 0xff, 0xe3]); // jmp r11
    }

    #[test]
    fn resume_stub_ends_with_epilogue() {
        let bytes = resume_stub_bytes();
        assert_eq!(&bytes[bytes.len() - 2..], &[0x5d, 0xc3]); // pop rbp; ret
    }

    #[test]
    fn remove_all_clears_every_range() {
        let mut b = broker();
        b.add_instrumented_range(0x1000..0x2000);
        b.add_instrumented_range(0x5000..0x6000);
        b.remove_all_instrumented_ranges();
        assert!(!b.is_instrumented(0x1500));
        assert!(!b.is_instrumented(0x5500));
    }
}
