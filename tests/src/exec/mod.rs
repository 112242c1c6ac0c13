use dbi_exec::config::EngineConfig;
use dbi_exec::vm::{CodeReader, Vm};

struct BufReader(Vec<u8>, u64);

impl CodeReader for BufReader {
    fn read_code<'a>(&'a self, addr: u64, max_len: usize) -> &'a [u8] {
        let start = (addr - self.1) as usize;
        let end = (start + max_len).min(self.0.len());
        &self.0[start..end]
    }
}

fn vm_over(code: Vec<u8>, base: u64) -> Vm<BufReader> {
    Vm::new(BufReader(code, base), EngineConfig::default()).unwrap()
}

/// Scenario: a straight-line three-instruction sequence (no branches)
/// translates into exactly one sequence covering all three instructions.
#[test]
fn straight_line_three_instructions_become_one_sequence() {
    // mov eax, 1 ; mov ebx, 2 ; ret
    let code = vec![
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xbb, 0x02, 0x00, 0x00, 0x00, // mov ebx, 2
        0xc3, // ret
    ];
    let mut vm = vm_over(code, 0x1000);
    let loc = vm.translate(0x1000).unwrap();
    assert_eq!(loc.bb_start, 0x1000);
    assert_eq!(loc.bb_end, 0x100b);
    assert_eq!(vm.manager.region_count(), 1);
}

/// Scenario: translating the same address twice returns the cached
/// sequence rather than re-patching (idempotence of `translate`).
#[test]
fn repeated_translate_is_idempotent() {
    let code = vec![0x90, 0xc3]; // nop ; ret
    let mut vm = vm_over(code, 0x2000);
    let first = vm.translate(0x2000).unwrap();
    let second = vm.translate(0x2000).unwrap();
    assert_eq!(first.block_idx, second.block_idx);
    assert_eq!(first.seq_id, second.seq_id);
}

/// Scenario: a conditional branch ends the basic block at the branch
/// instruction rather than continuing past it.
#[test]
fn conditional_branch_terminates_the_block() {
    // cmp eax, 0 ; je +2 ; mov ecx, 3 (this last one must NOT be in the block)
    let code = vec![
        0x83, 0xf8, 0x00, // cmp eax, 0
        0x74, 0x02, // je +2
        0xb9, 0x03, 0x00, 0x00, 0x00, // mov ecx, 3
    ];
    let mut vm = vm_over(code, 0x3000);
    let loc = vm.translate(0x3000).unwrap();
    assert_eq!(loc.bb_end, 0x3005); // ends right after the `je`
}

/// Scenario: two adjacent basic blocks land in the same region (region
/// merge on adjacency) rather than fragmenting into separate regions.
#[test]
fn adjacent_basic_blocks_merge_into_one_region() {
    let code = vec![
        0xc3, // ret (block 1, 1 byte)
        0xc3, // ret (block 2, 1 byte, starts right after block 1)
    ];
    let mut vm = vm_over(code, 0x4000);
    vm.translate(0x4000).unwrap();
    vm.translate(0x4001).unwrap();
    assert_eq!(vm.manager.region_count(), 1);
}

/// Scenario: an instruction cache entry exists for every instruction
/// inside a translated block, addressable independently of the block's
/// start address (needed for mid-sequence entry / `splitSequence`).
#[test]
fn every_instruction_in_a_block_gets_an_inst_loc() {
    let code = vec![
        0x90, // nop
        0x90, // nop
        0xc3, // ret
    ];
    let mut vm = vm_over(code, 0x5000);
    vm.translate(0x5000).unwrap();
    assert!(vm.manager.get_inst_loc(0x5000).is_some());
    assert!(vm.manager.get_inst_loc(0x5001).is_some());
    assert!(vm.manager.get_inst_loc(0x5002).is_some());
}

/// Scenario: `clear_cache_region` drops cached sequences for a region
/// without requiring a full flush of every other region (self-modifying
/// code / explicit instrumentation-range changes at one address should
/// not invalidate unrelated translations elsewhere in the process).
#[test]
fn clearing_one_region_does_not_affect_another() {
    let code_a = vec![0xc3];
    let code_b = vec![0xc3];
    let mut vm_a = vm_over(code_a, 0x1000);
    vm_a.translate(0x1000).unwrap();
    vm_a.manager.clear_cache_region(0x1000);
    assert!(vm_a.manager.get_seq_loc(0x1000).is_none());

    let mut vm_b = vm_over(code_b, 0x9000);
    vm_b.translate(0x9000).unwrap();
    assert!(vm_b.manager.get_seq_loc(0x9000).is_some());
}

#[test]
fn broker_refuses_transfer_into_instrumented_code() {
    let code = vec![0xc3];
    let mut vm = vm_over(code, 0x1000);
    vm.broker.add_instrumented_range(0x1000..0x2000);
    assert!(!vm.broker.can_transfer_execution(0x1500));
}

#[test]
fn region_merge_keeps_manager_region_count_bounded_for_many_small_blocks() {
    // 64 back-to-back one-byte `ret` blocks should all coalesce into a
    // single region rather than one region per block.
    let code = vec![0xc3u8; 64];
    let mut vm = vm_over(code, 0x6000);
    for i in 0..64u64 {
        vm.translate(0x6000 + i).unwrap();
    }
    assert_eq!(vm.manager.region_count(), 1);
}
