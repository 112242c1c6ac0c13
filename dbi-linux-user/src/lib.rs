pub mod mmap_mem;
pub mod procmap;

use std::ops::Range;

use dbi_exec::vm::CodeReader;

/// Reads code directly out of this process's own address space — valid
/// because a DBI engine instruments code already mapped into the same
/// process it runs in, unlike a cross-architecture emulator reading a
/// separate guest image.
pub struct SelfMemoryReader;

impl CodeReader for SelfMemoryReader {
    fn read_code<'a>(&'a self, addr: u64, max_len: usize) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(addr as *const u8, max_len) }
    }
}

/// Counts instructions executed, for the `dbi-trace` demo binary and for
/// integration tests that want a cheap observable side effect.
pub fn instruction_counter_callback(_ctx: &mut dbi_core::Context, _addr: u64) {
    COUNT.with(|c| c.set(c.get() + 1));
}

thread_local! {
    static COUNT: std::cell::Cell<u64> = std::cell::Cell::new(0);
}

pub fn instruction_count() -> u64 {
    COUNT.with(|c| c.get())
}

pub fn exec_ranges_from_self_maps() -> std::io::Result<Vec<Range<u64>>> {
    let maps = procmap::read_self_maps()?;
    Ok(maps
        .into_iter()
        .filter(|m| m.executable)
        .map(|m| m.range)
        .collect())
}
