//! Implementation-defined constants the distilled spec leaves as Open
//! Questions, turned into a configuration struct constructed once by the
//! VM façade instead of hardcoded — see `DESIGN.md` for the rationale
//! behind each default.

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Default size of a single `ExecBlock`'s code arena, in bytes.
    pub block_code_size: usize,
    /// Default size of a single `ExecBlock`'s data arena, in bytes.
    pub block_data_size: usize,
    /// Number of stack slots `ExecBroker::transfer_execution` scans
    /// looking for the return address to hook, before giving up.
    pub stack_scan_window: usize,
    /// Expansion ratio above which `ExecBlockManager::find_region` grows
    /// a region instead of allocating a fresh one.
    pub region_growth_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_code_size: 1 << 20,
            block_data_size: 1 << 16,
            stack_scan_window: 32,
            region_growth_threshold: 0.75,
        }
    }
}
