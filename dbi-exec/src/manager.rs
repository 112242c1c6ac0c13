//! C7: `ExecBlockManager` — owns the regions, their blocks, and the
//! sequence/instruction/analysis caches used to avoid re-translating an
//! address that already has a home. Grounded structurally on the
//! teacher's `TbStore` (hash-bucketed lookup over a flat block list),
//! generalized to the per-region ordering the data model's invariants
//! require (regions are kept in address order; each owns its own caches
//! rather than sharing one global table).

use std::collections::HashMap;
use std::ops::Range;

use dbi_core::loc::{InstLoc, SeqLoc};
use dbi_core::patch::Patch;
use dbi_core::Rword;

use crate::block::{ExecBlock, SeqRecord};
use crate::config::EngineConfig;
use crate::error::ExecError;

pub struct ExecRegion {
    pub covered: Range<Rword>,
    pub blocks: Vec<ExecBlock>,
    pub translated: usize,
    pub available: usize,
    pub sequence_cache: HashMap<Rword, SeqLoc>,
    pub inst_cache: HashMap<Rword, InstLoc>,
}

impl ExecRegion {
    fn new(covered: Range<Rword>, available: usize) -> Self {
        Self {
            covered,
            blocks: Vec::new(),
            translated: 0,
            available,
            sequence_cache: HashMap::new(),
            inst_cache: HashMap::new(),
        }
    }

    fn expansion_ratio(&self) -> f64 {
        if self.translated == 0 {
            return 0.0;
        }
        let guest_span = (self.covered.end - self.covered.start).max(1) as f64;
        self.translated as f64 / guest_span
    }
}

pub struct ExecBlockManager {
    config: EngineConfig,
    regions: Vec<ExecRegion>,
    next_seq_id: u16,
    next_block_id: u16,
    flush_pending: bool,
}

impl ExecBlockManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            regions: Vec::new(),
            next_seq_id: 0,
            next_block_id: 0,
            flush_pending: false,
        }
    }

    /// Find the region that covers `addr`, if any.
    pub fn find_region(&self, addr: Rword) -> Option<usize> {
        // Regions are kept sorted by `covered.start`; binary search on
        // that invariant instead of a linear scan.
        match self
            .regions
            .binary_search_by(|r| r.covered.start.cmp(&addr))
        {
            Ok(idx) => Some(idx),
            Err(idx) => {
                if idx > 0 && self.regions[idx - 1].covered.contains(&addr) {
                    Some(idx - 1)
                } else {
                    None
                }
            }
        }
    }

    /// Look up a previously-cached sequence for `addr` without
    /// translating anything.
    pub fn get_seq_loc(&self, addr: Rword) -> Option<SeqLoc> {
        let idx = self.find_region(addr)?;
        self.regions[idx].sequence_cache.get(&addr).copied()
    }

    pub fn get_inst_loc(&self, addr: Rword) -> Option<InstLoc> {
        let idx = self.find_region(addr)?;
        self.regions[idx].inst_cache.get(&addr).copied()
    }

    /// Mid-sequence entry: `addr` has no sequence-cache entry of its own
    /// but falls inside a sequence already translated as part of some
    /// other basic block (a branch landed mid-block). Splits that
    /// sequence at `addr` via `ExecBlock::split_sequence` instead of
    /// re-translating and overlapping it, and caches the result exactly
    /// like a freshly translated sequence so the next lookup at `addr`
    /// hits `get_seq_loc` directly.
    pub fn try_split_at(&mut self, addr: Rword) -> Option<SeqLoc> {
        let inst_loc = self.get_inst_loc(addr)?;
        let region_idx = self.find_region(addr)?;
        let new_seq_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);

        let region = &mut self.regions[region_idx];
        let block = region.blocks.iter_mut().find(|b| b.id == inst_loc.block_idx)?;
        let tail = block.split_sequence(inst_loc.inst_id, addr, new_seq_id)?;

        let loc = SeqLoc {
            block_idx: block.id,
            seq_id: tail.seq_id,
            bb_start: tail.bb_start,
            bb_end: tail.bb_end,
            seq_start: tail.seq_start,
            seq_end: tail.seq_end,
        };
        region.sequence_cache.insert(addr, loc);
        region.inst_cache.insert(addr, InstLoc::new(block.id, tail.seq_id));
        Some(loc)
    }

    /// Writes a freshly translated basic block's patches into some block
    /// within the region covering `bb_start`, creating the region and/or
    /// a block within it as needed. Returns the `SeqLoc` the caller
    /// should cache and use to jump into the sequence.
    pub fn write_basic_block(
        &mut self,
        bb_start: Rword,
        bb_end: Rword,
        patches: &[Patch],
    ) -> Result<SeqLoc, ExecError> {
        let region_idx = self.ensure_region(bb_start, bb_end);
        let seq_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);

        let region = &mut self.regions[region_idx];
        let block_idx = Self::block_with_room(region, patches, &self.config)?;
        let block = &mut region.blocks[block_idx];

        let record = block.write_sequence(seq_id, bb_start, bb_end, patches)?;
        region.translated += record.code_size;

        let loc = SeqLoc {
            block_idx: block.id,
            seq_id: record.seq_id,
            bb_start,
            bb_end,
            seq_start: record.seq_start,
            seq_end: record.seq_end,
        };
        region.sequence_cache.insert(bb_start, loc);
        for patch in patches {
            region
                .inst_cache
                .insert(patch.metadata.address, InstLoc::new(block.id, record.seq_id));
        }
        Self::update_region_stat(region);
        Ok(loc)
    }

    fn block_with_room(
        region: &mut ExecRegion,
        patches: &[Patch],
        config: &EngineConfig,
    ) -> Result<usize, ExecError> {
        let needed: usize = patches.iter().map(Patch::total_size).sum();
        if let Some(idx) = region.blocks.iter().position(|b| b.remaining() >= needed) {
            return Ok(idx);
        }
        let id = region.blocks.len() as u16;
        let block = ExecBlock::new(id, config.block_code_size, config.block_data_size)
            .map_err(|_| ExecError::ArenaFull)?;
        region.blocks.push(block);
        Ok(region.blocks.len() - 1)
    }

    /// Find an existing region to extend, or allocate a new one —
    /// `findRegion`/`mergeRegion` from the data model's region placement
    /// algorithm. A new basic block is merged into an existing region
    /// when it is adjacent to or overlaps that region's covered range;
    /// otherwise a fresh region is created.
    fn ensure_region(&mut self, bb_start: Rword, bb_end: Rword) -> usize {
        if let Some(idx) = self.find_region(bb_start) {
            self.merge_region(idx, bb_start, bb_end);
            return idx;
        }
        // Also merge if the new block is immediately adjacent to a region
        // boundary, to avoid pathological region fragmentation one basic
        // block at a time.
        for (idx, region) in self.regions.iter().enumerate() {
            if bb_end == region.covered.start || bb_start == region.covered.end {
                let idx = idx;
                self.merge_region(idx, bb_start, bb_end);
                return idx;
            }
        }
        let region = ExecRegion::new(bb_start..bb_end, 0);
        let pos = self
            .regions
            .binary_search_by(|r| r.covered.start.cmp(&bb_start))
            .unwrap_or_else(|e| e);
        self.regions.insert(pos, region);
        self.next_block_id = self.next_block_id.wrapping_add(1);
        pos
    }

    fn merge_region(&mut self, idx: usize, bb_start: Rword, bb_end: Rword) {
        let region = &mut self.regions[idx];
        if bb_start < region.covered.start {
            region.covered.start = bb_start;
        }
        if bb_end > region.covered.end {
            region.covered.end = bb_end;
        }
    }

    fn update_region_stat(region: &mut ExecRegion) {
        let ratio = region.expansion_ratio();
        if ratio > 8.0 {
            log::warn!(
                "region {:#x}..{:#x} has a high expansion ratio ({:.1}x)",
                region.covered.start,
                region.covered.end,
                ratio
            );
        }
    }

    /// Invalidate every cached sequence/instruction for a region
    /// (following self-modifying code detection or explicit
    /// instrumentation changes), without freeing the arenas themselves —
    /// they are reused for the next translation into that region.
    pub fn clear_cache_region(&mut self, addr: Rword) {
        if let Some(idx) = self.find_region(addr) {
            let region = &mut self.regions[idx];
            region.sequence_cache.clear();
            region.inst_cache.clear();
            region.translated = 0;
        }
    }

    pub fn clear_cache_all(&mut self) {
        for region in &mut self.regions {
            region.sequence_cache.clear();
            region.inst_cache.clear();
            region.translated = 0;
        }
    }

    pub fn clear_cache_range(&mut self, range: Range<Rword>) {
        for region in &mut self.regions {
            if region.covered.start < range.end && region.covered.end > range.start {
                region.sequence_cache.retain(|addr, _| !range.contains(addr));
                region.inst_cache.retain(|addr, _| !range.contains(addr));
            }
        }
    }

    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub fn request_flush(&mut self) {
        self.flush_pending = true;
    }

    /// Commits a pending flush: entirely drops every region. Only valid
    /// to call when no sequence is currently executing (the single-
    /// threaded, cooperative concurrency model guarantees this holds
    /// whenever `run` is not on the call stack).
    pub fn flush_commit(&mut self) {
        self.regions.clear();
        self.flush_pending = false;
    }

    pub fn region_for(&self, addr: Rword) -> Option<&ExecRegion> {
        self.find_region(addr).map(|idx| &self.regions[idx])
    }

    pub fn block(&self, region_idx: usize, block_id: u16) -> Option<&ExecBlock> {
        self.regions
            .get(region_idx)?
            .blocks
            .iter()
            .find(|b| b.id == block_id)
    }

    pub fn block_mut(&mut self, region_idx: usize, block_id: u16) -> Option<&mut ExecBlock> {
        self.regions
            .get_mut(region_idx)?
            .blocks
            .iter_mut()
            .find(|b| b.id == block_id)
    }

    pub fn seq_record(&self, loc: SeqLoc) -> Option<SeqRecord> {
        for region in &self.regions {
            if let Some(block) = region.blocks.iter().find(|b| b.id == loc.block_idx) {
                if let Some(rec) = block.select_seq(loc.seq_id) {
                    return Some(rec);
                }
            }
        }
        None
    }

    pub fn total_translated_size(&self) -> usize {
        self.regions.iter().map(|r| r.translated).sum()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_region_is_created_for_disjoint_block() {
        let mut mgr = ExecBlockManager::new(EngineConfig::default());
        let r1 = mgr.ensure_region(0x1000, 0x1010);
        let r2 = mgr.ensure_region(0x9000, 0x9010);
        assert_ne!(r1, r2);
        assert_eq!(mgr.region_count(), 2);
    }

    #[test]
    fn overlapping_block_merges_into_existing_region() {
        let mut mgr = ExecBlockManager::new(EngineConfig::default());
        mgr.ensure_region(0x1000, 0x1010);
        let idx = mgr.ensure_region(0x1005, 0x1020);
        assert_eq!(mgr.region_count(), 1);
        assert_eq!(mgr.regions[idx].covered, 0x1000..0x1020);
    }

    #[test]
    fn adjacent_block_merges_rather_than_fragmenting() {
        let mut mgr = ExecBlockManager::new(EngineConfig::default());
        mgr.ensure_region(0x1000, 0x1010);
        mgr.ensure_region(0x1010, 0x1020);
        assert_eq!(mgr.region_count(), 1);
    }

    #[test]
    fn regions_stay_sorted_by_start() {
        let mut mgr = ExecBlockManager::new(EngineConfig::default());
        mgr.ensure_region(0x5000, 0x5010);
        mgr.ensure_region(0x1000, 0x1010);
        mgr.ensure_region(0x9000, 0x9010);
        let starts: Vec<_> = mgr.regions.iter().map(|r| r.covered.start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn clear_cache_all_resets_translated_counters() {
        let mut mgr = ExecBlockManager::new(EngineConfig::default());
        let idx = mgr.ensure_region(0x1000, 0x1010);
        mgr.regions[idx].translated = 128;
        mgr.clear_cache_all();
        assert_eq!(mgr.regions[idx].translated, 0);
    }

    #[test]
    fn flush_commit_drops_all_regions() {
        let mut mgr = ExecBlockManager::new(EngineConfig::default());
        mgr.ensure_region(0x1000, 0x1010);
        mgr.request_flush();
        assert!(mgr.is_flush_pending());
        mgr.flush_commit();
        assert_eq!(mgr.region_count(), 0);
        assert!(!mgr.is_flush_pending());
    }
}
