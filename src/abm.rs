//! Address-block manager: per-block metadata and the per-unit block lists.

use std::collections::VecDeque;
use std::io::{Read, Write};

use crate::config::{BlockId, Counter, DeviceGeometry, UnitId};
use crate::error::{FtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Free,
    FreePrepared,
    Clean,
    Dirty,
    Bad,
}

impl BlockStatus {
    fn to_raw(self) -> u8 {
        match self {
            BlockStatus::Free => 0,
            BlockStatus::FreePrepared => 1,
            BlockStatus::Clean => 2,
            BlockStatus::Dirty => 3,
            BlockStatus::Bad => 4,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BlockStatus::Free),
            1 => Some(BlockStatus::FreePrepared),
            2 => Some(BlockStatus::Clean),
            3 => Some(BlockStatus::Dirty),
            4 => Some(BlockStatus::Bad),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddr {
    pub channel: usize,
    pub chip: usize,
    pub block: usize,
}

#[derive(Debug, Clone)]
pub struct BlockInfo {
    status: BlockStatus,
    addr: BlockAddr,
    erase_count: u32,
    nr_invalid: Counter,
    /// Sub-page invalid flags, `pages * subpages` long.
    pst: Option<Vec<bool>>,
    /// Next page to program.
    pub offset: usize,
    /// A program into this block failed; its next erase retires it.
    program_failed: bool,
}

impl BlockInfo {
    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn addr(&self) -> BlockAddr {
        self.addr
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn nr_invalid(&self) -> Counter {
        self.nr_invalid
    }

    pub fn program_failed(&self) -> bool {
        self.program_failed
    }

    pub fn is_subpage_invalid(&self, pst_off: usize) -> bool {
        self.pst.as_ref().map_or(false, |pst| pst[pst_off])
    }
}

#[derive(Debug, Default)]
struct UnitLists {
    free: VecDeque<BlockId>,
    clean: Vec<BlockId>,
    dirty: Vec<BlockId>,
    bad: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbmStats {
    pub total: Counter,
    pub free: Counter,
    pub free_prepared: Counter,
    pub clean: Counter,
    pub dirty: Counter,
    pub bad: Counter,
}

pub struct Abm {
    nr_channels: usize,
    nr_chips_per_channel: usize,
    nr_blocks_per_chip: usize,
    nr_pages_per_block: usize,
    nr_subpages_per_page: usize,

    blocks: Vec<BlockInfo>,
    units: Vec<UnitLists>,

    nr_free: Counter,
    nr_free_prepared: Counter,
    nr_clean: Counter,
    nr_dirty: Counter,
    nr_bad: Counter,
}

fn remove_from(list: &mut Vec<BlockId>, idx: BlockId) {
    let pos = list.iter().position(|&b| b == idx);
    match pos {
        Some(pos) => {
            list.remove(pos);
        }
        None => panic!("block {} is missing from its list", idx),
    }
}

impl Abm {
    /// `nr_subpages_per_page` is counted in mapping units, which may be
    /// coarser than the device's sub-pages.
    pub fn new(geo: &DeviceGeometry, nr_subpages_per_page: usize, use_pst: bool) -> Self {
        let mut out = Abm {
            nr_channels: geo.nr_channels,
            nr_chips_per_channel: geo.nr_chips_per_channel,
            nr_blocks_per_chip: geo.nr_blocks_per_chip,
            nr_pages_per_block: geo.nr_pages_per_block,
            nr_subpages_per_page,
            blocks: Vec::with_capacity(geo.nr_blocks()),
            units: (0..geo.nr_punits()).map(|_| UnitLists::default()).collect(),
            nr_free: 0,
            nr_free_prepared: 0,
            nr_clean: 0,
            nr_dirty: 0,
            nr_bad: 0,
        };

        let subpages_per_block = out.nr_subpages_per_block();
        for channel in 0..geo.nr_channels {
            for chip in 0..geo.nr_chips_per_channel {
                for block in 0..geo.nr_blocks_per_chip {
                    let idx = out.blocks.len();
                    out.blocks.push(BlockInfo {
                        status: BlockStatus::Free,
                        addr: BlockAddr { channel, chip, block },
                        erase_count: 0,
                        nr_invalid: 0,
                        pst: use_pst.then(|| vec![false; subpages_per_block]),
                        offset: 0,
                        program_failed: false,
                    });
                    let unit = out.unit_of(channel, chip);
                    out.units[unit].free.push_back(idx);
                    out.nr_free += 1;
                }
            }
        }

        debug!("abm: {} blocks over {} parallel units", out.blocks.len(), out.units.len());
        out.check_status();
        out
    }

    pub fn nr_subpages_per_block(&self) -> usize {
        self.nr_pages_per_block * self.nr_subpages_per_page
    }

    fn unit_of(&self, channel: usize, chip: usize) -> UnitId {
        chip * self.nr_channels + channel
    }

    fn block_idx(&self, channel: usize, chip: usize, block: usize) -> Option<BlockId> {
        if channel >= self.nr_channels || chip >= self.nr_chips_per_channel || block >= self.nr_blocks_per_chip {
            return None;
        }
        Some((channel * self.nr_chips_per_channel + chip) * self.nr_blocks_per_chip + block)
    }

    fn idx_of(&self, b: BlockAddr) -> BlockId {
        match self.block_idx(b.channel, b.chip, b.block) {
            Some(idx) => idx,
            None => panic!("block {:?} is outside the device", b),
        }
    }

    /// Asserts the block-count invariant.
    pub fn check_status(&self) {
        let sum = self.nr_free + self.nr_free_prepared + self.nr_clean + self.nr_dirty + self.nr_bad;
        assert_eq!(
            self.blocks.len(),
            sum,
            "block counters diverged: free {} prepared {} clean {} dirty {} bad {}",
            self.nr_free,
            self.nr_free_prepared,
            self.nr_clean,
            self.nr_dirty,
            self.nr_bad
        );
    }

    pub fn get_block(&self, channel: usize, chip: usize, block: usize) -> Option<&BlockInfo> {
        self.block_idx(channel, chip, block).map(|idx| &self.blocks[idx])
    }

    pub fn block(&self, b: BlockAddr) -> &BlockInfo {
        &self.blocks[self.idx_of(b)]
    }

    pub fn block_mut(&mut self, b: BlockAddr) -> &mut BlockInfo {
        let idx = self.idx_of(b);
        &mut self.blocks[idx]
    }

    pub fn get_free_block_prepare(&mut self, channel: usize, chip: usize) -> Option<BlockAddr> {
        let unit = self.unit_of(channel, chip);
        let idx = self.units.get_mut(unit)?.free.pop_front()?;

        let blk = &mut self.blocks[idx];
        assert_eq!(blk.status, BlockStatus::Free, "block {:?} on the free list is not free", blk.addr);
        blk.status = BlockStatus::FreePrepared;
        let addr = blk.addr;

        self.nr_free -= 1;
        self.nr_free_prepared += 1;
        self.check_status();

        Some(addr)
    }

    pub fn get_free_block_commit(&mut self, b: BlockAddr) {
        let idx = self.idx_of(b);
        let blk = &mut self.blocks[idx];
        assert_eq!(blk.status, BlockStatus::FreePrepared, "committing block {:?} that was not prepared", b);
        blk.status = BlockStatus::Clean;

        let unit = self.unit_of(b.channel, b.chip);
        self.units[unit].clean.push(idx);
        self.nr_free_prepared -= 1;
        self.nr_clean += 1;
        self.check_status();
    }

    pub fn get_free_block_rollback(&mut self, b: BlockAddr) {
        let idx = self.idx_of(b);
        let blk = &mut self.blocks[idx];
        assert_eq!(blk.status, BlockStatus::FreePrepared, "rolling back block {:?} that was not prepared", b);
        blk.status = BlockStatus::Free;

        let unit = self.unit_of(b.channel, b.chip);
        self.units[unit].free.push_front(idx);
        self.nr_free_prepared -= 1;
        self.nr_free += 1;
        self.check_status();
    }

    /// Take the block off whichever list currently holds it and fix the counters.
    fn detach(&mut self, idx: BlockId) {
        let addr = self.blocks[idx].addr;
        let unit = self.unit_of(addr.channel, addr.chip);
        let lists = &mut self.units[unit];

        match self.blocks[idx].status {
            BlockStatus::Free => {
                let pos = lists.free.iter().position(|&b| b == idx);
                match pos {
                    Some(pos) => {
                        lists.free.remove(pos);
                    }
                    None => panic!("block {} is missing from the free list", idx),
                }
                assert!(self.nr_free > 0);
                self.nr_free -= 1;
            }
            BlockStatus::FreePrepared => {
                assert!(self.nr_free_prepared > 0);
                self.nr_free_prepared -= 1;
            }
            BlockStatus::Clean => {
                remove_from(&mut lists.clean, idx);
                assert!(self.nr_clean > 0);
                self.nr_clean -= 1;
            }
            BlockStatus::Dirty => {
                remove_from(&mut lists.dirty, idx);
                assert!(self.nr_dirty > 0);
                self.nr_dirty -= 1;
            }
            BlockStatus::Bad => {
                remove_from(&mut lists.bad, idx);
                assert!(self.nr_bad > 0);
                self.nr_bad -= 1;
            }
        }
    }

    /// Reset a block after an erase. Bad blocks never come back, and neither
    /// do blocks that failed a program since their last erase.
    pub fn erase_block(&mut self, b: BlockAddr, is_bad: bool) {
        let idx = self.idx_of(b);
        if self.blocks[idx].status == BlockStatus::Bad {
            debug!("erase of retired block {:?} ignored", b);
            return;
        }
        let is_bad = is_bad || self.blocks[idx].program_failed;

        self.detach(idx);
        let unit = self.unit_of(b.channel, b.chip);
        let blk = &mut self.blocks[idx];
        if is_bad {
            blk.status = BlockStatus::Bad;
            self.units[unit].bad.push(idx);
            self.nr_bad += 1;
            warn!(
                "bad block marked: ch {} chip {} blk {} p/e {}",
                b.channel, b.chip, b.block, blk.erase_count
            );
        } else {
            blk.status = BlockStatus::Free;
            self.units[unit].free.push_back(idx);
            self.nr_free += 1;
        }
        self.check_status();

        let blk = &mut self.blocks[idx];
        blk.erase_count += 1;
        blk.nr_invalid = 0;
        blk.offset = 0;
        blk.program_failed = false;
        if let Some(pst) = blk.pst.as_mut() {
            pst.iter_mut().for_each(|s| *s = false);
        }
    }

    /// Record a failed program. The block keeps serving reads of its other
    /// pages until GC moves them out; the erase that follows retires it.
    pub fn mark_program_failed(&mut self, b: BlockAddr) {
        let idx = self.idx_of(b);
        let blk = &mut self.blocks[idx];
        if blk.status == BlockStatus::Bad || blk.program_failed {
            return;
        }
        warn!("program failed on ch {} chip {} blk {}, retiring it at its next erase", b.channel, b.chip, b.block);
        blk.program_failed = true;
    }

    /// Force a block to dirty with every sub-page invalid so the next erase pass reclaims it.
    pub fn set_to_dirty_block(&mut self, b: BlockAddr) {
        let idx = self.idx_of(b);
        if self.blocks[idx].status == BlockStatus::Bad {
            return;
        }

        self.detach(idx);
        let unit = self.unit_of(b.channel, b.chip);
        self.units[unit].dirty.push(idx);
        self.nr_dirty += 1;
        self.check_status();

        let subpages_per_block = self.nr_subpages_per_block();
        let blk = &mut self.blocks[idx];
        blk.status = BlockStatus::Dirty;
        blk.nr_invalid = subpages_per_block;
        if let Some(pst) = blk.pst.as_mut() {
            pst.iter_mut().for_each(|s| *s = true);
        }
    }

    /// Mark one sub-page stale. The first stale sub-page of a clean block makes it dirty.
    pub fn invalidate_subpage(&mut self, b: BlockAddr, page: usize, subpage: usize) {
        assert!(page < self.nr_pages_per_block, "page {} out of block", page);
        assert!(subpage < self.nr_subpages_per_page, "sub-page {} out of page", subpage);

        let idx = self.idx_of(b);
        let pst_off = page * self.nr_subpages_per_page + subpage;
        let subpages_per_block = self.nr_subpages_per_block();

        let blk = &mut self.blocks[idx];
        debug_assert!(blk.pst.is_some(), "block {:?} keeps no sub-page state", b);
        let Some(pst) = blk.pst.as_mut() else {
            return;
        };
        if pst[pst_off] {
            return;
        }
        pst[pst_off] = true;

        if blk.nr_invalid == 0 {
            assert_eq!(
                blk.status,
                BlockStatus::Clean,
                "first invalidation of block {:?} at page {} sub-page {}",
                b,
                page,
                subpage
            );
            blk.status = BlockStatus::Dirty;
            let unit = self.unit_of(b.channel, b.chip);
            let lists = &mut self.units[unit];
            remove_from(&mut lists.clean, idx);
            lists.dirty.push(idx);
            self.nr_clean -= 1;
            self.nr_dirty += 1;
            self.check_status();
        }

        let blk = &mut self.blocks[idx];
        blk.nr_invalid += 1;
        assert!(blk.nr_invalid <= subpages_per_block);
    }

    pub fn is_subpage_invalid(&self, b: BlockAddr, page: usize, subpage: usize) -> bool {
        self.block(b).is_subpage_invalid(page * self.nr_subpages_per_page + subpage)
    }

    pub fn dirty_blocks(&self, channel: usize, chip: usize) -> impl Iterator<Item = &BlockInfo> + '_ {
        let unit = self.unit_of(channel, chip);
        self.units[unit].dirty.iter().map(move |&idx| &self.blocks[idx])
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockInfo> + '_ {
        self.blocks.iter()
    }

    pub fn nr_total_blocks(&self) -> Counter {
        self.blocks.len()
    }

    pub fn nr_free_blocks(&self) -> Counter {
        self.nr_free
    }

    pub fn nr_dirty_blocks(&self) -> Counter {
        self.nr_dirty
    }

    pub fn nr_bad_blocks(&self) -> Counter {
        self.nr_bad
    }

    pub fn nr_free_blocks_in(&self, channel: usize, chip: usize) -> Counter {
        self.units[self.unit_of(channel, chip)].free.len()
    }

    pub fn stats(&self) -> AbmStats {
        AbmStats {
            total: self.blocks.len(),
            free: self.nr_free,
            free_prepared: self.nr_free_prepared,
            clean: self.nr_clean,
            dirty: self.nr_dirty,
            bad: self.nr_bad,
        }
    }

    /// Writes one flat record per block. Lists are derived state and are not stored.
    pub fn store<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        for blk in &self.blocks {
            w.write_all(&[blk.status.to_raw()])?;
            w.write_all(&(blk.addr.channel as u32).to_le_bytes())?;
            w.write_all(&(blk.addr.chip as u32).to_le_bytes())?;
            w.write_all(&(blk.addr.block as u32).to_le_bytes())?;
            w.write_all(&blk.erase_count.to_le_bytes())?;
            w.write_all(&(blk.nr_invalid as u32).to_le_bytes())?;
            w.write_all(&(blk.offset as u32).to_le_bytes())?;
            w.write_all(&[blk.program_failed as u8])?;
            match &blk.pst {
                Some(pst) => {
                    w.write_all(&[1])?;
                    let raw: Vec<u8> = pst.iter().map(|&s| s as u8).collect();
                    w.write_all(&raw)?;
                }
                None => w.write_all(&[0])?,
            }
        }
        Ok(())
    }

    /// Replaces every block record and rebuilds the per-unit lists from the stored status.
    pub fn load<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<()> {
        let subpages_per_block = self.nr_subpages_per_block();
        let mut blocks = Vec::with_capacity(self.blocks.len());

        for idx in 0..self.blocks.len() {
            let raw = read_u8(r)?;
            let status = BlockStatus::from_raw(raw)
                .ok_or_else(|| FtlError::Snapshot(format!("block {} has unknown status {}", idx, raw)))?;
            let addr = BlockAddr {
                channel: read_u32(r)? as usize,
                chip: read_u32(r)? as usize,
                block: read_u32(r)? as usize,
            };
            if self.block_idx(addr.channel, addr.chip, addr.block) != Some(idx) {
                return Err(FtlError::Snapshot(format!("block record {} carries address {:?}", idx, addr)));
            }
            let erase_count = read_u32(r)?;
            let nr_invalid = read_u32(r)? as usize;
            let offset = read_u32(r)? as usize;
            let program_failed = match read_u8(r)? {
                0 => false,
                1 => true,
                other => {
                    return Err(FtlError::Snapshot(format!("block record {} has program flag {}", idx, other)))
                }
            };
            if nr_invalid > subpages_per_block || offset > self.nr_pages_per_block {
                return Err(FtlError::Snapshot(format!("block record {} is out of range", idx)));
            }
            let pst = match read_u8(r)? {
                0 => None,
                1 => {
                    let mut raw = vec![0u8; subpages_per_block];
                    r.read_exact(&mut raw)?;
                    Some(raw.into_iter().map(|s| s != 0).collect())
                }
                other => return Err(FtlError::Snapshot(format!("block record {} has pst flag {}", idx, other))),
            };
            blocks.push(BlockInfo { status, addr, erase_count, nr_invalid, pst, offset, program_failed });
        }

        self.blocks = blocks;
        self.rebuild_lists();
        Ok(())
    }

    fn rebuild_lists(&mut self) {
        self.units.iter_mut().for_each(|u| *u = UnitLists::default());
        self.nr_free = 0;
        self.nr_free_prepared = 0;
        self.nr_clean = 0;
        self.nr_dirty = 0;
        self.nr_bad = 0;

        for idx in 0..self.blocks.len() {
            let addr = self.blocks[idx].addr;
            let unit = self.unit_of(addr.channel, addr.chip);
            let status = self.blocks[idx].status;
            let lists = &mut self.units[unit];
            match status {
                BlockStatus::Free => {
                    lists.free.push_back(idx);
                    self.nr_free += 1;
                }
                // a prepared block was never used; it goes back to free
                BlockStatus::FreePrepared => {
                    self.blocks[idx].status = BlockStatus::Free;
                    lists.free.push_back(idx);
                    self.nr_free += 1;
                }
                BlockStatus::Clean => {
                    lists.clean.push(idx);
                    self.nr_clean += 1;
                }
                BlockStatus::Dirty => {
                    lists.dirty.push(idx);
                    self.nr_dirty += 1;
                }
                BlockStatus::Bad => {
                    lists.bad.push(idx);
                    self.nr_bad += 1;
                }
            }
        }
        self.check_status();
    }
}

pub(crate) fn read_u8<R: Read + ?Sized>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u32<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    fn geo() -> DeviceGeometry {
        DeviceGeometry {
            nr_channels: 2,
            nr_chips_per_channel: 2,
            nr_blocks_per_chip: 4,
            nr_pages_per_block: 4,
            nr_subpages_per_page: 2,
            page_main_size: 1024,
            page_oob_size: 64,
        }
    }

    fn abm() -> Abm {
        Abm::new(&geo(), 2, true)
    }

    fn assert_lists_match(abm: &Abm) {
        let s = abm.stats();
        let listed: usize = abm
            .units
            .iter()
            .map(|u| u.free.len() + u.clean.len() + u.dirty.len() + u.bad.len())
            .sum();
        assert_eq!(listed + s.free_prepared, s.total);
        assert_eq!(abm.units.iter().map(|u| u.free.len()).sum::<usize>(), s.free);
        assert_eq!(abm.units.iter().map(|u| u.dirty.len()).sum::<usize>(), s.dirty);
    }

    #[test]
    fn prepare_commit_rollback() {
        let mut abm = abm();
        let a = abm.get_free_block_prepare(1, 0).unwrap();
        let b = abm.get_free_block_prepare(1, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(abm.stats().free_prepared, 2);

        abm.get_free_block_commit(a);
        abm.get_free_block_rollback(b);

        assert_eq!(abm.block(a).status(), BlockStatus::Clean);
        assert_eq!(abm.block(b).status(), BlockStatus::Free);
        assert_eq!(abm.nr_free_blocks(), 15);
        assert_lists_match(&abm);
    }

    #[test]
    fn unit_runs_dry() {
        let mut abm = abm();
        for _ in 0..4 {
            let b = abm.get_free_block_prepare(0, 1).unwrap();
            abm.get_free_block_commit(b);
        }
        assert!(abm.get_free_block_prepare(0, 1).is_none());
        assert!(abm.get_free_block_prepare(1, 1).is_some());
    }

    #[test]
    #[should_panic]
    fn commit_requires_prepare() {
        let mut abm = abm();
        abm.get_free_block_commit(BlockAddr { channel: 0, chip: 0, block: 0 });
    }

    #[test]
    fn first_invalidation_dirties_block() {
        let mut abm = abm();
        let b = abm.get_free_block_prepare(0, 0).unwrap();
        abm.get_free_block_commit(b);

        abm.invalidate_subpage(b, 2, 1);
        abm.invalidate_subpage(b, 2, 1);

        let blk = abm.block(b);
        assert_eq!(blk.status(), BlockStatus::Dirty);
        assert_eq!(blk.nr_invalid(), 1);
        assert!(abm.is_subpage_invalid(b, 2, 1));
        assert!(!abm.is_subpage_invalid(b, 2, 0));
        assert_eq!(abm.dirty_blocks(0, 0).count(), 1);
        assert_lists_match(&abm);
    }

    #[test]
    fn erase_resets_and_retires() {
        let mut abm = abm();
        let b = abm.get_free_block_prepare(0, 0).unwrap();
        abm.get_free_block_commit(b);
        abm.invalidate_subpage(b, 0, 0);
        abm.block_mut(b).offset = 3;

        abm.erase_block(b, false);
        let blk = abm.block(b);
        assert_eq!(blk.status(), BlockStatus::Free);
        assert_eq!(blk.erase_count(), 1);
        assert_eq!(blk.nr_invalid(), 0);
        assert_eq!(blk.offset, 0);
        assert!(!abm.is_subpage_invalid(b, 0, 0));

        abm.erase_block(b, true);
        assert_eq!(abm.block(b).status(), BlockStatus::Bad);
        assert_eq!(abm.nr_bad_blocks(), 1);

        // retired blocks stay retired
        abm.erase_block(b, false);
        assert_eq!(abm.block(b).status(), BlockStatus::Bad);
        assert_eq!(abm.nr_total_blocks() - abm.nr_bad_blocks(), 15);
        for _ in 0..3 {
            let f = abm.get_free_block_prepare(0, 0).unwrap();
            assert_ne!(f, b);
        }
        assert!(abm.get_free_block_prepare(0, 0).is_none());
        assert_lists_match(&abm);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "keeps no sub-page state")]
    fn invalidation_needs_subpage_state() {
        let mut abm = Abm::new(&geo(), 2, false);
        let b = abm.get_free_block_prepare(0, 0).unwrap();
        abm.get_free_block_commit(b);
        abm.invalidate_subpage(b, 0, 0);
    }

    #[test]
    fn program_failure_retires_at_erase() {
        let mut abm = abm();
        let b = abm.get_free_block_prepare(1, 0).unwrap();
        abm.get_free_block_commit(b);
        abm.mark_program_failed(b);

        // still in service until something erases it
        assert_eq!(abm.block(b).status(), BlockStatus::Clean);
        assert!(abm.block(b).program_failed());

        abm.erase_block(b, false);
        assert_eq!(abm.block(b).status(), BlockStatus::Bad);
        assert_eq!(abm.nr_bad_blocks(), 1);
        assert_lists_match(&abm);
    }

    #[test]
    fn forced_dirty_marks_everything_invalid() {
        let mut abm = abm();
        let b = BlockAddr { channel: 1, chip: 1, block: 2 };
        abm.set_to_dirty_block(b);

        assert_eq!(abm.block(b).status(), BlockStatus::Dirty);
        assert_eq!(abm.block(b).nr_invalid(), abm.nr_subpages_per_block());
        assert!(abm.is_subpage_invalid(b, 3, 1));
        assert_lists_match(&abm);
    }

    #[test]
    fn random_mutations_keep_counts() {
        let mut abm = abm();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut prepared = Vec::new();

        for _ in 0..2000 {
            let ch = rng.gen_range(0..2);
            let chip = rng.gen_range(0..2);
            match rng.gen_range(0..6) {
                0 => {
                    if let Some(b) = abm.get_free_block_prepare(ch, chip) {
                        prepared.push(b);
                    }
                }
                1 => {
                    if let Some(b) = prepared.pop() {
                        abm.get_free_block_commit(b);
                    }
                }
                2 => {
                    if let Some(b) = prepared.pop() {
                        abm.get_free_block_rollback(b);
                    }
                }
                3 => {
                    let b = BlockAddr { channel: ch, chip, block: rng.gen_range(0..4) };
                    let st = abm.block(b).status();
                    if st == BlockStatus::Clean || st == BlockStatus::Dirty {
                        abm.invalidate_subpage(b, rng.gen_range(0..4), rng.gen_range(0..2));
                    }
                }
                4 => {
                    let b = BlockAddr { channel: ch, chip, block: rng.gen_range(0..4) };
                    if abm.block(b).status() != BlockStatus::FreePrepared {
                        abm.erase_block(b, rng.gen_ratio(1, 20));
                    }
                }
                _ => {
                    let b = BlockAddr { channel: ch, chip, block: rng.gen_range(0..4) };
                    if abm.block(b).status() != BlockStatus::FreePrepared {
                        abm.set_to_dirty_block(b);
                    }
                }
            }
            abm.check_status();
            assert_lists_match(&abm);
        }
    }

    #[test]
    fn store_and_load_rebuild_lists() {
        let mut abm = abm();
        let b = abm.get_free_block_prepare(1, 1).unwrap();
        abm.get_free_block_commit(b);
        abm.invalidate_subpage(b, 1, 0);
        abm.erase_block(BlockAddr { channel: 0, chip: 1, block: 3 }, true);
        abm.mark_program_failed(b);

        let mut raw = Vec::new();
        abm.store(&mut raw).unwrap();

        let mut restored = Abm::new(&geo(), 2, true);
        restored.load(&mut raw.as_slice()).unwrap();

        assert_eq!(restored.stats(), abm.stats());
        assert!(restored.is_subpage_invalid(b, 1, 0));
        assert_eq!(restored.block(b).status(), BlockStatus::Dirty);
        assert_eq!(restored.dirty_blocks(1, 1).count(), 1);
        assert!(restored.block(b).program_failed());
        assert_lists_match(&restored);
    }

    #[test]
    fn load_rejects_unknown_status() {
        let abm = abm();
        let mut raw = Vec::new();
        abm.store(&mut raw).unwrap();
        raw[0] = 9;

        let mut restored = Abm::new(&geo(), 2, true);
        assert!(matches!(restored.load(&mut raw.as_slice()), Err(FtlError::Snapshot(_))));
    }
}
