//! Garbage collection and bad-block scanning for the page-level FTL.

use std::collections::HashSet;

use crate::abm::{BlockAddr, BlockStatus};
use crate::config::{UnitId, META_TAG, NO_LPA};
use crate::error::Result;
use crate::ftl::{Ftl, GcReport, MapEntry, PageFtl};
use crate::llm::LowLevel;
use crate::request::{DeviceRequest, Origin, PhysAddr, ReqKind, SlotStatus};

/// One live mapping unit picked up from a victim page.
struct LiveUnit {
    lpa: u64,
    data: Vec<Vec<u8>>,
}

impl PageFtl {
    /// Greedy: the dirty block with the most stale sub-pages, never the active block.
    pub(crate) fn select_victim(&self, unit: UnitId) -> Option<BlockAddr> {
        let geo = &self.layout.geometry;
        let (channel, chip) = (unit % geo.nr_channels, unit / geo.nr_channels);
        let active = self.active[unit];
        let full = self.abm.nr_subpages_per_block();

        let mut victim: Option<(BlockAddr, usize)> = None;
        for blk in self.abm.dirty_blocks(channel, chip) {
            if Some(blk.addr()) == active {
                continue;
            }
            if blk.nr_invalid() == full {
                return Some(blk.addr());
            }
            match victim {
                Some((_, best)) if best >= blk.nr_invalid() => {}
                _ => victim = Some((blk.addr(), blk.nr_invalid())),
            }
        }
        victim.map(|(b, _)| b)
    }

    fn gc_request(&mut self, kind: ReqKind) -> Box<DeviceRequest> {
        let geo = &self.layout.geometry;
        let mut r = self
            .gc_spare
            .pop()
            .unwrap_or_else(|| Box::new(DeviceRequest::new(geo.nr_subpages_per_page, self.layout.lpas_per_page())));
        r.reset(kind, Origin::Batch(self.gc_batch.clone()));
        r
    }

    fn submit_and_wait(&mut self, llm: &dyn LowLevel, reqs: Vec<Box<DeviceRequest>>) -> Vec<Box<DeviceRequest>> {
        if reqs.is_empty() {
            return reqs;
        }
        self.gc_batch.arm(reqs.len());
        for r in reqs {
            llm.make_req(r);
        }
        self.gc_batch.wait()
    }

    pub(crate) fn run_gc(&mut self, llm: &dyn LowLevel) -> Result<GcReport> {
        let geo = self.layout.geometry;
        let nr_punits = geo.nr_punits();
        let lpp = self.layout.lpas_per_page();
        let spl = self.layout.subpages_per_lpa();
        let subpage_size = geo.subpage_size();

        let mut victims: Vec<BlockAddr> = (0..nr_punits).filter_map(|u| self.select_victim(u)).collect();
        if victims.len() * self.params.gc_min_victim_ratio <= nr_punits {
            self.gc_stats.skipped += 1;
            return Ok(GcReport::default());
        }
        self.gc_stats.rounds += 1;
        let mut report = GcReport { victims: victims.len(), ..GcReport::default() };

        // read every page that still holds live data
        let mut reads = Vec::new();
        for &v in &victims {
            let written = self.abm.block(v).offset;
            for page in 0..written {
                let live: Vec<bool> = (0..lpp).map(|k| !self.abm.is_subpage_invalid(v, page, k)).collect();
                if !live.iter().any(|&l| l) {
                    continue;
                }
                let mut r = self.gc_request(ReqKind::GcRead);
                for (k, &l) in live.iter().enumerate() {
                    let status = if l { SlotStatus::Data } else { SlotStatus::Hole };
                    for s in &mut r.slots[k * spl..(k + 1) * spl] {
                        s.status = status;
                    }
                }
                r.phys = PhysAddr::new(v.channel, v.chip, v.block, page);
                r.alloc_pads(subpage_size);
                reads.push(r);
            }
        }
        report.pages_read = reads.len();

        // nothing may still point into a victim once it is erased
        llm.flush();
        let reads = self.submit_and_wait(llm, reads);

        let mut broken: HashSet<BlockAddr> = HashSet::new();
        let mut live = Vec::new();
        for mut r in reads {
            if r.failed {
                error!("gc read of {:?} failed, keeping the block", r.phys);
                broken.insert(r.phys.block_addr());
                self.gc_spare.push(r);
                continue;
            }
            for k in 0..lpp {
                if r.slots[k * spl].status != SlotStatus::Data {
                    continue;
                }
                let lpa = r.oob[k];
                if lpa == NO_LPA {
                    // mapped but never programmed: the write that owned it failed
                    self.drop_mappings_to(r.phys, k);
                    continue;
                }
                debug_assert!(
                    lpa & META_TAG != 0
                        || self.l2p[lpa as usize] == MapEntry::Valid { phys: r.phys, sp_off: k },
                    "live sub-page of {:?} is not mapped there",
                    r.phys
                );
                let data = r.slots[k * spl..(k + 1) * spl]
                    .iter_mut()
                    .map(|s| std::mem::take(&mut s.data))
                    .collect();
                live.push(LiveUnit { lpa, data });
            }
            self.gc_spare.push(r);
        }
        victims.retain(|v| !broken.contains(v));

        // pack live units densely into as few pages as possible
        let mut writes: Vec<Box<DeviceRequest>> = Vec::new();
        let mut live = live.into_iter().peekable();
        while live.peek().is_some() {
            let mut w = self.gc_request(ReqKind::GcWrite);
            for (k, unit) in live.by_ref().take(lpp).enumerate() {
                w.lpas[k] = unit.lpa;
                for (j, data) in unit.data.into_iter().enumerate() {
                    let s = &mut w.slots[k * spl + j];
                    s.status = SlotStatus::Data;
                    s.data = data;
                }
            }
            w.alloc_pads(subpage_size);
            writes.push(w);
        }

        let mut ppas: Vec<PhysAddr> = Vec::with_capacity(writes.len());
        let mut copy_ok = true;
        while ppas.len() < writes.len() {
            match self.get_free_ppas(writes.len() - ppas.len()) {
                Ok((start, granted)) => {
                    ppas.extend((0..granted).map(|i| PhysAddr { page: start.page + i, ..start }));
                }
                Err(_) => {
                    copy_ok = false;
                    break;
                }
            }
        }

        if !copy_ok {
            warn!("gc: no free space for the copy, erasing fully invalid victims only");
            // granted pages stay unwritten; mark them stale so a later round reclaims them
            for p in &ppas {
                for k in 0..lpp {
                    self.abm.invalidate_subpage(p.block_addr(), p.page, k);
                }
            }
            self.gc_spare.append(&mut writes);
            let full = self.abm.nr_subpages_per_block();
            victims.retain(|&v| self.abm.block(v).nr_invalid() == full);
        } else if !writes.is_empty() {
            for (w, &ppa) in writes.iter_mut().zip(ppas.iter()) {
                w.oob.copy_from_slice(&w.lpas);
                w.phys = ppa;
            }

            // remap only what reached the flash; the rest stays at its source
            let mut kept: HashSet<BlockAddr> = HashSet::new();
            for w in self.submit_and_wait(llm, writes) {
                if w.failed {
                    error!("gc write to {:?} failed, keeping its source blocks", w.phys);
                    kept.extend(w.lpas.iter().filter_map(|&l| self.location_of(l)).map(|p| p.block_addr()));
                    self.discard_page(w.phys);
                } else {
                    self.remap_copy(&w.lpas, w.phys)?;
                    report.pages_written += 1;
                    self.gc_stats.pages_copied += 1;
                }
                self.gc_spare.push(w);
            }
            victims.retain(|v| !kept.contains(v));
        }

        let mut erases = Vec::with_capacity(victims.len());
        for &v in &victims {
            let mut r = self.gc_request(ReqKind::GcErase);
            r.phys = PhysAddr::new(v.channel, v.chip, v.block, 0);
            erases.push(r);
        }
        for r in self.submit_and_wait(llm, erases) {
            let b = r.phys.block_addr();
            self.abm.erase_block(b, r.failed);
            if self.abm.block(b).status() == BlockStatus::Bad {
                report.retired += 1;
                self.gc_stats.blocks_retired += 1;
            } else {
                report.erased += 1;
                self.gc_stats.blocks_erased += 1;
            }
            self.gc_spare.push(r);
        }

        debug!(
            "gc: {} victims, {} pages read, {} written, {} erased, {} retired",
            report.victims, report.pages_read, report.pages_written, report.erased, report.retired
        );
        Ok(report)
    }

    /// Where a logical or translation-page tag currently lives.
    fn location_of(&self, lpa: u64) -> Option<PhysAddr> {
        if lpa == NO_LPA {
            return None;
        }
        if lpa & META_TAG != 0 {
            return self.tpages[(lpa & !META_TAG) as usize].map(|(phys, _)| phys);
        }
        match self.l2p[lpa as usize] {
            MapEntry::Valid { phys, .. } => Some(phys),
            _ => None,
        }
    }

    fn remap_copy(&mut self, lpas: &[u64], phys: PhysAddr) -> Result<()> {
        // moving a translation page does not flush its in-memory changes
        let meta_dirty: Vec<(usize, bool)> = lpas
            .iter()
            .filter(|&&l| l != NO_LPA && l & META_TAG != 0)
            .map(|&l| {
                let t = (l & !META_TAG) as usize;
                (t, self.tpage_dirty[t])
            })
            .collect();
        self.map_lpa_to_ppa(lpas, phys)?;
        for (t, dirty) in meta_dirty {
            self.tpage_dirty[t] = dirty;
        }
        Ok(())
    }

    /// A page whose program failed: nothing lives there, no more writes go
    /// to its block, and the block is retired once GC has emptied it.
    fn discard_page(&mut self, phys: PhysAddr) {
        let b = phys.block_addr();
        for k in 0..self.layout.lpas_per_page() {
            self.abm.invalidate_subpage(b, phys.page, k);
        }
        self.abm.mark_program_failed(b);
        if let Some(unit) = self.active.iter().position(|&a| a == Some(b)) {
            self.active[unit] = None;
        }
    }

    /// Reverse lookup; only taken for pages whose program failed.
    fn drop_mappings_to(&mut self, phys: PhysAddr, sp_off: usize) {
        let per = self.layout.entries_per_tpage();
        let target = MapEntry::Valid { phys, sp_off };
        for (lpa, e) in self.l2p.iter_mut().enumerate() {
            if *e == target {
                warn!("lpa {} pointed at unprogrammed {:?}, dropped", lpa, phys);
                *e = MapEntry::Invalid;
                self.tpage_dirty[lpa / per] = true;
            }
        }
        if let Some(t) = self.tpages.iter().position(|&loc| loc == Some((phys, sp_off))) {
            warn!("translation page {} pointed at unprogrammed {:?}, dropped", t, phys);
            self.tpages[t] = None;
            self.tpage_dirty[t] = true;
        }
    }

    /// Forget every mapping, erase every block and start over with fresh active blocks.
    pub(crate) fn run_badblock_scan(&mut self, llm: &dyn LowLevel) -> Result<()> {
        let geo = self.layout.geometry;
        info!("bad-block scan over {} blocks", geo.nr_blocks());

        self.l2p.iter_mut().for_each(|e| *e = MapEntry::NotAllocated);
        self.tpages.iter_mut().for_each(|t| *t = None);
        self.tpage_dirty.iter_mut().for_each(|d| *d = false);

        llm.flush();

        for block in 0..geo.nr_blocks_per_chip {
            let mut erases = Vec::with_capacity(geo.nr_punits());
            for unit in 0..geo.nr_punits() {
                let b = BlockAddr { channel: unit % geo.nr_channels, chip: unit / geo.nr_channels, block };
                match self.abm.block(b).status() {
                    BlockStatus::Bad => continue,
                    BlockStatus::FreePrepared => panic!("block {:?} is reserved during the scan", b),
                    _ => self.abm.set_to_dirty_block(b),
                }
                let mut r = self.gc_request(ReqKind::GcErase);
                r.phys = PhysAddr::new(b.channel, b.chip, b.block, 0);
                erases.push(r);
            }
            for r in self.submit_and_wait(llm, erases) {
                self.abm.erase_block(r.phys.block_addr(), r.failed);
                self.gc_spare.push(r);
            }
        }

        self.active.iter_mut().for_each(|a| *a = None);
        for unit in 0..geo.nr_punits() {
            if self.refresh_active(unit).is_none() {
                warn!("unit {} has no usable block after the scan", unit);
            }
        }
        self.cursor = 0;

        let stats = self.abm.stats();
        info!("bad-block scan done: {} free, {} bad", stats.free, stats.bad);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{DeviceGeometry, FtlParams, Lpa};
    use crate::ftl::test::{scenario_a, InlineLlm};
    use crate::ftl::Lookup;
    use crate::request::Batch;

    fn write(fw: &mut PageFtl, llm: &InlineLlm, lpas: &[Lpa], fill: u8) {
        let geo = fw.layout.geometry;
        let ppa = fw.get_free_ppa().unwrap();
        fw.map_lpa_to_ppa(lpas, ppa).unwrap();

        let batch = Batch::new();
        batch.arm(1);
        let mut r = Box::new(DeviceRequest::new(geo.nr_subpages_per_page, lpas.len()));
        r.reset(ReqKind::Write, Origin::Batch(batch.clone()));
        r.lpas.copy_from_slice(lpas);
        r.oob.copy_from_slice(lpas);
        r.phys = ppa;
        for s in r.slots.iter_mut() {
            s.status = SlotStatus::Data;
            s.data = vec![fill; geo.subpage_size()];
        }
        llm.make_req(r);
        assert!(!batch.wait()[0].failed);
    }

    fn read(fw: &PageFtl, llm: &InlineLlm, lpa: Lpa) -> Option<u8> {
        let geo = fw.layout.geometry;
        let (phys, sp_off) = match fw.get_ppa(lpa).unwrap() {
            Lookup::Mapped { phys, sp_off } => (phys, sp_off),
            Lookup::Unwritten => return None,
        };
        let batch = Batch::new();
        batch.arm(1);
        let mut r = Box::new(DeviceRequest::new(geo.nr_subpages_per_page, fw.layout.lpas_per_page()));
        r.reset(ReqKind::Read, Origin::Batch(batch.clone()));
        r.phys = phys;
        r.alloc_pads(geo.subpage_size());
        llm.make_req(r);
        let done = batch.wait();
        assert_eq!(done[0].oob[sp_off], lpa);
        Some(done[0].slots[sp_off].data[0])
    }

    fn params(threshold: usize) -> FtlParams {
        FtlParams { overprovision: 25.0, gc_threshold_pct: threshold, ..FtlParams::default() }
    }

    #[test]
    fn gc_reclaims_and_keeps_data() {
        let geo = scenario_a();
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(15)).unwrap();

        // even addresses land on unit 0, so overwriting them leaves garbage there
        for lpa in 0..12 {
            write(&mut fw, &llm, &[lpa], lpa as u8);
        }
        for lpa in (0..12).step_by(2) {
            write(&mut fw, &llm, &[lpa], 100 + lpa as u8);
        }
        for _ in 0..5 {
            let ppa = fw.get_free_ppa().unwrap();
            fw.map_lpa_to_ppa(&[NO_LPA], ppa).unwrap();
        }
        assert_eq!(fw.abm.nr_free_blocks(), 1);
        assert!(fw.is_gc_needed());

        // first round takes the fully stale block, no copy needed
        let report = fw.do_gc(&llm).unwrap();
        assert_eq!((report.victims, report.pages_read, report.erased), (1, 0, 1));
        assert_eq!(fw.abm.nr_free_blocks(), 2);

        // second round has to move the one live page out
        let report = fw.do_gc(&llm).unwrap();
        assert_eq!((report.victims, report.pages_read, report.pages_written), (1, 1, 1));
        // the copy filled unit 1's active block, which took a fresh one
        assert_eq!(fw.abm.nr_free_blocks(), 2);
        assert_eq!(fw.gc_stats().pages_copied, 1);

        for lpa in 0..12u64 {
            let want = if lpa % 2 == 0 { 100 + lpa as u8 } else { lpa as u8 };
            assert_eq!(read(&fw, &llm, lpa), Some(want), "lpa {}", lpa);
        }
        fw.abm.check_status();
    }

    #[test]
    fn compaction_packs_subpages() {
        let geo = DeviceGeometry { nr_subpages_per_page: 4, page_main_size: 2048, page_oob_size: 64, ..scenario_a() };
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(10)).unwrap();

        // four half-empty pages per unit fill the first blocks
        for i in 0..8u64 {
            write(&mut fw, &llm, &[i * 4, NO_LPA, i * 4 + 2, NO_LPA], i as u8);
        }
        let report = fw.do_gc(&llm).unwrap();

        assert_eq!(report.victims, 2);
        assert_eq!(report.pages_read, 8);
        assert_eq!(report.pages_written, 4);
        for i in 0..8u64 {
            assert_eq!(read(&fw, &llm, i * 4), Some(i as u8));
            assert_eq!(read(&fw, &llm, i * 4 + 2), Some(i as u8));
            assert_eq!(read(&fw, &llm, i * 4 + 1), None);
        }
    }

    #[test]
    fn fully_invalid_victim_needs_no_copy() {
        let geo = scenario_a();
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(10)).unwrap();

        for lpa in 0..8 {
            write(&mut fw, &llm, &[lpa], 1);
        }
        fw.invalidate_lpa(0, 8).unwrap();
        let report = fw.do_gc(&llm).unwrap();

        assert_eq!(report.pages_read, 0);
        assert_eq!(report.erased, 2);
        assert_eq!(fw.abm.nr_free_blocks(), 6);
    }

    #[test]
    fn failed_erase_retires_block() {
        let geo = scenario_a();
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(10)).unwrap();

        for lpa in 0..8 {
            write(&mut fw, &llm, &[lpa], 1);
        }
        let doomed = BlockAddr { channel: 0, chip: 0, block: 0 };
        llm.flash.fail_erase(doomed);
        fw.invalidate_lpa(0, 8).unwrap();
        let report = fw.do_gc(&llm).unwrap();

        assert_eq!(report.retired, 1);
        assert_eq!(fw.abm.block(doomed).status(), BlockStatus::Bad);
        let stats = fw.abm.stats();
        assert_eq!(stats.total - stats.bad, 7);
        assert_eq!(stats.free + stats.free_prepared + stats.clean + stats.dirty, 7);

        // a retired block is never handed out again
        while let Ok(ppa) = fw.get_free_ppa() {
            assert_ne!(ppa.block_addr(), doomed);
        }
    }

    #[test]
    fn failed_gc_write_keeps_victim() {
        let geo = scenario_a();
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(10)).unwrap();

        for lpa in 0..8 {
            write(&mut fw, &llm, &[lpa], 10 + lpa as u8);
        }
        // unit 0's first block keeps only lpa 2 alive
        for lpa in [0, 4, 6] {
            fw.invalidate_lpa(lpa, 1).unwrap();
        }
        let victim = match fw.get_ppa(2).unwrap() {
            Lookup::Mapped { phys, .. } => phys.block_addr(),
            Lookup::Unwritten => panic!("lpa 2 lost"),
        };
        let dest = fw.active_block(0).unwrap();
        llm.flash.fail_program(dest);

        let report = fw.do_gc(&llm).unwrap();
        assert_eq!((report.victims, report.pages_read, report.pages_written), (1, 1, 0));
        assert_eq!(report.erased, 0);
        assert_eq!(read(&fw, &llm, 2), Some(12));
        assert_eq!(fw.abm.block(victim).status(), BlockStatus::Dirty);
        assert!(fw.abm.block(dest).program_failed());
        assert_ne!(fw.active_block(0), Some(dest));

        // the next round copies into a fresh block
        let report = fw.do_gc(&llm).unwrap();
        assert_eq!((report.pages_written, report.erased), (1, 1));
        assert_eq!(read(&fw, &llm, 2), Some(12));
        assert_eq!(fw.abm.block(victim).status(), BlockStatus::Free);

        // the block that failed the program is emptied and retired
        let report = fw.do_gc(&llm).unwrap();
        assert_eq!((report.pages_read, report.retired), (0, 1));
        assert_eq!(fw.abm.block(dest).status(), BlockStatus::Bad);
        for lpa in [1, 2, 3, 5, 7] {
            assert_eq!(read(&fw, &llm, lpa), Some(10 + lpa as u8));
        }
        fw.abm.check_status();
    }

    #[test]
    fn skipped_without_victims() {
        let geo = scenario_a();
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(10)).unwrap();

        assert_eq!(fw.do_gc(&llm).unwrap(), GcReport::default());
        assert_eq!(fw.gc_stats().skipped, 1);
    }

    #[test]
    fn badblock_scan_resets_everything() {
        let geo = scenario_a();
        let llm = InlineLlm::new(geo);
        let mut fw = PageFtl::new(geo, &params(10)).unwrap();
        for lpa in 0..6 {
            write(&mut fw, &llm, &[lpa], 3);
        }
        llm.flash.fail_erase(BlockAddr { channel: 1, chip: 0, block: 2 });

        fw.scan_badblocks(&llm).unwrap();

        assert_eq!(fw.get_ppa(3).unwrap(), Lookup::Unwritten);
        let stats = fw.abm.stats();
        assert_eq!(stats.bad, 1);
        assert_eq!(stats.clean, 2);
        assert_eq!(stats.free, 5);
        assert_eq!(fw.cursor, 0);
        assert!(fw.active.iter().all(|a| a.is_some()));
        assert!(!llm.flash.is_programmed(BlockAddr { channel: 0, chip: 0, block: 0 }, 0));
    }
}
