use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::abm::{read_u32, read_u64, read_u8, Abm, AbmStats, BlockAddr, BlockStatus};
use crate::config::*;
use crate::error::{FtlError, Result};
use crate::llm::LowLevel;
use crate::request::{Batch, DeviceRequest, PhysAddr};

const SNAPSHOT_MAGIC: u32 = 0x4C54_464E;
const SNAPSHOT_VERSION: u16 = 2;

/// Operations the request layer needs from a mapping scheme.
pub trait Ftl: Send {
    fn layout(&self) -> &Layout;

    /// Next page from the round-robin cursor over the active blocks.
    fn get_free_ppa(&mut self) -> Result<PhysAddr>;

    /// Up to `size` consecutive pages of one active block, starting at the
    /// cursor's unit. Returns the first page and how many were granted.
    fn get_free_ppas(&mut self, size: usize) -> Result<(PhysAddr, usize)>;

    fn map_lpa_to_ppa(&mut self, lpas: &[Lpa], phys: PhysAddr) -> Result<()>;

    fn get_ppa(&self, lpa: Lpa) -> Result<Lookup>;

    fn invalidate_lpa(&mut self, lpa: Lpa, len: u64) -> Result<()>;

    fn is_gc_needed(&self) -> bool;

    fn do_gc(&mut self, llm: &dyn LowLevel) -> Result<GcReport>;

    fn scan_badblocks(&mut self, llm: &dyn LowLevel) -> Result<()>;

    /// Where a translation page was last written, if ever.
    fn tpage_location(&self, tpage: usize) -> Option<(PhysAddr, usize)>;

    /// Serialize the entries of one translation page into `buf`.
    fn encode_tpage(&self, tpage: usize, buf: &mut [u8]);

    fn is_tpage_dirty(&self, tpage: usize) -> bool;

    fn store(&self, w: &mut dyn Write) -> Result<()>;

    fn load(&mut self, r: &mut dyn Read) -> Result<()>;

    fn abm_stats(&self) -> AbmStats;

    fn gc_stats(&self) -> GcStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEntry {
    NotAllocated,
    Valid { phys: PhysAddr, sp_off: usize },
    Invalid,
}

/// Result of a mapping lookup. Unwritten addresses read back as zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Mapped { phys: PhysAddr, sp_off: usize },
    Unwritten,
}

/// Outcome of one GC round; all zero when the round was skipped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub victims: usize,
    pub pages_read: usize,
    pub pages_written: usize,
    pub erased: usize,
    pub retired: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub rounds: u64,
    pub skipped: u64,
    pub pages_copied: u64,
    pub blocks_erased: u64,
    pub blocks_retired: u64,
}

/// Page-level mapping over per-unit active blocks.
pub struct PageFtl {
    pub(crate) layout: Layout,
    pub(crate) params: FtlParams,
    pub(crate) abm: Abm,
    pub(crate) l2p: Vec<MapEntry>,
    /// Location of every translation page, indexed by translation page number.
    pub(crate) tpages: Vec<Option<(PhysAddr, usize)>>,
    pub(crate) tpage_dirty: Vec<bool>,
    pub(crate) active: Vec<Option<BlockAddr>>,
    pub(crate) cursor: UnitId,

    pub(crate) gc_spare: Vec<Box<DeviceRequest>>,
    pub(crate) gc_batch: Arc<Batch>,
    pub(crate) gc_stats: GcStats,
}

impl PageFtl {
    pub fn new(geometry: DeviceGeometry, params: &FtlParams) -> Result<Self> {
        geometry.validate()?;
        params.validate()?;

        let layout = Layout::new(geometry, params);
        let nr_punits = geometry.nr_punits();
        let mut out = PageFtl {
            layout,
            params: params.clone(),
            abm: Abm::new(&geometry, layout.lpas_per_page(), true),
            l2p: vec![MapEntry::NotAllocated; layout.nr_lpas as usize],
            tpages: vec![None; layout.nr_tpages()],
            tpage_dirty: vec![false; layout.nr_tpages()],
            active: vec![None; nr_punits],
            cursor: 0,
            gc_spare: Vec::new(),
            gc_batch: Batch::new(),
            gc_stats: GcStats::default(),
        };

        for unit in 0..nr_punits {
            if out.refresh_active(unit).is_none() {
                return Err(FtlError::NoFreeBlock {
                    channel: unit % geometry.nr_channels,
                    chip: unit / geometry.nr_channels,
                });
            }
        }

        info!(
            "page ftl: {} logical addresses of {} bytes, {} units, {} blocks",
            layout.nr_lpas,
            layout.lpa_size(),
            nr_punits,
            geometry.nr_blocks()
        );
        Ok(out)
    }

    pub fn abm(&self) -> &Abm {
        &self.abm
    }

    pub fn active_block(&self, unit: UnitId) -> Option<BlockAddr> {
        self.active[unit]
    }

    pub fn entry(&self, lpa: Lpa) -> Option<MapEntry> {
        self.l2p.get(lpa as usize).copied()
    }

    fn unit_coords(&self, unit: UnitId) -> (usize, usize) {
        let nr_channels = self.layout.geometry.nr_channels;
        (unit % nr_channels, unit / nr_channels)
    }

    /// Reserve and commit a fresh active block for `unit`.
    pub(crate) fn refresh_active(&mut self, unit: UnitId) -> Option<BlockAddr> {
        let (channel, chip) = self.unit_coords(unit);
        let b = self.abm.get_free_block_prepare(channel, chip);
        if let Some(b) = b {
            self.abm.get_free_block_commit(b);
            trace!("unit {} active block -> {}", unit, b.block);
        }
        self.active[unit] = b;
        b
    }

    /// Grant up to `size` pages of the unit's active block. The second value
    /// is the number of pages granted, the third whether the block filled up.
    fn take_pages(&mut self, unit: UnitId, size: usize) -> Option<(PhysAddr, usize, bool)> {
        let b = match self.active[unit] {
            Some(b) => b,
            None => self.refresh_active(unit)?,
        };

        let nr_pages = self.layout.geometry.nr_pages_per_block;
        let blk = self.abm.block_mut(b);
        debug_assert!(blk.offset < nr_pages, "active block {:?} is full", b);

        let page = blk.offset;
        let granted = size.min(nr_pages - page);
        blk.offset += granted;
        let full = blk.offset == nr_pages;

        if full {
            self.active[unit] = None;
            if self.refresh_active(unit).is_none() {
                debug!("unit {} has no free block left", unit);
            }
        }

        Some((PhysAddr::new(b.channel, b.chip, b.block, page), granted, full))
    }

    fn mark_dirty(&mut self, lpa: Lpa) {
        let t = lpa as usize / self.layout.entries_per_tpage();
        self.tpage_dirty[t] = true;
    }

    fn invalidate_phys(&mut self, phys: PhysAddr, sp_off: usize) {
        self.abm.invalidate_subpage(phys.block_addr(), phys.page, sp_off);
    }

    fn check_lpa(&self, lpa: Lpa) -> Result<()> {
        if lpa & META_TAG != 0 && lpa != NO_LPA {
            let t = (lpa & !META_TAG) as usize;
            if t >= self.tpages.len() {
                return Err(FtlError::LpaOutOfRange { lpa, limit: self.tpages.len() as u64 });
            }
            return Ok(());
        }
        if lpa != NO_LPA && lpa >= self.layout.nr_lpas {
            return Err(FtlError::LpaOutOfRange { lpa, limit: self.layout.nr_lpas });
        }
        Ok(())
    }

    pub(crate) fn encode_entry(&self, entry: MapEntry) -> u64 {
        let geo = &self.layout.geometry;
        match entry {
            MapEntry::NotAllocated => 0,
            MapEntry::Invalid => u64::MAX,
            MapEntry::Valid { phys, sp_off } => {
                1 + (phys.linear(geo) * self.layout.lpas_per_page() + sp_off) as u64
            }
        }
    }

    fn write_entry(w: &mut dyn Write, entry: &MapEntry) -> Result<()> {
        let (status, phys, sp_off) = match *entry {
            MapEntry::NotAllocated => (0u8, PhysAddr::default(), 0),
            MapEntry::Valid { phys, sp_off } => (1u8, phys, sp_off),
            MapEntry::Invalid => (2u8, PhysAddr::default(), 0),
        };
        w.write_all(&[status])?;
        write_phys(w, phys, sp_off)
    }

    fn read_entry(r: &mut dyn Read) -> Result<MapEntry> {
        let status = read_u8(r)?;
        let (phys, sp_off) = read_phys(r)?;
        match status {
            0 => Ok(MapEntry::NotAllocated),
            1 => Ok(MapEntry::Valid { phys, sp_off }),
            2 => Ok(MapEntry::Invalid),
            other => Err(FtlError::Snapshot(format!("unknown mapping status {}", other))),
        }
    }

    fn write_header(&self, w: &mut dyn Write) -> Result<()> {
        let geo = &self.layout.geometry;
        w.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
        w.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
        let mapping: u8 = match self.layout.mapping {
            MappingUnit::Subpage => 0,
            MappingUnit::Page => 1,
        };
        w.write_all(&[mapping, 0])?;
        for v in geometry_fields(geo) {
            w.write_all(&(v as u32).to_le_bytes())?;
        }
        w.write_all(&self.layout.nr_lpas.to_le_bytes())?;
        Ok(())
    }

    fn check_header(&self, r: &mut dyn Read) -> Result<()> {
        let magic = read_u32(r)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(FtlError::Snapshot(format!(
                "magic mismatch: expected {SNAPSHOT_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        let mut raw = [0u8; 4];
        r.read_exact(&mut raw)?;
        let version = u16::from_le_bytes([raw[0], raw[1]]);
        if version != SNAPSHOT_VERSION {
            return Err(FtlError::Snapshot(format!("unsupported version {}", version)));
        }

        let mut fields = [0usize; 7];
        for f in fields.iter_mut() {
            *f = read_u32(r)? as usize;
        }
        let stored = DeviceGeometry {
            nr_channels: fields[0],
            nr_chips_per_channel: fields[1],
            nr_blocks_per_chip: fields[2],
            nr_pages_per_block: fields[3],
            nr_subpages_per_page: fields[4],
            page_main_size: fields[5],
            page_oob_size: fields[6],
        };
        if stored != self.layout.geometry {
            return Err(FtlError::GeometryMismatch {
                stored: Box::new(stored),
                current: Box::new(self.layout.geometry),
            });
        }

        let mapping = match self.layout.mapping {
            MappingUnit::Subpage => 0,
            MappingUnit::Page => 1,
        };
        let nr_lpas = read_u64(r)?;
        if raw[2] != mapping || nr_lpas != self.layout.nr_lpas {
            return Err(FtlError::Snapshot(format!(
                "snapshot maps {} addresses in mode {}, driver expects {} in mode {}",
                nr_lpas, raw[2], self.layout.nr_lpas, mapping
            )));
        }
        Ok(())
    }
}

/// Folds every byte passing through into a running crc32c.
struct Crc32c<T> {
    inner: T,
    crc: u32,
}

impl<T> Crc32c<T> {
    fn new(inner: T) -> Self {
        Crc32c { inner, crc: 0 }
    }
}

impl<W: Write> Write for Crc32c<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<R: Read> Read for Crc32c<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        Ok(n)
    }
}

fn geometry_fields(geo: &DeviceGeometry) -> [usize; 7] {
    [
        geo.nr_channels,
        geo.nr_chips_per_channel,
        geo.nr_blocks_per_chip,
        geo.nr_pages_per_block,
        geo.nr_subpages_per_page,
        geo.page_main_size,
        geo.page_oob_size,
    ]
}

fn write_phys(w: &mut dyn Write, phys: PhysAddr, sp_off: usize) -> Result<()> {
    for v in [phys.channel, phys.chip, phys.block, phys.page, sp_off] {
        w.write_all(&(v as u32).to_le_bytes())?;
    }
    Ok(())
}

fn read_phys(r: &mut dyn Read) -> Result<(PhysAddr, usize)> {
    let phys = PhysAddr::new(
        read_u32(r)? as usize,
        read_u32(r)? as usize,
        read_u32(r)? as usize,
        read_u32(r)? as usize,
    );
    Ok((phys, read_u32(r)? as usize))
}

impl Ftl for PageFtl {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn get_free_ppa(&mut self) -> Result<PhysAddr> {
        let nr_punits = self.active.len();
        for _ in 0..nr_punits {
            let unit = self.cursor;
            self.cursor = (self.cursor + 1) % nr_punits;
            if let Some((ppa, _, _)) = self.take_pages(unit, 1) {
                return Ok(ppa);
            }
        }
        warn!(
            "no free page: {} total, {} free, {} dirty blocks",
            self.abm.nr_total_blocks(),
            self.abm.nr_free_blocks(),
            self.abm.nr_dirty_blocks()
        );
        Err(FtlError::OutOfSpace)
    }

    fn get_free_ppas(&mut self, size: usize) -> Result<(PhysAddr, usize)> {
        debug_assert_ne!(size, 0, "zero-sized allocation");

        let nr_punits = self.active.len();
        let start = self.cursor;
        let mut retried = false;
        loop {
            if let Some((ppa, granted, full)) = self.take_pages(self.cursor, size) {
                if full {
                    self.cursor = (self.cursor + 1) % nr_punits;
                }
                return Ok((ppa, granted));
            }

            self.cursor = (self.cursor + 1) % nr_punits;
            if self.cursor == start {
                if !retried {
                    retried = true;
                    continue;
                }
                warn!(
                    "get_free_ppas: {} total, {} free, {} dirty blocks, nothing available",
                    self.abm.nr_total_blocks(),
                    self.abm.nr_free_blocks(),
                    self.abm.nr_dirty_blocks()
                );
                return Err(FtlError::OutOfSpace);
            }
        }
    }

    fn map_lpa_to_ppa(&mut self, lpas: &[Lpa], phys: PhysAddr) -> Result<()> {
        assert_eq!(lpas.len(), self.layout.lpas_per_page(), "one tag per mapping slot");
        assert!(phys.is_valid(&self.layout.geometry), "mapping to {:?}", phys);
        for &lpa in lpas {
            self.check_lpa(lpa)?;
        }

        for (k, &lpa) in lpas.iter().enumerate() {
            if lpa == NO_LPA {
                // nothing lives here; GC must see it as garbage
                self.invalidate_phys(phys, k);
                continue;
            }

            if lpa & META_TAG != 0 {
                let t = (lpa & !META_TAG) as usize;
                if let Some((old, off)) = self.tpages[t] {
                    self.invalidate_phys(old, off);
                }
                self.tpages[t] = Some((phys, k));
                self.tpage_dirty[t] = false;
                continue;
            }

            if let MapEntry::Valid { phys: old, sp_off } = self.l2p[lpa as usize] {
                self.invalidate_phys(old, sp_off);
            }
            self.l2p[lpa as usize] = MapEntry::Valid { phys, sp_off: k };
            self.mark_dirty(lpa);
        }
        Ok(())
    }

    fn get_ppa(&self, lpa: Lpa) -> Result<Lookup> {
        if lpa >= self.layout.nr_lpas {
            return Err(FtlError::LpaOutOfRange { lpa, limit: self.layout.nr_lpas });
        }
        match self.l2p[lpa as usize] {
            MapEntry::Valid { phys, sp_off } => Ok(Lookup::Mapped { phys, sp_off }),
            _ => Ok(Lookup::Unwritten),
        }
    }

    fn invalidate_lpa(&mut self, lpa: Lpa, len: u64) -> Result<()> {
        let end = lpa.checked_add(len).unwrap_or(u64::MAX);
        if end > self.layout.nr_lpas {
            warn!("trim beyond logical space ({} = {}+{}) {}", end, lpa, len, self.layout.nr_lpas);
            return Err(FtlError::LpaOutOfRange { lpa: end, limit: self.layout.nr_lpas });
        }

        for l in lpa..end {
            if let MapEntry::Valid { phys, sp_off } = self.l2p[l as usize] {
                self.invalidate_phys(phys, sp_off);
                self.l2p[l as usize] = MapEntry::Invalid;
                self.mark_dirty(l);
            }
        }
        Ok(())
    }

    fn is_gc_needed(&self) -> bool {
        let total = self.abm.nr_total_blocks();
        let free = self.abm.nr_free_blocks();
        free * 100 <= self.params.gc_threshold_pct * total
    }

    fn do_gc(&mut self, llm: &dyn LowLevel) -> Result<GcReport> {
        self.run_gc(llm)
    }

    fn scan_badblocks(&mut self, llm: &dyn LowLevel) -> Result<()> {
        self.run_badblock_scan(llm)
    }

    fn tpage_location(&self, tpage: usize) -> Option<(PhysAddr, usize)> {
        self.tpages.get(tpage).copied().flatten()
    }

    fn encode_tpage(&self, tpage: usize, buf: &mut [u8]) {
        let per = self.layout.entries_per_tpage();
        let first = tpage * per;
        for (i, chunk) in buf.chunks_exact_mut(8).take(per).enumerate() {
            let entry = self.l2p.get(first + i).copied().unwrap_or(MapEntry::NotAllocated);
            chunk.copy_from_slice(&self.encode_entry(entry).to_le_bytes());
        }
    }

    fn is_tpage_dirty(&self, tpage: usize) -> bool {
        self.tpage_dirty[tpage]
    }

    fn store(&self, w: &mut dyn Write) -> Result<()> {
        let mut hashed = Crc32c::new(w);
        let w: &mut dyn Write = &mut hashed;
        self.write_header(w)?;
        self.abm.store(w)?;
        for entry in &self.l2p {
            Self::write_entry(w, entry)?;
        }
        for loc in &self.tpages {
            match loc {
                Some((phys, off)) => {
                    w.write_all(&[1])?;
                    write_phys(w, *phys, *off)?;
                }
                None => {
                    w.write_all(&[0])?;
                    write_phys(w, PhysAddr::default(), 0)?;
                }
            }
        }
        for a in &self.active {
            match a {
                Some(b) => {
                    w.write_all(&[1])?;
                    w.write_all(&(b.block as u32).to_le_bytes())?;
                }
                None => {
                    w.write_all(&[0])?;
                    w.write_all(&0u32.to_le_bytes())?;
                }
            }
        }
        w.write_all(&(self.cursor as u32).to_le_bytes())?;

        let crc = hashed.crc;
        hashed.inner.write_all(&crc.to_le_bytes())?;
        hashed.inner.flush()?;

        info!("snapshot stored: {} blocks, {} mapping entries", self.abm.nr_total_blocks(), self.l2p.len());
        Ok(())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        let mut hashed = Crc32c::new(r);
        let r: &mut dyn Read = &mut hashed;
        self.check_header(r)?;

        let geo = self.layout.geometry;
        let mut abm = Abm::new(&geo, self.layout.lpas_per_page(), true);
        abm.load(r)?;

        let mut l2p = Vec::with_capacity(self.l2p.len());
        for _ in 0..self.l2p.len() {
            let entry = Self::read_entry(r)?;
            if let MapEntry::Valid { phys, sp_off } = entry {
                if !phys.is_valid(&geo) || sp_off >= self.layout.lpas_per_page() {
                    return Err(FtlError::Snapshot(format!("mapping points outside the device: {:?}", phys)));
                }
            }
            l2p.push(entry);
        }

        let mut tpages = Vec::with_capacity(self.tpages.len());
        for _ in 0..self.tpages.len() {
            let present = read_u8(r)?;
            let (phys, off) = read_phys(r)?;
            tpages.push((present == 1).then_some((phys, off)));
        }

        let mut active = Vec::with_capacity(self.active.len());
        for unit in 0..self.active.len() {
            let present = read_u8(r)?;
            let block = read_u32(r)? as usize;
            if present != 1 {
                active.push(None);
                continue;
            }
            let (channel, chip) = self.unit_coords(unit);
            let b = BlockAddr { channel, chip, block };
            let ok = abm
                .get_block(channel, chip, block)
                .map_or(false, |blk| matches!(blk.status(), BlockStatus::Clean | BlockStatus::Dirty));
            if !ok {
                return Err(FtlError::Snapshot(format!("active block {:?} is not in use", b)));
            }
            if abm.block(b).offset >= geo.nr_pages_per_block {
                return Err(FtlError::Snapshot(format!("active block {:?} has no page left", b)));
            }
            active.push(Some(b));
        }
        let cursor = read_u32(r)? as usize;
        if cursor >= self.active.len() {
            return Err(FtlError::Snapshot(format!("cursor {} out of range", cursor)));
        }

        let computed = hashed.crc;
        let stored = read_u32(&mut hashed.inner)?;
        if stored != computed {
            return Err(FtlError::Snapshot(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        self.abm = abm;
        self.l2p = l2p;
        self.tpages = tpages;
        self.tpage_dirty.iter_mut().for_each(|d| *d = false);
        self.active = active;
        self.cursor = cursor;

        info!("snapshot loaded: {:?}", self.abm.stats());
        Ok(())
    }

    fn abm_stats(&self) -> AbmStats {
        self.abm.stats()
    }

    fn gc_stats(&self) -> GcStats {
        self.gc_stats
    }
}
