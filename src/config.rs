use byte_unit::Byte;

use crate::error::{FtlError, Result};

pub type BaseType = usize;

pub type Addr = BaseType;
pub type PageId = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;
pub type UnitId = BaseType;

/// Logical address of one mapping unit.
pub type Lpa = u64;

/// Marks a sub-page slot that carries no logical data.
pub const NO_LPA: Lpa = Lpa::MAX;

/// Set on logical tags that name a translation page instead of user data.
pub const META_TAG: Lpa = 1 << 62;

pub const SECTOR_SIZE: usize = 512;

/// Physical layout of the flash array as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub nr_channels: usize,
    pub nr_chips_per_channel: usize,
    pub nr_blocks_per_chip: usize,
    pub nr_pages_per_block: usize,
    pub nr_subpages_per_page: usize,
    pub page_main_size: usize,
    pub page_oob_size: usize,
}

impl DeviceGeometry {
    pub fn nr_punits(&self) -> usize {
        self.nr_channels * self.nr_chips_per_channel
    }

    pub fn nr_blocks(&self) -> usize {
        self.nr_punits() * self.nr_blocks_per_chip
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_blocks() * self.nr_pages_per_block
    }

    pub fn subpage_size(&self) -> usize {
        self.page_main_size / self.nr_subpages_per_page
    }

    pub fn capacity(&self) -> usize {
        self.nr_pages() * self.page_main_size
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            self.nr_channels,
            self.nr_chips_per_channel,
            self.nr_blocks_per_chip,
            self.nr_pages_per_block,
            self.nr_subpages_per_page,
        ];
        if counts.iter().any(|&c| c == 0) {
            return Err(FtlError::InvalidGeometry("zero-sized dimension".into()));
        }
        if self.page_main_size % self.nr_subpages_per_page != 0 {
            return Err(FtlError::InvalidGeometry(format!(
                "page size {} is not a multiple of {} sub-pages",
                self.page_main_size, self.nr_subpages_per_page
            )));
        }
        if self.subpage_size() == 0 || self.subpage_size() % SECTOR_SIZE != 0 {
            return Err(FtlError::InvalidGeometry(format!(
                "sub-page size {} is not a multiple of the {} byte sector",
                self.subpage_size(),
                SECTOR_SIZE
            )));
        }
        if self.page_oob_size < self.nr_subpages_per_page * std::mem::size_of::<Lpa>() {
            return Err(FtlError::InvalidGeometry(format!(
                "oob area of {} bytes cannot hold {} logical tags",
                self.page_oob_size, self.nr_subpages_per_page
            )));
        }
        Ok(())
    }
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        DeviceGeometry {
            nr_channels: 4,
            nr_chips_per_channel: 2,
            nr_blocks_per_chip: 64,
            nr_pages_per_block: 64,
            nr_subpages_per_page: 4,
            page_main_size: 16384,
            page_oob_size: 1024,
        }
    }
}

/// Granularity of one logical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingUnit {
    /// One logical address per sub-page. Partial pages are padded, never read back.
    Subpage,
    /// One logical address per physical page. Partial writes turn into read-modify-write.
    Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlmPolicy {
    Direct,
    Buffered,
    Dftl,
}

#[derive(Debug, Clone)]
pub struct FtlParams {
    pub mapping: MappingUnit,
    pub policy: HlmPolicy,
    /// Percent of the physical space hidden from the host.
    pub overprovision: f64,
    /// GC is needed once free blocks are at or below this percent of all blocks.
    pub gc_threshold_pct: usize,
    /// A GC round needs victims on more than 1/N of the parallel units.
    pub gc_min_victim_ratio: usize,
    /// Foreground GC rounds tried before a host request is dispatched.
    pub gc_max_rounds: usize,
    pub pool_size: usize,
    pub pool_increment: usize,
    pub fifo_depth: usize,
    pub queue_depth: usize,
    /// Translation pages kept resident by the delayed-mapping policy.
    pub map_cache_pages: usize,
}

impl Default for FtlParams {
    fn default() -> Self {
        FtlParams {
            mapping: MappingUnit::Subpage,
            policy: HlmPolicy::Direct,
            overprovision: 20.0,
            gc_threshold_pct: 10,
            gc_min_victim_ratio: 20,
            gc_max_rounds: 10,
            pool_size: 128,
            pool_increment: 128 / 5,
            fifo_depth: 256,
            queue_depth: 20480,
            map_cache_pages: 64,
        }
    }
}

impl FtlParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..100.0).contains(&self.overprovision) {
            return Err(FtlError::InvalidParams(format!(
                "over-provisioning of {}% is out of range",
                self.overprovision
            )));
        }
        if self.gc_threshold_pct > 100 {
            return Err(FtlError::InvalidParams(format!(
                "gc threshold of {}% is out of range",
                self.gc_threshold_pct
            )));
        }
        if self.pool_size == 0 || self.pool_increment == 0 {
            return Err(FtlError::InvalidParams("request pool cannot be empty".into()));
        }
        if self.fifo_depth == 0 || self.queue_depth == 0 {
            return Err(FtlError::InvalidParams("queue depths must be non-zero".into()));
        }
        if self.policy == HlmPolicy::Dftl && self.map_cache_pages == 0 {
            return Err(FtlError::InvalidParams("map cache needs at least one page".into()));
        }
        Ok(())
    }
}

/// Address arithmetic shared by the mapping table and the request decomposer.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub geometry: DeviceGeometry,
    pub mapping: MappingUnit,
    pub nr_lpas: u64,
}

impl Layout {
    pub fn new(geometry: DeviceGeometry, params: &FtlParams) -> Self {
        let slots = (geometry.nr_pages() * Self::lpas_per_page_for(&geometry, params.mapping)) as u64;
        let op_slots = (slots as f64 * (params.overprovision / 100.)).trunc() as u64;
        let out = Layout {
            geometry,
            mapping: params.mapping,
            nr_lpas: slots - op_slots,
        };

        let physical = geometry.capacity();
        let user = out.nr_lpas as usize * out.lpa_size();
        trace!("mapping slots: {}, op slots: {}", slots, op_slots);
        trace!("Physical Capacity: {} bytes, {}", physical, Byte::from(physical).get_appropriate_unit(true).to_string());
        trace!("User Capacity: {} bytes, {}", user, Byte::from(user).get_appropriate_unit(true).to_string());

        out
    }

    fn lpas_per_page_for(geometry: &DeviceGeometry, mapping: MappingUnit) -> usize {
        match mapping {
            MappingUnit::Subpage => geometry.nr_subpages_per_page,
            MappingUnit::Page => 1,
        }
    }

    /// Logical addresses stored in one physical page.
    pub fn lpas_per_page(&self) -> usize {
        Self::lpas_per_page_for(&self.geometry, self.mapping)
    }

    /// Sub-pages covered by one logical address.
    pub fn subpages_per_lpa(&self) -> usize {
        self.geometry.nr_subpages_per_page / self.lpas_per_page()
    }

    pub fn lpa_size(&self) -> usize {
        self.geometry.subpage_size() * self.subpages_per_lpa()
    }

    pub fn sectors_per_subpage(&self) -> u64 {
        (self.geometry.subpage_size() / SECTOR_SIZE) as u64
    }

    pub fn sectors_per_lpa(&self) -> u64 {
        self.sectors_per_subpage() * self.subpages_per_lpa() as u64
    }

    /// Pages with a hole are merged in place instead of padded.
    pub fn in_place_rmw(&self) -> bool {
        self.mapping == MappingUnit::Page && self.geometry.nr_subpages_per_page > 1
    }

    /// Mapping entries packed into one translation page.
    pub fn entries_per_tpage(&self) -> usize {
        self.geometry.subpage_size() / std::mem::size_of::<u64>()
    }

    pub fn nr_tpages(&self) -> usize {
        num_integer::div_ceil(self.nr_lpas as usize, self.entries_per_tpage())
    }

    /// Sub-pages a whole physical block can hold, in mapping units.
    pub fn lpas_per_block(&self) -> usize {
        self.geometry.nr_pages_per_block * self.lpas_per_page()
    }
}
