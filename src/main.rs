use std::sync::Arc;

use log::info;
use nand_ftl::device::RamDevice;
use nand_ftl::host::HostCollector;
use nand_ftl::{DeviceGeometry, Driver, FtlParams, HostKind, HostRequest, Result};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

fn geometry() -> DeviceGeometry {
    DeviceGeometry {
        nr_channels: 4,
        nr_chips_per_channel: 2,
        nr_blocks_per_chip: 32,
        nr_pages_per_block: 32,
        nr_subpages_per_page: 4,
        page_main_size: 4096,
        page_oob_size: 128,
    }
}

/// Writes whole physical pages worth of logical addresses, like a host
/// issuing page-sized I/O.
struct Workload<'a> {
    driver: &'a Driver,
    host: &'a HostCollector,
    tag: u64,
    sectors_per_page: u64,
    nr_bufs: usize,
    buf_len: usize,
}

impl<'a> Workload<'a> {
    fn new(driver: &'a Driver, host: &'a HostCollector) -> Self {
        let layout = driver.layout();
        Workload {
            driver,
            host,
            tag: 0,
            sectors_per_page: layout.sectors_per_lpa() * layout.lpas_per_page() as u64,
            nr_bufs: layout.geometry.nr_subpages_per_page,
            buf_len: layout.geometry.subpage_size(),
        }
    }

    fn nr_pages(&self) -> u64 {
        self.driver.nr_sectors() / self.sectors_per_page
    }

    /// Write one page and wait for it.
    fn write(&mut self, page: u64) -> Result<bool> {
        self.tag += 1;
        let buffers = (0..self.nr_bufs).map(|_| vec![(page % 251) as u8; self.buf_len]).collect();
        self.driver.submit(HostRequest {
            tag: self.tag,
            kind: HostKind::Write,
            offset: page * self.sectors_per_page,
            size: self.sectors_per_page,
            buffers,
        })?;
        Ok(!self.host.wait_for(self.tag).failed)
    }
}

fn run(driver: &Driver, host: &HostCollector) -> Result<()> {
    let mut w = Workload::new(driver, host);
    let max_page = w.nr_pages() - 1;

    for page in 0..=max_page {
        w.write(page)?;
    }
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);

    for c in 0..4 {
        let mut failed = 0;
        for _ in 0..=max_page {
            let page = rng.gen_range(0..=max_page);
            if !w.write(page)? {
                failed += 1;
            }
        }
        info!("Capacity {} randomly written, {} writes failed", c, failed);
    }

    let stats = driver.stats();
    info!("{:?}", stats.abm);
    info!("{:?}", stats.gc);
    info!("{:?}", stats.dispatch);
    Ok(())
}

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    SimpleLogger::init(LevelFilter::Info, log_cfg).unwrap();

    let op = 20.0;
    let device = Arc::new(RamDevice::new(geometry()));
    let host = Arc::new(HostCollector::new());
    let params = FtlParams { overprovision: op, ..FtlParams::default() };
    let driver = Driver::open(device, host.clone(), params).unwrap();

    if let Err(e) = run(&driver, &host) {
        log::error!("workload aborted: {}", e);
    }
    driver.close();
}
