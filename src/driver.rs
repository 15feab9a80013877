//! The handle that owns one FTL instance: device, mapping, request pool,
//! dispatcher and the chosen dispatch policy.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byte_unit::Byte;
use parking_lot::Mutex;

use crate::abm::AbmStats;
use crate::config::{FtlParams, HlmPolicy, Layout, Lpa};
use crate::device::Device;
use crate::error::{FtlError, Result};
use crate::ftl::{Ftl, GcReport, GcStats, Lookup, PageFtl};
use crate::hlm::{Buffered, Dftl, Direct, Engine, Hlm, Router, SharedFtl};
use crate::host::HostSink;
use crate::llm::{DispatchStats, Dispatcher, LowLevel};
use crate::reqs_pool::{HostRequest, ReqsPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub abm: AbmStats,
    pub gc: GcStats,
    pub dispatch: DispatchStats,
    pub pool_in_use: usize,
}

pub struct Driver {
    layout: Layout,
    device: Arc<dyn Device>,
    ftl: SharedFtl,
    pool: Arc<ReqsPool>,
    llm: Arc<Dispatcher>,
    hlm: Box<dyn Hlm>,
    closed: AtomicBool,
}

impl Driver {
    pub fn open(device: Arc<dyn Device>, host: Arc<dyn HostSink>, params: FtlParams) -> Result<Driver> {
        params.validate()?;
        let geo = device.probe();
        geo.validate()?;

        let fw = PageFtl::new(geo, &params)?;
        let layout = *fw.layout();
        let ftl: SharedFtl = Arc::new(Mutex::new(fw));
        let pool = Arc::new(ReqsPool::new(layout, &params));
        let router = Arc::new(Router::new(pool.clone(), host));

        let llm = Dispatcher::start(geo, device.clone(), router.clone(), params.queue_depth)?;
        if let Err(e) = device.open(llm.clone()) {
            llm.stop();
            return Err(e);
        }

        let engine = Engine::new(ftl.clone(), llm.clone(), router, &params);
        let hlm: Box<dyn Hlm> = match params.policy {
            HlmPolicy::Direct => Box::new(Direct::new(engine)),
            HlmPolicy::Buffered => match Buffered::start(engine, params.fifo_depth) {
                Ok(hlm) => Box::new(hlm),
                Err(e) => {
                    llm.stop();
                    device.close();
                    return Err(e);
                }
            },
            HlmPolicy::Dftl => Box::new(Dftl::new(engine, &params)),
        };

        let user = layout.nr_lpas as usize * layout.lpa_size();
        info!(
            "ftl opened: {:?} policy, {:?} mapping, {} logical addresses, {}",
            params.policy,
            layout.mapping,
            layout.nr_lpas,
            Byte::from(user).get_appropriate_unit(true).to_string()
        );

        Ok(Driver { layout, device, ftl, pool, llm, hlm, closed: AtomicBool::new(false) })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Host-visible capacity in 512-byte sectors.
    pub fn nr_sectors(&self) -> u64 {
        self.layout.nr_lpas * self.layout.sectors_per_lpa()
    }

    pub fn submit(&self, req: HostRequest) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FtlError::Closed);
        }
        self.hlm.make_req(req)
    }

    pub fn lookup(&self, lpa: Lpa) -> Result<Lookup> {
        self.ftl.lock().get_ppa(lpa)
    }

    /// One background GC round, regardless of the free-space threshold.
    pub fn gc(&self) -> Result<GcReport> {
        let mut ftl = self.ftl.lock();
        ftl.do_gc(&*self.llm)
    }

    pub fn scan_badblocks(&self) -> Result<()> {
        let mut ftl = self.ftl.lock();
        ftl.scan_badblocks(&*self.llm)
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let ftl = self.ftl.lock();
        self.llm.flush();
        let mut w = BufWriter::new(File::create(path)?);
        ftl.store(&mut w)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let mut ftl = self.ftl.lock();
        self.llm.flush();
        let mut r = BufReader::new(File::open(path)?);
        ftl.load(&mut r)
    }

    pub fn stats(&self) -> DriverStats {
        let ftl = self.ftl.lock();
        DriverStats {
            abm: ftl.abm_stats(),
            gc: ftl.gc_stats(),
            dispatch: self.llm.stats(),
            pool_in_use: self.pool.nr_in_use(),
        }
    }

    /// Drain pending host requests, stop the dispatcher and close the device.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hlm.close();
        self.llm.flush();
        self.llm.stop();
        self.device.close();

        let stats = self.llm.stats();
        info!(
            "ftl closed: {} requests submitted, {} failed, {} host slots still held",
            stats.submitted,
            stats.failed,
            self.pool.nr_in_use()
        );
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}
