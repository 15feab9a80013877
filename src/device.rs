//! Device adapter contract and a RAM-backed flash emulator.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::abm::BlockAddr;
use crate::config::{DeviceGeometry, Lpa, NO_LPA};
use crate::error::{FtlError, Result};
use crate::request::{DeviceRequest, ReqKind, SlotStatus};

/// Handed back by `Device::submit` when the request never reached the device.
pub struct Rejected(pub Box<DeviceRequest>);

/// Receives exactly one completion per accepted request.
pub trait DeviceSink: Send + Sync {
    fn end_req(&self, req: Box<DeviceRequest>);
}

pub trait Device: Send + Sync {
    fn probe(&self) -> DeviceGeometry;
    fn open(&self, sink: Arc<dyn DeviceSink>) -> Result<()>;
    fn submit(&self, req: Box<DeviceRequest>) -> std::result::Result<(), Rejected>;
    fn close(&self);
}

struct PageData {
    main: Vec<Vec<u8>>,
    oob: Vec<Lpa>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
    pub failures: u64,
}

/// Flash array kept in memory. Pages are allocated when first programmed.
pub struct RamFlash {
    geo: DeviceGeometry,
    pages: Mutex<Vec<Option<PageData>>>,
    failing_blocks: Mutex<HashSet<BlockAddr>>,
    failing_programs: Mutex<HashSet<BlockAddr>>,
    reads: AtomicU64,
    programs: AtomicU64,
    erases: AtomicU64,
    failures: AtomicU64,
}

impl RamFlash {
    pub fn new(geo: DeviceGeometry) -> Self {
        RamFlash {
            geo,
            pages: Mutex::new((0..geo.nr_pages()).map(|_| None).collect()),
            failing_blocks: Mutex::new(HashSet::new()),
            failing_programs: Mutex::new(HashSet::new()),
            reads: AtomicU64::new(0),
            programs: AtomicU64::new(0),
            erases: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geo
    }

    /// Every later erase of `b` reports failure.
    pub fn fail_erase(&self, b: BlockAddr) {
        self.failing_blocks.lock().insert(b);
    }

    /// Every later program into `b` reports failure and leaves the page blank.
    pub fn fail_program(&self, b: BlockAddr) {
        self.failing_programs.lock().insert(b);
    }

    pub fn is_programmed(&self, b: BlockAddr, page: usize) -> bool {
        let idx = ((b.channel * self.geo.nr_chips_per_channel + b.chip) * self.geo.nr_blocks_per_chip + b.block)
            * self.geo.nr_pages_per_block
            + page;
        self.pages.lock()[idx].is_some()
    }

    pub fn stats(&self) -> FlashStats {
        FlashStats {
            reads: self.reads.load(Ordering::Relaxed),
            programs: self.programs.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Run one request against the array. Returns false on a device failure.
    pub fn execute(&self, req: &mut DeviceRequest) -> bool {
        let ok = self.execute_inner(req);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    fn execute_inner(&self, req: &mut DeviceRequest) -> bool {
        if matches!(req.kind, ReqKind::ReadDummy | ReqKind::Trim) {
            return true;
        }
        if !req.phys.is_valid(&self.geo) {
            error!("request {:?} outside the device: {:?}", req.kind, req.phys);
            return false;
        }

        let subpage_size = self.geo.subpage_size();
        let idx = req.phys.linear(&self.geo);

        match req.kind {
            ReqKind::GcErase => {
                let b = req.phys.block_addr();
                if self.failing_blocks.lock().contains(&b) {
                    warn!("erase failed on {:?}", b);
                    return false;
                }
                let first = idx - req.phys.page;
                let mut pages = self.pages.lock();
                pages[first..first + self.geo.nr_pages_per_block]
                    .iter_mut()
                    .for_each(|p| *p = None);
                self.erases.fetch_add(1, Ordering::Relaxed);
                true
            }
            kind if kind.is_read() => {
                let pages = self.pages.lock();
                let partial = kind == ReqKind::RmwRead;
                for (k, slot) in req.slots.iter_mut().enumerate() {
                    // a merge read only fills the holes around the new data
                    if partial && slot.status == SlotStatus::Data {
                        continue;
                    }
                    slot.data.resize(subpage_size, 0);
                    match &pages[idx] {
                        Some(p) => slot.data.copy_from_slice(&p.main[k]),
                        None => slot.data.iter_mut().for_each(|b| *b = 0),
                    }
                }
                match &pages[idx] {
                    Some(p) => req.oob.clone_from(&p.oob),
                    None => req.oob.iter_mut().for_each(|l| *l = NO_LPA),
                }
                self.reads.fetch_add(1, Ordering::Relaxed);
                true
            }
            kind if kind.is_write() => {
                if self.failing_programs.lock().contains(&req.phys.block_addr()) {
                    warn!("program failed on {:?}", req.phys);
                    return false;
                }
                let mut pages = self.pages.lock();
                if pages[idx].is_some() {
                    error!("page {:?} programmed twice", req.phys);
                    return false;
                }
                let main = req
                    .slots
                    .iter()
                    .map(|s| {
                        let mut d = s.data.clone();
                        d.resize(subpage_size, 0);
                        d
                    })
                    .collect();
                pages[idx] = Some(PageData { main, oob: req.oob.clone() });
                self.programs.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => true,
        }
    }
}

struct Worker {
    flash: Arc<RamFlash>,
    queue: Mutex<VecDeque<Box<DeviceRequest>>>,
    cond: Condvar,
    stop: AtomicBool,
    sink: Mutex<Option<Arc<dyn DeviceSink>>>,
}

impl Worker {
    fn run(&self) {
        loop {
            let req = {
                let mut q = self.queue.lock();
                loop {
                    if let Some(req) = q.pop_front() {
                        break Some(req);
                    }
                    if self.stop.load(Ordering::Acquire) {
                        break None;
                    }
                    self.cond.wait(&mut q);
                }
            };
            let Some(mut req) = req else {
                return;
            };

            req.failed = !self.flash.execute(&mut req);
            let sink = self.sink.lock().clone();
            match sink {
                Some(sink) => sink.end_req(req),
                None => error!("completion of {:?} dropped, device has no sink", req.kind),
            }
        }
    }
}

/// Emulated device: one worker thread executing requests against a `RamFlash`.
pub struct RamDevice {
    worker: Arc<Worker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    reject_next: AtomicUsize,
}

impl RamDevice {
    pub fn new(geo: DeviceGeometry) -> Self {
        RamDevice::with_flash(Arc::new(RamFlash::new(geo)))
    }

    pub fn with_flash(flash: Arc<RamFlash>) -> Self {
        RamDevice {
            worker: Arc::new(Worker {
                flash,
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
                sink: Mutex::new(None),
            }),
            thread: Mutex::new(None),
            reject_next: AtomicUsize::new(0),
        }
    }

    pub fn flash(&self) -> &Arc<RamFlash> {
        &self.worker.flash
    }

    /// Refuse the next `n` submissions.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::Release);
    }
}

impl Device for RamDevice {
    fn probe(&self) -> DeviceGeometry {
        self.worker.flash.geometry()
    }

    fn open(&self, sink: Arc<dyn DeviceSink>) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(FtlError::InvalidRequest("device is already open".into()));
        }
        *self.worker.sink.lock() = Some(sink);
        self.worker.stop.store(false, Ordering::Release);

        let worker = self.worker.clone();
        let handle = thread::Builder::new()
            .name("ramdrive".into())
            .spawn(move || worker.run())?;
        *thread = Some(handle);
        info!("ramdrive opened: {:?}", self.worker.flash.geometry());
        Ok(())
    }

    fn submit(&self, req: Box<DeviceRequest>) -> std::result::Result<(), Rejected> {
        if self.thread.lock().is_none() {
            return Err(Rejected(req));
        }
        let rejected = self
            .reject_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Rejected(req));
        }

        self.worker.queue.lock().push_back(req);
        self.worker.cond.notify_one();
        Ok(())
    }

    fn close(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            {
                let _q = self.worker.queue.lock();
                self.worker.stop.store(true, Ordering::Release);
                self.worker.cond.notify_all();
            }
            if handle.join().is_err() {
                error!("ramdrive worker panicked");
            }
        }
        *self.worker.sink.lock() = None;
    }
}
