use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::abm::BlockAddr;
use crate::config::{DeviceGeometry, Lpa, UnitId, NO_LPA};
use crate::mq::ItemId;
use crate::pool::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhysAddr {
    pub channel: usize,
    pub chip: usize,
    pub block: usize,
    pub page: usize,
}

impl PhysAddr {
    pub fn new(channel: usize, chip: usize, block: usize, page: usize) -> Self {
        PhysAddr { channel, chip, block, page }
    }

    /// First page of the parallel unit, used by requests that touch no flash.
    pub fn from_punit(unit: UnitId, geo: &DeviceGeometry) -> Self {
        PhysAddr::new(unit % geo.nr_channels, unit / geo.nr_channels, 0, 0)
    }

    pub fn punit(&self, geo: &DeviceGeometry) -> UnitId {
        self.chip * geo.nr_channels + self.channel
    }

    pub fn block_addr(&self) -> BlockAddr {
        BlockAddr { channel: self.channel, chip: self.chip, block: self.block }
    }

    /// Position of the page in a flat array of all device pages.
    pub fn linear(&self, geo: &DeviceGeometry) -> usize {
        ((self.channel * geo.nr_chips_per_channel + self.chip) * geo.nr_blocks_per_chip + self.block)
            * geo.nr_pages_per_block
            + self.page
    }

    pub fn is_valid(&self, geo: &DeviceGeometry) -> bool {
        self.channel < geo.nr_channels
            && self.chip < geo.nr_chips_per_channel
            && self.block < geo.nr_blocks_per_chip
            && self.page < geo.nr_pages_per_block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqKind {
    Read,
    Write,
    Trim,
    RmwRead,
    RmwWrite,
    GcRead,
    GcWrite,
    GcErase,
    MetaRead,
    MetaWrite,
    ReadDummy,
}

impl ReqKind {
    pub fn is_read(self) -> bool {
        matches!(self, ReqKind::Read | ReqKind::RmwRead | ReqKind::GcRead | ReqKind::MetaRead | ReqKind::ReadDummy)
    }

    pub fn is_write(self) -> bool {
        matches!(self, ReqKind::Write | ReqKind::RmwWrite | ReqKind::GcWrite | ReqKind::MetaWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Data,
    Hole,
}

/// One sub-page worth of buffer inside a device request.
#[derive(Debug, Clone)]
pub struct Subpage {
    pub status: SlotStatus,
    pub data: Vec<u8>,
    /// Index of the host buffer this slot borrowed, if any.
    pub bvec: Option<usize>,
}

impl Subpage {
    fn hole() -> Self {
        Subpage { status: SlotStatus::Hole, data: Vec::new(), bvec: None }
    }
}

/// Who gets the request back once it completes.
#[derive(Clone)]
pub enum Origin {
    Host(SlotId),
    Batch(Arc<Batch>),
    Detached,
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Host(slot) => write!(f, "Host({})", slot),
            Origin::Batch(_) => write!(f, "Batch"),
            Origin::Detached => write!(f, "Detached"),
        }
    }
}

/// Unit of physical I/O handed to the dispatcher and the device.
#[derive(Debug)]
pub struct DeviceRequest {
    pub kind: ReqKind,
    pub lpas: Vec<Lpa>,
    /// Ordering key in the dispatcher; `None` is never held back by tickets.
    pub key: Option<Lpa>,
    pub phys: PhysAddr,
    pub phys_src: PhysAddr,
    pub phys_dst: PhysAddr,
    pub slots: Vec<Subpage>,
    pub oob: Vec<Lpa>,
    pub origin: Origin,
    pub failed: bool,
    pub(crate) qitem: Option<ItemId>,
    pub(crate) rmw_partner: Option<ItemId>,
}

impl DeviceRequest {
    pub fn new(nr_slots: usize, nr_lpas: usize) -> Self {
        DeviceRequest {
            kind: ReqKind::Read,
            lpas: vec![NO_LPA; nr_lpas],
            key: None,
            phys: PhysAddr::default(),
            phys_src: PhysAddr::default(),
            phys_dst: PhysAddr::default(),
            slots: (0..nr_slots).map(|_| Subpage::hole()).collect(),
            oob: vec![NO_LPA; nr_lpas],
            origin: Origin::Detached,
            failed: false,
            qitem: None,
            rmw_partner: None,
        }
    }

    /// Prepare a recycled request for a new use. Scratch buffers of holes are kept.
    pub fn reset(&mut self, kind: ReqKind, origin: Origin) {
        self.kind = kind;
        self.lpas.iter_mut().for_each(|l| *l = NO_LPA);
        self.oob.iter_mut().for_each(|l| *l = NO_LPA);
        self.key = None;
        self.phys = PhysAddr::default();
        self.phys_src = PhysAddr::default();
        self.phys_dst = PhysAddr::default();
        for s in self.slots.iter_mut() {
            s.status = SlotStatus::Hole;
            if s.bvec.take().is_some() {
                s.data = Vec::new();
            }
        }
        self.origin = origin;
        self.failed = false;
        self.qitem = None;
        self.rmw_partner = None;
    }

    /// Give every slot without a host buffer a zeroed scratch buffer.
    pub fn alloc_pads(&mut self, subpage_size: usize) {
        for s in self.slots.iter_mut().filter(|s| s.bvec.is_none()) {
            if s.data.len() != subpage_size {
                s.data.resize(subpage_size, 0);
            }
        }
    }

    pub fn has_hole(&self) -> bool {
        self.slots.iter().any(|s| s.status == SlotStatus::Hole)
    }

    pub fn nr_data_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.status == SlotStatus::Data).count()
    }

    /// Move a slot to the sub-page offset its data actually lives at.
    pub fn relocate(&mut self, from: usize, to: usize) {
        if from != to {
            self.slots.swap(from, to);
        }
    }
}

#[derive(Default)]
struct BatchState {
    expected: usize,
    done: Vec<Box<DeviceRequest>>,
}

/// Collects the completions of a group of internally issued requests.
#[derive(Default)]
pub struct Batch {
    state: Mutex<BatchState>,
    cond: Condvar,
}

impl Batch {
    pub fn new() -> Arc<Self> {
        Arc::new(Batch::default())
    }

    /// Must be called before the first request of the group is submitted.
    pub fn arm(&self, expected: usize) {
        let mut st = self.state.lock();
        assert!(st.done.is_empty(), "batch re-armed with {} pending completions", st.done.len());
        st.expected = expected;
    }

    pub fn push(&self, req: Box<DeviceRequest>) {
        let mut st = self.state.lock();
        st.done.push(req);
        if st.done.len() >= st.expected {
            self.cond.notify_all();
        }
    }

    /// Blocks until every armed request is back.
    pub fn wait(&self) -> Vec<Box<DeviceRequest>> {
        let mut st = self.state.lock();
        while st.done.len() < st.expected {
            self.cond.wait(&mut st);
        }
        st.expected = 0;
        std::mem::take(&mut st.done)
    }
}

/// Receives device requests that left the dispatcher.
pub trait RequestSink: Send + Sync {
    fn end_req(&self, req: Box<DeviceRequest>);
}
