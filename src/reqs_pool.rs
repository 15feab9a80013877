//! Host request pool: splits a host I/O into device-level requests aligned to
//! the mapping unit and collects their completions.

use num_integer::div_ceil;
use parking_lot::Mutex;

use crate::config::{FtlParams, Layout, Lpa, MappingUnit, NO_LPA};
use crate::error::{FtlError, Result};
use crate::pool::{ObjectPool, SlotId};
use crate::request::{DeviceRequest, Origin, ReqKind, SlotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Read,
    Write,
    Trim,
}

/// I/O as the host layer submits it. `offset` and `size` count 512-byte
/// sectors; reads and writes carry one buffer per sub-page they touch.
#[derive(Debug)]
pub struct HostRequest {
    pub tag: u64,
    pub kind: HostKind,
    pub offset: u64,
    pub size: u64,
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct HostCompletion {
    pub tag: u64,
    pub kind: HostKind,
    pub offset: u64,
    pub size: u64,
    pub buffers: Vec<Vec<u8>>,
    pub failed: bool,
}

#[derive(Default)]
struct HostSlot {
    tag: u64,
    kind: Option<HostKind>,
    offset: u64,
    size: u64,
    returned: Vec<Option<Vec<u8>>>,
    nr_llm_reqs: usize,
    nr_done: usize,
    failed: bool,
    /// Device requests of earlier uses, kept for reuse.
    spare: Vec<Box<DeviceRequest>>,
}

impl HostSlot {
    fn completion(&mut self) -> HostCompletion {
        HostCompletion {
            tag: self.tag,
            kind: self.kind.unwrap_or(HostKind::Read),
            offset: self.offset,
            size: self.size,
            buffers: self.returned.drain(..).map(Option::unwrap_or_default).collect(),
            failed: self.failed,
        }
    }
}

/// A host request broken into device requests, ready for a dispatch policy.
pub struct Decomposed {
    pub slot: SlotId,
    pub kind: HostKind,
    /// Logical range a trim invalidates; never any device requests.
    pub trim: Option<(Lpa, u64)>,
    pub reqs: Vec<Box<DeviceRequest>>,
}

pub struct ReqsPool {
    layout: Layout,
    inner: Mutex<ObjectPool<HostSlot>>,
}

impl ReqsPool {
    pub fn new(layout: Layout, params: &FtlParams) -> Self {
        ReqsPool {
            layout,
            inner: Mutex::new(ObjectPool::new(params.pool_size, params.pool_increment)),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn nr_sectors(&self) -> u64 {
        self.layout.nr_lpas * self.layout.sectors_per_lpa()
    }

    /// Range of logical sub-pages `[first, last)` a request touches.
    fn subpage_range(&self, offset: u64, size: u64) -> (u64, u64) {
        let sps = self.layout.sectors_per_subpage();
        (offset / sps, div_ceil(offset + size, sps))
    }

    /// Reject malformed requests before they take a pool slot.
    pub fn validate(&self, req: &HostRequest) -> Result<()> {
        if req.size == 0 {
            return Err(FtlError::InvalidRequest(format!("request {} has no sectors", req.tag)));
        }
        let end = match req.offset.checked_add(req.size) {
            Some(end) => end,
            None => return Err(FtlError::InvalidRequest(format!("request {} wraps around", req.tag))),
        };
        if end > self.nr_sectors() {
            return Err(FtlError::LpaOutOfRange {
                lpa: div_ceil(end, self.layout.sectors_per_lpa()),
                limit: self.layout.nr_lpas,
            });
        }
        if req.kind == HostKind::Trim {
            return Ok(());
        }

        let (first, last) = self.subpage_range(req.offset, req.size);
        let subpage_size = self.layout.geometry.subpage_size();
        if req.buffers.len() as u64 != last - first {
            return Err(FtlError::InvalidRequest(format!(
                "request {} touches {} sub-pages but carries {} buffers",
                req.tag,
                last - first,
                req.buffers.len()
            )));
        }
        if let Some(b) = req.buffers.iter().find(|b| b.len() != subpage_size) {
            return Err(FtlError::InvalidRequest(format!(
                "buffer of {} bytes, sub-pages are {} bytes",
                b.len(),
                subpage_size
            )));
        }
        Ok(())
    }

    /// Take a pool slot for `req` and build its device-level requests.
    pub fn build(&self, req: HostRequest) -> Result<Decomposed> {
        self.validate(&req)?;

        let mut pool = self.inner.lock();
        let slot = pool.acquire();
        let hs = pool.get_mut(slot);
        hs.tag = req.tag;
        hs.kind = Some(req.kind);
        hs.offset = req.offset;
        hs.size = req.size;
        hs.returned.clear();
        hs.returned.resize(req.buffers.len(), None);
        hs.nr_done = 0;
        hs.failed = false;
        let mut spare = std::mem::take(&mut hs.spare);
        drop(pool);

        let mut out = Decomposed { slot, kind: req.kind, trim: None, reqs: Vec::new() };
        match req.kind {
            HostKind::Trim => {
                // only whole mapping units strictly inside the range
                let spl = self.layout.sectors_per_lpa();
                let start = div_ceil(req.offset, spl);
                let end = (req.offset + req.size) / spl;
                if start < end {
                    out.trim = Some((start, end - start));
                }
            }
            HostKind::Write => self.build_write(slot, req, &mut spare, &mut out.reqs),
            HostKind::Read => self.build_read(slot, req, &mut spare, &mut out.reqs),
        }

        let mut pool = self.inner.lock();
        let hs = pool.get_mut(slot);
        hs.nr_llm_reqs = out.reqs.len();
        hs.spare = spare;
        trace!("host req {} {:?} -> {} device reqs", hs.tag, out.kind, out.reqs.len());
        Ok(out)
    }

    fn take_req(&self, spare: &mut Vec<Box<DeviceRequest>>, kind: ReqKind, slot: SlotId) -> Box<DeviceRequest> {
        let geo = &self.layout.geometry;
        let mut r = spare
            .pop()
            .unwrap_or_else(|| Box::new(DeviceRequest::new(geo.nr_subpages_per_page, self.layout.lpas_per_page())));
        r.reset(kind, Origin::Host(slot));
        r
    }

    fn build_write(
        &self,
        slot: SlotId,
        req: HostRequest,
        spare: &mut Vec<Box<DeviceRequest>>,
        reqs: &mut Vec<Box<DeviceRequest>>,
    ) {
        let spp = self.layout.geometry.nr_subpages_per_page as u64;
        let (first, last) = self.subpage_range(req.offset, req.size);
        let mut bufs = req.buffers.into_iter();

        let mut kp = first;
        while kp < last {
            let group = kp / spp;
            let group_end = ((group + 1) * spp).min(last);
            let mut r = self.take_req(spare, ReqKind::Write, slot);
            r.key = Some(group);

            for k in kp..group_end {
                let i = (k % spp) as usize;
                let s = &mut r.slots[i];
                s.status = SlotStatus::Data;
                s.data = bufs.next().unwrap_or_default();
                s.bvec = Some((k - first) as usize);
                if self.layout.mapping == MappingUnit::Subpage {
                    r.lpas[i] = k;
                }
            }
            if self.layout.mapping == MappingUnit::Page {
                r.lpas[0] = group;
            }
            if self.layout.in_place_rmw() && r.has_hole() {
                r.kind = ReqKind::RmwRead;
            }

            reqs.push(r);
            kp = group_end;
        }
    }

    fn build_read(
        &self,
        slot: SlotId,
        req: HostRequest,
        spare: &mut Vec<Box<DeviceRequest>>,
        reqs: &mut Vec<Box<DeviceRequest>>,
    ) {
        let spp = self.layout.geometry.nr_subpages_per_page as u64;
        let (first, last) = self.subpage_range(req.offset, req.size);

        for (k, buf) in (first..last).zip(req.buffers) {
            let mut r = self.take_req(spare, ReqKind::Read, slot);
            r.key = Some(k / spp);
            // sub-page reads start at slot 0 and move once the mapping is known
            let i = match self.layout.mapping {
                MappingUnit::Subpage => {
                    r.lpas[0] = k;
                    0
                }
                MappingUnit::Page => {
                    r.lpas[0] = k / spp;
                    (k % spp) as usize
                }
            };
            let s = &mut r.slots[i];
            s.status = SlotStatus::Data;
            s.data = buf;
            s.bvec = Some((k - first) as usize);
            reqs.push(r);
        }
    }

    /// Account one finished device request. Returns the host completion once
    /// every part of the host request is back; the slot is free after that.
    pub fn end_llm_req(&self, mut req: Box<DeviceRequest>) -> Option<HostCompletion> {
        let slot = match req.origin {
            Origin::Host(slot) => slot,
            ref other => panic!("{:?} request {:?} is not from a host slot", req.kind, other),
        };

        let mut pool = self.inner.lock();
        let hs = pool.get_mut(slot);
        let dummy = req.kind == ReqKind::ReadDummy;
        for s in req.slots.iter_mut() {
            if let Some(i) = s.bvec {
                let mut data = std::mem::take(&mut s.data);
                if dummy {
                    data.iter_mut().for_each(|b| *b = 0);
                }
                hs.returned[i] = Some(data);
            }
        }
        if req.failed {
            warn!("host req {}: {:?} at {:?} failed", hs.tag, req.kind, req.phys);
            hs.failed = true;
        }
        req.lpas.iter_mut().for_each(|l| *l = NO_LPA);
        req.origin = Origin::Detached;
        hs.spare.push(req);

        hs.nr_done += 1;
        assert!(hs.nr_done <= hs.nr_llm_reqs, "slot {} completed too often", slot);
        if hs.nr_done < hs.nr_llm_reqs {
            return None;
        }
        let done = hs.completion();
        pool.release(slot);
        Some(done)
    }

    /// Complete a host request that produced no device requests.
    pub fn finish(&self, slot: SlotId, failed: bool) -> HostCompletion {
        let mut pool = self.inner.lock();
        let hs = pool.get_mut(slot);
        assert_eq!(hs.nr_llm_reqs, hs.nr_done, "slot {} still has device requests out", slot);
        hs.failed |= failed;
        let done = hs.completion();
        pool.release(slot);
        done
    }

    pub fn nr_in_use(&self) -> usize {
        self.inner.lock().nr_in_use()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }
}
