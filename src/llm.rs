//! Dispatcher: drains the priority multi-queue onto the device with at most
//! one request in flight per parallel unit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::config::DeviceGeometry;
use crate::device::{Device, DeviceSink, Rejected};
use crate::error::Result;
use crate::mq::PriorityMultiQueue;
use crate::request::{DeviceRequest, ReqKind, RequestSink};

/// What the upper layers need from the dispatcher.
pub trait LowLevel: Send + Sync {
    fn make_req(&self, req: Box<DeviceRequest>);
    /// Queue a merge read under `phys_src` and reserve its write under `phys_dst`.
    fn make_rmw_req(&self, req: Box<DeviceRequest>);
    /// Blocks until nothing is queued or in flight.
    fn flush(&self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

struct State {
    mq: PriorityMultiQueue<Box<DeviceRequest>>,
    /// Bumped on every change that can make an item eligible.
    generation: u64,
    stop: bool,
}

struct Shared {
    geo: DeviceGeometry,
    state: Mutex<State>,
    wake: Condvar,
    drained: Condvar,
    busy: Vec<AtomicBool>,
    device: Arc<dyn Device>,
    upper: Arc<dyn RequestSink>,
    max_depth: usize,

    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn run(&self) {
        let nr_units = self.busy.len();
        loop {
            let seen = {
                let st = self.state.lock();
                if st.stop {
                    break;
                }
                st.generation
            };

            let mut dispatched = false;
            for unit in 0..nr_units {
                if self.busy[unit]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }

                let item = self.state.lock().mq.dequeue(unit);
                let Some((id, mut req)) = item else {
                    self.busy[unit].store(false, Ordering::Release);
                    continue;
                };

                req.qitem = Some(id);
                dispatched = true;
                self.submitted.fetch_add(1, Ordering::Relaxed);
                trace!("dispatch {:?} key {:?} on unit {}", req.kind, req.key, unit);

                if let Err(Rejected(mut req)) = self.device.submit(req) {
                    warn!("device refused {:?} on unit {}", req.kind, unit);
                    req.failed = true;
                    self.complete(req);
                }
            }

            if !dispatched {
                let mut st = self.state.lock();
                while st.generation == seen && !st.stop {
                    self.wake.wait(&mut st);
                }
            }
        }
        debug!("dispatcher stopped");
    }

    fn enqueue(&self, mut req: Box<DeviceRequest>, rmw: bool) {
        let mut st = self.state.lock();
        while st.mq.len() >= self.max_depth && !st.stop {
            self.drained.wait(&mut st);
        }
        if st.stop {
            drop(st);
            error!("dispatcher is stopped, failing {:?}", req.kind);
            req.failed = true;
            self.upper.end_req(req);
            return;
        }

        let key = req.key;
        if rmw {
            let src = req.phys_src.punit(&self.geo);
            let dst = req.phys_dst.punit(&self.geo);
            req.phys = req.phys_src;
            // the read must hold the earlier ticket
            let read = st.mq.enqueue(src, key, None);
            let write = st.mq.enqueue(dst, key, None);
            req.rmw_partner = Some(write);
            st.mq.fill(read, req);
        } else {
            let unit = req.phys.punit(&self.geo);
            st.mq.enqueue(unit, key, Some(req));
        }
        st.generation += 1;
        self.wake.notify_one();
    }

    fn complete(&self, mut req: Box<DeviceRequest>) {
        let unit = req.phys.punit(&self.geo);
        let id = match req.qitem.take() {
            Some(id) => id,
            None => panic!("completion of {:?} that was never dispatched", req.kind),
        };

        let mut st = self.state.lock();
        st.mq.remove(id);

        if req.kind == ReqKind::RmwRead {
            let partner = match req.rmw_partner.take() {
                Some(p) => p,
                None => panic!("merge read without a reserved write"),
            };
            if !req.failed {
                req.kind = ReqKind::RmwWrite;
                req.phys = req.phys_dst;
                st.mq.fill(partner, req);
                st.generation += 1;
                self.busy[unit].store(false, Ordering::Release);
                self.wake.notify_one();
                return;
            }
            st.mq.remove(partner);
        }

        st.generation += 1;
        self.busy[unit].store(false, Ordering::Release);
        self.wake.notify_one();
        self.drained.notify_all();
        drop(st);

        self.completed.fetch_add(1, Ordering::Relaxed);
        if req.failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.upper.end_req(req);
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(
        geo: DeviceGeometry,
        device: Arc<dyn Device>,
        upper: Arc<dyn RequestSink>,
        max_depth: usize,
    ) -> Result<Arc<Self>> {
        let nr_units = geo.nr_punits();
        let shared = Arc::new(Shared {
            geo,
            state: Mutex::new(State {
                mq: PriorityMultiQueue::new(nr_units),
                generation: 0,
                stop: false,
            }),
            wake: Condvar::new(),
            drained: Condvar::new(),
            busy: (0..nr_units).map(|_| AtomicBool::new(false)).collect(),
            device,
            upper,
            max_depth,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("llm-mq".into())
            .spawn(move || worker.run())?;

        Ok(Arc::new(Dispatcher {
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().mq.len()
    }

    pub fn stop(&self) {
        {
            let mut st = self.shared.state.lock();
            st.stop = true;
            self.shared.wake.notify_all();
            self.shared.drained.notify_all();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl LowLevel for Dispatcher {
    fn make_req(&self, req: Box<DeviceRequest>) {
        self.shared.enqueue(req, false);
    }

    fn make_rmw_req(&self, req: Box<DeviceRequest>) {
        self.shared.enqueue(req, true);
    }

    fn flush(&self) {
        let mut st = self.shared.state.lock();
        while !st.mq.is_empty() && !st.stop {
            self.shared.drained.wait(&mut st);
        }
    }
}

impl DeviceSink for Dispatcher {
    fn end_req(&self, req: Box<DeviceRequest>) {
        self.shared.complete(req);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Lpa;
    use crate::device::RamDevice;
    use crate::request::{Batch, Origin, PhysAddr, SlotStatus};
    use std::collections::VecDeque;
    use std::time::Duration;

    fn geo() -> DeviceGeometry {
        DeviceGeometry {
            nr_channels: 2,
            nr_chips_per_channel: 2,
            nr_blocks_per_chip: 4,
            nr_pages_per_block: 64,
            nr_subpages_per_page: 1,
            page_main_size: 512,
            page_oob_size: 16,
        }
    }

    /// Completes requests from its own thread and records their order.
    struct Recorder {
        geo: DeviceGeometry,
        inflight: Vec<AtomicBool>,
        violations: AtomicU64,
        log: Mutex<Vec<(ReqKind, Option<Lpa>, u8)>>,
        queue: Mutex<VecDeque<Box<DeviceRequest>>>,
        cond: Condvar,
        sink: Mutex<Option<Arc<dyn DeviceSink>>>,
    }

    impl Recorder {
        fn new(geo: DeviceGeometry) -> Arc<Self> {
            Arc::new(Recorder {
                geo,
                inflight: (0..geo.nr_punits()).map(|_| AtomicBool::new(false)).collect(),
                violations: AtomicU64::new(0),
                log: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                sink: Mutex::new(None),
            })
        }

        fn serve(self: Arc<Self>) {
            loop {
                let req = {
                    let mut q = self.queue.lock();
                    while q.is_empty() {
                        self.cond.wait(&mut q);
                    }
                    q.pop_front()
                };
                let Some(req) = req else { continue };
                if req.kind == ReqKind::Trim {
                    return;
                }
                thread::sleep(Duration::from_micros(50));
                self.log.lock().push((req.kind, req.key, req.slots[0].data[0]));
                self.inflight[req.phys.punit(&self.geo)].store(false, Ordering::Release);
                let sink = self.sink.lock().clone();
                if let Some(sink) = sink {
                    sink.end_req(req);
                }
            }
        }
    }

    impl Device for Recorder {
        fn probe(&self) -> DeviceGeometry {
            self.geo
        }

        fn open(&self, sink: Arc<dyn DeviceSink>) -> Result<()> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn submit(&self, req: Box<DeviceRequest>) -> std::result::Result<(), Rejected> {
            if self.inflight[req.phys.punit(&self.geo)].swap(true, Ordering::AcqRel) {
                self.violations.fetch_add(1, Ordering::Relaxed);
            }
            self.queue.lock().push_back(req);
            self.cond.notify_one();
            Ok(())
        }

        fn close(&self) {
            let mut stop = Box::new(DeviceRequest::new(1, 1));
            stop.kind = ReqKind::Trim;
            self.queue.lock().push_back(stop);
            self.cond.notify_one();
        }
    }

    struct ToBatch;

    impl RequestSink for ToBatch {
        fn end_req(&self, req: Box<DeviceRequest>) {
            let batch = match &req.origin {
                Origin::Batch(b) => b.clone(),
                _ => unreachable!(),
            };
            batch.push(req);
        }
    }

    fn req(batch: &Arc<Batch>, kind: ReqKind, unit: usize, key: Option<Lpa>, tag: u8) -> Box<DeviceRequest> {
        let mut r = Box::new(DeviceRequest::new(1, 1));
        r.reset(kind, Origin::Batch(batch.clone()));
        r.phys = PhysAddr::from_punit(unit, &geo());
        r.key = key;
        r.slots[0].status = SlotStatus::Data;
        r.slots[0].data = vec![tag; 512];
        r
    }

    fn setup() -> (Arc<Recorder>, Arc<Dispatcher>, JoinHandle<()>) {
        let dev = Recorder::new(geo());
        let llm = Dispatcher::start(geo(), dev.clone(), Arc::new(ToBatch), 64).unwrap();
        dev.open(llm.clone()).unwrap();
        let d = dev.clone();
        let t = thread::spawn(move || d.serve());
        (dev, llm, t)
    }

    #[test]
    fn same_key_runs_in_order_and_units_stay_exclusive() {
        let (dev, llm, t) = setup();
        let batch = Batch::new();
        batch.arm(200);

        for seq in 0..100u8 {
            llm.make_req(req(&batch, ReqKind::Write, seq as usize % 4, Some(7), seq));
            llm.make_req(req(&batch, ReqKind::Read, (seq as usize + 1) % 4, Some(100 + seq as Lpa), 0));
        }
        assert_eq!(batch.wait().len(), 200);
        llm.flush();

        let log = dev.log.lock();
        let writes: Vec<u8> = log.iter().filter(|(_, k, _)| *k == Some(7)).map(|(_, _, s)| *s).collect();
        assert_eq!(writes, (0..100).collect::<Vec<_>>());
        assert_eq!(dev.violations.load(Ordering::Relaxed), 0);
        drop(log);

        llm.stop();
        dev.close();
        t.join().unwrap();
    }

    #[test]
    fn merge_write_follows_its_read() {
        let (dev, llm, t) = setup();
        let batch = Batch::new();
        batch.arm(2);

        let mut rmw = req(&batch, ReqKind::RmwRead, 0, Some(3), 1);
        rmw.phys_src = PhysAddr::from_punit(0, &geo());
        rmw.phys_dst = PhysAddr::from_punit(1, &geo());
        llm.make_rmw_req(rmw);
        // a later plain write of the same key must wait for the merge write
        llm.make_req(req(&batch, ReqKind::Write, 1, Some(3), 2));

        let done = batch.wait();
        assert_eq!(done.len(), 2);
        let log = dev.log.lock().clone();
        let kinds: Vec<ReqKind> = log.iter().map(|(k, _, _)| *k).collect();
        assert_eq!(kinds, vec![ReqKind::RmwRead, ReqKind::RmwWrite, ReqKind::Write]);
        assert_eq!(llm.stats().completed, 2);

        llm.stop();
        dev.close();
        t.join().unwrap();
    }

    #[test]
    fn refused_submission_completes_as_failed() {
        let dev = Arc::new(RamDevice::new(geo()));
        let llm = Dispatcher::start(geo(), dev.clone(), Arc::new(ToBatch), 64).unwrap();
        dev.open(llm.clone()).unwrap();
        dev.reject_next(1);

        let batch = Batch::new();
        batch.arm(2);
        llm.make_req(req(&batch, ReqKind::Write, 2, Some(1), 0));
        llm.make_req(req(&batch, ReqKind::Write, 2, Some(2), 0));
        let done = batch.wait();

        assert_eq!(done.iter().filter(|r| r.failed).count(), 1);
        llm.flush();
        assert_eq!(llm.queued(), 0);
        assert_eq!(llm.stats().failed, 1);

        llm.stop();
        dev.close();
    }
}
