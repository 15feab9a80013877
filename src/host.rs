//! Host adapter contract and a blocking completion collector.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::reqs_pool::HostCompletion;

/// Receives exactly one completion per accepted host request.
pub trait HostSink: Send + Sync {
    fn end_req(&self, done: HostCompletion);
}

/// Parks completions until a caller asks for them by tag.
#[derive(Default)]
pub struct HostCollector {
    done: Mutex<HashMap<u64, HostCompletion>>,
    cond: Condvar,
}

impl HostCollector {
    pub fn new() -> Self {
        HostCollector::default()
    }

    pub fn wait_for(&self, tag: u64) -> HostCompletion {
        let mut done = self.done.lock();
        loop {
            if let Some(c) = done.remove(&tag) {
                return c;
            }
            self.cond.wait(&mut done);
        }
    }

    /// Like `wait_for` but gives up after `timeout`.
    pub fn wait_for_timeout(&self, tag: u64, timeout: Duration) -> Option<HostCompletion> {
        let mut done = self.done.lock();
        loop {
            if let Some(c) = done.remove(&tag) {
                return Some(c);
            }
            if self.cond.wait_for(&mut done, timeout).timed_out() {
                return done.remove(&tag);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.done.lock().len()
    }
}

impl HostSink for HostCollector {
    fn end_req(&self, done: HostCompletion) {
        trace!("host req {} done, failed: {}", done.tag, done.failed);
        let mut map = self.done.lock();
        let prev = map.insert(done.tag, done);
        assert!(prev.is_none(), "host request completed twice");
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reqs_pool::HostKind;
    use std::sync::Arc;
    use std::thread;

    fn completion(tag: u64) -> HostCompletion {
        HostCompletion { tag, kind: HostKind::Write, offset: 0, size: 8, buffers: Vec::new(), failed: false }
    }

    #[test]
    fn waits_for_the_right_tag() {
        let c = Arc::new(HostCollector::new());
        let producer = c.clone();
        let t = thread::spawn(move || {
            for tag in (0..4).rev() {
                producer.end_req(completion(tag));
            }
        });

        assert_eq!(c.wait_for(0).tag, 0);
        t.join().unwrap();
        assert_eq!(c.pending(), 3);
        assert!(c.wait_for_timeout(7, Duration::from_millis(10)).is_none());
    }
}
