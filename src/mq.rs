//! Per-unit queues sharing one ticket table, so that items with the same
//! ordering key leave in the order they came in no matter which unit they
//! are queued under.

use std::collections::{HashMap, VecDeque};

use crate::config::{Lpa, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

struct Item<T> {
    unit: UnitId,
    key: Option<Lpa>,
    tag: u64,
    locked: bool,
    payload: Option<T>,
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    /// Tag currently allowed to run.
    cur: u64,
    /// Last tag handed out.
    max: u64,
}

pub struct PriorityMultiQueue<T> {
    items: HashMap<ItemId, Item<T>>,
    queues: Vec<VecDeque<ItemId>>,
    tickets: HashMap<Lpa, Ticket>,
    next_id: u64,
}

impl<T> PriorityMultiQueue<T> {
    pub fn new(nr_units: usize) -> Self {
        PriorityMultiQueue {
            items: HashMap::new(),
            queues: (0..nr_units).map(|_| VecDeque::new()).collect(),
            tickets: HashMap::new(),
            next_id: 0,
        }
    }

    /// Queue `payload` under `unit`. An item enqueued without payload holds its
    /// place in the key's order until `fill` gives it one.
    pub fn enqueue(&mut self, unit: UnitId, key: Option<Lpa>, payload: Option<T>) -> ItemId {
        assert!(unit < self.queues.len(), "unit {} out of range", unit);

        let tag = match key {
            Some(key) => {
                let t = self.tickets.entry(key).or_insert(Ticket { cur: 1, max: 0 });
                t.max += 1;
                t.max
            }
            None => 0,
        };

        let id = ItemId(self.next_id);
        self.next_id += 1;
        self.items.insert(id, Item { unit, key, tag, locked: false, payload });
        self.queues[unit].push_back(id);
        id
    }

    fn is_eligible(&self, item: &Item<T>) -> bool {
        if item.locked || item.payload.is_none() {
            return false;
        }
        match item.key {
            Some(key) => self.tickets.get(&key).map_or(false, |t| t.cur == item.tag),
            None => true,
        }
    }

    /// Take the first item of `unit` that may run now. The item stays queued,
    /// locked, until `remove`.
    pub fn dequeue(&mut self, unit: UnitId) -> Option<(ItemId, T)> {
        let id = *self.queues[unit].iter().find(|id| self.is_eligible(&self.items[*id]))?;

        let item = self.items.get_mut(&id)?;
        item.locked = true;
        item.payload.take().map(|p| (id, p))
    }

    pub fn fill(&mut self, id: ItemId, payload: T) {
        let item = match self.items.get_mut(&id) {
            Some(item) => item,
            None => panic!("fill of unknown queue item {:?}", id),
        };
        assert!(item.payload.is_none() && !item.locked, "queue item {:?} filled twice", id);
        item.payload = Some(payload);
    }

    /// Drop a finished item and let the next item of its key run.
    pub fn remove(&mut self, id: ItemId) {
        let item = match self.items.remove(&id) {
            Some(item) => item,
            None => panic!("completion for unknown queue item {:?}", id),
        };

        let q = &mut self.queues[item.unit];
        match q.iter().position(|&i| i == id) {
            Some(pos) => {
                q.remove(pos);
            }
            None => panic!("queue item {:?} is missing from unit {}", id, item.unit),
        }

        if let Some(key) = item.key {
            let t = match self.tickets.get_mut(&key) {
                Some(t) => t,
                None => panic!("no ticket record for key {}", key),
            };
            assert_eq!(t.cur, item.tag, "key {} finished out of order", key);
            if t.cur == t.max {
                self.tickets.remove(&key);
            } else {
                t.cur += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unit_len(&self, unit: UnitId) -> usize {
        self.queues[unit].len()
    }

    pub fn nr_units(&self) -> usize {
        self.queues.len()
    }

    pub fn nr_tickets(&self) -> usize {
        self.tickets.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn same_key_is_ordered_across_units() {
        let mut q = PriorityMultiQueue::new(2);
        let a = q.enqueue(1, Some(5), Some("a"));
        let b = q.enqueue(0, Some(5), Some("b"));

        // b sits first in unit 0 but must wait for a
        assert!(q.dequeue(0).is_none());
        assert_eq!(q.dequeue(1), Some((a, "a")));
        assert!(q.dequeue(0).is_none());

        q.remove(a);
        assert_eq!(q.dequeue(0), Some((b, "b")));
        q.remove(b);
        assert!(q.is_empty());
        assert_eq!(q.nr_tickets(), 0);
    }

    #[test]
    fn blocked_item_does_not_block_others() {
        let mut q = PriorityMultiQueue::new(1);
        let first = q.enqueue(0, Some(1), Some(1));
        let _second = q.enqueue(0, Some(1), Some(2));
        let other = q.enqueue(0, Some(2), Some(3));

        assert_eq!(q.dequeue(0), Some((first, 1)));
        assert_eq!(q.dequeue(0), Some((other, 3)));
        assert!(q.dequeue(0).is_none());
    }

    #[test]
    fn placeholder_holds_its_turn() {
        let mut q = PriorityMultiQueue::new(2);
        let read = q.enqueue(0, Some(9), Some("read"));
        let write = q.enqueue(1, Some(9), None);
        let later = q.enqueue(1, Some(9), Some("later"));

        assert_eq!(q.dequeue(0), Some((read, "read")));
        q.remove(read);
        assert!(q.dequeue(1).is_none());

        q.fill(write, "write");
        assert_eq!(q.dequeue(1), Some((write, "write")));
        assert!(q.dequeue(1).is_none());
        q.remove(write);
        assert_eq!(q.dequeue(1), Some((later, "later")));
    }

    #[test]
    fn unkeyed_items_are_always_eligible() {
        let mut q = PriorityMultiQueue::new(1);
        let _k = q.enqueue(0, Some(3), None);
        let u = q.enqueue(0, None, Some(()));
        assert_eq!(q.dequeue(0), Some((u, ())));
    }

    #[test]
    #[should_panic]
    fn removing_unknown_item_panics() {
        let mut q: PriorityMultiQueue<u8> = PriorityMultiQueue::new(1);
        let a = q.enqueue(0, None, Some(1));
        q.remove(a);
        q.remove(a);
    }

    #[test]
    fn hundred_writes_keep_their_order() {
        let units = 4;
        let mut q = PriorityMultiQueue::new(units);
        let mut rng = SmallRng::seed_from_u64(7);

        for seq in 0..100u64 {
            q.enqueue(rng.gen_range(0..units), Some(42), Some((42u64, seq)));
            q.enqueue(rng.gen_range(0..units), Some(1000 + seq), Some((1000 + seq, 0)));
        }

        let mut in_flight: Vec<Option<ItemId>> = vec![None; units];
        let mut seen = Vec::new();
        let mut others = 0;
        while !q.is_empty() {
            let unit = rng.gen_range(0..units);
            match in_flight[unit].take() {
                Some(id) => q.remove(id),
                None => {
                    if let Some((id, (key, seq))) = q.dequeue(unit) {
                        if key == 42 {
                            seen.push(seq);
                        } else {
                            others += 1;
                        }
                        in_flight[unit] = Some(id);
                    }
                }
            }
        }

        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert_eq!(others, 100);
    }
}
