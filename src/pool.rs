use std::collections::VecDeque;

pub type SlotId = usize;

/// Growable pool of reusable objects. Slots are handed out in FIFO order
/// and the pool grows by `increment` instead of blocking when it runs dry.
pub struct ObjectPool<T> {
    slots: Vec<T>,
    in_use: Vec<bool>,
    free: VecDeque<SlotId>,
    increment: usize,
}

impl<T: Default> ObjectPool<T> {
    pub fn new(size: usize, increment: usize) -> Self {
        debug_assert!(increment > 0, "pool cannot grow by zero");

        let mut out = ObjectPool {
            slots: Vec::with_capacity(size),
            in_use: Vec::with_capacity(size),
            free: VecDeque::with_capacity(size),
            increment,
        };
        out.grow(size);
        out
    }

    fn grow(&mut self, n: usize) {
        let start = self.slots.len();
        for id in start..start + n {
            self.slots.push(T::default());
            self.in_use.push(false);
            self.free.push_back(id);
        }
    }

    pub fn acquire(&mut self) -> SlotId {
        let id = loop {
            if let Some(id) = self.free.pop_front() {
                break id;
            }
            debug!("request pool exhausted at {} slots, growing by {}", self.slots.len(), self.increment);
            self.grow(self.increment);
        };
        debug_assert!(!self.in_use[id]);
        self.in_use[id] = true;
        id
    }

    pub fn release(&mut self, id: SlotId) {
        assert!(self.in_use[id], "slot {} released twice", id);
        self.in_use[id] = false;
        self.free.push_back(id);
    }

    pub fn get(&self, id: SlotId) -> &T {
        debug_assert!(self.in_use[id], "slot {} is not in use", id);
        &self.slots[id]
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut T {
        debug_assert!(self.in_use[id], "slot {} is not in use", id);
        &mut self.slots[id]
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn nr_in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
