use std::{
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::QueueError;

/// Single slot in the ring. `UnsafeCell`-free because each slot is only ever
/// touched by the one producer that reserved it and the one consumer that
/// later claims it; the `maxRead`/`read` cursors make that handoff exclusive.
struct Slot<T> {
    value: std::cell::UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Sync for Slot<T> {}

/// Bounded multi-producer multi-consumer queue used for cross-thread message
/// handoff (`WorkThread`'s inbox).
///
/// `N` must be a power of two. Implements the four-cursor algorithm from
/// spec.md §4.2: producers CAS-advance `write` to reserve a slot, store into
/// it, then CAS-advance `maxRead` in publication order so a producer that
/// reserved an earlier slot but hasn't stored yet cannot be jumped over;
/// consumers CAS-advance `read` up to `maxRead`.
pub struct LockFreeQueue<T, const N: usize> {
    slots: Box<[Slot<T>]>,
    write: AtomicUsize,
    read: AtomicUsize,
    max_read: AtomicUsize,
    count: AtomicUsize,
}

impl<T, const N: usize> Default for LockFreeQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> LockFreeQueue<T, N> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "LockFreeQueue capacity must be a power of two");
        let slots = (0..N)
            .map(|_| Slot { value: std::cell::UnsafeCell::new(MaybeUninit::uninit()) })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LockFreeQueue {
            slots,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            max_read: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn mask(v: usize) -> usize {
        v & (N - 1)
    }

    /// Number of items currently published and not yet popped. Only reflects
    /// committed pushes, so it can briefly lag a concurrent producer that has
    /// reserved a slot but not yet published it.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Reserve a slot, store `item` into it, then publish. Fails with
    /// `QueueError::Full` when the ring is at (or very near) capacity; the
    /// `count > N/2` guard in the fullness check tolerates the transient gap
    /// between a reservation and its publication without false negatives on
    /// a ring that in fact has room.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        loop {
            let write = self.write.load(Ordering::Acquire);
            let read = self.read.load(Ordering::Acquire);
            if Self::mask(write + 1) == Self::mask(read) && self.count.load(Ordering::Relaxed) > N / 2 {
                return Err(QueueError::Full);
            }
            if self
                .write
                .compare_exchange_weak(write, write + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[Self::mask(write)];
                unsafe {
                    (*slot.value.get()).write(item);
                }
                // Publish in reservation order: spin until every earlier
                // producer has advanced max_read past its own slot.
                while self
                    .max_read
                    .compare_exchange_weak(write, write + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                }
                self.count.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    /// Pop the oldest published item, if any.
    pub fn pop(&self) -> Option<T> {
        loop {
            let read = self.read.load(Ordering::Acquire);
            let max_read = self.max_read.load(Ordering::Acquire);
            if read == max_read {
                return None;
            }
            if self
                .read
                .compare_exchange_weak(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[Self::mask(read)];
                let item = unsafe { (*slot.value.get()).assume_init_read() };
                self.count.fetch_sub(1, Ordering::AcqRel);
                return Some(item);
            }
        }
    }
}

unsafe impl<T: Send, const N: usize> Send for LockFreeQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for LockFreeQueue<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread};

    #[test]
    fn push_pop_single_thread() {
        let q: LockFreeQueue<u32, 8> = LockFreeQueue::new();
        for i in 0..7 {
            q.push(i).unwrap();
        }
        assert_eq!(q.size(), 7);
        for i in 0..7 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn reports_full_when_saturated() {
        let q: LockFreeQueue<u32, 4> = LockFreeQueue::new();
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert!(q.push(3).is_ok());
        assert!(matches!(q.push(4), Err(QueueError::Full)));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(4).is_ok());
    }

    #[test]
    fn multi_producer_multi_consumer_every_item_exactly_once() {
        const N: usize = 4096;
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 20_000;

        let q: Arc<LockFreeQueue<u64, N>> = Arc::new(LockFreeQueue::new());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let base = p as u64 * PER_PRODUCER;
                    for i in 0..PER_PRODUCER {
                        loop {
                            if q.push(base + i).is_ok() {
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let total = PRODUCERS as u64 * PER_PRODUCER;
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match q.pop() {
                            Some(item) => seen.push(item),
                            None => {
                                if seen.len() as u64 >= total / CONSUMERS as u64 + 1 {
                                    break;
                                }
                                std::hint::spin_loop();
                            }
                        }
                        if seen.len() as u64 * CONSUMERS as u64 >= total * 2 {
                            break;
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        // drain whatever is left after producers finish
        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "duplicate item {v}");
            }
        }
        while let Some(v) = q.pop() {
            assert!(all.insert(v), "duplicate item {v}");
        }
        assert_eq!(all.len(), total as usize);
        for p in 0..PRODUCERS {
            for i in 0..PER_PRODUCER {
                assert!(all.contains(&(p as u64 * PER_PRODUCER + i)));
            }
        }
    }
}
