use parking_lot::{Condvar, Mutex};
use rand::{Rng, rngs::StdRng};

use crate::{Result, TrainErr};

struct State<T> {
    items: Vec<T>,
    producers: usize,
    closed: bool,
    error: Option<TrainErr>,
    rng: StdRng,
}

/// A bounded queue shared by many producer threads and one consumer that dequeues items in
/// random order.
///
/// Producers block while the queue is full. The consumer blocks until at least
/// `min_after_dequeue + n` items are buffered, unless every producer is done, in which case the
/// remaining items are handed out and a final batch may be partial.
pub struct ShuffleQueue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    min_after_dequeue: usize,
}

impl<T> ShuffleQueue<T> {
    /// Creates a new `ShuffleQueue`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of buffered items.
    /// * `min_after_dequeue` - The amount of items kept buffered to mix with, while producers run.
    /// * `producers` - The amount of producers that will call `producer_done`.
    /// * `rng` - The source of the dequeue order.
    pub fn new(capacity: usize, min_after_dequeue: usize, producers: usize, rng: StdRng) -> Self {
        Self {
            state: Mutex::new(State {
                items: Vec::with_capacity(capacity),
                producers,
                closed: false,
                error: None,
                rng,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
            min_after_dequeue,
        }
    }

    /// Enqueues an item, blocking while the queue is full.
    ///
    /// # Returns
    /// `false` if the queue was closed and the item dropped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();

        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }

        if state.closed {
            return false;
        }

        state.items.push(item);
        self.not_empty.notify_one();
        true
    }

    /// Signals that one producer won't push anymore.
    pub fn producer_done(&self) {
        let mut state = self.state.lock();
        state.producers = state.producers.saturating_sub(1);
        self.not_empty.notify_all();
    }

    /// Closes the queue with an error, which is returned by the next dequeue.
    pub fn fail(&self, err: TrainErr) {
        let mut state = self.state.lock();
        state.error.get_or_insert(err);
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Closes the queue, dropping buffered items and waking every blocked thread.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Dequeues up to `n` items in random order.
    ///
    /// # Returns
    /// `Ok(None)` once the queue is closed or drained with no producer left, or the error a
    /// producer failed with.
    pub fn dequeue_many(&self, n: usize) -> Result<Option<Vec<T>>> {
        let mut state = self.state.lock();

        loop {
            if let Some(err) = state.error.take() {
                return Err(err);
            }

            if state.closed {
                return Ok(None);
            }

            let done = state.producers == 0;
            if state.items.len() >= self.min_after_dequeue + n || (done && !state.items.is_empty())
            {
                break;
            }

            if done {
                return Ok(None);
            }

            self.not_empty.wait(&mut state);
        }

        let take = n.min(state.items.len());
        let mut batch = Vec::with_capacity(take);
        let State { items, rng, .. } = &mut *state;

        for _ in 0..take {
            let i = rng.random_range(0..items.len());
            batch.push(items.swap_remove(i));
        }

        self.not_full.notify_all();
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc, thread};

    use rand::SeedableRng;

    use super::*;

    fn queue(capacity: usize, min: usize, producers: usize) -> Arc<ShuffleQueue<usize>> {
        Arc::new(ShuffleQueue::new(capacity, min, producers, StdRng::seed_from_u64(7)))
    }

    #[test]
    fn every_item_is_dequeued_once_with_a_partial_tail() {
        let q = queue(8, 4, 2);

        let handles: Vec<_> = (0..2)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        q.push(p * 100 + i);
                    }
                    q.producer_done();
                })
            })
            .collect();

        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        while let Some(batch) = q.dequeue_many(4).unwrap() {
            sizes.push(batch.len());
            seen.extend(batch);
        }

        for h in handles {
            h.join().unwrap();
        }

        seen.sort();
        let expected: Vec<_> = (0..25).chain(100..125).collect();
        assert_eq!(seen, expected);
        assert_eq!(sizes.iter().filter(|&&s| s < 4).count(), 1);
        assert_eq!(sizes.last(), Some(&2));
    }

    #[test]
    fn producer_failures_reach_the_consumer() {
        let q = queue(4, 0, 1);
        q.fail(TrainErr::Io(io::Error::other("corrupt file")));

        assert!(q.dequeue_many(1).is_err());
        assert!(q.dequeue_many(1).unwrap().is_none());
    }

    #[test]
    fn closing_unblocks_producers() {
        let q = queue(1, 0, 1);
        assert!(q.push(1));

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2))
        };

        q.close();
        assert!(!producer.join().unwrap());
        assert!(q.is_closed());
    }
}
