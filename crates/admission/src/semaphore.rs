//! First-come first-served counting semaphore with timed acquisition.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    permits: u64,
    next_ticket: u64,
    queue: VecDeque<u64>,
}

/// Counting semaphore that grants permits strictly in arrival order.
///
/// A waiter asking for many permits blocks every later waiter, even ones
/// whose smaller requests could be satisfied right away.
#[derive(Debug)]
pub struct FairSemaphore {
    state: Mutex<State>,
    changed: Condvar,
}

impl FairSemaphore {
    #[must_use]
    pub fn new(permits: u64) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                next_ticket: 0,
                queue: VecDeque::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.state.lock().permits
    }

    /// Number of threads waiting for permits.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Takes `n` permits, waiting at most `timeout` for them.
    ///
    /// A zero timeout never waits and fails if another thread is already
    /// queued. Returns `false` with no permits held on timeout.
    pub fn try_acquire(&self, n: u64, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.queue.is_empty() && state.permits >= n {
            state.permits -= n;
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now().checked_add(timeout);
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            let at_head = state.queue.front() == Some(&ticket);
            if at_head && state.permits >= n {
                state.queue.pop_front();
                state.permits -= n;
                // the next waiter may fit in what is left
                self.changed.notify_all();
                return true;
            }

            let timed_out = match deadline {
                Some(deadline) => self.changed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.changed.wait(&mut state);
                    false
                }
            };
            if timed_out {
                let at_head = state.queue.front() == Some(&ticket);
                if at_head && state.permits >= n {
                    state.queue.pop_front();
                    state.permits -= n;
                    self.changed.notify_all();
                    return true;
                }
                state.queue.retain(|&queued| queued != ticket);
                if at_head {
                    self.changed.notify_all();
                }
                return false;
            }
        }
    }

    /// Returns `n` permits and wakes waiters.
    pub fn release(&self, n: u64) {
        let mut state = self.state.lock();
        state.permits += n;
        drop(state);
        self.changed.notify_all();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn wait_for_queue(semaphore: &FairSemaphore, len: usize) {
        while semaphore.queued() != len {
            thread::yield_now();
        }
    }

    #[test]
    fn test_immediate_acquire_and_release() {
        let semaphore = FairSemaphore::new(10);
        assert!(semaphore.try_acquire(4, Duration::ZERO));
        assert!(semaphore.try_acquire(6, Duration::ZERO));
        assert!(!semaphore.try_acquire(1, Duration::ZERO));
        assert_eq!(semaphore.available(), 0);
        semaphore.release(10);
        assert_eq!(semaphore.available(), 10);
    }

    #[test]
    fn test_timeout_leaves_no_trace() {
        let semaphore = FairSemaphore::new(1);
        assert!(!semaphore.try_acquire(2, Duration::from_millis(20)));
        assert_eq!(semaphore.available(), 1);
        assert_eq!(semaphore.queued(), 0);
    }

    #[test]
    fn test_waiter_is_woken_by_release() {
        let semaphore = Arc::new(FairSemaphore::new(0));
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.try_acquire(3, Duration::from_secs(10)))
        };
        wait_for_queue(&semaphore, 1);
        semaphore.release(3);
        assert!(waiter.join().unwrap());
        assert_eq!(semaphore.available(), 0);
    }

    #[test]
    fn test_zero_timeout_respects_queue() {
        let semaphore = Arc::new(FairSemaphore::new(1));
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.try_acquire(2, Duration::from_secs(10)))
        };
        wait_for_queue(&semaphore, 1);
        // a permit is free, but the queued waiter comes first
        assert!(!semaphore.try_acquire(1, Duration::ZERO));
        semaphore.release(1);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_waiters_are_served_in_order() {
        let semaphore = Arc::new(FairSemaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let waiters: Vec<_> = (0..4)
            .map(|id| {
                let waiter_semaphore = Arc::clone(&semaphore);
                let order = Arc::clone(&order);
                let waiter = thread::spawn(move || {
                    assert!(waiter_semaphore.try_acquire(1, Duration::from_secs(10)));
                    order.lock().push(id);
                });
                wait_for_queue(&semaphore, id + 1);
                waiter
            })
            .collect();

        for _ in 0..4 {
            let served = order.lock().len();
            semaphore.release(1);
            while order.lock().len() == served {
                thread::yield_now();
            }
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*order.lock(), [0, 1, 2, 3]);
    }

    #[test]
    fn test_abandoned_head_unblocks_next() {
        let semaphore = Arc::new(FairSemaphore::new(1));
        let big = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.try_acquire(5, Duration::from_millis(50)))
        };
        wait_for_queue(&semaphore, 1);
        let small = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.try_acquire(1, Duration::from_secs(10)))
        };
        assert!(!big.join().unwrap());
        assert!(small.join().unwrap());
        assert_eq!(semaphore.available(), 0);
    }
}
