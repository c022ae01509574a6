//! Cooperative counting semaphore with strict FIFO hand-off.
//!
//! A released slot goes directly to the oldest waiter, so admission order is
//! the arrival order and never depends on scheduler timing. Newcomers queue
//! behind existing waiters even when a slot looks free.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct State {
    in_flight: usize,
    next_ticket: u64,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

pub struct Semaphore {
    max: usize,
    state: Mutex<State>,
}

impl Semaphore {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(State {
                in_flight: 0,
                next_ticket: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Waits for a slot. Dropping the returned future before it completes
    /// gives up the place in the queue (or passes on a slot already handed
    /// over).
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.wait_for_slot().await;
        SemaphorePermit { semaphore: self }
    }

    pub async fn acquire_owned(self: &Arc<Self>) -> OwnedSemaphorePermit {
        self.wait_for_slot().await;
        OwnedSemaphorePermit {
            semaphore: self.clone(),
        }
    }

    async fn wait_for_slot(&self) {
        let mut pending = {
            let mut state = self.state.lock();
            if state.waiters.is_empty() && state.in_flight < self.max {
                state.in_flight += 1;
                return;
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((ticket, tx));
            PendingAcquire {
                semaphore: self,
                ticket,
                rx,
                settled: false,
            }
        };
        // The sender is only ever consumed by `release`, which hands us the
        // slot; it cannot be dropped unsent while we are queued.
        let _ = (&mut pending.rx).await;
        pending.settled = true;
    }

    /// Frees a slot, handing it to the oldest waiter if there is one.
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some((_, waiter)) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// Queue registration of an in-progress `acquire`. Holds the receiver so it
/// outlives the cleanup in `drop`.
struct PendingAcquire<'a> {
    semaphore: &'a Semaphore,
    ticket: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let still_queued = {
            let mut state = self.semaphore.state.lock();
            match state.waiters.iter().position(|(t, _)| *t == self.ticket) {
                Some(index) => {
                    state.waiters.remove(index);
                    true
                }
                None => false,
            }
        };
        if !still_queued {
            // A slot was handed to us after all; pass it on.
            self.semaphore.release();
        }
    }
}

pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

pub struct OwnedSemaphorePermit {
    semaphore: Arc<Semaphore>,
}

impl Drop for OwnedSemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
