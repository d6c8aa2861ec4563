//! Stream admission control.
//!
//! The controller bounds how many invocations a server holds active at
//! once. Invocations beyond the cap wait in FIFO order and are promoted as
//! active calls finish. Queuing is backpressure, never rejection.
//!
//! The controller itself is plain data. The server wraps it in the same
//! mutex that guards call registration, so that check-and-admit,
//! enqueue-pending, and release-and-promote form one serialization point:
//! whichever arrival takes the lock first gets a free slot.

use std::collections::VecDeque;

/// Decision for one arriving invocation.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// Admitted immediately; the active count now includes it.
    Admitted(T),
    /// At capacity; parked at the tail of the pending queue.
    Queued { position: usize },
}

/// Active-call accounting with a FIFO of pending invocations.
#[derive(Debug)]
pub struct AdmissionController<T> {
    /// `None` means unbounded.
    capacity: Option<usize>,
    active: usize,
    pending: VecDeque<T>,
}

impl<T> AdmissionController<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            active: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn has_room(&self) -> bool {
        self.capacity.is_none_or(|cap| self.active < cap)
    }

    /// Admit `item` if a slot is free, otherwise queue it.
    ///
    /// Pending items are always served first, so a new arrival never
    /// overtakes one already waiting.
    pub fn arrive(&mut self, item: T) -> Admission<T> {
        if self.pending.is_empty() && self.has_room() {
            self.active += 1;
            Admission::Admitted(item)
        } else {
            self.pending.push_back(item);
            Admission::Queued {
                position: self.pending.len() - 1,
            }
        }
    }

    /// Return one active slot and promote the head of the pending queue
    /// into it, if any.
    pub fn release(&mut self) -> Option<T> {
        debug_assert!(self.active > 0, "release without an active call");
        self.active = self.active.saturating_sub(1);
        if self.has_room()
            && let Some(next) = self.pending.pop_front()
        {
            self.active += 1;
            return Some(next);
        }
        None
    }

    /// Remove the first pending item matching `pred` without touching the
    /// active count. Used when a queued invocation finishes before it was
    /// admitted.
    pub fn withdraw(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let pos = self.pending.iter().position(pred)?;
        self.pending.remove(pos)
    }

    /// Remove every pending item, e.g. on server shutdown.
    pub fn drain_pending(&mut self) -> Vec<T> {
        self.pending.drain(..).collect()
    }

    /// Give back `n` active slots without promoting anything. Used at
    /// shutdown, after the pending queue has been drained.
    pub fn forfeit(&mut self, n: usize) {
        debug_assert!(n <= self.active);
        self.active = self.active.saturating_sub(n);
    }
}
