//! Deadline enforcement.
//!
//! A single process-wide sweeper thread keeps a min-heap of call deadlines
//! and finishes each expired call with DEADLINE_EXCEEDED. Entries hold the
//! call weakly. A call holding a server slot stays referenced by the server
//! until it finishes; any other call whose handles are all gone is skipped,
//! and the heap is purged of such entries once it grows past a threshold.

use crate::call::Rpc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Instant;

const MIN_PURGE_THRESHOLD: usize = 1024;

struct Entry {
    deadline: Instant,
    id: u64,
    rpc: Weak<Rpc>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

struct Timers {
    heap: BinaryHeap<Reverse<Entry>>,
    purge_at: usize,
}

struct Sweeper {
    timers: Mutex<Timers>,
    wakeup: Condvar,
}

static SWEEPER: OnceLock<Arc<Sweeper>> = OnceLock::new();

fn sweeper() -> &'static Arc<Sweeper> {
    SWEEPER.get_or_init(|| {
        let sweeper = Arc::new(Sweeper {
            timers: Mutex::new(Timers {
                heap: BinaryHeap::new(),
                purge_at: MIN_PURGE_THRESHOLD,
            }),
            wakeup: Condvar::new(),
        });
        let worker = sweeper.clone();
        thread::Builder::new()
            .name("grpc-deadline".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn deadline thread");
        sweeper
    })
}

/// Arrange for `rpc` to be finished with DEADLINE_EXCEEDED at its deadline
/// unless it finishes first.
pub(crate) fn schedule(rpc: &Arc<Rpc>) {
    let sweeper = sweeper();
    let mut timers = sweeper.timers.lock();

    if timers.heap.len() >= timers.purge_at {
        timers.heap.retain(|Reverse(e)| e.rpc.strong_count() > 0);
        timers.purge_at = (timers.heap.len() * 2).max(MIN_PURGE_THRESHOLD);
        tracing::trace!(remaining = timers.heap.len(), "purged deadline heap");
    }

    let deadline = rpc.deadline();
    let earliest = timers
        .heap
        .peek()
        .is_none_or(|Reverse(head)| deadline < head.deadline);
    timers.heap.push(Reverse(Entry {
        deadline,
        id: rpc.id(),
        rpc: Arc::downgrade(rpc),
    }));
    if earliest {
        sweeper.wakeup.notify_one();
    }
}

impl Sweeper {
    fn run(&self) {
        let mut timers = self.timers.lock();
        loop {
            let next = timers.heap.peek().map(|Reverse(e)| e.deadline);
            match next {
                None => self.wakeup.wait(&mut timers),
                Some(deadline) if deadline <= Instant::now() => {
                    let Some(Reverse(entry)) = timers.heap.pop() else {
                        continue;
                    };
                    if let Some(rpc) = entry.rpc.upgrade() {
                        MutexGuard::unlocked(&mut timers, || rpc.expire());
                    }
                }
                Some(deadline) => {
                    self.wakeup.wait_until(&mut timers, deadline);
                }
            }
        }
    }
}
