//! Completion queues: tagged, ordered event mailboxes.
//!
//! Every asynchronous outcome of the engine is delivered as an [`Event`]
//! on a [`CompletionQueue`]. The tag attached to an event is the opaque
//! token the caller supplied when it started the operation.
//!
//! A queue goes through three phases:
//!
//! - open: producers may enqueue, consumers block in [`CompletionQueue::next`]
//! - shutting down: enqueue fails, consumers keep draining prior events
//! - drained: exactly one `QueueShutdown` event has been handed out and
//!   every later `next` fails with [`Error::QueueDrained`]

use crate::call::ServerCall;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::metrics::{CQ_EVENTS_DROPPED, CQ_EVENTS_POSTED};
use crate::status::Status;

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Opaque correlation token chosen by the caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    /// Create a tag from a caller-chosen value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The value the tag was created with.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Outcome of an operation whose completion carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation took effect.
    Ok,
    /// The call finished before the operation could take effect.
    Error,
}

/// Payload of a NEW_CALL event.
#[derive(Debug)]
pub struct NewCall {
    /// Server-side handle of the paired call.
    pub call: ServerCall,
    /// Fully qualified method name, e.g. `/foo`.
    pub method: String,
    pub authority: String,
    /// Absolute deadline set by the client.
    pub deadline: Instant,
    /// Metadata the client attached before invoking.
    pub metadata: Metadata,
}

/// The kind-specific part of an event.
#[derive(Debug)]
pub enum EventKind {
    /// The invocation was admitted, or `Error` if the call finished first.
    InvokeAccepted(OpStatus),
    /// Completion of `writes_done` or of a status write.
    WriteAccepted(OpStatus),
    /// Initial metadata from the server; empty if the call finished
    /// without sending any.
    MetadataRead(Metadata),
    /// `None` completes a registration that was outstanding at server
    /// shutdown.
    NewCall(Option<NewCall>),
    /// The server side of an accepted call was torn down.
    Finished,
    /// Final status, delivered on the client's finish tag.
    FinishedWithStatus(Status),
    /// Terminal event of a drained queue.
    QueueShutdown,
}

impl EventKind {
    /// Upper-case event name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::InvokeAccepted(_) => "INVOKE_ACCEPTED",
            EventKind::WriteAccepted(_) => "WRITE_ACCEPTED",
            EventKind::MetadataRead(_) => "METADATA_READ",
            EventKind::NewCall(_) => "NEW_CALL",
            EventKind::Finished => "FINISHED",
            EventKind::FinishedWithStatus(_) => "FINISHED_WITH_STATUS",
            EventKind::QueueShutdown => "QUEUE_SHUTDOWN",
        }
    }
}

/// A completion event. Only `QueueShutdown` has no tag.
#[derive(Debug)]
pub struct Event {
    pub tag: Option<Tag>,
    pub kind: EventKind,
}

impl Event {
    /// Consume the event, returning the NEW_CALL payload if that is what
    /// it carries.
    pub fn into_new_call(self) -> Option<NewCall> {
        match self.kind {
            EventKind::NewCall(new_call) => new_call,
            _ => None,
        }
    }
}

/// Result of waiting on a queue.
#[derive(Debug)]
pub enum Next {
    Event(Event),
    /// The deadline passed with nothing to deliver.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    ShuttingDown,
    Drained,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Open => "OPEN",
            Phase::ShuttingDown => "SHUTTING_DOWN",
            Phase::Drained => "DRAINED",
        }
    }
}

struct QueueState {
    events: VecDeque<Event>,
    phase: Phase,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Multi-producer, multi-consumer completion queue.
///
/// Cloning produces another handle to the same queue.
#[derive(Clone)]
pub struct CompletionQueue {
    shared: Arc<Shared>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    phase: Phase::Open,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Append an event. Fails once shutdown has been requested.
    pub fn enqueue(&self, tag: Tag, kind: EventKind) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Open {
            return Err(Error::QueueShutdown);
        }
        tracing::trace!(tag = tag.value(), kind = kind.name(), "posting event");
        state.events.push_back(Event {
            tag: Some(tag),
            kind,
        });
        CQ_EVENTS_POSTED.increment();
        drop(state);
        // pluck waiters share the condvar, so every waiter must re-check
        self.shared.ready.notify_all();
        Ok(())
    }

    /// Engine-internal post. A queue the application already shut down
    /// cannot receive the event, so it is logged and counted instead.
    pub(crate) fn post(&self, tag: Tag, kind: EventKind) {
        let name = kind.name();
        if self.enqueue(tag, kind).is_err() {
            CQ_EVENTS_DROPPED.increment();
            tracing::warn!(
                tag = tag.value(),
                kind = name,
                "dropping event for shut down completion queue"
            );
        }
    }

    /// Block until an event is available, `deadline` passes, or the queue
    /// finishes draining.
    pub fn next(&self, deadline: Instant) -> Result<Next> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(Next::Event(event));
            }
            match state.phase {
                Phase::ShuttingDown => {
                    state.phase = Phase::Drained;
                    return Ok(Next::Event(Event {
                        tag: None,
                        kind: EventKind::QueueShutdown,
                    }));
                }
                Phase::Drained => return Err(Error::QueueDrained),
                Phase::Open => {}
            }
            if Instant::now() >= deadline {
                return Ok(Next::Timeout);
            }
            self.shared.ready.wait_until(&mut state, deadline);
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&self) -> Result<Next> {
        self.next(Instant::now())
    }

    /// Block until an event carrying `tag` is available, leaving the
    /// relative order of other events unchanged.
    ///
    /// Fails with [`Error::QueueShutdown`] if the queue is shutting down
    /// and no such event is present, since none can arrive any more.
    pub fn pluck(&self, tag: Tag, deadline: Instant) -> Result<Next> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(pos) = state.events.iter().position(|e| e.tag == Some(tag))
                && let Some(event) = state.events.remove(pos)
            {
                return Ok(Next::Event(event));
            }
            match state.phase {
                Phase::Open => {}
                Phase::ShuttingDown => return Err(Error::QueueShutdown),
                Phase::Drained => return Err(Error::QueueDrained),
            }
            if Instant::now() >= deadline {
                return Ok(Next::Timeout);
            }
            self.shared.ready.wait_until(&mut state, deadline);
        }
    }

    /// Request shutdown. Already-enqueued events remain deliverable and are
    /// followed by a single `QueueShutdown` event. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Open {
            tracing::debug!(pending = state.events.len(), "completion queue shutting down");
            state.phase = Phase::ShuttingDown;
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    /// True once the terminal `QueueShutdown` event has been delivered.
    pub fn is_drained(&self) -> bool {
        self.shared.state.lock().phase == Phase::Drained
    }

    /// Number of undelivered events.
    pub fn len(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release this handle. Only legal after the shutdown event was
    /// observed.
    pub fn destroy(self) -> Result<()> {
        let phase = self.shared.state.lock().phase;
        if phase != Phase::Drained {
            return Err(Error::invalid_state("destroy", phase.name()));
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.shared.state.lock().phase == Phase::Open
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CompletionQueue")
            .field("phase", &state.phase)
            .field("pending", &state.events.len())
            .finish()
    }
}
