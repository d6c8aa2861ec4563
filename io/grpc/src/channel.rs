//! Client channels.

use crate::call::{Call, Rpc};
use crate::completion::CompletionQueue;
use crate::deadline;
use crate::error::{Error, Result};
use crate::metrics::CALLS_CREATED;
use crate::server::Endpoint;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

struct ChannelInner {
    target: String,
    endpoint: Endpoint,
    cq: CompletionQueue,
    closed: AtomicBool,
}

/// A client's handle to one server endpoint. Cheap to clone; clones share
/// the same open/closed state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel to `target`, reached through `endpoint`. `cq` is
    /// the queue the channel is associated with; calls may still be
    /// invoked on any queue.
    pub fn new(target: impl Into<String>, endpoint: Endpoint, cq: CompletionQueue) -> Self {
        let target = target.into();
        tracing::debug!(target = %target, "channel created");
        Self {
            inner: Arc::new(ChannelInner {
                target,
                endpoint,
                cq,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.inner.cq
    }

    /// Create a call to `method` on `authority` that expires at `deadline`.
    pub fn create_call(
        &self,
        method: impl Into<String>,
        authority: impl Into<String>,
        deadline: Instant,
    ) -> Result<Call> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let rpc = Rpc::new(method.into(), authority.into(), deadline);
        CALLS_CREATED.increment();
        deadline::schedule(&rpc);
        tracing::trace!(call = rpc.id(), target = %self.inner.target, "call created");
        Ok(Call::new(rpc, self.inner.endpoint.clone()))
    }

    /// Close the channel. Existing calls are unaffected. Idempotent.
    pub fn destroy(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(target = %self.inner.target, "channel destroyed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}
