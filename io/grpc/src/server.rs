//! Server: call registration, pairing, and admission.
//!
//! Inbound invocations reach the server through an [`Endpoint`]. Each one
//! passes the admission controller, then waits (admitted) for a matching
//! [`Server::request_call`] registration. Admission, registration, and
//! release all happen under one mutex, so concurrent invocations and
//! completions see a single order of events.

use crate::admission::{Admission, AdmissionController};
use crate::call::{Rpc, RpcInner, Slot};
use crate::completion::{CompletionQueue, EventKind, Tag};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::metrics::{CALLS_ACTIVE, CALLS_ADMITTED, CALLS_PROMOTED, CALLS_QUEUED};
use crate::status::Status;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

struct Registry {
    admission: AdmissionController<Arc<Rpc>>,
    /// Outstanding `request_call` tags, oldest first.
    requests: VecDeque<Tag>,
    /// Admitted calls waiting for a `request_call`.
    unmatched: VecDeque<Arc<Rpc>>,
    /// Every call holding a slot, keyed by id. Keeps a call alive until it
    /// finishes even after both of its handles are dropped, so its deadline
    /// still fires and the slot comes back.
    active: HashMap<u64, Arc<Rpc>>,
    shutdown: bool,
}

pub(crate) struct ServerShared {
    cq: CompletionQueue,
    config: ServerConfig,
    registry: Mutex<Registry>,
}

impl ServerShared {
    /// Entry point for an invocation delivered by the transport.
    fn arrive(&self, rpc: &Arc<Rpc>) {
        let mut registry = self.registry.lock();
        if registry.shutdown {
            drop(registry);
            rpc.terminate(Status::unavailable("server shutting down"));
            return;
        }

        let mut call = rpc.inner.lock();
        if call.is_finished() {
            return;
        }
        match registry.admission.arrive(rpc.clone()) {
            Admission::Admitted(_) => {
                CALLS_ADMITTED.increment();
                CALLS_ACTIVE.increment();
                call.slot = Slot::Active;
                registry.active.insert(rpc.id(), rpc.clone());
                tracing::debug!(call = rpc.id(), "call admitted");
                self.on_admitted(&mut registry, rpc, &mut call);
            }
            Admission::Queued { position } => {
                CALLS_QUEUED.increment();
                call.slot = Slot::Pending;
                tracing::debug!(call = rpc.id(), position, "server at capacity, call queued");
            }
        }
    }

    /// Post the held-back client completions and pair with the oldest
    /// registration, or park the call until one arrives.
    fn on_admitted(&self, registry: &mut Registry, rpc: &Arc<Rpc>, call: &mut RpcInner) {
        call.on_admitted();
        match registry.requests.pop_front() {
            Some(tag) => {
                let new_call = rpc.pair(call);
                self.cq.post(tag, EventKind::NewCall(Some(new_call)));
            }
            None => registry.unmatched.push_back(rpc.clone()),
        }
    }

    /// Return the slot held by `rpc`, which has just finished, and promote
    /// the next queued invocation. Idempotent per call.
    fn release(&self, rpc: &Arc<Rpc>) {
        let mut registry = self.registry.lock();
        let slot = {
            let mut call = rpc.inner.lock();
            std::mem::replace(&mut call.slot, Slot::Released)
        };
        match slot {
            Slot::Active => {
                registry.active.remove(&rpc.id());
                registry.unmatched.retain(|r| !Arc::ptr_eq(r, rpc));
                CALLS_ACTIVE.decrement();
                self.promote(&mut registry);
            }
            Slot::Pending => {
                registry.admission.withdraw(|r| Arc::ptr_eq(r, rpc));
                tracing::debug!(call = rpc.id(), "queued call withdrawn");
            }
            Slot::Unsubmitted | Slot::Released => {}
        }
    }

    fn promote(&self, registry: &mut Registry) {
        let mut next = registry.admission.release();
        while let Some(rpc) = next {
            let mut call = rpc.inner.lock();
            if call.is_finished() {
                // finished while queued; its own release will find the
                // slot already returned
                call.slot = Slot::Released;
                drop(call);
                next = registry.admission.release();
                continue;
            }
            CALLS_PROMOTED.increment();
            CALLS_ACTIVE.increment();
            call.slot = Slot::Active;
            registry.active.insert(rpc.id(), rpc.clone());
            tracing::debug!(call = rpc.id(), "queued call promoted");
            self.on_admitted(registry, &rpc, &mut call);
            return;
        }
    }
}

/// In-process transport endpoint through which channels reach a server.
///
/// Holds the server weakly: invocations delivered after the server is
/// gone finish with UNAVAILABLE.
#[derive(Clone)]
pub struct Endpoint {
    server: Weak<ServerShared>,
}

impl Endpoint {
    pub(crate) fn deliver(&self, rpc: &Arc<Rpc>) {
        match self.server.upgrade() {
            Some(server) => server.arrive(rpc),
            None => {
                rpc.terminate(Status::unavailable("server unavailable"));
            }
        }
    }

    pub(crate) fn release(&self, rpc: &Arc<Rpc>) {
        if let Some(server) = self.server.upgrade() {
            server.release(rpc);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.server.strong_count() > 0
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Accepts inbound calls and reports them on its completion queue.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server that posts NEW_CALL events to `cq`.
    pub fn new(config: ServerConfig, cq: CompletionQueue) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            max_concurrent_streams = ?config.max_concurrent_streams,
            "server created"
        );
        Ok(Self {
            shared: Arc::new(ServerShared {
                cq,
                registry: Mutex::new(Registry {
                    admission: AdmissionController::new(config.max_concurrent_streams),
                    requests: VecDeque::new(),
                    unmatched: VecDeque::new(),
                    active: HashMap::new(),
                    shutdown: false,
                }),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.shared.cq
    }

    /// Endpoint for channels targeting this server.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            server: Arc::downgrade(&self.shared),
        }
    }

    /// Number of admitted, non-terminal calls.
    pub fn active_calls(&self) -> usize {
        self.shared.registry.lock().admission.active()
    }

    /// Number of invocations waiting for capacity.
    pub fn pending_calls(&self) -> usize {
        self.shared.registry.lock().admission.pending()
    }

    /// Register intent to accept the next call. `tag` receives NEW_CALL.
    pub fn request_call(&self, tag: Tag) -> Result<()> {
        let shared = &self.shared;
        let mut registry = shared.registry.lock();
        if registry.shutdown {
            return Err(Error::ServerShutdown);
        }
        while let Some(rpc) = registry.unmatched.pop_front() {
            let mut call = rpc.inner.lock();
            if call.is_finished() {
                continue;
            }
            let new_call = rpc.pair(&mut call);
            shared.cq.post(tag, EventKind::NewCall(Some(new_call)));
            return Ok(());
        }
        registry.requests.push_back(tag);
        Ok(())
    }

    /// Begin graceful shutdown. Paired calls run to completion; everything
    /// else is completed now. Idempotent.
    pub fn shutdown(&self) {
        let (requests, orphans) = {
            let mut registry = self.shared.registry.lock();
            if registry.shutdown {
                return;
            }
            registry.shutdown = true;

            let requests: Vec<Tag> = registry.requests.drain(..).collect();
            let mut orphans = registry.admission.drain_pending();
            let unmatched: Vec<_> = registry.unmatched.drain(..).collect();
            registry.admission.forfeit(unmatched.len());
            for rpc in &unmatched {
                registry.active.remove(&rpc.id());
                CALLS_ACTIVE.decrement();
            }
            orphans.extend(unmatched);
            for rpc in &orphans {
                rpc.inner.lock().slot = Slot::Released;
            }
            (requests, orphans)
        };

        tracing::debug!(
            requests = requests.len(),
            orphans = orphans.len(),
            "server shutting down"
        );
        for tag in requests {
            self.shared.cq.post(tag, EventKind::NewCall(None));
        }
        for rpc in orphans {
            rpc.terminate(Status::unavailable("server shutting down"));
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.registry.lock().shutdown
    }

    /// Release the server. Requires a prior [`shutdown`](Self::shutdown)
    /// and a drained server completion queue.
    pub fn destroy(self) -> Result<()> {
        if !self.is_shutdown() {
            return Err(Error::invalid_state("destroy", "SERVING"));
        }
        if !self.shared.cq.is_drained() {
            return Err(Error::invalid_state("destroy", "DRAINING"));
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.shared.config)
            .field("active", &self.active_calls())
            .field("pending", &self.pending_calls())
            .finish()
    }
}
