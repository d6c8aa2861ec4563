//! Client and server call handles.
//!
//! A client [`Call`] and its paired [`ServerCall`] are two views of one
//! shared RPC record. The record's mutex serializes every state transition
//! of the call and every event it posts, which is what keeps a single
//! call's completions in the order its operations were started.
//!
//! Lock order is server registration state, then RPC record, then
//! completion queue. Nothing here takes the server lock while holding a
//! record lock.

use crate::completion::{CompletionQueue, EventKind, NewCall, OpStatus, Tag};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::metrics::{CALLS_FINISHED, DEADLINE_EXCEEDED};
use crate::server::Endpoint;
use crate::status::{Code, Status};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of the client side of a call.
///
/// Half-close (`writes_done`) is tracked separately since it can happen
/// before or after initial metadata arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created by a channel, not yet invoked. Metadata may be added.
    Created,
    /// Invoked; possibly still waiting for admission.
    Invoked,
    /// Server initial metadata has been delivered.
    MetadataRead,
    /// A final status exists; no further events are posted.
    Finished,
    /// Released by `destroy`.
    Destroyed,
}

impl ClientState {
    /// Upper-case state name, as reported in `Error::InvalidState`.
    pub fn name(self) -> &'static str {
        match self {
            ClientState::Created => "CREATED",
            ClientState::Invoked => "INVOKED",
            ClientState::MetadataRead => "METADATA_EXCHANGED",
            ClientState::Finished => "FINISHED",
            ClientState::Destroyed => "DESTROYED",
        }
    }
}

/// Lifecycle of the server side of a call. A server handle only exists
/// once the call is paired, so `Created` means "delivered in NEW_CALL".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    /// Bound to a completion queue by `accept`.
    Accepted,
    MetadataSent,
    /// Status written and call torn down.
    Finished,
    Destroyed,
}

impl ServerState {
    pub fn name(self) -> &'static str {
        match self {
            ServerState::Created => "CREATED",
            ServerState::Accepted => "ACCEPTED",
            ServerState::MetadataSent => "METADATA_SENT",
            ServerState::Finished => "FINISHED",
            ServerState::Destroyed => "DESTROYED",
        }
    }
}

/// Flags accepted by metadata and message writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags(u32);

impl WriteFlags {
    pub const BUFFER_HINT: WriteFlags = WriteFlags(0x1);
    pub const NO_COMPRESS: WriteFlags = WriteFlags(0x2);

    pub const fn empty() -> Self {
        WriteFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

/// Where the admission controller currently accounts for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Unsubmitted,
    Pending,
    Active,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritesDone {
    NotCalled,
    /// Requested while the call waits for admission.
    Deferred(Tag),
    Done,
}

struct ClientBinding {
    cq: CompletionQueue,
    metadata_tag: Tag,
    finish_tag: Tag,
}

struct ClientSide {
    state: ClientState,
    binding: Option<ClientBinding>,
    metadata: Metadata,
    invoke_acknowledged: bool,
    metadata_delivered: bool,
    writes_done: WritesDone,
}

struct ServerBinding {
    cq: CompletionQueue,
    finished_tag: Tag,
}

struct ServerSide {
    state: ServerState,
    binding: Option<ServerBinding>,
    metadata: Metadata,
}

pub(crate) struct RpcInner {
    pub(crate) slot: Slot,
    client: ClientSide,
    server: Option<ServerSide>,
    status: Option<Status>,
    endpoint: Option<Endpoint>,
}

/// The record shared by both handles of one RPC.
pub(crate) struct Rpc {
    id: u64,
    method: String,
    authority: String,
    deadline: Instant,
    pub(crate) inner: Mutex<RpcInner>,
}

impl Rpc {
    pub(crate) fn new(method: String, authority: String, deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            method,
            authority,
            deadline,
            inner: Mutex::new(RpcInner {
                slot: Slot::Unsubmitted,
                client: ClientSide {
                    state: ClientState::Created,
                    binding: None,
                    metadata: Metadata::new(),
                    invoke_acknowledged: false,
                    metadata_delivered: false,
                    writes_done: WritesDone::NotCalled,
                },
                server: None,
                status: None,
                endpoint: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Finish the call unilaterally and return its admission slot.
    /// Returns false if the call had already finished.
    pub(crate) fn terminate(self: &Arc<Self>, status: Status) -> bool {
        let endpoint = {
            let mut inner = self.inner.lock();
            if !inner.finish(self.id, status, None) {
                return false;
            }
            inner.endpoint.clone()
        };
        if let Some(endpoint) = endpoint {
            endpoint.release(self);
        }
        true
    }

    /// Called by the deadline sweeper.
    pub(crate) fn expire(self: &Arc<Self>) {
        if self.terminate(Status::deadline_exceeded()) {
            DEADLINE_EXCEEDED.increment();
        }
    }

    /// Build the NEW_CALL payload and bind the server side. The caller
    /// holds the record lock.
    pub(crate) fn pair(self: &Arc<Self>, inner: &mut RpcInner) -> NewCall {
        inner.server = Some(ServerSide {
            state: ServerState::Created,
            binding: None,
            metadata: Metadata::new(),
        });
        tracing::debug!(call = self.id, method = %self.method, "call paired");
        NewCall {
            call: ServerCall { rpc: self.clone() },
            method: self.method.clone(),
            authority: self.authority.clone(),
            deadline: self.deadline,
            metadata: inner.client.metadata.clone(),
        }
    }
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("authority", &self.authority)
            .finish()
    }
}

impl RpcInner {
    pub(crate) fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    pub(crate) fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Post the client completions that were held back until admission.
    pub(crate) fn on_admitted(&mut self) {
        let client = &mut self.client;
        let Some(binding) = &client.binding else {
            return;
        };
        if !client.invoke_acknowledged {
            binding
                .cq
                .post(binding.metadata_tag, EventKind::InvokeAccepted(OpStatus::Ok));
            client.invoke_acknowledged = true;
        }
        if let WritesDone::Deferred(tag) = client.writes_done {
            binding.cq.post(tag, EventKind::WriteAccepted(OpStatus::Ok));
            client.writes_done = WritesDone::Done;
        }
    }

    fn send_initial_metadata(&mut self) {
        let Some(server) = &mut self.server else {
            return;
        };
        server.state = ServerState::MetadataSent;
        let metadata = std::mem::take(&mut server.metadata);

        let client = &mut self.client;
        if let Some(binding) = &client.binding
            && !client.metadata_delivered
        {
            binding
                .cq
                .post(binding.metadata_tag, EventKind::MetadataRead(metadata));
            client.metadata_delivered = true;
            if client.state == ClientState::Invoked {
                client.state = ClientState::MetadataRead;
            }
        }
    }

    /// Move both sides to FINISHED and post every outstanding terminal
    /// event. `status_tag` is the server's status write, if that is what
    /// finished the call.
    fn finish(&mut self, id: u64, status: Status, status_tag: Option<Tag>) -> bool {
        if self.status.is_some() {
            return false;
        }

        let client = &mut self.client;
        if let Some(binding) = &client.binding {
            if !client.invoke_acknowledged {
                binding.cq.post(
                    binding.metadata_tag,
                    EventKind::InvokeAccepted(OpStatus::Error),
                );
                client.invoke_acknowledged = true;
            }
            if let WritesDone::Deferred(tag) = client.writes_done {
                binding.cq.post(tag, EventKind::WriteAccepted(OpStatus::Error));
                client.writes_done = WritesDone::Done;
            }
            if !client.metadata_delivered {
                binding
                    .cq
                    .post(binding.metadata_tag, EventKind::MetadataRead(Metadata::new()));
                client.metadata_delivered = true;
            }
            binding.cq.post(
                binding.finish_tag,
                EventKind::FinishedWithStatus(status.clone()),
            );
        }
        client.state = ClientState::Finished;

        if let Some(server) = &mut self.server {
            if let Some(binding) = &server.binding {
                if let Some(tag) = status_tag {
                    binding.cq.post(tag, EventKind::WriteAccepted(OpStatus::Ok));
                }
                binding.cq.post(binding.finished_tag, EventKind::Finished);
            }
            server.state = ServerState::Finished;
        }

        CALLS_FINISHED.increment();
        tracing::debug!(call = id, status = %status, "call finished");
        self.status = Some(status);
        true
    }

    fn server_state(&self) -> ServerState {
        self.server
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(ServerState::Created)
    }
}

/// Client-side handle of one RPC attempt, created by
/// [`Channel::create_call`](crate::Channel::create_call).
pub struct Call {
    rpc: Arc<Rpc>,
    endpoint: Endpoint,
}

impl Call {
    pub(crate) fn new(rpc: Arc<Rpc>, endpoint: Endpoint) -> Self {
        Self { rpc, endpoint }
    }

    pub fn id(&self) -> u64 {
        self.rpc.id
    }

    pub fn method(&self) -> &str {
        &self.rpc.method
    }

    pub fn authority(&self) -> &str {
        &self.rpc.authority
    }

    pub fn deadline(&self) -> Instant {
        self.rpc.deadline
    }

    pub fn state(&self) -> ClientState {
        self.rpc.inner.lock().client.state
    }

    /// Final status, once the call has finished.
    pub fn status(&self) -> Option<Status> {
        self.rpc.inner.lock().status().cloned()
    }

    /// Attach metadata to be delivered to the server with NEW_CALL.
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        if inner.client.state != ClientState::Created {
            return Err(Error::invalid_state(
                "add_metadata",
                inner.client.state.name(),
            ));
        }
        inner.client.metadata.insert(key, value);
        Ok(())
    }

    /// Start the call.
    ///
    /// `metadata_tag` receives INVOKE_ACCEPTED once the server admits the
    /// call, then METADATA_READ. `finish_tag` receives the terminal
    /// FINISHED_WITH_STATUS.
    pub fn invoke(&self, cq: &CompletionQueue, metadata_tag: Tag, finish_tag: Tag) -> Result<()> {
        {
            let mut inner = self.rpc.inner.lock();
            if inner.client.state != ClientState::Created {
                return Err(Error::invalid_state("invoke", inner.client.state.name()));
            }
            if !cq.is_open() {
                return Err(Error::QueueShutdown);
            }
            inner.client.state = ClientState::Invoked;
            inner.client.binding = Some(ClientBinding {
                cq: cq.clone(),
                metadata_tag,
                finish_tag,
            });
            inner.endpoint = Some(self.endpoint.clone());
        }
        tracing::debug!(call = self.rpc.id, method = %self.rpc.method, "call invoked");
        self.endpoint.deliver(&self.rpc);
        Ok(())
    }

    /// Half-close the call. `tag` receives WRITE_ACCEPTED, deferred until
    /// the call is admitted.
    pub fn writes_done(&self, tag: Tag) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        let client = &mut inner.client;
        match client.state {
            ClientState::Invoked | ClientState::MetadataRead => {}
            state => return Err(Error::invalid_state("writes_done", state.name())),
        }
        if client.writes_done != WritesDone::NotCalled {
            return Err(Error::invalid_state("writes_done", "WRITES_DONE"));
        }
        match &client.binding {
            Some(binding) if client.invoke_acknowledged => {
                binding.cq.post(tag, EventKind::WriteAccepted(OpStatus::Ok));
                client.writes_done = WritesDone::Done;
            }
            _ => client.writes_done = WritesDone::Deferred(tag),
        }
        Ok(())
    }

    /// Finish the call with CANCELLED. A no-op if it already finished.
    pub fn cancel(&self) {
        if self.rpc.terminate(Status::cancelled()) {
            tracing::debug!(call = self.rpc.id, "call cancelled");
        }
    }

    /// Release the call. Only legal once it has finished.
    pub fn destroy(&mut self) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        match inner.client.state {
            ClientState::Finished => {
                inner.client.state = ClientState::Destroyed;
                Ok(())
            }
            state => Err(Error::invalid_state("destroy", state.name())),
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.rpc.id)
            .field("method", &self.rpc.method)
            .field("state", &self.state())
            .finish()
    }
}

/// Server-side handle of a paired call, delivered in NEW_CALL.
pub struct ServerCall {
    rpc: Arc<Rpc>,
}

impl ServerCall {
    pub fn id(&self) -> u64 {
        self.rpc.id
    }

    pub fn method(&self) -> &str {
        &self.rpc.method
    }

    pub fn authority(&self) -> &str {
        &self.rpc.authority
    }

    pub fn deadline(&self) -> Instant {
        self.rpc.deadline
    }

    pub fn state(&self) -> ServerState {
        self.rpc.inner.lock().server_state()
    }

    pub fn status(&self) -> Option<Status> {
        self.rpc.inner.lock().status().cloned()
    }

    /// Attach initial metadata. Legal until initial metadata is ended.
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        let state = inner.server_state();
        if !matches!(state, ServerState::Created | ServerState::Accepted) {
            return Err(Error::invalid_state("add_metadata", state.name()));
        }
        if let Some(server) = &mut inner.server {
            server.metadata.insert(key, value);
        }
        Ok(())
    }

    /// Bind the call to `cq`. `tag` receives FINISHED once the call is
    /// torn down.
    pub fn accept(&self, cq: &CompletionQueue, tag: Tag) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        let state = inner.server_state();
        if state != ServerState::Created {
            return Err(Error::invalid_state("accept", state.name()));
        }
        if !cq.is_open() {
            return Err(Error::QueueShutdown);
        }
        if let Some(server) = &mut inner.server {
            server.state = ServerState::Accepted;
            server.binding = Some(ServerBinding {
                cq: cq.clone(),
                finished_tag: tag,
            });
        }
        tracing::debug!(call = self.rpc.id, "call accepted");
        Ok(())
    }

    /// Complete the initial metadata exchange; the client receives
    /// METADATA_READ.
    pub fn end_initial_metadata(&self, flags: WriteFlags) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        let state = inner.server_state();
        if state != ServerState::Accepted {
            return Err(Error::invalid_state("end_initial_metadata", state.name()));
        }
        inner.send_initial_metadata();
        tracing::trace!(call = self.rpc.id, flags = flags.bits(), "initial metadata sent");
        Ok(())
    }

    /// Write the final status and tear the call down.
    ///
    /// The client receives FINISHED_WITH_STATUS carrying `code` and
    /// `message`; this queue receives WRITE_ACCEPTED on `tag`, then
    /// FINISHED on the accept tag. Initial metadata is sent first if it
    /// was not ended explicitly.
    pub fn start_write_status(
        &self,
        code: Code,
        message: impl Into<String>,
        tag: Tag,
    ) -> Result<()> {
        let endpoint = {
            let mut inner = self.rpc.inner.lock();
            match inner.server_state() {
                ServerState::Accepted => inner.send_initial_metadata(),
                ServerState::MetadataSent => {}
                state => return Err(Error::invalid_state("start_write_status", state.name())),
            }
            inner.finish(self.rpc.id, Status::new(code, message), Some(tag));
            inner.endpoint.clone()
        };
        if let Some(endpoint) = endpoint {
            endpoint.release(&self.rpc);
        }
        Ok(())
    }

    /// Release the server handle. Only legal once the call has finished.
    pub fn destroy(&mut self) -> Result<()> {
        let mut inner = self.rpc.inner.lock();
        let state = inner.server_state();
        if state != ServerState::Finished {
            return Err(Error::invalid_state("destroy", state.name()));
        }
        if let Some(server) = &mut inner.server {
            server.state = ServerState::Destroyed;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("id", &self.rpc.id)
            .field("method", &self.rpc.method)
            .field("state", &self.state())
            .finish()
    }
}
