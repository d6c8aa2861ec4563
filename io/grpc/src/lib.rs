//! grpc - completion-queue driven RPC call engine.
//!
//! Clients create calls on a [`Channel`] and servers receive them from a
//! [`Server`]; both sides observe progress by draining tagged events from
//! a [`CompletionQueue`]. There is no network transport: a channel reaches
//! its server through an in-process [`Endpoint`].
//!
//! # Admission
//!
//! A server may cap how many calls it holds active at once
//! ([`ServerConfig::max_concurrent_streams`]). Invocations beyond the cap
//! are queued in arrival order and admitted as active calls finish. A
//! queued invocation sees no INVOKE_ACCEPTED until it is admitted, and the
//! server sees no NEW_CALL for it.
//!
//! # Example
//!
//! ```
//! use grpc::{Channel, Code, CompletionQueue, Server, ServerConfig, Tag};
//! use std::time::{Duration, Instant};
//!
//! let client_cq = CompletionQueue::new();
//! let server_cq = CompletionQueue::new();
//! let server = Server::new(ServerConfig::default(), server_cq.clone()).unwrap();
//! let channel = Channel::new("in-process", server.endpoint(), client_cq.clone());
//!
//! server.request_call(Tag::new(100)).unwrap();
//! let deadline = Instant::now() + Duration::from_secs(5);
//! let call = channel.create_call("/foo", "example.test", deadline).unwrap();
//! call.invoke(&client_cq, Tag::new(2), Tag::new(3)).unwrap();
//!
//! let new_call = server_cq.pluck(Tag::new(100), deadline).unwrap();
//! let grpc::Next::Event(event) = new_call else { panic!("timed out") };
//! let new_call = event.into_new_call().unwrap();
//! new_call.call.accept(&server_cq, Tag::new(102)).unwrap();
//! new_call
//!     .call
//!     .start_write_status(Code::Unimplemented, "xyz", Tag::new(5))
//!     .unwrap();
//! ```

mod admission;
mod call;
mod channel;
mod completion;
mod config;
mod deadline;
mod error;
mod metadata;
mod server;
mod status;

pub mod metrics;

pub use admission::{Admission, AdmissionController};
pub use call::{Call, ClientState, ServerCall, ServerState, WriteFlags};
pub use channel::Channel;
pub use completion::{CompletionQueue, Event, EventKind, NewCall, Next, OpStatus, Tag};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use server::{Endpoint, Server};
pub use status::{Code, Status};
