//! Shared fixtures for the end-to-end tests.
//!
//! `Verifier` collects expected completions and then drains the queue
//! until every expectation has been matched, in any order. Any event that
//! matches no expectation fails the test.

#![allow(dead_code)]

use grpc::{
    Channel, Code, CompletionQueue, Event, EventKind, NewCall, Next, OpStatus, Server,
    ServerConfig, Tag,
};
use std::time::{Duration, Instant};

pub const AUTHORITY: &str = "foo.test.google.com";

pub fn five_seconds_time() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

pub fn tag(value: u64) -> Tag {
    Tag::new(value)
}

pub struct Fixture {
    pub client_cq: CompletionQueue,
    pub server_cq: CompletionQueue,
    pub server: Option<Server>,
    pub channel: Channel,
}

impl Fixture {
    pub fn new(config: ServerConfig) -> Self {
        let client_cq = CompletionQueue::new();
        let server_cq = CompletionQueue::new();
        let server = Server::new(config, server_cq.clone()).unwrap();
        let channel = Channel::new("in-process", server.endpoint(), client_cq.clone());
        Self {
            client_cq,
            server_cq,
            server: Some(server),
            channel,
        }
    }

    pub fn server(&self) -> &Server {
        self.server.as_ref().unwrap()
    }

    /// Shut everything down and check both queues drain cleanly.
    pub fn end_test(mut self) {
        self.channel.destroy();
        let server = self.server.take();
        if let Some(server) = &server {
            server.shutdown();
        }
        self.server_cq.shutdown();
        drain_cq(&self.server_cq);
        if let Some(server) = server {
            server.destroy().unwrap();
        }
        self.client_cq.shutdown();
        drain_cq(&self.client_cq);
        self.client_cq.destroy().unwrap();
        self.server_cq.destroy().unwrap();
    }
}

/// Consume events until the queue reports shutdown.
pub fn drain_cq(cq: &CompletionQueue) {
    loop {
        match cq.next(five_seconds_time()).unwrap() {
            Next::Event(Event {
                kind: EventKind::QueueShutdown,
                ..
            }) => return,
            Next::Event(_) => {}
            Next::Timeout => panic!("queue did not drain"),
        }
    }
}

/// Assert no event is pending on `cq` right now.
pub fn assert_quiet(cq: &CompletionQueue) {
    match cq.next(Instant::now() + Duration::from_millis(20)).unwrap() {
        Next::Timeout => {}
        Next::Event(event) => panic!("unexpected event: {event:?}"),
    }
}

#[derive(Debug)]
pub enum Expect {
    InvokeAccepted(OpStatus),
    WriteAccepted(OpStatus),
    MetadataRead,
    NewCall { method: String },
    ServerShutdown,
    Finished,
    FinishedWithStatus { code: Code, message: String },
}

impl Expect {
    fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (Expect::InvokeAccepted(want), EventKind::InvokeAccepted(got)) => want == got,
            (Expect::WriteAccepted(want), EventKind::WriteAccepted(got)) => want == got,
            (Expect::MetadataRead, EventKind::MetadataRead(_)) => true,
            (Expect::NewCall { method }, EventKind::NewCall(Some(new_call))) => {
                new_call.method == *method && new_call.authority == AUTHORITY
            }
            (Expect::ServerShutdown, EventKind::NewCall(None)) => true,
            (Expect::Finished, EventKind::Finished) => true,
            (Expect::FinishedWithStatus { code, message }, EventKind::FinishedWithStatus(status)) => {
                status.code() == *code && status.message() == message
            }
            _ => false,
        }
    }
}

pub struct Verifier<'a> {
    cq: &'a CompletionQueue,
    expected: Vec<(Tag, Expect)>,
}

impl<'a> Verifier<'a> {
    pub fn new(cq: &'a CompletionQueue) -> Self {
        Self {
            cq,
            expected: Vec::new(),
        }
    }

    pub fn expect(&mut self, tag: Tag, expect: Expect) -> &mut Self {
        self.expected.push((tag, expect));
        self
    }

    pub fn expect_invoke_accepted(&mut self, tag: Tag) -> &mut Self {
        self.expect(tag, Expect::InvokeAccepted(OpStatus::Ok))
    }

    pub fn expect_write_accepted(&mut self, tag: Tag) -> &mut Self {
        self.expect(tag, Expect::WriteAccepted(OpStatus::Ok))
    }

    pub fn expect_metadata_read(&mut self, tag: Tag) -> &mut Self {
        self.expect(tag, Expect::MetadataRead)
    }

    pub fn expect_new_call(&mut self, tag: Tag, method: &str) -> &mut Self {
        self.expect(
            tag,
            Expect::NewCall {
                method: method.to_string(),
            },
        )
    }

    pub fn expect_finished(&mut self, tag: Tag) -> &mut Self {
        self.expect(tag, Expect::Finished)
    }

    pub fn expect_finished_with_status(&mut self, tag: Tag, code: Code, message: &str) -> &mut Self {
        self.expect(
            tag,
            Expect::FinishedWithStatus {
                code,
                message: message.to_string(),
            },
        )
    }

    /// Drain until every expectation matched. Returns the matched events
    /// in the order they arrived.
    pub fn verify(&mut self) -> Vec<Event> {
        let mut seen = Vec::new();
        while !self.expected.is_empty() {
            let event = match self.cq.next(five_seconds_time()).unwrap() {
                Next::Event(event) => event,
                Next::Timeout => panic!("timed out waiting for {:?}", self.expected),
            };
            let pos = self
                .expected
                .iter()
                .position(|(tag, expect)| event.tag == Some(*tag) && expect.matches(&event.kind));
            match pos {
                Some(pos) => {
                    self.expected.remove(pos);
                    seen.push(event);
                }
                None => panic!(
                    "unexpected event {:?}, still expecting {:?}",
                    event, self.expected
                ),
            }
        }
        seen
    }
}

/// Pull the NEW_CALL payload out of a verified batch.
pub fn take_new_call(events: &mut Vec<Event>) -> NewCall {
    let pos = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::NewCall(Some(_))))
        .expect("no NEW_CALL in batch");
    events.remove(pos).into_new_call().unwrap()
}
