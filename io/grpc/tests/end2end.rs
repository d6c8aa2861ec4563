//! End-to-end request flows between a channel and a server.

mod common;

use common::*;
use grpc::{Code, ServerConfig, ServerState, WriteFlags};
use std::thread;

/// One complete call: invoke, half-close, accept, send metadata, write
/// status.
fn simple_request_body(f: &Fixture) {
    let deadline = five_seconds_time();
    let mut c = f
        .channel
        .create_call("/foo", AUTHORITY, deadline)
        .unwrap();

    c.invoke(&f.client_cq, tag(2), tag(3)).unwrap();
    c.writes_done(tag(4)).unwrap();
    Verifier::new(&f.client_cq)
        .expect_invoke_accepted(tag(2))
        .expect_write_accepted(tag(4))
        .verify();

    f.server().request_call(tag(100)).unwrap();
    let mut events = Verifier::new(&f.server_cq)
        .expect_new_call(tag(100), "/foo")
        .verify();
    let new_call = take_new_call(&mut events);
    assert_eq!(new_call.deadline, deadline);
    let mut s = new_call.call;

    s.accept(&f.server_cq, tag(102)).unwrap();
    s.end_initial_metadata(WriteFlags::empty()).unwrap();
    Verifier::new(&f.client_cq)
        .expect_metadata_read(tag(2))
        .verify();

    s.start_write_status(Code::Unimplemented, "xyz", tag(5))
        .unwrap();
    Verifier::new(&f.client_cq)
        .expect_finished_with_status(tag(3), Code::Unimplemented, "xyz")
        .verify();
    Verifier::new(&f.server_cq)
        .expect_write_accepted(tag(5))
        .expect_finished(tag(102))
        .verify();

    c.destroy().unwrap();
    s.destroy().unwrap();
}

#[test]
fn test_simple_request() {
    let f = Fixture::new(ServerConfig::default());
    simple_request_body(&f);
    assert_eq!(f.server().active_calls(), 0);
    f.end_test();
}

#[test]
fn test_max_concurrent_streams() {
    let f = Fixture::new(ServerConfig::with_max_concurrent_streams(1));

    // the single-stream case still works, twice over
    simple_request_body(&f);
    simple_request_body(&f);

    // start two requests, ensuring the second is not admitted until the
    // first completes
    let deadline = five_seconds_time();
    let c1 = f
        .channel
        .create_call("/alpha", AUTHORITY, deadline)
        .unwrap();
    let c2 = f
        .channel
        .create_call("/beta", AUTHORITY, deadline)
        .unwrap();

    f.server().request_call(tag(100)).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| c1.invoke(&f.client_cq, tag(301), tag(302)).unwrap());
        scope.spawn(|| c2.invoke(&f.client_cq, tag(401), tag(402)).unwrap());
    });
    c1.writes_done(tag(303)).unwrap();
    c2.writes_done(tag(403)).unwrap();

    // exactly one of /alpha or /beta was admitted
    let first = match f.client_cq.next(five_seconds_time()).unwrap() {
        grpc::Next::Event(event) => event,
        grpc::Next::Timeout => panic!("no call admitted"),
    };
    assert_eq!(first.kind.name(), "INVOKE_ACCEPTED");
    let mut live_call = first.tag.unwrap().value() - 1;
    assert!(live_call == 300 || live_call == 400);
    Verifier::new(&f.client_cq)
        .expect_write_accepted(tag(live_call + 3))
        .verify();
    assert_quiet(&f.client_cq);
    assert_eq!(f.server().active_calls(), 1);
    assert_eq!(f.server().pending_calls(), 1);

    let method = |live: u64| if live == 300 { "/alpha" } else { "/beta" };

    let mut events = Verifier::new(&f.server_cq)
        .expect_new_call(tag(100), method(live_call))
        .verify();
    let s1 = take_new_call(&mut events).call;
    assert_quiet(&f.server_cq);

    s1.accept(&f.server_cq, tag(102)).unwrap();
    s1.end_initial_metadata(WriteFlags::empty()).unwrap();
    Verifier::new(&f.client_cq)
        .expect_metadata_read(tag(live_call + 1))
        .verify();

    s1.start_write_status(Code::Unimplemented, "xyz", tag(103))
        .unwrap();
    Verifier::new(&f.server_cq)
        .expect_write_accepted(tag(103))
        .expect_finished(tag(102))
        .verify();

    // first request is finished, the second is admitted now
    let finished = live_call;
    live_call = if live_call == 300 { 400 } else { 300 };
    Verifier::new(&f.client_cq)
        .expect_finished_with_status(tag(finished + 2), Code::Unimplemented, "xyz")
        .expect_invoke_accepted(tag(live_call + 1))
        .expect_write_accepted(tag(live_call + 3))
        .verify();
    assert_eq!(f.server().active_calls(), 1);
    assert_eq!(f.server().pending_calls(), 0);

    f.server().request_call(tag(200)).unwrap();
    let mut events = Verifier::new(&f.server_cq)
        .expect_new_call(tag(200), method(live_call))
        .verify();
    let s2 = take_new_call(&mut events).call;

    s2.accept(&f.server_cq, tag(202)).unwrap();
    s2.end_initial_metadata(WriteFlags::empty()).unwrap();
    Verifier::new(&f.client_cq)
        .expect_metadata_read(tag(live_call + 1))
        .verify();

    s2.start_write_status(Code::Unimplemented, "xyz", tag(203))
        .unwrap();
    Verifier::new(&f.server_cq)
        .expect_write_accepted(tag(203))
        .expect_finished(tag(202))
        .verify();
    Verifier::new(&f.client_cq)
        .expect_finished_with_status(tag(live_call + 2), Code::Unimplemented, "xyz")
        .verify();

    assert_eq!(s1.state(), ServerState::Finished);
    assert_eq!(s2.state(), ServerState::Finished);
    assert_eq!(f.server().active_calls(), 0);
    f.end_test();
}

#[test]
fn test_queued_calls_admitted_in_arrival_order() {
    let f = Fixture::new(ServerConfig::with_max_concurrent_streams(1));
    let deadline = five_seconds_time();

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let call = f
                .channel
                .create_call(format!("/m{i}"), AUTHORITY, deadline)
                .unwrap();
            call.invoke(&f.client_cq, tag(10 * i + 1), tag(10 * i + 2))
                .unwrap();
            call
        })
        .collect();
    assert_eq!(f.server().pending_calls(), 3);
    Verifier::new(&f.client_cq)
        .expect_invoke_accepted(tag(1))
        .verify();

    for i in 0..4u64 {
        f.server().request_call(tag(1000 + i)).unwrap();
        let mut events = Verifier::new(&f.server_cq)
            .expect_new_call(tag(1000 + i), &format!("/m{i}"))
            .verify();
        let s = take_new_call(&mut events).call;
        s.accept(&f.server_cq, tag(2000 + i)).unwrap();
        s.start_write_status(Code::Ok, "", tag(3000 + i)).unwrap();
        Verifier::new(&f.server_cq)
            .expect_write_accepted(tag(3000 + i))
            .expect_finished(tag(2000 + i))
            .verify();

        let mut client = Verifier::new(&f.client_cq);
        client
            .expect_metadata_read(tag(10 * i + 1))
            .expect_finished_with_status(tag(10 * i + 2), Code::Ok, "");
        if i < 3 {
            client.expect_invoke_accepted(tag(10 * (i + 1) + 1));
        }
        client.verify();
        assert!(f.server().active_calls() <= 1);
    }

    drop(calls);
    f.end_test();
}

#[test]
fn test_unbounded_server_admits_all() {
    let f = Fixture::new(ServerConfig::default());
    let deadline = five_seconds_time();

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let call = f.channel.create_call("/foo", AUTHORITY, deadline).unwrap();
            call.invoke(&f.client_cq, tag(i), tag(100 + i)).unwrap();
            call
        })
        .collect();
    assert_eq!(f.server().active_calls(), 8);
    assert_eq!(f.server().pending_calls(), 0);

    let mut verifier = Verifier::new(&f.client_cq);
    for i in 0..8 {
        verifier.expect_invoke_accepted(tag(i));
    }
    verifier.verify();

    for call in &calls {
        call.cancel();
    }
    assert_eq!(f.server().active_calls(), 0);
    f.end_test();
}

#[test]
fn test_metadata_flows_both_ways() {
    let f = Fixture::new(ServerConfig::default());
    let c = f
        .channel
        .create_call("/foo", AUTHORITY, five_seconds_time())
        .unwrap();
    c.add_metadata("X-Request-Id", "abc").unwrap();
    c.invoke(&f.client_cq, tag(1), tag(2)).unwrap();
    assert!(c.add_metadata("late", "1").is_err());

    f.server().request_call(tag(100)).unwrap();
    let mut events = Verifier::new(&f.server_cq)
        .expect_new_call(tag(100), "/foo")
        .verify();
    let new_call = take_new_call(&mut events);
    assert_eq!(new_call.metadata.get("x-request-id"), Some("abc"));

    let s = new_call.call;
    s.add_metadata("server", "test").unwrap();
    s.accept(&f.server_cq, tag(101)).unwrap();
    s.end_initial_metadata(WriteFlags::BUFFER_HINT).unwrap();
    assert!(s.add_metadata("late", "1").is_err());

    let mut events = Verifier::new(&f.client_cq)
        .expect_invoke_accepted(tag(1))
        .expect_metadata_read(tag(1))
        .verify();
    let read = events.pop().unwrap();
    match read.kind {
        grpc::EventKind::MetadataRead(metadata) => {
            assert_eq!(metadata.get("server"), Some("test"));
        }
        other => panic!("unexpected {other:?}"),
    }

    s.start_write_status(Code::Ok, "", tag(102)).unwrap();
    Verifier::new(&f.client_cq)
        .expect_finished_with_status(tag(2), Code::Ok, "")
        .verify();
    f.end_test();
}

#[test]
fn test_write_status_implies_initial_metadata() {
    let f = Fixture::new(ServerConfig::default());
    let c = f
        .channel
        .create_call("/foo", AUTHORITY, five_seconds_time())
        .unwrap();
    c.invoke(&f.client_cq, tag(1), tag(2)).unwrap();
    f.server().request_call(tag(100)).unwrap();
    let mut events = Verifier::new(&f.server_cq)
        .expect_new_call(tag(100), "/foo")
        .verify();
    let s = take_new_call(&mut events).call;
    s.accept(&f.server_cq, tag(101)).unwrap();
    s.start_write_status(Code::NotFound, "nope", tag(102))
        .unwrap();

    let events = Verifier::new(&f.client_cq)
        .expect_invoke_accepted(tag(1))
        .expect_metadata_read(tag(1))
        .expect_finished_with_status(tag(2), Code::NotFound, "nope")
        .verify();
    let order: Vec<_> = events.iter().map(|e| e.kind.name()).collect();
    assert_eq!(
        order,
        vec!["INVOKE_ACCEPTED", "METADATA_READ", "FINISHED_WITH_STATUS"]
    );
    f.end_test();
}
