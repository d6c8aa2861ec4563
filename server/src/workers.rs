//! Handler, load, and completion-queue consumer threads.
//!
//! Two consumer threads own the completion queues. The server consumer
//! forwards each NEW_CALL to the handler pool over a channel; the client
//! consumer routes each FINISHED_WITH_STATUS to the load thread that
//! issued the call, identified by the upper half of the finish tag.

use crate::config::{Config, LoadConfig};
use crossbeam_channel::{Receiver, Sender};
use grpc::{
    Channel, Code, CompletionQueue, EventKind, NewCall, Next, Server, Status, Tag, WriteFlags,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to a spawned worker thread.
pub struct WorkerHandle<R> {
    pub handle: JoinHandle<R>,
    /// The worker ID (0-indexed)
    pub worker_id: usize,
}

/// Spawn `num_workers` named threads running `worker_fn(worker_id)`.
pub fn spawn_workers<F, R>(
    num_workers: usize,
    name_prefix: &str,
    worker_fn: F,
) -> Vec<WorkerHandle<R>>
where
    F: Fn(usize) -> R + Send + Clone + 'static,
    R: Send + 'static,
{
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let worker_fn = worker_fn.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name_prefix, worker_id))
            .spawn(move || worker_fn(worker_id))
            .expect("failed to spawn worker thread");
        handles.push(WorkerHandle { handle, worker_id });
    }

    handles
}

/// Wait for all worker threads to complete.
pub fn join_workers<R>(handles: Vec<WorkerHandle<R>>) -> Vec<R> {
    handles
        .into_iter()
        .map(|h| h.handle.join().expect("worker thread panicked"))
        .collect()
}

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct Summary {
    /// Calls invoked by load threads
    pub issued: usize,
    /// Calls answered by handler threads
    pub handled: usize,
    /// Final client-side status counts
    pub finished: HashMap<Code, usize>,
    /// Most calls seen on the server queue at once between NEW_CALL and
    /// FINISHED
    pub peak_active: usize,
    /// Stopped early by a signal
    pub interrupted: bool,
}

impl Summary {
    pub fn finished_total(&self) -> usize {
        self.finished.values().sum()
    }

    pub fn count(&self, code: Code) -> usize {
        self.finished.get(&code).copied().unwrap_or(0)
    }

    /// Status counts ordered by code.
    pub fn by_code(&self) -> Vec<(Code, usize)> {
        let mut counts: Vec<_> = self.finished.iter().map(|(c, n)| (*c, *n)).collect();
        counts.sort_by_key(|(code, _)| code.as_u32());
        counts
    }
}

#[derive(Debug, Default)]
struct LoadReport {
    issued: usize,
    finished: HashMap<Code, usize>,
}

/// Tag for one of a load thread's per-call operations. The upper 32 bits
/// carry the thread id.
fn client_tag(thread: usize, seq: u64, op: u64) -> Tag {
    Tag::new(((thread as u64) << 32) | (seq << 2) | op)
}

fn next_tag(tags: &AtomicU64) -> Tag {
    Tag::new(tags.fetch_add(1, Ordering::Relaxed))
}

fn spawn_consumer<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn consumer thread")
}

/// Host a server and drive `config.load` against it until every call has
/// finished or `shutdown` is set. Both queues are drained and the server
/// destroyed before returning.
pub fn run(
    config: &Config,
    shutdown: Arc<AtomicBool>,
) -> Result<Summary, Box<dyn std::error::Error>> {
    let client_cq = CompletionQueue::new();
    let server_cq = CompletionQueue::new();
    let server = Arc::new(Server::new(config.server.clone(), server_cq.clone())?);
    let channel = Channel::new("in-process", server.endpoint(), client_cq.clone());
    let tags = Arc::new(AtomicU64::new(1));
    let in_flight = Arc::new(InFlight::default());

    tracing::info!(
        max_concurrent_streams = ?config.server.max_concurrent_streams,
        handlers = config.workers.threads,
        clients = config.load.threads,
        calls = config.load.calls,
        "starting run"
    );

    // server side
    let (call_tx, call_rx) = crossbeam_channel::unbounded();
    let server_consumer = {
        let cq = server_cq.clone();
        let in_flight = in_flight.clone();
        spawn_consumer("server-cq", move || {
            consume_server_queue(&cq, call_tx, &in_flight)
        })
    };
    for _ in 0..config.workers.threads {
        server.request_call(next_tag(&tags))?;
    }
    let handlers = {
        let server = server.clone();
        let cq = server_cq.clone();
        let load = config.load.clone();
        let tags = tags.clone();
        let in_flight = in_flight.clone();
        spawn_workers(config.workers.threads, "handler", move |_| {
            run_handler(&server, &cq, &call_rx, &load, &tags, &in_flight)
        })
    };

    // client side
    let (status_txs, status_rxs): (Vec<Sender<Status>>, Vec<Receiver<Status>>) =
        (0..config.load.threads).map(|_| crossbeam_channel::unbounded()).unzip();
    let client_consumer = {
        let cq = client_cq.clone();
        spawn_consumer("client-cq", move || consume_client_queue(&cq, status_txs))
    };
    let load = {
        let channel = channel.clone();
        let cq = client_cq.clone();
        let load = config.load.clone();
        let statuses = Arc::new(status_rxs);
        let shutdown = shutdown.clone();
        spawn_workers(config.load.threads, "load", move |id| {
            run_load(id, &load, &channel, &cq, &statuses[id], &shutdown)
        })
    };

    let mut summary = Summary::default();
    for report in join_workers(load) {
        let report = report?;
        summary.issued += report.issued;
        for (code, n) in report.finished {
            *summary.finished.entry(code).or_default() += n;
        }
    }
    summary.interrupted = shutdown.load(Ordering::Relaxed);

    // wind down: server first, so handlers stop once their queue drains
    server.shutdown();
    server_cq.shutdown();
    server_consumer
        .join()
        .map_err(|_| "server queue consumer panicked")?;
    summary.handled = join_workers(handlers).into_iter().sum();

    channel.destroy();
    client_cq.shutdown();
    client_consumer
        .join()
        .map_err(|_| "client queue consumer panicked")?;

    summary.peak_active = in_flight.peak.load(Ordering::Relaxed);

    let server = Arc::into_inner(server).ok_or("server still referenced after run")?;
    server.destroy()?;
    client_cq.destroy()?;
    server_cq.destroy()?;

    Ok(summary)
}

/// Calls between NEW_CALL and FINISHED, counted from the server queue
/// rather than from the admission controller.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn start(&self) {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    fn end(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }
}

fn run_handler(
    server: &Server,
    cq: &CompletionQueue,
    calls: &Receiver<NewCall>,
    load: &LoadConfig,
    tags: &AtomicU64,
    in_flight: &InFlight,
) -> usize {
    let mut handled = 0;
    for new_call in calls.iter() {
        let id = new_call.call.id();
        if let Err(e) = new_call.call.accept(cq, next_tag(tags)) {
            // never bound, so no FINISHED will follow
            in_flight.end();
            tracing::debug!(call = id, error = %e, "call finished before it was accepted");
        } else {
            match answer(new_call, load, tags) {
                Ok(()) => handled += 1,
                Err(e) => {
                    tracing::debug!(call = id, error = %e, "call finished before it was answered")
                }
            }
        }
        if let Err(e) = server.request_call(next_tag(tags)) {
            tracing::debug!(error = %e, "not re-registering");
        }
    }
    handled
}

fn answer(new_call: NewCall, load: &LoadConfig, tags: &AtomicU64) -> grpc::Result<()> {
    let mut call = new_call.call;
    tracing::trace!(call = call.id(), method = %new_call.method, "handling call");
    call.end_initial_metadata(WriteFlags::empty())?;
    call.start_write_status(
        load.response_code,
        load.response_message.clone(),
        next_tag(tags),
    )?;
    call.destroy()
}

fn run_load(
    id: usize,
    load: &LoadConfig,
    channel: &Channel,
    cq: &CompletionQueue,
    statuses: &Receiver<Status>,
    shutdown: &AtomicBool,
) -> grpc::Result<LoadReport> {
    let mut report = LoadReport::default();
    let threads = load.threads.max(1);

    for (seq, n) in (id..load.calls).step_by(threads).enumerate() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let seq = seq as u64;
        let method = &load.methods[n % load.methods.len()];
        let deadline = Instant::now() + load.deadline();
        let mut call = channel.create_call(method.as_str(), load.authority.as_str(), deadline)?;

        call.invoke(cq, client_tag(id, seq, 0), client_tag(id, seq, 1))?;
        if let Err(e) = call.writes_done(client_tag(id, seq, 2)) {
            tracing::debug!(call = call.id(), error = %e, "writes_done after finish");
        }
        report.issued += 1;

        let Ok(status) = statuses.recv() else {
            tracing::warn!(worker = id, "client queue consumer exited early");
            break;
        };
        *report.finished.entry(status.code()).or_default() += 1;
        call.destroy()?;
    }

    Ok(report)
}

fn consume_server_queue(cq: &CompletionQueue, calls: Sender<NewCall>, in_flight: &InFlight) {
    loop {
        match cq.next(Instant::now() + POLL_INTERVAL) {
            Ok(Next::Event(event)) => match event.kind {
                EventKind::NewCall(Some(new_call)) => {
                    in_flight.start();
                    if calls.send(new_call).is_err() {
                        in_flight.end();
                        tracing::warn!("no handlers left to take new calls");
                    }
                }
                EventKind::NewCall(None) => {
                    tracing::trace!("registration completed by shutdown");
                }
                EventKind::Finished => in_flight.end(),
                EventKind::QueueShutdown => break,
                kind => tracing::trace!(kind = kind.name(), "server event"),
            },
            Ok(Next::Timeout) => {}
            Err(e) => {
                tracing::warn!(error = %e, "server queue consumer stopping");
                break;
            }
        }
    }
}

fn consume_client_queue(cq: &CompletionQueue, statuses: Vec<Sender<Status>>) {
    loop {
        match cq.next(Instant::now() + POLL_INTERVAL) {
            Ok(Next::Event(event)) => match (event.tag, event.kind) {
                (Some(tag), EventKind::FinishedWithStatus(status)) => {
                    let thread = (tag.value() >> 32) as usize;
                    match statuses.get(thread) {
                        Some(tx) => {
                            let _ = tx.send(status);
                        }
                        None => tracing::warn!(tag = tag.value(), "status for unknown load thread"),
                    }
                }
                (_, EventKind::QueueShutdown) => break,
                (_, kind) => tracing::trace!(kind = kind.name(), "client event"),
            },
            Ok(Next::Timeout) => {}
            Err(e) => {
                tracing::warn!(error = %e, "client queue consumer stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tag_encodes_thread() {
        let tag = client_tag(3, 7, 1);
        assert_eq!(tag.value() >> 32, 3);
        assert_eq!(tag.value() & 0x3, 1);
        assert_ne!(client_tag(3, 7, 0), client_tag(3, 7, 1));
        assert_ne!(client_tag(3, 7, 0), client_tag(4, 7, 0));
    }

    #[test]
    fn test_spawn_and_join_workers() {
        let handles = spawn_workers(4, "test", |id| id * 2);
        assert_eq!(join_workers(handles), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_in_flight_tracks_peak() {
        let in_flight = InFlight::default();
        in_flight.start();
        in_flight.start();
        in_flight.end();
        in_flight.start();
        in_flight.end();
        in_flight.end();
        assert_eq!(in_flight.current.load(Ordering::Relaxed), 0);
        assert_eq!(in_flight.peak.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_summary_by_code() {
        let mut summary = Summary::default();
        summary.finished.insert(Code::Unimplemented, 2);
        summary.finished.insert(Code::Ok, 3);
        assert_eq!(summary.finished_total(), 5);
        assert_eq!(
            summary.by_code(),
            vec![(Code::Ok, 3), (Code::Unimplemented, 2)]
        );
        assert_eq!(summary.count(Code::Cancelled), 0);
    }
}
