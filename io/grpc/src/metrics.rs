//! Call engine metrics.

use metriken::{Counter, Gauge, metric};

// Call lifecycle
#[metric(name = "grpc_calls_created", description = "Total calls created by channels")]
pub static CALLS_CREATED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_admitted",
    description = "Total invocations admitted without waiting"
)]
pub static CALLS_ADMITTED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_queued",
    description = "Total invocations queued because the server was at capacity"
)]
pub static CALLS_QUEUED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_promoted",
    description = "Total queued invocations admitted after capacity was released"
)]
pub static CALLS_PROMOTED: Counter = Counter::new();

#[metric(name = "grpc_calls_finished", description = "Total calls that reached FINISHED")]
pub static CALLS_FINISHED: Counter = Counter::new();

#[metric(
    name = "grpc_deadline_exceeded",
    description = "Total calls finished by their deadline"
)]
pub static DEADLINE_EXCEEDED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_active",
    description = "Number of admitted, non-terminal calls across all servers"
)]
pub static CALLS_ACTIVE: Gauge = Gauge::new();

// Completion queues
#[metric(
    name = "grpc_cq_events_posted",
    description = "Total events posted to completion queues"
)]
pub static CQ_EVENTS_POSTED: Counter = Counter::new();

#[metric(
    name = "grpc_cq_events_dropped",
    description = "Total engine events dropped because the target queue was shut down"
)]
pub static CQ_EVENTS_DROPPED: Counter = Counter::new();
