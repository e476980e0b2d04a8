//! Worker engine metrics.

use metriken::{Counter, Gauge, metric};

/// Currently registered connections (both roles).
#[metric(name = "worker_connections_active")]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

/// Client sessions handed to workers by the acceptor.
#[metric(name = "dispatcher_sessions_accepted")]
pub static SESSIONS_ACCEPTED: Counter = Counter::new();

/// Readiness events dispatched to a handler.
#[metric(name = "worker_events_dispatched")]
pub static EVENTS_DISPATCHED: Counter = Counter::new();

/// Connections force-closed after a handler failure.
#[metric(name = "worker_forced_closes")]
pub static FORCED_CLOSES: Counter = Counter::new();

/// Reads skipped because buffered bytes reached the high-water mark.
#[metric(name = "worker_reads_paused")]
pub static READS_PAUSED: Counter = Counter::new();

/// Batches handed to the accelerator.
#[metric(name = "batch_submitted")]
pub static BATCHES_SUBMITTED: Counter = Counter::new();

/// Completed batches written back to connections.
#[metric(name = "batch_forwarded")]
pub static BATCHES_FORWARDED: Counter = Counter::new();

/// Completed items delivered to an open connection.
#[metric(name = "batch_items_forwarded")]
pub static ITEMS_FORWARDED: Counter = Counter::new();

/// Completed items whose connection closed while in flight.
#[metric(name = "batch_items_dropped")]
pub static ITEMS_DROPPED: Counter = Counter::new();

/// Payload bytes written back from completed batches.
#[metric(name = "batch_bytes_forwarded")]
pub static BYTES_FORWARDED: Counter = Counter::new();
