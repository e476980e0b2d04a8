//! Hammer - per-core worker engine for an accelerator-offloading proxy.
//!
//! Every worker is a thread pinned to one core running a single-threaded
//! readiness loop. In offload mode client bytes are batched and exchanged
//! with the accelerator through double-buffered regions; completed batches
//! are written back before each new readiness wait.

pub mod accelerator;
pub mod affinity;
pub mod batch;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod handlers;
pub mod handshake;
pub mod metrics;
pub mod poller;
pub mod sched;
pub mod session;
pub mod worker;

pub mod logging;
pub mod signal;

pub use config::Config;
pub use dispatcher::run;
