//! Dispatcher: builds and spawns the workers, waits for their handshake and
//! hands accepted sessions to them round-robin.

use crate::accelerator::{self, Accelerator};
use crate::affinity::allowed_cpus;
use crate::batch::{BatchHandle, BatchSizing};
use crate::config::Config;
use crate::error::fatal;
use crate::handlers::Mode;
use crate::handshake::{InitFlag, wait_all};
use crate::sched::Sched;
use crate::session::{Session, SessionIntake};
use crate::worker::{self, WorkerSetup};
use crossbeam_channel::{Sender, TrySendError};
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bind the configured listener and serve until shutdown.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(config.proxy.listen)?;
    serve(listener, config, shutdown)
}

/// Serve sessions accepted on `listener` until shutdown.
pub fn serve(
    listener: TcpListener,
    config: &Config,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let num_workers = config.threads();
    let mode = config.mode();
    let cores = match config.cpu_affinity() {
        Some(cores) => cores,
        None => allowed_cpus()?,
    };
    if cores.is_empty() {
        return Err("no cpu available to pin workers to".into());
    }
    if num_workers > cores.len() {
        return Err(format!(
            "{} workers need a core each but only {} cpus are available",
            num_workers,
            cores.len()
        )
        .into());
    }

    info!(
        workers = num_workers,
        listen = %listener.local_addr()?,
        backend = %config.proxy.backend,
        ?mode,
        "Starting worker engine"
    );

    let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_workers)
        .map(|_| crossbeam_channel::bounded::<Session>(config.workers.queue_depth))
        .unzip();

    // One generation in flight per worker bounds the submission queue.
    let (submit_tx, submit_rx) = crossbeam_channel::bounded(num_workers);
    let sizing = BatchSizing::from(&config.offload);

    let mut setups = Vec::with_capacity(num_workers);
    let mut flags: Vec<Arc<InitFlag>> = Vec::with_capacity(num_workers);
    let mut completions = Vec::with_capacity(num_workers);

    for (worker_id, receiver) in receivers.into_iter().enumerate() {
        let sched = Sched::with_mio(
            config.workers.max_events,
            config.workers.poll_timeout(),
            shutdown.clone(),
        )?
        .with_intake(SessionIntake::new(receiver, config.proxy.backend));
        flags.push(sched.init_flag());

        let batch = match mode {
            Mode::Offload => {
                let (handle, complete_tx) = BatchHandle::new(worker_id, sizing, submit_tx.clone());
                completions.push(complete_tx);
                Some(handle)
            }
            Mode::Passthrough => None,
        };

        setups.push(WorkerSetup {
            worker_id,
            core_id: cores[worker_id],
            sched,
            batch,
            high_water: config.workers.high_water_bytes,
        });
    }
    drop(submit_tx);

    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers + 2);

    if mode == Mode::Offload {
        let accelerator = Accelerator::new(
            accelerator::Passthrough,
            submit_rx,
            completions,
            flags.clone(),
            shutdown.clone(),
        );
        handles.push(accelerator.spawn()?);
    }

    for setup in setups {
        let worker_id = setup.worker_id;
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || {
                if let Err(e) = worker::run(setup, mode) {
                    fatal(worker_id, &e);
                }
            })?;
        handles.push(handle);
    }

    let init_timeout = Duration::from_secs(config.shutdown.init_timeout_secs);
    if !wait_all(flags.iter().map(|flag| flag.as_ref()), init_timeout) {
        shutdown.store(true, Ordering::SeqCst);
        return Err(format!("workers did not initialize within {:?}", init_timeout).into());
    }
    info!(workers = num_workers, "All workers initialized");

    {
        let acceptor_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                if let Err(e) = run_acceptor(listener, senders, acceptor_shutdown) {
                    error!(error = %e, "Acceptor error");
                }
            })?;
        handles.push(handle);
    }

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutdown signal received, waiting for workers...");

    let drain_timeout = Duration::from_secs(config.shutdown.drain_timeout_secs);
    let drain_start = Instant::now();

    for handle in handles {
        let remaining = drain_timeout.saturating_sub(drain_start.elapsed());
        if remaining.is_zero() {
            warn!("Drain timeout reached");
            break;
        }
        let _ = handle.join();
    }

    info!("Worker engine shutdown complete");
    Ok(())
}

/// Accept client connections and distribute them round-robin.
fn run_acceptor(
    listener: TcpListener,
    senders: Vec<Sender<Session>>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    info!(address = %listener.local_addr()?, "Acceptor listening");

    let mut next_worker = 0;

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                match senders[next_worker].try_send(Session { stream, addr }) {
                    Ok(()) => {
                        debug!(address = %addr, worker = next_worker, "Accepted connection");
                    }
                    // The rejected session is dropped here, closing the socket.
                    Err(TrySendError::Full(_)) => {
                        warn!(address = %addr, "Dropped connection - worker queue full");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        warn!(address = %addr, worker = next_worker, "Dropped connection - worker gone");
                    }
                }

                next_worker = (next_worker + 1) % senders.len();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    Ok(())
}
