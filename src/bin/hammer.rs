//! Hammer worker engine binary.

use clap::Parser;
use hammer::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hammer")]
#[command(about = "Per-core worker engine for an accelerator-offloading proxy")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a config path or use --print-config");
            std::process::exit(1);
        }
    };

    hammer::logging::init(&config.logging);

    let shutdown = match hammer::signal::install_signal_handler() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handler");
            std::process::exit(1);
        }
    };

    if let Err(e) = hammer::run(&config, shutdown) {
        tracing::error!(error = %e, "Worker engine error");
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# Hammer Configuration

[proxy]
# Address to listen on for client connections
listen = "0.0.0.0:8443"

# Backend every client session is paired with
backend = "127.0.0.1:8080"

[workers]
# Number of worker threads (default: number of CPUs)
# threads = 8

# CPU cores to pin workers to (Linux-style, e.g., "0-3,6-8")
# Default: every CPU the process may run on
# cpu_affinity = "0-7"

# Maximum readiness events handled per wait
max_events = 1024

# Upper bound on one readiness wait, in microseconds
poll_timeout_us = 100

# Pending sessions queued per worker before the acceptor drops new ones
queue_depth = 1024

# Buffered bytes per connection at which reads pause until the peer drains
high_water_bytes = 4194304

[offload]
# Batch client bytes through the accelerator
enabled = false

# Maximum items per batch buffer
batch_items = 256

# Payload bytes per batch buffer
batch_bytes = 1048576

# Largest single item staged from one read
max_item_size = 16384

# Buffers per worker (minimum 2 each)
input_buffers = 2
output_buffers = 2

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"

[shutdown]
# Drain timeout in seconds
drain_timeout_secs = 30

# How long to wait for every worker to finish initializing
init_timeout_secs = 10
"#;
    print!("{}", config);
}
