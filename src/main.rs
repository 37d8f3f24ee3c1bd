//! digest-scale: a throughput-testing harness for a digest echo service
//!
//! Modes:
//! - `server`: mio reactor plus a fixed worker pool that answers every
//!   8 KiB payload with its 20-byte SHA-1 digest
//! - `client`: paced load generator that verifies every echoed digest
//! - `launch`: many clients in one process
//!
//! Exit status is 0 on success, 1 on a fatal error and 2 when a client
//! receives too many unrecognized digests.

mod client;
mod config;
mod protocol;
mod runtime;

use config::{Config, Mode};
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let code = match config.mode {
        Mode::Server(server) => {
            info!(
                host = %server.host,
                port = server.port,
                workers = server.workers,
                "Starting digest-scale server"
            );
            match runtime::run(server) {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "Server failed");
                    1
                }
            }
        }
        Mode::Client(client) => exit_code(client::Client::new(client).run()),
        Mode::Launch(launch) => exit_code(client::launcher::run(launch)),
    };

    process::exit(code);
}

fn exit_code(result: Result<(), client::ClientError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Client stopped");
            e.exit_code()
        }
    }
}
