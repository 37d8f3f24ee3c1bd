//! Runs several clients in one process.
//!
//! Each client gets its own thread with self-reporting off; the launcher
//! prints every client's counters on the report interval instead. The first
//! client failure ends the launch.

use crate::client::{Client, ClientError};
use crate::config::LaunchConfig;
use crate::runtime::REPORT_TIME_FORMAT;
use chrono::Local;
use crossbeam::channel::{self, RecvTimeoutError};
use std::thread;
use tracing::{error, info};

pub fn run(config: LaunchConfig) -> Result<(), ClientError> {
    let (done_tx, done) = channel::unbounded();
    let mut monitors = Vec::with_capacity(config.clients);

    for index in 0..config.clients {
        let mut client_config = config.client.clone();
        client_config.verbose = false;
        let client = Client::new(client_config);
        monitors.push((client.stats(), client.ledger()));

        let done_tx = done_tx.clone();
        thread::Builder::new()
            .name(format!("client-{}", index))
            .spawn(move || {
                let _ = done_tx.send((index, client.run()));
            })
            .map_err(ClientError::Spawn)?;
    }
    drop(done_tx);

    info!(clients = config.clients, "Launched clients");

    let mut finished = 0;
    loop {
        match done.recv_timeout(config.client.report_interval) {
            Ok((index, Ok(()))) => {
                finished += 1;
                info!(client = index, finished, "Client finished");
                if finished == config.clients {
                    return Ok(());
                }
            }
            Ok((index, Err(e))) => {
                error!(client = index, error = %e, "Client failed");
                return Err(e);
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Local::now().format(REPORT_TIME_FORMAT).to_string();
                for (index, (client_stats, ledger)) in monitors.iter().enumerate() {
                    let counts = client_stats.take();
                    info!(
                        "[{}] Client {}: sent {} messages, received {} messages, outstanding {}",
                        now,
                        index,
                        counts.sent,
                        counts.received,
                        ledger.len()
                    );
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}
