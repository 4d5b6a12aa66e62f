use std::io;

use log::info;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// SIGINT and SIGTERM listeners. Installed before anything is attached so a
/// signal at any later point unwinds through the normal teardown path instead
/// of killing the process with the program still on the interface.
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    pub async fn wait(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("received SIGINT, shutting down"),
            _ = self.terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }
}
