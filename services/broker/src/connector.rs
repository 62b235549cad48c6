//! Accept loop.
//!
//! Accepted sockets are handed to the dispatcher over its control queue;
//! the dispatcher owns all per-connection state, so nothing here touches
//! the registry.

use crate::dispatcher::Control;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct Connector {
    listener: TcpListener,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl Connector {
    pub fn new(listener: TcpListener, control_tx: mpsc::UnboundedSender<Control>) -> Connector {
        Connector {
            listener,
            control_tx,
        }
    }

    pub async fn begin(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "accepted connection");
                    if self.control_tx.send(Control::Accepted(stream)).is_err() {
                        // Dispatcher is gone; the broker is shutting down.
                        return;
                    }
                }
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                }
            }
        }
    }
}
