//! Per-connection send and receive workers.
//!
//! An [`Endpoint`] owns one TCP socket and two tokio tasks. The send worker
//! drains an unbounded FIFO of frame bodies, encodes each, and writes it
//! out. The receive worker feeds socket reads through the streaming frame
//! decoder and forwards every decoded body to the owner's event queue. All
//! wiring happens at construction; workers never register themselves
//! anywhere.
//!
//! Read timeouts are non-fatal (the loop just turns over and re-checks the
//! latch). Write timeouts, socket errors, and framing errors are fatal for
//! the connection and surface to the owner as [`EndpointEvent::Closed`];
//! the worker then parks on the latch so the owner's shutdown-or-restart
//! decision still finds both workers accounted for.

use crate::shutdown::{LatchState, ShutdownLatch, ShutdownRx};
use qa_protocol::{FrameDecoder, frame};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

/// Socket read timeout; expiry is not an error.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Socket write timeout; expiry is fatal for the connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// What an endpoint reports to its owner.
#[derive(Debug)]
pub enum EndpointEvent {
    /// One decoded frame body, in arrival order.
    Frame { source: SocketAddr, body: Value },
    /// The connection is gone: peer EOF, socket error, or fatal framing
    /// error. May be reported by either worker.
    Closed { source: SocketAddr },
}

/// A live connection with its two workers running.
#[derive(Debug)]
pub struct Endpoint {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Value>,
    latch: Arc<ShutdownLatch>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl Endpoint {
    /// Wire up both workers over `stream` and wait for each to signal
    /// readiness. Decoded frames and closure reports go to `events`.
    pub async fn start(
        stream: TcpStream,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> std::io::Result<Endpoint> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (latch, latch_rx) = ShutdownLatch::new();
        let latch = Arc::new(latch);
        let (send_ready_tx, send_ready) = oneshot::channel();
        let (recv_ready_tx, recv_ready) = oneshot::channel();

        let send_task = tokio::spawn(send_loop(
            write_half,
            outbound_rx,
            latch_rx.clone(),
            events.clone(),
            addr,
            send_ready_tx,
        ));
        let recv_task = tokio::spawn(receive_loop(
            read_half,
            latch_rx,
            events,
            addr,
            recv_ready_tx,
        ));
        let _ = send_ready.await;
        let _ = recv_ready.await;

        Ok(Endpoint {
            addr,
            outbound,
            latch,
            send_task,
            recv_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a body for transmission. `false` means the send worker is gone
    /// and the endpoint should be treated as broken.
    pub fn enqueue(&self, body: Value) -> bool {
        self.outbound.send(body).is_ok()
    }

    /// Latch shutdown without waiting for the workers.
    pub fn begin_shutdown(&self) {
        self.latch.shutdown();
    }

    /// Latch shutdown and wait for both workers to exit.
    pub async fn shutdown(self) {
        self.latch.shutdown();
        let _ = self.send_task.await;
        let _ = self.recv_task.await;
    }

    /// Latch a restart, meet the workers on the rendezvous, and release the
    /// socket. The caller builds the replacement endpoint afterwards.
    ///
    /// When shutdown was already latched no rendezvous forms; the workers
    /// are exiting on their own and are simply awaited.
    pub async fn restart(self) {
        if let Some(barrier) = self.latch.restart() {
            barrier.wait().await;
        }
        let _ = self.send_task.await;
        let _ = self.recv_task.await;
    }
}

/// Resolve a latched state; `None` means keep running.
async fn park_on(state: LatchState) -> Option<()> {
    match state {
        LatchState::Clear => None,
        LatchState::Shutdown => Some(()),
        LatchState::Restart(barrier) => {
            barrier.wait().await;
            Some(())
        }
    }
}

/// A worker whose socket is gone still owes the restart rendezvous an
/// arrival, so it parks here until the owner latches a decision.
async fn park_until_latched(mut latch_rx: ShutdownRx) {
    loop {
        let state = latch_rx.borrow_and_update().clone();
        if park_on(state).await.is_some() {
            return;
        }
        if latch_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    mut latch_rx: ShutdownRx,
    events: mpsc::UnboundedSender<EndpointEvent>,
    addr: SocketAddr,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    loop {
        tokio::select! {
            biased;
            changed = latch_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = latch_rx.borrow_and_update().clone();
                if park_on(state).await.is_some() {
                    return;
                }
            }
            queued = outbound.recv() => {
                let Some(body) = queued else {
                    // Owner dropped the endpoint; nothing left to send.
                    return;
                };
                let bytes = frame::encode(&body);
                match timeout(WRITE_TIMEOUT, writer.write_all(&bytes)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        debug!(%addr, %error, "send worker lost the connection");
                        let _ = events.send(EndpointEvent::Closed { source: addr });
                        park_until_latched(latch_rx).await;
                        return;
                    }
                    Err(_) => {
                        warn!(%addr, "write timed out");
                        let _ = events.send(EndpointEvent::Closed { source: addr });
                        park_until_latched(latch_rx).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut latch_rx: ShutdownRx,
    events: mpsc::UnboundedSender<EndpointEvent>,
    addr: SocketAddr,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 1024];
    loop {
        tokio::select! {
            biased;
            changed = latch_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = latch_rx.borrow_and_update().clone();
                if park_on(state).await.is_some() {
                    return;
                }
            }
            read = timeout(READ_TIMEOUT, reader.read(&mut chunk)) => {
                // Timeout only re-checks the latch.
                let Ok(result) = read else { continue };
                match result {
                    Ok(0) => {
                        debug!(%addr, "peer closed the connection");
                        let _ = events.send(EndpointEvent::Closed { source: addr });
                        park_until_latched(latch_rx).await;
                        return;
                    }
                    Ok(n) => {
                        decoder.extend(&chunk[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(body)) => {
                                    let _ = events.send(EndpointEvent::Frame { source: addr, body });
                                }
                                Ok(None) => break,
                                Err(error) => {
                                    warn!(
                                        %addr,
                                        %error,
                                        offending = %String::from_utf8_lossy(decoder.remaining()),
                                        "fatal framing error"
                                    );
                                    let _ = events.send(EndpointEvent::Closed { source: addr });
                                    park_until_latched(latch_rx).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        debug!(%addr, %error, "receive worker lost the connection");
                        let _ = events.send(EndpointEvent::Closed { source: addr });
                        park_until_latched(latch_rx).await;
                        return;
                    }
                }
            }
        }
    }
}
