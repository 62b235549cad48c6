//! Client session controller.
//!
//! Owns at most one live endpoint at a time and exposes the outbound
//! actions (logon, pubmsg, screenshot, quit) plus a non-blocking inbound
//! queue for the UI. Connection loss latches the `connection_error` signal
//! the recovery loop waits on; the session itself never redials.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use qa_core::workers::{Endpoint, EndpointEvent};
use qa_core::{Settings, SettingsError};
use qa_protocol::{Body, Logon, LogonUser, Privileges, Pubmsg, Screenshot};
use serde_json::Value;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// How long to wait for a TCP connect before falling through.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period for the send worker to drain the quit frame.
const QUIT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("already connected; reconnect instead")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("could not reach {attempted:?} on port {port}")]
    ConnectFailed { attempted: Vec<String>, port: u16 },
    #[error("endpoint setup: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub struct Session {
    settings: Settings,
    settings_path: PathBuf,
    endpoint: Option<Endpoint>,
    msg_tx: mpsc::UnboundedSender<Value>,
    msg_rx: mpsc::UnboundedReceiver<Value>,
    connection_error: watch::Sender<bool>,
}

impl Session {
    pub fn new(settings: Settings, settings_path: PathBuf) -> Session {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (connection_error, _) = watch::channel(false);
        Session {
            settings,
            settings_path,
            endpoint: None,
            msg_tx,
            msg_rx,
            connection_error,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> (&mut Settings, &PathBuf) {
        (&mut self.settings, &self.settings_path)
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Watch side of the connection-error latch, for the recovery loop.
    pub fn connection_error(&self) -> watch::Receiver<bool> {
        self.connection_error.subscribe()
    }

    pub fn clear_connection_error(&self) {
        self.connection_error.send_replace(false);
    }

    /// Connect to `hostname`, falling back to the configured default host.
    ///
    /// On failure no endpoint is installed and the session can be retried.
    pub async fn connect(
        &mut self,
        hostname: Option<&str>,
        port: u16,
    ) -> Result<(), SessionError> {
        if self.endpoint.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let mut attempted = Vec::new();
        let mut stream = None;
        let default_host = self.settings.client.default_host.clone();
        for host in hostname.iter().copied().chain([default_host.as_str()]) {
            if attempted.iter().any(|a| a == host) {
                continue;
            }
            attempted.push(host.to_owned());
            match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
                Ok(Ok(s)) => {
                    info!(%host, port, "connected");
                    stream = Some(s);
                    break;
                }
                Ok(Err(error)) => debug!(%host, port, %error, "connect failed"),
                Err(_) => debug!(%host, port, "connect timed out"),
            }
        }
        let Some(stream) = stream else {
            return Err(SessionError::ConnectFailed { attempted, port });
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint::start(stream, events_tx).await?;
        tokio::spawn(forward_events(
            events_rx,
            self.msg_tx.clone(),
            self.connection_error.clone(),
        ));
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Restart-latch the old endpoint, meet it on the rendezvous, then dial
    /// the new address.
    pub async fn reconnect(&mut self, hostname: &str, port: u16) -> Result<(), SessionError> {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.restart().await;
        }
        self.connect(Some(hostname), port).await
    }

    /// Send the logon frame built from the settings file.
    pub fn logon(&self) -> Result<(), SessionError> {
        let role = self.settings.role()?;
        self.enqueue(Body::Logon(Logon {
            user: LogonUser {
                username: self.settings.user.username.clone(),
                privileges: Privileges { role, muted: None },
            },
            server: self.settings.server.clone(),
        }))
    }

    pub fn pubmsg(&self, text: &str) -> Result<(), SessionError> {
        self.enqueue(Body::Pubmsg(Pubmsg {
            msg: text.to_owned(),
            username: None,
            timestamp: None,
        }))
    }

    pub fn screenshot(&self, image: &[u8]) -> Result<(), SessionError> {
        self.enqueue(Body::Screenshot(Screenshot {
            screenshot: STANDARD.encode(image),
            username: None,
            timestamp: None,
        }))
    }

    /// Non-blocking dequeue of one inbound frame for the UI.
    pub fn get_msg(&mut self) -> Option<Body> {
        loop {
            let value = self.msg_rx.try_recv().ok()?;
            match Body::from_value(&value) {
                Ok(body) => return Some(body),
                Err(error) => {
                    warn!(%error, tag = ?value.get("type"), "dropping unhandled inbound frame");
                }
            }
        }
    }

    /// Announce the disconnect, give the send worker a moment to drain,
    /// then close.
    pub async fn quit(&mut self) {
        let Some(endpoint) = self.endpoint.take() else {
            return;
        };
        let _ = endpoint.enqueue(Body::Quit.to_value());
        tokio::time::sleep(QUIT_GRACE).await;
        endpoint.shutdown().await;
    }

    fn enqueue(&self, body: Body) -> Result<(), SessionError> {
        let endpoint = self.endpoint.as_ref().ok_or(SessionError::NotConnected)?;
        if !endpoint.enqueue(body.to_value()) {
            // Send worker is gone; surface it like any other loss.
            self.connection_error.send_replace(true);
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }
}

/// Pump endpoint events into the session's inbound queue and the
/// connection-error latch.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<EndpointEvent>,
    msg_tx: mpsc::UnboundedSender<Value>,
    connection_error: watch::Sender<bool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            EndpointEvent::Frame { body, .. } => {
                let _ = msg_tx.send(body);
            }
            EndpointEvent::Closed { source } => {
                warn!(%source, "connection lost");
                connection_error.send_replace(true);
            }
        }
    }
}
