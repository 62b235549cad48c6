mod connector;
mod dispatcher;

use connector::Connector;
use dispatcher::{Control, Dispatcher};
use qa_core::identity;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

// Re-export what main.rs needs
pub use qa_core::util::{is_ip_addr, is_port};
pub use qa_protocol::DEFAULT_PORT;

pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub key_path: PathBuf,
    pub topic: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unable to bind {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    #[error(transparent)]
    Identity(#[from] identity::IdentityError),
}

/// A bound broker, ready to run.
///
/// Binding is split from running so callers can learn the actual port
/// before the accept loop starts.
pub struct Broker {
    listener: TcpListener,
    signing_key: dsa::SigningKey,
    config: BrokerConfig,
}

impl Broker {
    /// Load (or mint) the signing key and bind the listen socket.
    pub async fn bind(config: BrokerConfig) -> Result<Broker, BrokerError> {
        let signing_key = identity::load_or_generate_key(&config.key_path)?;
        Broker::bind_with_key(config, signing_key).await
    }

    /// Bind with an already-loaded signing key.
    pub async fn bind_with_key(
        config: BrokerConfig,
        signing_key: dsa::SigningKey,
    ) -> Result<Broker, BrokerError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| BrokerError::Bind {
                host: config.host.clone(),
                port: config.port,
                source,
            })?;
        Ok(Broker {
            listener,
            signing_key,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener has an address")
    }

    /// The public half of the broker identity, canonical-encoded.
    pub fn encoded_public_key(&self) -> String {
        identity::encode_pub(self.signing_key.verifying_key())
    }

    pub fn verifying_key(&self) -> dsa::VerifyingKey {
        self.signing_key.verifying_key().clone()
    }

    /// Run the accept loop and the dispatcher until ctrl-c.
    pub async fn run(self) {
        use futures::{future::FutureExt, future::select_all, pin_mut};
        use qa_core::util::signal_handler;
        use std::future::Future;
        use std::pin::Pin;

        let advertised_port = self.local_addr().port();
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();

        let dispatcher = Dispatcher::new(
            control_rx,
            self.signing_key,
            self.config.host.clone(),
            advertised_port,
            self.config.topic.clone(),
        );
        let connector = Connector::new(self.listener, control_tx.clone());

        let fut_dispatch = dispatcher.begin().fuse();
        let fut_conn = connector.begin().fuse();
        let fut_sig = signal_handler().fuse();

        pin_mut!(fut_dispatch, fut_conn, fut_sig);
        let futures: Vec<Pin<&mut (dyn Future<Output = ()> + Send)>> =
            vec![fut_dispatch, fut_conn, fut_sig];
        select_all(futures).await;
        // If any of them finish, end the program as something went wrong
        let _ = control_tx.send(Control::Shutdown);
    }
}
