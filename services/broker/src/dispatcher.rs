//! The broker's single routing worker.
//!
//! All room state lives here: the subscription registry, the mute filter,
//! and the admin-only screenshot policy. The dispatcher is the only reader
//! of the publish queue, which gives the room one total order of delivery:
//! two frames dequeued in some order reach every recipient in that order.

use qa_core::util::unix_timestamp;
use qa_core::workers::{Endpoint, EndpointEvent};
use qa_protocol::{Body, Entrance, Exit, LogonUser, ProtocolInfo, Role, Room, SidentResponse};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Control messages from outside the publish queue.
pub enum Control {
    /// A freshly accepted connection; the dispatcher wires up its endpoint.
    Accepted(TcpStream),
    /// Stop routing and close every connection.
    Shutdown,
}

/// One connected endpoint and, once it has logged on, its subscription.
struct Connection {
    endpoint: Endpoint,
    subscription: Option<Subscription>,
    /// Set when a send queue write fails; skipped until the closure report
    /// removes the connection for good.
    broken: bool,
}

/// The `user` and `server` subtrees captured from a logon frame.
struct Subscription {
    user: LogonUser,
    #[allow(dead_code)]
    server: ProtocolInfo,
}

impl Connection {
    fn username(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .map(|s| s.user.username.as_str())
    }
}

pub struct Dispatcher {
    control_rx: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::UnboundedSender<EndpointEvent>,
    events_rx: mpsc::UnboundedReceiver<EndpointEvent>,
    connections: HashMap<SocketAddr, Connection>,
    /// Arrival order, for the room snapshot and administrative listing.
    order: Vec<SocketAddr>,
    signing_key: dsa::SigningKey,
    advertised_host: String,
    advertised_port: u16,
    topic: String,
}

impl Dispatcher {
    pub fn new(
        control_rx: mpsc::UnboundedReceiver<Control>,
        signing_key: dsa::SigningKey,
        advertised_host: String,
        advertised_port: u16,
        topic: String,
    ) -> Dispatcher {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Dispatcher {
            control_rx,
            events_tx,
            events_rx,
            connections: HashMap::new(),
            order: Vec::new(),
            signing_key,
            advertised_host,
            advertised_port,
            topic,
        }
    }

    /// Drain the control and publish queues until shutdown.
    pub async fn begin(mut self) {
        loop {
            tokio::select! {
                biased;
                control = self.control_rx.recv() => match control {
                    Some(Control::Accepted(stream)) => self.accept(stream).await,
                    Some(Control::Shutdown) | None => break,
                },
                event = self.events_rx.recv() => match event {
                    Some(EndpointEvent::Frame { source, body }) => self.route(source, &body),
                    Some(EndpointEvent::Closed { source }) => self.drop_connection(source),
                    // The dispatcher holds its own events_tx, so the channel
                    // cannot close while it runs.
                    None => break,
                },
            }
        }
        for (_, connection) in self.connections.drain() {
            connection.endpoint.begin_shutdown();
        }
    }

    async fn accept(&mut self, stream: TcpStream) {
        match Endpoint::start(stream, self.events_tx.clone()).await {
            Ok(endpoint) => {
                let addr = endpoint.addr();
                info!(%addr, "connected to client");
                self.connections.insert(
                    addr,
                    Connection {
                        endpoint,
                        subscription: None,
                        broken: false,
                    },
                );
                self.order.push(addr);
            }
            Err(error) => warn!(%error, "error connecting to client"),
        }
    }

    /// Apply routing policy to one dequeued frame.
    fn route(&mut self, source: SocketAddr, body: &serde_json::Value) {
        let body = match Body::from_value(body) {
            Ok(body) => body,
            Err(error) => {
                debug!(%source, %error, tag = ?body.get("type"), "dropping unhandled message");
                return;
            }
        };
        match body {
            Body::Logon(logon) => self.subscribe(source, logon),
            Body::Quit => self.quit(source),
            // Identity challenges come from peers that never log on.
            Body::SidentVerify(_) => self.answer_sident(source),
            Body::Pubmsg(msg) => self.route_pubmsg(source, msg),
            Body::Screenshot(shot) => self.route_screenshot(source, shot),
            other => debug!(%source, tag = other.type_tag(), "broker does not route this type"),
        }
    }

    fn subscribe(&mut self, source: SocketAddr, logon: qa_protocol::Logon) {
        let username = logon.user.username.clone();
        let timestamp = unix_timestamp();

        {
            let Some(connection) = self.connections.get_mut(&source) else {
                return;
            };
            connection.subscription = Some(Subscription {
                user: logon.user,
                server: logon.server,
            });
        }
        info!(%source, %username, "subscribed");

        // Room snapshot to the newcomer, entrance notice to everyone else.
        let users: Vec<String> = self
            .order
            .iter()
            .filter_map(|addr| self.connections.get(addr))
            .filter_map(|c| c.username().map(str::to_owned))
            .collect();
        let room = Body::Room(Room {
            users,
            topic: self.topic.clone(),
        });
        self.send_to(source, &room);

        let entrance = Body::Entrance(Entrance {
            username,
            timestamp,
        });
        self.broadcast(&entrance, Some(source), None);
    }

    fn quit(&mut self, source: SocketAddr) {
        debug!(%source, "client announced quit");
        self.drop_connection(source);
    }

    /// Remove a connection and tell the room it left.
    fn drop_connection(&mut self, source: SocketAddr) {
        let Some(connection) = self.connections.remove(&source) else {
            return;
        };
        self.order.retain(|addr| *addr != source);
        connection.endpoint.begin_shutdown();
        if let Some(username) = connection.username() {
            info!(%source, %username, "unsubscribed");
            let exit = Body::Exit(Exit {
                username: username.to_owned(),
                timestamp: unix_timestamp(),
            });
            self.broadcast(&exit, None, None);
        } else {
            info!(%source, "connection closed before logon");
        }
    }

    fn answer_sident(&mut self, source: SocketAddr) {
        let timestamp = unix_timestamp();
        let signature = match qa_core::identity::sign_address(
            &self.signing_key,
            &self.advertised_host,
            self.advertised_port,
            timestamp,
        ) {
            Ok(signature) => signature,
            Err(error) => {
                warn!(%error, "failed to sign identity response");
                return;
            }
        };
        let response = Body::SidentResponse(SidentResponse {
            ip_addr: self.advertised_host.clone(),
            port: self.advertised_port,
            timestamp,
            signature,
        });
        self.send_to(source, &response);
    }

    fn route_pubmsg(&mut self, source: SocketAddr, mut msg: qa_protocol::Pubmsg) {
        let Some(connection) = self.connections.get(&source) else {
            return;
        };
        let Some(subscription) = connection.subscription.as_ref() else {
            debug!(%source, "dropping pubmsg from endpoint that has not logged on");
            return;
        };
        if subscription.user.privileges.muted == Some(true) {
            // TODO: queue a muted notice back to the sender once the client
            // renders error frames.
            debug!(%source, username = %subscription.user.username, "muted, dropping pubmsg");
            return;
        }
        msg.username = Some(subscription.user.username.clone());
        msg.timestamp.get_or_insert_with(unix_timestamp);
        self.broadcast(&Body::Pubmsg(msg), None, None);
    }

    fn route_screenshot(&mut self, source: SocketAddr, mut shot: qa_protocol::Screenshot) {
        let Some(connection) = self.connections.get(&source) else {
            return;
        };
        let Some(subscription) = connection.subscription.as_ref() else {
            debug!(%source, "dropping screenshot from endpoint that has not logged on");
            return;
        };
        shot.username = Some(subscription.user.username.clone());
        shot.timestamp.get_or_insert_with(unix_timestamp);
        self.broadcast(&Body::Screenshot(shot), None, Some(Role::Admin));
    }

    /// Queue `body` to every live subscriber, skipping `except` and, when
    /// `role` is given, anyone of a different role. A full send queue never
    /// aborts the fan-out; the recipient is marked broken instead.
    fn broadcast(&mut self, body: &Body, except: Option<SocketAddr>, role: Option<Role>) {
        let value = body.to_value();
        for addr in &self.order {
            if Some(*addr) == except {
                continue;
            }
            let Some(connection) = self.connections.get_mut(addr) else {
                continue;
            };
            if connection.broken {
                continue;
            }
            let Some(subscription) = connection.subscription.as_ref() else {
                continue;
            };
            if role.is_some_and(|r| subscription.user.privileges.role != r) {
                continue;
            }
            if !connection.endpoint.enqueue(value.clone()) {
                warn!(addr = %addr, "send queue gone, marking endpoint broken");
                connection.broken = true;
            }
        }
    }

    fn send_to(&mut self, addr: SocketAddr, body: &Body) {
        if let Some(connection) = self.connections.get_mut(&addr) {
            if !connection.endpoint.enqueue(body.to_value()) {
                connection.broken = true;
            }
        }
    }
}
