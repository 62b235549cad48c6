//! Peer recovery loop.
//!
//! When the session latches a connection error, this worker walks the
//! address book for the pinned broker key, newest record first, and
//! challenges each address to prove it still holds the key. If no stored
//! address answers, it asks peer clients for a fresher signed record and
//! retries with whatever verifies. Both passes exhausted means the client
//! must be reconfigured by hand.
//!
//! The signed challenge closes the trust loop: a peer cannot misdirect a
//! client, because the record it hands over must verify under the key the
//! client already pins.

use crate::session::Session;
use dsa::VerifyingKey;
use qa_core::util::unix_timestamp;
use qa_core::{AddressBook, AddressRecord, PeerList, identity};
use qa_protocol::{AddressRequest, Body, FrameDecoder, ServerAddress, SidentVerify, encode};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no stored address or peer could produce the server; reconfigure the client")]
    Configuration,
}

/// Wait on the session's connection-error latch and recover, forever.
///
/// Returns only when recovery is impossible; the caller surfaces that to
/// the user.
pub async fn run_recovery(
    session: Arc<Mutex<Session>>,
    book: Arc<Mutex<AddressBook>>,
    peers: Arc<Mutex<PeerList>>,
    pinned: VerifyingKey,
) -> Result<(), RecoveryError> {
    let mut connection_error = session.lock().await.connection_error();
    loop {
        if !*connection_error.borrow_and_update() {
            if connection_error.changed().await.is_err() {
                // Session dropped; nothing left to recover.
                return Ok(());
            }
            continue;
        }
        info!("connection error latched, starting recovery");
        recover_once(&session, &book, &peers, &pinned).await?;
    }
}

/// One full recovery attempt: stored records first, then peers.
async fn recover_once(
    session: &Arc<Mutex<Session>>,
    book: &Arc<Mutex<AddressBook>>,
    peers: &Arc<Mutex<PeerList>>,
    pinned: &VerifyingKey,
) -> Result<(), RecoveryError> {
    let records: Vec<AddressRecord> = book.lock().await.list_by_key(pinned).to_vec();
    for record in records {
        if try_address(session, book, pinned, &record.ip, record.port).await {
            return Ok(());
        }
    }

    let peer_addrs: Vec<(String, u16)> = peers.lock().await.iter().cloned().collect();
    for (peer_ip, peer_port) in peer_addrs {
        let Some(vouch) = request_server_address(&peer_ip, peer_port, pinned).await else {
            continue;
        };
        let record = AddressRecord {
            ip: vouch.address.clone(),
            port: vouch.port,
            timestamp: vouch.address_timestamp,
            signature: vouch.signature.clone(),
        };
        let added = book.lock().await.add_address(pinned, record);
        match added {
            Ok(new) => debug!(address = %vouch.address, new, "peer record accepted"),
            Err(error) => {
                warn!(%error, "peer record rejected");
                continue;
            }
        }
        save_book(session, book).await;
        if try_address(session, book, pinned, &vouch.address, vouch.port).await {
            return Ok(());
        }
    }

    Err(RecoveryError::Configuration)
}

/// Challenge one candidate address and, on proof, reconnect the session.
async fn try_address(
    session: &Arc<Mutex<Session>>,
    book: &Arc<Mutex<AddressBook>>,
    pinned: &VerifyingKey,
    ip: &str,
    port: u16,
) -> bool {
    let Some(response) = sident_challenge(ip, port, pinned).await else {
        return false;
    };

    // The response is a fresh signed record; keep it.
    let record = AddressRecord {
        ip: response.ip_addr.clone(),
        port: response.port,
        timestamp: response.timestamp,
        signature: response.signature.clone(),
    };
    let added = book.lock().await.add_address(pinned, record);
    if let Ok(true) = added {
        save_book(session, book).await;
    }

    let mut session = session.lock().await;
    match session.reconnect(&response.ip_addr, response.port).await {
        Ok(()) => {
            if let Err(error) = session.logon() {
                warn!(%error, "reconnected but logon failed");
                return false;
            }
            session.clear_connection_error();
            info!(ip = %response.ip_addr, port = response.port, "recovered");
            true
        }
        Err(error) => {
            debug!(%ip, port, %error, "challenge passed but reconnect failed");
            false
        }
    }
}

/// Connect to a candidate address and ask it to sign its own identity.
///
/// `None` for every failure: unreachable, wrong protocol, or a signature
/// that does not verify under the pinned key.
async fn sident_challenge(
    ip: &str,
    port: u16,
    pinned: &VerifyingKey,
) -> Option<qa_protocol::SidentResponse> {
    let mut stream = dial(ip, port).await?;
    let verify = Body::SidentVerify(SidentVerify {
        timestamp: unix_timestamp(),
    });
    stream.write_all(&encode(&verify.to_value())).await.ok()?;

    let response = match read_reply(&mut stream, "sident_response").await? {
        Body::SidentResponse(response) => response,
        _ => return None,
    };
    if !identity::verify_address(
        pinned,
        &response.ip_addr,
        response.port,
        response.timestamp,
        &response.signature,
    ) {
        warn!(%ip, port, "sident_response signature did not verify, dropping");
        return None;
    }
    Some(response)
}

/// Ask a peer for its best broker record and verify it against the pinned
/// key before believing anything.
async fn request_server_address(
    peer_ip: &str,
    peer_port: u16,
    pinned: &VerifyingKey,
) -> Option<ServerAddress> {
    let mut stream = dial(peer_ip, peer_port).await?;
    let request = Body::AddressRequest(AddressRequest {
        timestamp: unix_timestamp(),
    });
    stream.write_all(&encode(&request.to_value())).await.ok()?;

    let vouch = match read_reply(&mut stream, "server_address").await? {
        Body::ServerAddress(vouch) => vouch,
        _ => return None,
    };
    if vouch.key != identity::encode_pub(pinned) {
        debug!(%peer_ip, "peer vouched for a different server key, skipping");
        return None;
    }
    if !identity::verify_address(
        pinned,
        &vouch.address,
        vouch.port,
        vouch.address_timestamp,
        &vouch.signature,
    ) {
        warn!(%peer_ip, "server_address signature did not verify, dropping");
        return None;
    }
    Some(vouch)
}

async fn dial(ip: &str, port: u16) -> Option<TcpStream> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((ip, port))).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(error)) => {
            debug!(%ip, port, %error, "dial failed");
            None
        }
        Err(_) => {
            debug!(%ip, port, "dial timed out");
            None
        }
    }
}

/// Read frames off a short-lived challenge connection until one of the
/// wanted type arrives.
async fn read_reply(stream: &mut TcpStream, wanted: &str) -> Option<Body> {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        match decoder.next_frame() {
            Ok(Some(value)) => match Body::from_value(&value) {
                Ok(body) if body.type_tag() == wanted => return Some(body),
                Ok(_) | Err(_) => continue,
            },
            Ok(None) => {}
            Err(error) => {
                debug!(%error, "framing error on challenge connection");
                return None;
            }
        }
        let n = timeout_at_read(stream, &mut chunk, deadline).await?;
        decoder.extend(&chunk[..n]);
    }
}

async fn timeout_at_read(
    stream: &mut TcpStream,
    chunk: &mut [u8],
    deadline: tokio::time::Instant,
) -> Option<usize> {
    match tokio::time::timeout_at(deadline, stream.read(chunk)).await {
        Ok(Ok(0)) | Err(_) => None,
        Ok(Ok(n)) => Some(n),
        Ok(Err(_)) => None,
    }
}

/// Answer `address_request` frames from other clients with this client's
/// best signed record.
///
/// Runs until the listener errors; frames other than `address_request` are
/// ignored.
pub async fn serve_peers(listener: TcpListener, book: Arc<Mutex<AddressBook>>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "peer listener failed");
                return;
            }
        };
        debug!(%addr, "peer connected");
        tokio::spawn(answer_peer(stream, Arc::clone(&book)));
    }
}

async fn answer_peer(mut stream: TcpStream, book: Arc<Mutex<AddressBook>>) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        match decoder.next_frame() {
            Ok(Some(value)) => {
                if let Ok(Body::AddressRequest(_)) = Body::from_value(&value) {
                    let vouch = {
                        let book = book.lock().await;
                        book.most_recent_record().map(|(key, record)| {
                            Body::ServerAddress(ServerAddress {
                                key: key.to_owned(),
                                address: record.ip.clone(),
                                port: record.port,
                                address_timestamp: record.timestamp,
                                signature: record.signature.clone(),
                                timestamp: unix_timestamp(),
                            })
                        })
                    };
                    match vouch {
                        Some(body) => {
                            if stream.write_all(&encode(&body.to_value())).await.is_err() {
                                return;
                            }
                        }
                        None => debug!("no address record to vouch for"),
                    }
                }
            }
            Ok(None) => {
                let Some(n) = timeout_at_read(&mut stream, &mut chunk, deadline).await else {
                    return;
                };
                decoder.extend(&chunk[..n]);
            }
            Err(error) => {
                debug!(%error, "framing error from peer");
                return;
            }
        }
    }
}

async fn save_book(session: &Arc<Mutex<Session>>, book: &Arc<Mutex<AddressBook>>) {
    let book = book.lock().await.clone();
    let mut session = session.lock().await;
    let (settings, path) = session.settings_mut();
    let path = path.clone();
    if let Err(error) = settings.save_address_book(&book, &path) {
        warn!(%error, "could not persist the address book");
    }
}
