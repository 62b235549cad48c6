//! Recovery loop scenarios: redial from the address book, the peer
//! address-request fallback, and refusal of records that do not verify
//! under the pinned key.

use broker::{Broker, BrokerConfig};
use client::{RecoveryError, Session, run_recovery, serve_peers};
use qa_core::{AddressBook, PeerList, Settings};
use qa_protocol::Body;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep, timeout};

async fn spawn_broker() -> SocketAddr {
    let config = BrokerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        key_path: PathBuf::new(),
        topic: "Lab Q&A".to_owned(),
    };
    let broker = Broker::bind_with_key(config, qa_test_utils::signing_key().clone())
        .await
        .unwrap();
    let addr = broker.local_addr();
    tokio::spawn(broker.run());
    addr
}

fn session_in(dir: &tempfile::TempDir, username: &str) -> Session {
    let path = dir.path().join(format!("{username}.conf"));
    let mut settings = Settings::load_or_create(&path).unwrap();
    settings.user.username = username.to_owned();
    settings.save(&path).unwrap();
    Session::new(settings, path)
}

/// A port that was just bound and released, so dialing it fails fast.
async fn dead_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

/// Connect the session to a throwaway listener, then return the pieces the
/// test drops to sever the connection.
async fn connect_to_doomed(session: &mut Session) -> (TcpListener, tokio::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    session
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (listener, accepted)
}

async fn pull_type(session: &Arc<Mutex<Session>>, tag: &str) -> Body {
    timeout(Duration::from_secs(15), async {
        loop {
            let next = session.lock().await.get_msg();
            match next {
                Some(body) if body.type_tag() == tag => return body,
                Some(_) => {}
                None => sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("expected frame type within timeout")
}

/// Broadcast a pubmsg into the room every 200 ms so a late joiner has
/// something to receive.
async fn chatter(addr: SocketAddr, dir: &tempfile::TempDir) {
    let mut sender = session_in(dir, "chatter");
    sender
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    sender.logon().unwrap();
    tokio::spawn(async move {
        loop {
            if sender.pubmsg("anyone there?").is_err() {
                return;
            }
            sleep(Duration::from_millis(200)).await;
        }
    });
}

#[tokio::test]
async fn recovers_from_a_fresh_address_book_record() {
    let key = qa_test_utils::signing_key();
    let broker_addr = spawn_broker().await;
    let dir = tempfile::tempdir().unwrap();

    let mut session = session_in(&dir, "lost");
    let doomed = connect_to_doomed(&mut session).await;
    let session = Arc::new(Mutex::new(session));

    let mut book = AddressBook::new();
    // The newest record points at a dead address; iteration must fall
    // through to the older record that still answers.
    book.add_address(
        key.verifying_key(),
        qa_test_utils::signed_record(key, "127.0.0.1", dead_port().await, 300),
    )
    .unwrap();
    book.add_address(
        key.verifying_key(),
        qa_test_utils::signed_record(key, "127.0.0.1", broker_addr.port(), 200),
    )
    .unwrap();
    let book = Arc::new(Mutex::new(book));

    tokio::spawn(run_recovery(
        Arc::clone(&session),
        Arc::clone(&book),
        Arc::new(Mutex::new(PeerList::new())),
        key.verifying_key().clone(),
    ));

    chatter(broker_addr, &dir).await;
    drop(doomed);

    match pull_type(&session, "pubmsg").await {
        Body::Pubmsg(msg) => assert_eq!(msg.msg, "anyone there?"),
        other => panic!("expected pubmsg, got {other:?}"),
    }
    assert!(session.lock().await.is_connected());
}

#[tokio::test]
async fn recovers_through_a_peer_vouch() {
    let key = qa_test_utils::signing_key();
    let broker_addr = spawn_broker().await;
    let dir = tempfile::tempdir().unwrap();

    let mut session = session_in(&dir, "stranded");
    let doomed = connect_to_doomed(&mut session).await;
    let session = Arc::new(Mutex::new(session));

    // The client's own book only knows a dead address.
    let mut book = AddressBook::new();
    book.add_address(
        key.verifying_key(),
        qa_test_utils::signed_record(key, "127.0.0.1", dead_port().await, 100),
    )
    .unwrap();
    let book = Arc::new(Mutex::new(book));

    // A peer holds a fresh record pointing at the live broker.
    let mut peer_book = AddressBook::new();
    peer_book
        .add_address(
            key.verifying_key(),
            qa_test_utils::signed_record(key, "127.0.0.1", broker_addr.port(), 200),
        )
        .unwrap();
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    tokio::spawn(serve_peers(
        peer_listener,
        Arc::new(Mutex::new(peer_book)),
    ));

    let mut peers = PeerList::new();
    peers
        .add(&peer_addr.ip().to_string(), peer_addr.port())
        .unwrap();

    tokio::spawn(run_recovery(
        Arc::clone(&session),
        Arc::clone(&book),
        Arc::new(Mutex::new(peers)),
        key.verifying_key().clone(),
    ));

    chatter(broker_addr, &dir).await;
    drop(doomed);

    match pull_type(&session, "pubmsg").await {
        Body::Pubmsg(msg) => assert_eq!(msg.msg, "anyone there?"),
        other => panic!("expected pubmsg, got {other:?}"),
    }

    // The vouched record made it into the book.
    let book = book.lock().await;
    assert!(
        book.list_by_key(key.verifying_key())
            .iter()
            .any(|r| r.port == broker_addr.port()),
        "recovered address must be stored"
    );
}

#[tokio::test]
async fn a_peer_with_the_wrong_key_cannot_misdirect() {
    let pinned = qa_test_utils::signing_key();
    let impostor = qa_test_utils::other_signing_key();
    let dir = tempfile::tempdir().unwrap();

    let mut session = session_in(&dir, "wary");
    let doomed = connect_to_doomed(&mut session).await;
    let session = Arc::new(Mutex::new(session));

    // The peer's book vouches under the impostor's identity.
    let mut peer_book = AddressBook::new();
    peer_book
        .add_address(
            impostor.verifying_key(),
            qa_test_utils::signed_record(impostor, "127.0.0.1", 9665, 500),
        )
        .unwrap();
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    tokio::spawn(serve_peers(
        peer_listener,
        Arc::new(Mutex::new(peer_book)),
    ));

    let mut peers = PeerList::new();
    peers
        .add(&peer_addr.ip().to_string(), peer_addr.port())
        .unwrap();

    let recovery = tokio::spawn(run_recovery(
        Arc::clone(&session),
        Arc::new(Mutex::new(AddressBook::new())),
        Arc::new(Mutex::new(peers)),
        pinned.verifying_key().clone(),
    ));

    drop(doomed);

    let outcome = timeout(Duration::from_secs(15), recovery)
        .await
        .expect("recovery must give up promptly")
        .unwrap();
    assert!(matches!(outcome, Err(RecoveryError::Configuration)));
}
