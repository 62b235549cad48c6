//! Session controller against a live broker.

use broker::{Broker, BrokerConfig};
use client::Session;
use qa_core::Settings;
use qa_protocol::Body;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
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

async fn pull_type(session: &Arc<Mutex<Session>>, tag: &str) -> Body {
    timeout(Duration::from_secs(10), async {
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

#[tokio::test]
async fn logon_pubmsg_round_trip() {
    let addr = spawn_broker().await;
    let dir = tempfile::tempdir().unwrap();

    let mut alice = session_in(&dir, "alice");
    alice
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    alice.logon().unwrap();

    let mut bob = session_in(&dir, "bob");
    bob.connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    bob.logon().unwrap();

    alice.pubmsg("hello from alice").unwrap();

    let alice = Arc::new(Mutex::new(alice));
    let bob = Arc::new(Mutex::new(bob));
    for session in [&alice, &bob] {
        match pull_type(session, "pubmsg").await {
            Body::Pubmsg(msg) => {
                assert_eq!(msg.msg, "hello from alice");
                assert_eq!(msg.username.as_deref(), Some("alice"));
                assert!(msg.timestamp.is_some());
            }
            other => panic!("expected pubmsg, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn failed_connect_installs_no_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_in(&dir, "loner");

    // Nothing listens here; the configured fallback is localhost on the
    // same dead port.
    let dead_port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let result = session.connect(Some("127.0.0.1"), dead_port).await;
    assert!(result.is_err());
    assert!(!session.is_connected());
    assert!(session.logon().is_err(), "actions require a connection");

    // The session stays usable for a later attempt.
    let addr = spawn_broker().await;
    session
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    assert!(session.is_connected());
}

#[tokio::test]
async fn quit_is_announced_to_the_room() {
    let addr = spawn_broker().await;
    let dir = tempfile::tempdir().unwrap();

    let mut watcher = session_in(&dir, "watcher");
    watcher
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    watcher.logon().unwrap();

    let mut quitter = session_in(&dir, "quitter");
    quitter
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    quitter.logon().unwrap();
    quitter.quit().await;
    assert!(!quitter.is_connected());

    let watcher = Arc::new(Mutex::new(watcher));
    match pull_type(&watcher, "exit").await {
        Body::Exit(exit) => assert_eq!(exit.username, "quitter"),
        other => panic!("expected exit, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_loss_latches_the_error_signal() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_in(&dir, "abandoned");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    session
        .connect(Some(&addr.ip().to_string()), addr.port())
        .await
        .unwrap();
    let mut connection_error = session.connection_error();
    assert!(!*connection_error.borrow_and_update());

    // Kill the server side.
    let (accepted, _) = listener.accept().await.unwrap();
    drop(accepted);
    drop(listener);

    timeout(Duration::from_secs(5), connection_error.changed())
        .await
        .expect("latch within timeout")
        .unwrap();
    assert!(*connection_error.borrow_and_update());
}
