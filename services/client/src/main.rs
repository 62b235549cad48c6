//! Debug line-menu client.
//!
//! Drives one session by hand: `connect <host> [port]`, `logon`,
//! `pubmsg <text>`, `screenshot <file>`, `pull_msg`, `quit`. With a pinned
//! server key the recovery loop runs in the background and, when a peer
//! port is given, this client also answers `address_request` frames.

use clap::{Arg, Command};
use client::{Session, run_recovery, serve_peers};
use qa_core::{AddressBook, PeerList, Settings, identity};
use qa_protocol::{Body, DEFAULT_PORT};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

fn validate_port_value(value: &str) -> Result<u16, String> {
    qa_core::util::is_port(value)?;
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let matches = Command::new("QA System: Debug Client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Line-menu client for the question-and-answer broker")
        .arg(
            Arg::new("settings")
                .help("Settings file path; defaults to the platform location")
                .long("settings"),
        )
        .arg(
            Arg::new("server_key")
                .help("Pinned broker public key (canonical base64); enables recovery")
                .long("server-key"),
        )
        .arg(
            Arg::new("peer_port")
                .help("Port to answer peer address requests on (0 = disabled)")
                .long("peer-port")
                .value_parser(validate_port_value)
                .default_value("0"),
        )
        .get_matches();

    let settings_path = match matches.get_one::<String>("settings") {
        Some(path) => PathBuf::from(path),
        None => match Settings::default_path() {
            Ok(path) => path,
            Err(error) => {
                eprintln!("FATAL: {error}");
                std::process::exit(1);
            }
        },
    };
    let settings = match Settings::load_or_create(&settings_path) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("FATAL: {error}");
            std::process::exit(1);
        }
    };

    let book = Arc::new(Mutex::new(
        settings.server_address_book.clone().unwrap_or_default(),
    ));
    let session = Arc::new(Mutex::new(Session::new(settings, settings_path)));

    if let Some(encoded) = matches.get_one::<String>("server_key") {
        match identity::decode_pub(encoded) {
            Ok(pinned) => {
                let peers = Arc::new(Mutex::new(PeerList::new()));
                tokio::spawn(recovery_task(
                    Arc::clone(&session),
                    Arc::clone(&book),
                    peers,
                    pinned,
                ));
                info!("recovery loop armed");
            }
            Err(error) => {
                eprintln!("FATAL: bad --server-key: {error}");
                std::process::exit(1);
            }
        }
    }

    let peer_port = *matches
        .get_one::<u16>("peer_port")
        .expect("peer_port has a default");
    if peer_port != 0 {
        match tokio::net::TcpListener::bind(("0.0.0.0", peer_port)).await {
            Ok(listener) => {
                tokio::spawn(serve_peers(listener, Arc::clone(&book)));
                info!(peer_port, "answering peer address requests");
            }
            Err(error) => warn!(%error, peer_port, "could not bind peer port"),
        }
    }

    menu_loop(session).await;
}

async fn recovery_task(
    session: Arc<Mutex<Session>>,
    book: Arc<Mutex<AddressBook>>,
    peers: Arc<Mutex<PeerList>>,
    pinned: dsa::VerifyingKey,
) {
    if let Err(error) = run_recovery(session, book, peers, pinned).await {
        error!(%error, "recovery gave up");
        eprintln!("unrecoverable: {error}");
    }
}

async fn menu_loop(session: Arc<Mutex<Session>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "connect" => {
                let (host, port) = match rest.split_once(' ') {
                    Some((host, port)) => match port.parse::<u16>() {
                        Ok(port) => (host, port),
                        Err(_) => {
                            println!("bad port: {port}");
                            continue;
                        }
                    },
                    None => (rest, DEFAULT_PORT),
                };
                let host = (!host.is_empty()).then_some(host);
                match session.lock().await.connect(host, port).await {
                    Ok(()) => println!("connected"),
                    Err(error) => println!("connect failed: {error}"),
                }
            }
            "logon" => report(session.lock().await.logon()),
            "pubmsg" => report(session.lock().await.pubmsg(rest)),
            "screenshot" => match std::fs::read(rest) {
                Ok(image) => report(session.lock().await.screenshot(&image)),
                Err(error) => println!("cannot read {rest}: {error}"),
            },
            "pull_msg" => {
                let mut session = session.lock().await;
                match session.get_msg() {
                    Some(body) => print_body(&body),
                    None => println!("(no messages pending)"),
                }
            }
            "quit" => {
                session.lock().await.quit().await;
                println!("bye");
                return;
            }
            "" => {}
            _ => print_help(),
        }
    }
}

fn report(result: Result<(), client::SessionError>) {
    match result {
        Ok(()) => println!("ok"),
        Err(error) => println!("error: {error}"),
    }
}

fn print_body(body: &Body) {
    match body {
        Body::Pubmsg(msg) => println!(
            "<{}> {}",
            msg.username.as_deref().unwrap_or("?"),
            msg.msg
        ),
        Body::Room(room) => println!("room '{}': {:?}", room.topic, room.users),
        Body::Entrance(entrance) => println!("* {} joined", entrance.username),
        Body::Exit(exit) => println!("* {} left", exit.username),
        Body::Screenshot(shot) => {
            println!(
                "screenshot from {} ({} base64 bytes)",
                shot.username.as_deref().unwrap_or("?"),
                shot.screenshot.len()
            );
        }
        other => println!("{other:?}"),
    }
}

fn print_help() {
    println!(
        "commands: connect <host> [port] | logon | pubmsg <text> | \
         screenshot <file> | pull_msg | quit"
    );
}
