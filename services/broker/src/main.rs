use broker::{Broker, BrokerConfig};
use clap::{Arg, Command};
use std::path::PathBuf;
use tracing::info;

fn validate_port_value(value: &str) -> Result<u16, String> {
    broker::is_port(value)?;
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "broker starting");

    let matches = Command::new("QA System: Broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Question-and-answer broker for a computer lab")
        .arg(
            Arg::new("host")
                .help("The hostname to serve on")
                .long("host")
                .default_value("localhost"),
        )
        .arg(
            Arg::new("port")
                .help("The port number on which to allow access")
                .short('p')
                .long("port")
                .value_parser(validate_port_value)
                .default_value("9665"),
        )
        .arg(
            Arg::new("key")
                .help("Path to the broker's PKCS#8 signing key; created on first run")
                .short('k')
                .long("key")
                .default_value("broker_identity.pem"),
        )
        .arg(
            Arg::new("topic")
                .help("The room's discussion topic")
                .long("topic")
                .default_value("Lab Q&A"),
        )
        .get_matches();

    let config = BrokerConfig {
        host: matches
            .get_one::<String>("host")
            .expect("host has a default")
            .clone(),
        port: *matches.get_one::<u16>("port").expect("port has a default"),
        key_path: PathBuf::from(
            matches.get_one::<String>("key").expect("key has a default"),
        ),
        topic: matches
            .get_one::<String>("topic")
            .expect("topic has a default")
            .clone(),
    };

    let broker = match Broker::bind(config).await {
        Ok(broker) => broker,
        Err(error) => {
            eprintln!("FATAL: {error}");
            std::process::exit(1);
        }
    };
    info!(addr = %broker.local_addr(), key = %broker.encoded_public_key(), "listening");
    broker.run().await;
}
