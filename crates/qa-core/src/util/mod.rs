use std::net::Ipv4Addr;
use tokio::signal;

pub async fn signal_handler() {
    signal::ctrl_c().await.expect("ctrl-c handler installs");
}

/// Seconds since the Unix epoch; every `timestamp` field on the wire.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Check if the string is a valid IPv4 address
pub fn is_ip_addr(ip: &str) -> Result<(), String> {
    match ip.parse::<Ipv4Addr>() {
        Ok(_) => Ok(()),
        Err(_) => Err("Invalid IP Address".to_owned()),
    }
}

/// Check if the string is a valid port
pub fn is_port(port: &str) -> Result<(), String> {
    match port.parse::<u16>() {
        Ok(_) => Ok(()),
        Err(_) => Err("Invalid port number".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ip_addr() {
        assert!(is_ip_addr("1.1.1.1").is_ok());
        assert!(is_ip_addr("192.168.1.1").is_ok());
        assert!(is_ip_addr("0.0.0.0").is_ok());

        assert!(is_ip_addr("foobar").is_err());
        assert!(is_ip_addr("1.1.1").is_err());
        assert!(is_ip_addr("1.1.1.1:8080").is_err());
        assert!(is_ip_addr("").is_err());
    }

    #[test]
    fn test_is_port() {
        assert!(is_port("1").is_ok());
        assert!(is_port("9665").is_ok());
        assert!(is_port("60000").is_ok());

        assert!(is_port("-1").is_err());
        assert!(is_port("foobar").is_err());
        assert!(is_port("100000000").is_err());
        assert!(is_port("").is_err());
    }
}
