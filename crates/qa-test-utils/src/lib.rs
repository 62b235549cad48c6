//! Shared helpers for integration tests.
//!
//! DSA parameter generation is the slow part of every signing test, so the
//! whole test binary shares one small key.

use dsa::{Components, KeySize, SigningKey};
use qa_core::AddressRecord;
use qa_core::identity;
use std::sync::OnceLock;

/// A process-wide 1024/160 signing key. Small and fast; never for
/// production use.
#[allow(deprecated)]
pub fn signing_key() -> &'static SigningKey {
    static KEY: OnceLock<SigningKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::rngs::OsRng;
        let components = Components::generate(&mut rng, KeySize::DSA_1024_160);
        SigningKey::generate(&mut rng, components)
    })
}

/// A second identity, for wrong-key scenarios.
#[allow(deprecated)]
pub fn other_signing_key() -> &'static SigningKey {
    static KEY: OnceLock<SigningKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::rngs::OsRng;
        let components = Components::generate(&mut rng, KeySize::DSA_1024_160);
        SigningKey::generate(&mut rng, components)
    })
}

/// Build a properly signed address record under `key`.
pub fn signed_record(key: &SigningKey, ip: &str, port: u16, timestamp: i64) -> AddressRecord {
    AddressRecord {
        ip: ip.to_owned(),
        port,
        timestamp,
        signature: identity::sign_address(key, ip, port, timestamp)
            .expect("test key signs"),
    }
}
