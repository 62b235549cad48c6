//! DSA server identity and address signing.
//!
//! The broker's identity is its DSA public key. The canonical text form is
//! `base64(utf8(y "," g "," p "," q))` with the components in decimal; the
//! SHA-256 of that string is the fingerprint. Address claims are signed over
//! `SHA-256(ip "," port "," timestamp)` and travel as base64 DER signatures.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use dsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use dsa::{Components, KeySize, Signature, SigningKey, VerifyingKey};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use signature::{DigestSigner, DigestVerifier, SignatureEncoding};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed public key encoding")]
    Malformed,
    #[error("signing failed: {0}")]
    Signing(signature::Error),
    #[error("key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file is not valid PKCS#8: {0}")]
    Pkcs8(#[from] dsa::pkcs8::Error),
}

/// Canonical base64 encoding of a public key's `y,g,p,q` components.
pub fn encode_pub(key: &VerifyingKey) -> String {
    let components = key.components();
    let text = format!(
        "{},{},{},{}",
        key.y(),
        components.g(),
        components.p(),
        components.q()
    );
    STANDARD.encode(text.as_bytes())
}

/// Inverse of [`encode_pub`]. Any structural problem is `Malformed`.
pub fn decode_pub(encoded: &str) -> Result<VerifyingKey, IdentityError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|_| IdentityError::Malformed)?;
    let text = String::from_utf8(raw).map_err(|_| IdentityError::Malformed)?;
    let fields: Vec<&str> = text.split(',').collect();
    let [y, g, p, q] = fields.as_slice() else {
        return Err(IdentityError::Malformed);
    };
    let parse = |s: &str| BigUint::parse_bytes(s.as_bytes(), 10).ok_or(IdentityError::Malformed);
    let components = Components::from_components(parse(p)?, parse(q)?, parse(g)?)
        .map_err(|_| IdentityError::Malformed)?;
    VerifyingKey::from_components(components, parse(y)?).map_err(|_| IdentityError::Malformed)
}

/// SHA-256 fingerprint of the canonical public key encoding.
pub fn fingerprint(key: &VerifyingKey) -> [u8; 32] {
    Sha256::digest(encode_pub(key).as_bytes()).into()
}

fn address_digest(ip: &str, port: u16, timestamp: i64) -> Sha256 {
    Sha256::new_with_prefix(format!("{ip},{port},{timestamp}").as_bytes())
}

/// Sign an `(ip, port, timestamp)` claim; returns the base64 DER signature.
pub fn sign_address(
    key: &SigningKey,
    ip: &str,
    port: u16,
    timestamp: i64,
) -> Result<String, IdentityError> {
    let signature: Signature = key
        .try_sign_digest(address_digest(ip, port, timestamp))
        .map_err(IdentityError::Signing)?;
    Ok(STANDARD.encode(signature.to_vec()))
}

/// Check an address claim's signature. Any decoding problem is a plain
/// `false`; callers drop the record and move on.
pub fn verify_address(
    key: &VerifyingKey,
    ip: &str,
    port: u16,
    timestamp: i64,
    signature_b64: &str,
) -> bool {
    let Ok(der) = STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(der.as_slice()) else {
        return false;
    };
    key.verify_digest(address_digest(ip, port, timestamp), &signature)
        .is_ok()
}

/// Generate a fresh broker signing key (DSA 2048/256).
///
/// Parameter generation takes a few seconds; this runs once per broker
/// install.
pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand::rngs::OsRng;
    let components = Components::generate(&mut rng, KeySize::DSA_2048_256);
    SigningKey::generate(&mut rng, components)
}

/// Load the broker key from a PKCS#8 PEM file, generating and persisting one
/// on first run.
pub fn load_or_generate_key(path: &Path) -> Result<SigningKey, IdentityError> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)?;
        return Ok(SigningKey::from_pkcs8_pem(&pem)?);
    }
    let key = generate_signing_key();
    let pem = key.to_pkcs8_pem(LineEnding::LF)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pem.as_bytes())?;
    Ok(key)
}
