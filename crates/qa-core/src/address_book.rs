//! Signed broker address book and peer list.
//!
//! The book maps a broker identity (canonical public key encoding) to every
//! address the broker is known to have hosted at, each carrying the broker's
//! own signature over `(ip, port, timestamp)`. A record only enters the book
//! after its signature verifies, so a stored record is always safe to dial.
//! The `most_recent` sentinel names the identity whose newest record was
//! accepted last.

use crate::identity;
use dsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressBookError {
    #[error("address record signature does not verify under its key")]
    BadSignature,
    #[error("peer address is not a valid IP address: {0:?}")]
    InvalidPeer(String),
}

/// One signed claim that the broker was reachable at `(ip, port)` at
/// `timestamp`. `signature` is base64 DER, exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub ip: String,
    pub port: u16,
    pub timestamp: i64,
    pub signature: String,
}

/// Broker identities and their verified address history.
///
/// Serializes into the client settings blob under `server_address_book`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    /// Canonical public key encoding → records, newest first.
    #[serde(default)]
    servers: BTreeMap<String, Vec<AddressRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    most_recent: Option<String>,
}

impl AddressBook {
    pub fn new() -> AddressBook {
        AddressBook::default()
    }

    /// Ensure an (possibly empty) entry exists for `key`. Returns whether
    /// the identity was new.
    pub fn add_server(&mut self, key: &VerifyingKey) -> bool {
        let encoded = identity::encode_pub(key);
        if self.servers.contains_key(&encoded) {
            return false;
        }
        self.servers.insert(encoded, Vec::new());
        true
    }

    /// Verify and insert an address record under `key`.
    ///
    /// Returns `Ok(true)` when the record was new, `Ok(false)` when it was
    /// already present. A signature that does not verify never touches the
    /// book.
    pub fn add_address(
        &mut self,
        key: &VerifyingKey,
        record: AddressRecord,
    ) -> Result<bool, AddressBookError> {
        if !identity::verify_address(key, &record.ip, record.port, record.timestamp, &record.signature)
        {
            return Err(AddressBookError::BadSignature);
        }
        let encoded = identity::encode_pub(key);
        let records = self.servers.entry(encoded.clone()).or_default();
        if records.contains(&record) {
            return Ok(false);
        }

        let newest_for_sentinel = self
            .most_recent
            .as_ref()
            .and_then(|k| self.newest_timestamp(k));
        if newest_for_sentinel.is_none_or(|newest| record.timestamp > newest) {
            self.most_recent = Some(encoded.clone());
        }

        let records = self.servers.entry(encoded).or_default();
        let position = records
            .iter()
            .position(|r| r.timestamp < record.timestamp)
            .unwrap_or(records.len());
        records.insert(position, record);
        Ok(true)
    }

    pub fn remove_server(&mut self, key: &VerifyingKey) -> bool {
        let encoded = identity::encode_pub(key);
        if self.most_recent.as_deref() == Some(encoded.as_str()) {
            self.most_recent = None;
        }
        self.servers.remove(&encoded).is_some()
    }

    /// Records for `key`, newest first. Empty when the identity is unknown.
    pub fn list_by_key(&self, key: &VerifyingKey) -> &[AddressRecord] {
        self.servers
            .get(&identity::encode_pub(key))
            .map_or(&[], Vec::as_slice)
    }

    /// The newest record of the identity last updated, with its canonical
    /// key encoding.
    pub fn most_recent_record(&self) -> Option<(&str, &AddressRecord)> {
        let key = self.most_recent.as_deref()?;
        let record = self.servers.get(key)?.first()?;
        Some((key, record))
    }

    fn newest_timestamp(&self, encoded_key: &str) -> Option<i64> {
        self.servers
            .get(encoded_key)?
            .iter()
            .map(|r| r.timestamp)
            .max()
    }
}

/// Peer clients learned from past interactions, dialed when no address book
/// record answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    peers: BTreeSet<(String, u16)>,
}

impl PeerList {
    pub fn new() -> PeerList {
        PeerList::default()
    }

    /// Returns `Ok(true)` when the peer was new.
    pub fn add(&mut self, ip: &str, port: u16) -> Result<bool, AddressBookError> {
        if ip.parse::<IpAddr>().is_err() {
            return Err(AddressBookError::InvalidPeer(ip.to_owned()));
        }
        Ok(self.peers.insert((ip.to_owned(), port)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, u16)> {
        self.peers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
