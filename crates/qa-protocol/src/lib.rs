// qa-protocol: wire message types and frame serialization for the QA system.
//
// Every frame body is a JSON object with a top-level `type` field used for
// discriminated deserialization. The enum variants map 1:1 to the wire
// message types.

use serde::{Deserialize, Serialize};

pub mod frame;

pub use frame::{FrameDecoder, FrameError, encode};

/// Protocol revision announced in every logon.
pub const PROTOCOL_VERSION: &str = "QAServ1.0";

/// Client revision announced in every logon.
pub const CLIENT_VERSION: &str = "QA_QT1.0";

/// Default broker port.
pub const DEFAULT_PORT: u16 = 9665;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Application-layer role of a connected user.
///
/// There is no authentication behind this; the broker trusts whatever the
/// logon claims. Physical presence in the lab is the security model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Privilege block carried inside a logon.
///
/// `muted` is owned by the broker after subscription; a muted user's
/// `pubmsg` frames are dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privileges {
    #[serde(rename = "type")]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

/// User identity subtree of a logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogonUser {
    pub username: String,
    pub privileges: Privileges,
}

/// Protocol/client version subtree of a logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub protocol: String,
    pub client: String,
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        ProtocolInfo {
            protocol: PROTOCOL_VERSION.to_owned(),
            client: CLIENT_VERSION.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> broker messages
// ---------------------------------------------------------------------------

/// Subscription request. First frame on every client connection.
///
/// The broker keys its subscription registry on the sending endpoint and
/// stores the `user` and `server` subtrees verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logon {
    pub user: LogonUser,
    pub server: ProtocolInfo,
}

/// Public chat line, broadcast to the whole room.
///
/// Clients send only `msg`; the broker fills `username` from the
/// subscription and stamps `timestamp` when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pubmsg {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Screenshot push, routed to admin subscribers only.
///
/// `screenshot` is the base64 of the raw image bytes. Capture itself is out
/// of scope; the broker treats the payload as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub screenshot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Broker -> client messages
// ---------------------------------------------------------------------------

/// Room snapshot delivered to a freshly subscribed client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub users: Vec<String>,
    pub topic: String,
}

/// Join notice, broadcast to everyone already in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrance {
    pub username: String,
    pub timestamp: i64,
}

/// Leave notice, broadcast to the survivors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    pub username: String,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Peer exchange messages
// ---------------------------------------------------------------------------

/// Ask the broker to sign its current address ("sident" = server identity).
///
/// Sent by recovering clients over a bare connection; no logon involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidentVerify {
    pub timestamp: i64,
}

/// Broker's reply to [`SidentVerify`].
///
/// `signature` is the base64 DER DSA signature over
/// `SHA-256(ip_addr "," port "," timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidentResponse {
    pub ip_addr: String,
    pub port: u16,
    pub timestamp: i64,
    pub signature: String,
}

/// Ask a peer client for its best guess at the broker's address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRequest {
    pub timestamp: i64,
}

/// A peer's signed vouch for a broker address.
///
/// `key` is the canonical base64 public key of the broker the record belongs
/// to, `signature` the broker's own signature over
/// `SHA-256(address "," port "," address_timestamp)`. The peer cannot forge
/// this; a recovering client verifies it against its pinned key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub key: String,
    pub address: String,
    pub port: u16,
    pub address_timestamp: i64,
    pub signature: String,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame bodies in the protocol, tagged by the `type` field.
///
/// ```json
/// { "type": "pubmsg", "msg": "hello" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Logon(Logon),
    Pubmsg(Pubmsg),
    Screenshot(Screenshot),
    Room(Room),
    Entrance(Entrance),
    Exit(Exit),
    Quit,
    SidentVerify(SidentVerify),
    SidentResponse(SidentResponse),
    AddressRequest(AddressRequest),
    ServerAddress(ServerAddress),
}

impl Body {
    /// Parse a decoded frame body into a typed message.
    ///
    /// Unknown `type` tags and shape mismatches surface as the serde error;
    /// receivers log and drop those rather than killing the connection.
    pub fn from_value(value: &serde_json::Value) -> Result<Body, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Serialize back into the JSON object the frame codec transports.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("message bodies always serialize")
    }

    /// The wire tag, for logging.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Body::Logon(_) => "logon",
            Body::Pubmsg(_) => "pubmsg",
            Body::Screenshot(_) => "screenshot",
            Body::Room(_) => "room",
            Body::Entrance(_) => "entrance",
            Body::Exit(_) => "exit",
            Body::Quit => "quit",
            Body::SidentVerify(_) => "sident_verify",
            Body::SidentResponse(_) => "sident_response",
            Body::AddressRequest(_) => "address_request",
            Body::ServerAddress(_) => "server_address",
        }
    }
}
