//! The wire frame (§6) and the domain `Message` entity (§3), and the
//! conversions between them.

use crate::config::DEFAULT_TTL;
use crate::error::{Error, Result};
use crate::identity::DeviceId;
use serde::{Deserialize, Serialize};

/// The `type` tag of a wire frame, shared verbatim by the domain `Message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Emergency,
    Sos,
    Location,
    Handshake,
    HandshakeAck,
    Roster,
    Ping,
    Pong,
    Ack,
}

impl MessageKind {
    /// Text, Location, Emergency and Sos frames sent to a named target are
    /// acknowledged by the recipient (§4.6).
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            MessageKind::Text | MessageKind::Location | MessageKind::Emergency | MessageKind::Sos
        )
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, MessageKind::Emergency | MessageKind::Sos)
    }
}

/// One JSON object, UTF-8, LF-terminated, as it appears on the wire (§6).
/// A receiver must ignore unknown top-level fields, which falls out for
/// free from plain `serde` struct deserialization (no `deny_unknown_fields`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message_id: String,
    pub device_id: String,
    pub user_name: String,
    pub target: Option<String>,
    pub ttl: u8,
    pub route: Vec<String>,
    pub ts: i64,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

/// The mesh's view of a message, wire-visible but resolved to canonical
/// `DeviceId`s and decoded payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub from_user: String,
    pub sender_device_id: DeviceId,
    pub target_device_id: Option<DeviceId>,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub ttl: u8,
    pub route_path: Vec<DeviceId>,
    pub timestamp_ms: i64,
    pub is_emergency: bool,
}

impl Message {
    /// Builds a freshly originated message: `ttl = DEFAULT_TTL`, empty
    /// route path, per §3's lifecycle.
    pub fn originate(
        message_id: String,
        from_user: String,
        sender_device_id: DeviceId,
        target_device_id: Option<DeviceId>,
        kind: MessageKind,
        payload: Vec<u8>,
        latitude: Option<f64>,
        longitude: Option<f64>,
        timestamp_ms: i64,
    ) -> Self {
        let is_emergency = kind.is_emergency();
        Self {
            message_id,
            from_user,
            sender_device_id,
            target_device_id,
            kind,
            payload,
            latitude,
            longitude,
            ttl: DEFAULT_TTL,
            route_path: Vec::new(),
            timestamp_ms,
            is_emergency,
        }
    }

    /// Decodes a frame read off the wire. Any malformed base64 payload or
    /// unparseable device id is reported as [`Error::Malformed`] rather than
    /// panicking — frames originate from an untrusted peer.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        if frame.ttl as usize > DEFAULT_TTL as usize {
            return Err(Error::Malformed(format!("ttl {} exceeds budget", frame.ttl)));
        }

        let payload = base64_decode(&frame.payload)
            .map_err(|e| Error::Malformed(format!("bad payload encoding: {e}")))?;

        Ok(Self {
            message_id: frame.message_id,
            from_user: frame.user_name,
            sender_device_id: DeviceId::from_canonical(frame.device_id),
            target_device_id: frame.target.map(DeviceId::from_canonical),
            is_emergency: frame.kind.is_emergency(),
            kind: frame.kind,
            payload,
            latitude: frame.lat,
            longitude: frame.lon,
            ttl: frame.ttl,
            route_path: frame.route.into_iter().map(DeviceId::from_canonical).collect(),
            timestamp_ms: frame.ts,
        })
    }

    /// Encodes this message as the wire frame that would be sent for it.
    pub fn to_frame(&self) -> Frame {
        Frame {
            kind: self.kind,
            message_id: self.message_id.clone(),
            device_id: self.sender_device_id.as_str().to_string(),
            user_name: self.from_user.clone(),
            target: self.target_device_id.as_ref().map(|id| id.as_str().to_string()),
            ttl: self.ttl,
            route: self.route_path.iter().map(|id| id.as_str().to_string()).collect(),
            ts: self.timestamp_ms,
            payload: base64_encode(&self.payload),
            lat: self.latitude,
            lon: self.longitude,
        }
    }

    /// Whether this frame, received with its current `ttl`, may still be
    /// relayed (boundary case: `ttl == 0` is delivered locally if targeted,
    /// but never relayed — §8).
    pub fn may_relay(&self) -> bool {
        self.ttl > 0
    }

    /// Produces the frame this node would send onward: `ttl` decremented and
    /// the local id appended to the route path.
    pub fn relayed_via(&self, local_id: &DeviceId) -> Self {
        let mut next = self.clone();
        next.ttl -= 1;
        next.route_path.push(local_id.clone());
        next
    }

    /// Builds the `Ack` this node sends back to the original sender, keyed
    /// on the same `message_id` so the waiting `await_ack` future can match
    /// it (§4.6 "acknowledged deliveries").
    pub fn ack(&self, local_id: &DeviceId, timestamp_ms: i64) -> Self {
        Self::originate(
            self.message_id.clone(),
            String::new(),
            local_id.clone(),
            Some(self.sender_device_id.clone()),
            MessageKind::Ack,
            Vec::new(),
            None,
            None,
            timestamp_ms,
        )
    }
}

// A small hand-rolled base64 codec would be an unnecessary reinvention —
// the payload format the wire protocol calls for is exactly what the
// `base64` crate exists to produce, so we reuse it like the rest of the
// ecosystem does for binary-over-JSON payloads.
fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}
