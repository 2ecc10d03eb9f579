//! Handshake engine (component C4): the per-neighbour state machine that
//! exchanges identity on a freshly connected stream before any traffic is
//! relayed through it.

use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::message::{Message, MessageKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// The fields a `Handshake`/`HandshakeAck` frame carries (§4.3).
#[derive(Debug, Clone)]
pub struct HandshakeFields {
    pub device_id: DeviceId,
    pub display_name: String,
    pub device_name: String,
    pub protocol_version: u32,
}

/// The part of [`HandshakeFields`] that doesn't already have a home on
/// [`Message`] (device id and display name travel as `sender_device_id` and
/// `from_user`); carried as the message's JSON payload.
#[derive(Serialize, Deserialize)]
struct HandshakeWire {
    device_name: String,
    protocol_version: u32,
}

impl HandshakeFields {
    /// Encodes this handshake as the `Handshake` or `HandshakeAck` message
    /// that would be sent for it.
    pub fn to_message(&self, kind: MessageKind, message_id: String, timestamp_ms: i64) -> Message {
        let wire = HandshakeWire {
            device_name: self.device_name.clone(),
            protocol_version: self.protocol_version,
        };
        let payload = serde_json::to_vec(&wire).expect("HandshakeWire always serializes");

        Message::originate(
            message_id,
            self.display_name.clone(),
            self.device_id.clone(),
            None,
            kind,
            payload,
            None,
            None,
            timestamp_ms,
        )
    }

    /// Decodes a received `Handshake` or `HandshakeAck` message back into its
    /// fields.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let wire: HandshakeWire = serde_json::from_slice(&msg.payload)
            .map_err(|e| Error::Malformed(format!("bad handshake payload: {e}")))?;

        Ok(Self {
            device_id: msg.sender_device_id.clone(),
            display_name: msg.from_user.clone(),
            device_name: wire.device_name,
            protocol_version: wire.protocol_version,
        })
    }
}

/// One neighbour stream's handshake state (§4.3's diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingAck,
    Established,
}

/// What the coordinator should do after feeding an inbound `Handshake`
/// frame to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeDecision {
    /// Sender UUID equals ours: loopback, reject outright.
    Loopback,
    /// A handshake from this UUID is already in flight within the expiry
    /// window; drop silently.
    Duplicate,
    /// Register the neighbour (or refresh its display name) and reply with
    /// an ack. `name_changed` tells the coordinator whether to re-emit
    /// `neighbour_up` for an already-known UUID (§4.3 "name changes").
    Accept { name_changed: bool },
}

const IN_FLIGHT_EXPIRY: Duration = Duration::from_secs(10);

/// Tracks in-flight inbound handshakes so a retransmitted `Handshake` frame
/// within the expiry window is recognised as a duplicate rather than
/// reprocessed (§4.3 step 2). One instance serves every neighbour stream —
/// the key is the peer's claimed UUID, not the stream itself.
#[derive(Default)]
pub struct HandshakeEngine {
    in_flight: HashMap<DeviceId, Instant>,
}

impl HandshakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds an inbound handshake frame through steps 1–3 of §4.3.
    /// `existing_display_name` is the name already on file for this UUID in
    /// the registry, if any — `None` means this is a brand new neighbour.
    pub fn on_received(
        &mut self,
        local_id: &DeviceId,
        fields: &HandshakeFields,
        existing_display_name: Option<&str>,
        now: Instant,
    ) -> HandshakeDecision {
        if &fields.device_id == local_id {
            return HandshakeDecision::Loopback;
        }

        if let Some(sent_at) = self.in_flight.get(&fields.device_id) {
            if now.duration_since(*sent_at) <= IN_FLIGHT_EXPIRY {
                return HandshakeDecision::Duplicate;
            }
        }

        self.in_flight.insert(fields.device_id.clone(), now);

        let name_changed = existing_display_name
            .map(|existing| existing != fields.display_name)
            .unwrap_or(true);

        HandshakeDecision::Accept { name_changed }
    }

    /// Periodic sweep dropping in-flight entries past their expiry, so the
    /// map doesn't grow across a long-running session (§9's dedup-lifetime
    /// note applies here too: this set has its own TTL, independent of
    /// anything else).
    pub fn sweep_expired(&mut self, now: Instant) {
        self.in_flight.retain(|_, sent_at| now.duration_since(*sent_at) <= IN_FLIGHT_EXPIRY);
    }
}
