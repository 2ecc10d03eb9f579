//! Group roster (component C4, §4.4): the group owner's "here is everyone
//! already in the group" broadcast, issued on handshake completion, on
//! client departure, and on a 30 s heartbeat.

use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::message::{Message, MessageKind};
use crate::registry::MeshRegistry;
use serde::{Deserialize, Serialize};

/// One entry of a roster frame's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub device_id: DeviceId,
    pub display_name: String,
    pub is_host: bool,
}

/// Encodes a roster as the broadcast `Roster` message that carries it —
/// every entry travels in the JSON payload since a single message only has
/// room for one `from_user`/`sender_device_id` pair (§4.4).
pub fn to_message(entries: &[RosterEntry], local_id: &DeviceId, message_id: String, timestamp_ms: i64) -> Message {
    let payload = serde_json::to_vec(entries).expect("roster entries always serialize");
    Message::originate(
        message_id,
        String::new(),
        local_id.clone(),
        None,
        MessageKind::Roster,
        payload,
        None,
        None,
        timestamp_ms,
    )
}

/// Decodes a received `Roster` message back into its entries.
pub fn from_message(msg: &Message) -> Result<Vec<RosterEntry>> {
    serde_json::from_slice(&msg.payload).map_err(|e| Error::Malformed(format!("bad roster payload: {e}")))
}

/// Builds the roster the group owner would broadcast right now: itself as
/// host, plus every currently direct-connected neighbour. Only direct
/// neighbours are listed — a late joiner learns multi-hop reach the normal
/// way, by observing `route_path`s, once traffic starts flowing.
pub fn build_roster(
    local_id: &DeviceId,
    local_display_name: &str,
    registry: &MeshRegistry,
) -> Vec<RosterEntry> {
    let mut roster = vec![RosterEntry {
        device_id: local_id.clone(),
        display_name: local_display_name.to_string(),
        is_host: true,
    }];

    for device in registry.devices() {
        if device.is_connected && &device.id != local_id {
            roster.push(RosterEntry {
                device_id: device.id.clone(),
                display_name: device.display_name.clone(),
                is_host: false,
            });
        }
    }

    roster
}
