//! The message router (component C6): dedup, TTL-bounded relay decisions
//! with split horizon, and local delivery.

use crate::config::MAX_FRAME;
use crate::identity::DeviceId;
use crate::message::Message;
use std::collections::{HashSet, VecDeque};

/// What the router decided to do with an inbound message, for the
/// coordinator to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Already seen; dropped silently.
    Duplicate,
    /// Delivered to the local application layer (broadcast, or targeted at
    /// us), optionally also relayed onward if TTL and target allow.
    Delivered { relay: Option<Message> },
    /// Not for us and not delivered locally; relay onward if possible.
    Relayed(Message),
    /// TTL exhausted or the only viable next hops are on the route already
    /// (split horizon) — the message dies here.
    Dropped,
}

/// Bounded FIFO cache of seen `message_id`s (§4.6). A `HashSet` alone can't
/// tell us what to evict, so it's paired with a `VecDeque` recording
/// insertion order — the same shape the teacher's connection-dedup table
/// uses for its own bounded membership cache.
pub struct DedupCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` if `message_id` was already present (i.e. this is a
    /// duplicate), otherwise records it and returns `false`.
    pub fn check_and_insert(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return true;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Decides the fate of an inbound message. `local_id` is this node's own
/// identity (always excluded from relay targets by the caller's own
/// stream table, not here — split horizon over `route_path` is the only
/// check this function is responsible for). `frame_len` is the serialized
/// frame size, checked against [`MAX_FRAME`] before anything else runs.
pub fn route(
    msg: Message,
    local_id: &DeviceId,
    frame_len: usize,
    dedup: &mut DedupCache,
) -> RouteOutcome {
    if frame_len > MAX_FRAME {
        return RouteOutcome::Dropped;
    }

    if dedup.check_and_insert(&msg.message_id) {
        return RouteOutcome::Duplicate;
    }

    let targets_us = matches!(&msg.target_device_id, Some(target) if target == local_id);
    let is_broadcast = msg.target_device_id.is_none();
    let deliver_locally = targets_us || is_broadcast;

    let can_relay = msg.may_relay() && !(targets_us && !is_broadcast);

    let relay = if can_relay {
        Some(msg.relayed_via(local_id))
    } else {
        None
    };

    if deliver_locally {
        RouteOutcome::Delivered { relay }
    } else if let Some(relay) = relay {
        RouteOutcome::Relayed(relay)
    } else {
        RouteOutcome::Dropped
    }
}

/// Split-horizon check (§4.3): never relay a message back toward a stream
/// whose peer device id already appears in its route path (or is the
/// original sender).
pub fn should_relay_to(msg: &Message, candidate: &DeviceId) -> bool {
    candidate != &msg.sender_device_id && !msg.route_path.contains(candidate)
}
