//! The mesh registry (component C5): the directory of every device this
//! node currently knows about, direct or multi-hop, with staleness
//! eviction. Also backs the identity resolver's [`crate::identity::ResolverContext`]
//! since the two are tightly coupled in the design (§9: "cyclic
//! registry/transport relationship ... resolved by letting the coordinator
//! be the single owner").

use crate::config::{HOP_COUNT_UNKNOWN, MAX_TTL};
use crate::identity::{DeviceId, MacAddress, ResolverContext};
use crate::message::Message;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// How a device entry first became known to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMethod {
    WirelessDirect,
    Handshake,
    RouteObservation,
    GroupRoster,
}

/// A known device, direct or multi-hop (§3).
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub display_name: String,
    pub is_host: bool,
    pub hop_count: u8,
    pub last_seen: Instant,
    pub discovery_method: DiscoveryMethod,
    pub is_connected: bool,
}

/// Directory of all known devices plus the MAC→UUID alias table (§4.1,
/// §4.5). Exclusively owned by the connection coordinator (§3 "Ownership &
/// lifetime"); every other component reaches it only through a borrowed
/// reference the coordinator hands out.
#[derive(Default)]
pub struct MeshRegistry {
    devices: HashMap<DeviceId, Device>,
    mac_aliases: HashMap<MacAddress, DeviceId>,
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Sets (or overwrites) the alias for `mac`. The "never redefined except
    /// by explicit disconnect-then-reconnect" invariant (§3) is upheld by
    /// construction: the handshake engine is the only caller, and it only
    /// calls this once per completed handshake, which only happens once per
    /// connection — reconnecting means a brand new handshake, which is
    /// exactly the sanctioned redefinition path.
    pub fn set_alias(&mut self, mac: MacAddress, id: DeviceId) {
        self.mac_aliases.insert(mac, id);
    }

    pub fn alias_for(&self, mac: &MacAddress) -> Option<DeviceId> {
        self.mac_aliases.get(mac).cloned()
    }

    /// Registers (or refreshes) a direct neighbour just past handshake.
    /// Returns whether this changed the registry (new device, or a field the
    /// UI cares about changed).
    pub fn upsert_direct(
        &mut self,
        id: DeviceId,
        display_name: String,
        is_host: bool,
        now: Instant,
    ) -> bool {
        match self.devices.get_mut(&id) {
            Some(device) => {
                let changed = device.hop_count != 0
                    || !device.is_connected
                    || device.display_name != display_name
                    || device.is_host != is_host;
                device.hop_count = 0;
                device.is_connected = true;
                device.display_name = display_name;
                device.is_host = is_host;
                device.last_seen = now;
                changed
            }
            None => {
                self.devices.insert(
                    id.clone(),
                    Device {
                        id,
                        display_name,
                        is_host,
                        hop_count: 0,
                        last_seen: now,
                        discovery_method: DiscoveryMethod::Handshake,
                        is_connected: true,
                    },
                );
                true
            }
        }
    }

    /// Marks a neighbour as no longer directly connected after a socket
    /// loss. The entry stays in the registry (per §8 scenario 5) until the
    /// stale window elapses; its last known hop-count is left as-is since no
    /// fresher observation exists.
    pub fn mark_disconnected(&mut self, id: &DeviceId) {
        if let Some(device) = self.devices.get_mut(id) {
            device.is_connected = false;
        }
    }

    /// Applies a roster frame (§4.4): upserts every entry except the
    /// recipient's own id, with `hop_count = 0` for the host and `1`
    /// otherwise. Returns whether any entry was new or changed hop-count, so
    /// the caller can suppress UI churn on a no-op re-application.
    pub fn apply_roster(
        &mut self,
        local_id: &DeviceId,
        entries: &[(DeviceId, String, bool)],
        now: Instant,
    ) -> bool {
        let mut changed = false;

        for (id, display_name, is_host) in entries {
            if id == local_id {
                continue;
            }

            let hop_count = if *is_host { 0 } else { 1 };

            match self.devices.get_mut(id) {
                Some(device) => {
                    if device.hop_count != hop_count || device.display_name != *display_name {
                        changed = true;
                    }
                    device.hop_count = hop_count;
                    device.display_name = display_name.clone();
                    device.is_host = *is_host;
                    device.last_seen = now;
                    if device.discovery_method == DiscoveryMethod::RouteObservation {
                        device.discovery_method = DiscoveryMethod::GroupRoster;
                    }
                }
                None => {
                    self.devices.insert(
                        id.clone(),
                        Device {
                            id: id.clone(),
                            display_name: display_name.clone(),
                            is_host: *is_host,
                            hop_count,
                            last_seen: now,
                            discovery_method: DiscoveryMethod::GroupRoster,
                            is_connected: false,
                        },
                    );
                    changed = true;
                }
            }
        }

        changed
    }

    /// Folds hop-count information out of an inbound frame (§4.5). `sender`
    /// is the frame's origin (`Message::sender_device_id`); when
    /// `route_path` is empty that origin is also whoever handed us the
    /// frame directly, so "sender ∈ direct neighbours" is just "is the
    /// sender entry currently `is_connected`".
    pub fn update_from_frame(&mut self, msg: &Message, now: Instant) -> bool {
        let mut changed = false;

        if msg.route_path.is_empty() {
            let sender_is_direct = self
                .devices
                .get(&msg.sender_device_id)
                .is_some_and(|d| d.is_connected);

            if sender_is_direct {
                changed |= self.lower_hop(&msg.sender_device_id, 0, now);
            }
            // Else: leave the hop-count unchanged — we trust the roster,
            // not a bare observation from a device we don't have a live
            // stream to. See DESIGN.md for the open question this resolves.
        } else {
            let sender_hop = clamp_hop(msg.route_path.len() as u32 + 1);
            changed |= self.lower_hop(&msg.sender_device_id, sender_hop, now);

            let n = msg.route_path.len();
            for (i, relay) in msg.route_path.iter().enumerate() {
                let candidate = clamp_hop((n - i) as u32);
                changed |= self.lower_hop(relay, candidate, now);
            }
        }

        changed
    }

    /// Inserts `id` with `hop_count` if unknown, or lowers its hop-count if
    /// `hop_count` is strictly better than what's on file. Never raises a
    /// hop-count: the design's "minimum over all observed paths" rule.
    fn lower_hop(&mut self, id: &DeviceId, hop_count: u8, now: Instant) -> bool {
        match self.devices.get_mut(id) {
            Some(device) => {
                if hop_count < device.hop_count {
                    device.hop_count = hop_count;
                    device.last_seen = now;
                    true
                } else {
                    device.last_seen = now;
                    false
                }
            }
            None => {
                self.devices.insert(
                    id.clone(),
                    Device {
                        id: id.clone(),
                        display_name: String::new(),
                        is_host: false,
                        hop_count,
                        last_seen: now,
                        discovery_method: DiscoveryMethod::RouteObservation,
                        is_connected: false,
                    },
                );
                true
            }
        }
    }

    /// Evicts every entry whose `last_seen` is older than `stale_window`,
    /// returning the evicted ids so the caller can fire `registry_changed`.
    pub fn evict_stale(&mut self, stale_window: Duration, now: Instant) -> Vec<DeviceId> {
        let mut evicted = Vec::new();
        self.devices.retain(|id, device| {
            let keep = now.duration_since(device.last_seen) <= stale_window;
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        evicted
    }

    /// True iff `id` resolves to an entry that is either currently connected
    /// or was heard from within `max_age` (§4.5).
    pub fn reachable(&self, id: &DeviceId, max_age: Duration, now: Instant) -> bool {
        match self.devices.get(id) {
            Some(device) => device.is_connected || now.duration_since(device.last_seen) <= max_age,
            None => false,
        }
    }
}

fn clamp_hop(h: u32) -> u8 {
    if h >= HOP_COUNT_UNKNOWN as u32 {
        HOP_COUNT_UNKNOWN
    } else {
        (h as u8).min(MAX_TTL)
    }
}

/// Adapts the registry (plus the coordinator's local id) to
/// [`ResolverContext`] so [`crate::identity::resolve`] can be called
/// directly against live mesh state.
pub struct RegistryResolverContext<'a> {
    pub local_id: &'a DeviceId,
    pub registry: &'a MeshRegistry,
}

impl ResolverContext for RegistryResolverContext<'_> {
    fn local_id(&self) -> &DeviceId {
        self.local_id
    }

    fn is_connected(&self, id: &DeviceId) -> bool {
        self.registry.get(id).is_some_and(|d| d.is_connected)
    }

    fn is_registered(&self, id: &DeviceId) -> bool {
        self.registry.contains(id)
    }

    fn alias_for_mac(&self, mac: &MacAddress) -> Option<DeviceId> {
        self.registry.alias_for(mac)
    }

    fn is_registered_mac(&self, mac: &MacAddress) -> bool {
        self.registry
            .contains(&DeviceId::from_canonical(mac.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn msg(sender: &str, route: &[&str], ttl: u8) -> Message {
        Message {
            message_id: "m".into(),
            from_user: "alice".into(),
            sender_device_id: DeviceId::from_canonical(sender),
            target_device_id: None,
            kind: MessageKind::Text,
            payload: vec![],
            latitude: None,
            longitude: None,
            ttl,
            route_path: route.iter().map(|s| DeviceId::from_canonical(*s)).collect(),
            timestamp_ms: 0,
            is_emergency: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn direct_sender_gets_hop_zero() {
        let mut registry = MeshRegistry::new();
        let now = Instant::now();
        registry.upsert_direct(DeviceId::from_canonical("a"), "Alice".into(), false, now);

        let changed = registry.update_from_frame(&msg("a", &[], 5), now);
        assert!(!changed); // already hop 0, no change
        assert_eq!(registry.get(&DeviceId::from_canonical("a")).unwrap().hop_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_direct_sender_with_empty_route_is_untouched() {
        let mut registry = MeshRegistry::new();
        let now = Instant::now();
        // "a" known only via a prior route observation at hop 3, not connected.
        registry.lower_hop(&DeviceId::from_canonical("a"), 3, now);

        let changed = registry.update_from_frame(&msg("a", &[], 5), now);
        assert!(!changed);
        assert_eq!(registry.get(&DeviceId::from_canonical("a")).unwrap().hop_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_path_derives_minimum_hop_counts() {
        let mut registry = MeshRegistry::new();
        let now = Instant::now();
        registry.upsert_direct(DeviceId::from_canonical("b"), "B".into(), true, now);

        // C sees a frame originated by A, relayed once by B: route_path = [B].
        let changed = registry.update_from_frame(&msg("a", &["b"], 4), now);
        assert!(changed);

        assert_eq!(registry.get(&DeviceId::from_canonical("a")).unwrap().hop_count, 2);
        // B is already known at hop 0 (direct); the route-derived candidate
        // (hop 1) must not overwrite that lower value.
        assert_eq!(registry.get(&DeviceId::from_canonical("b")).unwrap().hop_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hop_counts_never_increase() {
        let mut registry = MeshRegistry::new();
        let now = Instant::now();
        registry.lower_hop(&DeviceId::from_canonical("a"), 1, now);
        registry.lower_hop(&DeviceId::from_canonical("a"), 3, now);
        assert_eq!(registry.get(&DeviceId::from_canonical("a")).unwrap().hop_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_eviction_is_exact() {
        use crate::config::STALE_WINDOW;

        let mut registry = MeshRegistry::new();
        let t0 = Instant::now();
        registry.upsert_direct(DeviceId::from_canonical("old"), "Old".into(), false, t0);

        tokio::time::advance(STALE_WINDOW + Duration::from_secs(1)).await;
        let t1 = Instant::now();
        registry.upsert_direct(DeviceId::from_canonical("fresh"), "Fresh".into(), false, t1);

        let evicted = registry.evict_stale(STALE_WINDOW, t1);
        assert_eq!(evicted, vec![DeviceId::from_canonical("old")]);
        assert!(registry.contains(&DeviceId::from_canonical("fresh")));
        assert!(!registry.contains(&DeviceId::from_canonical("old")));
    }

    #[tokio::test(start_paused = true)]
    async fn applying_same_roster_twice_is_a_no_op_the_second_time() {
        let mut registry = MeshRegistry::new();
        let now = Instant::now();
        let local = DeviceId::from_canonical("me");
        let entries = vec![
            (DeviceId::from_canonical("host"), "Host".to_string(), true),
            (DeviceId::from_canonical("peer"), "Peer".to_string(), false),
        ];

        assert!(registry.apply_roster(&local, &entries, now));
        assert!(!registry.apply_roster(&local, &entries, now));
    }
}
