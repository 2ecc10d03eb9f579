//! Device identity and the identity resolver (component C1).
//!
//! `DeviceId` is kept as an opaque newtype around a canonical string rather
//! than a parsed `uuid::Uuid`, because legacy bootstrap (§4.1 step 4) can
//! legitimately resolve to a MAC-form string that lives in the registry
//! instead of a UUID. Mixing UUID and MAC identifiers downstream is exactly
//! what the design notes warn against, so every other component only ever
//! sees a `DeviceId` and never a raw string or a `MacAddress`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A canonical device identifier: conventionally a lower-case dashed UUID,
/// but see the module docs for the legacy-bootstrap exception.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generates a fresh random device identity, as a new installation would
    /// on first run.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an already-canonical string. Used internally by the resolver
    /// and registry, which are responsible for canonicalising first.
    pub(crate) fn from_canonical(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Six hex octets derived from the link layer. Never used as a primary key
/// once a UUID is known for the same device; see [`crate::registry`] for the
/// MAC-to-UUID alias table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return None;
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            octets[i] = u8::from_str_radix(part, 16).ok()?;
        }

        Some(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// Dependencies the resolver needs to decide whether a candidate string
/// names a known device, injected explicitly rather than reached for as
/// global state (design note, §9).
pub trait ResolverContext {
    fn local_id(&self) -> &DeviceId;
    fn is_connected(&self, id: &DeviceId) -> bool;
    fn is_registered(&self, id: &DeviceId) -> bool;
    fn alias_for_mac(&self, mac: &MacAddress) -> Option<DeviceId>;
    fn is_registered_mac(&self, mac: &MacAddress) -> bool;
}

/// Resolves any inbound identifier — UUID, MAC, or `chat_…` session id — to
/// a canonical [`DeviceId`]. See §4.1 for the full algorithm; this is a
/// direct, unabridged implementation of it.
pub fn resolve(raw: &str, ctx: &impl ResolverContext) -> Option<DeviceId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let stripped = trimmed.strip_prefix("chat_").unwrap_or(trimmed);
    let restored = restore_legacy_encoding(stripped);

    let mut candidates = vec![stripped.to_string()];
    if restored != stripped {
        candidates.push(restored.clone());
    }

    for candidate in &candidates {
        let id = DeviceId::from_canonical(candidate.clone());
        if &id == ctx.local_id() || ctx.is_connected(&id) || ctx.is_registered(&id) {
            return Some(id);
        }
    }

    for candidate in &candidates {
        if let Some(mac) = MacAddress::parse(candidate) {
            if let Some(id) = ctx.alias_for_mac(&mac) {
                return Some(id);
            }
            if ctx.is_registered_mac(&mac) {
                return Some(DeviceId::from_canonical(mac.to_string()));
            }
        }
    }

    Some(DeviceId::from_canonical(restored))
}

/// Reverses the underscore-joined legacy encoding the UI uses when it folds
/// punctuation out of a UUID or MAC to build a chat-session identifier.
/// Idempotent: a string that already matches neither pattern (including the
/// output of a previous call) passes through unchanged.
fn restore_legacy_encoding(s: &str) -> String {
    let segments: Vec<&str> = s.split('_').collect();

    let is_hex = |seg: &str| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_hexdigit());

    if segments.len() == 5 {
        let lens = [8, 4, 4, 4, 12];
        if segments
            .iter()
            .zip(lens)
            .all(|(seg, len)| seg.len() == len && is_hex(seg))
        {
            return segments.join("-");
        }
    }

    if segments.len() == 6 && segments.iter().all(|seg| seg.len() == 2 && is_hex(seg)) {
        return segments
            .iter()
            .map(|seg| seg.to_uppercase())
            .collect::<Vec<_>>()
            .join(":");
    }

    s.to_string()
}
