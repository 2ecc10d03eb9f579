//! The `WirelessTransport` contract (component C2, external): peer
//! discovery, group formation and per-peer byte streams, implemented by
//! whatever platform driver sits below the core (§6). `mesh-core` never
//! implements this itself — only consumes it — matching the design note
//! that the wireless service must be injected rather than reached for as
//! global state.

use crate::error::Result;
use crate::identity::MacAddress;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Opaque handle to one byte stream the transport is managing, valid until
/// the corresponding `close` call or a `Disconnected`/stream-end event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// One entry of a discovered-peer list (§6).
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub address: String,
    pub display_name: String,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Available,
    Connecting,
    Unavailable,
}

/// Events emitted while a `connect` attempt is in flight or once it has
/// settled into a stream.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connecting,
    Connected { is_group_owner: bool, owner_addr: String },
    Disconnected { reason: String },
}

/// A stream handed to us by an incoming connection on our listener.
/// `peer_mac` carries the link-layer address when the driver can see one
/// (e.g. a Wi-Fi Direct/Bluetooth group), for the handshake's MAC→UUID
/// aliasing step (§4.1, §4.3); plain IP transports leave it `None`.
#[derive(Debug, Clone)]
pub struct IncomingStream {
    pub stream_id: StreamId,
    pub peer_addr: String,
    pub peer_mac: Option<MacAddress>,
}

/// The narrow interface the core consumes from the platform-specific
/// wireless driver. Every method that produces an ongoing sequence of
/// events returns the receiving half of an `mpsc` channel rather than a
/// generic `Stream` impl, matching the crate's "typed channels over
/// assignable callbacks" convention (§9) rather than introducing a second
/// streaming abstraction.
#[async_trait]
pub trait WirelessTransport: Send + Sync {
    async fn start_discovery(&self) -> Result<mpsc::Receiver<Vec<PeerSummary>>>;
    async fn connect(&self, address: &str) -> Result<(StreamId, mpsc::Receiver<ConnectionEvent>)>;
    async fn open_listener(&self, port: u16) -> Result<mpsc::Receiver<IncomingStream>>;
    async fn send(&self, stream_id: StreamId, bytes: Vec<u8>) -> Result<()>;
    async fn recv(&self, stream_id: StreamId) -> Result<Option<Vec<u8>>>;
    async fn close(&self, stream_id: StreamId);
}
