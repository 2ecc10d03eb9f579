//! Core of the offline peer-to-peer emergency messaging mesh: identity
//! resolution, the line-delimited JSON socket protocol, the handshake and
//! roster exchange, the mesh registry, message routing, link-quality
//! monitoring, reconnection and the top-level connection coordinator.
//!
//! The platform wireless driver, UI, persistent chat history and GPS
//! sampling are external collaborators reached only through
//! [`transport::WirelessTransport`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod message;
pub mod quality;
pub mod reconnect;
pub mod registry;
pub mod roster;
pub mod router;
pub mod socket;
pub mod stats;
pub mod timeout;
pub mod transport;

pub use config::MeshConfig;
pub use coordinator::{ConnectionCoordinator, CoordinatorEvent, OutboundAction, Role};
pub use error::{Error, Result};
pub use identity::{DeviceId, MacAddress};
pub use message::{Frame, Message, MessageKind};
