//! WebSocket gateway: handshake, sessions, command routing, heartbeat.

pub mod commands;
pub mod connection;
pub mod handshake;
pub mod heartbeat;
pub mod session;
pub mod sessions;

pub use commands::{CommandGateway, rejection};
pub use connection::{ClientConnection, Outbound};
pub use handshake::{BrokerTokenValidator, HandshakeError, Identity, TokenValidator};
pub use sessions::SessionTable;
