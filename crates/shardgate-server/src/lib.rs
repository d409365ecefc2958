//! # shardgate-server
//!
//! Axum HTTP + WebSocket gateway.
//!
//! - `GET /ws`: handshake (token RPC), then COMMAND/ACK frames in, RESPONSE,
//!   EVENT and SYSTEM_COMMAND frames out
//! - `POST /v1/commands`: enqueue a command, answer arrives over WebSocket
//! - `GET /health`, `GET /metrics`
//!
//! Outbound traffic reaches sessions through the broker consumers in
//! [`dispatcher`].

#![deny(unsafe_code)]

pub mod auth_responder;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use auth_responder::StaticTokenResponder;
pub use config::GatewayConfig;
pub use dispatcher::{EventBroadcaster, NotificationBroadcaster, ResponseDispatcher, start_dispatchers};
pub use gateway::{BrokerTokenValidator, CommandGateway, SessionTable, TokenValidator};
pub use server::{AppState, GatewayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, TaskSet};
