//! CloudHub WebSocket Transport
//!
//! WebSocket protocol server for the hub. Edge nodes connect over TLS with a
//! client certificate, upgrade to WebSocket and name themselves through the
//! `node_id` header or the `/{project_id}/{node_id}/events` path.

pub mod adapter;
pub mod identity;
pub mod server;

pub use adapter::{accept_websocket, WebSocketTransport};
pub use identity::{node_id_from_request, NODE_ID_HEADER};
pub use server::WebSocketServer;
