//! Pinch relay server.
//!
//! A hub-and-spoke message broker: endpoint agents connect over
//! WebSockets, are keyed by their `pinch:` address, and exchange
//! end-to-end encrypted envelopes. The relay routes frames between live
//! sessions and durably queues frames for recipients that are offline
//! or saturated, draining the backlog when they return.
//!
//! # Modules
//!
//! - [`hub`] — routing table, register/unregister event loop, dispatch.
//! - [`client`] — per-session read/write/heartbeat pumps.
//! - [`http`] — WebSocket upgrade, health, and enrollment endpoints.

pub mod client;
pub mod http;
pub mod hub;

pub use client::Client;
pub use http::build_router;
pub use hub::Hub;
