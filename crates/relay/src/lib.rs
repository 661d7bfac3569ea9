//! Real-time relay for collaborative documents.
//!
//! Clients connect over a websocket addressed by document path and exchange
//! opaque binary update fragments. The relay fans each fragment out to the
//! other clients on the same document, keeps a bounded replay buffer per
//! document backed by a durable history store, and reclaims dead
//! connections and idle rooms.

pub mod api;
pub mod app;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod history;
pub mod metrics;
pub mod sync;
pub mod ws;
