//! `socialchat`: real-time messaging client for the social feed backend.
//!
//! The crate owns the WebSocket session ([`client::ChatClient`]), the
//! in-memory message log ([`store`]), history request deduplication
//! ([`history`]) and the socket layer ([`transport`]).

pub mod client;
pub mod config;
pub mod history;
pub mod store;
pub mod transport;
