//! Shared protocol definitions for the socialchat WebSocket endpoint.

pub mod frame;
pub mod id;
