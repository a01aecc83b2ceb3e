//! A very minimal JSON-RPC 2.0 implementation, with just enough functionality to shuttle MCP
//! messages between channels that frame them differently.
//!
//! [`Message`] is the validated message model; [`FrameReader`] and [`FrameWriter`] move messages
//! on and off async byte streams under one of the [`Framing`] conventions.
mod codec;
mod message;

pub use codec::*;
pub use message::*;
