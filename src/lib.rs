//! CEC Sink GW - TV-side HDMI-CEC protocol engine
//!
//! Maintains the logical/physical topology of an HDMI network, allocates the
//! sink's logical address, tracks per-device capability state, and drives the
//! ARC handshake and remote-key forwarding over an asynchronous half-duplex
//! bus. The bus itself is abstracted behind [`transport::CecBus`]; RPC
//! marshaling and platform plumbing live outside this crate.

pub mod config;
pub mod engine;
pub mod message;
pub mod settings;
pub mod transport;
