//! Bus transport abstraction
//!
//! The engine owns exactly one bus connection and talks to it through the
//! [`CecBus`] trait: send a frame with a timeout, get back ack/no-ack, and
//! receive inbound frames through a registered listener. Anything below the
//! opcode level (bit timing, arbitration, hardware I/O) lives behind this
//! trait.

use crate::message::CecFrame;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod sim;

pub use sim::SimBus;

/// Outcome of a directed send on the CEC bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The follower acknowledged the frame
    Acked,
    /// Nobody acknowledged; for a directed poll this means the address is free
    NoAck,
    /// The bus did not complete the transfer within the timeout
    Timeout,
}

impl SendStatus {
    pub fn is_acked(&self) -> bool {
        matches!(self, SendStatus::Acked)
    }
}

/// Hard transport failures, as opposed to the routine no-ack/timeout outcomes
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus is not open")]
    NotOpen,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Inbound frame listener
///
/// Registered once by the engine; the closure captures the engine's inbound
/// channel so there is no global instance to dispatch through. Implementations
/// must invoke it from their own delivery context and must not expect it to
/// block.
pub type FrameListener = Arc<dyn Fn(CecFrame) + Send + Sync>;

/// A CEC bus connection
///
/// Note: all methods take &self to support `Arc<dyn CecBus>`. Implementations
/// use interior mutability for their own state.
#[async_trait]
pub trait CecBus: Send + Sync {
    /// Open the bus connection
    async fn open(&self) -> Result<()>;

    /// Close the bus connection; the listener stops being invoked afterwards
    async fn close(&self) -> Result<()>;

    /// Send one frame and wait up to `timeout` for the ack phase
    async fn send(&self, frame: CecFrame, timeout: Duration) -> Result<SendStatus, BusError>;

    /// Register the inbound frame listener (replaces any previous one)
    fn set_listener(&self, listener: FrameListener);
}
