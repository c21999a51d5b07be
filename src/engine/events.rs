//! Engine notifications
//!
//! Handlers never call listeners synchronously from the bus callback; they
//! publish onto a broadcast channel and the consumer (the RPC layer, the demo
//! binary, tests) drains it on its own task.

use crate::message::{AbortReason, PhysicalAddress, PowerStatus};
use tokio::sync::broadcast;

/// Capacity of the event channel; slow consumers drop oldest events
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by the sink engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A device acked a poll or spoke on the bus for the first time
    DeviceAdded { logical_address: u8 },
    /// A device stopped acking polls and was cleaned from the registry
    DeviceRemoved { logical_address: u8 },
    /// A present device gained or refreshed an attribute set
    DeviceInfoUpdated { logical_address: u8 },
    /// The active source moved
    ActiveSourceChanged {
        logical_address: u8,
        physical_address: PhysicalAddress,
    },
    /// Our own logical address was claimed
    AddressAllocated { logical_address: u8 },
    /// Every candidate address was taken
    NoLogicalAddress,
    /// Outcome of an ARC initiation request (ours or device-initiated)
    ArcInitiation { success: bool },
    /// Outcome of an ARC termination request
    ArcTermination { success: bool },
    /// A Standby was addressed to us or broadcast
    StandbyReceived { from: u8 },
    /// Amplifier toggled System Audio Mode
    SystemAudioMode { on: bool },
    /// Audio status reported by the amplifier
    AudioStatus { mute: bool, volume: u8 },
    /// Short audio descriptors reported by the amplifier
    ShortAudioDescriptor { descriptors: Vec<u8> },
    /// Power status reported by the audio device after an explicit query
    AudioDevicePowerStatus { status: PowerStatus },
    /// A device refused one of our requests
    FeatureAbortReceived {
        from: u8,
        opcode: u8,
        reason: AbortReason,
    },
}

/// Create the engine's event channel
pub fn channel() -> broadcast::Sender<EngineEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
