//! Logical address allocation
//!
//! CEC address allocation is a probe-and-claim protocol: for each candidate
//! address the device polls the address itself; nobody acking means the
//! address is free and can be claimed. A sink tries TV(0) first and falls
//! back to Free Use(14). One pass only; a bus reset re-runs the whole
//! allocation.

use crate::message::{CecFrame, DeviceType, LogicalAddress};
use crate::transport::{CecBus, SendStatus};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Candidate addresses in claim priority order for the given role
pub fn candidates_for(device_type: DeviceType) -> &'static [LogicalAddress] {
    match device_type {
        DeviceType::Tv => &[LogicalAddress::TV, LogicalAddress::FREE_USE],
        DeviceType::AudioSystem => &[LogicalAddress::AUDIO_SYSTEM],
        // Non-sink roles are outside this engine's remit; give them the
        // shared fallback so a misconfiguration still comes up addressable.
        _ => &[LogicalAddress::FREE_USE],
    }
}

/// Probe the candidate set once and claim the first free address
///
/// Returns `None` when every candidate acked, i.e. no address is available.
/// A send `Timeout` is treated as "taken": claiming an address on a flaky
/// bus risks a duplicate claim, and the next bus reset retries anyway.
pub async fn allocate(
    bus: &dyn CecBus,
    device_type: DeviceType,
    send_timeout: Duration,
) -> Option<LogicalAddress> {
    for &candidate in candidates_for(device_type) {
        let poll = CecFrame::poll(candidate, candidate);
        debug!("allocator: probing {}", candidate);
        match bus.send(poll, send_timeout).await {
            Ok(SendStatus::NoAck) => {
                info!("allocator: claimed logical address {}", candidate);
                return Some(candidate);
            }
            Ok(SendStatus::Acked) => {
                debug!("allocator: {} is taken, trying next candidate", candidate);
            }
            Ok(SendStatus::Timeout) => {
                debug!("allocator: probe of {} timed out, treating as taken", candidate);
            }
            Err(e) => {
                warn!("allocator: bus error while probing {}: {}", candidate, e);
            }
        }
    }
    warn!("allocator: no logical address available for {}", device_type);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PhysicalAddress;
    use crate::transport::sim::{SimBus, SimDevice};
    use std::sync::Arc;

    #[tokio::test]
    async fn claims_tv_address_when_free() {
        let bus = Arc::new(SimBus::new());
        bus.open().await.unwrap();

        let claimed = allocate(bus.as_ref(), DeviceType::Tv, Duration::from_millis(50)).await;
        assert_eq!(claimed, Some(LogicalAddress::TV));
    }

    #[tokio::test]
    async fn falls_back_when_tv_address_is_taken() {
        let bus = Arc::new(SimBus::new());
        bus.open().await.unwrap();
        // Another TV already answers polls at address 0
        let mut squatter = SimDevice::playback(0, PhysicalAddress::new(0, 0, 0, 0));
        squatter.osd_name = "OtherTV".to_string();
        bus.attach(squatter);

        let claimed = allocate(bus.as_ref(), DeviceType::Tv, Duration::from_millis(50)).await;
        assert_eq!(claimed, Some(LogicalAddress::FREE_USE));
    }

    #[tokio::test]
    async fn reports_exhaustion_when_all_candidates_ack() {
        let bus = Arc::new(SimBus::new());
        bus.open().await.unwrap();
        bus.attach(SimDevice::playback(0, PhysicalAddress::new(0, 0, 0, 0)));
        bus.attach(SimDevice::playback(14, PhysicalAddress::new(2, 0, 0, 0)));

        let claimed = allocate(bus.as_ref(), DeviceType::Tv, Duration::from_millis(50)).await;
        assert_eq!(claimed, None);
    }
}
