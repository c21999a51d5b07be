//! Liveness and discovery cycle
//!
//! One worker walks a fixed state cycle: poll the devices we know about,
//! ping addresses we do not, request whatever attributes are still missing,
//! sleep, clean up devices that stopped acking, then publish the resulting
//! registry changes. Each device-info request times out independently and
//! retries up to a cap, so one unresponsive box cannot starve the rest of
//! the cycle.

use super::registry::{PendingRequest, RequestedAttribute};
use super::EngineInner;
use crate::engine::events::EngineEvent;
use crate::message::{CecFrame, CecMessage, LogicalAddress};
use crate::transport::SendStatus;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Cycle states. `next()` is the single place transitions happen, so the
/// cycle order is a closed set rather than scattered assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    None,
    Idle,
    Poll,
    Ping,
    Info,
    Wait,
    Clean,
    Update,
    Exit,
}

impl PollState {
    /// Successor in the nominal cycle; `Exit` is terminal
    pub fn next(self) -> PollState {
        match self {
            PollState::None => PollState::Idle,
            PollState::Idle => PollState::Poll,
            PollState::Poll => PollState::Ping,
            PollState::Ping => PollState::Info,
            PollState::Info => PollState::Wait,
            PollState::Wait => PollState::Clean,
            PollState::Clean => PollState::Update,
            PollState::Update => PollState::Idle,
            PollState::Exit => PollState::Exit,
        }
    }
}

pub(crate) async fn run(inner: Arc<EngineInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut state = PollState::None;
    // Addresses that failed the current Poll pass, consumed by Clean
    let mut failed: Vec<u8> = Vec::new();

    debug!("poller started");
    loop {
        if *shutdown.borrow() {
            state = PollState::Exit;
        }
        trace!("poller state: {:?}", state);

        match state {
            PollState::None => {}
            PollState::Idle => {
                // Nothing to do until the engine is enabled and addressed
                while !ready(&inner) {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = inner.poll_kick.notified() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            PollState::Poll => {
                failed = poll_known_devices(&inner).await;
            }
            PollState::Ping => {
                ping_unknown_addresses(&inner).await;
            }
            PollState::Info => {
                request_missing_info(&inner).await;
            }
            PollState::Wait => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = inner.poll_kick.notified() => {}
                    _ = tokio::time::sleep(inner.tunables.poll_interval()) => {}
                }
            }
            PollState::Clean => {
                clean_disconnected(&inner, &failed);
                failed.clear();
            }
            PollState::Update => {
                publish_updates(&inner);
            }
            PollState::Exit => break,
        }

        state = state.next();
    }
    debug!("poller stopped");
}

fn ready(inner: &Arc<EngineInner>) -> bool {
    let state = inner.state.lock();
    state.enabled && state.our_logical.is_some()
}

fn own_address(inner: &Arc<EngineInner>) -> Option<LogicalAddress> {
    inner.state.lock().our_logical
}

/// Poll every present device; returns the addresses that did not ack
async fn poll_known_devices(inner: &Arc<EngineInner>) -> Vec<u8> {
    let Some(own) = own_address(inner) else {
        return Vec::new();
    };
    let targets: Vec<u8> = {
        let state = inner.state.lock();
        state
            .devices
            .present_addresses()
            .into_iter()
            .filter(|&la| la != own.value())
            .collect()
    };

    let mut failed = Vec::new();
    for la in targets {
        let Some(dest) = LogicalAddress::new(la) else {
            continue;
        };
        let frame = CecFrame::poll(own, dest);
        match inner.bus.send(frame, inner.tunables.send_timeout()).await {
            Ok(SendStatus::Acked) => trace!("poll: {} alive", dest),
            Ok(_) => {
                debug!("poll: {} did not ack", dest);
                failed.push(la);
            }
            Err(e) => {
                debug!("poll: bus error polling {}: {}", dest, e);
                failed.push(la);
            }
        }
    }
    failed
}

/// Probe addresses nobody is registered at, to catch devices that attached
/// without announcing themselves
async fn ping_unknown_addresses(inner: &Arc<EngineInner>) {
    let Some(own) = own_address(inner) else {
        return;
    };
    let targets: Vec<u8> = {
        let state = inner.state.lock();
        (0u8..15) // 15 is broadcast, never a device
            .filter(|&la| la != own.value())
            .filter(|&la| !state.devices.get(la).map(|d| d.is_present).unwrap_or(false))
            .collect()
    };

    for la in targets {
        let Some(dest) = LogicalAddress::new(la) else {
            continue;
        };
        let frame = CecFrame::poll(own, dest);
        if matches!(
            inner.bus.send(frame, inner.tunables.send_timeout()).await,
            Ok(SendStatus::Acked)
        ) {
            let added = {
                let mut state = inner.state.lock();
                match state.devices.get_mut(la) {
                    Some(record) if !record.is_present => {
                        record.is_present = true;
                        record.is_disconnected = false;
                        true
                    }
                    _ => false,
                }
            };
            if added {
                info!("discovered device at {}", dest);
                let _ = inner
                    .events
                    .send(EngineEvent::DeviceAdded { logical_address: la });
            }
        }
    }
}

/// What the Info pass decided to do for one device
struct InfoSend {
    la: u8,
    attribute: RequestedAttribute,
    retries: u8,
}

/// Issue or retry attribute requests, one outstanding per device
async fn request_missing_info(inner: &Arc<EngineInner>) {
    let Some(own) = own_address(inner) else {
        return;
    };

    // Decide under the lock, send after dropping it
    let mut sends: Vec<InfoSend> = Vec::new();
    {
        let mut state = inner.state.lock();
        let request_timeout = inner.tunables.request_timeout();
        let retry_cap = inner.tunables.request_retries;
        for (la, record) in state.devices.iter_mut() {
            if la == own.value() || !record.is_present {
                continue;
            }
            let pending = record
                .pending
                .as_ref()
                .map(|p| (p.attribute, p.requested_at, p.retries));
            match pending {
                Some((attribute, requested_at, retries)) => {
                    if requested_at.elapsed() >= request_timeout {
                        if retries >= retry_cap {
                            debug!("info: giving up on {:?} for device {}", attribute, la);
                            record.abandon(attribute);
                        } else {
                            sends.push(InfoSend {
                                la,
                                attribute,
                                retries: retries + 1,
                            });
                        }
                    }
                }
                None => {
                    if let Some(attribute) = record.next_missing_attribute() {
                        sends.push(InfoSend {
                            la,
                            attribute,
                            retries: 0,
                        });
                    }
                }
            }
        }
    }

    for send in sends {
        let Some(dest) = LogicalAddress::new(send.la) else {
            continue;
        };
        let message = match send.attribute {
            RequestedAttribute::PhysicalAddress => CecMessage::GivePhysicalAddress,
            RequestedAttribute::CecVersion => CecMessage::GetCecVersion,
            RequestedAttribute::VendorId => CecMessage::GiveDeviceVendorId,
            RequestedAttribute::PowerStatus => CecMessage::GiveDevicePowerStatus,
            RequestedAttribute::OsdName => CecMessage::GiveOsdName,
        };
        trace!("info: requesting {:?} from {}", send.attribute, dest);
        let frame = message.to_frame(own, dest);
        let _ = inner.bus.send(frame, inner.tunables.send_timeout()).await;

        let mut state = inner.state.lock();
        if let Some(record) = state.devices.get_mut(send.la) {
            // The answer may already have landed while the request was in
            // flight; do not leave a stale pending entry in that case.
            let still_missing = record.next_missing_attribute() == Some(send.attribute);
            if record.is_present && still_missing {
                record.pending = Some(PendingRequest {
                    attribute: send.attribute,
                    requested_at: Instant::now(),
                    retries: send.retries,
                });
            }
        }
    }
}

/// Clear devices that failed the last poll pass and drop them from the
/// topology
fn clean_disconnected(inner: &Arc<EngineInner>, failed: &[u8]) {
    if failed.is_empty() {
        return;
    }
    let mut removed = Vec::new();
    {
        let mut state = inner.state.lock();
        for &la in failed {
            let Some(record) = state.devices.get_mut(la) else {
                continue;
            };
            if !record.is_present {
                continue;
            }
            record.is_disconnected = true;
            let physical = record.physical_address;
            record.clear();
            if let Some(pa) = physical {
                state.topology.remove_device(pa);
            }
            if state.active_source == Some(la) {
                state.active_source = None;
                state.active_source_pa = None;
            }
            removed.push(la);
        }
    }
    for la in removed {
        info!("device at logical address {} disconnected", la);
        let _ = inner
            .events
            .send(EngineEvent::DeviceRemoved { logical_address: la });
    }
}

/// Emit one info-updated notification per device whose record changed since
/// the last cycle
fn publish_updates(inner: &Arc<EngineInner>) {
    let dirty: Vec<u8> = {
        let mut state = inner.state.lock();
        let mut dirty = Vec::new();
        for (la, record) in state.devices.iter_mut() {
            if record.is_present && record.info_dirty {
                record.info_dirty = false;
                dirty.push(la);
            }
        }
        dirty
    };
    for la in dirty {
        let _ = inner
            .events
            .send(EngineEvent::DeviceInfoUpdated { logical_address: la });
    }
}
