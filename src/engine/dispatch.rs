//! Inbound frame dispatch and per-opcode handlers
//!
//! Frames arrive on the dispatch task one at a time; a frame is fully
//! processed, including any synchronous reply, before the next one is taken.
//! Handlers mutate the registry/topology/ARC state and queue notifications;
//! they never call back into listeners directly.

use super::arc::ArcRoutingState;
use super::EngineInner;
use crate::engine::events::EngineEvent;
use crate::engine::registry::RequestedAttribute;
use crate::message::{
    opcode, AbortReason, CecFrame, CecMessage, CecVersion, LogicalAddress, MessageParseError,
    PhysicalAddress,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

impl EngineInner {
    /// Entry point for one inbound frame
    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: CecFrame) {
        if !self.state.lock().enabled {
            trace!("dispatch: engine disabled, dropping frame");
            return;
        }

        let own = self.state.lock().our_logical;
        if Some(frame.initiator) == own {
            self.on_own_address_frame(&frame).await;
            return;
        }

        let directed_at_us = !frame.is_broadcast() && Some(frame.destination) == own;

        let message = match CecMessage::parse(&frame) {
            Ok(message) => message,
            Err(MessageParseError::UnknownOpcode(op)) => {
                debug!(
                    "dispatch: unrecognized opcode 0x{:02X} from {}",
                    op, frame.initiator
                );
                if directed_at_us {
                    // Normal negative reply, not a fault
                    self.send_to(
                        frame.initiator,
                        CecMessage::FeatureAbort {
                            opcode: op,
                            reason: AbortReason::UnrecognizedOpcode,
                        },
                    )
                    .await;
                }
                return;
            }
            Err(MessageParseError::Truncated(op)) => {
                debug!(
                    "dispatch: truncated operands for opcode 0x{:02X} from {}",
                    op, frame.initiator
                );
                return;
            }
        };

        trace!(
            "dispatch: {} -> {}: {:?}",
            frame.initiator,
            frame.destination,
            message
        );
        self.track_presence(frame.initiator);

        let from = frame.initiator;
        match message {
            CecMessage::Poll => {} // ack happens at the transport level
            CecMessage::ActiveSource { physical_address } => {
                self.on_active_source(from, physical_address);
            }
            CecMessage::InactiveSource { physical_address } => {
                self.on_inactive_source(from, physical_address);
            }
            CecMessage::ImageViewOn | CecMessage::TextViewOn => {
                self.on_view_on(from);
            }
            CecMessage::RequestActiveSource => {
                self.on_request_active_source().await;
            }
            CecMessage::Standby => {
                info!("standby received from {}", from);
                let _ = self.events.send(EngineEvent::StandbyReceived {
                    from: from.value(),
                });
            }
            CecMessage::GetCecVersion => {
                self.send_to(
                    from,
                    CecMessage::CecVersionReport {
                        version: CecVersion::V1_4,
                    },
                )
                .await;
            }
            CecMessage::CecVersionReport { version } => {
                self.with_record(from, |record| record.update_cec_version(version));
            }
            CecMessage::GetMenuLanguage => {
                let language = self.state.lock().language.clone();
                self.send_to(from, CecMessage::SetMenuLanguage { language }).await;
            }
            CecMessage::SetMenuLanguage { language } => {
                debug!("menu language {} from {}", language, from);
                self.with_record(from, |record| record.update_language(language));
            }
            CecMessage::GiveOsdName => {
                let name = self.state.lock().osd_name.clone();
                self.send_to(from, CecMessage::SetOsdName { name }).await;
            }
            CecMessage::SetOsdName { name } => {
                self.with_record(from, |record| record.update_osd_name(name));
            }
            CecMessage::SetOsdString { display_control, text } => {
                // On-screen display is outside this engine; log and move on
                debug!(
                    "osd string from {} (control 0x{:02X}): {}",
                    from, display_control, text
                );
            }
            CecMessage::GivePhysicalAddress => {
                let reply = {
                    let state = self.state.lock();
                    CecMessage::ReportPhysicalAddress {
                        physical_address: state.our_physical,
                        device_type: self.device_type,
                    }
                };
                self.broadcast(reply).await;
            }
            CecMessage::ReportPhysicalAddress {
                physical_address,
                device_type,
            } => {
                self.on_report_physical_address(from, physical_address, device_type);
            }
            CecMessage::GiveDeviceVendorId => {
                let vendor_id = self.state.lock().vendor_id;
                self.broadcast(CecMessage::DeviceVendorId { vendor_id }).await;
            }
            CecMessage::DeviceVendorId { vendor_id } => {
                self.with_record(from, |record| record.update_vendor_id(vendor_id));
            }
            CecMessage::GiveDevicePowerStatus => {
                self.send_to(
                    from,
                    CecMessage::ReportPowerStatus {
                        status: crate::message::PowerStatus::On,
                    },
                )
                .await;
            }
            CecMessage::ReportPowerStatus { status } => {
                self.on_report_power_status(from, status);
            }
            CecMessage::FeatureAbort { opcode, reason } => {
                self.on_feature_abort(from, opcode, reason);
            }
            CecMessage::Abort => {
                // Abort exists to probe the abort path; answer it accordingly
                self.send_to(
                    from,
                    CecMessage::FeatureAbort {
                        opcode: opcode::ABORT,
                        reason: AbortReason::Refused,
                    },
                )
                .await;
            }
            CecMessage::RoutingChange { from: _, to } => {
                self.on_route_moved(to, "routing change");
            }
            CecMessage::RoutingInformation { physical_address } => {
                self.on_route_moved(physical_address, "routing information");
            }
            CecMessage::SetStreamPath { physical_address } => {
                self.on_route_moved(physical_address, "set stream path");
            }
            CecMessage::UserControlPressed { key_code } => {
                debug!("user control 0x{:02X} pressed by {}", key_code, from);
            }
            CecMessage::UserControlReleased => {
                debug!("user control released by {}", from);
            }
            CecMessage::GiveFeatures => {
                // CEC 2.0 discovery; this sink speaks 1.4
                if directed_at_us {
                    self.send_to(
                        from,
                        CecMessage::FeatureAbort {
                            opcode: opcode::GIVE_FEATURES,
                            reason: AbortReason::UnrecognizedOpcode,
                        },
                    )
                    .await;
                }
            }
            CecMessage::SystemAudioModeRequest { .. } => {
                debug!("ignoring system audio mode request from {}", from);
            }
            CecMessage::SetSystemAudioMode { on } => {
                self.state.lock().system_audio_mode = on;
                let _ = self.events.send(EngineEvent::SystemAudioMode { on });
            }
            CecMessage::GiveAudioStatus => {
                debug!("ignoring audio status query from {} (sink role)", from);
            }
            CecMessage::ReportAudioStatus { mute, volume } => {
                self.state.lock().audio_status = Some((mute, volume));
                let _ = self.events.send(EngineEvent::AudioStatus { mute, volume });
            }
            CecMessage::RequestShortAudioDescriptor { .. } => {
                debug!("ignoring short audio descriptor request from {}", from);
            }
            CecMessage::ReportShortAudioDescriptor { descriptors } => {
                let _ = self
                    .events
                    .send(EngineEvent::ShortAudioDescriptor { descriptors });
            }
            CecMessage::RequestCurrentLatency { physical_address } => {
                self.on_request_current_latency(physical_address).await;
            }
            CecMessage::ReportCurrentLatency { .. } => {
                trace!("ignoring latency report from {}", from);
            }
            CecMessage::InitiateArc => {
                self.on_initiate_arc(from).await;
            }
            CecMessage::TerminateArc => {
                self.on_terminate_arc(from).await;
            }
            CecMessage::RequestArcInitiation | CecMessage::RequestArcTermination => {
                // Those requests flow TV -> audio system, not towards a sink
                debug!("ignoring ARC request meant for an audio system, from {}", from);
            }
            CecMessage::ReportArcInitiated | CecMessage::ReportArcTerminated => {
                trace!("ignoring ARC report from {}", from);
            }
        }
    }

    /// A frame initiated from our own address is normally our reflection on a
    /// looped-back bus and is dropped. A Report Physical Address carrying a
    /// different physical address from that same initiator means another
    /// device claimed the address too; give it up and re-run allocation.
    async fn on_own_address_frame(self: &Arc<Self>, frame: &CecFrame) {
        let Ok(CecMessage::ReportPhysicalAddress {
            physical_address, ..
        }) = CecMessage::parse(frame)
        else {
            return;
        };
        if physical_address == self.state.lock().our_physical {
            return;
        }
        warn!(
            "device at {} answers from our logical address, re-allocating",
            physical_address
        );
        self.state.lock().our_logical = None;
        self.allocate_and_announce().await;
    }

    /// A frame from a device we did not know about means it is present
    fn track_presence(&self, initiator: LogicalAddress) {
        if initiator == LogicalAddress::UNREGISTERED {
            return;
        }
        let added = {
            let mut state = self.state.lock();
            match state.devices.get_mut(initiator.value()) {
                Some(record) if !record.is_present => {
                    record.is_present = true;
                    record.is_disconnected = false;
                    true
                }
                _ => false,
            }
        };
        if added {
            info!("device {} appeared on the bus", initiator);
            let _ = self.events.send(EngineEvent::DeviceAdded {
                logical_address: initiator.value(),
            });
        }
    }

    /// Run `f` against the initiator's registry record
    fn with_record(
        &self,
        la: LogicalAddress,
        f: impl FnOnce(&mut crate::engine::registry::DeviceRecord),
    ) {
        let mut state = self.state.lock();
        if let Some(record) = state.devices.get_mut(la.value()) {
            if record.is_present {
                f(record);
            }
        }
    }

    fn on_active_source(&self, from: LogicalAddress, physical_address: PhysicalAddress) {
        let changed = {
            let mut state = self.state.lock();
            if let Some(record) = state.devices.get_mut(from.value()) {
                if record.physical_address.is_none() {
                    record.update_physical_address(physical_address);
                }
            }
            state.topology.add_device(from, physical_address);
            let changed = state.active_source != Some(from.value());
            for (la, record) in state.devices.iter_mut() {
                record.is_active_source = la == from.value();
            }
            state.active_source = Some(from.value());
            state.active_source_pa = Some(physical_address);
            changed
        };
        if changed {
            info!("active source moved to {} at {}", from, physical_address);
            let _ = self.events.send(EngineEvent::ActiveSourceChanged {
                logical_address: from.value(),
                physical_address,
            });
        }
    }

    fn on_inactive_source(&self, from: LogicalAddress, physical_address: PhysicalAddress) {
        let mut state = self.state.lock();
        if state.active_source == Some(from.value()) {
            debug!("active source {} at {} went inactive", from, physical_address);
            state.active_source = None;
            state.active_source_pa = None;
            if let Some(record) = state.devices.get_mut(from.value()) {
                record.is_active_source = false;
            }
        }
    }

    fn on_view_on(&self, from: LogicalAddress) {
        let otp = self.state.lock().otp_enabled;
        if otp {
            // Display wake-up itself is the platform's business; the protocol
            // side only needs the initiator tracked as present, which
            // track_presence already did.
            debug!("one-touch-play view-on from {}", from);
        } else {
            debug!("ignoring view-on from {}, one-touch-play disabled", from);
        }
    }

    async fn on_request_active_source(&self) {
        let reply = {
            let state = self.state.lock();
            let we_are_active = state
                .our_logical
                .map(|own| state.active_source == Some(own.value()))
                .unwrap_or(false);
            we_are_active.then(|| CecMessage::ActiveSource {
                physical_address: state.our_physical,
            })
        };
        if let Some(reply) = reply {
            self.broadcast(reply).await;
        }
    }

    fn on_report_physical_address(
        &self,
        from: LogicalAddress,
        physical_address: PhysicalAddress,
        device_type: crate::message::DeviceType,
    ) {
        let mut state = self.state.lock();
        if let Some(record) = state.devices.get_mut(from.value()) {
            if record.is_present {
                record.update_physical_address(physical_address);
                record.update_device_type(device_type);
            }
        }
        state.topology.add_device(from, physical_address);
        if from == LogicalAddress::AUDIO_SYSTEM {
            state.audio_device_connected = true;
        }
    }

    fn on_report_power_status(&self, from: LogicalAddress, status: crate::message::PowerStatus) {
        let report_audio = {
            let mut state = self.state.lock();
            if let Some(record) = state.devices.get_mut(from.value()) {
                if record.is_present {
                    record.update_power_status(status);
                }
            }
            if from == LogicalAddress::AUDIO_SYSTEM && state.audio_power_status_requested {
                state.audio_power_status_requested = false;
                true
            } else {
                false
            }
        };
        if report_audio {
            let _ = self
                .events
                .send(EngineEvent::AudioDevicePowerStatus { status });
        }
    }

    fn on_feature_abort(&self, from: LogicalAddress, aborted: u8, reason: AbortReason) {
        debug!(
            "feature abort from {} for opcode 0x{:02X}: {:?}",
            from, aborted, reason
        );
        // A device refusing an info request will keep refusing it; stop asking.
        let attribute = match aborted {
            opcode::GIVE_PHYSICAL_ADDRESS => Some(RequestedAttribute::PhysicalAddress),
            opcode::GET_CEC_VERSION => Some(RequestedAttribute::CecVersion),
            opcode::GIVE_DEVICE_VENDOR_ID => Some(RequestedAttribute::VendorId),
            opcode::GIVE_DEVICE_POWER_STATUS => Some(RequestedAttribute::PowerStatus),
            opcode::GIVE_OSD_NAME => Some(RequestedAttribute::OsdName),
            _ => None,
        };
        if let Some(attribute) = attribute {
            self.with_record(from, |record| record.abandon(attribute));
        }
        let _ = self.events.send(EngineEvent::FeatureAbortReceived {
            from: from.value(),
            opcode: aborted,
            reason,
        });
    }

    /// Routing Change / Routing Information / Set Stream Path all move the
    /// active path to a new physical address
    fn on_route_moved(&self, to: PhysicalAddress, what: &str) {
        let (changed, la) = {
            let mut state = self.state.lock();
            if state.topology.port_for(to).is_none() {
                debug!("{} towards {} is off our ports, ignoring", what, to);
                return;
            }
            // The deepest hop on the route is the device at the new path
            let la = state.topology.route_for(to).first().copied();
            let changed = match la {
                Some(la) if state.active_source != Some(la) => {
                    for (slot, record) in state.devices.iter_mut() {
                        record.is_active_source = slot == la;
                    }
                    state.active_source = Some(la);
                    true
                }
                _ => false,
            };
            state.active_source_pa = Some(to);
            (changed, la)
        };
        if changed {
            if let Some(la) = la {
                info!("{}: active path now {} via {}", what, to, la);
                let _ = self.events.send(EngineEvent::ActiveSourceChanged {
                    logical_address: la,
                    physical_address: to,
                });
            }
        }
    }

    async fn on_request_current_latency(&self, physical_address: PhysicalAddress) {
        let reply = {
            let state = self.state.lock();
            (physical_address == state.our_physical).then(|| CecMessage::ReportCurrentLatency {
                physical_address,
                video_latency: state.latency.video_latency,
                latency_flags: state.latency.latency_flags,
                audio_output_delay: state.latency.audio_output_delay,
            })
        };
        if let Some(reply) = reply {
            self.broadcast(reply).await;
        }
    }

    async fn on_initiate_arc(&self, from: LogicalAddress) {
        if !self.arc.enabled.load(Ordering::SeqCst) {
            debug!("initiate ARC from {} while routing is disabled", from);
            self.send_to(
                from,
                CecMessage::FeatureAbort {
                    opcode: opcode::INITIATE_ARC,
                    reason: AbortReason::Refused,
                },
            )
            .await;
            return;
        }

        self.send_to(from, CecMessage::ReportArcInitiated).await;
        self.arc.state.send_replace(ArcRoutingState::Initiated);
        {
            let mut state = self.state.lock();
            state.audio_device_connected = true;
        }
        info!("ARC initiated with {}", from);
        let _ = self.events.send(EngineEvent::ArcInitiation { success: true });

        // Ask the amplifier to take over audio for the current source
        let request = {
            let state = self.state.lock();
            CecMessage::SystemAudioModeRequest {
                physical_address: Some(state.active_source_pa.unwrap_or(state.our_physical)),
            }
        };
        self.send_to(from, request).await;
    }

    async fn on_terminate_arc(&self, from: LogicalAddress) {
        self.send_to(from, CecMessage::ReportArcTerminated).await;
        self.arc.state.send_replace(ArcRoutingState::Terminated);
        info!("ARC terminated with {}", from);
        let _ = self.events.send(EngineEvent::ArcTermination { success: true });
    }

    /// Directed send from our address; no-ack is routine and only logged
    pub(crate) async fn send_to(&self, destination: LogicalAddress, message: CecMessage) {
        let Some(own) = self.state.lock().our_logical else {
            debug!("send skipped, no logical address allocated yet");
            return;
        };
        let frame = message.to_frame(own, destination);
        match self.bus.send(frame, self.tunables.send_timeout()).await {
            Ok(status) if !status.is_acked() => {
                debug!("send to {} not acked", destination);
            }
            Err(e) => warn!("bus error sending to {}: {}", destination, e),
            Ok(_) => {}
        }
    }

    /// Broadcast from our address
    pub(crate) async fn broadcast(&self, message: CecMessage) {
        let Some(own) = self.state.lock().our_logical else {
            debug!("broadcast skipped, no logical address allocated yet");
            return;
        };
        let frame = message.to_frame(own, LogicalAddress::BROADCAST);
        if let Err(e) = self.bus.send(frame, self.tunables.send_timeout()).await {
            warn!("bus error broadcasting: {}", e);
        }
    }
}
