//! Simulated CEC bus with scriptable downstream devices
//!
//! Stands in for real HDMI hardware in tests and in the demo binary. Each
//! simulated device acks directed polls at its logical address and answers
//! the usual info requests (physical address, vendor ID, CEC version, OSD
//! name, power status) plus the ARC handshake when marked ARC-capable.

use crate::message::{
    CecFrame, CecMessage, CecVersion, DeviceType, LogicalAddress, PhysicalAddress, PowerStatus,
    VendorId,
};
use crate::transport::{BusError, CecBus, FrameListener, SendStatus};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// One scripted device hanging off the simulated bus
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub logical_address: u8,
    pub physical_address: PhysicalAddress,
    pub device_type: DeviceType,
    pub vendor_id: VendorId,
    pub osd_name: String,
    pub power_status: PowerStatus,
    pub cec_version: CecVersion,
    /// Answers the ARC handshake (audio systems only)
    pub arc_capable: bool,
    /// When false the device acks polls but never answers info requests,
    /// which is how unresponsive hardware behaves in the field
    pub answers_requests: bool,
}

impl SimDevice {
    pub fn playback(logical_address: u8, physical_address: PhysicalAddress) -> Self {
        SimDevice {
            logical_address,
            physical_address,
            device_type: DeviceType::PlaybackDevice,
            vendor_id: VendorId([0x00, 0x19, 0xFB]),
            osd_name: format!("Player{}", logical_address),
            power_status: PowerStatus::On,
            cec_version: CecVersion::V1_4,
            arc_capable: false,
            answers_requests: true,
        }
    }

    pub fn audio_system(physical_address: PhysicalAddress) -> Self {
        SimDevice {
            logical_address: LogicalAddress::AUDIO_SYSTEM.value(),
            physical_address,
            device_type: DeviceType::AudioSystem,
            vendor_id: VendorId([0x00, 0xD0, 0x38]),
            osd_name: "Soundbar".to_string(),
            power_status: PowerStatus::On,
            cec_version: CecVersion::V1_4,
            arc_capable: true,
            answers_requests: true,
        }
    }
}

struct SimInner {
    open: bool,
    devices: HashMap<u8, SimDevice>,
    listener: Option<FrameListener>,
    sent: Vec<CecFrame>,
}

/// In-memory bus: frames sent by the engine are recorded and answered by the
/// scripted devices; `inject` delivers arbitrary inbound traffic
pub struct SimBus {
    inner: Mutex<SimInner>,
}

impl SimBus {
    pub fn new() -> Self {
        SimBus {
            inner: Mutex::new(SimInner {
                open: false,
                devices: HashMap::new(),
                listener: None,
                sent: Vec::new(),
            }),
        }
    }

    /// Attach a device; it starts acking polls immediately
    pub fn attach(&self, device: SimDevice) {
        let mut inner = self.inner.lock();
        debug!(
            "sim: attaching {} at {}",
            device.osd_name, device.physical_address
        );
        inner.devices.insert(device.logical_address, device);
    }

    /// Detach a device; subsequent polls to its address go unacked
    pub fn detach(&self, logical_address: u8) {
        let mut inner = self.inner.lock();
        if inner.devices.remove(&logical_address).is_some() {
            debug!("sim: detached device {}", logical_address);
        }
    }

    /// Deliver an inbound frame to the engine, as if a device initiated it
    pub fn inject(&self, frame: CecFrame) {
        let listener = self.inner.lock().listener.clone();
        if let Some(listener) = listener {
            listener(frame);
        }
    }

    /// Snapshot of every frame the engine has sent so far
    pub fn sent_frames(&self) -> Vec<CecFrame> {
        self.inner.lock().sent.clone()
    }

    /// Frames carrying the given opcode, oldest first
    pub fn sent_with_opcode(&self, opcode: u8) -> Vec<CecFrame> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|f| f.opcode() == Some(opcode))
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner.lock().sent.clear();
    }

    /// Build the scripted reply for a directed request, if the device answers
    fn reply_for(device: &SimDevice, msg: &CecMessage, sink: LogicalAddress) -> Option<CecFrame> {
        let from = LogicalAddress::new(device.logical_address)?;
        let reply = match msg {
            CecMessage::GivePhysicalAddress => CecMessage::ReportPhysicalAddress {
                physical_address: device.physical_address,
                device_type: device.device_type,
            }
            .to_frame(from, LogicalAddress::BROADCAST),
            CecMessage::GiveDeviceVendorId => CecMessage::DeviceVendorId {
                vendor_id: device.vendor_id,
            }
            .to_frame(from, LogicalAddress::BROADCAST),
            CecMessage::GetCecVersion => CecMessage::CecVersionReport {
                version: device.cec_version,
            }
            .to_frame(from, sink),
            CecMessage::GiveOsdName => CecMessage::SetOsdName {
                name: device.osd_name.clone(),
            }
            .to_frame(from, sink),
            CecMessage::GiveDevicePowerStatus => CecMessage::ReportPowerStatus {
                status: device.power_status,
            }
            .to_frame(from, sink),
            CecMessage::RequestArcInitiation if device.arc_capable => {
                CecMessage::InitiateArc.to_frame(from, sink)
            }
            CecMessage::RequestArcTermination if device.arc_capable => {
                CecMessage::TerminateArc.to_frame(from, sink)
            }
            CecMessage::RequestShortAudioDescriptor { .. } if device.arc_capable => {
                CecMessage::ReportShortAudioDescriptor {
                    descriptors: vec![0x09, 0x7F, 0x07],
                }
                .to_frame(from, sink)
            }
            CecMessage::GiveAudioStatus if device.arc_capable => CecMessage::ReportAudioStatus {
                mute: false,
                volume: 30,
            }
            .to_frame(from, sink),
            CecMessage::SystemAudioModeRequest { .. } if device.arc_capable => {
                CecMessage::SetSystemAudioMode { on: true }.to_frame(from, sink)
            }
            _ => return None,
        };
        Some(reply)
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CecBus for SimBus {
    async fn open(&self) -> Result<()> {
        self.inner.lock().open = true;
        debug!("sim: bus opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.open = false;
        inner.listener = None;
        debug!("sim: bus closed");
        Ok(())
    }

    async fn send(&self, frame: CecFrame, _timeout: Duration) -> Result<SendStatus, BusError> {
        // Collect everything under the lock, deliver replies after dropping it
        // so a listener that immediately re-enters send() cannot deadlock.
        let (status, replies) = {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(BusError::NotOpen);
            }
            inner.sent.push(frame.clone());

            if frame.is_broadcast() {
                // Broadcasts carry no directed ack on a real bus
                (SendStatus::Acked, Vec::new())
            } else {
                match inner.devices.get(&frame.destination.value()) {
                    None => (SendStatus::NoAck, Vec::new()),
                    Some(device) => {
                        let mut replies = Vec::new();
                        if device.answers_requests && !frame.is_poll() {
                            if let Ok(msg) = CecMessage::parse(&frame) {
                                if let Some(reply) =
                                    Self::reply_for(device, &msg, frame.initiator)
                                {
                                    replies.push(reply);
                                }
                            }
                        }
                        (SendStatus::Acked, replies)
                    }
                }
            }
        };

        let listener = self.inner.lock().listener.clone();
        if let Some(listener) = listener {
            for reply in replies {
                trace!("sim: scripted reply {:?}", reply);
                listener(reply);
            }
        }
        Ok(status)
    }

    fn set_listener(&self, listener: FrameListener) {
        self.inner.lock().listener = Some(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::opcode;

    #[tokio::test]
    async fn poll_acked_only_for_attached_devices() {
        let bus = SimBus::new();
        bus.open().await.unwrap();
        bus.attach(SimDevice::playback(4, PhysicalAddress::new(1, 0, 0, 0)));

        let tv = LogicalAddress::TV;
        let acked = bus
            .send(
                CecFrame::poll(tv, LogicalAddress::new(4).unwrap()),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(acked, SendStatus::Acked);

        let free = bus
            .send(
                CecFrame::poll(tv, LogicalAddress::new(8).unwrap()),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(free, SendStatus::NoAck);
    }

    #[tokio::test]
    async fn info_request_gets_scripted_reply() {
        let bus = SimBus::new();
        bus.open().await.unwrap();
        bus.attach(SimDevice::playback(4, PhysicalAddress::new(1, 0, 0, 0)));

        let received: std::sync::Arc<Mutex<Vec<CecFrame>>> =
            std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        bus.set_listener(std::sync::Arc::new(move |frame| {
            sink.lock().push(frame);
        }));

        bus.send(
            CecMessage::GivePhysicalAddress
                .to_frame(LogicalAddress::TV, LogicalAddress::new(4).unwrap()),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let frames = received.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), Some(opcode::REPORT_PHYSICAL_ADDRESS));
    }
}
