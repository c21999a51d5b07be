//! CEC message types and opcode-level codec
//!
//! Provides logical/physical addressing, typed CEC messages, and conversions
//! between typed messages and raw bus frames. Bit-level frame transfer is the
//! transport's job; everything opcode-and-above lives here.

use std::fmt;

/// Broadcast / unregistered logical address value
pub const BROADCAST: u8 = 0x0F;

/// A 4-bit CEC logical address (0-15)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalAddress(u8);

impl LogicalAddress {
    pub const TV: LogicalAddress = LogicalAddress(0);
    pub const AUDIO_SYSTEM: LogicalAddress = LogicalAddress(5);
    pub const FREE_USE: LogicalAddress = LogicalAddress(14);
    pub const UNREGISTERED: LogicalAddress = LogicalAddress(15);
    pub const BROADCAST: LogicalAddress = LogicalAddress(15);

    /// Build from a raw nibble. Values above 15 are rejected.
    pub fn new(value: u8) -> Option<Self> {
        if value <= 0x0F {
            Some(LogicalAddress(value))
        } else {
            None
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    /// Device role name per the CEC address table
    pub fn role_name(&self) -> &'static str {
        match self.0 {
            0 => "TV",
            1 | 2 | 9 => "Recording Device",
            3 | 6 | 7 | 10 => "Tuner",
            4 | 8 | 11 => "Playback Device",
            5 => "Audio System",
            12 | 13 => "Reserved",
            14 => "Free Use",
            _ => "Broadcast",
        }
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.role_name(), self.0)
    }
}

/// A 4-nibble HDMI physical address (e.g. 1.0.0.0)
///
/// Nibble 0 is the topmost level (the sink's input port), nibble 3 the
/// deepest. F.F.F.F means "not yet known".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalAddress(u16);

impl PhysicalAddress {
    pub const INVALID: PhysicalAddress = PhysicalAddress(0xFFFF);

    pub fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        PhysicalAddress(
            ((a as u16 & 0x0F) << 12)
                | ((b as u16 & 0x0F) << 8)
                | ((c as u16 & 0x0F) << 4)
                | (d as u16 & 0x0F),
        )
    }

    pub fn from_raw(raw: u16) -> Self {
        PhysicalAddress(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Nibble at depth 0..=3, 0 being the input-port level
    pub fn nibble(&self, depth: usize) -> u8 {
        debug_assert!(depth < 4);
        ((self.0 >> (12 - 4 * depth)) & 0x0F) as u8
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0xFFFF
    }

    /// Parse dotted form, e.g. "2.1.0.0"
    pub fn parse(s: &str) -> Option<Self> {
        let mut nibbles = [0u8; 4];
        let mut count = 0;
        for part in s.split('.') {
            if count == 4 {
                return None;
            }
            let v = u8::from_str_radix(part, 16).ok()?;
            if v > 0x0F {
                return None;
            }
            nibbles[count] = v;
            count += 1;
        }
        if count != 4 {
            return None;
        }
        Some(Self::new(nibbles[0], nibbles[1], nibbles[2], nibbles[3]))
    }

    pub fn to_operands(self) -> [u8; 2] {
        [(self.0 >> 8) as u8, (self.0 & 0xFF) as u8]
    }

    pub fn from_operands(hi: u8, lo: u8) -> Self {
        PhysicalAddress(((hi as u16) << 8) | lo as u16)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:X}.{:X}.{:X}.{:X}",
            self.nibble(0),
            self.nibble(1),
            self.nibble(2),
            self.nibble(3)
        )
    }
}

/// CEC device types as carried in Report Physical Address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Tv,
    RecordingDevice,
    Reserved,
    Tuner,
    PlaybackDevice,
    AudioSystem,
    Switch,
    VideoProcessor,
}

impl DeviceType {
    pub fn from_operand(v: u8) -> Option<Self> {
        match v {
            0 => Some(DeviceType::Tv),
            1 => Some(DeviceType::RecordingDevice),
            2 => Some(DeviceType::Reserved),
            3 => Some(DeviceType::Tuner),
            4 => Some(DeviceType::PlaybackDevice),
            5 => Some(DeviceType::AudioSystem),
            6 => Some(DeviceType::Switch),
            7 => Some(DeviceType::VideoProcessor),
            _ => None,
        }
    }

    pub fn to_operand(self) -> u8 {
        match self {
            DeviceType::Tv => 0,
            DeviceType::RecordingDevice => 1,
            DeviceType::Reserved => 2,
            DeviceType::Tuner => 3,
            DeviceType::PlaybackDevice => 4,
            DeviceType::AudioSystem => 5,
            DeviceType::Switch => 6,
            DeviceType::VideoProcessor => 7,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Tv => "TV",
            DeviceType::RecordingDevice => "Recording Device",
            DeviceType::Reserved => "Reserved",
            DeviceType::Tuner => "Tuner",
            DeviceType::PlaybackDevice => "Playback Device",
            DeviceType::AudioSystem => "Audio System",
            DeviceType::Switch => "Switch",
            DeviceType::VideoProcessor => "Video Processor",
        };
        write!(f, "{}", name)
    }
}

/// CEC version byte as carried in the CEC Version message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CecVersion {
    V1_3a,
    V1_4,
    V2_0,
    Unknown(u8),
}

impl CecVersion {
    pub fn from_operand(v: u8) -> Self {
        match v {
            0x04 => CecVersion::V1_3a,
            0x05 => CecVersion::V1_4,
            0x06 => CecVersion::V2_0,
            other => CecVersion::Unknown(other),
        }
    }

    pub fn to_operand(self) -> u8 {
        match self {
            CecVersion::V1_3a => 0x04,
            CecVersion::V1_4 => 0x05,
            CecVersion::V2_0 => 0x06,
            CecVersion::Unknown(v) => v,
        }
    }
}

impl fmt::Display for CecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CecVersion::V1_3a => write!(f, "1.3a"),
            CecVersion::V1_4 => write!(f, "1.4"),
            CecVersion::V2_0 => write!(f, "2.0"),
            CecVersion::Unknown(v) => write!(f, "unknown(0x{:02X})", v),
        }
    }
}

/// Device power status as carried in Report Power Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStatus {
    On,
    Standby,
    TransitionToOn,
    TransitionToStandby,
    Unknown(u8),
}

impl PowerStatus {
    pub fn from_operand(v: u8) -> Self {
        match v {
            0x00 => PowerStatus::On,
            0x01 => PowerStatus::Standby,
            0x02 => PowerStatus::TransitionToOn,
            0x03 => PowerStatus::TransitionToStandby,
            other => PowerStatus::Unknown(other),
        }
    }

    pub fn to_operand(self) -> u8 {
        match self {
            PowerStatus::On => 0x00,
            PowerStatus::Standby => 0x01,
            PowerStatus::TransitionToOn => 0x02,
            PowerStatus::TransitionToStandby => 0x03,
            PowerStatus::Unknown(v) => v,
        }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerStatus::On => write!(f, "On"),
            PowerStatus::Standby => write!(f, "Standby"),
            PowerStatus::TransitionToOn => write!(f, "Standby->On"),
            PowerStatus::TransitionToStandby => write!(f, "On->Standby"),
            PowerStatus::Unknown(v) => write!(f, "unknown(0x{:02X})", v),
        }
    }
}

/// IEEE OUI vendor identifier (3 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorId(pub [u8; 3]);

impl VendorId {
    /// Parse a hex string such as "0019FB", with or without leading "0x"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim_start_matches("0x").trim_start_matches("0X");
        // Accept short forms by left-padding to 6 digits
        if s.is_empty() || s.len() > 6 {
            return None;
        }
        let padded = format!("{:0>6}", s);
        let bytes = hex::decode(&padded).ok()?;
        Some(VendorId([bytes[0], bytes[1], bytes[2]]))
    }
}

impl fmt::Display for VendorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// Feature Abort reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UnrecognizedOpcode,
    NotInCorrectMode,
    CannotProvideSource,
    InvalidOperand,
    Refused,
    UnableToDetermine,
    Other(u8),
}

impl AbortReason {
    pub fn from_operand(v: u8) -> Self {
        match v {
            0 => AbortReason::UnrecognizedOpcode,
            1 => AbortReason::NotInCorrectMode,
            2 => AbortReason::CannotProvideSource,
            3 => AbortReason::InvalidOperand,
            4 => AbortReason::Refused,
            5 => AbortReason::UnableToDetermine,
            other => AbortReason::Other(other),
        }
    }

    pub fn to_operand(self) -> u8 {
        match self {
            AbortReason::UnrecognizedOpcode => 0,
            AbortReason::NotInCorrectMode => 1,
            AbortReason::CannotProvideSource => 2,
            AbortReason::InvalidOperand => 3,
            AbortReason::Refused => 4,
            AbortReason::UnableToDetermine => 5,
            AbortReason::Other(v) => v,
        }
    }
}

/// User Control codes forwarded over the key-event queue
pub mod keycode {
    pub const SELECT: u8 = 0x00;
    pub const UP: u8 = 0x01;
    pub const DOWN: u8 = 0x02;
    pub const LEFT: u8 = 0x03;
    pub const RIGHT: u8 = 0x04;
    pub const HOME: u8 = 0x09;
    pub const BACK: u8 = 0x0D;
    pub const NUMBER_0: u8 = 0x20;
    pub const NUMBER_9: u8 = 0x29;
    pub const VOLUME_UP: u8 = 0x41;
    pub const VOLUME_DOWN: u8 = 0x42;
    pub const MUTE: u8 = 0x43;

    /// Keys that address the audio path and should refresh cached audio status
    pub fn is_audio_key(code: u8) -> bool {
        matches!(code, VOLUME_UP | VOLUME_DOWN | MUTE)
    }
}

/// Raw CEC opcodes
pub mod opcode {
    pub const FEATURE_ABORT: u8 = 0x00;
    pub const IMAGE_VIEW_ON: u8 = 0x04;
    pub const TEXT_VIEW_ON: u8 = 0x0D;
    pub const SET_MENU_LANGUAGE: u8 = 0x32;
    pub const STANDBY: u8 = 0x36;
    pub const USER_CONTROL_PRESSED: u8 = 0x44;
    pub const USER_CONTROL_RELEASED: u8 = 0x45;
    pub const GIVE_OSD_NAME: u8 = 0x46;
    pub const SET_OSD_NAME: u8 = 0x47;
    pub const SET_OSD_STRING: u8 = 0x64;
    pub const SYSTEM_AUDIO_MODE_REQUEST: u8 = 0x70;
    pub const GIVE_AUDIO_STATUS: u8 = 0x71;
    pub const SET_SYSTEM_AUDIO_MODE: u8 = 0x72;
    pub const REPORT_AUDIO_STATUS: u8 = 0x7A;
    pub const ROUTING_CHANGE: u8 = 0x80;
    pub const ROUTING_INFORMATION: u8 = 0x81;
    pub const ACTIVE_SOURCE: u8 = 0x82;
    pub const GIVE_PHYSICAL_ADDRESS: u8 = 0x83;
    pub const REPORT_PHYSICAL_ADDRESS: u8 = 0x84;
    pub const REQUEST_ACTIVE_SOURCE: u8 = 0x85;
    pub const SET_STREAM_PATH: u8 = 0x86;
    pub const DEVICE_VENDOR_ID: u8 = 0x87;
    pub const GIVE_DEVICE_VENDOR_ID: u8 = 0x8C;
    pub const GIVE_DEVICE_POWER_STATUS: u8 = 0x8F;
    pub const REPORT_POWER_STATUS: u8 = 0x90;
    pub const GET_MENU_LANGUAGE: u8 = 0x91;
    pub const INACTIVE_SOURCE: u8 = 0x9D;
    pub const CEC_VERSION: u8 = 0x9E;
    pub const GET_CEC_VERSION: u8 = 0x9F;
    pub const REPORT_SHORT_AUDIO_DESCRIPTOR: u8 = 0xA3;
    pub const REQUEST_SHORT_AUDIO_DESCRIPTOR: u8 = 0xA4;
    pub const GIVE_FEATURES: u8 = 0xA5;
    pub const REPORT_FEATURES: u8 = 0xA6;
    pub const REQUEST_CURRENT_LATENCY: u8 = 0xA7;
    pub const REPORT_CURRENT_LATENCY: u8 = 0xA8;
    pub const INITIATE_ARC: u8 = 0xC0;
    pub const REPORT_ARC_INITIATED: u8 = 0xC1;
    pub const REPORT_ARC_TERMINATED: u8 = 0xC2;
    pub const REQUEST_ARC_INITIATION: u8 = 0xC3;
    pub const REQUEST_ARC_TERMINATION: u8 = 0xC4;
    pub const TERMINATE_ARC: u8 = 0xC5;
    pub const ABORT: u8 = 0xFF;
}

/// A raw frame as exchanged with the bus transport
///
/// `payload` is `[opcode, operands...]`, or empty for a directed poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CecFrame {
    pub initiator: LogicalAddress,
    pub destination: LogicalAddress,
    pub payload: Vec<u8>,
}

impl CecFrame {
    pub fn poll(initiator: LogicalAddress, destination: LogicalAddress) -> Self {
        CecFrame {
            initiator,
            destination,
            payload: Vec::new(),
        }
    }

    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn operands(&self) -> &[u8] {
        if self.payload.is_empty() {
            &[]
        } else {
            &self.payload[1..]
        }
    }

    pub fn is_poll(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}

/// Typed CEC messages understood by the sink engine
#[derive(Debug, Clone, PartialEq)]
pub enum CecMessage {
    /// Directed poll: no opcode, liveness check only
    Poll,
    FeatureAbort { opcode: u8, reason: AbortReason },
    Abort,
    ImageViewOn,
    TextViewOn,
    Standby,
    ActiveSource { physical_address: PhysicalAddress },
    InactiveSource { physical_address: PhysicalAddress },
    RequestActiveSource,
    SetStreamPath { physical_address: PhysicalAddress },
    RoutingChange { from: PhysicalAddress, to: PhysicalAddress },
    RoutingInformation { physical_address: PhysicalAddress },
    GivePhysicalAddress,
    ReportPhysicalAddress { physical_address: PhysicalAddress, device_type: DeviceType },
    GiveDeviceVendorId,
    DeviceVendorId { vendor_id: VendorId },
    GetCecVersion,
    CecVersionReport { version: CecVersion },
    GiveOsdName,
    SetOsdName { name: String },
    SetOsdString { display_control: u8, text: String },
    GetMenuLanguage,
    SetMenuLanguage { language: String },
    GiveDevicePowerStatus,
    ReportPowerStatus { status: PowerStatus },
    UserControlPressed { key_code: u8 },
    UserControlReleased,
    GiveFeatures,
    SystemAudioModeRequest { physical_address: Option<PhysicalAddress> },
    SetSystemAudioMode { on: bool },
    GiveAudioStatus,
    ReportAudioStatus { mute: bool, volume: u8 },
    RequestShortAudioDescriptor { descriptors: Vec<u8> },
    ReportShortAudioDescriptor { descriptors: Vec<u8> },
    RequestCurrentLatency { physical_address: PhysicalAddress },
    ReportCurrentLatency {
        physical_address: PhysicalAddress,
        video_latency: u8,
        latency_flags: u8,
        audio_output_delay: u8,
    },
    InitiateArc,
    TerminateArc,
    RequestArcInitiation,
    RequestArcTermination,
    ReportArcInitiated,
    ReportArcTerminated,
}

/// Why an inbound frame failed to decode into a [`CecMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageParseError {
    #[error("unrecognized opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("truncated operands for opcode 0x{0:02X}")]
    Truncated(u8),
}

impl CecMessage {
    /// Decode a raw frame into a typed message
    pub fn parse(frame: &CecFrame) -> Result<Self, MessageParseError> {
        use opcode::*;

        let op = match frame.opcode() {
            None => return Ok(CecMessage::Poll),
            Some(op) => op,
        };
        let args = frame.operands();
        let need = |n: usize| {
            if args.len() < n {
                Err(MessageParseError::Truncated(op))
            } else {
                Ok(())
            }
        };

        let msg = match op {
            FEATURE_ABORT => {
                need(2)?;
                CecMessage::FeatureAbort {
                    opcode: args[0],
                    reason: AbortReason::from_operand(args[1]),
                }
            }
            ABORT => CecMessage::Abort,
            IMAGE_VIEW_ON => CecMessage::ImageViewOn,
            TEXT_VIEW_ON => CecMessage::TextViewOn,
            STANDBY => CecMessage::Standby,
            ACTIVE_SOURCE => {
                need(2)?;
                CecMessage::ActiveSource {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                }
            }
            INACTIVE_SOURCE => {
                need(2)?;
                CecMessage::InactiveSource {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                }
            }
            REQUEST_ACTIVE_SOURCE => CecMessage::RequestActiveSource,
            SET_STREAM_PATH => {
                need(2)?;
                CecMessage::SetStreamPath {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                }
            }
            ROUTING_CHANGE => {
                need(4)?;
                CecMessage::RoutingChange {
                    from: PhysicalAddress::from_operands(args[0], args[1]),
                    to: PhysicalAddress::from_operands(args[2], args[3]),
                }
            }
            ROUTING_INFORMATION => {
                need(2)?;
                CecMessage::RoutingInformation {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                }
            }
            GIVE_PHYSICAL_ADDRESS => CecMessage::GivePhysicalAddress,
            REPORT_PHYSICAL_ADDRESS => {
                need(3)?;
                CecMessage::ReportPhysicalAddress {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                    device_type: DeviceType::from_operand(args[2])
                        .ok_or(MessageParseError::Truncated(op))?,
                }
            }
            GIVE_DEVICE_VENDOR_ID => CecMessage::GiveDeviceVendorId,
            DEVICE_VENDOR_ID => {
                need(3)?;
                CecMessage::DeviceVendorId {
                    vendor_id: VendorId([args[0], args[1], args[2]]),
                }
            }
            GET_CEC_VERSION => CecMessage::GetCecVersion,
            CEC_VERSION => {
                need(1)?;
                CecMessage::CecVersionReport {
                    version: CecVersion::from_operand(args[0]),
                }
            }
            GIVE_OSD_NAME => CecMessage::GiveOsdName,
            SET_OSD_NAME => CecMessage::SetOsdName {
                name: String::from_utf8_lossy(args).into_owned(),
            },
            SET_OSD_STRING => {
                need(1)?;
                CecMessage::SetOsdString {
                    display_control: args[0],
                    text: String::from_utf8_lossy(&args[1..]).into_owned(),
                }
            }
            GET_MENU_LANGUAGE => CecMessage::GetMenuLanguage,
            SET_MENU_LANGUAGE => {
                need(3)?;
                CecMessage::SetMenuLanguage {
                    language: String::from_utf8_lossy(&args[..3]).into_owned(),
                }
            }
            GIVE_DEVICE_POWER_STATUS => CecMessage::GiveDevicePowerStatus,
            REPORT_POWER_STATUS => {
                need(1)?;
                CecMessage::ReportPowerStatus {
                    status: PowerStatus::from_operand(args[0]),
                }
            }
            USER_CONTROL_PRESSED => {
                need(1)?;
                CecMessage::UserControlPressed { key_code: args[0] }
            }
            USER_CONTROL_RELEASED => CecMessage::UserControlReleased,
            GIVE_FEATURES => CecMessage::GiveFeatures,
            SYSTEM_AUDIO_MODE_REQUEST => CecMessage::SystemAudioModeRequest {
                physical_address: if args.len() >= 2 {
                    Some(PhysicalAddress::from_operands(args[0], args[1]))
                } else {
                    None
                },
            },
            SET_SYSTEM_AUDIO_MODE => {
                need(1)?;
                CecMessage::SetSystemAudioMode { on: args[0] != 0 }
            }
            GIVE_AUDIO_STATUS => CecMessage::GiveAudioStatus,
            REPORT_AUDIO_STATUS => {
                need(1)?;
                CecMessage::ReportAudioStatus {
                    mute: args[0] & 0x80 != 0,
                    volume: args[0] & 0x7F,
                }
            }
            REQUEST_SHORT_AUDIO_DESCRIPTOR => CecMessage::RequestShortAudioDescriptor {
                descriptors: args.to_vec(),
            },
            REPORT_SHORT_AUDIO_DESCRIPTOR => CecMessage::ReportShortAudioDescriptor {
                descriptors: args.to_vec(),
            },
            REQUEST_CURRENT_LATENCY => {
                need(2)?;
                CecMessage::RequestCurrentLatency {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                }
            }
            REPORT_CURRENT_LATENCY => {
                need(4)?;
                CecMessage::ReportCurrentLatency {
                    physical_address: PhysicalAddress::from_operands(args[0], args[1]),
                    video_latency: args[2],
                    latency_flags: args[3],
                    audio_output_delay: args.get(4).copied().unwrap_or(0),
                }
            }
            INITIATE_ARC => CecMessage::InitiateArc,
            TERMINATE_ARC => CecMessage::TerminateArc,
            REQUEST_ARC_INITIATION => CecMessage::RequestArcInitiation,
            REQUEST_ARC_TERMINATION => CecMessage::RequestArcTermination,
            REPORT_ARC_INITIATED => CecMessage::ReportArcInitiated,
            REPORT_ARC_TERMINATED => CecMessage::ReportArcTerminated,
            other => return Err(MessageParseError::UnknownOpcode(other)),
        };
        Ok(msg)
    }

    /// Encode into the raw payload `[opcode, operands...]` (empty for a poll)
    pub fn to_payload(&self) -> Vec<u8> {
        use opcode::*;

        match self {
            CecMessage::Poll => Vec::new(),
            CecMessage::FeatureAbort { opcode, reason } => {
                vec![FEATURE_ABORT, *opcode, reason.to_operand()]
            }
            CecMessage::Abort => vec![ABORT],
            CecMessage::ImageViewOn => vec![IMAGE_VIEW_ON],
            CecMessage::TextViewOn => vec![TEXT_VIEW_ON],
            CecMessage::Standby => vec![STANDBY],
            CecMessage::ActiveSource { physical_address } => {
                let [hi, lo] = physical_address.to_operands();
                vec![ACTIVE_SOURCE, hi, lo]
            }
            CecMessage::InactiveSource { physical_address } => {
                let [hi, lo] = physical_address.to_operands();
                vec![INACTIVE_SOURCE, hi, lo]
            }
            CecMessage::RequestActiveSource => vec![REQUEST_ACTIVE_SOURCE],
            CecMessage::SetStreamPath { physical_address } => {
                let [hi, lo] = physical_address.to_operands();
                vec![SET_STREAM_PATH, hi, lo]
            }
            CecMessage::RoutingChange { from, to } => {
                let [fh, fl] = from.to_operands();
                let [th, tl] = to.to_operands();
                vec![ROUTING_CHANGE, fh, fl, th, tl]
            }
            CecMessage::RoutingInformation { physical_address } => {
                let [hi, lo] = physical_address.to_operands();
                vec![ROUTING_INFORMATION, hi, lo]
            }
            CecMessage::GivePhysicalAddress => vec![GIVE_PHYSICAL_ADDRESS],
            CecMessage::ReportPhysicalAddress {
                physical_address,
                device_type,
            } => {
                let [hi, lo] = physical_address.to_operands();
                vec![REPORT_PHYSICAL_ADDRESS, hi, lo, device_type.to_operand()]
            }
            CecMessage::GiveDeviceVendorId => vec![GIVE_DEVICE_VENDOR_ID],
            CecMessage::DeviceVendorId { vendor_id } => {
                vec![DEVICE_VENDOR_ID, vendor_id.0[0], vendor_id.0[1], vendor_id.0[2]]
            }
            CecMessage::GetCecVersion => vec![GET_CEC_VERSION],
            CecMessage::CecVersionReport { version } => {
                vec![CEC_VERSION, version.to_operand()]
            }
            CecMessage::GiveOsdName => vec![GIVE_OSD_NAME],
            CecMessage::SetOsdName { name } => {
                let mut payload = vec![SET_OSD_NAME];
                payload.extend_from_slice(&name.as_bytes()[..name.len().min(14)]);
                payload
            }
            CecMessage::SetOsdString { display_control, text } => {
                let mut payload = vec![SET_OSD_STRING, *display_control];
                payload.extend_from_slice(&text.as_bytes()[..text.len().min(13)]);
                payload
            }
            CecMessage::GetMenuLanguage => vec![GET_MENU_LANGUAGE],
            CecMessage::SetMenuLanguage { language } => {
                let mut payload = vec![SET_MENU_LANGUAGE];
                let bytes = language.as_bytes();
                payload.extend_from_slice(&bytes[..bytes.len().min(3)]);
                while payload.len() < 4 {
                    payload.push(b' ');
                }
                payload
            }
            CecMessage::GiveDevicePowerStatus => vec![GIVE_DEVICE_POWER_STATUS],
            CecMessage::ReportPowerStatus { status } => {
                vec![REPORT_POWER_STATUS, status.to_operand()]
            }
            CecMessage::UserControlPressed { key_code } => {
                vec![USER_CONTROL_PRESSED, *key_code]
            }
            CecMessage::UserControlReleased => vec![USER_CONTROL_RELEASED],
            CecMessage::GiveFeatures => vec![GIVE_FEATURES],
            CecMessage::SystemAudioModeRequest { physical_address } => {
                let mut payload = vec![SYSTEM_AUDIO_MODE_REQUEST];
                if let Some(pa) = physical_address {
                    let [hi, lo] = pa.to_operands();
                    payload.push(hi);
                    payload.push(lo);
                }
                payload
            }
            CecMessage::SetSystemAudioMode { on } => {
                vec![SET_SYSTEM_AUDIO_MODE, u8::from(*on)]
            }
            CecMessage::GiveAudioStatus => vec![GIVE_AUDIO_STATUS],
            CecMessage::ReportAudioStatus { mute, volume } => {
                vec![
                    REPORT_AUDIO_STATUS,
                    (u8::from(*mute) << 7) | (volume & 0x7F),
                ]
            }
            CecMessage::RequestShortAudioDescriptor { descriptors } => {
                let mut payload = vec![REQUEST_SHORT_AUDIO_DESCRIPTOR];
                payload.extend_from_slice(descriptors);
                payload
            }
            CecMessage::ReportShortAudioDescriptor { descriptors } => {
                let mut payload = vec![REPORT_SHORT_AUDIO_DESCRIPTOR];
                payload.extend_from_slice(descriptors);
                payload
            }
            CecMessage::RequestCurrentLatency { physical_address } => {
                let [hi, lo] = physical_address.to_operands();
                vec![REQUEST_CURRENT_LATENCY, hi, lo]
            }
            CecMessage::ReportCurrentLatency {
                physical_address,
                video_latency,
                latency_flags,
                audio_output_delay,
            } => {
                let [hi, lo] = physical_address.to_operands();
                vec![
                    REPORT_CURRENT_LATENCY,
                    hi,
                    lo,
                    *video_latency,
                    *latency_flags,
                    *audio_output_delay,
                ]
            }
            CecMessage::InitiateArc => vec![INITIATE_ARC],
            CecMessage::TerminateArc => vec![TERMINATE_ARC],
            CecMessage::RequestArcInitiation => vec![REQUEST_ARC_INITIATION],
            CecMessage::RequestArcTermination => vec![REQUEST_ARC_TERMINATION],
            CecMessage::ReportArcInitiated => vec![REPORT_ARC_INITIATED],
            CecMessage::ReportArcTerminated => vec![REPORT_ARC_TERMINATED],
        }
    }

    /// Wrap into a frame addressed from `initiator` to `destination`
    pub fn to_frame(&self, initiator: LogicalAddress, destination: LogicalAddress) -> CecFrame {
        CecFrame {
            initiator,
            destination,
            payload: self.to_payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_address_nibbles() {
        let pa = PhysicalAddress::new(2, 1, 0, 0);
        assert_eq!(pa.nibble(0), 2);
        assert_eq!(pa.nibble(1), 1);
        assert_eq!(pa.nibble(2), 0);
        assert_eq!(pa.raw(), 0x2100);
        assert_eq!(pa.to_string(), "2.1.0.0");
    }

    #[test]
    fn physical_address_parse() {
        assert_eq!(
            PhysicalAddress::parse("1.0.0.0"),
            Some(PhysicalAddress::new(1, 0, 0, 0))
        );
        assert_eq!(PhysicalAddress::parse("1.0.0"), None);
        assert_eq!(PhysicalAddress::parse("1.0.0.0.0"), None);
        assert_eq!(PhysicalAddress::parse("x.0.0.0"), None);
    }

    #[test]
    fn logical_address_bounds() {
        assert!(LogicalAddress::new(15).is_some());
        assert!(LogicalAddress::new(16).is_none());
    }

    #[test]
    fn vendor_id_parse_and_format() {
        let id = VendorId::parse("0019FB").unwrap();
        assert_eq!(id.0, [0x00, 0x19, 0xFB]);
        assert_eq!(id.to_string(), "0019FB");
        // Short forms are left-padded
        assert_eq!(VendorId::parse("19FB").unwrap().0, [0x00, 0x19, 0xFB]);
        assert!(VendorId::parse("not-hex").is_none());
    }

    #[test]
    fn parse_poll_frame() {
        let frame = CecFrame::poll(LogicalAddress::TV, LogicalAddress::new(4).unwrap());
        assert_eq!(CecMessage::parse(&frame), Ok(CecMessage::Poll));
    }

    #[test]
    fn parse_report_physical_address() {
        let frame = CecFrame {
            initiator: LogicalAddress::new(3).unwrap(),
            destination: LogicalAddress::BROADCAST,
            payload: vec![opcode::REPORT_PHYSICAL_ADDRESS, 0x10, 0x00, 0x03],
        };
        assert_eq!(
            CecMessage::parse(&frame),
            Ok(CecMessage::ReportPhysicalAddress {
                physical_address: PhysicalAddress::new(1, 0, 0, 0),
                device_type: DeviceType::Tuner,
            })
        );
    }

    #[test]
    fn parse_truncated_operands() {
        let frame = CecFrame {
            initiator: LogicalAddress::new(3).unwrap(),
            destination: LogicalAddress::TV,
            payload: vec![opcode::REPORT_PHYSICAL_ADDRESS, 0x10],
        };
        assert_eq!(
            CecMessage::parse(&frame),
            Err(MessageParseError::Truncated(opcode::REPORT_PHYSICAL_ADDRESS))
        );
    }

    #[test]
    fn parse_unknown_opcode() {
        let frame = CecFrame {
            initiator: LogicalAddress::new(4).unwrap(),
            destination: LogicalAddress::TV,
            payload: vec![0x6B],
        };
        assert_eq!(
            CecMessage::parse(&frame),
            Err(MessageParseError::UnknownOpcode(0x6B))
        );
    }

    #[test]
    fn report_audio_status_packs_mute_bit() {
        let msg = CecMessage::ReportAudioStatus {
            mute: true,
            volume: 30,
        };
        assert_eq!(msg.to_payload(), vec![opcode::REPORT_AUDIO_STATUS, 0x9E]);
        let frame = CecFrame {
            initiator: LogicalAddress::AUDIO_SYSTEM,
            destination: LogicalAddress::TV,
            payload: msg.to_payload(),
        };
        assert_eq!(CecMessage::parse(&frame), Ok(msg));
    }

    #[test]
    fn osd_name_is_clamped_to_cec_limit() {
        let msg = CecMessage::SetOsdName {
            name: "A-very-long-device-name".into(),
        };
        let payload = msg.to_payload();
        assert_eq!(payload.len(), 1 + 14);
    }
}
