//! The CEC sink engine
//!
//! Owns the single bus connection and every piece of protocol state: the
//! device registry, the input topology, the active-source/route state, the
//! ARC session and the key-event queue. Three workers run for the engine's
//! lifetime (liveness poller, ARC worker, key-event worker) next to the
//! dispatch task that drains inbound frames; all of them synchronize on one
//! coarse state lock that is never held across a bus send.

mod allocator;
mod arc;
mod dispatch;
mod events;
mod keys;
mod poller;
mod registry;
mod topology;

#[cfg(test)]
mod tests;

pub use arc::ArcRoutingState;
pub use events::EngineEvent;
pub use poller::PollState;
pub use registry::{DeviceRecord, DeviceSummary, Registry, RequestedAttribute};
pub use topology::Topology;

use crate::config::{AppConfig, DeviceConfig, TimingConfig};
use crate::message::{CecMessage, DeviceType, LogicalAddress, PhysicalAddress, VendorId};
use crate::settings::{CecSettings, SettingsStoreHandle};
use crate::transport::CecBus;
use anyhow::{Context, Result};
use arc::{ArcCommand, ArcShared};
use keys::{KeyAction, KeyEntry};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Latency values served in Report Current Latency replies
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyInfo {
    pub video_latency: u8,
    pub latency_flags: u8,
    pub audio_output_delay: u8,
}

/// Everything guarded by the engine's state lock
pub(crate) struct SinkState {
    pub devices: Registry,
    pub topology: Topology,
    pub our_logical: Option<LogicalAddress>,
    pub our_physical: PhysicalAddress,
    pub enabled: bool,
    pub otp_enabled: bool,
    pub osd_name: String,
    pub vendor_id: VendorId,
    pub language: String,
    pub active_source: Option<u8>,
    pub active_source_pa: Option<PhysicalAddress>,
    pub system_audio_mode: bool,
    pub audio_status: Option<(bool, u8)>,
    pub audio_device_connected: bool,
    pub audio_power_status_requested: bool,
    pub latency: LatencyInfo,
}

/// Shared core handed to the workers
pub(crate) struct EngineInner {
    pub device_type: DeviceType,
    pub tunables: TimingConfig,
    pub bus: Arc<dyn CecBus>,
    pub state: Mutex<SinkState>,
    pub arc: ArcShared,
    pub key_tx: mpsc::UnboundedSender<KeyEntry>,
    pub events: broadcast::Sender<EngineEvent>,
    pub shutdown: watch::Sender<bool>,
    /// Pokes the poller out of Idle/Wait early (hotplug, enable, tests)
    pub poll_kick: Notify,
    pub settings: SettingsStoreHandle,
}

impl EngineInner {
    fn persisted(&self) -> CecSettings {
        let state = self.state.lock();
        CecSettings {
            enabled: state.enabled,
            otp_enabled: state.otp_enabled,
            osd_name: state.osd_name.clone(),
            vendor_id: state.vendor_id.to_string(),
        }
    }

    /// Queue the current settings for a debounced write
    fn persist_settings(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let snapshot = inner.persisted();
            inner.settings.save(snapshot).await;
        });
    }

    /// Probe-and-claim our logical address, then announce ourselves
    async fn allocate_and_announce(self: &Arc<Self>) {
        let claimed = allocator::allocate(
            self.bus.as_ref(),
            self.device_type,
            self.tunables.send_timeout(),
        )
        .await;

        let Some(address) = claimed else {
            let _ = self.events.send(EngineEvent::NoLogicalAddress);
            return;
        };

        {
            let mut state = self.state.lock();
            state.our_logical = Some(address);
        }
        let _ = self.events.send(EngineEvent::AddressAllocated {
            logical_address: address.value(),
        });

        let (physical, vendor_id) = {
            let state = self.state.lock();
            (state.our_physical, state.vendor_id)
        };
        self.broadcast(CecMessage::ReportPhysicalAddress {
            physical_address: physical,
            device_type: self.device_type,
        })
        .await;
        self.broadcast(CecMessage::DeviceVendorId { vendor_id }).await;
        self.poll_kick.notify_one();
    }
}

/// The public engine handle
///
/// API methods mirror what the RPC layer exposes. Reads come straight out of
/// the registry; operations that involve bus traffic enqueue or spawn it so
/// callers never wait out a bus timeout.
pub struct CecSinkEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// Active source attributes handed to the RPC layer
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveSourceInfo {
    pub available: bool,
    pub logical_address: u8,
    pub physical_address: String,
    pub device_type: String,
    pub cec_version: String,
    pub osd_name: String,
    pub vendor_id: String,
    pub power_status: String,
    pub port: String,
}

/// Active route as an ordered hop list plus a printable form
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveRoute {
    pub available: bool,
    pub length: u8,
    pub path: Vec<DeviceSummary>,
    pub route: String,
}

impl CecSinkEngine {
    /// Bring the engine up on an opened bus and start the workers
    pub async fn start(config: AppConfig, bus: Arc<dyn CecBus>) -> Result<Self> {
        config.validate()?;

        let settings = SettingsStoreHandle::spawn(
            &config.storage.settings_db,
            config.storage.settings_debounce_ms,
        )
        .context("settings store")?;
        let stored = settings.load().await.unwrap_or_else(|| CecSettings {
            osd_name: config.device.osd_name.clone(),
            vendor_id: config.device.vendor_id.clone(),
            ..CecSettings::default()
        });

        bus.open().await.context("opening CEC bus")?;

        let DeviceConfig {
            language,
            hdmi_ports,
            ..
        } = config.device.clone();
        let vendor_id = VendorId::parse(&stored.vendor_id)
            .or_else(|| VendorId::parse(&config.device.vendor_id))
            .unwrap_or(VendorId([0, 0, 0]));

        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            device_type: DeviceType::Tv,
            tunables: config.timing.clone(),
            bus: bus.clone(),
            state: Mutex::new(SinkState {
                devices: Registry::new(),
                topology: Topology::new(hdmi_ports),
                our_logical: None,
                our_physical: PhysicalAddress::new(0, 0, 0, 0),
                enabled: stored.enabled,
                otp_enabled: stored.otp_enabled,
                osd_name: stored.osd_name,
                vendor_id,
                language,
                active_source: None,
                active_source_pa: None,
                system_audio_mode: false,
                audio_status: None,
                audio_device_connected: false,
                audio_power_status_requested: false,
                latency: LatencyInfo::default(),
            }),
            arc: ArcShared::new(),
            key_tx,
            events: events::channel(),
            shutdown: watch::channel(false).0,
            poll_kick: Notify::new(),
            settings,
        });

        // Inbound frames go through a channel so the transport callback
        // returns immediately and frames are drained strictly one at a time.
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        bus.set_listener(Arc::new(move |frame| {
            let _ = frame_tx.send(frame);
        }));

        let dispatch_inner = inner.clone();
        let mut dispatch_shutdown = inner.shutdown.subscribe();
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_shutdown.changed() => break,
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => dispatch_inner.handle_frame(frame).await,
                        None => break,
                    },
                }
            }
            debug!("dispatch task stopped");
        });

        let key_worker = tokio::spawn(keys::run(inner.clone(), key_rx));
        let arc_worker = tokio::spawn(arc::run(inner.clone()));
        let poll_worker = tokio::spawn(poller::run(inner.clone()));

        if inner.state.lock().enabled {
            inner.allocate_and_announce().await;
        } else {
            info!("engine starting disabled; waiting for SetEnabled");
        }

        Ok(CecSinkEngine {
            inner,
            workers: Mutex::new(vec![
                ("key-event", key_worker),
                ("arc", arc_worker),
                ("poller", poll_worker),
                ("dispatch", dispatch),
            ]),
        })
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the workers in order, flush settings and release the bus
    pub async fn shutdown(&self) -> Result<()> {
        info!("engine shutting down");
        let _ = self.inner.shutdown.send(true);
        self.inner.poll_kick.notify_one();

        let workers = std::mem::take(&mut *self.workers.lock());
        for (name, handle) in workers {
            if let Err(e) = handle.await {
                warn!("{} worker did not join cleanly: {}", name, e);
            }
        }

        self.inner.settings.flush().await.ok();
        self.inner.settings.shutdown().await;
        self.inner.bus.close().await.context("closing CEC bus")?;
        Ok(())
    }

    /// Our claimed logical address, if allocation succeeded
    pub fn logical_address(&self) -> Option<u8> {
        self.inner.state.lock().our_logical.map(|la| la.value())
    }

    /// Current ARC session state
    pub fn arc_state(&self) -> ArcRoutingState {
        self.inner.arc.current()
    }

    // ------------------------------------------------------------------
    // Device list / topology
    // ------------------------------------------------------------------

    /// Summaries of every known device other than ourselves
    pub fn get_device_list(&self) -> Vec<DeviceSummary> {
        let state = self.inner.state.lock();
        let own = state.our_logical.map(|la| la.value());
        (0u8..16)
            .filter(|&la| Some(la) != own)
            .filter_map(|la| {
                let port = state
                    .devices
                    .get(la)
                    .and_then(|r| r.physical_address)
                    .and_then(|pa| state.topology.port_for(pa));
                state.devices.summary(la, port)
            })
            .collect()
    }

    /// Attributes of the current active source, defaults when there is none
    pub fn get_active_source(&self) -> ActiveSourceInfo {
        let state = self.inner.state.lock();
        let Some(la) = state.active_source else {
            return ActiveSourceInfo::default();
        };
        let Some(own) = state.our_logical else {
            return ActiveSourceInfo::default();
        };

        if la == own.value() {
            return ActiveSourceInfo {
                available: true,
                logical_address: la,
                physical_address: state.our_physical.to_string(),
                device_type: self.inner.device_type.to_string(),
                osd_name: state.osd_name.clone(),
                vendor_id: state.vendor_id.to_string(),
                power_status: "On".to_string(),
                port: "TV".to_string(),
                ..ActiveSourceInfo::default()
            };
        }

        let port = state
            .devices
            .get(la)
            .and_then(|r| r.physical_address)
            .and_then(|pa| state.topology.port_for(pa));
        match state.devices.summary(la, port) {
            Some(summary) => ActiveSourceInfo {
                available: true,
                logical_address: la,
                physical_address: summary.physical_address.unwrap_or_default(),
                device_type: summary.device_type.unwrap_or_default(),
                cec_version: summary.cec_version.unwrap_or_default(),
                osd_name: summary.osd_name.unwrap_or_default(),
                vendor_id: summary.vendor_id.unwrap_or_default(),
                power_status: summary.power_status.unwrap_or_default(),
                port: port.map(|p| format!("HDMI{}", p)).unwrap_or_default(),
            },
            None => ActiveSourceInfo::default(),
        }
    }

    /// Claim the active source role for the sink itself and announce it
    pub fn set_active_source(&self) -> bool {
        let physical = {
            let mut state = self.inner.state.lock();
            let Some(own) = state.our_logical else {
                return false;
            };
            for (_, record) in state.devices.iter_mut() {
                record.is_active_source = false;
            }
            state.active_source = Some(own.value());
            let pa = state.our_physical;
            state.active_source_pa = Some(pa);
            pa
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .broadcast(CecMessage::ActiveSource {
                    physical_address: physical,
                })
                .await;
        });
        true
    }

    /// Point the stream path at a physical address ("1.0.0.0")
    pub fn set_active_path(&self, path: &str) -> bool {
        let Some(pa) = PhysicalAddress::parse(path) else {
            return false;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .broadcast(CecMessage::SetStreamPath {
                    physical_address: pa,
                })
                .await;
        });
        true
    }

    /// Announce a route change between two of our ports ("HDMI1" -> "HDMI2")
    pub fn set_routing_change(&self, from_port: &str, to_port: &str) -> bool {
        let parse = |s: &str| -> Option<PhysicalAddress> {
            if s.eq_ignore_ascii_case("TV") {
                return Some(PhysicalAddress::new(0, 0, 0, 0));
            }
            let n: u8 = s.trim_start_matches("HDMI").parse().ok()?;
            (n >= 1 && n <= 15).then(|| PhysicalAddress::new(n, 0, 0, 0))
        };
        let (Some(from), Some(to)) = (parse(from_port), parse(to_port)) else {
            return false;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .broadcast(CecMessage::RoutingChange { from, to })
                .await;
        });
        true
    }

    /// Ordered route from the active source back to this sink
    pub fn get_active_route(&self) -> ActiveRoute {
        let state = self.inner.state.lock();
        let Some(pa) = state.active_source_pa else {
            return ActiveRoute::default();
        };
        let Some(active) = state.active_source else {
            return ActiveRoute::default();
        };
        if Some(active) == state.our_logical.map(|la| la.value()) {
            // We are the source; there is no HDMI route to speak of
            return ActiveRoute::default();
        }

        let hops = state.topology.route_for(pa);
        let mut path = Vec::new();
        for la in &hops {
            let port = state
                .devices
                .get(*la)
                .and_then(|r| r.physical_address)
                .and_then(|p| state.topology.port_for(p));
            if let Some(summary) = state.devices.summary(*la, port) {
                path.push(summary);
            }
        }
        let route = hops
            .iter()
            .map(|la| {
                state
                    .devices
                    .get(*la)
                    .and_then(|r| r.osd_name.clone())
                    .unwrap_or_else(|| format!("LA{}", la))
            })
            .collect::<Vec<_>>()
            .join("-->");

        ActiveRoute {
            available: !hops.is_empty(),
            length: hops.len() as u8,
            path,
            route,
        }
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Master enable. Disabling stops handling frames; enabling re-runs
    /// address allocation.
    pub async fn set_enabled(&self, enabled: bool) -> bool {
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.enabled != enabled;
            state.enabled = enabled;
            if !enabled {
                state.our_logical = None;
            }
            changed
        };
        if changed {
            info!("CEC engine {}", if enabled { "enabled" } else { "disabled" });
            self.inner.persist_settings();
            if enabled {
                self.inner.allocate_and_announce().await;
            }
        }
        true
    }

    pub fn get_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn set_otp_enabled(&self, enabled: bool) -> bool {
        self.inner.state.lock().otp_enabled = enabled;
        self.inner.persist_settings();
        true
    }

    pub fn get_otp_enabled(&self) -> bool {
        self.inner.state.lock().otp_enabled
    }

    /// Set and persist the OSD name; devices pick it up on their next query
    pub fn set_osd_name(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.inner.state.lock().osd_name = name.to_string();
        self.inner.persist_settings();
        true
    }

    pub fn get_osd_name(&self) -> String {
        self.inner.state.lock().osd_name.clone()
    }

    /// Set and persist the vendor OUI, announced on the next query
    pub fn set_vendor_id(&self, vendor_id: &str) -> bool {
        let Some(parsed) = VendorId::parse(vendor_id) else {
            return false;
        };
        self.inner.state.lock().vendor_id = parsed;
        self.inner.persist_settings();
        true
    }

    pub fn get_vendor_id(&self) -> String {
        self.inner.state.lock().vendor_id.to_string()
    }

    /// Menu language served in Set Menu Language replies (ISO 639-2)
    pub fn set_menu_language(&self, language: &str) -> bool {
        if language.len() != 3 {
            return false;
        }
        self.inner.state.lock().language = language.to_string();
        true
    }

    // ------------------------------------------------------------------
    // ARC / audio
    // ------------------------------------------------------------------

    /// Enable or disable ARC routing; kicks the matching handshake
    pub fn setup_arc_routing(&self, enabled: bool) -> bool {
        self.inner.arc.enabled.store(enabled, Ordering::SeqCst);
        self.inner.arc.request(if enabled {
            ArcCommand::Initiate
        } else {
            ArcCommand::Terminate
        });
        true
    }

    /// Ask the amplifier for its supported short audio descriptors
    pub fn request_short_audio_descriptor(&self) -> bool {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .send_to(
                    LogicalAddress::AUDIO_SYSTEM,
                    CecMessage::RequestShortAudioDescriptor {
                        descriptors: Vec::new(),
                    },
                )
                .await;
        });
        true
    }

    /// Query the amplifier's mute/volume state
    pub fn send_get_audio_status_message(&self) -> bool {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .send_to(LogicalAddress::AUDIO_SYSTEM, CecMessage::GiveAudioStatus)
                .await;
        });
        true
    }

    /// Wake the audio device via the key queue (Power On function)
    pub fn send_audio_device_power_on(&self) -> bool {
        const POWER_ON_FUNCTION: u32 = 0x6D;
        let audio = LogicalAddress::AUDIO_SYSTEM.value() as u32;
        self.enqueue_key(audio, KeyAction::Press { key_code: POWER_ON_FUNCTION });
        self.enqueue_key(audio, KeyAction::Release);
        true
    }

    /// Ask the audio device for its power status; the answer surfaces as an
    /// [`EngineEvent::AudioDevicePowerStatus`]
    pub fn request_audio_device_power_status(&self) -> bool {
        self.inner.state.lock().audio_power_status_requested = true;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .send_to(
                    LogicalAddress::AUDIO_SYSTEM,
                    CecMessage::GiveDevicePowerStatus,
                )
                .await;
        });
        true
    }

    pub fn get_audio_device_connected_status(&self) -> bool {
        self.inner.state.lock().audio_device_connected
    }

    /// Latest cached audio status, if any was reported
    pub fn get_audio_status(&self) -> Option<(bool, u8)> {
        self.inner.state.lock().audio_status
    }

    // ------------------------------------------------------------------
    // Broadcast operations
    // ------------------------------------------------------------------

    /// Broadcast a Request Active Source
    pub fn request_active_source(&self) -> bool {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.broadcast(CecMessage::RequestActiveSource).await;
        });
        true
    }

    /// Broadcast a Standby
    pub fn send_standby_message(&self) -> bool {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.broadcast(CecMessage::Standby).await;
        });
        true
    }

    // ------------------------------------------------------------------
    // Key events
    // ------------------------------------------------------------------

    fn enqueue_key(&self, logical_address: u32, action: KeyAction) {
        let _ = self.inner.key_tx.send(KeyEntry {
            logical_address,
            action,
        });
    }

    /// Queue a User Control Pressed. Out-of-range addresses and key codes
    /// are accepted and dropped by the worker; the call still succeeds.
    pub fn send_user_control_pressed(&self, logical_address: u32, key_code: u32) -> bool {
        self.enqueue_key(logical_address, KeyAction::Press { key_code });
        true
    }

    /// Queue a User Control Released; same permissive contract as presses
    pub fn send_user_control_released(&self, logical_address: u32) -> bool {
        self.enqueue_key(logical_address, KeyAction::Release);
        true
    }

    /// Alias kept for the RPC surface; identical queue and contract
    pub fn send_key_press_event(&self, logical_address: u32, key_code: u32) -> bool {
        self.send_user_control_pressed(logical_address, key_code)
    }

    pub fn send_key_release_event(&self, logical_address: u32) -> bool {
        self.send_user_control_released(logical_address)
    }

    // ------------------------------------------------------------------
    // Latency / hotplug
    // ------------------------------------------------------------------

    /// Update the values served in Report Current Latency replies.
    /// Inputs are numeric strings, mirroring the RPC contract.
    pub fn set_latency_info(
        &self,
        video_latency: &str,
        low_latency_mode: &str,
        audio_output_compensated: &str,
        audio_output_delay: &str,
    ) -> bool {
        let (Ok(video), Ok(low), Ok(compensated), Ok(delay)) = (
            video_latency.parse::<u8>(),
            low_latency_mode.parse::<u8>(),
            audio_output_compensated.parse::<u8>(),
            audio_output_delay.parse::<u8>(),
        ) else {
            return false;
        };
        let mut state = self.inner.state.lock();
        state.latency = LatencyInfo {
            video_latency: video,
            // Flags byte: low-latency mode in bit 2, compensation mode in bits 0-1
            latency_flags: ((low & 0x01) << 2) | (compensated & 0x03),
            audio_output_delay: delay,
        };
        true
    }

    /// Hot-plug notification from the platform: port connectivity changed
    pub fn on_hotplug(&self, port_id: u8, connected: bool) {
        info!(
            "hotplug: port {} {}",
            port_id,
            if connected { "connected" } else { "disconnected" }
        );
        self.inner.state.lock().topology.set_connected(port_id, connected);
        self.inner.poll_kick.notify_one();
    }

    /// Dump the registry to the log, the way field debugging likes it
    pub fn print_device_list(&self) -> bool {
        let summaries = self.get_device_list();
        info!("=== device list ({} devices) ===", summaries.len());
        for summary in &summaries {
            info!(
                "  LA {} [{}] name={} pa={} power={}",
                summary.logical_address,
                summary.device_type.as_deref().unwrap_or("?"),
                summary.osd_name.as_deref().unwrap_or("?"),
                summary.physical_address.as_deref().unwrap_or("?"),
                summary.power_status.as_deref().unwrap_or("?"),
            );
        }
        true
    }
}
