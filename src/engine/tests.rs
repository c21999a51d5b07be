//! Tests for the sink engine

use super::*;
use crate::config::AppConfig;
use crate::message::{opcode, CecFrame, CecMessage, DeviceType, PhysicalAddress};
use crate::transport::sim::{SimBus, SimDevice};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn la(v: u8) -> LogicalAddress {
    LogicalAddress::new(v).unwrap()
}

fn test_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.settings_db = dir
        .path()
        .join("settings")
        .to_string_lossy()
        .into_owned();
    config.storage.settings_debounce_ms = 0;
    config.timing.poll_interval_ms = 25;
    config.timing.send_timeout_ms = 10;
    config.timing.request_timeout_ms = 50;
    config.timing.request_retries = 1;
    config.timing.arc_timeout_ms = 80;
    config.timing.key_spacing_ms = 1;
    config
}

async fn start_engine(bus: Arc<SimBus>) -> (CecSinkEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let engine = CecSinkEngine::start(config, bus).await.unwrap();
    (engine, dir)
}

/// Wait for a matching event, failing the test after `timeout`
async fn wait_for_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    timeout: Duration,
    mut matcher: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(timeout, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matcher(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    events
}

#[tokio::test]
async fn engine_claims_tv_address_on_startup() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;

    assert_eq!(engine.logical_address(), Some(0));
    // Claiming is followed by the physical address announcement
    let announced = bus.sent_with_opcode(opcode::REPORT_PHYSICAL_ADDRESS);
    assert_eq!(announced.len(), 1);
    assert!(announced[0].is_broadcast());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn report_physical_address_lands_in_device_list_once() {
    let bus = Arc::new(SimBus::new());
    // The device also acks polls, so the liveness cycle keeps it present
    bus.attach(SimDevice::playback(3, PhysicalAddress::new(1, 0, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    let report = CecMessage::ReportPhysicalAddress {
        physical_address: PhysicalAddress::new(1, 0, 0, 0),
        device_type: DeviceType::Tuner,
    }
    .to_frame(la(3), LogicalAddress::BROADCAST);
    bus.inject(report.clone());

    wait_for_event(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::DeviceAdded { logical_address: 3 })
    })
    .await;

    let list = engine.get_device_list();
    let entry = list
        .iter()
        .find(|d| d.logical_address == 3)
        .expect("device 3 listed");
    assert_eq!(entry.physical_address.as_deref(), Some("1.0.0.0"));
    assert_eq!(entry.port, Some(1));

    // The same announcement again must not produce a second added event
    bus.inject(report);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let repeats = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::DeviceAdded { logical_address: 3 }))
        .count();
    assert_eq!(repeats, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_address_claim_triggers_reallocation() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();
    assert_eq!(engine.logical_address(), Some(0));

    // A second TV appears at address 0: it starts acking polls there and
    // announces its own physical address from what used to be our identity
    bus.attach(SimDevice::playback(0, PhysicalAddress::new(0, 0, 0, 0)));
    bus.inject(
        CecMessage::ReportPhysicalAddress {
            physical_address: PhysicalAddress::new(2, 0, 0, 0),
            device_type: DeviceType::Tv,
        }
        .to_frame(la(0), LogicalAddress::BROADCAST),
    );

    // Address 0 now acks, so re-allocation lands on the Free Use fallback
    wait_for_event(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::AddressAllocated { logical_address: 14 })
    })
    .await;
    assert_eq!(engine.logical_address(), Some(14));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn absent_devices_never_appear_in_the_list() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;

    assert!(engine.get_device_list().is_empty());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn polling_discovers_and_cleans_up_devices() {
    let bus = Arc::new(SimBus::new());
    bus.attach(SimDevice::playback(4, PhysicalAddress::new(1, 0, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    wait_for_event(&mut rx, Duration::from_secs(2), |e| {
        matches!(e, EngineEvent::DeviceAdded { logical_address: 4 })
    })
    .await;

    // Pull the plug; the next poll pass misses the ack and Clean fires
    bus.detach(4);
    wait_for_event(&mut rx, Duration::from_secs(2), |e| {
        matches!(e, EngineEvent::DeviceRemoved { logical_address: 4 })
    })
    .await;

    assert!(engine
        .get_device_list()
        .iter()
        .all(|d| d.logical_address != 4));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn quiet_bus_produces_no_duplicate_notifications() {
    let bus = Arc::new(SimBus::new());
    bus.attach(SimDevice::playback(4, PhysicalAddress::new(1, 0, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    // Let discovery and the info requests run to completion
    wait_for_event(&mut rx, Duration::from_secs(2), |e| {
        matches!(e, EngineEvent::DeviceAdded { logical_address: 4 })
    })
    .await;
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let list = engine.get_device_list();
            if list
                .iter()
                .any(|d| d.logical_address == 4 && d.osd_name.is_some())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device info never completed");

    // Settle, then observe several full cycles of a quiet bus
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = engine.get_device_list();
    drain(&mut rx);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(drain(&mut rx), Vec::new());
    let after = engine.get_device_list();
    assert_eq!(before, after);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn arc_initiation_with_responsive_amplifier() {
    let bus = Arc::new(SimBus::new());
    bus.attach(SimDevice::audio_system(PhysicalAddress::new(1, 0, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    assert!(engine.setup_arc_routing(true));
    let event = wait_for_event(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::ArcInitiation { .. })
    })
    .await;
    assert_eq!(event, EngineEvent::ArcInitiation { success: true });
    assert_eq!(engine.arc_state(), ArcRoutingState::Initiated);

    // The handshake finishes with our Report ARC Initiated on the wire
    assert_eq!(bus.sent_with_opcode(opcode::REPORT_ARC_INITIATED).len(), 1);
    assert!(engine.get_audio_device_connected_status());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn arc_initiation_timeout_reverts_exactly_once() {
    let bus = Arc::new(SimBus::new());
    // Amplifier acks frames but never answers the handshake
    let mut deaf = SimDevice::audio_system(PhysicalAddress::new(1, 0, 0, 0));
    deaf.arc_capable = false;
    bus.attach(deaf);
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    assert!(engine.setup_arc_routing(true));
    let event = wait_for_event(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::ArcInitiation { .. })
    })
    .await;
    assert_eq!(event, EngineEvent::ArcInitiation { success: false });
    assert_eq!(engine.arc_state(), ArcRoutingState::Terminated);

    // No second revert event after another timer's worth of waiting
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(drain(&mut rx)
        .iter()
        .all(|e| !matches!(e, EngineEvent::ArcInitiation { .. })));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn arc_requests_coalesce_to_latest() {
    let bus = Arc::new(SimBus::new());
    bus.attach(SimDevice::audio_system(PhysicalAddress::new(1, 0, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    // Burst of toggles; the latest request decides where the session lands
    engine.setup_arc_routing(true);
    engine.setup_arc_routing(false);
    engine.setup_arc_routing(true);

    wait_for_event(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::ArcInitiation { success: true })
    })
    .await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while engine.arc_state() != ArcRoutingState::Initiated {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never settled on Initiated");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn key_press_precedes_release_across_tasks() {
    let bus = Arc::new(SimBus::new());
    bus.attach(SimDevice::playback(1, PhysicalAddress::new(1, 0, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let engine = Arc::new(engine);

    // Press is enqueued before release, from different tasks
    let press_engine = engine.clone();
    tokio::spawn(async move {
        press_engine.send_user_control_pressed(1, 65);
    })
    .await
    .unwrap();
    let release_engine = engine.clone();
    tokio::spawn(async move {
        release_engine.send_user_control_released(1);
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !bus.sent_with_opcode(opcode::USER_CONTROL_RELEASED).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("release never sent");

    let order: Vec<u8> = bus
        .sent_frames()
        .iter()
        .filter_map(|f| f.opcode())
        .filter(|op| {
            *op == opcode::USER_CONTROL_PRESSED || *op == opcode::USER_CONTROL_RELEASED
        })
        .collect();
    assert_eq!(
        order,
        vec![opcode::USER_CONTROL_PRESSED, opcode::USER_CONTROL_RELEASED]
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn out_of_range_key_inputs_succeed_and_send_nothing() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;

    // Address 16 does not exist on a 4-bit bus; the call still reports success
    assert!(engine.send_user_control_pressed(16, 1));
    assert!(engine.send_key_press_event(300, 70000));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent_with_opcode(opcode::USER_CONTROL_PRESSED).is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_directed_opcode_gets_feature_abort() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;

    bus.inject(CecFrame {
        initiator: la(4),
        destination: la(0),
        payload: vec![0x6B, 0x01],
    });

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !bus.sent_with_opcode(opcode::FEATURE_ABORT).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no feature abort reply");

    let aborts = bus.sent_with_opcode(opcode::FEATURE_ABORT);
    assert_eq!(aborts[0].destination, la(4));
    // Operands: offending opcode, then reason 0 (unrecognized)
    assert_eq!(aborts[0].operands(), &[0x6B, 0x00]);

    // Broadcast unknowns are dropped without a reply
    bus.clear_sent();
    bus.inject(CecFrame {
        initiator: la(4),
        destination: LogicalAddress::BROADCAST,
        payload: vec![0x6B],
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent_with_opcode(opcode::FEATURE_ABORT).is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn give_osd_name_is_answered_with_configured_name() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;
    assert!(engine.set_osd_name("Den TV"));

    bus.inject(CecMessage::GiveOsdName.to_frame(la(4), la(0)));

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !bus.sent_with_opcode(opcode::SET_OSD_NAME).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no OSD name reply");

    let replies = bus.sent_with_opcode(opcode::SET_OSD_NAME);
    assert_eq!(replies[0].operands(), b"Den TV");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn active_source_routes_through_device_chain() {
    let bus = Arc::new(SimBus::new());
    // Real devices on the bus so liveness polls keep acking
    bus.attach(SimDevice::audio_system(PhysicalAddress::new(1, 0, 0, 0)));
    bus.attach(SimDevice::playback(4, PhysicalAddress::new(1, 1, 0, 0)));
    let (engine, _dir) = start_engine(bus.clone()).await;
    let mut rx = engine.subscribe();

    // AVR directly on port 1, player behind it
    bus.inject(
        CecMessage::ReportPhysicalAddress {
            physical_address: PhysicalAddress::new(1, 0, 0, 0),
            device_type: DeviceType::AudioSystem,
        }
        .to_frame(la(5), LogicalAddress::BROADCAST),
    );
    bus.inject(
        CecMessage::ReportPhysicalAddress {
            physical_address: PhysicalAddress::new(1, 1, 0, 0),
            device_type: DeviceType::PlaybackDevice,
        }
        .to_frame(la(4), LogicalAddress::BROADCAST),
    );
    bus.inject(
        CecMessage::ActiveSource {
            physical_address: PhysicalAddress::new(1, 1, 0, 0),
        }
        .to_frame(la(4), LogicalAddress::BROADCAST),
    );

    let event = wait_for_event(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::ActiveSourceChanged { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::ActiveSourceChanged {
            logical_address: 4,
            physical_address: PhysicalAddress::new(1, 1, 0, 0),
        }
    );

    let route = engine.get_active_route();
    assert!(route.available);
    assert_eq!(route.length, 2);

    let source = engine.get_active_source();
    assert!(source.available);
    assert_eq!(source.logical_address, 4);
    assert_eq!(source.physical_address, "1.1.0.0");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_active_source_answered_only_when_we_hold_it() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;

    // Someone else is active: stay quiet
    bus.inject(CecMessage::RequestActiveSource.to_frame(la(4), LogicalAddress::BROADCAST));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent_with_opcode(opcode::ACTIVE_SOURCE).is_empty());

    // Claim it ourselves, then the same request draws the broadcast
    assert!(engine.set_active_source());
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.clear_sent();
    bus.inject(CecMessage::RequestActiveSource.to_frame(la(4), LogicalAddress::BROADCAST));
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !bus.sent_with_opcode(opcode::ACTIVE_SOURCE).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no active source reply");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn latency_request_for_our_address_is_answered() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;
    assert!(engine.set_latency_info("20", "1", "0", "10"));

    bus.inject(
        CecMessage::RequestCurrentLatency {
            physical_address: PhysicalAddress::new(0, 0, 0, 0),
        }
        .to_frame(la(4), LogicalAddress::BROADCAST),
    );

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !bus.sent_with_opcode(opcode::REPORT_CURRENT_LATENCY).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no latency reply");

    let replies = bus.sent_with_opcode(opcode::REPORT_CURRENT_LATENCY);
    // PA(2) + video latency + flags (low-latency bit set) + audio delay
    assert_eq!(replies[0].operands(), &[0x00, 0x00, 20, 0x04, 10]);

    // A request for a different address stays unanswered
    bus.clear_sent();
    bus.inject(
        CecMessage::RequestCurrentLatency {
            physical_address: PhysicalAddress::new(2, 0, 0, 0),
        }
        .to_frame(la(4), LogicalAddress::BROADCAST),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent_with_opcode(opcode::REPORT_CURRENT_LATENCY).is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn settings_survive_engine_restart() {
    let bus = Arc::new(SimBus::new());
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let engine = CecSinkEngine::start(config.clone(), bus.clone()).await.unwrap();
    assert!(engine.set_osd_name("Basement TV"));
    assert!(engine.set_vendor_id("00D038"));
    engine.shutdown().await.unwrap();

    let bus = Arc::new(SimBus::new());
    let engine = CecSinkEngine::start(config, bus).await.unwrap();
    assert_eq!(engine.get_osd_name(), "Basement TV");
    assert_eq!(engine.get_vendor_id(), "00D038");
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn disabled_engine_ignores_inbound_frames() {
    let bus = Arc::new(SimBus::new());
    let (engine, _dir) = start_engine(bus.clone()).await;

    assert!(engine.set_enabled(false).await);
    bus.clear_sent();
    bus.inject(CecMessage::GiveOsdName.to_frame(la(4), la(0)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent_with_opcode(opcode::SET_OSD_NAME).is_empty());
    assert!(engine.get_device_list().is_empty());

    engine.shutdown().await.unwrap();
}
