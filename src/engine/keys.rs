//! Key-event queue worker
//!
//! RPC callers enqueue presses and releases; a single worker drains the queue
//! strictly in order and puts the corresponding User Control frames on the
//! bus with the required inter-message spacing. Callers therefore never block
//! on bus timeouts, and press/release ordering holds even under concurrent
//! callers.

use super::EngineInner;
use crate::message::{keycode, CecMessage, LogicalAddress};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// What to put on the wire for one queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAction {
    Press { key_code: u32 },
    Release,
}

/// One queued user-control send
///
/// Fields are kept at RPC width on purpose: out-of-range values are accepted
/// at the API boundary and dropped here, which is the documented behavior.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyEntry {
    pub logical_address: u32,
    pub action: KeyAction,
}

pub(crate) async fn run(inner: Arc<EngineInner>, mut rx: mpsc::UnboundedReceiver<KeyEntry>) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!("key-event worker started");

    loop {
        let entry = tokio::select! {
            _ = shutdown.changed() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let Some(destination) = u8::try_from(entry.logical_address)
            .ok()
            .and_then(LogicalAddress::new)
        else {
            debug!(
                "key-event: dropping entry for out-of-range address {}",
                entry.logical_address
            );
            continue;
        };
        if destination.is_broadcast() {
            debug!("key-event: dropping entry addressed to broadcast");
            continue;
        }

        let message = match entry.action {
            KeyAction::Press { key_code } => match u8::try_from(key_code) {
                Ok(code) => CecMessage::UserControlPressed { key_code: code },
                Err(_) => {
                    debug!("key-event: dropping out-of-range key code {}", key_code);
                    continue;
                }
            },
            KeyAction::Release => CecMessage::UserControlReleased,
        };

        let initiator = inner
            .state
            .lock()
            .our_logical
            .unwrap_or(LogicalAddress::UNREGISTERED);
        let frame = message.to_frame(initiator, destination);
        trace!("key-event: sending {:?} to {}", entry.action, destination);

        match inner.bus.send(frame, inner.tunables.send_timeout()).await {
            Ok(status) if !status.is_acked() => {
                debug!("key-event: {} did not ack {:?}", destination, entry.action)
            }
            Err(e) => warn!("key-event: bus error sending to {}: {}", destination, e),
            Ok(_) => {}
        }

        // Volume and mute towards the amplifier change state we cache, so
        // chase the key with an audio status query.
        if destination == LogicalAddress::AUDIO_SYSTEM {
            if let KeyAction::Press { key_code } = entry.action {
                if key_code <= u8::MAX as u32 && keycode::is_audio_key(key_code as u8) {
                    let query = CecMessage::GiveAudioStatus.to_frame(initiator, destination);
                    if let Err(e) = inner.bus.send(query, inner.tunables.send_timeout()).await {
                        debug!("key-event: audio status query failed: {}", e);
                    }
                }
            }
        }

        // CEC wants breathing room between user-control frames
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(inner.tunables.key_spacing()) => {}
        }
    }

    debug!("key-event worker stopped");
}
