//! ARC (Audio Return Channel) state machine
//!
//! The TV drives the handshake: it sends Request ARC Initiation to the audio
//! system, which answers with Initiate ARC; the dispatcher acks that with
//! Report ARC Initiated and flips the state to `Initiated`. Termination
//! mirrors this. The worker here sequences outgoing requests and enforces the
//! start/stop timer; a request that sees no answer in time reverts to
//! `Terminated` exactly once.
//!
//! Wakeups coalesce: the pending-request slot holds at most the latest
//! command, and the `Notify` carries at most one permit, so a burst of
//! setup calls while a transition is in flight collapses into a single
//! wakeup for the newest request.

use super::EngineInner;
use crate::engine::events::EngineEvent;
use crate::message::{CecMessage, LogicalAddress};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// ARC session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcRoutingState {
    /// Request sent, waiting for the device's Initiate ARC
    RequestInitiation,
    /// ARC is up
    Initiated,
    /// Request sent, waiting for the device's Terminate ARC
    RequestTermination,
    /// ARC is down (also the failure landing state)
    Terminated,
    /// Engine teardown
    Exit,
}

impl ArcRoutingState {
    /// Where a timed-out request lands
    pub fn on_timeout(self) -> ArcRoutingState {
        match self {
            ArcRoutingState::RequestInitiation | ArcRoutingState::RequestTermination => {
                ArcRoutingState::Terminated
            }
            other => other,
        }
    }
}

/// Requests handed to the worker; later requests replace earlier ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArcCommand {
    Initiate,
    Terminate,
}

/// State shared between the worker, the dispatcher and the API
pub(crate) struct ArcShared {
    pub state: watch::Sender<ArcRoutingState>,
    pending: Mutex<Option<ArcCommand>>,
    wakeup: Notify,
    /// Whether ARC routing is administratively enabled (SetupARCRouting)
    pub enabled: AtomicBool,
}

impl ArcShared {
    pub fn new() -> Self {
        ArcShared {
            state: watch::channel(ArcRoutingState::Terminated).0,
            pending: Mutex::new(None),
            wakeup: Notify::new(),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> ArcRoutingState {
        *self.state.borrow()
    }

    /// Queue a transition request, replacing any not-yet-consumed one
    pub fn request(&self, command: ArcCommand) {
        *self.pending.lock() = Some(command);
        self.wakeup.notify_one();
    }

    fn take_pending(&self) -> Option<ArcCommand> {
        self.pending.lock().take()
    }
}

pub(crate) async fn run(inner: Arc<EngineInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!("arc worker started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.arc.wakeup.notified() => {}
        }

        let Some(command) = inner.arc.take_pending() else {
            continue;
        };

        match command {
            ArcCommand::Initiate => initiate(&inner).await,
            ArcCommand::Terminate => terminate(&inner).await,
        }
    }

    inner.arc.state.send_replace(ArcRoutingState::Exit);
    debug!("arc worker stopped");
}

/// Run one initiation exchange and wait out the start/stop timer
async fn initiate(inner: &Arc<EngineInner>) {
    if inner.arc.current() == ArcRoutingState::Initiated {
        debug!("arc: already initiated, ignoring request");
        return;
    }

    inner.arc.state.send_replace(ArcRoutingState::RequestInitiation);
    if !send_request(inner, CecMessage::RequestArcInitiation).await {
        revert_once(inner, ArcRoutingState::RequestInitiation, false);
        return;
    }

    if !await_state(inner, ArcRoutingState::Initiated).await {
        // Timer elapsed without Initiate ARC from the device
        revert_once(inner, ArcRoutingState::RequestInitiation, false);
    }
}

async fn terminate(inner: &Arc<EngineInner>) {
    if inner.arc.current() == ArcRoutingState::Terminated {
        debug!("arc: already terminated, ignoring request");
        return;
    }

    inner
        .arc
        .state
        .send_replace(ArcRoutingState::RequestTermination);
    if !send_request(inner, CecMessage::RequestArcTermination).await {
        revert_once(inner, ArcRoutingState::RequestTermination, true);
        return;
    }

    if !await_state(inner, ArcRoutingState::Terminated).await {
        revert_once(inner, ArcRoutingState::RequestTermination, true);
    }
}

/// Send one request frame to the audio system; true when it was acked
async fn send_request(inner: &Arc<EngineInner>, message: CecMessage) -> bool {
    let initiator = inner
        .state
        .lock()
        .our_logical
        .unwrap_or(LogicalAddress::UNREGISTERED);
    let frame = message.to_frame(initiator, LogicalAddress::AUDIO_SYSTEM);

    match inner.bus.send(frame, inner.tunables.send_timeout()).await {
        Ok(status) if status.is_acked() => true,
        Ok(_) => {
            debug!("arc: audio system did not ack the request");
            false
        }
        Err(e) => {
            warn!("arc: bus error sending request: {}", e);
            false
        }
    }
}

/// Wait until the dispatcher moves the state to `target`, bounded by the
/// start/stop timer. Returns false on timeout.
async fn await_state(inner: &Arc<EngineInner>, target: ArcRoutingState) -> bool {
    let mut rx = inner.arc.state.subscribe();
    let wait = async {
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::time::timeout(inner.tunables.arc_timeout(), wait)
        .await
        .is_ok()
}

/// Revert a timed-out/failed request to `Terminated`, emitting the failure
/// event only if we are the ones doing the revert (the dispatcher may have
/// completed the transition in the meantime).
fn revert_once(inner: &Arc<EngineInner>, expected: ArcRoutingState, was_termination: bool) {
    let reverted = inner.arc.state.send_if_modified(|state| {
        if *state == expected {
            *state = state.on_timeout();
            true
        } else {
            false
        }
    });
    if reverted {
        info!(
            "arc: {} request timed out, reverting to Terminated",
            if was_termination { "termination" } else { "initiation" }
        );
        let event = if was_termination {
            EngineEvent::ArcTermination { success: false }
        } else {
            EngineEvent::ArcInitiation { success: false }
        };
        let _ = inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_transitions_are_closed() {
        assert_eq!(
            ArcRoutingState::RequestInitiation.on_timeout(),
            ArcRoutingState::Terminated
        );
        assert_eq!(
            ArcRoutingState::RequestTermination.on_timeout(),
            ArcRoutingState::Terminated
        );
        assert_eq!(ArcRoutingState::Initiated.on_timeout(), ArcRoutingState::Initiated);
        assert_eq!(ArcRoutingState::Exit.on_timeout(), ArcRoutingState::Exit);
    }

    #[test]
    fn pending_requests_coalesce_to_latest() {
        let shared = ArcShared::new();
        shared.request(ArcCommand::Initiate);
        shared.request(ArcCommand::Terminate);
        assert_eq!(shared.take_pending(), Some(ArcCommand::Terminate));
        assert_eq!(shared.take_pending(), None);
    }
}
