//! Notification sink
//!
//! Fire-and-forget events toward the control plane. The core never waits on
//! a sink and never learns whether anyone listened.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{GroupRemovalReason, GroupRole, IfaceId, MacAddr, P2pStatus, Ssid};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum P2pEvent {
    DeviceFound {
        addr: MacAddr,
        name: String,
        go_intent: Option<u8>,
    },
    DeviceLost {
        addr: MacAddr,
    },
    FindStopped,
    GoNegRequest {
        src: MacAddr,
        dev_passwd_id: u16,
        go_intent: u8,
    },
    GoNegSuccess {
        peer: MacAddr,
        role: GroupRole,
        freq: u32,
    },
    GoNegFailure {
        peer: MacAddr,
        status: P2pStatus,
    },
    GroupFormationSuccess {
        iface: IfaceId,
    },
    GroupFormationFailure {
        iface: IfaceId,
        reason: String,
    },
    GroupStarted {
        iface: IfaceId,
        ifname: String,
        role: GroupRole,
        ssid: Ssid,
        freq: u32,
        go_dev_addr: MacAddr,
        persistent_id: Option<u32>,
    },
    GroupRemoved {
        iface: IfaceId,
        ifname: String,
        role: GroupRole,
        reason: GroupRemovalReason,
    },
    ProvDiscRequest {
        peer: MacAddr,
        config_methods: u16,
    },
    ProvDiscResponse {
        peer: MacAddr,
        config_methods: u16,
    },
    ProvDiscFailure {
        peer: MacAddr,
        /// `None` when the peer never answered
        status: Option<P2pStatus>,
    },
    InvitationReceived {
        sa: MacAddr,
        go_dev_addr: MacAddr,
        bssid: Option<MacAddr>,
        persistent_id: Option<u32>,
        freq: Option<u32>,
    },
    InvitationResult {
        status: P2pStatus,
        bssid: Option<MacAddr>,
    },
    SdRequest {
        src: MacAddr,
        freq: u32,
        dialog_token: u8,
        update_indic: u16,
        tlvs: Vec<u8>,
    },
    SdResponse {
        src: MacAddr,
        update_indic: u16,
        tlvs: Vec<u8>,
    },
    StaConnected {
        iface: IfaceId,
        peer: MacAddr,
    },
    StaDisconnected {
        iface: IfaceId,
        peer: MacAddr,
    },
    PersistentGroupAdded {
        id: u32,
    },
    PersistentGroupRemoved {
        id: u32,
    },
}

impl P2pEvent {
    /// Control-interface style event name
    pub fn name(&self) -> &'static str {
        match self {
            P2pEvent::DeviceFound { .. } => "P2P-DEVICE-FOUND",
            P2pEvent::DeviceLost { .. } => "P2P-DEVICE-LOST",
            P2pEvent::FindStopped => "P2P-FIND-STOPPED",
            P2pEvent::GoNegRequest { .. } => "P2P-GO-NEG-REQUEST",
            P2pEvent::GoNegSuccess { .. } => "P2P-GO-NEG-SUCCESS",
            P2pEvent::GoNegFailure { .. } => "P2P-GO-NEG-FAILURE",
            P2pEvent::GroupFormationSuccess { .. } => "P2P-GROUP-FORMATION-SUCCESS",
            P2pEvent::GroupFormationFailure { .. } => "P2P-GROUP-FORMATION-FAILURE",
            P2pEvent::GroupStarted { .. } => "P2P-GROUP-STARTED",
            P2pEvent::GroupRemoved { .. } => "P2P-GROUP-REMOVED",
            P2pEvent::ProvDiscRequest { .. } => "P2P-PROV-DISC-REQUEST",
            P2pEvent::ProvDiscResponse { .. } => "P2P-PROV-DISC-RESPONSE",
            P2pEvent::ProvDiscFailure { .. } => "P2P-PROV-DISC-FAILURE",
            P2pEvent::InvitationReceived { .. } => "P2P-INVITATION-RECEIVED",
            P2pEvent::InvitationResult { .. } => "P2P-INVITATION-RESULT",
            P2pEvent::SdRequest { .. } => "P2P-SERV-DISC-REQ",
            P2pEvent::SdResponse { .. } => "P2P-SERV-DISC-RESP",
            P2pEvent::StaConnected { .. } => "AP-STA-CONNECTED",
            P2pEvent::StaDisconnected { .. } => "AP-STA-DISCONNECTED",
            P2pEvent::PersistentGroupAdded { .. } => "PERSISTENT-GROUP-ADDED",
            P2pEvent::PersistentGroupRemoved { .. } => "PERSISTENT-GROUP-REMOVED",
        }
    }
}

pub trait NotificationSink: Send {
    fn notify(&self, event: P2pEvent);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, event: P2pEvent) {
        trace!(event = event.name(), "Dropping P2P event");
    }
}

/// Sink forwarding events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<P2pEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<P2pEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: P2pEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "No event listener");
        }
    }
}
