//! P2P Error Types
//!
//! Lower layers (codec, scheduler, store) return the narrow error types
//! below. The group formation state machine folds them into [`P2pError`],
//! which is what callers of the produced surface see.

use thiserror::Error;

use crate::radio::{WorkId, WorkKind};
use crate::types::{IfaceId, MacAddr};

/// Decode failure inside the service discovery codec
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdDecodeError {
    /// Invalid label sequence, reserved label type or non-backward pointer
    #[error("Malformed DNS name or TLV")]
    Malformed,
    /// Expanded name does not fit the output limit
    #[error("Expanded DNS name exceeds buffer")]
    BufferTooSmall,
}

/// Specific reason a radio work admission or lookup failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkErrorKind {
    /// An item of a single-instance kind is already queued or started
    Busy { iface: IfaceId, kind: WorkKind },
    /// Per-radio queue is at capacity
    QueueFull { max: usize },
    /// No item with this id
    UnknownWork(WorkId),
    /// Radio was never registered or is already torn down
    UnknownRadio,
}

/// Error returned by the radio work scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Radio work rejected: {kind:?}")]
pub struct WorkError {
    pub kind: WorkErrorKind,
}

impl WorkError {
    pub fn new(kind: WorkErrorKind) -> Self {
        Self { kind }
    }

    pub fn busy(iface: IfaceId, kind: WorkKind) -> Self {
        Self::new(WorkErrorKind::Busy { iface, kind })
    }

    pub fn queue_full(max: usize) -> Self {
        Self::new(WorkErrorKind::QueueFull { max })
    }

    pub fn unknown_work(id: WorkId) -> Self {
        Self::new(WorkErrorKind::UnknownWork(id))
    }

    pub fn unknown_radio() -> Self {
        Self::new(WorkErrorKind::UnknownRadio)
    }
}

impl From<WorkErrorKind> for WorkError {
    fn from(kind: WorkErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Failure reported by the platform driver shim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Driver {op} failed: {reason}")]
pub struct DriverError {
    pub op: &'static str,
    pub reason: String,
}

impl DriverError {
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

/// Persistent configuration backend failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Persistent group {0} not found")]
    NotFound(u32),
    #[error("Config store backend failed: {0}")]
    Backend(String),
}

/// Channel selection failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Forced frequency is not in the P2P channel set
    #[error("Frequency {0} MHz is not supported for P2P")]
    Unsupported(u32),
    /// Every concurrent channel is taken and none can be shared
    #[error("No channel available under current concurrency limits")]
    NoChannelAvailable,
    /// Forced frequency is not in the negotiated channel intersection
    #[error("Frequency {0} MHz not in allowed channel intersection")]
    NotInIntersection(u32),
}

/// Error surfaced by the group formation core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum P2pError {
    #[error("P2P is disabled or not initialized")]
    Disabled,
    #[error("Unknown interface {0:?}")]
    UnknownInterface(IfaceId),
    #[error("Unknown peer {0}")]
    UnknownPeer(MacAddr),
    #[error("Interface {0:?} already has an operation in progress")]
    InProgress(IfaceId),
    #[error("No group formation in progress")]
    NothingToCancel,
    #[error("No active group on interface {0:?}")]
    NoActiveGroup(IfaceId),
    #[error("Unknown persistent group {0}")]
    UnknownPersistentGroup(u32),
    #[error("Invalid SSID length {0}")]
    SsidTooLong(usize),
    #[error("Too many SSIDs in scan request: {count} (max {max})")]
    TooManySsids { count: usize, max: usize },
    #[error("Invalid GO intent {0}")]
    InvalidGoIntent(u8),
    #[error("Missing peer address")]
    MissingPeer,
    #[error("Invalid MAC address {0:?}")]
    InvalidAddress(String),
    #[error("Unknown service discovery request {0}")]
    UnknownSdRequest(u64),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Work(#[from] WorkError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decode(#[from] SdDecodeError),
}

impl P2pError {
    /// Stable reason string for control-plane consumers
    pub fn reason_code(&self) -> &'static str {
        match self {
            P2pError::Disabled => "P2P_DISABLED",
            P2pError::UnknownInterface(_) => "UNKNOWN_INTERFACE",
            P2pError::UnknownPeer(_) => "UNKNOWN_PEER",
            P2pError::InProgress(_) => "BUSY",
            P2pError::NothingToCancel => "NOTHING_TO_CANCEL",
            P2pError::NoActiveGroup(_) => "NO_ACTIVE_GROUP",
            P2pError::UnknownPersistentGroup(_) => "UNKNOWN_GROUP",
            P2pError::SsidTooLong(_) => "SSID_TOO_LONG",
            P2pError::TooManySsids { .. } => "TOO_MANY_SSIDS",
            P2pError::InvalidGoIntent(_) => "INVALID_GO_INTENT",
            P2pError::MissingPeer => "MISSING_PEER",
            P2pError::InvalidAddress(_) => "INVALID_ADDRESS",
            P2pError::UnknownSdRequest(_) => "UNKNOWN_SD_REQUEST",
            P2pError::Channel(ChannelError::Unsupported(_)) => "FREQ_UNSUPPORTED",
            P2pError::Channel(ChannelError::NoChannelAvailable) => "NO_CHANNEL_AVAILABLE",
            P2pError::Channel(ChannelError::NotInIntersection(_)) => "FREQ_NOT_ALLOWED",
            P2pError::Work(e) => match e.kind {
                WorkErrorKind::Busy { .. } => "RADIO_BUSY",
                WorkErrorKind::QueueFull { .. } => "RADIO_QUEUE_FULL",
                WorkErrorKind::UnknownWork(_) => "UNKNOWN_WORK",
                WorkErrorKind::UnknownRadio => "UNKNOWN_RADIO",
            },
            P2pError::Driver(_) => "DRIVER_FAILURE",
            P2pError::Store(_) => "CONFIG_STORE_FAILURE",
            P2pError::Decode(SdDecodeError::Malformed) => "MALFORMED",
            P2pError::Decode(SdDecodeError::BufferTooSmall) => "BUFFER_TOO_SMALL",
        }
    }
}

pub type P2pResult<T> = std::result::Result<T, P2pError>;
