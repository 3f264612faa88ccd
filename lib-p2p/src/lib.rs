//! Wi-Fi Direct (P2P) group formation core
//!
//! This package drives the control-plane side of Wi-Fi Direct on top of a
//! platform driver:
//!
//! - Group formation by GO Negotiation, join of a running group, or
//!   autonomous and persistent GO start
//! - Per-radio work scheduling for scans, listen periods, action frames and joins
//! - Operating channel selection under multi-channel concurrency limits
//! - Persistent group bookkeeping with bounded client and PSK lists
//! - Service discovery TLV codec and a local Bonjour/UPnP/WFD responder
//!
//! [`P2pContext`] is the synchronous core; [`P2pService`] runs it on a tokio task.

pub mod channel;
pub mod config;
pub mod context;
pub mod driver;
pub mod eloop;
pub mod error;
pub mod formation;
pub mod notify;
pub mod peer;
pub mod persistent;
pub mod radio;
pub mod scan;
pub mod sd;
pub mod service;
pub mod types;

pub use crate::types::*;

pub use crate::channel::{ChannelSelectionPolicy, ChannelSet, FreqPlan, RegClass, UsedFreq};
pub use crate::config::P2pConfig;
pub use crate::context::{
    ConnectRequest, DeviceInterface, DriverEvent, GroupTarget, Interface, InviteTarget,
    P2pContext, PdMode, DEVICE_IFACE,
};
pub use crate::driver::{
    ActionFrame, Driver, DriverHandle, GoNegRequest, GoParams, InterfaceKind, InviteRequest,
    JoinParams, ScanParams, WpsParams,
};
pub use crate::eloop::{TimerKind, TimerQueue};
pub use crate::error::{ChannelError, DriverError, P2pError, P2pResult, StoreError, WorkError};
pub use crate::formation::{FormationState, GroupFormationContext};
pub use crate::notify::{ChannelSink, NotificationSink, NullSink, P2pEvent};
pub use crate::persistent::{ConfigStore, Credential, MemoryConfigStore, PersistentGroupRecord};
pub use crate::radio::{RadioWorkScheduler, WorkKind, WorkPayload};
pub use crate::sd::{ServiceRegistry, SdProtocol, SdStatus};
pub use crate::service::P2pService;
