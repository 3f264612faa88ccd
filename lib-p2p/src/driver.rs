//! Platform driver interface
//!
//! Everything the formation core asks of the radio, the P2P protocol module
//! and the AP/station layers goes through [`Driver`]. Results arrive back as
//! events fed into the context (`on_scan_results`, `on_go_neg_completed`,
//! `on_wps_success` and so on).

use serde::{Deserialize, Serialize};

use crate::config::MAX_SCAN_SSIDS;
use crate::error::{DriverError, P2pError, P2pResult};
use crate::types::{MacAddr, Ssid, WpsMethod};

/// Driver-side handle of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    P2pGo,
    P2pClient,
    /// Role not known yet; the interface is created before negotiation ends
    P2pGroup,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::P2pGo => "p2p-go",
            InterfaceKind::P2pClient => "p2p-client",
            InterfaceKind::P2pGroup => "p2p-group",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanParams {
    /// Frequencies to scan, empty for all
    pub freqs: Vec<u32>,
    /// SSIDs to probe for, empty entry for wildcard
    pub ssids: Vec<Ssid>,
    /// IEs appended to probe requests
    pub extra_ies: Vec<u8>,
    /// Only accept responses from this BSSID
    pub bssid: Option<MacAddr>,
    /// Use CCK rates only when false
    pub p2p_probe: bool,
}

impl ScanParams {
    pub fn validate(&self) -> P2pResult<()> {
        if self.ssids.len() > MAX_SCAN_SSIDS {
            return Err(P2pError::TooManySsids {
                count: self.ssids.len(),
                max: MAX_SCAN_SSIDS,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionFrame {
    pub freq: u32,
    pub dst: MacAddr,
    pub src: MacAddr,
    pub bssid: MacAddr,
    pub payload: Vec<u8>,
    /// How long to stay on channel for a response
    pub wait_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoNegRequest {
    pub peer: MacAddr,
    pub wps_method: WpsMethod,
    pub go_intent: u8,
    pub force_freq: Option<u32>,
    pub pref_freq: Option<u32>,
    pub persistent: bool,
    /// Interface address offered for the group
    pub own_interface_addr: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRequest {
    pub peer: MacAddr,
    pub role_go: bool,
    pub bssid: Option<MacAddr>,
    pub ssid: Ssid,
    pub go_dev_addr: MacAddr,
    pub force_freq: Option<u32>,
    pub pref_freq: Option<u32>,
    pub persistent: bool,
}

/// Association request issued when a join work item starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub handle: DriverHandle,
    pub bssid: MacAddr,
    pub ssid: Ssid,
    pub freq: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpsParams {
    pub method: WpsMethod,
    /// Address of the peer to provision, `None` for any
    pub peer: Option<MacAddr>,
    pub bssid: Option<MacAddr>,
    pub ssid: Ssid,
    pub freq: u32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct GoParams {
    pub ssid: Ssid,
    pub passphrase: String,
    pub freq: u32,
    pub persistent: bool,
}

impl std::fmt::Debug for GoParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoParams")
            .field("ssid", &self.ssid)
            .field("freq", &self.freq)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// Driver operations used by the formation core
pub trait Driver: Send {
    fn trigger_scan(&mut self, params: &ScanParams) -> Result<(), DriverError>;
    fn start_listen(&mut self, freq: u32, duration_ms: u32) -> Result<(), DriverError>;
    fn cancel_remain_on_channel(&mut self) -> Result<(), DriverError>;
    fn send_action_frame(&mut self, frame: &ActionFrame) -> Result<(), DriverError>;

    /// Create a virtual interface; returns its handle and interface address
    fn add_interface(&mut self, kind: InterfaceKind, name: &str) -> Result<(DriverHandle, MacAddr), DriverError>;
    fn remove_interface(&mut self, handle: DriverHandle) -> Result<(), DriverError>;

    fn go_neg_request(&mut self, req: &GoNegRequest) -> Result<(), DriverError>;
    fn prov_disc_request(&mut self, peer: MacAddr, config_methods: u16, join: bool) -> Result<(), DriverError>;
    fn invite(&mut self, req: &InviteRequest) -> Result<(), DriverError>;
    /// Queue an SD query toward `dst`, or every peer when `None`
    fn sd_request(&mut self, dst: Option<MacAddr>, tlvs: &[u8]) -> Result<(), DriverError>;

    fn associate(&mut self, params: &JoinParams) -> Result<(), DriverError>;
    fn start_wps_enrollee(&mut self, handle: DriverHandle, params: &WpsParams) -> Result<(), DriverError>;
    fn start_go(&mut self, handle: DriverHandle, params: &GoParams) -> Result<(), DriverError>;
    /// Open the GO's WPS registrar for `method`
    fn start_wps_registrar(&mut self, handle: DriverHandle, method: &WpsMethod, peer: Option<MacAddr>) -> Result<(), DriverError>;
    fn stop_go(&mut self, handle: DriverHandle) -> Result<(), DriverError>;
    fn deauthenticate(&mut self, handle: DriverHandle, reason: u16) -> Result<(), DriverError>;
    fn disassociate_sta(&mut self, handle: DriverHandle, sta: MacAddr, reason: u16) -> Result<(), DriverError>;
}

/// IEEE 802.11 reason code "deauthenticated because sending STA is leaving"
pub const REASON_DEAUTH_LEAVING: u16 = 3;
