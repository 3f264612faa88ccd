//! Shared P2P protocol types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::P2pError;

/// Maximum SSID length in octets
pub const MAX_SSID_LEN: usize = 32;

/// Prefix every P2P group SSID starts with
pub const P2P_WILDCARD_SSID: &[u8] = b"DIRECT-";

/// Social channel frequencies in MHz (2.4 GHz channels 1, 6, 11)
pub const SOCIAL_FREQS_24: [u32; 3] = [2412, 2437, 2462];

/// 60 GHz social channel (class 180 channel 2)
pub const SOCIAL_FREQ_60: u32 = 58320 + 2160;

/// Handle into the interface table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IfaceId(pub usize);

/// Radio shared by one or more interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RadioId(pub u32);

/// 48-bit IEEE MAC address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || P2pError::InvalidAddress(s.to_string());
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(out))
    }
}

/// SSID octets, at most [`MAX_SSID_LEN`] long
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Ssid(Vec<u8>);

impl Ssid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, P2pError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_SSID_LEN {
            return Err(P2pError::SsidTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `DIRECT-xy...`; the bare wildcard is what devices answer probes with
    pub fn is_p2p_group(&self) -> bool {
        self.0.len() >= P2P_WILDCARD_SSID.len() + 2 && self.0.starts_with(P2P_WILDCARD_SSID)
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ssid({})", self)
    }
}

/// WPS configuration methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WpsMethod {
    /// Push Button Configuration
    Pbc,
    /// PIN display (this device shows the PIN)
    DisplayPin(String),
    /// PIN keypad (user enters the peer's PIN here)
    KeypadPin(String),
    /// NFC connection handover
    Nfc,
}

/// WPS Config Methods bits used in Provision Discovery
pub mod config_methods {
    pub const DISPLAY: u16 = 0x0008;
    pub const PUSHBUTTON: u16 = 0x0080;
    pub const KEYPAD: u16 = 0x0100;
    pub const NFC_INTERFACE: u16 = 0x0040;
}

impl WpsMethod {
    /// Config method to request from the peer in Provision Discovery.
    ///
    /// The roles are mirrored: when we display a PIN the peer must use its keypad.
    pub fn pd_config_method(&self) -> u16 {
        match self {
            WpsMethod::Pbc => config_methods::PUSHBUTTON,
            WpsMethod::DisplayPin(_) => config_methods::KEYPAD,
            WpsMethod::KeypadPin(_) => config_methods::DISPLAY,
            WpsMethod::Nfc => config_methods::NFC_INTERFACE,
        }
    }

    pub fn pin(&self) -> Option<&str> {
        match self {
            WpsMethod::DisplayPin(pin) | WpsMethod::KeypadPin(pin) => Some(pin),
            _ => None,
        }
    }
}

/// Role this device plays in a P2P group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupRole {
    Go,
    Client,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Go => "GO",
            GroupRole::Client => "client",
        }
    }
}

/// Discovery scan flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryType {
    /// Social channels only
    Social,
    /// All supported channels
    Full,
    /// Social channels plus one hinted channel
    SocialPlusOne,
}

/// P2P attribute status codes (also used for invitation results)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum P2pStatus {
    Success,
    InformationCurrentlyUnavailable,
    IncompatibleParameters,
    LimitReached,
    InvalidParameters,
    UnableToAccommodateRequest,
    PreviousProtocolError,
    NoCommonChannels,
    UnknownP2PGroup,
    BothGoIntentOfFifteen,
    IncompatibleProvisioningMethod,
    RejectedByUser,
}

impl P2pStatus {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use P2pStatus::*;
        Some(match code {
            0 => Success,
            1 => InformationCurrentlyUnavailable,
            2 => IncompatibleParameters,
            3 => LimitReached,
            4 => InvalidParameters,
            5 => UnableToAccommodateRequest,
            6 => PreviousProtocolError,
            7 => NoCommonChannels,
            8 => UnknownP2PGroup,
            9 => BothGoIntentOfFifteen,
            10 => IncompatibleProvisioningMethod,
            11 => RejectedByUser,
            _ => return None,
        })
    }
}

/// Why a group was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupRemovalReason {
    Unknown,
    Silent,
    FormationFailed,
    Requested,
    IdleTimeout,
    Unavailable,
    GoEndingSession,
    PskFailure,
    FreqConflict,
}

impl GroupRemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRemovalReason::Unknown => "UNKNOWN",
            GroupRemovalReason::Silent => "SILENT",
            GroupRemovalReason::FormationFailed => "FORMATION_FAILED",
            GroupRemovalReason::Requested => "REQUESTED",
            GroupRemovalReason::IdleTimeout => "IDLE",
            GroupRemovalReason::Unavailable => "UNAVAILABLE",
            GroupRemovalReason::GoEndingSession => "GO_ENDING_SESSION",
            GroupRemovalReason::PskFailure => "PSK_FAILURE",
            GroupRemovalReason::FreqConflict => "FREQ_CONFLICT",
        }
    }
}

/// Device capability bitmap from the P2P Capability attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub service_discovery: bool,
    pub client_discoverability: bool,
    pub concurrent_operation: bool,
    pub infrastructure_managed: bool,
    pub device_limit: bool,
    pub invitation_procedure: bool,
}

impl DeviceCapability {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            service_discovery: bits & 0x01 != 0,
            client_discoverability: bits & 0x02 != 0,
            concurrent_operation: bits & 0x04 != 0,
            infrastructure_managed: bits & 0x08 != 0,
            device_limit: bits & 0x10 != 0,
            invitation_procedure: bits & 0x20 != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        (self.service_discovery as u8)
            | (self.client_discoverability as u8) << 1
            | (self.concurrent_operation as u8) << 2
            | (self.infrastructure_managed as u8) << 3
            | (self.device_limit as u8) << 4
            | (self.invitation_procedure as u8) << 5
    }
}

/// Group capability bitmap from the P2P Capability attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupCapability {
    pub group_owner: bool,
    pub persistent_group: bool,
    pub group_limit: bool,
    pub intra_bss_distribution: bool,
    pub cross_connection: bool,
    pub persistent_reconnect: bool,
    pub group_formation: bool,
}

impl GroupCapability {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            group_owner: bits & 0x01 != 0,
            persistent_group: bits & 0x02 != 0,
            group_limit: bits & 0x04 != 0,
            intra_bss_distribution: bits & 0x08 != 0,
            cross_connection: bits & 0x10 != 0,
            persistent_reconnect: bits & 0x20 != 0,
            group_formation: bits & 0x40 != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        (self.group_owner as u8)
            | (self.persistent_group as u8) << 1
            | (self.group_limit as u8) << 2
            | (self.intra_bss_distribution as u8) << 3
            | (self.cross_connection as u8) << 4
            | (self.persistent_reconnect as u8) << 5
            | (self.group_formation as u8) << 6
    }
}

/// Outcome of a GO Negotiation, delivered by the P2P protocol module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoNegResult {
    pub status: P2pStatus,
    pub role_go: bool,
    pub freq: u32,
    pub ssid: Ssid,
    pub passphrase: Option<String>,
    pub peer_device_addr: MacAddr,
    pub peer_interface_addr: MacAddr,
    pub wps_method: WpsMethod,
    pub persistent_group: bool,
    /// Peer's configuration timeout in units of 10 ms
    pub peer_config_timeout: u8,
}

/// Invitation request received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationRequest {
    pub sa: MacAddr,
    pub bssid: Option<MacAddr>,
    pub go_dev_addr: MacAddr,
    pub ssid: Ssid,
    pub persistent_group: bool,
    /// Frequency the inviting side wants to force, 0 if none
    pub force_freq: u32,
    /// Channels the inviter can operate on
    pub peer_channels: Vec<u32>,
    /// WPS device password id carried in the request (NFC handover)
    pub dev_pw_id: Option<u16>,
}

/// How this device answers an invitation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationDecision {
    pub status: P2pStatus,
    pub go: bool,
    pub group_bssid: Option<MacAddr>,
    pub force_freq: Option<u32>,
    pub pref_freq: Option<u32>,
}

/// Kind of invitation this device sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationType {
    /// Join an active group
    JoinActiveGroup,
    /// Reinvoke a persistent group
    ReinvokePersistentGroup,
}

/// One BSS entry from a scan
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanResult {
    pub bssid: MacAddr,
    pub freq: u32,
    pub level: i32,
    pub ssid: Ssid,
    /// IEs from the Probe Response (or the only frame received)
    pub ies: Vec<u8>,
    /// IEs from the last Beacon, empty if none
    pub beacon_ies: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_addr_parse_and_display() {
        let addr: MacAddr = "02:00:00:aa:bb:0c".parse().expect("valid address");
        assert_eq!(addr.0, [0x02, 0, 0, 0xaa, 0xbb, 0x0c]);
        assert_eq!(addr.to_string(), "02:00:00:aa:bb:0c");
        assert!("02:00:00".parse::<MacAddr>().is_err());
        assert!("02:00:00:aa:bb:0c:11".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_ssid_length_is_bounded() {
        assert!(Ssid::new(vec![b'a'; 32]).is_ok());
        assert_eq!(Ssid::new(vec![b'a'; 33]), Err(P2pError::SsidTooLong(33)));
        assert!(Ssid::new(&b"DIRECT-ab"[..]).expect("ssid").is_p2p_group());
        assert!(!Ssid::new(&b"DIRECT-"[..]).expect("ssid").is_p2p_group());
    }

    #[test]
    fn test_pd_config_method_mirrors_pin_role() {
        assert_eq!(
            WpsMethod::DisplayPin("12345670".into()).pd_config_method(),
            config_methods::KEYPAD
        );
        assert_eq!(
            WpsMethod::KeypadPin("12345670".into()).pd_config_method(),
            config_methods::DISPLAY
        );
        assert_eq!(WpsMethod::Pbc.pd_config_method(), config_methods::PUSHBUTTON);
    }

    #[test]
    fn test_status_codes() {
        for code in 0..=11u8 {
            assert_eq!(P2pStatus::from_code(code).map(|s| s.code()), Some(code));
        }
        assert_eq!(P2pStatus::from_code(12), None);
    }

    #[test]
    fn test_capability_bits() {
        let dev = DeviceCapability::from_bits(0x25);
        assert!(dev.service_discovery && dev.concurrent_operation && dev.invitation_procedure);
        assert_eq!(dev.bits(), 0x25);
        let grp = GroupCapability::from_bits(0x03);
        assert!(grp.group_owner && grp.persistent_group);
        assert_eq!(grp.bits(), 0x03);
    }
}
