//! Peer table and P2P IE parsing
//!
//! Peers are created or refreshed from scan results and expire after a
//! number of scan generations without being seen.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::channel::channel_to_freq;
use crate::types::{DeviceCapability, GroupCapability, MacAddr, ScanResult, Ssid};

/// Wi-Fi Alliance OUI and the P2P vendor IE type
pub const WFA_OUI: [u8; 3] = [0x50, 0x6f, 0x9a];
pub const P2P_IE_VENDOR_TYPE: u8 = 0x09;
const WLAN_EID_VENDOR_SPECIFIC: u8 = 221;

pub mod attr {
    pub const CAPABILITY: u8 = 2;
    pub const DEVICE_ID: u8 = 3;
    pub const GO_INTENT: u8 = 4;
    pub const LISTEN_CHANNEL: u8 = 6;
    pub const DEVICE_INFO: u8 = 13;
    pub const GROUP_ID: u8 = 15;
    pub const OPERATING_CHANNEL: u8 = 17;
}

/// WPS attribute type of the device name inside Device Info
const WPS_ATTR_DEV_NAME: u16 = 0x1011;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub addr: MacAddr,
    pub config_methods: u16,
    pub pri_dev_type: [u8; 8],
    pub name: String,
}

/// Attributes of interest from a (possibly fragmented) P2P IE
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct P2pIe {
    pub dev_capab: Option<DeviceCapability>,
    pub group_capab: Option<GroupCapability>,
    pub device_id: Option<MacAddr>,
    /// GO intent without the tie breaker bit
    pub go_intent: Option<u8>,
    pub device_info: Option<DeviceInfo>,
    pub group_id: Option<(MacAddr, Ssid)>,
    pub oper_freq: Option<u32>,
    pub listen_freq: Option<u32>,
}

impl P2pIe {
    /// P2P Device Address the IE speaks for
    pub fn device_addr(&self) -> Option<MacAddr> {
        self.device_info
            .as_ref()
            .map(|d| d.addr)
            .or(self.device_id)
            .or(self.group_id.as_ref().map(|(addr, _)| *addr))
    }
}

/// Concatenate the payloads of every P2P vendor IE in `ies`.
/// Returns `None` when no P2P IE is present.
pub fn p2p_ie_payload(ies: &[u8]) -> Option<Vec<u8>> {
    let mut out: Option<Vec<u8>> = None;
    let mut pos = 0;
    while pos + 2 <= ies.len() {
        let id = ies[pos];
        let len = usize::from(ies[pos + 1]);
        let Some(body) = ies.get(pos + 2..pos + 2 + len) else {
            break;
        };
        if id == WLAN_EID_VENDOR_SPECIFIC
            && body.len() >= 4
            && body[..3] == WFA_OUI
            && body[3] == P2P_IE_VENDOR_TYPE
        {
            out.get_or_insert_with(Vec::new).extend_from_slice(&body[4..]);
        }
        pos += 2 + len;
    }
    out
}

fn mac_at(data: &[u8], offset: usize) -> Option<MacAddr> {
    let bytes: [u8; 6] = data.get(offset..offset + 6)?.try_into().ok()?;
    Some(MacAddr(bytes))
}

fn parse_device_info(data: &[u8]) -> Option<DeviceInfo> {
    let addr = mac_at(data, 0)?;
    let config_methods = u16::from_be_bytes([*data.get(6)?, *data.get(7)?]);
    let pri_dev_type: [u8; 8] = data.get(8..16)?.try_into().ok()?;
    let num_sec = usize::from(*data.get(16)?);
    let mut pos = 17 + num_sec * 8;
    let attr_type = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]);
    let attr_len = usize::from(u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]));
    pos += 4;
    let name = if attr_type == WPS_ATTR_DEV_NAME {
        let raw = data.get(pos..pos + attr_len)?;
        String::from_utf8_lossy(raw)
            .chars()
            .filter(|c| !c.is_control())
            .collect()
    } else {
        String::new()
    };
    Some(DeviceInfo {
        addr,
        config_methods,
        pri_dev_type,
        name,
    })
}

fn parse_channel(data: &[u8]) -> Option<u32> {
    // country string (3) | operating class | channel
    channel_to_freq(*data.get(3)?, *data.get(4)?)
}

/// Parse the P2P attributes carried in `ies`.
///
/// A truncated attribute ends the walk; attributes parsed before it are kept.
pub fn parse_p2p_ie(ies: &[u8]) -> Option<P2pIe> {
    let payload = p2p_ie_payload(ies)?;
    let mut ie = P2pIe::default();
    let mut pos = 0;
    while pos + 3 <= payload.len() {
        let id = payload[pos];
        let len = usize::from(u16::from_le_bytes([payload[pos + 1], payload[pos + 2]]));
        pos += 3;
        let Some(data) = payload.get(pos..pos + len) else {
            debug!(id, len, "Truncated P2P attribute");
            break;
        };
        match id {
            attr::CAPABILITY if data.len() >= 2 => {
                ie.dev_capab = Some(DeviceCapability::from_bits(data[0]));
                ie.group_capab = Some(GroupCapability::from_bits(data[1]));
            }
            attr::DEVICE_ID => ie.device_id = mac_at(data, 0),
            attr::GO_INTENT if !data.is_empty() => ie.go_intent = Some(data[0] >> 1),
            attr::LISTEN_CHANNEL => ie.listen_freq = parse_channel(data),
            attr::DEVICE_INFO => ie.device_info = parse_device_info(data),
            attr::GROUP_ID => {
                if let Some(addr) = mac_at(data, 0) {
                    if let Ok(ssid) = Ssid::new(&data[6..]) {
                        ie.group_id = Some((addr, ssid));
                    }
                }
            }
            attr::OPERATING_CHANNEL => ie.oper_freq = parse_channel(data),
            _ => trace!(id, len, "Skipping P2P attribute"),
        }
        pos += len;
    }
    Some(ie)
}

/// Append one P2P attribute to `buf`.
///
/// Returns false and leaves `buf` untouched when `data` does not fit the
/// 16-bit length field.
pub fn push_attr(buf: &mut Vec<u8>, id: u8, data: &[u8]) -> bool {
    let Ok(len) = u16::try_from(data.len()) else {
        debug!(id, len = data.len(), "P2P attribute too long");
        return false;
    };
    buf.push(id);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    true
}

/// Wrap P2P attributes into one or more vendor IEs
pub fn build_p2p_ie(attrs: &[u8]) -> Vec<u8> {
    const MAX_BODY: usize = 255 - 4;
    let mut out = Vec::with_capacity(attrs.len() + 6);
    let mut chunks = attrs.chunks(MAX_BODY).peekable();
    if chunks.peek().is_none() {
        out.extend_from_slice(&[WLAN_EID_VENDOR_SPECIFIC, 4]);
        out.extend_from_slice(&WFA_OUI);
        out.push(P2P_IE_VENDOR_TYPE);
    }
    for chunk in chunks {
        out.push(WLAN_EID_VENDOR_SPECIFIC);
        out.push((chunk.len() + 4) as u8);
        out.extend_from_slice(&WFA_OUI);
        out.push(P2P_IE_VENDOR_TYPE);
        out.extend_from_slice(chunk);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub device_addr: MacAddr,
    /// Interface address when the peer runs a group, else the device address
    pub interface_addr: MacAddr,
    pub name: String,
    pub dev_capab: DeviceCapability,
    pub group_capab: GroupCapability,
    pub go_intent: Option<u8>,
    pub config_methods: u16,
    /// Operating frequency of the group the peer owns
    pub oper_freq: Option<u32>,
    pub listen_freq: Option<u32>,
    pub level: i32,
    pub last_seen: u64,
    /// Config method the peer accepted in the last Provision Discovery
    pub provisioned_method: Option<u16>,
    /// SSID of the group the peer owns
    pub group_ssid: Option<Ssid>,
}

impl Peer {
    pub fn new(device_addr: MacAddr, generation: u64) -> Self {
        Self {
            device_addr,
            interface_addr: device_addr,
            name: String::new(),
            dev_capab: DeviceCapability::default(),
            group_capab: GroupCapability::default(),
            go_intent: None,
            config_methods: 0,
            oper_freq: None,
            listen_freq: None,
            level: 0,
            last_seen: generation,
            provisioned_method: None,
            group_ssid: None,
        }
    }

    pub fn is_go(&self) -> bool {
        self.group_capab.group_owner
    }
}

#[derive(Debug)]
pub struct PeerTable {
    peers: BTreeMap<MacAddr, Peer>,
    generation: u64,
    expiry_generations: u64,
}

impl PeerTable {
    pub fn new(expiry_generations: u64) -> Self {
        debug!(expiry_generations, "Initializing peer table");
        Self {
            peers: BTreeMap::new(),
            generation: 0,
            expiry_generations,
        }
    }

    /// Start a new scan generation
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Create or refresh a peer from one BSS. Returns the device address and
    /// whether the peer is new.
    pub fn update_from_bss(&mut self, bss: &ScanResult, ie: &P2pIe) -> Option<(MacAddr, bool)> {
        let device_addr = ie.device_addr().unwrap_or(bss.bssid);
        if device_addr.is_zero() {
            return None;
        }
        let generation = self.generation;
        let is_new = !self.peers.contains_key(&device_addr);
        let peer = self
            .peers
            .entry(device_addr)
            .or_insert_with(|| Peer::new(device_addr, generation));

        peer.last_seen = generation;
        peer.level = bss.level;
        if let Some(dev) = ie.dev_capab {
            peer.dev_capab = dev;
        }
        if let Some(grp) = ie.group_capab {
            peer.group_capab = grp;
        }
        if let Some(info) = &ie.device_info {
            peer.config_methods = info.config_methods;
            if !info.name.is_empty() {
                peer.name = info.name.clone();
            }
        }
        if ie.go_intent.is_some() {
            peer.go_intent = ie.go_intent;
        }
        if ie.listen_freq.is_some() {
            peer.listen_freq = ie.listen_freq;
        }
        if bss.ssid.is_p2p_group() {
            peer.interface_addr = bss.bssid;
            peer.oper_freq = Some(bss.freq);
            peer.group_ssid = Some(bss.ssid.clone());
        } else if ie.oper_freq.is_some() {
            peer.oper_freq = ie.oper_freq;
        }
        if is_new {
            debug!(peer = %device_addr, name = %peer.name, "New P2P peer");
        }
        Some((device_addr, is_new))
    }

    /// Drop peers not seen for the configured number of generations
    pub fn expire(&mut self) -> Vec<MacAddr> {
        let cutoff = self.generation.saturating_sub(self.expiry_generations);
        let stale: Vec<MacAddr> = self
            .peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.device_addr)
            .collect();
        for addr in &stale {
            debug!(peer = %addr, "Expiring P2P peer");
            self.peers.remove(addr);
        }
        stale
    }

    pub fn get(&self, addr: &MacAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Look up by device or interface address
    pub fn find(&self, addr: &MacAddr) -> Option<&Peer> {
        self.peers
            .get(addr)
            .or_else(|| self.peers.values().find(|p| p.interface_addr == *addr))
    }

    /// Peer whose group interface is `addr`
    pub fn by_interface_addr(&self, addr: &MacAddr) -> Option<&Peer> {
        self.peers.values().find(|p| p.interface_addr == *addr)
    }

    pub fn set_provisioned(&mut self, addr: &MacAddr, config_methods: u16) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.provisioned_method = Some(config_methods);
        }
    }

    /// Insert a peer learned outside of scanning (e.g. from an incoming frame)
    pub fn insert(&mut self, mut peer: Peer) {
        peer.last_seen = self.generation;
        self.peers.insert(peer.device_addr, peer);
    }

    pub fn remove(&mut self, addr: &MacAddr) -> Option<Peer> {
        self.peers.remove(addr)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
}
