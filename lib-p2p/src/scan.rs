//! Scan coordination
//!
//! Builds discovery and join scan requests, digests scan results into the
//! peer table and the BSS cache, and keeps the bounded retry state of a
//! pending join (or auto provision discovery) scan loop.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::P2pConfig;
use crate::driver::ScanParams;
use crate::peer::{attr, build_p2p_ie, parse_p2p_ie, push_attr, PeerTable};
use crate::types::{
    DeviceCapability, DiscoveryType, IfaceId, MacAddr, ScanResult, Ssid, WpsMethod,
    P2P_WILDCARD_SSID, SOCIAL_FREQS_24, SOCIAL_FREQ_60,
};

const WLAN_EID_VENDOR_SPECIFIC: u8 = 221;
const WPS_OUI_TYPE: [u8; 4] = [0x00, 0x50, 0xf2, 0x04];

mod wps_attr {
    pub const ASSOC_STATE: u16 = 0x1002;
    pub const CONFIG_METHODS: u16 = 0x1008;
    pub const DEV_NAME: u16 = 0x1011;
    pub const DEV_PASSWORD_ID: u16 = 0x1012;
    pub const REQUEST_TYPE: u16 = 0x103a;
    pub const VERSION: u16 = 0x104a;
    pub const REQ_DEV_TYPE: u16 = 0x106a;
}

/// Request type "enrollee, open 802.1X"
const WPS_REQ_ENROLLEE: u8 = 0x01;
const WPS_VERSION: u8 = 0x10;
const DEV_PW_DEFAULT: u16 = 0x0000;

/// Why a scan work item was queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPurpose {
    Discovery(DiscoveryType),
    /// Looking for a GO to join
    Join,
    /// Finding out whether a peer runs a group before provision discovery
    AutoPd,
}

/// Group the join scan is looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub iface_addr: MacAddr,
    pub dev_addr: MacAddr,
    pub ssid: Option<Ssid>,
    pub wps_method: WpsMethod,
    /// Fall back to GO Negotiation when the peer is not running a group
    pub auto_join: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Join,
    AutoPd { config_methods: u16 },
}

/// A pending join or auto-PD scan loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinScan {
    pub iface: IfaceId,
    pub target: JoinTarget,
    pub mode: JoinMode,
    /// Scans submitted so far, including failed submissions
    pub attempts: u32,
    pub auto_pd_retries: u32,
}

/// What the state machine should do after a join scan round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinScanOutcome {
    /// Target group located on `freq`
    Found { bssid: MacAddr, ssid: Option<Ssid>, freq: u32 },
    /// Try again after the backoff
    Retry,
    /// Attempt limit reached
    GiveUp,
    /// Peer does not run a group; negotiate instead
    FallbackGoNeg,
    /// Auto-PD: peer seen but not as a GO yet, rescan its channel
    AutoPdRescan { freq: u32 },
    /// Auto-PD: send the Provision Discovery Request
    AutoPdSend { join: bool },
}

/// Whether the peer is running a group, as seen in the BSS cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerGo {
    NotFound,
    /// Present but not refreshed by the latest scan
    Stale,
    Running,
}

/// Peer table changes caused by one batch of scan results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanDigest {
    pub new_peers: Vec<MacAddr>,
    pub lost_peers: Vec<MacAddr>,
    pub bss_count: usize,
}

#[derive(Debug, Clone)]
struct BssEntry {
    result: ScanResult,
    p2p_dev_addr: Option<MacAddr>,
    update_idx: u64,
    /// Scans that covered this channel without reporting the BSS
    scan_miss_count: u32,
}

#[derive(Debug)]
pub struct ScanCoordinator {
    device_name: String,
    listen_channel: u8,
    config_methods: u16,
    dev_capab: DeviceCapability,
    support_60ghz: bool,
    max_join_attempts: u32,
    max_auto_pd_retries: u32,
    bss_expiry_scans: u32,
    bss: BTreeMap<MacAddr, BssEntry>,
    update_idx: u64,
    join: Option<JoinScan>,
    req_dev_types: Vec<[u8; 8]>,
}

impl ScanCoordinator {
    pub fn new(config: &P2pConfig) -> Self {
        debug!(
            max_join_attempts = config.max_join_scan_attempts,
            max_auto_pd_retries = config.auto_pd_scan_attempts,
            "Initializing scan coordinator"
        );
        Self {
            device_name: config.device_name.clone(),
            listen_channel: config.listen_channel,
            config_methods: crate::types::config_methods::DISPLAY
                | crate::types::config_methods::PUSHBUTTON
                | crate::types::config_methods::KEYPAD,
            dev_capab: DeviceCapability {
                service_discovery: true,
                concurrent_operation: true,
                invitation_procedure: true,
                ..DeviceCapability::default()
            },
            support_60ghz: config.support_60ghz,
            max_join_attempts: config.max_join_scan_attempts,
            max_auto_pd_retries: config.auto_pd_scan_attempts,
            bss_expiry_scans: config.bss_expiry_scans,
            bss: BTreeMap::new(),
            update_idx: 0,
            join: None,
            req_dev_types: Vec::new(),
        }
    }

    /// Requested device types advertised during the current find
    pub fn set_req_dev_types(&mut self, types: Vec<[u8; 8]>) {
        self.req_dev_types = types;
    }

    /// WPS IE for P2P probe requests
    fn wps_probe_ie(&self) -> Vec<u8> {
        let mut body = WPS_OUI_TYPE.to_vec();
        let mut put = |ty: u16, data: &[u8]| {
            body.extend_from_slice(&ty.to_be_bytes());
            body.extend_from_slice(&(data.len() as u16).to_be_bytes());
            body.extend_from_slice(data);
        };
        put(wps_attr::VERSION, &[WPS_VERSION]);
        put(wps_attr::REQUEST_TYPE, &[WPS_REQ_ENROLLEE]);
        put(wps_attr::CONFIG_METHODS, &self.config_methods.to_be_bytes());
        put(wps_attr::ASSOC_STATE, &0u16.to_be_bytes());
        put(wps_attr::DEV_PASSWORD_ID, &DEV_PW_DEFAULT.to_be_bytes());
        put(wps_attr::DEV_NAME, self.device_name.as_bytes());
        for dev_type in &self.req_dev_types {
            put(wps_attr::REQ_DEV_TYPE, dev_type);
        }

        let mut ie = Vec::with_capacity(body.len() + 4);
        for chunk in body.chunks(255) {
            ie.push(WLAN_EID_VENDOR_SPECIFIC);
            ie.push(chunk.len() as u8);
            ie.extend_from_slice(chunk);
        }
        ie
    }

    /// WPS and P2P IEs appended to every P2P probe request
    pub fn probe_ies(&self) -> Vec<u8> {
        let mut attrs = Vec::new();
        push_attr(&mut attrs, attr::CAPABILITY, &[self.dev_capab.bits(), 0]);
        push_attr(
            &mut attrs,
            attr::LISTEN_CHANNEL,
            &[b'X', b'X', 0x04, 81, self.listen_channel],
        );
        let mut ies = self.wps_probe_ie();
        ies.extend(build_p2p_ie(&attrs));
        ies
    }

    fn wildcard_ssid() -> Ssid {
        Ssid::new(P2P_WILDCARD_SSID).unwrap_or_default()
    }

    /// Scan request for one round of device discovery.
    ///
    /// `channel_hint` is the extra frequency of a social-plus-one scan.
    pub fn discovery_params(&self, kind: DiscoveryType, channel_hint: Option<u32>) -> ScanParams {
        let mut freqs = Vec::new();
        match kind {
            DiscoveryType::Full => {}
            DiscoveryType::Social | DiscoveryType::SocialPlusOne => {
                freqs.extend_from_slice(&SOCIAL_FREQS_24);
                if self.support_60ghz {
                    freqs.push(SOCIAL_FREQ_60);
                }
                if kind == DiscoveryType::SocialPlusOne {
                    if let Some(hint) = channel_hint.filter(|f| *f > 0 && !freqs.contains(f)) {
                        freqs.push(hint);
                    }
                }
            }
        }
        debug!(kind = ?kind, freqs = ?freqs, "Discovery scan parameters");
        ScanParams {
            freqs,
            ssids: vec![Self::wildcard_ssid()],
            extra_ies: self.probe_ies(),
            bssid: None,
            p2p_probe: true,
        }
    }

    /// Begin a join scan loop, resetting the attempt counters
    pub fn begin_join(&mut self, iface: IfaceId, target: JoinTarget, mode: JoinMode) {
        info!(
            iface = iface.0,
            go = %target.iface_addr,
            dev = %target.dev_addr,
            mode = ?mode,
            "Request to join existing group"
        );
        self.join = Some(JoinScan {
            iface,
            target,
            mode,
            attempts: 0,
            auto_pd_retries: 0,
        });
    }

    pub fn pending_join(&self) -> Option<&JoinScan> {
        self.join.as_ref()
    }

    pub fn take_join(&mut self) -> Option<JoinScan> {
        self.join.take()
    }

    /// Scan request for the next join attempt; counts the attempt.
    ///
    /// With no explicit frequency the GO's known operating frequency is used
    /// for a single channel scan.
    pub fn next_join_params(&mut self, freq: Option<u32>, peers: &PeerTable) -> Option<ScanParams> {
        let extra_ies = self.probe_ies();
        let join = self.join.as_mut()?;
        join.attempts += 1;
        debug!(attempt = join.attempts, "P2P: Join scan attempt");

        let freq = freq.filter(|f| *f > 0).or_else(|| {
            peers
                .by_interface_addr(&join.target.iface_addr)
                .and_then(|p| p.oper_freq)
        });
        let ssid = join.target.ssid.clone().unwrap_or_else(Self::wildcard_ssid);
        Some(ScanParams {
            freqs: freq.into_iter().collect(),
            ssids: vec![ssid],
            extra_ies,
            bssid: None,
            p2p_probe: true,
        })
    }

    /// Bookkeeping after a join scan could not be submitted or found nothing
    pub fn join_missed(&self) -> JoinScanOutcome {
        match &self.join {
            Some(join) if join.attempts < self.max_join_attempts => JoinScanOutcome::Retry,
            Some(join) => {
                info!(
                    attempts = join.attempts,
                    go = %join.target.iface_addr,
                    "Failed to find GO for join operation - stop join attempt"
                );
                JoinScanOutcome::GiveUp
            }
            None => JoinScanOutcome::GiveUp,
        }
    }

    /// Feed a batch of scan results into the BSS cache and the peer table.
    ///
    /// `scanned_freqs` are the channels the scan covered, empty for all of
    /// them. Only entries on covered channels age.
    pub fn on_scan_results(
        &mut self,
        results: &[ScanResult],
        scanned_freqs: &[u32],
        peers: &mut PeerTable,
    ) -> ScanDigest {
        self.update_idx += 1;
        peers.next_generation();
        let mut digest = ScanDigest {
            bss_count: results.len(),
            ..ScanDigest::default()
        };

        for bss in results {
            let ie = parse_p2p_ie(&bss.ies).or_else(|| {
                if bss.beacon_ies.is_empty() {
                    None
                } else {
                    debug!(bssid = %bss.bssid, "P2P IE missing from Probe Response, using Beacon");
                    parse_p2p_ie(&bss.beacon_ies)
                }
            });
            let p2p_dev_addr = match &ie {
                Some(ie) => match peers.update_from_bss(bss, ie) {
                    Some((addr, true)) => {
                        digest.new_peers.push(addr);
                        Some(addr)
                    }
                    Some((addr, false)) => Some(addr),
                    None => None,
                },
                None => None,
            };
            self.bss.insert(
                bss.bssid,
                BssEntry {
                    result: bss.clone(),
                    p2p_dev_addr,
                    update_idx: self.update_idx,
                    scan_miss_count: 0,
                },
            );
        }

        digest.lost_peers = peers.expire();
        let live: Vec<MacAddr> = peers.iter().map(|p| p.device_addr).collect();
        let (update_idx, expiry) = (self.update_idx, self.bss_expiry_scans);
        self.bss.retain(|bssid, e| {
            let covered = scanned_freqs.is_empty() || scanned_freqs.contains(&e.result.freq);
            if e.update_idx < update_idx && covered {
                e.scan_miss_count += 1;
            }
            if e.scan_miss_count >= expiry {
                debug!(bssid = %bssid, misses = e.scan_miss_count, "Expire BSS entry");
                return false;
            }
            e.p2p_dev_addr.map_or(true, |addr| live.contains(&addr))
        });
        debug!(
            bss = digest.bss_count,
            new = digest.new_peers.len(),
            lost = digest.lost_peers.len(),
            "Processed scan results"
        );
        digest
    }

    pub fn bss(&self, bssid: &MacAddr) -> Option<&ScanResult> {
        self.bss.get(bssid).map(|e| &e.result)
    }

    pub fn bss_count(&self) -> usize {
        self.bss.len()
    }

    fn bss_by_dev_addr(&self, dev_addr: &MacAddr) -> Option<&BssEntry> {
        self.bss
            .values()
            .filter(|e| e.p2p_dev_addr == Some(*dev_addr))
            .max_by_key(|e| e.update_idx)
    }

    fn peer_go(&self, dev_addr: &MacAddr) -> PeerGo {
        match self.bss_by_dev_addr(dev_addr) {
            None => PeerGo::NotFound,
            Some(e) if e.update_idx < self.update_idx => {
                debug!(peer = %dev_addr, "Peer BSS entry not updated in the last scan");
                PeerGo::Stale
            }
            Some(_) => PeerGo::Running,
        }
    }

    /// Evaluate the latest scan for the pending join loop
    pub fn evaluate_join(&mut self, peers: &PeerTable) -> Option<JoinScanOutcome> {
        let (mode, dev_addr, auto_join) = {
            let join = self.join.as_ref()?;
            (join.mode, join.target.dev_addr, join.target.auto_join)
        };

        if let JoinMode::AutoPd { .. } = mode {
            let go = self.peer_go(&dev_addr);
            let max_retries = self.max_auto_pd_retries;
            let rescan_freq = self.bss_by_dev_addr(&dev_addr).map(|e| e.result.freq);
            let join = self.join.as_mut()?;
            if go == PeerGo::Stale && join.auto_pd_retries < max_retries {
                if let Some(freq) = rescan_freq {
                    join.auto_pd_retries += 1;
                    debug!(retry = join.auto_pd_retries, peer = %dev_addr, freq, "Scan retry for the peer");
                    return Some(JoinScanOutcome::AutoPdRescan { freq });
                }
            }
            let join = go == PeerGo::Running;
            debug!(peer = %dev_addr, join, "Auto PD");
            return Some(JoinScanOutcome::AutoPdSend { join });
        }

        if auto_join {
            if self.peer_go(&dev_addr) == PeerGo::NotFound {
                debug!(peer = %dev_addr, "Peer was not found to be running a GO -> use GO Negotiation");
                return Some(JoinScanOutcome::FallbackGoNeg);
            }
            debug!(peer = %dev_addr, "Peer was found running GO -> try to join the group");
        }

        let mut iface_addr = self.join.as_ref()?.target.iface_addr;
        let mut freq = peers.by_interface_addr(&iface_addr).and_then(|p| p.oper_freq);
        if freq.is_none() {
            if let Some(peer) = peers.get(&dev_addr) {
                if peer.interface_addr != dev_addr && !self.bss.contains_key(&iface_addr) {
                    debug!(
                        from = %iface_addr,
                        to = %peer.interface_addr,
                        "Overwrite pending interface address for join"
                    );
                    iface_addr = peer.interface_addr;
                    freq = peer.oper_freq;
                }
            }
        }
        if let Some(join) = self.join.as_mut() {
            join.target.iface_addr = iface_addr;
        }

        let wanted_ssid = self.join.as_ref()?.target.ssid.clone();
        // an SSID mismatch still falls back to the latest entry of the BSSID
        let entry = self.bss.get(&iface_addr);
        if let (Some(e), Some(ssid)) = (entry, wanted_ssid.as_ref()) {
            if e.result.ssid != *ssid {
                debug!(bssid = %iface_addr, wanted = %ssid, "BSS SSID differs from requested group SSID");
            }
        }
        let ssid = match entry {
            Some(e) => {
                freq = Some(e.result.freq);
                debug!(freq = e.result.freq, ssid = %e.result.ssid, "Target GO operating frequency from BSS table");
                Some(e.result.ssid.clone())
            }
            None => wanted_ssid.or_else(|| peers.by_interface_addr(&iface_addr).and_then(|p| p.group_ssid.clone())),
        };

        match freq.filter(|f| *f > 0) {
            Some(freq) => Some(JoinScanOutcome::Found {
                bssid: iface_addr,
                ssid,
                freq,
            }),
            None => {
                debug!("Failed to find BSS/GO - try again later");
                Some(self.join_missed())
            }
        }
    }

    /// Forget cached BSS entries and any pending join
    pub fn flush(&mut self) {
        self.bss.clear();
        self.join = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::tests::device_info_attr;

    const GO_DEV: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const GO_IFACE: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x81]);

    fn coordinator() -> ScanCoordinator {
        ScanCoordinator::new(&P2pConfig::default())
    }

    fn go_bss(freq: u32, ssid: &[u8], in_beacon_only: bool) -> ScanResult {
        let mut attrs = Vec::new();
        push_attr(&mut attrs, attr::CAPABILITY, &[0x25, 0x01]);
        push_attr(&mut attrs, attr::DEVICE_INFO, &device_info_attr(GO_DEV, "tv"));
        let ie = build_p2p_ie(&attrs);
        let (ies, beacon_ies) = if in_beacon_only {
            (Vec::new(), ie)
        } else {
            (ie, Vec::new())
        };
        ScanResult {
            bssid: GO_IFACE,
            freq,
            level: -40,
            ssid: Ssid::new(ssid).expect("ssid"),
            ies,
            beacon_ies,
        }
    }

    fn target() -> JoinTarget {
        JoinTarget {
            iface_addr: GO_IFACE,
            dev_addr: GO_DEV,
            ssid: None,
            wps_method: WpsMethod::Pbc,
            auto_join: false,
        }
    }

    #[test]
    fn test_social_scan_channels() {
        let c = coordinator();
        let params = c.discovery_params(DiscoveryType::Social, None);
        assert_eq!(params.freqs, vec![2412, 2437, 2462]);
        assert_eq!(params.ssids[0].as_bytes(), b"DIRECT-");
        assert!(params.p2p_probe);
        assert!(parse_p2p_ie(&params.extra_ies).is_some());

        let plus = c.discovery_params(DiscoveryType::SocialPlusOne, Some(5180));
        assert_eq!(plus.freqs, vec![2412, 2437, 2462, 5180]);
        assert!(c.discovery_params(DiscoveryType::Full, None).freqs.is_empty());
    }

    #[test]
    fn test_social_scan_includes_60ghz() {
        let config = P2pConfig {
            support_60ghz: true,
            ..P2pConfig::default()
        };
        let params = ScanCoordinator::new(&config).discovery_params(DiscoveryType::Social, None);
        assert_eq!(params.freqs.last(), Some(&60480));
    }

    #[test]
    fn test_probe_ies_carry_wps_and_p2p() {
        let mut c = coordinator();
        c.set_req_dev_types(vec![[0, 7, 0, 0x50, 0xf2, 4, 0, 1]]);
        let ies = c.probe_ies();
        assert_eq!(ies[0], WLAN_EID_VENDOR_SPECIFIC);
        assert_eq!(&ies[2..6], &WPS_OUI_TYPE);
        let name = c.device_name.as_bytes();
        assert!(ies.windows(name.len()).any(|w| w == name));
        let ie = parse_p2p_ie(&ies).expect("p2p ie");
        assert_eq!(ie.listen_freq, Some(2437));
    }

    #[test]
    fn test_beacon_ie_fallback_finds_peer() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        let digest = c.on_scan_results(&[go_bss(2437, b"DIRECT-ab", true)], &[], &mut peers);
        assert_eq!(digest.new_peers, vec![GO_DEV]);
        assert_eq!(peers.get(&GO_DEV).map(|p| p.interface_addr), Some(GO_IFACE));
    }

    #[test]
    fn test_join_found_first_scan() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        c.begin_join(IfaceId(0), target(), JoinMode::Join);
        let params = c.next_join_params(None, &peers).expect("params");
        assert!(params.freqs.is_empty());

        c.on_scan_results(&[go_bss(2437, b"DIRECT-ab", false)], &[], &mut peers);
        let outcome = c.evaluate_join(&peers).expect("pending join");
        assert_eq!(
            outcome,
            JoinScanOutcome::Found {
                bssid: GO_IFACE,
                ssid: Some(Ssid::new(&b"DIRECT-ab"[..]).expect("ssid")),
                freq: 2437
            }
        );
        let join = c.pending_join().expect("join");
        assert_eq!(join.attempts, 1);
        assert_eq!(join.auto_pd_retries, 0);
    }

    #[test]
    fn test_join_attempt_limit() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        c.begin_join(IfaceId(0), target(), JoinMode::Join);
        let mut outcomes = Vec::new();
        loop {
            c.next_join_params(None, &peers).expect("params");
            c.on_scan_results(&[], &[], &mut peers);
            let outcome = c.evaluate_join(&peers).expect("pending");
            outcomes.push(outcome.clone());
            if outcome == JoinScanOutcome::GiveUp {
                break;
            }
        }
        assert_eq!(outcomes.len(), 10);
        assert!(outcomes[..9].iter().all(|o| *o == JoinScanOutcome::Retry));
    }

    #[test]
    fn test_join_ssid_mismatch_uses_latest_bss() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        let mut t = target();
        t.ssid = Some(Ssid::new(&b"DIRECT-zz"[..]).expect("ssid"));
        c.begin_join(IfaceId(0), t, JoinMode::Join);
        c.next_join_params(None, &peers).expect("params");
        c.on_scan_results(&[go_bss(2437, b"DIRECT-ab", false)], &[], &mut peers);
        assert_eq!(
            c.evaluate_join(&peers),
            Some(JoinScanOutcome::Found {
                bssid: GO_IFACE,
                ssid: Some(Ssid::new(&b"DIRECT-ab"[..]).expect("ssid")),
                freq: 2437
            })
        );
    }

    #[test]
    fn test_auto_join_falls_back_without_go() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        let mut t = target();
        t.auto_join = true;
        c.begin_join(IfaceId(0), t, JoinMode::Join);
        c.on_scan_results(&[], &[], &mut peers);
        assert_eq!(c.evaluate_join(&peers), Some(JoinScanOutcome::FallbackGoNeg));
    }

    #[test]
    fn test_auto_pd_rescans_stale_peer_then_sends() {
        let config = P2pConfig {
            bss_expiry_scans: 10,
            ..P2pConfig::default()
        };
        let mut c = ScanCoordinator::new(&config);
        let mut peers = PeerTable::new(100);
        c.on_scan_results(&[go_bss(2462, b"DIRECT-ab", false)], &[], &mut peers);
        c.begin_join(IfaceId(0), target(), JoinMode::AutoPd { config_methods: 0x80 });

        for retry in 1..=5 {
            c.on_scan_results(&[], &[], &mut peers);
            assert_eq!(
                c.evaluate_join(&peers),
                Some(JoinScanOutcome::AutoPdRescan { freq: 2462 })
            );
            assert_eq!(c.pending_join().map(|j| j.auto_pd_retries), Some(retry));
        }
        c.on_scan_results(&[], &[], &mut peers);
        assert_eq!(
            c.evaluate_join(&peers),
            Some(JoinScanOutcome::AutoPdSend { join: false })
        );
    }

    #[test]
    fn test_auto_pd_sends_plain_pd_once_go_entry_expires() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(100);
        c.on_scan_results(&[go_bss(2462, b"DIRECT-ab", false)], &[], &mut peers);
        c.begin_join(IfaceId(0), target(), JoinMode::AutoPd { config_methods: 0x80 });

        c.on_scan_results(&[], &[2462], &mut peers);
        assert_eq!(
            c.evaluate_join(&peers),
            Some(JoinScanOutcome::AutoPdRescan { freq: 2462 })
        );
        c.on_scan_results(&[], &[2462], &mut peers);
        assert_eq!(c.bss(&GO_IFACE), None);
        assert_eq!(
            c.evaluate_join(&peers),
            Some(JoinScanOutcome::AutoPdSend { join: false })
        );
    }

    fn ap_bss(n: u8, freq: u32) -> ScanResult {
        ScanResult {
            bssid: MacAddr([0x00, 0x1c, 0, 0, 0, n]),
            freq,
            level: -60,
            ssid: Ssid::new(&b"home-ap"[..]).expect("ssid"),
            ies: Vec::new(),
            beacon_ies: Vec::new(),
        }
    }

    #[test]
    fn test_bss_cache_does_not_grow_across_scans() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        for n in 0..50 {
            c.on_scan_results(&[ap_bss(n, 2412)], &[], &mut peers);
            assert!(c.bss_count() <= 2, "{} entries after scan {}", c.bss_count(), n);
        }
        assert!(c.bss(&ap_bss(49, 2412).bssid).is_some());
        assert_eq!(c.bss(&ap_bss(0, 2412).bssid), None);
    }

    #[test]
    fn test_partial_scans_only_age_covered_channels() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        let ap = ap_bss(1, 2437);
        c.on_scan_results(&[ap.clone()], &[], &mut peers);

        for _ in 0..5 {
            c.on_scan_results(&[], &[2412, 2462], &mut peers);
        }
        assert!(c.bss(&ap.bssid).is_some());

        c.on_scan_results(&[], &[], &mut peers);
        assert!(c.bss(&ap.bssid).is_some());
        c.on_scan_results(&[], &[2437], &mut peers);
        assert_eq!(c.bss(&ap.bssid), None);
    }

    #[test]
    fn test_auto_pd_running_go_sends_join_pd() {
        let mut c = coordinator();
        let mut peers = PeerTable::new(4);
        c.begin_join(IfaceId(0), target(), JoinMode::AutoPd { config_methods: 0x80 });
        c.on_scan_results(&[go_bss(2412, b"DIRECT-ab", false)], &[], &mut peers);
        assert_eq!(
            c.evaluate_join(&peers),
            Some(JoinScanOutcome::AutoPdSend { join: true })
        );
    }
}
