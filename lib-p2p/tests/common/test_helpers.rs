//! Shared helpers for lib-p2p integration tests
//!
//! Usage:
//! ```ignore
//! mod common;
//! use common::test_helpers::*;
//! ```

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Once};

use lib_p2p::peer::{attr, build_p2p_ie, push_attr};
use lib_p2p::{
    ActionFrame, DeviceInterface, Driver, DriverError, DriverHandle, GoNegRequest, GoParams,
    InterfaceKind, InviteRequest, JoinParams, MacAddr, MemoryConfigStore, NotificationSink,
    P2pConfig, P2pContext, P2pEvent, ScanParams, ScanResult, Ssid, WpsMethod, WpsParams,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

pub const OWN_ADDR: MacAddr = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
pub const DEVICE_HANDLE: DriverHandle = DriverHandle(100);
pub const PEER_DEV: MacAddr = MacAddr([0x02, 0xaa, 0, 0, 0, 0x01]);
pub const PEER_IFACE: MacAddr = MacAddr([0x02, 0xaa, 0, 0, 0, 0x81]);
pub const PEER_STA: MacAddr = MacAddr([0x06, 0xaa, 0, 0, 0, 0x01]);

static TRACING: Once = Once::new();

/// Route tracing output through the test harness, once per binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDING DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

/// One call made into the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    TriggerScan(ScanParams),
    StartListen { freq: u32, duration_ms: u32 },
    CancelRemainOnChannel,
    SendAction(ActionFrame),
    AddInterface { kind: InterfaceKind, name: String },
    RemoveInterface(DriverHandle),
    GoNegRequest(GoNegRequest),
    ProvDiscRequest { peer: MacAddr, config_methods: u16, join: bool },
    Invite(InviteRequest),
    SdRequest { dst: Option<MacAddr>, tlvs: Vec<u8> },
    Associate(JoinParams),
    StartWpsEnrollee { handle: DriverHandle, method: WpsMethod },
    StartGo { handle: DriverHandle, ssid: Ssid, freq: u32, persistent: bool },
    StartWpsRegistrar { handle: DriverHandle, peer: Option<MacAddr> },
    StopGo(DriverHandle),
    Deauthenticate(DriverHandle),
    DisassociateSta { handle: DriverHandle, sta: MacAddr },
}

impl DriverOp {
    pub fn name(&self) -> &'static str {
        match self {
            DriverOp::TriggerScan(_) => "trigger_scan",
            DriverOp::StartListen { .. } => "start_listen",
            DriverOp::CancelRemainOnChannel => "cancel_remain_on_channel",
            DriverOp::SendAction(_) => "send_action_frame",
            DriverOp::AddInterface { .. } => "add_interface",
            DriverOp::RemoveInterface(_) => "remove_interface",
            DriverOp::GoNegRequest(_) => "go_neg_request",
            DriverOp::ProvDiscRequest { .. } => "prov_disc_request",
            DriverOp::Invite(_) => "invite",
            DriverOp::SdRequest { .. } => "sd_request",
            DriverOp::Associate(_) => "associate",
            DriverOp::StartWpsEnrollee { .. } => "start_wps_enrollee",
            DriverOp::StartGo { .. } => "start_go",
            DriverOp::StartWpsRegistrar { .. } => "start_wps_registrar",
            DriverOp::StopGo(_) => "stop_go",
            DriverOp::Deauthenticate(_) => "deauthenticate",
            DriverOp::DisassociateSta { .. } => "disassociate_sta",
        }
    }
}

#[derive(Debug, Default)]
struct DriverState {
    ops: Vec<DriverOp>,
    failing: HashSet<&'static str>,
    next_handle: u64,
}

/// Driver that records every call; clones share the log
#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    state: Arc<Mutex<DriverState>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail
    pub fn fail(&self, op: &'static str) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state.lock().unwrap().failing.remove(op);
    }

    pub fn ops(&self) -> Vec<DriverOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.ops().iter().filter(|op| op.name() == name).count()
    }

    pub fn last(&self, name: &str) -> Option<DriverOp> {
        self.ops().into_iter().rev().find(|op| op.name() == name)
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    fn record(&self, op: DriverOp) -> Result<(), DriverError> {
        let name = op.name();
        let mut state = self.state.lock().unwrap();
        state.ops.push(op);
        if state.failing.contains(name) {
            return Err(DriverError::new(name, "injected failure"));
        }
        Ok(())
    }
}

impl Driver for RecordingDriver {
    fn trigger_scan(&mut self, params: &ScanParams) -> Result<(), DriverError> {
        self.record(DriverOp::TriggerScan(params.clone()))
    }

    fn start_listen(&mut self, freq: u32, duration_ms: u32) -> Result<(), DriverError> {
        self.record(DriverOp::StartListen { freq, duration_ms })
    }

    fn cancel_remain_on_channel(&mut self) -> Result<(), DriverError> {
        self.record(DriverOp::CancelRemainOnChannel)
    }

    fn send_action_frame(&mut self, frame: &ActionFrame) -> Result<(), DriverError> {
        self.record(DriverOp::SendAction(frame.clone()))
    }

    fn add_interface(&mut self, kind: InterfaceKind, name: &str) -> Result<(DriverHandle, MacAddr), DriverError> {
        self.record(DriverOp::AddInterface {
            kind,
            name: name.to_string(),
        })?;
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let n = state.next_handle;
        Ok((DriverHandle(n), MacAddr([0x06, 0x11, 0x22, 0x33, 0x44, n as u8])))
    }

    fn remove_interface(&mut self, handle: DriverHandle) -> Result<(), DriverError> {
        self.record(DriverOp::RemoveInterface(handle))
    }

    fn go_neg_request(&mut self, req: &GoNegRequest) -> Result<(), DriverError> {
        self.record(DriverOp::GoNegRequest(req.clone()))
    }

    fn prov_disc_request(&mut self, peer: MacAddr, config_methods: u16, join: bool) -> Result<(), DriverError> {
        self.record(DriverOp::ProvDiscRequest {
            peer,
            config_methods,
            join,
        })
    }

    fn invite(&mut self, req: &InviteRequest) -> Result<(), DriverError> {
        self.record(DriverOp::Invite(req.clone()))
    }

    fn sd_request(&mut self, dst: Option<MacAddr>, tlvs: &[u8]) -> Result<(), DriverError> {
        self.record(DriverOp::SdRequest {
            dst,
            tlvs: tlvs.to_vec(),
        })
    }

    fn associate(&mut self, params: &JoinParams) -> Result<(), DriverError> {
        self.record(DriverOp::Associate(params.clone()))
    }

    fn start_wps_enrollee(&mut self, handle: DriverHandle, params: &WpsParams) -> Result<(), DriverError> {
        self.record(DriverOp::StartWpsEnrollee {
            handle,
            method: params.method.clone(),
        })
    }

    fn start_go(&mut self, handle: DriverHandle, params: &GoParams) -> Result<(), DriverError> {
        self.record(DriverOp::StartGo {
            handle,
            ssid: params.ssid.clone(),
            freq: params.freq,
            persistent: params.persistent,
        })
    }

    fn start_wps_registrar(&mut self, handle: DriverHandle, _method: &WpsMethod, peer: Option<MacAddr>) -> Result<(), DriverError> {
        self.record(DriverOp::StartWpsRegistrar { handle, peer })
    }

    fn stop_go(&mut self, handle: DriverHandle) -> Result<(), DriverError> {
        self.record(DriverOp::StopGo(handle))
    }

    fn deauthenticate(&mut self, handle: DriverHandle, _reason: u16) -> Result<(), DriverError> {
        self.record(DriverOp::Deauthenticate(handle))
    }

    fn disassociate_sta(&mut self, handle: DriverHandle, sta: MacAddr, _reason: u16) -> Result<(), DriverError> {
        self.record(DriverOp::DisassociateSta { handle, sta })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink collecting every event; clones share the list
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<P2pEvent>>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<P2pEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(P2pEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, event: P2pEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTEXT SETUP
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TestRig {
    pub ctx: P2pContext,
    pub driver: RecordingDriver,
    pub sink: CollectingSink,
    pub store: MemoryConfigStore,
}

pub fn test_config() -> P2pConfig {
    P2pConfig {
        device_name: "test-device".to_string(),
        rng_seed: Some(42),
        ..P2pConfig::default()
    }
}

pub fn device_iface() -> DeviceInterface {
    DeviceInterface {
        name: "wlan0".to_string(),
        handle: DEVICE_HANDLE,
        addr: OWN_ADDR,
    }
}

pub fn rig_with(config: P2pConfig, store: MemoryConfigStore) -> TestRig {
    init_tracing();
    let driver = RecordingDriver::new();
    let sink = CollectingSink::default();
    let ctx = P2pContext::init(
        config,
        device_iface(),
        Box::new(driver.clone()),
        Box::new(sink.clone()),
        Box::new(store.clone()),
    )
    .expect("context init");
    TestRig {
        ctx,
        driver,
        sink,
        store,
    }
}

pub fn rig() -> TestRig {
    rig_with(test_config(), MemoryConfigStore::new())
}

pub fn group_iface_rig() -> TestRig {
    let config = P2pConfig {
        no_group_iface: false,
        ..test_config()
    };
    rig_with(config, MemoryConfigStore::new())
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCAN RESULT BUILDERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Device Info attribute body: address, config methods, primary type, name
pub fn device_info(addr: MacAddr, name: &str) -> Vec<u8> {
    let mut data = addr.0.to_vec();
    data.extend_from_slice(&0x0188u16.to_be_bytes());
    data.extend_from_slice(&[0, 10, 0, 0x50, 0xf2, 0x04, 0, 5]);
    data.push(0);
    data.extend_from_slice(&0x1011u16.to_be_bytes());
    data.extend_from_slice(&(name.len() as u16).to_be_bytes());
    data.extend_from_slice(name.as_bytes());
    data
}

/// BSS of a GO advertising `dev` on `freq`
pub fn go_bss(dev: MacAddr, bssid: MacAddr, ssid: &[u8], freq: u32) -> ScanResult {
    let mut attrs = Vec::new();
    // device capab: SD | invitation; group capab: group owner
    push_attr(&mut attrs, attr::CAPABILITY, &[0x25, 0x01]);
    push_attr(&mut attrs, attr::DEVICE_INFO, &device_info(dev, "peer-tv"));
    ScanResult {
        bssid,
        freq,
        level: -45,
        ssid: Ssid::new(ssid).expect("ssid"),
        ies: build_p2p_ie(&attrs),
        beacon_ies: Vec::new(),
    }
}

/// Probe response of a P2P device that is not running a group
pub fn device_bss(dev: MacAddr, freq: u32) -> ScanResult {
    let mut attrs = Vec::new();
    push_attr(&mut attrs, attr::CAPABILITY, &[0x25, 0x00]);
    push_attr(&mut attrs, attr::DEVICE_INFO, &device_info(dev, "peer-phone"));
    ScanResult {
        bssid: dev,
        freq,
        level: -50,
        ssid: Ssid::new(&b"DIRECT-"[..]).expect("ssid"),
        ies: build_p2p_ie(&attrs),
        beacon_ies: Vec::new(),
    }
}

pub fn ssid(bytes: &[u8]) -> Ssid {
    Ssid::new(bytes).expect("ssid")
}
