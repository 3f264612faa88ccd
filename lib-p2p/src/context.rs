//! P2P context
//!
//! One [`P2pContext`] owns every piece of P2P state of a device: the interface
//! table, the radio work scheduler, timers, peers, persistent groups and the
//! local service registry. It is single threaded. Driver events and elapsed
//! time are fed in explicitly, and results leave through the notification
//! sink.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::channel::{ChannelSelectionPolicy, ChannelSet, UsedFreq};
use crate::config::P2pConfig;
use crate::driver::{
    ActionFrame, Driver, DriverHandle, InterfaceKind, JoinParams, REASON_DEAUTH_LEAVING,
};
use crate::eloop::{TimerKind, TimerQueue};
use crate::error::{DriverError, P2pError, P2pResult};
use crate::formation::{FormationState, GroupFormationContext};
use crate::notify::{NotificationSink, P2pEvent};
use crate::peer::PeerTable;
use crate::persistent::{ConfigStore, PersistentGroupStore};
use crate::radio::{
    DeinitReason, RadioWork, RadioWorkHandler, RadioWorkScheduler, WorkId, WorkKind, WorkPayload,
};
use crate::scan::{JoinMode, JoinTarget, ScanCoordinator, ScanPurpose};
use crate::sd::{gas_initial_response, parse_response_tlvs, ServiceRegistry};
use crate::types::{
    DiscoveryType, GoNegResult, GroupRemovalReason, GroupRole, IfaceId, InvitationDecision,
    InvitationRequest, MacAddr, P2pStatus, RadioId, ScanResult, Ssid, WpsMethod,
};

/// The P2P Device interface every context starts with
pub const DEVICE_IFACE: IfaceId = IfaceId(0);

/// The managing interface handed to [`P2pContext::init`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInterface {
    pub name: String,
    pub handle: DriverHandle,
    /// P2P Device Address
    pub addr: MacAddr,
}

#[derive(Debug)]
pub struct Interface {
    pub id: IfaceId,
    pub name: String,
    pub handle: DriverHandle,
    pub addr: MacAddr,
    /// Created for a group and removed together with it
    pub dynamic: bool,
    pub group: Option<GroupFormationContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupTarget {
    Iface(IfaceId),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteTarget {
    /// Re-invoke a stored persistent group
    Persistent(u32),
    /// Invite the peer into a group that is running
    Group(IfaceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdMode {
    Normal,
    /// PD ahead of joining a running group
    Join,
    /// Scan first to learn whether the peer runs a group
    Auto,
}

/// Parameters of [`P2pContext::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub peer: MacAddr,
    pub wps_method: WpsMethod,
    /// Defaults to the configured intent
    pub go_intent: Option<u8>,
    /// Requested operating frequency, 0 for none
    pub freq: u32,
    pub persistent: bool,
    /// Join a group the peer already runs instead of negotiating
    pub join: bool,
    /// Join when the peer turns out to be a GO, else negotiate
    pub auto_join: bool,
    /// SSID of the group to join
    pub ssid: Option<Ssid>,
}

impl ConnectRequest {
    pub fn new(peer: MacAddr, wps_method: WpsMethod) -> Self {
        Self {
            peer,
            wps_method,
            go_intent: None,
            freq: 0,
            persistent: false,
            join: false,
            auto_join: false,
            ssid: None,
        }
    }

    pub fn go_intent(mut self, intent: u8) -> Self {
        self.go_intent = Some(intent);
        self
    }

    pub fn freq(mut self, freq: u32) -> Self {
        self.freq = freq;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn join(mut self, ssid: Option<Ssid>) -> Self {
        self.join = true;
        self.ssid = ssid;
        self
    }

    pub fn auto_join(mut self) -> Self {
        self.auto_join = true;
        self
    }
}

/// Events reported by the driver, the P2P protocol module and the AP/station
/// layers
#[derive(Clone)]
pub enum DriverEvent {
    ScanResults(Vec<ScanResult>),
    ScanAborted,
    ListenEnded,
    GoNegRequest {
        src: MacAddr,
        dev_passwd_id: u16,
        go_intent: u8,
    },
    GoNegCompleted(GoNegResult),
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
        status: Option<P2pStatus>,
        /// No ACK for a PD sent ahead of a join
        join_timeout: bool,
    },
    InvitationReceived {
        sa: MacAddr,
        bssid: Option<MacAddr>,
        go_dev_addr: MacAddr,
        ssid: Ssid,
        status: P2pStatus,
        op_freq: Option<u32>,
    },
    InvitationResult {
        peer: MacAddr,
        status: P2pStatus,
        bssid: Option<MacAddr>,
        neg_freq: Option<u32>,
    },
    WpsSuccess {
        iface: IfaceId,
        peer: MacAddr,
    },
    WpsFailed {
        iface: IfaceId,
    },
    StaConnected {
        iface: IfaceId,
        sta: MacAddr,
        p2p_dev_addr: Option<MacAddr>,
    },
    StaDisconnected {
        iface: IfaceId,
        sta: MacAddr,
    },
    Connected {
        iface: IfaceId,
    },
    Disconnected {
        iface: IfaceId,
    },
    NewPsk {
        iface: IfaceId,
        addr: MacAddr,
        p2p: bool,
        psk: Zeroizing<[u8; 32]>,
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
}

impl DriverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DriverEvent::ScanResults(_) => "scan-results",
            DriverEvent::ScanAborted => "scan-aborted",
            DriverEvent::ListenEnded => "listen-ended",
            DriverEvent::GoNegRequest { .. } => "go-neg-request",
            DriverEvent::GoNegCompleted(_) => "go-neg-completed",
            DriverEvent::ProvDiscRequest { .. } => "pd-request",
            DriverEvent::ProvDiscResponse { .. } => "pd-response",
            DriverEvent::ProvDiscFailure { .. } => "pd-failure",
            DriverEvent::InvitationReceived { .. } => "invitation-received",
            DriverEvent::InvitationResult { .. } => "invitation-result",
            DriverEvent::WpsSuccess { .. } => "wps-success",
            DriverEvent::WpsFailed { .. } => "wps-failed",
            DriverEvent::StaConnected { .. } => "sta-connected",
            DriverEvent::StaDisconnected { .. } => "sta-disconnected",
            DriverEvent::Connected { .. } => "connected",
            DriverEvent::Disconnected { .. } => "disconnected",
            DriverEvent::NewPsk { .. } => "new-psk",
            DriverEvent::SdRequest { .. } => "sd-request",
            DriverEvent::SdResponse { .. } => "sd-response",
        }
    }
}

/// Outstanding service discovery query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdRequestEntry {
    /// `None` for a query sent to every peer
    pub dst: Option<MacAddr>,
    pub tlvs: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Discovery {
    pub(crate) kind: DiscoveryType,
    pub(crate) rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingInvite {
    pub(crate) peer: MacAddr,
    pub(crate) persistent_id: Option<u32>,
}

/// Radio work lifecycle notes collected for the context
#[derive(Debug)]
pub(crate) enum WorkEvent {
    Started {
        id: WorkId,
        iface: IfaceId,
        kind: WorkKind,
        wait_ms: u32,
    },
    Released {
        work: RadioWork,
        reason: DeinitReason,
    },
}

/// Owns the driver and issues the driver request of each radio work item
pub(crate) struct WorkExecutor {
    pub(crate) driver: Box<dyn Driver>,
    handles: HashMap<IfaceId, DriverHandle>,
    events: VecDeque<WorkEvent>,
}

impl WorkExecutor {
    fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver,
            handles: HashMap::new(),
            events: VecDeque::new(),
        }
    }
}

impl RadioWorkHandler for WorkExecutor {
    fn start(&mut self, work: &RadioWork) -> Result<(), DriverError> {
        let mut wait_ms = 0;
        match &work.payload {
            WorkPayload::Scan { params, .. } => self.driver.trigger_scan(params)?,
            WorkPayload::Listen { duration_ms } => self.driver.start_listen(work.freq, *duration_ms)?,
            WorkPayload::ActionTx(frame) => {
                wait_ms = frame.wait_ms;
                self.driver.send_action_frame(frame)?
            }
            WorkPayload::Join { bssid, ssid } => {
                let handle = *self
                    .handles
                    .get(&work.iface)
                    .ok_or_else(|| DriverError::new("associate", "interface has no driver handle"))?;
                self.driver.associate(&JoinParams {
                    handle,
                    bssid: *bssid,
                    ssid: ssid.clone(),
                    freq: work.freq,
                })?
            }
        }
        self.events.push_back(WorkEvent::Started {
            id: work.id,
            iface: work.iface,
            kind: work.kind,
            wait_ms,
        });
        Ok(())
    }

    fn deinit(&mut self, work: RadioWork, reason: DeinitReason) {
        let offchannel = matches!(work.kind, WorkKind::Listen | WorkKind::ActionTx);
        if work.started
            && offchannel
            && matches!(reason, DeinitReason::Cancelled | DeinitReason::Shutdown)
        {
            if let Err(e) = self.driver.cancel_remain_on_channel() {
                warn!(error = %e, "Failed to cancel remain-on-channel");
            }
        }
        self.events.push_back(WorkEvent::Released { work, reason });
    }
}

pub struct P2pContext {
    pub(crate) config: P2pConfig,
    pub(crate) device_name: String,
    pub(crate) own_addr: MacAddr,
    pub(crate) radio: RadioId,
    pub(crate) enabled: bool,
    pub(crate) ifaces: Vec<Option<Interface>>,
    pub(crate) group_counter: u32,
    pub(crate) scheduler: RadioWorkScheduler,
    pub(crate) exec: WorkExecutor,
    pub(crate) timers: TimerQueue,
    pub(crate) peers: PeerTable,
    pub(crate) scan: ScanCoordinator,
    pub(crate) channels: ChannelSelectionPolicy,
    pub(crate) store: PersistentGroupStore,
    pub(crate) services: ServiceRegistry,
    pub(crate) sink: Box<dyn NotificationSink>,
    pub(crate) rng: StdRng,
    /// Interface whose group is being formed
    pub(crate) formation_iface: Option<IfaceId>,
    pub(crate) discovery: Option<Discovery>,
    pub(crate) pending_invite: Option<PendingInvite>,
    /// Peer whose invitation is accepted without asking
    pub(crate) auth_invite: Option<MacAddr>,
    /// WPS method used when an accepted invitation leads to a join
    pub(crate) invite_wps_method: WpsMethod,
    pub(crate) station_freq: Option<u32>,
    pub(crate) sd_requests: BTreeMap<u64, SdRequestEntry>,
    pub(crate) next_sd_handle: u64,
}

impl std::fmt::Debug for P2pContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pContext")
            .field("own_addr", &self.own_addr)
            .field("enabled", &self.enabled)
            .field("ifaces", &self.ifaces.iter().flatten().count())
            .field("formation_iface", &self.formation_iface)
            .finish_non_exhaustive()
    }
}

impl P2pContext {
    /// Bring up the P2P core on top of `device`
    pub fn init(
        config: P2pConfig,
        device: DeviceInterface,
        driver: Box<dyn Driver>,
        sink: Box<dyn NotificationSink>,
        backend: Box<dyn ConfigStore>,
    ) -> P2pResult<Self> {
        info!(device = %device.name, addr = %device.addr, "Initializing P2P context");
        let store = PersistentGroupStore::load(backend, &config)?;
        let channels = ChannelSelectionPolicy::new(&config, ChannelSet::default_for(config.support_60ghz));
        let radio = RadioId(0);
        let mut scheduler = RadioWorkScheduler::new(config.max_queued_work);
        scheduler.register_radio(radio);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };

        let mut exec = WorkExecutor::new(driver);
        exec.handles.insert(DEVICE_IFACE, device.handle);
        let device_iface = Interface {
            id: DEVICE_IFACE,
            name: device.name.clone(),
            handle: device.handle,
            addr: device.addr,
            dynamic: false,
            group: None,
        };

        Ok(Self {
            peers: PeerTable::new(config.peer_expiry_generations),
            scan: ScanCoordinator::new(&config),
            services: ServiceRegistry::new(config.wifi_display, crate::config::MAX_SD_RESPONSE_LEN),
            device_name: device.name,
            own_addr: device.addr,
            radio,
            enabled: true,
            ifaces: vec![Some(device_iface)],
            group_counter: 0,
            scheduler,
            exec,
            timers: TimerQueue::new(),
            channels,
            store,
            sink,
            rng,
            formation_iface: None,
            discovery: None,
            pending_invite: None,
            auth_invite: None,
            invite_wps_method: WpsMethod::Pbc,
            station_freq: None,
            sd_requests: BTreeMap::new(),
            next_sd_handle: 1,
            config,
        })
    }

    /// Tear down every group, flush radio work and timers, and disable the core
    pub fn shutdown(&mut self) {
        if !self.enabled {
            return;
        }
        info!("Shutting down P2P context");
        self.stop_find();
        let groups: Vec<IfaceId> = self
            .interfaces()
            .filter(|i| i.group.is_some())
            .map(|i| i.id)
            .collect();
        for id in groups {
            self.remove_group(id, GroupRemovalReason::Unavailable);
        }
        self.scheduler.shutdown(&mut self.exec);
        self.process_work_events();
        let ids: Vec<IfaceId> = self.interfaces().map(|i| i.id).collect();
        for id in ids {
            self.timers.cancel_iface(id);
        }
        self.scan.flush();
        self.peers.clear();
        self.sd_requests.clear();
        self.pending_invite = None;
        self.enabled = false;
    }

    pub(crate) fn ensure_enabled(&self) -> P2pResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(P2pError::Disabled)
        }
    }

    pub(crate) fn emit(&self, event: P2pEvent) {
        debug!(event = event.name(), "P2P event");
        self.sink.notify(event);
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn own_addr(&self) -> MacAddr {
        self.own_addr
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.ifaces.iter().flatten()
    }

    pub fn iface(&self, id: IfaceId) -> Option<&Interface> {
        self.ifaces.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn iface_mut(&mut self, id: IfaceId) -> Option<&mut Interface> {
        self.ifaces.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn group(&self, id: IfaceId) -> Option<&GroupFormationContext> {
        self.iface(id).and_then(|i| i.group.as_ref())
    }

    pub(crate) fn group_mut(&mut self, id: IfaceId) -> Option<&mut GroupFormationContext> {
        self.iface_mut(id).and_then(|i| i.group.as_mut())
    }

    pub fn formation_iface(&self) -> Option<IfaceId> {
        self.formation_iface
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn scheduler(&self) -> &RadioWorkScheduler {
        &self.scheduler
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn scan(&self) -> &ScanCoordinator {
        &self.scan
    }

    pub fn store(&self) -> &PersistentGroupStore {
        &self.store
    }

    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    pub fn channels_mut(&mut self) -> &mut ChannelSelectionPolicy {
        &mut self.channels
    }

    /// Frequency of the infrastructure connection, if any
    pub fn set_station_freq(&mut self, freq: Option<u32>) {
        self.station_freq = freq;
    }

    /// Accept the next invitation from `peer` without asking
    pub fn authorize_invitation(&mut self, peer: Option<MacAddr>) {
        self.auth_invite = peer;
    }

    /// Frequencies in use on the radio, skipping `exclude`
    pub(crate) fn used_freqs(&self, exclude: Option<IfaceId>) -> Vec<UsedFreq> {
        let mut used: Vec<UsedFreq> = self.station_freq.map(UsedFreq::station).into_iter().collect();
        for iface in self.interfaces().filter(|i| Some(i.id) != exclude) {
            let Some(group) = &iface.group else {
                continue;
            };
            if group.freq == 0 || !group.state.has_channel() {
                continue;
            }
            match group.role {
                Some(GroupRole::Go) => used.push(UsedFreq::p2p_go(group.freq)),
                Some(GroupRole::Client) => used.push(UsedFreq::p2p_client(group.freq)),
                None => {}
            }
        }
        used
    }

    /// Create the interface a new group runs on.
    ///
    /// Without dedicated group interfaces the device interface is reused.
    pub(crate) fn create_group_iface(&mut self, kind: InterfaceKind) -> P2pResult<IfaceId> {
        if self.config.no_group_iface {
            let device = self
                .iface(DEVICE_IFACE)
                .ok_or(P2pError::UnknownInterface(DEVICE_IFACE))?;
            if device.group.is_some() {
                return Err(P2pError::InProgress(DEVICE_IFACE));
            }
            return Ok(DEVICE_IFACE);
        }

        let name = format!("p2p-{}-{}", self.device_name, self.group_counter);
        self.group_counter += 1;
        let (handle, addr) = self.exec.driver.add_interface(kind, &name)?;
        let slot = self
            .ifaces
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.ifaces.len());
        let id = IfaceId(slot);
        let iface = Interface {
            id,
            name: name.clone(),
            handle,
            addr,
            dynamic: true,
            group: None,
        };
        if slot == self.ifaces.len() {
            self.ifaces.push(Some(iface));
        } else {
            self.ifaces[slot] = Some(iface);
        }
        self.exec.handles.insert(id, handle);
        info!(iface = id.0, ifname = %name, kind = kind.as_str(), addr = %addr, "Created group interface");
        Ok(id)
    }

    /// Drop a dynamic interface from the table and the driver
    pub(crate) fn release_iface(&mut self, id: IfaceId) {
        let dynamic = self.iface(id).is_some_and(|i| i.dynamic);
        if !dynamic {
            return;
        }
        let Some(iface) = self.ifaces.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        self.exec.handles.remove(&id);
        self.timers.cancel_iface(id);
        debug!(iface = id.0, ifname = %iface.name, "Removing group interface");
        if let Err(e) = self.exec.driver.remove_interface(iface.handle) {
            warn!(ifname = %iface.name, error = %e, "Failed to remove group interface");
        }
    }

    // --- radio work plumbing ---

    pub(crate) fn run_scheduler(&mut self) {
        self.scheduler.dequeue_and_start_next(self.radio, &mut self.exec);
        self.process_work_events();
    }

    pub(crate) fn complete_work(&mut self, id: WorkId) {
        if let Err(e) = self.scheduler.complete(id, &mut self.exec) {
            debug!(id = id.0, error = %e, "Radio work already gone");
        }
        self.process_work_events();
    }

    /// Complete the item of `kind` owned by `iface`, if any
    pub(crate) fn finish_iface_work(&mut self, iface: IfaceId, kind: WorkKind) {
        let id = self
            .scheduler
            .started(self.radio)
            .filter(|w| w.iface == iface && w.kind == kind)
            .map(|w| w.id);
        match id {
            Some(id) => self.complete_work(id),
            None => {
                self.scheduler
                    .cancel_all(self.radio, |w| w.iface == iface && w.kind == kind, &mut self.exec);
                self.process_work_events();
            }
        }
    }

    pub(crate) fn process_work_events(&mut self) {
        while let Some(event) = self.exec.events.pop_front() {
            match event {
                WorkEvent::Started {
                    id,
                    iface,
                    kind: WorkKind::ActionTx,
                    wait_ms,
                } => {
                    if wait_ms == 0 {
                        self.complete_work(id);
                    } else {
                        self.timers.register(
                            iface,
                            TimerKind::ActionTxWait,
                            Duration::from_millis(u64::from(wait_ms)),
                        );
                    }
                }
                WorkEvent::Started { id, kind, .. } => {
                    debug!(id = id.0, kind = kind.as_str(), "Radio work started");
                }
                WorkEvent::Released {
                    work,
                    reason: DeinitReason::StartFailed,
                } => self.on_work_start_failed(work),
                WorkEvent::Released { work, reason } => {
                    debug!(id = work.id.0, kind = work.kind.as_str(), reason = ?reason, "Radio work released");
                }
            }
        }
    }

    fn on_work_start_failed(&mut self, work: RadioWork) {
        match work.payload {
            WorkPayload::Scan {
                purpose: ScanPurpose::Join | ScanPurpose::AutoPd,
                ..
            } => {
                debug!(iface = work.iface.0, "Failed to start scan for join - try again later");
                self.on_join_scan_miss(work.iface);
            }
            WorkPayload::Scan { .. } | WorkPayload::Listen { .. } => {
                warn!(kind = work.kind.as_str(), "Discovery radio work failed to start");
                self.stop_find();
            }
            WorkPayload::Join { .. } => {
                self.fail_formation(work.iface, "ASSOCIATION_FAILED");
            }
            WorkPayload::ActionTx(frame) => {
                warn!(dst = %frame.dst, freq = frame.freq, "Failed to send action frame");
            }
        }
    }

    /// Send an action frame, directly when the radio already sits on its channel
    pub fn send_action(&mut self, iface: IfaceId, frame: ActionFrame) -> P2pResult<()> {
        self.ensure_enabled()?;
        let on_channel = self.scheduler.started(self.radio).is_some_and(|w| {
            matches!(w.kind, WorkKind::Listen | WorkKind::ActionTx) && w.freq == frame.freq
        });
        if on_channel {
            debug!(freq = frame.freq, dst = %frame.dst, "Already on channel, send action frame directly");
            self.exec.driver.send_action_frame(&frame)?;
            return Ok(());
        }
        let freq = frame.freq;
        self.scheduler
            .enqueue(self.radio, iface, freq, WorkPayload::ActionTx(frame), true)?;
        self.run_scheduler();
        Ok(())
    }

    // --- time ---

    pub fn now(&self) -> Duration {
        self.timers.now()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Advance the loop clock by `elapsed`, firing due timers in order
    pub fn advance(&mut self, elapsed: Duration) {
        let target = self.timers.now() + elapsed;
        self.advance_to(target);
    }

    /// Fire every timer due at or before `target`
    pub fn advance_to(&mut self, target: Duration) {
        while let Some((iface, kind)) = self.timers.pop_due(target) {
            self.on_timer(iface, kind);
        }
        self.timers.set_now(target);
    }

    fn on_timer(&mut self, iface: IfaceId, kind: TimerKind) {
        debug!(iface = iface.0, kind = ?kind, "Timeout");
        match kind {
            TimerKind::FormationTimeout => self.on_formation_timeout(iface),
            TimerKind::JoinScan => self.start_join_scan(iface, None),
            TimerKind::WpsFailGrace => self.fail_formation(iface, "WPS_FAILED"),
            TimerKind::FirstClientWait => self.on_first_client_timeout(iface),
            TimerKind::IdleTimeout => self.on_group_idle_timeout(iface),
            TimerKind::DiscoveryTimeout => self.stop_find(),
            TimerKind::ActionTxWait => self.finish_iface_work(iface, WorkKind::ActionTx),
        }
    }

    // --- event dispatch ---

    pub fn on_driver_event(&mut self, event: DriverEvent) {
        if !self.enabled {
            debug!(event = event.name(), "P2P disabled, dropping driver event");
            return;
        }
        match event {
            DriverEvent::ScanResults(results) => self.on_scan_results(&results),
            DriverEvent::ScanAborted => self.on_scan_aborted(),
            DriverEvent::ListenEnded => self.on_listen_end(),
            DriverEvent::GoNegRequest {
                src,
                dev_passwd_id,
                go_intent,
            } => self.emit(P2pEvent::GoNegRequest {
                src,
                dev_passwd_id,
                go_intent,
            }),
            DriverEvent::GoNegCompleted(result) => self.on_go_neg_completed(result),
            DriverEvent::ProvDiscRequest {
                peer,
                config_methods,
            } => self.emit(P2pEvent::ProvDiscRequest {
                peer,
                config_methods,
            }),
            DriverEvent::ProvDiscResponse {
                peer,
                config_methods,
            } => self.on_prov_disc_response(peer, config_methods),
            DriverEvent::ProvDiscFailure {
                peer,
                status,
                join_timeout,
            } => self.on_prov_disc_failure(peer, status, join_timeout),
            DriverEvent::InvitationReceived {
                sa,
                bssid,
                go_dev_addr,
                ssid,
                status,
                op_freq,
            } => self.on_invitation_received(sa, bssid, go_dev_addr, &ssid, status, op_freq),
            DriverEvent::InvitationResult {
                peer,
                status,
                bssid,
                neg_freq,
            } => self.on_invitation_result(peer, status, bssid, neg_freq),
            DriverEvent::WpsSuccess { iface, peer } => self.on_wps_success(iface, peer),
            DriverEvent::WpsFailed { iface } => self.on_wps_failed(iface),
            DriverEvent::StaConnected {
                iface,
                sta,
                p2p_dev_addr,
            } => self.on_sta_connected(iface, sta, p2p_dev_addr),
            DriverEvent::StaDisconnected { iface, sta } => self.on_sta_disconnected(iface, sta),
            DriverEvent::Connected { iface } => self.on_connected(iface),
            DriverEvent::Disconnected { iface } => self.on_disconnected(iface),
            DriverEvent::NewPsk {
                iface,
                addr,
                p2p,
                psk,
            } => self.on_new_psk(iface, addr, p2p, *psk),
            DriverEvent::SdRequest {
                src,
                freq,
                dialog_token,
                update_indic,
                tlvs,
            } => self.on_sd_request(src, freq, dialog_token, update_indic, &tlvs),
            DriverEvent::SdResponse {
                src,
                update_indic,
                tlvs,
            } => self.on_sd_response(src, update_indic, tlvs),
        }
    }

    // --- discovery ---

    /// Start a find: scan, then listen, until stopped or `timeout` passes
    pub fn start_discovery(
        &mut self,
        timeout: Option<Duration>,
        kind: DiscoveryType,
        req_dev_types: Vec<[u8; 8]>,
    ) -> P2pResult<()> {
        self.ensure_enabled()?;
        if let Some(iface) = self.formation_iface {
            if self.group(iface).is_some_and(|g| g.in_provisioning) {
                return Err(P2pError::InProgress(iface));
            }
        }
        self.cancel_find_work();
        self.timers.cancel(DEVICE_IFACE, TimerKind::DiscoveryTimeout);

        info!(kind = ?kind, timeout_secs = timeout.map(|t| t.as_secs()), "Starting P2P find");
        self.scan.set_req_dev_types(req_dev_types);
        self.discovery = Some(Discovery { kind, rounds: 0 });
        if let Err(e) = self.start_discovery_scan(kind, None) {
            self.discovery = None;
            return Err(e);
        }
        if let Some(timeout) = timeout {
            self.timers
                .register(DEVICE_IFACE, TimerKind::DiscoveryTimeout, timeout);
        }
        Ok(())
    }

    /// Queue one wildcard-SSID P2P probe scan on the device interface
    pub fn start_discovery_scan(
        &mut self,
        kind: DiscoveryType,
        channel_hint: Option<u32>,
    ) -> P2pResult<WorkId> {
        let params = self.scan.discovery_params(kind, channel_hint);
        params.validate()?;
        let id = self.scheduler.enqueue(
            self.radio,
            DEVICE_IFACE,
            0,
            WorkPayload::Scan {
                params,
                purpose: ScanPurpose::Discovery(kind),
            },
            false,
        )?;
        self.run_scheduler();
        Ok(id)
    }

    fn cancel_find_work(&mut self) {
        self.scheduler.cancel_all(
            self.radio,
            |w| {
                w.kind == WorkKind::Listen
                    || matches!(
                        w.payload,
                        WorkPayload::Scan {
                            purpose: ScanPurpose::Discovery(_),
                            ..
                        }
                    )
            },
            &mut self.exec,
        );
        self.process_work_events();
    }

    /// Stop a running find; emits `FindStopped` when one was active
    pub fn stop_find(&mut self) {
        let Some(discovery) = self.discovery.take() else {
            return;
        };
        debug!(rounds = discovery.rounds, "Stopping P2P find");
        self.timers.cancel(DEVICE_IFACE, TimerKind::DiscoveryTimeout);
        self.cancel_find_work();
        self.emit(P2pEvent::FindStopped);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_some()
    }

    fn queue_find_work(&mut self, payload: WorkPayload, freq: u32) {
        if let Err(e) = self.scheduler.enqueue(self.radio, DEVICE_IFACE, freq, payload, false) {
            warn!(error = %e, "Failed to queue P2P find work");
        }
        self.run_scheduler();
    }

    fn continue_find_after_scan(&mut self) {
        let Some(discovery) = self.discovery.as_mut() else {
            return;
        };
        discovery.rounds += 1;
        let duration_ms = u32::try_from(self.config.listen_duration_ms).unwrap_or(u32::MAX);
        let freq = self.config.listen_freq();
        self.queue_find_work(WorkPayload::Listen { duration_ms }, freq);
    }

    fn on_listen_end(&mut self) {
        let started = self
            .scheduler
            .started(self.radio)
            .filter(|w| w.kind == WorkKind::Listen)
            .map(|w| w.id);
        if let Some(id) = started {
            self.complete_work(id);
        }
        let Some(discovery) = self.discovery else {
            return;
        };
        // later rounds only cover the social channels
        let kind = match discovery.kind {
            DiscoveryType::Full => DiscoveryType::Social,
            other => other,
        };
        if let Err(e) = self.start_discovery_scan(kind, None) {
            warn!(error = %e, "Failed to queue P2P find scan");
        }
    }

    // --- scanning ---

    /// Digest scan results and drive whoever was waiting on the scan
    pub fn on_scan_results(&mut self, results: &[ScanResult]) {
        let finished = self
            .scheduler
            .started(self.radio)
            .and_then(|w| match &w.payload {
                WorkPayload::Scan { params, purpose } => {
                    Some((w.id, w.iface, purpose.clone(), params.freqs.clone()))
                }
                _ => None,
            });

        // results nobody asked for count as a scan of every channel
        let scanned_freqs = finished
            .as_ref()
            .map(|(_, _, _, freqs)| freqs.clone())
            .unwrap_or_default();
        let digest = self.scan.on_scan_results(results, &scanned_freqs, &mut self.peers);
        for addr in &digest.new_peers {
            if let Some(peer) = self.peers.get(addr) {
                self.emit(P2pEvent::DeviceFound {
                    addr: *addr,
                    name: peer.name.clone(),
                    go_intent: peer.go_intent,
                });
            }
        }
        for addr in digest.lost_peers {
            self.emit(P2pEvent::DeviceLost { addr });
        }

        let Some((id, iface, purpose, _)) = finished else {
            debug!("Scan results without a pending P2P scan");
            return;
        };
        self.complete_work(id);
        match purpose {
            ScanPurpose::Discovery(_) => self.continue_find_after_scan(),
            ScanPurpose::Join | ScanPurpose::AutoPd => self.on_join_scan_results(iface),
        }
    }

    fn on_scan_aborted(&mut self) {
        let finished = self
            .scheduler
            .started(self.radio)
            .and_then(|w| match &w.payload {
                WorkPayload::Scan { purpose, .. } => Some((w.id, w.iface, purpose.clone())),
                _ => None,
            });
        let Some((id, iface, purpose)) = finished else {
            return;
        };
        debug!(iface = iface.0, purpose = ?purpose, "Scan aborted");
        self.complete_work(id);
        match purpose {
            ScanPurpose::Discovery(_) => self.continue_find_after_scan(),
            ScanPurpose::Join | ScanPurpose::AutoPd => self.on_join_scan_miss(iface),
        }
    }

    /// Queue the next scan of the pending join loop
    pub(crate) fn start_join_scan(&mut self, iface: IfaceId, freq: Option<u32>) {
        let purpose = match self.scan.pending_join().map(|j| j.mode) {
            Some(JoinMode::Join) => ScanPurpose::Join,
            Some(JoinMode::AutoPd { .. }) => ScanPurpose::AutoPd,
            None => return,
        };
        let Some(params) = self.scan.next_join_params(freq, &self.peers) else {
            return;
        };
        let payload = WorkPayload::Scan { params, purpose };
        match self.scheduler.enqueue(self.radio, iface, 0, payload, true) {
            Ok(id) => {
                debug!(iface = iface.0, id = id.0, "Queued join scan");
                self.run_scheduler();
            }
            Err(e) => {
                debug!(iface = iface.0, error = %e, "Failed to queue scan for join - try again later");
                self.on_join_scan_miss(iface);
            }
        }
    }

    pub(crate) fn on_join_scan_miss(&mut self, iface: IfaceId) {
        if self.scan.pending_join().is_none() {
            return;
        }
        match self.scan.join_missed() {
            crate::scan::JoinScanOutcome::Retry => {
                self.timers
                    .register(iface, TimerKind::JoinScan, self.config.join_scan_backoff());
            }
            _ => self.join_scan_exhausted(iface),
        }
    }

    pub(crate) fn join_scan_exhausted(&mut self, iface: IfaceId) {
        self.timers.cancel(iface, TimerKind::JoinScan);
        let Some(join) = self.scan.take_join() else {
            return;
        };
        match join.mode {
            JoinMode::AutoPd { .. } => self.emit(P2pEvent::ProvDiscFailure {
                peer: join.target.dev_addr,
                status: None,
            }),
            JoinMode::Join => self.fail_formation(iface, "JOIN_SCAN_LIMIT"),
        }
    }

    // --- provision discovery ---

    pub fn provision_discovery(&mut self, peer: MacAddr, config_methods: u16, mode: PdMode) -> P2pResult<()> {
        self.ensure_enabled()?;
        debug!(peer = %peer, config_methods, mode = ?mode, "Provision discovery");
        match mode {
            PdMode::Auto => {
                if self.scan.pending_join().is_some() {
                    return Err(P2pError::InProgress(DEVICE_IFACE));
                }
                self.stop_find();
                let target = JoinTarget {
                    iface_addr: peer,
                    dev_addr: peer,
                    ssid: None,
                    wps_method: WpsMethod::Pbc,
                    auto_join: false,
                };
                self.scan
                    .begin_join(DEVICE_IFACE, target, JoinMode::AutoPd { config_methods });
                self.start_join_scan(DEVICE_IFACE, None);
                Ok(())
            }
            PdMode::Normal | PdMode::Join => {
                self.exec
                    .driver
                    .prov_disc_request(peer, config_methods, mode == PdMode::Join)?;
                Ok(())
            }
        }
    }

    // --- service discovery ---

    /// Queue an SD query; returns a handle for [`Self::cancel_request`]
    pub fn service_discovery_request(&mut self, dst: Option<MacAddr>, tlvs: Vec<u8>) -> P2pResult<u64> {
        self.ensure_enabled()?;
        self.exec.driver.sd_request(dst, &tlvs)?;
        let handle = self.next_sd_handle;
        self.next_sd_handle += 1;
        debug!(handle, dst = ?dst, len = tlvs.len(), "Queued SD request");
        self.sd_requests.insert(handle, SdRequestEntry { dst, tlvs });
        Ok(handle)
    }

    pub fn cancel_request(&mut self, handle: u64) -> P2pResult<()> {
        self.sd_requests
            .remove(&handle)
            .map(|_| debug!(handle, "Cancelled SD request"))
            .ok_or(P2pError::UnknownSdRequest(handle))
    }

    pub fn pending_sd_requests(&self) -> impl Iterator<Item = (&u64, &SdRequestEntry)> {
        self.sd_requests.iter()
    }

    /// Answer a peer's SD query from the local registry
    pub fn on_sd_request(&mut self, src: MacAddr, freq: u32, dialog_token: u8, update_indic: u16, tlvs: &[u8]) {
        self.emit(P2pEvent::SdRequest {
            src,
            freq,
            dialog_token,
            update_indic,
            tlvs: tlvs.to_vec(),
        });
        let resp = self.services.build_sd_response(tlvs);
        if resp.malformed > 0 {
            warn!(src = %src, malformed = resp.malformed, "Malformed SD query TLVs answered as unavailable");
        }
        let frame = ActionFrame {
            freq,
            dst: src,
            src: self.own_addr,
            bssid: src,
            payload: gas_initial_response(dialog_token, resp.update_indic, &resp.tlvs),
            wait_ms: 0,
        };
        if let Err(e) = self.send_action(DEVICE_IFACE, frame) {
            warn!(src = %src, error = %e, "Failed to send SD response");
        }
    }

    fn on_sd_response(&mut self, src: MacAddr, update_indic: u16, tlvs: Vec<u8>) {
        if let Err(e) = parse_response_tlvs(&tlvs) {
            warn!(src = %src, error = %e, "Malformed SD response");
        }
        let done: Vec<u64> = self
            .sd_requests
            .iter()
            .filter(|(_, r)| r.dst == Some(src))
            .map(|(h, _)| *h)
            .collect();
        for handle in done {
            self.sd_requests.remove(&handle);
        }
        self.emit(P2pEvent::SdResponse {
            src,
            update_indic,
            tlvs,
        });
    }

    // --- produced surface ---

    /// Connect to a peer by GO Negotiation or by joining its running group
    pub fn connect(&mut self, req: ConnectRequest) -> P2pResult<IfaceId> {
        self.ensure_enabled()?;
        let go_intent = req.go_intent.unwrap_or(self.config.go_intent);
        if go_intent > 15 {
            return Err(P2pError::InvalidGoIntent(go_intent));
        }
        if req.peer.is_zero() {
            return Err(P2pError::MissingPeer);
        }
        if let Some(iface) = self.formation_iface {
            return Err(P2pError::InProgress(iface));
        }
        self.stop_find();

        let peer_is_go = self.peers.get(&req.peer).is_some_and(|p| p.is_go());
        if req.join || (req.auto_join && peer_is_go) {
            let iface_addr = self
                .peers
                .get(&req.peer)
                .map_or(req.peer, |p| p.interface_addr);
            let mut group = GroupFormationContext::new(req.peer, req.wps_method.clone(), go_intent, req.persistent);
            group.auto_join = req.auto_join;
            group.requested_freq = req.freq;
            return self.start_join(group, iface_addr, req.ssid, Some(req.freq).filter(|f| *f > 0));
        }
        self.start_go_negotiation(req.peer, req.wps_method, go_intent, req.freq, req.persistent)
    }

    /// Start an autonomous GO
    pub fn group_add(&mut self, persistent: bool, freq: u32) -> P2pResult<IfaceId> {
        self.ensure_enabled()?;
        if let Some(iface) = self.formation_iface {
            return Err(P2pError::InProgress(iface));
        }
        let requested = self.channels.select_go_band(freq)?.unwrap_or(0);
        let allowed = self.channels.supported().clone();
        let used = self.used_freqs(None);
        let freq = self.channels.select_go_channel(requested, &allowed, &used)?;
        self.start_autonomous_go(persistent, freq)
    }

    /// Remove one group, or every group with [`GroupTarget::All`]
    pub fn group_remove(&mut self, target: GroupTarget) -> P2pResult<usize> {
        self.ensure_enabled()?;
        match target {
            GroupTarget::Iface(id) => {
                if self.iface(id).is_none() {
                    return Err(P2pError::UnknownInterface(id));
                }
                if self.remove_group(id, GroupRemovalReason::Requested) {
                    Ok(1)
                } else {
                    Err(P2pError::NoActiveGroup(id))
                }
            }
            GroupTarget::All => {
                let ids: Vec<IfaceId> = self
                    .interfaces()
                    .filter(|i| i.group.is_some())
                    .map(|i| i.id)
                    .collect();
                let removed = ids
                    .into_iter()
                    .filter(|id| self.remove_group(*id, GroupRemovalReason::Requested))
                    .count();
                Ok(removed)
            }
        }
    }

    /// Remove `peer` from every persistent GO record and disconnect it from
    /// the groups we run. Returns how many records changed.
    pub fn remove_client(&mut self, peer: MacAddr, iface_addr: bool) -> P2pResult<usize> {
        self.ensure_enabled()?;
        let changed = self.store.remove_client_everywhere(&peer, iface_addr);
        let targets: Vec<(DriverHandle, MacAddr)> = self
            .interfaces()
            .filter_map(|i| {
                let group = i.group.as_ref()?;
                (group.role == Some(GroupRole::Go)).then_some((i.handle, group))
            })
            .flat_map(|(handle, group)| {
                group
                    .clients
                    .iter()
                    .filter(|c| c.sta == peer || c.p2p_dev_addr == Some(peer))
                    .map(move |c| (handle, c.sta))
            })
            .collect();
        for (handle, sta) in targets {
            info!(sta = %sta, "Disconnect removed client");
            if let Err(e) = self
                .exec
                .driver
                .disassociate_sta(handle, sta, REASON_DEAUTH_LEAVING)
            {
                warn!(sta = %sta, error = %e, "Failed to disconnect client");
            }
        }
        Ok(changed)
    }

    /// Delete a stored persistent group
    pub fn remove_persistent_group(&mut self, id: u32) -> P2pResult<()> {
        self.ensure_enabled()?;
        self.store
            .remove(id)
            .map_err(|_| P2pError::UnknownPersistentGroup(id))?;
        info!(id, "Removed persistent group");
        self.emit(P2pEvent::PersistentGroupRemoved { id });
        Ok(())
    }

    /// Invite `peer` to a persistent group or into a running group
    pub fn invite(&mut self, peer: MacAddr, target: InviteTarget) -> P2pResult<()> {
        self.ensure_enabled()?;
        if peer.is_zero() {
            return Err(P2pError::MissingPeer);
        }
        match target {
            InviteTarget::Persistent(id) => self.invite_persistent(peer, id),
            InviteTarget::Group(iface) => self.invite_to_group(peer, iface),
        }
    }

    /// Decide how to answer an Invitation Request
    pub fn on_invitation_request(&mut self, req: &InvitationRequest) -> InvitationDecision {
        self.process_invitation(req)
    }

    /// State of the group on `iface`, `Idle` when there is none
    pub fn group_state(&self, iface: IfaceId) -> FormationState {
        self.group(iface).map_or(FormationState::Idle, |g| g.state)
    }
}

impl Drop for P2pContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
