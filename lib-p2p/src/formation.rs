//! Group formation state machine
//!
//! Per-interface [`GroupFormationContext`] plus the handlers that move it
//! through negotiation, provisioning and operation. The handlers live on
//! [`P2pContext`] because every transition touches the shared scheduler,
//! timers and stores.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::channel::ChannelSet;
use crate::context::{P2pContext, PendingInvite, DEVICE_IFACE};
use crate::driver::{
    GoNegRequest, GoParams, InterfaceKind, InviteRequest, WpsParams, REASON_DEAUTH_LEAVING,
};
use crate::eloop::TimerKind;
use crate::error::{P2pError, P2pResult};
use crate::notify::P2pEvent;
use crate::persistent::{Credential, PeerRemoval};
use crate::radio::{WorkKind, WorkPayload};
use crate::scan::{JoinMode, JoinScanOutcome, JoinTarget, ScanPurpose};
use crate::types::{
    GoNegResult, GroupRemovalReason, GroupRole, IfaceId, InvitationDecision, InvitationRequest,
    MacAddr, P2pStatus, Ssid, WpsMethod, MAX_SSID_LEN, P2P_WILDCARD_SSID,
};

/// Characters used for generated SSID suffixes and passphrases
const CRED_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Timers owned by a group; the device interface keeps its discovery timer
const GROUP_TIMERS: [TimerKind; 5] = [
    TimerKind::FormationTimeout,
    TimerKind::JoinScan,
    TimerKind::WpsFailGrace,
    TimerKind::FirstClientWait,
    TimerKind::IdleTimeout,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormationState {
    #[default]
    Idle,
    /// Looking for the GO to join
    Discovering,
    Negotiating,
    /// WPS exchange running
    Provisioning,
    /// Credentials agreed, waiting for the first connection
    Forming,
    Operating,
    Failed,
}

impl FormationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormationState::Idle => "idle",
            FormationState::Discovering => "discovering",
            FormationState::Negotiating => "negotiating",
            FormationState::Provisioning => "provisioning",
            FormationState::Forming => "forming",
            FormationState::Operating => "operating",
            FormationState::Failed => "failed",
        }
    }

    /// The group occupies its operating channel in this state
    pub fn has_channel(&self) -> bool {
        matches!(
            self,
            FormationState::Provisioning | FormationState::Forming | FormationState::Operating
        )
    }
}

/// Located GO a client is about to associate with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFound {
    pub bssid: MacAddr,
    pub ssid: Ssid,
    pub freq: u32,
}

/// Station associated with a GO we run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEntry {
    pub sta: MacAddr,
    pub p2p_dev_addr: Option<MacAddr>,
}

pub struct GroupFormationContext {
    pub state: FormationState,
    pub role: Option<GroupRole>,
    /// Peer device address; the GO's for a client
    pub peer: MacAddr,
    pub peer_iface_addr: MacAddr,
    pub wps_method: WpsMethod,
    pub go_intent: u8,
    pub ssid: Option<Ssid>,
    pub freq: u32,
    /// Frequency asked for by the caller, kept for GO Negotiation fallback
    pub requested_freq: u32,
    pub passphrase: Option<Zeroizing<String>>,
    pub persistent: bool,
    pub persistent_id: Option<u32>,
    pub in_provisioning: bool,
    pub pd_before_join: bool,
    pub auto_join: bool,
    /// Persistent group re-invocation, no WPS needed
    pub reinvoked: bool,
    /// `GroupStarted` was emitted
    pub started: bool,
    pub join_target: Option<JoinFound>,
    pub clients: Vec<ClientEntry>,
}

impl fmt::Debug for GroupFormationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupFormationContext")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("ssid", &self.ssid)
            .field("freq", &self.freq)
            .field("persistent_id", &self.persistent_id)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl GroupFormationContext {
    pub(crate) fn new(peer: MacAddr, wps_method: WpsMethod, go_intent: u8, persistent: bool) -> Self {
        Self {
            state: FormationState::Idle,
            role: None,
            peer,
            peer_iface_addr: peer,
            wps_method,
            go_intent,
            ssid: None,
            freq: 0,
            requested_freq: 0,
            passphrase: None,
            persistent,
            persistent_id: None,
            in_provisioning: false,
            pd_before_join: false,
            auto_join: false,
            reinvoked: false,
            started: false,
            join_target: None,
            clients: Vec::new(),
        }
    }

    pub fn is_go(&self) -> bool {
        self.role == Some(GroupRole::Go)
    }
}

/// `DIRECT-xy` followed by as much of `postfix` as fits in an SSID
pub fn generate_ssid(rng: &mut impl Rng, postfix: &str) -> P2pResult<Ssid> {
    let mut bytes = P2P_WILDCARD_SSID.to_vec();
    bytes.extend((0..2).map(|_| CRED_CHARSET[rng.gen_range(0..CRED_CHARSET.len())]));
    let room = MAX_SSID_LEN - bytes.len();
    bytes.extend(postfix.as_bytes().iter().take(room));
    Ssid::new(bytes)
}

pub fn generate_passphrase(rng: &mut impl Rng, len: usize) -> Zeroizing<String> {
    Zeroizing::new(
        (0..len)
            .map(|_| char::from(CRED_CHARSET[rng.gen_range(0..CRED_CHARSET.len())]))
            .collect(),
    )
}

/// Idle timeout in seconds for a group of `role`, 0 when disabled.
///
/// A client always gets a bound so a vanished GO does not keep it around.
pub fn idle_timeout_secs(role: GroupRole, group_idle: u64, max_client_idle: u64) -> u64 {
    match role {
        GroupRole::Client if group_idle == 0 || group_idle > max_client_idle => max_client_idle,
        _ => group_idle,
    }
}

impl P2pContext {
    fn install_group(&mut self, iface: IfaceId, group: GroupFormationContext, forming: bool) {
        if let Some(ifc) = self.iface_mut(iface) {
            ifc.group = Some(group);
        }
        if forming {
            self.formation_iface = Some(iface);
        }
    }

    fn group_info(&self, iface: IfaceId) -> Option<(String, crate::driver::DriverHandle, MacAddr)> {
        self.iface(iface).map(|i| (i.name.clone(), i.handle, i.addr))
    }

    // --- GO Negotiation ---

    pub(crate) fn start_go_negotiation(
        &mut self,
        peer: MacAddr,
        wps_method: WpsMethod,
        go_intent: u8,
        freq: u32,
        persistent: bool,
    ) -> P2pResult<IfaceId> {
        let used = self.used_freqs(None);
        let plan = self.channels.setup_freqs(freq, &used, go_intent == 15)?;
        let iface = self.create_group_iface(InterfaceKind::P2pGroup)?;
        let own_interface_addr = self.iface(iface).map_or(self.own_addr, |i| i.addr);

        let mut group = GroupFormationContext::new(peer, wps_method.clone(), go_intent, persistent);
        group.state = FormationState::Negotiating;
        group.requested_freq = freq;
        self.install_group(iface, group, true);
        self.timers.register(
            iface,
            TimerKind::FormationTimeout,
            Duration::from_secs(self.config.formation_timeout_secs),
        );

        let req = GoNegRequest {
            peer,
            wps_method,
            go_intent,
            force_freq: plan.force,
            pref_freq: plan.pref,
            persistent,
            own_interface_addr,
        };
        if let Err(e) = self.exec.driver.go_neg_request(&req) {
            warn!(peer = %peer, error = %e, "Failed to start GO Negotiation");
            self.remove_group(iface, GroupRemovalReason::FormationFailed);
            return Err(e.into());
        }
        info!(
            peer = %peer,
            go_intent,
            force_freq = ?plan.force,
            pref_freq = ?plan.pref,
            "Started GO Negotiation"
        );
        Ok(iface)
    }

    pub(crate) fn on_go_neg_completed(&mut self, result: GoNegResult) {
        let pending = self
            .formation_iface
            .filter(|i| self.group(*i).is_some_and(|g| g.state == FormationState::Negotiating));
        let Some(iface) = pending else {
            debug!(peer = %result.peer_device_addr, "GO Negotiation result without a pending negotiation");
            return;
        };

        if result.status != P2pStatus::Success {
            info!(peer = %result.peer_device_addr, status = ?result.status, "GO Negotiation failed");
            self.emit(P2pEvent::GoNegFailure {
                peer: result.peer_device_addr,
                status: result.status,
            });
            self.remove_group(iface, GroupRemovalReason::FormationFailed);
            return;
        }

        let role = if result.role_go { GroupRole::Go } else { GroupRole::Client };
        info!(peer = %result.peer_device_addr, role = role.as_str(), freq = result.freq, "GO Negotiation completed");
        self.emit(P2pEvent::GoNegSuccess {
            peer: result.peer_device_addr,
            role,
            freq: result.freq,
        });
        self.timers.register(
            iface,
            TimerKind::FormationTimeout,
            self.config.formation_timeout(result.peer_config_timeout),
        );

        let Some(group) = self.group_mut(iface) else {
            return;
        };
        group.role = Some(role);
        group.state = FormationState::Provisioning;
        group.in_provisioning = true;
        group.freq = result.freq;
        group.peer = result.peer_device_addr;
        group.peer_iface_addr = result.peer_interface_addr;
        group.wps_method = result.wps_method.clone();
        group.persistent = result.persistent_group;
        group.ssid = Some(result.ssid.clone()).filter(|s| !s.is_empty());
        if let Some(pass) = &result.passphrase {
            group.passphrase = Some(Zeroizing::new(pass.clone()));
        }

        match role {
            GroupRole::Go => {
                if let Err(e) = self.ensure_go_credentials(iface).and_then(|_| self.bring_up_go(iface)) {
                    warn!(error = %e, "Failed to start GO");
                    self.fail_formation(iface, "GO_START_FAILED");
                    return;
                }
                let Some((_, handle, _)) = self.group_info(iface) else {
                    return;
                };
                let peer_iface_addr = result.peer_interface_addr;
                if let Err(e) = self.exec.driver.start_wps_registrar(
                    handle,
                    &result.wps_method,
                    Some(peer_iface_addr),
                ) {
                    warn!(error = %e, "Failed to open WPS registrar");
                    self.fail_formation(iface, "WPS_START_FAILED");
                }
            }
            GroupRole::Client => {
                if let Some(group) = self.group_mut(iface) {
                    group.join_target = Some(JoinFound {
                        bssid: result.peer_interface_addr,
                        ssid: result.ssid,
                        freq: result.freq,
                    });
                }
                self.start_enrollee(iface);
            }
        }
    }

    fn ensure_go_credentials(&mut self, iface: IfaceId) -> P2pResult<()> {
        let (need_ssid, need_pass) = match self.group(iface) {
            Some(g) => (g.ssid.is_none(), g.passphrase.is_none()),
            None => return Err(P2pError::NoActiveGroup(iface)),
        };
        let ssid = if need_ssid {
            Some(generate_ssid(&mut self.rng, &self.config.ssid_postfix)?)
        } else {
            None
        };
        let passphrase = need_pass.then(|| generate_passphrase(&mut self.rng, self.config.passphrase_len));
        if let Some(group) = self.group_mut(iface) {
            if let Some(ssid) = ssid {
                group.ssid = Some(ssid);
            }
            if let Some(pass) = passphrase {
                group.passphrase = Some(pass);
            }
        }
        Ok(())
    }

    /// Start the AP side of a GO group and announce it
    fn bring_up_go(&mut self, iface: IfaceId) -> P2pResult<()> {
        let (ifname, handle, _) = self.group_info(iface).ok_or(P2pError::UnknownInterface(iface))?;
        let group = self.group(iface).ok_or(P2pError::NoActiveGroup(iface))?;
        let ssid = group.ssid.clone().ok_or(P2pError::NoActiveGroup(iface))?;
        let params = GoParams {
            ssid: ssid.clone(),
            passphrase: group.passphrase.as_ref().map(|p| p.to_string()).unwrap_or_default(),
            freq: group.freq,
            persistent: group.persistent,
        };
        let persistent_id = group.persistent_id;
        self.exec.driver.start_go(handle, &params)?;
        if let Some(group) = self.group_mut(iface) {
            group.started = true;
        }
        info!(ifname = %ifname, ssid = %ssid, freq = params.freq, "GO started");
        self.emit(P2pEvent::GroupStarted {
            iface,
            ifname,
            role: GroupRole::Go,
            ssid,
            freq: params.freq,
            go_dev_addr: self.own_addr,
            persistent_id,
        });
        Ok(())
    }

    /// Start a GO from a prepared context on a new group interface
    fn launch_go(&mut self, mut group: GroupFormationContext, freq: u32) -> P2pResult<IfaceId> {
        let iface = self.create_group_iface(InterfaceKind::P2pGo)?;
        group.role = Some(GroupRole::Go);
        group.freq = freq;
        group.state = FormationState::Forming;
        self.install_group(iface, group, false);

        let persist = self
            .ensure_go_credentials(iface)
            .map(|_| self.group(iface).is_some_and(|g| g.persistent && g.persistent_id.is_none()));
        match persist {
            Ok(true) => self.persist_group(iface),
            Ok(false) => {}
            Err(e) => {
                self.remove_group(iface, GroupRemovalReason::FormationFailed);
                return Err(e);
            }
        }
        if let Err(e) = self.bring_up_go(iface) {
            warn!(error = %e, "Failed to start GO");
            self.remove_group(iface, GroupRemovalReason::FormationFailed);
            return Err(e);
        }
        Ok(iface)
    }

    pub(crate) fn start_autonomous_go(&mut self, persistent: bool, freq: u32) -> P2pResult<IfaceId> {
        let group = GroupFormationContext::new(self.own_addr, WpsMethod::Pbc, 15, persistent);
        let iface = self.launch_go(group, freq)?;
        if let Some(group) = self.group_mut(iface) {
            group.state = FormationState::Operating;
        }
        self.set_group_idle_timeout(iface);
        Ok(iface)
    }

    /// Restart a stored persistent group in its recorded role
    pub fn group_add_persistent(&mut self, id: u32, freq: u32, bssid: Option<MacAddr>) -> P2pResult<IfaceId> {
        self.ensure_enabled()?;
        let record = self.store.get(id).ok_or(P2pError::UnknownPersistentGroup(id))?;
        let role = record.role;
        let ssid = record.ssid.clone();
        let go_dev_addr = record.go_dev_addr;
        let passphrase = record
            .credential
            .as_ref()
            .and_then(Credential::as_passphrase)
            .map(|p| Zeroizing::new(p.to_string()));

        let running = self
            .interfaces()
            .find(|i| i.group.as_ref().is_some_and(|g| g.ssid.as_ref() == Some(&ssid)))
            .map(|i| i.id);
        if let Some(iface) = running {
            debug!(id, "Requested persistent group is already running");
            return Ok(iface);
        }
        if let Some(iface) = self.formation_iface {
            return Err(P2pError::InProgress(iface));
        }

        info!(id, role = role.as_str(), ssid = %ssid, "Re-invoking persistent group");
        match role {
            GroupRole::Go => {
                let requested = self.channels.select_go_band(freq)?.unwrap_or(0);
                let allowed = self.channels.supported().clone();
                let used = self.used_freqs(None);
                let freq = self.channels.select_go_channel(requested, &allowed, &used)?;
                let mut group = GroupFormationContext::new(self.own_addr, WpsMethod::Pbc, 15, true);
                group.ssid = Some(ssid);
                group.passphrase = passphrase;
                group.persistent_id = Some(id);
                group.reinvoked = true;
                let iface = self.launch_go(group, freq)?;
                self.timers.register(
                    iface,
                    TimerKind::FirstClientWait,
                    Duration::from_secs(self.config.go_reinvoke_wait_secs),
                );
                Ok(iface)
            }
            GroupRole::Client => {
                let mut group = GroupFormationContext::new(go_dev_addr, self.invite_wps_method.clone(), 0, true);
                group.persistent_id = Some(id);
                group.reinvoked = true;
                group.passphrase = passphrase;
                let iface_addr = bssid.unwrap_or(go_dev_addr);
                self.start_join(group, iface_addr, Some(ssid), Some(freq).filter(|f| *f > 0))
            }
        }
    }

    // --- joining ---

    pub(crate) fn start_join(
        &mut self,
        mut group: GroupFormationContext,
        iface_addr: MacAddr,
        ssid: Option<Ssid>,
        freq: Option<u32>,
    ) -> P2pResult<IfaceId> {
        let iface = self.create_group_iface(InterfaceKind::P2pClient)?;
        group.role = Some(GroupRole::Client);
        group.state = FormationState::Discovering;
        group.peer_iface_addr = iface_addr;
        group.ssid = ssid.clone();
        let target = JoinTarget {
            iface_addr,
            dev_addr: group.peer,
            ssid,
            wps_method: group.wps_method.clone(),
            auto_join: group.auto_join,
        };
        self.install_group(iface, group, true);
        self.scan.begin_join(iface, target, JoinMode::Join);
        self.start_join_scan(iface, freq);
        Ok(iface)
    }

    pub(crate) fn on_join_scan_results(&mut self, iface: IfaceId) {
        let Some(outcome) = self.scan.evaluate_join(&self.peers) else {
            return;
        };
        match outcome {
            JoinScanOutcome::Found { bssid, ssid, freq } => self.join_found(iface, bssid, ssid, freq),
            JoinScanOutcome::Retry => {
                self.timers
                    .register(iface, TimerKind::JoinScan, self.config.join_scan_backoff());
            }
            JoinScanOutcome::GiveUp => self.join_scan_exhausted(iface),
            JoinScanOutcome::FallbackGoNeg => {
                self.scan.take_join();
                self.fallback_to_go_neg(iface);
            }
            JoinScanOutcome::AutoPdRescan { freq } => self.start_join_scan(iface, Some(freq)),
            JoinScanOutcome::AutoPdSend { join } => {
                let Some(pending) = self.scan.take_join() else {
                    return;
                };
                let JoinMode::AutoPd { config_methods } = pending.mode else {
                    return;
                };
                let peer = pending.target.dev_addr;
                if let Err(e) = self.exec.driver.prov_disc_request(peer, config_methods, join) {
                    warn!(peer = %peer, error = %e, "Failed to send Provision Discovery Request");
                    self.emit(P2pEvent::ProvDiscFailure { peer, status: None });
                }
            }
        }
    }

    fn join_found(&mut self, iface: IfaceId, bssid: MacAddr, ssid: Option<Ssid>, freq: u32) {
        let used = self.used_freqs(Some(iface));
        if self.channels.check_freq_conflict(freq, &used) {
            self.scan.take_join();
            info!(freq, "Frequency conflict with an existing group, cannot join");
            self.emit(P2pEvent::GroupFormationFailure {
                iface,
                reason: "FREQ_CONFLICT".to_string(),
            });
            self.remove_group(iface, GroupRemovalReason::FreqConflict);
            return;
        }
        let Some(join) = self.scan.take_join() else {
            return;
        };
        self.timers.cancel(iface, TimerKind::JoinScan);

        let ssid = ssid.unwrap_or_default();
        let method = join.target.wps_method.pd_config_method();
        let provisioned = self
            .peers
            .get(&join.target.dev_addr)
            .and_then(|p| p.provisioned_method);
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        debug!(bssid = %bssid, ssid = %ssid, freq, "Target GO found");
        group.join_target = Some(JoinFound { bssid, ssid, freq });
        group.freq = freq;
        group.peer_iface_addr = bssid;
        if group.reinvoked || provisioned == Some(method) {
            self.join_start(iface);
            return;
        }

        match self
            .exec
            .driver
            .prov_disc_request(join.target.dev_addr, method, true)
        {
            Ok(()) => {
                debug!(peer = %join.target.dev_addr, "Sending Provision Discovery Request before joining");
                if let Some(group) = self.group_mut(iface) {
                    group.pd_before_join = true;
                }
            }
            Err(e) => {
                debug!(error = %e, "Provision Discovery before join failed, join anyway");
                self.join_start(iface);
            }
        }
    }

    /// Associate with the located GO, running WPS unless re-invoked
    fn join_start(&mut self, iface: IfaceId) {
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        group.pd_before_join = false;
        let reinvoked = group.reinvoked;

        self.scheduler.cancel_all(
            self.radio,
            |w| w.started && matches!(w.kind, WorkKind::Listen | WorkKind::ActionTx),
            &mut self.exec,
        );
        self.process_work_events();

        if reinvoked {
            if let Err(e) = self.queue_join_work(iface) {
                warn!(error = %e, "Failed to queue join");
                self.fail_formation(iface, "JOIN_FAILED");
                return;
            }
            if let Some(group) = self.group_mut(iface) {
                group.state = FormationState::Forming;
            }
            self.announce_client_group(iface);
            self.timers.register(
                iface,
                TimerKind::FirstClientWait,
                Duration::from_secs(self.config.initial_conn_wait_secs),
            );
            return;
        }

        if let Some(group) = self.group_mut(iface) {
            group.state = FormationState::Provisioning;
            group.in_provisioning = true;
        }
        if !self.start_enrollee(iface) {
            return;
        }
        self.timers.register(
            iface,
            TimerKind::FormationTimeout,
            Duration::from_secs(self.config.join_formation_timeout_secs),
        );
    }

    fn queue_join_work(&mut self, iface: IfaceId) -> P2pResult<()> {
        let target = self
            .group(iface)
            .and_then(|g| g.join_target.clone())
            .ok_or(P2pError::NoActiveGroup(iface))?;
        self.scheduler.enqueue(
            self.radio,
            iface,
            target.freq,
            WorkPayload::Join {
                bssid: target.bssid,
                ssid: target.ssid,
            },
            true,
        )?;
        self.run_scheduler();
        Ok(())
    }

    /// Start the WPS enrollee and queue the association
    fn start_enrollee(&mut self, iface: IfaceId) -> bool {
        let Some((_, handle, _)) = self.group_info(iface) else {
            return false;
        };
        let params = self.group(iface).and_then(|group| {
            let target = group.join_target.clone()?;
            Some(WpsParams {
                method: group.wps_method.clone(),
                peer: Some(group.peer_iface_addr),
                bssid: Some(target.bssid),
                ssid: target.ssid,
                freq: target.freq,
            })
        });
        let Some(params) = params else {
            self.fail_formation(iface, "NO_GO_FOUND");
            return false;
        };
        if let Err(e) = self.exec.driver.start_wps_enrollee(handle, &params) {
            warn!(error = %e, "Failed to start WPS enrollee");
            self.fail_formation(iface, "WPS_START_FAILED");
            return false;
        }
        if let Err(e) = self.queue_join_work(iface) {
            warn!(error = %e, "Failed to queue join");
            self.fail_formation(iface, "JOIN_FAILED");
            return false;
        }
        true
    }

    fn announce_client_group(&mut self, iface: IfaceId) {
        let Some((ifname, _, _)) = self.group_info(iface) else {
            return;
        };
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        if group.started {
            return;
        }
        group.started = true;
        let ssid = group
            .join_target
            .as_ref()
            .map(|t| t.ssid.clone())
            .or_else(|| group.ssid.clone())
            .unwrap_or_default();
        let event = P2pEvent::GroupStarted {
            iface,
            ifname,
            role: GroupRole::Client,
            ssid,
            freq: group.freq,
            go_dev_addr: group.peer,
            persistent_id: group.persistent_id,
        };
        self.emit(event);
    }

    fn fallback_to_go_neg(&mut self, iface: IfaceId) {
        let Some(group) = self.group(iface) else {
            return;
        };
        let (peer, wps_method, go_intent, freq, persistent) = (
            group.peer,
            group.wps_method.clone(),
            group.go_intent,
            group.requested_freq,
            group.persistent,
        );
        info!(peer = %peer, "Fall back to GO Negotiation");
        self.remove_group(iface, GroupRemovalReason::Silent);
        if let Err(e) = self.start_go_negotiation(peer, wps_method, go_intent, freq, persistent) {
            warn!(peer = %peer, error = %e, "GO Negotiation fallback failed");
            self.emit(P2pEvent::GroupFormationFailure {
                iface,
                reason: e.reason_code().to_string(),
            });
        }
    }

    // --- provision discovery ---

    fn pd_join_waiting(&self, peer: MacAddr) -> Option<IfaceId> {
        self.formation_iface.filter(|i| {
            self.group(*i)
                .is_some_and(|g| g.pd_before_join && (g.peer == peer || g.peer_iface_addr == peer))
        })
    }

    pub(crate) fn on_prov_disc_response(&mut self, peer: MacAddr, config_methods: u16) {
        self.peers.set_provisioned(&peer, config_methods);
        if let Some(iface) = self.pd_join_waiting(peer) {
            debug!(peer = %peer, "Starting pending join after Provision Discovery");
            self.join_start(iface);
            return;
        }
        self.emit(P2pEvent::ProvDiscResponse {
            peer,
            config_methods,
        });
    }

    pub(crate) fn on_prov_disc_failure(&mut self, peer: MacAddr, status: Option<P2pStatus>, join_timeout: bool) {
        if let Some(iface) = self.pd_join_waiting(peer) {
            if self.group(iface).is_some_and(|g| g.auto_join) {
                self.fallback_to_go_neg(iface);
                return;
            }
            if join_timeout {
                debug!(peer = %peer, "Provision Discovery before join timed out, join anyway");
                self.join_start(iface);
                return;
            }
        }
        self.emit(P2pEvent::ProvDiscFailure { peer, status });
    }

    // --- WPS and connection events ---

    pub(crate) fn on_wps_success(&mut self, iface: IfaceId, peer: MacAddr) {
        let Some(group) = self.group_mut(iface) else {
            debug!(iface = iface.0, "WPS success on an interface without a group");
            return;
        };
        if !group.in_provisioning {
            debug!(iface = iface.0, "WPS success outside provisioning ignored");
            return;
        }
        group.in_provisioning = false;
        group.state = FormationState::Forming;
        let role = group.role;
        let persistent = group.persistent;
        let reinvoked = group.reinvoked;

        info!(iface = iface.0, peer = %peer, "Group formation completed successfully");
        self.timers.cancel(iface, TimerKind::FormationTimeout);
        if self.scheduler.has_work(iface, WorkKind::Join) {
            self.finish_iface_work(iface, WorkKind::Join);
        }
        if self.formation_iface == Some(iface) {
            self.formation_iface = None;
        }
        self.emit(P2pEvent::GroupFormationSuccess { iface });
        if persistent {
            self.persist_group(iface);
        }

        let wait = match role {
            Some(GroupRole::Client) => {
                self.announce_client_group(iface);
                self.config.initial_conn_wait_secs
            }
            _ if reinvoked => self.config.go_reinvoke_wait_secs,
            _ => self.config.go_first_client_wait_secs,
        };
        self.timers
            .register(iface, TimerKind::FirstClientWait, Duration::from_secs(wait));
    }

    pub(crate) fn on_wps_failed(&mut self, iface: IfaceId) {
        let Some(group) = self.group(iface) else {
            return;
        };
        if !group.in_provisioning {
            return;
        }
        if group.is_go() {
            self.fail_formation(iface, "WPS_FAILED");
        } else {
            // the GO may still deliver credentials after a late failure report
            self.timers
                .register(iface, TimerKind::WpsFailGrace, self.config.wps_fail_grace());
        }
    }

    fn persist_group(&mut self, iface: IfaceId) {
        let Some(group) = self.group(iface) else {
            return;
        };
        let Some(ssid) = group.ssid.clone().or_else(|| group.join_target.as_ref().map(|t| t.ssid.clone())) else {
            return;
        };
        let (go_dev_addr, role, credential) = match group.role {
            Some(GroupRole::Go) => (
                self.own_addr,
                GroupRole::Go,
                group.passphrase.as_ref().map(|p| Credential::passphrase(p.as_str())),
            ),
            _ => (group.peer, GroupRole::Client, None),
        };
        let before = self.store.len();
        match self.store.upsert(go_dev_addr, &ssid, role, credential) {
            Ok(id) => {
                if let Some(group) = self.group_mut(iface) {
                    group.persistent_id = Some(id);
                }
                if self.store.len() > before {
                    self.emit(P2pEvent::PersistentGroupAdded { id });
                }
            }
            Err(e) => warn!(error = %e, "Failed to store persistent group"),
        }
    }

    pub(crate) fn on_sta_connected(&mut self, iface: IfaceId, sta: MacAddr, p2p_dev_addr: Option<MacAddr>) {
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        group.state = FormationState::Operating;
        group.clients.retain(|c| c.sta != sta);
        group.clients.push(ClientEntry { sta, p2p_dev_addr });
        let persistent_id = group.persistent_id;
        self.timers.cancel(iface, TimerKind::FirstClientWait);
        self.timers.cancel(iface, TimerKind::IdleTimeout);
        if let (Some(id), Some(dev)) = (persistent_id, p2p_dev_addr) {
            if let Err(e) = self.store.touch_client(id, dev) {
                warn!(id, error = %e, "Failed to update persistent group client list");
            }
        }
        self.emit(P2pEvent::StaConnected {
            iface,
            peer: p2p_dev_addr.unwrap_or(sta),
        });
    }

    pub(crate) fn on_sta_disconnected(&mut self, iface: IfaceId, sta: MacAddr) {
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        let entry = group.clients.iter().position(|c| c.sta == sta).map(|i| group.clients.remove(i));
        let empty = group.clients.is_empty();
        let peer = entry.and_then(|c| c.p2p_dev_addr).unwrap_or(sta);
        self.emit(P2pEvent::StaDisconnected { iface, peer });
        if empty {
            self.set_group_idle_timeout(iface);
        }
    }

    pub(crate) fn on_connected(&mut self, iface: IfaceId) {
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        if group.is_go() {
            return;
        }
        group.state = FormationState::Operating;
        self.timers.cancel(iface, TimerKind::FirstClientWait);
        self.timers.cancel(iface, TimerKind::IdleTimeout);
        if self.scheduler.has_work(iface, WorkKind::Join) {
            self.finish_iface_work(iface, WorkKind::Join);
        }
        debug!(iface = iface.0, "Connected to GO");
    }

    pub(crate) fn on_disconnected(&mut self, iface: IfaceId) {
        if self.group(iface).is_some_and(|g| !g.is_go() && g.state == FormationState::Operating) {
            debug!(iface = iface.0, "Disconnected from GO");
            self.set_group_idle_timeout(iface);
        }
    }

    pub(crate) fn on_new_psk(&mut self, iface: IfaceId, addr: MacAddr, p2p: bool, psk: [u8; 32]) {
        let Some(id) = self.group(iface).filter(|g| g.is_go()).and_then(|g| g.persistent_id) else {
            debug!(iface = iface.0, "New PSK for a non-persistent group ignored");
            return;
        };
        if let Err(e) = self.store.record_client_psk(id, addr, p2p, psk) {
            warn!(id, error = %e, "Failed to record client PSK");
        }
    }

    fn set_group_idle_timeout(&mut self, iface: IfaceId) {
        let Some(group) = self.group(iface) else {
            return;
        };
        let Some(role) = group.role else {
            return;
        };
        let timeout = idle_timeout_secs(role, self.config.group_idle_secs, self.config.max_client_idle_secs);
        let allowed = !group.in_provisioning && group.state == FormationState::Operating;
        self.timers.cancel(iface, TimerKind::IdleTimeout);
        if timeout == 0 {
            return;
        }
        if !allowed {
            debug!(iface = iface.0, "Do not use group idle timeout during provisioning");
            return;
        }
        debug!(iface = iface.0, timeout, "Set group idle timeout");
        self.timers
            .register(iface, TimerKind::IdleTimeout, Duration::from_secs(timeout));
    }

    // --- timeouts ---

    pub(crate) fn on_formation_timeout(&mut self, iface: IfaceId) {
        if self.group(iface).is_some() {
            self.fail_formation(iface, "FORMATION_TIMEOUT");
        }
    }

    pub(crate) fn on_first_client_timeout(&mut self, iface: IfaceId) {
        let Some(group) = self.group(iface) else {
            return;
        };
        if group.state == FormationState::Operating {
            return;
        }
        if group.is_go() {
            info!(iface = iface.0, "No client connected in time, remove the group");
        } else {
            info!(iface = iface.0, "Connection to the GO was not completed in time");
        }
        self.remove_group(iface, GroupRemovalReason::FormationFailed);
    }

    pub(crate) fn on_group_idle_timeout(&mut self, iface: IfaceId) {
        info!(iface = iface.0, "Group idle timeout reached, terminate the group");
        self.remove_group(iface, GroupRemovalReason::IdleTimeout);
    }

    // --- teardown ---

    pub(crate) fn fail_formation(&mut self, iface: IfaceId, reason: &str) {
        let Some(group) = self.group_mut(iface) else {
            return;
        };
        let had_channel = group.state.has_channel();
        group.state = FormationState::Failed;
        warn!(iface = iface.0, reason, "Group formation failed");
        self.emit(P2pEvent::GroupFormationFailure {
            iface,
            reason: reason.to_string(),
        });
        self.teardown_group(iface, GroupRemovalReason::FormationFailed, had_channel);
    }

    /// Tear a group down with every timer and work item it owns.
    ///
    /// Returns false when the interface has no group. `GroupRemoved` is only
    /// emitted for groups that were announced.
    pub(crate) fn remove_group(&mut self, iface: IfaceId, reason: GroupRemovalReason) -> bool {
        let had_channel = self.group(iface).is_some_and(|g| g.state.has_channel());
        self.teardown_group(iface, reason, had_channel)
    }

    /// `had_channel` is whether the group reached a channel before this
    /// teardown started; a client that did is deauthenticated.
    fn teardown_group(
        &mut self,
        iface: IfaceId,
        reason: GroupRemovalReason,
        had_channel: bool,
    ) -> bool {
        let Some(ifc) = self.iface_mut(iface) else {
            return false;
        };
        let Some(group) = ifc.group.take() else {
            return false;
        };
        let (ifname, handle, dynamic) = (ifc.name.clone(), ifc.handle, ifc.dynamic);

        for kind in GROUP_TIMERS {
            self.timers.cancel(iface, kind);
        }
        if dynamic {
            self.scheduler.cancel_iface(iface, &mut self.exec);
        } else {
            self.scheduler.cancel_all(
                self.radio,
                |w| {
                    w.iface == iface
                        && matches!(
                            w.payload,
                            WorkPayload::Join { .. }
                                | WorkPayload::Scan {
                                    purpose: ScanPurpose::Join,
                                    ..
                                }
                        )
                },
                &mut self.exec,
            );
        }
        self.process_work_events();
        if self.scan.pending_join().is_some_and(|j| j.iface == iface) {
            self.scan.take_join();
        }
        if self.formation_iface == Some(iface) {
            self.formation_iface = None;
        }

        match group.role {
            Some(GroupRole::Client) if had_channel || group.started => {
                if let Err(e) = self.exec.driver.deauthenticate(handle, REASON_DEAUTH_LEAVING) {
                    warn!(ifname = %ifname, error = %e, "Failed to deauthenticate");
                }
            }
            Some(GroupRole::Go) if group.started => {
                if let Err(e) = self.exec.driver.stop_go(handle) {
                    warn!(ifname = %ifname, error = %e, "Failed to stop GO");
                }
            }
            _ => {}
        }

        if group.started {
            let role = group.role.unwrap_or(GroupRole::Client);
            info!(ifname = %ifname, role = role.as_str(), reason = reason.as_str(), "Group removed");
            self.emit(P2pEvent::GroupRemoved {
                iface,
                ifname,
                role,
                reason,
            });
        } else {
            debug!(ifname = %ifname, reason = reason.as_str(), "Group context dropped before start");
        }
        self.release_iface(iface);
        true
    }

    /// Abort a pending GO Negotiation, join or provisioning
    pub fn cancel(&mut self) -> P2pResult<()> {
        self.ensure_enabled()?;
        let mut found = false;

        if let Some(iface) = self.scan.pending_join().map(|j| j.iface) {
            found = true;
            info!(iface = iface.0, "Cancel pending join scan");
            self.scan.take_join();
            self.timers.cancel(iface, TimerKind::JoinScan);
            self.scheduler.cancel_all(
                self.radio,
                |w| {
                    matches!(
                        w.payload,
                        WorkPayload::Scan {
                            purpose: ScanPurpose::Join | ScanPurpose::AutoPd,
                            ..
                        }
                    )
                },
                &mut self.exec,
            );
            self.process_work_events();
        }

        if let Some(iface) = self.formation_iface {
            found = true;
            if self.group(iface).is_some_and(|g| g.in_provisioning) {
                info!(iface = iface.0, "Cancel group formation during provisioning");
                self.emit(P2pEvent::GroupFormationFailure {
                    iface,
                    reason: "CANCELLED".to_string(),
                });
            }
            self.remove_group(iface, GroupRemovalReason::Requested);
        }

        if found {
            Ok(())
        } else {
            Err(P2pError::NothingToCancel)
        }
    }

    // --- invitations ---

    pub(crate) fn invite_persistent(&mut self, peer: MacAddr, id: u32) -> P2pResult<()> {
        let record = self.store.get(id).ok_or(P2pError::UnknownPersistentGroup(id))?;
        let role_go = record.role == GroupRole::Go;
        let ssid = record.ssid.clone();
        let go_dev_addr = if role_go { self.own_addr } else { record.go_dev_addr };

        let used = self.used_freqs(None);
        let plan = self.channels.setup_freqs(0, &used, role_go)?;
        if !role_go {
            // the GO answers with its own invitation
            self.auth_invite = Some(peer);
        }
        self.exec.driver.invite(&InviteRequest {
            peer,
            role_go,
            bssid: None,
            ssid,
            go_dev_addr,
            force_freq: plan.force,
            pref_freq: plan.pref,
            persistent: true,
        })?;
        info!(peer = %peer, id, role_go, "Invited peer to persistent group");
        self.pending_invite = Some(PendingInvite {
            peer,
            persistent_id: Some(id),
        });
        Ok(())
    }

    pub(crate) fn invite_to_group(&mut self, peer: MacAddr, iface: IfaceId) -> P2pResult<()> {
        let (_, _, addr) = self.group_info(iface).ok_or(P2pError::UnknownInterface(iface))?;
        let group = self
            .group(iface)
            .filter(|g| g.started || g.state == FormationState::Operating)
            .ok_or(P2pError::NoActiveGroup(iface))?;
        let role_go = group.is_go();
        let ssid = group
            .ssid
            .clone()
            .or_else(|| group.join_target.as_ref().map(|t| t.ssid.clone()))
            .ok_or(P2pError::NoActiveGroup(iface))?;
        let req = InviteRequest {
            peer,
            role_go,
            bssid: Some(if role_go { addr } else { group.peer_iface_addr }),
            ssid,
            go_dev_addr: if role_go { self.own_addr } else { group.peer },
            force_freq: Some(group.freq).filter(|f| *f > 0),
            pref_freq: None,
            persistent: false,
        };
        self.exec.driver.invite(&req)?;
        info!(peer = %peer, iface = iface.0, "Invited peer to running group");
        self.pending_invite = Some(PendingInvite {
            peer,
            persistent_id: None,
        });
        Ok(())
    }

    pub(crate) fn process_invitation(&mut self, req: &InvitationRequest) -> InvitationDecision {
        let reject = |status| InvitationDecision {
            status,
            go: false,
            group_bssid: None,
            force_freq: None,
            pref_freq: None,
        };
        let mut go = false;
        let mut group_bssid = None;

        if !req.persistent_group {
            let authorized = self
                .auth_invite
                .is_some_and(|a| a == req.go_dev_addr || a == req.sa);
            let nfc = req.dev_pw_id.is_some() && req.dev_pw_id == self.config.oob_dev_pw_id;
            if authorized {
                debug!(sa = %req.sa, "Accept previously authorized invitation");
            } else if nfc {
                debug!(sa = %req.sa, "Accept invitation based on local enabled NFC tag");
                self.invite_wps_method = WpsMethod::Nfc;
            } else {
                info!(sa = %req.sa, "Invitation to an active group from an unauthorized peer");
                return reject(P2pStatus::InformationCurrentlyUnavailable);
            }
        } else {
            let running = self.interfaces().find_map(|i| {
                let group = i.group.as_ref()?;
                (group.ssid.as_ref() == Some(&req.ssid)).then_some((i.addr, group.is_go()))
            });
            match running {
                Some((addr, is_go)) => {
                    debug!(ssid = %req.ssid, "Invitation to a group that is already running");
                    go = is_go;
                    group_bssid = is_go.then_some(addr);
                }
                None => {
                    if self.auth_invite == Some(req.sa) {
                        debug!(sa = %req.sa, "Accept previously initiated re-invocation");
                        self.auth_invite = None;
                    } else if !self.config.persistent_reconnect {
                        return reject(P2pStatus::InformationCurrentlyUnavailable);
                    }
                    let Some(record) = self.store.find(Some(req.go_dev_addr), &req.ssid) else {
                        info!(go = %req.go_dev_addr, ssid = %req.ssid, "Invitation for an unknown persistent group");
                        return reject(P2pStatus::UnknownP2PGroup);
                    };
                    if record.role == GroupRole::Go {
                        go = true;
                        if self.config.no_group_iface {
                            if self.group(DEVICE_IFACE).is_some() {
                                return reject(P2pStatus::UnableToAccommodateRequest);
                            }
                            group_bssid = Some(self.own_addr);
                        }
                    }
                }
            }
        }

        let used = self.used_freqs(None);
        let peer_channels = if req.peer_channels.is_empty() {
            self.channels.supported().clone()
        } else {
            ChannelSet::from_freqs(req.peer_channels.iter().copied())
        };
        let plan = self.channels.resolve_invitation_conflict(
            go,
            Some(req.force_freq).filter(|f| *f > 0),
            &peer_channels,
            &used,
        );
        InvitationDecision {
            status: P2pStatus::Success,
            go,
            group_bssid,
            force_freq: plan.force,
            pref_freq: plan.pref,
        }
    }

    pub(crate) fn on_invitation_received(
        &mut self,
        sa: MacAddr,
        bssid: Option<MacAddr>,
        go_dev_addr: MacAddr,
        ssid: &Ssid,
        status: P2pStatus,
        op_freq: Option<u32>,
    ) {
        let record_id = self
            .store
            .find(Some(go_dev_addr), ssid)
            .or_else(|| self.store.find(None, ssid))
            .map(|r| r.id);
        match status {
            P2pStatus::Success => {
                if let Some(id) = record_id {
                    if let Err(e) = self.group_add_persistent(id, op_freq.unwrap_or(0), bssid) {
                        warn!(id, error = %e, "Failed to start invited persistent group");
                    }
                    return;
                }
                let Some(bssid) = bssid else {
                    debug!(sa = %sa, "Accepted invitation without a group BSSID");
                    return;
                };
                let method = std::mem::replace(&mut self.invite_wps_method, WpsMethod::Pbc);
                let group = GroupFormationContext::new(go_dev_addr, method, 0, false);
                if let Err(e) = self.start_join(group, bssid, Some(ssid.clone()), op_freq) {
                    warn!(bssid = %bssid, error = %e, "Failed to join invited group");
                }
            }
            P2pStatus::InformationCurrentlyUnavailable => self.emit(P2pEvent::InvitationReceived {
                sa,
                go_dev_addr,
                bssid,
                persistent_id: record_id,
                freq: op_freq,
            }),
            other => info!(sa = %sa, status = ?other, "Invitation rejected"),
        }
    }

    pub(crate) fn on_invitation_result(
        &mut self,
        peer: MacAddr,
        status: P2pStatus,
        bssid: Option<MacAddr>,
        neg_freq: Option<u32>,
    ) {
        self.emit(P2pEvent::InvitationResult { status, bssid });
        let Some(pending) = self.pending_invite.take() else {
            debug!(peer = %peer, "Invitation result without a pending invitation");
            return;
        };
        if pending.peer != peer {
            debug!(peer = %peer, expected = %pending.peer, "Invitation result from an unexpected peer");
            self.pending_invite = Some(pending);
            return;
        }

        match (pending.persistent_id, status) {
            (None, P2pStatus::UnknownP2PGroup) => {
                info!(peer = %peer, "Peer does not know the group, remove it as a client");
                self.store.remove_client_everywhere(&peer, false);
            }
            (None, _) => {}
            (Some(id), P2pStatus::Success) => {
                if let Err(e) = self.group_add_persistent(id, neg_freq.unwrap_or(0), bssid) {
                    warn!(id, error = %e, "Failed to start re-invoked persistent group");
                }
            }
            (Some(id), P2pStatus::UnknownP2PGroup) => match self.store.remove_peer(id, &peer) {
                Ok(PeerRemoval::Record) => self.emit(P2pEvent::PersistentGroupRemoved { id }),
                Ok(_) => {}
                Err(e) => warn!(id, error = %e, "Failed to update persistent group"),
            },
            (Some(id), status) => debug!(id, status = ?status, "Persistent group invitation failed"),
        }
    }
}
