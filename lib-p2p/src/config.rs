//! P2P configuration
//!
//! Every tunable of the group formation core lives in [`P2pConfig`]. The
//! defaults carry the protocol constants; a JSON document may override any
//! subset of fields.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many times to scan for the GO before giving up on a join
pub const P2P_MAX_JOIN_SCAN_ATTEMPTS: u32 = 10;

/// How many extra scans auto provision discovery may spend looking for the peer
pub const P2P_AUTO_PD_SCAN_ATTEMPTS: u32 = 5;

/// Seconds a client keeps trying to reach a lost GO
pub const P2P_MAX_CLIENT_IDLE: u64 = 10;

/// Seconds to wait for the initial 4-way handshake on a client
pub const P2P_MAX_INITIAL_CONN_WAIT: u64 = 10;

/// Seconds a new GO waits for its first client
pub const P2P_MAX_INITIAL_CONN_WAIT_GO: u64 = 10;

/// Seconds a re-invoked persistent GO waits for its first client
pub const P2P_MAX_INITIAL_CONN_WAIT_GO_REINVOKE: u64 = 15;

/// Base group formation timeout in seconds
pub const P2P_GROUP_FORMATION_TIMEOUT: u64 = 15;

/// Formation timeout when joining a running group (GO may need user approval)
pub const P2P_JOIN_FORMATION_TIMEOUT: u64 = 60;

/// Grace period before acting on a client-side WPS failure
pub const P2P_WPS_FAIL_GRACE_MS: u64 = 50;

/// Backoff between join scan attempts
pub const P2P_JOIN_SCAN_BACKOFF_MS: u64 = 1000;

/// Default bound on stored per-client PSK entries of a persistent group
pub const DEFAULT_MAX_STORED_PSKS: usize = 100;

/// Default bound on the remembered client list of a persistent group
pub const DEFAULT_MAX_CLIENT_LIST: usize = 16;

/// Covering scans a BSS entry may miss before it is dropped from the cache
pub const BSS_EXPIRATION_SCAN_COUNT: u32 = 2;

/// Default per-radio work queue capacity
pub const DEFAULT_MAX_QUEUED_WORK: usize = 32;

/// Upper bound on SSIDs in one scan request
pub const MAX_SCAN_SSIDS: usize = 16;

/// Largest SD response the responder will build
pub const MAX_SD_RESPONSE_LEN: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Device name advertised in probe requests
    pub device_name: String,
    /// Default GO intent (0-15)
    pub go_intent: u8,
    /// Listen channel (regulatory class 81)
    pub listen_channel: u8,
    /// Configured operating regulatory class, 0 if unset
    pub oper_reg_class: u8,
    /// Configured operating channel, 0 if unset
    pub oper_channel: u8,
    /// Number of channels the hardware can operate concurrently
    pub num_multichan_concurrent: usize,
    /// Do not prefer frequencies already in use while free MCC channels remain
    pub ignore_shared_freq: bool,
    /// Run groups on the managing interface instead of a dedicated one
    pub no_group_iface: bool,
    /// GO idle timeout in seconds, 0 disables
    pub group_idle_secs: u64,
    /// Accept persistent group re-invocation without user approval
    pub persistent_reconnect: bool,
    /// Write persistent group changes through to the config store
    pub update_config: bool,
    /// Stored per-client PSK bound
    pub max_stored_psks: usize,
    /// Remembered client address bound
    pub max_client_list: usize,
    pub max_join_scan_attempts: u32,
    pub auto_pd_scan_attempts: u32,
    pub join_scan_backoff_ms: u64,
    pub wps_fail_grace_ms: u64,
    pub formation_timeout_secs: u64,
    pub join_formation_timeout_secs: u64,
    pub initial_conn_wait_secs: u64,
    pub go_first_client_wait_secs: u64,
    pub go_reinvoke_wait_secs: u64,
    pub max_client_idle_secs: u64,
    /// Generated GO passphrase length
    pub passphrase_len: usize,
    /// Appended to the generated `DIRECT-xy` SSID
    pub ssid_postfix: String,
    /// Hardware supports the 60 GHz band
    pub support_60ghz: bool,
    /// Wi-Fi Display service discovery enabled
    pub wifi_display: bool,
    /// Per-radio work queue capacity
    pub max_queued_work: usize,
    /// Listen period for discovery in milliseconds
    pub listen_duration_ms: u64,
    /// Scan generations a peer survives without being seen
    pub peer_expiry_generations: u64,
    /// Scans covering its channel a cached BSS survives without being seen
    pub bss_expiry_scans: u32,
    /// NFC tag is enabled with this OOB device password id
    pub oob_dev_pw_id: Option<u16>,
    /// Fixed RNG seed for reproducible channel and credential choices
    pub rng_seed: Option<u64>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            device_name: "lib-p2p".to_string(),
            go_intent: 7,
            listen_channel: 6,
            oper_reg_class: 0,
            oper_channel: 0,
            num_multichan_concurrent: 1,
            ignore_shared_freq: false,
            no_group_iface: true,
            group_idle_secs: 0,
            persistent_reconnect: false,
            update_config: true,
            max_stored_psks: DEFAULT_MAX_STORED_PSKS,
            max_client_list: DEFAULT_MAX_CLIENT_LIST,
            max_join_scan_attempts: P2P_MAX_JOIN_SCAN_ATTEMPTS,
            auto_pd_scan_attempts: P2P_AUTO_PD_SCAN_ATTEMPTS,
            join_scan_backoff_ms: P2P_JOIN_SCAN_BACKOFF_MS,
            wps_fail_grace_ms: P2P_WPS_FAIL_GRACE_MS,
            formation_timeout_secs: P2P_GROUP_FORMATION_TIMEOUT,
            join_formation_timeout_secs: P2P_JOIN_FORMATION_TIMEOUT,
            initial_conn_wait_secs: P2P_MAX_INITIAL_CONN_WAIT,
            go_first_client_wait_secs: P2P_MAX_INITIAL_CONN_WAIT_GO,
            go_reinvoke_wait_secs: P2P_MAX_INITIAL_CONN_WAIT_GO_REINVOKE,
            max_client_idle_secs: P2P_MAX_CLIENT_IDLE,
            passphrase_len: 8,
            ssid_postfix: String::new(),
            support_60ghz: false,
            wifi_display: false,
            max_queued_work: DEFAULT_MAX_QUEUED_WORK,
            listen_duration_ms: 500,
            peer_expiry_generations: 4,
            bss_expiry_scans: BSS_EXPIRATION_SCAN_COUNT,
            oob_dev_pw_id: None,
            rng_seed: None,
        }
    }
}

impl P2pConfig {
    /// Configuration for a device that uses a dedicated interface per group
    pub fn with_group_interfaces() -> Self {
        Self {
            no_group_iface: false,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid P2P config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading P2P configuration");
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.go_intent > 15 {
            return Err(anyhow!("go_intent must be 0-15, got {}", self.go_intent));
        }
        if self.num_multichan_concurrent == 0 {
            return Err(anyhow!("num_multichan_concurrent must be at least 1"));
        }
        if self.max_stored_psks == 0 || self.max_client_list == 0 {
            return Err(anyhow!("persistent group list bounds must be non-zero"));
        }
        if !(8..=63).contains(&self.passphrase_len) {
            return Err(anyhow!(
                "passphrase_len must be 8-63, got {}",
                self.passphrase_len
            ));
        }
        if self.max_join_scan_attempts == 0 {
            return Err(anyhow!("max_join_scan_attempts must be at least 1"));
        }
        if self.bss_expiry_scans == 0 {
            return Err(anyhow!("bss_expiry_scans must be at least 1"));
        }
        Ok(())
    }

    pub fn join_scan_backoff(&self) -> Duration {
        Duration::from_millis(self.join_scan_backoff_ms)
    }

    pub fn wps_fail_grace(&self) -> Duration {
        Duration::from_millis(self.wps_fail_grace_ms)
    }

    /// Formation timeout: base plus the peer's config timeout (units of 10 ms)
    pub fn formation_timeout(&self, peer_config_timeout: u8) -> Duration {
        Duration::from_secs(self.formation_timeout_secs)
            + Duration::from_millis(u64::from(peer_config_timeout) * 10)
    }

    /// Listen frequency derived from the class 81 listen channel
    pub fn listen_freq(&self) -> u32 {
        2407 + 5 * u32::from(self.listen_channel)
    }
}
