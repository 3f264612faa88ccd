//! Persistent group store
//!
//! Keeps reusable group credentials together with the bounded per-group
//! client and per-client PSK lists. Changes are written through to a
//! [`ConfigStore`] backend when `update_config` is enabled.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::P2pConfig;
use crate::error::StoreError;
use crate::types::{GroupRole, MacAddr, Ssid};

/// Group credential: passphrase or raw 256-bit PSK
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Passphrase(Zeroizing<String>),
    Psk(Zeroizing<[u8; 32]>),
}

impl Credential {
    pub fn passphrase(pass: impl Into<String>) -> Self {
        Credential::Passphrase(Zeroizing::new(pass.into()))
    }

    /// Parse a 64-digit hex PSK
    pub fn psk_from_hex(hex_psk: &str) -> Result<Self, StoreError> {
        let mut psk = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(hex_psk, psk.as_mut_slice())
            .map_err(|e| StoreError::Backend(format!("invalid PSK: {}", e)))?;
        Ok(Credential::Psk(psk))
    }

    pub fn as_passphrase(&self) -> Option<&str> {
        match self {
            Credential::Passphrase(p) => Some(p.as_str()),
            Credential::Psk(_) => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            Credential::Psk(psk) => write!(f, "Psk({}..)", hex::encode(&psk[..2])),
        }
    }
}

/// PSK a client derived while connected to one of our persistent GOs
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PskEntry {
    #[zeroize(skip)]
    pub addr: MacAddr,
    /// `addr` is a P2P device address rather than an interface address
    #[zeroize(skip)]
    pub p2p: bool,
    pub psk: [u8; 32],
}

impl fmt::Debug for PskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskEntry")
            .field("addr", &self.addr)
            .field("p2p", &self.p2p)
            .finish_non_exhaustive()
    }
}

/// FIFO-evicting list with a fixed maximum length
#[derive(Debug, Clone)]
pub struct BoundedList<T> {
    items: VecDeque<T>,
    max: usize,
}

impl<T: PartialEq> BoundedList<T> {
    /// Move `item` to the most recent position, evicting the oldest entry if full
    pub fn touch(&mut self, item: T) -> Option<T> {
        if let Some(pos) = self.items.iter().position(|i| *i == item) {
            self.items.remove(pos);
            self.items.push_back(item);
            return None;
        }
        let evicted = if self.items.len() >= self.max {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }
}

impl<T> BoundedList<T> {
    pub fn new(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
        }
    }

    /// Append as most recent, evicting oldest entries first when at the bound
    pub fn push(&mut self, item: T) -> Vec<T> {
        let mut evicted = Vec::new();
        while !self.items.is_empty() && self.items.len() >= self.max {
            if let Some(old) = self.items.pop_front() {
                evicted.push(old);
            }
        }
        self.items.push_back(item);
        evicted
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|i| !pred(i));
        before - self.items.len()
    }

    pub fn contains_where(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.items.iter().any(pred)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[derive(Debug, Clone)]
pub struct PersistentGroupRecord {
    pub id: u32,
    pub ssid: Ssid,
    pub credential: Option<Credential>,
    pub go_dev_addr: MacAddr,
    pub role: GroupRole,
    pub client_list: BoundedList<MacAddr>,
    pub psk_list: BoundedList<PskEntry>,
}

impl PersistentGroupRecord {
    pub fn new(id: u32, go_dev_addr: MacAddr, ssid: Ssid, role: GroupRole, config: &P2pConfig) -> Self {
        Self {
            id,
            ssid,
            credential: None,
            go_dev_addr,
            role,
            client_list: BoundedList::new(config.max_client_list),
            psk_list: BoundedList::new(config.max_stored_psks),
        }
    }

    pub fn has_client(&self, addr: &MacAddr) -> bool {
        self.client_list.contains_where(|c| c == addr)
    }
}

/// Backend holding persistent group records outside the process
pub trait ConfigStore: Send {
    fn read_all(&mut self) -> Result<Vec<PersistentGroupRecord>, StoreError>;
    fn upsert(&mut self, record: &PersistentGroupRecord) -> Result<(), StoreError>;
    fn remove(&mut self, id: u32) -> Result<(), StoreError>;
    /// Flush pending changes to durable storage
    fn write_through(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    records: BTreeMap<u32, PersistentGroupRecord>,
    writes: usize,
}

/// In-memory backend; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryStoreState) -> T) -> Result<T, StoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    /// Number of completed write-through flushes
    pub fn write_count(&self) -> usize {
        self.with_state(|s| s.writes).unwrap_or(0)
    }

    pub fn record(&self, id: u32) -> Option<PersistentGroupRecord> {
        self.with_state(|s| s.records.get(&id).cloned()).ok().flatten()
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read_all(&mut self) -> Result<Vec<PersistentGroupRecord>, StoreError> {
        self.with_state(|s| s.records.values().cloned().collect())
    }

    fn upsert(&mut self, record: &PersistentGroupRecord) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.records.insert(record.id, record.clone());
        })
    }

    fn remove(&mut self, id: u32) -> Result<(), StoreError> {
        self.with_state(|s| s.records.remove(&id).map(|_| ()))?
            .ok_or(StoreError::NotFound(id))
    }

    fn write_through(&mut self) -> Result<(), StoreError> {
        self.with_state(|s| s.writes += 1)
    }
}

/// What [`PersistentGroupStore::remove_peer`] changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRemoval {
    /// Peer dropped from the client list
    Client,
    /// Record named the peer as its GO and was deleted
    Record,
    NotFound,
}

pub struct PersistentGroupStore {
    records: Vec<PersistentGroupRecord>,
    next_id: u32,
    max_psks: usize,
    max_clients: usize,
    update_config: bool,
    backend: Box<dyn ConfigStore>,
}

impl fmt::Debug for PersistentGroupStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentGroupStore")
            .field("records", &self.records.len())
            .field("update_config", &self.update_config)
            .finish_non_exhaustive()
    }
}

impl PersistentGroupStore {
    /// Load every record the backend holds
    pub fn load(mut backend: Box<dyn ConfigStore>, config: &P2pConfig) -> Result<Self, StoreError> {
        debug!("Initializing persistent group store");
        let records = backend.read_all()?;
        let next_id = records.iter().map(|r| r.id + 1).max().unwrap_or(0);
        info!(count = records.len(), "Loaded persistent groups");
        Ok(Self {
            records,
            next_id,
            max_psks: config.max_stored_psks,
            max_clients: config.max_client_list,
            update_config: config.update_config,
            backend,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PersistentGroupRecord> {
        self.records.iter()
    }

    pub fn get(&self, id: u32) -> Option<&PersistentGroupRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut PersistentGroupRecord, StoreError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    /// Find a record by SSID, optionally requiring the GO device address
    pub fn find(&self, go_dev_addr: Option<MacAddr>, ssid: &Ssid) -> Option<&PersistentGroupRecord> {
        self.records
            .iter()
            .find(|r| r.ssid == *ssid && go_dev_addr.map_or(true, |addr| r.go_dev_addr == addr))
    }

    /// Persistent GO records that list `peer` as a previous client
    pub fn find_go_record_with_client(&self, peer: &MacAddr) -> Option<&PersistentGroupRecord> {
        self.records
            .iter()
            .find(|r| r.role == GroupRole::Go && r.has_client(peer))
    }

    fn persist(&mut self, id: u32) {
        if !self.update_config {
            return;
        }
        let Some(record) = self.records.iter().find(|r| r.id == id) else {
            return;
        };
        let result = self
            .backend
            .upsert(record)
            .and_then(|_| self.backend.write_through());
        if let Err(e) = result {
            warn!(id, error = %e, "Failed to update configuration");
        }
    }

    /// Store credentials for a persistent group, creating the record if needed.
    ///
    /// Only writes through when the record is new or its passphrase changed.
    pub fn upsert(
        &mut self,
        go_dev_addr: MacAddr,
        ssid: &Ssid,
        role: GroupRole,
        credential: Option<Credential>,
    ) -> Result<u32, StoreError> {
        debug!(go_dev_addr = %go_dev_addr, ssid = %ssid, "Storing credentials for a persistent group");
        let existing = self
            .records
            .iter()
            .position(|r| r.go_dev_addr == go_dev_addr && r.ssid == *ssid);

        let (idx, mut changed) = match existing {
            Some(idx) => {
                debug!("Update existing persistent group entry");
                let record = &self.records[idx];
                let changed = match (&credential, &record.credential) {
                    (Some(new @ Credential::Passphrase(_)), old) => old.as_ref() != Some(new),
                    _ => false,
                };
                (idx, changed)
            }
            None => {
                debug!("Create a new persistent group entry");
                let id = self.next_id;
                self.next_id += 1;
                self.records.push(PersistentGroupRecord {
                    id,
                    ssid: ssid.clone(),
                    credential: None,
                    go_dev_addr,
                    role,
                    client_list: BoundedList::new(self.max_clients),
                    psk_list: BoundedList::new(self.max_psks),
                });
                (self.records.len() - 1, true)
            }
        };

        let record = &mut self.records[idx];
        if record.role != role {
            record.role = role;
            changed = true;
        }
        if let Some(credential) = credential {
            record.credential = Some(credential);
        }
        let id = record.id;
        if changed {
            self.persist(id);
        }
        Ok(id)
    }

    /// Record a per-client PSK on a persistent GO, replacing any entry for the
    /// same address and evicting the oldest when the list is full
    pub fn record_client_psk(
        &mut self,
        id: u32,
        addr: MacAddr,
        p2p: bool,
        psk: [u8; 32],
    ) -> Result<(), StoreError> {
        let record = self.get_mut(id)?;
        let replaced = record
            .psk_list
            .remove_where(|e| e.addr == addr && e.p2p == p2p);
        for old in record.psk_list.push(PskEntry { addr, p2p, psk }) {
            debug!(addr = %old.addr, p2p = old.p2p, "Remove oldest PSK entry to make room for a new one");
        }
        debug!(addr = %addr, p2p, replaced, "Add new PSK");
        self.persist(id);
        Ok(())
    }

    /// Move or insert a client at the most recently used position
    pub fn touch_client(&mut self, id: u32, addr: MacAddr) -> Result<(), StoreError> {
        let record = self.get_mut(id)?;
        if record.client_list.iter().last() == Some(&addr) {
            return Ok(());
        }
        if let Some(evicted) = record.client_list.touch(addr) {
            debug!(evicted = %evicted, "Client list full, dropped oldest client");
        }
        self.persist(id);
        Ok(())
    }

    /// Drop `peer` from a record's client list.
    ///
    /// A client-role record whose GO is `peer` and which does not list it as
    /// a client is deleted outright.
    pub fn remove_peer(&mut self, id: u32, peer: &MacAddr) -> Result<PeerRemoval, StoreError> {
        let record = self.get_mut(id)?;
        if record.client_list.remove_where(|c| c == peer) > 0 {
            debug!(peer = %peer, id, "Remove peer from persistent group client list");
            self.persist(id);
            return Ok(PeerRemoval::Client);
        }
        if record.role != GroupRole::Go && record.go_dev_addr == *peer {
            info!(id, "Remove persistent group due to invitation result");
            self.remove(id)?;
            return Ok(PeerRemoval::Record);
        }
        Ok(PeerRemoval::NotFound)
    }

    /// Remove `peer` from every persistent GO record.
    ///
    /// With a device address the peer leaves the client list and its P2P PSK
    /// entries are dropped; with an interface address only the non-P2P PSK
    /// entries go. Returns how many records changed.
    pub fn remove_client_everywhere(&mut self, peer: &MacAddr, iface_addr: bool) -> usize {
        debug!(peer = %peer, iface_addr, "Remove client");
        let mut changed_ids = Vec::new();
        for record in self.records.iter_mut().filter(|r| r.role == GroupRole::Go) {
            let mut changed = 0;
            if !iface_addr {
                changed += record.client_list.remove_where(|c| c == peer);
            }
            changed += record
                .psk_list
                .remove_where(|e| e.addr == *peer && e.p2p == !iface_addr);
            if changed > 0 {
                changed_ids.push(record.id);
            }
        }
        for id in &changed_ids {
            self.persist(*id);
        }
        changed_ids.len()
    }

    /// Explicit removal; the only way a record is ever deleted
    pub fn remove(&mut self, id: u32) -> Result<PersistentGroupRecord, StoreError> {
        let pos = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        let record = self.records.remove(pos);
        if self.update_config {
            let result = self
                .backend
                .remove(id)
                .and_then(|_| self.backend.write_through());
            if let Err(e) = result {
                warn!(id, error = %e, "Failed to update configuration");
            }
        }
        Ok(record)
    }
}
