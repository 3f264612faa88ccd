//! Timer queue for the single-threaded event loop
//!
//! Time is a monotonic offset owned by the queue. The context advances it and
//! drains due timers one at a time, so a handler that re-arms a timer sees it
//! fire at the right point relative to the others.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::IfaceId;

/// Timer identity within an interface; registering again replaces it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimerKind {
    /// Group formation did not complete in time
    FormationTimeout,
    /// Next join scan attempt
    JoinScan,
    /// Delayed handling of a client-side WPS failure
    WpsFailGrace,
    /// GO waiting for its first client, or client waiting for the handshake
    FirstClientWait,
    /// Group has been idle for too long
    IdleTimeout,
    /// Discovery period ended
    DiscoveryTimeout,
    /// Off-channel wait after an action frame
    ActionTxWait,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    now: Duration,
    seq: u64,
    by_deadline: BTreeMap<(Duration, u64), (IfaceId, TimerKind)>,
    by_key: HashMap<(IfaceId, TimerKind), (Duration, u64)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Arm `kind` on `iface` to fire `after` from now, replacing an earlier one
    pub fn register(&mut self, iface: IfaceId, kind: TimerKind, after: Duration) {
        self.cancel(iface, kind);
        let deadline = self.now + after;
        let seq = self.seq;
        self.seq += 1;
        trace!(iface = iface.0, kind = ?kind, after_ms = after.as_millis() as u64, "Register timeout");
        self.by_deadline.insert((deadline, seq), (iface, kind));
        self.by_key.insert((iface, kind), (deadline, seq));
    }

    pub fn cancel(&mut self, iface: IfaceId, kind: TimerKind) -> bool {
        match self.by_key.remove(&(iface, kind)) {
            Some(key) => {
                self.by_deadline.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Cancel every timer of an interface
    pub fn cancel_iface(&mut self, iface: IfaceId) -> usize {
        let keys: Vec<(IfaceId, TimerKind)> = self
            .by_key
            .keys()
            .filter(|(i, _)| *i == iface)
            .copied()
            .collect();
        for (i, kind) in &keys {
            self.cancel(*i, *kind);
        }
        keys.len()
    }

    pub fn is_registered(&self, iface: IfaceId, kind: TimerKind) -> bool {
        self.by_key.contains_key(&(iface, kind))
    }

    /// Time left until `kind` fires on `iface`
    pub fn remaining(&self, iface: IfaceId, kind: TimerKind) -> Option<Duration> {
        self.by_key
            .get(&(iface, kind))
            .map(|(deadline, _)| deadline.saturating_sub(self.now))
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest timer due at or before `until`, moving the clock to
    /// its deadline
    pub fn pop_due(&mut self, until: Duration) -> Option<(IfaceId, TimerKind)> {
        let (&key, _) = self.by_deadline.iter().next()?;
        if key.0 > until {
            return None;
        }
        let (iface, kind) = self.by_deadline.remove(&key)?;
        self.by_key.remove(&(iface, kind));
        if key.0 > self.now {
            self.now = key.0;
        }
        Some((iface, kind))
    }

    /// Move the clock forward without firing anything
    pub fn set_now(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Timers armed for `iface`
    pub fn iface_timers(&self, iface: IfaceId) -> Vec<TimerKind> {
        let mut kinds: Vec<TimerKind> = self
            .by_key
            .keys()
            .filter(|(i, _)| *i == iface)
            .map(|(_, kind)| *kind)
            .collect();
        kinds.sort();
        kinds
    }
}
