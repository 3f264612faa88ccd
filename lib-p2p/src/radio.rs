//! Radio work scheduler
//!
//! Operations that need exclusive use of a radio (scan, listen, action frame
//! TX, join) are queued per radio. At most one item per radio is started at a
//! time; the rest wait in FIFO order, with items enqueued as `next` placed
//! ahead of the regular queue.
//!
//! The scheduler never talks to the driver itself. Starting and tearing down
//! an item is delegated to a [`RadioWorkHandler`], called synchronously.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::{ActionFrame, ScanParams};
use crate::error::{DriverError, WorkError};
use crate::scan::ScanPurpose;
use crate::types::{IfaceId, MacAddr, RadioId, Ssid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkKind {
    Scan,
    Listen,
    ActionTx,
    Join,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Scan => "p2p-scan",
            WorkKind::Listen => "p2p-listen",
            WorkKind::ActionTx => "p2p-send-action",
            WorkKind::Join => "p2p-join",
        }
    }

    /// Scan and listen are limited to one item per radio; the others to one
    /// item per interface
    fn radio_wide(&self) -> bool {
        matches!(self, WorkKind::Scan | WorkKind::Listen)
    }
}

/// Request data carried by a work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkPayload {
    Scan { params: ScanParams, purpose: ScanPurpose },
    Listen { duration_ms: u32 },
    ActionTx(ActionFrame),
    Join { bssid: MacAddr, ssid: Ssid },
}

impl WorkPayload {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkPayload::Scan { .. } => WorkKind::Scan,
            WorkPayload::Listen { .. } => WorkKind::Listen,
            WorkPayload::ActionTx(_) => WorkKind::ActionTx,
            WorkPayload::Join { .. } => WorkKind::Join,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioWork {
    pub id: WorkId,
    pub radio: RadioId,
    pub iface: IfaceId,
    /// Target frequency, 0 for any
    pub freq: u32,
    pub kind: WorkKind,
    pub payload: WorkPayload,
    pub started: bool,
}

/// Why a work item left the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeinitReason {
    Completed,
    Cancelled,
    /// The start callback reported a driver failure
    StartFailed,
    Shutdown,
}

/// Starts and releases work items on behalf of the scheduler
pub trait RadioWorkHandler {
    /// Issue the driver request for `work`
    fn start(&mut self, work: &RadioWork) -> Result<(), DriverError>;
    /// Called exactly once per item when it leaves the scheduler
    fn deinit(&mut self, work: RadioWork, reason: DeinitReason);
}

#[derive(Debug, Default)]
struct RadioQueue {
    started: Option<RadioWork>,
    next: VecDeque<RadioWork>,
    queue: VecDeque<RadioWork>,
}

impl RadioQueue {
    fn pending(&self) -> impl Iterator<Item = &RadioWork> {
        self.next.iter().chain(self.queue.iter())
    }

    fn all(&self) -> impl Iterator<Item = &RadioWork> {
        self.started.iter().chain(self.pending())
    }

    fn len(&self) -> usize {
        self.next.len() + self.queue.len()
    }

    fn take_pending(&mut self, id: WorkId) -> Option<RadioWork> {
        if let Some(pos) = self.next.iter().position(|w| w.id == id) {
            return self.next.remove(pos);
        }
        let pos = self.queue.iter().position(|w| w.id == id)?;
        self.queue.remove(pos)
    }
}

#[derive(Debug)]
pub struct RadioWorkScheduler {
    radios: BTreeMap<RadioId, RadioQueue>,
    next_id: u64,
    max_queued: usize,
}

impl RadioWorkScheduler {
    pub fn new(max_queued: usize) -> Self {
        debug!(max_queued, "Initializing radio work scheduler");
        Self {
            radios: BTreeMap::new(),
            next_id: 1,
            max_queued,
        }
    }

    pub fn register_radio(&mut self, radio: RadioId) {
        self.radios.entry(radio).or_default();
    }

    pub fn is_registered(&self, radio: RadioId) -> bool {
        self.radios.contains_key(&radio)
    }

    /// Admit a work item.
    ///
    /// Rejects a second scan or listen on the radio, a second join or action
    /// TX on the interface, and anything past the queue bound.
    pub fn enqueue(
        &mut self,
        radio: RadioId,
        iface: IfaceId,
        freq: u32,
        payload: WorkPayload,
        next: bool,
    ) -> Result<WorkId, WorkError> {
        let max_queued = self.max_queued;
        let q = self.radios.get_mut(&radio).ok_or_else(WorkError::unknown_radio)?;
        let kind = payload.kind();

        let duplicate = q
            .all()
            .any(|w| w.kind == kind && (kind.radio_wide() || w.iface == iface));
        if duplicate {
            debug!(iface = iface.0, kind = kind.as_str(), "Work of this type already pending");
            return Err(WorkError::busy(iface, kind));
        }
        if q.len() >= max_queued {
            warn!(radio = radio.0, max_queued, "Radio work queue full");
            return Err(WorkError::queue_full(max_queued));
        }

        let id = WorkId(self.next_id);
        self.next_id += 1;
        let work = RadioWork {
            id,
            radio,
            iface,
            freq,
            kind,
            payload,
            started: false,
        };
        debug!(id = id.0, kind = kind.as_str(), freq, next, "Add radio work");
        if next {
            q.next.push_back(work);
        } else {
            q.queue.push_back(work);
        }
        Ok(id)
    }

    /// Start the head item if the radio is idle. Items whose start fails are
    /// deinitialized and the following one is tried.
    pub fn dequeue_and_start_next(
        &mut self,
        radio: RadioId,
        handler: &mut dyn RadioWorkHandler,
    ) -> Option<WorkId> {
        let q = self.radios.get_mut(&radio)?;
        if let Some(started) = &q.started {
            return Some(started.id);
        }
        loop {
            let mut work = q.next.pop_front().or_else(|| q.queue.pop_front())?;
            work.started = true;
            debug!(id = work.id.0, kind = work.kind.as_str(), "Starting radio work");
            match handler.start(&work) {
                Ok(()) => {
                    let id = work.id;
                    q.started = Some(work);
                    return Some(id);
                }
                Err(e) => {
                    warn!(id = work.id.0, kind = work.kind.as_str(), error = %e, "Radio work failed to start");
                    handler.deinit(work, DeinitReason::StartFailed);
                }
            }
        }
    }

    fn radio_of(&self, id: WorkId) -> Option<RadioId> {
        self.radios
            .iter()
            .find(|(_, q)| q.all().any(|w| w.id == id))
            .map(|(radio, _)| *radio)
    }

    fn remove(
        &mut self,
        id: WorkId,
        reason: DeinitReason,
        handler: &mut dyn RadioWorkHandler,
    ) -> Result<(), WorkError> {
        let radio = self.radio_of(id).ok_or_else(|| WorkError::unknown_work(id))?;
        let q = self.radios.get_mut(&radio).ok_or_else(WorkError::unknown_radio)?;
        let work = match q.started.take() {
            Some(started) if started.id == id => started,
            other => {
                q.started = other;
                q.take_pending(id).ok_or_else(|| WorkError::unknown_work(id))?
            }
        };
        debug!(id = id.0, kind = work.kind.as_str(), reason = ?reason, "Radio work done");
        handler.deinit(work, reason);
        self.dequeue_and_start_next(radio, handler);
        Ok(())
    }

    /// Mark an item finished and start the next one
    pub fn complete(&mut self, id: WorkId, handler: &mut dyn RadioWorkHandler) -> Result<(), WorkError> {
        self.remove(id, DeinitReason::Completed, handler)
    }

    pub fn cancel(&mut self, id: WorkId, handler: &mut dyn RadioWorkHandler) -> Result<(), WorkError> {
        self.remove(id, DeinitReason::Cancelled, handler)
    }

    /// Cancel every item on `radio` matching `filter`; returns how many went
    pub fn cancel_all(
        &mut self,
        radio: RadioId,
        filter: impl Fn(&RadioWork) -> bool,
        handler: &mut dyn RadioWorkHandler,
    ) -> usize {
        let Some(q) = self.radios.get_mut(&radio) else {
            return 0;
        };
        let mut removed = Vec::new();
        let mut keep = VecDeque::new();
        for work in q.next.drain(..) {
            if filter(&work) {
                removed.push(work);
            } else {
                keep.push_back(work);
            }
        }
        q.next = keep;
        let mut keep = VecDeque::new();
        for work in q.queue.drain(..) {
            if filter(&work) {
                removed.push(work);
            } else {
                keep.push_back(work);
            }
        }
        q.queue = keep;
        if q.started.as_ref().is_some_and(|w| filter(w)) {
            if let Some(started) = q.started.take() {
                removed.push(started);
            }
        }

        let count = removed.len();
        for work in removed {
            debug!(id = work.id.0, kind = work.kind.as_str(), "Cancel radio work");
            handler.deinit(work, DeinitReason::Cancelled);
        }
        if count > 0 {
            self.dequeue_and_start_next(radio, handler);
        }
        count
    }

    /// Cancel everything an interface owns on any radio
    pub fn cancel_iface(&mut self, iface: IfaceId, handler: &mut dyn RadioWorkHandler) -> usize {
        let radios: Vec<RadioId> = self.radios.keys().copied().collect();
        radios
            .into_iter()
            .map(|radio| self.cancel_all(radio, |w| w.iface == iface, &mut *handler))
            .sum()
    }

    /// Deinit every outstanding item and forget all radios
    pub fn shutdown(&mut self, handler: &mut dyn RadioWorkHandler) {
        for (radio, mut q) in std::mem::take(&mut self.radios) {
            debug!(radio = radio.0, "Flushing radio work");
            if let Some(started) = q.started.take() {
                handler.deinit(started, DeinitReason::Shutdown);
            }
            for work in q.next.drain(..).chain(q.queue.drain(..)) {
                handler.deinit(work, DeinitReason::Shutdown);
            }
        }
    }

    pub fn started(&self, radio: RadioId) -> Option<&RadioWork> {
        self.radios.get(&radio)?.started.as_ref()
    }

    pub fn get(&self, id: WorkId) -> Option<&RadioWork> {
        self.radios.values().flat_map(|q| q.all()).find(|w| w.id == id)
    }

    /// Items waiting on `radio`, not counting the started one
    pub fn pending(&self, radio: RadioId) -> usize {
        self.radios.get(&radio).map_or(0, RadioQueue::len)
    }

    pub fn has_work(&self, iface: IfaceId, kind: WorkKind) -> bool {
        self.radios
            .values()
            .flat_map(|q| q.all())
            .any(|w| w.iface == iface && w.kind == kind)
    }

    /// Any item, queued or started, belonging to `iface`
    pub fn iface_has_work(&self, iface: IfaceId) -> bool {
        self.radios.values().flat_map(|q| q.all()).any(|w| w.iface == iface)
    }

    pub fn is_empty(&self) -> bool {
        self.radios.values().all(|q| q.started.is_none() && q.len() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkErrorKind;

    #[derive(Default)]
    struct RecordingHandler {
        started: Vec<WorkId>,
        deinit: Vec<(WorkId, DeinitReason)>,
        fail_start: Vec<WorkId>,
    }

    impl RadioWorkHandler for RecordingHandler {
        fn start(&mut self, work: &RadioWork) -> Result<(), DriverError> {
            if self.fail_start.contains(&work.id) {
                return Err(DriverError::new("start", "test failure"));
            }
            self.started.push(work.id);
            Ok(())
        }

        fn deinit(&mut self, work: RadioWork, reason: DeinitReason) {
            self.deinit.push((work.id, reason));
        }
    }

    const RADIO: RadioId = RadioId(0);

    fn scheduler() -> RadioWorkScheduler {
        let mut s = RadioWorkScheduler::new(4);
        s.register_radio(RADIO);
        s
    }

    fn listen() -> WorkPayload {
        WorkPayload::Listen { duration_ms: 500 }
    }

    fn join(last: u8) -> WorkPayload {
        WorkPayload::Join {
            bssid: MacAddr([2, 0, 0, 0, 0, last]),
            ssid: Ssid::new(&b"DIRECT-ab"[..]).expect("ssid"),
        }
    }

    #[test]
    fn test_single_started_item_and_fifo_order() {
        let mut s = scheduler();
        let mut h = RecordingHandler::default();
        let a = s.enqueue(RADIO, IfaceId(0), 2412, listen(), false).expect("listen");
        let b = s.enqueue(RADIO, IfaceId(1), 0, join(1), false).expect("join");
        let c = s.enqueue(RADIO, IfaceId(2), 0, join(2), true).expect("join next");

        assert_eq!(s.dequeue_and_start_next(RADIO, &mut h), Some(c));
        assert_eq!(s.dequeue_and_start_next(RADIO, &mut h), Some(c));
        assert_eq!(h.started, vec![c]);

        s.complete(c, &mut h).expect("complete");
        assert_eq!(s.started(RADIO).map(|w| w.id), Some(a));
        s.complete(a, &mut h).expect("complete");
        assert_eq!(s.started(RADIO).map(|w| w.id), Some(b));
        assert_eq!(h.started, vec![c, a, b]);
    }

    #[test]
    fn test_duplicate_scan_and_listen_rejected_radio_wide() {
        let mut s = scheduler();
        s.enqueue(RADIO, IfaceId(0), 0, listen(), false).expect("listen");
        let err = s.enqueue(RADIO, IfaceId(1), 0, listen(), false).expect_err("busy");
        assert_eq!(
            err.kind,
            WorkErrorKind::Busy {
                iface: IfaceId(1),
                kind: WorkKind::Listen
            }
        );
        s.enqueue(RADIO, IfaceId(0), 0, join(1), false).expect("join");
        s.enqueue(RADIO, IfaceId(1), 0, join(2), false).expect("join other iface");
        assert!(s.enqueue(RADIO, IfaceId(1), 0, join(3), false).is_err());
    }

    #[test]
    fn test_queue_bound() {
        let mut s = scheduler();
        for i in 0..4 {
            s.enqueue(RADIO, IfaceId(i), 0, join(i as u8), false).expect("join");
        }
        let err = s.enqueue(RADIO, IfaceId(9), 0, join(9), false).expect_err("full");
        assert_eq!(err.kind, WorkErrorKind::QueueFull { max: 4 });
    }

    #[test]
    fn test_start_failure_deinits_and_moves_on() {
        let mut s = scheduler();
        let mut h = RecordingHandler::default();
        let a = s.enqueue(RADIO, IfaceId(0), 0, join(1), false).expect("join");
        let b = s.enqueue(RADIO, IfaceId(1), 0, join(2), false).expect("join");
        h.fail_start.push(a);
        assert_eq!(s.dequeue_and_start_next(RADIO, &mut h), Some(b));
        assert_eq!(h.deinit, vec![(a, DeinitReason::StartFailed)]);
    }

    #[test]
    fn test_cancel_all_runs_deinit_once() {
        let mut s = scheduler();
        let mut h = RecordingHandler::default();
        let a = s.enqueue(RADIO, IfaceId(0), 0, listen(), false).expect("listen");
        let b = s.enqueue(RADIO, IfaceId(0), 0, join(1), false).expect("join");
        let c = s.enqueue(RADIO, IfaceId(1), 0, join(2), false).expect("join");
        s.dequeue_and_start_next(RADIO, &mut h);

        assert_eq!(s.cancel_iface(IfaceId(0), &mut h), 2);
        assert_eq!(h.deinit.len(), 2);
        assert!(h.deinit.contains(&(a, DeinitReason::Cancelled)));
        assert!(h.deinit.contains(&(b, DeinitReason::Cancelled)));
        assert_eq!(s.started(RADIO).map(|w| w.id), Some(c));
        assert_eq!(s.complete(a, &mut h), Err(WorkError::unknown_work(a)));
    }

    #[test]
    fn test_shutdown_deinits_everything() {
        let mut s = scheduler();
        let mut h = RecordingHandler::default();
        s.enqueue(RADIO, IfaceId(0), 0, listen(), false).expect("listen");
        s.enqueue(RADIO, IfaceId(1), 0, join(1), true).expect("join");
        s.dequeue_and_start_next(RADIO, &mut h);
        s.shutdown(&mut h);
        assert_eq!(h.deinit.len(), 2);
        assert!(h.deinit.iter().all(|(_, r)| *r == DeinitReason::Shutdown));
        assert!(s.is_empty());
        assert!(s.enqueue(RADIO, IfaceId(0), 0, listen(), false).is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Enqueue { iface: usize, kind: u8, next: bool },
            CompleteStarted,
            CancelIface(usize),
            Start,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..3, 0u8..3, any::<bool>())
                    .prop_map(|(iface, kind, next)| Op::Enqueue { iface, kind, next }),
                Just(Op::CompleteStarted),
                (0usize..3).prop_map(Op::CancelIface),
                Just(Op::Start),
            ]
        }

        proptest! {
            #[test]
            fn prop_each_item_started_at_most_once_and_deinit_once(ops in prop::collection::vec(op(), 0..80)) {
                let mut s = RadioWorkScheduler::new(8);
                s.register_radio(RADIO);
                let mut h = RecordingHandler::default();
                let mut admitted = Vec::new();
                for op in ops {
                    match op {
                        Op::Enqueue { iface, kind, next } => {
                            let payload = match kind {
                                0 => listen(),
                                1 => join(iface as u8),
                                _ => WorkPayload::ActionTx(ActionFrame::default()),
                            };
                            if let Ok(id) = s.enqueue(RADIO, IfaceId(iface), 0, payload, next) {
                                admitted.push(id);
                            }
                        }
                        Op::CompleteStarted => {
                            if let Some(id) = s.started(RADIO).map(|w| w.id) {
                                s.complete(id, &mut h).unwrap();
                            }
                        }
                        Op::CancelIface(iface) => {
                            s.cancel_iface(IfaceId(iface), &mut h);
                        }
                        Op::Start => {
                            s.dequeue_and_start_next(RADIO, &mut h);
                        }
                    }
                    let started = s.radios.get(&RADIO).map_or(0, |q| q.started.iter().count());
                    prop_assert!(started <= 1);
                }
                s.shutdown(&mut h);
                let mut seen: Vec<WorkId> = h.deinit.iter().map(|(id, _)| *id).collect();
                seen.sort();
                let mut expected = admitted.clone();
                expected.sort();
                prop_assert_eq!(seen, expected);
                let mut started = h.started.clone();
                started.sort();
                started.dedup();
                prop_assert_eq!(started.len(), h.started.len());
            }
        }
    }
}
