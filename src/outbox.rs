//! Queue of completed transactions awaiting network confirmation.
//!
//! Records enter only through [`OfflineQueue::enqueue`] and leave only
//! through [`OfflineQueue::compact`] once confirmed. Sync status changes only
//! when a claimed record is settled with its delivery result. The queue does
//! no I/O itself: every change marks the record dirty and
//! [`OfflineQueue::take_writes`] turns the dirty set into store operations
//! for the shell. All state sits behind one mutex; claimed records are
//! marked in flight so an overlapping delivery pass cannot claim them again.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{KeyNamespace, KvError, KvKey, StoreOperation, StoredQueue, UplinkError};
use crate::model::{LocalId, UnixTimeMs};
use crate::workflow::complaint::ComplaintPayload;
use crate::workflow::payment::PaymentPayload;

pub const MAX_QUEUE_RECORDS: usize = 10_000;
const COMPACTED_MEMORY: usize = 4_096;
const COMPACTED_META_KEY: &str = "compacted";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("record {0} already queued or delivered")]
    Duplicate(LocalId),

    #[error("queue is full ({0} undelivered records)")]
    Full(usize),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<ciborium::de::Error<std::io::Error>> for QueueError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        QueueError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for QueueError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        QueueError::Codec(e.to_string())
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Payment,
    Complaint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Payment(PaymentPayload),
    Complaint(ComplaintPayload),
}

/// `Optimistic` is what a record created online starts as: reported synced,
/// but not yet delivered. `Rejected` is final; the back office refused the
/// record and it is never offered again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Optimistic,
    Confirmed,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub local_id: LocalId,
    pub payload: RecordPayload,
    pub created_at: UnixTimeMs,
    pub sync: SyncState,
    /// Failed delivery attempts.
    pub attempts: u32,
    pub confirmed_at: Option<UnixTimeMs>,
}

impl QueueRecord {
    #[must_use]
    pub fn new(local_id: LocalId, payload: RecordPayload, created_at: UnixTimeMs) -> Self {
        Self {
            local_id,
            payload,
            created_at,
            sync: SyncState::Pending,
            attempts: 0,
            confirmed_at: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self.payload {
            RecordPayload::Payment(_) => RecordKind::Payment,
            RecordPayload::Complaint(_) => RecordKind::Complaint,
        }
    }

    /// The boolean the UI shows.
    #[must_use]
    pub fn synced(&self) -> bool {
        matches!(self.sync, SyncState::Optimistic | SyncState::Confirmed)
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self.sync, SyncState::Confirmed)
    }

    /// Still owed to the back office.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        matches!(self.sync, SyncState::Pending | SyncState::Optimistic)
    }

    fn key(id: &LocalId) -> Result<KvKey, QueueError> {
        Ok(KvKey::new(KeyNamespace::Queue, id.as_str())?)
    }

    fn encode(&self) -> Result<Vec<u8>, QueueError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub confirmed: Vec<LocalId>,
    pub failed: Vec<(LocalId, UplinkError)>,
    /// Refused by the back office; final, never retried.
    pub rejected: Vec<(LocalId, UplinkError)>,
    /// Claimed but never submitted because delivery went offline part way
    /// through.
    pub released: usize,
    /// Pending count after the pass.
    pub pending: usize,
}

impl DrainReport {
    pub fn is_noop(&self) -> bool {
        self.confirmed.is_empty() && self.failed.is_empty() && self.rejected.is_empty() && self.released == 0
    }

    /// Nothing left that a retry could change. Rejections count as settled.
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty() && self.released == 0
    }
}

struct Slot {
    record: QueueRecord,
    in_flight: bool,
}

struct QueueState {
    slots: HashMap<LocalId, Slot>,
    /// Creation order; deliveries go oldest first.
    order: Vec<LocalId>,
    pending: usize,
    compacted: LruCache<LocalId, UnixTimeMs>,
    /// Records whose current state has not been handed out as a write.
    dirty: HashSet<LocalId>,
    /// Compacted records whose delete has not been handed out.
    removed: Vec<LocalId>,
    meta_dirty: bool,
    /// Writes refused with a retryable error; handed out again at the next
    /// claim.
    retry: HashSet<LocalId>,
    meta_retry: bool,
    quarantined: Vec<String>,
    capacity: usize,
}

impl QueueState {
    fn undelivered(&self) -> usize {
        self.slots.values().filter(|s| s.record.is_deliverable()).count()
    }

    fn requeue_failed_writes(&mut self) {
        for id in std::mem::take(&mut self.retry) {
            if self.slots.contains_key(&id) {
                self.dirty.insert(id);
            } else {
                self.removed.push(id);
            }
        }
        if std::mem::take(&mut self.meta_retry) {
            self.meta_dirty = true;
        }
    }

    fn sort_order(&mut self) {
        let slots = &self.slots;
        self.order
            .sort_by_cached_key(|id| slots.get(id).map(|s| (s.record.created_at, id.clone())));
    }

    fn encode_compacted(&self) -> Result<StoreOperation, QueueError> {
        let ids: Vec<&LocalId> = self.compacted.iter().map(|(id, _)| id).collect();
        let mut bytes = Vec::new();
        ciborium::into_writer(&ids, &mut bytes)?;
        Ok(StoreOperation::Set {
            key: KvKey::new(KeyNamespace::Meta, COMPACTED_META_KEY)?,
            value: bytes,
        })
    }
}

pub struct OfflineQueue {
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OfflineQueue")
            .field("records", &state.slots.len())
            .field("pending", &state.pending)
            .field("dirty", &state.dirty.len())
            .finish()
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::with_capacity(MAX_QUEUE_RECORDS)
    }
}

impl OfflineQueue {
    /// Capacity bounds undelivered records only; confirmed ones are waiting
    /// for compaction and do not count.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                slots: HashMap::new(),
                order: Vec::new(),
                pending: 0,
                compacted: LruCache::new(NonZeroUsize::new(COMPACTED_MEMORY).unwrap_or(NonZeroUsize::MIN)),
                dirty: HashSet::new(),
                removed: Vec::new(),
                meta_dirty: false,
                retry: HashSet::new(),
                meta_retry: false,
                quarantined: Vec::new(),
                capacity,
            }),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity;
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing inside the lock can leave the state half-updated, so a
        // poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuilds the index from what the store held at boot. Records that do
    /// not decode are quarantined: logged, left in storage, never delivered.
    /// Anything enqueued before the load finished is kept. Returns how many
    /// records were restored.
    #[instrument(skip_all, fields(records = stored.records.len()))]
    pub fn restore(&self, stored: StoredQueue) -> usize {
        let mut state = self.lock();

        if let Some((_, bytes)) = stored.meta.iter().find(|(key, _)| key == COMPACTED_META_KEY) {
            match ciborium::from_reader::<Vec<LocalId>, _>(&bytes[..]) {
                // Stored most recent first; replay oldest first to keep that order.
                Ok(ids) => {
                    for id in ids.into_iter().rev() {
                        if !state.compacted.contains(&id) {
                            state.compacted.put(id, UnixTimeMs(0));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "ignoring unreadable compacted-id list"),
            }
        }

        let mut restored = 0;
        for (key, bytes) in stored.records {
            match QueueRecord::decode(&bytes) {
                Ok(record) if record.local_id.as_str() == key => {
                    let id = record.local_id.clone();
                    if state.slots.contains_key(&id) {
                        continue;
                    }
                    if state.compacted.contains(&id) {
                        // Delivered and compacted, but the delete never landed.
                        state.removed.push(id);
                        continue;
                    }
                    if record.sync == SyncState::Pending {
                        state.pending += 1;
                    }
                    state.order.push(id.clone());
                    state.slots.insert(
                        id,
                        Slot {
                            record,
                            in_flight: false,
                        },
                    );
                    restored += 1;
                }
                Ok(record) => {
                    warn!(key = %key, local_id = %record.local_id, "quarantining record stored under the wrong key");
                    state.quarantined.push(key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "quarantining undecodable record");
                    state.quarantined.push(key);
                }
            }
        }
        state.sort_order();

        if !state.quarantined.is_empty() {
            warn!("Loaded with {} quarantined records", state.quarantined.len());
        }
        info!(
            restored,
            records = state.slots.len(),
            pending = state.pending,
            quarantined = state.quarantined.len(),
            "offline queue restored"
        );
        restored
    }

    /// Appends a record. Its status is fixed here from the connectivity seen
    /// at call time.
    #[instrument(skip(self, record), fields(local_id = %record.local_id, kind = ?record.kind()))]
    pub fn enqueue(&self, mut record: QueueRecord, online: bool) -> Result<QueueRecord, QueueError> {
        let mut state = self.lock();

        if state.slots.contains_key(&record.local_id) || state.compacted.contains(&record.local_id) {
            return Err(QueueError::Duplicate(record.local_id));
        }
        if state.undelivered() >= state.capacity {
            return Err(QueueError::Full(state.capacity));
        }

        record.sync = if online {
            SyncState::Optimistic
        } else {
            SyncState::Pending
        };
        record.attempts = 0;
        record.confirmed_at = None;
        // Reject unencodable records before they are counted.
        record.encode()?;

        let id = record.local_id.clone();
        if record.sync == SyncState::Pending {
            state.pending += 1;
        }
        state.order.push(id.clone());
        state.slots.insert(
            id.clone(),
            Slot {
                record: record.clone(),
                in_flight: false,
            },
        );
        state.dirty.insert(id);

        info!(sync = ?record.sync, pending = state.pending, "record queued");
        Ok(record)
    }

    /// Records not yet confirmed and reported as unsynced. O(1).
    pub fn count(&self) -> usize {
        self.lock().pending
    }

    /// Pending plus optimistic: everything still owed to the network.
    pub fn undelivered(&self) -> usize {
        self.lock().undelivered()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn get(&self, id: &LocalId) -> Option<QueueRecord> {
        self.lock().slots.get(id).map(|s| s.record.clone())
    }

    /// `Some(true)` for compacted records too; `None` if never seen.
    pub fn synced(&self, id: &LocalId) -> Option<bool> {
        let state = self.lock();
        match state.slots.get(id) {
            Some(slot) => Some(slot.record.synced()),
            None => state.compacted.contains(id).then_some(true),
        }
    }

    /// Records in creation order.
    pub fn records(&self) -> Vec<QueueRecord> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.slots.get(id))
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn rejected(&self) -> Vec<QueueRecord> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.slots.get(id))
            .filter(|s| s.record.sync == SyncState::Rejected)
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn quarantined(&self) -> Vec<String> {
        self.lock().quarantined.clone()
    }

    /// Marks every deliverable record not already in flight as claimed and
    /// returns them oldest first. Each one must come back through
    /// [`settle`](Self::settle) or [`release`](Self::release).
    pub fn claim(&self) -> Vec<QueueRecord> {
        let mut state = self.lock();
        state.requeue_failed_writes();
        let QueueState { order, slots, .. } = &mut *state;
        order
            .iter()
            .filter_map(|id| {
                let slot = slots.get_mut(id)?;
                if slot.in_flight || !slot.record.is_deliverable() {
                    return None;
                }
                slot.in_flight = true;
                Some(slot.record.clone())
            })
            .collect()
    }

    /// Applies one delivery result to a claimed record. A result for a
    /// record that is not in flight is ignored.
    pub fn settle(&self, id: &LocalId, result: Result<(), UplinkError>, now: UnixTimeMs, report: &mut DrainReport) {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(id).filter(|s| s.in_flight) else {
            debug!(local_id = %id, "settlement for unclaimed record ignored");
            return;
        };
        slot.in_flight = false;
        let was_pending = slot.record.sync == SyncState::Pending;

        match result {
            Ok(()) => {
                slot.record.sync = SyncState::Confirmed;
                slot.record.confirmed_at = Some(now);
                if was_pending {
                    state.pending -= 1;
                }
                report.confirmed.push(id.clone());
            }
            Err(e) if !e.is_retryable() => {
                slot.record.attempts = slot.record.attempts.saturating_add(1);
                slot.record.sync = SyncState::Rejected;
                if was_pending {
                    state.pending -= 1;
                }
                warn!(local_id = %id, error = %e, "record rejected by the back office, not retrying");
                report.rejected.push((id.clone(), e));
            }
            Err(e) => {
                slot.record.attempts = slot.record.attempts.saturating_add(1);
                // A failed optimistic record is no longer reported synced.
                slot.record.sync = SyncState::Pending;
                if !was_pending {
                    state.pending += 1;
                }
                report.failed.push((id.clone(), e));
            }
        }
        state.dirty.insert(id.clone());
        report.pending = state.pending;
    }

    /// Hands claimed records back untouched.
    pub fn release<'a>(&self, ids: impl IntoIterator<Item = &'a LocalId>, report: &mut DrainReport) {
        let mut state = self.lock();
        for id in ids {
            if let Some(slot) = state.slots.get_mut(id).filter(|s| s.in_flight) {
                slot.in_flight = false;
                report.released += 1;
            }
        }
        report.pending = state.pending;
    }

    /// Delivers every deliverable record not already claimed elsewhere,
    /// oldest first, through `submit`. Calling it with nothing to deliver is
    /// a no-op. An `Offline` failure stops the pass; later records are
    /// released untouched.
    #[instrument(skip(self, submit))]
    pub fn drain<F>(&self, now: UnixTimeMs, mut submit: F) -> DrainReport
    where
        F: FnMut(&QueueRecord) -> Result<(), UplinkError>,
    {
        let claimed = self.claim();
        let mut report = DrainReport {
            pending: self.count(),
            ..DrainReport::default()
        };
        if claimed.is_empty() {
            debug!("nothing to drain");
            return report;
        }

        let mut records = claimed.iter();
        for record in records.by_ref() {
            let result = submit(record);
            let offline = matches!(result, Err(UplinkError::Offline));
            self.settle(&record.local_id, result, now, &mut report);
            if offline {
                break;
            }
        }
        self.release(records.map(|r| &r.local_id), &mut report);

        info!(
            confirmed = report.confirmed.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            released = report.released,
            pending = report.pending,
            "drain finished"
        );
        report
    }

    /// Drops confirmed records and remembers their ids so a replay is still
    /// rejected. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn compact(&self) -> usize {
        let mut state = self.lock();
        let done: HashSet<LocalId> = state
            .slots
            .iter()
            .filter(|(_, s)| s.record.is_confirmed() && !s.in_flight)
            .map(|(id, _)| id.clone())
            .collect();
        if done.is_empty() {
            return 0;
        }

        for id in &done {
            let confirmed_at = state
                .slots
                .remove(id)
                .and_then(|s| s.record.confirmed_at)
                .unwrap_or_default();
            state.dirty.remove(id);
            state.compacted.put(id.clone(), confirmed_at);
            state.removed.push(id.clone());
        }
        state.order.retain(|id| !done.contains(id));
        state.meta_dirty = true;

        info!(removed = done.len(), remaining = state.slots.len(), "queue compacted");
        done.len()
    }

    /// Store operations for everything changed since the last call, in
    /// creation order.
    pub fn take_writes(&self) -> Vec<StoreOperation> {
        let mut state = self.lock();
        let mut writes = Vec::new();

        if !state.dirty.is_empty() {
            let dirty = std::mem::take(&mut state.dirty);
            for id in state.order.iter().filter(|id| dirty.contains(*id)) {
                let Some(slot) = state.slots.get(id) else {
                    continue;
                };
                let write = QueueRecord::key(id).and_then(|key| {
                    Ok(StoreOperation::Set {
                        key,
                        value: slot.record.encode()?,
                    })
                });
                match write {
                    Ok(op) => writes.push(op),
                    Err(e) => error!(local_id = %id, error = %e, "record cannot be written, keeping it in memory"),
                }
            }
        }

        for id in std::mem::take(&mut state.removed) {
            match QueueRecord::key(&id) {
                Ok(key) => writes.push(StoreOperation::Remove { key }),
                Err(e) => error!(local_id = %id, error = %e, "compacted record cannot be deleted"),
            }
        }

        if std::mem::take(&mut state.meta_dirty) {
            match state.encode_compacted() {
                Ok(op) => writes.push(op),
                Err(e) => error!(error = %e, "compacted-id list cannot be written"),
            }
        }
        writes
    }

    /// The store refused a write. Retryable failures are handed out again
    /// at the next claim; anything else is logged and the change lives in
    /// memory only.
    pub fn write_failed(&self, key: &KvKey, error: &KvError) {
        if !error.is_retryable() {
            error!(key = %key.raw(), error = %error, "queue write failed, change kept in memory only");
            return;
        }
        warn!(key = %key.raw(), error = %error, "queue write failed, retrying before the next delivery");
        let mut state = self.lock();
        match key.namespace() {
            KeyNamespace::Queue => {
                state.retry.insert(LocalId::new(key.key()));
            }
            KeyNamespace::Meta => state.meta_retry = true,
        }
    }
}
