use std::collections::HashSet;
use std::time::Duration;

use kiosk_core::capabilities::{MemoryStorage, QueueStorage};
use kiosk_core::config::SyncConfig;
use kiosk_core::event::{ActivityKind, ComplaintEvent, Path, PaymentEvent, SessionEvent};
use kiosk_core::model::{LocalId, Route, ServiceType};
use kiosk_core::offline_store::FileStorage;
use kiosk_core::outbox::{QueueError, RecordPayload, SyncState};
use kiosk_core::sync::SyncPhase;
use kiosk_core::testing::Simulator;
use kiosk_core::workflow::payment::PaymentMethod;
use kiosk_core::{Event, KioskConfig, QueueRecord};

struct Kiosk {
    sim: Simulator,
}

impl Kiosk {
    fn config() -> KioskConfig {
        KioskConfig {
            sync: SyncConfig {
                jitter_max_ms: 0,
                ..Default::default()
            },
            ..KioskConfig::default()
        }
    }

    fn boot(config: KioskConfig, storage: Box<dyn QueueStorage>, online: bool) -> Self {
        let mut sim = Simulator::new(config, storage);
        sim.send(Event::Boot { online });
        Self { sim }
    }

    fn with_storage(storage: Box<dyn QueueStorage>, online: bool) -> Self {
        Self::boot(Self::config(), storage, online)
    }

    fn new(online: bool) -> Self {
        Self::with_storage(Box::new(MemoryStorage::new()), online)
    }

    fn with_capacity(capacity: usize, online: bool) -> Self {
        let mut config = Self::config();
        config.storage.capacity = capacity;
        Self::boot(config, Box::new(MemoryStorage::new()), online)
    }

    fn tap(&mut self, event: Event) -> Vec<QueueRecord> {
        self.sim.send(Event::Activity(ActivityKind::Touch));
        self.sim.send(event)
    }

    fn wait(&mut self, by: Duration) {
        self.sim.advance(by);
    }

    fn set_online(&mut self, online: bool) {
        self.sim.send(Event::ConnectivityChanged { online });
    }

    /// Files one complaint and returns its receipt, if one was issued.
    fn try_file_complaint(&mut self, text: &str) -> Option<QueueRecord> {
        self.tap(Event::Session(SessionEvent::Navigate(Route::Complaint)));
        self.tap(Event::Complaint(ComplaintEvent::Describe(text.into())));
        self.tap(Event::Complaint(ComplaintEvent::Submit)).pop()
    }

    fn file_complaint(&mut self, text: &str) -> QueueRecord {
        self.try_file_complaint(text).expect("complaint filed")
    }

    fn pay_bill(&mut self, consumer: &str) -> QueueRecord {
        self.tap(Event::Session(SessionEvent::Navigate(Route::Bill(ServiceType::Gas))));
        self.tap(Event::Payment(PaymentEvent::SubmitConsumerId(consumer.into())));
        self.tap(Event::Payment(PaymentEvent::ConfirmBill));
        self.tap(Event::Payment(PaymentEvent::ChooseMethod(PaymentMethod::Upi)));
        self.wait(Duration::from_secs(3));
        self.sim.model.last_receipt.clone().expect("payment filed")
    }

    fn enter_as_guest(&mut self) {
        self.tap(Event::Session(SessionEvent::Start));
        self.tap(Event::Session(SessionEvent::SelectPath(Path::Guest)));
    }

    fn pending(&self) -> usize {
        self.sim.model.queue.count()
    }
}

fn assert_delivered_once(kiosk: &Kiosk, expected: &[LocalId]) {
    let submitted = kiosk.sim.back_office.submitted();
    let unique: HashSet<_> = submitted.iter().collect();
    assert_eq!(unique.len(), submitted.len(), "duplicate submission: {submitted:?}");
    for id in expected {
        assert!(unique.contains(id), "{id} never delivered");
        assert_eq!(kiosk.sim.model.queue.synced(id), Some(true));
    }
}

#[test]
fn offline_records_sync_after_reconnect() {
    let mut kiosk = Kiosk::new(false);
    kiosk.enter_as_guest();
    let mut ids = Vec::new();
    for text in ["power cut since noon", "pothole near school", "drain overflow on main road"] {
        ids.push(kiosk.file_complaint(text).local_id);
    }
    ids.push(kiosk.pay_bill("GAS-4410").local_id);

    assert_eq!(kiosk.pending(), 4);
    assert!(kiosk.sim.back_office.submitted().is_empty());

    kiosk.set_online(true);
    assert!(matches!(kiosk.sim.model.reconciler.phase(), SyncPhase::Syncing { snapshot: 4, .. }));
    kiosk.wait(Duration::from_secs(5));

    assert_eq!(kiosk.pending(), 0);
    assert!(kiosk.sim.model.reconciler.is_idle());
    assert_delivered_once(&kiosk, &ids);
    // Oldest first.
    assert_eq!(kiosk.sim.back_office.submitted(), &ids[..]);
}

#[test]
fn repeated_reconnects_never_double_submit() {
    let mut kiosk = Kiosk::new(false);
    kiosk.enter_as_guest();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(kiosk.file_complaint(&format!("garbage pile #{i}")).local_id);
    }

    kiosk.set_online(true);
    kiosk.wait(Duration::from_millis(600));
    // Second online report while syncing is ignored.
    kiosk.set_online(true);
    kiosk.set_online(false);
    kiosk.wait(Duration::from_secs(10));
    assert_eq!(kiosk.pending(), 5);
    assert!(kiosk.sim.back_office.submitted().is_empty());

    for _ in 0..3 {
        kiosk.set_online(true);
        kiosk.wait(Duration::from_secs(5));
    }
    assert_eq!(kiosk.pending(), 0);
    assert_eq!(kiosk.sim.back_office.submitted().len(), 5);
    assert_delivered_once(&kiosk, &ids);
}

#[test]
fn online_filing_is_delivered_without_a_run() {
    let mut kiosk = Kiosk::new(true);
    kiosk.enter_as_guest();
    let record = kiosk.file_complaint("street light not working");

    assert!(record.synced());
    assert!(kiosk.sim.model.reconciler.is_idle());
    assert_eq!(kiosk.sim.back_office.submitted(), &[record.local_id.clone()]);
    assert_eq!(kiosk.sim.view().pending_count, 0);
}

#[test]
fn always_online_kiosk_never_fills_its_queue() {
    let mut kiosk = Kiosk::with_capacity(3, true);
    kiosk.enter_as_guest();

    let filed: Vec<LocalId> = (0..5)
        .map(|i| kiosk.file_complaint(&format!("pothole on ward {i} road")).local_id)
        .collect();

    assert_eq!(kiosk.sim.receipts().len(), 5);
    assert_delivered_once(&kiosk, &filed);
    assert!(kiosk.sim.model.queue.is_empty());
}

#[test]
fn full_queue_issues_no_receipt() {
    let mut kiosk = Kiosk::with_capacity(1, false);
    kiosk.enter_as_guest();
    kiosk.file_complaint("water pipe burst");

    assert!(kiosk.try_file_complaint("garbage not collected").is_none());
    let view = kiosk.sim.view();
    let step = view.step.expect("complaint step");
    assert_eq!(step.step, "details");
    assert_eq!(step.message.as_deref(), Some("Could not save this request, please try again"));
    assert!(view.receipt.is_none());
    assert_eq!(kiosk.pending(), 1);

    // Once the backlog is delivered the same details can be submitted again.
    kiosk.set_online(true);
    kiosk.wait(Duration::from_secs(5));
    let receipt = kiosk.tap(Event::Complaint(ComplaintEvent::Submit)).pop();
    assert!(receipt.is_some());
    assert_eq!(kiosk.sim.view().step.map(|s| s.step), Some("done"));
}

#[test]
fn failed_delivery_backs_off_and_retries() {
    let mut kiosk = Kiosk::new(false);
    kiosk.enter_as_guest();
    let id = kiosk.file_complaint("no water in the tap").local_id;

    kiosk.sim.back_office.fail_next(2);
    kiosk.set_online(true);
    kiosk.wait(Duration::from_millis(2_500));
    assert!(matches!(
        kiosk.sim.model.reconciler.phase(),
        SyncPhase::Backoff { failures: 1, delay_ms: 1_000 }
    ));
    assert_eq!(kiosk.pending(), 1);

    kiosk.wait(Duration::from_secs(30));
    assert_eq!(kiosk.pending(), 0);
    assert!(kiosk.sim.model.reconciler.is_idle());
    assert_delivered_once(&kiosk, &[id]);
}

#[test]
fn rejected_record_is_not_retried() {
    let mut kiosk = Kiosk::new(false);
    kiosk.enter_as_guest();
    let rejected = kiosk.file_complaint("stray cattle on highway").local_id;
    let accepted = kiosk.file_complaint("broken footpath tiles").local_id;

    kiosk.sim.back_office.reject_next(1, "unknown ward");
    kiosk.set_online(true);
    kiosk.wait(Duration::from_millis(2_500));
    assert!(kiosk.sim.model.reconciler.is_idle());

    kiosk.wait(Duration::from_secs(120));
    kiosk.set_online(false);
    kiosk.set_online(true);
    kiosk.wait(Duration::from_secs(5));

    assert_eq!(kiosk.sim.back_office.attempts(), 2);
    assert_delivered_once(&kiosk, &[accepted]);
    let record = kiosk.sim.model.queue.get(&rejected).expect("kept for the operator");
    assert_eq!(record.sync, SyncState::Rejected);
    assert_eq!(record.attempts, 1);
    assert_eq!(kiosk.pending(), 0);
    assert_eq!(kiosk.sim.view().rejected_count, 1);
}

#[test]
fn going_offline_during_backoff_stops_retries() {
    let mut kiosk = Kiosk::new(false);
    kiosk.enter_as_guest();
    kiosk.file_complaint("transformer sparking");

    kiosk.sim.back_office.fail_next(1);
    kiosk.set_online(true);
    kiosk.wait(Duration::from_millis(2_600));
    assert!(matches!(kiosk.sim.model.reconciler.phase(), SyncPhase::Backoff { .. }));

    kiosk.set_online(false);
    kiosk.wait(Duration::from_secs(120));
    assert!(kiosk.sim.model.reconciler.is_idle());
    assert!(kiosk.sim.back_office.submitted().is_empty());
    assert_eq!(kiosk.pending(), 1);
}

#[test]
fn delivered_records_cannot_be_requeued() {
    let mut kiosk = Kiosk::new(true);
    kiosk.enter_as_guest();
    let record = kiosk.file_complaint("streetlight flickering");

    let replay = QueueRecord::new(record.local_id.clone(), record.payload.clone(), record.created_at);
    assert!(matches!(
        kiosk.sim.model.queue.enqueue(replay, true),
        Err(QueueError::Duplicate(id)) if id == record.local_id
    ));
}

#[test]
fn pending_records_survive_restart_with_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.kq");

    let filed = {
        let mut kiosk = Kiosk::with_storage(Box::new(FileStorage::open(&path).unwrap()), false);
        kiosk.enter_as_guest();
        let a = kiosk.file_complaint("road caved in").local_id;
        let b = kiosk.pay_bill("GAS-0099").local_id;
        vec![a, b]
    };

    let mut kiosk = Kiosk::with_storage(Box::new(FileStorage::open(&path).unwrap()), false);
    assert_eq!(kiosk.pending(), 2);
    let kinds: Vec<_> = kiosk
        .sim
        .model
        .queue
        .records()
        .into_iter()
        .map(|r| matches!(r.payload, RecordPayload::Payment(_)))
        .collect();
    assert_eq!(kinds, vec![false, true]);

    kiosk.set_online(true);
    kiosk.wait(Duration::from_secs(5));
    assert_eq!(kiosk.pending(), 0);
    assert_delivered_once(&kiosk, &filed);

    // Compaction reached the disk too.
    let kiosk = Kiosk::with_storage(Box::new(FileStorage::open(&path).unwrap()), false);
    assert!(kiosk.sim.model.queue.is_empty());
    assert_eq!(kiosk.sim.model.queue.synced(&filed[0]), Some(true));
}

#[cfg(feature = "sqlite")]
#[test]
fn boot_online_with_sqlite_backlog_starts_sync() {
    use kiosk_core::config::{StorageBackend, StorageConfig};

    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        backend: StorageBackend::Sqlite,
        path: Some(dir.path().join("queue.db")),
        ..StorageConfig::default()
    };

    let id = {
        let mut kiosk = Kiosk::with_storage(storage.open().unwrap(), false);
        kiosk.enter_as_guest();
        kiosk.file_complaint("sewage overflow").local_id
    };

    let mut kiosk = Kiosk::with_storage(storage.open().unwrap(), true);
    assert!(matches!(kiosk.sim.model.reconciler.phase(), SyncPhase::Syncing { snapshot: 1, .. }));
    kiosk.wait(Duration::from_secs(5));
    assert_delivered_once(&kiosk, &[id]);
}
