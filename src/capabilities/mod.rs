//! What the engine asks of the outside world. Timers, delivery, storage,
//! rendering and receipts are Crux capabilities the shell carries out; the
//! clock, the id source and the mock data sources are plain collaborators
//! held in the model so tests can swap them for deterministic doubles.

mod identity;
mod kv;
mod lookup;
mod receipt;
mod store;
mod timer;
mod uplink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use crux_core::render::Render;

use crate::app::App;
use crate::event::Event;
use crate::model::{LocalId, UnixTimeMs};

pub use self::identity::{DemoIdentityProvider, IdentityProvider};
pub use self::kv::{
    KeyNamespace, KvError, KvKey, MemoryStorage, QueueStorage, StorageErrorCode, MAX_VALUE_SIZE,
};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::kv::SqliteStorage;
pub use self::lookup::{BillLookup, SynthesizingLookup};
pub use self::receipt::{Receipt, ReceiptOperation};
pub use self::store::{serve, Store, StoreOperation, StoreOutput, StoredQueue};
#[cfg(test)]
pub(crate) use self::timer::ManualScheduler;
pub use self::timer::{Scheduler, Timer, TimerOperation, TimerOutput};
pub use self::uplink::{
    BackOffice, RecordingBackOffice, SimulatedBackOffice, Uplink, UplinkError, UplinkOperation,
};

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
    pub timer: Timer<Event>,
    pub uplink: Uplink<Event>,
    pub store: Store<Event>,
    pub receipt: Receipt<Event>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Virtual clock shared between a test and the model it drives. Only
/// moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self(Arc::new(AtomicU64::new(start.0)))
    }

    /// Never moves backwards.
    pub fn advance_to(&self, to: UnixTimeMs) {
        self.0.fetch_max(to.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.0.load(Ordering::SeqCst))
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> LocalId;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self) -> LocalId {
        LocalId::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Deterministic ids: `<prefix>-0001`, `<prefix>-0002`, ...
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> LocalId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        LocalId::new(format!("{}-{n:04}", self.prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_unique_and_ordered() {
        let ids = SequentialIds::new("t");
        assert_eq!(ids.next_id().as_str(), "t-0001");
        assert_eq!(ids.next_id().as_str(), "t-0002");
    }

    #[test]
    fn uuid_ids_do_not_repeat() {
        let ids = UuidIds;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn manual_clock_is_shared_and_monotonic() {
        let clock = ManualClock::new(UnixTimeMs(100));
        let seen_by_model = clock.clone();
        clock.advance_to(UnixTimeMs(250));
        clock.advance_to(UnixTimeMs(200));
        assert_eq!(seen_by_model.now(), UnixTimeMs(250));
    }
}
