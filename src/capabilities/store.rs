use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::kv::{KeyNamespace, KvError, KvKey, QueueStorage, StorageErrorCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreOperation {
    /// Everything the queue keeps, read once at boot.
    Load,
    Set { key: KvKey, value: Vec<u8> },
    Remove { key: KvKey },
}

impl StoreOperation {
    #[must_use]
    pub fn key(&self) -> Option<&KvKey> {
        match self {
            StoreOperation::Load => None,
            StoreOperation::Set { key, .. } | StoreOperation::Remove { key } => Some(key),
        }
    }
}

/// Raw contents of both namespaces, keys without their prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredQueue {
    pub records: Vec<(String, Vec<u8>)>,
    pub meta: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreOutput {
    Loaded(StoredQueue),
    Written,
    Failed(KvError),
}

impl Operation for StoreOperation {
    type Output = StoreOutput;
}

/// Durable storage under the offline queue. The engine never blocks on it:
/// a load answers with an event, and writes only report back when they fail.
pub struct Store<Ev> {
    context: CapabilityContext<StoreOperation, Ev>,
}

impl<Ev> Capability<Ev> for Store<Ev> {
    type Operation = StoreOperation;
    type MappedSelf<MappedEv> = Store<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Store::new(self.context.map_event(f))
    }
}

impl<Ev> Store<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<StoreOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn load<F>(&self, callback: F)
    where
        F: FnOnce(Result<StoredQueue, KvError>) -> Ev + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let result = match ctx.request_from_shell(StoreOperation::Load).await {
                StoreOutput::Loaded(stored) => Ok(stored),
                StoreOutput::Failed(e) => Err(e),
                StoreOutput::Written => Err(KvError::storage(
                    StorageErrorCode::Unknown,
                    "load answered as a write",
                )),
            };
            ctx.update_app(callback(result));
        });
    }

    pub fn write<F>(&self, operation: StoreOperation, on_failure: F)
    where
        F: FnOnce(KvKey, KvError) -> Ev + Send + 'static,
    {
        let Some(key) = operation.key().cloned() else {
            return;
        };
        let ctx = self.context.clone();
        self.context.spawn(async move {
            if let StoreOutput::Failed(error) = ctx.request_from_shell(operation).await {
                ctx.update_app(on_failure(key, error));
            }
        });
    }
}

/// Shell side: carries out one operation against a backend.
pub fn serve(storage: &mut dyn QueueStorage, operation: &StoreOperation) -> StoreOutput {
    let result = match operation {
        StoreOperation::Load => {
            let loaded = storage
                .scan(KeyNamespace::Queue)
                .and_then(|records| Ok((records, storage.scan(KeyNamespace::Meta)?)));
            return match loaded {
                Ok((records, meta)) => StoreOutput::Loaded(StoredQueue { records, meta }),
                Err(e) => StoreOutput::Failed(e),
            };
        }
        StoreOperation::Set { key, value } => storage.set(key, value),
        StoreOperation::Remove { key } => storage.remove(key).map(|_| ()),
    };
    trace!(key = ?operation.key().map(KvKey::raw), ok = result.is_ok(), "store write");
    match result {
        Ok(()) => StoreOutput::Written,
        Err(e) => StoreOutput::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryStorage;

    fn key(k: &str) -> KvKey {
        KvKey::new(KeyNamespace::Queue, k).unwrap()
    }

    #[test]
    fn serve_writes_then_loads_both_namespaces() {
        let mut storage = MemoryStorage::new();
        let set = StoreOperation::Set {
            key: key("a"),
            value: vec![1, 2],
        };
        assert_eq!(serve(&mut storage, &set), StoreOutput::Written);
        let meta = StoreOperation::Set {
            key: KvKey::new(KeyNamespace::Meta, "compacted").unwrap(),
            value: vec![9],
        };
        serve(&mut storage, &meta);

        let StoreOutput::Loaded(stored) = serve(&mut storage, &StoreOperation::Load) else {
            panic!("expected a load result");
        };
        assert_eq!(stored.records, vec![("a".to_string(), vec![1, 2])]);
        assert_eq!(stored.meta, vec![("compacted".to_string(), vec![9])]);

        assert_eq!(serve(&mut storage, &StoreOperation::Remove { key: key("a") }), StoreOutput::Written);
        assert!(storage.get(&key("a")).unwrap().is_none());
    }

    #[test]
    fn oversized_write_reports_failure() {
        let mut storage = MemoryStorage::new();
        let op = StoreOperation::Set {
            key: key("big"),
            value: vec![0; crate::capabilities::MAX_VALUE_SIZE + 1],
        };
        assert!(matches!(
            serve(&mut storage, &op),
            StoreOutput::Failed(KvError::ValueTooLarge { .. })
        ));
    }
}
