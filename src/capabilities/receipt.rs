use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::outbox::QueueRecord;

/// A workflow reached its terminal step and its record is queued; the shell
/// renders or prints the receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptOperation {
    pub record: QueueRecord,
}

impl Operation for ReceiptOperation {
    type Output = ();
}

pub struct Receipt<Ev> {
    context: CapabilityContext<ReceiptOperation, Ev>,
}

impl<Ev> Capability<Ev> for Receipt<Ev> {
    type Operation = ReceiptOperation;
    type MappedSelf<MappedEv> = Receipt<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Receipt::new(self.context.map_event(f))
    }
}

impl<Ev> Receipt<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<ReceiptOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn issue(&self, record: QueueRecord) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(ReceiptOperation { record }).await;
        });
    }
}
