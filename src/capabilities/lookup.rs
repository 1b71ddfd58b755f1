use std::collections::HashMap;

use crate::model::{ConsumerId, ServiceType};
use crate::workflow::payment::Bill;

/// External bill lookup. Fail-open: every non-empty consumer id resolves
/// to some bill so the demo flow never dead-ends.
pub trait BillLookup {
    fn lookup(&self, service: ServiceType, consumer_id: &ConsumerId) -> Bill;
}

#[derive(Debug, Default)]
pub struct SynthesizingLookup {
    fixtures: HashMap<(ServiceType, String), Bill>,
}

impl SynthesizingLookup {
    const MIN_AMOUNT_PAISE: u64 = 150_00;
    const AMOUNT_SPREAD_PAISE: u64 = 4_850_00;

    pub fn with_fixtures() -> Self {
        let mut lookup = Self::default();
        lookup.insert(Bill {
            consumer_id: ConsumerId::new("PSEB-123456"),
            consumer_name: "Harpreet Singh".into(),
            service: ServiceType::Electricity,
            amount_paise: 1_245_50,
            units: Some(312),
            due_date: "2026-11-05".into(),
            synthesized: false,
        });
        lookup.insert(Bill {
            consumer_id: ConsumerId::new("WTR-88021"),
            consumer_name: "Meena Sharma".into(),
            service: ServiceType::Water,
            amount_paise: 380_00,
            units: None,
            due_date: "2026-11-12".into(),
            synthesized: false,
        });
        lookup
    }

    pub fn insert(&mut self, bill: Bill) {
        self.fixtures
            .insert((bill.service, bill.consumer_id.as_str().to_string()), bill);
    }

    /// Plausible, stable bill for an unknown consumer: same id, same amount.
    fn synthesize(service: ServiceType, consumer_id: &ConsumerId) -> Bill {
        let digest = blake3::hash(format!("{service}:{consumer_id}").as_bytes());
        let bytes = digest.as_bytes();
        let seed = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        // Whole rupees keep the synthetic amounts readable on a receipt.
        let amount_paise =
            Self::MIN_AMOUNT_PAISE + (seed % Self::AMOUNT_SPREAD_PAISE) / 100 * 100;
        let units = matches!(service, ServiceType::Electricity | ServiceType::Water)
            .then(|| 50 + (seed >> 32) as u32 % 450);

        Bill {
            consumer_id: consumer_id.clone(),
            consumer_name: "Registered Consumer".into(),
            service,
            amount_paise,
            units,
            due_date: "2026-11-30".into(),
            synthesized: true,
        }
    }
}

impl BillLookup for SynthesizingLookup {
    fn lookup(&self, service: ServiceType, consumer_id: &ConsumerId) -> Bill {
        self.fixtures
            .get(&(service, consumer_id.as_str().to_string()))
            .cloned()
            .unwrap_or_else(|| Self::synthesize(service, consumer_id))
    }
}
