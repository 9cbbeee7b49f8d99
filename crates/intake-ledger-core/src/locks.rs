use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{column_key, CounterKey};

/// Mutual-exclusion registry shared by every component touching one store.
///
/// Header extension is serialized per table and allocation per
/// (table, counter kind). Each counter slot also remembers the highest
/// identifier this process has issued for its key, which keeps allocation
/// unique even while the counter store is unreachable.
#[derive(Debug, Default)]
pub struct LedgerLocks {
    headers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    counters: Mutex<HashMap<String, Arc<Mutex<u64>>>>,
}

impl LedgerLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn header_lock(&self, table: &str) -> Arc<Mutex<()>> {
        let mut headers = self.headers.lock();
        Arc::clone(headers.entry(column_key(table)).or_default())
    }

    pub(crate) fn counter_slot(&self, key: &CounterKey) -> Arc<Mutex<u64>> {
        let mut counters = self.counters.lock();
        let slot_key = format!("{}:{}", column_key(&key.table), column_key(&key.counter));
        Arc::clone(counters.entry(slot_key).or_default())
    }
}
