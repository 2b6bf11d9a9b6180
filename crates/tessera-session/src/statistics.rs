//! Per-session persistence statistics.

use serde::Serialize;
use std::collections::BTreeMap;

/// Counts for one entity name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStatistics {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub loads: usize,
}

/// Statistics accumulated by one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub entity_inserts: usize,
    pub entity_updates: usize,
    pub entity_deletes: usize,
    pub entity_loads: usize,
    /// Link-table inserts/deletes and foreign-key writes made for collections
    pub collection_rows: usize,
    pub flushes: usize,
    /// Flushes that failed with a stale-state conflict
    pub optimistic_failures: usize,
    per_entity: BTreeMap<String, EntityStatistics>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_insert(&mut self, entity: &str) {
        self.entity_inserts += 1;
        self.entity(entity).inserts += 1;
    }

    pub fn record_update(&mut self, entity: &str) {
        self.entity_updates += 1;
        self.entity(entity).updates += 1;
    }

    pub fn record_delete(&mut self, entity: &str) {
        self.entity_deletes += 1;
        self.entity(entity).deletes += 1;
    }

    pub fn record_load(&mut self, entity: &str) {
        self.entity_loads += 1;
        self.entity(entity).loads += 1;
    }

    pub fn record_collection_rows(&mut self, rows: usize) {
        self.collection_rows += rows;
    }

    pub fn record_flush(&mut self) {
        self.flushes += 1;
    }

    pub fn record_optimistic_failure(&mut self) {
        self.optimistic_failures += 1;
    }

    /// Counts for one entity, if anything was recorded for it.
    pub fn for_entity(&self, entity: &str) -> Option<&EntityStatistics> {
        self.per_entity.get(entity)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn entity(&mut self, entity: &str) -> &mut EntityStatistics {
        self.per_entity.entry(entity.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_and_per_entity_counts() {
        let mut stats = Statistics::new();
        stats.record_insert("Contract");
        stats.record_insert("Party");
        stats.record_insert("Party");
        stats.record_update("Contract");
        stats.record_load("Party");
        stats.record_collection_rows(3);
        stats.record_flush();

        assert_eq!(stats.entity_inserts, 3);
        assert_eq!(stats.entity_updates, 1);
        assert_eq!(stats.collection_rows, 3);
        assert_eq!(stats.for_entity("Party").map(|s| s.inserts), Some(2));
        assert_eq!(stats.for_entity("Party").map(|s| s.loads), Some(1));
        assert!(stats.for_entity("Variation").is_none());
    }

    #[test]
    fn clear_resets_everything() {
        let mut stats = Statistics::new();
        stats.record_delete("Party");
        stats.record_optimistic_failure();
        stats.clear();
        assert_eq!(stats, Statistics::default());
    }
}
