//! Owned market/instrument registry

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use super::{Instrument, Market};

#[derive(Debug, Default)]
struct Tables {
    markets: HashMap<String, Market>,
    instruments: HashMap<String, Instrument>,
    /// market id -> instrument ids
    members: HashMap<String, Vec<String>>,
}

/// Registry of discovered markets and their instruments
#[derive(Debug, Default)]
pub struct CatalogRegistry {
    tables: RwLock<Tables>,
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a market together with its instruments
    pub fn upsert_market(&self, market: Market, instruments: Vec<Instrument>) {
        let mut tables = self.tables.write();

        if let Some(previous) = tables.members.remove(&market.id) {
            for id in previous {
                tables.instruments.remove(&id);
            }
        }

        let ids: Vec<String> = instruments.iter().map(|i| i.id.clone()).collect();
        for instrument in instruments {
            tables.instruments.insert(instrument.id.clone(), instrument);
        }
        tables.members.insert(market.id.clone(), ids);
        tables.markets.insert(market.id.clone(), market);
    }

    pub fn market(&self, market_id: &str) -> Option<Market> {
        self.tables.read().markets.get(market_id).cloned()
    }

    pub fn instrument(&self, instrument_id: &str) -> Option<Instrument> {
        self.tables.read().instruments.get(instrument_id).cloned()
    }

    /// Market owning an instrument
    pub fn market_of(&self, instrument_id: &str) -> Option<Market> {
        let tables = self.tables.read();
        let instrument = tables.instruments.get(instrument_id)?;
        tables.markets.get(&instrument.market_id).cloned()
    }

    pub fn instruments_of(&self, market_id: &str) -> Vec<Instrument> {
        let tables = self.tables.read();
        tables
            .members
            .get(market_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.instruments.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Human-readable label for logs
    pub fn display_name(&self, instrument_id: &str) -> String {
        let tables = self.tables.read();
        match tables.instruments.get(instrument_id) {
            Some(instrument) => match tables.markets.get(&instrument.market_id) {
                Some(market) => format!("{} / {}", market.title, instrument.name),
                None => instrument.name.clone(),
            },
            None => format!("unknown instrument ({})", instrument_id),
        }
    }

    pub fn instrument_ids(&self) -> Vec<String> {
        self.tables.read().instruments.keys().cloned().collect()
    }

    pub fn market_count(&self) -> usize {
        self.tables.read().markets.len()
    }

    pub fn instrument_count(&self) -> usize {
        self.tables.read().instruments.len()
    }

    /// Remove markets whose expiry is at or before `now`.
    ///
    /// Returns the ids of the instruments that went away with them.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut tables = self.tables.write();

        let expired: Vec<String> = tables
            .markets
            .values()
            .filter(|m| m.expiry.is_some_and(|expiry| expiry <= now))
            .map(|m| m.id.clone())
            .collect();

        let mut removed = Vec::new();
        for market_id in expired {
            tables.markets.remove(&market_id);
            if let Some(ids) = tables.members.remove(&market_id) {
                for id in ids {
                    if tables.instruments.remove(&id).is_some() {
                        removed.push(id);
                    }
                }
            }
            info!(market_id = %market_id, "Market expired");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn market(id: &str, expiry: Option<DateTime<Utc>>) -> Market {
        Market {
            id: id.to_string(),
            title: format!("Question {}", id),
            expiry,
        }
    }

    fn instrument(id: &str, market_id: &str, name: &str) -> Instrument {
        Instrument {
            id: id.to_string(),
            market_id: market_id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_lookup() {
        let registry = CatalogRegistry::new();
        registry.upsert_market(
            market("m1", None),
            vec![instrument("t1", "m1", "Yes"), instrument("t2", "m1", "No")],
        );

        assert_eq!(registry.instrument("t1").unwrap().name, "Yes");
        assert_eq!(registry.market_of("t2").unwrap().id, "m1");
        assert_eq!(registry.instruments_of("m1").len(), 2);
        assert_eq!(registry.display_name("t1"), "Question m1 / Yes");
        assert!(registry.display_name("zz").contains("zz"));
    }

    #[test]
    fn test_upsert_replaces_instruments() {
        let registry = CatalogRegistry::new();
        registry.upsert_market(market("m1", None), vec![instrument("t1", "m1", "Yes")]);
        registry.upsert_market(market("m1", None), vec![instrument("t3", "m1", "Maybe")]);

        assert!(registry.instrument("t1").is_none());
        assert_eq!(registry.instrument_count(), 1);
        assert_eq!(registry.market_count(), 1);
    }

    #[test]
    fn test_expire_removes_past_markets() {
        let now = Utc::now();
        let registry = CatalogRegistry::new();
        registry.upsert_market(
            market("old", Some(now - Duration::hours(1))),
            vec![instrument("t1", "old", "Yes"), instrument("t2", "old", "No")],
        );
        registry.upsert_market(
            market("live", Some(now + Duration::hours(1))),
            vec![instrument("t3", "live", "Yes")],
        );
        registry.upsert_market(market("open", None), vec![instrument("t4", "open", "Yes")]);

        let mut removed = registry.expire(now);
        removed.sort();
        assert_eq!(removed, vec!["t1", "t2"]);
        assert!(registry.market("old").is_none());
        assert!(registry.market("live").is_some());
        assert!(registry.market("open").is_some());
        assert!(registry.expire(now).is_empty());
    }
}
