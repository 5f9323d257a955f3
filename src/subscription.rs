//! Desired subscription set and subscribe-frame batching.
//!
//! The server keeps no session state, so every (re)connect resends the whole
//! set built from [`SubscriptionRegistry::desired`].

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

use crate::error::Result;

/// Market-channel subscribe frame
#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    assets_ids: &'a [String],
}

/// Authoritative set of instrument ids the feed should deliver
#[derive(Debug)]
pub struct SubscriptionRegistry {
    desired: RwLock<BTreeSet<String>>,
    batch_size: usize,
}

impl SubscriptionRegistry {
    pub fn new(batch_size: usize) -> Self {
        Self {
            desired: RwLock::new(BTreeSet::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Add ids, returning the ones that were not already desired
    pub fn add<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut desired = self.desired.write();
        let added: Vec<String> = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| !id.is_empty())
            .filter(|id| desired.insert(id.clone()))
            .collect();
        if !added.is_empty() {
            info!(added = added.len(), total = desired.len(), "Subscription set grown");
        }
        added
    }

    /// Remove ids, returning the ones that were actually desired
    pub fn remove<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut desired = self.desired.write();
        let removed: Vec<String> = ids
            .into_iter()
            .filter_map(|id| desired.take(id.as_ref()))
            .collect();
        if !removed.is_empty() {
            info!(removed = removed.len(), total = desired.len(), "Subscription set shrunk");
        }
        removed
    }

    /// Snapshot of the desired set
    pub fn desired(&self) -> BTreeSet<String> {
        self.desired.read().clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.desired.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.desired.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.read().is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Frames covering the complete desired set
    pub fn subscribe_frames(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = self.desired().into_iter().collect();
        self.frames_for(&ids)
    }

    /// Frames for an arbitrary id list, `batch_size` ids per frame
    pub fn frames_for(&self, ids: &[String]) -> Result<Vec<String>> {
        ids.chunks(self.batch_size)
            .map(|batch| {
                let frame = SubscribeFrame {
                    msg_type: "MARKET",
                    assets_ids: batch,
                };
                Ok(serde_json::to_string(&frame)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("token-{:04}", i)).collect()
    }

    #[test]
    fn test_add_and_remove() {
        let registry = SubscriptionRegistry::new(100);
        assert_eq!(registry.add(["a", "b", "a"]), vec!["a", "b"]);
        assert_eq!(registry.add(["b", "c"]), vec!["c"]);
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.remove(["a", "zzz"]), vec!["a"]);
        assert!(!registry.contains("a"));
        assert!(registry.contains("c"));
    }

    #[test]
    fn test_frames_are_batched() {
        let registry = SubscriptionRegistry::new(100);
        registry.add(ids(250));

        let frames = registry.subscribe_frames().unwrap();
        assert_eq!(frames.len(), 3);

        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| {
                let v: serde_json::Value = serde_json::from_str(f).unwrap();
                assert_eq!(v["type"], "MARKET");
                v["assets_ids"].as_array().unwrap().len()
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn test_frames_cover_full_set() {
        let registry = SubscriptionRegistry::new(7);
        registry.add(ids(20));

        let mut seen = BTreeSet::new();
        for frame in registry.subscribe_frames().unwrap() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            for id in v["assets_ids"].as_array().unwrap() {
                seen.insert(id.as_str().unwrap().to_string());
            }
        }
        assert_eq!(seen, registry.desired());
    }

    #[test]
    fn test_empty_set_has_no_frames() {
        let registry = SubscriptionRegistry::new(100);
        assert!(registry.subscribe_frames().unwrap().is_empty());
    }
}
