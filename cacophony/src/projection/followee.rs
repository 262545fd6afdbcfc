//! Followed channels and their cached posts.

use std::collections::{BTreeMap, HashMap};

use cacophony_base::{ChannelKey, ContentAddress};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One cached post of a followee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowingCacheElement {
    /// The post record itself.
    pub element: ContentAddress,
    /// Thumbnail, if one was cached.
    pub image: Option<ContentAddress>,
    /// The main attachment (video, audio...), if one was cached.
    pub leaf: Option<ContentAddress>,
    /// Size of all cached parts together.
    pub combined_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FolloweeRecord {
    root: ContentAddress,
    last_poll_millis: u64,
    elements: HashMap<ContentAddress, FollowingCacheElement>,
    // insertion order of `elements`
    order: Vec<ContentAddress>,
    // records that could not be cached, true if the failure is permanent
    skipped: BTreeMap<ContentAddress, bool>,
}

/// All followees with their last seen root, poll time and element cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolloweeData {
    followees: BTreeMap<ChannelKey, FolloweeRecord>,
}

impl FolloweeData {
    pub fn known_followees(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.followees.keys().copied()
    }

    pub fn is_followed(&self, key: &ChannelKey) -> bool {
        self.followees.contains_key(key)
    }

    pub fn last_fetched_root(&self, key: &ChannelKey) -> Option<ContentAddress> {
        self.followees.get(key).map(|r| r.root)
    }

    pub fn last_poll_millis(&self, key: &ChannelKey) -> Option<u64> {
        self.followees.get(key).map(|r| r.last_poll_millis)
    }

    /// Snapshot of the cached elements of `key`, keyed by element address.
    pub fn elements_for(&self, key: &ChannelKey) -> Option<HashMap<ContentAddress, FollowingCacheElement>> {
        self.followees.get(key).map(|r| r.elements.clone())
    }

    /// Cached elements of `key` in the order they were added.
    pub fn ordered_elements(&self, key: &ChannelKey) -> Vec<FollowingCacheElement> {
        self.followees
            .get(key)
            .map(|r| r.order.iter().map(|a| r.elements[a]).collect())
            .unwrap_or_default()
    }

    /// Records of `key` that failed to load and were skipped.
    ///
    /// `permanent` selects records that were corrupt over ones that failed for transient
    /// reasons like a timeout.
    pub fn skipped_records(&self, key: &ChannelKey, permanent: bool) -> Vec<ContentAddress> {
        self.followees
            .get(key)
            .map(|r| {
                r.skipped
                    .iter()
                    .filter(|(_, p)| **p == permanent)
                    .map(|(a, _)| *a)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn skipped_entries(&self, key: &ChannelKey) -> Vec<(ContentAddress, bool)> {
        self.followees
            .get(key)
            .map(|r| r.skipped.iter().map(|(a, p)| (*a, *p)).collect())
            .unwrap_or_default()
    }

    /// The followee polled least recently, ties broken by key order.
    pub fn next_followee_to_poll(&self) -> Option<ChannelKey> {
        self.followees
            .iter()
            .min_by_key(|(key, r)| (r.last_poll_millis, **key))
            .map(|(key, _)| *key)
    }

    pub(crate) fn define(&mut self, key: ChannelKey, root: ContentAddress, last_poll_millis: u64) {
        self.followees
            .entry(key)
            .and_modify(|r| {
                r.root = root;
                r.last_poll_millis = last_poll_millis;
            })
            .or_insert_with(|| FolloweeRecord {
                root,
                last_poll_millis,
                elements: HashMap::new(),
                order: Vec::new(),
                skipped: BTreeMap::new(),
            });
    }

    pub(crate) fn add_element(&mut self, key: ChannelKey, element: FollowingCacheElement) {
        let Some(record) = self.followees.get_mut(&key) else {
            warn!(key = %key.fmt_short(), element = %element.element, "element for unknown followee dropped");
            return;
        };
        record.skipped.remove(&element.element);
        if record.elements.insert(element.element, element).is_some() {
            debug!(key = %key.fmt_short(), element = %element.element, "replaced cached element");
        } else {
            record.order.push(element.element);
        }
    }

    pub(crate) fn skip_record(&mut self, key: ChannelKey, record: ContentAddress, permanent: bool) {
        let Some(followee) = self.followees.get_mut(&key) else {
            warn!(key = %key.fmt_short(), %record, "skipped record for unknown followee dropped");
            return;
        };
        followee.skipped.insert(record, permanent);
    }

    pub(crate) fn remove_element(&mut self, key: &ChannelKey, element: &ContentAddress) {
        // removing something that was never cached is fine
        if let Some(record) = self.followees.get_mut(key) {
            if record.elements.remove(element).is_some() {
                record.order.retain(|a| a != element);
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &ChannelKey) {
        if let Some(record) = self.followees.remove(key) {
            if !record.elements.is_empty() {
                debug!(key = %key.fmt_short(), count = record.elements.len(), "discarded cached elements with followee");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cacophony_base::{ChannelSecret, Hash};

    use super::*;

    fn addr(i: u8) -> ContentAddress {
        ContentAddress::raw(Hash::new([i]))
    }

    fn key(i: u8) -> ChannelKey {
        ChannelSecret::from_bytes(&[i; 32]).public()
    }

    fn element(i: u8) -> FollowingCacheElement {
        FollowingCacheElement {
            element: addr(i),
            image: Some(addr(i + 100)),
            leaf: None,
            combined_size_bytes: 10,
        }
    }

    #[test]
    fn define_refreshes_without_touching_elements() {
        let mut data = FolloweeData::default();
        data.define(key(1), addr(1), 5);
        data.add_element(key(1), element(10));
        data.define(key(1), addr(2), 6);
        assert_eq!(data.last_fetched_root(&key(1)), Some(addr(2)));
        assert_eq!(data.last_poll_millis(&key(1)), Some(6));
        assert_eq!(data.elements_for(&key(1)).unwrap().len(), 1);
    }

    #[test]
    fn elements_keep_order_and_remove() {
        let mut data = FolloweeData::default();
        data.define(key(1), addr(1), 0);
        for i in [30, 10, 20] {
            data.add_element(key(1), element(i));
        }
        let order: Vec<_> = data.ordered_elements(&key(1)).iter().map(|e| e.element).collect();
        assert_eq!(order, vec![addr(30), addr(10), addr(20)]);

        data.remove_element(&key(1), &addr(10));
        data.remove_element(&key(1), &addr(99));
        let order: Vec<_> = data.ordered_elements(&key(1)).iter().map(|e| e.element).collect();
        assert_eq!(order, vec![addr(30), addr(20)]);
    }

    #[test]
    fn element_for_unknown_followee_is_dropped() {
        let mut data = FolloweeData::default();
        data.add_element(key(1), element(1));
        assert!(!data.is_followed(&key(1)));
    }

    #[test]
    fn skipped_records_until_cached() {
        let mut data = FolloweeData::default();
        data.define(key(1), addr(1), 0);
        data.skip_record(key(1), addr(10), false);
        data.skip_record(key(1), addr(11), true);
        data.skip_record(key(2), addr(12), true);
        assert_eq!(data.skipped_records(&key(1), false), vec![addr(10)]);
        assert_eq!(data.skipped_records(&key(1), true), vec![addr(11)]);
        assert!(data.skipped_records(&key(2), true).is_empty());

        // a retry that worked
        data.add_element(key(1), element(10));
        assert!(data.skipped_records(&key(1), false).is_empty());
        // a transient failure turning permanent
        data.skip_record(key(1), addr(11), false);
        assert_eq!(data.skipped_entries(&key(1)), vec![(addr(11), false)]);
    }

    #[test]
    fn next_to_poll_is_oldest() {
        let mut data = FolloweeData::default();
        assert_eq!(data.next_followee_to_poll(), None);
        data.define(key(1), addr(1), 300);
        data.define(key(2), addr(2), 100);
        data.define(key(3), addr(3), 200);
        assert_eq!(data.next_followee_to_poll(), Some(key(2)));
        data.remove(&key(2));
        assert_eq!(data.next_followee_to_poll(), Some(key(3)));
        assert_eq!(data.known_followees().count(), 2);
    }
}
