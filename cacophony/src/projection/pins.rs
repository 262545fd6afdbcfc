//! Reference counted pin table.

use std::collections::{BTreeMap, HashMap, HashSet};

use cacophony_base::ContentAddress;

/// Mapping from content address to the number of owners that need it pinned.
///
/// Every address present has a count of at least one. Shared content is counted once per
/// owner, so dropping one owner's contribution leaves the others intact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinCacheData {
    counts: HashMap<ContentAddress, u32>,
}

/// One address whose count differs between two pin tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMismatch {
    pub address: ContentAddress,
    pub expected: u32,
    pub actual: u32,
}

impl PinCacheData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one reference to `address`.
    pub fn add_ref(&mut self, address: ContentAddress) {
        let count = self.counts.entry(address).or_insert(0);
        *count = count
            .checked_add(1)
            .unwrap_or_else(|| panic!("pin count overflow for {address}"));
    }

    /// Drops one reference to `address`, removing it once the last reference is gone.
    ///
    /// # Panics
    ///
    /// Panics if `address` has no references. This means the table is corrupt.
    pub fn del_ref(&mut self, address: ContentAddress) {
        let Some(count) = self.counts.get_mut(&address) else {
            panic!("del_ref on unreferenced address {address}");
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&address);
        }
    }

    /// Sets the authoritative count for `address`. A count of zero removes it.
    pub fn set_count(&mut self, address: ContentAddress, count: u32) {
        if count == 0 {
            self.counts.remove(&address);
        } else {
            self.counts.insert(address, count);
        }
    }

    pub fn count(&self, address: &ContentAddress) -> u32 {
        self.counts.get(address).copied().unwrap_or(0)
    }

    pub fn is_pinned(&self, address: &ContentAddress) -> bool {
        self.counts.contains_key(address)
    }

    /// All addresses with at least one reference.
    pub fn snapshot_pinned_set(&self) -> HashSet<ContentAddress> {
        self.counts.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates over `(address, count)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (ContentAddress, u32)> + '_ {
        let sorted: BTreeMap<_, _> = self.counts.iter().map(|(a, c)| (*a, *c)).collect();
        sorted.into_iter()
    }

    /// Lists every address whose count here differs from `expected`, in address order.
    ///
    /// An empty result means both tables are identical.
    pub fn verify_match(&self, expected: &PinCacheData) -> Vec<PinMismatch> {
        let addresses: std::collections::BTreeSet<_> = self
            .counts
            .keys()
            .chain(expected.counts.keys())
            .copied()
            .collect();
        addresses
            .into_iter()
            .filter_map(|address| {
                let actual = self.count(&address);
                let expected = expected.count(&address);
                (actual != expected).then_some(PinMismatch {
                    address,
                    expected,
                    actual,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use cacophony_base::Hash;
    use proptest::prelude::*;

    use super::*;

    fn addr(i: u8) -> ContentAddress {
        ContentAddress::raw(Hash::new([i]))
    }

    #[test]
    fn empty() {
        let data = PinCacheData::new();
        assert!(data.snapshot_pinned_set().is_empty());
        assert!(!data.is_pinned(&addr(1)));
    }

    #[test]
    fn add_and_remove() {
        let mut data = PinCacheData::new();
        data.add_ref(addr(1));
        data.add_ref(addr(1));
        data.add_ref(addr(2));
        assert_eq!(data.count(&addr(1)), 2);
        assert_eq!(data.len(), 2);

        data.del_ref(addr(1));
        assert!(data.is_pinned(&addr(1)));
        data.del_ref(addr(1));
        assert!(!data.is_pinned(&addr(1)));
        assert_eq!(data.snapshot_pinned_set(), HashSet::from([addr(2)]));
    }

    #[test]
    #[should_panic(expected = "del_ref on unreferenced address")]
    fn del_ref_absent_is_fatal() {
        let mut data = PinCacheData::new();
        data.del_ref(addr(3));
    }

    #[test]
    fn set_count_zero_removes() {
        let mut data = PinCacheData::new();
        data.set_count(addr(1), 4);
        assert_eq!(data.count(&addr(1)), 4);
        data.set_count(addr(1), 0);
        assert!(data.is_empty());
    }

    #[test]
    fn verify_match_reports_differences() {
        let mut left = PinCacheData::new();
        let mut right = PinCacheData::new();
        left.add_ref(addr(1));
        right.add_ref(addr(1));
        assert!(left.verify_match(&right).is_empty());

        left.add_ref(addr(1));
        right.add_ref(addr(2));
        let mut mismatches = left.verify_match(&right);
        mismatches.sort_by_key(|m| m.address);
        let mut expected = vec![
            PinMismatch {
                address: addr(1),
                expected: 1,
                actual: 2,
            },
            PinMismatch {
                address: addr(2),
                expected: 1,
                actual: 0,
            },
        ];
        expected.sort_by_key(|m| m.address);
        assert_eq!(mismatches, expected);
    }

    #[test]
    fn shared_content_survives_one_owner() {
        let mut data = PinCacheData::new();
        let picture = addr(7);
        // two channels use the same picture
        data.add_ref(picture);
        data.add_ref(picture);
        data.del_ref(picture);
        assert!(data.is_pinned(&picture));
        assert_eq!(data.count(&picture), 1);
    }

    proptest! {
        #[test]
        fn balanced_refs_leave_table_empty(ops in proptest::collection::vec(0u8..8, 0..64)) {
            let mut data = PinCacheData::new();
            for i in &ops {
                data.add_ref(addr(*i));
            }
            for i in ops.iter().rev() {
                data.del_ref(addr(*i));
            }
            prop_assert!(data.is_empty());
        }

        #[test]
        fn add_then_del_restores_count(seed in proptest::collection::vec(0u8..4, 0..16), target in 0u8..4) {
            let mut data = PinCacheData::new();
            for i in &seed {
                data.add_ref(addr(*i));
            }
            let before = data.clone();
            data.add_ref(addr(target));
            data.del_ref(addr(target));
            prop_assert_eq!(data, before);
        }
    }
}
