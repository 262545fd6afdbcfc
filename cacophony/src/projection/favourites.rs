//! Posts the user marked as favourites.
//!
//! Unlike the explicit cache this is only changed on request and has no size bound.

use std::collections::HashMap;

use cacophony_base::ContentAddress;
use tracing::debug;

use super::CachedRecordInfo;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FavouritesCacheData {
    records: HashMap<ContentAddress, CachedRecordInfo>,
    // insertion order of `records`
    order: Vec<ContentAddress>,
}

impl FavouritesCacheData {
    pub fn is_favourite(&self, stream: &ContentAddress) -> bool {
        self.records.contains_key(stream)
    }

    pub fn record_info(&self, stream: &ContentAddress) -> Option<&CachedRecordInfo> {
        self.records.get(stream)
    }

    /// Favourites in the order they were added.
    pub fn ordered_records(&self) -> Vec<CachedRecordInfo> {
        self.order.iter().map(|a| self.records[a]).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.values().map(|r| r.combined_size_bytes).sum()
    }

    /// Calls `pin` once per reference held by the favourites.
    pub fn walk_all_pins(&self, mut pin: impl FnMut(ContentAddress)) {
        for info in self.records.values() {
            info.addresses().for_each(&mut pin);
        }
    }

    pub(crate) fn add(&mut self, info: CachedRecordInfo) {
        if self.records.insert(info.stream, info).is_some() {
            debug!(stream = %info.stream, "replaced favourite");
        } else {
            self.order.push(info.stream);
        }
    }

    pub(crate) fn remove(&mut self, stream: &ContentAddress) -> Option<CachedRecordInfo> {
        let removed = self.records.remove(stream)?;
        self.order.retain(|a| a != stream);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use cacophony_base::Hash;

    use super::*;

    fn addr(i: u8) -> ContentAddress {
        ContentAddress::raw(Hash::new([i]))
    }

    fn favourite(i: u8) -> CachedRecordInfo {
        CachedRecordInfo {
            stream: addr(i),
            has_data_to_cache: true,
            thumbnail: None,
            video: Some(addr(i + 1)),
            audio: None,
            combined_size_bytes: u64::from(i),
        }
    }

    #[test]
    fn add_remove_keeps_order() {
        let mut favourites = FavouritesCacheData::default();
        for i in [30, 10, 20] {
            favourites.add(favourite(i));
        }
        assert_eq!(favourites.total_bytes(), 60);
        assert_eq!(favourites.remove(&addr(10)), Some(favourite(10)));
        assert_eq!(favourites.remove(&addr(10)), None);
        assert_eq!(favourites.ordered_records(), vec![favourite(30), favourite(20)]);
        assert!(!favourites.is_favourite(&addr(10)));

        let mut pins = Vec::new();
        favourites.walk_all_pins(|a| pins.push(a));
        pins.sort();
        let mut expected = vec![addr(30), addr(31), addr(20), addr(21)];
        expected.sort();
        assert_eq!(pins, expected);
    }
}
