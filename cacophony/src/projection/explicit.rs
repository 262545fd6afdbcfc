//! Content looked up explicitly, outside of any followed channel.
//!
//! Entries are channel descriptions and single posts. The cache is bounded: it keeps the
//! entries in least recently used order and [`ExplicitCacheData::purge`] evicts from the
//! old end until the total size fits. Writing an entry again marks it as most recently used.

use std::collections::HashMap;

use cacophony_base::{ChannelKey, ContentAddress};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A cached post with the parts of it that are pinned.
///
/// At most one of `video` and `audio` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecordInfo {
    pub stream: ContentAddress,
    /// The post has attachments that were not cached.
    pub has_data_to_cache: bool,
    pub thumbnail: Option<ContentAddress>,
    pub video: Option<ContentAddress>,
    pub audio: Option<ContentAddress>,
    /// Size of the post and every cached part.
    pub combined_size_bytes: u64,
}

impl CachedRecordInfo {
    /// Every address this entry keeps pinned.
    pub fn addresses(&self) -> impl Iterator<Item = ContentAddress> {
        std::iter::once(self.stream)
            .chain(self.thumbnail)
            .chain(self.video)
            .chain(self.audio)
    }
}

/// The metadata documents of a channel that was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitUserInfo {
    pub key: ChannelKey,
    pub last_fetch_attempt_millis: u64,
    pub last_fetch_success_millis: u64,
    pub index: ContentAddress,
    pub recommendations: ContentAddress,
    pub records: ContentAddress,
    pub description: ContentAddress,
    pub picture: Option<ContentAddress>,
    /// Size of all of the documents above.
    pub combined_size_bytes: u64,
}

impl ExplicitUserInfo {
    pub fn addresses(&self) -> impl Iterator<Item = ContentAddress> {
        [self.index, self.recommendations, self.records, self.description]
            .into_iter()
            .chain(self.picture)
    }
}

/// One entry of the explicit cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExplicitEntry {
    User(ChannelKey),
    Record(ContentAddress),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplicitCacheData {
    users: HashMap<ChannelKey, ExplicitUserInfo>,
    records: HashMap<ContentAddress, CachedRecordInfo>,
    // least recently used first
    lru: Vec<ExplicitEntry>,
    total_bytes: u64,
}

impl ExplicitCacheData {
    pub fn user_info(&self, key: &ChannelKey) -> Option<&ExplicitUserInfo> {
        self.users.get(key)
    }

    pub fn record_info(&self, stream: &ContentAddress) -> Option<&CachedRecordInfo> {
        self.records.get(stream)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Entries from least to most recently used.
    pub fn entries(&self) -> impl Iterator<Item = ExplicitEntry> + '_ {
        self.lru.iter().copied()
    }

    /// Calls `pin` once per reference held by the cache.
    pub fn walk_all_pins(&self, mut pin: impl FnMut(ContentAddress)) {
        for info in self.users.values() {
            info.addresses().for_each(&mut pin);
        }
        for info in self.records.values() {
            info.addresses().for_each(&mut pin);
        }
    }

    /// The references [`ExplicitCacheData::purge`] would drop for `limit_bytes`, once per
    /// reference.
    pub fn purge_preview(&self, limit_bytes: u64) -> Vec<ContentAddress> {
        let mut total = self.total_bytes;
        let mut released = Vec::new();
        for entry in &self.lru {
            if total <= limit_bytes {
                break;
            }
            match entry {
                ExplicitEntry::User(key) => {
                    let info = &self.users[key];
                    released.extend(info.addresses());
                    total -= info.combined_size_bytes;
                }
                ExplicitEntry::Record(stream) => {
                    let info = &self.records[stream];
                    released.extend(info.addresses());
                    total -= info.combined_size_bytes;
                }
            }
        }
        released
    }

    pub(crate) fn put_user(&mut self, info: ExplicitUserInfo) {
        let entry = ExplicitEntry::User(info.key);
        if let Some(old) = self.users.insert(info.key, info) {
            self.total_bytes -= old.combined_size_bytes;
            self.lru.retain(|e| *e != entry);
        }
        self.total_bytes += info.combined_size_bytes;
        self.lru.push(entry);
    }

    pub(crate) fn put_record(&mut self, info: CachedRecordInfo) {
        let entry = ExplicitEntry::Record(info.stream);
        if let Some(old) = self.records.insert(info.stream, info) {
            debug!(stream = %info.stream, "replaced explicit record");
            self.total_bytes -= old.combined_size_bytes;
            self.lru.retain(|e| *e != entry);
        }
        self.total_bytes += info.combined_size_bytes;
        self.lru.push(entry);
    }

    /// Evicts least recently used entries until the total size is at most `limit_bytes`.
    pub(crate) fn purge(&mut self, limit_bytes: u64) {
        let mut evicted = 0;
        while self.total_bytes > limit_bytes && !self.lru.is_empty() {
            let size = match self.lru.remove(0) {
                ExplicitEntry::User(key) => self.users.remove(&key).map(|i| i.combined_size_bytes),
                ExplicitEntry::Record(stream) => {
                    self.records.remove(&stream).map(|i| i.combined_size_bytes)
                }
            };
            self.total_bytes -= size.unwrap_or(0);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, total = self.total_bytes, "purged explicit cache");
        }
    }
}
