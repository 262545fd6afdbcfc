//! In-memory projection of the local state.
//!
//! The projection is only ever changed by applying opcodes. Mutations are split into two
//! capability groups, [`MiscMutation`] and [`FolloweeMutation`], both implemented by
//! [`Projections`].

use std::io::Write;

use cacophony_base::{ChannelKey, ContentAddress};

use crate::opcode::{self, LogError, Opcode, OpcodeWriter};

mod channel;
mod explicit;
mod favourites;
mod followee;
mod pins;
pub mod prefs;

pub use self::channel::{ChannelConfig, ChannelData};
pub use self::explicit::{CachedRecordInfo, ExplicitCacheData, ExplicitEntry, ExplicitUserInfo};
pub use self::favourites::FavouritesCacheData;
pub use self::followee::{FolloweeData, FollowingCacheElement};
pub use self::pins::{PinCacheData, PinMismatch};
pub use self::prefs::{PrefValue, PrefsData};

/// Mutations of the home channel, the preferences, the pin table and the caches outside of
/// followees.
pub trait MiscMutation {
    fn define_channel(&mut self, config: ChannelConfig);
    fn set_last_published_root(&mut self, root: ContentAddress);
    fn set_pin_count(&mut self, address: ContentAddress, count: u32);
    fn set_preference(&mut self, name: String, value: PrefValue);
    fn put_explicit_user(&mut self, info: ExplicitUserInfo);
    fn put_explicit_record(&mut self, info: CachedRecordInfo);
    fn purge_explicit_cache(&mut self, limit_bytes: u64);
    fn add_favourite(&mut self, info: CachedRecordInfo);
    fn remove_favourite(&mut self, stream: ContentAddress);
}

/// Mutations of the followee table.
pub trait FolloweeMutation {
    fn define_followee(&mut self, key: ChannelKey, root: ContentAddress, last_poll_millis: u64);
    fn add_followee_element(&mut self, key: ChannelKey, element: FollowingCacheElement);
    fn remove_followee_element(&mut self, key: ChannelKey, element: ContentAddress);
    fn remove_followee(&mut self, key: ChannelKey);
    fn skip_followee_record(&mut self, key: ChannelKey, record: ContentAddress, permanent: bool);
}

/// The complete local model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projections {
    channel: ChannelData,
    prefs: PrefsData,
    pins: PinCacheData,
    followees: FolloweeData,
    explicit: ExplicitCacheData,
    favourites: FavouritesCacheData,
}

impl Projections {
    pub fn channel(&self) -> &ChannelData {
        &self.channel
    }

    pub fn prefs(&self) -> &PrefsData {
        &self.prefs
    }

    pub fn pins(&self) -> &PinCacheData {
        &self.pins
    }

    pub fn followees(&self) -> &FolloweeData {
        &self.followees
    }

    pub fn explicit_cache(&self) -> &ExplicitCacheData {
        &self.explicit
    }

    pub fn favourites(&self) -> &FavouritesCacheData {
        &self.favourites
    }

    /// Writes the shortest opcode sequence that rebuilds this state from empty.
    pub fn write_snapshot<W: Write>(&self, writer: &mut OpcodeWriter<W>) -> Result<(), LogError> {
        for op in self.snapshot_opcodes() {
            writer.write(&op)?;
        }
        Ok(())
    }

    fn snapshot_opcodes(&self) -> Vec<Opcode> {
        let mut ops = Vec::new();
        if let Some(config) = self.channel.config() {
            ops.push(Opcode::from(opcode::DefineChannel {
                host: config.host.clone(),
                key_name: config.key_name.clone(),
            }));
        }
        if let Some(root) = self.channel.last_published_root() {
            ops.push(opcode::SetLastPublishedRoot { root }.into());
        }
        for (name, value) in self.prefs.iter() {
            ops.push(
                opcode::SetPreference {
                    name: name.to_string(),
                    value,
                }
                .into(),
            );
        }
        for (address, count) in self.pins.iter() {
            ops.push(opcode::SetPinCount { address, count }.into());
        }
        for key in self.followees.known_followees() {
            let (Some(root), Some(last_poll_millis)) = (
                self.followees.last_fetched_root(&key),
                self.followees.last_poll_millis(&key),
            ) else {
                continue;
            };
            ops.push(
                opcode::DefineFollowee {
                    key,
                    root,
                    last_poll_millis,
                }
                .into(),
            );
            for element in self.followees.ordered_elements(&key) {
                ops.push(opcode::AddFolloweeElement { key, element }.into());
            }
            for (record, permanent) in self.followees.skipped_entries(&key) {
                ops.push(
                    opcode::SkipFolloweeRecord {
                        key,
                        record,
                        permanent,
                    }
                    .into(),
                );
            }
        }
        // least recently used first, so replay restores the order
        for entry in self.explicit.entries() {
            match entry {
                ExplicitEntry::User(key) => {
                    if let Some(info) = self.explicit.user_info(&key) {
                        ops.push(opcode::PutExplicitUser { info: *info }.into());
                    }
                }
                ExplicitEntry::Record(stream) => {
                    if let Some(info) = self.explicit.record_info(&stream) {
                        ops.push(opcode::PutExplicitRecord { info: *info }.into());
                    }
                }
            }
        }
        for info in self.favourites.ordered_records() {
            ops.push(opcode::AddFavourite { info }.into());
        }
        ops
    }
}

impl MiscMutation for Projections {
    fn define_channel(&mut self, config: ChannelConfig) {
        self.channel.set_config(config);
    }

    fn set_last_published_root(&mut self, root: ContentAddress) {
        self.channel.set_last_published_root(root);
    }

    fn set_pin_count(&mut self, address: ContentAddress, count: u32) {
        self.pins.set_count(address, count);
    }

    fn set_preference(&mut self, name: String, value: PrefValue) {
        self.prefs.set(name, value);
    }

    fn put_explicit_user(&mut self, info: ExplicitUserInfo) {
        self.explicit.put_user(info);
    }

    fn put_explicit_record(&mut self, info: CachedRecordInfo) {
        self.explicit.put_record(info);
    }

    fn purge_explicit_cache(&mut self, limit_bytes: u64) {
        self.explicit.purge(limit_bytes);
    }

    fn add_favourite(&mut self, info: CachedRecordInfo) {
        self.favourites.add(info);
    }

    fn remove_favourite(&mut self, stream: ContentAddress) {
        self.favourites.remove(&stream);
    }
}

impl FolloweeMutation for Projections {
    fn define_followee(&mut self, key: ChannelKey, root: ContentAddress, last_poll_millis: u64) {
        self.followees.define(key, root, last_poll_millis);
    }

    fn add_followee_element(&mut self, key: ChannelKey, element: FollowingCacheElement) {
        self.followees.add_element(key, element);
    }

    fn remove_followee_element(&mut self, key: ChannelKey, element: ContentAddress) {
        self.followees.remove_element(&key, &element);
    }

    fn remove_followee(&mut self, key: ChannelKey) {
        self.followees.remove(&key);
    }

    fn skip_followee_record(&mut self, key: ChannelKey, record: ContentAddress, permanent: bool) {
        self.followees.skip_record(key, record, permanent);
    }
}

#[cfg(test)]
mod tests {
    use cacophony_base::{ChannelSecret, Hash};

    use super::*;

    fn addr(i: u8) -> ContentAddress {
        ContentAddress::raw(Hash::new([i]))
    }

    #[test]
    fn snapshot_rebuilds_same_state() {
        let key = ChannelSecret::from_bytes(&[4; 32]).public();
        let mut model = Projections::default();
        model.define_channel(ChannelConfig {
            host: "/ip4/127.0.0.1/tcp/5001".into(),
            key_name: "home".into(),
        });
        model.set_last_published_root(addr(1));
        model.set_pin_count(addr(1), 2);
        model.set_pin_count(addr(2), 1);
        model.set_preference(prefs::VIDEO_EDGE_PIXEL_MAX.into(), PrefValue::Int(640));
        model.define_followee(key, addr(3), 77);
        model.add_followee_element(
            key,
            FollowingCacheElement {
                element: addr(4),
                image: None,
                leaf: Some(addr(5)),
                combined_size_bytes: 1024,
            },
        );
        model.skip_followee_record(key, addr(6), true);
        let record = |i: u8| CachedRecordInfo {
            stream: addr(i),
            has_data_to_cache: false,
            thumbnail: Some(addr(i + 1)),
            video: None,
            audio: None,
            combined_size_bytes: 10,
        };
        model.put_explicit_record(record(20));
        model.put_explicit_user(ExplicitUserInfo {
            key,
            last_fetch_attempt_millis: 3,
            last_fetch_success_millis: 2,
            index: addr(30),
            recommendations: addr(31),
            records: addr(32),
            description: addr(33),
            picture: None,
            combined_size_bytes: 40,
        });
        model.put_explicit_record(record(22));
        // refreshed, now the most recently used
        model.put_explicit_record(record(20));
        model.add_favourite(record(40));
        model.add_favourite(record(42));
        model.remove_favourite(addr(40));

        let mut rebuilt = Projections::default();
        for op in model.snapshot_opcodes() {
            op.apply(&mut rebuilt);
        }
        assert_eq!(rebuilt, model);
        assert_eq!(
            rebuilt.explicit_cache().entries().collect::<Vec<_>>(),
            vec![
                ExplicitEntry::User(key),
                ExplicitEntry::Record(addr(22)),
                ExplicitEntry::Record(addr(20)),
            ]
        );
    }
}
