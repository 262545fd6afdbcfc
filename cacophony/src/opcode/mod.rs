//! Mutation records of the local model and their durable log format.
//!
//! Every change to the local state is expressed as an [`Opcode`]. The log is the ordered,
//! append-only sequence of all opcodes ever committed; replaying it from the start rebuilds
//! the [`Projections`](crate::projection::Projections).

use cacophony_base::{ChannelKey, ContentAddress};
use serde::{Deserialize, Serialize};

use crate::projection::{
    CachedRecordInfo, ChannelConfig, ExplicitUserInfo, FolloweeMutation, FollowingCacheElement, MiscMutation,
    PrefValue,
};

mod codec;

pub use self::codec::{create_writer, decode_whole_stream, LogError, OpcodeWriter, Replay};

/// Wire tag of each opcode kind. Values are part of the log format and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u32)]
pub enum OpcodeKind {
    DefineChannel = 1,
    SetLastPublishedRoot = 2,
    SetPinCount = 3,
    SetPreference = 4,
    DefineFollowee = 5,
    AddFolloweeElement = 6,
    RemoveFolloweeElement = 7,
    RemoveFollowee = 8,
    PutExplicitUser = 9,
    PutExplicitRecord = 10,
    PurgeExplicitCache = 11,
    AddFavourite = 12,
    RemoveFavourite = 13,
    SkipFolloweeRecord = 14,
}

/// (Re)initializes the home channel config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefineChannel {
    pub host: String,
    pub key_name: String,
}

/// Overwrites the home channel's publish pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLastPublishedRoot {
    pub root: ContentAddress,
}

/// Sets the authoritative reference count of an address, 0 removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPinCount {
    pub address: ContentAddress,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPreference {
    pub name: String,
    pub value: PrefValue,
}

/// Creates or refreshes a followee's root and poll time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefineFollowee {
    pub key: ChannelKey,
    pub root: ContentAddress,
    pub last_poll_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFolloweeElement {
    pub key: ChannelKey,
    pub element: FollowingCacheElement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFolloweeElement {
    pub key: ChannelKey,
    pub element: ContentAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFollowee {
    pub key: ChannelKey,
}

/// Adds or refreshes a looked-up channel in the explicit cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutExplicitUser {
    pub info: ExplicitUserInfo,
}

/// Adds or refreshes a looked-up post in the explicit cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutExplicitRecord {
    pub info: CachedRecordInfo,
}

/// Evicts least recently used explicit cache entries until the cache fits `limit_bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeExplicitCache {
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFavourite {
    pub info: CachedRecordInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFavourite {
    pub stream: ContentAddress,
}

/// Marks a followee record that failed to load, `permanent` if it was corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipFolloweeRecord {
    pub key: ChannelKey,
    pub record: ContentAddress,
    pub permanent: bool,
}

/// One durable mutation of the local model.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::From)]
pub enum Opcode {
    DefineChannel(DefineChannel),
    SetLastPublishedRoot(SetLastPublishedRoot),
    SetPinCount(SetPinCount),
    SetPreference(SetPreference),
    DefineFollowee(DefineFollowee),
    AddFolloweeElement(AddFolloweeElement),
    RemoveFolloweeElement(RemoveFolloweeElement),
    RemoveFollowee(RemoveFollowee),
    PutExplicitUser(PutExplicitUser),
    PutExplicitRecord(PutExplicitRecord),
    PurgeExplicitCache(PurgeExplicitCache),
    AddFavourite(AddFavourite),
    RemoveFavourite(RemoveFavourite),
    SkipFolloweeRecord(SkipFolloweeRecord),
}

impl Opcode {
    pub fn kind(&self) -> OpcodeKind {
        match self {
            Opcode::DefineChannel(_) => OpcodeKind::DefineChannel,
            Opcode::SetLastPublishedRoot(_) => OpcodeKind::SetLastPublishedRoot,
            Opcode::SetPinCount(_) => OpcodeKind::SetPinCount,
            Opcode::SetPreference(_) => OpcodeKind::SetPreference,
            Opcode::DefineFollowee(_) => OpcodeKind::DefineFollowee,
            Opcode::AddFolloweeElement(_) => OpcodeKind::AddFolloweeElement,
            Opcode::RemoveFolloweeElement(_) => OpcodeKind::RemoveFolloweeElement,
            Opcode::RemoveFollowee(_) => OpcodeKind::RemoveFollowee,
            Opcode::PutExplicitUser(_) => OpcodeKind::PutExplicitUser,
            Opcode::PutExplicitRecord(_) => OpcodeKind::PutExplicitRecord,
            Opcode::PurgeExplicitCache(_) => OpcodeKind::PurgeExplicitCache,
            Opcode::AddFavourite(_) => OpcodeKind::AddFavourite,
            Opcode::RemoveFavourite(_) => OpcodeKind::RemoveFavourite,
            Opcode::SkipFolloweeRecord(_) => OpcodeKind::SkipFolloweeRecord,
        }
    }

    /// Applies this opcode to the model.
    ///
    /// All state changes of the local model go through here.
    pub fn apply<C: MiscMutation + FolloweeMutation>(&self, ctx: &mut C) {
        match self {
            Opcode::DefineChannel(op) => ctx.define_channel(ChannelConfig {
                host: op.host.clone(),
                key_name: op.key_name.clone(),
            }),
            Opcode::SetLastPublishedRoot(op) => ctx.set_last_published_root(op.root),
            Opcode::SetPinCount(op) => ctx.set_pin_count(op.address, op.count),
            Opcode::SetPreference(op) => ctx.set_preference(op.name.clone(), op.value),
            Opcode::DefineFollowee(op) => {
                ctx.define_followee(op.key, op.root, op.last_poll_millis)
            }
            Opcode::AddFolloweeElement(op) => ctx.add_followee_element(op.key, op.element),
            Opcode::RemoveFolloweeElement(op) => ctx.remove_followee_element(op.key, op.element),
            Opcode::RemoveFollowee(op) => ctx.remove_followee(op.key),
            Opcode::PutExplicitUser(op) => ctx.put_explicit_user(op.info),
            Opcode::PutExplicitRecord(op) => ctx.put_explicit_record(op.info),
            Opcode::PurgeExplicitCache(op) => ctx.purge_explicit_cache(op.limit_bytes),
            Opcode::AddFavourite(op) => ctx.add_favourite(op.info),
            Opcode::RemoveFavourite(op) => ctx.remove_favourite(op.stream),
            Opcode::SkipFolloweeRecord(op) => {
                ctx.skip_followee_record(op.key, op.record, op.permanent)
            }
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            Opcode::DefineChannel(op) => postcard::to_stdvec(op),
            Opcode::SetLastPublishedRoot(op) => postcard::to_stdvec(op),
            Opcode::SetPinCount(op) => postcard::to_stdvec(op),
            Opcode::SetPreference(op) => postcard::to_stdvec(op),
            Opcode::DefineFollowee(op) => postcard::to_stdvec(op),
            Opcode::AddFolloweeElement(op) => postcard::to_stdvec(op),
            Opcode::RemoveFolloweeElement(op) => postcard::to_stdvec(op),
            Opcode::RemoveFollowee(op) => postcard::to_stdvec(op),
            Opcode::PutExplicitUser(op) => postcard::to_stdvec(op),
            Opcode::PutExplicitRecord(op) => postcard::to_stdvec(op),
            Opcode::PurgeExplicitCache(op) => postcard::to_stdvec(op),
            Opcode::AddFavourite(op) => postcard::to_stdvec(op),
            Opcode::RemoveFavourite(op) => postcard::to_stdvec(op),
            Opcode::SkipFolloweeRecord(op) => postcard::to_stdvec(op),
        }
    }

    fn decode_payload(kind: OpcodeKind, payload: &[u8]) -> Result<Self, postcard::Error> {
        Ok(match kind {
            OpcodeKind::DefineChannel => Opcode::DefineChannel(postcard::from_bytes(payload)?),
            OpcodeKind::SetLastPublishedRoot => {
                Opcode::SetLastPublishedRoot(postcard::from_bytes(payload)?)
            }
            OpcodeKind::SetPinCount => Opcode::SetPinCount(postcard::from_bytes(payload)?),
            OpcodeKind::SetPreference => Opcode::SetPreference(postcard::from_bytes(payload)?),
            OpcodeKind::DefineFollowee => Opcode::DefineFollowee(postcard::from_bytes(payload)?),
            OpcodeKind::AddFolloweeElement => {
                Opcode::AddFolloweeElement(postcard::from_bytes(payload)?)
            }
            OpcodeKind::RemoveFolloweeElement => {
                Opcode::RemoveFolloweeElement(postcard::from_bytes(payload)?)
            }
            OpcodeKind::RemoveFollowee => Opcode::RemoveFollowee(postcard::from_bytes(payload)?),
            OpcodeKind::PutExplicitUser => Opcode::PutExplicitUser(postcard::from_bytes(payload)?),
            OpcodeKind::PutExplicitRecord => {
                Opcode::PutExplicitRecord(postcard::from_bytes(payload)?)
            }
            OpcodeKind::PurgeExplicitCache => {
                Opcode::PurgeExplicitCache(postcard::from_bytes(payload)?)
            }
            OpcodeKind::AddFavourite => Opcode::AddFavourite(postcard::from_bytes(payload)?),
            OpcodeKind::RemoveFavourite => Opcode::RemoveFavourite(postcard::from_bytes(payload)?),
            OpcodeKind::SkipFolloweeRecord => {
                Opcode::SkipFolloweeRecord(postcard::from_bytes(payload)?)
            }
        })
    }
}
