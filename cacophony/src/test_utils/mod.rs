//! Helpers for tests: an in-memory storage node and published channel fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use cacophony_base::{ChannelKey, ChannelSecret, Codec, ContentAddress};
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    format::{self, DataElement, StreamDescription, StreamIndex, StreamRecommendations, StreamRecord, StreamRecords},
    net::{Connection, NetworkError},
};

pub mod logging;

/// Deterministic channel key number `i`.
pub fn key(i: u8) -> ChannelKey {
    ChannelSecret::from_bytes(&[i; 32]).public()
}

/// One call received by a [`MockNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Pin(ContentAddress),
    Unpin(ContentAddress),
    Size(ContentAddress),
    Load(ContentAddress),
    Store(ContentAddress),
}

/// Storage node for testing that keeps its content in memory and records every call.
#[derive(Debug, Default, Clone)]
pub struct MockNode(Arc<RwLock<MockNodeInner>>);

#[derive(Debug, Default)]
struct MockNodeInner {
    data: HashMap<ContentAddress, Bytes>,
    pinned: HashSet<ContentAddress>,
    failing: HashSet<ContentAddress>,
    history: Vec<Call>,
}

impl MockNode {
    /// Stores bytes without going through a scheduler.
    pub fn store_bytes(&self, data: impl Into<Bytes>, codec: Codec) -> ContentAddress {
        let data = data.into();
        let address = ContentAddress::for_content(&data, codec);
        self.0.write().data.insert(address, data);
        address
    }

    /// Stores an encoded document without going through a scheduler.
    pub fn store_document<T: Serialize>(&self, doc: &T) -> anyhow::Result<ContentAddress> {
        Ok(self.store_bytes(format::encode(doc)?, Codec::Document))
    }

    /// Makes every later call touching `address` fail with a connection error.
    pub fn fail_calls_for(&self, address: ContentAddress) {
        self.0.write().failing.insert(address);
    }

    pub fn is_pinned(&self, address: &ContentAddress) -> bool {
        self.0.read().pinned.contains(address)
    }

    pub fn pinned(&self) -> HashSet<ContentAddress> {
        self.0.read().pinned.clone()
    }

    pub fn pin_calls(&self) -> usize {
        self.count_calls(|c| matches!(c, Call::Pin(_)))
    }

    /// Addresses loaded so far, in call order.
    pub fn load_history(&self) -> Vec<ContentAddress> {
        self.0
            .read()
            .history
            .iter()
            .filter_map(|c| match c {
                Call::Load(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    #[track_caller]
    pub fn assert_history(&self, history: &[Call]) {
        assert_eq!(self.0.read().history, history)
    }

    fn count_calls(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.0.read().history.iter().filter(|c| f(c)).count()
    }

    fn check(&self, call: Call, address: ContentAddress, op: &'static str) -> Result<(), NetworkError> {
        let mut inner = self.0.write();
        inner.history.push(call);
        if inner.failing.contains(&address) {
            return Err(NetworkError::Connection {
                op,
                reason: format!("injected failure for {address}"),
            });
        }
        Ok(())
    }
}

impl Connection for MockNode {
    fn pin(&self, address: ContentAddress) -> Result<(), NetworkError> {
        self.check(Call::Pin(address), address, "pin")?;
        self.0.write().pinned.insert(address);
        Ok(())
    }

    fn unpin(&self, address: ContentAddress) -> Result<(), NetworkError> {
        self.check(Call::Unpin(address), address, "unpin")?;
        self.0.write().pinned.remove(&address);
        Ok(())
    }

    fn size(&self, address: ContentAddress) -> Result<u64, NetworkError> {
        self.check(Call::Size(address), address, "size")?;
        self.0
            .read()
            .data
            .get(&address)
            .map(|d| d.len() as u64)
            .ok_or(NetworkError::NotFound(address))
    }

    fn load(&self, address: ContentAddress) -> Result<Bytes, NetworkError> {
        self.check(Call::Load(address), address, "load")?;
        self.0
            .read()
            .data
            .get(&address)
            .cloned()
            .ok_or(NetworkError::NotFound(address))
    }

    fn store(&self, data: Bytes, codec: Codec) -> Result<ContentAddress, NetworkError> {
        let address = self.store_bytes(data, codec);
        self.0.write().history.push(Call::Store(address));
        Ok(address)
    }
}

/// Builds and stores the documents of a channel.
#[derive(Debug, Clone)]
pub struct ChannelFixture {
    name: String,
    picture: Option<ContentAddress>,
}

impl ChannelFixture {
    pub fn new(name: &str, picture: Option<ContentAddress>) -> Self {
        Self {
            name: name.to_string(),
            picture,
        }
    }

    /// Stores a post with at most one attachment and returns its address.
    pub fn post(
        node: &MockNode,
        publisher: ChannelKey,
        title: &str,
        attachment: Option<ContentAddress>,
    ) -> anyhow::Result<ContentAddress> {
        let record = StreamRecord {
            name: title.to_string(),
            description: "desc".to_string(),
            discussion: None,
            publisher,
            published_secs: 1,
            thumbnail: None,
            elements: attachment
                .into_iter()
                .map(|address| DataElement {
                    address,
                    mime: "image/jpeg".to_string(),
                    height: 100,
                    width: 100,
                })
                .collect(),
        };
        node.store_document(&record)
    }

    /// Stores the description, recommendations, records and index, returning the index.
    pub fn publish(&self, node: &MockNode, posts: &[ContentAddress]) -> anyhow::Result<ContentAddress> {
        let description = StreamDescription {
            name: self.name.clone(),
            description: "Description forthcoming".to_string(),
            picture: self.picture,
            email: None,
            website: None,
        };
        let index = StreamIndex {
            version: format::CURRENT_VERSION,
            description: node.store_document(&description)?,
            recommendations: node.store_document(&StreamRecommendations::default())?,
            records: node.store_document(&StreamRecords {
                records: posts.to_vec(),
            })?,
        };
        node.store_document(&index)
    }
}
