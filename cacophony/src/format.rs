//! The published document graph of a channel.
//!
//! A channel's root address names a [`StreamIndex`]. From there the graph reaches the
//! channel's description, its recommendations, and the list of post records. Documents are
//! stored postcard encoded under [`Codec::Document`] addresses.

use anyhow::Context;
use bytes::Bytes;
use cacophony_base::{ChannelKey, Codec, ContentAddress};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Version of the document graph this crate reads and writes.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamIndex {
    pub version: u32,
    pub description: ContentAddress,
    pub recommendations: ContentAddress,
    pub records: ContentAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub name: String,
    pub description: String,
    pub picture: Option<ContentAddress>,
    pub email: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecommendations {
    pub channels: Vec<ChannelKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecords {
    pub records: Vec<ContentAddress>,
}

/// One post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub name: String,
    pub description: String,
    pub discussion: Option<String>,
    pub publisher: ChannelKey,
    pub published_secs: u64,
    pub thumbnail: Option<ContentAddress>,
    pub elements: Vec<DataElement>,
}

/// An attachment of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataElement {
    pub address: ContentAddress,
    pub mime: String,
    pub height: u32,
    pub width: u32,
}

impl StreamRecord {
    /// The largest attachment whose dimensions fit in `edge_max` pixels, used as the
    /// leaf to cache for followees.
    pub fn best_leaf(&self, edge_max: u32) -> Option<&DataElement> {
        self.elements
            .iter()
            .filter(|e| e.height <= edge_max && e.width <= edge_max)
            .max_by_key(|e| (e.height.max(e.width), e.address))
    }
}

/// Encodes a document for storage.
pub fn encode<T: Serialize>(doc: &T) -> anyhow::Result<Bytes> {
    Ok(postcard::to_stdvec(doc)?.into())
}

/// Decodes a stored document. Usable as a [`Decoder`](crate::net::Decoder).
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    postcard::from_bytes(bytes).context("invalid document")
}

/// Decodes a [`StreamIndex`] and rejects versions this crate does not understand.
pub fn decode_index(bytes: &[u8]) -> anyhow::Result<StreamIndex> {
    let index: StreamIndex = decode(bytes)?;
    anyhow::ensure!(
        index.version == CURRENT_VERSION,
        "unsupported index version {}",
        index.version
    );
    Ok(index)
}

/// Address a document will be stored under.
pub fn address_of<T: Serialize>(doc: &T) -> anyhow::Result<ContentAddress> {
    Ok(ContentAddress::for_content(encode(doc)?, Codec::Document))
}
