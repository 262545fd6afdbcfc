//! The blake3 hash and the content addresses built on it.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::base32;

/// Hash type used throughout.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash(blake3::Hash);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Hash {
    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Hash(blake3::hash(buf.as_ref()))
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Convert the hash to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// First 5 bytes in base32, for log output.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.as_bytes())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(blake3::Hash::from(value))
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32::fmt(self.as_bytes()))
    }
}

impl FromStr for Hash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(
            s.len() == 64 || s.len() == 52,
            "invalid hash length {}",
            s.len()
        );
        let bytes = base32::parse_array_hex_or_base32::<32>(s)?;
        Ok(Self::from(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.as_bytes().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Ok(Hash::from(bytes))
        }
    }
}

/// How the content behind an address is encoded.
///
/// This is carried alongside the digest but never takes part in address identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Debug)]
pub enum Codec {
    /// Opaque bytes, such as images or video.
    #[default]
    Raw,
    /// A structured document of the published stream format.
    Document,
}

impl Codec {
    /// Is raw content
    pub const fn is_raw(&self) -> bool {
        matches!(self, Codec::Raw)
    }

    /// Is a structured document
    pub const fn is_document(&self) -> bool {
        matches!(self, Codec::Document)
    }
}

/// An immutable, self-verifying name for a piece of content on the network.
///
/// Two addresses are equal iff their digests are equal; the [`Codec`] is metadata.
#[derive(Clone, Copy)]
pub struct ContentAddress {
    hash: Hash,
    codec: Codec,
}

impl ContentAddress {
    /// Address of raw content with the given digest.
    pub const fn raw(hash: Hash) -> Self {
        Self {
            hash,
            codec: Codec::Raw,
        }
    }

    /// Address of a structured document with the given digest.
    pub const fn document(hash: Hash) -> Self {
        Self {
            hash,
            codec: Codec::Document,
        }
    }

    /// Address the given bytes would be stored under.
    pub fn for_content(data: impl AsRef<[u8]>, codec: Codec) -> Self {
        Self {
            hash: Hash::new(data),
            codec,
        }
    }

    /// The digest.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The encoding metadata.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// First 5 bytes of the digest in base32, for log output.
    pub fn fmt_short(&self) -> String {
        self.hash.fmt_short()
    }
}

impl PartialEq for ContentAddress {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ContentAddress {}

impl std::hash::Hash for ContentAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for ContentAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl From<Hash> for ContentAddress {
    fn from(hash: Hash) -> Self {
        Self::raw(hash)
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({self})")
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.codec {
            Codec::Raw => write!(f, "{}", self.hash),
            Codec::Document => write!(f, "d{}", self.hash),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            53 | 65 if s.starts_with('d') => Ok(Self::document(s[1..].parse()?)),
            52 | 64 => Ok(Self::raw(s.parse()?)),
            _ => anyhow::bail!("invalid content address"),
        }
    }
}

impl Serialize for ContentAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            (self.hash, self.codec).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let (hash, codec) = <(Hash, Codec)>::deserialize(deserializer)?;
            Ok(Self { hash, codec })
        }
    }
}
