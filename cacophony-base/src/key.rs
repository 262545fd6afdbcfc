//! Channel identities.

use std::{
    fmt::{self, Debug, Display},
    hash::Hash,
    str::FromStr,
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::base32::{self, HexOrBase32ParseError};

/// The public key a channel publishes under.
///
/// Channel keys are the unit of command serialization, so they are cheap to copy, hash and
/// compare.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelKey(VerifyingKey);

impl Hash for ChannelKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl PartialOrd for ChannelKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Serialize for ChannelKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.as_bytes().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; 32] = serde::Deserialize::deserialize(deserializer)?;
            Self::from_bytes(&data).map_err(serde::de::Error::custom)
        }
    }
}

impl ChannelKey {
    /// The length of an ed25519 public key, in bytes.
    pub const LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

    /// Get this key as a byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Construct a `ChannelKey` from a slice of bytes.
    ///
    /// Fails if the bytes do not represent a valid curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        Ok(Self(VerifyingKey::from_bytes(bytes)?))
    }

    /// Convert to a base32 string limited to the first 5 bytes for a friendly string
    /// representation of the key.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.as_bytes())
    }
}

impl AsRef<[u8]> for ChannelKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<VerifyingKey> for ChannelKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey({})", base32::fmt(self.as_bytes()))
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

/// Error when parsing a [`ChannelKey`] or a [`ChannelSecret`].
#[derive(thiserror::Error, Debug)]
pub enum KeyParsingError {
    /// Error when decoding the text form.
    #[error("encoding: {0}")]
    Encoding(#[from] HexOrBase32ParseError),
    /// The bytes are not a valid key.
    #[error("key: {0}")]
    Key(#[from] ed25519_dalek::SignatureError),
}

/// Deserialises the [`ChannelKey`] from its base32 or hex encoding.
impl FromStr for ChannelKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base32::parse_array_hex_or_base32::<32>(s)?;
        Self::from_bytes(&bytes)
    }
}

/// The secret half of a channel identity.
///
/// Signing is handled by the key management layer; this type only exists so channel keys
/// can be derived and round-tripped.
#[derive(Clone)]
pub struct ChannelSecret(SigningKey);

impl Debug for ChannelSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelSecret(..)")
    }
}

impl ChannelSecret {
    /// Generate a new secret from the given randomness source.
    pub fn generate<R: CryptoRngCore + ?Sized>(csprng: &mut R) -> Self {
        Self(SigningKey::generate(csprng))
    }

    /// Create a secret from its raw 32 bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// The raw bytes of the secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The channel key belonging to this secret.
    pub fn public(&self) -> ChannelKey {
        ChannelKey(self.0.verifying_key())
    }
}

impl FromStr for ChannelSecret {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base32::parse_array_hex_or_base32::<32>(s)?;
        Ok(Self::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_key_display_roundtrip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let key = ChannelSecret::generate(&mut rng).public();
        let text = key.to_string();
        assert_eq!(text.parse::<ChannelKey>().unwrap(), key);
        assert!(text.starts_with(&key.fmt_short()));
    }

    #[test]
    fn test_key_postcard() {
        let key = ChannelSecret::from_bytes(&[3u8; 32]).public();
        let bytes = postcard::to_stdvec(&key).unwrap();
        assert_eq!(bytes.len(), 32);
        let de: ChannelKey = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(key, de);
    }

    #[test]
    fn test_key_json() {
        let key = ChannelSecret::from_bytes(&[9u8; 32]).public();
        let ser = serde_json::to_string(&key).unwrap();
        let de: ChannelKey = serde_json::from_str(&ser).unwrap();
        assert_eq!(key, de);
    }

    #[test]
    fn test_secret_parse() {
        let secret = ChannelSecret::from_bytes(&[1u8; 32]);
        let text = hex::encode(secret.to_bytes());
        let parsed: ChannelSecret = text.parse().unwrap();
        assert_eq!(parsed.public(), secret.public());
        assert_eq!(format!("{parsed:?}"), "ChannelSecret(..)");
    }

    proptest! {
        #[test]
        fn key_order_follows_bytes(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let ka = ChannelSecret::from_bytes(&a).public();
            let kb = ChannelSecret::from_bytes(&b).public();
            let set: BTreeSet<_> = [ka, kb].into_iter().collect();
            prop_assert_eq!(set.len(), if ka == kb { 1 } else { 2 });
            prop_assert_eq!(ka.cmp(&kb), ka.as_bytes().cmp(kb.as_bytes()));
        }
    }
}
