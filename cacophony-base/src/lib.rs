//! Base types and utilities for cacophony

pub mod base32;
pub mod hash;
pub mod key;

pub use hash::{Codec, ContentAddress, Hash};
pub use key::{ChannelKey, ChannelSecret, KeyParsingError};
