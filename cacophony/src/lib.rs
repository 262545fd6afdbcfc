//! Local pin ledger, opcode log and command scheduling for a cacophony client.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod format;
pub mod model;
pub mod net;
pub mod opcode;
pub mod pin_cache;
pub mod projection;
pub mod runner;
mod slot;
pub mod transaction;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use cacophony_base::{ChannelKey, ChannelSecret, Codec, ContentAddress, Hash};

pub use crate::model::LocalDataModel;
pub use crate::pin_cache::PinCacheBuilder;
pub use crate::projection::PinCacheData;
pub use crate::runner::{CommandRunner, FutureCommand};
pub use crate::transaction::{ConcurrentTransaction, StateResolver};
