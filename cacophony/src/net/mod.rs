//! Interface to the storage network.
//!
//! The core never talks to the storage node directly. It goes through a
//! [`NetworkScheduler`], whose calls return a [`NetworkFuture`] right away and complete on
//! the scheduler's own threads.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use cacophony_base::{Codec, ContentAddress};

use crate::slot::Slot;

mod threaded;

pub use self::threaded::{Connection, InlineScheduler, ThreadedScheduler};

/// Failures of network calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("{op} failed: {reason}")]
    Connection { op: &'static str, reason: String },
    #[error("content not found: {0}")]
    NotFound(ContentAddress),
    #[error("failed to decode {address}: {reason}")]
    Decode {
        address: ContentAddress,
        reason: String,
    },
    #[error("network scheduler is shut down")]
    Shutdown,
}

/// Asynchronous primitives of the storage network.
pub trait NetworkScheduler: Send + Sync + fmt::Debug {
    fn add_pin(&self, address: ContentAddress) -> NetworkFuture<()>;
    fn remove_pin(&self, address: ContentAddress) -> NetworkFuture<()>;
    fn get_size_in_bytes(&self, address: ContentAddress) -> NetworkFuture<u64>;
    fn load_data(&self, address: ContentAddress) -> NetworkFuture<Bytes>;
    fn store_data(&self, data: Bytes, codec: Codec) -> NetworkFuture<ContentAddress>;
}

/// Decodes the raw bytes of a loaded address.
pub type Decoder<R> = fn(&[u8]) -> anyhow::Result<R>;

/// Loads `address` and decodes it on the thread that calls [`FutureRead::get`].
pub fn read<S, R>(network: &S, address: ContentAddress, decoder: Decoder<R>) -> FutureRead<R>
where
    S: NetworkScheduler + ?Sized,
{
    FutureRead::new(address, network.load_data(address), decoder)
}

/// The result of a network call, completed exactly once.
///
/// Clones observe the same result.
pub struct NetworkFuture<T> {
    slot: Arc<Slot<Result<T, NetworkError>>>,
}

impl<T> Clone for NetworkFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> fmt::Debug for NetworkFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> NetworkFuture<T> {
    /// A future plus the handle that completes it.
    pub fn pending() -> (Self, Completer<T>) {
        let slot = Slot::new();
        let completer = Completer {
            slot: Some(slot.clone()),
        };
        (Self { slot }, completer)
    }

    /// An already completed future.
    pub fn ready(result: Result<T, NetworkError>) -> Self {
        Self {
            slot: Slot::filled(result),
        }
    }

    pub fn is_done(&self) -> bool {
        self.slot.is_set()
    }

    /// Blocks until complete, returning only whether the call succeeded.
    pub fn wait(&self) -> Result<(), NetworkError> {
        self.slot.wait_with(|res| match res {
            Ok(_) => Ok(()),
            Err(err) => Err(err.clone()),
        })
    }
}

impl<T: Clone> NetworkFuture<T> {
    /// Blocks until complete and returns the result.
    pub fn get(&self) -> Result<T, NetworkError> {
        self.slot.wait_with(Clone::clone)
    }
}

/// Completes a [`NetworkFuture`].
///
/// Dropping it without completing fails the future with [`NetworkError::Shutdown`], so
/// waiters never hang on abandoned work.
#[derive(Debug)]
pub struct Completer<T> {
    slot: Option<Arc<Slot<Result<T, NetworkError>>>>,
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: Result<T, NetworkError>) {
        if let Some(slot) = self.slot.take() {
            slot.set(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.set(Err(NetworkError::Shutdown));
        }
    }
}

/// A pending load whose bytes are decoded when read.
pub struct FutureRead<R> {
    address: ContentAddress,
    data: NetworkFuture<Bytes>,
    decoder: Decoder<R>,
}

impl<R> fmt::Debug for FutureRead<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureRead")
            .field("address", &self.address)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl<R> FutureRead<R> {
    pub fn new(address: ContentAddress, data: NetworkFuture<Bytes>, decoder: Decoder<R>) -> Self {
        Self {
            address,
            data,
            decoder,
        }
    }

    pub fn address(&self) -> ContentAddress {
        self.address
    }

    /// Blocks for the bytes and decodes them.
    pub fn get(&self) -> Result<R, NetworkError> {
        let bytes = self.data.get()?;
        (self.decoder)(&bytes).map_err(|err| NetworkError::Decode {
            address: self.address,
            reason: format!("{err:#}"),
        })
    }
}
