//! Pin and read operations staged outside the model's write lock.
//!
//! The usual flow is:
//! - take read access, snapshot the pinned set, build the transaction, release the lock
//! - do the long running network work against the transaction
//! - take write access and [`commit`](ConcurrentTransaction::commit) or
//!   [`rollback`](ConcurrentTransaction::rollback) into a [`StateResolver`]

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use cacophony_base::ContentAddress;
use tracing::{debug, trace, warn};

use crate::net::{Decoder, FutureRead, NetworkError, NetworkFuture, NetworkScheduler};

/// Applies the outcome of a transaction to durable state.
pub trait StateResolver {
    /// `deltas` holds the net reference count change per address, never zero. `false_pins`
    /// holds addresses pinned on the network whose logical effect was discarded.
    fn commit_transaction_pin_counts(
        &mut self,
        deltas: HashMap<ContentAddress, i64>,
        false_pins: HashSet<ContentAddress>,
    ) -> anyhow::Result<()>;
}

/// Buffers pin intents and caches reads for one logical operation.
///
/// `existing` is the set of addresses known to be pinned when the transaction started. It
/// is not refreshed.
#[derive(Debug)]
pub struct ConcurrentTransaction<'a, S: ?Sized> {
    network: &'a S,
    existing: HashSet<ContentAddress>,
    deltas: HashMap<ContentAddress, i64>,
    network_pins: HashMap<ContentAddress, NetworkFuture<()>>,
    sizes: HashMap<ContentAddress, NetworkFuture<u64>>,
    loads: HashMap<ContentAddress, NetworkFuture<Bytes>>,
    finished: bool,
}

impl<'a, S: NetworkScheduler + ?Sized> ConcurrentTransaction<'a, S> {
    pub fn new(network: &'a S, existing: HashSet<ContentAddress>) -> Self {
        Self {
            network,
            existing,
            deltas: HashMap::new(),
            network_pins: HashMap::new(),
            sizes: HashMap::new(),
            loads: HashMap::new(),
            finished: false,
        }
    }

    /// Records one more reference to `address`.
    ///
    /// Addresses outside the existing set are pinned on the network right away, at most once
    /// per transaction.
    pub fn pin(&mut self, address: ContentAddress) -> NetworkFuture<()> {
        self.change(address, 1);
        if self.existing.contains(&address) {
            return NetworkFuture::ready(Ok(()));
        }
        let network = self.network;
        self.network_pins
            .entry(address)
            .or_insert_with(|| {
                trace!(%address, "eager pin");
                network.add_pin(address)
            })
            .clone()
    }

    /// Records one less reference to `address`. The network unpin happens after commit.
    pub fn unpin(&mut self, address: ContentAddress) {
        self.change(address, -1);
    }

    pub fn get_size_in_bytes(&mut self, address: ContentAddress) -> NetworkFuture<u64> {
        let network = self.network;
        self.sizes
            .entry(address)
            .or_insert_with(|| network.get_size_in_bytes(address))
            .clone()
    }

    /// Loads `address`, sharing the bytes with earlier loads of the same address.
    pub fn load_cached<R>(&mut self, address: ContentAddress, decoder: Decoder<R>) -> FutureRead<R> {
        let network = self.network;
        let data = self
            .loads
            .entry(address)
            .or_insert_with(|| network.load_data(address))
            .clone();
        FutureRead::new(address, data, decoder)
    }

    /// Net reference change staged for `address`.
    pub fn delta(&self, address: &ContentAddress) -> i64 {
        self.deltas.get(address).copied().unwrap_or(0)
    }

    /// Hands the staged deltas to `resolver`.
    ///
    /// Waits for every eager pin first. If any of them failed the transaction is rolled back
    /// instead and the pin error returned. Eager pins whose delta cancelled out are reported
    /// as false pins.
    pub fn commit<R: StateResolver + ?Sized>(mut self, resolver: &mut R) -> anyhow::Result<()> {
        if let Some(err) = self.wait_for_pins() {
            warn!(%err, "eager pin failed, rolling back");
            if let Err(rollback) = self.finish_rollback(resolver) {
                warn!(err = %format!("{rollback:#}"), "rollback after failed pin also failed");
            }
            return Err(err.into());
        }
        self.finished = true;
        let deltas = std::mem::take(&mut self.deltas);
        let cancelled: HashSet<_> = self
            .network_pins
            .drain()
            .map(|(address, _)| address)
            .filter(|address| !deltas.contains_key(address))
            .collect();
        debug!(changed = deltas.len(), cancelled = cancelled.len(), "commit transaction");
        resolver.commit_transaction_pin_counts(deltas, cancelled)
    }

    /// Discards the staged deltas and reports every eager pin as a false pin.
    pub fn rollback<R: StateResolver + ?Sized>(mut self, resolver: &mut R) -> anyhow::Result<()> {
        // pins still in flight must land before they can be undone
        self.wait_for_pins();
        self.finish_rollback(resolver)
    }

    fn finish_rollback<R: StateResolver + ?Sized>(&mut self, resolver: &mut R) -> anyhow::Result<()> {
        self.finished = true;
        let false_pins: HashSet<_> = self.network_pins.drain().map(|(a, _)| a).collect();
        debug!(false_pins = false_pins.len(), "rollback transaction");
        resolver.commit_transaction_pin_counts(HashMap::new(), false_pins)
    }

    fn change(&mut self, address: ContentAddress, by: i64) {
        let delta = self.deltas.entry(address).or_insert(0);
        *delta += by;
        // a pin and unpin of the same address cancel out
        if *delta == 0 {
            self.deltas.remove(&address);
        }
    }

    /// Waits for all eager pins, returning the first failure.
    fn wait_for_pins(&self) -> Option<NetworkError> {
        let mut first = None;
        for (address, pin) in &self.network_pins {
            if let Err(err) = pin.wait() {
                warn!(%address, %err, "eager pin failed");
                first.get_or_insert(err);
            }
        }
        first
    }
}

impl<'a, S: ?Sized> Drop for ConcurrentTransaction<'a, S> {
    fn drop(&mut self) {
        if !self.finished && !self.network_pins.is_empty() {
            warn!(
                pins = self.network_pins.len(),
                "transaction dropped without commit or rollback, eager pins leaked"
            );
        }
    }
}
