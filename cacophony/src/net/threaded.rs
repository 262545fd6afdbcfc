//! Schedulers built on a blocking [`Connection`] to the storage node.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    thread::JoinHandle,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use cacophony_base::{Codec, ContentAddress};
use parking_lot::Mutex;
use tracing::{debug, debug_span, error, trace, warn};

use super::{NetworkError, NetworkFuture, NetworkScheduler};
use crate::config::Config;

/// Blocking calls against a storage node.
pub trait Connection: Send + Sync + 'static {
    fn pin(&self, address: ContentAddress) -> Result<(), NetworkError>;
    fn unpin(&self, address: ContentAddress) -> Result<(), NetworkError>;
    fn size(&self, address: ContentAddress) -> Result<u64, NetworkError>;
    fn load(&self, address: ContentAddress) -> Result<Bytes, NetworkError>;
    fn store(&self, data: Bytes, codec: Codec) -> Result<ContentAddress, NetworkError>;
}

/// Runs every call on the calling thread. The returned futures are always complete.
#[derive(Debug)]
pub struct InlineScheduler<C> {
    conn: C,
}

impl<C: Connection> InlineScheduler<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }
}

impl<C: Connection + fmt::Debug> NetworkScheduler for InlineScheduler<C> {
    fn add_pin(&self, address: ContentAddress) -> NetworkFuture<()> {
        NetworkFuture::ready(self.conn.pin(address))
    }

    fn remove_pin(&self, address: ContentAddress) -> NetworkFuture<()> {
        NetworkFuture::ready(self.conn.unpin(address))
    }

    fn get_size_in_bytes(&self, address: ContentAddress) -> NetworkFuture<u64> {
        NetworkFuture::ready(self.conn.size(address))
    }

    fn load_data(&self, address: ContentAddress) -> NetworkFuture<Bytes> {
        NetworkFuture::ready(self.conn.load(address))
    }

    fn store_data(&self, data: Bytes, codec: Codec) -> NetworkFuture<ContentAddress> {
        NetworkFuture::ready(self.conn.store(data, codec))
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs calls on a fixed pool of worker threads.
///
/// Jobs are picked up in submission order. After [`ThreadedScheduler::shutdown`] every new
/// call fails with [`NetworkError::Shutdown`]; jobs queued before it still run.
pub struct ThreadedScheduler<C> {
    conn: Arc<C>,
    tx: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C> fmt::Debug for ThreadedScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedScheduler")
            .field("workers", &self.workers.lock().len())
            .field("running", &self.tx.lock().is_some())
            .finish()
    }
}

impl<C: Connection> ThreadedScheduler<C> {
    /// Spawns `threads` workers calling into `conn`.
    pub fn new(conn: C, threads: usize) -> Result<Self> {
        anyhow::ensure!(threads > 0, "network scheduler needs at least one thread");
        let (tx, rx) = flume::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("net-worker-{i}"))
                .spawn(move || {
                    let span = debug_span!("net-worker", i);
                    let _enter = span.enter();
                    while let Ok(job) = rx.recv() {
                        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("network job panicked");
                        }
                    }
                    trace!("exit");
                })
                .context("failed to spawn network worker")?;
            workers.push(handle);
        }
        debug!(threads, "network scheduler started");
        Ok(Self {
            conn: Arc::new(conn),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Spawns [`Config::network_threads`] workers calling into `conn`.
    pub fn from_config(conn: C, config: &Config) -> Result<Self> {
        Self::new(conn, config.network_threads)
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    fn submit<T, F>(&self, f: F) -> NetworkFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T, NetworkError> + Send + 'static,
    {
        let (future, completer) = NetworkFuture::pending();
        let conn = self.conn.clone();
        let job: Job = Box::new(move || completer.complete(f(&conn)));
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            // the job is dropped here, which fails the future
            None => false,
        };
        if !sent {
            trace!("call after shutdown");
        }
        future
    }
}

impl<C> ThreadedScheduler<C> {
    /// Stops accepting calls, lets queued calls finish and joins the workers.
    pub fn shutdown(&self) {
        // dropping the sender ends the workers once the queue is drained
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.join() {
                warn!(?err, "failed to join network worker");
            }
        }
    }
}

impl<C> Drop for ThreadedScheduler<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: Connection> NetworkScheduler for ThreadedScheduler<C> {
    fn add_pin(&self, address: ContentAddress) -> NetworkFuture<()> {
        self.submit(move |conn| conn.pin(address))
    }

    fn remove_pin(&self, address: ContentAddress) -> NetworkFuture<()> {
        self.submit(move |conn| conn.unpin(address))
    }

    fn get_size_in_bytes(&self, address: ContentAddress) -> NetworkFuture<u64> {
        self.submit(move |conn| conn.size(address))
    }

    fn load_data(&self, address: ContentAddress) -> NetworkFuture<Bytes> {
        self.submit(move |conn| conn.load(address))
    }

    fn store_data(&self, data: Bytes, codec: Codec) -> NetworkFuture<ContentAddress> {
        self.submit(move |conn| conn.store(data, codec))
    }
}
