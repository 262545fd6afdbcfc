//! Runs user commands on a worker pool, serialized per channel key.
//!
//! Every command is queued under a serialization key. At most one command per key is in
//! flight at any time and commands of one key complete in submission order. Commands of
//! different keys run concurrently, bounded by the number of workers.

use std::{
    any::Any,
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    thread::JoinHandle,
};

use anyhow::Context as _;
use cacophony_base::{ChannelKey, ContentAddress};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, error_span, trace, warn};

use crate::{config::Config, net::NetworkError, slot::Slot};

/// What a command produced.
pub trait CommandResult: Send + 'static {
    /// The new root to publish, if the command changed anything publishable.
    fn index_to_publish(&self) -> Option<ContentAddress> {
        None
    }
}

/// Result of a command without a publishable change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Done;

impl CommandResult for Done {}

/// Result of a command that produced a new channel root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published(pub ContentAddress);

impl CommandResult for Published {
    fn index_to_publish(&self) -> Option<ContentAddress> {
        Some(self.0)
    }
}

/// Why a command failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(String),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("command runner is shut down")]
    Shutdown,
    #[error("command panicked: {0}")]
    Panicked(String),
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for CommandError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<NetworkError>() {
            Ok(err) => Self::Network(err),
            Err(err) => Self::Failed(Arc::new(err)),
        }
    }
}

/// What a command runs against: the resolved channel key and the shared environment.
pub struct Context<E> {
    key: Option<ChannelKey>,
    env: Arc<E>,
}

impl<E> Clone for Context<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            env: self.env.clone(),
        }
    }
}

impl<E> fmt::Debug for Context<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.key.map(|k| k.fmt_short()))
            .finish_non_exhaustive()
    }
}

impl<E> Context<E> {
    pub fn key(&self) -> Option<ChannelKey> {
        self.key
    }

    pub fn env(&self) -> &E {
        &self.env
    }
}

/// The pending result of a dispatched command.
pub struct FutureCommand<T, E> {
    slot: Arc<Slot<Result<T, CommandError>>>,
    context: Context<E>,
}

impl<T, E> fmt::Debug for FutureCommand<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureCommand")
            .field("context", &self.context)
            .field("done", &self.slot.is_set())
            .finish()
    }
}

impl<T, E> FutureCommand<T, E> {
    /// The context the command runs in.
    pub fn context(&self) -> &Context<E> {
        &self.context
    }

    pub fn is_done(&self) -> bool {
        self.slot.is_set()
    }
}

impl<T: Clone, E> FutureCommand<T, E> {
    /// Blocks until the command finished and returns its result.
    pub fn get(&self) -> Result<T, CommandError> {
        self.slot.wait_with(Clone::clone)
    }
}

/// Completes a command future. Dropped unfinished, it fails the future with
/// [`CommandError::Shutdown`].
struct Completion<T> {
    slot: Option<Arc<Slot<Result<T, CommandError>>>>,
}

impl<T> Completion<T> {
    fn complete(mut self, result: Result<T, CommandError>) {
        if let Some(slot) = self.slot.take() {
            slot.set(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.set(Err(CommandError::Shutdown));
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serialization key. `None` is the queue of commands without any channel.
type QueueKey = Option<ChannelKey>;

#[derive(Default)]
struct State {
    queues: HashMap<QueueKey, VecDeque<Job>>,
    in_flight: HashSet<QueueKey>,
    /// Keys with queued work and nothing in flight, each listed once.
    ready: VecDeque<QueueKey>,
    stopped: bool,
}

impl State {
    fn next_job(&mut self) -> Option<(QueueKey, Job)> {
        while let Some(key) = self.ready.pop_front() {
            if let Some(job) = self.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                self.in_flight.insert(key);
                return Some((key, job));
            }
        }
        None
    }

    fn release(&mut self, key: QueueKey) {
        self.in_flight.remove(&key);
        match self.queues.get(&key) {
            Some(queue) if !queue.is_empty() => self.ready.push_back(key),
            _ => {
                self.queues.remove(&key);
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Dispatches commands to a fixed pool of workers.
///
/// Commands may be submitted before [`CommandRunner::start_threads`]; they stay queued in
/// order until workers exist. [`CommandRunner::shutdown_threads`] refuses new commands,
/// lets the workers drain everything already queued and joins them.
pub struct CommandRunner<E> {
    env: Arc<E>,
    default_key: Option<ChannelKey>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<E> fmt::Debug for CommandRunner<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("default_key", &self.default_key.map(|k| k.fmt_short()))
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl<E: Send + Sync + 'static> CommandRunner<E> {
    pub fn new(env: E, default_key: Option<ChannelKey>) -> Self {
        Self {
            env: Arc::new(env),
            default_key,
            shared: Default::default(),
            workers: Default::default(),
        }
    }

    pub fn env(&self) -> &Arc<E> {
        &self.env
    }

    /// Queues `command` under the override key, or the default key if there is none.
    pub fn run_command<T, F>(&self, command: F, key_override: Option<ChannelKey>) -> FutureCommand<T, E>
    where
        T: CommandResult,
        F: FnOnce(&Context<E>) -> Result<T, CommandError> + Send + 'static,
    {
        let key = key_override.or(self.default_key);
        self.dispatch(key, key, command)
    }

    /// Queues `command` under `blocking_key` while the context carries the override or the
    /// default key.
    ///
    /// Commands queued this way before the workers start run in queue order once they do.
    pub fn run_blocked_command<T, F>(
        &self,
        blocking_key: ChannelKey,
        command: F,
        key_override: Option<ChannelKey>,
    ) -> FutureCommand<T, E>
    where
        T: CommandResult,
        F: FnOnce(&Context<E>) -> Result<T, CommandError> + Send + 'static,
    {
        let key = key_override.or(self.default_key);
        self.dispatch(Some(blocking_key), key, command)
    }

    /// Spawns `threads` workers.
    pub fn start_threads(&self, threads: usize) -> anyhow::Result<()> {
        anyhow::ensure!(threads > 0, "command runner needs at least one thread");
        anyhow::ensure!(!self.shared.state.lock().stopped, "command runner is shut down");
        let mut workers = self.workers.lock();
        let first = workers.len();
        for i in first..first + threads {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cmd-worker-{i}"))
                .spawn(move || {
                    let span = error_span!("cmd-worker", i);
                    let _enter = span.enter();
                    worker_loop(&shared);
                })
                .context("failed to spawn command worker")?;
            workers.push(handle);
        }
        debug!(threads, "command workers started");
        Ok(())
    }

    /// Spawns [`Config::command_threads`] workers.
    pub fn start_threads_with(&self, config: &Config) -> anyhow::Result<()> {
        self.start_threads(config.command_threads)
    }

    fn dispatch<T, F>(&self, queue: QueueKey, key: Option<ChannelKey>, command: F) -> FutureCommand<T, E>
    where
        T: CommandResult,
        F: FnOnce(&Context<E>) -> Result<T, CommandError> + Send + 'static,
    {
        let slot = Slot::new();
        let context = Context {
            key,
            env: self.env.clone(),
        };
        let completion = Completion {
            slot: Some(slot.clone()),
        };
        let ctx = context.clone();
        let job: Job = Box::new(move || {
            let result = match std::panic::catch_unwind(AssertUnwindSafe(|| command(&ctx))) {
                Ok(result) => result,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    error!(%msg, "command panicked");
                    Err(CommandError::Panicked(msg))
                }
            };
            completion.complete(result);
        });

        let mut state = self.shared.state.lock();
        if state.stopped {
            trace!("command after shutdown");
            // dropping the job fails the future
            drop(state);
            drop(job);
        } else {
            let queued = state.queues.entry(queue).or_default();
            queued.push_back(job);
            if queued.len() == 1 && !state.in_flight.contains(&queue) {
                state.ready.push_back(queue);
                self.shared.wake.notify_one();
            }
        }
        FutureCommand { slot, context }
    }
}

impl<E> CommandRunner<E> {
    /// Stops accepting commands, drains queued work and joins the workers.
    ///
    /// Commands still queued when no worker is left fail with [`CommandError::Shutdown`].
    pub fn shutdown_threads(&self) {
        self.shared.state.lock().stopped = true;
        self.shared.wake.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.join() {
                warn!(?err, "failed to join command worker");
            }
        }
        let orphaned = std::mem::take(&mut self.shared.state.lock().queues);
        if !orphaned.is_empty() {
            debug!(keys = orphaned.len(), "dropping commands queued without workers");
        }
    }
}

impl<E> Drop for CommandRunner<E> {
    fn drop(&mut self) {
        self.shutdown_threads();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (key, job) = {
            let mut state = shared.state.lock();
            loop {
                if let Some(next) = state.next_job() {
                    break next;
                }
                if state.stopped {
                    trace!("exit");
                    return;
                }
                shared.wake.wait(&mut state);
            }
        };
        trace!(key = ?key.map(|k| k.fmt_short()), "run command");
        // the job catches panics of the command itself
        job();
        let mut state = shared.state.lock();
        state.release(key);
        if !state.ready.is_empty() {
            shared.wake.notify_one();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
