//! Durable local data model backed by the opcode log.
//!
//! On disk the model is a directory with two files: `version`, holding a single version
//! byte, and `opcodes.log`, the append-only opcode log. Opening replays the whole log into
//! fresh [`Projections`]. Writers mutate the projections right away and append the matching
//! opcodes as a new compressed member when they flush.

use std::{
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    io::{BufReader, BufWriter, Write},
    ops::Deref,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use cacophony_base::{ChannelKey, ContentAddress};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    net::{NetworkError, NetworkScheduler},
    opcode::{self, Opcode},
    projection::{
        CachedRecordInfo, ChannelConfig, ExplicitUserInfo, FolloweeMutation, FollowingCacheElement,
        MiscMutation, PrefValue, Projections,
    },
    transaction::StateResolver,
};

/// Version of the on-disk layout written by this crate.
pub const LOCAL_CONFIG_VERSION: u8 = 4;

const VERSION_FILE: &str = "version";
const OPCODE_LOG: &str = "opcodes.log";

/// Reasons a data directory cannot be opened.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unsupported local data version {0}")]
    UnsupportedVersion(u8),
    #[error("opcode log present without a version file")]
    MissingVersion,
}

/// The local model: projections guarded by a reader/writer lock plus their durable log.
#[derive(Debug)]
pub struct LocalDataModel {
    dir: PathBuf,
    state: RwLock<Projections>,
}

impl LocalDataModel {
    /// Opens the model stored in `dir`, creating an empty one if the directory holds none.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        let version_path = dir.join(VERSION_FILE);
        let log_path = dir.join(OPCODE_LOG);

        if version_path.exists() {
            let bytes = fs::read(&version_path).context("failed to read version file")?;
            match bytes.as_slice() {
                [LOCAL_CONFIG_VERSION] => {}
                [other] => return Err(ModelError::UnsupportedVersion(*other).into()),
                _ => return Err(ModelError::UnsupportedVersion(0).into()),
            }
        } else if log_path.exists() {
            return Err(ModelError::MissingVersion.into());
        } else {
            fs::write(&version_path, [LOCAL_CONFIG_VERSION])
                .context("failed to write version file")?;
        }

        let mut projections = Projections::default();
        let mut torn_tail = false;
        if log_path.exists() {
            let file = fs::File::open(&log_path).context("failed to open opcode log")?;
            let replay = opcode::decode_whole_stream(BufReader::new(file), &mut projections)
                .with_context(|| format!("failed to replay {}", log_path.display()))?;
            debug!(applied = replay.applied, "replayed opcode log");
            torn_tail = replay.torn_tail;
        }
        info!(
            dir = %dir.display(),
            pins = projections.pins().len(),
            followees = projections.followees().known_followees().count(),
            "opened local data model"
        );
        let model = Self {
            dir,
            state: RwLock::new(projections),
        };
        // members appended after a torn one could never be read back
        if torn_tail {
            warn!("opcode log has a torn tail, rewriting it");
            model.compact()?;
        }
        Ok(model)
    }

    /// Opens the model in the configured data directory.
    pub fn open_with(config: &Config) -> Result<Self> {
        Self::open(&config.data_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shared access. Any number of readers may hold it, never together with a writer.
    pub fn read(&self) -> RwLockReadGuard<'_, Projections> {
        self.state.read()
    }

    /// Exclusive access for mutation.
    pub fn write(&self) -> WriteAccess<'_> {
        WriteAccess {
            dir: &self.dir,
            state: self.state.write(),
            pending: Vec::new(),
        }
    }

    /// Rewrites the log as a snapshot of the current state.
    ///
    /// The snapshot is written to a temporary file in the data directory and renamed over
    /// the log, so a crash leaves either the old or the new log in place.
    pub fn compact(&self) -> Result<()> {
        let state = self.state.write();
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context("failed to create temporary log")?;
        let mut writer = opcode::create_writer(BufWriter::new(tmp));
        state.write_snapshot(&mut writer)?;
        let written = writer.written();
        let tmp = writer
            .finish()?
            .into_inner()
            .map_err(|err| err.into_error())
            .context("failed to flush temporary log")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(OPCODE_LOG))
            .map_err(|err| err.error)
            .context("failed to replace opcode log")?;
        info!(written, "compacted opcode log");
        Ok(())
    }
}

/// Exclusive access to the model.
///
/// Mutations take effect in memory immediately and are made durable by
/// [`WriteAccess::flush`]. Dropping the guard flushes whatever is still pending.
pub struct WriteAccess<'a> {
    dir: &'a Path,
    state: RwLockWriteGuard<'a, Projections>,
    pending: Vec<Opcode>,
}

impl std::fmt::Debug for WriteAccess<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAccess")
            .field("dir", &self.dir)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Deref for WriteAccess<'a> {
    type Target = Projections;

    fn deref(&self) -> &Projections {
        &self.state
    }
}

impl<'a> WriteAccess<'a> {
    /// The addresses currently pinned, used to seed a transaction.
    pub fn pin_snapshot(&self) -> HashSet<ContentAddress> {
        self.state.pins().snapshot_pinned_set()
    }

    /// Number of opcodes applied but not yet durable.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Appends pending opcodes to the log as a new member and syncs it.
    ///
    /// On failure the opcodes stay pending and the log is cut back to its previous length,
    /// so a later flush writes them again.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(OPCODE_LOG);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let start = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if let Err(err) = append_member(&mut file, &self.pending) {
            if let Err(err) = file.set_len(start) {
                warn!(%err, start, "failed to cut back partial member");
            }
            return Err(err.context(format!("failed to append to {}", path.display())));
        }
        trace!(records = self.pending.len(), "flushed opcodes");
        self.pending.clear();
        Ok(())
    }

    /// Flushes and releases the lock.
    pub fn commit(mut self) -> Result<()> {
        self.flush()
    }

    /// A resolver applying transaction outcomes through this guard.
    pub fn resolver<'w, S>(&'w mut self, network: &'w S) -> PinResolver<'w, 'a, S>
    where
        S: NetworkScheduler + ?Sized,
    {
        PinResolver {
            access: self,
            network,
        }
    }

    fn record(&mut self, op: impl Into<Opcode>) {
        let op = op.into();
        op.apply(&mut *self.state);
        self.pending.push(op);
    }
}

/// Writes `ops` as one compressed member at the end of `file` and syncs it.
fn append_member(file: &mut fs::File, ops: &[Opcode]) -> Result<()> {
    let mut writer = opcode::create_writer(BufWriter::new(&mut *file));
    for op in ops {
        writer.write(op)?;
    }
    let mut sink = writer.finish()?;
    sink.flush()?;
    drop(sink);
    file.sync_data()?;
    Ok(())
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(?err, "failed to flush opcodes on release");
        }
    }
}

impl MiscMutation for WriteAccess<'_> {
    fn define_channel(&mut self, config: ChannelConfig) {
        self.record(opcode::DefineChannel {
            host: config.host,
            key_name: config.key_name,
        });
    }

    fn set_last_published_root(&mut self, root: ContentAddress) {
        self.record(opcode::SetLastPublishedRoot { root });
    }

    fn set_pin_count(&mut self, address: ContentAddress, count: u32) {
        self.record(opcode::SetPinCount { address, count });
    }

    fn set_preference(&mut self, name: String, value: PrefValue) {
        self.record(opcode::SetPreference { name, value });
    }

    fn put_explicit_user(&mut self, info: ExplicitUserInfo) {
        self.record(opcode::PutExplicitUser { info });
    }

    fn put_explicit_record(&mut self, info: CachedRecordInfo) {
        self.record(opcode::PutExplicitRecord { info });
    }

    fn purge_explicit_cache(&mut self, limit_bytes: u64) {
        self.record(opcode::PurgeExplicitCache { limit_bytes });
    }

    fn add_favourite(&mut self, info: CachedRecordInfo) {
        assert!(
            !self.state.favourites().is_favourite(&info.stream),
            "{} is already a favourite",
            info.stream
        );
        self.record(opcode::AddFavourite { info });
    }

    fn remove_favourite(&mut self, stream: ContentAddress) {
        self.record(opcode::RemoveFavourite { stream });
    }
}

impl FolloweeMutation for WriteAccess<'_> {
    fn define_followee(&mut self, key: ChannelKey, root: ContentAddress, last_poll_millis: u64) {
        self.record(opcode::DefineFollowee {
            key,
            root,
            last_poll_millis,
        });
    }

    fn add_followee_element(&mut self, key: ChannelKey, element: FollowingCacheElement) {
        assert!(
            self.state.followees().is_followed(&key),
            "element added for unknown followee {}",
            key.fmt_short()
        );
        self.record(opcode::AddFolloweeElement { key, element });
    }

    fn remove_followee_element(&mut self, key: ChannelKey, element: ContentAddress) {
        self.record(opcode::RemoveFolloweeElement { key, element });
    }

    fn remove_followee(&mut self, key: ChannelKey) {
        self.record(opcode::RemoveFollowee { key });
    }

    fn skip_followee_record(&mut self, key: ChannelKey, record: ContentAddress, permanent: bool) {
        assert!(
            self.state.followees().is_followed(&key),
            "record skipped for unknown followee {}",
            key.fmt_short()
        );
        self.record(opcode::SkipFolloweeRecord {
            key,
            record,
            permanent,
        });
    }
}

/// Applies transaction outcomes to the pin table and releases content on the network.
#[derive(Debug)]
pub struct PinResolver<'w, 'a, S: ?Sized> {
    access: &'w mut WriteAccess<'a>,
    network: &'w S,
}

impl<S: NetworkScheduler + ?Sized> StateResolver for PinResolver<'_, '_, S> {
    fn commit_transaction_pin_counts(
        &mut self,
        deltas: HashMap<ContentAddress, i64>,
        false_pins: HashSet<ContentAddress>,
    ) -> Result<()> {
        let mut deltas: Vec<_> = deltas.into_iter().collect();
        deltas.sort_unstable_by_key(|(address, _)| *address);

        let mut released = Vec::new();
        for (address, delta) in deltas {
            let current = i64::from(self.access.pins().count(&address));
            let next = current + delta;
            assert!(
                next >= 0,
                "pin count underflow for {address}: {current} {delta:+}"
            );
            let next = u32::try_from(next).context("pin count overflow")?;
            self.access.set_pin_count(address, next);
            if next == 0 {
                released.push(address);
            }
        }
        // the ledger must be durable before anything is unpinned
        self.access.flush()?;

        for address in false_pins {
            if !self.access.pins().is_pinned(&address) && !released.contains(&address) {
                released.push(address);
            }
        }
        if released.is_empty() {
            return Ok(());
        }
        debug!(count = released.len(), "releasing pins");
        let removals: Vec<_> = released
            .iter()
            .map(|address| (*address, self.network.remove_pin(*address)))
            .collect();
        let mut first: Option<NetworkError> = None;
        for (address, removal) in removals {
            if let Err(err) = removal.wait() {
                warn!(%address, %err, "failed to unpin");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
