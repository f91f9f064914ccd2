//! The in-flight operation queue: the bridge between callers and the
//! background thread.
//!
//! Every public call packages its arguments into an [`Operation`] with a
//! oneshot reply slot and posts it to the backend's channel. A dedicated OS
//! thread drains the channel on a single-threaded runtime and executes each
//! operation against the [`Core`], so all backing-store mutations are
//! naturally serialized. Results travel back through the oneshot; a caller
//! that drops its future simply never sees the reply, but the operation
//! still runs so the on-disk state stays consistent.

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    addr::CacheAddr,
    backend::Core,
    config::CacheConfig,
    entry::EntryShared,
    error::{CacheError, Result},
    format::time_from_micros,
    io::PendingOps,
};

/// Address plus shared state of an entry returned to a caller.
pub(crate) struct EntryDescriptor {
    address: CacheAddr,
    shared: Arc<EntryShared>,
}

/// One queued call.
pub(crate) enum Operation {
    OpenEntry {
        key: String,
        reply: oneshot::Sender<Result<EntryDescriptor>>,
    },
    CreateEntry {
        key: String,
        reply: oneshot::Sender<Result<EntryDescriptor>>,
    },
    OpenOrCreateEntry {
        key: String,
        reply: oneshot::Sender<Result<EntryDescriptor>>,
    },
    DoomEntry {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DoomAllEntries {
        reply: oneshot::Sender<Result<()>>,
    },
    DoomEntriesBetween {
        initial_time: SystemTime,
        end_time: Option<SystemTime>,
        reply: oneshot::Sender<Result<()>>,
    },
    CalculateSizeOfAllEntries {
        reply: oneshot::Sender<Result<i64>>,
    },
    GetEntryCount {
        reply: oneshot::Sender<i32>,
    },
    OnExternalCacheHit {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CreateIterator {
        reply: oneshot::Sender<u64>,
    },
    OpenNextEntry {
        iterator: u64,
        reply: oneshot::Sender<Result<Option<EntryDescriptor>>>,
    },
    EndEnumeration {
        iterator: u64,
    },
    ReadData {
        address: CacheAddr,
        stream: usize,
        offset: i64,
        len: usize,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    WriteData {
        address: CacheAddr,
        stream: usize,
        offset: i64,
        data: Bytes,
        truncate: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
    ReadSparseData {
        address: CacheAddr,
        offset: i64,
        len: usize,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    WriteSparseData {
        address: CacheAddr,
        offset: i64,
        data: Bytes,
        reply: oneshot::Sender<Result<usize>>,
    },
    GetAvailableRange {
        address: CacheAddr,
        offset: i64,
        len: i32,
        reply: oneshot::Sender<Result<(i64, i32)>>,
    },
    CancelSparseIo {
        address: CacheAddr,
    },
    ReadyForSparseIo {
        address: CacheAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    DoomOpenEntry {
        address: CacheAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseEntry {
        address: CacheAddr,
    },
    SelfCheck {
        reply: oneshot::Sender<Result<i32>>,
    },
    InternalTrim {
        empty: bool,
    },
    InternalTrimDeleted {
        empty: bool,
    },
    InternalDelayedTrim,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// Drops the backend without any cleanup, as if the process died.
    #[cfg(test)]
    KillForTesting {
        reply: oneshot::Sender<()>,
    },
}

impl Operation {
    /// Internal operations are posted by the backend to itself and are not
    /// tracked by the pending counter.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            Operation::InternalTrim { .. }
                | Operation::InternalTrimDeleted { .. }
                | Operation::InternalDelayedTrim
        )
    }
}

/// Handle to a cache backend.
///
/// Operations are asynchronous: each call posts to the backend's background
/// thread and resolves when that thread has finished the work.
pub struct CacheBackend {
    tx: mpsc::UnboundedSender<Operation>,
    pending: Arc<PendingOps>,
    unit_test_mode: bool,
}

impl CacheBackend {
    /// Opens (creating as needed) the cache described by `config`.
    pub async fn open(config: CacheConfig) -> Result<CacheBackend> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingOps::default());
        let unit_test_mode = config.unit_test_mode;

        let (init_tx, init_rx) = oneshot::channel();
        let thread_tx = tx.clone();
        let thread_pending = pending.clone();
        std::thread::Builder::new()
            .name("blockfile-cache".to_string())
            .spawn(move || run_background(config, thread_tx, rx, thread_pending, init_tx))
            .map_err(|source| CacheError::StorageError { source })?;

        match init_rx.await {
            Ok(Ok(())) => Ok(CacheBackend {
                tx,
                pending,
                unit_test_mode,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(CacheError::InitFailed {
                reason: "background thread died during initialization".to_string(),
            }),
        }
    }

    fn post(&self, operation: Operation) -> Result<()> {
        self.pending.increment();
        self.tx.send(operation).map_err(|_| {
            self.pending.decrement();
            CacheError::Disabled
        })
    }

    async fn round_trip<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Operation,
    ) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(build(reply_tx))?;
        reply_rx.await.map_err(|_| CacheError::Disabled)
    }

    fn entry_handle(&self, descriptor: EntryDescriptor) -> EntryHandle {
        EntryHandle {
            address: descriptor.address,
            shared: descriptor.shared,
            tx: self.tx.clone(),
            pending: self.pending.clone(),
            closed: false,
        }
    }

    /// Opens the entry stored under `key`.
    pub async fn open_entry(&self, key: &str) -> Result<EntryHandle> {
        let key = key.to_string();
        let descriptor = self
            .round_trip(|reply| Operation::OpenEntry { key, reply })
            .await??;
        Ok(self.entry_handle(descriptor))
    }

    /// Creates a new entry under `key`; fails when one already exists.
    pub async fn create_entry(&self, key: &str) -> Result<EntryHandle> {
        let key = key.to_string();
        let descriptor = self
            .round_trip(|reply| Operation::CreateEntry { key, reply })
            .await??;
        Ok(self.entry_handle(descriptor))
    }

    /// Opens the entry under `key`, creating it if missing.
    pub async fn open_or_create_entry(&self, key: &str) -> Result<EntryHandle> {
        let key = key.to_string();
        let descriptor = self
            .round_trip(|reply| Operation::OpenOrCreateEntry { key, reply })
            .await??;
        Ok(self.entry_handle(descriptor))
    }

    /// Dooms the entry stored under `key`.
    pub async fn doom_entry(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.round_trip(|reply| Operation::DoomEntry { key, reply })
            .await?
    }

    /// Dooms every entry in the cache.
    pub async fn doom_all_entries(&self) -> Result<()> {
        self.round_trip(|reply| Operation::DoomAllEntries { reply })
            .await?
    }

    /// Dooms entries whose last use falls in `[initial_time, end_time)`.
    pub async fn doom_entries_between(
        &self,
        initial_time: SystemTime,
        end_time: SystemTime,
    ) -> Result<()> {
        self.round_trip(|reply| Operation::DoomEntriesBetween {
            initial_time,
            end_time: Some(end_time),
            reply,
        })
        .await?
    }

    /// Dooms entries used at or after `initial_time`.
    pub async fn doom_entries_since(&self, initial_time: SystemTime) -> Result<()> {
        self.round_trip(|reply| Operation::DoomEntriesBetween {
            initial_time,
            end_time: None,
            reply,
        })
        .await?
    }

    /// Total bytes stored, from the running byte accounting (no traversal).
    pub async fn calculate_size_of_all_entries(&self) -> Result<i64> {
        self.round_trip(|reply| Operation::CalculateSizeOfAllEntries { reply })
            .await?
    }

    /// Number of reachable entries.
    pub async fn get_entry_count(&self) -> Result<i32> {
        self.round_trip(|reply| Operation::GetEntryCount { reply })
            .await
    }

    /// Notes a hit served by an external cache layer, refreshing the rank of
    /// the matching entry without touching its data.
    pub async fn on_external_cache_hit(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.round_trip(|reply| Operation::OnExternalCacheHit { key, reply })
            .await?
    }

    /// Starts an enumeration of the cache's entries.
    pub async fn create_iterator(&self) -> Result<CacheIterator> {
        let id = self
            .round_trip(|reply| Operation::CreateIterator { reply })
            .await?;
        Ok(CacheIterator {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
            id,
            ended: false,
        })
    }

    /// Walks every bucket chain and every list, verifying the stored
    /// counts. Returns the number of dirty entries encountered.
    pub async fn self_check(&self) -> Result<i32> {
        self.round_trip(|reply| Operation::SelfCheck { reply }).await?
    }

    /// Shuts the backend down, flushing state to disk. In unit-test mode
    /// this waits for every pending operation to drain first.
    pub async fn shutdown(self) -> Result<()> {
        if self.unit_test_mode {
            self.pending.wait_for_zero(Duration::from_secs(10));
        }
        // Not tracked by the pending counter: shutdown is the one operation
        // that outlives the drain.
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Operation::Shutdown { reply: reply_tx })
            .map_err(|_| CacheError::Disabled)?;
        reply_rx.await.map_err(|_| CacheError::Disabled)
    }

    /// Tears the backend down without flushing or cleanup, leaving the disk
    /// state exactly as a process death would.
    #[cfg(test)]
    pub(crate) async fn kill_for_testing(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Operation::KillForTesting { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

impl Drop for CacheBackend {
    fn drop(&mut self) {
        // Dropping without an explicit shutdown still stops the background
        // thread; pending callbacks are simply never delivered.
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = self.tx.send(Operation::Shutdown { reply: reply_tx });
    }
}

impl std::fmt::Debug for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBackend")
            .field("pending", &self.pending.pending())
            .finish_non_exhaustive()
    }
}

/// Handle to one cache entry.
///
/// Dropping the handle closes it (posting a close to the backend); `doom`
/// marks the entry for destruction once the last handle goes away, while
/// still serving reads and writes to holders of open handles.
pub struct EntryHandle {
    address: CacheAddr,
    shared: Arc<EntryShared>,
    tx: mpsc::UnboundedSender<Operation>,
    pending: Arc<PendingOps>,
    closed: bool,
}

impl EntryHandle {
    fn post(&self, operation: Operation) -> Result<()> {
        self.pending.increment();
        self.tx.send(operation).map_err(|_| {
            self.pending.decrement();
            CacheError::Disabled
        })
    }

    async fn round_trip<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Operation,
    ) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(build(reply_tx))?;
        reply_rx.await.map_err(|_| CacheError::Disabled)
    }

    /// The entry's key.
    pub fn key(&self) -> String {
        self.shared.key()
    }

    pub fn last_used(&self) -> SystemTime {
        time_from_micros(self.shared.last_used.load(Ordering::Acquire))
    }

    pub fn last_modified(&self) -> SystemTime {
        time_from_micros(self.shared.last_modified.load(Ordering::Acquire))
    }

    /// Stored size of one of the three data streams.
    pub fn data_size(&self, stream: usize) -> i32 {
        if stream >= self.shared.data_sizes.len() {
            return 0;
        }
        self.shared.data_sizes[stream].load(Ordering::Acquire)
    }

    pub fn is_doomed(&self) -> bool {
        self.shared.doomed.load(Ordering::Acquire)
    }

    /// Reads up to `len` bytes of stream `stream` at `offset`.
    pub async fn read_data(&self, stream: usize, offset: i64, len: usize) -> Result<Bytes> {
        let address = self.address;
        self.round_trip(|reply| Operation::ReadData {
            address,
            stream,
            offset,
            len,
            reply,
        })
        .await?
    }

    /// Writes `data` to stream `stream` at `offset`. With `truncate`, the
    /// stream is cut to end exactly at the end of this write.
    pub async fn write_data(
        &self,
        stream: usize,
        offset: i64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        let address = self.address;
        let data = Bytes::copy_from_slice(data);
        self.round_trip(|reply| Operation::WriteData {
            address,
            stream,
            offset,
            data,
            truncate,
            reply,
        })
        .await?
    }

    /// Reads up to `len` bytes of sparse data at the logical `offset`.
    /// Ranges never written read as zeros.
    pub async fn read_sparse_data(&self, offset: i64, len: usize) -> Result<Bytes> {
        let address = self.address;
        self.round_trip(|reply| Operation::ReadSparseData {
            address,
            offset,
            len,
            reply,
        })
        .await?
    }

    /// Writes `data` at the logical sparse `offset`.
    pub async fn write_sparse_data(&self, offset: i64, data: &[u8]) -> Result<usize> {
        let address = self.address;
        let data = Bytes::copy_from_slice(data);
        self.round_trip(|reply| Operation::WriteSparseData {
            address,
            offset,
            data,
            reply,
        })
        .await?
    }

    /// Returns the first contiguous stored run inside
    /// `[offset, offset + len)` as `(start, available_bytes)`.
    pub async fn get_available_range(&self, offset: i64, len: i32) -> Result<(i64, i32)> {
        let address = self.address;
        self.round_trip(|reply| Operation::GetAvailableRange {
            address,
            offset,
            len,
            reply,
        })
        .await?
    }

    /// Asks a running sparse operation to stop at its next child boundary.
    pub fn cancel_sparse_io(&self) {
        let address = self.address;
        let _ = self.post(Operation::CancelSparseIo { address });
    }

    /// Resolves once the entry is ready for further sparse operations.
    pub async fn ready_for_sparse_io(&self) -> Result<()> {
        let address = self.address;
        self.round_trip(|reply| Operation::ReadyForSparseIo { address, reply })
            .await?
    }

    /// Dooms this entry. Data stays readable through open handles; the
    /// storage is reclaimed when the last handle closes.
    pub async fn doom(&self) -> Result<()> {
        let address = self.address;
        self.round_trip(|reply| Operation::DoomOpenEntry { address, reply })
            .await?
    }

    /// Closes the handle. Equivalent to dropping it, but explicit at call
    /// sites that care about the moment buffered data reaches the backend.
    pub fn close(mut self) {
        self.send_close();
    }

    fn send_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let address = self.address;
        let _ = self.post(Operation::CloseEntry { address });
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        self.send_close();
    }
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("address", &self.address)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

/// Enumerates the cache's entries, most recently used first, best effort
/// under concurrent mutation.
pub struct CacheIterator {
    tx: mpsc::UnboundedSender<Operation>,
    pending: Arc<PendingOps>,
    id: u64,
    ended: bool,
}

impl CacheIterator {
    /// Returns the next entry, or `None` once the enumeration is done.
    pub async fn open_next_entry(&mut self) -> Result<Option<EntryHandle>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.increment();
        self.tx
            .send(Operation::OpenNextEntry {
                iterator: self.id,
                reply: reply_tx,
            })
            .map_err(|_| {
                self.pending.decrement();
                CacheError::Disabled
            })?;
        let descriptor = reply_rx.await.map_err(|_| CacheError::Disabled)??;
        Ok(descriptor.map(|descriptor| EntryHandle {
            address: descriptor.address,
            shared: descriptor.shared,
            tx: self.tx.clone(),
            pending: self.pending.clone(),
            closed: false,
        }))
    }
}

impl Drop for CacheIterator {
    fn drop(&mut self) {
        if !self.ended {
            self.ended = true;
            let _ = self.tx.send(Operation::EndEnumeration { iterator: self.id });
        }
    }
}

// ---- the background thread ----------------------------------------------

fn run_background(
    config: CacheConfig,
    self_tx: mpsc::UnboundedSender<Operation>,
    mut rx: mpsc::UnboundedReceiver<Operation>,
    pending: Arc<PendingOps>,
    init_tx: oneshot::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(source) => {
            let _ = init_tx.send(Err(CacheError::StorageError { source }));
            return;
        }
    };

    runtime.block_on(async move {
        let mut core = match Core::open(config, self_tx, pending.clone()) {
            Ok(core) => {
                let _ = init_tx.send(Ok(()));
                core
            }
            Err(error) => {
                let _ = init_tx.send(Err(error));
                return;
            }
        };

        let period = if core.config.unit_test_mode {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(30)
        };
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                operation = rx.recv() => {
                    let Some(operation) = operation else {
                        // Every handle is gone: production shutdown path.
                        core.cleanup();
                        break;
                    };
                    if let Operation::Shutdown { reply } = operation {
                        core.cleanup();
                        shutdown_reply = Some(reply);
                        break;
                    }
                    #[cfg(test)]
                    if let Operation::KillForTesting { reply } = operation {
                        // No cleanup at all: the files stay as they are.
                        shutdown_reply = Some(reply);
                        break;
                    }
                    let internal = operation.is_internal();
                    execute(&mut core, operation);
                    core.on_operation_complete();
                    if !internal {
                        pending.decrement();
                    }
                }
                _ = timer.tick() => {
                    core.on_stats_timer();
                }
            }
        }

        // Release the directory lock before acknowledging, so a caller can
        // reopen the cache the moment the shutdown resolves.
        drop(core);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    });
}

fn clip_offset(offset: i64) -> Result<i32> {
    if !(0..i32::MAX as i64).contains(&offset) {
        return Err(CacheError::InvalidArgument {
            reason: "offset out of range",
        });
    }
    Ok(offset as i32)
}

fn descriptor_for(core: &Core, address: CacheAddr) -> Result<EntryDescriptor> {
    let rc = core.entry_at(address)?;
    let shared = rc.borrow().shared.clone();
    Ok(EntryDescriptor { address, shared })
}

fn execute(core: &mut Core, operation: Operation) {
    match operation {
        Operation::OpenEntry { key, reply } => {
            let result = core.open_entry_impl(&key).and_then(|rc| {
                let address = rc.borrow().address().value();
                descriptor_for(core, address)
            });
            let _ = reply.send(result);
        }
        Operation::CreateEntry { key, reply } => {
            let result = core.create_entry_impl(&key).and_then(|rc| {
                let address = rc.borrow().address().value();
                descriptor_for(core, address)
            });
            let _ = reply.send(result);
        }
        Operation::OpenOrCreateEntry { key, reply } => {
            let result = match core.open_entry_impl(&key) {
                Ok(rc) => {
                    let address = rc.borrow().address().value();
                    descriptor_for(core, address)
                }
                Err(CacheError::NotFound) => core.create_entry_impl(&key).and_then(|rc| {
                    let address = rc.borrow().address().value();
                    descriptor_for(core, address)
                }),
                Err(error) => Err(error),
            };
            let _ = reply.send(result);
        }
        Operation::DoomEntry { key, reply } => {
            let _ = reply.send(core.doom_entry_by_key(&key));
        }
        Operation::DoomAllEntries { reply } => {
            let _ = reply.send(core.doom_all_entries());
        }
        Operation::DoomEntriesBetween {
            initial_time,
            end_time,
            reply,
        } => {
            let _ = reply.send(core.doom_entries_between(initial_time, end_time));
        }
        Operation::CalculateSizeOfAllEntries { reply } => {
            let _ = reply.send(core.calculate_size_of_all_entries());
        }
        Operation::GetEntryCount { reply } => {
            let _ = reply.send(core.get_entry_count());
        }
        Operation::OnExternalCacheHit { key, reply } => {
            let _ = reply.send(core.on_external_cache_hit(&key));
        }
        Operation::CreateIterator { reply } => {
            let _ = reply.send(core.create_iterator());
        }
        Operation::OpenNextEntry { iterator, reply } => {
            let result = core.open_next_entry(iterator).and_then(|next| match next {
                Some(address) => descriptor_for(core, address).map(Some),
                None => Ok(None),
            });
            let _ = reply.send(result);
        }
        Operation::EndEnumeration { iterator } => {
            core.end_enumeration(iterator);
        }
        Operation::ReadData {
            address,
            stream,
            offset,
            len,
            reply,
        } => {
            let result = clip_offset(offset).and_then(|offset| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                let mut buf = vec![0u8; len];
                let read = core.internal_read_data(&mut entry, stream, offset, &mut buf)?;
                buf.truncate(read);
                Ok(Bytes::from(buf))
            });
            let _ = reply.send(result);
        }
        Operation::WriteData {
            address,
            stream,
            offset,
            data,
            truncate,
            reply,
        } => {
            let result = clip_offset(offset).and_then(|offset| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                core.internal_write_data(&mut entry, stream, offset, &data, truncate)
            });
            core.note_storage_growth();
            let _ = reply.send(result);
        }
        Operation::ReadSparseData {
            address,
            offset,
            len,
            reply,
        } => {
            let result = (|| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                let mut buf = vec![0u8; len];
                let read = core.read_sparse_data(&mut entry, offset, &mut buf)?;
                buf.truncate(read);
                Ok(Bytes::from(buf))
            })();
            let _ = reply.send(result);
        }
        Operation::WriteSparseData {
            address,
            offset,
            data,
            reply,
        } => {
            let result = (|| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                core.write_sparse_data(&mut entry, offset, &data)
            })();
            core.note_storage_growth();
            let _ = reply.send(result);
        }
        Operation::GetAvailableRange {
            address,
            offset,
            len,
            reply,
        } => {
            let result = (|| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                core.get_available_range(&mut entry, offset, len)
            })();
            let _ = reply.send(result);
        }
        Operation::CancelSparseIo { address } => {
            if let Ok(rc) = core.entry_at(address) {
                let mut entry = rc.borrow_mut();
                core.cancel_sparse_io(&mut entry);
            }
        }
        Operation::ReadyForSparseIo { address, reply } => {
            let result = (|| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                core.ready_for_sparse_io(&mut entry)
            })();
            let _ = reply.send(result);
        }
        Operation::DoomOpenEntry { address, reply } => {
            let result = (|| {
                let rc = core.entry_at(address)?;
                let mut entry = rc.borrow_mut();
                core.doom_entry_impl(&mut entry)
            })();
            let _ = reply.send(result);
        }
        Operation::CloseEntry { address } => {
            core.close_entry(address);
        }
        Operation::SelfCheck { reply } => {
            let _ = reply.send(core.self_check());
        }
        Operation::InternalTrim { empty } => {
            if let Err(error) = core.trim_cache(empty) {
                warn!(%error, "Deferred trim failed.");
            }
        }
        Operation::InternalTrimDeleted { empty } => {
            if let Err(error) = core.trim_deleted(empty) {
                warn!(%error, "Deleted-list trim failed.");
            }
        }
        Operation::InternalDelayedTrim => {
            if let Err(error) = core.delayed_trim() {
                warn!(%error, "Delayed trim failed.");
            }
        }
        Operation::Shutdown { .. } => unreachable!("handled by the run loop"),
        #[cfg(test)]
        Operation::KillForTesting { .. } => unreachable!("handled by the run loop"),
    }
}
