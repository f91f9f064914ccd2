//! The cache backend: index file, hash table, open-entry table, size
//! accounting, startup and repair.
//!
//! All state here is owned by the background thread; see `in_flight` for the
//! operation queue that feeds it. The index file is memory mapped in full
//! (header plus hash table) and mutated in place; every other record goes
//! through positional file I/O.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use bytemuck::Zeroable;
use crossbeam_utils::atomic::AtomicCell;
use tokio::sync::mpsc;

use crate::{
    addr::{Addr, CacheAddr},
    block_files::BlockFiles,
    config::{CacheConfig, CacheType, DEFAULT_CACHE_SIZE},
    entry::{BufferBudget, Entry, EntryShared},
    error::{CacheError, Result},
    eviction::Eviction,
    format::{
        micros_from_time, now_micros, EntryStore, IndexHeader, LruData, persistent_hash,
        RankingsNode, SelfHashed, BASE_TABLE_LEN, CURRENT_VERSION, ENTRY_EVICTED, ENTRY_NORMAL,
        ENTRY_STORE_SIZE, INDEX_HEADER_SIZE, INDEX_MAGIC, MAX_INTERNAL_KEY_LENGTH, NUM_STREAMS,
        VERSION2_0, VERSION2_1,
    },
    io::{BackingFile, CacheFile, MappedFile, PendingOps},
    rankings::{load_node, store_node, IterNode, List, RankCtx, Rankings, SharedIterNode},
    stats::{Counter, Stats, STATS_STORAGE_SIZE},
    storage::StorageBlock,
};

const INDEX_NAME: &str = "index";
const LOCK_NAME: &str = "cache.lock";

/// About 240 MB of data keeps under 50k entries for almost everyone, which
/// keeps the base table load factor under 55%.
const STORAGE_PER_BASE_TABLE: i64 = 240 * 1000 * 1000;

/// Timer ticks to wait before the first eviction (5 minutes at 30 s).
const TRIM_DELAY_TICKS: i32 = 10;

/// Total write-back buffer budget shared by all entries.
const MAX_BUFFERS_SIZE: i64 = 30 * 1024 * 1024;

/// Minimum interval between forced index-map flushes.
const INDEX_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

fn desired_index_table_len(storage_size: i64) -> i32 {
    for shift in 0..4 {
        if storage_size <= STORAGE_PER_BASE_TABLE << shift {
            return BASE_TABLE_LEN << shift;
        }
    }
    // The largest 32-bit storage size needs a 1 Mi-bucket table.
    BASE_TABLE_LEN * 16
}

fn max_storage_size_for_table(table_len: i32) -> i64 {
    (i32::MAX as i64).min(table_len as i64 * (STORAGE_PER_BASE_TABLE / BASE_TABLE_LEN as i64))
}

fn index_size_for(table_len: i32) -> usize {
    INDEX_HEADER_SIZE + table_len as usize * 4
}

/// The memory-mapped index file.
#[derive(Debug)]
pub(crate) struct IndexFile {
    file: MappedFile,
}

impl IndexFile {
    fn header(&self) -> &IndexHeader {
        bytemuck::from_bytes(&self.file.buffer()[..INDEX_HEADER_SIZE])
    }

    fn header_mut(&mut self) -> &mut IndexHeader {
        bytemuck::from_bytes_mut(&mut self.file.buffer_mut()[..INDEX_HEADER_SIZE])
    }

    pub(crate) fn lru_mut(&mut self) -> &mut LruData {
        &mut self.header_mut().lru
    }

    fn table(&self) -> &[CacheAddr] {
        let table_len = self.header().table_len as usize;
        bytemuck::cast_slice(&self.file.buffer()[INDEX_HEADER_SIZE..index_size_for(table_len as i32)])
    }

    fn table_mut(&mut self) -> &mut [CacheAddr] {
        let table_len = self.header().table_len as usize;
        bytemuck::cast_slice_mut(
            &mut self.file.buffer_mut()[INDEX_HEADER_SIZE..index_size_for(table_len as i32)],
        )
    }

    fn flush(&self) {
        if let Err(error) = self.file.flush() {
            warn!(%error, "Failed to flush index map.");
        }
    }
}

/// One open entry: the shared instance plus the number of user handles
/// holding it.
struct OpenEntrySlot {
    rc: Rc<RefCell<Entry>>,
    user_refs: u32,
}

/// Outcome of a bucket-chain walk.
#[derive(Debug, Default)]
struct ChainWalk {
    /// Address of the entry matching the key, if any.
    found: Option<Addr>,
    /// Address of the entry whose `next` points at the target; `None` means
    /// the target hangs straight off the table.
    parent: Option<Addr>,
    /// The chain contradicted itself while looking for a parent.
    match_error: bool,
}

/// State of one user enumeration: a cursor per reuse list.
pub(crate) struct IterState {
    nodes: [Option<SharedIterNode>; 3],
    list: usize,
    initialized: bool,
}

/// The backend proper. Owned and driven exclusively by the background
/// thread.
pub(crate) struct Core {
    pub(crate) config: CacheConfig,
    path: PathBuf,
    index: IndexFile,
    pub(crate) block_files: BlockFiles,
    rankings: Rankings,
    pub(crate) eviction: Eviction,
    pub(crate) stats: Stats,
    stats_fingerprint: u32,
    open_entries: HashMap<CacheAddr, OpenEntrySlot>,
    open_set: HashSet<CacheAddr>,
    iterators: HashMap<u64, IterState>,
    next_iterator_id: u64,
    pub(crate) buffer_budget: BufferBudget,
    pub(crate) max_size: i64,
    mask: u32,
    pub(crate) this_id: i32,
    pub(crate) disabled: bool,
    pub(crate) read_only: bool,
    pub(crate) no_rank_update_on_read: bool,
    num_refs: i32,
    up_ticks: i32,
    restart_pending: bool,
    restarted: bool,
    consider_evicting: bool,
    last_index_flush: AtomicCell<Instant>,
    self_tx: mpsc::UnboundedSender<crate::in_flight::Operation>,
    pending: Arc<PendingOps>,
    // Held for the life of the backend so no other process opens this
    // directory.
    _lock: fslock::LockFile,
}

impl Core {
    /// Opens or creates the cache at the configured path.
    pub(crate) fn open(
        config: CacheConfig,
        self_tx: mpsc::UnboundedSender<crate::in_flight::Operation>,
        pending: Arc<PendingOps>,
    ) -> Result<Core> {
        let path = config.path.clone();
        std::fs::create_dir_all(&path).map_err(|source| CacheError::StorageError { source })?;

        let lock_path = path.join(LOCK_NAME);
        let mut lock = fslock::LockFile::open(&lock_path)
            .map_err(|source| CacheError::StorageError { source })?;
        if !lock
            .try_lock()
            .map_err(|source| CacheError::StorageError { source })?
        {
            return Err(CacheError::InitFailed {
                reason: "cache directory locked by another process".to_string(),
            });
        }

        let mut core = Self::init_files(config, path, self_tx, pending, lock, false)?;
        core.sync_init()?;
        Ok(core)
    }

    /// Whether this directory has never held a cache before.
    fn is_empty_cache_dir(&self) -> bool {
        !crate::block_files::block_file_name(&self.path, 0).exists()
    }

    fn init_files(
        config: CacheConfig,
        path: PathBuf,
        self_tx: mpsc::UnboundedSender<crate::in_flight::Operation>,
        pending: Arc<PendingOps>,
        lock: fslock::LockFile,
        restarted: bool,
    ) -> Result<Core> {
        let mut max_size = config.max_size;
        if max_size == 0 {
            max_size = DEFAULT_CACHE_SIZE;
        }
        let hard_limit = i32::MAX as i64 - i32::MAX as i64 / 10;
        if max_size >= hard_limit {
            max_size = hard_limit - 1;
        }

        let index = Self::init_backing_store(&path, max_size)?;

        let read_only = config.cache_type == CacheType::App;
        let no_rank_update_on_read = config.cache_type == CacheType::Shader;
        let buffering = !config.no_buffering;

        Ok(Core {
            block_files: BlockFiles::new(path.clone()),
            rankings: Rankings::default(),
            eviction: Eviction::default(),
            stats: Stats::default(),
            stats_fingerprint: 0,
            open_entries: HashMap::new(),
            open_set: HashSet::new(),
            iterators: HashMap::new(),
            next_iterator_id: 1,
            buffer_budget: BufferBudget::new(MAX_BUFFERS_SIZE, buffering),
            max_size,
            mask: 0,
            this_id: 0,
            disabled: true,
            read_only,
            no_rank_update_on_read,
            num_refs: 0,
            up_ticks: 0,
            restart_pending: false,
            restarted,
            consider_evicting: false,
            last_index_flush: AtomicCell::new(Instant::now()),
            self_tx,
            pending,
            _lock: lock,
            config,
            path,
            index,
        })
    }

    /// Opens the index file, building a fresh one when missing.
    fn init_backing_store(path: &Path, max_size: i64) -> Result<IndexFile> {
        let index_name = path.join(INDEX_NAME);
        let created = !index_name.exists();
        let file = CacheFile::open_or_create(&index_name)
            .map_err(|source| CacheError::StorageError { source })?;

        if created || file.get_length().unwrap_or(0) == 0 {
            Self::create_backing_store(&file, max_size)?;
        }
        drop(file);

        let file = MappedFile::open(&index_name, 0).map_err(|_| CacheError::InitFailed {
            reason: "unable to map index file".to_string(),
        })?;
        if file.mapped_len() < index_size_for(BASE_TABLE_LEN) {
            error!("Corrupt index file.");
            return Err(CacheError::InitFailed {
                reason: "index file too small".to_string(),
            });
        }
        Ok(IndexFile { file })
    }

    /// Writes the header and zero-fills the hash table of a new index file.
    /// The explicit zero writes force block allocation now, so running out
    /// of disk space fails cleanly here instead of faulting later through
    /// the map.
    fn create_backing_store(file: &CacheFile, max_size: i64) -> Result<()> {
        let header = IndexHeader::new(desired_index_table_len(max_size));
        file.write(bytemuck::bytes_of(&header), 0)
            .map_err(|source| CacheError::WriteFailure { source })?;

        let size = index_size_for(header.table_len);
        file.set_length(size as u64)
            .map_err(|source| CacheError::WriteFailure { source })?;

        const PAGE_SIZE: usize = 4096;
        let page = vec![0u8; PAGE_SIZE];
        let mut offset = PAGE_SIZE;
        while offset < size {
            let end = (offset + PAGE_SIZE).min(size);
            file.write(&page[..end - offset], offset as u64)
                .map_err(|source| CacheError::WriteFailure { source })?;
            offset = end;
        }
        Ok(())
    }

    fn sync_init(&mut self) -> Result<()> {
        let create_files = self.is_empty_cache_dir();

        if !self.check_index() {
            return Err(CacheError::InitFailed {
                reason: "index verification failed".to_string(),
            });
        }

        // The id cannot be zero, because zero means "not dirty".
        let header = self.index.header_mut();
        header.this_id = header.this_id.wrapping_add(1);
        if header.this_id == 0 {
            header.this_id = 1;
        }
        self.this_id = header.this_id;

        let previous_crash = self.index.header().crash != 0;
        self.index.header_mut().crash = 1;
        if previous_crash && !self.restarted {
            info!("Previous run did not shut down cleanly.");
        }

        self.block_files.init(create_files)?;

        let new_eviction = match self.config.new_eviction {
            Some(explicit) => explicit,
            None => self.config.cache_type == CacheType::Disk,
        };
        self.eviction
            .init(self.max_size, self.mask as i32 + 1, new_eviction);
        if self.config.unit_test_mode || self.config.no_random {
            self.up_ticks = TRIM_DELAY_TICKS * 2;
        }

        self.disabled = false;
        self.init_stats()?;

        {
            let crash_point = self.config.crash_point;
            let (mut ctx, rankings) = rank_parts_inner(
                &mut self.block_files,
                &mut self.index,
                &mut self.rankings,
                &self.open_set,
                self.this_id,
                self.read_only,
                crash_point,
            );
            if let Err(error) = rankings.init(&mut ctx, new_eviction) {
                error!(%error, "Rankings initialization failed.");
                self.disabled = true;
                return Err(CacheError::InitFailed {
                    reason: "rankings initialization failed".to_string(),
                });
            }
        }

        if let Some(contents) = self.rankings.take_recovered_entry() {
            self.recovered_entry(contents);
        }

        self.flush_index();
        Ok(())
    }

    fn check_index(&mut self) -> bool {
        let current_size = self.index.file.mapped_len();
        if current_size < INDEX_HEADER_SIZE {
            error!("Index file too small.");
            return false;
        }

        if self.index.header().magic != INDEX_MAGIC {
            error!("Invalid index magic.");
            return false;
        }

        // 2.0 and 2.1 upgrade in place to 3.0.
        let version = self.index.header().version;
        if version == VERSION2_0 || version == VERSION2_1 {
            info!(version, "Upgrading index file.");
            let header = self.index.header_mut();
            header.num_bytes = header.old_v2_num_bytes as i64;
            header.version = CURRENT_VERSION;
        }

        if self.index.header().version != CURRENT_VERSION {
            error!(version = self.index.header().version, "Invalid index version.");
            return false;
        }

        let table_len = self.index.header().table_len;
        if table_len == 0 {
            error!("Invalid table size.");
            return false;
        }
        if current_size < index_size_for(table_len) || table_len & (BASE_TABLE_LEN - 1) != 0 {
            error!("Corrupt index file.");
            return false;
        }

        self.max_size = self.max_size.min(max_storage_size_for_table(table_len));

        let num_bytes = self.index.header().num_bytes;
        if num_bytes < 0
            || (self.max_size < i32::MAX as i64 - DEFAULT_CACHE_SIZE
                && num_bytes > self.max_size + DEFAULT_CACHE_SIZE)
        {
            error!(num_bytes, "Invalid cache size.");
            return false;
        }

        if self.index.header().num_entries < 0 {
            error!("Invalid number of entries.");
            return false;
        }

        if self.mask == 0 {
            self.mask = self.config.mask.unwrap_or(table_len as u32 - 1);
        }
        true
    }

    fn init_stats(&mut self) -> Result<()> {
        let address = Addr::from_value(self.index.header().stats);
        if !address.is_initialized() {
            let address = self.create_block_for_size(STATS_STORAGE_SIZE as i32)?;
            self.index.header_mut().stats = address.value();
            self.stats = Stats::default();
            self.stats_fingerprint = self.stats.fingerprint();
            return Ok(());
        }

        if !address.is_block_file() {
            return Err(CacheError::InitFailed {
                reason: "stats record has a bad address".to_string(),
            });
        }

        let size = address.num_blocks() * address.block_size();
        let mut data = vec![0u8; size as usize];
        let file = self.block_files.get_file(address)?;
        file.read(&mut data, address.offset_in_file())
            .map_err(|source| CacheError::ReadFailure { source })?;

        self.stats = Stats::default();
        if !self.stats.init(&data) {
            self.stats = Stats::default();
        }
        self.stats_fingerprint = self.stats.fingerprint();
        Ok(())
    }

    fn store_stats(&mut self) {
        let fingerprint = self.stats.fingerprint();
        if fingerprint == self.stats_fingerprint {
            return;
        }
        let address = Addr::from_value(self.index.header().stats);
        if !address.is_initialized() {
            return;
        }
        let data = self.stats.serialize();
        if let Ok(file) = self.block_files.get_file(address) {
            if file.write(&data, address.offset_in_file()).is_ok() {
                self.stats_fingerprint = fingerprint;
            }
        }
    }

    /// Best-effort flush of the mapped index, at most every 500 ms.
    pub(crate) fn flush_index(&mut self) {
        let last = self.last_index_flush.load();
        if last.elapsed() > INDEX_FLUSH_INTERVAL
            && self
                .last_index_flush
                .compare_exchange(last, Instant::now())
                .is_ok()
        {
            self.index.flush();
        }
    }

    // ---- accessors shared with the policy modules -----------------------

    pub(crate) fn index_num_bytes(&self) -> i64 {
        self.index.header().num_bytes
    }

    pub(crate) fn index_num_entries(&self) -> i32 {
        self.index.header().num_entries
    }

    pub(crate) fn list_size(&self, list: List) -> i32 {
        self.index.header().lru.sizes[list as usize]
    }

    pub(crate) fn index_lru_filled(&self) -> bool {
        self.index.header().lru.filled != 0
    }

    pub(crate) fn set_index_lru_filled(&mut self) {
        self.index.header_mut().lru.filled = 1;
    }

    pub(crate) fn is_loaded(&self) -> bool {
        if self.config.no_load_protection {
            return false;
        }
        self.pending.pending() > 5
    }

    pub(crate) fn max_file_size(&self) -> i64 {
        if self.config.cache_type == CacheType::Pnacl {
            self.max_size
        } else {
            self.max_size / 8
        }
    }

    pub(crate) fn get_entry_count(&self) -> i32 {
        if self.disabled {
            return 0;
        }
        let not_deleted = self.index.header().num_entries - self.list_size(List::Deleted);
        not_deleted.max(0)
    }

    pub(crate) fn rank_parts(&mut self) -> (RankCtx<'_>, &mut Rankings) {
        rank_parts_inner(
            &mut self.block_files,
            &mut self.index,
            &mut self.rankings,
            &self.open_set,
            self.this_id,
            self.read_only,
            self.config.crash_point,
        )
    }

    /// One step of a backwards (eviction-order) list walk, downgrading
    /// corruption to "end of list" after disabling the backend.
    pub(crate) fn list_prev(&mut self, node: Option<&IterNode>, list: List) -> Result<Option<IterNode>> {
        let (mut ctx, rankings) = self.rank_parts();
        match rankings.get_prev(&mut ctx, node, list) {
            Ok(next) => Ok(next),
            Err(error) if error.is_critical() => {
                self.critical_error(&error);
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    pub(crate) fn external_file_name(&self, address: Addr) -> PathBuf {
        debug_assert!(address.is_separate_file());
        self.path.join(format!("f_{:06x}", address.file_number()))
    }

    /// Creates a fresh external file and returns its address.
    pub(crate) fn create_external_file(&mut self) -> Result<Addr> {
        let mut file_number = self.index.header().last_file + 1;
        for _ in 0..0x0fff_ffff {
            let Some(address) = Addr::new_external(file_number as u32) else {
                file_number = 1;
                continue;
            };
            let name = self.external_file_name(address);
            match CacheFile::create_exclusive(&name) {
                Ok(_) => {
                    self.index.header_mut().last_file = file_number;
                    return Ok(address);
                }
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    file_number += 1;
                }
                Err(source) => {
                    error!(%source, "Unable to create external file.");
                    return Err(CacheError::StorageError { source });
                }
            }
        }
        Err(CacheError::CacheFull)
    }

    /// Folds a size change into the byte accounting.
    pub(crate) fn modify_storage_size(&mut self, old_size: i32, new_size: i32) {
        if self.disabled || old_size == new_size {
            return;
        }
        let header = self.index.header_mut();
        header.num_bytes += new_size as i64 - old_size as i64;
        debug_assert!(header.num_bytes >= 0);

        self.stats.modify_storage_stats(old_size, new_size);
        self.flush_index();
    }

    // ---- entry materialization ------------------------------------------

    /// Returns the shared instance for the entry record at `address`,
    /// loading and validating it on first use.
    pub(crate) fn new_entry(&mut self, address: Addr) -> Result<Rc<RefCell<Entry>>> {
        if let Some(slot) = self.open_entries.get(&address.value()) {
            return Ok(slot.rc.clone());
        }

        if !address.sanity_check_for_entry() {
            warn!(addr = address.value(), "Wrong entry address.");
            return Err(CacheError::InvalidAddress {
                value: address.value(),
            });
        }

        let mut block = StorageBlock::<EntryStore>::new(address);
        {
            let file = self.block_files.get_file(address)?;
            block
                .load(file)
                .map_err(|source| CacheError::ReadFailure { source })?;
        }

        let node_addr = Addr::from_value(block.data().rankings_node);
        let shared = EntryShared::new(&RankingsNode::zeroed(), block.data());
        let mut entry = Entry {
            entry: block,
            node_addr,
            doomed: false,
            dirty: false,
            read_only: self.read_only,
            key: None,
            user_buffers: [None, None, None],
            unreported_size: [0; NUM_STREAMS + 1],
            files: [None, None, None, None],
            sparse: None,
            shared,
        };

        if !entry.sanity_check() {
            warn!(addr = address.value(), "Messed up entry found.");
            return Err(CacheError::InvalidEntry);
        }

        let mut node = load_node(&mut self.block_files, node_addr)?;
        entry
            .shared
            .last_used
            .store(node.data().last_used, std::sync::atomic::Ordering::Release);
        entry
            .shared
            .last_modified
            .store(node.data().last_modified, std::sync::atomic::Ordering::Release);

        if !self.rankings.sanity_check(node_addr.value(), node.data(), false) {
            entry.dirty = true;
            // The node is not linked properly; break its link back to the
            // entry and let a list walk delete it later.
            node.data_mut().contents = 0;
            store_node(&mut self.block_files, &mut node)?;
        } else if !self.rankings.data_sanity_check(node.data(), false) {
            entry.dirty = true;
            node.data_mut().contents = address.value();
            store_node(&mut self.block_files, &mut node)?;
        }

        if !entry.data_sanity_check() {
            warn!(addr = address.value(), "Messed up entry found.");
            entry.dirty = true;
            entry.fix_for_delete();
            self.store_entry_record(&mut entry)?;
        }

        // A stale run id means the entry was not properly closed.
        if node.data().dirty != 0 && node.data().dirty != self.this_id {
            entry.dirty = true;
        }

        let rc = Rc::new(RefCell::new(entry));
        self.open_entries.insert(
            address.value(),
            OpenEntrySlot {
                rc: rc.clone(),
                user_refs: 0,
            },
        );
        self.open_set.insert(address.value());
        Ok(rc)
    }

    /// Drops an internal reference, finalizing the entry if nothing else
    /// holds it.
    pub(crate) fn release_internal_entry(&mut self, rc: Rc<RefCell<Entry>>) {
        let address = rc.borrow().address().value();
        drop(rc);
        self.maybe_finalize(address);
    }

    fn maybe_finalize(&mut self, address: CacheAddr) {
        let Some(slot) = self.open_entries.get(&address) else {
            return;
        };
        if slot.user_refs > 0 || Rc::strong_count(&slot.rc) > 1 {
            return;
        }
        let slot = self.open_entries.remove(&address).expect("checked above");
        self.open_set.remove(&address);
        {
            let mut entry = slot.rc.borrow_mut();
            if let Err(error) = self.finalize_entry(&mut entry) {
                warn!(%error, addr = address, "Failed to finalize entry.");
            }
        }
        drop(slot);
        self.consider_evicting = true;

        if self.restart_pending && self.open_entries.is_empty() {
            self.restart_pending = false;
            self.restart_cache(true);
        }
    }

    /// Closes a user handle.
    pub(crate) fn close_entry(&mut self, address: CacheAddr) {
        if let Some(slot) = self.open_entries.get_mut(&address) {
            if slot.user_refs > 0 {
                slot.user_refs -= 1;
                self.num_refs -= 1;
            }
        }
        self.maybe_finalize(address);
    }

    fn add_user_ref(&mut self, address: CacheAddr) {
        if let Some(slot) = self.open_entries.get_mut(&address) {
            slot.user_refs += 1;
            self.num_refs += 1;
        }
    }

    pub(crate) fn entry_at(&self, address: CacheAddr) -> Result<Rc<RefCell<Entry>>> {
        self.open_entries
            .get(&address)
            .map(|slot| slot.rc.clone())
            .ok_or(CacheError::InvalidEntry)
    }

    // ---- the bucket chains ----------------------------------------------

    fn table_slot(&self, hash: u32) -> usize {
        (hash & self.mask) as usize
    }

    /// Loads a record and its node straight from disk for chain traversal.
    /// Open entries write their linkage through, so the disk view is always
    /// current for the fields a walk needs.
    pub(crate) fn load_record_for_walk(
        &mut self,
        address: Addr,
    ) -> Result<(StorageBlock<EntryStore>, StorageBlock<RankingsNode>)> {
        if !address.sanity_check_for_entry() {
            return Err(CacheError::InvalidAddress {
                value: address.value(),
            });
        }
        let mut block = StorageBlock::<EntryStore>::new(address);
        {
            let file = self.block_files.get_file(address)?;
            block
                .load(file)
                .map_err(|source| CacheError::ReadFailure { source })?;
        }
        if !block.data().verify_hash() {
            return Err(CacheError::InvalidEntry);
        }
        let node_addr = Addr::from_value(block.data().rankings_node);
        if !node_addr.sanity_check_for_rankings() || !node_addr.is_initialized() {
            return Err(CacheError::InvalidEntry);
        }
        let node = load_node(&mut self.block_files, node_addr)?;
        Ok((block, node))
    }

    fn read_key_of_record(&mut self, block: &StorageBlock<EntryStore>) -> Result<String> {
        let key_len = block.data().key_len.max(0) as usize;
        let long_key = Addr::from_value(block.data().long_key);
        if !long_key.is_initialized() {
            let bytes = block.as_bytes();
            let start = ENTRY_STORE_SIZE - block.data().key.len();
            if start + key_len > bytes.len() || key_len > MAX_INTERNAL_KEY_LENGTH {
                return Err(CacheError::InvalidEntry);
            }
            return String::from_utf8(bytes[start..start + key_len].to_vec())
                .map_err(|_| CacheError::InvalidEntry);
        }

        let mut bytes = vec![0u8; key_len];
        if long_key.is_block_file() {
            let file = self.block_files.get_file(long_key)?;
            file.read(&mut bytes, long_key.offset_in_file())
                .map_err(|source| CacheError::ReadFailure { source })?;
        } else {
            let name = self.external_file_name(long_key);
            let file = CacheFile::open(&name).map_err(|source| CacheError::StorageError { source })?;
            file.read(&mut bytes, 0)
                .map_err(|source| CacheError::ReadFailure { source })?;
        }
        String::from_utf8(bytes).map_err(|_| CacheError::InvalidEntry)
    }

    fn set_record_next(&mut self, address: Addr, next: CacheAddr) -> Result<()> {
        // Mutate through the live instance when the record is open, so its
        // cached copy stays in sync with the disk. An entry busy in the
        // current operation (it cannot be re-borrowed) gets the direct disk
        // write; its owner re-reads the link afterwards.
        if let Some(slot) = self.open_entries.get(&address.value()) {
            let rc = slot.rc.clone();
            let borrow_result = rc.try_borrow_mut();
            if let Ok(mut entry) = borrow_result {
                entry.entry.data_mut().next = next;
                return self.store_entry_record(&mut entry);
            }
        }
        let (mut block, _node) = self.load_record_for_walk(address)?;
        block.data_mut().next = next;
        let file = self.block_files.get_file(address)?;
        block
            .store(file)
            .map_err(|source| CacheError::WriteFailure { source })?;
        Ok(())
    }

    /// Walks the bucket chain for `hash`, discarding dirty or broken
    /// entries along the way. With `find_parent`, the result carries the
    /// entry pointing at `entry_addr` (or at the key match) instead.
    fn match_entry(
        &mut self,
        key: &str,
        hash: u32,
        find_parent: bool,
        entry_addr: Addr,
    ) -> Result<ChainWalk> {
        let mut walk = ChainWalk::default();
        let mut visited: HashSet<CacheAddr> = HashSet::new();
        let slot = self.table_slot(hash);
        let mut address = Addr::from_value(self.index.table()[slot]);
        let mut parent: Option<Addr> = None;
        let mut found = false;

        loop {
            if self.disabled {
                break;
            }

            if visited.contains(&address.value()) {
                // A cycle in the chain; break it.
                if let Some(parent_addr) = parent {
                    self.set_record_next(parent_addr, 0)?;
                }
                address = Addr::default();
            }
            visited.insert(address.value());

            if !address.is_initialized() {
                if find_parent {
                    found = true;
                }
                break;
            }

            let loaded = self.load_record_for_walk(address);
            let trusted = match &loaded {
                Ok((_, node)) => node.data().dirty == 0 || node.data().dirty == self.this_id,
                Err(_) => false,
            };

            if !trusted {
                // This entry is dirty on disk (not properly closed) or
                // plainly broken: it cannot be trusted.
                let (child, loadable) = match &loaded {
                    Ok((block, _)) => (block.data().next, true),
                    Err(_) => (0, false),
                };
                drop(loaded);

                if let Some(parent_addr) = parent.take() {
                    self.set_record_next(parent_addr, child)?;
                } else {
                    self.index.table_mut()[slot] = child;
                }

                if loadable {
                    // Destroying must happen after the unlink above.
                    self.destroy_invalid_entry(address)?;
                }

                // Restart the search.
                address = Addr::from_value(self.index.table()[slot]);
                visited.clear();
                continue;
            }

            let (block, _node) = loaded.as_ref().expect("trusted entries loaded");
            debug_assert_eq!(hash & self.mask, block.data().hash & self.mask);
            let hash_matches =
                block.data().hash == hash && block.data().key_len as usize == key.len();
            let next = block.data().next;
            let record_key_matches = hash_matches && self.read_key_of_record(block)? == key;

            if record_key_matches {
                walk.found = Some(address);
                found = true;
                if find_parent && entry_addr.is_initialized() && entry_addr != address {
                    walk.match_error = true;
                    parent = None;
                }
                break;
            }

            parent = Some(address);
            address = Addr::from_value(next);
        }

        if find_parent && entry_addr.is_initialized() && walk.found.is_none() {
            walk.match_error = true;
            parent = None;
        }

        walk.parent = if find_parent && found { parent } else { None };
        if find_parent {
            walk.found = None;
        }
        self.flush_index();
        Ok(walk)
    }

    /// Dooms and destroys an untrusted entry that was already unlinked from
    /// the hash table.
    fn destroy_invalid_entry(&mut self, address: Addr) -> Result<()> {
        warn!(addr = address.value(), "Destroying invalid entry.");
        let Ok(rc) = self.new_entry(address) else {
            return Ok(());
        };
        {
            let mut entry = rc.borrow_mut();
            let node_addr = entry.node_addr;
            drop(entry);
            // Stamp the node so the destruction is detectable mid-flight.
            let mut node = load_node(&mut self.block_files, node_addr)?;
            node.data_mut().dirty = self.this_id;
            store_node(&mut self.block_files, &mut node)?;

            let mut entry = rc.borrow_mut();
            self.on_doom_entry(&mut entry)?;
            self.internal_doom(&mut entry)?;
            if !self.eviction.new_eviction {
                self.index.header_mut().num_entries -= 1;
            }
            self.stats.on_event(Counter::InvalidEntry);
        }
        self.release_internal_entry(rc);
        Ok(())
    }

    // ---- public operation bodies ----------------------------------------

    pub(crate) fn open_entry_impl(&mut self, key: &str) -> Result<Rc<RefCell<Entry>>> {
        let rc = self.open_entry_internal(key)?;
        match rc {
            Some(rc) => {
                {
                    let mut entry = rc.borrow_mut();
                    self.on_open_entry(&mut entry)?;
                }
                self.add_user_ref(rc.borrow().address().value());
                self.stats.on_event(Counter::OpenHit);
                Ok(rc)
            }
            None => {
                self.stats.on_event(Counter::OpenMiss);
                Err(CacheError::NotFound)
            }
        }
    }

    /// Opens without counting a user reference; the caller releases through
    /// `release_internal_entry`.
    pub(crate) fn open_entry_internal(&mut self, key: &str) -> Result<Option<Rc<RefCell<Entry>>>> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }

        let hash = persistent_hash(key.as_bytes());
        let walk = self.match_entry(key, hash, false, Addr::default())?;
        let Some(address) = walk.found else {
            return Ok(None);
        };

        let rc = self.new_entry(address)?;
        {
            let mut entry = rc.borrow_mut();
            let _ = self.read_entry_key(&mut entry)?;
            self.mark_entry_dirty(&mut entry)?;
            if entry.entry.data().state != ENTRY_NORMAL {
                // The entry was already evicted.
                drop(entry);
                self.release_internal_entry(rc);
                return Ok(None);
            }
        }
        Ok(Some(rc))
    }

    pub(crate) fn create_entry_impl(&mut self, key: &str) -> Result<Rc<RefCell<Entry>>> {
        let rc = self.create_entry_internal(key)?;
        self.add_user_ref(rc.borrow().address().value());
        Ok(rc)
    }

    pub(crate) fn create_entry_internal(&mut self, key: &str) -> Result<Rc<RefCell<Entry>>> {
        if self.disabled || key.is_empty() {
            return Err(CacheError::Disabled);
        }

        let hash = persistent_hash(key.as_bytes());
        let slot = self.table_slot(hash);

        let mut parent_addr: Option<Addr> = None;
        if Addr::from_value(self.index.table()[slot]).is_initialized() {
            // An entry is already there; it could be the one we want or just
            // a hash conflict.
            let walk = self.match_entry(key, hash, false, Addr::default())?;
            if let Some(address) = walk.found {
                return self.resurrect_entry(address);
            }

            let walk = self.match_entry(key, hash, true, Addr::default())?;
            parent_addr = walk.parent;
            if parent_addr.is_none() && self.index.table()[slot] != 0 {
                warn!("Unable to correct hash collision.");
                return Err(CacheError::InvalidEntry);
            }
        }

        // Allocate the record and node, then save them, then link through
        // the index and finally through the lists. A crash in this sequence
        // leaves at worst unreferenced blocks, or a fully formed entry that
        // is still marked dirty; both are cleaned up lazily.
        let num_blocks = EntryStore::num_blocks_for_key(key.len());
        let entry_address = self
            .block_files
            .create_block(crate::addr::FileType::Block256, num_blocks)
            .map_err(|error| {
                error!(%error, "Create entry failed.");
                self.stats.on_event(Counter::CreateError);
                error
            })?;

        let node_address = match self.block_files.create_block(crate::addr::FileType::Rankings, 1) {
            Ok(address) => address,
            Err(error) => {
                self.block_files.delete_block(entry_address, false);
                error!(%error, "Create entry failed.");
                self.stats.on_event(Counter::CreateError);
                return Err(error);
            }
        };

        let rc = match self.write_new_entry(entry_address, node_address, key, hash) {
            Ok(rc) => rc,
            Err(error) => {
                self.block_files.delete_block(entry_address, false);
                self.block_files.delete_block(node_address, false);
                error!(%error, "Create entry failed.");
                self.stats.on_event(Counter::CreateError);
                return Err(error);
            }
        };

        self.index.header_mut().num_entries += 1;

        // Link this entry through the index.
        if let Some(parent_addr) = parent_addr {
            self.set_record_next(parent_addr, entry_address.value())?;
        } else {
            self.index.table_mut()[slot] = entry_address.value();
        }

        // Link this entry through the lists.
        {
            let mut entry = rc.borrow_mut();
            self.on_create_entry(&mut entry)?;
        }

        self.stats.on_event(Counter::CreateHit);
        self.flush_index();
        Ok(rc)
    }

    /// Builds and stores the record and node of a brand-new entry.
    fn write_new_entry(
        &mut self,
        entry_address: Addr,
        node_address: Addr,
        key: &str,
        hash: u32,
    ) -> Result<Rc<RefCell<Entry>>> {
        let mut block = StorageBlock::<EntryStore>::new(entry_address);
        {
            let stored = block.data_mut();
            stored.rankings_node = node_address.value();
            stored.hash = hash;
            stored.creation_time = now_micros();
            stored.key_len = key.len() as i32;
        }

        let mut long_key_addr = Addr::default();
        if key.len() > MAX_INTERNAL_KEY_LENGTH {
            long_key_addr = self.create_block_for_size(key.len() as i32 + 1)?;
            block.data_mut().long_key = long_key_addr.value();

            let mut bytes = key.as_bytes().to_vec();
            bytes.push(0);
            let write = if long_key_addr.is_block_file() {
                let file = self.block_files.get_file(long_key_addr)?;
                file.write(&bytes, long_key_addr.offset_in_file())
            } else {
                let name = self.external_file_name(long_key_addr);
                let file =
                    CacheFile::open_or_create(&name).map_err(|source| CacheError::StorageError { source })?;
                file.write(&bytes, 0)
                    .and_then(|()| file.set_length(bytes.len() as u64))
            };
            if let Err(source) = write {
                self.block_files.delete_block(long_key_addr, false);
                return Err(CacheError::WriteFailure { source });
            }
        } else {
            let stored = block.data_mut();
            stored.key[..key.len()].copy_from_slice(key.as_bytes());
            stored.key[key.len()] = 0;
        }

        let mut node = StorageBlock::<RankingsNode>::new(node_address);
        node.data_mut().contents = entry_address.value();
        node.data_mut().dirty = self.this_id;

        // Save both records before linking anything.
        {
            let file = self.block_files.get_file(entry_address)?;
            block
                .store(file)
                .map_err(|source| CacheError::WriteFailure { source })?;
        }
        store_node(&mut self.block_files, &mut node)?;

        self.modify_storage_size(0, key.len() as i32);

        let shared = EntryShared::new(node.data(), block.data());
        *shared.key.lock() = key.to_string();
        let entry = Entry {
            entry: block,
            node_addr: node_address,
            doomed: false,
            dirty: false,
            read_only: self.read_only,
            key: Some(key.to_string()),
            user_buffers: [None, None, None],
            unreported_size: [0; NUM_STREAMS + 1],
            files: [None, None, None, None],
            sparse: None,
            shared,
        };

        let rc = Rc::new(RefCell::new(entry));
        self.open_entries.insert(
            entry_address.value(),
            OpenEntrySlot {
                rc: rc.clone(),
                user_refs: 0,
            },
        );
        self.open_set.insert(entry_address.value());
        Ok(rc)
    }

    /// A create hit an existing record: revive it when it was evicted,
    /// otherwise the create conflicts.
    fn resurrect_entry(&mut self, address: Addr) -> Result<Rc<RefCell<Entry>>> {
        let rc = self.new_entry(address)?;
        {
            let mut entry = rc.borrow_mut();
            let _ = self.read_entry_key(&mut entry)?;
            self.mark_entry_dirty(&mut entry)?;
            if entry.entry.data().state == ENTRY_NORMAL {
                // An active entry under this key already exists.
                drop(entry);
                self.release_internal_entry(rc);
                self.stats.on_event(Counter::CreateMiss);
                return Err(CacheError::AlreadyExists);
            }
            debug_assert_eq!(entry.entry.data().state, ENTRY_EVICTED);
            self.on_create_entry(&mut entry)?;
        }
        self.add_user_ref(address.value());
        self.stats.on_event(Counter::ResurrectHit);
        Ok(rc)
    }

    /// Dooms an open entry: unlinks it from the hash chain and the lists;
    /// the storage goes away when the last handle closes.
    pub(crate) fn doom_entry_impl(&mut self, entry: &mut Entry) -> Result<()> {
        if entry.doomed || self.disabled {
            return Ok(());
        }

        // Stamp the node first so a crash mid-doom discards the entry.
        let mut node = load_node(&mut self.block_files, entry.node_addr)?;
        node.data_mut().dirty = self.this_id;
        store_node(&mut self.block_files, &mut node)?;

        let hash = entry.hash();
        let key = self.read_entry_key(entry)?;
        let entry_addr = entry.address();

        let walk = self.match_entry(&key, hash, true, entry_addr)?;

        // The walk may have rewritten this entry's link while splicing out a
        // broken successor, so read the successor fresh from disk.
        let child = match self.load_record_for_walk(entry_addr) {
            Ok((block, _)) => block.data().next,
            Err(_) => entry.next_address(),
        };

        if !entry.doomed {
            // The entry may have been doomed out from under us by the walk.
            self.on_doom_entry(entry)?;
            self.internal_doom(entry)?;
            if !self.eviction.new_eviction {
                self.index.header_mut().num_entries -= 1;
            }
            self.stats.on_event(Counter::DoomEntry);
        }

        if let Some(parent_addr) = walk.parent {
            self.set_record_next(parent_addr, child)?;
        } else if !walk.match_error {
            let slot = self.table_slot(hash);
            self.index.table_mut()[slot] = child;
        }

        self.flush_index();
        Ok(())
    }

    /// Final cleanup of a doomed entry that may still sit on the DELETED
    /// list.
    pub(crate) fn remove_doomed_entry(&mut self, entry: &mut Entry) -> Result<()> {
        if !self.eviction.new_eviction {
            return Ok(());
        }
        debug_assert_ne!(entry.entry.data().state, ENTRY_NORMAL);
        self.on_destroy_entry(entry)?;
        self.index.header_mut().num_entries -= 1;
        Ok(())
    }

    /// Reattaches an entry recovered from an interrupted list insert to the
    /// hash table.
    fn recovered_entry(&mut self, contents: CacheAddr) {
        let address = Addr::from_value(contents);
        let Ok(rc) = self.new_entry(address) else {
            return;
        };
        let hash = rc.borrow().hash();
        self.release_internal_entry(rc);

        // Anything in the bucket means the entry is reachable already.
        let slot = self.table_slot(hash);
        if self.index.table()[slot] != 0 {
            return;
        }
        self.index.table_mut()[slot] = address.value();
        self.flush_index();
    }

    pub(crate) fn doom_entry_by_key(&mut self, key: &str) -> Result<()> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }
        let Some(rc) = self.open_entry_internal(key)? else {
            return Err(CacheError::NotFound);
        };
        {
            let mut entry = rc.borrow_mut();
            self.doom_entry_impl(&mut entry)?;
        }
        self.release_internal_entry(rc);
        Ok(())
    }

    pub(crate) fn doom_all_entries(&mut self) -> Result<()> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }
        self.stats.on_event(Counter::DoomCache);
        if self.num_refs == 0 {
            self.restart_cache(false);
            if self.disabled {
                return Err(CacheError::Disabled);
            }
            Ok(())
        } else {
            self.trim_cache(true)
        }
    }

    pub(crate) fn doom_entries_between(
        &mut self,
        initial_time: std::time::SystemTime,
        end_time: Option<std::time::SystemTime>,
    ) -> Result<()> {
        let Some(end_time) = end_time else {
            return self.doom_entries_since(initial_time);
        };
        if self.disabled {
            return Err(CacheError::Disabled);
        }

        let initial = micros_from_time(initial_time);
        let end = micros_from_time(end_time);

        let iterator = self.create_iterator();
        let mut next = self.open_next_entry(iterator)?;
        while let Some(address) = next {
            let rc = self.entry_at(address)?;
            next = self.open_next_entry(iterator)?;

            let last_used = rc
                .borrow()
                .shared
                .last_used
                .load(std::sync::atomic::Ordering::Acquire);
            if last_used >= initial && last_used < end {
                let mut entry = rc.borrow_mut();
                self.doom_entry_impl(&mut entry)?;
            } else if last_used < initial {
                if let Some(next_addr) = next.take() {
                    self.close_entry(next_addr);
                }
                self.close_entry(address);
                break;
            }
            self.close_entry(address);
        }
        self.end_enumeration(iterator);
        Ok(())
    }

    /// Dooms entries used since `initial_time`, newest first, until an
    /// older entry shows up.
    pub(crate) fn doom_entries_since(&mut self, initial_time: std::time::SystemTime) -> Result<()> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }
        self.stats.on_event(Counter::DoomRecent);
        let initial = micros_from_time(initial_time);

        loop {
            let iterator = self.create_iterator();
            let next = self.open_next_entry(iterator)?;
            let Some(address) = next else {
                self.end_enumeration(iterator);
                return Ok(());
            };

            let rc = self.entry_at(address)?;
            let last_used = rc
                .borrow()
                .shared
                .last_used
                .load(std::sync::atomic::Ordering::Acquire);
            if initial > last_used {
                self.close_entry(address);
                self.end_enumeration(iterator);
                return Ok(());
            }

            {
                let mut entry = rc.borrow_mut();
                self.doom_entry_impl(&mut entry)?;
            }
            self.close_entry(address);
            // The doom invalidated the iterator.
            self.end_enumeration(iterator);
        }
    }

    pub(crate) fn calculate_size_of_all_entries(&self) -> Result<i64> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }
        Ok(self.index.header().num_bytes)
    }

    pub(crate) fn on_external_cache_hit(&mut self, key: &str) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let Some(rc) = self.open_entry_internal(key)? else {
            return Ok(());
        };
        {
            let mut entry = rc.borrow_mut();
            if entry.entry.data().state == ENTRY_NORMAL {
                let modified = self.config.cache_type == CacheType::Shader;
                self.update_rank(&mut entry, modified)?;
            }
        }
        self.release_internal_entry(rc);
        Ok(())
    }

    // ---- enumeration -----------------------------------------------------

    pub(crate) fn create_iterator(&mut self) -> u64 {
        let id = self.next_iterator_id;
        self.next_iterator_id += 1;
        self.iterators.insert(
            id,
            IterState {
                nodes: [None, None, None],
                list: 0,
                initialized: false,
            },
        );
        id
    }

    pub(crate) fn end_enumeration(&mut self, iterator: u64) {
        self.iterators.remove(&iterator);
    }

    /// Returns the address of the next entry of the enumeration, ordered by
    /// recency across the three reuse lists, with a user reference held.
    pub(crate) fn open_next_entry(&mut self, iterator: u64) -> Result<Option<CacheAddr>> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }

        let initialized = self
            .iterators
            .get(&iterator)
            .map(|state| state.initialized)
            .ok_or(CacheError::InvalidArgument {
                reason: "unknown iterator",
            })?;
        let current_list = self.iterators.get(&iterator).map(|state| state.list).expect("checked");

        let mut entries: [Option<Rc<RefCell<Entry>>>; 3] = [None, None, None];
        if !initialized {
            let mut any = false;
            for i in 0..3 {
                any |= self.open_following_entry_from_list(iterator, i)?.is_some();
                entries[i] = self.enumerated_entry_for_slot(iterator, i)?;
            }
            if let Some(state) = self.iterators.get_mut(&iterator) {
                state.initialized = true;
            }
            if !any {
                self.reset_iterator(iterator);
                return Ok(None);
            }
        } else {
            for i in 0..3 {
                if i == current_list {
                    self.open_following_entry_from_list(iterator, i)?;
                }
                entries[i] = self.enumerated_entry_for_slot(iterator, i)?;
            }
        }

        let mut newest: Option<usize> = None;
        let mut newest_time = 0u64;
        for (i, slot) in entries.iter().enumerate() {
            if let Some(rc) = slot {
                let last_used = rc
                    .borrow()
                    .shared
                    .last_used
                    .load(std::sync::atomic::Ordering::Acquire);
                if newest.is_none() || last_used > newest_time {
                    newest = Some(i);
                    newest_time = last_used;
                }
            }
        }

        let Some(newest) = newest else {
            self.reset_iterator(iterator);
            return Ok(None);
        };

        if let Some(state) = self.iterators.get_mut(&iterator) {
            state.list = newest;
        }

        let mut result = None;
        for (i, slot) in entries.iter_mut().enumerate() {
            if let Some(rc) = slot.take() {
                let address = rc.borrow().address().value();
                if i == newest {
                    self.add_user_ref(address);
                    result = Some(address);
                    drop(rc);
                } else {
                    self.release_internal_entry(rc);
                }
            }
        }
        Ok(result)
    }

    fn reset_iterator(&mut self, iterator: u64) {
        if let Some(state) = self.iterators.get_mut(&iterator) {
            state.nodes = [None, None, None];
            state.list = 0;
            state.initialized = false;
        }
    }

    /// Advances one list cursor of the iterator to the next node that
    /// resolves to a live entry.
    fn open_following_entry_from_list(
        &mut self,
        iterator: u64,
        list_index: usize,
    ) -> Result<Option<()>> {
        if self.disabled {
            return Ok(None);
        }
        let list = List::from_index(list_index);
        if !self.eviction.new_eviction && list != List::NoUse {
            self.set_iterator_node(iterator, list_index, None);
            return Ok(None);
        }

        let current = self
            .iterators
            .get(&iterator)
            .and_then(|state| state.nodes[list_index].clone());

        let snapshot = current.as_ref().map(|shared| *shared.borrow());
        let next = {
            let (mut ctx, rankings) = self.rank_parts();
            match rankings.get_next(&mut ctx, snapshot.as_ref(), list) {
                Ok(next) => next,
                Err(error) if error.is_critical() => {
                    self.critical_error(&error);
                    None
                }
                Err(_) => None,
            }
        };

        let Some(next) = next else {
            self.set_iterator_node(iterator, list_index, None);
            return Ok(None);
        };

        let shared = Rc::new(RefCell::new(next));
        self.rankings.track(&shared);
        self.set_iterator_node(iterator, list_index, Some(shared));
        Ok(Some(()))
    }

    fn set_iterator_node(&mut self, iterator: u64, list_index: usize, node: Option<SharedIterNode>) {
        if let Some(state) = self.iterators.get_mut(&iterator) {
            state.nodes[list_index] = node;
        }
    }

    /// Materializes the entry referenced by an iterator slot.
    fn enumerated_entry_for_slot(
        &mut self,
        iterator: u64,
        list_index: usize,
    ) -> Result<Option<Rc<RefCell<Entry>>>> {
        let Some(shared) = self
            .iterators
            .get(&iterator)
            .and_then(|state| state.nodes[list_index].clone())
        else {
            return Ok(None);
        };
        let snapshot = *shared.borrow();
        self.get_enumerated_entry(&snapshot, List::from_index(list_index))
    }

    /// Resolves a list node to a live, trusted entry; broken nodes are
    /// dropped from the list and dirty entries get doomed along the way.
    pub(crate) fn get_enumerated_entry(
        &mut self,
        node: &IterNode,
        list: List,
    ) -> Result<Option<Rc<RefCell<Entry>>>> {
        if self.disabled {
            return Ok(None);
        }

        let contents = Addr::from_value(node.data.contents);
        let rc = match self.new_entry(contents) {
            Ok(rc) => rc,
            Err(error) => {
                let node_addr = Addr::from_value(node.addr);
                {
                    let (mut ctx, rankings) = self.rank_parts();
                    if let Err(remove_error) = rankings.remove(&mut ctx, node_addr, list, false) {
                        if remove_error.is_critical() {
                            self.critical_error(&remove_error);
                            return Ok(None);
                        }
                    }
                }
                if matches!(error, CacheError::InvalidAddress { .. }) {
                    // Nothing links back from the index; delete the node.
                    self.block_files.delete_block(node_addr, true);
                }
                return Ok(None);
            }
        };

        let dirty = rc.borrow().dirty;
        if dirty {
            // We cannot trust this entry.
            {
                let mut entry = rc.borrow_mut();
                self.doom_entry_impl(&mut entry)?;
            }
            self.release_internal_entry(rc);
            return Ok(None);
        }

        {
            let mut entry = rc.borrow_mut();
            self.mark_entry_dirty(&mut entry)?;
            // Make sure the key is cached for later.
            let _ = self.read_entry_key(&mut entry)?;
        }
        Ok(Some(rc))
    }

    // ---- failure handling ------------------------------------------------

    /// Corruption was detected: disable the backend and restart it once the
    /// last reference goes away.
    pub(crate) fn critical_error(&mut self, error: &CacheError) {
        error!(%error, "Critical cache error.");
        if self.disabled {
            return;
        }
        self.stats.on_event(Counter::FatalError);
        self.disabled = true;

        if self.open_entries.is_empty() {
            self.restart_cache(true);
        } else {
            self.restart_pending = true;
        }
    }

    /// Deletes the cache contents and reinitializes in place. With
    /// `failure`, the stored statistics are carried over.
    pub(crate) fn restart_cache(&mut self, failure: bool) {
        info!(failure, "Restarting cache.");
        let errors = self.stats.get_counter(Counter::FatalError);
        let full_dooms = self.stats.get_counter(Counter::DoomCache);
        let partial_dooms = self.stats.get_counter(Counter::DoomRecent);

        self.prepare_for_restart();
        if let Err(error) = self.delete_cache_files() {
            error!(%error, "Unable to clear cache directory.");
            self.disabled = true;
            return;
        }

        if self.config.unit_test_mode && failure {
            // The test wants to observe the failed state.
            return;
        }

        match self
            .max_size_reset()
            .and_then(|()| Self::init_backing_store(&self.path, self.max_size))
        {
            Ok(index) => {
                self.index = index;
                if let Err(error) = self.sync_init() {
                    error!(%error, "Cache restart failed.");
                    self.disabled = true;
                    return;
                }
                self.restarted = true;
                self.stats.set_counter(Counter::FatalError, errors);
                self.stats.set_counter(Counter::DoomCache, full_dooms);
                self.stats.set_counter(Counter::DoomRecent, partial_dooms);
            }
            Err(error) => {
                error!(%error, "Cache restart failed.");
                self.disabled = true;
            }
        }
    }

    fn max_size_reset(&mut self) -> Result<()> {
        let mut max_size = self.config.max_size;
        if max_size == 0 {
            max_size = DEFAULT_CACHE_SIZE;
        }
        let hard_limit = i32::MAX as i64 - i32::MAX as i64 / 10;
        self.max_size = max_size.min(hard_limit - 1);
        Ok(())
    }

    fn prepare_for_restart(&mut self) {
        if self.config.mask.is_none() {
            self.mask = 0;
        }
        self.disabled = true;
        self.index.header_mut().crash = 0;
        self.index.flush();
        self.block_files.close();
        self.rankings.reset();
        self.eviction = Eviction::default();
        self.open_entries.clear();
        self.open_set.clear();
        self.iterators.clear();
        self.num_refs = 0;
        self.this_id = 0;
    }

    fn delete_cache_files(&mut self) -> std::io::Result<()> {
        // The index map must be unmapped before its file is replaced.
        let entries = std::fs::read_dir(&self.path)?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == LOCK_NAME {
                continue;
            }
            if name == INDEX_NAME || name.starts_with("data_") || name.starts_with("f_") {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    // ---- housekeeping ----------------------------------------------------

    /// Runs after every queue operation: triggers a trim when the byte
    /// budget was exceeded by the operation just finished.
    pub(crate) fn on_operation_complete(&mut self) {
        if !self.consider_evicting {
            return;
        }
        self.consider_evicting = false;
        if self.disabled || self.read_only {
            return;
        }
        if self.index_num_bytes() > self.max_size
            && (self.up_ticks > TRIM_DELAY_TICKS || self.config.no_random)
        {
            if let Err(error) = self.trim_cache(false) {
                warn!(%error, "Trim failed.");
            }
        }
    }

    pub(crate) fn note_storage_growth(&mut self) {
        self.consider_evicting = true;
    }

    /// The 30 second statistics timer.
    pub(crate) fn on_stats_timer(&mut self) {
        if self.disabled {
            return;
        }
        self.up_ticks += 1;
        self.stats.on_event(Counter::TimerCycles);
        self.stats
            .set_counter(Counter::OpenEntries, self.open_entries.len() as i64);
        self.stats.set_counter(
            Counter::MaxEntries,
            self.index.header().num_entries as i64,
        );
        self.store_stats();
        self.index.flush();
        self.consider_evicting = true;
        self.on_operation_complete();
    }

    pub(crate) fn post_internal_trim(&mut self, empty: bool) {
        let _ = self
            .self_tx
            .send(crate::in_flight::Operation::InternalTrim { empty });
    }

    pub(crate) fn post_internal_trim_deleted(&mut self, empty: bool) {
        let _ = self
            .self_tx
            .send(crate::in_flight::Operation::InternalTrimDeleted { empty });
    }

    pub(crate) fn post_internal_delayed_trim(&mut self) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            let _ = tx.send(crate::in_flight::Operation::InternalDelayedTrim);
        });
    }

    /// Orderly shutdown: flush everything and clear the crash marker.
    pub(crate) fn cleanup(&mut self) {
        self.eviction.stop();
        if !self.disabled {
            self.store_stats();
            self.index.header_mut().crash = 0;
        }
        // Close whatever entries the user never closed.
        let addresses: Vec<CacheAddr> = self.open_entries.keys().copied().collect();
        for address in addresses {
            if let Some(slot) = self.open_entries.get_mut(&address) {
                slot.user_refs = 0;
            }
            self.maybe_finalize(address);
        }
        self.block_files.close();
        self.index.flush();
    }

    /// Validates the whole cache: every bucket chain and every list, plus
    /// the stored counts. Returns the number of dirty entries seen.
    pub(crate) fn self_check(&mut self) -> Result<i32> {
        let mut num_entries = 0;
        let mut num_dirty = 0;

        // More nodes than the stored count plus slack means a chain cycle.
        let limit = self.index.header().num_entries.saturating_add(1000);

        for slot in 0..=self.mask as usize {
            let mut address = Addr::from_value(self.index.table()[slot]);
            while address.is_initialized() {
                if num_entries + num_dirty > limit {
                    return Err(CacheError::InvalidLinks);
                }
                let (block, node) = self.load_record_for_walk(address)?;
                let dirty = node.data().dirty != 0 && node.data().dirty != self.this_id;
                if dirty {
                    num_dirty += 1;
                } else {
                    num_entries += 1;
                }
                debug_assert_eq!(slot as u32, block.data().hash & self.mask);
                if !self.block_files.is_valid(address) {
                    return Err(CacheError::InvalidEntry);
                }
                address = Addr::from_value(block.data().next);
            }
        }

        if num_entries + num_dirty != self.index.header().num_entries {
            return Err(CacheError::NumEntriesMismatch {
                stored: self.index.header().num_entries,
                traversed: num_entries + num_dirty,
            });
        }

        let (mut ctx, rankings) = rank_parts_inner(
            &mut self.block_files,
            &mut self.index,
            &mut self.rankings,
            &self.open_set,
            self.this_id,
            self.read_only,
            self.config.crash_point,
        );
        rankings.self_check(&mut ctx)?;
        Ok(num_dirty)
    }
}

/// Splits the disjoint backend pieces a rankings mutation needs. Kept as a
/// free function so the borrows stay field-granular.
fn rank_parts_inner<'a>(
    block_files: &'a mut BlockFiles,
    index: &'a mut IndexFile,
    rankings: &'a mut Rankings,
    open_set: &'a HashSet<CacheAddr>,
    this_id: i32,
    read_only: bool,
    crash_point: Option<crate::rankings::CrashPoint>,
) -> (RankCtx<'a>, &'a mut Rankings) {
    (
        RankCtx {
            files: block_files,
            lru: index.lru_mut(),
            current_id: this_id,
            read_only,
            open_contents: open_set,
            crash_point,
            crashed: false,
        },
        rankings,
    )
}
