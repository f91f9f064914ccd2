//! Cache entries: one key, up to three user data streams, and the in-memory
//! write-back buffer that sits between callers and the backing store.
//!
//! Small streams live in block-file slots; anything past 16 KiB spills to a
//! per-entry external file. Because the final size of a stream is unknown
//! while it is being written, writes land in a per-stream [`UserBuffer`]
//! first and the real allocation happens when the buffer is flushed, which
//! also lets a stream migrate between block-file and external storage as it
//! grows or shrinks.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    addr::{Addr, CacheAddr, FileType, MAX_BLOCK_SIZE},
    backend::Core,
    error::{CacheError, Result},
    format::{
        now_micros, EntryStore, RankingsNode, ENTRY_DOOMED, ENTRY_NORMAL, ENTRY_STORE_SIZE,
        MAX_INTERNAL_KEY_LENGTH, NUM_STREAMS, PARENT_ENTRY,
    },
    io::{BackingFile, CacheFile},
    rankings::load_node,
    sparse::SparseState,
    storage::StorageBlock,
};

/// Index of the backing-file slot used for a long key.
pub(crate) const KEY_FILE_INDEX: usize = 3;

const MAX_BUFFER_SIZE: i32 = 1024 * 1024; // 1 MB.

/// State of an entry shared with foreground handles: the accessors that must
/// answer without a round trip to the background thread.
#[derive(Debug)]
pub struct EntryShared {
    pub(crate) key: Mutex<String>,
    pub(crate) last_used: AtomicU64,
    pub(crate) last_modified: AtomicU64,
    pub(crate) data_sizes: [AtomicI32; NUM_STREAMS],
    pub(crate) doomed: AtomicBool,
}

impl EntryShared {
    pub(crate) fn new(node: &RankingsNode, entry: &EntryStore) -> Arc<EntryShared> {
        Arc::new(EntryShared {
            key: Mutex::new(String::new()),
            last_used: AtomicU64::new(node.last_used),
            last_modified: AtomicU64::new(node.last_modified),
            data_sizes: [
                AtomicI32::new(entry.data_size[0]),
                AtomicI32::new(entry.data_size[1]),
                AtomicI32::new(entry.data_size[2]),
            ],
            doomed: AtomicBool::new(false),
        })
    }

    pub(crate) fn touch(&self, modified: bool) {
        let now = now_micros();
        self.last_used.store(now, Ordering::Release);
        if modified {
            self.last_modified.store(now, Ordering::Release);
        }
    }

    pub fn key(&self) -> String {
        self.key.lock().clone()
    }
}

/// The background-thread state of one open entry.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) entry: StorageBlock<EntryStore>,
    pub(crate) node_addr: Addr,
    pub(crate) doomed: bool,
    /// Found dirty on disk: the record cannot be trusted.
    pub(crate) dirty: bool,
    pub(crate) read_only: bool,
    pub(crate) key: Option<String>,
    pub(crate) user_buffers: [Option<UserBuffer>; NUM_STREAMS],
    /// Size changes not yet folded into the backend's byte accounting.
    pub(crate) unreported_size: [i32; NUM_STREAMS + 1],
    /// Open handles to external files: one per stream plus the key file.
    pub(crate) files: [Option<CacheFile>; NUM_STREAMS + 1],
    pub(crate) sparse: Option<SparseState>,
    pub(crate) shared: Arc<EntryShared>,
}

impl Entry {
    pub(crate) fn address(&self) -> Addr {
        self.entry.address()
    }

    pub(crate) fn hash(&self) -> u32 {
        self.entry.data().hash
    }

    pub(crate) fn next_address(&self) -> CacheAddr {
        self.entry.data().next
    }

    pub(crate) fn data_size(&self, index: usize) -> i32 {
        if index >= 4 {
            return 0;
        }
        self.entry.data().data_size[index]
    }

    pub(crate) fn set_flags(&mut self, flags: u32) {
        self.entry.data_mut().flags |= flags;
    }

    pub(crate) fn flags(&self) -> u32 {
        self.entry.data().flags
    }

    /// True when the entry record was destroyed but the rankings node had to
    /// stay behind.
    pub(crate) fn leave_rankings_behind(&self, node: &RankingsNode) -> bool {
        node.contents == 0
    }

    /// Structural checks over the first block of the record: even a damaged
    /// entry should still let us find its rankings node so the pair can be
    /// deleted together.
    pub(crate) fn sanity_check(&self) -> bool {
        if !self.entry.verify_hash() {
            return false;
        }

        let stored = self.entry.data();
        if stored.rankings_node == 0 || stored.key_len <= 0 {
            return false;
        }
        if stored.reuse_count < 0 || stored.refetch_count < 0 {
            return false;
        }
        if !Addr::from_value(stored.rankings_node).sanity_check_for_rankings() {
            return false;
        }

        let next_addr = Addr::from_value(stored.next);
        if next_addr.is_initialized() && !next_addr.sanity_check_for_entry() {
            return false;
        }

        if stored.state > ENTRY_DOOMED || stored.state < ENTRY_NORMAL {
            return false;
        }

        let key_addr = Addr::from_value(stored.long_key);
        let key_len = stored.key_len as usize;
        if (key_len <= MAX_INTERNAL_KEY_LENGTH && key_addr.is_initialized())
            || (key_len > MAX_INTERNAL_KEY_LENGTH && !key_addr.is_initialized())
        {
            return false;
        }
        if !key_addr.sanity_check() {
            return false;
        }
        if key_addr.is_initialized()
            && ((stored.key_len < MAX_BLOCK_SIZE && key_addr.is_separate_file())
                || (stored.key_len >= MAX_BLOCK_SIZE && key_addr.is_block_file()))
        {
            return false;
        }

        let num_blocks = EntryStore::num_blocks_for_key(key_len);
        num_blocks == self.entry.address().num_blocks()
    }

    pub(crate) fn data_sanity_check(&self) -> bool {
        let stored = self.entry.data();
        let key_addr = Addr::from_value(stored.long_key);

        // The key must be NUL terminated.
        if !key_addr.is_initialized() && stored.key[stored.key_len as usize] != 0 {
            return false;
        }

        for i in 0..4 {
            let data_addr = Addr::from_value(stored.data_addr[i]);
            let data_size = stored.data_size[i];
            if data_size < 0 {
                return false;
            }
            if data_size == 0 && data_addr.is_initialized() {
                return false;
            }
            if !data_addr.sanity_check() {
                return false;
            }
            if data_size == 0 {
                continue;
            }
            if data_size <= MAX_BLOCK_SIZE && data_addr.is_separate_file() {
                return false;
            }
            if data_size > MAX_BLOCK_SIZE && data_addr.is_block_file() {
                return false;
            }
        }
        true
    }

    /// Clears the fields that failed `data_sanity_check` so the entry can at
    /// least be deleted safely.
    pub(crate) fn fix_for_delete(&mut self) {
        let stored = self.entry.data_mut();
        let key_addr = Addr::from_value(stored.long_key);
        if !key_addr.is_initialized() {
            let key_len = (stored.key_len.max(0) as usize).min(stored.key.len() - 1);
            stored.key[key_len] = 0;
        }

        for i in 0..4 {
            let data_addr = Addr::from_value(stored.data_addr[i]);
            let data_size = stored.data_size[i];
            if data_addr.is_initialized()
                && ((data_size <= MAX_BLOCK_SIZE && data_addr.is_separate_file())
                    || (data_size > MAX_BLOCK_SIZE && data_addr.is_block_file())
                    || !data_addr.sanity_check())
            {
                // The address is too strange to delete; keep the stored size
                // as it is what the byte accounting has been tracking.
                stored.data_addr[i] = 0;
            }
            if data_size < 0 {
                stored.data_size[i] = 0;
            }
        }
    }
}

/// Per-stream write-back buffer.
///
/// The buffer can start at any offset, but writes that land anywhere in the
/// first 16 KiB keep the start pinned at zero, because that prefix can end
/// up in a block-file slot whose content must be complete. Growth is charged
/// against the backend-wide budget.
#[derive(Debug)]
pub(crate) struct UserBuffer {
    offset: i32,
    buffer: Vec<u8>,
    capacity: i32,
    grow_allowed: bool,
}

/// Backend-wide budget for all user buffers.
#[derive(Debug)]
pub(crate) struct BufferBudget {
    used: i64,
    max: i64,
    enabled: bool,
}

impl BufferBudget {
    pub(crate) fn new(max: i64, enabled: bool) -> BufferBudget {
        BufferBudget {
            used: 0,
            max,
            enabled,
        }
    }

    fn is_alloc_allowed(&mut self, current: i32, new: i32) -> bool {
        debug_assert!(new > current);
        if !self.enabled {
            return false;
        }
        let to_add = (new - current) as i64;
        if self.used + to_add > self.max {
            return false;
        }
        self.used += to_add;
        true
    }

    fn deleted(&mut self, size: i32) {
        self.used -= size as i64;
        debug_assert!(self.used >= 0);
    }
}

impl UserBuffer {
    pub(crate) fn new() -> UserBuffer {
        UserBuffer {
            offset: 0,
            buffer: Vec::with_capacity(MAX_BLOCK_SIZE as usize),
            capacity: MAX_BLOCK_SIZE,
            grow_allowed: true,
        }
    }

    /// Returns whatever budget this buffer was holding.
    pub(crate) fn release(&self, budget: &mut BufferBudget) {
        if self.capacity > MAX_BLOCK_SIZE {
            budget.deleted(self.capacity - MAX_BLOCK_SIZE);
        }
    }

    /// Returns true if the buffer can take a write of `len` bytes at
    /// `offset`, growing if needed.
    pub(crate) fn pre_write(&mut self, budget: &mut BufferBudget, offset: i32, len: i32) -> bool {
        debug_assert!(offset >= 0 && len >= 0);

        // Never write before the current start.
        if offset < self.offset {
            return false;
        }

        // The common case.
        if offset + len <= self.capacity {
            return true;
        }

        // Writing past 16 KiB into an empty buffer will retarget the start,
        // so only the write itself has to fit.
        if self.size() == 0 && offset > MAX_BLOCK_SIZE {
            return self.grow_buffer(budget, len, MAX_BUFFER_SIZE);
        }

        let required = offset - self.offset + len;
        self.grow_buffer(budget, required, MAX_BUFFER_SIZE * 6 / 5)
    }

    /// Drops buffered bytes past `offset`.
    pub(crate) fn truncate(&mut self, offset: i32) {
        debug_assert!(offset >= self.offset);
        let offset = (offset - self.offset) as usize;
        if self.buffer.len() >= offset {
            self.buffer.truncate(offset);
        }
    }

    pub(crate) fn write(&mut self, offset: i32, buf: &[u8]) {
        debug_assert!(offset >= 0);

        // Zero-length writes that do not extend can be ignored here, even
        // before the start; truncates are handled elsewhere.
        if buf.is_empty() && offset < self.end() {
            return;
        }
        debug_assert!(offset >= self.offset);

        if self.size() == 0 && offset > MAX_BLOCK_SIZE {
            self.offset = offset;
        }
        let offset = (offset - self.offset) as usize;

        if offset > self.buffer.len() {
            self.buffer.resize(offset, 0);
        }
        if buf.is_empty() {
            return;
        }

        let overlap = (self.buffer.len() - offset).min(buf.len());
        self.buffer[offset..offset + overlap].copy_from_slice(&buf[..overlap]);
        self.buffer.extend_from_slice(&buf[overlap..]);
        self.capacity = self.capacity.max(self.buffer.len() as i32);
    }

    /// Returns true if a read of `*len` bytes at `offset` can be served from
    /// the buffer, given `eof` bytes stored on disk. May shrink `*len` even
    /// when returning false, meaning a smaller disk read should happen so it
    /// does not overlap the buffered range.
    pub(crate) fn pre_read(&self, eof: i32, offset: i32, len: &mut i32) -> bool {
        debug_assert!(offset >= 0 && *len > 0);

        if offset < self.offset {
            // Reading before this buffer.
            if offset >= eof {
                return true;
            }
            // Trim the disk read so it stops where the buffer starts.
            *len = (*len).min(self.offset - offset).min(eof - offset);
            return false;
        }

        if self.buffer.is_empty() {
            return false;
        }

        offset - self.offset < self.size()
    }

    /// Copies out up to `len` bytes at `offset`; ranges before the buffer
    /// start read as zeros (nothing was ever stored there).
    pub(crate) fn read(&self, offset: i32, buf: &mut [u8]) -> usize {
        debug_assert!(offset >= 0 && !buf.is_empty());

        let mut clean_bytes = 0usize;
        let mut offset = offset;
        if offset < self.offset {
            clean_bytes = ((self.offset - offset) as usize).min(buf.len());
            buf[..clean_bytes].fill(0);
            if clean_bytes == buf.len() {
                return clean_bytes;
            }
            offset = self.offset;
        }

        let start = (offset - self.offset) as usize;
        let available = self.buffer.len().saturating_sub(start);
        let len = (buf.len() - clean_bytes).min(available);
        buf[clean_bytes..clean_bytes + len].copy_from_slice(&self.buffer[start..start + len]);
        clean_bytes + len
    }

    /// Prepares the buffer for reuse, returning any extra budget.
    pub(crate) fn reset(&mut self, budget: &mut BufferBudget) {
        if !self.grow_allowed {
            if self.capacity > MAX_BLOCK_SIZE {
                budget.deleted(self.capacity - MAX_BLOCK_SIZE);
            }
            self.grow_allowed = true;
            self.buffer = Vec::with_capacity(MAX_BLOCK_SIZE as usize);
            self.capacity = MAX_BLOCK_SIZE;
        }
        self.offset = 0;
        self.buffer.clear();
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn size(&self) -> i32 {
        self.buffer.len() as i32
    }

    pub(crate) fn start(&self) -> i32 {
        self.offset
    }

    pub(crate) fn end(&self) -> i32 {
        self.offset + self.size()
    }

    fn grow_buffer(&mut self, budget: &mut BufferBudget, required: i32, limit: i32) -> bool {
        debug_assert!(required >= 0);
        let current_size = self.capacity;
        if required <= current_size {
            return true;
        }
        if required > limit {
            return false;
        }

        let to_add = (required - current_size).max(MAX_BLOCK_SIZE * 4).max(current_size);
        let required = (current_size + to_add).min(limit);

        self.grow_allowed = budget.is_alloc_allowed(current_size, required);
        if !self.grow_allowed {
            return false;
        }

        trace!(required, "Buffer grow.");
        self.buffer.reserve(required as usize - self.buffer.len());
        self.capacity = required;
        true
    }
}

impl Core {
    /// Reads up to `buf.len()` bytes of stream `index` at `offset`. Returns
    /// the number of bytes read.
    pub(crate) fn internal_read_data(
        &mut self,
        entry: &mut Entry,
        index: usize,
        offset: i32,
        buf: &mut [u8],
    ) -> Result<usize> {
        if index >= NUM_STREAMS {
            return Err(CacheError::InvalidArgument {
                reason: "stream index out of range",
            });
        }
        if offset < 0 {
            return Err(CacheError::InvalidArgument {
                reason: "negative offset",
            });
        }
        let entry_size = entry.entry.data().data_size[index];
        if offset >= entry_size || buf.is_empty() {
            return Ok(0);
        }

        let mut buf_len = buf.len() as i32;
        if offset + buf_len > entry_size {
            buf_len = entry_size - offset;
        }

        self.update_rank(entry, false)?;
        self.stats.on_read(buf_len);

        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        let eof = if address.is_initialized() { entry_size } else { 0 };
        if let Some(buffer) = entry.user_buffers[index].as_ref() {
            let mut clipped = buf_len;
            if buffer.pre_read(eof, offset, &mut clipped) {
                // Complete the operation locally.
                return Ok(buffer.read(offset, &mut buf[..clipped as usize]));
            }
            buf_len = clipped;
        }

        if !address.is_initialized() {
            self.doom_entry_impl(entry)?;
            return Err(CacheError::CacheReadFailure);
        }

        let read = self.read_stream_storage(entry, address, index, offset, &mut buf[..buf_len as usize]);
        if read.is_err() {
            self.doom_entry_impl(entry)?;
            return Err(CacheError::CacheReadFailure);
        }
        Ok(buf_len as usize)
    }

    /// Writes `buf` to stream `index` at `offset`. With `truncate`, the
    /// stream is cut to end at `offset + buf.len()`.
    pub(crate) fn internal_write_data(
        &mut self,
        entry: &mut Entry,
        index: usize,
        offset: i32,
        buf: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        if index >= NUM_STREAMS {
            return Err(CacheError::InvalidArgument {
                reason: "stream index out of range",
            });
        }
        if offset < 0 {
            return Err(CacheError::InvalidArgument {
                reason: "negative offset",
            });
        }

        let buf_len = buf.len() as i32;
        let max_file_size = self.max_file_size();
        let end_offset = (offset as i64) + (buf_len as i64);
        if offset as i64 > max_file_size || buf_len as i64 > max_file_size || end_offset > max_file_size {
            self.stats.on_too_much_storage_requested(end_offset);
            return Err(CacheError::InvalidArgument {
                reason: "write past the per-entry size limit",
            });
        }
        let end_offset = end_offset as i32;

        // Read the size now; it may change inside prepare.
        let entry_size = entry.entry.data().data_size[index];
        let extending = entry_size < end_offset;
        let truncate = truncate && entry_size > end_offset;
        self.prepare_target(entry, index, offset, buf_len, truncate)?;

        if extending || truncate {
            self.update_size(entry, index, entry_size, end_offset);
        }

        self.update_rank(entry, true)?;
        self.stats.on_write(buf_len);

        if let Some(buffer) = entry.user_buffers[index].as_mut() {
            // Complete the operation locally.
            buffer.write(offset, buf);
            entry
                .shared
                .data_sizes[index]
                .store(entry.entry.data().data_size[index], Ordering::Release);
            return Ok(buf.len());
        }

        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        if end_offset == 0 {
            debug_assert!(!truncate || !address.is_initialized());
            return Ok(0);
        }

        if address.is_separate_file() && (truncate || (extending && buf_len == 0)) {
            let file = self.backing_file(entry, address, index)?;
            file.set_length(end_offset as u64)
                .map_err(|_| CacheError::CacheWriteFailure)?;
        }

        if buf.is_empty() {
            return Ok(0);
        }

        if !address.is_initialized() {
            return Err(CacheError::CacheWriteFailure);
        }

        self.write_stream_storage(entry, address, index, offset, buf)
            .map_err(|_| CacheError::CacheWriteFailure)?;
        entry
            .shared
            .data_sizes[index]
            .store(entry.entry.data().data_size[index], Ordering::Release);
        Ok(buf.len())
    }

    fn read_stream_storage(
        &mut self,
        entry: &mut Entry,
        address: Addr,
        index: usize,
        offset: i32,
        buf: &mut [u8],
    ) -> Result<()> {
        if address.is_block_file() {
            debug_assert!(offset + buf.len() as i32 <= MAX_BLOCK_SIZE);
            let file = self.block_files.get_file(address)?;
            file.read(buf, address.offset_in_file() + offset as u64)
                .map_err(|source| CacheError::ReadFailure { source })?;
        } else {
            let file = self.backing_file(entry, address, index)?;
            file.read(buf, offset as u64)
                .map_err(|source| CacheError::ReadFailure { source })?;
        }
        Ok(())
    }

    fn write_stream_storage(
        &mut self,
        entry: &mut Entry,
        address: Addr,
        index: usize,
        offset: i32,
        buf: &[u8],
    ) -> Result<()> {
        if address.is_block_file() {
            debug_assert!(offset + buf.len() as i32 <= MAX_BLOCK_SIZE);
            let file = self.block_files.get_file(address)?;
            file.write(buf, address.offset_in_file() + offset as u64)
                .map_err(|source| CacheError::WriteFailure { source })?;
        } else {
            let file = self.backing_file(entry, address, index)?;
            file.write(buf, offset as u64)
                .map_err(|source| CacheError::WriteFailure { source })?;
        }
        Ok(())
    }

    /// Opens (and caches in the entry) the backing file for an external
    /// address.
    pub(crate) fn backing_file(
        &mut self,
        entry: &mut Entry,
        address: Addr,
        index: usize,
    ) -> Result<CacheFile> {
        debug_assert!(address.is_separate_file());
        if let Some(file) = entry.files[index].as_ref() {
            return Ok(file.clone());
        }
        let name = self.external_file_name(address);
        let file = CacheFile::open_or_create(&name)
            .map_err(|source| CacheError::StorageError { source })?;
        entry.files[index] = Some(file.clone());
        Ok(file)
    }

    /// Sets up the right storage target for a write: the user buffer when
    /// the write can stay in memory, otherwise whatever backing store the
    /// stream already uses.
    ///
    /// A buffer may overlap data already on disk, in which case the buffer
    /// holds the most recent bytes. It may also extend the stream, but it
    /// never reads from disk just to stay warm: as soon as there is a chance
    /// of confusion about which version of a range is current, the buffer is
    /// flushed and retargeted. The normal pattern is a simple sequential
    /// write from the start, and that is the fast path.
    fn prepare_target(
        &mut self,
        entry: &mut Entry,
        index: usize,
        offset: i32,
        buf_len: i32,
        truncate: bool,
    ) -> Result<()> {
        if truncate {
            return self.handle_truncation(entry, index, offset, buf_len);
        }

        if offset == 0 && buf_len == 0 {
            return Ok(());
        }

        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        if address.is_initialized() {
            if address.is_block_file() {
                self.move_to_local_buffer(entry, index)?;
            }

            if entry.user_buffers[index].is_none() && offset < MAX_BLOCK_SIZE {
                // A buffer is about to cover the first 16 KiB; preserve the
                // bytes already stored there.
                self.copy_to_local_buffer(entry, index)?;
            }
        }

        if entry.user_buffers[index].is_none() {
            entry.user_buffers[index] = Some(UserBuffer::new());
        }

        self.prepare_buffer(entry, index, offset, buf_len)
    }

    /// Shrinking writes: the stream already holds data past the new end.
    fn handle_truncation(&mut self, entry: &mut Entry, index: usize, offset: i32, buf_len: i32) -> Result<()> {
        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        let current_size = entry.entry.data().data_size[index];
        let new_size = offset + buf_len;

        if new_size == 0 {
            // By far the most common scenario.
            self.modify_storage_size(current_size - entry.unreported_size[index], 0);
            entry.unreported_size[index] = 0;
            let stored = entry.entry.data_mut();
            stored.data_addr[index] = 0;
            stored.data_size[index] = 0;
            self.store_entry_record(entry)?;
            self.delete_data(entry, address, index);

            if let Some(buffer) = entry.user_buffers[index].take() {
                buffer.release(&mut self.buffer_budget);
            }
            return Ok(());
        }

        // The file (if any) is truncated right away; only telling the
        // backend about the size change may be postponed.
        if entry.user_buffers[index].is_some() {
            if !address.is_initialized() {
                // No overlap between the buffer and the disk.
                let (start, end) = {
                    let buffer = entry.user_buffers[index].as_ref().expect("buffer present");
                    (buffer.start(), buffer.end())
                };
                if new_size > start {
                    // Truncate the buffer.
                    debug_assert!(new_size < end);
                    entry.user_buffers[index]
                        .as_mut()
                        .expect("buffer present")
                        .truncate(new_size);

                    if offset < start {
                        // The write lands before the buffer start: flush and
                        // retarget.
                        self.update_size(entry, index, current_size, new_size);
                        self.flush_buffer(entry, index, 0)?;
                        return self.prepare_buffer(entry, index, offset, buf_len);
                    }
                    return Ok(());
                }

                // Truncated to before the buffer; just discard it.
                entry.user_buffers[index]
                    .as_mut()
                    .expect("buffer present")
                    .reset(&mut self.buffer_budget);
                return self.prepare_buffer(entry, index, offset, buf_len);
            }

            // Some overlap, or the file needs extending before the cut.
            let start = entry.user_buffers[index].as_ref().expect("buffer present").start();
            if offset > start {
                entry.user_buffers[index]
                    .as_mut()
                    .expect("buffer present")
                    .truncate(new_size);
            }
            self.update_size(entry, index, current_size, new_size);
            self.flush_buffer(entry, index, 0)?;
            if let Some(buffer) = entry.user_buffers[index].take() {
                buffer.release(&mut self.buffer_budget);
            }
        }

        // Data exists on disk, not in a buffer.
        debug_assert!(entry.user_buffers[index].is_none());

        if new_size > MAX_BLOCK_SIZE {
            // Let the operation go straight to the (external) file.
            return Ok(());
        }

        self.import_separate_file(entry, index, new_size)
    }

    /// Loads the on-disk prefix of a stream into a fresh buffer.
    fn copy_to_local_buffer(&mut self, entry: &mut Entry, index: usize) -> Result<()> {
        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        debug_assert!(entry.user_buffers[index].is_none());
        debug_assert!(address.is_initialized());

        let len = entry.entry.data().data_size[index].min(MAX_BLOCK_SIZE);
        let mut bytes = vec![0u8; len as usize];
        self.read_stream_storage(entry, address, index, 0, &mut bytes)?;

        let mut buffer = UserBuffer::new();
        buffer.write(0, &bytes);
        entry.user_buffers[index] = Some(buffer);
        Ok(())
    }

    /// Moves block-file storage into the buffer and frees the blocks. The
    /// stream's bytes survive in memory only until the next flush.
    fn move_to_local_buffer(&mut self, entry: &mut Entry, index: usize) -> Result<()> {
        self.copy_to_local_buffer(entry, index)?;

        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        entry.entry.data_mut().data_addr[index] = 0;
        self.store_entry_record(entry)?;
        self.delete_data(entry, address, index);

        // If this entry is lost now, it reads back as zero sized.
        let len = entry.entry.data().data_size[index];
        self.modify_storage_size(len - entry.unreported_size[index], 0);
        entry.unreported_size[index] = len;
        Ok(())
    }

    /// Brings a shrinking external file back into the buffer so it can be
    /// reallocated as a block-file record.
    fn import_separate_file(&mut self, entry: &mut Entry, index: usize, new_size: i32) -> Result<()> {
        let current = entry.entry.data().data_size[index];
        if current > new_size {
            self.update_size(entry, index, current, new_size);
        }
        self.move_to_local_buffer(entry, index)
    }

    /// Makes room in the buffer for a write, flushing when it cannot grow.
    fn prepare_buffer(&mut self, entry: &mut Entry, index: usize, offset: i32, buf_len: i32) -> Result<()> {
        debug_assert!(entry.user_buffers[index].is_some());
        let (buffer_end, data_size) = {
            let buffer = entry.user_buffers[index].as_ref().expect("buffer present");
            (buffer.end(), entry.entry.data().data_size[index])
        };
        if (buffer_end != 0 && offset > buffer_end) || offset > data_size {
            // About to extend the buffer or the file with zeros; avoid
            // overwriting anything already stored past the buffer.
            let address = Addr::from_value(entry.entry.data().data_addr[index]);
            if address.is_initialized() && address.is_separate_file() {
                self.flush_buffer(entry, index, 0)?;
                // A file already exists: let this operation go straight to
                // disk instead of tracking its length in memory. A buffer may
                // only extend a stream when no backing file exists yet.
                if let Some(buffer) = entry.user_buffers[index].take() {
                    buffer.release(&mut self.buffer_budget);
                }
                return Ok(());
            }
        }

        let fits = entry.user_buffers[index]
            .as_mut()
            .expect("buffer present")
            .pre_write(&mut self.buffer_budget, offset, buf_len);
        if !fits {
            self.flush_buffer(entry, index, offset + buf_len)?;

            // Try again with the flushed buffer.
            let buffer = entry.user_buffers[index].as_mut().expect("buffer present");
            if offset > buffer.end()
                || !buffer.pre_write(&mut self.buffer_budget, offset, buf_len)
            {
                // The operation cannot be completed through a buffer.
                debug_assert!(buffer.size() == 0);
                debug_assert!(buffer.start() == 0);
                if let Some(buffer) = entry.user_buffers[index].take() {
                    buffer.release(&mut self.buffer_budget);
                }
            }
        }
        Ok(())
    }

    /// Writes the buffered bytes of stream `index` to its backing store,
    /// allocating storage sized `max(data_size, min_len)` when the stream
    /// has none yet.
    pub(crate) fn flush_buffer(&mut self, entry: &mut Entry, index: usize, min_len: i32) -> Result<()> {
        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        debug_assert!(entry.user_buffers[index].is_some());
        debug_assert!(!address.is_initialized() || address.is_separate_file());
        trace!(index, min_len, "Flushing user buffer.");

        let size = entry.entry.data().data_size[index].max(min_len);
        if size != 0 && !address.is_initialized() {
            self.create_data_block(entry, index, size)?;
        }

        if entry.entry.data().data_size[index] == 0 {
            debug_assert_eq!(
                entry.user_buffers[index].as_ref().expect("buffer present").size(),
                0
            );
            return Ok(());
        }

        let address = Addr::from_value(entry.entry.data().data_addr[index]);
        let (len, start) = {
            let buffer = entry.user_buffers[index].as_ref().expect("buffer present");
            (buffer.size(), buffer.start())
        };
        if len == 0 && start == 0 {
            return Ok(());
        }

        let bytes = entry.user_buffers[index]
            .as_ref()
            .expect("buffer present")
            .data()
            .to_vec();
        let offset = if address.is_block_file() {
            debug_assert_eq!(len, entry.entry.data().data_size[index]);
            debug_assert_eq!(start, 0);
            0
        } else {
            start
        };

        self.write_stream_storage(entry, address, index, offset, &bytes)?;
        entry.user_buffers[index]
            .as_mut()
            .expect("buffer present")
            .reset(&mut self.buffer_budget);
        Ok(())
    }

    /// Allocates storage for stream `index` sized for `size` bytes.
    fn create_data_block(&mut self, entry: &mut Entry, index: usize, size: i32) -> Result<()> {
        debug_assert!(index < NUM_STREAMS + 1);
        let address = self.create_block_for_size(size)?;
        entry.entry.data_mut().data_addr[index] = address.value();
        self.store_entry_record(entry)?;
        Ok(())
    }

    /// Allocates block-file or external storage for a record of `size`
    /// bytes.
    pub(crate) fn create_block_for_size(&mut self, size: i32) -> Result<Addr> {
        let file_type = Addr::required_file_type(size);
        if file_type == FileType::External {
            if size as i64 > self.max_file_size() {
                return Err(CacheError::InvalidArgument {
                    reason: "record larger than the per-entry limit",
                });
            }
            self.create_external_file()
        } else {
            let num_blocks = Addr::required_blocks(size, file_type);
            self.block_files.create_block(file_type, num_blocks)
        }
    }

    /// Releases the storage at `address`. Once the blocks are free they can
    /// be reused immediately, so the caller must have already dropped every
    /// reference to the address.
    pub(crate) fn delete_data(&mut self, entry: &mut Entry, address: Addr, index: usize) {
        if !address.is_initialized() {
            return;
        }
        if address.is_separate_file() {
            let name = self.external_file_name(address);
            if !crate::io::delete_cache_file(&name) {
                error!(path = %name.display(), "Failed to delete external file.");
            }
            entry.files[index] = None;
        } else {
            self.block_files.delete_block(address, true);
        }
    }

    fn update_size(&mut self, entry: &mut Entry, index: usize, old_size: i32, new_size: i32) {
        if entry.entry.data().data_size[index] == new_size {
            return;
        }
        entry.unreported_size[index] += new_size - old_size;
        entry.entry.data_mut().data_size[index] = new_size;
        if index < NUM_STREAMS {
            entry.shared.data_sizes[index].store(new_size, Ordering::Release);
        }
    }

    /// Updates the entry's position in the eviction lists, unless the entry
    /// is doomed, in which case only the timestamps move.
    pub(crate) fn update_rank(&mut self, entry: &mut Entry, modified: bool) -> Result<()> {
        entry.shared.touch(modified);
        if entry.doomed {
            let mut node = load_node(&mut self.block_files, entry.node_addr)?;
            let now = now_micros();
            node.data_mut().last_used = now;
            if modified {
                node.data_mut().last_modified = now;
            }
            crate::rankings::store_node(&mut self.block_files, &mut node)?;
            return Ok(());
        }
        self.update_rank_policy(entry, modified)
    }

    /// Stamps the current run id on the entry's rankings node so a crash
    /// from here on is detectable.
    pub(crate) fn mark_entry_dirty(&mut self, entry: &mut Entry) -> Result<()> {
        if entry.read_only {
            return Ok(());
        }
        let mut node = load_node(&mut self.block_files, entry.node_addr)?;
        if node.data().dirty == 0 {
            node.data_mut().dirty = self.this_id;
            crate::rankings::store_node(&mut self.block_files, &mut node)?;
        }
        Ok(())
    }

    /// Marks the entry as doomed and stamps its node dirty so the record is
    /// discarded if this run dies before the deferred destruction.
    pub(crate) fn internal_doom(&mut self, entry: &mut Entry) -> Result<()> {
        debug!(addr = entry.address().value(), "Dooming entry.");
        let mut node = load_node(&mut self.block_files, entry.node_addr)?;
        if node.data().dirty == 0 {
            node.data_mut().dirty = self.this_id;
            crate::rankings::store_node(&mut self.block_files, &mut node)?;
        }
        entry.doomed = true;
        entry.shared.doomed.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases every byte of user data the entry owns; with `everything`,
    /// the record, key storage, and rankings node go too.
    pub(crate) fn delete_entry_data(&mut self, entry: &mut Entry, everything: bool) -> Result<()> {
        debug_assert!(entry.doomed || !everything);

        if entry.flags() & PARENT_ENTRY != 0 {
            // The children of a sparse entry must go away with it.
            self.delete_sparse_children(entry)?;

            // Deleting a child can resplice this record's bucket link on
            // disk (the child may sit right behind it in the chain), which
            // this cached copy would otherwise overwrite below.
            if let Ok((block, _)) = self.load_record_for_walk(entry.address()) {
                entry.entry.data_mut().next = block.data().next;
            }
        }

        for index in 0..NUM_STREAMS {
            let address = Addr::from_value(entry.entry.data().data_addr[index]);
            if address.is_initialized() {
                let reported = entry.entry.data().data_size[index] - entry.unreported_size[index];
                self.modify_storage_size(reported, 0);
                entry.unreported_size[index] = 0;
                let stored = entry.entry.data_mut();
                stored.data_addr[index] = 0;
                stored.data_size[index] = 0;
                self.store_entry_record(entry)?;
                self.delete_data(entry, address, index);
            }
        }

        if !everything {
            return Ok(());
        }

        // Remove all traces of this entry.
        self.remove_doomed_entry(entry)?;

        // From here, the record and the node are just two blocks of data;
        // nothing should be referencing them anymore.
        let long_key = Addr::from_value(entry.entry.data().long_key);
        self.delete_data(entry, long_key, KEY_FILE_INDEX);
        self.modify_storage_size(entry.entry.data().key_len, 0);

        let node = load_node(&mut self.block_files, entry.node_addr)?;
        let leave_node = entry.leave_rankings_behind(node.data());

        self.block_files.delete_block(entry.address(), true);
        entry.entry.clear_modified();

        if !leave_node {
            self.block_files.delete_block(entry.node_addr, true);
        }
        Ok(())
    }

    /// Writes the entry record back to its block file.
    pub(crate) fn store_entry_record(&mut self, entry: &mut Entry) -> Result<()> {
        let file = self.block_files.get_file(entry.address())?;
        entry
            .entry
            .store(file)
            .map_err(|source| CacheError::WriteFailure { source })?;
        Ok(())
    }

    /// Flushes and accounts an entry as it goes away; the final step of a
    /// close. With `doomed`, the backing storage is destroyed instead.
    pub(crate) fn finalize_entry(&mut self, entry: &mut Entry) -> Result<()> {
        // Save the sparse info first; it generates I/O for this entry and
        // possibly a child.
        self.flush_sparse_state(entry)?;

        if entry.doomed {
            self.delete_entry_data(entry, true)?;
            return Ok(());
        }

        let mut flush_failed = false;
        for index in 0..NUM_STREAMS {
            if entry.user_buffers[index].is_some() {
                if let Err(error) = self.flush_buffer(entry, index, 0) {
                    warn!(%error, "Failed to save user data.");
                    flush_failed = true;
                }
                if let Some(buffer) = entry.user_buffers[index].take() {
                    buffer.release(&mut self.buffer_budget);
                }
            }
            if entry.unreported_size[index] != 0 {
                let size = entry.entry.data().data_size[index];
                self.modify_storage_size(size - entry.unreported_size[index], size);
                entry.unreported_size[index] = 0;
            }
        }

        if entry.entry.is_modified() {
            self.store_entry_record(entry)?;
        }

        let mut node = load_node(&mut self.block_files, entry.node_addr)?;
        if flush_failed {
            // The actual data could not be written; leave the node stamped
            // with a previous run id so the next open discards the entry.
            let mut stale = if self.this_id == 1 { -1 } else { self.this_id - 1 };
            if stale == 0 {
                stale = -1;
            }
            node.data_mut().dirty = stale;
            crate::rankings::store_node(&mut self.block_files, &mut node)?;
        } else if !entry.dirty && node.data().dirty != 0 {
            node.data_mut().dirty = 0;
            crate::rankings::store_node(&mut self.block_files, &mut node)?;
        }
        Ok(())
    }

    /// Reads the key of the entry at hand, from the inline area or from the
    /// long-key storage. The read is bounded by the stored key length so a
    /// corrupt backing file cannot produce an oversized key.
    pub(crate) fn read_entry_key(&mut self, entry: &mut Entry) -> Result<String> {
        if let Some(key) = entry.key.clone() {
            return Ok(key);
        }

        let key_len = entry.entry.data().key_len as usize;
        let long_key = Addr::from_value(entry.entry.data().long_key);
        let key = if long_key.is_initialized() {
            let mut bytes = vec![0u8; key_len];
            if long_key.is_block_file() {
                let file = self.block_files.get_file(long_key)?;
                file.read(&mut bytes, long_key.offset_in_file())
                    .map_err(|source| CacheError::ReadFailure { source })?;
            } else {
                let file = self.backing_file(entry, long_key, KEY_FILE_INDEX)?;
                file.read(&mut bytes, 0)
                    .map_err(|source| CacheError::ReadFailure { source })?;
            }
            String::from_utf8(bytes).map_err(|_| CacheError::InvalidEntry)?
        } else {
            let inline = &entry.entry.data().key;
            if key_len > inline.len() {
                // Keys up to MAX_INTERNAL_KEY_LENGTH continue into the
                // record's extra blocks.
                let bytes = entry.entry.as_bytes();
                let start = ENTRY_STORE_SIZE - inline.len();
                if start + key_len > bytes.len() {
                    return Err(CacheError::InvalidEntry);
                }
                String::from_utf8(bytes[start..start + key_len].to_vec())
                    .map_err(|_| CacheError::InvalidEntry)?
            } else {
                String::from_utf8(inline[..key_len].to_vec())
                    .map_err(|_| CacheError::InvalidEntry)?
            }
        };

        entry.key = Some(key.clone());
        *entry.shared.key.lock() = key.clone();
        Ok(key)
    }
}
