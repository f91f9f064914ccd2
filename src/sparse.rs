//! Sparse data support.
//!
//! A sparse entry is a *parent* that fans out to child entries, each child
//! holding one 1 MiB slice of the logical byte space. The parent keeps a
//! bitmap of which children exist in its own metadata stream; each child
//! keeps a 1024-bit map of which 1 KiB sub-blocks of its slice hold real
//! data, plus a record of one trailing partially-filled block. Sparse reads
//! and writes walk the affected children one at a time.
//!
//! Children are ordinary cache entries whose keys are derived from the
//! parent key and a shared random signature, so unrelated entries can never
//! be picked up as children by accident.

use std::{cell::RefCell, rc::Rc};

use bytemuck::Zeroable;
use rand::Rng;

use crate::{
    backend::Core,
    bitmap::Bitmap,
    entry::Entry,
    error::{CacheError, Result},
    format::{SparseData, SparseHeader, CHILD_ENTRY, INDEX_MAGIC, PARENT_ENTRY},
};

/// Stream holding a child's slice payload.
const SPARSE_DATA_STREAM: usize = 1;
/// Stream holding the sparse metadata of parents and children.
const SPARSE_INDEX_STREAM: usize = 2;

/// Size of a child's slice of the logical byte space.
const CHILD_SIZE: i64 = 1024 * 1024;
/// Size of the sub-blocks tracked by a child's bitmap.
const BLOCK_SIZE: i64 = 1024;
const BLOCKS_PER_CHILD: i32 = (CHILD_SIZE / BLOCK_SIZE) as i32;

/// Hard cap on the children map: 8 KiB of bitmap, 64 GiB of addressable
/// sparse space.
const MAX_CHILDREN: i64 = 65536;

const SPARSE_HEADER_SIZE: usize = std::mem::size_of::<SparseHeader>();
const SPARSE_DATA_SIZE: usize = std::mem::size_of::<SparseData>();

/// Sparse bookkeeping attached to a parent entry.
#[derive(Debug)]
pub(crate) struct SparseState {
    header: SparseHeader,
    children: Bitmap,
    /// Set by `cancel_sparse_io`; observed between children.
    abort: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SparseOp {
    Read,
    Write,
}

fn child_key(parent_key: &str, signature: u64, child_id: i64) -> String {
    format!("Range_{}:{:x}:{:x}", parent_key, signature, child_id)
}

/// How many bytes from the start of block `block` hold valid data.
fn valid_prefix(data: &SparseData, map: &Bitmap, block: i32) -> i32 {
    if map.get(block) {
        return BLOCK_SIZE as i32;
    }
    if data.header.last_block == block {
        return data.header.last_block_len;
    }
    0
}

impl Core {
    /// Prepares `entry` for sparse operation, creating or loading its
    /// metadata stream. Fails when the entry already holds incompatible
    /// regular data.
    pub(crate) fn init_sparse(&mut self, entry: &mut Entry) -> Result<()> {
        if entry.sparse.is_some() {
            return Ok(());
        }

        if entry.flags() & CHILD_ENTRY != 0 {
            return Err(CacheError::OperationNotSupported);
        }
        // Sparse entries cannot hold regular data in the streams the sparse
        // machinery uses.
        if entry.data_size(SPARSE_DATA_STREAM) != 0 && entry.flags() & PARENT_ENTRY == 0 {
            return Err(CacheError::OperationNotSupported);
        }

        let data_len = entry.data_size(SPARSE_INDEX_STREAM);
        let state = if data_len == 0 {
            self.create_sparse_entry(entry)?
        } else {
            self.open_sparse_entry(entry, data_len)?
        };
        entry.sparse = Some(state);
        Ok(())
    }

    fn create_sparse_entry(&mut self, entry: &mut Entry) -> Result<SparseState> {
        let key = self.read_entry_key(entry)?;
        let mut header = SparseHeader {
            signature: rand::thread_rng().gen(),
            magic: INDEX_MAGIC,
            parent_key_len: key.len() as i32,
            last_block: -1,
            last_block_len: 0,
        };
        if header.signature == 0 {
            header.signature = 1;
        }

        let state = SparseState {
            header,
            children: Bitmap::new(32),
            abort: false,
        };
        entry.set_flags(PARENT_ENTRY);
        self.store_entry_record(entry)?;
        self.write_parent_metadata(entry, &state)?;
        Ok(state)
    }

    fn open_sparse_entry(&mut self, entry: &mut Entry, data_len: i32) -> Result<SparseState> {
        if entry.flags() & PARENT_ENTRY == 0 {
            return Err(CacheError::OperationNotSupported);
        }
        if (data_len as usize) < SPARSE_HEADER_SIZE
            || (data_len as usize - SPARSE_HEADER_SIZE) % 4 != 0
        {
            return Err(CacheError::InvalidEntry);
        }

        let mut bytes = vec![0u8; data_len as usize];
        let read = self.internal_read_data(entry, SPARSE_INDEX_STREAM, 0, &mut bytes)?;
        if read != bytes.len() {
            return Err(CacheError::InvalidEntry);
        }

        let header: SparseHeader = bytemuck::pod_read_unaligned(&bytes[..SPARSE_HEADER_SIZE]);
        let key = self.read_entry_key(entry)?;
        if header.magic != INDEX_MAGIC
            || header.signature == 0
            || header.parent_key_len != key.len() as i32
        {
            warn!(addr = entry.address().value(), "Corrupt sparse header.");
            return Err(CacheError::InvalidEntry);
        }

        let words: Vec<u32> = bytes[SPARSE_HEADER_SIZE..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
            .collect();
        let num_bits = (words.len() * 32) as i32;
        Ok(SparseState {
            header,
            children: Bitmap::from_words(&words, num_bits),
            abort: false,
        })
    }

    /// Persists the parent's header and children bitmap in its metadata
    /// stream.
    fn write_parent_metadata(&mut self, entry: &mut Entry, state: &SparseState) -> Result<()> {
        let mut bytes = Vec::with_capacity(SPARSE_HEADER_SIZE + state.children.words().len() * 4);
        bytes.extend_from_slice(bytemuck::bytes_of(&state.header));
        bytes.extend_from_slice(bytemuck::cast_slice(state.children.words()));
        self.internal_write_data(entry, SPARSE_INDEX_STREAM, 0, &bytes, true)?;
        Ok(())
    }

    /// Saves the parent metadata at entry close.
    pub(crate) fn flush_sparse_state(&mut self, entry: &mut Entry) -> Result<()> {
        if let Some(state) = entry.sparse.take() {
            if !entry.doomed {
                self.write_parent_metadata(entry, &state)?;
            }
            entry.sparse = Some(state);
        }
        Ok(())
    }

    pub(crate) fn read_sparse_data(
        &mut self,
        entry: &mut Entry,
        offset: i64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.init_sparse(entry)?;
        self.do_sparse_io(entry, SparseOp::Read, offset, buf.len(), Some(buf), None)
    }

    pub(crate) fn write_sparse_data(
        &mut self,
        entry: &mut Entry,
        offset: i64,
        buf: &[u8],
    ) -> Result<usize> {
        self.init_sparse(entry)?;
        self.do_sparse_io(entry, SparseOp::Write, offset, buf.len(), None, Some(buf))
    }

    fn do_sparse_io(
        &mut self,
        entry: &mut Entry,
        op: SparseOp,
        offset: i64,
        len: usize,
        mut read_buf: Option<&mut [u8]>,
        write_buf: Option<&[u8]>,
    ) -> Result<usize> {
        if offset < 0 {
            return Err(CacheError::InvalidArgument {
                reason: "negative sparse offset",
            });
        }
        if offset + len as i64 > MAX_CHILDREN * CHILD_SIZE {
            return Err(CacheError::InvalidArgument {
                reason: "sparse range out of bounds",
            });
        }
        if len == 0 {
            return Ok(0);
        }

        let parent_key = self.read_entry_key(entry)?;
        let signature = entry.sparse.as_ref().expect("sparse initialized").header.signature;

        let mut pos = offset;
        let mut done = 0usize;
        while done < len {
            if entry
                .sparse
                .as_ref()
                .map(|state| state.abort)
                .unwrap_or(false)
            {
                entry.sparse.as_mut().expect("sparse initialized").abort = false;
                if done == 0 {
                    return Err(CacheError::OperationNotSupported);
                }
                break;
            }

            let child_id = pos / CHILD_SIZE;
            let child_offset = (pos % CHILD_SIZE) as i32;
            let child_len = ((CHILD_SIZE - child_offset as i64) as usize).min(len - done);

            match op {
                SparseOp::Write => {
                    let data = &write_buf.expect("write buffer")[done..done + child_len];
                    self.sparse_write_child(entry, &parent_key, signature, child_id, child_offset, data)?;
                }
                SparseOp::Read => {
                    let buf = read_buf.as_mut().expect("read buffer");
                    let out = &mut buf[done..done + child_len];
                    self.sparse_read_child(entry, &parent_key, signature, child_id, child_offset, out)?;
                }
            }

            pos += child_len as i64;
            done += child_len;
        }

        Ok(done)
    }

    fn sparse_write_child(
        &mut self,
        parent: &mut Entry,
        parent_key: &str,
        signature: u64,
        child_id: i64,
        child_offset: i32,
        data: &[u8],
    ) -> Result<usize> {
        let child_rc = self.open_child(parent_key, signature, child_id, true)?;
        let child_rc = child_rc.expect("writes always get a child");

        let result = (|| {
            let mut child = child_rc.borrow_mut();
            let written =
                self.internal_write_data(&mut child, SPARSE_DATA_STREAM, child_offset, data, false)?;

            let mut child_data = self.read_child_data(&mut child)?;
            update_child_range(&mut child_data, child_offset, written as i32);
            self.write_child_data(&mut child, &child_data)?;
            Ok(written)
        })();
        self.release_internal_entry(child_rc);

        let written = result?;

        // Track the child in the parent.
        let bit = child_id as i32;
        let mut state = parent.sparse.take().expect("sparse initialized");
        if state.children.size() <= bit {
            state.children.resize(Bitmap::required_array_size(bit + 1) * 32);
        }
        let newly_tracked = !state.children.get(bit);
        if newly_tracked {
            state.children.set(bit, true);
        }
        let persisted = if newly_tracked {
            self.write_parent_metadata(parent, &state)
        } else {
            Ok(())
        };
        parent.sparse = Some(state);
        persisted?;
        Ok(written)
    }

    fn sparse_read_child(
        &mut self,
        parent: &mut Entry,
        parent_key: &str,
        signature: u64,
        child_id: i64,
        child_offset: i32,
        out: &mut [u8],
    ) -> Result<()> {
        // Ranges with no child read as zeros.
        out.fill(0);
        if !child_present(parent, child_id) {
            return Ok(());
        }

        let Some(child_rc) = self.open_child(parent_key, signature, child_id, false)? else {
            return Ok(());
        };

        let result = (|| {
            let mut child = child_rc.borrow_mut();
            let child_data = self.read_child_data(&mut child)?;
            let map = Bitmap::from_words(&child_data.bitmap, BLOCKS_PER_CHILD);

            // Assemble the present sub-blocks; everything else stays zero.
            let end = child_offset + out.len() as i32;
            let mut block = child_offset / BLOCK_SIZE as i32;
            while block * (BLOCK_SIZE as i32) < end {
                let block_start = block * BLOCK_SIZE as i32;
                let valid = valid_prefix(&child_data, &map, block);
                let from = child_offset.max(block_start);
                let to = end.min(block_start + valid);
                if to > from {
                    let out_range = (from - child_offset) as usize..(to - child_offset) as usize;
                    let stream_size = child.data_size(SPARSE_DATA_STREAM);
                    if from < stream_size {
                        let want = (to.min(stream_size) - from) as usize;
                        let mut bytes = vec![0u8; want];
                        let read = self.internal_read_data(
                            &mut child,
                            SPARSE_DATA_STREAM,
                            from,
                            &mut bytes,
                        )?;
                        out[out_range][..read].copy_from_slice(&bytes[..read]);
                    }
                }
                block += 1;
            }
            Ok(())
        })();
        self.release_internal_entry(child_rc);
        result
    }

    /// Returns the first contiguous run of stored bytes inside
    /// `[offset, offset + len)`, as `(start, available)`. `available` is 0
    /// when the range holds no data at all.
    pub(crate) fn get_available_range(
        &mut self,
        entry: &mut Entry,
        offset: i64,
        len: i32,
    ) -> Result<(i64, i32)> {
        self.init_sparse(entry)?;
        if offset < 0 || len < 0 {
            return Err(CacheError::InvalidArgument {
                reason: "negative sparse range",
            });
        }

        let parent_key = self.read_entry_key(entry)?;
        let signature = entry.sparse.as_ref().expect("sparse initialized").header.signature;

        let end = offset + len as i64;
        let mut pos = offset;
        let mut found_start: Option<i64> = None;
        let mut run_len: i64 = 0;

        while pos < end {
            let child_id = pos / CHILD_SIZE;
            let child_offset = (pos % CHILD_SIZE) as i32;
            let span = (CHILD_SIZE - child_offset as i64).min(end - pos);

            if !child_present(entry, child_id) {
                if found_start.is_some() {
                    break;
                }
                pos += span;
                continue;
            }

            // Never opens a child that is not tracked in the bitmap.
            let Some(child_rc) = self.open_child(&parent_key, signature, child_id, false)?
            else {
                if found_start.is_some() {
                    break;
                }
                pos += span;
                continue;
            };

            let scan = (|| {
                let mut child = child_rc.borrow_mut();
                let child_data = self.read_child_data(&mut child)?;
                Ok::<SparseData, CacheError>(child_data)
            })();
            self.release_internal_entry(child_rc);
            let child_data = scan?;
            let map = Bitmap::from_words(&child_data.bitmap, BLOCKS_PER_CHILD);

            let child_end = child_offset + span as i32;
            let mut cursor = child_offset;
            while cursor < child_end {
                let block = cursor / BLOCK_SIZE as i32;
                let block_start = block * BLOCK_SIZE as i32;
                let valid = valid_prefix(&child_data, &map, block);
                let available_here = (block_start + valid - cursor).max(0);

                if available_here > 0 {
                    if found_start.is_none() {
                        found_start = Some(child_id * CHILD_SIZE + cursor as i64);
                    }
                    let usable = available_here.min(child_end - cursor);
                    run_len += usable as i64;
                    if block_start + valid < block_start + BLOCK_SIZE as i32 {
                        // The block is only partially valid; the run ends.
                        pos = end;
                        break;
                    }
                } else if found_start.is_some() {
                    pos = end;
                    break;
                }
                cursor = block_start + BLOCK_SIZE as i32;
            }

            if pos >= end {
                break;
            }
            pos = (child_id + 1) * CHILD_SIZE;
        }

        match found_start {
            Some(start) => {
                let available = run_len.min(end - start).min(i32::MAX as i64) as i32;
                Ok((start, available))
            }
            None => Ok((offset, 0)),
        }
    }

    /// Requests that the running sparse operation stop at the next child
    /// boundary.
    pub(crate) fn cancel_sparse_io(&mut self, entry: &mut Entry) {
        if let Some(state) = entry.sparse.as_mut() {
            state.abort = true;
        }
    }

    /// Whether the entry is ready for more sparse operations. Operations
    /// run to completion on the background thread, so the answer is always
    /// yes by the time this executes.
    pub(crate) fn ready_for_sparse_io(&mut self, entry: &mut Entry) -> Result<()> {
        if let Some(state) = entry.sparse.as_mut() {
            state.abort = false;
        }
        Ok(())
    }

    /// Dooms every child tracked by the parent's bitmap, then drops the
    /// parent flag.
    pub(crate) fn delete_sparse_children(&mut self, parent: &mut Entry) -> Result<()> {
        debug_assert!(parent.flags() & PARENT_ENTRY != 0);
        let init = self.init_sparse(parent);
        if init.is_err() {
            // The metadata is unreadable; nothing can be enumerated.
            parent.entry.data_mut().flags &= !PARENT_ENTRY;
            return Ok(());
        }

        let parent_key = self.read_entry_key(parent)?;
        let signature = parent.sparse.as_ref().expect("sparse initialized").header.signature;
        let children = parent.sparse.as_ref().expect("sparse initialized").children.clone();

        if children.test_range(0, children.size(), true) {
            let mut child_id = 0;
            while children.find_next_bit(&mut child_id, children.size(), true) {
                let key = child_key(&parent_key, signature, child_id as i64);
                match self.open_entry_internal(&key) {
                    Ok(Some(child_rc)) => {
                        {
                            let mut child = child_rc.borrow_mut();
                            self.doom_entry_impl(&mut child)?;
                        }
                        self.release_internal_entry(child_rc);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(%error, child_id, "Failed to open sparse child for deletion.");
                    }
                }
                child_id += 1;
            }
        }

        parent.entry.data_mut().flags &= !PARENT_ENTRY;
        parent.sparse = None;
        Ok(())
    }

    /// Opens the child for `child_id`, creating it for writes. Children that
    /// fail verification are doomed; writes then recreate them, reads
    /// continue without one.
    fn open_child(
        &mut self,
        parent_key: &str,
        signature: u64,
        child_id: i64,
        for_write: bool,
    ) -> Result<Option<Rc<RefCell<Entry>>>> {
        let key = child_key(parent_key, signature, child_id);

        if let Some(child_rc) = self.open_entry_internal(&key)? {
            let verified = {
                let mut child = child_rc.borrow_mut();
                self.verify_child(&mut child, signature, child_id)?
            };
            if verified {
                return Ok(Some(child_rc));
            }

            // The child does not belong to this parent; get rid of it and
            // continue.
            warn!(child_id, "Killing mismatched sparse child.");
            {
                let mut child = child_rc.borrow_mut();
                self.doom_entry_impl(&mut child)?;
            }
            self.release_internal_entry(child_rc);
            if !for_write {
                return Ok(None);
            }
        } else if !for_write {
            return Ok(None);
        }

        let child_rc = self.create_entry_internal(&key)?;
        {
            let mut child = child_rc.borrow_mut();
            child.set_flags(CHILD_ENTRY);
            self.store_entry_record(&mut child)?;

            let mut child_data = SparseData::zeroed();
            child_data.header = SparseHeader {
                signature,
                magic: INDEX_MAGIC,
                parent_key_len: parent_key.len() as i32,
                last_block: -1,
                last_block_len: 0,
            };
            child_data.child_id = child_id as i32;
            self.write_child_data(&mut child, &child_data)?;
        }
        Ok(Some(child_rc))
    }

    fn verify_child(&mut self, child: &mut Entry, signature: u64, child_id: i64) -> Result<bool> {
        if child.flags() & CHILD_ENTRY == 0 {
            return Ok(false);
        }
        if child.data_size(SPARSE_INDEX_STREAM) != SPARSE_DATA_SIZE as i32 {
            return Ok(false);
        }
        let child_data = self.read_child_data(child)?;
        Ok(child_data.header.magic == INDEX_MAGIC
            && child_data.header.signature == signature
            && child_data.child_id as i64 == child_id)
    }

    fn read_child_data(&mut self, child: &mut Entry) -> Result<SparseData> {
        let mut bytes = vec![0u8; SPARSE_DATA_SIZE];
        let read = self.internal_read_data(child, SPARSE_INDEX_STREAM, 0, &mut bytes)?;
        if read != SPARSE_DATA_SIZE {
            return Err(CacheError::InvalidEntry);
        }
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn write_child_data(&mut self, child: &mut Entry, data: &SparseData) -> Result<()> {
        self.internal_write_data(child, SPARSE_INDEX_STREAM, 0, bytemuck::bytes_of(data), false)?;
        Ok(())
    }
}

fn child_present(parent: &Entry, child_id: i64) -> bool {
    let state = parent.sparse.as_ref().expect("sparse initialized");
    let bit = child_id as i32;
    bit < state.children.size() && state.children.get(bit)
}

/// Folds a completed write into the child's block map: fully valid blocks
/// get their bit set, a trailing partial block is remembered through
/// `last_block`, and a head block whose leading bytes were never written
/// stays untracked (the data is kept but reads treat it as absent).
fn update_child_range(data: &mut SparseData, offset: i32, len: i32) {
    if len <= 0 {
        return;
    }
    let block_size = BLOCK_SIZE as i32;
    let mut map = Bitmap::from_words(&data.bitmap, BLOCKS_PER_CHILD);
    let end = offset + len;
    let mut block = offset / block_size;

    // Mark a block whose bytes are now contiguously valid up to
    // `new_valid` from its start.
    let mut apply = |map: &mut Bitmap, data: &mut SparseData, block: i32, new_valid: i32| {
        if new_valid >= block_size {
            map.set(block, true);
            if data.header.last_block == block {
                data.header.last_block = -1;
                data.header.last_block_len = 0;
            }
        } else {
            map.set(block, false);
            data.header.last_block = block;
            data.header.last_block_len = new_valid;
        }
    };

    // Head block: only counts if the write continues data that is already
    // valid from the block start.
    if offset % block_size != 0 {
        let block_start = block * block_size;
        let prefix = valid_prefix(data, &map, block);
        if prefix >= offset - block_start {
            let new_valid = prefix.max(end.min(block_start + block_size) - block_start);
            apply(&mut map, data, block, new_valid);
        }
        block += 1;
    }

    // Fully covered blocks.
    let full_end = end / block_size;
    if block < full_end {
        map.set_range(block, full_end, true);
        if (block..full_end).contains(&data.header.last_block) {
            data.header.last_block = -1;
            data.header.last_block_len = 0;
        }
        block = full_end;
    }

    // Trailing partial block, contiguous from its start by construction.
    if block * block_size < end && block == end / block_size {
        let prefix = valid_prefix(data, &map, block);
        let new_valid = prefix.max(end - block * block_size);
        apply(&mut map, data, block, new_valid);
    }

    data.bitmap.copy_from_slice(map.words());
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;

    #[test]
    fn aligned_write_sets_full_blocks() {
        let mut data = SparseData::zeroed();
        data.header.last_block = -1;
        update_child_range(&mut data, 0, 4096);
        let map = Bitmap::from_words(&data.bitmap, BLOCKS_PER_CHILD);
        assert!(map.get(0) && map.get(1) && map.get(2) && map.get(3));
        assert!(!map.get(4));
        assert_eq!(data.header.last_block, -1);
    }

    #[test]
    fn trailing_partial_block_is_tracked() {
        let mut data = SparseData::zeroed();
        data.header.last_block = -1;
        update_child_range(&mut data, 0, 1536);
        let map = Bitmap::from_words(&data.bitmap, BLOCKS_PER_CHILD);
        assert!(map.get(0));
        assert!(!map.get(1));
        assert_eq!(data.header.last_block, 1);
        assert_eq!(data.header.last_block_len, 512);

        // Completing the block clears the partial record.
        update_child_range(&mut data, 1536, 512);
        let map = Bitmap::from_words(&data.bitmap, BLOCKS_PER_CHILD);
        assert!(map.get(1));
        assert_eq!(data.header.last_block, -1);
    }

    #[test]
    fn unaligned_hole_stays_untracked() {
        let mut data = SparseData::zeroed();
        data.header.last_block = -1;
        // Bytes 512..1024 of block 0, with 0..512 unknown.
        update_child_range(&mut data, 512, 512);
        let map = Bitmap::from_words(&data.bitmap, BLOCKS_PER_CHILD);
        assert!(!map.get(0));
        assert_eq!(data.header.last_block, -1);
    }

    #[test]
    fn child_keys_are_scoped_by_signature() {
        let a = child_key("http://example.com/a", 0xdead_beef, 3);
        let b = child_key("http://example.com/a", 0xdead_beef, 4);
        let c = child_key("http://example.com/a", 0xfeed_f00d, 3);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "Range_http://example.com/a:deadbeef:3");
    }
}
