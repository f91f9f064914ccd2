//! Block files: per-size-class files of fixed-size slots with bitmap
//! allocation.
//!
//! Each of the four size classes (36 B rankings nodes, 256 B, 1 KiB, 4 KiB)
//! owns a chain of files. A file's header carries an allocation bitmap plus
//! two derived vectors: `empty[n]`, counting nibble-aligned free runs able to
//! hold `n + 1` contiguous blocks, and `hints[n]`, the bitmap word where the
//! last run of that length was found. Allocations of 1..4 blocks never cross
//! a nibble, so a 4-bit group fully describes what can still be placed in it.
//!
//! The `updating` header field is raised around every header mutation; a set
//! flag at open time means the previous run died mid-update and the derived
//! vectors must be rebuilt from the bitmap.

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{
    addr::{Addr, FileType, MAX_NUM_BLOCKS},
    error::{CacheError, InvalidArgumentSnafu, Result, StorageSnafu, WriteFailureSnafu},
    format::{
        BlockFileHeader, BLOCK_HEADER_SIZE, BLOCK_MAGIC, BLOCK_VERSION,
        FIRST_ADDITIONAL_BLOCK_FILE, MAX_BLOCKS, MAX_BLOCK_FILE,
    },
    io::{delete_cache_file, BackingFile, CacheFile, MappedFile},
};

const BLOCK_NAME: &str = "data_";

/// Largest record a single nibble pattern can describe: the number of
/// consecutive blocks that can still be stored at the free tail of a nibble.
const MAP_BLOCK_TYPES: [i32; 16] = [4, 3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];

fn map_block_type(value: u32) -> i32 {
    MAP_BLOCK_TYPES[(value & 0xf) as usize]
}

pub fn block_file_name(path: &Path, index: i32) -> PathBuf {
    path.join(format!("{}{}", BLOCK_NAME, index))
}

fn header_of(file: &MappedFile) -> &BlockFileHeader {
    bytemuck::from_bytes(&file.buffer()[..BLOCK_HEADER_SIZE])
}

fn header_of_mut(file: &mut MappedFile) -> &mut BlockFileHeader {
    bytemuck::from_bytes_mut(&mut file.buffer_mut()[..BLOCK_HEADER_SIZE])
}

/// Runs `body` with the header's `updating` flag raised, so a crash inside
/// the mutation is detectable at the next open.
fn with_file_lock<R>(header: &mut BlockFileHeader, body: impl FnOnce(&mut BlockFileHeader) -> R) -> R {
    header.updating += 1;
    let result = body(header);
    header.updating -= 1;
    result
}

/// Allocates `size` consecutive blocks in the bitmap described by `header`.
/// Returns the starting block index.
fn create_map_block(header: &mut BlockFileHeader, size: i32) -> Option<i32> {
    debug_assert!(size > 0 && size <= MAX_NUM_BLOCKS);
    let mut target = 0;
    for i in size..=MAX_NUM_BLOCKS {
        if header.empty[(i - 1) as usize] != 0 {
            target = i;
            break;
        }
    }
    if target == 0 {
        return None;
    }

    // Process the map in 32-block words, inspecting the 8 nibbles of each
    // word for one whose free tail matches the target exactly.
    let words = (header.max_entries / 32) as usize;
    let mut current = header.hints[(target - 1) as usize] as usize % words.max(1);
    for _ in 0..words {
        let mut map_block = header.allocation_map[current];
        for nibble in 0..8 {
            if map_block_type(map_block) == target {
                return Some(with_file_lock(header, |header| {
                    let index_offset = nibble * 4 + 4 - target;
                    let index = current as i32 * 32 + index_offset;
                    let to_add = (((1u32 << size) - 1) as u32) << index_offset;
                    header.num_entries += 1;
                    header.allocation_map[current] |= to_add;
                    header.hints[(target - 1) as usize] = current as i32;
                    header.empty[(target - 1) as usize] -= 1;
                    debug_assert!(header.empty[(target - 1) as usize] >= 0);
                    if target != size {
                        header.empty[(target - size - 1) as usize] += 1;
                    }
                    index
                }));
            }
            map_block >>= 4;
        }
        current += 1;
        if current == words {
            current = 0;
        }
    }

    None
}

/// Releases `size` blocks starting at `index` and fixes up the free-run
/// counters of the containing nibble.
fn delete_map_block(header: &mut BlockFileHeader, index: i32, size: i32) {
    debug_assert!(size > 0 && size <= MAX_NUM_BLOCKS);
    let word_index = (index / 32) as usize;
    let nibble_shift = ((index % 32) / 4) * 4;
    let nibble = (header.allocation_map[word_index] >> nibble_shift) & 0xf;

    // Free run the nibble will offer once these blocks are gone.
    let bits_at_end = 4 - size - index % 4;
    let end_mask = ((0xfu32 << (4 - bits_at_end)) & 0xf) as u32;
    let update_counters = nibble & end_mask == 0;
    let cleared = nibble & !((((1u32 << size) - 1) as u32) << (index % 4));
    let new_type = map_block_type(cleared);

    with_file_lock(header, |header| {
        let to_clear = (((1u32 << size) - 1) as u32) << (index % 32);
        debug_assert_eq!(header.allocation_map[word_index] & to_clear, to_clear);
        header.allocation_map[word_index] &= !to_clear;

        if update_counters {
            if bits_at_end > 0 {
                header.empty[(bits_at_end - 1) as usize] -= 1;
                debug_assert!(header.empty[(bits_at_end - 1) as usize] >= 0);
            }
            header.empty[(new_type - 1) as usize] += 1;
        }
        header.num_entries -= 1;
        debug_assert!(header.num_entries >= 0);
    });
}

/// Whether the blocks at `index` are currently marked as allocated.
fn used_map_block(header: &BlockFileHeader, index: i32, size: i32) -> bool {
    if size < 1 || size > MAX_NUM_BLOCKS {
        return false;
    }
    let word_index = (index / 32) as usize;
    let to_check = (((1u32 << size) - 1) as u32) << (index % 32);
    header.allocation_map[word_index] & to_check == to_check
}

/// Rebuilds `empty[]` and `hints[]` from the bitmap after undetected
/// corruption (an OS crash can leave them out of sync).
fn fix_allocation_counters(header: &mut BlockFileHeader) {
    header.hints = [0; 4];
    header.empty = [0; 4];

    for word in 0..(header.max_entries / 32) as usize {
        let mut map_block = header.allocation_map[word];
        for _ in 0..8 {
            let block_type = map_block_type(map_block);
            if block_type != 0 {
                header.empty[(block_type - 1) as usize] += 1;
            }
            map_block >>= 4;
        }
    }
}

fn empty_blocks(header: &BlockFileHeader) -> i32 {
    let mut empty = 0;
    for i in 0..MAX_NUM_BLOCKS as usize {
        empty += header.empty[i] * (i as i32 + 1);
        if header.empty[i] < 0 {
            return 0;
        }
    }
    empty
}

fn validate_counters(header: &BlockFileHeader) -> bool {
    if header.max_entries < 0 || header.max_entries > MAX_BLOCKS || header.num_entries < 0 {
        return false;
    }
    empty_blocks(header) + header.num_entries <= header.max_entries
}

/// Whether an allocation of `block_count` blocks should move past this file
/// in the chain (or grow it) instead of being placed here.
fn need_to_grow(header: &BlockFileHeader, block_count: i32) -> bool {
    let mut have_space = false;
    let mut empty = 0;
    for i in 0..MAX_NUM_BLOCKS as usize {
        empty += header.empty[i] * (i as i32 + 1);
        if i as i32 >= block_count - 1 && header.empty[i] != 0 {
            have_space = true;
        }
    }

    if header.next_file != 0 && empty < MAX_BLOCKS / 10 {
        // This file is almost full but a later one already exists; leave the
        // remaining space so it is easier to find free blocks when this file
        // comes back into use.
        return true;
    }
    !have_space
}

/// The set of block files backing one cache directory.
#[derive(Debug)]
pub struct BlockFiles {
    path: PathBuf,
    files: Vec<Option<MappedFile>>,
    init: bool,
}

impl BlockFiles {
    pub fn new(path: PathBuf) -> BlockFiles {
        BlockFiles {
            path,
            files: Vec::new(),
            init: false,
        }
    }

    /// Opens (and with `create_files`, first creates) the four head files,
    /// then prunes empty files from each chain.
    pub fn init(&mut self, create_files: bool) -> Result<()> {
        debug_assert!(!self.init);
        self.files.clear();
        self.files
            .resize_with(FIRST_ADDITIONAL_BLOCK_FILE as usize, || None);

        for i in 0..FIRST_ADDITIONAL_BLOCK_FILE {
            let file_type = class_for_index(i);
            if create_files {
                self.create_block_file(i, file_type, true)?;
            }
            self.open_block_file(i)?;
            self.remove_empty_files(file_type)?;
        }

        self.init = true;
        Ok(())
    }

    pub fn close(&mut self) {
        self.init = false;
        self.files.clear();
    }

    /// The mapped file holding `address`, opening it on demand.
    pub fn get_file(&mut self, address: Addr) -> Result<&MappedFile> {
        debug_assert!(address.is_block_file());
        let index = address.file_number() as usize;
        self.ensure_open(index)?;
        Ok(self.files[index].as_ref().expect("file opened above"))
    }

    fn ensure_open(&mut self, index: usize) -> Result<()> {
        if index >= self.files.len() || self.files[index].is_none() {
            self.open_block_file(index as i32)?;
        }
        Ok(())
    }

    /// Allocates `block_count` blocks of class `block_type`.
    pub fn create_block(&mut self, block_type: FileType, block_count: i32) -> Result<Addr> {
        debug_assert!(block_type != FileType::External);
        if !(1..=MAX_NUM_BLOCKS).contains(&block_count) {
            return InvalidArgumentSnafu {
                reason: "block count out of range",
            }
            .fail();
        }
        if !self.init {
            return Err(CacheError::Disabled);
        }

        let file_index = self.file_for_new_block(block_type, block_count)?;
        let file = self.files[file_index].as_mut().expect("chain file open");
        let header = header_of_mut(file);

        let index = match create_map_block(header, block_count) {
            Some(index) => index,
            None => {
                // An undetected corruption can strand the counters; rebuild
                // them from the bitmap and retry once.
                warn!(file_index, "Block allocation failed; fixing counters.");
                fix_allocation_counters(header);
                match create_map_block(header, block_count) {
                    Some(index) => index,
                    None => return Err(CacheError::CacheFull),
                }
            }
        };

        let this_file = header.this_file as i32;
        let _ = file.flush();
        Ok(Addr::new(block_type, block_count, this_file, index))
    }

    /// Releases the blocks at `address`. With `deep`, the block contents are
    /// zeroed so reused blocks never leak stale data.
    pub fn delete_block(&mut self, address: Addr, deep: bool) {
        if !address.is_initialized() || address.is_separate_file() {
            return;
        }

        let Ok(file) = self.get_file(address) else {
            return;
        };

        if deep {
            let size = (address.block_size() * address.num_blocks()) as usize;
            let zeros = vec![0u8; size];
            if let Err(error) = file.write(&zeros, address.offset_in_file()) {
                warn!(%error, "Failed to zero deleted blocks.");
            }
        }

        let index = address.file_number() as usize;
        let file = self.files[index].as_mut().expect("file opened above");
        let header = header_of_mut(file);
        delete_map_block(header, address.start_block(), address.num_blocks());
        let entry_size = header.entry_size;
        let now_empty = header.num_entries == 0;
        let _ = file.flush();

        if now_empty {
            // The whole file is free; try to drop it from the chain.
            let file_type = class_for_entry_size(entry_size);
            let _ = self.remove_empty_files(file_type);
        }
    }

    /// Whether `address` points at blocks currently marked allocated.
    pub fn is_valid(&mut self, address: Addr) -> bool {
        if !address.is_initialized() || address.is_separate_file() {
            return false;
        }
        match self.get_file(address) {
            Ok(file) => used_map_block(header_of(file), address.start_block(), address.num_blocks()),
            Err(_) => false,
        }
    }

    fn create_block_file(&self, index: i32, file_type: FileType, force: bool) -> Result<()> {
        let name = block_file_name(&self.path, index);
        let file = if force {
            CacheFile::open_or_create(&name).context(StorageSnafu)?
        } else {
            CacheFile::create_exclusive(&name).context(StorageSnafu)?
        };

        let header = BlockFileHeader::new(index as i16, file_type.block_size());
        file.write(bytemuck::bytes_of(&header), 0)
            .context(WriteFailureSnafu)?;
        file.set_length(BLOCK_HEADER_SIZE as u64)
            .context(WriteFailureSnafu)?;
        Ok(())
    }

    fn open_block_file(&mut self, index: i32) -> Result<()> {
        if self.files.len() <= index as usize {
            self.files.resize_with(index as usize + 1, || None);
        }

        let name = block_file_name(&self.path, index);
        let mut file = MappedFile::open(&name, BLOCK_HEADER_SIZE).map_err(|error| {
            error!(path = %name.display(), %error, "Failed to open block file.");
            CacheError::InitFailed {
                reason: format!("cannot open {}", name.display()),
            }
        })?;

        let file_len = file.get_length().context(StorageSnafu)?;
        let header = header_of(&file);
        if header.magic != BLOCK_MAGIC || header.version != BLOCK_VERSION {
            error!(path = %name.display(), "Invalid block file magic or version.");
            return Err(CacheError::InitFailed {
                reason: format!("bad magic in {}", name.display()),
            });
        }

        if header.updating != 0 || !validate_counters(header) {
            // The last run did not shut down cleanly, or the counters are out
            // of sync with the bitmap.
            if !fix_block_file_header(&mut file) {
                error!(path = %name.display(), "Unable to fix block file.");
                return Err(CacheError::InitFailed {
                    reason: format!("unable to fix {}", name.display()),
                });
            }
        }

        let header = header_of(&file);
        if (file_len as i64)
            < header.max_entries as i64 * header.entry_size as i64 + BLOCK_HEADER_SIZE as i64
        {
            error!(path = %name.display(), "Block file too small.");
            return Err(CacheError::InitFailed {
                reason: format!("truncated {}", name.display()),
            });
        }

        self.files[index as usize] = Some(file);
        Ok(())
    }

    /// Finds (growing or extending the chain as needed) the file that should
    /// receive a new allocation of `block_count` blocks.
    fn file_for_new_block(&mut self, block_type: FileType, block_count: i32) -> Result<usize> {
        let mut index = (block_type_index(block_type)) as usize;
        loop {
            self.ensure_open(index)?;
            let file = self.files[index].as_mut().expect("file opened above");
            let header = header_of_mut(file);
            if !need_to_grow(header, block_count) {
                return Ok(index);
            }

            if header.max_entries == MAX_BLOCKS {
                index = self.next_file(index)?;
                continue;
            }

            grow_block_file(file)?;
            return Ok(index);
        }
    }

    /// Moves to the next file of the chain, creating one if the chain ends.
    fn next_file(&mut self, index: usize) -> Result<usize> {
        let file = self.files[index].as_mut().expect("chain file open");
        let header = header_of_mut(file);
        let mut new_file = header.next_file as i32;
        if new_file == 0 {
            let file_type = class_for_entry_size(header.entry_size);
            new_file = self.create_next_block_file(file_type)?;

            let file = self.files[index].as_mut().expect("chain file open");
            let header = header_of_mut(file);
            with_file_lock(header, |header| {
                header.next_file = new_file as i16;
            });
            let _ = file.flush();
        }

        self.ensure_open(new_file as usize)?;
        Ok(new_file as usize)
    }

    fn create_next_block_file(&mut self, block_type: FileType) -> Result<i32> {
        for i in FIRST_ADDITIONAL_BLOCK_FILE..=MAX_BLOCK_FILE {
            if self.create_block_file(i, block_type, false).is_ok() {
                return Ok(i);
            }
        }
        Err(CacheError::CacheFull)
    }

    /// Walks the chain for `block_type`, unlinking and deleting files that
    /// became entirely empty.
    fn remove_empty_files(&mut self, block_type: FileType) -> Result<()> {
        let mut index = block_type_index(block_type) as usize;
        loop {
            let file = self.files[index].as_ref().expect("chain head open");
            let next_index = header_of(file).next_file as usize;
            if next_index == 0 {
                return Ok(());
            }

            self.ensure_open(next_index)?;
            let next_file = self.files[next_index].as_ref().expect("file opened above");
            let next_header = header_of(next_file);
            if next_header.num_entries != 0 {
                index = next_index;
                continue;
            }

            let next_next = next_header.next_file;
            let next_entry_size = next_header.entry_size;
            let file = self.files[index].as_mut().expect("chain head open");
            let header = header_of_mut(file);
            debug_assert_eq!(header.entry_size, next_entry_size);
            with_file_lock(header, |header| {
                header.next_file = next_next;
            });
            let _ = file.flush();

            // Unmap before deleting so the name can actually go away.
            self.files[next_index] = None;
            let name = block_file_name(&self.path, next_index as i32);
            if !delete_cache_file(&name) {
                warn!(path = %name.display(), "Failed to delete empty block file.");
            }
        }
    }
}

/// Extends a block file by 1024 entries, up to the hard cap.
fn grow_block_file(file: &mut MappedFile) -> Result<()> {
    let header = header_of(file);
    debug_assert_eq!(header.empty[3], 0);
    let mut new_size = header.max_entries + 1024;
    if new_size > MAX_BLOCKS {
        new_size = MAX_BLOCKS;
    }

    let new_size_bytes = new_size as i64 * header.entry_size as i64 + BLOCK_HEADER_SIZE as i64;
    if let Err(error) = file.set_length(new_size_bytes as u64) {
        error!(%error, "Failed to grow block file.");
        // Most likely the header is wrong and we are actually trying to
        // truncate the file.
        if !fix_block_file_header(file) {
            // Raise the guard so the next start replaces the file.
            header_of_mut(file).updating = 100;
            return Err(CacheError::CacheFull);
        }
        if header_of(file).max_entries >= new_size {
            return Ok(());
        }
        return Err(CacheError::CacheFull);
    }

    let header = header_of_mut(file);
    with_file_lock(header, |header| {
        header.empty[3] += (new_size - header.max_entries) / 4;
        header.max_entries = new_size;
    });
    let _ = file.flush();
    Ok(())
}

/// Repairs a header after a crash: recovers an interrupted grow from the
/// observed file size and rebuilds the derived counters.
fn fix_block_file_header(file: &mut MappedFile) -> bool {
    let Ok(file_len) = file.get_length() else {
        return false;
    };
    if (file_len as usize) < BLOCK_HEADER_SIZE {
        return false;
    }

    let header = header_of_mut(file);
    if header.entry_size < 36 || header.entry_size > 4096 || header.num_entries < 0 {
        return false;
    }

    // Make sure a crash in here is also detected.
    header.updating = 1;
    let expected = header.entry_size as i64 * header.max_entries as i64 + BLOCK_HEADER_SIZE as i64;
    if file_len as i64 != expected {
        let max_expected =
            header.entry_size as i64 * MAX_BLOCKS as i64 + BLOCK_HEADER_SIZE as i64;
        if (file_len as i64) < expected || header.empty[3] != 0 || file_len as i64 > max_expected {
            error!("Unexpected block file size.");
            return false;
        }
        // We were in the middle of growing the file.
        let num_entries = ((file_len as i64 - BLOCK_HEADER_SIZE as i64)
            / header.entry_size as i64) as i32;
        header.max_entries = num_entries;
    }

    fix_allocation_counters(header);
    let empty = empty_blocks(header);
    if empty + header.num_entries > header.max_entries {
        header.num_entries = header.max_entries - empty;
    }

    if !validate_counters(header) {
        return false;
    }

    header.updating = 0;
    let _ = file.flush();
    true
}

fn block_type_index(block_type: FileType) -> i32 {
    match block_type {
        FileType::Rankings => 0,
        FileType::Block256 => 1,
        FileType::Block1K => 2,
        FileType::Block4K => 3,
        FileType::External => unreachable!("external files are not block files"),
    }
}

fn class_for_index(index: i32) -> FileType {
    match index {
        0 => FileType::Rankings,
        1 => FileType::Block256,
        2 => FileType::Block1K,
        _ => FileType::Block4K,
    }
}

/// The class whose chain a file belongs to, from its stored entry size.
/// Rankings files are not produced by `required_file_type`, so the 36-byte
/// size is matched explicitly.
fn class_for_entry_size(entry_size: i32) -> FileType {
    if entry_size == FileType::Rankings.block_size() {
        return FileType::Rankings;
    }
    Addr::required_file_type(entry_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    fn fresh_header(max_entries: i32) -> BlockFileHeader {
        let mut header = BlockFileHeader::zeroed();
        header.magic = BLOCK_MAGIC;
        header.version = BLOCK_VERSION;
        header.entry_size = 256;
        header.max_entries = max_entries;
        header.empty[3] = max_entries / 4;
        header
    }

    fn popcount(header: &BlockFileHeader) -> i32 {
        header
            .allocation_map
            .iter()
            .map(|word| word.count_ones() as i32)
            .sum()
    }

    #[test]
    fn allocate_and_free_single_blocks() {
        let mut header = fresh_header(1024);
        let a = create_map_block(&mut header, 1).unwrap();
        let b = create_map_block(&mut header, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(header.num_entries, 2);
        assert_eq!(popcount(&header), 2);

        delete_map_block(&mut header, a, 1);
        assert_eq!(header.num_entries, 1);
        assert_eq!(popcount(&header), 1);
        assert!(validate_counters(&header));
    }

    #[test]
    fn allocations_never_cross_nibbles() {
        let mut header = fresh_header(1024);
        for _ in 0..32 {
            for size in 1..=4 {
                let index = create_map_block(&mut header, size).unwrap();
                assert_eq!(index / 4, (index + size - 1) / 4);
                assert!(used_map_block(&header, index, size));
            }
        }
        assert!(validate_counters(&header));
    }

    #[test]
    fn free_then_realloc_keeps_counts_consistent() {
        let mut header = fresh_header(1024);
        let mut allocations = Vec::new();
        for size in [1, 2, 3, 4, 2, 1, 4, 3] {
            allocations.push((create_map_block(&mut header, size).unwrap(), size));
        }
        for (index, size) in allocations.drain(..) {
            delete_map_block(&mut header, index, size);
        }
        assert_eq!(header.num_entries, 0);
        assert_eq!(popcount(&header), 0);
        assert_eq!(empty_blocks(&header), 1024);
    }

    #[test]
    fn counters_rebuilt_from_bitmap() {
        let mut header = fresh_header(1024);
        for _ in 0..10 {
            create_map_block(&mut header, 3).unwrap();
        }
        // Scramble the derived vectors and repair.
        header.empty = [7, 7, 7, 7];
        header.hints = [3, 3, 3, 3];
        fix_allocation_counters(&mut header);
        assert!(validate_counters(&header));
        assert_eq!(empty_blocks(&header) + header.num_entries * 3, 1024);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let mut header = fresh_header(8);
        for _ in 0..2 {
            create_map_block(&mut header, 4).unwrap();
        }
        assert!(create_map_block(&mut header, 1).is_none());
        assert!(need_to_grow(&header, 1));
    }
}
