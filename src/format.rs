//! On-disk structures of the cache.
//!
//! The cache is stored as one index file, a family of block files, and a
//! collection of per-entry external files. The index file holds a header and
//! a flat hash table of cache addresses; block files hold fixed-size records
//! (entries, rankings nodes, small user data); anything larger than
//! [`MAX_BLOCK_SIZE`](crate::addr::MAX_BLOCK_SIZE) goes to an external file.
//!
//! Every struct here is `#[repr(C)]` and plain-old-data: headers are mutated
//! in place through a memory map and records travel as raw bytes, so the
//! in-memory representation *is* the serialized representation.
//!
//! # Warning
//!
//! Do not add, remove, reorder, or retype fields in these structs. Doing so
//! changes the on-disk format and will break every existing cache directory.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};

use crate::addr::CacheAddr;

pub const INDEX_MAGIC: u32 = 0xC103_CAC3;
pub const VERSION2_0: u32 = 0x2_0000;
pub const VERSION2_1: u32 = 0x2_0001;
pub const VERSION3_0: u32 = 0x3_0000;
pub const CURRENT_VERSION: u32 = VERSION3_0;

pub const BLOCK_MAGIC: u32 = 0xC104_CAC3;
pub const BLOCK_VERSION: u32 = 0x2_0000;

/// Fixed size of a block-file header; records start at this offset.
pub const BLOCK_HEADER_SIZE: usize = 8192;
/// Words in the allocation bitmap (the header remainder past the fixed part).
pub const ALLOC_MAP_WORDS: usize = (BLOCK_HEADER_SIZE - 76) / 4;
/// Hard cap on blocks per file: one bitmap bit per block.
pub const MAX_BLOCKS: i32 = (ALLOC_MAP_WORDS * 32) as i32;

/// Smallest permitted hash table length; actual lengths are power-of-two
/// multiples of this, up to 16x.
pub const BASE_TABLE_LEN: i32 = 0x1_0000;

/// Number of user data streams per entry.
pub const NUM_STREAMS: usize = 3;

/// The per-class block files at fixed positions `data_0..data_3`; chain
/// extensions are created past this index.
pub const FIRST_ADDITIONAL_BLOCK_FILE: i32 = 4;
pub const MAX_BLOCK_FILE: i32 = 255;

/// Longest key stored inline in an entry record (spanning 4 slots).
pub const MAX_INTERNAL_KEY_LENGTH: usize = 4 * ENTRY_STORE_SIZE - ENTRY_KEY_OFFSET - 1;

pub const ENTRY_STORE_SIZE: usize = 256;
const ENTRY_KEY_OFFSET: usize = 96;
const ENTRY_INLINE_KEY_AREA: usize = ENTRY_STORE_SIZE - ENTRY_KEY_OFFSET;

/// The 32-bit persistent hash: used for hash-table buckets and for record
/// self-hashes. Must never change, it is part of the on-disk format.
pub fn persistent_hash(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Microseconds since the Unix epoch; the zero value means "never".
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

pub fn time_from_micros(micros: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(micros)
}

pub fn micros_from_time(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

/// Eviction control data embedded in the index header: the five list ends,
/// their sizes, and the in-flight transaction record that makes list
/// mutations recoverable after a crash.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct LruData {
    /// Set once the cache has had to evict for the first time.
    pub filled: i32,
    pub sizes: [i32; 5],
    pub heads: [CacheAddr; 5],
    pub tails: [CacheAddr; 5],
    /// In-flight operation target address, or 0.
    pub transaction: CacheAddr,
    /// The in-flight operation ([`LIST_OP_INSERT`] / [`LIST_OP_REMOVE`]).
    pub operation: i32,
    /// List affected by the in-flight operation.
    pub operation_list: i32,
    pub pad: [i32; 7],
}

pub const LIST_OP_INSERT: i32 = 1;
pub const LIST_OP_REMOVE: i32 = 2;

/// Header of the index file. Followed by `table_len` cache addresses forming
/// the hash-table buckets.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct IndexHeader {
    pub magic: u32,
    pub version: u32,
    /// Number of entries currently stored.
    pub num_entries: i32,
    /// Total stored bytes in versions 2.x; superseded by `num_bytes`.
    pub old_v2_num_bytes: i32,
    /// Last external file number issued.
    pub last_file: i32,
    /// Id stamped on entries touched by the current run (dirty marker).
    pub this_id: i32,
    /// Address of the statistics record.
    pub stats: CacheAddr,
    /// Hash table length; power-of-two multiple of [`BASE_TABLE_LEN`].
    pub table_len: i32,
    /// Non-zero when the previous run did not shut down cleanly.
    pub crash: i32,
    /// Id of an ongoing experiment, if any.
    pub experiment: i32,
    pub create_time: u64,
    /// Total stored bytes, version 3.
    pub num_bytes: i64,
    pub pad: [i32; 50],
    pub lru: LruData,
}

pub const INDEX_HEADER_SIZE: usize = std::mem::size_of::<IndexHeader>();

impl IndexHeader {
    pub fn new(table_len: i32) -> IndexHeader {
        let mut header = IndexHeader::zeroed();
        header.magic = INDEX_MAGIC;
        header.version = CURRENT_VERSION;
        header.table_len = table_len;
        header.create_time = now_micros();
        header
    }
}

/// Header of a block file: allocation state for `max_entries` fixed-size
/// slots, tracked with a bitmap plus per-run-length free counts and search
/// hints. The header occupies [`BLOCK_HEADER_SIZE`] bytes; records follow.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct BlockFileHeader {
    pub magic: u32,
    pub version: u32,
    pub this_file: i16,
    /// Next file in this size-class chain, or 0.
    pub next_file: i16,
    pub entry_size: i32,
    pub num_entries: i32,
    pub max_entries: i32,
    /// `empty[n]` counts the nibble-aligned free runs able to hold n+1
    /// contiguous blocks.
    pub empty: [i32; 4],
    /// Bitmap word offsets where the last allocation of each run length
    /// succeeded; searches resume there.
    pub hints: [i32; 4],
    /// Set while the header is being updated; survives as a crash marker.
    pub updating: i32,
    pub user: [i32; 4],
    pub allocation_map: [u32; ALLOC_MAP_WORDS],
}

impl BlockFileHeader {
    pub fn new(this_file: i16, entry_size: i32) -> BlockFileHeader {
        let mut header = BlockFileHeader::zeroed();
        header.magic = BLOCK_MAGIC;
        header.version = BLOCK_VERSION;
        header.this_file = this_file;
        header.entry_size = entry_size;
        header
    }
}

/// Possible states of an entry record.
pub const ENTRY_NORMAL: i32 = 0;
pub const ENTRY_EVICTED: i32 = 1;
pub const ENTRY_DOOMED: i32 = 2;

/// Entry flags.
pub const PARENT_ENTRY: u32 = 1;
pub const CHILD_ENTRY: u32 = 1 << 1;

/// Main record of a cache entry. Occupies one 256-byte slot, extended over
/// up to 4 consecutive slots when the key spills past the inline area; keys
/// longer than [`MAX_INTERNAL_KEY_LENGTH`] are stored out of line and
/// referenced by `long_key`.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct EntryStore {
    /// Full hash of the key.
    pub hash: u32,
    /// Next entry in the same hash bucket.
    pub next: CacheAddr,
    pub rankings_node: CacheAddr,
    pub reuse_count: i32,
    pub refetch_count: i32,
    pub state: i32,
    pub creation_time: u64,
    pub key_len: i32,
    pub long_key: CacheAddr,
    pub data_size: [i32; 4],
    pub data_addr: [CacheAddr; 4],
    pub flags: u32,
    pub pad: [i32; 4],
    /// Hash of the record up to this field.
    pub self_hash: u32,
    /// Inline key storage, NUL terminated.
    pub key: [u8; ENTRY_INLINE_KEY_AREA],
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("hash", &self.hash)
            .field("next", &self.next)
            .field("rankings_node", &self.rankings_node)
            .field("state", &self.state)
            .field("key_len", &self.key_len)
            .field("data_size", &self.data_size)
            .field("data_addr", &self.data_addr)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl EntryStore {
    /// Number of 256-byte slots needed for an entry with a key of
    /// `key_len` bytes.
    pub fn num_blocks_for_key(key_len: usize) -> i32 {
        if key_len < ENTRY_INLINE_KEY_AREA || key_len > MAX_INTERNAL_KEY_LENGTH {
            return 1;
        }
        ((key_len - ENTRY_INLINE_KEY_AREA) / ENTRY_STORE_SIZE + 2) as i32
    }
}

/// Rankings node: the frequently-updated part of an entry, threaded into one
/// of the LRU lists.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed(4))]
pub struct RankingsNode {
    pub last_used: u64,
    pub last_modified: u64,
    /// Next node in the list, toward the tail.
    pub next: CacheAddr,
    /// Previous node in the list, toward the head.
    pub prev: CacheAddr,
    /// Address of the owning entry record, or 0 when the rankings node has
    /// been left behind by a destroyed entry.
    pub contents: CacheAddr,
    /// Id of the run that last modified the entry; a stale id marks the
    /// entry as not properly closed.
    pub dirty: i32,
    pub self_hash: u32,
}

pub const RANKINGS_NODE_SIZE: usize = std::mem::size_of::<RankingsNode>();

impl std::fmt::Debug for RankingsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Copy out of the packed struct before formatting.
        let (last_used, last_modified) = (self.last_used, self.last_modified);
        f.debug_struct("RankingsNode")
            .field("last_used", &last_used)
            .field("last_modified", &last_modified)
            .field("next", &self.next)
            .field("prev", &self.prev)
            .field("contents", &self.contents)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

/// Header of the sparse metadata stored in stream 2 of parents and children.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SparseHeader {
    /// Shared random signature binding children to their parent.
    pub signature: u64,
    pub magic: u32,
    pub parent_key_len: i32,
    /// Index of the trailing partially-written 1 KiB block of a child, or -1.
    pub last_block: i32,
    pub last_block_len: i32,
}

/// Per-child sparse metadata: the header plus a bitmap of which 1 KiB
/// sub-blocks of the child's 1 MiB slice hold data.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SparseData {
    pub header: SparseHeader,
    pub child_id: i32,
    pub pad: i32,
    pub bitmap: [u32; 32],
}

/// Records that carry a trailing self-hash over their fixed prefix.
pub trait SelfHashed: Pod {
    /// Bytes covered by the self-hash: the record prefix up to, but not
    /// including, the hash field itself.
    const HASH_COVERAGE: usize;

    fn stored_hash(&self) -> u32;
    fn set_stored_hash(&mut self, hash: u32);

    fn compute_hash(&self) -> u32 {
        persistent_hash(&bytemuck::bytes_of(self)[..Self::HASH_COVERAGE])
    }

    /// A zero stored hash means the record was never hashed and is accepted.
    fn verify_hash(&self) -> bool {
        let stored = self.stored_hash();
        stored == 0 || stored == self.compute_hash()
    }
}

impl SelfHashed for EntryStore {
    const HASH_COVERAGE: usize = 92;

    fn stored_hash(&self) -> u32 {
        self.self_hash
    }

    fn set_stored_hash(&mut self, hash: u32) {
        self.self_hash = hash;
    }
}

impl SelfHashed for RankingsNode {
    const HASH_COVERAGE: usize = 32;

    fn stored_hash(&self) -> u32 {
        self.self_hash
    }

    fn set_stored_hash(&mut self, hash: u32) {
        self.self_hash = hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_frozen() {
        assert_eq!(std::mem::size_of::<EntryStore>(), 256);
        assert_eq!(std::mem::size_of::<RankingsNode>(), 36);
        assert_eq!(std::mem::size_of::<LruData>(), 104);
        assert_eq!(std::mem::size_of::<IndexHeader>(), 360);
        assert_eq!(std::mem::size_of::<BlockFileHeader>(), BLOCK_HEADER_SIZE);
        assert_eq!(std::mem::size_of::<SparseHeader>(), 24);
        assert_eq!(std::mem::size_of::<SparseData>(), 160);
        assert_eq!(MAX_INTERNAL_KEY_LENGTH, 927);
    }

    #[test]
    fn self_hash_round_trip() {
        let mut node = RankingsNode::zeroed();
        node.last_used = 12345;
        node.contents = 0x8000_0001;
        assert!(node.verify_hash());
        let hash = node.compute_hash();
        node.set_stored_hash(hash);
        assert!(node.verify_hash());
        node.contents = 0x8000_0002;
        assert!(!node.verify_hash());
    }

    #[test]
    fn entry_slots_for_key_length() {
        assert_eq!(EntryStore::num_blocks_for_key(1), 1);
        assert_eq!(EntryStore::num_blocks_for_key(159), 1);
        assert_eq!(EntryStore::num_blocks_for_key(160), 2);
        assert_eq!(EntryStore::num_blocks_for_key(415), 2);
        assert_eq!(EntryStore::num_blocks_for_key(416), 3);
        assert_eq!(EntryStore::num_blocks_for_key(927), 4);
        assert_eq!(EntryStore::num_blocks_for_key(928), 1);
    }
}
