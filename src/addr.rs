//! Tagged 32-bit cache addresses.
//!
//! Every piece of stored data — entry records, rankings nodes, user streams,
//! long keys — is located by a `CacheAddr`: either a slot run inside one of
//! the fixed-size block files, or a dedicated external file for anything too
//! big to live in a block. The packing is:
//!
//!   bit  31     initialized
//!   bit  30     separate (external) file
//!   bits 28..29 block size class (36 B, 256 B, 1 KiB, 4 KiB)
//!   bits 24..25 number of contiguous blocks, minus one
//!   bits 16..23 block file number
//!   bits  0..15 starting block within the file
//!
//! For separate files the low 24 bits carry the external file number instead
//! (the `f_<hex>` name on disk), and the class/count fields are meaningless.

pub type CacheAddr = u32;

const INITIALIZED_MASK: u32 = 0x8000_0000;
const SEPARATE_FILE_MASK: u32 = 0x4000_0000;
const FILE_TYPE_MASK: u32 = 0x3000_0000;
const FILE_TYPE_OFFSET: u32 = 28;
const NUM_BLOCKS_MASK: u32 = 0x0300_0000;
const NUM_BLOCKS_OFFSET: u32 = 24;
const FILE_SELECTOR_MASK: u32 = 0x00ff_0000;
const FILE_SELECTOR_OFFSET: u32 = 16;
const START_BLOCK_MASK: u32 = 0x0000_ffff;
const EXTERNAL_FILE_MASK: u32 = 0x00ff_ffff;
const RESERVED_BITS_MASK: u32 = !(INITIALIZED_MASK
    | SEPARATE_FILE_MASK
    | FILE_TYPE_MASK
    | NUM_BLOCKS_MASK
    | FILE_SELECTOR_MASK
    | START_BLOCK_MASK);

/// Largest record that fits in a block file: 4 contiguous 4 KiB blocks.
pub const MAX_BLOCK_SIZE: i32 = 4096 * 4;

/// Maximum number of contiguous blocks a single address can describe.
pub const MAX_NUM_BLOCKS: i32 = 4;

/// The storage class of an address: one of the four block sizes, or a
/// dedicated external file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    External,
    Rankings,
    Block256,
    Block1K,
    Block4K,
}

impl FileType {
    /// Size, in bytes, of one block of this class.
    pub fn block_size(self) -> i32 {
        match self {
            FileType::Rankings => 36,
            FileType::Block256 => 256,
            FileType::Block1K => 1024,
            FileType::Block4K => 4096,
            FileType::External => 0,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            FileType::External => 0,
            FileType::Rankings => 0,
            FileType::Block256 => 1,
            FileType::Block1K => 2,
            FileType::Block4K => 3,
        }
    }

    fn from_bits(bits: u32) -> FileType {
        match bits & 3 {
            0 => FileType::Rankings,
            1 => FileType::Block256,
            2 => FileType::Block1K,
            _ => FileType::Block4K,
        }
    }
}

/// A validated view over a raw `CacheAddr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Addr(CacheAddr);

impl Addr {
    /// Builds a block-file address from its components.
    pub fn new(file_type: FileType, num_blocks: i32, file_number: i32, start_block: i32) -> Addr {
        debug_assert!(file_type != FileType::External);
        debug_assert!((1..=MAX_NUM_BLOCKS).contains(&num_blocks));
        Addr(INITIALIZED_MASK
            | (file_type.to_bits() << FILE_TYPE_OFFSET)
            | (((num_blocks - 1) as u32) << NUM_BLOCKS_OFFSET)
            | ((file_number as u32) << FILE_SELECTOR_OFFSET)
            | (start_block as u32 & START_BLOCK_MASK))
    }

    /// Builds an address referencing a separate per-entry file.
    pub fn new_external(file_number: u32) -> Option<Addr> {
        if file_number == 0 || file_number > EXTERNAL_FILE_MASK {
            return None;
        }
        Some(Addr(INITIALIZED_MASK | SEPARATE_FILE_MASK | file_number))
    }

    pub fn from_value(value: CacheAddr) -> Addr {
        Addr(value)
    }

    pub fn value(self) -> CacheAddr {
        self.0
    }

    pub fn is_initialized(self) -> bool {
        self.0 & INITIALIZED_MASK != 0
    }

    pub fn is_separate_file(self) -> bool {
        self.0 & SEPARATE_FILE_MASK != 0
    }

    pub fn is_block_file(self) -> bool {
        self.is_initialized() && !self.is_separate_file()
    }

    pub fn file_type(self) -> FileType {
        if self.is_separate_file() {
            FileType::External
        } else {
            FileType::from_bits((self.0 & FILE_TYPE_MASK) >> FILE_TYPE_OFFSET)
        }
    }

    /// Number of contiguous blocks referenced, 1 through 4.
    pub fn num_blocks(self) -> i32 {
        debug_assert!(self.is_block_file());
        (((self.0 & NUM_BLOCKS_MASK) >> NUM_BLOCKS_OFFSET) + 1) as i32
    }

    /// Block file number for block addresses, external file number otherwise.
    pub fn file_number(self) -> u32 {
        if self.is_separate_file() {
            self.0 & EXTERNAL_FILE_MASK
        } else {
            (self.0 & FILE_SELECTOR_MASK) >> FILE_SELECTOR_OFFSET
        }
    }

    pub fn start_block(self) -> i32 {
        debug_assert!(self.is_block_file());
        (self.0 & START_BLOCK_MASK) as i32
    }

    pub fn block_size(self) -> i32 {
        self.file_type().block_size()
    }

    /// Byte offset of this address's first block within its file, past the
    /// block-file header.
    pub fn offset_in_file(self) -> u64 {
        debug_assert!(self.is_block_file());
        crate::format::BLOCK_HEADER_SIZE as u64
            + self.start_block() as u64 * self.block_size() as u64
    }

    /// Smallest general-purpose block class able to hold a record of `size`
    /// bytes (possibly spanning several blocks), or `External` when nothing
    /// fits. Rankings blocks are never produced here; that class is reserved
    /// for explicitly-typed node allocations.
    pub fn required_file_type(size: i32) -> FileType {
        if size < 1024 {
            FileType::Block256
        } else if size < 4096 {
            FileType::Block1K
        } else if size <= MAX_BLOCK_SIZE {
            FileType::Block4K
        } else {
            FileType::External
        }
    }

    /// Number of blocks of `file_type` needed to hold `size` bytes.
    pub fn required_blocks(size: i32, file_type: FileType) -> i32 {
        let block_size = file_type.block_size();
        debug_assert!(block_size > 0);
        (size + block_size - 1) / block_size
    }

    /// Rejects addresses that the allocator could never have produced.
    pub fn sanity_check(self) -> bool {
        if !self.is_initialized() {
            return self.0 == 0;
        }
        if self.is_separate_file() {
            // External numbering starts at 1; 0 is the uninitialized sentinel
            // of the name space.
            return self.file_number() != 0 && self.0 & FILE_TYPE_MASK == 0;
        }
        self.0 & RESERVED_BITS_MASK == 0
    }

    /// Sanity check for addresses expected to hold an entry record.
    pub fn sanity_check_for_entry(self) -> bool {
        self.sanity_check() && self.is_block_file() && self.file_type() == FileType::Block256
    }

    /// Sanity check for addresses expected to hold a rankings node.
    pub fn sanity_check_for_rankings(self) -> bool {
        if !self.is_initialized() {
            return self.0 == 0;
        }
        self.sanity_check()
            && self.is_block_file()
            && self.file_type() == FileType::Rankings
            && self.num_blocks() == 1
    }
}

impl std::fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn uninitialized_is_zero() {
        let addr = Addr::default();
        assert!(!addr.is_initialized());
        assert_eq!(addr.value(), 0);
        assert!(addr.sanity_check());
    }

    #[test]
    fn block_round_trip() {
        let addr = Addr::new(FileType::Block1K, 3, 5, 0x1234);
        assert!(addr.is_initialized());
        assert!(addr.is_block_file());
        assert_eq!(addr.file_type(), FileType::Block1K);
        assert_eq!(addr.num_blocks(), 3);
        assert_eq!(addr.file_number(), 5);
        assert_eq!(addr.start_block(), 0x1234);
        assert_eq!(addr.block_size(), 1024);
        assert!(addr.sanity_check());
    }

    #[test]
    fn external_round_trip() {
        let addr = Addr::new_external(0xabcdef).unwrap();
        assert!(addr.is_separate_file());
        assert_eq!(addr.file_type(), FileType::External);
        assert_eq!(addr.file_number(), 0xabcdef);
        assert!(addr.sanity_check());
        assert!(Addr::new_external(0).is_none());
        assert!(Addr::new_external(0x0100_0000).is_none());
    }

    #[test]
    fn required_type_boundaries() {
        assert_eq!(Addr::required_file_type(1), FileType::Block256);
        assert_eq!(Addr::required_file_type(1023), FileType::Block256);
        assert_eq!(Addr::required_file_type(1024), FileType::Block1K);
        assert_eq!(Addr::required_file_type(4095), FileType::Block1K);
        assert_eq!(Addr::required_file_type(4096), FileType::Block4K);
        assert_eq!(Addr::required_file_type(MAX_BLOCK_SIZE), FileType::Block4K);
        assert_eq!(
            Addr::required_file_type(MAX_BLOCK_SIZE + 1),
            FileType::External
        );
    }

    #[test]
    fn sanity_rejects_garbage() {
        // Initialized, block file, but with bits set in the reserved range.
        let addr = Addr::from_value(0x8c00_0000);
        assert!(!addr.sanity_check());
        // Separate file with a zero file number.
        let addr = Addr::from_value(0xc000_0000);
        assert!(!addr.sanity_check());
    }

    proptest! {
        #[test]
        fn pack_unpack(
            class in 0u32..4,
            num_blocks in 1i32..=4,
            file_number in 0i32..256,
            start_block in 0i32..0x10000,
        ) {
            let file_type = match class {
                0 => FileType::Rankings,
                1 => FileType::Block256,
                2 => FileType::Block1K,
                _ => FileType::Block4K,
            };
            let addr = Addr::new(file_type, num_blocks, file_number, start_block);
            prop_assert!(addr.sanity_check());
            prop_assert_eq!(addr.file_type(), file_type);
            prop_assert_eq!(addr.num_blocks(), num_blocks);
            prop_assert_eq!(addr.file_number() as i32, file_number);
            prop_assert_eq!(addr.start_block(), start_block);
        }

        #[test]
        fn required_blocks_fit(size in 1i32..=MAX_BLOCK_SIZE) {
            let file_type = Addr::required_file_type(size);
            prop_assert!(file_type != FileType::External);
            let blocks = Addr::required_blocks(size, file_type);
            prop_assert!((1..=MAX_NUM_BLOCKS).contains(&blocks));
            prop_assert!(blocks * file_type.block_size() >= size);
        }
    }
}
