//! Typed handles over fixed-size records stored in block files.

use std::io;

use bytemuck::Zeroable;

use crate::{
    addr::Addr,
    format::SelfHashed,
    io::BackingFile,
};

/// A record of type `T` bound to a cache address.
///
/// The buffer spans `num_blocks` slots so records that extend over
/// consecutive blocks (long-keyed entries) stay contiguous. Loading verifies
/// the trailing self-hash; storing recomputes it. Stores are explicit: every
/// mutation path ends in a [`store`](StorageBlock::store) call, and dropping
/// a block that was modified but never stored is a bug.
#[derive(Debug)]
pub struct StorageBlock<T: SelfHashed> {
    address: Addr,
    data: Vec<T>,
    modified: bool,
}

impl<T: SelfHashed> StorageBlock<T> {
    pub fn new(address: Addr) -> StorageBlock<T> {
        debug_assert!(address.is_block_file());
        debug_assert_eq!(std::mem::size_of::<T>(), address.block_size() as usize);
        StorageBlock {
            address,
            data: vec![T::zeroed(); address.num_blocks() as usize],
            modified: false,
        }
    }

    pub fn address(&self) -> Addr {
        self.address
    }

    pub fn data(&self) -> &T {
        &self.data[0]
    }

    pub fn data_mut(&mut self) -> &mut T {
        self.modified = true;
        &mut self.data[0]
    }

    /// The record's raw bytes, across all of its blocks.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        bytemuck::cast_slice_mut(&mut self.data)
    }

    pub fn clear_modified(&mut self) {
        self.modified = false;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Whether the record's stored self-hash matches its contents.
    pub fn verify_hash(&self) -> bool {
        self.data[0].verify_hash()
    }

    /// Reads the record from its backing file. The self-hash is not
    /// enforced here; callers decide whether a mismatch is fatal.
    pub fn load(&mut self, file: &dyn BackingFile) -> io::Result<()> {
        let offset = self.address.offset_in_file();
        file.read(bytemuck::cast_slice_mut(&mut self.data), offset)?;
        self.modified = false;
        Ok(())
    }

    /// Writes the record back, refreshing its self-hash.
    pub fn store(&mut self, file: &dyn BackingFile) -> io::Result<()> {
        let hash = self.data[0].compute_hash();
        self.data[0].set_stored_hash(hash);
        let offset = self.address.offset_in_file();
        file.write(bytemuck::cast_slice(&self.data), offset)?;
        self.modified = false;
        Ok(())
    }
}

