//! Usage statistics, persisted in a block-file record referenced by the
//! index header.

use bytemuck::{Pod, Zeroable};

use crate::format::persistent_hash;

const STATS_MAGIC: u32 = 0xC107_CAC3;

/// Number of buckets of the storage-size histogram: one per power of two
/// between 1 KiB and the 32-bit limit.
const SIZE_BUCKETS: usize = 28;

/// Counted events.
#[derive(Clone, Copy, Debug)]
pub enum Counter {
    OpenMiss = 0,
    OpenHit,
    CreateMiss,
    CreateHit,
    ResurrectHit,
    CreateError,
    TrimEntry,
    DoomEntry,
    DoomCache,
    InvalidEntry,
    OpenEntries,
    MaxEntries,
    TimerCycles,
    ReadData,
    WriteData,
    FatalError,
    DoomRecent,
}

const MAX_COUNTER: usize = Counter::DoomRecent as usize + 1;

/// On-disk layout of the statistics record.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct OnDiskStats {
    magic: u32,
    size: i32,
    data_sizes: [i32; SIZE_BUCKETS],
    counters: [i64; MAX_COUNTER],
}

pub(crate) const STATS_STORAGE_SIZE: usize = std::mem::size_of::<OnDiskStats>();

/// In-memory statistics: event counters plus a histogram of entry sizes.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    data_sizes: [i32; SIZE_BUCKETS],
    counters: [i64; MAX_COUNTER],
}

/// Index of the histogram bucket for a stored size.
fn storage_bucket(size: i32) -> usize {
    if size < 1024 {
        return 0;
    }
    let significant = 31 - size.leading_zeros() as usize;
    (significant - 9).min(SIZE_BUCKETS - 1)
}

impl Stats {
    /// Restores counters from a serialized record; an empty or mismatched
    /// record starts the counters over.
    pub fn init(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() < STATS_STORAGE_SIZE {
            return bytes.is_empty();
        }
        let stored: OnDiskStats = bytemuck::pod_read_unaligned(&bytes[..STATS_STORAGE_SIZE]);
        if stored.magic != STATS_MAGIC || stored.size != STATS_STORAGE_SIZE as i32 {
            warn!("Discarding unrecognized statistics record.");
            return false;
        }
        self.data_sizes = stored.data_sizes;
        self.counters = stored.counters;
        true
    }

    pub fn serialize(&self) -> Vec<u8> {
        let stored = OnDiskStats {
            magic: STATS_MAGIC,
            size: STATS_STORAGE_SIZE as i32,
            data_sizes: self.data_sizes,
            counters: self.counters,
        };
        bytemuck::bytes_of(&stored).to_vec()
    }

    pub fn on_event(&mut self, counter: Counter) {
        self.counters[counter as usize] += 1;
    }

    pub fn set_counter(&mut self, counter: Counter, value: i64) {
        self.counters[counter as usize] = value;
    }

    pub fn get_counter(&self, counter: Counter) -> i64 {
        self.counters[counter as usize]
    }

    pub fn on_read(&mut self, _len: i32) {
        self.on_event(Counter::ReadData);
    }

    pub fn on_write(&mut self, _len: i32) {
        self.on_event(Counter::WriteData);
    }

    pub fn on_too_much_storage_requested(&mut self, size: i64) {
        self.modify_storage_stats(0, size.min(i32::MAX as i64) as i32);
    }

    /// Moves a stored size between histogram buckets as it changes.
    pub fn modify_storage_stats(&mut self, old_size: i32, new_size: i32) {
        if old_size == new_size {
            return;
        }
        if old_size > 0 {
            self.data_sizes[storage_bucket(old_size)] -= 1;
        }
        if new_size > 0 {
            self.data_sizes[storage_bucket(new_size)] += 1;
        }
    }

    /// A best-effort content fingerprint used to decide whether counters
    /// changed since the last store.
    pub fn fingerprint(&self) -> u32 {
        persistent_hash(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(storage_bucket(0), 0);
        assert_eq!(storage_bucket(1023), 0);
        assert_eq!(storage_bucket(1024), 1);
        assert_eq!(storage_bucket(2047), 1);
        assert_eq!(storage_bucket(2048), 2);
        assert_eq!(storage_bucket(i32::MAX), 21);
    }

    #[test]
    fn serialize_round_trip() {
        let mut stats = Stats::default();
        stats.on_event(Counter::OpenHit);
        stats.on_event(Counter::OpenHit);
        stats.modify_storage_stats(0, 4096);

        let bytes = stats.serialize();
        let mut restored = Stats::default();
        assert!(restored.init(&bytes));
        assert_eq!(restored.get_counter(Counter::OpenHit), 2);
        assert_eq!(restored.fingerprint(), stats.fingerprint());
    }
}
