//! Eviction: keeping the stored bytes under the configured budget.
//!
//! Two policies share the machinery. The classic policy is a plain LRU over
//! a single list (`NO_USE`): the oldest entries are doomed until the cache
//! is back under its low-water mark. The stratified policy spreads entries
//! over three lists by how often they are reused, prefers evicting the
//! least-reused list, keeps entries around for a time target that doubles
//! per list, and parks evicted entries on a `DELETED` list so a re-created
//! key remembers that it was already seen.
//!
//! Trimming yields after a bounded amount of work and re-posts itself, so a
//! big backlog never stalls the operation queue.

use std::time::Instant;

use crate::{
    backend::Core,
    entry::Entry,
    error::Result,
    format::{now_micros, ENTRY_DOOMED, ENTRY_EVICTED, ENTRY_NORMAL},
    rankings::{IterNode, List},
    stats::Counter,
};

/// Free space to reclaim past the limit when a trim starts.
const CLEAN_UP_MARGIN: i64 = 1024 * 1024;
/// Reuse count that promotes an entry to the HIGH_USE list.
const HIGH_USE: i32 = 10;
/// Hours an entry should survive on list 0; doubled for each further list.
const TARGET_TIME_HOURS: u64 = 24 * 7;
/// Deferred trims allowed before trimming anyway.
const MAX_DELAYED_TRIMS: i32 = 60;
/// Evictions (or milliseconds) after which a trim pass yields.
const TRIM_BATCH: i32 = 20;
const TRIM_BUDGET_MS: u128 = 20;

fn low_water_adjust(high_water: i64) -> i64 {
    if high_water < CLEAN_UP_MARGIN {
        0
    } else {
        high_water - CLEAN_UP_MARGIN
    }
}

fn falling_behind(current_size: i64, max_size: i64) -> bool {
    current_size > max_size - CLEAN_UP_MARGIN * 20
}

/// Mutable policy state of the eviction engine.
#[derive(Debug, Default)]
pub(crate) struct Eviction {
    pub(crate) max_size: i64,
    pub(crate) index_size: i32,
    pub(crate) new_eviction: bool,
    first_trim: bool,
    trimming: bool,
    delay_trim: bool,
    trim_delays: i32,
    pub(crate) test_mode: bool,
    init: bool,
}

impl Eviction {
    pub fn init(&mut self, max_size: i64, index_size: i32, new_eviction: bool) {
        self.max_size = low_water_adjust(max_size);
        self.index_size = index_size;
        self.new_eviction = new_eviction;
        self.first_trim = true;
        self.trimming = false;
        self.delay_trim = false;
        self.trim_delays = 0;
        self.test_mode = false;
        self.init = true;
    }

    pub fn stop(&mut self) {
        if !self.init {
            return;
        }
        // Pretend to be busy from this point on so nothing else starts.
        self.trimming = true;
    }
}

impl Core {
    /// Brings `num_bytes` back under the target, evicting from the lists.
    /// With `empty`, everything goes.
    pub(crate) fn trim_cache(&mut self, empty: bool) -> Result<()> {
        if self.disabled || self.eviction.trimming {
            return Ok(());
        }

        if !empty && !self.should_trim() {
            return self.post_delayed_trim();
        }

        if self.eviction.new_eviction {
            return self.trim_cache_v2(empty);
        }

        self.eviction.trimming = true;
        let start = Instant::now();
        let mut next = self.list_prev(None, List::NoUse)?;
        let mut deleted_entries = 0;
        let target_size = if empty { 0 } else { self.eviction.max_size };

        while (self.index_num_bytes() > target_size || self.eviction.test_mode)
            && next.is_some()
        {
            let current = next.take().expect("checked above");
            next = self.list_prev(Some(&current), List::NoUse)?;
            if current.data.dirty != self.this_id || empty {
                // Nobody is using this entry.
                if self.evict_entry(&current, empty, List::NoUse)? && !self.eviction.test_mode {
                    deleted_entries += 1;
                }
                if !empty && self.eviction.test_mode {
                    break;
                }
            }
            if !empty
                && (deleted_entries > TRIM_BATCH || start.elapsed().as_millis() > TRIM_BUDGET_MS)
            {
                self.post_internal_trim(false);
                break;
            }
        }

        debug!(deleted_entries, empty, "Trim pass finished.");
        self.eviction.trimming = false;
        Ok(())
    }

    fn trim_cache_v2(&mut self, empty: bool) -> Result<()> {
        self.eviction.trimming = true;
        let start = Instant::now();

        const LISTS_TO_SEARCH: usize = 3;
        let mut next: [Option<IterNode>; LISTS_TO_SEARCH] = [None, None, None];
        let mut list_index = LISTS_TO_SEARCH;

        // Get a node from each list, stopping at the first list whose tail
        // is past its age target.
        let mut done = false;
        for i in 0..LISTS_TO_SEARCH {
            if done {
                continue;
            }
            next[i] = self.list_prev(None, List::from_index(i))?;
            if !empty && node_is_old_enough(next[i].as_ref(), i as u32) {
                list_index = i;
                done = true;
            }
        }

        // Not meeting the time targets; move on to list length.
        if !empty && list_index == LISTS_TO_SEARCH {
            list_index = self.select_list_by_length(&next);
        }

        if empty {
            list_index = 0;
        }

        let mut deleted_entries = 0;
        let target_size = if empty { 0 } else { self.eviction.max_size };

        let mut current_list = list_index;
        while current_list < LISTS_TO_SEARCH {
            let list = List::from_index(current_list);
            while (self.index_num_bytes() > target_size || self.eviction.test_mode)
                && next[current_list].is_some()
            {
                let node = next[current_list].take().expect("checked above");
                next[current_list] = self.list_prev(Some(&node), list)?;
                if node.data.dirty != self.this_id || empty {
                    if self.evict_entry(&node, empty, list)? {
                        deleted_entries += 1;
                    }
                    if !empty && self.eviction.test_mode {
                        break;
                    }
                }
                if !empty
                    && (deleted_entries > TRIM_BATCH
                        || start.elapsed().as_millis() > TRIM_BUDGET_MS)
                {
                    self.post_internal_trim(false);
                    break;
                }
            }
            if !empty {
                break;
            }
            current_list += 1;
        }

        if empty {
            self.trim_deleted(true)?;
        } else if self.should_trim_deleted() {
            self.post_internal_trim_deleted(false);
        }

        debug!(deleted_entries, empty, "Trim pass finished.");
        self.eviction.trimming = false;
        Ok(())
    }

    /// Updates the rank of an entry after it was used, honoring the
    /// read-only and shader-cache exceptions.
    pub(crate) fn update_rank_policy(&mut self, entry: &mut Entry, modified: bool) -> Result<()> {
        if self.read_only || (!modified && self.no_rank_update_on_read) {
            return Ok(());
        }
        let list = self.list_for_entry(entry);
        let node_addr = entry.node_addr;
        let (mut ctx, rankings) = self.rank_parts();
        rankings.update_rank(&mut ctx, node_addr, modified, list)
    }

    /// Reuse-count promotion on open (stratified policy only).
    pub(crate) fn on_open_entry(&mut self, entry: &mut Entry) -> Result<()> {
        if !self.eviction.new_eviction {
            return Ok(());
        }

        debug_assert_eq!(entry.entry.data().state, ENTRY_NORMAL);
        if entry.entry.data().reuse_count >= i32::MAX {
            return Ok(());
        }

        entry.entry.data_mut().reuse_count += 1;
        let reuse = entry.entry.data().reuse_count;
        let node_addr = entry.node_addr;

        if reuse == 1 {
            let (mut ctx, rankings) = self.rank_parts();
            rankings.remove(&mut ctx, node_addr, List::NoUse, true)?;
            rankings.insert(&mut ctx, node_addr, false, List::LowUse)?;
            self.store_entry_record(entry)?;
        } else if reuse == HIGH_USE {
            let (mut ctx, rankings) = self.rank_parts();
            rankings.remove(&mut ctx, node_addr, List::LowUse, true)?;
            rankings.insert(&mut ctx, node_addr, false, List::HighUse)?;
            self.store_entry_record(entry)?;
        }
        Ok(())
    }

    /// Links a created (or resurrected) entry into the lists.
    pub(crate) fn on_create_entry(&mut self, entry: &mut Entry) -> Result<()> {
        if !self.eviction.new_eviction {
            let node_addr = entry.node_addr;
            let (mut ctx, rankings) = self.rank_parts();
            return rankings.insert(&mut ctx, node_addr, true, List::NoUse);
        }

        match entry.entry.data().state {
            ENTRY_NORMAL => {
                debug_assert_eq!(entry.entry.data().reuse_count, 0);
                debug_assert_eq!(entry.entry.data().refetch_count, 0);
            }
            ENTRY_EVICTED => {
                // A key we evicted is back: remember the refetch so heavily
                // refetched entries jump straight to HIGH_USE.
                let stored = entry.entry.data_mut();
                if stored.refetch_count < i32::MAX {
                    stored.refetch_count += 1;
                }
                if stored.refetch_count > HIGH_USE && stored.reuse_count < HIGH_USE {
                    stored.reuse_count = HIGH_USE;
                } else {
                    stored.reuse_count += 1;
                }
                stored.state = ENTRY_NORMAL;
                self.store_entry_record(entry)?;
                let node_addr = entry.node_addr;
                let (mut ctx, rankings) = self.rank_parts();
                rankings.remove(&mut ctx, node_addr, List::Deleted, true)?;
            }
            state => {
                warn!(state, "Unexpected entry state on create.");
            }
        }

        let list = self.list_for_entry(entry);
        let node_addr = entry.node_addr;
        let (mut ctx, rankings) = self.rank_parts();
        rankings.insert(&mut ctx, node_addr, true, list)
    }

    /// Unlinks a doomed entry; the stratified policy parks it on DELETED.
    pub(crate) fn on_doom_entry(&mut self, entry: &mut Entry) -> Result<()> {
        let node = crate::rankings::load_node(&mut self.block_files, entry.node_addr)?;
        if !self.eviction.new_eviction {
            if entry.leave_rankings_behind(node.data()) {
                return Ok(());
            }
            let list = self.list_for_entry(entry);
            let node_addr = entry.node_addr;
            let (mut ctx, rankings) = self.rank_parts();
            return rankings.remove(&mut ctx, node_addr, list, true);
        }

        if entry.entry.data().state != ENTRY_NORMAL {
            return Ok(());
        }

        if entry.leave_rankings_behind(node.data()) {
            entry.entry.data_mut().state = ENTRY_DOOMED;
            return self.store_entry_record(entry);
        }

        let list = self.list_for_entry(entry);
        let node_addr = entry.node_addr;
        {
            let (mut ctx, rankings) = self.rank_parts();
            rankings.remove(&mut ctx, node_addr, list, true)?;
        }

        entry.entry.data_mut().state = ENTRY_DOOMED;
        self.store_entry_record(entry)?;
        let (mut ctx, rankings) = self.rank_parts();
        rankings.insert(&mut ctx, node_addr, true, List::Deleted)
    }

    /// Final removal of a destroyed entry from the DELETED list.
    pub(crate) fn on_destroy_entry(&mut self, entry: &mut Entry) -> Result<()> {
        if !self.eviction.new_eviction {
            return Ok(());
        }
        let node = crate::rankings::load_node(&mut self.block_files, entry.node_addr)?;
        if entry.leave_rankings_behind(node.data()) {
            return Ok(());
        }
        let node_addr = entry.node_addr;
        let (mut ctx, rankings) = self.rank_parts();
        rankings.remove(&mut ctx, node_addr, List::Deleted, true)
    }

    /// The list an entry belongs to under the active policy.
    pub(crate) fn list_for_entry(&self, entry: &Entry) -> List {
        if !self.eviction.new_eviction {
            return List::NoUse;
        }

        debug_assert_eq!(entry.entry.data().state, ENTRY_NORMAL);
        let reuse = entry.entry.data().reuse_count;
        if reuse == 0 {
            List::NoUse
        } else if reuse < HIGH_USE {
            List::LowUse
        } else {
            List::HighUse
        }
    }

    /// Dooms the entry referenced by a list node. Under the stratified
    /// policy the entry data is destroyed but the record moves to the
    /// DELETED list instead of going away.
    fn evict_entry(&mut self, node: &IterNode, empty: bool, list: List) -> Result<bool> {
        let Some(entry_rc) = self.get_enumerated_entry(node, list)? else {
            return Ok(false);
        };

        self.report_trim_times();
        {
            let mut entry = entry_rc.borrow_mut();
            if empty || !self.eviction.new_eviction {
                self.doom_entry_impl(&mut entry)?;
            } else {
                self.delete_entry_data(&mut entry, false)?;
                debug_assert_eq!(entry.entry.data().state, ENTRY_NORMAL);

                let node_addr = entry.node_addr;
                let entry_list = self.list_for_entry(&entry);
                {
                    let (mut ctx, rankings) = self.rank_parts();
                    rankings.remove(&mut ctx, node_addr, entry_list, true)?;
                }
                entry.entry.data_mut().state = ENTRY_EVICTED;
                self.store_entry_record(&mut entry)?;
                let (mut ctx, rankings) = self.rank_parts();
                rankings.insert(&mut ctx, node_addr, true, List::Deleted)?;
            }
        }
        if !empty {
            self.stats.on_event(Counter::TrimEntry);
        }

        self.release_internal_entry(entry_rc);
        Ok(true)
    }

    /// Discards the oldest nodes of the DELETED list.
    pub(crate) fn trim_deleted(&mut self, empty: bool) -> Result<()> {
        if self.disabled {
            return Ok(());
        }

        let start = Instant::now();
        let mut next = self.list_prev(None, List::Deleted)?;
        let mut deleted_entries = 0;
        while let Some(node) = next {
            if !empty
                && (deleted_entries >= TRIM_BATCH || start.elapsed().as_millis() >= TRIM_BUDGET_MS)
            {
                next = Some(node);
                break;
            }
            next = self.list_prev(Some(&node), List::Deleted)?;
            if self.remove_deleted_node(&node)? {
                deleted_entries += 1;
            }
            if self.eviction.test_mode {
                break;
            }
        }

        if deleted_entries > 0 && !empty && self.should_trim_deleted() {
            self.post_internal_trim_deleted(false);
        }

        let _ = next;
        debug!(deleted_entries, "Deleted-list trim finished.");
        Ok(())
    }

    fn remove_deleted_node(&mut self, node: &IterNode) -> Result<bool> {
        let Some(entry_rc) = self.get_enumerated_entry(node, List::Deleted)? else {
            return Ok(false);
        };

        let already_doomed = {
            let mut entry = entry_rc.borrow_mut();
            let doomed = entry.entry.data().state == ENTRY_DOOMED;
            entry.entry.data_mut().state = ENTRY_DOOMED;
            self.doom_entry_impl(&mut entry)?;
            doomed
        };
        self.release_internal_entry(entry_rc);
        Ok(!already_doomed)
    }

    fn should_trim(&mut self) -> bool {
        if !falling_behind(self.index_num_bytes(), self.eviction.max_size)
            && self.eviction.trim_delays < MAX_DELAYED_TRIMS
            && self.is_loaded()
        {
            return false;
        }
        self.eviction.trim_delays = 0;
        true
    }

    pub(crate) fn should_trim_deleted(&self) -> bool {
        let num_entries = self.index_num_entries();
        let index_load = num_entries * 100 / self.eviction.index_size.max(1);

        // With a lightly loaded index the deleted list would otherwise grow
        // to about double the other three lists combined (40% of the total).
        let max_length = if index_load < 25 {
            num_entries * 2 / 5
        } else {
            num_entries / 4
        };
        !self.eviction.test_mode && self.list_size(List::Deleted) > max_length
    }

    fn report_trim_times(&mut self) {
        if !self.eviction.first_trim {
            return;
        }
        self.eviction.first_trim = false;
        if self.index_lru_filled() {
            return;
        }
        self.set_index_lru_filled();
        info!("First cache eviction.");
    }

    fn post_delayed_trim(&mut self) -> Result<()> {
        // Prevent posting multiple tasks.
        if self.eviction.delay_trim {
            return Ok(());
        }
        self.eviction.delay_trim = true;
        self.eviction.trim_delays += 1;
        self.post_internal_delayed_trim();
        Ok(())
    }

    pub(crate) fn delayed_trim(&mut self) -> Result<()> {
        self.eviction.delay_trim = false;
        if self.eviction.trim_delays < MAX_DELAYED_TRIMS && self.is_loaded() {
            return self.post_delayed_trim();
        }
        self.trim_cache(false)
    }

    fn select_list_by_length(&mut self, next: &[Option<IterNode>; 3]) -> usize {
        let data_entries = self.index_num_entries() - self.list_size(List::Deleted);
        // Start by keeping each list roughly the same size.
        if self.list_size(List::NoUse) > data_entries / 3 {
            return 0;
        }

        let list = if self.list_size(List::LowUse) > data_entries / 3 {
            1
        } else {
            2
        };

        // Frequently used entries must still age at least as long as the
        // list-0 target, as long as list 0 is not about to run dry.
        if !node_is_old_enough(next[list].as_ref(), 0)
            && self.list_size(List::NoUse) > data_entries / 10
        {
            return 0;
        }
        list
    }
}

/// Whether a node's last use is past the age target of `list` (the target
/// doubles per list).
fn node_is_old_enough(node: Option<&IterNode>, list: u32) -> bool {
    let Some(node) = node else {
        return false;
    };
    let age_micros = now_micros().saturating_sub(node.data.last_used);
    let age_hours = age_micros / (3600 * 1_000_000);
    age_hours > TARGET_TIME_HOURS << list
}
