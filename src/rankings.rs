//! The LRU lists: doubly-linked rankings nodes threaded through block-file
//! records, with a two-phase transaction record in the index header so a
//! crash in the middle of a list mutation can be recovered at the next open.
//!
//! Whenever a node is inserted or removed, the transaction fields of the
//! mapped [`LruData`] are written first (target address, operation, list)
//! and cleared last; the individual pointer stores in between are ordered so
//! that every intermediate crash state is recognizable. See the state table
//! above [`Rankings::remove`].
//!
//! All node data is reloaded from its backing file immediately before every
//! mutation. Nothing else in the cache keeps authoritative copies of a
//! node's links, so there is no aliasing between open entries, iterators,
//! and the list operations; iterators hold snapshots that are fixed up
//! through the tracking registry when the node they reference changes or
//! goes away.

use std::{
    cell::RefCell,
    collections::HashSet,
    rc::{Rc, Weak},
};

use crate::{
    addr::{Addr, CacheAddr},
    block_files::BlockFiles,
    error::{CacheError, Result},
    format::{now_micros, LruData, RankingsNode, LIST_OP_INSERT, LIST_OP_REMOVE},
    storage::StorageBlock,
};

/// The five eviction lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum List {
    NoUse = 0,
    LowUse = 1,
    HighUse = 2,
    Reserved = 3,
    Deleted = 4,
}

pub const LAST_ELEMENT: usize = 5;

impl List {
    pub fn from_index(index: usize) -> List {
        match index {
            0 => List::NoUse,
            1 => List::LowUse,
            2 => List::HighUse,
            3 => List::Reserved,
            _ => List::Deleted,
        }
    }
}

/// Points at which a simulated crash can interrupt a list mutation.
/// Numbering follows the store order of the insert and remove sequences.
/// Only tests construct these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub enum CrashPoint {
    Insert1,
    Insert2,
    Insert3,
    Insert4,
    Remove1,
    Remove2,
    Remove3,
    Remove4,
    Remove5,
    Remove6,
    Remove7,
    Remove8,
}

/// A snapshot of a rankings node held by an iterator.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IterNode {
    pub addr: CacheAddr,
    pub data: RankingsNode,
}

pub(crate) type SharedIterNode = Rc<RefCell<IterNode>>;

/// Everything a list mutation needs from the backend: the mapped LRU
/// control data, the block files, the current run id, and the set of entry
/// records currently open (their nodes are trusted even while dirty).
pub(crate) struct RankCtx<'a> {
    pub files: &'a mut BlockFiles,
    pub lru: &'a mut LruData,
    pub current_id: i32,
    pub read_only: bool,
    pub open_contents: &'a HashSet<CacheAddr>,
    pub crash_point: Option<CrashPoint>,
    /// A simulated crash fired: the transaction record must stay on disk,
    /// exactly as a dead process would leave it.
    pub crashed: bool,
}

impl RankCtx<'_> {
    fn crash(&mut self, point: CrashPoint) -> Result<()> {
        if self.crash_point == Some(point) {
            self.crashed = true;
            return Err(CacheError::InitFailed {
                reason: "simulated crash".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct Rankings {
    init: bool,
    count_lists: bool,
    heads: [Addr; LAST_ELEMENT],
    tails: [Addr; LAST_ELEMENT],
    iterators: Vec<Weak<RefCell<IterNode>>>,
    pending_recovery: Option<CacheAddr>,
}

fn update_times(node: &mut RankingsNode, modified: bool) {
    let now = now_micros();
    node.last_used = now;
    if modified {
        node.last_modified = now;
    }
}

impl Rankings {
    /// Reads the list ends from the control data and finishes any mutation
    /// the previous run left in flight.
    pub fn init(&mut self, ctx: &mut RankCtx<'_>, count_lists: bool) -> Result<()> {
        debug_assert!(!self.init);
        self.count_lists = count_lists;
        self.read_heads(ctx.lru);
        self.read_tails(ctx.lru);

        let mut recovered = None;
        if ctx.lru.transaction != 0 {
            recovered = self.complete_transaction(ctx)?;
        }

        self.init = true;
        // An interrupted insert may need its entry re-linked into the hash
        // table; the backend handles that once it is up.
        if let Some(addr) = recovered {
            self.pending_recovery = Some(addr);
        }
        Ok(())
    }

    /// Entry-record address recovered by `complete_transaction`, if any,
    /// waiting for the backend to reattach it to the hash table.
    pub fn take_recovered_entry(&mut self) -> Option<CacheAddr> {
        self.pending_recovery.take()
    }

    pub fn reset(&mut self) {
        self.init = false;
        self.heads = [Addr::default(); LAST_ELEMENT];
        self.tails = [Addr::default(); LAST_ELEMENT];
        self.iterators.clear();
        self.pending_recovery = None;
    }

    /// Inserts `node_addr` at the head of `list`.
    pub fn insert(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node_addr: Addr,
        modified: bool,
        list: List,
    ) -> Result<()> {
        trace!(addr = node_addr.value(), ?list, "Inserting rankings node.");
        begin_transaction(ctx.lru, node_addr, LIST_OP_INSERT, list);
        let result = self.insert_body(ctx, node_addr, modified, list);
        if result.is_err() && !ctx.crashed {
            // The mutation never completed; a real crash would leave the
            // record for recovery, but on an error return we are still alive
            // and the mapped control data stays authoritative.
            end_transaction(ctx.lru);
            self.read_heads(ctx.lru);
            self.read_tails(ctx.lru);
        }
        result
    }

    fn insert_body(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node_addr: Addr,
        modified: bool,
        list: List,
    ) -> Result<()> {
        let my_head = self.heads[list as usize];
        let my_tail = self.tails[list as usize];

        let mut node = load_node(ctx.files, node_addr)?;
        if my_head.is_initialized() {
            let mut head = self.get_ranking(ctx, my_head)?;
            let head_prev = head.data().prev;
            // The head's back-pointer is its own address, except while
            // finishing an interrupted insert of this same node.
            if head_prev != my_head.value() && head_prev != node_addr.value() {
                return Err(CacheError::InvalidLinks);
            }

            head.data_mut().prev = node_addr.value();
            store_node(ctx.files, &mut head)?;
            ctx.crash(CrashPoint::Insert1)?;
            self.update_iterators(my_head.value(), head.data());
        }

        node.data_mut().next = my_head.value();
        node.data_mut().prev = node_addr.value();
        self.heads[list as usize] = node_addr;

        if !my_tail.is_initialized() || my_tail == node_addr {
            self.tails[list as usize] = node_addr;
            node.data_mut().next = node_addr.value();
            self.write_tail(ctx.lru, list);
            ctx.crash(CrashPoint::Insert2)?;
        }

        update_times(node.data_mut(), modified);
        store_node(ctx.files, &mut node)?;
        ctx.crash(CrashPoint::Insert3)?;

        // The last thing to do is move the head to point at a node already
        // stored.
        self.write_head(ctx.lru, list);
        self.increment_counter(ctx.lru, list);
        ctx.crash(CrashPoint::Insert4)?;

        end_transaction(ctx.lru);
        Ok(())
    }

    /// Removes `node_addr` from `list`.
    ///
    /// If a, b and r are elements on the list, and we want to remove r, the
    /// possible states for the objects if a crash happens are (where
    /// y(x, z) means for node y, prev is x and next is z):
    ///
    /// A. One element:
    ///    1. r(r, r), head(r), tail(r)                    initial state
    ///    2. r(r, r), head(0), tail(r)                    write head
    ///    3. r(r, r), head(0), tail(0)                    write tail
    ///    4. r(0, 0), head(0), tail(0)                    store node
    ///
    /// B. Remove a random element:
    ///    1. a(x, r), r(a, b), b(r, y), head(x), tail(y)  initial state
    ///    2. a(x, r), r(a, b), b(a, y), head(x), tail(y)  store next
    ///    3. a(x, b), r(a, b), b(a, y), head(x), tail(y)  store prev
    ///    4. a(x, b), r(0, 0), b(a, y), head(x), tail(y)  store node
    ///
    /// C. Remove head:
    ///    1. r(r, b), b(r, y), head(r), tail(y)           initial state
    ///    2. r(r, b), b(r, y), head(b), tail(y)           write head
    ///    3. r(r, b), b(b, y), head(b), tail(y)           store next
    ///    4. r(0, 0), b(b, y), head(b), tail(y)           store prev
    ///
    /// D. Remove tail:
    ///    1. a(x, r), r(a, r), head(x), tail(r)           initial state
    ///    2. a(x, r), r(a, r), head(x), tail(a)           write tail
    ///    3. a(x, a), r(a, r), head(x), tail(a)           store prev
    ///    4. a(x, a), r(0, 0), head(x), tail(a)           store node
    pub fn remove(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node_addr: Addr,
        list: List,
        strict: bool,
    ) -> Result<()> {
        trace!(addr = node_addr.value(), ?list, "Removing rankings node.");
        let mut node = load_node(ctx.files, node_addr)?;
        let next_addr = Addr::from_value(node.data().next);
        let prev_addr = Addr::from_value(node.data().prev);
        if !next_addr.is_initialized()
            || next_addr.is_separate_file()
            || !prev_addr.is_initialized()
            || prev_addr.is_separate_file()
        {
            if next_addr.is_initialized() || prev_addr.is_initialized() {
                error!(addr = node_addr.value(), "Invalid rankings info.");
            }
            return Ok(());
        }

        let mut next = self.get_ranking(ctx, next_addr)?;
        let mut prev = self.get_ranking(ctx, prev_addr)?;

        let list = match self.check_links(ctx, &mut node, &mut prev, &mut next, list)? {
            Some(list) => list,
            None => return Ok(()),
        };

        begin_transaction(ctx.lru, node_addr, LIST_OP_REMOVE, list);
        let result = self.remove_body(ctx, node, prev, next, list, strict);
        if result.is_err() && !ctx.crashed {
            end_transaction(ctx.lru);
            self.read_heads(ctx.lru);
            self.read_tails(ctx.lru);
        }
        result
    }

    fn remove_body(
        &mut self,
        ctx: &mut RankCtx<'_>,
        mut node: StorageBlock<RankingsNode>,
        mut prev: StorageBlock<RankingsNode>,
        mut next: StorageBlock<RankingsNode>,
        list: List,
        strict: bool,
    ) -> Result<()> {
        let node_addr = node.address();
        let next_addr = next.address();
        let prev_addr = prev.address();
        prev.data_mut().next = next_addr.value();
        next.data_mut().prev = prev_addr.value();
        ctx.crash(CrashPoint::Remove1)?;

        let node_value = node_addr.value();
        if node_value == self.heads[list as usize].value()
            || node_value == self.tails[list as usize].value()
        {
            if self.heads[list as usize] == self.tails[list as usize] {
                self.heads[list as usize] = Addr::default();
                self.tails[list as usize] = Addr::default();

                self.write_head(ctx.lru, list);
                ctx.crash(CrashPoint::Remove2)?;
                self.write_tail(ctx.lru, list);
                ctx.crash(CrashPoint::Remove3)?;
            } else if node_value == self.heads[list as usize].value() {
                self.heads[list as usize] = next_addr;
                next.data_mut().prev = next_addr.value();

                self.write_head(ctx.lru, list);
                ctx.crash(CrashPoint::Remove4)?;
            } else if node_value == self.tails[list as usize].value() {
                self.tails[list as usize] = prev_addr;
                prev.data_mut().next = prev_addr.value();

                self.write_tail(ctx.lru, list);
                ctx.crash(CrashPoint::Remove5)?;

                // Store the new tail now so the operation can be undone if
                // we crash before the remaining stores.
                store_node(ctx.files, &mut prev)?;
                ctx.crash(CrashPoint::Remove6)?;
            }
        }

        // Nodes out of a list are recognizable by their zeroed pointers.
        node.data_mut().next = 0;
        node.data_mut().prev = 0;

        // The last thing to reach disk is the node itself; up to that point
        // there is enough information to recover.
        store_node(ctx.files, &mut next)?;
        ctx.crash(CrashPoint::Remove7)?;
        store_node(ctx.files, &mut prev)?;
        ctx.crash(CrashPoint::Remove8)?;
        store_node(ctx.files, &mut node)?;
        self.decrement_counter(ctx.lru, list);

        if strict {
            self.update_iterators_for_removed(node_value, next_addr.value(), next.data());
        }
        self.update_iterators(next_addr.value(), next.data());
        self.update_iterators(prev_addr.value(), prev.data());

        end_transaction(ctx.lru);
        Ok(())
    }

    /// Moves `node_addr` to the head of `list`, refreshing its timestamps.
    pub fn update_rank(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node_addr: Addr,
        modified: bool,
        list: List,
    ) -> Result<()> {
        if self.heads[list as usize] == node_addr {
            let mut node = load_node(ctx.files, node_addr)?;
            update_times(node.data_mut(), modified);
            store_node(ctx.files, &mut node)?;
            self.update_iterators(node_addr.value(), node.data());
            return Ok(());
        }

        self.remove(ctx, node_addr, list, true)?;
        self.insert(ctx, node_addr, modified, list)
    }

    /// The node after `node` ("next newer": toward the head), or the list
    /// tail when `node` is `None`.
    pub fn get_next(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node: Option<&IterNode>,
        list: List,
    ) -> Result<Option<IterNode>> {
        let address = match node {
            None => {
                let my_head = self.heads[list as usize];
                if !my_head.is_initialized() {
                    return Ok(None);
                }
                my_head
            }
            Some(node) => {
                let my_tail = self.tails[list as usize];
                if !my_tail.is_initialized() {
                    return Ok(None);
                }
                if my_tail.value() == node.addr {
                    return Ok(None);
                }
                let next = node.data.next;
                if next == node.addr {
                    // Another tail? fail it.
                    return Ok(None);
                }
                Addr::from_value(next)
            }
        };

        let block = self.get_ranking(ctx, address)?;
        let found = IterNode {
            addr: address.value(),
            data: *block.data(),
        };
        if let Some(node) = node {
            if !check_single_link(node, &found) {
                return Err(CacheError::InvalidLinks);
            }
        }
        Ok(Some(found))
    }

    /// The node before `node` ("next older": toward the tail), or the list
    /// tail when `node` is `None`. This is the eviction walk direction.
    pub fn get_prev(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node: Option<&IterNode>,
        list: List,
    ) -> Result<Option<IterNode>> {
        let address = match node {
            None => {
                let my_tail = self.tails[list as usize];
                if !my_tail.is_initialized() {
                    return Ok(None);
                }
                my_tail
            }
            Some(node) => {
                let my_head = self.heads[list as usize];
                if !my_head.is_initialized() {
                    return Ok(None);
                }
                if my_head.value() == node.addr {
                    return Ok(None);
                }
                let prev = node.data.prev;
                if prev == node.addr {
                    // Another head? fail it.
                    return Ok(None);
                }
                Addr::from_value(prev)
            }
        };

        let block = self.get_ranking(ctx, address)?;
        let found = IterNode {
            addr: address.value(),
            data: *block.data(),
        };
        if let Some(node) = node {
            if !check_single_link(&found, node) {
                return Err(CacheError::InvalidLinks);
            }
        }
        Ok(Some(found))
    }

    /// Registers an iterator snapshot for fix-up when its node changes.
    pub fn track(&mut self, node: &SharedIterNode) {
        self.iterators.push(Rc::downgrade(node));
    }

    /// Structural validation of a node: paired pointers, self-loops only at
    /// the matching list ends, addresses of the rankings class.
    pub fn sanity_check(&self, node_addr: CacheAddr, node: &RankingsNode, from_list: bool) -> bool {
        use crate::format::SelfHashed;
        if !node.verify_hash() {
            // Log-and-proceed keeps corrupt entries doomable; the entry
            // record has its own, stricter check.
            warn!(addr = node_addr, "Rankings self-hash mismatch.");
        }

        if (node.next == 0 && node.prev != 0) || (node.next != 0 && node.prev == 0) {
            return false;
        }
        // Both pointers zero is a node out of any list.
        if node.next == 0 && node.prev == 0 && from_list {
            return false;
        }

        if node_addr == node.prev && self.is_head(node_addr).is_none() {
            return false;
        }
        if node_addr == node.next && self.is_tail(node_addr).is_none() {
            return false;
        }

        if node.next == 0 && node.prev == 0 {
            return true;
        }

        Addr::from_value(node.next).sanity_check_for_rankings()
            && Addr::from_value(node.prev).sanity_check_for_rankings()
    }

    /// Content validation: nodes coming from a list must carry timestamps
    /// and a back-pointer to their entry.
    pub fn data_sanity_check(&self, node: &RankingsNode, from_list: bool) -> bool {
        if node.contents == 0 {
            return false;
        }
        if from_list && (node.last_used == 0 || node.last_modified == 0) {
            return false;
        }
        true
    }

    pub fn is_head(&self, addr: CacheAddr) -> Option<List> {
        (0..LAST_ELEMENT)
            .find(|&i| self.heads[i].value() == addr)
            .map(List::from_index)
    }

    pub fn is_tail(&self, addr: CacheAddr) -> Option<List> {
        (0..LAST_ELEMENT)
            .find(|&i| self.tails[i].value() == addr)
            .map(List::from_index)
    }

    /// Walks every list in both directions, returning the total number of
    /// nodes or the first inconsistency found.
    pub fn self_check(&mut self, ctx: &mut RankCtx<'_>) -> Result<i32> {
        let mut total = 0;
        for i in 0..LAST_ELEMENT {
            let list = List::from_index(i);
            total += self.check_list(ctx, list)?;
        }
        Ok(total)
    }

    /// Validates one list, walking head to tail and back, and checks the
    /// traversed count against the stored size.
    pub fn check_list(&mut self, ctx: &mut RankCtx<'_>, list: List) -> Result<i32> {
        let forward = self.check_list_section(ctx, list, true)?;
        let backward = self.check_list_section(ctx, list, false)?;
        if forward != backward {
            return Err(CacheError::InvalidLinks);
        }
        if self.count_lists && forward != ctx.lru.sizes[list as usize] {
            return Err(CacheError::NumEntriesMismatch {
                stored: ctx.lru.sizes[list as usize],
                traversed: forward,
            });
        }
        Ok(forward)
    }

    fn check_list_section(&mut self, ctx: &mut RankCtx<'_>, list: List, forward: bool) -> Result<i32> {
        let mut current = if forward {
            self.heads[list as usize]
        } else {
            self.tails[list as usize]
        };
        if !current.is_initialized() {
            return Ok(0);
        }
        if !current.sanity_check_for_rankings() {
            return Err(CacheError::InvalidLinks);
        }

        // A corrupt circular list must not hang the walk; anything past the
        // stored size plus slack is a cycle.
        let limit = ctx.lru.sizes[list as usize].saturating_add(1000);

        let mut num_items = 0;
        let mut prev_addr = current;
        loop {
            if num_items > limit {
                return Err(CacheError::InvalidLinks);
            }
            let node = load_node(ctx.files, current)?;
            if !self.sanity_check(current.value(), node.data(), true) {
                return Err(CacheError::InvalidEntry);
            }

            let (next, prev) = if forward {
                (node.data().next, node.data().prev)
            } else {
                (node.data().prev, node.data().next)
            };

            if prev != prev_addr.value() {
                return Err(CacheError::InvalidLinks);
            }

            let next_addr = Addr::from_value(next);
            if !next_addr.sanity_check_for_rankings() {
                return Err(CacheError::InvalidLinks);
            }

            prev_addr = current;
            num_items += 1;

            if next_addr == prev_addr {
                // A self-loop: must be the end the walk was headed for.
                let last = if forward {
                    self.tails[list as usize]
                } else {
                    self.heads[list as usize]
                };
                if next_addr == last {
                    return Ok(num_items);
                }
                return Err(CacheError::InvalidLinks);
            }
            current = next_addr;
        }
    }

    /// Finishes the list mutation recorded in the transaction fields.
    /// Returns the entry-record address of a node recovered by an
    /// interrupted insert, so the backend can reattach it.
    fn complete_transaction(&mut self, ctx: &mut RankCtx<'_>) -> Result<Option<CacheAddr>> {
        let node_addr = Addr::from_value(ctx.lru.transaction);
        if !node_addr.is_initialized() || node_addr.is_separate_file() {
            error!("Invalid rankings transaction record.");
            end_transaction(ctx.lru);
            return Ok(None);
        }

        let mut node = load_node(ctx.files, node_addr)?;
        store_node(ctx.files, &mut node)?;

        match ctx.lru.operation {
            LIST_OP_INSERT => {
                debug!(addr = node_addr.value(), "Finishing interrupted insert.");
                self.finish_insert(ctx, node_addr)?;
                Ok(Some(load_node(ctx.files, node_addr)?.data().contents))
            }
            LIST_OP_REMOVE => {
                debug!(addr = node_addr.value(), "Reverting interrupted remove.");
                self.revert_remove(ctx, node_addr)?;
                Ok(None)
            }
            _ => {
                error!(operation = ctx.lru.operation, "Invalid operation to recover.");
                end_transaction(ctx.lru);
                Ok(None)
            }
        }
    }

    fn finish_insert(&mut self, ctx: &mut RankCtx<'_>, node_addr: Addr) -> Result<()> {
        ctx.lru.transaction = 0;
        ctx.lru.operation = 0;
        let list = List::from_index(ctx.lru.operation_list.clamp(0, 4) as usize);
        let my_head = self.heads[list as usize];
        let my_tail = self.tails[list as usize];
        if my_head != node_addr {
            if my_tail == node_addr {
                // The insert stopped before linking a previous tail; restore
                // the self-loop the insert logic would skip.
                let mut node = load_node(ctx.files, node_addr)?;
                node.data_mut().next = my_tail.value();
                store_node(ctx.files, &mut node)?;
            }
            self.insert(ctx, node_addr, true, list)?;
        } else {
            end_transaction(ctx.lru);
        }
        Ok(())
    }

    fn revert_remove(&mut self, ctx: &mut RankCtx<'_>, node_addr: Addr) -> Result<()> {
        let node = load_node(ctx.files, node_addr)?;
        let next_addr = Addr::from_value(node.data().next);
        let prev_addr = Addr::from_value(node.data().prev);
        if !next_addr.is_initialized() || !prev_addr.is_initialized() {
            // The operation actually finished. Nothing to do.
            end_transaction(ctx.lru);
            return Ok(());
        }
        if next_addr.is_separate_file() || prev_addr.is_separate_file() {
            warn!("Invalid rankings info while reverting a remove.");
            end_transaction(ctx.lru);
            return Ok(());
        }

        let mut next = load_node(ctx.files, next_addr)?;
        let mut prev = load_node(ctx.files, prev_addr)?;

        let node_value = node_addr.value();
        if node_value != prev_addr.value() {
            prev.data_mut().next = node_value;
        }
        if node_value != next_addr.value() {
            next.data_mut().prev = node_value;
        }

        let list = List::from_index(ctx.lru.operation_list.clamp(0, 4) as usize);
        let my_head = self.heads[list as usize];
        let my_tail = self.tails[list as usize];
        if !my_head.is_initialized() || !my_tail.is_initialized() {
            self.heads[list as usize] = node_addr;
            self.tails[list as usize] = node_addr;
            self.write_head(ctx.lru, list);
            self.write_tail(ctx.lru, list);
        } else if my_head == next_addr {
            self.heads[list as usize] = node_addr;
            prev.data_mut().next = next_addr.value();
            self.write_head(ctx.lru, list);
        } else if my_tail == prev_addr {
            self.tails[list as usize] = node_addr;
            next.data_mut().prev = prev_addr.value();
            self.write_tail(ctx.lru, list);
        }

        store_node(ctx.files, &mut next)?;
        store_node(ctx.files, &mut prev)?;
        end_transaction(ctx.lru);
        Ok(())
    }

    /// Decides whether the node can be unlinked, repairing the cases where
    /// the node disagrees with its neighbors. Returns the list to operate
    /// on, or `None` when the node is already out of the list.
    fn check_links(
        &mut self,
        ctx: &mut RankCtx<'_>,
        node: &mut StorageBlock<RankingsNode>,
        prev: &mut StorageBlock<RankingsNode>,
        next: &mut StorageBlock<RankingsNode>,
        list: List,
    ) -> Result<Option<List>> {
        let node_addr = node.address().value();
        if prev.data().next == node_addr && next.data().prev == node_addr {
            // A regular linked node.
            return Ok(Some(list));
        }

        if node_addr != prev.address().value()
            && node_addr != next.address().value()
            && prev.data().next == next.address().value()
            && next.data().prev == prev.address().value()
        {
            // The list is actually ok, the node is the strange one.
            node.data_mut().next = 0;
            node.data_mut().prev = 0;
            store_node(ctx.files, node)?;
            return Ok(None);
        }

        if prev.data().next == node_addr || next.data().prev == node_addr {
            // Only one link is weird; a node can still be the head or tail
            // seen from the control data.
            if prev.data().next != node_addr {
                if let Some(found) = self.is_head(node_addr) {
                    return Ok(Some(found));
                }
            }
            if next.data().prev != node_addr {
                if let Some(found) = self.is_tail(node_addr) {
                    return Ok(Some(found));
                }
            }
        }

        error!(addr = node_addr, "Inconsistent LRU.");
        Err(CacheError::InvalidLinks)
    }

    /// Loads a node and runs the structural checks; restamps the dirty id of
    /// untrusted nodes so they get discarded by a later open.
    fn get_ranking(
        &mut self,
        ctx: &mut RankCtx<'_>,
        address: Addr,
    ) -> Result<StorageBlock<RankingsNode>> {
        if !address.is_initialized() {
            return Err(CacheError::InvalidAddress {
                value: address.value(),
            });
        }

        let mut block = load_node(ctx.files, address)?;
        if !self.sanity_check(address.value(), block.data(), true) {
            return Err(CacheError::InvalidLinks);
        }

        // Open entries are not marked dirty in read-only mode, so there is
        // nothing further to check there.
        if ctx.read_only || block.data().dirty == 0 {
            return Ok(block);
        }

        if ctx.open_contents.contains(&block.data().contents) {
            // The node belongs to an open entry; its stores write through,
            // so the loaded data is current.
            return Ok(block);
        }

        // This node cannot be trusted, but a cleanup cannot start here (we
        // may be in the middle of one already). Restamp it so the entry is
        // discarded when a regular open or create path finds it.
        let mut dirty = ctx.current_id.wrapping_sub(1);
        if dirty == 0 {
            dirty -= 1;
        }
        block.data_mut().dirty = dirty;
        store_node(ctx.files, &mut block)?;
        Ok(block)
    }

    fn read_heads(&mut self, lru: &LruData) {
        for i in 0..LAST_ELEMENT {
            self.heads[i] = Addr::from_value(lru.heads[i]);
        }
    }

    fn read_tails(&mut self, lru: &LruData) {
        for i in 0..LAST_ELEMENT {
            self.tails[i] = Addr::from_value(lru.tails[i]);
        }
    }

    fn write_head(&self, lru: &mut LruData, list: List) {
        lru.heads[list as usize] = self.heads[list as usize].value();
    }

    fn write_tail(&self, lru: &mut LruData, list: List) {
        lru.tails[list as usize] = self.tails[list as usize].value();
    }

    fn increment_counter(&self, lru: &mut LruData, list: List) {
        if !self.count_lists {
            return;
        }
        if lru.sizes[list as usize] < i32::MAX {
            lru.sizes[list as usize] += 1;
        }
    }

    fn decrement_counter(&self, lru: &mut LruData, list: List) {
        if !self.count_lists {
            return;
        }
        if lru.sizes[list as usize] > 0 {
            lru.sizes[list as usize] -= 1;
        }
    }

    /// Refreshes every live iterator snapshot pointing at `address`.
    fn update_iterators(&mut self, address: CacheAddr, data: &RankingsNode) {
        self.iterators.retain(|weak| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let mut node = shared.borrow_mut();
            if node.addr == address {
                node.data = *data;
            }
            true
        });
    }

    /// Advances every live iterator pointing at a removed node to its
    /// successor in the same list.
    fn update_iterators_for_removed(
        &mut self,
        address: CacheAddr,
        next_addr: CacheAddr,
        next_data: &RankingsNode,
    ) {
        self.iterators.retain(|weak| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let mut node = shared.borrow_mut();
            if node.addr == address {
                node.addr = next_addr;
                node.data = *next_data;
            }
            true
        });
    }
}

fn begin_transaction(lru: &mut LruData, addr: Addr, operation: i32, list: List) {
    debug_assert_eq!(lru.transaction, 0);
    debug_assert!(addr.is_initialized());
    lru.operation = operation;
    lru.operation_list = list as i32;
    lru.transaction = addr.value();
}

fn end_transaction(lru: &mut LruData) {
    lru.transaction = 0;
    lru.operation = 0;
    lru.operation_list = 0;
}

fn check_single_link(prev: &IterNode, next: &IterNode) -> bool {
    if prev.data.next != next.addr || next.data.prev != prev.addr {
        error!("Inconsistent LRU.");
        return false;
    }
    true
}

pub(crate) fn load_node(
    files: &mut BlockFiles,
    address: Addr,
) -> Result<StorageBlock<RankingsNode>> {
    if !address.sanity_check_for_rankings() || !address.is_initialized() {
        return Err(CacheError::InvalidAddress {
            value: address.value(),
        });
    }
    let mut block = StorageBlock::<RankingsNode>::new(address);
    let file = files.get_file(address)?;
    block
        .load(file)
        .map_err(|source| CacheError::ReadFailure { source })?;
    Ok(block)
}

pub(crate) fn store_node(
    files: &mut BlockFiles,
    block: &mut StorageBlock<RankingsNode>,
) -> Result<()> {
    let file = files.get_file(block.address())?;
    block
        .store(file)
        .map_err(|source| CacheError::WriteFailure { source })?;
    Ok(())
}
