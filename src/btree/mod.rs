//! Disk-resident B+tree keyed by serialized rows.
//!
//! Internal separators follow "subtree minimum" semantics: `key[i]` is
//! always the smallest key reachable under `child[i]`, and every
//! structural change resyncs the separators on the affected path. Leaves
//! form a singly-linked ascending chain.

pub mod iterator;
pub mod node;

use std::sync::{Arc, Mutex};

use crate::buffer_pool::{BufferPoolManager, PageGuard};
use crate::errors::DbResult;
use crate::{PageId, RowId, INDEX_ROOTS_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};

pub use iterator::IndexIterator;
pub use node::KeyComparator;
use node::{INTERNAL_HEADER_SIZE, INTERNAL_VALUE_SIZE, LEAF_HEADER_SIZE, LEAF_VALUE_SIZE};

pub struct BPlusTree {
    index_id: u32,
    bpm: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    root_page_id: Mutex<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Opens (or registers) the index in the roots page. Fan-outs are
    /// derived from the page and key size unless explicit sizes are
    /// given, and equalized so leaves and internals redistribute the
    /// same way.
    pub fn new(
        index_id: u32,
        bpm: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: Option<usize>,
        internal_max_size: Option<usize>,
    ) -> DbResult<Self> {
        let key_size = comparator.key_size();
        let (leaf_max_size, internal_max_size) = match (leaf_max_size, internal_max_size) {
            (Some(l), Some(i)) => (l, i),
            _ => {
                let leaf = (PAGE_SIZE - LEAF_HEADER_SIZE) / (key_size + LEAF_VALUE_SIZE);
                let internal = (PAGE_SIZE - INTERNAL_HEADER_SIZE) / (key_size + INTERNAL_VALUE_SIZE);
                let equalized = leaf.min(internal);
                (equalized, equalized)
            }
        };
        assert!(leaf_max_size >= 2 && internal_max_size >= 3, "fan-out too small");

        let root_page_id = {
            let guard = bpm.fetch_page(INDEX_ROOTS_PAGE_ID)?;
            let existing = guard.read().roots_get(index_id);
            match existing {
                Some(root) => root,
                None => {
                    assert!(
                        guard.write().roots_insert(index_id, INVALID_PAGE_ID),
                        "index roots page is full"
                    );
                    INVALID_PAGE_ID
                }
            }
        };
        Ok(Self {
            index_id,
            bpm,
            comparator,
            root_page_id: Mutex::new(root_page_id),
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn comparator(&self) -> &KeyComparator {
        &self.comparator
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.lock().unwrap() == INVALID_PAGE_ID
    }

    /// Point lookup.
    pub fn get_value(&self, key: &[u8]) -> DbResult<Option<RowId>> {
        let root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            return Ok(None);
        }
        let leaf = self.find_leaf(*root, Some(key))?;
        let page = leaf.read();
        Ok(page.leaf_lookup(key, &self.comparator))
    }

    /// Inserts a unique key. Returns `false` on duplicates.
    pub fn insert(&self, key: &[u8], rid: RowId) -> DbResult<bool> {
        let mut root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            self.start_new_tree(&mut root, key, rid)?;
            return Ok(true);
        }
        self.insert_into_leaf(&mut root, key, rid)
    }

    /// Removes a key; absent keys are a no-op.
    pub fn remove(&self, key: &[u8]) -> DbResult<()> {
        let mut root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            return Ok(());
        }
        let (leaf_id, size, removed_at) = {
            let leaf_guard = self.find_leaf(*root, Some(key))?;
            let found = {
                let page = leaf_guard.read();
                let idx = page.leaf_key_index(key, &self.comparator);
                (idx < page.node_size()
                    && self
                        .comparator
                        .compare(page.leaf_key_at(idx), key)
                        .is_eq())
                .then_some(idx)
            };
            let Some(idx) = found else {
                return Ok(());
            };
            let mut page = leaf_guard.write();
            page.leaf_remove_at(idx);
            (page.node_page_id(), page.node_size(), idx)
        };
        if size > 0 && removed_at == 0 {
            // The leaf's minimum changed; resync the path.
            self.resync_ancestor_keys(leaf_id)?;
        }
        if leaf_id == *root {
            if size == 0 {
                self.adjust_root(&mut root, leaf_id)?;
            }
            return Ok(());
        }
        if size < self.leaf_max_size / 2 {
            self.coalesce_or_redistribute(&mut root, leaf_id)?;
        }
        Ok(())
    }

    /// Iterates the whole tree in key order.
    pub fn iter(&self) -> DbResult<IndexIterator<'_>> {
        let root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            return Ok(IndexIterator::new(&self.bpm, None, 0));
        }
        let leaf = self.find_leaf(*root, None)?;
        Ok(IndexIterator::new(&self.bpm, Some(leaf), 0))
    }

    /// Iterates keys `>= key`.
    pub fn iter_from(&self, key: &[u8]) -> DbResult<IndexIterator<'_>> {
        let root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            return Ok(IndexIterator::new(&self.bpm, None, 0));
        }
        let leaf = self.find_leaf(*root, Some(key))?;
        let slot = leaf.read().leaf_key_index(key, &self.comparator);
        Ok(IndexIterator::new(&self.bpm, Some(leaf), slot))
    }

    /// Frees every page of the tree and clears the registered root.
    pub fn destroy(&self) -> DbResult<()> {
        let mut root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            return Ok(());
        }
        self.destroy_subtree(*root)?;
        *root = INVALID_PAGE_ID;
        self.update_root_page_id(INVALID_PAGE_ID)
    }

    fn destroy_subtree(&self, page_id: PageId) -> DbResult<()> {
        let children: Vec<PageId> = {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            if page.is_leaf_node() {
                Vec::new()
            } else {
                (0..page.node_size()).map(|i| page.internal_child_at(i)).collect()
            }
        };
        for child in children {
            self.destroy_subtree(child)?;
        }
        self.bpm.delete_page(page_id)?;
        Ok(())
    }

    /// Descends to the leaf covering `key`, or to the leftmost leaf when
    /// no key is given. Interior guards are released on the way down.
    fn find_leaf(&self, from: PageId, key: Option<&[u8]>) -> DbResult<PageGuard<'_>> {
        let mut page_id = from;
        loop {
            let guard = self.bpm.fetch_page(page_id)?;
            let next = {
                let page = guard.read();
                if page.is_leaf_node() {
                    None
                } else {
                    Some(match key {
                        Some(key) => page.internal_lookup(key, &self.comparator),
                        None => page.internal_child_at(0),
                    })
                }
            };
            match next {
                None => return Ok(guard),
                Some(child) => page_id = child,
            }
        }
    }

    /// Smallest key stored under `page_id`.
    fn subtree_min_key(&self, page_id: PageId) -> DbResult<Vec<u8>> {
        let leaf = self.find_leaf(page_id, None)?;
        let page = leaf.read();
        assert!(page.node_size() > 0, "subtree minimum of an empty node");
        Ok(page.leaf_key_at(0).to_vec())
    }

    /// Rewrites the separator for `child_id` (and each ancestor above
    /// it) to the current subtree minimum.
    fn resync_ancestor_keys(&self, mut child_id: PageId) -> DbResult<()> {
        loop {
            let parent_id = {
                let guard = self.bpm.fetch_page(child_id)?;
                let page = guard.read();
                page.node_parent()
            };
            if parent_id == INVALID_PAGE_ID {
                return Ok(());
            }
            let min_key = self.subtree_min_key(child_id)?;
            let guard = self.bpm.fetch_page(parent_id)?;
            let mut page = guard.write();
            let idx = page
                .internal_child_index(child_id)
                .expect("child vanished from its parent");
            page.internal_set_key_at(idx, &min_key);
            child_id = parent_id;
        }
    }

    fn update_root_page_id(&self, root: PageId) -> DbResult<()> {
        let guard = self.bpm.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        assert!(
            guard.write().roots_update(self.index_id, root),
            "index {} missing from the roots page",
            self.index_id
        );
        Ok(())
    }

    fn start_new_tree(&self, root: &mut PageId, key: &[u8], rid: RowId) -> DbResult<()> {
        let guard = self.bpm.new_page()?;
        let page_id = guard.page_id();
        {
            let mut page = guard.write();
            page.init_leaf_node(
                page_id,
                INVALID_PAGE_ID,
                self.comparator.key_size(),
                self.leaf_max_size,
            );
            page.leaf_insert_at(0, key, rid);
        }
        *root = page_id;
        self.update_root_page_id(page_id)
    }

    fn insert_into_leaf(&self, root: &mut PageId, key: &[u8], rid: RowId) -> DbResult<bool> {
        let leaf_guard = self.find_leaf(*root, Some(key))?;
        let insert_at = {
            let page = leaf_guard.read();
            let idx = page.leaf_key_index(key, &self.comparator);
            if idx < page.node_size()
                && self.comparator.compare(page.leaf_key_at(idx), key).is_eq()
            {
                return Ok(false);
            }
            idx
        };
        let (leaf_id, size) = {
            let mut page = leaf_guard.write();
            page.leaf_insert_at(insert_at, key, rid);
            (page.node_page_id(), page.node_size())
        };

        if size >= self.leaf_max_size {
            let (new_leaf_id, separator) = self.split_leaf(&leaf_guard)?;
            drop(leaf_guard);
            self.insert_into_parent(root, leaf_id, separator, new_leaf_id)?;
        } else {
            drop(leaf_guard);
        }
        if insert_at == 0 {
            // A new subtree minimum; keep ancestor separators in sync.
            self.resync_ancestor_keys(leaf_id)?;
        }
        Ok(true)
    }

    /// Splits a full leaf, returning the sibling id and its first key.
    fn split_leaf(&self, leaf_guard: &PageGuard<'_>) -> DbResult<(PageId, Vec<u8>)> {
        let new_guard = self.bpm.new_page()?;
        let new_id = new_guard.page_id();
        let separator = {
            let mut old = leaf_guard.write();
            let mut new = new_guard.write();
            new.init_leaf_node(
                new_id,
                old.node_parent(),
                self.comparator.key_size(),
                self.leaf_max_size,
            );
            old.leaf_move_half_to(&mut new);
            new.leaf_key_at(0).to_vec()
        };
        crate::granite_debug_log!("[BPlusTree::split_leaf] {} -> {}", leaf_guard.page_id(), new_id);
        Ok((new_id, separator))
    }

    /// Splits a full internal node and re-parents the moved children.
    fn split_internal(&self, guard: &PageGuard<'_>) -> DbResult<(PageId, Vec<u8>)> {
        let new_guard = self.bpm.new_page()?;
        let new_id = new_guard.page_id();
        let (moved_children, separator) = {
            let mut old = guard.write();
            let mut new = new_guard.write();
            new.init_internal_node(
                new_id,
                old.node_parent(),
                self.comparator.key_size(),
                self.internal_max_size,
            );
            old.internal_move_half_to(&mut new);
            let children: Vec<PageId> =
                (0..new.node_size()).map(|i| new.internal_child_at(i)).collect();
            (children, new.internal_key_at(0).to_vec())
        };
        for child in moved_children {
            let child_guard = self.bpm.fetch_page(child)?;
            child_guard.write().set_node_parent(new_id);
        }
        crate::granite_debug_log!("[BPlusTree::split_internal] {} -> {}", guard.page_id(), new_id);
        Ok((new_id, separator))
    }

    /// Hooks a freshly split sibling into the tree, growing a new root
    /// when the split node was the root.
    fn insert_into_parent(
        &self,
        root: &mut PageId,
        old_id: PageId,
        separator: Vec<u8>,
        new_id: PageId,
    ) -> DbResult<()> {
        if old_id == *root {
            let old_min = self.subtree_min_key(old_id)?;
            let root_guard = self.bpm.new_page()?;
            let new_root_id = root_guard.page_id();
            {
                let mut page = root_guard.write();
                page.init_internal_node(
                    new_root_id,
                    INVALID_PAGE_ID,
                    self.comparator.key_size(),
                    self.internal_max_size,
                );
                page.internal_populate_new_root(&old_min, old_id, &separator, new_id);
            }
            for child in [old_id, new_id] {
                let guard = self.bpm.fetch_page(child)?;
                guard.write().set_node_parent(new_root_id);
            }
            *root = new_root_id;
            return self.update_root_page_id(new_root_id);
        }

        let parent_id = {
            let guard = self.bpm.fetch_page(old_id)?;
            let page = guard.read();
            page.node_parent()
        };
        let old_min = self.subtree_min_key(old_id)?;
        let parent_guard = self.bpm.fetch_page(parent_id)?;
        let parent_size = {
            let mut page = parent_guard.write();
            let idx = page
                .internal_child_index(old_id)
                .expect("split node missing from its parent");
            page.internal_insert_at(idx + 1, &separator, new_id);
            page.internal_set_key_at(idx, &old_min);
            page.node_size()
        };
        if parent_size >= self.internal_max_size {
            let (new_parent_id, parent_separator) = self.split_internal(&parent_guard)?;
            drop(parent_guard);
            self.insert_into_parent(root, parent_id, parent_separator, new_parent_id)?;
        }
        Ok(())
    }

    /// Underflow fixup. Prefers borrowing one entry from the sibling;
    /// merges and recurses otherwise. Returns `true` when a page was
    /// deleted.
    fn coalesce_or_redistribute(&self, root: &mut PageId, node_id: PageId) -> DbResult<bool> {
        let node_guard = self.bpm.fetch_page(node_id)?;
        let (parent_id, node_size, node_is_leaf, node_max) = {
            let page = node_guard.read();
            (
                page.node_parent(),
                page.node_size(),
                page.is_leaf_node(),
                page.node_max_size(),
            )
        };
        let parent_guard = self.bpm.fetch_page(parent_id)?;
        let (node_index, neighbor_id) = {
            let page = parent_guard.read();
            let idx = page
                .internal_child_index(node_id)
                .expect("underflowing node missing from its parent");
            let neighbor_idx = if idx == 0 { 1 } else { idx - 1 };
            (idx, page.internal_child_at(neighbor_idx))
        };
        let neighbor_guard = self.bpm.fetch_page(neighbor_id)?;
        let neighbor_size = neighbor_guard.read().node_size();

        if neighbor_size + node_size >= node_max {
            self.redistribute(&node_guard, &neighbor_guard, node_is_leaf, node_index)?;
            // The node that received a new first entry (or lost one)
            // changed a subtree minimum.
            let mut parent = parent_guard.write();
            if node_index == 0 {
                let node_min = self.subtree_min_key(node_id)?;
                parent.internal_set_key_at(0, &node_min);
                let min = self.subtree_min_key(neighbor_id)?;
                parent.internal_set_key_at(1, &min);
            } else {
                let min = self.subtree_min_key(node_id)?;
                parent.internal_set_key_at(node_index, &min);
            }
            return Ok(false);
        }

        // Merge the right page of the pair into the left one.
        let (survivor_id, removed_id, removed_index) = if node_index == 0 {
            (node_id, neighbor_id, 1)
        } else {
            (neighbor_id, node_id, node_index)
        };
        {
            let (survivor_guard, doomed_guard) = if node_index == 0 {
                (&node_guard, &neighbor_guard)
            } else {
                (&neighbor_guard, &node_guard)
            };
            let moved_children = {
                let mut survivor = survivor_guard.write();
                let mut doomed = doomed_guard.write();
                if node_is_leaf {
                    doomed.leaf_move_all_to(&mut survivor);
                    Vec::new()
                } else {
                    doomed.internal_move_all_to(&mut survivor);
                    (0..survivor.node_size())
                        .map(|i| survivor.internal_child_at(i))
                        .collect()
                }
            };
            for child in moved_children {
                let guard = self.bpm.fetch_page(child)?;
                guard.write().set_node_parent(survivor_id);
            }
        }
        let parent_size = {
            let mut page = parent_guard.write();
            page.internal_remove_at(removed_index);
            page.node_size()
        };
        drop(node_guard);
        drop(neighbor_guard);
        self.bpm.delete_page(removed_id)?;
        crate::granite_debug_log!(
            "[BPlusTree::coalesce] merged {removed_id} into {survivor_id}"
        );

        if parent_id == *root {
            drop(parent_guard);
            self.adjust_root(root, parent_id)?;
        } else if parent_size < self.internal_max_size / 2 {
            drop(parent_guard);
            self.coalesce_or_redistribute(root, parent_id)?;
        }
        Ok(true)
    }

    /// Rotates one entry across the node/neighbor boundary.
    fn redistribute(
        &self,
        node_guard: &PageGuard<'_>,
        neighbor_guard: &PageGuard<'_>,
        is_leaf: bool,
        node_index: usize,
    ) -> DbResult<()> {
        let moved_child = {
            let mut node = node_guard.write();
            let mut neighbor = neighbor_guard.write();
            if is_leaf {
                if node_index == 0 {
                    neighbor.leaf_move_first_to_end_of(&mut node);
                } else {
                    neighbor.leaf_move_last_to_front_of(&mut node);
                }
                None
            } else if node_index == 0 {
                Some(neighbor.internal_move_first_to_end_of(&mut node))
            } else {
                Some(neighbor.internal_move_last_to_front_of(&mut node))
            }
        };
        if let Some(child) = moved_child {
            let guard = self.bpm.fetch_page(child)?;
            guard.write().set_node_parent(node_guard.page_id());
        }
        Ok(())
    }

    /// Collapses the root: an internal root with a single child promotes
    /// that child; an empty leaf root empties the tree.
    fn adjust_root(&self, root: &mut PageId, old_root_id: PageId) -> DbResult<()> {
        let (is_leaf, size, only_child) = {
            let guard = self.bpm.fetch_page(old_root_id)?;
            let page = guard.read();
            let only_child = (!page.is_leaf_node() && page.node_size() == 1)
                .then(|| page.internal_child_at(0));
            (page.is_leaf_node(), page.node_size(), only_child)
        };
        if let Some(child) = only_child {
            {
                let guard = self.bpm.fetch_page(child)?;
                guard.write().set_node_parent(INVALID_PAGE_ID);
            }
            *root = child;
            self.update_root_page_id(child)?;
            self.bpm.delete_page(old_root_id)?;
        } else if is_leaf && size == 0 {
            *root = INVALID_PAGE_ID;
            self.update_root_page_id(INVALID_PAGE_ID)?;
            self.bpm.delete_page(old_root_id)?;
        }
        Ok(())
    }

    /// Walks the whole tree asserting the structural invariants: key
    /// order inside nodes, size bounds, parent pointers, and separators
    /// equal to subtree minimums. Intended for tests.
    pub fn verify_integrity(&self) -> DbResult<()> {
        let root = self.root_page_id.lock().unwrap();
        if *root == INVALID_PAGE_ID {
            return Ok(());
        }
        self.verify_node(*root, true, INVALID_PAGE_ID)?;
        Ok(())
    }

    fn verify_node(&self, page_id: PageId, is_root: bool, expected_parent: PageId) -> DbResult<()> {
        let (is_leaf, size, children) = {
            let guard = self.bpm.fetch_page(page_id)?;
            let page = guard.read();
            assert_eq!(page.node_parent(), expected_parent, "bad parent pointer");
            let size = page.node_size();
            if !is_root {
                assert!(
                    size >= page.node_min_size() && size <= page.node_max_size(),
                    "node {page_id} size {size} out of bounds"
                );
            }
            if page.is_leaf_node() {
                for i in 1..size {
                    assert!(
                        self.comparator
                            .compare(page.leaf_key_at(i - 1), page.leaf_key_at(i))
                            .is_lt(),
                        "leaf {page_id} keys out of order"
                    );
                }
                (true, size, Vec::new())
            } else {
                if is_root {
                    assert!(size >= 2, "internal root {page_id} with fewer than 2 children");
                }
                for i in 1..size {
                    assert!(
                        self.comparator
                            .compare(page.internal_key_at(i - 1), page.internal_key_at(i))
                            .is_lt(),
                        "internal {page_id} separators out of order"
                    );
                }
                let children: Vec<(PageId, Vec<u8>)> = (0..size)
                    .map(|i| (page.internal_child_at(i), page.internal_key_at(i).to_vec()))
                    .collect();
                (false, size, children)
            }
        };
        debug_assert!(size <= self.internal_max_size.max(self.leaf_max_size));
        if is_leaf {
            return Ok(());
        }
        for (child, separator) in children {
            let min = self.subtree_min_key(child)?;
            assert_eq!(
                self.comparator.compare(&separator, &min),
                std::cmp::Ordering::Equal,
                "separator for child {child} is not its subtree minimum"
            );
            self.verify_node(child, false, page_id)?;
        }
        Ok(())
    }
}
