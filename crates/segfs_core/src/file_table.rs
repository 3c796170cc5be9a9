//! In-memory state of regular files: dirty blocks and the dirty-file list.
//!
//! Files live in an arena of slots indexed by inode number. Membership in
//! the dirty-file list is a flag on the slot, so a file dropped while queued
//! simply leaves an empty slot behind. The table is guarded by the state
//! lock; each file's blocks by the file's own lock.

use crate::types::Ino;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub(crate) type FileHandle = Arc<Mutex<FileState>>;

#[derive(Debug, Clone)]
pub(crate) struct DirtyBlock {
    pub(crate) data: Arc<Vec<u8>>,
    /// When the block was last dirtied, in per-file write order.
    pub(crate) order: u64,
}

/// Page-cache state of one regular file.
#[derive(Debug)]
pub(crate) struct FileState {
    pub(crate) ino: Ino,
    pub(crate) size: u64,
    pub(crate) dirty: BTreeMap<u64, DirtyBlock>,
    /// Blocks taken by the running construction.
    pub(crate) in_flight: BTreeMap<u64, DirtyBlock>,
    pub(crate) attr_dirty: bool,
    pub(crate) in_flight_attr: bool,
    pub(crate) removed: bool,
    pub(crate) evict_requested: bool,
    next_order: u64,
}

/// Blocks of one file taken by a construction.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotFile {
    pub(crate) handle: FileHandle,
    pub(crate) ino: Ino,
    pub(crate) size: u64,
    /// `(blkoff, data)` in the order the blocks were dirtied.
    pub(crate) blocks: Vec<(u64, Arc<Vec<u8>>)>,
    pub(crate) removed: bool,
}

impl FileState {
    pub(crate) fn new(ino: Ino, size: u64) -> Self {
        Self {
            ino,
            size,
            dirty: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            attr_dirty: false,
            in_flight_attr: false,
            removed: false,
            evict_requested: false,
            next_order: 0,
        }
    }

    /// Stores a block; returns true if it was not dirty before.
    pub(crate) fn write_block(&mut self, blkoff: u64, data: Vec<u8>) -> bool {
        let order = self.next_order;
        self.next_order += 1;
        self.dirty
            .insert(
                blkoff,
                DirtyBlock {
                    data: Arc::new(data),
                    order,
                },
            )
            .is_none()
    }

    /// The newest cached version of a block.
    pub(crate) fn cached(&self, blkoff: u64) -> Option<Arc<Vec<u8>>> {
        self.dirty
            .get(&blkoff)
            .or_else(|| self.in_flight.get(&blkoff))
            .map(|b| Arc::clone(&b.data))
    }

    pub(crate) fn has_dirty(&self) -> bool {
        !self.dirty.is_empty() || self.attr_dirty
    }

    pub(crate) fn is_clean(&self) -> bool {
        !self.has_dirty() && self.in_flight.is_empty() && !self.in_flight_attr
    }

    /// Moves dirty blocks in `range` (all of them for `None`) to the
    /// in-flight set and returns them.
    pub(crate) fn take(&mut self, handle: &FileHandle, range: Option<(u64, u64)>) -> SnapshotFile {
        let keys: Vec<u64> = match range {
            Some((first, last)) if first > last => Vec::new(),
            Some((first, last)) => self.dirty.range(first..=last).map(|(k, _)| *k).collect(),
            None => self.dirty.keys().copied().collect(),
        };
        let mut blocks: Vec<(u64, DirtyBlock)> = keys
            .into_iter()
            .filter_map(|k| self.dirty.remove(&k).map(|b| (k, b)))
            .collect();
        blocks.sort_by_key(|(_, b)| b.order);
        for (blkoff, block) in &blocks {
            self.in_flight.insert(*blkoff, block.clone());
        }
        if range.is_none() {
            self.in_flight_attr = std::mem::take(&mut self.attr_dirty);
        }
        SnapshotFile {
            handle: Arc::clone(handle),
            ino: self.ino,
            size: self.size,
            blocks: blocks
                .into_iter()
                .map(|(blkoff, b)| (blkoff, b.data))
                .collect(),
            removed: self.removed,
        }
    }

    /// The construction reached the device.
    pub(crate) fn finish(&mut self) {
        self.in_flight.clear();
        self.in_flight_attr = false;
    }

    /// The construction failed: in-flight blocks become dirty again unless
    /// rewritten meanwhile. Returns how many blocks were put back.
    pub(crate) fn restore(&mut self) -> u64 {
        let mut restored = 0;
        for (blkoff, block) in std::mem::take(&mut self.in_flight) {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.dirty.entry(blkoff) {
                slot.insert(block);
                restored += 1;
            }
        }
        self.attr_dirty |= std::mem::take(&mut self.in_flight_attr);
        restored
    }
}

#[derive(Debug)]
struct Slot {
    handle: FileHandle,
    on_dirty_list: bool,
}

/// Arena of file states plus the dirty-file list.
#[derive(Debug, Default)]
pub(crate) struct FileTable {
    slots: Vec<Option<Slot>>,
    index: HashMap<Ino, usize>,
    free: Vec<usize>,
    dirty: Vec<usize>,
    ndirty_blocks: u64,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, ino: Ino) -> Option<FileHandle> {
        let slot = self.index.get(&ino)?;
        self.slots[*slot].as_ref().map(|s| Arc::clone(&s.handle))
    }

    /// Returns the state of `ino`, creating it with `size` if absent.
    pub(crate) fn get_or_insert(&mut self, ino: Ino, size: u64) -> FileHandle {
        if let Some(handle) = self.get(ino) {
            return handle;
        }
        let handle = Arc::new(Mutex::new(FileState::new(ino, size)));
        let slot = Slot {
            handle: Arc::clone(&handle),
            on_dirty_list: false,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(ino, idx);
        handle
    }

    /// Queues `ino` on the dirty-file list.
    pub(crate) fn mark_dirty(&mut self, ino: Ino) {
        let Some(idx) = self.index.get(&ino).copied() else {
            return;
        };
        if let Some(slot) = self.slots[idx].as_mut() {
            if !slot.on_dirty_list {
                slot.on_dirty_list = true;
                self.dirty.push(idx);
            }
        }
    }

    pub(crate) fn add_dirty_blocks(&mut self, count: u64) {
        self.ndirty_blocks += count;
    }

    /// Forgets `count` dirty blocks that were discarded before any
    /// construction took them.
    pub(crate) fn sub_dirty_blocks(&mut self, count: u64) {
        self.ndirty_blocks = self.ndirty_blocks.saturating_sub(count);
    }

    /// Dirty blocks not yet taken by a construction.
    pub(crate) fn ndirty_blocks(&self) -> u64 {
        self.ndirty_blocks
    }

    pub(crate) fn has_dirty_files(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Drains the dirty-file list, taking every dirty block.
    pub(crate) fn snapshot_all(&mut self) -> Vec<SnapshotFile> {
        let mut out = Vec::with_capacity(self.dirty.len());
        for idx in std::mem::take(&mut self.dirty) {
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            slot.on_dirty_list = false;
            let handle = Arc::clone(&slot.handle);
            let snap = handle.lock().take(&handle, None);
            self.ndirty_blocks = self.ndirty_blocks.saturating_sub(snap.blocks.len() as u64);
            out.push(snap);
        }
        out
    }

    /// Takes the dirty blocks of `ino` in `[first, last]`, leaving the file
    /// queued if anything else of it is still dirty.
    pub(crate) fn snapshot_range(&mut self, ino: Ino, first: u64, last: u64) -> Vec<SnapshotFile> {
        let Some(handle) = self.get(ino) else {
            return Vec::new();
        };
        let mut file = handle.lock();
        let snap = file.take(&handle, Some((first, last)));
        let still_dirty = file.has_dirty();
        drop(file);
        self.ndirty_blocks = self.ndirty_blocks.saturating_sub(snap.blocks.len() as u64);
        if !still_dirty {
            if let Some(idx) = self.index.get(&ino).copied() {
                self.dirty.retain(|i| *i != idx);
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.on_dirty_list = false;
                }
            }
        }
        if snap.blocks.is_empty() {
            Vec::new()
        } else {
            vec![snap]
        }
    }

    /// Drops the slot of `ino` if the file is clean and nobody needs it.
    pub(crate) fn drop_if_clean(&mut self, ino: Ino) -> bool {
        let Some(idx) = self.index.get(&ino).copied() else {
            return false;
        };
        let droppable = self.slots[idx].as_ref().is_some_and(|slot| {
            let file = slot.handle.lock();
            !slot.on_dirty_list && file.is_clean() && (file.evict_requested || file.removed)
        });
        if droppable {
            self.slots[idx] = None;
            self.index.remove(&ino);
            self.free.push(idx);
        }
        droppable
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}
