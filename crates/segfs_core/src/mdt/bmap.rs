//! Two-level direct block map.
//!
//! Root pointer `i` addresses node block `i`; node block `i` holds one
//! pointer per block offset in `[i * P, (i + 1) * P)` where `P` is
//! `block_size / 8`. Whether pointers are physical block numbers or virtual
//! block numbers is up to the owner.

use crate::error::{CoreError, CoreResult};
use crate::layout::{get_u64, put_u64, InodeRecord, NROOTS};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub(crate) struct Bmap {
    ppn: u64,
    roots: [u64; NROOTS],
    nodes: BTreeMap<usize, Vec<u64>>,
    dirty: BTreeSet<usize>,
    collected: BTreeSet<usize>,
    nblocks: u64,
}

impl Bmap {
    pub(crate) fn new(pointers_per_node: u64) -> Self {
        Self {
            ppn: pointers_per_node,
            roots: [0; NROOTS],
            nodes: BTreeMap::new(),
            dirty: BTreeSet::new(),
            collected: BTreeSet::new(),
            nblocks: 0,
        }
    }

    /// Loads every node referenced by `record`, reading through `read_node`.
    pub(crate) fn load(
        record: &InodeRecord,
        pointers_per_node: u64,
        read_node: &mut dyn FnMut(u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Self> {
        let mut bmap = Self::new(pointers_per_node);
        bmap.roots = record.roots;
        for (idx, root) in record.roots.iter().enumerate() {
            if *root == 0 {
                continue;
            }
            let bytes = read_node(*root)?;
            let node = bmap.decode_node(&bytes);
            bmap.nblocks += node.iter().filter(|p| **p != 0).count() as u64;
            bmap.nodes.insert(idx, node);
        }
        Ok(bmap)
    }

    fn decode_node(&self, bytes: &[u8]) -> Vec<u64> {
        (0..self.ppn as usize).map(|i| get_u64(bytes, i * 8)).collect()
    }

    fn locate(&self, blkoff: u64) -> CoreResult<(usize, usize)> {
        let idx = blkoff / self.ppn;
        if idx >= NROOTS as u64 {
            return Err(CoreError::FileTooLarge { blkoff });
        }
        Ok((idx as usize, (blkoff % self.ppn) as usize))
    }

    pub(crate) fn lookup(&self, blkoff: u64) -> Option<u64> {
        let (idx, slot) = self.locate(blkoff).ok()?;
        self.nodes
            .get(&idx)
            .map(|node| node[slot])
            .filter(|ptr| *ptr != 0)
    }

    /// Points `blkoff` at `ptr`, returning the previous pointer.
    pub(crate) fn set(&mut self, blkoff: u64, ptr: u64) -> CoreResult<Option<u64>> {
        let (idx, slot) = self.locate(blkoff)?;
        let ppn = self.ppn as usize;
        let node = self.nodes.entry(idx).or_insert_with(|| vec![0; ppn]);
        let old = std::mem::replace(&mut node[slot], ptr);
        match (old, ptr) {
            (0, p) if p != 0 => self.nblocks += 1,
            (o, 0) if o != 0 => self.nblocks -= 1,
            _ => {}
        }
        self.dirty.insert(idx);
        Ok(Some(old).filter(|p| *p != 0))
    }

    /// Makes sure the node covering `blkoff` exists and marks it dirty.
    ///
    /// Used when a pointer in that node will be assigned later in the
    /// running construction.
    pub(crate) fn touch(&mut self, blkoff: u64) -> CoreResult<usize> {
        let (idx, _) = self.locate(blkoff)?;
        let ppn = self.ppn as usize;
        self.nodes.entry(idx).or_insert_with(|| vec![0; ppn]);
        self.dirty.insert(idx);
        Ok(idx)
    }

    /// Index of the node covering `blkoff`.
    pub(crate) fn node_of(&self, blkoff: u64) -> usize {
        (blkoff / self.ppn) as usize
    }

    /// Unmaps `blkoff`, returning the pointer it had.
    pub(crate) fn clear(&mut self, blkoff: u64) -> Option<u64> {
        self.lookup(blkoff)?;
        self.set(blkoff, 0).ok().flatten()
    }

    pub(crate) fn nblocks(&self) -> u64 {
        self.nblocks
    }

    pub(crate) fn roots(&self) -> [u64; NROOTS] {
        self.roots
    }

    pub(crate) fn root(&self, idx: usize) -> u64 {
        self.roots[idx]
    }

    pub(crate) fn set_root(&mut self, idx: usize, ptr: u64) {
        self.roots[idx] = ptr;
    }

    /// Indices of nodes that exist.
    #[cfg(test)]
    pub(crate) fn node_indices(&self) -> Vec<usize> {
        self.nodes.keys().copied().collect()
    }

    /// Every mapped `(blkoff, ptr)` pair in offset order.
    pub(crate) fn mapped(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::with_capacity(self.nblocks as usize);
        for (idx, node) in &self.nodes {
            for (slot, ptr) in node.iter().enumerate() {
                if *ptr != 0 {
                    out.push((*idx as u64 * self.ppn + slot as u64, *ptr));
                }
            }
        }
        out
    }

    /// Encoded content of node `idx`.
    pub(crate) fn node_bytes(&self, idx: usize, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        if let Some(node) = self.nodes.get(&idx) {
            for (slot, ptr) in node.iter().enumerate() {
                put_u64(&mut buf, slot * 8, *ptr);
            }
        }
        buf
    }

    pub(crate) fn mark_node_dirty(&mut self, idx: usize) {
        if self.nodes.contains_key(&idx) {
            self.dirty.insert(idx);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_node_dirty(&self, idx: usize) -> bool {
        self.dirty.contains(&idx)
    }

    /// Dirty nodes not yet collected by the running construction.
    pub(crate) fn uncollected_nodes(&self) -> Vec<usize> {
        self.dirty.difference(&self.collected).copied().collect()
    }

    pub(crate) fn mark_node_collected(&mut self, idx: usize) {
        self.collected.insert(idx);
    }

    pub(crate) fn is_node_collected(&self, idx: usize) -> bool {
        self.collected.contains(&idx)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Installs a node read back from the log during roll-forward.
    pub(crate) fn install_node(&mut self, idx: usize, root: u64, bytes: &[u8]) {
        if idx >= NROOTS {
            return;
        }
        let node = self.decode_node(bytes);
        let before = self
            .nodes
            .get(&idx)
            .map_or(0, |n| n.iter().filter(|p| **p != 0).count() as u64);
        let after = node.iter().filter(|p| **p != 0).count() as u64;
        self.nblocks = self.nblocks - before + after;
        self.nodes.insert(idx, node);
        self.roots[idx] = root;
        self.dirty.insert(idx);
    }

    /// Collected nodes are now on disk.
    pub(crate) fn finish_construction(&mut self) {
        for idx in std::mem::take(&mut self.collected) {
            self.dirty.remove(&idx);
        }
    }

    pub(crate) fn forget_collection(&mut self) {
        self.collected.clear();
    }

    /// Fills the map fields of an inode record.
    pub(crate) fn fill_record(&self, record: &mut InodeRecord) {
        record.roots = self.roots;
        record.nblocks = self.nblocks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_lookup_clear() {
        let mut bmap = Bmap::new(128);
        assert_eq!(bmap.set(5, 77).unwrap(), None);
        assert_eq!(bmap.set(300, 78).unwrap(), None);
        assert_eq!(bmap.lookup(5), Some(77));
        assert_eq!(bmap.lookup(6), None);
        assert_eq!(bmap.nblocks(), 2);
        assert_eq!(bmap.node_indices(), vec![0, 2]);
        assert_eq!(bmap.set(5, 99).unwrap(), Some(77));
        assert_eq!(bmap.clear(5), Some(99));
        assert_eq!(bmap.nblocks(), 1);
        assert_eq!(bmap.mapped(), vec![(300, 78)]);
    }

    #[test]
    fn offsets_past_the_last_root_are_rejected() {
        let mut bmap = Bmap::new(128);
        let max = 128 * NROOTS as u64;
        assert!(bmap.set(max - 1, 1).is_ok());
        assert!(matches!(
            bmap.set(max, 1),
            Err(CoreError::FileTooLarge { .. })
        ));
        assert_eq!(bmap.lookup(max), None);
    }

    #[test]
    fn touch_creates_a_dirty_node() {
        let mut bmap = Bmap::new(128);
        assert_eq!(bmap.touch(130).unwrap(), 1);
        assert!(bmap.is_node_dirty(1));
        assert_eq!(bmap.node_of(130), 1);
        assert_eq!(bmap.lookup(130), None);
        assert_eq!(bmap.nblocks(), 0);
    }

    #[test]
    fn dirty_and_collected_tracking() {
        let mut bmap = Bmap::new(128);
        bmap.set(1, 10).unwrap();
        bmap.set(200, 11).unwrap();
        assert_eq!(bmap.uncollected_nodes(), vec![0, 1]);
        bmap.mark_node_collected(0);
        assert_eq!(bmap.uncollected_nodes(), vec![1]);
        bmap.finish_construction();
        assert!(!bmap.is_node_dirty(0));
        assert!(bmap.is_node_dirty(1));
    }

    #[test]
    fn load_reads_nodes_through_callback() {
        let mut src = Bmap::new(128);
        src.set(3, 42).unwrap();
        src.set_root(0, 900);
        let bytes = src.node_bytes(0, 1024);
        let mut record = InodeRecord::default();
        src.fill_record(&mut record);

        let mut reads = Vec::new();
        let loaded = Bmap::load(&record, 128, &mut |ptr| {
            reads.push(ptr);
            Ok(bytes.clone())
        })
        .unwrap();
        assert_eq!(reads, vec![900]);
        assert_eq!(loaded.lookup(3), Some(42));
        assert_eq!(loaded.nblocks(), 1);
        assert!(!loaded.is_dirty());
    }
}
