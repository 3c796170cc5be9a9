//! Property-based workload generators using proptest.
//!
//! A workload is a list of [`Op`]s over a fixed set of files. [`Model`]
//! tracks what each file holds in memory and what is durable, so a test
//! can crash at any point and compare the recovered filesystem against
//! the model.

use crate::fixtures::pattern;
use proptest::prelude::*;
use segfs_core::{CoreResult, Filesystem, Ino};
use std::collections::BTreeMap;

/// One step of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Overwrites block `blkoff` of file `file` with `pattern(seed)`.
    Write {
        /// Index into the workload's files.
        file: usize,
        /// Block offset.
        blkoff: u64,
        /// Pattern seed.
        seed: u8,
    },
    /// Makes one file's data durable.
    Fsync {
        /// Index into the workload's files.
        file: usize,
    },
    /// Writes everything dirty without a checkpoint.
    Flush,
    /// Writes a checkpoint.
    Sync,
}

/// Strategy for one operation over `files` files of up to `max_blocks`
/// blocks.
pub fn op_strategy(files: usize, max_blocks: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..files, 0..max_blocks, any::<u8>())
            .prop_map(|(file, blkoff, seed)| Op::Write { file, blkoff, seed }),
        2 => (0..files).prop_map(|file| Op::Fsync { file }),
        1 => Just(Op::Flush),
        1 => Just(Op::Sync),
    ]
}

/// Strategy for workloads of up to `len` operations.
pub fn workload_strategy(files: usize, max_blocks: u64, len: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(files, max_blocks), 1..len)
}

/// Expected content of a set of files.
#[derive(Debug, Clone, Default)]
pub struct Model {
    files: Vec<Ino>,
    block_size: usize,
    current: Vec<BTreeMap<u64, u8>>,
    durable: Vec<BTreeMap<u64, u8>>,
}

impl Model {
    /// A model of `files`, all empty and durable.
    pub fn new(files: Vec<Ino>, block_size: usize) -> Self {
        let n = files.len();
        Self {
            files,
            block_size,
            current: vec![BTreeMap::new(); n],
            durable: vec![BTreeMap::new(); n],
        }
    }

    /// The files of the workload.
    pub fn files(&self) -> &[Ino] {
        &self.files
    }

    /// Applies `op` to the filesystem and the model.
    ///
    /// # Errors
    ///
    /// Returns the filesystem's error; the model is left unchanged then.
    pub fn apply(&mut self, fs: &Filesystem, op: Op) -> CoreResult<()> {
        match op {
            Op::Write { file, blkoff, seed } => {
                fs.write_block(self.files[file], blkoff, &pattern(self.block_size, seed))?;
                self.current[file].insert(blkoff, seed);
            }
            Op::Fsync { file } => {
                fs.fsync(self.files[file])?;
                self.durable[file] = self.current[file].clone();
            }
            Op::Flush => {
                fs.request_construction(false)?.wait()?;
                self.durable = self.current.clone();
            }
            Op::Sync => {
                fs.sync()?;
                self.durable = self.current.clone();
            }
        }
        Ok(())
    }

    /// Forgets everything that was not durable, as a crash does.
    pub fn crash(&mut self) {
        self.current = self.durable.clone();
    }

    /// Compares every modelled block with the filesystem.
    ///
    /// Returns a description of the first difference.
    pub fn check(&self, fs: &Filesystem) -> Result<(), String> {
        for (index, ino) in self.files.iter().enumerate() {
            for (&blkoff, &seed) in &self.current[index] {
                let got = fs
                    .read_block(*ino, blkoff)
                    .map_err(|e| format!("{ino} block {blkoff}: {e}"))?;
                if got != pattern(self.block_size, seed) {
                    return Err(format!(
                        "{ino} block {blkoff}: expected pattern {seed}, found {:?}",
                        &got[..8.min(got.len())]
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn workloads_stay_in_range() {
        let mut runner = TestRunner::default();
        for _ in 0..32 {
            let ops = workload_strategy(3, 5, 20)
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert!(!ops.is_empty());
            for op in ops {
                match op {
                    Op::Write { file, blkoff, .. } => {
                        assert!(file < 3);
                        assert!(blkoff < 5);
                    }
                    Op::Fsync { file } => assert!(file < 3),
                    Op::Flush | Op::Sync => {}
                }
            }
        }
    }

    #[test]
    fn crash_rewinds_to_durable_state() {
        let mut model = Model::new(vec![Ino::new(11), Ino::new(12)], 16);
        model.current[0].insert(0, 1);
        model.current[1].insert(0, 2);
        model.durable[0] = model.current[0].clone();
        model.crash();
        assert_eq!(model.current[0].get(&0), Some(&1));
        assert!(model.current[1].is_empty());
    }
}
