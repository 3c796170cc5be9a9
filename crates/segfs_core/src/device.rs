//! Block-granular access to the storage backend.

use crate::error::{CoreError, CoreResult};
use crate::layout::{Geometry, SuperBlock, SB_BYTES};
use crate::types::BlockNr;
use parking_lot::Mutex;
use segfs_storage::StorageBackend;
use tracing::warn;

/// The log device: a storage backend addressed in blocks.
///
/// Only the segment constructor writes to it; readers (foreground reads,
/// recovery, the cleaner) share it through the internal lock.
pub struct BlockDevice {
    backend: Mutex<Box<dyn StorageBackend>>,
    geometry: Geometry,
}

impl std::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl BlockDevice {
    /// Wraps a backend whose geometry is already known.
    pub fn new(backend: Box<dyn StorageBackend>, geometry: Geometry) -> Self {
        Self {
            backend: Mutex::new(backend),
            geometry,
        }
    }

    /// Reads both superblock copies of an unmounted backend.
    ///
    /// # Errors
    ///
    /// Returns an error only if the device size cannot be determined; damaged
    /// copies are reported per slot.
    pub fn probe(backend: &dyn StorageBackend) -> CoreResult<[CoreResult<SuperBlock>; 2]> {
        let size = backend.size()?;
        if size < (2 * SB_BYTES) as u64 {
            return Err(CoreError::invalid_format(format!(
                "device of {size} bytes is too small"
            )));
        }
        let [primary, secondary] = SuperBlock::locations(size);
        let read = |offset: u64| -> CoreResult<SuperBlock> {
            let bytes = backend.read_at(offset, SB_BYTES)?;
            SuperBlock::decode(&bytes)
        };
        Ok([read(primary), read(secondary)])
    }

    /// Opens a formatted device with the geometry of its newest valid
    /// superblock.
    ///
    /// Also returns the valid superblock copies, newest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if neither copy is valid.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<(Self, Vec<SuperBlock>)> {
        let mut candidates: Vec<SuperBlock> = Vec::new();
        for (slot, copy) in Self::probe(backend.as_ref())?.into_iter().enumerate() {
            match copy {
                Ok(sb) => candidates.push(sb),
                Err(err) => {
                    warn!(target: "segfs::recovery", slot, error = %err, "superblock copy unusable");
                }
            }
        }
        candidates.sort_by(|a, b| b.generation.cmp(&a.generation));
        let newest = candidates
            .first()
            .ok_or_else(|| CoreError::invalid_format("no valid superblock"))?;
        let geometry = newest.geometry()?;
        Ok((Self::new(backend, geometry), candidates))
    }

    /// Device geometry.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Reads `count` consecutive blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the device or the read fails.
    pub fn read_blocks(&self, start: BlockNr, count: u64) -> CoreResult<Vec<u8>> {
        let len = count as usize * self.geometry.block_bytes();
        let bytes = self
            .backend
            .lock()
            .read_at(self.geometry.byte_offset(start), len)?;
        Ok(bytes)
    }

    /// Reads one block.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is outside the device or the read fails.
    pub fn read_block(&self, blocknr: BlockNr) -> CoreResult<Vec<u8>> {
        self.read_blocks(blocknr, 1)
    }

    /// Writes whole blocks starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not block aligned or the write fails.
    pub fn write_blocks(&self, start: BlockNr, data: &[u8]) -> CoreResult<()> {
        if data.len() % self.geometry.block_bytes() != 0 {
            return Err(CoreError::invalid_operation(format!(
                "write of {} bytes is not block aligned",
                data.len()
            )));
        }
        self.backend
            .lock()
            .write_at(self.geometry.byte_offset(start), data)?;
        Ok(())
    }

    /// Writes one superblock copy (`slot` 0 or 1) and syncs.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn write_superblock(&self, slot: usize, sb: &SuperBlock) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let locations = SuperBlock::locations(backend.size()?);
        backend.write_at(locations[slot % 2], &sb.encode())?;
        backend.sync()?;
        Ok(())
    }

    /// Makes every completed write durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to sync.
    pub fn sync(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cno;
    use segfs_storage::InMemoryBackend;

    fn sb(generation: u64) -> SuperBlock {
        SuperBlock {
            state: 0,
            block_size: 1024,
            blocks_per_segment: 16,
            nsegments: 4,
            crc_seed: 1,
            reserved_segments_percent: 0,
            last_pseg: 1,
            last_seq: generation,
            last_cno: Cno::new(1),
            wtime: 0,
            generation,
        }
    }

    #[test]
    fn block_io_round_trip() {
        let geo = Geometry::new(1024, 16, 4).unwrap();
        let dev = BlockDevice::new(
            Box::new(InMemoryBackend::with_size(geo.device_bytes() as usize)),
            geo,
        );
        let data = vec![7u8; 2048];
        dev.write_blocks(5, &data).unwrap();
        assert_eq!(dev.read_blocks(5, 2).unwrap(), data);
        assert!(dev.write_blocks(5, &[1, 2, 3]).is_err());
        assert!(dev.read_block(geo.device_blocks()).is_err());
    }

    #[test]
    fn probe_reads_both_copies() {
        let geo = Geometry::new(1024, 16, 4).unwrap();
        let backend = InMemoryBackend::with_size(geo.device_bytes() as usize);
        let view = backend.share();
        let dev = BlockDevice::new(Box::new(backend), geo);
        dev.write_superblock(0, &sb(1)).unwrap();
        dev.write_superblock(1, &sb(2)).unwrap();

        let [a, b] = BlockDevice::probe(&view).unwrap();
        assert_eq!(a.unwrap().generation, 1);
        assert_eq!(b.unwrap().generation, 2);

        view.flip_byte(10);
        let [a, b] = BlockDevice::probe(&view).unwrap();
        assert!(a.is_err());
        assert!(b.is_ok());
    }
}
