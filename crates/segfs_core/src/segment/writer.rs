//! Log writer.
//!
//! Renders a filled buffer into one contiguous image, seals its summary and
//! data checksums, and writes the images of a construction in log order.

use super::{BlockSource, SegmentBuffer};
use crate::device::BlockDevice;
use crate::error::{CoreError, CoreResult};
use crate::layout::{seal, Summary};
use crate::types::BlockNr;
use tracing::{debug, trace};

/// Turns filled segment buffers into sealed on-disk partial segments.
pub(crate) struct LogWriter<'a> {
    device: &'a BlockDevice,
    seed: u32,
}

impl<'a> LogWriter<'a> {
    pub(crate) fn new(device: &'a BlockDevice, seed: u32) -> Self {
        Self { device, seed }
    }

    /// Renders and seals the image of `buffer`.
    ///
    /// `resolve` supplies the content of metadata blocks, which is read
    /// from the caches only now that every address is assigned.
    pub(crate) fn render(
        &self,
        buffer: &SegmentBuffer,
        resolve: &mut dyn FnMut(&BlockSource) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Vec<u8>> {
        let bs = self.device.geometry().block_bytes();
        let summary = buffer.summary();
        let sumbytes = Summary::layout(&summary.files, bs).bytes();
        let mut image = summary.encode(bs);
        image.reserve(buffer.payload().len() * bs + bs);
        for block in buffer.payload() {
            let data = match &block.source {
                BlockSource::Captured(data) => data.as_ref().clone(),
                other => resolve(other)?,
            };
            if data.len() != bs {
                return Err(CoreError::protocol_violation(format!(
                    "payload block of {} is {} bytes",
                    block.ino,
                    data.len()
                )));
            }
            image.extend_from_slice(&data);
        }
        if let Some(super_root) = buffer.super_root() {
            image.extend_from_slice(super_root);
        }
        if image.len() as u64 != buffer.nblocks() * bs as u64 {
            return Err(CoreError::protocol_violation(format!(
                "partial segment at {} renders to {} bytes, expected {} blocks",
                buffer.start(),
                image.len(),
                buffer.nblocks()
            )));
        }
        seal(&mut image, sumbytes, self.seed);
        Ok(image)
    }

    /// Writes the images in log order and waits until they are durable.
    pub(crate) fn commit(&self, images: &[(BlockNr, Vec<u8>)]) -> CoreResult<u64> {
        let bs = self.device.geometry().block_bytes();
        let mut blocks = 0;
        for (start, image) in images {
            trace!(target: "segfs::log", start = *start, nblocks = image.len() / bs, "writing partial segment");
            self.device.write_blocks(*start, image)?;
            blocks += (image.len() / bs) as u64;
        }
        self.device.sync()?;
        debug!(target: "segfs::log", psegs = images.len(), blocks, "log committed");
        Ok(blocks)
    }
}
