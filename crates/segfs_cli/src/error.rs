//! CLI error types.

use thiserror::Error;

/// Errors raised by the CLI itself rather than by the filesystem.
#[derive(Debug, Error)]
pub enum CliError {
    /// The command needs `--image`.
    #[error("image path required for {0}")]
    ImageRequired(&'static str),

    /// The image did not pass verification.
    #[error("verification failed with {0} problem(s)")]
    VerificationFailed(usize),

    /// A requested segment is beyond the end of the device.
    #[error("segment {segment} out of range (image has {nsegments})")]
    SegmentOutOfRange {
        /// Requested segment.
        segment: u64,
        /// Segments on the image.
        nsegments: u64,
    },
}
