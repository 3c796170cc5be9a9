//! Segment buffers, the log writer and the log reader.
//!
//! A construction fills one or more [`SegmentBuffer`]s, each of which
//! becomes one partial segment on disk. [`LogCursor`] tracks where the
//! next partial segment starts and which segment the log continues in;
//! [`LogReader`] walks partial segments back from the device.

mod buffer;
mod cursor;
mod reader;
mod writer;

pub(crate) use buffer::{BlockSource, BufferFull, PayloadBlock, SegmentBuffer};
pub(crate) use cursor::LogCursor;
pub use reader::{LogReader, LoggedBlock, PartialSegment};
pub(crate) use writer::LogWriter;
