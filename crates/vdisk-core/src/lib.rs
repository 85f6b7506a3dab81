//! Core primitives for layered virtual disk images.
//!
//! Disk image formats differ wildly in their on-disk metadata but share the
//! same skeleton: byte-exact records at fixed offsets, sparse byte streams
//! that know which ranges are stored, differencing overlays stacked over a
//! base, and run-length extent maps from logical offsets to device ranges.
//! This crate provides that skeleton:
//!
//! - [`codec`]: endian-explicit integers, GUIDs, UTF-16 and Latin-1 slots
//! - [`OnDiskRecord`]: the read-from/write-to contract of on-disk records
//! - [`SparseStream`]: random-access streams with stored-range enumeration
//! - [`LayeredStream`]: copy-on-write stacking of same-length streams
//! - [`ExtentStream`]: extent-mapped reads with spill into an overflow index
//! - [`TracingStream`]: operation recording for replay and debugging
//!
//! Format modules stay pure offset tables; host integration (file lookup,
//! chain resolution) lives in `vdisk-chain`.

pub mod codec;
pub mod records;

mod cancel;
mod error;
mod extent;
mod layered;
mod ondisk;
mod stream;
mod trace;
mod util;

pub use cancel::CancelToken;
pub use error::{Result, VdError};
pub use extent::{
    parse_packed_extents, ExtentDescriptor, ExtentStream, ForkData, NoOverflow,
    OverflowExtentSource, INLINE_EXTENT_COUNT,
};
pub use layered::LayeredStream;
pub use ondisk::{decode, OnDiskRecord};
pub use stream::{
    add_extent, clip_extents, union_extents, MemSparseStream, Ownership, SparseStream,
    StreamExtent,
};
pub use trace::{TraceActivity, TraceRecord, TracingStream};
pub use util::{align_up_u64, checked_range, div_ceil_u64};
