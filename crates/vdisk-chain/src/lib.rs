//! Parent-chain resolution for differencing disk images.
//!
//! A differencing image stores only the blocks changed relative to a
//! parent, found at open time through the parent-locator hints recorded in
//! the child and verified by its 128-bit identity. This crate provides:
//!
//! - [`FileLocator`]: the host capability for finding chain members
//! - [`ImageFile`] / [`VdkImage`]: the layer abstraction and the native
//!   block-allocated format
//! - [`DiskChain`]: the resolver, with explicit per-layer [`Ownership`]
//!   tags so a parent shared between chains is never closed twice
//!
//! The resolved chain exposes one `LayeredStream` whose reads fall through
//! to the deepest ancestor holding each block.
//!
//! [`Ownership`]: vdisk_core::Ownership

mod image;
mod locator;
mod resolver;

pub use image::{
    ChsGeometry, ImageContentStream, ImageFile, VdkCreateParams, VdkHeader, VdkImage,
    VdkParentRef, HEADER_SIZE,
};
pub use locator::{FileAccess, FileLocator, MemFileLocator, SharedByteStream};
pub use resolver::{ChainLayer, DiskChain, OpenImage, VdkOpener};
