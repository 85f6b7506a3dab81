//! Extent-mapped buffer: logical file offsets resolved to device ranges
//! through an in-band extent array with spill-over into a secondary index.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::ondisk::OnDiskRecord;
use crate::stream::{SparseStream, StreamExtent};
use crate::{CancelToken, Result, VdError};

/// Fixed capacity of the in-band extent array carried by a fork.
pub const INLINE_EXTENT_COUNT: usize = 8;

const EXTENT_DESCRIPTOR_SIZE: usize = 8;

// Overflow records are small; a modest cache absorbs repeated probes during
// sequential reads of heavily fragmented files.
const SPILL_CACHE_ENTRIES: usize = 32;

/// A contiguous run of blocks: `(start_block, block_count)`.
///
/// `block_count == 0` is a format-specific sentinel; the walk carries it
/// through without interpreting it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl OnDiskRecord for ExtentDescriptor {
    fn size_bytes(&self) -> usize {
        EXTENT_DESCRIPTOR_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize> {
        self.start_block = crate::codec::read_u32_be(buf, 0)?;
        self.block_count = crate::codec::read_u32_be(buf, 4)?;
        Ok(EXTENT_DESCRIPTOR_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        crate::codec::write_u32_be(buf, 0, self.start_block)?;
        crate::codec::write_u32_be(buf, 4, self.block_count)?;
        Ok(())
    }
}

/// Parse a packed array of 8-byte extent descriptors.
pub fn parse_packed_extents(raw: &[u8]) -> Result<Vec<ExtentDescriptor>> {
    if raw.len() % EXTENT_DESCRIPTOR_SIZE != 0 {
        return Err(VdError::Corrupt("overflow record size not a multiple of 8"));
    }
    let mut out = Vec::with_capacity(raw.len() / EXTENT_DESCRIPTOR_SIZE);
    let mut offset = 0usize;
    while offset < raw.len() {
        let (descriptor, consumed) = crate::ondisk::decode::<ExtentDescriptor>(&raw[offset..])?;
        out.push(descriptor);
        offset += consumed;
    }
    Ok(out)
}

/// A file's logical-to-physical map: in-band extents plus the key used to
/// reach its overflow records.
#[derive(Clone, Debug)]
pub struct ForkData {
    /// Identifier of the owning file, the first half of the spill key.
    pub file_id: u32,
    pub logical_size: u64,
    pub total_blocks: u64,
    pub extents: [ExtentDescriptor; INLINE_EXTENT_COUNT],
}

impl ForkData {
    pub fn new(file_id: u32, logical_size: u64, total_blocks: u64) -> Self {
        Self {
            file_id,
            logical_size,
            total_blocks,
            extents: [ExtentDescriptor::default(); INLINE_EXTENT_COUNT],
        }
    }
}

/// Secondary ordered index consulted once the in-band extent array is
/// exhausted. Returns the packed descriptors recorded under
/// `(file_id, start_block)`, or `None` when the index has no such record.
pub trait OverflowExtentSource {
    fn extents_for(&mut self, file_id: u32, start_block: u64) -> Result<Option<Vec<u8>>>;
}

/// An overflow source for forks whose in-band array covers every block.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoOverflow;

impl OverflowExtentSource for NoOverflow {
    fn extents_for(&mut self, _file_id: u32, _start_block: u64) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Read-only stream over a fork's logical bytes, issuing at most one device
/// read per extent crossed.
#[derive(Debug)]
pub struct ExtentStream<D, X> {
    device: D,
    overflow: X,
    fork: ForkData,
    block_size: u32,
    device_base: u64,
    position: u64,
    spill_cache: LruCache<u64, Vec<ExtentDescriptor>>,
}

impl<D: SparseStream, X: OverflowExtentSource> ExtentStream<D, X> {
    pub fn new(
        device: D,
        overflow: X,
        fork: ForkData,
        block_size: u32,
        device_base: u64,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(VdError::NotSupported("block size must be non-zero"));
        }
        let covered = fork
            .total_blocks
            .checked_mul(block_size as u64)
            .ok_or(VdError::OffsetOverflow)?;
        if fork.logical_size > covered {
            return Err(VdError::Corrupt("fork logical size exceeds its block allocation"));
        }
        let cache_entries = NonZeroUsize::new(SPILL_CACHE_ENTRIES)
            .ok_or(VdError::NotSupported("spill cache size is zero"))?;
        Ok(Self {
            device,
            overflow,
            fork,
            block_size,
            device_base,
            position: 0,
            spill_cache: LruCache::new(cache_entries),
        })
    }

    pub fn fork(&self) -> &ForkData {
        &self.fork
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn into_parts(self) -> (D, X) {
        (self.device, self.overflow)
    }

    /// Resolve the extent containing `logical_pos`, returning it together
    /// with the logical byte offset at which the extent begins.
    pub fn find_extent(&mut self, logical_pos: u64) -> Result<(ExtentDescriptor, u64)> {
        self.find_extent_inner(logical_pos, None)
    }

    fn find_extent_inner(
        &mut self,
        logical_pos: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<(ExtentDescriptor, u64)> {
        let block_size = self.block_size as u64;
        let block = logical_pos / block_size;

        let mut blocks_seen: u64 = 0;
        for extent in self.fork.extents {
            let count = extent.block_count as u64;
            if blocks_seen + count > block {
                let logical_start = blocks_seen
                    .checked_mul(block_size)
                    .ok_or(VdError::OffsetOverflow)?;
                return Ok((extent, logical_start));
            }
            blocks_seen += count;
        }

        while blocks_seen < self.fork.total_blocks {
            if let Some(token) = cancel {
                token.check()?;
            }
            let descriptors = self.spill_extents(blocks_seen)?;
            let mut advanced = false;
            for extent in descriptors {
                let count = extent.block_count as u64;
                if blocks_seen + count > block {
                    let logical_start = blocks_seen
                        .checked_mul(block_size)
                        .ok_or(VdError::OffsetOverflow)?;
                    return Ok((extent, logical_start));
                }
                if count > 0 {
                    advanced = true;
                }
                blocks_seen += count;
            }
            if !advanced {
                return Err(VdError::Corrupt("overflow record advances no blocks"));
            }
        }

        Err(VdError::BeyondEof)
    }

    fn spill_extents(&mut self, blocks_seen: u64) -> Result<Vec<ExtentDescriptor>> {
        if let Some(hit) = self.spill_cache.get(&blocks_seen) {
            return Ok(hit.clone());
        }
        let raw = self
            .overflow
            .extents_for(self.fork.file_id, blocks_seen)?
            .ok_or(VdError::MissingExtent {
                file_id: self.fork.file_id,
                blocks_seen,
            })?;
        let parsed = parse_packed_extents(&raw)?;
        tracing::trace!(
            file_id = self.fork.file_id,
            start_block = blocks_seen,
            descriptors = parsed.len(),
            "overflow index probe"
        );
        self.spill_cache.push(blocks_seen, parsed.clone());
        Ok(parsed)
    }

    fn read_inner(&mut self, buf: &mut [u8], cancel: Option<&CancelToken>) -> Result<usize> {
        let block_size = self.block_size as u64;
        let pos = self.position;
        let mut done = 0usize;

        while done < buf.len() {
            if let Some(token) = cancel {
                token.check()?;
            }
            let cur = pos + done as u64;
            let remaining = (buf.len() - done)
                .min(self.fork.logical_size.saturating_sub(cur) as usize);
            if remaining == 0 {
                break;
            }

            let (extent, extent_logical_start) = self.find_extent_inner(cur, cancel)?;
            let extent_offset = cur - extent_logical_start;
            let extent_size = (extent.block_count as u64)
                .checked_mul(block_size)
                .ok_or(VdError::OffsetOverflow)?;
            let to_read = (remaining as u64).min(extent_size - extent_offset);
            if to_read == 0 {
                // Progress guard: an internally inconsistent map can hand
                // back an extent with nothing left to read. Surface a short
                // read rather than spinning.
                break;
            }

            let device_offset = self
                .device_base
                .checked_add(
                    (extent.start_block as u64)
                        .checked_mul(block_size)
                        .ok_or(VdError::OffsetOverflow)?,
                )
                .and_then(|off| off.checked_add(extent_offset))
                .ok_or(VdError::OffsetOverflow)?;
            self.device
                .read_exact_at(device_offset, &mut buf[done..done + to_read as usize])?;
            done += to_read as usize;
        }

        self.position = pos + done as u64;
        Ok(done)
    }
}

impl<D: SparseStream, X: OverflowExtentSource> SparseStream for ExtentStream<D, X> {
    fn len(&self) -> u64 {
        self.fork.logical_size
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        if position > self.len() {
            return Err(VdError::OutOfBounds {
                offset: position,
                len: 0,
                capacity: self.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(buf, None)
    }

    fn read_with_cancel(&mut self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize> {
        self.read_inner(buf, Some(cancel))
    }

    fn stored_extents(&mut self) -> Result<Vec<StreamExtent>> {
        // The map is logically contiguous: each walked extent occupies the
        // next run of blocks, so coverage is a single prefix of the fork.
        let covered = self
            .fork
            .total_blocks
            .checked_mul(self.block_size as u64)
            .ok_or(VdError::OffsetOverflow)?
            .min(self.fork.logical_size);
        if covered == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![StreamExtent::new(0, covered)])
    }
}
