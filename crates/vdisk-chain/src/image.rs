//! The native block-allocated image format and the layer abstraction the
//! chain resolver works against.

use std::cell::RefCell;
use std::rc::Rc;

use uuid::Uuid;

use vdisk_core::records::{ParentLocatorEntry, PLATFORM_CODE_WINDOWS_RELATIVE};
use vdisk_core::{
    align_up_u64, checked_range, codec, decode, div_ceil_u64, OnDiskRecord, Result, SparseStream,
    StreamExtent, VdError,
};

const MAGIC: &[u8; 8] = b"VDKIMG\0\0";
const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 512;
const SECTOR_SIZE: u64 = 512;

const LOCATOR_TABLE_OFFSET: usize = 96;
const MAX_LOCATORS: usize = 4;
// Fixed region reserved for parent locator path bytes in differencing
// images, placed between the allocation table and the data area.
const LOCATOR_DATA_RESERVE: u64 = 1024;

// Hard cap to avoid absurd allocations when opening untrusted images.
const MAX_TABLE_BYTES: u64 = 128 * 1024 * 1024;

const ZERO_BUF: [u8; 4096] = [0; 4096];

/// One differencing- or base-image layer that a chain can stack.
///
/// Content offsets are capacity-relative; unallocated ranges read as zero
/// and fall through to the next layer when stacked.
pub trait ImageFile {
    fn unique_id(&self) -> Uuid;

    /// Zero when the image is self-contained.
    fn parent_unique_id(&self) -> Uuid;

    fn needs_parent(&self) -> bool {
        !self.parent_unique_id().is_nil()
    }

    fn capacity_bytes(&self) -> u64;

    fn block_size(&self) -> u32;

    /// Candidate parent paths, in the order they should be tried.
    fn parent_location_hints(&self) -> Vec<String>;

    fn full_path(&self) -> String;

    fn can_write(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Release the underlying file stream. Idempotent.
    fn close(&mut self);

    fn read_content(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_content(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn content_extents(&self) -> Result<Vec<StreamExtent>>;

    fn flush(&mut self) -> Result<()>;
}

/// Cylinder/head/sector geometry advertised to legacy BIOS consumers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChsGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl ChsGeometry {
    /// Standard ATA translation of a byte capacity, the one virtual disk
    /// formats agree on so guests see a stable geometry.
    pub fn from_capacity(capacity: u64) -> Self {
        let total_sectors = (capacity / SECTOR_SIZE).min(65535 * 16 * 255);

        let (sectors_per_track, heads, cylinder_times_heads);
        if total_sectors >= 65535 * 16 * 63 {
            sectors_per_track = 255u64;
            heads = 16u64;
            cylinder_times_heads = total_sectors / sectors_per_track;
        } else {
            let mut spt = 17u64;
            let mut cth = total_sectors / spt;
            let mut h = (cth + 1023) / 1024;
            if h < 4 {
                h = 4;
            }
            if cth >= h * 1024 || h > 16 {
                spt = 31;
                h = 16;
                cth = total_sectors / spt;
            }
            if cth >= h * 1024 {
                spt = 63;
                h = 16;
                cth = total_sectors / spt;
            }
            sectors_per_track = spt;
            heads = h;
            cylinder_times_heads = cth;
        }

        Self {
            cylinders: (cylinder_times_heads / heads) as u16,
            heads: heads as u8,
            sectors_per_track: sectors_per_track as u8,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors_per_track as u64
    }
}

/// Header of the native format.
///
/// Little-endian, 512 bytes: magic, version, block size, capacity,
/// allocation-table offset/entries, data offset, allocated-block count,
/// the image and parent identities (mixed-endian GUID slots), optional
/// CHS geometry, and up to four parent-locator records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VdkHeader {
    pub block_size: u32,
    pub capacity: u64,
    pub table_entries: u64,
    pub data_offset: u64,
    pub allocated_blocks: u64,
    pub unique_id: Uuid,
    pub parent_unique_id: Uuid,
    pub geometry: Option<ChsGeometry>,
    pub locators: Vec<ParentLocatorEntry>,
}

impl VdkHeader {
    pub fn block_size_u64(&self) -> u64 {
        self.block_size as u64
    }

    fn table_bytes(&self) -> Result<u64> {
        self.table_entries
            .checked_mul(8)
            .ok_or(VdError::OffsetOverflow)
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(MAGIC);
        codec::write_u32_le(&mut out, 8, VERSION)?;
        codec::write_u32_le(&mut out, 12, self.block_size)?;
        codec::write_u64_le(&mut out, 16, self.capacity)?;
        codec::write_u64_le(&mut out, 24, HEADER_SIZE as u64)?;
        codec::write_u64_le(&mut out, 32, self.table_entries)?;
        codec::write_u64_le(&mut out, 40, self.data_offset)?;
        codec::write_u64_le(&mut out, 48, self.allocated_blocks)?;
        codec::write_guid_mixed(&mut out, 56, self.unique_id)?;
        codec::write_guid_mixed(&mut out, 72, self.parent_unique_id)?;
        codec::write_u32_le(&mut out, 88, self.locators.len() as u32)?;
        if let Some(geometry) = self.geometry {
            codec::write_u16_le(&mut out, 92, geometry.cylinders)?;
            codec::write_u8(&mut out, 94, geometry.heads)?;
            codec::write_u8(&mut out, 95, geometry.sectors_per_track)?;
        }
        for (i, locator) in self.locators.iter().enumerate() {
            locator.write_to(&mut out[LOCATOR_TABLE_OFFSET + i * 24..])?;
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(VdError::SliceTooShort {
                needed: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if &bytes[0..8] != MAGIC {
            return Err(VdError::Corrupt("bad image magic"));
        }
        if codec::read_u32_le(bytes, 8)? != VERSION {
            return Err(VdError::NotSupported("image version"));
        }
        let block_size = codec::read_u32_le(bytes, 12)?;
        let capacity = codec::read_u64_le(bytes, 16)?;
        let table_offset = codec::read_u64_le(bytes, 24)?;
        let table_entries = codec::read_u64_le(bytes, 32)?;
        let data_offset = codec::read_u64_le(bytes, 40)?;
        let allocated_blocks = codec::read_u64_le(bytes, 48)?;
        let unique_id = codec::read_guid_mixed(bytes, 56)?;
        let parent_unique_id = codec::read_guid_mixed(bytes, 72)?;
        let locator_count = codec::read_u32_le(bytes, 88)? as usize;
        let cylinders = codec::read_u16_le(bytes, 92)?;
        let heads = codec::read_u8(bytes, 94)?;
        let sectors_per_track = codec::read_u8(bytes, 95)?;
        let geometry = if cylinders == 0 && heads == 0 && sectors_per_track == 0 {
            None
        } else if cylinders == 0 || heads == 0 || sectors_per_track == 0 {
            return Err(VdError::Corrupt("partial disk geometry"));
        } else {
            Some(ChsGeometry {
                cylinders,
                heads,
                sectors_per_track,
            })
        };

        let block_size_u64 = block_size as u64;
        if block_size == 0
            || !block_size.is_power_of_two()
            || !block_size_u64.is_multiple_of(SECTOR_SIZE)
        {
            return Err(VdError::Corrupt("invalid block size"));
        }
        if capacity == 0 || !capacity.is_multiple_of(SECTOR_SIZE) {
            return Err(VdError::Corrupt("invalid capacity"));
        }
        if table_offset != HEADER_SIZE as u64 {
            return Err(VdError::Corrupt("unexpected allocation table offset"));
        }
        if table_entries != div_ceil_u64(capacity, block_size_u64)? {
            return Err(VdError::Corrupt("unexpected allocation table size"));
        }
        let table_bytes = table_entries
            .checked_mul(8)
            .ok_or(VdError::OffsetOverflow)?;
        if table_bytes > MAX_TABLE_BYTES {
            return Err(VdError::NotSupported("allocation table too large"));
        }
        if allocated_blocks > table_entries {
            return Err(VdError::Corrupt("allocated blocks exceed table size"));
        }
        if unique_id.is_nil() {
            return Err(VdError::Corrupt("image identity is zero"));
        }
        if locator_count > MAX_LOCATORS {
            return Err(VdError::Corrupt("too many parent locators"));
        }
        if parent_unique_id.is_nil() && locator_count != 0 {
            return Err(VdError::Corrupt("parent locators without a parent"));
        }

        let locator_reserve = if parent_unique_id.is_nil() {
            0
        } else {
            LOCATOR_DATA_RESERVE
        };
        let table_end = (HEADER_SIZE as u64)
            .checked_add(table_bytes)
            .ok_or(VdError::OffsetOverflow)?;
        let expected_data_offset = align_up_u64(
            table_end
                .checked_add(locator_reserve)
                .ok_or(VdError::OffsetOverflow)?,
            block_size_u64,
        )?;
        if data_offset != expected_data_offset {
            return Err(VdError::Corrupt("unexpected data offset"));
        }

        let mut locators = Vec::with_capacity(locator_count);
        for i in 0..locator_count {
            let (entry, _) =
                decode::<ParentLocatorEntry>(&bytes[LOCATOR_TABLE_OFFSET + i * 24..])?;
            let offset = u64::try_from(entry.platform_data_offset)
                .map_err(|_| VdError::Corrupt("negative locator data offset"))?;
            let end = offset
                .checked_add(entry.platform_data_space as u64)
                .ok_or(VdError::OffsetOverflow)?;
            if offset < table_end || end > data_offset {
                return Err(VdError::Corrupt("locator data outside its reserve"));
            }
            locators.push(entry);
        }

        Ok(Self {
            block_size,
            capacity,
            table_entries,
            data_offset,
            allocated_blocks,
            unique_id,
            parent_unique_id,
            geometry,
            locators,
        })
    }
}

/// Reference to the parent a differencing image is created against.
#[derive(Clone, Debug)]
pub struct VdkParentRef {
    pub unique_id: Uuid,
    /// `(platform code, path)` pairs, written as parent locators in order.
    pub locators: Vec<(String, String)>,
}

/// Parameters for creating a new image.
#[derive(Clone, Debug)]
pub struct VdkCreateParams {
    pub capacity: u64,
    pub block_size: u32,
    /// Generated when absent.
    pub unique_id: Option<Uuid>,
    pub geometry: Option<ChsGeometry>,
    pub parent: Option<VdkParentRef>,
}

impl VdkCreateParams {
    pub fn base(capacity: u64, block_size: u32) -> Self {
        Self {
            capacity,
            block_size,
            unique_id: None,
            geometry: None,
            parent: None,
        }
    }

    /// A differencing image whose parent is recorded under relative-path
    /// locators, tried in order at open time.
    pub fn differencing(
        capacity: u64,
        block_size: u32,
        parent_unique_id: Uuid,
        parent_hints: Vec<String>,
    ) -> Self {
        Self {
            capacity,
            block_size,
            unique_id: None,
            geometry: None,
            parent: Some(VdkParentRef {
                unique_id: parent_unique_id,
                locators: parent_hints
                    .into_iter()
                    .map(|path| (PLATFORM_CODE_WINDOWS_RELATIVE.to_string(), path))
                    .collect(),
            }),
        }
    }
}

/// A native-format image over a byte stream.
pub struct VdkImage {
    stream: Option<Box<dyn SparseStream>>,
    header: VdkHeader,
    table: Vec<u64>,
    hints: Vec<String>,
    path: String,
    writable: bool,
}

impl std::fmt::Debug for VdkImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdkImage")
            .field("stream", &self.stream.as_ref().map(|_| "<stream>"))
            .field("header", &self.header)
            .field("table", &self.table)
            .field("hints", &self.hints)
            .field("path", &self.path)
            .field("writable", &self.writable)
            .finish()
    }
}

impl VdkImage {
    /// Create a fresh image inside `stream` (truncating it) and return the
    /// opened handle.
    pub fn create(mut stream: Box<dyn SparseStream>, params: VdkCreateParams) -> Result<Self> {
        let block_size = params.block_size;
        let block_size_u64 = block_size as u64;
        if block_size == 0
            || !block_size.is_power_of_two()
            || !block_size_u64.is_multiple_of(SECTOR_SIZE)
        {
            return Err(VdError::NotSupported(
                "block size must be a power-of-two multiple of 512",
            ));
        }
        if params.capacity == 0 || !params.capacity.is_multiple_of(SECTOR_SIZE) {
            return Err(VdError::NotSupported(
                "capacity must be a non-zero multiple of 512",
            ));
        }

        let table_entries = div_ceil_u64(params.capacity, block_size_u64)?;
        let table_bytes = table_entries
            .checked_mul(8)
            .ok_or(VdError::OffsetOverflow)?;
        if table_bytes > MAX_TABLE_BYTES {
            return Err(VdError::NotSupported("allocation table too large"));
        }
        let table_end = (HEADER_SIZE as u64)
            .checked_add(table_bytes)
            .ok_or(VdError::OffsetOverflow)?;

        let (parent_unique_id, locator_specs) = match &params.parent {
            Some(parent) => {
                if parent.unique_id.is_nil() {
                    return Err(VdError::NotSupported("parent identity must be non-zero"));
                }
                if parent.locators.is_empty() || parent.locators.len() > MAX_LOCATORS {
                    return Err(VdError::NotSupported("between 1 and 4 parent locators required"));
                }
                (parent.unique_id, parent.locators.as_slice())
            }
            None => (Uuid::nil(), &[] as &[(String, String)]),
        };

        let locator_reserve = if parent_unique_id.is_nil() {
            0
        } else {
            LOCATOR_DATA_RESERVE
        };
        let data_offset = align_up_u64(
            table_end
                .checked_add(locator_reserve)
                .ok_or(VdError::OffsetOverflow)?,
            block_size_u64,
        )?;

        // Lay the locator path bytes out sequentially in the reserve.
        let mut locators = Vec::with_capacity(locator_specs.len());
        let mut locator_data: Vec<(u64, Vec<u8>)> = Vec::with_capacity(locator_specs.len());
        let mut cursor = table_end;
        for (platform_code, path) in locator_specs {
            let mut encoded = Vec::with_capacity(path.len() * 2);
            for unit in path.encode_utf16() {
                encoded.extend_from_slice(&unit.to_le_bytes());
            }
            let space = encoded.len() as u64;
            if cursor + space > table_end + locator_reserve {
                return Err(VdError::NotSupported("parent locator paths too long"));
            }
            locators.push(ParentLocatorEntry {
                platform_code: platform_code.clone(),
                platform_data_space: space as u32,
                platform_data_length: encoded.len() as u32,
                platform_data_offset: cursor as i64,
            });
            locator_data.push((cursor, encoded));
            cursor += space;
        }

        let header = VdkHeader {
            block_size,
            capacity: params.capacity,
            table_entries,
            data_offset,
            allocated_blocks: 0,
            unique_id: params.unique_id.unwrap_or_else(Uuid::new_v4),
            parent_unique_id,
            geometry: params.geometry,
            locators,
        };

        stream.set_len(data_offset)?;
        stream.write_all_at(0, &header.encode()?)?;
        for (offset, encoded) in &locator_data {
            stream.write_all_at(*offset, encoded)?;
        }
        stream.flush()?;

        let table_entries_usize: usize = table_entries
            .try_into()
            .map_err(|_| VdError::NotSupported("allocation table too large"))?;
        let mut table = Vec::new();
        table
            .try_reserve_exact(table_entries_usize)
            .map_err(|_| VdError::NotSupported("allocation table too large"))?;
        table.resize(table_entries_usize, 0);

        let hints = locator_specs
            .iter()
            .map(|(_, path)| path.clone())
            .collect();
        Ok(Self {
            stream: Some(stream),
            header,
            table,
            hints,
            path: String::new(),
            writable: true,
        })
    }

    /// Open an existing image, validating the header and the allocation
    /// table before any content access.
    pub fn open(mut stream: Box<dyn SparseStream>, path: &str) -> Result<Self> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        stream
            .read_exact_at(0, &mut header_bytes)
            .map_err(|err| match err {
                VdError::Io(_) | VdError::OutOfBounds { .. } => {
                    VdError::Corrupt("image header truncated")
                }
                other => other,
            })?;
        let header = VdkHeader::decode(&header_bytes)?;

        let block_size = header.block_size_u64();
        let table_bytes = header.table_bytes()?;
        let table_entries_usize: usize = header
            .table_entries
            .try_into()
            .map_err(|_| VdError::NotSupported("allocation table too large"))?;
        let table_bytes_usize: usize = table_bytes
            .try_into()
            .map_err(|_| VdError::NotSupported("allocation table too large"))?;

        let stream_len = stream.len();
        let expected_min_len = header
            .data_offset
            .checked_add(
                header
                    .allocated_blocks
                    .checked_mul(block_size)
                    .ok_or(VdError::OffsetOverflow)?,
            )
            .ok_or(VdError::OffsetOverflow)?;
        if stream_len < expected_min_len {
            return Err(VdError::Corrupt("allocated blocks extend beyond end of image"));
        }

        // Stream the allocation table without one full-size temporary.
        let mut table = Vec::new();
        table
            .try_reserve_exact(table_entries_usize)
            .map_err(|_| VdError::NotSupported("allocation table too large"))?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = HEADER_SIZE as u64;
        let mut remaining = table_bytes_usize;
        while remaining > 0 {
            let read_len = remaining.min(buf.len());
            stream
                .read_exact_at(offset, &mut buf[..read_len])
                .map_err(|err| match err {
                    VdError::Io(_) | VdError::OutOfBounds { .. } => {
                        VdError::Corrupt("allocation table truncated")
                    }
                    other => other,
                })?;
            for chunk in buf[..read_len].chunks_exact(8) {
                table.push(u64::from_le_bytes(chunk.try_into().unwrap()));
            }
            offset += read_len as u64;
            remaining -= read_len;
        }

        validate_table(&header, &table, expected_min_len)?;

        // Resolve locator records into path hints.
        let mut hints = Vec::with_capacity(header.locators.len());
        for locator in &header.locators {
            if !locator.is_utf16le_path() {
                continue;
            }
            let data_len = locator.platform_data_length as usize;
            let mut raw = vec![0u8; data_len];
            stream
                .read_exact_at(locator.platform_data_offset as u64, &mut raw)
                .map_err(|err| match err {
                    VdError::Io(_) | VdError::OutOfBounds { .. } => {
                        VdError::Corrupt("locator data truncated")
                    }
                    other => other,
                })?;
            hints.push(codec::read_utf16_le(&raw, 0, data_len, true)?);
        }

        tracing::debug!(
            path,
            unique_id = %header.unique_id,
            parent = %header.parent_unique_id,
            "image opened"
        );

        let writable = stream.can_write();
        Ok(Self {
            stream: Some(stream),
            header,
            table,
            hints,
            path: path.to_string(),
            writable,
        })
    }

    pub fn header(&self) -> &VdkHeader {
        &self.header
    }

    pub fn is_block_allocated(&self, block_idx: u64) -> bool {
        usize::try_from(block_idx)
            .ok()
            .and_then(|idx| self.table.get(idx))
            .is_some_and(|&phys| phys != 0)
    }

    fn stream_mut(&mut self) -> Result<&mut Box<dyn SparseStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| VdError::Io("image is closed".to_string()))
    }

    fn ensure_block_allocated(&mut self, block_idx: u64) -> Result<(u64, bool)> {
        let block_idx_usize: usize = block_idx
            .try_into()
            .map_err(|_| VdError::Corrupt("block index out of range"))?;
        let existing = *self
            .table
            .get(block_idx_usize)
            .ok_or(VdError::Corrupt("block index out of range"))?;
        if existing != 0 {
            return Ok((existing, true));
        }

        let block_size = self.header.block_size_u64();
        let phys = self
            .header
            .data_offset
            .checked_add(
                self.header
                    .allocated_blocks
                    .checked_mul(block_size)
                    .ok_or(VdError::OffsetOverflow)?,
            )
            .ok_or(VdError::OffsetOverflow)?;

        self.header.allocated_blocks += 1;
        self.table[block_idx_usize] = phys;

        // Persist the header and the one changed table entry immediately.
        let header_bytes = self.header.encode()?;
        let entry_offset = (HEADER_SIZE as u64)
            .checked_add(block_idx.checked_mul(8).ok_or(VdError::OffsetOverflow)?)
            .ok_or(VdError::OffsetOverflow)?;
        let end = phys
            .checked_add(block_size)
            .ok_or(VdError::OffsetOverflow)?;
        let stream = self.stream_mut()?;
        stream.write_all_at(0, &header_bytes)?;
        stream.write_all_at(entry_offset, &phys.to_le_bytes())?;
        if end > stream.len() {
            stream.set_len(end)?;
        }

        Ok((phys, false))
    }

    fn zero_block_range(&mut self, phys: u64, offset_in_block: usize, len: usize) -> Result<()> {
        let mut remaining = len;
        let mut offset = offset_in_block;
        while remaining > 0 {
            let chunk = remaining.min(ZERO_BUF.len());
            let stream = self.stream_mut()?;
            stream.write_all_at(phys + offset as u64, &ZERO_BUF[..chunk])?;
            offset += chunk;
            remaining -= chunk;
        }
        Ok(())
    }
}

fn validate_table(header: &VdkHeader, table: &[u64], expected_min_len: u64) -> Result<()> {
    let block_size = header.block_size_u64();
    let allocated_usize: usize = header
        .allocated_blocks
        .try_into()
        .map_err(|_| VdError::Corrupt("allocated blocks out of range"))?;

    let mut actual_allocated = 0u64;
    let mut seen = vec![0u64; allocated_usize.div_ceil(64)];
    for &phys in table {
        if phys == 0 {
            continue;
        }
        actual_allocated += 1;

        if phys < header.data_offset {
            return Err(VdError::Corrupt("data block before data region"));
        }
        let rel = phys - header.data_offset;
        if !rel.is_multiple_of(block_size) {
            return Err(VdError::Corrupt("misaligned data block offset"));
        }
        let phys_idx = rel / block_size;
        if phys_idx >= header.allocated_blocks {
            return Err(VdError::Corrupt("data block offset out of bounds"));
        }
        let phys_end = phys.checked_add(block_size).ok_or(VdError::OffsetOverflow)?;
        if phys_end > expected_min_len {
            return Err(VdError::Corrupt("data block offset out of bounds"));
        }

        let idx = phys_idx as usize;
        let mask = 1u64 << (idx % 64);
        let word = &mut seen[idx / 64];
        if *word & mask != 0 {
            return Err(VdError::Corrupt("duplicate data block offset"));
        }
        *word |= mask;
    }

    if actual_allocated != header.allocated_blocks {
        return Err(VdError::Corrupt("allocated blocks do not match table"));
    }
    Ok(())
}

impl ImageFile for VdkImage {
    fn unique_id(&self) -> Uuid {
        self.header.unique_id
    }

    fn parent_unique_id(&self) -> Uuid {
        self.header.parent_unique_id
    }

    fn capacity_bytes(&self) -> u64 {
        self.header.capacity
    }

    fn block_size(&self) -> u32 {
        self.header.block_size
    }

    fn parent_location_hints(&self) -> Vec<String> {
        self.hints.clone()
    }

    fn full_path(&self) -> String {
        self.path.clone()
    }

    fn can_write(&self) -> bool {
        self.writable && self.stream.is_some()
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(path = %self.path, "image closed");
        }
    }

    fn read_content(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.stream.is_none() {
            return Err(VdError::Io("image is closed".to_string()));
        }
        checked_range(offset, buf.len(), self.header.capacity)?;

        let block_size = self.header.block_size_u64();
        let block_size_usize = block_size as usize;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_idx = abs / block_size;
            let within = (abs % block_size) as usize;
            let chunk_len = (block_size_usize - within).min(buf.len() - pos);

            let block_idx_usize: usize = block_idx
                .try_into()
                .map_err(|_| VdError::Corrupt("block index out of range"))?;
            let phys = *self
                .table
                .get(block_idx_usize)
                .ok_or(VdError::Corrupt("block index out of range"))?;
            if phys == 0 {
                buf[pos..pos + chunk_len].fill(0);
            } else {
                self.stream_mut()?
                    .read_exact_at(phys + within as u64, &mut buf[pos..pos + chunk_len])?;
            }

            pos += chunk_len;
        }
        Ok(())
    }

    fn write_content(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.can_write() {
            return Err(VdError::NotWritable);
        }
        checked_range(offset, buf.len(), self.header.capacity)?;

        let block_size = self.header.block_size_u64();
        let block_size_usize = block_size as usize;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_idx = abs / block_size;
            let within = (abs % block_size) as usize;
            let chunk_len = (block_size_usize - within).min(buf.len() - pos);

            let (phys, existed) = self.ensure_block_allocated(block_idx)?;
            if !existed {
                if within > 0 {
                    self.zero_block_range(phys, 0, within)?;
                }
                let end = within + chunk_len;
                if end < block_size_usize {
                    self.zero_block_range(phys, end, block_size_usize - end)?;
                }
            }
            self.stream_mut()?
                .write_all_at(phys + within as u64, &buf[pos..pos + chunk_len])?;

            pos += chunk_len;
        }
        Ok(())
    }

    fn content_extents(&self) -> Result<Vec<StreamExtent>> {
        if self.stream.is_none() {
            return Err(VdError::Io("image is closed".to_string()));
        }
        let block_size = self.header.block_size_u64();
        let mut extents = Vec::new();
        for (idx, &phys) in self.table.iter().enumerate() {
            if phys == 0 {
                continue;
            }
            let start = idx as u64 * block_size;
            let length = block_size.min(self.header.capacity - start);
            vdisk_core::add_extent(&mut extents, StreamExtent::new(start, length));
        }
        Ok(extents)
    }

    fn flush(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.flush(),
            None => Ok(()),
        }
    }
}

/// Sparse content view over a shared image layer, suitable for stacking in
/// a layered stream.
pub struct ImageContentStream {
    image: Rc<RefCell<dyn ImageFile>>,
    position: u64,
    allow_write: bool,
}

impl ImageContentStream {
    /// `allow_write` gates writes regardless of the image's own access; a
    /// chain only lets its top layer through for writing.
    pub fn new(image: Rc<RefCell<dyn ImageFile>>, allow_write: bool) -> Self {
        Self {
            image,
            position: 0,
            allow_write,
        }
    }
}

impl SparseStream for ImageContentStream {
    fn len(&self) -> u64 {
        self.image.borrow().capacity_bytes()
    }

    fn can_write(&self) -> bool {
        self.allow_write && self.image.borrow().can_write()
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
        let len = self.len();
        let n = buf.len().min(len.saturating_sub(self.position) as usize);
        self.image
            .borrow_mut()
            .read_content(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.can_write() {
            return Err(VdError::NotWritable);
        }
        self.image.borrow_mut().write_content(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.image.borrow_mut().flush()
    }

    fn stored_extents(&mut self) -> Result<Vec<StreamExtent>> {
        self.image.borrow().content_extents()
    }
}
