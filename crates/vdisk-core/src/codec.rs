//! Byte-slice codec for on-disk structures.
//!
//! Every record across the supported image and partition formats is a table
//! of fixed offsets into a byte slice; these helpers are the only place the
//! endianness and string encodings are spelled out. All functions are total
//! over slices of sufficient length and fail with [`VdError::SliceTooShort`]
//! otherwise.

use uuid::Uuid;

use crate::{Result, VdError};

fn slice_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset.checked_add(len).ok_or(VdError::OffsetOverflow)?;
    buf.get(offset..end).ok_or(VdError::SliceTooShort {
        needed: end,
        actual: buf.len(),
    })
}

fn slice_at_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8]> {
    let end = offset.checked_add(len).ok_or(VdError::OffsetOverflow)?;
    let actual = buf.len();
    buf.get_mut(offset..end).ok_or(VdError::SliceTooShort {
        needed: end,
        actual,
    })
}

macro_rules! int_codec {
    ($read_le:ident, $write_le:ident, $read_be:ident, $write_be:ident, $ty:ty, $size:expr) => {
        pub fn $read_le(buf: &[u8], offset: usize) -> Result<$ty> {
            let bytes: [u8; $size] = slice_at(buf, offset, $size)?.try_into().unwrap();
            Ok(<$ty>::from_le_bytes(bytes))
        }

        pub fn $write_le(buf: &mut [u8], offset: usize, value: $ty) -> Result<()> {
            slice_at_mut(buf, offset, $size)?.copy_from_slice(&value.to_le_bytes());
            Ok(())
        }

        pub fn $read_be(buf: &[u8], offset: usize) -> Result<$ty> {
            let bytes: [u8; $size] = slice_at(buf, offset, $size)?.try_into().unwrap();
            Ok(<$ty>::from_be_bytes(bytes))
        }

        pub fn $write_be(buf: &mut [u8], offset: usize, value: $ty) -> Result<()> {
            slice_at_mut(buf, offset, $size)?.copy_from_slice(&value.to_be_bytes());
            Ok(())
        }
    };
}

int_codec!(read_u16_le, write_u16_le, read_u16_be, write_u16_be, u16, 2);
int_codec!(read_u32_le, write_u32_le, read_u32_be, write_u32_be, u32, 4);
int_codec!(read_u64_le, write_u64_le, read_u64_be, write_u64_be, u64, 8);
int_codec!(read_i16_le, write_i16_le, read_i16_be, write_i16_be, i16, 2);
int_codec!(read_i32_le, write_i32_le, read_i32_be, write_i32_be, i32, 4);
int_codec!(read_i64_le, write_i64_le, read_i64_be, write_i64_be, i64, 8);

pub fn read_u8(buf: &[u8], offset: usize) -> Result<u8> {
    Ok(slice_at(buf, offset, 1)?[0])
}

pub fn write_u8(buf: &mut [u8], offset: usize, value: u8) -> Result<()> {
    slice_at_mut(buf, offset, 1)?[0] = value;
    Ok(())
}

pub fn read_bytes<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    Ok(slice_at(buf, offset, N)?.try_into().unwrap())
}

pub fn write_bytes(buf: &mut [u8], offset: usize, value: &[u8]) -> Result<()> {
    slice_at_mut(buf, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

/// Read a GUID in the Microsoft mixed encoding: the first three fields are
/// little-endian, the final eight bytes raw.
pub fn read_guid_mixed(buf: &[u8], offset: usize) -> Result<Uuid> {
    let raw: [u8; 16] = read_bytes(buf, offset)?;
    let mut be = raw;
    be[0..4].reverse();
    be[4..6].reverse();
    be[6..8].reverse();
    Ok(Uuid::from_bytes(be))
}

pub fn write_guid_mixed(buf: &mut [u8], offset: usize, value: Uuid) -> Result<()> {
    let mut raw = *value.as_bytes();
    raw[0..4].reverse();
    raw[4..6].reverse();
    raw[6..8].reverse();
    write_bytes(buf, offset, &raw)
}

/// Read a GUID stored as sixteen raw big-endian bytes.
pub fn read_guid_be(buf: &[u8], offset: usize) -> Result<Uuid> {
    Ok(Uuid::from_bytes(read_bytes(buf, offset)?))
}

pub fn write_guid_be(buf: &mut [u8], offset: usize, value: Uuid) -> Result<()> {
    write_bytes(buf, offset, value.as_bytes())
}

fn decode_utf16(units: impl Iterator<Item = u16>, strip_nuls: bool) -> Result<String> {
    let mut collected: Vec<u16> = units.collect();
    if strip_nuls {
        if let Some(nul) = collected.iter().position(|&u| u == 0) {
            collected.truncate(nul);
        }
    }
    char::decode_utf16(collected.into_iter())
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| VdError::Corrupt("invalid utf-16 sequence"))
}

/// Read `byte_len` bytes of UTF-16LE at `offset`. When `strip_nuls` is set
/// the string is cut at the first NUL code unit (fixed, NUL-padded slots).
pub fn read_utf16_le(buf: &[u8], offset: usize, byte_len: usize, strip_nuls: bool) -> Result<String> {
    if byte_len % 2 != 0 {
        return Err(VdError::Corrupt("utf-16 field with odd byte length"));
    }
    let raw = slice_at(buf, offset, byte_len)?;
    decode_utf16(
        raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])),
        strip_nuls,
    )
}

pub fn read_utf16_be(buf: &[u8], offset: usize, byte_len: usize, strip_nuls: bool) -> Result<String> {
    if byte_len % 2 != 0 {
        return Err(VdError::Corrupt("utf-16 field with odd byte length"));
    }
    let raw = slice_at(buf, offset, byte_len)?;
    decode_utf16(
        raw.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])),
        strip_nuls,
    )
}

/// Write `value` as UTF-16LE into a fixed slot of `slot_byte_len` bytes,
/// zero-padding the remainder. Fails with `SliceTooShort` when the encoded
/// string does not fit the slot.
pub fn write_utf16_le(buf: &mut [u8], offset: usize, slot_byte_len: usize, value: &str) -> Result<()> {
    let slot = slice_at_mut(buf, offset, slot_byte_len)?;
    slot.fill(0);
    let mut pos = 0usize;
    for unit in value.encode_utf16() {
        if pos + 2 > slot.len() {
            return Err(VdError::SliceTooShort {
                needed: pos + 2,
                actual: slot.len(),
            });
        }
        slot[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
        pos += 2;
    }
    Ok(())
}

pub fn write_utf16_be(buf: &mut [u8], offset: usize, slot_byte_len: usize, value: &str) -> Result<()> {
    let slot = slice_at_mut(buf, offset, slot_byte_len)?;
    slot.fill(0);
    let mut pos = 0usize;
    for unit in value.encode_utf16() {
        if pos + 2 > slot.len() {
            return Err(VdError::SliceTooShort {
                needed: pos + 2,
                actual: slot.len(),
            });
        }
        slot[pos..pos + 2].copy_from_slice(&unit.to_be_bytes());
        pos += 2;
    }
    Ok(())
}

/// Read a four-byte Latin-1 tag (platform codes and similar magic slots).
pub fn read_latin1_tag(buf: &[u8], offset: usize) -> Result<String> {
    let raw = slice_at(buf, offset, 4)?;
    Ok(raw.iter().map(|&b| b as char).collect())
}

/// Write a four-character Latin-1 tag. The tag must be exactly four
/// characters, each representable in Latin-1.
pub fn write_latin1_tag(buf: &mut [u8], offset: usize, tag: &str) -> Result<()> {
    let mut raw = [0u8; 4];
    let mut chars = tag.chars();
    for slot in raw.iter_mut() {
        let c = chars.next().ok_or(VdError::Corrupt("tag shorter than 4 chars"))?;
        let code = c as u32;
        if code > 0xFF {
            return Err(VdError::Corrupt("tag character outside latin-1"));
        }
        *slot = code as u8;
    }
    if chars.next().is_some() {
        return Err(VdError::Corrupt("tag longer than 4 chars"));
    }
    write_bytes(buf, offset, &raw)
}
