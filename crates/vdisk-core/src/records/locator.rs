use crate::codec;
use crate::ondisk::OnDiskRecord;
use crate::{Result, VdError};

/// Platform code for a Windows relative path, stored as UTF-16LE.
pub const PLATFORM_CODE_WINDOWS_RELATIVE: &str = "W2ru";
/// Platform code for a Windows absolute path, stored as UTF-16LE.
pub const PLATFORM_CODE_WINDOWS_ABSOLUTE: &str = "W2ku";

pub const PARENT_LOCATOR_SIZE: usize = 24;

/// Parent-locator record: a platform tag plus the location of the
/// platform-specific path bytes elsewhere in the image file.
///
/// Big-endian, 24 bytes:
/// `[0..4]` platform code (Latin-1), `[4..8]` reserved space in the file,
/// `[8..12]` meaningful data length, `[12..16]` reserved, `[16..24]`
/// absolute file offset of the path bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentLocatorEntry {
    pub platform_code: String,
    pub platform_data_space: u32,
    pub platform_data_length: u32,
    pub platform_data_offset: i64,
}

impl ParentLocatorEntry {
    /// Whether the referenced path bytes are UTF-16LE (both Windows codes).
    pub fn is_utf16le_path(&self) -> bool {
        self.platform_code == PLATFORM_CODE_WINDOWS_RELATIVE
            || self.platform_code == PLATFORM_CODE_WINDOWS_ABSOLUTE
    }
}

impl OnDiskRecord for ParentLocatorEntry {
    fn size_bytes(&self) -> usize {
        PARENT_LOCATOR_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < PARENT_LOCATOR_SIZE {
            return Err(VdError::SliceTooShort {
                needed: PARENT_LOCATOR_SIZE,
                actual: buf.len(),
            });
        }
        self.platform_code = codec::read_latin1_tag(buf, 0)?;
        self.platform_data_space = codec::read_u32_be(buf, 4)?;
        self.platform_data_length = codec::read_u32_be(buf, 8)?;
        self.platform_data_offset = codec::read_i64_be(buf, 16)?;
        if self.platform_data_length > self.platform_data_space {
            return Err(VdError::Corrupt("locator data length exceeds its space"));
        }
        Ok(PARENT_LOCATOR_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < PARENT_LOCATOR_SIZE {
            return Err(VdError::SliceTooShort {
                needed: PARENT_LOCATOR_SIZE,
                actual: buf.len(),
            });
        }
        buf[..PARENT_LOCATOR_SIZE].fill(0);
        codec::write_latin1_tag(buf, 0, &self.platform_code)?;
        codec::write_u32_be(buf, 4, self.platform_data_space)?;
        codec::write_u32_be(buf, 8, self.platform_data_length)?;
        codec::write_i64_be(buf, 16, self.platform_data_offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::decode;

    #[test]
    fn parses_reference_record() {
        let raw: [u8; 24] = [
            0x57, 0x32, 0x72, 0x75, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x00,
        ];
        let (entry, consumed) = decode::<ParentLocatorEntry>(&raw).unwrap();
        assert_eq!(consumed, 24);
        assert_eq!(entry.platform_code, "W2ru");
        assert_eq!(entry.platform_data_space, 512);
        assert_eq!(entry.platform_data_length, 100);
        assert_eq!(entry.platform_data_offset, 0x1800);
        assert!(entry.is_utf16le_path());
    }

    #[test]
    fn round_trips() {
        let entry = ParentLocatorEntry {
            platform_code: PLATFORM_CODE_WINDOWS_ABSOLUTE.to_string(),
            platform_data_space: 1024,
            platform_data_length: 60,
            platform_data_offset: 0x2400,
        };
        let mut buf = [0u8; 24];
        entry.write_to(&mut buf).unwrap();
        let (back, consumed) = decode::<ParentLocatorEntry>(&buf).unwrap();
        assert_eq!(consumed, entry.size_bytes());
        assert_eq!(back, entry);
    }

    #[test]
    fn rejects_length_beyond_space() {
        let entry = ParentLocatorEntry {
            platform_code: PLATFORM_CODE_WINDOWS_RELATIVE.to_string(),
            platform_data_space: 16,
            platform_data_length: 32,
            platform_data_offset: 0,
        };
        let mut buf = [0u8; 24];
        entry.write_to(&mut buf).unwrap();
        assert!(matches!(
            decode::<ParentLocatorEntry>(&buf).unwrap_err(),
            VdError::Corrupt(_)
        ));
    }
}
