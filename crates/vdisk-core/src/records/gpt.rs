use uuid::Uuid;

use crate::codec;
use crate::ondisk::OnDiskRecord;
use crate::{Result, VdError};

pub const GPT_ENTRY_SIZE: usize = 128;

const NAME_SLOT_BYTES: usize = 72; // 36 UTF-16LE code units

const TYPE_EFI_SYSTEM: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
const TYPE_BIOS_BOOT: Uuid = Uuid::from_u128(0x21686148_6449_6E6F_744E_656564454649);
const TYPE_MICROSOFT_RESERVED: Uuid = Uuid::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE);
const TYPE_MICROSOFT_BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
const TYPE_LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);
const TYPE_LINUX_SWAP: Uuid = Uuid::from_u128(0x0657FD6D_A4AB_43C4_84E5_0933C84B4F4F);

/// One 128-byte partition entry from a GUID partition table.
///
/// Little-endian layout: type GUID, unique GUID (both mixed encoding),
/// first/last LBA, attribute flags, then a 36-code-unit NUL-padded UTF-16LE
/// name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GptEntry {
    pub partition_type: Uuid,
    pub identity: Uuid,
    pub first_lba: i64,
    pub last_lba: i64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    /// True for the all-zero entry used to pad unallocated table slots.
    pub fn is_unused(&self) -> bool {
        self.partition_type.is_nil()
    }

    /// Display name for well-known partition type GUIDs; unknown types
    /// render as the GUID itself.
    pub fn friendly_type(&self) -> String {
        const KNOWN: &[(Uuid, &str)] = &[
            (TYPE_EFI_SYSTEM, "EFI System"),
            (TYPE_BIOS_BOOT, "BIOS Boot"),
            (TYPE_MICROSOFT_RESERVED, "Microsoft Reserved"),
            (TYPE_MICROSOFT_BASIC_DATA, "Microsoft Basic Data"),
            (TYPE_LINUX_FILESYSTEM, "Linux Filesystem"),
            (TYPE_LINUX_SWAP, "Linux Swap"),
        ];
        if self.partition_type.is_nil() {
            return "Unused".to_string();
        }
        for (guid, name) in KNOWN {
            if *guid == self.partition_type {
                return (*name).to_string();
            }
        }
        self.partition_type.to_string().to_uppercase()
    }
}

impl OnDiskRecord for GptEntry {
    fn size_bytes(&self) -> usize {
        GPT_ENTRY_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() < GPT_ENTRY_SIZE {
            return Err(VdError::SliceTooShort {
                needed: GPT_ENTRY_SIZE,
                actual: buf.len(),
            });
        }
        self.partition_type = codec::read_guid_mixed(buf, 0)?;
        self.identity = codec::read_guid_mixed(buf, 16)?;
        self.first_lba = codec::read_i64_le(buf, 32)?;
        self.last_lba = codec::read_i64_le(buf, 40)?;
        self.attributes = codec::read_u64_le(buf, 48)?;
        self.name = codec::read_utf16_le(buf, 56, NAME_SLOT_BYTES, true)?;
        Ok(GPT_ENTRY_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < GPT_ENTRY_SIZE {
            return Err(VdError::SliceTooShort {
                needed: GPT_ENTRY_SIZE,
                actual: buf.len(),
            });
        }
        buf[..GPT_ENTRY_SIZE].fill(0);
        codec::write_guid_mixed(buf, 0, self.partition_type)?;
        codec::write_guid_mixed(buf, 16, self.identity)?;
        codec::write_i64_le(buf, 32, self.first_lba)?;
        codec::write_i64_le(buf, 40, self.last_lba)?;
        codec::write_u64_le(buf, 48, self.attributes)?;
        codec::write_utf16_le(buf, 56, NAME_SLOT_BYTES, &self.name)?;
        Ok(())
    }
}
