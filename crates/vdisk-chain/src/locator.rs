//! File-locator capability used to find and open the members of an image
//! chain.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use vdisk_core::{checked_range, Result, SparseStream, StreamExtent, VdError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileAccess {
    Read,
    ReadWrite,
}

/// Host capability for resolving the relative paths recorded in parent
/// locators. `resolve_absolute` is informational, used in error messages.
pub trait FileLocator {
    fn exists(&self, relative_path: &str) -> bool;

    fn open(&self, relative_path: &str, access: FileAccess) -> Result<Box<dyn SparseStream>>;

    fn resolve_absolute(&self, relative_path: &str) -> String;
}

/// Flat byte stream over a shared in-memory file.
///
/// The whole file counts as stored; writes may extend it, the way a plain
/// file grows. Every open handle shares the same bytes, so images written
/// through one handle are visible to later opens.
pub struct SharedByteStream {
    bytes: Rc<RefCell<Vec<u8>>>,
    position: u64,
    writable: bool,
}

impl SharedByteStream {
    pub fn new(bytes: Rc<RefCell<Vec<u8>>>, writable: bool) -> Self {
        Self {
            bytes,
            position: 0,
            writable,
        }
    }
}

impl SparseStream for SharedByteStream {
    fn len(&self) -> u64 {
        self.bytes.borrow().len() as u64
    }

    fn can_write(&self) -> bool {
        self.writable
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
        let bytes = self.bytes.borrow();
        let pos: usize = self.position.try_into().map_err(|_| VdError::OffsetOverflow)?;
        let n = buf.len().min(bytes.len().saturating_sub(pos));
        buf[..n].copy_from_slice(&bytes[pos..pos + n]);
        drop(bytes);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VdError::NotWritable);
        }
        let pos: usize = self.position.try_into().map_err(|_| VdError::OffsetOverflow)?;
        let end = pos.checked_add(buf.len()).ok_or(VdError::OffsetOverflow)?;
        let mut bytes = self.bytes.borrow_mut();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[pos..end].copy_from_slice(buf);
        drop(bytes);
        self.position += buf.len() as u64;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(VdError::NotResizable);
        }
        let len_usize: usize = len.try_into().map_err(|_| VdError::OffsetOverflow)?;
        self.bytes.borrow_mut().resize(len_usize, 0);
        self.position = self.position.min(len);
        Ok(())
    }

    fn stored_extents(&mut self) -> Result<Vec<StreamExtent>> {
        let len = self.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![StreamExtent::new(0, len)])
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len())?;
        self.set_position(offset)?;
        let n = self.read(buf)?;
        debug_assert_eq!(n, buf.len());
        Ok(())
    }
}

/// In-memory file-locator used by the test suites and by callers that
/// assemble chains without touching host storage.
#[derive(Default)]
pub struct MemFileLocator {
    files: RefCell<HashMap<String, Rc<RefCell<Vec<u8>>>>>,
}

impl MemFileLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty file and return a writable stream over it.
    pub fn create(&self, path: &str) -> Box<dyn SparseStream> {
        let bytes = Rc::new(RefCell::new(Vec::new()));
        self.files
            .borrow_mut()
            .insert(path.to_string(), bytes.clone());
        Box::new(SharedByteStream::new(bytes, true))
    }

    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), Rc::new(RefCell::new(bytes)));
    }

    /// Number of stream handles currently open on `path`.
    pub fn open_handles(&self, path: &str) -> usize {
        self.files
            .borrow()
            .get(path)
            .map(|rc| Rc::strong_count(rc) - 1)
            .unwrap_or(0)
    }
}

impl FileLocator for MemFileLocator {
    fn exists(&self, relative_path: &str) -> bool {
        self.files.borrow().contains_key(relative_path)
    }

    fn open(&self, relative_path: &str, access: FileAccess) -> Result<Box<dyn SparseStream>> {
        let files = self.files.borrow();
        let bytes = files
            .get(relative_path)
            .ok_or_else(|| VdError::Io(format!("no such file: {relative_path}")))?;
        Ok(Box::new(SharedByteStream::new(
            bytes.clone(),
            access == FileAccess::ReadWrite,
        )))
    }

    fn resolve_absolute(&self, relative_path: &str) -> String {
        format!("mem:{relative_path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_handles_reflect_live_streams() {
        let locator = MemFileLocator::new();
        locator.insert("a.img", vec![0; 16]);
        assert_eq!(locator.open_handles("a.img"), 0);

        let first = locator.open("a.img", FileAccess::Read).unwrap();
        let second = locator.open("a.img", FileAccess::Read).unwrap();
        assert_eq!(locator.open_handles("a.img"), 2);

        drop(first);
        drop(second);
        assert_eq!(locator.open_handles("a.img"), 0);
    }

    #[test]
    fn writes_through_one_handle_are_visible_to_later_opens() {
        let locator = MemFileLocator::new();
        let mut writer = locator.create("b.img");
        writer.set_len(8).unwrap();
        writer.write_all_at(0, b"conectix").unwrap();
        drop(writer);

        let mut reader = locator.open("b.img", FileAccess::Read).unwrap();
        let mut buf = [0u8; 8];
        reader.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"conectix");
        assert!(matches!(
            reader.write(&[0]).unwrap_err(),
            VdError::NotWritable
        ));
    }
}
