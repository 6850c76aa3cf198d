//! In-memory storage implementation for testing and dry runs.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MergeError, Result};
use crate::storage::{Storage, StorageInput, StorageOutput};

type FileMap = Arc<Mutex<BTreeMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Files become visible when their output is closed (or dropped).
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: FileMap,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Overwrite a stored file in place. Used to simulate on-disk corruption.
    pub fn replace_bytes(&self, name: &str, data: Vec<u8>) {
        self.files.lock().insert(name.to_string(), data.into());
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| MergeError::not_found(format!("file {name}")))?;
        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.files
            .lock()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| MergeError::not_found(format!("file {name}")))
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| MergeError::not_found(format!("file {old_name}")))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = std::mem::take(&mut self.buffer).into();
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("segment_0/deletionmap").unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("segment_0/deletionmap").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, Memory!");
        assert_eq!(input.size().unwrap(), 14);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 14);
    }

    #[test]
    fn test_file_operations() {
        let storage = MemoryStorage::new();
        assert!(!storage.file_exists("a"));

        storage.write_atomic("a", b"content").unwrap();
        assert!(storage.file_exists("a"));
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.file_size("a").unwrap(), 7);

        storage.rename_file("a", "b").unwrap();
        assert!(!storage.file_exists("a"));
        assert_eq!(storage.read_all("b").unwrap(), b"content");

        storage.delete_file("b").unwrap();
        assert!(!storage.file_exists("b"));
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_prefix_listing_is_sorted() {
        let storage = MemoryStorage::new();
        for name in ["p/2", "q/1", "p/1"] {
            storage.write_atomic(name, b"x").unwrap();
        }
        assert_eq!(storage.list_files_with_prefix("p/").unwrap(), vec!["p/1", "p/2"]);
    }

    #[test]
    fn test_file_not_found() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.open_input("missing"),
            Err(MergeError::NotFound(_))
        ));
        assert!(storage.file_size("missing").is_err());
    }

    #[test]
    fn test_output_published_on_drop() {
        let storage = MemoryStorage::new();
        {
            let mut output = storage.create_output("dropped").unwrap();
            output.write_all(b"abc").unwrap();
        }
        assert_eq!(storage.read_all("dropped").unwrap(), b"abc");
    }
}
