//! Storage abstraction consumed by the merge engine.
//!
//! Raw file I/O is owned by the surrounding system; the merge engine only
//! needs a flat namespace of named files. Names may contain `/` to express
//! a directory layout (`segment_3/attribute/price/2.patch`); backends map
//! that onto whatever they store.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage rooted at a directory
//! - Atomic publish through `rename_file`
//!
//! ## MemoryStorage
//! - In-memory storage for tests and dry runs
//!
//! # Example
//!
//! ```
//! use std::io::{Read, Write};
//! use segmerge::storage::{MemoryStorage, Storage};
//!
//! # fn main() -> segmerge::error::Result<()> {
//! let storage = MemoryStorage::new();
//!
//! let mut output = storage.create_output("merge_meta/task.json")?;
//! output.write_all(b"{}")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("merge_meta/task.json")?;
//! let mut buffer = String::new();
//! input.read_to_string(&mut buffer)?;
//! assert_eq!(buffer, "{}");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};

use crate::error::Result;

pub mod file;
pub mod memory;
pub mod structured;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use structured::{StructReader, StructWriter};

/// A trait for storage backends that can store and retrieve data.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any previous content.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all file names, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing `new_name` if present.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;

    /// List file names that start with `prefix`, sorted.
    fn list_files_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    /// Read a whole file into memory.
    fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Write `data` to a unique temporary name and rename it into place so
    /// readers never observe a partial file.
    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        let temp_name = format!("{name}.{}.tmp", uuid::Uuid::new_v4());
        {
            let mut output = self.create_output(&temp_name)?;
            output.write_all(data)?;
            output.flush_and_sync()?;
            output.close()?;
        }
        self.rename_file(&temp_name, name)
    }
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Close the output stream, publishing its content.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }
}
