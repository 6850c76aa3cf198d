//! Structured binary I/O for persisted merge artifacts.
//!
//! Every artifact starts with a 4-byte magic and a format version and ends
//! with a CRC32 of everything before it. [`StructReader::open`] verifies the
//! checksum up front, so a truncated or bit-flipped file is reported as
//! [`MergeError::CorruptData`] before any field is decoded.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{MergeError, Result};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{encode_u64, read_u64 as read_varint_u64};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Write the artifact header.
    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put(&[value])
    }

    /// Write a u16 value (little-endian).
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.put(&encoded)
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.put(value)
    }

    /// Write a delta-encoded, ascending u32 array.
    pub fn write_delta_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;
        let mut previous = 0u32;
        for &value in values {
            self.write_varint(value.wrapping_sub(previous) as u64)?;
            previous = value;
        }
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the trailing checksum, then flush and close the writer.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
#[derive(Debug)]
pub struct StructReader {
    cursor: Cursor<Vec<u8>>,
    payload_len: u64,
}

impl StructReader {
    /// Read a whole artifact and verify its trailing checksum.
    pub fn open<R: StorageInput>(mut input: R) -> Result<Self> {
        let mut data = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    /// Verify and wrap an in-memory artifact.
    pub fn from_bytes(mut data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(MergeError::corrupt("File too short for checksum"));
        }
        let split = data.len() - 4;
        let mut tail = &data[split..];
        let stored = tail.read_u32::<LittleEndian>()?;
        let actual = crc32fast::hash(&data[..split]);
        if stored != actual {
            return Err(MergeError::corrupt(format!(
                "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }
        data.truncate(split);
        Ok(StructReader {
            payload_len: split as u64,
            cursor: Cursor::new(data),
        })
    }

    /// Read and check the artifact header.
    pub fn expect_header(&mut self, magic: u32, version: u32) -> Result<()> {
        let found = self.read_u32()?;
        if found != magic {
            return Err(MergeError::corrupt(format!(
                "bad magic {found:#010x}, expected {magic:#010x}"
            )));
        }
        let found = self.read_u32()?;
        if found != version {
            return Err(MergeError::corrupt(format!(
                "unsupported format version {found}"
            )));
        }
        Ok(())
    }

    fn eof_to_corrupt(e: std::io::Error) -> MergeError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            MergeError::corrupt("unexpected end of data")
        } else {
            MergeError::Io(e)
        }
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(Self::eof_to_corrupt)
    }

    /// Read a u16 value (little-endian).
    pub fn read_u16(&mut self) -> Result<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(Self::eof_to_corrupt)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(Self::eof_to_corrupt)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(Self::eof_to_corrupt)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        match read_varint_u64(&mut self.cursor) {
            Err(MergeError::Io(e)) => Err(Self::eof_to_corrupt(e)),
            other => other,
        }
    }

    /// Read a length prefix and make sure that many bytes remain.
    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_varint()?;
        if len > self.remaining() {
            return Err(MergeError::corrupt(format!(
                "length {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(len as usize)
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_len()?;
        let mut bytes = vec![0u8; length];
        self.cursor
            .read_exact(&mut bytes)
            .map_err(Self::eof_to_corrupt)?;
        Ok(bytes)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| MergeError::corrupt(format!("Invalid UTF-8: {e}")))
    }

    /// Read a delta-encoded u32 array.
    pub fn read_delta_u32s(&mut self) -> Result<Vec<u32>> {
        let length = self.read_len()?;
        let mut values = Vec::with_capacity(length);
        let mut previous = 0u32;
        for _ in 0..length {
            let delta = self.read_varint()? as u32;
            let value = previous.wrapping_add(delta);
            values.push(value);
            previous = value;
        }
        Ok(values)
    }

    /// Bytes left before the checksum.
    pub fn remaining(&self) -> u64 {
        self.payload_len.saturating_sub(self.cursor.position())
    }

    /// Check if the whole payload has been consumed.
    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }
}
