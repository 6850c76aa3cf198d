//! Variable-length integer encoding utilities.
//!
//! Uses 7 bits per byte with a continuation bit, the same layout as
//! protocol buffers, so small doc ids and counts stay small on disk.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{MergeError, Result};

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value from variable-length encoding.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(MergeError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(MergeError::corrupt("Incomplete VarInt"))
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(MergeError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_small_values_use_one_byte() {
        assert_eq!(encode_u64(0), vec![0]);
        assert_eq!(encode_u64(127), vec![127]);
        assert_eq!(encode_u64(128), vec![0x80, 0x01]);
    }

    #[test]
    fn test_stream_and_slice_agree() {
        let mut buffer = Vec::new();
        for value in [0u64, 300, u32::MAX as u64, u64::MAX] {
            write_u64(&mut buffer, value).unwrap();
        }

        let mut cursor = Cursor::new(&buffer);
        assert_eq!(read_u64(&mut cursor).unwrap(), 0);
        assert_eq!(read_u64(&mut cursor).unwrap(), 300);

        let (value, used) = decode_u64(&buffer[1..]).unwrap();
        assert_eq!(value, 300);
        assert_eq!(used, 2);
    }

    #[test]
    fn test_incomplete_varint_is_corrupt() {
        assert!(matches!(
            decode_u64(&[0x80, 0x80]),
            Err(MergeError::CorruptData(_))
        ));
    }
}
