//! # buffer
//!
//! why: every wire and disk record shares one fixed-layout binary encoding
//! relations: used by log_entry, cluster_config, snapshot and both log stores
//! what: Buffer with a read/write cursor, little-endian integers, nul-terminated strings
//!
//! The layout is part of the on-disk format: integers are fixed width and
//! little-endian, strings are utf-8 followed by a single NUL with no length prefix.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::BufferError;

pub const SZ_BYTE: usize = 1;
pub const SZ_INT: usize = 4;
pub const SZ_ULONG: usize = 8;

/// Fixed-capacity byte container with a cursor shared by puts and gets.
///
/// `size()` is the capacity and never changes; `pos()` moves forward as values
/// are written or read.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    /// Allocate a zero-filled buffer of `size` bytes with the cursor at 0.
    pub fn alloc(size: usize) -> Self {
        Self {
            data: vec![0; size],
            pos: 0,
        }
    }

    /// Wrap existing bytes; the cursor starts at 0.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Copy the unread part of `other` into a new buffer positioned at 0.
    pub fn copy(other: &Buffer) -> Self {
        Self::from_vec(other.data().to_vec())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Move the cursor, clamping to `size()`.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes from the cursor to the end.
    pub fn data(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// All bytes regardless of the cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn ensure_put(&self, needed: usize) -> Result<(), BufferError> {
        let available = self.remaining();
        if available < needed {
            return Err(BufferError::Overflow { needed, available });
        }
        Ok(())
    }

    fn ensure_get(&self, needed: usize) -> Result<(), BufferError> {
        let available = self.remaining();
        if available < needed {
            return Err(BufferError::Underflow { needed, available });
        }
        Ok(())
    }

    pub fn put_byte(&mut self, val: u8) -> Result<(), BufferError> {
        self.ensure_put(SZ_BYTE)?;
        self.data[self.pos] = val;
        self.pos += SZ_BYTE;
        Ok(())
    }

    pub fn put_i32(&mut self, val: i32) -> Result<(), BufferError> {
        self.ensure_put(SZ_INT)?;
        let available = self.remaining();
        (&mut self.data[self.pos..])
            .write_i32::<LittleEndian>(val)
            .map_err(|_| BufferError::Overflow {
                needed: SZ_INT,
                available,
            })?;
        self.pos += SZ_INT;
        Ok(())
    }

    pub fn put_u64(&mut self, val: u64) -> Result<(), BufferError> {
        self.ensure_put(SZ_ULONG)?;
        let available = self.remaining();
        (&mut self.data[self.pos..])
            .write_u64::<LittleEndian>(val)
            .map_err(|_| BufferError::Overflow {
                needed: SZ_ULONG,
                available,
            })?;
        self.pos += SZ_ULONG;
        Ok(())
    }

    /// Write the utf-8 bytes of `val` followed by one NUL.
    pub fn put_str(&mut self, val: &str) -> Result<(), BufferError> {
        self.ensure_put(val.len() + 1)?;
        self.data[self.pos..self.pos + val.len()].copy_from_slice(val.as_bytes());
        self.data[self.pos + val.len()] = 0;
        self.pos += val.len() + 1;
        Ok(())
    }

    /// Write raw bytes verbatim.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.ensure_put(bytes.len())?;
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Embed the unread part of `other` (`other.size() - other.pos()` bytes).
    pub fn put_buffer(&mut self, other: &Buffer) -> Result<(), BufferError> {
        self.put_bytes(other.data())
    }

    pub fn get_byte(&mut self) -> Result<u8, BufferError> {
        self.ensure_get(SZ_BYTE)?;
        let val = self.data[self.pos];
        self.pos += SZ_BYTE;
        Ok(val)
    }

    pub fn get_i32(&mut self) -> Result<i32, BufferError> {
        self.ensure_get(SZ_INT)?;
        let available = self.remaining();
        let val = (&self.data[self.pos..])
            .read_i32::<LittleEndian>()
            .map_err(|_| BufferError::Underflow {
                needed: SZ_INT,
                available,
            })?;
        self.pos += SZ_INT;
        Ok(val)
    }

    pub fn get_u64(&mut self) -> Result<u64, BufferError> {
        self.ensure_get(SZ_ULONG)?;
        let available = self.remaining();
        let val = (&self.data[self.pos..])
            .read_u64::<LittleEndian>()
            .map_err(|_| BufferError::Underflow {
                needed: SZ_ULONG,
                available,
            })?;
        self.pos += SZ_ULONG;
        Ok(val)
    }

    /// Read up to the next NUL and move the cursor past it.
    pub fn get_str(&mut self) -> Result<String, BufferError> {
        let rest = self.data();
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(BufferError::Unterminated)?;
        let val = std::str::from_utf8(&rest[..len])
            .map_err(|_| BufferError::InvalidUtf8)?
            .to_owned();
        self.pos += len + 1;
        Ok(val)
    }

    /// Read exactly `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, BufferError> {
        self.ensure_get(len)?;
        let val = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(val)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.data.len())
            .field("pos", &self.pos)
            .finish()
    }
}
