//! Packet buffer implementation
//!
//! Provides a byte buffer with the host protocol's encodings:
//! - Fixed-width big-endian integers and floats
//! - VarInt (LEB128 style, 7 bits per byte)
//! - Length-prefixed UTF-8 strings and UUIDs on the write side
//! - Booleans and optional-value prefixes

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Maximum packet size (2 MiB, the host's frame limit)
pub const MAX_PACKET_SIZE: usize = 2_097_151;

type ReadResult<T> = Result<T, ProtocolError>;

/// Packet buffer for reading and writing protocol data
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Current read position
    read_pos: usize,
}

impl PacketBuffer {
    /// Create a new empty packet buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a packet buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Create a packet buffer from existing bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_pos: 0,
        }
    }

    // ============ Properties ============

    /// Get the current read position
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Get the total length of the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    /// Get a reference to the underlying bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the underlying BytesMut
    #[inline]
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// Reset read position to start
    pub fn reset(&mut self) {
        self.read_pos = 0;
    }

    fn take(&mut self, count: usize) -> ReadResult<&[u8]> {
        if self.remaining() < count {
            return Err(ProtocolError::MalformedPacket(format!(
                "needed {} bytes, {} remaining",
                count,
                self.remaining()
            )));
        }
        let start = self.read_pos;
        self.read_pos += count;
        Ok(&self.data[start..start + count])
    }

    // ============ Reading Methods ============

    /// Read an unsigned byte
    pub fn read_ubyte(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean
    pub fn read_bool(&mut self) -> ReadResult<bool> {
        Ok(self.read_ubyte()? != 0)
    }

    /// Read a signed big-endian short
    pub fn read_short(&mut self) -> ReadResult<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a big-endian float
    pub fn read_float(&mut self) -> ReadResult<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a VarInt (at most 5 bytes)
    pub fn read_var_int(&mut self) -> ReadResult<i32> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.read_ubyte()?;
            value |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(ProtocolError::VarIntTooLong)
    }

    /// Read everything left in the buffer
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let bytes = self.data[self.read_pos..].to_vec();
        self.read_pos = self.data.len();
        bytes
    }

    // ============ Writing Methods ============

    /// Write an unsigned byte
    pub fn write_ubyte(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write a signed byte
    pub fn write_byte(&mut self, value: i8) {
        self.data.put_i8(value);
    }

    /// Write a boolean
    pub fn write_bool(&mut self, value: bool) {
        self.data.put_u8(value as u8);
    }

    /// Write a signed big-endian short
    pub fn write_short(&mut self, value: i16) {
        self.data.put_i16(value);
    }

    /// Write a signed big-endian int
    pub fn write_int(&mut self, value: i32) {
        self.data.put_i32(value);
    }

    /// Write a big-endian float
    pub fn write_float(&mut self, value: f32) {
        self.data.put_f32(value);
    }

    /// Write a big-endian double
    pub fn write_double(&mut self, value: f64) {
        self.data.put_f64(value);
    }

    /// Write a VarInt
    pub fn write_var_int(&mut self, value: i32) {
        let mut value = value as u32;
        loop {
            if value & !0x7f == 0 {
                self.data.put_u8(value as u8);
                return;
            }
            self.data.put_u8((value & 0x7f) as u8 | 0x80);
            value >>= 7;
        }
    }

    /// Write a UUID
    pub fn write_uuid(&mut self, value: Uuid) {
        let (high, low) = value.as_u64_pair();
        self.data.put_u64(high);
        self.data.put_u64(low);
    }

    /// Write a rotation as a 1/256th-turn angle byte
    pub fn write_angle(&mut self, degrees: f32) {
        self.write_ubyte((degrees.rem_euclid(360.0) * 256.0 / 360.0) as i32 as u8);
    }

    // ============ String Writing ============

    /// Write a VarInt length-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) {
        self.write_var_int(value.len() as i32);
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Number of bytes `value` takes as a VarInt
    pub fn var_int_size(value: i32) -> usize {
        let bits = 32 - (value as u32).leading_zeros() as usize;
        bits.max(1).div_ceil(7)
    }
}

impl From<Vec<u8>> for PacketBuffer {
    fn from(vec: Vec<u8>) -> Self {
        Self::from_bytes(&vec)
    }
}

impl From<&[u8]> for PacketBuffer {
    fn from(slice: &[u8]) -> Self {
        Self::from_bytes(slice)
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
