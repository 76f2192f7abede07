//! Length-prefixed message buffer with a typed read/write cursor. One
//! `Message` holds a single frame's payload (length-prefix already
//! stripped by the connection runtime).

use byteorder::{ByteOrder, LittleEndian};
use wardcore::error::{ErrorType, NetworkError, NetworkResult};

/// Maximum payload a single frame may carry, matching the ~16 KiB framed
/// input ceiling.
pub const MAX_INPUT: usize = 16 * 1024;

/// ECHO responses are capped at this many payload bytes.
pub const ECHO_MAX_PAYLOAD: usize = 1022;

pub struct Message {
    buffer: Vec<u8>,
    readpos: usize,
}

impl Message {
    pub fn new() -> Message {
        Message { buffer: Vec::new(), readpos: 0 }
    }

    /// Wraps an existing byte slice for reading (e.g. a dispatched frame
    /// body).
    pub fn from_bytes(data: &[u8]) -> Message {
        Message { buffer: data.to_vec(), readpos: 0 }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.readpos = 0;
    }

    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    pub fn readpos(&self) -> usize {
        self.readpos
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.readpos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn ensure_capacity(&mut self, additional: usize) -> NetworkResult<()> {
        if self.buffer.len() + additional > MAX_INPUT {
            return Err(NetworkError::Fatal(ErrorType::ProtocolViolation));
        }
        Ok(())
    }

    pub fn add_u8(&mut self, value: u8) -> NetworkResult<()> {
        self.ensure_capacity(1)?;
        self.buffer.push(value);
        Ok(())
    }

    pub fn add_u16(&mut self, value: u16) -> NetworkResult<()> {
        self.ensure_capacity(2)?;
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, value);
        self.buffer.extend_from_slice(&tmp);
        Ok(())
    }

    pub fn add_u32(&mut self, value: u32) -> NetworkResult<()> {
        self.ensure_capacity(4)?;
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, value);
        self.buffer.extend_from_slice(&tmp);
        Ok(())
    }

    /// Length-prefixed string: `u16` length, then raw bytes.
    pub fn add_str(&mut self, value: &str) -> NetworkResult<()> {
        self.ensure_capacity(2 + value.len())?;
        self.add_u16(value.len() as u16)?;
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> NetworkResult<()> {
        self.ensure_capacity(value.len())?;
        self.buffer.extend_from_slice(value);
        Ok(())
    }

    fn take(&mut self, n: usize) -> NetworkResult<&[u8]> {
        if self.remaining() < n {
            return Err(NetworkError::Fatal(ErrorType::ProtocolViolation));
        }
        let slice = &self.buffer[self.readpos..self.readpos + n];
        self.readpos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> NetworkResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn get_u32(&mut self) -> NetworkResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_bytes(&mut self, n: usize) -> NetworkResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_str(&mut self) -> NetworkResult<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetworkError::Fatal(ErrorType::ProtocolViolation))
    }

    /// Skips `n` bytes without reading them, failing if out of bounds.
    pub fn skip(&mut self, n: usize) -> NetworkResult<()> {
        self.take(n).map(|_| ())
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes `payload` with the standard little-endian `u16` length prefix.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    let mut prefix = [0u8; 2];
    LittleEndian::write_u16(&mut prefix, payload.len() as u16);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(payload);
    out
}
