//! Primitive codec for the save stream.
//!
//! [`Writer`] appends little-endian fixed-width values, length-prefixed
//! strings and blobs, and delta-encoded deadlines. [`Reader`] consumes the
//! same layout. Records carry no length prefix, so a reader must consume
//! exactly what the matching writer produced; any short read is reported as
//! [`CodecError::UnexpectedEof`] and is never recovered from here.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::clock::{GameTime, duration_millis};
use crate::serial::Serial;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding primitive values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(
        "unexpected end of stream at offset {offset}: needed {needed} bytes, {remaining} remaining"
    )]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("invalid boolean byte 0x{value:02X} at offset {offset}")]
    InvalidBool { offset: usize, value: u8 },
    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("malformed variable-length integer at offset {offset}")]
    BadVarint { offset: usize },
    #[error("invalid value at offset {offset}: {reason}")]
    InvalidValue { offset: usize, reason: String },
    #[error("blob encoding failed: {0}")]
    Encode(String),
    #[error("blob decoding failed at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Time base
// ---------------------------------------------------------------------------

/// Anchor used to turn saved deltas back into deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeBase {
    /// Monotonic time of the loading process.
    pub now: GameTime,
    /// Real-world time that passed between the save and this load.
    pub downtime: Duration,
}

impl TimeBase {
    pub fn new(now: GameTime, downtime: Duration) -> Self {
        Self { now, downtime }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only encoder for the save stream.
#[derive(Debug, Clone)]
pub struct Writer {
    buf: Vec<u8>,
    now: GameTime,
}

impl Writer {
    /// Create a writer. `now` is the capture time that delta-encoded
    /// deadlines are measured against.
    pub fn new(now: GameTime) -> Self {
        Self {
            buf: Vec::new(),
            now,
        }
    }

    pub fn now(&self) -> GameTime {
        self.now
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    /// Append bytes verbatim, with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a `u32` in 7-bit groups, low group first.
    pub fn write_encoded_u32(&mut self, mut v: u32) {
        while v >= 0x80 {
            self.buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    /// Write a `u32` byte length followed by the UTF-8 bytes.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_serial(&mut self, serial: Serial) {
        self.write_u32(serial.0);
    }

    /// Write `deadline` as a signed millisecond offset from the writer's
    /// capture time. Deadlines already in the past encode as negative.
    pub fn write_delta_time(&mut self, deadline: GameTime) {
        self.write_i64(deadline.millis_since(self.now));
    }

    /// Write a duration as whole milliseconds.
    pub fn write_duration(&mut self, d: Duration) {
        self.write_u64(duration_millis(d));
    }

    /// Write any serde value as a length-prefixed `bitcode` blob.
    pub fn write_blob<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let bytes = bitcode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a save stream.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: TimeBase,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], base: TimeBase) -> Self {
        Self { data, pos: 0, base }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn time_base(&self) -> TimeBase {
        self.base
    }

    /// Replace the time base. The header must be read before the downtime
    /// is known, so the loader sets the base after parsing it.
    pub fn set_time_base(&mut self, base: TimeBase) {
        self.base = base;
    }

    /// Build an [`CodecError::InvalidValue`] at the current offset. Content
    /// types use this to reject out-of-range fields.
    pub fn invalid(&self, reason: impl Into<String>) -> CodecError {
        CodecError::InvalidValue {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                offset: self.pos,
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(u64::from_le_bytes(self.take_array()?)))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        let offset = self.pos;
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(CodecError::InvalidBool { offset, value }),
        }
    }

    pub fn read_encoded_u32(&mut self) -> Result<u32, CodecError> {
        let offset = self.pos;
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7F) as u32;
            if shift == 28 && bits > 0x0F {
                return Err(CodecError::BadVarint { offset });
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::BadVarint { offset })
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let offset = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8 { offset })
    }

    pub fn read_serial(&mut self) -> Result<Serial, CodecError> {
        Ok(Serial(self.read_u32()?))
    }

    /// Read a delta-encoded deadline and anchor it to the loader's clock.
    ///
    /// The result is `now + delta - downtime`, never earlier than `now`, so a
    /// deadline that expired while the server was down is due immediately.
    pub fn read_delta_time(&mut self) -> Result<GameTime, CodecError> {
        let delta = self.read_i64()?;
        let downtime = i64::try_from(duration_millis(self.base.downtime)).unwrap_or(i64::MAX);
        let remaining = delta.saturating_sub(downtime);
        if remaining <= 0 {
            Ok(self.base.now)
        } else {
            Ok(self.base.now.offset(remaining))
        }
    }

    pub fn read_duration(&mut self) -> Result<Duration, CodecError> {
        Ok(Duration::from_millis(self.read_u64()?))
    }

    pub fn read_blob<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let len = self.read_u32()? as usize;
        let offset = self.pos;
        let bytes = self.take(len)?;
        bitcode::deserialize(bytes).map_err(|e| CodecError::Decode {
            offset,
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// FNV-1a (64-bit) over a byte stream. Detects truncated and torn writes;
/// not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum(u64);

impl Checksum {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn finish(self) -> u64 {
        self.0
    }

    pub fn of(bytes: &[u8]) -> u64 {
        let mut c = Self::new();
        c.write(bytes);
        c.finish()
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}
