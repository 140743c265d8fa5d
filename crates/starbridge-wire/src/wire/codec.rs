use super::types::{Result, WireError};

/// Upper bound on a single framed message.
///
/// Bazel's debug messages are small (frames, scopes, values); the cap stops a
/// corrupt length prefix from forcing a huge allocation before the payload
/// has even arrived.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Longest valid encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Protobuf wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            0 => Ok(Self::Varint),
            1 => Ok(Self::Fixed64),
            2 => Ok(Self::LengthDelimited),
            5 => Ok(Self::Fixed32),
            other => Err(WireError::Protocol(format!("unsupported wire type {other}"))),
        }
    }

    fn bits(self) -> u32 {
        match self {
            Self::Varint => 0,
            Self::Fixed64 => 1,
            Self::LengthDelimited => 2,
            Self::Fixed32 => 5,
        }
    }
}

/// Append-only protobuf encoder.
///
/// Scalar fields follow proto3 rules: default values (`0`, `false`, `""`) are
/// not written. Submessages are always written, which keeps empty `oneof`
/// members such as `StartDebuggingRequest {}` on the wire.
#[derive(Debug, Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.push((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    fn write_key(&mut self, field: u32, wire_type: WireType) {
        self.write_varint(u64::from((field << 3) | wire_type.bits()));
    }

    pub fn write_int64(&mut self, field: u32, v: i64) {
        if v != 0 {
            self.write_key(field, WireType::Varint);
            // Negative values are sign-extended to ten bytes, as protobuf does.
            self.write_varint(v as u64);
        }
    }

    pub fn write_uint32(&mut self, field: u32, v: u32) {
        if v != 0 {
            self.write_key(field, WireType::Varint);
            self.write_varint(u64::from(v));
        }
    }

    pub fn write_bool(&mut self, field: u32, v: bool) {
        if v {
            self.write_key(field, WireType::Varint);
            self.write_varint(1);
        }
    }

    pub fn write_enum(&mut self, field: u32, v: i32) {
        if v != 0 {
            self.write_key(field, WireType::Varint);
            self.write_varint(i64::from(v) as u64);
        }
    }

    pub fn write_string(&mut self, field: u32, s: &str) {
        if !s.is_empty() {
            self.write_bytes(field, s.as_bytes());
        }
    }

    pub fn write_bytes(&mut self, field: u32, bytes: &[u8]) {
        self.write_key(field, WireType::LengthDelimited);
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_message<F>(&mut self, field: u32, encode: F)
    where
        F: FnOnce(&mut ProtoWriter),
    {
        let mut nested = ProtoWriter::new();
        encode(&mut nested);
        self.write_bytes(field, &nested.buf);
    }
}

/// Cursor over a complete protobuf message.
pub struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn require(&self, n: usize) -> Result<()> {
        match self.pos.checked_add(n) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(WireError::Protocol(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            ))),
        }
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        match decode_varint(&self.buf[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(WireError::Protocol(format!(
                "truncated varint at {} of {}",
                self.pos,
                self.buf.len()
            ))),
        }
    }

    /// Read the next field key, or `None` at the end of the message.
    pub fn read_key(&mut self) -> Result<Option<(u32, WireType)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| WireError::Protocol(format!("field number out of range in key {key}")))?;
        if field == 0 {
            return Err(WireError::Protocol("field number 0 is reserved".to_string()));
        }
        Ok(Some((field, WireType::from_bits(key & 0x7)?)))
    }

    pub fn read_int64(&mut self) -> Result<i64> {
        Ok(self.read_varint()? as i64)
    }

    pub fn read_uint32(&mut self) -> Result<u32> {
        Ok(self.read_varint()? as u32)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_varint()? != 0)
    }

    pub fn read_enum(&mut self) -> Result<i32> {
        Ok(self.read_varint()? as i32)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.read_varint()?)
            .map_err(|_| WireError::Protocol("length prefix does not fit in usize".to_string()))?;
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WireError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_message(&mut self) -> Result<ProtoReader<'a>> {
        Ok(ProtoReader::new(self.read_bytes()?))
    }

    /// Skip over the value of a field this decoder does not know about.
    pub fn skip(&mut self, wire_type: WireType) -> Result<()> {
        match wire_type {
            WireType::Varint => self.read_varint().map(|_| ()),
            WireType::Fixed64 => self.advance(8),
            WireType::LengthDelimited => self.read_bytes().map(|_| ()),
            WireType::Fixed32 => self.advance(4),
        }
    }
}

/// Decode a varint from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` ends before the varint does.
fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(WireError::Protocol(format!(
            "varint longer than {MAX_VARINT_LEN} bytes"
        )));
    }
    Ok(None)
}

/// Prefix `message` with its varint-encoded length (protobuf `writeDelimited`).
pub fn encode_delimited(message: &[u8]) -> Vec<u8> {
    let mut w = ProtoWriter::new();
    w.write_varint(message.len() as u64);
    let mut out = w.into_vec();
    out.extend_from_slice(message);
    out
}

/// Locate the first length-delimited frame in `buf`.
///
/// Returns `(header_len, payload_len)` once the whole frame is buffered and
/// `Ok(None)` while it is still incomplete. Only a malformed or oversized
/// length prefix is an error.
pub fn split_frame(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let Some((len, header_len)) = decode_varint(buf)? else {
        return Ok(None);
    };
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| {
            WireError::Protocol(format!(
                "frame length {len} exceeds maximum allowed size {MAX_FRAME_BYTES}"
            ))
        })?;
    if buf.len() - header_len < len {
        return Ok(None);
    }
    Ok(Some((header_len, len)))
}
