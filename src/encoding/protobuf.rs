//! Protobuf wire-format writer and reader.
//!
//! Only the subset of the format used by the protocol is supported: varint,
//! zig-zag and fixed64 scalars, and length-delimited strings, bytes and
//! nested messages. Unknown fields are skipped on read.

use bytes::{BufMut, BytesMut};

use crate::{HranaError, Result};

/// A message that can be written field by field.
pub trait ProtoEncode {
    fn encode_fields(&self, w: &mut MessageWriter);
}

/// A message that can be read from a field stream.
pub trait ProtoDecode: Sized {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self>;
}

/// Encodes a top-level message.
pub fn encode<T: ProtoEncode>(msg: &T) -> Vec<u8> {
    let mut w = MessageWriter::new();
    msg.encode_fields(&mut w);
    w.into_bytes().to_vec()
}

/// Decodes a top-level message occupying all of `data`.
pub fn decode<T: ProtoDecode>(data: &[u8]) -> Result<T> {
    let mut r = MessageReader::new(data);
    T::decode_fields(&mut r)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(HranaError::proto(format!("unsupported protobuf wire type {other}"))),
        }
    }

    fn bits(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }
}

pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    fn key(&mut self, field: u32, wire: WireType) {
        put_varint(&mut self.buf, (u64::from(field) << 3) | wire.bits());
    }

    pub fn uint32(&mut self, field: u32, value: u32) {
        self.key(field, WireType::Varint);
        put_varint(&mut self.buf, value.into());
    }

    /// Negative values are sign-extended to ten bytes, as protobuf requires.
    pub fn int32(&mut self, field: u32, value: i32) {
        self.key(field, WireType::Varint);
        put_varint(&mut self.buf, i64::from(value) as u64);
    }

    pub fn uint64(&mut self, field: u32, value: u64) {
        self.key(field, WireType::Varint);
        put_varint(&mut self.buf, value);
    }

    pub fn sint64(&mut self, field: u32, value: i64) {
        self.key(field, WireType::Varint);
        put_varint(&mut self.buf, zigzag_encode(value));
    }

    pub fn bool(&mut self, field: u32, value: bool) {
        self.key(field, WireType::Varint);
        put_varint(&mut self.buf, value.into());
    }

    pub fn double(&mut self, field: u32, value: f64) {
        self.key(field, WireType::Fixed64);
        self.buf.put_f64_le(value);
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        self.key(field, WireType::LengthDelimited);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.put_slice(value);
    }

    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    pub fn message<T: ProtoEncode>(&mut self, field: u32, value: &T) {
        let mut nested = MessageWriter::new();
        value.encode_fields(&mut nested);
        self.bytes(field, &nested.buf);
    }

    /// Writes a message field with no content.
    pub fn empty(&mut self, field: u32) {
        self.bytes(field, &[]);
    }

    /// Writes a nested message through a closure.
    pub fn nested(&mut self, field: u32, f: impl FnOnce(&mut MessageWriter)) {
        let mut nested = MessageWriter::new();
        f(&mut nested);
        self.bytes(field, &nested.buf);
    }
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
    wire: WireType,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            wire: WireType::Varint,
        }
    }

    /// Advances to the next field and returns its number, or `None` at the end.
    pub fn next_field(&mut self) -> Result<Option<u32>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        self.wire = WireType::from_bits(key & 0x7)?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| HranaError::proto("protobuf field number out of range"))?;
        Ok(Some(field))
    }

    /// Skips the value of the current field.
    pub fn skip(&mut self) -> Result<()> {
        match self.wire {
            WireType::Varint => {
                self.varint()?;
            }
            WireType::Fixed64 => {
                self.take(8)?;
            }
            WireType::LengthDelimited => {
                self.length_delimited()?;
            }
            WireType::Fixed32 => {
                self.take(4)?;
            }
        }
        Ok(())
    }

    fn expect(&self, wire: WireType) -> Result<()> {
        if self.wire != wire {
            return Err(HranaError::proto(format!(
                "expected protobuf wire type {wire:?}, got {:?}",
                self.wire
            )));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| HranaError::proto("unexpected end of protobuf message"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        match get_varint(&self.data[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(HranaError::proto("unexpected end of protobuf varint")),
        }
    }

    fn length_delimited(&mut self) -> Result<&'a [u8]> {
        self.expect(WireType::LengthDelimited)?;
        let len = usize::try_from(self.varint()?)
            .map_err(|_| HranaError::proto("protobuf length out of range"))?;
        self.take(len)
    }

    pub fn uint32(&mut self) -> Result<u32> {
        self.expect(WireType::Varint)?;
        Ok(self.varint()? as u32)
    }

    pub fn int32(&mut self) -> Result<i32> {
        self.expect(WireType::Varint)?;
        Ok(self.varint()? as i32)
    }

    pub fn uint64(&mut self) -> Result<u64> {
        self.expect(WireType::Varint)?;
        self.varint()
    }

    pub fn sint64(&mut self) -> Result<i64> {
        self.expect(WireType::Varint)?;
        Ok(zigzag_decode(self.varint()?))
    }

    pub fn bool(&mut self) -> Result<bool> {
        self.expect(WireType::Varint)?;
        Ok(self.varint()? != 0)
    }

    pub fn double(&mut self) -> Result<f64> {
        self.expect(WireType::Fixed64)?;
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_le_bytes(bytes))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.length_delimited()?.to_vec())
    }

    pub fn string(&mut self) -> Result<String> {
        let raw = self.length_delimited()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| HranaError::proto("invalid UTF-8 in protobuf string"))
    }

    pub fn message<T: ProtoDecode>(&mut self) -> Result<T> {
        let raw = self.length_delimited()?;
        T::decode_fields(&mut MessageReader::new(raw))
    }

    /// Returns a reader over the current nested message.
    pub fn nested(&mut self) -> Result<MessageReader<'a>> {
        Ok(MessageReader::new(self.length_delimited()?))
    }
}

/// Appends `value` as a base-128 varint.
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Reads a varint from the start of `data`.
///
/// Returns `Ok(None)` when `data` ends before the varint does.
pub fn get_varint(data: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (index, byte) in data.iter().enumerate() {
        if index >= 10 {
            return Err(HranaError::proto("protobuf varint is too long"));
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if data.len() >= 10 {
        return Err(HranaError::proto("protobuf varint is too long"));
    }
    Ok(None)
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn zigzag_maps_small_magnitudes_to_small_codes() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for value in [0, 1, -1, i64::MAX, i64::MIN, 1 << 40] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn varint_reports_incomplete_input() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert_eq!(&buf[..], &[0xac, 0x02]);
        assert_eq!(get_varint(&buf[..1]).unwrap(), None);
        assert_eq!(get_varint(&buf).unwrap(), Some((300, 2)));
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        assert!(get_varint(&[0xff; 11]).is_err());
    }

    #[test]
    fn negative_int32_survives() {
        let mut w = MessageWriter::new();
        w.int32(1, -5);
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        assert_eq!(r.next_field().unwrap(), Some(1));
        assert_eq!(r.int32().unwrap(), -5);
        assert_eq!(r.next_field().unwrap(), None);
    }

    #[test]
    fn unknown_fields_are_skippable() {
        let mut w = MessageWriter::new();
        w.double(7, 1.5);
        w.string(9, "ignored");
        w.uint64(1, 42);
        let bytes = w.into_bytes();

        let mut r = MessageReader::new(&bytes);
        let mut found = None;
        while let Some(field) = r.next_field().unwrap() {
            match field {
                1 => found = Some(r.uint64().unwrap()),
                _ => r.skip().unwrap(),
            }
        }
        assert_eq!(found, Some(42));
    }

    #[test]
    fn truncated_string_is_a_protocol_error() {
        let mut w = MessageWriter::new();
        w.string(1, "hello");
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes[..4]);
        assert_eq!(r.next_field().unwrap(), Some(1));
        assert!(matches!(r.string(), Err(HranaError::Proto(_))));
    }
}
