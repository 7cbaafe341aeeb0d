//! AMQP 0-9-1 Binary Encoding and Decoding
//!
//! This module translates between in-memory typed values and the AMQP
//! octet stream: the primitive wire types (octet, short, long, longlong,
//! bit, shortstr, longstr, table, timestamp) and the frame envelope that
//! carries them.
//!
//! The codec is free of state and I/O: it only ever operates on byte
//! buffers already in memory, which keeps it usable from both the transport
//! read loop and from property tests without a socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::error::{AmqpError, AmqpResult};

/// Marks the end of every frame on the wire.
pub const FRAME_END: u8 = 0xCE;

/// The eight-byte protocol header sent as the very first thing on a new
/// connection: `"AMQP" 0x00 0x00 0x09 0x01`.
pub const PROTOCOL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0x00, 0x00, 0x09, 0x01];

/// Frame types that appear in the `type` octet of the frame envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Method = 1,
    Header = 2,
    Body = 3,
    Heartbeat = 8,
}

impl FrameType {
    fn from_octet(b: u8) -> AmqpResult<Self> {
        match b {
            1 => Ok(FrameType::Method),
            2 => Ok(FrameType::Header),
            3 => Ok(FrameType::Body),
            8 => Ok(FrameType::Heartbeat),
            other => Err(AmqpError::MalformedFrame(format!("unknown frame type {other}"))),
        }
    }
}

/// The wire unit: a typed payload addressed to a channel (0 is the
/// connection channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn heartbeat() -> Self {
        Frame {
            frame_type: FrameType::Heartbeat,
            channel: 0,
            payload: Vec::new(),
        }
    }

    pub fn method(channel: u16, payload: Vec<u8>) -> Self {
        Frame {
            frame_type: FrameType::Method,
            channel,
            payload,
        }
    }

    /// Encodes the envelope: `type(u8) channel(u16) size(u32) payload 0xCE`.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(7 + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.channel);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
        buf
    }

    /// Parses a single frame from the front of `data`. Returns `Ok(None)`
    /// if `data` doesn't yet contain a complete frame (the caller should
    /// read more bytes and retry); never consumes partial data.
    pub fn decode(data: &[u8]) -> AmqpResult<Option<(Frame, usize)>> {
        if data.len() < 7 {
            return Ok(None);
        }
        let mut cursor = data;
        let frame_type = FrameType::from_octet(cursor.get_u8())?;
        let channel = cursor.get_u16();
        let size = cursor.get_u32() as usize;
        let needed = 7 + size + 1;
        if data.len() < needed {
            return Ok(None);
        }
        let payload = data[7..7 + size].to_vec();
        let end = data[7 + size];
        if end != FRAME_END {
            return Err(AmqpError::MalformedFrame(format!(
                "expected frame-end 0xCE, got {end:#04x}"
            )));
        }
        Ok(Some((
            Frame {
                frame_type,
                channel,
                payload,
            },
            needed,
        )))
    }
}

/// A `shortstr`-keyed, type-tagged value table, as exchanged in `Start`,
/// `Start-Ok`, and client/server properties.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// One AMQP 0-9-1 field-table value, tagged per the wire type byte.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUint(u8),
    ShortInt(i16),
    ShortUint(u16),
    LongInt(i32),
    LongUint(u32),
    LongLongInt(i64),
    LongLongUint(u64),
    Float(f32),
    Double(f64),
    Decimal { scale: u8, value: u32 },
    ShortString(String),
    LongString(Vec<u8>),
    FieldArray(Vec<FieldValue>),
    Timestamp(u64),
    FieldTable(FieldTable),
    Void,
}

/// Writes AMQP primitives onto a `BytesMut`, big-endian throughout.
pub struct Encoder<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Encoder { buf }
    }

    pub fn write_octet(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_short(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_long(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_longlong(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_timestamp(&mut self, v: u64) {
        self.write_longlong(v);
    }

    /// Packs a run of adjacent booleans into as few octets as possible,
    /// one bit per bool, low bit first. Each call starts a fresh octet
    /// run, as if the next non-bool field had reset it.
    pub fn write_bits(&mut self, bits: &[bool]) {
        for chunk in bits.chunks(8) {
            let mut byte = 0u8;
            for (i, b) in chunk.iter().enumerate() {
                if *b {
                    byte |= 1 << i;
                }
            }
            self.buf.put_u8(byte);
        }
    }

    pub fn write_shortstr(&mut self, s: &str) -> AmqpResult<()> {
        if s.len() > 255 {
            return Err(AmqpError::StringTooLong(s.len()));
        }
        self.buf.put_u8(s.len() as u8);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn write_longstr(&mut self, data: &[u8]) {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn write_field_value(&mut self, value: &FieldValue) -> AmqpResult<()> {
        match value {
            FieldValue::Boolean(b) => {
                self.buf.put_u8(b't');
                self.buf.put_u8(*b as u8);
            }
            FieldValue::ShortShortInt(v) => {
                self.buf.put_u8(b'b');
                self.buf.put_i8(*v);
            }
            FieldValue::ShortShortUint(v) => {
                self.buf.put_u8(b'B');
                self.buf.put_u8(*v);
            }
            FieldValue::ShortInt(v) => {
                self.buf.put_u8(b'U');
                self.buf.put_i16(*v);
            }
            FieldValue::ShortUint(v) => {
                self.buf.put_u8(b'u');
                self.buf.put_u16(*v);
            }
            FieldValue::LongInt(v) => {
                self.buf.put_u8(b'I');
                self.buf.put_i32(*v);
            }
            FieldValue::LongUint(v) => {
                self.buf.put_u8(b'i');
                self.buf.put_u32(*v);
            }
            FieldValue::LongLongInt(v) => {
                self.buf.put_u8(b'L');
                self.buf.put_i64(*v);
            }
            FieldValue::LongLongUint(v) => {
                self.buf.put_u8(b'l');
                self.buf.put_u64(*v);
            }
            FieldValue::Float(v) => {
                self.buf.put_u8(b'f');
                self.buf.put_f32(*v);
            }
            FieldValue::Double(v) => {
                self.buf.put_u8(b'd');
                self.buf.put_f64(*v);
            }
            FieldValue::Decimal { scale, value } => {
                self.buf.put_u8(b'D');
                self.buf.put_u8(*scale);
                self.buf.put_u32(*value);
            }
            FieldValue::ShortString(s) => {
                self.buf.put_u8(b's');
                self.write_shortstr(s)?;
            }
            FieldValue::LongString(data) => {
                self.buf.put_u8(b'S');
                self.write_longstr(data);
            }
            FieldValue::FieldArray(items) => {
                self.buf.put_u8(b'A');
                let mut inner = BytesMut::new();
                {
                    let mut enc = Encoder::new(&mut inner);
                    for item in items {
                        enc.write_field_value(item)?;
                    }
                }
                self.buf.put_u32(inner.len() as u32);
                self.buf.put_slice(&inner);
            }
            FieldValue::Timestamp(v) => {
                self.buf.put_u8(b'T');
                self.write_timestamp(*v);
            }
            FieldValue::FieldTable(table) => {
                self.buf.put_u8(b'F');
                self.write_table(table)?;
            }
            FieldValue::Void => {
                self.buf.put_u8(b'V');
            }
        }
        Ok(())
    }

    pub fn write_table(&mut self, table: &FieldTable) -> AmqpResult<()> {
        let mut inner = BytesMut::new();
        {
            let mut enc = Encoder::new(&mut inner);
            for (key, value) in table {
                enc.write_shortstr(key)?;
                enc.write_field_value(value)?;
            }
        }
        self.buf.put_u32(inner.len() as u32);
        self.buf.put_slice(&inner);
        Ok(())
    }
}

/// Reads AMQP primitives off a `Bytes` cursor, big-endian throughout.
pub struct Decoder {
    buf: Bytes,
}

impl Decoder {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Decoder { buf: data.into() }
    }

    fn need(&self, n: usize) -> AmqpResult<()> {
        if self.buf.remaining() < n {
            return Err(AmqpError::MalformedFrame(format!(
                "needed {n} more bytes, had {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    pub fn read_octet(&mut self) -> AmqpResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_short(&mut self) -> AmqpResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_long(&mut self) -> AmqpResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_longlong(&mut self) -> AmqpResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_timestamp(&mut self) -> AmqpResult<u64> {
        self.read_longlong()
    }

    /// Unpacks `count` booleans from as many octets as needed, low bit
    /// first, mirroring `write_bits`.
    pub fn read_bits(&mut self, count: usize) -> AmqpResult<Vec<bool>> {
        let mut out = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let byte = self.read_octet()?;
            let take = remaining.min(8);
            for i in 0..take {
                out.push(byte & (1 << i) != 0);
            }
            remaining -= take;
        }
        Ok(out)
    }

    pub fn read_shortstr(&mut self) -> AmqpResult<String> {
        let len = self.read_octet()? as usize;
        self.need(len)?;
        let bytes = self.buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec())
            .map_err(|e| AmqpError::MalformedFrame(format!("shortstr not utf8: {e}")))
    }

    pub fn read_longstr(&mut self) -> AmqpResult<Vec<u8>> {
        let len = self.read_long()? as usize;
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len).to_vec())
    }

    pub fn read_field_value(&mut self) -> AmqpResult<FieldValue> {
        let tag = self.read_octet()?;
        match tag {
            b't' => Ok(FieldValue::Boolean(self.read_octet()? != 0)),
            b'b' => Ok(FieldValue::ShortShortInt(self.read_octet()? as i8)),
            b'B' => Ok(FieldValue::ShortShortUint(self.read_octet()?)),
            b'U' => Ok(FieldValue::ShortInt(self.read_short()? as i16)),
            b'u' => Ok(FieldValue::ShortUint(self.read_short()?)),
            b'I' => Ok(FieldValue::LongInt(self.read_long()? as i32)),
            b'i' => Ok(FieldValue::LongUint(self.read_long()?)),
            b'L' => Ok(FieldValue::LongLongInt(self.read_longlong()? as i64)),
            b'l' => Ok(FieldValue::LongLongUint(self.read_longlong()?)),
            b'f' => {
                self.need(4)?;
                Ok(FieldValue::Float(self.buf.get_f32()))
            }
            b'd' => {
                self.need(8)?;
                Ok(FieldValue::Double(self.buf.get_f64()))
            }
            b'D' => {
                let scale = self.read_octet()?;
                let value = self.read_long()?;
                Ok(FieldValue::Decimal { scale, value })
            }
            b's' => Ok(FieldValue::ShortString(self.read_shortstr()?)),
            b'S' => Ok(FieldValue::LongString(self.read_longstr()?)),
            b'A' => {
                let len = self.read_long()? as usize;
                self.need(len)?;
                let inner = self.buf.copy_to_bytes(len);
                let mut dec = Decoder::new(inner);
                let mut items = Vec::new();
                while dec.has_remaining() {
                    items.push(dec.read_field_value()?);
                }
                Ok(FieldValue::FieldArray(items))
            }
            b'T' => Ok(FieldValue::Timestamp(self.read_timestamp()?)),
            b'F' => Ok(FieldValue::FieldTable(self.read_table()?)),
            b'V' => Ok(FieldValue::Void),
            other => Err(AmqpError::UnsupportedFieldType(other)),
        }
    }

    pub fn read_table(&mut self) -> AmqpResult<FieldTable> {
        let len = self.read_long()? as usize;
        self.need(len)?;
        let inner = self.buf.copy_to_bytes(len);
        let mut dec = Decoder::new(inner);
        let mut table = FieldTable::new();
        while dec.has_remaining() {
            let key = dec.read_shortstr()?;
            let value = dec.read_field_value()?;
            table.insert(key, value);
        }
        Ok(table)
    }
}
