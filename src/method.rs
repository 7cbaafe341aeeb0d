//! Connection and channel-control methods the core must recognize.
//!
//! A `METHOD` frame's payload begins with `(class_id: u16, method_id: u16)`
//! followed by the method's typed arguments. This module only knows about
//! the `Connection` class (10) and the two `Channel` class (20) methods
//! needed to open/close a channel; everything else is the channel layer's
//! concern and is routed there unparsed.

use bytes::BytesMut;

use crate::codec::{Decoder, Encoder, FieldTable};
use crate::error::{AmqpError, AmqpResult};

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;

pub const CONNECTION_START: u16 = 10;
pub const CONNECTION_START_OK: u16 = 11;
pub const CONNECTION_TUNE: u16 = 30;
pub const CONNECTION_TUNE_OK: u16 = 31;
pub const CONNECTION_OPEN: u16 = 40;
pub const CONNECTION_OPEN_OK: u16 = 41;
pub const CONNECTION_CLOSE: u16 = 50;
pub const CONNECTION_CLOSE_OK: u16 = 51;

pub const CHANNEL_OPEN: u16 = 10;
pub const CHANNEL_OPEN_OK: u16 = 11;
pub const CHANNEL_CLOSE: u16 = 40;
pub const CHANNEL_CLOSE_OK: u16 = 41;

/// Splits a method frame payload into its `(class_id, method_id)` header
/// and the remaining argument bytes.
pub fn split_header(payload: &[u8]) -> AmqpResult<(u16, u16, &[u8])> {
    let mut dec = Decoder::new(payload.to_vec());
    let class_id = dec.read_short()?;
    let method_id = dec.read_short()?;
    Ok((class_id, method_id, &payload[4..]))
}

fn with_header(class_id: u16, method_id: u16) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut enc = Encoder::new(&mut buf);
    enc.write_short(class_id);
    enc.write_short(method_id);
    buf
}

#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: FieldTable,
    pub mechanisms: String,
    pub locales: String,
}

impl Start {
    pub fn decode(payload: &[u8]) -> AmqpResult<Self> {
        let mut dec = Decoder::new(payload.to_vec());
        let version_major = dec.read_octet()?;
        let version_minor = dec.read_octet()?;
        let server_properties = dec.read_table()?;
        let mechanisms = String::from_utf8(dec.read_longstr()?)
            .map_err(|e| AmqpError::MalformedFrame(format!("mechanisms not utf8: {e}")))?;
        let locales = String::from_utf8(dec.read_longstr()?)
            .map_err(|e| AmqpError::MalformedFrame(format!("locales not utf8: {e}")))?;
        Ok(Start {
            version_major,
            version_minor,
            server_properties,
            mechanisms,
            locales,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOk {
    pub client_properties: FieldTable,
    pub mechanism: String,
    pub response: Vec<u8>,
    pub locale: String,
}

impl StartOk {
    pub fn encode(&self) -> AmqpResult<Vec<u8>> {
        let mut buf = with_header(CLASS_CONNECTION, CONNECTION_START_OK);
        let mut enc = Encoder::new(&mut buf);
        enc.write_table(&self.client_properties)?;
        enc.write_shortstr(&self.mechanism)?;
        enc.write_longstr(&self.response);
        enc.write_shortstr(&self.locale)?;
        Ok(buf.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Tune {
    pub fn decode(payload: &[u8]) -> AmqpResult<Self> {
        let mut dec = Decoder::new(payload.to_vec());
        Ok(Tune {
            channel_max: dec.read_short()?,
            frame_max: dec.read_long()?,
            heartbeat: dec.read_short()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOk {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl TuneOk {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = with_header(CLASS_CONNECTION, CONNECTION_TUNE_OK);
        let mut enc = Encoder::new(&mut buf);
        enc.write_short(self.channel_max);
        enc.write_long(self.frame_max);
        enc.write_short(self.heartbeat);
        buf.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub virtual_host: String,
    pub capabilities: String,
    pub insist: bool,
}

impl Open {
    pub fn encode(&self) -> AmqpResult<Vec<u8>> {
        let mut buf = with_header(CLASS_CONNECTION, CONNECTION_OPEN);
        let mut enc = Encoder::new(&mut buf);
        enc.write_shortstr(&self.virtual_host)?;
        enc.write_shortstr(&self.capabilities)?;
        enc.write_bits(&[self.insist]);
        Ok(buf.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenOk;

impl OpenOk {
    pub fn encode() -> Vec<u8> {
        with_header(CLASS_CONNECTION, CONNECTION_OPEN_OK).to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl Close {
    pub fn decode(payload: &[u8]) -> AmqpResult<Self> {
        let mut dec = Decoder::new(payload.to_vec());
        Ok(Close {
            reply_code: dec.read_short()?,
            reply_text: dec.read_shortstr()?,
            class_id: dec.read_short()?,
            method_id: dec.read_short()?,
        })
    }

    pub fn encode(&self) -> AmqpResult<Vec<u8>> {
        let mut buf = with_header(CLASS_CONNECTION, CONNECTION_CLOSE);
        let mut enc = Encoder::new(&mut buf);
        enc.write_short(self.reply_code);
        enc.write_shortstr(&self.reply_text)?;
        enc.write_short(self.class_id);
        enc.write_short(self.method_id);
        Ok(buf.to_vec())
    }

    /// A client-initiated, clean close: code 200 ("reply success"), no
    /// offending class/method.
    pub fn clean() -> Self {
        Close {
            reply_code: 200,
            reply_text: String::new(),
            class_id: 0,
            method_id: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseOk;

impl CloseOk {
    pub fn encode(class_id: u16) -> Vec<u8> {
        let method_id = if class_id == CLASS_CHANNEL {
            CHANNEL_CLOSE_OK
        } else {
            CONNECTION_CLOSE_OK
        };
        with_header(class_id, method_id).to_vec()
    }
}

/// `Channel.Open` carries one obsolete `out-of-band` shortstr field, kept
/// empty by every modern client.
pub fn channel_open() -> Vec<u8> {
    let mut buf = with_header(CLASS_CHANNEL, CHANNEL_OPEN);
    let mut enc = Encoder::new(&mut buf);
    enc.write_shortstr("").expect("empty string always fits");
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_ok_roundtrips_through_split_header() {
        let mut props = FieldTable::new();
        props.insert(
            "product".to_string(),
            crate::codec::FieldValue::ShortString("amqp-core".into()),
        );
        let start_ok = StartOk {
            client_properties: props,
            mechanism: "AMQPLAIN".into(),
            response: vec![1, 2, 3],
            locale: "en_US".into(),
        };
        let payload = start_ok.encode().unwrap();
        let (class_id, method_id, _) = split_header(&payload).unwrap();
        assert_eq!(class_id, CLASS_CONNECTION);
        assert_eq!(method_id, CONNECTION_START_OK);
    }

    #[test]
    fn tune_decode() {
        let tune_ok = TuneOk {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: 60,
        };
        let payload = tune_ok.encode();
        let (_, _, args) = split_header(&payload).unwrap();
        let decoded = Tune::decode(args).unwrap();
        assert_eq!(decoded.channel_max, 2047);
        assert_eq!(decoded.frame_max, 131072);
        assert_eq!(decoded.heartbeat, 60);
    }

    #[test]
    fn close_roundtrip() {
        let close = Close {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED".into(),
            class_id: 0,
            method_id: 0,
        };
        let payload = close.encode().unwrap();
        let (_, _, args) = split_header(&payload).unwrap();
        let decoded = Close::decode(args).unwrap();
        assert_eq!(decoded, close);
    }
}
