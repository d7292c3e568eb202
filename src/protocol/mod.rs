//! Protocol families and their message units.
//!
//! A [`ProtocolUnit`] is a stateless formatter/parser pair for one message
//! type. A [`ProtocolFamily`] bundles everything a machine needs to talk to
//! one kind of device: the address translator, the framing applied by the
//! linker (`extend_bytes` / `contract_bytes` / `check_right`), the span
//! requests built from units, and the transport defaults used by the
//! registry.

pub mod hj212;
pub mod modbus;
pub mod siemens;

use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Local, NaiveDateTime};
use tokio_util::sync::CancellationToken;

use crate::address::{AddressDef, AddressTranslator, AddressUnit};
use crate::codec::Endian;
use crate::connector::FrameSplitter;
use crate::controller::KeyFn;
use crate::error::{FieldbusError, FieldbusResult};
use crate::linker::ProtocolLinker;

/// Formatter/parser pair for one message type
pub trait ProtocolUnit {
    type Input;
    type Output;

    /// Build the request bytes, before the linker adds framing
    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>>;

    /// Parse a reply starting at `cursor`, advancing it past the consumed bytes
    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Self::Output>;

    /// Special units are sent and received without linker framing
    fn is_special(&self) -> bool {
        false
    }
}

pub fn read_u8(bytes: &[u8], cursor: &mut usize) -> FieldbusResult<u8> {
    let value = *bytes
        .get(*cursor)
        .ok_or_else(|| FieldbusError::frame(format!("frame ends at byte {}", cursor)))?;
    *cursor += 1;
    Ok(value)
}

pub fn read_u16_be(bytes: &[u8], cursor: &mut usize) -> FieldbusResult<u16> {
    Ok(BigEndian::read_u16(take(bytes, cursor, 2)?))
}

/// Borrow the next `len` bytes
pub fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> FieldbusResult<&'a [u8]> {
    let end = *cursor + len;
    let slice = bytes.get(*cursor..end).ok_or_else(|| {
        FieldbusError::frame(format!(
            "need {} bytes at offset {}, frame has {}",
            len,
            cursor,
            bytes.len()
        ))
    })?;
    *cursor = end;
    Ok(slice)
}

/// Physical transport a family runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Serial,
}

/// How `set_datas` turns values into messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One write request per combined span
    Spans,
    /// One record carrying every written value
    Record,
}

/// Capabilities of one protocol family
#[async_trait]
pub trait ProtocolFamily: Send + Sync {
    /// Registry name, e.g. `"modbus-tcp"`
    fn name(&self) -> &str;

    fn translator(&self) -> Arc<dyn AddressTranslator>;

    fn default_endian(&self) -> Endian {
        Endian::BigEndianMsbWordOrder
    }

    fn transport(&self) -> TransportKind;

    /// Port used when the connection string carries none
    fn default_port(&self) -> u16;

    /// Payload bytes one read or write span may carry
    fn max_span_bytes(&self, is_read: bool) -> usize;

    fn default_full_duplex(&self) -> bool {
        false
    }

    /// False for fire-and-forget families
    fn expects_reply(&self) -> bool {
        true
    }

    fn frame_splitter(&self) -> FrameSplitter;

    /// Correlation key for full duplex matching
    fn correlation_key(&self) -> Option<KeyFn> {
        None
    }

    /// Add headers, length and checksum to a request payload
    fn extend_bytes(&self, payload: &[u8]) -> FieldbusResult<Vec<u8>>;

    /// Strip framing from a validated reply
    fn contract_bytes(&self, frame: &[u8]) -> FieldbusResult<Vec<u8>>;

    /// Validate a raw reply
    ///
    /// `Ok(None)`: no data. `Ok(Some(false))`: unusable frame, the link is
    /// dropped. `Ok(Some(true))`: proceed. Device rejections and checksum
    /// failures come back as errors carrying their code.
    fn check_right(&self, frame: Option<&[u8]>) -> FieldbusResult<Option<bool>>;

    fn format_read(&self, def: &AddressDef, count: u32) -> FieldbusResult<Vec<u8>>;

    /// Data bytes of a read reply payload
    fn parse_read(&self, payload: &[u8], def: &AddressDef, count: u32) -> FieldbusResult<Vec<u8>>;

    /// Write request for `count` elements; `bit` addresses one bit inside the first element
    fn format_write(&self, def: &AddressDef, count: u32, data: &[u8], bit: Option<u8>) -> FieldbusResult<Vec<u8>>;

    fn parse_write(&self, payload: &[u8], def: &AddressDef) -> FieldbusResult<()>;

    /// Whether a single bit inside a word or byte can be written directly
    fn supports_bit_write(&self) -> bool {
        false
    }

    fn write_mode(&self) -> WriteMode {
        WriteMode::Spans
    }

    fn format_record(&self, values: &[(AddressUnit, f64)], at: DateTime<Local>) -> FieldbusResult<Vec<u8>> {
        let _ = (values, at);
        Err(FieldbusError::configuration(format!(
            "{} does not write records",
            self.name()
        )))
    }

    /// Session setup run after every successful connect
    async fn handshake(&self, linker: &ProtocolLinker, cancel: &CancellationToken) -> FieldbusResult<()> {
        let _ = (linker, cancel);
        Ok(())
    }

    async fn get_time(&self, linker: &ProtocolLinker, cancel: &CancellationToken) -> FieldbusResult<NaiveDateTime> {
        let _ = (linker, cancel);
        Err(FieldbusError::configuration(format!(
            "{} has no device clock",
            self.name()
        )))
    }

    async fn set_time(
        &self,
        linker: &ProtocolLinker,
        time: NaiveDateTime,
        cancel: &CancellationToken,
    ) -> FieldbusResult<()> {
        let _ = (linker, time, cancel);
        Err(FieldbusError::configuration(format!(
            "{} has no device clock",
            self.name()
        )))
    }
}
