//! # Modbus Protocol Family
//!
//! One family covers every Modbus framing:
//!
//! | Type | Frame | Check |
//! |------|-------|-------|
//! | TCP / UDP | MBAP header (transaction, protocol 0, length) + PDU | length field |
//! | RTU (serial or in TCP) | slave + PDU + CRC-16 (little-endian) | CRC |
//! | ASCII (serial or in TCP) | `:` + hex(slave + PDU + LRC) + CRLF | LRC |
//!
//! Every framing shares the same protocol units, which produce and consume
//! the `slave + function + data` payload.
//!
//! ## Error Codes
//!
//! Exception replies (function code with bit 7 set) raise the exception
//! byte as a protocol error. Framing failures use 500 (TCP length), 501
//! (CRC) and 502 (LRC).

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use crc::{Crc, CRC_16_MODBUS};
use tokio_util::sync::CancellationToken;

use super::{read_u16_be, read_u8, take, ProtocolFamily, ProtocolUnit, TransportKind};
use crate::address::{AddressDef, AddressTranslator, ModbusTranslator};
use crate::connector::FrameSplitter;
use crate::controller::KeyFn;
use crate::error::{FieldbusError, FieldbusResult, MODBUS_TCP_LENGTH_ERROR};
use crate::linker::ProtocolLinker;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Holding register where devices keep their clock
pub const SYSTEM_TIME_REGISTER: u16 = 30000;

/// Registers of the device clock: year, month/day, hour/minute, second, millisecond
pub const SYSTEM_TIME_REGISTERS: u16 = 5;

/// Largest read reply payload: 125 registers or 2000 coils
pub const MAX_READ_BYTES: usize = 250;

/// Largest write request payload: 123 registers or 1968 coils
pub const MAX_WRITE_BYTES: usize = 246;

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Two's complement of the byte sum
pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)).wrapping_neg()
}

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> FieldbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(FieldbusError::frame(format!("unsupported function code 0x{:02X}", value))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Coil and discrete input functions carry packed bits
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Read the slave and function bytes, raising exception replies
fn read_header(bytes: &[u8], cursor: &mut usize) -> FieldbusResult<(u8, u8)> {
    let slave = read_u8(bytes, cursor)?;
    let function = read_u8(bytes, cursor)?;
    if function & 0x80 != 0 {
        let code = read_u8(bytes, cursor)?;
        return Err(FieldbusError::modbus_exception(function, code));
    }
    Ok((slave, function))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDataModbusInputStruct {
    pub slave: u8,
    pub function: ModbusFunction,
    pub start: u16,
    pub count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDataModbusOutputStruct {
    pub slave: u8,
    pub function: u8,
    pub data: Vec<u8>,
}

/// Read coils, discrete inputs, holding or input registers
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadDataModbusProtocol;

impl ProtocolUnit for ReadDataModbusProtocol {
    type Input = ReadDataModbusInputStruct;
    type Output = ReadDataModbusOutputStruct;

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(6);
        frame.push(input.slave);
        frame.push(input.function.to_u8());
        frame.extend_from_slice(&input.start.to_be_bytes());
        frame.extend_from_slice(&input.count.to_be_bytes());
        Ok(frame)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Self::Output> {
        let (slave, function) = read_header(bytes, cursor)?;
        let byte_count = read_u8(bytes, cursor)? as usize;
        let data = take(bytes, cursor, byte_count)?.to_vec();
        Ok(ReadDataModbusOutputStruct { slave, function, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataModbusOutputStruct {
    pub slave: u8,
    pub function: u8,
    pub address: u16,
    /// Written value for single writes, element count for multiple writes
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSingleDataModbusInputStruct {
    pub slave: u8,
    pub function: ModbusFunction,
    pub address: u16,
    /// Register value, or 0xFF00 / 0x0000 for a coil
    pub value: u16,
}

/// Write one coil or one holding register
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteSingleDataModbusProtocol;

impl ProtocolUnit for WriteSingleDataModbusProtocol {
    type Input = WriteSingleDataModbusInputStruct;
    type Output = WriteDataModbusOutputStruct;

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(6);
        frame.push(input.slave);
        frame.push(input.function.to_u8());
        frame.extend_from_slice(&input.address.to_be_bytes());
        frame.extend_from_slice(&input.value.to_be_bytes());
        Ok(frame)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Self::Output> {
        let (slave, function) = read_header(bytes, cursor)?;
        let address = read_u16_be(bytes, cursor)?;
        let value = read_u16_be(bytes, cursor)?;
        Ok(WriteDataModbusOutputStruct {
            slave,
            function,
            address,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultiDataModbusInputStruct {
    pub slave: u8,
    pub function: ModbusFunction,
    pub start: u16,
    pub count: u16,
    pub data: Vec<u8>,
}

/// Write several coils or holding registers
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteMultiDataModbusProtocol;

impl ProtocolUnit for WriteMultiDataModbusProtocol {
    type Input = WriteMultiDataModbusInputStruct;
    type Output = WriteDataModbusOutputStruct;

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        if input.data.len() > MAX_WRITE_BYTES {
            return Err(FieldbusError::frame(format!(
                "{} data bytes exceed one write request",
                input.data.len()
            )));
        }
        let mut frame = Vec::with_capacity(7 + input.data.len());
        frame.push(input.slave);
        frame.push(input.function.to_u8());
        frame.extend_from_slice(&input.start.to_be_bytes());
        frame.extend_from_slice(&input.count.to_be_bytes());
        frame.push(input.data.len() as u8);
        frame.extend_from_slice(&input.data);
        Ok(frame)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Self::Output> {
        WriteSingleDataModbusProtocol.unformat(bytes, cursor)
    }
}

/// Read the device clock
#[derive(Debug, Clone, Copy, Default)]
pub struct GetSystemTimeModbusProtocol;

impl ProtocolUnit for GetSystemTimeModbusProtocol {
    /// Slave address
    type Input = u8;
    type Output = NaiveDateTime;

    fn format(&self, slave: &u8) -> FieldbusResult<Vec<u8>> {
        ReadDataModbusProtocol.format(&ReadDataModbusInputStruct {
            slave: *slave,
            function: ModbusFunction::ReadHoldingRegisters,
            start: SYSTEM_TIME_REGISTER,
            count: SYSTEM_TIME_REGISTERS,
        })
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<NaiveDateTime> {
        let reply = ReadDataModbusProtocol.unformat(bytes, cursor)?;
        let mut data_cursor = 0;
        let mut words = [0u16; SYSTEM_TIME_REGISTERS as usize];
        for word in words.iter_mut() {
            *word = read_u16_be(&reply.data, &mut data_cursor)?;
        }
        let [year, month_day, hour_minute, second, millisecond] = words;
        NaiveDate::from_ymd_opt(year as i32, (month_day >> 8) as u32, (month_day & 0xFF) as u32)
            .and_then(|date| {
                date.and_hms_milli_opt(
                    (hour_minute >> 8) as u32,
                    (hour_minute & 0xFF) as u32,
                    second as u32,
                    millisecond as u32,
                )
            })
            .ok_or_else(|| FieldbusError::frame(format!("device clock holds no valid time: {:?}", words)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSystemTimeModbusInputStruct {
    pub slave: u8,
    pub time: NaiveDateTime,
}

/// Set the device clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SetSystemTimeModbusProtocol;

impl ProtocolUnit for SetSystemTimeModbusProtocol {
    type Input = SetSystemTimeModbusInputStruct;
    type Output = WriteDataModbusOutputStruct;

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let time = input.time;
        let words = [
            time.year() as u16,
            ((time.month() as u16) << 8) | time.day() as u16,
            ((time.hour() as u16) << 8) | time.minute() as u16,
            time.second() as u16,
            (time.nanosecond() / 1_000_000).min(999) as u16,
        ];
        WriteMultiDataModbusProtocol.format(&WriteMultiDataModbusInputStruct {
            slave: input.slave,
            function: ModbusFunction::WriteMultipleRegisters,
            start: SYSTEM_TIME_REGISTER,
            count: SYSTEM_TIME_REGISTERS,
            data: words.iter().flat_map(|w| w.to_be_bytes()).collect(),
        })
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Self::Output> {
        WriteMultiDataModbusProtocol.unformat(bytes, cursor)
    }
}

/// Framing variant of a Modbus family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusType {
    Tcp,
    Udp,
    Rtu,
    Ascii,
    /// RTU frames carried over a TCP socket
    RtuInTcp,
    /// ASCII frames carried over a TCP socket
    AsciiInTcp,
}

impl ModbusType {
    pub fn uses_mbap(self) -> bool {
        matches!(self, ModbusType::Tcp | ModbusType::Udp)
    }

    pub fn uses_crc(self) -> bool {
        matches!(self, ModbusType::Rtu | ModbusType::RtuInTcp)
    }

    pub fn uses_ascii(self) -> bool {
        matches!(self, ModbusType::Ascii | ModbusType::AsciiInTcp)
    }
}

/// Modbus device family for one slave
pub struct ModbusFamily {
    name: String,
    kind: ModbusType,
    slave: u8,
    transaction_id: AtomicU16,
    translator: Arc<dyn AddressTranslator>,
}

impl ModbusFamily {
    pub fn new(kind: ModbusType, slave: u8) -> Self {
        let name = match kind {
            ModbusType::Tcp => "modbus-tcp",
            ModbusType::Udp => "modbus-udp",
            ModbusType::Rtu => "modbus-rtu",
            ModbusType::Ascii => "modbus-ascii",
            ModbusType::RtuInTcp => "modbus-rtu-in-tcp",
            ModbusType::AsciiInTcp => "modbus-ascii-in-tcp",
        };
        Self {
            name: name.to_string(),
            kind,
            slave,
            transaction_id: AtomicU16::new(rand::random::<u16>()),
            translator: Arc::new(ModbusTranslator::new()),
        }
    }

    /// Same framing with another address vocabulary, e.g. NA200H areas
    pub fn with_translator<S: Into<String>>(mut self, name: S, translator: Arc<dyn AddressTranslator>) -> Self {
        self.name = name.into();
        self.translator = translator;
        self
    }

    pub fn kind(&self) -> ModbusType {
        self.kind
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Next MBAP transaction id, never 0
    fn next_transaction_id(&self) -> u16 {
        loop {
            let id = self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn function(def: &AddressDef) -> FieldbusResult<ModbusFunction> {
        ModbusFunction::from_u8(def.area as u8)
    }

    fn wire_range(def: &AddressDef, count: u32) -> FieldbusResult<(u16, u16)> {
        let end = def.address.checked_add(count);
        if count == 0 || end.map_or(true, |end| end > u16::MAX as u32 + 1) {
            return Err(FieldbusError::format(
                def.area_string.as_str(),
                format!("{} elements at {} exceed the Modbus range", count, def.address),
            ));
        }
        Ok((def.address as u16, count as u16))
    }

    /// Exception check on the `slave + function + data` payload
    fn check_payload(payload: &[u8]) -> FieldbusResult<Option<bool>> {
        match payload {
            [_, function, code, ..] if function & 0x80 != 0 => {
                Err(FieldbusError::modbus_exception(*function, *code))
            }
            [_, function] if function & 0x80 != 0 => Ok(Some(false)),
            [_, _, ..] => Ok(Some(true)),
            _ => Ok(Some(false)),
        }
    }

    fn decode_ascii(frame: &[u8]) -> Option<Vec<u8>> {
        let body = frame.strip_prefix(b":")?.strip_suffix(b"\r\n")?;
        hex::decode(body).ok().filter(|bytes| bytes.len() >= 2)
    }
}

#[async_trait]
impl ProtocolFamily for ModbusFamily {
    fn name(&self) -> &str {
        &self.name
    }

    fn translator(&self) -> Arc<dyn AddressTranslator> {
        self.translator.clone()
    }

    fn transport(&self) -> TransportKind {
        match self.kind {
            ModbusType::Tcp | ModbusType::RtuInTcp | ModbusType::AsciiInTcp => TransportKind::Tcp,
            ModbusType::Udp => TransportKind::Udp,
            ModbusType::Rtu | ModbusType::Ascii => TransportKind::Serial,
        }
    }

    fn default_port(&self) -> u16 {
        502
    }

    fn max_span_bytes(&self, is_read: bool) -> usize {
        if is_read {
            MAX_READ_BYTES
        } else {
            MAX_WRITE_BYTES
        }
    }

    fn default_full_duplex(&self) -> bool {
        self.kind.uses_mbap()
    }

    fn frame_splitter(&self) -> FrameSplitter {
        match self.kind {
            ModbusType::Tcp => FrameSplitter::mbap(),
            ModbusType::Udp => FrameSplitter::Datagram,
            ModbusType::Rtu | ModbusType::RtuInTcp => FrameSplitter::ModbusRtu,
            ModbusType::Ascii | ModbusType::AsciiInTcp => FrameSplitter::modbus_ascii(),
        }
    }

    fn correlation_key(&self) -> Option<KeyFn> {
        if !self.kind.uses_mbap() {
            return None;
        }
        Some(Arc::new(|frame: &[u8]| {
            frame.get(0..2).map(|id| u16::from_be_bytes([id[0], id[1]]) as u32)
        }))
    }

    fn extend_bytes(&self, payload: &[u8]) -> FieldbusResult<Vec<u8>> {
        let frame = match self.kind {
            ModbusType::Tcp | ModbusType::Udp => {
                let mut frame = Vec::with_capacity(6 + payload.len());
                frame.extend_from_slice(&self.next_transaction_id().to_be_bytes());
                frame.extend_from_slice(&[0x00, 0x00]);
                frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                frame.extend_from_slice(payload);
                frame
            }
            ModbusType::Rtu | ModbusType::RtuInTcp => {
                let mut frame = payload.to_vec();
                frame.extend_from_slice(&crc16(payload).to_le_bytes());
                frame
            }
            ModbusType::Ascii | ModbusType::AsciiInTcp => {
                let mut raw = payload.to_vec();
                raw.push(lrc(payload));
                let mut frame = Vec::with_capacity(raw.len() * 2 + 3);
                frame.push(b':');
                frame.extend_from_slice(hex::encode_upper(&raw).as_bytes());
                frame.extend_from_slice(b"\r\n");
                frame
            }
        };
        Ok(frame)
    }

    fn contract_bytes(&self, frame: &[u8]) -> FieldbusResult<Vec<u8>> {
        let payload = match self.kind {
            ModbusType::Tcp | ModbusType::Udp => frame.get(6..).map(<[u8]>::to_vec),
            ModbusType::Rtu | ModbusType::RtuInTcp => frame
                .len()
                .checked_sub(2)
                .map(|end| frame[..end].to_vec()),
            ModbusType::Ascii | ModbusType::AsciiInTcp => Self::decode_ascii(frame).map(|mut raw| {
                raw.pop();
                raw
            }),
        };
        payload.ok_or_else(|| FieldbusError::frame(format!("{} byte frame is too short", frame.len())))
    }

    fn check_right(&self, frame: Option<&[u8]>) -> FieldbusResult<Option<bool>> {
        let frame = match frame {
            Some(frame) if !frame.is_empty() => frame,
            _ => return Ok(None),
        };

        match self.kind {
            ModbusType::Tcp | ModbusType::Udp => {
                if frame.len() < 8 || frame[2..4] != [0x00, 0x00] {
                    return Ok(Some(false));
                }
                let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
                if length != frame.len() - 6 {
                    return Err(FieldbusError::protocol(
                        "Modbus",
                        MODBUS_TCP_LENGTH_ERROR,
                        format!("length field {} but {} bytes follow", length, frame.len() - 6),
                    ));
                }
                Self::check_payload(&frame[6..])
            }
            ModbusType::Rtu | ModbusType::RtuInTcp => {
                if frame.len() < 4 {
                    return Ok(Some(false));
                }
                let (payload, tail) = frame.split_at(frame.len() - 2);
                let received = u16::from_le_bytes([tail[0], tail[1]]);
                let calculated = crc16(payload);
                if received != calculated {
                    return Err(FieldbusError::crc_mismatch(calculated, received));
                }
                Self::check_payload(payload)
            }
            ModbusType::Ascii | ModbusType::AsciiInTcp => {
                let Some(mut raw) = Self::decode_ascii(frame) else {
                    return Ok(Some(false));
                };
                let received = raw.pop().unwrap_or_default();
                let calculated = lrc(&raw);
                if received != calculated {
                    return Err(FieldbusError::lrc_mismatch(calculated, received));
                }
                Self::check_payload(&raw)
            }
        }
    }

    fn format_read(&self, def: &AddressDef, count: u32) -> FieldbusResult<Vec<u8>> {
        let (start, count) = Self::wire_range(def, count)?;
        ReadDataModbusProtocol.format(&ReadDataModbusInputStruct {
            slave: self.slave,
            function: Self::function(def)?,
            start,
            count,
        })
    }

    fn parse_read(&self, payload: &[u8], def: &AddressDef, count: u32) -> FieldbusResult<Vec<u8>> {
        let mut cursor = 0;
        let reply = ReadDataModbusProtocol.unformat(payload, &mut cursor)?;
        let function = Self::function(def)?;
        if reply.function != function.to_u8() {
            return Err(FieldbusError::frame(format!(
                "reply to {} carries function 0x{:02X}",
                function, reply.function
            )));
        }
        let expected = if function.is_bit_function() {
            (count as usize + 7) / 8
        } else {
            count as usize * 2
        };
        if reply.data.len() < expected {
            return Err(FieldbusError::frame(format!(
                "expected {} data bytes, got {}",
                expected,
                reply.data.len()
            )));
        }
        Ok(reply.data)
    }

    fn format_write(&self, def: &AddressDef, count: u32, data: &[u8], _bit: Option<u8>) -> FieldbusResult<Vec<u8>> {
        let (start, count) = Self::wire_range(def, count)?;
        let function = Self::function(def)?;
        match function {
            ModbusFunction::WriteSingleCoil => {
                let on = data.first().map(|b| b & 0x01 != 0).unwrap_or(false);
                WriteSingleDataModbusProtocol.format(&WriteSingleDataModbusInputStruct {
                    slave: self.slave,
                    function,
                    address: start,
                    value: if on { 0xFF00 } else { 0x0000 },
                })
            }
            ModbusFunction::WriteSingleRegister => {
                let value = data
                    .get(0..2)
                    .map(|word| u16::from_be_bytes([word[0], word[1]]))
                    .ok_or_else(|| FieldbusError::codec("single register write needs 2 bytes"))?;
                WriteSingleDataModbusProtocol.format(&WriteSingleDataModbusInputStruct {
                    slave: self.slave,
                    function,
                    address: start,
                    value,
                })
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                WriteMultiDataModbusProtocol.format(&WriteMultiDataModbusInputStruct {
                    slave: self.slave,
                    function,
                    start,
                    count,
                    data: data.to_vec(),
                })
            }
            other => Err(FieldbusError::format(
                def.area_string.as_str(),
                format!("{} is not a write function", other),
            )),
        }
    }

    fn parse_write(&self, payload: &[u8], def: &AddressDef) -> FieldbusResult<()> {
        let mut cursor = 0;
        let reply = WriteSingleDataModbusProtocol.unformat(payload, &mut cursor)?;
        if reply.function != def.area as u8 || reply.address != def.address as u16 {
            return Err(FieldbusError::frame(format!(
                "write echo 0x{:02X}@{} does not match request 0x{:02X}@{}",
                reply.function, reply.address, def.area, def.address
            )));
        }
        Ok(())
    }

    async fn get_time(&self, linker: &ProtocolLinker, cancel: &CancellationToken) -> FieldbusResult<NaiveDateTime> {
        linker
            .send_receive_unit(&GetSystemTimeModbusProtocol, &self.slave, cancel)
            .await?
            .ok_or_else(|| FieldbusError::timeout("read device clock", 0))
    }

    async fn set_time(
        &self,
        linker: &ProtocolLinker,
        time: NaiveDateTime,
        cancel: &CancellationToken,
    ) -> FieldbusResult<()> {
        let input = SetSystemTimeModbusInputStruct { slave: self.slave, time };
        linker
            .send_receive_unit(&SetSystemTimeModbusProtocol, &input, cancel)
            .await?
            .map(|_| ())
            .ok_or_else(|| FieldbusError::timeout("set device clock", 0))
    }
}
