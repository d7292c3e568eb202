//! # Siemens S7 Protocol Family
//!
//! S7 communication over ISO-on-TCP (RFC 1006, port 102).
//!
//! ## Session Setup
//!
//! After the TCP connect the machine runs [`SiemensFamily::handshake`]:
//!
//! 1. COTP connection request carrying the local and remote TSAP, answered
//!    by a connection confirm (TPDU type `0xD0`)
//! 2. S7 setup communication, which negotiates the PDU size. The PDU size
//!    caps the payload of every later read and write request.
//!
//! ## Frames
//!
//! ```text
//! TPKT      03 00 LL LL
//! COTP DT   02 F0 80
//! S7        32 ROSCTR 00 00 REF REF PLEN PLEN DLEN DLEN [CLASS CODE] params data
//! ```
//!
//! The PDU reference doubles as the correlation key for full duplex
//! channels. Error class and code sit at frame bytes 17/18 (ROSCTR 1-3) or
//! 27/28 (ROSCTR 7) and are reported as `class << 8 | code`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{read_u16_be, read_u8, take, ProtocolFamily, ProtocolUnit, TransportKind};
use crate::address::{s7_area, AddressDef, AddressTranslator, SiemensTranslator};
use crate::connector::FrameSplitter;
use crate::controller::KeyFn;
use crate::error::{FieldbusError, FieldbusResult};
use crate::linker::ProtocolLinker;

const ISO_ID: u8 = 0x03;
const ISO_CONN_REQ: u8 = 0xE0;
const ISO_CONN_OK: u8 = 0xD0;
const ISO_DATA: u8 = 0xF0;
const S7_ID: u8 = 0x32;

/// TPKT + COTP data header
pub const TPKT_ISO_LEN: usize = 7;

/// PDU size requested during setup communication
pub const PDU_LEN_REQ: u16 = 480;

/// Smallest PDU every S7 CPU supports, used until negotiation finishes
pub const PDU_LEN_MIN: u16 = 240;

/// S7 response header of a read job
const READ_RES_OVERHEAD: u16 = 18;

/// S7 request header of a write job
const WRITE_REQ_OVERHEAD: u16 = 28;

/// Item return code of a successful access
pub const RES_SUCCESS: u8 = 0xFF;

/// Transport sizes of a request item
pub mod transport_size {
    pub const BIT: u8 = 0x01;
    pub const BYTE: u8 = 0x02;
    pub const COUNTER: u8 = 0x1C;
    pub const TIMER: u8 = 0x1D;
}

/// Transport sizes of a data item
mod data_size {
    pub const BIT: u8 = 0x03;
    pub const BYTE_WORD_DWORD: u8 = 0x04;
    pub const INTEGER: u8 = 0x05;
    pub const OCTET_STRING: u8 = 0x09;
}

/// Connection resource types encoded in the remote TSAP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Pg,
    Op,
    Basic,
}

impl ConnectionType {
    fn code(self) -> u16 {
        match self {
            ConnectionType::Pg => 0x01,
            ConnectionType::Op => 0x02,
            ConnectionType::Basic => 0x03,
        }
    }
}

fn s7_header(rosctr: u8, pdu_ref: u16, param_len: u16, data_len: u16) -> Vec<u8> {
    let mut pdu = vec![S7_ID, rosctr, 0x00, 0x00];
    pdu.extend_from_slice(&pdu_ref.to_be_bytes());
    pdu.extend_from_slice(&param_len.to_be_bytes());
    pdu.extend_from_slice(&data_len.to_be_bytes());
    pdu
}

/// Skip the 12 byte ack-data header and check the function code
fn read_ack_header(bytes: &[u8], cursor: &mut usize, function: u8) -> FieldbusResult<()> {
    let header = take(bytes, cursor, 12)?;
    if header[0] != S7_ID {
        return Err(FieldbusError::frame("missing S7 protocol id"));
    }
    let error = ((header[10] as i32) << 8) | header[11] as i32;
    if error != 0 {
        return Err(siemens_error(error));
    }
    let reply_function = read_u8(bytes, cursor)?;
    if reply_function != function {
        return Err(FieldbusError::frame(format!(
            "reply carries function 0x{:02X}, expected 0x{:02X}",
            reply_function, function
        )));
    }
    Ok(())
}

fn siemens_error(code: i32) -> FieldbusError {
    let description = match code >> 8 {
        0x81 => "application relationship error",
        0x82 => "object definition error",
        0x83 => "no resources available",
        0x84 => "error on service processing",
        0x85 => "error on supplies",
        0x87 => "access error",
        _ => "unknown error class",
    };
    FieldbusError::protocol("Siemens", code, format!("{} (0x{:04X})", description, code))
}

fn item_error(code: u8) -> FieldbusError {
    let description = match code {
        0x01 => "hardware fault",
        0x03 => "accessing the object not allowed",
        0x05 => "invalid address",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unspecified item error",
    };
    FieldbusError::protocol("Siemens", code as i32, description)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReferenceSiemensInputStruct {
    pub local_tsap: u16,
    pub remote_tsap: u16,
}

/// COTP connection request, exchanged without S7 framing
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateReferenceSiemensProtocol;

impl ProtocolUnit for CreateReferenceSiemensProtocol {
    type Input = CreateReferenceSiemensInputStruct;
    type Output = ();

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let mut frame = vec![
            ISO_ID, 0x00, 0x00, 0x16, // TPKT, 22 bytes
            0x11, ISO_CONN_REQ, // COTP length, CR
            0x00, 0x00, 0x00, 0x01, 0x00, // dst ref, src ref, class
            0xC0, 0x01, 0x0A, // TPDU size 1024
            0xC1, 0x02,
        ];
        frame.extend_from_slice(&input.local_tsap.to_be_bytes());
        frame.extend_from_slice(&[0xC2, 0x02]);
        frame.extend_from_slice(&input.remote_tsap.to_be_bytes());
        Ok(frame)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<()> {
        let header = take(bytes, cursor, 6)?;
        if header[0] != ISO_ID || header[5] != ISO_CONN_OK {
            return Err(FieldbusError::connection("PLC refused the ISO connection request"));
        }
        *cursor = bytes.len();
        Ok(())
    }

    fn is_special(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishAssociationSiemensInputStruct {
    pub pdu_ref: u16,
    pub pdu_length: u16,
}

/// S7 setup communication; the output is the negotiated PDU size
#[derive(Debug, Clone, Copy, Default)]
pub struct EstablishAssociationSiemensProtocol;

impl ProtocolUnit for EstablishAssociationSiemensProtocol {
    type Input = EstablishAssociationSiemensInputStruct;
    type Output = u16;

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let mut pdu = s7_header(0x01, input.pdu_ref, 0x0008, 0x0000);
        // setup communication, max AmQ calling 1, max AmQ called 1
        pdu.extend_from_slice(&[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01]);
        pdu.extend_from_slice(&input.pdu_length.to_be_bytes());
        Ok(pdu)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<u16> {
        read_ack_header(bytes, cursor, 0xF0)?;
        take(bytes, cursor, 5)?;
        let pdu_length = read_u16_be(bytes, cursor)?;
        if pdu_length == 0 {
            return Err(FieldbusError::connection("PDU negotiation failed"));
        }
        Ok(pdu_length)
    }
}

/// One variable of a read or write job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiemensItem {
    pub area: u8,
    pub db_number: u16,
    /// Item transport size, see [`transport_size`]
    pub transport: u8,
    /// Number of elements of `transport` size
    pub count: u16,
    /// Bit address for bit and byte items, element number for timers and counters
    pub address: u32,
}

impl SiemensItem {
    fn encode(&self, pdu: &mut Vec<u8>) {
        pdu.extend_from_slice(&[0x12, 0x0A, 0x10, self.transport]);
        pdu.extend_from_slice(&self.count.to_be_bytes());
        pdu.extend_from_slice(&self.db_number.to_be_bytes());
        pdu.push(self.area);
        pdu.extend_from_slice(&self.address.to_be_bytes()[1..]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadVariableSiemensInputStruct {
    pub pdu_ref: u16,
    pub item: SiemensItem,
}

/// Read one variable
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadVariableSiemensProtocol;

impl ProtocolUnit for ReadVariableSiemensProtocol {
    type Input = ReadVariableSiemensInputStruct;
    type Output = Vec<u8>;

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let mut pdu = s7_header(0x01, input.pdu_ref, 0x000E, 0x0000);
        pdu.extend_from_slice(&[0x04, 0x01]);
        input.item.encode(&mut pdu);
        Ok(pdu)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Vec<u8>> {
        read_ack_header(bytes, cursor, 0x04)?;
        let _items = read_u8(bytes, cursor)?;
        let return_code = read_u8(bytes, cursor)?;
        if return_code != RES_SUCCESS {
            return Err(item_error(return_code));
        }
        let size = read_u8(bytes, cursor)?;
        let length = read_u16_be(bytes, cursor)? as usize;
        let byte_len = match size {
            data_size::BIT | data_size::BYTE_WORD_DWORD | data_size::INTEGER => (length + 7) / 8,
            _ => length,
        };
        Ok(take(bytes, cursor, byte_len)?.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteVariableSiemensInputStruct {
    pub pdu_ref: u16,
    pub item: SiemensItem,
    pub data: Vec<u8>,
}

/// Write one variable
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteVariableSiemensProtocol;

impl ProtocolUnit for WriteVariableSiemensProtocol {
    type Input = WriteVariableSiemensInputStruct;
    type Output = ();

    fn format(&self, input: &Self::Input) -> FieldbusResult<Vec<u8>> {
        let (size, length) = match input.item.transport {
            transport_size::BIT => (data_size::BIT, 1),
            transport_size::COUNTER | transport_size::TIMER => (data_size::OCTET_STRING, input.data.len()),
            _ => (data_size::BYTE_WORD_DWORD, input.data.len() * 8),
        };
        let mut pdu = s7_header(0x01, input.pdu_ref, 0x000E, (input.data.len() + 4) as u16);
        pdu.extend_from_slice(&[0x05, 0x01]);
        input.item.encode(&mut pdu);
        pdu.extend_from_slice(&[0x00, size]);
        pdu.extend_from_slice(&(length as u16).to_be_bytes());
        pdu.extend_from_slice(&input.data);
        Ok(pdu)
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<()> {
        read_ack_header(bytes, cursor, 0x05)?;
        let _items = read_u8(bytes, cursor)?;
        match read_u8(bytes, cursor)? {
            RES_SUCCESS => Ok(()),
            code => Err(item_error(code)),
        }
    }
}

/// Siemens S7 family for one CPU
pub struct SiemensFamily {
    rack: u8,
    slot: u8,
    connection_type: ConnectionType,
    local_tsap: u16,
    pdu_length: AtomicU16,
    pdu_ref: AtomicU16,
    translator: Arc<SiemensTranslator>,
}

impl SiemensFamily {
    pub fn new(rack: u8, slot: u8) -> Self {
        Self {
            rack,
            slot,
            connection_type: ConnectionType::default(),
            local_tsap: 0x0100,
            pdu_length: AtomicU16::new(0),
            pdu_ref: AtomicU16::new(0),
            translator: Arc::new(SiemensTranslator),
        }
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    pub fn remote_tsap(&self) -> u16 {
        (self.connection_type.code() << 8) + self.rack as u16 * 0x20 + self.slot as u16
    }

    pub fn local_tsap(&self) -> u16 {
        self.local_tsap
    }

    /// Negotiated PDU size, or the minimum before negotiation
    pub fn pdu_length(&self) -> u16 {
        match self.pdu_length.load(Ordering::Acquire) {
            0 => PDU_LEN_MIN,
            length => length,
        }
    }

    fn next_pdu_ref(&self) -> u16 {
        self.pdu_ref.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Build the request item of a span
    fn item(&self, def: &AddressDef, count: u32, bit: Option<u8>) -> FieldbusResult<SiemensItem> {
        let area = (def.area & 0xFF) as u8;
        let db_number = (def.area >> 8) as u16;
        let bit_address = def.address.checked_mul(8);
        let (transport, address, count) = match (area, bit) {
            (s7_area::TIMERS, _) => (transport_size::TIMER, Some(def.address), count),
            (s7_area::COUNTERS, _) => (transport_size::COUNTER, Some(def.address), count),
            (_, Some(bit)) => (transport_size::BIT, bit_address.and_then(|a| a.checked_add(bit as u32)), 1),
            (_, None) => (transport_size::BYTE, bit_address, count),
        };
        let address = match address {
            Some(address) if address <= 0x00FF_FFFF && count <= u16::MAX as u32 => address,
            _ => {
                return Err(FieldbusError::format(
                    def.area_string.as_str(),
                    format!("{} elements at {} exceed the S7 address range", count, def.address),
                ))
            }
        };
        Ok(SiemensItem {
            area,
            db_number,
            transport,
            count: count as u16,
            address,
        })
    }

    fn element_bytes(def: &AddressDef) -> usize {
        match (def.area & 0xFF) as u8 {
            s7_area::TIMERS | s7_area::COUNTERS => 2,
            _ => 1,
        }
    }
}

#[async_trait]
impl ProtocolFamily for SiemensFamily {
    fn name(&self) -> &str {
        "siemens-tcp"
    }

    fn translator(&self) -> Arc<dyn AddressTranslator> {
        self.translator.clone()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn default_port(&self) -> u16 {
        102
    }

    fn max_span_bytes(&self, is_read: bool) -> usize {
        let overhead = if is_read { READ_RES_OVERHEAD } else { WRITE_REQ_OVERHEAD };
        self.pdu_length().saturating_sub(overhead) as usize
    }

    fn frame_splitter(&self) -> FrameSplitter {
        FrameSplitter::tpkt()
    }

    fn correlation_key(&self) -> Option<KeyFn> {
        Some(Arc::new(|frame: &[u8]| match frame {
            [ISO_ID, _, _, _, _, ISO_DATA, _, S7_ID, _, _, _, hi, lo, ..] => {
                Some(u16::from_be_bytes([*hi, *lo]) as u32)
            }
            _ => None,
        }))
    }

    fn extend_bytes(&self, payload: &[u8]) -> FieldbusResult<Vec<u8>> {
        let total = payload.len() + TPKT_ISO_LEN;
        if total > u16::MAX as usize {
            return Err(FieldbusError::frame(format!("{} byte S7 PDU does not fit TPKT", payload.len())));
        }
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&[ISO_ID, 0x00]);
        frame.extend_from_slice(&(total as u16).to_be_bytes());
        frame.extend_from_slice(&[0x02, ISO_DATA, 0x80]);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    fn contract_bytes(&self, frame: &[u8]) -> FieldbusResult<Vec<u8>> {
        frame
            .get(TPKT_ISO_LEN..)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| FieldbusError::frame(format!("{} byte frame is too short", frame.len())))
    }

    fn check_right(&self, frame: Option<&[u8]>) -> FieldbusResult<Option<bool>> {
        let frame = match frame {
            Some(frame) if !frame.is_empty() => frame,
            _ => return Ok(None),
        };
        if frame.len() < TPKT_ISO_LEN || frame[0] != ISO_ID {
            return Ok(Some(false));
        }
        if u16::from_be_bytes([frame[2], frame[3]]) as usize != frame.len() {
            return Ok(Some(false));
        }

        match frame[5] {
            ISO_CONN_OK | ISO_CONN_REQ => Ok(Some(true)),
            ISO_DATA => {
                if frame.len() < 19 || frame[7] != S7_ID {
                    return Ok(Some(false));
                }
                let (class, code) = match frame[8] {
                    0x01..=0x03 => (frame[17], frame[18]),
                    0x07 if frame.len() >= 29 => (frame[27], frame[28]),
                    _ => (0, 0),
                };
                if class != 0 || code != 0 {
                    return Err(siemens_error(((class as i32) << 8) | code as i32));
                }
                Ok(Some(true))
            }
            _ => Ok(Some(false)),
        }
    }

    fn format_read(&self, def: &AddressDef, count: u32) -> FieldbusResult<Vec<u8>> {
        ReadVariableSiemensProtocol.format(&ReadVariableSiemensInputStruct {
            pdu_ref: self.next_pdu_ref(),
            item: self.item(def, count, None)?,
        })
    }

    fn parse_read(&self, payload: &[u8], def: &AddressDef, count: u32) -> FieldbusResult<Vec<u8>> {
        let mut cursor = 0;
        let data = ReadVariableSiemensProtocol.unformat(payload, &mut cursor)?;
        let expected = count as usize * Self::element_bytes(def);
        if data.len() < expected {
            return Err(FieldbusError::frame(format!(
                "expected {} data bytes, got {}",
                expected,
                data.len()
            )));
        }
        Ok(data)
    }

    fn format_write(&self, def: &AddressDef, count: u32, data: &[u8], bit: Option<u8>) -> FieldbusResult<Vec<u8>> {
        let data = match bit {
            Some(_) => vec![data.first().map(|b| (*b != 0) as u8).unwrap_or(0)],
            None => data.to_vec(),
        };
        WriteVariableSiemensProtocol.format(&WriteVariableSiemensInputStruct {
            pdu_ref: self.next_pdu_ref(),
            item: self.item(def, count, bit)?,
            data,
        })
    }

    fn parse_write(&self, payload: &[u8], _def: &AddressDef) -> FieldbusResult<()> {
        let mut cursor = 0;
        WriteVariableSiemensProtocol.unformat(payload, &mut cursor)
    }

    fn supports_bit_write(&self) -> bool {
        true
    }

    async fn handshake(&self, linker: &ProtocolLinker, cancel: &CancellationToken) -> FieldbusResult<()> {
        let request = CreateReferenceSiemensInputStruct {
            local_tsap: self.local_tsap,
            remote_tsap: self.remote_tsap(),
        };
        linker
            .send_receive_unit(&CreateReferenceSiemensProtocol, &request, cancel)
            .await?
            .ok_or_else(|| FieldbusError::connection("no reply to the ISO connection request"))?;

        let setup = EstablishAssociationSiemensInputStruct {
            pdu_ref: self.next_pdu_ref(),
            pdu_length: PDU_LEN_REQ,
        };
        let pdu_length = linker
            .send_receive_unit(&EstablishAssociationSiemensProtocol, &setup, cancel)
            .await?
            .ok_or_else(|| FieldbusError::connection("no reply to the PDU negotiation"))?;
        self.pdu_length.store(pdu_length, Ordering::Release);
        debug!("S7 PDU size negotiated: {}", pdu_length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(text: &str) -> AddressDef {
        SiemensTranslator.translate(text, true, false).unwrap()
    }

    /// Ack-data reply frame around an S7 parameter and data section
    fn ack(pdu_ref: u16, class: u8, code: u8, params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut pdu = s7_header(0x03, pdu_ref, params.len() as u16, data.len() as u16);
        pdu.extend_from_slice(&[class, code]);
        pdu.extend_from_slice(params);
        pdu.extend_from_slice(data);
        SiemensFamily::new(0, 1).extend_bytes(&pdu).unwrap()
    }

    #[test]
    fn test_connection_request() {
        let family = SiemensFamily::new(0, 1);
        let request = CreateReferenceSiemensProtocol
            .format(&CreateReferenceSiemensInputStruct {
                local_tsap: family.local_tsap(),
                remote_tsap: family.remote_tsap(),
            })
            .unwrap();
        assert_eq!(
            request,
            vec![
                0x03, 0x00, 0x00, 0x16, 0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1,
                0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x01
            ]
        );
        assert!(CreateReferenceSiemensProtocol.is_special());
        assert_eq!(SiemensFamily::new(1, 2).remote_tsap(), 0x0122);

        let mut confirm = request.clone();
        confirm[5] = 0xD0;
        assert_eq!(family.check_right(Some(&confirm)).unwrap(), Some(true));
        let mut cursor = 0;
        assert!(CreateReferenceSiemensProtocol.unformat(&confirm, &mut cursor).is_ok());
        assert!(CreateReferenceSiemensProtocol.unformat(&request, &mut 0).is_err());
    }

    #[test]
    fn test_setup_communication() {
        let family = SiemensFamily::new(0, 1);
        let pdu = EstablishAssociationSiemensProtocol
            .format(&EstablishAssociationSiemensInputStruct {
                pdu_ref: 0x0400,
                pdu_length: PDU_LEN_REQ,
            })
            .unwrap();
        let frame = family.extend_bytes(&pdu).unwrap();
        assert_eq!(
            frame,
            vec![
                0x03, 0x00, 0x00, 0x19, 0x02, 0xF0, 0x80, 0x32, 0x01, 0x00, 0x00, 0x04, 0x00, 0x00, 0x08,
                0x00, 0x00, 0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0
            ]
        );

        let reply = ack(0x0400, 0, 0, &[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0], &[]);
        assert_eq!(reply.len(), 27);
        assert_eq!(&reply[25..27], &[0x00, 0xF0]);
        assert_eq!(family.check_right(Some(&reply)).unwrap(), Some(true));
        let payload = family.contract_bytes(&reply).unwrap();
        let negotiated = EstablishAssociationSiemensProtocol.unformat(&payload, &mut 0).unwrap();
        assert_eq!(negotiated, 240);
    }

    #[test]
    fn test_read_request_layout() {
        let family = SiemensFamily::new(0, 1);
        let request = family.format_read(&def("DB1 10"), 4).unwrap();
        let frame = family.extend_bytes(&request).unwrap();
        assert_eq!(frame.len(), 31);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x1F]);
        assert_eq!(
            &frame[17..],
            &[0x04, 0x01, 0x12, 0x0A, 0x10, 0x02, 0x00, 0x04, 0x00, 0x01, 0x84, 0x00, 0x00, 0x50]
        );

        let key = family.correlation_key().unwrap();
        let sent_ref = key(&frame).unwrap();
        let reply = ack(sent_ref as u16, 0, 0, &[0x04, 0x01], &[0xFF, 0x04, 0x00, 0x20, 1, 2, 3, 4]);
        assert_eq!(key(&reply), Some(sent_ref));
        let payload = family.contract_bytes(&reply).unwrap();
        assert_eq!(family.parse_read(&payload, &def("DB1 10"), 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(family.parse_read(&payload, &def("DB1 10"), 5).is_err());
    }

    #[test]
    fn test_item_and_header_errors() {
        let family = SiemensFamily::new(0, 1);
        let missing_db = ack(1, 0, 0, &[0x04, 0x01], &[0x0A, 0x00, 0x00, 0x00]);
        let payload = family.contract_bytes(&missing_db).unwrap();
        let err = family.parse_read(&payload, &def("DB9 0"), 1).unwrap_err();
        assert_eq!(err.error_code(), 0x0A);

        let rejected = ack(1, 0x81, 0x04, &[0x04, 0x01], &[]);
        let err = family.check_right(Some(&rejected)).unwrap_err();
        assert_eq!(err.error_code(), 0x8104);
        assert!(!err.forces_disconnect());

        let mut userdata = vec![0u8; 29];
        userdata[..8].copy_from_slice(&[0x03, 0x00, 0x00, 0x1D, 0x02, 0xF0, 0x80, 0x32]);
        userdata[8] = 0x07;
        userdata[27] = 0xD6;
        userdata[28] = 0x02;
        assert_eq!(family.check_right(Some(&userdata)).unwrap_err().error_code(), 0xD602);

        assert_eq!(family.check_right(Some(&[0x04, 0x00])).unwrap(), Some(false));
        assert_eq!(family.check_right(None).unwrap(), None);
    }

    #[test]
    fn test_item_address_range() {
        let family = SiemensFamily::new(0, 1);
        let last = AddressDef {
            area_string: "DB1".to_string(),
            area: (1 << 8) | 0x84,
            address: 0x1F_FFFF,
            sub_address: 0,
        };
        let request = family.format_read(&last, 1).unwrap();
        assert_eq!(&request[21..], &[0xFF, 0xFF, 0xF8]);
        let request = family.format_write(&last, 1, &[1], Some(7)).unwrap();
        assert_eq!(&request[21..24], &[0xFF, 0xFF, 0xFF]);

        for address in [0x20_0000, 536_870_912, u32::MAX] {
            let past = AddressDef { address, ..last.clone() };
            assert!(matches!(family.format_read(&past, 1), Err(FieldbusError::Format { .. })));
            assert!(matches!(
                family.format_write(&past, 1, &[1], Some(0)),
                Err(FieldbusError::Format { .. })
            ));
        }
    }

    #[test]
    fn test_bit_write() {
        let family = SiemensFamily::new(0, 1);
        let request = family.format_write(&def("M 2.3"), 1, &[0x08], Some(3)).unwrap();
        // item: bit transport, area M, bit address 19
        assert_eq!(
            &request[10..],
            &[0x05, 0x01, 0x12, 0x0A, 0x10, 0x01, 0x00, 0x01, 0x00, 0x00, 0x83, 0x00, 0x00, 0x13, 0x00, 0x03, 0x00, 0x01, 0x01]
        );
        assert_eq!(&request[8..10], &[0x00, 0x05]);

        let bytes = family.format_write(&def("DB1 0"), 2, &[0x12, 0x34], None).unwrap();
        assert_eq!(&bytes[24..], &[0x00, 0x04, 0x00, 0x10, 0x12, 0x34]);

        let reply = ack(1, 0, 0, &[0x05, 0x01], &[0xFF]);
        let payload = family.contract_bytes(&reply).unwrap();
        assert!(family.parse_write(&payload, &def("DB1 0")).is_ok());
    }

    #[test]
    fn test_timer_items_count_elements() {
        let family = SiemensFamily::new(0, 1);
        let request = family.format_read(&def("T 3"), 2).unwrap();
        assert_eq!(&request[12..], &[0x12, 0x0A, 0x10, 0x1D, 0x00, 0x02, 0x00, 0x00, 0x1D, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_span_limit_follows_pdu() {
        let family = SiemensFamily::new(0, 1);
        assert_eq!(family.max_span_bytes(true), 222);
        family.pdu_length.store(480, Ordering::Release);
        assert_eq!(family.max_span_bytes(true), 462);
        assert_eq!(family.max_span_bytes(false), 452);
    }
}
