//! # HJ212 Protocol Family
//!
//! Environmental monitoring uploads (HJ 212-2017). The machine acts as the
//! data acquisition terminal and pushes records to a platform; nothing is
//! read back and the platform sends no reply.
//!
//! ```text
//! ## 0101 QN=20240101120000000;ST=22;CN=2011;PW=123456;MN=...;Flag=4;CP=&&...&& 1C80 \r\n
//!    len  data segment                                                         CRC
//! ```
//!
//! Address units name the pollutant code as their area, e.g. `"a34004 0"`.
//! The value goes out as `<code>-Rtd=<value>,<code>-Flag=N`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};

use super::{ProtocolFamily, ProtocolUnit, TransportKind, WriteMode};
use crate::address::{AddressDef, AddressTranslator, AddressUnit, GenericTranslator};
use crate::connector::FrameSplitter;
use crate::error::{FieldbusError, FieldbusResult};

/// Data segments are limited to four decimal digits of length
pub const MAX_SEGMENT_LEN: usize = 9999;

/// Real-time data upload command
pub const CN_REALTIME_DATA: &str = "2011";

/// Air quality monitoring system type
pub const ST_AIR: &str = "22";

const QN_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const DATA_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// CRC of the data segment as defined by HJ 212
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc = (crc >> 8) ^ *byte as u16;
        for _ in 0..8 {
            let carry = crc & 0x0001;
            crc >>= 1;
            if carry != 0 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

/// One monitoring value inside the `CP` section
#[derive(Debug, Clone, PartialEq)]
pub struct Hj212Value {
    pub code: String,
    pub value: f64,
    pub decimals: u8,
    /// Data flag, `N` for normal readings
    pub flag: char,
}

/// Data segment of one upload
#[derive(Debug, Clone, PartialEq)]
pub struct Hj212Record {
    pub qn: String,
    pub st: String,
    pub cn: String,
    pub password: String,
    pub mn: String,
    pub flag: u8,
    pub data_time: NaiveDateTime,
    pub values: Vec<Hj212Value>,
}

/// Real-time data record upload
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteRecordHj212Protocol;

impl ProtocolUnit for WriteRecordHj212Protocol {
    type Input = Hj212Record;
    type Output = Hj212Record;

    fn format(&self, input: &Hj212Record) -> FieldbusResult<Vec<u8>> {
        let values: Vec<String> = input
            .values
            .iter()
            .map(|v| {
                format!(
                    "{code}-Rtd={value:.prec$},{code}-Flag={flag}",
                    code = v.code,
                    value = v.value,
                    prec = v.decimals as usize,
                    flag = v.flag
                )
            })
            .collect();
        let mut cp = format!("DataTime={}", input.data_time.format(DATA_TIME_FORMAT));
        for value in values {
            cp.push(';');
            cp.push_str(&value);
        }
        Ok(format!(
            "QN={};ST={};CN={};PW={};MN={};Flag={};CP=&&{}&&",
            input.qn, input.st, input.cn, input.password, input.mn, input.flag, cp
        )
        .into_bytes())
    }

    fn unformat(&self, bytes: &[u8], cursor: &mut usize) -> FieldbusResult<Hj212Record> {
        let text = std::str::from_utf8(&bytes[(*cursor).min(bytes.len())..])
            .map_err(|_| FieldbusError::frame("HJ212 segment is not UTF-8"))?;
        let (head, cp) = text
            .split_once("CP=&&")
            .ok_or_else(|| FieldbusError::frame("HJ212 segment has no CP section"))?;
        let cp = cp
            .strip_suffix("&&")
            .ok_or_else(|| FieldbusError::frame("HJ212 CP section is not terminated"))?;

        let mut fields = BTreeMap::new();
        for pair in head.split(';').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| FieldbusError::frame(format!("malformed HJ212 field '{}'", pair)))?;
            fields.insert(key, value);
        }
        let field = |key: &str| -> FieldbusResult<String> {
            fields
                .get(key)
                .map(|value| value.to_string())
                .ok_or_else(|| FieldbusError::frame(format!("HJ212 segment misses {}", key)))
        };

        let mut data_time = None;
        let mut values: Vec<Hj212Value> = Vec::new();
        for item in cp.split([';', ',']).filter(|item| !item.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| FieldbusError::frame(format!("malformed HJ212 value '{}'", item)))?;
            if key == "DataTime" {
                data_time = Some(
                    NaiveDateTime::parse_from_str(value, DATA_TIME_FORMAT)
                        .map_err(|e| FieldbusError::frame(format!("bad DataTime '{}': {}", value, e)))?,
                );
            } else if let Some(code) = key.strip_suffix("-Rtd") {
                let number = value
                    .parse::<f64>()
                    .map_err(|_| FieldbusError::frame(format!("bad value for {}: '{}'", code, value)))?;
                let decimals = value.split_once('.').map(|(_, frac)| frac.len() as u8).unwrap_or(0);
                values.push(Hj212Value {
                    code: code.to_string(),
                    value: number,
                    decimals,
                    flag: 'N',
                });
            } else if let Some(code) = key.strip_suffix("-Flag") {
                if let Some(entry) = values.iter_mut().rev().find(|v| v.code == code) {
                    entry.flag = value.chars().next().unwrap_or('N');
                }
            }
        }

        *cursor = bytes.len();
        Ok(Hj212Record {
            qn: field("QN")?,
            st: field("ST")?,
            cn: field("CN")?,
            password: field("PW")?,
            mn: field("MN")?,
            flag: field("Flag")?
                .parse()
                .map_err(|_| FieldbusError::frame("HJ212 Flag is not a number"))?,
            data_time: data_time.ok_or_else(|| FieldbusError::frame("HJ212 CP misses DataTime"))?,
            values,
        })
    }
}

/// HJ212 uploader for one monitoring point
pub struct Hj212Family {
    st: String,
    password: String,
    mn: String,
    translator: Arc<GenericTranslator>,
}

impl Hj212Family {
    /// `mn` is the monitoring point number registered on the platform
    pub fn new<P: Into<String>, M: Into<String>>(password: P, mn: M) -> Self {
        Self {
            st: ST_AIR.to_string(),
            password: password.into(),
            mn: mn.into(),
            translator: Arc::new(GenericTranslator::permissive(8.0)),
        }
    }

    pub fn with_system_type<S: Into<String>>(mut self, st: S) -> Self {
        self.st = st.into();
        self
    }

    /// Record for `values` taken at `at`
    pub fn record(&self, values: &[(AddressUnit, f64)], at: DateTime<Local>) -> Hj212Record {
        Hj212Record {
            qn: at.format(QN_FORMAT).to_string(),
            st: self.st.clone(),
            cn: CN_REALTIME_DATA.to_string(),
            password: self.password.clone(),
            mn: self.mn.clone(),
            flag: 4,
            data_time: at.naive_local(),
            values: values
                .iter()
                .map(|(unit, value)| Hj212Value {
                    code: unit.area.clone(),
                    value: *value,
                    decimals: unit.decimal_pos,
                    flag: 'N',
                })
                .collect(),
        }
    }

    fn reads_unsupported(&self) -> FieldbusError {
        FieldbusError::configuration("HJ212 only uploads records")
    }
}

#[async_trait]
impl ProtocolFamily for Hj212Family {
    fn name(&self) -> &str {
        "hj212-tcp"
    }

    fn translator(&self) -> Arc<dyn AddressTranslator> {
        self.translator.clone()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn default_port(&self) -> u16 {
        9000
    }

    fn max_span_bytes(&self, _is_read: bool) -> usize {
        8
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn frame_splitter(&self) -> FrameSplitter {
        FrameSplitter::hj212()
    }

    fn extend_bytes(&self, payload: &[u8]) -> FieldbusResult<Vec<u8>> {
        if payload.len() > MAX_SEGMENT_LEN {
            return Err(FieldbusError::frame(format!(
                "{} byte HJ212 segment exceeds {}",
                payload.len(),
                MAX_SEGMENT_LEN
            )));
        }
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.extend_from_slice(format!("##{:04}", payload.len()).as_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(format!("{:04X}\r\n", crc16(payload)).as_bytes());
        Ok(frame)
    }

    fn contract_bytes(&self, frame: &[u8]) -> FieldbusResult<Vec<u8>> {
        if frame.len() < 12 {
            return Err(FieldbusError::frame(format!("{} byte HJ212 frame is too short", frame.len())));
        }
        Ok(frame[6..frame.len() - 6].to_vec())
    }

    fn check_right(&self, frame: Option<&[u8]>) -> FieldbusResult<Option<bool>> {
        let frame = match frame {
            Some(frame) if !frame.is_empty() => frame,
            _ => return Ok(None),
        };
        if frame.len() < 12 || !frame.starts_with(b"##") || !frame.ends_with(b"\r\n") {
            return Ok(Some(false));
        }
        let length = std::str::from_utf8(&frame[2..6])
            .ok()
            .and_then(|text| text.parse::<usize>().ok());
        if length != Some(frame.len() - 12) {
            return Ok(Some(false));
        }
        let segment = &frame[6..frame.len() - 6];
        let carried = std::str::from_utf8(&frame[frame.len() - 6..frame.len() - 2])
            .ok()
            .and_then(|text| u16::from_str_radix(text, 16).ok());
        match carried {
            Some(carried) if carried == crc16(segment) => Ok(Some(true)),
            Some(carried) => Err(FieldbusError::crc_mismatch(crc16(segment), carried)),
            None => Ok(Some(false)),
        }
    }

    fn format_read(&self, _def: &AddressDef, _count: u32) -> FieldbusResult<Vec<u8>> {
        Err(self.reads_unsupported())
    }

    fn parse_read(&self, _payload: &[u8], _def: &AddressDef, _count: u32) -> FieldbusResult<Vec<u8>> {
        Err(self.reads_unsupported())
    }

    fn format_write(&self, _def: &AddressDef, _count: u32, _data: &[u8], _bit: Option<u8>) -> FieldbusResult<Vec<u8>> {
        Err(FieldbusError::configuration("HJ212 writes go through records"))
    }

    fn parse_write(&self, _payload: &[u8], _def: &AddressDef) -> FieldbusResult<()> {
        Ok(())
    }

    fn write_mode(&self) -> WriteMode {
        WriteMode::Record
    }

    fn format_record(&self, values: &[(AddressUnit, f64)], at: DateTime<Local>) -> FieldbusResult<Vec<u8>> {
        if values.is_empty() {
            return Err(FieldbusError::configuration("HJ212 record without values"));
        }
        WriteRecordHj212Protocol.format(&self.record(values, at))
    }
}
