//! # Address Model and Translation
//!
//! Devices are addressed with textual tags of the form
//! `"<AREA> <OFFSET>[.<SUB>]"`, for example `"4X 17.3"`, `"V 1"` or `"DB1 0"`.
//! An [`AddressTranslator`] turns such a tag into a wire-level [`AddressDef`]
//! for one protocol family; an [`AddressFormater`] performs the reverse step.
//!
//! ## Area Vocabulary
//!
//! ### Modbus (`ModbusTranslator`)
//!
//! | Area | Table | Read | Write single | Write multiple | Width |
//! |------|-------|------|--------------|----------------|-------|
//! | `0X` | Coils | 0x01 | 0x05 | 0x0F | 1 bit |
//! | `1X` | Discrete inputs | 0x02 | - | - | 1 bit |
//! | `3X` | Input registers | 0x04 | - | - | 2 bytes |
//! | `4X` | Holding registers | 0x03 | 0x06 | 0x10 | 2 bytes |
//!
//! Offsets are 1-based: `"4X 1"` is register 0 on the wire.
//!
//! ### NA200H (`Na200hTranslator`)
//!
//! PLC areas mapped onto the Modbus tables with a base offset, offsets are
//! 0-based: `Q` +20000, `M` +10000, `N` +30000 (coils); `I` +0, `S` +10000
//! (discrete inputs); `IW` +0, `SW` +5000 (input registers); `MW` +0,
//! `QW` +20000, `NW` +21000 (holding registers).
//!
//! ### Siemens (`SiemensTranslator`)
//!
//! `I`/`E` inputs, `Q`/`A` outputs, `M` flags, `DB<n>` data blocks, `V`
//! (alias of `DB1`), `T` timers and `C`/`Z` counters. Offsets are 0-based
//! byte offsets, the sub address is the bit inside the byte.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::DataType;
use crate::error::{FieldbusError, FieldbusResult};

fn default_zoom() -> f64 {
    1.0
}

/// Logical device point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressUnit {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub communication_tag: String,
    pub area: String,
    pub address: u32,
    #[serde(default)]
    pub sub_address: u8,
    pub data_type: DataType,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
    #[serde(default)]
    pub decimal_pos: u8,
}

impl AddressUnit {
    pub fn new<I: Into<String>, A: Into<String>>(
        id: I,
        area: A,
        address: u32,
        data_type: DataType,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            communication_tag: id.clone(),
            id,
            area: area.into(),
            address,
            sub_address: 0,
            data_type,
            zoom: 1.0,
            decimal_pos: 0,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_communication_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.communication_tag = tag.into();
        self
    }

    pub fn with_sub_address(mut self, sub_address: u8) -> Self {
        self.sub_address = sub_address;
        self
    }

    pub fn with_zoom(mut self, zoom: f64) -> Self {
        self.zoom = zoom;
        self
    }

    pub fn with_decimal_pos(mut self, decimal_pos: u8) -> Self {
        self.decimal_pos = decimal_pos;
        self
    }

    /// Textual tag of this unit, e.g. `"4X 2.3"`
    pub fn address_text(&self) -> String {
        AddressFormaterBase.format(&self.area, self.address, self.sub_address)
    }
}

/// Wire-level address produced by a translator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressDef {
    pub area_string: String,
    /// Protocol selector: Modbus function code, or `(db << 8) | s7_area`
    pub area: u32,
    pub address: u32,
    pub sub_address: u8,
}

impl fmt::Display for AddressDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (area=0x{:X}, address={}, sub={})",
            self.area_string, self.area, self.address, self.sub_address
        )
    }
}

/// Split a textual address into area, offset and sub address
pub fn parse_address(text: &str) -> FieldbusResult<(String, u32, u8)> {
    let trimmed = text.trim();
    let (area, tail) = trimmed
        .split_once(' ')
        .ok_or_else(|| FieldbusError::format(text, "expected '<AREA> <OFFSET>'"))?;
    let area = area.trim();
    let tail = tail.trim();
    if area.is_empty() || tail.is_empty() {
        return Err(FieldbusError::format(text, "expected '<AREA> <OFFSET>'"));
    }

    let (offset, sub) = match tail.split_once('.') {
        Some((offset, sub)) => (offset, sub),
        None => (tail, "0"),
    };
    let offset = offset
        .parse::<u32>()
        .map_err(|_| FieldbusError::format(text, format!("offset '{}' is not a number", offset)))?;
    let sub = sub
        .parse::<u8>()
        .map_err(|_| FieldbusError::format(text, format!("sub address '{}' is not a number", sub)))?;

    Ok((area.to_string(), offset, sub))
}

/// Per-family mapping from textual addresses to wire addresses
pub trait AddressTranslator: Send + Sync {
    /// Translate a textual address for a read or a write of one or more elements
    fn translate(&self, address: &str, is_read: bool, is_single: bool) -> FieldbusResult<AddressDef>;

    /// Bytes per element of `area`: 0.125 for bit areas, 2 for registers
    fn area_byte_width(&self, area: &str) -> FieldbusResult<f64>;

    fn area_bit_width(&self, area: &str) -> FieldbusResult<u32> {
        Ok((self.area_byte_width(area)? * 8.0).round() as u32)
    }

    /// Check that a unit's area exists, its offset translates and its sub address fits the element
    fn validate_unit(&self, unit: &AddressUnit) -> FieldbusResult<()> {
        let bits = self.area_bit_width(&unit.area)?;
        if bits > 1 && unit.sub_address as u32 >= bits {
            return Err(FieldbusError::format(
                unit.address_text(),
                format!("sub address must be below {}", bits),
            ));
        }
        if bits == 1 && unit.sub_address != 0 {
            return Err(FieldbusError::format(
                unit.address_text(),
                "bit areas take no sub address",
            ));
        }
        self.translate(&unit.address_text(), true, false)?;
        Ok(())
    }
}

/// Builds textual addresses from area, offset and sub address
pub trait AddressFormater: Send + Sync {
    fn format(&self, area: &str, address: u32, sub_address: u8) -> String;
}

/// `"<AREA> <OFFSET>[.<SUB>]"` formatting
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressFormaterBase;

impl AddressFormater for AddressFormaterBase {
    fn format(&self, area: &str, address: u32, sub_address: u8) -> String {
        if sub_address == 0 {
            format!("{} {}", area, address)
        } else {
            format!("{} {}.{}", area, address, sub_address)
        }
    }
}

/// Number of addressable elements per Modbus table, textual offsets run 1..=65536
const MODBUS_ADDRESS_SPACE: u32 = 0x1_0000;

#[derive(Debug, Clone, Copy)]
struct ModbusArea {
    read: u8,
    write_single: Option<u8>,
    write_multi: Option<u8>,
    byte_width: f64,
}

const COILS: ModbusArea = ModbusArea {
    read: 0x01,
    write_single: Some(0x05),
    write_multi: Some(0x0F),
    byte_width: 0.125,
};
const DISCRETE_INPUTS: ModbusArea = ModbusArea {
    read: 0x02,
    write_single: None,
    write_multi: None,
    byte_width: 0.125,
};
const INPUT_REGISTERS: ModbusArea = ModbusArea {
    read: 0x04,
    write_single: None,
    write_multi: None,
    byte_width: 2.0,
};
const HOLDING_REGISTERS: ModbusArea = ModbusArea {
    read: 0x03,
    write_single: Some(0x06),
    write_multi: Some(0x10),
    byte_width: 2.0,
};

impl ModbusArea {
    fn function_code(&self, text: &str, is_read: bool, is_single: bool) -> FieldbusResult<u8> {
        if is_read {
            return Ok(self.read);
        }
        let code = if is_single { self.write_single } else { self.write_multi };
        code.ok_or_else(|| FieldbusError::format(text, "area is read-only"))
    }
}

/// Standard Modbus tables, 1-based offsets
#[derive(Debug, Clone)]
pub struct ModbusTranslator {
    areas: HashMap<&'static str, ModbusArea>,
}

impl ModbusTranslator {
    pub fn new() -> Self {
        let areas = HashMap::from([
            ("0X", COILS),
            ("1X", DISCRETE_INPUTS),
            ("3X", INPUT_REGISTERS),
            ("4X", HOLDING_REGISTERS),
        ]);
        Self { areas }
    }

    fn area(&self, area: &str) -> FieldbusResult<&ModbusArea> {
        self.areas
            .get(area.to_ascii_uppercase().as_str())
            .ok_or_else(|| FieldbusError::unknown_area(area))
    }
}

impl Default for ModbusTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressTranslator for ModbusTranslator {
    fn translate(&self, address: &str, is_read: bool, is_single: bool) -> FieldbusResult<AddressDef> {
        let (area_string, offset, sub_address) = parse_address(address)?;
        let area = self.area(&area_string)?;
        if offset == 0 {
            return Err(FieldbusError::format(address, "Modbus offsets start at 1"));
        }
        if offset > MODBUS_ADDRESS_SPACE {
            return Err(FieldbusError::format(address, "offset exceeds the Modbus range"));
        }
        let function = area.function_code(address, is_read, is_single)?;

        Ok(AddressDef {
            area_string,
            area: function as u32,
            address: offset - 1,
            sub_address,
        })
    }

    fn area_byte_width(&self, area: &str) -> FieldbusResult<f64> {
        Ok(self.area(area)?.byte_width)
    }
}

/// NA200H PLC areas laid over the Modbus tables, 0-based offsets
#[derive(Debug, Clone)]
pub struct Na200hTranslator {
    areas: HashMap<&'static str, (ModbusArea, u32)>,
}

impl Na200hTranslator {
    pub fn new() -> Self {
        let areas = HashMap::from([
            ("Q", (COILS, 20000)),
            ("M", (COILS, 10000)),
            ("N", (COILS, 30000)),
            ("I", (DISCRETE_INPUTS, 0)),
            ("S", (DISCRETE_INPUTS, 10000)),
            ("IW", (INPUT_REGISTERS, 0)),
            ("SW", (INPUT_REGISTERS, 5000)),
            ("MW", (HOLDING_REGISTERS, 0)),
            ("QW", (HOLDING_REGISTERS, 20000)),
            ("NW", (HOLDING_REGISTERS, 21000)),
        ]);
        Self { areas }
    }

    fn area(&self, area: &str) -> FieldbusResult<&(ModbusArea, u32)> {
        self.areas
            .get(area.to_ascii_uppercase().as_str())
            .ok_or_else(|| FieldbusError::unknown_area(area))
    }
}

impl Default for Na200hTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressTranslator for Na200hTranslator {
    fn translate(&self, address: &str, is_read: bool, is_single: bool) -> FieldbusResult<AddressDef> {
        let (area_string, offset, sub_address) = parse_address(address)?;
        let (area, base) = self.area(&area_string)?;
        let function = area.function_code(address, is_read, is_single)?;
        let wire = base
            .checked_add(offset)
            .filter(|wire| *wire <= u16::MAX as u32)
            .ok_or_else(|| FieldbusError::format(address, "offset exceeds the Modbus range"))?;

        Ok(AddressDef {
            area_string,
            area: function as u32,
            address: wire,
            sub_address,
        })
    }

    fn area_byte_width(&self, area: &str) -> FieldbusResult<f64> {
        Ok(self.area(area)?.0.byte_width)
    }
}

/// Highest S7 byte offset whose bit address still fits the 24-bit item field
pub const S7_MAX_BYTE_OFFSET: u32 = 0x00FF_FFFF / 8;

/// S7 area codes
pub mod s7_area {
    pub const INPUTS: u8 = 0x81;
    pub const OUTPUTS: u8 = 0x82;
    pub const FLAGS: u8 = 0x83;
    pub const DATA_BLOCK: u8 = 0x84;
    pub const COUNTERS: u8 = 0x1C;
    pub const TIMERS: u8 = 0x1D;
}

/// Siemens S7 areas, 0-based byte offsets
#[derive(Debug, Clone, Copy, Default)]
pub struct SiemensTranslator;

impl SiemensTranslator {
    /// Resolve an area name to `(s7 area code, db number, byte width)`
    pub fn resolve(&self, area: &str) -> FieldbusResult<(u8, u16, f64)> {
        let upper = area.to_ascii_uppercase();
        match upper.as_str() {
            "I" | "E" => Ok((s7_area::INPUTS, 0, 1.0)),
            "Q" | "A" => Ok((s7_area::OUTPUTS, 0, 1.0)),
            "M" => Ok((s7_area::FLAGS, 0, 1.0)),
            "V" => Ok((s7_area::DATA_BLOCK, 1, 1.0)),
            "T" => Ok((s7_area::TIMERS, 0, 2.0)),
            "C" | "Z" => Ok((s7_area::COUNTERS, 0, 2.0)),
            db if db.starts_with("DB") => {
                let number = db[2..]
                    .parse::<u16>()
                    .map_err(|_| FieldbusError::format(area, "data block needs a number, e.g. DB1"))?;
                Ok((s7_area::DATA_BLOCK, number, 1.0))
            }
            _ => Err(FieldbusError::unknown_area(area)),
        }
    }
}

impl AddressTranslator for SiemensTranslator {
    fn translate(&self, address: &str, _is_read: bool, _is_single: bool) -> FieldbusResult<AddressDef> {
        let (area_string, offset, sub_address) = parse_address(address)?;
        let (code, db, _) = self.resolve(&area_string)?;
        if offset > S7_MAX_BYTE_OFFSET {
            return Err(FieldbusError::format(address, "offset exceeds the S7 address range"));
        }

        Ok(AddressDef {
            area_string,
            area: ((db as u32) << 8) | code as u32,
            address: offset,
            sub_address,
        })
    }

    fn area_byte_width(&self, area: &str) -> FieldbusResult<f64> {
        Ok(self.resolve(area)?.2)
    }
}

/// Table-driven translator for families without fixed area vocabulary
///
/// Areas get sequential codes in registration order. A permissive
/// translator accepts any area with the default width, which suits
/// record-oriented protocols where the area is a point code.
#[derive(Debug, Clone)]
pub struct GenericTranslator {
    areas: HashMap<String, (u32, f64)>,
    default_width: Option<f64>,
}

impl GenericTranslator {
    pub fn new<I, S>(areas: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let areas = areas
            .into_iter()
            .enumerate()
            .map(|(index, (name, width))| (name.into(), (index as u32, width)))
            .collect();
        Self {
            areas,
            default_width: None,
        }
    }

    pub fn permissive(default_width: f64) -> Self {
        Self {
            areas: HashMap::new(),
            default_width: Some(default_width),
        }
    }

    fn lookup(&self, area: &str) -> FieldbusResult<(u32, f64)> {
        match (self.areas.get(area), self.default_width) {
            (Some(entry), _) => Ok(*entry),
            (None, Some(width)) => Ok((u32::MAX, width)),
            (None, None) => Err(FieldbusError::unknown_area(area)),
        }
    }
}

impl AddressTranslator for GenericTranslator {
    fn translate(&self, address: &str, _is_read: bool, _is_single: bool) -> FieldbusResult<AddressDef> {
        let (area_string, offset, sub_address) = parse_address(address)?;
        let (code, _) = self.lookup(&area_string)?;

        Ok(AddressDef {
            area_string,
            area: code,
            address: offset,
            sub_address,
        })
    }

    fn area_byte_width(&self, area: &str) -> FieldbusResult<f64> {
        Ok(self.lookup(area)?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("4X 17.3").unwrap(), ("4X".to_string(), 17, 3));
        assert_eq!(parse_address("V 1").unwrap(), ("V".to_string(), 1, 0));
        assert_eq!(parse_address(" DB1 0 ").unwrap(), ("DB1".to_string(), 0, 0));

        for bad in ["4X", "4X abc", "4X 1.x", "", " 12"] {
            let err = parse_address(bad).unwrap_err();
            assert!(matches!(err, FieldbusError::Format { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_modbus_function_codes() {
        let translator = ModbusTranslator::new();

        let def = translator.translate("4X 1", true, false).unwrap();
        assert_eq!(def.area, 0x03);
        assert_eq!(def.address, 0);

        assert_eq!(translator.translate("4X 10", false, true).unwrap().area, 0x06);
        assert_eq!(translator.translate("4X 10", false, false).unwrap().area, 0x10);
        assert_eq!(translator.translate("0X 5", true, false).unwrap().area, 0x01);
        assert_eq!(translator.translate("0X 5", false, true).unwrap().area, 0x05);
        assert_eq!(translator.translate("0X 5", false, false).unwrap().area, 0x0F);
        assert_eq!(translator.translate("1X 5", true, false).unwrap().area, 0x02);
        assert_eq!(translator.translate("3X 5", true, false).unwrap().area, 0x04);

        assert!(matches!(
            translator.translate("3X 5", false, true),
            Err(FieldbusError::Format { .. })
        ));
        assert!(matches!(
            translator.translate("4X 0", true, false),
            Err(FieldbusError::Format { .. })
        ));
        assert!(matches!(
            translator.translate("5X 1", true, false),
            Err(FieldbusError::UnknownArea { .. })
        ));
    }

    #[test]
    fn test_translation_is_pure() {
        let translator = ModbusTranslator::new();
        let first = translator.translate("4X 17.3", true, false).unwrap();
        let second = translator.translate("4X 17.3", true, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.sub_address, 3);
    }

    #[test]
    fn test_modbus_offset_range() {
        let translator = ModbusTranslator::new();
        assert_eq!(translator.translate("4X 65536", true, false).unwrap().address, 0xFFFF);

        for bad in ["4X 65537", "4X 4294967295", "0X 70000"] {
            assert!(
                matches!(translator.translate(bad, true, false), Err(FieldbusError::Format { .. })),
                "{}",
                bad
            );
        }

        let unit = AddressUnit::new("far", "4X", 65537, DataType::UInt16);
        assert!(translator.validate_unit(&unit).is_err());
    }

    #[test]
    fn test_area_widths() {
        let translator = ModbusTranslator::new();
        assert_eq!(translator.area_byte_width("0X").unwrap(), 0.125);
        assert_eq!(translator.area_byte_width("4x").unwrap(), 2.0);
        assert_eq!(translator.area_bit_width("4X").unwrap(), 16);
        assert_eq!(translator.area_bit_width("1X").unwrap(), 1);
    }

    #[test]
    fn test_validate_unit() {
        let translator = ModbusTranslator::new();
        let ok = AddressUnit::new("a", "4X", 2, DataType::Bool).with_sub_address(15);
        assert!(translator.validate_unit(&ok).is_ok());

        let too_far = AddressUnit::new("b", "4X", 2, DataType::Bool).with_sub_address(16);
        assert!(translator.validate_unit(&too_far).is_err());

        let unknown = AddressUnit::new("c", "9X", 2, DataType::UInt16);
        assert!(matches!(
            translator.validate_unit(&unknown),
            Err(FieldbusError::UnknownArea { .. })
        ));
    }

    #[test]
    fn test_na200h_base_offsets() {
        let translator = Na200hTranslator::new();

        let def = translator.translate("M 5", true, false).unwrap();
        assert_eq!(def.area, 0x01);
        assert_eq!(def.address, 10005);

        let def = translator.translate("NW 3", false, false).unwrap();
        assert_eq!(def.area, 0x10);
        assert_eq!(def.address, 21003);

        assert_eq!(translator.translate("SW 0", true, false).unwrap().address, 5000);
        assert_eq!(translator.area_byte_width("QW").unwrap(), 2.0);
        assert!(translator.translate("S 1", false, true).is_err());
    }

    #[test]
    fn test_siemens_areas() {
        let translator = SiemensTranslator;

        let def = translator.translate("DB10 4.2", true, false).unwrap();
        assert_eq!(def.area, (10 << 8) | 0x84);
        assert_eq!(def.address, 4);
        assert_eq!(def.sub_address, 2);

        assert_eq!(translator.translate("V 1", true, false).unwrap().area, (1 << 8) | 0x84);
        assert_eq!(translator.translate("I 0", true, false).unwrap().area, 0x81);
        assert_eq!(translator.translate("Q 0", true, false).unwrap().area, 0x82);
        assert_eq!(translator.translate("M 0", true, false).unwrap().area, 0x83);
        assert_eq!(translator.area_byte_width("T").unwrap(), 2.0);

        assert!(matches!(
            translator.translate("DBX 0", true, false),
            Err(FieldbusError::Format { .. })
        ));
        assert!(matches!(
            translator.translate("PI 0", true, false),
            Err(FieldbusError::UnknownArea { .. })
        ));

        assert_eq!(translator.translate("DB1 2097151", true, false).unwrap().address, 0x1F_FFFF);
        assert!(matches!(
            translator.translate("DB1 2097152", true, false),
            Err(FieldbusError::Format { .. })
        ));
        assert!(matches!(
            translator.translate("DB1 536870912", true, false),
            Err(FieldbusError::Format { .. })
        ));
    }

    #[test]
    fn test_generic_translator() {
        let translator = GenericTranslator::new([("AI", 4.0), ("DI", 0.125)]);
        assert_eq!(translator.translate("DI 3", true, true).unwrap().area, 1);
        assert!(translator.translate("AO 3", true, true).is_err());

        let permissive = GenericTranslator::permissive(8.0);
        assert_eq!(permissive.area_byte_width("a21026").unwrap(), 8.0);
    }

    #[test]
    fn test_formater_round_trip() {
        let formater = AddressFormaterBase;
        assert_eq!(formater.format("4X", 17, 3), "4X 17.3");
        assert_eq!(formater.format("DB1", 0, 0), "DB1 0");

        let unit = AddressUnit::new("p", "4X", 17, DataType::Bool).with_sub_address(3);
        assert_eq!(parse_address(&unit.address_text()).unwrap(), ("4X".to_string(), 17, 3));
    }
}
