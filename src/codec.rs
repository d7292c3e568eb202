//! Typed value conversion between device bytes and Rust values.
//!
//! Every multi-byte value is converted through its big-endian image
//! (most significant byte first) and then reordered according to the
//! [`Endian`] of the device:
//!
//! | Endian | `u32 0x11223344` on the wire |
//! |--------|------------------------------|
//! | `BigEndianMsbWordOrder` | `11 22 33 44` |
//! | `BigEndianLsbWordOrder` | `33 44 11 22` |
//! | `LittleEndian` | `44 33 22 11` |
//! | `BigEndian3412WordSwap` | `33 44 11 22` (per 4-byte group) |

use std::fmt;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{FieldbusError, FieldbusResult};

/// Primitive data types addressable on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Width in bytes when the value is stored as a whole scalar
    pub fn byte_width(&self) -> usize {
        match self {
            DataType::Bool | DataType::Byte => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    /// Width in bits, a bool occupies a single bit
    pub fn bit_width(&self) -> usize {
        match self {
            DataType::Bool => 1,
            other => other.byte_width() * 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Byte => "byte",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }
}

impl FromStr for DataType {
    type Err = FieldbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" | "bit" => Ok(DataType::Bool),
            "byte" | "u8" | "uint8" => Ok(DataType::Byte),
            "int16" | "i16" | "short" => Ok(DataType::Int16),
            "uint16" | "u16" | "ushort" | "word" => Ok(DataType::UInt16),
            "int32" | "i32" | "int" => Ok(DataType::Int32),
            "uint32" | "u32" | "uint" | "dword" => Ok(DataType::UInt32),
            "int64" | "i64" | "long" => Ok(DataType::Int64),
            "uint64" | "u64" | "ulong" => Ok(DataType::UInt64),
            "float32" | "f32" | "float" | "real" => Ok(DataType::Float32),
            "float64" | "f64" | "double" | "lreal" => Ok(DataType::Float64),
            other => Err(FieldbusError::unsupported_type(other)),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte order policy of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endian {
    /// Least significant byte first
    LittleEndian,
    /// Big-endian words, least significant word first
    BigEndianLsbWordOrder,
    /// Plain big-endian, most significant word first
    #[default]
    BigEndianMsbWordOrder,
    /// PLC float layout: reverse, pairwise swap, read as little-endian
    BigEndian3412WordSwap,
}

impl Endian {
    /// Reorder a big-endian image into wire order
    fn to_wire(&self, image: &mut [u8]) {
        match self {
            Endian::BigEndianMsbWordOrder => {}
            Endian::LittleEndian => image.reverse(),
            Endian::BigEndianLsbWordOrder => reverse_words(image),
            Endian::BigEndian3412WordSwap => {
                for group in image.chunks_exact_mut(4) {
                    swap_3412(group);
                }
            }
        }
    }

    /// Reorder wire bytes into the big-endian image
    fn from_wire(&self, wire: &mut [u8]) {
        // every reordering is its own inverse
        self.to_wire(wire)
    }
}

fn reverse_words(image: &mut [u8]) {
    if image.len() < 4 || image.len() % 2 != 0 {
        return;
    }
    let words: Vec<[u8; 2]> = image.chunks_exact(2).rev().map(|w| [w[0], w[1]]).collect();
    for (slot, word) in image.chunks_exact_mut(2).zip(words) {
        slot.copy_from_slice(&word);
    }
}

fn swap_3412(group: &mut [u8]) {
    let mut swapped = [group[3], group[2], group[1], group[0]];
    swapped.swap(0, 2);
    swapped.swap(1, 3);
    // `swapped` now holds the little-endian image of the value
    group.copy_from_slice(&[swapped[3], swapped[2], swapped[1], swapped[0]]);
}

/// Bit numbering inside a byte or element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BitOrder {
    /// Bit 0 is the least significant bit
    #[default]
    LsbFirst,
    /// Bit 0 is the most significant bit
    MsbFirst,
}

/// A typed device value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Byte(_) => DataType::Byte,
            Value::Int16(_) => DataType::Int16,
            Value::UInt16(_) => DataType::UInt16,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
        }
    }

    /// Numeric view used for scaling and for the machine result map
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Byte(v) => v as f64,
            Value::Int16(v) => v as f64,
            Value::UInt16(v) => v as f64,
            Value::Int32(v) => v as f64,
            Value::UInt32(v) => v as f64,
            Value::Int64(v) => v as f64,
            Value::UInt64(v) => v as f64,
            Value::Float32(v) => v as f64,
            Value::Float64(v) => v,
        }
    }

    /// Convert a numeric value to the given type, rounding and saturating integers
    pub fn from_f64(value: f64, data_type: DataType) -> Value {
        let rounded = value.round();
        match data_type {
            DataType::Bool => Value::Bool(value != 0.0),
            DataType::Byte => Value::Byte(rounded as u8),
            DataType::Int16 => Value::Int16(rounded as i16),
            DataType::UInt16 => Value::UInt16(rounded as u16),
            DataType::Int32 => Value::Int32(rounded as i32),
            DataType::UInt32 => Value::UInt32(rounded as u32),
            DataType::Int64 => Value::Int64(rounded as i64),
            DataType::UInt64 => Value::UInt64(rounded as u64),
            DataType::Float32 => Value::Float32(value as f32),
            DataType::Float64 => Value::Float64(value),
        }
    }

    /// Equality that compares floats by bit pattern, so NaN equals itself
    pub fn bit_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    fn to_be_image(self) -> Vec<u8> {
        let mut buf = vec![0u8; self.data_type().byte_width()];
        match self {
            Value::Bool(b) => buf[0] = b as u8,
            Value::Byte(v) => buf[0] = v,
            Value::Int16(v) => BigEndian::write_i16(&mut buf, v),
            Value::UInt16(v) => BigEndian::write_u16(&mut buf, v),
            Value::Int32(v) => BigEndian::write_i32(&mut buf, v),
            Value::UInt32(v) => BigEndian::write_u32(&mut buf, v),
            Value::Int64(v) => BigEndian::write_i64(&mut buf, v),
            Value::UInt64(v) => BigEndian::write_u64(&mut buf, v),
            Value::Float32(v) => BigEndian::write_f32(&mut buf, v),
            Value::Float64(v) => BigEndian::write_f64(&mut buf, v),
        }
        buf
    }

    fn from_be_image(image: &[u8], data_type: DataType) -> Value {
        match data_type {
            DataType::Bool => Value::Bool(image[0] != 0),
            DataType::Byte => Value::Byte(image[0]),
            DataType::Int16 => Value::Int16(BigEndian::read_i16(image)),
            DataType::UInt16 => Value::UInt16(BigEndian::read_u16(image)),
            DataType::Int32 => Value::Int32(BigEndian::read_i32(image)),
            DataType::UInt32 => Value::UInt32(BigEndian::read_u32(image)),
            DataType::Int64 => Value::Int64(BigEndian::read_i64(image)),
            DataType::UInt64 => Value::UInt64(BigEndian::read_u64(image)),
            DataType::Float32 => Value::Float32(BigEndian::read_f32(image)),
            DataType::Float64 => Value::Float64(BigEndian::read_f64(image)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            other => write!(f, "{}", other.as_f64()),
        }
    }
}

/// Endian-aware converter between bytes and [`Value`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueCodec {
    endian: Endian,
    bit_order: BitOrder,
}

impl ValueCodec {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            bit_order: BitOrder::LsbFirst,
        }
    }

    pub fn with_bit_order(mut self, bit_order: BitOrder) -> Self {
        self.bit_order = bit_order;
        self
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    /// Encode a value into exactly `byte_width` wire bytes
    pub fn encode(&self, value: &Value) -> Vec<u8> {
        let mut image = value.to_be_image();
        self.endian.to_wire(&mut image);
        image
    }

    /// Encode a numeric value after converting it to `data_type`
    pub fn encode_f64(&self, value: f64, data_type: DataType) -> Vec<u8> {
        self.encode(&Value::from_f64(value, data_type))
    }

    /// Decode one value at `offset`, returning it with the offset past it
    pub fn decode(
        &self,
        bytes: &[u8],
        offset: usize,
        data_type: DataType,
    ) -> FieldbusResult<(Value, usize)> {
        let width = data_type.byte_width();
        let end = offset + width;
        if bytes.len() < end {
            return Err(FieldbusError::codec(format!(
                "{} needs {} bytes at offset {}, buffer has {}",
                data_type,
                width,
                offset,
                bytes.len()
            )));
        }

        let mut image = bytes[offset..end].to_vec();
        self.endian.from_wire(&mut image);
        Ok((Value::from_be_image(&image, data_type), end))
    }

    /// Read bit `bit_pos` of a packed bit array
    pub fn get_bit(&self, bytes: &[u8], bit_pos: usize) -> FieldbusResult<bool> {
        let byte = bytes.get(bit_pos / 8).ok_or_else(|| {
            FieldbusError::codec(format!(
                "bit {} outside {}-byte buffer",
                bit_pos,
                bytes.len()
            ))
        })?;
        Ok(byte & self.bit_mask(bit_pos) != 0)
    }

    /// Write bit `bit_pos` of a packed bit array
    pub fn set_bit(&self, bytes: &mut [u8], bit_pos: usize, value: bool) -> FieldbusResult<()> {
        let len = bytes.len();
        let mask = self.bit_mask(bit_pos);
        let byte = bytes.get_mut(bit_pos / 8).ok_or_else(|| {
            FieldbusError::codec(format!("bit {} outside {}-byte buffer", bit_pos, len))
        })?;
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        Ok(())
    }

    fn bit_mask(&self, bit_pos: usize) -> u8 {
        match self.bit_order {
            BitOrder::LsbFirst => 1 << (bit_pos % 8),
            BitOrder::MsbFirst => 0x80 >> (bit_pos % 8),
        }
    }

    /// Read bit `sub` of a whole element (a register or a byte)
    ///
    /// The element is first decoded as an unsigned integer with the codec's
    /// endian, so bit 0 of a big-endian register lives in its second byte.
    pub fn get_element_bit(&self, element: &[u8], sub: u8) -> FieldbusResult<bool> {
        let (value, bits) = self.element_as_u64(element)?;
        let shift = self.element_shift(sub, bits)?;
        Ok((value >> shift) & 1 == 1)
    }

    /// Write bit `sub` of a whole element in place
    pub fn set_element_bit(&self, element: &mut [u8], sub: u8, on: bool) -> FieldbusResult<()> {
        let (value, bits) = self.element_as_u64(element)?;
        let shift = self.element_shift(sub, bits)?;
        let value = if on {
            value | (1u64 << shift)
        } else {
            value & !(1u64 << shift)
        };

        let mut image = value.to_be_bytes()[8 - element.len()..].to_vec();
        self.endian.to_wire(&mut image);
        element.copy_from_slice(&image);
        Ok(())
    }

    fn element_as_u64(&self, element: &[u8]) -> FieldbusResult<(u64, usize)> {
        if element.is_empty() || element.len() > 8 {
            return Err(FieldbusError::codec(format!(
                "cannot address bits of a {}-byte element",
                element.len()
            )));
        }
        let mut image = element.to_vec();
        self.endian.from_wire(&mut image);
        let value = image.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Ok((value, element.len() * 8))
    }

    fn element_shift(&self, sub: u8, bits: usize) -> FieldbusResult<usize> {
        let sub = sub as usize;
        if sub >= bits {
            return Err(FieldbusError::codec(format!(
                "bit {} outside {}-bit element",
                sub, bits
            )));
        }
        Ok(match self.bit_order {
            BitOrder::LsbFirst => sub,
            BitOrder::MsbFirst => bits - 1 - sub,
        })
    }
}
