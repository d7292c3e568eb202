//! Batching of logical addresses into wire transactions.
//!
//! A [`CommunicationUnit`] is one contiguous span of elements in one area,
//! together with the position of every [`AddressUnit`] it carries. Replies
//! are demultiplexed per unit, so a failed span only fails its own units.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::address::{AddressTranslator, AddressUnit};
use crate::codec::{DataType, Value, ValueCodec};
use crate::error::{FieldbusError, FieldbusResult};

/// Position of one address unit inside a span
#[derive(Debug, Clone, PartialEq)]
pub struct SpanMapping {
    pub unit: AddressUnit,
    /// Element index relative to the span start
    pub element_offset: u32,
}

/// One contiguous wire transaction
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationUnit {
    pub area: String,
    /// First element, in the numbering of the textual address
    pub address: u32,
    /// Number of elements
    pub count: u32,
    /// Bytes per element (0.125 for bit areas)
    pub element_width: f64,
    pub mappings: Vec<SpanMapping>,
}

impl CommunicationUnit {
    fn new(unit: &AddressUnit, element_width: f64) -> Self {
        Self {
            area: unit.area.clone(),
            address: unit.address,
            count: unit_elements(unit, element_width),
            element_width,
            mappings: vec![SpanMapping {
                unit: unit.clone(),
                element_offset: 0,
            }],
        }
    }

    /// Payload length of the span in bytes
    pub fn byte_len(&self) -> usize {
        (self.count as f64 * self.element_width).ceil() as usize
    }

    pub fn is_bit_area(&self) -> bool {
        self.element_width < 1.0
    }

    fn element_bytes(&self) -> usize {
        self.element_width.max(1.0) as usize
    }

    /// Sub address of a single bool inside a word or byte element
    ///
    /// Such spans cannot be written as a whole element without first
    /// reading the element back from the device.
    pub fn bit_in_element(&self) -> Option<u8> {
        match self.mappings.as_slice() {
            [mapping] if !self.is_bit_area() && mapping.unit.data_type == DataType::Bool => {
                Some(mapping.unit.sub_address)
            }
            _ => None,
        }
    }

    /// Decode every mapped unit out of the span payload
    pub fn decode_units<'a>(
        &'a self,
        data: &[u8],
        codec: &ValueCodec,
    ) -> Vec<(&'a AddressUnit, FieldbusResult<Value>)> {
        self.mappings
            .iter()
            .map(|mapping| (&mapping.unit, self.decode_one(mapping, data, codec)))
            .collect()
    }

    fn decode_one(
        &self,
        mapping: &SpanMapping,
        data: &[u8],
        codec: &ValueCodec,
    ) -> FieldbusResult<Value> {
        let unit = &mapping.unit;
        if self.is_bit_area() {
            let packed = ValueCodec::default();
            let first = mapping.element_offset as usize;
            if unit.data_type == DataType::Bool {
                return Ok(Value::Bool(packed.get_bit(data, first)?));
            }
            // a scalar spread over consecutive bits, least significant bit first
            let mut image = vec![0u8; unit.data_type.byte_width()];
            for bit in 0..unit.data_type.bit_width() {
                let on = packed.get_bit(data, first + bit)?;
                packed.set_bit(&mut image, bit, on)?;
            }
            image.reverse();
            let (value, _) = ValueCodec::default().decode(&image, 0, unit.data_type)?;
            return Ok(value);
        }

        let offset = mapping.element_offset as usize * self.element_bytes();
        if unit.data_type == DataType::Bool {
            let element = data.get(offset..offset + self.element_bytes()).ok_or_else(|| {
                FieldbusError::codec(format!(
                    "reply of {} bytes does not cover {}",
                    data.len(),
                    unit.address_text()
                ))
            })?;
            return Ok(Value::Bool(codec.get_element_bit(element, unit.sub_address)?));
        }
        Ok(codec.decode(data, offset, unit.data_type)?.0)
    }

    /// Build the write payload from raw values keyed by unit id
    pub fn encode_units(
        &self,
        values: &HashMap<String, f64>,
        codec: &ValueCodec,
    ) -> FieldbusResult<Vec<u8>> {
        let mut data = vec![0u8; self.byte_len()];
        for mapping in &self.mappings {
            let unit = &mapping.unit;
            let value = *values
                .get(&unit.id)
                .ok_or_else(|| FieldbusError::unknown_tag(&unit.id))?;

            if self.is_bit_area() {
                let packed = ValueCodec::default();
                let first = mapping.element_offset as usize;
                if unit.data_type == DataType::Bool {
                    packed.set_bit(&mut data, first, value != 0.0)?;
                    continue;
                }
                let mut image = ValueCodec::default().encode_f64(value, unit.data_type);
                image.reverse();
                for bit in 0..unit.data_type.bit_width() {
                    let on = packed.get_bit(&image, bit)?;
                    packed.set_bit(&mut data, first + bit, on)?;
                }
                continue;
            }

            let offset = mapping.element_offset as usize * self.element_bytes();
            let bytes = if unit.data_type == DataType::Bool {
                let mut element = vec![0u8; self.element_bytes()];
                codec.set_element_bit(&mut element, unit.sub_address, value != 0.0)?;
                element
            } else {
                codec.encode_f64(value, unit.data_type)
            };
            let slot = data.get_mut(offset..offset + bytes.len()).ok_or_else(|| {
                FieldbusError::internal(format!("{} outside its span", unit.address_text()))
            })?;
            slot.copy_from_slice(&bytes);
        }
        Ok(data)
    }
}

/// Number of area elements occupied by a unit
pub fn unit_elements(unit: &AddressUnit, element_width: f64) -> u32 {
    if unit.data_type == DataType::Bool {
        return 1;
    }
    ((unit.data_type.byte_width() as f64 / element_width).ceil() as u32).max(1)
}

/// Batches address units into wire spans
pub trait AddressCombiner: Send + Sync {
    /// Combine units into spans of at most `max_bytes` payload bytes each
    fn combine(&self, units: &[AddressUnit], max_bytes: usize) -> FieldbusResult<Vec<CommunicationUnit>>;
}

/// Merges adjacent units of one area into maximal spans
pub struct ContinuousCombiner {
    translator: Arc<dyn AddressTranslator>,
    for_write: bool,
}

impl ContinuousCombiner {
    /// Combiner for reads: overlapping and adjacent units share a span
    pub fn read(translator: Arc<dyn AddressTranslator>) -> Self {
        Self {
            translator,
            for_write: false,
        }
    }

    /// Combiner for writes: only exactly adjacent units share a span, and
    /// bools inside words stay alone
    pub fn write(translator: Arc<dyn AddressTranslator>) -> Self {
        Self {
            translator,
            for_write: true,
        }
    }

    fn isolated(&self, unit: &AddressUnit, element_width: f64) -> bool {
        self.for_write && unit.data_type == DataType::Bool && element_width >= 1.0
    }
}

impl AddressCombiner for ContinuousCombiner {
    fn combine(&self, units: &[AddressUnit], max_bytes: usize) -> FieldbusResult<Vec<CommunicationUnit>> {
        let mut groups: BTreeMap<String, Vec<&AddressUnit>> = BTreeMap::new();
        for unit in units {
            groups
                .entry(unit.area.to_ascii_uppercase())
                .or_default()
                .push(unit);
        }

        let mut spans = Vec::new();
        for (_, mut group) in groups {
            let width = self.translator.area_byte_width(&group[0].area)?;
            let max_elements = ((max_bytes as f64 / width).floor() as u32).max(1);
            group.sort_by_key(|unit| (unit.address, unit.sub_address));

            let mut current: Option<CommunicationUnit> = None;
            for unit in group {
                let extent = unit_elements(unit, width);
                if let Some((span, unit_end)) = current.as_mut().zip(unit.address.checked_add(extent)) {
                    let span_end = span.address.saturating_add(span.count);
                    let new_end = span_end.max(unit_end);
                    let adjacent = if self.for_write {
                        unit.address == span_end
                    } else {
                        unit.address <= span_end
                    };
                    let span_isolated = span.mappings.len() == 1
                        && self.isolated(&span.mappings[0].unit, width);

                    if adjacent
                        && !span_isolated
                        && !self.isolated(unit, width)
                        && new_end - span.address <= max_elements
                    {
                        span.mappings.push(SpanMapping {
                            unit: unit.clone(),
                            element_offset: unit.address - span.address,
                        });
                        span.count = new_end - span.address;
                        continue;
                    }
                }
                if let Some(done) = current.take() {
                    spans.push(done);
                }
                current = Some(CommunicationUnit::new(unit, width));
            }
            spans.extend(current);
        }
        Ok(spans)
    }
}

/// One span per unit, for backends without batching
pub struct SingleCombiner {
    translator: Arc<dyn AddressTranslator>,
}

impl SingleCombiner {
    pub fn new(translator: Arc<dyn AddressTranslator>) -> Self {
        Self { translator }
    }
}

impl AddressCombiner for SingleCombiner {
    fn combine(&self, units: &[AddressUnit], _max_bytes: usize) -> FieldbusResult<Vec<CommunicationUnit>> {
        units
            .iter()
            .map(|unit| {
                let width = self.translator.area_byte_width(&unit.area)?;
                Ok(CommunicationUnit::new(unit, width))
            })
            .collect()
    }
}
