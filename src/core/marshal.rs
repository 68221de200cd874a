//! # Marshalling Engine
//!
//! Converts typed field sets to and from the length-prefixed binary layout.
//!
//! Frame layout: `[declared body length][type tag: 1 byte]` followed by each
//! declared field in order as `[presence: 1 byte]` plus, when present, the
//! value. Every length and count field is `length_prefix_bytes` wide and
//! honours the configured endianness, as do all multi-byte scalars.
//!
//! A frame whose declared body length disagrees with the bytes actually
//! consumed is rejected with a `Format` error — short frames, padded frames
//! and truncated containers all fail the same check.
//!
//! Small-object mode (`whole_object = false`) restricts the schema to
//! scalar, non-container fields so datagrams stay under MTU.

use crate::error::{CommError, Result};
use crate::core::wire::{FieldDescriptor, Wire, WireType, WireValue};
use serde::{Deserialize, Serialize};

/// Marshalling configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MarshalSpec {
    /// When false the session carries caller-provided raw bytes untouched
    pub enabled: bool,

    /// Serialize the whole declared schema vs. scalar fields only
    pub whole_object: bool,

    /// Width in bytes (1-8) of every length/count field in the frame
    pub length_prefix_bytes: u8,

    /// Replaces the type's own tag on the wire when set
    #[serde(default)]
    pub type_tag_override: Option<u8>,

    /// Byte order for multi-byte scalars and counts
    pub little_endian: bool,
}

impl Default for MarshalSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            whole_object: true,
            length_prefix_bytes: 4,
            type_tag_override: None,
            little_endian: true,
        }
    }
}

impl MarshalSpec {
    /// Spec for sub-MTU datagrams: scalar fields, 2-byte counts
    pub fn small_object() -> Self {
        Self {
            whole_object: false,
            length_prefix_bytes: 2,
            ..Self::default()
        }
    }

    /// Validate marshalling configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.length_prefix_bytes == 0 || self.length_prefix_bytes > 8 {
            errors.push(format!(
                "Length prefix must be 1-8 bytes, got {}",
                self.length_prefix_bytes
            ));
        }

        errors
    }

    /// Largest value one count field can carry
    fn max_count(&self) -> u128 {
        if self.length_prefix_bytes >= 8 {
            u64::MAX as u128
        } else {
            (1u128 << (self.length_prefix_bytes as u32 * 8)) - 1
        }
    }

    fn type_tag_for<T: Wire>(&self) -> u8 {
        self.type_tag_override.unwrap_or(T::TYPE_TAG)
    }
}

/// Marshal a value's declared fields into one frame.
pub fn encode<T: Wire>(value: &T, spec: &MarshalSpec) -> Result<Vec<u8>> {
    if !spec.enabled {
        return Err(CommError::Config(
            "Marshalling is disabled for this session".to_string(),
        ));
    }

    let mut body = Writer::new(spec);
    body.write_u8(spec.type_tag_for::<T>());

    for descriptor in schema::<T>(spec) {
        match (descriptor.get)(value) {
            Some(ref field_value) => {
                if !field_value.matches(&descriptor.wire_type) {
                    return Err(CommError::Format(format!(
                        "Field '{}' value does not match declared type {:?}",
                        descriptor.name, descriptor.wire_type
                    )));
                }
                body.write_u8(1);
                body.write_value(field_value)?;
            }
            None => body.write_u8(0),
        }
    }

    let body = body.finish();
    let mut out = Writer::new(spec);
    out.write_count(body.len())?;
    let mut framed = out.finish();
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Unmarshal one frame back into a value of the target type.
pub fn decode<T: Wire>(bytes: &[u8], spec: &MarshalSpec) -> Result<T> {
    if !spec.enabled {
        return Err(CommError::Config(
            "Marshalling is disabled for this session".to_string(),
        ));
    }

    let mut reader = Reader::new(bytes, spec);
    let declared = reader.read_count()?;
    if reader.remaining() != declared {
        return Err(CommError::Format(format!(
            "Declared frame length {} does not match {} bytes present",
            declared,
            reader.remaining()
        )));
    }

    let body_start = reader.pos;
    let tag = reader.read_u8()?;
    let expected_tag = spec.type_tag_for::<T>();
    if tag != expected_tag {
        return Err(CommError::Format(format!(
            "Unexpected type tag {tag} (expected {expected_tag})"
        )));
    }

    let mut out = T::default();
    for descriptor in schema::<T>(spec) {
        let present = reader.read_u8()?;
        match present {
            0 => (descriptor.set)(&mut out, None)?,
            1 => {
                let value = reader.read_value(&descriptor.wire_type)?;
                (descriptor.set)(&mut out, Some(value))?;
            }
            other => {
                return Err(CommError::Format(format!(
                    "Invalid presence flag {other} for field '{}'",
                    descriptor.name
                )))
            }
        }
    }

    let consumed = reader.pos - body_start;
    if consumed != declared {
        return Err(CommError::Format(format!(
            "Declared frame length {declared} does not match {consumed} bytes consumed"
        )));
    }

    Ok(out)
}

/// The active schema under the given spec: the full declared field list, or
/// scalars only in small-object mode.
fn schema<T: Wire>(spec: &MarshalSpec) -> impl Iterator<Item = &'static FieldDescriptor<T>> {
    let whole = spec.whole_object;
    T::fields()
        .iter()
        .filter(move |d| whole || d.wire_type.is_scalar())
}

/// Byte writer honouring the spec's endianness and count width
pub(crate) struct Writer<'a> {
    buf: Vec<u8>,
    spec: &'a MarshalSpec,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(spec: &'a MarshalSpec) -> Self {
        Self {
            buf: Vec::new(),
            spec,
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_fixed(&mut self, bytes: &[u8]) {
        // Caller passes big-endian; flip once here for little-endian specs
        if self.spec.little_endian {
            self.buf.extend(bytes.iter().rev());
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    pub(crate) fn write_count(&mut self, n: usize) -> Result<()> {
        if (n as u128) > self.spec.max_count() {
            return Err(CommError::Format(format!(
                "Count {} exceeds {}-byte length prefix capacity",
                n, self.spec.length_prefix_bytes
            )));
        }
        let width = self.spec.length_prefix_bytes as usize;
        let be = (n as u64).to_be_bytes();
        self.write_fixed(&be[8 - width..]);
        Ok(())
    }

    pub(crate) fn write_value(&mut self, value: &WireValue) -> Result<()> {
        match value {
            WireValue::Bool(v) => self.write_u8(u8::from(*v)),
            WireValue::U8(v) => self.write_u8(*v),
            WireValue::I16(v) => self.write_fixed(&v.to_be_bytes()),
            WireValue::I32(v) => self.write_fixed(&v.to_be_bytes()),
            WireValue::I64(v) => self.write_fixed(&v.to_be_bytes()),
            WireValue::F32(v) => self.write_fixed(&v.to_bits().to_be_bytes()),
            WireValue::F64(v) => self.write_fixed(&v.to_bits().to_be_bytes()),
            WireValue::Decimal { unscaled, scale } => {
                self.write_u8(*scale);
                self.write_fixed(&unscaled.to_be_bytes());
            }
            WireValue::Str(v) => {
                self.write_count(v.len())?;
                self.buf.extend_from_slice(v.as_bytes());
            }
            WireValue::Bytes(v) => {
                self.write_count(v.len())?;
                self.buf.extend_from_slice(v);
            }
            WireValue::List(items) => {
                self.write_count(items.len())?;
                for item in items {
                    match item {
                        Some(v) => {
                            self.write_u8(1);
                            self.write_value(v)?;
                        }
                        None => self.write_u8(0),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Byte reader honouring the spec's endianness and count width
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pub(crate) pos: usize,
    spec: &'a MarshalSpec,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], spec: &'a MarshalSpec) -> Self {
        Self { data, pos: 0, spec }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CommError::Format(format!(
                "Frame truncated: needed {n} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a fixed-width big-endian integer, un-flipping little-endian input
    fn read_fixed(&mut self, width: usize) -> Result<Vec<u8>> {
        let raw = self.take(width)?;
        if self.spec.little_endian {
            Ok(raw.iter().rev().copied().collect())
        } else {
            Ok(raw.to_vec())
        }
    }

    pub(crate) fn read_count(&mut self) -> Result<usize> {
        let width = self.spec.length_prefix_bytes as usize;
        let bytes = self.read_fixed(width)?;
        let mut padded = [0u8; 8];
        padded[8 - width..].copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(padded) as usize)
    }

    pub(crate) fn read_value(&mut self, ty: &WireType) -> Result<WireValue> {
        let value = match ty {
            WireType::Bool => match self.read_u8()? {
                0 => WireValue::Bool(false),
                1 => WireValue::Bool(true),
                other => {
                    return Err(CommError::Format(format!("Invalid boolean byte {other}")))
                }
            },
            WireType::U8 => WireValue::U8(self.read_u8()?),
            WireType::I16 => {
                let b = self.read_fixed(2)?;
                WireValue::I16(i16::from_be_bytes([b[0], b[1]]))
            }
            WireType::I32 => {
                let b = self.read_fixed(4)?;
                WireValue::I32(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            WireType::I64 => {
                let b = self.read_fixed(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b);
                WireValue::I64(i64::from_be_bytes(arr))
            }
            WireType::F32 => {
                let b = self.read_fixed(4)?;
                WireValue::F32(f32::from_bits(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            WireType::F64 => {
                let b = self.read_fixed(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b);
                WireValue::F64(f64::from_bits(u64::from_be_bytes(arr)))
            }
            WireType::Decimal => {
                let scale = self.read_u8()?;
                let b = self.read_fixed(16)?;
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&b);
                WireValue::Decimal {
                    unscaled: i128::from_be_bytes(arr),
                    scale,
                }
            }
            WireType::Str => {
                let len = self.read_count()?;
                let raw = self.take(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| CommError::Format("String field is not valid UTF-8".into()))?;
                WireValue::Str(s.to_string())
            }
            WireType::Bytes => {
                let len = self.read_count()?;
                WireValue::Bytes(self.take(len)?.to_vec())
            }
            WireType::List(elem) => {
                let len = self.read_count()?;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    match self.read_u8()? {
                        0 => items.push(None),
                        1 => items.push(Some(self.read_value(elem)?)),
                        other => {
                            return Err(CommError::Format(format!(
                                "Invalid element presence flag {other}"
                            )))
                        }
                    }
                }
                WireValue::List(items)
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::wire::expect_type;

    #[derive(Debug, Default, PartialEq, Clone)]
    struct Sample {
        flag: bool,
        count: i32,
        big: i64,
        label: Option<String>,
        price: Option<(i128, u8)>,
        readings: Vec<Option<i32>>,
    }

    impl Wire for Sample {
        const TYPE_TAG: u8 = 0x21;

        fn fields() -> &'static [FieldDescriptor<Self>] {
            static FIELDS: [FieldDescriptor<Sample>; 6] = [
                FieldDescriptor {
                    name: "Flag",
                    wire_type: WireType::Bool,
                    get: |s| Some(WireValue::Bool(s.flag)),
                    set: |s, v| match v {
                        Some(v) => {
                            expect_type(&v, &WireType::Bool, "Flag")?;
                            if let WireValue::Bool(b) = v {
                                s.flag = b;
                            }
                            Ok(())
                        }
                        None => Ok(()),
                    },
                },
                FieldDescriptor {
                    name: "Count",
                    wire_type: WireType::I32,
                    get: |s| Some(WireValue::I32(s.count)),
                    set: |s, v| {
                        if let Some(WireValue::I32(n)) = v {
                            s.count = n;
                        }
                        Ok(())
                    },
                },
                FieldDescriptor {
                    name: "Big",
                    wire_type: WireType::I64,
                    get: |s| Some(WireValue::I64(s.big)),
                    set: |s, v| {
                        if let Some(WireValue::I64(n)) = v {
                            s.big = n;
                        }
                        Ok(())
                    },
                },
                FieldDescriptor {
                    name: "Label",
                    wire_type: WireType::Str,
                    get: |s| s.label.clone().map(WireValue::Str),
                    set: |s, v| {
                        s.label = match v {
                            Some(WireValue::Str(text)) => Some(text),
                            _ => None,
                        };
                        Ok(())
                    },
                },
                FieldDescriptor {
                    name: "Price",
                    wire_type: WireType::Decimal,
                    get: |s| {
                        s.price
                            .map(|(unscaled, scale)| WireValue::Decimal { unscaled, scale })
                    },
                    set: |s, v| {
                        s.price = match v {
                            Some(WireValue::Decimal { unscaled, scale }) => {
                                Some((unscaled, scale))
                            }
                            _ => None,
                        };
                        Ok(())
                    },
                },
                FieldDescriptor {
                    name: "Readings",
                    wire_type: WireType::List(&WireType::I32),
                    get: |s| {
                        Some(WireValue::List(
                            s.readings
                                .iter()
                                .map(|r| r.map(WireValue::I32))
                                .collect(),
                        ))
                    },
                    set: |s, v| {
                        s.readings = match v {
                            Some(WireValue::List(items)) => items
                                .into_iter()
                                .map(|item| match item {
                                    Some(WireValue::I32(n)) => Some(n),
                                    _ => None,
                                })
                                .collect(),
                            _ => Vec::new(),
                        };
                        Ok(())
                    },
                },
            ];
            &FIELDS
        }
    }

    fn sample() -> Sample {
        Sample {
            flag: true,
            count: -42,
            big: 546_789_546,
            label: Some("lorem".to_string()),
            price: Some((12345, 2)),
            readings: vec![Some(1), None, Some(3)],
        }
    }

    #[test]
    fn roundtrip_whole_object() {
        let spec = MarshalSpec::default();
        let bytes = encode(&sample(), &spec).unwrap();
        let back: Sample = decode(&bytes, &spec).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn roundtrip_big_endian_wide_prefix() {
        let spec = MarshalSpec {
            little_endian: false,
            length_prefix_bytes: 8,
            ..MarshalSpec::default()
        };
        let bytes = encode(&sample(), &spec).unwrap();
        let back: Sample = decode(&bytes, &spec).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn roundtrip_absent_fields() {
        let spec = MarshalSpec::default();
        let value = Sample {
            label: None,
            price: None,
            ..sample()
        };
        let bytes = encode(&value, &spec).unwrap();
        let back: Sample = decode(&bytes, &spec).unwrap();
        assert_eq!(back.label, None);
        assert_eq!(back.price, None);
    }

    #[test]
    fn small_object_mode_drops_containers() {
        let whole = MarshalSpec::default();
        let small = MarshalSpec {
            whole_object: false,
            ..MarshalSpec::default()
        };

        let small_bytes = encode(&sample(), &small).unwrap();
        assert!(small_bytes.len() < encode(&sample(), &whole).unwrap().len());

        let back: Sample = decode(&small_bytes, &small).unwrap();
        assert_eq!(back.count, -42);
        assert_eq!(back.big, 546_789_546);
        // Container fields never travelled
        assert_eq!(back.label, None);
        assert!(back.readings.is_empty());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let spec = MarshalSpec::default();
        let mut bytes = encode(&sample(), &spec).unwrap();

        // Truncation
        bytes.pop();
        assert!(matches!(
            decode::<Sample>(&bytes, &spec),
            Err(CommError::Format(_))
        ));

        // Padding
        let mut padded = encode(&sample(), &spec).unwrap();
        padded.push(0);
        assert!(matches!(
            decode::<Sample>(&padded, &spec),
            Err(CommError::Format(_))
        ));
    }

    #[test]
    fn wrong_type_tag_is_rejected() {
        let spec = MarshalSpec::default();
        let bytes = encode(&sample(), &spec).unwrap();

        let strict = MarshalSpec {
            type_tag_override: Some(0x7F),
            ..MarshalSpec::default()
        };
        assert!(matches!(
            decode::<Sample>(&bytes, &strict),
            Err(CommError::Format(_))
        ));
    }

    #[test]
    fn tag_override_applies_on_both_sides() {
        let spec = MarshalSpec {
            type_tag_override: Some(0x7F),
            ..MarshalSpec::default()
        };
        let bytes = encode(&sample(), &spec).unwrap();
        let back: Sample = decode(&bytes, &spec).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn disabled_marshalling_is_a_config_error() {
        let spec = MarshalSpec {
            enabled: false,
            ..MarshalSpec::default()
        };
        assert!(matches!(
            encode(&sample(), &spec),
            Err(CommError::Config(_))
        ));
    }

    #[test]
    fn narrow_prefix_rejects_long_strings() {
        let spec = MarshalSpec {
            length_prefix_bytes: 1,
            ..MarshalSpec::default()
        };
        let value = Sample {
            label: Some("x".repeat(300)),
            ..sample()
        };
        assert!(matches!(encode(&value, &spec), Err(CommError::Format(_))));
    }
}
