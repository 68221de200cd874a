//! # Wire Values and Field Descriptors
//!
//! Typed values as they travel on the wire, plus the per-type field
//! descriptor table that replaces runtime reflection: every marshalled or
//! mirrored type declares an ordered, compile-time list of its fields with
//! typed getter/setter function pointers, so any field stays settable by
//! name without dynamic dispatch over the object's layout.

use crate::error::{CommError, Result};

/// Wire-level type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Fixed-point decimal: scaled integer plus scale byte
    Decimal,
    Str,
    Bytes,
    /// Homogeneous list; elements may be individually absent (sparse nulls)
    List(&'static WireType),
}

impl WireType {
    /// Scalar types are the only ones admitted in small-object mode
    /// (strings, byte arrays and lists are containers).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, WireType::Str | WireType::Bytes | WireType::List(_))
    }
}

/// A single typed value on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// `unscaled * 10^-scale`; carried as integers so peers with different
    /// locales never see rounding drift
    Decimal { unscaled: i128, scale: u8 },
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Option<WireValue>>),
}

impl WireValue {
    /// Whether this value matches the declared wire type
    pub fn matches(&self, ty: &WireType) -> bool {
        matches!(
            (self, ty),
            (WireValue::Bool(_), WireType::Bool)
                | (WireValue::U8(_), WireType::U8)
                | (WireValue::I16(_), WireType::I16)
                | (WireValue::I32(_), WireType::I32)
                | (WireValue::I64(_), WireType::I64)
                | (WireValue::F32(_), WireType::F32)
                | (WireValue::F64(_), WireType::F64)
                | (WireValue::Decimal { .. }, WireType::Decimal)
                | (WireValue::Str(_), WireType::Str)
                | (WireValue::Bytes(_), WireType::Bytes)
                | (WireValue::List(_), WireType::List(_))
        )
    }

    /// Render for diagnostic dumps. Collections render as `[a, b]`, empty
    /// collections as `[]`; absent values are the caller's business.
    pub fn render(&self) -> String {
        match self {
            WireValue::Bool(v) => v.to_string(),
            WireValue::U8(v) => v.to_string(),
            WireValue::I16(v) => v.to_string(),
            WireValue::I32(v) => v.to_string(),
            WireValue::I64(v) => v.to_string(),
            WireValue::F32(v) => v.to_string(),
            WireValue::F64(v) => v.to_string(),
            WireValue::Decimal { unscaled, scale } => render_decimal(*unscaled, *scale),
            WireValue::Str(v) => v.clone(),
            WireValue::Bytes(v) => format!("0x{}", hex_string(v)),
            WireValue::List(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        Some(v) => v.render(),
                        None => "NULL".to_string(),
                    })
                    .collect();
                format!("[{}]", rendered.join(", "))
            }
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Render a scaled decimal without going through floating point
fn render_decimal(unscaled: i128, scale: u8) -> String {
    if scale == 0 {
        return unscaled.to_string();
    }
    let negative = unscaled < 0;
    let digits = unscaled.unsigned_abs().to_string();
    let scale = scale as usize;
    let (int_part, frac_part) = if digits.len() > scale {
        let split = digits.len() - scale;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{digits:0>scale$}"))
    };
    if negative {
        format!("-{int_part}.{frac_part}")
    } else {
        format!("{int_part}.{frac_part}")
    }
}

/// One entry of a type's compile-time field schema.
///
/// The getter returns `None` for an absent value (wire presence flag 0);
/// the setter accepts `None` to clear the field.
pub struct FieldDescriptor<T> {
    pub name: &'static str,
    pub wire_type: WireType,
    pub get: fn(&T) -> Option<WireValue>,
    pub set: fn(&mut T, Option<WireValue>) -> Result<()>,
}

/// A type that can travel through the marshalling engine or be mirrored.
///
/// Implementations declare their fields in wire order; that order is the
/// frame layout and the order `fields_string()` dumps use.
pub trait Wire: Default + Send + 'static {
    /// Distinguishes frame types on the wire; overridable per `MarshalSpec`
    const TYPE_TAG: u8;

    fn fields() -> &'static [FieldDescriptor<Self>]
    where
        Self: Sized;

    /// Look up a descriptor by field name
    fn field(name: &str) -> Option<&'static FieldDescriptor<Self>>
    where
        Self: Sized,
    {
        Self::fields().iter().find(|d| d.name == name)
    }
}

/// Setter helper: reject a value of the wrong wire type.
///
/// Descriptor setters call this before storing so a corrupted or
/// mis-declared frame surfaces as a `Format` error instead of a panic.
pub fn expect_type(value: &WireValue, ty: &WireType, field: &str) -> Result<()> {
    if value.matches(ty) {
        Ok(())
    } else {
        Err(CommError::Format(format!(
            "Field '{field}' expected {ty:?}, got incompatible value"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_rendering_preserves_scale() {
        assert_eq!(render_decimal(546789546, 0), "546789546");
        assert_eq!(render_decimal(12345, 2), "123.45");
        assert_eq!(render_decimal(-12345, 2), "-123.45");
        assert_eq!(render_decimal(5, 3), "0.005");
    }

    #[test]
    fn list_rendering() {
        let list = WireValue::List(vec![Some(WireValue::I32(1)), None, Some(WireValue::I32(3))]);
        assert_eq!(list.render(), "[1, NULL, 3]");
        assert_eq!(WireValue::List(Vec::new()).render(), "[]");
    }

    #[test]
    fn type_matching() {
        assert!(WireValue::I32(5).matches(&WireType::I32));
        assert!(!WireValue::I32(5).matches(&WireType::I64));
        assert!(WireValue::List(Vec::new()).matches(&WireType::List(&WireType::I32)));
    }

    #[test]
    fn scalar_classification() {
        assert!(WireType::I64.is_scalar());
        assert!(WireType::Decimal.is_scalar());
        assert!(!WireType::Str.is_scalar());
        assert!(!WireType::List(&WireType::U8).is_scalar());
    }
}
