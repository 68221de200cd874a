//! Integration tests for the marshalling engine's round-trip guarantees.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::Telemetry;
use peerlink::core::marshal::{decode, encode};
use peerlink::{CommError, MarshalSpec, WireValue};

fn sample() -> Telemetry {
    Telemetry {
        int: -7,
        big_int: 546_789_546,
        label: Some("Lorem ipsum dolor sit amet".to_string()),
        price: Some((1_999_95, 2)),
        samples: vec![Some(10), None, Some(-3), None],
    }
}

#[test]
fn roundtrip_preserves_every_field() {
    let spec = MarshalSpec::default();
    let bytes = encode(&sample(), &spec).unwrap();
    let back: Telemetry = decode(&bytes, &spec).unwrap();
    assert_eq!(back, sample());
}

#[test]
fn roundtrip_preserves_sparse_nulls() {
    let spec = MarshalSpec::default();
    let value = Telemetry {
        samples: vec![None, None, Some(1)],
        ..sample()
    };
    let back: Telemetry = decode(&encode(&value, &spec).unwrap(), &spec).unwrap();
    assert_eq!(back.samples, vec![None, None, Some(1)]);
}

#[test]
fn decimal_scale_survives_the_wire() {
    let spec = MarshalSpec::default();

    // 199995 * 10^-2 and 1999950 * 10^-3 are numerically equal but must not
    // collapse into one another
    let cents = Telemetry {
        price: Some((199_995, 2)),
        ..Telemetry::default()
    };
    let mills = Telemetry {
        price: Some((1_999_950, 3)),
        ..Telemetry::default()
    };

    let cents_back: Telemetry = decode(&encode(&cents, &spec).unwrap(), &spec).unwrap();
    let mills_back: Telemetry = decode(&encode(&mills, &spec).unwrap(), &spec).unwrap();

    assert_eq!(cents_back.price, Some((199_995, 2)));
    assert_eq!(mills_back.price, Some((1_999_950, 3)));
}

#[test]
fn both_byte_orders_roundtrip() {
    for little_endian in [true, false] {
        let spec = MarshalSpec {
            little_endian,
            ..MarshalSpec::default()
        };
        let back: Telemetry = decode(&encode(&sample(), &spec).unwrap(), &spec).unwrap();
        assert_eq!(back, sample(), "endianness {little_endian}");
    }
}

#[test]
fn prefix_widths_roundtrip() {
    for width in [1u8, 2, 4, 8] {
        let spec = MarshalSpec {
            length_prefix_bytes: width,
            ..MarshalSpec::default()
        };
        let value = Telemetry {
            label: Some("short".to_string()),
            ..Telemetry::default()
        };
        let back: Telemetry = decode(&encode(&value, &spec).unwrap(), &spec).unwrap();
        assert_eq!(back, value, "prefix width {width}");
    }
}

#[test]
fn small_object_mode_carries_scalars_only() {
    let spec = MarshalSpec::small_object();
    let bytes = encode(&sample(), &spec).unwrap();
    let back: Telemetry = decode(&bytes, &spec).unwrap();

    assert_eq!(back.int, sample().int);
    assert_eq!(back.big_int, sample().big_int);
    assert_eq!(back.price, sample().price);
    assert_eq!(back.label, None);
    assert!(back.samples.is_empty());
}

#[test]
fn corrupted_length_is_rejected() {
    let spec = MarshalSpec::default();
    let mut bytes = encode(&sample(), &spec).unwrap();

    // Shrink the declared length without shrinking the body
    bytes[0] = bytes[0].wrapping_sub(1);
    assert!(matches!(
        decode::<Telemetry>(&bytes, &spec),
        Err(CommError::Format(_))
    ));
}

#[test]
fn absent_and_present_fields_mix() {
    let spec = MarshalSpec::default();
    let value = Telemetry {
        int: 1,
        big_int: 2,
        label: None,
        price: None,
        samples: Vec::new(),
    };
    let back: Telemetry = decode(&encode(&value, &spec).unwrap(), &spec).unwrap();
    assert_eq!(back, value);
}

#[test]
fn values_render_for_diagnostics() {
    assert_eq!(
        WireValue::Decimal {
            unscaled: 1_999_95,
            scale: 2
        }
        .render(),
        "1999.95"
    );
    assert_eq!(WireValue::List(Vec::new()).render(), "[]");
}
