//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use peerlink::{
    Cardinality, CommunicationConfig, Endpoint, FieldDescriptor, TransportSpec, Wire, WireType,
    WireValue,
};

/// The mirrored/marshalled type the integration suite exchanges.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Telemetry {
    pub int: i32,
    pub big_int: i64,
    pub label: Option<String>,
    pub price: Option<(i128, u8)>,
    pub samples: Vec<Option<i32>>,
}

impl Wire for Telemetry {
    const TYPE_TAG: u8 = 0x54;

    fn fields() -> &'static [FieldDescriptor<Self>] {
        static FIELDS: [FieldDescriptor<Telemetry>; 5] = [
            FieldDescriptor {
                name: "Int",
                wire_type: WireType::I32,
                get: |t| Some(WireValue::I32(t.int)),
                set: |t, v| {
                    if let Some(WireValue::I32(n)) = v {
                        t.int = n;
                    }
                    Ok(())
                },
            },
            FieldDescriptor {
                name: "BigInt",
                wire_type: WireType::I64,
                get: |t| Some(WireValue::I64(t.big_int)),
                set: |t, v| {
                    if let Some(WireValue::I64(n)) = v {
                        t.big_int = n;
                    }
                    Ok(())
                },
            },
            FieldDescriptor {
                name: "Label",
                wire_type: WireType::Str,
                get: |t| t.label.clone().map(WireValue::Str),
                set: |t, v| {
                    t.label = match v {
                        Some(WireValue::Str(text)) => Some(text),
                        _ => None,
                    };
                    Ok(())
                },
            },
            FieldDescriptor {
                name: "Price",
                wire_type: WireType::Decimal,
                get: |t| {
                    t.price
                        .map(|(unscaled, scale)| WireValue::Decimal { unscaled, scale })
                },
                set: |t, v| {
                    t.price = match v {
                        Some(WireValue::Decimal { unscaled, scale }) => Some((unscaled, scale)),
                        _ => None,
                    };
                    Ok(())
                },
            },
            FieldDescriptor {
                name: "Samples",
                wire_type: WireType::List(&WireType::I32),
                get: |t| {
                    Some(WireValue::List(
                        t.samples.iter().map(|x| x.map(WireValue::I32)).collect(),
                    ))
                },
                set: |t, v| {
                    t.samples = match v {
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

/// Receive-side config bound to an ephemeral localhost port.
pub fn receive_config(transport: TransportSpec) -> CommunicationConfig {
    CommunicationConfig::new(transport, Cardinality::Equal, Vec::new()).with_overrides(|c| {
        c.local_bind = Some(Endpoint::new("127.0.0.1", 0));
    })
}

/// Send-side config aimed at the given port.
pub fn send_config(transport: TransportSpec, port: u16) -> CommunicationConfig {
    CommunicationConfig::new(
        transport,
        Cardinality::Equal,
        vec![Endpoint::new("127.0.0.1", port)],
    )
}
