//! Register and primitive decoding.
//!
//! Modbus: assemble 1- or 2-register values into engineering units across
//! the four supported byte orders.  SNMP: map wire primitives to doubles
//! per the configured rule.  All functions here are pure.

use crate::config::{ByteOrder, RegisterType, SnmpType};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("need {needed} registers for this data type, got {got}")]
    ShortRead { needed: usize, got: usize },
    #[error("SNMP value {0} cannot be mapped with the configured rule")]
    SnmpMapping(String),
}

// ---------------------------------------------------------------------------
// Modbus
// ---------------------------------------------------------------------------

/// Convert a point-schedule register address to a zero-based wire address.
///
/// Addresses written as 4xxxx are 1-based holding registers; anything else
/// is taken as an already-zero-based address.
pub fn register_to_address(register: u32) -> u16 {
    if register >= 40001 {
        (register - 40001) as u16
    } else {
        register as u16
    }
}

/// Assemble two 16-bit registers into a 32-bit word per the byte order.
///
/// Registers arrive MSW-first on the wire; `order` describes how the
/// device actually laid the four bytes out.
fn assemble_u32(r0: u16, r1: u16, order: ByteOrder) -> u32 {
    let [a, b] = r0.to_be_bytes();
    let [c, d] = r1.to_be_bytes();
    let bytes = match order {
        ByteOrder::Big => [a, b, c, d],
        ByteOrder::Little => [d, c, b, a],
        ByteOrder::BigWordSwap => [c, d, a, b],
        ByteOrder::LittleWordSwap => [b, a, d, c],
    };
    u32::from_be_bytes(bytes)
}

/// Decode raw Modbus registers to an engineering value.
///
/// Applies `scale` then `offset`, rounded to 4 decimal places.
pub fn decode_registers(
    raw: &[u16],
    data_type: RegisterType,
    order: ByteOrder,
    scale: f64,
    offset: f64,
) -> Result<f64, DecodeError> {
    let needed = data_type.register_count() as usize;
    if raw.len() < needed {
        return Err(DecodeError::ShortRead {
            needed,
            got: raw.len(),
        });
    }

    let value = match data_type {
        RegisterType::Uint16 => f64::from(raw[0]),
        RegisterType::Int16 => f64::from(raw[0] as i16),
        RegisterType::Uint32 => f64::from(assemble_u32(raw[0], raw[1], order)),
        RegisterType::Int32 => f64::from(assemble_u32(raw[0], raw[1], order) as i32),
        RegisterType::Float32 => f64::from(f32::from_bits(assemble_u32(raw[0], raw[1], order))),
    };

    Ok(round4(value * scale + offset))
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// SNMP
// ---------------------------------------------------------------------------

/// A decoded SNMP varbind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    OctetString(String),
}

/// Map an SNMP primitive to a double per the configured rule.
///
/// `Counter` mappings return the raw counter value here; the rate is
/// computed downstream from consecutive samples.
pub fn snmp_value_to_f64(value: &SnmpValue, rule: SnmpType) -> Result<f64, DecodeError> {
    let numeric = match value {
        SnmpValue::Integer(i) => *i as f64,
        SnmpValue::Counter32(c) => f64::from(*c),
        SnmpValue::Gauge32(g) => f64::from(*g),
        SnmpValue::TimeTicks(t) => f64::from(*t),
        SnmpValue::OctetString(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| DecodeError::SnmpMapping(format!("octet string '{}'", s)))?,
    };

    Ok(match rule {
        SnmpType::Float | SnmpType::Counter => numeric,
        SnmpType::Int => numeric.trunc(),
        SnmpType::Bool => {
            if numeric != 0.0 {
                1.0
            } else {
                0.0
            }
        }
    })
}
