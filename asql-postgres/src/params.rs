use asql_core::Value;
use bytes::BytesMut;
use postgres_types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use std::error::Error as StdError;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use uuid::Uuid;

type BoxError = Box<dyn StdError + Sync + Send>;

/// Each dynamic value type maps to one fixed backend type; nulls are sent as
/// unknown so the server deduces them.
pub(crate) fn param_types(params: &[Value]) -> Vec<Type> {
    params
        .iter()
        .map(|value| match value {
            Value::Null => Type::UNKNOWN,
            Value::Bool(..) => Type::BOOL,
            Value::Int32(..) => Type::INT4,
            Value::Int64(..) => Type::INT8,
            Value::Float64(..) => Type::FLOAT8,
            Value::Text(..) => Type::TEXT,
            Value::Blob(..) => Type::BYTEA,
            Value::Uuid(..) => Type::UUID,
            Value::Json(..) => Type::JSONB,
            Value::Date(..) => Type::DATE,
            Value::Time(..) => Type::TIME,
            Value::Timestamp(..) => Type::TIMESTAMPTZ,
        })
        .collect()
}

/// Binary parameter bridge between [`Value`] and the wire encoding.
#[derive(Debug)]
pub(crate) struct PgParam(pub(crate) Value);

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match &self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql(ty, out),
            Value::Int32(v) => v.to_sql(ty, out),
            Value::Int64(v) => v.to_sql(ty, out),
            Value::Float64(v) => v.to_sql(ty, out),
            Value::Text(v) => v.to_sql(ty, out),
            Value::Blob(v) => v.as_slice().to_sql(ty, out),
            Value::Uuid(v) => v.to_sql(ty, out),
            Value::Json(v) => v.to_sql(ty, out),
            Value::Date(v) => v.to_sql(ty, out),
            Value::Time(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Binary column bridge; anything without a dedicated mapping falls back to
/// UTF-8 text, then raw bytes.
#[derive(Debug)]
pub(crate) struct PgCell(pub(crate) Value);

impl<'a> FromSql<'a> for PgCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let value = match *ty {
            Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => Value::Int32(i16::from_sql(ty, raw)? as i32),
            Type::INT4 => Value::Int32(i32::from_sql(ty, raw)?),
            Type::OID | Type::REGPROC | Type::XID | Type::CID => {
                Value::Int32(u32::from_be_bytes(raw.try_into()?) as i32)
            }
            Type::INT8 => Value::Int64(i64::from_sql(ty, raw)?),
            Type::FLOAT4 => Value::Float64(f32::from_sql(ty, raw)? as f64),
            Type::FLOAT8 => Value::Float64(f64::from_sql(ty, raw)?),
            Type::NUMERIC => Value::Float64(numeric_to_f64(raw)?),
            Type::BYTEA => Value::Blob(raw.to_vec()),
            Type::DATE => Value::Date(Date::from_sql(ty, raw)?),
            Type::TIME => Value::Time(Time::from_sql(ty, raw)?),
            Type::TIMETZ => Value::Time(timetz_from_sql(raw)?),
            Type::TIMESTAMP => {
                Value::Timestamp(PrimitiveDateTime::from_sql(ty, raw)?.assume_offset(UtcOffset::UTC))
            }
            Type::TIMESTAMPTZ => Value::Timestamp(OffsetDateTime::from_sql(ty, raw)?),
            Type::UUID => Value::Uuid(Uuid::from_sql(ty, raw)?),
            Type::JSON | Type::JSONB => Value::Json(serde_json::Value::from_sql(ty, raw)?),
            Type::VARCHAR | Type::TEXT | Type::NAME | Type::BPCHAR | Type::XML => {
                Value::Text(String::from_sql(ty, raw)?)
            }
            _ => match std::str::from_utf8(raw) {
                Ok(text) => Value::Text(text.to_string()),
                Err(..) => Value::Blob(raw.to_vec()),
            },
        };
        Ok(PgCell(value))
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(PgCell(Value::Null))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// `numeric` arrives as base-10000 digits; the spec maps it to f64.
fn numeric_to_f64(raw: &[u8]) -> Result<f64, BoxError> {
    if raw.len() < 8 {
        return Err("invalid numeric value".into());
    }
    let ndigits = u16::from_be_bytes(raw[0..2].try_into()?) as usize;
    let weight = i16::from_be_bytes(raw[2..4].try_into()?) as i32;
    let sign = u16::from_be_bytes(raw[4..6].try_into()?);
    match sign {
        0xC000 => return Ok(f64::NAN),
        0xD000 => return Ok(f64::INFINITY),
        0xF000 => return Ok(f64::NEG_INFINITY),
        _ => {}
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("truncated numeric value".into());
    }
    let mut value = 0f64;
    for i in 0..ndigits {
        let offset = 8 + i * 2;
        let digit = u16::from_be_bytes(raw[offset..offset + 2].try_into()?) as f64;
        value += digit * 10000f64.powi(weight - i as i32);
    }
    if sign == 0x4000 {
        value = -value;
    }
    Ok(value)
}

/// `timetz` is eight bytes of microseconds plus a zone offset; only the
/// wall-clock part is surfaced.
fn timetz_from_sql(raw: &[u8]) -> Result<Time, BoxError> {
    if raw.len() != 12 {
        return Err("invalid timetz value".into());
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into()?).clamp(0, 86_399_999_999);
    let seconds = micros / 1_000_000;
    Ok(Time::from_hms_micro(
        (seconds / 3600) as u8,
        ((seconds / 60) % 60) as u8,
        (seconds % 60) as u8,
        (micros % 1_000_000) as u32,
    )?)
}
