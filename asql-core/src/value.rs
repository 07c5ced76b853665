use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use uuid::Uuid;

/// Dynamic value travelling between application code and a backend.
///
/// Backends that speak a text protocol hand back every column as
/// [`Value::Text`]; the typed accessors perform the conversion on access, so
/// `Text("42").to_i64()` yields `Some(42)`. Backends with binary results
/// store the typed variant directly and the accessors pass it through.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Blob(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Date(Date),
    Time(Time),
    Timestamp(OffsetDateTime),
}

type FormatItems = &'static [time::format_description::BorrowedFormatItem<'static>];

const DATE_FORMAT: FormatItems = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: FormatItems =
    format_description!(version = 2, "[hour]:[minute]:[second][optional [.[subsecond]]]");
const TIMESTAMP_FORMAT: FormatItems = format_description!(
    version = 2,
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
);
const TIMESTAMP_TZ_FORMAT: FormatItems = format_description!(
    version = 2,
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]][offset_hour sign:mandatory]:[offset_minute]"
);

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Postgres text booleans come back as `t`/`f`.
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Text(s) => Some(s.starts_with('t')),
            _ => None,
        }
    }

    pub fn to_i32(&self) -> Option<i32> {
        self.to_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `Infinity`/`-Infinity` are accepted the way the server spells them.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Text(s) => {
                if s.eq_ignore_ascii_case("infinity") {
                    Some(f64::INFINITY)
                } else if s.eq_ignore_ascii_case("-infinity") {
                    Some(f64::NEG_INFINITY)
                } else {
                    s.trim().parse().ok()
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Renders any value as text; `Null` renders empty.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            _ => self.to_string(),
        }
    }

    /// Byte-array access. The server-escaped text form (`\x…`) is un-escaped
    /// client-side; other text is returned as its raw bytes.
    pub fn to_blob(&self) -> Option<Vec<u8>> {
        match self {
            Value::Blob(b) => Some(b.clone()),
            Value::Text(s) => match s.strip_prefix("\\x") {
                Some(hex_digits) => hex::decode(hex_digits).ok(),
                None => Some(s.clone().into_bytes()),
            },
            _ => None,
        }
    }

    pub fn to_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            Value::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// Lazily parsed document; text that fails to parse yields `None` so the
    /// caller can fall back to [`Value::as_str`].
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Json(v) => Some(v.clone()),
            Value::Text(s) => serde_json::from_str(s).ok(),
            _ => None,
        }
    }

    pub fn to_date(&self) -> Option<Date> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            Value::Text(s) => Date::parse(s, DATE_FORMAT).ok(),
            _ => None,
        }
    }

    pub fn to_time(&self) -> Option<Time> {
        match self {
            Value::Time(t) => Some(*t),
            Value::Timestamp(ts) => Some(ts.time()),
            Value::Text(s) => {
                // timetz text carries a trailing offset; the wall-clock part
                // is everything before it
                let wall = match s.rfind(['+', '-']) {
                    Some(pos) if pos > 0 => &s[..pos],
                    _ => s.as_str(),
                };
                Time::parse(wall, TIME_FORMAT).ok()
            }
            _ => None,
        }
    }

    /// Timestamps without a zone are taken as UTC. A shortened offset
    /// (`+02` instead of `+02:00`) is normalised before parsing.
    pub fn to_timestamp(&self) -> Option<OffsetDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(s) => parse_timestamp_text(s),
            _ => None,
        }
    }

    /// Equality usable as a lookup key: floats compare bitwise so that a key
    /// built from the same inputs always matches.
    pub(crate) fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    pub(crate) fn key_hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int32(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
            Value::Blob(v) => v.hash(state),
            Value::Uuid(v) => v.hash(state),
            Value::Json(v) => v.to_string().hash(state),
            Value::Date(v) => v.hash(state),
            Value::Time(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

fn parse_timestamp_text(input: &str) -> Option<OffsetDateTime> {
    if input.len() < 10 {
        return None;
    }
    let mut s = input.to_owned();
    // the server may shorten the offset to `+NN`
    let sign = s.as_bytes()[s.len() - 3];
    if sign == b'+' || sign == b'-' {
        s.push_str(":00");
    }
    if let Ok(ts) = OffsetDateTime::parse(&s, TIMESTAMP_TZ_FORMAT) {
        return Some(ts);
    }
    PrimitiveDateTime::parse(input, TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.assume_offset(UtcOffset::UTC))
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Blob(v) => write!(f, "\\x{}", hex::encode(v)),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Json(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Time(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_value {
    ($source:ty, $variant:path) => {
        impl From<$source> for Value {
            fn from(value: $source) -> Self {
                $variant(value.into())
            }
        }
    };
}

impl_from_value!(bool, Value::Bool);
impl_from_value!(i32, Value::Int32);
impl_from_value!(i64, Value::Int64);
impl_from_value!(f64, Value::Float64);
impl_from_value!(&str, Value::Text);
impl_from_value!(String, Value::Text);
impl_from_value!(Vec<u8>, Value::Blob);
impl_from_value!(&[u8], Value::Blob);
impl_from_value!(Uuid, Value::Uuid);
impl_from_value!(serde_json::Value, Value::Json);
impl_from_value!(Date, Value::Date);
impl_from_value!(Time, Value::Time);
impl_from_value!(OffsetDateTime, Value::Timestamp);

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Builds a `Vec<Value>` parameter list from anything convertible to [`Value`].
///
/// ```
/// let params = asql_core::params![true, 42i64, "fooo"];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        <[_]>::into_vec(::std::boxed::Box::new([$($crate::Value::from($value)),+]))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time};

    #[test]
    fn text_to_numbers() {
        assert_eq!(Value::Text("42".into()).to_i64(), Some(42));
        assert_eq!(Value::Text("-7".into()).to_i32(), Some(-7));
        assert_eq!(Value::Text("1.5".into()).to_f64(), Some(1.5));
        assert_eq!(Value::Int32(9).to_f64(), Some(9.0));
        assert_eq!(Value::Text("nope".into()).to_i64(), None);
    }

    #[test]
    fn text_infinity() {
        assert_eq!(Value::Text("Infinity".into()).to_f64(), Some(f64::INFINITY));
        assert_eq!(
            Value::Text("-Infinity".into()).to_f64(),
            Some(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn text_booleans() {
        assert_eq!(Value::Text("t".into()).to_bool(), Some(true));
        assert_eq!(Value::Text("true".into()).to_bool(), Some(true));
        assert_eq!(Value::Text("f".into()).to_bool(), Some(false));
        assert_eq!(Value::Bool(true).to_bool(), Some(true));
    }

    #[test]
    fn text_temporal() {
        assert_eq!(
            Value::Text("2024-02-29".into()).to_date(),
            Some(date!(2024 - 02 - 29))
        );
        assert_eq!(
            Value::Text("13:45:07.25".into()).to_time(),
            Some(time!(13:45:07.25))
        );
        assert_eq!(
            Value::Text("12:00:00+02".into()).to_time(),
            Some(time!(12:00:00))
        );
    }

    #[test]
    fn timestamp_offset_normalisation() {
        // the server shortens `+02:00` to `+02`
        let ts = Value::Text("2021-06-01 10:00:00+02".into())
            .to_timestamp()
            .unwrap();
        assert_eq!(ts, datetime!(2021-06-01 10:00:00 +02:00));
        let naive = Value::Text("2021-06-01 10:00:00.5".into())
            .to_timestamp()
            .unwrap();
        assert_eq!(naive, datetime!(2021-06-01 10:00:00.5 UTC));
    }

    #[test]
    fn bytea_unescape() {
        assert_eq!(
            Value::Text("\\x68690a".into()).to_blob(),
            Some(b"hi\n".to_vec())
        );
        assert_eq!(Value::Blob(vec![1, 2]).to_blob(), Some(vec![1, 2]));
    }

    #[test]
    fn json_fallback() {
        let parsed = Value::Text("{\"a\":1}".into()).to_json().unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(Value::Text("not json".into()).to_json(), None);
    }

    #[test]
    fn params_macro() {
        let params = params![true, 1i32, 2i64, "x", Option::<i32>::None];
        assert_eq!(params[0], Value::Bool(true));
        assert_eq!(params[3], Value::Text("x".into()));
        assert_eq!(params[4], Value::Null);
    }
}
