//! Bindable values and the coercion rules shared by windows and functions.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Storage class of a field held in a cursor window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// SQL NULL.
    Null = 0,
    /// 64-bit signed integer.
    Integer = 1,
    /// 64-bit float.
    Float = 2,
    /// UTF-8 text.
    String = 3,
    /// Raw bytes.
    Blob = 4,
}

impl FieldType {
    pub(crate) fn from_tag(tag: u8) -> FieldType {
        match tag {
            1 => FieldType::Integer,
            2 => FieldType::Float,
            3 => FieldType::String,
            4 => FieldType::Blob,
            _ => FieldType::Null,
        }
    }
}

/// Closed set of values that can be bound to a statement parameter or read
/// back from a row.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum SqlValue {
    /// Null literal.
    #[default]
    Null,
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Text.
    String(String),
    /// Binary payload.
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Storage class of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            SqlValue::Null => FieldType::Null,
            SqlValue::Int(_) => FieldType::Integer,
            SqlValue::Float(_) => FieldType::Float,
            SqlValue::String(_) => FieldType::String,
            SqlValue::Bytes(_) => FieldType::Blob,
        }
    }

    /// True for [`SqlValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text form used where a record id is expected.
    pub fn as_id(&self) -> Option<String> {
        match self {
            SqlValue::String(s) => Some(s.clone()),
            SqlValue::Int(v) => Some(v.to_string()),
            _ => None,
        }
    }

    /// Reads as text following the window coercion rules.
    pub fn to_text(&self) -> Result<Option<String>, String> {
        match self {
            SqlValue::Null => Ok(None),
            SqlValue::Int(v) => Ok(Some(v.to_string())),
            SqlValue::Float(v) => Ok(Some(format_general(*v))),
            SqlValue::String(s) => Ok(Some(s.clone())),
            SqlValue::Bytes(_) => Err("Unable to convert BLOB to string".to_owned()),
        }
    }

    /// Reads as an integer following the window coercion rules.
    pub fn to_long(&self) -> Result<i64, String> {
        match self {
            SqlValue::Null => Ok(0),
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Float(v) => Ok(*v as i64),
            SqlValue::String(s) => Ok(parse_long_prefix(s)),
            SqlValue::Bytes(_) => Err("Unable to convert BLOB to long".to_owned()),
        }
    }

    /// Reads as a float following the window coercion rules.
    pub fn to_double(&self) -> Result<f64, String> {
        match self {
            SqlValue::Null => Ok(0.0),
            SqlValue::Int(v) => Ok(*v as f64),
            SqlValue::Float(v) => Ok(*v),
            SqlValue::String(s) => Ok(parse_double_prefix(s)),
            SqlValue::Bytes(_) => Err("Unable to convert BLOB to double".to_owned()),
        }
    }

    /// Reads as bytes following the window coercion rules.
    pub fn to_blob(&self) -> Result<Option<Vec<u8>>, String> {
        match self {
            SqlValue::Null => Ok(None),
            SqlValue::Bytes(b) => Ok(Some(b.clone())),
            SqlValue::String(s) => Ok(Some(s.as_bytes().to_vec())),
            SqlValue::Int(_) => Err("Unable to convert INTEGER to blob".to_owned()),
            SqlValue::Float(_) => Err("Unable to convert FLOAT to blob".to_owned()),
        }
    }

    pub(crate) fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Int(v),
            ValueRef::Real(v) => SqlValue::Float(v),
            ValueRef::Text(t) => SqlValue::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Float(v) => f.write_str(&format_general(*v)),
            SqlValue::String(s) => f.write_str(s),
            SqlValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Int(v) => ValueRef::Integer(*v),
            SqlValue::Float(v) => ValueRef::Real(*v),
            SqlValue::String(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Bytes(b) => ValueRef::Blob(b),
        }))
    }
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(impl From<$t> for SqlValue {
            fn from(v: $t) -> Self {
                SqlValue::Int(v as i64)
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, u8, u16, u32, isize);

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        SqlValue::Float(f64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Bytes(v.to_vec())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Int(v) => serializer.serialize_i64(*v),
            SqlValue::Float(v) => serializer.serialize_f64(*v),
            SqlValue::String(s) => serializer.serialize_str(s),
            SqlValue::Bytes(b) => serializer.collect_seq(b),
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SqlValueVisitor;

        impl<'de> Visitor<'de> for SqlValueVisitor {
            type Value = SqlValue;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("null, a boolean, a number, a string or a byte array")
            }

            fn visit_unit<E: de::Error>(self) -> Result<SqlValue, E> {
                Ok(SqlValue::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<SqlValue, E> {
                Ok(SqlValue::Null)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<SqlValue, E> {
                Ok(SqlValue::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SqlValue, E> {
                Ok(SqlValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SqlValue, E> {
                i64::try_from(v)
                    .map(SqlValue::Int)
                    .or(Ok(SqlValue::Float(v as f64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<SqlValue, E> {
                Ok(SqlValue::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SqlValue, E> {
                Ok(SqlValue::String(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<SqlValue, E> {
                Ok(SqlValue::String(v))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<SqlValue, E> {
                Ok(SqlValue::Bytes(v.to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<SqlValue, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(SqlValue::Bytes(bytes))
            }
        }

        deserializer.deserialize_any(SqlValueVisitor)
    }
}

/// Parses the longest integer prefix of `text` the way `strtoll(text, NULL, 0)`
/// does: leading whitespace, optional sign, `0x` for hex, leading `0` for octal.
/// Returns 0 when no digits are present and saturates on overflow.
pub fn parse_long_prefix(text: &str) -> i64 {
    let bytes = text.trim_start().as_bytes();
    let mut idx = 0;
    let negative = match bytes.first() {
        Some(b'-') => {
            idx += 1;
            true
        }
        Some(b'+') => {
            idx += 1;
            false
        }
        _ => false,
    };

    let radix: u32 = if bytes.get(idx) == Some(&b'0')
        && matches!(bytes.get(idx + 1), Some(b'x') | Some(b'X'))
        && bytes.get(idx + 2).is_some_and(|b| b.is_ascii_hexdigit())
    {
        idx += 2;
        16
    } else if bytes.get(idx) == Some(&b'0') {
        8
    } else {
        10
    };

    let mut magnitude: i128 = 0;
    let limit = i128::from(i64::MAX) + 1;
    for &b in &bytes[idx..] {
        let digit = match (b as char).to_digit(radix) {
            Some(d) => d,
            None => break,
        };
        magnitude = (magnitude * i128::from(radix) + i128::from(digit)).min(limit);
    }

    if negative {
        (-magnitude).max(i128::from(i64::MIN)) as i64
    } else {
        magnitude.min(i128::from(i64::MAX)) as i64
    }
}

/// Parses the longest float prefix of `text` the way `strtod` does.
/// Returns 0.0 when no number is present.
pub fn parse_double_prefix(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'-') | Some(b'+')) {
        end += 1;
    }

    let rest = &bytes[end..];
    for special in ["infinity", "inf", "nan"] {
        if rest
            .get(..special.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(special.as_bytes()))
        {
            return trimmed[..end + special.len()].parse().unwrap_or(0.0);
        }
    }

    let digits_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut mantissa_digits = end - digits_start;
    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        mantissa_digits += frac_end - frac_start;
        if mantissa_digits > 0 {
            end = frac_end;
        }
    }
    if mantissa_digits == 0 {
        return 0.0;
    }

    if matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'-') | Some(b'+')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    trimmed[..end].parse().unwrap_or(0.0)
}

/// Formats a float like C's `%g`: six significant digits, trailing zeros
/// removed, exponent form outside `1e-4..1e6`.
pub fn format_general(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_owned();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }

    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if (-4..PRECISION).contains(&exponent) {
        let decimals = (PRECISION - 1 - exponent) as usize;
        strip_fraction_zeros(format!("{:.*}", decimals, value))
    } else {
        let mantissa = strip_fraction_zeros(mantissa.to_owned());
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

fn strip_fraction_zeros(mut text: String) -> String {
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text
}
