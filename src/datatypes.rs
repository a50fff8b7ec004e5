//! Text and binary value codecs for the built-in type catalog.
//!
//! The registry maps a type OID to an encode/decode pair. Hosts can extend
//! the catalog through [`crate::config::ServerConfig::with_types`].

// Standard library imports
use std::collections::HashMap;

// External crate imports
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

// Internal crate imports
use crate::errors::Error;

pub type Oid = u32;

/// OIDs of the built-in types, matching the PostgreSQL catalog.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const NUMERIC: Oid = 1700;
    pub const UUID: Oid = 2950;
}

/// Wire format code, per column or per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Binary,
}

impl Format {
    pub fn from_code(code: i16) -> Result<Format, Error> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(Error::ProtocolViolation(format!(
                "Unknown format code {other}"
            ))),
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}

/// A decoded parameter or result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    /// Arbitrary precision values are carried in their canonical text form.
    Numeric(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

type EncodeFn = fn(&Value) -> Result<Vec<u8>, Error>;
type DecodeFn = fn(&[u8]) -> Result<Value, Error>;

/// Encode and decode callbacks for one type, one pair per wire format.
#[derive(Clone)]
pub struct TypeCodec {
    pub encode_text: EncodeFn,
    pub decode_text: DecodeFn,
    pub encode_binary: EncodeFn,
    pub decode_binary: DecodeFn,
}

/// OID to codec mapping shared by every connection of a server.
#[derive(Clone)]
pub struct TypeRegistry {
    codecs: HashMap<Oid, TypeCodec>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        let mut codecs = HashMap::new();

        let text_codec = TypeCodec {
            encode_text: encode_text_value,
            decode_text: decode_text_value,
            encode_binary: encode_text_value,
            decode_binary: decode_text_value,
        };

        codecs.insert(
            oid::BOOL,
            TypeCodec {
                encode_text: encode_bool_text,
                decode_text: decode_bool_text,
                encode_binary: encode_bool_binary,
                decode_binary: decode_bool_binary,
            },
        );
        codecs.insert(
            oid::INT2,
            TypeCodec {
                encode_text: encode_int_text,
                decode_text: decode_int2_text,
                encode_binary: encode_int2_binary,
                decode_binary: decode_int2_binary,
            },
        );
        codecs.insert(
            oid::INT4,
            TypeCodec {
                encode_text: encode_int_text,
                decode_text: decode_int4_text,
                encode_binary: encode_int4_binary,
                decode_binary: decode_int4_binary,
            },
        );
        codecs.insert(
            oid::INT8,
            TypeCodec {
                encode_text: encode_int_text,
                decode_text: decode_int8_text,
                encode_binary: encode_int8_binary,
                decode_binary: decode_int8_binary,
            },
        );
        codecs.insert(
            oid::FLOAT4,
            TypeCodec {
                encode_text: encode_float_text,
                decode_text: decode_float4_text,
                encode_binary: encode_float4_binary,
                decode_binary: decode_float4_binary,
            },
        );
        codecs.insert(
            oid::FLOAT8,
            TypeCodec {
                encode_text: encode_float_text,
                decode_text: decode_float8_text,
                encode_binary: encode_float8_binary,
                decode_binary: decode_float8_binary,
            },
        );
        codecs.insert(oid::TEXT, text_codec.clone());
        codecs.insert(oid::VARCHAR, text_codec.clone());
        codecs.insert(oid::BPCHAR, text_codec.clone());
        codecs.insert(oid::UNKNOWN, text_codec);
        codecs.insert(
            oid::BYTEA,
            TypeCodec {
                encode_text: encode_bytea_text,
                decode_text: decode_bytea_text,
                encode_binary: encode_bytea_binary,
                decode_binary: decode_bytea_binary,
            },
        );
        codecs.insert(
            oid::NUMERIC,
            TypeCodec {
                encode_text: encode_numeric_text,
                decode_text: decode_numeric_text,
                encode_binary: encode_numeric_binary,
                decode_binary: decode_numeric_binary,
            },
        );
        codecs.insert(
            oid::DATE,
            TypeCodec {
                encode_text: encode_date_text,
                decode_text: decode_date_text,
                encode_binary: encode_date_binary,
                decode_binary: decode_date_binary,
            },
        );
        codecs.insert(
            oid::TIMESTAMP,
            TypeCodec {
                encode_text: encode_timestamp_text,
                decode_text: decode_timestamp_text,
                encode_binary: encode_timestamp_binary,
                decode_binary: decode_timestamp_binary,
            },
        );
        codecs.insert(
            oid::TIMESTAMPTZ,
            TypeCodec {
                encode_text: encode_timestamptz_text,
                decode_text: decode_timestamptz_text,
                encode_binary: encode_timestamptz_binary,
                decode_binary: decode_timestamptz_binary,
            },
        );
        codecs.insert(
            oid::UUID,
            TypeCodec {
                encode_text: encode_uuid_text,
                decode_text: decode_uuid_text,
                encode_binary: encode_uuid_binary,
                decode_binary: decode_uuid_binary,
            },
        );

        TypeRegistry { codecs }
    }

    /// Register or replace the codec for a type. Used by host extensions.
    pub fn register(&mut self, oid: Oid, codec: TypeCodec) {
        self.codecs.insert(oid, codec);
    }

    /// Encode a value for the wire. `None` stands for the SQL NULL and is
    /// framed as length -1 by the caller. Unregistered OIDs fall back to the
    /// text codec so hosts can serve types the catalog does not know.
    pub fn encode(
        &self,
        oid: Oid,
        value: &Value,
        format: Format,
    ) -> Result<Option<Vec<u8>>, Error> {
        if value.is_null() {
            return Ok(None);
        }

        let codec = self.codec(oid);
        let encoded = match format {
            Format::Text => (codec.encode_text)(value)?,
            Format::Binary => (codec.encode_binary)(value)?,
        };
        Ok(Some(encoded))
    }

    /// Decode raw wire bytes into a value. `None` is the SQL NULL.
    pub fn decode(
        &self,
        oid: Oid,
        data: Option<&[u8]>,
        format: Format,
    ) -> Result<Value, Error> {
        let data = match data {
            Some(data) => data,
            None => return Ok(Value::Null),
        };

        let codec = self.codec(oid);
        match format {
            Format::Text => (codec.decode_text)(data),
            Format::Binary => (codec.decode_binary)(data),
        }
    }

    fn codec(&self, oid: Oid) -> &TypeCodec {
        self.codecs
            .get(&oid)
            .unwrap_or_else(|| self.codecs.get(&oid::TEXT).expect("text codec is built in"))
    }
}

// Days and microseconds between the Unix epoch and the PostgreSQL epoch
// (2000-01-01).
fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid epoch")
}

fn pg_epoch_datetime() -> NaiveDateTime {
    pg_epoch_date().and_hms_opt(0, 0, 0).expect("valid epoch")
}

fn utf8(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|err| Error::DecodeError(format!("Invalid UTF-8: {err}")))
}

fn fixed<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N], Error> {
    <[u8; N]>::try_from(data).map_err(|_| {
        Error::DecodeError(format!(
            "Expected {N} bytes for {what}, received {}",
            data.len()
        ))
    })
}

// bool

fn encode_bool_text(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Bool(true) => Ok(b"t".to_vec()),
        Value::Bool(false) => Ok(b"f".to_vec()),
        other => Err(mismatch("bool", other)),
    }
}

fn decode_bool_text(data: &[u8]) -> Result<Value, Error> {
    match utf8(data)? {
        "t" | "true" | "1" => Ok(Value::Bool(true)),
        "f" | "false" | "0" => Ok(Value::Bool(false)),
        other => Err(Error::DecodeError(format!("Invalid bool literal: {other}"))),
    }
}

fn encode_bool_binary(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Bool(value) => Ok(vec![*value as u8]),
        other => Err(mismatch("bool", other)),
    }
}

fn decode_bool_binary(data: &[u8]) -> Result<Value, Error> {
    let byte = fixed::<1>(data, "bool")?;
    Ok(Value::Bool(byte[0] != 0))
}

// integers

fn integer_of(value: &Value) -> Result<i64, Error> {
    match value {
        Value::Int2(value) => Ok(*value as i64),
        Value::Int4(value) => Ok(*value as i64),
        Value::Int8(value) => Ok(*value),
        other => Err(mismatch("integer", other)),
    }
}

fn encode_int_text(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(integer_of(value)?.to_string().into_bytes())
}

fn decode_int2_text(data: &[u8]) -> Result<Value, Error> {
    utf8(data)?
        .parse::<i16>()
        .map(Value::Int2)
        .map_err(|err| Error::DecodeError(format!("Invalid int2 literal: {err}")))
}

fn decode_int4_text(data: &[u8]) -> Result<Value, Error> {
    utf8(data)?
        .parse::<i32>()
        .map(Value::Int4)
        .map_err(|err| Error::DecodeError(format!("Invalid int4 literal: {err}")))
}

fn decode_int8_text(data: &[u8]) -> Result<Value, Error> {
    utf8(data)?
        .parse::<i64>()
        .map(Value::Int8)
        .map_err(|err| Error::DecodeError(format!("Invalid int8 literal: {err}")))
}

fn encode_int2_binary(value: &Value) -> Result<Vec<u8>, Error> {
    let value = integer_of(value)?;
    let narrowed = i16::try_from(value)
        .map_err(|_| Error::EncodeError(format!("Value {value} out of range for int2")))?;
    Ok(narrowed.to_be_bytes().to_vec())
}

fn decode_int2_binary(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Int2(i16::from_be_bytes(fixed::<2>(data, "int2")?)))
}

fn encode_int4_binary(value: &Value) -> Result<Vec<u8>, Error> {
    let value = integer_of(value)?;
    let narrowed = i32::try_from(value)
        .map_err(|_| Error::EncodeError(format!("Value {value} out of range for int4")))?;
    Ok(narrowed.to_be_bytes().to_vec())
}

fn decode_int4_binary(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Int4(i32::from_be_bytes(fixed::<4>(data, "int4")?)))
}

fn encode_int8_binary(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(integer_of(value)?.to_be_bytes().to_vec())
}

fn decode_int8_binary(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Int8(i64::from_be_bytes(fixed::<8>(data, "int8")?)))
}

// floats

fn float_of(value: &Value) -> Result<f64, Error> {
    match value {
        Value::Float4(value) => Ok(*value as f64),
        Value::Float8(value) => Ok(*value),
        Value::Int2(value) => Ok(*value as f64),
        Value::Int4(value) => Ok(*value as f64),
        Value::Int8(value) => Ok(*value as f64),
        other => Err(mismatch("float", other)),
    }
}

fn float_to_text(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else {
        value.to_string()
    }
}

fn float_from_text(text: &str) -> Result<f64, Error> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|err| Error::DecodeError(format!("Invalid float literal: {err}"))),
    }
}

fn encode_float_text(value: &Value) -> Result<Vec<u8>, Error> {
    if let Value::Float4(value) = value {
        return Ok(float_to_text(*value as f64).into_bytes());
    }
    Ok(float_to_text(float_of(value)?).into_bytes())
}

fn decode_float4_text(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Float4(float_from_text(utf8(data)?)? as f32))
}

fn decode_float8_text(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Float8(float_from_text(utf8(data)?)?))
}

fn encode_float4_binary(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(((float_of(value)?) as f32).to_be_bytes().to_vec())
}

fn decode_float4_binary(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Float4(f32::from_be_bytes(fixed::<4>(
        data, "float4",
    )?)))
}

fn encode_float8_binary(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(float_of(value)?.to_be_bytes().to_vec())
}

fn decode_float8_binary(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Float8(f64::from_be_bytes(fixed::<8>(
        data, "float8",
    )?)))
}

// text family

fn encode_text_value(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Text(value) => Ok(value.clone().into_bytes()),
        Value::Bool(value) => Ok(if *value { b"t".to_vec() } else { b"f".to_vec() }),
        Value::Int2(value) => Ok(value.to_string().into_bytes()),
        Value::Int4(value) => Ok(value.to_string().into_bytes()),
        Value::Int8(value) => Ok(value.to_string().into_bytes()),
        Value::Float4(value) => Ok(float_to_text(*value as f64).into_bytes()),
        Value::Float8(value) => Ok(float_to_text(*value).into_bytes()),
        Value::Numeric(value) => Ok(value.clone().into_bytes()),
        Value::Uuid(value) => Ok(value.to_string().into_bytes()),
        other => Err(mismatch("text", other)),
    }
}

fn decode_text_value(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Text(utf8(data)?.to_string()))
}

// bytea

fn encode_bytea_text(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Bytea(data) => {
            let mut out = String::with_capacity(2 + data.len() * 2);
            out.push_str("\\x");
            for byte in data {
                out.push_str(&format!("{byte:02x}"));
            }
            Ok(out.into_bytes())
        }
        other => Err(mismatch("bytea", other)),
    }
}

fn decode_bytea_text(data: &[u8]) -> Result<Value, Error> {
    let text = utf8(data)?;
    let hex = text.strip_prefix("\\x").ok_or_else(|| {
        Error::DecodeError("Only hex-format bytea literals are supported".to_string())
    })?;
    if hex.len() % 2 != 0 {
        return Err(Error::DecodeError("Odd length bytea literal".to_string()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).expect("hex chunk is ASCII");
        let byte = u8::from_str_radix(pair, 16)
            .map_err(|err| Error::DecodeError(format!("Invalid bytea literal: {err}")))?;
        out.push(byte);
    }
    Ok(Value::Bytea(out))
}

fn encode_bytea_binary(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Bytea(data) => Ok(data.clone()),
        other => Err(mismatch("bytea", other)),
    }
}

fn decode_bytea_binary(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Bytea(data.to_vec()))
}

// numeric

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

fn numeric_of(value: &Value) -> Result<String, Error> {
    match value {
        Value::Numeric(value) => Ok(value.clone()),
        Value::Int2(value) => Ok(value.to_string()),
        Value::Int4(value) => Ok(value.to_string()),
        Value::Int8(value) => Ok(value.to_string()),
        Value::Text(value) => Ok(value.clone()),
        other => Err(mismatch("numeric", other)),
    }
}

fn encode_numeric_text(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(numeric_of(value)?.into_bytes())
}

fn decode_numeric_text(data: &[u8]) -> Result<Value, Error> {
    Ok(Value::Numeric(utf8(data)?.to_string()))
}

/// Encode a numeric literal into the base-10000 wire layout: digit count,
/// weight, sign, display scale, then the digit groups.
fn encode_numeric_binary(value: &Value) -> Result<Vec<u8>, Error> {
    let literal = numeric_of(value)?;

    if literal == "NaN" {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&0i16.to_be_bytes());
        out.extend_from_slice(&0i16.to_be_bytes());
        out.extend_from_slice(&NUMERIC_NAN.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        return Ok(out);
    }

    let (sign, unsigned) = match literal.strip_prefix('-') {
        Some(rest) => (NUMERIC_NEG, rest),
        None => (NUMERIC_POS, literal.strip_prefix('+').unwrap_or(&literal)),
    };

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (unsigned, ""),
    };
    if int_part.chars().chain(frac_part.chars()).any(|c| !c.is_ascii_digit())
        || (int_part.is_empty() && frac_part.is_empty())
    {
        return Err(Error::EncodeError(format!(
            "Invalid numeric literal: {literal}"
        )));
    }

    let dscale = frac_part.len() as u16;
    let int_trimmed = int_part.trim_start_matches('0');

    // Left-pad the integer digits and right-pad the fractional digits so
    // both split into whole base-10000 groups.
    let mut grouped = String::new();
    let lead = (4 - int_trimmed.len() % 4) % 4;
    grouped.extend(std::iter::repeat('0').take(lead));
    grouped.push_str(int_trimmed);
    let int_groups = grouped.len() / 4;
    grouped.push_str(frac_part);
    let tail = (4 - grouped.len() % 4) % 4;
    grouped.extend(std::iter::repeat('0').take(tail));

    let mut digits: Vec<u16> = grouped
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            std::str::from_utf8(chunk)
                .expect("digit chunk is ASCII")
                .parse::<u16>()
                .expect("digit chunk is numeric")
        })
        .collect();

    let mut weight = int_groups as i32 - 1;

    // Zero groups carry no information at either end of the digit string.
    while let Some(&0) = digits.first() {
        digits.remove(0);
        weight -= 1;
    }
    while let Some(&0) = digits.last() {
        digits.pop();
    }
    if digits.is_empty() {
        weight = 0;
    }

    let mut out = Vec::with_capacity(8 + digits.len() * 2);
    out.extend_from_slice(&(digits.len() as i16).to_be_bytes());
    out.extend_from_slice(&(weight as i16).to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&dscale.to_be_bytes());
    for digit in digits {
        out.extend_from_slice(&digit.to_be_bytes());
    }
    Ok(out)
}

fn decode_numeric_binary(data: &[u8]) -> Result<Value, Error> {
    if data.len() < 8 {
        return Err(Error::DecodeError("Truncated numeric value".to_string()));
    }
    let ndigits = i16::from_be_bytes([data[0], data[1]]) as usize;
    let weight = i16::from_be_bytes([data[2], data[3]]) as i32;
    let sign = u16::from_be_bytes([data[4], data[5]]);
    let dscale = u16::from_be_bytes([data[6], data[7]]) as usize;

    if sign == NUMERIC_NAN {
        return Ok(Value::Numeric("NaN".to_string()));
    }
    if data.len() < 8 + ndigits * 2 {
        return Err(Error::DecodeError("Truncated numeric digits".to_string()));
    }

    let digits: Vec<u16> = (0..ndigits)
        .map(|i| u16::from_be_bytes([data[8 + i * 2], data[9 + i * 2]]))
        .collect();

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    // Integer digit groups run from the group at `weight` down to zero.
    if weight < 0 {
        out.push('0');
    } else {
        for position in 0..=weight {
            let digit = digits.get(position as usize).copied().unwrap_or(0);
            if position == 0 {
                out.push_str(&digit.to_string());
            } else {
                out.push_str(&format!("{digit:04}"));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let mut position = weight + 1;
        while frac.len() < dscale {
            let digit = if position >= 0 {
                digits.get(position as usize).copied().unwrap_or(0)
            } else {
                0
            };
            frac.push_str(&format!("{digit:04}"));
            position += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(Value::Numeric(out))
}

// date and timestamps

fn encode_date_text(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Date(date) => Ok(date.format("%Y-%m-%d").to_string().into_bytes()),
        other => Err(mismatch("date", other)),
    }
}

fn decode_date_text(data: &[u8]) -> Result<Value, Error> {
    NaiveDate::parse_from_str(utf8(data)?, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|err| Error::DecodeError(format!("Invalid date literal: {err}")))
}

fn encode_date_binary(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Date(date) => {
            let days = date.num_days_from_ce() - pg_epoch_date().num_days_from_ce();
            Ok(days.to_be_bytes().to_vec())
        }
        other => Err(mismatch("date", other)),
    }
}

fn decode_date_binary(data: &[u8]) -> Result<Value, Error> {
    let days = i32::from_be_bytes(fixed::<4>(data, "date")?);
    pg_epoch_date()
        .checked_add_signed(chrono::Duration::days(days as i64))
        .map(Value::Date)
        .ok_or_else(|| Error::DecodeError(format!("Date out of range: {days} days")))
}

fn timestamp_of(value: &Value) -> Result<NaiveDateTime, Error> {
    match value {
        Value::Timestamp(ts) => Ok(*ts),
        Value::TimestampTz(ts) => Ok(ts.naive_utc()),
        other => Err(mismatch("timestamp", other)),
    }
}

fn encode_timestamp_text(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(timestamp_of(value)?
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
        .into_bytes())
}

fn decode_timestamp_text(data: &[u8]) -> Result<Value, Error> {
    let text = utf8(data)?;
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(Value::Timestamp)
        .map_err(|err| Error::DecodeError(format!("Invalid timestamp literal: {err}")))
}

fn micros_since_pg_epoch(ts: NaiveDateTime) -> Result<i64, Error> {
    ts.signed_duration_since(pg_epoch_datetime())
        .num_microseconds()
        .ok_or_else(|| Error::EncodeError("Timestamp out of range".to_string()))
}

fn encode_timestamp_binary(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(micros_since_pg_epoch(timestamp_of(value)?)?
        .to_be_bytes()
        .to_vec())
}

fn timestamp_from_micros(micros: i64) -> Result<NaiveDateTime, Error> {
    pg_epoch_datetime()
        .checked_add_signed(chrono::Duration::microseconds(micros))
        .ok_or_else(|| Error::DecodeError(format!("Timestamp out of range: {micros}")))
}

fn decode_timestamp_binary(data: &[u8]) -> Result<Value, Error> {
    let micros = i64::from_be_bytes(fixed::<8>(data, "timestamp")?);
    Ok(Value::Timestamp(timestamp_from_micros(micros)?))
}

fn encode_timestamptz_text(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(timestamp_of(value)?
        .format("%Y-%m-%d %H:%M:%S%.6f+00")
        .to_string()
        .into_bytes())
}

fn decode_timestamptz_text(data: &[u8]) -> Result<Value, Error> {
    let text = utf8(data)?;
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| Value::TimestampTz(ts.with_timezone(&Utc)))
        .map_err(|err| Error::DecodeError(format!("Invalid timestamptz literal: {err}")))
}

fn encode_timestamptz_binary(value: &Value) -> Result<Vec<u8>, Error> {
    Ok(micros_since_pg_epoch(timestamp_of(value)?)?
        .to_be_bytes()
        .to_vec())
}

fn decode_timestamptz_binary(data: &[u8]) -> Result<Value, Error> {
    let micros = i64::from_be_bytes(fixed::<8>(data, "timestamptz")?);
    Ok(Value::TimestampTz(
        Utc.from_utc_datetime(&timestamp_from_micros(micros)?),
    ))
}

// uuid

fn encode_uuid_text(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Uuid(value) => Ok(value.to_string().into_bytes()),
        other => Err(mismatch("uuid", other)),
    }
}

fn decode_uuid_text(data: &[u8]) -> Result<Value, Error> {
    Uuid::parse_str(utf8(data)?)
        .map(Value::Uuid)
        .map_err(|err| Error::DecodeError(format!("Invalid uuid literal: {err}")))
}

fn encode_uuid_binary(value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Uuid(value) => Ok(value.as_bytes().to_vec()),
        other => Err(mismatch("uuid", other)),
    }
}

fn decode_uuid_binary(data: &[u8]) -> Result<Value, Error> {
    let bytes = fixed::<16>(data, "uuid")?;
    Ok(Value::Uuid(Uuid::from_bytes(bytes)))
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::EncodeError(format!("Cannot encode {value:?} as {expected}"))
}
