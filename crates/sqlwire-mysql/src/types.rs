//! MySQL type system and value conversion.
//!
//! This module provides:
//! - MySQL field type codes and column metadata ([`ColumnDef`])
//! - The [`Converters`] registry that turns text-protocol cells into [`Value`]s
//! - Binary-protocol cell decoding for prepared-statement rows
//!
//! Text and binary protocol share one registry: binary cells that travel as
//! length-encoded strings (DECIMAL, VARCHAR, JSON, ...) go through the same
//! converters, so an override applies to both.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;

use sqlwire_core::{Error, SqlDate, SqlDateTime, SqlTime, Value};

use crate::charset::BINARY_CHARSET_ID;
use crate::error::{malformed, protocol_error};
use crate::protocol::PacketReader;

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type byte. Unknown codes are treated as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    /// Types whose binary form is a length-encoded string.
    #[must_use]
    pub const fn is_string_encoded(self) -> bool {
        !(self.is_integer()
            || self.is_float()
            || self.is_date_like()
            || matches!(self, FieldType::Time | FieldType::Time2 | FieldType::Null))
    }

    /// DATE / DATETIME / TIMESTAMP family.
    #[must_use]
    pub const fn is_date_like(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::DateTime
                | FieldType::DateTime2
                | FieldType::Timestamp
                | FieldType::Timestamp2
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set or a prepare response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub catalog: String,
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    pub org_name: String,
    /// Character set / collation id
    pub charset: u16,
    /// Maximum display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet (protocol 4.1).
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut r = PacketReader::new(payload);
        let mut text = || {
            r.read_lenenc_string()
                .ok_or_else(|| malformed("column definition", payload))
        };
        let catalog = text()?;
        let schema = text()?;
        let table = text()?;
        let org_table = text()?;
        let name = text()?;
        let org_name = text()?;
        // length of the fixed-size tail, always 0x0c
        if r.read_lenenc_int().is_none() {
            return Err(malformed("column definition", payload));
        }
        let charset = r.read_u16_le();
        let column_length = r.read_u32_le();
        let column_type = r.read_u8();
        let flags = r.read_u16_le();
        let decimals = r.read_u8();
        match (charset, column_length, column_type, flags, decimals) {
            (Some(charset), Some(column_length), Some(ty), Some(flags), Some(decimals)) => {
                Ok(Self {
                    catalog,
                    schema,
                    table,
                    org_table,
                    name,
                    org_name,
                    charset,
                    column_length,
                    column_type: FieldType::from_u8(ty),
                    flags,
                    decimals,
                })
            }
            _ => Err(malformed("column definition", payload)),
        }
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Binary collation: string cells stay raw bytes.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET_ID
    }
}

/// Converts one text-protocol cell into a value.
pub type TextDecoder = fn(&[u8], &ColumnDef) -> Value;

/// Registry of text decoders keyed by field type.
///
/// Unregistered types use the built-in decoding:
///
/// | field type | value |
/// |---|---|
/// | integer family | `Int` / `UInt` by the UNSIGNED flag |
/// | FLOAT / DOUBLE | `Float` / `Double` |
/// | DECIMAL | `Decimal` (string, exact) |
/// | DATE / DATETIME / TIMESTAMP | `Date` / `DateTime`, `Text` when unparseable |
/// | TIME | `Time`, `Text` when unparseable |
/// | JSON | `Json` parsed from the text, `Text` when invalid |
/// | BIT, binary-collation strings and blobs | `Bytes` |
/// | other strings | `Text` (lossy UTF-8) |
#[derive(Debug, Clone, Default)]
pub struct Converters {
    overrides: HashMap<FieldType, TextDecoder>,
}

impl Converters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a field type, replacing any earlier one.
    pub fn with(mut self, field_type: FieldType, decoder: TextDecoder) -> Self {
        self.overrides.insert(field_type, decoder);
        self
    }

    pub fn decode(&self, data: &[u8], column: &ColumnDef) -> Value {
        match self.overrides.get(&column.column_type) {
            Some(decoder) => decoder(data, column),
            None => decode_text_default(data, column),
        }
    }
}

/// Built-in text decoding (see [`Converters`]).
pub fn decode_text_default(data: &[u8], column: &ColumnDef) -> Value {
    let lossy = || String::from_utf8_lossy(data).into_owned();
    let text = std::str::from_utf8(data).unwrap_or("");
    match column.column_type {
        ty if ty.is_integer() => {
            let parsed = if column.is_unsigned() {
                text.parse::<u64>().ok().map(Value::UInt)
            } else {
                text.parse::<i64>().ok().map(Value::Int)
            };
            parsed.unwrap_or_else(|| Value::Text(lossy()))
        }
        FieldType::Float => text
            .parse::<f32>()
            .map_or_else(|_| Value::Text(lossy()), Value::Float),
        FieldType::Double => text
            .parse::<f64>()
            .map_or_else(|_| Value::Text(lossy()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(lossy()),
        FieldType::Date | FieldType::NewDate => {
            SqlDate::parse(text).map_or_else(|| Value::Text(lossy()), Value::Date)
        }
        ty if ty.is_date_like() => {
            SqlDateTime::parse(text).map_or_else(|| Value::Text(lossy()), Value::DateTime)
        }
        FieldType::Time | FieldType::Time2 => {
            SqlTime::parse(text).map_or_else(|| Value::Text(lossy()), Value::Time)
        }
        FieldType::Json => {
            serde_json::from_str(text).map_or_else(|_| Value::Text(lossy()), Value::Json)
        }
        FieldType::Null => Value::Null,
        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        _ if column.is_binary() => Value::Bytes(data.to_vec()),
        _ => Value::Text(lossy()),
    }
}

/// Decode one non-NULL binary-protocol cell at the reader's position.
pub fn decode_binary_value(
    reader: &mut PacketReader<'_>,
    column: &ColumnDef,
    converters: &Converters,
) -> Result<Value, Error> {
    let truncated = || protocol_error(format!("Truncated binary row at column '{}'", column.name));
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        FieldType::Tiny if unsigned => Value::UInt(u64::from(reader.read_u8().ok_or_else(truncated)?)),
        FieldType::Tiny => Value::Int(i64::from(reader.read_i8().ok_or_else(truncated)?)),
        FieldType::Short | FieldType::Year if unsigned || column.column_type == FieldType::Year => {
            Value::UInt(u64::from(reader.read_u16_le().ok_or_else(truncated)?))
        }
        FieldType::Short => Value::Int(i64::from(reader.read_i16_le().ok_or_else(truncated)?)),
        FieldType::Long | FieldType::Int24 if unsigned => {
            Value::UInt(u64::from(reader.read_u32_le().ok_or_else(truncated)?))
        }
        FieldType::Long | FieldType::Int24 => {
            Value::Int(i64::from(reader.read_i32_le().ok_or_else(truncated)?))
        }
        FieldType::LongLong if unsigned => Value::UInt(reader.read_u64_le().ok_or_else(truncated)?),
        FieldType::LongLong => Value::Int(reader.read_i64_le().ok_or_else(truncated)?),
        FieldType::Float => Value::Float(reader.read_f32_le().ok_or_else(truncated)?),
        FieldType::Double => Value::Double(reader.read_f64_le().ok_or_else(truncated)?),
        FieldType::Null => Value::Null,
        FieldType::Date | FieldType::NewDate => {
            let dt = read_binary_datetime(reader, column)?;
            Value::Date(dt.date)
        }
        ty if ty.is_date_like() => Value::DateTime(read_binary_datetime(reader, column)?),
        FieldType::Time | FieldType::Time2 => Value::Time(read_binary_time(reader, column)?),
        _ => {
            let raw = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            converters.decode(raw, column)
        }
    };
    Ok(value)
}

/// DATE/DATETIME/TIMESTAMP: length tag then 0, 4, 7 or 11 bytes.
fn read_binary_datetime(
    reader: &mut PacketReader<'_>,
    column: &ColumnDef,
) -> Result<SqlDateTime, Error> {
    let len = reader
        .read_u8()
        .ok_or_else(|| protocol_error("Truncated binary date"))?;
    if !matches!(len, 0 | 4 | 7 | 11) {
        return Err(protocol_error(format!(
            "Invalid binary date length {len} for column '{}'",
            column.name
        )));
    }
    let body = reader
        .read_bytes(usize::from(len))
        .ok_or_else(|| protocol_error("Truncated binary date"))?;
    let mut r = PacketReader::new(body);
    let mut dt = SqlDateTime::default();
    if len >= 4 {
        dt.date = SqlDate::new(
            r.read_u16_le().unwrap_or_default(),
            r.read_u8().unwrap_or_default(),
            r.read_u8().unwrap_or_default(),
        );
    }
    if len >= 7 {
        dt.hour = r.read_u8().unwrap_or_default();
        dt.minute = r.read_u8().unwrap_or_default();
        dt.second = r.read_u8().unwrap_or_default();
    }
    if len == 11 {
        dt.micros = r.read_u32_le().unwrap_or_default();
    }
    Ok(dt)
}

/// TIME: length tag then 0, 8 or 12 bytes (sign, days, h, m, s, [micros]).
fn read_binary_time(reader: &mut PacketReader<'_>, column: &ColumnDef) -> Result<SqlTime, Error> {
    let len = reader
        .read_u8()
        .ok_or_else(|| protocol_error("Truncated binary time"))?;
    if !matches!(len, 0 | 8 | 12) {
        return Err(protocol_error(format!(
            "Invalid binary time length {len} for column '{}'",
            column.name
        )));
    }
    let body = reader
        .read_bytes(usize::from(len))
        .ok_or_else(|| protocol_error("Truncated binary time"))?;
    let mut r = PacketReader::new(body);
    let mut t = SqlTime::default();
    if len >= 8 {
        t.negative = r.read_u8().unwrap_or_default() != 0;
        t.days = r.read_u32_le().unwrap_or_default();
        t.hours = r.read_u8().unwrap_or_default();
        t.minutes = r.read_u8().unwrap_or_default();
        t.seconds = r.read_u8().unwrap_or_default();
    }
    if len == 12 {
        t.micros = r.read_u32_le().unwrap_or_default();
    }
    Ok(t)
}
