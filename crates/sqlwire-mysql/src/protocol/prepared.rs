//! Prepared statement (binary protocol) payloads.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL text. The server answers with
//!    a statement id, parameter and column counts, then the parameter and
//!    column definitions, each block followed by an EOF.
//! 2. **Execute**: COM_STMT_EXECUTE with the id and binary-encoded parameters.
//!    The server answers with an OK or a binary result set.
//! 3. **Close**: COM_STMT_CLOSE. No response.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::{SqlDateTime, SqlTime, Value};

use super::{Command, PacketReader, PacketWriter};
use crate::types::FieldType;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    /// Number of columns in the result (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of `?` placeholders
    pub num_params: u16,
    pub warnings: u16,
}

pub fn build_stmt_prepare_packet(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtPrepare);
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Layout: command, statement id, cursor flags (none), iteration count (1),
/// then when there are parameters: NULL bitmap, new-params-bound flag,
/// a (type, flags) pair per parameter and the non-NULL values.
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtExecute);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if params.is_empty() {
        return writer.into_bytes();
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);
    writer.write_u8(1);

    for param in params {
        let (field_type, unsigned) = param_type(param);
        writer.write_u8(field_type as u8);
        writer.write_u8(if unsigned { 0x80 } else { 0x00 });
    }
    for param in params {
        encode_binary_param(&mut writer, param);
    }
    writer.into_bytes()
}

pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

pub fn build_stmt_reset_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtReset);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse a COM_STMT_PREPARE OK response.
///
/// Layout: status 0x00, statement id (4), columns (2), params (2),
/// reserved (1), warnings (2).
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    if data.len() < 12 || data[0] != 0x00 {
        return None;
    }
    let mut r = PacketReader::new(&data[1..]);
    let statement_id = r.read_u32_le()?;
    let num_columns = r.read_u16_le()?;
    let num_params = r.read_u16_le()?;
    r.skip(1);
    let warnings = r.read_u16_le()?;
    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) => (FieldType::Tiny, false),
        Value::Int(_) => (FieldType::LongLong, false),
        Value::UInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) | Value::Json(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::DateTime(_) => (FieldType::DateTime, false),
        Value::Time(_) => (FieldType::Time, false),
    }
}

fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        // carried by the NULL bitmap
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::Int(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(d) => {
            encode_binary_datetime(writer, &SqlDateTime::new(*d, 0, 0, 0, 0));
        }
        Value::DateTime(dt) => encode_binary_datetime(writer, dt),
        Value::Time(t) => encode_binary_time(writer, t),
    }
}

/// Shortest of the 0/4/7/11 byte encodings that holds the value.
fn encode_binary_datetime(writer: &mut PacketWriter, dt: &SqlDateTime) {
    let has_time = dt.hour != 0 || dt.minute != 0 || dt.second != 0;
    let len: u8 = if dt.micros != 0 {
        11
    } else if has_time {
        7
    } else if !dt.date.is_zero() {
        4
    } else {
        0
    };
    writer.write_u8(len);
    if len >= 4 {
        writer.write_u16_le(dt.date.year);
        writer.write_u8(dt.date.month);
        writer.write_u8(dt.date.day);
    }
    if len >= 7 {
        writer.write_u8(dt.hour);
        writer.write_u8(dt.minute);
        writer.write_u8(dt.second);
    }
    if len == 11 {
        writer.write_u32_le(dt.micros);
    }
}

/// Shortest of the 0/8/12 byte encodings that holds the value.
fn encode_binary_time(writer: &mut PacketWriter, t: &SqlTime) {
    let is_zero = t.days == 0 && t.hours == 0 && t.minutes == 0 && t.seconds == 0;
    let len: u8 = if t.micros != 0 {
        12
    } else if !is_zero {
        8
    } else {
        0
    };
    writer.write_u8(len);
    if len >= 8 {
        writer.write_u8(u8::from(t.negative));
        writer.write_u32_le(t.days);
        writer.write_u8(t.hours);
        writer.write_u8(t.minutes);
        writer.write_u8(t.seconds);
    }
    if len == 12 {
        writer.write_u32_le(t.micros);
    }
}
