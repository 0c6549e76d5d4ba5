//! Result sets and row decoding for both protocols.

use std::sync::Arc;

use sqlwire_core::{ColumnInfo, Error, Row, Value};

use crate::error::malformed;
use crate::protocol::{OkPacket, PacketReader};
use crate::types::{ColumnDef, Converters, FieldType, decode_binary_value};

/// Per-column metadata in the shape of a DB-API `description` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub type_code: FieldType,
    pub display_size: u32,
    pub internal_size: u32,
    pub precision: u32,
    pub scale: u8,
    pub null_ok: bool,
}

impl From<&ColumnDef> for ColumnDescription {
    fn from(col: &ColumnDef) -> Self {
        let precision = match col.column_type {
            FieldType::Decimal | FieldType::NewDecimal => {
                // display length counts the sign and decimal point
                let sign = u32::from(!col.is_unsigned());
                let point = u32::from(col.decimals > 0);
                col.column_length.saturating_sub(sign + point)
            }
            _ => col.column_length,
        };
        Self {
            name: col.name.clone(),
            type_code: col.column_type,
            display_size: col.column_length,
            internal_size: col.column_length,
            precision,
            scale: col.decimals,
            null_ok: !col.is_not_null(),
        }
    }
}

/// One complete (buffered) result: either rows or an OK summary.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub insert_id: u64,
    pub warning_count: u16,
    pub info: String,
    pub status_flags: u16,
    /// The server has another result queued for the same command.
    pub has_next: bool,
}

impl ResultSet {
    pub(crate) fn from_ok(ok: OkPacket) -> Self {
        Self {
            has_next: ok.more_results(),
            affected_rows: ok.affected_rows,
            insert_id: ok.last_insert_id,
            warning_count: ok.warnings,
            status_flags: ok.status_flags,
            info: ok.info,
            ..Self::default()
        }
    }

    /// True when the statement produced rows (possibly zero of them).
    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn description(&self) -> Vec<ColumnDescription> {
        self.columns.iter().map(ColumnDescription::from).collect()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Row count as reported to callers: rows read for a SELECT, affected
    /// rows otherwise.
    pub fn rowcount(&self) -> u64 {
        if self.has_rows() {
            self.rows.len() as u64
        } else {
            self.affected_rows
        }
    }
}

pub(crate) fn column_info(columns: &[ColumnDef]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ))
}

/// Decode a text-protocol row: one length-encoded cell per column, 0xFB
/// for NULL.
pub(crate) fn decode_text_row(
    payload: &[u8],
    columns: &[ColumnDef],
    converters: &Converters,
) -> Result<Vec<Value>, Error> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let cell = reader
            .read_lenenc_field()
            .ok_or_else(|| malformed("text row", payload))?;
        values.push(match cell {
            None => Value::Null,
            Some(bytes) => converters.decode(bytes, column),
        });
    }
    Ok(values)
}

/// Decode a binary-protocol row: 0x00 header, NULL bitmap with a two-bit
/// offset, then the non-NULL cells in column order.
pub(crate) fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnDef],
    converters: &Converters,
) -> Result<Vec<Value>, Error> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(malformed("binary row", payload));
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = reader
        .read_bytes(bitmap_len)
        .ok_or_else(|| malformed("binary row", payload))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(&mut reader, column, converters)?);
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::column_flags;
    use crate::types::tests::column;
    use sqlwire_core::SqlDateTime;

    #[test]
    fn text_row_nulls_and_values() {
        let columns = [
            column("id", FieldType::LongLong, 0, 63),
            column("name", FieldType::VarString, 0, 45),
            column("note", FieldType::VarString, 0, 45),
        ];
        let payload = [&[1u8, b'7'][..], &[3, b'b', b'o', b'b'], &[0xFB]].concat();
        let values = decode_text_row(&payload, &columns, &Converters::default()).unwrap();
        assert_eq!(
            values,
            vec![Value::Int(7), Value::Text("bob".into()), Value::Null]
        );
    }

    #[test]
    fn text_row_truncated_is_protocol_error() {
        let columns = [column("id", FieldType::Long, 0, 63)];
        let err = decode_text_row(&[5, b'1'], &columns, &Converters::default()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn binary_row_bitmap_offset() {
        let columns = [
            column("a", FieldType::Long, 0, 63),
            column("b", FieldType::Long, 0, 63),
            column("c", FieldType::DateTime, 0, 63),
        ];
        // column b is NULL: bit 1 + 2 = 3
        let mut payload = vec![0x00, 0b0000_1000];
        payload.extend_from_slice(&(-5i32).to_le_bytes());
        payload.extend_from_slice(&[4, 0xE8, 0x07, 2, 29]);
        let values = decode_binary_row(&payload, &columns, &Converters::default()).unwrap();
        assert_eq!(values[0], Value::Int(-5));
        assert_eq!(values[1], Value::Null);
        assert_eq!(
            values[2],
            Value::DateTime(SqlDateTime::new(
                sqlwire_core::SqlDate::new(2024, 2, 29),
                0,
                0,
                0,
                0
            ))
        );
    }

    #[test]
    fn binary_row_unknown_date_length_is_fatal() {
        let columns = [column("d", FieldType::DateTime, 0, 63)];
        let payload = [0x00, 0x00, 5, 1, 2, 3, 4, 5];
        let err = decode_binary_row(&payload, &columns, &Converters::default()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn description_reports_decimal_precision() {
        let mut price = column("price", FieldType::NewDecimal, column_flags::NOT_NULL, 63);
        price.column_length = 12;
        price.decimals = 2;
        let rs = ResultSet {
            columns: vec![price],
            ..ResultSet::default()
        };
        let desc = rs.description();
        assert_eq!(desc[0].precision, 10);
        assert_eq!(desc[0].scale, 2);
        assert!(!desc[0].null_ok);
        assert_eq!(rs.rowcount(), 0);
    }
}
