//! Cursor over a single packet payload.
//!
//! All reads return `None` on underflow rather than panicking; callers map
//! `None` to a protocol error naming what they were parsing.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A reader for MySQL protocol data.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

/// One column of a text row: `None` is SQL NULL.
pub type LenencField<'a> = Option<&'a [u8]>;

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [a, b, c] = self.read_array()?;
        Some(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        self.read_array().map(i8::from_le_bytes)
    }

    pub fn read_i16_le(&mut self) -> Option<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_i32_le(&mut self) -> Option<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Option<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Option<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64_le(&mut self) -> Option<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: 2, 3 or 8 byte value follows
    /// - 0xFB (NULL) and 0xFF are not integers and yield `None`
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded field that may be NULL (0xFB).
    ///
    /// Outer `None` means the packet is truncated.
    pub fn read_lenenc_field(&mut self) -> Option<LenencField<'a>> {
        if self.peek()? == 0xFB {
            self.pos += 1;
            return Some(None);
        }
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len).map(Some)
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read bytes up to a NUL, consuming the NUL. A missing terminator
    /// takes the rest of the packet.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet (leading 0x00 optional).
    ///
    /// Layout: affected rows and last insert id as lenenc ints, status
    /// flags and warnings as u16, then an optional info string.
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }
        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();
        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet (leading 0xFF optional).
    ///
    /// The `#` + SQLSTATE marker is optional; pre-4.1 style errors get "HY000".
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }
        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            "HY000".to_string()
        };
        let error_message = self.read_rest_string();
        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet (leading 0xFE optional). A bare 0xFE from a
    /// pre-4.1 server yields zeroed fields.
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }
        if self.is_empty() {
            return Some(EofPacket::default());
        }
        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;
        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_integers() {
        let mut reader = PacketReader::new(&[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0xFF]);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_i8(), Some(-1));
        assert_eq!(reader.read_u8(), None);
        assert_eq!(reader.read_u32_le(), None);
    }

    #[test]
    fn lenenc_int_widths() {
        let mut reader = PacketReader::new(&[0xFA]);
        assert_eq!(reader.read_lenenc_int(), Some(0xFA));

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x1234));

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0012_3456));

        let mut reader = PacketReader::new(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0807_0605_0403_0201));

        let mut reader = PacketReader::new(&[0xFC, 0x34]);
        assert_eq!(reader.read_lenenc_int(), None);
    }

    #[test]
    fn lenenc_field_distinguishes_null_from_empty() {
        let mut reader = PacketReader::new(&[0xFB, 0x00, 0x02, b'h', b'i', 0x05, b'x']);
        assert_eq!(reader.read_lenenc_field(), Some(None));
        assert_eq!(reader.read_lenenc_field(), Some(Some(&b""[..])));
        assert_eq!(reader.read_lenenc_field(), Some(Some(&b"hi"[..])));
        // declared 5 bytes, only 1 present
        assert_eq!(reader.read_lenenc_field(), None);
    }

    #[test]
    fn null_terminated_and_unterminated() {
        let mut reader = PacketReader::new(b"hello\0world");
        assert_eq!(reader.read_null_string(), "hello");
        assert_eq!(reader.read_null_bytes(), b"world");
        assert!(reader.is_empty());
    }

    #[test]
    fn ok_packet_with_info() {
        let mut data = vec![0x00, 0x01, 0x2A, 0x03, 0x00, 0x01, 0x00];
        data.extend_from_slice(b"Rows matched: 1");
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 3);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.info, "Rows matched: 1");
    }

    #[test]
    fn err_packet_with_and_without_sqlstate() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");

        let legacy = PacketReader::new(&[0xFF, 0x10, 0x04, b'T', b'o', b'o'])
            .parse_err_packet()
            .unwrap();
        assert_eq!(legacy.error_code, 1040);
        assert_eq!(legacy.sql_state, "HY000");
        assert_eq!(legacy.error_message, "Too");
    }

    #[test]
    fn eof_packet_variants() {
        let eof = PacketReader::new(&[0xFE, 0x01, 0x00, 0x08, 0x00])
            .parse_eof_packet()
            .unwrap();
        assert_eq!(eof.warnings, 1);
        assert!(eof.more_results());

        let bare = PacketReader::new(&[0xFE]).parse_eof_packet().unwrap();
        assert_eq!(bare, EofPacket::default());
    }
}
