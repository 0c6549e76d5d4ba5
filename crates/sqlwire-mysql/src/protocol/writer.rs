//! Payload builder for client packets.
//!
//! `PacketWriter` only assembles payload bytes; splitting into frames and
//! assigning sequence numbers is the framer's job.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::Command;

/// A writer for MySQL protocol data.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Start a command payload with its command byte.
    pub fn command(command: Command) -> Self {
        let mut writer = Self::new();
        writer.write_u8(command as u8);
        writer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer (1, 3, 4 or 9 bytes on the wire).
    pub fn write_lenenc_int(&mut self, value: u64) {
        match value {
            0..=250 => self.write_u8(value as u8),
            251..=0xFFFF => {
                self.write_u8(0xFC);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.write_u8(0xFD);
                self.write_u24_le(value as u32);
            }
            _ => {
                self.write_u8(0xFE);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_null_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0);
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.write_null_bytes(s.as_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

/// Build a command payload: command byte followed by `body`.
pub fn command_payload(command: Command, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(command as u8);
    payload.extend_from_slice(body);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenenc_int_boundaries() {
        let cases: [(u64, &[u8]); 6] = [
            (0, &[0x00]),
            (250, &[0xFA]),
            (251, &[0xFC, 0xFB, 0x00]),
            (0xFFFF, &[0xFC, 0xFF, 0xFF]),
            (0x1_0000, &[0xFD, 0x00, 0x00, 0x01]),
            (0x0100_0000, &[0xFE, 0, 0, 0, 1, 0, 0, 0, 0]),
        ];
        for (value, expected) in cases {
            let mut w = PacketWriter::new();
            w.write_lenenc_int(value);
            assert_eq!(w.as_bytes(), expected, "value {value}");
        }
    }

    #[test]
    fn strings_and_padding() {
        let mut w = PacketWriter::new();
        w.write_null_string("root");
        w.write_lenenc_string("db");
        w.write_zeros(2);
        w.write_u24_le(0x0A0B0C);
        assert_eq!(
            w.as_bytes(),
            &[b'r', b'o', b'o', b't', 0, 2, b'd', b'b', 0, 0, 0x0C, 0x0B, 0x0A]
        );
    }

    #[test]
    fn command_payload_prefixes_byte() {
        assert_eq!(command_payload(Command::Query, b"SELECT 1")[0], 0x03);
        assert_eq!(PacketWriter::command(Command::Ping).into_bytes(), vec![0x0e]);
    }
}
