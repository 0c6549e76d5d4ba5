//! MySQL wire protocol definitions.
//!
//! Every frame carries a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! A payload of 2^24 - 1 bytes or more is split over several frames; see
//! [`crate::framer`] for the transport side.

pub mod handshake;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use handshake::{HandshakeResponse, ServerHandshake, build_ssl_request, parse_auth_switch};
pub use prepared::{
    StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    build_stmt_reset_packet, parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default client capabilities.
    ///
    /// `CLIENT_DEPRECATE_EOF` is deliberately absent: result sets are
    /// read with explicit EOF terminators.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_ATTRS;
}

/// MySQL command codes (COM_xxx) issued by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Kill a server thread
    ProcessKill = 0x0c,
    /// Ping server
    Ping = 0x0e,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
}

impl Command {
    /// Commands for which the server never replies.
    pub const fn expects_reply(self) -> bool {
        !matches!(self, Command::Quit | Command::StmtClose)
    }
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// A frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet kinds, detected from the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with a short payload)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Anything else (column count, row, column definition)
    Data,
}

impl PacketType {
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            // A row can also start with 0xFE (8-byte lenenc), so EOF needs a short payload
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Classify a whole payload. Empty payloads are data.
    pub fn of(payload: &[u8]) -> Self {
        match payload.first() {
            Some(&b) => Self::from_first_byte(b, payload.len()),
            None => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Human-readable info string (e.g. "Rows matched: 1  Changed: 1")
    pub info: String,
}

impl OkPacket {
    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQL state (5 characters; "HY000" when the server omits it)
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.error_code == 1451 || self.error_code == 1452
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_little_endian_length() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        assert_eq!(header.to_bytes(), [0x56, 0x34, 0x12, 7]);
        assert_eq!(PacketHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(
            PacketType::from_first_byte(0xFB, 10),
            PacketType::LocalInfile
        );
        assert_eq!(PacketType::of(&[]), PacketType::Data);
    }

    #[test]
    fn quit_and_stmt_close_have_no_reply() {
        assert!(!Command::Quit.expects_reply());
        assert!(!Command::StmtClose.expects_reply());
        assert!(Command::Ping.expects_reply());
    }
}
