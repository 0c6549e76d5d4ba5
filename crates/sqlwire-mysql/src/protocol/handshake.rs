//! Connection-phase packets: server greeting, client response, TLS request
//! and auth-switch requests.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::Error;

use crate::error::protocol_error;
use crate::protocol::capabilities::{
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_SECURE_CONNECTION, CLIENT_SSL,
};
use crate::protocol::{PacketReader, PacketWriter};

/// The initial greeting sent by the server (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    /// Scramble nonce (salt part 1 + part 2, normally 20 bytes)
    pub nonce: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Empty when the server does not advertise `CLIENT_PLUGIN_AUTH`.
    pub auth_plugin: String,
}

impl ServerHandshake {
    /// Parse the greeting payload.
    ///
    /// Servers that send an ERR packet instead of a greeting (e.g. "Host is
    /// blocked") are reported by the caller before this runs.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = PacketReader::new(payload);
        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| protocol_error("Empty server greeting"))?;
        if protocol_version != 10 {
            return Err(protocol_error(format!(
                "Unsupported protocol version: {protocol_version}"
            )));
        }
        let server_version = reader.read_null_string();
        let thread_id = reader
            .read_u32_le()
            .ok_or_else(|| protocol_error("Truncated server greeting (thread id)"))?;
        let salt1 = reader
            .read_bytes(8)
            .ok_or_else(|| protocol_error("Truncated server greeting (nonce)"))?;
        let mut nonce = salt1.to_vec();
        reader.skip(1);
        let cap_low = reader
            .read_u16_le()
            .ok_or_else(|| protocol_error("Truncated server greeting (capabilities)"))?;
        let mut capabilities = u32::from(cap_low);

        let mut charset = 0;
        let mut status_flags = 0;
        let mut salt2_len = 12;
        if reader.remaining() >= 6 {
            charset = reader.read_u8().unwrap_or_default();
            status_flags = reader.read_u16_le().unwrap_or_default();
            capabilities |= u32::from(reader.read_u16_le().unwrap_or_default()) << 16;
            let declared = usize::from(reader.read_u8().unwrap_or_default());
            // declared length covers both parts plus the trailing NUL
            salt2_len = declared.saturating_sub(9).max(12);
        }
        reader.skip(10);
        if reader.remaining() >= salt2_len {
            if let Some(salt2) = reader.read_bytes(salt2_len) {
                nonce.extend_from_slice(salt2);
            }
        }
        reader.skip(1);

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty() {
            reader.read_null_string()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            thread_id,
            nonce,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }

    pub fn supports(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }
}

/// The client's reply to the greeting.
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    /// Encode per the negotiated capability bits.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(128);
        write_fixed_prefix(&mut w, self.capabilities, self.max_packet_size, self.charset);
        w.write_null_string(self.user);

        if self.capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(self.auth_response);
        } else if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = self.auth_response.len().min(255);
            w.write_u8(len as u8);
            w.write_bytes(&self.auth_response[..len]);
        } else {
            w.write_null_bytes(self.auth_response);
        }

        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_string(self.database.unwrap_or(""));
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(self.auth_plugin);
        }
        if self.capabilities & CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            w.write_lenenc_bytes(attrs.as_bytes());
        }
        w.into_bytes()
    }
}

fn write_fixed_prefix(w: &mut PacketWriter, capabilities: u32, max_packet: u32, charset: u8) {
    w.write_u32_le(capabilities);
    w.write_u32_le(max_packet);
    w.write_u8(charset);
    w.write_zeros(23);
}

/// The 32-byte SSL request sent before the TLS upgrade.
pub fn build_ssl_request(capabilities: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(32);
    write_fixed_prefix(&mut w, capabilities | CLIENT_SSL, max_packet_size, charset);
    w.into_bytes()
}

/// An auth-switch request (0xFE during authentication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitch {
    /// `None` for the bare pre-4.1 "use old password" request.
    pub plugin: Option<String>,
    pub nonce: Vec<u8>,
}

/// Parse an auth-switch payload including its 0xFE marker.
pub fn parse_auth_switch(payload: &[u8]) -> AuthSwitch {
    let mut reader = PacketReader::new(payload);
    reader.skip(1);
    if reader.is_empty() {
        return AuthSwitch {
            plugin: None,
            nonce: Vec::new(),
        };
    }
    let plugin = reader.read_null_string();
    let mut nonce = reader.read_rest().to_vec();
    if nonce.len() > 20 && nonce.last() == Some(&0) {
        nonce.pop();
    }
    AuthSwitch {
        plugin: Some(plugin),
        nonce,
    }
}
