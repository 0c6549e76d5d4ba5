//! Constructors for the error values this driver produces.

use asupersync::{Cx, Outcome};
use sqlwire_core::error::{
    CR_AUTH_PLUGIN_CANNOT_LOAD, CR_AUTH_PLUGIN_ERR, CR_CONN_HOST_ERROR, CR_SERVER_GONE_ERROR,
    CR_SERVER_LOST, ConfigError, ConnectionError, ConnectionErrorKind, ProtocolError, QueryError,
    QueryErrorKind,
};
use sqlwire_core::Error;

use crate::protocol::ErrPacket;

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

/// A malformed packet; keeps the offending bytes for diagnostics.
pub(crate) fn malformed(what: &str, raw: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("Malformed {what} packet"),
        raw_data: Some(raw.to_vec()),
        source: None,
    })
}

pub(crate) fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        code: None,
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn plugin_not_configured(plugin: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        code: Some(CR_AUTH_PLUGIN_CANNOT_LOAD),
        message: format!("Authentication plugin '{plugin}' not configured"),
        source: None,
    })
}

/// The RSA path could not use the server's key or the password.
pub(crate) fn rsa_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        code: Some(CR_AUTH_PLUGIN_ERR),
        message: msg.into(),
        source: None,
    })
}

/// Server rejected the credentials during the handshake.
pub(crate) fn auth_rejected(err: &ErrPacket) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        code: Some(err.error_code),
        message: format!(
            "Authentication failed: {} ({})",
            err.error_message, err.error_code
        ),
        source: None,
    })
}

/// The server sent ERR instead of a greeting (host blocked, too many
/// connections).
pub(crate) fn greeting_refused(err: &ErrPacket) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Refused,
        code: Some(err.error_code),
        message: format!("Connection refused by server: {}", err.error_message),
        source: None,
    })
}

/// Operation attempted on a closed session.
pub(crate) fn server_gone(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        code: Some(CR_SERVER_GONE_ERROR),
        message: msg.into(),
        source: None,
    })
}

/// Operation attempted on a faulted session.
pub(crate) fn session_faulted(reason: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Faulted,
        code: Some(CR_SERVER_GONE_ERROR),
        message: format!("Session is unusable: {reason}"),
        source: None,
    })
}

pub(crate) fn connect_error(msg: impl Into<String>, source: Option<std::io::Error>) -> Error {
    let refused = source
        .as_ref()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::ConnectionRefused);
    Error::Connection(ConnectionError {
        kind: if refused {
            ConnectionErrorKind::Refused
        } else {
            ConnectionErrorKind::Connect
        },
        code: Some(CR_CONN_HOST_ERROR),
        message: msg.into(),
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}

/// Transport failure while a command was in flight.
pub(crate) fn connection_lost(kind: ConnectionErrorKind, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        code: Some(CR_SERVER_LOST),
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn io_lost(context: &str, err: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        code: Some(CR_SERVER_LOST),
        message: format!("Lost connection to MySQL server ({context}): {err}"),
        source: Some(Box::new(err)),
    })
}

pub(crate) fn ssl_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        code: None,
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn query_error(err: &ErrPacket, sql: Option<&str>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::from_code(err.error_code),
        code: Some(err.error_code),
        sql: sql.map(str::to_string),
        sqlstate: Some(err.sql_state.clone()),
        message: err.error_message.clone(),
        source: None,
    })
}

pub(crate) fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: msg.into(),
        source: None,
    })
}

/// Turn a driver result into an `Outcome`, reporting cancellation as such
/// when the context asked for it.
pub(crate) fn into_outcome<T>(cx: &Cx, result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(Error::Cancelled) => cancelled(cx),
        Err(e) => Outcome::Err(e),
    }
}

pub(crate) fn cancelled<T>(cx: &Cx) -> Outcome<T, Error> {
    match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => Outcome::Err(Error::Cancelled),
    }
}
