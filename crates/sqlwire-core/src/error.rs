//! Error types for sqlwire operations.
//!
//! Errors fall into a handful of families that callers treat differently:
//!
//! - [`ProtocolError`]: the byte stream no longer matches the wire format. Fatal for the session.
//! - [`ConnectionError`]: the transport was lost, refused, or authentication failed. Carries the
//!   vendor client error code (2003, 2006, 2013, 2059, ...) where one applies.
//! - [`QueryError`]: the server rejected a statement. The session remains usable.
//! - [`PoolError`]: misuse of the pool (closed, foreign connection, bad sizing). Raised immediately.

use std::fmt;

/// Client error code: can't connect to server.
pub const CR_CONN_HOST_ERROR: u16 = 2003;
/// Client error code: server has gone away.
pub const CR_SERVER_GONE_ERROR: u16 = 2006;
/// Client error code: lost connection to server during query.
pub const CR_SERVER_LOST: u16 = 2013;
/// Client error code: authentication plugin cannot be loaded.
pub const CR_AUTH_PLUGIN_CANNOT_LOAD: u16 = 2059;
/// Client error code: server public key could not be obtained.
pub const CR_AUTH_PLUGIN_ERR: u16 = 2061;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, lost connection, authentication)
    Connection(ConnectionError),
    /// Server-reported statement errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    /// Vendor client error code, when one applies.
    pub code: Option<u16>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Peer closed the connection at a frame boundary
    Disconnected,
    /// Peer closed the connection in the middle of a frame
    ShortRead,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Connection refused
    Refused,
    /// Session was already faulted by an earlier failure or cancellation
    Faulted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Vendor server error code (e.g. 1062).
    pub code: Option<u16>,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Lock wait or statement timeout
    Timeout,
    /// Statement was killed
    Cancelled,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a vendor server error code.
    pub fn from_code(code: u16) -> Self {
        match code {
            1062 | 1451 | 1452 | 1048 | 3819 => QueryErrorKind::Constraint,
            1213 => QueryErrorKind::Deadlock,
            1205 | 3024 => QueryErrorKind::Timeout,
            1146 | 1054 | 1049 => QueryErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 => QueryErrorKind::Permission,
            1064 | 1149 => QueryErrorKind::Syntax,
            1406 | 1264 => QueryErrorKind::DataTruncation,
            1317 => QueryErrorKind::Cancelled,
            _ => QueryErrorKind::Database,
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool is closing or closed
    Closed,
    /// Caller misused the pool (foreign connection, wait_closed before close)
    Misuse,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable error (deadlock, lock timeout, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this an error that leaves the session unusable?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for integrity violations)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the vendor error code, server or client side.
    pub fn vendor_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => q.code,
            Error::Connection(c) => c.code,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.code == Some(1062)
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, Some(1451 | 1452))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => match e.code {
                Some(code) => write!(f, "Connection error ({}): {}", code, e.message),
                None => write!(f, "Connection error: {}", e.message),
            },
            Error::Query(e) => match (&e.code, &e.sqlstate) {
                (Some(code), Some(state)) => {
                    write!(f, "Query error {} ({}): {}", code, state, e.message)
                }
                (Some(code), None) => write!(f, "Query error {}: {}", code, e.message),
                _ => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let boxed = match self {
            Error::Connection(e) => e.source.as_deref(),
            Error::Query(e) => e.source.as_deref(),
            Error::Protocol(e) => e.source.as_deref(),
            Error::Pool(e) => e.source.as_deref(),
            Error::Config(e) => e.source.as_deref(),
            Error::Io(e) => return Some(e),
            _ => None,
        };
        boxed.map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: u16, state: &str) -> QueryError {
        QueryError {
            kind: QueryErrorKind::from_code(code),
            code: Some(code),
            sql: Some("INSERT INTO t VALUES (1)".to_string()),
            sqlstate: Some(state.to_string()),
            message: "boom".to_string(),
            source: None,
        }
    }

    #[test]
    fn vendor_code_classification() {
        assert!(server_error(1062, "23000").is_unique_violation());
        assert!(server_error(1452, "23000").is_foreign_key_violation());
        assert_eq!(QueryErrorKind::from_code(1213), QueryErrorKind::Deadlock);
        assert_eq!(QueryErrorKind::from_code(1064), QueryErrorKind::Syntax);
        assert_eq!(QueryErrorKind::from_code(9999), QueryErrorKind::Database);

        let err = Error::Query(server_error(1062, "23000"));
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.vendor_code(), Some(1062));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert_eq!(err.to_string(), "Query error 1062 (23000): boom");
        assert!(!err.is_connection_error());
    }

    #[test]
    fn retryable_and_connection_flags() {
        assert!(Error::Query(server_error(1213, "40001")).is_retryable());
        assert!(Error::Timeout.is_retryable());

        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::ShortRead,
            code: Some(CR_SERVER_LOST),
            message: "Lost connection to MySQL server during query".to_string(),
            source: None,
        });
        assert!(lost.is_connection_error());
        assert!(!lost.is_retryable());
        assert_eq!(lost.vendor_code(), Some(2013));
        assert!(lost.to_string().starts_with("Connection error (2013)"));
    }

    #[test]
    fn io_source_is_exposed() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::other("reset"));
        assert!(err.source().is_some());
        assert!(err.is_connection_error());
    }
}
