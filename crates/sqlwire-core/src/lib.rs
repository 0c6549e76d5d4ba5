//! Core types and traits for sqlwire.
//!
//! This crate provides the driver-independent pieces shared by the MySQL
//! engine and the pool:
//!
//! - [`Error`] taxonomy with vendor codes
//! - [`Value`], [`Row`] and [`FromValue`] for result decoding
//! - [`Connector`] / [`Poolable`] / [`CloseHandle`] for pooling
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod row;
pub mod value;

pub use connection::{CloseHandle, Connector, Poolable};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind,
    ProtocolError, QueryError, QueryErrorKind, Result, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::{SqlDate, SqlDateTime, SqlTime, Value};
