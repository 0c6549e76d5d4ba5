//! MySQL client engine for sqlwire.
//!
//! The wire protocol is implemented from scratch on top of asupersync's TCP
//! primitives:
//!
//! - Packet framing with sequence numbers and 16 MiB splitting
//! - Authentication (mysql_native_password, caching_sha2_password,
//!   sha256_password, mysql_clear_password, mysql_old_password) with
//!   auth-switch support and RSA key exchange
//! - Optional in-place TLS upgrade (feature `tls`)
//! - Text and binary (prepared statement) result protocols
//! - Buffered and streaming results, multi-result commands
//! - A session state machine that faults on any fatal error
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{Cursor, MySqlConfig, MySqlSession};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("mydb");
//!
//! let mut session = MySqlSession::connect(&cx, config).await?;
//! let mut cursor = Cursor::new(&mut session);
//! cursor.execute(&cx, "SELECT id FROM users WHERE name = ?", &["bob".into()]).await?;
//! ```

pub mod auth;
pub mod charset;
pub mod config;
pub mod crypto;
pub mod cursor;
mod error;
pub mod escape;
pub mod framer;
pub mod protocol;
pub mod result;
pub mod session;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::AuthPlugin;
pub use charset::{Charset, charset_by_id, charset_by_name};
pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use crypto::RsaPadding;
pub use cursor::{Cursor, SsCursor};
pub use escape::{escape_string, format_value_for_sql, interpolate_params};
pub use framer::Framer;
pub use protocol::Command;
pub use result::{ColumnDescription, ResultSet};
pub use session::{
    MySqlConnector, MySqlSession, PreparedStatement, SessionState, StreamingResult, Warning,
};
pub use types::{ColumnDef, Converters, FieldType};
