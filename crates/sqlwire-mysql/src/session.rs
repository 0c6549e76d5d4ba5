//! The protocol session: one authenticated connection and its command loop.
//!
//! A session moves through
//! `Disconnected -> Handshaking -> Authenticated -> Idle <-> Command` and ends
//! in `Closed` or `Faulted`. Any fatal error (protocol violation, lost
//! transport, cancellation) drops the transport and faults the session with
//! the reason recorded; server SQL errors leave it usable.
//!
//! Every command resets the frame sequence exactly once. A command future
//! dropped mid-flight leaves an in-flight marker behind; the next operation
//! sees it and faults instead of reading a half-consumed reply.

#![allow(clippy::cast_possible_truncation)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use asupersync::net::TcpStream;
use asupersync::{Cx, Outcome};
use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{CloseHandle, ColumnInfo, Connector, Error, Poolable, Row, Value};

use crate::auth::{AuthContext, AuthNegotiator, AuthOrigin, AuthPlugin, AuthStep};
use crate::charset::{Charset, charset_by_name};
use crate::config::MySqlConfig;
use crate::error::{
    auth_rejected, config_error, connect_error, connection_lost, greeting_refused, into_outcome,
    malformed, protocol_error, query_error, server_gone, session_faulted,
};
use crate::escape::escape_string;
use crate::framer::Framer;
use crate::protocol::capabilities::{CLIENT_PROTOCOL_41, CLIENT_SSL};
use crate::protocol::server_status::{
    SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS, SERVER_STATUS_NO_BACKSLASH_ESCAPES,
};
use crate::protocol::writer::command_payload;
use crate::protocol::{
    Command, EofPacket, HandshakeResponse, OkPacket, PacketReader, PacketType, ServerHandshake,
    build_ssl_request, build_stmt_close_packet, build_stmt_execute_packet,
    build_stmt_prepare_packet, build_stmt_reset_packet, parse_auth_switch, parse_stmt_prepare_ok,
};
use crate::result::{ColumnDescription, ResultSet, column_info, decode_binary_row, decode_text_row};
use crate::tls::{upgrade, validate_ssl_mode, validate_tls_config};
use crate::transport::{Stream, Transport};
use crate::types::ColumnDef;

/// LOCAL INFILE data is streamed in frames of this size.
const LOCAL_INFILE_CHUNK: usize = 64 * 1024;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Authenticated,
    Idle,
    /// A command is outstanding or an unbuffered result is being read.
    Command,
    Closed,
    Faulted,
}

/// A server-side prepared statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: u32,
    sql: String,
    params: Vec<ColumnDef>,
    columns: Vec<ColumnDef>,
}

impl PreparedStatement {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ColumnDef] {
        &self.params
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }
}

/// One row of `SHOW WARNINGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: String,
    pub code: u16,
    pub message: String,
}

/// What the first reply packet of a command turned into.
enum ResultHead {
    Summary(ResultSet),
    Columns(Vec<ColumnDef>),
}

/// A MySQL protocol session.
pub struct MySqlSession {
    config: MySqlConfig,
    framer: Option<Framer<Stream>>,
    close: CloseHandle,
    state: SessionState,
    fault_reason: Option<String>,
    thread_id: u32,
    server_version: String,
    server_capabilities: u32,
    client_capabilities: u32,
    status_flags: u16,
    affected_rows: u64,
    insert_id: u64,
    warning_count: u16,
    info: String,
    charset: &'static Charset,
    /// Server RSA key, configured or fetched during authentication.
    server_key: Option<Vec<u8>>,
    secure: bool,
    /// A reply is owed by the server but nobody is reading it.
    in_flight: bool,
    /// Rows of a streaming result remain on the wire.
    unbuffered_active: bool,
    /// The last terminator announced another result.
    more_results: bool,
}

impl std::fmt::Debug for MySqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSession")
            .field("state", &self.state)
            .field("thread_id", &self.thread_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("stream", &self.framer.as_ref().map(Framer::transport))
            .finish_non_exhaustive()
    }
}

impl MySqlSession {
    fn new(config: MySqlConfig, close: CloseHandle) -> Self {
        Self {
            server_key: config.server_public_key.clone(),
            charset: config.charset,
            config,
            framer: None,
            close,
            state: SessionState::Disconnected,
            fault_reason: None,
            thread_id: 0,
            server_version: String::new(),
            server_capabilities: 0,
            client_capabilities: 0,
            status_flags: 0,
            affected_rows: 0,
            insert_id: 0,
            warning_count: 0,
            info: String::new(),
            secure: false,
            in_flight: false,
            unbuffered_active: false,
            more_results: false,
        }
    }

    /// Open a transport, authenticate and run the post-connect setup.
    #[tracing::instrument(
        level = "debug",
        skip(cx, config),
        fields(host = %config.host, port = config.port, user = %config.user)
    )]
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        let mut session = Self::new(config, CloseHandle::new());
        let result = session.open(cx).await;
        into_outcome(cx, result.map(|()| session))
    }

    async fn open(&mut self, cx: &Cx) -> Result<(), Error> {
        validate_tls_config(self.config.ssl_mode, &self.config.tls)?;
        if cx.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        let stream = open_stream(&self.config).await?;
        self.establish(cx, stream).await
    }

    async fn establish(&mut self, cx: &Cx, stream: Stream) -> Result<(), Error> {
        self.handshake(cx, stream).await?;
        self.post_connect(cx).await?;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Greeting, optional TLS upgrade, handshake response and the auth
    /// exchange up to the server's final OK.
    async fn handshake(&mut self, cx: &Cx, stream: Stream) -> Result<(), Error> {
        self.state = SessionState::Handshaking;
        let max_payload = self.config.max_packet_size as usize;
        let mut framer =
            Framer::with_close_handle(stream, self.close.clone()).with_max_payload(max_payload);

        let greeting = framer.read_frame(cx).await?;
        if greeting.first() == Some(&0xFF) {
            let err = PacketReader::new(&greeting)
                .parse_err_packet()
                .ok_or_else(|| malformed("error", &greeting))?;
            return Err(greeting_refused(&err));
        }
        let server = ServerHandshake::parse(&greeting)?;
        tracing::debug!(
            thread_id = server.thread_id,
            server_version = %server.server_version,
            plugin = %server.auth_plugin,
            capabilities = server.capabilities,
            "server greeting"
        );
        if !server.supports(CLIENT_PROTOCOL_41) {
            return Err(protocol_error(format!(
                "Server {} does not speak protocol 4.1",
                server.server_version
            )));
        }
        self.thread_id = server.thread_id;
        self.server_version.clone_from(&server.server_version);
        self.server_capabilities = server.capabilities;
        self.status_flags = server.status_flags;

        let mut caps = self.config.capability_flags() & server.capabilities;
        let use_tls = self.config.unix_socket.is_none()
            && validate_ssl_mode(self.config.ssl_mode, server.capabilities)?
            && (cfg!(feature = "tls") || self.config.ssl_mode.is_required());
        if !use_tls {
            caps &= !CLIENT_SSL;
        }
        self.client_capabilities = caps;
        let charset_id = self.charset.handshake_id();

        if use_tls {
            let request = build_ssl_request(caps, self.config.max_packet_size, charset_id);
            framer.write_frame(cx, &request).await?;
            let (stream, sequence, close) = framer.into_parts();
            let stream = upgrade(
                cx,
                &close,
                stream,
                &self.config.tls,
                &self.config.host,
                self.config.ssl_mode,
            )
            .await?;
            framer = Framer::from_parts(stream, sequence, close).with_max_payload(max_payload);
            tracing::debug!(thread_id = self.thread_id, "connection upgraded to TLS");
        }
        self.secure = framer.transport().is_secure();

        let plugin = AuthPlugin::for_handshake(self.config.auth_plugin, &server.auth_plugin);
        tracing::debug!(plugin = %plugin, secure = self.secure, "auth plugin selected");
        let password = self.config.password.clone().unwrap_or_default();
        let mut ctx = AuthContext {
            password: &password,
            secure: self.secure,
            server_key: &mut self.server_key,
            padding: self.config.rsa_padding,
        };
        let (mut negotiator, auth_response) =
            AuthNegotiator::start(plugin, &server.nonce, AuthOrigin::Handshake, &mut ctx)?;
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: self.config.max_packet_size,
            charset: charset_id,
            user: &self.config.user,
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &self.config.attributes,
        };
        framer.write_frame(cx, &response.encode()).await?;

        loop {
            let packet = framer.read_frame(cx).await?;
            match packet.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet()
                        .ok_or_else(|| malformed("OK", &packet))?;
                    self.status_flags = ok.status_flags;
                    break;
                }
                Some(0xFF) => {
                    let err = PacketReader::new(&packet)
                        .parse_err_packet()
                        .ok_or_else(|| malformed("error", &packet))?;
                    return Err(auth_rejected(&err));
                }
                Some(0xFE) => {
                    let switch = parse_auth_switch(&packet);
                    let (plugin, nonce) = match switch.plugin {
                        None => (AuthPlugin::Old, server.nonce.clone()),
                        Some(name) => (AuthPlugin::for_switch(&name)?, switch.nonce),
                    };
                    tracing::debug!(
                        from = %negotiator.plugin(),
                        to = %plugin,
                        "auth switch requested"
                    );
                    let (next, reply) =
                        AuthNegotiator::start(plugin, &nonce, AuthOrigin::Switch, &mut ctx)?;
                    negotiator = next;
                    framer.write_frame(cx, &reply).await?;
                }
                Some(0x01) => match negotiator.step(&packet[1..], &mut ctx)? {
                    AuthStep::Emit(bytes) => framer.write_frame(cx, &bytes).await?,
                    AuthStep::Done => {}
                },
                _ => return Err(malformed("authentication", &packet)),
            }
        }

        self.framer = Some(framer);
        self.state = SessionState::Authenticated;
        tracing::debug!(thread_id = self.thread_id, "authenticated");
        Ok(())
    }

    async fn post_connect(&mut self, cx: &Cx) -> Result<(), Error> {
        if u8::try_from(self.charset.id).is_err() {
            let sql = format!(
                "SET NAMES {} COLLATE {}",
                self.charset.name, self.charset.collation
            );
            self.run_text(cx, &sql).await?;
        }
        if let Some(mode) = self.config.sql_mode.clone() {
            let sql = format!(
                "SET sql_mode = {}",
                escape_string(&mode, self.no_backslash_escapes())
            );
            self.run_text(cx, &sql).await?;
        }
        if let Some(init) = self.config.init_command.clone() {
            self.run_text(cx, &init).await?;
            while self.more_results {
                self.read_result(cx, Some(&init), false).await?;
            }
        }
        if let Some(enabled) = self.config.autocommit {
            self.run_text(cx, autocommit_sql(enabled)).await?;
        }
        Ok(())
    }

    // === State ===

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Server connection id.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// Capabilities negotiated for this session.
    pub fn client_capabilities(&self) -> u32 {
        self.client_capabilities
    }

    /// AUTO_INCREMENT id produced by the last statement.
    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & SERVER_STATUS_IN_TRANS != 0
    }

    pub fn autocommit(&self) -> bool {
        self.status_flags & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            SessionState::Disconnected | SessionState::Closed | SessionState::Faulted
        ) || self.close.is_aborted()
    }

    /// Why the session faulted, if it did.
    pub fn fault_reason(&self) -> Option<&str> {
        self.fault_reason.as_deref()
    }

    pub fn charset(&self) -> &'static Charset {
        self.charset
    }

    /// TLS or local socket.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Another result of the last command is waiting to be read.
    pub fn has_more_results(&self) -> bool {
        self.more_results
    }

    /// Quote a literal for this session's escaping mode.
    pub fn escape(&self, value: &Value) -> String {
        crate::escape::format_value_for_sql(value, self.no_backslash_escapes())
    }

    // === Commands ===

    /// Run a text query and buffer its first result.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(thread_id = self.thread_id))]
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<ResultSet, Error> {
        let result = self.run_text(cx, sql).await;
        self.conclude(cx, result)
    }

    /// Run a text query and stream its rows.
    ///
    /// Rows left unread when the returned value is dropped are drained,
    /// with a warning, before the next command.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(thread_id = self.thread_id))]
    pub async fn query_streaming(
        &mut self,
        cx: &Cx,
        sql: &str,
    ) -> Outcome<StreamingResult<'_>, Error> {
        let result = self.start_streaming(cx, sql).await;
        match self.conclude(cx, result) {
            Outcome::Ok(head) => Outcome::Ok(StreamingResult::new(self, head)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn start_streaming(&mut self, cx: &Cx, sql: &str) -> Result<ResultHead, Error> {
        self.send(cx, Command::Query, &command_payload(Command::Query, sql.as_bytes()))
            .await?;
        let head = self.read_head(cx, Some(sql)).await?;
        if matches!(head, ResultHead::Columns(_)) {
            self.unbuffered_active = true;
            self.in_flight = false;
        }
        Ok(head)
    }

    /// Read the next result of a multi-result command. `None` once the
    /// server has no more.
    pub async fn next_result(&mut self, cx: &Cx) -> Outcome<Option<ResultSet>, Error> {
        let result = self.next_result_inner(cx).await;
        self.conclude(cx, result)
    }

    async fn next_result_inner(&mut self, cx: &Cx) -> Result<Option<ResultSet>, Error> {
        self.ensure_usable()?;
        if self.unbuffered_active {
            self.drain_rows(cx).await?;
        }
        if !self.more_results {
            return Ok(None);
        }
        self.state = SessionState::Command;
        self.in_flight = true;
        self.read_result(cx, None, false).await.map(Some)
    }

    /// Like [`next_result`](Self::next_result) but leaves the rows on the
    /// wire.
    pub(crate) async fn next_result_streaming(
        &mut self,
        cx: &Cx,
    ) -> Outcome<Option<RowStream>, Error> {
        let result = self.next_stream_inner(cx).await;
        self.conclude(cx, result)
    }

    async fn next_stream_inner(&mut self, cx: &Cx) -> Result<Option<RowStream>, Error> {
        self.ensure_usable()?;
        if self.unbuffered_active {
            self.drain_rows(cx).await?;
        }
        if !self.more_results {
            return Ok(None);
        }
        self.state = SessionState::Command;
        self.in_flight = true;
        let head = self.read_head(cx, None).await?;
        if matches!(head, ResultHead::Columns(_)) {
            self.unbuffered_active = true;
            self.in_flight = false;
        }
        Ok(Some(RowStream::new(head)))
    }

    /// Send a raw command. The reply, if the command has one, must be read
    /// with [`read_result`](Self::read_result) before anything else.
    pub async fn execute_command(
        &mut self,
        cx: &Cx,
        command: Command,
        body: &[u8],
    ) -> Outcome<(), Error> {
        let result = self.send(cx, command, &command_payload(command, body)).await;
        self.conclude(cx, result)
    }

    /// Read the reply to a command sent with
    /// [`execute_command`](Self::execute_command).
    pub async fn read_command_result(&mut self, cx: &Cx) -> Outcome<ResultSet, Error> {
        let result = if self.in_flight {
            self.read_result(cx, None, false).await
        } else {
            Err(config_error("No command reply is pending"))
        };
        self.conclude(cx, result)
    }

    #[tracing::instrument(level = "debug", skip(self, cx), fields(thread_id = self.thread_id))]
    pub async fn prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        let result = self.prepare_inner(cx, sql).await;
        self.conclude(cx, result)
    }

    async fn prepare_inner(&mut self, cx: &Cx, sql: &str) -> Result<PreparedStatement, Error> {
        self.send(cx, Command::StmtPrepare, &build_stmt_prepare_packet(sql))
            .await?;
        let first = self.framer_mut()?.read_frame(cx).await?;
        if PacketType::of(&first) == PacketType::Error {
            return Err(self.server_error(&first, Some(sql)));
        }
        let ok = parse_stmt_prepare_ok(&first).ok_or_else(|| malformed("prepare OK", &first))?;
        let params = self
            .read_column_block(cx, usize::from(ok.num_params))
            .await?;
        let columns = self
            .read_column_block(cx, usize::from(ok.num_columns))
            .await?;
        self.warning_count = ok.warnings;
        self.end_command();
        tracing::debug!(
            statement_id = ok.statement_id,
            params = params.len(),
            columns = columns.len(),
            "statement prepared"
        );
        Ok(PreparedStatement {
            id: ok.statement_id,
            sql: sql.to_string(),
            params,
            columns,
        })
    }

    /// Execute a prepared statement with the binary protocol.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, stmt, params),
        fields(thread_id = self.thread_id, statement_id = stmt.id)
    )]
    pub async fn execute(
        &mut self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<ResultSet, Error> {
        let result = self.execute_inner(cx, stmt, params).await;
        self.conclude(cx, result)
    }

    async fn execute_inner(
        &mut self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet, Error> {
        if params.len() != stmt.param_count() {
            return Err(config_error(format!(
                "Statement expects {} parameters, {} given",
                stmt.param_count(),
                params.len()
            )));
        }
        let payload = build_stmt_execute_packet(stmt.id, params);
        self.send(cx, Command::StmtExecute, &payload).await?;
        self.read_result(cx, Some(&stmt.sql), true).await
    }

    /// Deallocate a prepared statement. The server sends no reply.
    pub async fn close_statement(&mut self, cx: &Cx, stmt: &PreparedStatement) -> Outcome<(), Error> {
        let result = self
            .send(cx, Command::StmtClose, &build_stmt_close_packet(stmt.id))
            .await;
        self.conclude(cx, result)
    }

    pub async fn reset_statement(&mut self, cx: &Cx, stmt: &PreparedStatement) -> Outcome<(), Error> {
        let result = self
            .simple_command(cx, Command::StmtReset, &build_stmt_reset_packet(stmt.id))
            .await;
        self.conclude(cx, result)
    }

    /// Check the server is reachable.
    ///
    /// With `reconnect`, a session whose transport is gone opens a fresh
    /// connection with the same configuration, once, and pings again.
    pub async fn ping(&mut self, cx: &Cx, reconnect: bool) -> Outcome<(), Error> {
        let result = match self.ping_inner(cx).await {
            Err(e) if reconnect && (e.is_connection_error() || matches!(e, Error::Protocol(_))) => {
                tracing::debug!(thread_id = self.thread_id, error = %e, "ping failed, reconnecting");
                self.close_now();
                match self.reconnect(cx).await {
                    Ok(()) => self.ping_inner(cx).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        };
        self.conclude(cx, result)
    }

    async fn ping_inner(&mut self, cx: &Cx) -> Result<(), Error> {
        self.simple_command(cx, Command::Ping, &[Command::Ping as u8])
            .await
    }

    async fn reconnect(&mut self, cx: &Cx) -> Result<(), Error> {
        let mut fresh = Self::new(self.config.clone(), self.close.clone());
        if fresh.server_key.is_none() {
            fresh.server_key.clone_from(&self.server_key);
        }
        fresh.open(cx).await?;
        *self = fresh;
        tracing::debug!(thread_id = self.thread_id, "reconnected");
        Ok(())
    }

    pub async fn select_db(&mut self, cx: &Cx, database: &str) -> Outcome<(), Error> {
        let payload = command_payload(Command::InitDb, database.as_bytes());
        let result = self.simple_command(cx, Command::InitDb, &payload).await;
        if result.is_ok() {
            self.config.database = Some(database.to_string());
        }
        self.conclude(cx, result)
    }

    /// Ask the server to kill another connection.
    pub async fn kill(&mut self, cx: &Cx, thread_id: u32) -> Outcome<(), Error> {
        let payload = command_payload(Command::ProcessKill, &thread_id.to_le_bytes());
        let result = self
            .simple_command(cx, Command::ProcessKill, &payload)
            .await;
        self.conclude(cx, result)
    }

    pub async fn set_autocommit(&mut self, cx: &Cx, enabled: bool) -> Outcome<(), Error> {
        self.text_command(cx, autocommit_sql(enabled)).await
    }

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.text_command(cx, "BEGIN").await
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.text_command(cx, "COMMIT").await
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.text_command(cx, "ROLLBACK").await
    }

    /// `SET NAMES` and remember the new charset for decoding decisions.
    pub async fn set_charset(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let Some(charset) = charset_by_name(name) else {
            return Outcome::Err(config_error(format!("Unknown charset: {name}")));
        };
        let sql = format!("SET NAMES {}", charset.name);
        let result = self.run_text(cx, &sql).await;
        if result.is_ok() {
            self.charset = charset;
        }
        self.conclude(cx, result.map(|_| ()))
    }

    pub async fn show_warnings(&mut self, cx: &Cx) -> Outcome<Vec<Warning>, Error> {
        let result = self.run_text(cx, "SHOW WARNINGS").await.map(|rs| {
            rs.rows
                .iter()
                .map(|row| Warning {
                    level: row.get_as::<String>(0).unwrap_or_default(),
                    code: row
                        .get(1)
                        .and_then(Value::as_u64)
                        .and_then(|c| u16::try_from(c).ok())
                        .unwrap_or_default(),
                    message: row.get_as::<String>(2).unwrap_or_default(),
                })
                .collect()
        });
        self.conclude(cx, result)
    }

    /// Say goodbye (COM_QUIT) and close the transport.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.ensure_usable().is_ok() && !self.unbuffered_active {
            if let Some(framer) = self.framer.as_mut() {
                framer.reset_sequence();
                if let Err(e) = framer.write_frame(cx, &[Command::Quit as u8]).await {
                    tracing::debug!(thread_id = self.thread_id, error = %e, "COM_QUIT failed");
                }
            }
        }
        self.close_now();
        Outcome::Ok(())
    }

    /// Drop the transport immediately.
    pub fn close_now(&mut self) {
        if let Some(framer) = self.framer.take() {
            framer.close();
        }
        if self.state != SessionState::Faulted {
            self.state = SessionState::Closed;
        }
        self.in_flight = false;
        self.unbuffered_active = false;
        self.more_results = false;
    }

    // === Internals ===

    async fn text_command(&mut self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        let result = self.run_text(cx, sql).await.map(|_| ());
        self.conclude(cx, result)
    }

    async fn run_text(&mut self, cx: &Cx, sql: &str) -> Result<ResultSet, Error> {
        self.send(cx, Command::Query, &command_payload(Command::Query, sql.as_bytes()))
            .await?;
        self.read_result(cx, Some(sql), false).await
    }

    async fn simple_command(&mut self, cx: &Cx, command: Command, payload: &[u8]) -> Result<(), Error> {
        self.send(cx, command, payload).await?;
        self.read_result(cx, None, false).await.map(|_| ())
    }

    fn framer_mut(&mut self) -> Result<&mut Framer<Stream>, Error> {
        self.framer
            .as_mut()
            .ok_or_else(|| server_gone("MySQL server has gone away (no transport)"))
    }

    fn ensure_usable(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Disconnected | SessionState::Closed => {
                return Err(server_gone("MySQL server has gone away (session closed)"));
            }
            SessionState::Faulted => {
                return Err(session_faulted(
                    self.fault_reason.as_deref().unwrap_or("unknown"),
                ));
            }
            _ => {}
        }
        if self.close.is_aborted() {
            return Err(connection_lost(
                ConnectionErrorKind::Disconnected,
                "Session was closed by its pool",
            ));
        }
        if self.in_flight {
            return Err(session_faulted("a previous command was interrupted"));
        }
        Ok(())
    }

    /// Start a command: drain leftovers, reset the sequence, send.
    async fn send(&mut self, cx: &Cx, command: Command, payload: &[u8]) -> Result<(), Error> {
        self.ensure_usable()?;
        self.drain_abandoned(cx).await?;
        self.state = SessionState::Command;
        self.in_flight = true;
        let framer = self.framer_mut()?;
        framer.reset_sequence();
        framer.write_frame(cx, payload).await?;
        if !command.expects_reply() {
            self.end_command();
        }
        Ok(())
    }

    async fn drain_abandoned(&mut self, cx: &Cx) -> Result<(), Error> {
        if self.unbuffered_active {
            tracing::warn!(
                thread_id = self.thread_id,
                "draining abandoned unbuffered result"
            );
            self.drain_rows(cx).await?;
        }
        while self.more_results {
            tracing::warn!(thread_id = self.thread_id, "discarding unread result");
            self.state = SessionState::Command;
            self.in_flight = true;
            match self.read_result(cx, None, false).await {
                Ok(_) => {}
                Err(e) if !is_fatal(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn drain_rows(&mut self, cx: &Cx) -> Result<(), Error> {
        self.in_flight = true;
        let mut drained = 0u64;
        loop {
            match self.read_row_packet(cx, None).await {
                Ok(Some(_)) => drained += 1,
                Ok(None) => break,
                Err(e) if !is_fatal(&e) => break,
                Err(e) => return Err(e),
            }
        }
        tracing::trace!(rows = drained, "drained rows");
        self.end_command();
        Ok(())
    }

    fn end_command(&mut self) {
        self.in_flight = false;
        if self.state == SessionState::Command {
            self.state = SessionState::Idle;
        }
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.insert_id = ok.last_insert_id;
        self.status_flags = ok.status_flags;
        self.warning_count = ok.warnings;
        self.info.clone_from(&ok.info);
        self.more_results = ok.more_results();
    }

    fn apply_eof(&mut self, eof: &EofPacket) {
        self.status_flags = eof.status_flags;
        self.warning_count = eof.warnings;
        self.more_results = eof.more_results();
    }

    /// Turn an ERR payload into a query error and finish the command.
    fn server_error(&mut self, payload: &[u8], sql: Option<&str>) -> Error {
        self.more_results = false;
        self.unbuffered_active = false;
        self.end_command();
        match PacketReader::new(payload).parse_err_packet() {
            Some(err) => query_error(&err, sql),
            None => malformed("error", payload),
        }
    }

    /// Read the first reply packet: OK, ERR, LOCAL INFILE or a column count
    /// followed by column definitions.
    async fn read_head(&mut self, cx: &Cx, sql: Option<&str>) -> Result<ResultHead, Error> {
        let mut infile_error = None;
        loop {
            let packet = self.framer_mut()?.read_frame(cx).await?;
            match PacketType::of(&packet) {
                PacketType::Ok => {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet()
                        .ok_or_else(|| malformed("OK", &packet))?;
                    self.apply_ok(&ok);
                    self.end_command();
                    return match infile_error {
                        Some(e) => Err(e),
                        None => Ok(ResultHead::Summary(ResultSet::from_ok(ok))),
                    };
                }
                PacketType::Error => return Err(self.server_error(&packet, sql)),
                PacketType::LocalInfile => {
                    infile_error = self.send_local_infile(cx, &packet[1..]).await?;
                }
                PacketType::Eof => return Err(malformed("result", &packet)),
                PacketType::Data => {
                    let count = PacketReader::new(&packet)
                        .read_lenenc_int()
                        .filter(|&n| n > 0)
                        .ok_or_else(|| malformed("column count", &packet))?;
                    let count = usize::try_from(count)
                        .map_err(|_| malformed("column count", &packet))?;
                    let columns = self.read_column_block(cx, count).await?;
                    return Ok(ResultHead::Columns(columns));
                }
            }
        }
    }

    /// `count` column definitions followed by EOF. Zero reads nothing.
    async fn read_column_block(&mut self, cx: &Cx, count: usize) -> Result<Vec<ColumnDef>, Error> {
        let mut columns = Vec::with_capacity(count);
        if count == 0 {
            return Ok(columns);
        }
        let framer = self.framer_mut()?;
        for _ in 0..count {
            let payload = framer.read_frame(cx).await?;
            columns.push(ColumnDef::parse(&payload)?);
        }
        let eof = framer.read_frame(cx).await?;
        if PacketType::of(&eof) != PacketType::Eof {
            return Err(malformed("column definition EOF", &eof));
        }
        Ok(columns)
    }

    /// One row payload, or `None` at the terminating EOF.
    async fn read_row_packet(&mut self, cx: &Cx, sql: Option<&str>) -> Result<Option<Vec<u8>>, Error> {
        let packet = self.framer_mut()?.read_frame(cx).await?;
        match PacketType::of(&packet) {
            PacketType::Eof => {
                let eof = PacketReader::new(&packet)
                    .parse_eof_packet()
                    .ok_or_else(|| malformed("EOF", &packet))?;
                self.apply_eof(&eof);
                self.unbuffered_active = false;
                Ok(None)
            }
            PacketType::Error => Err(self.server_error(&packet, sql)),
            _ => Ok(Some(packet)),
        }
    }

    /// Read a complete result in the text or binary row format.
    async fn read_result(&mut self, cx: &Cx, sql: Option<&str>, binary: bool) -> Result<ResultSet, Error> {
        let columns = match self.read_head(cx, sql).await? {
            ResultHead::Summary(rs) => return Ok(rs),
            ResultHead::Columns(columns) => columns,
        };
        let info = column_info(&columns);
        let mut rows = Vec::new();
        while let Some(payload) = self.read_row_packet(cx, sql).await? {
            let values = if binary {
                decode_binary_row(&payload, &columns, &self.config.converters)?
            } else {
                decode_text_row(&payload, &columns, &self.config.converters)?
            };
            rows.push(Row::with_columns(Arc::clone(&info), values));
        }
        self.affected_rows = rows.len() as u64;
        self.end_command();
        Ok(ResultSet {
            columns,
            rows,
            affected_rows: self.affected_rows,
            insert_id: 0,
            warning_count: self.warning_count,
            info: String::new(),
            status_flags: self.status_flags,
            has_next: self.more_results,
        })
    }

    /// Answer a LOCAL INFILE request. File errors are returned in the `Ok`
    /// slot so the caller can still consume the server's reply.
    async fn send_local_infile(&mut self, cx: &Cx, name: &[u8]) -> Result<Option<Error>, Error> {
        let filename = String::from_utf8_lossy(name).into_owned();
        let enabled = self.config.local_infile;
        let framer = self.framer_mut()?;
        let mut deferred = None;
        if enabled {
            match std::fs::read(&filename) {
                Ok(data) => {
                    tracing::debug!(file = %filename, bytes = data.len(), "sending LOCAL INFILE");
                    for chunk in data.chunks(LOCAL_INFILE_CHUNK) {
                        framer.write_frame(cx, chunk).await?;
                    }
                }
                Err(e) => deferred = Some(Error::Io(e)),
            }
        } else {
            tracing::debug!(file = %filename, "LOCAL INFILE disabled, sending empty reply");
        }
        framer.write_frame(cx, &[]).await?;
        Ok(deferred)
    }

    /// Fault on fatal errors and convert to an `Outcome`.
    fn conclude<T>(&mut self, cx: &Cx, result: Result<T, Error>) -> Outcome<T, Error> {
        if let Err(e) = &result {
            if is_fatal(e)
                && !matches!(
                    self.state,
                    SessionState::Disconnected | SessionState::Closed | SessionState::Faulted
                )
            {
                let reason = match e {
                    Error::Cancelled => match cx.cancel_reason() {
                        Some(r) => format!("cancelled: {r:?}"),
                        None => "cancelled".to_string(),
                    },
                    other => other.to_string(),
                };
                self.fault(reason);
            }
        }
        into_outcome(cx, result)
    }

    fn fault(&mut self, reason: String) {
        tracing::debug!(thread_id = self.thread_id, reason = %reason, "session faulted");
        if let Some(framer) = self.framer.take() {
            framer.close();
        }
        self.state = SessionState::Faulted;
        self.fault_reason = Some(reason);
        self.in_flight = false;
        self.unbuffered_active = false;
        self.more_results = false;
    }
}

/// Errors after which the byte stream can no longer be trusted.
fn is_fatal(e: &Error) -> bool {
    matches!(
        e,
        Error::Connection(_) | Error::Protocol(_) | Error::Io(_) | Error::Timeout | Error::Cancelled
    )
}

fn autocommit_sql(enabled: bool) -> &'static str {
    if enabled {
        "SET AUTOCOMMIT = 1"
    } else {
        "SET AUTOCOMMIT = 0"
    }
}

async fn open_stream(config: &MySqlConfig) -> Result<Stream, Error> {
    if let Some(path) = &config.unix_socket {
        return open_unix(path).await;
    }
    let addr = resolve(config)?;
    let stream = TcpStream::connect_timeout(addr, config.connect_timeout)
        .await
        .map_err(|e| connect_error(format!("Can't connect to MySQL server on {addr}"), Some(e)))?;
    stream.set_nodelay(true).ok();
    Ok(Stream::Tcp(stream))
}

fn resolve(config: &MySqlConfig) -> Result<SocketAddr, Error> {
    if let Ok(addr) = config.socket_addr().parse::<SocketAddr>() {
        return Ok(addr);
    }
    (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| connect_error(format!("Unknown MySQL server host '{}'", config.host), Some(e)))?
        .next()
        .ok_or_else(|| connect_error(format!("Unknown MySQL server host '{}'", config.host), None))
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> Result<Stream, Error> {
    let stream = asupersync::net::unix::UnixStream::connect(path).await.map_err(|e| {
        connect_error(
            format!(
                "Can't connect to local MySQL server through socket '{}'",
                path.display()
            ),
            Some(e),
        )
    })?;
    Ok(Stream::Unix(stream))
}

#[cfg(not(unix))]
async fn open_unix(path: &std::path::Path) -> Result<Stream, Error> {
    Err(config_error(format!(
        "Local sockets are not supported on this platform: {}",
        path.display()
    )))
}

/// Read position within one streamed result, detached from the session
/// borrow so cursors can hold it between calls.
#[derive(Debug)]
pub(crate) struct RowStream {
    columns: Vec<ColumnDef>,
    column_info: Arc<ColumnInfo>,
    summary: Option<ResultSet>,
    rows_read: u64,
    done: bool,
}

impl RowStream {
    fn new(head: ResultHead) -> Self {
        let (columns, summary, done) = match head {
            ResultHead::Summary(rs) => (Vec::new(), Some(rs), true),
            ResultHead::Columns(columns) => (columns, None, false),
        };
        Self {
            column_info: column_info(&columns),
            columns,
            summary,
            rows_read: 0,
            done,
        }
    }

    pub(crate) fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub(crate) async fn next_row(
        &mut self,
        session: &mut MySqlSession,
        cx: &Cx,
    ) -> Outcome<Option<Row>, Error> {
        if self.done {
            return Outcome::Ok(None);
        }
        let result = self.read_next(session, cx).await;
        session.conclude(cx, result)
    }

    async fn read_next(&mut self, session: &mut MySqlSession, cx: &Cx) -> Result<Option<Row>, Error> {
        if !session.unbuffered_active {
            // another command already drained us
            self.done = true;
            session.ensure_usable()?;
            return Ok(None);
        }
        if session.close.is_aborted() {
            self.done = true;
            return Err(connection_lost(
                ConnectionErrorKind::Disconnected,
                "Session was closed by its pool",
            ));
        }
        session.in_flight = true;
        match session.read_row_packet(cx, None).await {
            Ok(Some(payload)) => {
                session.in_flight = false;
                let values = decode_text_row(&payload, &self.columns, &session.config.converters)?;
                self.rows_read += 1;
                Ok(Some(Row::with_columns(Arc::clone(&self.column_info), values)))
            }
            Ok(None) => {
                self.done = true;
                session.affected_rows = self.rows_read;
                session.end_command();
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    /// Discard remaining rows and build the result summary.
    pub(crate) async fn finish(
        &mut self,
        session: &mut MySqlSession,
        cx: &Cx,
    ) -> Outcome<ResultSet, Error> {
        loop {
            match self.next_row(session, cx).await {
                Outcome::Ok(Some(_)) => {}
                Outcome::Ok(None) => break,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        let summary = self.summary.take().unwrap_or_else(|| ResultSet {
            columns: std::mem::take(&mut self.columns),
            affected_rows: self.rows_read,
            warning_count: session.warning_count,
            status_flags: session.status_flags,
            has_next: session.more_results,
            ..ResultSet::default()
        });
        Outcome::Ok(summary)
    }
}

/// Rows of one result, read on demand.
///
/// Borrows the session mutably: no other command can start until this is
/// finished or dropped.
pub struct StreamingResult<'a> {
    session: &'a mut MySqlSession,
    rows: RowStream,
}

impl std::fmt::Debug for StreamingResult<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResult")
            .field("columns", &self.rows.columns.len())
            .field("rows_read", &self.rows.rows_read)
            .field("done", &self.rows.done)
            .finish_non_exhaustive()
    }
}

impl<'a> StreamingResult<'a> {
    fn new(session: &'a mut MySqlSession, head: ResultHead) -> Self {
        Self {
            session,
            rows: RowStream::new(head),
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        self.rows.columns()
    }

    pub fn description(&self) -> Vec<ColumnDescription> {
        self.rows.columns().iter().map(ColumnDescription::from).collect()
    }

    /// All rows have been read (or the statement returned none).
    pub fn is_done(&self) -> bool {
        self.rows.is_done()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows.rows_read()
    }

    pub async fn next_row(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        self.rows.next_row(self.session, cx).await
    }

    /// Discard any remaining rows and return the result's summary.
    pub async fn finish(mut self, cx: &Cx) -> Outcome<ResultSet, Error> {
        self.rows.finish(self.session, cx).await
    }

    /// Release the session borrow, keeping the read position.
    pub(crate) fn detach(self) -> RowStream {
        self.rows
    }
}

impl Poolable for MySqlSession {
    /// A session cut off mid-command counts as closed for pooling.
    fn is_closed(&self) -> bool {
        MySqlSession::is_closed(self) || self.in_flight || self.unbuffered_active
    }

    fn check_alive(&mut self) -> bool {
        if self.is_closed() || self.in_flight || self.unbuffered_active {
            return false;
        }
        match self.framer.as_mut() {
            Some(framer) => !framer.transport_mut().probe_closed(),
            None => false,
        }
    }

    fn in_transaction(&self) -> bool {
        MySqlSession::in_transaction(self)
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    fn close_now(&mut self) {
        MySqlSession::close_now(self);
    }
}

/// Opens sessions for a pool.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    config: MySqlConfig,
}

impl MySqlConnector {
    pub fn new(config: MySqlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }
}

impl Connector for MySqlConnector {
    type Conn = MySqlSession;

    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send {
        MySqlSession::connect(cx, self.config.clone())
    }
}

#[cfg(test)]
impl MySqlSession {
    /// Run the connection phase over an in-memory stream.
    pub(crate) async fn connect_over(
        cx: &Cx,
        config: MySqlConfig,
        stream: Stream,
    ) -> Result<Self, Error> {
        let mut session = Self::new(config, CloseHandle::new());
        let result = session.establish(cx, stream).await;
        if let Err(e) = &result {
            if is_fatal(e) {
                session.fault(e.to_string());
            }
        }
        result.map(|()| session)
    }
}
