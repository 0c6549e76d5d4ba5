//! Fetch-style cursors over a session.
//!
//! [`Cursor`] buffers each result; [`SsCursor`] streams rows from the wire
//! and holds the session busy until the result is exhausted or closed.

use asupersync::{Cx, Outcome};
use sqlwire_core::{Error, Row, Value};

use crate::escape::interpolate_params;
use crate::result::{ColumnDescription, ResultSet};
use crate::session::{MySqlSession, RowStream};

macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Buffered cursor.
#[derive(Debug)]
pub struct Cursor<'a> {
    session: &'a mut MySqlSession,
    result: Option<ResultSet>,
    position: usize,
    rowcount: Option<u64>,
    lastrowid: u64,
}

impl<'a> Cursor<'a> {
    pub fn new(session: &'a mut MySqlSession) -> Self {
        Self {
            session,
            result: None,
            position: 0,
            rowcount: None,
            lastrowid: 0,
        }
    }

    /// Run `sql` with `?` placeholders replaced by escaped literals.
    ///
    /// Escaping follows the session's `NO_BACKSLASH_ESCAPES` state.
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        try_outcome!(self.discard_pending(cx).await);
        let query = match interpolate_params(sql, params, self.session.no_backslash_escapes()) {
            Ok(q) => q,
            Err(e) => return Outcome::Err(e),
        };
        let rs = try_outcome!(self.session.query(cx, &query).await);
        Outcome::Ok(self.load(rs))
    }

    /// Run `sql` through a server-side prepared statement, closing it
    /// afterwards.
    pub async fn execute_prepared(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<u64, Error> {
        try_outcome!(self.discard_pending(cx).await);
        let stmt = try_outcome!(self.session.prepare(cx, sql).await);
        let executed = self.session.execute(cx, &stmt, params).await;
        if !self.session.is_closed() {
            if let Outcome::Err(e) = self.session.close_statement(cx, &stmt).await {
                tracing::warn!(statement_id = stmt.id(), error = %e, "failed to close prepared statement");
            }
        }
        let rs = try_outcome!(executed);
        Outcome::Ok(self.load(rs))
    }

    /// Execute the same statement once per parameter set. Returns the total
    /// affected rows.
    pub async fn execute_many(
        &mut self,
        cx: &Cx,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> Outcome<u64, Error> {
        let mut total = 0;
        for params in param_sets {
            total += try_outcome!(self.execute(cx, sql, params).await);
        }
        self.rowcount = Some(total);
        Outcome::Ok(total)
    }

    fn load(&mut self, rs: ResultSet) -> u64 {
        let count = rs.rowcount();
        if rs.insert_id != 0 {
            self.lastrowid = rs.insert_id;
        }
        self.rowcount = Some(count);
        self.position = 0;
        self.result = Some(rs);
        count
    }

    pub fn fetch_one(&mut self) -> Option<Row> {
        let rs = self.result.as_ref()?;
        let row = rs.rows.get(self.position)?.clone();
        self.position += 1;
        Some(row)
    }

    pub fn fetch_many(&mut self, size: usize) -> Vec<Row> {
        let Some(rs) = self.result.as_ref() else {
            return Vec::new();
        };
        let end = (self.position + size).min(rs.rows.len());
        let rows = rs.rows[self.position..end].to_vec();
        self.position = end;
        rows
    }

    pub fn fetch_all(&mut self) -> Vec<Row> {
        let Some(rs) = self.result.as_ref() else {
            return Vec::new();
        };
        let rows = rs.rows[self.position..].to_vec();
        self.position = rs.rows.len();
        rows
    }

    /// Move to the next result of a multi-statement query. Returns `false`
    /// when there is none.
    pub async fn next_set(&mut self, cx: &Cx) -> Outcome<bool, Error> {
        match try_outcome!(self.session.next_result(cx).await) {
            Some(rs) => {
                self.load(rs);
                Outcome::Ok(true)
            }
            None => Outcome::Ok(false),
        }
    }

    /// Rows in the current result, or affected rows for a statement
    /// without one. `None` before the first execute.
    pub fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    pub fn lastrowid(&self) -> u64 {
        self.lastrowid
    }

    /// Index of the next row `fetch_one` would return.
    pub fn rownumber(&self) -> usize {
        self.position
    }

    pub fn description(&self) -> Option<Vec<ColumnDescription>> {
        self.result
            .as_ref()
            .filter(|rs| rs.has_rows())
            .map(ResultSet::description)
    }

    pub fn warning_count(&self) -> u16 {
        self.result.as_ref().map_or(0, |rs| rs.warning_count)
    }

    async fn discard_pending(&mut self, cx: &Cx) -> Outcome<(), Error> {
        while self.session.has_more_results() {
            try_outcome!(self.session.next_result(cx).await);
        }
        self.result = None;
        Outcome::Ok(())
    }

    /// Read and discard any results still queued on the session.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.discard_pending(cx).await
    }
}

/// Unbuffered cursor: rows are read from the wire as they are fetched.
#[derive(Debug)]
pub struct SsCursor<'a> {
    session: &'a mut MySqlSession,
    stream: Option<RowStream>,
    rowcount: Option<u64>,
    lastrowid: u64,
}

impl<'a> SsCursor<'a> {
    pub fn new(session: &'a mut MySqlSession) -> Self {
        Self {
            session,
            stream: None,
            rowcount: None,
            lastrowid: 0,
        }
    }

    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<(), Error> {
        try_outcome!(self.drain(cx).await);
        let query = match interpolate_params(sql, params, self.session.no_backslash_escapes()) {
            Ok(q) => q,
            Err(e) => return Outcome::Err(e),
        };
        let stream = try_outcome!(self.session.query_streaming(cx, &query).await).detach();
        self.start(stream);
        Outcome::Ok(())
    }

    pub async fn fetch_one(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        let Some(stream) = self.stream.as_mut() else {
            return Outcome::Ok(None);
        };
        let row = try_outcome!(stream.next_row(self.session, cx).await);
        if row.is_none() && !stream.columns().is_empty() {
            self.rowcount = Some(stream.rows_read());
        }
        Outcome::Ok(row)
    }

    pub async fn fetch_many(&mut self, cx: &Cx, size: usize) -> Outcome<Vec<Row>, Error> {
        let mut rows = Vec::with_capacity(size.min(1024));
        while rows.len() < size {
            match try_outcome!(self.fetch_one(cx).await) {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Outcome::Ok(rows)
    }

    pub async fn fetch_all(&mut self, cx: &Cx) -> Outcome<Vec<Row>, Error> {
        let mut rows = Vec::new();
        while let Some(row) = try_outcome!(self.fetch_one(cx).await) {
            rows.push(row);
        }
        Outcome::Ok(rows)
    }

    /// Finish the current result and start streaming the next one.
    pub async fn next_set(&mut self, cx: &Cx) -> Outcome<bool, Error> {
        try_outcome!(self.finish_current(cx).await);
        match try_outcome!(self.session.next_result_streaming(cx).await) {
            Some(stream) => {
                self.start(stream);
                Outcome::Ok(true)
            }
            None => Outcome::Ok(false),
        }
    }

    fn start(&mut self, stream: RowStream) {
        if stream.is_done() {
            self.rowcount = Some(self.session.affected_rows());
            self.lastrowid = self.session.insert_id();
        } else {
            self.rowcount = None;
        }
        self.stream = Some(stream);
    }

    /// Unknown until the result has been read to the end.
    pub fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    pub fn lastrowid(&self) -> u64 {
        self.lastrowid
    }

    pub fn description(&self) -> Option<Vec<ColumnDescription>> {
        let stream = self.stream.as_ref()?;
        if stream.columns().is_empty() {
            return None;
        }
        Some(stream.columns().iter().map(ColumnDescription::from).collect())
    }

    async fn finish_current(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(mut stream) = self.stream.take() {
            let summary = try_outcome!(stream.finish(self.session, cx).await);
            self.rowcount = Some(summary.rowcount());
        }
        Outcome::Ok(())
    }

    async fn drain(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.finish_current(cx).await);
        while self.session.has_more_results() {
            try_outcome!(self.session.next_result(cx).await);
        }
        Outcome::Ok(())
    }

    /// Read the rest of the result so the session can be reused.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.drain(cx).await
    }
}
