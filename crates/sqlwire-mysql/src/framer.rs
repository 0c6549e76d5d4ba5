//! Length-prefixed frames over a [`Transport`].
//!
//! A payload of `MAX_PACKET_SIZE` bytes or more is split into full-size
//! frames followed by a shorter one. When the payload length is an exact
//! multiple of the limit, the shorter frame is empty; readers keep
//! concatenating until they see a frame below the limit.
//!
//! The sequence counter is advanced by every frame in either direction and
//! reset by the caller at the start of each command.

#![allow(clippy::cast_possible_truncation)]

use std::future::poll_fn;
use std::task::{Context, Poll};

use asupersync::Cx;
use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{CloseHandle, Error};

use crate::error::{connection_lost, io_lost, protocol_error};
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};
use crate::transport::Transport;

/// Upper bound on a reassembled payload unless the caller sets one; the
/// server's own `max_allowed_packet` cannot exceed it.
pub const DEFAULT_MAX_PAYLOAD: usize = 1 << 30;

/// Reads and writes frames, tracking the sequence counter.
#[derive(Debug)]
pub struct Framer<T> {
    transport: T,
    sequence: u8,
    close: CloseHandle,
    max_payload: usize,
}

impl<T: Transport> Framer<T> {
    pub fn new(transport: T) -> Self {
        Self::with_close_handle(transport, CloseHandle::new())
    }

    /// Use `close` to abort pending I/O from outside the owning task.
    pub fn with_close_handle(transport: T, close: CloseHandle) -> Self {
        Self {
            transport,
            sequence: 0,
            close,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Reject incoming payloads larger than `limit` bytes.
    pub fn with_max_payload(mut self, limit: usize) -> Self {
        self.max_payload = limit;
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command phase. Call exactly once per command.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn close_handle(&self) -> &CloseHandle {
        &self.close
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Take the transport back, e.g. to wrap it in TLS. The sequence
    /// counter is returned so the upgraded framer can continue it.
    pub fn into_parts(self) -> (T, u8, CloseHandle) {
        (self.transport, self.sequence, self.close)
    }

    pub fn from_parts(transport: T, sequence: u8, close: CloseHandle) -> Self {
        Self {
            transport,
            sequence,
            close,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Drop the transport without any goodbye.
    pub fn close(self) {
        tracing::trace!(sequence = self.sequence, "closing transport");
    }

    /// Read one logical payload, reassembling continuation frames.
    pub async fn read_frame(&mut self, cx: &Cx) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            let got = self.fill(cx, &mut header).await?;
            if got == 0 {
                return Err(connection_lost(
                    ConnectionErrorKind::Disconnected,
                    "Lost connection to MySQL server during query (peer closed)",
                ));
            }
            if got < header.len() {
                return Err(short_read("frame header", got, header.len()));
            }

            let header = PacketHeader::from_bytes(&header);
            if header.sequence_id != self.sequence {
                return Err(protocol_error(format!(
                    "Packet sequence number wrong: got {}, expected {}",
                    header.sequence_id, self.sequence
                )));
            }
            self.sequence = header.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = payload.len();
            if start + len > self.max_payload {
                return Err(protocol_error(format!(
                    "Got a packet bigger than 'max_allowed_packet' bytes ({} > {})",
                    start + len,
                    self.max_payload
                )));
            }
            payload.resize(start + len, 0);
            let got = self.fill(cx, &mut payload[start..]).await?;
            if got < len {
                return Err(short_read("frame payload", got, len));
            }
            tracing::trace!(len, sequence = header.sequence_id, "read frame");

            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// Write one logical payload, splitting it as needed. All frames go out
    /// in a single buffered write.
    pub async fn write_frame(&mut self, cx: &Cx, payload: &[u8]) -> Result<(), Error> {
        let (bytes, next) = encode_frames(payload, self.sequence);
        tracing::trace!(len = payload.len(), sequence = self.sequence, "write frame");
        self.sequence = next;
        self.write_all(cx, &bytes).await
    }

    /// Read until `buf` is full or the peer closes. Returns the byte count.
    async fn fill(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let transport = &mut self.transport;
            let close = &self.close;
            let n = poll_fn(|task| {
                if let Some(err) = gate(cx, close, task) {
                    return Poll::Ready(Err(err));
                }
                transport
                    .poll_read(task, &mut buf[filled..])
                    .map_err(|e| io_lost("reading", e))
            })
            .await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn write_all(&mut self, cx: &Cx, bytes: &[u8]) -> Result<(), Error> {
        let mut written = 0;
        while written < bytes.len() {
            let transport = &mut self.transport;
            let close = &self.close;
            let n = poll_fn(|task| {
                if let Some(err) = gate(cx, close, task) {
                    return Poll::Ready(Err(err));
                }
                transport
                    .poll_write(task, &bytes[written..])
                    .map_err(|e| io_lost("writing", e))
            })
            .await?;
            if n == 0 {
                return Err(connection_lost(
                    ConnectionErrorKind::Disconnected,
                    "Lost connection to MySQL server (write returned zero)",
                ));
            }
            written += n;
        }
        let transport = &mut self.transport;
        let close = &self.close;
        poll_fn(|task| {
            if let Some(err) = gate(cx, close, task) {
                return Poll::Ready(Err(err));
            }
            transport
                .poll_flush(task)
                .map_err(|e| io_lost("flushing", e))
        })
        .await
    }
}

/// Checked on every poll: cancellation first, then an external abort. The
/// waker is registered before the abort flag is read so an abort racing
/// with this poll still wakes the task.
fn gate(cx: &Cx, close: &CloseHandle, task: &Context<'_>) -> Option<Error> {
    if cx.is_cancel_requested() {
        return Some(Error::Cancelled);
    }
    close.register(task.waker());
    if close.is_aborted() {
        return Some(connection_lost(
            ConnectionErrorKind::Disconnected,
            "Lost connection to MySQL server (connection terminated)",
        ));
    }
    None
}

fn short_read(what: &str, got: usize, wanted: usize) -> Error {
    connection_lost(
        ConnectionErrorKind::ShortRead,
        format!("Lost connection to MySQL server (short read of {what}: {got} of {wanted} bytes)"),
    )
}

/// Encode `payload` as wire frames starting at `sequence`. Returns the bytes
/// and the next sequence number.
pub fn encode_frames(payload: &[u8], mut sequence: u8) -> (Vec<u8>, u8) {
    let frames = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + frames * PacketHeader::SIZE);
    let mut rest = payload;
    loop {
        let n = rest.len().min(MAX_PACKET_SIZE);
        let header = PacketHeader {
            payload_length: n as u32,
            sequence_id: sequence,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&rest[..n]);
        sequence = sequence.wrapping_add(1);
        rest = &rest[n..];
        if n < MAX_PACKET_SIZE {
            return (out, sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Stream;
    use crate::transport::scripted::ScriptedTransport;
    use asupersync::runtime::RuntimeBuilder;
    use sqlwire_core::error::CR_SERVER_LOST;

    fn run<F: Future>(f: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    fn lost_kind(err: &Error) -> Option<(ConnectionErrorKind, Option<u16>)> {
        match err {
            Error::Connection(c) => Some((c.kind, c.code)),
            _ => None,
        }
    }

    fn round_trip(len: usize) -> (usize, u8) {
        let script = ScriptedTransport::new();
        let mut framer = Framer::new(Stream::Scripted(script.clone()));
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let cx = Cx::for_testing();
        run(async {
            framer.write_frame(&cx, &payload).await.unwrap();
            let frames = script.written_frames().len();
            script.loop_back();
            framer.reset_sequence();
            let read = framer.read_frame(&cx).await.unwrap();
            assert_eq!(read, payload);
            (frames, framer.sequence())
        })
    }

    #[test]
    fn small_payloads_use_one_frame() {
        assert_eq!(round_trip(0), (1, 1));
        assert_eq!(round_trip(5), (1, 1));
    }

    #[test]
    fn frame_limit_boundaries() {
        assert_eq!(round_trip(MAX_PACKET_SIZE - 1), (1, 1));
        // exactly at the limit needs an empty terminator
        assert_eq!(round_trip(MAX_PACKET_SIZE), (2, 2));
        assert_eq!(round_trip(MAX_PACKET_SIZE + 1), (2, 2));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let script = ScriptedTransport::new();
        let mut framer = Framer::new(Stream::Scripted(script.clone())).with_max_payload(4);
        assert_eq!(framer.max_payload(), 4);
        script.push_frame(0, b"hello");
        let cx = Cx::for_testing();
        let err = run(framer.read_frame(&cx)).unwrap_err();
        match err {
            Error::Protocol(p) => assert!(p.message.contains("max_allowed_packet"), "{}", p.message),
            other => panic!("expected a protocol error, got {other}"),
        }
    }

    #[test]
    fn encode_exact_limit_appends_empty_frame() {
        let payload = vec![7u8; MAX_PACKET_SIZE];
        let (bytes, next) = encode_frames(&payload, 254);
        assert_eq!(next, 0);
        assert_eq!(bytes.len(), MAX_PACKET_SIZE + 8);
        assert_eq!(&bytes[..4], &[0xFF, 0xFF, 0xFF, 254]);
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 255]);
    }

    #[test]
    fn sequence_mismatch_is_protocol_error() {
        let script = ScriptedTransport::new();
        script.push_frame(3, b"hello");
        let mut framer = Framer::new(Stream::Scripted(script));
        let cx = Cx::for_testing();
        let err = run(framer.read_frame(&cx)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[test]
    fn eof_at_boundary_is_peer_closed() {
        let mut framer = Framer::new(Stream::Scripted(ScriptedTransport::new()));
        let cx = Cx::for_testing();
        let err = run(framer.read_frame(&cx)).unwrap_err();
        assert_eq!(
            lost_kind(&err),
            Some((ConnectionErrorKind::Disconnected, Some(CR_SERVER_LOST)))
        );
    }

    #[test]
    fn eof_mid_frame_is_short_read() {
        let script = ScriptedTransport::new();
        script.push_raw(&[10, 0, 0, 0, b'a', b'b']);
        let mut framer = Framer::new(Stream::Scripted(script));
        let cx = Cx::for_testing();
        let err = run(framer.read_frame(&cx)).unwrap_err();
        assert_eq!(
            lost_kind(&err),
            Some((ConnectionErrorKind::ShortRead, Some(CR_SERVER_LOST)))
        );

        let script = ScriptedTransport::new();
        script.push_raw(&[10, 0]);
        let mut framer = Framer::new(Stream::Scripted(script));
        let err = run(framer.read_frame(&cx)).unwrap_err();
        assert_eq!(lost_kind(&err).map(|k| k.0), Some(ConnectionErrorKind::ShortRead));
    }

    #[test]
    fn aborted_handle_fails_pending_read() {
        let script = ScriptedTransport::new();
        script.hang_when_empty(true);
        let close = CloseHandle::new();
        let mut framer = Framer::with_close_handle(Stream::Scripted(script), close.clone());
        close.abort();
        let cx = Cx::for_testing();
        let err = run(framer.read_frame(&cx)).unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn sequence_continues_across_reads_and_writes() {
        let script = ScriptedTransport::new();
        script.push_frame(1, b"reply");
        let mut framer = Framer::new(Stream::Scripted(script.clone()));
        let cx = Cx::for_testing();
        run(async {
            framer.write_frame(&cx, b"\x03SELECT 1").await.unwrap();
            assert_eq!(framer.read_frame(&cx).await.unwrap(), b"reply");
            framer.write_frame(&cx, b"more").await.unwrap();
        });
        let frames = script.written_frames();
        assert_eq!(frames[0].0, 0);
        assert_eq!(frames[1], (2, b"more".to_vec()));
    }
}
