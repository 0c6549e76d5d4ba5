//! Byte streams the framer runs over.
//!
//! Every variant is a non-blocking asupersync stream, so a session waiting
//! on the server never stalls other tasks on the same executor.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
#[cfg(unix)]
use asupersync::net::unix::UnixStream;
#[cfg(feature = "tls")]
use asupersync::tls::TlsStream;

/// A bidirectional byte stream polled by the framer.
pub trait Transport: Send {
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Whether bytes on this stream are protected end to end (TLS or a
    /// local socket). Decides if passwords may be sent in the clear.
    fn is_secure(&self) -> bool;

    /// Non-blocking liveness probe for an idle stream.
    ///
    /// Returns true if the peer closed, an error is pending, or unsolicited
    /// bytes arrived. Any of those makes an idle session unusable.
    fn probe_closed(&mut self) -> bool;
}

/// The transport a session owns.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(test)]
    Scripted(scripted::ScriptedTransport),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Stream::Tcp(_) => "tcp",
            #[cfg(unix)]
            Stream::Unix(_) => "unix",
            #[cfg(feature = "tls")]
            Stream::Tls(_) => "tls",
            #[cfg(test)]
            Stream::Scripted(_) => "scripted",
        };
        f.debug_tuple("Stream").field(&kind).finish()
    }
}

fn read_into<S: AsyncRead + Unpin>(
    stream: &mut S,
    cx: &mut Context<'_>,
    buf: &mut [u8],
) -> Poll<io::Result<usize>> {
    let mut read_buf = ReadBuf::new(buf);
    match Pin::new(stream).poll_read(cx, &mut read_buf) {
        Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
    }
}

/// Poll one byte with a no-op waker: pending means idle and healthy.
fn probe<S: AsyncRead + Unpin>(stream: &mut S) -> bool {
    let mut byte = [0u8; 1];
    let mut cx = Context::from_waker(Waker::noop());
    read_into(stream, &mut cx, &mut byte).is_ready()
}

impl Transport for Stream {
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self {
            Stream::Tcp(stream) => read_into(stream, cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => read_into(stream, cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => read_into(&mut **stream, cx, buf),
            #[cfg(test)]
            Stream::Scripted(s) => s.poll_read(cx, buf),
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
            #[cfg(test)]
            Stream::Scripted(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
            #[cfg(test)]
            Stream::Scripted(s) => s.poll_flush(cx),
        }
    }

    fn is_secure(&self) -> bool {
        match self {
            Stream::Tcp(_) => false,
            #[cfg(unix)]
            Stream::Unix(_) => true,
            #[cfg(feature = "tls")]
            Stream::Tls(_) => true,
            #[cfg(test)]
            Stream::Scripted(s) => s.is_secure(),
        }
    }

    fn probe_closed(&mut self) -> bool {
        match self {
            Stream::Tcp(stream) => probe(stream),
            #[cfg(unix)]
            Stream::Unix(stream) => probe(stream),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => probe(&mut **stream),
            #[cfg(test)]
            Stream::Scripted(s) => s.probe_closed(),
        }
    }
}

/// An in-memory transport for protocol tests.
///
/// Server bytes are queued up front; whatever the client writes is kept
/// for inspection. Once the queue runs dry the transport either reports
/// EOF or stays pending, depending on `hang_when_empty`.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use crate::protocol::PacketHeader;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Script {
        incoming: VecDeque<u8>,
        outgoing: Vec<u8>,
        hang_when_empty: bool,
        secure: bool,
        reads: usize,
    }

    /// Cloneable handle to one scripted stream; clones share state.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            let mut guard = self
                .script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&mut guard)
        }

        /// Queue one server frame.
        #[allow(clippy::cast_possible_truncation)]
        pub(crate) fn push_frame(&self, sequence_id: u8, payload: &[u8]) -> &Self {
            let header = PacketHeader {
                payload_length: payload.len() as u32,
                sequence_id,
            };
            self.with(|s| {
                s.incoming.extend(header.to_bytes());
                s.incoming.extend(payload.iter().copied());
            });
            self
        }

        pub(crate) fn push_raw(&self, bytes: &[u8]) -> &Self {
            self.with(|s| s.incoming.extend(bytes.iter().copied()));
            self
        }

        pub(crate) fn hang_when_empty(&self, hang: bool) -> &Self {
            self.with(|s| s.hang_when_empty = hang);
            self
        }

        pub(crate) fn set_secure(&self, secure: bool) -> &Self {
            self.with(|s| s.secure = secure);
            self
        }

        /// Everything the client has written so far.
        pub(crate) fn written(&self) -> Vec<u8> {
            self.with(|s| s.outgoing.clone())
        }

        /// Split the client's output into (sequence, payload) frames.
        pub(crate) fn written_frames(&self) -> Vec<(u8, Vec<u8>)> {
            let bytes = self.written();
            let mut frames = Vec::new();
            let mut pos = 0;
            while pos + 4 <= bytes.len() {
                let header = PacketHeader::from_bytes(&[
                    bytes[pos],
                    bytes[pos + 1],
                    bytes[pos + 2],
                    bytes[pos + 3],
                ]);
                let len = header.payload_length as usize;
                let start = pos + 4;
                frames.push((header.sequence_id, bytes[start..start + len].to_vec()));
                pos = start + len;
            }
            frames
        }

        /// Move the client's output back to the input side (loopback).
        pub(crate) fn loop_back(&self) {
            self.with(|s| {
                let out = std::mem::take(&mut s.outgoing);
                s.incoming.extend(out);
            });
        }

        pub(crate) fn remaining(&self) -> usize {
            self.with(|s| s.incoming.len())
        }

        pub(crate) fn reads(&self) -> usize {
            self.with(|s| s.reads)
        }

        pub(crate) fn poll_read(
            &mut self,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            self.with(|s| {
                s.reads += 1;
                if s.incoming.is_empty() {
                    return if s.hang_when_empty {
                        Poll::Pending
                    } else {
                        Poll::Ready(Ok(0))
                    };
                }
                let n = buf.len().min(s.incoming.len());
                for (slot, byte) in buf.iter_mut().zip(s.incoming.drain(..n)) {
                    *slot = byte;
                }
                Poll::Ready(Ok(n))
            })
        }

        pub(crate) fn poll_write(
            &mut self,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.with(|s| s.outgoing.extend_from_slice(buf));
            Poll::Ready(Ok(buf.len()))
        }

        pub(crate) fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        pub(crate) fn is_secure(&self) -> bool {
            self.with(|s| s.secure)
        }

        pub(crate) fn probe_closed(&mut self) -> bool {
            self.with(|s| !s.incoming.is_empty() || !s.hang_when_empty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedTransport;
    use super::*;

    #[test]
    fn scripted_probe_reports_pending_bytes() {
        let script = ScriptedTransport::new();
        script.hang_when_empty(true);
        let mut stream = Stream::Scripted(script.clone());
        assert!(!stream.probe_closed());

        script.push_raw(&[1]);
        assert!(stream.probe_closed());
    }

    #[test]
    fn scripted_probe_sees_eof() {
        let mut stream = Stream::Scripted(ScriptedTransport::new());
        assert!(stream.probe_closed());
        assert!(!stream.is_secure());
    }
}
