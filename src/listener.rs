//! Raw socket listener (C5): reads the first line of a new connection and
//! routes `CONNECT` to the tunnel, an absolute-form request back through
//! the HTTP pipeline, and anything malformed to a plain-text error.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::cache::Cache;
use crate::pipeline::{self, PipelineConfig, MAX_BYTES};
use crate::tunnel;

/// Accepts one raw connection, reads up to the end of headers (bounded by
/// `MAX_BYTES`), and routes it per spec.md §4.5.
pub async fn handle(mut stream: TcpStream, cache: Cache, config: PipelineConfig) {
    let mut buffer = BytesMut::with_capacity(1024);

    loop {
        match stream.read_buf(&mut buffer).await {
            Ok(0) => return,
            Ok(_) => {
                if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.windows(2).any(|w| w == b"\n\n") {
                    break;
                }
                if buffer.len() > MAX_BYTES {
                    let _ = stream
                        .write_all(b"413 Request Entity Too Large\r\n")
                        .await;
                    return;
                }
            }
            Err(_) => return,
        }
    }

    let first_line_end = buffer
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(buffer.len());
    let first_line = String::from_utf8_lossy(&buffer[..first_line_end]).to_string();

    let mut parts = first_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => {
            warn!(line = %first_line, "listener: malformed request line");
            let _ = stream.write_all(b"400 Bad Request\r\n").await;
            return;
        }
    };

    if !version.starts_with("HTTP/") {
        let _ = stream.write_all(b"400 Bad Request\r\n").await;
        return;
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        match tunnel::parse_target(target) {
            Some((host, port)) => {
                tunnel::run(stream, &host, port, tunnel::DEFAULT_IDLE_TIMEOUT).await;
            }
            None => {
                let _ = stream.write_all(b"400 Bad Request\r\n").await;
            }
        }
        return;
    }

    // Any other method re-enters the HTTP pipeline in-process, with the
    // already-buffered bytes prepended so the pipeline sees the same bytes
    // it would have read itself (Open Question decision: in-process
    // re-entry, not a TCP loopback).
    let mut prefixed = PrefixedStream {
        prefix: buffer.freeze(),
        offset: 0,
        inner: stream,
    };
    pipeline::handle(&mut prefixed, &cache, &config).await;
}

/// Wraps a `TcpStream` so the bytes already read while hunting for
/// `\r\n\r\n` are replayed to the pipeline before further socket reads.
struct PrefixedStream {
    prefix: bytes::Bytes,
    offset: usize,
    inner: TcpStream,
}

impl tokio::io::AsyncRead for PrefixedStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for PrefixedStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
