//! Outbound fetcher (C3): one upstream HTTP/1.x request with timeouts, a
//! response-size cap, and bounded retry on transport error.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::ErrorKind;

/// Default per-connect and per-response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default maximum retries on transport error.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A fetched upstream response, already split into status/headers/body.
pub struct FetchedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<String>,
    pub body: bytes::Bytes,
}

/// Fetch configuration, independent of any single request.
#[derive(Clone, Copy)]
pub struct FetchConfig {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub max_response_bytes: usize,
    pub max_retries: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            response_timeout: DEFAULT_TIMEOUT,
            max_response_bytes: crate::cache::DEFAULT_ENTRY_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Performs one upstream request, retrying transport errors with linear
/// backoff (n·1s). HTTP-level errors (any status the origin returns) are
/// never retried — they're returned as-is per spec.md §4.3.
pub async fn fetch(
    host: &str,
    port: u16,
    raw_request: &[u8],
    config: FetchConfig,
) -> Result<FetchedResponse, ErrorKind> {
    let mut attempt = 0;
    loop {
        match fetch_once(host, port, raw_request, config).await {
            Ok(response) => return Ok(response),
            Err(TransportFailure::Retryable(err)) => {
                if attempt >= config.max_retries {
                    warn!(host, port, attempt, "fetch: exhausted retries: {err}");
                    return Err(ErrorKind::UpstreamUnreachable);
                }
                let backoff = Duration::from_secs(u64::from(attempt) + 1);
                debug!(host, port, attempt, ?backoff, "fetch: retrying after transport error");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(TransportFailure::Timeout) => return Err(ErrorKind::UpstreamTimeout),
            Err(TransportFailure::TooLarge) => return Err(ErrorKind::ResponseTooLarge),
            Err(TransportFailure::Malformed) => return Err(ErrorKind::UpstreamUnreachable),
        }
    }
}

enum TransportFailure {
    Retryable(std::io::Error),
    Timeout,
    TooLarge,
    Malformed,
}

async fn fetch_once(
    host: &str,
    port: u16,
    raw_request: &[u8],
    config: FetchConfig,
) -> Result<FetchedResponse, TransportFailure> {
    let connect = timeout(config.connect_timeout, TcpStream::connect((host, port))).await;
    let stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(TransportFailure::Retryable(err)),
        Err(_) => return Err(TransportFailure::Timeout),
    };

    let (mut read_half, mut write_half) = stream.into_split();

    if let Err(err) = write_half.write_all(raw_request).await {
        return Err(TransportFailure::Retryable(err));
    }

    let mut buffer = BytesMut::with_capacity(8192);
    loop {
        match timeout(config.response_timeout, read_half.read_buf(&mut buffer)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                if buffer.len() > config.max_response_bytes {
                    return Err(TransportFailure::TooLarge);
                }
            }
            Ok(Err(err)) => return Err(TransportFailure::Retryable(err)),
            Err(_) => return Err(TransportFailure::Timeout),
        }
    }

    parse_response(&buffer.freeze()).ok_or(TransportFailure::Malformed)
}

fn parse_response(data: &bytes::Bytes) -> Option<FetchedResponse> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut raw_headers);

    match response.parse(data) {
        Ok(httparse::Status::Complete(header_len)) => {
            let status = response.code?;
            let reason = response.reason.unwrap_or("OK").to_string();
            let headers: Vec<String> = response
                .headers
                .iter()
                .map(|h| format!("{}: {}", h.name, String::from_utf8_lossy(h.value)))
                .collect();
            let body = data.slice(header_len..);
            Some(FetchedResponse { status, reason, headers, body })
        }
        _ => None,
    }
}

/// Forces `Connection: close` on the outgoing request regardless of what the
/// client sent, per spec.md §4.3. `headers` is the client's header block
/// verbatim (minus any pre-existing `Connection` line, which is filtered).
pub fn build_request(method: &str, path: &str, host_header: &str, headers: &[String]) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\nHost: {host_header}\r\n");
    for header in headers {
        if header.to_lowercase().starts_with("host:") || header.to_lowercase().starts_with("connection:") {
            continue;
        }
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}
