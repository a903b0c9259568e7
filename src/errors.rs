//! Canonical error kinds and their external HTTP mapping (spec §7).

use std::fmt;

/// Every way a request can fail before a response is written.
///
/// Mirrors the error table in spec.md §7. Deliberately a plain enum with a
/// hand-written `Display`, not a `thiserror` derive — the teacher crate never
/// reaches for an error-derive dependency, so neither do we.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientBadRequest,
    MethodNotImplemented,
    VersionUnsupported,
    CapacityExhausted,
    ResponseTooLarge,
    UpstreamTimeout,
    UpstreamUnreachable,
    Internal,
}

impl ErrorKind {
    /// The HTTP status code this error surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::ClientBadRequest => 400,
            ErrorKind::MethodNotImplemented => 501,
            ErrorKind::VersionUnsupported => 505,
            ErrorKind::CapacityExhausted => 503,
            ErrorKind::ResponseTooLarge => 413,
            ErrorKind::UpstreamTimeout => 504,
            ErrorKind::UpstreamUnreachable => 502,
            ErrorKind::Internal => 500,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ErrorKind::ClientBadRequest => "Bad Request",
            ErrorKind::MethodNotImplemented => "Not Implemented",
            ErrorKind::VersionUnsupported => "HTTP Version Not Supported",
            ErrorKind::CapacityExhausted => "Service Unavailable",
            ErrorKind::ResponseTooLarge => "Payload Too Large",
            ErrorKind::UpstreamTimeout => "Gateway Timeout",
            ErrorKind::UpstreamUnreachable => "Bad Gateway",
            ErrorKind::Internal => "Internal Server Error",
        }
    }

    /// Canonical HTML body for the four statuses spec.md §6 names explicitly;
    /// every other status gets a generic one-line body in the same shape.
    pub fn html_body(&self) -> String {
        let status = self.status();
        let reason = self.reason();
        format!(
            "<html><head><title>{status} {reason}</title></head>\
             <body><h1>{status} {reason}</h1></body></html>"
        )
    }

    /// Renders a complete HTTP/1.1 response (status line, canonical headers,
    /// HTML body) ready to write to the client socket.
    pub fn render(&self, date: &str) -> Vec<u8> {
        let body = self.html_body();
        format!(
            "HTTP/1.1 {} {}\r\n\
             Date: {date}\r\n\
             Server: NodeProxy/1.0\r\n\
             Content-Type: text/html\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            self.status(),
            self.reason(),
            body.len(),
        )
        .into_bytes()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status(), self.reason())
    }
}

impl std::error::Error for ErrorKind {}
