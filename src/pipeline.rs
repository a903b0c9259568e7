//! HTTP request pipeline (C4): validate, admit, lookup, fetch, cache, respond.
//!
//! Merges the stricter of the teacher's two handler variants (spec.md §9,
//! "Dual pipeline variants"): the request-size cap, URL-validity check, and
//! content-type-on-cache all apply unconditionally.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::admission::AdmissionGate;
use crate::cache::{self, Cache};
use crate::errors::ErrorKind;
use crate::fetcher::{self, FetchConfig};

/// Maximum accepted request size before headers must have terminated.
pub const MAX_BYTES: usize = 4096;

/// Runtime configuration threaded through one pipeline invocation.
#[derive(Clone)]
pub struct PipelineConfig {
    pub admission_timeout: Duration,
    pub fetch: FetchConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_secs(5),
            fetch: FetchConfig::default(),
        }
    }
}

struct ParsedRequest {
    method: String,
    target: String,
    host: String,
    port: u16,
    path: String,
    headers: Vec<String>,
}

/// Handles one already-accepted client connection end to end: reads the
/// request, validates it, serves it from cache or upstream, and writes
/// exactly one response. Never lets an error escape — every exit path
/// writes a response (or gives up on an already-dead socket) and the
/// caller is responsible for releasing the admission slot once this
/// returns (see `server::handle_connection`, which holds the `Admitted`
/// guard across the call).
pub async fn handle<S>(stream: &mut S, cache: &Cache, config: &PipelineConfig)
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let request_bytes = match read_request(stream).await {
        Ok(bytes) => bytes,
        Err(ErrorKind::ClientBadRequest) => {
            write_error(stream, ErrorKind::ClientBadRequest).await;
            return;
        }
        Err(_) => return, // client disconnected before sending anything
    };

    let parsed = match parse_and_validate(&request_bytes) {
        Ok(parsed) => parsed,
        Err(kind) => {
            write_error(stream, kind).await;
            return;
        }
    };

    let key = cache::normalize_key(&parsed.target);

    if parsed.method == "GET" {
        if let Some(entry) = cache.lookup(&key).await {
            info!(key = %key, "pipeline: cache hit");
            write_cache_hit(stream, &entry).await;
            return;
        }
    }
    debug!(key = %key, "pipeline: cache miss");

    let raw_request = fetcher::build_request(&parsed.method, &parsed.path, &parsed.host, &parsed.headers);
    match fetcher::fetch(&parsed.host, parsed.port, &raw_request, config.fetch).await {
        Ok(response) => {
            write_upstream_response(stream, &response).await;
            if parsed.method == "GET" && (200..300).contains(&response.status) {
                let content_type = response
                    .headers
                    .iter()
                    .find(|h| h.to_lowercase().starts_with("content-type:"))
                    .map(|h| h.splitn(2, ':').nth(1).unwrap_or("").trim().to_string());
                match cache.insert(key.clone(), response.body.clone(), content_type).await {
                    Ok(()) => info!(key = %key, "pipeline: cached"),
                    Err(reason) => warn!(key = %key, ?reason, "pipeline: cache rejected"),
                }
            }
        }
        Err(kind) => write_error(stream, kind).await,
    }
}

async fn read_request<S>(stream: &mut S) -> Result<BytesMut, ErrorKind>
where
    S: AsyncReadExt + Unpin,
{
    let mut buffer = BytesMut::with_capacity(8192);
    loop {
        let n = stream
            .read_buf(&mut buffer)
            .await
            .map_err(|_| ErrorKind::ClientBadRequest)?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(ErrorKind::Internal);
            }
            break;
        }
        if buffer.len() > MAX_BYTES {
            return Err(ErrorKind::ClientBadRequest);
        }
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(buffer)
}

fn parse_and_validate(data: &[u8]) -> Result<ParsedRequest, ErrorKind> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut raw_headers);

    let status = req.parse(data).map_err(|err| match err {
        // httparse only accepts HTTP/1.0 and HTTP/1.1 request lines; any
        // other well-formed version token (HTTP/0.9, HTTP/2.0, ...) fails
        // parsing here with req.version never populated, before the
        // version check below ever runs.
        httparse::Error::Version => ErrorKind::VersionUnsupported,
        _ => ErrorKind::ClientBadRequest,
    })?;
    if matches!(status, httparse::Status::Partial) {
        return Err(ErrorKind::ClientBadRequest);
    }

    let method = req.method.ok_or(ErrorKind::ClientBadRequest)?.to_string();
    let target = req.path.ok_or(ErrorKind::ClientBadRequest)?.to_string();
    if !matches!(req.version, Some(0) | Some(1)) {
        return Err(ErrorKind::VersionUnsupported);
    }

    let headers: Vec<String> = req
        .headers
        .iter()
        .map(|h| format!("{}: {}", h.name, String::from_utf8_lossy(h.value)))
        .collect();

    if method != "GET" {
        return Err(ErrorKind::MethodNotImplemented);
    }

    let normalized_target = cache::normalize_key(&target);
    let (host, port, path) = parse_absolute_target(&normalized_target)?;

    Ok(ParsedRequest {
        method,
        target: normalized_target,
        host,
        port,
        path,
        headers,
    })
}

/// Splits an absolute-form request target into `(host, port, path)`,
/// defaulting to port 80 when omitted. Fails if the target lacks a scheme
/// or host, per spec.md §4.4.
fn parse_absolute_target(target: &str) -> Result<(String, u16, String), ErrorKind> {
    let rest = target
        .strip_prefix("http://")
        .ok_or(ErrorKind::ClientBadRequest)?;
    if rest.is_empty() {
        return Err(ErrorKind::ClientBadRequest);
    }

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(ErrorKind::ClientBadRequest);
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str.parse::<u16>().map_err(|_| ErrorKind::ClientBadRequest)?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), 80u16),
    };

    Ok((host, port, path.to_string()))
}

async fn write_error<S>(stream: &mut S, kind: ErrorKind)
where
    S: AsyncWriteExt + Unpin,
{
    let date = httpdate_now();
    let _ = stream.write_all(&kind.render(&date)).await;
}

async fn write_cache_hit<S>(stream: &mut S, entry: &cache::CacheEntry)
where
    S: AsyncWriteExt + Unpin,
{
    let content_type = entry.content_type.as_deref().unwrap_or("text/html");
    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Date: {}\r\n\
         Server: NodeProxy/1.0\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        httpdate_now(),
        entry.body.len(),
    );
    if stream.write_all(header.as_bytes()).await.is_err() {
        return;
    }
    let _ = stream.write_all(&entry.body).await;
}

async fn write_upstream_response<S>(stream: &mut S, response: &fetcher::FetchedResponse)
where
    S: AsyncWriteExt + Unpin,
{
    let mut header = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
    for line in &response.headers {
        if line.to_lowercase().starts_with("connection:") {
            continue;
        }
        header.push_str(line);
        header.push_str("\r\n");
    }
    header.push_str("Connection: close\r\n\r\n");
    if stream.write_all(header.as_bytes()).await.is_err() {
        return;
    }
    let _ = stream.write_all(&response.body).await;
}

pub(crate) fn httpdate_now() -> String {
    // A minimal RFC 7231 IMF-fixdate renderer: no chrono dependency, matching
    // the teacher's avoidance of a datetime crate for a single header value.
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_imf_fixdate(secs)
}

fn format_imf_fixdate(epoch_secs: u64) -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let days_since_epoch = epoch_secs / 86400;
    let secs_of_day = epoch_secs % 86400;
    let (hour, minute, second) = (secs_of_day / 3600, (secs_of_day / 60) % 60, secs_of_day % 60);
    let weekday = DAYS[((days_since_epoch + 4) % 7) as usize]; // 1970-01-01 was a Thursday

    let mut days = days_since_epoch as i64;
    let mut year = 1970i64;
    loop {
        let year_days = if is_leap_year(year) { 366 } else { 365 };
        if days < year_days {
            break;
        }
        days -= year_days;
        year += 1;
    }

    let month_lengths = [
        31,
        if is_leap_year(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0;
    while days >= month_lengths[month] {
        days -= month_lengths[month];
        month += 1;
    }
    let day = days + 1;

    format!(
        "{weekday}, {day:02} {month} {year} {hour:02}:{minute:02}:{second:02} GMT",
        month = MONTHS[month],
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
