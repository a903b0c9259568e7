//! Bidirectional tunnel (C6): opaque byte bridge for `CONNECT` requests.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default port used when a `CONNECT` target omits one.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;
/// Default idle-read timeout before a tunnel half is torn down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Connects to `host:port`, writes the established-tunnel preamble to
/// `client`, then bridges bytes both ways until either side closes, errors,
/// or the idle timeout fires. No data is interpreted or cached.
pub async fn run(mut client: TcpStream, host: &str, port: u16, idle_timeout: Duration) {
    let upstream = match timeout(Duration::from_secs(10), TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(host, port, "tunnel: connect failed: {err}");
            let _ = client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return;
        }
        Err(_) => {
            warn!(host, port, "tunnel: connect timed out");
            let _ = client
                .write_all(b"HTTP/1.1 504 Gateway Timeout\r\n\r\n")
                .await;
            return;
        }
    };

    if client.write_all(ESTABLISHED).await.is_err() {
        return;
    }

    let mut upstream = upstream;
    match timeout(
        idle_timeout,
        tokio::io::copy_bidirectional(&mut client, &mut upstream),
    )
    .await
    {
        Ok(Ok((to_upstream, to_client))) => {
            debug!(host, port, to_upstream, to_client, "tunnel: closed");
        }
        Ok(Err(err)) => {
            debug!(host, port, "tunnel: bridge error, tearing down both halves: {err}");
        }
        Err(_) => {
            debug!(host, port, "tunnel: idle timeout, tearing down both halves");
        }
    }
}

/// Parses a `CONNECT` target of the form `host:port`, defaulting the port.
pub fn parse_target(target: &str) -> Option<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port)) => port
            .parse::<u16>()
            .ok()
            .map(|port| (host.to_string(), port)),
        None => Some((target.to_string(), DEFAULT_TUNNEL_PORT)),
    }
}
