//! End-to-end scenarios from the request pipeline's testable properties:
//! cold/warm speedup, oversize rejection, delayed responses, method/version
//! rejection, admission saturation, and the CONNECT tunnel.

use fwdcache::server::{ProxyConfig, Server};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_origin(body: &'static [u8], delay: Duration) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(body).await;
            });
        }
    });
    addr
}

async fn start_server(mut config: ProxyConfig) -> (Arc<Server>, std::net::SocketAddr) {
    // Bind to an ephemeral port by asking the OS, then hand the same port
    // numbers to the server config.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_port = probe.local_addr().unwrap().port();
    drop(probe);
    config.http_port = http_port;
    config.raw_port = http_port + 1;

    let server = Arc::new(Server::new(config));
    let server_clone = server.clone();
    tokio::spawn(async move {
        let _ = server_clone.run().await;
    });
    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (server, ([127, 0, 0, 1], http_port).into())
}

async fn send_request(proxy_addr: std::net::SocketAddr, request: &str) -> (String, Duration) {
    let start = Instant::now();
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    (String::from_utf8_lossy(&response).to_string(), start.elapsed())
}

#[tokio::test]
async fn cold_then_warm_request_is_faster_on_repeat() {
    let origin_addr = start_origin(b"Hello from test server!", Duration::ZERO).await;
    let (server, proxy_addr) = start_server(ProxyConfig::default()).await;

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port(),
        origin_addr.port()
    );

    let (first_body, first_elapsed) = send_request(proxy_addr, &request).await;
    assert!(first_body.contains("Hello from test server!"));
    assert!(first_body.starts_with("HTTP/1.1 200"));

    let (second_body, second_elapsed) = send_request(proxy_addr, &request).await;
    assert!(second_body.contains("Hello from test server!"));
    assert!(second_elapsed <= first_elapsed);

    server.shutdown();
}

#[tokio::test]
async fn oversize_upstream_body_is_rejected_and_not_cached() {
    let big_body: &'static [u8] = Box::leak(vec![b'x'; 5 * 1024 * 1024].into_boxed_slice());
    let origin_addr = start_origin(big_body, Duration::ZERO).await;

    let mut config = ProxyConfig::default();
    config.pipeline.fetch.max_response_bytes = 4096;
    let (server, proxy_addr) = start_server(config).await;

    let request = format!(
        "GET http://127.0.0.1:{}/big HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port(),
        origin_addr.port()
    );
    let (body, _) = send_request(proxy_addr, &request).await;
    assert!(body.starts_with("HTTP/1.1 413"));
    assert_eq!(server.cache().len().await, 0);

    server.shutdown();
}

#[tokio::test]
async fn delayed_origin_response_preserves_latency() {
    let origin_addr = start_origin(b"Delayed response", Duration::from_millis(1000)).await;
    let (server, proxy_addr) = start_server(ProxyConfig::default()).await;

    let request = format!(
        "GET http://127.0.0.1:{}/slow HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port(),
        origin_addr.port()
    );
    let (body, elapsed) = send_request(proxy_addr, &request).await;
    assert!(body.contains("Delayed response"));
    assert!(elapsed >= Duration::from_millis(1000));

    server.shutdown();
}

#[tokio::test]
async fn non_get_method_is_rejected_with_501() {
    let (server, proxy_addr) = start_server(ProxyConfig::default()).await;
    let request = "POST http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (body, _) = send_request(proxy_addr, request).await;
    assert!(body.starts_with("HTTP/1.1 501"));
    assert!(body.contains("<html"));
    server.shutdown();
}

#[tokio::test]
async fn unsupported_version_is_rejected_with_505() {
    let (server, proxy_addr) = start_server(ProxyConfig::default()).await;
    let request = "GET http://example.com/ HTTP/2.0\r\nHost: example.com\r\n\r\n";
    let (body, _) = send_request(proxy_addr, request).await;
    assert!(body.starts_with("HTTP/1.1 505"));
    server.shutdown();
}

#[tokio::test]
async fn fifth_request_hits_503_when_admission_saturated() {
    let origin_addr = start_origin(b"slow", Duration::from_millis(500)).await;

    let mut config = ProxyConfig::default();
    config.max_concurrent = 4;
    config.admission_timeout = Duration::from_millis(100);
    let (server, proxy_addr) = start_server(config).await;

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port(),
        origin_addr.port()
    );

    let mut handles = Vec::new();
    for _ in 0..4 {
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            send_request(proxy_addr, &request).await
        }));
    }
    // Give the first four time to be admitted before the fifth arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (fifth_body, _) = send_request(proxy_addr, &request).await;
    assert!(fifth_body.starts_with("HTTP/1.1 503"));

    for h in handles {
        let _ = h.await;
    }
    server.shutdown();
}

#[tokio::test]
async fn connect_establishes_a_tunnel_on_the_raw_port() {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target_listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = target_listener.accept().await {
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let _ = stream.write_all(&buf[..n]).await;
        }
    });

    let (server, proxy_addr) = start_server(ProxyConfig::default()).await;
    let raw_port = proxy_addr.port() + 1;

    let mut client = TcpStream::connect(("127.0.0.1", raw_port)).await.unwrap();
    let connect_line = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
        target_addr.ip(),
        target_addr.port(),
        target_addr.ip(),
        target_addr.port()
    );
    client.write_all(connect_line.as_bytes()).await.unwrap();

    let mut preamble = [0u8; fwdcache::tunnel::ESTABLISHED.len()];
    client.read_exact(&mut preamble).await.unwrap();
    assert_eq!(&preamble, fwdcache::tunnel::ESTABLISHED);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    server.shutdown();
}
