use fwdcache::{ProxyConfig, Server};
use tracing::info;

const DEFAULT_PORT: u16 = 8080;

/// Reads the single positional CLI argument (port, default 8080). No env
/// vars, no CLI-parsing dependency — the whole surface is one optional
/// integer, the way the teacher crate never reaches for a flags library
/// either.
fn parse_port() -> u16 {
    std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fwdcache=info".parse()?),
        )
        .init();

    let port = parse_port();
    let config = ProxyConfig::with_port(port);
    info!(http_port = config.http_port, raw_port = config.raw_port, "fwdcache starting");

    let server = Server::new(config);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            server.shutdown();
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}
