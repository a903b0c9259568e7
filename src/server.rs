//! The explicit owning server value (spec.md §9, "Global singletons" design
//! note): owns the cache, admission gate, and both listener tasks with an
//! explicit start/shutdown lifecycle, so more than one instance is usable
//! in a single process (tests spin up several on distinct ports).

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionGate;
use crate::cache::Cache;
use crate::listener as raw_listener;
use crate::pipeline::{self, PipelineConfig};

/// All the tunable knobs a deployment might override, collected in one
/// place per SPEC_FULL.md's "Configuration" section — a plain struct with
/// `Default`, no env vars, no CLI-parsing crate.
#[derive(Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    pub raw_port: u16,
    pub max_concurrent: usize,
    pub admission_timeout: Duration,
    pub cache_entries: usize,
    pub cache_bytes_cap: usize,
    pub entry_bytes_cap: usize,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub pipeline: PipelineConfig,
}

impl ProxyConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            http_port: port,
            raw_port: port + 1,
            ..Default::default()
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            raw_port: 8081,
            max_concurrent: 100,
            admission_timeout: Duration::from_secs(5),
            cache_entries: crate::cache::DEFAULT_CACHE_ENTRIES,
            cache_bytes_cap: crate::cache::DEFAULT_CACHE_BYTES,
            entry_bytes_cap: crate::cache::DEFAULT_ENTRY_BYTES,
            cache_ttl: crate::cache::DEFAULT_TTL,
            sweep_interval: crate::cache::DEFAULT_SWEEP_INTERVAL,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Owns the cache, the admission gate, and the two listening sockets.
pub struct Server {
    config: ProxyConfig,
    cache: Cache,
    gate: AdmissionGate,
    shutdown: Arc<Notify>,
}

impl Server {
    pub fn new(config: ProxyConfig) -> Self {
        let cache = Cache::new(
            config.cache_entries,
            config.cache_bytes_cap,
            config.entry_bytes_cap,
            config.cache_ttl,
        );
        let gate = AdmissionGate::new(config.max_concurrent);
        Self {
            config,
            cache,
            gate,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Binds both listeners and runs until `shutdown()` is called. Returns
    /// once both accept loops have stopped and in-flight requests have
    /// drained (bounded by the global timeouts, per spec.md §5).
    pub async fn run(&self) -> std::io::Result<()> {
        let http_listener = TcpListener::bind(("0.0.0.0", self.config.http_port)).await?;
        let raw_listener_socket = TcpListener::bind(("0.0.0.0", self.config.raw_port)).await?;
        info!(
            http_port = self.config.http_port,
            raw_port = self.config.raw_port,
            "server: listening"
        );

        let sweeper = self.cache.spawn_sweeper(self.config.sweep_interval);

        let http_task = self.accept_loop(http_listener, false);
        let raw_task = self.accept_loop(raw_listener_socket, true);

        tokio::select! {
            _ = http_task => {}
            _ = raw_task => {}
            _ = self.shutdown.notified() => {
                info!("server: shutdown requested, draining");
            }
        }

        sweeper.abort();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn accept_loop(&self, listener: TcpListener, raw: bool) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    error!("server: accept failed: {err}");
                    continue;
                }
            };
            debug!(%addr, raw, "server: accepted connection");

            let cache = self.cache.clone();
            let gate = self.gate.clone();
            let pipeline_config = self.config.pipeline.clone();
            let admission_timeout = self.config.admission_timeout;

            tokio::spawn(async move {
                handle_connection(stream, cache, gate, pipeline_config, admission_timeout, raw).await;
            });
        }
    }
}

/// Admits, dispatches to the right handler, and guarantees the admission
/// slot is released exactly once regardless of how the handler exits —
/// the `Admitted` guard's `Drop` does that, even on a panic unwind.
async fn handle_connection(
    mut stream: TcpStream,
    cache: Cache,
    gate: AdmissionGate,
    pipeline_config: PipelineConfig,
    admission_timeout: Duration,
    raw: bool,
) {
    let _admitted = match gate.acquire(admission_timeout).await {
        Ok(admitted) => admitted,
        Err(kind) => {
            warn!(?raw, "server: admission refused: {kind}");
            let date = pipeline::httpdate_now();
            let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, &kind.render(&date)).await;
            return;
        }
    };

    if raw {
        raw_listener::handle(stream, cache, pipeline_config).await;
    } else {
        pipeline::handle(&mut stream, &cache, &pipeline_config).await;
    }
}
