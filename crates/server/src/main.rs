//! Shroud server - untrusted key-value store for encrypted record sharing
//!
//! Holds opaque blobs under hex identifiers and hands each client a
//! membership filter snapshot on connect. It never sees plaintext.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::membership::BloomFilter;
use common::protocol::KvHandler;

mod config;

use config::ServerConfig;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shroud server - untrusted key-value store for encrypted record sharing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file (defaults to ~/.config/shroud/server.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Largest accepted request frame in bytes, overrides the config file
    #[arg(long)]
    max_frame_size: Option<u32>,

    /// Log level (error, warn, info, debug, trace), overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(max_frame_size) = args.max_frame_size {
        config.max_frame_size = max_frame_size;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    config.validate()?;

    // Initialize tracing
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let log_level: tracing::Level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stdout_layer).init();

    tracing::info!("Starting Shroud server ({})", config.protocol_version);

    let filter = BloomFilter::new(
        config.filter_expected_items,
        config.filter_false_positive_rate,
    );
    tracing::debug!(
        "membership filter: {} bits, {} hashes",
        filter.num_bits(),
        filter.num_hashes()
    );
    let handler = KvHandler::new(filter, config.protocol_version.clone());

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl+c: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    run(listener, handler, config.max_frame_size, shutdown_rx).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Accept sessions until `shutdown` fires, then give open sessions a
/// moment to finish
async fn run(
    listener: TcpListener,
    handler: KvHandler<BloomFilter>,
    max_frame_size: u32,
    mut shutdown: watch::Receiver<()>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    sessions.spawn(session(handler, stream, peer, max_frame_size));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    tracing::info!("waiting on {} open sessions", sessions.len());
    let drain = async { while sessions.join_next().await.is_some() {} };
    if tokio::time::timeout(FINAL_SHUTDOWN_TIMEOUT, drain).await.is_err() {
        sessions.abort_all();
    }
}

async fn session(
    handler: KvHandler<BloomFilter>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_size: u32,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay for {}: {}", peer, e);
    }
    tracing::debug!("session from {}", peer);
    match handler.serve(stream, max_frame_size).await {
        Ok(()) => tracing::debug!("session from {} closed", peer),
        Err(e) => tracing::warn!("session from {} ended: {}", peer, e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::protocol::{Connection, ConnectionConfig, GetResult, PutResult};

    fn key_for(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    #[tokio::test]
    async fn test_tcp_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = KvHandler::new(BloomFilter::new(1000, 0.01), "shroud/1");
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let server = tokio::spawn(run(listener, handler.clone(), 1 << 20, shutdown_rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn: Connection<_, BloomFilter> =
            Connection::connect(stream, ConnectionConfig::default())
                .await
                .unwrap();
        let key = key_for(7);
        assert_eq!(conn.put(&key, b"blob".to_vec()).await.unwrap(), PutResult::Ok);
        assert_eq!(
            conn.get(&key).await.unwrap(),
            GetResult::Found(b"blob".to_vec())
        );
        conn.disconnect().await.unwrap();
        assert!(handler.contains(&key));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }
}
