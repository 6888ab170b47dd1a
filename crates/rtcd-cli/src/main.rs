//! rtcd UDP reflector
//!
//! Binds the multiplexed UDP socket pool the media relay listens on and
//! echoes every datagram back to its sender. Useful for checking that a host
//! spreads ICE traffic over the pool and that replies leave from the local
//! address the peer originally reached.

mod config;

use clap::{Parser, Subcommand};
use rtcd_transport::{MultiConn, Transport, TransportError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;

/// rtcd - multiplexed UDP transport
#[derive(Parser)]
#[command(name = "rtcd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "rtcd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind the UDP socket pool and echo datagrams back to their senders
    Serve {
        /// Seconds between traffic reports (0 disables them)
        #[arg(long, default_value = "10")]
        stats_interval: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over the flags
    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)?;
    config.validate()?;

    match cli.command {
        Commands::Serve { stats_interval } => {
            serve(&config, Duration::from_secs(stats_interval)).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Run the reflector until Ctrl+C
async fn serve(config: &Config, stats_interval: Duration) -> anyhow::Result<()> {
    let transport = Arc::new(MultiConn::bind(&config.transport)?);
    let local_addr = transport.local_addr()?;

    tracing::info!(
        "Reflector listening on {} with {} socket(s)",
        local_addr,
        transport.conn_count()
    );
    println!("rtcd reflector");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listening on: {local_addr}");
    println!("Sockets: {}", transport.conn_count());
    println!();
    println!("Ready. Press Ctrl+C to stop");

    let reflector = tokio::spawn(reflect(Arc::clone(&transport)));
    let reporter = (!stats_interval.is_zero())
        .then(|| tokio::spawn(report_stats(Arc::clone(&transport), stats_interval)));

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    let close_result = transport.close().await;
    let echoed = reflector.await?;
    close_result?;

    let stats = transport.stats();
    tracing::info!(
        "Reflector stopped: {} datagram(s) echoed, {} received, {} receive error(s)",
        echoed,
        stats.packets_received,
        stats.recv_errors
    );
    println!("Reflector stopped");

    Ok(())
}

/// Echo loop; returns the number of datagrams echoed once the transport closes.
async fn reflect(transport: Arc<MultiConn>) -> u64 {
    let mut buf = vec![0u8; transport.buffer_pool().buffer_size()];
    let mut echoed = 0;

    loop {
        let (n, peer) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(TransportError::Closed) => break,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                // One socket retired; the rest of the pool keeps serving.
                tracing::warn!("Receive failed: {}", e);
                continue;
            }
        };

        match transport.send_to(&buf[..n], peer).await {
            Ok(_) => echoed += 1,
            Err(TransportError::Closed) => break,
            Err(e) => tracing::warn!("Failed to echo {} byte(s) to {}: {}", n, peer, e),
        }
    }

    echoed
}

/// Periodic traffic report
async fn report_stats(transport: Arc<MultiConn>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = transport.stats();
        println!(
            "Status: {} packets in ({} bytes), {} packets out ({} bytes), {} peers",
            stats.packets_received,
            stats.bytes_received,
            stats.packets_sent,
            stats.bytes_sent,
            transport.affinity().len()
        );
    }
}
