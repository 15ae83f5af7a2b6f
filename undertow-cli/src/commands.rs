//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Subcommand;
use rand::seq::SliceRandom;
use undertow_core::config::UndertowConfig;
use undertow_core::engine::{PieceIndex, SimulatedSession, TorrentHandle};
use undertow_core::{Services, SourceMode};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Read and wait on pieces of a simulated torrent while it downloads
    Demo {
        /// Number of pieces in the simulated torrent
        #[arg(short, long, default_value = "8")]
        pieces: usize,
        /// Pieces to read, in the order they should be yielded
        #[arg(short, long, value_delimiter = ',', default_value = "2,0,1")]
        read: Vec<i32>,
        /// Alert readiness mode (auto, notify, thread)
        #[arg(long)]
        source: Option<SourceMode>,
        /// Delay between simulated piece completions
        #[arg(long, default_value = "50")]
        delay_ms: u64,
        /// Bitmap poll period for the waiter
        #[arg(long, default_value = "100")]
        poll_ms: u64,
        /// Remove the torrent after this many pieces complete
        #[arg(long)]
        remove_after: Option<usize>,
    },
    /// Print the effective configuration after environment overrides
    Config,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first failure of the command
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Demo {
            pieces,
            read,
            source,
            delay_ms,
            poll_ms,
            remove_after,
        } => {
            let options = DemoOptions {
                pieces,
                read: read.into_iter().map(PieceIndex).collect(),
                source,
                delay: Duration::from_millis(delay_ms),
                poll_interval: Duration::from_millis(poll_ms),
                remove_after,
            };
            run_demo(options).await
        }
        Commands::Config => {
            show_config();
            Ok(())
        }
    }
}

struct DemoOptions {
    pieces: usize,
    read: Vec<PieceIndex>,
    source: Option<SourceMode>,
    delay: Duration,
    poll_interval: Duration,
    remove_after: Option<usize>,
}

/// Starts the services, downloads a simulated torrent in random order, and
/// prints what a reader and a waiter see side by side.
///
/// # Errors
/// - `UndertowError::Configuration` - Environment overrides produced an invalid config
/// - `UndertowError::Alert` - No alert source could be opened for the chosen mode
async fn run_demo(options: DemoOptions) -> anyhow::Result<()> {
    let mut config = UndertowConfig::from_env();
    if let Some(mode) = options.source {
        config.alerts.source_mode = mode;
    }

    let engine = Arc::new(SimulatedSession::new());
    let services = Services::start(config, engine.clone()).context("Failed to start services")?;

    let payloads = (0..options.pieces)
        .map(|i| Bytes::from(format!("piece {i} payload")))
        .collect();
    let handle = engine.add_torrent("demo", payloads);
    println!(
        "Added {} ({} pieces), reading {:?}",
        handle,
        options.pieces,
        options.read.iter().map(|p| p.as_i32()).collect::<Vec<_>>()
    );

    let scheduler = Arc::clone(services.scheduler());
    let mut reader = scheduler.read_pieces(handle, options.read.clone());
    let mut waiter = scheduler
        .wait_pieces(handle, options.read.clone(), options.poll_interval)
        .await?;

    let feeder = tokio::spawn(feed_pieces(
        Arc::clone(&engine),
        handle,
        options.pieces,
        options.delay,
        options.remove_after,
    ));

    let read_side = async {
        while let Some(result) = reader.next().await {
            match result {
                Ok(piece) => println!(
                    "  read  {:>3}: {}",
                    piece.piece.as_i32(),
                    String::from_utf8_lossy(&piece.data)
                ),
                Err(e) => {
                    println!("  read  failed: {e}");
                    break;
                }
            }
        }
    };
    let wait_side = async {
        while let Some(result) = waiter.next().await {
            match result {
                Ok(piece) => println!("  wait  {:>3}: available", piece.as_i32()),
                Err(e) => {
                    println!("  wait  failed: {e}");
                    break;
                }
            }
        }
    };
    tokio::join!(read_side, wait_side);
    drop(reader);
    drop(waiter);

    feeder.abort();
    let _ = feeder.await;

    println!("Windows still tracked: {}", scheduler.window_count());
    services.shutdown().await?;
    Ok(())
}

/// Completes every piece in random order, optionally removing the torrent
/// part way through.
async fn feed_pieces(
    engine: Arc<SimulatedSession>,
    handle: TorrentHandle,
    count: usize,
    delay: Duration,
    remove_after: Option<usize>,
) {
    let mut order: Vec<i32> = (0..count as i32).collect();
    order.shuffle(&mut rand::rng());

    for (done, index) in order.into_iter().enumerate() {
        if remove_after == Some(done) {
            tracing::info!("Removing {} after {} pieces", handle, done);
            if let Err(e) = engine.remove_torrent(handle) {
                tracing::warn!("Failed to remove {}: {}", handle, e);
            }
            return;
        }
        tokio::time::sleep(delay).await;
        if let Err(e) = engine.feed_piece(handle, PieceIndex(index)) {
            tracing::warn!("Failed to complete piece {}: {}", index, e);
            return;
        }
        tracing::debug!("Completed piece {}", index);
    }
}

fn show_config() {
    let config = UndertowConfig::from_env();
    println!("Alerts");
    println!("{:-<40}", "");
    println!("  source mode:    {}", config.alerts.source_mode);
    println!("  thread wait:    {:?}", config.alerts.thread_wait);
    println!("  stall timeout:  {:?}", config.alerts.stall_timeout);
    println!("  static mask:    {}", config.alerts.alert_mask);
    println!("Scheduler");
    println!("{:-<40}", "");
    println!("  read window:    {}", config.scheduler.read_window);
    println!("  piece deadline: {:?}", config.scheduler.piece_deadline);
    println!("  poll interval:  {:?}", config.scheduler.poll_interval);
    if let Err(e) = config.validate() {
        println!("\nWarning: {}", e.user_message());
    }
}
