//! `rstc`: a CLI binary that exercises the engine's control interface
//! directly, standing in for the out-of-scope HTTP API/UI (spec §6). Adds
//! one torrent, prints throttled progress as it downloads, and shuts down
//! cleanly on completion or Ctrl-C.
use clap::Parser;
use rstorrent::config::Settings;
use rstorrent::engine::{AddOptions, Engine};
use rstorrent::torrent::{TorrentEvent, TorrentSource};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rstc", about = "A BitTorrent client engine")]
struct Cli {
    /// Magnet URI or path to a `.torrent` file.
    source: String,

    /// Directory to save downloaded files into; defaults under the data dir.
    #[arg(long)]
    out: Option<PathBuf>,

    #[command(flatten)]
    settings: Settings,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn parse_source(raw: &str) -> TorrentSource {
    if raw.starts_with("magnet:") {
        TorrentSource::Magnet(raw.to_string())
    } else {
        TorrentSource::File(PathBuf::from(raw))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "rstorrent=info,rstc=info".into()))
        .init();

    let cli = Cli::parse();
    let mut engine = Engine::new(cli.settings);

    if let Err(err) = engine.initialize().await {
        warn!(%err, "engine initialization failed");
        return;
    }

    let source = parse_source(&cli.source);
    let options = AddOptions { download_path: cli.out, ..Default::default() };
    let info_hash = match engine.add(source, options, now_ms()).await {
        Ok(h) => h,
        Err(err) => {
            warn!(%err, "failed to add torrent");
            return;
        }
    };
    info!(%info_hash, "torrent added");

    let mut events = engine.take_event_stream().expect("event stream taken once");
    let mut done = false;
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
    let autosave_interval = std::time::Duration::from_secs(cli.settings.auto_save_interval_secs.max(1));
    let mut autosave_tick = tokio::time::interval(autosave_interval);

    while !done {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(tagged) = maybe_event else { break };
                if tagged.info_hash != info_hash {
                    continue;
                }
                match tagged.event {
                    TorrentEvent::Progress(stats) => {
                        println!(
                            "[{}] {}/{} pieces, {} peers, {:.1} KiB/s down",
                            info_hash,
                            stats.completed_pieces,
                            stats.num_pieces,
                            stats.connected_peers,
                            stats.download_rate_bps as f64 / 1024.0,
                        );
                    }
                    TorrentEvent::Completed => {
                        println!("[{info_hash}] download complete");
                        engine.notify_lifecycle_event();
                        done = true;
                    }
                    TorrentEvent::Error { reason } => {
                        warn!(%reason, "torrent failed");
                        engine.notify_lifecycle_event();
                        done = true;
                    }
                    TorrentEvent::Paused | TorrentEvent::Resumed | TorrentEvent::Piece { .. } => {
                        engine.notify_lifecycle_event();
                    }
                    _ => {}
                }
            }
            _ = autosave_tick.tick() => {
                if let Err(err) = engine.autosave_if_dirty(now_ms(), autosave_interval).await {
                    warn!(%err, "autosave failed");
                }
            }
            _ = &mut ctrl_c => {
                info!("received Ctrl-C, shutting down");
                done = true;
            }
        }
    }

    if let Err(err) = engine.shutdown(now_ms()).await {
        warn!(%err, "engine shutdown reported an error");
    }
}
