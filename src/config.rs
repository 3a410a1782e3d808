//! Engine-wide tunables (spec §4 throughout): connection caps, pipeline
//! depth, endgame threshold, DHT constants, listen port, and the queue/state
//! knobs §4.13/§4.14 name. `Settings` is `Default`-constructed with the
//! spec's recommended numbers and can be overridden either programmatically
//! (embedding the engine) or via the `rstc` CLI flags in [`crate::main`].
use clap::Args;
use std::path::PathBuf;

/// Tunables shared by every component. Cloned freely; it is small and
/// immutable once the engine starts (spec §9: "endgame threshold and
/// per-peer request pipeline depth are tunables ... not required" to be
/// fixed constants).
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// TCP peer-wire listen port and UDP DHT port (spec §6).
    #[arg(long, default_value_t = 6881)]
    pub listen_port: u16,

    /// Max simultaneous peer-wire connections per torrent (spec §4.11).
    #[arg(long, default_value_t = 50)]
    pub max_connections_per_torrent: usize,

    /// Max simultaneous connections to a single source IP (spec §4.11).
    #[arg(long, default_value_t = 3)]
    pub max_connections_per_ip: usize,

    /// Outstanding block requests per peer (spec §4.10).
    #[arg(long, default_value_t = 5)]
    pub per_peer_pipeline_depth: usize,

    /// Remaining-pieces threshold that switches a torrent into endgame
    /// mode (spec §4.10).
    #[arg(long, default_value_t = 20)]
    pub endgame_threshold: usize,

    /// Kademlia bucket capacity `k` (spec §4.6/§4.7).
    #[arg(long, default_value_t = 8)]
    pub dht_k: usize,

    /// Kademlia lookup concurrency `alpha` (spec §4.7).
    #[arg(long, default_value_t = 3)]
    pub dht_alpha: usize,

    /// Torrents allowed to be simultaneously active (spec §4.13).
    #[arg(long, default_value_t = 5)]
    pub max_concurrent_torrents: usize,

    /// Upload rate cap in bytes/sec, 0 = unlimited (exposed via the
    /// persisted `settings.globalUploadLimit` field, spec §6).
    #[arg(long, default_value_t = 0)]
    pub global_upload_limit: u64,

    /// Download rate cap in bytes/sec, 0 = unlimited (persisted
    /// `settings.globalDownloadLimit`, spec §6).
    #[arg(long, default_value_t = 0)]
    pub global_download_limit: u64,

    /// Re-hash every completed piece on resume instead of trusting the
    /// persisted `completedPieces` list (spec §4.15, scenario S6).
    #[arg(long, default_value_t = false)]
    pub verify_on_resume: bool,

    /// Number of rotated state-file backups to keep (spec §4.14).
    #[arg(long, default_value_t = 3)]
    pub state_backup_count: usize,

    /// How often the state manager persists when dirty (spec §4.14).
    #[arg(skip = 30u64)]
    pub auto_save_interval_secs: u64,

    /// Directory holding `state.json` and its backups, and the default
    /// root under which per-torrent download directories are created.
    #[arg(long, default_value = "./rstorrent-data")]
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections_per_torrent: 50,
            max_connections_per_ip: 3,
            per_peer_pipeline_depth: 5,
            endgame_threshold: 20,
            dht_k: 8,
            dht_alpha: 3,
            max_concurrent_torrents: 5,
            global_upload_limit: 0,
            global_download_limit: 0,
            verify_on_resume: false,
            state_backup_count: 3,
            auto_save_interval_secs: 30,
            data_dir: PathBuf::from("./rstorrent-data"),
        }
    }
}

impl Settings {
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recommendations() {
        let settings = Settings::default();
        assert_eq!(settings.max_connections_per_torrent, 50);
        assert_eq!(settings.max_connections_per_ip, 3);
        assert_eq!(settings.per_peer_pipeline_depth, 5);
        assert_eq!(settings.endgame_threshold, 20);
        assert_eq!(settings.dht_k, 8);
        assert_eq!(settings.dht_alpha, 3);
    }
}
