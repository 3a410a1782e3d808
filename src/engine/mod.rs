//! Top-level façade wiring C12–C14 and the global DHT (spec §4.15).
//! Grounded on the teacher's absence of a multi-torrent façade: shaped
//! after `Torrent`'s own actor (typed commands in, aggregated events out)
//! but driven directly by `&mut self` methods rather than a `tokio::select!`
//! loop of its own, since the engine's only genuinely concurrent inputs
//! (the event aggregation channel, the inbound listener) are each already
//! their own task; `Engine` itself just needs `&mut self` call/await.
use crate::config::Settings;
use crate::dht::DhtNode;
use crate::error::{EngineError, EngineResult};
use crate::ids::{InfoHash, PeerId};
use crate::queue::QueueManager;
use crate::state::{EngineStateFile, PersistedSettings, PersistedTorrent, SourceDoc, StateManager};
use crate::torrent::{
    FileSelection, Priority, SpawnParams, TaggedTorrentEvent, Torrent, TorrentCommand, TorrentHandle, TorrentSource,
    TorrentStats,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAP: usize = 1024;

/// Options accompanying `add` (spec §6 `add_torrent`).
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub download_path: Option<PathBuf>,
    pub priority: Priority,
    pub file_selection: FileSelection,
}

struct ManagedTorrent {
    handle: TorrentHandle,
    join: tokio::task::JoinHandle<()>,
    source: TorrentSource,
    download_path: PathBuf,
    priority: Priority,
    added_at: i64,
}

/// Owns every running [`Torrent`], the global [`QueueManager`],
/// [`StateManager`], and (once initialized) a single shared [`DhtNode`] and
/// inbound peer-wire [`TcpListener`] (spec §4.15).
pub struct Engine {
    settings: Arc<Settings>,
    our_peer_id: PeerId,
    torrents: HashMap<InfoHash, ManagedTorrent>,
    queue: QueueManager,
    state_mgr: StateManager,
    dht: Option<DhtNode>,
    events_tx: mpsc::Sender<TaggedTorrentEvent>,
    events_rx: Option<mpsc::Receiver<TaggedTorrentEvent>>,
    listener_handle: Option<tokio::task::JoinHandle<()>>,
    /// Routing table for the shared inbound listener: which torrent a
    /// newly-handshaken connection belongs to, keyed by the info_hash it
    /// named. `None` until [`Self::initialize`] successfully binds the
    /// listener.
    inbound_handles: Option<Arc<tokio::sync::Mutex<HashMap<InfoHash, TorrentHandle>>>>,
    shutting_down: bool,
    /// Set by every control-plane mutation (spec §4.14 "auto-save every 30s
    /// only when dirty"); cleared on a successful [`Self::save_state`].
    dirty: bool,
    last_autosave_at: Option<std::time::Instant>,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let queue = QueueManager::new(settings.max_concurrent_torrents);
        let state_mgr = StateManager::new(settings.state_dir(), settings.state_backup_count);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        Self {
            settings,
            our_peer_id: PeerId::generate(),
            torrents: HashMap::new(),
            queue,
            state_mgr,
            dht: None,
            events_tx,
            events_rx: Some(events_rx),
            listener_handle: None,
            inbound_handles: None,
            shutting_down: false,
            dirty: false,
            last_autosave_at: None,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Takes the aggregated event receiver; callable once, mirroring
    /// `mpsc::Receiver`'s own single-consumer nature.
    pub fn take_event_stream(&mut self) -> Option<mpsc::Receiver<TaggedTorrentEvent>> {
        self.events_rx.take()
    }

    /// Binds the DHT and inbound peer-wire listener, loads persisted state,
    /// and re-adds every torrent it names (spec §4.15 `initialize`).
    pub async fn initialize(&mut self) -> EngineResult<()> {
        let bind_addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.settings.listen_port));
        match DhtNode::bind(bind_addr, crate::ids::NodeId::random()).await {
            Ok(dht) => self.dht = Some(dht),
            Err(err) => warn!(%err, "failed to bind DHT socket, continuing without DHT"),
        }

        match TcpListener::bind(bind_addr).await {
            Ok(listener) => self.spawn_inbound_listener(listener),
            Err(err) => warn!(%err, "failed to bind inbound peer-wire listener"),
        }

        match self.state_mgr.load().await {
            Ok(doc) => self.restore_from_state(doc).await?,
            Err(crate::state::StateError::NoValidState) => info!("no prior state file, starting fresh"),
            Err(err) => return Err(EngineError::Persistence(err)),
        }
        Ok(())
    }

    async fn restore_from_state(&mut self, doc: EngineStateFile) -> EngineResult<()> {
        for (_, row) in doc.torrents {
            let info_hash = InfoHash::from_hex(&row.info_hash)
                .map_err(|e| EngineError::InvalidSource(format!("bad info_hash in state file: {e}")))?;
            let source: TorrentSource = row.source.into();
            let resume_completed = row.completed_pieces.clone();
            let options = AddOptions {
                download_path: Some(row.download_path),
                priority: row.priority,
                file_selection: row.file_selection.unwrap_or(FileSelection::All),
            };
            if let Err(err) = self
                .spawn_torrent(info_hash, source, options, resume_completed, row.downloaded_bytes, row.uploaded_bytes, row.added_at)
                .await
            {
                warn!(%info_hash, %err, "failed to restore torrent from state");
            }
        }
        Ok(())
    }

    fn spawn_inbound_listener(&mut self, listener: TcpListener) {
        let our_peer_id = self.our_peer_id;
        let handles_by_info_hash: HashMap<InfoHash, TorrentHandle> = HashMap::new();
        let handles = Arc::new(tokio::sync::Mutex::new(handles_by_info_hash));
        self.inbound_handles = Some(handles.clone());
        let join = tokio::spawn(async move {
            loop {
                let (mut stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "inbound accept failed");
                        continue;
                    }
                };
                let handles = handles.clone();
                tokio::spawn(async move {
                    let handshake = match crate::peer::connection::receive_handshake(&mut stream).await {
                        Ok(h) => h,
                        Err(err) => {
                            warn!(%addr, %err, "inbound handshake read failed");
                            return;
                        }
                    };
                    let target = handles.lock().await.get(&handshake.info_hash).cloned();
                    let Some(target) = target else {
                        debug!(%addr, info_hash = %handshake.info_hash, "inbound peer named an unknown torrent");
                        return;
                    };
                    if let Err(err) = crate::peer::connection::respond_handshake(&mut stream, handshake.info_hash, our_peer_id).await {
                        warn!(%addr, %err, "failed replying to inbound handshake");
                        return;
                    }
                    let _ = target
                        .send(TorrentCommand::AdoptInboundConnection {
                            addr,
                            stream,
                            remote_peer_id: handshake.peer_id,
                            extensions_supported: handshake.supports_extensions(),
                        })
                        .await;
                });
            }
        });
        self.listener_handle = Some(join);
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_torrent(
        &mut self,
        info_hash: InfoHash,
        source: TorrentSource,
        options: AddOptions,
        resume_completed: Vec<u32>,
        bytes_downloaded: u64,
        bytes_uploaded: u64,
        added_at: i64,
    ) -> EngineResult<()> {
        let download_path = options.download_path.unwrap_or_else(|| self.settings.downloads_dir().join(info_hash.to_hex()));
        let (metadata, info_bytes) = match &source {
            TorrentSource::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(EngineError::Io)?;
                let metadata = crate::torrent::Metadata::parse(&bytes).map_err(|e| EngineError::Torrent(e.into()))?;
                let spanned = crate::bencode::decode_with_spans(&bytes).map_err(|e| EngineError::Torrent(crate::torrent::MetadataError::from(e).into()))?;
                let info_bytes = spanned.get(b"info").map(|v| v.raw_bytes(&bytes).to_vec());
                (Some(metadata), info_bytes)
            }
            TorrentSource::Magnet(_) => (None, None),
        };

        let params = SpawnParams {
            info_hash,
            source: source.clone(),
            metadata,
            info_bytes,
            download_path: download_path.clone(),
            priority: options.priority,
            settings: self.settings.clone(),
            our_peer_id: self.our_peer_id,
            dht: self.dht.clone(),
            resume_completed_pieces: resume_completed,
            bytes_downloaded,
            bytes_uploaded,
            verify_on_resume: self.settings.verify_on_resume,
        };

        let (handle, join) = Torrent::spawn(params, self.events_tx.clone());
        if let Some(inbound) = &self.inbound_handles {
            inbound.lock().await.insert(info_hash, handle.clone());
        }
        self.queue.add(info_hash, options.priority);
        self.torrents.insert(
            info_hash,
            ManagedTorrent { handle, join, source, download_path, priority: options.priority, added_at },
        );
        Ok(())
    }

    /// Adds a torrent from a magnet URI or `.torrent` file path (spec §6
    /// `add`).
    pub async fn add(&mut self, source: TorrentSource, options: AddOptions, now_ms: i64) -> EngineResult<InfoHash> {
        if self.shutting_down {
            return Err(EngineError::ShuttingDown);
        }
        let info_hash = match &source {
            TorrentSource::Magnet(uri) => crate::magnet::parse(uri).map_err(EngineError::Magnet)?.info_hash,
            TorrentSource::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(EngineError::Io)?;
                crate::torrent::Metadata::parse(&bytes).map_err(|e| EngineError::Torrent(e.into()))?.info_hash
            }
        };
        if self.torrents.contains_key(&info_hash) {
            return Err(EngineError::DuplicateTorrent { info_hash });
        }
        self.spawn_torrent(info_hash, source, options, Vec::new(), 0, 0, now_ms).await?;
        self.mark_dirty();
        Ok(info_hash)
    }

    fn handle_of(&self, info_hash: &InfoHash) -> EngineResult<&TorrentHandle> {
        self.torrents.get(info_hash).map(|t| &t.handle).ok_or(EngineError::UnknownTorrent(*info_hash))
    }

    pub async fn pause(&mut self, info_hash: &InfoHash) -> EngineResult<()> {
        self.handle_of(info_hash)?.send(TorrentCommand::Pause).await.map_err(EngineError::Torrent)?;
        self.queue.pause(info_hash);
        self.mark_dirty();
        Ok(())
    }

    pub async fn resume(&mut self, info_hash: &InfoHash) -> EngineResult<()> {
        self.handle_of(info_hash)?.send(TorrentCommand::Resume).await.map_err(EngineError::Torrent)?;
        self.queue.resume(info_hash);
        self.mark_dirty();
        Ok(())
    }

    pub async fn start(&mut self, info_hash: &InfoHash) -> EngineResult<()> {
        self.handle_of(info_hash)?.send(TorrentCommand::Resume).await.map_err(EngineError::Torrent)?;
        self.queue.start(info_hash);
        self.mark_dirty();
        Ok(())
    }

    pub async fn set_priority(&mut self, info_hash: &InfoHash, priority: Priority) -> EngineResult<()> {
        self.handle_of(info_hash)?.send(TorrentCommand::SetPriority(priority)).await.map_err(EngineError::Torrent)?;
        self.queue.set_priority(info_hash, priority);
        if let Some(t) = self.torrents.get_mut(info_hash) {
            t.priority = priority;
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: usize) -> Vec<InfoHash> {
        let paused = self.queue.set_max_concurrent(max_concurrent);
        self.mark_dirty();
        paused
    }

    pub async fn set_file_selection(&mut self, info_hash: &InfoHash, selection: FileSelection) -> EngineResult<()> {
        self.handle_of(info_hash)?.send(TorrentCommand::SetFileSelection(selection)).await.map_err(EngineError::Torrent)?;
        self.mark_dirty();
        Ok(())
    }

    /// Removes a torrent: sends `Remove`, drops our bookkeeping, and lets
    /// the actor's own task exit on its own schedule (spec §6 `remove`).
    pub async fn remove(&mut self, info_hash: &InfoHash) -> EngineResult<()> {
        let managed = self.torrents.remove(info_hash).ok_or(EngineError::UnknownTorrent(*info_hash))?;
        let _ = managed.handle.send(TorrentCommand::Remove).await;
        if let Some(inbound) = &self.inbound_handles {
            inbound.lock().await.remove(info_hash);
        }
        self.queue.remove(info_hash);
        self.mark_dirty();
        Ok(())
    }

    pub fn get_stats(&self, info_hash: &InfoHash) -> EngineResult<TorrentStats> {
        Ok(self.handle_of(info_hash)?.stats())
    }

    pub fn get_global_stats(&self) -> Vec<TorrentStats> {
        self.torrents.values().map(|t| t.handle.stats()).collect()
    }

    fn snapshot_state(&self, now_ms: i64) -> EngineStateFile {
        let mut torrents = HashMap::new();
        for (info_hash, managed) in &self.torrents {
            let stats = managed.handle.stats();
            torrents.insert(
                info_hash.to_hex(),
                PersistedTorrent {
                    info_hash: info_hash.to_hex(),
                    source: SourceDoc::from(&managed.source),
                    download_path: managed.download_path.clone(),
                    priority: managed.priority,
                    state: managed.handle.state(),
                    completed_pieces: stats.completed_piece_indices.clone(),
                    downloaded_bytes: stats.downloaded_bytes,
                    uploaded_bytes: stats.uploaded_bytes,
                    added_at: managed.added_at,
                    file_selection: None,
                },
            );
        }
        EngineStateFile {
            version: crate::state::STATE_VERSION,
            saved_at: now_ms,
            settings: PersistedSettings {
                max_concurrent: self.settings.max_concurrent_torrents,
                global_upload_limit: self.settings.global_upload_limit,
                global_download_limit: self.settings.global_download_limit,
            },
            torrents,
        }
    }

    pub async fn save_state(&mut self, now_ms: i64) -> EngineResult<()> {
        self.state_mgr.save(self.snapshot_state(now_ms)).await.map_err(EngineError::Persistence)?;
        self.dirty = false;
        self.last_autosave_at = Some(std::time::Instant::now());
        Ok(())
    }

    /// Marks the engine state dirty from a lifecycle event the host observed
    /// on the aggregated event stream (e.g. a torrent completing on its own,
    /// not via an explicit control command) so the next autosave tick picks
    /// it up (spec §4.14 "immediate save on lifecycle transitions").
    pub fn notify_lifecycle_event(&mut self) {
        self.mark_dirty();
    }

    /// Saves now if dirty and at least `interval` has elapsed since the last
    /// save (spec §4.14: "auto-save every 30s only when dirty"). Intended to
    /// be driven by the host's own tick loop (e.g. `rstc`'s `main.rs`), since
    /// `Engine` otherwise has no task of its own. Returns whether it saved.
    pub async fn autosave_if_dirty(&mut self, now_ms: i64, interval: std::time::Duration) -> EngineResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if let Some(last) = self.last_autosave_at {
            if last.elapsed() < interval {
                return Ok(false);
            }
        }
        self.save_state(now_ms).await?;
        Ok(true)
    }

    /// Stops auto-save, flushes one final snapshot, stops every torrent,
    /// and releases resources in reverse dependency order (spec §4.15
    /// `shutdown`: listener and DHT last, since torrents may still be using
    /// them mid-teardown).
    pub async fn shutdown(&mut self, now_ms: i64) -> EngineResult<()> {
        self.shutting_down = true;
        if let Err(err) = self.save_state(now_ms).await {
            warn!(%err, "final state save failed during shutdown");
        }
        let infos: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for info_hash in infos {
            if let Some(managed) = self.torrents.remove(&info_hash) {
                let _ = managed.handle.send(TorrentCommand::Shutdown).await;
                let _ = tokio::time::timeout(std::time::Duration::from_secs(5), managed.join).await;
            }
        }
        if let Some(listener_handle) = self.listener_handle.take() {
            listener_handle.abort();
        }
        self.dht = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Priority;

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings { data_dir: dir.to_path_buf(), ..Settings::default() }
    }

    fn magnet(byte: u8) -> TorrentSource {
        let hash = hex::encode([byte; 20]);
        TorrentSource::Magnet(format!("magnet:?xt=urn:btih:{hash}"))
    }

    #[tokio::test]
    async fn add_then_remove_round_trips_through_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_settings(dir.path()));
        let info_hash = engine.add(magnet(1), AddOptions::default(), 0).await.unwrap();
        assert!(engine.torrents.contains_key(&info_hash));
        engine.remove(&info_hash).await.unwrap();
        assert!(!engine.torrents.contains_key(&info_hash));
    }

    #[tokio::test]
    async fn adding_the_same_info_hash_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_settings(dir.path()));
        engine.add(magnet(2), AddOptions::default(), 0).await.unwrap();
        let err = engine.add(magnet(2), AddOptions::default(), 0).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTorrent { .. }));
    }

    #[tokio::test]
    async fn operations_on_an_unknown_info_hash_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_settings(dir.path()));
        let unknown = InfoHash::from_bytes([9u8; 20]);
        assert!(matches!(engine.pause(&unknown).await, Err(EngineError::UnknownTorrent(_))));
        assert!(matches!(engine.remove(&unknown).await, Err(EngineError::UnknownTorrent(_))));
    }

    #[tokio::test]
    async fn mutations_mark_the_engine_dirty_and_save_state_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_settings(dir.path()));
        assert!(!engine.dirty);
        let info_hash = engine.add(magnet(3), AddOptions::default(), 0).await.unwrap();
        assert!(engine.dirty);
        engine.save_state(0).await.unwrap();
        assert!(!engine.dirty);
        engine.set_priority(&info_hash, Priority::High).await.unwrap();
        assert!(engine.dirty);
    }

    #[tokio::test]
    async fn autosave_only_writes_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_settings(dir.path()));
        let interval = std::time::Duration::from_secs(30);
        assert!(!engine.autosave_if_dirty(0, interval).await.unwrap());
        engine.add(magnet(4), AddOptions::default(), 0).await.unwrap();
        assert!(engine.autosave_if_dirty(0, interval).await.unwrap());
        assert!(dir.path().join("state").join("state.json").exists());
        assert!(!engine.autosave_if_dirty(0, interval).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_state_persists_completed_piece_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_settings(dir.path()));
        let info_hash = engine.add(magnet(5), AddOptions::default(), 0).await.unwrap();
        let doc = engine.snapshot_state(0);
        let row = doc.torrents.get(&info_hash.to_hex()).unwrap();
        assert_eq!(row.completed_pieces, Vec::<u32>::new());
    }
}
