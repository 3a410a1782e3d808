//! The per-torrent actor (spec §4.12): one tokio task owns a
//! [`PeerManager`], a [`DownloadManager`], a [`FileWriter`], tracker
//! announces, and optional DHT peer discovery, and drives them through the
//! lifecycle state machine. There is no teacher equivalent of the actor
//! shape itself; its typed-command/typed-event boundary generalizes the
//! peer connection's callback-free redesign (spec §9) from one socket to
//! everything a torrent owns.
use super::metadata::Metadata;
use super::{
    FileSelection, Priority, TaggedTorrentEvent, TorrentError, TorrentEvent, TorrentSource, TorrentState, TorrentStats,
};
use crate::bitfield::Bitfield;
use crate::config::Settings;
use crate::dht::DhtNode;
use crate::download::{BlockOutcome, DownloadManager};
use crate::extension::{build_extended_handshake, parse_extended_handshake, MetadataAssembler, UtMetadataMessage, METADATA_CHUNK_SIZE};
use crate::ids::{InfoHash, PeerId};
use crate::peer::{ConnId, PeerCommand, PeerEvent, PeerManager, StrikeCause, TaggedEvent};
use crate::piece::FileWriter;
use crate::tracker::{self, AnnounceEvent, AnnounceParams};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

const OUR_UT_METADATA_ID: u8 = 1;
const SCHEDULE_TICK: Duration = Duration::from_millis(250);
const PROGRESS_EVERY: u32 = 2; // 500ms
const TIMEOUT_SWEEP_EVERY: u32 = 20; // 5s
const PRUNE_EVERY: u32 = 120; // 30s
const DHT_LOOKUP_EVERY: u32 = 240; // 60s
const CONNECT_FILL_EVERY: u32 = 8; // 2s
const ANNOUNCE_CHECK_EVERY: u32 = 4; // 1s
const METADATA_REQUEST_EVERY: u32 = 8; // 2s

/// Control messages accepted by a running [`Torrent`] actor (spec §6).
pub enum TorrentCommand {
    Pause,
    Resume,
    SetPriority(Priority),
    SetFileSelection(FileSelection),
    /// The engine's inbound listener accepted and handshook a peer that
    /// named this torrent's info_hash; adopt it into our pool.
    AdoptInboundConnection { addr: SocketAddr, stream: TcpStream, remote_peer_id: PeerId, extensions_supported: bool },
    Remove,
    Shutdown,
}

/// A cheap, cloneable reference to a running torrent actor: a command
/// sender plus watch channels a caller can poll without awaiting the actor.
#[derive(Clone)]
pub struct TorrentHandle {
    pub info_hash: InfoHash,
    commands: mpsc::Sender<TorrentCommand>,
    state: watch::Receiver<TorrentState>,
    stats: watch::Receiver<TorrentStats>,
}

impl TorrentHandle {
    pub async fn send(&self, command: TorrentCommand) -> Result<(), TorrentError> {
        self.commands.send(command).await.map_err(|_| TorrentError::Fatal("torrent actor is gone".to_string()))
    }

    pub fn state(&self) -> TorrentState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> TorrentStats {
        self.stats.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<TorrentState> {
        self.state.clone()
    }

    pub fn stats_watch(&self) -> watch::Receiver<TorrentStats> {
        self.stats.clone()
    }
}

/// Everything needed to spawn a torrent actor (spec §6 `add`).
pub struct SpawnParams {
    pub info_hash: InfoHash,
    pub source: TorrentSource,
    pub metadata: Option<Metadata>,
    /// Raw bytes of the metadata `info` dict, when already known (parsed
    /// from a `.torrent` file or recovered from a prior magnet fetch): lets
    /// this torrent answer ut_metadata REQUESTs byte-identically and
    /// advertise an accurate `metadata_size` (spec §4.5).
    pub info_bytes: Option<Vec<u8>>,
    pub download_path: PathBuf,
    pub priority: Priority,
    pub settings: Arc<Settings>,
    pub our_peer_id: PeerId,
    pub dht: Option<DhtNode>,
    pub resume_completed_pieces: Vec<u32>,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub verify_on_resume: bool,
}

struct PeerMeta {
    their_ut_metadata_id: Option<u8>,
    metadata_reject_count: u32,
}

fn initial_trackers(source: &TorrentSource, metadata: Option<&Metadata>) -> Vec<String> {
    let mut list = Vec::new();
    if let TorrentSource::Magnet(uri) = source {
        if let Ok(link) = crate::magnet::parse(uri) {
            list.extend(link.trackers);
        }
    }
    if let Some(meta) = metadata {
        if let Some(announce) = &meta.announce {
            list.push(announce.clone());
        }
        for tier in &meta.announce_list {
            list.extend(tier.iter().cloned());
        }
    }
    list.sort();
    list.dedup();
    list
}

/// The running state machine for one torrent (spec §4.12). Spawned via
/// [`Torrent::spawn`]; everything else is private to the actor's own task.
pub struct Torrent {
    info_hash: InfoHash,
    our_peer_id: PeerId,
    settings: Arc<Settings>,
    source: TorrentSource,
    download_path: PathBuf,
    priority: Priority,
    state: TorrentState,
    paused_from: Option<TorrentState>,
    metadata: Option<Metadata>,
    info_bytes: Option<Vec<u8>>,
    dm: Option<DownloadManager>,
    fw: Option<FileWriter>,
    pm: PeerManager,
    pm_events: mpsc::Receiver<TaggedEvent>,
    peer_meta: HashMap<ConnId, PeerMeta>,
    metadata_assembler: Option<MetadataAssembler>,
    metadata_size_hint: Option<usize>,
    dht: Option<DhtNode>,
    trackers: Vec<String>,
    next_announce_at: Instant,
    announce_attempt: u32,
    bytes_down: u64,
    bytes_up: u64,
    last_progress_at: Instant,
    last_bytes_down: u64,
    last_bytes_up: u64,
    file_selection: FileSelection,
    last_served_piece: Option<(u32, Vec<u8>)>,
    reconnect_attempts: HashMap<SocketAddr, u32>,
    reconnects_tx: mpsc::Sender<SocketAddr>,
    reconnects_rx: mpsc::Receiver<SocketAddr>,
    state_tx: watch::Sender<TorrentState>,
    stats_tx: watch::Sender<TorrentStats>,
    events_tx: mpsc::Sender<TaggedTorrentEvent>,
    commands_rx: mpsc::Receiver<TorrentCommand>,
    verify_on_resume: bool,
    resume_completed: Vec<u32>,
}

impl Torrent {
    /// Spawns the actor task and returns a handle to it.
    pub fn spawn(params: SpawnParams, events_tx: mpsc::Sender<TaggedTorrentEvent>) -> (TorrentHandle, tokio::task::JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (pm, pm_events) =
            PeerManager::with_caps(params.info_hash, params.our_peer_id, params.settings.max_connections_per_torrent, params.settings.max_connections_per_ip);
        let (reconnects_tx, reconnects_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(TorrentState::Idle);
        let (stats_tx, stats_rx) = watch::channel(TorrentStats::default());
        let trackers = initial_trackers(&params.source, params.metadata.as_ref());
        let now = Instant::now();

        let actor = Torrent {
            info_hash: params.info_hash,
            our_peer_id: params.our_peer_id,
            settings: params.settings,
            source: params.source,
            download_path: params.download_path,
            priority: params.priority,
            state: TorrentState::Idle,
            paused_from: None,
            metadata: params.metadata,
            info_bytes: params.info_bytes,
            dm: None,
            fw: None,
            pm,
            pm_events,
            peer_meta: HashMap::new(),
            metadata_assembler: None,
            metadata_size_hint: None,
            dht: params.dht,
            trackers,
            next_announce_at: now,
            announce_attempt: 0,
            bytes_down: params.bytes_downloaded,
            bytes_up: params.bytes_uploaded,
            last_progress_at: now,
            last_bytes_down: params.bytes_downloaded,
            last_bytes_up: params.bytes_uploaded,
            file_selection: FileSelection::All,
            last_served_piece: None,
            reconnect_attempts: HashMap::new(),
            reconnects_tx,
            reconnects_rx,
            state_tx,
            stats_tx,
            events_tx,
            commands_rx,
            verify_on_resume: params.verify_on_resume,
            resume_completed: params.resume_completed_pieces,
        };

        let handle = TorrentHandle { info_hash: actor.info_hash, commands: commands_tx, state: state_rx, stats: stats_rx };
        let join = tokio::spawn(actor.run());
        (handle, join)
    }

    async fn run(mut self) {
        self.emit(TorrentEvent::Added).await;

        if self.metadata.is_some() {
            if let Err(err) = self.init_from_metadata().await {
                self.fail(err.to_string()).await;
            }
        } else {
            self.set_state(TorrentState::FetchingMetadata);
        }
        self.emit(TorrentEvent::Started).await;

        let initial_dial = self.settings.max_connections_per_torrent.min(10);
        self.pm.connect_batch(initial_dial).await;

        let mut ticker = tokio::time::interval(SCHEDULE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick_count: u32 = 0;
        let mut stopping = false;

        while !stopping {
            tokio::select! {
                _ = ticker.tick() => {
                    tick_count = tick_count.wrapping_add(1);
                    self.on_tick(tick_count).await;
                }
                maybe_cmd = self.commands_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => stopping = self.handle_command(cmd).await,
                        None => stopping = true,
                    }
                }
                maybe_event = self.pm_events.recv() => {
                    if let Some(tagged) = maybe_event {
                        self.handle_peer_event(tagged.conn_id, tagged.event).await;
                    }
                }
                maybe_addr = self.reconnects_rx.recv() => {
                    if let Some(addr) = maybe_addr {
                        self.pm.readmit(addr);
                    }
                }
            }
        }

        self.emit(TorrentEvent::Removed).await;
    }

    fn set_state(&mut self, state: TorrentState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    async fn emit(&self, event: TorrentEvent) {
        let _ = self.events_tx.send(TaggedTorrentEvent { info_hash: self.info_hash, event }).await;
    }

    async fn fail(&mut self, reason: String) {
        warn!(info_hash = %self.info_hash, %reason, "torrent entered error state");
        self.set_state(TorrentState::Error);
        self.emit(TorrentEvent::Error { reason }).await;
    }

    /// Opens the file writer and download manager for newly-known metadata
    /// (either provided up front or just assembled over ut_metadata), and
    /// re-seeds `completed` from resume data (spec §4.15, scenario S6).
    async fn init_from_metadata(&mut self) -> Result<(), TorrentError> {
        let metadata = self.metadata.as_ref().expect("metadata present");
        let fw = FileWriter::open(self.download_path.clone(), metadata.file_entries(), metadata.piece_length, metadata.piece_hashes.clone()).await?;

        let mut dm = DownloadManager::with_caps(
            metadata.piece_length as u32,
            metadata.total_length(),
            metadata.piece_hashes.clone(),
            self.settings.per_peer_pipeline_depth,
            self.settings.endgame_threshold,
        );

        if !self.resume_completed.is_empty() {
            self.set_state(TorrentState::Checking);
            if self.verify_on_resume {
                let report = fw.verify_store().await?;
                for index in report.valid {
                    dm.mark_completed(index);
                }
            } else {
                for index in self.resume_completed.drain(..) {
                    dm.mark_completed(index);
                }
            }
        }

        self.fw = Some(fw);
        self.dm = Some(dm);
        self.apply_file_selection();
        self.emit(TorrentEvent::MetadataComplete).await;
        self.emit(TorrentEvent::Ready).await;

        if self.dm.as_ref().expect("just set").is_done() {
            self.set_state(TorrentState::Seeding);
            self.emit(TorrentEvent::Completed).await;
        } else {
            self.set_state(TorrentState::Downloading);
        }
        Ok(())
    }

    /// Recomputes which pieces the download manager should chase, from
    /// `self.file_selection` (spec §6 `set_file_selection`).
    fn apply_file_selection(&mut self) {
        let (Some(metadata), Some(dm)) = (self.metadata.as_ref(), self.dm.as_mut()) else { return };
        match &self.file_selection {
            FileSelection::All => dm.set_wanted_pieces(None),
            FileSelection::Indices(indices) => {
                let wanted_files: std::collections::HashSet<usize> = indices.iter().copied().collect();
                let files = metadata.file_entries();
                let piece_length = metadata.piece_length;
                let total_length = metadata.total_length();
                let mut wanted = std::collections::HashSet::new();
                for index in 0..metadata.num_pieces() as u32 {
                    let ranges = crate::piece::piece_file_ranges(index, piece_length, total_length, &files);
                    if ranges.iter().any(|r| wanted_files.contains(&r.file_idx)) {
                        wanted.insert(index);
                    }
                }
                dm.set_wanted_pieces(Some(wanted));
            }
        }
    }

    async fn handle_command(&mut self, command: TorrentCommand) -> bool {
        match command {
            TorrentCommand::Pause => {
                if matches!(self.state, TorrentState::Downloading | TorrentState::Seeding | TorrentState::Checking | TorrentState::FetchingMetadata) {
                    self.paused_from = Some(self.state);
                    self.set_state(TorrentState::Paused);
                    self.disconnect_all();
                    self.emit(TorrentEvent::Paused).await;
                }
                false
            }
            TorrentCommand::Resume => {
                if self.state == TorrentState::Paused {
                    let back_to = self.paused_from.take().unwrap_or(TorrentState::Downloading);
                    self.set_state(back_to);
                    self.emit(TorrentEvent::Resumed).await;
                }
                false
            }
            TorrentCommand::SetPriority(priority) => {
                self.priority = priority;
                false
            }
            TorrentCommand::SetFileSelection(selection) => {
                self.file_selection = selection;
                self.apply_file_selection();
                false
            }
            TorrentCommand::AdoptInboundConnection { addr, stream, remote_peer_id, extensions_supported } => {
                let conn_id = self.pm.adopt_inbound(addr, stream);
                self.handle_peer_event(conn_id, PeerEvent::Established { remote_peer_id, extensions_supported }).await;
                false
            }
            TorrentCommand::Remove => {
                self.announce_stopped_best_effort().await;
                true
            }
            TorrentCommand::Shutdown => {
                self.announce_stopped_best_effort().await;
                true
            }
        }
    }

    fn disconnect_all(&mut self) {
        let ids: Vec<ConnId> = self.pm.connection_ids().collect();
        for id in ids {
            self.pm.disconnect(id);
        }
    }

    fn current_stats(&self) -> TorrentStats {
        TorrentStats {
            info_hash: Some(self.info_hash.to_hex()),
            state: Some(self.state),
            downloaded_bytes: self.bytes_down,
            uploaded_bytes: self.bytes_up,
            num_pieces: self.dm.as_ref().map(|dm| dm.num_pieces()).unwrap_or(0),
            completed_pieces: self.dm.as_ref().map(|dm| dm.completed_count()).unwrap_or(0),
            completed_piece_indices: self.dm.as_ref().map(|dm| dm.completed_indices()).unwrap_or_default(),
            connected_peers: self.pm.connected_count(),
            download_rate_bps: 0,
            upload_rate_bps: 0,
        }
    }

    /// Computes byte-rate since the last call and returns the full snapshot
    /// (spec §6 `getStats`).
    fn tick_stats(&mut self) -> TorrentStats {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_progress_at).as_secs_f64().max(0.001);
        let down_rate = (self.bytes_down.saturating_sub(self.last_bytes_down) as f64 / elapsed) as u64;
        let up_rate = (self.bytes_up.saturating_sub(self.last_bytes_up) as f64 / elapsed) as u64;
        self.last_progress_at = now;
        self.last_bytes_down = self.bytes_down;
        self.last_bytes_up = self.bytes_up;
        let mut stats = self.current_stats();
        stats.download_rate_bps = down_rate;
        stats.upload_rate_bps = up_rate;
        stats
    }

    fn wants_more_peers(&self) -> bool {
        self.metadata.is_none() || self.dm.as_ref().is_none_or(|dm| !dm.is_done())
    }

    async fn on_tick(&mut self, n: u32) {
        if self.state == TorrentState::Paused {
            return;
        }
        if n % TIMEOUT_SWEEP_EVERY == 0 {
            self.sweep_timeouts();
        }
        if n % PRUNE_EVERY == 0 {
            self.pm.prune();
        }
        if n % CONNECT_FILL_EVERY == 0 {
            let room = self.settings.max_connections_per_torrent.saturating_sub(self.pm.connected_count());
            if room > 0 && self.pm.pool_len() > 0 {
                self.pm.connect_batch(room.min(10)).await;
            }
        }
        if self.state == TorrentState::FetchingMetadata && n % METADATA_REQUEST_EVERY == 0 {
            self.drive_metadata_requests().await;
        }
        if n % ANNOUNCE_CHECK_EVERY == 0 {
            self.maybe_announce().await;
        }
        if self.dht.is_some() && n % DHT_LOOKUP_EVERY == 0 && self.wants_more_peers() {
            self.dht_lookup().await;
        }
        if matches!(self.state, TorrentState::Downloading | TorrentState::Seeding) {
            self.schedule_and_dispatch();
        }
        if n % PROGRESS_EVERY == 0 {
            let stats = self.tick_stats();
            let _ = self.stats_tx.send(stats.clone());
            self.emit(TorrentEvent::Progress(stats)).await;
        }
    }

    fn sweep_timeouts(&mut self) {
        let Some(dm) = self.dm.as_mut() else { return };
        for timed_out in dm.sweep_timeouts(Instant::now()) {
            self.pm.record_failure(timed_out.conn_id);
        }
    }

    fn schedule_and_dispatch(&mut self) {
        let Some(dm) = self.dm.as_mut() else { return };
        for request in dm.schedule_requests() {
            self.pm.send(request.conn_id, PeerCommand::Request { index: request.index, begin: request.begin, length: request.length });
        }
    }

    fn announce_params(&self, event: AnnounceEvent) -> AnnounceParams {
        let left = match (&self.dm, &self.metadata) {
            (Some(dm), Some(metadata)) => {
                let total = metadata.total_length();
                let done_fraction = dm.completed_count() as f64 / dm.num_pieces().max(1) as f64;
                total.saturating_sub((total as f64 * done_fraction) as u64)
            }
            _ => 0,
        };
        AnnounceParams { info_hash: self.info_hash, peer_id: self.our_peer_id, port: self.settings.listen_port, uploaded: self.bytes_up, downloaded: self.bytes_down, left, event }
    }

    async fn maybe_announce(&mut self) {
        if Instant::now() < self.next_announce_at {
            return;
        }
        let Some(tracker_url) = self.trackers.first().cloned() else {
            self.next_announce_at = Instant::now() + Duration::from_secs(3600);
            return;
        };
        let event = if self.announce_attempt == 0 { AnnounceEvent::Started } else { AnnounceEvent::Empty };
        let params = self.announce_params(event);
        match tokio::time::timeout(Duration::from_secs(15), tracker::announce(&tracker_url, &params)).await {
            Ok(Ok(response)) => {
                self.pm.add_peers(response.peers.into_iter().map(|p| p.addr));
                self.next_announce_at = Instant::now() + Duration::from_secs(response.interval.max(60));
                self.announce_attempt = 0;
            }
            Ok(Err(err)) => {
                debug!(info_hash = %self.info_hash, %err, "tracker announce failed");
                let delay = tracker::retry_delay_with_jitter(self.announce_attempt);
                self.announce_attempt += 1;
                self.next_announce_at = Instant::now() + delay;
            }
            Err(_) => {
                let delay = tracker::retry_delay_with_jitter(self.announce_attempt);
                self.announce_attempt += 1;
                self.next_announce_at = Instant::now() + delay;
            }
        }
    }

    async fn announce_completed(&mut self) {
        let Some(tracker_url) = self.trackers.first().cloned() else { return };
        let params = self.announce_params(AnnounceEvent::Completed);
        let _ = tokio::time::timeout(Duration::from_secs(10), tracker::announce(&tracker_url, &params)).await;
    }

    async fn announce_stopped_best_effort(&mut self) {
        let Some(tracker_url) = self.trackers.first().cloned() else { return };
        let params = self.announce_params(AnnounceEvent::Stopped);
        let _ = tokio::time::timeout(Duration::from_secs(5), tracker::announce(&tracker_url, &params)).await;
    }

    async fn dht_lookup(&mut self) {
        let Some(dht) = self.dht.clone() else { return };
        let addrs = dht.get_peers(self.info_hash, self.settings.listen_port).await;
        self.pm.add_peers(addrs);
    }

    /// Requests the next missing metadata chunk from any peer that has
    /// advertised ut_metadata and hasn't rejected us repeatedly (spec §4.5).
    async fn drive_metadata_requests(&mut self) {
        let Some(assembler) = self.metadata_assembler.as_mut() else { return };
        let Some(piece) = assembler.next_missing_piece() else { return };
        let candidate = self
            .peer_meta
            .iter()
            .find(|(_, meta)| meta.their_ut_metadata_id.is_some() && meta.metadata_reject_count < 3)
            .map(|(&conn_id, meta)| (conn_id, meta.their_ut_metadata_id.expect("checked Some above")));
        let Some((conn_id, their_id)) = candidate else { return };
        assembler.record_attempt(piece);
        let payload = UtMetadataMessage::Request { piece }.encode_header();
        self.pm.send(conn_id, PeerCommand::Extended { id: their_id, payload: payload.into() });
    }

    async fn handle_peer_event(&mut self, conn_id: ConnId, event: PeerEvent) {
        match event {
            PeerEvent::Established { remote_peer_id: _, extensions_supported } => {
                self.peer_meta.insert(conn_id, PeerMeta { their_ut_metadata_id: None, metadata_reject_count: 0 });
                if let Some(addr) = self.pm.addr_of(conn_id) {
                    self.emit(TorrentEvent::PeerConnected { addr: addr.to_string() }).await;
                }
                if extensions_supported {
                    let handshake = build_extended_handshake(OUR_UT_METADATA_ID, self.metadata_size_hint);
                    self.pm.send(conn_id, PeerCommand::Extended { id: 0, payload: handshake.into() });
                }
                if let Some(dm) = self.dm.as_mut() {
                    dm.add_peer(conn_id);
                    self.pm.send(conn_id, PeerCommand::Bitfield(dm.our_bitfield().to_wire_bytes()));
                }
            }
            PeerEvent::Choked => {
                if let Some(dm) = self.dm.as_mut() {
                    dm.set_peer_choking(conn_id, true);
                }
                self.pm.note_peer_choking(conn_id, true);
            }
            PeerEvent::Unchoked => {
                if let Some(dm) = self.dm.as_mut() {
                    dm.set_peer_choking(conn_id, false);
                }
                self.pm.note_peer_choking(conn_id, false);
            }
            PeerEvent::Interested => {
                self.pm.note_peer_interested(conn_id, true);
                self.pm.set_am_choking(conn_id, false);
                self.pm.send(conn_id, PeerCommand::Unchoke);
            }
            PeerEvent::NotInterested => {
                self.pm.note_peer_interested(conn_id, false);
            }
            PeerEvent::Have { index } => {
                if let Some(dm) = self.dm.as_mut() {
                    dm.record_have(conn_id, index);
                    if !dm.our_bitfield().has(index as usize) {
                        self.pm.set_am_interested(conn_id, true);
                        self.pm.send(conn_id, PeerCommand::Interested);
                    }
                }
            }
            PeerEvent::Bitfield(bytes) => self.on_bitfield(conn_id, bytes),
            PeerEvent::Request { index, begin, length } => self.serve_request(conn_id, index, begin, length).await,
            PeerEvent::Piece { index, begin, block } => self.on_piece(conn_id, index, begin, block).await,
            PeerEvent::Cancel { .. } => {}
            PeerEvent::Extended { id, payload } => self.on_extended(conn_id, id, payload).await,
            PeerEvent::Disconnected { reason } => self.on_disconnected(conn_id, reason).await,
        }
    }

    fn on_bitfield(&mut self, conn_id: ConnId, bytes: Bytes) {
        let Some(dm) = self.dm.as_mut() else { return };
        let num_pieces = dm.num_pieces();
        match Bitfield::from_wire_bytes(&bytes, num_pieces) {
            Ok(bitfield) => {
                let has_needed = (0..num_pieces).any(|i| bitfield.has(i) && !dm.our_bitfield().has(i));
                dm.record_bitfield(conn_id, bitfield);
                if has_needed {
                    self.pm.set_am_interested(conn_id, true);
                    self.pm.send(conn_id, PeerCommand::Interested);
                }
            }
            Err(err) => {
                warn!(conn_id, %err, "malformed bitfield");
                self.pm.strike(conn_id, StrikeCause::MalformedMessage);
            }
        }
    }

    async fn serve_request(&mut self, conn_id: ConnId, index: u32, begin: u32, length: u32) {
        let Some(dm) = self.dm.as_ref() else { return };
        if !dm.our_bitfield().has(index as usize) || self.pm.is_am_choking(conn_id) {
            return;
        }
        let Some(fw) = self.fw.clone() else { return };
        if self.last_served_piece.as_ref().map(|(i, _)| *i) != Some(index) {
            match fw.read_piece(index).await {
                Ok(data) => self.last_served_piece = Some((index, data)),
                Err(err) => {
                    warn!(%err, index, "failed reading piece to serve request");
                    return;
                }
            }
        }
        let Some((_, data)) = &self.last_served_piece else { return };
        if begin as usize >= data.len() {
            return;
        }
        let end = (begin as usize + length as usize).min(data.len());
        let block = data[begin as usize..end].to_vec();
        self.bytes_up += block.len() as u64;
        self.pm.send(conn_id, PeerCommand::Piece { index, begin, block: block.into() });
    }

    async fn on_piece(&mut self, conn_id: ConnId, index: u32, begin: u32, block: Bytes) {
        self.pm.record_success(conn_id, Duration::from_millis(50));
        self.bytes_down += block.len() as u64;
        let block_len = block.len() as u32;
        let Some(dm) = self.dm.as_mut() else { return };
        let outcome = dm.on_block_received(conn_id, index, begin, &block);
        match outcome {
            BlockOutcome::Stored { cancel_to } => {
                for c in cancel_to {
                    self.pm.send(c, PeerCommand::Cancel { index, begin, length: block_len });
                }
            }
            BlockOutcome::Stale => {}
            BlockOutcome::PieceComplete { index, data, cancel_to } => {
                for c in cancel_to {
                    self.pm.send(c, PeerCommand::Cancel { index, begin, length: block_len });
                }
                self.write_completed_piece(index, data).await;
            }
            BlockOutcome::PieceFailed { contributors, .. } => {
                for c in contributors {
                    self.pm.strike(c, StrikeCause::HashVerificationFailure);
                }
            }
        }
    }

    async fn write_completed_piece(&mut self, index: u32, data: Vec<u8>) {
        let Some(fw) = self.fw.clone() else { return };
        match fw.write_piece(index, data).await {
            Ok(()) => {
                let Some(dm) = self.dm.as_mut() else { return };
                let peers = dm.confirm_piece_written(index);
                for p in &peers {
                    self.pm.send(*p, PeerCommand::Have(index));
                }
                self.last_served_piece = None;
                let total = dm.num_pieces();
                let completed_count = dm.completed_count();
                let done = dm.is_done();
                self.emit(TorrentEvent::Piece { index, total, completed_count }).await;
                if done {
                    self.set_state(TorrentState::Seeding);
                    self.emit(TorrentEvent::Completed).await;
                    self.announce_completed().await;
                }
            }
            Err(err) => self.fail(format!("failed to write piece {index}: {err}")).await,
        }
    }

    async fn on_extended(&mut self, conn_id: ConnId, id: u8, payload: Bytes) {
        if id == 0 {
            self.on_extended_handshake(conn_id, &payload).await;
            return;
        }
        if id != OUR_UT_METADATA_ID {
            return;
        }
        let Ok((message, header_len)) = UtMetadataMessage::parse(&payload) else {
            self.pm.strike(conn_id, StrikeCause::InvalidUtMetadata);
            return;
        };
        match message {
            UtMetadataMessage::Request { piece } => self.serve_metadata_request(conn_id, piece),
            UtMetadataMessage::Data { piece, .. } => {
                self.on_metadata_data(conn_id, piece, payload.slice(header_len..)).await
            }
            UtMetadataMessage::Reject { .. } => self.on_metadata_reject(conn_id).await,
        }
    }

    async fn on_extended_handshake(&mut self, conn_id: ConnId, payload: &[u8]) {
        let Ok(ext) = parse_extended_handshake(payload) else {
            debug!(conn_id, "bad extended handshake");
            return;
        };
        if let Some(meta) = self.peer_meta.get_mut(&conn_id) {
            meta.their_ut_metadata_id = ext.ut_metadata_id;
        }
        if self.metadata.is_none() && self.metadata_assembler.is_none() {
            if let Some(size) = ext.metadata_size {
                self.metadata_size_hint = Some(size);
                self.metadata_assembler = Some(MetadataAssembler::new(size));
            }
        }
        if self.metadata_assembler.is_some() {
            self.drive_metadata_requests().await;
        }
    }

    fn serve_metadata_request(&mut self, conn_id: ConnId, piece: usize) {
        let Some(their_id) = self.peer_meta.get(&conn_id).and_then(|m| m.their_ut_metadata_id) else { return };
        let Some(info_bytes) = self.info_bytes.as_ref() else {
            let reject = UtMetadataMessage::Reject { piece }.encode_header();
            self.pm.send(conn_id, PeerCommand::Extended { id: their_id, payload: reject.into() });
            return;
        };
        let offset = piece * METADATA_CHUNK_SIZE;
        if offset >= info_bytes.len() {
            let reject = UtMetadataMessage::Reject { piece }.encode_header();
            self.pm.send(conn_id, PeerCommand::Extended { id: their_id, payload: reject.into() });
            return;
        }
        let end = (offset + METADATA_CHUNK_SIZE).min(info_bytes.len());
        let mut out = UtMetadataMessage::Data { piece, total_size: info_bytes.len() }.encode_header();
        out.extend_from_slice(&info_bytes[offset..end]);
        self.pm.send(conn_id, PeerCommand::Extended { id: their_id, payload: out.into() });
    }

    async fn on_metadata_data(&mut self, conn_id: ConnId, piece: usize, chunk: Bytes) {
        let Some(assembler) = self.metadata_assembler.as_mut() else { return };
        match assembler.accept_chunk(piece, chunk) {
            Ok(()) if assembler.is_complete() => self.finish_metadata_fetch().await,
            Ok(()) => self.drive_metadata_requests().await,
            Err(err) => {
                warn!(conn_id, %err, "peer sent invalid ut_metadata chunk");
                self.pm.strike(conn_id, StrikeCause::InvalidUtMetadata);
            }
        }
    }

    async fn on_metadata_reject(&mut self, conn_id: ConnId) {
        if let Some(meta) = self.peer_meta.get_mut(&conn_id) {
            meta.metadata_reject_count += 1;
            if meta.metadata_reject_count >= 3 {
                self.pm.strike(conn_id, StrikeCause::InvalidUtMetadata);
            }
        }
        self.drive_metadata_requests().await;
    }

    async fn finish_metadata_fetch(&mut self) {
        let Some(assembler) = self.metadata_assembler.as_mut() else { return };
        match assembler.finish(&self.info_hash) {
            Ok(bytes) => match Metadata::from_info_bytes(&bytes, self.info_hash) {
                Ok(metadata) => {
                    self.trackers = initial_trackers(&self.source, Some(&metadata));
                    self.info_bytes = Some(bytes);
                    self.metadata = Some(metadata);
                    self.metadata_assembler = None;
                    if let Err(err) = self.init_from_metadata().await {
                        self.fail(err.to_string()).await;
                    }
                }
                Err(err) => {
                    warn!(%err, "assembled metadata failed re-validation");
                    self.metadata_assembler = Some(MetadataAssembler::new(self.metadata_size_hint.unwrap_or(0)));
                }
            },
            Err(err) => debug!(%err, "metadata hash mismatch, retrying fetch"),
        }
    }

    async fn on_disconnected(&mut self, conn_id: ConnId, reason: String) {
        debug!(conn_id, %reason, "peer disconnected");
        if let Some(addr) = self.pm.addr_of(conn_id) {
            self.emit(TorrentEvent::PeerDisconnected { addr: addr.to_string() }).await;
            let attempt = self.reconnect_attempts.entry(addr).or_insert(0);
            *attempt += 1;
            if let Some(delay) = crate::peer::health::reconnect_delay(*attempt) {
                let tx = self.reconnects_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(addr).await;
                });
            }
        }
        self.peer_meta.remove(&conn_id);
        if let Some(dm) = self.dm.as_mut() {
            dm.remove_peer(conn_id);
        }
        self.pm.disconnect(conn_id);
    }
}
