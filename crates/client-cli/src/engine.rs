//! Client-side reconciliation of server snapshots with local overlays.
//!
//! The relay service is polled, not pushed, and the desktop app's paused
//! downloads report degenerate progress. The engine owns the merged view the
//! rest of the client renders: it freezes paused-download progress from the
//! snapshot table, synthesizes placeholders for announced-but-unlisted
//! downloads, deduplicates concurrent fetches per resource class, and latches
//! a single process-wide flag when the session is invalidated so every
//! polling surface stops exactly once.

use chrono::{DateTime, Utc};
use shared::{Download, DownloadCommand, DownloadsResponse, FriendPresence};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::api::{ApiClient, ApiError};
use crate::snapshots::PausedProgressStore;

/// Snapshot of engine state published to subscribers on every change.
#[derive(Debug, Clone, Default)]
pub struct View {
    pub downloads: Vec<Download>,
    pub friends: Vec<FriendPresence>,
    pub user_name: String,
    pub last_updated: Option<DateTime<Utc>>,
    /// Latched once the session is revoked or expired. Consumers stop
    /// polling and prompt for a reconnect exactly once.
    pub session_invalid: bool,
    /// Most recent transient failure, cleared on the next success.
    pub last_error: Option<String>,
}

/// Outcome of a download command dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The expected state change was observed on a follow-up poll.
    Confirmed,
    /// Not observed within the confirmation budget. Informational only; the
    /// command may still land and will show up on the next regular poll.
    Unconfirmed,
}

/// Last value recorded for a download id. These are the **post-overlay**
/// values: once a paused download has been frozen at a snapshot, the next
/// poll's transition check compares against the frozen value, never against
/// degenerate raw zeros.
#[derive(Debug, Clone)]
struct Observed {
    status: shared::DownloadStatus,
    progress: f64,
    downloaded: String,
}

struct PlaceholderEntry {
    download: Download,
    discovered: Instant,
}

#[derive(Default)]
struct EngineState {
    downloads: Vec<Download>,
    friends: Vec<FriendPresence>,
    user_name: String,
    last_observed: HashMap<String, Observed>,
    placeholders: Vec<PlaceholderEntry>,
    last_updated: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Per-resource-class fetch gate: a cache window plus in-flight dedup.
struct CacheGate {
    inflight: tokio::sync::Mutex<()>,
    last_success: Mutex<Option<Instant>>,
}

impl CacheGate {
    fn new() -> Self {
        Self {
            inflight: tokio::sync::Mutex::new(()),
            last_success: Mutex::new(None),
        }
    }

    fn is_fresh(&self, window: Duration) -> bool {
        self.last_success
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < window)
            .unwrap_or(false)
    }

    fn invalidate(&self) {
        *self.last_success.lock().unwrap() = None;
    }

    /// Run `fetch` unless the cached value is still good. `Ok(None)` means
    /// the caller should use the cached value. Concurrent callers serialize
    /// on the in-flight lock; whoever waited out another caller's fetch is
    /// served by that fetch instead of issuing its own.
    async fn run<T, E, F, Fut>(&self, window: Duration, force: bool, fetch: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !force && self.is_fresh(window) {
            return Ok(None);
        }

        let started = Instant::now();
        let _guard = self.inflight.lock().await;

        // A fetch that completed while we waited satisfies this call too.
        {
            let last = self.last_success.lock().unwrap();
            if let Some(t) = *last {
                if t >= started || (!force && t.elapsed() < window) {
                    return Ok(None);
                }
            }
        }

        let value = fetch().await?;
        *self.last_success.lock().unwrap() = Some(Instant::now());
        Ok(Some(value))
    }
}

pub struct Engine {
    api: Arc<ApiClient>,
    snapshots: PausedProgressStore,
    state: Mutex<EngineState>,
    downloads_gate: CacheGate,
    friends_gate: CacheGate,
    name_gate: CacheGate,
    cache_window: Duration,
    placeholder_ttl: Duration,
    session_invalid: AtomicBool,
    view_tx: watch::Sender<View>,
}

impl Engine {
    pub fn new(
        api: Arc<ApiClient>,
        snapshots: PausedProgressStore,
        cache_window: Duration,
        placeholder_ttl: Duration,
    ) -> Self {
        // Seed transition tracking from the durable table so a download that
        // was paused before a restart is not mistaken for a fresh transition,
        // and so entries for downloads killed while we were away get cleaned
        // up once the first poll arrives.
        let mut last_observed = HashMap::new();
        for (id, snap) in snapshots.entries() {
            last_observed.insert(
                id,
                Observed {
                    status: shared::DownloadStatus::Paused,
                    progress: snap.progress,
                    downloaded: snap.downloaded,
                },
            );
        }

        let (view_tx, _) = watch::channel(View::default());
        Self {
            api,
            snapshots,
            state: Mutex::new(EngineState {
                last_observed,
                ..Default::default()
            }),
            downloads_gate: CacheGate::new(),
            friends_gate: CacheGate::new(),
            name_gate: CacheGate::new(),
            cache_window,
            placeholder_ttl,
            session_invalid: AtomicBool::new(false),
            view_tx,
        }
    }

    /// Subscribe to view changes. Receivers see the latest view only.
    pub fn subscribe(&self) -> watch::Receiver<View> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> View {
        self.build_view(&self.state.lock().unwrap())
    }

    pub fn session_is_invalid(&self) -> bool {
        self.session_invalid.load(Ordering::SeqCst)
    }

    /// Latch session invalidation. Returns true only for the first caller so
    /// exactly one surface raises the reconnect prompt no matter how many
    /// pollers observe the failure.
    pub fn mark_session_invalid(&self) -> bool {
        let first = !self.session_invalid.swap(true, Ordering::SeqCst);
        if first {
            tracing::warn!("Session revoked or expired; polling stops until reconnect");
            self.publish();
        }
        first
    }

    fn note_error(&self, error: &ApiError) {
        if error.invalidates_session() {
            self.mark_session_invalid();
            return;
        }
        tracing::warn!("Fetch failed (will retry on next poll): {}", error);
        self.state.lock().unwrap().last_error = Some(error.to_string());
        self.publish();
    }

    fn note_success(&self) {
        self.state.lock().unwrap().last_error = None;
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    pub async fn refresh_downloads(&self, force: bool) -> Result<(), ApiError> {
        let result = self
            .downloads_gate
            .run(self.cache_window, force, || self.api.list_downloads())
            .await;
        match result {
            Ok(Some(resp)) => {
                self.note_success();
                self.reconcile(resp);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    pub async fn refresh_friends(&self, force: bool) -> Result<(), ApiError> {
        let result = self
            .friends_gate
            .run(self.cache_window, force, || self.api.list_friends())
            .await;
        match result {
            Ok(Some(resp)) => {
                self.note_success();
                // Presence has no local overlay; replace wholesale.
                self.state.lock().unwrap().friends = resp.friends;
                self.publish();
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    pub async fn refresh_user_name(&self, force: bool) -> Result<(), ApiError> {
        let result = self
            .name_gate
            .run(self.cache_window, force, || self.api.get_display_name())
            .await;
        match result {
            Ok(Some(resp)) => {
                self.note_success();
                self.state.lock().unwrap().user_name = resp.display_name;
                self.publish();
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Force the next downloads fetch to bypass the cache window, without
    /// issuing the fetch itself.
    pub fn invalidate_downloads(&self) {
        self.downloads_gate.invalidate();
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Merge a server snapshot into the engine's view.
    ///
    /// Overlay rules, per download:
    /// - active with progress: refresh the paused-progress snapshot so a
    ///   pause landing between polls always has the freshest value ready
    /// - active without progress: drop any stale snapshot
    /// - paused: capture the prior active value on the transition, then
    ///   display the snapshot instead of the server's degenerate figures
    /// - terminal: drop the snapshot
    pub fn reconcile(&self, resp: DownloadsResponse) {
        let mut state = self.state.lock().unwrap();
        let mut merged: Vec<Download> = Vec::with_capacity(resp.downloads.len());

        for server in resp.downloads {
            let prior = state.last_observed.get(&server.id).cloned();
            let mut display = server.clone();

            if server.status.is_active() {
                if server.progress > 0.0 {
                    self.snapshots
                        .record(&server.id, server.progress, &server.downloaded);
                } else {
                    self.snapshots.remove(&server.id);
                }
            } else if server.status.is_paused() {
                if let Some(prior) = &prior {
                    if prior.status.is_active() && prior.progress > 0.0 {
                        self.snapshots
                            .record(&server.id, prior.progress, &prior.downloaded);
                    }
                }
                if self.snapshots.get(&server.id).is_none() && server.progress > 0.0 {
                    // Server managed to report real progress while paused;
                    // better than nothing.
                    self.snapshots
                        .record(&server.id, server.progress, &server.downloaded);
                }

                match self.snapshots.get(&server.id) {
                    Some(snap) => {
                        display.progress = snap.progress;
                        display.downloaded = snap.downloaded;
                    }
                    None => {
                        tracing::debug!(
                            "No progress snapshot for paused download {}, showing server values",
                            server.id
                        );
                    }
                }
            } else {
                self.snapshots.remove(&server.id);
            }

            state.last_observed.insert(
                display.id.clone(),
                Observed {
                    status: display.status,
                    progress: display.progress,
                    downloaded: display.downloaded.clone(),
                },
            );
            merged.push(display);
        }

        let server_ids: HashSet<String> = merged.iter().map(|d| d.id.clone()).collect();

        // Downloads that vanished from the list were killed or pruned by the
        // desktop app; their snapshots and tracking entries go with them.
        let vanished: Vec<String> = state
            .last_observed
            .keys()
            .filter(|id| !server_ids.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            state.last_observed.remove(&id);
            self.snapshots.remove(&id);
        }

        // Placeholders for downloads the server has announced but not yet
        // listed. Most recently discovered first.
        if resp.has_new_downloads {
            for info in &resp.new_downloads_info {
                let known = server_ids.contains(&info.id)
                    || state.placeholders.iter().any(|p| p.download.id == info.id);
                if !known {
                    tracing::info!("New download announced: {} ({})", info.name, info.id);
                    state.placeholders.insert(
                        0,
                        PlaceholderEntry {
                            download: Download::placeholder(info.id.clone(), info.name.clone()),
                            discovered: Instant::now(),
                        },
                    );
                }
            }
        }
        let ttl = self.placeholder_ttl;
        state.placeholders.retain(|p| {
            if server_ids.contains(&p.download.id) {
                return false;
            }
            if p.discovered.elapsed() >= ttl {
                tracing::warn!(
                    "Dropping placeholder {} - never confirmed by the server",
                    p.download.id
                );
                return false;
            }
            true
        });

        let mut list: Vec<Download> = state
            .placeholders
            .iter()
            .map(|p| p.download.clone())
            .collect();
        list.extend(merged);

        state.downloads = list;
        state.last_updated = Some(Utc::now());
        let view = self.build_view(&state);
        drop(state);
        self.view_tx.send_replace(view);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Snapshot the download's progress right before a pause command goes
    /// out, so the value is safe even if the server flips to paused before
    /// our next poll. Priority: fresh fetch, then last observed, then the
    /// currently displayed value.
    pub async fn capture_before_pause(&self, download_id: &str) {
        self.downloads_gate.invalidate();
        let fresh = match self.api.list_downloads().await {
            Ok(resp) => resp.downloads.into_iter().find(|d| d.id == download_id),
            Err(e) => {
                tracing::debug!("Pre-pause fetch failed, using cached values: {}", e);
                None
            }
        };

        let candidate = fresh
            .filter(|d| d.progress > 0.0)
            .map(|d| (d.progress, d.downloaded))
            .or_else(|| {
                let state = self.state.lock().unwrap();
                state
                    .last_observed
                    .get(download_id)
                    .filter(|o| o.progress > 0.0)
                    .map(|o| (o.progress, o.downloaded.clone()))
                    .or_else(|| {
                        state
                            .downloads
                            .iter()
                            .find(|d| d.id == download_id && d.progress > 0.0)
                            .map(|d| (d.progress, d.downloaded.clone()))
                    })
            });

        match candidate {
            Some((progress, downloaded)) => {
                self.snapshots.record(download_id, progress, &downloaded)
            }
            None => tracing::debug!("No usable progress to snapshot for {}", download_id),
        }
    }

    /// Send a pause/resume/kill and poll until the change is visible or the
    /// confirmation budget runs out. An `Unconfirmed` outcome is not an
    /// error; the next regular poll will pick the change up.
    pub async fn dispatch_command(
        &self,
        command: DownloadCommand,
        download_id: &str,
        confirm_interval: Duration,
        confirm_attempts: u32,
    ) -> Result<CommandOutcome, ApiError> {
        if command == DownloadCommand::Pause {
            self.capture_before_pause(download_id).await;
        }

        self.api.send_command(command, download_id).await?;
        tracing::info!("Sent {:?} for download {}", command, download_id);

        for _ in 0..confirm_attempts {
            tokio::time::sleep(confirm_interval).await;
            if self.refresh_downloads(true).await.is_err() {
                continue;
            }

            let state = self.state.lock().unwrap();
            let current = state.downloads.iter().find(|d| d.id == download_id);
            let confirmed = match command {
                DownloadCommand::Pause => current.is_some_and(|d| d.status.is_paused()),
                DownloadCommand::Resume => current.is_some_and(|d| d.status.is_active()),
                DownloadCommand::Kill => current.is_none(),
            };
            if confirmed {
                return Ok(CommandOutcome::Confirmed);
            }
        }

        tracing::info!(
            "{:?} for {} not confirmed within budget; it may still complete",
            command,
            download_id
        );
        Ok(CommandOutcome::Unconfirmed)
    }

    // ------------------------------------------------------------------

    fn build_view(&self, state: &EngineState) -> View {
        View {
            downloads: state.downloads.clone(),
            friends: state.friends.clone(),
            user_name: state.user_name.clone(),
            last_updated: state.last_updated,
            session_invalid: self.session_invalid.load(Ordering::SeqCst),
            last_error: state.last_error.clone(),
        }
    }

    fn publish(&self) {
        let view = self.view();
        self.view_tx.send_replace(view);
    }
}
