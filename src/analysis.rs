//! Analysis coordinator
//!
//! Binds the authoritative current node to the engine supervisor. Each
//! search gets its own ticker task that samples the supervisor's PV map and
//! coalesces raw engine output down to the emission cadence: at most one
//! `analysis:update` per 500 ms for the first five seconds of a search,
//! then one per 1000 ms. Every flush also persists an analysis snapshot,
//! deduplicated by content signature.
//!
//! The ticker is the only emitter for its search and is fully joined before
//! the terminal `analysis:stopped` goes out, so updates can never trail the
//! stop event.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::SqliteStore;
use crate::supervisor::{EngineError, PvLine, SearchHandle, UsiSupervisor};
use crate::wire::{AnalysisUpdate, ServerMessage, ToastLevel};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const FAST_CADENCE_MS: u64 = 500;
const SLOW_CADENCE_MS: u64 = 1000;
const FAST_CADENCE_WINDOW_MS: u64 = 5000;

pub const REASON_DISABLED: &str = "disabled";
pub const REASON_POSITION_CHANGED: &str = "position_changed";
pub const REASON_OWNER_DISCONNECTED: &str = "owner_disconnected";
pub const REASON_STOPPED_BY_USER: &str = "stopped_by_user";

struct ActiveSearch {
    node_id: String,
    cancel_tx: watch::Sender<bool>,
    ticker: JoinHandle<()>,
}

pub struct AnalysisCoordinator {
    supervisor: Arc<UsiSupervisor>,
    store: Arc<SqliteStore>,
    events: broadcast::Sender<ServerMessage>,
    current: tokio::sync::Mutex<Option<ActiveSearch>>,
}

impl AnalysisCoordinator {
    pub fn new(
        supervisor: Arc<UsiSupervisor>,
        store: Arc<SqliteStore>,
        events: broadcast::Sender<ServerMessage>,
    ) -> Self {
        Self {
            supervisor,
            store,
            events,
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn supervisor(&self) -> &Arc<UsiSupervisor> {
        &self.supervisor
    }

    pub fn is_available(&self) -> bool {
        self.supervisor.is_configured()
    }

    /// Node id of the search currently running, if any. A ticker that ended
    /// on its own (engine exit) no longer counts as active, so the next
    /// enable attempts a fresh spawn.
    pub async fn active_node(&self) -> Option<String> {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|a| a.ticker.is_finished()) {
            *current = None;
        }
        current.as_ref().map(|a| a.node_id.clone())
    }

    /// Start analyzing a position, silently replacing any running search
    /// (position-change and disable stops are announced via [`stop`];
    /// MultiPV restarts swap without a terminal event).
    pub async fn start(
        &self,
        node_id: &str,
        position_cmd: &str,
        multipv: u8,
    ) -> Result<(), EngineError> {
        let mut current = self.current.lock().await;
        self.cancel_locked(&mut current).await;

        // Baseline before `go`: an exit that races the ticker spawn is
        // still observed as a change.
        let exit_rx = self.supervisor.exit_signal();
        let exit_baseline = *exit_rx.borrow();

        let handle = match self.supervisor.start_search(position_cmd, multipv).await {
            Ok(handle) => handle,
            Err(err) => {
                let _ = self.events.send(ServerMessage::stopped(err.reason_tag()));
                let _ = self
                    .events
                    .send(ServerMessage::toast(ToastLevel::Error, err.to_string()));
                return Err(err);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ticker = tokio::spawn(ticker_loop(
            handle,
            node_id.to_string(),
            Arc::clone(&self.store),
            self.events.clone(),
            cancel_rx,
            exit_rx,
            exit_baseline,
        ));
        *current = Some(ActiveSearch {
            node_id: node_id.to_string(),
            cancel_tx,
            ticker,
        });
        debug!(target: "kifulab::analysis", "analysis started for node {}", node_id);
        Ok(())
    }

    /// Stop any running search and emit `analysis:stopped{reason}`. The
    /// ticker is joined before the event goes out, so no update can trail
    /// the stop. Acknowledged even with no active search, so the UI
    /// converges after refused enables.
    pub async fn stop(&self, reason: &str) {
        let mut current = self.current.lock().await;
        self.cancel_locked(&mut current).await;
        let _ = self.events.send(ServerMessage::stopped(reason));
    }

    /// Terminate the ticker and the engine search, emitting nothing
    async fn cancel_locked(&self, current: &mut Option<ActiveSearch>) {
        let Some(active) = current.take() else {
            return;
        };
        let _ = active.cancel_tx.send(true);
        let _ = active.ticker.await;
        if let Err(err) = self.supervisor.stop_search().await {
            warn!(target: "kifulab::analysis", "stop_search failed: {}", err);
        }
        debug!(target: "kifulab::analysis", "analysis cancelled for node {}", active.node_id);
    }

    pub async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        self.cancel_locked(&mut current).await;
        self.supervisor.shutdown().await;
    }
}

fn lines_signature(node_id: &str, lines: &[PvLine]) -> u64 {
    let mut hasher = DefaultHasher::new();
    node_id.hash(&mut hasher);
    for line in lines {
        line.pv_index.hash(&mut hasher);
        line.score_value.hash(&mut hasher);
        line.depth.hash(&mut hasher);
        line.pv_usi.hash(&mut hasher);
    }
    hasher.finish()
}

async fn ticker_loop(
    handle: SearchHandle,
    node_id: String,
    store: Arc<SqliteStore>,
    events: broadcast::Sender<ServerMessage>,
    mut cancel_rx: watch::Receiver<bool>,
    mut exit_rx: watch::Receiver<u64>,
    exit_baseline: u64,
) {
    let mut last_flush_version = 0u64;
    let mut last_flush_at: Option<Instant> = None;
    let mut last_signature: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel_rx.wait_for(|v| *v) => {
                // The canceller emits the terminal event after joining us.
                return;
            }
            changed = exit_rx.wait_for(|v| *v > exit_baseline) => {
                if changed.is_ok() {
                    let _ = events.send(ServerMessage::stopped("exited"));
                    let _ = events.send(ServerMessage::toast(
                        ToastLevel::Error,
                        "analysis engine process exited",
                    ));
                }
                return;
            }
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }

        let elapsed_ms = handle.elapsed_ms();
        let interval_ms = if elapsed_ms < FAST_CADENCE_WINDOW_MS {
            FAST_CADENCE_MS
        } else {
            SLOW_CADENCE_MS
        };
        if let Some(at) = last_flush_at {
            if at.elapsed() < Duration::from_millis(interval_ms) {
                continue;
            }
        }

        let (version, lines) = handle.snapshot();
        if version == last_flush_version || lines.is_empty() {
            continue;
        }
        last_flush_version = version;
        last_flush_at = Some(Instant::now());

        let update = AnalysisUpdate {
            node_id: node_id.clone(),
            elapsed_ms,
            multipv: handle.multipv,
            bestline: lines.first().cloned(),
            lines,
        };
        let signature = lines_signature(&node_id, &update.lines);
        let _ = events.send(ServerMessage::AnalysisUpdate(update.clone()));

        if last_signature != Some(signature) {
            last_signature = Some(signature);
            if let Err(err) =
                store.append_snapshot(&node_id, elapsed_ms, update.multipv, &update.lines)
            {
                warn!(target: "kifulab::analysis", "snapshot write failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{parse_info_line, ScoreKind};

    #[test]
    fn signature_changes_with_content() {
        let a = parse_info_line("info depth 10 score cp 40 pv 7g7f 3c3d").unwrap();
        let mut b = a.clone();
        let sig_a = lines_signature("n1", std::slice::from_ref(&a));
        assert_eq!(sig_a, lines_signature("n1", std::slice::from_ref(&a)));
        b.score_value = 41;
        assert_ne!(sig_a, lines_signature("n1", std::slice::from_ref(&b)));
        assert_ne!(sig_a, lines_signature("n2", std::slice::from_ref(&a)));
    }

    #[test]
    fn signature_ignores_counters() {
        let a = parse_info_line("info depth 10 score cp 40 nodes 100 nps 1000 pv 7g7f").unwrap();
        let mut b = a.clone();
        b.nodes = 999;
        b.nps = 123_456;
        assert_eq!(a.score_type, ScoreKind::Cp);
        assert_eq!(
            lines_signature("n1", std::slice::from_ref(&a)),
            lines_signature("n1", std::slice::from_ref(&b))
        );
    }
}
