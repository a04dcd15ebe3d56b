//! USI engine supervisor
//!
//! Owns at most one engine child process and the whole USI protocol
//! exchange: handshake, option normalization, search lifecycle, and
//! `info` line parsing. Search output lands in a shared per-search map of
//! `pv_index -> PvLine` that the analysis coordinator samples on its own
//! schedule; the supervisor itself never throttles.
//!
//! The supervisor does not auto-restart a crashed engine — it bumps an
//! exit counter the coordinator watches and leaves the decision there.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use kifulab_config::EngineSettings;

const IO_LOG_CAPACITY: usize = 120;

#[derive(Debug, Clone)]
pub enum EngineError {
    NotConfigured,
    SpawnFailed(String),
    HandshakeTimeout(String),
    ProtocolError(String),
    Exited(String),
}

impl EngineError {
    /// Tag used in `analysis:stopped{reason}` payloads
    pub fn reason_tag(&self) -> &'static str {
        match self {
            EngineError::NotConfigured => "not_configured",
            EngineError::SpawnFailed(_) => "spawn_failed",
            EngineError::HandshakeTimeout(_) => "handshake_timeout",
            EngineError::ProtocolError(_) => "protocol_error",
            EngineError::Exited(_) => "exited",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotConfigured => write!(f, "USI engine is not configured"),
            EngineError::SpawnFailed(msg) => write!(f, "failed to start engine: {}", msg),
            EngineError::HandshakeTimeout(msg) => write!(f, "engine handshake timed out: {}", msg),
            EngineError::ProtocolError(msg) => write!(f, "engine protocol error: {}", msg),
            EngineError::Exited(msg) => write!(f, "engine process exited: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    NotConfigured,
    Idle,
    Starting,
    Ready,
    Searching,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    Cp,
    Mate,
    Unknown,
}

/// One principal variation as last reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvLine {
    pub pv_index: u8,
    pub score_type: ScoreKind,
    pub score_value: i64,
    pub depth: u32,
    pub seldepth: u32,
    pub nodes: u64,
    pub nps: u64,
    pub hashfull: u32,
    pub pv_usi: Vec<String>,
}

/// Parse a USI `info` line. Lines without a `pv` move list are dropped:
/// they only update counters and must never clear a stored variation.
pub fn parse_info_line(line: &str) -> Option<PvLine> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"info") {
        return None;
    }

    let mut out = PvLine {
        pv_index: 1,
        score_type: ScoreKind::Unknown,
        score_value: 0,
        depth: 0,
        seldepth: 0,
        nodes: 0,
        nps: 0,
        hashfull: 0,
        pv_usi: Vec::new(),
    };

    let mut i = 1;
    while i < tokens.len() {
        match tokens[i] {
            "pv" => {
                out.pv_usi = tokens[i + 1..].iter().map(|s| s.to_string()).collect();
                break;
            }
            "multipv" => {
                if let Some(value) = tokens.get(i + 1).and_then(|t| t.parse::<u8>().ok()) {
                    out.pv_index = value.max(1);
                }
                i += 2;
            }
            "depth" | "seldepth" | "nodes" | "nps" | "hashfull" => {
                let value = tokens.get(i + 1).and_then(|t| t.parse::<u64>().ok()).unwrap_or(0);
                match tokens[i] {
                    "depth" => out.depth = value as u32,
                    "seldepth" => out.seldepth = value as u32,
                    "nodes" => out.nodes = value,
                    "nps" => out.nps = value,
                    _ => out.hashfull = value as u32,
                }
                i += 2;
            }
            "score" => {
                let kind = tokens.get(i + 1).copied();
                let value = tokens.get(i + 2).and_then(|t| t.parse::<i64>().ok());
                if let (Some(kind @ ("cp" | "mate")), Some(value)) = (kind, value) {
                    out.score_type = if kind == "cp" { ScoreKind::Cp } else { ScoreKind::Mate };
                    out.score_value = value;
                }
                i += 3;
                while tokens.get(i).is_some_and(|t| matches!(*t, "upperbound" | "lowerbound")) {
                    i += 1;
                }
            }
            // Unknown tokens are skipped one at a time.
            _ => i += 1,
        }
    }

    if out.pv_usi.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Parse `option name <NAME...> type ...` into the option name
fn parse_option_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix("option name ")?;
    let name: Vec<&str> = rest.split_whitespace().take_while(|t| *t != "type").collect();
    if name.is_empty() {
        None
    } else {
        Some(name.join(" "))
    }
}

/// Live PV map for one search
#[derive(Debug, Default)]
pub struct SearchState {
    pub lines: BTreeMap<u8, PvLine>,
    pub version: u64,
}

/// Handle onto a running search; the coordinator samples it on its timer
#[derive(Clone, Debug)]
pub struct SearchHandle {
    state: Arc<Mutex<SearchState>>,
    pub started_at: Instant,
    pub multipv: u8,
}

impl SearchHandle {
    /// Current consolidated line set (ascending pv_index, capped at the
    /// search's MultiPV) plus the map version.
    pub fn snapshot(&self) -> (u64, Vec<PvLine>) {
        let state = self.state.lock().unwrap();
        let lines = state
            .lines
            .values()
            .filter(|l| l.pv_index <= self.multipv)
            .cloned()
            .collect();
        (state.version, lines)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

struct EngineShared {
    engine_name: Option<String>,
    option_names: Vec<String>,
    /// Sink for `info` lines; `None` outside a search (residual lines after
    /// `stop` are discarded by clearing this first).
    search: Option<Arc<Mutex<SearchState>>>,
    status: EngineStatus,
    last_error: Option<String>,
    /// Set before an intentional quit so EOF is not reported as a crash
    closing: bool,
    io_log: VecDeque<String>,
}

impl EngineShared {
    fn log_line(&mut self, line: String) {
        if self.io_log.len() >= IO_LOG_CAPACITY {
            self.io_log.pop_front();
        }
        self.io_log.push_back(line);
    }

    fn io_tail(&self, limit: usize) -> String {
        let skip = self.io_log.len().saturating_sub(limit);
        self.io_log.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }

    fn supports_option(&self, name: &str) -> bool {
        self.option_names.iter().any(|o| o.eq_ignore_ascii_case(name))
    }
}

struct EngineProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
    usiok_rx: watch::Receiver<bool>,
    readyok_rx: watch::Receiver<u64>,
    bestmove_rx: watch::Receiver<u64>,
    eof_rx: watch::Receiver<bool>,
}

/// Engine status summary for `/healthz` and `session:granted`
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatusWire {
    pub enabled: bool,
    pub status: EngineStatus,
    pub engine_name: Option<String>,
    pub command: String,
    pub multipv: u8,
    pub threads: u32,
    pub hash_mb: u32,
    pub last_error: Option<String>,
}

pub struct UsiSupervisor {
    settings: EngineSettings,
    shared: Arc<Mutex<EngineShared>>,
    proc: tokio::sync::Mutex<Option<EngineProcess>>,
    active_multipv: Mutex<u8>,
    /// Bumped on every unexpected engine exit; the coordinator watches it
    exit_tx: watch::Sender<u64>,
    exit_rx: watch::Receiver<u64>,
}

impl UsiSupervisor {
    pub fn new(settings: EngineSettings) -> Self {
        let status = if settings.is_configured() {
            EngineStatus::Idle
        } else {
            EngineStatus::NotConfigured
        };
        let (exit_tx, exit_rx) = watch::channel(0u64);
        Self {
            settings,
            shared: Arc::new(Mutex::new(EngineShared {
                engine_name: None,
                option_names: Vec::new(),
                search: None,
                status,
                last_error: None,
                closing: false,
                io_log: VecDeque::new(),
            })),
            proc: tokio::sync::Mutex::new(None),
            active_multipv: Mutex::new(1),
            exit_tx,
            exit_rx,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }

    /// Receiver whose value bumps on every unexpected engine exit
    pub fn exit_signal(&self) -> watch::Receiver<u64> {
        self.exit_rx.clone()
    }

    pub fn status_wire(&self) -> EngineStatusWire {
        let shared = self.shared.lock().unwrap();
        EngineStatusWire {
            enabled: self.settings.is_configured(),
            status: shared.status,
            engine_name: shared.engine_name.clone(),
            command: self.settings.command.join(" "),
            multipv: *self.active_multipv.lock().unwrap(),
            threads: self.settings.effective_threads(),
            hash_mb: self.settings.hash_mb,
            last_error: shared.last_error.clone(),
        }
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.handshake_timeout_s.max(1))
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.stop_timeout_s.max(1))
    }

    fn fail(&self, err: &EngineError) {
        let mut shared = self.shared.lock().unwrap();
        shared.last_error = Some(err.to_string());
        shared.status = EngineStatus::Failed;
    }

    async fn send_line(proc: &mut EngineProcess, shared: &Arc<Mutex<EngineShared>>, line: &str) -> Result<(), EngineError> {
        shared.lock().unwrap().log_line(format!("> {}", line));
        debug!(target: "kifulab::engine", "> {}", line);
        proc.stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| EngineError::ProtocolError(format!("engine stdin write failed: {}", e)))?;
        proc.stdin
            .flush()
            .await
            .map_err(|e| EngineError::ProtocolError(format!("engine stdin flush failed: {}", e)))?;
        Ok(())
    }

    fn spawn_process(&self) -> Result<EngineProcess, EngineError> {
        let command_line = &self.settings.command;
        let program = command_line
            .first()
            .ok_or(EngineError::NotConfigured)?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(&command_line[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Engines resolve eval files relative to their binary.
        if command_line.len() == 1 {
            if let Some(parent) = Path::new(program).parent() {
                if parent.as_os_str().len() > 0 {
                    command.current_dir(parent);
                }
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::SpawnFailed(format!("{}: {}", program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::SpawnFailed("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::SpawnFailed("engine stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::SpawnFailed("engine stderr unavailable".to_string()))?;

        let (usiok_tx, usiok_rx) = watch::channel(false);
        let (readyok_tx, readyok_rx) = watch::channel(0u64);
        let (bestmove_tx, bestmove_rx) = watch::channel(0u64);
        let (eof_tx, eof_rx) = watch::channel(false);

        let shared = Arc::clone(&self.shared);
        let exit_tx = self.exit_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "kifulab::engine", "stdout read error: {}", e);
                        break;
                    }
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                {
                    let mut shared = shared.lock().unwrap();
                    shared.log_line(format!("< {}", line));
                }
                if line == "usiok" {
                    let _ = usiok_tx.send(true);
                } else if line == "readyok" {
                    readyok_tx.send_modify(|v| *v += 1);
                } else if line.starts_with("bestmove ") || line == "bestmove" {
                    bestmove_tx.send_modify(|v| *v += 1);
                } else if let Some(name) = line.strip_prefix("id name ") {
                    let mut shared = shared.lock().unwrap();
                    shared.engine_name = Some(name.trim().to_string());
                } else if line.starts_with("option name ") {
                    if let Some(name) = parse_option_name(&line) {
                        shared.lock().unwrap().option_names.push(name);
                    }
                } else if line.starts_with("info ") {
                    let sink = shared.lock().unwrap().search.clone();
                    if let (Some(sink), Some(parsed)) = (sink, parse_info_line(&line)) {
                        let mut state = sink.lock().unwrap();
                        state.lines.insert(parsed.pv_index, parsed);
                        state.version += 1;
                    }
                }
            }

            // EOF: either an intentional quit or a crash.
            let crashed = {
                let mut shared = shared.lock().unwrap();
                shared.search = None;
                let crashed = !shared.closing;
                shared.status = if crashed { EngineStatus::Failed } else { EngineStatus::Idle };
                if crashed {
                    shared.last_error = Some("engine process exited".to_string());
                }
                crashed
            };
            let _ = eof_tx.send(true);
            if crashed {
                warn!(target: "kifulab::engine", "engine process exited unexpectedly");
                exit_tx.send_modify(|v| *v += 1);
            }
        });

        let shared_err = Arc::clone(&self.shared);
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!(target: "kifulab::engine", "stderr: {}", line);
                shared_err.lock().unwrap().log_line(format!("! {}", line));
            }
        });

        Ok(EngineProcess {
            child,
            stdin,
            reader,
            stderr_reader,
            usiok_rx,
            readyok_rx,
            bestmove_rx,
            eof_rx,
        })
    }

    async fn wait_usiok(&self, proc: &mut EngineProcess) -> Result<(), EngineError> {
        let mut usiok = proc.usiok_rx.clone();
        let mut eof = proc.eof_rx.clone();
        let deadline = self.handshake_timeout();
        tokio::select! {
            res = timeout(deadline, usiok.wait_for(|v| *v)) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(EngineError::ProtocolError("engine reader closed".to_string())),
                Err(_) => Err(EngineError::HandshakeTimeout(format!(
                    "usiok\n{}",
                    self.shared.lock().unwrap().io_tail(40)
                ))),
            },
            _ = eof.wait_for(|v| *v) => Err(EngineError::Exited(format!(
                "while waiting for usiok\n{}",
                self.shared.lock().unwrap().io_tail(40)
            ))),
        }
    }

    async fn isready_roundtrip(&self, proc: &mut EngineProcess) -> Result<(), EngineError> {
        let baseline = *proc.readyok_rx.borrow();
        Self::send_line(proc, &self.shared, "isready").await?;
        let mut readyok = proc.readyok_rx.clone();
        let mut eof = proc.eof_rx.clone();
        let deadline = self.handshake_timeout();
        tokio::select! {
            res = timeout(deadline, readyok.wait_for(|v| *v > baseline)) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(EngineError::ProtocolError("engine reader closed".to_string())),
                Err(_) => Err(EngineError::HandshakeTimeout(format!(
                    "readyok\n{}",
                    self.shared.lock().unwrap().io_tail(40)
                ))),
            },
            _ = eof.wait_for(|v| *v) => Err(EngineError::Exited(format!(
                "while waiting for readyok\n{}",
                self.shared.lock().unwrap().io_tail(40)
            ))),
        }
    }

    /// Spawn + handshake + boot options if no live engine exists yet
    async fn ensure_ready_locked(
        &self,
        proc_slot: &mut Option<EngineProcess>,
    ) -> Result<(), EngineError> {
        if !self.settings.is_configured() {
            return Err(EngineError::NotConfigured);
        }

        // Reap a dead process before deciding whether to spawn.
        if let Some(proc) = proc_slot.as_mut() {
            if proc.child.try_wait().ok().flatten().is_some() {
                proc.reader.abort();
                proc.stderr_reader.abort();
                *proc_slot = None;
            }
        }

        if proc_slot.is_some() {
            return Ok(());
        }

        {
            let mut shared = self.shared.lock().unwrap();
            shared.status = EngineStatus::Starting;
            shared.last_error = None;
            shared.closing = false;
            shared.engine_name = None;
            shared.option_names.clear();
            shared.search = None;
            shared.io_log.clear();
        }

        let mut proc = match self.spawn_process() {
            Ok(proc) => proc,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        let handshake = async {
            Self::send_line(&mut proc, &self.shared, "usi").await?;
            self.wait_usiok(&mut proc).await?;

            // Boot options before the first isready; Hash naming varies.
            let threads = self.settings.effective_threads();
            let hash_mb = self.settings.hash_mb;
            let (supports_threads, hash_option) = {
                let shared = self.shared.lock().unwrap();
                let hash = if shared.supports_option("USI_Hash") {
                    Some("USI_Hash")
                } else if shared.supports_option("Hash") {
                    Some("Hash")
                } else {
                    None
                };
                (shared.supports_option("Threads"), hash)
            };
            if supports_threads {
                let line = format!("setoption name Threads value {}", threads);
                Self::send_line(&mut proc, &self.shared, &line).await?;
            }
            if let Some(option) = hash_option {
                let line = format!("setoption name {} value {}", option, hash_mb);
                Self::send_line(&mut proc, &self.shared, &line).await?;
            }

            self.isready_roundtrip(&mut proc).await?;
            Self::send_line(&mut proc, &self.shared, "usinewgame").await?;
            Ok(())
        }
        .await;

        match handshake {
            Ok(()) => {
                let name = self.shared.lock().unwrap().engine_name.clone();
                info!(target: "kifulab::engine", "engine ready: {}", name.as_deref().unwrap_or("(unnamed)"));
                self.shared.lock().unwrap().status = EngineStatus::Ready;
                *proc_slot = Some(proc);
                Ok(())
            }
            Err(err) => {
                proc.reader.abort();
                proc.stderr_reader.abort();
                let _ = proc.child.start_kill();
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Start (or replace) the infinite search for a position
    pub async fn start_search(
        &self,
        position_cmd: &str,
        multipv: u8,
    ) -> Result<SearchHandle, EngineError> {
        let mut proc_slot = self.proc.lock().await;
        self.ensure_ready_locked(&mut proc_slot).await?;

        // A still-running previous search must be stopped first.
        if self.shared.lock().unwrap().status == EngineStatus::Searching {
            self.stop_search_locked(&mut proc_slot).await?;
        }

        let proc = proc_slot.as_mut().ok_or(EngineError::NotConfigured)?;
        let multipv = multipv.clamp(1, 5);

        let result = async {
            if self.shared.lock().unwrap().supports_option("MultiPV") {
                let line = format!("setoption name MultiPV value {}", multipv);
                Self::send_line(proc, &self.shared, &line).await?;
                self.isready_roundtrip(proc).await?;
            } else if multipv > 1 {
                warn!(target: "kifulab::engine", "engine does not advertise MultiPV; requested {}", multipv);
            }

            let state = Arc::new(Mutex::new(SearchState::default()));
            {
                let mut shared = self.shared.lock().unwrap();
                shared.search = Some(Arc::clone(&state));
                shared.status = EngineStatus::Searching;
            }
            *self.active_multipv.lock().unwrap() = multipv;

            Self::send_line(proc, &self.shared, position_cmd).await?;
            Self::send_line(proc, &self.shared, "go infinite").await?;

            Ok(SearchHandle {
                state,
                started_at: Instant::now(),
                multipv,
            })
        }
        .await;

        if let Err(err) = &result {
            self.shared.lock().unwrap().search = None;
            self.fail(err);
        }
        result
    }

    async fn stop_search_locked(
        &self,
        proc_slot: &mut Option<EngineProcess>,
    ) -> Result<(), EngineError> {
        // Drop the sink first so residual info lines are discarded.
        {
            let mut shared = self.shared.lock().unwrap();
            shared.search = None;
            if shared.status == EngineStatus::Searching {
                shared.status = EngineStatus::Ready;
            }
        }

        let Some(proc) = proc_slot.as_mut() else {
            return Ok(());
        };
        if proc.child.try_wait().ok().flatten().is_some() {
            return Ok(());
        }

        let baseline = *proc.bestmove_rx.borrow();
        Self::send_line(proc, &self.shared, "stop").await?;

        let mut bestmove = proc.bestmove_rx.clone();
        let mut eof = proc.eof_rx.clone();
        let waited = tokio::select! {
            res = timeout(self.stop_timeout(), bestmove.wait_for(|v| *v > baseline)) => res.is_ok(),
            _ = eof.wait_for(|v| *v) => true,
        };
        if !waited {
            warn!(target: "kifulab::engine", "no bestmove after stop; killing engine");
            self.shared.lock().unwrap().closing = true;
            let _ = proc.child.start_kill();
            let _ = proc.child.wait().await;
            proc.reader.abort();
            proc.stderr_reader.abort();
            *proc_slot = None;
            let mut shared = self.shared.lock().unwrap();
            shared.status = EngineStatus::Idle;
        }
        Ok(())
    }

    /// Stop the active search, bounded-waiting for `bestmove`
    pub async fn stop_search(&self) -> Result<(), EngineError> {
        let mut proc_slot = self.proc.lock().await;
        self.stop_search_locked(&mut proc_slot).await
    }

    /// Quit the engine, killing it after a grace period
    pub async fn shutdown(&self) {
        let mut proc_slot = self.proc.lock().await;
        let Some(mut proc) = proc_slot.take() else {
            return;
        };
        self.shared.lock().unwrap().closing = true;
        let _ = Self::send_line(&mut proc, &self.shared, "quit").await;
        if timeout(Duration::from_secs(2), proc.child.wait()).await.is_err() {
            let _ = proc.child.start_kill();
            let _ = proc.child.wait().await;
        }
        proc.reader.abort();
        proc.stderr_reader.abort();
        let mut shared = self.shared.lock().unwrap();
        shared.search = None;
        shared.status = if self.settings.is_configured() {
            EngineStatus::Idle
        } else {
            EngineStatus::NotConfigured
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_line_with_pv_parses_all_counters() {
        let line = "info depth 18 seldepth 24 multipv 2 score cp -37 nodes 1234567 nps 890000 hashfull 412 pv 2g2f 8c8d 2f2e";
        let parsed = parse_info_line(line).unwrap();
        assert_eq!(parsed.pv_index, 2);
        assert_eq!(parsed.depth, 18);
        assert_eq!(parsed.seldepth, 24);
        assert_eq!(parsed.score_type, ScoreKind::Cp);
        assert_eq!(parsed.score_value, -37);
        assert_eq!(parsed.nodes, 1_234_567);
        assert_eq!(parsed.nps, 890_000);
        assert_eq!(parsed.hashfull, 412);
        assert_eq!(parsed.pv_usi, vec!["2g2f", "8c8d", "2f2e"]);
    }

    #[test]
    fn info_line_without_pv_is_dropped() {
        assert!(parse_info_line("info depth 10 nodes 500 nps 100000").is_none());
        assert!(parse_info_line("info string loading eval").is_none());
        assert!(parse_info_line("bestmove 7g7f").is_none());
    }

    #[test]
    fn mate_scores_are_signed() {
        let parsed = parse_info_line("info depth 9 score mate -5 pv 1a1b").unwrap();
        assert_eq!(parsed.score_type, ScoreKind::Mate);
        assert_eq!(parsed.score_value, -5);
        let parsed = parse_info_line("info depth 9 score mate 3 pv 1a1b").unwrap();
        assert_eq!(parsed.score_value, 3);
    }

    #[test]
    fn score_bounds_are_skipped() {
        let parsed =
            parse_info_line("info depth 12 score cp 80 lowerbound nodes 42 pv 7g7f").unwrap();
        assert_eq!(parsed.score_value, 80);
        assert_eq!(parsed.nodes, 42);
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let parsed =
            parse_info_line("info depth 5 currmove 7g7f currmovenumber 3 score cp 10 pv 7g7f")
                .unwrap();
        assert_eq!(parsed.depth, 5);
        assert_eq!(parsed.score_value, 10);
    }

    #[test]
    fn option_names_join_multiword() {
        assert_eq!(
            parse_option_name("option name USI_Hash type spin default 256 min 1 max 33554432"),
            Some("USI_Hash".to_string())
        );
        assert_eq!(
            parse_option_name("option name Book File type string default book.bin"),
            Some("Book File".to_string())
        );
        assert_eq!(parse_option_name("id name Engine"), None);
    }

    #[test]
    fn search_handle_filters_by_multipv() {
        let state = Arc::new(Mutex::new(SearchState::default()));
        {
            let mut s = state.lock().unwrap();
            for idx in 1..=3u8 {
                let mut line = parse_info_line("info depth 1 score cp 0 pv 7g7f").unwrap();
                line.pv_index = idx;
                s.lines.insert(idx, line);
            }
            s.version = 3;
        }
        let handle = SearchHandle {
            state,
            started_at: Instant::now(),
            multipv: 2,
        };
        let (version, lines) = handle.snapshot();
        assert_eq!(version, 3);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.pv_index <= 2));
    }
}
