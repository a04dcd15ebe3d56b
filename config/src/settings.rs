//! Application settings management

use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// USI engine launch and tuning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Engine command: program followed by arguments. Empty means analysis
    /// is unavailable until configured.
    #[serde(default)]
    pub command: Vec<String>,
    /// Search threads (0 = number of CPUs)
    #[serde(default)]
    pub threads: u32,
    /// Transposition table size in MiB
    #[serde(default = "default_hash_mb")]
    pub hash_mb: u32,
    /// usi/usiok and isready/readyok timeout in seconds
    #[serde(default = "default_handshake_timeout_s")]
    pub handshake_timeout_s: u64,
    /// stop -> bestmove timeout in seconds
    #[serde(default = "default_stop_timeout_s")]
    pub stop_timeout_s: u64,
}

fn default_hash_mb() -> u32 {
    512
}

fn default_handshake_timeout_s() -> u64 {
    5
}

fn default_stop_timeout_s() -> u64 {
    3
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            threads: 0,
            hash_mb: default_hash_mb(),
            handshake_timeout_s: default_handshake_timeout_s(),
            stop_timeout_s: default_stop_timeout_s(),
        }
    }
}

impl EngineSettings {
    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    /// Effective thread count: 0 means "use every CPU"
    pub fn effective_threads(&self) -> u32 {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }
}

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Listen address for the HTTP server
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Database file path; `None` falls back to the managed data directory
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: None,
            engine: EngineSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found,
    /// then apply KIFULAB_* environment overrides.
    pub fn load() -> Self {
        let mut settings = Self::load_file().unwrap_or_default();
        settings.apply_env();
        settings
    }

    fn load_file() -> Option<Self> {
        let path = PathManager::settings_path()?;
        let content = fs::read_to_string(&path).ok()?;
        toml::from_str(&content).ok()
    }

    /// Environment variables win over the settings file.
    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("KIFULAB_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
        if let Ok(path) = env::var("KIFULAB_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(cmd) = env::var("KIFULAB_ENGINE_CMD") {
            let parts: Vec<String> = cmd.split_whitespace().map(String::from).collect();
            if !parts.is_empty() {
                self.engine.command = parts;
            }
        }
        if let Some(threads) = int_env("KIFULAB_ENGINE_THREADS", 1, 512) {
            self.engine.threads = threads;
        }
        if let Some(hash_mb) = int_env("KIFULAB_ENGINE_HASH_MB", 16, 65536) {
            self.engine.hash_mb = hash_mb;
        }
    }

    /// Save settings to the settings file
    pub fn save(&self) -> Result<(), String> {
        let path = PathManager::settings_path().ok_or("Could not determine settings path")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("Failed to create config dir: {}", e))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(&path, content).map_err(|e| format!("Failed to write settings: {}", e))?;
        Ok(())
    }
}

/// Parse a clamped integer environment variable; unset or unparsable is None.
fn int_env(name: &str, min: u32, max: u32) -> Option<u32> {
    let raw = env::var(name).ok()?;
    let value: u32 = raw.trim().parse().ok()?;
    Some(value.clamp(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_engine() {
        let settings = Settings::default();
        assert!(!settings.engine.is_configured());
        assert_eq!(settings.engine.hash_mb, 512);
        assert_eq!(settings.listen_addr, "127.0.0.1:8787");
    }

    #[test]
    fn toml_round_trip() {
        let mut settings = Settings::default();
        settings.engine.command = vec!["/opt/yaneuraou/engine".to_string()];
        settings.engine.threads = 4;

        let text = toml::to_string_pretty(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.engine.command, settings.engine.command);
        assert_eq!(back.engine.threads, 4);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let back: Settings = toml::from_str("listen_addr = \"0.0.0.0:9000\"\n").unwrap();
        assert_eq!(back.listen_addr, "0.0.0.0:9000");
        assert_eq!(back.engine.handshake_timeout_s, 5);
        assert_eq!(back.engine.stop_timeout_s, 3);
    }
}
