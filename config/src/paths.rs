use std::path::PathBuf;
use std::sync::OnceLock;

static DATA_DIR_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

pub struct PathManager;

impl PathManager {
    /// Set a custom data directory (overrides the default location)
    pub fn set_data_dir(path: PathBuf) {
        let _ = DATA_DIR_OVERRIDE.set(path);
    }

    // Helper to get the base data directory
    fn base_data_dir() -> Option<PathBuf> {
        if let Some(d) = DATA_DIR_OVERRIDE.get() {
            return Some(d.clone());
        }
        // Use ~/.local/share/kifulab on all desktop platforms
        dirs::home_dir().map(|h| h.join(".local/share/kifulab"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        Self::base_data_dir()
    }

    /// Path to the main SQLite database file
    pub fn db_path() -> Option<PathBuf> {
        Self::data_dir().map(|d| d.join("kifulab.db"))
    }

    /// Path to the unified settings file
    pub fn settings_path() -> Option<PathBuf> {
        Self::data_dir().map(|d| d.join("settings.toml"))
    }

    pub fn logs_dir() -> Option<PathBuf> {
        Self::data_dir().map(|d| d.join("logs"))
    }
}
