use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub session: Option<SessionSection>,
    pub timing: Option<TimingConfig>,
    pub discovery: Option<DiscoveryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSection {
    pub working_dir: Option<String>,
    /// One of `mini`, `1k`, `2k`, `4k`.
    pub card_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    pub debounce_ms: Option<u64>,
    pub artifact_flush_ms: Option<u64>,
    pub flush_poll_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub extra_dirs: Option<Vec<String>>,
}

/// Platform config directory path: `<config_dir>/cardsession/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cardsession").join("config.toml"))
}

/// Load config by cascading CWD `.cardsession.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".cardsession.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config");
            None
        }
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        session: Some(SessionSection {
            working_dir: overlay
                .session
                .as_ref()
                .and_then(|s| s.working_dir.clone())
                .or_else(|| base.session.as_ref().and_then(|s| s.working_dir.clone())),
            card_type: overlay
                .session
                .as_ref()
                .and_then(|s| s.card_type.clone())
                .or_else(|| base.session.as_ref().and_then(|s| s.card_type.clone())),
        }),
        timing: Some(TimingConfig {
            debounce_ms: overlay
                .timing
                .as_ref()
                .and_then(|t| t.debounce_ms)
                .or_else(|| base.timing.as_ref().and_then(|t| t.debounce_ms)),
            artifact_flush_ms: overlay
                .timing
                .as_ref()
                .and_then(|t| t.artifact_flush_ms)
                .or_else(|| base.timing.as_ref().and_then(|t| t.artifact_flush_ms)),
            flush_poll_ms: overlay
                .timing
                .as_ref()
                .and_then(|t| t.flush_poll_ms)
                .or_else(|| base.timing.as_ref().and_then(|t| t.flush_poll_ms)),
        }),
        discovery: Some(DiscoveryConfig {
            extra_dirs: overlay
                .discovery
                .as_ref()
                .and_then(|d| d.extra_dirs.clone())
                .or_else(|| base.discovery.as_ref().and_then(|d| d.extra_dirs.clone())),
        }),
    }
}
