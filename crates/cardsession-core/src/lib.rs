use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod backend;
pub mod classifier;
pub mod command;
pub mod config_file;
pub mod discovery;
pub mod extractor;
pub mod formats;
pub mod integrity;
pub mod orchestrator;
pub mod records;
pub mod selection;
pub mod topology;

// Re-export for convenience
pub use backend::{CommandSink, FileStore, LocalFs, StoreError};
pub use classifier::{Diagnosis, OutputClassifier, ThreatLevel};
pub use command::CardCommand;
pub use discovery::{ArtifactCandidate, RestoreProposal, discover_restore_pair};
pub use extractor::{ArtifactKind, ArtifactMatch, PathResolver, scan_artifacts};
pub use integrity::{
    compute_bcc, merge_trailer_key_b, require_real_block_zero, validate_block_zero,
};
pub use orchestrator::{
    EngineInput, Outcome, Request, RestoreRequest, SessionEvent, SessionOrchestrator,
};
pub use records::{Block, CardData, Key, KeyRecord, KeyType};
pub use selection::{CheckState, SelectionModel};
pub use topology::{CardKind, CardTopology};

/// Failures of the destructive-write guards. Never retried automatically:
/// recovering from either requires a fresh read of the card.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// Block 0 checksum does not match its UID bytes (7-byte UID card or a
    /// truncated read).
    #[error("BCC mismatch: block 0 stores {found:02X}, UID bytes give {expected:02X}")]
    BccMismatch { expected: u8, found: u8 },
    /// No authoritative block 0 is available.
    #[error("no real block 0 available: {0}")]
    MissingRead(String),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("another operation is still in flight")]
    Busy,
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} {kind} files share the newest timestamp, pick one explicitly", candidates.len())]
    AmbiguousMatch {
        kind: ArtifactKind,
        candidates: Vec<PathBuf>,
    },
    #[error("{what} index {index} out of range (0..{len})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("changing card type drops {dropped_blocks} non-empty blocks, confirmation required")]
    ConfirmationRequired { dropped_blocks: usize },
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => CoreError::NotFound(path),
            StoreError::Io { path, source } => CoreError::Io { path, source },
        }
    }
}

/// Runtime configuration for one card session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory the external client runs in; artifacts with relative paths
    /// are looked up here first, and patched dumps are written here.
    pub working_dir: PathBuf,
    /// User home directory, second candidate for relative artifact paths and
    /// destination of generated key/template files.
    pub home_dir: Option<PathBuf>,
    pub card_kind: CardKind,
    /// Quiet period of the output classifier.
    pub debounce: Duration,
    /// Upper bound on waiting for an announced artifact to be flushed.
    pub artifact_flush: Duration,
    pub flush_poll: Duration,
    /// Searched after the working and home directories.
    pub extra_search_dirs: Vec<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            home_dir: dirs::home_dir(),
            card_kind: CardKind::Classic1K,
            debounce: Duration::from_millis(500),
            artifact_flush: Duration::from_millis(500),
            flush_poll: Duration::from_millis(50),
            extra_search_dirs: vec![],
        }
    }
}

impl SessionConfig {
    /// Build a runtime config from an on-disk config, falling back to
    /// defaults for anything the file leaves out.
    pub fn from_file(file: &config_file::ConfigFile) -> Self {
        let mut config = Self::default();
        if let Some(session) = &file.session {
            if let Some(dir) = &session.working_dir {
                config.working_dir = PathBuf::from(dir);
            }
            if let Some(kind) = session.card_type.as_deref().and_then(|k| k.parse().ok()) {
                config.card_kind = kind;
            }
        }
        if let Some(timing) = &file.timing {
            if let Some(ms) = timing.debounce_ms {
                config.debounce = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.artifact_flush_ms {
                config.artifact_flush = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.flush_poll_ms {
                config.flush_poll = Duration::from_millis(ms.max(1));
            }
        }
        if let Some(dirs) = file.discovery.as_ref().and_then(|d| d.extra_dirs.as_ref()) {
            config.extra_search_dirs = dirs.iter().map(PathBuf::from).collect();
        }
        config
    }

    /// Directories searched for artifacts, in priority order. The first
    /// entry is also the best-effort fallback.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.working_dir.clone()];
        if let Some(home) = &self.home_dir {
            dirs.push(home.clone());
        }
        dirs.extend(self.extra_search_dirs.iter().cloned());
        dirs
    }

    /// Where generated files (key files, blank templates) are written.
    pub fn output_dir(&self) -> PathBuf {
        self.home_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_file::{ConfigFile, DiscoveryConfig, SessionSection, TimingConfig};

    #[test]
    fn from_file_overrides_only_present_fields() {
        let file = ConfigFile {
            session: Some(SessionSection {
                working_dir: Some("/opt/pm3".to_string()),
                card_type: Some("4k".to_string()),
            }),
            timing: Some(TimingConfig {
                debounce_ms: Some(750),
                ..Default::default()
            }),
            discovery: Some(DiscoveryConfig {
                extra_dirs: Some(vec!["/srv/dumps".to_string()]),
            }),
        };
        let config = SessionConfig::from_file(&file);
        assert_eq!(config.working_dir, PathBuf::from("/opt/pm3"));
        assert_eq!(config.card_kind, CardKind::Classic4K);
        assert_eq!(config.debounce, Duration::from_millis(750));
        assert_eq!(config.artifact_flush, Duration::from_millis(500));
        assert_eq!(config.extra_search_dirs, vec![PathBuf::from("/srv/dumps")]);
    }

    #[test]
    fn search_dirs_put_working_dir_first() {
        let config = SessionConfig {
            working_dir: PathBuf::from("/work"),
            home_dir: Some(PathBuf::from("/home/u")),
            extra_search_dirs: vec![PathBuf::from("/extra")],
            ..SessionConfig::default()
        };
        assert_eq!(
            config.search_dirs(),
            vec![
                PathBuf::from("/work"),
                PathBuf::from("/home/u"),
                PathBuf::from("/extra")
            ]
        );
    }

    #[test]
    fn store_errors_map_onto_core_errors() {
        let err: CoreError = StoreError::NotFound(PathBuf::from("x.bin")).into();
        assert!(matches!(err, CoreError::NotFound(p) if p == PathBuf::from("x.bin")));
    }
}
