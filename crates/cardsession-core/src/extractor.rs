//! Recognises artifacts announced in client output and finds them on disk.
//!
//! Patterns are a declarative table: a new naming convention is one more
//! entry in [`ARTIFACT_PATTERNS`], not a new branch in the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Instant;

use crate::backend::FileStore;
use crate::records::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Keys,
    Dump,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Keys => "key",
            ArtifactKind::Dump => "dump",
        })
    }
}

struct ArtifactPattern {
    kind: ArtifactKind,
    regex: Regex,
}

/// Key files are listed before dumps so a burst that saves both imports the
/// keys first; the dump import then layers trailer keys on top.
static ARTIFACT_PATTERNS: Lazy<Vec<ArtifactPattern>> = Lazy::new(|| {
    vec![
        ArtifactPattern {
            kind: ArtifactKind::Keys,
            regex: Regex::new(
                r"(?i)(?:saved to file|dumped to)\s+[`']?([^`'\n\r]+-key(?:-[0-9]+)?\.bin)[`']?",
            )
            .unwrap(),
        },
        ArtifactPattern {
            kind: ArtifactKind::Dump,
            regex: Regex::new(
                r"(?i)(?:saved to file|dumped to|to binary file)\s+[`']?([^`'\n\r]+-dump(?:-[0-9]+)?\.bin)[`']?",
            )
            .unwrap(),
        },
    ]
});

/// One row of a block read-back table: `[=]   4 | 00 11 ... FF | ascii`.
static BLOCK_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\[=\]\s+(\d+)\s*\|\s*((?:[0-9A-Fa-f]{2}\s+){15}[0-9A-Fa-f]{2})\s*\|")
        .unwrap()
});

/// An artifact path as announced by the client, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMatch {
    pub kind: ArtifactKind,
    pub raw_path: String,
}

/// First announced artifact of each kind in `chunk`, keys before dumps.
pub fn scan_artifacts(chunk: &str) -> Vec<ArtifactMatch> {
    ARTIFACT_PATTERNS
        .iter()
        .filter_map(|pattern| {
            let caps = pattern.regex.captures(chunk)?;
            let raw_path = caps.get(1)?.as_str().trim().to_string();
            Some(ArtifactMatch {
                kind: pattern.kind,
                raw_path,
            })
        })
        .collect()
}

/// Block contents printed by a read-block command.
pub fn scan_block_reads(chunk: &str) -> Vec<(usize, Block)> {
    BLOCK_LINE_RE
        .captures_iter(chunk)
        .filter_map(|caps| {
            let index = caps[1].parse().ok()?;
            let block = caps[2].parse().ok()?;
            Some((index, block))
        })
        .collect()
}

/// Where a relative artifact path ended up, and whether anything was there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub exists: bool,
}

/// Ordered list of directories a relative artifact path may be relative to.
#[derive(Debug, Clone)]
pub struct PathResolver {
    dirs: Vec<PathBuf>,
}

impl PathResolver {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Absolute paths are taken as-is. Relative ones go to the first
    /// directory where the file exists; when none has it, the first
    /// directory is returned anyway and the load reports the failure.
    pub fn resolve(&self, fs: &dyn FileStore, raw: &str) -> ResolvedPath {
        let raw_path = Path::new(raw);
        if raw_path.is_absolute() {
            return ResolvedPath {
                path: raw_path.to_path_buf(),
                exists: fs.exists(raw_path),
            };
        }
        for dir in &self.dirs {
            let candidate = dir.join(raw_path);
            if fs.exists(&candidate) {
                tracing::debug!(path = %candidate.display(), "artifact resolved");
                return ResolvedPath {
                    path: candidate,
                    exists: true,
                };
            }
        }
        let fallback = self
            .dirs
            .first()
            .map_or_else(|| raw_path.to_path_buf(), |d| d.join(raw_path));
        tracing::debug!(path = %fallback.display(), "artifact not found, using best-effort path");
        ResolvedPath {
            path: fallback,
            exists: false,
        }
    }
}

/// Wait for the client to finish writing `path`.
///
/// Polls the file size every `poll` until it is the same on two polls in a
/// row, or until `bound` has elapsed. Returns whether the size settled;
/// callers go ahead with the load either way.
pub async fn wait_for_flush(
    fs: &dyn FileStore,
    path: &Path,
    bound: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + bound;
    let mut last = fs.len(path).ok();
    loop {
        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(path = %path.display(), "flush wait hit its bound");
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
        let len = fs.len(path).ok();
        if len.is_some() && len == last {
            return true;
        }
        last = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalFs;

    #[test]
    fn recognises_autopwn_key_and_dump_lines() {
        let chunk = "[+] Found keys have been dumped to `hf-mf-DEADBEEF-key-001.bin`\n\
                     [+] Saved 1024 bytes to binary file `/tmp/hf-mf-DEADBEEF-dump.bin`\n";
        let found = scan_artifacts(chunk);
        assert_eq!(
            found,
            vec![
                ArtifactMatch {
                    kind: ArtifactKind::Keys,
                    raw_path: "hf-mf-DEADBEEF-key-001.bin".to_string(),
                },
                ArtifactMatch {
                    kind: ArtifactKind::Dump,
                    raw_path: "/tmp/hf-mf-DEADBEEF-dump.bin".to_string(),
                },
            ]
        );
    }

    #[test]
    fn ignores_other_extensions_and_phrases() {
        assert!(scan_artifacts("[+] saved to file hf-mf-01020304-key.eml").is_empty());
        assert!(scan_artifacts("loaded hf-mf-01020304-dump.bin").is_empty());
        let found = scan_artifacts("[+] SAVED TO FILE 'x-dump-12.bin'");
        assert_eq!(found[0].raw_path, "x-dump-12.bin");
    }

    #[test]
    fn parses_block_read_back_rows() {
        let chunk = "[=]   # | sector 00 / 0x00                                | ascii\n\
                     [=] ----+-------------------------------------------------+-----------------\n\
                     [=]   2 | 00 11 22 33 44 55 66 77 88 99 AA BB CC DD EE FF | .\"3DUfw........\n";
        let reads = scan_block_reads(chunk);
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].0, 2);
        assert_eq!(reads[0].1.to_string(), "00112233445566778899AABBCCDDEEFF");
    }

    #[test]
    fn resolver_prefers_working_dir_then_home_then_falls_back() {
        let work = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let resolver =
            PathResolver::new(vec![work.path().to_path_buf(), home.path().to_path_buf()]);

        let missing = resolver.resolve(&LocalFs, "a-key.bin");
        assert_eq!(missing.path, work.path().join("a-key.bin"));
        assert!(!missing.exists);

        std::fs::write(home.path().join("a-key.bin"), b"x").unwrap();
        let in_home = resolver.resolve(&LocalFs, "a-key.bin");
        assert_eq!(in_home.path, home.path().join("a-key.bin"));

        std::fs::write(work.path().join("a-key.bin"), b"x").unwrap();
        assert_eq!(
            resolver.resolve(&LocalFs, "a-key.bin").path,
            work.path().join("a-key.bin")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_wait_is_bounded_for_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let settled = wait_for_flush(
            &LocalFs,
            &dir.path().join("never.bin"),
            Duration::from_millis(500),
            Duration::from_millis(50),
        )
        .await;
        assert!(!settled);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_wait_ends_early_once_size_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done-key.bin");
        std::fs::write(&path, [0u8; 12]).unwrap();
        let start = Instant::now();
        let settled = wait_for_flush(
            &LocalFs,
            &path,
            Duration::from_millis(500),
            Duration::from_millis(50),
        )
        .await;
        assert!(settled);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }
}
