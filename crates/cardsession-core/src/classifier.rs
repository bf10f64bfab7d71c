//! Streaming scanner that turns client output into one diagnosis per burst.
//!
//! The classifier holds no timer of its own. It keeps a deadline that the
//! owner sleeps on; every matching chunk pushes the deadline out by the
//! quiet period, and [`OutputClassifier::poll`] fires once it has passed.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Severity of what the output revealed about the card, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ThreatLevel {
    #[default]
    None = 0,
    Hardened = 1,
    WeakPrng = 2,
    StaticNonce = 3,
    UnrecoverableGen = 4,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatLevel::None => "none",
            ThreatLevel::Hardened => "hardened",
            ThreatLevel::WeakPrng => "weak PRNG",
            ThreatLevel::StaticNonce => "static nonce",
            ThreatLevel::UnrecoverableGen => "FM11RF08S",
        };
        f.write_str(name)
    }
}

/// Output signatures, lowercase. Checked in order; the first hit wins for a
/// chunk, which is also the highest level it contains.
const SIGNATURES: &[(&str, ThreatLevel)] = &[
    (
        "hint: try `script run fm11rf08s_recovery.py",
        ThreatLevel::UnrecoverableGen,
    ),
    ("[+] static nonce... yes", ThreatLevel::StaticNonce),
    ("[+] static enc nonce... yes", ThreatLevel::StaticNonce),
    ("[+] prng....... weak", ThreatLevel::WeakPrng),
    ("hardened mifare classic", ThreatLevel::Hardened),
];

/// Printed by the client when the card answers magic (writable block 0)
/// backdoor commands.
const MAGIC_MARKER: &str = "gen 2 / cuid";

/// Highest signature level found in `chunk`, if any.
pub fn match_signature(chunk: &str) -> Option<ThreatLevel> {
    let lower = chunk.to_lowercase();
    SIGNATURES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|&(_, level)| level)
}

/// User-facing advice for one completed burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub level: ThreatLevel,
    /// The magic-card marker was seen earlier in this session.
    pub magic_card: bool,
    pub title: String,
    pub message: String,
    /// Sectors with at least one known key when the diagnosis fired.
    pub known_key_sectors: usize,
}

impl Diagnosis {
    fn new(level: ThreatLevel, magic_card: bool) -> Self {
        let (title, body) = match level {
            ThreatLevel::UnrecoverableGen => (
                "FM11RF08S detected",
                "This card is immune to the classic nested attack.\n\n\
                 Next step: run the fm11rf08s recovery script directly.",
            ),
            ThreatLevel::StaticNonce => (
                "Static nonce vulnerability",
                "The card uses a static nonce.\n\n\
                 1. Scan for default keys to obtain at least one key.\n\
                 2. Run the static nonce attack from that key; it finishes almost instantly.",
            ),
            ThreatLevel::WeakPrng => (
                "Weak PRNG vulnerability",
                "The card's random number generator is weak.\n\n\
                 1. Scan for default keys.\n\
                 2. Run a nested attack from any key found.",
            ),
            ThreatLevel::Hardened | ThreatLevel::None => (
                "Hardened card",
                "The card has been patched against the classic attacks.\n\n\
                 1. Scan for default keys and hope for a hit.\n\
                 2. With at least one key, run the hardnested attack.",
            ),
        };
        let message = if magic_card {
            format!("Gen 2 / CUID magic card detected.\n\n{body}")
        } else {
            body.to_string()
        };
        Self {
            level,
            magic_card,
            title: title.to_string(),
            message,
            known_key_sectors: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    quiet: Duration,
    pending: ThreatLevel,
    deadline: Option<Instant>,
    magic_seen: bool,
    /// End of the previous chunk, so a marker split across chunks is seen.
    tail: String,
}

impl OutputClassifier {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: ThreatLevel::None,
            deadline: None,
            magic_seen: false,
            tail: String::new(),
        }
    }

    /// Scan one chunk. A signature hit raises the pending level (never
    /// lowers it) and re-arms the deadline at `now + quiet`.
    pub fn observe(&mut self, chunk: &str, now: Instant) -> Option<ThreatLevel> {
        self.track_marker(chunk);

        let level = match_signature(chunk)?;
        self.pending = self.pending.max(level);
        self.deadline = Some(now + self.quiet);
        tracing::debug!(%level, pending = %self.pending, "output signature matched");
        Some(level)
    }

    /// When the current burst is due, if one is in progress.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending_level(&self) -> ThreatLevel {
        self.pending
    }

    pub fn is_burst_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn magic_card_seen(&self) -> bool {
        self.magic_seen
    }

    /// Fire the diagnosis if the quiet period has elapsed. Returns `None`
    /// while the burst is still open or when nothing is pending.
    pub fn poll(&mut self, now: Instant) -> Option<Diagnosis> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let level = std::mem::take(&mut self.pending);
        if level == ThreatLevel::None {
            return None;
        }
        tracing::info!(%level, magic_card = self.magic_seen, "burst complete");
        Some(Diagnosis::new(level, self.magic_seen))
    }

    /// Drop the pending burst without firing and forget the session's text.
    pub fn reset(&mut self) {
        self.pending = ThreatLevel::None;
        self.deadline = None;
        self.magic_seen = false;
        self.tail.clear();
    }

    fn track_marker(&mut self, chunk: &str) {
        if self.magic_seen {
            return;
        }
        let mut window = std::mem::take(&mut self.tail);
        window.push_str(&chunk.to_lowercase());
        if window.contains(MAGIC_MARKER) {
            self.magic_seen = true;
            return;
        }
        let keep = MAGIC_MARKER.chars().count() - 1;
        let start = window
            .char_indices()
            .rev()
            .nth(keep.saturating_sub(1))
            .map_or(0, |(i, _)| i);
        self.tail = window.split_off(start);
    }
}
