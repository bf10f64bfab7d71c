use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cardsession_core::formats::{self, DumpFormat};
use cardsession_core::records::normalize_hex;
use cardsession_core::{
    CardData, CardKind, CardTopology, EngineInput, LocalFs, SessionConfig, SessionOrchestrator,
    config_file, integrity,
};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod output;

use output::ColorMode;

/// Card Session Engine - offline tools for MIFARE Classic dumps and client logs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the BCC byte of a 4-byte UID
    Bcc {
        /// UID as 8 hex symbols (spaces allowed)
        uid: String,
    },

    /// Check a block 0 string the way every block 0 write is checked
    CheckBlock0 {
        /// Block 0 as 32 hex symbols
        block0: String,
    },

    /// Put a new UID into block 0, recomputing the BCC
    RewriteUid {
        /// Current block 0 as 32 hex symbols
        #[arg(long)]
        block0: String,

        /// New UID as 8 hex symbols
        #[arg(long)]
        uid: String,
    },

    /// Repair zeroed trailer KeyB fields of a dump from a key file
    PatchDump {
        /// Dump to patch (.bin, or .eml/.txt text)
        #[arg(long)]
        dump: PathBuf,

        /// Key file holding the real keys
        #[arg(long)]
        keys: PathBuf,

        /// Where to write the patched binary dump
        #[arg(long)]
        out: PathBuf,

        /// Card type: mini, 1k, 2k or 4k
        #[arg(long)]
        card_type: Option<CardKind>,
    },

    /// Build a blank-card image that keeps block 0 of an existing dump
    Template {
        /// Dump to take block 0 from
        #[arg(long)]
        dump: PathBuf,

        /// Where to write the blank binary dump
        #[arg(long)]
        out: PathBuf,

        /// Card type: mini, 1k, 2k or 4k
        #[arg(long)]
        card_type: Option<CardKind>,
    },

    /// Find the newest dump/key pair for a UID
    FindRestore {
        /// UID as 8 hex symbols
        #[arg(long)]
        uid: String,

        /// Directories to search, in order (default: working dir, then home)
        #[arg(long)]
        dir: Vec<PathBuf>,
    },

    /// Replay a client log through a session and print what it triggers
    Classify {
        /// Log file to replay (default: stdin)
        log: Option<PathBuf>,

        /// Directory the client ran in, for relative artifact paths
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let color = ColorMode(!cli.no_color);
    let mut writer: Box<dyn Write> = Box::new(std::io::stdout());

    match cli.command {
        Command::Bcc { uid } => {
            let bcc = bcc_of(&uid)?;
            writeln!(writer, "{bcc:02X}")?;
        }
        Command::CheckBlock0 { block0 } => {
            let block = integrity::validate_block_zero(&block0)?;
            output::print_block_zero(&mut writer, &block, color)?;
            output::print_ok(&mut writer, "BCC matches UID", color)?;
        }
        Command::RewriteUid { block0, uid } => {
            let block = integrity::rewrite_uid(&block0, &uid)?;
            writeln!(writer, "{block}")?;
        }
        Command::PatchDump {
            dump,
            keys,
            out,
            card_type,
        } => {
            let config = session_config(None, card_type);
            let patched = patch_dump(&dump, &keys, &out, config.card_kind)?;
            output::print_ok(
                &mut writer,
                &format!("{patched} trailer(s) patched, written to {}", out.display()),
                color,
            )?;
        }
        Command::Template {
            dump,
            out,
            card_type,
        } => {
            let config = session_config(None, card_type);
            write_template(&dump, &out, config.card_kind)?;
            output::print_ok(
                &mut writer,
                &format!("blank template written to {}", out.display()),
                color,
            )?;
        }
        Command::FindRestore { uid, dir } => {
            let dirs = if dir.is_empty() {
                session_config(None, None).search_dirs()
            } else {
                dir
            };
            let proposal = cardsession_core::discover_restore_pair(&LocalFs, &dirs, &uid)?;
            output::print_proposal(&mut writer, &uid, proposal.as_ref(), color)?;
        }
        Command::Classify { log, workdir } => {
            let text = read_log(log.as_deref())?;
            let config = session_config(workdir, None);
            classify(&text, config, &mut writer, color).await?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Resolve configuration: CLI flags > env vars > config file > defaults
fn session_config(workdir: Option<PathBuf>, card_type: Option<CardKind>) -> SessionConfig {
    let mut config = SessionConfig::from_file(&config_file::load_config());
    let workdir =
        workdir.or_else(|| std::env::var("CARDSESSION_WORKDIR").ok().map(PathBuf::from));
    if let Some(dir) = workdir {
        config.working_dir = dir;
    }
    if let Some(kind) = card_type {
        config.card_kind = kind;
    }
    config
}

fn bcc_of(uid: &str) -> anyhow::Result<u8> {
    let hex = normalize_hex(uid);
    if hex.len() != 8 {
        anyhow::bail!("UID must be exactly 8 hex symbols, got {}", hex.len());
    }
    let value = u32::from_str_radix(&hex, 16)
        .map_err(|e| anyhow::anyhow!("UID is not valid hex: {e}"))?;
    Ok(integrity::compute_bcc(value.to_be_bytes()))
}

fn read_dump(path: &Path) -> anyhow::Result<Vec<Option<cardsession_core::Block>>> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    Ok(formats::decode_dump(&bytes, DumpFormat::from_path(path))?)
}

/// Returns how many trailers were patched.
fn patch_dump(dump: &Path, keys: &Path, out: &Path, kind: CardKind) -> anyhow::Result<usize> {
    let mut data = CardData::new(CardTopology::new(kind));
    data.replace_blocks(read_dump(dump)?);
    let key_bytes = std::fs::read(keys)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", keys.display()))?;
    data.replace_keys(formats::decode_keys(
        &key_bytes,
        data.topology().sector_count(),
    )?);

    let patched = integrity::patch_trailers(&mut data);
    let bytes = formats::encode_dump(data.blocks(), DumpFormat::Binary)?;
    std::fs::write(out, bytes)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", out.display()))?;
    tracing::info!(patched, out = %out.display(), "dump patched");
    Ok(patched)
}

fn write_template(dump: &Path, out: &Path, kind: CardKind) -> anyhow::Result<()> {
    let blocks = read_dump(dump)?;
    let block0 = blocks.first().copied().flatten().map(|b| b.to_string());
    let block0 = integrity::require_real_block_zero(block0.as_deref())?;
    let template = integrity::blank_template(&CardTopology::new(kind), block0);
    let bytes = formats::encode_dump(&template, DumpFormat::Binary)?;
    std::fs::write(out, bytes)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", out.display()))?;
    Ok(())
}

fn read_log(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

/// Feed `text` line by line into a running session and print every event
/// until the session has been quiet long enough for any burst to settle.
async fn classify(
    text: &str,
    config: SessionConfig,
    writer: &mut dyn Write,
    color: ColorMode,
) -> anyhow::Result<()> {
    let idle = config.debounce + config.artifact_flush + Duration::from_millis(100);
    let sink = Arc::new(|cmd: &str| tracing::debug!(command = cmd, "not sent while replaying"));
    let session = SessionOrchestrator::new(config, Arc::new(LocalFs), sink);

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let handle = tokio::spawn(session.run(input_rx, event_tx, cancel.clone()));
    for line in text.lines() {
        input_tx.send(EngineInput::Output(format!("{line}\n")))?;
    }

    let mut diagnoses = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if matches!(event, cardsession_core::SessionEvent::Diagnosis(_)) {
                    diagnoses += 1;
                }
                output::print_event(writer, &event, color)?;
            }
            _ = tokio::time::sleep(idle) => break,
        }
    }
    cancel.cancel();
    let session = handle.await?;

    if diagnoses == 0 {
        writeln!(writer, "No vulnerability signature found")?;
    }
    let known = session.data().known_key_sectors();
    if known > 0 {
        writeln!(writer, "{known} sector(s) with a known key after replay")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dump(path: &Path, blocks: usize, block0: [u8; 16]) {
        let mut bytes = Vec::new();
        for i in 0..blocks {
            let mut b = [0u8; 16];
            if i == 0 {
                b = block0;
            } else if i % 4 == 3 {
                b[..6].copy_from_slice(&[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
                b[6..10].copy_from_slice(&[0xFF, 0x07, 0x80, 0x69]);
            }
            bytes.extend_from_slice(&b);
        }
        std::fs::write(path, bytes).unwrap();
    }

    const BLOCK0: [u8; 16] = [
        0xDE, 0xAD, 0xBE, 0xEF, 0x22, 0x08, 0x04, 0x00, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
        0x68, 0x69,
    ];

    #[test]
    fn bcc_accepts_spaced_uid() {
        assert_eq!(bcc_of("de ad be ef").unwrap(), 0x22);
        assert!(bcc_of("DEADBE").is_err());
    }

    #[test]
    fn patch_dump_fills_zeroed_key_b() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("hf-mf-DEADBEEF-dump.bin");
        let keys = dir.path().join("hf-mf-DEADBEEF-key.bin");
        let out = dir.path().join("patched.bin");
        write_dump(&dump, 20, BLOCK0);
        let mut key_bytes = vec![0xA0u8; 6 * 5];
        key_bytes.extend(std::iter::repeat_n(0x5B, 6 * 5));
        std::fs::write(&keys, key_bytes).unwrap();

        let patched = patch_dump(&dump, &keys, &out, CardKind::Mini).unwrap();
        assert_eq!(patched, 5);
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(bytes.len(), 320);
        assert_eq!(&bytes[58..64], &[0x5B; 6]);
        assert_eq!(&bytes[0..16], &BLOCK0);
    }

    #[test]
    fn template_keeps_block_zero_and_refuses_blank_one() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("d.bin");
        let out = dir.path().join("empty-dump.bin");
        write_dump(&dump, 20, BLOCK0);
        write_template(&dump, &out, CardKind::Mini).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[0..16], &BLOCK0);
        assert_eq!(&bytes[16..32], &[0u8; 16]);
        assert_eq!(&bytes[54..58], &[0xFF, 0x07, 0x80, 0x69]);

        write_dump(&dump, 20, [0u8; 16]);
        assert!(write_template(&dump, &out, CardKind::Mini).is_err());
    }
}
