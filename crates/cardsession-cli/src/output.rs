use std::io::Write;
use std::path::Path;

use cardsession_core::{ArtifactKind, Block, Diagnosis, RestoreProposal, SessionEvent, ThreatLevel};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Print a single "label: value" line with the label dimmed.
fn print_field(w: &mut dyn Write, label: &str, value: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", format!("{label}:").dimmed(), value)
    } else {
        writeln!(w, "{label}: {value}")
    }
}

pub fn print_ok(w: &mut dyn Write, message: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", "OK".green().bold(), message)
    } else {
        writeln!(w, "OK {message}")
    }
}

/// Print the decoded fields of a validated block 0.
pub fn print_block_zero(w: &mut dyn Write, block: &Block, color: ColorMode) -> std::io::Result<()> {
    let hex = block.to_string();
    print_field(w, "Block 0", &hex, color)?;
    print_field(w, "UID", &hex[0..8], color)?;
    print_field(w, "BCC", &hex[8..10], color)?;
    print_field(w, "SAK", &hex[10..12], color)?;
    print_field(w, "ATQA", &hex[12..16], color)?;
    Ok(())
}

pub fn print_diagnosis(w: &mut dyn Write, diagnosis: &Diagnosis, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    let heading = format!("{} ({})", diagnosis.title, diagnosis.level);
    if color.enabled() {
        match diagnosis.level {
            ThreatLevel::UnrecoverableGen | ThreatLevel::Hardened => {
                writeln!(w, "{}", heading.red().bold())?
            }
            ThreatLevel::StaticNonce | ThreatLevel::WeakPrng => {
                writeln!(w, "{}", heading.yellow().bold())?
            }
            ThreatLevel::None => writeln!(w, "{}", heading.bold())?,
        }
    } else {
        writeln!(w, "{heading}")?;
    }
    for line in diagnosis.message.lines() {
        writeln!(w, "  {line}")?;
    }
    if diagnosis.known_key_sectors > 0 {
        let note = format!("{} sector(s) already have a known key", diagnosis.known_key_sectors);
        if color.enabled() {
            writeln!(w, "  {}", note.dimmed())?;
        } else {
            writeln!(w, "  {note}")?;
        }
    }
    Ok(())
}

pub fn print_event(w: &mut dyn Write, event: &SessionEvent, color: ColorMode) -> std::io::Result<()> {
    match event {
        SessionEvent::ArtifactImported {
            kind,
            path,
            blocks,
            key_sectors,
        } => {
            let detail = match kind {
                ArtifactKind::Keys => format!("{key_sectors} sector keys"),
                ArtifactKind::Dump => format!("{blocks} blocks, {key_sectors} sector keys"),
            };
            let line = format!("Imported {kind} {} ({detail})", path.display());
            if color.enabled() {
                writeln!(w, "{}", line.green())
            } else {
                writeln!(w, "{line}")
            }
        }
        SessionEvent::ArtifactFailed { kind, path, error } => {
            let line = format!("Could not import {kind} {}: {error}", path.display());
            if color.enabled() {
                writeln!(w, "{}", line.red())
            } else {
                writeln!(w, "{line}")
            }
        }
        SessionEvent::Diagnosis(diagnosis) => print_diagnosis(w, diagnosis, color),
        SessionEvent::BlockRead { block, data } => {
            print_field(w, &format!("Block {block}"), &data.to_string(), color)
        }
    }
}

fn print_candidate(w: &mut dyn Write, label: &str, path: Option<&Path>, color: ColorMode) -> std::io::Result<()> {
    match path {
        Some(path) => print_field(w, label, &path.display().to_string(), color),
        None if color.enabled() => print_field(w, label, &"none".yellow().to_string(), color),
        None => print_field(w, label, "none", color),
    }
}

pub fn print_proposal(
    w: &mut dyn Write,
    uid: &str,
    proposal: Option<&RestoreProposal>,
    color: ColorMode,
) -> std::io::Result<()> {
    let Some(proposal) = proposal else {
        let line = format!("No dump found for UID {}", uid.to_ascii_uppercase());
        return if color.enabled() {
            writeln!(w, "{}", line.yellow())
        } else {
            writeln!(w, "{line}")
        };
    };
    if color.enabled() {
        writeln!(w, "{}", format!("Restore candidate for {}", proposal.uid).bold().cyan())?;
    } else {
        writeln!(w, "Restore candidate for {}", proposal.uid)?;
    }
    print_field(w, "Directory", &proposal.dir.display().to_string(), color)?;
    print_candidate(w, "Dump", Some(&proposal.dump.path), color)?;
    print_candidate(w, "Keys", proposal.key.as_ref().map(|k| k.path.as_path()), color)?;
    Ok(())
}
