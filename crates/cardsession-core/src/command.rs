use std::fmt;
use std::path::PathBuf;

use crate::records::{Block, Key, KeyType};
use crate::topology::CardKind;

/// A command line for the external client.
///
/// Rendering is the only thing this type does; sending happens through a
/// [`CommandSink`](crate::backend::CommandSink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardCommand {
    Info,
    Autopwn(CardKind),
    /// Key recovery script for static encrypted nonce cards.
    Fm11rf08sRecovery,
    Dump {
        kind: CardKind,
        keys: Option<PathBuf>,
    },
    Restore {
        kind: CardKind,
        dump: PathBuf,
        keys: PathBuf,
        /// Target already carries the source card's keys (`--ka`).
        keyed_target: bool,
        force: bool,
    },
    ReadBlock {
        block: usize,
        key_type: KeyType,
        key: Key,
    },
    WriteBlock {
        block: usize,
        key_type: KeyType,
        key: Key,
        data: Block,
    },
}

impl CardCommand {
    /// Whether the command can change card contents.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            CardCommand::Restore { .. } | CardCommand::WriteBlock { .. }
        )
    }
}

fn key_flag(key_type: KeyType) -> &'static str {
    match key_type {
        KeyType::A => "-a",
        KeyType::B => "-b",
    }
}

struct PathArg<'a>(&'a PathBuf);

impl fmt::Display for PathArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.display().to_string();
        if s.contains(char::is_whitespace) {
            write!(f, "\"{s}\"")
        } else {
            f.write_str(&s)
        }
    }
}

impl fmt::Display for CardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardCommand::Info => f.write_str("hf mf info"),
            CardCommand::Autopwn(kind) => write!(f, "hf mf autopwn {}", kind.size_flag()),
            CardCommand::Fm11rf08sRecovery => f.write_str("script run fm11rf08s_recovery"),
            CardCommand::Dump { kind, keys } => {
                write!(f, "hf mf dump {}", kind.size_flag())?;
                if let Some(keys) = keys {
                    write!(f, " -k {}", PathArg(keys))?;
                }
                Ok(())
            }
            CardCommand::Restore {
                kind,
                dump,
                keys,
                keyed_target,
                force,
            } => {
                write!(
                    f,
                    "hf mf restore {} -f {} -k {}",
                    kind.size_flag(),
                    PathArg(dump),
                    PathArg(keys)
                )?;
                if *keyed_target {
                    f.write_str(" --ka")?;
                }
                if *force {
                    f.write_str(" --force")?;
                }
                Ok(())
            }
            CardCommand::ReadBlock {
                block,
                key_type,
                key,
            } => write!(f, "hf mf rdbl --blk {block} {} -k {key}", key_flag(*key_type)),
            CardCommand::WriteBlock {
                block,
                key_type,
                key,
                data,
            } => {
                write!(
                    f,
                    "hf mf wrbl --blk {block} {} -k {key} -d {data}",
                    key_flag(*key_type)
                )?;
                // The client refuses block 0 writes without it.
                if *block == 0 {
                    f.write_str(" --force")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_flags_follow_options() {
        let cmd = CardCommand::Restore {
            kind: CardKind::Classic1K,
            dump: PathBuf::from("/w/restore_patched_dump.bin"),
            keys: PathBuf::from("/h/hf-mf-DEADBEEF-key.bin"),
            keyed_target: false,
            force: true,
        };
        assert_eq!(
            cmd.to_string(),
            "hf mf restore --1k -f /w/restore_patched_dump.bin -k /h/hf-mf-DEADBEEF-key.bin --force"
        );
        assert!(cmd.is_destructive());
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        let cmd = CardCommand::Dump {
            kind: CardKind::Classic4K,
            keys: Some(PathBuf::from("/home/a b/k-key.bin")),
        };
        assert_eq!(cmd.to_string(), "hf mf dump --4k -k \"/home/a b/k-key.bin\"");
    }

    #[test]
    fn block_commands_render_key_and_data() {
        let read = CardCommand::ReadBlock {
            block: 4,
            key_type: KeyType::B,
            key: Key::DEFAULT,
        };
        assert_eq!(read.to_string(), "hf mf rdbl --blk 4 -b -k FFFFFFFFFFFF");

        let write = CardCommand::WriteBlock {
            block: 0,
            key_type: KeyType::A,
            key: Key::DEFAULT,
            data: "DEADBEEF220804006263646566676869".parse().unwrap(),
        };
        assert_eq!(
            write.to_string(),
            "hf mf wrbl --blk 0 -a -k FFFFFFFFFFFF -d DEADBEEF220804006263646566676869 --force"
        );
        assert_eq!(CardCommand::Autopwn(CardKind::Mini).to_string(), "hf mf autopwn --mini");
    }
}
