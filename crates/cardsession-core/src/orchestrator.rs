//! Session sequencer: owns the card data, the single in-flight gate and the
//! output classifier, and runs every destructive workflow behind the
//! integrity guards.
//!
//! All state lives in one [`SessionOrchestrator`]. Callers either drive it
//! directly (`&mut self` methods) or hand it to [`SessionOrchestrator::run`],
//! which owns it on one task and takes work over a channel, so output
//! chunks from another thread are applied strictly in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{CommandSink, FileStore};
use crate::classifier::{Diagnosis, OutputClassifier};
use crate::command::CardCommand;
use crate::discovery::{self, ArtifactCandidate, RestoreProposal};
use crate::extractor::{self, ArtifactKind, PathResolver};
use crate::formats::{self, DumpFormat};
use crate::integrity;
use crate::records::{Block, CardData, Key, KeyType};
use crate::selection::{CheckState, SelectionModel};
use crate::topology::{CardKind, CardTopology};
use crate::{CoreError, IntegrityError, SessionConfig};

/// Patched dump written before every restore, in the working directory.
pub const PATCHED_DUMP_NAME: &str = "restore_patched_dump.bin";
/// Blank-card image written by the template and wipe workflows.
pub const BLANK_DUMP_NAME: &str = "empty-dump.bin";

// ── Public API types ────────────────────────────────────────────────────

/// Parameters of a restore, chosen by the user (possibly from a
/// [`RestoreProposal`] they confirmed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub dump: PathBuf,
    pub keys: PathBuf,
    /// Target card already uses the source keys; authenticate with them.
    pub keyed_target: bool,
    pub force: bool,
}

impl RestoreRequest {
    pub fn from_proposal(proposal: &RestoreProposal, keyed_target: bool, force: bool) -> Option<Self> {
        let key = proposal.key.as_ref()?;
        Some(Self {
            dump: proposal.dump.path.clone(),
            keys: key.path.clone(),
            keyed_target,
            force,
        })
    }
}

/// Something that happened inside the session which the front-end should
/// show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ArtifactImported {
        kind: ArtifactKind,
        path: PathBuf,
        /// Blocks taken from a dump (0 for key files).
        blocks: usize,
        /// Sectors whose keys were updated.
        key_sectors: usize,
    },
    ArtifactFailed {
        kind: ArtifactKind,
        path: PathBuf,
        error: String,
    },
    Diagnosis(Diagnosis),
    BlockRead {
        block: usize,
        data: Block,
    },
}

/// Work submitted to a running session.
#[derive(Debug, Clone)]
pub enum Request {
    /// Send a non-destructive command (info, autopwn, recovery script).
    Send(CardCommand),
    LoadDump(PathBuf),
    LoadKeys(PathBuf),
    SaveDump(PathBuf),
    SaveKeys(PathBuf),
    CompareDump(PathBuf),
    ChangeCardType { kind: CardKind, confirmed: bool },
    Clear,
    DataToKey,
    KeyToData,
    ToggleBlock { block: usize, state: CheckState },
    ToggleSector { sector: usize, state: CheckState },
    ToggleGlobal(CheckState),
    ToggleTrailers(CheckState),
    ProposeRestore,
    Restore(RestoreRequest),
    BlankTemplate,
    ProposeWipeKey,
    Wipe { keys: PathBuf },
    DumpCard,
    RewriteUid(String),
    ReadBlock { block: usize, key: Option<(KeyType, Key)> },
    WriteBlock { block: usize, data: Block, key: Option<(KeyType, Key)> },
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Count(usize),
    Path(PathBuf),
    Blocks(Vec<usize>),
    Proposal(Option<RestoreProposal>),
    KeyCandidate(Option<ArtifactCandidate>),
    Block(Block),
    Sent(CardCommand),
}

pub type Reply = oneshot::Sender<Result<Outcome, CoreError>>;

/// Input to [`SessionOrchestrator::run`].
#[derive(Debug)]
pub enum EngineInput {
    /// A chunk of client output.
    Output(String),
    /// The in-flight command completed (successfully or not).
    OperationFinished,
    /// New session: drop any pending diagnosis without firing.
    Reset,
    Request(Request, Reply),
}

// ── Orchestrator ────────────────────────────────────────────────────────

pub struct SessionOrchestrator {
    config: SessionConfig,
    data: CardData,
    selection: SelectionModel,
    classifier: OutputClassifier,
    resolver: PathResolver,
    busy: bool,
    pending_read: Option<usize>,
    fs: Arc<dyn FileStore>,
    sink: Arc<dyn CommandSink>,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig, fs: Arc<dyn FileStore>, sink: Arc<dyn CommandSink>) -> Self {
        let topology = CardTopology::new(config.card_kind);
        let classifier = OutputClassifier::new(config.debounce);
        let resolver = PathResolver::new(config.search_dirs());
        Self {
            data: CardData::new(topology.clone()),
            selection: SelectionModel::new(topology),
            classifier,
            resolver,
            busy: false,
            pending_read: None,
            config,
            fs,
            sink,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn data(&self) -> &CardData {
        &self.data
    }

    pub fn selection(&self) -> &SelectionModel {
        &self.selection
    }

    /// Selection does not touch card data, so it stays editable while a
    /// command is in flight.
    pub fn selection_mut(&mut self) -> &mut SelectionModel {
        &mut self.selection
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    // ── Gate ────────────────────────────────────────────────────────────

    /// Take the in-flight gate and send `command`. The gate stays closed
    /// until [`end_operation`](Self::end_operation).
    pub fn begin_operation(&mut self, command: CardCommand) -> Result<(), CoreError> {
        self.ensure_idle()?;
        self.busy = true;
        let line = command.to_string();
        tracing::info!(command = %line, "dispatching");
        self.sink.send(&line);
        Ok(())
    }

    pub fn end_operation(&mut self) {
        if self.busy {
            tracing::debug!("operation finished");
        }
        self.busy = false;
        self.pending_read = None;
    }

    pub fn ensure_idle(&self) -> Result<(), CoreError> {
        if self.busy {
            Err(CoreError::Busy)
        } else {
            Ok(())
        }
    }

    /// Send a command that cannot alter the card.
    pub fn send(&mut self, command: CardCommand) -> Result<(), CoreError> {
        if command.is_destructive() {
            return Err(CoreError::InvalidArgument(format!(
                "'{command}' writes to the card, use the guarded workflow instead"
            )));
        }
        self.begin_operation(command)
    }

    /// Cancel the pending diagnosis. Card data is kept, and a command still
    /// in flight keeps the gate until its `end_operation`.
    pub fn reset_session(&mut self) {
        self.classifier.reset();
        tracing::debug!(busy = self.busy, "session reset");
    }

    // ── Card data ───────────────────────────────────────────────────────

    pub fn set_block(&mut self, index: usize, block: Option<Block>) -> Result<(), CoreError> {
        self.ensure_idle()?;
        self.data.set_block(index, block)
    }

    pub fn set_key(
        &mut self,
        sector: usize,
        key_type: KeyType,
        key: Option<Key>,
    ) -> Result<(), CoreError> {
        self.ensure_idle()?;
        self.data.set_key(sector, key_type, key)
    }

    /// Switch capacity variant. Shrinking past non-empty records needs
    /// `confirmed`; returns how many records were dropped.
    pub fn change_card_type(&mut self, kind: CardKind, confirmed: bool) -> Result<usize, CoreError> {
        self.ensure_idle()?;
        let target = CardTopology::new(kind);
        let dropped = self.data.dropped_by(&target);
        if dropped > 0 && !confirmed {
            return Err(CoreError::ConfirmationRequired {
                dropped_blocks: dropped,
            });
        }
        tracing::info!(from = %self.config.card_kind, to = %kind, dropped, "card type changed");
        self.data = self.data.resized(target.clone());
        self.selection = SelectionModel::new(target);
        self.config.card_kind = kind;
        Ok(dropped)
    }

    pub fn clear(&mut self) -> Result<(), CoreError> {
        self.ensure_idle()?;
        let topology = self.data.topology().clone();
        self.data = CardData::new(topology.clone());
        self.selection = SelectionModel::new(topology);
        Ok(())
    }

    pub fn data_to_key(&mut self) -> Result<usize, CoreError> {
        self.ensure_idle()?;
        Ok(self.data.data_to_key())
    }

    pub fn key_to_data(&mut self) -> Result<usize, CoreError> {
        self.ensure_idle()?;
        Ok(self.data.key_to_data())
    }

    // ── Files ───────────────────────────────────────────────────────────

    pub fn load_dump(&mut self, path: &Path) -> Result<usize, CoreError> {
        self.ensure_idle()?;
        self.import_dump(path)
    }

    pub fn load_keys(&mut self, path: &Path) -> Result<usize, CoreError> {
        self.ensure_idle()?;
        self.import_keys(path)
    }

    pub fn save_dump(&self, path: &Path) -> Result<(), CoreError> {
        let bytes = formats::encode_dump(self.data.blocks(), DumpFormat::from_path(path))?;
        self.fs.write(path, &bytes)?;
        tracing::info!(path = %path.display(), "dump saved");
        Ok(())
    }

    pub fn save_keys(&self, path: &Path) -> Result<(), CoreError> {
        self.fs.write(path, &formats::encode_keys(self.data.keys()))?;
        tracing::info!(path = %path.display(), "keys saved");
        Ok(())
    }

    /// Blocks whose session contents differ from the dump at `path`.
    pub fn compare_dump(&self, path: &Path) -> Result<Vec<usize>, CoreError> {
        let other = self.decode_dump_file(path)?;
        Ok(self.data.diff(&other))
    }

    fn decode_dump_file(&self, path: &Path) -> Result<Vec<Option<Block>>, CoreError> {
        let bytes = self.fs.read(path)?;
        formats::decode_dump(&bytes, DumpFormat::from_path(path))
    }

    /// Load a dump into the session without consulting the gate. Nothing
    /// is changed unless the whole file decodes.
    fn import_dump(&mut self, path: &Path) -> Result<usize, CoreError> {
        let blocks = self.decode_dump_file(path)?;
        let capacity = self.data.topology().block_count();
        if blocks.len() > capacity {
            tracing::warn!(
                path = %path.display(),
                blocks = blocks.len(),
                capacity,
                "dump larger than card, truncating"
            );
        }
        let loaded = blocks.len().min(capacity);
        self.data.replace_blocks(blocks);
        tracing::info!(path = %path.display(), blocks = loaded, "dump loaded");
        Ok(loaded)
    }

    fn import_keys(&mut self, path: &Path) -> Result<usize, CoreError> {
        let bytes = self.fs.read(path)?;
        let keys = formats::decode_keys(&bytes, self.data.topology().sector_count())?;
        let sectors = keys.len();
        self.data.replace_keys(keys);
        tracing::info!(path = %path.display(), sectors, "keys loaded");
        Ok(sectors)
    }

    // ── Output handling ─────────────────────────────────────────────────

    /// Feed one chunk of client output. Read-back rows and announced
    /// artifacts are applied before this returns; a diagnosis is only
    /// produced later by [`poll_diagnosis`](Self::poll_diagnosis).
    pub async fn handle_output(&mut self, chunk: &str) -> Vec<SessionEvent> {
        tracing::trace!(len = chunk.len(), "output chunk");
        self.classifier.observe(chunk, Instant::now());
        let mut events = Vec::new();

        if let Some(wanted) = self.pending_read {
            if let Some((block, data)) = extractor::scan_block_reads(chunk)
                .into_iter()
                .find(|(b, _)| *b == wanted)
            {
                if self.data.set_block(block, Some(data)).is_ok() {
                    events.push(SessionEvent::BlockRead { block, data });
                }
                self.end_operation();
            }
        }

        for artifact in extractor::scan_artifacts(chunk) {
            let resolved = self.resolver.resolve(self.fs.as_ref(), &artifact.raw_path);
            extractor::wait_for_flush(
                self.fs.as_ref(),
                &resolved.path,
                self.config.artifact_flush,
                self.config.flush_poll,
            )
            .await;

            let result = match artifact.kind {
                ArtifactKind::Keys => self.import_keys(&resolved.path).map(|n| (0, n)),
                ArtifactKind::Dump => self
                    .import_dump(&resolved.path)
                    .map(|blocks| (blocks, self.data.data_to_key())),
            };
            events.push(match result {
                Ok((blocks, key_sectors)) => SessionEvent::ArtifactImported {
                    kind: artifact.kind,
                    path: resolved.path,
                    blocks,
                    key_sectors,
                },
                Err(e) => {
                    tracing::warn!(
                        kind = %artifact.kind,
                        path = %resolved.path.display(),
                        error = %e,
                        "artifact import failed"
                    );
                    SessionEvent::ArtifactFailed {
                        kind: artifact.kind,
                        path: resolved.path,
                        error: e.to_string(),
                    }
                }
            });
        }
        events
    }

    /// When the classifier wants to be polled next.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.classifier.deadline()
    }

    pub fn poll_diagnosis(&mut self, now: Instant) -> Option<Diagnosis> {
        let mut diagnosis = self.classifier.poll(now)?;
        diagnosis.known_key_sectors = self.data.known_key_sectors();
        Some(diagnosis)
    }

    // ── Destructive workflows ───────────────────────────────────────────

    fn block_zero_hex(&self) -> Result<Option<String>, CoreError> {
        Ok(self.data.block(0)?.map(|b| b.to_string()))
    }

    fn auth_key(&self, block: usize, key: Option<(KeyType, Key)>) -> Result<(KeyType, Key), CoreError> {
        if let Some(key) = key {
            return Ok(key);
        }
        let sector = self.data.topology().sector_of(block)?;
        match self.data.key(sector)?.preferred() {
            Some(key) => Ok(key),
            None => {
                tracing::debug!(block, sector, "no tracked key, using transport key A");
                Ok((KeyType::A, Key::DEFAULT))
            }
        }
    }

    /// Look for the newest dump/key pair matching the session UID. The
    /// result is a proposal only.
    pub fn propose_restore(&self) -> Result<Option<RestoreProposal>, CoreError> {
        let uid = self
            .data
            .uid()
            .ok_or_else(|| CoreError::InvalidArgument("block 0 is empty, no UID to search for".to_string()))?;
        discovery::discover_restore_pair(self.fs.as_ref(), &self.config.search_dirs(), &uid)
    }

    /// Load the dump and keys, repair zeroed trailer KeyB fields from the
    /// tracked keys, persist the patched dump and dispatch the restore.
    /// Returns the patched dump path.
    pub fn restore(&mut self, request: &RestoreRequest) -> Result<PathBuf, CoreError> {
        self.ensure_idle()?;
        let blocks = self.decode_dump_file(&request.dump)?;
        let key_bytes = self.fs.read(&request.keys)?;

        let mut staged = self.data.clone();
        let sectors = staged.topology().sector_count();
        staged.replace_blocks(blocks);
        staged.replace_keys(formats::decode_keys(&key_bytes, sectors)?);

        let patched = integrity::patch_trailers(&mut staged);

        let patched_path = self.config.working_dir.join(PATCHED_DUMP_NAME);
        let bytes = formats::encode_dump(staged.blocks(), DumpFormat::Binary)?;
        self.fs.write(&patched_path, &bytes)?;
        self.data = staged;
        tracing::info!(patched, path = %patched_path.display(), "restore dump prepared");

        self.begin_operation(CardCommand::Restore {
            kind: self.config.card_kind,
            dump: patched_path.clone(),
            keys: request.keys.clone(),
            keyed_target: request.keyed_target,
            force: request.force,
        })?;
        Ok(patched_path)
    }

    /// Replace the session with a blank-card image that keeps the real
    /// block 0, select everything but block 0, and save it as
    /// `empty-dump.bin` in the output directory.
    pub fn generate_blank_template(&mut self) -> Result<PathBuf, CoreError> {
        self.ensure_idle()?;
        let block0 = integrity::require_real_block_zero(self.block_zero_hex()?.as_deref())?;
        let template = integrity::blank_template(self.data.topology(), block0);

        let path = self.config.output_dir().join(BLANK_DUMP_NAME);
        let bytes = formats::encode_dump(&template, DumpFormat::Binary)?;
        self.fs.write(&path, &bytes)?;

        self.data.replace_blocks(template);
        self.selection.toggle_global(CheckState::Checked);
        self.selection.toggle_block(0, CheckState::Unchecked)?;
        tracing::info!(path = %path.display(), "blank template generated");
        Ok(path)
    }

    /// Newest key file for the session UID in the output directory, for
    /// the user to confirm before [`wipe`](Self::wipe).
    pub fn propose_wipe_key(&self) -> Result<Option<ArtifactCandidate>, CoreError> {
        let Some(uid) = self.data.uid().filter(|u| discovery::is_usable_uid(u)) else {
            return Ok(None);
        };
        discovery::find_newest(
            self.fs.as_ref(),
            &self.config.output_dir(),
            &uid,
            ArtifactKind::Keys,
        )
    }

    /// Reset the card to a blank state with an authenticated restore of a
    /// freshly built blank image. Session data is left as is.
    pub fn wipe(&mut self, keys: &Path) -> Result<PathBuf, CoreError> {
        self.ensure_idle()?;
        let block0 = integrity::require_real_block_zero(self.block_zero_hex()?.as_deref())?;
        if !self.fs.exists(keys) {
            return Err(CoreError::NotFound(keys.to_path_buf()));
        }
        let template = integrity::blank_template(self.data.topology(), block0);
        let path = self.config.output_dir().join(BLANK_DUMP_NAME);
        self.fs
            .write(&path, &formats::encode_dump(&template, DumpFormat::Binary)?)?;

        self.begin_operation(CardCommand::Restore {
            kind: self.config.card_kind,
            dump: path.clone(),
            keys: keys.to_path_buf(),
            keyed_target: true,
            force: false,
        })?;
        Ok(path)
    }

    /// Save the current keys under a free `hf-mf-<UID>-key*.bin` name and
    /// dump the card with them. Falls back to a plain dump when the key
    /// file cannot be written.
    pub fn dump_card(&mut self) -> Result<CardCommand, CoreError> {
        self.ensure_idle()?;
        let uid = self.data.uid();
        let key_path =
            discovery::next_free_key_name(self.fs.as_ref(), &self.config.output_dir(), uid.as_deref());
        let keys = match self.fs.write(&key_path, &formats::encode_keys(self.data.keys())) {
            Ok(()) => Some(key_path),
            Err(e) => {
                tracing::warn!(error = %e, "could not save key file, dumping without it");
                None
            }
        };
        let command = CardCommand::Dump {
            kind: self.config.card_kind,
            keys,
        };
        self.begin_operation(command.clone())?;
        Ok(command)
    }

    /// Put a new UID into block 0 of the session. The card itself is only
    /// changed by a later [`write_block`](Self::write_block).
    pub fn rewrite_uid(&mut self, new_uid: &str) -> Result<Block, CoreError> {
        self.ensure_idle()?;
        let current = self
            .block_zero_hex()?
            .ok_or_else(|| IntegrityError::MissingRead("block 0 has not been read".to_string()))?;
        integrity::require_real_block_zero(Some(&current))?;
        let block = integrity::rewrite_uid(&current, new_uid)?;
        self.data.set_block(0, Some(block))?;
        tracing::info!(uid = %new_uid, "block 0 rewritten in session");
        Ok(block)
    }

    /// Write one block. Block 0 must carry a valid BCC.
    pub fn write_block(
        &mut self,
        block: usize,
        data: Block,
        key: Option<(KeyType, Key)>,
    ) -> Result<CardCommand, CoreError> {
        self.ensure_idle()?;
        let (key_type, key) = self.auth_key(block, key)?;
        if block == 0 {
            integrity::validate_block_zero(&data.to_string())?;
        }
        let command = CardCommand::WriteBlock {
            block,
            key_type,
            key,
            data,
        };
        self.begin_operation(command.clone())?;
        Ok(command)
    }

    /// Read one block; the value lands in the session when the read-back
    /// row shows up in the output, which also releases the gate.
    pub fn read_block(
        &mut self,
        block: usize,
        key: Option<(KeyType, Key)>,
    ) -> Result<CardCommand, CoreError> {
        self.ensure_idle()?;
        let (key_type, key) = self.auth_key(block, key)?;
        let command = CardCommand::ReadBlock {
            block,
            key_type,
            key,
        };
        self.begin_operation(command.clone())?;
        self.pending_read = Some(block);
        Ok(command)
    }

    // ── Sequencer ───────────────────────────────────────────────────────

    pub fn handle_request(&mut self, request: Request) -> Result<Outcome, CoreError> {
        match request {
            Request::Send(command) => self.send(command.clone()).map(|()| Outcome::Sent(command)),
            Request::LoadDump(path) => self.load_dump(&path).map(Outcome::Count),
            Request::LoadKeys(path) => self.load_keys(&path).map(Outcome::Count),
            Request::SaveDump(path) => self.save_dump(&path).map(|()| Outcome::Path(path)),
            Request::SaveKeys(path) => self.save_keys(&path).map(|()| Outcome::Path(path)),
            Request::CompareDump(path) => self.compare_dump(&path).map(Outcome::Blocks),
            Request::ChangeCardType { kind, confirmed } => {
                self.change_card_type(kind, confirmed).map(Outcome::Count)
            }
            Request::Clear => self.clear().map(|()| Outcome::Done),
            Request::DataToKey => self.data_to_key().map(Outcome::Count),
            Request::KeyToData => self.key_to_data().map(Outcome::Count),
            Request::ToggleBlock { block, state } => self
                .selection
                .toggle_block(block, state)
                .map(|()| Outcome::Done),
            Request::ToggleSector { sector, state } => self
                .selection
                .toggle_sector(sector, state)
                .map(|()| Outcome::Done),
            Request::ToggleGlobal(state) => {
                self.selection.toggle_global(state);
                Ok(Outcome::Done)
            }
            Request::ToggleTrailers(state) => {
                self.selection.toggle_trailers(state);
                Ok(Outcome::Done)
            }
            Request::ProposeRestore => self.propose_restore().map(Outcome::Proposal),
            Request::Restore(request) => self.restore(&request).map(Outcome::Path),
            Request::BlankTemplate => self.generate_blank_template().map(Outcome::Path),
            Request::ProposeWipeKey => self.propose_wipe_key().map(Outcome::KeyCandidate),
            Request::Wipe { keys } => self.wipe(&keys).map(Outcome::Path),
            Request::DumpCard => self.dump_card().map(Outcome::Sent),
            Request::RewriteUid(uid) => self.rewrite_uid(&uid).map(Outcome::Block),
            Request::ReadBlock { block, key } => self.read_block(block, key).map(Outcome::Sent),
            Request::WriteBlock { block, data, key } => {
                self.write_block(block, data, key).map(Outcome::Sent)
            }
        }
    }

    /// Own the session on the current task until `cancel` fires or the
    /// input channel closes, then hand it back.
    ///
    /// Inputs are applied one at a time. A diagnosis is emitted when the
    /// classifier's deadline passes, which is always after the imports
    /// triggered by the chunks of that burst.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<EngineInput>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("session loop cancelled");
                    break;
                }
                _ = wait_until(deadline) => {
                    if let Some(diagnosis) = self.poll_diagnosis(Instant::now()) {
                        let _ = events.send(SessionEvent::Diagnosis(diagnosis));
                    }
                }
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    match input {
                        EngineInput::Output(chunk) => {
                            for event in self.handle_output(&chunk).await {
                                let _ = events.send(event);
                            }
                        }
                        EngineInput::OperationFinished => self.end_operation(),
                        EngineInput::Reset => self.reset_session(),
                        EngineInput::Request(request, reply) => {
                            let result = self.handle_request(request);
                            if let Err(e) = &result {
                                tracing::debug!(error = %e, "request rejected");
                            }
                            let _ = reply.send(result);
                        }
                    }
                }
            }
        }
        self
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
