/// Sync orchestrator: owns the live subscription for the active project and
/// reconciles every remote snapshot with the locally stored state.
///
/// Each activation gets a session token and one worker task. Remote
/// snapshots, conflict resolutions, local saves and flush barriers travel to
/// the worker over one ordered channel, so no two merges or writes for a
/// project ever overlap. Deactivating releases the subscription, retires the
/// token and aborts the worker; callbacks carrying an old token are dropped.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{load_settings, save_settings, SyncSettings, SETTINGS_FILE_NAME};
use crate::merge::conflict::detect_conflicts_with;
use crate::merge::merge::{MergeStrategy, Merger};
use crate::merge::MergeError;
use crate::remote::{RemoteError, RemoteProjects, SnapshotCallback, Subscription};
use crate::storage::local::FileProjectStore;
use crate::storage::{ProjectStore, StorageError};
use crate::types::{now_millis, ConflictData, ProjectState, SyncStatus};

use super::echo::EchoTracker;
use super::queue::{DrainReport, QueueOperation, SyncQueue, SyncQueueItem};
use super::status::{SyncFailure, SyncSnapshot, SyncStatusPublisher, SyncStatusReader};

pub const PROJECTS_DIR_NAME: &str = "projects";
pub const QUEUE_FILE_NAME: &str = "queue.json";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("No active project")]
    NoActiveProject,

    #[error("No pending conflict for project {0}")]
    NoPendingConflict(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Sync session for project {0} closed")]
    SessionClosed(String),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

enum SessionCommand {
    Remote {
        token: u64,
        snapshot: Option<ProjectState>,
    },
    Resolve {
        strategy: MergeStrategy,
        reply: oneshot::Sender<Result<ProjectState, SyncError>>,
    },
    SaveLocal {
        state: ProjectState,
        reply: oneshot::Sender<Result<ProjectState, SyncError>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Shared handles used by both the orchestrator and its session workers.
#[derive(Clone)]
struct SyncContext {
    store: Arc<dyn ProjectStore>,
    remote: Arc<dyn RemoteProjects>,
    status: Arc<SyncStatusPublisher>,
    settings: Arc<RwLock<SyncSettings>>,
    echoes: Arc<Mutex<EchoTracker>>,
    queue: Arc<Mutex<SyncQueue>>,
}

impl SyncContext {
    fn settings(&self) -> SyncSettings {
        self.settings.read().unwrap().clone()
    }

    /// Keep `syncVersion` from going backwards when a caller hands in a
    /// state built without (or with a stale) version.
    fn carry_sync_version(&self, state: &mut ProjectState) -> Result<(), StorageError> {
        if let Some(stored) = self.store.load_project(&state.id)? {
            state.sync_version = state.sync_version.max(stored.sync_version);
        }
        Ok(())
    }

    fn enqueue(&self, item: SyncQueueItem) {
        if let Err(e) = self.queue.lock().unwrap().enqueue(item) {
            log::error!("[atelier.sync.queue] Failed to persist sync queue: {}", e);
        }
    }

    /// Push a state, registering it as an expected echo first.
    /// Queued for a later drain when the push fails.
    fn push_or_enqueue(&self, user_id: Option<&str>, state: &ProjectState) -> bool {
        let max_retries = self.settings.read().unwrap().max_retries;
        let Some(user_id) = user_id else {
            self.enqueue(SyncQueueItem::save(state.clone(), max_retries));
            return false;
        };

        self.echoes.lock().unwrap().register(state);
        match self.remote.push_project(user_id, state) {
            Ok(()) => true,
            Err(e) => {
                self.echoes.lock().unwrap().forget(state);
                log::warn!(
                    "[atelier.sync.push] Push of {} failed, queueing: {}",
                    state.id,
                    e
                );
                self.enqueue(SyncQueueItem::save(state.clone(), max_retries));
                false
            }
        }
    }

    fn delete_or_enqueue(&self, user_id: Option<&str>, project_id: &str) -> bool {
        let max_retries = self.settings.read().unwrap().max_retries;
        let result = match user_id {
            Some(user_id) => self.remote.delete_project(user_id, project_id),
            None => Err(RemoteError::Unauthenticated),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "[atelier.sync.push] Remote delete of {} failed, queueing: {}",
                    project_id,
                    e
                );
                self.enqueue(SyncQueueItem::delete(project_id, max_retries));
                false
            }
        }
    }
}

struct ActiveSession {
    project_id: String,
    user_id: String,
    subscription: Option<Subscription>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    worker: JoinHandle<()>,
}

pub struct SyncOrchestrator {
    ctx: SyncContext,
    settings_path: Option<PathBuf>,
    active_token: Arc<AtomicU64>,
    next_token: u64,
    user_id: Option<String>,
    session: Option<ActiveSession>,
}

impl SyncOrchestrator {
    /// Orchestrator with an in-memory sync queue and unsaved settings.
    pub fn new(
        store: Arc<dyn ProjectStore>,
        remote: Arc<dyn RemoteProjects>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            ctx: SyncContext {
                store,
                remote,
                status: Arc::new(SyncStatusPublisher::new()),
                settings: Arc::new(RwLock::new(settings)),
                echoes: Arc::new(Mutex::new(EchoTracker::new())),
                queue: Arc::new(Mutex::new(SyncQueue::new())),
            },
            settings_path: None,
            active_token: Arc::new(AtomicU64::new(0)),
            next_token: 1,
            user_id: None,
            session: None,
        }
    }

    /// Orchestrator over a data directory: projects under `projects/`,
    /// settings in `settings.json`, outbound queue in `queue.json`.
    pub fn open(data_dir: &Path, remote: Arc<dyn RemoteProjects>) -> Result<Self, SyncError> {
        let store = FileProjectStore::open(data_dir.join(PROJECTS_DIR_NAME))?;
        let settings_path = data_dir.join(SETTINGS_FILE_NAME);
        let settings = load_settings(&settings_path);
        let queue = SyncQueue::open(data_dir.join(QUEUE_FILE_NAME))?;

        Ok(Self::new(Arc::new(store), remote, settings)
            .with_queue(queue)
            .with_settings_path(settings_path))
    }

    pub fn with_queue(self, queue: SyncQueue) -> Self {
        *self.ctx.queue.lock().unwrap() = queue;
        self
    }

    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn status(&self) -> SyncStatusReader {
        self.ctx.status.subscribe()
    }

    pub fn current_status(&self) -> SyncSnapshot {
        self.ctx.status.current()
    }

    pub fn settings(&self) -> SyncSettings {
        self.ctx.settings()
    }

    pub fn active_project(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.project_id.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Start syncing one project, replacing any current session.
    ///
    /// Status goes to `syncing` right away. A failed subscription leaves the
    /// session in place (local saves still work and queue up) with status
    /// `offline`; call `reconnect` to try again.
    pub fn activate(&mut self, project_id: &str, user_id: &str) {
        self.deactivate();

        let token = self.next_token;
        self.next_token += 1;
        self.active_token.store(token, Ordering::SeqCst);
        self.user_id = Some(user_id.to_string());
        self.ctx.status.set_syncing();

        let (commands, rx) = mpsc::unbounded_channel();
        let callback = {
            let commands = commands.clone();
            let active_token = self.active_token.clone();
            let project_id = project_id.to_string();
            let on_change: SnapshotCallback = Box::new(move |snapshot| {
                if active_token.load(Ordering::SeqCst) != token {
                    log::debug!(
                        "[atelier.sync.session] Dropping stale snapshot for {}",
                        project_id
                    );
                    return;
                }
                let _ = commands.send(SessionCommand::Remote { token, snapshot });
            });
            on_change
        };

        let subscription = match self.ctx.remote.subscribe(project_id, user_id, callback) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                self.ctx.status.set_offline(SyncFailure::RemoteSubscription {
                    project_id: project_id.to_string(),
                    message: e.to_string(),
                });
                None
            }
        };

        let initial_timeout = subscription.as_ref().map(|_| {
            Duration::from_millis(self.ctx.settings.read().unwrap().initial_sync_timeout_ms)
        });
        let worker = SessionWorker {
            ctx: self.ctx.clone(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            token,
            active_token: self.active_token.clone(),
            awaiting_initial: initial_timeout.is_some(),
            pending_conflict: None,
        };
        let worker = tokio::spawn(worker.run(rx, initial_timeout));

        log::info!(
            "[atelier.sync.session] Activated project {} (session {})",
            project_id,
            token
        );
        self.session = Some(ActiveSession {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            subscription,
            commands,
            worker,
        });
    }

    /// Stop syncing the active project. Remote events after this produce
    /// no status transitions and no local writes.
    pub fn deactivate(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.active_token.store(0, Ordering::SeqCst);
        if let Some(subscription) = session.subscription {
            subscription.unsubscribe();
        }
        session.worker.abort();
        self.ctx.status.reset();
        log::info!(
            "[atelier.sync.session] Deactivated project {}",
            session.project_id
        );
    }

    pub fn sign_out(&mut self) {
        self.deactivate();
        self.user_id = None;
        self.ctx.echoes.lock().unwrap().clear();
    }

    /// Re-subscribe the active project and drain the outbound queue.
    pub fn reconnect(&mut self) -> Result<DrainReport, SyncError> {
        if let Some((project_id, user_id)) = self
            .session
            .as_ref()
            .map(|s| (s.project_id.clone(), s.user_id.clone()))
        {
            self.activate(&project_id, &user_id);
        }
        self.drain_queue()
    }

    /// Resolve the pending conflict of the active project with one strategy.
    pub async fn resolve_conflict(&self, strategy: MergeStrategy) -> Result<ProjectState, SyncError> {
        let session = self.session.as_ref().ok_or(SyncError::NoActiveProject)?;
        let (reply, rx) = oneshot::channel();
        session
            .commands
            .send(SessionCommand::Resolve { strategy, reply })
            .map_err(|_| SyncError::SessionClosed(session.project_id.clone()))?;
        rx.await
            .map_err(|_| SyncError::SessionClosed(session.project_id.clone()))?
    }

    /// Persist a locally edited state and push it to the remote.
    ///
    /// `updatedAt` is stamped with the current time. A failed push queues
    /// the state for the next drain. Saves of the active project go through
    /// its session so they are ordered with incoming snapshots.
    pub async fn save_local(&self, mut state: ProjectState) -> Result<ProjectState, SyncError> {
        state.updated_at = now_millis().max(state.updated_at);

        if let Some(session) = self.session.as_ref().filter(|s| s.project_id == state.id) {
            let (reply, rx) = oneshot::channel();
            session
                .commands
                .send(SessionCommand::SaveLocal { state, reply })
                .map_err(|_| SyncError::SessionClosed(session.project_id.clone()))?;
            return rx
                .await
                .map_err(|_| SyncError::SessionClosed(session.project_id.clone()))?;
        }

        self.ctx.carry_sync_version(&mut state)?;
        self.ctx.store.save_project(&state.id, &state)?;
        self.ctx.push_or_enqueue(self.user_id.as_deref(), &state);
        Ok(state)
    }

    /// Delete a project locally and remotely. Deactivates it first if active.
    pub fn delete_project(&mut self, project_id: &str) -> Result<(), SyncError> {
        if self.active_project() == Some(project_id) {
            self.deactivate();
        }
        self.ctx.store.delete_project(project_id)?;
        self.ctx
            .delete_or_enqueue(self.user_id.as_deref(), project_id);
        log::info!("[atelier.sync.delete] Deleted project {}", project_id);
        Ok(())
    }

    /// Send queued mutations to the remote, oldest first.
    /// Items that run out of retries surface as an `error` status.
    pub fn drain_queue(&self) -> Result<DrainReport, SyncError> {
        let user_id = self.user_id.as_deref().ok_or(SyncError::NotSignedIn)?;
        let ctx = &self.ctx;

        let report = ctx.queue.lock().unwrap().drain_with(|item| match item.operation {
            QueueOperation::Save | QueueOperation::Update => {
                let state = item.data.as_ref().ok_or_else(|| RemoteError::Rejected {
                    project_id: item.project_id.clone(),
                    reason: "queued save carries no state".to_string(),
                })?;
                ctx.echoes.lock().unwrap().register(state);
                ctx.remote.push_project(user_id, state).inspect_err(|_| {
                    ctx.echoes.lock().unwrap().forget(state);
                })
            }
            QueueOperation::Delete => ctx.remote.delete_project(user_id, &item.project_id),
        })?;

        if report.sent > 0 || !report.exhausted.is_empty() {
            log::info!(
                "[atelier.sync.queue] Drained {} item(s), {} exhausted, {} remaining",
                report.sent,
                report.exhausted.len(),
                report.remaining
            );
        }
        if let Some(item) = report.exhausted.last() {
            ctx.status.set_error(SyncFailure::QueueExhausted {
                item_id: item.id.clone(),
                project_id: item.project_id.clone(),
            });
        }
        Ok(report)
    }

    pub fn queue_len(&self) -> usize {
        self.ctx.queue.lock().unwrap().len()
    }

    pub fn exhausted_items(&self) -> Vec<SyncQueueItem> {
        self.ctx.queue.lock().unwrap().exhausted().to_vec()
    }

    pub fn requeue_exhausted(&self, item_id: &str) -> Result<bool, SyncError> {
        Ok(self.ctx.queue.lock().unwrap().requeue_exhausted(item_id)?)
    }

    /// Wait until every command already sent to the active session is processed.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        session
            .commands
            .send(SessionCommand::Flush(tx))
            .map_err(|_| SyncError::SessionClosed(session.project_id.clone()))?;
        rx.await
            .map_err(|_| SyncError::SessionClosed(session.project_id.clone()))
    }

    pub fn set_auto_merge(&self, enabled: bool) -> Result<(), SyncError> {
        let settings = {
            let mut settings = self.ctx.settings.write().unwrap();
            settings.auto_merge = enabled;
            settings.clone()
        };
        log::info!("[atelier.config] Auto-merge {}", if enabled { "on" } else { "off" });
        if let Some(path) = &self.settings_path {
            save_settings(path, &settings)?;
        }
        Ok(())
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Per-session task state. Every handler runs to completion before the next
/// command is received.
struct SessionWorker {
    ctx: SyncContext,
    project_id: String,
    user_id: String,
    token: u64,
    active_token: Arc<AtomicU64>,
    awaiting_initial: bool,
    pending_conflict: Option<ConflictData>,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        initial_timeout: Option<Duration>,
    ) {
        let deadline = initial_timeout.map(|t| Instant::now() + t);
        loop {
            let next = match deadline {
                Some(deadline) if self.awaiting_initial => {
                    match tokio::time::timeout_at(deadline, commands.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            self.settle_initial();
                            continue;
                        }
                    }
                }
                _ => commands.recv().await,
            };
            let Some(command) = next else {
                break;
            };
            self.handle(command);
        }
    }

    fn is_current(&self) -> bool {
        self.active_token.load(Ordering::SeqCst) == self.token
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Remote { token, snapshot } => {
                if token != self.token || !self.is_current() {
                    log::debug!(
                        "[atelier.sync.session] Ignoring snapshot from retired session {}",
                        token
                    );
                    return;
                }
                self.awaiting_initial = false;
                self.on_remote(snapshot);
            }
            SessionCommand::Resolve { strategy, reply } => {
                let _ = reply.send(self.resolve(strategy));
            }
            SessionCommand::SaveLocal { state, reply } => {
                let _ = reply.send(self.save_local(state));
            }
            SessionCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn settle_initial(&mut self) {
        self.awaiting_initial = false;
        if self.ctx.status.current().status == SyncStatus::Syncing {
            log::warn!(
                "[atelier.sync.session] No snapshot for {} before timeout, treating as synced",
                self.project_id
            );
            self.ctx.status.set_synced(now_millis());
        }
    }

    fn on_remote(&mut self, snapshot: Option<ProjectState>) {
        self.ctx.echoes.lock().unwrap().cleanup_expired();

        let Some(remote) = snapshot else {
            log::debug!("[atelier.sync.session] No remote document for {}", self.project_id);
            self.pending_conflict = None;
            self.ctx.status.set_synced(now_millis());
            return;
        };

        if remote.id != self.project_id {
            self.ctx.status.set_error(SyncFailure::MismatchedProject {
                expected: self.project_id.clone(),
                received: remote.id,
            });
            return;
        }

        if self.ctx.echoes.lock().unwrap().check_and_consume(&remote) {
            log::debug!(
                "[atelier.sync.session] Echo of our own write to {} (v{})",
                remote.id,
                remote.sync_version
            );
            if self.ctx.status.current().status == SyncStatus::Syncing {
                self.ctx.status.set_synced(now_millis());
            }
            return;
        }

        let local = match self.ctx.store.load_project(&self.project_id) {
            Ok(local) => local,
            Err(e) => {
                self.ctx.status.set_error(SyncFailure::LocalLoad {
                    project_id: self.project_id.clone(),
                    message: e.to_string(),
                });
                return;
            }
        };
        self.pending_conflict = None;

        let Some(local) = local else {
            log::info!(
                "[atelier.sync.session] First copy of {} on this device (v{})",
                remote.id,
                remote.sync_version
            );
            if self.persist(&remote).is_ok() {
                self.ctx.status.set_synced(now_millis());
            }
            return;
        };

        if local == remote {
            self.ctx.status.set_synced(now_millis());
            return;
        }

        let settings = self.ctx.settings();
        let merger = Merger::new(settings.merge_policy());
        let conflicts = match detect_conflicts_with(&local, &remote, &settings.schema, now_millis()) {
            Ok(conflicts) => conflicts,
            Err(e) => {
                self.fail_merge(&e);
                return;
            }
        };

        if !conflicts.is_empty() {
            if !settings.auto_merge {
                let data = ConflictData {
                    project_id: self.project_id.clone(),
                    local,
                    remote,
                    conflicts,
                };
                self.pending_conflict = Some(data.clone());
                self.ctx.status.set_conflict(data);
                return;
            }
            log::info!(
                "[atelier.sync.merge] Auto-merging {} conflicting field(s) in {}",
                conflicts.len(),
                self.project_id
            );
            self.reconcile(&merger, &local, &remote, MergeStrategy::Smart);
            return;
        }

        let remote_newer = remote.updated_at > local.updated_at;
        if local.same_content(&remote) {
            // Same document, different bookkeeping: follow the newer copy
            // without letting syncVersion go backwards.
            if remote_newer {
                let adopted = ProjectState {
                    sync_version: local.sync_version.max(remote.sync_version),
                    ..remote
                };
                if self.persist(&adopted).is_err() {
                    return;
                }
            }
            self.ctx.status.set_synced(now_millis());
        } else if remote_newer {
            self.reconcile(&merger, &local, &remote, MergeStrategy::PreferRemote);
        } else {
            // Only monotonic fields differ; keep both sides' entries.
            self.reconcile(&merger, &local, &remote, MergeStrategy::PreferLocal);
        }
    }

    /// `apply_merge` for snapshot handling, where nobody awaits the result.
    fn reconcile(
        &mut self,
        merger: &Merger,
        local: &ProjectState,
        remote: &ProjectState,
        strategy: MergeStrategy,
    ) {
        if let Err(e) = self.apply_merge(merger, local, remote, strategy) {
            log::debug!(
                "[atelier.sync.merge] {} merge of {} failed, status already set: {}",
                strategy,
                self.project_id,
                e
            );
        }
    }

    /// Merge, persist, push back if the remote lacks the result, then `synced`.
    /// Failures are published as `error` before being returned.
    fn apply_merge(
        &mut self,
        merger: &Merger,
        local: &ProjectState,
        remote: &ProjectState,
        strategy: MergeStrategy,
    ) -> Result<ProjectState, SyncError> {
        let merged = merger
            .merge(local, remote, strategy)
            .inspect_err(|e| self.fail_merge(e))?;
        self.persist(&merged)?;
        if !merged.same_content(remote) {
            self.ctx.push_or_enqueue(Some(&self.user_id), &merged);
        }
        self.ctx.status.set_synced(now_millis());
        Ok(merged)
    }

    fn persist(&self, state: &ProjectState) -> Result<(), StorageError> {
        self.ctx
            .store
            .save_project(&self.project_id, state)
            .inspect_err(|e| {
                self.ctx.status.set_error(SyncFailure::LocalSave {
                    project_id: self.project_id.clone(),
                    message: e.to_string(),
                });
            })
    }

    fn fail_merge(&self, e: &MergeError) {
        self.ctx.status.set_error(SyncFailure::Merge {
            project_id: self.project_id.clone(),
            message: e.to_string(),
        });
    }

    fn resolve(&mut self, strategy: MergeStrategy) -> Result<ProjectState, SyncError> {
        let data = self
            .pending_conflict
            .take()
            .ok_or_else(|| SyncError::NoPendingConflict(self.project_id.clone()))?;

        let merger = Merger::new(self.ctx.settings().merge_policy());
        log::info!(
            "[atelier.sync.merge] Resolving {} conflict(s) in {} with {}",
            data.conflicts.len(),
            self.project_id,
            strategy
        );
        self.apply_merge(&merger, &data.local, &data.remote, strategy)
            .inspect_err(|_| self.pending_conflict = Some(data.clone()))
    }

    fn save_local(&mut self, mut state: ProjectState) -> Result<ProjectState, SyncError> {
        self.ctx.carry_sync_version(&mut state).inspect_err(|e| {
            self.ctx.status.set_error(SyncFailure::LocalLoad {
                project_id: state.id.clone(),
                message: e.to_string(),
            });
        })?;
        self.ctx.store.save_project(&state.id, &state).inspect_err(|e| {
            self.ctx.status.set_error(SyncFailure::LocalSave {
                project_id: state.id.clone(),
                message: e.to_string(),
            });
        })?;

        // With a conflict pending, re-evaluate against the remote side
        // instead of overwriting it.
        if let Some(pending) = self.pending_conflict.take() {
            self.on_remote(Some(pending.remote));
            return Ok(state);
        }

        if self.ctx.push_or_enqueue(Some(&self.user_id), &state)
            && self.ctx.status.current().status == SyncStatus::Synced
        {
            self.ctx.status.set_synced(now_millis());
        }
        Ok(state)
    }
}
