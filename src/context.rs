use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::db::{self, read_app_state, read_settings, StoreSet};
use crate::errors::{AppError, AppResult};
use crate::heartbeat::HeartbeatRegistry;
use crate::journal::PatchJournal;
use crate::lease::LeaseLock;
use crate::models::{
    AppStateSnapshot, ExportPayload, Folder, ItemType, Note, NoteDraft, NotePatchData, NoteSettings,
    PatchKind, SessionPointer,
};
use crate::recovery::{RecoveryPipeline, RecoveryReport};
use crate::save::{DraftBuffer, EditorSource, SaveCoordinator, SaveOutcome, SaveState};
use crate::session::SessionStore;
use crate::state::{StateEvent, StateStore, SubscriptionId};
use crate::transfer::{ImportSummary, ImportTransaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct NotesCore {
    context_id: String,
    config: CoreConfig,
    stores: StoreSet,
    clock: Arc<dyn Clock>,
    state: StateStore,
    heartbeats: HeartbeatRegistry,
    lease: LeaseLock,
    journal: PatchJournal,
    saves: SaveCoordinator,
    session: SessionStore,
    drafts: DraftBuffer,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotesCore {
    pub fn new(config: CoreConfig, stores: StoreSet) -> Self {
        Self::with_clock(config, stores, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CoreConfig, stores: StoreSet, clock: Arc<dyn Clock>) -> Self {
        let context_id = Uuid::new_v4().to_string();
        let state = StateStore::new();
        let heartbeats = HeartbeatRegistry::new(
            stores.session.clone(),
            clock.clone(),
            context_id.clone(),
            std::time::Duration::from_millis(config.heartbeat_stale_after_ms),
        );
        let lease = LeaseLock::new(stores.session.clone(), clock.clone(), config.lease_timeout());
        let journal = PatchJournal::new(
            stores.local.clone(),
            clock.clone(),
            context_id.clone(),
            config.journal_max_entries_per_item,
        );
        let drafts = DraftBuffer::new();
        let saves = SaveCoordinator::new(
            state.clone(),
            stores.durable.clone(),
            journal.clone(),
            clock.clone(),
            Arc::new(drafts.clone()),
            config.save_debounce(),
        );
        let session = SessionStore::new(stores.local.clone());

        tracing::debug!(context_id = %context_id, "execution context created");
        Self {
            context_id,
            config,
            stores,
            clock,
            state,
            heartbeats,
            lease,
            journal,
            saves,
            session,
            drafts,
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn open(data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let config = CoreConfig::load(data_dir)?;
        let stores = StoreSet::open(data_dir, &config)?;
        Ok(Self::new(config, stores))
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn start_heartbeat(&self) -> AppResult<()> {
        self.heartbeats.beat()?;
        let handle = self.heartbeats.spawn(self.config.heartbeat_interval());
        let mut task = self
            .heartbeat_task
            .lock()
            .map_err(|_| AppError::Internal("heartbeat task mutex poisoned".to_string()))?;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn load_data(&self) -> AppResult<Option<String>> {
        if let Err(error) = self.heartbeats.beat() {
            tracing::warn!(context_id = %self.context_id, error = %error, "initial heartbeat failed");
        }
        let report = self.recover()?;
        let notice = report.notice();
        if let Some(notice) = &notice {
            self.state.notify(StateEvent::Recovered {
                notice: notice.clone(),
            });
        }
        Ok(notice)
    }

    fn recover(&self) -> AppResult<RecoveryReport> {
        let pipeline = RecoveryPipeline::new(
            self.stores.clone(),
            self.clock.clone(),
            self.lease.clone(),
            self.heartbeats.clone(),
            self.journal.clone(),
            self.session.clone(),
        );
        let (snapshot, report) = pipeline.run()?;
        self.state.replace(snapshot)?;
        self.drafts.clear();
        self.state.notify(StateEvent::Loaded);
        Ok(report)
    }

    pub fn reload(&self) -> AppResult<()> {
        let snapshot = read_app_state(self.stores.durable.as_ref())?;
        if let Err(error) = self.session.prune(&snapshot) {
            tracing::warn!(error = %error, "failed to prune session pointer");
        }
        self.state.replace(snapshot)?;
        self.drafts.clear();
        self.state.notify(StateEvent::Reloaded);
        Ok(())
    }

    pub fn subscribe(&self, listener: impl Fn(&StateEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.state.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub fn snapshot(&self) -> AppResult<AppStateSnapshot> {
        self.state.snapshot()
    }

    pub fn save_state(&self) -> SaveState {
        self.saves.status()
    }

    pub fn set_editor(&self, editor: Arc<dyn EditorSource>) {
        self.saves.set_editor(editor);
    }

    pub async fn schedule_save(&self, forced: bool) -> AppResult<SaveOutcome> {
        self.saves.schedule_save(forced).await
    }

    pub async fn run_import(&self, raw: &str) -> AppResult<ImportSummary> {
        let result = self.import_quiesced(raw).await;
        if result.is_err() && self.saves.status() != SaveState::Clean {
            // The import cancelled the pending debounce; re-arm it.
            self.saves.schedule_save(false).await?;
        }
        result
    }

    async fn import_quiesced(&self, raw: &str) -> AppResult<ImportSummary> {
        let _quiet = self.saves.quiesce().await;
        let transaction = ImportTransaction::new(
            self.stores.clone(),
            self.clock.clone(),
            self.lease.clone(),
            self.session.clone(),
            self.context_id.clone(),
        );
        let summary = transaction.run(raw)?;
        if let Err(error) = self.journal.clear_own_through(i64::MAX) {
            tracing::warn!(error = %error, "failed to clear journal after import");
        }
        self.reload()?;
        Ok(summary)
    }

    pub async fn export_data(&self) -> AppResult<ExportPayload> {
        if let Err(error) = self.saves.schedule_save(true).await {
            tracing::warn!(error = %error, "exporting unsaved in-memory state");
        }
        let snapshot = self.state.snapshot()?;
        let settings = read_settings(self.stores.durable.as_ref())?;
        Ok(ExportPayload::from_parts(&snapshot, &settings))
    }

    pub fn settings(&self) -> AppResult<NoteSettings> {
        read_settings(self.stores.durable.as_ref())
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<NoteSettings> {
        db::update_settings(self.stores.durable.as_ref(), update)
    }

    pub fn session_pointer(&self) -> SessionPointer {
        self.session.load()
    }

    pub async fn select_note(&self, folder_id: &str, note_id: Option<&str>) -> AppResult<SessionPointer> {
        if let Err(error) = self.saves.schedule_save(true).await {
            tracing::warn!(error = %error, "save on navigation failed");
        }
        let draft = self.state.read(|snapshot| -> AppResult<Option<NoteDraft>> {
            let folder = snapshot
                .folder(folder_id)
                .ok_or_else(|| AppError::NotFound(format!("folder {}", folder_id)))?;
            let Some(note_id) = note_id else {
                return Ok(None);
            };
            let note = folder
                .notes
                .iter()
                .find(|note| note.id == note_id)
                .ok_or_else(|| AppError::NotFound(format!("note {} in folder {}", note_id, folder_id)))?;
            Ok(Some(NoteDraft {
                note_id: note.id.clone(),
                title: note.title.clone(),
                content: note.content.clone(),
            }))
        })??;
        match draft {
            Some(draft) => self.drafts.set(draft),
            None => self.drafts.clear(),
        }
        self.session.select_note(folder_id, note_id)
    }

    pub async fn edit_note(&self, note_id: &str, title: &str, content: &str) -> AppResult<SaveOutcome> {
        if !self.state.read(|snapshot| snapshot.note(note_id).is_some())? {
            return Err(AppError::NotFound(format!("note {}", note_id)));
        }
        self.drafts.set(NoteDraft {
            note_id: note_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
        });
        let patch = PatchKind::Content {
            data: NotePatchData {
                title: Some(title.to_string()),
                content: Some(content.to_string()),
            },
        };
        if let Err(error) = self.journal.record(note_id, ItemType::Note, patch) {
            tracing::warn!(note_id = %note_id, error = %error, "failed to journal edit");
        }
        self.saves.mark_dirty();
        self.state.notify(StateEvent::DocumentChanged {
            item_id: note_id.to_string(),
        });
        self.saves.schedule_save(false).await
    }

    pub async fn rename_folder(&self, folder_id: &str, name: &str) -> AppResult<()> {
        self.state.rename_folder(folder_id, name)?;
        self.journal_rename(folder_id, ItemType::Folder, name);
        self.persist(folder_id).await
    }

    pub async fn rename_note(&self, note_id: &str, title: &str) -> AppResult<()> {
        self.state.rename_note(note_id, title, self.clock.now_ms())?;
        self.drafts.update_if(note_id, |draft| draft.title = title.to_string());
        self.journal_rename(note_id, ItemType::Note, title);
        self.persist(note_id).await
    }

    pub async fn create_folder(&self, name: &str) -> AppResult<Folder> {
        let folder = self.state.create_folder(name, self.clock.now_ms())?;
        self.persist(&folder.id).await?;
        Ok(folder)
    }

    pub async fn create_note(&self, folder_id: &str, title: &str) -> AppResult<Note> {
        let note = self.state.create_note(folder_id, title, self.clock.now_ms())?;
        self.persist(&note.id).await?;
        Ok(note)
    }

    pub async fn set_pinned(&self, note_id: &str, pinned: bool) -> AppResult<()> {
        self.state.set_pinned(note_id, pinned)?;
        self.persist(note_id).await
    }

    pub async fn toggle_favorite(&self, note_id: &str) -> AppResult<bool> {
        let favorite = self.state.toggle_favorite(note_id)?;
        self.persist(note_id).await?;
        Ok(favorite)
    }

    pub async fn trash_note(&self, note_id: &str) -> AppResult<()> {
        self.state.trash_note(note_id, self.clock.now_ms())?;
        self.persist(note_id).await
    }

    pub async fn restore_note(&self, note_id: &str) -> AppResult<String> {
        let folder_id = self.state.restore_note(note_id, self.clock.now_ms())?;
        self.persist(note_id).await?;
        Ok(folder_id)
    }

    pub async fn delete_folder(&self, folder_id: &str) -> AppResult<usize> {
        let moved = self.state.delete_folder(folder_id, self.clock.now_ms())?;
        self.persist(folder_id).await?;
        Ok(moved)
    }

    pub async fn purge_trashed_note(&self, note_id: &str) -> AppResult<()> {
        self.state.purge_trashed_note(note_id)?;
        self.persist(note_id).await
    }

    pub async fn empty_trash(&self) -> AppResult<usize> {
        let removed = self.state.empty_trash()?;
        if removed > 0 {
            self.persist("trash").await?;
        }
        Ok(removed)
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        let saved = self.saves.schedule_save(true).await;
        if let Ok(mut task) = self.heartbeat_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        if let Err(error) = self.heartbeats.remove() {
            tracing::warn!(context_id = %self.context_id, error = %error, "failed to remove heartbeat");
        }
        tracing::debug!(context_id = %self.context_id, "execution context shut down");
        saved.map(|_| ())
    }

    fn journal_rename(&self, item_id: &str, item_type: ItemType, new_name: &str) {
        let patch = PatchKind::Rename {
            new_name: new_name.to_string(),
        };
        if let Err(error) = self.journal.record(item_id, item_type, patch) {
            tracing::warn!(item_id = %item_id, error = %error, "failed to journal rename");
        }
    }

    async fn persist(&self, item_id: &str) -> AppResult<()> {
        self.saves.mark_dirty();
        self.state.notify(StateEvent::DocumentChanged {
            item_id: item_id.to_string(),
        });
        self.saves.commit().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::NotesCore;
    use crate::clock::ManualClock;
    use crate::config::CoreConfig;
    use crate::db::{keys, read_app_state, KvStore, StoreSet};
    use crate::errors::AppError;
    use crate::save::SaveState;
    use crate::state::{StateEvent, RESTORED_FOLDER_NAME};
    use std::sync::{Arc, Mutex};

    fn core(stores: &StoreSet) -> NotesCore {
        NotesCore::with_clock(
            CoreConfig::default(),
            stores.clone(),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[tokio::test]
    async fn structural_edits_are_written_immediately() {
        let stores = StoreSet::in_memory();
        let core = core(&stores);
        core.load_data().expect("load");

        let folder = core.create_folder("Inbox").await.expect("folder");
        let note = core.create_note(&folder.id, "First").await.expect("note");
        assert!(core.toggle_favorite(&note.id).await.expect("favorite"));
        core.set_pinned(&note.id, true).await.expect("pin");

        let durable = read_app_state(stores.durable.as_ref()).expect("read");
        let stored = durable.note(&note.id).expect("stored note");
        assert!(stored.pinned && stored.favorite);
        assert!(durable.favorites.contains(&note.id));
        assert_eq!(core.save_state(), SaveState::Clean);
    }

    #[tokio::test]
    async fn trash_round_trip_and_restore_fallbacks() {
        let stores = StoreSet::in_memory();
        let core = core(&stores);
        core.load_data().expect("load");

        let folder = core.create_folder("Inbox").await.expect("folder");
        let note = core.create_note(&folder.id, "n").await.expect("note");
        assert_eq!(core.delete_folder(&folder.id).await.expect("delete"), 1);

        let restored_into = core.restore_note(&note.id).await.expect("restore");
        let snapshot = core.snapshot().expect("snapshot");
        assert_eq!(snapshot.folder(&restored_into).map(|f| f.name.as_str()), Some(RESTORED_FOLDER_NAME));
        assert!(snapshot.trash.is_empty());

        core.trash_note(&note.id).await.expect("trash");
        assert_eq!(core.empty_trash().await.expect("empty"), 1);
        assert!(matches!(
            core.purge_trashed_note(&note.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_updates_buffered_draft_and_journal_is_cleared() {
        let stores = StoreSet::in_memory();
        let core = core(&stores);
        core.load_data().expect("load");
        let folder = core.create_folder("Inbox").await.expect("folder");
        let note = core.create_note(&folder.id, "old").await.expect("note");

        core.select_note(&folder.id, Some(&note.id)).await.expect("select");
        core.rename_note(&note.id, "new").await.expect("rename");
        core.schedule_save(true).await.expect("save");

        let durable = read_app_state(stores.durable.as_ref()).expect("read");
        assert_eq!(durable.note(&note.id).map(|n| n.title.as_str()), Some("new"));
        assert!(stores.local.keys_with_prefix(keys::PATCH_PREFIX).expect("keys").is_empty());
        assert_eq!(core.session_pointer().active_note_id.as_deref(), Some(note.id.as_str()));
    }

    #[tokio::test]
    async fn edits_to_unknown_notes_are_rejected() {
        let stores = StoreSet::in_memory();
        let core = core(&stores);
        core.load_data().expect("load");
        let error = core.edit_note("nope", "t", "c").await.expect_err("missing");
        assert!(matches!(error, AppError::NotFound(_)));
        assert!(stores.local.keys_with_prefix(keys::PATCH_PREFIX).expect("keys").is_empty());
    }

    #[tokio::test]
    async fn import_reloads_and_notifies() {
        let stores = StoreSet::in_memory();
        let core = core(&stores);
        core.load_data().expect("load");
        core.create_folder("Before").await.expect("folder");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        core.subscribe(move |event| sink.lock().expect("events").push(event.clone()));

        let raw = r#"{"folders":[{"id":"f1","name":"After","notes":[]}]}"#;
        core.run_import(raw).await.expect("import");

        let snapshot = core.snapshot().expect("snapshot");
        assert_eq!(snapshot.folders.len(), 1);
        assert_eq!(snapshot.folders[0].name, "After");
        assert!(events.lock().expect("events").contains(&StateEvent::Reloaded));
    }

    #[tokio::test]
    async fn shutdown_flushes_and_deregisters() {
        let stores = StoreSet::in_memory();
        let core = core(&stores);
        core.load_data().expect("load");
        core.start_heartbeat().expect("heartbeat");
        let folder = core.create_folder("Inbox").await.expect("folder");
        let note = core.create_note(&folder.id, "t").await.expect("note");
        core.edit_note(&note.id, "t", "typed").await.expect("edit");

        core.shutdown().await.expect("shutdown");

        let durable = read_app_state(stores.durable.as_ref()).expect("read");
        assert_eq!(durable.note(&note.id).map(|n| n.content.as_str()), Some("typed"));
        assert!(stores.session.keys_with_prefix(keys::HEARTBEAT_PREFIX).expect("keys").is_empty());
    }
}
