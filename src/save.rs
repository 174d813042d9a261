use crate::clock::{next_saved_timestamp, Clock};
use crate::db::{write_app_state, KvStore};
use crate::errors::{AppError, AppResult};
use crate::journal::PatchJournal;
use crate::models::NoteDraft;
use crate::state::{DraftOutcome, StateEvent, StateStore};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

pub trait EditorSource: Send + Sync {
    fn current_draft(&self) -> Option<NoteDraft>;
}

#[derive(Debug, Clone, Default)]
pub struct DraftBuffer {
    draft: Arc<Mutex<Option<NoteDraft>>>,
}

impl DraftBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, draft: NoteDraft) {
        if let Ok(mut slot) = self.draft.lock() {
            *slot = Some(draft);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.draft.lock() {
            *slot = None;
        }
    }

    pub fn update_if(&self, note_id: &str, f: impl FnOnce(&mut NoteDraft)) {
        if let Ok(mut slot) = self.draft.lock() {
            if let Some(draft) = slot.as_mut().filter(|draft| draft.note_id == note_id) {
                f(draft);
            }
        }
    }
}

impl EditorSource for DraftBuffer {
    fn current_draft(&self) -> Option<NoteDraft> {
        self.draft.lock().ok().and_then(|slot| slot.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Clean,
    Dirty,
    Scheduled,
    Committing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Scheduled,
    Unchanged,
    Committed { last_saved_timestamp: i64 },
}

#[derive(Clone)]
pub struct SaveCoordinator {
    state: StateStore,
    durable: Arc<dyn KvStore>,
    journal: PatchJournal,
    clock: Arc<dyn Clock>,
    editor: Arc<RwLock<Arc<dyn EditorSource>>>,
    debounce: Duration,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    status: Arc<Mutex<SaveState>>,
}

impl SaveCoordinator {
    pub fn new(
        state: StateStore,
        durable: Arc<dyn KvStore>,
        journal: PatchJournal,
        clock: Arc<dyn Clock>,
        editor: Arc<dyn EditorSource>,
        debounce: Duration,
    ) -> Self {
        Self {
            state,
            durable,
            journal,
            clock,
            editor: Arc::new(RwLock::new(editor)),
            debounce,
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
            timer: Arc::new(Mutex::new(None)),
            status: Arc::new(Mutex::new(SaveState::Clean)),
        }
    }

    pub fn set_editor(&self, editor: Arc<dyn EditorSource>) {
        if let Ok(mut slot) = self.editor.write() {
            *slot = editor;
        }
    }

    pub fn status(&self) -> SaveState {
        self.status.lock().map(|status| *status).unwrap_or(SaveState::Dirty)
    }

    fn set_status(&self, next: SaveState) {
        if let Ok(mut status) = self.status.lock() {
            *status = next;
        }
    }

    pub fn mark_dirty(&self) {
        if let Ok(mut status) = self.status.lock() {
            if *status == SaveState::Clean {
                *status = SaveState::Dirty;
            }
        }
    }

    /// Cancels any pending debounce and waits out an in-flight commit. No
    /// commit starts while the returned guard is held.
    pub async fn quiesce(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.cancel_timer();
        let guard = self.commit_lock.lock().await;
        self.cancel_timer();
        guard
    }

    fn cancel_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    pub async fn schedule_save(&self, forced: bool) -> AppResult<SaveOutcome> {
        self.cancel_timer();
        if forced {
            return self.commit().await;
        }

        {
            let mut status = self
                .status
                .lock()
                .map_err(|_| AppError::Internal("save status mutex poisoned".to_string()))?;
            if *status == SaveState::Clean {
                return Ok(SaveOutcome::Unchanged);
            }
            *status = SaveState::Scheduled;
        }
        let coordinator = self.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(error) = coordinator.commit().await {
                tracing::warn!(error = %error, "debounced save failed; note stays dirty");
            }
        });
        if let Ok(mut timer) = self.timer.lock() {
            *timer = Some(handle);
        }
        Ok(SaveOutcome::Scheduled)
    }

    pub async fn commit(&self) -> AppResult<SaveOutcome> {
        let _token = self.commit_lock.lock().await;
        self.set_status(SaveState::Committing);

        // Entries stamped after this point may be newer than the draft.
        let cutoff = self.journal.high_water();
        let draft = self
            .editor
            .read()
            .ok()
            .and_then(|editor| editor.current_draft());
        let now = self.clock.now_ms();

        if let Some(draft) = &draft {
            match self.state.apply_draft(draft, now) {
                Ok(DraftOutcome::Missing) => {
                    tracing::debug!(note_id = %draft.note_id, "draft target no longer exists");
                }
                Ok(_) => {}
                Err(error) => {
                    self.set_status(SaveState::Dirty);
                    return Err(error);
                }
            }
        }

        if !self.state.has_unsynced()? {
            self.set_status(SaveState::Clean);
            return Ok(SaveOutcome::Unchanged);
        }

        let last_saved_timestamp = next_saved_timestamp(self.state.last_saved_timestamp()?, now);
        let (snapshot, generation) = self.state.capture_for_commit(last_saved_timestamp)?;

        if let Err(error) = write_app_state(self.durable.as_ref(), &snapshot) {
            tracing::warn!(error = %error, "save failed; keeping edits in memory");
            self.set_status(SaveState::Dirty);
            self.state.notify(StateEvent::SaveFailed {
                error: error.to_string(),
            });
            return Err(error);
        }

        self.state.mark_committed(generation, last_saved_timestamp)?;
        if let Err(error) = self.journal.clear_own_through(cutoff) {
            tracing::warn!(error = %error, "failed to clear committed journal entries");
        }

        let remaining = if self.state.has_unsynced()? {
            SaveState::Dirty
        } else {
            SaveState::Clean
        };
        self.set_status(remaining);
        tracing::debug!(last_saved_timestamp, "committed app state");
        self.state.notify(StateEvent::Saved {
            last_saved_timestamp,
        });
        Ok(SaveOutcome::Committed {
            last_saved_timestamp,
        })
    }
}
