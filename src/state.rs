use crate::errors::{AppError, AppResult};
use crate::models::{AppStateSnapshot, Folder, Note, NoteDraft, TrashedNote};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

pub const RESTORED_FOLDER_NAME: &str = "Restored";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    Loaded,
    Reloaded,
    DocumentChanged { item_id: String },
    Saved { last_saved_timestamp: i64 },
    SaveFailed { error: String },
    Recovered { notice: String },
}

pub type Listener = Arc<dyn Fn(&StateEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftOutcome {
    Unchanged,
    Applied,
    Missing,
}

#[derive(Default)]
struct StateInner {
    snapshot: AppStateSnapshot,
    generation: u64,
    synced_generation: u64,
}

#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<StateInner>>,
    listeners: Arc<Mutex<Vec<(SubscriptionId, Listener)>>>,
    next_subscription: Arc<AtomicU64>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn notify(&self, event: StateEvent) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&event);
        }
    }

    fn read_inner(&self) -> AppResult<std::sync::RwLockReadGuard<'_, StateInner>> {
        self.inner
            .read()
            .map_err(|_| AppError::Internal("state lock poisoned".to_string()))
    }

    fn write_inner(&self) -> AppResult<std::sync::RwLockWriteGuard<'_, StateInner>> {
        self.inner
            .write()
            .map_err(|_| AppError::Internal("state lock poisoned".to_string()))
    }

    pub fn replace(&self, snapshot: AppStateSnapshot) -> AppResult<()> {
        let mut inner = self.write_inner()?;
        inner.snapshot = snapshot;
        inner.generation += 1;
        inner.synced_generation = inner.generation;
        Ok(())
    }

    pub fn snapshot(&self) -> AppResult<AppStateSnapshot> {
        Ok(self.read_inner()?.snapshot.clone())
    }

    pub fn read<R>(&self, f: impl FnOnce(&AppStateSnapshot) -> R) -> AppResult<R> {
        Ok(f(&self.read_inner()?.snapshot))
    }

    pub fn has_unsynced(&self) -> AppResult<bool> {
        let inner = self.read_inner()?;
        Ok(inner.generation > inner.synced_generation)
    }

    pub fn mutate<R>(&self, f: impl FnOnce(&mut AppStateSnapshot) -> AppResult<R>) -> AppResult<R> {
        let mut inner = self.write_inner()?;
        let result = f(&mut inner.snapshot)?;
        inner.generation += 1;
        Ok(result)
    }

    pub fn apply_draft(&self, draft: &NoteDraft, now: i64) -> AppResult<DraftOutcome> {
        let mut inner = self.write_inner()?;
        let Some(note) = inner.snapshot.note_mut(&draft.note_id) else {
            return Ok(DraftOutcome::Missing);
        };
        if note.title == draft.title && note.content == draft.content {
            return Ok(DraftOutcome::Unchanged);
        }
        note.title = draft.title.clone();
        note.content = draft.content.clone();
        note.updated_at = now.max(note.updated_at);
        inner.generation += 1;
        Ok(DraftOutcome::Applied)
    }

    pub fn capture_for_commit(&self, last_saved_timestamp: i64) -> AppResult<(AppStateSnapshot, u64)> {
        let inner = self.read_inner()?;
        let mut snapshot = inner.snapshot.clone();
        snapshot.last_saved_timestamp = last_saved_timestamp;
        Ok((snapshot, inner.generation))
    }

    pub fn mark_committed(&self, generation: u64, last_saved_timestamp: i64) -> AppResult<()> {
        let mut inner = self.write_inner()?;
        inner.synced_generation = inner.synced_generation.max(generation);
        inner.snapshot.last_saved_timestamp = last_saved_timestamp;
        Ok(())
    }

    pub fn last_saved_timestamp(&self) -> AppResult<i64> {
        Ok(self.read_inner()?.snapshot.last_saved_timestamp)
    }

    pub fn create_folder(&self, name: &str, now: i64) -> AppResult<Folder> {
        let folder = Folder::new(Uuid::new_v4().to_string(), name, now);
        let created = folder.clone();
        self.mutate(move |snapshot| {
            snapshot.folders.push(folder);
            Ok(())
        })?;
        Ok(created)
    }

    pub fn create_note(&self, folder_id: &str, title: &str, now: i64) -> AppResult<Note> {
        let note = Note::new(Uuid::new_v4().to_string(), title, now);
        let created = note.clone();
        self.mutate(|snapshot| {
            let folder = snapshot
                .folder_mut(folder_id)
                .ok_or_else(|| AppError::NotFound(format!("folder {}", folder_id)))?;
            folder.notes.insert(0, note);
            Ok(())
        })?;
        Ok(created)
    }

    pub fn rename_folder(&self, folder_id: &str, name: &str) -> AppResult<()> {
        self.mutate(|snapshot| {
            let folder = snapshot
                .folder_mut(folder_id)
                .ok_or_else(|| AppError::NotFound(format!("folder {}", folder_id)))?;
            folder.name = name.to_string();
            Ok(())
        })
    }

    pub fn rename_note(&self, note_id: &str, title: &str, now: i64) -> AppResult<()> {
        self.mutate(|snapshot| {
            let note = snapshot
                .note_mut(note_id)
                .ok_or_else(|| AppError::NotFound(format!("note {}", note_id)))?;
            note.title = title.to_string();
            note.updated_at = now.max(note.updated_at);
            Ok(())
        })
    }

    pub fn set_pinned(&self, note_id: &str, pinned: bool) -> AppResult<()> {
        self.mutate(|snapshot| {
            let note = snapshot
                .note_mut(note_id)
                .ok_or_else(|| AppError::NotFound(format!("note {}", note_id)))?;
            note.pinned = pinned;
            Ok(())
        })
    }

    pub fn toggle_favorite(&self, note_id: &str) -> AppResult<bool> {
        self.mutate(|snapshot| {
            let note = snapshot
                .note_mut(note_id)
                .ok_or_else(|| AppError::NotFound(format!("note {}", note_id)))?;
            note.favorite = !note.favorite;
            let favorite = note.favorite;
            if favorite {
                snapshot.favorites.insert(note_id.to_string());
            } else {
                snapshot.favorites.remove(note_id);
            }
            Ok(favorite)
        })
    }

    pub fn trash_note(&self, note_id: &str, now: i64) -> AppResult<()> {
        self.mutate(|snapshot| {
            let (folder_index, note_index) = snapshot
                .folders
                .iter()
                .enumerate()
                .find_map(|(folder_index, folder)| {
                    folder
                        .notes
                        .iter()
                        .position(|note| note.id == note_id)
                        .map(|note_index| (folder_index, note_index))
                })
                .ok_or_else(|| AppError::NotFound(format!("note {}", note_id)))?;
            let folder = &mut snapshot.folders[folder_index];
            let mut note = folder.notes.remove(note_index);
            note.deleted_at = Some(now);
            snapshot.trash.push(TrashedNote {
                note,
                original_folder_id: Some(folder.id.clone()),
            });
            snapshot.favorites.remove(note_id);
            Ok(())
        })
    }

    pub fn restore_note(&self, note_id: &str, now: i64) -> AppResult<String> {
        self.mutate(|snapshot| {
            let index = snapshot
                .trash
                .iter()
                .position(|trashed| trashed.note.id == note_id)
                .ok_or_else(|| AppError::NotFound(format!("trashed note {}", note_id)))?;
            let TrashedNote {
                mut note,
                original_folder_id,
            } = snapshot.trash.remove(index);
            note.deleted_at = None;

            let target = original_folder_id
                .filter(|folder_id| snapshot.folder(folder_id).is_some())
                .or_else(|| snapshot.folders.first().map(|folder| folder.id.clone()));
            let target = match target {
                Some(folder_id) => folder_id,
                None => {
                    let folder = Folder::new(Uuid::new_v4().to_string(), RESTORED_FOLDER_NAME, now);
                    let folder_id = folder.id.clone();
                    snapshot.folders.push(folder);
                    folder_id
                }
            };
            if note.favorite {
                snapshot.favorites.insert(note.id.clone());
            }
            if let Some(folder) = snapshot.folder_mut(&target) {
                folder.notes.insert(0, note);
            }
            Ok(target)
        })
    }

    pub fn delete_folder(&self, folder_id: &str, now: i64) -> AppResult<usize> {
        self.mutate(|snapshot| {
            let index = snapshot
                .folders
                .iter()
                .position(|folder| folder.id == folder_id)
                .ok_or_else(|| AppError::NotFound(format!("folder {}", folder_id)))?;
            let folder = snapshot.folders.remove(index);
            let moved = folder.notes.len();
            for mut note in folder.notes {
                snapshot.favorites.remove(&note.id);
                note.deleted_at = Some(now);
                snapshot.trash.push(TrashedNote {
                    note,
                    original_folder_id: Some(folder.id.clone()),
                });
            }
            Ok(moved)
        })
    }

    pub fn purge_trashed_note(&self, note_id: &str) -> AppResult<()> {
        self.mutate(|snapshot| {
            let before = snapshot.trash.len();
            snapshot.trash.retain(|trashed| trashed.note.id != note_id);
            if snapshot.trash.len() == before {
                return Err(AppError::NotFound(format!("trashed note {}", note_id)));
            }
            Ok(())
        })
    }

    pub fn empty_trash(&self) -> AppResult<usize> {
        self.mutate(|snapshot| {
            let removed = snapshot.trash.len();
            snapshot.trash.clear();
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{DraftOutcome, StateEvent, StateStore, RESTORED_FOLDER_NAME};
    use crate::models::{AppStateSnapshot, Folder, Note, NoteDraft};
    use std::sync::{Arc, Mutex};

    fn seeded() -> StateStore {
        let mut snapshot = AppStateSnapshot::default();
        let mut folder = Folder::new("f1", "Inbox", 1);
        folder.notes.push(Note::new("n1", "A", 100));
        snapshot.folders.push(folder);
        let state = StateStore::new();
        state.replace(snapshot).expect("replace");
        state
    }

    fn draft(title: &str, content: &str) -> NoteDraft {
        NoteDraft {
            note_id: "n1".to_string(),
            title: title.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn listeners_receive_events_until_unsubscribed() {
        let state = StateStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = state.subscribe(Arc::new(move |event| {
            sink.lock().expect("sink").push(event.clone());
        }));

        state.notify(StateEvent::Loaded);
        assert!(state.unsubscribe(id));
        state.notify(StateEvent::Reloaded);

        assert_eq!(*seen.lock().expect("seen"), vec![StateEvent::Loaded]);
        assert!(!state.unsubscribe(id));
    }

    #[test]
    fn listener_may_read_state_during_notification() {
        let state = seeded();
        let reader = state.clone();
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        state.subscribe(Arc::new(move |_| {
            *sink.lock().expect("sink") = reader.read(|snapshot| snapshot.note_count()).expect("read");
        }));
        state.notify(StateEvent::Loaded);
        assert_eq!(*count.lock().expect("count"), 1);
    }

    #[test]
    fn draft_application_tracks_unsynced_generations() {
        let state = seeded();
        assert!(!state.has_unsynced().expect("unsynced"));

        assert_eq!(state.apply_draft(&draft("A", ""), 200).expect("apply"), DraftOutcome::Unchanged);
        assert_eq!(state.apply_draft(&draft("B", "body"), 200).expect("apply"), DraftOutcome::Applied);
        assert!(state.has_unsynced().expect("unsynced"));

        let (captured, generation) = state.capture_for_commit(201).expect("capture");
        assert_eq!(captured.last_saved_timestamp, 201);
        assert_eq!(captured.note("n1").map(|note| note.updated_at), Some(200));

        state.apply_draft(&draft("C", "body"), 202).expect("apply");
        state.mark_committed(generation, 201).expect("commit");
        assert!(state.has_unsynced().expect("edit after capture is still unsynced"));
    }

    #[test]
    fn draft_for_missing_note_is_reported() {
        let state = seeded();
        let mut missing = draft("x", "y");
        missing.note_id = "gone".to_string();
        assert_eq!(state.apply_draft(&missing, 1).expect("apply"), DraftOutcome::Missing);
    }

    #[test]
    fn trash_and_restore_round_trip_through_original_folder() {
        let state = seeded();
        assert!(state.toggle_favorite("n1").expect("favorite"));
        state.trash_note("n1", 300).expect("trash");

        let snapshot = state.snapshot().expect("snapshot");
        assert_eq!(snapshot.note_count(), 0);
        assert_eq!(snapshot.trash[0].original_folder_id.as_deref(), Some("f1"));
        assert_eq!(snapshot.trash[0].note.deleted_at, Some(300));
        assert!(snapshot.favorites.is_empty());

        assert_eq!(state.restore_note("n1", 400).expect("restore"), "f1");
        let snapshot = state.snapshot().expect("snapshot");
        assert_eq!(snapshot.folder_id_of_note("n1"), Some("f1"));
        assert!(snapshot.favorites.contains("n1"));
        assert!(snapshot.note("n1").and_then(|note| note.deleted_at).is_none());
    }

    #[test]
    fn restore_without_any_folder_creates_one() {
        let state = seeded();
        state.delete_folder("f1", 300).expect("delete folder");
        let target = state.restore_note("n1", 400).expect("restore");

        let snapshot = state.snapshot().expect("snapshot");
        let folder = snapshot.folder(&target).expect("restored folder");
        assert_eq!(folder.name, RESTORED_FOLDER_NAME);
        assert_eq!(folder.notes.len(), 1);
    }

    #[test]
    fn failed_mutation_does_not_bump_generation() {
        let state = seeded();
        assert!(state.rename_folder("nope", "x").is_err());
        assert!(!state.has_unsynced().expect("unsynced"));
        state.rename_folder("f1", "Work").expect("rename");
        assert!(state.has_unsynced().expect("unsynced"));
    }

    #[test]
    fn purge_and_empty_trash() {
        let state = seeded();
        let note = state.create_note("f1", "second", 10).expect("create");
        state.trash_note("n1", 20).expect("trash");
        state.trash_note(&note.id, 20).expect("trash");

        state.purge_trashed_note("n1").expect("purge");
        assert!(state.purge_trashed_note("n1").is_err());
        assert_eq!(state.empty_trash().expect("empty"), 1);
    }
}
