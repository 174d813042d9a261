use crate::db::{keys, KvStore, KvStoreExt};
use crate::errors::AppResult;
use crate::models::{AppStateSnapshot, SessionPointer, SortOrder};
use std::sync::Arc;

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> SessionPointer {
        match self.store.get_json::<SessionPointer>(keys::SESSION_POINTER) {
            Ok(pointer) => pointer.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(error = %error, "ignoring unreadable session pointer");
                SessionPointer::default()
            }
        }
    }

    pub fn save(&self, pointer: &SessionPointer) -> AppResult<()> {
        self.store.set_json(keys::SESSION_POINTER, pointer)
    }

    pub fn clear(&self) -> AppResult<()> {
        self.store.remove(keys::SESSION_POINTER)
    }

    pub fn select_note(&self, folder_id: &str, note_id: Option<&str>) -> AppResult<SessionPointer> {
        let mut pointer = self.load();
        pointer.active_folder_id = Some(folder_id.to_string());
        pointer.active_note_id = note_id.map(str::to_string);
        if let Some(note_id) = note_id {
            pointer
                .last_active_note_per_folder
                .insert(folder_id.to_string(), note_id.to_string());
        }
        self.save(&pointer)?;
        Ok(pointer)
    }

    pub fn set_sort_order(&self, sort_order: SortOrder) -> AppResult<SessionPointer> {
        let mut pointer = self.load();
        pointer.sort_order = sort_order;
        self.save(&pointer)?;
        Ok(pointer)
    }

    pub fn prune(&self, snapshot: &AppStateSnapshot) -> AppResult<bool> {
        let mut pointer = self.load();
        let before = pointer.clone();

        if let Some(folder_id) = pointer.active_folder_id.as_deref() {
            if snapshot.folder(folder_id).is_none() {
                pointer.active_folder_id = None;
                pointer.active_note_id = None;
            }
        }
        if let Some(note_id) = pointer.active_note_id.as_deref() {
            let in_active_folder = pointer
                .active_folder_id
                .as_deref()
                .and_then(|folder_id| snapshot.folder(folder_id))
                .map(|folder| folder.notes.iter().any(|note| note.id == note_id))
                .unwrap_or(false);
            if !in_active_folder {
                pointer.active_note_id = None;
            }
        }
        pointer.last_active_note_per_folder.retain(|folder_id, note_id| {
            snapshot
                .folder(folder_id)
                .map(|folder| folder.notes.iter().any(|note| &note.id == note_id))
                .unwrap_or(false)
        });

        if pointer == before {
            return Ok(false);
        }
        self.save(&pointer)?;
        Ok(true)
    }
}
