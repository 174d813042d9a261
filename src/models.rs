use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub favorite: bool,
}

impl Note {
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            pinned: false,
            favorite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: now,
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashedNote {
    #[serde(flatten)]
    pub note: Note,
    #[serde(default)]
    pub original_folder_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSnapshot {
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub trash: Vec<TrashedNote>,
    #[serde(default)]
    pub favorites: BTreeSet<String>,
    #[serde(default)]
    pub last_saved_timestamp: i64,
}

impl AppStateSnapshot {
    pub fn folder(&self, folder_id: &str) -> Option<&Folder> {
        self.folders.iter().find(|folder| folder.id == folder_id)
    }

    pub fn folder_mut(&mut self, folder_id: &str) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|folder| folder.id == folder_id)
    }

    pub fn note(&self, note_id: &str) -> Option<&Note> {
        self.folders
            .iter()
            .flat_map(|folder| folder.notes.iter())
            .find(|note| note.id == note_id)
    }

    pub fn note_mut(&mut self, note_id: &str) -> Option<&mut Note> {
        self.folders
            .iter_mut()
            .flat_map(|folder| folder.notes.iter_mut())
            .find(|note| note.id == note_id)
    }

    pub fn folder_id_of_note(&self, note_id: &str) -> Option<&str> {
        self.folders
            .iter()
            .find(|folder| folder.notes.iter().any(|note| note.id == note_id))
            .map(|folder| folder.id.as_str())
    }

    pub fn note_count(&self) -> usize {
        self.folders.iter().map(|folder| folder.notes.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Folder,
    Note,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Note => "note",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePatchData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PatchKind {
    Content {
        data: NotePatchData,
    },
    Rename {
        #[serde(rename = "newName")]
        new_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEntry {
    pub item_id: String,
    pub item_type: ItemType,
    #[serde(flatten)]
    pub kind: PatchKind,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub owner_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    #[default]
    UpdatedDesc,
    UpdatedAsc,
    CreatedDesc,
    TitleAsc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoteSettings {
    pub theme: String,
    pub font_size: u32,
    pub autosave: bool,
    pub default_sort: SortOrder,
    pub show_word_count: bool,
}

impl Default for NoteSettings {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            font_size: 16,
            autosave: true,
            default_sort: SortOrder::UpdatedDesc,
            show_word_count: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPointer {
    pub active_folder_id: Option<String>,
    pub active_note_id: Option<String>,
    pub sort_order: SortOrder,
    pub last_active_note_per_folder: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStagingRecord {
    pub app_state: AppStateSnapshot,
    pub settings: NoteSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub settings: NoteSettings,
    pub folders: Vec<Folder>,
    pub trash: Vec<TrashedNote>,
    pub favorites: Vec<String>,
    pub last_saved_timestamp: i64,
}

impl ExportPayload {
    pub fn from_parts(snapshot: &AppStateSnapshot, settings: &NoteSettings) -> Self {
        Self {
            settings: settings.clone(),
            folders: snapshot.folders.clone(),
            trash: snapshot.trash.clone(),
            favorites: snapshot.favorites.iter().cloned().collect(),
            last_saved_timestamp: snapshot.last_saved_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDraft {
    pub note_id: String,
    pub title: String,
    pub content: String,
}
