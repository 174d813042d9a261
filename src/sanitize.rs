use crate::errors::{AppError, AppResult};
use crate::models::{AppStateSnapshot, Folder, Note, NoteSettings, SortOrder, TrashedNote};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_FOLDER_NAME_CHARS: usize = 100;
pub const MAX_CONTENT_CHARS: usize = 500_000;
pub const MAX_ID_CHARS: usize = 64;
const MAX_THEME_CHARS: usize = 32;
const DEFAULT_FOLDER_NAME: &str = "Untitled folder";
const DEFAULT_NOTE_TITLE: &str = "Untitled";

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^[A-Za-z0-9_-]{{1,{}}}$", MAX_ID_CHARS)).expect("valid id regex")
});

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid script regex")
});

static INLINE_HANDLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<[^<>]*?)\s+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("valid handler regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub rekeyed_folders: usize,
    pub rekeyed_notes: usize,
    pub dropped_folder_refs: usize,
    pub dropped_favorites: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedImport {
    pub snapshot: AppStateSnapshot,
    pub settings: NoteSettings,
    pub report: SanitizeReport,
}

pub fn validate_shape(value: &Value) -> AppResult<()> {
    let schema = serde_json::json!({
        "type": "object",
        "required": ["folders"],
        "properties": {
            "folders": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "notes": { "type": "array", "items": { "type": "object" } }
                    }
                }
            },
            "trash": { "type": "array", "items": { "type": "object" } },
            "favorites": { "type": "array" },
            "settings": { "type": ["object", "null"] },
            "lastSavedTimestamp": { "type": ["number", "string", "null"] }
        }
    });

    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|error| AppError::Internal(format!("import schema failed to compile: {}", error)))?;

    let errors: Vec<String> = compiled
        .validate(value)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "import payload rejected: {}",
            errors.join("; ")
        )))
    }
}

pub fn sanitize_import(value: &Value, now: i64) -> AppResult<SanitizedImport> {
    validate_shape(value)?;

    let mut report = SanitizeReport::default();
    let mut folder_ids = IdAllocator::default();
    let mut note_ids = IdAllocator::default();

    let mut folders = Vec::new();
    for raw_folder in array_at(value, "folders") {
        let (id, retained) = folder_ids.claim(raw_folder.get("id"));
        if !retained {
            report.rekeyed_folders += 1;
        }
        let mut folder = Folder {
            id,
            name: clean_text(raw_folder.get("name"), MAX_FOLDER_NAME_CHARS, DEFAULT_FOLDER_NAME),
            created_at: coerce_timestamp(raw_folder.get("createdAt")).unwrap_or(now),
            notes: Vec::new(),
        };
        for raw_note in array_at(raw_folder, "notes") {
            let note = sanitize_note(raw_note, &mut note_ids, &mut report, now);
            folder.notes.push(Note {
                deleted_at: None,
                ..note
            });
        }
        folders.push(folder);
    }

    let mut trash = Vec::new();
    for raw_trashed in array_at(value, "trash") {
        let mut note = sanitize_note(raw_trashed, &mut note_ids, &mut report, now);
        note.deleted_at = Some(coerce_timestamp(raw_trashed.get("deletedAt")).unwrap_or(now));

        let original_folder_id = match coerce_string(raw_trashed.get("originalFolderId")) {
            Some(raw) => {
                let resolved = folder_ids.resolve(&raw);
                if resolved.is_none() {
                    report.dropped_folder_refs += 1;
                }
                resolved
            }
            None => None,
        };
        trash.push(TrashedNote {
            note,
            original_folder_id,
        });
    }

    let active_ids = folders
        .iter()
        .flat_map(|folder| folder.notes.iter())
        .map(|note| note.id.clone())
        .collect::<HashSet<_>>();
    let mut favorites = BTreeSet::new();
    for raw in array_at(value, "favorites") {
        let resolved = coerce_string(Some(raw))
            .and_then(|raw| note_ids.resolve(&raw))
            .filter(|id| active_ids.contains(id));
        match resolved {
            Some(id) => {
                favorites.insert(id);
            }
            None => report.dropped_favorites += 1,
        }
    }
    for note in folders.iter().flat_map(|folder| folder.notes.iter()) {
        if note.favorite {
            favorites.insert(note.id.clone());
        }
    }
    for note in folders.iter_mut().flat_map(|folder| folder.notes.iter_mut()) {
        note.favorite = favorites.contains(&note.id);
    }

    let snapshot = AppStateSnapshot {
        folders,
        trash,
        favorites,
        last_saved_timestamp: coerce_timestamp(value.get("lastSavedTimestamp")).unwrap_or(now),
    };
    let settings = sanitize_settings(value.get("settings"));

    Ok(SanitizedImport {
        snapshot,
        settings,
        report,
    })
}

fn sanitize_note(raw: &Value, ids: &mut IdAllocator, report: &mut SanitizeReport, now: i64) -> Note {
    let (id, retained) = ids.claim(raw.get("id"));
    if !retained {
        report.rekeyed_notes += 1;
    }
    let created_at = coerce_timestamp(raw.get("createdAt")).unwrap_or(now);
    let updated_at = coerce_timestamp(raw.get("updatedAt"))
        .unwrap_or(created_at)
        .max(created_at);
    Note {
        id,
        title: clean_text(raw.get("title"), MAX_TITLE_CHARS, DEFAULT_NOTE_TITLE),
        content: clean_content(raw.get("content")),
        created_at,
        updated_at,
        deleted_at: None,
        pinned: coerce_bool(raw.get("pinned")),
        favorite: coerce_bool(raw.get("favorite")),
    }
}

fn sanitize_settings(raw: Option<&Value>) -> NoteSettings {
    let mut settings = NoteSettings::default();
    let Some(Value::Object(map)) = raw else {
        return settings;
    };
    if let Some(theme) = coerce_string(map.get("theme")) {
        let theme = truncate_chars(theme.trim(), MAX_THEME_CHARS);
        if !theme.is_empty() {
            settings.theme = escape_text(&theme);
        }
    }
    if let Some(font_size) = coerce_timestamp(map.get("fontSize")) {
        settings.font_size = font_size.clamp(8, 48) as u32;
    }
    if let Some(value) = map.get("autosave") {
        settings.autosave = coerce_bool(Some(value));
    }
    if let Some(sort) = map
        .get("defaultSort")
        .and_then(|value| serde_json::from_value::<SortOrder>(value.clone()).ok())
    {
        settings.default_sort = sort;
    }
    if let Some(value) = map.get("showWordCount") {
        settings.show_word_count = coerce_bool(Some(value));
    }
    settings
}

#[derive(Debug, Default)]
struct IdAllocator {
    used: HashSet<String>,
    by_original: HashMap<String, Vec<String>>,
}

impl IdAllocator {
    fn claim(&mut self, raw: Option<&Value>) -> (String, bool) {
        let original = coerce_string(raw);
        let (id, retained) = match original.as_deref() {
            Some(candidate) if ID_PATTERN.is_match(candidate) && !self.used.contains(candidate) => {
                (candidate.to_string(), true)
            }
            _ => (Uuid::new_v4().to_string(), false),
        };
        self.used.insert(id.clone());
        if let Some(original) = original {
            self.by_original.entry(original).or_default().push(id.clone());
        }
        (id, retained)
    }

    fn resolve(&self, original: &str) -> Option<String> {
        let finals = self.by_original.get(original)?;
        if finals.iter().any(|id| id == original) {
            return Some(original.to_string());
        }
        match finals.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }
}

fn array_at<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

pub fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

pub fn escape_text(input: &str) -> String {
    let plain = input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&");
    plain
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn unescape_text(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

fn clean_text(raw: Option<&Value>, max: usize, fallback: &str) -> String {
    let text = coerce_string(raw).unwrap_or_default();
    let plain = unescape_text(text.trim());
    let capped = truncate_chars(plain.trim(), max);
    if capped.is_empty() {
        fallback.to_string()
    } else {
        escape_text(&capped)
    }
}

fn clean_content(raw: Option<&Value>) -> String {
    let content = coerce_string(raw).unwrap_or_default();
    let capped = truncate_chars(&content, MAX_CONTENT_CHARS);
    let mut cleaned = SCRIPT_BLOCK.replace_all(&capped, "").into_owned();
    // One handler per tag goes per pass.
    while INLINE_HANDLER.is_match(&cleaned) {
        cleaned = INLINE_HANDLER.replace_all(&cleaned, "${1}").into_owned();
    }
    cleaned
}

fn coerce_string(raw: Option<&Value>) -> Option<String> {
    match raw? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn coerce_timestamp(raw: Option<&Value>) -> Option<i64> {
    let parsed = match raw? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }?;
    (parsed >= 0).then_some(parsed)
}

fn coerce_bool(raw: Option<&Value>) -> bool {
    match raw {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{escape_text, sanitize_import, validate_shape, MAX_ID_CHARS, MAX_TITLE_CHARS};
    use crate::models::SortOrder;
    use serde_json::json;

    #[test]
    fn overlong_ids_are_rekeyed() {
        let longest = "f".repeat(MAX_ID_CHARS);
        let too_long = "g".repeat(MAX_ID_CHARS + 1);
        let sanitized = sanitize_import(
            &json!({ "folders": [{ "id": longest.as_str(), "name": "a" }, { "id": too_long.as_str(), "name": "b" }] }),
            10,
        )
        .expect("sanitize");
        assert_eq!(sanitized.snapshot.folders[0].id, longest);
        assert_ne!(sanitized.snapshot.folders[1].id, too_long);
        assert_eq!(sanitized.report.rekeyed_folders, 1);
    }

    #[test]
    fn escaping_is_idempotent() {
        let once = escape_text("a < b & \"c\"");
        assert_eq!(once, "a &lt; b &amp; &quot;c&quot;");
        assert_eq!(escape_text(&once), once);
    }

    #[test]
    fn shape_errors_list_the_offending_path() {
        let error = validate_shape(&json!({ "folders": "nope" })).expect_err("bad shape");
        let message = error.to_string();
        assert!(message.starts_with("VALIDATION"));
        assert!(message.contains("/folders"));

        assert!(validate_shape(&json!([1, 2])).is_err());
        assert!(validate_shape(&json!({ "trash": [] })).is_err());
    }

    #[test]
    fn duplicate_folder_ids_are_rekeyed_and_trash_refs_follow_the_survivor() {
        let payload = json!({
            "folders": [
                { "id": "f1", "name": "First", "notes": [] },
                { "id": "f1", "name": "Second", "notes": [] }
            ],
            "trash": [
                { "id": "n1", "title": "gone", "content": "", "createdAt": 1, "updatedAt": 2, "originalFolderId": "f1" }
            ]
        });
        let sanitized = sanitize_import(&payload, 1_000).expect("sanitize");

        let folders = &sanitized.snapshot.folders;
        assert_eq!(folders[0].id, "f1");
        assert_ne!(folders[1].id, "f1");
        assert_ne!(folders[0].id, folders[1].id);
        assert_eq!(sanitized.report.rekeyed_folders, 1);
        assert_eq!(
            sanitized.snapshot.trash[0].original_folder_id.as_deref(),
            Some("f1")
        );
    }

    #[test]
    fn ambiguous_folder_reference_is_dropped_not_dangling() {
        let payload = json!({
            "folders": [
                { "id": "bad id", "name": "One" },
                { "id": "bad id", "name": "Two" }
            ],
            "trash": [
                { "id": "n1", "title": "t", "originalFolderId": "bad id" },
                { "id": "n2", "title": "t", "originalFolderId": "missing" }
            ]
        });
        let sanitized = sanitize_import(&payload, 5).expect("sanitize");
        assert!(sanitized.snapshot.trash.iter().all(|t| t.original_folder_id.is_none()));
        assert_eq!(sanitized.report.dropped_folder_refs, 2);
    }

    #[test]
    fn uniquely_rekeyed_folder_reference_is_remapped() {
        let payload = json!({
            "folders": [{ "id": "has space", "name": "Only" }],
            "trash": [{ "id": "n1", "title": "t", "originalFolderId": "has space" }]
        });
        let sanitized = sanitize_import(&payload, 5).expect("sanitize");
        let folder_id = sanitized.snapshot.folders[0].id.clone();
        assert_ne!(folder_id, "has space");
        assert_eq!(sanitized.snapshot.trash[0].original_folder_id, Some(folder_id));
    }

    #[test]
    fn note_ids_share_one_namespace_across_folders_and_trash() {
        let payload = json!({
            "folders": [
                { "id": "a", "notes": [{ "id": "n1", "title": "x" }] },
                { "id": "b", "notes": [{ "id": "n1", "title": "y" }] }
            ],
            "trash": [{ "id": "n1", "title": "z" }]
        });
        let sanitized = sanitize_import(&payload, 5).expect("sanitize");
        let mut ids = sanitized
            .snapshot
            .folders
            .iter()
            .flat_map(|f| f.notes.iter().map(|n| n.id.clone()))
            .collect::<Vec<_>>();
        ids.push(sanitized.snapshot.trash[0].note.id.clone());
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(sanitized.report.rekeyed_notes, 2);
    }

    #[test]
    fn free_text_is_capped_escaped_and_defaulted() {
        let long_title = "x".repeat(MAX_TITLE_CHARS + 50);
        let payload = json!({
            "folders": [{
                "id": "f",
                "name": "  <b>Work</b>  ",
                "notes": [
                    { "id": "n1", "title": long_title, "content": "hi<script>alert(1)</script><img src=x onerror=\"boom()\" onload='x()'> one = 1" },
                    { "id": "n2", "title": "   " }
                ]
            }]
        });
        let sanitized = sanitize_import(&payload, 5).expect("sanitize");
        let folder = &sanitized.snapshot.folders[0];
        assert_eq!(folder.name, "&lt;b&gt;Work&lt;/b&gt;");
        assert_eq!(folder.notes[0].title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(folder.notes[0].content, "hi<img src=x> one = 1");
        assert_eq!(folder.notes[1].title, "Untitled");
    }

    #[test]
    fn numbers_and_flags_are_coerced_with_fallbacks() {
        let payload = json!({
            "folders": [{
                "id": "f",
                "notes": [
                    { "id": "n1", "createdAt": "150", "updatedAt": 100, "pinned": "true", "favorite": 1 },
                    { "id": "n2", "createdAt": -4, "updatedAt": "soon", "pinned": "nah" }
                ]
            }],
            "favorites": ["n2", "ghost"],
            "lastSavedTimestamp": "77.9",
            "settings": { "fontSize": "99", "theme": "dark", "defaultSort": "title-asc", "autosave": 0 }
        });
        let sanitized = sanitize_import(&payload, 1_000).expect("sanitize");
        let notes = &sanitized.snapshot.folders[0].notes;

        assert_eq!(notes[0].created_at, 150);
        assert_eq!(notes[0].updated_at, 150, "updatedAt never precedes createdAt");
        assert!(notes[0].pinned);
        assert!(notes[0].favorite);
        assert_eq!(notes[1].created_at, 1_000);
        assert!(!notes[1].pinned);
        assert!(notes[1].favorite, "listed in favorites");

        assert_eq!(sanitized.snapshot.favorites.len(), 2);
        assert_eq!(sanitized.report.dropped_favorites, 1);
        assert_eq!(sanitized.snapshot.last_saved_timestamp, 77);

        assert_eq!(sanitized.settings.font_size, 48);
        assert_eq!(sanitized.settings.theme, "dark");
        assert_eq!(sanitized.settings.default_sort, SortOrder::TitleAsc);
        assert!(!sanitized.settings.autosave);
    }
}
