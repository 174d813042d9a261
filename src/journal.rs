use crate::clock::Clock;
use crate::db::{keys, KvStore, KvStoreExt};
use crate::errors::AppResult;
use crate::models::{ItemType, PatchEntry, PatchKind};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub key: String,
    pub owner_id: String,
    pub item_id: String,
    pub entries: Vec<PatchEntry>,
}

#[derive(Clone)]
pub struct PatchJournal {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    context_id: String,
    max_entries: usize,
    high_water: Arc<AtomicI64>,
}

impl PatchJournal {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        context_id: impl Into<String>,
        max_entries: usize,
    ) -> Self {
        Self {
            store,
            clock,
            context_id: context_id.into(),
            max_entries: max_entries.max(1),
            high_water: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn high_water(&self) -> i64 {
        self.high_water.load(Ordering::SeqCst)
    }

    fn stamp(&self) -> i64 {
        let now = self.clock.now_ms();
        let mut previous = self.high_water.load(Ordering::SeqCst);
        loop {
            let next = now.max(previous + 1);
            match self
                .high_water
                .compare_exchange(previous, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    pub fn record(&self, item_id: &str, item_type: ItemType, kind: PatchKind) -> AppResult<PatchEntry> {
        let entry = PatchEntry {
            item_id: item_id.to_string(),
            item_type,
            kind,
            timestamp: self.stamp(),
        };
        self.append(&entry)?;
        Ok(entry)
    }

    pub fn append(&self, entry: &PatchEntry) -> AppResult<()> {
        let key = journal_key(&self.context_id, &entry.item_id);
        let mut entries = self.read_entries(&key);
        entries.push(entry.clone());
        if entries.len() > self.max_entries {
            let overflow = entries.len() - self.max_entries;
            entries.drain(..overflow);
        }
        self.store.set_json(&key, &entries)
    }

    /// Drops this context's entries stamped at or before `cutoff`.
    pub fn clear_own_through(&self, cutoff: i64) -> AppResult<usize> {
        let prefix = format!("{}{}:", keys::PATCH_PREFIX, self.context_id);
        let mut removed = 0usize;
        for key in self.store.keys_with_prefix(&prefix)? {
            let entries = self.read_entries(&key);
            let before = entries.len();
            let kept = entries
                .into_iter()
                .filter(|entry| entry.timestamp > cutoff)
                .collect::<Vec<_>>();
            removed += before - kept.len();
            if kept.is_empty() {
                self.store.remove(&key)?;
            } else if kept.len() != before {
                self.store.set_json(&key, &kept)?;
            }
        }
        Ok(removed)
    }

    pub fn records(&self) -> AppResult<Vec<JournalRecord>> {
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(keys::PATCH_PREFIX)? {
            let Some((owner_id, item_id)) = parse_journal_key(&key) else {
                tracing::debug!(key = %key, "skipping malformed journal key");
                continue;
            };
            records.push(JournalRecord {
                owner_id: owner_id.to_string(),
                item_id: item_id.to_string(),
                entries: self.read_entries(&key),
                key,
            });
        }
        Ok(records)
    }

    pub fn remove_record(&self, key: &str) -> AppResult<()> {
        self.store.remove(key)
    }

    fn read_entries(&self, key: &str) -> Vec<PatchEntry> {
        match self.store.get_json::<Vec<PatchEntry>>(key) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "discarding unreadable journal value");
                Vec::new()
            }
        }
    }
}

pub fn journal_key(owner_id: &str, item_id: &str) -> String {
    format!("{}{}:{}", keys::PATCH_PREFIX, owner_id, item_id)
}

fn parse_journal_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(keys::PATCH_PREFIX)?;
    let (owner, item) = rest.split_once(':')?;
    if owner.is_empty() || item.is_empty() {
        return None;
    }
    Some((owner, item))
}
