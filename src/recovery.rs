use crate::clock::{next_saved_timestamp, Clock};
use crate::db::{keys, read_app_state, write_app_state, write_settings, KvStoreExt, StoreSet};
use crate::errors::AppResult;
use crate::heartbeat::HeartbeatRegistry;
use crate::journal::{JournalRecord, PatchJournal};
use crate::lease::LeaseLock;
use crate::models::{AppStateSnapshot, ImportStagingRecord, ItemType, PatchEntry, PatchKind};
use crate::session::SessionStore;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub staged_import_replayed: bool,
    pub patches_applied: usize,
    pub patches_dropped: usize,
    pub journal_keys_removed: usize,
    pub scavenging_skipped: bool,
}

impl RecoveryReport {
    pub fn notice(&self) -> Option<String> {
        match (self.staged_import_replayed, self.patches_applied) {
            (false, 0) => None,
            (true, 0) => Some("Finished an import that was interrupted.".to_string()),
            (false, count) => Some(format!("Restored {} unsaved change(s).", count)),
            (true, count) => Some(format!(
                "Finished an interrupted import and restored {} unsaved change(s).",
                count
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub dropped: usize,
}

pub struct RecoveryPipeline {
    stores: StoreSet,
    clock: Arc<dyn Clock>,
    lease: LeaseLock,
    heartbeats: HeartbeatRegistry,
    journal: PatchJournal,
    session: SessionStore,
}

impl RecoveryPipeline {
    pub fn new(
        stores: StoreSet,
        clock: Arc<dyn Clock>,
        lease: LeaseLock,
        heartbeats: HeartbeatRegistry,
        journal: PatchJournal,
        session: SessionStore,
    ) -> Self {
        Self {
            stores,
            clock,
            lease,
            heartbeats,
            journal,
            session,
        }
    }

    pub fn run(&self) -> AppResult<(AppStateSnapshot, RecoveryReport)> {
        let mut report = RecoveryReport {
            staged_import_replayed: self.replay_staged_import()?,
            ..RecoveryReport::default()
        };

        let mut snapshot = read_app_state(self.stores.durable.as_ref())?;
        self.scavenge(&mut snapshot, &mut report)?;

        if let Err(error) = self.session.prune(&snapshot) {
            tracing::warn!(error = %error, "failed to prune session pointer");
        }

        if report.notice().is_some() {
            tracing::info!(
                staged_import_replayed = report.staged_import_replayed,
                patches_applied = report.patches_applied,
                patches_dropped = report.patches_dropped,
                "recovered unsaved work"
            );
        }
        Ok((snapshot, report))
    }

    fn replay_staged_import(&self) -> AppResult<bool> {
        let local = self.stores.local.as_ref();
        let record = match local.get_json::<ImportStagingRecord>(keys::IMPORT_STAGING) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(error) => {
                tracing::error!(error = %error, "discarding unreadable import staging record");
                local.remove(keys::IMPORT_STAGING)?;
                return Ok(false);
            }
        };

        tracing::info!(
            folders = record.app_state.folders.len(),
            "replaying interrupted import"
        );
        write_app_state(self.stores.durable.as_ref(), &record.app_state)?;
        write_settings(self.stores.durable.as_ref(), &record.settings)?;
        self.session.clear()?;
        local.remove(keys::IMPORT_STAGING)?;
        Ok(true)
    }

    fn scavenge(&self, snapshot: &mut AppStateSnapshot, report: &mut RecoveryReport) -> AppResult<()> {
        let context_id = self.journal.context_id().to_string();
        let Some(_guard) = self.lease.guard(&context_id) else {
            tracing::info!(context_id = %context_id, "lease busy; leaving orphaned journals for a later start");
            report.scavenging_skipped = true;
            return Ok(());
        };

        let live = self.heartbeats.live_contexts()?;
        let orphaned = self
            .journal
            .records()?
            .into_iter()
            .filter(|record| record.owner_id != context_id && !live.contains_key(&record.owner_id))
            .collect::<Vec<_>>();
        if orphaned.is_empty() {
            return Ok(());
        }

        let stats = apply_orphaned_patches(snapshot, &orphaned);
        report.patches_applied = stats.applied;
        report.patches_dropped = stats.dropped;

        if stats.applied > 0 {
            snapshot.last_saved_timestamp =
                next_saved_timestamp(snapshot.last_saved_timestamp, self.clock.now_ms());
            write_app_state(self.stores.durable.as_ref(), snapshot)?;
        }

        for record in &orphaned {
            match self.journal.remove_record(&record.key) {
                Ok(()) => report.journal_keys_removed += 1,
                Err(error) => {
                    tracing::warn!(key = %record.key, error = %error, "failed to remove recovered journal key");
                }
            }
        }
        Ok(())
    }
}

/// Applies the newest patch per item onto `snapshot`. Earlier patches for the
/// same item are ignored; patches whose target is gone are dropped.
pub fn apply_orphaned_patches(snapshot: &mut AppStateSnapshot, records: &[JournalRecord]) -> ReplayStats {
    let mut latest: HashMap<(ItemType, &str), &PatchEntry> = HashMap::new();
    for entry in records.iter().flat_map(|record| record.entries.iter()) {
        let slot = latest
            .entry((entry.item_type, entry.item_id.as_str()))
            .or_insert(entry);
        if entry.timestamp >= slot.timestamp {
            *slot = entry;
        }
    }

    let mut stats = ReplayStats::default();
    for entry in latest.into_values() {
        if apply_patch(snapshot, entry) {
            stats.applied += 1;
        } else {
            tracing::debug!(
                item_id = %entry.item_id,
                item_type = entry.item_type.as_str(),
                "dropping orphaned patch without a target"
            );
            stats.dropped += 1;
        }
    }
    stats
}

fn apply_patch(snapshot: &mut AppStateSnapshot, entry: &PatchEntry) -> bool {
    match (entry.item_type, &entry.kind) {
        (ItemType::Note, PatchKind::Content { data }) => {
            let Some(note) = snapshot.note_mut(&entry.item_id) else {
                return false;
            };
            if let Some(title) = &data.title {
                note.title = title.clone();
            }
            if let Some(content) = &data.content {
                note.content = content.clone();
            }
            note.updated_at = note.updated_at.max(entry.timestamp);
            true
        }
        (ItemType::Note, PatchKind::Rename { new_name }) => {
            let Some(note) = snapshot.note_mut(&entry.item_id) else {
                return false;
            };
            note.title = new_name.clone();
            note.updated_at = note.updated_at.max(entry.timestamp);
            true
        }
        (ItemType::Folder, PatchKind::Rename { new_name }) => {
            let Some(folder) = snapshot.folder_mut(&entry.item_id) else {
                return false;
            };
            folder.name = new_name.clone();
            true
        }
        (ItemType::Folder, PatchKind::Content { .. }) => false,
    }
}
