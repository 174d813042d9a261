use crate::clock::{next_saved_timestamp, Clock};
use crate::db::{keys, read_app_state, write_app_state, write_settings, KvStoreExt, StoreSet};
use crate::errors::{AppError, AppResult};
use crate::lease::LeaseLock;
use crate::models::ImportStagingRecord;
use crate::sanitize::{sanitize_import, SanitizeReport};
use crate::session::SessionStore;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub folders: usize,
    pub notes: usize,
    pub trashed: usize,
    pub last_saved_timestamp: i64,
    pub report: SanitizeReport,
}

pub struct ImportTransaction {
    stores: StoreSet,
    clock: Arc<dyn Clock>,
    lease: LeaseLock,
    session: SessionStore,
    context_id: String,
}

impl ImportTransaction {
    pub fn new(
        stores: StoreSet,
        clock: Arc<dyn Clock>,
        lease: LeaseLock,
        session: SessionStore,
        context_id: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            clock,
            lease,
            session,
            context_id: context_id.into(),
        }
    }

    pub fn run(&self, raw: &str) -> AppResult<ImportSummary> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|error| AppError::Validation(format!("import payload is not JSON: {}", error)))?;
        let now = self.clock.now_ms();
        let mut sanitized = sanitize_import(&value, now)?;

        let Some(_guard) = self.lease.guard(&self.context_id) else {
            return Err(AppError::Busy(
                "another window is importing; try again shortly".to_string(),
            ));
        };

        let durable = self.stores.durable.as_ref();
        let local = self.stores.local.as_ref();

        let previous = match read_app_state(durable) {
            Ok(snapshot) => snapshot.last_saved_timestamp,
            Err(error) => {
                tracing::warn!(error = %error, "current app state unreadable; import replaces it");
                0
            }
        };
        sanitized.snapshot.last_saved_timestamp = next_saved_timestamp(
            previous.max(sanitized.snapshot.last_saved_timestamp),
            now,
        );

        let record = ImportStagingRecord {
            app_state: sanitized.snapshot,
            settings: sanitized.settings,
        };
        if let Err(error) = local.set_json(keys::IMPORT_STAGING, &record) {
            self.discard_staging();
            return Err(error);
        }

        // The snapshot write is a single-key replace, so a failure leaves the
        // previous graph intact and the staging record can go.
        if let Err(error) = write_app_state(durable, &record.app_state) {
            tracing::warn!(error = %error, "import aborted before the authoritative write");
            self.discard_staging();
            return Err(error);
        }

        // Past this point the staging record stays on failure so the next
        // start rolls the import forward instead of leaving a mix.
        write_settings(durable, &record.settings).inspect_err(|error| {
            tracing::error!(error = %error, "import interrupted after the authoritative write");
        })?;
        self.session.clear()?;
        local.remove(keys::IMPORT_STAGING)?;

        let summary = ImportSummary {
            folders: record.app_state.folders.len(),
            notes: record.app_state.note_count(),
            trashed: record.app_state.trash.len(),
            last_saved_timestamp: record.app_state.last_saved_timestamp,
            report: sanitized.report,
        };
        tracing::info!(
            context_id = %self.context_id,
            folders = summary.folders,
            notes = summary.notes,
            trashed = summary.trashed,
            "import committed"
        );
        Ok(summary)
    }

    fn discard_staging(&self) {
        if let Err(error) = self.stores.local.remove(keys::IMPORT_STAGING) {
            tracing::warn!(error = %error, "failed to discard import staging record");
        }
    }
}
