pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod heartbeat;
pub mod journal;
pub mod lease;
pub mod models;
pub mod recovery;
pub mod sanitize;
pub mod save;
pub mod session;
pub mod state;
pub mod transfer;

pub use crate::config::CoreConfig;
pub use crate::context::NotesCore;
pub use crate::db::{KvStore, MemoryStore, StoreSet};
pub use crate::errors::{AppError, AppResult};
pub use crate::save::{SaveOutcome, SaveState};
pub use crate::state::StateEvent;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "notes.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

pub fn open_context(data_dir: &Path) -> AppResult<(NotesCore, Option<String>)> {
    let core = NotesCore::open(data_dir)?;
    let notice = core.load_data()?;
    core.start_heartbeat()?;
    Ok((core, notice))
}
