use crate::clock::Clock;
use crate::db::{keys, KvStore, KvStoreExt};
use crate::errors::AppResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct HeartbeatRegistry {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    context_id: String,
    stale_after_ms: i64,
}

impl HeartbeatRegistry {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        context_id: impl Into<String>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            context_id: context_id.into(),
            stale_after_ms: i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn beat(&self) -> AppResult<()> {
        self.store
            .set_json(&heartbeat_key(&self.context_id), &self.clock.now_ms())
    }

    pub fn remove(&self) -> AppResult<()> {
        self.store.remove(&heartbeat_key(&self.context_id))
    }

    pub fn live_contexts(&self) -> AppResult<HashMap<String, i64>> {
        let now = self.clock.now_ms();
        let mut live = HashMap::new();
        for key in self.store.keys_with_prefix(keys::HEARTBEAT_PREFIX)? {
            let Some(context_id) = key.strip_prefix(keys::HEARTBEAT_PREFIX) else {
                continue;
            };
            let last_seen = match self.store.get_json::<i64>(&key) {
                Ok(Some(last_seen)) => last_seen,
                Ok(None) => continue,
                Err(error) => {
                    tracing::debug!(key = %key, error = %error, "ignoring unreadable heartbeat");
                    continue;
                }
            };
            if now.saturating_sub(last_seen) <= self.stale_after_ms {
                live.insert(context_id.to_string(), last_seen);
            }
        }
        Ok(live)
    }

    pub fn is_alive(&self, context_id: &str) -> AppResult<bool> {
        if context_id == self.context_id {
            return Ok(true);
        }
        Ok(self.live_contexts()?.contains_key(context_id))
    }

    pub fn spawn(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(error) = registry.beat() {
                    tracing::warn!(context_id = %registry.context_id, error = %error, "heartbeat write failed");
                }
            }
        })
    }
}

fn heartbeat_key(context_id: &str) -> String {
    format!("{}{}", keys::HEARTBEAT_PREFIX, context_id)
}
