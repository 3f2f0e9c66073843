use async_trait::async_trait;
use cohort_core::CohortResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// External key-value store with pub/sub, used for replication and fan-out.
///
/// Implementations talk to whatever backs the deployment (Redis or similar).
/// The engine only needs these three operations.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> CohortResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CohortResult<()>;
    /// Publish `message` on `channel`. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, message: &str) -> CohortResult<usize>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

const CHANNEL_CAPACITY: usize = 256;

/// In-process [`StateStore`]. Expired keys read as absent.
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Listen on a pub/sub channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Keys that are currently live, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |t| t > now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> CohortResult<Option<String>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|t| t <= Instant::now()),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CohortResult<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> CohortResult<usize> {
        let sender = self.channels.lock().get(channel).cloned();
        Ok(sender
            .and_then(|tx| tx.send(message.to_string()).ok())
            .unwrap_or(0))
    }
}
