/*
[INPUT]:  API key ids, wall clock, persisted high-water marks
[OUTPUT]: Strictly increasing per-key REST nonces
[POS]:    Auth layer - nonce authority shared by every REST caller
[UPDATE]: When changing nonce persistence or recovery offsets
*/

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{read_json_sync, write_json_atomic};
use crate::http::Result;

pub type NonceClock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Jump applied after the exchange rejects a nonce, in microseconds.
    pub safety_offset_us: u64,
    /// Values reserved ahead of the persisted mark, in microseconds.
    pub reserve_window_us: u64,
    /// High-water mark file. `None` keeps counters in memory only.
    pub state_path: Option<PathBuf>,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            safety_offset_us: 5_000_000,
            reserve_window_us: 10_000_000,
            state_path: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NonceFile {
    #[serde(default)]
    keys: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyCounter {
    last: u64,
    persisted: u64,
}

/// Issues nonces that strictly increase per API key, across restarts.
///
/// Each key has its own async mutex; the state file is guarded by a
/// separate lock so different keys only contend while writing.
pub struct NonceAuthority {
    config: NonceConfig,
    counters: StdMutex<HashMap<String, Arc<Mutex<KeyCounter>>>>,
    file: Mutex<NonceFile>,
    clock: NonceClock,
}

impl fmt::Debug for NonceAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceAuthority")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn wall_clock_us() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

impl NonceAuthority {
    /// Load persisted marks (if any) and use the wall clock.
    pub fn load(config: NonceConfig) -> Result<Self> {
        Self::load_with_clock(config, Arc::new(wall_clock_us))
    }

    pub fn load_with_clock(config: NonceConfig, clock: NonceClock) -> Result<Self> {
        let file = match &config.state_path {
            Some(path) => read_json_sync::<NonceFile>(path)?.unwrap_or_default(),
            None => NonceFile::default(),
        };

        let counters = file
            .keys
            .iter()
            .map(|(key, mark)| {
                let counter = KeyCounter {
                    last: *mark,
                    persisted: *mark,
                };
                (key.clone(), Arc::new(Mutex::new(counter)))
            })
            .collect::<HashMap<_, _>>();

        if !counters.is_empty() {
            info!(keys = counters.len(), "restored nonce high-water marks");
        }

        Ok(Self {
            config,
            counters: StdMutex::new(counters),
            file: Mutex::new(file),
            clock,
        })
    }

    /// In-memory authority, nothing persisted.
    pub fn in_memory() -> Self {
        Self {
            config: NonceConfig::default(),
            counters: StdMutex::new(HashMap::new()),
            file: Mutex::new(NonceFile::default()),
            clock: Arc::new(wall_clock_us),
        }
    }

    fn counter(&self, key_id: &str) -> Arc<Mutex<KeyCounter>> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(KeyCounter::default())))
            .clone()
    }

    /// Next nonce for `key_id`: wall-clock microseconds, or `last + 1` when
    /// the clock has not moved past the previous value.
    pub async fn issue(&self, key_id: &str) -> Result<u64> {
        let counter = self.counter(key_id);
        let mut counter = counter.lock().await;

        let now = (self.clock)();
        let next = now.max(counter.last.saturating_add(1));
        if now <= counter.last {
            debug!(key_id, now, next, "clock behind last nonce, bumping");
        }
        counter.last = next;

        if next >= counter.persisted {
            let mark = next.saturating_add(self.config.reserve_window_us);
            self.persist(key_id, mark).await?;
            counter.persisted = mark;
        }

        Ok(next)
    }

    /// Jump past a nonce the exchange rejected as stale.
    ///
    /// The new value is `max(now, last) + safety_offset` and is persisted
    /// before returning.
    pub async fn recover_from_error(&self, key_id: &str) -> Result<u64> {
        let counter = self.counter(key_id);
        let mut counter = counter.lock().await;

        let now = (self.clock)();
        let next = now
            .max(counter.last)
            .saturating_add(self.config.safety_offset_us);
        warn!(
            key_id,
            previous = counter.last,
            next,
            "nonce rejected by exchange, jumping ahead"
        );
        counter.last = next;

        let mark = next
            .saturating_add(self.config.reserve_window_us)
            .max(counter.persisted);
        self.persist(key_id, mark).await?;
        counter.persisted = mark;

        Ok(next)
    }

    pub async fn last_issued(&self, key_id: &str) -> Option<u64> {
        let counter = {
            let counters = self
                .counters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            counters.get(key_id).cloned()
        }?;
        let counter = counter.lock().await;
        (counter.last > 0).then_some(counter.last)
    }

    async fn persist(&self, key_id: &str, mark: u64) -> Result<()> {
        let Some(path) = &self.config.state_path else {
            return Ok(());
        };
        let mut file = self.file.lock().await;
        file.keys.insert(key_id.to_string(), mark);
        write_json_atomic(path, &*file).await?;
        debug!(key_id, mark, "persisted nonce high-water mark");
        Ok(())
    }
}
