use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

pub const CLOSE_ON_SPAM_KEY: &str = "closeOnSpam";

const WRITE_WINDOW: Duration = Duration::from_secs(60);
const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid json: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode settings: {0}")]
    Encode(serde_json::Error),
    #[error("write budget exhausted ({limit} writes per minute)")]
    RateLimited { limit: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsDocument {
    entries: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct StoreInner {
    document: SettingsDocument,
    recent_writes: VecDeque<Instant>,
}

impl StoreInner {
    fn admit_write(&mut self, limit: u32) -> bool {
        let now = Instant::now();
        while let Some(front) = self.recent_writes.front() {
            if now.duration_since(*front) >= WRITE_WINDOW {
                self.recent_writes.pop_front();
            } else {
                break;
            }
        }
        if self.recent_writes.len() >= limit as usize {
            return false;
        }
        self.recent_writes.push_back(now);
        true
    }
}

/// Persisted key/value settings with a change feed and a write-rate budget.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    max_writes_per_minute: u32,
    inner: Arc<Mutex<StoreInner>>,
    // Held across the whole of `set` so disk and change feed follow memory order.
    writer: Arc<tokio::sync::Mutex<()>>,
    changes: broadcast::Sender<SettingsChange>,
}

impl SettingsStore {
    /// Opens the store at `path`, or an in-memory store when `path` is `None`.
    /// A missing file starts empty; an unreadable one is logged and ignored.
    pub fn open(path: Option<&Path>, max_writes_per_minute: u32) -> Result<Self, SettingsError> {
        let document = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                load_document(path).unwrap_or_else(|err| {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable settings file");
                    SettingsDocument::default()
                })
            }
            None => SettingsDocument::default(),
        };

        Ok(Self::from_document(
            path.map(Path::to_path_buf),
            max_writes_per_minute,
            document,
        ))
    }

    pub fn in_memory(max_writes_per_minute: u32) -> Self {
        Self::from_document(None, max_writes_per_minute, SettingsDocument::default())
    }

    fn from_document(
        path: Option<PathBuf>,
        max_writes_per_minute: u32,
        document: SettingsDocument,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path,
            max_writes_per_minute,
            inner: Arc::new(Mutex::new(StoreInner {
                document,
                recent_writes: VecDeque::new(),
            })),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            changes,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self.inner.lock().unwrap().document.entries.get(key).cloned())
    }

    pub async fn get_all(&self) -> Result<BTreeMap<String, Value>, SettingsError> {
        Ok(self.inner.lock().unwrap().document.entries.clone())
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let _writer = self.writer.lock().await;
        let (old_value, encoded) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.admit_write(self.max_writes_per_minute) {
                return Err(SettingsError::RateLimited {
                    limit: self.max_writes_per_minute,
                });
            }
            let old_value = inner
                .document
                .entries
                .insert(key.to_string(), value.clone());
            let encoded = match &self.path {
                Some(_) => Some(
                    serde_json::to_string_pretty(&inner.document).map_err(SettingsError::Encode)?,
                ),
                None => None,
            };
            (old_value, encoded)
        };

        if let (Some(path), Some(data)) = (&self.path, encoded) {
            tokio::fs::write(path, data).await?;
        }

        if old_value.as_ref() != Some(&value) {
            let _ = self.changes.send(SettingsChange {
                key: key.to_string(),
                old_value,
                new_value: Some(value),
            });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }
}

fn load_document(path: &Path) -> Result<SettingsDocument, SettingsError> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).map_err(SettingsError::Decode),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SettingsDocument::default()),
        Err(err) => Err(err.into()),
    }
}

/// `closeOnSpam` is on unless explicitly stored as `false`.
pub fn close_on_spam_from(value: Option<&Value>) -> bool {
    !matches!(value, Some(Value::Bool(false)))
}

/// Delays settings writes so bursts of toggles cost one store write.
///
/// Each key has at most one pending write; scheduling a key again replaces it.
#[derive(Debug)]
pub struct Debouncer {
    store: SettingsStore,
    delay: Duration,
    pending: HashMap<String, JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(store: SettingsStore, delay: Duration) -> Self {
        Self {
            store,
            delay,
            pending: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, key: &str, value: Value) {
        if let Some(previous) = self.pending.remove(key) {
            previous.abort();
        }

        let store = self.store.clone();
        let delay = self.delay;
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = store.set(&owned_key, value).await {
                tracing::warn!(key = %owned_key, error = %err, "debounced settings write failed");
            }
        });
        self.pending.insert(key.to_string(), handle);
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn close_on_spam_defaults_on() {
        assert!(close_on_spam_from(None));
        assert!(close_on_spam_from(Some(&json!(true))));
        assert!(close_on_spam_from(Some(&json!("false"))));
        assert!(close_on_spam_from(Some(&json!(0))));
        assert!(!close_on_spam_from(Some(&json!(false))));
    }

    #[tokio::test]
    async fn set_publishes_change_only_when_value_differs() {
        let store = SettingsStore::in_memory(120);
        let mut changes = store.subscribe();

        store.set(CLOSE_ON_SPAM_KEY, json!(false)).await.unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.key, CLOSE_ON_SPAM_KEY);
        assert_eq!(change.old_value, None);
        assert_eq!(change.new_value, Some(json!(false)));

        store.set(CLOSE_ON_SPAM_KEY, json!(false)).await.unwrap();
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));

        store.set(CLOSE_ON_SPAM_KEY, json!(true)).await.unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.old_value, Some(json!(false)));
        assert_eq!(change.new_value, Some(json!(true)));
        assert_eq!(
            store.get(CLOSE_ON_SPAM_KEY).await.unwrap(),
            Some(json!(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_budget_is_a_sliding_window() {
        let store = SettingsStore::in_memory(2);
        store.set("a", json!(1)).await.unwrap();
        store.set("a", json!(2)).await.unwrap();
        assert!(matches!(
            store.set("a", json!(3)).await,
            Err(SettingsError::RateLimited { limit: 2 })
        ));
        assert_eq!(store.get("a").await.unwrap(), Some(json!(2)));

        tokio::time::advance(WRITE_WINDOW).await;
        store.set("a", json!(3)).await.unwrap();
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::open(Some(&path), 120).unwrap();
        assert_eq!(store.get(CLOSE_ON_SPAM_KEY).await.unwrap(), None);
        store.set(CLOSE_ON_SPAM_KEY, json!(false)).await.unwrap();

        let reopened = SettingsStore::open(Some(&path), 120).unwrap();
        assert_eq!(
            reopened.get(CLOSE_ON_SPAM_KEY).await.unwrap(),
            Some(json!(false))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_agree_on_disk_memory_and_feed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(Some(&path), 10_000).unwrap();

        for _ in 0..100 {
            let mut changes = store.subscribe();
            let off = {
                let store = store.clone();
                tokio::spawn(async move { store.set(CLOSE_ON_SPAM_KEY, json!(false)).await })
            };
            let on = {
                let store = store.clone();
                tokio::spawn(async move { store.set(CLOSE_ON_SPAM_KEY, json!(true)).await })
            };
            off.await.unwrap().unwrap();
            on.await.unwrap().unwrap();

            let in_memory = store.get(CLOSE_ON_SPAM_KEY).await.unwrap();
            let mut last_published = None;
            while let Ok(change) = changes.try_recv() {
                last_published = Some(change.new_value);
            }
            if let Some(published) = last_published {
                assert_eq!(published, in_memory);
            }

            let on_disk = SettingsStore::open(Some(&path), 1).unwrap();
            assert_eq!(on_disk.get(CLOSE_ON_SPAM_KEY).await.unwrap(), in_memory);
        }
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::open(Some(&path), 120).unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
        assert!(close_on_spam_from(store.get(CLOSE_ON_SPAM_KEY).await.unwrap().as_ref()));
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_keeps_only_the_last_value() {
        let store = SettingsStore::in_memory(120);
        let mut changes = store.subscribe();
        let mut debouncer = Debouncer::new(store.clone(), Duration::from_millis(1000));

        debouncer.schedule(CLOSE_ON_SPAM_KEY, json!(true));
        tokio::time::sleep(Duration::from_millis(400)).await;
        debouncer.schedule(CLOSE_ON_SPAM_KEY, json!(false));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(store.get(CLOSE_ON_SPAM_KEY).await.unwrap(), None);

        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.new_value, Some(json!(false)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(
            store.get(CLOSE_ON_SPAM_KEY).await.unwrap(),
            Some(json!(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_tracks_keys_independently() {
        let store = SettingsStore::in_memory(120);
        let mut debouncer = Debouncer::new(store.clone(), Duration::from_millis(100));
        debouncer.schedule("a", json!(1));
        debouncer.schedule("b", json!(2));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("b").await.unwrap(), Some(json!(2)));
    }
}
