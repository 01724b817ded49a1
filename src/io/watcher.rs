use std::path::Path;
use std::sync::mpsc;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::io::kv::FileStore;

/// A key in the data directory was rewritten on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
}

/// Watches a `FileStore` directory and turns file events into
/// storage-changed notifications.
pub struct StoreWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<StorageChange>,
}

impl StoreWatcher {
    /// Start watching the store's directory.
    /// Returns a `StoreWatcher` whose `poll()` method should be called each tick.
    pub fn start(store: &FileStore) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel();
        let keys = store.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let event = match result {
                    Ok(e) => e,
                    Err(_) => return,
                };

                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => {}
                    _ => return,
                }

                for path in &event.paths {
                    // temp files from atomic_write have no .json extension
                    if let Some(key) = keys.key_for(path) {
                        let _ = tx.send(StorageChange { key });
                    }
                }
            },
            Config::default(),
        )?;

        watcher.watch(store.dir(), RecursiveMode::NonRecursive)?;
        Ok(StoreWatcher {
            _watcher: watcher,
            rx,
        })
    }

    /// Non-blocking poll for pending changes, collapsed so each key appears
    /// once in first-seen order.
    pub fn poll(&self) -> Vec<StorageChange> {
        let mut changes: Vec<StorageChange> = Vec::new();
        while let Ok(change) = self.rx.try_recv() {
            if !changes.contains(&change) {
                changes.push(change);
            }
        }
        changes
    }

    /// Whether `path` is a file this watcher would report.
    pub fn is_store_file(store: &FileStore, path: &Path) -> bool {
        store.key_for(path).is_some()
    }
}
