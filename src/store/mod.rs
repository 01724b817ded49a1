pub mod migrate;
pub mod relations;

pub use relations::{EntityRef, LinkChange, LinkError};

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;

use crate::events::{Event, EventBus};
use crate::io::kv::KeyValueStore;
use crate::model::config::StoreConfig;
use crate::model::document::Document;
use crate::model::tag::Tag;
use crate::model::task::{Goal, Task, Taggable};
use crate::tags::integrity::{self, IntegrityReport};

/// Error type for document storage
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not write {key}: {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },
    #[error("could not read {key}: {source}")]
    Read {
        key: String,
        source: std::io::Error,
    },
    #[error("{key} could not be parsed and is left untouched; import a document to replace it")]
    Unreadable { key: String },
    #[error("could not serialize document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("goal not found: {goal_id} (task {task_id})")]
    GoalNotFound { task_id: String, goal_id: String },
    #[error("invalid import: {0}")]
    InvalidImport(String),
}

/// Where `load` got the document from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary key parsed cleanly
    Primary,
    /// The primary blob was corrupt; this backup key was used instead
    Backup(String),
    /// Nothing was stored; a fresh document was created
    Fresh,
    /// The primary blob did not parse and no backup did either. An empty
    /// document is served read-only so the blob is never overwritten.
    Corrupt,
}

/// Owner of the persisted document.
///
/// Everything lives in one JSON blob under a single key. Every mutation
/// rewrites the whole blob.
pub struct EntityStore {
    kv: Box<dyn KeyValueStore>,
    key: String,
    data: Document,
    /// The document as last written; `data` is reset to it when a save fails
    committed: Document,
    loaded: bool,
    read_only: bool,
    /// The exact blob this instance last wrote
    last_persisted: Option<String>,
    bus: EventBus,
}

impl EntityStore {
    pub fn new(kv: Box<dyn KeyValueStore>, config: &StoreConfig, bus: EventBus) -> Self {
        EntityStore {
            kv,
            key: config.key.clone(),
            data: Document::default(),
            committed: Document::default(),
            loaded: false,
            read_only: false,
            last_persisted: None,
            bus,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// True after a load found only an unparsable blob. Saves fail until a
    /// successful reload or import.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn last_persisted(&self) -> Option<&str> {
        self.last_persisted.as_deref()
    }

    /// Load (or reload) the document from storage.
    ///
    /// A corrupt blob falls back to the newest backup. With no usable backup
    /// the store comes up empty and read-only. Old versions are migrated and
    /// written back. A blob that cannot be read at all fails the load and is
    /// never overwritten. Emits `data:loaded` on success.
    pub fn load(&mut self) -> Result<LoadSource, StoreError> {
        let (mut doc, source, raw) = self.read_document()?;
        let mut dirty = matches!(source, LoadSource::Backup(_) | LoadSource::Fresh);

        if source != LoadSource::Corrupt {
            let assigned = assign_missing_ids(&mut doc, self);
            if assigned > 0 {
                tracing::warn!(count = assigned, "assigned ids to entities stored without one");
                dirty = true;
            }
        }

        if source != LoadSource::Corrupt && migrate::needs_migration(&doc) {
            let now = Utc::now();
            if let Some(raw) = &raw {
                let backup_key = migrate::backup_key(&self.key, now);
                self.kv
                    .set(&backup_key, raw)
                    .map_err(|e| StoreError::Io {
                        key: backup_key.clone(),
                        source: e,
                    })?;
                tracing::info!(backup = %backup_key, "wrote pre-migration backup");
            }
            let report = migrate::upgrade(&mut doc, now);
            tracing::info!(
                from = %report.from_version,
                tags = report.tags_touched,
                entities = report.entities_stamped,
                "migrated document"
            );
            dirty = true;
        }

        self.last_persisted = if dirty {
            Some(write_document(self.kv.as_mut(), &self.key, &doc)?)
        } else {
            raw
        };
        self.committed = doc.clone();
        self.data = doc;
        self.loaded = true;
        self.read_only = source == LoadSource::Corrupt;
        if self.read_only {
            tracing::error!(key = %self.key, "no readable document or backup; serving read-only");
        }

        let report = self.validate_integrity()?;
        if !report.is_valid {
            tracing::warn!(issues = report.issues.len(), "document has integrity issues");
        }

        tracing::info!(
            tasks = self.data.tasks.len(),
            tags = self.data.tags.len(),
            source = ?source,
            "document loaded"
        );
        self.bus.emit(Event::DataLoaded);
        Ok(source)
    }

    /// The parsed document, where it came from, and the primary blob as read.
    fn read_document(&self) -> Result<(Document, LoadSource, Option<String>), StoreError> {
        let Some(raw) = self.read_key(&self.key)? else {
            return Ok((Document::default(), LoadSource::Fresh, None));
        };
        match serde_json::from_str::<Document>(&raw) {
            Ok(doc) => return Ok((doc, LoadSource::Primary, Some(raw))),
            Err(e) => tracing::error!(key = %self.key, error = %e, "stored document is corrupt"),
        }

        for backup in migrate::backup_keys(&self.kv.keys(), &self.key) {
            let backup_raw = match self.read_key(&backup) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(backup = %backup, error = %e, "backup is unreadable");
                    continue;
                }
            };
            match serde_json::from_str::<Document>(&backup_raw) {
                Ok(doc) => {
                    tracing::warn!(backup = %backup, "restored document from backup");
                    return Ok((doc, LoadSource::Backup(backup), Some(raw)));
                }
                Err(e) => tracing::warn!(backup = %backup, error = %e, "backup is corrupt"),
            }
        }
        Ok((Document::default(), LoadSource::Corrupt, Some(raw)))
    }

    fn read_key(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.kv.get(key).map_err(|e| {
            tracing::error!(key = %key, error = %e, "read failed");
            StoreError::Read {
                key: key.to_string(),
                source: e,
            }
        })
    }

    /// Load on first use. Writes against an unloaded store would replace
    /// whatever is persisted with an empty document.
    pub fn ensure_loaded(&mut self) -> Result<(), StoreError> {
        if !self.loaded {
            self.load()?;
        }
        Ok(())
    }

    /// Persist the whole document. On failure the in-memory document goes
    /// back to the last persisted state, so a failed mutation leaves nothing
    /// behind for a later save to pick up.
    pub fn save(&mut self) -> Result<(), StoreError> {
        let written = if self.read_only {
            Err(StoreError::Unreadable {
                key: self.key.clone(),
            })
        } else {
            write_document(self.kv.as_mut(), &self.key, &self.data)
        };
        match written {
            Ok(blob) => {
                self.last_persisted = Some(blob);
                self.committed = self.data.clone();
                Ok(())
            }
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "save failed; discarding unsaved changes");
                self.data = self.committed.clone();
                Err(e)
            }
        }
    }

    /// The blob currently stored under the document key, if any.
    pub fn raw_blob(&self) -> Result<Option<String>, StoreError> {
        self.read_key(&self.key)
    }

    /// Parse just the `tags` array out of the stored blob, skipping records
    /// that do not deserialize. Used when a normal load fails.
    pub fn read_raw_tags(&self) -> Vec<Tag> {
        let raw = match self.raw_blob() {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => return Vec::new(),
        };
        let Ok(value) = serde_json::from_str::<Value>(&raw) else {
            return Vec::new();
        };
        match value.get("tags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn document(&self) -> &Document {
        &self.data
    }

    pub fn tags(&self) -> &[Tag] {
        &self.data.tags
    }

    pub fn tags_mut(&mut self) -> &mut Vec<Tag> {
        &mut self.data.tags
    }

    pub fn all_tasks(&self) -> &[Task] {
        &self.data.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut Vec<Task> {
        &mut self.data.tasks
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.data.task(task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.data.task_mut(task_id)
    }

    pub fn known_tag_ids(&self) -> HashSet<String> {
        self.data.tags.iter().map(|t| t.id.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Task / goal creation
    // -----------------------------------------------------------------------

    pub fn add_task(&mut self, title: &str) -> Result<Task, StoreError> {
        self.ensure_loaded()?;
        let task = Task::new(self.generate_id(), title.trim().to_string(), Utc::now());
        self.data.tasks.push(task.clone());
        self.save()?;
        Ok(task)
    }

    pub fn add_goal(&mut self, task_id: &str, title: &str) -> Result<Goal, StoreError> {
        self.ensure_loaded()?;
        let goal = Goal::new(self.generate_id(), title.trim().to_string(), Utc::now());
        let task = self
            .data
            .task_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        task.goals.push(goal.clone());
        self.save()?;
        Ok(goal)
    }

    // -----------------------------------------------------------------------
    // Whole-document maintenance
    // -----------------------------------------------------------------------

    /// Strip every tag id that has no tag record from all tasks and goals,
    /// and bring each entity's `tag_metadata` back in step with its `tags`.
    /// Returns the number of dangling references removed.
    pub fn cleanup_orphaned_tag_references(&mut self) -> Result<usize, StoreError> {
        let known = self.known_tag_ids();
        let now = Utc::now();
        let mut removed = 0;
        let mut changed = false;

        for task in &mut self.data.tasks {
            let task_stamp = task.created_at.unwrap_or(now);
            let dropped = task.retain_tags(|id| known.contains(id));
            if !dropped.is_empty() {
                tracing::warn!(task = %task.id, dropped = ?dropped, "removed orphaned tag references");
            }
            removed += dropped.len();
            changed |= task.reconcile_metadata(task_stamp);

            for goal in &mut task.goals {
                let dropped = goal.retain_tags(|id| known.contains(id));
                if !dropped.is_empty() {
                    tracing::warn!(goal = %goal.id, dropped = ?dropped, "removed orphaned tag references");
                }
                removed += dropped.len();
                changed |= goal.reconcile_metadata(goal.created_at.unwrap_or(task_stamp));
            }
        }

        if removed > 0 || changed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Store-level integrity pass: fills in derivable tag fields and reports
    /// what cannot be fixed here.
    pub fn validate_integrity(&mut self) -> Result<IntegrityReport, StoreError> {
        let fixed = integrity::repair_tag_records(&mut self.data.tags, Utc::now());
        let issues = integrity::check_document(&self.data);
        if !fixed.is_empty() {
            self.save()?;
        }
        Ok(IntegrityReport::new(issues, fixed))
    }

    /// Replace the document with an imported one. The JSON must be an
    /// object with a `tasks` array.
    pub fn import_data(&mut self, json: &str) -> Result<(), StoreError> {
        let value: Value = serde_json::from_str(json)?;
        if !value.get("tasks").is_some_and(Value::is_array) {
            return Err(StoreError::InvalidImport(
                "expected an object with a \"tasks\" array".into(),
            ));
        }
        let mut doc: Document = serde_json::from_value(value)?;
        if migrate::needs_migration(&doc) {
            migrate::upgrade(&mut doc, Utc::now());
        }

        self.last_persisted = Some(write_document(self.kv.as_mut(), &self.key, &doc)?);
        self.committed = doc.clone();
        self.data = doc;
        self.loaded = true;
        self.read_only = false;
        tracing::info!(
            tasks = self.data.tasks.len(),
            tags = self.data.tags.len(),
            "document imported"
        );
        self.bus.emit(Event::DataImported);
        Ok(())
    }

    /// The document as pretty-printed JSON.
    pub fn export_data(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.data)?)
    }
}

/// Serialize `doc` and store it under `key`, returning the blob written.
fn write_document(
    kv: &mut dyn KeyValueStore,
    key: &str,
    doc: &Document,
) -> Result<String, StoreError> {
    let blob = serde_json::to_string(doc)?;
    kv.set(key, &blob).map_err(|e| StoreError::Io {
        key: key.to_string(),
        source: e,
    })?;
    tracing::debug!(key = %key, bytes = blob.len(), "document saved");
    Ok(blob)
}

/// Give every task and goal stored without an id a fresh one. Returns how
/// many were assigned.
fn assign_missing_ids(doc: &mut Document, store: &EntityStore) -> usize {
    let mut assigned = 0;
    for task in &mut doc.tasks {
        if task.id.is_empty() {
            task.id = store.generate_id();
            assigned += 1;
        }
        for goal in task.goals.iter_mut().filter(|g| g.id.is_empty()) {
            goal.id = store.generate_id();
            assigned += 1;
        }
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use crate::io::kv::{FileStore, FlakyStore, MemoryStore};
    use tempfile::TempDir;
    use crate::model::document::DATA_VERSION;

    fn store_with(kv: &MemoryStore) -> EntityStore {
        EntityStore::new(
            Box::new(kv.clone()),
            &StoreConfig::default(),
            EventBus::new(),
        )
    }

    #[test]
    fn load_empty_creates_fresh_document() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        assert_eq!(store.load().unwrap(), LoadSource::Fresh);
        assert!(store.is_loaded());
        let raw = kv.get("taskpixel_data").unwrap().unwrap();
        assert!(raw.contains(DATA_VERSION));
    }

    #[test]
    fn load_emits_data_loaded() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        let sub = store.bus().subscribe(&[Topic::DataLoaded]);
        store.load().unwrap();
        assert_eq!(sub.drain(), vec![Event::DataLoaded]);
    }

    #[test]
    fn corrupt_blob_falls_back_to_newest_backup() {
        let mut kv = MemoryStore::new();
        kv.set("taskpixel_data", "{not json").unwrap();
        kv.set(
            "taskpixel_data_backup_100",
            r#"{"tasks":[{"id":"old"}],"version":"2.0.0"}"#,
        )
        .unwrap();
        kv.set(
            "taskpixel_data_backup_200",
            r#"{"tasks":[{"id":"new"}],"version":"2.0.0"}"#,
        )
        .unwrap();

        let mut store = store_with(&kv);
        let source = store.load().unwrap();
        assert_eq!(
            source,
            LoadSource::Backup("taskpixel_data_backup_200".into())
        );
        assert_eq!(store.all_tasks()[0].id, "new");
        // the restored document is written back under the primary key
        assert!(
            kv.get("taskpixel_data")
                .unwrap()
                .unwrap()
                .contains("\"new\"")
        );
    }

    #[test]
    fn corrupt_blob_without_backup_is_served_read_only() {
        let mut kv = MemoryStore::new();
        kv.set("taskpixel_data", "[]").unwrap();
        let mut store = store_with(&kv);
        assert_eq!(store.load().unwrap(), LoadSource::Corrupt);
        assert!(store.all_tasks().is_empty());
        assert!(store.is_read_only());

        assert!(matches!(
            store.add_task("x"),
            Err(StoreError::Unreadable { .. })
        ));
        assert!(store.all_tasks().is_empty());
        assert_eq!(kv.get("taskpixel_data").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn import_recovers_a_read_only_store() {
        let mut kv = MemoryStore::new();
        kv.set("taskpixel_data", "{broken").unwrap();
        let mut store = store_with(&kv);
        store.load().unwrap();
        store
            .import_data(r#"{"tasks":[{"id":"x"}],"version":"2.0.0"}"#)
            .unwrap();
        assert!(!store.is_read_only());
        store.add_task("after").unwrap();
        assert_eq!(store.all_tasks().len(), 2);
    }

    #[test]
    fn null_and_missing_fields_keep_every_task() {
        let mut kv = MemoryStore::new();
        kv.set(
            "taskpixel_data",
            r#"{"version":"2.0.0",
                "tags":[{"id":"a","name":"a","description":null}],
                "tasks":[{"id":"t1","title":null},
                         {"id":"t2","title":"keep me"},
                         {"title":"no id","goals":[{"title":"no id either"}]}]}"#,
        )
        .unwrap();
        let mut store = store_with(&kv);
        assert_eq!(store.load().unwrap(), LoadSource::Primary);
        assert_eq!(store.all_tasks().len(), 3);
        let unnamed = &store.all_tasks()[2];
        assert!(!unnamed.id.is_empty());
        assert!(!unnamed.goals[0].id.is_empty());

        store.add_task("new").unwrap();
        let raw = kv.get("taskpixel_data").unwrap().unwrap();
        assert!(raw.contains("\"t1\""));
        assert!(raw.contains("keep me"));
        assert!(raw.contains("no id either"));
    }

    #[test]
    fn unreadable_file_fails_load_and_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let kv = FileStore::open(tmp.path()).unwrap();
        let path = kv.path_for("taskpixel_data");
        let bytes = b"{\"tasks\":[{\"id\":\"t1\",\"title\":\"caf\xE9\"}]}".to_vec();
        std::fs::write(&path, &bytes).unwrap();

        let mut store = EntityStore::new(Box::new(kv), &StoreConfig::default(), EventBus::new());
        assert!(matches!(store.load(), Err(StoreError::Read { .. })));
        assert!(!store.is_loaded());
        assert!(store.add_task("x").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn failed_save_discards_the_mutation() {
        let kv = FlakyStore::default();
        let mut store = EntityStore::new(
            Box::new(kv.clone()),
            &StoreConfig::default(),
            EventBus::new(),
        );
        store.load().unwrap();
        let task = store.add_task("kept").unwrap();

        kv.set_failing(true);
        assert!(matches!(store.add_task("lost"), Err(StoreError::Io { .. })));
        assert!(store.add_goal(&task.id, "lost goal").is_err());
        assert_eq!(store.all_tasks().len(), 1);
        assert!(store.all_tasks()[0].goals.is_empty());

        kv.set_failing(false);
        store.add_task("later").unwrap();
        let raw = kv.get("taskpixel_data").unwrap().unwrap();
        assert!(!raw.contains("lost"));
        assert!(raw.contains("later"));
    }

    #[test]
    fn legacy_document_is_migrated_with_backup() {
        let mut kv = MemoryStore::new();
        kv.set(
            "taskpixel_data",
            r#"{"tasks":[{"id":"t1","tags":["a"],"created_at":"2024-01-01T00:00:00Z"}],
                "tags":[{"id":"a","name":"work","created_at":"2024-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        let mut store = store_with(&kv);
        store.load().unwrap();

        assert_eq!(store.document().version(), DATA_VERSION);
        assert_eq!(store.tags()[0].display_text, "#work");
        assert!(store.tags()[0].updated_at.is_some());
        assert!(store.all_tasks()[0].tag_metadata.contains_key("a"));
        assert!(
            kv.keys()
                .iter()
                .any(|k| k.starts_with("taskpixel_data_backup_"))
        );
    }

    #[test]
    fn add_task_and_goal_persist() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        store.load().unwrap();
        let task = store.add_task("  Write report ").unwrap();
        assert_eq!(task.title, "Write report");
        let goal = store.add_goal(&task.id, "Outline").unwrap();

        let mut reread = store_with(&kv);
        reread.load().unwrap();
        let t = reread.task(&task.id).unwrap();
        assert_eq!(t.goals[0].id, goal.id);
    }

    #[test]
    fn add_goal_to_missing_task_fails() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        store.load().unwrap();
        assert!(matches!(
            store.add_goal("nope", "x"),
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[test]
    fn cleanup_removes_dangling_ids_everywhere() {
        let mut kv = MemoryStore::new();
        kv.set(
            "taskpixel_data",
            r##"{"version":"2.0.0",
                "tags":[{"id":"a","name":"a","display_text":"#a"}],
                "tasks":[{"id":"t1","tags":["a","ghost"],
                          "tag_metadata":{"a":{"added_at":"2024-01-01T00:00:00Z"},
                                          "ghost":{"added_at":"2024-01-01T00:00:00Z"},
                                          "stray":{"added_at":"2024-01-01T00:00:00Z"}},
                          "goals":[{"id":"g1","tags":["ghost"]}]}]}"##,
        )
        .unwrap();
        let mut store = store_with(&kv);
        store.load().unwrap();

        assert_eq!(store.cleanup_orphaned_tag_references().unwrap(), 2);
        let task = store.task("t1").unwrap();
        assert_eq!(task.tags, vec!["a"]);
        assert_eq!(task.tag_metadata.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(task.goals[0].tags.is_empty());
        assert_eq!(store.cleanup_orphaned_tag_references().unwrap(), 0);
    }

    #[test]
    fn import_requires_tasks_array() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        store.load().unwrap();
        assert!(matches!(
            store.import_data(r#"{"tags":[]}"#),
            Err(StoreError::InvalidImport(_))
        ));
        assert!(matches!(
            store.import_data("nope"),
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn import_replaces_document_and_emits() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        store.load().unwrap();
        store.add_task("before").unwrap();
        let sub = store.bus().subscribe(&[Topic::DataImported]);

        store
            .import_data(r#"{"tasks":[{"id":"x","title":"imported"}],"version":"2.0.0"}"#)
            .unwrap();
        assert_eq!(store.all_tasks().len(), 1);
        assert_eq!(store.all_tasks()[0].title, "imported");
        assert_eq!(sub.drain(), vec![Event::DataImported]);
    }

    #[test]
    fn export_is_pretty_json_of_the_document() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        store.load().unwrap();
        store.add_task("x").unwrap();
        let out = store.export_data().unwrap();
        assert!(out.contains("\n  \"tasks\""));
        let back: Document = serde_json::from_str(&out).unwrap();
        assert_eq!(back.tasks.len(), 1);
    }

    #[test]
    fn save_records_last_persisted() {
        let kv = MemoryStore::new();
        let mut store = store_with(&kv);
        store.load().unwrap();
        store.add_task("x").unwrap();
        assert_eq!(
            store.last_persisted(),
            kv.get("taskpixel_data").unwrap().as_deref()
        );
    }

    #[test]
    fn read_raw_tags_skips_bad_records() {
        let mut kv = MemoryStore::new();
        kv.set(
            "taskpixel_data",
            r#"{"tasks":"broken","tags":[{"id":"a","name":"a"},42]}"#,
        )
        .unwrap();
        let store = store_with(&kv);
        let tags = store.read_raw_tags();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id, "a");
    }
}
