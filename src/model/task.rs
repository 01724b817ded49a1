use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::lenient;

/// Provenance for one attached tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStamp {
    pub added_at: DateTime<Utc>,
}

/// A task. Only the tag fields are interpreted; everything else the app
/// stores on a task rides along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub title: String,
    /// Attached tag ids, no duplicates
    #[serde(default, deserialize_with = "lenient::id_list")]
    pub tags: Vec<String>,
    /// Mirror of `tags`: one entry per attached id
    #[serde(default, deserialize_with = "lenient::map")]
    pub tag_metadata: IndexMap<String, TagStamp>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub goals: Vec<Goal>,
    #[serde(
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A goal nested in a task, tagged independently of its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient::id_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient::map")]
    pub tag_metadata: IndexMap<String, TagStamp>,
    #[serde(
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(id: String, title: String, now: DateTime<Utc>) -> Self {
        Task {
            id,
            title,
            tags: Vec::new(),
            tag_metadata: IndexMap::new(),
            goals: Vec::new(),
            created_at: Some(now),
            extra: Map::new(),
        }
    }

    pub fn goal(&self, goal_id: &str) -> Option<&Goal> {
        self.goals.iter().find(|g| g.id == goal_id)
    }

    pub fn goal_mut(&mut self, goal_id: &str) -> Option<&mut Goal> {
        self.goals.iter_mut().find(|g| g.id == goal_id)
    }
}

impl Goal {
    pub fn new(id: String, title: String, now: DateTime<Utc>) -> Self {
        Goal {
            id,
            title,
            tags: Vec::new(),
            tag_metadata: IndexMap::new(),
            created_at: Some(now),
            extra: Map::new(),
        }
    }
}

/// An entity carrying a tag-id list with its lockstep `tag_metadata`.
///
/// All list edits go through `attach`/`detach` so the two fields cannot
/// drift apart.
pub trait Taggable {
    fn tag_ids(&self) -> &[String];
    fn tag_metadata(&self) -> &IndexMap<String, TagStamp>;
    fn tag_fields_mut(&mut self) -> (&mut Vec<String>, &mut IndexMap<String, TagStamp>);

    fn has_tag(&self, tag_id: &str) -> bool {
        self.tag_ids().iter().any(|id| id == tag_id)
    }

    /// Attach `tag_id` unless already present. Returns true if added.
    fn attach(&mut self, tag_id: &str, now: DateTime<Utc>) -> bool {
        if self.has_tag(tag_id) {
            return false;
        }
        let (tags, metadata) = self.tag_fields_mut();
        tags.push(tag_id.to_string());
        metadata
            .entry(tag_id.to_string())
            .or_insert(TagStamp { added_at: now });
        true
    }

    /// Detach `tag_id` and its metadata. Returns true if it was attached.
    fn detach(&mut self, tag_id: &str) -> bool {
        let (tags, metadata) = self.tag_fields_mut();
        let before = tags.len();
        tags.retain(|id| id != tag_id);
        metadata.shift_remove(tag_id);
        tags.len() != before
    }

    /// Drop every attached id for which `keep` returns false. Returns the
    /// dropped ids in list order.
    fn retain_tags(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String>
    where
        Self: Sized,
    {
        let (tags, metadata) = self.tag_fields_mut();
        let mut dropped = Vec::new();
        tags.retain(|id| {
            if keep(id.as_str()) {
                true
            } else {
                dropped.push(id.clone());
                false
            }
        });
        for id in &dropped {
            metadata.shift_remove(id);
        }
        dropped
    }

    /// Bring `tag_metadata` back in step with `tags`: drop stray keys,
    /// stamp missing ones with `stamp`. Also removes duplicate ids.
    /// Returns true if anything changed.
    fn reconcile_metadata(&mut self, stamp: DateTime<Utc>) -> bool {
        let (tags, metadata) = self.tag_fields_mut();
        let mut changed = false;

        let mut seen = std::collections::HashSet::new();
        let before = tags.len();
        tags.retain(|id| seen.insert(id.clone()));
        changed |= tags.len() != before;

        let before = metadata.len();
        metadata.retain(|id, _| seen.contains(id));
        changed |= metadata.len() != before;

        for id in tags.iter() {
            if !metadata.contains_key(id) {
                metadata.insert(id.clone(), TagStamp { added_at: stamp });
                changed = true;
            }
        }
        changed
    }
}

impl Taggable for Task {
    fn tag_ids(&self) -> &[String] {
        &self.tags
    }

    fn tag_metadata(&self) -> &IndexMap<String, TagStamp> {
        &self.tag_metadata
    }

    fn tag_fields_mut(&mut self) -> (&mut Vec<String>, &mut IndexMap<String, TagStamp>) {
        (&mut self.tags, &mut self.tag_metadata)
    }
}

impl Taggable for Goal {
    fn tag_ids(&self) -> &[String] {
        &self.tags
    }

    fn tag_metadata(&self) -> &IndexMap<String, TagStamp> {
        &self.tag_metadata
    }

    fn tag_fields_mut(&mut self) -> (&mut Vec<String>, &mut IndexMap<String, TagStamp>) {
        (&mut self.tags, &mut self.tag_metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("t1".into(), "Write report".into(), Utc::now())
    }

    #[test]
    fn attach_is_idempotent() {
        let mut t = task();
        assert!(t.attach("a", Utc::now()));
        assert!(!t.attach("a", Utc::now()));
        assert_eq!(t.tags, vec!["a"]);
        assert_eq!(t.tag_metadata.len(), 1);
    }

    #[test]
    fn attach_keeps_original_stamp() {
        let mut t = task();
        let first = Utc::now();
        t.tag_metadata.insert("a".into(), TagStamp { added_at: first });
        t.attach("a", first + chrono::Duration::seconds(5));
        assert_eq!(t.tag_metadata["a"].added_at, first);
    }

    #[test]
    fn detach_removes_metadata() {
        let mut t = task();
        t.attach("a", Utc::now());
        t.attach("b", Utc::now());
        assert!(t.detach("a"));
        assert!(!t.detach("a"));
        assert_eq!(t.tags, vec!["b"]);
        assert!(!t.tag_metadata.contains_key("a"));
    }

    #[test]
    fn retain_tags_reports_dropped() {
        let mut g = Goal::new("g1".into(), "Draft".into(), Utc::now());
        g.attach("a", Utc::now());
        g.attach("b", Utc::now());
        g.attach("c", Utc::now());
        let dropped = g.retain_tags(|id| id != "b");
        assert_eq!(dropped, vec!["b"]);
        assert_eq!(g.tags, vec!["a", "c"]);
        assert_eq!(g.tag_metadata.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn reconcile_metadata_fixes_both_directions() {
        let mut t = task();
        let now = Utc::now();
        t.tags = vec!["a".into(), "b".into(), "a".into()];
        t.tag_metadata.insert("z".into(), TagStamp { added_at: now });
        t.tag_metadata.insert("a".into(), TagStamp { added_at: now });

        assert!(t.reconcile_metadata(now));
        assert_eq!(t.tags, vec!["a", "b"]);
        let keys: Vec<_> = t.tag_metadata.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert!(!t.reconcile_metadata(now));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{"id":"t1","title":"x","priority":"high","goals":[{"id":"g1","substeps":[1,2]}]}"#;
        let t: Task = serde_json::from_str(json).unwrap();
        assert_eq!(t.extra["priority"], "high");
        assert_eq!(t.goals[0].extra["substeps"], serde_json::json!([1, 2]));
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["priority"], "high");
        assert_eq!(back["goals"][0]["substeps"], serde_json::json!([1, 2]));
    }
}
