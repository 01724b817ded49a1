use chrono::{DateTime, Utc};

use crate::model::document::{DATA_VERSION, Document};
use crate::model::tag::display_text_for;
use crate::model::task::Taggable;

/// What `upgrade` changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: String,
    pub tags_touched: usize,
    pub entities_stamped: usize,
}

pub fn needs_migration(doc: &Document) -> bool {
    doc.version() != DATA_VERSION
}

pub fn backup_key(key: &str, now: DateTime<Utc>) -> String {
    format!("{}_backup_{}", key, now.timestamp_millis())
}

/// Backup keys for `key`, newest first.
pub fn backup_keys(keys: &[String], key: &str) -> Vec<String> {
    let prefix = format!("{}_backup_", key);
    let mut backups: Vec<(i64, &String)> = keys
        .iter()
        .filter_map(|k| {
            let stamp = k.strip_prefix(&prefix)?.parse::<i64>().ok()?;
            Some((stamp, k))
        })
        .collect();
    backups.sort_by(|a, b| b.0.cmp(&a.0));
    backups.into_iter().map(|(_, k)| k.clone()).collect()
}

/// Bring a pre-2.0 document up to the current shape in place.
///
/// Tags get `updated_at` (from `created_at`, else `now`) and `display_text`.
/// Tasks and goals carrying tags without `tag_metadata` get metadata stamped
/// with the entity's own `created_at`, falling back to the parent task's,
/// then `now`.
pub fn upgrade(doc: &mut Document, now: DateTime<Utc>) -> MigrationReport {
    let from_version = doc.version().to_string();
    let mut tags_touched = 0;
    for tag in &mut doc.tags {
        let mut touched = false;
        if tag.updated_at.is_none() {
            tag.updated_at = Some(tag.created_at.unwrap_or(now));
            touched = true;
        }
        if tag.display_text.is_empty() && !tag.name.is_empty() {
            tag.display_text = display_text_for(&tag.name);
            touched = true;
        }
        if touched {
            tags_touched += 1;
        }
    }

    let mut entities_stamped = 0;
    for task in &mut doc.tasks {
        let task_stamp = task.created_at.unwrap_or(now);
        if !task.tags.is_empty() && task.tag_metadata.is_empty() {
            task.reconcile_metadata(task_stamp);
            entities_stamped += 1;
        }
        for goal in &mut task.goals {
            if !goal.tags.is_empty() && goal.tag_metadata.is_empty() {
                goal.reconcile_metadata(goal.created_at.unwrap_or(task_stamp));
                entities_stamped += 1;
            }
        }
    }

    doc.version = Some(DATA_VERSION.to_string());
    MigrationReport {
        from_version,
        tags_touched,
        entities_stamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn legacy() -> Document {
        serde_json::from_str(
            r##"{
                "tags": [
                    {"id": "a", "name": "work", "created_at": "2024-01-01T00:00:00Z"},
                    {"id": "b", "name": "home", "display_text": "#home"}
                ],
                "tasks": [{
                    "id": "t1",
                    "tags": ["a"],
                    "created_at": "2024-02-01T00:00:00Z",
                    "goals": [{"id": "g1", "tags": ["b"]}]
                }]
            }"##,
        )
        .unwrap()
    }

    #[test]
    fn upgrade_fills_tag_fields() {
        let mut doc = legacy();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let report = upgrade(&mut doc, now);

        assert_eq!(report.from_version, "1.0.0");
        assert_eq!(report.tags_touched, 2);
        assert_eq!(doc.tags[0].display_text, "#work");
        assert_eq!(doc.tags[0].updated_at, doc.tags[0].created_at);
        assert_eq!(doc.tags[1].updated_at, Some(now));
        assert_eq!(doc.version(), DATA_VERSION);
    }

    #[test]
    fn goal_metadata_falls_back_to_task_created_at() {
        let mut doc = legacy();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let report = upgrade(&mut doc, now);

        assert_eq!(report.entities_stamped, 2);
        let task_created = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(doc.tasks[0].tag_metadata["a"].added_at, task_created);
        assert_eq!(doc.tasks[0].goals[0].tag_metadata["b"].added_at, task_created);
    }

    #[test]
    fn current_documents_need_nothing() {
        assert!(!needs_migration(&Document::default()));
        assert!(needs_migration(&legacy()));
    }

    #[test]
    fn backups_sorted_newest_first() {
        let keys: Vec<String> = [
            "taskpixel_data",
            "taskpixel_data_backup_900",
            "taskpixel_data_backup_1000",
            "taskpixel_data_backup_junk",
            "other_backup_5000",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            backup_keys(&keys, "taskpixel_data"),
            vec!["taskpixel_data_backup_1000", "taskpixel_data_backup_900"]
        );
    }

    #[test]
    fn backup_key_uses_millis() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            backup_key("taskpixel_data", now),
            "taskpixel_data_backup_1704067200000"
        );
    }
}
