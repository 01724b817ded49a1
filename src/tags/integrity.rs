use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::document::Document;
use crate::model::tag::{Tag, display_text_for};
use crate::model::task::Taggable;
use crate::tags::usage::count_usage;

/// Structured result of an integrity pass, suitable for --json output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    /// Problems still present after the pass
    pub issues: Vec<IntegrityIssue>,
    /// Problems the pass repaired
    pub fixed_issues: Vec<IntegrityFix>,
}

impl IntegrityReport {
    pub fn new(issues: Vec<IntegrityIssue>, fixed_issues: Vec<IntegrityFix>) -> Self {
        IntegrityReport {
            is_valid: issues.is_empty(),
            issues,
            fixed_issues,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum IntegrityIssue {
    /// Two or more tags share a name ignoring case
    #[serde(rename = "duplicate_name")]
    DuplicateName { name: String, tag_ids: Vec<String> },
    /// Tag record without an id or a name
    #[serde(rename = "incomplete_tag")]
    IncompleteTag { index: usize, id: String },
    /// Cached usage count disagrees with a scan
    #[serde(rename = "stale_usage_count")]
    StaleUsageCount {
        tag_id: String,
        recorded: u32,
        actual: u32,
    },
    /// An entity references a tag id with no record
    #[serde(rename = "dangling_reference")]
    DanglingReference {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        goal_id: Option<String>,
        tag_id: String,
    },
    /// `tag_metadata` keys differ from the `tags` list
    #[serde(rename = "metadata_mismatch")]
    MetadataMismatch {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        goal_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum IntegrityFix {
    #[serde(rename = "display_text_filled")]
    DisplayTextFilled { tag_id: String },
    #[serde(rename = "created_at_filled")]
    CreatedAtFilled { tag_id: String },
    #[serde(rename = "updated_at_filled")]
    UpdatedAtFilled { tag_id: String },
    #[serde(rename = "usage_count_corrected")]
    UsageCountCorrected { tag_id: String, from: u32, to: u32 },
    #[serde(rename = "orphans_removed")]
    OrphansRemoved { count: usize },
}

/// Fill in tag fields that can be derived: `display_text` from the name,
/// `created_at`/`updated_at` from each other or `now`.
pub fn repair_tag_records(tags: &mut [Tag], now: DateTime<Utc>) -> Vec<IntegrityFix> {
    let mut fixes = Vec::new();
    for tag in tags.iter_mut() {
        if tag.id.is_empty() || tag.name.is_empty() {
            continue;
        }
        let expected = display_text_for(&tag.name);
        if tag.display_text != expected {
            tag.display_text = expected;
            fixes.push(IntegrityFix::DisplayTextFilled {
                tag_id: tag.id.clone(),
            });
        }
        if tag.created_at.is_none() {
            tag.created_at = Some(tag.updated_at.unwrap_or(now));
            fixes.push(IntegrityFix::CreatedAtFilled {
                tag_id: tag.id.clone(),
            });
        }
        if tag.updated_at.is_none() {
            tag.updated_at = tag.created_at;
            fixes.push(IntegrityFix::UpdatedAtFilled {
                tag_id: tag.id.clone(),
            });
        }
    }
    fixes
}

/// Report every integrity problem in the document. Read-only.
///
/// Checks performed:
/// 1. Tag records have an id and a name
/// 2. No two tag names are equal ignoring case
/// 3. Cached usage counts match a scan
/// 4. Every referenced tag id has a record
/// 5. `tag_metadata` keys mirror each entity's `tags`
pub fn check_document(doc: &Document) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    for (index, tag) in doc.tags.iter().enumerate() {
        if tag.id.is_empty() || tag.name.is_empty() {
            issues.push(IntegrityIssue::IncompleteTag {
                index,
                id: tag.id.clone(),
            });
        }
    }

    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for tag in doc.tags.iter().filter(|t| !t.name.is_empty()) {
        by_name
            .entry(tag.name.to_lowercase())
            .or_default()
            .push(tag.id.clone());
    }
    for (name, tag_ids) in by_name {
        if tag_ids.len() > 1 {
            issues.push(IntegrityIssue::DuplicateName { name, tag_ids });
        }
    }

    let counts = count_usage(doc);
    for tag in doc.tags.iter().filter(|t| !t.id.is_empty()) {
        let actual = counts.get(&tag.id).copied().unwrap_or(0);
        if tag.usage_count != actual {
            issues.push(IntegrityIssue::StaleUsageCount {
                tag_id: tag.id.clone(),
                recorded: tag.usage_count,
                actual,
            });
        }
    }

    let known: HashSet<&str> = doc.tags.iter().map(|t| t.id.as_str()).collect();
    for task in &doc.tasks {
        check_entity(task, &task.id, None, &known, &mut issues);
        for goal in &task.goals {
            check_entity(goal, &task.id, Some(goal.id.as_str()), &known, &mut issues);
        }
    }

    issues
}

fn check_entity(
    entity: &dyn Taggable,
    task_id: &str,
    goal_id: Option<&str>,
    known: &HashSet<&str>,
    issues: &mut Vec<IntegrityIssue>,
) {
    for tag_id in entity.tag_ids() {
        if !known.contains(tag_id.as_str()) {
            issues.push(IntegrityIssue::DanglingReference {
                task_id: task_id.to_string(),
                goal_id: goal_id.map(str::to_string),
                tag_id: tag_id.clone(),
            });
        }
    }

    let listed: HashSet<&str> = entity.tag_ids().iter().map(String::as_str).collect();
    let stamped: HashSet<&str> = entity.tag_metadata().keys().map(String::as_str).collect();
    if listed != stamped || listed.len() != entity.tag_ids().len() {
        issues.push(IntegrityIssue::MetadataMismatch {
            task_id: task_id.to_string(),
            goal_id: goal_id.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn doc(json: &str) -> Document {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn clean_document_has_no_issues() {
        let d = doc(
            r##"{"tags":[{"id":"a","name":"x","display_text":"#x","usage_count":1}],
                "tasks":[{"id":"t1","tags":["a"],
                          "tag_metadata":{"a":{"added_at":"2024-01-01T00:00:00Z"}}}]}"##,
        );
        assert_eq!(check_document(&d), vec![]);
    }

    #[test]
    fn reports_each_kind_of_issue() {
        let d = doc(
            r#"{"tags":[{"id":"a","name":"Work","usage_count":5},
                        {"id":"b","name":"work"},
                        {"id":"","name":"nameless-id"}],
                "tasks":[{"id":"t1","tags":["a","ghost"],
                          "tag_metadata":{"a":{"added_at":"2024-01-01T00:00:00Z"}},
                          "goals":[{"id":"g1","tags":["b"]}]}]}"#,
        );
        let issues = check_document(&d);
        assert!(issues.contains(&IntegrityIssue::IncompleteTag { index: 2, id: String::new() }));
        assert!(issues.contains(&IntegrityIssue::DuplicateName {
            name: "work".into(),
            tag_ids: vec!["a".into(), "b".into()],
        }));
        assert!(issues.contains(&IntegrityIssue::StaleUsageCount {
            tag_id: "a".into(),
            recorded: 5,
            actual: 1,
        }));
        assert!(issues.contains(&IntegrityIssue::DanglingReference {
            task_id: "t1".into(),
            goal_id: None,
            tag_id: "ghost".into(),
        }));
        assert!(issues.contains(&IntegrityIssue::MetadataMismatch {
            task_id: "t1".into(),
            goal_id: Some("g1".into()),
        }));
    }

    #[test]
    fn repair_fills_derivable_fields() {
        let mut d = doc(r#"{"tags":[{"id":"a","name":"x"},{"name":"no-id"}]}"#);
        let now = Utc::now();
        let fixes = repair_tag_records(&mut d.tags, now);
        assert_eq!(fixes.len(), 3);
        assert_eq!(d.tags[0].display_text, "#x");
        assert_eq!(d.tags[0].created_at, Some(now));
        assert_eq!(d.tags[0].updated_at, Some(now));
        // incomplete records are left for the caller to report
        assert_eq!(d.tags[1].display_text, "");

        assert!(repair_tag_records(&mut d.tags, now).is_empty());
    }

    #[test]
    fn issues_serialize_with_type_tag() {
        let json = serde_json::to_value(IntegrityIssue::DanglingReference {
            task_id: "t1".into(),
            goal_id: None,
            tag_id: "x".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "dangling_reference");
        assert!(json.get("goal_id").is_none());
    }
}
