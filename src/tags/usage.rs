use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::model::document::Document;
use crate::model::task::Taggable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalRef {
    pub id: String,
    pub title: String,
    pub task_id: String,
    pub task_title: String,
}

/// Who references a tag. A task counts once if its own list has the id; a
/// goal counts once if its own list has it, whatever its parent says.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagUsageInfo {
    pub is_used: bool,
    pub task_count: usize,
    pub goal_count: usize,
    pub tasks: Vec<TaskRef>,
    pub goals: Vec<GoalRef>,
}

pub fn usage_info(doc: &Document, tag_id: &str) -> TagUsageInfo {
    let mut info = TagUsageInfo::default();
    for task in &doc.tasks {
        if task.has_tag(tag_id) {
            info.tasks.push(TaskRef {
                id: task.id.clone(),
                title: task.title.clone(),
            });
        }
        for goal in &task.goals {
            if goal.has_tag(tag_id) {
                info.goals.push(GoalRef {
                    id: goal.id.clone(),
                    title: goal.title.clone(),
                    task_id: task.id.clone(),
                    task_title: task.title.clone(),
                });
            }
        }
    }
    info.task_count = info.tasks.len();
    info.goal_count = info.goals.len();
    info.is_used = info.task_count + info.goal_count > 0;
    info
}

/// Number of distinct tasks and goals referencing each tag id, in one pass.
/// Ids with no tag record are counted too.
pub fn count_usage(doc: &Document) -> HashMap<String, u32> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut bump = |ids: &[String]| {
        let distinct: HashSet<&String> = ids.iter().collect();
        for id in distinct {
            *counts.entry(id.clone()).or_default() += 1;
        }
    };
    for task in &doc.tasks {
        bump(task.tag_ids());
        for goal in &task.goals {
            bump(goal.tag_ids());
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        serde_json::from_str(
            r#"{
                "tasks": [
                    {"id": "t1", "title": "Report", "tags": ["a", "b"],
                     "goals": [{"id": "g1", "title": "Draft", "tags": ["a"]},
                               {"id": "g2", "title": "Edit", "tags": ["a", "a"]}]},
                    {"id": "t2", "title": "Chores", "tags": ["b"]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn usage_counts_tasks_and_goals_separately() {
        let info = usage_info(&doc(), "a");
        assert!(info.is_used);
        assert_eq!(info.task_count, 1);
        assert_eq!(info.goal_count, 2);
        assert_eq!(info.goals[0].task_title, "Report");

        let info = usage_info(&doc(), "b");
        assert_eq!(info.task_count, 2);
        assert_eq!(info.goal_count, 0);

        assert!(!usage_info(&doc(), "zzz").is_used);
    }

    #[test]
    fn count_usage_counts_each_entity_once() {
        let counts = count_usage(&doc());
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 2);
        assert!(!counts.contains_key("zzz"));
    }
}
