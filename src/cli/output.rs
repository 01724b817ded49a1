use serde::Serialize;

use crate::model::tag::Tag;
use crate::model::task::{Goal, Task};
use crate::tags::integrity::{IntegrityFix, IntegrityIssue, IntegrityReport};
use crate::tags::usage::TagUsageInfo;
use crate::util::unicode::{column_width, pad_to_width};

// ---------------------------------------------------------------------------
// JSON output structs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct TaskJson {
    pub id: String,
    pub title: String,
    pub tags: Vec<TagRefJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub goals: Vec<GoalJson>,
}

#[derive(Serialize)]
pub struct GoalJson {
    pub id: String,
    pub title: String,
    pub tags: Vec<TagRefJson>,
}

/// A tag id with its name, or no name if the id dangles
#[derive(Serialize)]
pub struct TagRefJson {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct TagDetailJson<'a> {
    #[serde(flatten)]
    pub tag: &'a Tag,
    pub usage: &'a TagUsageInfo,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn tag_refs(ids: &[String], tags: &[Tag]) -> Vec<TagRefJson> {
    ids.iter()
        .map(|id| TagRefJson {
            id: id.clone(),
            name: tags.iter().find(|t| &t.id == id).map(|t| t.name.clone()),
        })
        .collect()
}

pub fn goal_to_json(goal: &Goal, tags: &[Tag]) -> GoalJson {
    GoalJson {
        id: goal.id.clone(),
        title: goal.title.clone(),
        tags: tag_refs(&goal.tags, tags),
    }
}

pub fn task_to_json(task: &Task, tags: &[Tag]) -> TaskJson {
    TaskJson {
        id: task.id.clone(),
        title: task.title.clone(),
        tags: tag_refs(&task.tags, tags),
        goals: task.goals.iter().map(|g| goal_to_json(g, tags)).collect(),
    }
}

// ---------------------------------------------------------------------------
// Text formatting
// ---------------------------------------------------------------------------

/// One line per tag: display text, usage, color, description. Names are
/// padded by display width so CJK and ASCII names line up.
pub fn format_tag_table(tags: &[Tag]) -> String {
    let name_width = column_width(tags.iter().map(|t| t.display_text.as_str())).min(32);
    let mut out = String::new();
    for tag in tags {
        let mut line = format!(
            "{}  {:>3}  {}",
            pad_to_width(&tag.display_text, name_width),
            tag.usage_count,
            tag.color
        );
        if !tag.description.is_empty() {
            line.push_str("  ");
            line.push_str(&tag.description);
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// `#a #b` for an entity's ids; unknown ids print as `?id`.
pub fn format_tag_list(ids: &[String], tags: &[Tag]) -> String {
    ids.iter()
        .map(|id| match tags.iter().find(|t| &t.id == id) {
            Some(tag) => tag.display_text.clone(),
            None => format!("?{}", id),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_task_line(task: &Task, tags: &[Tag]) -> String {
    let tag_list = format_tag_list(&task.tags, tags);
    if tag_list.is_empty() {
        format!("{}  {}", task.id, task.title)
    } else {
        format!("{}  {}  {}", task.id, task.title, tag_list)
    }
}

pub fn format_tag_detail(tag: &Tag, usage: &TagUsageInfo) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}  ({})\n", tag.display_text, tag.id));
    out.push_str(&format!("color: {}\n", tag.color));
    if !tag.description.is_empty() {
        out.push_str(&format!("description: {}\n", tag.description));
    }
    out.push_str(&format!(
        "used by {} task(s), {} goal(s)\n",
        usage.task_count, usage.goal_count
    ));
    for task in &usage.tasks {
        out.push_str(&format!("  task {}  {}\n", task.id, task.title));
    }
    for goal in &usage.goals {
        out.push_str(&format!(
            "  goal {}  {} (in {})\n",
            goal.id, goal.title, goal.task_title
        ));
    }
    out
}

fn describe_issue(issue: &IntegrityIssue) -> String {
    match issue {
        IntegrityIssue::DuplicateName { name, tag_ids } => {
            format!("duplicate tag name \"{}\": {}", name, tag_ids.join(", "))
        }
        IntegrityIssue::IncompleteTag { index, id } => {
            format!("tag record {} is missing an id or name (id: \"{}\")", index, id)
        }
        IntegrityIssue::StaleUsageCount {
            tag_id,
            recorded,
            actual,
        } => format!("{} usage count is {}, actual {}", tag_id, recorded, actual),
        IntegrityIssue::DanglingReference {
            task_id,
            goal_id,
            tag_id,
        } => match goal_id {
            Some(goal_id) => format!("goal {}/{} references missing tag {}", task_id, goal_id, tag_id),
            None => format!("task {} references missing tag {}", task_id, tag_id),
        },
        IntegrityIssue::MetadataMismatch { task_id, goal_id } => match goal_id {
            Some(goal_id) => format!("goal {}/{} tag metadata out of step", task_id, goal_id),
            None => format!("task {} tag metadata out of step", task_id),
        },
    }
}

fn describe_fix(fix: &IntegrityFix) -> String {
    match fix {
        IntegrityFix::DisplayTextFilled { tag_id } => format!("{}: display text rebuilt", tag_id),
        IntegrityFix::CreatedAtFilled { tag_id } => format!("{}: created_at filled", tag_id),
        IntegrityFix::UpdatedAtFilled { tag_id } => format!("{}: updated_at filled", tag_id),
        IntegrityFix::UsageCountCorrected { tag_id, from, to } => {
            format!("{}: usage count {} -> {}", tag_id, from, to)
        }
        IntegrityFix::OrphansRemoved { count } => format!("{} orphaned reference(s) removed", count),
    }
}

pub fn format_integrity_report(report: &IntegrityReport) -> String {
    let mut out = String::new();
    if !report.fixed_issues.is_empty() {
        out.push_str("Fixed:\n");
        for fix in &report.fixed_issues {
            out.push_str(&format!("  {}\n", describe_fix(fix)));
        }
    }
    if !report.issues.is_empty() {
        out.push_str("Issues:\n");
        for issue in &report.issues {
            out.push_str(&format!("  {}\n", describe_issue(issue)));
        }
    }
    if report.is_valid {
        out.push_str("✓ data is valid\n");
    } else {
        out.push_str("✗ data has issues\n");
    }
    out
}
