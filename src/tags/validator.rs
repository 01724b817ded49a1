use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::tag::{Tag, display_text_for};

pub const MIN_NAME_LEN: usize = 1;
pub const MAX_NAME_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 200;

/// ASCII word characters, CJK unified ideographs, whitespace and hyphen
static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\x{4e00}-\x{9fa5}\s-]+$").expect("name pattern is valid")
});

static COLOR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("color pattern is valid"));

const ALTERNATIVE_SUFFIXES: [&str; 4] = ["新", "备用", "临时", "项目"];
const MAX_ALTERNATIVES: usize = 3;

/// Tag fields as a caller supplies them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagDraft {
    pub fn named(name: impl Into<String>) -> Self {
        TagDraft {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub sanitized: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Cleaned values; a field is present only if it validated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizedTag {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagDataValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub sanitized: SanitizedTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub validation: TagDataValidation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub results: Vec<BatchItem>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c == '_'
        || c == ' '
        || c == '-'
        || ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

/// Strip one leading `#`, trim, collapse whitespace runs to a single space,
/// drop disallowed characters, truncate to 50 characters.
pub fn sanitize_tag_name(raw: &str) -> String {
    let stripped = raw.strip_prefix('#').unwrap_or(raw);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .chars()
        .filter(|c| is_name_char(*c))
        .take(MAX_NAME_LEN)
        .collect()
}

pub fn validate_tag_name(raw: &str) -> NameValidation {
    if raw.is_empty() {
        return NameValidation {
            is_valid: false,
            errors: vec!["tag name is required".to_string()],
            sanitized: String::new(),
        };
    }

    let sanitized = sanitize_tag_name(raw);
    let len = sanitized.chars().count();
    let mut errors = Vec::new();
    if len < MIN_NAME_LEN {
        errors.push(format!(
            "tag name must be at least {} character",
            MIN_NAME_LEN
        ));
    }
    if len > MAX_NAME_LEN {
        errors.push(format!(
            "tag name must be at most {} characters",
            MAX_NAME_LEN
        ));
    }
    if !NAME_PATTERN.is_match(&sanitized) {
        errors.push(
            "tag name may only contain letters, digits, underscores, CJK characters, spaces and hyphens"
                .to_string(),
        );
    }

    NameValidation {
        is_valid: errors.is_empty(),
        errors,
        sanitized,
    }
}

/// Color is optional; an empty or absent value is valid.
pub fn validate_tag_color(color: Option<&str>) -> FieldValidation {
    match color {
        Some(c) if !c.is_empty() && !COLOR_PATTERN.is_match(c) => FieldValidation {
            is_valid: false,
            errors: vec![format!("invalid color {:?}: expected #RRGGBB", c)],
        },
        _ => FieldValidation {
            is_valid: true,
            errors: Vec::new(),
        },
    }
}

pub fn validate_tag_data(draft: &TagDraft) -> TagDataValidation {
    let mut errors = Vec::new();
    let mut sanitized = SanitizedTag::default();

    let name = validate_tag_name(&draft.name);
    if name.is_valid {
        sanitized.display_text = Some(display_text_for(&name.sanitized));
        sanitized.name = Some(name.sanitized);
    } else {
        errors.extend(name.errors);
    }

    let color = validate_tag_color(draft.color.as_deref());
    if !color.is_valid {
        errors.extend(color.errors);
    } else if let Some(c) = draft.color.as_deref().filter(|c| !c.is_empty()) {
        sanitized.color = Some(c.to_string());
    }

    if let Some(description) = draft.description.as_deref().filter(|d| !d.is_empty()) {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            errors.push(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ));
        } else {
            sanitized.description = Some(description.trim().to_string());
        }
    }

    TagDataValidation {
        is_valid: errors.is_empty(),
        errors,
        sanitized,
    }
}

/// Validate several drafts; the batch is valid only if every item is.
pub fn validate_batch(drafts: &[TagDraft]) -> BatchValidation {
    let results: Vec<BatchItem> = drafts
        .iter()
        .enumerate()
        .map(|(index, draft)| BatchItem {
            index,
            validation: validate_tag_data(draft),
        })
        .collect();
    let is_valid = results.iter().all(|r| r.validation.is_valid);
    BatchValidation {
        is_valid,
        errors: if is_valid {
            Vec::new()
        } else {
            vec!["batch contains invalid tags".to_string()]
        },
        results,
    }
}

/// First tag whose name equals `name` (after sanitizing) ignoring case,
/// skipping `exclude_id`.
pub fn check_duplicates<'a>(tags: &'a [Tag], name: &str, exclude_id: Option<&str>) -> Option<&'a Tag> {
    let sanitized = sanitize_tag_name(name);
    if sanitized.is_empty() {
        return None;
    }
    tags.iter()
        .find(|t| Some(t.id.as_str()) != exclude_id && t.name_matches(&sanitized))
}

/// Up to three free variants of `name`: numeric suffixes 2..=5 first, then
/// the descriptive suffixes.
pub fn suggest_alternatives(tags: &[Tag], name: &str) -> Vec<String> {
    let base = sanitize_tag_name(name);
    if base.is_empty() {
        return Vec::new();
    }
    (2..=5)
        .map(|i| format!("{}{}", base, i))
        .chain(ALTERNATIVE_SUFFIXES.iter().map(|s| format!("{}-{}", base, s)))
        .filter(|candidate| check_duplicates(tags, candidate, None).is_none())
        .take(MAX_ALTERNATIVES)
        .collect()
}

/// Partial tag record, e.g. from an import
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartialTag {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: Option<i64>,
}

/// Build a complete tag from partial data. `new_id` and `pick_color` are
/// only called when the field is missing.
pub fn normalize_tag_data(
    data: PartialTag,
    now: DateTime<Utc>,
    new_id: impl FnOnce() -> String,
    pick_color: impl FnOnce() -> String,
) -> Tag {
    let name = sanitize_tag_name(&data.name);
    let usage_count = data
        .usage_count
        .unwrap_or(0)
        .clamp(0, i64::from(u32::MAX)) as u32;
    Tag {
        id: data.id.filter(|id| !id.is_empty()).unwrap_or_else(new_id),
        display_text: display_text_for(&name),
        name,
        color: data.color.filter(|c| !c.is_empty()).unwrap_or_else(pick_color),
        description: data.description.unwrap_or_default().trim().to_string(),
        created_at: Some(data.created_at.unwrap_or(now)),
        updated_at: Some(now),
        usage_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tag(id: &str, name: &str) -> Tag {
        Tag::new(id.into(), name.into(), "#374151".into(), String::new(), Utc::now())
    }

    #[test]
    fn sanitize_strips_hash_and_collapses_spaces() {
        assert_eq!(sanitize_tag_name("#  front   end  "), "front end");
        assert_eq!(sanitize_tag_name("##x"), "x");
        assert_eq!(sanitize_tag_name("a\t\nb"), "a b");
    }

    #[test]
    fn sanitize_drops_disallowed_characters() {
        assert_eq!(sanitize_tag_name("工作!@#$%"), "工作");
        assert_eq!(sanitize_tag_name("c++/rust"), "crust");
        assert_eq!(sanitize_tag_name("my_tag-2"), "my_tag-2");
        // accented letters are not ASCII word characters
        assert_eq!(sanitize_tag_name("café"), "caf");
        // kana sit outside the CJK ideograph block
        assert_eq!(sanitize_tag_name("テスト"), "");
    }

    #[test]
    fn sanitize_truncates_to_fifty_chars() {
        let long = "字".repeat(60);
        assert_eq!(sanitize_tag_name(&long).chars().count(), 50);
    }

    #[test]
    fn validate_name_rejects_empty() {
        let v = validate_tag_name("");
        assert!(!v.is_valid);
        assert_eq!(v.errors, vec!["tag name is required"]);

        let v = validate_tag_name("#!!!");
        assert!(!v.is_valid);
        assert_eq!(v.sanitized, "");
        assert_eq!(v.errors.len(), 2);
    }

    #[test]
    fn validate_name_accepts_cjk_and_ascii() {
        let v = validate_tag_name("#前端开发");
        assert!(v.is_valid);
        assert_eq!(v.sanitized, "前端开发");
        assert!(validate_tag_name("backend-api_v2").is_valid);
    }

    #[test]
    fn color_is_optional() {
        assert!(validate_tag_color(None).is_valid);
        assert!(validate_tag_color(Some("")).is_valid);
        assert!(validate_tag_color(Some("#a1B2c3")).is_valid);
        assert!(!validate_tag_color(Some("#abc")).is_valid);
        assert!(!validate_tag_color(Some("red")).is_valid);
        assert!(!validate_tag_color(Some("#1234567")).is_valid);
    }

    #[test]
    fn validate_data_composes_fields() {
        let v = validate_tag_data(&TagDraft {
            name: "#work".into(),
            color: Some("#065F46".into()),
            description: Some("  day job  ".into()),
        });
        assert!(v.is_valid);
        assert_eq!(
            v.sanitized,
            SanitizedTag {
                name: Some("work".into()),
                display_text: Some("#work".into()),
                color: Some("#065F46".into()),
                description: Some("day job".into()),
            }
        );
    }

    #[test]
    fn validate_data_collects_all_errors() {
        let v = validate_tag_data(&TagDraft {
            name: String::new(),
            color: Some("blue".into()),
            description: Some("x".repeat(201)),
        });
        assert!(!v.is_valid);
        assert_eq!(v.errors.len(), 3);
        assert_eq!(v.sanitized, SanitizedTag::default());
    }

    #[test]
    fn description_limit_counts_chars() {
        let v = validate_tag_data(&TagDraft {
            name: "x".into(),
            color: None,
            description: Some("描".repeat(200)),
        });
        assert!(v.is_valid);
    }

    #[test]
    fn batch_is_invalid_if_any_item_is() {
        let batch = validate_batch(&[TagDraft::named("ok"), TagDraft::named("")]);
        assert!(!batch.is_valid);
        assert_eq!(batch.results.len(), 2);
        assert!(batch.results[0].validation.is_valid);
        assert_eq!(batch.results[1].index, 1);

        assert!(validate_batch(&[TagDraft::named("a"), TagDraft::named("b")]).is_valid);
    }

    #[test]
    fn duplicates_ignore_case_and_exclusion() {
        let tags = vec![tag("1", "Backend"), tag("2", "工作")];
        assert_eq!(check_duplicates(&tags, "backend", None).map(|t| t.id.as_str()), Some("1"));
        assert_eq!(check_duplicates(&tags, "#工作", None).map(|t| t.id.as_str()), Some("2"));
        assert!(check_duplicates(&tags, "BACKEND", Some("1")).is_none());
        assert!(check_duplicates(&tags, "", None).is_none());
    }

    #[test]
    fn alternatives_skip_taken_names() {
        let tags = vec![tag("1", "work"), tag("2", "work2"), tag("3", "WORK4")];
        assert_eq!(suggest_alternatives(&tags, "work"), vec!["work3", "work5", "work-新"]);
    }

    #[test]
    fn alternatives_fall_through_to_suffixes() {
        let tags: Vec<Tag> = (2..=5).map(|i| tag(&i.to_string(), &format!("a{}", i))).collect();
        assert_eq!(suggest_alternatives(&tags, "a"), vec!["a-新", "a-备用", "a-临时"]);
        assert!(suggest_alternatives(&tags, "!!").is_empty());
    }

    #[test]
    fn normalize_fills_missing_fields() {
        let now = Utc::now();
        let tag = normalize_tag_data(
            PartialTag {
                name: "#  deep   work ".into(),
                description: Some(" focus ".into()),
                usage_count: Some(-4),
                ..Default::default()
            },
            now,
            || "fresh".to_string(),
            || "#581C87".to_string(),
        );
        assert_eq!(tag.id, "fresh");
        assert_eq!(tag.name, "deep work");
        assert_eq!(tag.display_text, "#deep work");
        assert_eq!(tag.color, "#581C87");
        assert_eq!(tag.description, "focus");
        assert_eq!(tag.usage_count, 0);
        assert_eq!(tag.created_at, Some(now));
    }

    #[test]
    fn normalize_keeps_present_fields() {
        let created = Utc::now() - chrono::Duration::days(3);
        let tag = normalize_tag_data(
            PartialTag {
                id: Some("keep".into()),
                name: "x".into(),
                color: Some("#000000".into()),
                created_at: Some(created),
                usage_count: Some(7),
                ..Default::default()
            },
            Utc::now(),
            || panic!("id should not be generated"),
            || panic!("color should not be picked"),
        );
        assert_eq!(tag.id, "keep");
        assert_eq!(tag.color, "#000000");
        assert_eq!(tag.created_at, Some(created));
        assert_eq!(tag.usage_count, 7);
    }
}
