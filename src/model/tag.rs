use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lenient;

/// Colors handed out to tags created without one
pub const DEFAULT_COLORS: [&str; 8] = [
    "#374151", "#6B7280", "#4B5563", "#1F2937", "#065F46", "#7C2D12", "#581C87", "#92400E",
];

/// A controlled-vocabulary label that tasks and goals reference by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Opaque id, assigned once and never reused
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    /// Sanitized display name, unique case-insensitively
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    /// Always `#` + name
    #[serde(default, deserialize_with = "lenient::string")]
    pub display_text: String,
    /// `#RRGGBB`
    #[serde(default, deserialize_with = "lenient::string")]
    pub color: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Cached number of tasks and goals referencing this tag
    #[serde(default, deserialize_with = "lenient::count")]
    pub usage_count: u32,
}

impl Tag {
    /// Create a fresh tag with zero usage, stamped `now`
    pub fn new(
        id: String,
        name: String,
        color: String,
        description: String,
        now: DateTime<Utc>,
    ) -> Self {
        Tag {
            id,
            display_text: display_text_for(&name),
            name,
            color,
            description,
            created_at: Some(now),
            updated_at: Some(now),
            usage_count: 0,
        }
    }

    /// Change the name, keeping `display_text` in step
    pub fn rename(&mut self, name: String) {
        self.display_text = display_text_for(&name);
        self.name = name;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }

    /// Case-insensitive name comparison used for uniqueness
    pub fn name_matches(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.to_lowercase()
    }
}

pub fn display_text_for(name: &str) -> String {
    format!("#{}", name)
}
