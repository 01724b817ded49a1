use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use super::lenient;
use super::tag::Tag;
use super::task::Task;

/// Current on-disk document version
pub const DATA_VERSION: &str = "2.0.0";

/// Version assumed for documents written before versioning existed
pub const LEGACY_VERSION: &str = "1.0.0";

/// The single persisted document: every task, every tag and the settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "lenient::list")]
    pub tasks: Vec<Task>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub tags: Vec<Tag>,
    #[serde(default = "default_settings", deserialize_with = "settings")]
    pub settings: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Document {
    fn default() -> Self {
        Document {
            tasks: Vec::new(),
            tags: Vec::new(),
            settings: default_settings(),
            version: Some(DATA_VERSION.to_string()),
            extra: Map::new(),
        }
    }
}

impl Document {
    /// Version string, treating a missing one as the legacy format
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(LEGACY_VERSION)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn tag(&self, tag_id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == tag_id)
    }

    pub fn has_tag(&self, tag_id: &str) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }
}

fn default_settings() -> Map<String, Value> {
    let value = json!({
        "theme": "light",
        "notifications": "all",
        "username": "",
        "email": "",
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Settings must be an object; anything else falls back to the defaults.
fn settings<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        _ => Ok(default_settings()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gets_defaults() {
        let doc: Document = serde_json::from_str("{}").unwrap();
        assert!(doc.tasks.is_empty());
        assert!(doc.tags.is_empty());
        assert_eq!(doc.settings["theme"], "light");
        assert_eq!(doc.version(), LEGACY_VERSION);
    }

    #[test]
    fn default_document_is_current_version() {
        let doc = Document::default();
        assert_eq!(doc.version(), DATA_VERSION);
    }

    #[test]
    fn unknown_top_level_keys_are_kept() {
        let doc: Document =
            serde_json::from_str(r#"{"tasks":[],"version":"2.0.0","calendar":{"week":1}}"#)
                .unwrap();
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["calendar"]["week"], 1);
        assert_eq!(back["version"], "2.0.0");
    }

    #[test]
    fn null_and_mistyped_fields_load() {
        let doc: Document = serde_json::from_str(
            r##"{"tasks":[{"id":"t1","title":null,"tags":null},
                          {"title":"no id","goals":[{"id":"g1","title":null}]},
                          {"id":"t2","title":"keep me","tags":["a",null]}],
                 "tags":[{"id":"a","name":"a","description":null,"color":null}],
                 "settings":null,
                 "version":null}"##,
        )
        .unwrap();
        assert_eq!(doc.tasks.len(), 3);
        assert_eq!(doc.tasks[0].title, "");
        assert!(doc.tasks[0].tags.is_empty());
        assert_eq!(doc.tasks[1].id, "");
        assert_eq!(doc.tasks[1].goals[0].id, "g1");
        assert_eq!(doc.tasks[2].tags, vec!["a"]);
        assert_eq!(doc.tags[0].description, "");
        assert_eq!(doc.settings["theme"], "light");
        assert_eq!(doc.version(), LEGACY_VERSION);
    }
}
