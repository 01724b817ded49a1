use std::time::{Duration, Instant};

use serde::Serialize;

use crate::model::config::InputConfig;
use crate::model::tag::Tag;
use crate::tags::error::{ErrorCode, TagError};
use crate::tags::manager::TagManager;
use crate::tags::validator::{TagDraft, validate_tag_name};

/// One row of the suggestion list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Suggestion {
    Existing { tag: Tag, label: String },
    Create { name: String, label: String },
}

impl Suggestion {
    pub fn label(&self) -> &str {
        match self {
            Suggestion::Existing { label, .. } | Suggestion::Create { label, .. } => label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKey {
    Escape,
    Enter,
    Up,
    Down,
    Tab,
}

/// A tag picked from an input, either existing or just created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagSelection {
    pub instance_id: String,
    pub tag_id: String,
    pub created: bool,
}

/// Autocomplete state for one tag entry box.
///
/// Typing arms a debounce deadline; `poll` runs the search once it passes.
/// Instances share nothing, so any number can live side by side.
#[derive(Debug)]
pub struct TagInput {
    id: String,
    config: InputConfig,
    visible: bool,
    query: String,
    deadline: Option<Instant>,
    suggestions: Vec<Suggestion>,
    highlighted: Option<usize>,
    last_error: Option<TagError>,
}

impl TagInput {
    pub fn new(config: InputConfig) -> Self {
        TagInput {
            id: format!("tag-input-{}", uuid::Uuid::new_v4().simple()),
            config,
            visible: false,
            query: String::new(),
            deadline: None,
            suggestions: Vec::new(),
            highlighted: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn suggestions(&self) -> &[Suggestion] {
        &self.suggestions
    }

    pub fn highlighted(&self) -> Option<usize> {
        self.highlighted
    }

    pub fn last_error(&self) -> Option<&TagError> {
        self.last_error.as_ref()
    }

    pub fn show(&mut self) {
        self.visible = true;
    }

    /// Close the input and forget the query, the suggestions and any
    /// pending search.
    pub fn hide(&mut self) {
        self.visible = false;
        self.query.clear();
        self.deadline = None;
        self.clear_suggestions();
    }

    fn clear_suggestions(&mut self) {
        self.suggestions.clear();
        self.highlighted = None;
    }

    pub fn handle_input(&mut self, text: &str, now: Instant) {
        self.query = text.trim().to_string();
        self.deadline = Some(now + Duration::from_millis(self.config.debounce_ms));
    }

    /// Run the pending search if its deadline has passed. Returns true if
    /// the suggestion list was rebuilt.
    pub fn poll(&mut self, manager: &mut TagManager, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.search(manager);
                true
            }
            _ => false,
        }
    }

    fn search(&mut self, manager: &mut TagManager) {
        if self.query.is_empty() {
            self.clear_suggestions();
            return;
        }

        let matches = manager.search_tags(&self.query);
        let mut suggestions: Vec<Suggestion> = matches
            .iter()
            .take(self.config.max_suggestions.saturating_sub(1))
            .map(|tag| Suggestion::Existing {
                label: self.label_for(tag),
                tag: tag.clone(),
            })
            .collect();

        if self.config.allow_create && !matches.iter().any(|t| t.name_matches(&self.query)) {
            let validation = validate_tag_name(&self.query);
            if validation.is_valid {
                suggestions.push(Suggestion::Create {
                    label: format!("Create tag: #{}", validation.sanitized),
                    name: validation.sanitized,
                });
            }
        }

        tracing::debug!(input = %self.id, query = %self.query, count = suggestions.len(), "suggestions");
        self.suggestions = suggestions;
        self.highlighted = None;
    }

    fn label_for(&self, tag: &Tag) -> String {
        if self.config.show_usage_count && tag.usage_count > 0 {
            format!("{} ({})", tag.display_text, tag.usage_count)
        } else {
            tag.display_text.clone()
        }
    }

    pub fn handle_key(&mut self, key: InputKey, manager: &mut TagManager) -> Option<TagSelection> {
        match key {
            InputKey::Escape => {
                self.hide();
                None
            }
            InputKey::Down => {
                self.step(1);
                None
            }
            InputKey::Up => {
                self.step(-1);
                None
            }
            InputKey::Enter => match self.highlighted {
                Some(index) => self.select(index, manager),
                None if !self.query.is_empty() && self.config.allow_create => {
                    let name = self.query.clone();
                    self.create_and_select(&name, manager)
                }
                None => None,
            },
            InputKey::Tab => self.highlighted.and_then(|index| self.select(index, manager)),
        }
    }

    /// Move the highlight, wrapping at both ends.
    fn step(&mut self, direction: isize) {
        let len = self.suggestions.len();
        if len == 0 {
            return;
        }
        self.highlighted = Some(match (self.highlighted, direction) {
            (None, d) if d > 0 => 0,
            (None, _) => len - 1,
            (Some(i), d) if d > 0 => (i + 1) % len,
            (Some(0), _) => len - 1,
            (Some(i), _) => i - 1,
        });
    }

    fn select(&mut self, index: usize, manager: &mut TagManager) -> Option<TagSelection> {
        match self.suggestions.get(index)?.clone() {
            Suggestion::Existing { tag, .. } => Some(self.finish(tag.id, false)),
            Suggestion::Create { name, .. } => self.create_and_select(&name, manager),
        }
    }

    fn create_and_select(&mut self, name: &str, manager: &mut TagManager) -> Option<TagSelection> {
        match manager.create_tag(&TagDraft::named(name)) {
            Ok(created) => Some(self.finish(created.tag_id, true)),
            Err(e) if e.code == ErrorCode::DuplicateTag => {
                let existing = e.existing_tag()?.id.clone();
                Some(self.finish(existing, false))
            }
            Err(e) => {
                tracing::warn!(input = %self.id, error = %e, "could not create tag");
                self.last_error = Some(e);
                None
            }
        }
    }

    fn finish(&mut self, tag_id: String, created: bool) -> TagSelection {
        let selection = TagSelection {
            instance_id: self.id.clone(),
            tag_id,
            created,
        };
        self.last_error = None;
        self.hide();
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::io::kv::MemoryStore;
    use crate::model::config::StoreConfig;
    use crate::store::EntityStore;
    use pretty_assertions::assert_eq;

    fn manager() -> TagManager {
        let store = EntityStore::new(
            Box::new(MemoryStore::new()),
            &StoreConfig::default(),
            EventBus::new(),
        );
        TagManager::new(store)
    }

    fn typed(input: &mut TagInput, m: &mut TagManager, text: &str) {
        let now = Instant::now();
        input.show();
        input.handle_input(text, now);
        assert!(input.poll(m, now + Duration::from_millis(input.config.debounce_ms)));
    }

    fn labels(input: &TagInput) -> Vec<&str> {
        input.suggestions().iter().map(Suggestion::label).collect()
    }

    #[test]
    fn search_waits_for_debounce() {
        let mut m = manager();
        let mut input = TagInput::new(InputConfig::default());
        let now = Instant::now();
        input.handle_input("  wor ", now);
        assert_eq!(input.query(), "wor");
        assert!(!input.poll(&mut m, now + Duration::from_millis(10)));
        assert!(input.suggestions().is_empty());
        assert!(input.poll(&mut m, now + Duration::from_millis(300)));
        assert_eq!(labels(&input), vec!["Create tag: #wor"]);
        assert!(!input.poll(&mut m, now + Duration::from_millis(600)));
    }

    #[test]
    fn existing_matches_then_create_entry() {
        let mut m = manager();
        m.create_tag(&TagDraft::named("work")).unwrap();
        let tag = m.create_tag(&TagDraft::named("workshop")).unwrap().tag;
        let task = m.store_mut().add_task("T").unwrap();
        m.add_tag_to_task(&task.id, &tag.id).unwrap();

        let mut input = TagInput::new(InputConfig::default());
        typed(&mut input, &mut m, "wor");
        assert_eq!(labels(&input), vec!["#work", "#workshop (1)", "Create tag: #wor"]);

        typed(&mut input, &mut m, "WORK");
        assert_eq!(labels(&input), vec!["#work", "#workshop (1)"]);
    }

    #[test]
    fn suggestions_capped_below_max() {
        let mut m = manager();
        for name in ["a1", "a2", "a3", "a4"] {
            m.create_tag(&TagDraft::named(name)).unwrap();
        }
        let config = InputConfig {
            max_suggestions: 3,
            allow_create: false,
            ..InputConfig::default()
        };
        let mut input = TagInput::new(config);
        typed(&mut input, &mut m, "a");
        assert_eq!(labels(&input), vec!["#a1", "#a2"]);
    }

    #[test]
    fn empty_query_clears_suggestions() {
        let mut m = manager();
        let mut input = TagInput::new(InputConfig::default());
        typed(&mut input, &mut m, "x");
        assert_eq!(input.suggestions().len(), 1);
        typed(&mut input, &mut m, "   ");
        assert!(input.suggestions().is_empty());
    }

    #[test]
    fn highlight_wraps_both_ways() {
        let mut m = manager();
        m.create_tag(&TagDraft::named("ab")).unwrap();
        let mut input = TagInput::new(InputConfig::default());
        typed(&mut input, &mut m, "a");
        assert_eq!(input.suggestions().len(), 2);

        input.handle_key(InputKey::Up, &mut m);
        assert_eq!(input.highlighted(), Some(1));
        input.handle_key(InputKey::Down, &mut m);
        assert_eq!(input.highlighted(), Some(0));
        input.handle_key(InputKey::Up, &mut m);
        assert_eq!(input.highlighted(), Some(1));
    }

    #[test]
    fn enter_selects_highlighted_existing() {
        let mut m = manager();
        let tag = m.create_tag(&TagDraft::named("ab")).unwrap().tag;
        let mut input = TagInput::new(InputConfig::default());
        typed(&mut input, &mut m, "a");
        input.handle_key(InputKey::Down, &mut m);
        let selection = input.handle_key(InputKey::Enter, &mut m).unwrap();
        assert_eq!(selection.tag_id, tag.id);
        assert_eq!(selection.instance_id, input.id());
        assert!(!selection.created);
        assert!(!input.is_visible());
        assert!(input.suggestions().is_empty());
    }

    #[test]
    fn enter_without_highlight_creates_query() {
        let mut m = manager();
        let mut input = TagInput::new(InputConfig::default());
        typed(&mut input, &mut m, "#new tag");
        let selection = input.handle_key(InputKey::Enter, &mut m).unwrap();
        assert!(selection.created);
        assert_eq!(m.tag_by_id(&selection.tag_id).unwrap().name, "new tag");
    }

    #[test]
    fn creating_duplicate_selects_existing() {
        let mut m = manager();
        let tag = m.create_tag(&TagDraft::named("Work")).unwrap().tag;
        let mut input = TagInput::new(InputConfig::default());
        input.show();
        input.handle_input("work", Instant::now());
        let selection = input.handle_key(InputKey::Enter, &mut m).unwrap();
        assert_eq!(selection.tag_id, tag.id);
        assert!(!selection.created);
        assert_eq!(m.all_tags().len(), 1);
    }

    #[test]
    fn invalid_name_keeps_error() {
        let mut m = manager();
        let mut input = TagInput::new(InputConfig::default());
        input.show();
        input.handle_input("!!!", Instant::now());
        assert!(input.handle_key(InputKey::Enter, &mut m).is_none());
        assert_eq!(
            input.last_error().map(|e| e.code),
            Some(ErrorCode::ValidationError)
        );
        assert!(input.is_visible());
    }

    #[test]
    fn tab_needs_highlight() {
        let mut m = manager();
        m.create_tag(&TagDraft::named("ab")).unwrap();
        let mut input = TagInput::new(InputConfig::default());
        typed(&mut input, &mut m, "a");
        assert!(input.handle_key(InputKey::Tab, &mut m).is_none());
        input.handle_key(InputKey::Down, &mut m);
        assert!(input.handle_key(InputKey::Tab, &mut m).is_some());
    }

    #[test]
    fn escape_hides_and_instances_are_independent() {
        let mut m = manager();
        let mut a = TagInput::new(InputConfig::default());
        let mut b = TagInput::new(InputConfig::default());
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("tag-input-"));
        typed(&mut a, &mut m, "x");
        b.show();
        a.handle_key(InputKey::Escape, &mut m);
        assert!(!a.is_visible());
        assert_eq!(a.query(), "");
        assert!(b.is_visible());
    }
}
