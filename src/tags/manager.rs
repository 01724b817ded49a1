use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventBus, Subscription, Topic, UsageAction};
use crate::model::tag::{DEFAULT_COLORS, Tag};
use crate::model::task::Taggable;
use crate::store::{EntityRef, EntityStore, LinkChange};
use crate::tags::cache::TagCache;
use crate::tags::error::TagError;
use crate::tags::integrity::{self, IntegrityFix, IntegrityReport};
use crate::tags::usage::{self, TagUsageInfo};
use crate::tags::validator::{
    MAX_DESCRIPTION_LEN, PartialTag, TagDraft, check_duplicates, normalize_tag_data,
    validate_tag_color, validate_tag_data, validate_tag_name,
};

/// Result of a successful `create_tag`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedTag {
    pub tag_id: String,
    pub tag: Tag,
}

/// Fields to change on `update_tag`; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TagPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Strip the tag from every task and goal instead of refusing
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageRecount {
    /// Number of tags whose count actually changed
    pub updated_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TagStats {
    pub total: usize,
    pub used: usize,
    pub unused: usize,
    pub average_usage: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Dangling tag ids stripped from tasks and goals
    pub removed_references: usize,
    /// Tags whose usage count was corrected
    pub usage_corrected: usize,
    /// Tags no task or goal references
    pub unused_tags: usize,
}

/// The tag engine: CRUD, queries and integrity repair over the store's
/// tag list and the tag ids embedded in tasks and goals.
pub struct TagManager {
    store: EntityStore,
    cache: TagCache,
    bus: EventBus,
    /// `data:loaded` / `data:imported` notifications, drained before reads
    reloads: Subscription,
}

impl TagManager {
    pub fn new(store: EntityStore) -> Self {
        let bus = store.bus().clone();
        let reloads = bus.subscribe(&[Topic::DataLoaded, Topic::DataImported]);
        TagManager {
            store,
            cache: TagCache::new(),
            bus,
            reloads,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &TagCache {
        &self.cache
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate();
    }

    pub fn refresh_cache(&mut self) {
        self.cache.refresh(self.store.tags());
    }

    fn drain_reloads(&mut self) {
        if !self.reloads.drain().is_empty() {
            self.cache.invalidate();
        }
    }

    fn ensure_loaded(&mut self) -> Result<(), TagError> {
        Ok(self.store.ensure_loaded()?)
    }

    /// A palette color, picked at random.
    pub fn random_color() -> String {
        let byte = uuid::Uuid::new_v4().as_bytes()[0] as usize;
        DEFAULT_COLORS[byte % DEFAULT_COLORS.len()].to_string()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Every tag. Never fails: if the store cannot be loaded the raw blob is
    /// parsed directly, and at worst the list is empty.
    pub fn all_tags(&mut self) -> Vec<Tag> {
        self.drain_reloads();
        if !self.store.is_loaded()
            && let Err(e) = self.store.load()
        {
            tracing::warn!(error = %e, "load failed, reading tags from raw blob");
            return self.store.read_raw_tags();
        }
        if let Some(tags) = self.cache.tags() {
            return tags.to_vec();
        }
        let tags = self.store.tags().to_vec();
        self.cache.refresh(&tags);
        tags
    }

    pub fn tag_by_id(&mut self, tag_id: &str) -> Option<Tag> {
        self.all_tags().into_iter().find(|t| t.id == tag_id)
    }

    pub fn tag_usage_info(&mut self, tag_id: &str) -> TagUsageInfo {
        if let Err(e) = self.ensure_loaded() {
            tracing::warn!(error = %e, "usage lookup on unloaded store");
            return TagUsageInfo::default();
        }
        usage::usage_info(self.store.document(), tag_id)
    }

    pub fn is_tag_in_use(&mut self, tag_id: &str) -> bool {
        self.tag_usage_info(tag_id).is_used
    }

    /// Case-insensitive substring match on name and description. A leading
    /// `#` in the query is ignored, and a blank query matches every tag.
    pub fn search_tags(&mut self, query: &str) -> Vec<Tag> {
        let key = query.to_lowercase().trim().to_string();
        self.drain_reloads();
        if let Some(hit) = self.cache.search(&key) {
            return hit.to_vec();
        }

        let term = key.strip_prefix('#').unwrap_or(&key);
        let results: Vec<Tag> = self
            .all_tags()
            .into_iter()
            .filter(|t| {
                t.name.to_lowercase().contains(term) || t.description.to_lowercase().contains(term)
            })
            .collect();
        self.cache.store_search(key.clone(), results.clone());
        results
    }

    /// Most used first; ties keep list order.
    pub fn tags_by_usage(&mut self) -> Vec<Tag> {
        self.drain_reloads();
        if let Some(sorted) = self.cache.by_usage() {
            return sorted.to_vec();
        }
        let mut sorted = self.all_tags();
        sorted.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        self.cache.store_by_usage(sorted.clone());
        sorted
    }

    pub fn tags_by_name(&mut self) -> Vec<Tag> {
        let mut sorted = self.all_tags();
        sorted.sort_by(|a, b| compare_names(&a.name, &b.name));
        sorted
    }

    pub fn tag_stats(&mut self) -> TagStats {
        let tags = self.all_tags();
        let used = tags.iter().filter(|t| t.usage_count > 0).count();
        let total_usage: u64 = tags.iter().map(|t| u64::from(t.usage_count)).sum();
        TagStats {
            total: tags.len(),
            used,
            unused: tags.len() - used,
            average_usage: if tags.is_empty() {
                0.0
            } else {
                total_usage as f64 / tags.len() as f64
            },
        }
    }

    // -----------------------------------------------------------------------
    // Tag CRUD
    // -----------------------------------------------------------------------

    /// Create a tag. A name that collides (ignoring case) with an existing
    /// tag yields `DUPLICATE_TAG` carrying that tag, so creating the same
    /// name twice leaves exactly one tag.
    pub fn create_tag(&mut self, draft: &TagDraft) -> Result<CreatedTag, TagError> {
        let validation = validate_tag_data(draft);
        if !validation.is_valid {
            return Err(TagError::validation(validation.errors));
        }
        self.ensure_loaded()?;

        let name = validation.sanitized.name.unwrap_or_default();
        if let Some(existing) = check_duplicates(self.store.tags(), &name, None) {
            return Err(TagError::duplicate(existing));
        }

        let now = Utc::now();
        let tag_id = self.store.generate_id();
        let tag = normalize_tag_data(
            PartialTag {
                id: None,
                name,
                color: validation.sanitized.color,
                description: validation.sanitized.description,
                created_at: Some(now),
                usage_count: Some(0),
            },
            now,
            || tag_id.clone(),
            TagManager::random_color,
        );

        self.store.tags_mut().push(tag.clone());
        self.store.save()?;
        self.cache.invalidate();
        tracing::info!(tag = %tag.id, name = %tag.name, "tag created");
        self.bus.emit(Event::TagCreated(tag.clone()));
        Ok(CreatedTag { tag_id, tag })
    }

    /// Apply the fields present in `patch`. Renames are duplicate-checked
    /// against every other tag.
    pub fn update_tag(&mut self, tag_id: &str, patch: &TagPatch) -> Result<Tag, TagError> {
        if tag_id.is_empty() {
            return Err(TagError::validation(vec!["tag id is required".into()]));
        }

        let mut errors = Vec::new();
        let name = match patch.name.as_deref() {
            Some(raw) => {
                let v = validate_tag_name(raw);
                errors.extend(v.errors);
                Some(v.sanitized)
            }
            None => None,
        };
        errors.extend(validate_tag_color(patch.color.as_deref()).errors);
        if let Some(d) = patch.description.as_deref()
            && d.chars().count() > MAX_DESCRIPTION_LEN
        {
            errors.push(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ));
        }
        if !errors.is_empty() {
            return Err(TagError::validation(errors));
        }

        self.ensure_loaded()?;
        let Some(index) = self.store.tags().iter().position(|t| t.id == tag_id) else {
            return Err(TagError::not_found(tag_id));
        };
        if let Some(name) = name.as_deref()
            && let Some(existing) = check_duplicates(self.store.tags(), name, Some(tag_id))
        {
            return Err(TagError::duplicate(existing));
        }

        let now = Utc::now();
        let tag = &mut self.store.tags_mut()[index];
        if let Some(name) = name {
            tag.rename(name);
        }
        if let Some(color) = patch.color.as_deref().filter(|c| !c.is_empty()) {
            tag.color = color.to_string();
        }
        if let Some(description) = patch.description.as_deref() {
            tag.description = description.trim().to_string();
        }
        tag.touch(now);
        let updated = tag.clone();

        self.store.save()?;
        self.cache.invalidate();
        tracing::info!(tag = %updated.id, name = %updated.name, "tag updated");
        self.bus.emit(Event::TagUpdated(updated.clone()));
        Ok(updated)
    }

    /// Delete a tag. Without `force`, a tag any task or goal still uses is
    /// refused with `TAG_IN_USE` and the usage attached. With `force`, every
    /// reference is stripped first and the document is saved once.
    pub fn delete_tag(&mut self, tag_id: &str, options: DeleteOptions) -> Result<Tag, TagError> {
        if tag_id.is_empty() {
            return Err(TagError::validation(vec!["tag id is required".into()]));
        }
        self.ensure_loaded()?;
        let Some(index) = self.store.tags().iter().position(|t| t.id == tag_id) else {
            return Err(TagError::not_found(tag_id));
        };

        if options.force {
            let stripped = self.strip_everywhere(tag_id);
            if stripped > 0 {
                tracing::info!(tag = %tag_id, references = stripped, "stripped references before delete");
            }
        } else {
            let usage = usage::usage_info(self.store.document(), tag_id);
            if usage.is_used {
                return Err(TagError::in_use(&self.store.tags()[index], usage));
            }
        }

        let deleted = self.store.tags_mut().remove(index);
        self.store.save()?;
        self.cache.invalidate();
        tracing::info!(tag = %deleted.id, name = %deleted.name, "tag deleted");
        self.bus.emit(Event::TagDeleted(deleted.clone()));
        Ok(deleted)
    }

    /// Remove `tag_id` from every task and goal. Does not save.
    fn strip_everywhere(&mut self, tag_id: &str) -> usize {
        let mut stripped = 0;
        for task in self.store.tasks_mut() {
            if task.detach(tag_id) {
                stripped += 1;
            }
            for goal in &mut task.goals {
                if goal.detach(tag_id) {
                    stripped += 1;
                }
            }
        }
        stripped
    }

    // -----------------------------------------------------------------------
    // Linking
    // -----------------------------------------------------------------------

    /// Attach a tag, then bump its usage count directly.
    pub fn add_tag(&mut self, target: EntityRef<'_>, tag_id: &str) -> Result<LinkChange, TagError> {
        self.ensure_loaded()?;
        let change = self.store.add_tags(target, &[tag_id.to_string()])?;
        self.update_tag_usage(&change.changed)?;
        Ok(change)
    }

    /// Detach a tag, then recount every usage from scratch.
    pub fn remove_tag(&mut self, target: EntityRef<'_>, tag_id: &str) -> Result<LinkChange, TagError> {
        self.ensure_loaded()?;
        let change = self.store.remove_tags(target, &[tag_id.to_string()])?;
        self.recalculate_usage_counts()?;
        Ok(change)
    }

    pub fn add_tag_to_task(&mut self, task_id: &str, tag_id: &str) -> Result<LinkChange, TagError> {
        self.add_tag(EntityRef::Task(task_id), tag_id)
    }

    pub fn remove_tag_from_task(&mut self, task_id: &str, tag_id: &str) -> Result<LinkChange, TagError> {
        self.remove_tag(EntityRef::Task(task_id), tag_id)
    }

    pub fn add_tag_to_goal(&mut self, task_id: &str, goal_id: &str, tag_id: &str) -> Result<LinkChange, TagError> {
        self.add_tag(EntityRef::Goal { task_id, goal_id }, tag_id)
    }

    pub fn remove_tag_from_goal(
        &mut self,
        task_id: &str,
        goal_id: &str,
        tag_id: &str,
    ) -> Result<LinkChange, TagError> {
        self.remove_tag(EntityRef::Goal { task_id, goal_id }, tag_id)
    }

    /// Resolve a task's tags, stripping and persisting any dangling ids.
    pub fn resolve_task_tags(&mut self, task_id: &str) -> Result<Vec<Tag>, TagError> {
        self.ensure_loaded()?;
        Ok(self.store.resolve_and_repair_task_tags(task_id)?)
    }

    /// Resolve a goal's tags, stripping and persisting any dangling ids.
    pub fn resolve_goal_tags(&mut self, task_id: &str, goal_id: &str) -> Result<Vec<Tag>, TagError> {
        self.ensure_loaded()?;
        Ok(self.store.resolve_and_repair_goal_tags(task_id, goal_id)?)
    }

    // -----------------------------------------------------------------------
    // Usage accounting
    // -----------------------------------------------------------------------

    /// Increment usage by one for each existing id. Returns how many tags
    /// changed.
    pub fn update_tag_usage(&mut self, tag_ids: &[String]) -> Result<usize, TagError> {
        self.ensure_loaded()?;
        let now = Utc::now();
        let mut modified = 0;
        for tag in self.store.tags_mut().iter_mut() {
            if tag_ids.contains(&tag.id) {
                tag.usage_count = tag.usage_count.saturating_add(1);
                tag.touch(now);
                modified += 1;
            }
        }
        if modified > 0 {
            self.store.save()?;
            self.cache.invalidate();
        }
        Ok(modified)
    }

    /// Recount every tag's usage in one scan and write back only the counts
    /// that changed.
    pub fn recalculate_usage_counts(&mut self) -> Result<UsageRecount, TagError> {
        self.ensure_loaded()?;
        let counts = usage::count_usage(self.store.document());
        let now = Utc::now();
        let mut changed = Vec::new();
        for tag in self.store.tags_mut().iter_mut() {
            let actual = counts.get(&tag.id).copied().unwrap_or(0);
            if tag.usage_count != actual {
                tag.usage_count = actual;
                tag.touch(now);
                changed.push(tag.id.clone());
            }
        }

        if !changed.is_empty() {
            self.store.save()?;
            self.cache.invalidate();
            tracing::debug!(updated = changed.len(), "usage counts recalculated");
            self.bus.emit(Event::TagUsageUpdated {
                tag_ids: changed.clone(),
                action: UsageAction::Recalculated,
            });
        }
        Ok(UsageRecount {
            updated_count: changed.len(),
        })
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Strip dangling references everywhere, then recount usage.
    pub fn cleanup_orphaned_tags(&mut self) -> Result<CleanupReport, TagError> {
        self.ensure_loaded()?;
        let removed_references = self.store.cleanup_orphaned_tag_references()?;
        let recount = self.recalculate_usage_counts()?;
        self.cache.invalidate();
        let unused_tags = self
            .store
            .tags()
            .iter()
            .filter(|t| t.usage_count == 0)
            .count();
        if removed_references > 0 {
            tracing::warn!(removed = removed_references, "cleaned up orphaned tag references");
        }
        Ok(CleanupReport {
            removed_references,
            usage_corrected: recount.updated_count,
            unused_tags,
        })
    }

    /// Repair what can be derived (display text, timestamps, usage counts)
    /// and report what cannot (duplicates, incomplete records, dangling
    /// references, metadata drift). Saves only if something was fixed.
    pub fn validate_data_integrity(&mut self) -> Result<IntegrityReport, TagError> {
        self.ensure_loaded()?;
        let now = Utc::now();
        let mut fixed = integrity::repair_tag_records(self.store.tags_mut(), now);

        let counts = usage::count_usage(self.store.document());
        for tag in self.store.tags_mut().iter_mut().filter(|t| !t.id.is_empty()) {
            let actual = counts.get(&tag.id).copied().unwrap_or(0);
            if tag.usage_count != actual {
                fixed.push(IntegrityFix::UsageCountCorrected {
                    tag_id: tag.id.clone(),
                    from: tag.usage_count,
                    to: actual,
                });
                tag.usage_count = actual;
                tag.touch(now);
            }
        }

        let issues = integrity::check_document(self.store.document());
        if !fixed.is_empty() {
            self.store.save()?;
            self.cache.invalidate();
        }
        Ok(IntegrityReport::new(issues, fixed))
    }
}

/// Name order: case-insensitive, then exact as a tiebreak
fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
