use chrono::Utc;
use serde::Serialize;

use super::{EntityStore, StoreError};
use crate::events::{Event, TagsUpdated};
use crate::model::tag::Tag;
use crate::model::task::Taggable;

/// A task, or a goal inside a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef<'a> {
    Task(&'a str),
    Goal { task_id: &'a str, goal_id: &'a str },
}

impl<'a> EntityRef<'a> {
    pub fn task_id(&self) -> &'a str {
        match self {
            EntityRef::Task(task_id) => task_id,
            EntityRef::Goal { task_id, .. } => task_id,
        }
    }

    pub fn goal_id(&self) -> Option<&'a str> {
        match self {
            EntityRef::Task(_) => None,
            EntityRef::Goal { goal_id, .. } => Some(goal_id),
        }
    }
}

/// Outcome of a successful link/unlink call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkChange {
    /// The entity's full tag list afterwards
    pub tags: Vec<String>,
    /// Ids actually added (or removed), never empty
    pub changed: Vec<String>,
    /// Requested ids that were ignored: unknown tags on add, ids not
    /// attached on remove
    pub unknown: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no tag ids given")]
    EmptyRequest,
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("goal not found: {goal_id} (task {task_id})")]
    GoalNotFound { task_id: String, goal_id: String },
    #[error("none of the given tags exist: {}", dropped.join(", "))]
    NoValidTags { dropped: Vec<String> },
    #[error("already attached: {}", ids.join(", "))]
    AlreadyAttached { ids: Vec<String> },
    #[error("not attached: {}", ids.join(", "))]
    NotAttached { ids: Vec<String> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EntityStore {
    fn entity(&self, target: EntityRef<'_>) -> Result<&dyn Taggable, LinkError> {
        let task = self
            .data
            .task(target.task_id())
            .ok_or_else(|| LinkError::TaskNotFound(target.task_id().to_string()))?;
        match target.goal_id() {
            None => Ok(task as &dyn Taggable),
            Some(goal_id) => task
                .goal(goal_id)
                .map(|g| g as &dyn Taggable)
                .ok_or_else(|| LinkError::GoalNotFound {
                    task_id: target.task_id().to_string(),
                    goal_id: goal_id.to_string(),
                }),
        }
    }

    fn entity_mut(&mut self, target: EntityRef<'_>) -> Result<&mut dyn Taggable, LinkError> {
        let task = self
            .data
            .task_mut(target.task_id())
            .ok_or_else(|| LinkError::TaskNotFound(target.task_id().to_string()))?;
        match target.goal_id() {
            None => Ok(task as &mut dyn Taggable),
            Some(goal_id) => task
                .goal_mut(goal_id)
                .map(|g| g as &mut dyn Taggable)
                .ok_or_else(|| LinkError::GoalNotFound {
                    task_id: target.task_id().to_string(),
                    goal_id: goal_id.to_string(),
                }),
        }
    }

    fn announce(&self, target: EntityRef<'_>, tags: &[String], added: Vec<String>, removed: Vec<String>) {
        let payload = TagsUpdated {
            task_id: target.task_id().to_string(),
            goal_id: target.goal_id().map(str::to_string),
            tags: tags.to_vec(),
            added_tags: added,
            removed_tags: removed,
        };
        let event = match target {
            EntityRef::Task(_) => Event::TaskTagsUpdated(payload),
            EntityRef::Goal { .. } => Event::GoalTagsUpdated(payload),
        };
        self.bus.emit(event);
    }

    /// Attach existing tags to an entity.
    ///
    /// Unknown ids are dropped with a warning and reported in
    /// `LinkChange::unknown`. Ids already attached are skipped; if that
    /// leaves nothing to add the call fails without writing.
    pub fn add_tags(&mut self, target: EntityRef<'_>, tag_ids: &[String]) -> Result<LinkChange, LinkError> {
        if tag_ids.is_empty() {
            return Err(LinkError::EmptyRequest);
        }
        self.ensure_loaded()?;
        self.entity(target)?;

        let known = self.known_tag_ids();
        let (valid, unknown): (Vec<&String>, Vec<&String>) =
            tag_ids.iter().partition(|id| known.contains(id.as_str()));
        let unknown: Vec<String> = unknown.into_iter().cloned().collect();
        for id in &unknown {
            tracing::warn!(tag = %id, task = %target.task_id(), "ignoring unknown tag id");
        }
        if valid.is_empty() {
            return Err(LinkError::NoValidTags { dropped: unknown });
        }

        let current = self.entity(target)?;
        if valid.iter().all(|id| current.has_tag(id)) {
            return Err(LinkError::AlreadyAttached {
                ids: valid.into_iter().cloned().collect(),
            });
        }

        let now = Utc::now();
        let entity = self.entity_mut(target)?;
        let added: Vec<String> = valid
            .into_iter()
            .filter(|id| entity.attach(id, now))
            .cloned()
            .collect();
        let tags = entity.tag_ids().to_vec();

        self.save()?;
        self.announce(target, &tags, added.clone(), Vec::new());
        Ok(LinkChange {
            tags,
            changed: added,
            unknown,
        })
    }

    /// Detach tags from an entity. Ids that are not attached are reported
    /// in `LinkChange::unknown`; if none of them is attached the call fails
    /// without writing.
    pub fn remove_tags(&mut self, target: EntityRef<'_>, tag_ids: &[String]) -> Result<LinkChange, LinkError> {
        if tag_ids.is_empty() {
            return Err(LinkError::EmptyRequest);
        }
        self.ensure_loaded()?;
        let current = self.entity(target)?;
        if !tag_ids.iter().any(|id| current.has_tag(id)) {
            return Err(LinkError::NotAttached {
                ids: tag_ids.to_vec(),
            });
        }

        let entity = self.entity_mut(target)?;
        let mut removed = Vec::new();
        let mut unknown = Vec::new();
        for id in tag_ids {
            if entity.detach(id) {
                removed.push(id.clone());
            } else if !removed.contains(id) && !unknown.contains(id) {
                unknown.push(id.clone());
            }
        }
        let tags = entity.tag_ids().to_vec();

        self.save()?;
        self.announce(target, &tags, Vec::new(), removed.clone());
        Ok(LinkChange {
            tags,
            changed: removed,
            unknown,
        })
    }

    pub fn add_tags_to_task(&mut self, task_id: &str, tag_ids: &[String]) -> Result<LinkChange, LinkError> {
        self.add_tags(EntityRef::Task(task_id), tag_ids)
    }

    pub fn add_tags_to_goal(
        &mut self,
        task_id: &str,
        goal_id: &str,
        tag_ids: &[String],
    ) -> Result<LinkChange, LinkError> {
        self.add_tags(EntityRef::Goal { task_id, goal_id }, tag_ids)
    }

    pub fn remove_tags_from_task(&mut self, task_id: &str, tag_ids: &[String]) -> Result<LinkChange, LinkError> {
        self.remove_tags(EntityRef::Task(task_id), tag_ids)
    }

    pub fn remove_tags_from_goal(
        &mut self,
        task_id: &str,
        goal_id: &str,
        tag_ids: &[String],
    ) -> Result<LinkChange, LinkError> {
        self.remove_tags(EntityRef::Goal { task_id, goal_id }, tag_ids)
    }

    /// Resolve an entity's tag ids to tags.
    ///
    /// This may write: ids with no tag record are stripped from the entity
    /// (with their metadata) and the document is saved before returning.
    pub fn resolve_and_repair_tags(&mut self, target: EntityRef<'_>) -> Result<Vec<Tag>, LinkError> {
        self.ensure_loaded()?;
        let ids = self.entity(target)?.tag_ids().to_vec();
        let mut resolved = Vec::with_capacity(ids.len());
        let mut dangling = Vec::new();
        for id in ids {
            match self.data.tag(&id) {
                Some(tag) => resolved.push(tag.clone()),
                None => dangling.push(id),
            }
        }

        if !dangling.is_empty() {
            let entity = self.entity_mut(target)?;
            for id in &dangling {
                entity.detach(id);
            }
            tracing::warn!(
                task = %target.task_id(),
                goal = ?target.goal_id(),
                dropped = ?dangling,
                "stripped orphaned tag references"
            );
            self.save()?;
        }
        Ok(resolved)
    }

    pub fn resolve_and_repair_task_tags(&mut self, task_id: &str) -> Result<Vec<Tag>, LinkError> {
        self.resolve_and_repair_tags(EntityRef::Task(task_id))
    }

    pub fn resolve_and_repair_goal_tags(&mut self, task_id: &str, goal_id: &str) -> Result<Vec<Tag>, LinkError> {
        self.resolve_and_repair_tags(EntityRef::Goal { task_id, goal_id })
    }
}
