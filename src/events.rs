use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::tag::Tag;
use crate::tags::integrity::IntegrityReport;

/// Number of emitted events kept for inspection
pub const HISTORY_LIMIT: usize = 100;

/// Event names, as they appear on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Topic {
    #[serde(rename = "tag:created")]
    TagCreated,
    #[serde(rename = "tag:updated")]
    TagUpdated,
    #[serde(rename = "tag:deleted")]
    TagDeleted,
    #[serde(rename = "task:tags_updated")]
    TaskTagsUpdated,
    #[serde(rename = "goal:tags_updated")]
    GoalTagsUpdated,
    #[serde(rename = "tag:usage_updated")]
    TagUsageUpdated,
    #[serde(rename = "tags:synced")]
    TagsSynced,
    #[serde(rename = "data:loaded")]
    DataLoaded,
    #[serde(rename = "data:imported")]
    DataImported,
    #[serde(rename = "tags:integrity_issues")]
    IntegrityIssues,
    #[serde(rename = "tags:force_refresh")]
    ForceRefresh,
    #[serde(rename = "tags:sync_started")]
    SyncStarted,
    #[serde(rename = "tags:sync_completed")]
    SyncCompleted,
    #[serde(rename = "tags:sync_failed")]
    SyncFailed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TagCreated => "tag:created",
            Topic::TagUpdated => "tag:updated",
            Topic::TagDeleted => "tag:deleted",
            Topic::TaskTagsUpdated => "task:tags_updated",
            Topic::GoalTagsUpdated => "goal:tags_updated",
            Topic::TagUsageUpdated => "tag:usage_updated",
            Topic::TagsSynced => "tags:synced",
            Topic::DataLoaded => "data:loaded",
            Topic::DataImported => "data:imported",
            Topic::IntegrityIssues => "tags:integrity_issues",
            Topic::ForceRefresh => "tags:force_refresh",
            Topic::SyncStarted => "tags:sync_started",
            Topic::SyncCompleted => "tags:sync_completed",
            Topic::SyncFailed => "tags:sync_failed",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `task:tags_updated` / `goal:tags_updated`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsUpdated {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    /// The entity's full tag list after the change
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageAction {
    Added,
    Removed,
    Recalculated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
}

/// Everything the engine announces on the bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
    #[serde(rename = "tag:created")]
    TagCreated(Tag),
    #[serde(rename = "tag:updated")]
    TagUpdated(Tag),
    #[serde(rename = "tag:deleted")]
    TagDeleted(Tag),
    #[serde(rename = "task:tags_updated")]
    TaskTagsUpdated(TagsUpdated),
    #[serde(rename = "goal:tags_updated")]
    GoalTagsUpdated(TagsUpdated),
    #[serde(rename = "tag:usage_updated", rename_all = "camelCase")]
    TagUsageUpdated {
        tag_ids: Vec<String>,
        action: UsageAction,
    },
    #[serde(rename = "tags:synced")]
    TagsSynced { action: SyncAction, tag: Tag },
    #[serde(rename = "data:loaded")]
    DataLoaded,
    #[serde(rename = "data:imported")]
    DataImported,
    #[serde(rename = "tags:integrity_issues")]
    IntegrityIssues(IntegrityReport),
    #[serde(rename = "tags:force_refresh")]
    ForceRefresh,
    #[serde(rename = "tags:sync_started")]
    SyncStarted,
    #[serde(rename = "tags:sync_completed")]
    SyncCompleted { at: DateTime<Utc> },
    #[serde(rename = "tags:sync_failed")]
    SyncFailed { message: String },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::TagCreated(_) => Topic::TagCreated,
            Event::TagUpdated(_) => Topic::TagUpdated,
            Event::TagDeleted(_) => Topic::TagDeleted,
            Event::TaskTagsUpdated(_) => Topic::TaskTagsUpdated,
            Event::GoalTagsUpdated(_) => Topic::GoalTagsUpdated,
            Event::TagUsageUpdated { .. } => Topic::TagUsageUpdated,
            Event::TagsSynced { .. } => Topic::TagsSynced,
            Event::DataLoaded => Topic::DataLoaded,
            Event::DataImported => Topic::DataImported,
            Event::IntegrityIssues(_) => Topic::IntegrityIssues,
            Event::ForceRefresh => Topic::ForceRefresh,
            Event::SyncStarted => Topic::SyncStarted,
            Event::SyncCompleted { .. } => Topic::SyncCompleted,
            Event::SyncFailed { .. } => Topic::SyncFailed,
        }
    }
}

/// One entry of the bus history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub topic: Topic,
    pub at: DateTime<Utc>,
    pub delivered_to: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub subscribers: usize,
    /// Subscribers per topic; wildcard subscribers are listed under `*`
    pub by_topic: BTreeMap<String, usize>,
    pub history_len: usize,
    pub emitted_total: u64,
}

struct Subscriber {
    id: u64,
    /// Empty means every topic
    topics: Vec<Topic>,
    once: bool,
    tx: Sender<Event>,
}

impl Subscriber {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    history: VecDeque<HistoryEntry>,
    emitted_total: u64,
}

/// Publish/subscribe hub with deferred delivery.
///
/// `emit` only enqueues onto each matching subscriber's channel; nothing a
/// subscriber does runs until it drains its `Subscription`. Clones share the
/// same hub.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Receiving end of a subscription
pub struct Subscription {
    id: u64,
    rx: Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the next queued event, if any.
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Take every queued event in emission order.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(evt) = self.rx.try_recv() {
            events.push(evt);
        }
        events
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topics`; an empty slice subscribes to everything.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.add_subscriber(topics, false)
    }

    /// Like `subscribe`, but the subscription is dropped after its first event.
    pub fn subscribe_once(&self, topics: &[Topic]) -> Subscription {
        self.add_subscriber(topics, true)
    }

    fn add_subscriber(&self, topics: &[Topic], once: bool) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(Subscriber {
            id,
            topics: topics.to_vec(),
            once,
            tx,
        });
        Subscription { id, rx }
    }

    /// Remove a subscription. Events already queued stay readable.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != subscription.id);
        inner.subscribers.len() != before
    }

    /// Queue `event` for every subscriber of its topic. Returns the number
    /// of subscribers it was queued for.
    pub fn emit(&self, event: Event) -> usize {
        let topic = event.topic();
        let mut inner = self.lock();

        let mut delivered = 0;
        inner.subscribers.retain(|sub| {
            if !sub.wants(topic) {
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    !sub.once
                }
                // receiver dropped
                Err(_) => false,
            }
        });

        inner.emitted_total += 1;
        inner.history.push_back(HistoryEntry {
            topic,
            at: Utc::now(),
            delivered_to: delivered,
        });
        while inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }

        tracing::debug!(topic = %topic, delivered, "event emitted");
        delivered
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn stats(&self) -> EventStats {
        let inner = self.lock();
        let mut by_topic: BTreeMap<String, usize> = BTreeMap::new();
        for sub in &inner.subscribers {
            if sub.topics.is_empty() {
                *by_topic.entry("*".to_string()).or_default() += 1;
            }
            for topic in &sub.topics {
                *by_topic.entry(topic.as_str().to_string()).or_default() += 1;
            }
        }
        EventStats {
            subscribers: inner.subscribers.len(),
            by_topic,
            history_len: inner.history.len(),
            emitted_total: inner.emitted_total,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
