use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::{Event, EventBus, Subscription, SyncAction, Topic, UsageAction};
use crate::model::config::SyncConfig;
use crate::tags::error::TagError;
use crate::tags::integrity::IntegrityReport;
use crate::tags::manager::{CleanupReport, TagManager, UsageRecount};

const TOPICS: [Topic; 7] = [
    Topic::TagCreated,
    Topic::TagUpdated,
    Topic::TagDeleted,
    Topic::TaskTagsUpdated,
    Topic::GoalTagsUpdated,
    Topic::DataLoaded,
    Topic::DataImported,
];

/// What one periodic sweep did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub integrity: IntegrityReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
    pub recount: UsageRecount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub tags: usize,
    pub at: DateTime<Utc>,
    pub sweep: SweepReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_enabled: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub auto_sync: bool,
    pub cross_tab_sync: bool,
}

/// Background reconciliation driver.
///
/// Reacts to bus events on `pump`, runs the integrity sweep on `tick`, and
/// reloads the document when another process rewrites it. All repair work
/// is delegated to `TagManager`; every step is idempotent, so a sweep may
/// land between any two user mutations.
pub struct TagSync {
    config: SyncConfig,
    enabled: bool,
    bus: EventBus,
    events: Subscription,
    last_sweep: Option<Instant>,
    last_sync_time: Option<DateTime<Utc>>,
}

impl TagSync {
    pub fn new(config: SyncConfig, bus: &EventBus) -> Self {
        TagSync {
            config,
            enabled: true,
            bus: bus.clone(),
            events: bus.subscribe(&TOPICS),
            last_sweep: None,
            last_sync_time: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Handle every queued event. A failing event is logged and the rest
    /// are still handled; the first failure is returned once the queue is
    /// empty. Returns how many were handled.
    pub fn pump(&mut self, manager: &mut TagManager) -> Result<usize, TagError> {
        let events = self.events.drain();
        if !self.enabled {
            return Ok(0);
        }
        let count = events.len();
        let mut first_error = None;
        for event in events {
            let topic = event.topic();
            if let Err(e) = self.handle(manager, event) {
                tracing::error!(topic = ?topic, error = %e, "event handler failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    fn handle(&mut self, manager: &mut TagManager, event: Event) -> Result<(), TagError> {
        match event {
            Event::TagCreated(tag) => {
                self.bus.emit(Event::TagsSynced {
                    action: SyncAction::Created,
                    tag,
                });
            }
            Event::TagUpdated(tag) => {
                self.bus.emit(Event::TagsSynced {
                    action: SyncAction::Updated,
                    tag,
                });
            }
            Event::TagDeleted(tag) => {
                self.bus.emit(Event::TagsSynced {
                    action: SyncAction::Deleted,
                    tag,
                });
            }
            Event::TaskTagsUpdated(change) | Event::GoalTagsUpdated(change) => {
                let (tag_ids, action) = if !change.added_tags.is_empty() {
                    (change.added_tags, UsageAction::Added)
                } else if !change.removed_tags.is_empty() {
                    (change.removed_tags, UsageAction::Removed)
                } else {
                    return Ok(());
                };
                self.bus.emit(Event::TagUsageUpdated { tag_ids, action });
                // a recount converges no matter how many times it runs
                manager.recalculate_usage_counts()?;
            }
            Event::DataLoaded => {
                let report = manager.validate_data_integrity()?;
                if !report.is_valid {
                    tracing::warn!(issues = report.issues.len(), "integrity issues after load");
                    self.bus.emit(Event::IntegrityIssues(report));
                }
            }
            Event::DataImported => {
                tracing::info!("data imported, forcing refresh");
                self.force_refresh(manager)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Run the sweep if enabled and the interval has elapsed since the last
    /// one. The first call only starts the clock.
    pub fn tick(&mut self, manager: &mut TagManager, now: Instant) -> Result<Option<SweepReport>, TagError> {
        if !self.enabled || !self.config.auto_sync {
            return Ok(None);
        }
        let due = match self.last_sweep {
            None => {
                self.last_sweep = Some(now);
                false
            }
            Some(last) => now.saturating_duration_since(last) >= self.interval(),
        };
        if !due {
            return Ok(None);
        }
        self.last_sweep = Some(now);
        self.sweep(manager).map(Some)
    }

    /// Integrity check, orphan cleanup when problems were found, then a
    /// usage recount.
    pub fn sweep(&mut self, manager: &mut TagManager) -> Result<SweepReport, TagError> {
        let integrity = manager.validate_data_integrity()?;
        let cleanup = if !integrity.is_valid {
            tracing::info!(issues = integrity.issues.len(), "sweep found issues, cleaning up");
            Some(manager.cleanup_orphaned_tags()?)
        } else {
            None
        };
        let recount = manager.recalculate_usage_counts()?;
        Ok(SweepReport {
            integrity,
            cleanup,
            recount,
        })
    }

    /// React to a storage-changed notification for `key`.
    ///
    /// Other keys, and changes that match what this process last wrote, are
    /// ignored. Otherwise the whole document is reloaded; the other writer
    /// wins. Returns whether a reload happened.
    pub fn on_storage_changed(&mut self, manager: &mut TagManager, key: &str) -> Result<bool, TagError> {
        if !self.enabled || !self.config.cross_tab_sync || !self.config.storage_event_sync {
            return Ok(false);
        }
        if key != manager.store().key() {
            return Ok(false);
        }
        let current = manager.store().raw_blob()?;
        if current.is_some() && current.as_deref() == manager.store().last_persisted() {
            return Ok(false);
        }
        tracing::info!(key, "document changed by another writer, reloading");
        self.force_refresh(manager)?;
        Ok(true)
    }

    /// Manual sync: a full sweep bracketed by started/completed (or failed)
    /// events.
    pub fn sync(&mut self, manager: &mut TagManager) -> Result<SyncOutcome, TagError> {
        self.bus.emit(Event::SyncStarted);
        match self.sweep(manager) {
            Ok(sweep) => {
                let at = Utc::now();
                self.last_sync_time = Some(at);
                self.bus.emit(Event::SyncCompleted { at });
                Ok(SyncOutcome {
                    tags: manager.all_tags().len(),
                    at,
                    sweep,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "sync failed");
                self.bus.emit(Event::SyncFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drop every cache, announce the refresh and reload the document.
    pub fn force_refresh(&mut self, manager: &mut TagManager) -> Result<(), TagError> {
        manager.invalidate_cache();
        self.bus.emit(Event::ForceRefresh);
        manager.store_mut().load()?;
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.last_sweep = None;
        }
        self.enabled = enabled;
        tracing::info!(enabled, "tag sync toggled");
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_enabled: self.enabled,
            last_sync_time: self.last_sync_time,
            auto_sync: self.config.auto_sync,
            cross_tab_sync: self.config.cross_tab_sync,
        }
    }
}
