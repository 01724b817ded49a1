use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::tag::Tag;
use crate::store::{LinkError, StoreError};
use crate::tags::usage::TagUsageInfo;

/// The closed set of failure kinds a tag operation can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    DuplicateTag,
    TagNotFound,
    TagInUse,
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::DuplicateTag => "DUPLICATE_TAG",
            ErrorCode::TagNotFound => "TAG_NOT_FOUND",
            ErrorCode::TagInUse => "TAG_IN_USE",
            ErrorCode::StorageError => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra context attached to some errors
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ErrorDetails {
    /// The tag a create/rename collided with
    ExistingTag { existing_tag: Box<Tag> },
    /// Who still references a tag that was asked to be deleted
    Usage { usage: TagUsageInfo },
    Messages { errors: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TagError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: DateTime<Utc>,
}

impl TagError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        TagError {
            code,
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(errors: Vec<String>) -> Self {
        TagError::new(ErrorCode::ValidationError, errors.join("; "))
            .with_details(ErrorDetails::Messages { errors })
    }

    pub fn duplicate(existing: &Tag) -> Self {
        TagError::new(
            ErrorCode::DuplicateTag,
            format!("tag \"{}\" already exists", existing.name),
        )
        .with_details(ErrorDetails::ExistingTag {
            existing_tag: Box::new(existing.clone()),
        })
    }

    pub fn not_found(tag_id: &str) -> Self {
        TagError::new(ErrorCode::TagNotFound, format!("tag not found: {}", tag_id))
    }

    pub fn in_use(tag: &Tag, usage: TagUsageInfo) -> Self {
        TagError::new(
            ErrorCode::TagInUse,
            format!(
                "tag \"{}\" is used by {} task(s) and {} goal(s)",
                tag.name, usage.task_count, usage.goal_count
            ),
        )
        .with_details(ErrorDetails::Usage { usage })
    }

    pub fn storage(message: impl Into<String>) -> Self {
        TagError::new(ErrorCode::StorageError, message)
    }

    /// The colliding tag of a `DUPLICATE_TAG` error
    pub fn existing_tag(&self) -> Option<&Tag> {
        match &self.details {
            Some(ErrorDetails::ExistingTag { existing_tag }) => Some(existing_tag.as_ref()),
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<&TagUsageInfo> {
        match &self.details {
            Some(ErrorDetails::Usage { usage }) => Some(usage),
            _ => None,
        }
    }
}

impl From<StoreError> for TagError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "storage failure");
        TagError::storage(err.to_string())
    }
}

impl From<LinkError> for TagError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::EmptyRequest
            | LinkError::TaskNotFound(_)
            | LinkError::GoalNotFound { .. }
            | LinkError::AlreadyAttached { .. }
            | LinkError::NotAttached { .. } => TagError::new(ErrorCode::ValidationError, err.to_string()),
            LinkError::NoValidTags { .. } => TagError::new(ErrorCode::TagNotFound, err.to_string()),
            LinkError::Store(e) => e.into(),
        }
    }
}
