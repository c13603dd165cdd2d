//! Domain model and pure logic for runs, playbooks and their checklists.

use time::OffsetDateTime;
use ulid::Ulid;

pub mod checklist;
pub mod condition;
pub mod filter;
pub mod kv;
pub mod model;
pub mod position;
pub mod search;
pub mod store;

pub use condition::{
    Comparison, Condition, ConditionExpr, ConditionFilterOptions, PropertyField,
    PropertyFieldType, PropertyValue,
};
pub use filter::{
    FilterOptions, ListResults, Paging, PlaybookFilterOptions, PlaybookSortField, RequesterInfo,
    RequesterRole, SortDirection, SortField,
};
pub use kv::{KvStore, MemoryKvStore};
pub use model::{
    Category, CategoryItem, CategoryItemType, Checklist, ChecklistItem, ChecklistItemState,
    Playbook, Run, RunStatus, StatusPost, TimelineEvent, TimelineEventType,
};
pub use store::{CategoryStore, ConditionStore, PlaybookStore, RunStore};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RunbookError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported sort parameter '{0}'")]
    UnsupportedSortField(String),
    #[error("unsupported direction parameter '{0}'")]
    UnsupportedDirection(String),
    #[error("malformed position data: {0}")]
    MalformedPositionData(String),
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),
}

/// How a failure should be presented by a command or HTTP layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorClass {
    NotFound,
    BadRequest,
    DataIntegrity,
    Internal,
}

impl ErrorClass {
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::DataIntegrity | Self::Internal => 500,
        }
    }

    /// Message safe to show to an end user. Caller-input errors name the bad
    /// value; storage failures stay generic.
    #[must_use]
    pub fn public_message(self, err: &anyhow::Error) -> String {
        match (self, sentinel(err)) {
            (Self::NotFound | Self::BadRequest, Some(sentinel)) => sentinel.to_string(),
            _ => "internal error".to_string(),
        }
    }
}

impl RunbookError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::InvalidArgument(_)
            | Self::UnsupportedSortField(_)
            | Self::UnsupportedDirection(_) => ErrorClass::BadRequest,
            Self::MalformedPositionData(_) | Self::DuplicateEntry(_) => ErrorClass::DataIntegrity,
        }
    }
}

/// First sentinel found in the error's cause chain.
#[must_use]
pub fn sentinel(err: &anyhow::Error) -> Option<&RunbookError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RunbookError>())
}

#[must_use]
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    sentinel(err).map_or(ErrorClass::Internal, RunbookError::class)
}

#[must_use]
pub fn new_id() -> String {
    Ulid::new().to_string().to_ascii_lowercase()
}

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}
