pub mod cache;
pub mod error;
pub mod input;
pub mod integrity;
pub mod manager;
pub mod sync;
pub mod usage;
pub mod validator;

pub use error::{ErrorCode, TagError};
pub use input::{InputKey, Suggestion, TagInput, TagSelection};
pub use manager::{DeleteOptions, TagManager, TagPatch};
pub use sync::{SyncStatus, TagSync};
pub use validator::TagDraft;
