pub mod config;
pub mod document;
mod lenient;
pub mod tag;
pub mod task;

pub use config::*;
pub use document::*;
pub use tag::*;
pub use task::*;
