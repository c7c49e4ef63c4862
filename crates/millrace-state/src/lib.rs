//! Persistent state for the millrace pipeline engine.
//!
//! Two stores live here: the [`MetaStore`] trait with its `SQLite`
//! implementation (steps, resources, tasks) and the content-addressed
//! [`ObjectStore`] holding artifact bytes. A pipeline directory owns one
//! of each, side by side.

#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

pub mod backend;
pub mod error;
pub mod objects;
pub mod sqlite;

// Top-level re-exports for convenience.
pub use backend::MetaStore;
pub use error::StateError;
pub use objects::{sha256_hex, ObjectStore};
pub use sqlite::SqliteMetaStore;

/// Common imports for typical usage.
///
/// ```
/// use millrace_state::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backend::MetaStore;
    pub use crate::error::{Result, StateError};
    pub use crate::objects::{sha256_hex, ObjectStore};
    pub use crate::sqlite::SqliteMetaStore;
    pub use millrace_types::model::{PipelineStatus, Resource, Step, StepDef, Task};
}
