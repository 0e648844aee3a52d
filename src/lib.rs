//! Learning progression core: lesson ordering within modules, assessment
//! attempt lifecycle, and the course completion view.

pub mod attempts;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod ordering;
pub mod progress;
pub mod retry;
pub mod routes;
pub mod store;

pub use attempts::{AttemptManager, StartedAttempt};
pub use error::{ProgressionError, StoreError};
pub use ordering::OrderMaintainer;
pub use progress::{CourseProgress, ProgressAggregator};
