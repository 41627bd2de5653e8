//! Shared types for the FlowStudio platform
//!
//! Identifiers, billing time windows, and the bounded-retry helper used
//! across the access platform crates.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod retry;
pub mod time;

use uuid::Uuid;

pub use retry::{retry_transient, RetryPolicy};
pub use time::TimeWindow;

/// Account ID
pub type AccountId = Uuid;

/// Provider event ID
pub type EventId = String;
