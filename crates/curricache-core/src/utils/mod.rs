//! Utility functions for display formatting.

pub mod format;

pub use format::{format_age, progress_bar, truncate};
