//! Filesystem helpers: metadata capture and tree walking.

pub mod metadata;
pub mod walker;
