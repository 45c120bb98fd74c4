//! File system helpers: directory walking and the per-run staging area.

pub mod staging;
pub mod walker;
