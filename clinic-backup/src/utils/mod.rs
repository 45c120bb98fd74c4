//! Utility modules for the backup pipeline.

pub mod errors;
pub mod logger;

pub use errors::{BackendError, DumpError, PipelineError, Result};

/// Trimmed tail of a tool's output, at most `max` bytes plus an ellipsis.
pub fn tail_text(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
