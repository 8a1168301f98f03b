//! Bounds the iteration history fed back into candidate generation.

use crate::result::IterationResult;

/// Number of most recent iterations kept by default.
pub const DEFAULT_HISTORY_WINDOW: usize = 3;

/// Returns the last `window` iterations, oldest first.
///
/// Earlier iterations are dropped rather than summarized. Called fresh each
/// iteration since the history only grows.
pub fn compact(history: &[IterationResult], window: usize) -> &[IterationResult] {
    let start = history.len().saturating_sub(window);
    &history[start..]
}
