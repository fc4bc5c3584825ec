use std::fmt;

/// Closed range `[first, last]` handed to the scan processor in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub first: u64,
    pub last: u64,
}

impl ScanWindow {
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    pub fn width(&self) -> u64 {
        self.last.saturating_sub(self.first) + 1
    }
}

impl fmt::Display for ScanWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

/// Backward walk from just below a frontier down to a target sequence.
///
/// Each window is at most `chunk` wide, directly below the previous one, and
/// the final window starts exactly at the target.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    target: u64,
    chunk: u64,
    next_last: Option<u64>,
}

impl WindowPlan {
    pub fn new(frontier: u64, target: u64, chunk: u64) -> Self {
        let next_last = (frontier > target).then(|| frontier - 1);
        Self {
            target,
            chunk: chunk.max(1),
            next_last,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Number of windows a full walk produces.
    pub fn window_count(frontier: u64, target: u64, chunk: u64) -> u64 {
        frontier.saturating_sub(target).div_ceil(chunk.max(1))
    }

    /// Messages still queued below `window` once it is done.
    pub fn remaining_after(&self, window: &ScanWindow) -> u64 {
        window.first.saturating_sub(self.target)
    }
}

impl Iterator for WindowPlan {
    type Item = ScanWindow;

    fn next(&mut self) -> Option<ScanWindow> {
        let last = self.next_last?;
        let first = last.saturating_sub(self.chunk - 1).max(self.target);
        self.next_last = (first > self.target).then(|| first - 1);
        Some(ScanWindow { first, last })
    }
}
