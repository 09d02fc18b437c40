//! Time-window pagination over result-capped relays
//!
//! A relay answers a bounded query with at most `cap` items, newest first.
//! When a reply comes back full the range is not proven complete, so the
//! window is replaced by a narrower one ending at the oldest timestamp
//! returned and pushed back onto the stack. Windows are resolved depth-first
//! until the stack drains, at which point the whole target range has been
//! delivered.
//!
//! ## Boundary rule
//!
//! A full reply contains every item newer than its oldest timestamp `o`, but
//! possibly only some of the items stamped exactly `o`. The replacement
//! window therefore ends *at* `o` (inclusive), so the boundary second is
//! queried again. Items at `o` that were already delivered are delivered a
//! second time and absorbed by the idempotent sink.
//!
//! ## Floor
//!
//! A window at least `min_width` wide is never given up. When its reply is
//! full, the replacement lowers `until` by at least `min_width` seconds; if
//! the oldest returned item lies above that ceiling, the seconds between the
//! ceiling and the oldest item are pushed as a separate gap window. Gap
//! windows are narrower than the floor, so each costs one query. Only a
//! window narrower than `min_width` whose own reply is full is accepted and
//! recorded as possibly incomplete. A range of width `w` therefore takes at
//! most `2 * (w / min_width + 1)` queries while timestamps are available.

use tracing::warn;

use crate::types::{Timestamp, Window};

/// LIFO collection of windows still owed for one relay this cycle
#[derive(Debug, Clone, Default)]
pub struct WindowStack {
    pending: Vec<Window>,
}

impl WindowStack {
    pub fn new(initial: Window) -> Self {
        let mut stack = Self::default();
        stack.push(initial);
        stack
    }

    /// Empty windows are never pushed
    pub fn push(&mut self, window: Window) {
        if !window.is_empty() {
            self.pending.push(window);
        }
    }

    pub fn pop(&mut self) -> Option<Window> {
        self.pending.pop()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending window, returning how many were discarded
    pub fn abandon(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

/// What happened to a window after its query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Reply was below the cap; the window is proven complete
    Covered,
    /// Reply was full; the window was replaced by narrower ones
    Narrowed(Vec<Window>),
    /// Reply was full and the window could not be narrowed further
    AcceptedIncomplete(Window),
}

/// Drives the stack of windows for one relay
#[derive(Debug, Clone)]
pub struct WindowSplitter {
    stack: WindowStack,
    cap: usize,
    min_width: u64,
    incomplete: Vec<Window>,
    resolved: usize,
}

impl WindowSplitter {
    /// Start with a single window covering `range`
    ///
    /// `cap` and `min_width` are clamped to at least one.
    pub fn new(range: Window, cap: usize, min_width: u64) -> Self {
        Self {
            stack: WindowStack::new(range),
            cap: cap.max(1),
            min_width: min_width.max(1),
            incomplete: Vec::new(),
            resolved: 0,
        }
    }

    /// Pop the next window to query
    pub fn next_window(&mut self) -> Option<Window> {
        self.stack.pop()
    }

    /// Record the outcome of querying `window`
    ///
    /// `count` is the number of items the relay sent, `oldest` the smallest
    /// timestamp among the items that could be parsed.
    pub fn resolve(&mut self, window: Window, count: usize, oldest: Option<Timestamp>) -> Resolution {
        self.resolved += 1;

        if count < self.cap {
            return Resolution::Covered;
        }

        if window.width() < self.min_width {
            return self.accept_incomplete(window);
        }

        let Some(oldest) = oldest else {
            return self.bisect(window);
        };
        let oldest = oldest.clamp(window.since, window.until);

        // Width is at least `min_width`, so the ceiling stays inside the window.
        let ceiling = window.until.0 - self.min_width;
        if oldest.0 <= ceiling {
            let replacement = Window::new(window.since, oldest);
            self.stack.push(replacement);
            return Resolution::Narrowed(vec![replacement]);
        }

        // The oldest item sits within `min_width` of the top. Query the gap
        // above the ceiling on its own, then continue below it.
        let lower = Window::new(window.since, ceiling);
        let gap = Window::new(ceiling + 1, oldest);
        self.stack.push(lower);
        self.stack.push(gap);
        Resolution::Narrowed(vec![gap, lower])
    }

    /// Full reply with no usable timestamps: split the window in half
    fn bisect(&mut self, window: Window) -> Resolution {
        let mid = window.since.0 + window.width() / 2;
        let upper = Window::new(mid + 1, window.until);
        let lower = Window::new(window.since, mid);
        self.stack.push(upper);
        self.stack.push(lower);
        Resolution::Narrowed(vec![lower, upper])
    }

    fn accept_incomplete(&mut self, window: Window) -> Resolution {
        self.record_incomplete(window);
        Resolution::AcceptedIncomplete(window)
    }

    fn record_incomplete(&mut self, window: Window) {
        warn!(%window, cap = self.cap, "Window saturated below floor; accepting as possibly incomplete");
        self.incomplete.push(window);
    }

    /// True once every window has been resolved
    pub fn is_drained(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.stack.len()
    }

    /// Number of query results fed to `resolve`
    pub fn resolved(&self) -> usize {
        self.resolved
    }

    /// Spans accepted without proof of completeness
    pub fn possibly_incomplete(&self) -> &[Window] {
        &self.incomplete
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Discard all pending windows
    pub fn abandon(&mut self) -> usize {
        self.stack.abandon()
    }
}
