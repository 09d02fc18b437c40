//! Property-based tests for the window splitter
//!
//! A simulated relay holds arbitrary timestamps (bursts in one second
//! included) and answers every window newest first, truncated at the cap.
//! Whatever the data, draining must terminate within the query bound, and an
//! item may only be missed inside a window that was itself queried, came back
//! full and is narrower than the floor.

use std::collections::HashSet;

use proptest::prelude::*;
use relaysync_core::{Timestamp, Window, WindowSplitter};

// ============================================================================
// Simulated relay
// ============================================================================

/// Items as (timestamp, index); the index makes items with equal
/// timestamps distinct
fn answer(items: &[(u64, usize)], window: Window, cap: usize) -> Vec<(u64, usize)> {
    let mut matching: Vec<(u64, usize)> = items
        .iter()
        .copied()
        .filter(|(ts, _)| window.contains(Timestamp(*ts)))
        .collect();
    matching.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    matching.truncate(cap);
    matching
}

struct Drained {
    queries: usize,
    queried: Vec<Window>,
    seen: HashSet<usize>,
    incomplete: Vec<Window>,
}

fn drain(items: &[(u64, usize)], range: Window, cap: usize, min_width: u64) -> Drained {
    let mut splitter = WindowSplitter::new(range, cap, min_width);
    let mut seen = HashSet::new();
    let mut queries = 0;
    let mut queried = Vec::new();

    while let Some(window) = splitter.next_window() {
        queries += 1;
        queried.push(window);
        let reply = answer(items, window, cap);
        let oldest = reply.iter().map(|(ts, _)| Timestamp(*ts)).min();
        seen.extend(reply.iter().map(|(_, i)| *i));
        splitter.resolve(window, reply.len(), oldest);
        assert!(queries <= 100_000, "splitter did not terminate");
    }

    Drained {
        queries,
        queried,
        seen,
        incomplete: splitter.possibly_incomplete().to_vec(),
    }
}

// ============================================================================
// Strategy Generators
// ============================================================================

const SINCE: u64 = 1_000_000;

/// Range width plus item offsets inside it
fn dataset_strategy() -> impl Strategy<Value = (u64, Vec<u64>)> {
    (0u64..600).prop_flat_map(|width| {
        let offsets = prop_oneof![
            // spread out
            3 => prop::collection::vec(0..=width, 0..300),
            // one hot second
            1 => (0..=width, 1usize..120).prop_map(|(at, n)| vec![at; n]),
        ];
        (Just(width), offsets)
    })
}

fn to_items(offsets: &[u64]) -> Vec<(u64, usize)> {
    offsets
        .iter()
        .enumerate()
        .map(|(i, off)| (SINCE + off, i))
        .collect()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Draining never issues more than 2 * (width / min_width + 1) queries
    #[test]
    fn drain_terminates_within_bound(
        (width, offsets) in dataset_strategy(),
        cap in 1usize..40,
        min_width in 1u64..30,
    ) {
        let range = Window::new(SINCE, SINCE + width);
        let result = drain(&to_items(&offsets), range, cap, min_width);
        prop_assert!(result.queries as u64 <= 2 * (range.width() / min_width + 1),
            "{} queries for width {} min_width {}", result.queries, range.width(), min_width);
    }

    /// An item is missed only inside a queried window narrower than the
    /// floor that holds at least `cap` items
    #[test]
    fn drain_misses_only_saturated_sub_floor_windows(
        (width, offsets) in dataset_strategy(),
        cap in 1usize..40,
        min_width in 1u64..30,
    ) {
        let items = to_items(&offsets);
        let range = Window::new(SINCE, SINCE + width);
        let result = drain(&items, range, cap, min_width);

        for window in &result.incomplete {
            prop_assert!(result.queried.contains(window), "{} flagged without a query", window);
            prop_assert!(window.width() < min_width);
            let inside = items.iter().filter(|(ts, _)| window.contains(Timestamp(*ts))).count();
            prop_assert!(inside >= cap);
        }
        for (ts, i) in &items {
            let flagged = result.incomplete.iter().any(|w| w.contains(Timestamp(*ts)));
            prop_assert!(result.seen.contains(i) || flagged,
                "item {} at +{} lost without being flagged", i, ts - SINCE);
        }
    }

    /// With a floor of one second, only a second holding at least `cap`
    /// items can ever be flagged
    #[test]
    fn unit_floor_flags_only_overfull_seconds(
        (width, offsets) in dataset_strategy(),
        cap in 1usize..40,
    ) {
        let items = to_items(&offsets);
        let range = Window::new(SINCE, SINCE + width);
        let result = drain(&items, range, cap, 1);

        for window in &result.incomplete {
            prop_assert_eq!(window.since, window.until);
            let in_second = items.iter().filter(|(ts, _)| *ts == window.since.0).count();
            prop_assert!(in_second >= cap);
        }
        if result.incomplete.is_empty() {
            prop_assert_eq!(result.seen.len(), items.len());
        }
    }

    /// A relay that never fills the cap is answered in one query
    #[test]
    fn sparse_range_takes_one_query(
        (width, offsets) in dataset_strategy(),
        min_width in 1u64..30,
    ) {
        let cap = offsets.len() + 1;
        let range = Window::new(SINCE, SINCE + width);
        let result = drain(&to_items(&offsets), range, cap, min_width);
        prop_assert_eq!(result.queries, 1);
        prop_assert_eq!(result.seen.len(), offsets.len());
        prop_assert!(result.incomplete.is_empty());
    }
}
