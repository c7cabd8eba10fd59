use crate::model::*;

// ── Interval arithmetic ───────────────────────────────────────────

/// Half-open overlap test: `[a_start, a_end)` against `[b_start, b_end)`.
/// Touching endpoints do not overlap. Callers guarantee `start < end`.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && a_end > b_start
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Collapse a set of events into the disjoint blocks during which their owner is busy.
pub fn busy_blocks(events: &[ScheduledEvent]) -> Vec<Span> {
    let mut spans: Vec<Span> = events.iter().map(|e| e.span).collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn span_strategy() -> impl Strategy<Value = Span> {
        (-1_000_000i64..1_000_000, 1i64..100_000).prop_map(|(start, len)| Span::new(start, start + len))
    }

    #[test]
    fn touching_intervals_do_not_overlap() {
        assert!(!overlaps(0, 10, 10, 20));
        assert!(!overlaps(10, 20, 0, 10));
    }

    #[test]
    fn nested_interval_overlaps() {
        assert!(overlaps(0, 100, 40, 60));
        assert!(overlaps(40, 60, 0, 100));
    }

    #[test]
    fn single_ms_overlap() {
        assert!(overlaps(100, 201, 200, 300));
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric(a in span_strategy(), b in span_strategy()) {
            prop_assert_eq!(
                overlaps(a.start, a.end, b.start, b.end),
                overlaps(b.start, b.end, a.start, a.end)
            );
        }

        #[test]
        fn interval_overlaps_itself(a in span_strategy()) {
            prop_assert!(overlaps(a.start, a.end, a.start, a.end));
        }

        #[test]
        fn merged_blocks_are_disjoint(spans in proptest::collection::vec(span_strategy(), 0..20)) {
            let mut sorted = spans.clone();
            sorted.sort_by_key(|s| s.start);
            let merged = merge_overlapping(&sorted);
            for pair in merged.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
            for s in &spans {
                prop_assert!(merged.iter().any(|m| m.start <= s.start && s.end <= m.end));
            }
        }
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }

    #[test]
    fn busy_blocks_sorts_before_merging() {
        let gid = Ulid::new();
        let mk = |start, end| ScheduledEvent {
            id: Ulid::new(),
            group_id: gid,
            title: "x".into(),
            span: Span::new(start, end),
            creator: Ulid::new(),
            series_id: None,
            repeat_count: 0,
        };
        let events = vec![mk(10 * H, 11 * H), mk(9 * H, 10 * H), mk(13 * H, 14 * H)];
        assert_eq!(
            busy_blocks(&events),
            vec![Span::new(9 * H, 11 * H), Span::new(13 * H, 14 * H)]
        );
    }
}
