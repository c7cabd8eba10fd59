use crate::model::*;

/// Fixed recurrence step.
pub const WEEK_MS: Ms = 7 * 24 * 60 * 60 * 1000;

/// Expand a seed into `repeat_count + 1` weekly instances, seed first.
/// Every instance keeps the seed's exact duration.
pub fn expand_weekly(seed: Span, repeat_count: u32) -> Vec<Span> {
    (0..=repeat_count as Ms)
        .map(|k| seed.shifted(k * WEEK_MS))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const H: Ms = 3_600_000;

    #[test]
    fn zero_repeats_is_just_the_seed() {
        let seed = Span::new(9 * H, 10 * H);
        assert_eq!(expand_weekly(seed, 0), vec![seed]);
    }

    #[test]
    fn three_repeats_spaced_a_week_apart() {
        let t = 1_700_000_000_000;
        let instances = expand_weekly(Span::new(t, t + H), 3);
        assert_eq!(
            instances,
            vec![
                Span::new(t, t + H),
                Span::new(t + WEEK_MS, t + WEEK_MS + H),
                Span::new(t + 2 * WEEK_MS, t + 2 * WEEK_MS + H),
                Span::new(t + 3 * WEEK_MS, t + 3 * WEEK_MS + H),
            ]
        );
    }

    proptest! {
        #[test]
        fn expansion_preserves_duration_and_count(
            start in 0i64..2_000_000_000_000,
            len in 1i64..WEEK_MS,
            repeat in 0u32..60,
        ) {
            let seed = Span::new(start, start + len);
            let instances = expand_weekly(seed, repeat);
            prop_assert_eq!(instances.len(), repeat as usize + 1);
            prop_assert_eq!(instances[0], seed);
            for (k, s) in instances.iter().enumerate() {
                prop_assert_eq!(s.duration_ms(), len);
                prop_assert_eq!(s.start - seed.start, k as Ms * WEEK_MS);
            }
        }
    }
}
