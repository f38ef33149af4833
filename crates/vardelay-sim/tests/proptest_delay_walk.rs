//! Property-based tests for the central link's delay walk and the address
//! allocator.

use std::net::Ipv4Addr;

use proptest::prelude::*;
use vardelay_sim::address::AddressAllocator;
use vardelay_sim::{DelaySchedule, DelayWalkConfig, SimError};

// ─── Delay walk ─────────────────────────────────────────────────────────────

/// Walk parameters where `base` always has at least one feasible move:
/// `max` spans at least two steps.
fn feasible_walk() -> impl Strategy<Value = DelayWalkConfig> {
    (1u64..5_000, 2u64..200, any::<u64>())
        .prop_flat_map(|(step_us, steps_to_max, seed)| {
            let max_delay_us = step_us * steps_to_max;
            (
                0..=max_delay_us,
                Just(step_us),
                Just(max_delay_us),
                1_000u64..2_000_000,
                1u64..60_000_000,
                Just(seed),
            )
        })
        .prop_map(
            |(base_us, step_us, max_delay_us, delta_us, runtime_us, seed)| DelayWalkConfig {
                base_us,
                delta_us,
                step_us,
                max_delay_us,
                runtime_us,
                seed,
            },
        )
}

proptest! {
    #[test]
    fn walk_stays_within_bounds(cfg in feasible_walk()) {
        let schedule = DelaySchedule::generate(&cfg).unwrap();
        for step in schedule.steps() {
            prop_assert!(step.delay_us <= cfg.max_delay_us);
        }
    }

    #[test]
    fn walk_moves_one_step_at_a_time(cfg in feasible_walk()) {
        let schedule = DelaySchedule::generate(&cfg).unwrap();
        prop_assert_eq!(schedule.first_delay_us(), cfg.base_us);
        for pair in schedule.steps().windows(2) {
            prop_assert_eq!(pair[0].delay_us.abs_diff(pair[1].delay_us), cfg.step_us);
        }
    }

    #[test]
    fn intervals_cover_runtime_exactly(cfg in feasible_walk()) {
        let schedule = DelaySchedule::generate(&cfg).unwrap();
        prop_assert_eq!(schedule.total().as_micros(), u128::from(cfg.runtime_us));

        let (last, full) = schedule.steps().split_last().unwrap();
        for step in full {
            prop_assert_eq!(step.interval.as_micros(), u128::from(cfg.delta_us));
        }
        prop_assert!(last.interval.as_micros() <= u128::from(cfg.delta_us));
        prop_assert!(!last.interval.is_zero());
    }

    #[test]
    fn walk_is_reproducible(cfg in feasible_walk()) {
        let a = DelaySchedule::generate(&cfg).unwrap();
        let b = DelaySchedule::generate(&cfg).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn step_wider_than_both_bounds_is_rejected(
        base_us in 0u64..1_000,
        excess in 1u64..1_000,
    ) {
        let max_delay_us = 1_000;
        let cfg = DelayWalkConfig {
            base_us,
            delta_us: 1_000_000,
            step_us: max_delay_us + excess,
            max_delay_us,
            runtime_us: 5_000_000,
            seed: 1,
        };
        let is_infeasible = matches!(
            DelaySchedule::generate(&cfg),
            Err(SimError::InfeasibleDelayWalk { .. })
        );
        prop_assert!(is_infeasible);
    }
}

// ─── Address allocation ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn allocator_never_repeats_a_subnet(prefix in 20u8..=28, take in 1usize..64) {
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(10, 64, 0, 0), prefix).unwrap();
        let take = take.min(alloc.subnet_count() as usize);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..take {
            let subnet = alloc.next_subnet().unwrap();
            prop_assert!(seen.insert(subnet.network()));
        }
    }

    #[test]
    fn capacity_check_matches_subnet_count(prefix in 16u8..=29, flows in 0usize..10_000) {
        let alloc = AddressAllocator::new(Ipv4Addr::new(11, 0, 0, 0), prefix).unwrap();
        let fits = 2 * flows < alloc.subnet_count() as usize;
        prop_assert_eq!(alloc.check_capacity(flows).is_ok(), fits);
    }
}
