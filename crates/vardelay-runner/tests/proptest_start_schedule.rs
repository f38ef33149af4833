//! Property-based tests for grouping flows into start steps.

use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;
use vardelay_runner::flow::{Direction, FlowSpec, LinkShape, Role};
use vardelay_runner::start_schedule::StartSchedule;

fn flows(mut starts: Vec<u64>) -> Vec<FlowSpec> {
    starts.sort_unstable();
    let link = LinkShape {
        rate_mbit: 10.0,
        delay_us: 0,
        queue_packets: 1000,
    };
    starts
        .into_iter()
        .enumerate()
        .map(|(id, start_secs)| FlowSpec {
            id,
            scheme: "cubic".into(),
            direction: Direction::Leftward,
            left: link.clone(),
            right: link.clone(),
            start_secs,
            runs_first: Role::Receiver,
        })
        .collect()
}

proptest! {
    #[test]
    fn steps_are_disjoint_and_cover_every_flow(starts in prop::collection::vec(0u64..30, 1..200)) {
        let flows = flows(starts);
        let schedule = StartSchedule::from_flows(&flows).unwrap();

        let mut seen = HashSet::new();
        for step in schedule.steps() {
            for id in &step.flows {
                prop_assert!(seen.insert(*id), "flow {} scheduled twice", id);
                prop_assert_eq!(Duration::from_secs(flows[*id].start_secs), step.offset);
            }
        }
        prop_assert_eq!(seen.len(), flows.len());
        prop_assert_eq!(schedule.flow_count(), flows.len());
    }

    #[test]
    fn offsets_strictly_increase_from_zero(starts in prop::collection::vec(0u64..30, 1..200)) {
        let schedule = StartSchedule::from_flows(&flows(starts)).unwrap();
        prop_assert_eq!(schedule.steps()[0].offset, Duration::ZERO);
        for pair in schedule.steps().windows(2) {
            prop_assert!(pair[0].offset < pair[1].offset);
        }
        let waited: Duration = schedule.waits().iter().sum();
        prop_assert_eq!(waited, schedule.steps().last().unwrap().offset);
    }

    #[test]
    fn any_descent_is_rejected(
        starts in prop::collection::vec(0u64..30, 2..50),
        at in any::<prop::sample::Index>(),
    ) {
        let mut flows = flows(starts);
        let at = at.index(flows.len() - 1) + 1;
        let before = flows[at - 1].start_secs;
        prop_assume!(before > 0);
        flows[at].start_secs = before - 1;
        prop_assert!(StartSchedule::from_flows(&flows).is_err());
    }
}
