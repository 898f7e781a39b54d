//! Property tests for the timing wheel: alarms fire exactly once, never
//! early, in time order, and removed alarms never fire.

mod common;

use common::init_test_logging;
use deferred_kernel::Time;
use deferred_kernel::time::{TimingWheel, WheelConfig};
use proptest::prelude::*;

use std::collections::BTreeMap;
use std::time::Duration;

fn small_wheel() -> TimingWheel<usize> {
    let config = WheelConfig::new()
        .alarm_precision(Duration::from_nanos(4))
        .level_bits(vec![3, 3, 3]);

    TimingWheel::new(config, Time::ZERO).expect("valid wheel config")
}

fn arb_alarms() -> impl Strategy<Value = Vec<(u64, bool)>> {
    prop::collection::vec((0u64..2000, any::<bool>()), 1..48)
}

fn arb_steps() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..300, 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn alarms_fire_once_in_order_and_never_early(alarms in arb_alarms(), steps in arb_steps()) {
        init_test_logging();
        let mut wheel = small_wheel();
        prop_assert_eq!(wheel.max_allowed_alarm_time(), Time::from_nanos(2047));

        let mut pending = BTreeMap::new();
        let mut handles = Vec::new();
        for (id, &(at, remove)) in alarms.iter().enumerate() {
            let alarm = wheel.add(Time::from_nanos(at), id).expect("alarm within range");
            handles.push((alarm, remove));
            pending.insert(id, Time::from_nanos(at));
        }

        for (id, (alarm, remove)) in handles.iter().enumerate() {
            if *remove {
                prop_assert_eq!(wheel.remove(alarm), Some(id));
                prop_assert!(!wheel.mem(alarm));
                pending.remove(&id);
            }
        }
        prop_assert_eq!(wheel.len(), pending.len());

        let mut now = 0;
        let final_step = 3000u64.saturating_sub(steps.iter().sum());
        for step in steps.iter().copied().chain(std::iter::once(final_step.max(1))) {
            now += step;
            let mut fired = Vec::new();
            wheel.advance_clock(Time::from_nanos(now), |at, id| fired.push((at, id)));
            wheel.fire_past_alarms(|at, id| fired.push((at, id)));

            for window in fired.windows(2) {
                prop_assert!(window[0].0 <= window[1].0, "fired out of order: {:?}", fired);
            }

            for (at, id) in fired {
                prop_assert!(at.as_nanos() <= now, "alarm at {} fired at {}", at, now);
                prop_assert_eq!(pending.remove(&id), Some(at), "alarm {} fired twice or after removal", id);
            }

            prop_assert_eq!(wheel.next_alarm_fires_at(), pending.values().min().copied());
        }

        prop_assert!(pending.is_empty(), "never fired: {:?}", pending);
        prop_assert!(wheel.is_empty());
    }

    #[test]
    fn alarms_beyond_range_are_rejected(offset in 1u64..10_000) {
        let mut wheel = small_wheel();
        let max = wheel.max_allowed_alarm_time();

        let too_far = Time::from_nanos(max.as_nanos() + offset);
        prop_assert!(wheel.add(too_far, 0).is_err());
        prop_assert!(wheel.is_empty());
    }
}
