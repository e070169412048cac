//! Property-based tests for the realization lifecycle.
//!
//! Random trigger sequences, legal or not, must never break the machine's
//! invariants.

use proptest::prelude::*;
use tokio::sync::mpsc;

use ensembler::*;

#[derive(Clone, Copy, Debug)]
enum Trigger {
    Submit,
    Accept,
    Start,
    Runend,
    Runfail,
    Submitfail,
    Validate,
    Invalidate,
    Dokill,
    Remove,
    VerifyKill,
    AckKillfailure,
    SomethingWentWrong,
}

fn arb_trigger() -> impl Strategy<Value = Trigger> {
    prop::sample::select(vec![
        Trigger::Submit,
        Trigger::Accept,
        Trigger::Start,
        Trigger::Runend,
        Trigger::Runfail,
        Trigger::Submitfail,
        Trigger::Validate,
        Trigger::Invalidate,
        Trigger::Dokill,
        Trigger::Remove,
        Trigger::VerifyKill,
        Trigger::AckKillfailure,
        Trigger::SomethingWentWrong,
    ])
}

/// Triggers that follow the happy path more often than chance would.
fn arb_biased_trigger() -> impl Strategy<Value = Trigger> {
    prop_oneof![
        3 => prop::sample::select(vec![
            Trigger::Submit,
            Trigger::Accept,
            Trigger::Start,
            Trigger::Runend,
            Trigger::Validate,
        ]),
        1 => arb_trigger(),
    ]
}

fn fire(
    machine: &mut RealizationStateMachine,
    trigger: Trigger,
) -> Result<RealizationState, StateTransitionError> {
    match trigger {
        Trigger::Submit => machine.submit(),
        Trigger::Accept => machine.accept(),
        Trigger::Start => machine.start(),
        Trigger::Runend => machine.runend(),
        Trigger::Runfail => machine.runfail(Some("exit 1".to_string())),
        Trigger::Submitfail => machine.submitfail(None),
        Trigger::Validate => machine.validate(),
        Trigger::Invalidate => machine.invalidate(Some("missing output".to_string())),
        Trigger::Dokill => machine.dokill(),
        Trigger::Remove => machine.remove(),
        Trigger::VerifyKill => machine.verify_kill(),
        Trigger::AckKillfailure => machine.ack_killfailure(None),
        Trigger::SomethingWentWrong => machine.something_went_wrong("inconsistent driver state"),
    }
}

fn waiting_machine(retries: u32) -> (RealizationStateMachine, mpsc::UnboundedReceiver<Transition>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let realization = Realization::new(0, "/tmp/ensembler-test/0").with_max_retries(retries);
    let mut machine = RealizationStateMachine::new(realization, tx);
    machine.allocate().unwrap();
    machine.activate().unwrap();
    (machine, rx)
}

proptest! {
    #[test]
    fn terminal_states_are_sticky(
        retries in 0u32..3,
        triggers in prop::collection::vec(arb_biased_trigger(), 1..30),
    ) {
        let (mut machine, _rx) = waiting_machine(retries);
        let mut terminal: Option<RealizationState> = None;

        for trigger in triggers {
            let result = fire(&mut machine, trigger);
            if let Some(state) = terminal {
                prop_assert!(result.is_err());
                prop_assert_eq!(machine.state(), state);
            } else if machine.state().is_terminal() {
                terminal = Some(machine.state());
                prop_assert!(machine.end_time().is_some());
            }
        }
    }

    #[test]
    fn rejected_trigger_fails_the_realization(
        triggers in prop::collection::vec(arb_trigger(), 1..20),
    ) {
        let (mut machine, _rx) = waiting_machine(1);
        for trigger in triggers {
            let was_terminal = machine.state().is_terminal();
            if let Err(err) = fire(&mut machine, trigger) {
                if !was_terminal {
                    prop_assert_eq!(machine.state(), RealizationState::Failed);
                    prop_assert!(machine.message().is_some());
                }
                prop_assert_eq!(err.iens, Iens(0));
            }
        }
    }

    #[test]
    fn only_observable_states_are_published(
        retries in 0u32..3,
        triggers in prop::collection::vec(arb_biased_trigger(), 1..30),
    ) {
        let (mut machine, mut rx) = waiting_machine(retries);
        for trigger in triggers {
            let _ = fire(&mut machine, trigger);
        }

        let mut last = None;
        while let Ok(transition) = rx.try_recv() {
            prop_assert!(transition.to.is_observable());
            if transition.to.is_lost() {
                prop_assert!(transition.at >= transition.start_time.unwrap_or(transition.at));
            }
            last = Some(transition.to);
        }
        if machine.state().is_observable() {
            prop_assert_eq!(last, Some(machine.state()));
        }
    }

    #[test]
    fn retry_budget_bounds_resubmissions(
        retries in 0u32..4,
        failures in 1usize..8,
    ) {
        let (mut machine, _rx) = waiting_machine(retries);
        machine.submit().unwrap();
        let mut attempts = 1u32;

        for _ in 0..failures {
            if machine.state() != RealizationState::Submitted {
                break;
            }
            machine.accept().unwrap();
            machine.start().unwrap();
            if machine.runfail(None).unwrap() == RealizationState::Submitted {
                attempts += 1;
            }
            prop_assert!(machine.retries_left() <= retries);
        }

        prop_assert!(attempts <= retries + 1);
        let expected = if failures as u32 > retries {
            RealizationState::Failed
        } else {
            RealizationState::Submitted
        };
        prop_assert_eq!(machine.state(), expected);
    }

    #[test]
    fn histogram_lost_counts_terminal_failures(
        states in prop::collection::vec(
            prop::sample::select(RealizationState::ALL.to_vec()),
            0..40,
        ),
    ) {
        let histogram = StateHistogram::from_states(states.iter().copied());
        prop_assert_eq!(histogram.total(), states.len());
        let lost = states
            .iter()
            .filter(|s| s.is_terminal() && **s != RealizationState::Success)
            .count();
        prop_assert_eq!(histogram.lost(), lost);
    }
}
