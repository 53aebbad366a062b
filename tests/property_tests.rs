//! Property-Based Tests for ncloud-imager
//!
//! Uses proptest for testing invariants over arbitrary step lists and
//! configuration layers.
//!
//! These tests verify:
//! - Rollback visits exactly the started steps, newest first
//! - No step runs after cancellation is observed
//! - Later configuration layers win, nested objects merge
//! - Operation names parse back from their display form

mod common;

use proptest::prelude::*;
use serde_json::json;

use common::{Behavior, Scripted, entries, journal};
use ncloud_imager::{CancelToken, Config, Operation, RunOutcome, Runner};

const NAMES: [&str; 12] = [
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
];

// =============================================================================
// Runner Property Tests
// =============================================================================

proptest! {
    /// Halting at step k runs steps 0..=k and cleans up k-1..=0 in reverse
    #[test]
    fn halt_rolls_back_exactly_the_started_steps(n in 1usize..12, k_seed in any::<usize>()) {
        let k = k_seed % n;
        let j = journal();
        let steps = (0..n)
            .map(|i| {
                let behavior = if i == k { Behavior::Halt } else { Behavior::Continue };
                Scripted::boxed(NAMES[i], behavior, &j)
            })
            .collect();
        let mut runner = Runner::new(steps);
        let mut state = runner.new_state();

        let report = runner.run(&mut state).unwrap();

        let mut expected: Vec<String> = (0..=k).map(|i| format!("run:{}", NAMES[i])).collect();
        expected.extend((0..k).rev().map(|i| format!("cleanup:{}", NAMES[i])));
        prop_assert_eq!(entries(&j), expected);
        prop_assert_eq!(report.outcome, RunOutcome::Halted);
        prop_assert_eq!(report.started.len(), k);
        prop_assert!(state.has_error());
    }

    /// Cancelling during step c stops the run before c+1 and cleans c..=0
    #[test]
    fn cancellation_stops_forward_progress(n in 1usize..12, c_seed in any::<usize>()) {
        let c = c_seed % n;
        let j = journal();
        let token = CancelToken::new();
        let steps = (0..n)
            .map(|i| {
                let behavior = if i == c {
                    Behavior::CancelThenContinue(token.clone())
                } else {
                    Behavior::Continue
                };
                Scripted::boxed(NAMES[i], behavior, &j)
            })
            .collect();
        let mut runner = Runner::with_cancel_token(steps, token);
        let mut state = runner.new_state();

        let report = runner.run(&mut state).unwrap();

        prop_assert_eq!(report.outcome, RunOutcome::Cancelled);
        let log = entries(&j);
        for later in NAMES.iter().take(n).skip(c + 1) {
            let run_entry = format!("run:{}", later);
            prop_assert!(!log.contains(&run_entry));
        }
        let expected: Vec<&str> = (0..=c).rev().map(|i| NAMES[i]).collect();
        prop_assert_eq!(report.cleaned_up, expected);
    }

    /// Failing cleanups never shorten the rollback sweep
    #[test]
    fn cleanup_failures_do_not_stop_rollback(mask in prop::collection::vec(any::<bool>(), 1..11)) {
        let j = journal();
        let mut steps: Vec<Box<dyn ncloud_imager::Step>> = mask
            .iter()
            .enumerate()
            .map(|(i, &fail)| {
                let behavior = if fail { Behavior::FailCleanup } else { Behavior::Continue };
                Scripted::boxed(NAMES[i], behavior, &j)
            })
            .collect();
        steps.push(Scripted::boxed("halt", Behavior::Halt, &j));
        let mut runner = Runner::new(steps);
        let mut state = runner.new_state();

        let report = runner.run(&mut state).unwrap();

        prop_assert_eq!(report.cleaned_up.len(), mask.len());
        prop_assert_eq!(
            report.cleanup_failures.len(),
            mask.iter().filter(|&&fail| fail).count()
        );
    }
}

// =============================================================================
// Configuration Property Tests
// =============================================================================

fn base() -> serde_json::Value {
    json!({
        "access_key": "AK",
        "secret_key": "SK",
        "os_type": "Linux",
        "server_image_product_code": "SPSW0LINUX000046",
        "server_product_code": "SPSVRSSD00000003"
    })
}

proptest! {
    /// The last layer that sets a field decides its value
    #[test]
    fn later_layers_override_earlier_ones(regions in prop::collection::vec("[A-Z][a-z]{2,8}", 1..5)) {
        let mut raws = vec![base()];
        raws.extend(regions.iter().map(|r| json!({ "region": r })));

        let (config, _) = Config::from_raws(&raws).unwrap();

        prop_assert_eq!(&config.region, regions.last().unwrap());
    }

    /// Nested communicator settings merge key by key across layers
    #[test]
    fn nested_layers_merge(ssh_port in 1u16..=u16::MAX, winrm_port in 1u16..=u16::MAX) {
        let raws = vec![
            base(),
            json!({ "communicator": { "ssh_port": ssh_port } }),
            json!({ "communicator": { "winrm_port": winrm_port } }),
        ];

        let (config, _) = Config::from_raws(&raws).unwrap();

        prop_assert_eq!(config.communicator.ssh_port, ssh_port);
        prop_assert_eq!(config.communicator.winrm_port, winrm_port);
        prop_assert_eq!(config.communicator.ssh_username.as_str(), "root");
    }

    /// Well-formed image names are always accepted
    #[test]
    fn valid_image_names_are_accepted(name in "[a-z][a-z0-9-]{2,29}") {
        let mut raw = base();
        raw["server_image_name"] = json!(name);

        prop_assert!(Config::from_raws(&[raw]).is_ok());
    }

    /// Names with uppercase letters are always rejected
    #[test]
    fn uppercase_image_names_are_rejected(name in "[a-z]{1,10}[A-Z][a-z]{1,10}") {
        let mut raw = base();
        raw["server_image_name"] = json!(name);

        prop_assert!(Config::from_raws(&[raw]).is_err());
    }
}

// =============================================================================
// Operation Property Tests
// =============================================================================

fn operation_strategy() -> impl Strategy<Value = Operation> {
    use strum::IntoEnumIterator;
    let all: Vec<Operation> = Operation::iter().collect();
    prop::sample::select(all)
}

proptest! {
    /// Operation: display form parses back, as accepted by --fail-at
    #[test]
    fn operation_roundtrip(op in operation_strategy()) {
        let s = op.to_string();
        let parsed: Operation = s.parse().expect("Should parse");
        prop_assert_eq!(op, parsed);
        prop_assert_eq!(s.to_lowercase(), s);
    }
}
