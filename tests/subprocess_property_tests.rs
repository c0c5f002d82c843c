use proptest::prelude::*;
use std::collections::BTreeMap;
use std::ffi::OsString;

use jaks_subprocess::{Invocation, merge_environment};

fn env_name() -> impl Strategy<Value = String> {
    "[A-Za-z_][A-Za-z0-9_]{0,7}"
}

proptest! {
    /// Arguments reach the command as discrete argv elements, untouched.
    #[test]
    fn prop_invocation_preserves_arbitrary_args(
        program in "[^\\x00]+",
        args in proptest::collection::vec("[^\\x00]*", 0..10)
    ) {
        let invocation = Invocation::new([program.clone()]).unwrap().args(args.clone());
        let command = invocation.to_command(Vec::<(OsString, OsString)>::new()).unwrap();

        let expected_program = OsString::from(&program);
        prop_assert_eq!(command.get_program(), expected_program.as_os_str());
        let passed: Vec<_> = command.get_args().collect();
        prop_assert_eq!(passed.len(), args.len());
        for (passed, expected) in passed.iter().zip(&args) {
            let expected = OsString::from(expected);
            prop_assert_eq!(*passed, expected.as_os_str());
        }
    }

    /// Every delta key appears exactly once, case-insensitively, with the delta value.
    #[test]
    fn prop_merge_yields_one_entry_per_delta_key(
        base in proptest::collection::vec((env_name(), "[a-z]{0,5}"), 0..12),
        delta in proptest::collection::btree_map(env_name(), "[a-z]{0,5}", 0..6)
    ) {
        let base_os: Vec<(OsString, OsString)> = base
            .iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let merged = merge_environment(base_os, &delta);

        let mut folded: BTreeMap<String, &str> = BTreeMap::new();
        for (key, value) in &delta {
            folded.insert(key.to_ascii_uppercase(), value);
        }

        for (upper, value) in folded {
            let hits: Vec<_> = merged
                .iter()
                .filter(|(k, _)| k.to_string_lossy().to_ascii_uppercase() == upper)
                .collect();
            prop_assert_eq!(hits.len(), 1, "key {} appears {} times", upper, hits.len());
            prop_assert_eq!(hits[0].1.to_string_lossy(), value);
        }
    }

    /// Base variables the delta does not mention pass through unchanged.
    #[test]
    fn prop_merge_keeps_unrelated_base_entries(
        base in proptest::collection::btree_map("[a-z]{1,6}", "[a-z]{0,5}", 0..8),
        delta in proptest::collection::btree_map("[A-Z]{1,6}", "[a-z]{0,5}", 0..4)
    ) {
        let merged = merge_environment(
            base.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))),
            &delta,
        );

        for (key, value) in &base {
            if delta.keys().any(|d| d.eq_ignore_ascii_case(key)) {
                continue;
            }
            prop_assert!(merged.contains(&(OsString::from(key), OsString::from(value))));
        }
    }
}
