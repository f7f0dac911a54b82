//! Property-based tests for the functions registry
//!
//! Uses proptest to drive random sequences of LOAD / LOAD REPLACE / DELETE /
//! FLUSH / RESTORE against a registry and checks after every step that the
//! function index and per-engine statistics agree with the loaded libraries.
#![allow(clippy::unwrap_used)]

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;

use proptest::prelude::*;

use common::*;
use ferrite_functions::functions::{CallMode, FlushMode, RestorePolicy};

// ============================================================================
// Test Strategies
// ============================================================================

/// Small name pools so collisions actually happen
fn library_name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["alpha", "beta", "gamma", "delta"]).prop_map(str::to_string)
}

fn function_names_strategy() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(
        prop::sample::select(vec!["f1", "f2", "f3", "f4", "f5", "f6"]).prop_map(str::to_string),
        0..4,
    )
}

#[derive(Debug, Clone)]
enum Step {
    Load {
        library: String,
        functions: BTreeSet<String>,
        replace: bool,
    },
    Delete(String),
    Flush(FlushMode),
    DumpRestore(RestorePolicy),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (library_name_strategy(), function_names_strategy(), any::<bool>()).prop_map(
            |(library, functions, replace)| Step::Load {
                library,
                functions,
                replace,
            }
        ),
        2 => library_name_strategy().prop_map(Step::Delete),
        1 => prop_oneof![Just(FlushMode::Sync), Just(FlushMode::Async)].prop_map(Step::Flush),
        1 => prop_oneof![
            Just(RestorePolicy::Append),
            Just(RestorePolicy::Replace),
            Just(RestorePolicy::Flush),
        ]
        .prop_map(Step::DumpRestore),
    ]
}

// ============================================================================
// Reference model
// ============================================================================

/// Library name to function names, the expected registry contents
type Model = BTreeMap<String, BTreeSet<String>>;

fn model_load(
    model: &mut Model,
    library: &str,
    functions: &BTreeSet<String>,
    replace: bool,
) -> bool {
    if functions.is_empty() || (!replace && model.contains_key(library)) {
        return false;
    }
    let collides = model
        .iter()
        .any(|(name, owned)| name != library && !owned.is_disjoint(functions));
    if collides {
        return false;
    }
    model.insert(library.to_string(), functions.clone());
    true
}

// ============================================================================
// Registry Invariant Properties
// ============================================================================

proptest! {
    /// Index and statistics stay consistent with the loaded libraries, and
    /// the registry matches a simple reference model after every step
    #[test]
    fn prop_registry_matches_model(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let t = op_registry();
        let mut model = Model::new();

        for step in &steps {
            match step {
                Step::Load { library: name, functions, replace } => {
                    let lines: Vec<String> =
                        functions.iter().map(|f| format!("{f} double")).collect();
                    let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
                    let loaded = t.registry.load(&library(name, &lines), *replace).is_ok();
                    let expected = model_load(&mut model, name, functions, *replace);
                    prop_assert_eq!(loaded, expected, "load {} {:?}", name, functions);
                }
                Step::Delete(name) => {
                    let deleted = t.registry.delete(name).is_ok();
                    prop_assert_eq!(deleted, model.remove(name).is_some());
                }
                Step::Flush(mode) => {
                    t.registry.flush(Some(*mode));
                    model.clear();
                }
                Step::DumpRestore(policy) => {
                    let payload = t.registry.dump();
                    let restored = t.registry.restore(&payload, *policy).unwrap();
                    let expected = match policy {
                        RestorePolicy::Append => 0,
                        RestorePolicy::Replace | RestorePolicy::Flush => model.len(),
                    };
                    prop_assert_eq!(restored, expected);
                }
            }

            prop_assert!(t.registry.is_consistent());
            prop_assert_eq!(t.registry.library_count(), model.len());
            prop_assert_eq!(
                t.registry.function_count(),
                model.values().map(BTreeSet::len).sum::<usize>()
            );

            let stats = t.registry.stats();
            prop_assert_eq!(stats[0].1.library_count, model.len());
        }

        // Every modelled function resolves and runs
        for functions in model.values() {
            for function in functions {
                let reply = t
                    .registry
                    .call(function, 0, &[bytes::Bytes::from("3")], CallMode::Write)
                    .unwrap();
                prop_assert_eq!(reply.as_integer(), Some(6));
            }
        }

        // No handle outlives its library
        let expected_live: usize = model.values().map(BTreeSet::len).sum();
        prop_assert!(wait_for_live(&t.live, expected_live));
        t.registry.flush(Some(FlushMode::Sync));
        prop_assert!(wait_for_live(&t.live, 0));
        prop_assert_eq!(t.live.load(Ordering::SeqCst), 0);
    }

    /// DUMP followed by RESTORE FLUSH into a fresh registry reproduces LIST
    #[test]
    fn prop_dump_restore_preserves_listing(
        libraries in prop::collection::btree_map(
            library_name_strategy(),
            function_names_strategy(),
            0..4,
        )
    ) {
        let source = op_registry();
        let mut model = Model::new();
        for (name, functions) in &libraries {
            let lines: Vec<String> = functions.iter().map(|f| format!("{f} double")).collect();
            let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
            let loaded = source.registry.load(&library(name, &lines), false).is_ok();
            prop_assert_eq!(loaded, model_load(&mut model, name, functions, false));
        }

        let target = op_registry();
        let restored = target
            .registry
            .restore(&source.registry.dump(), RestorePolicy::Flush)
            .unwrap();
        prop_assert_eq!(restored, model.len());
        prop_assert_eq!(
            target.registry.list(None, true),
            source.registry.list(None, true)
        );
        prop_assert!(target.registry.is_consistent());
    }
}
