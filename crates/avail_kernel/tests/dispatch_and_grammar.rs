//! Dispatch-graph scenarios: ambiguity detection across incomparable
//! signatures, and grammatical restrictions pruning bundle-tree paths.

use std::sync::Arc;

use avail_base::{AvailObject, ErrorKind};
use avail_data::{atom, number, types};
use avail_kernel::{
    BundleTree, Definition, GrammaticalRestriction, MessageBundle, Method, Signature,
};

fn plain(parameter_types: Vec<AvailObject>) -> Definition {
    Definition::Method {
        signature: Signature::new(parameter_types, types::any()),
        body: AvailObject::nil(),
    }
}

fn bundle(name: &str) -> Arc<MessageBundle> {
    MessageBundle::new(atom::create(name, Some("Grammar")), name, Method::new()).unwrap()
}

#[test]
fn crossed_signatures_are_ambiguous_for_values_and_types() {
    let method = Method::new();
    method
        .add_definition(plain(vec![types::integers(), types::any()]))
        .unwrap();
    method
        .add_definition(plain(vec![types::any(), types::integers()]))
        .unwrap();

    let by_values = method
        .lookup_by_values(&[number::from_i64(1), number::from_i64(2)])
        .unwrap_err();
    assert_eq!(by_values.kind, ErrorKind::AmbiguousLookup);

    let by_types = method
        .lookup_by_types(&[types::integers(), types::integers()])
        .unwrap_err();
    assert_eq!(by_types.kind, ErrorKind::AmbiguousLookup);

    // A tiebreaker definition below both resolves the ambiguity.
    let winner = method
        .add_definition(plain(vec![types::integers(), types::integers()]))
        .unwrap();
    let found = method
        .lookup_by_values(&[number::from_i64(1), number::from_i64(2)])
        .unwrap();
    assert!(Arc::ptr_eq(&found, &winner));
}

#[test]
fn abstract_and_forward_definitions_are_reported_by_the_caller() {
    let method = Method::new();
    method
        .add_definition(Definition::Abstract {
            signature: Signature::new(vec![types::any()], types::any()),
        })
        .unwrap();
    let found = method.lookup_by_values(&[number::from_i64(1)]).unwrap();
    assert!(matches!(&*found, Definition::Abstract { .. }));
}

#[test]
fn restriction_excludes_negation_from_plus_first_argument() {
    let plus = bundle("_+_");
    let negate = bundle("-_");
    plus.add_restriction(GrammaticalRestriction::new(1, vec![negate.clone()]));

    let root = BundleTree::root_for(vec![plus.clone(), negate.clone()]);

    // Parsing a "-_" send as the first argument: no "_+_" completion may
    // remain anywhere downstream.
    let filtered = root.successor_after_argument(Some(&negate)).unwrap();
    let completions = filtered.reachable_completions();
    assert!(!completions.iter().any(|b| Arc::ptr_eq(b, &plus)));

    // "-_" still parses through its own keyword path.
    let minus_path = root.successor_for_part("-").unwrap();
    assert!(minus_path
        .reachable_completions()
        .iter()
        .any(|b| Arc::ptr_eq(b, &negate)));

    // The second argument position of "_+_" carries no restriction: after
    // consuming "+", a "-_" argument still completes the sum.
    let after_first_argument = root.successor_after_argument(None).unwrap();
    let after_plus_sign = after_first_argument
        .bookkeeping_closure()
        .into_iter()
        .find_map(|node| node.successor_for_part("+"))
        .expect("keyword edge after the argument check");
    let after_second_argument = after_plus_sign
        .successor_after_argument(Some(&negate))
        .unwrap();
    assert!(after_second_argument
        .reachable_completions()
        .iter()
        .any(|b| Arc::ptr_eq(b, &plus)));
}

#[test]
fn definitions_added_later_extend_existing_plans() {
    let times = bundle("_×_");
    assert_eq!(times.plans().len(), 1);
    times
        .method()
        .add_definition(plain(vec![types::any(), types::any()]))
        .unwrap();
    assert_eq!(times.plans().len(), 2);
    let root = BundleTree::root_for(vec![times.clone()]);
    let completions = root
        .successor_after_argument(None)
        .unwrap()
        .reachable_completions();
    assert_eq!(completions.len(), 1);
}
