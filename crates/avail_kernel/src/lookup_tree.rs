//! Per-method testing trees.
//!
//! A testing tree is a decision tree over argument positions: each internal
//! node asks whether one argument is an instance of one parameter type, and
//! each leaf carries the definitions that could still apply. Internal nodes
//! only *prune*: a "yes" edge drops definitions whose parameter is provably
//! disjoint from the tested type, a "no" edge drops definitions whose
//! parameter lies inside it. The leaf then re-checks applicability exactly,
//! so the walk always yields precisely the satisfied definitions.
//!
//! Trees are rebuilt from scratch after a definition mutation; the method
//! caches the current tree and drops it on change.

use std::sync::Arc;

use avail_base::{AvailObject, VmResult};
use avail_data::{equality, types};

use crate::method::Definition;

/// A node of the testing tree.
pub enum LookupTree {
    /// Test `argument[index]` against `criterion`.
    Test {
        argument_index: usize,
        criterion: AvailObject,
        yes: Arc<LookupTree>,
        no: Arc<LookupTree>,
    },
    /// Candidates surviving every test on the path here.
    Leaf { candidates: Vec<Arc<Definition>> },
}

impl LookupTree {
    /// Builds the tree for the given definitions.
    pub fn build(definitions: &[Arc<Definition>]) -> VmResult<Arc<LookupTree>> {
        build_node(definitions.to_vec(), &mut Vec::new())
    }

    /// Walks the tree with concrete argument values; returns the exact set
    /// of applicable definitions.
    pub fn lookup_by_values(&self, arguments: &[AvailObject]) -> VmResult<Vec<Arc<Definition>>> {
        let mut node = self;
        loop {
            match node {
                LookupTree::Test {
                    argument_index,
                    criterion,
                    yes,
                    no,
                } => {
                    node = if types::is_instance(&arguments[*argument_index], criterion)? {
                        yes
                    } else {
                        no
                    };
                }
                LookupTree::Leaf { candidates } => {
                    let mut applicable = Vec::new();
                    for candidate in candidates {
                        if signature_accepts(candidate, arguments)? {
                            applicable.push(candidate.clone());
                        }
                    }
                    return Ok(applicable);
                }
            }
        }
    }

    /// Number of internal test nodes, for diagnostics.
    pub fn test_count(&self) -> usize {
        match self {
            LookupTree::Test { yes, no, .. } => 1 + yes.test_count() + no.test_count(),
            LookupTree::Leaf { .. } => 0,
        }
    }
}

fn signature_accepts(definition: &Definition, arguments: &[AvailObject]) -> VmResult<bool> {
    let signature = definition.signature();
    if signature.parameter_types.len() != arguments.len() {
        return Ok(false);
    }
    for (argument, parameter) in arguments.iter().zip(&signature.parameter_types) {
        if !types::is_instance(argument, parameter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn build_node(
    candidates: Vec<Arc<Definition>>,
    used: &mut Vec<(usize, AvailObject)>,
) -> VmResult<Arc<LookupTree>> {
    if candidates.len() > 1 {
        if let Some((argument_index, criterion)) = choose_test(&candidates, used)? {
            let mut yes_set = Vec::new();
            let mut no_set = Vec::new();
            for candidate in &candidates {
                let parameter = &candidate.signature().parameter_types[argument_index];
                if !types::is_disjoint(&criterion, parameter)? {
                    yes_set.push(candidate.clone());
                }
                if !types::is_subtype(parameter, &criterion)? {
                    no_set.push(candidate.clone());
                }
            }
            used.push((argument_index, criterion.clone()));
            let yes = build_node(yes_set, used)?;
            let no = build_node(no_set, used)?;
            used.pop();
            return Ok(Arc::new(LookupTree::Test {
                argument_index,
                criterion,
                yes,
                no,
            }));
        }
    }
    Ok(Arc::new(LookupTree::Leaf { candidates }))
}

/// Picks the `(argument, type)` test that best narrows the candidate set,
/// or `None` when no remaining test discriminates.
fn choose_test(
    candidates: &[Arc<Definition>],
    used: &[(usize, AvailObject)],
) -> VmResult<Option<(usize, AvailObject)>> {
    let mut best: Option<(usize, AvailObject, usize)> = None;
    for candidate in candidates {
        for (argument_index, parameter) in
            candidate.signature().parameter_types.iter().enumerate()
        {
            if used
                .iter()
                .any(|(i, t)| *i == argument_index && equality::equals(t, parameter))
            {
                continue;
            }
            let mut yes_count = 0usize;
            let mut no_count = 0usize;
            for other in candidates {
                let other_parameter = &other.signature().parameter_types[argument_index];
                if !types::is_disjoint(parameter, other_parameter)? {
                    yes_count += 1;
                }
                if !types::is_subtype(other_parameter, parameter)? {
                    no_count += 1;
                }
            }
            let worst = yes_count.max(no_count);
            if worst < candidates.len() {
                match &best {
                    Some((_, _, best_worst)) if *best_worst <= worst => {}
                    _ => best = Some((argument_index, parameter.clone(), worst)),
                }
            }
        }
    }
    Ok(best.map(|(i, t, _)| (i, t)))
}
