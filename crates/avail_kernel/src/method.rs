//! Methods and their definitions.
//!
//! A method owns the definitions reachable through its bundles and caches a
//! testing tree for value dispatch. Definition mutation drops the cached
//! tree, appends parsing plans to every attached bundle, bumps the grammar
//! epoch (so bundle-tree nodes re-expand), and invalidates every dependent
//! Level-Two chunk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use avail_base::{AvailObject, ErrorKind, VmError, VmResult};
use avail_data::types;

use crate::bundle::MessageBundle;
use crate::bundle_tree;
use crate::lookup_tree::LookupTree;

static NEXT_METHOD_ID: AtomicU64 = AtomicU64::new(1);

/// Parameter types plus return type.
#[derive(Clone, Debug)]
pub struct Signature {
    /// One type object per argument position.
    pub parameter_types: Vec<AvailObject>,
    /// The declared result type.
    pub return_type: AvailObject,
}

impl Signature {
    pub fn new(parameter_types: Vec<AvailObject>, return_type: AvailObject) -> Self {
        Signature {
            parameter_types,
            return_type,
        }
    }

    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }

    /// Whether every parameter of `self` is a subtype of the corresponding
    /// parameter of `other`: the specificity order used for dispatch.
    pub fn is_at_least_as_specific_as(&self, other: &Signature) -> VmResult<bool> {
        if self.arity() != other.arity() {
            return Ok(false);
        }
        for (mine, theirs) in self.parameter_types.iter().zip(&other.parameter_types) {
            if !types::is_subtype(mine, theirs)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// One entry in a method's dispatch graph.
#[derive(Debug)]
pub enum Definition {
    /// An ordinary definition with a function body.
    Method {
        signature: Signature,
        body: AvailObject,
    },
    /// Declared but deliberately unimplemented at this signature.
    Abstract { signature: Signature },
    /// A forward declaration awaiting its real body.
    Forward { signature: Signature },
    /// A macro: body runs at parse time, prefix functions at section
    /// boundaries.
    Macro {
        signature: Signature,
        body: AvailObject,
        prefix_functions: Vec<AvailObject>,
    },
}

impl Definition {
    pub fn signature(&self) -> &Signature {
        match self {
            Definition::Method { signature, .. }
            | Definition::Abstract { signature }
            | Definition::Forward { signature }
            | Definition::Macro { signature, .. } => signature,
        }
    }

    /// The callable body, for definitions that have one.
    pub fn body(&self) -> Option<&AvailObject> {
        match self {
            Definition::Method { body, .. } | Definition::Macro { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_macro(&self) -> bool {
        matches!(self, Definition::Macro { .. })
    }
}

/// Something holding optimized code that depends on a method's definition
/// set; in practice a Level-Two chunk.
pub trait ChunkDependent: Send + Sync {
    /// Marks the dependent invalid; it must fall back to unoptimized code.
    fn invalidate(&self);
    /// Stable identifier for diagnostics.
    fn dependent_id(&self) -> u64;
}

/// A method: definitions, cached testing tree, attached bundles, dependent
/// chunks.
pub struct Method {
    id: u64,
    definitions: RwLock<Vec<Arc<Definition>>>,
    testing_tree: RwLock<Option<Arc<LookupTree>>>,
    bundles: RwLock<Vec<Arc<MessageBundle>>>,
    dependents: Mutex<Vec<Weak<dyn ChunkDependent>>>,
}

impl Method {
    pub fn new() -> Arc<Method> {
        Arc::new(Method {
            id: NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed),
            definitions: RwLock::new(Vec::new()),
            testing_tree: RwLock::new(None),
            bundles: RwLock::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the current definitions.
    pub fn definitions(&self) -> Vec<Arc<Definition>> {
        self.definitions.read().clone()
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.read().len()
    }

    /// Called by a bundle when it attaches itself to this method.
    pub(crate) fn attach_bundle(&self, bundle: &Arc<MessageBundle>) {
        self.bundles.write().push(bundle.clone());
    }

    /// Bundles currently naming this method.
    pub fn bundles(&self) -> Vec<Arc<MessageBundle>> {
        self.bundles.read().clone()
    }

    /// Adds a definition. Drops the testing tree, extends every attached
    /// bundle's parsing plans, and invalidates dependent chunks.
    pub fn add_definition(&self, definition: Definition) -> VmResult<Arc<Definition>> {
        let bundles = self.bundles.read().clone();
        if let Some(bundle) = bundles.first() {
            if definition.signature().arity() != bundle.argument_count() {
                return Err(VmError::with_detail(
                    ErrorKind::IncorrectNumberOfArguments,
                    format!(
                        "definition of {:?} takes {} arguments, message has {}",
                        bundle.name(),
                        definition.signature().arity(),
                        bundle.argument_count()
                    ),
                ));
            }
        }
        let definition = Arc::new(definition);
        self.definitions.write().push(definition.clone());
        *self.testing_tree.write() = None;
        for bundle in &bundles {
            bundle.add_plan(&definition);
        }
        bundle_tree::bump_grammar_epoch();
        self.invalidate_dependents();
        debug!(
            method = self.id,
            definitions = self.definition_count(),
            "definition added"
        );
        Ok(definition)
    }

    /// Registers optimized code whose validity depends on this method.
    pub fn add_dependent(&self, dependent: Weak<dyn ChunkDependent>) {
        let mut dependents = self.dependents.lock();
        dependents.retain(|d| d.upgrade().is_some());
        dependents.push(dependent);
    }

    fn invalidate_dependents(&self) {
        let mut dependents = self.dependents.lock();
        for dependent in dependents.drain(..) {
            if let Some(dependent) = dependent.upgrade() {
                debug!(
                    method = self.id,
                    chunk = dependent.dependent_id(),
                    "invalidating dependent chunk"
                );
                dependent.invalidate();
            }
        }
    }

    fn testing_tree(&self) -> VmResult<Arc<LookupTree>> {
        if let Some(tree) = self.testing_tree.read().clone() {
            return Ok(tree);
        }
        let definitions = self.definitions();
        let tree = LookupTree::build(&definitions)?;
        *self.testing_tree.write() = Some(tree.clone());
        Ok(tree)
    }

    /// Selects the most specific definition for concrete argument values.
    pub fn lookup_by_values(&self, arguments: &[AvailObject]) -> VmResult<Arc<Definition>> {
        let applicable = self.testing_tree()?.lookup_by_values(arguments)?;
        most_specific(applicable)
    }

    /// Selects the most specific definition for argument *types* (the
    /// compiler's view of a call site).
    pub fn lookup_by_types(&self, argument_types: &[AvailObject]) -> VmResult<Arc<Definition>> {
        let mut applicable = Vec::new();
        for definition in self.definitions() {
            let signature = definition.signature();
            if signature.arity() != argument_types.len() {
                continue;
            }
            let mut accepts = true;
            for (argument_type, parameter) in
                argument_types.iter().zip(&signature.parameter_types)
            {
                if !types::is_subtype(argument_type, parameter)? {
                    accepts = false;
                    break;
                }
            }
            if accepts {
                applicable.push(definition);
            }
        }
        most_specific(applicable)
    }
}

impl Default for Method {
    fn default() -> Self {
        Method {
            id: NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed),
            definitions: RwLock::new(Vec::new()),
            testing_tree: RwLock::new(None),
            bundles: RwLock::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
        }
    }
}

/// The unique minimum of `applicable` under the specificity order.
fn most_specific(applicable: Vec<Arc<Definition>>) -> VmResult<Arc<Definition>> {
    if applicable.is_empty() {
        return Err(ErrorKind::NoDefinition.into());
    }
    'outer: for candidate in &applicable {
        for other in &applicable {
            if Arc::ptr_eq(candidate, other) {
                continue;
            }
            if !candidate
                .signature()
                .is_at_least_as_specific_as(other.signature())?
            {
                continue 'outer;
            }
        }
        return Ok(candidate.clone());
    }
    Err(ErrorKind::AmbiguousLookup.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_data::number;

    fn plain(signature: Signature) -> Definition {
        Definition::Method {
            signature,
            body: AvailObject::nil(),
        }
    }

    #[test]
    fn single_definition_is_found() {
        let method = Method::new();
        method
            .add_definition(plain(Signature::new(vec![types::integers()], types::any())))
            .unwrap();
        let found = method.lookup_by_values(&[number::from_i64(1)]).unwrap();
        assert_eq!(found.signature().arity(), 1);
    }

    #[test]
    fn more_specific_definition_wins() {
        let method = Method::new();
        method
            .add_definition(plain(Signature::new(vec![types::any()], types::any())))
            .unwrap();
        let narrow = method
            .add_definition(plain(Signature::new(
                vec![types::integers()],
                types::any(),
            )))
            .unwrap();
        let found = method.lookup_by_values(&[number::from_i64(1)]).unwrap();
        assert!(Arc::ptr_eq(&found, &narrow));
    }

    #[test]
    fn no_definition_error() {
        let method = Method::new();
        method
            .add_definition(plain(Signature::new(vec![types::integers()], types::any())))
            .unwrap();
        let err = method
            .lookup_by_values(&[avail_data::tuple::string_from_str("x")])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoDefinition);
    }

    #[test]
    fn incomparable_definitions_are_ambiguous() {
        let method = Method::new();
        method
            .add_definition(plain(Signature::new(
                vec![types::integers(), types::any()],
                types::any(),
            )))
            .unwrap();
        method
            .add_definition(plain(Signature::new(
                vec![types::any(), types::integers()],
                types::any(),
            )))
            .unwrap();
        let err = method
            .lookup_by_values(&[number::from_i64(1), number::from_i64(2)])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AmbiguousLookup);
    }

    #[test]
    fn type_lookup_mirrors_value_lookup() {
        let method = Method::new();
        let narrow = method
            .add_definition(plain(Signature::new(
                vec![types::inclusive_range(0, 9)],
                types::any(),
            )))
            .unwrap();
        method
            .add_definition(plain(Signature::new(vec![types::integers()], types::any())))
            .unwrap();
        let found = method
            .lookup_by_types(&[types::inclusive_range(2, 3)])
            .unwrap();
        assert!(Arc::ptr_eq(&found, &narrow));
    }

    #[test]
    fn mutation_invalidates_dependents() {
        struct Probe(std::sync::atomic::AtomicBool);
        impl ChunkDependent for Probe {
            fn invalidate(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
            fn dependent_id(&self) -> u64 {
                99
            }
        }
        let method = Method::new();
        let probe = Arc::new(Probe(std::sync::atomic::AtomicBool::new(false)));
        let as_dependent: Arc<dyn ChunkDependent> = probe.clone();
        method.add_dependent(Arc::downgrade(&as_dependent));
        method
            .add_definition(plain(Signature::new(vec![types::any()], types::any())))
            .unwrap();
        assert!(probe.0.load(Ordering::SeqCst));
    }
}
