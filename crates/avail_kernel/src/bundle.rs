//! Message bundles: the named front-ends to methods.
//!
//! A bundle pairs an atom with a method and carries everything the parser
//! derives from the name: keyword parts, the parsing-instruction tuple, the
//! grammatical restrictions registered so far, and one parsing plan per
//! definition (plus a base plan so the bundle is parseable before any
//! definition arrives).

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use avail_base::{AvailObject, VmResult};

use crate::bundle_tree;
use crate::instruction::ParsingInstruction;
use crate::method::{Definition, Method};
use crate::restriction::GrammaticalRestriction;
use crate::splitter;

/// A definition's traversal of its bundle's instruction sequence.
pub struct ParsingPlan {
    /// The owning bundle.
    pub bundle: Weak<MessageBundle>,
    /// The definition this plan parses toward, if any. Bundles keep one
    /// definition-less base plan so their grammar exists independently.
    pub definition: Option<Arc<Definition>>,
    /// The instruction sequence (shared with the bundle).
    pub instructions: Arc<Vec<ParsingInstruction>>,
}

/// A named front-end to a method.
pub struct MessageBundle {
    atom: AvailObject,
    name: String,
    parts: Vec<String>,
    instructions: Arc<Vec<ParsingInstruction>>,
    argument_count: usize,
    method: Arc<Method>,
    restrictions: RwLock<Vec<Arc<GrammaticalRestriction>>>,
    plans: RwLock<Vec<Arc<ParsingPlan>>>,
}

impl MessageBundle {
    /// Splits `name` and creates the bundle, attaching it to `method`.
    pub fn new(atom: AvailObject, name: &str, method: Arc<Method>) -> VmResult<Arc<Self>> {
        let split = splitter::split(name)?;
        let bundle = Arc::new(MessageBundle {
            atom,
            name: name.to_string(),
            parts: split.parts,
            instructions: Arc::new(split.instructions),
            argument_count: split.argument_count,
            method: method.clone(),
            restrictions: RwLock::new(Vec::new()),
            plans: RwLock::new(Vec::new()),
        });
        // Base plan, then one per pre-existing definition.
        bundle.plans.write().push(Arc::new(ParsingPlan {
            bundle: Arc::downgrade(&bundle),
            definition: None,
            instructions: bundle.instructions.clone(),
        }));
        for definition in method.definitions() {
            bundle.add_plan(&definition);
        }
        method.attach_bundle(&bundle);
        debug!(name, parts = bundle.parts.len(), "bundle created");
        Ok(bundle)
    }

    /// The atom naming this bundle.
    pub fn atom(&self) -> &AvailObject {
        &self.atom
    }

    /// The message name as written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The keyword parts, in first-appearance order.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The compiled parsing instructions.
    pub fn instructions(&self) -> &Arc<Vec<ParsingInstruction>> {
        &self.instructions
    }

    /// Number of `_` argument positions in the name.
    pub fn argument_count(&self) -> usize {
        self.argument_count
    }

    /// The method this bundle fronts.
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    /// Identity key used by prefilter maps.
    pub fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// Appends the parsing plan for a freshly added definition.
    pub(crate) fn add_plan(self: &Arc<Self>, definition: &Arc<Definition>) {
        self.plans.write().push(Arc::new(ParsingPlan {
            bundle: Arc::downgrade(self),
            definition: Some(definition.clone()),
            instructions: self.instructions.clone(),
        }));
        bundle_tree::bump_grammar_epoch();
    }

    /// Snapshot of the current plans.
    pub fn plans(&self) -> Vec<Arc<ParsingPlan>> {
        self.plans.read().clone()
    }

    /// Registers a grammatical restriction and forces re-expansion of every
    /// tree path that already traversed this bundle.
    pub fn add_restriction(&self, restriction: GrammaticalRestriction) {
        debug!(
            name = self.name.as_str(),
            argument = restriction.argument_index,
            excluded = restriction.excluded.len(),
            "grammatical restriction added"
        );
        self.restrictions.write().push(Arc::new(restriction));
        bundle_tree::bump_grammar_epoch();
    }

    /// Snapshot of the registered restrictions.
    pub fn restrictions(&self) -> Vec<Arc<GrammaticalRestriction>> {
        self.restrictions.read().clone()
    }

    /// The union of bundles excluded at the given 1-based argument position.
    pub fn excluded_at(&self, argument_index: usize) -> Vec<Arc<MessageBundle>> {
        let mut excluded = Vec::new();
        for restriction in self.restrictions.read().iter() {
            if restriction.argument_index == argument_index {
                for bundle in &restriction.excluded {
                    if !excluded.iter().any(|e| Arc::ptr_eq(e, bundle)) {
                        excluded.push(bundle.clone());
                    }
                }
            }
        }
        excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_data::atom;

    fn bundle(name: &str) -> Arc<MessageBundle> {
        MessageBundle::new(atom::create(name, None), name, Method::new()).unwrap()
    }

    #[test]
    fn bundle_knows_its_shape() {
        let b = bundle("_+_");
        assert_eq!(b.argument_count(), 2);
        assert_eq!(b.parts(), ["+"]);
        assert_eq!(b.plans().len(), 1);
    }

    #[test]
    fn malformed_names_fail_bundle_creation() {
        let result = MessageBundle::new(atom::create("«", None), "«", Method::new());
        assert!(result.is_err());
    }

    #[test]
    fn restrictions_accumulate_per_position() {
        let plus = bundle("_+_");
        let negate = bundle("-_");
        let times = bundle("_×_");
        plus.add_restriction(GrammaticalRestriction::new(1, vec![negate.clone()]));
        plus.add_restriction(GrammaticalRestriction::new(1, vec![times.clone()]));
        let at_one = plus.excluded_at(1);
        assert_eq!(at_one.len(), 2);
        assert!(plus.excluded_at(2).is_empty());
    }
}
