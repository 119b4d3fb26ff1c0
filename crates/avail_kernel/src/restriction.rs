//! Grammatical restrictions.
//!
//! A restriction forbids specific bundles from producing the argument at a
//! given position of another bundle's sends; this is the mechanism behind operator
//! precedence and associativity in the language. Restrictions are enforced
//! during parsing through the bundle tree's prefilter maps.

use std::sync::Arc;

use crate::bundle::MessageBundle;

/// Forbids `excluded` bundles at one argument position (1-based) of the
/// restricted bundle.
pub struct GrammaticalRestriction {
    /// Which argument position the restriction guards.
    pub argument_index: usize,
    /// Bundles that may not appear there.
    pub excluded: Vec<Arc<MessageBundle>>,
}

impl GrammaticalRestriction {
    pub fn new(argument_index: usize, excluded: Vec<Arc<MessageBundle>>) -> Self {
        GrammaticalRestriction {
            argument_index,
            excluded,
        }
    }

    /// Whether `bundle` is forbidden by this restriction.
    pub fn excludes(&self, bundle: &Arc<MessageBundle>) -> bool {
        self.excluded.iter().any(|e| Arc::ptr_eq(e, bundle))
    }
}
