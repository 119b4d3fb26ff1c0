//! The message bundle tree: a lazily expanded trie of parsing states.
//!
//! Every node holds the plans-in-progress that reached it. Expansion looks
//! at each plan's next instruction and adds one outgoing edge of the
//! matching family:
//!
//! | instruction | edge |
//! |---|---|
//! | `ParsePart(i)` | `lazy_incomplete[part]` |
//! | `ParsePartCaseInsensitive(i)` | `lazy_incomplete_case_insensitive[part]` |
//! | `ParseArgument` | `lazy_actions` entry plus prefilter entries |
//! | `CheckArgument`, branches | `lazy_actions` |
//! | `JumpBackward` | `lazy_actions`, raising `has_backward_jump` |
//!
//! A plan whose instructions are exhausted lands in `lazy_complete`.
//!
//! Grammatical restrictions materialize as the *prefilter map*: for each
//! bundle excluded at an argument position, the map carries a successor
//! containing only the plans that permit it. The parser, having just parsed
//! an argument that is a send of bundle `X`, follows `prefilter[X]` when
//! present and the default argument successor otherwise.
//!
//! Mutations bump the global grammar epoch; a node expanded under an older
//! epoch silently re-expands on next use, which is how restriction and
//! definition changes invalidate downstream expansion along exactly the
//! paths that get revisited.
//!
//! Recursive grammars create looping instruction sequences. When an
//! expansion would recreate a state equivalent to a backward-jump ancestor,
//! the fresh node is marked `is_source_of_cycle` and its
//! `latest_backward_jump` aims at the ancestor; the parser follows the back
//! link instead of expanding forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::bundle::{MessageBundle, ParsingPlan};
use crate::instruction::ParsingInstruction;

static GRAMMAR_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Advances the grammar epoch, staling every expanded bundle-tree node.
pub fn bump_grammar_epoch() {
    GRAMMAR_EPOCH.fetch_add(1, Ordering::SeqCst);
}

/// The current grammar epoch.
pub fn grammar_epoch() -> u64 {
    GRAMMAR_EPOCH.load(Ordering::SeqCst)
}

/// One plan's position within its instruction sequence.
#[derive(Clone)]
pub struct PlanInProgress {
    pub plan: Arc<ParsingPlan>,
    pub pc: usize,
}

impl PlanInProgress {
    fn instruction(&self) -> Option<ParsingInstruction> {
        self.plan.instructions.get(self.pc).copied()
    }

    fn advanced(&self, pc: usize) -> PlanInProgress {
        PlanInProgress {
            plan: self.plan.clone(),
            pc,
        }
    }

    fn signature_entry(&self) -> (usize, usize) {
        (Arc::as_ptr(&self.plan) as usize, self.pc)
    }
}

#[derive(Default)]
struct TreeState {
    expanded_epoch: u64,
    lazy_complete: Vec<Arc<MessageBundle>>,
    lazy_incomplete: FxHashMap<String, Arc<BundleTree>>,
    lazy_incomplete_case_insensitive: FxHashMap<String, Arc<BundleTree>>,
    lazy_actions: FxHashMap<ParsingInstruction, Vec<Arc<BundleTree>>>,
    lazy_prefilter: FxHashMap<usize, Arc<BundleTree>>,
    default_argument: Option<Arc<BundleTree>>,
    has_backward_jump: bool,
}

/// A node in the bundle tree.
pub struct BundleTree {
    /// Root nodes re-derive their plans from these bundles on each
    /// expansion; interior nodes carry a fixed plan set.
    root_bundles: Option<Vec<Arc<MessageBundle>>>,
    plans: Vec<PlanInProgress>,
    signature: Vec<(usize, usize)>,
    parent: Option<Weak<BundleTree>>,
    is_source_of_cycle: bool,
    latest_backward_jump: Option<Weak<BundleTree>>,
    state: Mutex<TreeState>,
}

impl BundleTree {
    /// A root node spanning the given bundles.
    pub fn root_for(bundles: Vec<Arc<MessageBundle>>) -> Arc<BundleTree> {
        Arc::new(BundleTree {
            root_bundles: Some(bundles),
            plans: Vec::new(),
            signature: Vec::new(),
            parent: None,
            is_source_of_cycle: false,
            latest_backward_jump: None,
            state: Mutex::new(TreeState::default()),
        })
    }

    fn child(self: &Arc<Self>, mut plans: Vec<PlanInProgress>) -> Arc<BundleTree> {
        plans.sort_by_key(|p| p.signature_entry());
        plans.dedup_by_key(|p| p.signature_entry());
        let signature: Vec<(usize, usize)> =
            plans.iter().map(|p| p.signature_entry()).collect();
        // A state equivalent to a backward-jump ancestor closes a cycle
        // instead of expanding forever.
        let mut ancestor = Some(self.clone());
        let mut cycle_target: Option<Weak<BundleTree>> = None;
        while let Some(node) = ancestor {
            if node.signature == signature && node.contains_backward_jump() {
                cycle_target = Some(Arc::downgrade(&node));
                break;
            }
            ancestor = node.parent.as_ref().and_then(Weak::upgrade);
        }
        let is_cycle = cycle_target.is_some();
        Arc::new(BundleTree {
            root_bundles: None,
            plans,
            signature,
            parent: Some(Arc::downgrade(self)),
            is_source_of_cycle: is_cycle,
            latest_backward_jump: cycle_target,
            state: Mutex::new(TreeState::default()),
        })
    }

    fn contains_backward_jump(&self) -> bool {
        self.plans.iter().any(|p| {
            p.plan
                .instructions
                .iter()
                .any(|i| matches!(i, ParsingInstruction::JumpBackward(_)))
        })
    }

    /// Whether this node closes a grammar cycle.
    pub fn is_source_of_cycle(&self) -> bool {
        self.is_source_of_cycle
    }

    /// Whether any plan at this node sits on a backward jump (set during
    /// expansion).
    pub fn has_backward_jump(&self) -> bool {
        self.state.lock().has_backward_jump
    }

    /// The backward-jump ancestor this node loops to, if any.
    pub fn latest_backward_jump(&self) -> Option<Arc<BundleTree>> {
        self.latest_backward_jump.as_ref().and_then(Weak::upgrade)
    }

    fn current_plans(&self) -> Vec<PlanInProgress> {
        match &self.root_bundles {
            Some(bundles) => {
                let mut pips = Vec::new();
                for bundle in bundles {
                    for plan in bundle.plans() {
                        pips.push(PlanInProgress { plan, pc: 0 });
                    }
                }
                pips
            }
            None => self.plans.clone(),
        }
    }

    /// Expands this node if it has never expanded or the grammar changed.
    pub fn expand(self: &Arc<Self>) {
        if self.is_source_of_cycle {
            // The parser follows the back link; there is nothing to expand.
            return;
        }
        let epoch = grammar_epoch();
        {
            let state = self.state.lock();
            if state.expanded_epoch == epoch {
                return;
            }
        }
        let pips = self.current_plans();
        let mut complete: Vec<Arc<MessageBundle>> = Vec::new();
        let mut incomplete: FxHashMap<String, Vec<PlanInProgress>> = FxHashMap::default();
        let mut incomplete_ci: FxHashMap<String, Vec<PlanInProgress>> = FxHashMap::default();
        let mut actions: FxHashMap<ParsingInstruction, Vec<Vec<PlanInProgress>>> =
            FxHashMap::default();
        let mut argument_pips: Vec<PlanInProgress> = Vec::new();
        let mut has_backward_jump = false;

        for pip in &pips {
            let Some(bundle) = pip.plan.bundle.upgrade() else {
                continue;
            };
            match pip.instruction() {
                None => {
                    if !complete.iter().any(|b| Arc::ptr_eq(b, &bundle)) {
                        complete.push(bundle);
                    }
                }
                Some(ParsingInstruction::ParsePart(index)) => incomplete
                    .entry(bundle.parts()[index].clone())
                    .or_default()
                    .push(pip.advanced(pip.pc + 1)),
                Some(ParsingInstruction::ParsePartCaseInsensitive(index)) => incomplete_ci
                    .entry(bundle.parts()[index].to_lowercase())
                    .or_default()
                    .push(pip.advanced(pip.pc + 1)),
                Some(ParsingInstruction::ParseArgument) => {
                    argument_pips.push(pip.clone());
                }
                Some(instruction @ ParsingInstruction::CheckArgument(_)) => actions
                    .entry(instruction)
                    .or_insert_with(|| vec![Vec::new()])[0]
                    .push(pip.advanced(pip.pc + 1)),
                Some(instruction @ ParsingInstruction::BranchForward(target)) => {
                    let successors = actions
                        .entry(instruction)
                        .or_insert_with(|| vec![Vec::new(), Vec::new()]);
                    successors[0].push(pip.advanced(pip.pc + 1));
                    successors[1].push(pip.advanced(target));
                }
                Some(instruction @ ParsingInstruction::JumpBackward(target)) => {
                    has_backward_jump = true;
                    actions
                        .entry(instruction)
                        .or_insert_with(|| vec![Vec::new()])[0]
                        .push(pip.advanced(target));
                }
            }
        }

        // Argument edges: a default successor with every plan, plus one
        // prefilter successor per excluded bundle, carrying only the plans
        // that permit it.
        let mut prefilter: FxHashMap<usize, Vec<PlanInProgress>> = FxHashMap::default();
        if !argument_pips.is_empty() {
            let mut excluded_union: Vec<Arc<MessageBundle>> = Vec::new();
            for pip in &argument_pips {
                if let Some(bundle) = pip.plan.bundle.upgrade() {
                    for excluded in bundle.excluded_at(argument_position_of(pip)) {
                        if !excluded_union.iter().any(|e| Arc::ptr_eq(e, &excluded)) {
                            excluded_union.push(excluded);
                        }
                    }
                }
            }
            for excluded in &excluded_union {
                let allowing: Vec<PlanInProgress> = argument_pips
                    .iter()
                    .filter(|pip| {
                        pip.plan
                            .bundle
                            .upgrade()
                            .map(|bundle| {
                                !bundle
                                    .excluded_at(argument_position_of(pip))
                                    .iter()
                                    .any(|e| Arc::ptr_eq(e, excluded))
                            })
                            .unwrap_or(false)
                    })
                    .map(|pip| pip.advanced(pip.pc + 1))
                    .collect();
                prefilter.insert(Arc::as_ptr(excluded) as usize, allowing);
            }
        }

        let mut state = self.state.lock();
        state.lazy_complete = complete;
        state.lazy_incomplete = incomplete
            .into_iter()
            .map(|(part, pips)| (part, self.child(pips)))
            .collect();
        state.lazy_incomplete_case_insensitive = incomplete_ci
            .into_iter()
            .map(|(part, pips)| (part, self.child(pips)))
            .collect();
        state.lazy_actions = actions
            .into_iter()
            .map(|(instruction, successors)| {
                (
                    instruction,
                    successors.into_iter().map(|pips| self.child(pips)).collect(),
                )
            })
            .collect();
        if !argument_pips.is_empty() {
            let advanced: Vec<PlanInProgress> = argument_pips
                .iter()
                .map(|pip| pip.advanced(pip.pc + 1))
                .collect();
            let default = self.child(advanced);
            state
                .lazy_actions
                .insert(ParsingInstruction::ParseArgument, vec![default.clone()]);
            state.default_argument = Some(default);
        } else {
            state.default_argument = None;
        }
        state.lazy_prefilter = prefilter
            .into_iter()
            .map(|(key, pips)| (key, self.child(pips)))
            .collect();
        state.has_backward_jump = has_backward_jump;
        state.expanded_epoch = epoch;
        trace!(
            complete = state.lazy_complete.len(),
            parts = state.lazy_incomplete.len(),
            actions = state.lazy_actions.len(),
            prefilters = state.lazy_prefilter.len(),
            "bundle tree node expanded"
        );
    }

    /// Bundles fully parsed at this node.
    pub fn completions(self: &Arc<Self>) -> Vec<Arc<MessageBundle>> {
        self.expand();
        self.state.lock().lazy_complete.clone()
    }

    /// Successor after consuming the given keyword token.
    pub fn successor_for_part(self: &Arc<Self>, token: &str) -> Option<Arc<BundleTree>> {
        self.expand();
        let state = self.state.lock();
        state.lazy_incomplete.get(token).cloned().or_else(|| {
            state
                .lazy_incomplete_case_insensitive
                .get(&token.to_lowercase())
                .cloned()
        })
    }

    /// Successor after parsing an argument. When the argument is a send of
    /// a known bundle, the prefilter map enforces grammatical restrictions.
    pub fn successor_after_argument(
        self: &Arc<Self>,
        argument_bundle: Option<&Arc<MessageBundle>>,
    ) -> Option<Arc<BundleTree>> {
        self.expand();
        let state = self.state.lock();
        if let Some(bundle) = argument_bundle {
            if let Some(filtered) = state.lazy_prefilter.get(&bundle.key()) {
                return Some(filtered.clone());
            }
        }
        state.default_argument.clone()
    }

    /// Successors for bookkeeping instructions (argument checks, branches,
    /// jumps).
    pub fn action_successors(self: &Arc<Self>) -> Vec<Arc<BundleTree>> {
        self.expand();
        self.state
            .lock()
            .lazy_actions
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// This node plus every node reachable through bookkeeping edges alone
    /// (argument checks, branches, jumps); these are the states a parser runs
    /// through without consuming a token.
    pub fn bookkeeping_closure(self: &Arc<Self>) -> Vec<Arc<BundleTree>> {
        let mut out: Vec<Arc<BundleTree>> = Vec::new();
        let mut work = vec![self.clone()];
        while let Some(node) = work.pop() {
            let key = Arc::as_ptr(&node) as usize;
            if out.iter().any(|n| Arc::as_ptr(n) as usize == key) {
                continue;
            }
            if !node.is_source_of_cycle {
                work.extend(node.action_successors());
            }
            out.push(node);
        }
        out
    }

    /// Every bundle completable from this node, transitively, following all
    /// edge families (cycle links are not re-entered).
    pub fn reachable_completions(self: &Arc<Self>) -> Vec<Arc<MessageBundle>> {
        let mut out: Vec<Arc<MessageBundle>> = Vec::new();
        let mut visited: Vec<usize> = Vec::new();
        let mut work = vec![self.clone()];
        while let Some(node) = work.pop() {
            let key = Arc::as_ptr(&node) as usize;
            if visited.contains(&key) {
                continue;
            }
            visited.push(key);
            if node.is_source_of_cycle {
                continue;
            }
            node.expand();
            let state = node.state.lock();
            for bundle in &state.lazy_complete {
                if !out.iter().any(|b| Arc::ptr_eq(b, bundle)) {
                    out.push(bundle.clone());
                }
            }
            work.extend(state.lazy_incomplete.values().cloned());
            work.extend(state.lazy_incomplete_case_insensitive.values().cloned());
            work.extend(state.lazy_actions.values().flatten().cloned());
            work.extend(state.lazy_prefilter.values().cloned());
        }
        out
    }
}

/// The 1-based argument position a `ParseArgument` feeds, read from the
/// following `CheckArgument`.
fn argument_position_of(pip: &PlanInProgress) -> usize {
    match pip.plan.instructions.get(pip.pc + 1) {
        Some(ParsingInstruction::CheckArgument(position)) => *position,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use crate::restriction::GrammaticalRestriction;
    use avail_data::atom;

    fn bundle(name: &str) -> Arc<MessageBundle> {
        MessageBundle::new(atom::create(name, None), name, Method::new()).unwrap()
    }

    #[test]
    fn parts_lead_to_completion() {
        let negate = bundle("-_");
        let root = BundleTree::root_for(vec![negate.clone()]);
        let after_minus = root.successor_for_part("-").unwrap();
        let after_argument = after_minus.successor_after_argument(None).unwrap();
        // CheckArgument then completion.
        let completions = after_argument.reachable_completions();
        assert_eq!(completions.len(), 1);
        assert!(Arc::ptr_eq(&completions[0], &negate));
    }

    #[test]
    fn unknown_part_has_no_successor() {
        let root = BundleTree::root_for(vec![bundle("-_")]);
        assert!(root.successor_for_part("+").is_none());
    }

    #[test]
    fn case_insensitive_parts_match_any_casing() {
        let assert_bundle = bundle("Assert~_");
        let root = BundleTree::root_for(vec![assert_bundle.clone()]);
        for spelling in ["assert", "ASSERT", "Assert"] {
            let node = root.successor_for_part(spelling).unwrap();
            assert!(!node.reachable_completions().is_empty(), "{}", spelling);
        }
    }

    #[test]
    fn two_bundles_share_the_root() {
        let plus = bundle("_+_");
        let negate = bundle("-_");
        let root = BundleTree::root_for(vec![plus.clone(), negate.clone()]);
        let all = root.reachable_completions();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn restriction_prunes_the_prefiltered_path() {
        let plus = bundle("_+_");
        let negate = bundle("-_");
        plus.add_restriction(GrammaticalRestriction::new(1, vec![negate.clone()]));
        let root = BundleTree::root_for(vec![plus.clone(), negate.clone()]);
        // Parse an argument that is a "-_" send, at the first position.
        let after = root.successor_after_argument(Some(&negate)).unwrap();
        let completions = after.reachable_completions();
        assert!(
            !completions.iter().any(|b| Arc::ptr_eq(b, &plus)),
            "restricted bundle must not complete"
        );
        // An unrestricted argument still reaches the plus completion.
        let unrestricted = root.successor_after_argument(None).unwrap();
        assert!(unrestricted
            .reachable_completions()
            .iter()
            .any(|b| Arc::ptr_eq(b, &plus)));
    }

    #[test]
    fn restriction_added_after_expansion_still_applies() {
        let plus = bundle("_+_");
        let negate = bundle("-_");
        let root = BundleTree::root_for(vec![plus.clone(), negate.clone()]);
        // Expand before the restriction exists.
        let before = root.successor_after_argument(Some(&negate)).unwrap();
        assert!(before
            .reachable_completions()
            .iter()
            .any(|b| Arc::ptr_eq(b, &plus)));
        // The mutation bumps the epoch; re-querying re-expands.
        plus.add_restriction(GrammaticalRestriction::new(1, vec![negate.clone()]));
        let after = root.successor_after_argument(Some(&negate)).unwrap();
        assert!(!after
            .reachable_completions()
            .iter()
            .any(|b| Arc::ptr_eq(b, &plus)));
    }

    #[test]
    fn repetition_groups_close_cycles() {
        let list = bundle("{«_,»}");
        let root = BundleTree::root_for(vec![list.clone()]);
        // Walk: "{" then into the group, one argument and a ",".
        let mut frontier = vec![root.successor_for_part("{").unwrap()];
        let mut saw_cycle = false;
        let mut visited: Vec<usize> = Vec::new();
        while let Some(node) = frontier.pop() {
            let key = Arc::as_ptr(&node) as usize;
            if visited.contains(&key) {
                continue;
            }
            visited.push(key);
            if node.is_source_of_cycle() {
                saw_cycle = true;
                assert!(node.latest_backward_jump().is_some());
                continue;
            }
            node.expand();
            frontier.extend(node.action_successors());
            if let Some(n) = node.successor_for_part(",") {
                frontier.push(n);
            }
            if let Some(n) = node.successor_after_argument(None) {
                frontier.push(n);
            }
        }
        assert!(saw_cycle, "looping grammar must produce a cycle link");
    }
}
