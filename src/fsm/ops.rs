//! Operations over [`FsmWithStartEnd`]: concatenation, union, closure,
//! epsilon removal, equivalent-successor merging, DFA minimization and
//! product intersection.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{MoldearError, Result};
use crate::fsm::{Fsm, FsmEdge, FsmWithStartEnd, StateId};

/// Hard bound on the product construction. Past this the grammar is
/// reported as impossible to compile rather than allowed to blow up.
pub const INTERSECT_MAX_STATES: usize = 65_536;

impl FsmWithStartEnd {
    /// Concatenate machines left to right.
    ///
    /// # Panics
    ///
    /// Panics if `fsms` is empty.
    #[must_use]
    pub fn concat(fsms: Vec<FsmWithStartEnd>) -> FsmWithStartEnd {
        assert!(!fsms.is_empty(), "concat of zero machines");
        let mut iter = fsms.into_iter();
        let mut result = iter.next().expect("non-empty");
        for next in iter {
            let old_count = result.fsm.num_states();
            let mapping = result.fsm.add_fsm(&next.fsm);
            result.ends.resize(result.fsm.num_states(), false);
            let next_start = mapping[next.start];
            for (state, is_end) in result.ends.iter_mut().enumerate().take(old_count) {
                if *is_end {
                    result.fsm.edges[state].push(FsmEdge::epsilon(next_start));
                    *is_end = false;
                }
            }
            for (old, &new) in mapping.iter().enumerate() {
                if next.ends[old] {
                    result.ends[new] = true;
                }
            }
        }
        result
    }

    /// Union of machines: a fresh start state with epsilon edges to every
    /// operand's start.
    ///
    /// # Panics
    ///
    /// Panics if `fsms` is empty.
    #[must_use]
    pub fn union(fsms: Vec<FsmWithStartEnd>) -> FsmWithStartEnd {
        assert!(!fsms.is_empty(), "union of zero machines");
        let mut result = FsmWithStartEnd::new();
        let start = result.add_state();
        result.set_start(start);
        for operand in fsms {
            let mapping = result.fsm.add_fsm(&operand.fsm);
            result.ends.resize(result.fsm.num_states(), false);
            result.fsm.edges[start].push(FsmEdge::epsilon(mapping[operand.start]));
            for (old, &new) in mapping.iter().enumerate() {
                if operand.ends[old] {
                    result.ends[new] = true;
                }
            }
        }
        result
    }

    /// Kleene closure.
    #[must_use]
    pub fn star(mut self) -> FsmWithStartEnd {
        let new_start = self.add_state();
        self.fsm.add_eps_edge(new_start, self.start);
        for state in 0..self.ends.len() {
            if self.ends[state] {
                self.fsm.add_eps_edge(state, new_start);
            }
        }
        self.set_start(new_start);
        self.ends.iter_mut().for_each(|e| *e = false);
        self.ends[new_start] = true;
        self
    }

    /// One-or-more closure.
    #[must_use]
    pub fn plus(self) -> FsmWithStartEnd {
        let repeated = self.clone().star();
        FsmWithStartEnd::concat(vec![self, repeated])
    }

    /// Zero-or-one.
    #[must_use]
    pub fn optional(mut self) -> FsmWithStartEnd {
        self.ends[self.start] = true;
        self
    }

    fn epsilon_closure(&self, state: StateId) -> Vec<StateId> {
        let mut visited = vec![false; self.fsm.num_states()];
        let mut stack = vec![state];
        visited[state] = true;
        let mut closure = Vec::new();
        while let Some(s) = stack.pop() {
            closure.push(s);
            for e in self.fsm.edges(s) {
                if e.is_epsilon() && !visited[e.target] {
                    visited[e.target] = true;
                    stack.push(e.target);
                }
            }
        }
        closure
    }

    /// Remove all epsilon edges, preserving the language. Unreachable
    /// states are dropped and the machine is renumbered.
    #[must_use]
    pub fn simplify_epsilon(&self) -> FsmWithStartEnd {
        let n = self.fsm.num_states();
        let mut new_fsm = Fsm::new();
        let mut new_ends = Vec::new();
        for _ in 0..n {
            new_fsm.add_state();
            new_ends.push(false);
        }
        for state in 0..n {
            let closure = self.epsilon_closure(state);
            let mut edges: Vec<FsmEdge> = Vec::new();
            for &member in &closure {
                if self.ends[member] {
                    new_ends[state] = true;
                }
                for e in self.fsm.edges(member) {
                    if !e.is_epsilon() {
                        edges.push(*e);
                    }
                }
            }
            edges.sort_unstable();
            edges.dedup();
            *new_fsm.edges_mut(state) = edges;
        }
        FsmWithStartEnd::from_parts(new_fsm, self.start, new_ends).prune_unreachable()
    }

    /// Drop states not reachable from the start and renumber.
    #[must_use]
    pub fn prune_unreachable(&self) -> FsmWithStartEnd {
        let n = self.fsm.num_states();
        let mut order = Vec::new();
        let mut index = vec![usize::MAX; n];
        let mut queue = VecDeque::from([self.start]);
        index[self.start] = 0;
        order.push(self.start);
        while let Some(s) = queue.pop_front() {
            for e in self.fsm.edges(s) {
                if index[e.target] == usize::MAX {
                    index[e.target] = order.len();
                    order.push(e.target);
                    queue.push_back(e.target);
                }
            }
        }
        let mut new_fsm = Fsm::new();
        let mut new_ends = Vec::with_capacity(order.len());
        for &old in &order {
            new_fsm.add_state();
            new_ends.push(self.ends[old]);
        }
        for (new_id, &old) in order.iter().enumerate() {
            let edges = self
                .fsm
                .edges(old)
                .iter()
                .map(|e| FsmEdge {
                    min: e.min,
                    max: e.max,
                    target: index[e.target],
                })
                .collect();
            *new_fsm.edges_mut(new_id) = edges;
        }
        FsmWithStartEnd::from_parts(new_fsm, 0, new_ends)
    }

    /// Merge states with identical outgoing edges and identical acceptance,
    /// iterating to a fixpoint. Cheap shrink that applies to NFAs too.
    #[must_use]
    pub fn merge_equivalent_successors(&self) -> FsmWithStartEnd {
        let mut current = self.clone();
        loop {
            let n = current.fsm.num_states();
            let mut signature_to_representative: HashMap<(Vec<FsmEdge>, bool), StateId> =
                HashMap::new();
            let mut replace = vec![usize::MAX; n];
            let mut merged_any = false;
            for state in 0..n {
                let mut sig = current.fsm.edges(state).to_vec();
                sig.sort_unstable();
                sig.dedup();
                let key = (sig, current.ends[state]);
                match signature_to_representative.get(&key) {
                    Some(&rep) if rep != state && state != current.start => {
                        replace[state] = rep;
                        merged_any = true;
                    }
                    Some(_) => {}
                    None => {
                        signature_to_representative.insert(key, state);
                    }
                }
            }
            if !merged_any {
                return current.prune_unreachable();
            }
            for state in 0..n {
                for e in current.fsm.edges_mut(state) {
                    if replace[e.target] != usize::MAX {
                        e.target = replace[e.target];
                    }
                }
            }
            current = current.prune_unreachable();
        }
    }

    fn is_deterministic(&self) -> bool {
        for state in 0..self.fsm.num_states() {
            let mut ranges: Vec<(i16, i32)> = Vec::new();
            let mut seen_rules: Vec<i32> = Vec::new();
            for e in self.fsm.edges(state) {
                if e.is_epsilon() {
                    return false;
                }
                if e.is_rule_ref() {
                    if seen_rules.contains(&e.max) {
                        return false;
                    }
                    seen_rules.push(e.max);
                    continue;
                }
                ranges.push((e.min, e.max));
            }
            ranges.sort_unstable();
            for w in ranges.windows(2) {
                if i32::from(w[1].0) <= w[0].1 {
                    return false;
                }
            }
        }
        true
    }

    /// Moore-style DFA minimization.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidConfiguration`] when the machine is
    /// not deterministic; callers fall back to the unminimized form.
    pub fn minimize_dfa(&self) -> Result<FsmWithStartEnd> {
        let pruned = self.prune_unreachable();
        if !pruned.is_deterministic() {
            return Err(MoldearError::InvalidConfiguration(
                "cannot minimize a nondeterministic FSM".to_string(),
            ));
        }
        let n = pruned.fsm.num_states();
        let mut class_of: Vec<usize> = pruned.ends.iter().map(|&e| usize::from(e)).collect();
        let mut num_classes = 0usize;
        loop {
            // Signature: acceptance class plus outgoing edges with targets
            // replaced by their classes. Refinement only ever grows the
            // partition, so a stable class count means a stable partition.
            let mut signature_to_class: BTreeMap<(usize, Vec<(i16, i32, usize)>), usize> =
                BTreeMap::new();
            let mut next_class = vec![0usize; n];
            for state in 0..n {
                let mut sig_edges: Vec<(i16, i32, usize)> = pruned
                    .fsm
                    .edges(state)
                    .iter()
                    .map(|e| (e.min, e.max, class_of[e.target]))
                    .collect();
                sig_edges.sort_unstable();
                sig_edges.dedup();
                let key = (class_of[state], sig_edges);
                let next_id = signature_to_class.len();
                let class = *signature_to_class.entry(key).or_insert(next_id);
                next_class[state] = class;
            }
            let new_num_classes = signature_to_class.len();
            class_of = next_class;
            if new_num_classes == num_classes {
                break;
            }
            num_classes = new_num_classes;
        }
        let num_classes = class_of.iter().max().map_or(0, |&m| m + 1);
        let mut new_fsm = Fsm::new();
        let mut new_ends = vec![false; num_classes];
        for _ in 0..num_classes {
            new_fsm.add_state();
        }
        let mut emitted = vec![false; num_classes];
        for state in 0..n {
            let class = class_of[state];
            if pruned.ends[state] {
                new_ends[class] = true;
            }
            if emitted[class] {
                continue;
            }
            emitted[class] = true;
            let mut edges: Vec<FsmEdge> = pruned
                .fsm
                .edges(state)
                .iter()
                .map(|e| FsmEdge {
                    min: e.min,
                    max: e.max,
                    target: class_of[e.target],
                })
                .collect();
            edges.sort_unstable();
            edges.dedup();
            *new_fsm.edges_mut(class) = edges;
        }
        Ok(FsmWithStartEnd::from_parts(new_fsm, class_of[pruned.start], new_ends)
            .prune_unreachable())
    }

    /// Product construction: accepts the intersection of both languages.
    /// Both operands must be free of rule-reference edges.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::GrammarBuildFailure`] when the product
    /// exceeds [`INTERSECT_MAX_STATES`] states or an operand carries
    /// rule-reference edges.
    pub fn intersect(lhs: &FsmWithStartEnd, rhs: &FsmWithStartEnd) -> Result<FsmWithStartEnd> {
        for machine in [lhs, rhs] {
            for state in 0..machine.fsm.num_states() {
                if machine.fsm.edges(state).iter().any(FsmEdge::is_rule_ref) {
                    return Err(MoldearError::GrammarBuildFailure(
                        "cannot intersect machines with rule-reference edges".to_string(),
                    ));
                }
            }
        }
        let left = lhs.simplify_epsilon();
        let right = rhs.simplify_epsilon();

        let mut result = FsmWithStartEnd::new();
        let mut pair_to_state: HashMap<(StateId, StateId), StateId> = HashMap::new();
        let mut queue = VecDeque::new();
        let start_pair = (left.start, right.start);
        let start = result.add_state();
        result.set_start(start);
        pair_to_state.insert(start_pair, start);
        queue.push_back(start_pair);
        while let Some((a, b)) = queue.pop_front() {
            let current = pair_to_state[&(a, b)];
            if left.ends[a] && right.ends[b] {
                result.add_end_state(current);
            }
            for ea in left.fsm.edges(a) {
                for eb in right.fsm.edges(b) {
                    let lo = ea.min.max(eb.min);
                    let hi = ea.max.min(eb.max);
                    if i32::from(lo) > hi {
                        continue;
                    }
                    let pair = (ea.target, eb.target);
                    let target = match pair_to_state.get(&pair) {
                        Some(&t) => t,
                        None => {
                            if pair_to_state.len() >= INTERSECT_MAX_STATES {
                                return Err(MoldearError::GrammarBuildFailure(format!(
                                    "FSM intersection exceeded {INTERSECT_MAX_STATES} states"
                                )));
                            }
                            let t = result.add_state();
                            pair_to_state.insert(pair, t);
                            queue.push_back(pair);
                            t
                        }
                    };
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    result
                        .fsm_mut()
                        .add_edge(current, target, lo as u8, hi as u8);
                }
            }
        }
        Ok(result.prune_unreachable())
    }

    /// Whether the machine accepts `input`, treating rule-reference edges
    /// as unusable. Test helper semantics only.
    #[must_use]
    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut current: Vec<StateId> = self.epsilon_closure(self.start);
        for &b in input {
            let mut next: Vec<StateId> = Vec::new();
            for &s in &current {
                for e in self.fsm.edges(s) {
                    if e.accepts_byte(b) {
                        for t in self.epsilon_closure(e.target) {
                            if !next.contains(&t) {
                                next.push(t);
                            }
                        }
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            current = next;
        }
        current.iter().any(|&s| self.ends[s])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(s: &[u8]) -> FsmWithStartEnd {
        let mut fsm = FsmWithStartEnd::new();
        let mut prev = fsm.add_state();
        fsm.set_start(prev);
        for &b in s {
            let next = fsm.add_state();
            fsm.fsm_mut().add_edge(prev, next, b, b);
            prev = next;
        }
        fsm.add_end_state(prev);
        fsm
    }

    #[test]
    fn test_concat_union() {
        let ab = FsmWithStartEnd::concat(vec![literal(b"a"), literal(b"b")]);
        assert!(ab.accepts(b"ab"));
        assert!(!ab.accepts(b"a"));

        let a_or_b = FsmWithStartEnd::union(vec![literal(b"a"), literal(b"b")]);
        assert!(a_or_b.accepts(b"a"));
        assert!(a_or_b.accepts(b"b"));
        assert!(!a_or_b.accepts(b"ab"));
    }

    #[test]
    fn test_star_plus_optional() {
        let a_star = literal(b"a").star();
        assert!(a_star.accepts(b""));
        assert!(a_star.accepts(b"aaaa"));
        assert!(!a_star.accepts(b"b"));

        let a_plus = literal(b"a").plus();
        assert!(!a_plus.accepts(b""));
        assert!(a_plus.accepts(b"aaa"));

        let a_opt = literal(b"a").optional();
        assert!(a_opt.accepts(b""));
        assert!(a_opt.accepts(b"a"));
        assert!(!a_opt.accepts(b"aa"));
    }

    #[test]
    fn test_simplify_epsilon_preserves_language() {
        let machine = FsmWithStartEnd::union(vec![literal(b"ab"), literal(b"ac")]).star();
        let simplified = machine.simplify_epsilon();
        for input in [&b""[..], b"ab", b"ac", b"abac", b"abab"] {
            assert_eq!(machine.accepts(input), simplified.accepts(input));
        }
        for state in 0..simplified.num_states() {
            assert!(!simplified.fsm().edges(state).iter().any(FsmEdge::is_epsilon));
        }
    }

    #[test]
    fn test_minimize_rejects_nfa() {
        let nfa = FsmWithStartEnd::union(vec![literal(b"a"), literal(b"a")]);
        assert!(nfa.minimize_dfa().is_err());
    }

    #[test]
    fn test_minimize_merges_states() {
        // Two parallel two-state chains accepting "ab" and "cb" minimize to
        // a diamond of 3 states after epsilon removal and successor merging.
        let machine = FsmWithStartEnd::union(vec![literal(b"ab"), literal(b"cb")])
            .simplify_epsilon()
            .merge_equivalent_successors();
        let minimized = machine.minimize_dfa().expect("deterministic");
        assert!(minimized.num_states() <= 3);
        assert!(minimized.accepts(b"ab"));
        assert!(minimized.accepts(b"cb"));
        assert!(!minimized.accepts(b"ac"));
    }

    #[test]
    fn test_intersect() {
        // (a|b)* ∩ a* = a*
        let any = FsmWithStartEnd::union(vec![literal(b"a"), literal(b"b")]).star();
        let only_a = literal(b"a").star();
        let both = FsmWithStartEnd::intersect(&any, &only_a).expect("small product");
        assert!(both.accepts(b""));
        assert!(both.accepts(b"aaa"));
        assert!(!both.accepts(b"ab"));
    }
}
