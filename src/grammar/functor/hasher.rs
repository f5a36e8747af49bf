//! Canonical content hashing of per-rule FSMs
//!
//! Structurally identical rules across different compiled grammars must
//! collide so the crossing cache can share their token masks. The hasher
//! walks the rule-reference graph with a work list: terminal and
//! self-recursive rules hash directly, simple cycles hash rotationally,
//! and the remaining rules are partially hashed by tolerating one
//! unhashable reference at the start state. Every hashed rule stores a
//! canonical BFS renumbering of its states so callers can join on
//! `(fsm_hash, canonical_state_id)`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::fsm::CompactFsm;
use crate::grammar::functor::optimize::rule_ref_graph;
use crate::grammar::{Grammar, RuleId};
use crate::support::hashing::hash_combine_all;

const NOT_END_STATE_FLAG: u64 = -0x100i64 as u64;
const END_STATE_FLAG: u64 = -0x200i64 as u64;
const SELF_RECURSION_FLAG: u64 = -0x300i64 as u64;
const SIMPLE_CYCLE_FLAG: u64 = -0x400i64 as u64;
const UNKNOWN_FLAG: u64 = -0x500i64 as u64;

/// Hash every hashable per-rule FSM of `grammar`, attaching the hashes and
/// the canonical state renumberings.
pub fn hash_fsms(grammar: &mut Grammar) {
    let num_rules = grammar.num_rules();
    grammar.per_rule_fsm_hashes = vec![None; num_rules];
    grammar.per_rule_fsm_state_renumbering = vec![None; num_rules];
    let Some(complete) = grammar.complete_fsm.clone() else {
        return;
    };

    let mut has_inward_edges = vec![false; complete.num_states()];
    for state in 0..complete.num_states() {
        for edge in complete.edges(state) {
            has_inward_edges[edge.target] = true;
        }
    }

    let referee_to_referrer = rule_ref_graph(grammar);
    let mut referrer_to_referee: Vec<Vec<RuleId>> = vec![Vec::new(); num_rules];
    for (referee, referrers) in referee_to_referrer.iter().enumerate() {
        for &referrer in referrers {
            referrer_to_referee[referrer].push(referee);
        }
    }

    // Rules without an FSM can never be hashed.
    let mut visited: Vec<bool> = (0..num_rules)
        .map(|i| grammar.per_rule_fsm(i).is_none())
        .collect();

    let mut hasher = FsmHasher {
        grammar,
        complete: complete.as_ref(),
    };

    while let Some(rule_id) = find_simple_hashable(
        &mut hasher,
        &referee_to_referrer,
        &mut referrer_to_referee,
        &mut visited,
    ) {
        visited[rule_id] = true;
        if let Some((hash, renumbering)) = hasher.hash_rule(rule_id, false) {
            hasher.grammar.per_rule_fsm_hashes[rule_id] = Some(hash);
            hasher.grammar.per_rule_fsm_state_renumbering[rule_id] = Some(renumbering);
        }
        remove_referee(&referee_to_referrer, &mut referrer_to_referee, rule_id);
    }

    // Remaining rules reference something unhashable (a repeat rule, or a
    // knot too tangled for the cycle pass). When the start state has no
    // inward edges, tolerate exactly one unknown callee there.
    let mut partial = Vec::new();
    for rule_id in 0..num_rules {
        if hasher.grammar.per_rule_fsm_hashes[rule_id].is_some() {
            continue;
        }
        let Some(fsm) = hasher.grammar.per_rule_fsm(rule_id) else {
            continue;
        };
        if has_inward_edges[fsm.start()] {
            continue;
        }
        if let Some((hash, renumbering)) = hasher.hash_rule(rule_id, true) {
            partial.push((rule_id, hash, renumbering));
        }
    }
    for (rule_id, hash, renumbering) in partial {
        hasher.grammar.per_rule_fsm_hashes[rule_id] = Some(hash);
        hasher.grammar.per_rule_fsm_state_renumbering[rule_id] = Some(renumbering);
    }
}

fn remove_referee(
    referee_to_referrer: &[Vec<RuleId>],
    referrer_to_referee: &mut [Vec<RuleId>],
    referee: RuleId,
) {
    for &referrer in &referee_to_referrer[referee] {
        referrer_to_referee[referrer].retain(|&r| r != referee);
    }
}

/// Find the next rule that can be hashed directly: no unhashed callees, or
/// only itself. When none exists, try collapsing a simple cycle first.
fn find_simple_hashable(
    hasher: &mut FsmHasher<'_>,
    referee_to_referrer: &[Vec<RuleId>],
    referrer_to_referee: &mut [Vec<RuleId>],
    visited: &mut [bool],
) -> Option<RuleId> {
    loop {
        for rule_id in 0..visited.len() {
            if visited[rule_id] {
                continue;
            }
            let callees = &referrer_to_referee[rule_id];
            if callees.is_empty() || (callees.len() == 1 && callees[0] == rule_id) {
                return Some(rule_id);
            }
        }
        if !hash_one_simple_cycle(hasher, referee_to_referrer, referrer_to_referee, visited) {
            return None;
        }
    }
}

/// Find one simple cycle in the remaining reference graph and hash its
/// members rotationally. Returns whether a cycle was collapsed.
fn hash_one_simple_cycle(
    hasher: &mut FsmHasher<'_>,
    referee_to_referrer: &[Vec<RuleId>],
    referrer_to_referee: &mut [Vec<RuleId>],
    visited: &mut [bool],
) -> bool {
    let num_rules = visited.len();
    let mut not_simple = visited.to_vec();
    for origin in 0..num_rules {
        if not_simple[origin] {
            continue;
        }
        let mut stack = vec![origin];
        let mut in_stack = vec![false; num_rules];
        in_stack[origin] = true;
        let mut current = origin;
        let mut cycle = Vec::new();
        while referrer_to_referee[current].len() == 1 && !not_simple[current] {
            let next = referrer_to_referee[current][0];
            debug_assert_ne!(next, current, "self-recursion handled by the direct pass");
            not_simple[current] = true;
            current = next;
            if in_stack[current] {
                cycle.push(current);
                while *stack.last().expect("stack non-empty") != current {
                    cycle.push(stack.pop().expect("stack non-empty"));
                }
                break;
            }
            stack.push(current);
            in_stack[current] = true;
        }
        if cycle.is_empty() {
            continue;
        }

        // Seed every member with the cycle sentinel so references inside
        // the cycle hash consistently, then combine rotationally.
        for &member in &cycle {
            visited[member] = true;
            hasher.grammar.per_rule_fsm_hashes[member] = Some(SIMPLE_CYCLE_FLAG);
        }
        let locals: Vec<(u64, Vec<(usize, usize)>)> = cycle
            .iter()
            .map(|&member| {
                hasher
                    .hash_rule(member, false)
                    .expect("cycle members only reference hashed rules or the cycle")
            })
            .collect();
        for (i, &member) in cycle.iter().enumerate() {
            let mut combined = 0u64;
            for j in 0..locals.len() {
                combined = hash_combine_all(combined, &[locals[(i + j) % locals.len()].0]);
            }
            hasher.grammar.per_rule_fsm_hashes[member] = Some(combined);
            hasher.grammar.per_rule_fsm_state_renumbering[member] = Some(locals[i].1.clone());
            remove_referee(referee_to_referrer, referrer_to_referee, member);
        }
        return true;
    }
    false
}

struct FsmHasher<'g> {
    grammar: &'g mut Grammar,
    complete: &'g CompactFsm,
}

impl FsmHasher<'_> {
    /// BFS-hash one rule's FSM. With `allow_unknown_at_start`, a single
    /// reference to an unhashed rule is tolerated at the start state and
    /// folded in as an unknown sentinel; otherwise any unhashed reference
    /// aborts.
    fn hash_rule(
        &self,
        rule_id: RuleId,
        allow_unknown_at_start: bool,
    ) -> Option<(u64, Vec<(usize, usize)>)> {
        let fsm = self.grammar.per_rule_fsm(rule_id)?;
        let start = fsm.start();
        let mut hash = 0u64;
        let mut renumbering: BTreeMap<usize, usize> = BTreeMap::new();
        renumbering.insert(start, 0);
        let mut queue = VecDeque::from([start]);

        while let Some(state) = queue.pop_front() {
            let new_id = renumbering[&state] as u64;
            let is_start = state == start;
            let end_flag = if fsm.is_end_state(state) {
                END_STATE_FLAG
            } else {
                NOT_END_STATE_FLAG
            };
            hash = hash_combine_all(hash, &[new_id, end_flag, end_flag, new_id]);

            // Rule-reference edges first, ordered by callee hash so the
            // canonical numbering is independent of callee rule ids.
            let mut ref_edges: BTreeSet<(u64, usize)> = BTreeSet::new();
            let mut unknown_count = 0usize;
            for edge in self.complete.edges(state) {
                let Some(callee) = edge.rule_ref_id() else {
                    continue;
                };
                if callee == rule_id {
                    ref_edges.insert((SELF_RECURSION_FLAG, edge.target));
                    continue;
                }
                match self.grammar.per_rule_fsm_hashes[callee] {
                    Some(callee_hash) => {
                        ref_edges.insert((callee_hash, edge.target));
                    }
                    None => {
                        if !allow_unknown_at_start || !is_start {
                            return None;
                        }
                        unknown_count += 1;
                        if unknown_count > 1 {
                            return None;
                        }
                        ref_edges.insert((UNKNOWN_FLAG, edge.target));
                    }
                }
            }
            for (callee_hash, target) in ref_edges {
                let target_id = Self::discover(&mut renumbering, &mut queue, target);
                hash = hash_combine_all(hash, &[new_id, callee_hash, target_id as u64]);
            }

            for edge in self.complete.edges(state) {
                let target_id = Self::discover(&mut renumbering, &mut queue, edge.target);
                if !edge.is_char_range() {
                    continue;
                }
                #[allow(clippy::cast_sign_loss)]
                {
                    hash = hash_combine_all(
                        hash,
                        &[new_id, edge.min as u64, edge.max as u64, target_id as u64],
                    );
                }
            }
        }

        Some((hash, renumbering.into_iter().collect()))
    }

    fn discover(
        renumbering: &mut BTreeMap<usize, usize>,
        queue: &mut VecDeque<usize>,
        target: usize,
    ) -> usize {
        if let Some(&id) = renumbering.get(&target) {
            return id;
        }
        let id = renumbering.len();
        renumbering.insert(target, id);
        queue.push_back(target);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::functor::{normalize, optimize};

    fn compiled(text: &str) -> Grammar {
        let grammar = Grammar::from_ebnf(text, "root").expect("valid grammar");
        let mut optimized = optimize(&normalize(&grammar));
        hash_fsms(&mut optimized);
        optimized
    }

    #[test]
    fn test_identical_rules_collide_across_grammars() {
        let a = compiled(r#"root ::= "hello" [0-9]"#);
        let b = compiled(r#"root ::= "hello" [0-9]"#);
        let ha = a.per_rule_fsm_hash(a.root_rule_id()).expect("hashed");
        let hb = b.per_rule_fsm_hash(b.root_rule_id()).expect("hashed");
        assert_eq!(ha, hb);
    }

    #[test]
    fn test_different_rules_differ() {
        let a = compiled(r#"root ::= "hello""#);
        let b = compiled(r#"root ::= "world""#);
        assert_ne!(
            a.per_rule_fsm_hash(a.root_rule_id()),
            b.per_rule_fsm_hash(b.root_rule_id())
        );
    }

    #[test]
    fn test_rule_renumbering_covers_reachable_states() {
        let grammar = compiled(r#"root ::= "ab" | "cd""#);
        let root = grammar.root_rule_id();
        let fsm = grammar.per_rule_fsm(root).expect("fsm");
        let reachable = fsm.reachable_states();
        for state in reachable {
            assert!(grammar.canonical_state_id(root, state).is_some());
        }
    }

    #[test]
    fn test_self_recursive_rule_hashes() {
        // `chars` references itself; the direct pass must still hash it
        let grammar = compiled(
            r#"root ::= chars "!"
chars ::= [a-z] chars | [a-z]"#,
        );
        let chars = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name == "chars")
            .expect("chars exists");
        assert!(grammar.per_rule_fsm_hash(chars).is_some());
    }

    #[test]
    fn test_mutually_recursive_cycle_hashes() {
        let grammar = compiled(
            r#"root ::= a "!"
a ::= "x" b | "x"
b ::= "y" a | "y""#,
        );
        for name in ["a", "b"] {
            let rule = (0..grammar.num_rules())
                .find(|&i| grammar.rule(i).name == name)
                .expect("rule exists");
            assert!(
                grammar.per_rule_fsm_hash(rule).is_some(),
                "cycle member {name} not hashed"
            );
        }
    }

    #[test]
    fn test_identical_rules_share_hash_within_grammar() {
        let grammar = compiled(
            r#"root ::= a b
a ::= [0-9] [0-9]
b ::= [0-9] [0-9]"#,
        );
        let mut hashes = Vec::new();
        for rule_id in 0..grammar.num_rules() {
            if grammar.rule(rule_id).name != "root" {
                hashes.push(grammar.per_rule_fsm_hash(rule_id).expect("hashed"));
            }
        }
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hashes[1]);
    }
}
