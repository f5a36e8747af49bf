//! Per-rule FSM lowering
//!
//! Every rule whose body is expressible as a byte DFA with rule-reference
//! edges gets one: choices lower to a union of per-alternative sequence
//! machines (epsilon-simplified, successor-merged, best-effort minimized),
//! and tag-dispatch rules lower to trigger/stop tries with Aho-Corasick
//! back edges. All per-rule machines land in one shared compact arena.

use std::sync::Arc;

use crate::fsm::unicode::character_class_fsm;
use crate::fsm::{
    CompactFsmWithStartEnd, Fsm, FsmWithStartEnd, StateId, TrieFsmBuilder,
};
use crate::grammar::{ExprId, Grammar, GrammarExpr, RuleId, TagDispatch};

/// Lower each eligible rule to an FSM and attach the shared arena and
/// per-rule views to `grammar`.
pub fn build_per_rule_fsms(grammar: &mut Grammar) {
    let mut complete = Fsm::new();
    let mut placements: Vec<Option<(StateId, Vec<StateId>)>> = vec![None; grammar.num_rules()];

    for rule_id in 0..grammar.num_rules() {
        let body = grammar.rule(rule_id).body;
        let machine = match grammar.expr(body) {
            GrammarExpr::TagDispatch(td) => tag_dispatch_fsm(td),
            GrammarExpr::Choices(_) => choices_fsm(grammar, body),
            _ => None,
        };
        if let Some(machine) = machine {
            placements[rule_id] = Some(machine.add_to_complete_fsm(&mut complete));
        }
    }

    let compact = Arc::new(complete.to_compact());
    let mut views = vec![None; grammar.num_rules()];
    for (rule_id, placement) in placements.into_iter().enumerate() {
        if let Some((start, ends)) = placement {
            views[rule_id] = Some(CompactFsmWithStartEnd::new(Arc::clone(&compact), start, &ends));
        }
    }
    grammar.complete_fsm = Some(compact);
    grammar.per_rule_fsms = views;
}

/// Machine for one atom. `None` when the atom is not FSM-expressible
/// (`repeat`).
fn atom_fsm(grammar: &Grammar, id: ExprId) -> Option<FsmWithStartEnd> {
    match grammar.expr(id) {
        GrammarExpr::ByteString(bytes) => Some(byte_string_fsm(bytes)),
        GrammarExpr::RuleRef(rule) => Some(rule_ref_fsm(*rule)),
        GrammarExpr::CharacterClass { negated, ranges } => {
            Some(character_class_fsm(ranges, *negated, false))
        }
        GrammarExpr::CharacterClassStar { negated, ranges } => {
            Some(character_class_fsm(ranges, *negated, true))
        }
        _ => None,
    }
}

fn byte_string_fsm(bytes: &[u8]) -> FsmWithStartEnd {
    let mut fsm = FsmWithStartEnd::new();
    let mut current = fsm.add_state();
    fsm.set_start(current);
    for &b in bytes {
        let next = fsm.add_state();
        fsm.fsm_mut().add_edge(current, next, b, b);
        current = next;
    }
    fsm.add_end_state(current);
    fsm
}

fn rule_ref_fsm(rule_id: RuleId) -> FsmWithStartEnd {
    let mut fsm = FsmWithStartEnd::new();
    let start = fsm.add_state();
    let end = fsm.add_state();
    fsm.set_start(start);
    fsm.add_end_state(end);
    fsm.fsm_mut().add_rule_edge(start, end, rule_id);
    fsm
}

fn sequence_fsm(grammar: &Grammar, elements: &[ExprId]) -> Option<FsmWithStartEnd> {
    if elements.is_empty() {
        return Some(FsmWithStartEnd::empty_string());
    }
    let machines: Option<Vec<FsmWithStartEnd>> =
        elements.iter().map(|&e| atom_fsm(grammar, e)).collect();
    Some(FsmWithStartEnd::concat(machines?))
}

fn choices_fsm(grammar: &Grammar, body: ExprId) -> Option<FsmWithStartEnd> {
    let GrammarExpr::Choices(choices) = grammar.expr(body) else {
        return None;
    };
    let mut machines = Vec::new();
    let mut nullable = false;
    for &choice in choices {
        match grammar.expr(choice) {
            GrammarExpr::EmptyStr => nullable = true,
            GrammarExpr::Sequence(elements) => machines.push(sequence_fsm(grammar, elements)?),
            _ => return None,
        }
    }
    if machines.is_empty() {
        return Some(FsmWithStartEnd::empty_string());
    }
    if nullable {
        machines.push(FsmWithStartEnd::empty_string());
    }
    let merged = FsmWithStartEnd::union(machines)
        .simplify_epsilon()
        .merge_equivalent_successors();
    // Minimization is best effort; rule-reference edges or residual
    // nondeterminism leave the merged machine as is.
    Some(merged.minimize_dfa().unwrap_or(merged))
}

/// Lower a tag dispatch to its trigger trie with Aho-Corasick back edges
/// and rule-reference edges out of each trigger end state.
fn tag_dispatch_fsm(td: &TagDispatch) -> Option<FsmWithStartEnd> {
    if td.stop_eos {
        tag_dispatch_fsm_eos_stop(td)
    } else {
        tag_dispatch_fsm_stop_strings(td)
    }
}

fn tag_dispatch_fsm_eos_stop(td: &TagDispatch) -> Option<FsmWithStartEnd> {
    let patterns: Vec<String> = td.tag_rule_pairs.iter().map(|(t, _)| t.clone()).collect();
    let trie = TrieFsmBuilder::build(&patterns, &td.excludes, true, false).ok()?;
    let mut fsm = trie.fsm;
    let start = fsm.start();

    // Every live state except a trigger end accepts (free text may stop
    // at EOS anywhere outside a pending dispatch).
    let mut ends = vec![false; fsm.num_states()];
    for (state, end) in ends.iter_mut().enumerate() {
        let is_trigger_end = trie.pattern_end_states.contains(&state);
        let is_dead = fsm.fsm().edges(state).is_empty();
        *end = !is_trigger_end && !is_dead;
    }

    for (i, (_, rule_id)) in td.tag_rule_pairs.iter().enumerate() {
        let from = trie.pattern_end_states[i];
        if td.loop_after_dispatch {
            fsm.fsm_mut().add_rule_edge(from, start, *rule_id);
        } else {
            let fresh = fsm.add_state();
            ends.push(true);
            fsm.fsm_mut().add_rule_edge(from, fresh, *rule_id);
        }
    }
    fsm.set_ends(ends);
    Some(fsm)
}

fn tag_dispatch_fsm_stop_strings(td: &TagDispatch) -> Option<FsmWithStartEnd> {
    debug_assert!(!td.stop_strs.is_empty());
    let mut patterns: Vec<String> = td.tag_rule_pairs.iter().map(|(t, _)| t.clone()).collect();
    let num_triggers = patterns.len();
    patterns.extend(td.stop_strs.iter().cloned());
    let trie = TrieFsmBuilder::build(&patterns, &td.excludes, true, false).ok()?;
    let mut fsm = trie.fsm;
    let start = fsm.start();

    // Only stop-string ends accept.
    let mut ends = vec![false; fsm.num_states()];
    for &stop_end in &trie.pattern_end_states[num_triggers..] {
        ends[stop_end] = true;
    }

    if td.loop_after_dispatch {
        for (i, (_, rule_id)) in td.tag_rule_pairs.iter().enumerate() {
            fsm.fsm_mut()
                .add_rule_edge(trie.pattern_end_states[i], start, *rule_id);
        }
    } else {
        // After the single dispatch only a stop string may follow: append
        // a plain trie over the stop strings and route dispatch returns
        // into it.
        let stop_trie = TrieFsmBuilder::build(&td.stop_strs, &[], false, false).ok()?;
        let mapping = fsm.fsm_mut().add_fsm(stop_trie.fsm.fsm());
        ends.resize(fsm.fsm().num_states(), false);
        for &stop_end in &stop_trie.pattern_end_states {
            ends[mapping[stop_end]] = true;
        }
        let stop_start = mapping[stop_trie.fsm.start()];
        for (i, (_, rule_id)) in td.tag_rule_pairs.iter().enumerate() {
            fsm.fsm_mut()
                .add_rule_edge(trie.pattern_end_states[i], stop_start, *rule_id);
        }
    }
    fsm.set_ends(ends);
    Some(fsm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::functor::{normalize, optimize};
    use crate::grammar::Grammar;

    fn lower(text: &str) -> Grammar {
        let grammar = Grammar::from_ebnf(text, "root").expect("valid grammar");
        optimize(&normalize(&grammar))
    }

    #[test]
    fn test_plain_rule_gets_fsm() {
        let grammar = lower(r#"root ::= "ab" | [0-9] [0-9]"#);
        assert!(grammar.per_rule_fsm(grammar.root_rule_id()).is_some());
    }

    #[test]
    fn test_repeat_rule_gets_no_fsm() {
        let grammar = lower(
            r#"root ::= digits{2,4}
digits ::= [0-9]"#,
        );
        assert!(grammar.per_rule_fsm(grammar.root_rule_id()).is_none());
        // The repeated rule itself is still lowered
        let digits = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name != "root")
            .expect("digits exists");
        assert!(grammar.per_rule_fsm(digits).is_some());
    }

    #[test]
    fn test_fsm_shares_one_arena() {
        let grammar = lower(
            r#"root ::= a b
a ::= "x"
b ::= "y""#,
        );
        let total = grammar
            .complete_fsm
            .as_ref()
            .expect("arena built")
            .num_states();
        for rule_id in 0..grammar.num_rules() {
            let fsm = grammar.per_rule_fsm(rule_id).expect("all rules lowered");
            assert_eq!(fsm.num_states(), total);
        }
    }

    #[test]
    fn test_character_class_fsm_ascii_and_unicode() {
        let machine = character_class_fsm(&[(u32::from(b'a'), 0x3B1)], false, false);
        assert!(machine.accepts(b"a"));
        assert!(machine.accepts("α".as_bytes()));
        assert!(!machine.accepts("β".as_bytes()));
        assert!(!machine.accepts(b"A"));
    }

    #[test]
    fn test_negative_class_admits_high_code_points() {
        let machine = character_class_fsm(&[(u32::from(b'"'), u32::from(b'"'))], true, false);
        assert!(!machine.accepts(b"\""));
        assert!(machine.accepts(b"a"));
        assert!(machine.accepts("é".as_bytes()));
    }

    #[test]
    fn test_char_class_star_loops_on_start() {
        let machine = character_class_fsm(&[(u32::from(b'a'), u32::from(b'z'))], false, true);
        assert!(machine.accepts(b""));
        assert!(machine.accepts(b"abc"));
        assert!(!machine.accepts(b"a1"));
    }

    #[test]
    fn test_tag_dispatch_fsm_eos_variant() {
        let td = TagDispatch {
            tag_rule_pairs: vec![("<f>".to_string(), 1)],
            stop_eos: true,
            stop_strs: vec![],
            loop_after_dispatch: true,
            excludes: vec![],
        };
        let fsm = tag_dispatch_fsm(&td).expect("builds");
        // Start state is accepting (empty free text, EOS allowed)
        assert!(fsm.is_end_state(fsm.start()));
        // Walking "<f" leaves acceptance once inside a trigger prefix...
        let mut state = fsm.start();
        for b in b"<f" {
            state = fsm
                .fsm()
                .edges(state)
                .iter()
                .find(|e| e.accepts_byte(*b))
                .expect("transition")
                .target;
        }
        assert!(fsm.is_end_state(state));
        // ...and the full trigger end state is non-accepting with a rule edge
        state = fsm
            .fsm()
            .edges(state)
            .iter()
            .find(|e| e.accepts_byte(b'>'))
            .expect("transition")
            .target;
        assert!(!fsm.is_end_state(state));
        assert!(fsm.fsm().edges(state).iter().any(|e| e.is_rule_ref()));
    }

    #[test]
    fn test_tag_dispatch_fsm_stop_string_variant() {
        let td = TagDispatch {
            tag_rule_pairs: vec![],
            stop_eos: false,
            stop_strs: vec!["</think>".to_string()],
            loop_after_dispatch: false,
            excludes: vec![],
        };
        let fsm = tag_dispatch_fsm(&td).expect("builds");
        assert!(!fsm.is_end_state(fsm.start()));
        let mut state = fsm.start();
        for b in b"abc</think>" {
            state = fsm
                .fsm()
                .edges(state)
                .iter()
                .find(|e| e.accepts_byte(*b))
                .expect("transition")
                .target;
        }
        assert!(fsm.is_end_state(state));
    }
}
