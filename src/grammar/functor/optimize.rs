//! Optimization passes over normalized grammars: byte-string fusion, rule
//! inlining, dead-code elimination, look-ahead detection, empty-rule
//! analysis and repetition normalization.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::grammar::functor::copy_expr;
use crate::grammar::{ExprId, Grammar, GrammarBuilder, GrammarExpr, RuleId};

/// Rebuild `grammar` with `rewrite_body` applied to each rule body, under
/// an identity rule map.
fn rebuild_rules(
    grammar: &Grammar,
    mut rewrite_body: impl FnMut(&Grammar, &mut GrammarBuilder, ExprId) -> ExprId,
) -> Grammar {
    let mut builder = GrammarBuilder::new();
    for rule_id in 0..grammar.num_rules() {
        builder.add_empty_rule(grammar.rule(rule_id).name.clone());
    }
    for rule_id in 0..grammar.num_rules() {
        let rule = grammar.rule(rule_id);
        let body = rewrite_body(grammar, &mut builder, rule.body);
        builder.update_rule_body(rule_id, body);
        if let Some(lookahead) = rule.lookahead {
            let new_lookahead = rewrite_body(grammar, &mut builder, lookahead);
            builder.update_lookahead_assertion(rule_id, Some(new_lookahead));
        }
        builder.update_lookahead_exact(rule_id, rule.lookahead_exact);
    }
    builder.build(grammar.root_rule_id())
}

// ==================== Byte-string fuser ====================

/// Merge adjacent byte-string atoms inside every sequence.
#[must_use]
pub fn fuse_byte_strings(grammar: &Grammar) -> Grammar {
    fn rewrite(grammar: &Grammar, builder: &mut GrammarBuilder, id: ExprId) -> ExprId {
        match grammar.expr(id) {
            GrammarExpr::Sequence(elements) => {
                let mut new_elements = Vec::new();
                let mut pending: Vec<u8> = Vec::new();
                for &element in elements {
                    if let GrammarExpr::ByteString(bytes) = grammar.expr(element) {
                        pending.extend_from_slice(bytes);
                    } else {
                        if !pending.is_empty() {
                            new_elements.push(builder.add_byte_string(&pending));
                            pending.clear();
                        }
                        new_elements.push(rewrite(grammar, builder, element));
                    }
                }
                if !pending.is_empty() {
                    new_elements.push(builder.add_byte_string(&pending));
                }
                builder.add_sequence(new_elements)
            }
            GrammarExpr::Choices(choices) => {
                let new_choices = choices
                    .iter()
                    .map(|&c| rewrite(grammar, builder, c))
                    .collect();
                builder.add_choices(new_choices)
            }
            _ => copy_expr(grammar, builder, id, &|r| r),
        }
    }
    rebuild_rules(grammar, rewrite)
}

// ==================== Rule inliner ====================

/// A rule can be inlined when its body is a non-empty `Choices` whose
/// alternatives are sequences of atoms containing no rule references.
fn can_inline(grammar: &Grammar, rule_id: RuleId) -> bool {
    let GrammarExpr::Choices(choices) = grammar.expr(grammar.rule(rule_id).body) else {
        return false;
    };
    if choices.is_empty() {
        return false;
    }
    for &choice in choices {
        match grammar.expr(choice) {
            GrammarExpr::EmptyStr => return false,
            GrammarExpr::Sequence(elements) => {
                for &element in elements {
                    if matches!(grammar.expr(element), GrammarExpr::RuleRef(_)) {
                        return false;
                    }
                }
            }
            _ => return false,
        }
    }
    true
}

/// Inline a rule reference at the head of a sequence when the referenced
/// rule's alternatives are plain atom sequences. Purely local; memoized.
#[must_use]
pub fn inline_rules(grammar: &Grammar) -> Grammar {
    let mut inlinable: HashMap<RuleId, bool> = HashMap::new();
    let can = |grammar: &Grammar, rule_id: RuleId, memo: &mut HashMap<RuleId, bool>| -> bool {
        *memo
            .entry(rule_id)
            .or_insert_with(|| can_inline(grammar, rule_id))
    };

    let mut builder = GrammarBuilder::new();
    for rule_id in 0..grammar.num_rules() {
        builder.add_empty_rule(grammar.rule(rule_id).name.clone());
    }
    for rule_id in 0..grammar.num_rules() {
        let rule = grammar.rule(rule_id);
        let body = match grammar.expr(rule.body) {
            GrammarExpr::Choices(choices) => {
                let mut new_choices = Vec::new();
                for &choice in choices {
                    match grammar.expr(choice) {
                        GrammarExpr::Sequence(elements) if !elements.is_empty() => {
                            let head = elements[0];
                            let inline_target = match grammar.expr(head) {
                                GrammarExpr::RuleRef(r)
                                    if can(grammar, *r, &mut inlinable) =>
                                {
                                    Some(*r)
                                }
                                _ => None,
                            };
                            if let Some(target) = inline_target {
                                let rest: Vec<ExprId> = elements[1..]
                                    .iter()
                                    .map(|&e| copy_expr(grammar, &mut builder, e, &|r| r))
                                    .collect();
                                let GrammarExpr::Choices(target_choices) =
                                    grammar.expr(grammar.rule(target).body)
                                else {
                                    unreachable!("inlinable rule body is choices");
                                };
                                for &target_choice in target_choices {
                                    let GrammarExpr::Sequence(target_elements) =
                                        grammar.expr(target_choice)
                                    else {
                                        unreachable!("inlinable alternative is a sequence");
                                    };
                                    let mut merged: Vec<ExprId> = target_elements
                                        .iter()
                                        .map(|&e| copy_expr(grammar, &mut builder, e, &|r| r))
                                        .collect();
                                    merged.extend(rest.iter().copied());
                                    new_choices.push(builder.add_sequence(merged));
                                }
                            } else {
                                new_choices.push(copy_expr(grammar, &mut builder, choice, &|r| r));
                            }
                        }
                        _ => new_choices.push(copy_expr(grammar, &mut builder, choice, &|r| r)),
                    }
                }
                builder.add_choices(new_choices)
            }
            _ => copy_expr(grammar, &mut builder, rule.body, &|r| r),
        };
        builder.update_rule_body(rule_id, body);
        if let Some(lookahead) = rule.lookahead {
            let copied = copy_expr(grammar, &mut builder, lookahead, &|r| r);
            builder.update_lookahead_assertion(rule_id, Some(copied));
        }
        builder.update_lookahead_exact(rule_id, rule.lookahead_exact);
    }
    builder.build(grammar.root_rule_id())
}

// ==================== Used-rule analysis + dead-code elimination ====================

fn expr_rule_refs(grammar: &Grammar, id: ExprId, out: &mut Vec<RuleId>) {
    match grammar.expr(id) {
        GrammarExpr::RuleRef(r) | GrammarExpr::Repeat { rule: r, .. } => out.push(*r),
        GrammarExpr::Sequence(ids) | GrammarExpr::Choices(ids) => {
            for &sub in ids {
                expr_rule_refs(grammar, sub, out);
            }
        }
        GrammarExpr::TagDispatch(td) => {
            for (_, r) in &td.tag_rule_pairs {
                out.push(*r);
            }
        }
        _ => {}
    }
}

/// BFS from the root over rule-reference, repeat and tag-dispatch edges.
/// Returns the used rule ids in ascending order.
#[must_use]
pub fn used_rules(grammar: &Grammar) -> Vec<RuleId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([grammar.root_rule_id()]);
    while let Some(rule_id) = queue.pop_front() {
        if !visited.insert(rule_id) {
            continue;
        }
        let rule = grammar.rule(rule_id);
        let mut refs = Vec::new();
        expr_rule_refs(grammar, rule.body, &mut refs);
        if let Some(lookahead) = rule.lookahead {
            expr_rule_refs(grammar, lookahead, &mut refs);
        }
        queue.extend(refs);
    }
    let mut result: Vec<RuleId> = visited.into_iter().collect();
    result.sort_unstable();
    result
}

/// Drop unreachable rules and compact the surviving rule ids.
#[must_use]
pub fn eliminate_dead_code(grammar: &Grammar) -> Grammar {
    let used = used_rules(grammar);
    let mut id_map: HashMap<RuleId, RuleId> = HashMap::new();
    let mut builder = GrammarBuilder::new();
    for &rule_id in &used {
        let new_id = builder.add_empty_rule(grammar.rule(rule_id).name.clone());
        id_map.insert(rule_id, new_id);
    }
    let rule_map = |old: RuleId| id_map[&old];
    for &rule_id in &used {
        let rule = grammar.rule(rule_id);
        let body = copy_expr(grammar, &mut builder, rule.body, &rule_map);
        builder.update_rule_body(id_map[&rule_id], body);
        if let Some(lookahead) = rule.lookahead {
            let copied = copy_expr(grammar, &mut builder, lookahead, &rule_map);
            builder.update_lookahead_assertion(id_map[&rule_id], Some(copied));
        }
        builder.update_lookahead_exact(id_map[&rule_id], rule.lookahead_exact);
    }
    builder.build(id_map[&grammar.root_rule_id()])
}

// ==================== Look-ahead assertion analysis ====================

enum LookaheadScan {
    /// The rule cannot take a detected look-ahead (tag-dispatch callee,
    /// tail occurrence, or multiple non-tail occurrences).
    Unusable,
    /// Exactly one non-tail occurrence; holds the tail elements after it.
    Found(Vec<ExprId>),
    /// No occurrence at all.
    NotFound,
}

fn scan_for_lookahead(grammar: &Grammar, rule_id: RuleId) -> LookaheadScan {
    let mut found: Option<Vec<ExprId>> = None;
    for other_id in 0..grammar.num_rules() {
        let other = grammar.rule(other_id);
        match grammar.expr(other.body) {
            GrammarExpr::TagDispatch(td) => {
                if td.tag_rule_pairs.iter().any(|(_, r)| *r == rule_id) {
                    return LookaheadScan::Unusable;
                }
            }
            GrammarExpr::Choices(choices) => {
                for &choice in choices {
                    let GrammarExpr::Sequence(elements) = grammar.expr(choice) else {
                        continue;
                    };
                    if elements.is_empty() {
                        continue;
                    }
                    if let Some(&last) = elements.last() {
                        if matches!(grammar.expr(last), GrammarExpr::RuleRef(r) if *r == rule_id)
                            && other_id != rule_id
                        {
                            return LookaheadScan::Unusable;
                        }
                    }
                    for (i, &element) in elements.iter().enumerate().take(elements.len() - 1) {
                        if matches!(grammar.expr(element), GrammarExpr::RuleRef(r) if *r == rule_id)
                        {
                            if found.is_some() {
                                return LookaheadScan::Unusable;
                            }
                            found = Some(elements[i + 1..].to_vec());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    match found {
        Some(tail) => LookaheadScan::Found(tail),
        None => LookaheadScan::NotFound,
    }
}

/// Detect look-ahead assertions for rules without a user-supplied one and
/// set the exact flag where the detected continuation is the only one.
#[must_use]
pub fn analyze_lookaheads(grammar: &Grammar) -> Grammar {
    if matches!(
        grammar.expr(grammar.root_rule().body),
        GrammarExpr::TagDispatch(_)
    ) {
        return grammar.clone();
    }
    let mut result = grammar.clone();
    for rule_id in 0..grammar.num_rules() {
        if rule_id == grammar.root_rule_id() {
            continue;
        }
        if grammar.rule(rule_id).lookahead.is_some() {
            let exact = matches!(scan_for_lookahead(grammar, rule_id), LookaheadScan::Found(_));
            result.rules[rule_id].lookahead_exact = exact;
            continue;
        }
        if let LookaheadScan::Found(tail) = scan_for_lookahead(grammar, rule_id) {
            // The tail expressions already live in this grammar's arena.
            result.exprs.push(GrammarExpr::Sequence(tail));
            let lookahead_id = result.exprs.len() - 1;
            result.rules[rule_id].lookahead = Some(lookahead_id);
            result.rules[rule_id].lookahead_exact = true;
        }
    }
    result
}

// ==================== Empty-rule analysis ====================

/// The inverted rule-reference graph: entry `r` lists the rules whose
/// bodies reference `r`.
pub(crate) fn rule_ref_graph(grammar: &Grammar) -> Vec<Vec<RuleId>> {
    let mut graph = vec![Vec::new(); grammar.num_rules()];
    for rule_id in 0..grammar.num_rules() {
        let mut refs = Vec::new();
        expr_rule_refs(grammar, grammar.rule(rule_id).body, &mut refs);
        for referee in refs {
            graph[referee].push(rule_id);
        }
    }
    for referrers in &mut graph {
        referrers.sort_unstable();
        referrers.dedup();
    }
    graph
}

fn sequence_is_epsilon(grammar: &Grammar, seq_id: ExprId, empty: &HashSet<RuleId>) -> bool {
    match grammar.expr(seq_id) {
        GrammarExpr::EmptyStr => true,
        GrammarExpr::Sequence(elements) => elements.iter().all(|&e| match grammar.expr(e) {
            GrammarExpr::CharacterClassStar { .. } => true,
            GrammarExpr::RuleRef(r) => empty.contains(r),
            GrammarExpr::Repeat { rule, min, .. } => *min == 0 || empty.contains(rule),
            _ => false,
        }),
        _ => false,
    }
}

/// Which rules can match the empty string. Propagates over the reversed
/// reference graph from the explicitly empty rules.
#[must_use]
pub fn allow_empty_rule_ids(grammar: &Grammar) -> Vec<RuleId> {
    let mut empty: HashSet<RuleId> = HashSet::new();
    // Step 1: rules that explicitly allow the empty string
    for rule_id in 0..grammar.num_rules() {
        let body = grammar.expr(grammar.rule(rule_id).body);
        let GrammarExpr::Choices(choices) = body else {
            continue;
        };
        if choices
            .first()
            .is_some_and(|&c| matches!(grammar.expr(c), GrammarExpr::EmptyStr))
        {
            empty.insert(rule_id);
            continue;
        }
        for &choice in choices {
            if let GrammarExpr::Sequence(elements) = grammar.expr(choice) {
                if elements
                    .iter()
                    .all(|&e| matches!(grammar.expr(e), GrammarExpr::CharacterClassStar { .. }))
                {
                    empty.insert(rule_id);
                    break;
                }
            }
        }
    }

    // Step 2: propagate over the reversed reference graph
    let graph = rule_ref_graph(grammar);
    let mut queue: VecDeque<RuleId> = empty.iter().copied().collect();
    while let Some(rule_id) = queue.pop_front() {
        for &referrer in &graph[rule_id] {
            if empty.contains(&referrer) {
                continue;
            }
            let body = grammar.expr(grammar.rule(referrer).body);
            let GrammarExpr::Choices(choices) = body else {
                continue;
            };
            if choices
                .iter()
                .any(|&c| sequence_is_epsilon(grammar, c, &empty))
            {
                empty.insert(referrer);
                queue.push_back(referrer);
            }
        }
    }

    let mut result: Vec<RuleId> = empty.into_iter().collect();
    result.sort_unstable();
    result
}

// ==================== Repetition normalizer ====================

/// For every `repeat(r, min, max)` mark `r`'s look-ahead as exact, and
/// rewrite `min` to 0 when `r` is nullable.
pub fn normalize_repetitions(grammar: &mut Grammar) {
    let mut exact_rules = Vec::new();
    for id in 0..grammar.exprs.len() {
        if let GrammarExpr::Repeat { rule, min, .. } = &mut grammar.exprs[id] {
            exact_rules.push(*rule);
            if grammar.allow_empty_rule_ids.binary_search(rule).is_ok() {
                *min = 0;
            }
        }
    }
    for rule in exact_rules {
        grammar.rules[rule].lookahead_exact = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::functor::normalize;

    fn parse(text: &str) -> Grammar {
        Grammar::from_ebnf(text, "root").expect("valid grammar")
    }

    #[test]
    fn test_fuse_byte_strings() {
        let grammar = parse(r#"root ::= "ab" "cd" [0-9] "e""#);
        let fused = fuse_byte_strings(&grammar);
        let GrammarExpr::Choices(choices) = fused.expr(fused.root_rule().body) else {
            panic!("choices");
        };
        let GrammarExpr::Sequence(elements) = fused.expr(choices[0]) else {
            panic!("sequence");
        };
        assert_eq!(elements.len(), 3);
        assert!(matches!(
            fused.expr(elements[0]),
            GrammarExpr::ByteString(b) if b == b"abcd"
        ));
    }

    #[test]
    fn test_inline_head_rule() {
        let grammar = parse(
            r#"root ::= sign [0-9]
sign ::= "+" | "-""#,
        );
        let inlined = inline_rules(&grammar);
        let GrammarExpr::Choices(choices) = inlined.expr(inlined.root_rule().body) else {
            panic!("choices");
        };
        assert_eq!(choices.len(), 2);
        for &choice in choices {
            let GrammarExpr::Sequence(elements) = inlined.expr(choice) else {
                panic!("sequence");
            };
            assert!(matches!(inlined.expr(elements[0]), GrammarExpr::ByteString(_)));
        }
    }

    #[test]
    fn test_inliner_skips_rules_with_refs() {
        let grammar = parse(
            r#"root ::= a [0-9]
a ::= b "x"
b ::= "y""#,
        );
        let inlined = inline_rules(&grammar);
        // `a` references `b`, so the head of root's sequence stays a ref
        let GrammarExpr::Choices(choices) = inlined.expr(inlined.root_rule().body) else {
            panic!("choices");
        };
        let GrammarExpr::Sequence(elements) = inlined.expr(choices[0]) else {
            panic!("sequence");
        };
        assert!(matches!(inlined.expr(elements[0]), GrammarExpr::RuleRef(_)));
    }

    #[test]
    fn test_dead_code_elimination() {
        let grammar = parse(
            r#"root ::= "a" used
used ::= "b"
unused ::= "c""#,
        );
        let cleaned = eliminate_dead_code(&grammar);
        assert_eq!(cleaned.num_rules(), 2);
        assert!((0..cleaned.num_rules()).all(|i| cleaned.rule(i).name != "unused"));
        assert!(cleaned.validate().is_ok());
    }

    #[test]
    fn test_lookahead_detection() {
        // `num` occurs exactly once, not in tail position; tail is ","
        let grammar = parse(
            r#"root ::= num "," [a-z]
num ::= [0-9]"#,
        );
        let analyzed = analyze_lookaheads(&grammar);
        let num = (0..analyzed.num_rules())
            .find(|&i| analyzed.rule(i).name == "num")
            .expect("num exists");
        assert!(analyzed.rule(num).lookahead.is_some());
        assert!(analyzed.rule(num).lookahead_exact);
    }

    #[test]
    fn test_lookahead_skipped_for_tail_occurrence() {
        let grammar = parse(
            r#"root ::= num "," num
num ::= [0-9]"#,
        );
        let analyzed = analyze_lookaheads(&grammar);
        let num = (0..analyzed.num_rules())
            .find(|&i| analyzed.rule(i).name == "num")
            .expect("num exists");
        assert!(analyzed.rule(num).lookahead.is_none());
    }

    #[test]
    fn test_allow_empty_analysis() {
        let grammar = parse(
            r#"root ::= maybe full
maybe ::= "x" | ""
full ::= "y""#,
        );
        let empty = allow_empty_rule_ids(&grammar);
        let maybe = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name == "maybe")
            .expect("maybe exists");
        let full = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name == "full")
            .expect("full exists");
        assert!(empty.contains(&maybe));
        assert!(!empty.contains(&full));
        // root requires `full`, so it is not nullable
        assert!(!empty.contains(&grammar.root_rule_id()));
    }

    #[test]
    fn test_allow_empty_propagates() {
        let grammar = parse(
            r#"root ::= a
a ::= b
b ::= [x]*"#,
        );
        let empty = allow_empty_rule_ids(&grammar);
        assert_eq!(empty.len(), 3);
    }

    #[test]
    fn test_repetition_normalizer_rewrites_nullable_min() {
        let mut grammar = parse(
            r#"root ::= inner{2,5}
inner ::= [x]*"#,
        );
        grammar.allow_empty_rule_ids = allow_empty_rule_ids(&grammar);
        normalize_repetitions(&mut grammar);
        let has_zero_min = (0..grammar.num_exprs())
            .any(|i| matches!(grammar.expr(i), GrammarExpr::Repeat { min: 0, max: 5, .. }));
        assert!(has_zero_min);
        let inner = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name == "inner")
            .expect("inner exists");
        assert!(grammar.rule(inner).lookahead_exact);
    }

    #[test]
    fn test_normalizer_pipeline_idempotent() {
        let grammar = parse(
            r#"root ::= ("a" | "b") num "," ("" | "c")
num ::= [0-9] [0-9]*"#,
        );
        let once = normalize(&grammar);
        let twice = normalize(&once);
        assert_eq!(once.to_string(), twice.to_string());
    }
}
