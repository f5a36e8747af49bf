//! Grammar functors: normalization, optimization and lowering passes
//!
//! Every pass consumes a grammar and produces a new one (the final lowering
//! passes attach annotations in place). The pipeline order is fixed:
//! normalization runs from every front end, optimization runs once in the
//! compiler driver, and FSM hashing runs only when the compiler cache is
//! enabled.

use crate::grammar::{ExprId, Grammar, GrammarBuilder, GrammarExpr, RuleId};

mod fsm_build;
mod hasher;
mod normalize;
mod optimize;

pub use hasher::hash_fsms;
pub use normalize::normalize;
pub use optimize::allow_empty_rule_ids;

/// Deep-copy an expression from `grammar` into `builder`, remapping rule
/// ids through `rule_map`.
pub(crate) fn copy_expr(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    id: ExprId,
    rule_map: &impl Fn(RuleId) -> RuleId,
) -> ExprId {
    match grammar.expr(id) {
        GrammarExpr::ByteString(bytes) => builder.add_byte_string(bytes),
        GrammarExpr::CharacterClass { negated, ranges } => {
            builder.add_character_class(ranges.clone(), *negated)
        }
        GrammarExpr::CharacterClassStar { negated, ranges } => {
            builder.add_character_class_star(ranges.clone(), *negated)
        }
        GrammarExpr::RuleRef(rule) => builder.add_rule_ref(rule_map(*rule)),
        GrammarExpr::Repeat { rule, min, max } => builder.add_repeat(rule_map(*rule), *min, *max),
        GrammarExpr::EmptyStr => builder.add_empty_str(),
        GrammarExpr::Sequence(elements) => {
            let copied = elements
                .iter()
                .map(|&e| copy_expr(grammar, builder, e, rule_map))
                .collect();
            builder.add_sequence(copied)
        }
        GrammarExpr::Choices(choices) => {
            let copied = choices
                .iter()
                .map(|&c| copy_expr(grammar, builder, c, rule_map))
                .collect();
            builder.add_choices(copied)
        }
        GrammarExpr::TagDispatch(td) => {
            let mut new_td = td.clone();
            for (_, rule) in &mut new_td.tag_rule_pairs {
                *rule = rule_map(*rule);
            }
            builder.add_tag_dispatch(new_td)
        }
    }
}

/// Add every rule of `sub_grammar` into `builder`, renaming on collision.
/// Returns the new id of the sub-grammar's root rule.
pub struct SubGrammarAdder;

impl SubGrammarAdder {
    /// Relocate `sub_grammar` into `builder`.
    pub fn apply(builder: &mut GrammarBuilder, sub_grammar: &Grammar) -> RuleId {
        let mut new_ids = Vec::with_capacity(sub_grammar.num_rules());
        for rule_id in 0..sub_grammar.num_rules() {
            let name = sub_grammar.rule(rule_id).name.clone();
            new_ids.push(builder.add_empty_rule_with_hint(&name));
        }
        let rule_map = |old: RuleId| new_ids[old];
        for rule_id in 0..sub_grammar.num_rules() {
            let rule = sub_grammar.rule(rule_id);
            let body = copy_expr(sub_grammar, builder, rule.body, &rule_map);
            builder.update_rule_body(new_ids[rule_id], body);
            if let Some(lookahead) = rule.lookahead {
                let copied = copy_expr(sub_grammar, builder, lookahead, &rule_map);
                builder.update_lookahead_assertion(new_ids[rule_id], Some(copied));
            }
            builder.update_lookahead_exact(new_ids[rule_id], rule.lookahead_exact);
        }
        new_ids[sub_grammar.root_rule_id()]
    }
}

impl Grammar {
    /// A grammar accepting a string from any of `grammars`.
    ///
    /// # Panics
    ///
    /// Panics if `grammars` is empty.
    #[must_use]
    pub fn union(grammars: &[Grammar]) -> Grammar {
        assert!(!grammars.is_empty(), "union of zero grammars");
        let mut builder = GrammarBuilder::new();
        let root = builder.add_empty_rule("root");
        let mut choices = Vec::with_capacity(grammars.len());
        for grammar in grammars {
            let sub_root = SubGrammarAdder::apply(&mut builder, grammar);
            let rule_ref = builder.add_rule_ref(sub_root);
            choices.push(builder.add_sequence(vec![rule_ref]));
        }
        let body = builder.add_choices(choices);
        builder.update_rule_body(root, body);
        normalize(&builder.build(root))
    }

    /// A grammar accepting the concatenation of one string from each of
    /// `grammars`, in order.
    ///
    /// # Panics
    ///
    /// Panics if `grammars` is empty.
    #[must_use]
    pub fn concat(grammars: &[Grammar]) -> Grammar {
        assert!(!grammars.is_empty(), "concat of zero grammars");
        let mut builder = GrammarBuilder::new();
        let root = builder.add_empty_rule("root");
        let mut elements = Vec::with_capacity(grammars.len());
        for grammar in grammars {
            let sub_root = SubGrammarAdder::apply(&mut builder, grammar);
            elements.push(builder.add_rule_ref(sub_root));
        }
        let seq = builder.add_sequence(elements);
        let body = builder.add_choices(vec![seq]);
        builder.update_rule_body(root, body);
        normalize(&builder.build(root))
    }
}

/// Run the whole optimization pipeline on a normalized grammar:
/// byte-string fusion, rule inlining, dead-code elimination, look-ahead
/// analysis, empty-rule analysis, repetition normalization and per-rule
/// FSM lowering.
#[must_use]
pub fn optimize(grammar: &Grammar) -> Grammar {
    let mut result = optimize::fuse_byte_strings(grammar);
    result = optimize::inline_rules(&result);
    result = optimize::eliminate_dead_code(&result);
    result = optimize::analyze_lookaheads(&result);
    result.allow_empty_rule_ids = optimize::allow_empty_rule_ids(&result);
    optimize::normalize_repetitions(&mut result);
    fsm_build::build_per_rule_fsms(&mut result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_grammar(s: &str) -> Grammar {
        Grammar::from_ebnf(&format!("root ::= \"{s}\""), "root").expect("valid")
    }

    #[test]
    fn test_union_accepts_both_roots() {
        let union = Grammar::union(&[literal_grammar("a"), literal_grammar("b")]);
        assert!(union.validate().is_ok());
        // root + 2 sub roots at least
        assert!(union.num_rules() >= 3);
    }

    #[test]
    fn test_concat_orders_roots() {
        let concat = Grammar::concat(&[literal_grammar("a"), literal_grammar("b")]);
        assert!(concat.validate().is_ok());
        let body = concat.expr(concat.root_rule().body);
        let GrammarExpr::Choices(choices) = body else {
            panic!("normalized body must be choices");
        };
        let GrammarExpr::Sequence(elements) = concat.expr(choices[0]) else {
            panic!("choice must be a sequence");
        };
        assert_eq!(elements.len(), 2);
    }

    #[test]
    fn test_sub_grammar_adder_renames_collisions() {
        let mut builder = GrammarBuilder::new();
        builder.add_empty_rule("root");
        let sub = literal_grammar("x");
        let new_root = SubGrammarAdder::apply(&mut builder, &sub);
        assert_ne!(builder.rule(new_root).name, "root");
    }
}
