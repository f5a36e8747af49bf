//! Structural normalization
//!
//! After normalization every non-macro rule body is a `Choices` whose
//! children are either one leading `EmptyStr` or `Sequence`s of atoms, and
//! every look-ahead body is a `Sequence` of atoms. Nested combinators are
//! flattened and `TagDispatch` expressions that appear inside a larger body
//! are hoisted into fresh rules.

use crate::grammar::functor::copy_expr;
use crate::grammar::{ExprId, Grammar, GrammarBuilder, GrammarExpr};

/// Normalize `grammar`: single-element elimination followed by structure
/// normalization.
#[must_use]
pub fn normalize(grammar: &Grammar) -> Grammar {
    let simplified = eliminate_single_element_exprs(grammar);
    StructureNormalizer::apply(&simplified)
}

/// `sequence(x)` → `x`; `choices(x)` → `x`; a single-character positive
/// class → its UTF-8 byte string.
fn eliminate_single_element_exprs(grammar: &Grammar) -> Grammar {
    let mut builder = GrammarBuilder::new();
    for rule_id in 0..grammar.num_rules() {
        builder.add_empty_rule(grammar.rule(rule_id).name.clone());
    }
    for rule_id in 0..grammar.num_rules() {
        let rule = grammar.rule(rule_id);
        let body = eliminate_in_expr(grammar, &mut builder, rule.body);
        builder.update_rule_body(rule_id, body);
        if let Some(lookahead) = rule.lookahead {
            let new_lookahead = eliminate_in_expr(grammar, &mut builder, lookahead);
            builder.update_lookahead_assertion(rule_id, Some(new_lookahead));
        }
        builder.update_lookahead_exact(rule_id, rule.lookahead_exact);
    }
    builder.build(grammar.root_rule_id())
}

fn eliminate_in_expr(grammar: &Grammar, builder: &mut GrammarBuilder, id: ExprId) -> ExprId {
    match grammar.expr(id) {
        GrammarExpr::Sequence(elements) => {
            let new_elements: Vec<ExprId> = elements
                .iter()
                .map(|&e| eliminate_in_expr(grammar, builder, e))
                .collect();
            if new_elements.len() == 1 {
                new_elements[0]
            } else {
                builder.add_sequence(new_elements)
            }
        }
        GrammarExpr::Choices(choices) => {
            let new_choices: Vec<ExprId> = choices
                .iter()
                .map(|&c| eliminate_in_expr(grammar, builder, c))
                .collect();
            if new_choices.len() == 1 {
                new_choices[0]
            } else {
                builder.add_choices(new_choices)
            }
        }
        GrammarExpr::CharacterClass { negated: false, ranges } if ranges.len() == 1
            && ranges[0].0 == ranges[0].1 =>
        {
            match char::from_u32(ranges[0].0) {
                Some(c) => {
                    let mut buf = [0u8; 4];
                    builder.add_byte_string(c.encode_utf8(&mut buf).as_bytes())
                }
                None => copy_expr(grammar, builder, id, &|r| r),
            }
        }
        _ => copy_expr(grammar, builder, id, &|r| r),
    }
}

struct StructureNormalizer<'g> {
    grammar: &'g Grammar,
    builder: GrammarBuilder,
    cur_rule_name: String,
}

impl<'g> StructureNormalizer<'g> {
    fn apply(grammar: &'g Grammar) -> Grammar {
        let mut normalizer = Self {
            grammar,
            builder: GrammarBuilder::new(),
            cur_rule_name: String::new(),
        };
        for rule_id in 0..grammar.num_rules() {
            normalizer
                .builder
                .add_empty_rule(grammar.rule(rule_id).name.clone());
        }
        for rule_id in 0..grammar.num_rules() {
            let rule = grammar.rule(rule_id);
            normalizer.cur_rule_name.clone_from(&rule.name);
            let body = normalizer.visit_rule_body(rule.body);
            normalizer.builder.update_rule_body(rule_id, body);
            if let Some(lookahead) = rule.lookahead {
                let new_lookahead = normalizer.visit_lookahead(lookahead);
                normalizer
                    .builder
                    .update_lookahead_assertion(rule_id, Some(new_lookahead));
            }
            normalizer
                .builder
                .update_lookahead_exact(rule_id, rule.lookahead_exact);
        }
        normalizer.builder.build(grammar.root_rule_id())
    }

    fn copy(&mut self, id: ExprId) -> ExprId {
        copy_expr(self.grammar, &mut self.builder, id, &|r| r)
    }

    fn visit_lookahead(&mut self, id: ExprId) -> ExprId {
        match self.grammar.expr(id) {
            GrammarExpr::Sequence(elements) => {
                let ids = elements.clone();
                let new_elements = self.visit_sequence_elements(&ids);
                self.builder.add_sequence(new_elements)
            }
            expr if expr.is_atom() => {
                let atom = self.copy(id);
                self.builder.add_sequence(vec![atom])
            }
            _ => {
                // Alternation inside a look-ahead is hoisted into a fresh
                // rule so the assertion stays a sequence of atoms.
                let body = self.visit_rule_body(id);
                let hint = self.cur_rule_name.clone();
                let rule = self.builder.add_rule_with_hint(&hint, body);
                let rule_ref = self.builder.add_rule_ref(rule);
                self.builder.add_sequence(vec![rule_ref])
            }
        }
    }

    fn visit_rule_body(&mut self, id: ExprId) -> ExprId {
        match self.grammar.expr(id) {
            GrammarExpr::Sequence(elements) => {
                let ids = elements.clone();
                let new_elements = self.visit_sequence_elements(&ids);
                let seq = self.builder.add_sequence(new_elements);
                self.builder.add_choices(vec![seq])
            }
            GrammarExpr::Choices(choices) => {
                let ids = choices.clone();
                let new_choices = self.visit_choice_list(&ids);
                self.builder.add_choices(new_choices)
            }
            GrammarExpr::EmptyStr => {
                let empty = self.builder.add_empty_str();
                self.builder.add_choices(vec![empty])
            }
            GrammarExpr::TagDispatch(_) => self.copy(id),
            _ => {
                let atom = self.copy(id);
                let seq = self.builder.add_sequence(vec![atom]);
                self.builder.add_choices(vec![seq])
            }
        }
    }

    /// Visit a choices expression, returning the flattened alternative
    /// list. An empty-word alternative, if found anywhere, is placed first.
    fn visit_choice_list(&mut self, choice_ids: &[ExprId]) -> Vec<ExprId> {
        let mut new_choices = Vec::new();
        let mut found_empty = false;
        for &choice_id in choice_ids {
            match self.grammar.expr(choice_id) {
                GrammarExpr::Sequence(elements) => {
                    let ids = elements.clone();
                    let new_elements = self.visit_sequence_elements(&ids);
                    if new_elements.is_empty() {
                        found_empty = true;
                    } else {
                        new_choices.push(self.builder.add_sequence(new_elements));
                    }
                }
                GrammarExpr::Choices(nested) => {
                    let ids = nested.clone();
                    let sub_choices = self.visit_choice_list(&ids);
                    let starts_empty = matches!(
                        self.builder.expr(sub_choices[0]),
                        GrammarExpr::EmptyStr
                    );
                    if starts_empty {
                        found_empty = true;
                        new_choices.extend(&sub_choices[1..]);
                    } else {
                        new_choices.extend(&sub_choices);
                    }
                }
                GrammarExpr::EmptyStr => found_empty = true,
                GrammarExpr::TagDispatch(_) => {
                    let dispatch = self.copy(choice_id);
                    let hint = self.cur_rule_name.clone();
                    let rule = self.builder.add_rule_with_hint(&hint, dispatch);
                    let rule_ref = self.builder.add_rule_ref(rule);
                    new_choices.push(self.builder.add_sequence(vec![rule_ref]));
                }
                _ => {
                    let atom = self.copy(choice_id);
                    new_choices.push(self.builder.add_sequence(vec![atom]));
                }
            }
        }
        if found_empty {
            let empty = self.builder.add_empty_str();
            new_choices.insert(0, empty);
        }
        assert!(!new_choices.is_empty(), "choices normalized to nothing");
        new_choices
    }

    /// Visit a sequence, returning the flattened atom list.
    fn visit_sequence_elements(&mut self, element_ids: &[ExprId]) -> Vec<ExprId> {
        let mut new_elements = Vec::new();
        for &element_id in element_ids {
            match self.grammar.expr(element_id) {
                GrammarExpr::Sequence(nested) => {
                    let ids = nested.clone();
                    new_elements.extend(self.visit_sequence_elements(&ids));
                }
                GrammarExpr::Choices(nested) => {
                    let ids = nested.clone();
                    let sub_choices = self.visit_choice_list(&ids);
                    if sub_choices.len() == 1 {
                        match self.builder.expr(sub_choices[0]).clone() {
                            GrammarExpr::EmptyStr => {}
                            GrammarExpr::Sequence(inner) => new_elements.extend(inner),
                            _ => new_elements.push(sub_choices[0]),
                        }
                    } else {
                        let choices = self.builder.add_choices(sub_choices);
                        let hint = self.cur_rule_name.clone();
                        let rule = self.builder.add_rule_with_hint(&hint, choices);
                        new_elements.push(self.builder.add_rule_ref(rule));
                    }
                }
                GrammarExpr::EmptyStr => {}
                GrammarExpr::TagDispatch(_) => {
                    let dispatch = self.copy(element_id);
                    let hint = self.cur_rule_name.clone();
                    let rule = self.builder.add_rule_with_hint(&hint, dispatch);
                    new_elements.push(self.builder.add_rule_ref(rule));
                }
                _ => new_elements.push(self.copy(element_id)),
            }
        }
        new_elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::RuleId;

    fn assert_normalized(grammar: &Grammar) {
        for rule_id in 0..grammar.num_rules() {
            let body = grammar.expr(grammar.rule(rule_id).body);
            match body {
                GrammarExpr::TagDispatch(_) => continue,
                GrammarExpr::Choices(choices) => {
                    for (i, &c) in choices.iter().enumerate() {
                        match grammar.expr(c) {
                            GrammarExpr::EmptyStr => assert_eq!(i, 0, "empty must be first"),
                            GrammarExpr::Sequence(elements) => {
                                for &e in elements {
                                    assert!(
                                        grammar.expr(e).is_atom(),
                                        "sequence element must be an atom"
                                    );
                                }
                            }
                            other => panic!("bad choice shape: {other:?}"),
                        }
                    }
                }
                other => panic!("rule body must be choices or tag dispatch: {other:?}"),
            }
            if let Some(lookahead) = grammar.rule(rule_id).lookahead {
                let GrammarExpr::Sequence(elements) = grammar.expr(lookahead) else {
                    panic!("look-ahead must be a sequence");
                };
                for &e in elements {
                    assert!(grammar.expr(e).is_atom());
                }
            }
        }
    }

    fn build_and_normalize(build: impl FnOnce(&mut GrammarBuilder) -> RuleId) -> Grammar {
        let mut builder = GrammarBuilder::new();
        let root = build(&mut builder);
        normalize(&builder.build(root))
    }

    #[test]
    fn test_nested_sequences_flatten() {
        let grammar = build_and_normalize(|b| {
            let a = b.add_byte_string(b"a");
            let bb = b.add_byte_string(b"b");
            let c = b.add_byte_string(b"c");
            let inner = b.add_sequence(vec![bb, c]);
            let outer = b.add_sequence(vec![a, inner]);
            b.add_rule("root", outer)
        });
        assert_normalized(&grammar);
        let GrammarExpr::Choices(choices) = grammar.expr(grammar.root_rule().body) else {
            panic!("choices");
        };
        let GrammarExpr::Sequence(elements) = grammar.expr(choices[0]) else {
            panic!("sequence");
        };
        assert_eq!(elements.len(), 3);
    }

    #[test]
    fn test_nested_choices_flatten_with_empty_first() {
        let grammar = build_and_normalize(|b| {
            let a = b.add_byte_string(b"a");
            let empty = b.add_empty_str();
            let bb = b.add_byte_string(b"b");
            let inner = b.add_choices(vec![bb, empty]);
            let outer = b.add_choices(vec![a, inner]);
            b.add_rule("root", outer)
        });
        assert_normalized(&grammar);
        let GrammarExpr::Choices(choices) = grammar.expr(grammar.root_rule().body) else {
            panic!("choices");
        };
        assert_eq!(choices.len(), 3);
        assert!(matches!(grammar.expr(choices[0]), GrammarExpr::EmptyStr));
    }

    #[test]
    fn test_choices_in_sequence_hoisted() {
        let grammar = build_and_normalize(|b| {
            let a = b.add_byte_string(b"a");
            let c = b.add_byte_string(b"c");
            let d = b.add_byte_string(b"d");
            let alt = b.add_choices(vec![c, d]);
            let seq = b.add_sequence(vec![a, alt]);
            b.add_rule("root", seq)
        });
        assert_normalized(&grammar);
        // The alternation became a fresh rule
        assert_eq!(grammar.num_rules(), 2);
    }

    #[test]
    fn test_tag_dispatch_hoisted_from_choice() {
        let grammar = build_and_normalize(|b| {
            let rule_a = {
                let body = b.add_byte_string(b"x");
                b.add_rule("a", body)
            };
            let dispatch = b.add_tag_dispatch(crate::grammar::TagDispatch {
                tag_rule_pairs: vec![("<t>".to_string(), rule_a)],
                stop_eos: true,
                stop_strs: vec![],
                loop_after_dispatch: true,
                excludes: vec![],
            });
            let plain = b.add_byte_string(b"y");
            let choices = b.add_choices(vec![plain, dispatch]);
            b.add_rule("root", choices)
        });
        assert_normalized(&grammar);
        // root, a, plus the hoisted dispatch rule
        assert_eq!(grammar.num_rules(), 3);
    }

    #[test]
    fn test_normalize_idempotent() {
        let grammar = build_and_normalize(|b| {
            let a = b.add_byte_string(b"a");
            let empty = b.add_empty_str();
            let inner = b.add_choices(vec![empty, a]);
            let c = b.add_byte_string(b"c");
            let seq = b.add_sequence(vec![inner, c]);
            b.add_rule("root", seq)
        });
        let again = normalize(&grammar);
        assert_eq!(grammar.to_string(), again.to_string());
    }

    #[test]
    fn test_single_char_class_becomes_byte_string() {
        let grammar = build_and_normalize(|b| {
            let class = b.add_character_class(vec![(u32::from(b'x'), u32::from(b'x'))], false);
            b.add_rule("root", class)
        });
        let GrammarExpr::Choices(choices) = grammar.expr(grammar.root_rule().body) else {
            panic!("choices");
        };
        let GrammarExpr::Sequence(elements) = grammar.expr(choices[0]) else {
            panic!("sequence");
        };
        assert!(matches!(
            grammar.expr(elements[0]),
            GrammarExpr::ByteString(b) if b == b"x"
        ));
    }
}
