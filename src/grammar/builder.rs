//! Append-only grammar builder
//!
//! The builder is the only way to grow a grammar. It guarantees rule-name
//! uniqueness (hints are suffixed `_1`, `_2`, ... on collision) and supports
//! reserving empty rules whose bodies are filled in later, which is how
//! recursive rule shapes are constructed.

use std::collections::HashMap;

use crate::grammar::{ExprId, Grammar, GrammarExpr, Rule, RuleId, TagDispatch};

/// Builder over a growing expression arena and rule list.
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    exprs: Vec<GrammarExpr>,
    rules: Vec<Rule>,
    names_in_use: HashMap<String, u32>,
}

impl GrammarBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add_expr(&mut self, expr: GrammarExpr) -> ExprId {
        self.exprs.push(expr);
        self.exprs.len() - 1
    }

    /// Add a literal byte string expression.
    pub fn add_byte_string(&mut self, bytes: &[u8]) -> ExprId {
        self.add_expr(GrammarExpr::ByteString(bytes.to_vec()))
    }

    /// Add a character class expression over code-point ranges.
    pub fn add_character_class(&mut self, ranges: Vec<(u32, u32)>, negated: bool) -> ExprId {
        self.add_expr(GrammarExpr::CharacterClass { negated, ranges })
    }

    /// Add the Kleene closure of a character class.
    pub fn add_character_class_star(&mut self, ranges: Vec<(u32, u32)>, negated: bool) -> ExprId {
        self.add_expr(GrammarExpr::CharacterClassStar { negated, ranges })
    }

    /// Add a rule reference expression.
    pub fn add_rule_ref(&mut self, rule_id: RuleId) -> ExprId {
        self.add_expr(GrammarExpr::RuleRef(rule_id))
    }

    /// Add a bounded repetition of `rule`; `max == u32::MAX` means
    /// unbounded.
    pub fn add_repeat(&mut self, rule: RuleId, min: u32, max: u32) -> ExprId {
        self.add_expr(GrammarExpr::Repeat { rule, min, max })
    }

    /// Add the empty-word expression.
    pub fn add_empty_str(&mut self) -> ExprId {
        self.add_expr(GrammarExpr::EmptyStr)
    }

    /// Add an ordered concatenation.
    pub fn add_sequence(&mut self, elements: Vec<ExprId>) -> ExprId {
        self.add_expr(GrammarExpr::Sequence(elements))
    }

    /// Add an ordered alternation.
    pub fn add_choices(&mut self, choices: Vec<ExprId>) -> ExprId {
        self.add_expr(GrammarExpr::Choices(choices))
    }

    /// Add a tag-dispatch macro expression.
    pub fn add_tag_dispatch(&mut self, tag_dispatch: TagDispatch) -> ExprId {
        self.add_expr(GrammarExpr::TagDispatch(tag_dispatch))
    }

    /// Re-add an expression cloned from another grammar, remapping nothing.
    /// The caller is responsible for reference validity.
    pub fn add_cloned_expr(&mut self, expr: GrammarExpr) -> ExprId {
        self.add_expr(expr)
    }

    /// The expression with id `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    #[must_use]
    pub fn expr(&self, id: ExprId) -> &GrammarExpr {
        &self.exprs[id]
    }

    /// Number of rules added so far.
    #[must_use]
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// The rule with id `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    #[must_use]
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id]
    }

    /// Make `name` unique among the rules added so far.
    pub fn allocate_rule_name(&mut self, hint: &str) -> String {
        match self.names_in_use.get(hint).copied() {
            None => {
                self.names_in_use.insert(hint.to_string(), 0);
                hint.to_string()
            }
            Some(n) => {
                let mut counter = n + 1;
                loop {
                    let candidate = format!("{hint}_{counter}");
                    if !self.names_in_use.contains_key(&candidate) {
                        self.names_in_use.insert(hint.to_string(), counter);
                        self.names_in_use.insert(candidate.clone(), 0);
                        return candidate;
                    }
                    counter += 1;
                }
            }
        }
    }

    /// Add a rule with exactly `name`. The name must not be in use.
    ///
    /// # Panics
    ///
    /// Panics if `name` was already added.
    pub fn add_rule(&mut self, name: impl Into<String>, body: ExprId) -> RuleId {
        let name = name.into();
        assert!(
            !self.names_in_use.contains_key(&name),
            "duplicate rule name: {name}"
        );
        self.names_in_use.insert(name.clone(), 0);
        self.rules.push(Rule {
            name,
            body,
            lookahead: None,
            lookahead_exact: false,
        });
        self.rules.len() - 1
    }

    /// Add a rule named after `hint`, disambiguating on collision.
    pub fn add_rule_with_hint(&mut self, hint: &str, body: ExprId) -> RuleId {
        let name = self.allocate_rule_name(hint);
        self.rules.push(Rule {
            name,
            body,
            lookahead: None,
            lookahead_exact: false,
        });
        self.rules.len() - 1
    }

    /// Reserve a rule with exactly `name` whose body is filled later via
    /// [`Self::update_rule_body`].
    ///
    /// # Panics
    ///
    /// Panics if `name` was already added.
    pub fn add_empty_rule(&mut self, name: impl Into<String>) -> RuleId {
        let placeholder = self.add_empty_str();
        self.add_rule(name, placeholder)
    }

    /// Reserve a rule named after `hint` whose body is filled later.
    pub fn add_empty_rule_with_hint(&mut self, hint: &str) -> RuleId {
        let placeholder = self.add_empty_str();
        self.add_rule_with_hint(hint, placeholder)
    }

    /// Fill in the body of a reserved rule.
    pub fn update_rule_body(&mut self, rule_id: RuleId, body: ExprId) {
        self.rules[rule_id].body = body;
    }

    /// Attach or clear a look-ahead assertion.
    pub fn update_lookahead_assertion(&mut self, rule_id: RuleId, expr_id: Option<ExprId>) {
        self.rules[rule_id].lookahead = expr_id;
    }

    /// Set the exact-look-ahead flag.
    pub fn update_lookahead_exact(&mut self, rule_id: RuleId, exact: bool) {
        self.rules[rule_id].lookahead_exact = exact;
    }

    /// Whether a rule with `name` exists, and its id.
    #[must_use]
    pub fn rule_id_by_name(&self, name: &str) -> Option<RuleId> {
        self.rules.iter().position(|r| r.name == name)
    }

    /// Finish, producing a grammar rooted at `root_rule_id`.
    ///
    /// # Panics
    ///
    /// Panics if `root_rule_id` is out of range.
    #[must_use]
    pub fn build(self, root_rule_id: RuleId) -> Grammar {
        assert!(root_rule_id < self.rules.len(), "root rule out of range");
        let num_rules = self.rules.len();
        Grammar {
            exprs: self.exprs,
            rules: self.rules,
            root_rule_id,
            complete_fsm: None,
            per_rule_fsms: vec![None; num_rules],
            allow_empty_rule_ids: Vec::new(),
            per_rule_fsm_hashes: vec![None; num_rules],
            per_rule_fsm_state_renumbering: vec![None; num_rules],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_disambiguation() {
        let mut builder = GrammarBuilder::new();
        let body = builder.add_empty_str();
        let a = builder.add_rule_with_hint("tag", body);
        let b = builder.add_rule_with_hint("tag", body);
        let c = builder.add_rule_with_hint("tag", body);
        assert_eq!(builder.rule(a).name, "tag");
        assert_eq!(builder.rule(b).name, "tag_1");
        assert_eq!(builder.rule(c).name, "tag_2");
    }

    #[test]
    fn test_hint_collision_with_explicit_name() {
        let mut builder = GrammarBuilder::new();
        let body = builder.add_empty_str();
        builder.add_rule("x_1", body);
        let a = builder.add_rule_with_hint("x", body);
        let b = builder.add_rule_with_hint("x", body);
        assert_eq!(builder.rule(a).name, "x");
        // "x_1" is taken by the explicit rule, so the hint skips to "x_2"
        assert_eq!(builder.rule(b).name, "x_2");
    }

    #[test]
    fn test_deferred_body() {
        let mut builder = GrammarBuilder::new();
        let rule = builder.add_empty_rule("loop");
        let self_ref = builder.add_rule_ref(rule);
        let byte_string = builder.add_byte_string(b"a");
        let seq = builder.add_sequence(vec![byte_string, self_ref]);
        builder.update_rule_body(rule, seq);
        let grammar = builder.build(rule);
        assert!(matches!(
            grammar.expr(grammar.rule(rule).body),
            GrammarExpr::Sequence(_)
        ));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "duplicate rule name")]
    fn test_duplicate_name_panics() {
        let mut builder = GrammarBuilder::new();
        let body = builder.add_empty_str();
        builder.add_rule("root", body);
        builder.add_rule("root", body);
    }
}
