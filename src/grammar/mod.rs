//! Grammar intermediate representation
//!
//! A grammar is an arena of typed expressions plus a list of rules, each
//! rule owning one body expression and an optional look-ahead assertion.
//! Rules reference each other by integer id only; cycles are legitimate.
//!
//! After the functor pipeline has run, a grammar additionally carries the
//! lowering annotations: the shared compact FSM arena, per-rule FSM views,
//! the nullable-rule set and (when the compiler cache is enabled) per-rule
//! content hashes with canonical state renumberings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MoldearError, Result};
use crate::fsm::{CompactFsm, CompactFsmWithStartEnd};

pub mod builder;
pub mod ebnf;
pub mod functor;

pub use builder::GrammarBuilder;

/// Index of an expression in the grammar's arena.
pub type ExprId = usize;

/// Index of a rule.
pub type RuleId = usize;

/// The tag-dispatch macro payload: accept free text until a trigger prefix
/// is seen, dispatch to the matching rule, then loop or stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDispatch {
    /// (trigger, rule) pairs; the trigger is a prefix of the tag's begin
    /// marker and dispatch continues in the referenced rule.
    pub tag_rule_pairs: Vec<(String, RuleId)>,
    /// Whether free text may run until end of stream.
    pub stop_eos: bool,
    /// Stop strings that terminate the free text when `stop_eos` is false.
    pub stop_strs: Vec<String>,
    /// Whether to return to free text after a dispatched rule completes.
    pub loop_after_dispatch: bool,
    /// Substrings forbidden inside the free text.
    pub excludes: Vec<String>,
}

/// One expression in the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrammarExpr {
    /// Literal byte sequence
    ByteString(Vec<u8>),
    /// Set of Unicode code points, possibly negated
    CharacterClass {
        /// Whether the class is negated
        negated: bool,
        /// Inclusive code-point ranges
        ranges: Vec<(u32, u32)>,
    },
    /// Kleene closure of a character class (atomic)
    CharacterClassStar {
        /// Whether the class is negated
        negated: bool,
        /// Inclusive code-point ranges
        ranges: Vec<(u32, u32)>,
    },
    /// Reference to another rule
    RuleRef(RuleId),
    /// Bounded repetition of a rule; `max == u32::MAX` means unbounded
    Repeat {
        /// Repeated rule
        rule: RuleId,
        /// Minimum repetitions
        min: u32,
        /// Maximum repetitions (`u32::MAX` = unbounded)
        max: u32,
    },
    /// The empty word
    EmptyStr,
    /// Ordered concatenation
    Sequence(Vec<ExprId>),
    /// Ordered alternation; an empty-word alternative, if present, is
    /// always the first child
    Choices(Vec<ExprId>),
    /// Tag-dispatch macro
    TagDispatch(TagDispatch),
}

impl GrammarExpr {
    /// Whether this expression is an atom in the normalized form.
    #[must_use]
    pub fn is_atom(&self) -> bool {
        matches!(
            self,
            GrammarExpr::ByteString(_)
                | GrammarExpr::CharacterClass { .. }
                | GrammarExpr::CharacterClassStar { .. }
                | GrammarExpr::RuleRef(_)
                | GrammarExpr::Repeat { .. }
        )
    }
}

/// A named rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule name
    pub name: String,
    /// Body expression id
    pub body: ExprId,
    /// Optional look-ahead assertion (a sequence of atoms after
    /// normalization)
    pub lookahead: Option<ExprId>,
    /// Whether the look-ahead is the only possible continuation
    pub lookahead_exact: bool,
}

/// A complete grammar: expression arena, rules and root rule id, plus the
/// annotations attached by the lowering passes.
#[derive(Debug, Clone, Default)]
pub struct Grammar {
    pub(crate) exprs: Vec<GrammarExpr>,
    pub(crate) rules: Vec<Rule>,
    pub(crate) root_rule_id: RuleId,
    /// Shared state arena for all per-rule FSMs
    pub(crate) complete_fsm: Option<Arc<CompactFsm>>,
    /// Per-rule FSM views into `complete_fsm`
    pub(crate) per_rule_fsms: Vec<Option<CompactFsmWithStartEnd>>,
    /// Sorted ids of rules that can match the empty string
    pub(crate) allow_empty_rule_ids: Vec<RuleId>,
    /// Per-rule canonical FSM content hashes (cache enabled only)
    pub(crate) per_rule_fsm_hashes: Vec<Option<u64>>,
    /// Per-rule canonical state renumbering, `(original, canonical)` pairs
    pub(crate) per_rule_fsm_state_renumbering: Vec<Option<Vec<(usize, usize)>>>,
}

impl Grammar {
    /// Number of rules.
    #[must_use]
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Number of expressions in the arena.
    #[must_use]
    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
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

    /// The expression with id `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    #[must_use]
    pub fn expr(&self, id: ExprId) -> &GrammarExpr {
        &self.exprs[id]
    }

    /// The root rule id.
    #[must_use]
    pub fn root_rule_id(&self) -> RuleId {
        self.root_rule_id
    }

    /// The root rule.
    #[must_use]
    pub fn root_rule(&self) -> &Rule {
        &self.rules[self.root_rule_id]
    }

    /// The per-rule FSM view for `rule_id`, if the rule was lowered.
    #[must_use]
    pub fn per_rule_fsm(&self, rule_id: RuleId) -> Option<&CompactFsmWithStartEnd> {
        self.per_rule_fsms.get(rule_id).and_then(Option::as_ref)
    }

    /// The per-rule canonical FSM hash for `rule_id`, if computed.
    #[must_use]
    pub fn per_rule_fsm_hash(&self, rule_id: RuleId) -> Option<u64> {
        self.per_rule_fsm_hashes.get(rule_id).and_then(|h| *h)
    }

    /// Canonical state id for `(rule_id, state)`, if the rule was hashed.
    #[must_use]
    pub fn canonical_state_id(&self, rule_id: RuleId, state: usize) -> Option<usize> {
        self.per_rule_fsm_state_renumbering
            .get(rule_id)
            .and_then(Option::as_ref)
            .and_then(|pairs| {
                pairs
                    .iter()
                    .find(|(original, _)| *original == state)
                    .map(|(_, canonical)| *canonical)
            })
    }

    /// Whether `rule_id` can match the empty string (valid after the
    /// empty-rule analyzer has run).
    #[must_use]
    pub fn allows_empty(&self, rule_id: RuleId) -> bool {
        self.allow_empty_rule_ids.binary_search(&rule_id).is_ok()
    }

    /// The tag-dispatch payload of an expression.
    ///
    /// # Panics
    ///
    /// Panics if the expression is not a tag dispatch.
    #[must_use]
    pub fn tag_dispatch(&self, id: ExprId) -> &TagDispatch {
        match &self.exprs[id] {
            GrammarExpr::TagDispatch(td) => td,
            other => panic!("expression {id} is not a tag dispatch: {other:?}"),
        }
    }

    /// A stable content hash of a look-ahead sequence, used by the
    /// crossing cache's look-ahead-aware key.
    #[must_use]
    pub fn hash_sequence(&self, expr_id: Option<ExprId>) -> Option<u64> {
        use crate::support::hashing::{fnv1a_hash, hash_combine};
        let expr_id = expr_id?;
        let mut hash = 0u64;
        let mut stack = vec![expr_id];
        while let Some(id) = stack.pop() {
            match &self.exprs[id] {
                GrammarExpr::ByteString(bytes) => {
                    hash = hash_combine(hash, fnv1a_hash(bytes));
                }
                GrammarExpr::CharacterClass { negated, ranges }
                | GrammarExpr::CharacterClassStar { negated, ranges } => {
                    hash = hash_combine(hash, u64::from(*negated));
                    for &(lo, hi) in ranges {
                        hash = hash_combine(hash, (u64::from(lo) << 32) | u64::from(hi));
                    }
                }
                GrammarExpr::RuleRef(r) => {
                    // Prefer the referenced rule's structural hash so the
                    // combined key survives rule renumbering.
                    let rule_hash = self.per_rule_fsm_hash(*r).unwrap_or(*r as u64);
                    hash = hash_combine(hash, rule_hash);
                }
                GrammarExpr::Repeat { rule, min, max } => {
                    let rule_hash = self.per_rule_fsm_hash(*rule).unwrap_or(*rule as u64);
                    hash = hash_combine(hash, rule_hash);
                    hash = hash_combine(hash, (u64::from(*min) << 32) | u64::from(*max));
                }
                GrammarExpr::EmptyStr => {
                    hash = hash_combine(hash, 0x9e3779b9);
                }
                GrammarExpr::Sequence(ids) | GrammarExpr::Choices(ids) => {
                    stack.extend(ids.iter().rev());
                }
                GrammarExpr::TagDispatch(_) => return None,
            }
        }
        Some(hash)
    }

    /// Validate that every rule reference points at an existing rule.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidConfiguration`] on a dangling rule
    /// reference or an out-of-range root id.
    pub fn validate(&self) -> Result<()> {
        if self.root_rule_id >= self.rules.len() {
            return Err(MoldearError::InvalidConfiguration(format!(
                "root rule id {} out of range ({} rules)",
                self.root_rule_id,
                self.rules.len()
            )));
        }
        for expr in &self.exprs {
            let check = |rule_id: RuleId| -> Result<()> {
                if rule_id >= self.rules.len() {
                    return Err(MoldearError::InvalidConfiguration(format!(
                        "dangling rule reference {rule_id}"
                    )));
                }
                Ok(())
            };
            match expr {
                GrammarExpr::RuleRef(r) | GrammarExpr::Repeat { rule: r, .. } => check(*r)?,
                GrammarExpr::TagDispatch(td) => {
                    for (_, r) in &td.tag_rule_pairs {
                        check(*r)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Approximate heap footprint in bytes, used for cache accounting.
    #[must_use]
    pub fn memory_size_bytes(&self) -> usize {
        let mut total = self.exprs.capacity() * std::mem::size_of::<GrammarExpr>()
            + self.rules.capacity() * std::mem::size_of::<Rule>();
        for expr in &self.exprs {
            total += match expr {
                GrammarExpr::ByteString(b) => b.capacity(),
                GrammarExpr::CharacterClass { ranges, .. }
                | GrammarExpr::CharacterClassStar { ranges, .. } => ranges.capacity() * 8,
                GrammarExpr::Sequence(ids) | GrammarExpr::Choices(ids) => {
                    ids.capacity() * std::mem::size_of::<ExprId>()
                }
                GrammarExpr::TagDispatch(td) => {
                    td.tag_rule_pairs
                        .iter()
                        .map(|(s, _)| s.capacity() + std::mem::size_of::<RuleId>())
                        .sum::<usize>()
                        + td.stop_strs.iter().map(String::capacity).sum::<usize>()
                        + td.excludes.iter().map(String::capacity).sum::<usize>()
                }
                _ => 0,
            };
        }
        for rule in &self.rules {
            total += rule.name.capacity();
        }
        if let Some(fsm) = &self.complete_fsm {
            total += fsm.memory_size_bytes();
        }
        for view in self.per_rule_fsms.iter().flatten() {
            total += view.memory_size_bytes();
        }
        total += self.allow_empty_rule_ids.capacity() * std::mem::size_of::<RuleId>();
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_roundtrip_and_validate() {
        let mut builder = GrammarBuilder::new();
        let byte_string = builder.add_byte_string(b"hi");
        let seq = builder.add_sequence(vec![byte_string]);
        let choices = builder.add_choices(vec![seq]);
        let root = builder.add_rule("root", choices);
        let grammar = builder.build(root);
        assert_eq!(grammar.num_rules(), 1);
        assert_eq!(grammar.root_rule().name, "root");
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_dangling_ref() {
        let mut builder = GrammarBuilder::new();
        let dangling = builder.add_rule_ref(7);
        let root = builder.add_rule("root", dangling);
        let grammar = builder.build(root);
        assert!(grammar.validate().is_err());
    }

    #[test]
    fn test_memory_size_nonzero() {
        let mut builder = GrammarBuilder::new();
        let byte_string = builder.add_byte_string(b"abc");
        let root = builder.add_rule("root", byte_string);
        let grammar = builder.build(root);
        assert!(grammar.memory_size_bytes() > 0);
    }
}
