//! Structural-tag lowering
//!
//! Each format variant lowers to a root rule id inside one shared grammar
//! builder; identical subtrees are deduplicated by fingerprint. Embedded
//! schemas, grammars and plain regexes compile through their own front
//! ends and are absorbed via the sub-grammar adder. A regex with excludes
//! goes through the FSM intersection path: regex FSM ∩ complement of the
//! Aho-Corasick exclusion automaton, lowered state by state to rules.

use std::collections::HashMap;

use crate::error::{MoldearError, Result};
use crate::fsm::{FsmWithStartEnd, TrieFsmBuilder};
use crate::grammar::functor::SubGrammarAdder;
use crate::grammar::{ExprId, Grammar, GrammarBuilder, RuleId, TagDispatch};
use crate::regex::RegexFsmBuilder;
use crate::schema::{json_value_schema_to_ebnf, ConvertStyle, JsonSchemaOptions};
use crate::structural::fingerprint::{compute_fingerprint, fingerprint_hash};
use crate::structural::{Format, SchemaStyle, StructuralTag, TagFormat};

/// Lower an analyzed structural tag to a grammar (not yet normalized).
///
/// # Errors
///
/// Returns [`MoldearError::InvalidStructuralTag`] on unlowerable shapes
/// and [`MoldearError::GrammarBuildFailure`] when the exclusion
/// intersection blows up.
pub fn convert(tag: &StructuralTag) -> Result<Grammar> {
    let mut converter = Converter {
        builder: GrammarBuilder::new(),
        fingerprint_cache: HashMap::new(),
    };
    let root_ref = converter.visit(&tag.format)?;
    let rule_ref = converter.builder.add_rule_ref(root_ref);
    let seq = converter.builder.add_sequence(vec![rule_ref]);
    let choices = converter.builder.add_choices(vec![seq]);
    let root = converter.builder.add_rule_with_hint("root", choices);
    Ok(converter.builder.build(root))
}

struct Converter {
    builder: GrammarBuilder,
    /// fingerprint hash → (fingerprint, rule id) buckets
    fingerprint_cache: HashMap<u64, Vec<(String, RuleId)>>,
}

fn err(message: impl Into<String>) -> MoldearError {
    MoldearError::InvalidStructuralTag(message.into())
}

impl Converter {
    fn visit(&mut self, format: &Format) -> Result<RuleId> {
        let fingerprint = compute_fingerprint(format);
        let hash = fingerprint_hash(&fingerprint);
        if let Some(bucket) = self.fingerprint_cache.get(&hash) {
            for (existing, rule_id) in bucket {
                if *existing == fingerprint {
                    return Ok(*rule_id);
                }
            }
        }
        let rule_id = self.visit_uncached(format)?;
        self.fingerprint_cache
            .entry(hash)
            .or_default()
            .push((fingerprint, rule_id));
        Ok(rule_id)
    }

    fn visit_uncached(&mut self, format: &Format) -> Result<RuleId> {
        match format {
            Format::ConstString { value } => {
                let bytes = self.builder.add_byte_string(value.as_bytes());
                let seq = self.builder.add_sequence(vec![bytes]);
                let choices = self.builder.add_choices(vec![seq]);
                Ok(self.builder.add_rule_with_hint("const_string", choices))
            }
            Format::JsonSchema { schema, style } => {
                let convert_style = match style {
                    SchemaStyle::Json => ConvertStyle::Json,
                    SchemaStyle::QwenXml => ConvertStyle::QwenXml,
                };
                let script = json_value_schema_to_ebnf(
                    schema,
                    &JsonSchemaOptions::default(),
                    convert_style,
                )?;
                let sub_grammar = Grammar::from_ebnf(&script, "root")?;
                Ok(SubGrammarAdder::apply(&mut self.builder, &sub_grammar))
            }
            Format::Grammar { grammar } => {
                let sub_grammar = Grammar::from_ebnf(grammar, "root")?;
                Ok(SubGrammarAdder::apply(&mut self.builder, &sub_grammar))
            }
            Format::Regex { pattern, excludes } => {
                if excludes.is_empty() {
                    let sub_grammar = Grammar::from_regex(pattern)?;
                    return Ok(SubGrammarAdder::apply(&mut self.builder, &sub_grammar));
                }
                self.visit_regex_with_excludes(pattern, excludes)
            }
            Format::AnyText {
                excludes,
                detected_end_strs,
            } => self.visit_any_text(excludes, detected_end_strs),
            Format::Sequence { elements, .. } => {
                let mut refs = Vec::with_capacity(elements.len());
                for element in elements {
                    let sub_rule = self.visit(element)?;
                    refs.push(self.builder.add_rule_ref(sub_rule));
                }
                let seq = self.builder.add_sequence(refs);
                let choices = self.builder.add_choices(vec![seq]);
                Ok(self.builder.add_rule_with_hint("sequence", choices))
            }
            Format::Or { elements, .. } => {
                let mut choices = Vec::with_capacity(elements.len());
                for element in elements {
                    let sub_rule = self.visit(element)?;
                    let rule_ref = self.builder.add_rule_ref(sub_rule);
                    choices.push(self.builder.add_sequence(vec![rule_ref]));
                }
                let body = self.builder.add_choices(choices);
                Ok(self.builder.add_rule_with_hint("or", body))
            }
            Format::Tag(tag) => {
                let content_rule = self.visit(&tag.content)?;
                let seq = self.tag_sequence(tag, content_rule, 0)?;
                let choices = self.builder.add_choices(vec![seq]);
                Ok(self.builder.add_rule_with_hint("tag", choices))
            }
            Format::TriggeredTags {
                triggers,
                tags,
                excludes,
                at_least_one,
                stop_after_first,
                detected_end_strs,
            } => self.visit_triggered_tags(
                triggers,
                tags,
                excludes,
                *at_least_one,
                *stop_after_first,
                detected_end_strs,
            ),
            Format::TagsWithSeparator {
                tags,
                separator,
                at_least_one,
                stop_after_first,
                detected_end_strs,
            } => self.visit_tags_with_separator(
                tags,
                separator,
                *at_least_one,
                *stop_after_first,
                detected_end_strs,
            ),
        }
    }

    /// The `begin[skip..] content end` sequence of one tag. An empty end
    /// list (unlimited content) drops the end element; multiple ends go
    /// through a fresh alternatives rule.
    fn tag_sequence(
        &mut self,
        tag: &TagFormat,
        content_rule: RuleId,
        skip_begin: usize,
    ) -> Result<ExprId> {
        let begin = &tag.begin[skip_begin..];
        let mut elements = Vec::with_capacity(3);
        if !begin.is_empty() {
            elements.push(self.builder.add_byte_string(begin.as_bytes()));
        }
        elements.push(self.builder.add_rule_ref(content_rule));
        if let Some(end_expr) = self.end_marker_expr(&tag.end, "tag_end") {
            elements.push(end_expr);
        }
        Ok(self.builder.add_sequence(elements))
    }

    /// An expression matching one of `ends`: a literal, an alternatives
    /// rule, or `None` when the list is empty.
    fn end_marker_expr(&mut self, ends: &[String], hint: &str) -> Option<ExprId> {
        match ends {
            [] => None,
            [single] => Some(if single.is_empty() {
                self.builder.add_empty_str()
            } else {
                self.builder.add_byte_string(single.as_bytes())
            }),
            multiple => {
                let mut choices = Vec::with_capacity(multiple.len());
                for end in multiple {
                    let expr = if end.is_empty() {
                        self.builder.add_empty_str()
                    } else {
                        self.builder.add_byte_string(end.as_bytes())
                    };
                    choices.push(self.builder.add_sequence(vec![expr]));
                }
                let body = self.builder.add_choices(choices);
                let rule = self.builder.add_rule_with_hint(hint, body);
                Some(self.builder.add_rule_ref(rule))
            }
        }
    }

    fn visit_any_text(
        &mut self,
        excludes: &[String],
        detected_end_strs: &[String],
    ) -> Result<RuleId> {
        let non_empty_ends: Vec<String> = detected_end_strs
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        if !non_empty_ends.is_empty() {
            let dispatch = self.builder.add_tag_dispatch(TagDispatch {
                tag_rule_pairs: Vec::new(),
                stop_eos: false,
                stop_strs: non_empty_ends,
                loop_after_dispatch: false,
                excludes: excludes.to_vec(),
            });
            return Ok(self.builder.add_rule_with_hint("any_text", dispatch));
        }
        if !excludes.is_empty() {
            // Free text to EOS with forbidden infixes is a dispatch with
            // no triggers and no stop strings.
            let dispatch = self.builder.add_tag_dispatch(TagDispatch {
                tag_rule_pairs: Vec::new(),
                stop_eos: true,
                stop_strs: Vec::new(),
                loop_after_dispatch: false,
                excludes: excludes.to_vec(),
            });
            return Ok(self.builder.add_rule_with_hint("any_text", dispatch));
        }
        let star = self
            .builder
            .add_character_class_star(vec![(0, 0x10_FFFF)], false);
        let seq = self.builder.add_sequence(vec![star]);
        let choices = self.builder.add_choices(vec![seq]);
        Ok(self.builder.add_rule_with_hint("any_text", choices))
    }

    // ==================== Regex with excludes ====================

    fn visit_regex_with_excludes(
        &mut self,
        pattern: &str,
        excludes: &[String],
    ) -> Result<RuleId> {
        let regex_fsm = RegexFsmBuilder::build(pattern)?
            .simplify_epsilon()
            .merge_equivalent_successors();

        // Aho-Corasick automaton over the excludes; every live state
        // accepts, so the machine is the complement of "contains an
        // exclude".
        let trie = TrieFsmBuilder::build(&[], excludes, true, true)
            .map_err(|e| MoldearError::GrammarBuildFailure(e.to_string()))?;
        let mut exclude_filter = trie.fsm;
        let mut live = vec![false; exclude_filter.num_states()];
        for (state, flag) in live.iter_mut().enumerate() {
            *flag = !exclude_filter.fsm().edges(state).is_empty();
        }
        exclude_filter.set_ends(live);

        let intersected = FsmWithStartEnd::intersect(&regex_fsm, &exclude_filter)?
            .merge_equivalent_successors();
        self.lower_dfa_to_rules(&intersected)
    }

    /// Lower a byte-level DFA to one rule per reachable state. Accepting
    /// states contribute an empty alternative; edges grouped by target
    /// produce merged transitions.
    fn lower_dfa_to_rules(&mut self, fsm: &FsmWithStartEnd) -> Result<RuleId> {
        if fsm.num_states() == 0 {
            return Err(err("regex with excludes matches nothing"));
        }
        // Reachability from the start
        let mut reachable = vec![false; fsm.num_states()];
        let mut queue = vec![fsm.start()];
        reachable[fsm.start()] = true;
        let mut i = 0;
        while i < queue.len() {
            let state = queue[i];
            i += 1;
            for edge in fsm.fsm().edges(state) {
                if !reachable[edge.target] {
                    reachable[edge.target] = true;
                    queue.push(edge.target);
                }
            }
        }

        let mut state_rules: Vec<Option<RuleId>> = vec![None; fsm.num_states()];
        for state in 0..fsm.num_states() {
            if reachable[state] {
                state_rules[state] = Some(self.builder.add_empty_rule_with_hint("regex_state"));
            }
        }

        for state in 0..fsm.num_states() {
            let Some(rule_id) = state_rules[state] else {
                continue;
            };
            let mut choices = Vec::new();
            if fsm.is_end_state(state) {
                choices.push(self.builder.add_empty_str());
            }

            // Group edges by target and merge their byte ranges
            let mut by_target: HashMap<usize, Vec<(u8, u8)>> = HashMap::new();
            let mut target_order: Vec<usize> = Vec::new();
            for edge in fsm.fsm().edges(state) {
                if !edge.is_char_range() {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let range = (edge.min as u8, edge.max as u8);
                if !by_target.contains_key(&edge.target) {
                    target_order.push(edge.target);
                }
                by_target.entry(edge.target).or_default().push(range);
            }
            for target in target_order {
                let target_rule = state_rules[target].expect("targets are reachable");
                let mut ranges = by_target.remove(&target).expect("grouped above");
                ranges.sort_unstable();
                let target_ref = self.builder.add_rule_ref(target_rule);
                // ASCII ranges stay a character class (code points are
                // bytes there); high bytes are raw and go one byte string
                // per value.
                let ascii: Vec<(u32, u32)> = ranges
                    .iter()
                    .filter(|&&(lo, _)| lo < 0x80)
                    .map(|&(lo, hi)| (u32::from(lo), u32::from(hi.min(0x7F))))
                    .collect();
                if !ascii.is_empty() {
                    let class = self.builder.add_character_class(ascii, false);
                    choices.push(self.builder.add_sequence(vec![class, target_ref]));
                }
                for &(lo, hi) in &ranges {
                    let lo = lo.max(0x80);
                    if lo > hi {
                        continue;
                    }
                    for byte in lo..=hi {
                        let literal = self.builder.add_byte_string(&[byte]);
                        let byte_ref = self.builder.add_rule_ref(target_rule);
                        choices.push(self.builder.add_sequence(vec![literal, byte_ref]));
                    }
                }
            }

            if choices.is_empty() {
                let empty = self.builder.add_empty_str();
                let seq = self.builder.add_sequence(vec![empty]);
                let body = self.builder.add_choices(vec![seq]);
                self.builder.update_rule_body(rule_id, body);
            } else {
                let body = self.builder.add_choices(choices);
                self.builder.update_rule_body(rule_id, body);
            }
        }

        Ok(state_rules[fsm.start()].expect("start is reachable"))
    }

    // ==================== Triggered tags ====================

    #[allow(clippy::too_many_lines)]
    fn visit_triggered_tags(
        &mut self,
        triggers: &[String],
        tags: &[TagFormat],
        excludes: &[String],
        at_least_one: bool,
        stop_after_first: bool,
        detected_end_strs: &[String],
    ) -> Result<RuleId> {
        // Step 1: match each tag to the unique trigger prefixing its begin
        let mut trigger_to_tags: Vec<Vec<usize>> = vec![Vec::new(); triggers.len()];
        let mut content_rules = Vec::with_capacity(tags.len());
        for (tag_index, tag) in tags.iter().enumerate() {
            let mut matched = None;
            for (trigger_index, trigger) in triggers.iter().enumerate() {
                if tag.begin.starts_with(trigger.as_str()) {
                    if matched.is_some() {
                        return Err(err(
                            "one tag matches multiple triggers in a triggered_tags format",
                        ));
                    }
                    matched = Some(trigger_index);
                }
            }
            let Some(trigger_index) = matched else {
                return Err(err(
                    "one tag does not match any trigger in a triggered_tags format",
                ));
            };
            trigger_to_tags[trigger_index].push(tag_index);
            content_rules.push(self.visit(&tag.content)?);
        }

        let non_empty_ends: Vec<String> = detected_end_strs
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();

        // Step 2: at_least_one && stop_after_first generates exactly one
        // tag with no free text: a plain choice among the tags.
        if at_least_one && stop_after_first {
            let mut choices = Vec::with_capacity(tags.len());
            for (tag_index, tag) in tags.iter().enumerate() {
                choices.push(self.tag_sequence(tag, content_rules[tag_index], 0)?);
            }
            let mut body = self.builder.add_choices(choices);
            if !detected_end_strs.is_empty() {
                let sub_rule = self.builder.add_rule_with_hint("triggered_tags_sub", body);
                let sub_ref = self.builder.add_rule_ref(sub_rule);
                let end_expr = self
                    .end_marker_expr(detected_end_strs, "end_choices")
                    .expect("non-empty end list");
                let seq = self.builder.add_sequence(vec![sub_ref, end_expr]);
                body = self.builder.add_choices(vec![seq]);
            }
            return Ok(self.builder.add_rule_with_hint("triggered_tags", body));
        }

        // Step 3: the general case is a tag-dispatch macro; per trigger, a
        // choice among its tags with the trigger prefix stripped.
        let mut tag_rule_pairs = Vec::with_capacity(triggers.len());
        for (trigger_index, trigger) in triggers.iter().enumerate() {
            let mut choices = Vec::new();
            for &tag_index in &trigger_to_tags[trigger_index] {
                let tag = &tags[tag_index];
                choices.push(self.tag_sequence(tag, content_rules[tag_index], trigger.len())?);
            }
            if choices.is_empty() {
                continue;
            }
            let body = self.builder.add_choices(choices);
            let group_rule = self
                .builder
                .add_rule_with_hint("triggered_tags_group", body);
            tag_rule_pairs.push((trigger.clone(), group_rule));
        }

        let loop_after_dispatch = !stop_after_first;
        let dispatch = if non_empty_ends.is_empty() {
            TagDispatch {
                tag_rule_pairs,
                stop_eos: true,
                stop_strs: Vec::new(),
                loop_after_dispatch,
                excludes: excludes.to_vec(),
            }
        } else {
            TagDispatch {
                tag_rule_pairs,
                stop_eos: false,
                stop_strs: non_empty_ends,
                loop_after_dispatch,
                excludes: excludes.to_vec(),
            }
        };
        let mut body = self.builder.add_tag_dispatch(dispatch);

        // Step 3.3: at_least_one forces one full tag before the dispatch
        if at_least_one {
            let mut first_choices = Vec::with_capacity(tags.len());
            for (tag_index, tag) in tags.iter().enumerate() {
                first_choices.push(self.tag_sequence(tag, content_rules[tag_index], 0)?);
            }
            let first_body = self.builder.add_choices(first_choices);
            let first_rule = self
                .builder
                .add_rule_with_hint("triggered_tags_first", first_body);
            let dispatch_rule = self.builder.add_rule_with_hint("triggered_tags_sub", body);
            let first_ref = self.builder.add_rule_ref(first_rule);
            let dispatch_ref = self.builder.add_rule_ref(dispatch_rule);
            let seq = self.builder.add_sequence(vec![first_ref, dispatch_ref]);
            body = self.builder.add_choices(vec![seq]);
        }

        Ok(self.builder.add_rule_with_hint("triggered_tags", body))
    }

    // ==================== Tags with separator ====================

    fn visit_tags_with_separator(
        &mut self,
        tags: &[TagFormat],
        separator: &str,
        at_least_one: bool,
        stop_after_first: bool,
        detected_end_strs: &[String],
    ) -> Result<RuleId> {
        // Step 1: a rule selecting any one tag
        let mut choices = Vec::with_capacity(tags.len());
        for tag in tags {
            let content_rule = self.visit(&tag.content)?;
            let tag_seq = self.tag_sequence(tag, content_rule, 0)?;
            let tag_choices = self.builder.add_choices(vec![tag_seq]);
            let tag_rule = self.builder.add_rule_with_hint("tag", tag_choices);
            let tag_ref = self.builder.add_rule_ref(tag_rule);
            choices.push(self.builder.add_sequence(vec![tag_ref]));
        }
        let all_tags_body = self.builder.add_choices(choices);
        let all_tags_rule = self
            .builder
            .add_rule_with_hint("tags_with_separator_tags", all_tags_body);

        let non_empty_ends: Vec<String> = detected_end_strs
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let has_ends = !non_empty_ends.is_empty();
        let separator_matches_end = detected_end_strs.iter().any(|e| e == separator);

        // Step 2: one-shot shape when stopping after the first tag, or
        // when the separator doubles as a detected end (a loop could not
        // tell a separator from the stop marker).
        if stop_after_first || (has_ends && separator_matches_end) {
            let mut root_choices = Vec::new();
            if has_ends {
                for end in &non_empty_ends {
                    let all_ref = self.builder.add_rule_ref(all_tags_rule);
                    let end_bytes = self.builder.add_byte_string(end.as_bytes());
                    root_choices.push(self.builder.add_sequence(vec![all_ref, end_bytes]));
                }
                if !at_least_one {
                    for end in &non_empty_ends {
                        let end_bytes = self.builder.add_byte_string(end.as_bytes());
                        root_choices.push(self.builder.add_sequence(vec![end_bytes]));
                    }
                }
            } else {
                let all_ref = self.builder.add_rule_ref(all_tags_rule);
                root_choices.push(self.builder.add_sequence(vec![all_ref]));
                if !at_least_one {
                    root_choices.push(self.builder.add_empty_str());
                }
            }
            let body = self.builder.add_choices(root_choices);
            return Ok(self.builder.add_rule_with_hint("tags_with_separator", body));
        }

        // Step 3: the looping shape via a tail-recursive sub-rule:
        //   sub ::= sep tags sub | end
        let sub_rule = self.builder.add_empty_rule_with_hint("tags_with_separator_sub");

        let end_alternative = match self.end_marker_expr(&non_empty_ends, "end_choices") {
            Some(expr) => expr,
            None => self.builder.add_empty_str(),
        };

        let mut recursive_elements = Vec::new();
        if !separator.is_empty() {
            recursive_elements.push(self.builder.add_byte_string(separator.as_bytes()));
        }
        recursive_elements.push(self.builder.add_rule_ref(all_tags_rule));
        recursive_elements.push(self.builder.add_rule_ref(sub_rule));
        let recursive_seq = self.builder.add_sequence(recursive_elements);
        let sub_body = self
            .builder
            .add_choices(vec![recursive_seq, end_alternative]);
        self.builder.update_rule_body(sub_rule, sub_body);

        let all_ref = self.builder.add_rule_ref(all_tags_rule);
        let sub_ref = self.builder.add_rule_ref(sub_rule);
        let mut root_choices = vec![self.builder.add_sequence(vec![all_ref, sub_ref])];
        if !at_least_one {
            let empty_alternative = match self.end_marker_expr(&non_empty_ends, "end_choices") {
                Some(expr) => expr,
                None => self.builder.add_empty_str(),
            };
            root_choices.push(empty_alternative);
        }
        let body = self.builder.add_choices(root_choices);
        Ok(self.builder.add_rule_with_hint("tags_with_separator", body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarExpr;
    use crate::structural::{analyzer, parser};
    use serde_json::{json, Value};

    fn lower(v: Value) -> Result<Grammar> {
        let mut tag = parser::parse_structural_tag(&v)?;
        analyzer::analyze(&mut tag)?;
        let grammar = convert(&tag)?;
        Ok(crate::grammar::functor::normalize(&grammar))
    }

    fn wrap(format: Value) -> Value {
        json!({"type": "structural_tag", "format": format})
    }

    #[test]
    fn test_const_string_single_rule() {
        let grammar = lower(wrap(json!({"type": "const_string", "value": "ok"})))
            .expect("compiles");
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_duplicate_subtrees_share_rules() {
        let one = lower(wrap(json!({"type": "sequence", "elements": [
            {"type": "const_string", "value": "x"}
        ]})))
        .expect("compiles");
        let two = lower(wrap(json!({"type": "sequence", "elements": [
            {"type": "const_string", "value": "x"},
            {"type": "const_string", "value": "x"}
        ]})))
        .expect("compiles");
        // The duplicated const_string adds no extra rule
        assert_eq!(one.num_rules(), two.num_rules());
    }

    #[test]
    fn test_any_text_with_detected_ends_becomes_dispatch() {
        let grammar = lower(wrap(json!({
            "type": "tag", "begin": "<think>",
            "content": {"type": "any_text"}, "end": "</think>"
        })))
        .expect("compiles");
        let has_dispatch = (0..grammar.num_rules()).any(|r| {
            matches!(
                grammar.expr(grammar.rule(r).body),
                GrammarExpr::TagDispatch(td)
                    if td.stop_strs == vec!["</think>".to_string()] && !td.stop_eos
            )
        });
        assert!(has_dispatch);
    }

    #[test]
    fn test_plain_any_text_is_char_class_star() {
        let grammar = lower(wrap(json!({"type": "any_text"}))).expect("compiles");
        let has_star = (0..grammar.num_exprs()).any(|e| {
            matches!(
                grammar.expr(e),
                GrammarExpr::CharacterClassStar { ranges, .. } if ranges == &[(0, 0x10_FFFF)]
            )
        });
        assert!(has_star);
    }

    #[test]
    fn test_triggered_tags_normal_case() {
        let grammar = lower(wrap(json!({
            "type": "triggered_tags",
            "triggers": ["<fn="],
            "tags": [
                {"begin": "<fn=a>", "content": {"type": "const_string", "value": "x"}, "end": "</fn>"},
                {"begin": "<fn=b>", "content": {"type": "const_string", "value": "y"}, "end": "</fn>"}
            ]
        })))
        .expect("compiles");
        // One dispatch rule with the single trigger, looping
        let dispatch = (0..grammar.num_rules()).find_map(|r| {
            if let GrammarExpr::TagDispatch(td) = grammar.expr(grammar.rule(r).body) {
                Some(td.clone())
            } else {
                None
            }
        });
        let dispatch = dispatch.expect("dispatch exists");
        assert_eq!(dispatch.tag_rule_pairs.len(), 1);
        assert_eq!(dispatch.tag_rule_pairs[0].0, "<fn=");
        assert!(dispatch.stop_eos);
        assert!(dispatch.loop_after_dispatch);
    }

    #[test]
    fn test_triggered_tags_one_shot_case() {
        let grammar = lower(wrap(json!({
            "type": "triggered_tags",
            "triggers": ["<fn="],
            "at_least_one": true,
            "stop_after_first": true,
            "tags": [
                {"begin": "<fn=a>", "content": {"type": "const_string", "value": "x"}, "end": "</fn>"}
            ]
        })))
        .expect("compiles");
        // No dispatch macro in the one-shot shape
        let has_dispatch = (0..grammar.num_rules()).any(|r| {
            matches!(grammar.expr(grammar.rule(r).body), GrammarExpr::TagDispatch(_))
        });
        assert!(!has_dispatch);
    }

    #[test]
    fn test_tag_not_matching_any_trigger_fails() {
        let result = lower(wrap(json!({
            "type": "triggered_tags",
            "triggers": ["<fn="],
            "tags": [
                {"begin": "<tool>", "content": {"type": "const_string", "value": "x"}, "end": "</tool>"}
            ]
        })));
        assert!(result.is_err());
    }

    #[test]
    fn test_regex_with_excludes() {
        let grammar = lower(wrap(json!({
            "type": "regex", "pattern": "ab*", "excludes": ["bbb"]
        })))
        .expect("compiles");
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_tags_with_separator_shapes() {
        let looping = lower(wrap(json!({
            "type": "tags_with_separator",
            "separator": ",",
            "tags": [{"begin": "<t>", "content": {"type": "const_string", "value": "x"}, "end": "</t>"}]
        })))
        .expect("compiles");
        assert!(looping.validate().is_ok());

        let one_shot = lower(wrap(json!({
            "type": "tags_with_separator",
            "separator": ",",
            "stop_after_first": true,
            "at_least_one": true,
            "tags": [{"begin": "<t>", "content": {"type": "const_string", "value": "x"}, "end": "</t>"}]
        })))
        .expect("compiles");
        assert!(one_shot.validate().is_ok());
    }
}
