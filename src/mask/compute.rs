//! Per-position token-mask computation
//!
//! For one parser state, walks the tokenizer's sorted vocabulary using
//! trie subtree-range skipping and longest-common-prefix rollback,
//! classifies every token as accepted / rejected / uncertain subject to
//! the rule's look-ahead assertion, and produces an adaptive mask. A
//! speculative pass short-circuits self-recursive shapes, and the
//! crossing cache shares results between structurally identical positions
//! across compilations.

use std::collections::HashMap;

use crate::compiler::cache::CrossingCache;
use crate::earley::{EarleyParser, ParserState, LOOKAHEAD_RULE_ID};
use crate::grammar::{Grammar, GrammarExpr, RuleId};
use crate::mask::{sorted_difference, sorted_union, AdaptiveTokenMask, MaskStoreType};
use crate::support::bitset::DynamicBitset;
use crate::support::hashing::hash_combine_all;
use crate::tokenizer_info::TokenizerInfo;

/// Per-compilation precomputed data for tag-dispatch rules: for each such
/// rule, the sorted-vocab-indexed bitset of tokens that are definitely
/// accepted from the second character on (no trigger, stop or exclude
/// substring occurs at offset >= 1).
pub type TagDispatchSlicingBitsets = HashMap<RuleId, DynamicBitset>;

/// Compute the second-slicing bitsets for every tag-dispatch rule.
#[must_use]
pub fn tag_dispatch_slicing_bitsets(
    grammar: &Grammar,
    tokenizer_info: &TokenizerInfo,
) -> TagDispatchSlicingBitsets {
    let mut result = HashMap::new();
    let sorted_vocab = tokenizer_info.sorted_decoded_vocab();
    for rule_id in 0..grammar.num_rules() {
        let body = grammar.rule(rule_id).body;
        let GrammarExpr::TagDispatch(td) = grammar.expr(body) else {
            continue;
        };
        let mut bitset = DynamicBitset::new(sorted_vocab.len());
        let needles: Vec<&str> = td
            .tag_rule_pairs
            .iter()
            .map(|(t, _)| t.as_str())
            .chain(td.stop_strs.iter().map(String::as_str))
            .chain(td.excludes.iter().map(String::as_str))
            .collect();
        for (index, (_, token)) in sorted_vocab.iter().enumerate() {
            if token.is_empty() {
                bitset.set(index);
                continue;
            }
            let tail = &token[1..];
            let definite = needles
                .iter()
                .all(|needle| !contains_subslice(tail, needle.as_bytes()));
            if definite {
                bitset.set(index);
            }
        }
        result.insert(rule_id, bitset);
    }
    result
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// One mask computation over one grammar position.
pub struct TokenMaskComputer<'a> {
    grammar: &'a Grammar,
    tokenizer_info: &'a TokenizerInfo,
    init_state: ParserState,
    slicing_bitsets: &'a TagDispatchSlicingBitsets,
    crossing_cache: &'a CrossingCache,

    parser: EarleyParser<'a>,
    accepted: Vec<u32>,
    rejected: Vec<u32>,
    uncertain: Vec<u32>,
    accepted_by_lookahead: Vec<u32>,
    rejected_by_lookahead: Vec<u32>,
    /// Whether the rule could complete exactly after byte `i` of the
    /// currently matched prefix
    can_reach_end: Vec<bool>,
    /// Prefix-or of `can_reach_end`
    can_reach_end_prefix_or: Vec<bool>,
}

impl<'a> TokenMaskComputer<'a> {
    /// Create a computer positioned at `init_state`.
    #[must_use]
    pub fn new(
        grammar: &'a Grammar,
        tokenizer_info: &'a TokenizerInfo,
        init_state: ParserState,
        slicing_bitsets: &'a TagDispatchSlicingBitsets,
        crossing_cache: &'a CrossingCache,
    ) -> Self {
        Self {
            grammar,
            tokenizer_info,
            init_state,
            slicing_bitsets,
            crossing_cache,
            parser: EarleyParser::new(grammar, init_state),
            accepted: Vec::new(),
            rejected: Vec::new(),
            uncertain: Vec::new(),
            accepted_by_lookahead: Vec::new(),
            rejected_by_lookahead: Vec::new(),
            can_reach_end: vec![false],
            can_reach_end_prefix_or: vec![false],
        }
    }

    fn init_rule_id(&self) -> RuleId {
        usize::try_from(self.init_state.rule_id).unwrap_or(0)
    }

    /// Compute the adaptive token mask. With `is_root_rule` set there are
    /// no uncertain tokens: the continuation beyond the rule is the end of
    /// the output.
    #[must_use]
    pub fn compute(&mut self, is_root_rule: bool) -> AdaptiveTokenMask {
        let rule_id = self.init_rule_id();
        let rule = self.grammar.rule(rule_id);
        let lookahead = rule.lookahead;
        let lookahead_exact = rule.lookahead_exact;
        let tokenizer_hash = self.tokenizer_info.tokenizer_hash();

        // Crossing-cache probe
        let canonical = if self.crossing_cache.is_enabled() {
            self.grammar.per_rule_fsm_hash(rule_id).and_then(|fsm_hash| {
                self.grammar
                    .canonical_state_id(rule_id, self.init_state.element_id as usize)
                    .map(|state| (fsm_hash, u32::try_from(state).unwrap_or(u32::MAX)))
            })
        } else {
            None
        };
        let lookahead_hash = self.grammar.hash_sequence(lookahead);
        let strong_key = canonical.and_then(|(fsm_hash, _)| {
            lookahead_hash
                .map(|la| hash_combine_all(fsm_hash, &[la, u64::from(lookahead_exact)]))
        });

        if let (Some((_, state_id)), Some(strong)) = (canonical, strong_key) {
            if let Some(hit) = self.crossing_cache.get(strong, state_id, tokenizer_hash) {
                return hit;
            }
        }
        if let Some((fsm_hash, state_id)) = canonical {
            if let Some(mut hit) = self.crossing_cache.get(fsm_hash, state_id, tokenizer_hash) {
                self.adapt_with_lookahead(&mut hit, is_root_rule);
                return hit;
            }
        }

        let first_char_mask = self.first_char_mask();
        let rejected_filled = self.token_mask_with_first_char_check(&first_char_mask, is_root_rule);

        let sorted_vocab = self.tokenizer_info.sorted_decoded_vocab();
        let vocab_size = self.tokenizer_info.vocab_size();
        let result = if rejected_filled {
            AdaptiveTokenMask::new(
                vocab_size,
                sorted_vocab,
                self.accepted.clone(),
                self.rejected.clone(),
                self.uncertain.clone(),
            )
        } else {
            AdaptiveTokenMask::new_without_rejected(
                vocab_size,
                sorted_vocab,
                self.accepted.clone(),
                self.uncertain.clone(),
            )
        };

        if let Some((fsm_hash, state_id)) = canonical {
            if lookahead.is_none() && !is_root_rule {
                // No look-ahead: the computed mask is the canonical one.
                self.crossing_cache
                    .insert(fsm_hash, state_id, tokenizer_hash, result.clone());
                return result;
            }
            // Store a look-ahead-independent mask under the weak key:
            // everything the look-ahead decided is demoted to uncertain.
            let mut weak_uncertain = self.uncertain.clone();
            sorted_union(&mut weak_uncertain, &self.rejected_by_lookahead);
            sorted_union(&mut weak_uncertain, &self.accepted_by_lookahead);
            let weak_accepted = sorted_difference(&self.accepted, &self.accepted_by_lookahead);
            let weak_mask = if rejected_filled {
                let weak_rejected = sorted_difference(&self.rejected, &self.rejected_by_lookahead);
                AdaptiveTokenMask::new(
                    vocab_size,
                    sorted_vocab,
                    weak_accepted,
                    weak_rejected,
                    weak_uncertain,
                )
            } else {
                AdaptiveTokenMask::new_without_rejected(
                    vocab_size,
                    sorted_vocab,
                    weak_accepted,
                    weak_uncertain,
                )
            };
            self.crossing_cache
                .insert(fsm_hash, state_id, tokenizer_hash, weak_mask);
            if let Some(strong) = strong_key {
                self.crossing_cache
                    .insert(strong, state_id, tokenizer_hash, result.clone());
            }
        }
        result
    }

    // ==================== First-byte mask ====================

    fn first_char_mask(&self) -> [bool; 256] {
        let mut mask = [false; 256];
        let rule_id = self.init_rule_id();
        if let Some(fsm) = self.grammar.per_rule_fsm(rule_id) {
            for edge in fsm.fsm().edges(self.init_state.element_id as usize) {
                if edge.is_char_range() {
                    #[allow(clippy::cast_sign_loss)]
                    for b in edge.min..=i16::try_from(edge.max).unwrap_or(255) {
                        mask[b as usize] = true;
                    }
                }
            }
            return mask;
        }
        let GrammarExpr::Sequence(elements) = self.grammar.expr(self.init_state.sequence_id as usize)
        else {
            return mask;
        };
        let Some(&element) = elements.get(self.init_state.element_id as usize) else {
            return mask;
        };
        match self.grammar.expr(element) {
            GrammarExpr::ByteString(bytes) => {
                if let Some(&b) = bytes.get(self.init_state.sub_element_id as usize) {
                    mask[b as usize] = true;
                }
            }
            GrammarExpr::CharacterClass { negated, ranges }
            | GrammarExpr::CharacterClassStar { negated, ranges } => {
                if self.init_state.sub_element_id != 0 {
                    // Mid-character: any continuation byte
                    for b in 0x80..0xC0 {
                        mask[b] = true;
                    }
                    return mask;
                }
                Self::class_first_bytes(&mut mask, *negated, ranges);
            }
            _ => {}
        }
        mask
    }

    /// First bytes a character class can consume: its ASCII bytes plus
    /// the UTF-8 lead bytes of its higher ranges.
    fn class_first_bytes(mask: &mut [bool; 256], negated: bool, ranges: &[(u32, u32)]) {
        if negated {
            let mut ascii = [false; 128];
            for &(lo, hi) in ranges {
                for cp in lo..=hi.min(127) {
                    ascii[cp as usize] = true;
                }
            }
            for (b, &excluded) in ascii.iter().enumerate() {
                if !excluded {
                    mask[b] = true;
                }
            }
            // Code points at or above U+0080 are admitted wholesale
            for b in 0xC2..=0xF4u32 {
                mask[b as usize] = true;
            }
            return;
        }
        for &(lo, hi) in ranges {
            for cp in lo..=hi.min(0x7F) {
                mask[cp as usize] = true;
            }
            let bands: [(u32, u32, fn(u32) -> u32); 3] = [
                (0x80, 0x7FF, |cp| 0xC0 | (cp >> 6)),
                (0x800, 0xFFFF, |cp| 0xE0 | (cp >> 12)),
                (0x10000, 0x10_FFFF, |cp| 0xF0 | (cp >> 18)),
            ];
            for (band_lo, band_hi, lead) in bands {
                let clamped_lo = lo.max(band_lo);
                let clamped_hi = hi.min(band_hi);
                if clamped_lo > clamped_hi {
                    continue;
                }
                for b in lead(clamped_lo)..=lead(clamped_hi) {
                    mask[b as usize] = true;
                }
            }
        }
    }

    // ==================== Sorted-vocab intervals ====================

    /// Convert the first-byte mask into intervals of the sorted vocab.
    /// Returns the intervals and the number of possible tokens.
    fn possible_token_intervals(&self, first_char_mask: &[bool; 256]) -> (Vec<(usize, usize)>, usize) {
        let sorted_vocab = self.tokenizer_info.sorted_decoded_vocab();
        let mut intervals = Vec::new();
        let mut possible = 0usize;
        let mut matched = 0usize;
        let mut run_start: Option<usize> = None;
        let lower_bound = |from: usize, byte: u8| -> usize {
            from + sorted_vocab[from..].partition_point(|(_, bytes)| bytes.as_slice() < &[byte][..])
        };
        for byte in 0..=255u8 {
            if first_char_mask[byte as usize] {
                if run_start.is_none() {
                    run_start = Some(byte as usize);
                }
                continue;
            }
            if let Some(start_byte) = run_start.take() {
                #[allow(clippy::cast_possible_truncation)]
                let left = lower_bound(matched, start_byte as u8);
                let right = lower_bound(left, byte);
                intervals.push((left, right));
                possible += right - left;
                matched = right;
            }
        }
        if let Some(start_byte) = run_start {
            #[allow(clippy::cast_possible_truncation)]
            let left = lower_bound(matched, start_byte as u8);
            intervals.push((left, sorted_vocab.len()));
            possible += sorted_vocab.len() - left;
        }
        (intervals, possible)
    }

    // ==================== Speculative shapes ====================

    /// Whether the position is self-recursive-like ("eats any byte and
    /// loops") and, for FSM positions, the loop's byte mask.
    fn speculative_calculation(&self) -> (bool, [bool; 256]) {
        let rule_id = self.init_rule_id();
        let body = self.grammar.rule(rule_id).body;
        let mut mask = [false; 256];

        if matches!(self.grammar.expr(body), GrammarExpr::TagDispatch(_)) {
            // Bytes that keep the dispatch at its start state
            if let Some(fsm) = self.grammar.per_rule_fsm(rule_id) {
                let start = fsm.start();
                for edge in fsm.fsm().edges(self.init_state.element_id as usize) {
                    if edge.is_char_range() && edge.target == start {
                        #[allow(clippy::cast_sign_loss)]
                        for b in edge.min..=i16::try_from(edge.max).unwrap_or(255) {
                            mask[b as usize] = true;
                        }
                    }
                }
            }
            return (true, mask);
        }

        if let Some(fsm) = self.grammar.per_rule_fsm(rule_id) {
            let state = self.init_state.element_id as usize;
            let mut applies = false;
            for edge in fsm.fsm().edges(state) {
                if !edge.is_char_range() {
                    continue;
                }
                let mut looping = edge.target == state;
                if !looping && fsm.start() == state {
                    // Start state whose successor calls the rule itself
                    looping = fsm.fsm().edges(edge.target).iter().any(|next| {
                        next.rule_ref_id() == Some(rule_id)
                    });
                }
                if looping {
                    applies = true;
                    #[allow(clippy::cast_sign_loss)]
                    for b in edge.min..=i16::try_from(edge.max).unwrap_or(255) {
                        mask[b as usize] = true;
                    }
                }
            }
            return (applies, mask);
        }

        // Non-FSM shapes: a character-class star, or a class followed by a
        // self reference in a two-element sequence.
        if self.init_state.sub_element_id != 0 {
            return (false, mask);
        }
        let GrammarExpr::Sequence(elements) = self.grammar.expr(self.init_state.sequence_id as usize)
        else {
            return (false, mask);
        };
        let Some(&element) = elements.get(self.init_state.element_id as usize) else {
            return (false, mask);
        };
        match self.grammar.expr(element) {
            GrammarExpr::CharacterClassStar { .. } => (true, mask),
            GrammarExpr::CharacterClass { .. }
                if elements.len() == 2 && self.init_state.element_id == 0 =>
            {
                let is_self_ref = matches!(
                    self.grammar.expr(elements[1]),
                    GrammarExpr::RuleRef(r) if *r == rule_id
                );
                (is_self_ref, mask)
            }
            _ => (false, mask),
        }
    }

    // ==================== Main token loop ====================

    /// Walk the vocabulary. Returns whether the rejected list was filled
    /// (it is skipped when the possible set leaves too many rejections to
    /// be worth storing).
    #[allow(clippy::too_many_lines)]
    fn token_mask_with_first_char_check(
        &mut self,
        first_char_mask: &[bool; 256],
        is_root_rule: bool,
    ) -> bool {
        let sorted_vocab = self.tokenizer_info.sorted_decoded_vocab();
        let subtree_range = self.tokenizer_info.trie_subtree_nodes_range();
        let (intervals, possible) = self.possible_token_intervals(first_char_mask);
        let fill_rejected =
            sorted_vocab.len() - possible < crate::mask::USE_BITSET_THRESHOLD;

        let rule_id = self.init_rule_id();
        let rule = self.grammar.rule(rule_id);
        let lookahead = rule.lookahead;
        let lookahead_exact = rule.lookahead_exact;
        let is_tag_dispatch = matches!(
            self.grammar.expr(rule.body),
            GrammarExpr::TagDispatch(_)
        );
        let definite_bitset = if is_tag_dispatch {
            self.slicing_bitsets.get(&rule_id)
        } else {
            None
        };

        let (speculative, speculative_mask) = {
            let (applies, fsm_mask) = self.speculative_calculation();
            if self.grammar.per_rule_fsm(rule_id).is_none() {
                // Shape-detected recursion covers a large share of the
                // vocabulary before it pays off.
                (
                    applies && possible >= sorted_vocab.len() / 4,
                    *first_char_mask,
                )
            } else {
                (applies, fsm_mask)
            }
        };

        if let Some((first, _)) = intervals.first() {
            if *first != 0 && fill_rejected {
                self.rejected.extend(0..u32::try_from(*first).unwrap_or(0));
            }
        } else if fill_rejected {
            // No possible first byte: everything is rejected
            self.rejected
                .extend(0..u32::try_from(sorted_vocab.len()).unwrap_or(0));
            return fill_rejected;
        }

        let mut prev_token: Option<&[u8]> = None;
        let mut prev_matched = 0usize;
        let mut last_rejected_range = 0usize;

        for (interval_index, &(left, right)) in intervals.iter().enumerate() {
            let mut index = left;
            while index < right {
                let i = index;
                index += 1;
                if i < last_rejected_range {
                    if fill_rejected {
                        self.rejected.push(u32::try_from(i).unwrap_or(u32::MAX));
                    }
                    continue;
                }
                let token = sorted_vocab[i].1.as_slice();

                // Speculative acceptance without parser simulation
                if speculative {
                    if let Some(bitset) = definite_bitset {
                        if token.is_empty()
                            || (speculative_mask[token[0] as usize] && bitset.get(i))
                        {
                            self.accepted.push(u32::try_from(i).unwrap_or(u32::MAX));
                            continue;
                        }
                    } else if !token.is_empty()
                        && token
                            .iter()
                            .all(|&b| b < 0x80 && speculative_mask[b as usize])
                    {
                        self.accepted.push(u32::try_from(i).unwrap_or(u32::MAX));
                        continue;
                    }
                }

                // LCP rollback against the previous token
                let mut accepted = true;
                if let Some(prev) = prev_token {
                    let lcp = token
                        .iter()
                        .zip(prev.iter())
                        .take_while(|(a, b)| a == b)
                        .count();
                    if lcp > prev_matched {
                        // The shared prefix was already rejected
                        accepted = false;
                    } else if lcp < prev_matched {
                        self.parser.pop_last_states(prev_matched - lcp);
                        self.can_reach_end.truncate(lcp + 1);
                        self.can_reach_end_prefix_or.truncate(lcp + 1);
                    }
                    prev_matched = prev_matched.min(lcp);
                }
                prev_token = Some(token);

                if accepted {
                    for &byte in &token[prev_matched..] {
                        if !self.parser.advance(byte) {
                            accepted = false;
                            break;
                        }
                        let at_end = self.parser.is_completed();
                        self.can_reach_end.push(at_end);
                        let prefix_or =
                            at_end || *self.can_reach_end_prefix_or.last().expect("non-empty");
                        self.can_reach_end_prefix_or.push(prefix_or);
                        prev_matched += 1;
                    }
                }

                let can_reach_end = *self.can_reach_end_prefix_or.last().expect("non-empty");
                if accepted {
                    self.accepted.push(u32::try_from(i).unwrap_or(u32::MAX));
                } else if can_reach_end && prev_matched > 0 {
                    let (lookahead_accepted, lookahead_completed) =
                        self.token_passes_lookahead(token, lookahead);
                    if !is_root_rule && lookahead_accepted {
                        if lookahead_completed || !lookahead_exact {
                            self.uncertain.push(u32::try_from(i).unwrap_or(u32::MAX));
                        } else {
                            self.accepted.push(u32::try_from(i).unwrap_or(u32::MAX));
                            self.accepted_by_lookahead
                                .push(u32::try_from(i).unwrap_or(u32::MAX));
                        }
                    } else {
                        // The whole trie subtree fails the same way
                        for j in i..subtree_range[i] {
                            self.rejected.push(u32::try_from(j).unwrap_or(u32::MAX));
                            self.rejected_by_lookahead
                                .push(u32::try_from(j).unwrap_or(u32::MAX));
                        }
                        index = subtree_range[i];
                    }
                } else {
                    self.rejected.push(u32::try_from(i).unwrap_or(u32::MAX));
                    last_rejected_range = subtree_range[i];
                }
            }
            if fill_rejected {
                if let Some(&(next_left, _)) = intervals.get(interval_index + 1) {
                    self.rejected.extend(
                        (right..next_left).map(|j| u32::try_from(j).unwrap_or(u32::MAX)),
                    );
                }
            }
        }

        // Roll the parser back to the initial position
        self.parser.pop_last_states(prev_matched);
        self.can_reach_end.truncate(1);
        self.can_reach_end_prefix_or.truncate(1);

        if fill_rejected {
            if let Some(&(_, last_right)) = intervals.last() {
                if last_right != sorted_vocab.len() {
                    self.rejected.extend(
                        (last_right..sorted_vocab.len())
                            .map(|j| u32::try_from(j).unwrap_or(u32::MAX)),
                    );
                }
            }
        }
        fill_rejected
    }

    // ==================== Look-ahead test ====================

    /// Whether the token's unconsumed suffix can satisfy the rule's
    /// look-ahead assertion from some position where the rule could have
    /// ended. Returns `(acceptable, lookahead_completed)`.
    fn token_passes_lookahead(
        &mut self,
        token: &[u8],
        lookahead: Option<usize>,
    ) -> (bool, bool) {
        let Some(lookahead) = lookahead else {
            return (true, true);
        };
        let lookahead_state = ParserState::new(
            LOOKAHEAD_RULE_ID,
            u32::try_from(lookahead).unwrap_or(u32::MAX),
            0,
            0,
        );
        self.parser.push_state_and_expand(lookahead_state);
        if self.parser.is_completed() {
            self.parser.pop_last_states(1);
            return (true, true);
        }

        for i in (0..self.can_reach_end.len()).rev() {
            if !self.can_reach_end[i] {
                continue;
            }
            let mut consumed = 0usize;
            let mut completed = false;
            for &byte in &token[i..] {
                if !self.parser.advance(byte) {
                    break;
                }
                consumed += 1;
                if self.parser.is_completed() {
                    completed = true;
                    break;
                }
            }
            if completed {
                self.parser.pop_last_states(consumed + 1);
                return (true, true);
            }
            if i + consumed == token.len() {
                // The suffix fits entirely but the assertion stays open
                self.parser.pop_last_states(consumed + 1);
                return (true, false);
            }
            self.parser.pop_last_states(consumed);
        }

        self.parser.pop_last_states(1);
        (false, false)
    }

    // ==================== Look-ahead adaptation of a weak-key hit ====================

    /// Resolve the uncertain set of a look-ahead-independent cached mask
    /// against this rule's look-ahead (same LCP discipline, restricted to
    /// the uncertain indices).
    pub fn adapt_with_lookahead(&mut self, mask: &mut AdaptiveTokenMask, is_root_rule: bool) {
        let rule_id = self.init_rule_id();
        let rule = self.grammar.rule(rule_id);
        let lookahead = rule.lookahead;
        let lookahead_exact = rule.lookahead_exact;
        let sorted_vocab = self.tokenizer_info.sorted_decoded_vocab();
        let subtree_range = self.tokenizer_info.trie_subtree_nodes_range();

        let mut new_accepted: Vec<u32> = Vec::new();
        let mut new_rejected: Vec<u32> = Vec::new();
        let mut new_uncertain: Vec<u32> = Vec::new();

        if is_root_rule {
            // The root has no continuation: uncertain resolves to rejected
            new_rejected = std::mem::take(&mut mask.uncertain_indices);
        } else {
            if lookahead.is_none() {
                return;
            }
            let uncertain = std::mem::take(&mut mask.uncertain_indices);
            let mut prev_token: Option<&[u8]> = None;
            let mut prev_matched = 0usize;
            let mut last_rejected_range = 0usize;
            for &index in &uncertain {
                let i = index as usize;
                if i < last_rejected_range {
                    new_rejected.push(index);
                    continue;
                }
                let token = sorted_vocab[i].1.as_slice();
                let mut accepted = true;
                if let Some(prev) = prev_token {
                    let lcp = token
                        .iter()
                        .zip(prev.iter())
                        .take_while(|(a, b)| a == b)
                        .count();
                    if lcp > prev_matched {
                        accepted = false;
                    } else if lcp < prev_matched {
                        self.parser.pop_last_states(prev_matched - lcp);
                        self.can_reach_end.truncate(lcp + 1);
                        self.can_reach_end_prefix_or.truncate(lcp + 1);
                    }
                    prev_matched = prev_matched.min(lcp);
                }
                prev_token = Some(token);

                if accepted {
                    for &byte in &token[prev_matched..] {
                        if !self.parser.advance(byte) {
                            accepted = false;
                            break;
                        }
                        let at_end = self.parser.is_completed();
                        self.can_reach_end.push(at_end);
                        let prefix_or =
                            at_end || *self.can_reach_end_prefix_or.last().expect("non-empty");
                        self.can_reach_end_prefix_or.push(prefix_or);
                        prev_matched += 1;
                    }
                }

                let can_reach_end = *self.can_reach_end_prefix_or.last().expect("non-empty");
                if accepted {
                    // An uncertain token never fully consumes in the base
                    // run; treat a full match as accepted anyway.
                    new_accepted.push(index);
                } else if can_reach_end && prev_matched > 0 {
                    let (lookahead_accepted, lookahead_completed) =
                        self.token_passes_lookahead(token, lookahead);
                    if lookahead_accepted {
                        if lookahead_completed || !lookahead_exact {
                            new_uncertain.push(index);
                        } else {
                            new_accepted.push(index);
                        }
                    } else {
                        new_rejected.push(index);
                        last_rejected_range = subtree_range[i];
                    }
                } else {
                    new_rejected.push(index);
                    last_rejected_range = subtree_range[i];
                }
            }
            self.parser.pop_last_states(prev_matched);
            self.can_reach_end.truncate(1);
            self.can_reach_end_prefix_or.truncate(1);
        }

        // Fold the resolution into the cached mask's storage
        mask.uncertain_indices = new_uncertain;
        let vocab_size = self.tokenizer_info.vocab_size();
        match mask.store_type {
            MaskStoreType::Accepted => {
                if mask.accepted_indices.len() + new_accepted.len()
                    < crate::mask::USE_BITSET_THRESHOLD
                {
                    sorted_union(&mut mask.accepted_indices, &new_accepted);
                } else {
                    let mut bitset = DynamicBitset::new(vocab_size);
                    for &idx in mask.accepted_indices.iter().chain(new_accepted.iter()) {
                        bitset.set(sorted_vocab[idx as usize].0 as usize);
                    }
                    mask.store_type = MaskStoreType::AcceptedBitset;
                    mask.accepted_bitset = bitset;
                    mask.accepted_indices.clear();
                }
            }
            MaskStoreType::Rejected => {
                if mask.rejected_indices.len() + new_rejected.len()
                    < crate::mask::USE_BITSET_THRESHOLD
                {
                    sorted_union(&mut mask.rejected_indices, &new_rejected);
                } else {
                    let mut bitset = DynamicBitset::new(vocab_size);
                    bitset.set_all();
                    for &special in self.tokenizer_info.special_token_ids() {
                        bitset.reset(special as usize);
                    }
                    for &idx in mask
                        .uncertain_indices
                        .iter()
                        .chain(mask.rejected_indices.iter())
                        .chain(new_rejected.iter())
                    {
                        bitset.reset(sorted_vocab[idx as usize].0 as usize);
                    }
                    mask.store_type = MaskStoreType::AcceptedBitset;
                    mask.accepted_bitset = bitset;
                    mask.rejected_indices.clear();
                }
            }
            MaskStoreType::AcceptedBitset => {
                for &idx in &new_accepted {
                    mask.accepted_bitset.set(sorted_vocab[idx as usize].0 as usize);
                }
            }
        }
    }
}
