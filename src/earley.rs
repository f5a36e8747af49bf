//! Earley-style incremental parser core
//!
//! The parser advances a set of configurations over input bytes. A
//! configuration is a stack of frames: the bottom frame runs the initial
//! rule (or a look-ahead assertion) and each deeper frame runs a callee.
//! Choices/sequence rules walk their atoms element by element; FSM-backed
//! rules walk states of the compact machine. Every successful operation
//! pushes a step onto a history stack so `pop_last_states` can restore any
//! earlier configuration exactly.

use std::collections::HashSet;

use crate::grammar::{Grammar, GrammarExpr, RuleId};

/// Sentinel for "no previous input position".
pub const NO_PREV_INPUT_POS: u32 = u32::MAX;

/// Sentinel rule id marking a look-ahead run.
pub const LOOKAHEAD_RULE_ID: i32 = -1;

/// Address of one grammar position, the key of the token-mask table.
///
/// For choices/sequence rules, `sequence_id` is the sequence expression
/// and `element_id` indexes its atoms; for FSM-backed rules, `sequence_id`
/// is the rule body and `element_id` is an FSM state id.
/// `sub_element_id` disambiguates partial consumption inside a byte
/// string (byte offset) or a multi-byte UTF-8 character (continuation
/// bytes remaining).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParserState {
    /// Rule being executed; [`LOOKAHEAD_RULE_ID`] for look-ahead runs
    pub rule_id: i32,
    /// Sequence expression id, or the rule body id for FSM rules
    pub sequence_id: u32,
    /// Sequence element index, or FSM state id
    pub element_id: u32,
    /// Input position of the previous state, or [`NO_PREV_INPUT_POS`]
    pub prev_input_pos: u32,
    /// Byte offset / remaining UTF-8 continuation bytes
    pub sub_element_id: u32,
}

impl ParserState {
    /// A cache position (no input-position provenance).
    #[must_use]
    pub fn new(rule_id: i32, sequence_id: u32, element_id: u32, sub_element_id: u32) -> Self {
        Self {
            rule_id,
            sequence_id,
            element_id,
            prev_input_pos: NO_PREV_INPUT_POS,
            sub_element_id,
        }
    }
}

/// Hard bound on configurations alive in one step; degenerate grammars
/// (deep left recursion) stop expanding past it instead of hanging.
const MAX_CONFIGS_PER_STEP: usize = 16_384;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Frame {
    /// Rule this frame executes ([`LOOKAHEAD_RULE_ID`] at the bottom of a
    /// look-ahead run)
    rule_id: i32,
    /// Whether the frame runs on the rule's compact FSM
    is_fsm: bool,
    /// Sequence expression id (non-FSM frames)
    sequence_id: usize,
    /// Sequence element index or FSM state id
    element_id: usize,
    /// Byte offset in a byte string / UTF-8 continuation bytes remaining
    sub_element_id: usize,
    /// Completed iterations of the repeat element currently in progress
    repeat_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Config {
    frames: Vec<Frame>,
}

#[derive(Debug, Clone)]
struct Step {
    configs: Vec<Config>,
    completed: bool,
}

/// The parser. One instance per mask computation; single-threaded.
pub struct EarleyParser<'g> {
    grammar: &'g Grammar,
    steps: Vec<Step>,
}

impl<'g> EarleyParser<'g> {
    /// Create a parser positioned at `init_state`.
    #[must_use]
    pub fn new(grammar: &'g Grammar, init_state: ParserState) -> Self {
        let mut parser = Self {
            grammar,
            steps: Vec::new(),
        };
        let config = parser.config_from_state(init_state);
        let step = parser.close(vec![config]);
        parser.steps.push(step);
        parser
    }

    /// The grammar this parser runs on.
    #[must_use]
    pub fn grammar(&self) -> &Grammar {
        self.grammar
    }

    fn config_from_state(&self, state: ParserState) -> Config {
        let is_fsm = state.rule_id >= 0
            && self
                .grammar
                .per_rule_fsm(state.rule_id as usize)
                .is_some();
        Config {
            frames: vec![Frame {
                rule_id: state.rule_id,
                is_fsm,
                sequence_id: state.sequence_id as usize,
                element_id: state.element_id as usize,
                sub_element_id: state.sub_element_id as usize,
                repeat_count: 0,
            }],
        }
    }

    /// Whether at least one active configuration has completed the rule
    /// at the bottom of its stack.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.steps.last().is_some_and(|s| s.completed)
    }

    /// Number of steps that can be rolled back.
    #[must_use]
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    /// Consume one byte. Pushes a step and returns `true` when any
    /// configuration survives; otherwise leaves the parser untouched and
    /// returns `false`.
    pub fn advance(&mut self, byte: u8) -> bool {
        let mut scanned = Vec::new();
        if let Some(step) = self.steps.last() {
            for config in &step.configs {
                self.scan_config(config, byte, &mut scanned);
            }
        }
        if scanned.is_empty() {
            return false;
        }
        let step = self.close(scanned);
        if step.configs.is_empty() && !step.completed {
            return false;
        }
        self.steps.push(step);
        true
    }

    /// Enter a sub-rule (used for look-ahead checks): the active set is
    /// replaced by the closure of exactly `state`. Restore with
    /// [`Self::pop_last_states`]; the base configuration is never mutated.
    pub fn push_state_and_expand(&mut self, state: ParserState) {
        let config = self.config_from_state(state);
        let step = self.close(vec![config]);
        self.steps.push(step);
    }

    /// Roll back the `count` most recent steps.
    pub fn pop_last_states(&mut self, count: usize) {
        let keep = self.steps.len().saturating_sub(count);
        self.steps.truncate(keep.max(1));
    }

    // ==================== Scanning ====================

    fn scan_config(&self, config: &Config, byte: u8, out: &mut Vec<Config>) {
        let Some(frame) = config.frames.last() else {
            return;
        };
        if frame.is_fsm {
            let Some(fsm) = self.fsm_of(frame.rule_id) else {
                return;
            };
            for edge in fsm.fsm().edges(frame.element_id) {
                if edge.accepts_byte(byte) {
                    let mut next = config.clone();
                    next.frames.last_mut().expect("non-empty").element_id = edge.target;
                    out.push(next);
                }
            }
            return;
        }

        let GrammarExpr::Sequence(elements) = self.grammar.expr(frame.sequence_id) else {
            return;
        };
        if frame.element_id >= elements.len() {
            return;
        }
        match self.grammar.expr(elements[frame.element_id]) {
            GrammarExpr::ByteString(bytes) => {
                if bytes.get(frame.sub_element_id) == Some(&byte) {
                    let mut next = config.clone();
                    let top = next.frames.last_mut().expect("non-empty");
                    top.sub_element_id += 1;
                    if top.sub_element_id == bytes.len() {
                        top.element_id += 1;
                        top.sub_element_id = 0;
                    }
                    out.push(next);
                }
            }
            GrammarExpr::CharacterClass { negated, ranges } => {
                if let Some(next_sub) =
                    Self::scan_char_class(byte, *negated, ranges, frame.sub_element_id)
                {
                    let mut next = config.clone();
                    let top = next.frames.last_mut().expect("non-empty");
                    top.sub_element_id = next_sub;
                    if next_sub == 0 {
                        top.element_id += 1;
                    }
                    out.push(next);
                }
            }
            GrammarExpr::CharacterClassStar { negated, ranges } => {
                if let Some(next_sub) =
                    Self::scan_char_class(byte, *negated, ranges, frame.sub_element_id)
                {
                    let mut next = config.clone();
                    let top = next.frames.last_mut().expect("non-empty");
                    top.sub_element_id = next_sub;
                    out.push(next);
                }
            }
            _ => {}
        }
    }

    /// Match one byte of a character class. Returns the next
    /// `sub_element_id` (continuation bytes remaining) on success.
    fn scan_char_class(
        byte: u8,
        negated: bool,
        ranges: &[(u32, u32)],
        sub_element_id: usize,
    ) -> Option<usize> {
        if sub_element_id > 0 {
            // Mid-character: a continuation byte
            if (0x80..=0xBF).contains(&byte) {
                return Some(sub_element_id - 1);
            }
            return None;
        }
        if byte < 0x80 {
            let cp = u32::from(byte);
            let in_ranges = ranges.iter().any(|&(lo, hi)| lo <= cp && cp <= hi);
            if in_ranges != negated {
                return Some(0);
            }
            return None;
        }
        // Lead byte of a multi-byte character. Code points at or above
        // U+0080 are admitted wholesale for negative classes; positive
        // classes are checked against the lead byte's code-point span.
        let (len, span) = match byte {
            0xC2..=0xDF => (2, (0x80u32, 0x7FFu32)),
            0xE0..=0xEF => (3, (0x800, 0xFFFF)),
            0xF0..=0xF4 => (4, (0x10000, 0x10_FFFF)),
            _ => return None,
        };
        if negated || ranges.iter().any(|&(lo, hi)| lo <= span.1 && span.0 <= hi) {
            return Some(len - 1);
        }
        None
    }

    // ==================== Closure ====================

    /// Expand epsilon moves, rule descents and completions to a fixpoint,
    /// keeping only configurations that await a byte.
    fn close(&self, initial: Vec<Config>) -> Step {
        let mut resting = Vec::new();
        let mut completed = false;
        let mut seen: HashSet<Config> = HashSet::new();
        let mut work = initial;
        while let Some(config) = work.pop() {
            if seen.len() >= MAX_CONFIGS_PER_STEP {
                break;
            }
            if !seen.insert(config.clone()) {
                continue;
            }
            self.expand_config(&config, &mut work, &mut resting, &mut completed);
        }
        Step {
            configs: resting,
            completed,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn expand_config(
        &self,
        config: &Config,
        work: &mut Vec<Config>,
        resting: &mut Vec<Config>,
        completed: &mut bool,
    ) {
        let Some(frame) = config.frames.last() else {
            return;
        };

        if frame.is_fsm {
            let Some(fsm) = self.fsm_of(frame.rule_id) else {
                return;
            };
            let state = frame.element_id;
            if fsm.is_end_state(state) {
                self.complete_frame(config, work, completed);
            }
            let mut has_char_edge = false;
            for edge in fsm.fsm().edges(state) {
                if edge.is_char_range() {
                    has_char_edge = true;
                } else if let Some(callee) = edge.rule_ref_id() {
                    // Wait at the edge target, then run the callee
                    let mut next = config.clone();
                    next.frames.last_mut().expect("non-empty").element_id = edge.target;
                    self.push_callee(next, callee, work);
                }
            }
            if has_char_edge {
                resting.push(config.clone());
            }
            return;
        }

        // The empty alternative of a callee completes immediately.
        if matches!(self.grammar.expr(frame.sequence_id), GrammarExpr::EmptyStr) {
            self.complete_frame(config, work, completed);
            return;
        }
        let GrammarExpr::Sequence(elements) = self.grammar.expr(frame.sequence_id) else {
            // A malformed frame cannot make progress
            return;
        };
        if frame.element_id >= elements.len() {
            self.complete_frame(config, work, completed);
            return;
        }
        match self.grammar.expr(elements[frame.element_id]) {
            GrammarExpr::ByteString(_) | GrammarExpr::CharacterClass { .. } => {
                resting.push(config.clone());
            }
            GrammarExpr::CharacterClassStar { .. } => {
                resting.push(config.clone());
                if frame.sub_element_id == 0 {
                    // The star may also be skipped
                    let mut next = config.clone();
                    let top = next.frames.last_mut().expect("non-empty");
                    top.element_id += 1;
                    work.push(next);
                }
            }
            GrammarExpr::RuleRef(callee) => {
                let callee = *callee;
                let mut next = config.clone();
                {
                    let top = next.frames.last_mut().expect("non-empty");
                    top.element_id += 1;
                    top.sub_element_id = 0;
                }
                self.push_callee(next, callee, work);
            }
            GrammarExpr::Repeat { rule, min, max } => {
                let (rule, min, max) = (*rule, *min, *max);
                if frame.repeat_count >= min {
                    let mut next = config.clone();
                    let top = next.frames.last_mut().expect("non-empty");
                    top.element_id += 1;
                    top.sub_element_id = 0;
                    top.repeat_count = 0;
                    work.push(next);
                }
                if frame.repeat_count < max {
                    // Stay at the repeat element; the count bumps on the
                    // callee's completion
                    self.push_callee(config.clone(), rule, work);
                }
            }
            GrammarExpr::EmptyStr => {
                let mut next = config.clone();
                next.frames.last_mut().expect("non-empty").element_id += 1;
                work.push(next);
            }
            // Nested combinators cannot appear in normalized sequences
            GrammarExpr::Sequence(_) | GrammarExpr::Choices(_) | GrammarExpr::TagDispatch(_) => {}
        }
    }

    /// Pop the innermost frame; the parent (pre-advanced at descent time)
    /// resumes, bumping its repeat counter when it sits on a repeat
    /// element.
    fn complete_frame(&self, config: &Config, work: &mut Vec<Config>, completed: &mut bool) {
        if config.frames.len() == 1 {
            *completed = true;
            return;
        }
        let mut next = config.clone();
        next.frames.pop();
        let parent = next.frames.last_mut().expect("at least one frame left");
        if !parent.is_fsm {
            if let GrammarExpr::Sequence(elements) = self.grammar.expr(parent.sequence_id) {
                if let Some(&element) = elements.get(parent.element_id) {
                    if matches!(self.grammar.expr(element), GrammarExpr::Repeat { .. }) {
                        parent.repeat_count += 1;
                    }
                }
            }
        }
        work.push(next);
    }

    /// Push one forked configuration per way of entering `callee`: its
    /// FSM start when lowered, otherwise one fork per alternative of its
    /// normalized choices (an `EmptyStr` alternative completes
    /// immediately, making a nullable callee transparent).
    fn push_callee(&self, base: Config, callee: RuleId, work: &mut Vec<Config>) {
        if base.frames.len() >= 256 {
            // Runaway descent; drop the configuration
            return;
        }
        let rule_id = i32::try_from(callee).unwrap_or(i32::MAX);
        if let Some(fsm) = self.grammar.per_rule_fsm(callee) {
            let mut next = base;
            next.frames.push(Frame {
                rule_id,
                is_fsm: true,
                sequence_id: self.grammar.rule(callee).body,
                element_id: fsm.start(),
                sub_element_id: 0,
                repeat_count: 0,
            });
            work.push(next);
            return;
        }
        let body = self.grammar.rule(callee).body;
        let GrammarExpr::Choices(choices) = self.grammar.expr(body) else {
            return;
        };
        for &choice in choices {
            if !matches!(
                self.grammar.expr(choice),
                GrammarExpr::EmptyStr | GrammarExpr::Sequence(_)
            ) {
                continue;
            }
            let mut forked = base.clone();
            forked.frames.push(Frame {
                rule_id,
                is_fsm: false,
                sequence_id: choice,
                element_id: 0,
                sub_element_id: 0,
                repeat_count: 0,
            });
            work.push(forked);
        }
    }

    fn fsm_of(&self, rule_id: i32) -> Option<&crate::fsm::CompactFsmWithStartEnd> {
        if rule_id < 0 {
            return None;
        }
        self.grammar.per_rule_fsm(rule_id as usize)
    }
}

/// The initial parser state of an optimized grammar's root rule.
#[must_use]
pub fn root_initial_state(grammar: &Grammar) -> ParserState {
    let root = grammar.root_rule_id();
    let body = grammar.root_rule().body;
    let element = grammar
        .per_rule_fsm(root)
        .map_or(0, crate::fsm::CompactFsmWithStartEnd::start);
    ParserState::new(
        i32::try_from(root).unwrap_or(i32::MAX),
        u32::try_from(body).unwrap_or(u32::MAX),
        u32::try_from(element).unwrap_or(u32::MAX),
        0,
    )
}

/// Feed `input` through a fresh parser on `grammar`'s root rule. Returns
/// `None` if some byte is rejected, otherwise whether the root completed.
/// Test and validation helper.
#[must_use]
pub fn match_bytes(grammar: &Grammar, input: &[u8]) -> Option<bool> {
    let mut parser = EarleyParser::new(grammar, root_initial_state(grammar));
    for &b in input {
        if !parser.advance(b) {
            return None;
        }
    }
    Some(parser.is_completed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::functor::{normalize, optimize};

    fn compile(text: &str) -> Grammar {
        let grammar = Grammar::from_ebnf(text, "root").expect("valid grammar");
        optimize(&normalize(&grammar))
    }

    fn accepts(grammar: &Grammar, input: &[u8]) -> bool {
        match_bytes(grammar, input) == Some(true)
    }

    fn prefix_ok(grammar: &Grammar, input: &[u8]) -> bool {
        match_bytes(grammar, input).is_some()
    }

    #[test]
    fn test_literal_rule() {
        let grammar = compile(r#"root ::= "hello""#);
        assert!(accepts(&grammar, b"hello"));
        assert!(!accepts(&grammar, b"hell"));
        assert!(prefix_ok(&grammar, b"hell"));
        assert!(!prefix_ok(&grammar, b"hex"));
    }

    #[test]
    fn test_choices_and_refs() {
        let grammar = compile(
            r#"root ::= sign digits
sign ::= "+" | "-" | ""
digits ::= [0-9] digits | [0-9]"#,
        );
        assert!(accepts(&grammar, b"+12"));
        assert!(accepts(&grammar, b"7"));
        assert!(!accepts(&grammar, b"+"));
        assert!(!prefix_ok(&grammar, b"++"));
    }

    #[test]
    fn test_char_class_star_utf8() {
        let grammar = compile("root ::= [a-z\u{03b1}-\u{03c9}]*");
        assert!(accepts(&grammar, b""));
        assert!(accepts(&grammar, b"abc"));
        assert!(accepts(&grammar, "aβc".as_bytes()));
        assert!(!prefix_ok(&grammar, b"A"));
    }

    #[test]
    fn test_repeat_bounds() {
        let grammar = compile(
            r#"root ::= digit{2,3}
digit ::= [0-9]"#,
        );
        assert!(!accepts(&grammar, b"1"));
        assert!(accepts(&grammar, b"12"));
        assert!(accepts(&grammar, b"123"));
        assert!(!prefix_ok(&grammar, b"1234"));
    }

    #[test]
    fn test_tag_dispatch_rule() {
        let grammar = compile(
            r#"root ::= TagDispatch(("<f>", body), stop_eos=true, stop_str=(), loop_after_dispatch=true, excludes=())
body ::= "x""#,
        );
        assert!(accepts(&grammar, b""));
        assert!(accepts(&grammar, b"free text"));
        assert!(accepts(&grammar, b"zz<f>x"));
        assert!(accepts(&grammar, b"zz<f>xmore<f>x"));
        // Inside the dispatched rule, only "x" continues
        assert!(!prefix_ok(&grammar, b"<f>y"));
    }

    #[test]
    fn test_rollback_restores_configuration() {
        let grammar = compile(r#"root ::= "ab" | "ac""#);
        let mut parser = EarleyParser::new(&grammar, root_initial_state(&grammar));
        assert!(parser.advance(b'a'));
        let steps_after_a = parser.num_steps();
        assert!(parser.advance(b'b'));
        assert!(parser.is_completed());
        parser.pop_last_states(1);
        assert_eq!(parser.num_steps(), steps_after_a);
        assert!(!parser.is_completed());
        assert!(parser.advance(b'c'));
        assert!(parser.is_completed());
    }

    #[test]
    fn test_push_state_and_expand_layers() {
        let grammar = compile(
            r#"root ::= part ";"
part ::= "ab""#,
        );
        let part = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name == "part")
            .expect("part exists");
        let lookahead = grammar.rule(part).lookahead.expect("detected look-ahead");
        let mut parser = EarleyParser::new(&grammar, root_initial_state(&grammar));
        assert!(parser.advance(b'a'));
        assert!(parser.advance(b'b'));
        // Layer a look-ahead run on top, consume ";", then restore
        let before = parser.num_steps();
        parser.push_state_and_expand(ParserState::new(
            LOOKAHEAD_RULE_ID,
            u32::try_from(lookahead).expect("fits"),
            0,
            0,
        ));
        assert!(parser.advance(b';'));
        assert!(parser.is_completed());
        parser.pop_last_states(2);
        assert_eq!(parser.num_steps(), before);
        assert!(parser.advance(b';'));
        assert!(parser.is_completed());
    }

    #[test]
    fn test_nullable_root_completes_immediately() {
        let grammar = compile(r#"root ::= "" | "x""#);
        let parser = EarleyParser::new(&grammar, root_initial_state(&grammar));
        assert!(parser.is_completed());
    }
}
