//! Regex front end
//!
//! Parses a practical regex subset (the constructs used by the JSON-schema
//! format table and typical user patterns) into an AST, then lowers it
//! either to EBNF text for the grammar pipeline or directly to an FSM for
//! the regex-with-excludes intersection path.
//!
//! Supported: literals, `.`, classes with ranges and shorthands, groups
//! (capturing and `(?:`), alternation, greedy quantifiers `*` `+` `?`
//! `{m}` `{m,}` `{m,n}` (laziness markers are accepted and ignored),
//! `^`/`$` anchors (treated as empty). Look-around is rejected.

use crate::error::{MoldearError, Result};
use crate::fsm::unicode::character_class_fsm;
use crate::fsm::FsmWithStartEnd;
use crate::grammar::ebnf::{escape_class_char, escape_literal_bytes};
use crate::grammar::Grammar;

/// Parsed regex node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegexAst {
    /// Literal string
    Literal(String),
    /// Character class over code-point ranges
    Class {
        /// Whether the class is negated
        negated: bool,
        /// Inclusive code-point ranges
        ranges: Vec<(u32, u32)>,
    },
    /// Ordered concatenation
    Concat(Vec<RegexAst>),
    /// Alternation
    Alt(Vec<RegexAst>),
    /// Quantified node; `max == None` means unbounded
    Repeat {
        /// Quantified node
        node: Box<RegexAst>,
        /// Minimum repetitions
        min: u32,
        /// Maximum repetitions
        max: Option<u32>,
    },
    /// The empty word (also used for anchors)
    Empty,
}

/// Parse `pattern` into an AST.
///
/// # Errors
///
/// Returns [`MoldearError::InvalidGrammar`] on malformed or unsupported
/// syntax.
pub fn parse_regex(pattern: &str) -> Result<RegexAst> {
    let mut parser = RegexParser {
        chars: pattern.chars().collect(),
        pos: 0,
    };
    let ast = parser.parse_alternation()?;
    if parser.pos != parser.chars.len() {
        return Err(MoldearError::InvalidGrammar(format!(
            "unexpected `{}` at position {} in regex",
            parser.chars[parser.pos], parser.pos
        )));
    }
    Ok(ast)
}

/// Convert a regex pattern to an EBNF expression string.
///
/// # Errors
///
/// Returns [`MoldearError::InvalidGrammar`] when the pattern cannot be
/// parsed.
pub fn regex_to_ebnf(pattern: &str) -> Result<String> {
    let ast = parse_regex(pattern)?;
    let mut out = String::new();
    write_ebnf(&ast, &mut out);
    if out.is_empty() {
        out.push_str("\"\"");
    }
    Ok(out)
}

impl Grammar {
    /// Compile a regex pattern into a normalized grammar.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidGrammar`] when the pattern cannot be
    /// parsed.
    pub fn from_regex(pattern: &str) -> Result<Grammar> {
        let body = regex_to_ebnf(pattern)?;
        Grammar::from_ebnf(&format!("root ::= {body}\n"), "root")
    }
}

/// Builds byte-level FSMs from regex patterns (Thompson construction).
pub struct RegexFsmBuilder;

impl RegexFsmBuilder {
    /// Build the FSM of `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidGrammar`] when the pattern cannot be
    /// parsed, or [`MoldearError::GrammarBuildFailure`] when a bounded
    /// repetition is too large to expand.
    pub fn build(pattern: &str) -> Result<FsmWithStartEnd> {
        let ast = parse_regex(pattern)?;
        ast_to_fsm(&ast)
    }
}

const MAX_EXPANDED_REPEATS: u32 = 1024;

fn ast_to_fsm(ast: &RegexAst) -> Result<FsmWithStartEnd> {
    match ast {
        RegexAst::Literal(s) => {
            let mut fsm = FsmWithStartEnd::new();
            let mut current = fsm.add_state();
            fsm.set_start(current);
            for &b in s.as_bytes() {
                let next = fsm.add_state();
                fsm.fsm_mut().add_edge(current, next, b, b);
                current = next;
            }
            fsm.add_end_state(current);
            Ok(fsm)
        }
        RegexAst::Class { negated, ranges } => Ok(character_class_fsm(ranges, *negated, false)),
        RegexAst::Concat(parts) => {
            let machines: Result<Vec<_>> = parts.iter().map(ast_to_fsm).collect();
            let machines = machines?;
            if machines.is_empty() {
                Ok(FsmWithStartEnd::empty_string())
            } else {
                Ok(FsmWithStartEnd::concat(machines))
            }
        }
        RegexAst::Alt(parts) => {
            let machines: Result<Vec<_>> = parts.iter().map(ast_to_fsm).collect();
            Ok(FsmWithStartEnd::union(machines?))
        }
        RegexAst::Repeat { node, min, max } => {
            if max.unwrap_or(*min) > MAX_EXPANDED_REPEATS {
                return Err(MoldearError::GrammarBuildFailure(format!(
                    "repetition bound {} exceeds {MAX_EXPANDED_REPEATS}",
                    max.unwrap_or(*min)
                )));
            }
            let base = ast_to_fsm(node)?;
            let mut parts = Vec::new();
            for _ in 0..*min {
                parts.push(base.clone());
            }
            match max {
                None => parts.push(base.star()),
                Some(max) => {
                    for _ in *min..*max {
                        parts.push(base.clone().optional());
                    }
                }
            }
            if parts.is_empty() {
                Ok(FsmWithStartEnd::empty_string())
            } else {
                Ok(FsmWithStartEnd::concat(parts))
            }
        }
        RegexAst::Empty => Ok(FsmWithStartEnd::empty_string()),
    }
}

fn write_ebnf(ast: &RegexAst, out: &mut String) {
    match ast {
        RegexAst::Literal(s) => {
            out.push('"');
            escape_literal_bytes(s.as_bytes(), out);
            out.push('"');
        }
        RegexAst::Class { negated, ranges } => {
            out.push('[');
            if *negated {
                out.push('^');
            }
            for &(lo, hi) in ranges {
                escape_class_char(lo, out);
                if hi > lo {
                    out.push('-');
                    escape_class_char(hi, out);
                }
            }
            out.push(']');
        }
        RegexAst::Concat(parts) => {
            let mut first = true;
            for part in parts {
                if matches!(part, RegexAst::Empty) {
                    continue;
                }
                if !first {
                    out.push(' ');
                }
                first = false;
                write_grouped(part, out);
            }
            if first {
                out.push_str("\"\"");
            }
        }
        RegexAst::Alt(parts) => {
            out.push('(');
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    out.push_str(" | ");
                }
                write_ebnf(part, out);
            }
            out.push(')');
        }
        RegexAst::Repeat { node, min, max } => {
            write_grouped(node, out);
            match (min, max) {
                (0, None) => out.push('*'),
                (1, None) => out.push('+'),
                (0, Some(1)) => out.push('?'),
                (m, None) => {
                    let _ = std::fmt::Write::write_fmt(out, format_args!("{{{m},}}"));
                }
                (m, Some(x)) => {
                    let _ = std::fmt::Write::write_fmt(out, format_args!("{{{m},{x}}}"));
                }
            }
        }
        RegexAst::Empty => out.push_str("\"\""),
    }
}

fn write_grouped(ast: &RegexAst, out: &mut String) {
    let needs_parens = matches!(
        ast,
        RegexAst::Concat(_) | RegexAst::Repeat { .. }
    ) || matches!(ast, RegexAst::Literal(s) if s.chars().count() > 1);
    if needs_parens {
        out.push('(');
        write_ebnf(ast, out);
        out.push(')');
    } else {
        write_ebnf(ast, out);
    }
}

struct RegexParser {
    chars: Vec<char>,
    pos: usize,
}

impl RegexParser {
    fn error(&self, message: impl Into<String>) -> MoldearError {
        MoldearError::InvalidGrammar(format!(
            "{} at position {} in regex",
            message.into(),
            self.pos
        ))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn parse_alternation(&mut self) -> Result<RegexAst> {
        let mut parts = vec![self.parse_concat()?];
        while self.peek() == Some('|') {
            self.pos += 1;
            parts.push(self.parse_concat()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("one part"))
        } else {
            Ok(RegexAst::Alt(parts))
        }
    }

    fn parse_concat(&mut self) -> Result<RegexAst> {
        let mut parts: Vec<RegexAst> = Vec::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            let atom = self.parse_atom()?;
            let quantified = self.parse_quantifier(atom)?;
            // Merge adjacent single-character literals
            if let (Some(RegexAst::Literal(prev)), RegexAst::Literal(cur)) =
                (parts.last_mut(), &quantified)
            {
                prev.push_str(cur);
                continue;
            }
            parts.push(quantified);
        }
        match parts.len() {
            0 => Ok(RegexAst::Empty),
            1 => Ok(parts.pop().expect("one part")),
            _ => Ok(RegexAst::Concat(parts)),
        }
    }

    fn parse_quantifier(&mut self, atom: RegexAst) -> Result<RegexAst> {
        let (min, max) = match self.peek() {
            Some('*') => {
                self.pos += 1;
                (0, None)
            }
            Some('+') => {
                self.pos += 1;
                (1, None)
            }
            Some('?') => {
                self.pos += 1;
                (0, Some(1))
            }
            Some('{') => {
                // `{` not followed by a bound is a literal brace
                let saved = self.pos;
                self.pos += 1;
                match self.try_parse_bounds() {
                    Some(bounds) => bounds,
                    None => {
                        self.pos = saved;
                        return Ok(atom);
                    }
                }
            }
            _ => return Ok(atom),
        };
        // Swallow a laziness marker
        if self.peek() == Some('?') {
            self.pos += 1;
        }
        if matches!(atom, RegexAst::Empty) {
            return Ok(RegexAst::Empty);
        }
        Ok(RegexAst::Repeat {
            node: Box::new(atom),
            min,
            max,
        })
    }

    fn try_parse_bounds(&mut self) -> Option<(u32, Option<u32>)> {
        let start = self.pos;
        let min = self.parse_number()?;
        match self.peek() {
            Some('}') => {
                self.pos += 1;
                Some((min, Some(min)))
            }
            Some(',') => {
                self.pos += 1;
                if self.peek() == Some('}') {
                    self.pos += 1;
                    return Some((min, None));
                }
                let max = self.parse_number()?;
                if self.peek() == Some('}') {
                    self.pos += 1;
                    Some((min, Some(max)))
                } else {
                    self.pos = start;
                    None
                }
            }
            _ => {
                self.pos = start;
                None
            }
        }
    }

    fn parse_number(&mut self) -> Option<u32> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .parse()
            .ok()
    }

    fn parse_atom(&mut self) -> Result<RegexAst> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                if self.peek() == Some('?') {
                    self.pos += 1;
                    match self.peek() {
                        Some(':') => {
                            self.pos += 1;
                        }
                        Some('=') | Some('!') | Some('<') => {
                            return Err(self.error("look-around is not supported"));
                        }
                        _ => return Err(self.error("unsupported group modifier")),
                    }
                }
                let inner = self.parse_alternation()?;
                if self.bump() != Some(')') {
                    return Err(self.error("unbalanced parenthesis"));
                }
                Ok(inner)
            }
            Some('[') => self.parse_class(),
            Some('.') => {
                self.pos += 1;
                Ok(RegexAst::Class {
                    negated: true,
                    ranges: vec![(0x0A, 0x0A), (0x0D, 0x0D)],
                })
            }
            Some('^') | Some('$') => {
                self.pos += 1;
                Ok(RegexAst::Empty)
            }
            Some('\\') => {
                self.pos += 1;
                self.parse_escape_atom()
            }
            Some(')') | None => Err(self.error("expected atom")),
            Some(c) => {
                self.pos += 1;
                Ok(RegexAst::Literal(c.to_string()))
            }
        }
    }

    fn shorthand_ranges(c: char) -> Option<(bool, Vec<(u32, u32)>)> {
        let digit = vec![(u32::from(b'0'), u32::from(b'9'))];
        let word = vec![
            (u32::from(b'0'), u32::from(b'9')),
            (u32::from(b'A'), u32::from(b'Z')),
            (u32::from(b'_'), u32::from(b'_')),
            (u32::from(b'a'), u32::from(b'z')),
        ];
        let space = vec![(0x09, 0x0D), (0x20, 0x20)];
        match c {
            'd' => Some((false, digit)),
            'D' => Some((true, digit)),
            'w' => Some((false, word)),
            'W' => Some((true, word)),
            's' => Some((false, space)),
            'S' => Some((true, space)),
            _ => None,
        }
    }

    fn parse_escape_atom(&mut self) -> Result<RegexAst> {
        let Some(c) = self.bump() else {
            return Err(self.error("trailing backslash"));
        };
        if let Some((negated, ranges)) = Self::shorthand_ranges(c) {
            return Ok(RegexAst::Class { negated, ranges });
        }
        let cp = self.escape_code_point(c)?;
        match char::from_u32(cp) {
            Some(ch) => Ok(RegexAst::Literal(ch.to_string())),
            None => Err(self.error("escape is not a valid code point")),
        }
    }

    fn escape_code_point(&mut self, c: char) -> Result<u32> {
        Ok(match c {
            'n' => 0x0A,
            'r' => 0x0D,
            't' => 0x09,
            'f' => 0x0C,
            'v' => 0x0B,
            '0' => 0x00,
            'b' => 0x08,
            'x' => self.parse_hex(2)?,
            'u' => self.parse_hex(4)?,
            'U' => self.parse_hex(8)?,
            other => u32::from(other),
        })
    }

    fn parse_hex(&mut self, digits: usize) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..digits {
            let Some(c) = self.bump() else {
                return Err(self.error("truncated hex escape"));
            };
            let digit = c
                .to_digit(16)
                .ok_or_else(|| self.error("invalid hex digit"))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn parse_class(&mut self) -> Result<RegexAst> {
        self.pos += 1; // '['
        let negated = if self.peek() == Some('^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let mut first = true;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated character class")),
                Some(']') if !first => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            first = false;
            let lo = match self.parse_class_entry(&mut ranges)? {
                Some(cp) => cp,
                None => continue,
            };
            if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                self.pos += 1;
                let hi = self
                    .parse_class_entry(&mut ranges)?
                    .ok_or_else(|| self.error("shorthand cannot end a range"))?;
                if lo > hi {
                    return Err(self.error("inverted range in character class"));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        if ranges.is_empty() {
            return Err(self.error("empty character class"));
        }
        Ok(RegexAst::Class { negated, ranges })
    }

    fn parse_class_entry(&mut self, ranges: &mut Vec<(u32, u32)>) -> Result<Option<u32>> {
        match self.bump() {
            None => Err(self.error("unterminated character class")),
            Some('\\') => {
                let Some(c) = self.bump() else {
                    return Err(self.error("trailing backslash in class"));
                };
                if let Some((negated, shorthand)) = Self::shorthand_ranges(c) {
                    if negated {
                        return Err(self.error("negated shorthand inside a class"));
                    }
                    ranges.extend(shorthand);
                    return Ok(None);
                }
                Ok(Some(self.escape_code_point(c)?))
            }
            Some(c) => Ok(Some(u32::from(c))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_and_class() {
        let ast = parse_regex("ab[0-9]").expect("valid");
        assert_eq!(
            ast,
            RegexAst::Concat(vec![
                RegexAst::Literal("ab".to_string()),
                RegexAst::Class {
                    negated: false,
                    ranges: vec![(48, 57)],
                },
            ])
        );
    }

    #[test]
    fn test_quantifiers() {
        let ast = parse_regex("a{2,4}").expect("valid");
        assert!(matches!(
            ast,
            RegexAst::Repeat { min: 2, max: Some(4), .. }
        ));
        assert!(parse_regex("a*?").is_ok());
    }

    #[test]
    fn test_anchors_ignored() {
        let fsm = RegexFsmBuilder::build("^ab$").expect("builds");
        assert!(fsm.accepts(b"ab"));
        assert!(!fsm.accepts(b"^ab$"));
    }

    #[test]
    fn test_lookaround_rejected() {
        assert!(parse_regex("a(?=b)").is_err());
    }

    #[test]
    fn test_fsm_semantics() {
        let fsm = RegexFsmBuilder::build("ab*|c").expect("builds");
        assert!(fsm.accepts(b"a"));
        assert!(fsm.accepts(b"abbb"));
        assert!(fsm.accepts(b"c"));
        assert!(!fsm.accepts(b"b"));
        assert!(!fsm.accepts(b"ac"));
    }

    #[test]
    fn test_bounded_repeat_fsm() {
        let fsm = RegexFsmBuilder::build("(ab){1,2}").expect("builds");
        assert!(!fsm.accepts(b""));
        assert!(fsm.accepts(b"ab"));
        assert!(fsm.accepts(b"abab"));
        assert!(!fsm.accepts(b"ababab"));
    }

    #[test]
    fn test_shorthand_classes() {
        let fsm = RegexFsmBuilder::build(r"\d\w\s").expect("builds");
        assert!(fsm.accepts(b"7a "));
        assert!(!fsm.accepts(b"a7 "));
    }

    #[test]
    fn test_regex_to_grammar() {
        let grammar = Grammar::from_regex("ab*").expect("compiles");
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_to_ebnf_shape() {
        let ebnf = regex_to_ebnf("a[0-9]{2}|bc").expect("valid");
        assert!(ebnf.contains('|'));
        assert!(ebnf.contains("[0-9]"));
    }

    #[test]
    fn test_format_table_patterns_parse() {
        // Representative patterns from the schema format table
        for pattern in [
            r"^(\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01]))$",
            r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$",
            r"^(/([\x00-\x2E]|[\x30-\x7D]|[\x7F-\U0010FFFF]|~[01])*)*$",
        ] {
            assert!(parse_regex(pattern).is_ok(), "pattern failed: {pattern}");
        }
    }
}
