//! EBNF text front end
//!
//! Parses the grammar dialect that the JSON-schema converter emits and that
//! users can supply directly: `name ::= body` definitions with string
//! literals, character classes, postfix `*` `+` `?` `{m,n}` operators,
//! alternation, parenthesized groups, a trailing look-ahead assertion
//! `(= elements)`, and the `TagDispatch(...)` macro form. The inverse
//! printer renders a grammar back to the same dialect.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use once_cell::sync::Lazy;

use crate::error::{MoldearError, Result};
use crate::grammar::{ExprId, Grammar, GrammarBuilder, GrammarExpr, RuleId, TagDispatch};

/// The builtin JSON grammar text, compiled by
/// [`Grammar::builtin_json_grammar`].
pub static BUILTIN_JSON_GRAMMAR: Lazy<String> = Lazy::new(|| {
    r#"
root ::= ws basic_any ws
basic_any ::= basic_number | basic_string | basic_boolean | basic_null | basic_array | basic_object
basic_number ::= "-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?
basic_string ::= "\"" basic_string_sub
basic_string_sub ::= "\"" | [^"\\\r\n] basic_string_sub | "\\" basic_escape basic_string_sub
basic_escape ::= ["\\/bfnrt] | "u" [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9]
basic_boolean ::= "true" | "false"
basic_null ::= "null"
basic_array ::= "[" ws "]" | "[" ws basic_any (ws "," ws basic_any)* ws "]"
basic_object ::= "{" ws "}" | "{" ws basic_string ws ":" ws basic_any (ws "," ws basic_string ws ":" ws basic_any)* ws "}"
ws ::= [ \n\t]*
"#
    .to_string()
});

impl Grammar {
    /// Parse EBNF text into a grammar rooted at `root_rule_name`.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidGrammar`] on syntax errors, undefined
    /// rule references, or a missing root rule.
    pub fn from_ebnf(text: &str, root_rule_name: &str) -> Result<Grammar> {
        let mut parser = EbnfParser::new(text);
        parser.parse_all()?;
        let root = parser
            .rule_ids
            .get(root_rule_name)
            .copied()
            .ok_or_else(|| {
                MoldearError::InvalidGrammar(format!("root rule `{root_rule_name}` not defined"))
            })?;
        for (name, &id) in &parser.rule_ids {
            if !parser.defined[id] {
                return Err(MoldearError::InvalidGrammar(format!(
                    "rule `{name}` referenced but never defined"
                )));
            }
        }
        let grammar = parser.builder.build(root);
        Ok(crate::grammar::functor::normalize(&grammar))
    }

    /// The builtin JSON grammar.
    ///
    /// # Panics
    ///
    /// The builtin text is a compile-time constant; parsing it never fails.
    #[must_use]
    pub fn builtin_json_grammar() -> Grammar {
        Grammar::from_ebnf(&BUILTIN_JSON_GRAMMAR, "root").expect("builtin grammar parses")
    }
}

struct EbnfParser<'a> {
    input: &'a [u8],
    pos: usize,
    builder: GrammarBuilder,
    rule_ids: HashMap<String, RuleId>,
    defined: Vec<bool>,
    cur_rule_name: String,
}

impl<'a> EbnfParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            input: text.as_bytes(),
            pos: 0,
            builder: GrammarBuilder::new(),
            rule_ids: HashMap::new(),
            defined: Vec::new(),
            cur_rule_name: String::new(),
        }
    }

    fn error(&self, message: impl Into<String>) -> MoldearError {
        let line = self.input[..self.pos.min(self.input.len())]
            .iter()
            .filter(|&&b| b == b'\n')
            .count()
            + 1;
        MoldearError::InvalidGrammar(format!("{} (line {line})", message.into()))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws_and_comments(&mut self, skip_newlines: bool) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' => {
                    self.pos += 1;
                }
                b'\n' if skip_newlines => {
                    self.pos += 1;
                }
                b'#' => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn parse_all(&mut self) -> Result<()> {
        loop {
            self.skip_ws_and_comments(true);
            if self.peek().is_none() {
                return Ok(());
            }
            self.parse_rule_definition()?;
        }
    }

    fn rule_id_for(&mut self, name: &str) -> RuleId {
        if let Some(&id) = self.rule_ids.get(name) {
            return id;
        }
        let id = self.builder.add_empty_rule(name);
        self.rule_ids.insert(name.to_string(), id);
        self.defined.resize(self.builder.num_rules(), false);
        id
    }

    fn parse_rule_name(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
            _ => return Err(self.error("expected rule name")),
        }
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.input[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.error(format!("expected `{token}`")))
        }
    }

    fn parse_rule_definition(&mut self) -> Result<()> {
        let name = self.parse_rule_name()?;
        self.skip_ws_and_comments(false);
        self.expect("::=")?;
        let rule_id = self.rule_id_for(&name);
        if self.defined[rule_id] {
            return Err(self.error(format!("rule `{name}` defined twice")));
        }
        self.defined[rule_id] = true;
        self.cur_rule_name.clone_from(&name);
        let body = self.parse_alternation()?;
        self.builder.update_rule_body(rule_id, body);
        self.skip_ws_and_comments(false);
        // Optional trailing look-ahead assertion: (= elements)
        if self.input[self.pos..].starts_with(b"(=") {
            self.pos += 2;
            let mut elements = Vec::new();
            loop {
                self.skip_ws_and_comments(true);
                if self.peek() == Some(b')') {
                    self.pos += 1;
                    break;
                }
                elements.push(self.parse_element()?);
            }
            let lookahead = self.builder.add_sequence(elements);
            self.builder.update_lookahead_assertion(rule_id, Some(lookahead));
        }
        Ok(())
    }

    fn at_rule_boundary(&self) -> bool {
        // A new definition starts where `name ::=` follows.
        let mut i = self.pos;
        match self.input.get(i) {
            Some(&b) if b.is_ascii_alphabetic() || b == b'_' => {}
            _ => return false,
        }
        while let Some(&b) = self.input.get(i) {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                i += 1;
            } else {
                break;
            }
        }
        while let Some(&b) = self.input.get(i) {
            if b == b' ' || b == b'\t' {
                i += 1;
            } else {
                break;
            }
        }
        self.input[i..].starts_with(b"::=")
    }

    fn at_sequence_end(&self) -> bool {
        matches!(self.peek(), None | Some(b')') | Some(b'|') | Some(b','))
            || self.input[self.pos..].starts_with(b"(=")
            || self.at_rule_boundary()
    }

    fn parse_alternation(&mut self) -> Result<ExprId> {
        let mut choices = vec![self.parse_sequence()?];
        loop {
            self.skip_ws_and_comments(true);
            if self.peek() == Some(b'|') {
                self.pos += 1;
                choices.push(self.parse_sequence()?);
            } else {
                break;
            }
        }
        if choices.len() == 1 {
            Ok(choices.pop().expect("one choice"))
        } else {
            Ok(self.builder.add_choices(choices))
        }
    }

    fn parse_sequence(&mut self) -> Result<ExprId> {
        let mut elements = Vec::new();
        loop {
            self.skip_ws_and_comments(true);
            if self.at_sequence_end() {
                break;
            }
            elements.push(self.parse_element()?);
        }
        if elements.is_empty() {
            Ok(self.builder.add_empty_str())
        } else if elements.len() == 1 {
            Ok(elements.pop().expect("one element"))
        } else {
            Ok(self.builder.add_sequence(elements))
        }
    }

    fn parse_element(&mut self) -> Result<ExprId> {
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_primary(&mut self) -> Result<ExprId> {
        self.skip_ws_and_comments(true);
        match self.peek() {
            Some(b'"') => self.parse_string_literal(),
            Some(b'[') => self.parse_character_class(),
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_alternation()?;
                self.skip_ws_and_comments(true);
                self.expect(")")?;
                Ok(inner)
            }
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => {
                let name = self.parse_rule_name()?;
                if name == "TagDispatch" {
                    return self.parse_tag_dispatch();
                }
                let rule_id = self.rule_id_for(&name);
                Ok(self.builder.add_rule_ref(rule_id))
            }
            _ => Err(self.error("expected element")),
        }
    }

    /// Apply postfix `*` `+` `?` `{m,n}` operators.
    fn parse_postfix(&mut self, mut expr: ExprId) -> Result<ExprId> {
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    expr = self.make_star(expr);
                }
                Some(b'+') => {
                    self.pos += 1;
                    let star = self.make_star(expr);
                    expr = self.builder.add_sequence(vec![expr, star]);
                }
                Some(b'?') => {
                    self.pos += 1;
                    let empty = self.builder.add_empty_str();
                    expr = self.builder.add_choices(vec![empty, expr]);
                }
                Some(b'{') => {
                    self.pos += 1;
                    let (min, max) = self.parse_repeat_bounds()?;
                    let hint = self.cur_rule_name.clone();
                    let body = self.wrap_as_rule_body(expr);
                    let rule = self.builder.add_rule_with_hint(&hint, body);
                    expr = self.builder.add_repeat(rule, min, max);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn make_star(&mut self, expr: ExprId) -> ExprId {
        // A starred character class stays atomic; anything else becomes a
        // fresh right-recursive rule.
        if let GrammarExpr::CharacterClass { negated, ranges } = self.builder.expr(expr).clone() {
            return self.builder.add_character_class_star(ranges, negated);
        }
        let hint = self.cur_rule_name.clone();
        let rule = self.builder.add_empty_rule_with_hint(&hint);
        let self_ref = self.builder.add_rule_ref(rule);
        let seq = self.builder.add_sequence(vec![expr, self_ref]);
        let empty = self.builder.add_empty_str();
        let body = self.builder.add_choices(vec![empty, seq]);
        self.builder.update_rule_body(rule, body);
        self.builder.add_rule_ref(rule)
    }

    fn wrap_as_rule_body(&mut self, expr: ExprId) -> ExprId {
        let seq = self.builder.add_sequence(vec![expr]);
        self.builder.add_choices(vec![seq])
    }

    fn parse_repeat_bounds(&mut self) -> Result<(u32, u32)> {
        let min = self.parse_number()?;
        self.skip_ws_and_comments(false);
        let max = if self.peek() == Some(b',') {
            self.pos += 1;
            self.skip_ws_and_comments(false);
            if self.peek() == Some(b'}') {
                u32::MAX
            } else {
                self.parse_number()?
            }
        } else {
            min
        };
        self.skip_ws_and_comments(false);
        self.expect("}")?;
        if max != u32::MAX && min > max {
            return Err(self.error(format!("repeat bounds {{{min},{max}}} are inverted")));
        }
        Ok((min, max))
    }

    fn parse_number(&mut self) -> Result<u32> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected number"));
        }
        String::from_utf8_lossy(&self.input[start..self.pos])
            .parse()
            .map_err(|_| self.error("number out of range"))
    }

    fn parse_string_literal(&mut self) -> Result<ExprId> {
        self.expect("\"")?;
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string literal")),
                Some(b'"') => break,
                Some(b'\\') => {
                    let cp = self.parse_escape()?;
                    push_utf8(&mut bytes, cp);
                }
                Some(b) => bytes.push(b),
            }
        }
        if bytes.is_empty() {
            Ok(self.builder.add_empty_str())
        } else {
            Ok(self.builder.add_byte_string(&bytes))
        }
    }

    fn parse_escape(&mut self) -> Result<u32> {
        let Some(b) = self.bump() else {
            return Err(self.error("unterminated escape"));
        };
        let cp = match b {
            b'n' => 0x0A,
            b'r' => 0x0D,
            b't' => 0x09,
            b'0' => 0x00,
            b'f' => 0x0C,
            b'b' => 0x08,
            b'x' => self.parse_hex(2)?,
            b'u' => self.parse_hex(4)?,
            b'U' => self.parse_hex(8)?,
            other => u32::from(other),
        };
        Ok(cp)
    }

    fn parse_hex(&mut self, digits: usize) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..digits {
            let Some(b) = self.bump() else {
                return Err(self.error("truncated hex escape"));
            };
            let digit = (b as char)
                .to_digit(16)
                .ok_or_else(|| self.error("invalid hex digit"))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn parse_character_class(&mut self) -> Result<ExprId> {
        self.expect("[")?;
        let negated = if self.peek() == Some(b'^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated character class")),
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            let lo = self.parse_class_entry(&mut ranges)?;
            let Some(lo) = lo else { continue };
            if self.peek() == Some(b'-') && self.input.get(self.pos + 1) != Some(&b']') {
                self.pos += 1;
                let hi = self
                    .parse_class_entry(&mut ranges)?
                    .ok_or_else(|| self.error("shorthand cannot end a range"))?;
                if lo > hi {
                    return Err(self.error("inverted character range"));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        if ranges.is_empty() {
            // `[^]` means any character
            if negated {
                return Ok(self.builder.add_character_class(vec![(0, 0x10_FFFF)], false));
            }
            return Err(self.error("empty character class"));
        }
        Ok(self.builder.add_character_class(ranges, negated))
    }

    /// One class entry. Shorthand escapes (`\d`, `\w`, `\s`) append their
    /// ranges directly and return `None`.
    fn parse_class_entry(&mut self, ranges: &mut Vec<(u32, u32)>) -> Result<Option<u32>> {
        match self.peek() {
            Some(b'\\') => {
                self.pos += 1;
                match self.peek() {
                    Some(b'd') => {
                        self.pos += 1;
                        ranges.push((u32::from(b'0'), u32::from(b'9')));
                        Ok(None)
                    }
                    Some(b'w') => {
                        self.pos += 1;
                        ranges.extend([
                            (u32::from(b'0'), u32::from(b'9')),
                            (u32::from(b'A'), u32::from(b'Z')),
                            (u32::from(b'_'), u32::from(b'_')),
                            (u32::from(b'a'), u32::from(b'z')),
                        ]);
                        Ok(None)
                    }
                    Some(b's') => {
                        self.pos += 1;
                        ranges.extend([(0x09, 0x0D), (0x20, 0x20)]);
                        Ok(None)
                    }
                    _ => Ok(Some(self.parse_escape()?)),
                }
            }
            Some(_) => {
                let cp = self.parse_utf8_char()?;
                Ok(Some(cp))
            }
            None => Err(self.error("unterminated character class")),
        }
    }

    fn parse_utf8_char(&mut self) -> Result<u32> {
        let rest = &self.input[self.pos..];
        let s = std::str::from_utf8(&rest[..rest.len().min(4)])
            .or_else(|e| std::str::from_utf8(&rest[..e.valid_up_to()]))
            .map_err(|_| self.error("invalid UTF-8 in character class"))?;
        let c = s
            .chars()
            .next()
            .ok_or_else(|| self.error("unterminated character class"))?;
        self.pos += c.len_utf8();
        Ok(u32::from(c))
    }

    fn parse_tag_dispatch(&mut self) -> Result<ExprId> {
        self.skip_ws_and_comments(true);
        self.expect("(")?;
        let mut dispatch = TagDispatch {
            tag_rule_pairs: Vec::new(),
            stop_eos: true,
            stop_strs: Vec::new(),
            loop_after_dispatch: true,
            excludes: Vec::new(),
        };
        loop {
            self.skip_ws_and_comments(true);
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'(') => {
                    // ("trigger", rule_name) pair
                    self.pos += 1;
                    self.skip_ws_and_comments(true);
                    let trigger = self.parse_quoted_string()?;
                    self.skip_ws_and_comments(true);
                    self.expect(",")?;
                    self.skip_ws_and_comments(true);
                    let rule_name = self.parse_rule_name()?;
                    self.skip_ws_and_comments(true);
                    self.expect(")")?;
                    let rule_id = self.rule_id_for(&rule_name);
                    dispatch.tag_rule_pairs.push((trigger, rule_id));
                }
                Some(b) if b.is_ascii_alphabetic() => {
                    let key = self.parse_rule_name()?;
                    self.skip_ws_and_comments(true);
                    self.expect("=")?;
                    self.skip_ws_and_comments(true);
                    match key.as_str() {
                        "stop_eos" => dispatch.stop_eos = self.parse_bool()?,
                        "loop_after_dispatch" => dispatch.loop_after_dispatch = self.parse_bool()?,
                        "stop_str" => dispatch.stop_strs = self.parse_string_tuple()?,
                        "excludes" => dispatch.excludes = self.parse_string_tuple()?,
                        other => {
                            return Err(self.error(format!("unknown TagDispatch option `{other}`")))
                        }
                    }
                }
                _ => return Err(self.error("malformed TagDispatch")),
            }
        }
        Ok(self.builder.add_tag_dispatch(dispatch))
    }

    fn parse_bool(&mut self) -> Result<bool> {
        if self.input[self.pos..].starts_with(b"true") {
            self.pos += 4;
            Ok(true)
        } else if self.input[self.pos..].starts_with(b"false") {
            self.pos += 5;
            Ok(false)
        } else {
            Err(self.error("expected boolean"))
        }
    }

    fn parse_quoted_string(&mut self) -> Result<String> {
        self.expect("\"")?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => {
                    let cp = self.parse_escape()?;
                    push_utf8(&mut out, cp);
                }
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| self.error("invalid UTF-8 in string"))
    }

    fn parse_string_tuple(&mut self) -> Result<Vec<String>> {
        self.expect("(")?;
        let mut out = Vec::new();
        loop {
            self.skip_ws_and_comments(true);
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'"') => out.push(self.parse_quoted_string()?),
                _ => return Err(self.error("malformed string tuple")),
            }
        }
        Ok(out)
    }
}

fn push_utf8(bytes: &mut Vec<u8>, cp: u32) {
    if let Some(c) = char::from_u32(cp) {
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    } else {
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(cp as u8);
    }
}

// ==================== Printer ====================

pub(crate) fn escape_literal_bytes(bytes: &[u8], out: &mut String) {
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(b as char),
            other => {
                let _ = write!(out, "\\x{other:02x}");
            }
        }
    }
}

pub(crate) fn escape_class_char(cp: u32, out: &mut String) {
    match cp {
        0x0A => out.push_str("\\n"),
        0x0D => out.push_str("\\r"),
        0x09 => out.push_str("\\t"),
        c if c == u32::from(b']') || c == u32::from(b'\\') || c == u32::from(b'-') || c == u32::from(b'^') => {
            out.push('\\');
            out.push(char::from_u32(c).expect("ascii"));
        }
        0x20..=0x7E => out.push(char::from_u32(cp).expect("printable ascii")),
        c if c <= 0xFF => {
            let _ = write!(out, "\\x{c:02x}");
        }
        c if c <= 0xFFFF => {
            let _ = write!(out, "\\u{c:04x}");
        }
        c => {
            let _ = write!(out, "\\U{c:08x}");
        }
    }
}

impl Grammar {
    fn write_char_class(
        out: &mut String,
        negated: bool,
        ranges: &[(u32, u32)],
        star: bool,
    ) {
        out.push('[');
        if negated {
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
        if star {
            out.push('*');
        }
    }

    fn write_expr(&self, id: ExprId, out: &mut String, parenthesize: bool) {
        match self.expr(id) {
            GrammarExpr::ByteString(bytes) => {
                out.push('"');
                escape_literal_bytes(bytes, out);
                out.push('"');
            }
            GrammarExpr::CharacterClass { negated, ranges } => {
                Self::write_char_class(out, *negated, ranges, false);
            }
            GrammarExpr::CharacterClassStar { negated, ranges } => {
                Self::write_char_class(out, *negated, ranges, true);
            }
            GrammarExpr::RuleRef(rule_id) => out.push_str(&self.rule(*rule_id).name),
            GrammarExpr::Repeat { rule, min, max } => {
                out.push_str(&self.rule(*rule).name);
                if *max == u32::MAX {
                    let _ = write!(out, "{{{min},}}");
                } else {
                    let _ = write!(out, "{{{min},{max}}}");
                }
            }
            GrammarExpr::EmptyStr => out.push_str("\"\""),
            GrammarExpr::Sequence(elements) => {
                if parenthesize {
                    out.push('(');
                }
                for (i, &e) in elements.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.write_expr(e, out, true);
                }
                if parenthesize {
                    out.push(')');
                }
            }
            GrammarExpr::Choices(choices) => {
                if parenthesize {
                    out.push('(');
                }
                for (i, &c) in choices.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" | ");
                    }
                    self.write_expr(c, out, true);
                }
                if parenthesize {
                    out.push(')');
                }
            }
            GrammarExpr::TagDispatch(td) => {
                out.push_str("TagDispatch(");
                for (trigger, rule_id) in &td.tag_rule_pairs {
                    out.push_str("(\"");
                    escape_literal_bytes(trigger.as_bytes(), out);
                    let _ = write!(out, "\", {}), ", self.rule(*rule_id).name);
                }
                let _ = write!(out, "stop_eos={}, stop_str=(", td.stop_eos);
                for (i, s) in td.stop_strs.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push('"');
                    escape_literal_bytes(s.as_bytes(), out);
                    out.push('"');
                }
                let _ = write!(out, "), loop_after_dispatch={}, excludes=(", td.loop_after_dispatch);
                for (i, s) in td.excludes.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push('"');
                    escape_literal_bytes(s.as_bytes(), out);
                    out.push('"');
                }
                out.push_str("))");
            }
        }
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Root rule first, then the rest in id order.
        let mut order: Vec<RuleId> = (0..self.num_rules()).collect();
        order.retain(|&r| r != self.root_rule_id);
        order.insert(0, self.root_rule_id);
        for rule_id in order {
            let rule = self.rule(rule_id);
            let mut body = String::new();
            self.write_expr(rule.body, &mut body, false);
            write!(f, "{} ::= {}", rule.name, body)?;
            if let Some(lookahead) = rule.lookahead {
                let mut la = String::new();
                self.write_expr(lookahead, &mut la, false);
                write!(f, " (= {la})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_rule() {
        let grammar = Grammar::from_ebnf(r#"root ::= "true" | "false""#, "root")
            .expect("valid grammar");
        assert!(grammar.validate().is_ok());
        assert_eq!(grammar.root_rule().name, "root");
    }

    #[test]
    fn test_parse_char_class_and_star() {
        let grammar = Grammar::from_ebnf(r"root ::= [a-z]* [0-9]+", "root").expect("valid");
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_parse_repeat_bounds() {
        let grammar = Grammar::from_ebnf(r#"root ::= ("ab"){2,4}"#, "root").expect("valid");
        let has_repeat = (0..grammar.num_exprs())
            .any(|i| matches!(grammar.expr(i), GrammarExpr::Repeat { min: 2, max: 4, .. }));
        assert!(has_repeat);
    }

    #[test]
    fn test_undefined_rule_reference_fails() {
        let err = Grammar::from_ebnf("root ::= missing", "root").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_missing_root_fails() {
        assert!(Grammar::from_ebnf(r#"a ::= "x""#, "root").is_err());
    }

    #[test]
    fn test_lookahead_assertion() {
        let grammar = Grammar::from_ebnf(
            "root ::= a a\na ::= [0-9] (= [,:])\n",
            "root",
        )
        .expect("valid");
        let a = (0..grammar.num_rules())
            .find(|&i| grammar.rule(i).name == "a")
            .expect("rule a exists");
        assert!(grammar.rule(a).lookahead.is_some());
    }

    #[test]
    fn test_tag_dispatch_syntax() {
        let text = r#"
root ::= TagDispatch(("<a>", tag_a), stop_eos=true, stop_str=(), loop_after_dispatch=true, excludes=())
tag_a ::= "x"
"#;
        let grammar = Grammar::from_ebnf(text, "root").expect("valid");
        let root_body = grammar.expr(grammar.root_rule().body);
        assert!(matches!(root_body, GrammarExpr::TagDispatch(_)));
    }

    #[test]
    fn test_builtin_json_grammar_parses() {
        let grammar = Grammar::builtin_json_grammar();
        assert!(grammar.validate().is_ok());
        assert!(grammar.num_rules() >= 9);
    }

    #[test]
    fn test_print_reparse_roundtrip() {
        let text = r#"root ::= "a" [0-9] b
b ::= "c" | """#;
        let grammar = Grammar::from_ebnf(text, "root").expect("valid");
        let printed = grammar.to_string();
        let reparsed = Grammar::from_ebnf(&printed, "root").expect("printed text parses");
        assert_eq!(grammar.num_rules(), reparsed.num_rules());
        assert_eq!(printed, reparsed.to_string());
    }
}
