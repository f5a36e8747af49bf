//! Structural-tag front end
//!
//! The compositional JSON format DSL: const strings, JSON-schema
//! fragments, regexes with exclusions, ordered alternation/concatenation,
//! tagged regions, trigger dispatch and separator-joined tags. Parsing
//! produces a [`Format`] tree, the analyzer propagates unlimited-content
//! flags and detected end markers, and the converter lowers the tree into
//! grammar rules.

use serde_json::Value;

use crate::error::{MoldearError, Result};
use crate::grammar::Grammar;

pub mod analyzer;
pub mod converter;
pub mod fingerprint;
pub mod parser;

/// Output style of an embedded JSON schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaStyle {
    /// Plain JSON
    #[default]
    Json,
    /// Qwen-XML tool calling
    QwenXml,
}

/// A tagged region: literal begin, content, then exactly one of the end
/// strings.
#[derive(Debug, Clone, PartialEq)]
pub struct TagFormat {
    /// Literal begin marker
    pub begin: String,
    /// Content format
    pub content: Box<Format>,
    /// End marker alternatives; cleared by the analyzer when the content
    /// is unlimited (the markers move into the content's detected ends)
    pub end: Vec<String>,
}

/// One node of the format tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Format {
    /// Exact literal
    ConstString {
        /// The literal
        value: String,
    },
    /// Schema-conformant value
    JsonSchema {
        /// The embedded schema
        schema: Value,
        /// Output style
        style: SchemaStyle,
    },
    /// User-supplied EBNF fragment
    Grammar {
        /// The grammar text
        grammar: String,
    },
    /// Pattern language minus strings containing any exclude
    Regex {
        /// The pattern
        pattern: String,
        /// Forbidden infixes
        excludes: Vec<String>,
    },
    /// Any byte string, minus the excludes
    AnyText {
        /// Forbidden infixes
        excludes: Vec<String>,
        /// End markers propagated in by the analyzer
        detected_end_strs: Vec<String>,
    },
    /// Ordered concatenation
    Sequence {
        /// The elements
        elements: Vec<Format>,
        /// Whether the tail element is unlimited (analyzer-derived)
        is_unlimited: bool,
    },
    /// Unordered alternation
    Or {
        /// The alternatives
        elements: Vec<Format>,
        /// Whether the alternatives are unlimited (analyzer-derived)
        is_unlimited: bool,
    },
    /// A tagged region
    Tag(TagFormat),
    /// Free text until a trigger prefix, then dispatch to the matching tag
    TriggeredTags {
        /// Trigger prefixes; each must be a prefix of some tag's begin
        triggers: Vec<String>,
        /// The dispatchable tags
        tags: Vec<TagFormat>,
        /// Forbidden infixes in the free text
        excludes: Vec<String>,
        /// Require at least one dispatched tag
        at_least_one: bool,
        /// Stop after the first dispatched tag
        stop_after_first: bool,
        /// End markers propagated in by the analyzer
        detected_end_strs: Vec<String>,
    },
    /// Zero/one/more tags joined by a separator
    TagsWithSeparator {
        /// The tags
        tags: Vec<TagFormat>,
        /// The joining literal
        separator: String,
        /// Require at least one tag
        at_least_one: bool,
        /// Stop after the first tag
        stop_after_first: bool,
        /// End markers propagated in by the analyzer
        detected_end_strs: Vec<String>,
    },
}

/// The top-level structural tag.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralTag {
    /// The root format
    pub format: Format,
}

impl Format {
    /// Whether this format can consume unbounded output (analyzer-derived
    /// for the combinators).
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        match self {
            Format::AnyText { .. }
            | Format::TriggeredTags { .. }
            | Format::TagsWithSeparator { .. } => true,
            Format::Sequence { is_unlimited, .. } | Format::Or { is_unlimited, .. } => {
                *is_unlimited
            }
            _ => false,
        }
    }

    /// Whether this format carries a non-empty exclude set. An unlimited
    /// format with excludes is allowed in non-tail sequence positions: the
    /// excludes act as a stop condition.
    #[must_use]
    pub fn has_excludes(&self) -> bool {
        match self {
            Format::AnyText { excludes, .. } | Format::TriggeredTags { excludes, .. } => {
                !excludes.is_empty()
            }
            _ => false,
        }
    }
}

/// Convert a structural-tag JSON string to a normalized grammar.
///
/// # Errors
///
/// Returns [`MoldearError::InvalidJson`] on malformed JSON and
/// [`MoldearError::InvalidStructuralTag`] on DSL shape or analyzer
/// violations.
pub fn structural_tag_to_grammar(structural_tag_json: &str) -> Result<Grammar> {
    let value: Value = serde_json::from_str(structural_tag_json)
        .map_err(|e| MoldearError::InvalidJson(e.to_string()))?;
    let mut tag = parser::parse_structural_tag(&value)?;
    analyzer::analyze(&mut tag)?;
    let grammar = converter::convert(&tag)?;
    Ok(crate::grammar::functor::normalize(&grammar))
}

impl Grammar {
    /// Compile a structural tag into a normalized grammar.
    ///
    /// # Errors
    ///
    /// See [`structural_tag_to_grammar`].
    pub fn from_structural_tag(structural_tag_json: &str) -> Result<Grammar> {
        structural_tag_to_grammar(structural_tag_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_to_end_triggered_tags() {
        let grammar = structural_tag_to_grammar(
            r#"{"type": "structural_tag", "format": {
                "type": "triggered_tags",
                "triggers": ["<fn="],
                "tags": [{"begin": "<fn=a>", "content": {"type": "const_string", "value": "x"}, "end": "</fn>"}]
            }}"#,
        )
        .expect("compiles");
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_invalid_json_reported() {
        let err = structural_tag_to_grammar("{oops").unwrap_err();
        assert!(matches!(err, MoldearError::InvalidJson(_)));
    }
}
