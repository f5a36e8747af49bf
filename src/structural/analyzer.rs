//! Structural-tag analysis
//!
//! A single post-order walk that (a) marks which formats are unlimited,
//! (b) enforces the sequence and or shape rules, (c) copies enclosing tag
//! end markers into unlimited inner content as detected end strings, and
//! (d) checks that a tag with unlimited content has a usable end marker.

use crate::error::{MoldearError, Result};
use crate::structural::parser::MAX_RECURSION_DEPTH;
use crate::structural::{Format, StructuralTag, TagFormat};

fn err(message: impl Into<String>) -> MoldearError {
    MoldearError::InvalidStructuralTag(message.into())
}

/// Run the analyzer over `tag`, mutating analyzer-derived fields in place.
///
/// # Errors
///
/// Returns [`MoldearError::InvalidStructuralTag`] when a shape rule is
/// violated.
pub fn analyze(tag: &mut StructuralTag) -> Result<()> {
    visit(&mut tag.format, &[], 0)
}

/// `enclosing_ends` is the end-marker list of the nearest enclosing tag.
fn visit(format: &mut Format, enclosing_ends: &[String], depth: u32) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(err("format nesting exceeds the recursion limit"));
    }
    match format {
        Format::ConstString { .. }
        | Format::JsonSchema { .. }
        | Format::Grammar { .. }
        | Format::Regex { .. } => Ok(()),
        Format::AnyText {
            detected_end_strs, ..
        } => {
            *detected_end_strs = enclosing_ends.to_vec();
            Ok(())
        }
        Format::Sequence {
            elements,
            is_unlimited,
        } => {
            let n = elements.len();
            for (i, element) in elements.iter_mut().enumerate() {
                visit(element, enclosing_ends, depth + 1)?;
                if i + 1 < n && element.is_unlimited() && !element.has_excludes() {
                    return Err(err(format!(
                        "only the last element in a sequence can be unlimited \
                         (unless it carries excludes), but element {i} is unlimited"
                    )));
                }
            }
            *is_unlimited = elements.last().is_some_and(Format::is_unlimited);
            Ok(())
        }
        Format::Or {
            elements,
            is_unlimited,
        } => {
            let mut any_unlimited = false;
            let mut all_unlimited = true;
            for element in elements.iter_mut() {
                visit(element, enclosing_ends, depth + 1)?;
                let unlimited = element.is_unlimited();
                any_unlimited |= unlimited;
                all_unlimited &= unlimited;
            }
            if any_unlimited && !all_unlimited {
                return Err(err(
                    "an or format must have either all elements unlimited or all limited",
                ));
            }
            *is_unlimited = any_unlimited;
            Ok(())
        }
        Format::Tag(tag) => visit_tag(tag, depth),
        Format::TriggeredTags {
            tags,
            detected_end_strs,
            ..
        } => {
            for tag in tags.iter_mut() {
                visit_tag(tag, depth + 1)?;
            }
            *detected_end_strs = enclosing_ends.to_vec();
            Ok(())
        }
        Format::TagsWithSeparator {
            tags,
            detected_end_strs,
            ..
        } => {
            for tag in tags.iter_mut() {
                visit_tag(tag, depth + 1)?;
            }
            *detected_end_strs = enclosing_ends.to_vec();
            Ok(())
        }
    }
}

fn visit_tag(tag: &mut TagFormat, depth: u32) -> Result<()> {
    // The tag's own end markers become the nearest enclosing ends for its
    // content.
    let ends = tag.end.clone();
    visit(&mut tag.content, &ends, depth + 1)?;
    if tag.content.is_unlimited() {
        if !tag.end.iter().any(|e| !e.is_empty()) {
            return Err(err(
                "a tag with unlimited content needs at least one non-empty end string",
            ));
        }
        // The markers moved into the content's detected end strings.
        tag.end.clear();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structural::parser::parse_structural_tag;
    use serde_json::json;

    fn analyzed(v: serde_json::Value) -> Result<StructuralTag> {
        let mut tag = parse_structural_tag(&v)?;
        analyze(&mut tag)?;
        Ok(tag)
    }

    #[test]
    fn test_any_text_inherits_tag_ends() {
        let tag = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "tag", "begin": "<think>",
                "content": {"type": "any_text"}, "end": "</think>"}
        }))
        .expect("valid");
        let Format::Tag(tag_format) = tag.format else { panic!("tag") };
        // End markers moved into the content
        assert!(tag_format.end.is_empty());
        let Format::AnyText { detected_end_strs, .. } = *tag_format.content else {
            panic!("any_text");
        };
        assert_eq!(detected_end_strs, vec!["</think>"]);
    }

    #[test]
    fn test_unlimited_non_tail_rejected() {
        let result = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "sequence", "elements": [
                {"type": "any_text"},
                {"type": "const_string", "value": "x"}
            ]}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_unlimited_with_excludes_allowed_non_tail() {
        let tag = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "sequence", "elements": [
                {"type": "any_text", "excludes": ["</stop>"]},
                {"type": "const_string", "value": "x"}
            ]}
        }))
        .expect("excludes act as a stop condition");
        let Format::Sequence { is_unlimited, .. } = tag.format else {
            panic!("sequence");
        };
        // The tail is a const string, so the sequence itself is limited
        assert!(!is_unlimited);
    }

    #[test]
    fn test_sequence_unlimited_flag_propagates() {
        let tag = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "sequence", "elements": [
                {"type": "const_string", "value": "x"},
                {"type": "any_text"}
            ]}
        }))
        .expect("valid");
        assert!(tag.format.is_unlimited());
    }

    #[test]
    fn test_or_mixed_limitedness_rejected() {
        let result = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "or", "elements": [
                {"type": "any_text"},
                {"type": "const_string", "value": "x"}
            ]}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_unlimited_tag_content_needs_end() {
        let result = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "tag", "begin": "<t>",
                "content": {"type": "any_text"}, "end": [""]}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_triggered_tags_detect_enclosing_ends() {
        let tag = analyzed(json!({
            "type": "structural_tag",
            "format": {"type": "tag", "begin": "<outer>",
                "content": {"type": "triggered_tags",
                    "triggers": ["<f"],
                    "tags": [{"begin": "<f>", "content": {"type": "const_string", "value": "x"},
                              "end": "</f>"}]},
                "end": "</outer>"}
        }))
        .expect("valid");
        let Format::Tag(outer) = tag.format else { panic!("tag") };
        let Format::TriggeredTags { detected_end_strs, .. } = *outer.content else {
            panic!("triggered_tags");
        };
        assert_eq!(detected_end_strs, vec!["</outer>"]);
    }
}
