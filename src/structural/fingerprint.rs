//! Format fingerprinting for lowering deduplication
//!
//! Two structurally identical format subtrees must share one grammar rule.
//! The fingerprint is a canonical serialization of the format including the
//! analyzer-derived fields; the converter buckets by an FNV-1a hash of it
//! and confirms with the exact string.

use std::fmt::Write as _;

use crate::structural::{Format, SchemaStyle, TagFormat};
use crate::support::hashing::fnv1a_hash;

fn write_string_list(out: &mut String, values: &[String]) {
    out.push('[');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{v:?}");
    }
    out.push(']');
}

fn write_tag(out: &mut String, tag: &TagFormat) {
    let _ = write!(out, "tag(begin={:?},content=", tag.begin);
    write_format(out, &tag.content);
    out.push_str(",end=");
    write_string_list(out, &tag.end);
    out.push(')');
}

fn write_format(out: &mut String, format: &Format) {
    match format {
        Format::ConstString { value } => {
            let _ = write!(out, "const_string({value:?})");
        }
        Format::JsonSchema { schema, style } => {
            let style = match style {
                SchemaStyle::Json => "json",
                SchemaStyle::QwenXml => "qwen_xml",
            };
            // The canonical schema serialization from the schema cache key
            let canonical = crate::schema::parser::compute_cache_key(schema);
            let _ = write!(out, "json_schema(style={style},schema={canonical})");
        }
        Format::Grammar { grammar } => {
            let _ = write!(out, "grammar({grammar:?})");
        }
        Format::Regex { pattern, excludes } => {
            let _ = write!(out, "regex(pattern={pattern:?},excludes=");
            write_string_list(out, excludes);
            out.push(')');
        }
        Format::AnyText {
            excludes,
            detected_end_strs,
        } => {
            out.push_str("any_text(excludes=");
            write_string_list(out, excludes);
            out.push_str(",detected=");
            write_string_list(out, detected_end_strs);
            out.push(')');
        }
        Format::Sequence {
            elements,
            is_unlimited,
        } => {
            let _ = write!(out, "sequence(unlimited={is_unlimited},elements=[");
            for (i, e) in elements.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_format(out, e);
            }
            out.push_str("])");
        }
        Format::Or {
            elements,
            is_unlimited,
        } => {
            let _ = write!(out, "or(unlimited={is_unlimited},elements=[");
            for (i, e) in elements.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_format(out, e);
            }
            out.push_str("])");
        }
        Format::Tag(tag) => write_tag(out, tag),
        Format::TriggeredTags {
            triggers,
            tags,
            excludes,
            at_least_one,
            stop_after_first,
            detected_end_strs,
        } => {
            out.push_str("triggered_tags(triggers=");
            write_string_list(out, triggers);
            out.push_str(",tags=[");
            for (i, t) in tags.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_tag(out, t);
            }
            out.push_str("],excludes=");
            write_string_list(out, excludes);
            let _ = write!(
                out,
                ",at_least_one={at_least_one},stop_after_first={stop_after_first},detected="
            );
            write_string_list(out, detected_end_strs);
            out.push(')');
        }
        Format::TagsWithSeparator {
            tags,
            separator,
            at_least_one,
            stop_after_first,
            detected_end_strs,
        } => {
            out.push_str("tags_with_separator(tags=[");
            for (i, t) in tags.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_tag(out, t);
            }
            let _ = write!(
                out,
                "],separator={separator:?},at_least_one={at_least_one},stop_after_first={stop_after_first},detected="
            );
            write_string_list(out, detected_end_strs);
            out.push(')');
        }
    }
}

/// The canonical fingerprint string of a format.
#[must_use]
pub fn compute_fingerprint(format: &Format) -> String {
    let mut out = String::new();
    write_format(&mut out, format);
    out
}

/// FNV-1a hash of the fingerprint, used for bucketing.
#[must_use]
pub fn fingerprint_hash(fingerprint: &str) -> u64 {
    fnv1a_hash(fingerprint.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_formats_same_fingerprint() {
        let a = Format::ConstString {
            value: "x".to_string(),
        };
        let b = Format::ConstString {
            value: "x".to_string(),
        };
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn test_analyzer_fields_distinguish() {
        let plain = Format::AnyText {
            excludes: vec![],
            detected_end_strs: vec![],
        };
        let with_ends = Format::AnyText {
            excludes: vec![],
            detected_end_strs: vec!["</t>".to_string()],
        };
        assert_ne!(compute_fingerprint(&plain), compute_fingerprint(&with_ends));
    }

    #[test]
    fn test_schema_fingerprint_canonical() {
        let a = Format::JsonSchema {
            schema: serde_json::json!({"type": "string", "title": "x"}),
            style: SchemaStyle::Json,
        };
        let b = Format::JsonSchema {
            schema: serde_json::json!({"title": "y", "type": "string"}),
            style: SchemaStyle::Json,
        };
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }
}
