//! Structural-tag DSL parsing
//!
//! Type-tagged objects dispatch on their `type` field; untagged objects
//! are tried in a fixed priority order (tag, const_string, json_schema,
//! any_text, sequence, or, triggered_tags, tags_with_separator) and the
//! first variant that parses wins. A recursion guard clamps pathological
//! nesting.

use serde_json::{Map, Value};

use crate::error::{MoldearError, Result};
use crate::structural::{Format, SchemaStyle, StructuralTag, TagFormat};

/// Maximum nesting depth of the format tree.
pub const MAX_RECURSION_DEPTH: u32 = 128;

fn err(message: impl Into<String>) -> MoldearError {
    MoldearError::InvalidStructuralTag(message.into())
}

/// Parse `{"type": "structural_tag", "format": ...}`.
///
/// # Errors
///
/// Returns [`MoldearError::InvalidStructuralTag`] on any shape violation.
pub fn parse_structural_tag(value: &Value) -> Result<StructuralTag> {
    let Value::Object(obj) = value else {
        return Err(err("structural tag must be an object"));
    };
    match obj.get("type") {
        Some(Value::String(t)) if t == "structural_tag" => {}
        _ => return Err(err("top-level type must be \"structural_tag\"")),
    }
    let format_value = obj
        .get("format")
        .ok_or_else(|| err("structural tag must have a format field"))?;
    let format = parse_format(format_value, 0)?;
    Ok(StructuralTag { format })
}

fn parse_format(value: &Value, depth: u32) -> Result<Format> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(err("format nesting exceeds the recursion limit"));
    }
    let Value::Object(obj) = value else {
        return Err(err("format must be an object"));
    };

    if let Some(type_value) = obj.get("type") {
        let Value::String(type_name) = type_value else {
            return Err(err("format's type must be a string"));
        };
        return match type_name.as_str() {
            "const_string" => parse_const_string(obj),
            "json_schema" => parse_json_schema(obj),
            // Deprecated spelling; mapped to the qwen_xml schema style.
            "qwen_xml_parameter" => parse_qwen_xml_parameter(obj),
            "any_text" => parse_any_text(obj, true),
            "grammar" => parse_grammar(obj),
            "regex" => parse_regex_format(obj),
            "sequence" => parse_sequence(obj, depth),
            "or" => parse_or(obj, depth),
            "tag" => parse_tag(obj, depth),
            "triggered_tags" => parse_triggered_tags(obj, depth),
            "tags_with_separator" => parse_tags_with_separator(obj, depth),
            other => Err(err(format!("format type not recognized: {other}"))),
        };
    }

    // Untagged: try the variants in priority order.
    parse_tag(obj, depth)
        .or_else(|_| parse_const_string(obj))
        .or_else(|_| parse_json_schema(obj))
        .or_else(|_| parse_any_text(obj, false))
        .or_else(|_| parse_sequence(obj, depth))
        .or_else(|_| parse_or(obj, depth))
        .or_else(|_| parse_triggered_tags(obj, depth))
        .or_else(|_| parse_tags_with_separator(obj, depth))
        .map_err(|_| err(format!("invalid format: {}", Value::Object(obj.clone()))))
}

fn string_field(obj: &Map<String, Value>, key: &str, required_non_empty: bool) -> Result<String> {
    let value = obj
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| err(format!("{key} must be a string")))?;
    if required_non_empty && value.is_empty() {
        return Err(err(format!("{key} must be non-empty")));
    }
    Ok(value.to_string())
}

fn string_array_field(
    obj: &Map<String, Value>,
    key: &str,
    require_non_empty_entries: bool,
) -> Result<Vec<String>> {
    let Some(value) = obj.get(key) else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        return Err(err(format!("{key} must be an array")));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(err(format!("{key} entries must be strings")));
        };
        if require_non_empty_entries && s.is_empty() {
            return Err(err(format!("{key} entries must be non-empty")));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Result<bool> {
    match obj.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(err(format!("{key} must be a boolean"))),
    }
}

fn parse_const_string(obj: &Map<String, Value>) -> Result<Format> {
    let value = string_field(obj, "value", true)?;
    Ok(Format::ConstString { value })
}

fn parse_json_schema(obj: &Map<String, Value>) -> Result<Format> {
    let schema = obj
        .get("json_schema")
        .ok_or_else(|| err("json_schema format must have a json_schema field"))?;
    if !matches!(schema, Value::Object(_) | Value::Bool(_)) {
        return Err(err("json_schema must be an object or boolean"));
    }
    let style = match obj.get("style") {
        None => SchemaStyle::Json,
        Some(Value::String(s)) if s == "json" => SchemaStyle::Json,
        Some(Value::String(s)) if s == "qwen_xml" => SchemaStyle::QwenXml,
        Some(_) => return Err(err("style must be \"json\" or \"qwen_xml\"")),
    };
    Ok(Format::JsonSchema {
        schema: schema.clone(),
        style,
    })
}

fn parse_qwen_xml_parameter(obj: &Map<String, Value>) -> Result<Format> {
    let schema = obj
        .get("json_schema")
        .ok_or_else(|| err("qwen_xml_parameter format must have a json_schema field"))?;
    if !matches!(schema, Value::Object(_) | Value::Bool(_)) {
        return Err(err("json_schema must be an object or boolean"));
    }
    Ok(Format::JsonSchema {
        schema: schema.clone(),
        style: SchemaStyle::QwenXml,
    })
}

fn parse_any_text(obj: &Map<String, Value>, has_type_field: bool) -> Result<Format> {
    if !obj.contains_key("excludes") && !has_type_field {
        return Err(err("untagged any_text needs an excludes field"));
    }
    let excludes = string_array_field(obj, "excludes", false)?;
    Ok(Format::AnyText {
        excludes,
        detected_end_strs: Vec::new(),
    })
}

fn parse_grammar(obj: &Map<String, Value>) -> Result<Format> {
    let grammar = string_field(obj, "grammar", true)?;
    Ok(Format::Grammar { grammar })
}

fn parse_regex_format(obj: &Map<String, Value>) -> Result<Format> {
    let pattern = string_field(obj, "pattern", true)?;
    let excludes = string_array_field(obj, "excludes", true)?;
    Ok(Format::Regex { pattern, excludes })
}

fn parse_sequence(obj: &Map<String, Value>, depth: u32) -> Result<Format> {
    let Some(Value::Array(elements_value)) = obj.get("elements") else {
        return Err(err("sequence format must have an elements array"));
    };
    let mut elements = Vec::with_capacity(elements_value.len());
    for element in elements_value {
        let parsed = parse_format(element, depth + 1)?;
        // Nested sequences are spliced rather than nested.
        if let Format::Sequence {
            elements: nested, ..
        } = parsed
        {
            elements.extend(nested);
        } else {
            elements.push(parsed);
        }
    }
    if elements.is_empty() {
        return Err(err("sequence format must have at least one element"));
    }
    Ok(Format::Sequence {
        elements,
        is_unlimited: false,
    })
}

fn parse_or(obj: &Map<String, Value>, depth: u32) -> Result<Format> {
    let Some(Value::Array(elements_value)) = obj.get("elements") else {
        return Err(err("or format must have an elements array"));
    };
    let mut elements = Vec::with_capacity(elements_value.len());
    for element in elements_value {
        elements.push(parse_format(element, depth + 1)?);
    }
    if elements.is_empty() {
        return Err(err("or format must have at least one element"));
    }
    Ok(Format::Or {
        elements,
        is_unlimited: false,
    })
}

fn parse_tag(obj: &Map<String, Value>, depth: u32) -> Result<Format> {
    Ok(Format::Tag(parse_tag_format(obj, depth)?))
}

fn parse_tag_format(obj: &Map<String, Value>, depth: u32) -> Result<TagFormat> {
    if let Some(t) = obj.get("type") {
        if t.as_str() != Some("tag") {
            return Err(err("tag format's type must be \"tag\""));
        }
    }
    let begin = string_field(obj, "begin", false)?;
    let content_value = obj
        .get("content")
        .ok_or_else(|| err("tag format must have a content field"))?;
    let content = parse_format(content_value, depth + 1)?;
    let end = match obj.get("end") {
        None => return Err(err("tag format must have an end field")),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => {
            if items.is_empty() {
                return Err(err("tag format's end array cannot be empty"));
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Some(s) = item.as_str() else {
                    return Err(err("tag format's end array must contain strings"));
                };
                out.push(s.to_string());
            }
            out
        }
        Some(_) => return Err(err("tag format's end must be a string or array of strings")),
    };
    Ok(TagFormat {
        begin,
        content: Box::new(content),
        end,
    })
}

fn parse_tag_list(obj: &Map<String, Value>, depth: u32) -> Result<Vec<TagFormat>> {
    let Some(Value::Array(tags_value)) = obj.get("tags") else {
        return Err(err("format must have a tags array"));
    };
    let mut tags = Vec::with_capacity(tags_value.len());
    for tag in tags_value {
        let Value::Object(tag_obj) = tag else {
            return Err(err("tags entries must be objects"));
        };
        tags.push(parse_tag_format(tag_obj, depth + 1)?);
    }
    if tags.is_empty() {
        return Err(err("tags must be non-empty"));
    }
    Ok(tags)
}

fn parse_triggered_tags(obj: &Map<String, Value>, depth: u32) -> Result<Format> {
    if !obj.contains_key("triggers") {
        return Err(err("triggered_tags format must have a triggers array"));
    }
    let triggers = string_array_field(obj, "triggers", true)?;
    if triggers.is_empty() {
        return Err(err("triggers must be non-empty"));
    }
    let tags = parse_tag_list(obj, depth)?;
    let excludes = string_array_field(obj, "excludes", true)?;
    Ok(Format::TriggeredTags {
        triggers,
        tags,
        excludes,
        at_least_one: bool_field(obj, "at_least_one")?,
        stop_after_first: bool_field(obj, "stop_after_first")?,
        detected_end_strs: Vec::new(),
    })
}

fn parse_tags_with_separator(obj: &Map<String, Value>, depth: u32) -> Result<Format> {
    if !obj.contains_key("separator") {
        return Err(err("tags_with_separator format must have a separator"));
    }
    let separator = string_field(obj, "separator", false)?;
    let tags = parse_tag_list(obj, depth)?;
    Ok(Format::TagsWithSeparator {
        tags,
        separator,
        at_least_one: bool_field(obj, "at_least_one")?,
        stop_after_first: bool_field(obj, "stop_after_first")?,
        detected_end_strs: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<StructuralTag> {
        parse_structural_tag(&v)
    }

    #[test]
    fn test_typed_const_string() {
        let tag = parse(json!({
            "type": "structural_tag",
            "format": {"type": "const_string", "value": "hello"}
        }))
        .expect("valid");
        assert!(matches!(tag.format, Format::ConstString { ref value } if value == "hello"));
    }

    #[test]
    fn test_untagged_priority_tag_first() {
        // An object with begin/content/end parses as a tag even untagged
        let tag = parse(json!({
            "type": "structural_tag",
            "format": {
                "begin": "<b>",
                "content": {"type": "const_string", "value": "x"},
                "end": "</b>"
            }
        }))
        .expect("valid");
        assert!(matches!(tag.format, Format::Tag(_)));
    }

    #[test]
    fn test_untagged_const_string() {
        let tag = parse(json!({
            "type": "structural_tag",
            "format": {"value": "abc"}
        }))
        .expect("valid");
        assert!(matches!(tag.format, Format::ConstString { .. }));
    }

    #[test]
    fn test_deprecated_qwen_xml_parameter_maps_to_style() {
        let tag = parse(json!({
            "type": "structural_tag",
            "format": {"type": "qwen_xml_parameter", "json_schema": {"type": "object"}}
        }))
        .expect("valid");
        assert!(matches!(
            tag.format,
            Format::JsonSchema { style: SchemaStyle::QwenXml, .. }
        ));
    }

    #[test]
    fn test_nested_sequences_spliced() {
        let tag = parse(json!({
            "type": "structural_tag",
            "format": {"type": "sequence", "elements": [
                {"type": "const_string", "value": "a"},
                {"type": "sequence", "elements": [
                    {"type": "const_string", "value": "b"},
                    {"type": "const_string", "value": "c"}
                ]}
            ]}
        }))
        .expect("valid");
        let Format::Sequence { elements, .. } = tag.format else {
            panic!("sequence");
        };
        assert_eq!(elements.len(), 3);
    }

    #[test]
    fn test_tag_end_string_or_array() {
        let single = parse(json!({
            "type": "structural_tag",
            "format": {"type": "tag", "begin": "<t>",
                "content": {"type": "any_text"}, "end": "</t>"}
        }))
        .expect("valid");
        let Format::Tag(tag) = single.format else { panic!("tag") };
        assert_eq!(tag.end, vec!["</t>"]);

        let multi = parse(json!({
            "type": "structural_tag",
            "format": {"type": "tag", "begin": "<t>",
                "content": {"type": "any_text"}, "end": ["</t>", ""]}
        }))
        .expect("valid");
        let Format::Tag(tag) = multi.format else { panic!("tag") };
        assert_eq!(tag.end.len(), 2);
    }

    #[test]
    fn test_shape_errors() {
        assert!(parse(json!({"format": {"type": "const_string", "value": "x"}})).is_err());
        assert!(parse(json!({
            "type": "structural_tag",
            "format": {"type": "const_string", "value": ""}
        }))
        .is_err());
        assert!(parse(json!({
            "type": "structural_tag",
            "format": {"type": "triggered_tags", "triggers": [], "tags": []}
        }))
        .is_err());
        assert!(parse(json!({
            "type": "structural_tag",
            "format": {"type": "tag", "begin": "<t>",
                "content": {"type": "any_text"}, "end": []}
        }))
        .is_err());
    }
}
