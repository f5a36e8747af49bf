//! Schema spec tree → EBNF emission
//!
//! Walks a [`SchemaSpec`] and emits an EBNF script. Output style (JSON or
//! Qwen-XML tool calling) is a tagged variant passed through the traversal:
//! the XML style overrides key formatting, the any-rule, the string rule
//! and object bracing at nesting depth <= 1 and falls back to JSON
//! formatting deeper in.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{MoldearError, Result};
use crate::regex::regex_to_ebnf;
use crate::schema::formats::format_to_regex;
use crate::schema::number::{float_range_regex, integer_range_regex, FLOAT_PRECISION};
use crate::schema::parser::{
    ArraySpec, ObjectSpec, SchemaParser, SchemaRef, SchemaSpec, SpecKind,
};
use crate::schema::JsonSchemaOptions;

/// Output dialect selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvertStyle {
    /// Plain JSON text
    #[default]
    Json,
    /// Qwen-XML tool-calling: `<parameter=key>value</parameter>` at the
    /// outer level, JSON inside
    QwenXml,
}

const BASIC_ANY: &str = "basic_any";
const BASIC_INTEGER: &str = "basic_integer";
const BASIC_NUMBER: &str = "basic_number";
const BASIC_STRING: &str = "basic_string";
const BASIC_BOOLEAN: &str = "basic_boolean";
const BASIC_NULL: &str = "basic_null";
const BASIC_ARRAY: &str = "basic_array";
const BASIC_OBJECT: &str = "basic_object";
const BASIC_ESCAPE: &str = "basic_escape";
const BASIC_STRING_SUB: &str = "basic_string_sub";
const XML_STRING: &str = "xml_string";
const XML_ANY: &str = "xml_any";
const XML_OBJECT: &str = "xml_object";
const XML_VARIABLE_NAME: &str = "xml_variable_name";

/// Accumulates named EBNF rules into a script.
#[derive(Default)]
struct EbnfScriptCreator {
    rules: Vec<(String, String)>,
    names: HashMap<String, u32>,
}

impl EbnfScriptCreator {
    fn allocate_rule_name(&mut self, hint: &str) -> String {
        match self.names.get(hint).copied() {
            None => {
                self.names.insert(hint.to_string(), 0);
                hint.to_string()
            }
            Some(counter) => {
                let mut n = counter + 1;
                loop {
                    let candidate = format!("{hint}_{n}");
                    if !self.names.contains_key(&candidate) {
                        self.names.insert(hint.to_string(), n);
                        self.names.insert(candidate.clone(), 0);
                        return candidate;
                    }
                    n += 1;
                }
            }
        }
    }

    fn add_rule(&mut self, name_hint: &str, body: &str) -> String {
        let name = self.allocate_rule_name(name_hint);
        self.rules.push((name.clone(), body.to_string()));
        name
    }

    fn add_rule_with_allocated_name(&mut self, name: String, body: String) {
        self.rules.push((name, body));
    }

    fn script(&self) -> String {
        let mut out = String::new();
        for (name, body) in &self.rules {
            let _ = writeln!(out, "{name} ::= {body}");
        }
        out
    }
}

/// Separator production for object/array layouts.
#[derive(Clone)]
struct IndentManager {
    enable_newline: bool,
    indent: usize,
    total_indent: usize,
    separator: String,
    is_first: Vec<bool>,
    any_whitespace: bool,
    max_whitespace_cnt: Option<usize>,
}

impl IndentManager {
    fn new(
        indent: Option<usize>,
        separator: &str,
        any_whitespace: bool,
        max_whitespace_cnt: Option<usize>,
    ) -> Self {
        Self {
            enable_newline: indent.is_some(),
            indent: indent.unwrap_or(0),
            total_indent: 0,
            separator: separator.to_string(),
            is_first: vec![false],
            any_whitespace,
            max_whitespace_cnt,
        }
    }

    fn whitespace_pattern(&self) -> String {
        match self.max_whitespace_cnt {
            None => "[ \\n\\t]*".to_string(),
            Some(n) => format!("[ \\n\\t]{{0,{n}}}"),
        }
    }

    fn start_indent(&mut self) {
        self.total_indent += self.indent;
        self.is_first.push(true);
    }

    fn end_indent(&mut self) {
        self.total_indent -= self.indent;
        self.is_first.pop();
    }

    fn next_separator(&mut self, is_end: bool) -> String {
        if self.any_whitespace {
            let ws = self.whitespace_pattern();
            let first = *self.is_first.last().unwrap_or(&false);
            if let Some(flag) = self.is_first.last_mut() {
                *flag = false;
            }
            if first || is_end {
                return ws;
            }
            return format!("{ws} \"{}\" {ws}", escape_ebnf(&self.separator));
        }

        let mut text = String::new();
        let first = *self.is_first.last().unwrap_or(&false);
        if let Some(flag) = self.is_first.last_mut() {
            *flag = false;
        }
        if !first && !is_end {
            text.push_str(&self.separator);
        }
        if self.enable_newline {
            text.push('\n');
            let spaces = if is_end {
                self.total_indent.saturating_sub(self.indent)
            } else {
                self.total_indent
            };
            text.push_str(&" ".repeat(spaces));
        }
        format!("\"{}\"", escape_ebnf(&text))
    }

    fn empty_separator(&self) -> String {
        if self.any_whitespace {
            self.whitespace_pattern()
        } else {
            "\"\"".to_string()
        }
    }
}

fn escape_ebnf(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// A JSON value rendered as an EBNF string literal of its serialization.
fn json_value_literal(value: &Value) -> String {
    format!("\"{}\"", escape_ebnf(&value.to_string()))
}

/// `(content)` repeated `[lo, hi]` times; `hi == -1` means unbounded.
fn repeat_text(content: &str, lo: i64, hi: i64) -> String {
    match (lo, hi) {
        (0, 0) => "\"\"".to_string(),
        (0, -1) => format!("({content})*"),
        (1, -1) => format!("({content})+"),
        (0, 1) => format!("({content})?"),
        (lo, -1) => format!("({content}){{{lo},}}"),
        (lo, hi) => format!("({content}){{{lo},{hi}}}"),
    }
}

/// The converter. One instance per schema compilation.
pub struct JsonSchemaConverter {
    creator: EbnfScriptCreator,
    indent_manager: IndentManager,
    any_whitespace: bool,
    max_whitespace_cnt: Option<usize>,
    colon_pattern: String,
    style: ConvertStyle,
    nested_object_level: u32,
    /// `(cache_key, is_inner_layer)` → rule name
    rule_cache: HashMap<(String, bool), String>,
    uri_to_rule_name: HashMap<String, String>,
    parser: SchemaParser,
    root_json: Value,
}

impl JsonSchemaConverter {
    /// Create a converter for `root_json` under `options`.
    #[must_use]
    pub fn new(root_json: Value, options: &JsonSchemaOptions, style: ConvertStyle) -> Self {
        let any_whitespace = options.any_whitespace;
        let default_item_sep = if any_whitespace {
            ","
        } else if options.indent.is_some() {
            ","
        } else {
            ", "
        };
        let (item_sep, colon_sep) = match &options.separators {
            Some((item, colon)) => (item.clone(), colon.clone()),
            None => (
                default_item_sep.to_string(),
                if any_whitespace { ":" } else { ": " }.to_string(),
            ),
        };
        let indent_manager = IndentManager::new(
            options.indent,
            &item_sep,
            any_whitespace,
            options.max_whitespace_cnt,
        );
        let colon_pattern = if any_whitespace {
            let ws = indent_manager.whitespace_pattern();
            format!("{ws} \"{}\" {ws}", escape_ebnf(&colon_sep))
        } else {
            format!("\"{}\"", escape_ebnf(&colon_sep))
        };
        Self {
            creator: EbnfScriptCreator::default(),
            indent_manager,
            any_whitespace,
            max_whitespace_cnt: options.max_whitespace_cnt,
            colon_pattern,
            style,
            nested_object_level: 0,
            rule_cache: HashMap::new(),
            uri_to_rule_name: HashMap::new(),
            parser: SchemaParser::new(options.strict_mode),
            root_json,
        }
    }

    /// Run the conversion, producing the EBNF script.
    ///
    /// # Errors
    ///
    /// Propagates schema parse errors and regex conversion failures.
    pub fn convert(&mut self) -> Result<String> {
        let root_json = self.root_json.clone();
        let spec = self.parser.parse(&root_json, "root")?;
        self.add_basic_rules()?;
        let root_rule_name = self.creator.allocate_rule_name("root");
        self.uri_to_rule_name
            .insert("#".to_string(), root_rule_name.clone());
        if let Some(cached) = self.get_cache(&spec.cache_key) {
            self.creator.add_rule_with_allocated_name(root_rule_name, cached);
        } else {
            self.add_cache(&spec.cache_key, &root_rule_name);
            let body = self.generate_from_spec(&spec, &root_rule_name)?;
            self.creator.add_rule_with_allocated_name(root_rule_name, body);
        }
        Ok(self.creator.script())
    }

    fn is_inner_layer(&self) -> bool {
        self.style == ConvertStyle::Json || self.nested_object_level > 1
    }

    fn add_cache(&mut self, key: &str, rule_name: &str) {
        if key.is_empty() {
            return;
        }
        self.rule_cache
            .insert((key.to_string(), self.is_inner_layer()), rule_name.to_string());
    }

    fn get_cache(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        self.rule_cache
            .get(&(key.to_string(), self.is_inner_layer()))
            .cloned()
    }

    fn whitespace_pattern(&self) -> String {
        match self.max_whitespace_cnt {
            None => "[ \\n\\t]*".to_string(),
            Some(n) => format!("[ \\n\\t]{{0,{n}}}"),
        }
    }

    fn add_helper_rules(&mut self) {
        self.creator.add_rule(
            BASIC_ESCAPE,
            "[\"\\\\/bfnrt] | \"u\" [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9]",
        );
        let ws = self.whitespace_pattern();
        let body = format!(
            "(\"\\\"\" | [^\\0-\\x1f\"\\\\\\r\\n] {BASIC_STRING_SUB} | \"\\\\\" {BASIC_ESCAPE} {BASIC_STRING_SUB}) (= {ws} [,}}\\]:])"
        );
        self.creator.add_rule(BASIC_STRING_SUB, &body);
    }

    fn add_basic_rules(&mut self) -> Result<()> {
        if self.style == ConvertStyle::QwenXml {
            // JSON basic rules belong to the inner layer of the XML format
            self.nested_object_level = 2;
            self.add_basic_rules_json()?;
            self.nested_object_level = 0;
            self.add_basic_rules_xml()?;
            Ok(())
        } else {
            self.add_basic_rules_json()
        }
    }

    fn add_basic_rules_json(&mut self) -> Result<()> {
        self.add_helper_rules();

        // Basic rules always use the compact layout
        let saved = self.indent_manager.clone();
        self.indent_manager = if self.any_whitespace {
            IndentManager::new(None, ",", true, self.max_whitespace_cnt)
        } else {
            IndentManager::new(None, ", ", false, None)
        };

        let any_body = self.generate_any();
        self.creator.add_rule(BASIC_ANY, &any_body);
        self.add_cache("{}", BASIC_ANY);

        let int_body = self.generate_integer(None, None)?;
        self.creator.add_rule(BASIC_INTEGER, &int_body);
        self.add_cache("{\"type\":\"integer\"}", BASIC_INTEGER);

        let num_body = self.generate_number(None, None)?;
        self.creator.add_rule(BASIC_NUMBER, &num_body);
        self.add_cache("{\"type\":\"number\"}", BASIC_NUMBER);

        self.creator
            .add_rule(BASIC_STRING, &format!("\"\\\"\" {BASIC_STRING_SUB}"));
        self.add_cache("{\"type\":\"string\"}", BASIC_STRING);

        self.creator.add_rule(BASIC_BOOLEAN, "\"true\" | \"false\"");
        self.add_cache("{\"type\":\"boolean\"}", BASIC_BOOLEAN);

        self.creator.add_rule(BASIC_NULL, "\"null\"");
        self.add_cache("{\"type\":\"null\"}", BASIC_NULL);

        let any_spec = self.any_schema_spec();
        let array_spec = ArraySpec {
            prefix_items: Vec::new(),
            allow_additional: true,
            additional_items: Some(Rc::clone(&any_spec)),
            min_items: 0,
            max_items: -1,
        };
        let array_body = self.generate_array(&array_spec, BASIC_ARRAY)?;
        self.creator.add_rule(BASIC_ARRAY, &array_body);
        self.add_cache("{\"type\":\"array\"}", BASIC_ARRAY);

        let object_spec = ObjectSpec {
            allow_additional: true,
            additional_schema: Some(any_spec),
            additional_suffix: "addl",
            max_properties: -1,
            ..ObjectSpec::default()
        };
        let object_body = self.generate_object(&object_spec, BASIC_OBJECT)?;
        self.creator.add_rule(BASIC_OBJECT, &object_body);
        self.add_cache("{\"type\":\"object\"}", BASIC_OBJECT);

        self.indent_manager = saved;
        Ok(())
    }

    fn add_basic_rules_xml(&mut self) -> Result<()> {
        self.creator.add_rule(
            XML_STRING,
            "TagDispatch(stop_eos=true, stop_str=(), loop_after_dispatch=false, excludes=(\"</parameter>\"))",
        );
        self.add_cache("{\"type\":\"string\"}", XML_STRING);

        let any_body = self.generate_any();
        self.creator.add_rule(XML_ANY, &any_body);
        self.add_cache("{}", XML_ANY);

        let any_spec = self.any_schema_spec();
        let object_spec = ObjectSpec {
            allow_additional: true,
            additional_schema: Some(any_spec),
            additional_suffix: "addl",
            max_properties: -1,
            ..ObjectSpec::default()
        };
        let object_body = self.generate_object(&object_spec, XML_OBJECT)?;
        self.creator.add_rule(XML_OBJECT, &object_body);
        self.add_cache("{\"type\":\"object\"}", XML_OBJECT);

        self.creator
            .add_rule(XML_VARIABLE_NAME, "[a-zA-Z_] [a-zA-Z0-9_]*");
        Ok(())
    }

    fn any_schema_spec(&mut self) -> SchemaRef {
        self.parser
            .parse(&Value::Object(serde_json::Map::new()), "any")
            .expect("the empty schema always parses")
    }

    fn key_pattern(&self) -> &'static str {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            XML_VARIABLE_NAME
        } else {
            BASIC_STRING
        }
    }

    fn basic_any_rule_name(&self) -> &'static str {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            XML_ANY
        } else {
            BASIC_ANY
        }
    }

    fn next_separator(&mut self, is_end: bool) -> String {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            return String::new();
        }
        self.indent_manager.next_separator(is_end)
    }

    /// Make a rule for `spec`, reusing the basic-rule cache.
    fn create_rule(&mut self, spec: &SchemaRef, name_hint: &str) -> Result<String> {
        if let Some(cached) = self.get_cache(&spec.cache_key) {
            return Ok(cached);
        }
        let rule_name = self.creator.allocate_rule_name(name_hint);
        let body = self.generate_from_spec(spec, &rule_name)?;
        self.creator
            .add_rule_with_allocated_name(rule_name.clone(), body);
        Ok(rule_name)
    }

    fn generate_from_spec(&mut self, spec: &SchemaSpec, rule_name: &str) -> Result<String> {
        match &spec.kind {
            SpecKind::Integer { minimum, maximum } => self.generate_integer(*minimum, *maximum),
            SpecKind::Number { minimum, maximum } => self.generate_number(*minimum, *maximum),
            SpecKind::String {
                pattern,
                format,
                min_length,
                max_length,
            } => self.generate_string(pattern.as_deref(), format.as_deref(), *min_length, *max_length),
            SpecKind::Boolean => Ok("\"true\" | \"false\"".to_string()),
            SpecKind::Null => Ok("\"null\"".to_string()),
            SpecKind::Any => Ok(self.generate_any()),
            SpecKind::Array(array) => self.generate_array(array, rule_name),
            SpecKind::Object(object) => self.generate_object(object, rule_name),
            SpecKind::Const(value) => Ok(json_value_literal(value)),
            SpecKind::Enum(values) => Ok(values
                .iter()
                .map(json_value_literal)
                .collect::<Vec<_>>()
                .join(" | ")),
            SpecKind::Ref(uri) => self.generate_ref(uri),
            SpecKind::AnyOf(options) | SpecKind::TypeArray(options) => {
                let mut parts = Vec::with_capacity(options.len());
                for (i, option) in options.iter().enumerate() {
                    parts.push(self.create_rule(option, &format!("{rule_name}_case_{i}"))?);
                }
                Ok(parts.join(" | "))
            }
            SpecKind::AllOf(parts) => {
                // General schema intersection is out of reach of a CFG;
                // single-part allOf is exact, multi-part follows the first
                // constraint.
                let first = parts
                    .first()
                    .ok_or_else(|| MoldearError::InvalidSchema("empty allOf".to_string()))?;
                self.create_rule(first, &format!("{rule_name}_all"))
            }
        }
    }

    fn generate_any(&self) -> String {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            return format!("{XML_STRING} | {BASIC_ARRAY} | {BASIC_OBJECT}");
        }
        format!(
            "{BASIC_NUMBER} | {BASIC_STRING} | {BASIC_BOOLEAN} | {BASIC_NULL} | {BASIC_ARRAY} | {BASIC_OBJECT}"
        )
    }

    fn generate_integer(&self, minimum: Option<i64>, maximum: Option<i64>) -> Result<String> {
        if minimum.is_some() || maximum.is_some() {
            let range = integer_range_regex(minimum, maximum);
            return regex_to_ebnf(&range);
        }
        Ok("(\"0\" | \"-\"? [1-9] [0-9]*)".to_string())
    }

    fn generate_number(&self, minimum: Option<f64>, maximum: Option<f64>) -> Result<String> {
        if minimum.is_some() || maximum.is_some() {
            let range = float_range_regex(minimum, maximum, FLOAT_PRECISION);
            return regex_to_ebnf(&range);
        }
        Ok("\"-\"? (\"0\" | [1-9] [0-9]*) (\".\" [0-9]+)? ([eE] [+-]? [0-9]+)?".to_string())
    }

    fn generate_string(
        &self,
        pattern: Option<&str>,
        format: Option<&str>,
        min_length: i64,
        max_length: i64,
    ) -> Result<String> {
        let xml_outer = self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1;
        if let Some(format) = format {
            if let Some(regex) = format_to_regex(format) {
                let converted = regex_to_ebnf(regex)?;
                return Ok(if xml_outer {
                    converted
                } else {
                    format!("\"\\\"\" {converted} \"\\\"\"")
                });
            }
        }
        if let Some(pattern) = pattern {
            let converted = regex_to_ebnf(pattern)?;
            return Ok(if xml_outer {
                converted
            } else {
                format!("\"\\\"\" {converted} \"\\\"\"")
            });
        }
        if min_length != 0 || max_length != -1 {
            let char_pattern = if xml_outer { "[^]" } else { "[^\"\\\\\\r\\n]" };
            let repetition = if max_length == -1 {
                format!("{{{min_length},}}")
            } else {
                format!("{{{min_length},{max_length}}}")
            };
            let body = format!("{char_pattern}{repetition}");
            return Ok(if xml_outer {
                body
            } else {
                format!("\"\\\"\" {body} \"\\\"\"")
            });
        }
        if xml_outer {
            return Ok(XML_STRING.to_string());
        }
        Ok(format!("\"\\\"\" {BASIC_STRING_SUB}"))
    }

    fn generate_ref(&mut self, uri: &str) -> Result<String> {
        if let Some(existing) = self.uri_to_rule_name.get(uri) {
            return Ok(existing.clone());
        }
        let resolved = resolve_json_pointer(&self.root_json, uri)?;
        let hint = uri
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && *s != "#")
            .unwrap_or("ref");
        let rule_name = self.creator.allocate_rule_name(hint);
        // Register before recursing so circular references close on the
        // allocated name instead of recursing forever.
        self.uri_to_rule_name
            .insert(uri.to_string(), rule_name.clone());
        let spec = self.parser.parse(&resolved, &rule_name.clone())?;
        let body = self.generate_from_spec(&spec, &rule_name)?;
        self.creator
            .add_rule_with_allocated_name(rule_name.clone(), body);
        Ok(rule_name)
    }

    // ==================== Property formatting (style-dispatched) ====================

    fn format_property_key(&self, key: &str) -> String {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            return format!("\"<parameter={}>\"", escape_ebnf(key));
        }
        format!("\"\\\"{}\\\"\"", escape_ebnf(key))
    }

    fn format_property(&self, key: &str, value_rule: &str) -> String {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            let ws = self.whitespace_pattern();
            return format!(
                "\"<parameter={}>\" {ws} {value_rule} {ws} \"</parameter>\"",
                escape_ebnf(key)
            );
        }
        format!(
            "{} {} {value_rule}",
            self.format_property_key(key),
            self.colon_pattern
        )
    }

    fn format_other_property(&self, key_pattern: &str, value_rule: &str) -> String {
        if self.style == ConvertStyle::QwenXml && self.nested_object_level <= 1 {
            let ws = self.whitespace_pattern();
            return format!(
                "\"<parameter=\" {key_pattern} \">\" {ws} {value_rule} {ws} \"</parameter>\""
            );
        }
        format!("{key_pattern} {} {value_rule}", self.colon_pattern)
    }

    /// Repetition of `pattern` clamped by the remaining property budget.
    fn property_with_count_bounds(
        pattern: &str,
        min_properties: i64,
        max_properties: i64,
        already_repeated: i64,
    ) -> String {
        if max_properties != -1 && max_properties == already_repeated {
            return "\"\"".to_string();
        }
        let lower = (min_properties - already_repeated).max(0);
        let upper = if max_properties == -1 {
            -1
        } else {
            max_properties - already_repeated
        };
        match (lower, upper) {
            (0, -1) => format!("({pattern})*"),
            (0, 1) => format!("({pattern})?"),
            (1, 1) => pattern.to_string(),
            (lo, hi) => repeat_text(pattern, lo, hi),
        }
    }

    // ==================== Arrays ====================

    fn generate_array(&mut self, spec: &ArraySpec, rule_name: &str) -> Result<String> {
        self.nested_object_level += 1;
        let result = self.generate_array_inner(spec, rule_name);
        self.nested_object_level -= 1;
        result
    }

    fn generate_array_inner(&mut self, spec: &ArraySpec, rule_name: &str) -> Result<String> {
        self.indent_manager.start_indent();
        let start_sep = self.indent_manager.next_separator(false);
        let mid_sep = self.indent_manager.next_separator(false);
        let end_sep = self.indent_manager.next_separator(true);
        let empty_sep = self.indent_manager.empty_separator();

        let mut item_rules = Vec::with_capacity(spec.prefix_items.len());
        for (i, item) in spec.prefix_items.iter().enumerate() {
            item_rules.push(self.create_rule(item, &format!("{rule_name}_item_{i}"))?);
        }
        let additional_rule = match (&spec.additional_items, spec.allow_additional) {
            (Some(additional), true) => {
                Some(self.create_rule(additional, &format!("{rule_name}_additional"))?)
            }
            _ => None,
        };
        self.indent_manager.end_indent();

        let empty_part = format!("\"[\" {empty_sep} \"]\"");
        if spec.prefix_items.is_empty() {
            let Some(additional_rule) = additional_rule else {
                return Ok(empty_part);
            };
            if spec.min_items == 0 && spec.max_items == 0 {
                return Ok(empty_part);
            }
            let tail = repeat_text(
                &format!("{mid_sep} {additional_rule}"),
                (spec.min_items - 1).max(0),
                if spec.max_items == -1 { -1 } else { spec.max_items - 1 },
            );
            let non_empty =
                format!("\"[\" {start_sep} {additional_rule} {tail} {end_sep} \"]\"");
            if spec.min_items == 0 {
                return Ok(format!("({non_empty}) | ({empty_part})"));
            }
            return Ok(non_empty);
        }

        let mut prefix = String::new();
        for (i, item_rule) in item_rules.iter().enumerate() {
            if i > 0 {
                let _ = write!(prefix, " {mid_sep}");
            }
            let _ = write!(prefix, " {item_rule}");
        }
        match additional_rule {
            None => Ok(format!("\"[\" {start_sep}{prefix} {end_sep} \"]\"")),
            Some(additional_rule) => {
                let prefix_len = i64::try_from(item_rules.len()).unwrap_or(i64::MAX);
                let tail = repeat_text(
                    &format!("{mid_sep} {additional_rule}"),
                    (spec.min_items - prefix_len).max(0),
                    if spec.max_items == -1 {
                        -1
                    } else {
                        spec.max_items - prefix_len
                    },
                );
                Ok(format!("\"[\" {start_sep}{prefix} {tail} {end_sep} \"]\""))
            }
        }
    }

    // ==================== Objects ====================

    fn generate_object(&mut self, spec: &ObjectSpec, rule_name: &str) -> Result<String> {
        self.nested_object_level += 1;
        let need_braces =
            self.style == ConvertStyle::Json || self.nested_object_level > 1;
        let result = self.generate_object_inner(spec, rule_name, need_braces);
        self.nested_object_level -= 1;
        result
    }

    fn generate_object_inner(
        &mut self,
        spec: &ObjectSpec,
        rule_name: &str,
        need_braces: bool,
    ) -> Result<String> {
        let mut result = String::new();
        if need_braces {
            result.push_str("\"{\"");
        }
        let mut could_be_empty = false;

        let additional = if spec.allow_additional {
            spec.additional_schema.clone()
        } else {
            None
        };

        self.indent_manager.start_indent();

        if !spec.pattern_properties.is_empty() || spec.property_names.is_some() {
            // Case 1: patternProperties or propertyNames
            if spec.max_properties != 0 {
                let beg_sep = self.next_separator(false);
                let mut property_rule_body = String::from("(");
                if spec.pattern_properties.is_empty() {
                    let name_spec = spec.property_names.clone().expect("checked above");
                    let key_rule = self.create_rule(&name_spec, &format!("{rule_name}_name"))?;
                    let _ = write!(
                        property_rule_body,
                        "{beg_sep} {key_rule} {} {})",
                        self.colon_pattern,
                        self.basic_any_rule_name()
                    );
                } else {
                    let pattern_properties = spec.pattern_properties.clone();
                    for (i, (pattern, value_schema)) in pattern_properties.iter().enumerate() {
                        let value_rule =
                            self.create_rule(value_schema, &format!("{rule_name}_prop_{i}"))?;
                        let key_ebnf = regex_to_ebnf(pattern)?;
                        let property = format!(
                            "\"\\\"\" {key_ebnf} \"\\\"\" {} {value_rule}",
                            self.colon_pattern
                        );
                        if i != 0 {
                            property_rule_body.push_str(" | ");
                        }
                        let _ = write!(property_rule_body, "({beg_sep} {property})");
                    }
                    property_rule_body.push(')');
                }
                let prop_rule_name = self
                    .creator
                    .add_rule(&format!("{rule_name}_prop"), &property_rule_body);
                let mid_sep = self.next_separator(false);
                let end_sep = self.next_separator(true);
                let _ = write!(
                    result,
                    " {prop_rule_name} {} {end_sep}",
                    Self::property_with_count_bounds(
                        &format!("{mid_sep} {prop_rule_name}"),
                        spec.min_properties,
                        spec.max_properties,
                        1
                    )
                );
                could_be_empty = spec.min_properties == 0;
            }
        } else if !spec.properties.is_empty() {
            // Case 2: named properties
            let partial = self.partial_rule_for_properties(spec, rule_name, &additional)?;
            let _ = write!(result, " {partial}");
            could_be_empty = spec.required.is_empty() && spec.min_properties == 0;
        } else if let Some(additional) = &additional {
            // Case 3: only additional properties
            if spec.max_properties != 0 {
                let value_rule = self
                    .create_rule(additional, &format!("{rule_name}_{}", spec.additional_suffix))?;
                let key_pattern = self.key_pattern().to_string();
                let property = self.format_other_property(&key_pattern, &value_rule);
                let first_sep = self.next_separator(false);
                let mid_sep = self.next_separator(false);
                let end_sep = self.next_separator(true);
                let _ = write!(
                    result,
                    " {first_sep} {property} {} {end_sep}",
                    Self::property_with_count_bounds(
                        &format!("{mid_sep} {property}"),
                        spec.min_properties,
                        spec.max_properties,
                        1
                    )
                );
            }
            could_be_empty = spec.min_properties == 0;
        } else {
            could_be_empty = spec.min_properties == 0;
        }

        self.indent_manager.end_indent();

        if need_braces {
            result.push_str(" \"}\"");
        }
        if could_be_empty {
            let ws = self.whitespace_pattern();
            let empty_form = if need_braces {
                if self.any_whitespace {
                    format!("\"{{\" {ws} \"}}\"")
                } else {
                    "\"{\" \"}\"".to_string()
                }
            } else if self.any_whitespace {
                ws
            } else {
                "\"\"".to_string()
            };
            if result == "\"{\" \"}\"" || result.is_empty() {
                result = empty_form;
            } else {
                result = format!("({result}) | {empty_form}");
            }
        }
        Ok(result)
    }

    /// The suffix-chain construction for named properties (three cases by
    /// property-count bounds).
    fn partial_rule_for_properties(
        &mut self,
        spec: &ObjectSpec,
        rule_name: &str,
        additional: &Option<SchemaRef>,
    ) -> Result<String> {
        if spec.max_properties == 0 {
            return Ok(String::new());
        }
        let first_sep = self.next_separator(false);
        let mid_sep = self.next_separator(false);
        let last_sep = self.next_separator(true);

        let properties = spec.properties.clone();
        let required = &spec.required;
        let n = properties.len();
        debug_assert!(n > 0);

        let mut prop_patterns = Vec::with_capacity(n);
        for (idx, prop) in properties.iter().enumerate() {
            let value_rule = self.create_rule(&prop.schema, &format!("{rule_name}_prop_{idx}"))?;
            prop_patterns.push(self.format_property(&prop.name, &value_rule));
        }

        let additional_prop_pattern = match additional {
            Some(additional) => {
                let value_rule = self
                    .create_rule(additional, &format!("{rule_name}_{}", spec.additional_suffix))?;
                let key_pattern = self.key_pattern().to_string();
                Some(self.format_other_property(&key_pattern, &value_rule))
            }
            None => None,
        };

        let is_required: Vec<bool> = properties
            .iter()
            .map(|p| required.contains(&p.name))
            .collect();

        let mut body = String::new();
        if spec.min_properties == 0 && spec.max_properties == -1 {
            // Case 1: no property-count bounds. One suffix rule per
            // position: each optionally emits the next property or
            // delegates onward.
            let mut rule_names: Vec<String> = vec![String::new(); n];
            if let Some(additional_pattern) = &additional_prop_pattern {
                let last_body = format!("({mid_sep} {additional_pattern})*");
                rule_names[n - 1] = self
                    .creator
                    .add_rule(&format!("{rule_name}_part_{}", n - 1), &last_body);
            } else {
                rule_names[n - 1] = "\"\"".to_string();
            }
            for i in (0..n.saturating_sub(1)).rev() {
                let next_pattern = &prop_patterns[i + 1];
                let next_rule = rule_names[i + 1].clone();
                let mut cur_body = format!("{mid_sep} {next_pattern} {next_rule}");
                if !is_required[i + 1] {
                    cur_body = format!("{next_rule} | {cur_body}");
                }
                rule_names[i] = self
                    .creator
                    .add_rule(&format!("{rule_name}_part_{i}"), &cur_body);
            }

            for i in 0..n {
                if i != 0 {
                    body.push_str(" | ");
                }
                let _ = write!(body, "({} {})", prop_patterns[i], rule_names[i]);
                if is_required[i] {
                    break;
                }
            }
            if let Some(additional_pattern) = &additional_prop_pattern {
                if required.is_empty() {
                    let _ = write!(body, " | {additional_pattern} {}", rule_names[n - 1]);
                }
            }
        } else {
            // Cases 2 and 3: the same chain parameterized by how many keys
            // matched so far, clamped from below (and above when a
            // maximum is given).
            let min_properties = spec.min_properties;
            let max_properties = spec.max_properties;
            let allow_additional = additional_prop_pattern.is_some();

            let mut key_matched_min = vec![0i64; n];
            let mut key_matched_max = vec![i64::try_from(n).unwrap_or(i64::MAX); n];
            let mut got_first_required = is_required[0];
            key_matched_min[0] = 1;
            key_matched_max[0] = 1;
            for i in 1..n {
                key_matched_min[i] = if is_required[i] {
                    key_matched_min[i - 1] + 1
                } else {
                    key_matched_min[i - 1]
                };
                if !got_first_required {
                    key_matched_min[i] = 1;
                }
                key_matched_max[i] = key_matched_max[i - 1] + 1;
                if is_required[i] {
                    got_first_required = true;
                }
            }
            let floor = if allow_additional { 1 } else { min_properties };
            key_matched_min[n - 1] = key_matched_min[n - 1].max(floor);
            if max_properties != -1 {
                key_matched_max[n - 1] = key_matched_max[n - 1].min(max_properties);
            }
            for i in (0..n.saturating_sub(1)).rev() {
                key_matched_min[i] = key_matched_min[i].max(key_matched_min[i + 1] - 1);
                if max_properties != -1 {
                    if is_required[i + 1] {
                        key_matched_max[i] = key_matched_max[i].min(key_matched_max[i + 1] - 1);
                    } else {
                        key_matched_max[i] = key_matched_max[i].min(key_matched_max[i + 1]);
                    }
                }
            }

            // rule_names[i][m - key_matched_min[i]] continues after
            // property i with m keys already matched
            let mut rule_names: Vec<Vec<String>> = vec![Vec::new(); n];
            for matched in key_matched_min[n - 1]..=key_matched_max[n - 1] {
                if let Some(additional_pattern) = &additional_prop_pattern {
                    let last_body = Self::property_with_count_bounds(
                        &format!("{mid_sep} {additional_pattern}"),
                        min_properties,
                        max_properties,
                        matched,
                    );
                    let last_name = self.creator.add_rule(
                        &format!("{rule_name}_part_{}_{matched}", n - 1),
                        &last_body,
                    );
                    rule_names[n - 1].push(last_name);
                } else {
                    rule_names[n - 1].push("\"\"".to_string());
                }
            }
            for i in (0..n.saturating_sub(1)).rev() {
                for matched in key_matched_min[i]..=key_matched_max[i] {
                    let next_pattern = &prop_patterns[i + 1];
                    let offset = |m: i64| usize::try_from(m - key_matched_min[i + 1]).unwrap_or(0);
                    let cur_body = if matched == key_matched_max[i + 1] && max_properties != -1 {
                        rule_names[i + 1][offset(matched)].clone()
                    } else if is_required[i + 1] || matched == key_matched_min[i + 1] - 1 {
                        format!(
                            "{mid_sep} {next_pattern} {}",
                            rule_names[i + 1][offset(matched + 1)]
                        )
                    } else {
                        format!(
                            "{} | {mid_sep} {next_pattern} {}",
                            rule_names[i + 1][offset(matched)],
                            rule_names[i + 1][offset(matched + 1)]
                        )
                    };
                    let cur_name = self
                        .creator
                        .add_rule(&format!("{rule_name}_part_{i}_{matched}"), &cur_body);
                    rule_names[i].push(cur_name);
                }
            }

            let mut first = true;
            for i in 0..n {
                if key_matched_max[i] < key_matched_min[i] {
                    continue;
                }
                if key_matched_min[i] > 1 {
                    break;
                }
                if !first {
                    body.push_str(" | ");
                }
                first = false;
                let offset = usize::try_from(1 - key_matched_min[i]).unwrap_or(0);
                let _ = write!(body, "({} {})", prop_patterns[i], rule_names[i][offset]);
                if is_required[i] {
                    break;
                }
            }
            if let Some(additional_pattern) = &additional_prop_pattern {
                if required.is_empty() {
                    if !first {
                        body.push_str(" | ");
                    }
                    let _ = write!(
                        body,
                        "({} {})",
                        additional_pattern,
                        Self::property_with_count_bounds(
                            &format!("{mid_sep} {additional_pattern}"),
                            min_properties,
                            max_properties,
                            1
                        )
                    );
                }
            }
        }

        Ok(format!("{first_sep} ({body}) {last_sep}"))
    }
}

/// Resolve a `#/x/y/...` JSON-pointer fragment against the root document.
fn resolve_json_pointer(root: &Value, uri: &str) -> Result<Value> {
    let Some(fragment) = uri.strip_prefix('#') else {
        return Err(MoldearError::InvalidSchema(format!(
            "only fragment $ref URIs are supported, got `{uri}`"
        )));
    };
    if fragment.is_empty() {
        return Ok(root.clone());
    }
    let mut current = root;
    for token in fragment.trim_start_matches('/').split('/') {
        let token = token.replace("~1", "/").replace("~0", "~");
        current = match current {
            Value::Object(map) => map.get(&token).ok_or_else(|| {
                MoldearError::InvalidSchema(format!("$ref `{uri}` does not resolve"))
            })?,
            Value::Array(items) => {
                let index: usize = token.parse().map_err(|_| {
                    MoldearError::InvalidSchema(format!("$ref `{uri}` does not resolve"))
                })?;
                items.get(index).ok_or_else(|| {
                    MoldearError::InvalidSchema(format!("$ref `{uri}` does not resolve"))
                })?
            }
            _ => {
                return Err(MoldearError::InvalidSchema(format!(
                    "$ref `{uri}` does not resolve"
                )))
            }
        };
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn convert(schema: Value) -> String {
        let options = JsonSchemaOptions::default();
        JsonSchemaConverter::new(schema, &options, ConvertStyle::Json)
            .convert()
            .expect("valid schema")
    }

    fn convert_and_parse(schema: Value) -> crate::grammar::Grammar {
        let script = convert(schema);
        crate::grammar::Grammar::from_ebnf(&script, "root").expect("script parses")
    }

    #[test]
    fn test_basic_rules_emitted() {
        let script = convert(json!({"type": "string"}));
        for rule in [BASIC_ANY, BASIC_STRING, BASIC_ESCAPE, BASIC_STRING_SUB] {
            assert!(script.contains(rule), "missing {rule} in:\n{script}");
        }
        assert!(script.contains("root ::="));
    }

    #[test]
    fn test_root_reuses_basic_rule() {
        let script = convert(json!({"type": "integer"}));
        assert!(script.contains(&format!("root ::= {BASIC_INTEGER}")));
    }

    #[test]
    fn test_integer_range_emits_digits() {
        let script = convert(json!({"type": "integer", "minimum": -5, "maximum": 12}));
        assert!(script.contains("root ::="));
        // The output must be loadable EBNF
        convert_and_parse(json!({"type": "integer", "minimum": -5, "maximum": 12}));
    }

    #[test]
    fn test_object_with_properties_parses() {
        let grammar = convert_and_parse(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            },
            "required": ["name"]
        }));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_object_with_count_bounds_parses() {
        let grammar = convert_and_parse(json!({
            "type": "object",
            "properties": {
                "a": {"type": "boolean"},
                "b": {"type": "boolean"},
                "c": {"type": "boolean"}
            },
            "minProperties": 1,
            "maxProperties": 2
        }));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_array_prefix_and_additional() {
        let grammar = convert_and_parse(json!({
            "type": "array",
            "prefixItems": [{"type": "string"}, {"type": "integer"}],
            "items": {"type": "boolean"},
            "minItems": 2,
            "maxItems": 5
        }));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_enum_and_const() {
        let script = convert(json!({"enum": ["a", 1, true]}));
        assert!(script.contains("\"\\\"a\\\"\""));
        assert!(script.contains('1'));
        assert!(script.contains("true"));

        let script = convert(json!({"const": {"k": "v"}}));
        assert!(script.contains("{\\\"k\\\":\\\"v\\\"}"));
    }

    #[test]
    fn test_self_referential_schema() {
        let grammar = convert_and_parse(json!({
            "type": "object",
            "properties": {
                "value": {"type": "integer"},
                "next": {"$ref": "#"}
            }
        }));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_ref_to_definitions() {
        let grammar = convert_and_parse(json!({
            "type": "object",
            "properties": {"node": {"$ref": "#/definitions/leaf"}},
            "definitions": {"leaf": {"type": "null"}}
        }));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_string_format_and_pattern() {
        let grammar = convert_and_parse(json!({"type": "string", "format": "uuid"}));
        assert!(grammar.validate().is_ok());
        let grammar = convert_and_parse(json!({"type": "string", "pattern": "[a-f]{2,8}"}));
        assert!(grammar.validate().is_ok());
        // Unknown formats fall back to the plain string rule
        let script = convert(json!({"type": "string", "format": "no-such-format"}));
        assert!(script.contains(&format!("root ::= {BASIC_STRING}")));
    }

    #[test]
    fn test_xml_style_outer_layer() {
        let options = JsonSchemaOptions::default();
        let script = JsonSchemaConverter::new(
            json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
            &options,
            ConvertStyle::QwenXml,
        )
        .convert()
        .expect("valid schema");
        assert!(script.contains("<parameter=location>"));
        assert!(script.contains(XML_STRING));
        assert!(script.contains("TagDispatch("));
        // Outer object is XML-shaped: no brace literal in the root rule
        let root_line = script
            .lines()
            .find(|l| l.starts_with("root ::="))
            .expect("root rule");
        assert!(!root_line.contains("\"{\""));
        crate::grammar::Grammar::from_ebnf(&script, "root").expect("script parses");
    }

    #[test]
    fn test_separators_and_indent() {
        let options = JsonSchemaOptions {
            any_whitespace: false,
            indent: Some(2),
            ..JsonSchemaOptions::default()
        };
        let script = JsonSchemaConverter::new(
            json!({"type": "object", "properties": {"a": {"type": "null"}}, "required": ["a"]}),
            &options,
            ConvertStyle::Json,
        )
        .convert()
        .expect("valid schema");
        // Indented layout emits literal newline separators
        assert!(script.contains("\\n"));
        crate::grammar::Grammar::from_ebnf(&script, "root").expect("script parses");
    }
}
