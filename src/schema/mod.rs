//! JSON-schema lowering
//!
//! Parses a JSON schema into an intermediate spec tree, then emits either
//! JSON-style or XML-style grammar text through the converter. Entry points
//! are [`json_schema_to_ebnf`] and [`Grammar::from_json_schema`].

use serde_json::Value;

use crate::error::{MoldearError, Result};
use crate::grammar::Grammar;

pub mod converter;
pub mod formats;
pub mod number;
pub mod parser;

pub use converter::{ConvertStyle, JsonSchemaConverter};

/// Options controlling schema compilation and output formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace between JSON tokens. When false, the
    /// exact separator / indentation layout is enforced.
    pub any_whitespace: bool,
    /// Pretty-print indentation width (only with `any_whitespace` off)
    pub indent: Option<usize>,
    /// Explicit `(item, key-value)` separators
    pub separators: Option<(String, String)>,
    /// Forbid object properties the schema does not mention
    pub strict_mode: bool,
    /// Upper bound on consecutive whitespace characters
    pub max_whitespace_cnt: Option<usize>,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: true,
            max_whitespace_cnt: None,
        }
    }
}

/// Convert a JSON schema (text) to an EBNF script.
///
/// # Errors
///
/// Returns [`MoldearError::InvalidJson`] when the text is not JSON, and
/// schema errors per the §error taxonomy otherwise.
pub fn json_schema_to_ebnf(
    schema: &str,
    options: &JsonSchemaOptions,
    style: ConvertStyle,
) -> Result<String> {
    let value: Value = serde_json::from_str(schema)
        .map_err(|e| MoldearError::InvalidJson(e.to_string()))?;
    json_value_schema_to_ebnf(&value, options, style)
}

/// Convert an already parsed JSON schema to an EBNF script.
///
/// # Errors
///
/// Schema errors per the error taxonomy.
pub fn json_value_schema_to_ebnf(
    schema: &Value,
    options: &JsonSchemaOptions,
    style: ConvertStyle,
) -> Result<String> {
    JsonSchemaConverter::new(schema.clone(), options, style).convert()
}

impl Grammar {
    /// Compile a JSON schema into a normalized grammar.
    ///
    /// # Errors
    ///
    /// Propagates JSON, schema and grammar errors.
    pub fn from_json_schema(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
        let script = json_schema_to_ebnf(schema, options, ConvertStyle::Json)?;
        Grammar::from_ebnf(&script, "root")
    }

    /// Compile a JSON schema with the Qwen-XML tool-calling surface.
    ///
    /// # Errors
    ///
    /// Propagates JSON, schema and grammar errors.
    pub fn from_json_schema_xml(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
        let script = json_schema_to_ebnf(schema, options, ConvertStyle::QwenXml)?;
        Grammar::from_ebnf(&script, "root")
    }
}
