//! JSON-schema parsing into the intermediate spec tree
//!
//! Every subschema gets a cache key derived from its canonical JSON
//! serialization (well-known metadata keys removed, object keys sorted);
//! identical subschemas map to the same spec node. Unsatisfiable
//! constraints are reported as a distinct error kind from shape errors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use serde_json::Value;

use crate::error::{MoldearError, Result};

/// Shared reference to a spec node.
pub type SchemaRef = Rc<SchemaSpec>;

/// One parsed subschema.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    /// The parsed constraint
    pub kind: SpecKind,
    /// Canonical-serialization cache key; empty when not cacheable
    pub cache_key: String,
    /// Rule-name hint for the converter
    pub name_hint: String,
}

/// Object property entry.
#[derive(Debug, Clone)]
pub struct Property {
    /// Property name
    pub name: String,
    /// Value schema
    pub schema: SchemaRef,
}

/// Object constraints.
#[derive(Debug, Clone, Default)]
pub struct ObjectSpec {
    /// Named properties, in declaration order
    pub properties: Vec<Property>,
    /// Names of required properties
    pub required: BTreeSet<String>,
    /// Whether properties beyond the named ones are allowed
    pub allow_additional: bool,
    /// Schema for additional properties, when given explicitly
    pub additional_schema: Option<SchemaRef>,
    /// Rule-name suffix distinguishing `additionalProperties` from
    /// `unevaluatedProperties`
    pub additional_suffix: &'static str,
    /// patternProperties entries `(pattern, schema)`
    pub pattern_properties: Vec<(String, SchemaRef)>,
    /// propertyNames schema
    pub property_names: Option<SchemaRef>,
    /// Minimum property count
    pub min_properties: i64,
    /// Maximum property count; -1 = unbounded
    pub max_properties: i64,
}

/// Array constraints.
#[derive(Debug, Clone)]
pub struct ArraySpec {
    /// Positional item schemas
    pub prefix_items: Vec<SchemaRef>,
    /// Whether items beyond the prefix are allowed
    pub allow_additional: bool,
    /// Schema for additional items
    pub additional_items: Option<SchemaRef>,
    /// Minimum item count
    pub min_items: i64,
    /// Maximum item count; -1 = unbounded
    pub max_items: i64,
}

/// The constraint variants.
#[derive(Debug, Clone)]
pub enum SpecKind {
    /// Integer with optional inclusive bounds (exclusive bounds are
    /// folded in at parse time)
    Integer {
        /// Lower bound
        minimum: Option<i64>,
        /// Upper bound
        maximum: Option<i64>,
    },
    /// Floating-point number with optional bounds
    Number {
        /// Lower bound
        minimum: Option<f64>,
        /// Upper bound
        maximum: Option<f64>,
    },
    /// String with pattern/format/length constraints
    String {
        /// Regex the string must match
        pattern: Option<String>,
        /// Named format (`date`, `uuid`, ...)
        format: Option<String>,
        /// Minimum length
        min_length: i64,
        /// Maximum length; -1 = unbounded
        max_length: i64,
    },
    /// `true` / `false`
    Boolean,
    /// `null`
    Null,
    /// Any JSON value
    Any,
    /// Array
    Array(ArraySpec),
    /// Object
    Object(ObjectSpec),
    /// Exactly one JSON value
    Const(Value),
    /// One of a list of JSON values
    Enum(Vec<Value>),
    /// `$ref` by URI, resolved lazily by the converter
    Ref(String),
    /// anyOf / oneOf
    AnyOf(Vec<SchemaRef>),
    /// allOf
    AllOf(Vec<SchemaRef>),
    /// A type array, e.g. `"type": ["string", "null"]`
    TypeArray(Vec<SchemaRef>),
}

/// Keys that never influence the accepted language.
const SKIPPED_KEYS: &[&str] = &[
    "title",
    "description",
    "default",
    "examples",
    "$schema",
    "$id",
    "deprecated",
    "readOnly",
    "writeOnly",
    "$comment",
];

/// Canonical serialization: metadata keys removed, object keys sorted.
#[must_use]
pub fn compute_cache_key(schema: &Value) -> String {
    fn canonicalize(value: &Value, top_level: bool) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> = map
                    .iter()
                    .filter(|(k, _)| !(top_level && SKIPPED_KEYS.contains(&k.as_str())))
                    .map(|(k, v)| (k.clone(), canonicalize(v, false)))
                    .collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| canonicalize(v, false)).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(schema, true).to_string()
}

/// Parser with a per-run spec cache.
#[derive(Default)]
pub struct SchemaParser {
    cache: HashMap<String, SchemaRef>,
    /// In strict mode unspecified object properties and array items are
    /// forbidden.
    strict_mode: bool,
}

impl SchemaParser {
    /// Create a parser; `strict_mode` forbids unspecified properties.
    #[must_use]
    pub fn new(strict_mode: bool) -> Self {
        Self {
            cache: HashMap::new(),
            strict_mode,
        }
    }

    fn invalid(message: impl Into<String>) -> MoldearError {
        MoldearError::InvalidSchema(message.into())
    }

    fn unsatisfiable(message: impl Into<String>) -> MoldearError {
        MoldearError::UnsatisfiableSchema(message.into())
    }

    /// Parse one (sub)schema.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidSchema`] on shape violations and
    /// [`MoldearError::UnsatisfiableSchema`] when the language is empty.
    pub fn parse(&mut self, schema: &Value, name_hint: &str) -> Result<SchemaRef> {
        let cache_key = compute_cache_key(schema);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(Rc::clone(cached));
        }

        if let Value::Bool(accept) = schema {
            if !*accept {
                return Err(Self::unsatisfiable("schema `false` accepts no value"));
            }
            let spec = Rc::new(SchemaSpec {
                kind: SpecKind::Any,
                cache_key: cache_key.clone(),
                name_hint: name_hint.to_string(),
            });
            self.cache.insert(cache_key, Rc::clone(&spec));
            return Ok(spec);
        }

        let Value::Object(obj) = schema else {
            return Err(Self::invalid(format!(
                "schema must be an object or boolean, got {schema}"
            )));
        };

        let kind = if obj.contains_key("$ref") {
            let uri = obj
                .get("$ref")
                .and_then(Value::as_str)
                .ok_or_else(|| Self::invalid("$ref must be a string"))?;
            SpecKind::Ref(uri.to_string())
        } else if let Some(value) = obj.get("const") {
            SpecKind::Const(value.clone())
        } else if let Some(values) = obj.get("enum") {
            let Value::Array(values) = values else {
                return Err(Self::invalid("enum must be an array"));
            };
            if values.is_empty() {
                return Err(Self::unsatisfiable("empty enum accepts no value"));
            }
            SpecKind::Enum(values.clone())
        } else if obj.contains_key("anyOf") || obj.contains_key("oneOf") {
            let key = if obj.contains_key("anyOf") { "anyOf" } else { "oneOf" };
            let Some(Value::Array(options)) = obj.get(key) else {
                return Err(Self::invalid(format!("{key} must be an array")));
            };
            let mut specs = Vec::with_capacity(options.len());
            for (i, option) in options.iter().enumerate() {
                specs.push(self.parse(option, &format!("{name_hint}_case_{i}"))?);
            }
            SpecKind::AnyOf(specs)
        } else if obj.contains_key("allOf") {
            let Some(Value::Array(parts)) = obj.get("allOf") else {
                return Err(Self::invalid("allOf must be an array"));
            };
            let mut specs = Vec::with_capacity(parts.len());
            for (i, part) in parts.iter().enumerate() {
                specs.push(self.parse(part, &format!("{name_hint}_all_{i}"))?);
            }
            SpecKind::AllOf(specs)
        } else if let Some(type_value) = obj.get("type") {
            match type_value {
                Value::Array(types) => {
                    let mut specs = Vec::with_capacity(types.len());
                    for t in types {
                        let Some(t) = t.as_str() else {
                            return Err(Self::invalid("type array entries must be strings"));
                        };
                        let mut single = obj.clone();
                        single.insert("type".to_string(), Value::String(t.to_string()));
                        specs.push(self.parse(&Value::Object(single), &format!("{name_hint}_{t}"))?);
                    }
                    SpecKind::TypeArray(specs)
                }
                Value::String(t) => self.parse_typed(obj, t, name_hint)?,
                _ => return Err(Self::invalid("type must be a string or array")),
            }
        } else if obj.contains_key("properties")
            || obj.contains_key("additionalProperties")
            || obj.contains_key("unevaluatedProperties")
        {
            self.parse_object(obj, name_hint)?
        } else if obj.contains_key("items")
            || obj.contains_key("prefixItems")
            || obj.contains_key("unevaluatedItems")
        {
            self.parse_array(obj, name_hint)?
        } else {
            SpecKind::Any
        };

        let spec = Rc::new(SchemaSpec {
            kind,
            cache_key: cache_key.clone(),
            name_hint: name_hint.to_string(),
        });
        self.cache.insert(cache_key, Rc::clone(&spec));
        Ok(spec)
    }

    fn parse_typed(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        type_name: &str,
        name_hint: &str,
    ) -> Result<SpecKind> {
        match type_name {
            "integer" => Self::parse_integer(obj),
            "number" => Self::parse_number(obj),
            "string" => Self::parse_string(obj),
            "boolean" => Ok(SpecKind::Boolean),
            "null" => Ok(SpecKind::Null),
            "array" => self.parse_array(obj, name_hint),
            "object" => self.parse_object(obj, name_hint),
            other => Err(Self::invalid(format!("unsupported type `{other}`"))),
        }
    }

    fn int_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<i64>> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| Self::invalid(format!("{key} must be a number"))),
        }
    }

    fn float_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<f64>> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| Self::invalid(format!("{key} must be a number"))),
        }
    }

    fn parse_integer(obj: &serde_json::Map<String, Value>) -> Result<SpecKind> {
        // When both the inclusive and exclusive form of a bound are
        // present, the tighter one wins.
        let mut minimum = Self::int_field(obj, "minimum")?;
        if let Some(exclusive) = Self::int_field(obj, "exclusiveMinimum")? {
            let lowered = exclusive + 1;
            minimum = Some(minimum.map_or(lowered, |m| m.max(lowered)));
        }
        let mut maximum = Self::int_field(obj, "maximum")?;
        if let Some(exclusive) = Self::int_field(obj, "exclusiveMaximum")? {
            let raised = exclusive - 1;
            maximum = Some(maximum.map_or(raised, |m| m.min(raised)));
        }
        if let (Some(lo), Some(hi)) = (minimum, maximum) {
            if lo > hi {
                return Err(Self::unsatisfiable(format!(
                    "integer range [{lo}, {hi}] is empty"
                )));
            }
        }
        Ok(SpecKind::Integer { minimum, maximum })
    }

    fn parse_number(obj: &serde_json::Map<String, Value>) -> Result<SpecKind> {
        // Exclusive float bounds are honored at the range-regex precision
        // (treated as inclusive endpoints there). When both forms of a
        // bound are present, the tighter one wins.
        let minimum = match (
            Self::float_field(obj, "minimum")?,
            Self::float_field(obj, "exclusiveMinimum")?,
        ) {
            (Some(inclusive), Some(exclusive)) => Some(inclusive.max(exclusive)),
            (inclusive, exclusive) => inclusive.or(exclusive),
        };
        let maximum = match (
            Self::float_field(obj, "maximum")?,
            Self::float_field(obj, "exclusiveMaximum")?,
        ) {
            (Some(inclusive), Some(exclusive)) => Some(inclusive.min(exclusive)),
            (inclusive, exclusive) => inclusive.or(exclusive),
        };
        if let (Some(lo), Some(hi)) = (minimum, maximum) {
            if lo > hi {
                return Err(Self::unsatisfiable(format!(
                    "number range [{lo}, {hi}] is empty"
                )));
            }
        }
        Ok(SpecKind::Number { minimum, maximum })
    }

    fn parse_string(obj: &serde_json::Map<String, Value>) -> Result<SpecKind> {
        let pattern = obj
            .get("pattern")
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Self::invalid("pattern must be a string"))
            })
            .transpose()?;
        let format = obj
            .get("format")
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Self::invalid("format must be a string"))
            })
            .transpose()?;
        let min_length = Self::int_field(obj, "minLength")?.unwrap_or(0);
        let max_length = Self::int_field(obj, "maxLength")?.unwrap_or(-1);
        if max_length != -1 && min_length > max_length {
            return Err(Self::unsatisfiable(format!(
                "string length range [{min_length}, {max_length}] is empty"
            )));
        }
        Ok(SpecKind::String {
            pattern,
            format,
            min_length,
            max_length,
        })
    }

    fn parse_array(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        name_hint: &str,
    ) -> Result<SpecKind> {
        let mut prefix_items = Vec::new();
        if let Some(prefix) = obj.get("prefixItems") {
            let Value::Array(prefix) = prefix else {
                return Err(Self::invalid("prefixItems must be an array"));
            };
            for (i, item) in prefix.iter().enumerate() {
                prefix_items.push(self.parse(item, &format!("{name_hint}_item_{i}"))?);
            }
        }

        let mut allow_additional = !self.strict_mode;
        let mut additional_items = None;
        let items_key = if obj.contains_key("items") {
            Some("items")
        } else if obj.contains_key("unevaluatedItems") {
            Some("unevaluatedItems")
        } else {
            None
        };
        if let Some(key) = items_key {
            match obj.get(key) {
                Some(Value::Bool(false)) => allow_additional = false,
                Some(schema) => {
                    allow_additional = true;
                    additional_items = Some(self.parse(schema, &format!("{name_hint}_items"))?);
                }
                None => {}
            }
        }
        if allow_additional && additional_items.is_none() {
            additional_items = Some(self.any_spec());
        }

        let min_items = Self::int_field(obj, "minItems")?.unwrap_or(0);
        let max_items = Self::int_field(obj, "maxItems")?.unwrap_or(-1);
        if max_items != -1 && min_items > max_items {
            return Err(Self::unsatisfiable(format!(
                "array item count range [{min_items}, {max_items}] is empty"
            )));
        }

        Ok(SpecKind::Array(ArraySpec {
            prefix_items,
            allow_additional,
            additional_items,
            min_items,
            max_items,
        }))
    }

    fn parse_object(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        name_hint: &str,
    ) -> Result<SpecKind> {
        let mut spec = ObjectSpec {
            max_properties: -1,
            additional_suffix: "addl",
            ..ObjectSpec::default()
        };

        if let Some(properties) = obj.get("properties") {
            let Value::Object(properties) = properties else {
                return Err(Self::invalid("properties must be an object"));
            };
            for (name, value_schema) in properties {
                spec.properties.push(Property {
                    name: name.clone(),
                    schema: self.parse(value_schema, &format!("{name_hint}_prop_{name}"))?,
                });
            }
        }

        if let Some(required) = obj.get("required") {
            let Value::Array(required) = required else {
                return Err(Self::invalid("required must be an array"));
            };
            for name in required {
                let Some(name) = name.as_str() else {
                    return Err(Self::invalid("required entries must be strings"));
                };
                spec.required.insert(name.to_string());
            }
        }

        spec.allow_additional = !self.strict_mode;
        if let Some(additional) = obj.get("additionalProperties") {
            match additional {
                Value::Bool(false) => spec.allow_additional = false,
                schema => {
                    spec.allow_additional = true;
                    spec.additional_suffix = "addl";
                    spec.additional_schema =
                        Some(self.parse(schema, &format!("{name_hint}_addl"))?);
                }
            }
        } else if let Some(unevaluated) = obj.get("unevaluatedProperties") {
            match unevaluated {
                Value::Bool(false) => spec.allow_additional = false,
                schema => {
                    spec.allow_additional = true;
                    spec.additional_suffix = "uneval";
                    spec.additional_schema =
                        Some(self.parse(schema, &format!("{name_hint}_uneval"))?);
                }
            }
        }
        if spec.allow_additional && spec.additional_schema.is_none() {
            spec.additional_schema = Some(self.any_spec());
        }

        if let Some(pattern_properties) = obj.get("patternProperties") {
            let Value::Object(pattern_properties) = pattern_properties else {
                return Err(Self::invalid("patternProperties must be an object"));
            };
            for (i, (pattern, value_schema)) in pattern_properties.iter().enumerate() {
                spec.pattern_properties.push((
                    pattern.clone(),
                    self.parse(value_schema, &format!("{name_hint}_pattern_{i}"))?,
                ));
            }
        }

        if let Some(property_names) = obj.get("propertyNames") {
            spec.property_names =
                Some(self.parse(property_names, &format!("{name_hint}_name"))?);
        }

        spec.min_properties = Self::int_field(obj, "minProperties")?.unwrap_or(0);
        spec.max_properties = Self::int_field(obj, "maxProperties")?.unwrap_or(-1);
        if spec.max_properties != -1 && spec.min_properties > spec.max_properties {
            return Err(Self::unsatisfiable(format!(
                "object property count range [{}, {}] is empty",
                spec.min_properties, spec.max_properties
            )));
        }
        let required_count = i64::try_from(spec.required.len()).unwrap_or(i64::MAX);
        if spec.max_properties != -1 && required_count > spec.max_properties {
            return Err(Self::unsatisfiable(
                "more required properties than maxProperties",
            ));
        }

        Ok(SpecKind::Object(spec))
    }

    fn any_spec(&mut self) -> SchemaRef {
        let key = "{}".to_string();
        if let Some(cached) = self.cache.get(&key) {
            return Rc::clone(cached);
        }
        let spec = Rc::new(SchemaSpec {
            kind: SpecKind::Any,
            cache_key: key.clone(),
            name_hint: "any".to_string(),
        });
        self.cache.insert(key, Rc::clone(&spec));
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<SchemaRef> {
        SchemaParser::new(true).parse(&value, "root")
    }

    #[test]
    fn test_cache_key_strips_metadata_and_sorts() {
        let a = compute_cache_key(&json!({"type": "string", "title": "Name"}));
        let b = compute_cache_key(&json!({"title": "Other", "type": "string"}));
        assert_eq!(a, b);
        assert_eq!(a, r#"{"type":"string"}"#);
    }

    #[test]
    fn test_identical_subschemas_share_spec() {
        let mut parser = SchemaParser::new(true);
        let a = parser.parse(&json!({"type": "integer"}), "a").expect("valid");
        let b = parser.parse(&json!({"type": "integer"}), "b").expect("valid");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_exclusive_bounds_folded() {
        let spec = parse(json!({"type": "integer", "exclusiveMinimum": 3, "exclusiveMaximum": 8}))
            .expect("valid");
        let SpecKind::Integer { minimum, maximum } = spec.kind else {
            panic!("integer spec");
        };
        assert_eq!(minimum, Some(4));
        assert_eq!(maximum, Some(7));
    }

    #[test]
    fn test_both_bound_forms_take_the_tighter() {
        let spec = parse(json!({
            "type": "integer",
            "minimum": 5, "exclusiveMinimum": 1,
            "maximum": 10, "exclusiveMaximum": 20
        }))
        .expect("valid");
        let SpecKind::Integer { minimum, maximum } = spec.kind else {
            panic!("integer spec");
        };
        assert_eq!(minimum, Some(5));
        assert_eq!(maximum, Some(10));

        let spec = parse(json!({
            "type": "number",
            "minimum": 5.0, "exclusiveMinimum": 1.0,
            "maximum": 8.5, "exclusiveMaximum": 20.0
        }))
        .expect("valid");
        let SpecKind::Number { minimum, maximum } = spec.kind else {
            panic!("number spec");
        };
        assert_eq!(minimum, Some(5.0));
        assert_eq!(maximum, Some(8.5));
    }

    #[test]
    fn test_unsatisfiable_is_distinct() {
        let empty_enum = parse(json!({"enum": []})).unwrap_err();
        assert!(matches!(empty_enum, MoldearError::UnsatisfiableSchema(_)));

        let false_schema = parse(json!(false)).unwrap_err();
        assert!(matches!(false_schema, MoldearError::UnsatisfiableSchema(_)));

        let inverted = parse(json!({"type": "integer", "minimum": 5, "maximum": 3})).unwrap_err();
        assert!(matches!(inverted, MoldearError::UnsatisfiableSchema(_)));

        let shape_error = parse(json!({"type": 42})).unwrap_err();
        assert!(matches!(shape_error, MoldearError::InvalidSchema(_)));
    }

    #[test]
    fn test_strict_mode_controls_additional() {
        let strict = SchemaParser::new(true)
            .parse(&json!({"type": "object", "properties": {"a": {"type": "null"}}}), "root")
            .expect("valid");
        let SpecKind::Object(ref obj) = strict.kind else {
            panic!("object spec");
        };
        assert!(!obj.allow_additional);

        let lax = SchemaParser::new(false)
            .parse(&json!({"type": "object", "properties": {"a": {"type": "null"}}}), "root")
            .expect("valid");
        let SpecKind::Object(ref obj) = lax.kind else {
            panic!("object spec");
        };
        assert!(obj.allow_additional);
        assert!(obj.additional_schema.is_some());
    }

    #[test]
    fn test_type_array() {
        let spec = parse(json!({"type": ["string", "null"]})).expect("valid");
        let SpecKind::TypeArray(ref options) = spec.kind else {
            panic!("type array");
        };
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn test_untyped_object_inferred() {
        let spec = parse(json!({"properties": {"x": {"type": "boolean"}}})).expect("valid");
        assert!(matches!(spec.kind, SpecKind::Object(_)));
    }

    #[test]
    fn test_ref_preserved() {
        let spec = parse(json!({"$ref": "#/definitions/node"})).expect("valid");
        let SpecKind::Ref(ref uri) = spec.kind else {
            panic!("ref spec");
        };
        assert_eq!(uri, "#/definitions/node");
    }
}
