//! String `format` → regex lookup table
//!
//! Canonical patterns for the JSON-schema string formats the engine
//! understands. Unknown formats are ignored by the converter.

use std::collections::HashMap;

use once_cell::sync::Lazy;

static FORMAT_PATTERNS: Lazy<HashMap<&'static str, String>> = Lazy::new(|| {
    let mut m = HashMap::new();

    let atext = r"[\w!#$%&'*+/=?^`{|}~-]";
    let dot_string = format!(r"({atext}+(\.{atext}+)*)");
    let quoted_string = r#"\\"(\\[\x20-\x7E]|[\x20\x21\x23-\x5B\x5D-\x7E])*\\""#;
    let domain =
        r"([A-Za-z0-9]([\-A-Za-z0-9]*[A-Za-z0-9])?)((\.[A-Za-z0-9][\-A-Za-z0-9]*[A-Za-z0-9])*)";
    m.insert("email", format!(r"^({dot_string}|{quoted_string})@{domain}$"));

    m.insert(
        "date",
        r"^(\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01]))$".to_string(),
    );
    m.insert(
        "time",
        r"^([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)$"
            .to_string(),
    );
    m.insert(
        "date-time",
        r"^(\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01]))T([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)$"
            .to_string(),
    );
    m.insert(
        "duration",
        r"^P((\d+D|\d+M(\d+D)?|\d+Y(\d+M(\d+D)?)?)(T(\d+S|\d+M(\d+S)?|\d+H(\d+M(\d+S)?)?))?|T(\d+S|\d+M(\d+S)?|\d+H(\d+M(\d+S)?)?)|\d+W)$"
            .to_string(),
    );

    let decbyte = r"(25[0-5]|2[0-4]\d|[0-1]?\d?\d)";
    m.insert("ipv4", format!(r"^({decbyte}\.){{3}}{decbyte}$"));

    m.insert(
        "ipv6",
        concat!(
            "(",
            "([0-9a-fA-F]{1,4}:){7,7}[0-9a-fA-F]{1,4}|",
            "([0-9a-fA-F]{1,4}:){1,7}:|",
            "([0-9a-fA-F]{1,4}:){1,6}:[0-9a-fA-F]{1,4}|",
            "([0-9a-fA-F]{1,4}:){1,5}(:[0-9a-fA-F]{1,4}){1,2}|",
            "([0-9a-fA-F]{1,4}:){1,4}(:[0-9a-fA-F]{1,4}){1,3}|",
            "([0-9a-fA-F]{1,4}:){1,3}(:[0-9a-fA-F]{1,4}){1,4}|",
            "([0-9a-fA-F]{1,4}:){1,2}(:[0-9a-fA-F]{1,4}){1,5}|",
            "[0-9a-fA-F]{1,4}:((:[0-9a-fA-F]{1,4}){1,6})|",
            ":((:[0-9a-fA-F]{1,4}){1,7}|:)|",
            "::(ffff(:0{1,4}){0,1}:){0,1}",
            "((25[0-5]|(2[0-4]|1{0,1}[0-9]){0,1}[0-9])\\.){3,3}",
            "(25[0-5]|(2[0-4]|1{0,1}[0-9]){0,1}[0-9])|",
            "([0-9a-fA-F]{1,4}:){1,4}:",
            "((25[0-5]|(2[0-4]|1{0,1}[0-9]){0,1}[0-9])\\.){3,3}",
            "(25[0-5]|(2[0-4]|1{0,1}[0-9]){0,1}[0-9])",
            ")"
        )
        .to_string(),
    );

    m.insert(
        "hostname",
        r"^([a-z0-9]([a-z0-9-]*[a-z0-9])?)(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$".to_string(),
    );
    m.insert(
        "uuid",
        r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$"
            .to_string(),
    );

    let scheme = r"[a-zA-Z][a-zA-Z+\.-]*";
    let pchar = r"([\w\.~!$&'()*+,;=:@-]|%[0-9A-Fa-f][0-9A-Fa-f])";
    let query_fragment_char = r"([\w\.~!$&'()*+,;=:@/?-]|%[0-9A-Fa-f][0-9A-Fa-f])*";
    let query = format!(r"(\?{query_fragment_char})?");
    let fragment = format!("(#{query_fragment_char})?");
    let path_abempty = format!("(/{pchar}*)*");
    let path_absolute_rootless_empty = format!("/?({pchar}+(/{pchar}*)*)?");
    let userinfo = r"([\w\.~!$&'()*+,;=:-]|%[0-9A-Fa-f][0-9A-Fa-f])*";
    let host = r"([\w\.~!$&'()*+,;=-]|%[0-9A-Fa-f][0-9A-Fa-f])*";
    let authority = format!(r"({userinfo}@)?{host}(:\d*)?");
    let hier_part = format!("(//{authority}{path_abempty}|{path_absolute_rootless_empty})");
    m.insert("uri", format!("^{scheme}:{hier_part}{query}{fragment}$"));

    let path_absolute = format!("/({pchar}+(/{pchar}*)*)?");
    let segment_nz_nc = r"([\w\.~!$&'()*+,;=@-]|%[0-9A-Fa-f][0-9A-Fa-f])+";
    let path_noscheme = format!("{segment_nz_nc}(/{pchar}*)*");
    let relative_part =
        format!("(//{authority}{path_abempty}|{path_absolute}|{path_noscheme})?");
    m.insert("uri-reference", format!("^{relative_part}{query}{fragment}$"));

    let literals = r"([\x21\x23-\x24\x26\x28-\x3B\x3D\x3F-\x5B\x5D\x5F\x61-\x7A\x7E]|%[0-9A-Fa-f][0-9A-Fa-f])";
    let op = r"[+#\./;\?&=,!@|]";
    let varchar = r"(\w|%[0-9A-Fa-f][0-9A-Fa-f])";
    let varname = format!(r"{varchar}(\.?{varchar})*");
    let varspec = format!(r"{varname}(:[1-9]\d?\d?\d?|\*)?");
    let variable_list = format!("{varspec}(,{varspec})*");
    let expression = format!(r"\{{({op})?{variable_list}\}}");
    m.insert("uri-template", format!("^({literals}|{expression})*$"));

    m.insert(
        "json-pointer",
        r"^(/([\x00-\x2E]|[\x30-\x7D]|[\x7F-\U0010FFFF]|~[01])*)*$".to_string(),
    );
    m.insert(
        "relative-json-pointer",
        r"^(0|[1-9][0-9]*)(#|(/([\x00-\x2E]|[\x30-\x7D]|[\x7F-\U0010FFFF]|~[01])*)*)$"
            .to_string(),
    );

    m
});

/// The canonical regex for a named string format, if known.
#[must_use]
pub fn format_to_regex(format: &str) -> Option<&'static str> {
    FORMAT_PATTERNS.get(format).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regex::RegexFsmBuilder;

    #[test]
    fn test_known_formats_present() {
        for format in [
            "date",
            "time",
            "date-time",
            "duration",
            "ipv4",
            "ipv6",
            "hostname",
            "uuid",
            "uri",
            "uri-reference",
            "uri-template",
            "email",
            "json-pointer",
            "relative-json-pointer",
        ] {
            assert!(format_to_regex(format).is_some(), "{format} missing");
        }
        assert!(format_to_regex("unknown-format").is_none());
    }

    #[test]
    fn test_all_format_patterns_compile() {
        for format in [
            "date",
            "time",
            "date-time",
            "duration",
            "ipv4",
            "ipv6",
            "hostname",
            "uuid",
            "uri",
            "uri-reference",
            "uri-template",
            "email",
            "json-pointer",
            "relative-json-pointer",
        ] {
            let pattern = format_to_regex(format).expect("known");
            assert!(
                RegexFsmBuilder::build(pattern).is_ok(),
                "format {format} pattern does not compile"
            );
        }
    }

    #[test]
    fn test_date_semantics() {
        let fsm = RegexFsmBuilder::build(format_to_regex("date").expect("known"))
            .expect("compiles");
        assert!(fsm.accepts(b"2026-08-02"));
        assert!(!fsm.accepts(b"2026-13-02"));
        assert!(!fsm.accepts(b"2026-08-2"));
    }

    #[test]
    fn test_ipv4_semantics() {
        let fsm = RegexFsmBuilder::build(format_to_regex("ipv4").expect("known"))
            .expect("compiles");
        assert!(fsm.accepts(b"192.168.0.1"));
        assert!(fsm.accepts(b"255.255.255.255"));
        assert!(!fsm.accepts(b"256.1.1.1"));
        assert!(!fsm.accepts(b"1.2.3"));
    }

    #[test]
    fn test_uuid_semantics() {
        let fsm = RegexFsmBuilder::build(format_to_regex("uuid").expect("known"))
            .expect("compiles");
        assert!(fsm.accepts(b"123e4567-e89b-12d3-a456-426614174000"));
        assert!(!fsm.accepts(b"123e4567e89b12d3a456426614174000"));
    }
}
