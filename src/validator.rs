//! Lenient output validation and repair (C7).
//!
//! Large language models do not reliably emit well-formed JSON: fenced code
//! blocks, trailing commas, unescaped backslashes in Windows paths, and
//! mid-object truncation are all routine. This module extracts the JSON
//! payload out of a raw completion and, failing a clean parse, runs a chain
//! of increasingly aggressive repair strategies before giving up.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Result of [`extract_and_parse`]: either a parsed JSON value, or the raw
/// text that could not be coerced into one.
#[derive(Debug, Clone)]
pub enum ParsedOutput {
    Json(Value),
    Malformed(String),
}

/// Strips markdown fences and leading/trailing prose, then parses. Falls
/// back through [`repair_json`] on the first parse failure.
pub fn extract_and_parse(raw: &str) -> ParsedOutput {
    let text = extract_candidate(raw.trim());
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => ParsedOutput::Json(value),
        Err(e) => {
            warn!(error = %e, "JSON validation failed, attempting repair");
            match repair_json(&text) {
                Some(value) => ParsedOutput::Json(value),
                None => ParsedOutput::Malformed(text),
            }
        }
    }
}

fn extract_candidate(text: &str) -> String {
    let mut text = text.to_string();

    if let Some(start) = text.find("```json") {
        let body_start = start + "```json".len();
        let rest = &text[body_start..];
        text = match rest.find("```") {
            Some(end) => rest[..end].trim().to_string(),
            None => rest.trim().to_string(),
        };
    } else if let Some(start) = text.find("```") {
        let body_start = start + "```".len();
        let rest = &text[body_start..];
        text = match rest.find("```") {
            Some(end) => rest[..end].trim().to_string(),
            None => rest.trim().to_string(),
        };
    }

    if !(text.starts_with('{') || text.starts_with('[')) {
        if let (Some(obj_start), Some(obj_end)) = (text.find('{'), text.rfind('}')) {
            if obj_end > obj_start {
                return text[obj_start..=obj_end].to_string();
            }
        }
        if let (Some(arr_start), Some(arr_end)) = (text.find('['), text.rfind(']')) {
            if arr_end > arr_start {
                return text[arr_start..=arr_end].to_string();
            }
        }
    }
    text
}

fn control_char_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f]").unwrap())
}

fn trailing_comma_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*\}").unwrap())
}

fn trailing_comma_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*\]").unwrap())
}

fn nuclear_backslash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\\(?:[^nrt"\\])"#).unwrap())
}

/// Five-strategy repair chain, applied in order, matching the original
/// validator's escalation from "probably salvageable" to "lossy but better
/// than nothing":
/// 1. double invalid backslash escapes (`\Users` -> `\\Users`)
/// 2. strip trailing commas before `}`/`]`
/// 3. strip raw control characters
/// 4. close unterminated strings/objects/arrays (truncated output)
/// 5. nuclear: drop any backslash not starting a valid escape
fn repair_json(text: &str) -> Option<Value> {
    let escaped = double_invalid_escapes(text);
    let mut repaired = trailing_comma_object_re().replace_all(&escaped, "}").to_string();
    repaired = trailing_comma_array_re().replace_all(&repaired, "]").to_string();
    repaired = control_char_re().replace_all(&repaired, "").to_string();

    if let Ok(value) = serde_json::from_str(&repaired) {
        return Some(value);
    }
    debug!("repair attempt 1 failed, trying truncation recovery");

    let truncated = close_truncated(&repaired);
    if let Ok(value) = serde_json::from_str(&truncated) {
        return Some(value);
    }
    debug!("repair attempt 2 (truncated) failed, trying nuclear backslash strip");

    let nuclear = nuclear_backslash_re().replace_all(&repaired, "").to_string();
    match serde_json::from_str(&nuclear) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "all JSON repair strategies failed");
            None
        }
    }
}

fn double_invalid_escapes(text: &str) -> String {
    const VALID: &[char] = &['"', '\\', '/', 'b', 'f', 'n', 'r', 't', 'u'];
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            if !VALID.contains(&next) {
                out.push('\\');
            }
            out.push('\\');
            out.push(next);
            i += 2;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn close_truncated(text: &str) -> String {
    let mut out = text.trim_end().to_string();
    if out.matches('"').count() % 2 != 0 {
        out.push('"');
    }
    let open_braces = out.matches('{').count() as i64 - out.matches('}').count() as i64;
    let open_brackets = out.matches('[').count() as i64 - out.matches(']').count() as i64;
    out.push_str(&"]".repeat(open_brackets.max(0) as usize));
    out.push_str(&"}".repeat(open_braces.max(0) as usize));
    out
}

// ─── Schema-shaped validation ──────────────────────────────────────────────

const IOC_SUBFIELDS: &[&str] = &[
    "ips",
    "domains",
    "urls",
    "email_addresses",
    "file_hashes",
    "filenames",
    "registry_keys",
    "process_names",
    "malicious_commands",
];

pub struct Validated {
    pub data: Value,
    pub is_valid: bool,
    pub warnings: Vec<String>,
}

/// Fills in missing fields of an IoC extraction response, normalizing TTPs
/// (bare strings become `{mitre_id, technique_name, description}` objects)
/// and clamping `confidence_level` to {high, medium, low}.
pub fn validate_ioc_response(mut data: Value) -> Validated {
    let mut warnings = Vec::new();
    if !data.is_object() {
        warnings.push("response was not a JSON object, discarding and using defaults".to_string());
        data = json!({});
    }
    let obj = data.as_object_mut().expect("data was just normalized to an object");

    for (field, default) in [
        ("sigma_title", json!("")),
        ("sigma_description", json!("")),
        ("indicators_of_compromise", json!({})),
        ("ttps", json!([])),
        ("tools_or_malware", json!([])),
        ("threat_actors", json!([])),
        ("confidence_level", json!("")),
    ] {
        if !obj.contains_key(field) {
            warnings.push(format!("missing field '{field}', added default"));
            obj.insert(field.to_string(), default);
        }
    }

    {
        let ioc = obj
            .entry("indicators_of_compromise")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .expect("indicators_of_compromise must be an object");
        for subfield in IOC_SUBFIELDS {
            if !ioc.contains_key(*subfield) {
                ioc.insert(subfield.to_string(), json!([]));
                warnings.push(format!("missing IoC field '{subfield}', added empty list"));
            }
        }
    }

    let raw_ttps = obj.get("ttps").cloned().unwrap_or_else(|| json!([]));
    let mut valid_ttps = Vec::new();
    if let Some(arr) = raw_ttps.as_array() {
        for ttp in arr {
            if let Some(ttp_obj) = ttp.as_object() {
                if ttp_obj.contains_key("mitre_id") {
                    valid_ttps.push(ttp.clone());
                    continue;
                }
            }
            if let Some(s) = ttp.as_str() {
                valid_ttps.push(json!({
                    "mitre_id": if s.starts_with('T') { s } else { "" },
                    "technique_name": s,
                    "description": "",
                }));
            }
        }
    }
    obj.insert("ttps".to_string(), json!(valid_ttps));

    let confidence_ok = matches!(
        obj.get("confidence_level").and_then(Value::as_str),
        Some("high") | Some("medium") | Some("low")
    );
    if !confidence_ok {
        obj.insert("confidence_level".to_string(), json!("medium"));
        warnings.push("invalid confidence_level, defaulted to 'medium'".to_string());
    }

    let is_valid = warnings.is_empty();
    Validated { data, is_valid, warnings }
}

const SIEM_PLATFORMS: &[&str] = &["splunk", "qradar", "elastic", "sentinel"];
const SIEM_SUBFIELDS: &[&str] = &["description", "query", "notes"];

pub fn validate_siem_response(mut data: Value) -> Validated {
    let mut warnings = Vec::new();
    if !data.is_object() {
        warnings.push("response was not a JSON object, discarding and using defaults".to_string());
        data = json!({});
    }
    let obj = data.as_object_mut().expect("data was just normalized to an object");

    for platform in SIEM_PLATFORMS {
        if !obj.contains_key(*platform) {
            obj.insert(
                platform.to_string(),
                json!({
                    "description": format!("{platform} query (missing from response)"),
                    "query": "ERROR: Query not generated",
                    "notes": "AI response did not include this platform",
                }),
            );
            warnings.push(format!("missing platform '{platform}', added placeholder"));
        } else {
            let platform_obj = obj
                .get_mut(*platform)
                .and_then(Value::as_object_mut)
                .expect("platform entry must be an object");
            for subfield in SIEM_SUBFIELDS {
                if !platform_obj.contains_key(*subfield) {
                    platform_obj.insert(subfield.to_string(), json!(""));
                    warnings.push(format!("missing '{platform}.{subfield}'"));
                }
            }
        }
    }

    let is_valid = warnings.is_empty();
    Validated { data, is_valid, warnings }
}

const COMPONENT_SCORE_KEYS: &[&str] =
    &["detection_quality", "false_positive_risk", "coverage", "maintainability"];

pub fn validate_rule_response(mut data: Value) -> Validated {
    let mut warnings = Vec::new();
    if !data.is_object() {
        warnings.push("response was not a JSON object, discarding and using defaults".to_string());
        data = json!({});
    }
    let obj = data.as_object_mut().expect("data was just normalized to an object");

    for (field, default) in [
        ("rule", json!({})),
        ("explanation", json!("")),
        ("test_cases", json!([])),
        ("mitre_techniques", json!([])),
        ("recommendations", json!([])),
        ("confidence_score", json!(0.0)),
        ("component_scores", json!({})),
    ] {
        if !obj.contains_key(field) {
            warnings.push(format!("missing field '{field}', added default"));
            obj.insert(field.to_string(), default);
        }
    }

    if let Some(score) = obj.get("confidence_score").and_then(Value::as_f64) {
        let normalized = if score > 1.0 { score / 100.0 } else { score };
        obj.insert("confidence_score".to_string(), json!(normalized.clamp(0.0, 1.0)));
    } else {
        obj.insert("confidence_score".to_string(), json!(0.5));
        warnings.push("invalid confidence_score type, defaulted to 0.5".to_string());
    }

    if let Some(scores) = obj.get_mut("component_scores").and_then(Value::as_object_mut) {
        for key in COMPONENT_SCORE_KEYS {
            match scores.get(*key).and_then(Value::as_f64) {
                Some(val) => {
                    let normalized = if val > 1.0 { val / 100.0 } else { val };
                    scores.insert(key.to_string(), json!(normalized.clamp(0.0, 1.0)));
                }
                None => {
                    scores.insert(key.to_string(), json!(0.5));
                    warnings.push(format!("missing component_score '{key}'"));
                }
            }
        }
    }

    let is_valid = warnings.is_empty();
    Validated { data, is_valid, warnings }
}

fn sigma_level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"level:\s*(\w+)").unwrap())
}

/// Structural (not semantic) check of Sigma YAML text -- the catalog matcher
/// and generators produce real `serde_yaml::Value`s; this is for validating
/// AI-refined text before it's parsed.
pub fn validate_sigma_yaml(yaml_text: &str) -> (bool, Vec<String>) {
    let mut warnings = Vec::new();
    for field in ["title", "logsource", "detection", "level"] {
        if !yaml_text.contains(&format!("{field}:")) {
            warnings.push(format!("missing required Sigma field: {field}"));
        }
    }
    if let Some(caps) = sigma_level_re().captures(yaml_text) {
        let level = caps[1].to_lowercase();
        if !["informational", "low", "medium", "high", "critical"].contains(&level.as_str()) {
            warnings.push(format!("invalid level '{level}'"));
        }
    }
    (warnings.is_empty(), warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_markdown_fence() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        match extract_and_parse(raw) {
            ParsedOutput::Json(v) => assert_eq!(v["a"], 1),
            ParsedOutput::Malformed(_) => panic!("expected valid JSON"),
        }
    }

    #[test]
    fn repairs_trailing_comma() {
        let raw = r#"{"a": 1, "b": 2,}"#;
        match extract_and_parse(raw) {
            ParsedOutput::Json(v) => assert_eq!(v["b"], 2),
            ParsedOutput::Malformed(_) => panic!("expected repaired JSON"),
        }
    }

    #[test]
    fn repairs_unescaped_windows_path() {
        let raw = r#"{"path": "C:\Users\analyst\AppData"}"#;
        match extract_and_parse(raw) {
            ParsedOutput::Json(v) => assert!(v["path"].as_str().unwrap().contains("Users")),
            ParsedOutput::Malformed(_) => panic!("expected repaired JSON"),
        }
    }

    #[test]
    fn recovers_truncated_object() {
        let raw = r#"{"a": 1, "b": [1, 2, "c": {"d": "e"#;
        match extract_and_parse(raw) {
            ParsedOutput::Json(_) => {}
            ParsedOutput::Malformed(_) => panic!("expected best-effort recovery"),
        }
    }

    #[test]
    fn ioc_validation_fills_missing_categories() {
        let input = json!({
            "sigma_title": "t", "sigma_description": "d",
            "indicators_of_compromise": {"ips": ["1.2.3.4"]},
            "ttps": ["T1059"], "tools_or_malware": [], "threat_actors": [],
            "confidence_level": "bogus",
        });
        let validated = validate_ioc_response(input);
        assert!(!validated.is_valid);
        assert_eq!(validated.data["confidence_level"], "medium");
        assert_eq!(
            validated.data["indicators_of_compromise"]["domains"],
            json!([])
        );
        assert_eq!(validated.data["ttps"][0]["mitre_id"], "T1059");
    }

    #[test]
    fn siem_validation_adds_placeholder_platforms() {
        let input = json!({"splunk": {"description": "d", "query": "q", "notes": "n"}});
        let validated = validate_siem_response(input);
        assert!(!validated.is_valid);
        assert_eq!(validated.data["qradar"]["query"], "ERROR: Query not generated");
    }

    #[test]
    fn rule_validation_normalizes_percentage_scores() {
        let input = json!({
            "rule": {}, "explanation": "", "test_cases": [], "mitre_techniques": [],
            "recommendations": [], "confidence_score": 85, "component_scores": {},
        });
        let validated = validate_rule_response(input);
        assert_eq!(validated.data["confidence_score"], 0.85);
        assert_eq!(validated.data["component_scores"]["coverage"], 0.5);
    }

    #[test]
    fn ioc_validation_survives_a_bare_json_array() {
        let validated = validate_ioc_response(json!(["not", "an", "object"]));
        assert!(!validated.is_valid);
        assert_eq!(validated.data["confidence_level"], "medium");
        assert_eq!(validated.data["indicators_of_compromise"]["ips"], json!([]));
    }

    #[test]
    fn siem_validation_survives_a_bare_json_array() {
        let validated = validate_siem_response(json!(["not", "an", "object"]));
        assert!(!validated.is_valid);
        assert_eq!(validated.data["splunk"]["query"], "ERROR: Query not generated");
    }

    #[test]
    fn sigma_yaml_flags_missing_fields() {
        let (ok, warnings) = validate_sigma_yaml("title: foo\nlevel: critical\n");
        assert!(!ok);
        assert!(warnings.iter().any(|w| w.contains("logsource")));
    }
}
