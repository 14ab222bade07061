//! Deterministic YARA rule generation (C9) from an [`IoCBundle`].
//!
//! No original `yara_generator.py` source survived retrieval (only its
//! orchestrator call site and an empty `yara_module.py` stub did), so this
//! module is reconstructed by analogy to [`crate::sigma_gen`]: one rule per
//! populated IoC category with a registered string modifier, plus a
//! dedicated rule for malicious commands, per spec.md 4.7.

use crate::models::YaraRuleOutput;
use std::collections::BTreeMap;

struct CategoryModifier {
    ioc_type: &'static str,
    label: &'static str,
    modifier: &'static str,
}

const CATEGORY_MODIFIERS: &[CategoryModifier] = &[
    CategoryModifier { ioc_type: "file_hashes", label: "File_Hashes", modifier: "ascii" },
    CategoryModifier { ioc_type: "filenames", label: "Filenames", modifier: "ascii nocase fullword" },
    CategoryModifier { ioc_type: "process_names", label: "Process_Names", modifier: "ascii nocase fullword" },
    CategoryModifier { ioc_type: "registry_keys", label: "Registry_Keys", modifier: "ascii nocase" },
    CategoryModifier { ioc_type: "domains", label: "Domains", modifier: "ascii nocase" },
    CategoryModifier { ioc_type: "urls", label: "URLs", modifier: "ascii nocase" },
    CategoryModifier { ioc_type: "ips", label: "IPs", modifier: "ascii" },
];

/// Escapes a value for use inside a YARA double-quoted string literal.
fn yara_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn string_defs(indicators: &[String], var_prefix: &str, modifier: &str) -> Vec<String> {
    indicators
        .iter()
        .take(50)
        .enumerate()
        .map(|(i, ioc)| format!("        ${var_prefix}_{i} = \"{}\" {modifier}", yara_escape(ioc)))
        .collect()
}

fn category_rule(modifier: &CategoryModifier, indicators: &[String], date: &str) -> YaraRuleOutput {
    let indicators: Vec<String> = indicators.iter().take(50).cloned().collect();
    let rule_name = format!("Suspicious_{}_Match", modifier.label);
    let strings = string_defs(&indicators, &modifier.ioc_type.to_lowercase(), modifier.modifier);

    let rule_text = format!(
        "rule {rule_name}\n{{\n    meta:\n        description = \"Detects suspicious {} identified by PERSEPTOR AI analysis\"\n        author = \"PERSEPTOR - Aytek AYTEMUR\"\n        date = \"{date}\"\n        category = \"{}\"\n\n    strings:\n{}\n\n    condition:\n        any of them\n}}",
        modifier.ioc_type.replace('_', " "),
        modifier.ioc_type,
        strings.join("\n"),
    );

    let mut metadata = BTreeMap::new();
    metadata.insert("category".to_string(), modifier.ioc_type.to_string());
    metadata.insert("indicator_count".to_string(), indicators.len().to_string());

    YaraRuleOutput {
        name: rule_name,
        description: format!("Detects suspicious {} identified by PERSEPTOR AI analysis", modifier.ioc_type.replace('_', " ")),
        rule: rule_text,
        severity: if modifier.ioc_type == "file_hashes" { "high".to_string() } else { "medium".to_string() },
        tags: vec![format!("ioc:{}", modifier.ioc_type)],
        metadata,
    }
}

fn malicious_commands_rule(indicators: &[String], date: &str) -> YaraRuleOutput {
    let indicators: Vec<String> = indicators.iter().take(50).cloned().collect();
    let strings = string_defs(&indicators, "cmd", "ascii wide nocase");

    let rule_text = format!(
        "rule Suspicious_Malicious_Commands_Match\n{{\n    meta:\n        description = \"Detects malicious command-line patterns identified by PERSEPTOR AI analysis\"\n        author = \"PERSEPTOR - Aytek AYTEMUR\"\n        date = \"{date}\"\n        category = \"malicious_commands\"\n\n    strings:\n{}\n\n    condition:\n        any of them\n}}",
        strings.join("\n"),
    );

    let mut metadata = BTreeMap::new();
    metadata.insert("category".to_string(), "malicious_commands".to_string());
    metadata.insert("indicator_count".to_string(), indicators.len().to_string());

    YaraRuleOutput {
        name: "Suspicious_Malicious_Commands_Match".to_string(),
        description: "Detects malicious command-line patterns identified by PERSEPTOR AI analysis".to_string(),
        rule: rule_text,
        severity: "high".to_string(),
        tags: vec!["ioc:malicious_commands".to_string()],
        metadata,
    }
}

/// Generates one rule per populated IoC category with a registered string
/// modifier, plus a dedicated rule for malicious commands when present.
/// Returns an empty vec when the bundle carries no such indicators at all.
pub fn generate_yara_rules(ioc_map: &BTreeMap<String, Vec<String>>, date: &str) -> Vec<YaraRuleOutput> {
    let mut rules = Vec::new();

    for modifier in CATEGORY_MODIFIERS {
        let Some(indicators) = ioc_map.get(modifier.ioc_type) else {
            continue;
        };
        if indicators.is_empty() {
            continue;
        }
        rules.push(category_rule(modifier, indicators, date));
    }

    if let Some(commands) = ioc_map.get("malicious_commands") {
        if !commands.is_empty() {
            rules.push(malicious_commands_rule(commands, date));
        }
    }

    rules
}

/// Joins multiple rules' YARA text into one plain-text multi-rule document.
pub fn rules_to_combined_text(rules: &[YaraRuleOutput]) -> String {
    rules.iter().map(|r| r.rule.as_str()).collect::<Vec<_>>().join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_one_rule_per_populated_category_plus_commands() {
        let mut map = BTreeMap::new();
        map.insert("file_hashes".to_string(), vec!["deadbeef".to_string()]);
        map.insert("malicious_commands".to_string(), vec!["whoami /all".to_string()]);
        let rules = generate_yara_rules(&map, "2026/07/28");
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.name == "Suspicious_File_Hashes_Match"));
        assert!(rules.iter().any(|r| r.name == "Suspicious_Malicious_Commands_Match"));
    }

    #[test]
    fn empty_bundle_yields_no_rules() {
        let map = BTreeMap::new();
        let rules = generate_yara_rules(&map, "2026/07/28");
        assert!(rules.is_empty());
    }

    #[test]
    fn escapes_quotes_and_backslashes_in_string_values() {
        let mut map = BTreeMap::new();
        map.insert("filenames".to_string(), vec!["C:\\temp\\\"evil\".exe".to_string()]);
        let rules = generate_yara_rules(&map, "2026/07/28");
        let rule = &rules[0];
        assert!(rule.rule.contains("C:\\\\temp\\\\\\\"evil\\\".exe"));
    }

    #[test]
    fn condition_is_any_of_them() {
        let mut map = BTreeMap::new();
        map.insert("ips".to_string(), vec!["203.0.113.5".to_string()]);
        let rules = generate_yara_rules(&map, "2026/07/28");
        assert!(rules[0].rule.contains("any of them"));
    }
}
