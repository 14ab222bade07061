//! Deterministic Sigma rule generation (C10) from an [`IoCBundle`].
//!
//! One rule per populated IoC category, each with a fixed logsource/field
//! mapping drawn from the original generator's lookup tables, plus a
//! keyword-driven tactic detector layered on top of the category's default
//! tactic. Falls back to a single placeholder rule when no IoCs survived
//! extraction, so the pipeline always has at least one Sigma document.

use crate::models::{GeneratedSigmaRule, IocSigmaRuleOutput, LogSource, SigmaLevel};
use regex::Regex;
use serde_yaml::Value as Yaml;
use std::sync::OnceLock;

struct CategoryMapping {
    ioc_type: &'static str,
    category: &'static str,
    product: &'static str,
    field: &'static str,
    default_tactics: &'static [&'static str],
    use_contains: bool,
}

const CATEGORY_MAPPINGS: &[CategoryMapping] = &[
    CategoryMapping { ioc_type: "malicious_commands", category: "process_creation", product: "windows", field: "CommandLine", default_tactics: &["execution"], use_contains: true },
    CategoryMapping { ioc_type: "process_names", category: "process_creation", product: "windows", field: "Image", default_tactics: &["execution"], use_contains: true },
    CategoryMapping { ioc_type: "filenames", category: "file_event", product: "windows", field: "TargetFilename", default_tactics: &["persistence"], use_contains: true },
    CategoryMapping { ioc_type: "registry_keys", category: "registry_set", product: "windows", field: "TargetObject", default_tactics: &["persistence"], use_contains: false },
    CategoryMapping { ioc_type: "ips", category: "firewall", product: "windows", field: "DestinationIp", default_tactics: &["command_and_control"], use_contains: false },
    CategoryMapping { ioc_type: "domains", category: "dns_query", product: "windows", field: "QueryName", default_tactics: &["command_and_control"], use_contains: false },
    CategoryMapping { ioc_type: "urls", category: "firewall", product: "windows", field: "RequestUrl", default_tactics: &["command_and_control"], use_contains: true },
    CategoryMapping { ioc_type: "file_hashes", category: "file_event", product: "windows", field: "Hashes", default_tactics: &["execution"], use_contains: false },
];

const TACTIC_KEYWORDS: &[(&str, &[&str])] = &[
    ("execution", &["cmd", "powershell", "wscript", "cscript", "mshta", "rundll32", "regsvr32"]),
    ("persistence", &["registry", "scheduled", "startup", "service", "run\\"]),
    ("defense_evasion", &["bypass", "hidden", "encoded", "base64", "-enc", "-w hidden"]),
    ("credential_access", &["mimikatz", "lsass", "sam", "credential", "password", "ntds"]),
    ("discovery", &["whoami", "ipconfig", "netstat", "systeminfo", "tasklist", "net user"]),
    ("lateral_movement", &["psexec", "wmic", "winrm", "rdp", "smb"]),
    ("command_and_control", &["beacon", "callback", "c2", "tunnel"]),
    ("exfiltration", &["upload", "exfil", "compress", "archive"]),
];

fn fields_for_category(category: &str) -> Vec<&'static str> {
    match category {
        "process_creation" => vec!["CommandLine", "ParentCommandLine", "ParentImage", "User", "IntegrityLevel"],
        "firewall" => vec!["DestinationIp", "DestinationPort", "SourceIp", "SourcePort"],
        "dns_query" => vec!["QueryName", "QueryType", "QueryResults"],
        "file_event" => vec!["TargetFilename", "Image", "CreationUtcTime"],
        "registry_set" => vec!["TargetObject", "Details", "Image"],
        "image_load" => vec!["ImageLoaded", "Image", "Signed", "SignatureStatus"],
        _ => vec![],
    }
}

fn sanitize_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s\-.]").unwrap())
}

fn sanitize_title(title: &str) -> String {
    let cleaned = sanitize_title_re().replace_all(title, "").to_string();
    cleaned.chars().take(80).collect::<String>().trim().to_string()
}

fn detect_tactics(ioc_type: &str, indicators: &[String]) -> Vec<String> {
    let mut tactics = std::collections::BTreeSet::new();
    if let Some(mapping) = CATEGORY_MAPPINGS.iter().find(|m| m.ioc_type == ioc_type) {
        for t in mapping.default_tactics {
            tactics.insert(t.to_string());
        }
    }
    let all_text = indicators.iter().map(|i| i.to_lowercase()).collect::<Vec<_>>().join(" ");
    for (tactic, keywords) in TACTIC_KEYWORDS {
        if keywords.iter().any(|kw| all_text.contains(kw)) {
            tactics.insert(tactic.to_string());
        }
    }
    tactics.iter().map(|t| format!("attack.{t}")).collect()
}

fn determine_level(ioc_type: &str, count: usize) -> SigmaLevel {
    match ioc_type {
        "malicious_commands" | "file_hashes" => {
            if count <= 5 {
                SigmaLevel::High
            } else {
                SigmaLevel::Critical
            }
        }
        "process_names" | "registry_keys" | "ips" => SigmaLevel::Medium,
        _ => SigmaLevel::Low,
    }
}

fn build_detection(field: &str, indicators: &[String], use_contains: bool) -> serde_yaml::Mapping {
    let mut selection = serde_yaml::Mapping::new();
    let key = if use_contains {
        format!("{field}|contains")
    } else {
        field.to_string()
    };
    let value = if indicators.len() == 1 {
        Yaml::String(indicators[0].clone())
    } else {
        Yaml::Sequence(indicators.iter().map(|i| Yaml::String(i.clone())).collect())
    };
    selection.insert(Yaml::String(key), value);

    let mut detection = serde_yaml::Mapping::new();
    detection.insert(Yaml::String("selection".into()), Yaml::Mapping(selection));
    detection.insert(Yaml::String("condition".into()), Yaml::String("selection".into()));
    detection
}

/// Generates one rule per populated IoC category (capped at 50 indicators
/// each to keep rules from growing unbounded), or a single placeholder rule
/// when the bundle carries no indicators at all.
pub fn generate_sigma_rules(
    ioc_map: &std::collections::BTreeMap<String, Vec<String>>,
    article_url: &str,
    title_override: Option<&str>,
    description_override: Option<&str>,
    date: &str,
) -> Vec<IocSigmaRuleOutput> {
    let mut rules = Vec::new();

    for mapping in CATEGORY_MAPPINGS {
        let Some(indicators) = ioc_map.get(mapping.ioc_type) else {
            continue;
        };
        if indicators.is_empty() {
            continue;
        }
        let indicators: Vec<String> = indicators.iter().take(50).cloned().collect();

        let tactics = detect_tactics(mapping.ioc_type, &indicators);
        let level = determine_level(mapping.ioc_type, indicators.len());
        let detection = build_detection(mapping.field, &indicators, mapping.use_contains);

        let readable_type = mapping.ioc_type.replace('_', " ");
        let title = sanitize_title(title_override.unwrap_or(&format!(
            "PERSEPTOR - Suspicious {} Detection",
            title_case(&readable_type)
        )));
        let description = description_override
            .map(str::to_string)
            .unwrap_or_else(|| format!("Detects suspicious {readable_type} indicators identified by PERSEPTOR AI analysis."));

        let rule = GeneratedSigmaRule {
            title: title.clone(),
            id: uuid::Uuid::new_v4().to_string(),
            status: "experimental".to_string(),
            description,
            references: if article_url.is_empty() { vec![] } else { vec![article_url.to_string()] },
            author: "PERSEPTOR - Aytek AYTEMUR".to_string(),
            date: date.to_string(),
            tags: tactics.clone(),
            logsource: LogSource {
                category: mapping.category.to_string(),
                product: mapping.product.to_string(),
                service: None,
            },
            detection,
            fields: fields_for_category(mapping.category).into_iter().map(String::from).collect(),
            falsepositives: vec![
                "Legitimate administrative activity".to_string(),
                "Security tools using similar patterns".to_string(),
            ],
            level,
        };

        let rule_yaml = rule_to_yaml(&rule);
        rules.push(IocSigmaRuleOutput {
            title,
            rule_yaml,
            category: mapping.category.to_string(),
            level: rule.level.as_str().to_string(),
            tags: tactics,
            ioc_type: mapping.ioc_type.to_string(),
            ioc_count: indicators.len(),
        });
    }

    if rules.is_empty() {
        rules.push(placeholder_rule(article_url, title_override, description_override, date));
    }

    rules
}

fn placeholder_rule(
    article_url: &str,
    title_override: Option<&str>,
    description_override: Option<&str>,
    date: &str,
) -> IocSigmaRuleOutput {
    let title = title_override
        .map(str::to_string)
        .unwrap_or_else(|| "PERSEPTOR - No IoC Detected".to_string());
    let description = description_override
        .map(str::to_string)
        .unwrap_or_else(|| "No malicious indicators detected in AI analysis".to_string());

    let mut selection = serde_yaml::Mapping::new();
    selection.insert(Yaml::String("CommandLine|contains".into()), Yaml::String("placeholder".into()));
    let mut detection = serde_yaml::Mapping::new();
    detection.insert(Yaml::String("selection".into()), Yaml::Mapping(selection));
    detection.insert(Yaml::String("condition".into()), Yaml::String("selection".into()));

    let rule = GeneratedSigmaRule {
        title: title.clone(),
        id: uuid::Uuid::new_v4().to_string(),
        status: "experimental".to_string(),
        description,
        references: if article_url.is_empty() { vec![] } else { vec![article_url.to_string()] },
        author: "PERSEPTOR - Aytek AYTEMUR".to_string(),
        date: date.to_string(),
        tags: vec!["attack.execution".to_string()],
        logsource: LogSource {
            category: "process_creation".to_string(),
            product: "windows".to_string(),
            service: None,
        },
        detection,
        fields: vec!["CommandLine".to_string(), "ParentCommandLine".to_string()],
        falsepositives: vec!["N/A".to_string()],
        level: SigmaLevel::Low,
    };

    let rule_yaml = rule_to_yaml(&rule);
    IocSigmaRuleOutput {
        title,
        rule_yaml,
        category: "process".to_string(),
        level: "low".to_string(),
        tags: vec!["attack.execution".to_string()],
        ioc_type: "none".to_string(),
        ioc_count: 0,
    }
}

fn rule_to_yaml(rule: &GeneratedSigmaRule) -> String {
    let mut doc = serde_yaml::Mapping::new();
    doc.insert(Yaml::String("title".into()), Yaml::String(rule.title.clone()));
    doc.insert(Yaml::String("id".into()), Yaml::String(rule.id.clone()));
    doc.insert(Yaml::String("status".into()), Yaml::String(rule.status.clone()));
    doc.insert(Yaml::String("description".into()), Yaml::String(rule.description.clone()));
    doc.insert(
        Yaml::String("references".into()),
        Yaml::Sequence(rule.references.iter().map(|r| Yaml::String(r.clone())).collect()),
    );
    doc.insert(Yaml::String("author".into()), Yaml::String(rule.author.clone()));
    doc.insert(Yaml::String("date".into()), Yaml::String(rule.date.clone()));
    doc.insert(
        Yaml::String("tags".into()),
        Yaml::Sequence(rule.tags.iter().map(|t| Yaml::String(t.clone())).collect()),
    );
    let mut logsource = serde_yaml::Mapping::new();
    logsource.insert(Yaml::String("category".into()), Yaml::String(rule.logsource.category.clone()));
    logsource.insert(Yaml::String("product".into()), Yaml::String(rule.logsource.product.clone()));
    if let Some(service) = &rule.logsource.service {
        logsource.insert(Yaml::String("service".into()), Yaml::String(service.clone()));
    }
    doc.insert(Yaml::String("logsource".into()), Yaml::Mapping(logsource));
    doc.insert(Yaml::String("detection".into()), Yaml::Mapping(rule.detection.clone()));
    doc.insert(
        Yaml::String("fields".into()),
        Yaml::Sequence(rule.fields.iter().map(|f| Yaml::String(f.clone())).collect()),
    );
    doc.insert(
        Yaml::String("falsepositives".into()),
        Yaml::Sequence(rule.falsepositives.iter().map(|f| Yaml::String(f.clone())).collect()),
    );
    doc.insert(Yaml::String("level".into()), Yaml::String(rule.level.as_str().to_string()));

    serde_yaml::to_string(&Yaml::Mapping(doc)).unwrap_or_default()
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Joins multiple rules' YAML into a `---`-delimited multi-document string.
pub fn rules_to_combined_yaml(rules: &[IocSigmaRuleOutput]) -> String {
    rules.iter().map(|r| r.rule_yaml.as_str()).collect::<Vec<_>>().join("\n---\n")
}

const BOILERPLATE_PHRASES: &[&str] = &[
    "these rules can be further tuned",
    "below are two sigma rules",
    "below are the sigma rules",
    "this rule detects",
    "this query searches",
];

fn em_dash_separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-—]{3,}$").unwrap())
}

fn is_boilerplate_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if em_dash_separator_re().is_match(trimmed) {
        return true;
    }
    let lower = trimmed.to_lowercase();
    BOILERPLATE_PHRASES.iter().any(|p| lower.contains(p))
}

/// Splits raw AI-generated Sigma text into discrete rule documents, the way
/// the original handled it: a trimmed line starting with `title:` opens a new
/// document, and narration/marketing lines are dropped rather than treated as
/// YAML. AI output is frequently not valid YAML until repaired, so this is a
/// line-oriented split rather than a `serde_yaml` multi-document parse.
pub fn split_ai_sigma_rules(raw: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if is_boilerplate_line(line) {
            continue;
        }
        if line.trim_start().starts_with("title:") {
            if !current.is_empty() {
                documents.push(current.join("\n").trim().to_string());
                current.clear();
            }
        }
        if !current.is_empty() || line.trim_start().starts_with("title:") {
            current.push(line);
        }
    }
    if !current.is_empty() {
        documents.push(current.join("\n").trim().to_string());
    }
    documents.retain(|d| !d.is_empty());
    documents
}

/// Cleans raw AI-Sigma output into a `---`-joined multi-document string
/// suitable for appending alongside the deterministically generated rules.
/// Returns an empty string when no `title:`-delimited document was found.
pub fn clean_ai_sigma_output(raw: &str) -> String {
    split_ai_sigma_rules(raw).join("\n---\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn generates_one_rule_per_populated_category() {
        let mut map = BTreeMap::new();
        map.insert("malicious_commands".to_string(), vec!["powershell -enc abc".to_string()]);
        map.insert("ips".to_string(), vec!["203.0.113.5".to_string()]);
        let rules = generate_sigma_rules(&map, "https://example.com/report", None, None, "2026/07/28");
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.ioc_type == "malicious_commands"));
        assert!(rules.iter().any(|r| r.ioc_type == "ips"));
    }

    #[test]
    fn falls_back_to_placeholder_when_empty() {
        let map = BTreeMap::new();
        let rules = generate_sigma_rules(&map, "", None, None, "2026/07/28");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].ioc_type, "none");
    }

    #[test]
    fn command_with_powershell_keyword_adds_execution_and_defense_evasion_tags() {
        let mut map = BTreeMap::new();
        map.insert(
            "malicious_commands".to_string(),
            vec!["powershell -enc JABzAD0A".to_string()],
        );
        let rules = generate_sigma_rules(&map, "", None, None, "2026/07/28");
        let rule = &rules[0];
        assert!(rule.tags.contains(&"attack.execution".to_string()));
        assert!(rule.tags.contains(&"attack.defense_evasion".to_string()));
    }

    #[test]
    fn high_volume_hashes_escalate_to_critical() {
        let mut map = BTreeMap::new();
        let hashes: Vec<String> = (0..6).map(|i| format!("hash{i}")).collect();
        map.insert("file_hashes".to_string(), hashes);
        let rules = generate_sigma_rules(&map, "", None, None, "2026/07/28");
        assert_eq!(rules[0].level, "critical");
    }

    #[test]
    fn splits_two_documents_on_title_boundary_and_drops_narration() {
        let raw = "Below are two Sigma rules for this campaign:\n\ntitle: First Rule\nlogsource:\n  category: process_creation\ndetection:\n  selection:\n    Image|contains: evil.exe\n  condition: selection\n\nThis rule detects suspicious activity.\n\ntitle: Second Rule\nlogsource:\n  category: dns_query\ndetection:\n  selection:\n    QueryName|contains: evil.com\n  condition: selection\n";
        let docs = split_ai_sigma_rules(raw);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].starts_with("title: First Rule"));
        assert!(docs[1].starts_with("title: Second Rule"));
        assert!(!docs[0].contains("This rule detects"));
    }

    #[test]
    fn clean_ai_sigma_output_returns_empty_string_when_no_title_line() {
        assert_eq!(clean_ai_sigma_output("just some narration, no rules here"), "");
    }
}
