//! Report signal extraction: turns an [`IoCBundle`] + externally supplied
//! MITRE techniques + raw report text into the [`ReportSignals`] the scorer
//! consumes (spec.md 4.10, "Report signal extraction").

use crate::models::{IoCBundle, MitreTechnique};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            "of", "c:", "and", "the", "a", "an", "to", "in", "for", "by", "on", "with", "or",
            "if", "is", "at", "as", "all", "windows", "microsoft",
        ]
        .into_iter()
        .collect()
    })
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9\-\.:;]+").unwrap())
}

pub fn tokenize(text: &str) -> Vec<String> {
    token_re()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.len() > 1 && !stopwords().contains(t.as_str()))
        .collect()
}

const LOGSOURCE_MAP: &[(&str, &[&str])] = &[
    ("ips", &["network_connection", "firewall"]),
    ("domains", &["dns_query", "dns"]),
    ("urls", &["proxy", "network_connection", "webserver"]),
    ("malicious_commands", &["process_creation", "ps_script", "ps_module", "ps_classic"]),
    ("process_names", &["process_creation", "image_load"]),
    ("filenames", &["file_event", "file_change", "file_access", "file_delete", "file_rename"]),
    ("registry_keys", &["registry_set", "registry_add", "registry_event", "registry_delete"]),
    ("file_hashes", &["file_event", "process_creation", "driver_load"]),
];

#[derive(Debug, Clone, Default)]
pub struct ReportSignals {
    pub techniques: HashSet<String>,
    pub ioc_values: HashSet<String>,
    pub logsource_categories: HashSet<String>,
    pub keywords: HashSet<String>,
}

fn add_with_parent(techniques: &mut HashSet<String>, id: &str) {
    let id = id.to_uppercase();
    if id.is_empty() {
        return;
    }
    techniques.insert(id.clone());
    if let Some((parent, _sub)) = id.split_once('.') {
        techniques.insert(parent.to_string());
    }
}

/// Builds the signal set the scorer matches catalog rules against. The raw
/// text is expected lowercased by the caller (the orchestrator already
/// lowercases report text before this stage per spec.md 4.10).
pub fn build_report_signals(
    bundle: &IoCBundle,
    mitre_techniques: &[MitreTechnique],
    report_text_lower: &str,
) -> ReportSignals {
    let mut techniques = HashSet::new();
    for ttp in &bundle.ttps {
        add_with_parent(&mut techniques, &ttp.mitre_id);
    }
    for t in mitre_techniques {
        add_with_parent(&mut techniques, &t.technique_id);
    }

    let mut ioc_values = HashSet::new();
    for values in bundle.indicators_of_compromise.values() {
        for v in values {
            ioc_values.insert(v.to_lowercase());
        }
    }
    for actor in &bundle.threat_actors {
        ioc_values.insert(actor.to_lowercase());
    }
    for tool in &bundle.tools_or_malware {
        ioc_values.insert(tool.to_lowercase());
    }

    let mut logsource_categories = HashSet::new();
    for (category, values) in &bundle.indicators_of_compromise {
        if values.is_empty() {
            continue;
        }
        if let Some((_, cats)) = LOGSOURCE_MAP.iter().find(|(k, _)| *k == category) {
            logsource_categories.extend(cats.iter().map(|c| c.to_string()));
        }
    }

    let keywords = tokenize(report_text_lower).into_iter().collect();

    ReportSignals {
        techniques,
        ioc_values,
        logsource_categories,
        keywords,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn sub_technique_also_registers_parent() {
        let mut bundle = IoCBundle::default();
        bundle.ttps.push(crate::models::Ttp {
            mitre_id: "t1059.001".to_string(),
            technique_name: "PowerShell".to_string(),
            description: String::new(),
        });
        let signals = build_report_signals(&bundle, &[], "");
        assert!(signals.techniques.contains("T1059.001"));
        assert!(signals.techniques.contains("T1059"));
    }

    #[test]
    fn populated_category_implies_logsource_categories() {
        let mut bundle = IoCBundle::default();
        bundle
            .indicators_of_compromise
            .insert("ips".to_string(), vec!["203.0.113.5".to_string()]);
        let signals = build_report_signals(&bundle, &[], "");
        assert!(signals.logsource_categories.contains("network_connection"));
        assert!(signals.logsource_categories.contains("firewall"));
    }

    #[test]
    fn tokenize_drops_stopwords_and_short_tokens() {
        let tokens = tokenize("the quick fox uses c: to run mimikatz");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"to".to_string()));
        assert!(tokens.contains(&"mimikatz".to_string()));
    }

    #[test]
    fn empty_bundle_has_no_logsource_categories() {
        let bundle = IoCBundle::default();
        let _map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let signals = build_report_signals(&bundle, &[], "");
        assert!(signals.logsource_categories.is_empty());
    }
}
